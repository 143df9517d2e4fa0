//! Publishes a `TransmissionData` sample every second
//!
//! Run together with the `subscriber` example:
//! `cargo run --example publisher` and `cargo run --example subscriber`.

use easel::prelude::*;
use std::time::Duration;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct TransmissionData {
    pub x: i32,
    pub y: i32,
    pub funky: f64,
}

unsafe impl ZeroCopySend for TransmissionData {
    fn type_name() -> &'static str {
        "TransmissionData"
    }
}

fn main() -> easel::Result<()> {
    env_logger::init();

    println!("Easel Publisher Example");
    println!("=======================");

    let node = NodeBuilder::new().name("publisher").create()?;
    let service = node
        .service_builder(&ServiceName::new("My/Funk/ServiceName")?)
        .publish_subscribe::<TransmissionData>()
        .open_or_create()?;
    let publisher = service.publisher_builder().create()?;

    println!("Publisher {} ready on {}", publisher.id(), service.name());

    let mut counter = 0;
    while node.wait(Duration::from_secs(1)).is_ok() {
        counter += 1;
        let sample = publisher.loan_uninit()?.write_payload(TransmissionData {
            x: counter,
            y: counter * 3,
            funky: counter as f64 * 812.12,
        });

        match sample.send()? {
            Delivery::Delivered(n) => println!("Sent sample {} to {} subscribers", counter, n),
            Delivery::NoSubscribers => println!("Sent sample {} (nobody listening)", counter),
        }
    }

    println!("Shutting down");
    Ok(())
}
