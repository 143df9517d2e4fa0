//! Receives the samples of the `publisher` example

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

    println!("Easel Subscriber Example");
    println!("========================");

    let node = NodeBuilder::new().name("subscriber").create()?;
    let service = node
        .service_builder(&ServiceName::new("My/Funk/ServiceName")?)
        .publish_subscribe::<TransmissionData>()
        .open_or_create()?;
    let subscriber = service.subscriber_builder().create()?;

    println!("Subscriber {} ready on {}", subscriber.id(), service.name());

    while node.wait(Duration::from_millis(100)).is_ok() {
        while let Some(sample) = subscriber.receive()? {
            println!(
                "Received {:?} (publisher {}, sequence {})",
                sample.payload(),
                sample.publisher_id(),
                sample.sequence_number()
            );
        }
    }

    if subscriber.missed_samples() > 0 {
        println!("Missed {} samples", subscriber.missed_samples());
    }
    println!("Shutting down");
    Ok(())
}
