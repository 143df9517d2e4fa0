//! Sends an event every second, cycling through a few ids
//!
//! Run together with the `listener` example.

use easel::prelude::*;
use std::time::Duration;

const MAX_EVENT_ID: usize = 15;

fn main() -> easel::Result<()> {
    env_logger::init();

    println!("Easel Notifier Example");
    println!("======================");

    let node = NodeBuilder::new().name("notifier").create()?;
    let service = node
        .service_builder(&ServiceName::new("MyEventName")?)
        .event()
        .event_id_max_value(MAX_EVENT_ID)
        .open_or_create()?;
    let notifier = service.notifier_builder().create()?;

    let mut counter = 0usize;
    while node.wait(Duration::from_secs(1)).is_ok() {
        counter += 1;
        let id = EventId::new(counter % (service.event_id_max_value() + 1));
        let reached = notifier.notify_with_custom_event_id(id)?;
        println!("Triggered event {} ({} listeners)", id, reached);
    }

    println!("Shutting down");
    Ok(())
}
