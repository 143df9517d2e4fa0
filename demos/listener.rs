//! Prints every event sent by the `notifier` example

use easel::prelude::*;
use std::time::Duration;

fn main() -> easel::Result<()> {
    env_logger::init();

    println!("Easel Listener Example");
    println!("======================");

    let node = NodeBuilder::new().name("listener").create()?;
    let service = node
        .service_builder(&ServiceName::new("MyEventName")?)
        .event()
        .event_id_max_value(15)
        .open_or_create()?;
    let listener = service.listener_builder().create()?;

    while node.wait(Duration::ZERO).is_ok() {
        listener.timed_wait_all(
            |id| println!("Event {} received", id),
            Duration::from_secs(1),
        )?;
    }

    println!("Shutting down");
    Ok(())
}
