// Walk a watchpoint through add, disable, ignore count and condition changes,
// printing the single event each change produces

use std::time::Duration;
use watch_events::{EventTypeMask, Session, WatchKind};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("watch_events=debug")
        .init();

    let session = Session::default();
    let target = session.create_target("a.out");
    let listener = session.create_listener("demo_listener");

    let mask = EventTypeMask::ADDED
        | EventTypeMask::DISABLED
        | EventTypeMask::IGNORE_CHANGED
        | EventTypeMask::CONDITION_CHANGED;
    target.broadcaster().subscribe(&listener, mask)?;
    println!("Listening to {} for {}\n", target.name(), mask);

    let watchpoints = target.watchpoints();
    let id = watchpoints.add(0x7ffe_e000, 4, WatchKind::READ_WRITE)?;
    report(&listener, &target);

    watchpoints.set_enabled(id, false)?;
    report(&listener, &target);

    watchpoints.set_ignore_count(id, 10)?;
    report(&listener, &target);

    watchpoints.set_condition(id, Some("1 == 2"))?;
    report(&listener, &target);

    // Not subscribed: no event expected
    watchpoints.set_enabled(id, true)?;
    match listener.wait_for_event(Duration::from_millis(100)) {
        Some(event) => println!("Unexpected: {}", event),
        None => println!("Re-enable produced no event for this listener (not subscribed)"),
    }

    if let Some(wp) = watchpoints.get(id) {
        println!("\nFinal state: {}", wp);
    }
    Ok(())
}

fn report(listener: &watch_events::Listener, target: &watch_events::Target) {
    match listener.wait_for_event(Duration::from_secs(1)) {
        Some(event) => println!("Got {}", event),
        None => println!("No event within timeout"),
    }

    let pending = listener
        .peek_at_next_event_for_broadcaster_with_type(target.broadcaster(), EventTypeMask::ALL);
    if let Some(extra) = pending {
        println!("  Extra event pending: {}", extra);
    }
}
