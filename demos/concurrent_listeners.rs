// A control thread mutates a watchpoint while two consumer threads, each with
// its own listener and mask, collect the events they subscribed to

use std::thread;
use std::time::Duration;
use watch_events::{EventTypeMask, Session, WatchKind, WatchpointError};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("watch_events=info")
        .init();

    let session = Session::default();
    let target = session.create_target("a.out");

    let toggles = session.create_listener("toggles");
    target
        .broadcaster()
        .subscribe(&toggles, EventTypeMask::ENABLED | EventTypeMask::DISABLED)?;

    let settings = session.create_listener("settings");
    target.broadcaster().subscribe(
        &settings,
        EventTypeMask::IGNORE_CHANGED | EventTypeMask::CONDITION_CHANGED,
    )?;

    let id = target.watchpoints().add(0x1000, 8, WatchKind::WRITE)?;

    let rounds = 50u32;
    let (toggle_count, setting_count) = thread::scope(|scope| {
        let consumers = [toggles.clone(), settings.clone()].map(|listener| {
            scope.spawn(move || {
                let mut count = 0;
                while listener.wait_for_event(Duration::from_millis(250)).is_some() {
                    count += 1;
                }
                count
            })
        });

        let watchpoints = target.watchpoints();
        let produced = (1..=rounds).try_for_each(|round| -> Result<(), WatchpointError> {
            watchpoints.set_enabled(id, round % 2 == 0)?;
            watchpoints.set_ignore_count(id, round)?;
            watchpoints.set_condition(id, Some(&format!("i == {}", round)))?;
            Ok(())
        });

        let [toggles, settings] = consumers.map(|c| c.join().unwrap_or(0));
        produced.map(|()| (toggles, settings))
    })?;

    println!("toggles listener received {} event(s)", toggle_count);
    println!("settings listener received {} event(s)", setting_count);
    println!(
        "dropped: toggles={}, settings={}",
        toggles.dropped_events(),
        settings.dropped_events()
    );
    Ok(())
}
