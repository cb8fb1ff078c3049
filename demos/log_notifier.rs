//! Log notifier example with simulated sources
//!
//! Run with: cargo run --example log_notifier [EXPIRY]
//!
//! Examples:
//!   cargo run --example log_notifier               # alice never expires
//!   cargo run --example log_notifier 18:30         # alice expires today at 18:30
//!   cargo run --example log_notifier 2026-12-31    # alice expires at the end of that day
//!
//! Two in-process sources publish a reading every second. `alice` watches
//! both with the given expiry, `bob` watches `ca://SR:DCCT` for ten seconds
//! only, and `carol` joins `ca://SR:DCCT` after five seconds to show that a
//! late joiner receives the last reading immediately.
//!
//! Set RUST_LOG=notifier_rs=trace to see every registry decision.

use std::time::Duration;

use notifier_rs::dispatch::LogDispatcher;
use notifier_rs::provider::MemorySources;
use notifier_rs::{ExpiryInput, Notifier, SourceLocator, UpdateData};
use serde_json::json;

fn print_usage() {
    eprintln!("Usage: log_notifier [EXPIRY]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  EXPIRY    Expiry for alice: HH:MM, YYYY-MM-DD, or RFC 3339 (default: never)");
}

/// Publish a reading on each source every second
async fn simulate(sources: MemorySources, locators: Vec<SourceLocator>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut tick: u64 = 0;

    loop {
        ticker.tick().await;
        tick += 1;

        for (i, locator) in locators.iter().enumerate() {
            let reading = json!({
                "pvname": locator.as_str(),
                "value": 500.0 - (tick as f64) * 0.25 * (i as f64 + 1.0),
                "units": "mA",
            });

            match UpdateData::try_from(reading) {
                Ok(update) => {
                    let delivered = sources.publish(locator, update).await;
                    tracing::debug!(locator = %locator, delivered, "Published reading");
                }
                Err(e) => tracing::error!(error = %e, "Bad reading"),
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let alice_expiry = args.get(1).map(|s| ExpiryInput::from(s.as_str()));

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("notifier_rs=info".parse()?)
                .add_directive("log_notifier=info".parse()?),
        )
        .init();

    let current = SourceLocator::new("ca://SR:DCCT");
    let lifetime = SourceLocator::new("ca://SR:LIFETIME");

    let sources = MemorySources::new();
    sources.add_source(&current);
    sources.add_source(&lifetime);

    let notifier = Notifier::new(sources.clone(), LogDispatcher::new());

    let bob_expiry = chrono::Utc::now() + chrono::Duration::seconds(10);
    notifier.register(&current, "alice", alice_expiry.clone()).await;
    notifier.register(&lifetime, "alice", alice_expiry).await;
    notifier.register(&current, "bob", Some(bob_expiry.into())).await;

    // Not a known source: logged and ignored
    notifier.register("ca://SR:UNKNOWN", "alice", None).await;

    let simulation = tokio::spawn(simulate(sources.clone(), vec![current.clone(), lifetime.clone()]));

    println!("Sources: {}, {}", current, lifetime);
    println!("Press Ctrl+C to stop");

    let late_join = async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        notifier.register(&current, "carol", None).await;
        for (locator, destinations) in notifier.registered().await {
            println!("{}: {} destination(s)", locator, destinations.len());
        }
        std::future::pending::<()>().await
    };

    tokio::select! {
        _ = late_join => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
        }
    }

    simulation.abort();
    notifier.shutdown().await;

    Ok(())
}
