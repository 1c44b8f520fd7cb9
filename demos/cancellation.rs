//! Example: Cancelling Long-Running Procedures
//!
//! This example cancels a runaway loop from another thread, then shows a
//! statement timeout and a handler that recovers from cancellation.

use plua::host::MemoryHost;
use plua::{Error, Options, Session};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let host = Arc::new(MemoryHost::new());
    let runaway = host.define(
        "public",
        "runaway",
        r#"
        function main()
          local n = 0
          while true do n = n + 1 end
        end
        "#,
    );
    let guarded = host.define(
        "public",
        "guarded",
        r#"
        function main()
          local n = 0
          return pl.catch("57", function()
            return pl.xact(function()
              while true do n = n + 1 end
            end)
          end, function(e)
            pl.WARNING("stopped after " .. n .. " iterations: " .. e.message)
            return n
          end)
        end
        "#,
    );

    println!("=== Cancellation Example ===\n");

    // Example 1: cancel from another thread
    println!("Example 1: Cancel from another thread");
    println!("-------------------------------------");
    let session = Session::open(host.clone(), Options::default())?;
    let handle = session.cancel_handle();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        handle.cancel();
    });
    let start = Instant::now();
    report(session.call(runaway, &[]));
    println!("  returned after {:?}", start.elapsed());
    let _ = canceller.join();

    // Example 2: statement timeout
    println!("\nExample 2: Statement timeout");
    println!("----------------------------");
    let options = Options::default().statement_timeout(Duration::from_millis(200));
    let timed = Session::open(host.clone(), options)?;
    let start = Instant::now();
    report(timed.call(runaway, &[]));
    println!("  returned after {:?}", start.elapsed());

    // Example 3: a handler that recovers
    println!("\nExample 3: Recovering from cancellation");
    println!("---------------------------------------");
    host.set_message_hook(|r| println!("  [{}] {}", r.severity, r.message));
    let result = timed.call(guarded, &[])?;
    println!("  procedure returned {}", result);
    println!(
        "  subtransactions: {} released, {} rolled back",
        host.releases(),
        host.rollbacks()
    );

    Ok(())
}

fn report(result: plua::Result<plua::Datum>) {
    match result {
        Ok(value) => println!("  unexpected result: {}", value),
        Err(Error::Reported(report)) => println!("  canceled: {}", report),
        Err(e) => println!("  error: {}", e),
    }
}
