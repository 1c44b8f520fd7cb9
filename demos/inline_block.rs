//! Example: Anonymous Blocks and Stored Procedures
//!
//! This example runs an anonymous block, calls a stored procedure that uses
//! nested transaction blocks and shows how script errors reach the host.

use plua::host::MemoryHost;
use plua::{Error, Options, Session};
use serde_json::json;
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let host = Arc::new(MemoryHost::new());
    host.set_message_hook(|report| println!("  [{}] {}", report.severity, report.message));

    let session = Session::open(host.clone(), Options::default())?;

    println!("=== Anonymous Blocks and Procedures Example ===\n");

    // Example 1: anonymous block
    println!("Example 1: Anonymous block");
    println!("--------------------------");
    session.execute_inline(
        r#"
        local total = 0
        for i = 1, 10 do total = total + i end
        pl.NOTICE("sum of 1..10 is " .. total)
        print("print output is redirected too")
        "#,
    )?;

    // Example 2: stored procedure with nested blocks
    println!("\nExample 2: Transfer with nested blocks");
    println!("--------------------------------------");
    let transfer = host.define(
        "public",
        "transfer",
        r#"
        balances = { alice = 1000, bob = 500 }

        function main(from, to, amount)
          return pl.xact(function()
            if balances[from] < amount then
              pl.ERROR("insufficient balance", {
                code = "22003",
                detail = from .. " has " .. balances[from],
              })
            end
            balances[from] = balances[from] - amount
            balances[to] = balances[to] + amount
            pl.INFO("moved " .. amount .. " from " .. from .. " to " .. to)
            return balances
          end)
        end
        "#,
    );

    let result = session.call(transfer, &[json!("alice"), json!("bob"), json!(200)])?;
    println!("  result: {}", result);

    // Example 3: failure reaches the host with its code
    println!("\nExample 3: Failed transfer");
    println!("--------------------------");
    match session.call(transfer, &[json!("bob"), json!("alice"), json!(5000)]) {
        Ok(result) => println!("  unexpected success: {}", result),
        Err(Error::Reported(report)) => {
            println!("  failed as expected: {}", report);
            if let Some(detail) = &report.fields.detail {
                println!("  detail: {}", detail);
            }
        }
        Err(e) => return Err(e.into()),
    }
    println!(
        "  subtransactions: {} released, {} rolled back",
        host.releases(),
        host.rollbacks()
    );

    let stats = session.cache_stats();
    println!("\nCache: {} lookups, hit rate {:.2}", stats.lookups, stats.hit_rate());

    session.shutdown();
    Ok(())
}
