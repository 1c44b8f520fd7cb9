//! # plua - Lua Stored Procedures for Transactional Hosts
//!
//! plua embeds a Lua interpreter in a transactional host such as a database
//! server and lets stored procedures written in Lua run inside the host's
//! transactions.
//!
//! ## Architecture
//!
//! The bridge consists of several key components:
//!
//! - **Code Cache**: Compiles each procedure once per session and keeps it
//! - **Execution Unit**: A compiled procedure with its private namespace
//! - **Transaction Scopes**: Nested host subtransactions, resolved strictly LIFO
//! - **Cancellation Monitor**: An atomic flag polled at interpreter safepoints
//! - **Exception Bridge**: Lossless translation between host reports and
//!   script exceptions
//! - **Session**: Bootstrap, shared built-ins and the top-level call boundary
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use plua::{host::MemoryHost, Options, Session};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), plua::Error> {
//! let host = Arc::new(MemoryHost::new());
//! let id = host.define(
//!     "public",
//!     "transfer",
//!     r#"
//!     function main(amount)
//!       return pl.xact(function()
//!         if amount <= 0 then
//!           pl.ERROR("amount must be positive", { code = "22023" })
//!         end
//!         return amount
//!       end)
//!     end
//!     "#,
//! );
//!
//! let session = Session::open(host, Options::default())?;
//! assert_eq!(session.call(id, &[json!(10)])?, json!(10));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Module declarations
mod builtins;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod error;
pub mod exception;
pub mod host;
pub mod scope;
pub mod session;
pub mod trigger;
pub mod unit;

// Re-exports
pub use cancel::{CancelHandle, Interrupt};
pub use config::Options;
pub use error::{Error, Result, Severity, SqlState};
pub use exception::{BridgedException, HostErrorReport};
pub use host::{Host, ProcedureId};
pub use session::Session;
pub use trigger::{TriggerEvent, TriggerOperation, TriggerOutcome, TriggerTiming};

/// A value passed to or returned from a procedure.
pub type Datum = serde_json::Value;
