//! The interface the embedding host provides to the bridge.
//!
//! The bridge never talks to a database directly. Subtransactions, message
//! delivery, interrupt polling and procedure lookup all go through [`Host`].
//! [`MemoryHost`] is a complete in-process implementation used by tests,
//! benches and demos.

mod memory;

pub use memory::{HostEvent, MemoryHost};

use crate::exception::HostErrorReport;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result of a host call. Failures are already in host form.
pub type HostResult<T> = std::result::Result<T, HostErrorReport>;

/// Host-assigned identifier of a stored procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcedureId(pub u32);

impl fmt::Display for ProcedureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Host-assigned identifier of an open subtransaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubxactId(pub u64);

/// Source text and naming of a stored procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureSource {
    /// Procedure id.
    pub id: ProcedureId,
    /// Schema the procedure lives in.
    pub schema: String,
    /// Procedure name.
    pub name: String,
    /// Lua source text.
    pub source: String,
}

impl ProcedureSource {
    /// `schema.name`, used as the chunk name in tracebacks.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// Services the host offers the bridge.
///
/// Calls arrive from the session's thread only, except `is_interrupted`,
/// which may be polled from any safepoint.
pub trait Host: Send + Sync {
    /// Opens a nested subtransaction inside the current one.
    fn begin_subtransaction(&self) -> HostResult<SubxactId>;

    /// Commits the innermost subtransaction into its parent.
    fn release_subtransaction(&self, id: SubxactId) -> HostResult<()>;

    /// Rolls back the innermost subtransaction.
    fn rollback_subtransaction(&self, id: SubxactId) -> HostResult<()>;

    /// Delivers a message below ERROR severity.
    ///
    /// Reports of ERROR and above never come through here. They unwind the
    /// call and are handed to the host as the `Error::Reported` value the
    /// session call returns, after every open scope has been rolled back.
    fn report(&self, report: &HostErrorReport);

    /// Returns true once for every pending host-side interrupt.
    fn is_interrupted(&self) -> bool {
        false
    }

    /// Fetches a procedure's current source.
    fn lookup_procedure_source(&self, id: ProcedureId) -> HostResult<ProcedureSource>;

    /// Lists the procedures of a schema, in id order.
    fn list_procedures(&self, schema: &str) -> HostResult<Vec<ProcedureId>>;
}
