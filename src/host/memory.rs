//! An in-process host that keeps procedures in a map and records every call.

use super::{Host, HostResult, ProcedureId, ProcedureSource, SubxactId};
use crate::error::{codes, Severity};
use crate::exception::HostErrorReport;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// First id handed out by [`MemoryHost::define`].
const FIRST_PROCEDURE_ID: u32 = 16384;

/// Something the bridge asked the host to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// A subtransaction was opened.
    Begin(SubxactId),
    /// A subtransaction was committed.
    Release(SubxactId),
    /// A subtransaction was rolled back.
    Rollback(SubxactId),
    /// A message was delivered.
    Report(HostErrorReport),
    /// A procedure's source was fetched.
    Lookup(ProcedureId),
}

type MessageHook = Box<dyn Fn(&HostErrorReport) + Send + Sync>;

/// A [`Host`] backed by memory.
///
/// Enforces strict nesting of subtransactions itself, so a bridge that
/// resolves scopes out of order gets an error back instead of corrupting
/// state.
///
/// # Example
///
/// ```rust
/// use plua::host::{Host, MemoryHost};
///
/// let host = MemoryHost::new();
/// let id = host.define("public", "answer", "function main() return 42 end");
/// assert_eq!(host.lookup_procedure_source(id).unwrap().name, "answer");
/// ```
pub struct MemoryHost {
    catalog: RwLock<BTreeMap<ProcedureId, ProcedureSource>>,
    next_procedure: AtomicU32,
    next_subxact: AtomicU64,
    open: Mutex<Vec<SubxactId>>,
    events: Mutex<Vec<HostEvent>>,
    interrupted: AtomicBool,
    message_hook: RwLock<Option<MessageHook>>,
    fail_next_begin: Mutex<Option<HostErrorReport>>,
}

impl MemoryHost {
    /// Creates an empty host.
    pub fn new() -> Self {
        Self {
            catalog: RwLock::new(BTreeMap::new()),
            next_procedure: AtomicU32::new(FIRST_PROCEDURE_ID),
            next_subxact: AtomicU64::new(1),
            open: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            interrupted: AtomicBool::new(false),
            message_hook: RwLock::new(None),
            fail_next_begin: Mutex::new(None),
        }
    }

    /// Registers a procedure and returns its id.
    pub fn define(&self, schema: &str, name: &str, source: &str) -> ProcedureId {
        let id = ProcedureId(self.next_procedure.fetch_add(1, Ordering::SeqCst));
        self.catalog.write().insert(
            id,
            ProcedureSource {
                id,
                schema: schema.to_string(),
                name: name.to_string(),
                source: source.to_string(),
            },
        );
        id
    }

    /// Replaces a procedure's source. Returns false if it does not exist.
    pub fn replace_source(&self, id: ProcedureId, source: &str) -> bool {
        match self.catalog.write().get_mut(&id) {
            Some(proc) => {
                proc.source = source.to_string();
                true
            }
            None => false,
        }
    }

    /// Removes a procedure.
    pub fn drop_procedure(&self, id: ProcedureId) -> bool {
        self.catalog.write().remove(&id).is_some()
    }

    /// Installs a callback run for every delivered message.
    pub fn set_message_hook<F>(&self, hook: F)
    where
        F: Fn(&HostErrorReport) + Send + Sync + 'static,
    {
        *self.message_hook.write() = Some(Box::new(hook));
    }

    /// Raises or clears the host-side interrupt flag.
    pub fn set_interrupted(&self, value: bool) {
        self.interrupted.store(value, Ordering::SeqCst);
    }

    /// Makes the next `begin_subtransaction` fail with `report`.
    pub fn fail_next_begin(&self, report: HostErrorReport) {
        *self.fail_next_begin.lock() = Some(report);
    }

    /// All recorded events, oldest first.
    pub fn events(&self) -> Vec<HostEvent> {
        self.events.lock().clone()
    }

    /// Forgets recorded events.
    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    /// Delivered messages, oldest first.
    pub fn reports(&self) -> Vec<HostErrorReport> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                HostEvent::Report(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of subtransactions opened.
    pub fn begins(&self) -> usize {
        self.count(|e| matches!(e, HostEvent::Begin(_)))
    }

    /// Number of subtransactions committed.
    pub fn releases(&self) -> usize {
        self.count(|e| matches!(e, HostEvent::Release(_)))
    }

    /// Number of subtransactions rolled back.
    pub fn rollbacks(&self) -> usize {
        self.count(|e| matches!(e, HostEvent::Rollback(_)))
    }

    /// Number of source lookups for `id`.
    pub fn lookups(&self, id: ProcedureId) -> usize {
        self.count(|e| *e == HostEvent::Lookup(id))
    }

    /// Subtransactions currently open, outermost first.
    pub fn open_subtransactions(&self) -> Vec<SubxactId> {
        self.open.lock().clone()
    }

    fn count(&self, pred: impl Fn(&HostEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    fn record(&self, event: HostEvent) {
        self.events.lock().push(event);
    }

    fn pop_innermost(&self, id: SubxactId, action: &str) -> HostResult<()> {
        let mut open = self.open.lock();
        match open.last() {
            Some(top) if *top == id => {
                open.pop();
                Ok(())
            }
            _ => Err(HostErrorReport::new(
                Severity::Error,
                codes::SAVEPOINT_EXCEPTION,
                format!("cannot {} subtransaction {}: it is not the innermost one", action, id.0),
            )),
        }
    }
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for MemoryHost {
    fn begin_subtransaction(&self) -> HostResult<SubxactId> {
        if let Some(report) = self.fail_next_begin.lock().take() {
            return Err(report);
        }
        let id = SubxactId(self.next_subxact.fetch_add(1, Ordering::SeqCst));
        self.open.lock().push(id);
        self.record(HostEvent::Begin(id));
        Ok(id)
    }

    fn release_subtransaction(&self, id: SubxactId) -> HostResult<()> {
        self.pop_innermost(id, "release")?;
        self.record(HostEvent::Release(id));
        Ok(())
    }

    fn rollback_subtransaction(&self, id: SubxactId) -> HostResult<()> {
        self.pop_innermost(id, "roll back")?;
        self.record(HostEvent::Rollback(id));
        Ok(())
    }

    fn report(&self, report: &HostErrorReport) {
        self.record(HostEvent::Report(report.clone()));
        if let Some(hook) = self.message_hook.read().as_ref() {
            hook(report);
        }
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }

    fn lookup_procedure_source(&self, id: ProcedureId) -> HostResult<ProcedureSource> {
        self.record(HostEvent::Lookup(id));
        self.catalog.read().get(&id).cloned().ok_or_else(|| {
            HostErrorReport::new(
                Severity::Error,
                codes::INTERNAL_ERROR,
                format!("cache lookup failed for procedure {}", id),
            )
        })
    }

    fn list_procedures(&self, schema: &str) -> HostResult<Vec<ProcedureId>> {
        Ok(self
            .catalog
            .read()
            .values()
            .filter(|p| p.schema == schema)
            .map(|p| p.id)
            .collect())
    }
}
