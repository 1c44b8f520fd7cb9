//! Sessions: one interpreter bound to one host connection.
//!
//! A [`Session`] owns the Lua state, the code cache, the scope stack and the
//! cancellation monitor. Every public entry point runs inside the top-level
//! call boundary, which unwinds scopes the call left open, resets the
//! cancellation monitor and turns whatever escaped into a single
//! [`HostErrorReport`].

use crate::builtins;
use crate::cache::{CacheStats, CodeCache};
use crate::cancel::{CancelHandle, CancellationMonitor, Interrupt, MonitorState};
use crate::config::Options;
use crate::error::{codes, Error, Result, Severity};
use crate::exception::{self, BridgedException, Disposition, HostErrorReport};
use crate::host::{Host, ProcedureId};
use crate::scope::{self, Resolution, ScopeHandle, ScopeStack, ScopeStatus};
use crate::trigger::{TriggerEvent, TriggerOutcome};
use crate::unit::{ExecutionUnit, UnitId};
use crate::Datum;
use mlua::{HookTriggers, Lua, LuaSerdeExt, MultiValue, SerializeOptions, Table, Value};
use parking_lot::Mutex;
use std::fs;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// State shared between the session and the callbacks it registers in Lua.
pub(crate) struct Core {
    pub(crate) host: Arc<dyn Host>,
    pub(crate) options: Options,
    pub(crate) cache: CodeCache,
    pub(crate) scopes: Mutex<ScopeStack>,
    pub(crate) monitor: Arc<CancellationMonitor>,
    /// Exceptions whose handlers are currently running, innermost last.
    handling: Mutex<Vec<BridgedException>>,
    /// First FATAL condition of the current call. Nothing can recover from it.
    fatal: Mutex<Option<BridgedException>>,
    terminated: AtomicBool,
    next_inline: AtomicU64,
}

impl Core {
    fn new(host: Arc<dyn Host>, options: Options) -> Self {
        Self {
            scopes: Mutex::new(ScopeStack::new(Arc::clone(&host), options.max_scope_depth)),
            cache: CodeCache::new(options.cache_capacity),
            monitor: Arc::new(CancellationMonitor::new()),
            handling: Mutex::new(Vec::new()),
            fatal: Mutex::new(None),
            terminated: AtomicBool::new(false),
            next_inline: AtomicU64::new(0),
            host,
            options,
        }
    }

    /// Raises a pending or unacknowledged interruption.
    ///
    /// A FATAL condition swallowed by script code is raised again at every
    /// safepoint.
    pub(crate) fn safepoint(&self) -> Result<()> {
        if let Some(exc) = self.fatal.lock().clone() {
            self.scopes.lock().mark_failed();
            return Err(Error::exception(exc));
        }
        if self.host.is_interrupted() {
            self.monitor.signal(Interrupt::Cancel);
        }
        match self.monitor.check() {
            None => Ok(()),
            Some(kind) => {
                let exc = kind.to_exception();
                if kind == Interrupt::Terminate {
                    self.record_fatal(&exc);
                }
                self.scopes.lock().mark_failed();
                Err(Error::exception(exc))
            }
        }
    }

    /// Converts a host report into an exception raised in script code.
    pub(crate) fn raise(&self, report: &HostErrorReport) -> Error {
        let exc = exception::to_native(report, self.handling.lock().last());
        if exc.is_fatal() {
            self.record_fatal(&exc);
        }
        self.scopes.lock().mark_failed();
        Error::exception(exc)
    }

    fn record_fatal(&self, exc: &BridgedException) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            log::debug!("fatal condition raised: {}", exc);
            *fatal = Some(exc.clone());
        }
    }

    /// Takes the FATAL condition of the finished call, if any. A consumed
    /// termination request counts even when its exception was never recorded.
    fn take_fatal(&self) -> Option<BridgedException> {
        let recorded = self.fatal.lock().take();
        recorded.or_else(|| match self.monitor.state() {
            MonitorState::Consumed(Interrupt::Terminate) => Some(Interrupt::Terminate.to_exception()),
            _ => None,
        })
    }

    /// Delivers a message, raising it instead when it is ERROR or above.
    pub(crate) fn report(&self, report: HostErrorReport) -> Result<()> {
        self.safepoint()?;
        if report.severity.is_error() {
            return Err(self.raise(&report));
        }
        self.host.report(&report);
        Ok(())
    }

    pub(crate) fn enter_scope(&self) -> Result<ScopeHandle> {
        self.safepoint()?;
        self.scopes.lock().enter()
    }

    pub(crate) fn resolve_scope(&self, handle: ScopeHandle, resolution: Resolution) -> Result<ScopeStatus> {
        self.scopes.lock().resolve(handle, resolution)
    }

    pub(crate) fn abort_through(&self, handle: ScopeHandle) -> Result<ScopeStatus> {
        self.scopes.lock().abort_through(handle)
    }

    /// Runs `f` with `exc` registered as the exception being handled.
    pub(crate) fn handling<R>(&self, exc: BridgedException, f: impl FnOnce() -> R) -> R {
        self.handling.lock().push(exc);
        let result = f();
        self.handling.lock().pop();
        result
    }

    pub(crate) fn builtins<'lua>(&self, lua: &'lua Lua) -> Result<Table<'lua>> {
        Ok(lua.named_registry_value(builtins::BUILTINS_KEY)?)
    }

    /// Returns the loaded unit for `id`, compiling and loading it on first use.
    ///
    /// A unit whose top-level code fails is dropped from the cache.
    pub(crate) fn load_procedure(&self, lua: &Lua, id: ProcedureId) -> Result<Arc<ExecutionUnit>> {
        let builtins = self.builtins(lua)?;
        let unit = self.cache.get_or_compile(lua, &builtins, id, || {
            self.host
                .lookup_procedure_source(id)
                .map_err(|report| self.raise(&report))
        })?;
        if let Err(e) = unit.load(lua) {
            self.cache.invalidate(id);
            return Err(e);
        }
        Ok(unit)
    }

    /// Loads every procedure of the given schemas. Returns how many were loaded.
    pub(crate) fn preload<S: AsRef<str>>(&self, lua: &Lua, schemas: &[S]) -> Result<usize> {
        let mut loaded = 0;
        for schema in schemas {
            let schema = schema.as_ref();
            let ids = self
                .host
                .list_procedures(schema)
                .map_err(|report| self.raise(&report))?;
            for id in ids {
                self.safepoint()?;
                self.load_procedure(lua, id)?;
                loaded += 1;
            }
            log::info!("preloaded schema {}", schema);
        }
        Ok(loaded)
    }
}

/// An interpreter session bound to a host.
///
/// # Example
///
/// ```rust
/// use plua::{host::MemoryHost, Options, Session};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # fn main() -> plua::Result<()> {
/// let host = Arc::new(MemoryHost::new());
/// let id = host.define("public", "add", "function main(a, b) return a + b end");
///
/// let session = Session::open(host, Options::default())?;
/// assert_eq!(session.call(id, &[json!(2), json!(3)])?, json!(5));
/// # Ok(())
/// # }
/// ```
pub struct Session {
    lua: Lua,
    core: Arc<Core>,
}

impl Session {
    /// Creates the interpreter, installs the shared built-ins and runs the
    /// initialization unit, if one is configured.
    pub fn open(host: Arc<dyn Host>, options: Options) -> Result<Self> {
        options.validate()?;

        let lua = Lua::new();
        let core = Arc::new(Core::new(host, options));
        builtins::install(&lua, &core)?;

        let hook_core = Arc::clone(&core);
        lua.set_hook(
            HookTriggers {
                every_nth_instruction: Some(core.options.safepoint_interval),
                ..Default::default()
            },
            move |_lua, _debug| hook_core.safepoint().map_err(mlua::Error::from),
        );

        let session = Session { lua, core };
        session.boundary(|| session.run_init())?;
        log::info!("session opened");
        Ok(session)
    }

    /// Calls a stored procedure's entry point and returns its result.
    pub fn call(&self, id: ProcedureId, args: &[Datum]) -> Result<Datum> {
        self.boundary(|| {
            self.core.safepoint()?;
            let unit = self.core.load_procedure(&self.lua, id)?;
            let main = unit.entry_point(&self.lua, &self.core.options.entry_point)?;

            let args = args
                .iter()
                .map(|arg| to_lua(&self.lua, arg))
                .collect::<Result<Vec<_>>>()?;
            let value: Value<'_> = main.call(MultiValue::from_vec(args))?;
            from_lua(&self.lua, value)
        })
    }

    /// Calls a trigger procedure for one row.
    pub fn fire_trigger(&self, id: ProcedureId, event: &TriggerEvent) -> Result<TriggerOutcome> {
        self.boundary(|| {
            self.core.safepoint()?;
            let unit = self.core.load_procedure(&self.lua, id)?;
            let main = unit.entry_point(&self.lua, &self.core.options.entry_point)?;

            let args = event.arguments(&self.lua)?;
            let result = main.call::<_, Value>(args);
            event.outcome(&self.lua, result)
        })
    }

    /// Runs an anonymous block once. Nothing is cached.
    pub fn execute_inline(&self, source: &str) -> Result<()> {
        self.boundary(|| {
            self.core.safepoint()?;
            let n = self.core.next_inline.fetch_add(1, Ordering::SeqCst) + 1;
            let id = UnitId::Inline(n);
            let builtins = self.core.builtins(&self.lua)?;
            let unit = ExecutionUnit::compile(&self.lua, id, &format!("inline {}", n), source, &builtins)?;
            unit.load(&self.lua)?;
            Ok(())
        })
    }

    /// Compiles a procedure without running or caching it.
    pub fn validate(&self, id: ProcedureId) -> Result<()> {
        self.boundary(|| {
            let source = self.core.host.lookup_procedure_source(id)?;
            let builtins = self.core.builtins(&self.lua)?;
            ExecutionUnit::compile(
                &self.lua,
                UnitId::Procedure(id),
                &source.qualified_name(),
                &source.source,
                &builtins,
            )?;
            Ok(())
        })
    }

    /// Loads every procedure in the given schemas ahead of use.
    pub fn preload(&self, schemas: &[&str]) -> Result<usize> {
        self.boundary(|| self.core.preload(&self.lua, schemas))
    }

    /// Drops the cached unit for `id` if its source changed on the host.
    /// Returns true when it was dropped.
    pub fn refresh(&self, id: ProcedureId) -> Result<bool> {
        self.ensure_open()?;
        let Some(unit) = self.core.cache.peek(id) else {
            return Ok(false);
        };
        let source = self.core.host.lookup_procedure_source(id)?;
        if unit.is_current(&source.source) {
            return Ok(false);
        }
        log::info!("source of {} changed, dropping cached unit", source.qualified_name());
        Ok(self.invalidate(id))
    }

    /// Drops the cached unit for `id`.
    pub fn invalidate(&self, id: ProcedureId) -> bool {
        let removed = self.core.cache.invalidate(id);
        self.lua.expire_registry_values();
        removed
    }

    /// Drops every cached unit. Returns how many were dropped.
    pub fn clear_cache(&self) -> usize {
        let count = self.core.cache.invalidate_all();
        self.lua.expire_registry_values();
        count
    }

    /// A handle that can cancel or terminate this session from any thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::new(Arc::clone(&self.core.monitor))
    }

    /// The cached unit for `id`, if any.
    pub fn cached_unit(&self, id: ProcedureId) -> Option<Arc<ExecutionUnit>> {
        self.core.cache.peek(id)
    }

    /// Code cache statistics.
    pub fn cache_stats(&self) -> CacheStats {
        self.core.cache.stats()
    }

    /// Number of currently open transaction scopes.
    pub fn scope_depth(&self) -> usize {
        self.core.scopes.lock().depth()
    }

    /// True once a FATAL condition ended the session.
    pub fn is_terminated(&self) -> bool {
        self.core.terminated.load(Ordering::SeqCst)
    }

    /// The options the session was opened with.
    pub fn options(&self) -> &Options {
        &self.core.options
    }

    /// Closes the session, aborting open scopes and dropping every cached unit.
    pub fn shutdown(self) {
        let aborted = self.core.scopes.lock().unwind_to(0);
        let dropped = self.clear_cache();
        log::info!(
            "session closed ({} cached unit(s) dropped, {} scope(s) aborted)",
            dropped,
            aborted
        );
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_terminated() {
            return Err(Error::Terminated);
        }
        Ok(())
    }

    /// Runs `body` as one top-level call.
    fn boundary<T>(&self, body: impl FnOnce() -> Result<T>) -> Result<T> {
        self.ensure_open()?;
        let base = self.core.scopes.lock().depth();
        let watchdog = self
            .core
            .options
            .statement_timeout
            .map(|timeout| self.cancel_handle().cancel_after(timeout));

        let result = body();

        if let Some(watchdog) = watchdog {
            let fired = watchdog.fired();
            drop(watchdog);
            // Expired after the call had already finished.
            if fired && self.core.monitor.state() == MonitorState::Signaled(Interrupt::Cancel) {
                self.core.monitor.withdraw(Interrupt::Cancel);
            }
        }
        self.finish(base, result)
    }

    fn finish<T>(&self, base: usize, result: Result<T>) -> Result<T> {
        let (unresolved, root_failed) = {
            let mut scopes = self.core.scopes.lock();
            (scopes.unwind_to(base), scopes.take_root_failed())
        };
        let fatal = self.core.take_fatal();
        self.core.monitor.acknowledge();
        self.core.handling.lock().clear();
        self.lua.expire_registry_values();

        let result = match (fatal, result) {
            // Whatever the script did afterwards, the call fails with it.
            (Some(exc), _) => Err(Error::exception(exc)),
            (None, Ok(_)) if unresolved > 0 => Err(Error::exception(
                BridgedException::new(
                    Severity::Error,
                    codes::SAVEPOINT_EXCEPTION,
                    "procedure exited with unresolved subtransactions",
                )
                .with_detail(format!("{} subtransaction(s) were aborted.", unresolved)),
            )),
            (None, Ok(_)) if root_failed => Err(Error::exception(scope::in_failed_transaction())),
            (None, other) => other,
        };
        if unresolved > 0 {
            log::warn!("aborted {} unresolved subtransaction(s) at call exit", unresolved);
        }
        result.map_err(|err| self.report_failure(err))
    }

    fn report_failure(&self, err: Error) -> Error {
        if matches!(err, Error::Terminated) {
            return err;
        }
        let report = match exception::to_host(&err) {
            Disposition::Report(report) => report,
            Disposition::Suppress(_) => {
                Error::protocol_violation("pl.stop_event() may only be called from a BEFORE trigger")
                    .to_exception()
                    .to_report()
            }
        };
        if report.severity.is_fatal() {
            self.terminate(&report);
        } else {
            log::debug!("call failed: {}", report);
        }
        Error::Reported(Box::new(report))
    }

    fn terminate(&self, report: &HostErrorReport) {
        let aborted = self.core.scopes.lock().unwind_to(0);
        self.core.cache.invalidate_all();
        self.core.terminated.store(true, Ordering::SeqCst);
        log::info!("session terminated: {} ({} scope(s) aborted)", report, aborted);
    }

    fn run_init(&self) -> Result<()> {
        let Some((origin, source)) = self.init_source()? else {
            return Ok(());
        };
        let builtins = self.core.builtins(&self.lua)?;
        let unit = ExecutionUnit::compile(&self.lua, UnitId::Init, &origin, &source, &builtins)?;
        let namespace = unit.load(&self.lua)?;

        let pl: Table<'_> = builtins.get("pl")?;
        pl.set("init", namespace)?;

        self.core.host.report(&HostErrorReport::new(
            Severity::Log,
            codes::SUCCESSFUL_COMPLETION,
            format!("loaded initialization unit ({})", origin),
        ));
        log::info!("loaded initialization unit from {}", origin);
        Ok(())
    }

    fn init_source(&self) -> Result<Option<(String, String)>> {
        if let Some(path) = &self.core.options.init_path {
            match fs::read_to_string(path) {
                Ok(text) => return Ok(Some((path.display().to_string(), text))),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    log::debug!("no initialization unit at {}", path.display());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self
            .core
            .options
            .init_source
            .clone()
            .map(|source| ("init".to_string(), source)))
    }
}

/// Converts a datum into a Lua value. JSON null becomes nil.
pub(crate) fn to_lua<'lua>(lua: &'lua Lua, datum: &Datum) -> Result<Value<'lua>> {
    let options = SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false);
    Ok(lua.to_value_with(datum, options)?)
}

/// Converts a Lua value into a datum. nil becomes JSON null.
pub(crate) fn from_lua<'lua>(lua: &'lua Lua, value: Value<'lua>) -> Result<Datum> {
    Ok(lua.from_value(value)?)
}
