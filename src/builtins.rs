//! The script-facing `pl` table and the shared built-ins.
//!
//! Built-ins are created once per session and stored in the Lua registry.
//! Every execution unit's namespace receives references to them, never
//! copies, so `pl` is the same table in every procedure.

use crate::error::{codes, Error, Result, Severity, SqlState};
use crate::exception::{self, BridgedException, HostErrorReport, ReportFields, SuppressEffect};
use crate::scope::{Resolution, ScopeHandle, ScopeStatus};
use crate::session::Core;
use mlua::{
    Function, Lua, LuaSerdeExt, MetaMethod, MultiValue, UserData, UserDataMethods, Value, Variadic,
};
use serde::Deserialize;
use std::sync::Arc;

/// Registry key of the built-ins table.
pub(crate) const BUILTINS_KEY: &str = "plua.builtins";

/// Base library entries shared with every namespace.
const SAFE_GLOBALS: &[&str] = &[
    "_VERSION",
    "assert",
    "error",
    "getmetatable",
    "ipairs",
    "next",
    "pairs",
    "pcall",
    "rawequal",
    "rawget",
    "rawlen",
    "rawset",
    "select",
    "setmetatable",
    "tonumber",
    "tostring",
    "type",
    "xpcall",
    "coroutine",
    "math",
    "string",
    "table",
    "utf8",
];

/// Creates the `pl` table and the built-ins and stores them in the registry.
pub(crate) fn install(lua: &Lua, core: &Arc<Core>) -> Result<()> {
    let pl = lua.create_table()?;

    for severity in Severity::ALL {
        let core = Arc::clone(core);
        let report = lua.create_function(move |lua, (message, options): (String, Option<Value<'_>>)| {
            report_message(&core, lua, severity, message, options).map_err(mlua::Error::from)
        })?;
        pl.set(severity.as_str(), report)?;
    }

    let c = Arc::clone(core);
    let xact = lua.create_function(move |_, body: Function<'_>| run_in_scope(&c, body))?;
    pl.set("xact", xact.clone())?;

    let c = Arc::clone(core);
    pl.set(
        "transaction",
        lua.create_function(move |_, ()| Ok(TransactionHandle::new(Arc::clone(&c))))?,
    )?;

    let c = Arc::clone(core);
    pl.set(
        "catch",
        lua.create_function(move |_, (pattern, body, handler): (String, Function<'_>, Function<'_>)| {
            catch(&c, &pattern, body, handler)
        })?,
    )?;

    pl.set("errcode", lua.create_function(|_, value: Value<'_>| Ok(error_code(&value)))?)?;
    pl.set("raise", lua.create_function(|_, value: Value<'_>| raise(value))?)?;
    pl.set(
        "stop_event",
        lua.create_function(|_, reason: Option<String>| -> mlua::Result<()> {
            Err(mlua::Error::external(SuppressEffect { reason }))
        })?,
    )?;

    let c = Arc::clone(core);
    pl.set(
        "preload",
        lua.create_function(move |lua, schemas: Variadic<String>| {
            c.preload(lua, &schemas[..]).map_err(mlua::Error::from)
        })?,
    )?;

    let c = Arc::clone(core);
    pl.set(
        "clearcache",
        lua.create_function(move |lua, ()| {
            let dropped = c.cache.invalidate_all();
            lua.expire_registry_values();
            Ok(dropped)
        })?,
    )?;

    pl.set("version", env!("CARGO_PKG_VERSION"))?;

    let builtins = lua.create_table()?;
    let globals = lua.globals();
    for name in SAFE_GLOBALS {
        let value: Value<'_> = globals.get(*name)?;
        if !value.is_nil() {
            builtins.set(*name, value)?;
        }
    }
    if core.options.redirect_print {
        let c = Arc::clone(core);
        builtins.set(
            "print",
            lua.create_function(move |lua, args: Variadic<Value<'_>>| print_to_host(&c, lua, args))?,
        )?;
    } else {
        builtins.set("print", globals.get::<_, Value>("print")?)?;
    }
    builtins.set("pl", pl)?;
    builtins.set("xact", xact)?;

    lua.set_named_registry_value(BUILTINS_KEY, builtins)?;
    Ok(())
}

/// Options accepted by the severity functions, e.g.
/// `pl.ERROR("bad row", { code = "22023", hint = "check the input" })`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ReportOptions {
    code: Option<String>,
    detail: Option<String>,
    hint: Option<String>,
    context: Option<String>,
    position: Option<u32>,
}

fn report_message<'lua>(
    core: &Core,
    lua: &'lua Lua,
    severity: Severity,
    message: String,
    options: Option<Value<'lua>>,
) -> Result<()> {
    let options: ReportOptions = match options {
        None | Some(Value::Nil) => ReportOptions::default(),
        Some(value) => lua.from_value(value)?,
    };
    let code = match options.code {
        Some(code) => SqlState::parse(&code)?,
        None => severity.default_code(),
    };

    let mut report = HostErrorReport::new(severity, code, message);
    report.fields = ReportFields {
        detail: options.detail,
        hint: options.hint,
        context: options.context,
        position: options.position,
    };
    core.report(report)
}

fn print_to_host<'lua>(core: &Core, lua: &'lua Lua, args: Variadic<Value<'lua>>) -> mlua::Result<()> {
    let tostring: Function<'_> = lua.globals().get("tostring")?;
    let mut parts = Vec::with_capacity(args.len());
    for value in args.iter() {
        parts.push(tostring.call::<_, String>(value.clone())?);
    }
    let text = parts.join("\t");
    if text.trim().is_empty() {
        return Ok(());
    }

    let report = HostErrorReport::new(Severity::Notice, codes::SUCCESSFUL_COMPLETION, "data written to stdout")
        .with_detail(text);
    core.report(report).map_err(mlua::Error::from)
}

/// `pl.xact(fn)`: runs `fn` in a new scope, committing on return and
/// aborting on error.
fn run_in_scope<'lua>(core: &Core, body: Function<'lua>) -> mlua::Result<MultiValue<'lua>> {
    let handle = core.enter_scope()?;
    match body.call::<_, MultiValue>(()) {
        Ok(values) => match core.resolve_scope(handle, Resolution::Commit) {
            Ok(_) => Ok(values),
            Err(e) => {
                if matches!(e, Error::ScopeOrder { .. }) {
                    // The block left inner scopes open.
                    if let Err(abort) = core.abort_through(handle) {
                        log::warn!("could not abort scope {}: {}", handle.id(), abort);
                    }
                }
                Err(e.into())
            }
        },
        Err(err) => {
            if let Err(abort) = core.abort_through(handle) {
                log::warn!("could not abort scope {}: {}", handle.id(), abort);
            }
            Err(err)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    New,
    Open(ScopeHandle),
    Committed,
    Aborted,
}

impl HandleState {
    fn as_str(&self) -> &'static str {
        match self {
            HandleState::New => "new",
            HandleState::Open(_) => "open",
            HandleState::Committed => "committed",
            HandleState::Aborted => "aborted",
        }
    }
}

/// `pl.transaction()`: a scope entered and resolved by hand.
struct TransactionHandle {
    core: Arc<Core>,
    state: HandleState,
}

impl TransactionHandle {
    fn new(core: Arc<Core>) -> Self {
        Self {
            core,
            state: HandleState::New,
        }
    }

    fn enter(&mut self) -> mlua::Result<()> {
        if self.state != HandleState::New {
            return Err(misuse("this transaction has already been entered"));
        }
        let handle = self.core.enter_scope()?;
        self.state = HandleState::Open(handle);
        Ok(())
    }

    fn resolve(&mut self, resolution: Resolution) -> mlua::Result<()> {
        let handle = match self.state {
            HandleState::Open(handle) => handle,
            HandleState::New => return Err(misuse("this transaction has not been entered")),
            _ => return Err(misuse("this transaction has already been resolved")),
        };
        let result = self.core.resolve_scope(handle, resolution);
        match result {
            Err(Error::ScopeOrder { .. }) => {}
            Ok(ScopeStatus::Committed) => self.state = HandleState::Committed,
            _ => self.state = HandleState::Aborted,
        }
        result.map(|_| ()).map_err(mlua::Error::from)
    }
}

impl UserData for TransactionHandle {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method_mut("enter", |_, this, ()| this.enter());
        methods.add_method_mut("commit", |_, this, ()| this.resolve(Resolution::Commit));
        methods.add_method_mut("abort", |_, this, ()| this.resolve(Resolution::Abort));
        methods.add_method("status", |_, this, ()| Ok(this.state.as_str()));
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("transaction ({})", this.state.as_str()))
        });
    }
}

fn misuse(message: &str) -> mlua::Error {
    Error::exception(BridgedException::new(
        Severity::Error,
        codes::SAVEPOINT_EXCEPTION,
        message,
    ))
    .into()
}

/// Which errors a `pl.catch` intercepts.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CatchPattern {
    /// `"*"`: any error except cancellation.
    Any,
    /// Two characters: every code of one class.
    Class(String),
    /// Five characters: one code.
    Code(SqlState),
}

impl CatchPattern {
    fn parse(pattern: &str) -> Result<Self> {
        if pattern == "*" {
            return Ok(CatchPattern::Any);
        }
        match pattern.len() {
            2 if pattern.bytes().all(|b| b.is_ascii_alphanumeric()) => {
                Ok(CatchPattern::Class(pattern.to_ascii_uppercase()))
            }
            5 => Ok(CatchPattern::Code(SqlState::parse(pattern)?)),
            _ => Err(Error::invalid_argument(format!(
                "catch pattern must be \"*\", a class or a code, got \"{}\"",
                pattern
            ))),
        }
    }

    /// Cancellation is only intercepted by patterns naming class 57.
    /// FATAL and PANIC are never intercepted.
    fn intercepts(&self, exc: &BridgedException) -> bool {
        if exc.is_fatal() {
            return false;
        }
        match self {
            CatchPattern::Any => !exc.is_cancellation(),
            CatchPattern::Class(class) => exc.code.class() == class,
            CatchPattern::Code(code) => exc.code == *code,
        }
    }
}

/// `pl.catch(pattern, body, handler)`: calls `body`; if it raises an error
/// matching `pattern`, returns what `handler(exception)` returns instead.
fn catch<'lua>(
    core: &Core,
    pattern: &str,
    body: Function<'lua>,
    handler: Function<'lua>,
) -> mlua::Result<MultiValue<'lua>> {
    let pattern = CatchPattern::parse(pattern)?;
    let err = match body.call::<_, MultiValue>(()) {
        Ok(values) => return Ok(values),
        Err(err) => err,
    };
    if exception::is_suppress(&err) {
        return Err(err);
    }

    let exc = exception::from_lua_error(&err);
    if !pattern.intercepts(&exc) {
        return Err(err);
    }
    if exc.is_cancellation() {
        core.monitor.acknowledge();
    }
    log::debug!("pl.catch intercepted {}", exc);
    core.handling(exc.clone(), || handler.call::<_, MultiValue>(exc))
}

/// `pl.errcode(err)`: the code of a caught error value.
fn error_code(value: &Value<'_>) -> Option<String> {
    match value {
        Value::Nil => None,
        Value::Error(err) => Some(exception::from_lua_error(err).code.to_string()),
        Value::UserData(ud) => match ud.borrow::<BridgedException>() {
            Ok(exc) => Some(exc.code.to_string()),
            Err(_) => Some(codes::SCRIPT_EXCEPTION.to_string()),
        },
        _ => Some(codes::SCRIPT_EXCEPTION.to_string()),
    }
}

/// `pl.raise(exc)`: re-raises a caught exception unchanged.
fn raise(value: Value<'_>) -> mlua::Result<()> {
    match value {
        Value::Error(err) => Err(err),
        Value::UserData(ud) => {
            let exc = ud.borrow::<BridgedException>()?.clone();
            Err(mlua::Error::external(exc))
        }
        other => Err(mlua::Error::RuntimeError(format!(
            "pl.raise expects an exception, got {}",
            other.type_name()
        ))),
    }
}
