//! Execution units: one compiled procedure with its private namespace.

use crate::error::{codes, Error, Result, Severity};
use crate::exception::BridgedException;
use crate::host::ProcedureId;
use mlua::{Function, Lua, RegistryKey, Table, Value};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

const NEW: u8 = 0;
const LOADING: u8 = 1;
const LOADED: u8 = 2;

/// What a unit was compiled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitId {
    /// A stored procedure.
    Procedure(ProcedureId),
    /// An anonymous inline block, numbered per session.
    Inline(u64),
    /// The session's initialization unit.
    Init,
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitId::Procedure(id) => write!(f, "procedure {}", id),
            UnitId::Inline(n) => write!(f, "inline block {}", n),
            UnitId::Init => f.write_str("initialization unit"),
        }
    }
}

/// A compiled procedure and the namespace its top-level code populates.
///
/// The namespace starts out holding references to the session's shared
/// built-ins. Top-level code runs at most once, on the first [`load`], and
/// whatever it defines persists for the lifetime of the unit.
///
/// [`load`]: ExecutionUnit::load
pub struct ExecutionUnit {
    id: UnitId,
    name: String,
    checksum: u32,
    function: RegistryKey,
    namespace: RegistryKey,
    state: AtomicU8,
}

impl ExecutionUnit {
    /// Compiles `source` into a new unit without running it.
    ///
    /// Syntax errors are returned as exceptions with code 42601.
    pub fn compile<'lua>(
        lua: &'lua Lua,
        id: UnitId,
        name: &str,
        source: &str,
        builtins: &Table<'lua>,
    ) -> Result<Self> {
        let namespace = lua.create_table()?;
        for pair in builtins.clone().pairs::<Value, Value>() {
            let (key, value) = pair?;
            namespace.raw_set(key, value)?;
        }

        let function = lua
            .load(source)
            .set_name(format!("[{}]", name))
            .set_environment(namespace.clone())
            .into_function()
            .map_err(|e| compile_error(id, e))?;

        log::debug!("compiled {} ({} bytes)", id, source.len());
        Ok(Self {
            id,
            name: name.to_string(),
            checksum: checksum(source),
            function: lua.create_registry_value(function)?,
            namespace: lua.create_registry_value(namespace)?,
            state: AtomicU8::new(NEW),
        })
    }

    /// Host identifier of the procedure.
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// Qualified name, `schema.procedure`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// CRC32 of the source this unit was compiled from.
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// True when `source` is the text this unit was compiled from.
    pub fn is_current(&self, source: &str) -> bool {
        checksum(source) == self.checksum
    }

    /// True once top-level code has run to completion.
    pub fn is_loaded(&self) -> bool {
        self.state.load(Ordering::Acquire) == LOADED
    }

    /// Runs top-level code on first use and returns the namespace.
    ///
    /// A load started while this unit is already loading, for instance when
    /// its own top-level code preloads its schema, sees the partially
    /// populated namespace.
    pub fn load<'lua>(&self, lua: &'lua Lua) -> Result<Table<'lua>> {
        let namespace: Table<'lua> = lua.registry_value(&self.namespace)?;
        if self
            .state
            .compare_exchange(NEW, LOADING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(namespace);
        }

        let function: Function<'lua> = lua.registry_value(&self.function)?;
        match function.call::<_, ()>(()) {
            Ok(()) => {
                self.state.store(LOADED, Ordering::Release);
                Ok(namespace)
            }
            Err(e) => {
                self.state.store(NEW, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// The namespace, whether or not top-level code has run.
    pub fn namespace<'lua>(&self, lua: &'lua Lua) -> Result<Table<'lua>> {
        Ok(lua.registry_value(&self.namespace)?)
    }

    /// Looks up the function named `name` in the loaded namespace.
    pub fn entry_point<'lua>(&self, lua: &'lua Lua, name: &str) -> Result<Function<'lua>> {
        let namespace = self.load(lua)?;
        match namespace.get::<_, Value>(name)? {
            Value::Function(f) => Ok(f),
            _ => Err(Error::exception(
                BridgedException::new(
                    Severity::Error,
                    codes::INVALID_FUNCTION_DEFINITION,
                    format!("{} does not define a \"{}\" function", self.name, name),
                )
                .with_detail(format!("{} must define a global function named \"{}\".", self.id, name)),
            )),
        }
    }
}

impl fmt::Debug for ExecutionUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionUnit")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("checksum", &self.checksum)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

fn checksum(source: &str) -> u32 {
    crc32fast::hash(source.as_bytes())
}

fn compile_error(id: UnitId, err: mlua::Error) -> Error {
    match err {
        mlua::Error::SyntaxError { message, .. } => Error::exception(
            BridgedException::new(Severity::Error, codes::SYNTAX_ERROR, format!("could not compile {}", id))
                .with_detail(message),
        ),
        other => Error::Lua(other),
    }
}
