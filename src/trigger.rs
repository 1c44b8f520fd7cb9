//! Row trigger invocation.
//!
//! A trigger procedure's entry point is called with a trigger-data table
//! followed by the affected rows: `(td, new)` for INSERT, `(td, old, new)`
//! for UPDATE and `(td, old)` for DELETE.

use crate::error::{Error, Result};
use crate::exception;
use crate::Datum;
use mlua::{Lua, LuaSerdeExt, MultiValue, Value};
use serde::{Deserialize, Serialize};

/// When the trigger fires relative to the row operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerTiming {
    /// Before the row is written; the trigger may replace or skip it.
    Before,
    /// After the row is written.
    After,
}

/// The row operation that fired the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerOperation {
    /// A row is inserted.
    Insert,
    /// A row is updated.
    Update,
    /// A row is deleted.
    Delete,
}

/// One row-level trigger firing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerEvent {
    /// Trigger name.
    pub name: String,
    /// Table the trigger is defined on.
    pub table: String,
    /// Before or after.
    pub timing: TriggerTiming,
    /// Insert, update or delete.
    pub operation: TriggerOperation,
    /// The row before the operation (UPDATE and DELETE).
    #[serde(skip)]
    pub old: Option<Datum>,
    /// The row after the operation (INSERT and UPDATE).
    #[serde(skip)]
    pub new: Option<Datum>,
}

/// What the host should do with the triggering row.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// Apply the operation unchanged.
    Proceed,
    /// Apply the operation using this row instead.
    Replace(Datum),
    /// Skip the operation for this row.
    Suppress,
}

impl TriggerEvent {
    /// Creates an event without rows.
    pub fn new(name: &str, table: &str, timing: TriggerTiming, operation: TriggerOperation) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            timing,
            operation,
            old: None,
            new: None,
        }
    }

    /// Sets the old row.
    pub fn with_old(mut self, row: Datum) -> Self {
        self.old = Some(row);
        self
    }

    /// Sets the new row.
    pub fn with_new(mut self, row: Datum) -> Self {
        self.new = Some(row);
        self
    }

    pub(crate) fn arguments<'lua>(&self, lua: &'lua Lua) -> Result<MultiValue<'lua>> {
        let row = |datum: &Option<Datum>| -> Result<Value<'lua>> {
            match datum {
                Some(d) => crate::session::to_lua(lua, d),
                None => Ok(Value::Nil),
            }
        };

        let mut args = vec![lua.to_value(self)?];
        match self.operation {
            TriggerOperation::Insert => args.push(row(&self.new)?),
            TriggerOperation::Update => {
                args.push(row(&self.old)?);
                args.push(row(&self.new)?);
            }
            TriggerOperation::Delete => args.push(row(&self.old)?),
        }
        Ok(MultiValue::from_vec(args))
    }

    pub(crate) fn outcome<'lua>(&self, lua: &'lua Lua, result: mlua::Result<Value<'lua>>) -> Result<TriggerOutcome> {
        let value = match result {
            Ok(value) => value,
            Err(e) if exception::is_suppress(&e) => {
                return match self.timing {
                    TriggerTiming::Before => {
                        log::debug!("trigger {} suppressed a row on {}", self.name, self.table);
                        Ok(TriggerOutcome::Suppress)
                    }
                    TriggerTiming::After => Err(Error::protocol_violation(format!(
                        "AFTER trigger {} cannot suppress the triggering event",
                        self.name
                    ))),
                };
            }
            Err(e) => return Err(e.into()),
        };

        if value.is_nil() {
            return Ok(TriggerOutcome::Proceed);
        }
        match (self.timing, self.operation) {
            (TriggerTiming::After, _) => Err(Error::protocol_violation(format!(
                "AFTER trigger {} returned a value; it must return nil",
                self.name
            ))),
            (TriggerTiming::Before, TriggerOperation::Delete) => Err(Error::protocol_violation(format!(
                "BEFORE DELETE trigger {} cannot return a replacement row",
                self.name
            ))),
            (TriggerTiming::Before, _) => Ok(TriggerOutcome::Replace(crate::session::from_lua(lua, value)?)),
        }
    }
}
