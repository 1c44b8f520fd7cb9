//! Translation between host error reports and script-side exceptions.
//!
//! The host speaks [`HostErrorReport`]; scripts see [`BridgedException`]
//! values. [`to_native`] goes one way, [`to_host`] the other, and each is the
//! inverse of the other for every severity, code and chain of causes.

use crate::error::{codes, Error, Severity, SqlState};
use mlua::{MetaMethod, UserData, UserDataFields, UserDataMethods};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Optional fields attached to a diagnostic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportFields {
    /// Secondary message with more detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Suggestion on what to do about the problem.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// Where the problem happened, usually a traceback.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Character position in the offending source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
}

/// The host's representation of an error or message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostErrorReport {
    /// How severe the report is.
    pub severity: Severity,
    /// Five character code.
    pub code: SqlState,
    /// Primary message.
    pub message: String,
    /// Optional fields.
    #[serde(flatten)]
    pub fields: ReportFields,
    /// The report that was being handled when this one was raised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<HostErrorReport>>,
}

impl HostErrorReport {
    /// Creates a report without optional fields.
    pub fn new(severity: Severity, code: SqlState, message: impl Into<String>) -> Self {
        Self {
            severity,
            code,
            message: message.into(),
            fields: ReportFields::default(),
            cause: None,
        }
    }

    /// Sets the secondary message.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.fields.detail = Some(detail.into());
        self
    }

    /// Sets the suggestion shown to the user.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.fields.hint = Some(hint.into());
        self
    }

    /// Sets where the report was raised.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.fields.context = Some(context.into());
        self
    }

    /// Chains the report that was being handled.
    pub fn with_cause(mut self, cause: HostErrorReport) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Number of reports in the chain, this one included.
    pub fn chain_len(&self) -> usize {
        1 + self.cause.as_ref().map_or(0, |c| c.chain_len())
    }
}

impl fmt::Display for HostErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)
    }
}

/// An exception as scripts see it.
///
/// Raised into Lua as an external error so that it survives `pcall` and
/// re-raising with `error(err)` untouched. Handlers installed with `pl.catch`
/// receive it as userdata exposing `severity`, `code`, `message`, `detail`,
/// `hint`, `context`, `position` and `cause`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgedException {
    /// How severe the exception is.
    pub severity: Severity,
    /// Five character code.
    pub code: SqlState,
    /// Primary message.
    pub message: String,
    /// Optional fields carried over from the report.
    pub fields: ReportFields,
    /// The exception being handled when this one was raised.
    pub cause: Option<Box<BridgedException>>,
}

impl BridgedException {
    /// Creates an exception without optional fields or cause.
    pub fn new(severity: Severity, code: SqlState, message: impl Into<String>) -> Self {
        Self {
            severity,
            code,
            message: message.into(),
            fields: ReportFields::default(),
            cause: None,
        }
    }

    /// Sets the secondary message.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.fields.detail = Some(detail.into());
        self
    }

    /// Cancellation or termination (class "57").
    pub fn is_cancellation(&self) -> bool {
        self.code.is_cancellation()
    }

    /// FATAL or PANIC. Ends the session once it reaches the call boundary.
    pub fn is_fatal(&self) -> bool {
        self.severity.is_fatal()
    }

    /// Attaches `cause` at the end of the existing chain.
    pub fn append_cause(&mut self, cause: BridgedException) {
        if let Some(existing) = self.cause.as_mut() {
            existing.append_cause(cause);
            return;
        }
        self.cause = Some(Box::new(cause));
    }

    /// Iterates over this exception and its causes, outermost first.
    pub fn chain(&self) -> impl Iterator<Item = &BridgedException> {
        std::iter::successors(Some(self), |e| e.cause.as_deref())
    }

    /// Host form of this exception, causes included.
    pub fn to_report(&self) -> HostErrorReport {
        HostErrorReport {
            severity: self.severity,
            code: self.code,
            message: self.message.clone(),
            fields: self.fields.clone(),
            cause: self.cause.as_ref().map(|c| Box::new(c.to_report())),
        }
    }
}

impl fmt::Display for BridgedException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)
    }
}

impl std::error::Error for BridgedException {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl UserData for BridgedException {
    fn add_fields<'lua, F: UserDataFields<'lua, Self>>(fields: &mut F) {
        fields.add_field_method_get("severity", |_, this| Ok(this.severity.as_str()));
        fields.add_field_method_get("code", |_, this| Ok(this.code.to_string()));
        fields.add_field_method_get("message", |_, this| Ok(this.message.clone()));
        fields.add_field_method_get("detail", |_, this| Ok(this.fields.detail.clone()));
        fields.add_field_method_get("hint", |_, this| Ok(this.fields.hint.clone()));
        fields.add_field_method_get("context", |_, this| Ok(this.fields.context.clone()));
        fields.add_field_method_get("position", |_, this| Ok(this.fields.position));
        fields.add_field_method_get("cause", |_, this| Ok(this.cause.as_deref().cloned()));
    }

    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.to_string()));
    }
}

/// Raised by a trigger to skip the triggering row. Not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuppressEffect {
    /// Message logged with the suppression.
    pub reason: Option<String>,
}

impl fmt::Display for SuppressEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "trigger event suppressed: {}", reason),
            None => f.write_str("trigger event suppressed"),
        }
    }
}

impl std::error::Error for SuppressEffect {}

/// What the host should do with an error leaving script code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Report it.
    Report(HostErrorReport),
    /// Skip the triggering event. Only meaningful for triggers.
    Suppress(SuppressEffect),
}

/// Converts a host report into a script-side exception.
///
/// If the script was already handling `predecessor` when the report was raised,
/// it is attached as the innermost cause.
pub fn to_native(report: &HostErrorReport, predecessor: Option<&BridgedException>) -> BridgedException {
    let mut exc = BridgedException {
        severity: report.severity,
        code: report.code,
        message: report.message.clone(),
        fields: report.fields.clone(),
        cause: report.cause.as_ref().map(|c| Box::new(to_native(c, None))),
    };
    if let Some(prior) = predecessor {
        exc.append_cause(prior.clone());
    }
    exc
}

/// Classifies an error leaving script code.
///
/// Bridged exceptions keep their severity and code. Plain script errors are
/// reported at ERROR with a generic code. A suppress signal is not an error.
pub fn to_host(err: &Error) -> Disposition {
    match err {
        Error::Lua(e) => match carried(e) {
            Some(Carried::Suppress(effect)) => Disposition::Suppress(effect.clone()),
            _ => Disposition::Report(from_lua_error(e).to_report()),
        },
        Error::Reported(report) => Disposition::Report((**report).clone()),
        other => Disposition::Report(other.to_exception().to_report()),
    }
}

/// The bridged exception behind a Lua error, synthesizing one for plain script errors.
pub fn from_lua_error(err: &mlua::Error) -> BridgedException {
    match carried(err) {
        Some(Carried::Exception(exc)) => {
            let mut exc = exc.clone();
            if exc.fields.context.is_none() {
                exc.fields.context = traceback(err);
            }
            exc
        }
        Some(Carried::Suppress(_)) => BridgedException::new(
            Severity::Error,
            codes::PROTOCOL_VIOLATION,
            "trigger suppression requested outside of a BEFORE trigger",
        ),
        None => {
            let code = if is_syntax_error(err) {
                codes::SYNTAX_ERROR
            } else {
                codes::SCRIPT_EXCEPTION
            };
            let mut exc = BridgedException::new(Severity::Error, code, script_message(err));
            exc.fields.context = traceback(err);
            exc
        }
    }
}

/// True when the Lua error is a suppress signal from `pl.stop_event`.
pub fn is_suppress(err: &mlua::Error) -> bool {
    matches!(carried(err), Some(Carried::Suppress(_)))
}

enum Carried<'a> {
    Exception(&'a BridgedException),
    Suppress(&'a SuppressEffect),
}

fn carried(err: &mlua::Error) -> Option<Carried<'_>> {
    match err {
        mlua::Error::CallbackError { cause, .. } => carried(cause),
        mlua::Error::ExternalError(inner) => {
            if let Some(exc) = inner.downcast_ref::<BridgedException>() {
                Some(Carried::Exception(exc))
            } else {
                inner.downcast_ref::<SuppressEffect>().map(Carried::Suppress)
            }
        }
        _ => None,
    }
}

fn script_message(err: &mlua::Error) -> String {
    match err {
        mlua::Error::CallbackError { cause, .. } => script_message(cause),
        mlua::Error::RuntimeError(msg) => msg.clone(),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

fn is_syntax_error(err: &mlua::Error) -> bool {
    match err {
        mlua::Error::CallbackError { cause, .. } => is_syntax_error(cause),
        mlua::Error::SyntaxError { .. } => true,
        _ => false,
    }
}

fn traceback(err: &mlua::Error) -> Option<String> {
    match err {
        mlua::Error::CallbackError { traceback, .. } => Some(traceback.clone()),
        _ => None,
    }
}
