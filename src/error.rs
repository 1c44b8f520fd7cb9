//! Error types for the plua bridge.
//!
//! Two families of errors live here. [`Error`] is the crate's Rust-side error,
//! returned by every fallible operation. [`Severity`] and [`SqlState`] are the
//! host's diagnostic vocabulary: every error that crosses the host/script
//! boundary is eventually expressed as a severity plus a five character code.

use crate::exception::{self, BridgedException, HostErrorReport};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::io;

/// The result type used throughout plua.
pub type Result<T> = std::result::Result<T, Error>;

/// Diagnostic severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Developer diagnostics.
    Debug,
    /// Server log only.
    Log,
    /// Informational, sent to the client.
    Info,
    /// Notice sent to the client.
    Notice,
    /// Warning sent to the client.
    Warning,
    /// Aborts the current unit of work.
    Error,
    /// Terminates the session.
    Fatal,
    /// Terminates every session.
    Panic,
}

impl Severity {
    /// All severities in ascending order.
    pub const ALL: [Severity; 8] = [
        Severity::Debug,
        Severity::Log,
        Severity::Info,
        Severity::Notice,
        Severity::Warning,
        Severity::Error,
        Severity::Fatal,
        Severity::Panic,
    ];

    /// Upper-case name, also used as the script-side reporting function name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Log => "LOG",
            Severity::Info => "INFO",
            Severity::Notice => "NOTICE",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
            Severity::Panic => "PANIC",
        }
    }

    /// Parses a severity name, ignoring case.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.as_str().eq_ignore_ascii_case(name))
    }

    /// True for ERROR and above: reporting at this level raises.
    pub fn is_error(&self) -> bool {
        *self >= Severity::Error
    }

    /// True for FATAL and above: the session cannot continue.
    pub fn is_fatal(&self) -> bool {
        *self >= Severity::Fatal
    }

    /// The code a report carries when the reporter did not choose one.
    pub fn default_code(&self) -> SqlState {
        match self {
            Severity::Warning => codes::WARNING,
            s if s.is_error() => codes::INTERNAL_ERROR,
            _ => codes::SUCCESSFUL_COMPLETION,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A five character error code: two characters of class, three of condition.
///
/// Always made of ASCII digits and upper-case letters, so it is never empty.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SqlState([u8; 5]);

impl SqlState {
    /// Builds a code from raw bytes. Only used for the constants in [`codes`].
    pub const fn from_bytes(bytes: [u8; 5]) -> Self {
        SqlState(bytes)
    }

    /// Parses and validates a code such as `"57014"`.
    pub fn parse(code: &str) -> Result<Self> {
        let bytes = code.as_bytes();
        if bytes.len() != 5 {
            return Err(Error::invalid_argument(format!("invalid error code '{}'", code)));
        }
        let mut out = [0u8; 5];
        for (slot, b) in out.iter_mut().zip(bytes) {
            let b = b.to_ascii_uppercase();
            if !b.is_ascii_digit() && !b.is_ascii_uppercase() {
                return Err(Error::invalid_argument(format!("invalid error code '{}'", code)));
            }
            *slot = b;
        }
        Ok(SqlState(out))
    }

    /// The code as a string slice.
    pub fn as_str(&self) -> &str {
        // Construction guarantees ASCII.
        std::str::from_utf8(&self.0).unwrap_or("XX000")
    }

    /// The two character class, e.g. `"57"` for operator intervention.
    pub fn class(&self) -> &str {
        &self.as_str()[..2]
    }

    /// Class "57": cancellation or termination.
    pub fn is_cancellation(&self) -> bool {
        self.class() == codes::CANCELLATION_CLASS
    }
}

impl fmt::Debug for SqlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SqlState({})", self.as_str())
    }
}

impl fmt::Display for SqlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for SqlState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SqlState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        SqlState::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Well-known error codes.
pub mod codes {
    use super::SqlState;

    /// Class reserved for cancellation and termination.
    pub const CANCELLATION_CLASS: &str = "57";

    /// 00000
    pub const SUCCESSFUL_COMPLETION: SqlState = SqlState::from_bytes(*b"00000");
    /// 01000
    pub const WARNING: SqlState = SqlState::from_bytes(*b"01000");
    /// 25P02: work attempted after an error without rolling back.
    pub const IN_FAILED_TRANSACTION: SqlState = SqlState::from_bytes(*b"25P02");
    /// 3B000: subtransaction misuse.
    pub const SAVEPOINT_EXCEPTION: SqlState = SqlState::from_bytes(*b"3B000");
    /// 42601
    pub const SYNTAX_ERROR: SqlState = SqlState::from_bytes(*b"42601");
    /// 42P13: a procedure lacks its entry point.
    pub const INVALID_FUNCTION_DEFINITION: SqlState = SqlState::from_bytes(*b"42P13");
    /// 57014: statement canceled.
    pub const QUERY_CANCELED: SqlState = SqlState::from_bytes(*b"57014");
    /// 57P01: session terminated by an operator.
    pub const ADMIN_SHUTDOWN: SqlState = SqlState::from_bytes(*b"57P01");
    /// XX000
    pub const INTERNAL_ERROR: SqlState = SqlState::from_bytes(*b"XX000");
    /// PL000: failure inside the bridge itself.
    pub const BRIDGE_ERROR: SqlState = SqlState::from_bytes(*b"PL000");
    /// PL001: the script raised an ordinary error.
    pub const SCRIPT_EXCEPTION: SqlState = SqlState::from_bytes(*b"PL001");
    /// PL002: the script broke the calling convention.
    pub const PROTOCOL_VIOLATION: SqlState = SqlState::from_bytes(*b"PL002");
}

/// The error type for plua operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error raised inside the interpreter, possibly carrying a bridged exception.
    #[error("Lua error: {0}")]
    Lua(#[from] mlua::Error),

    /// An exception raised by the bridge.
    #[error("{0}")]
    Exception(Box<BridgedException>),

    /// `enter()` would exceed the nesting limit.
    #[error("too many subtransactions: nesting limit of {limit} exceeded")]
    ScopeLimit {
        /// The configured limit.
        limit: usize,
    },

    /// A scope was resolved while it was not the innermost one.
    #[error("out-of-order resolution of subtransaction {handle}: {detail}")]
    ScopeOrder {
        /// Id of the handle that was resolved.
        handle: u64,
        /// What was expected instead.
        detail: String,
    },

    /// The final report handed to the host at the call boundary.
    #[error("{0}")]
    Reported(Box<HostErrorReport>),

    /// The session was terminated by a FATAL condition.
    #[error("session terminated")]
    Terminated,

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An invalid argument was provided.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Wraps a bridged exception.
    pub fn exception(exc: BridgedException) -> Self {
        Error::Exception(Box::new(exc))
    }

    /// Creates a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Creates a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// The script broke the calling convention.
    pub fn protocol_violation(msg: impl Into<String>) -> Self {
        Error::exception(BridgedException::new(
            Severity::Error,
            codes::PROTOCOL_VIOLATION,
            msg,
        ))
    }

    /// Expresses any error as a bridged exception with a non-empty code.
    pub fn to_exception(&self) -> BridgedException {
        match self {
            Error::Lua(e) => exception::from_lua_error(e),
            Error::Exception(exc) => (**exc).clone(),
            Error::Reported(report) => exception::to_native(report, None),
            Error::ScopeLimit { limit } => BridgedException::new(
                Severity::Error,
                codes::SAVEPOINT_EXCEPTION,
                "too many subtransactions",
            )
            .with_detail(format!("The nesting limit is {}.", limit)),
            Error::ScopeOrder { .. } => {
                BridgedException::new(Severity::Error, codes::SAVEPOINT_EXCEPTION, self.to_string())
            }
            Error::Terminated => {
                BridgedException::new(Severity::Fatal, codes::ADMIN_SHUTDOWN, "session terminated")
            }
            Error::Io(_) | Error::Config(_) | Error::InvalidArgument(_) => {
                BridgedException::new(Severity::Error, codes::BRIDGE_ERROR, self.to_string())
            }
        }
    }

    /// The code this error is reported with.
    pub fn sqlstate(&self) -> SqlState {
        match self {
            Error::Exception(exc) => exc.code,
            Error::Reported(report) => report.code,
            other => other.to_exception().code,
        }
    }

    /// The severity this error is reported with.
    pub fn severity(&self) -> Severity {
        match self {
            Error::Exception(exc) => exc.severity,
            Error::Reported(report) => report.severity,
            other => other.to_exception().severity,
        }
    }

    /// True when the error belongs to class "57".
    pub fn is_cancellation(&self) -> bool {
        self.sqlstate().is_cancellation()
    }
}

impl From<BridgedException> for Error {
    fn from(exc: BridgedException) -> Self {
        Error::exception(exc)
    }
}

impl From<HostErrorReport> for Error {
    fn from(report: HostErrorReport) -> Self {
        Error::exception(exception::to_native(&report, None))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Crate errors raised into Lua travel as external errors, except errors that
/// came out of Lua in the first place, which go back unchanged.
impl From<Error> for mlua::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Lua(e) => e,
            other => mlua::Error::external(other.to_exception()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_order() {
        assert!(Severity::Debug < Severity::Log);
        assert!(Severity::Notice < Severity::Warning);
        assert!(Severity::Error < Severity::Fatal);
        assert!(Severity::Fatal < Severity::Panic);
        assert!(Severity::Error.is_error());
        assert!(!Severity::Warning.is_error());
        assert!(Severity::Panic.is_fatal());
        assert!(!Severity::Error.is_fatal());
    }

    #[test]
    fn test_severity_parse() {
        assert_eq!(Severity::parse("notice"), Some(Severity::Notice));
        assert_eq!(Severity::parse("FATAL"), Some(Severity::Fatal));
        assert_eq!(Severity::parse("loud"), None);
    }

    #[test]
    fn test_sqlstate_parse() {
        let code = SqlState::parse("57014").unwrap();
        assert_eq!(code, codes::QUERY_CANCELED);
        assert_eq!(code.class(), "57");
        assert!(code.is_cancellation());

        assert_eq!(SqlState::parse("57p01").unwrap(), codes::ADMIN_SHUTDOWN);
        assert!(SqlState::parse("5701").is_err());
        assert!(SqlState::parse("57-14").is_err());
        assert!(SqlState::parse("").is_err());
    }

    #[test]
    fn test_default_codes() {
        assert_eq!(Severity::Notice.default_code(), codes::SUCCESSFUL_COMPLETION);
        assert_eq!(Severity::Warning.default_code(), codes::WARNING);
        assert_eq!(Severity::Error.default_code(), codes::INTERNAL_ERROR);
        assert_eq!(Severity::Fatal.default_code(), codes::INTERNAL_ERROR);
    }

    #[test]
    fn test_error_display() {
        let err = Error::ScopeLimit { limit: 4 };
        assert!(err.to_string().contains("nesting limit of 4"));

        let err = Error::invalid_argument("bad");
        assert_eq!(err.to_string(), "Invalid argument: bad");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::ScopeLimit { limit: 1 }.sqlstate(), codes::SAVEPOINT_EXCEPTION);
        assert_eq!(Error::Terminated.sqlstate(), codes::ADMIN_SHUTDOWN);
        assert_eq!(Error::Terminated.severity(), Severity::Fatal);
        assert_eq!(Error::config("x").sqlstate(), codes::BRIDGE_ERROR);
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_lua_error_goes_back_unchanged() {
        let original = mlua::Error::RuntimeError("boom".to_string());
        let err: Error = original.into();
        let back: mlua::Error = err.into();
        assert!(matches!(back, mlua::Error::RuntimeError(ref m) if m == "boom"));
    }

    #[test]
    fn test_sqlstate_serde() {
        let json = serde_json::to_string(&codes::QUERY_CANCELED).unwrap();
        assert_eq!(json, "\"57014\"");
        let back: SqlState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, codes::QUERY_CANCELED);
        assert!(serde_json::from_str::<SqlState>("\"nope\"").is_err());
    }
}
