//! Configuration options for a plua session.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration options for opening a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Maximum number of nested transaction scopes.
    /// Default: 1024
    pub max_scope_depth: usize,

    /// Lua VM instructions between cancellation safepoints.
    /// Lower values react to cancellation faster at some cost in throughput.
    /// Default: 1000
    pub safepoint_interval: u32,

    /// Maximum number of compiled procedures kept in the code cache.
    /// Set to 0 for no limit.
    /// Default: 1024
    pub cache_capacity: usize,

    /// Name of the function called for every procedure invocation.
    /// Default: "main"
    pub entry_point: String,

    /// Path of the initialization unit. Skipped when the file does not exist.
    /// Default: None
    pub init_path: Option<PathBuf>,

    /// Source of the initialization unit, used when `init_path` is not set
    /// or does not exist.
    /// Default: None
    pub init_source: Option<String>,

    /// Cancel any top-level call that runs longer than this.
    /// Default: None
    #[serde(with = "millis")]
    pub statement_timeout: Option<Duration>,

    /// Report script `print` output to the host as a NOTICE.
    /// Default: true
    pub redirect_print: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_scope_depth: 1024,
            safepoint_interval: 1000,
            cache_capacity: 1024,
            entry_point: "main".to_string(),
            init_path: None,
            init_source: None,
            statement_timeout: None,
            redirect_print: true,
        }
    }
}

impl Options {
    /// Creates a new Options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads options from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let options: Options = serde_json::from_str(&text)?;
        options.validate()?;
        Ok(options)
    }

    /// Sets the scope nesting limit.
    pub fn max_scope_depth(mut self, depth: usize) -> Self {
        self.max_scope_depth = depth;
        self
    }

    /// Sets the number of instructions between safepoints.
    pub fn safepoint_interval(mut self, interval: u32) -> Self {
        self.safepoint_interval = interval;
        self
    }

    /// Sets the code cache capacity.
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Sets the entry point name.
    pub fn entry_point(mut self, name: impl Into<String>) -> Self {
        self.entry_point = name.into();
        self
    }

    /// Sets the initialization unit path.
    pub fn init_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.init_path = Some(path.into());
        self
    }

    /// Sets the initialization unit source.
    pub fn init_source(mut self, source: impl Into<String>) -> Self {
        self.init_source = Some(source.into());
        self
    }

    /// Sets the statement timeout.
    pub fn statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    /// Enables or disables print redirection.
    pub fn redirect_print(mut self, value: bool) -> Self {
        self.redirect_print = value;
        self
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.max_scope_depth == 0 {
            return Err(Error::config("max_scope_depth must be > 0"));
        }
        if self.safepoint_interval == 0 {
            return Err(Error::config("safepoint_interval must be > 0"));
        }
        if self.entry_point.is_empty() {
            return Err(Error::config("entry_point must not be empty"));
        }
        if self.statement_timeout == Some(Duration::ZERO) {
            return Err(Error::config("statement_timeout must be > 0"));
        }
        Ok(())
    }
}

/// Optional durations as whole milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_options() {
        let opts = Options::default();
        assert_eq!(opts.max_scope_depth, 1024);
        assert_eq!(opts.safepoint_interval, 1000);
        assert_eq!(opts.entry_point, "main");
        assert!(opts.redirect_print);
        assert!(opts.statement_timeout.is_none());
    }

    #[test]
    fn test_options_builder() {
        let opts = Options::new()
            .max_scope_depth(8)
            .safepoint_interval(100)
            .statement_timeout(Duration::from_millis(250))
            .redirect_print(false);

        assert_eq!(opts.max_scope_depth, 8);
        assert_eq!(opts.safepoint_interval, 100);
        assert_eq!(opts.statement_timeout, Some(Duration::from_millis(250)));
        assert!(!opts.redirect_print);
    }

    #[test]
    fn test_options_validation() {
        let mut opts = Options::default();
        assert!(opts.validate().is_ok());

        opts.safepoint_interval = 0;
        assert!(opts.validate().is_err());

        opts.safepoint_interval = 10;
        opts.entry_point = String::new();
        assert!(matches!(opts.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_options_from_json_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"safepoint_interval": 10, "cache_capacity": 2, "statement_timeout": 1500}}"#).unwrap();

        let opts = Options::from_json_file(file.path()).unwrap();
        assert_eq!(opts.safepoint_interval, 10);
        assert_eq!(opts.cache_capacity, 2);
        assert_eq!(opts.statement_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(opts.max_scope_depth, 1024);
    }

    #[test]
    fn test_invalid_json_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"safepoint_interval": 0}}"#).unwrap();
        assert!(Options::from_json_file(file.path()).is_err());

        let mut file = NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(Options::from_json_file(file.path()), Err(Error::Config(_))));
    }
}
