// Session Tests for plua
// These tests exercise session bootstrap, the shared built-ins, namespace
// isolation, anonymous blocks and option handling end to end

use plua::error::codes;
use plua::host::MemoryHost;
use plua::{Error, HostErrorReport, Options, Session, Severity};
use serde_json::json;
use std::fs;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{NamedTempFile, TempDir};

fn open(options: Options) -> (Arc<MemoryHost>, Session) {
    let _ = env_logger::builder().is_test(true).try_init();
    let host = Arc::new(MemoryHost::new());
    let session = Session::open(host.clone(), options).unwrap();
    (host, session)
}

fn reported(err: Error) -> HostErrorReport {
    match err {
        Error::Reported(report) => *report,
        other => panic!("expected a reported error, got {:?}", other),
    }
}

// ============================================================================
// Bootstrap
// ============================================================================

/// Test the initialization unit is loaded from a file and exposed as `pl.init`
#[test]
fn test_init_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("init.lua");
    fs::write(
        &path,
        r#"
        greeting = "hello"
        function greet(name) return greeting .. ", " .. name end
        "#,
    )
    .unwrap();

    let (host, session) = open(Options::default().init_path(&path));
    let id = host.define("public", "hi", "function main(n) return pl.init.greet(n) end");

    assert_eq!(session.call(id, &[json!("bob")]).unwrap(), json!("hello, bob"));

    let reports = host.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].severity, Severity::Log);
    assert!(reports[0].message.starts_with("loaded initialization unit"));
}

/// Test inline init source is used when the init file does not exist
#[test]
fn test_init_source_fallback() {
    let dir = TempDir::new().unwrap();
    let options = Options::default()
        .init_path(dir.path().join("missing.lua"))
        .init_source("answer = 42");
    let (host, session) = open(options);
    let id = host.define("public", "answer", "function main() return pl.init.answer end");

    assert_eq!(session.call(id, &[]).unwrap(), json!(42));
}

/// Test sessions without an initialization unit have no `pl.init`
#[test]
fn test_no_init() {
    let (host, session) = open(Options::default());
    let id = host.define("public", "probe", "function main() return pl.init == nil end");

    assert_eq!(session.call(id, &[]).unwrap(), json!(true));
    assert!(host.reports().is_empty());
}

/// Test a broken initialization unit fails the open
#[test]
fn test_init_failure() {
    let host = Arc::new(MemoryHost::new());
    let broken = Options::default().init_source("function (");
    let report = reported(Session::open(host.clone(), broken).err().unwrap());
    assert_eq!(report.code, codes::SYNTAX_ERROR);

    let raising = Options::default().init_source("pl.ERROR('no config', { code = 'F0000' })");
    let report = reported(Session::open(host, raising).err().unwrap());
    assert_eq!(report.code.as_str(), "F0000");
}

// ============================================================================
// Namespaces and built-ins
// ============================================================================

/// Test procedures do not see each other's globals but share `pl`
#[test]
fn test_namespace_isolation() {
    let (host, session) = open(Options::default());
    let a = host.define(
        "public",
        "a",
        r#"
        shared = "from a"
        pl.marker = "set by a"
        function main() return shared end
        "#,
    );
    let b = host.define(
        "public",
        "b",
        "function main() return { shared = shared, marker = pl.marker } end",
    );

    assert_eq!(session.call(a, &[]).unwrap(), json!("from a"));
    assert_eq!(session.call(b, &[]).unwrap(), json!({"marker": "set by a"}));
}

/// Test the sandbox exposes the safe subset of the standard library
#[test]
fn test_sandbox() {
    let (host, session) = open(Options::default());
    let id = host.define(
        "public",
        "probe",
        r#"
        function main()
          return {
            os = type(os),
            io = type(io),
            load = type(load),
            require = type(require),
            dofile = type(dofile),
            string = type(string),
            math = type(math),
            pcall = type(pcall),
          }
        end
        "#,
    );

    let out = session.call(id, &[]).unwrap();
    assert_eq!(
        out,
        json!({
            "os": "nil",
            "io": "nil",
            "load": "nil",
            "require": "nil",
            "dofile": "nil",
            "string": "table",
            "math": "table",
            "pcall": "function",
        })
    );
}

/// Test `print` is redirected to the host as a NOTICE
#[test]
fn test_print_redirect() {
    let (host, session) = open(Options::default());
    let id = host.define(
        "public",
        "printer",
        "function main() print('hello', 42) print('   ') end",
    );

    session.call(id, &[]).unwrap();
    let reports = host.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].severity, Severity::Notice);
    assert_eq!(reports[0].message, "data written to stdout");
    assert_eq!(reports[0].fields.detail.as_deref(), Some("hello\t42"));
}

/// Test `print` goes to stdout when redirection is off
#[test]
fn test_print_not_redirected() {
    let (host, session) = open(Options::default().redirect_print(false));
    let id = host.define("public", "printer", "function main() print('to stdout') end");

    session.call(id, &[]).unwrap();
    assert!(host.reports().is_empty());
}

/// Test `pl.version`
#[test]
fn test_version() {
    let (host, session) = open(Options::default());
    let id = host.define("public", "version", "function main() return pl.version end");
    assert_eq!(session.call(id, &[]).unwrap(), json!(env!("CARGO_PKG_VERSION")));
}

/// Test a configured entry point name
#[test]
fn test_custom_entry_point() {
    let (host, session) = open(Options::default().entry_point("run"));
    let id = host.define("public", "runner", "function run(x) return x * 2 end");
    let other = host.define("public", "other", "function main() return 1 end");

    assert_eq!(session.call(id, &[json!(21)]).unwrap(), json!(42));
    let report = reported(session.call(other, &[]).unwrap_err());
    assert_eq!(report.code, codes::INVALID_FUNCTION_DEFINITION);
}

// ============================================================================
// Anonymous blocks and validation
// ============================================================================

/// Test anonymous blocks run once, are isolated and never cached
#[test]
fn test_execute_inline() {
    let (host, session) = open(Options::default());

    session.execute_inline("x = 1 pl.NOTICE('first ' .. x)").unwrap();
    session.execute_inline("pl.NOTICE('second ' .. tostring(x))").unwrap();

    let messages: Vec<_> = host.reports().into_iter().map(|r| r.message).collect();
    assert_eq!(messages, vec!["first 1", "second nil"]);
    assert_eq!(session.cache_stats().insertions, 0);
}

/// Test failures in anonymous blocks
#[test]
fn test_execute_inline_failure() {
    let (_host, session) = open(Options::default());

    let report = reported(session.execute_inline("error('inline failed')").unwrap_err());
    assert_eq!(report.code, codes::SCRIPT_EXCEPTION);

    let report = reported(session.execute_inline("if then").unwrap_err());
    assert_eq!(report.code, codes::SYNTAX_ERROR);

    let report = reported(
        session
            .execute_inline("pl.xact(function() pl.ERROR('nope', { code = '22000' }) end)")
            .unwrap_err(),
    );
    assert_eq!(report.code.as_str(), "22000");
}

/// Test validation compiles without running or caching
#[test]
fn test_validate() {
    let (host, session) = open(Options::default());
    let good = host.define("public", "good", "pl.NOTICE('top level ran') function main() end");
    let bad = host.define("public", "bad", "function main( return 1 end");

    session.validate(good).unwrap();
    assert!(host.reports().is_empty());
    assert!(session.cached_unit(good).is_none());

    let report = reported(session.validate(bad).unwrap_err());
    assert_eq!(report.code, codes::SYNTAX_ERROR);
    assert!(report.fields.detail.is_some());
}

// ============================================================================
// Options and lifecycle
// ============================================================================

/// Test options load from a JSON file
#[test]
fn test_options_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{ "entry_point": "run", "statement_timeout": 5000, "max_scope_depth": 4 }}"#
    )
    .unwrap();

    let options = Options::from_json_file(file.path()).unwrap();
    assert_eq!(options.entry_point, "run");
    assert_eq!(options.statement_timeout, Some(Duration::from_secs(5)));
    assert_eq!(options.max_scope_depth, 4);
    assert_eq!(options.safepoint_interval, Options::default().safepoint_interval);

    let (host, session) = open(options);
    let id = host.define("public", "runner", "function run() return 'ok' end");
    assert_eq!(session.call(id, &[]).unwrap(), json!("ok"));
}

/// Test shutdown drops everything the session held
#[test]
fn test_shutdown() {
    let (host, session) = open(Options::default());
    let id = host.define("public", "one", "function main() return 1 end");
    session.call(id, &[]).unwrap();
    assert!(session.cached_unit(id).is_some());

    session.shutdown();
    assert!(host.open_subtransactions().is_empty());
}
