// Transaction Scope Tests for plua
// These tests verify LIFO resolution of nested subtransactions, the nesting
// limit and failed-scope handling, both on the stack and through scripts

use plua::error::codes;
use plua::host::{Host, MemoryHost};
use plua::scope::{Resolution, ScopeHandle, ScopeStack, ScopeStatus};
use plua::{Error, HostErrorReport, Options, Session, Severity};
use proptest::prelude::*;
use rand::Rng;
use serde_json::json;
use std::sync::Arc;

fn setup(options: Options) -> (Arc<MemoryHost>, Session) {
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

/// Test nested blocks commit innermost first
#[test]
fn test_nested_commit() {
    let (host, session) = setup(Options::default());
    let id = host.define(
        "public",
        "nested",
        r#"
        function main()
          return pl.xact(function()
            return pl.xact(function() return 5 end) + 1
          end)
        end
        "#,
    );

    assert_eq!(session.call(id, &[]).unwrap(), json!(6));
    assert_eq!(host.begins(), 2);
    assert_eq!(host.releases(), 2);
    assert_eq!(host.rollbacks(), 0);
    assert!(host.open_subtransactions().is_empty());
}

/// Test the bare `xact` global is the same block as `pl.xact`
#[test]
fn test_xact_global() {
    let (host, session) = setup(Options::default());
    let id = host.define(
        "public",
        "global_xact",
        "function main() return { same = xact == pl.xact, v = xact(function() return 1 end) } end",
    );

    assert_eq!(session.call(id, &[]).unwrap(), json!({"same": true, "v": 1}));
    assert_eq!(host.releases(), 1);
}

/// Test an error aborts only the scopes it crosses
#[test]
fn test_error_aborts_inner_scope() {
    let (host, session) = setup(Options::default());
    let id = host.define(
        "public",
        "partial",
        r#"
        function main()
          return pl.xact(function()
            local ok = pcall(pl.xact, function() error("inner") end)
            return ok
          end)
        end
        "#,
    );

    assert_eq!(session.call(id, &[]).unwrap(), json!(false));
    assert_eq!(host.rollbacks(), 1);
    assert_eq!(host.releases(), 1);
}

/// Test a host error swallowed inside a scope prevents its commit
#[test]
fn test_failed_scope_cannot_commit() {
    let (host, session) = setup(Options::default());
    let id = host.define(
        "public",
        "swallow",
        r#"
        function main()
          return pl.xact(function()
            pcall(pl.ERROR, "boom")
            return 1
          end)
        end
        "#,
    );

    let report = reported(session.call(id, &[]).unwrap_err());
    assert_eq!(report.code, codes::IN_FAILED_TRANSACTION);
    assert_eq!(host.rollbacks(), 1);
    assert_eq!(host.releases(), 0);
}

/// Test a host error swallowed outside any scope fails the call
#[test]
fn test_failed_root() {
    let (host, session) = setup(Options::default());
    let id = host.define(
        "public",
        "root",
        "function main() pcall(pl.ERROR, 'boom') return 1 end",
    );
    let ok = host.define("public", "ok", "function main() return 1 end");

    let report = reported(session.call(id, &[]).unwrap_err());
    assert_eq!(report.code, codes::IN_FAILED_TRANSACTION);

    // The failure does not leak into the next call.
    assert_eq!(session.call(ok, &[]).unwrap(), json!(1));
}

/// Test a plain script error swallowed by pcall does not fail the scope
#[test]
fn test_plain_error_does_not_fail_scope() {
    let (host, session) = setup(Options::default());
    let id = host.define(
        "public",
        "plain",
        "function main() return pl.xact(function() pcall(error, 'x') return 2 end) end",
    );

    assert_eq!(session.call(id, &[]).unwrap(), json!(2));
    assert_eq!(host.releases(), 1);
}

/// Test the nesting limit
#[test]
fn test_nesting_limit() {
    let (host, session) = setup(Options::default().max_scope_depth(3));
    let id = host.define(
        "public",
        "deep",
        r#"
        function main(n)
          if n == 0 then return "bottom" end
          return pl.xact(function() return main(n - 1) end)
        end
        "#,
    );

    assert_eq!(session.call(id, &[json!(3)]).unwrap(), json!("bottom"));
    host.clear_events();

    let report = reported(session.call(id, &[json!(5)]).unwrap_err());
    assert_eq!(report.code, codes::SAVEPOINT_EXCEPTION);
    assert_eq!(host.begins(), 3);
    assert_eq!(host.rollbacks(), 3);
    assert_eq!(host.releases(), 0);
}

/// Test manual handles commit, abort and report their status
#[test]
fn test_manual_handle() {
    let (host, session) = setup(Options::default());
    let id = host.define(
        "public",
        "manual",
        r#"
        function main()
          local a = pl.transaction()
          local s0 = a:status()
          a:enter()
          local s1 = tostring(a)
          a:commit()
          local b = pl.transaction()
          b:enter()
          b:abort()
          return { s0, s1, a:status(), b:status() }
        end
        "#,
    );

    let out = session.call(id, &[]).unwrap();
    assert_eq!(out, json!(["new", "transaction (open)", "committed", "aborted"]));
    assert_eq!(host.releases(), 1);
    assert_eq!(host.rollbacks(), 1);
}

/// Test misuse of a manual handle
#[test]
fn test_manual_handle_misuse() {
    let (host, session) = setup(Options::default());
    let twice = host.define(
        "public",
        "twice",
        "function main() local t = pl.transaction() t:enter() t:commit() t:commit() end",
    );
    let unentered = host.define(
        "public",
        "unentered",
        "function main() pl.transaction():abort() end",
    );

    let report = reported(session.call(twice, &[]).unwrap_err());
    assert_eq!(report.code, codes::SAVEPOINT_EXCEPTION);
    let report = reported(session.call(unentered, &[]).unwrap_err());
    assert_eq!(report.code, codes::SAVEPOINT_EXCEPTION);
    assert_eq!(host.releases(), 1);
}

/// Test resolving an outer handle before an inner one is refused
#[test]
fn test_out_of_order_resolution() {
    let (host, session) = setup(Options::default());
    let id = host.define(
        "public",
        "order",
        r#"
        function main()
          local outer = pl.transaction()
          local inner = pl.transaction()
          outer:enter()
          inner:enter()
          local ok, err = pcall(outer.commit, outer)
          local status = outer:status()
          inner:commit()
          outer:commit()
          return { ok = ok, code = pl.errcode(err), status = status }
        end
        "#,
    );

    let out = session.call(id, &[]).unwrap();
    assert_eq!(out, json!({"ok": false, "code": "3B000", "status": "open"}));
    assert_eq!(host.releases(), 2);
    assert_eq!(host.rollbacks(), 0);
}

/// Test a block that leaves a manual scope open is aborted whole
#[test]
fn test_block_leaving_scope_open() {
    let (host, session) = setup(Options::default());
    let id = host.define(
        "public",
        "leak",
        "function main() return pl.xact(function() pl.transaction():enter() return 1 end) end",
    );

    let report = reported(session.call(id, &[]).unwrap_err());
    assert_eq!(report.code, codes::SAVEPOINT_EXCEPTION);
    assert_eq!(host.rollbacks(), 2);
    assert!(host.open_subtransactions().is_empty());
    assert_eq!(session.scope_depth(), 0);
}

/// Test a host failure to open a subtransaction
#[test]
fn test_begin_failure() {
    let (host, session) = setup(Options::default());
    host.fail_next_begin(HostErrorReport::new(
        Severity::Error,
        plua::SqlState::parse("53000").unwrap(),
        "out of resources",
    ));
    let id = host.define("public", "begin", "function main() return pl.xact(function() return 1 end) end");

    let report = reported(session.call(id, &[]).unwrap_err());
    assert_eq!(report.message, "out of resources");
    assert_eq!(host.releases(), 0);

    assert_eq!(session.call(id, &[]).unwrap(), json!(1));
}

/// Test random interleavings of enter and resolve keep the host balanced
#[test]
fn test_random_interleavings() {
    let mut rng = rand::rng();
    for _ in 0..50 {
        let host = Arc::new(MemoryHost::new());
        let mut stack = ScopeStack::new(host.clone(), 16);
        let mut open: Vec<ScopeHandle> = Vec::new();

        for _ in 0..rng.random_range(1..64) {
            match rng.random_range(0..3) {
                0 => match stack.enter() {
                    Ok(handle) => open.push(handle),
                    Err(e) => {
                        assert!(matches!(e, Error::ScopeLimit { limit: 16 }));
                        assert_eq!(open.len(), 16);
                    }
                },
                1 => {
                    if let Some(handle) = open.pop() {
                        let resolution = if rng.random_bool(0.5) {
                            Resolution::Commit
                        } else {
                            Resolution::Abort
                        };
                        stack.resolve(handle, resolution).unwrap();
                    }
                }
                _ => {
                    if open.len() >= 2 {
                        let outer = open[rng.random_range(0..open.len() - 1)];
                        assert!(matches!(
                            stack.resolve(outer, Resolution::Commit),
                            Err(Error::ScopeOrder { .. })
                        ));
                    }
                }
            }
            assert_eq!(stack.depth(), open.len());
            assert_eq!(host.open_subtransactions().len(), open.len());
        }

        stack.unwind_to(0);
        assert!(host.open_subtransactions().is_empty());
        assert_eq!(host.begins(), host.releases() + host.rollbacks());
    }
}

#[derive(Debug, Clone)]
enum Op {
    Enter,
    Commit,
    Abort,
    ResolveOuter,
    Fail,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Enter),
        2 => Just(Op::Commit),
        1 => Just(Op::Abort),
        1 => Just(Op::ResolveOuter),
        1 => Just(Op::Fail),
    ]
}

proptest! {
    /// Test only the innermost scope can ever be resolved
    #[test]
    fn prop_lifo_resolution(ops in prop::collection::vec(op(), 1..100)) {
        let host = Arc::new(MemoryHost::new());
        let mut stack = ScopeStack::new(host.clone(), 8);
        let mut open: Vec<(ScopeHandle, bool)> = Vec::new();

        for op in ops {
            match op {
                Op::Enter => {
                    if open.len() < 8 {
                        let handle = stack.enter().unwrap();
                        prop_assert_eq!(handle.depth(), open.len() + 1);
                        open.push((handle, false));
                    } else {
                        let is_limit = matches!(stack.enter(), Err(Error::ScopeLimit { .. }));
                        prop_assert!(is_limit);
                    }
                }
                Op::Commit => {
                    if let Some((handle, failed)) = open.pop() {
                        let result = stack.resolve(handle, Resolution::Commit);
                        if failed {
                            prop_assert_eq!(result.unwrap_err().sqlstate(), codes::IN_FAILED_TRANSACTION);
                        } else {
                            prop_assert_eq!(result.unwrap(), ScopeStatus::Committed);
                        }
                    }
                }
                Op::Abort => {
                    if let Some((handle, _)) = open.pop() {
                        prop_assert_eq!(stack.resolve(handle, Resolution::Abort).unwrap(), ScopeStatus::Aborted);
                    }
                }
                Op::ResolveOuter => {
                    if open.len() >= 2 {
                        let (outer, _) = open[0];
                        let refused = matches!(stack.resolve(outer, Resolution::Abort), Err(Error::ScopeOrder { .. }));
                        prop_assert!(refused);
                    }
                }
                Op::Fail => {
                    stack.mark_failed();
                    if let Some(top) = open.last_mut() {
                        top.1 = true;
                    }
                }
            }
            prop_assert_eq!(stack.depth(), open.len());
            prop_assert_eq!(stack.current(), open.last().map(|(h, _)| *h));
        }

        prop_assert_eq!(stack.unwind_to(0), open.len());
        prop_assert!(host.open_subtransactions().is_empty());
        prop_assert_eq!(host.begins(), host.releases() + host.rollbacks());
    }
}

/// Test the host trait object can drive a stack directly
#[test]
fn test_stack_over_trait_object() {
    let host: Arc<dyn Host> = Arc::new(MemoryHost::new());
    let mut stack = ScopeStack::new(Arc::clone(&host), 2);
    let a = stack.enter().unwrap();
    let b = stack.enter().unwrap();
    assert_eq!(stack.abort_through(a).unwrap(), ScopeStatus::Aborted);
    assert_eq!(stack.depth(), 0);
    assert!(matches!(stack.resolve(b, Resolution::Commit), Err(Error::ScopeOrder { .. })));
}
