//! Transaction scope stack.
//!
//! Scripts nest host subtransactions through scopes. The stack enforces strict
//! LIFO resolution: only the innermost open scope may be committed or aborted.
//! A scope in which a host-originated error occurred is marked failed and can
//! no longer be committed.

use crate::error::{codes, Error, Result, Severity};
use crate::exception::BridgedException;
use crate::host::{Host, SubxactId};
use std::sync::Arc;

/// Identifies one entered scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeHandle {
    id: u64,
    depth: usize,
}

impl ScopeHandle {
    /// Unique id within the session.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Nesting depth, 1 for the outermost scope.
    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// How a scope is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Keep the scope's effects.
    Commit,
    /// Discard the scope's effects.
    Abort,
}

/// Outcome of a resolved scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeStatus {
    /// Effects were kept.
    Committed,
    /// Effects were discarded.
    Aborted,
}

#[derive(Debug)]
struct Scope {
    handle: ScopeHandle,
    subxact: SubxactId,
    failed: bool,
}

/// Stack of open transaction scopes over a [`Host`].
pub struct ScopeStack {
    host: Arc<dyn Host>,
    scopes: Vec<Scope>,
    max_depth: usize,
    next_id: u64,
    root_failed: bool,
}

impl ScopeStack {
    /// Creates an empty stack allowing at most `max_depth` open scopes.
    pub fn new(host: Arc<dyn Host>, max_depth: usize) -> Self {
        Self {
            host,
            scopes: Vec::new(),
            max_depth,
            next_id: 0,
            root_failed: false,
        }
    }

    /// Opens a nested scope.
    pub fn enter(&mut self) -> Result<ScopeHandle> {
        if self.scopes.len() >= self.max_depth {
            return Err(Error::ScopeLimit {
                limit: self.max_depth,
            });
        }
        let subxact = match self.host.begin_subtransaction() {
            Ok(id) => id,
            Err(report) => {
                self.mark_failed();
                return Err(report.into());
            }
        };

        self.next_id += 1;
        let handle = ScopeHandle {
            id: self.next_id,
            depth: self.scopes.len() + 1,
        };
        self.scopes.push(Scope {
            handle,
            subxact,
            failed: false,
        });
        log::debug!("entered scope {} at depth {}", handle.id, handle.depth);
        Ok(handle)
    }

    /// Resolves the innermost scope.
    ///
    /// Committing a failed scope aborts it and returns an
    /// in-failed-transaction error.
    pub fn resolve(&mut self, handle: ScopeHandle, resolution: Resolution) -> Result<ScopeStatus> {
        let scope = self.pop_innermost(handle)?;
        match resolution {
            Resolution::Commit if scope.failed => {
                self.rollback(&scope)?;
                Err(Error::exception(in_failed_transaction()))
            }
            Resolution::Commit => {
                if let Err(report) = self.host.release_subtransaction(scope.subxact) {
                    self.mark_failed();
                    return Err(report.into());
                }
                log::debug!("committed scope {}", handle.id);
                Ok(ScopeStatus::Committed)
            }
            Resolution::Abort => {
                self.rollback(&scope)?;
                Ok(ScopeStatus::Aborted)
            }
        }
    }

    /// Aborts `handle`, force-aborting any scopes still open inside it first.
    pub fn abort_through(&mut self, handle: ScopeHandle) -> Result<ScopeStatus> {
        if !self.scopes.iter().any(|s| s.handle == handle) {
            return Err(self.order_error(handle));
        }
        let forced = self.unwind_to(handle.depth);
        if forced > 0 {
            log::warn!("aborted {} unresolved scope(s) inside scope {}", forced, handle.id);
        }
        self.resolve(handle, Resolution::Abort)
    }

    /// Marks the innermost scope failed, or the root when no scope is open.
    pub fn mark_failed(&mut self) {
        match self.scopes.last_mut() {
            Some(scope) => scope.failed = true,
            None => self.root_failed = true,
        }
    }

    /// True when the innermost scope (or the root) is failed.
    pub fn is_failed(&self) -> bool {
        self.scopes.last().map_or(self.root_failed, |s| s.failed)
    }

    /// Number of open scopes.
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// The innermost open scope.
    pub fn current(&self) -> Option<ScopeHandle> {
        self.scopes.last().map(|s| s.handle)
    }

    /// Aborts scopes until only `depth` remain. Returns how many were aborted.
    pub fn unwind_to(&mut self, depth: usize) -> usize {
        let mut aborted = 0;
        while self.scopes.len() > depth {
            if let Some(scope) = self.scopes.pop() {
                if let Err(e) = self.rollback(&scope) {
                    log::warn!("rollback of scope {} failed: {}", scope.handle.id, e);
                }
                aborted += 1;
            }
        }
        aborted
    }

    /// Returns and clears the root failure flag.
    pub fn take_root_failed(&mut self) -> bool {
        std::mem::take(&mut self.root_failed)
    }

    fn pop_innermost(&mut self, handle: ScopeHandle) -> Result<Scope> {
        match self.scopes.last() {
            Some(top) if top.handle == handle => {}
            _ => return Err(self.order_error(handle)),
        }
        self.scopes.pop().ok_or_else(|| self.order_error(handle))
    }

    fn order_error(&self, handle: ScopeHandle) -> Error {
        let detail = match self.scopes.last() {
            Some(top) => format!("scope {} must be resolved first", top.handle.id),
            None => "no scope is open".to_string(),
        };
        Error::ScopeOrder {
            handle: handle.id,
            detail,
        }
    }

    fn rollback(&mut self, scope: &Scope) -> Result<()> {
        if let Err(report) = self.host.rollback_subtransaction(scope.subxact) {
            self.mark_failed();
            return Err(report.into());
        }
        log::debug!("aborted scope {}", scope.handle.id);
        Ok(())
    }
}

/// The error for work attempted in a failed scope.
pub fn in_failed_transaction() -> BridgedException {
    BridgedException::new(
        Severity::Error,
        codes::IN_FAILED_TRANSACTION,
        "current transaction is aborted, commands ignored until end of transaction block",
    )
}
