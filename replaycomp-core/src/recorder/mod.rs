//! Operation recorder
//!
//! Memoizes the outcome of every recorded `(receiver, operation, arguments)`
//! key. Three scopes decide where reads and writes go:
//!
//! - **Global**: process-wide entries shared by all units, stored in a
//!   concurrent map. Active when no other scope was entered on the thread.
//! - **Unit**: entries of one unit of work, stored in a thread-local ordered
//!   map. Reads fall back to the Global entries.
//! - **Ignored**: nothing is read or written.
//!
//! Scopes are entered per thread and released by dropping the returned
//! [`ScopeGuard`], which restores the previously active scope.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::error::{ReplayCompError, Result};
use crate::provider::ProviderRef;
use crate::special::ResultOrMarker;
use crate::value::{Operation, ThrownError, Value};

/// Lookup key of a recorded operation
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct OperationKey {
    receiver: ProviderRef,
    operation: Operation,
    args: Arc<[Value]>,
}

impl OperationKey {
    pub fn new(receiver: ProviderRef, operation: Operation, args: impl Into<Arc<[Value]>>) -> Self {
        Self {
            receiver,
            operation,
            args: args.into(),
        }
    }

    pub fn receiver(&self) -> &ProviderRef {
        &self.receiver
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }
}

impl fmt::Debug for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}.{}", self.receiver, self.operation.name())?;
        f.debug_list().entries(self.args.iter()).finish()
    }
}

/// A recorded operation with its outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedOperation {
    pub receiver: ProviderRef,
    pub operation: Operation,
    pub args: Arc<[Value]>,
    pub result: ResultOrMarker,
}

impl RecordedOperation {
    pub fn new(
        receiver: ProviderRef,
        operation: Operation,
        args: impl Into<Arc<[Value]>>,
        result: ResultOrMarker,
    ) -> Self {
        Self {
            receiver,
            operation,
            args: args.into(),
            result,
        }
    }

    fn from_entry(key: OperationKey, result: ResultOrMarker) -> Self {
        Self {
            receiver: key.receiver,
            operation: key.operation,
            args: key.args,
            result,
        }
    }
}

/// The scope reads and writes currently go to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Global,
    Unit,
    Ignored,
}

struct GlobalEntry {
    sequence: u64,
    result: ResultOrMarker,
}

type UnitMap = Rc<RefCell<IndexMap<OperationKey, ResultOrMarker>>>;

enum FrameKind {
    Unit(UnitMap),
    Ignored,
}

struct ScopeFrame {
    recorder: u64,
    token: u64,
    kind: FrameKind,
}

thread_local! {
    static SCOPES: RefCell<Vec<ScopeFrame>> = const { RefCell::new(Vec::new()) };
}

static NEXT_RECORDER_ID: AtomicU64 = AtomicU64::new(0);
static NEXT_SCOPE_TOKEN: AtomicU64 = AtomicU64::new(0);

enum ActiveScope {
    Global,
    Unit(UnitMap),
    Ignored,
}

/// Scoped key to result store
pub struct OperationRecorder {
    id: u64,
    global: DashMap<OperationKey, GlobalEntry>,
    sequence: AtomicU64,
}

impl OperationRecorder {
    pub fn new() -> Self {
        Self {
            id: NEXT_RECORDER_ID.fetch_add(1, Ordering::Relaxed),
            global: DashMap::new(),
            sequence: AtomicU64::new(0),
        }
    }

    fn active(&self) -> ActiveScope {
        SCOPES.with(|scopes| {
            match scopes.borrow().iter().rev().find(|f| f.recorder == self.id) {
                None => ActiveScope::Global,
                Some(ScopeFrame {
                    kind: FrameKind::Unit(map),
                    ..
                }) => ActiveScope::Unit(Rc::clone(map)),
                Some(ScopeFrame {
                    kind: FrameKind::Ignored,
                    ..
                }) => ActiveScope::Ignored,
            }
        })
    }

    /// The scope active on the calling thread
    pub fn current_scope(&self) -> ScopeKind {
        match self.active() {
            ActiveScope::Global => ScopeKind::Global,
            ActiveScope::Unit(_) => ScopeKind::Unit,
            ActiveScope::Ignored => ScopeKind::Ignored,
        }
    }

    fn enter(&self, kind: FrameKind) -> ScopeGuard {
        let token = NEXT_SCOPE_TOKEN.fetch_add(1, Ordering::Relaxed);
        SCOPES.with(|scopes| {
            scopes.borrow_mut().push(ScopeFrame {
                recorder: self.id,
                token,
                kind,
            })
        });
        ScopeGuard {
            recorder: self.id,
            token,
            _not_send: PhantomData,
        }
    }

    /// Start a unit of work on this thread
    pub fn enter_unit_scope(&self) -> ScopeGuard {
        debug!(recorder = self.id, "Entering unit scope");
        self.enter(FrameKind::Unit(Rc::new(RefCell::new(IndexMap::new()))))
    }

    /// Suppress recording on this thread until the guard is dropped
    pub fn enter_ignored_scope(&self) -> ScopeGuard {
        debug!(recorder = self.id, "Entering ignored scope");
        self.enter(FrameKind::Ignored)
    }

    /// The memoized outcome for `key`, or `NoResult`
    pub fn get_result_or_marker(&self, key: &OperationKey) -> ResultOrMarker {
        match self.active() {
            ActiveScope::Ignored => ResultOrMarker::NO_RESULT,
            ActiveScope::Unit(map) => {
                if let Some(found) = map.borrow().get(key) {
                    return found.clone();
                }
                self.global_result(key)
            }
            ActiveScope::Global => self.global_result(key),
        }
    }

    fn global_result(&self, key: &OperationKey) -> ResultOrMarker {
        self.global
            .get(key)
            .map(|e| e.result.clone())
            .unwrap_or(ResultOrMarker::NO_RESULT)
    }

    /// Memoize an outcome; a later write for the same key replaces it
    pub fn record(&self, key: OperationKey, result: ResultOrMarker) {
        if result.is_no_result() {
            return;
        }
        match self.active() {
            ActiveScope::Ignored => {}
            ActiveScope::Unit(map) => {
                let previous = map.borrow_mut().insert(key.clone(), result.clone());
                warn_overwrite(&key, previous.as_ref(), &result);
            }
            ActiveScope::Global => match self.global.entry(key) {
                Entry::Occupied(mut occupied) => {
                    warn_overwrite(occupied.key(), Some(&occupied.get().result), &result);
                    occupied.get_mut().result = result;
                }
                Entry::Vacant(vacant) => {
                    let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
                    vacant.insert(GlobalEntry { sequence, result });
                }
            },
        }
    }

    pub fn record_return(&self, key: OperationKey, value: Value) {
        self.record(key, ResultOrMarker::from_return(value));
    }

    pub fn record_exception(&self, key: OperationKey, error: ThrownError) {
        self.record(key, ResultOrMarker::from_thrown(error));
    }

    /// Global entries followed by the entries of the active unit
    ///
    /// Fails unless a Unit scope is active on the calling thread.
    pub fn current_recorded_operations(&self) -> Result<Vec<RecordedOperation>> {
        let ActiveScope::Unit(map) = self.active() else {
            return Err(ReplayCompError::ScopeViolation(
                "recorded operations requested outside a unit scope".into(),
            ));
        };
        let unit = map.borrow();

        let mut global: Vec<(u64, RecordedOperation)> = self
            .global
            .iter()
            .filter(|entry| !unit.contains_key(entry.key()))
            .map(|entry| {
                (
                    entry.value().sequence,
                    RecordedOperation::from_entry(entry.key().clone(), entry.value().result.clone()),
                )
            })
            .collect();
        global.sort_by_key(|(sequence, _)| *sequence);

        let mut operations: Vec<RecordedOperation> =
            global.into_iter().map(|(_, op)| op).collect();
        operations.extend(
            unit.iter()
                .map(|(key, result)| RecordedOperation::from_entry(key.clone(), result.clone())),
        );
        Ok(operations)
    }

    /// Number of process-wide entries
    pub fn global_len(&self) -> usize {
        self.global.len()
    }
}

impl Default for OperationRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OperationRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRecorder")
            .field("id", &self.id)
            .field("global_entries", &self.global.len())
            .finish()
    }
}

fn warn_overwrite(key: &OperationKey, previous: Option<&ResultOrMarker>, result: &ResultOrMarker) {
    if let Some(previous) = previous
        && previous != result
    {
        warn!(
            key = ?key,
            previous = ?previous,
            result = ?result,
            "Overwriting recorded result"
        );
    }
}

/// Releases a recorder scope when dropped
///
/// Bound to the thread that entered the scope.
#[must_use = "the scope is released as soon as the guard is dropped"]
pub struct ScopeGuard {
    recorder: u64,
    token: u64,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        SCOPES.with(|scopes| {
            let mut scopes = scopes.borrow_mut();
            let Some(position) = scopes.iter().rposition(|f| f.token == self.token) else {
                return;
            };
            if position + 1 != scopes.len() {
                warn!(
                    recorder = self.recorder,
                    "Recorder scope released out of order"
                );
            }
            scopes.remove(position);
        });
    }
}

impl fmt::Debug for ScopeGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeGuard")
            .field("recorder", &self.recorder)
            .field("token", &self.token)
            .finish()
    }
}

#[cfg(test)]
mod tests;
