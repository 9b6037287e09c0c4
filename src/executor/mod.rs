//! # Remote Executor Protocol
//!
//! The boundary between captured queries and whatever engine runs them. An
//! executor accepts a realized [`QueryContext`] and either runs it to
//! completion or serves it incrementally through numbered cursors.
//!
//! Cursor reads are strictly sequential per request id: the client must wait
//! for one read to resolve before issuing the next. Overlapping reads are a
//! programmer error and surface as [`crate::TidewireError::Unsafe`] without
//! touching the wire. Closing a cursor is idempotent and doubles as
//! cancellation for change feeds, which never terminate on their own.

#[cfg(any(test, feature = "mock"))]
pub mod mock;

#[cfg(any(test, feature = "mock"))]
pub use mock::MockEngine;

use crate::error::{TidewireError, TidewireResult};
use crate::ir::QueryContext;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by the executor protocol.
///
/// These cover connectivity failures, malformed or unsupported contexts, and
/// remote evaluation failures. Data-shaped outcomes such as per-row write
/// errors are reported inside result values instead.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// The executor could not be reached at all.
    #[error("executor unreachable: {0}")]
    Unreachable(String),

    /// The context was structurally invalid for this executor.
    #[error("malformed query: {0}")]
    Malformed(String),

    /// The context used an operation this executor does not implement.
    #[error("operation '{0}' is not supported by this executor")]
    Unsupported(String),

    /// The query reached the engine but failed while evaluating.
    #[error("evaluation failed: {0}")]
    Evaluation(String),
}

/// Result type alias for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// One increment of a cursor read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorStep {
    /// True when the cursor has no further items. Terminal steps carry no
    /// value.
    pub done: bool,

    /// The next item, absent on terminal steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl CursorStep {
    pub fn item(value: Value) -> Self {
        CursorStep {
            done: false,
            value: Some(value),
        }
    }

    pub fn finished() -> Self {
        CursorStep {
            done: true,
            value: None,
        }
    }
}

/// Transport-agnostic handle to a query engine.
///
/// Implementations are expected to be cheap to share behind an [`Arc`] and
/// to keep per-cursor state keyed by the client-assigned request id.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Runs a context to completion and returns its full result.
    async fn run_query(&self, ctx: &QueryContext) -> ProtocolResult<Value>;

    /// Reads the next item of the cursor identified by `request_id`,
    /// creating the cursor on first use. The same context is sent with
    /// every read so stateless transports can replay it.
    async fn read_cursor(&self, request_id: u64, ctx: &QueryContext) -> ProtocolResult<CursorStep>;

    /// Releases all state held for `request_id`. Safe to call repeatedly
    /// and after natural completion.
    async fn close_cursor(&self, request_id: u64) -> ProtocolResult<()>;
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Incremental consumer of a query result, or of a change feed when the
/// underlying chain ends in `changes`.
///
/// Dropping a cursor does not release engine-side state; call
/// [`Cursor::close`] when done with feeds or partially-consumed results.
pub struct Cursor {
    executor: Arc<dyn QueryExecutor>,
    ctx: QueryContext,
    request_id: u64,
    in_flight: AtomicBool,
    done: AtomicBool,
    closed: AtomicBool,
}

impl Cursor {
    pub(crate) fn open(executor: Arc<dyn QueryExecutor>, ctx: QueryContext) -> Cursor {
        let request_id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        log::debug!("opening cursor {} over {} steps", request_id, ctx.len());
        Cursor {
            executor,
            ctx,
            request_id,
            in_flight: AtomicBool::new(false),
            done: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Whether this cursor consumes a change feed rather than a finite
    /// result set.
    pub fn is_change_feed(&self) -> bool {
        self.ctx.last_id() == Some("changes")
    }

    /// Fetches the next item, or `None` once the cursor is exhausted or
    /// closed. Calling this concurrently from two tasks is a misuse of the
    /// protocol's sequential-read contract and fails with
    /// [`TidewireError::Unsafe`] before anything is sent.
    pub async fn next(&self) -> TidewireResult<Option<Value>> {
        if self.closed.load(Ordering::Acquire) || self.done.load(Ordering::Acquire) {
            return Ok(None);
        }
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return Err(TidewireError::Unsafe(format!(
                "overlapping read on cursor {}",
                self.request_id
            )));
        }
        let result = self.executor.read_cursor(self.request_id, &self.ctx).await;
        self.in_flight.store(false, Ordering::Release);
        let step = result?;
        if step.done {
            self.done.store(true, Ordering::Release);
        }
        match step.value {
            Some(value) => Ok(Some(value)),
            None if step.done => Ok(None),
            None => Err(TidewireError::Protocol(ProtocolError::Malformed(format!(
                "cursor {} returned an empty non-terminal step",
                self.request_id
            )))),
        }
    }

    /// Releases engine-side state for this cursor. For change feeds this is
    /// the cancellation signal. Repeated calls are no-ops.
    pub async fn close(&self) -> TidewireResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        log::debug!("closing cursor {}", self.request_id);
        self.executor.close_cursor(self.request_id).await?;
        Ok(())
    }

    /// Adapts the cursor into a stream of items. The stream ends when the
    /// cursor is exhausted; change feeds yield indefinitely until closed
    /// from another handle or the executor goes away.
    pub fn into_stream(self) -> impl Stream<Item = TidewireResult<Value>> {
        futures::stream::try_unfold(self, |cursor| async move {
            match cursor.next().await? {
                Some(value) => Ok(Some((value, cursor))),
                None => Ok(None),
            }
        })
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("request_id", &self.request_id)
            .field("change_feed", &self.is_change_feed())
            .field("done", &self.done.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
