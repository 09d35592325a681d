//! Per-request lifecycle state machine.
//!
//! ```text
//! Received -> CacheCheck -> CacheHit -> Respond
//!                        -> Reserve -> Authorize -> Authorized -> Execute -> StoreResult -> Respond
//!                                               -> Rejected -> Respond
//! Respond -> Done
//! ```
//!
//! Uncached requests go straight from `Received` to `Authorize`, and any stage
//! that produces an error reply may jump to `Respond`. A request responds
//! exactly once.

use std::fmt;

/// A stage of request processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Received,
    CacheCheck,
    CacheHit,
    Reserve,
    Authorize,
    Authorized,
    Rejected,
    Execute,
    StoreResult,
    Respond,
    Done,
}

impl Stage {
    /// Whether the machine may move from `self` to `to`.
    #[must_use]
    pub const fn can_advance(self, to: Self) -> bool {
        use Stage::{
            Authorize, Authorized, CacheCheck, CacheHit, Done, Execute, Received, Rejected,
            Reserve, Respond, StoreResult,
        };
        matches!(
            (self, to),
            (Received, CacheCheck | Authorize | Respond)
                // Backend failure skips caching for this request.
                | (CacheCheck, CacheHit | Reserve | Authorize | Respond)
                | (CacheHit, Respond)
                | (Reserve, Authorize | Respond)
                | (Authorize, Authorized | Rejected | Respond)
                | (Authorized, Execute)
                | (Rejected, Respond)
                | (Execute, StoreResult | Respond)
                | (StoreResult, Respond)
                | (Respond, Done)
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Misuse of the lifecycle; always a bug in the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("illegal lifecycle transition {from} -> {to}")]
    IllegalTransition { from: Stage, to: Stage },
    #[error("response already sent")]
    AlreadyResponded,
}

/// Tracks the current stage of one request.
#[derive(Debug)]
pub struct Lifecycle {
    call_id: u64,
    stage: Stage,
}

impl Lifecycle {
    #[must_use]
    pub const fn new(call_id: u64) -> Self {
        Self {
            call_id,
            stage: Stage::Received,
        }
    }

    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    /// Moves to `to`.
    ///
    /// # Errors
    ///
    /// `AlreadyResponded` once the request is done, `IllegalTransition` for
    /// any other edge not in the table.
    pub fn advance(&mut self, to: Stage) -> Result<(), LifecycleError> {
        if self.stage == Stage::Done {
            return Err(LifecycleError::AlreadyResponded);
        }
        if !self.stage.can_advance(to) {
            return Err(LifecycleError::IllegalTransition {
                from: self.stage,
                to,
            });
        }
        tracing::trace!(call_id = self.call_id, from = %self.stage, to = %to, "lifecycle");
        self.stage = to;
        Ok(())
    }

    /// Marks the response as emitted: `Respond` then `Done`.
    ///
    /// # Errors
    ///
    /// `AlreadyResponded` on a second call; `IllegalTransition` if the current
    /// stage may not respond.
    pub fn respond(&mut self) -> Result<(), LifecycleError> {
        if self.stage != Stage::Respond {
            self.advance(Stage::Respond)?;
        }
        self.advance(Stage::Done)
    }
}
