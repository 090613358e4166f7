//! Concurrent document processing.
//!
//! - [`WorkerPool`]: fixed set of tokio tasks draining a shared
//!   [`WorkQueue`](crate::scheduler::WorkQueue)
//! - [`DocumentExecutor`]: takes one document through the pipeline, the
//!   output tree and the ledger
//! - [`RateLimiter`]: optional per-worker self-throttling
//! - [`AbortSignal`]: shared stop flag that remembers who raised it
//!
//! Problems with a single document are recorded and counted. Anything else
//! escaping a document (storage, repository outage) raises the abort signal,
//! and every worker stops after its current item.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::PublishError;

pub mod executor;
pub mod pool;
pub mod throttle;

pub use executor::DocumentExecutor;
pub use pool::{PoolReport, WorkerPool};
pub use throttle::RateLimiter;

/// Why a job was told to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortOrigin {
    Worker { worker: usize, reason: String },
    Threshold(String),
    Cancelled,
}

impl AbortOrigin {
    pub fn into_error(self) -> PublishError {
        match self {
            AbortOrigin::Worker { worker, reason } => PublishError::WorkerAborted { worker, reason },
            AbortOrigin::Threshold(message) => PublishError::ThresholdExceeded(message),
            AbortOrigin::Cancelled => PublishError::Cancelled,
        }
    }
}

/// Cancellation token plus the first recorded origin.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token: CancellationToken,
    origin: Arc<Mutex<Option<AbortOrigin>>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an existing token, e.g. one cancelled by the shutdown handler.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            origin: Arc::default(),
        }
    }

    /// Raise the signal. Only the first origin is kept.
    pub fn raise(&self, origin: AbortOrigin) {
        {
            let mut slot = self.origin.lock();
            if slot.is_none() {
                tracing::warn!(origin = ?origin, "Abort raised");
                *slot = Some(origin);
            }
        }
        self.token.cancel();
    }

    pub fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The recorded origin; a token cancelled from outside reads as
    /// [`AbortOrigin::Cancelled`].
    pub fn origin(&self) -> Option<AbortOrigin> {
        if !self.token.is_cancelled() {
            return None;
        }
        Some(self.origin.lock().clone().unwrap_or(AbortOrigin::Cancelled))
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
