//! Request/response correlation with timeout eviction.
//!
//! Pending calls live in a [`DashMap`] keyed by `UniqueId`, so `call` may run
//! on any thread while the tick thread sweeps timeouts and matches replies.
//! Every entry ends in exactly one terminal transition: reply, timeout, or
//! failure (channel closed, send failed).
//!
//! A reply that arrives after its entry was evicted finds nothing and is
//! ignored. That is expected steady-state behavior, not a fault.
//!
//! # Example
//!
//! ```ignore
//! let handle = channel.call(LoginRequest::new(42, "player"))?;
//! // ... ticks run elsewhere ...
//! let response = handle.await?;
//! let reply = response.downcast_ref::<LoginReply>().unwrap();
//! ```

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{NetworkError, Result};
use crate::events::{EventHub, SubscriptionId};
use crate::message::Message;

/// Smallest accepted RPC timeout.
pub const MIN_RPC_TIMEOUT: Duration = Duration::from_millis(3000);

/// Why a call did not produce a response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// No matching reply within the timeout.
    #[error("RPC {unique_id} timed out after {timeout:?}")]
    Timeout {
        /// Correlation id of the request.
        unique_id: u32,
        /// Configured timeout.
        timeout: Duration,
    },

    /// The channel closed while the call was pending.
    #[error("Channel closed before the RPC completed")]
    ChannelClosed,

    /// The request could not be sent.
    #[error("Failed to send RPC request: {0}")]
    SendFailed(String),
}

/// Terminal result of a call.
pub type RpcOutcome = std::result::Result<Arc<dyn Message>, RpcError>;

/// RPC lifecycle notification.
#[derive(Debug, Clone)]
pub enum RpcEvent {
    /// A new call was registered.
    Started {
        /// Correlation id.
        unique_id: u32,
        /// The request.
        request: Arc<dyn Message>,
    },
    /// A matching reply arrived.
    Finished {
        /// Correlation id.
        unique_id: u32,
        /// The reply.
        response: Arc<dyn Message>,
    },
    /// The matching reply carried a non-zero error code. Follows `Finished`.
    ErrorCode {
        /// Correlation id.
        unique_id: u32,
        /// Error code from the reply.
        code: i32,
        /// The reply.
        response: Arc<dyn Message>,
    },
    /// The call ended without a reply.
    Failed {
        /// Correlation id.
        unique_id: u32,
        /// The original request, for diagnostics.
        request: Arc<dyn Message>,
        /// Reason.
        error: RpcError,
    },
}

struct PendingCall {
    request: Arc<dyn Message>,
    elapsed: Duration,
    completion: watch::Sender<Option<RpcOutcome>>,
}

/// Pending-call table for one channel.
pub struct RpcState {
    timeout: Duration,
    pending: DashMap<u32, PendingCall>,
    events: EventHub<RpcEvent>,
}

impl RpcState {
    /// Create the table.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `timeout` is below [`MIN_RPC_TIMEOUT`].
    pub fn new(timeout: Duration) -> Result<Self> {
        if timeout < MIN_RPC_TIMEOUT {
            return Err(NetworkError::InvalidConfig(format!(
                "RPC timeout {:?} is below the minimum of {:?}",
                timeout, MIN_RPC_TIMEOUT
            )));
        }

        Ok(Self {
            timeout,
            pending: DashMap::new(),
            events: EventHub::new(),
        })
    }

    /// Configured timeout.
    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a call and return its completion handle.
    ///
    /// Calling again with a `UniqueId` that is still pending returns a handle
    /// on the existing completion instead of creating a second entry.
    pub fn call(&self, request: Arc<dyn Message>) -> RpcHandle {
        self.register(request).0
    }

    /// Like [`RpcState::call`], also reporting whether a new entry was created.
    pub(crate) fn register(&self, request: Arc<dyn Message>) -> (RpcHandle, bool) {
        let unique_id = request.unique_id();
        let (handle, created) = match self.pending.entry(unique_id) {
            Entry::Occupied(entry) => {
                let rx = entry.get().completion.subscribe();
                (RpcHandle::new(unique_id, rx), false)
            }
            Entry::Vacant(entry) => {
                let (completion, rx) = watch::channel(None);
                entry.insert(PendingCall {
                    request: request.clone(),
                    elapsed: Duration::ZERO,
                    completion,
                });
                (RpcHandle::new(unique_id, rx), true)
            }
        };

        if created {
            debug!(unique_id, "RPC started");
            self.events.emit(&RpcEvent::Started { unique_id, request });
        } else {
            debug!(unique_id, "RPC already pending, sharing completion");
        }
        (handle, created)
    }

    /// Complete the pending call matching `response`.
    ///
    /// Returns false if `response` is not response-shaped or no call with its
    /// `UniqueId` is pending.
    pub fn try_reply(&self, response: Arc<dyn Message>) -> bool {
        let Some(code) = response.error_code() else {
            return false;
        };
        let unique_id = response.unique_id();
        let Some((_, call)) = self.pending.remove(&unique_id) else {
            debug!(unique_id, "Reply without pending call ignored");
            return false;
        };

        call.completion.send_replace(Some(Ok(response.clone())));
        debug!(unique_id, code, "RPC finished");

        self.events.emit(&RpcEvent::Finished {
            unique_id,
            response: response.clone(),
        });
        if code != 0 {
            self.events.emit(&RpcEvent::ErrorCode {
                unique_id,
                code,
                response,
            });
        }
        true
    }

    /// Advance every pending call by `delta` and evict the expired ones.
    ///
    /// Returns the number of calls that timed out.
    pub fn update(&self, delta: Duration) -> usize {
        let mut expired = Vec::new();
        for mut entry in self.pending.iter_mut() {
            entry.elapsed += delta;
            if entry.elapsed >= self.timeout {
                expired.push(*entry.key());
            }
        }

        let mut evicted = 0;
        for unique_id in expired {
            if let Some((_, call)) = self.pending.remove(&unique_id) {
                warn!(unique_id, timeout = ?self.timeout, "RPC timed out");
                self.finish_failed(
                    unique_id,
                    call,
                    RpcError::Timeout {
                        unique_id,
                        timeout: self.timeout,
                    },
                );
                evicted += 1;
            }
        }
        evicted
    }

    /// Fail one pending call. Returns false if it was not pending.
    pub fn fail(&self, unique_id: u32, error: RpcError) -> bool {
        match self.pending.remove(&unique_id) {
            Some((_, call)) => {
                self.finish_failed(unique_id, call, error);
                true
            }
            None => false,
        }
    }

    /// Fail every pending call. Returns how many were failed.
    pub fn fail_all(&self, error: RpcError) -> usize {
        let ids: Vec<u32> = self.pending.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter(|unique_id| self.fail(*unique_id, error.clone()))
            .count()
    }

    fn finish_failed(&self, unique_id: u32, call: PendingCall, error: RpcError) {
        call.completion.send_replace(Some(Err(error.clone())));
        self.events.emit(&RpcEvent::Failed {
            unique_id,
            request: call.request,
            error,
        });
    }

    /// Number of pending calls.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Check whether `unique_id` is pending.
    pub fn is_pending(&self, unique_id: u32) -> bool {
        self.pending.contains_key(&unique_id)
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&RpcEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    /// Remove a lifecycle subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }
}

/// Completion handle for one call.
///
/// Await it (it implements [`IntoFuture`]) or poll with
/// [`RpcHandle::try_result`]. Handles for the same pending call observe the
/// same outcome.
#[derive(Clone)]
pub struct RpcHandle {
    unique_id: u32,
    rx: watch::Receiver<Option<RpcOutcome>>,
}

impl RpcHandle {
    fn new(unique_id: u32, rx: watch::Receiver<Option<RpcOutcome>>) -> Self {
        Self { unique_id, rx }
    }

    /// Correlation id of the call.
    #[inline]
    pub fn unique_id(&self) -> u32 {
        self.unique_id
    }

    /// Outcome if the call already finished.
    pub fn try_result(&self) -> Option<RpcOutcome> {
        self.rx.borrow().clone()
    }

    /// Wait for the outcome.
    pub async fn response(mut self) -> RpcOutcome {
        let outcome = self
            .rx
            .wait_for(Option::is_some)
            .await
            .map(|value| (*value).clone());

        match outcome {
            Ok(Some(outcome)) => outcome,
            // the table was dropped with the call still pending
            _ => Err(RpcError::ChannelClosed),
        }
    }

    /// Check whether two handles observe the same call.
    pub fn same_call(&self, other: &RpcHandle) -> bool {
        self.rx.same_channel(&other.rx)
    }
}

impl IntoFuture for RpcHandle {
    type Output = RpcOutcome;
    type IntoFuture = Pin<Box<dyn Future<Output = RpcOutcome> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.response())
    }
}

impl std::fmt::Debug for RpcHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcHandle")
            .field("unique_id", &self.unique_id)
            .field("finished", &self.rx.borrow().is_some())
            .finish()
    }
}
