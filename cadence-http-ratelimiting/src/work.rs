//! Queued work items and their lifecycle flags.
//!
//! A [`Work`] is one API call tracked by the ratelimiter. The limiter owns
//! queued work outright: it decides when the work is dispatched, re-queues
//! it at the front of its bucket after a 429, and drops it with a skip
//! callback when it was cancelled or its deadline passed. The actual HTTP
//! dispatch is an opaque closure supplied by the consumer, so this crate
//! never touches a request or response type.

use crate::Endpoint;
use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::Instant;

/// Future resolved by a work item's dispatch closure.
///
/// Resolves to `Some(delay)` iff the attempt observed a 429, in which case
/// the limiter re-queues the work and backs off for at least `delay`.
/// `None` means the work completed and its callbacks have been consumed.
pub type ExecuteFuture = Pin<Box<dyn Future<Output = Option<Duration>> + Send + 'static>>;

/// Dispatch closure of a work item.
///
/// The boolean argument requests local ratelimit handling: when set, a 429
/// is delivered to the caller instead of being re-queued.
pub type ExecuteFn = Box<dyn FnMut(bool) -> ExecuteFuture + Send + 'static>;

/// Callback fired when a work item is dropped before reaching transport.
pub type SkipFn = Box<dyn FnOnce(SkipReason) + Send + 'static>;

/// Why a work item was dropped before reaching transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum SkipReason {
    /// The work was cancelled, or its pre-flight check failed.
    Cancelled,
    /// The work's deadline passed while it was queued.
    DeadlineExpired,
}

/// Shared lifecycle flags of a work item.
///
/// The status is created by the consumer and stays valid after the work has
/// been handed to the limiter, so a queued call can still be cancelled.
/// Delivery is claimed through [`start_delivery`], which guarantees the
/// work's callbacks fire at most once in total.
///
/// [`start_delivery`]: Self::start_delivery
#[derive(Clone, Debug, Default)]
pub struct WorkStatus {
    cancelled: Arc<AtomicBool>,
    done: Arc<AtomicBool>,
}

impl WorkStatus {
    /// Create a fresh status.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a status whose cancellation is linked to this one but whose
    /// delivery slot is fresh.
    ///
    /// Chained calls share one cancel flag while each underlying request
    /// keeps its own at-most-once delivery guarantee.
    pub fn child(&self) -> Self {
        Self {
            cancelled: Arc::clone(&self.cancelled),
            done: Arc::default(),
        }
    }

    /// Flag the work as cancelled.
    ///
    /// The flag is re-checked when the work is popped from its bucket and
    /// immediately before HTTP dispatch.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether the work has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Claim the single delivery slot.
    ///
    /// Returns `false` if an outcome has already been delivered; the caller
    /// must then not fire any callback.
    pub fn start_delivery(&self) -> bool {
        !self.done.swap(true, Ordering::AcqRel)
    }

    /// Whether an outcome has been delivered.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// A single queued API call.
pub struct Work {
    deadline: Option<Instant>,
    endpoint: Endpoint,
    execute: ExecuteFn,
    on_skipped: Option<SkipFn>,
    priority: bool,
    status: WorkStatus,
}

impl Work {
    /// Create a builder for a work item.
    pub fn builder(endpoint: Endpoint, status: WorkStatus, execute: ExecuteFn) -> WorkBuilder {
        WorkBuilder(Self {
            deadline: None,
            endpoint,
            execute,
            on_skipped: None,
            priority: false,
            status,
        })
    }

    /// Rate-limit scope of the work.
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Whether the work survives [`RateLimiter::cancel_all`].
    ///
    /// [`RateLimiter::cancel_all`]: crate::RateLimiter::cancel_all
    pub const fn priority(&self) -> bool {
        self.priority
    }

    /// Shared lifecycle flags.
    pub const fn status(&self) -> &WorkStatus {
        &self.status
    }

    /// Why the work must be dropped rather than dispatched, if any reason
    /// applies right now.
    pub fn skip_reason(&self) -> Option<SkipReason> {
        if self.status.is_cancelled() || self.status.is_done() {
            return Some(SkipReason::Cancelled);
        }

        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                return Some(SkipReason::DeadlineExpired);
            }
        }

        None
    }

    /// Invoke the dispatch closure.
    pub(crate) fn execute(&mut self, handle_ratelimit_locally: bool) -> ExecuteFuture {
        (self.execute)(handle_ratelimit_locally)
    }

    /// Consume the work, firing its skip callback.
    pub(crate) fn skip(mut self, reason: SkipReason) {
        if let Some(on_skipped) = self.on_skipped.take() {
            on_skipped(reason);
        }
    }
}

impl Debug for Work {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Work")
            .field("deadline", &self.deadline)
            .field("endpoint", &self.endpoint)
            .field("priority", &self.priority)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`Work`] item.
pub struct WorkBuilder(Work);

impl WorkBuilder {
    /// Consume the builder, returning the built work.
    #[allow(clippy::missing_const_for_fn)]
    #[must_use = "work is not useful on its own and must be queued"]
    pub fn build(self) -> Work {
        self.0
    }

    /// Set an absolute deadline after which the work is skipped with
    /// [`SkipReason::DeadlineExpired`].
    pub const fn deadline(mut self, deadline: Instant) -> Self {
        self.0.deadline = Some(deadline);

        self
    }

    /// Set the callback fired when the work is dropped before transport.
    #[must_use = "builder must be completed with `build`"]
    pub fn on_skipped(mut self, on_skipped: SkipFn) -> Self {
        self.0.on_skipped.replace(on_skipped);

        self
    }

    /// Exempt the work from [`RateLimiter::cancel_all`].
    ///
    /// [`RateLimiter::cancel_all`]: crate::RateLimiter::cancel_all
    pub const fn priority(mut self, priority: bool) -> Self {
        self.0.priority = priority;

        self
    }
}

impl Debug for WorkBuilder {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_tuple("WorkBuilder").field(&self.0).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{SkipReason, Work, WorkStatus};
    use crate::{Endpoint, Method};
    use static_assertions::assert_impl_all;
    use std::{fmt::Debug, time::Duration};
    use tokio::time::Instant;

    assert_impl_all!(Work: Debug, Send);
    assert_impl_all!(WorkStatus: Clone, Debug, Default, Send, Sync);

    fn work(status: WorkStatus) -> super::WorkBuilder {
        Work::builder(
            Endpoint::new(Method::Get, "channels/{channel_id}", "1"),
            status,
            Box::new(|_| Box::pin(async { None })),
        )
    }

    #[test]
    fn delivery_claimed_once() {
        let status = WorkStatus::new();

        assert!(status.start_delivery());
        assert!(!status.start_delivery());
        assert!(status.is_done());
    }

    #[test]
    fn skip_reasons() {
        let status = WorkStatus::new();
        let fresh = work(status.clone()).build();
        assert_eq!(None, fresh.skip_reason());

        status.cancel();
        assert_eq!(Some(SkipReason::Cancelled), fresh.skip_reason());

        let expired = work(WorkStatus::new()).deadline(Instant::now()).build();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(Some(SkipReason::DeadlineExpired), expired.skip_reason());
    }
}
