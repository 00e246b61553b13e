//! Bucket-based ratelimiter for REST APIs that advertise their limits
//! through response headers.
//!
//! The limiter learns the mapping from route families to server-assigned
//! bucket hashes as responses come in, keeps a FIFO queue per bucket, and
//! drains each queue with a self-scheduling worker task that respects the
//! bucket's advertised window and a process-wide global gate.
//!
//! Consumers hand the limiter [`Work`] items carrying an opaque dispatch
//! closure; the limiter decides when each item runs, retries items that hit
//! a 429, and reports response headers back through [`RateLimiter::handle_response`].
//!
//! This crate is HTTP-client agnostic and can be reused on its own, for
//! example inside a proxy.

#![deny(
    clippy::all,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms,
    rustdoc::broken_intra_doc_links,
    unsafe_code,
    unused
)]
#![allow(clippy::module_name_repetitions, clippy::semicolon_if_nothing_returned)]

pub mod endpoint;
pub mod headers;
pub mod work;

mod bucket;
mod error;

pub use self::{
    endpoint::{Endpoint, Method},
    error::{RatelimiterError, RatelimiterErrorType},
    headers::RatelimitHeaders,
    work::{ExecuteFn, ExecuteFuture, SkipReason, Work, WorkBuilder, WorkStatus},
};

use self::bucket::{Bucket, BucketWorker};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::{runtime::Handle, task::JoinHandle, time::Instant};

/// How often orphaned buckets are swept out.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Prefix of the default hash used before a route family's real hash is
/// known.
pub const UNLIMITED_PREFIX: &str = "unlimited+";

/// Bounded wait for the state lock; exceeding it indicates lock corruption.
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// A 429 within this window of the previous one on the same bucket is
/// logged at warning level.
const REPEAT_429_WINDOW: Duration = Duration::from_secs(60);

/// Compose a bucket's identity from its hash and major parameter key.
fn bucket_id(hash: &str, major: &str) -> String {
    let mut id = String::with_capacity(hash.len() + 1 + major.len());
    id.push_str(hash);
    id.push(':');
    id.push_str(major);

    id
}

/// Shared deadline before which no bucket may dispatch.
///
/// Set by 429 responses carrying the global header or originating from the
/// CDN edge. The gate may be shared between several limiters.
#[derive(Clone, Debug, Default)]
pub struct GlobalGate {
    until: Arc<Mutex<Option<Instant>>>,
}

impl GlobalGate {
    /// Create an unlocked gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Suppress dispatch everywhere until the deadline.
    pub fn lock_until(&self, deadline: Instant) {
        self.until.lock().replace(deadline);
    }

    /// The current deadline, if one is set and has not passed.
    pub fn until(&self) -> Option<Instant> {
        let mut until = self.until.lock();

        match *until {
            Some(deadline) if deadline > Instant::now() => Some(deadline),
            Some(_) => {
                *until = None;

                None
            }
            None => None,
        }
    }

    /// Time left until the gate opens, if it is closed.
    pub fn remaining(&self) -> Option<Duration> {
        self.until()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// Snapshot of a bucket's advertised window.
#[derive(Clone, Debug)]
pub struct BucketInfo {
    /// Total requests allotted per window.
    pub limit: u64,
    /// Requests left in the current window.
    pub remaining: u64,
    /// When the window resets, if known.
    pub reset_at: Option<Instant>,
}

/// Mutable limiter state, all serialized under one lock.
#[derive(Debug, Default)]
pub(crate) struct LimiterState {
    /// Buckets by `hash:major` identity.
    pub(crate) buckets: HashMap<String, Bucket>,
    /// Learned route family → hash assignments.
    pub(crate) hashes: HashMap<String, String>,
    /// Buckets that currently have a live worker task.
    pub(crate) workers: HashSet<String>,
}

#[derive(Debug)]
pub(crate) struct Inner {
    cleanup: Mutex<Option<JoinHandle<()>>>,
    pub(crate) global: GlobalGate,
    handle: Handle,
    relative_reset: bool,
    shutdown: AtomicBool,
    state: Mutex<LimiterState>,
}

impl Inner {
    pub(crate) fn try_state(&self) -> Result<parking_lot::MutexGuard<'_, LimiterState>, RatelimiterError> {
        self.state
            .try_lock_for(LOCK_TIMEOUT)
            .ok_or_else(RatelimiterError::lock_timeout)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Spawn a worker for the bucket unless one is already live.
    ///
    /// Must be called with the state lock held; the workers set is what
    /// keeps dispatch serial per bucket.
    pub(crate) fn schedule_locked(
        self: &Arc<Self>,
        state: &mut LimiterState,
        bucket_id: &str,
        delay: Duration,
    ) {
        if !state.workers.insert(bucket_id.to_owned()) {
            return;
        }

        tracing::debug!(bucket = %bucket_id, ?delay, "scheduling bucket worker");

        let worker = BucketWorker::new(bucket_id.to_owned(), Arc::clone(self));
        self.handle.spawn(async move {
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }

            worker.run().await;
        });
    }

    /// Drop skipped requests and orphaned buckets.
    ///
    /// A bucket is removed only when its queue is empty and it is either
    /// still on the default hash, past its reset, or the limiter is
    /// shutting down. Dropped requests get their skip callback so no queued
    /// call resolves silently.
    fn cleanup_locked(state: &mut LimiterState, shutting_down: bool) {
        for bucket in state.buckets.values_mut() {
            let queue = std::mem::take(&mut bucket.queue);

            for work in queue {
                match work.skip_reason() {
                    Some(reason) => work.skip(reason),
                    None => bucket.queue.push_back(work),
                }
            }
        }

        let now = Instant::now();
        state.buckets.retain(|id, bucket| {
            let expired = bucket.reset_at.map_or(true, |at| at <= now);
            let removable = bucket.queue.is_empty()
                && (bucket.is_unlimited() || expired || shutting_down);

            if removable {
                tracing::debug!(bucket = %id, "removing orphaned bucket");
            }

            !removable
        });
    }
}

/// Rate-limit-aware dispatch queue.
///
/// Cheap to clone; all clones share state. Construct one through
/// [`RateLimiter::new`], queue work with [`RateLimiter::queue`], and feed
/// every response's headers back through [`RateLimiter::handle_response`].
#[derive(Clone, Debug)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    /// Create a limiter running its workers and cleanup sweep on the given
    /// runtime handle.
    ///
    /// `relative_reset` selects which reset header refreshes buckets:
    /// `x-ratelimit-reset-after` (a relative duration) when `true`,
    /// `x-ratelimit-reset` (an absolute unix timestamp) when `false`.
    pub fn new(handle: Handle, global: GlobalGate, relative_reset: bool) -> Self {
        let inner = Arc::new(Inner {
            cleanup: Mutex::new(None),
            global,
            handle,
            relative_reset,
            shutdown: AtomicBool::new(false),
            state: Mutex::new(LimiterState::default()),
        });

        let task = inner.handle.spawn(cleanup_sweep(Arc::downgrade(&inner)));
        inner.cleanup.lock().replace(task);

        Self { inner }
    }

    /// Create a limiter on the current runtime with its own global gate.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn current(relative_reset: bool) -> Self {
        Self::new(Handle::current(), GlobalGate::new(), relative_reset)
    }

    /// The global gate shared by every bucket of this limiter.
    pub fn global(&self) -> &GlobalGate {
        &self.inner.global
    }

    /// Queue a work item onto its bucket, scheduling a worker if none is
    /// live.
    ///
    /// # Errors
    ///
    /// Returns a [`RatelimiterErrorType::Stopped`] error type if the
    /// limiter has been shut down, and a
    /// [`RatelimiterErrorType::LockTimeout`] error type if the state lock
    /// could not be acquired.
    pub fn queue(&self, work: Work) -> Result<(), RatelimiterError> {
        if self.inner.is_shutdown() {
            return Err(RatelimiterError::stopped());
        }

        let mut state = self.inner.try_state()?;
        let id = Self::bucket_id_for(&state, work.endpoint());
        tracing::debug!(bucket = %id, endpoint = %work.endpoint(), "queueing request");

        let bucket = state
            .buckets
            .entry(id.clone())
            .or_insert_with(|| Bucket::new(id.clone()));
        bucket.queue.push_back(work);

        let delay = bucket.delay(self.inner.global.until());
        Inner::schedule_locked(&self.inner, &mut state, &id, delay);

        Ok(())
    }

    /// Delay before a request to the endpoint may be dispatched.
    ///
    /// The global gate applies even when no bucket exists for the endpoint
    /// yet; an unknown bucket contributes no delay of its own and is not
    /// created.
    ///
    /// # Errors
    ///
    /// Returns a [`RatelimiterErrorType::LockTimeout`] error type if the
    /// state lock could not be acquired.
    pub fn delay_for(&self, endpoint: &Endpoint) -> Result<Duration, RatelimiterError> {
        let mut state = self.inner.try_state()?;
        let global = self.inner.global.until();
        let id = Self::bucket_id_for(&state, endpoint);

        Ok(match state.buckets.get_mut(&id) {
            Some(bucket) => bucket.delay(global),
            None => global.map_or(Duration::ZERO, |until| {
                until.saturating_duration_since(Instant::now())
            }),
        })
    }

    /// Feed a response's ratelimit information back into the limiter.
    ///
    /// Records newly learned bucket hashes, refreshes the bucket's window,
    /// and on a 429 closes either the global gate (global header present,
    /// or `cloudflare` set because no `via` header was seen) or the bucket
    /// itself.
    ///
    /// Returns the bucket's delay iff the status is 429, so callers can
    /// tell a retried request from a completed one.
    ///
    /// # Errors
    ///
    /// Returns a [`RatelimiterErrorType::LockTimeout`] error type if the
    /// state lock could not be acquired.
    pub fn handle_response(
        &self,
        endpoint: &Endpoint,
        status: u16,
        headers: &RatelimitHeaders,
        cloudflare: bool,
    ) -> Result<Option<Duration>, RatelimiterError> {
        let mut state = self.inner.try_state()?;
        let route = endpoint.bucket_route();

        // Learn the hash first: a 429'd or successful response alike may
        // migrate the route off its default bucket.
        if let RatelimitHeaders::Present(present) = headers {
            if let Some(hash) = present.bucket() {
                let known = state.hashes.get(&route).map(String::as_str);

                if known != Some(hash) {
                    tracing::debug!(%route, %hash, "learned bucket hash for route");
                    state.hashes.insert(route.clone(), hash.to_owned());
                }
            }
        }

        let id = Self::bucket_id_for(&state, endpoint);

        if status == 429 {
            let retry_after =
                Duration::from_millis(headers.retry_after().unwrap_or_default());
            let now = Instant::now();
            let global = cloudflare
                || match headers {
                    RatelimitHeaders::GlobalLimited(_) => true,
                    RatelimitHeaders::Limited(_) | RatelimitHeaders::None => false,
                    RatelimitHeaders::Present(present) => present.global(),
                };

            if global {
                tracing::warn!(%route, ?retry_after, "globally ratelimited");
                self.inner.global.lock_until(now + retry_after);
            } else {
                let bucket = state
                    .buckets
                    .entry(id.clone())
                    .or_insert_with(|| Bucket::new(id.clone()));
                bucket.remaining = 0;
                bucket.reset_at = Some(now + retry_after);

                match bucket.last_429 {
                    Some(previous) if now.saturating_duration_since(previous) < REPEAT_429_WINDOW => {
                        tracing::warn!(bucket = %id, ?retry_after, "ratelimited again on bucket");
                    }
                    _ => {
                        tracing::debug!(bucket = %id, ?retry_after, "ratelimited on bucket");
                    }
                }

                bucket.last_429 = Some(now);
            }

            let global_until = self.inner.global.until();
            let delay = match state.buckets.get_mut(&id) {
                Some(bucket) => bucket.delay(global_until),
                None => self.inner.global.remaining().unwrap_or(retry_after),
            };

            return Ok(Some(delay));
        }

        // Without a hash there is nothing trustworthy to record.
        if let RatelimitHeaders::Present(present) = headers {
            if present.bucket().is_some() {
                let bucket = state
                    .buckets
                    .entry(id.clone())
                    .or_insert_with(|| Bucket::new(id.clone()));

                bucket.limit = present.limit();
                bucket.remaining = present.remaining();

                if let Some(reset_at) = self.reset_instant(present) {
                    bucket.reset_at = Some(reset_at);
                }

                tracing::trace!(
                    bucket = %id,
                    limit = bucket.limit,
                    remaining = bucket.remaining,
                    "updated bucket from headers",
                );
            }
        }

        Ok(None)
    }

    /// Cancel every queued work item that is neither priority nor already
    /// cancelled, returning how many were cancelled.
    ///
    /// # Errors
    ///
    /// Returns a [`RatelimiterErrorType::LockTimeout`] error type if the
    /// state lock could not be acquired.
    pub fn cancel_all(&self) -> Result<usize, RatelimiterError> {
        let state = self.inner.try_state()?;
        let mut cancelled = 0;

        for bucket in state.buckets.values() {
            for work in &bucket.queue {
                if !work.priority() && !work.status().is_cancelled() {
                    work.status().cancel();
                    cancelled += 1;
                }
            }
        }

        Ok(cancelled)
    }

    /// Stop the cleanup sweep, run one final sweep, and refuse all further
    /// [`queue`] calls.
    ///
    /// Already-queued work keeps draining; combine with [`cancel_all`] to
    /// drop it.
    ///
    /// [`cancel_all`]: Self::cancel_all
    /// [`queue`]: Self::queue
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(task) = self.inner.cleanup.lock().take() {
            task.abort();
        }

        if let Ok(mut state) = self.inner.try_state() {
            Inner::cleanup_locked(&mut state, true);
        }
    }

    /// Whether the limiter has been shut down.
    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }

    /// Snapshot of the endpoint's bucket, if one exists.
    ///
    /// # Errors
    ///
    /// Returns a [`RatelimiterErrorType::LockTimeout`] error type if the
    /// state lock could not be acquired.
    pub fn bucket(&self, endpoint: &Endpoint) -> Result<Option<BucketInfo>, RatelimiterError> {
        let state = self.inner.try_state()?;
        let id = Self::bucket_id_for(&state, endpoint);

        Ok(state.buckets.get(&id).map(|bucket| BucketInfo {
            limit: bucket.limit,
            remaining: bucket.remaining,
            reset_at: bucket.reset_at,
        }))
    }

    /// Whether a bucket exists for the endpoint.
    ///
    /// # Errors
    ///
    /// Returns a [`RatelimiterErrorType::LockTimeout`] error type if the
    /// state lock could not be acquired.
    pub fn has(&self, endpoint: &Endpoint) -> Result<bool, RatelimiterError> {
        let state = self.inner.try_state()?;
        let id = Self::bucket_id_for(&state, endpoint);

        Ok(state.buckets.contains_key(&id))
    }

    /// The learned hash for the endpoint's route family, if any.
    ///
    /// # Errors
    ///
    /// Returns a [`RatelimiterErrorType::LockTimeout`] error type if the
    /// state lock could not be acquired.
    pub fn route_hash(&self, endpoint: &Endpoint) -> Result<Option<String>, RatelimiterError> {
        let state = self.inner.try_state()?;

        Ok(state.hashes.get(&endpoint.bucket_route()).cloned())
    }

    /// Resolve the bucket identity for an endpoint, falling back to the
    /// default `unlimited+` hash until the real one is learned.
    fn bucket_id_for(state: &LimiterState, endpoint: &Endpoint) -> String {
        let route = endpoint.bucket_route();

        match state.hashes.get(&route) {
            Some(hash) => bucket_id(hash, endpoint.major()),
            None => {
                let mut hash = String::with_capacity(UNLIMITED_PREFIX.len() + route.len());
                hash.push_str(UNLIMITED_PREFIX);
                hash.push_str(&route);

                bucket_id(&hash, endpoint.major())
            }
        }
    }

    /// Turn the response's reset information into an instant, honoring the
    /// configured header interpretation.
    fn reset_instant(&self, present: &headers::Present) -> Option<Instant> {
        let now = Instant::now();

        if self.inner.relative_reset {
            present
                .reset_after()
                .map(|ms| now + Duration::from_millis(ms))
        } else {
            present.reset().map(|unix_ms| {
                let now_unix = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64;

                now + Duration::from_millis(unix_ms.saturating_sub(now_unix))
            })
        }
    }
}

/// Periodic sweep over the bucket map.
///
/// Holds only a weak handle so an abandoned limiter can drop.
async fn cleanup_sweep(inner: Weak<Inner>) {
    let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
    interval.tick().await;

    loop {
        interval.tick().await;

        let Some(inner) = inner.upgrade() else {
            return;
        };

        if inner.is_shutdown() {
            return;
        }

        let state_result = inner.try_state();
        if let Ok(mut state) = state_result {
            Inner::cleanup_locked(&mut state, false);
        }
    }
}
