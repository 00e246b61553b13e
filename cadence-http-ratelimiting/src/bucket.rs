use crate::{
    work::{SkipReason, Work},
    Inner, UNLIMITED_PREFIX,
};
use std::{collections::VecDeque, mem, sync::Arc, time::Duration};
use tokio::time::Instant;

/// State of one rate-limit bucket.
///
/// A bucket is the unit of serial dispatch: at most one worker task runs its
/// queue at any time. Until the first response is seen the limit and
/// remaining count are unknown and dispatch is effectively unthrottled.
#[derive(Debug)]
pub(crate) struct Bucket {
    id: String,
    pub(crate) last_429: Option<Instant>,
    pub(crate) limit: u64,
    pub(crate) queue: VecDeque<Work>,
    pub(crate) remaining: u64,
    pub(crate) reset_at: Option<Instant>,
}

impl Bucket {
    pub fn new(id: String) -> Self {
        Self {
            id,
            last_429: None,
            limit: u64::MAX,
            queue: VecDeque::new(),
            remaining: u64::MAX,
            reset_at: None,
        }
    }

    /// Whether the bucket still uses the default hash, i.e. no response for
    /// its route family has carried a bucket header yet.
    pub fn is_unlimited(&self) -> bool {
        self.id.starts_with(UNLIMITED_PREFIX)
    }

    /// Delay before the next request may be dispatched from this bucket.
    ///
    /// The global deadline dominates the bucket's own reset. When the reset
    /// has passed, `remaining` is refreshed to `limit` and the bucket's own
    /// delay is zero.
    pub fn delay(&mut self, global_until: Option<Instant>) -> Duration {
        let now = Instant::now();
        let global = global_until.map_or(Duration::ZERO, |until| {
            until.saturating_duration_since(now)
        });

        let own = if self.remaining < 1 {
            match self.reset_at {
                Some(at) if at > now => at.saturating_duration_since(now),
                _ => {
                    self.remaining = self.limit;

                    Duration::ZERO
                }
            }
        } else {
            Duration::ZERO
        };

        global.max(own)
    }
}

/// Outcome of one pass over the worker's bucket, computed under the state
/// lock.
enum Next {
    /// Queue drained or bucket delayed; run the backoff step.
    Backoff,
    /// Dispatch this work.
    Run(Work),
    /// Drop this work without dispatching it.
    Skip(Work, SkipReason),
    /// Worker is no longer responsible for the bucket.
    Stop,
}

/// Self-scheduling task draining one bucket's queue.
///
/// The task holds only the bucket's id; the bucket itself lives in the
/// limiter's map and may be migrated or removed while the task sleeps.
pub(crate) struct BucketWorker {
    bucket_id: String,
    inner: Arc<Inner>,
}

impl BucketWorker {
    pub fn new(bucket_id: String, inner: Arc<Inner>) -> Self {
        Self { bucket_id, inner }
    }

    pub async fn run(mut self) {
        let span = tracing::debug_span!("bucket worker", bucket = %self.bucket_id);

        loop {
            let next = match self.advance() {
                Ok(next) => next,
                Err(source) => {
                    tracing::error!(parent: &span, "bucket worker stalled: {source}");

                    return;
                }
            };

            match next {
                Next::Backoff => return self.backoff(),
                Next::Run(work) => self.dispatch(work).await,
                Next::Skip(work, reason) => {
                    tracing::debug!(parent: &span, ?reason, "dropping skipped request");

                    work.skip(reason);
                }
                Next::Stop => return,
            }
        }
    }

    /// Inspect the bucket under the lock and decide the next step.
    fn advance(&self) -> Result<Next, crate::RatelimiterError> {
        let mut state = self.inner.try_state()?;
        let global = self.inner.global.until();

        let (work, unlimited) = {
            let Some(bucket) = state.buckets.get_mut(&self.bucket_id) else {
                state.workers.remove(&self.bucket_id);

                return Ok(Next::Stop);
            };

            if bucket.queue.is_empty() || bucket.delay(global) > Duration::ZERO {
                return Ok(Next::Backoff);
            }

            let work = bucket.queue.pop_front().expect("queue is non-empty");

            (work, bucket.is_unlimited())
        };

        if let Some(reason) = work.skip_reason() {
            return Ok(Next::Skip(work, reason));
        }

        // The route may have learned its real hash since this work was
        // queued under the default bucket. Hand the whole queue over and let
        // the real bucket's worker take it from here, so the learned limits
        // apply before anything else is dispatched.
        if unlimited {
            let route = work.endpoint().bucket_route();

            if let Some(hash) = state.hashes.get(&route).cloned() {
                let real_id = crate::bucket_id(&hash, work.endpoint().major());
                tracing::debug!(
                    from = %self.bucket_id,
                    to = %real_id,
                    "migrating queue to learned bucket",
                );

                let mut moved = state
                    .buckets
                    .get_mut(&self.bucket_id)
                    .map(|bucket| mem::take(&mut bucket.queue))
                    .unwrap_or_default();
                moved.push_front(work);

                let delay = {
                    let real = state
                        .buckets
                        .entry(real_id.clone())
                        .or_insert_with(|| Bucket::new(real_id.clone()));

                    while let Some(item) = moved.pop_back() {
                        real.queue.push_front(item);
                    }

                    real.delay(global)
                };

                state.workers.remove(&self.bucket_id);
                Inner::schedule_locked(&self.inner, &mut state, &real_id, delay);

                return Ok(Next::Stop);
            }
        }

        Ok(Next::Run(work))
    }

    /// Dispatch a work item outside the lock.
    ///
    /// A 429 puts the work back at the front of the queue: it keeps its
    /// slot and is retried once the bucket's delay passes.
    async fn dispatch(&mut self, mut work: Work) {
        let retry_after = work.execute(false).await;

        if retry_after.is_none() {
            return;
        }

        tracing::debug!(
            bucket = %self.bucket_id,
            delay = ?retry_after,
            "request was ratelimited, requeueing at the front",
        );

        match self.inner.try_state() {
            Ok(mut state) => {
                let bucket = state
                    .buckets
                    .entry(self.bucket_id.clone())
                    .or_insert_with(|| Bucket::new(self.bucket_id.clone()));

                bucket.queue.push_front(work);
            }
            Err(source) => {
                tracing::error!("could not requeue ratelimited request: {source}");
            }
        }
    }

    /// Leave the scheduled-worker map, rescheduling if the queue refilled.
    fn backoff(&self) {
        let Ok(mut state) = self.inner.try_state() else {
            tracing::error!(bucket = %self.bucket_id, "bucket worker lost its state lock");

            return;
        };

        state.workers.remove(&self.bucket_id);

        let global = self.inner.global.until();
        let (empty, delay) = match state.buckets.get_mut(&self.bucket_id) {
            Some(bucket) => (bucket.queue.is_empty(), bucket.delay(global)),
            None => return,
        };

        if !empty {
            Inner::schedule_locked(&self.inner, &mut state, &self.bucket_id, delay);
        } else if self.inner.is_shutdown() {
            state.buckets.remove(&self.bucket_id);
        }
    }
}
