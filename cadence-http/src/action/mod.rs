//! Deferred, chainable API operations.
//!
//! A [`RestAction`] describes one API call (or a composition of calls)
//! without performing it. The terminal operations decide how the outcome is
//! delivered: [`queue`] fires callbacks on the callback pool, [`submit`]
//! resolves a future, and [`complete`] blocks a non-runtime thread.
//!
//! Operators compose lazily and nothing happens until a terminal runs.
//!
//! [`complete`]: RestAction::complete
//! [`queue`]: RestAction::queue
//! [`submit`]: RestAction::submit

use crate::{
    api_error::ApiError,
    client::Client,
    error::Error,
    json,
    requester::{OutcomeFn, RequestBody, WorkContext},
    response::RestResponse,
    routing::CompiledRoute,
    transport::TransportErrorType,
};
use bytes::Bytes;
use cadence_http_ratelimiting::{ExecuteFuture, SkipReason, Work, WorkStatus};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use std::{
    cell::Cell,
    fmt::{Debug, Formatter, Result as FmtResult},
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};
use tokio::{sync::oneshot, time::Instant};

thread_local! {
    /// Set while a user callback runs, to refuse deadlocking `complete()`
    /// calls from inside one.
    static CALLBACK_CONTEXT: Cell<bool> = Cell::new(false);
}

/// Whether the current thread is running a user callback.
pub(crate) fn in_callback_context() -> bool {
    CALLBACK_CONTEXT.with(Cell::get)
}

/// Run `f` with the callback-context flag set, restoring it afterwards.
pub(crate) fn enter_callback_context<R>(f: impl FnOnce() -> R) -> R {
    struct Reset(bool);

    impl Drop for Reset {
        fn drop(&mut self) {
            CALLBACK_CONTEXT.with(|flag| flag.set(self.0));
        }
    }

    let previous = CALLBACK_CONTEXT.with(|flag| flag.replace(true));
    let _reset = Reset(previous);

    f()
}

/// Success callback of a queued action.
pub type SuccessFn<T> = Box<dyn FnOnce(T) + Send + 'static>;

/// Failure callback of a queued action.
pub type FailureFn = Box<dyn FnOnce(Error) + Send + 'static>;

/// Translates a raw response into the action's value.
pub(crate) type HandlerFn<T> = Arc<dyn Fn(RestResponse) -> Result<T, Error> + Send + Sync>;

type CheckFn = Arc<dyn Fn() -> bool + Send + Sync>;

type Completion<T> = Box<dyn FnOnce(Result<T, Error>) + Send>;

type OperatorFn<T> = Box<dyn FnOnce(DispatchCtx, Completion<T>) + Send>;

type DeferredRouteFn = Box<dyn FnOnce() -> Result<CompiledRoute, Error> + Send>;

/// Constraints inherited down an operator chain at dispatch time.
#[derive(Clone)]
struct DispatchCtx {
    check: Option<CheckFn>,
    deadline: Option<Instant>,
    local: bool,
    priority: bool,
    status: WorkStatus,
}

/// Source of the compiled route, fixed or produced at dispatch time.
enum RouteSource {
    Compiled(CompiledRoute),
    Deferred(DeferredRouteFn),
}

/// State of a not-yet-composed request action.
struct RequestParts<T> {
    body: Option<RequestBody>,
    handler: HandlerFn<T>,
    headers: HeaderMap,
    overwrite_headers: bool,
    route: RouteSource,
}

enum ActionKind<T> {
    /// Terminal already-resolved outcome; ignores checks and deadlines.
    Completed(Result<T, Error>),
    /// An operator wrapping another action.
    Operator(OperatorFn<T>),
    /// A plain request.
    Request(RequestParts<T>),
}

/// Handle to cancel an action chain after it has been dispatched.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    status: WorkStatus,
}

impl CancelHandle {
    /// Cancel the chain; pending work resolves with a cancelled failure.
    pub fn cancel(&self) {
        self.status.cancel();
    }
}

/// A lazily-executed, chainable API operation yielding a `T`.
pub struct RestAction<T> {
    check: Option<CheckFn>,
    client: Client,
    deadline: Option<Instant>,
    kind: ActionKind<T>,
    priority: bool,
    status: WorkStatus,
}

impl<T: Send + 'static> RestAction<T> {
    fn from_kind(client: Client, kind: ActionKind<T>) -> Self {
        Self {
            check: None,
            client,
            deadline: None,
            kind,
            priority: false,
            status: WorkStatus::new(),
        }
    }

    pub(crate) fn new_request(client: Client, route: CompiledRoute, handler: HandlerFn<T>) -> Self {
        Self::from_kind(
            client,
            ActionKind::Request(RequestParts {
                body: None,
                handler,
                headers: HeaderMap::new(),
                overwrite_headers: false,
                route: RouteSource::Compiled(route),
            }),
        )
    }

    pub(crate) fn new_deferred(
        client: Client,
        route: DeferredRouteFn,
        handler: HandlerFn<T>,
    ) -> Self {
        Self::from_kind(
            client,
            ActionKind::Request(RequestParts {
                body: None,
                handler,
                headers: HeaderMap::new(),
                overwrite_headers: false,
                route: RouteSource::Deferred(route),
            }),
        )
    }

    /// An action that resolves to `value` without touching the network.
    pub fn completed(client: &Client, value: T) -> Self {
        Self::from_kind(client.clone(), ActionKind::Completed(Ok(value)))
    }

    /// An action that fails with `error` without touching the network.
    pub fn error(client: &Client, error: Error) -> Self {
        Self::from_kind(client.clone(), ActionKind::Completed(Err(error)))
    }

    /// Set the request body.
    ///
    /// Only meaningful on a plain request; composed actions ignore it.
    pub fn body(mut self, bytes: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        if let ActionKind::Request(parts) = &mut self.kind {
            parts.body = Some(RequestBody {
                bytes: bytes.into(),
                content_type: content_type.into(),
            });
        } else {
            tracing::warn!("body() after composing operators has no effect");
        }

        self
    }

    /// Set the request body to a value serialized as JSON.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorType::Json`] error type if serialization fails.
    ///
    /// [`ErrorType::Json`]: crate::error::ErrorType::Json
    pub fn json_body(self, value: &impl Serialize) -> Result<Self, Error> {
        let bytes = json::to_vec(value).map_err(Error::json)?;

        Ok(self.body(bytes, "application/json"))
    }

    /// Add a custom request header.
    ///
    /// Custom headers overwrite the assembled defaults only after
    /// [`overwrite_headers`] has been enabled.
    ///
    /// [`overwrite_headers`]: Self::overwrite_headers
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        if let ActionKind::Request(parts) = &mut self.kind {
            parts.headers.insert(name, value);
        } else {
            tracing::warn!("header() after composing operators has no effect");
        }

        self
    }

    /// Permit custom headers to overwrite the assembled defaults.
    pub fn overwrite_headers(mut self, overwrite: bool) -> Self {
        if let ActionKind::Request(parts) = &mut self.kind {
            parts.overwrite_headers = overwrite;
        }

        self
    }

    /// Add a pre-flight check; a `false` result fails the action with a
    /// cancelled error instead of dispatching it.
    pub fn check(mut self, check: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.check = merge_checks(self.check.take(), Some(Arc::new(check)));

        self
    }

    /// Set the absolute deadline.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);

        self
    }

    /// Set the deadline to `timeout` from now, keeping an earlier explicit
    /// deadline if one was already set.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + timeout);
        }

        self
    }

    /// Exempt the dispatched work from [`Client::cancel_all`].
    ///
    /// [`Client::cancel_all`]: crate::client::Client::cancel_all
    pub fn priority(mut self, priority: bool) -> Self {
        self.priority = priority;

        self
    }

    /// Cancel the action; any dispatched work resolves with a cancelled
    /// failure.
    pub fn cancel(&self) {
        self.status.cancel();
    }

    /// A handle that can cancel the chain after a terminal consumed it.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            status: self.status.clone(),
        }
    }

    /// Transform the value.
    pub fn map<U: Send + 'static>(self, f: impl FnOnce(T) -> U + Send + 'static) -> RestAction<U> {
        self.operator(move |inner, ctx, completion| {
            inner.dispatch_with(ctx, Box::new(move |result| completion(result.map(f))));
        })
    }

    /// Transform the value fallibly; an `Err` becomes the action's failure.
    pub fn try_map<U: Send + 'static>(
        self,
        f: impl FnOnce(T) -> Result<U, Error> + Send + 'static,
    ) -> RestAction<U> {
        self.operator(move |inner, ctx, completion| {
            inner.dispatch_with(ctx, Box::new(move |result| completion(result.and_then(f))));
        })
    }

    /// Chain a subsequent action produced from the value.
    ///
    /// The chained action inherits this action's checks and deadline, and
    /// its callbacks happen strictly after this action's own outcome.
    pub fn flat_map<U: Send + 'static>(
        self,
        f: impl FnOnce(T) -> RestAction<U> + Send + 'static,
    ) -> RestAction<U> {
        self.operator(move |inner, ctx, completion| {
            let child_ctx = ctx.clone();

            inner.dispatch_with(
                ctx,
                Box::new(move |result| match result {
                    Ok(value) => f(value).dispatch_with(child_ctx, completion),
                    Err(error) => completion(Err(error)),
                }),
            );
        })
    }

    /// Wait `delay` on the rate-limit scheduler pool before dispatching.
    pub fn delay(self, delay: Duration) -> Self {
        self.operator(move |inner, ctx, completion| {
            let handle = inner.client.ratelimit_handle().clone();

            handle.spawn(async move {
                tokio::time::sleep(delay).await;
                inner.dispatch_with(ctx, completion);
            });
        })
    }

    /// Run both actions concurrently, resolving when both have.
    ///
    /// Failure of either side cancels the other and fails the pair.
    pub fn zip<U: Send + 'static>(self, other: RestAction<U>) -> RestAction<(T, U)> {
        self.operator(move |inner, ctx, completion| {
            let state = Arc::new(Mutex::new(ZipState {
                completion: Some(completion),
                left: None,
                right: None,
            }));

            let left_state = Arc::clone(&state);
            let left_status = ctx.status.clone();
            let right_state = state;
            let right_status = ctx.status.clone();
            let right_ctx = ctx.clone();

            inner.dispatch_with(
                ctx,
                Box::new(move |result: Result<T, Error>| {
                    let mut guard = left_state.lock().expect("zip state poisoned");

                    match result {
                        Err(error) => {
                            if let Some(completion) = guard.completion.take() {
                                drop(guard);
                                left_status.cancel();
                                completion(Err(error));
                            }
                        }
                        Ok(value) => {
                            guard.left = Some(value);
                            finish_zip(guard);
                        }
                    }
                }),
            );

            other.dispatch_with(
                right_ctx,
                Box::new(move |result: Result<U, Error>| {
                    let mut guard = right_state.lock().expect("zip state poisoned");

                    match result {
                        Err(error) => {
                            if let Some(completion) = guard.completion.take() {
                                drop(guard);
                                right_status.cancel();
                                completion(Err(error));
                            }
                        }
                        Ok(value) => {
                            guard.right = Some(value);
                            finish_zip(guard);
                        }
                    }
                }),
            );
        })
    }

    /// Alias for [`zip`].
    ///
    /// [`zip`]: Self::zip
    pub fn and<U: Send + 'static>(self, other: RestAction<U>) -> RestAction<(T, U)> {
        self.zip(other)
    }

    /// Substitute matching failures with a recovery value.
    pub fn on_error_map(
        self,
        predicate: impl Fn(&Error) -> bool + Send + 'static,
        recover: impl FnOnce(Error) -> T + Send + 'static,
    ) -> Self {
        self.operator(move |inner, ctx, completion| {
            inner.dispatch_with(
                ctx,
                Box::new(move |result| {
                    completion(result.or_else(|error| {
                        if predicate(&error) {
                            Ok(recover(error))
                        } else {
                            Err(error)
                        }
                    }));
                }),
            );
        })
    }

    /// Substitute matching failures with a recovery action.
    pub fn on_error_flat_map(
        self,
        predicate: impl Fn(&Error) -> bool + Send + 'static,
        recover: impl FnOnce(Error) -> RestAction<T> + Send + 'static,
    ) -> Self {
        self.operator(move |inner, ctx, completion| {
            let recover_ctx = ctx.clone();

            inner.dispatch_with(
                ctx,
                Box::new(move |result| match result {
                    Ok(value) => completion(Ok(value)),
                    Err(error) if predicate(&error) => {
                        recover(error).dispatch_with(recover_ctx, completion);
                    }
                    Err(error) => completion(Err(error)),
                }),
            );
        })
    }

    /// Dispatch immediately, delivering the outcome to the callbacks on the
    /// callback pool.
    ///
    /// `None` callbacks fall back to the runtime-wide defaults.
    pub fn queue(self, on_success: Option<SuccessFn<T>>, on_failure: Option<FailureFn>) {
        let client = self.client.clone();

        let completion: Completion<T> = Box::new(move |result| {
            let defaults = client.clone();

            client.callback_handle().spawn(async move {
                enter_callback_context(|| match result {
                    Ok(value) => match on_success {
                        Some(on_success) => on_success(value),
                        None => defaults.default_success()(),
                    },
                    Err(error) => match on_failure {
                        Some(on_failure) => on_failure(error),
                        None => defaults.default_failure()(&error),
                    },
                });
            });
        });

        let ctx = self.base_ctx(false);
        self.dispatch_with(ctx, completion);
    }

    /// Dispatch immediately, resolving a future with the outcome.
    pub fn submit(self) -> SubmitFuture<T> {
        let (tx, rx) = oneshot::channel();
        let status = self.status.clone();

        let completion: Completion<T> = Box::new(move |result| {
            let _ = tx.send(result);
        });

        let ctx = self.base_ctx(false);
        self.dispatch_with(ctx, completion);

        SubmitFuture { rx, status }
    }

    /// Dispatch and block until the outcome arrives.
    ///
    /// Ratelimits are handled locally: a 429 fails with a
    /// [`ErrorType::RateLimited`] error type instead of being retried.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorType::InvalidState`] error type when called from a
    /// callback thread or from inside an async runtime, where blocking
    /// would deadlock the executor.
    ///
    /// [`ErrorType::InvalidState`]: crate::error::ErrorType::InvalidState
    /// [`ErrorType::RateLimited`]: crate::error::ErrorType::RateLimited
    pub fn complete(self) -> Result<T, Error> {
        // Already-resolved actions short-circuit without blocking, so the
        // deadlock guards don't apply to them.
        if matches!(self.kind, ActionKind::Completed(_)) {
            return match self.kind {
                ActionKind::Completed(result) => result,
                _ => unreachable!("kind was just matched as completed"),
            };
        }

        if in_callback_context() {
            return Err(Error::invalid_state(
                "complete() may not be called from a callback thread",
            ));
        }

        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(Error::invalid_state(
                "complete() may not be called inside an async runtime; use submit()",
            ));
        }

        let (tx, rx) = oneshot::channel();

        let completion: Completion<T> = Box::new(move |result| {
            let _ = tx.send(result);
        });

        let ctx = self.base_ctx(true);
        self.dispatch_with(ctx, completion);

        rx.blocking_recv().unwrap_or_else(|_| Err(Error::cancelled()))
    }

    /// Wrap this action in an operator, producing a new lazy action.
    fn operator<U: Send + 'static>(
        self,
        f: impl FnOnce(Self, DispatchCtx, Completion<U>) + Send + 'static,
    ) -> RestAction<U> {
        let client = self.client.clone();
        let status = self.status.clone();

        RestAction {
            check: None,
            client,
            deadline: None,
            kind: ActionKind::Operator(Box::new(move |ctx, completion| f(self, ctx, completion))),
            priority: false,
            status,
        }
    }

    fn base_ctx(&self, local: bool) -> DispatchCtx {
        DispatchCtx {
            check: None,
            deadline: None,
            local,
            priority: false,
            status: self.status.clone(),
        }
    }

    /// Merge this action's constraints into the inherited context and run.
    fn dispatch_with(mut self, mut ctx: DispatchCtx, completion: Completion<T>) {
        ctx.check = merge_checks(ctx.check.take(), self.check.take());

        if let Some(deadline) = self.deadline {
            ctx.deadline = Some(ctx.deadline.map_or(deadline, |inherited| inherited.min(deadline)));
        }

        ctx.priority |= self.priority;

        match self.kind {
            ActionKind::Completed(result) => completion(result),
            ActionKind::Operator(operator) => operator(ctx, completion),
            ActionKind::Request(parts) => dispatch_request(self.client, parts, ctx, completion),
        }
    }
}

impl<T> Debug for RestAction<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("RestAction")
            .field("deadline", &self.deadline)
            .field("priority", &self.priority)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Build the work item for a plain request and hand it to the scheduler.
fn dispatch_request<T: Send + 'static>(
    client: Client,
    parts: RequestParts<T>,
    ctx: DispatchCtx,
    completion: Completion<T>,
) {
    let route = match parts.route {
        RouteSource::Compiled(route) => route,
        RouteSource::Deferred(produce) => match produce() {
            Ok(route) => route,
            Err(error) => return completion(Err(error)),
        },
    };

    let handler = parts.handler;
    let bucket_route = route.endpoint().bucket_route();
    let on_outcome: OutcomeFn = Box::new(move |outcome| {
        completion(outcome.and_then(|response| evaluate(&bucket_route, response, handler.as_ref())));
    });

    let status = ctx.status.child();
    let work_ctx = Arc::new(WorkContext {
        body: parts.body,
        check: ctx.check.clone(),
        deadline: ctx.deadline,
        headers: parts.headers,
        on_outcome: Mutex::new(Some(on_outcome)),
        overwrite_headers: parts.overwrite_headers,
        route,
        status: status.clone(),
    });

    let requester = client.requester();

    if ctx.local {
        let exec_ctx = Arc::clone(&work_ctx);

        client.ratelimit_handle().spawn(async move {
            requester.execute(&exec_ctx, true).await;
        });

        return;
    }

    let endpoint = work_ctx.route.endpoint();

    let execute = {
        let requester = Arc::clone(&requester);
        let exec_ctx = Arc::clone(&work_ctx);

        Box::new(move |locally: bool| -> ExecuteFuture {
            let requester = Arc::clone(&requester);
            let exec_ctx = Arc::clone(&exec_ctx);

            Box::pin(async move { requester.execute(&exec_ctx, locally).await })
        })
    };

    let skip_ctx = Arc::clone(&work_ctx);
    let mut builder = Work::builder(endpoint, status, execute)
        .on_skipped(Box::new(move |reason| {
            let error = match reason {
                SkipReason::Cancelled => Error::cancelled(),
                SkipReason::DeadlineExpired => Error::timeout(),
                _ => Error::cancelled(),
            };

            skip_ctx.deliver(Err(error));
        }))
        .priority(ctx.priority);

    if let Some(deadline) = ctx.deadline {
        builder = builder.deadline(deadline);
    }

    if let Err(source) = client.ratelimiter().queue(builder.build()) {
        work_ctx.deliver(Err(Error::ratelimiter(source)));
    }
}

/// Translate a raw outcome into the action's value or failure.
fn evaluate<T>(
    bucket_route: &str,
    response: RestResponse,
    handler: &(dyn Fn(RestResponse) -> Result<T, Error> + Send + Sync),
) -> Result<T, Error> {
    if response.is_error() {
        return Err(match response.into_transport_error() {
            Some(source) if matches!(source.kind(), TransportErrorType::TimedOut) => {
                Error::transport_timeout(source)
            }
            Some(source) => Error::transport(source),
            None => Error::invalid_state("transport failure carried no source"),
        });
    }

    if response.is_rate_limit() {
        let retry_after = response.retry_after().unwrap_or_default();

        return Err(Error::rate_limited(bucket_route.to_owned(), retry_after));
    }

    if !response.is_ok() {
        let status = response.status().unwrap_or_default();
        let body = response.body().map(|bytes| bytes.to_vec()).unwrap_or_default();
        let api_error = ApiError::from_bytes(&body).unwrap_or_else(|_| ApiError {
            code: 0,
            message: String::from_utf8_lossy(&body).into_owned(),
            errors: Vec::new(),
        });

        return Err(Error::response(status, api_error, body));
    }

    handler(response)
}

struct ZipState<T, U> {
    completion: Option<Completion<(T, U)>>,
    left: Option<T>,
    right: Option<U>,
}

/// Deliver the pair if both sides have arrived.
fn finish_zip<T, U>(mut guard: std::sync::MutexGuard<'_, ZipState<T, U>>) {
    if guard.left.is_some() && guard.right.is_some() {
        let left = guard.left.take();
        let right = guard.right.take();
        let completion = guard.completion.take();
        drop(guard);

        if let (Some(left), Some(right), Some(completion)) = (left, right, completion) {
            completion(Ok((left, right)));
        }
    }
}

/// Merge two optional pre-flight checks; both must pass.
fn merge_checks(first: Option<CheckFn>, second: Option<CheckFn>) -> Option<CheckFn> {
    match (first, second) {
        (Some(first), Some(second)) => Some(Arc::new(move || first() && second())),
        (first, None) => first,
        (None, second) => second,
    }
}

/// Future resolved with the outcome of a submitted action.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct SubmitFuture<T> {
    rx: oneshot::Receiver<Result<T, Error>>,
    status: WorkStatus,
}

impl<T> SubmitFuture<T> {
    /// Cancel the underlying action; the future resolves with a cancelled
    /// failure.
    pub fn cancel(&self) {
        self.status.cancel();
    }
}

impl<T> Debug for SubmitFuture<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("SubmitFuture")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl<T> Future for SubmitFuture<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::cancelled()),
        })
    }
}
