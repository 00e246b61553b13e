use crate::{
    error::Error,
    json,
    response::RestResponse,
    routing::CompiledRoute,
    transport::{self, HttpClient, TransportRequest},
};
use bytes::Bytes;
use cadence_http_ratelimiting::{Method, RateLimiter, RatelimitHeaders, WorkStatus};
use hyper::{
    header::{
        HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, AUTHORIZATION, CONTENT_LENGTH,
        CONTENT_TYPE, USER_AGENT, VIA,
    },
    Method as HttpMethod, StatusCode,
};
use serde::Deserialize;
use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::time::{sleep, Instant};

/// Legacy compatibility header requesting millisecond reset precision.
const X_RATELIMIT_PRECISION: &str = "x-ratelimit-precision";

/// Total transport attempts per dispatch, including the first.
const MAX_ATTEMPTS: u32 = 4;

/// Base of the exponential backoff between transient-status attempts.
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Status codes retried inside the requester and never surfaced early.
const TRANSIENT_STATUS: [u16; 3] = [502, 504, 529];

/// A request body with its content type.
#[derive(Clone, Debug)]
pub(crate) struct RequestBody {
    pub bytes: Bytes,
    pub content_type: String,
}

/// Callback consuming the final outcome of a work item.
pub(crate) type OutcomeFn = Box<dyn FnOnce(Result<RestResponse, Error>) + Send>;

/// Everything the requester needs to dispatch one API call.
///
/// Shared between the queued [`Work`] and the dispatch closure; the
/// [`WorkStatus`] inside is the same instance the work carries, so the
/// at-most-once delivery guarantee spans both the queue-side skip path and
/// the requester's own delivery.
///
/// [`Work`]: cadence_http_ratelimiting::Work
pub(crate) struct WorkContext {
    pub body: Option<RequestBody>,
    pub check: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
    pub deadline: Option<Instant>,
    pub headers: HeaderMap,
    pub on_outcome: Mutex<Option<OutcomeFn>>,
    pub overwrite_headers: bool,
    pub route: CompiledRoute,
    pub status: WorkStatus,
}

impl WorkContext {
    /// Deliver the final outcome, claiming the single delivery slot.
    pub fn deliver(&self, outcome: Result<RestResponse, Error>) {
        if !self.status.start_delivery() {
            return;
        }

        let callback = self
            .on_outcome
            .lock()
            .expect("work outcome handler poisoned")
            .take();

        if let Some(callback) = callback {
            callback(outcome);
        }
    }

    /// Failure to deliver instead of dispatching, if any skip condition
    /// holds right now.
    fn skip_error(&self) -> Option<Error> {
        if self.status.is_cancelled() {
            return Some(Error::cancelled());
        }

        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                return Some(Error::timeout());
            }
        }

        if let Some(check) = &self.check {
            if !check() {
                return Some(Error::cancelled());
            }
        }

        None
    }
}

impl Debug for WorkContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("WorkContext")
            .field("body", &self.body)
            .field("deadline", &self.deadline)
            .field("headers", &self.headers)
            .field("overwrite_headers", &self.overwrite_headers)
            .field("route", &self.route)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Shape of a 429 body, which may refine the header's retry delay.
#[derive(Deserialize)]
struct RatelimitedBody {
    retry_after: Option<f64>,
}

/// Builds and dispatches HTTP requests, retrying transient failures.
///
/// Holds no mutable state beyond configuration and the invalid-token latch;
/// any number of dispatches may run concurrently, each against a distinct
/// work context.
pub(crate) struct Requester {
    base_url: String,
    custom_builder: Option<Arc<dyn Fn(&mut HeaderMap) + Send + Sync>>,
    http: Arc<dyn HttpClient>,
    ratelimiter: RateLimiter,
    retry_on_timeout: bool,
    token: Option<String>,
    token_invalid: AtomicBool,
    user_agent: String,
}

impl Requester {
    pub fn new(
        base_url: String,
        custom_builder: Option<Arc<dyn Fn(&mut HeaderMap) + Send + Sync>>,
        http: Arc<dyn HttpClient>,
        ratelimiter: RateLimiter,
        retry_on_timeout: bool,
        token: Option<String>,
        user_agent: String,
    ) -> Self {
        Self {
            base_url,
            custom_builder,
            http,
            ratelimiter,
            retry_on_timeout,
            token,
            token_invalid: AtomicBool::new(false),
            user_agent,
        }
    }

    pub const fn ratelimiter(&self) -> &RateLimiter {
        &self.ratelimiter
    }

    /// Whether a 401 response has permanently invalidated the token.
    pub fn token_invalid(&self) -> bool {
        self.token_invalid.load(Ordering::Relaxed)
    }

    /// Dispatch one API call, retrying transient failures.
    ///
    /// Returns the delay the ratelimiter indicated: positive when the call
    /// was deferred or answered with a 429, in which case the caller (the
    /// bucket worker) re-queues the work. `None` means the outcome was
    /// delivered.
    ///
    /// With `handle_rate_limit_locally` set, ratelimits are not left to the
    /// queue: a deferred or 429'd call is delivered to the handler as a
    /// 429 response carrying its retry delay.
    pub async fn execute(
        &self,
        ctx: &Arc<WorkContext>,
        handle_rate_limit_locally: bool,
    ) -> Option<Duration> {
        if self.token_invalid() {
            ctx.deliver(Err(Error::invalid_state(
                "authorization token was invalidated by an unauthorized response",
            )));

            return None;
        }

        if let Some(error) = ctx.skip_error() {
            ctx.deliver(Err(error));

            return None;
        }

        let endpoint = ctx.route.endpoint();

        let delay = match self.ratelimiter.delay_for(&endpoint) {
            Ok(delay) => delay,
            Err(source) => {
                ctx.deliver(Err(Error::ratelimiter(source)));

                return None;
            }
        };

        if delay > Duration::ZERO {
            return Some(self.defer(ctx, delay, handle_rate_limit_locally));
        }

        let request = match self.build_request(ctx) {
            Ok(request) => request,
            Err(error) => {
                ctx.deliver(Err(error));

                return None;
            }
        };

        let mut cf_rays = Vec::new();
        let mut attempt: u32 = 0;
        let mut retried_transport = false;

        let response = loop {
            // Cancellation is re-checked immediately before every dispatch.
            if let Some(error) = ctx.skip_error() {
                ctx.deliver(Err(error));

                return None;
            }

            tracing::trace!(url = %request.url, attempt, "dispatching request");

            match self.http.send(request.clone()).await {
                Ok(response) => {
                    if let Some(ray) = response
                        .headers
                        .get("cf-ray")
                        .and_then(|value| value.to_str().ok())
                    {
                        let ray = ray.to_owned();

                        if !cf_rays.contains(&ray) {
                            cf_rays.push(ray);
                        }
                    }

                    let status = response.status.as_u16();

                    if TRANSIENT_STATUS.contains(&status) && attempt + 1 < MAX_ATTEMPTS {
                        let backoff = BACKOFF_BASE * 2_u32.pow(attempt);
                        tracing::debug!(status, ?backoff, "transient server error, backing off");

                        sleep(backoff).await;
                        attempt += 1;

                        continue;
                    }

                    break response;
                }
                Err(source) => {
                    if self.retry_on_timeout
                        && attempt == 0
                        && !retried_transport
                        && source.is_transient()
                    {
                        tracing::debug!(%source, "transient transport failure, retrying once");
                        retried_transport = true;

                        // Back to the top: the limiter may have closed in
                        // the meantime.
                        match self.ratelimiter.delay_for(&endpoint) {
                            Ok(delay) if delay > Duration::ZERO => {
                                return Some(self.defer(ctx, delay, handle_rate_limit_locally));
                            }
                            _ => continue,
                        }
                    }

                    ctx.deliver(Ok(RestResponse::failed(source, cf_rays)));

                    return None;
                }
            }
        };

        let status = response.status;

        // Retries exhausted on a transient status: surface the server error
        // without updating any bucket.
        if TRANSIENT_STATUS.contains(&status.as_u16()) {
            let body = transport::decompress(&response.headers, response.body);
            ctx.deliver(Ok(RestResponse::completed(
                status,
                response.headers,
                body,
                None,
                cf_rays,
            )));

            return None;
        }

        if status == StatusCode::UNAUTHORIZED {
            self.token_invalid.store(true, Ordering::Relaxed);
        }

        let parsed = RatelimitHeaders::from_pairs(
            response
                .headers
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_bytes())),
        )
        .unwrap_or_else(|source| {
            tracing::warn!(%source, "ratelimit header parsing failed");

            RatelimitHeaders::None
        });

        let cloudflare = !response.headers.contains_key(VIA);

        let ratelimited = match self.ratelimiter.handle_response(
            &endpoint,
            status.as_u16(),
            &parsed,
            cloudflare,
        ) {
            Ok(ratelimited) => ratelimited,
            Err(source) => {
                tracing::warn!(%source, "ratelimiter rejected response headers");

                None
            }
        };

        let body = transport::decompress(&response.headers, response.body);

        if let Some(delay) = ratelimited {
            let mut retry_after = delay;

            if handle_rate_limit_locally {
                // The body may advertise a longer wait than the header did.
                if is_json(&response.headers) {
                    if let Ok(parsed_body) = json::from_bytes::<RatelimitedBody>(&body) {
                        if let Some(secs) = parsed_body.retry_after.filter(|secs| {
                            secs.is_finite() && secs.is_sign_positive()
                        }) {
                            retry_after = retry_after.max(Duration::from_secs_f64(secs));
                        }
                    }
                }

                ctx.deliver(Ok(RestResponse::completed(
                    status,
                    response.headers,
                    body,
                    Some(retry_after),
                    cf_rays,
                )));
            }

            return Some(retry_after);
        }

        ctx.deliver(Ok(RestResponse::completed(
            status,
            response.headers,
            body,
            None,
            cf_rays,
        )));

        None
    }

    /// Handle a positive pre-dispatch delay: deliver a synthetic 429 when
    /// ratelimits are handled locally, otherwise leave the work to the
    /// queue.
    fn defer(
        &self,
        ctx: &Arc<WorkContext>,
        delay: Duration,
        handle_rate_limit_locally: bool,
    ) -> Duration {
        if handle_rate_limit_locally {
            ctx.deliver(Ok(RestResponse::completed(
                StatusCode::TOO_MANY_REQUESTS,
                HeaderMap::new(),
                Bytes::new(),
                Some(delay),
                Vec::new(),
            )));
        }

        delay
    }

    /// Assemble the concrete HTTP request for a work context.
    fn build_request(&self, ctx: &WorkContext) -> Result<TransportRequest, Error> {
        let mut headers = HeaderMap::new();

        let user_agent = HeaderValue::from_str(&self.user_agent)
            .map_err(|_| Error::invalid_argument("user agent is not a valid header value"))?;
        headers.insert(USER_AGENT, user_agent);
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert(
            HeaderName::from_static(X_RATELIMIT_PRECISION),
            HeaderValue::from_static("millisecond"),
        );

        if ctx.route.requires_auth() {
            if let Some(token) = &self.token {
                let token = HeaderValue::from_str(token)
                    .map_err(|_| Error::invalid_argument("token is not a valid header value"))?;
                headers.insert(AUTHORIZATION, token);
            }
        }

        let mut body = Bytes::new();

        if let Some(request_body) = &ctx.body {
            let content_type = HeaderValue::from_str(&request_body.content_type)
                .map_err(|_| Error::invalid_argument("content type is not a valid header value"))?;
            headers.insert(CONTENT_TYPE, content_type);
            headers.insert(CONTENT_LENGTH, HeaderValue::from(request_body.bytes.len()));
            body = request_body.bytes.clone();
        } else if ctx.route.method().has_body() {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(0_usize));
        }

        if let Some(custom_builder) = &self.custom_builder {
            custom_builder(&mut headers);
        }

        // Per-work headers apply last but overwrite the defaults only when
        // explicitly permitted.
        for (name, value) in &ctx.headers {
            if ctx.overwrite_headers || !headers.contains_key(name) {
                headers.insert(name.clone(), value.clone());
            }
        }

        Ok(TransportRequest {
            body,
            headers,
            method: http_method(ctx.route.method()),
            url: format!("{}{}", self.base_url, ctx.route.uri()),
        })
    }
}

impl Debug for Requester {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Requester")
            .field("base_url", &self.base_url)
            .field("http", &self.http)
            .field("ratelimiter", &self.ratelimiter)
            .field("retry_on_timeout", &self.retry_on_timeout)
            .field("user_agent", &self.user_agent)
            .finish_non_exhaustive()
    }
}

/// Convert the routing method into hyper's.
pub(crate) fn http_method(method: Method) -> HttpMethod {
    match method {
        Method::Delete => HttpMethod::DELETE,
        Method::Get => HttpMethod::GET,
        Method::Patch => HttpMethod::PATCH,
        Method::Post => HttpMethod::POST,
        Method::Put => HttpMethod::PUT,
        _ => unreachable!("unknown ratelimiter method"),
    }
}

/// Whether the response advertises a JSON body.
fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map_or(false, |value| value.starts_with("application/json"))
}

#[cfg(test)]
mod tests {
    use super::{http_method, is_json, MAX_ATTEMPTS, TRANSIENT_STATUS};
    use cadence_http_ratelimiting::Method;
    use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE};

    #[test]
    fn method_mapping() {
        assert_eq!(hyper::Method::GET, http_method(Method::Get));
        assert_eq!(hyper::Method::DELETE, http_method(Method::Delete));
        assert_eq!(hyper::Method::PATCH, http_method(Method::Patch));
        assert_eq!(hyper::Method::POST, http_method(Method::Post));
        assert_eq!(hyper::Method::PUT, http_method(Method::Put));
    }

    #[test]
    fn retry_policy_constants() {
        assert_eq!(4, MAX_ATTEMPTS);
        assert_eq!([502, 504, 529], TRANSIENT_STATUS);
    }

    #[test]
    fn json_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_json(&headers));

        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        assert!(is_json(&headers));
    }
}
