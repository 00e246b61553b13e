use super::{Client, ClientState};
use crate::{
    error::Error,
    requester::Requester,
    transport::{HttpClient, HyperClient},
};
use cadence_http_ratelimiting::{GlobalGate, RateLimiter};
use hyper::header::HeaderMap;
use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    sync::Arc,
    time::Duration,
};
use tokio::runtime::Handle;

/// Produces the ratelimiter from the scheduler handle, the shared global
/// gate, and the relative-reset flag.
pub type RatelimiterFactory = Box<dyn FnOnce(Handle, GlobalGate, bool) -> RateLimiter>;

/// Configures and builds a [`Client`].
///
/// `base_url` and `user_agent` are required; everything else has a
/// default. Refer to the setters for the individual options.
pub struct ClientBuilder {
    base_url: Option<String>,
    callback_handle: Option<Handle>,
    custom_request_builder: Option<Arc<dyn Fn(&mut HeaderMap) + Send + Sync>>,
    default_failure: Option<Arc<dyn Fn(&Error) + Send + Sync>>,
    default_success: Option<Arc<dyn Fn() + Send + Sync>>,
    http_client: Option<Arc<dyn HttpClient>>,
    ratelimit_handle: Option<Handle>,
    ratelimiter_factory: Option<RatelimiterFactory>,
    relative_ratelimit: bool,
    request_timeout: Duration,
    retry_on_timeout: bool,
    token: Option<String>,
    user_agent: Option<String>,
}

impl ClientBuilder {
    /// Create a builder with every option at its default.
    pub fn new() -> Self {
        Self {
            base_url: None,
            callback_handle: None,
            custom_request_builder: None,
            default_failure: None,
            default_success: None,
            http_client: None,
            ratelimit_handle: None,
            ratelimiter_factory: None,
            relative_ratelimit: true,
            request_timeout: Duration::from_secs(10),
            retry_on_timeout: false,
            token: None,
            user_agent: None,
        }
    }

    /// Base URL of the API. Required; must start with `http` and is
    /// normalized to end with a `/`.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url.replace(base_url.into());

        self
    }

    /// Runtime handle on which user callbacks run. Defaults to the runtime
    /// the client is built on.
    pub fn callback_handle(mut self, handle: Handle) -> Self {
        self.callback_handle.replace(handle);

        self
    }

    /// Hook invoked just before each request is sent, allowing arbitrary
    /// header injection.
    pub fn custom_request_builder(
        mut self,
        hook: impl Fn(&mut HeaderMap) + Send + Sync + 'static,
    ) -> Self {
        self.custom_request_builder.replace(Arc::new(hook));

        self
    }

    /// Fallback failure callback when a queued action supplies none.
    /// Defaults to logging the error at warning level.
    pub fn default_failure(mut self, callback: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.default_failure.replace(Arc::new(callback));

        self
    }

    /// Fallback success callback when a queued action supplies none.
    /// Defaults to doing nothing.
    pub fn default_success(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.default_success.replace(Arc::new(callback));

        self
    }

    /// Transport performing the HTTP exchanges. Defaults to [`HyperClient`]
    /// with the configured request timeout.
    pub fn http_client(mut self, http_client: Arc<dyn HttpClient>) -> Self {
        self.http_client.replace(http_client);

        self
    }

    /// Runtime handle on which bucket workers and the cleanup sweep run.
    /// Defaults to the runtime the client is built on.
    pub fn ratelimit_handle(mut self, handle: Handle) -> Self {
        self.ratelimit_handle.replace(handle);

        self
    }

    /// Factory producing the ratelimiter. Defaults to the bucket-based
    /// [`RateLimiter`].
    pub fn ratelimiter_factory(mut self, factory: RatelimiterFactory) -> Self {
        self.ratelimiter_factory.replace(factory);

        self
    }

    /// Whether bucket resets are read from the relative
    /// `x-ratelimit-reset-after` header (`true`, the default) or the
    /// absolute `x-ratelimit-reset` timestamp (`false`).
    pub const fn relative_ratelimit(mut self, relative: bool) -> Self {
        self.relative_ratelimit = relative;

        self
    }

    /// Per-exchange timeout of the default transport.
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;

        self
    }

    /// Whether a transient transport failure on the first attempt is
    /// retried once. Defaults to `false`.
    pub const fn retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;

        self
    }

    /// Authorization token sent on routes that require it.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token.replace(token.into());

        self
    }

    /// User agent header value. Required and non-blank.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent.replace(user_agent.into());

        self
    }

    /// Consume the builder, validating the configuration.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorType::InvalidArgument`] error type if `base_url`
    /// is missing or does not start with `http`, or if `user_agent` is
    /// missing or blank. Returns an [`ErrorType::InvalidState`] error type
    /// if no runtime handle was configured and the builder runs outside a
    /// Tokio runtime.
    ///
    /// [`ErrorType::InvalidArgument`]: crate::error::ErrorType::InvalidArgument
    /// [`ErrorType::InvalidState`]: crate::error::ErrorType::InvalidState
    pub fn build(self) -> Result<Client, Error> {
        let base_url = self
            .base_url
            .ok_or_else(|| Error::invalid_argument("base url is required"))?;

        if !base_url.starts_with("http") {
            return Err(Error::invalid_argument(format!(
                "base url '{base_url}' must start with 'http'",
            )));
        }

        let base_url = if base_url.ends_with('/') {
            base_url
        } else {
            let mut normalized = base_url;
            normalized.push('/');

            normalized
        };

        let user_agent = self
            .user_agent
            .filter(|user_agent| !user_agent.trim().is_empty())
            .ok_or_else(|| Error::invalid_argument("user agent is required and may not be blank"))?;

        let ratelimit_handle = match self.ratelimit_handle {
            Some(handle) => handle,
            None => current_handle()?,
        };
        let callback_handle = match self.callback_handle {
            Some(handle) => handle,
            None => current_handle()?,
        };

        let http_client = self
            .http_client
            .unwrap_or_else(|| Arc::new(HyperClient::new(self.request_timeout)));

        let gate = GlobalGate::new();
        let ratelimiter = match self.ratelimiter_factory {
            Some(factory) => factory(ratelimit_handle.clone(), gate, self.relative_ratelimit),
            None => RateLimiter::new(ratelimit_handle.clone(), gate, self.relative_ratelimit),
        };

        let requester = Arc::new(Requester::new(
            base_url,
            self.custom_request_builder,
            http_client,
            ratelimiter,
            self.retry_on_timeout,
            self.token,
            user_agent,
        ));

        let default_failure = self.default_failure.unwrap_or_else(|| {
            Arc::new(|error: &Error| tracing::warn!(%error, "unhandled rest failure"))
        });
        let default_success = self.default_success.unwrap_or_else(|| Arc::new(|| {}));

        Ok(Client {
            state: Arc::new(ClientState {
                callback_handle,
                default_failure,
                default_success,
                ratelimit_handle,
                requester,
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for ClientBuilder {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("ClientBuilder")
            .field("base_url", &self.base_url)
            .field("relative_ratelimit", &self.relative_ratelimit)
            .field("request_timeout", &self.request_timeout)
            .field("retry_on_timeout", &self.retry_on_timeout)
            .field("user_agent", &self.user_agent)
            .finish_non_exhaustive()
    }
}

fn current_handle() -> Result<Handle, Error> {
    Handle::try_current().map_err(|_| {
        Error::invalid_state(
            "no runtime handle was configured and the builder is running outside a tokio runtime",
        )
    })
}
