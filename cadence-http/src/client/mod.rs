mod builder;

pub use self::builder::ClientBuilder;

use crate::{
    action::{HandlerFn, RestAction},
    error::{Error, ErrorHandler},
    requester::Requester,
    response::RestResponse,
    routing::CompiledRoute,
};
use cadence_http_ratelimiting::RateLimiter;
use serde::de::DeserializeOwned;
use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    sync::Arc,
};
use tokio::runtime::Handle;

pub(crate) struct ClientState {
    pub(crate) callback_handle: Handle,
    pub(crate) default_failure: Arc<dyn Fn(&Error) + Send + Sync>,
    pub(crate) default_success: Arc<dyn Fn() + Send + Sync>,
    pub(crate) ratelimit_handle: Handle,
    pub(crate) requester: Arc<Requester>,
}

/// The request runtime.
///
/// Wraps its state in an `Arc`, so it can be cloned and passed between
/// tasks cheaply; all clones share the ratelimiter and transport.
///
/// # Examples
///
/// ```no_run
/// use cadence_http::{routing::Route, Client};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Client::builder()
///     .base_url("https://api.example.com/v10")
///     .user_agent("my-bot (https://example.com, 1.0)")
///     .token("Bot my-token")
///     .build()?;
///
/// let route = Route::get("channels/{channel_id}/messages")?.compile(&["111"])?;
/// let messages: Vec<serde_json::Value> = client.request(route).submit().await?;
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct Client {
    pub(crate) state: Arc<ClientState>,
}

impl Client {
    /// Create a builder to configure a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// The ratelimiter scheduling this client's requests.
    pub fn ratelimiter(&self) -> &RateLimiter {
        self.state.requester.ratelimiter()
    }

    /// Whether a 401 response has permanently invalidated the configured
    /// token. Once set, every dispatch fails until a new client is built.
    pub fn token_invalid(&self) -> bool {
        self.state.requester.token_invalid()
    }

    /// Cancel every queued non-priority request, returning how many were
    /// cancelled.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorType::InvalidState`] error type if the limiter's
    /// state lock could not be acquired.
    ///
    /// [`ErrorType::InvalidState`]: crate::error::ErrorType::InvalidState
    pub fn cancel_all(&self) -> Result<usize, Error> {
        self.ratelimiter().cancel_all().map_err(Error::ratelimiter)
    }

    /// Shut the runtime down: the ratelimiter stops accepting work and its
    /// cleanup timer is cancelled. Queued work keeps draining.
    pub fn shutdown(&self) {
        self.ratelimiter().shutdown();
    }

    /// An action that deserializes the response body into `T`.
    pub fn request<T>(&self, route: CompiledRoute) -> RestAction<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        RestAction::new_request(
            self.clone(),
            route,
            Arc::new(|response: RestResponse| response.model::<T>()),
        )
    }

    /// An action that discards the response body.
    pub fn request_empty(&self, route: CompiledRoute) -> RestAction<()> {
        RestAction::new_request(self.clone(), route, Arc::new(|_| Ok(())))
    }

    /// An action with a custom response handler.
    pub fn request_with<T: Send + 'static>(
        &self,
        route: CompiledRoute,
        handler: impl Fn(RestResponse) -> Result<T, Error> + Send + Sync + 'static,
    ) -> RestAction<T> {
        RestAction::new_request(self.clone(), route, Arc::new(handler))
    }

    /// An action whose route is produced at dispatch time.
    pub fn request_deferred<T>(
        &self,
        route: impl FnOnce() -> Result<CompiledRoute, Error> + Send + 'static,
    ) -> RestAction<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        RestAction::new_deferred(
            self.clone(),
            Box::new(route),
            Arc::new(|response: RestResponse| response.model::<T>()),
        )
    }

    /// A failure handler whose base consumer is the runtime-wide default
    /// failure callback.
    pub fn error_handler(&self) -> ErrorHandler {
        let default_failure = self.default_failure();

        ErrorHandler::new().base(move |error| default_failure(error))
    }

    pub(crate) fn requester(&self) -> Arc<Requester> {
        Arc::clone(&self.state.requester)
    }

    pub(crate) fn callback_handle(&self) -> &Handle {
        &self.state.callback_handle
    }

    pub(crate) fn ratelimit_handle(&self) -> &Handle {
        &self.state.ratelimit_handle
    }

    pub(crate) fn default_success(&self) -> Arc<dyn Fn() + Send + Sync> {
        Arc::clone(&self.state.default_success)
    }

    pub(crate) fn default_failure(&self) -> Arc<dyn Fn(&Error) + Send + Sync> {
        Arc::clone(&self.state.default_failure)
    }

    pub(crate) fn with_handler<T: Send + 'static>(
        &self,
        route: CompiledRoute,
        handler: HandlerFn<T>,
    ) -> RestAction<T> {
        RestAction::new_request(self.clone(), route, handler)
    }
}

impl Debug for Client {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Client")
            .field("requester", &self.state.requester)
            .finish_non_exhaustive()
    }
}
