use crate::{api_error::ApiError, transport::TransportError};
use hyper::StatusCode;
use std::{
    error::Error as StdError,
    fmt::{Debug, Formatter, Result as FmtResult},
    time::Duration,
};

/// Failure of a REST operation, surfaced to user callbacks and futures.
#[derive(Debug)]
pub struct Error {
    pub(crate) kind: ErrorType,
    pub(crate) source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    /// Immutable reference to the type of error that occurred.
    #[must_use = "retrieving the type has no effect if left unused"]
    pub const fn kind(&self) -> &ErrorType {
        &self.kind
    }

    /// Consume the error, returning the source error if there is any.
    #[must_use = "consuming the error and retrieving the source has no effect if left unused"]
    pub fn into_source(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.source
    }

    /// Consume the error, returning the owned error type and the source
    /// error.
    #[must_use = "consuming the error into its parts has no effect if left unused"]
    pub fn into_parts(self) -> (ErrorType, Option<Box<dyn StdError + Send + Sync>>) {
        (self.kind, self.source)
    }

    /// A cancellation failure, as delivered for cancelled work.
    pub const fn cancelled() -> Self {
        Self {
            kind: ErrorType::Cancelled,
            source: None,
        }
    }

    /// A timeout failure, as delivered for expired work.
    pub const fn timeout() -> Self {
        Self {
            kind: ErrorType::Timeout,
            source: None,
        }
    }

    /// A validation failure with the given message.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorType::InvalidArgument {
                message: message.into(),
            },
            source: None,
        }
    }

    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorType::InvalidState {
                message: message.into(),
            },
            source: None,
        }
    }

    pub(crate) fn json(source: serde_json::Error) -> Self {
        Self {
            kind: ErrorType::Json,
            source: Some(Box::new(source)),
        }
    }

    pub(crate) fn parsing(body: Vec<u8>, source: serde_json::Error) -> Self {
        Self {
            kind: ErrorType::Parsing { body },
            source: Some(Box::new(source)),
        }
    }

    pub(crate) fn ratelimiter(source: cadence_http_ratelimiting::RatelimiterError) -> Self {
        Self {
            kind: ErrorType::InvalidState {
                message: source.to_string(),
            },
            source: Some(Box::new(source)),
        }
    }

    pub(crate) fn rate_limited(bucket_route: String, retry_after: Duration) -> Self {
        Self {
            kind: ErrorType::RateLimited {
                bucket_route,
                retry_after,
            },
            source: None,
        }
    }

    pub(crate) fn response(status: StatusCode, error: ApiError, body: Vec<u8>) -> Self {
        Self {
            kind: ErrorType::Response {
                body,
                error,
                status,
            },
            source: None,
        }
    }

    pub(crate) fn transport(source: TransportError) -> Self {
        Self {
            kind: ErrorType::Transport,
            source: Some(Box::new(source)),
        }
    }

    pub(crate) fn transport_timeout(source: TransportError) -> Self {
        Self {
            kind: ErrorType::Timeout,
            source: Some(Box::new(source)),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match &self.kind {
            ErrorType::Cancelled => f.write_str("request was cancelled before completion"),
            ErrorType::InvalidArgument { message } => {
                f.write_str("invalid argument: ")?;

                f.write_str(message)
            }
            ErrorType::InvalidState { message } => {
                f.write_str("invalid state: ")?;

                f.write_str(message)
            }
            ErrorType::Json => f.write_str("value could not be serialized as json"),
            ErrorType::Parsing { body } => {
                write!(f, "response body could not be deserialized: {body:?}")
            }
            ErrorType::RateLimited {
                bucket_route,
                retry_after,
            } => write!(
                f,
                "ratelimited on {bucket_route} for {}ms",
                retry_after.as_millis(),
            ),
            ErrorType::Response { error, status, .. } => {
                write!(f, "response error: status code {status}, error: {error}")
            }
            ErrorType::Timeout => f.write_str("request deadline passed before completion"),
            ErrorType::Transport => f.write_str("sending the request failed"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn StdError + 'static))
    }
}

/// Type of [`Error`] that occurred.
#[derive(Debug)]
#[non_exhaustive]
pub enum ErrorType {
    /// The request was explicitly cancelled, or a pre-flight check returned
    /// false.
    Cancelled,
    /// Validation of a caller-supplied value failed.
    InvalidArgument {
        /// What was wrong with the value.
        message: String,
    },
    /// The runtime was misused: `complete()` on a callback thread, a
    /// stopped runtime, or a lock acquisition failure.
    InvalidState {
        /// What was misused.
        message: String,
    },
    /// A request body could not be serialized as JSON.
    Json,
    /// The response body could not be decoded into the expected shape.
    Parsing {
        /// Raw response body.
        body: Vec<u8>,
    },
    /// A 429 was surfaced because local handling was requested.
    RateLimited {
        /// Route family that was limited.
        bucket_route: String,
        /// How long to wait before retrying.
        retry_after: Duration,
    },
    /// The API answered with a non-success status code.
    Response {
        /// Raw response body.
        body: Vec<u8>,
        /// Parsed API error body.
        error: ApiError,
        /// HTTP status code.
        status: StatusCode,
    },
    /// The deadline passed before the request could be dispatched, or the
    /// transport timed out after retry exhaustion.
    Timeout,
    /// Socket, DNS, or TLS failure not recoverable by the built-in retry.
    Transport,
}

type PredicateFn = Box<dyn Fn(&Error) -> bool + Send + Sync>;
type ConsumerFn = Box<dyn Fn(&Error) + Send + Sync>;

/// Composable failure callback.
///
/// Entries run in insertion order when their predicate matches; the base
/// consumer runs unconditionally at the end. Obtain one wired to the
/// runtime's default failure callback through [`Client::error_handler`], or
/// build a standalone one with [`ErrorHandler::new`].
///
/// ```
/// use cadence_http::error::{ErrorHandler, ErrorType};
///
/// let handler = ErrorHandler::new()
///     .ignore(|error| matches!(error.kind(), ErrorType::Cancelled))
///     .handle(
///         |error| matches!(error.kind(), ErrorType::Timeout),
///         |error| eprintln!("timed out: {error}"),
///     );
/// ```
///
/// [`Client::error_handler`]: crate::client::Client::error_handler
#[derive(Default)]
pub struct ErrorHandler {
    base: Option<ConsumerFn>,
    entries: Vec<(PredicateFn, ConsumerFn)>,
}

impl ErrorHandler {
    /// Create a handler with no entries and no base consumer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a predicate/consumer entry.
    #[must_use = "handlers do nothing until used as a failure callback"]
    pub fn handle(
        mut self,
        predicate: impl Fn(&Error) -> bool + Send + Sync + 'static,
        consumer: impl Fn(&Error) + Send + Sync + 'static,
    ) -> Self {
        self.entries
            .push((Box::new(predicate), Box::new(consumer)));

        self
    }

    /// Append an entry that swallows matching errors.
    #[must_use = "handlers do nothing until used as a failure callback"]
    pub fn ignore(self, predicate: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        self.handle(predicate, |_| {})
    }

    /// Set the consumer that runs unconditionally after the entries.
    #[must_use = "handlers do nothing until used as a failure callback"]
    pub fn base(mut self, consumer: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.base.replace(Box::new(consumer));

        self
    }

    /// Run the matching entries, then the base consumer.
    pub fn accept(&self, error: &Error) {
        for (predicate, consumer) in &self.entries {
            if predicate(error) {
                consumer(error);
            }
        }

        if let Some(base) = &self.base {
            base(error);
        }
    }
}

impl Debug for ErrorHandler {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("ErrorHandler")
            .field("entries", &self.entries.len())
            .field("has_base", &self.base.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorHandler, ErrorType};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn entries_and_base_run_in_order() {
        let hits = Arc::new(AtomicUsize::new(0));

        let timeouts = Arc::clone(&hits);
        let base = Arc::clone(&hits);
        let handler = ErrorHandler::new()
            .handle(
                |error| matches!(error.kind(), ErrorType::Timeout),
                move |_| {
                    timeouts.fetch_add(1, Ordering::SeqCst);
                },
            )
            .ignore(|error| matches!(error.kind(), ErrorType::Cancelled))
            .base(move |_| {
                base.fetch_add(10, Ordering::SeqCst);
            });

        handler.accept(&Error::timeout());
        assert_eq!(11, hits.load(Ordering::SeqCst));

        handler.accept(&Error::cancelled());
        assert_eq!(21, hits.load(Ordering::SeqCst));
    }
}
