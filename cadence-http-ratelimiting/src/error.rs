use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
};

/// Failure of a ratelimiter operation.
#[derive(Debug)]
pub struct RatelimiterError {
    pub(crate) kind: RatelimiterErrorType,
    pub(crate) source: Option<Box<dyn Error + Send + Sync>>,
}

impl RatelimiterError {
    /// Immutable reference to the type of error that occurred.
    #[must_use = "retrieving the type has no effect if left unused"]
    pub const fn kind(&self) -> &RatelimiterErrorType {
        &self.kind
    }

    /// Consume the error, returning the source error if there is any.
    #[must_use = "consuming the error and retrieving the source has no effect if left unused"]
    pub fn into_source(self) -> Option<Box<dyn Error + Send + Sync>> {
        self.source
    }

    /// Consume the error, returning the owned error type and the source
    /// error.
    #[must_use = "consuming the error into its parts has no effect if left unused"]
    pub fn into_parts(self) -> (RatelimiterErrorType, Option<Box<dyn Error + Send + Sync>>) {
        (self.kind, self.source)
    }

    pub(crate) const fn lock_timeout() -> Self {
        Self {
            kind: RatelimiterErrorType::LockTimeout,
            source: None,
        }
    }

    pub(crate) const fn stopped() -> Self {
        Self {
            kind: RatelimiterErrorType::Stopped,
            source: None,
        }
    }
}

impl Display for RatelimiterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self.kind {
            RatelimiterErrorType::LockTimeout => {
                f.write_str("ratelimiter state lock could not be acquired in time")
            }
            RatelimiterErrorType::Stopped => {
                f.write_str("ratelimiter has been shut down and accepts no new work")
            }
        }
    }
}

impl Error for RatelimiterError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn Error + 'static))
    }
}

/// Type of [`RatelimiterError`] that occurred.
#[derive(Debug)]
#[non_exhaustive]
pub enum RatelimiterErrorType {
    /// The state mutex could not be acquired within the bounded wait,
    /// indicating lock corruption or a stalled task.
    LockTimeout,
    /// The ratelimiter was shut down; queued work keeps draining but no new
    /// work is accepted.
    Stopped,
}
