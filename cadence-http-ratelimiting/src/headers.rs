//! Parse typed ratelimit headers from a response.
//!
//! Parsing response headers is how the [`RateLimiter`] learns bucket hashes
//! and refreshes bucket state.
//!
//! [`RateLimiter`]: super::RateLimiter

use std::{
    error::Error,
    fmt::{Debug, Display, Formatter, Result as FmtResult},
    str::{self, FromStr, Utf8Error},
};

/// A header failed to be parsed.
#[derive(Debug)]
pub struct HeaderParsingError {
    pub(super) kind: HeaderParsingErrorType,
    pub(super) source: Option<Box<dyn Error + Send + Sync>>,
}

impl HeaderParsingError {
    /// Immutable reference to the type of error that occurred.
    #[must_use = "retrieving the type has no effect if left unused"]
    pub const fn kind(&self) -> &HeaderParsingErrorType {
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
    pub fn into_parts(self) -> (HeaderParsingErrorType, Option<Box<dyn Error + Send + Sync>>) {
        (self.kind, self.source)
    }

    pub(super) fn missing(name: HeaderName) -> Self {
        Self {
            kind: HeaderParsingErrorType::Missing { name },
            source: None,
        }
    }

    pub(super) fn not_utf8(name: HeaderName, value: Vec<u8>, source: Utf8Error) -> Self {
        Self {
            kind: HeaderParsingErrorType::NotUtf8 { name, value },
            source: Some(Box::new(source)),
        }
    }
}

impl Display for HeaderParsingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match &self.kind {
            HeaderParsingErrorType::Missing { name } => {
                f.write_str("at least one header, '")?;
                f.write_str(name.name())?;

                f.write_str("', is missing")
            }
            HeaderParsingErrorType::NotUtf8 { name, value } => {
                f.write_str("header '")?;
                f.write_str(name.name())?;
                f.write_str("' contains invalid UTF-8: ")?;

                Debug::fmt(value, f)
            }
            HeaderParsingErrorType::Parsing { kind, name, value } => {
                f.write_str("header '")?;
                f.write_str(name.name())?;
                f.write_str("' can not be parsed as a ")?;
                f.write_str(kind.name())?;
                f.write_str(": '")?;
                f.write_str(value)?;

                f.write_str("'")
            }
        }
    }
}

impl Error for HeaderParsingError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn Error + 'static))
    }
}

/// Type of [`HeaderParsingError`] that occurred.
#[derive(Debug)]
#[non_exhaustive]
pub enum HeaderParsingErrorType {
    /// Expected header is missing.
    Missing {
        /// Name of the header that should be present in the list.
        name: HeaderName,
    },
    /// Header value is not UTF-8 valid.
    NotUtf8 {
        /// Name of the header.
        name: HeaderName,
        /// Value of the header.
        value: Vec<u8>,
    },
    /// Header value is not of the expected type.
    Parsing {
        /// Type of header value expected.
        kind: HeaderType,
        /// Name of the header.
        name: HeaderName,
        /// Value of the header.
        value: String,
    },
}

/// Typed name of a ratelimit header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum HeaderName {
    /// Bucket hash assigned to the route family.
    Bucket,
    /// Whether the ratelimit applies globally.
    Global,
    /// Maximum requests allotted in the bucket.
    Limit,
    /// Remaining requests allotted.
    Remaining,
    /// When the bucket resets, as a unix timestamp.
    Reset,
    /// How long until the bucket resets.
    ResetAfter,
    /// How long until a request may be tried again.
    RetryAfter,
}

impl HeaderName {
    /// Lowercased name for the bucket header.
    pub const BUCKET: &'static str = "x-ratelimit-bucket";

    /// Lowercased name for the global header.
    pub const GLOBAL: &'static str = "x-ratelimit-global";

    /// Lowercased name for the limit header.
    pub const LIMIT: &'static str = "x-ratelimit-limit";

    /// Lowercased name for the remaining header.
    pub const REMAINING: &'static str = "x-ratelimit-remaining";

    /// Lowercased name for the reset header.
    pub const RESET: &'static str = "x-ratelimit-reset";

    /// Lowercased name for the reset-after header.
    pub const RESET_AFTER: &'static str = "x-ratelimit-reset-after";

    /// Lowercased name for the retry-after header.
    // It's correct for this to not have the `x-ratelimit-` prefix.
    pub const RETRY_AFTER: &'static str = "retry-after";

    /// Lowercased name of the header.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bucket => Self::BUCKET,
            Self::Global => Self::GLOBAL,
            Self::Limit => Self::LIMIT,
            Self::Remaining => Self::REMAINING,
            Self::Reset => Self::RESET,
            Self::ResetAfter => Self::RESET_AFTER,
            Self::RetryAfter => Self::RETRY_AFTER,
        }
    }
}

impl Display for HeaderName {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.name())
    }
}

/// Expected type of a header value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum HeaderType {
    /// Type of header value is a float.
    Float,
    /// Type of header value is an integer.
    Integer,
    /// Type of header value is a string.
    String,
}

impl HeaderType {
    /// Name of the type of header.
    const fn name(self) -> &'static str {
        match self {
            Self::Float => "float",
            Self::Integer => "integer",
            Self::String => "string",
        }
    }
}

impl Display for HeaderType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.name())
    }
}

/// Ratelimit applying to every bucket at once.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct GlobalLimited {
    /// Number of milliseconds before retrying.
    retry_after: u64,
}

impl GlobalLimited {
    /// Number of milliseconds before retrying.
    pub const fn retry_after(&self) -> u64 {
        self.retry_after
    }
}

/// A 429 that carried no bucket information, only a retry delay.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Limited {
    /// Number of milliseconds before retrying.
    retry_after: u64,
}

impl Limited {
    /// Number of milliseconds before retrying.
    pub const fn retry_after(&self) -> u64 {
        self.retry_after
    }
}

/// Bucket-scoped ratelimit information.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Present {
    /// Hashed bucket ID, if any.
    bucket: Option<Box<str>>,
    /// Whether the response also signalled a global ratelimit.
    global: bool,
    /// Total number of requests allotted to the bucket.
    limit: u64,
    /// Remaining number of requests.
    remaining: u64,
    /// When the bucket resets as a unix timestamp in milliseconds, if sent.
    reset: Option<u64>,
    /// Number of milliseconds until the bucket resets, if sent.
    reset_after: Option<u64>,
    /// Number of milliseconds until a 429'd request may be retried, if sent.
    retry_after: Option<u64>,
}

impl Present {
    /// Immutable reference to the bucket hash, if any.
    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    /// Whether the response also signalled a global ratelimit.
    pub const fn global(&self) -> bool {
        self.global
    }

    /// Total number of requests allotted to the bucket.
    pub const fn limit(&self) -> u64 {
        self.limit
    }

    /// Remaining number of requests.
    pub const fn remaining(&self) -> u64 {
        self.remaining
    }

    /// When the bucket resets as a unix timestamp in milliseconds, if sent.
    pub const fn reset(&self) -> Option<u64> {
        self.reset
    }

    /// Number of milliseconds until the bucket resets, if sent.
    pub const fn reset_after(&self) -> Option<u64> {
        self.reset_after
    }

    /// Number of milliseconds until a 429'd request may be retried, if sent.
    pub const fn retry_after(&self) -> Option<u64> {
        self.retry_after
    }
}

/// Parsed ratelimit headers.
///
/// The headers of a response may indicate a global ratelimit, a bucketed
/// ratelimit, or no ratelimit at all.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum RatelimitHeaders {
    /// Every bucket is limited at once.
    GlobalLimited(GlobalLimited),
    /// Only a retry delay was sent, without bucket information.
    Limited(Limited),
    /// No ratelimit headers were present; the route is not limited.
    None,
    /// Bucket-scoped ratelimit information is available.
    Present(Present),
}

impl RatelimitHeaders {
    /// Whether the headers are a global ratelimit.
    pub const fn is_global(&self) -> bool {
        matches!(self, Self::GlobalLimited(_))
    }

    /// Whether there are no ratelimit headers.
    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Whether bucket-scoped information is present.
    pub const fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }

    /// Number of milliseconds until a 429'd request may be retried, if the
    /// headers carried one.
    pub const fn retry_after(&self) -> Option<u64> {
        match self {
            Self::GlobalLimited(global) => Some(global.retry_after()),
            Self::Limited(limited) => Some(limited.retry_after()),
            Self::None => None,
            Self::Present(present) => present.retry_after,
        }
    }

    /// Parse headers from an iterator of name-value pairs.
    ///
    /// Header names must be lowercased and UTF-8 valid, while values *may*
    /// be UTF-8 valid; values are checked for validity prior to parsing.
    /// Fractional-second durations are scaled to whole milliseconds,
    /// rounding up.
    ///
    /// # Examples
    ///
    /// Parse a standard list of headers from a response:
    ///
    /// ```
    /// use cadence_http_ratelimiting::RatelimitHeaders;
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let headers = Vec::from([
    ///     ("x-ratelimit-bucket", "d721dea6054f6322373d361f98e5c38b".as_bytes()),
    ///     ("x-ratelimit-limit", "10".as_bytes()),
    ///     ("x-ratelimit-remaining", "9".as_bytes()),
    ///     ("x-ratelimit-reset-after", "10.000".as_bytes()),
    /// ]);
    ///
    /// let headers = RatelimitHeaders::from_pairs(headers.into_iter())?;
    /// assert!(matches!(
    ///     headers,
    ///     RatelimitHeaders::Present(p) if p.remaining() == 9,
    /// ));
    /// # Ok(()) }
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a [`HeaderParsingErrorType::Missing`] error type if a counted
    /// header was present without its counterpart, a
    /// [`HeaderParsingErrorType::NotUtf8`] error type if a value was not
    /// UTF-8 valid, and a [`HeaderParsingErrorType::Parsing`] error type if
    /// a value could not be parsed as its expected type.
    pub fn from_pairs<'a>(
        headers: impl Iterator<Item = (&'a str, &'a [u8])>,
    ) -> Result<Self, HeaderParsingError> {
        let mut bucket = None;
        let mut global = false;
        let mut limit = None;
        let mut remaining = None;
        let mut reset = None;
        let mut reset_after = None;
        let mut retry_after = None;

        for (name, value) in headers {
            match name {
                HeaderName::BUCKET => {
                    bucket.replace(header_text(HeaderName::Bucket, value)?);
                }
                HeaderName::GLOBAL => {
                    global = value == b"true";
                }
                HeaderName::LIMIT => {
                    limit.replace(header_number(
                        HeaderType::Integer,
                        HeaderName::Limit,
                        value,
                    )?);
                }
                HeaderName::REMAINING => {
                    remaining.replace(header_number(
                        HeaderType::Integer,
                        HeaderName::Remaining,
                        value,
                    )?);
                }
                HeaderName::RESET => {
                    let secs = header_number(HeaderType::Float, HeaderName::Reset, value)?;

                    reset.replace(millis(secs));
                }
                HeaderName::RESET_AFTER => {
                    let secs =
                        header_number(HeaderType::Float, HeaderName::ResetAfter, value)?;

                    reset_after.replace(millis(secs));
                }
                HeaderName::RETRY_AFTER => {
                    let secs =
                        header_number(HeaderType::Float, HeaderName::RetryAfter, value)?;

                    retry_after.replace(millis(secs));
                }
                _ => continue,
            }
        }

        // A global ratelimit only tells us how long to wait; no bucket is
        // involved.
        if global {
            if let Some(retry_after) = retry_after {
                return Ok(Self::GlobalLimited(GlobalLimited { retry_after }));
            }
        }

        // If none of the bucket-scoped values were set then either this was
        // a bare 429 or the route is not ratelimited at all.
        if bucket.is_none()
            && limit.is_none()
            && remaining.is_none()
            && reset.is_none()
            && reset_after.is_none()
        {
            return Ok(match retry_after {
                Some(retry_after) => Self::Limited(Limited { retry_after }),
                None => Self::None,
            });
        }

        Ok(Self::Present(Present {
            bucket: bucket.map(Into::into),
            global,
            limit: limit.ok_or_else(|| HeaderParsingError::missing(HeaderName::Limit))?,
            remaining: remaining
                .ok_or_else(|| HeaderParsingError::missing(HeaderName::Remaining))?,
            reset,
            reset_after,
            retry_after,
        }))
    }
}

/// Scale fractional seconds to whole milliseconds, rounding up.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn millis(secs: f64) -> u64 {
    (secs * 1000.).ceil() as u64
}

/// Decode a header value as UTF-8, attributing a failure to the header.
fn header_text(name: HeaderName, value: &[u8]) -> Result<&str, HeaderParsingError> {
    str::from_utf8(value)
        .map_err(|source| HeaderParsingError::not_utf8(name, value.to_owned(), source))
}

/// Decode and parse a header value as a number of the expected kind.
fn header_number<V: FromStr>(
    kind: HeaderType,
    name: HeaderName,
    value: &[u8],
) -> Result<V, HeaderParsingError>
where
    V::Err: Error + Send + Sync + 'static,
{
    let text = header_text(name, value)?;

    text.parse().map_err(|source| HeaderParsingError {
        kind: HeaderParsingErrorType::Parsing {
            kind,
            name,
            value: text.to_owned(),
        },
        source: Some(Box::new(source)),
    })
}
