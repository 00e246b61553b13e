//! The HTTP client boundary.
//!
//! The runtime is generic over the transport that performs a single HTTP
//! exchange: anything implementing [`HttpClient`] can be plugged in through
//! the client builder, which is also how tests substitute a scripted
//! transport. [`HyperClient`] is the default implementation.

mod hyper_client;

pub use self::hyper_client::HyperClient;

use bytes::Bytes;
use flate2::read::{GzDecoder, ZlibDecoder};
use hyper::{
    header::{HeaderMap, HeaderValue, CONTENT_ENCODING},
    Method, StatusCode,
};
use std::{
    error::Error as StdError,
    fmt::{Debug, Display, Formatter, Result as FmtResult},
    future::Future,
    io::Read,
    pin::Pin,
};

/// A single outbound HTTP exchange.
#[derive(Clone, Debug)]
pub struct TransportRequest {
    /// Request body; empty when the method carries none.
    pub body: Bytes,
    /// Complete header map, assembled by the requester.
    pub headers: HeaderMap<HeaderValue>,
    /// HTTP method.
    pub method: Method,
    /// Absolute request URL.
    pub url: String,
}

/// Status, headers, and fully buffered body of a response.
#[derive(Clone, Debug)]
pub struct TransportResponse {
    /// Raw response body, still compressed if the server compressed it.
    pub body: Bytes,
    /// Response headers.
    pub headers: HeaderMap<HeaderValue>,
    /// Response status code.
    pub status: StatusCode,
}

/// Future resolved by [`HttpClient::send`].
pub type SendFuture =
    Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + Send + 'static>>;

/// A transport able to perform a single HTTP exchange.
pub trait HttpClient: Debug + Send + Sync {
    /// Perform the exchange, buffering the response body.
    fn send(&self, request: TransportRequest) -> SendFuture;
}

/// Failure to complete an HTTP exchange.
#[derive(Debug)]
pub struct TransportError {
    pub(crate) kind: TransportErrorType,
    pub(crate) source: Option<Box<dyn StdError + Send + Sync>>,
}

impl TransportError {
    /// Immutable reference to the type of error that occurred.
    #[must_use = "retrieving the type has no effect if left unused"]
    pub const fn kind(&self) -> &TransportErrorType {
        &self.kind
    }

    /// Consume the error, returning the source error if there is any.
    #[must_use = "consuming the error and retrieving the source has no effect if left unused"]
    pub fn into_source(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.source
    }

    /// Whether the failure is in the transient set worth a single retry:
    /// timeouts, connection failures, and TLS handshake failures.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorType::Connect | TransportErrorType::TimedOut | TransportErrorType::Tls
        )
    }

    /// Construct a timeout error.
    pub fn timed_out(source: Option<Box<dyn StdError + Send + Sync>>) -> Self {
        Self {
            kind: TransportErrorType::TimedOut,
            source,
        }
    }

    /// Construct an error of the given kind.
    pub fn new(kind: TransportErrorType, source: Box<dyn StdError + Send + Sync>) -> Self {
        Self {
            kind,
            source: Some(source),
        }
    }
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self.kind {
            TransportErrorType::Connect => f.write_str("connecting to the host failed"),
            TransportErrorType::Dns => f.write_str("resolving the host failed"),
            TransportErrorType::Io => f.write_str("sending the request or reading the response failed"),
            TransportErrorType::TimedOut => f.write_str("the exchange timed out"),
            TransportErrorType::Tls => f.write_str("the tls handshake failed"),
        }
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn StdError + 'static))
    }
}

/// Type of [`TransportError`] that occurred.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum TransportErrorType {
    /// The TCP connection could not be established.
    Connect,
    /// The host name could not be resolved.
    Dns,
    /// The exchange failed mid-flight.
    Io,
    /// The exchange did not complete within the configured timeout.
    TimedOut,
    /// The TLS handshake failed.
    Tls,
}

/// Transparently inflate a gzip or deflate encoded body.
///
/// On inflate failure the raw body is returned unchanged so it can still be
/// surfaced for diagnostics.
pub(crate) fn decompress(headers: &HeaderMap<HeaderValue>, body: Bytes) -> Bytes {
    let encoding = headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok());

    let mut inflated = Vec::new();
    let result = match encoding {
        Some("gzip") => GzDecoder::new(body.as_ref()).read_to_end(&mut inflated),
        Some("deflate") => ZlibDecoder::new(body.as_ref()).read_to_end(&mut inflated),
        _ => return body,
    };

    match result {
        Ok(_) => Bytes::from(inflated),
        Err(source) => {
            tracing::warn!(%source, "inflating response body failed, surfacing raw bytes");

            body
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{decompress, TransportError, TransportErrorType};
    use bytes::Bytes;
    use flate2::{write::GzEncoder, Compression};
    use hyper::header::{HeaderMap, HeaderValue, CONTENT_ENCODING};
    use std::io::Write;

    #[test]
    fn gzip_bodies_inflate() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(br#"{"ok":true}"#).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));

        let body = decompress(&headers, Bytes::from(compressed));
        assert_eq!(br#"{"ok":true}"#.as_slice(), body.as_ref());
    }

    #[test]
    fn broken_compression_surfaces_raw_body() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));

        let raw = Bytes::from_static(b"not actually gzip");
        assert_eq!(raw, decompress(&headers, raw.clone()));
    }

    #[test]
    fn identity_bodies_pass_through() {
        let raw = Bytes::from_static(b"plain");
        assert_eq!(raw, decompress(&HeaderMap::new(), raw.clone()));
    }

    #[test]
    fn transient_kinds() {
        for kind in [
            TransportErrorType::Connect,
            TransportErrorType::TimedOut,
            TransportErrorType::Tls,
        ] {
            let error = TransportError { kind, source: None };
            assert!(error.is_transient(), "{kind:?} should be transient");
        }

        let io = TransportError {
            kind: TransportErrorType::Io,
            source: None,
        };
        assert!(!io.is_transient());
    }
}
