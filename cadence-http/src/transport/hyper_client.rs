use super::{HttpClient, SendFuture, TransportError, TransportErrorType, TransportRequest, TransportResponse};
use hyper::{
    client::{Client, HttpConnector},
    Body,
};
use std::time::Duration;
use tokio::time;

#[cfg(any(feature = "rustls-native-roots", feature = "rustls-webpki-roots"))]
type Connector = hyper_rustls::HttpsConnector<HttpConnector>;
#[cfg(not(any(feature = "rustls-native-roots", feature = "rustls-webpki-roots")))]
type Connector = HttpConnector;

#[cfg(any(feature = "rustls-native-roots", feature = "rustls-webpki-roots"))]
fn connector() -> Connector {
    let builder = hyper_rustls::HttpsConnectorBuilder::new();

    #[cfg(feature = "rustls-native-roots")]
    let builder = builder.with_native_roots();
    #[cfg(all(feature = "rustls-webpki-roots", not(feature = "rustls-native-roots")))]
    let builder = builder.with_webpki_roots();

    builder.https_or_http().enable_http1().enable_http2().build()
}

#[cfg(not(any(feature = "rustls-native-roots", feature = "rustls-webpki-roots")))]
fn connector() -> Connector {
    HttpConnector::new()
}

/// Default transport on a pooled hyper client.
///
/// Each exchange is bounded by the configured timeout and its response body
/// is buffered in full before being handed back.
#[derive(Debug)]
pub struct HyperClient {
    http: Client<Connector, Body>,
    timeout: Duration,
}

impl HyperClient {
    /// Create a client whose exchanges time out after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: Client::builder().build(connector()),
            timeout,
        }
    }
}

impl HttpClient for HyperClient {
    fn send(&self, request: TransportRequest) -> SendFuture {
        let timeout = self.timeout;

        let mut builder = hyper::Request::builder()
            .method(request.method.clone())
            .uri(&request.url);

        if let Some(headers) = builder.headers_mut() {
            *headers = request.headers.clone();
        }

        let built = builder.body(Body::from(request.body.clone()));
        let http = self.http.clone();

        Box::pin(async move {
            let req = built.map_err(|source| TransportError::new(
                TransportErrorType::Io,
                Box::new(source),
            ))?;

            let response = time::timeout(timeout, http.request(req))
                .await
                .map_err(|source| TransportError::timed_out(Some(Box::new(source))))?
                .map_err(from_hyper)?;

            let (parts, body) = response.into_parts();
            let body = hyper::body::to_bytes(body)
                .await
                .map_err(|source| TransportError::new(
                    TransportErrorType::Io,
                    Box::new(source),
                ))?;

            Ok(TransportResponse {
                body,
                headers: parts.headers,
                status: parts.status,
            })
        })
    }
}

/// Classify a hyper error into the transport taxonomy.
fn from_hyper(source: hyper::Error) -> TransportError {
    let kind = if source.is_connect() {
        TransportErrorType::Connect
    } else if source.is_timeout() {
        TransportErrorType::TimedOut
    } else {
        TransportErrorType::Io
    };

    TransportError::new(kind, Box::new(source))
}
