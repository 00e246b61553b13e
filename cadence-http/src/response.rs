use crate::{error::Error, json, transport::TransportError};
use bytes::Bytes;
use hyper::{header::HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Outcome of one API call as seen by response handlers.
///
/// Either an HTTP exchange completed (successfully or not) or the transport
/// failed outright; both variants accumulate the `CF-RAY` headers observed
/// across attempts for diagnostics. The body is buffered but deserialized
/// lazily through [`model`].
///
/// [`model`]: Self::model
#[derive(Debug)]
pub struct RestResponse {
    cf_rays: Vec<String>,
    kind: ResponseKind,
}

#[derive(Debug)]
enum ResponseKind {
    Completed {
        body: Bytes,
        headers: HeaderMap,
        retry_after: Option<Duration>,
        status: StatusCode,
    },
    Failed {
        source: TransportError,
    },
}

impl RestResponse {
    pub(crate) fn completed(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        retry_after: Option<Duration>,
        cf_rays: Vec<String>,
    ) -> Self {
        Self {
            cf_rays,
            kind: ResponseKind::Completed {
                body,
                headers,
                retry_after,
                status,
            },
        }
    }

    pub(crate) fn failed(source: TransportError, cf_rays: Vec<String>) -> Self {
        Self {
            cf_rays,
            kind: ResponseKind::Failed { source },
        }
    }

    /// Whether the exchange completed with a 2xx status.
    pub fn is_ok(&self) -> bool {
        matches!(&self.kind, ResponseKind::Completed { status, .. } if status.is_success())
    }

    /// Whether the exchange completed with a 429.
    pub fn is_rate_limit(&self) -> bool {
        matches!(
            &self.kind,
            ResponseKind::Completed { status, .. } if *status == StatusCode::TOO_MANY_REQUESTS,
        )
    }

    /// Whether the transport failed before any response arrived.
    pub const fn is_error(&self) -> bool {
        matches!(&self.kind, ResponseKind::Failed { .. })
    }

    /// Status code of the completed exchange, if one completed.
    pub const fn status(&self) -> Option<StatusCode> {
        match &self.kind {
            ResponseKind::Completed { status, .. } => Some(*status),
            ResponseKind::Failed { .. } => None,
        }
    }

    /// Headers of the completed exchange, if one completed.
    pub const fn headers(&self) -> Option<&HeaderMap> {
        match &self.kind {
            ResponseKind::Completed { headers, .. } => Some(headers),
            ResponseKind::Failed { .. } => None,
        }
    }

    /// Buffered response body, if an exchange completed.
    pub const fn body(&self) -> Option<&Bytes> {
        match &self.kind {
            ResponseKind::Completed { body, .. } => Some(body),
            ResponseKind::Failed { .. } => None,
        }
    }

    /// Retry delay, set only on 429 responses.
    pub const fn retry_after(&self) -> Option<Duration> {
        match &self.kind {
            ResponseKind::Completed { retry_after, .. } => *retry_after,
            ResponseKind::Failed { .. } => None,
        }
    }

    /// `CF-RAY` identifiers observed across all attempts.
    pub fn cf_rays(&self) -> &[String] {
        &self.cf_rays
    }

    /// The transport failure, if the exchange never completed.
    pub const fn transport_error(&self) -> Option<&TransportError> {
        match &self.kind {
            ResponseKind::Completed { .. } => None,
            ResponseKind::Failed { source } => Some(source),
        }
    }

    /// Deserialize the body into a model.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorType::Parsing`] error type if the body could not
    /// be deserialized, and an [`ErrorType::InvalidState`] error type if
    /// the transport failed and there is no body at all.
    ///
    /// [`ErrorType::InvalidState`]: crate::error::ErrorType::InvalidState
    /// [`ErrorType::Parsing`]: crate::error::ErrorType::Parsing
    pub fn model<T: DeserializeOwned>(&self) -> Result<T, Error> {
        match &self.kind {
            ResponseKind::Completed { body, .. } => json::from_bytes(body)
                .map_err(|source| Error::parsing(body.to_vec(), source)),
            ResponseKind::Failed { .. } => Err(Error::invalid_state(
                "a failed exchange has no body to deserialize",
            )),
        }
    }

    pub(crate) fn into_transport_error(self) -> Option<TransportError> {
        match self.kind {
            ResponseKind::Completed { .. } => None,
            ResponseKind::Failed { source } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RestResponse;
    use bytes::Bytes;
    use hyper::{header::HeaderMap, StatusCode};
    use static_assertions::assert_impl_all;
    use std::fmt::Debug;

    assert_impl_all!(RestResponse: Debug, Send, Sync);

    fn ok_response(body: &'static [u8]) -> RestResponse {
        RestResponse::completed(
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from_static(body),
            None,
            Vec::new(),
        )
    }

    #[test]
    fn classification() {
        let ok = ok_response(b"[]");
        assert!(ok.is_ok());
        assert!(!ok.is_rate_limit());
        assert!(!ok.is_error());

        let limited = RestResponse::completed(
            StatusCode::TOO_MANY_REQUESTS,
            HeaderMap::new(),
            Bytes::new(),
            Some(std::time::Duration::from_secs(2)),
            Vec::new(),
        );
        assert!(limited.is_rate_limit());
        assert!(!limited.is_ok());
    }

    #[test]
    fn lazy_model() {
        let response = ok_response(br#"{"id": 3}"#);

        #[derive(serde::Deserialize)]
        struct Entity {
            id: u64,
        }

        let entity: Entity = response.model().unwrap();
        assert_eq!(3, entity.id);

        assert!(response.model::<Vec<u64>>().is_err());
    }
}
