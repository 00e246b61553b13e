#![allow(dead_code)]

use bytes::Bytes;
use cadence_http::{
    transport::{HttpClient, SendFuture, TransportError, TransportRequest, TransportResponse},
    Client,
};
use hyper::{
    header::{HeaderMap, HeaderName, HeaderValue},
    StatusCode,
};
use serde::Deserialize;
use std::{
    collections::VecDeque,
    fmt::{Debug, Formatter, Result as FmtResult},
    sync::{Arc, Mutex},
};

/// Minimal entity used across the tests.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Entity {
    pub id: u64,
}

/// One scripted exchange outcome.
pub enum Script {
    Fail(TransportError),
    Respond(TransportResponse),
}

/// Transport replaying a script of outcomes, recording every request.
///
/// Once the script is exhausted it answers `200 []`.
pub struct MockTransport {
    requests: Mutex<Vec<TransportRequest>>,
    script: Mutex<VecDeque<Script>>,
}

impl MockTransport {
    pub fn new(script: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            script: Mutex::new(script.into()),
        })
    }

    /// Requests sent so far.
    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of requests sent so far.
    pub fn sent(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl Debug for MockTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("MockTransport").finish_non_exhaustive()
    }
}

impl HttpClient for MockTransport {
    fn send(&self, request: TransportRequest) -> SendFuture {
        self.requests.lock().unwrap().push(request);
        let next = self.script.lock().unwrap().pop_front();

        Box::pin(async move {
            match next {
                Some(Script::Fail(error)) => Err(error),
                Some(Script::Respond(response)) => Ok(response),
                None => Ok(response(200, "[]", &[])),
            }
        })
    }
}

/// Build a response from a status, body, and header pairs.
pub fn response(status: u16, body: &str, headers: &[(&str, &str)]) -> TransportResponse {
    let mut map = HeaderMap::new();

    for (name, value) in headers {
        map.insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }

    TransportResponse {
        body: Bytes::from(body.to_owned()),
        headers: map,
        status: StatusCode::from_u16(status).unwrap(),
    }
}

/// A client wired to the given transport with test configuration.
pub fn client(transport: Arc<MockTransport>) -> Client {
    Client::builder()
        .base_url("https://api.example.test/v1")
        .user_agent("cadence-tests (https://example.test, 0.1)")
        .token("Bot test-token")
        .http_client(transport)
        .build()
        .unwrap()
}
