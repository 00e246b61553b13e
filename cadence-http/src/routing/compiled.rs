use super::{Method, Route};
use crate::error::Error;
use cadence_http_ratelimiting::Endpoint;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::fmt::{Display, Formatter, Result as FmtResult};

/// A route with every placeholder substituted, ready to dispatch.
///
/// Produced by [`Route::compile`]; immutable. Query parameters are appended
/// through [`with_query_params`], which returns a copy.
///
/// [`with_query_params`]: Self::with_query_params
#[derive(Clone, Debug)]
pub struct CompiledRoute {
    major: String,
    path: String,
    query: Vec<(String, String)>,
    route: Route,
}

impl CompiledRoute {
    pub(crate) const fn new(route: Route, path: String, major: String) -> Self {
        Self {
            major,
            path,
            query: Vec::new(),
            route,
        }
    }

    /// The route this was compiled from.
    pub const fn route(&self) -> &Route {
        &self.route
    }

    /// Method of the underlying route.
    pub const fn method(&self) -> Method {
        self.route.method()
    }

    /// Resolved path, without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Major parameter key partitioning this route's buckets.
    pub fn major(&self) -> &str {
        &self.major
    }

    /// Whether requests on this route carry the authorization token.
    pub const fn requires_auth(&self) -> bool {
        self.route.requires_auth()
    }

    /// Append query parameters, returning a new compiled route.
    ///
    /// `pairs` alternates keys and values. Keys are emitted verbatim;
    /// values are percent-encoded.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorType::InvalidArgument`] error type if `pairs` has
    /// an odd length.
    ///
    /// [`ErrorType::InvalidArgument`]: crate::error::ErrorType::InvalidArgument
    pub fn with_query_params(&self, pairs: &[&str]) -> Result<Self, Error> {
        if pairs.len() % 2 != 0 {
            return Err(Error::invalid_argument(format!(
                "query parameters must alternate key and value, got {} items",
                pairs.len(),
            )));
        }

        let mut compiled = self.clone();

        for pair in pairs.chunks_exact(2) {
            let encoded = utf8_percent_encode(pair[1], NON_ALPHANUMERIC).to_string();
            compiled.query.push((pair[0].to_owned(), encoded));
        }

        Ok(compiled)
    }

    /// The rate-limit scope of this route.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(
            self.route.method(),
            self.route.template().to_owned(),
            self.major.clone(),
        )
    }

    /// The full request target: path plus query string.
    pub fn uri(&self) -> String {
        self.to_string()
    }
}

impl Display for CompiledRoute {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.path)?;

        for (idx, (key, value)) in self.query.iter().enumerate() {
            f.write_str(if idx == 0 { "?" } else { "&" })?;
            f.write_str(key)?;
            f.write_str("=")?;
            f.write_str(value)?;
        }

        Ok(())
    }
}
