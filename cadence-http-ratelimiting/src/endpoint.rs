//! Identification of the rate-limit scope of a request.

use std::{
    borrow::Cow,
    fmt::{Display, Formatter, Result as FmtResult},
};

/// HTTP method of an endpoint.
///
/// The ratelimiter only needs the method to tell route families apart, so
/// this is a plain enum rather than a full HTTP method type.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Method {
    /// DELETE method.
    Delete,
    /// GET method.
    Get,
    /// PATCH method.
    Patch,
    /// POST method.
    Post,
    /// PUT method.
    Put,
}

impl Method {
    /// Name of the method.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Delete => "DELETE",
            Self::Get => "GET",
            Self::Patch => "PATCH",
            Self::Post => "POST",
            Self::Put => "PUT",
        }
    }

    /// Whether requests with this method conventionally carry a body.
    pub const fn has_body(self) -> bool {
        matches!(self, Self::Patch | Self::Post | Self::Put)
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.name())
    }
}

/// Rate-limit scope of a single compiled route.
///
/// Two requests share a route family iff their method and path template are
/// equal; the major parameter key further partitions the family into
/// buckets. The endpoint deliberately carries the *template* (with
/// `{placeholder}` segments intact) rather than the resolved path: minor
/// parameters must not split buckets.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Endpoint {
    major: String,
    method: Method,
    template: Cow<'static, str>,
}

impl Endpoint {
    /// Create an endpoint from its parts.
    pub fn new(
        method: Method,
        template: impl Into<Cow<'static, str>>,
        major: impl Into<String>,
    ) -> Self {
        Self {
            major: major.into(),
            method,
            template: template.into(),
        }
    }

    /// Method of the route family.
    pub const fn method(&self) -> Method {
        self.method
    }

    /// Path template of the route family, with placeholders intact.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Major parameter key partitioning this family's buckets.
    pub fn major(&self) -> &str {
        &self.major
    }

    /// Key identifying the route family, shared by every request that can
    /// share a bucket hash: `"METHOD/template"`.
    pub fn bucket_route(&self) -> String {
        let mut route = String::with_capacity(self.method.name().len() + 1 + self.template.len());
        route.push_str(self.method.name());
        route.push('/');
        route.push_str(&self.template);

        route
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.method.name())?;
        f.write_str("/")?;
        f.write_str(&self.template)?;
        f.write_str(":")?;

        f.write_str(&self.major)
    }
}
