use super::{CompiledRoute, Method};
use crate::error::Error;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::{
    borrow::Cow,
    fmt::{Display, Formatter, Result as FmtResult},
    hash::{Hash, Hasher},
};

/// Placeholder names whose values partition rate-limit buckets.
///
/// Requests with identical method and template but distinct values for any
/// of these parameters never share a bucket.
pub const MAJOR_PARAMS: [&str; 4] = [
    "channel_id",
    "guild_id",
    "webhook_id",
    "interaction_token",
];

/// Sentinel major parameter key for routes without major parameters.
pub(crate) const NO_MAJOR: &str = "N/A";

/// One slash-delimited piece of a route template.
#[derive(Clone, Debug)]
pub(crate) enum Segment {
    /// Fixed text, emitted verbatim.
    Literal(String),
    /// A `{name}` placeholder, replaced by a positional argument.
    Param(String),
}

/// A family of API calls sharing one path template and rate-limit scope.
///
/// Templates are slash-delimited sequences of literal segments and `{name}`
/// placeholders:
///
/// ```
/// use cadence_http::routing::Route;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let route = Route::get("channels/{channel_id}/messages")?;
/// let compiled = route.compile(&["111"])?;
///
/// assert_eq!("channels/111/messages", compiled.path());
/// # Ok(()) }
/// ```
///
/// Two routes are equal iff their method and template are equal; the number
/// of placeholders is fixed at construction.
#[derive(Clone, Debug)]
pub struct Route {
    method: Method,
    param_count: usize,
    requires_auth: bool,
    segments: Vec<Segment>,
    template: Cow<'static, str>,
}

impl Route {
    /// Parse a template into a route.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorType::InvalidArgument`] error type if a segment
    /// contains a brace without forming a whole `{name}` placeholder, or if
    /// a placeholder is empty.
    ///
    /// [`ErrorType::InvalidArgument`]: crate::error::ErrorType::InvalidArgument
    pub fn new(method: Method, template: impl Into<Cow<'static, str>>) -> Result<Self, Error> {
        let template = template.into();
        let trimmed = template.trim_matches('/');
        let mut segments = Vec::new();
        let mut param_count = 0;

        for segment in trimmed.split('/') {
            if segment.starts_with('{') && segment.ends_with('}') && segment.len() > 2 {
                let name = &segment[1..segment.len() - 1];

                if name.contains(&['{', '}'][..]) {
                    return Err(Error::invalid_argument(format!(
                        "malformed placeholder segment '{segment}' in template '{template}'",
                    )));
                }

                segments.push(Segment::Param(name.to_owned()));
                param_count += 1;
            } else if segment.contains(&['{', '}'][..]) {
                return Err(Error::invalid_argument(format!(
                    "segment '{segment}' in template '{template}' is neither a literal nor a '{{name}}' placeholder",
                )));
            } else {
                segments.push(Segment::Literal(segment.to_owned()));
            }
        }

        Ok(Self {
            method,
            param_count,
            requires_auth: true,
            segments,
            template,
        })
    }

    /// Shorthand for a GET route.
    ///
    /// # Errors
    ///
    /// Refer to [`new`] for error information.
    ///
    /// [`new`]: Self::new
    pub fn get(template: impl Into<Cow<'static, str>>) -> Result<Self, Error> {
        Self::new(Method::Get, template)
    }

    /// Shorthand for a POST route.
    ///
    /// # Errors
    ///
    /// Refer to [`new`] for error information.
    ///
    /// [`new`]: Self::new
    pub fn post(template: impl Into<Cow<'static, str>>) -> Result<Self, Error> {
        Self::new(Method::Post, template)
    }

    /// Shorthand for a PUT route.
    ///
    /// # Errors
    ///
    /// Refer to [`new`] for error information.
    ///
    /// [`new`]: Self::new
    pub fn put(template: impl Into<Cow<'static, str>>) -> Result<Self, Error> {
        Self::new(Method::Put, template)
    }

    /// Shorthand for a PATCH route.
    ///
    /// # Errors
    ///
    /// Refer to [`new`] for error information.
    ///
    /// [`new`]: Self::new
    pub fn patch(template: impl Into<Cow<'static, str>>) -> Result<Self, Error> {
        Self::new(Method::Patch, template)
    }

    /// Shorthand for a DELETE route.
    ///
    /// # Errors
    ///
    /// Refer to [`new`] for error information.
    ///
    /// [`new`]: Self::new
    pub fn delete(template: impl Into<Cow<'static, str>>) -> Result<Self, Error> {
        Self::new(Method::Delete, template)
    }

    /// Whether requests on this route carry the configured authorization
    /// token. Defaults to `true`.
    pub const fn require_auth(mut self, requires_auth: bool) -> Self {
        self.requires_auth = requires_auth;

        self
    }

    /// Method of the route.
    pub const fn method(&self) -> Method {
        self.method
    }

    /// The template as given at construction.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Number of placeholders in the template.
    pub const fn param_count(&self) -> usize {
        self.param_count
    }

    /// Whether requests on this route carry the authorization token.
    pub const fn requires_auth(&self) -> bool {
        self.requires_auth
    }

    /// Substitute positional arguments into the template using the default
    /// major parameter set.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorType::InvalidArgument`] error type if the argument
    /// count does not match the placeholder count.
    ///
    /// [`ErrorType::InvalidArgument`]: crate::error::ErrorType::InvalidArgument
    pub fn compile(&self, args: &[&str]) -> Result<CompiledRoute, Error> {
        self.compile_with(args, &MAJOR_PARAMS)
    }

    /// Substitute positional arguments using a custom major parameter set.
    ///
    /// Each argument is percent-encoded into its placeholder's position.
    /// Values substituting a name in `major_params` are concatenated, in
    /// template order, into the compiled route's major parameter key; when
    /// none apply the key is the `"N/A"` sentinel.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorType::InvalidArgument`] error type if the argument
    /// count does not match the placeholder count.
    ///
    /// [`ErrorType::InvalidArgument`]: crate::error::ErrorType::InvalidArgument
    pub fn compile_with(
        &self,
        args: &[&str],
        major_params: &[&str],
    ) -> Result<CompiledRoute, Error> {
        if args.len() != self.param_count {
            return Err(Error::invalid_argument(format!(
                "route '{}' takes {} arguments, got {}",
                self.template,
                self.param_count,
                args.len(),
            )));
        }

        let mut path = String::new();
        let mut major = String::new();
        let mut next_arg = 0;

        for segment in &self.segments {
            if !path.is_empty() {
                path.push('/');
            }

            match segment {
                Segment::Literal(literal) => path.push_str(literal),
                Segment::Param(name) => {
                    let value = args[next_arg];
                    next_arg += 1;

                    path.extend(utf8_percent_encode(value, NON_ALPHANUMERIC));

                    if major_params.contains(&name.as_str()) {
                        if !major.is_empty() {
                            major.push(':');
                        }

                        major.push_str(value);
                    }
                }
            }
        }

        if major.is_empty() {
            major.push_str(NO_MAJOR);
        }

        Ok(CompiledRoute::new(self.clone(), path, major))
    }
}

impl Display for Route {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.method.name())?;
        f.write_str("/")?;

        f.write_str(&self.template)
    }
}

impl PartialEq for Route {
    fn eq(&self, other: &Self) -> bool {
        self.method == other.method && self.template == other.template
    }
}

impl Eq for Route {}

impl Hash for Route {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.method.hash(state);
        self.template.hash(state);
    }
}
