//! Route templates and their compiled, dispatchable form.

mod compiled;
mod route;

pub use self::{
    compiled::CompiledRoute,
    route::{Route, MAJOR_PARAMS},
};
pub use cadence_http_ratelimiting::endpoint::Method;
