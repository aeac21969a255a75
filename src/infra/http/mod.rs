mod admin;
pub mod error;
mod middleware;
mod public;

pub use admin::{AdminState, build_admin_router};
pub use middleware::RequestContext;
pub use public::{HttpState, build_router};

/// Requests carrying this header are rendered as include fragments.
pub const INCLUDE_REQUEST_HEADER: &str = "x-strata-include";
