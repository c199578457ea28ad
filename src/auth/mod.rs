//! HTTP authentication plumbing.
//!
//! Access tokens travel as bearer credentials and are verified statelessly.
//! Refresh tokens travel in an HTTP-only cookie scoped to the session routes.

mod cookie;
mod errors;
mod extractors;
mod ip;
mod state;

pub use cookie::{REFRESH_COOKIE_NAME, clear_refresh_cookie, get_cookie, refresh_cookie};
pub use errors::{ApiAuthError, AuthErrorKind};
pub use extractors::{BearerAuth, bearer_token};
pub use ip::{HasHeadersAndExtensions, extract_client_ip};
pub use state::HasTokenCodec;
