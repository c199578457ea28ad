//! Authentication state trait and macro.

use crate::jwt::TokenCodec;

/// Trait for state types that can verify access tokens.
pub trait HasTokenCodec {
    fn codec(&self) -> &TokenCodec;
}

/// Implement `HasTokenCodec` for a state struct with a
/// `session: Arc<SessionService>` field.
///
/// # Example
/// ```ignore
/// #[derive(Clone)]
/// pub struct MyState {
///     pub session: Arc<SessionService>,
/// }
///
/// impl_has_token_codec!(MyState);
/// ```
#[macro_export]
macro_rules! impl_has_token_codec {
    ($state_type:ty) => {
        impl $crate::auth::HasTokenCodec for $state_type {
            fn codec(&self) -> &$crate::jwt::TokenCodec {
                self.session.codec()
            }
        }
    };
}
