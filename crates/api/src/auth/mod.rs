//! Authentication for Kabuscope

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtError, JwtManager, ADMIN_ROLE, USER_ROLE};
pub use middleware::{require_admin, require_auth, AuthError, AuthState, AuthUser};
