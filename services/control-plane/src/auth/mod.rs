//! Login: OAuth providers and the JWTs issued after a successful callback

pub mod jwt;
pub mod oauth;

pub use jwt::{Claims, JwtService};
pub use oauth::{OAuthError, OAuthProfile, OAuthProvider, OAuthRegistry, ProviderKind};
