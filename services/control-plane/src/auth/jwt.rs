//! HS256 tokens: user access tokens and short-lived OAuth `state` values

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{User, UserRole};

/// OAuth state tokens are valid for ten minutes
const STATE_TTL_SECS: i64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    OauthState,
}

/// Access token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub email: String,
    pub role: UserRole,
    pub typ: TokenType,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateClaims {
    provider: String,
    nonce: String,
    typ: TokenType,
    exp: i64,
}

#[derive(Clone)]
pub struct JwtService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_secs: i64,
}

impl std::fmt::Debug for JwtService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtService")
            .field("ttl_secs", &self.ttl_secs)
            .finish_non_exhaustive()
    }
}

impl JwtService {
    pub fn new(secret: &str, ttl_secs: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl_secs,
        }
    }

    pub fn ttl_secs(&self) -> i64 {
        self.ttl_secs
    }

    pub fn issue_access_token(&self, user: &User) -> jsonwebtoken::errors::Result<String> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user.id,
            email: user.email.clone(),
            role: user.role,
            typ: TokenType::Access,
            iat: now,
            exp: now + self.ttl_secs,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
    }

    pub fn validate_access_token(&self, token: &str) -> jsonwebtoken::errors::Result<Claims> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))?;
        if data.claims.typ != TokenType::Access {
            return Err(jsonwebtoken::errors::ErrorKind::InvalidToken.into());
        }
        Ok(data.claims)
    }

    /// Signed, expiring `state` parameter bound to one provider
    pub fn issue_state(&self, provider: &str) -> jsonwebtoken::errors::Result<String> {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        let claims = StateClaims {
            provider: provider.to_string(),
            nonce: hex::encode(nonce),
            typ: TokenType::OauthState,
            exp: Utc::now().timestamp() + STATE_TTL_SECS,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
    }

    pub fn verify_state(&self, state: &str, provider: &str) -> bool {
        match decode::<StateClaims>(state, &self.decoding, &Validation::new(Algorithm::HS256)) {
            Ok(data) => data.claims.typ == TokenType::OauthState && data.claims.provider == provider,
            Err(e) => {
                tracing::debug!("OAuth state rejected: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(role: UserRole) -> User {
        User {
            id: Uuid::new_v4(),
            email: "dev@example.com".to_string(),
            display_name: None,
            role,
            oauth_provider: "github".to_string(),
            oauth_subject: "42".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_access_token_roundtrip() {
        let jwt = JwtService::new("0123456789abcdef0123456789abcdef", 3600);
        let u = user(UserRole::Developer);
        let token = jwt.issue_access_token(&u).unwrap();
        let claims = jwt.validate_access_token(&token).unwrap();
        assert_eq!(claims.sub, u.id);
        assert_eq!(claims.role, UserRole::Developer);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let a = JwtService::new("0123456789abcdef0123456789abcdef", 3600);
        let b = JwtService::new("fedcba9876543210fedcba9876543210", 3600);
        let token = a.issue_access_token(&user(UserRole::User)).unwrap();
        assert!(b.validate_access_token(&token).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let jwt = JwtService::new("0123456789abcdef0123456789abcdef", -3600);
        let token = jwt.issue_access_token(&user(UserRole::User)).unwrap();
        assert!(jwt.validate_access_token(&token).is_err());
    }

    #[test]
    fn test_state_is_not_an_access_token() {
        let jwt = JwtService::new("0123456789abcdef0123456789abcdef", 3600);
        let state = jwt.issue_state("google").unwrap();
        assert!(jwt.verify_state(&state, "google"));
        assert!(!jwt.verify_state(&state, "github"));
        assert!(jwt.validate_access_token(&state).is_err());
    }
}
