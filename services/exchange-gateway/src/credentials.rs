//! Exchange API credentials.

/// API key pair for an authenticated venue.
///
/// `Debug` never prints the secret.
#[derive(Clone)]
pub struct ApiCredentials {
    api_key: String,
    api_secret: String,
}

impl ApiCredentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Public key, safe to log
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Secret key; only hand this to the signer
    pub fn expose_secret(&self) -> &str {
        &self.api_secret
    }

    pub fn is_empty(&self) -> bool {
        self.api_key.is_empty() || self.api_secret.is_empty()
    }
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_secret() {
        let creds = ApiCredentials::new("public-key", "super-secret");
        let printed = format!("{:?}", creds);
        assert!(printed.contains("public-key"));
        assert!(!printed.contains("super-secret"));
    }

    #[test]
    fn test_is_empty() {
        assert!(ApiCredentials::new("", "x").is_empty());
        assert!(!ApiCredentials::new("k", "s").is_empty());
    }
}
