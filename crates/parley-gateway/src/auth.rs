use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

use parley_types::models::UserId;

use crate::error::AuthError;

/// Who a connection or request acts as. Passed explicitly into every chat operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
}

/// Turns an opaque, already-issued credential into an identity.
pub trait CredentialResolver: Send + Sync + 'static {
    fn resolve(&self, token: &str) -> Result<Identity, AuthError>;
}

/// JWT claims issued by the platform's identity service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: UserId,
    pub username: String,
    pub exp: usize,
}

/// Verifies HS256 tokens signed with a shared secret.
pub struct JwtResolver {
    key: DecodingKey,
    validation: Validation,
}

impl JwtResolver {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }
}

impl CredentialResolver for JwtResolver {
    fn resolve(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }

        let token_data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AuthError::Invalid(e.to_string()))?;

        Ok(Identity {
            user_id: token_data.claims.sub,
            username: token_data.claims.username,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};

    fn token(secret: &str, sub: UserId, exp: chrono::DateTime<chrono::Utc>) -> String {
        let claims = Claims {
            sub,
            username: format!("user{sub}"),
            exp: exp.timestamp() as usize,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn resolves_valid_token() {
        let resolver = JwtResolver::new("secret");
        let identity = resolver
            .resolve(&token("secret", 42, chrono::Utc::now() + chrono::Duration::hours(1)))
            .unwrap();
        assert_eq!(
            identity,
            Identity {
                user_id: 42,
                username: "user42".into()
            }
        );
    }

    #[test]
    fn rejects_wrong_secret_and_expired_tokens() {
        let resolver = JwtResolver::new("secret");
        let forged = token("other", 1, chrono::Utc::now() + chrono::Duration::hours(1));
        assert!(matches!(resolver.resolve(&forged), Err(AuthError::Invalid(_))));

        let expired = token("secret", 1, chrono::Utc::now() - chrono::Duration::hours(1));
        assert!(matches!(resolver.resolve(&expired), Err(AuthError::Invalid(_))));

        assert!(matches!(resolver.resolve(""), Err(AuthError::Missing)));
        assert!(matches!(resolver.resolve("garbage"), Err(AuthError::Invalid(_))));
    }
}
