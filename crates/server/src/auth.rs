use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    InvalidToken,
}

impl Display for AuthError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingToken => write!(f, "no token provided"),
            Self::InvalidToken => write!(f, "invalid or expired token"),
        }
    }
}

impl Error for AuthError {}

/// Identity resolved from a connect-time token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: String,
    pub email: String,
}

/// Resolves a handshake token to a user identity, once per connection.
pub trait AuthVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<AuthContext, AuthError>;
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    email: String,
    #[allow(dead_code)]
    exp: i64,
}

/// HS256 JWT verification against a shared secret.
pub struct JwtVerifier {
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        JwtVerifier {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl AuthVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<AuthContext, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|_| AuthError::InvalidToken)?;
        if data.claims.sub.is_empty() {
            return Err(AuthError::InvalidToken);
        }
        Ok(AuthContext {
            user_id: data.claims.sub,
            email: data.claims.email,
        })
    }
}

/// Pulls the handshake token out of the request line or headers.
///
/// Accepts `?token=...` on the upgrade URI or `Authorization: Bearer ...`,
/// in that order.
pub fn token_from_request(uri: &str, authorization: Option<&str>) -> Option<String> {
    if let Some((_, query)) = uri.split_once('?') {
        for pair in query.split('&') {
            if let Some((key, value)) = pair.split_once('=') {
                if key == "token" && !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    if let Some(header) = authorization {
        if let Some(token) = header.strip_prefix("Bearer ") {
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    None
}
