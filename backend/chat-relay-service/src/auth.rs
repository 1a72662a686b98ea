//! Handshake authentication.
//!
//! The relay only needs a verified [`Principal`]; how tokens are issued is
//! someone else's concern. [`JwtAuthenticator`] validates HS256 tokens
//! signed with the shared `JWT_SECRET`.

use crate::models::Principal;
use actix_web::http::header::AUTHORIZATION;
use actix_web::{web, HttpRequest};
use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("no token in Authorization header or auth query parameter")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),
}

/// Raw token candidates taken from the upgrade request
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub bearer: Option<String>,
    pub query_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    auth: Option<String>,
}

impl Credentials {
    pub fn from_request(req: &HttpRequest) -> Self {
        let bearer = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let query_token = web::Query::<TokenQuery>::from_query(req.query_string())
            .ok()
            .and_then(|q| q.into_inner().auth)
            .filter(|s| !s.is_empty());

        Self {
            bearer,
            query_token,
        }
    }

    /// Header wins over query
    pub fn token(&self) -> Option<&str> {
        self.bearer.as_deref().or(self.query_token.as_deref())
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Principal, AuthError>;
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(rename = "userName", default)]
    user_name: Option<String>,
}

pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        let claims = data.claims;
        if claims.sub.is_empty() {
            return Err(AuthError::InvalidToken("empty subject".into()));
        }
        let username = claims.user_name.unwrap_or_else(|| claims.sub.clone());
        Ok(Principal::new(claims.sub, username))
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Principal, AuthError> {
        let token = credentials.token().ok_or(AuthError::MissingToken)?;
        self.verify(token)
    }
}
