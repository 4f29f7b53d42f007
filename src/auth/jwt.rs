//! JWT authentication
//!
//! Tokens carry the actor id (`sub`), its role and, for anonymous checkouts,
//! the client-side session id.

use super::AuthError;
use crate::domain::{ActorRole, SessionContext};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JWT claims for courier-flow sessions
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (actor id)
    pub sub: String,

    /// Actor role (`driver`, `admin`, `customer`, `b2b_client`, `anonymous`)
    pub role: String,

    /// Anonymous checkout session
    #[serde(default)]
    pub sid: Option<String>,

    /// Issuer
    pub iss: String,

    /// Audience
    pub aud: String,

    /// Expiration time (Unix timestamp)
    pub exp: i64,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Not before (Unix timestamp)
    pub nbf: i64,

    /// JWT ID
    pub jti: String,
}

/// JWT validator and issuer
pub struct JwtValidator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    audience: String,
}

impl JwtValidator {
    pub const DEFAULT_ISSUER: &'static str = "courier-flow";
    pub const DEFAULT_AUDIENCE: &'static str = "courier-flow-api";

    /// Create a new JWT validator with a secret key
    pub fn new(secret: &[u8], issuer: &str, audience: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            issuer: issuer.to_string(),
            audience: audience.to_string(),
        }
    }

    /// Issue a token for a session
    pub fn issue(&self, session: &SessionContext, ttl: Duration) -> Result<String, AuthError> {
        let now = Utc::now();
        let exp = now + ttl;

        let claims = Claims {
            sub: session.actor_id.to_string(),
            role: session.role.as_str().to_string(),
            sid: session.session_id.clone(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AuthError::InvalidJwt(e.to_string()))
    }

    /// Validate a token and rebuild the session it was issued for
    pub fn validate(&self, token: &str) -> Result<SessionContext, AuthError> {
        let mut validation = Validation::default();
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);

        let token_data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidJwt(e.to_string()),
            }
        })?;

        let claims = token_data.claims;
        let actor_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| AuthError::InvalidJwt("invalid actor id".to_string()))?;
        let role = ActorRole::parse(&claims.role)
            .ok_or_else(|| AuthError::InvalidJwt(format!("unknown role {}", claims.role)))?;

        let mut session = SessionContext::new(actor_id, role);
        if let Some(sid) = claims.sid.filter(|s| !s.is_empty()) {
            session = session.with_session_id(sid);
        }
        Ok(session)
    }
}
