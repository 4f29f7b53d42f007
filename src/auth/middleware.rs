//! Session middleware for Axum
//!
//! Resolves the acting session once per request and stores it in the request
//! extensions for handlers to extract.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use uuid::Uuid;

use super::{AuthError, JwtValidator};
use crate::domain::{ActorRole, SessionContext};

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";
pub const SESSION_ID_HEADER: &str = "x-session-id";

/// Resolves a [`SessionContext`] from request headers
pub struct Authenticator {
    jwt_validator: Option<Arc<JwtValidator>>,
    /// Trust `x-actor-id` / `x-actor-role` headers (development only)
    trust_headers: bool,
}

impl Authenticator {
    pub fn new() -> Self {
        Self {
            jwt_validator: None,
            trust_headers: false,
        }
    }

    pub fn with_jwt(mut self, jwt_validator: Arc<JwtValidator>) -> Self {
        self.jwt_validator = Some(jwt_validator);
        self
    }

    pub fn trusting_headers(mut self, trust: bool) -> Self {
        self.trust_headers = trust;
        self
    }

    /// Authenticate a request
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<SessionContext, AuthError> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        if let Some(auth) = header(AUTHORIZATION.as_str()) {
            let token = auth
                .strip_prefix("Bearer ")
                .ok_or_else(|| AuthError::InvalidJwt("expected a bearer token".to_string()))?;
            return match &self.jwt_validator {
                Some(jwt) => jwt.validate(token),
                None => Err(AuthError::InvalidJwt("JWT not configured".to_string())),
            };
        }

        if self.trust_headers {
            if let Some(role) = header(ACTOR_ROLE_HEADER) {
                let role = ActorRole::parse(role)
                    .ok_or_else(|| AuthError::InvalidHeader(format!("unknown role {role}")))?;
                let actor_id = match header(ACTOR_ID_HEADER) {
                    Some(id) => Uuid::parse_str(id)
                        .map_err(|_| AuthError::InvalidHeader(format!("invalid actor id {id}")))?,
                    None => Uuid::nil(),
                };
                let mut session = SessionContext::new(actor_id, role);
                if let Some(sid) = header(SESSION_ID_HEADER) {
                    session = session.with_session_id(sid);
                }
                return Ok(session);
            }
        }

        match header(SESSION_ID_HEADER) {
            Some(sid) => Ok(SessionContext::anonymous(sid)),
            None => Err(AuthError::MissingAuth),
        }
    }
}

impl Default for Authenticator {
    fn default() -> Self {
        Self::new()
    }
}

/// Session middleware state
#[derive(Clone)]
pub struct AuthMiddlewareState {
    pub authenticator: Arc<Authenticator>,
    /// If false, unauthenticated requests act as a nil admin (dev mode)
    pub require_auth: bool,
}

/// Session middleware
pub async fn session_middleware(
    State(state): State<AuthMiddlewareState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let session = match state.authenticator.authenticate(request.headers()) {
        Ok(session) => session,
        Err(AuthError::MissingAuth) if !state.require_auth => SessionContext::admin(Uuid::nil()),
        Err(e) => return auth_error_response(e),
    };

    request.extensions_mut().insert(session);
    next.run(request).await
}

/// Convert auth error to HTTP response
fn auth_error_response(error: AuthError) -> Response {
    let (status, code) = match &error {
        AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "missing_auth"),
        AuthError::InvalidJwt(_) => (StatusCode::UNAUTHORIZED, "invalid_jwt"),
        AuthError::TokenExpired => (StatusCode::UNAUTHORIZED, "token_expired"),
        AuthError::InvalidHeader(_) => (StatusCode::BAD_REQUEST, "invalid_session_header"),
    };

    (
        status,
        axum::Json(serde_json::json!({
            "error": error.to_string(),
            "code": code,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use chrono::Duration;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_missing_credentials() {
        let auth = Authenticator::new();
        assert!(matches!(
            auth.authenticate(&HeaderMap::new()),
            Err(AuthError::MissingAuth)
        ));
    }

    #[test]
    fn test_anonymous_checkout_session() {
        let auth = Authenticator::new();
        let session = auth
            .authenticate(&headers(&[(SESSION_ID_HEADER, "cart-1")]))
            .unwrap();
        assert_eq!(session.role, ActorRole::Anonymous);
        assert_eq!(session.session_id.as_deref(), Some("cart-1"));
    }

    #[test]
    fn test_actor_headers_ignored_unless_trusted() {
        let id = Uuid::new_v4().to_string();
        let declared = headers(&[
            (ACTOR_ID_HEADER, id.as_str()),
            (ACTOR_ROLE_HEADER, "admin"),
        ]);

        assert!(Authenticator::new().authenticate(&declared).is_err());

        let session = Authenticator::new()
            .trusting_headers(true)
            .authenticate(&declared)
            .unwrap();
        assert!(session.is_admin());
        assert_eq!(session.actor_id.to_string(), id);
    }

    #[test]
    fn test_bearer_token() {
        let jwt = Arc::new(JwtValidator::new(
            b"secret",
            JwtValidator::DEFAULT_ISSUER,
            JwtValidator::DEFAULT_AUDIENCE,
        ));
        let token = jwt
            .issue(&SessionContext::admin(Uuid::new_v4()), Duration::minutes(5))
            .unwrap();
        let auth = Authenticator::new().with_jwt(jwt);
        let bearer = format!("Bearer {token}");
        let session = auth
            .authenticate(&headers(&[("authorization", bearer.as_str())]))
            .unwrap();
        assert!(session.is_admin());

        assert!(matches!(
            Authenticator::new().authenticate(&headers(&[("authorization", bearer.as_str())])),
            Err(AuthError::InvalidJwt(_))
        ));
    }
}
