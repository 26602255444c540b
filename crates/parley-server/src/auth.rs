//! Bearer-token authentication for the upgrade endpoint and the HTTP routes.

use axum::extract::{FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use parley_core::{AuthError, TokenValidator, UserId};

use crate::server::AppState;

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Credential from `Authorization: Bearer <token>`, falling back to the
/// `token` query parameter. The header wins when both are present.
pub fn extract_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let from_header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            let (scheme, token) = value.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        })
        .filter(|token| !token.is_empty())
        .map(str::to_owned);
    if from_header.is_some() {
        return from_header;
    }

    Query::<TokenQuery>::try_from_uri(uri)
        .ok()
        .and_then(|Query(q)| q.token)
        .filter(|token| !token.is_empty())
}

/// Claims issued by the account service. `user_id` is preferred; `sub` is
/// accepted for tokens minted by standard tooling.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    pub exp: u64,
}

/// HS256 JWT validator.
pub struct JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn hs256(secret: &SecretString) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation,
        }
    }
}

impl TokenValidator for JwtValidator {
    fn validate_token(&self, token: &str) -> Result<UserId, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::InvalidToken(e.to_string()),
        })?;

        let claims = data.claims;
        claims
            .user_id
            .or(claims.sub)
            .filter(|id| !id.is_empty())
            .map(UserId::from_raw)
            .ok_or_else(|| AuthError::InvalidToken("token carries no user id".into()))
    }
}

/// Extractor for the authenticated caller of a routed request.
#[derive(Clone, Debug)]
pub struct AuthenticatedUser(pub UserId);

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = extract_token(&parts.headers, &parts.uri).ok_or(AuthError::MissingCredentials)?;
        let user_id = state.validator.validate_token(&token)?;
        Ok(Self(user_id))
    }
}

/// `401` with a JSON `{ "error": ... }` body.
#[derive(Debug)]
pub struct AuthRejection(pub AuthError);

impl From<AuthError> for AuthRejection {
    fn from(err: AuthError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        debug!(kind = self.0.error_kind(), error = %self.0, "rejected request");
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (StatusCode::UNAUTHORIZED, body).into_response()
    }
}
