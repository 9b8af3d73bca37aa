// Owner identity for dataset routes
//
// AUTH_MODE=basic checks HTTP Basic credentials against AUTH_USERS.
// AUTH_MODE=none trusts an `X-User` header and falls back to "anonymous".

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tracing::debug;

use crate::config::{AuthConfig, AuthMode};
use crate::models::AppState;
use crate::types::AppError;

pub const USER_HEADER: &str = "x-user";
pub const ANONYMOUS: &str = "anonymous";

/// Authenticated uploader / reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner(pub String);

impl FromRequestParts<AppState> for Owner {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        authenticate(&parts.headers, &state.config.auth).map(Owner)
    }
}

pub fn authenticate(headers: &HeaderMap, auth: &AuthConfig) -> Result<String, AppError> {
    match auth.mode {
        AuthMode::None => Ok(headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(ANONYMOUS)
            .to_string()),
        AuthMode::Basic => {
            let (user, password) = basic_credentials(headers)
                .ok_or_else(|| AppError::Auth("Authentication credentials were not provided".into()))?;
            match auth.users.get(&user) {
                Some(expected) if passwords_match(expected.as_bytes(), password.as_bytes()) => Ok(user),
                _ => {
                    debug!(user = %user, "Rejected credentials");
                    Err(AppError::Auth("Invalid username/password".into()))
                }
            }
        }
    }
}

/// Byte comparison whose running time depends only on the longer input,
/// not on where the first mismatch sits.
fn passwords_match(expected: &[u8], given: &[u8]) -> bool {
    let len = expected.len().max(given.len());
    let diff = (0..len).fold(expected.len() ^ given.len(), |acc, i| {
        let a = expected.get(i).copied().unwrap_or(0);
        let b = given.get(i).copied().unwrap_or(0);
        acc | usize::from(a ^ b)
    });
    diff == 0
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = String::from_utf8(BASE64.decode(encoded.trim()).ok()?).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}
