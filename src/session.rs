//! Resolves the caller of an HTTP request to a Supabase identity.
//!
//! The browser client keeps its session in `sb-<project>-auth-token` cookies;
//! API clients send `Authorization: Bearer <jwt>`. Either way we only need the
//! access token, which Supabase itself validates via `GET /auth/v1/user`.

use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{HeaderMap, header};
use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD},
};
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use serde_json::Value;

use crate::config::SupabaseConfig;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const LEGACY_ACCESS_COOKIE: &str = "sb-access-token";

/// Authenticated identity as reported by the auth provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl SessionUser {
    pub fn email_or_empty(&self) -> &str {
        self.email.as_deref().unwrap_or_default()
    }
}

/// Maps an access token to a user. `Ok(None)` means the token is not (or no
/// longer) valid; `Err` is reserved for failures reaching the provider.
pub trait SessionResolver: Send + Sync {
    fn resolve(&self, access_token: &str) -> Result<Option<SessionUser>>;
}

pub struct SupabaseSessions {
    agent: ureq::Agent,
    user_url: String,
    anon_key: String,
}

impl SupabaseSessions {
    pub fn new(config: &SupabaseConfig) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(HTTP_TIMEOUT).build(),
            user_url: format!("{}/auth/v1/user", config.url.trim_end_matches('/')),
            anon_key: config.anon_key.clone(),
        }
    }
}

impl SessionResolver for SupabaseSessions {
    fn resolve(&self, access_token: &str) -> Result<Option<SessionUser>> {
        match self
            .agent
            .get(&self.user_url)
            .set("apikey", &self.anon_key)
            .set("Authorization", &format!("Bearer {access_token}"))
            .call()
        {
            Ok(response) => response
                .into_json::<SessionUser>()
                .map(Some)
                .context("decoding Supabase user"),
            Err(ureq::Error::Status(400 | 401 | 403 | 404, _)) => Ok(None),
            Err(err) => Err(err).context("calling Supabase auth"),
        }
    }
}

/// Pulls the access token out of the request headers, preferring an explicit
/// bearer token over cookies.
pub fn access_token(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(token_from_cookies)
}

/// Reads one `Cookie:` header. Handles the whole-value cookie, the chunked
/// `.0`, `.1`, ... variant and the legacy `sb-access-token` cookie.
fn token_from_cookies(cookie_header: &str) -> Option<String> {
    let mut whole = None;
    let mut chunks: Vec<(usize, &str)> = Vec::new();
    let mut legacy = None;

    for pair in cookie_header.split(';') {
        let Some((name, value)) = pair.trim().split_once('=') else {
            continue;
        };
        if name == LEGACY_ACCESS_COOKIE {
            legacy = Some(value);
            continue;
        }
        let Some(rest) = name.strip_prefix("sb-") else {
            continue;
        };
        if rest.ends_with("-auth-token") {
            whole = Some(value);
        } else if let Some((base, index)) = rest.rsplit_once('.')
            && base.ends_with("-auth-token")
            && let Ok(index) = index.parse::<usize>()
        {
            chunks.push((index, value));
        }
    }

    let raw = match whole {
        Some(value) => Some(value.to_string()),
        None if !chunks.is_empty() => {
            chunks.sort_by_key(|(index, _)| *index);
            Some(chunks.into_iter().map(|(_, value)| value).collect::<String>())
        }
        None => None,
    };

    raw.and_then(|raw| decode_session_cookie(&raw))
        .or_else(|| legacy.map(percent_decode))
        .filter(|token| !token.is_empty())
}

/// The cookie value is either `base64-<base64url JSON>` or (URI-encoded) JSON.
/// The JSON is a session object with `access_token`, or an array whose first
/// element is the token.
fn decode_session_cookie(raw: &str) -> Option<String> {
    let json = match raw.strip_prefix("base64-") {
        Some(encoded) => {
            let encoded = encoded.trim_end_matches('=');
            let bytes = URL_SAFE_NO_PAD
                .decode(encoded)
                .or_else(|_| STANDARD_NO_PAD.decode(encoded))
                .ok()?;
            String::from_utf8(bytes).ok()?
        }
        None => percent_decode(raw),
    };

    match serde_json::from_str::<Value>(&json).ok()? {
        Value::Object(map) => map.get("access_token")?.as_str().map(str::to_string),
        Value::Array(items) => items.first()?.as_str().map(str::to_string),
        _ => None,
    }
}

fn percent_decode(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Json, Router,
        http::{HeaderValue, StatusCode},
        response::{IntoResponse, Response},
        routing::get,
    };
    use serde_json::json;
    use tokio::task;

    async fn auth_user(headers: HeaderMap) -> Response {
        if headers.get("apikey").and_then(|value| value.to_str().ok()) != Some("anon") {
            return StatusCode::BAD_REQUEST.into_response();
        }
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        match bearer {
            "Bearer good" => {
                Json(json!({ "id": "u-1", "email": "u1@example.com", "role": "authenticated" }))
                    .into_response()
            }
            "Bearer boom" => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            _ => StatusCode::UNAUTHORIZED.into_response(),
        }
    }

    async fn supabase_stub() -> SupabaseSessions {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/auth/v1/user", get(auth_user));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        SupabaseSessions::new(&SupabaseConfig {
            url: format!("http://{addr}/"),
            anon_key: "anon".into(),
        })
    }

    #[tokio::test]
    async fn supabase_resolution_splits_invalid_tokens_from_failures() {
        let sessions = supabase_stub().await;
        task::spawn_blocking(move || {
            let user = sessions.resolve("good").unwrap().unwrap();
            assert_eq!(user.id, "u-1");
            assert_eq!(user.email_or_empty(), "u1@example.com");

            assert!(sessions.resolve("expired").unwrap().is_none());
            assert!(sessions.resolve("boom").is_err());
        })
        .await
        .unwrap();
    }

    fn headers(pairs: &[(header::HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        map
    }

    fn base64_cookie(json: &str) -> String {
        format!("base64-{}", URL_SAFE_NO_PAD.encode(json))
    }

    #[test]
    fn bearer_header_wins() {
        let map = headers(&[
            (header::AUTHORIZATION, "Bearer jwt-from-header"),
            (header::COOKIE, "sb-access-token=jwt-from-cookie"),
        ]);
        assert_eq!(access_token(&map).as_deref(), Some("jwt-from-header"));
    }

    #[test]
    fn base64_session_cookie() {
        let value = base64_cookie(r#"{"access_token":"jwt-1","refresh_token":"r"}"#);
        let map = headers(&[(
            header::COOKIE,
            &format!("theme=dark; sb-abcd-auth-token={value}"),
        )]);
        assert_eq!(access_token(&map).as_deref(), Some("jwt-1"));
    }

    #[test]
    fn chunked_cookie_is_reassembled_in_order() {
        let value = base64_cookie(r#"{"access_token":"jwt-chunked"}"#);
        let (head, tail) = value.split_at(10);
        let map = headers(&[(
            header::COOKIE,
            &format!("sb-abcd-auth-token.1={tail}; sb-abcd-auth-token.0={head}"),
        )]);
        assert_eq!(access_token(&map).as_deref(), Some("jwt-chunked"));
    }

    #[test]
    fn uri_encoded_array_cookie() {
        let map = headers(&[(
            header::COOKIE,
            "sb-abcd-auth-token=%5B%22jwt-array%22%2C%22refresh%22%5D",
        )]);
        assert_eq!(access_token(&map).as_deref(), Some("jwt-array"));
    }

    #[test]
    fn legacy_cookie_and_absence() {
        let map = headers(&[(header::COOKIE, "sb-access-token=legacy")]);
        assert_eq!(access_token(&map).as_deref(), Some("legacy"));
        assert!(access_token(&headers(&[(header::COOKIE, "theme=dark")])).is_none());
        assert!(access_token(&HeaderMap::new()).is_none());
    }

    #[test]
    fn garbage_cookie_is_ignored() {
        let map = headers(&[(header::COOKIE, "sb-abcd-auth-token=base64-!!!")]);
        assert!(access_token(&map).is_none());
    }

    #[test]
    fn percent_decode_leaves_plain_text() {
        assert_eq!(percent_decode("abc%20def"), "abc def");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }
}
