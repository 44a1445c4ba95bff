//! The HTTP side of the server.
//!
//! The browser talks WebSocket for the queue, but a few things need plain
//! HTTP: the reverse proxy asks whether a request carries a live session
//! cookie before it forwards to the terminal, and the landing page checks
//! an invite link before opening a socket.
//!
//! | Route | Purpose |
//! |---|---|
//! | `GET /api/session/validate` | 200 if the session cookie belongs to the active session, else 401 |
//! | `POST /api/session/cookie` | exchange a `session_token` for an HTTP-only cookie |
//! | `POST /api/session/logout` | clear the cookie |
//! | `GET /api/invite/validate` | check an invite (header `X-Invite-Token` or `?token=`) |

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slotkeeper_orchestrator::{InviteCheck, Orchestrator, SessionBackend};
use slotkeeper_protocol::{ClientId, ErrorCode, InviteReason, SessionId};
use slotkeeper_transport::{ForwardedHeaders, PeerInfo};

/// Header carrying an invite token on `GET /api/invite/validate`.
pub const INVITE_HEADER: &str = "x-invite-token";

/// How the session cookie is named and flagged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieSettings {
    pub name: String,
    pub secure: bool,
}

impl CookieSettings {
    /// A `Set-Cookie` value carrying `value` for `max_age_secs`.
    pub fn set(&self, value: &str, max_age_secs: u64) -> String {
        let secure = if self.secure { "; Secure" } else { "" };
        format!(
            "{}={value}; Path=/; HttpOnly; SameSite=Strict; Max-Age={max_age_secs}{secure}",
            self.name
        )
    }

    /// A `Set-Cookie` value that deletes the cookie.
    pub fn clear(&self) -> String {
        self.set("", 0)
    }

    /// The cookie's value from the request's `Cookie` headers.
    pub fn read(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, value)| *name == self.name && !value.is_empty())
            .map(|(_, value)| value.to_string())
    }
}

/// Per-router settings taken from the server config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSettings {
    pub cookie: CookieSettings,
    /// Whether invite checks key their rate limit on proxy headers.
    pub forwarded: ForwardedHeaders,
}

struct HttpState<B: SessionBackend> {
    orchestrator: Orchestrator<B>,
    cookie: CookieSettings,
    forwarded: ForwardedHeaders,
}

impl<B: SessionBackend> Clone for HttpState<B> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: self.orchestrator.clone(),
            cookie: self.cookie.clone(),
            forwarded: self.forwarded,
        }
    }
}

/// Builds the HTTP router.
///
/// `GET /api/invite/validate` reads the peer address from
/// [`ConnectInfo`], so serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn router<B: SessionBackend>(orchestrator: Orchestrator<B>, settings: HttpSettings) -> Router {
    let state = HttpState {
        orchestrator,
        cookie: settings.cookie,
        forwarded: settings.forwarded,
    };
    Router::new()
        .route("/api/session/validate", get(validate_session::<B>))
        .route("/api/session/cookie", post(issue_cookie::<B>))
        .route("/api/session/logout", post(logout::<B>))
        .route("/api/invite/validate", get(validate_invite::<B>))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionBody {
    valid: bool,
    session_id: SessionId,
    client_id: ClientId,
    expires_at: DateTime<Utc>,
    platforms: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CookieRequest {
    session_token: String,
}

#[derive(Debug, Serialize)]
struct OkBody {
    ok: bool,
}

#[derive(Debug, Serialize)]
struct InviteValidBody {
    valid: bool,
    rejoin: bool,
}

#[derive(Debug, Serialize)]
struct InviteInvalidBody {
    valid: bool,
    reason: InviteReason,
    message: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    code: ErrorCode,
    message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

fn error(code: ErrorCode, message: &'static str) -> Response {
    let status = StatusCode::from_u16(code.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = ErrorBody {
        code,
        message,
        retry_after: None,
    };
    (status, Json(body)).into_response()
}

fn with_cookie(mut response: Response, cookie: String) -> Response {
    match HeaderValue::from_str(&cookie) {
        Ok(value) => {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
        Err(e) => tracing::warn!(error = %e, "session cookie is not a valid header value"),
    }
    response
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn validate_session<B: SessionBackend>(
    State(state): State<HttpState<B>>,
    headers: HeaderMap,
) -> Response {
    let Some(token) = state.cookie.read(&headers) else {
        return error(ErrorCode::Unauthorized, "No session cookie.");
    };
    match state.orchestrator.session_for_credential(&token).await {
        Some(view) => Json(SessionBody {
            valid: true,
            session_id: view.session_id,
            client_id: view.client_id,
            expires_at: view.expires_at,
            platforms: view.platforms,
        })
        .into_response(),
        None => error(ErrorCode::SessionExpired, "No active session for this cookie."),
    }
}

async fn issue_cookie<B: SessionBackend>(
    State(state): State<HttpState<B>>,
    Json(body): Json<CookieRequest>,
) -> Response {
    let orch = &state.orchestrator;
    let max_age = match orch.session_for_credential(&body.session_token).await {
        Some(view) => (view.expires_at - Utc::now()).num_seconds().max(0) as u64,
        None if orch.credential_known(&body.session_token).await => {
            orch.config().session_duration.as_secs()
        }
        None => return error(ErrorCode::Unauthorized, "Unknown session token."),
    };

    let response = Json(OkBody { ok: true }).into_response();
    with_cookie(response, state.cookie.set(&body.session_token, max_age))
}

async fn logout<B: SessionBackend>(State(state): State<HttpState<B>>) -> Response {
    let response = Json(OkBody { ok: true }).into_response();
    with_cookie(response, state.cookie.clear())
}

#[derive(Debug, Deserialize)]
struct InviteQuery {
    token: Option<String>,
}

async fn validate_invite<B: SessionBackend>(
    State(state): State<HttpState<B>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<InviteQuery>,
    headers: HeaderMap,
) -> Response {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let peer = PeerInfo::from_headers(addr, state.forwarded, &header_value);
    let ip = peer.client_ip().to_string();

    let token = header_value(INVITE_HEADER)
        .or(query.token)
        .filter(|t| !t.trim().is_empty());
    let Some(token) = token else {
        return invite_invalid(InviteReason::Missing);
    };

    match state.orchestrator.check_invite(&token, &ip).await {
        InviteCheck::Valid { rejoin } => Json(InviteValidBody {
            valid: true,
            rejoin,
        })
        .into_response(),
        InviteCheck::Invalid(InviteReason::Unavailable) => {
            let body = InviteInvalidBody {
                valid: false,
                reason: InviteReason::Unavailable,
                message: InviteReason::Unavailable.message(),
            };
            (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
        }
        InviteCheck::Invalid(reason) => invite_invalid(reason),
        InviteCheck::RateLimited { retry_after_secs } => {
            tracing::info!(%ip, retry_after_secs, "invite check rate limited");
            let body = ErrorBody {
                code: ErrorCode::RateLimited,
                message: InviteReason::RateLimited.message(),
                retry_after: Some(retry_after_secs),
            };
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, retry_after_secs.to_string())],
                Json(body),
            )
                .into_response()
        }
    }
}

fn invite_invalid(reason: InviteReason) -> Response {
    let body = InviteInvalidBody {
        valid: false,
        reason,
        message: reason.message(),
    };
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(secure: bool) -> CookieSettings {
        CookieSettings {
            name: "slotkeeper_session".into(),
            secure,
        }
    }

    #[test]
    fn test_set_secure_cookie_has_all_flags() {
        let cookie = settings(true).set("abc123", 600);
        assert_eq!(
            cookie,
            "slotkeeper_session=abc123; Path=/; HttpOnly; SameSite=Strict; Max-Age=600; Secure"
        );
    }

    #[test]
    fn test_set_insecure_cookie_omits_secure() {
        let cookie = settings(false).set("abc123", 600);
        assert!(!cookie.contains("Secure"));
        assert!(cookie.contains("HttpOnly"));
    }

    #[test]
    fn test_clear_sets_zero_max_age() {
        let cookie = settings(true).clear();
        assert!(cookie.starts_with("slotkeeper_session=;"));
        assert!(cookie.contains("Max-Age=0"));
    }

    #[test]
    fn test_read_finds_named_cookie_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; slotkeeper_session=tok-1; lang=en"),
        );
        assert_eq!(settings(true).read(&headers).as_deref(), Some("tok-1"));
    }

    #[test]
    fn test_read_across_multiple_cookie_headers() {
        let mut headers = HeaderMap::new();
        headers.append(header::COOKIE, HeaderValue::from_static("theme=dark"));
        headers.append(header::COOKIE, HeaderValue::from_static("slotkeeper_session=tok-2"));
        assert_eq!(settings(true).read(&headers).as_deref(), Some("tok-2"));
    }

    #[test]
    fn test_read_ignores_prefix_match_and_empty_value() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("slotkeeper_session_old=x; slotkeeper_session="),
        );
        assert!(settings(true).read(&headers).is_none());
    }
}
