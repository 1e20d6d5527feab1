// src/api.rs
use crate::error::{RuntimeError, RuntimeResult};
use crate::signer::DisplayCredentials;
use crate::types::*;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Method, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

pub const HEADER_API_KEY: &str = "x-api-key";

/// How a display proves who it is on runtime calls.
#[derive(Clone, Debug)]
pub enum AuthMode {
    /// Per-request ed25519 signatures, preceded by one challenge round.
    Signed(DisplayCredentials),
    /// Legacy static key in `x-api-key`.
    ApiKey { device_id: String, api_key: String },
}

impl AuthMode {
    pub fn is_signed(&self) -> bool {
        matches!(self, AuthMode::Signed(_))
    }

    pub fn label(&self) -> &str {
        match self {
            AuthMode::Signed(creds) => &creds.display_slug,
            AuthMode::ApiKey { device_id, .. } => device_id,
        }
    }
}

#[derive(Clone)]
pub struct DisplayApi {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl DisplayApi {
    /// `timeout` bounds plain request/response calls; event streams are unbounded.
    pub fn new(base_url: &str, timeout: Duration) -> RuntimeResult<Self> {
        let http = reqwest::Client::builder().connect_timeout(timeout).build()?;
        Ok(Self::with_client(http, base_url, timeout))
    }

    pub fn with_client(http: reqwest::Client, base_url: &str, timeout: Duration) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // ---------- REGISTRATION ---------- //

    pub async fn create_registration_session(&self, code: &str) -> RuntimeResult<RegistrationSession> {
        let body = RegistrationSessionReq {
            registration_code: code.to_string(),
        };
        self.post_json("/display-runtime/registration-sessions", &body, HeaderMap::new())
            .await
    }

    pub async fn submit_registration(&self, req: &RegisterReq) -> RuntimeResult<RegisterRes> {
        self.post_json("/display-runtime/registrations", req, HeaderMap::new())
            .await
    }

    // ---------- AUTH ---------- //

    pub async fn create_auth_challenge(&self, slug: &str, key_id: &str) -> RuntimeResult<AuthChallenge> {
        let body = ChallengeReq {
            display_slug: slug.to_string(),
            key_id: key_id.to_string(),
        };
        self.post_json("/display-runtime/auth/challenges", &body, HeaderMap::new())
            .await
    }

    /// Refuses locally once `expires_at` has passed; an expired token needs a
    /// fresh challenge, not a retry.
    pub async fn verify_auth_challenge(
        &self,
        challenge: &AuthChallenge,
        slug: &str,
        key_id: &str,
        signature: &str,
    ) -> RuntimeResult<()> {
        if challenge.expires_at <= Utc::now() {
            return Err(RuntimeError::ChallengeExpired);
        }
        let body = VerifyChallengeReq {
            display_slug: slug.to_string(),
            key_id: key_id.to_string(),
            signature: signature.to_string(),
        };
        let path = format!(
            "/display-runtime/auth/challenges/{}/verify",
            challenge.challenge_token
        );
        let res = self
            .http
            .post(self.url(&path))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;
        check(res).await?;
        Ok(())
    }

    // ---------- RUNTIME ---------- //

    pub async fn fetch_manifest(&self, auth: &AuthMode) -> RuntimeResult<Manifest> {
        let (url, headers) = match auth {
            AuthMode::Signed(creds) => {
                let url = self.url(&format!("/display-runtime/{}/manifest", creds.display_slug));
                let headers = creds.signed_headers("GET", &url, None)?;
                (url, headers)
            }
            AuthMode::ApiKey { device_id, api_key } => (
                self.url(&format!("/devices/{device_id}/manifest")),
                api_key_headers(api_key)?,
            ),
        };
        let res = self
            .http
            .get(&url)
            .headers(headers)
            .timeout(self.timeout)
            .send()
            .await?;
        let manifest: Manifest = check(res).await?.json().await?;
        debug!("fetched manifest version {}", manifest.playlist_version);
        Ok(manifest.normalized())
    }

    pub async fn send_heartbeat(&self, creds: &DisplayCredentials, body: &HeartbeatReq) -> RuntimeResult<()> {
        let url = self.url(&format!("/display-runtime/{}/heartbeat", creds.display_slug));
        let value = serde_json::to_value(body)?;
        let headers = creds.signed_headers("POST", &url, Some(&value))?;
        let res = self
            .http
            .post(&url)
            .headers(headers)
            .timeout(self.timeout)
            .json(&value)
            .send()
            .await?;
        check(res).await?;
        Ok(())
    }

    pub async fn stream_token(&self, device_id: &str, api_key: &str) -> RuntimeResult<StreamToken> {
        let res = self
            .http
            .get(self.url(&format!("/devices/{device_id}/stream-token")))
            .headers(api_key_headers(api_key)?)
            .timeout(self.timeout)
            .send()
            .await?;
        Ok(check(res).await?.json().await?)
    }

    /// Opens the change-notification stream with fresh credentials for this attempt.
    pub async fn open_stream(&self, auth: &AuthMode) -> RuntimeResult<Response> {
        let request = match auth {
            AuthMode::Signed(creds) => {
                let url = self.url(&format!("/display-runtime/{}/stream", creds.display_slug));
                let headers = creds.signed_headers("GET", &url, None)?;
                self.http.get(url).headers(headers)
            }
            AuthMode::ApiKey { device_id, api_key } => {
                let token = self.stream_token(device_id, api_key).await?;
                self.http
                    .get(self.url(&format!("/devices/{device_id}/stream")))
                    .query(&[("token", token.token.as_str())])
            }
        };
        let res = request
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
            .send()
            .await?;
        check(res).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        headers: HeaderMap,
    ) -> RuntimeResult<T> {
        let res = self
            .http
            .request(Method::POST, self.url(path))
            .headers(headers)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await?;
        Ok(check(res).await?.json().await?)
    }
}

fn api_key_headers(api_key: &str) -> RuntimeResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    let value = HeaderValue::from_str(api_key)
        .map_err(|_| RuntimeError::Config("api key is not a valid header value".into()))?;
    headers.insert(HEADER_API_KEY, value);
    Ok(headers)
}

/// Turns any non-2xx response into `RuntimeError::Api`, using the server's
/// `{error:{code,message}}` body when it has one.
pub async fn check(res: Response) -> RuntimeResult<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let text = res.text().await.unwrap_or_default();
    Err(api_error(status.as_u16(), &text))
}

pub fn api_error(status: u16, body: &str) -> RuntimeError {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => RuntimeError::Api {
            status,
            code: parsed.error.code,
            message: parsed.error.message,
        },
        Err(_) => {
            let reason = reqwest::StatusCode::from_u16(status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or("request failed");
            let trimmed = body.trim();
            RuntimeError::Api {
                status,
                code: format!("HTTP_{status}"),
                message: if trimmed.is_empty() {
                    reason.to_string()
                } else {
                    trimmed.to_string()
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn structured_error_body_is_preserved() {
        let err = api_error(
            404,
            r#"{"error":{"code":"REGISTRATION_CODE_INVALID","message":"Pairing code not found"}}"#,
        );
        match err {
            RuntimeError::Api { status, code, message } => {
                assert_eq!(status, 404);
                assert_eq!(code, "REGISTRATION_CODE_INVALID");
                assert_eq!(message, "Pairing code not found");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unstructured_error_falls_back_to_status_text() {
        match api_error(503, "") {
            RuntimeError::Api { code, message, .. } => {
                assert_eq!(code, "HTTP_503");
                assert_eq!(message, "Service Unavailable");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_challenge_is_refused_without_network() {
        // Port 9 is discard; nothing is listening, so any request would error differently.
        let api = DisplayApi::new("http://127.0.0.1:9", std::time::Duration::from_millis(200))
            .expect("client");
        let challenge = AuthChallenge {
            challenge_token: "tok".into(),
            expires_at: Utc::now() - ChronoDuration::seconds(1),
        };
        let err = api
            .verify_auth_challenge(&challenge, "lobby", "k1", "sig")
            .await
            .expect_err("expired");
        assert!(matches!(err, RuntimeError::ChallengeExpired));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let api = DisplayApi::with_client(
            reqwest::Client::new(),
            "http://localhost:8080/",
            std::time::Duration::from_secs(1),
        );
        assert_eq!(api.url("/devices/1/manifest"), "http://localhost:8080/devices/1/manifest");
    }
}
