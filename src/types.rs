// src/types.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub const KEY_ALGORITHM: &str = "ed25519";
pub const DEFAULT_SCROLL_PX_PER_SECOND: f64 = 24.0;

// ---------- REGISTRATION ---------- //

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationSessionReq {
    pub registration_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationSession {
    pub registration_session_id: String,
    pub expires_at: DateTime<Utc>,
    pub challenge_nonce: String,
    #[serde(default)]
    pub constraints: RegistrationConstraints,
}

/// Optional server-side limits applied on top of the local field validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationConstraints {
    pub slug_pattern: Option<String>,
    pub min_width: Option<u32>,
    pub min_height: Option<u32>,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterReq {
    pub registration_session_id: String,
    pub display_slug: String,
    pub display_name: String,
    pub resolution_width: u32,
    pub resolution_height: u32,
    pub display_output: String,
    pub display_fingerprint: String,
    pub public_key: String,
    pub key_algorithm: String,
    pub registration_signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRes {
    pub display_id: String,
    pub display_slug: String,
    pub state: String,
    pub key_id: String,
}

/// Durable proof that one physical output finished registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayRegistrationRecord {
    pub display_id: String,
    pub display_slug: String,
    pub key_id: String,
    pub key_alias: String,
    pub display_fingerprint: String,
    pub display_output: String,
    pub registered_at: DateTime<Utc>,
}

// ---------- AUTH ---------- //

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeReq {
    pub display_slug: String,
    pub key_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthChallenge {
    pub challenge_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyChallengeReq {
    pub display_slug: String,
    pub key_id: String,
    pub signature: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatReq {
    pub sent_at: DateTime<Utc>,
    pub playlist_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamToken {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

// ---------- MANIFEST ---------- //

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub playlist_id: Option<String>,
    #[serde(deserialize_with = "string_or_number")]
    pub playlist_version: String,
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub runtime_settings: RuntimeSettings,
    #[serde(default)]
    pub items: Vec<ManifestItem>,
}

impl Manifest {
    /// Orders items by `sequence`; ties keep server order.
    pub fn normalized(mut self) -> Self {
        self.items.sort_by_key(|item| item.sequence);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSettings {
    pub scroll_px_per_second: f64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            scroll_px_per_second: DEFAULT_SCROLL_PX_PER_SECOND,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestItem {
    pub id: String,
    pub sequence: i64,
    pub duration: Option<f64>,
    pub content: ManifestContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestContent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ContentType,
    pub checksum: Option<String>,
    pub download_url: String,
    pub mime_type: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContentType {
    Image,
    Video,
    Pdf,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Version {
        Text(String),
        Number(serde_json::Number),
    }
    Ok(match Version::deserialize(deserializer)? {
        Version::Text(s) => s,
        Version::Number(n) => n.to_string(),
    })
}
