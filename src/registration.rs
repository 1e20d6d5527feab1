// src/registration.rs
use crate::api::DisplayApi;
use crate::canon::{self, RegistrationMaterial};
use crate::error::{RuntimeError, RuntimeResult};
use crate::identity::{self, DisplayKeyPair};
use crate::store::LocalStore;
use crate::types::*;
use crate::verify;
use chrono::Utc;
use regex::Regex;
use std::sync::LazyLock;
use tracing::{info, warn};

static PAIRING_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9]{6}$").expect("static regex"));
static SLUG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").expect("static regex"));

/// What the operator typed in, plus where this output lives.
#[derive(Debug, Clone)]
pub struct RegistrationInput {
    pub pairing_code: String,
    pub display_slug: String,
    pub display_name: String,
    pub resolution_width: i64,
    pub resolution_height: i64,
    pub display_output: String,
    pub machine_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStage {
    PairingCodeEntered,
    SessionCreated,
    KeyReady,
    PayloadSigned,
    Submitted,
    Registered,
}

pub fn validate_pairing_code(code: &str) -> RuntimeResult<()> {
    if PAIRING_CODE.is_match(code) {
        Ok(())
    } else {
        Err(RuntimeError::validation("pairingCode", "must be exactly 6 digits"))
    }
}

pub fn validate_slug(slug: &str) -> RuntimeResult<()> {
    if SLUG.is_match(slug) {
        Ok(())
    } else {
        Err(RuntimeError::validation(
            "displaySlug",
            "lowercase letters and digits, separated by single hyphens",
        ))
    }
}

fn positive(field: &'static str, value: i64) -> RuntimeResult<u32> {
    match u32::try_from(value) {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(RuntimeError::validation(field, "must be a positive integer")),
    }
}

/// Local checks that must all pass before anything goes on the wire.
pub fn validate_input(input: &RegistrationInput) -> RuntimeResult<(u32, u32)> {
    validate_pairing_code(&input.pairing_code)?;
    validate_slug(&input.display_slug)?;
    if input.display_name.trim().is_empty() {
        return Err(RuntimeError::validation("displayName", "must not be empty"));
    }
    if input.display_output.trim().is_empty() {
        return Err(RuntimeError::validation("displayOutput", "must not be empty"));
    }
    let width = positive("resolutionWidth", input.resolution_width)?;
    let height = positive("resolutionHeight", input.resolution_height)?;
    Ok((width, height))
}

/// Extra limits the session may carry.
pub fn validate_constraints(
    input: &RegistrationInput,
    width: u32,
    height: u32,
    constraints: &RegistrationConstraints,
) -> RuntimeResult<()> {
    if let Some(pattern) = &constraints.slug_pattern {
        let re = Regex::new(pattern).map_err(|e| {
            RuntimeError::validation("displaySlug", format!("server pattern {pattern} is invalid: {e}"))
        })?;
        if !re.is_match(&input.display_slug) {
            return Err(RuntimeError::validation(
                "displaySlug",
                format!("does not match required pattern {pattern}"),
            ));
        }
    }
    let bounds = [
        ("resolutionWidth", width, constraints.min_width, constraints.max_width),
        ("resolutionHeight", height, constraints.min_height, constraints.max_height),
    ];
    for (field, value, min, max) in bounds {
        if min.is_some_and(|min| value < min) || max.is_some_and(|max| value > max) {
            return Err(RuntimeError::validation(
                field,
                format!(
                    "{value} outside allowed range {}..={}",
                    min.map(|v| v.to_string()).unwrap_or_default(),
                    max.map(|v| v.to_string()).unwrap_or_default()
                ),
            ));
        }
    }
    Ok(())
}

/// One-shot registration of this output. Steps advance `stage` strictly in
/// order; a failed step leaves the flow where it was.
pub struct RegistrationFlow<'a> {
    api: &'a DisplayApi,
    store: &'a LocalStore,
    input: RegistrationInput,
    resolution: (u32, u32),
    stage: RegistrationStage,
    session: Option<RegistrationSession>,
    fingerprint: Option<String>,
    key: Option<DisplayKeyPair>,
    request: Option<RegisterReq>,
    response: Option<RegisterRes>,
}

impl<'a> RegistrationFlow<'a> {
    pub fn new(api: &'a DisplayApi, store: &'a LocalStore, input: RegistrationInput) -> RuntimeResult<Self> {
        let resolution = validate_input(&input)?;
        Ok(Self {
            api,
            store,
            input,
            resolution,
            stage: RegistrationStage::PairingCodeEntered,
            session: None,
            fingerprint: None,
            key: None,
            request: None,
            response: None,
        })
    }

    pub fn stage(&self) -> RegistrationStage {
        self.stage
    }

    pub async fn create_session(&mut self) -> RuntimeResult<()> {
        self.ensure_stage(RegistrationStage::PairingCodeEntered)?;
        let session = self
            .api
            .create_registration_session(&self.input.pairing_code)
            .await?;
        validate_constraints(
            &self.input,
            self.resolution.0,
            self.resolution.1,
            &session.constraints,
        )?;
        info!("registration session {} opened", session.registration_session_id);
        self.session = Some(session);
        self.advance(RegistrationStage::SessionCreated);
        Ok(())
    }

    pub async fn prepare_key(&mut self) -> RuntimeResult<()> {
        self.ensure_stage(RegistrationStage::SessionCreated)?;
        let fingerprint =
            identity::derive_fingerprint(&self.input.machine_id, &self.input.display_output)?;
        let alias = identity::key_alias(&fingerprint, &self.input.display_output);
        self.key = Some(identity::get_or_create_key_pair(self.store, &alias).await?);
        self.fingerprint = Some(fingerprint);
        self.advance(RegistrationStage::KeyReady);
        Ok(())
    }

    pub fn sign_payload(&mut self) -> RuntimeResult<()> {
        self.ensure_stage(RegistrationStage::KeyReady)?;
        let (Some(session), Some(fingerprint), Some(key)) = (&self.session, &self.fingerprint, &self.key)
        else {
            return Err(RuntimeError::Identity("registration state incomplete".into()));
        };
        let payload = canon::registration_payload(&RegistrationMaterial {
            session_id: &session.registration_session_id,
            nonce: &session.challenge_nonce,
            slug: &self.input.display_slug,
            output: &self.input.display_output,
            fingerprint,
            public_key_pem: key.public_key_pem(),
        });
        let request = RegisterReq {
            registration_session_id: session.registration_session_id.clone(),
            display_slug: self.input.display_slug.clone(),
            display_name: self.input.display_name.trim().to_string(),
            resolution_width: self.resolution.0,
            resolution_height: self.resolution.1,
            display_output: self.input.display_output.clone(),
            display_fingerprint: fingerprint.clone(),
            public_key: key.public_key_pem().to_string(),
            key_algorithm: KEY_ALGORITHM.to_string(),
            registration_signature: key.sign_text(&payload),
        };
        verify::verify_registration_signature(&request, &session.challenge_nonce).map_err(|e| {
            RuntimeError::Identity(format!("local key failed its own signature check: {e}"))
        })?;
        self.request = Some(request);
        self.advance(RegistrationStage::PayloadSigned);
        Ok(())
    }

    pub async fn submit(&mut self) -> RuntimeResult<()> {
        self.ensure_stage(RegistrationStage::PayloadSigned)?;
        let (Some(session), Some(request)) = (&self.session, &self.request) else {
            return Err(RuntimeError::Identity("registration state incomplete".into()));
        };
        if session.expires_at <= Utc::now() {
            warn!("registration session {} expired before submit", session.registration_session_id);
            return Err(RuntimeError::SessionExpired);
        }
        let response = self.api.submit_registration(request).await?;
        self.response = Some(response);
        self.advance(RegistrationStage::Submitted);
        Ok(())
    }

    pub async fn persist(&mut self) -> RuntimeResult<DisplayRegistrationRecord> {
        self.ensure_stage(RegistrationStage::Submitted)?;
        let (Some(response), Some(key), Some(fingerprint)) = (&self.response, &self.key, &self.fingerprint)
        else {
            return Err(RuntimeError::Identity("registration state incomplete".into()));
        };
        let record = DisplayRegistrationRecord {
            display_id: response.display_id.clone(),
            display_slug: response.display_slug.clone(),
            key_id: response.key_id.clone(),
            key_alias: key.alias().to_string(),
            display_fingerprint: fingerprint.clone(),
            display_output: self.input.display_output.clone(),
            registered_at: Utc::now(),
        };
        self.store.save_registration(&record).await?;
        info!(
            "display {} registered as {} (key {})",
            record.display_slug, record.display_id, record.key_id
        );
        self.advance(RegistrationStage::Registered);
        Ok(record)
    }

    fn ensure_stage(&self, stage: RegistrationStage) -> RuntimeResult<()> {
        if self.stage == stage {
            Ok(())
        } else {
            Err(RuntimeError::Identity(format!(
                "registration step out of order: at {:?}, expected {:?}",
                self.stage, stage
            )))
        }
    }

    fn advance(&mut self, stage: RegistrationStage) {
        info!("registration {:?} -> {:?}", self.stage, stage);
        self.stage = stage;
    }
}

/// Runs the whole flow and returns the persisted record.
pub async fn register_display(
    api: &DisplayApi,
    store: &LocalStore,
    input: RegistrationInput,
) -> RuntimeResult<DisplayRegistrationRecord> {
    let mut flow = RegistrationFlow::new(api, store, input)?;
    flow.create_session().await?;
    flow.prepare_key().await?;
    flow.sign_payload()?;
    flow.submit().await?;
    flow.persist().await
}
