//! Webhook authentication and push-event evaluation.
//!
//! A delivery is trusted only when its `sha256=<hex>` signature header is
//! byte-for-byte the HMAC-SHA256 of the raw body under the shared secret.
//! The comparison is constant-time. With no secret configured every
//! delivery is rejected.

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use tether_core::Config;

use crate::error::SyncError;

type HmacSha256 = Hmac<Sha256>;

/// Prefix of the signature header value.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// `sha256=<lowercase hex>` for `body` under `secret`, or `None` if the key
/// is rejected.
pub fn sign(secret: &[u8], body: &[u8]) -> Option<String> {
    let mut mac = <HmacSha256 as KeyInit>::new_from_slice(secret).ok()?;
    mac.update(body);
    Some(format!(
        "{SIGNATURE_PREFIX}{}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// `true` iff `signature` equals `sign(secret, body)`. A missing signature
/// or secret (or an empty secret) is always `false`.
pub fn verify_signature(body: &[u8], signature: Option<&str>, secret: Option<&str>) -> bool {
    let (Some(signature), Some(secret)) = (signature, secret) else {
        return false;
    };
    if secret.is_empty() {
        return false;
    }
    let Some(expected) = sign(secret.as_bytes(), body) else {
        return false;
    };
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}

/// The parts of a push payload a sync cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushInfo {
    /// Branch name with `refs/heads/` stripped.
    pub branch: String,
    pub commits: u32,
    /// Head commit message, if the payload carried one.
    pub message: Option<String>,
    /// Head commit id (`after`).
    pub head: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    #[serde(default)]
    commits: Vec<serde_json::Value>,
    #[serde(default)]
    head_commit: Option<HeadCommit>,
    #[serde(default)]
    after: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HeadCommit {
    #[serde(default)]
    message: Option<String>,
}

impl PushInfo {
    /// Parse a push payload. Returns `None` for anything that is not a
    /// branch push.
    pub fn parse(body: &[u8]) -> Option<PushInfo> {
        let payload: PushPayload = serde_json::from_slice(body).ok()?;
        let branch = payload.git_ref.strip_prefix("refs/heads/")?.to_string();
        Some(PushInfo {
            branch,
            commits: u32::try_from(payload.commits.len()).unwrap_or(u32::MAX),
            message: payload
                .head_commit
                .and_then(|c| c.message)
                .map(|m| m.lines().next().unwrap_or_default().to_string()),
            head: payload.after,
        })
    }
}

/// Outcome of an authenticated delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookDecision {
    /// Run the pipeline for this push.
    Accepted(PushInfo),
    /// Authentic but not actionable; acknowledge with `reason`.
    Ignored { reason: String },
}

/// Decides what to do with one webhook delivery.
#[derive(Debug, Clone)]
pub struct WebhookVerifier {
    secret: Option<String>,
    event: String,
    branch: String,
}

impl WebhookVerifier {
    pub fn new(secret: Option<String>, event: impl Into<String>, branch: impl Into<String>) -> Self {
        WebhookVerifier {
            secret,
            event: event.into(),
            branch: branch.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.webhook.secret.clone(),
            config.webhook.event.clone(),
            config.repository.branch.clone(),
        )
    }

    /// Authenticate, then filter by event kind and branch.
    ///
    /// Returns [`SyncError::Signature`] when the signature does not verify;
    /// nothing about the payload is inspected before that.
    pub fn evaluate(
        &self,
        event_kind: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<WebhookDecision, SyncError> {
        if !verify_signature(body, signature, self.secret.as_deref()) {
            tracing::warn!("rejected webhook delivery with invalid signature");
            return Err(SyncError::Signature);
        }

        let event = event_kind.unwrap_or_default();
        if event == "ping" {
            return Ok(ignored("ping event"));
        }
        if event != self.event {
            return Ok(ignored(format!("event {event:?} is not {:?}", self.event)));
        }

        let Some(push) = PushInfo::parse(body) else {
            return Ok(ignored("payload is not a branch push"));
        };
        if push.branch != self.branch {
            return Ok(ignored(format!(
                "push to {} does not match branch {}",
                push.branch, self.branch
            )));
        }
        tracing::info!(
            "accepted push to {} ({} commit(s))",
            push.branch,
            push.commits
        );
        Ok(WebhookDecision::Accepted(push))
    }
}

fn ignored(reason: impl Into<String>) -> WebhookDecision {
    let reason = reason.into();
    tracing::info!("ignoring webhook delivery: {reason}");
    WebhookDecision::Ignored { reason }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
