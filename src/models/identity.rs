use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable id of an authenticated principal, as issued by the auth backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the user asked for at signup; read by the server-side trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignupIntent {
    Create,
    Join,
}

impl SignupIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Join => "join",
        }
    }
}

/// Free-form metadata bag attached to the identity at signup.
///
/// Known keys are typed; anything else is kept in `extra` so it survives a
/// round trip through the session file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signup_intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invite_code: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl UserMetadata {
    pub fn intent(&self) -> Option<SignupIntent> {
        match self.signup_intent.as_deref() {
            Some("create") => Some(SignupIntent::Create),
            Some("join") => Some(SignupIntent::Join),
            _ => None,
        }
    }

    pub fn set_intent(&mut self, intent: SignupIntent) {
        self.signup_intent = Some(intent.as_str().to_string());
    }

    pub fn display_name(&self) -> Option<&str> {
        non_blank(self.full_name.as_deref())
    }

    pub fn avatar(&self) -> Option<&str> {
        non_blank(self.avatar_url.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub id: UserId,
    #[serde(default)]
    pub email: String,
    #[serde(default, rename = "user_metadata")]
    pub metadata: UserMetadata,
}

impl SessionIdentity {
    /// Part of the email before the `@`, empty when there is none.
    pub fn email_local_part(&self) -> &str {
        self.email.split('@').next().unwrap_or_default().trim()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub user: SessionIdentity,
}

impl Session {
    /// True when the access token expires within `margin` of `now`.
    /// Sessions without a known expiry are treated as valid.
    pub fn expires_within(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.expires_at
            .map(|expires_at| expires_at <= now + margin)
            .unwrap_or(false)
    }
}

pub(crate) fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
