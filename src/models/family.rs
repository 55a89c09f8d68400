use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

const INVITE_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const GENERATED_CODE_LEN: usize = 6;

static INVITE_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9]{4,16}$").expect("invite code pattern"));

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FamilyId(String);

impl FamilyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FamilyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Human-enterable code used to join a family. Always uppercase alphanumerics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InviteCode(String);

impl InviteCode {
    /// Normalizes user input (trim, uppercase) and validates the shape.
    /// A malformed code can never match a family, so it is reported as invalid.
    pub fn parse(raw: &str) -> AppResult<Self> {
        let normalized = raw.trim().to_ascii_uppercase();
        if normalized.is_empty() {
            return Err(AppError::InvalidInput("invite code is required".to_string()));
        }
        if !INVITE_CODE_RE.is_match(&normalized) {
            return Err(AppError::InvalidInviteCode(normalized));
        }
        Ok(Self(normalized))
    }

    pub fn generate() -> Self {
        let seed = uuid::Uuid::new_v4();
        let code = seed
            .as_bytes()
            .iter()
            .take(GENERATED_CODE_LEN)
            .map(|b| INVITE_CODE_ALPHABET[*b as usize % INVITE_CODE_ALPHABET.len()] as char)
            .collect();
        Self(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InviteCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyGroup {
    pub id: FamilyId,
    pub name: String,
    pub invite_code: InviteCode,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewFamily {
    pub name: String,
    pub invite_code: InviteCode,
}
