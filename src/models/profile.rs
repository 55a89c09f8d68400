use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::family::FamilyId;
use super::identity::{SessionIdentity, UserId};
use super::user_view::placeholder_avatar;

/// Row of the `profiles` relation, keyed 1:1 by the identity id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub id: UserId,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub family_id: Option<FamilyId>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Minimal profile written by the reconciler when the trigger never ran.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewProfile {
    pub id: UserId,
    pub full_name: String,
    pub avatar_url: String,
}

impl NewProfile {
    pub fn from_identity(identity: &SessionIdentity, avatar_base_url: &str) -> Self {
        let full_name = identity
            .metadata
            .display_name()
            .map(str::to_string)
            .unwrap_or_else(|| identity.email_local_part().to_string());
        let avatar_url = identity
            .metadata
            .avatar()
            .map(str::to_string)
            .unwrap_or_else(|| placeholder_avatar(avatar_base_url, &identity.email));
        Self {
            id: identity.id.clone(),
            full_name,
            avatar_url,
        }
    }
}

/// Partial update for a profile; unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProfileChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_id: Option<FamilyId>,
}

impl ProfileChanges {
    pub fn link_family(family_id: FamilyId) -> Self {
        Self {
            family_id: Some(family_id),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.full_name.is_none()
            && self.avatar_url.is_none()
            && self.status_message.is_none()
            && self.family_id.is_none()
    }

    /// Applies the changes to a record in place.
    pub fn apply_to(&self, record: &mut ProfileRecord) {
        if let Some(name) = &self.full_name {
            record.full_name = Some(name.clone());
        }
        if let Some(avatar) = &self.avatar_url {
            record.avatar_url = Some(avatar.clone());
        }
        if let Some(status) = &self.status_message {
            record.status_message = Some(status.clone());
        }
        if let Some(family_id) = &self.family_id {
            record.family_id = Some(family_id.clone());
        }
    }
}
