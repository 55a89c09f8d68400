use serde::Serialize;

use super::family::FamilyId;
use super::identity::{non_blank, SessionIdentity, UserId};
use super::profile::ProfileRecord;

const FALLBACK_NAME: &str = "Family Member";

/// Deterministic placeholder avatar for users who never set one.
pub fn placeholder_avatar(base_url: &str, email: &str) -> String {
    format!(
        "{}?seed={}",
        base_url.trim_end_matches('?'),
        urlencoding::encode(email)
    )
}

/// The merged, UI-facing user: session identity overlaid with the profile row.
///
/// `name` and `avatar` are never empty, whether or not the profile has been
/// confirmed to exist.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComposedUserView {
    pub id: UserId,
    pub email: String,
    pub name: String,
    pub avatar: String,
    pub status_message: Option<String>,
    pub family_id: Option<FamilyId>,
    /// Whether a profile record has been merged in.
    pub profile_linked: bool,
}

impl ComposedUserView {
    /// View built only from the identity and its metadata bag.
    pub fn from_identity(identity: &SessionIdentity, avatar_base_url: &str) -> Self {
        let name = identity
            .metadata
            .display_name()
            .or_else(|| non_blank(Some(identity.email_local_part())))
            .unwrap_or(FALLBACK_NAME)
            .to_string();
        let avatar = identity
            .metadata
            .avatar()
            .map(str::to_string)
            .unwrap_or_else(|| placeholder_avatar(avatar_base_url, &identity.email));

        Self {
            id: identity.id.clone(),
            email: identity.email.clone(),
            name,
            avatar,
            status_message: None,
            family_id: None,
            profile_linked: false,
        }
    }

    /// Full merge: identity fallbacks first, then profile fields on top.
    pub fn compose(identity: &SessionIdentity, profile: &ProfileRecord, avatar_base_url: &str) -> Self {
        Self::from_identity(identity, avatar_base_url).merged_with(profile)
    }

    /// Overlays the non-blank fields of `profile`.
    pub fn merged_with(mut self, profile: &ProfileRecord) -> Self {
        if let Some(name) = non_blank(profile.full_name.as_deref()) {
            self.name = name.to_string();
        }
        if let Some(avatar) = non_blank(profile.avatar_url.as_deref()) {
            self.avatar = avatar.to_string();
        }
        self.status_message = profile.status_message.clone();
        self.family_id = profile.family_id.clone();
        self.profile_linked = true;
        self
    }

    pub fn has_family(&self) -> bool {
        self.family_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::identity::UserMetadata;

    const BASE: &str = "https://avatars.test/svg";

    fn identity(email: &str, metadata: UserMetadata) -> SessionIdentity {
        SessionIdentity {
            id: UserId::new("u1"),
            email: email.to_string(),
            metadata,
        }
    }

    fn profile() -> ProfileRecord {
        ProfileRecord {
            id: UserId::new("u1"),
            full_name: Some("Kim Minsu".to_string()),
            avatar_url: Some("https://img/minsu.png".to_string()),
            status_message: Some("Happy to be here!".to_string()),
            family_id: Some(FamilyId::new("f1")),
            updated_at: None,
        }
    }

    #[test]
    fn test_fallback_view_is_never_empty() {
        let view = ComposedUserView::from_identity(&identity("a@x.com", UserMetadata::default()), BASE);
        assert_eq!(view.name, "a");
        assert_eq!(view.avatar, "https://avatars.test/svg?seed=a%40x.com");
        assert!(!view.profile_linked);

        let view = ComposedUserView::from_identity(&identity("", UserMetadata::default()), BASE);
        assert_eq!(view.name, FALLBACK_NAME);
        assert!(!view.avatar.is_empty());
    }

    #[test]
    fn test_metadata_beats_email() {
        let metadata = UserMetadata {
            full_name: Some("Minsu".to_string()),
            avatar_url: Some("https://img/meta.png".to_string()),
            ..UserMetadata::default()
        };
        let view = ComposedUserView::from_identity(&identity("a@x.com", metadata), BASE);
        assert_eq!(view.name, "Minsu");
        assert_eq!(view.avatar, "https://img/meta.png");
    }

    #[test]
    fn test_profile_wins_over_metadata() {
        let metadata = UserMetadata {
            full_name: Some("Minsu".to_string()),
            ..UserMetadata::default()
        };
        let view = ComposedUserView::compose(&identity("a@x.com", metadata), &profile(), BASE);
        assert_eq!(view.name, "Kim Minsu");
        assert_eq!(view.avatar, "https://img/minsu.png");
        assert_eq!(view.family_id, Some(FamilyId::new("f1")));
        assert!(view.profile_linked);
        assert!(view.has_family());
    }

    #[test]
    fn test_blank_profile_fields_keep_fallbacks() {
        let mut row = profile();
        row.full_name = Some(" ".to_string());
        row.avatar_url = None;
        let view = ComposedUserView::compose(&identity("a@x.com", UserMetadata::default()), &row, BASE);
        assert_eq!(view.name, "a");
        assert_eq!(view.avatar, "https://avatars.test/svg?seed=a%40x.com");
    }
}
