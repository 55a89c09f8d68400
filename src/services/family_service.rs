use std::sync::Arc;
use std::time::Duration;

use super::signed_in_user;
use crate::backend::Backend;
use crate::error::{AppError, AppResult};
use crate::models::{ComposedUserView, FamilyGroup, InviteCode, NewFamily, ProfileChanges};
use crate::session::SessionStore;
use crate::timeout::with_timeout;

/// Generated codes are retried this many times on a collision.
const CREATE_FAMILY_ATTEMPTS: u32 = 3;

pub struct FamilyService {
    backend: Arc<dyn Backend>,
    store: SessionStore,
    request_timeout: Duration,
}

impl FamilyService {
    pub fn new(backend: Arc<dyn Backend>, store: SessionStore, request_timeout: Duration) -> Self {
        Self {
            backend,
            store,
            request_timeout,
        }
    }

    /// Links the signed-in user to the family owning `code`. An unknown code
    /// leaves the profile untouched.
    pub async fn join_family(&self, code: &str) -> AppResult<FamilyGroup> {
        let user = signed_in_user(&self.store)?;
        let code = InviteCode::parse(code)?;

        let family = with_timeout(
            self.backend.find_family_by_code(&code),
            "invite code lookup",
            self.request_timeout,
        )
        .await?
        .ok_or_else(|| AppError::InvalidInviteCode(code.to_string()))?;

        self.link(&user, &family).await?;
        tracing::info!("User {} joined family {}", user.id, family.id);
        Ok(family)
    }

    /// Creates a family with a generated invite code and links the creator.
    pub async fn create_family(&self, name: &str) -> AppResult<FamilyGroup> {
        let user = signed_in_user(&self.store)?;
        let name = family_name(name)?;

        let mut last_code = None;
        for attempt in 1..=CREATE_FAMILY_ATTEMPTS {
            let invite_code = InviteCode::generate();
            let new_family = NewFamily {
                name: name.clone(),
                invite_code,
            };
            match self.insert(&new_family).await {
                Ok(family) => {
                    self.link(&user, &family).await?;
                    tracing::info!("User {} created family {}", user.id, family.id);
                    return Ok(family);
                }
                Err(AppError::DuplicateInviteCode(code)) => {
                    tracing::debug!(
                        "Invite code {} already taken (attempt {}/{})",
                        code,
                        attempt,
                        CREATE_FAMILY_ATTEMPTS
                    );
                    last_code = Some(code);
                }
                Err(e) => return Err(e),
            }
        }

        tracing::warn!("Gave up creating family after {} code collisions", CREATE_FAMILY_ATTEMPTS);
        Err(AppError::DuplicateInviteCode(last_code.unwrap_or_default()))
    }

    /// Creates a family with a user-chosen invite code. A taken code fails
    /// with `DuplicateInviteCode`.
    pub async fn create_family_with_code(&self, name: &str, code: &str) -> AppResult<FamilyGroup> {
        let user = signed_in_user(&self.store)?;
        let new_family = NewFamily {
            name: family_name(name)?,
            invite_code: InviteCode::parse(code)?,
        };

        let family = self.insert(&new_family).await?;
        self.link(&user, &family).await?;
        tracing::info!("User {} created family {}", user.id, family.id);
        Ok(family)
    }

    /// The signed-in user's family, if linked.
    pub async fn current_family(&self) -> AppResult<Option<FamilyGroup>> {
        let user = signed_in_user(&self.store)?;
        let Some(family_id) = user.family_id else {
            return Ok(None);
        };
        with_timeout(
            self.backend.fetch_family(&family_id),
            "family fetch",
            self.request_timeout,
        )
        .await
    }

    async fn insert(&self, family: &NewFamily) -> AppResult<FamilyGroup> {
        with_timeout(
            self.backend.insert_family(family),
            "family insert",
            self.request_timeout,
        )
        .await
    }

    async fn link(&self, user: &ComposedUserView, family: &FamilyGroup) -> AppResult<()> {
        let changes = ProfileChanges::link_family(family.id.clone());
        let profile = with_timeout(
            self.backend.update_profile(&user.id, &changes),
            "profile update",
            self.request_timeout,
        )
        .await?;
        if self.store.apply_profile(&profile).is_none() {
            tracing::warn!("User changed while linking family {}", family.id);
        }
        Ok(())
    }
}

fn family_name(name: &str) -> AppResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::InvalidInput("family name is required".to_string()));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DataBackend, MemoryBackend};
    use crate::messages::{Action, Locale, UserMessage};
    use crate::models::{FamilyId, ProfileRecord, SessionIdentity, UserId, UserMetadata};

    const BASE: &str = "https://avatars.test/svg";

    /// Signed-in `u1` with a profile already in family `f1`.
    fn signed_in() -> (Arc<MemoryBackend>, SessionStore, FamilyService) {
        let backend = Arc::new(MemoryBackend::default());
        backend.put_profile(ProfileRecord {
            id: UserId::new("u1"),
            full_name: Some("Kim".to_string()),
            avatar_url: None,
            status_message: None,
            family_id: Some(FamilyId::new("f1")),
            updated_at: None,
        });
        let store = SessionStore::new();
        let identity = SessionIdentity {
            id: UserId::new("u1"),
            email: "a@x.com".to_string(),
            metadata: UserMetadata::default(),
        };
        store.adopt(ComposedUserView::from_identity(&identity, BASE));
        let service = FamilyService::new(backend.clone(), store.clone(), Duration::from_secs(10));
        (backend, store, service)
    }

    #[tokio::test]
    async fn test_unknown_code_leaves_profile_unchanged() {
        let (backend, store, service) = signed_in();

        let result = service.join_family("ABC123").await;
        let err = result.unwrap_err();
        assert!(matches!(&err, AppError::InvalidInviteCode(c) if c == "ABC123"));
        assert_eq!(
            UserMessage::for_error(Action::JoinFamily, &err).render(Locale::Korean),
            "유효하지 않은 가족 코드입니다."
        );

        let profile = backend.profile(&UserId::new("u1")).unwrap();
        assert_eq!(profile.family_id, Some(FamilyId::new("f1")));
        assert!(!store.current_user().unwrap().profile_linked);
    }

    #[tokio::test]
    async fn test_join_links_profile_and_view() {
        let (backend, store, service) = signed_in();
        let family = backend
            .insert_family(&NewFamily {
                name: "Lee family".to_string(),
                invite_code: InviteCode::parse("LEE777").unwrap(),
            })
            .await
            .unwrap();

        let joined = service.join_family(" lee777 ").await.unwrap();
        assert_eq!(joined.id, family.id);
        assert_eq!(
            backend.profile(&UserId::new("u1")).unwrap().family_id,
            Some(family.id.clone())
        );
        assert_eq!(store.current_user().unwrap().family_id, Some(family.id));
    }

    #[tokio::test]
    async fn test_duplicate_code_is_reported_distinctly() {
        let (_backend, _store, service) = signed_in();

        service
            .create_family_with_code("Kim family", "ABC123")
            .await
            .unwrap();
        let err = service
            .create_family_with_code("Park family", "abc123")
            .await
            .unwrap_err();
        assert!(matches!(&err, AppError::DuplicateInviteCode(c) if c == "ABC123"));

        let duplicate = UserMessage::for_error(Action::CreateFamily, &err);
        let invalid =
            UserMessage::for_error(Action::JoinFamily, &AppError::InvalidInviteCode("X".into()));
        assert_ne!(duplicate, invalid);
        assert_ne!(duplicate.render(Locale::English), invalid.render(Locale::English));
    }

    #[tokio::test]
    async fn test_create_family_links_creator() {
        let (_backend, store, service) = signed_in();

        let family = service.create_family("  Our home ").await.unwrap();
        assert_eq!(family.name, "Our home");
        assert_eq!(family.invite_code.as_str().len(), 6);

        let current = service.current_family().await.unwrap().unwrap();
        assert_eq!(current.id, family.id);
        assert_eq!(store.current_user().unwrap().family_id, Some(family.id));
    }

    #[tokio::test]
    async fn test_requires_signed_in_user() {
        let backend = Arc::new(MemoryBackend::default());
        let service = FamilyService::new(backend, SessionStore::new(), Duration::from_secs(10));

        assert!(matches!(
            service.join_family("ABC123").await,
            Err(AppError::Unauthenticated)
        ));
        assert!(matches!(
            service.current_family().await,
            Err(AppError::Unauthenticated)
        ));
    }
}
