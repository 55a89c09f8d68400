use std::sync::Arc;
use std::time::Duration;

use super::store::{Generation, SessionStore};
use crate::backend::DataBackend;
use crate::config::{RetryPolicy, SessionSettings};
use crate::error::AppResult;
use crate::models::{ComposedUserView, NewProfile, ProfileRecord, SessionIdentity};
use crate::timeout::with_timeout;

/// How a reconciliation ended. `attempts` counts profile fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The profile was found and merged.
    Enriched { attempts: u32 },
    /// The profile only showed up after the recovery insert.
    Recovered { attempts: u32 },
    /// No profile could be read; the metadata-only view stays.
    Degraded { attempts: u32 },
    /// A newer session, sign-out or edit replaced this run's generation.
    Superseded,
}

/// Merges the profile row into the published view, waiting for the
/// server-side trigger and falling back to creating the row itself.
pub struct ProfileReconciler {
    data: Arc<dyn DataBackend>,
    store: SessionStore,
    policy: RetryPolicy,
    request_timeout: Duration,
    avatar_base_url: String,
}

impl ProfileReconciler {
    pub fn new(data: Arc<dyn DataBackend>, store: SessionStore, settings: &SessionSettings) -> Self {
        Self {
            data,
            store,
            policy: settings.retry,
            request_timeout: settings.request_timeout,
            avatar_base_url: settings.avatar_base_url.clone(),
        }
    }

    pub async fn reconcile(
        &self,
        identity: &SessionIdentity,
        generation: Generation,
    ) -> ReconcileOutcome {
        let max_attempts = self.policy.attempts();

        for attempt in 0..max_attempts {
            if !self.store.is_current(generation) {
                return ReconcileOutcome::Superseded;
            }

            if let Some(profile) = self.fetch(identity, attempt + 1).await {
                return if self.publish(identity, generation, &profile) {
                    ReconcileOutcome::Enriched {
                        attempts: attempt + 1,
                    }
                } else {
                    ReconcileOutcome::Superseded
                };
            }

            if attempt == 0 {
                let fallback = ComposedUserView::from_identity(identity, &self.avatar_base_url);
                self.store.publish_fallback(generation, fallback);
            }

            if attempt + 1 < max_attempts {
                let delay = self.policy.delay_for(attempt);
                tracing::debug!(
                    "Profile for {} not found, retrying in {}ms",
                    identity.id,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
        }

        if !self.store.is_current(generation) {
            return ReconcileOutcome::Superseded;
        }

        tracing::warn!(
            "Profile for {} still missing after {} attempts, creating it",
            identity.id,
            max_attempts
        );
        if let Err(e) = self.recover(identity).await {
            tracing::warn!("Profile recovery insert for {} failed: {}", identity.id, e);
        }

        if !self.store.is_current(generation) {
            return ReconcileOutcome::Superseded;
        }

        let attempts = max_attempts + 1;
        match self.fetch(identity, attempts).await {
            Some(profile) if self.publish(identity, generation, &profile) => {
                ReconcileOutcome::Recovered { attempts }
            }
            Some(_) => ReconcileOutcome::Superseded,
            None => {
                tracing::warn!("Using metadata-only view for {}", identity.id);
                ReconcileOutcome::Degraded { attempts }
            }
        }
    }

    async fn fetch(&self, identity: &SessionIdentity, attempt: u32) -> Option<ProfileRecord> {
        let fetched = with_timeout(
            self.data.fetch_profile(&identity.id),
            "profile fetch",
            self.request_timeout,
        )
        .await;
        match fetched {
            Ok(profile) => profile,
            Err(e) => {
                tracing::warn!(
                    "Profile fetch for {} failed (attempt {}): {}",
                    identity.id,
                    attempt,
                    e
                );
                None
            }
        }
    }

    async fn recover(&self, identity: &SessionIdentity) -> AppResult<()> {
        let profile = NewProfile::from_identity(identity, &self.avatar_base_url);
        with_timeout(
            self.data.ensure_profile(&profile),
            "profile insert",
            self.request_timeout,
        )
        .await
    }

    fn publish(
        &self,
        identity: &SessionIdentity,
        generation: Generation,
        profile: &ProfileRecord,
    ) -> bool {
        let view = ComposedUserView::compose(identity, profile, &self.avatar_base_url);
        let published = self.store.publish_enriched(generation, view);
        if published {
            tracing::info!("Profile linked for {}", identity.id);
        } else {
            tracing::debug!("Discarding stale profile result for {}", identity.id);
        }
        published
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AuthBackend, MemoryBackend, Provisioning, SignUpRequest, SignUpResult};
    use crate::models::{FamilyId, UserId, UserMetadata};
    use crate::session::AuthPhase;

    const BASE: &str = "https://avatars.test/svg";

    fn settings() -> SessionSettings {
        SessionSettings {
            avatar_base_url: BASE.to_string(),
            ..SessionSettings::default()
        }
    }

    fn identity() -> SessionIdentity {
        SessionIdentity {
            id: UserId::new("u1"),
            email: "a@x.com".to_string(),
            metadata: UserMetadata::default(),
        }
    }

    fn setup(backend: &Arc<MemoryBackend>) -> (SessionStore, ProfileReconciler) {
        let store = SessionStore::new();
        let reconciler = ProfileReconciler::new(backend.clone(), store.clone(), &settings());
        (store, reconciler)
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_profile_is_merged_on_first_attempt() {
        let backend = Arc::new(MemoryBackend::default());
        backend.put_profile(ProfileRecord {
            id: UserId::new("u1"),
            full_name: Some("Kim Minsu".to_string()),
            avatar_url: None,
            status_message: Some("hi".to_string()),
            family_id: Some(FamilyId::new("f1")),
            updated_at: None,
        });
        let (store, reconciler) = setup(&backend);
        let generation = store.adopt(ComposedUserView::from_identity(&identity(), BASE));

        let outcome = reconciler.reconcile(&identity(), generation).await;
        assert_eq!(outcome, ReconcileOutcome::Enriched { attempts: 1 });

        let state = store.snapshot();
        assert_eq!(state.phase, AuthPhase::AuthenticatedEnriched);
        let user = state.user.unwrap();
        assert_eq!(user.name, "Kim Minsu");
        assert_eq!(user.family_id, Some(FamilyId::new("f1")));
        assert_eq!(user.avatar, "https://avatars.test/svg?seed=a%40x.com");
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_trigger_is_picked_up_within_three_attempts() {
        let backend = Arc::new(MemoryBackend::new(Provisioning::Delayed(Duration::from_secs(3))));
        let signed_up = backend
            .sign_up(&SignUpRequest {
                email: "late@x.com".to_string(),
                password: "secret123".to_string(),
                metadata: UserMetadata {
                    full_name: Some("Late".to_string()),
                    signup_intent: Some("create".to_string()),
                    ..UserMetadata::default()
                },
            })
            .await
            .unwrap();
        let SignUpResult::Session(session) = signed_up else {
            panic!("expected a session");
        };
        let identity = session.user;

        let (store, reconciler) = setup(&backend);
        let generation = store.adopt(ComposedUserView::from_identity(&identity, BASE));
        let started = tokio::time::Instant::now();

        let outcome = reconciler.reconcile(&identity, generation).await;
        assert_eq!(outcome, ReconcileOutcome::Enriched { attempts: 3 });
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(store.current_user().unwrap().has_family());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_profile_is_recovered_after_retries() {
        let backend = Arc::new(MemoryBackend::new(Provisioning::Disabled));
        let (store, reconciler) = setup(&backend);
        let generation = store.adopt(ComposedUserView::from_identity(&identity(), BASE));
        let started = tokio::time::Instant::now();

        let outcome = reconciler.reconcile(&identity(), generation).await;
        assert_eq!(outcome, ReconcileOutcome::Recovered { attempts: 4 });
        assert!(started.elapsed() >= Duration::from_secs(4));
        assert_eq!(backend.profile_fetches(), 4);

        let row = backend.profile(&UserId::new("u1")).unwrap();
        assert_eq!(row.full_name.as_deref(), Some("a"));
        assert_eq!(
            row.avatar_url.as_deref(),
            Some("https://avatars.test/svg?seed=a%40x.com")
        );

        let user = store.current_user().unwrap();
        assert!(user.profile_linked);
        assert_eq!(user.name, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_insert_degrades_to_fallback() {
        let backend = Arc::new(MemoryBackend::new(Provisioning::Disabled));
        backend.fail_profile_inserts(true);
        let (store, reconciler) = setup(&backend);
        let generation = store.adopt(ComposedUserView::from_identity(&identity(), BASE));

        let outcome = reconciler.reconcile(&identity(), generation).await;
        assert_eq!(outcome, ReconcileOutcome::Degraded { attempts: 4 });

        let state = store.snapshot();
        assert_eq!(state.phase, AuthPhase::AuthenticatedBasic);
        let user = state.user.unwrap();
        assert!(!user.profile_linked);
        assert!(!user.name.is_empty());
        assert!(!user.avatar.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_out_mid_retry_wins() {
        let backend = Arc::new(MemoryBackend::new(Provisioning::Disabled));
        let (store, reconciler) = setup(&backend);
        let generation = store.adopt(ComposedUserView::from_identity(&identity(), BASE));

        let task = tokio::spawn(async move { reconciler.reconcile(&identity(), generation).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        store.sign_out();

        assert_eq!(task.await.unwrap(), ReconcileOutcome::Superseded);
        assert!(store.current_user().is_none());
        assert_eq!(store.phase(), AuthPhase::SignedOut);
        assert!(backend.profile(&UserId::new("u1")).is_none());
    }
}
