use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;

use crate::backend::Backend;
use crate::config::SessionSettings;
use crate::error::{AppError, AppResult};
use crate::messages::Locale;
use crate::models::ComposedUserView;
use crate::services::{AuthService, FamilyService, ProfileService};
use crate::session::{
    BootstrapOutcome, ChangeListener, ProfileReconciler, ReconcileOutcome, SessionBootstrapper,
    SessionState, SessionStore,
};
use crate::timeout::with_timeout;

/// Owns the session store and everything that writes to it.
pub struct FamilySpace {
    store: SessionStore,
    reconciler: Arc<ProfileReconciler>,
    bootstrapper: SessionBootstrapper,
    listener: Mutex<Option<ChangeListener>>,
    background: Mutex<JoinSet<ReconcileOutcome>>,
    settings: SessionSettings,
    auth: AuthService,
    families: FamilyService,
    profiles: ProfileService,
    backend: Arc<dyn Backend>,
}

impl FamilySpace {
    pub fn new<B>(backend: Arc<B>, settings: SessionSettings, locale: Locale) -> Self
    where
        B: Backend + 'static,
    {
        let store = SessionStore::new();
        let reconciler = Arc::new(ProfileReconciler::new(
            backend.clone(),
            store.clone(),
            &settings,
        ));
        let bootstrapper = SessionBootstrapper::new(
            backend.clone(),
            store.clone(),
            settings.request_timeout,
            settings.avatar_base_url.clone(),
        );
        let backend: Arc<dyn Backend> = backend;

        // Services
        let auth = AuthService::new(
            backend.clone(),
            store.clone(),
            settings.request_timeout,
            settings.avatar_base_url.clone(),
            locale,
        );
        let families = FamilyService::new(backend.clone(), store.clone(), settings.request_timeout);
        let profiles = ProfileService::new(backend.clone(), store.clone(), settings.request_timeout);

        Self {
            store,
            reconciler,
            bootstrapper,
            listener: Mutex::new(None),
            background: Mutex::new(JoinSet::new()),
            settings,
            auth,
            families,
            profiles,
            backend,
        }
    }

    /// Subscribes to auth events, then resolves the stored session. The
    /// subscription comes first so a sign-in racing the bootstrap is not
    /// lost; the bootstrap then reports `Superseded` and leaves the view to
    /// the listener. Reconciliation of a restored session runs in the
    /// background.
    pub async fn start(&self) -> AppResult<BootstrapOutcome> {
        {
            let mut listener = self.listener.lock().await;
            if listener.is_none() {
                *listener = Some(ChangeListener::spawn(
                    self.backend.subscribe(),
                    self.store.clone(),
                    Arc::clone(&self.reconciler),
                    self.settings.avatar_base_url.clone(),
                ));
            }
        }

        let outcome = self.bootstrapper.bootstrap().await?;
        if let BootstrapOutcome::SignedIn {
            identity,
            generation,
        } = &outcome
        {
            let reconciler = Arc::clone(&self.reconciler);
            let identity = identity.clone();
            let generation = *generation;
            self.background
                .lock()
                .await
                .spawn(async move { reconciler.reconcile(&identity, generation).await });
        }
        Ok(outcome)
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.store.subscribe()
    }

    pub fn current_user(&self) -> Option<ComposedUserView> {
        self.store.current_user()
    }

    /// Re-runs reconciliation for the signed-in user in the foreground.
    pub async fn force_sync(&self) -> AppResult<ReconcileOutcome> {
        let user = self.store.current_user().ok_or(AppError::Unauthenticated)?;
        // Fetch first: a token refresh here republishes the view.
        let session = with_timeout(
            self.backend.current_session(),
            "session fetch",
            self.settings.request_timeout,
        )
        .await?
        .filter(|s| s.user.id == user.id)
        .ok_or(AppError::Unauthenticated)?;
        let generation = self
            .store
            .refresh_generation(&user.id)
            .ok_or(AppError::Unauthenticated)?;

        tracing::info!("Force sync for {}", user.id);
        Ok(self.reconciler.reconcile(&session.user, generation).await)
    }

    /// Waits for the startup reconciliation, if any.
    pub async fn wait_for_background(&self) {
        let mut background = self.background.lock().await;
        while let Some(joined) = background.join_next().await {
            match joined {
                Ok(outcome) => tracing::debug!("Background reconciliation: {:?}", outcome),
                Err(e) if e.is_cancelled() => {}
                Err(e) => tracing::error!("Background reconciliation failed: {}", e),
            }
        }
    }

    pub fn auth(&self) -> &AuthService {
        &self.auth
    }

    pub fn families(&self) -> &FamilyService {
        &self.families
    }

    pub fn profiles(&self) -> &ProfileService {
        &self.profiles
    }

    pub async fn shutdown(&self) {
        self.background.lock().await.shutdown().await;
        if let Some(listener) = self.listener.lock().await.take() {
            listener.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::{AuthEvent, MemoryBackend, Provisioning};
    use crate::models::{FamilyId, ProfileRecord, Session, SessionIdentity, UserId, UserMetadata};
    use crate::services::{FamilyChoice, SignupForm};
    use crate::session::AuthPhase;

    fn settings() -> SessionSettings {
        SessionSettings {
            avatar_base_url: "https://avatars.test/svg".to_string(),
            ..SessionSettings::default()
        }
    }

    fn seed_u1(backend: &MemoryBackend) {
        backend.seed_session(SessionIdentity {
            id: UserId::new("u1"),
            email: "a@x.com".to_string(),
            metadata: UserMetadata::default(),
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_restored_session_without_profile_is_recovered() {
        let backend = Arc::new(MemoryBackend::new(Provisioning::Disabled));
        seed_u1(&backend);
        let app = FamilySpace::new(backend.clone(), settings(), Locale::Korean);
        let started = tokio::time::Instant::now();

        app.start().await.unwrap();
        let user = app.current_user().unwrap();
        assert_eq!(user.name, "a");
        assert!(!user.avatar.is_empty());

        app.wait_for_background().await;
        assert!(started.elapsed() >= Duration::from_secs(4));
        let user = app.current_user().unwrap();
        assert!(user.profile_linked);
        assert!(backend.profile(&UserId::new("u1")).is_some());

        app.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_in_racing_start_is_kept() {
        let backend = Arc::new(MemoryBackend::new(Provisioning::Disabled));
        backend.set_session_latency(Some(Duration::from_secs(5)));
        backend.put_profile(ProfileRecord {
            id: UserId::new("u1"),
            full_name: Some("Kim".to_string()),
            avatar_url: None,
            status_message: None,
            family_id: Some(FamilyId::new("f1")),
            updated_at: None,
        });
        let app = FamilySpace::new(backend.clone(), settings(), Locale::Korean);

        let session = Session {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: None,
            user: SessionIdentity {
                id: UserId::new("u1"),
                email: "a@x.com".to_string(),
                metadata: UserMetadata::default(),
            },
        };
        let emitter = backend.clone();
        let (outcome, _) = tokio::join!(app.start(), async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            emitter.emit(AuthEvent::signed_in(session));
        });
        assert!(matches!(outcome.unwrap(), BootstrapOutcome::Superseded));

        let state = app
            .store()
            .wait_for(Duration::from_secs(5), |s| {
                s.phase == AuthPhase::AuthenticatedEnriched
            })
            .await
            .unwrap();
        let user = state.user.unwrap();
        assert_eq!(user.id.as_str(), "u1");
        assert_eq!(user.family_id, Some(FamilyId::new("f1")));

        app.wait_for_background().await;
        assert_eq!(app.current_user().unwrap().id.as_str(), "u1");
        app.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_times_out_and_clears_loading() {
        let backend = Arc::new(MemoryBackend::new(Provisioning::Disabled));
        backend.set_session_latency(Some(Duration::from_secs(60)));
        let app = FamilySpace::new(backend, settings(), Locale::Korean);

        let result = app.start().await;
        assert!(matches!(result, Err(AppError::Timeout { .. })));
        assert!(!app.store().snapshot().is_loading());
        assert!(app.current_user().is_none());

        app.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_signup_flows_through_listener() {
        let backend = Arc::new(MemoryBackend::new(Provisioning::Delayed(Duration::from_secs(1))));
        let app = FamilySpace::new(backend, settings(), Locale::English);
        app.start().await.unwrap();
        assert_eq!(app.store().phase(), AuthPhase::SignedOut);

        app.auth()
            .signup(&SignupForm {
                name: "Minsu".to_string(),
                email: "m@x.com".to_string(),
                password: "secret123".to_string(),
                family: FamilyChoice::Create { family_name: None },
            })
            .await
            .unwrap();

        let state = app
            .store()
            .wait_for(Duration::from_secs(10), |s| {
                s.phase == AuthPhase::AuthenticatedEnriched
            })
            .await
            .unwrap();
        assert_eq!(state.user.unwrap().name, "Minsu");

        let family = app.families().current_family().await.unwrap().unwrap();
        assert_eq!(family.name, "Minsu's family");

        app.auth().logout().await.unwrap();
        assert!(app.current_user().is_none());
        app.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_sync_picks_up_new_row() {
        let backend = Arc::new(MemoryBackend::new(Provisioning::Disabled));
        seed_u1(&backend);
        backend.put_profile(ProfileRecord {
            id: UserId::new("u1"),
            full_name: Some("Kim".to_string()),
            avatar_url: None,
            status_message: None,
            family_id: None,
            updated_at: None,
        });
        let app = FamilySpace::new(backend.clone(), settings(), Locale::Korean);
        app.start().await.unwrap();
        app.wait_for_background().await;
        assert!(!app.current_user().unwrap().has_family());

        backend.put_profile(ProfileRecord {
            id: UserId::new("u1"),
            full_name: Some("Kim".to_string()),
            avatar_url: None,
            status_message: None,
            family_id: Some(FamilyId::new("f9")),
            updated_at: None,
        });
        let outcome = app.force_sync().await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Enriched { attempts: 1 });
        assert_eq!(
            app.current_user().unwrap().family_id,
            Some(FamilyId::new("f9"))
        );

        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_force_sync_requires_user() {
        let backend = Arc::new(MemoryBackend::new(Provisioning::Disabled));
        let app = FamilySpace::new(backend, settings(), Locale::Korean);
        app.start().await.unwrap();
        assert!(matches!(
            app.force_sync().await,
            Err(AppError::Unauthenticated)
        ));
        app.shutdown().await;
    }
}
