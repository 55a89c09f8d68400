use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;

use super::{
    AuthBackend, AuthEvent, Credentials, DataBackend, SignUpRequest, SignUpResult,
    AUTH_EVENT_CAPACITY,
};
use crate::error::{AppError, AppResult};
use crate::messages::{default_family_name, Locale};
use crate::models::{
    FamilyGroup, FamilyId, InviteCode, NewFamily, NewProfile, ProfileChanges, ProfileRecord,
    Session, SessionIdentity, SignupIntent, UserId,
};

/// How the simulated server-side trigger provisions profiles at signup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioning {
    Immediate,
    Delayed(Duration),
    Disabled,
}

struct Account {
    password: String,
    identity: SessionIdentity,
}

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<String, Account>,
    profiles: HashMap<UserId, ProfileRecord>,
    families: HashMap<FamilyId, FamilyGroup>,
    session: Option<Session>,
    profile_fetches: usize,
    fail_profile_inserts: bool,
}

/// In-process backend that behaves like the hosted service, including the
/// trigger that links new accounts to a profile and a family.
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    events: broadcast::Sender<AuthEvent>,
    provisioning: Provisioning,
    session_latency: Mutex<Option<Duration>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(Provisioning::Immediate)
    }
}

impl MemoryBackend {
    pub fn new(provisioning: Provisioning) -> Self {
        let (events, _) = broadcast::channel(AUTH_EVENT_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            events,
            provisioning,
            session_latency: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        lock(&*self.state)
    }

    /// Makes `identity` the current session without emitting an event, as if
    /// it had been restored from storage.
    pub fn seed_session(&self, identity: SessionIdentity) -> Session {
        let session = new_session(identity);
        self.state().session = Some(session.clone());
        session
    }

    pub fn put_profile(&self, profile: ProfileRecord) {
        self.state().profiles.insert(profile.id.clone(), profile);
    }

    pub fn profile(&self, id: &UserId) -> Option<ProfileRecord> {
        self.state().profiles.get(id).cloned()
    }

    pub fn profile_fetches(&self) -> usize {
        self.state().profile_fetches
    }

    pub fn fail_profile_inserts(&self, fail: bool) {
        self.state().fail_profile_inserts = fail;
    }

    /// Delays every `current_session` call, to exercise startup timeouts.
    pub fn set_session_latency(&self, latency: Option<Duration>) {
        *lock(&self.session_latency) = latency;
    }

    /// Pushes an arbitrary event onto the auth-state stream.
    pub fn emit(&self, event: AuthEvent) {
        let _ = self.events.send(event);
    }

    fn run_trigger(&self, identity: SessionIdentity) {
        match self.provisioning {
            Provisioning::Immediate => provision(&mut self.state(), &identity),
            Provisioning::Delayed(delay) => {
                let state = Arc::clone(&self.state);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    provision(&mut lock(&*state), &identity);
                });
            }
            Provisioning::Disabled => {}
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn new_session(identity: SessionIdentity) -> Session {
    Session {
        access_token: format!("memory-access-{}", uuid::Uuid::new_v4()),
        refresh_token: format!("memory-refresh-{}", uuid::Uuid::new_v4()),
        expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
        user: identity,
    }
}

/// What the server-side trigger does for a new account: create the profile
/// and either join the family named by the invite code or start a new one.
fn provision(state: &mut MemoryState, identity: &SessionIdentity) {
    let name = identity
        .metadata
        .display_name()
        .map(str::to_string)
        .unwrap_or_else(|| identity.email_local_part().to_string());

    let family_id = match identity.metadata.intent() {
        Some(SignupIntent::Join) => identity
            .metadata
            .invite_code
            .as_deref()
            .and_then(|code| InviteCode::parse(code).ok())
            .and_then(|code| {
                state
                    .families
                    .values()
                    .find(|f| f.invite_code == code)
                    .map(|f| f.id.clone())
            }),
        _ => {
            let family_name = identity
                .metadata
                .family_name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| default_family_name(Locale::default(), &name));
            let invite_code = unused_code(state);
            let family = stored_family(family_name, invite_code);
            let id = family.id.clone();
            state.families.insert(id.clone(), family);
            Some(id)
        }
    };

    let profile = state
        .profiles
        .entry(identity.id.clone())
        .or_insert_with(|| ProfileRecord {
            id: identity.id.clone(),
            full_name: Some(name),
            avatar_url: identity.metadata.avatar_url.clone(),
            status_message: None,
            family_id: None,
            updated_at: Some(Utc::now()),
        });
    if profile.family_id.is_none() {
        profile.family_id = family_id;
    }
}

fn unused_code(state: &MemoryState) -> InviteCode {
    loop {
        let code = InviteCode::generate();
        if !state.families.values().any(|f| f.invite_code == code) {
            return code;
        }
    }
}

fn stored_family(name: String, invite_code: InviteCode) -> FamilyGroup {
    FamilyGroup {
        id: FamilyId::new(uuid::Uuid::new_v4().to_string()),
        name,
        invite_code,
        created_at: Some(Utc::now()),
    }
}

#[async_trait]
impl AuthBackend for MemoryBackend {
    async fn current_session(&self) -> AppResult<Option<Session>> {
        let latency = *lock(&self.session_latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(self.state().session.clone())
    }

    async fn sign_in(&self, credentials: &Credentials) -> AppResult<Session> {
        let session = {
            let mut state = self.state();
            let account = state
                .accounts
                .get(&credentials.email.to_ascii_lowercase())
                .filter(|a| a.password == credentials.password)
                .ok_or(AppError::InvalidCredentials)?;
            let session = new_session(account.identity.clone());
            state.session = Some(session.clone());
            session
        };
        self.emit(AuthEvent::signed_in(session.clone()));
        Ok(session)
    }

    async fn sign_up(&self, request: &SignUpRequest) -> AppResult<SignUpResult> {
        let email = request.email.to_ascii_lowercase();
        let session = {
            let mut state = self.state();
            if state.accounts.contains_key(&email) {
                return Err(AppError::Backend {
                    status: 422,
                    code: Some("user_already_exists".to_string()),
                    message: "User already registered".to_string(),
                });
            }
            let identity = SessionIdentity {
                id: UserId::new(uuid::Uuid::new_v4().to_string()),
                email: email.clone(),
                metadata: request.metadata.clone(),
            };
            state.accounts.insert(
                email,
                Account {
                    password: request.password.clone(),
                    identity: identity.clone(),
                },
            );
            let session = new_session(identity);
            state.session = Some(session.clone());
            session
        };

        self.run_trigger(session.user.clone());
        self.emit(AuthEvent::signed_in(session.clone()));
        Ok(SignUpResult::Session(session))
    }

    async fn sign_out(&self) -> AppResult<()> {
        self.state().session = None;
        self.emit(AuthEvent::signed_out());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl DataBackend for MemoryBackend {
    async fn fetch_profile(&self, id: &UserId) -> AppResult<Option<ProfileRecord>> {
        let mut state = self.state();
        state.profile_fetches += 1;
        Ok(state.profiles.get(id).cloned())
    }

    async fn ensure_profile(&self, profile: &NewProfile) -> AppResult<()> {
        let mut state = self.state();
        if state.fail_profile_inserts {
            return Err(AppError::PolicyRejected(
                "new row violates row-level security policy for table \"profiles\"".to_string(),
            ));
        }
        state
            .profiles
            .entry(profile.id.clone())
            .or_insert_with(|| ProfileRecord {
                id: profile.id.clone(),
                full_name: Some(profile.full_name.clone()),
                avatar_url: Some(profile.avatar_url.clone()),
                status_message: None,
                family_id: None,
                updated_at: Some(Utc::now()),
            });
        Ok(())
    }

    async fn update_profile(
        &self,
        id: &UserId,
        changes: &ProfileChanges,
    ) -> AppResult<ProfileRecord> {
        let mut state = self.state();
        let record = state
            .profiles
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("profile {}", id)))?;
        changes.apply_to(record);
        record.updated_at = Some(Utc::now());
        Ok(record.clone())
    }

    async fn find_family_by_code(&self, code: &InviteCode) -> AppResult<Option<FamilyGroup>> {
        Ok(self
            .state()
            .families
            .values()
            .find(|f| &f.invite_code == code)
            .cloned())
    }

    async fn fetch_family(&self, id: &FamilyId) -> AppResult<Option<FamilyGroup>> {
        Ok(self.state().families.get(id).cloned())
    }

    async fn insert_family(&self, family: &NewFamily) -> AppResult<FamilyGroup> {
        let mut state = self.state();
        if state
            .families
            .values()
            .any(|f| f.invite_code == family.invite_code)
        {
            return Err(AppError::DuplicateInviteCode(family.invite_code.to_string()));
        }
        let stored = stored_family(family.name.clone(), family.invite_code.clone());
        state.families.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }
}
