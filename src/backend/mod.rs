//! Backend abstraction: the hosted auth service and its `profiles` /
//! `families` tables.
//!
//! [`RestBackend`] talks to the real service over HTTP; [`MemoryBackend`]
//! keeps everything in process and simulates the server-side provisioning
//! trigger, which is what the session tests run against.

pub mod memory;
pub mod persist;
pub mod rest;

pub use memory::{MemoryBackend, Provisioning};
pub use persist::SessionFile;
pub use rest::RestBackend;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::AppResult;
use crate::models::{
    FamilyGroup, FamilyId, InviteCode, NewFamily, NewProfile, ProfileChanges, ProfileRecord,
    Session, SessionIdentity, UserId, UserMetadata,
};

/// Capacity of the auth-state broadcast channel.
pub(crate) const AUTH_EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEventKind {
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

/// One entry of the auth-state change stream.
#[derive(Debug, Clone)]
pub struct AuthEvent {
    pub kind: AuthEventKind,
    pub session: Option<Session>,
}

impl AuthEvent {
    pub fn signed_in(session: Session) -> Self {
        Self {
            kind: AuthEventKind::SignedIn,
            session: Some(session),
        }
    }

    pub fn signed_out() -> Self {
        Self {
            kind: AuthEventKind::SignedOut,
            session: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    pub metadata: UserMetadata,
}

#[derive(Debug, Clone)]
pub enum SignUpResult {
    /// The account is active and signed in.
    Session(Session),
    /// The account exists but the email must be confirmed first.
    ConfirmationRequired(SessionIdentity),
}

#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Current session, refreshed if it was about to expire.
    async fn current_session(&self) -> AppResult<Option<Session>>;

    async fn sign_in(&self, credentials: &Credentials) -> AppResult<Session>;

    async fn sign_up(&self, request: &SignUpRequest) -> AppResult<SignUpResult>;

    async fn sign_out(&self) -> AppResult<()>;

    /// Subscribes to auth-state changes. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;
}

#[async_trait]
pub trait DataBackend: Send + Sync {
    async fn fetch_profile(&self, id: &UserId) -> AppResult<Option<ProfileRecord>>;

    /// Inserts the profile unless a row with the same id exists. Never
    /// overwrites a row the server-side trigger already wrote.
    async fn ensure_profile(&self, profile: &NewProfile) -> AppResult<()>;

    /// Fails with `NotFound` when no row was updated.
    async fn update_profile(&self, id: &UserId, changes: &ProfileChanges)
        -> AppResult<ProfileRecord>;

    async fn find_family_by_code(&self, code: &InviteCode) -> AppResult<Option<FamilyGroup>>;

    async fn fetch_family(&self, id: &FamilyId) -> AppResult<Option<FamilyGroup>>;

    /// Fails with `DuplicateInviteCode` when the code is taken.
    async fn insert_family(&self, family: &NewFamily) -> AppResult<FamilyGroup>;
}

pub trait Backend: AuthBackend + DataBackend {}

impl<T: AuthBackend + DataBackend> Backend for T {}
