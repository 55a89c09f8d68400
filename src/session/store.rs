use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{AppError, AppResult};
use crate::models::{ComposedUserView, ProfileRecord, UserId};

/// Lifecycle of the signed-in user as seen by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Uninitialized,
    Loading,
    /// Session found; the view is built from identity metadata only.
    AuthenticatedBasic,
    /// A profile record has been merged into the view.
    AuthenticatedEnriched,
    SignedOut,
}

/// Tag stamped on the view whenever its owner or freshness changes.
/// Background results carrying an older tag are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub phase: AuthPhase,
    pub user: Option<ComposedUserView>,
    pub generation: Generation,
}

impl SessionState {
    pub fn is_loading(&self) -> bool {
        matches!(self.phase, AuthPhase::Uninitialized | AuthPhase::Loading)
    }

    fn owned_by(&self, id: &UserId) -> bool {
        self.user.as_ref().map(|u| &u.id == id).unwrap_or(false)
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: AuthPhase::Uninitialized,
            user: None,
            generation: Generation(0),
        }
    }
}

/// Owner of the single composed user view.
///
/// All mutations go through the watch channel's `send_modify` /
/// `send_if_modified`, so each transition is atomic and every subscriber sees
/// the latest state.
#[derive(Clone)]
pub struct SessionStore {
    tx: Arc<watch::Sender<SessionState>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SessionState::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionState {
        self.tx.borrow().clone()
    }

    pub fn current_user(&self) -> Option<ComposedUserView> {
        self.tx.borrow().user.clone()
    }

    pub fn phase(&self) -> AuthPhase {
        self.tx.borrow().phase
    }

    pub fn is_current(&self, generation: Generation) -> bool {
        self.tx.borrow().generation == generation
    }

    /// Marks the store as loading and returns the generation a startup
    /// session fetch must still hold to publish. `None` when a user is
    /// already signed in, so the live view and its reconciliation are kept.
    pub fn begin_loading(&self) -> Option<Generation> {
        let mut started = None;
        self.tx.send_if_modified(|state| {
            if state.user.is_some() {
                return false;
            }
            state.generation = state.generation.next();
            state.phase = AuthPhase::Loading;
            started = Some(state.generation);
            true
        });
        started
    }

    /// Like [`adopt`](Self::adopt), but only while `generation` is current.
    pub fn adopt_if(&self, generation: Generation, view: ComposedUserView) -> Option<Generation> {
        let mut adopted = None;
        self.tx.send_if_modified(|state| {
            if state.generation != generation {
                return false;
            }
            state.generation = state.generation.next();
            state.phase = AuthPhase::AuthenticatedBasic;
            state.user = Some(view);
            adopted = Some(state.generation);
            true
        });
        adopted
    }

    /// Like [`sign_out`](Self::sign_out), but only while `generation` is current.
    pub fn sign_out_if(&self, generation: Generation) -> bool {
        self.tx.send_if_modified(|state| {
            if state.generation != generation {
                return false;
            }
            state.generation = state.generation.next();
            state.phase = AuthPhase::SignedOut;
            state.user = None;
            true
        })
    }

    /// Publishes the metadata-only view for a (new or refreshed) session and
    /// starts a new generation for its reconciliation.
    pub fn adopt(&self, view: ComposedUserView) -> Generation {
        self.transition(|state| {
            state.phase = AuthPhase::AuthenticatedBasic;
            state.user = Some(view);
        })
    }

    /// Clears the view. In-flight reconciliations become stale.
    pub fn sign_out(&self) -> Generation {
        self.transition(|state| {
            state.phase = AuthPhase::SignedOut;
            state.user = None;
        })
    }

    /// Starts a new generation for the current user without touching the
    /// view. `None` when `id` is not the signed-in user.
    pub fn refresh_generation(&self, id: &UserId) -> Option<Generation> {
        let mut bumped = None;
        self.tx.send_if_modified(|state| {
            if !state.owned_by(id) {
                return false;
            }
            state.generation = state.generation.next();
            bumped = Some(state.generation);
            false
        });
        bumped
    }

    /// Replaces a basic view with a fresher fallback. Ignored when stale or
    /// when a profile has already been merged for this generation.
    pub fn publish_fallback(&self, generation: Generation, view: ComposedUserView) -> bool {
        self.tx.send_if_modified(|state| {
            if state.generation != generation
                || !state.owned_by(&view.id)
                || state.phase == AuthPhase::AuthenticatedEnriched
            {
                return false;
            }
            let changed = state.user.as_ref() != Some(&view);
            state.user = Some(view);
            changed
        })
    }

    /// Applies a profile-backed view fetched under `generation`.
    pub fn publish_enriched(&self, generation: Generation, view: ComposedUserView) -> bool {
        self.tx.send_if_modified(|state| {
            if state.generation != generation || !state.owned_by(&view.id) {
                return false;
            }
            state.phase = AuthPhase::AuthenticatedEnriched;
            state.user = Some(view);
            true
        })
    }

    /// Merges a profile the user just wrote. Starts a new generation so an
    /// older background fetch cannot overwrite the edit.
    pub fn apply_profile(&self, profile: &ProfileRecord) -> Option<ComposedUserView> {
        let mut applied = None;
        self.tx.send_if_modified(|state| {
            let Some(user) = state.user.take() else {
                return false;
            };
            if user.id != profile.id {
                state.user = Some(user);
                return false;
            }
            let merged = user.merged_with(profile);
            state.generation = state.generation.next();
            state.phase = AuthPhase::AuthenticatedEnriched;
            state.user = Some(merged.clone());
            applied = Some(merged);
            true
        });
        applied
    }

    /// Waits until `predicate` holds for the published state.
    pub async fn wait_for<F>(&self, limit: Duration, mut predicate: F) -> AppResult<SessionState>
    where
        F: FnMut(&SessionState) -> bool,
    {
        let mut rx = self.subscribe();
        let waited = tokio::time::timeout(limit, rx.wait_for(|state| predicate(state))).await;
        match waited {
            Ok(Ok(state)) => Ok(state.clone()),
            Ok(Err(_)) => Err(AppError::Internal("session store closed".to_string())),
            Err(_) => Err(AppError::Timeout {
                description: "waiting for session state".to_string(),
                after_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    fn transition(&self, apply: impl FnOnce(&mut SessionState)) -> Generation {
        let mut generation = Generation(0);
        self.tx.send_modify(|state| {
            state.generation = state.generation.next();
            apply(state);
            generation = state.generation;
        });
        generation
    }
}
