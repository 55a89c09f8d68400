use std::sync::Arc;
use std::time::Duration;

use super::store::{Generation, SessionStore};
use crate::backend::AuthBackend;
use crate::error::AppResult;
use crate::models::{ComposedUserView, SessionIdentity};
use crate::timeout::with_timeout;

#[derive(Debug, Clone)]
pub enum BootstrapOutcome {
    /// A session was restored; the caller should reconcile `identity` under
    /// `generation`.
    SignedIn {
        identity: SessionIdentity,
        generation: Generation,
    },
    SignedOut,
    /// An auth event published a newer state first; nothing was applied.
    Superseded,
}

/// Resolves the session at startup and publishes the first view.
pub struct SessionBootstrapper {
    auth: Arc<dyn AuthBackend>,
    store: SessionStore,
    request_timeout: Duration,
    avatar_base_url: String,
}

impl SessionBootstrapper {
    pub fn new(
        auth: Arc<dyn AuthBackend>,
        store: SessionStore,
        request_timeout: Duration,
        avatar_base_url: String,
    ) -> Self {
        Self {
            auth,
            store,
            request_timeout,
            avatar_base_url,
        }
    }

    /// Never leaves the store loading: a failed or stalled session fetch
    /// publishes "signed out" before the error is returned. Results are only
    /// applied if no auth event changed the store during the fetch.
    pub async fn bootstrap(&self) -> AppResult<BootstrapOutcome> {
        let Some(loading) = self.store.begin_loading() else {
            tracing::debug!("User already signed in, skipping session bootstrap");
            return Ok(BootstrapOutcome::Superseded);
        };

        let fetched = with_timeout(
            self.auth.current_session(),
            "session fetch",
            self.request_timeout,
        )
        .await;

        match fetched {
            Ok(Some(session)) => {
                let identity = session.user;
                let view = ComposedUserView::from_identity(&identity, &self.avatar_base_url);
                match self.store.adopt_if(loading, view) {
                    Some(generation) => {
                        tracing::info!("Restored session for user {}", identity.id);
                        Ok(BootstrapOutcome::SignedIn {
                            identity,
                            generation,
                        })
                    }
                    None => Ok(self.superseded()),
                }
            }
            Ok(None) => {
                if !self.store.sign_out_if(loading) {
                    return Ok(self.superseded());
                }
                tracing::info!("No stored session");
                Ok(BootstrapOutcome::SignedOut)
            }
            Err(e) => {
                if e.is_timeout() {
                    tracing::warn!("Session bootstrap gave up: {}", e);
                } else {
                    tracing::error!("Session bootstrap failed: {}", e);
                }
                self.store.sign_out_if(loading);
                Err(e)
            }
        }
    }

    fn superseded(&self) -> BootstrapOutcome {
        tracing::debug!("Auth state changed during session bootstrap, discarding result");
        BootstrapOutcome::Superseded
    }
}
