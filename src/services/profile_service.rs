use std::sync::Arc;
use std::time::Duration;

use super::signed_in_user;
use crate::backend::Backend;
use crate::error::{AppError, AppResult};
use crate::models::{ComposedUserView, ProfileChanges};
use crate::session::SessionStore;
use crate::timeout::with_timeout;

/// Fields the profile page lets the user edit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileEdit {
    pub full_name: Option<String>,
    pub status_message: Option<String>,
    pub avatar_url: Option<String>,
}

impl ProfileEdit {
    fn into_changes(self) -> AppResult<ProfileChanges> {
        let full_name = match self.full_name {
            Some(name) if name.trim().is_empty() => {
                return Err(AppError::InvalidInput("name cannot be blank".to_string()));
            }
            Some(name) => Some(name.trim().to_string()),
            None => None,
        };
        let changes = ProfileChanges {
            full_name,
            avatar_url: self.avatar_url.map(|a| a.trim().to_string()),
            status_message: self.status_message,
            family_id: None,
        };
        if changes.is_empty() {
            return Err(AppError::InvalidInput("nothing to update".to_string()));
        }
        Ok(changes)
    }
}

pub struct ProfileService {
    backend: Arc<dyn Backend>,
    store: SessionStore,
    request_timeout: Duration,
}

impl ProfileService {
    pub fn new(backend: Arc<dyn Backend>, store: SessionStore, request_timeout: Duration) -> Self {
        Self {
            backend,
            store,
            request_timeout,
        }
    }

    /// Saves the edit and publishes the merged view under a new generation,
    /// so a reconciliation started earlier cannot overwrite it.
    pub async fn update_profile(&self, edit: ProfileEdit) -> AppResult<ComposedUserView> {
        let user = signed_in_user(&self.store)?;
        let changes = edit.into_changes()?;

        let record = with_timeout(
            self.backend.update_profile(&user.id, &changes),
            "profile update",
            self.request_timeout,
        )
        .await?;

        let view = self.store.apply_profile(&record).ok_or_else(|| {
            tracing::warn!("User {} signed out while saving the profile", user.id);
            AppError::Unauthenticated
        })?;
        tracing::info!("Profile updated for {}", user.id);
        Ok(view)
    }
}
