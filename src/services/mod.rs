pub mod auth_service;
pub mod family_service;
pub mod profile_service;

pub use auth_service::{AuthService, FamilyChoice, SignupForm, SignupOutcome};
pub use family_service::FamilyService;
pub use profile_service::{ProfileEdit, ProfileService};

use crate::error::{AppError, AppResult};
use crate::models::ComposedUserView;
use crate::session::SessionStore;

fn signed_in_user(store: &SessionStore) -> AppResult<ComposedUserView> {
    store.current_user().ok_or(AppError::Unauthenticated)
}
