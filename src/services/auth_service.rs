use std::sync::Arc;
use std::time::Duration;

use crate::backend::{Backend, Credentials, SignUpRequest, SignUpResult};
use crate::error::{AppError, AppResult};
use crate::messages::{default_family_name, Locale};
use crate::models::{
    placeholder_avatar, InviteCode, Session, SessionIdentity, SignupIntent, UserMetadata,
};
use crate::session::SessionStore;
use crate::timeout::with_timeout;

const MIN_PASSWORD_LEN: usize = 6;

/// Whether a new account starts its own family or joins one by code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FamilyChoice {
    Create { family_name: Option<String> },
    Join { code: String },
}

#[derive(Debug, Clone)]
pub struct SignupForm {
    pub name: String,
    pub email: String,
    pub password: String,
    pub family: FamilyChoice,
}

#[derive(Debug, Clone)]
pub enum SignupOutcome {
    SignedIn(Session),
    ConfirmationRequired(SessionIdentity),
}

/// Login, signup and logout. The auth listener turns the resulting events
/// into view updates; only logout touches the store directly.
pub struct AuthService {
    backend: Arc<dyn Backend>,
    store: SessionStore,
    request_timeout: Duration,
    avatar_base_url: String,
    locale: Locale,
}

impl AuthService {
    pub fn new(
        backend: Arc<dyn Backend>,
        store: SessionStore,
        request_timeout: Duration,
        avatar_base_url: String,
        locale: Locale,
    ) -> Self {
        Self {
            backend,
            store,
            request_timeout,
            avatar_base_url,
            locale,
        }
    }

    pub async fn login(&self, email: &str, password: &str) -> AppResult<Session> {
        let email = email.trim();
        if email.is_empty() || password.is_empty() {
            return Err(AppError::InvalidInput(
                "email and password are required".to_string(),
            ));
        }

        let credentials = Credentials {
            email: email.to_string(),
            password: password.to_string(),
        };
        let session = with_timeout(
            self.backend.sign_in(&credentials),
            "login",
            self.request_timeout,
        )
        .await?;

        tracing::info!("User {} logged in", session.user.id);
        Ok(session)
    }

    pub async fn signup(&self, form: &SignupForm) -> AppResult<SignupOutcome> {
        let name = form.name.trim();
        let email = form.email.trim();
        if name.is_empty() {
            return Err(AppError::InvalidInput("name is required".to_string()));
        }
        if email.is_empty() || !email.contains('@') {
            return Err(AppError::InvalidInput("a valid email is required".to_string()));
        }
        if form.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AppError::InvalidInput(format!(
                "password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }

        let mut metadata = UserMetadata {
            full_name: Some(name.to_string()),
            avatar_url: Some(placeholder_avatar(&self.avatar_base_url, email)),
            ..UserMetadata::default()
        };

        match &form.family {
            FamilyChoice::Create { family_name } => {
                let family_name = family_name
                    .as_deref()
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| default_family_name(self.locale, name));
                metadata.set_intent(SignupIntent::Create);
                metadata.family_name = Some(family_name);
            }
            FamilyChoice::Join { code } => {
                // Check the code before the account exists so a typo creates nothing
                let code = InviteCode::parse(code)?;
                let family = with_timeout(
                    self.backend.find_family_by_code(&code),
                    "invite code lookup",
                    self.request_timeout,
                )
                .await?;
                if family.is_none() {
                    tracing::info!("Signup rejected: unknown invite code {}", code);
                    return Err(AppError::InvalidInviteCode(code.to_string()));
                }
                metadata.set_intent(SignupIntent::Join);
                metadata.invite_code = Some(code.to_string());
            }
        }

        let request = SignUpRequest {
            email: email.to_string(),
            password: form.password.clone(),
            metadata,
        };
        let result = with_timeout(
            self.backend.sign_up(&request),
            "signup",
            self.request_timeout,
        )
        .await?;

        Ok(match result {
            SignUpResult::Session(session) => {
                tracing::info!("Signed up user {}", session.user.id);
                SignupOutcome::SignedIn(session)
            }
            SignUpResult::ConfirmationRequired(identity) => {
                tracing::info!("Signed up user {}, awaiting email confirmation", identity.id);
                SignupOutcome::ConfirmationRequired(identity)
            }
        })
    }

    /// The local view is cleared even when the remote sign-out fails.
    pub async fn logout(&self) -> AppResult<()> {
        if let Err(e) = with_timeout(self.backend.sign_out(), "logout", self.request_timeout).await
        {
            tracing::warn!("Remote sign-out failed: {}", e);
        }
        self.store.sign_out();
        tracing::info!("Logged out");
        Ok(())
    }
}
