use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, DecodingKey, Validation};
use reqwest::Method;
use serde::Deserialize;
use tokio::sync::{broadcast, Mutex, RwLock};

use super::{
    AuthBackend, AuthEvent, AuthEventKind, Credentials, DataBackend, SessionFile, SignUpRequest,
    SignUpResult, AUTH_EVENT_CAPACITY,
};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::http_client::{HttpClient, PG_UNIQUE_VIOLATION};
use crate::models::{
    FamilyGroup, FamilyId, InviteCode, NewFamily, NewProfile, ProfileChanges, ProfileRecord,
    Session, SessionIdentity, UserId,
};

/// Refresh the access token when it expires within this many seconds.
const REFRESH_MARGIN_SECS: i64 = 60;

const PROFILES: &str = "rest/v1/profiles";
const FAMILIES: &str = "rest/v1/families";

/// Client for the hosted backend: GoTrue-style auth plus PostgREST tables.
pub struct RestBackend {
    http: HttpClient,
    session: RwLock<Option<Session>>,
    session_file: Option<SessionFile>,
    events: broadcast::Sender<AuthEvent>,
    /// Held across every session change (refresh, sign-in, sign-out) so a
    /// refresh can never resurrect a session that was signed out meanwhile.
    auth_lock: Mutex<()>,
}

impl RestBackend {
    pub fn new(http: HttpClient, session_file: Option<SessionFile>) -> Self {
        let (events, _) = broadcast::channel(AUTH_EVENT_CAPACITY);
        Self {
            http,
            session: RwLock::new(None),
            session_file,
            events,
            auth_lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &Config) -> AppResult<Self> {
        let http = HttpClient::new(
            &config.backend_url,
            &config.backend_anon_key,
            config.request_timeout,
        )?;
        Ok(Self::new(http, Some(SessionFile::new(&config.session_file))))
    }

    fn emit(&self, event: AuthEvent) {
        // No receivers is fine: nobody is listening yet.
        let _ = self.events.send(event);
    }

    /// Access token for data calls, refreshed first if it is about to
    /// expire. `None` (anon key) only when nobody is signed in.
    async fn bearer(&self) -> AppResult<Option<String>> {
        Ok(self.current_session().await?.map(|s| s.access_token))
    }

    async fn remember(&self, session: &Session) {
        *self.session.write().await = Some(session.clone());
        if let Some(file) = &self.session_file {
            if let Err(e) = file.save(session).await {
                tracing::warn!(
                    "Failed to persist session to {}: {}",
                    file.path().display(),
                    e
                );
            }
        }
    }

    async fn forget(&self) {
        *self.session.write().await = None;
        if let Some(file) = &self.session_file {
            if let Err(e) = file.clear().await {
                tracing::warn!(
                    "Failed to clear persisted session {}: {}",
                    file.path().display(),
                    e
                );
            }
        }
    }

    async fn load_session(&self) -> AppResult<Option<Session>> {
        if let Some(session) = self.session.read().await.clone() {
            return Ok(Some(session));
        }
        let Some(file) = &self.session_file else {
            return Ok(None);
        };
        let loaded = file.load().await?;
        if let Some(session) = &loaded {
            *self.session.write().await = Some(session.clone());
        }
        Ok(loaded)
    }

    async fn refresh(&self, refresh_token: &str) -> AppResult<Session> {
        let request = self
            .http
            .request(Method::POST, "auth/v1/token", None)
            .query(&[("grant_type", "refresh_token")])
            .json(&serde_json::json!({ "refresh_token": refresh_token }));
        let token: TokenResponse = self.http.send_json(request).await?;
        Ok(token.into_session())
    }

    /// Caller must hold `auth_lock`.
    async fn fresh_session(&self) -> AppResult<Option<Session>> {
        let Some(session) = self.load_session().await? else {
            return Ok(None);
        };
        if !session.expires_within(Utc::now(), Duration::seconds(REFRESH_MARGIN_SECS)) {
            return Ok(Some(session));
        }

        tracing::debug!("Access token for {} is expiring, refreshing", session.user.id);
        match self.refresh(&session.refresh_token).await {
            Ok(refreshed) => {
                self.remember(&refreshed).await;
                self.emit(AuthEvent {
                    kind: AuthEventKind::TokenRefreshed,
                    session: Some(refreshed.clone()),
                });
                Ok(Some(refreshed))
            }
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                tracing::warn!("Refresh token rejected, dropping session: {}", e);
                self.forget().await;
                self.emit(AuthEvent::signed_out());
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl AuthBackend for RestBackend {
    async fn current_session(&self) -> AppResult<Option<Session>> {
        let _guard = self.auth_lock.lock().await;
        self.fresh_session().await
    }

    async fn sign_in(&self, credentials: &Credentials) -> AppResult<Session> {
        let request = self
            .http
            .request(Method::POST, "auth/v1/token", None)
            .query(&[("grant_type", "password")])
            .json(&serde_json::json!({
                "email": credentials.email,
                "password": credentials.password,
            }));
        let token: TokenResponse = self
            .http
            .send_json(request)
            .await
            .map_err(credentials_error)?;

        let session = token.into_session();
        let _guard = self.auth_lock.lock().await;
        self.remember(&session).await;
        tracing::info!("Signed in as {}", session.user.id);
        self.emit(AuthEvent::signed_in(session.clone()));
        Ok(session)
    }

    async fn sign_up(&self, request: &SignUpRequest) -> AppResult<SignUpResult> {
        let body = serde_json::json!({
            "email": request.email,
            "password": request.password,
            "data": request.metadata,
        });
        let http_request = self
            .http
            .request(Method::POST, "auth/v1/signup", None)
            .json(&body);
        let response: SignUpResponse = self.http.send_json(http_request).await?;

        match response {
            SignUpResponse::Session(token) => {
                let session = token.into_session();
                let _guard = self.auth_lock.lock().await;
                self.remember(&session).await;
                tracing::info!("Signed up and signed in as {}", session.user.id);
                self.emit(AuthEvent::signed_in(session.clone()));
                Ok(SignUpResult::Session(session))
            }
            SignUpResponse::User(identity) => {
                tracing::info!("Signed up {}, awaiting email confirmation", identity.id);
                Ok(SignUpResult::ConfirmationRequired(identity))
            }
        }
    }

    async fn sign_out(&self) -> AppResult<()> {
        let _guard = self.auth_lock.lock().await;
        let token = self
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.access_token.clone());
        if let Some(token) = token {
            let request = self.http.request(Method::POST, "auth/v1/logout", Some(&token));
            if let Err(e) = self.http.send_empty(request).await {
                tracing::warn!("Remote sign-out failed, clearing local session anyway: {}", e);
            }
        }
        self.forget().await;
        self.emit(AuthEvent::signed_out());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl DataBackend for RestBackend {
    async fn fetch_profile(&self, id: &UserId) -> AppResult<Option<ProfileRecord>> {
        let token = self.bearer().await?;
        let request = self
            .http
            .request(Method::GET, PROFILES, token.as_deref())
            .query(&[("id", format!("eq.{}", id)), ("select", "*".to_string())]);
        let rows: Vec<ProfileRecord> = self.http.send_json(request).await?;
        Ok(rows.into_iter().next())
    }

    async fn ensure_profile(&self, profile: &NewProfile) -> AppResult<()> {
        let token = self.bearer().await?;
        let request = self
            .http
            .request(Method::POST, PROFILES, token.as_deref())
            .query(&[("on_conflict", "id")])
            .header("Prefer", "resolution=ignore-duplicates,return=minimal")
            .json(profile);
        self.http.send_empty(request).await
    }

    async fn update_profile(
        &self,
        id: &UserId,
        changes: &ProfileChanges,
    ) -> AppResult<ProfileRecord> {
        let token = self.bearer().await?;
        let request = self
            .http
            .request(Method::PATCH, PROFILES, token.as_deref())
            .query(&[("id", format!("eq.{}", id))])
            .header("Prefer", "return=representation")
            .json(changes);
        let rows: Vec<ProfileRecord> = self.http.send_json(request).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("profile {}", id)))
    }

    async fn find_family_by_code(&self, code: &InviteCode) -> AppResult<Option<FamilyGroup>> {
        let token = self.bearer().await?;
        let request = self
            .http
            .request(Method::GET, FAMILIES, token.as_deref())
            .query(&[
                ("invite_code", format!("eq.{}", code)),
                ("select", "*".to_string()),
            ]);
        let rows: Vec<FamilyGroup> = self.http.send_json(request).await?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_family(&self, id: &FamilyId) -> AppResult<Option<FamilyGroup>> {
        let token = self.bearer().await?;
        let request = self
            .http
            .request(Method::GET, FAMILIES, token.as_deref())
            .query(&[("id", format!("eq.{}", id)), ("select", "*".to_string())]);
        let rows: Vec<FamilyGroup> = self.http.send_json(request).await?;
        Ok(rows.into_iter().next())
    }

    async fn insert_family(&self, family: &NewFamily) -> AppResult<FamilyGroup> {
        let token = self.bearer().await?;
        let request = self
            .http
            .request(Method::POST, FAMILIES, token.as_deref())
            .header("Prefer", "return=representation")
            .json(family);
        let rows: Vec<FamilyGroup> = self.http.send_json(request).await.map_err(|e| match e {
            AppError::Backend { status, ref code, .. }
                if status == 409 || code.as_deref() == Some(PG_UNIQUE_VIOLATION) =>
            {
                AppError::DuplicateInviteCode(family.invite_code.to_string())
            }
            other => other,
        })?;
        rows.into_iter()
            .next()
            .ok_or_else(|| AppError::Internal("family insert returned no row".to_string()))
    }
}

fn credentials_error(err: AppError) -> AppError {
    match err {
        AppError::Backend {
            status: 400,
            ref code,
            ref message,
        } if code.as_deref() == Some("invalid_credentials")
            || message.contains("Invalid login credentials") =>
        {
            AppError::InvalidCredentials
        }
        other => other,
    }
}

/// Token grant response of the auth API.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: SessionIdentity,
}

impl TokenResponse {
    fn into_session(self) -> Session {
        let expires_at = self
            .expires_at
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .or_else(|| self.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)))
            .or_else(|| token_expiry(&self.access_token));
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user: self.user,
        }
    }
}

/// Signup answers with a full token grant when email confirmation is off, and
/// with the bare user object otherwise.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    Session(TokenResponse),
    User(SessionIdentity),
}

#[derive(Debug, Deserialize)]
struct AccessClaims {
    exp: i64,
}

/// Reads the `exp` claim of an access token without verifying it. Only the
/// server can verify the signature; the client just needs to know when to
/// refresh.
pub(crate) fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    decode::<AccessClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .ok()
        .and_then(|data| DateTime::from_timestamp(data.claims.exp, 0))
}
