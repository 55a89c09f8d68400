use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Postgres error code for a row-level security violation.
pub const PG_INSUFFICIENT_PRIVILEGE: &str = "42501";
/// Postgres error code for a unique constraint violation.
pub const PG_UNIQUE_VIOLATION: &str = "23505";

/// Thin wrapper over `reqwest` that knows the backend base URL and anon key.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> AppResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Starts a request carrying the `apikey` header. Without a user token the
    /// anon key doubles as the bearer, as the backend expects.
    pub fn request(&self, method: Method, path: &str, bearer: Option<&str>) -> RequestBuilder {
        let token = bearer.unwrap_or(&self.api_key);
        self.client
            .request(method, self.url(path))
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", token))
    }

    pub async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> AppResult<T> {
        let response = request.send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn send_empty(&self, request: RequestBuilder) -> AppResult<()> {
        let response = request.send().await?;
        check_status(response).await?;
        Ok(())
    }
}

async fn check_status(response: Response) -> AppResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(error_from_body(status, &body))
}

/// Error body shapes used by the auth and data APIs.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

pub(crate) fn error_from_body(status: StatusCode, body: &str) -> AppError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();

    // GoTrue sends a numeric `code` with the HTTP status; PostgREST sends the
    // SQLSTATE as a string.
    let code = parsed.error_code.or_else(|| match parsed.code {
        Some(serde_json::Value::String(s)) => Some(s),
        _ => None,
    });
    let message = parsed
        .error_description
        .or(parsed.message)
        .or(parsed.msg)
        .or(parsed.error)
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                body.trim().to_string()
            }
        });

    if code.as_deref() == Some(PG_INSUFFICIENT_PRIVILEGE) || status == StatusCode::FORBIDDEN {
        return AppError::PolicyRejected(message);
    }
    if status == StatusCode::UNAUTHORIZED {
        return AppError::Unauthenticated;
    }
    AppError::Backend {
        status: status.as_u16(),
        code,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_cleanly() {
        let client = HttpClient::new("https://api.test/", "anon", Duration::from_secs(5)).unwrap();
        assert_eq!(client.url("/rest/v1/profiles"), "https://api.test/rest/v1/profiles");
        assert_eq!(client.url("auth/v1/signup"), "https://api.test/auth/v1/signup");
    }

    #[test]
    fn test_postgrest_unique_violation() {
        let body = r#"{"code":"23505","details":"Key (invite_code)=(ABC123) already exists.","hint":null,"message":"duplicate key value violates unique constraint \"families_invite_code_key\""}"#;
        match error_from_body(StatusCode::CONFLICT, body) {
            AppError::Backend { status, code, message } => {
                assert_eq!(status, 409);
                assert_eq!(code.as_deref(), Some(PG_UNIQUE_VIOLATION));
                assert!(message.starts_with("duplicate key value"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_policy_violation() {
        let body = r#"{"code":"42501","message":"new row violates row-level security policy for table \"profiles\""}"#;
        assert!(matches!(
            error_from_body(StatusCode::UNAUTHORIZED, body),
            AppError::PolicyRejected(_)
        ));
    }

    #[test]
    fn test_gotrue_error_description() {
        let body = r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#;
        match error_from_body(StatusCode::BAD_REQUEST, body) {
            AppError::Backend { message, .. } => assert_eq!(message, "Invalid login credentials"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_gotrue_numeric_code_and_msg() {
        let body = r#"{"code":422,"error_code":"weak_password","msg":"Password should be at least 6 characters"}"#;
        match error_from_body(StatusCode::UNPROCESSABLE_ENTITY, body) {
            AppError::Backend { code, message, .. } => {
                assert_eq!(code.as_deref(), Some("weak_password"));
                assert_eq!(message, "Password should be at least 6 characters");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_empty_body_uses_reason_phrase() {
        match error_from_body(StatusCode::BAD_GATEWAY, "") {
            AppError::Backend { message, .. } => assert_eq!(message, "Bad Gateway"),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
