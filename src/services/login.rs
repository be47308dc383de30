use garde::Validate;
use reqwest::Client;
use std::time::Duration;

use crate::models::session::{LoginData, LoginRequest, LoginResponse, Session};

/// Client for the backend login exchange that yields the user id.
pub struct LoginClient {
    http: Client,
    base_url: String,
}

impl LoginClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, LoginError> {
        Ok(Self {
            http: Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn login(&self, request: &LoginRequest) -> Result<Session, LoginError> {
        request
            .validate()
            .map_err(|e| LoginError::Invalid(e.to_string()))?;

        let url = format!("{}/api/login", self.base_url);
        let response = self.http.post(&url).json(request).send().await?;

        let status = response.status();
        let body: LoginResponse = response.json().await?;
        if !status.is_success() || body.status != Some(true) {
            return Err(LoginError::Rejected(
                body.message.unwrap_or_else(|| format!("HTTP {status}")),
            ));
        }

        let data = body.data.ok_or(LoginError::MissingField("data"))?;
        let session = session_from(data)?;
        tracing::info!(user_id = %session.user_id, "Logged in");
        Ok(session)
    }
}

fn session_from(data: LoginData) -> Result<Session, LoginError> {
    let user_id = data.id.ok_or(LoginError::MissingField("id"))?;
    let token = data.token.ok_or(LoginError::MissingField("token"))?;
    let name = match (data.first_name, data.last_name) {
        (Some(first), Some(last)) => Some(format!("{first} {last}")),
        (first, last) => first.or(last),
    };
    Ok(Session {
        user_id: user_id.to_string(),
        token,
        email: data.email,
        name,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("Invalid login request: {0}")]
    Invalid(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Login rejected: {0}")]
    Rejected(String),

    #[error("Login response missing {0}")]
    MissingField(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_email_rejected_before_request() {
        let client = LoginClient::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
        let request = LoginRequest {
            email: "not-an-email".to_string(),
            password: "secret".to_string(),
            device_id: "dev-1".to_string(),
        };
        assert!(matches!(client.login(&request).await, Err(LoginError::Invalid(_))));
    }

    #[test]
    fn test_session_from_login_data() {
        let data: LoginData = serde_json::from_str(
            r#"{"id": 17, "token": "abc", "email": "a@b.co", "first_name": "Ravi", "last_name": "K"}"#,
        )
        .unwrap();
        let session = session_from(data).unwrap();
        assert_eq!(session.user_id, "17");
        assert_eq!(session.name.as_deref(), Some("Ravi K"));
    }

    #[test]
    fn test_missing_token_is_error() {
        let data: LoginData = serde_json::from_str(r#"{"id": 17}"#).unwrap();
        assert!(matches!(session_from(data), Err(LoginError::MissingField("token"))));
    }
}
