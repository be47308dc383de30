use garde::Validate;
use serde::{Deserialize, Serialize};

/// Body of `POST /api/login`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LoginRequest {
    #[garde(email)]
    pub email: String,

    #[garde(length(min = 1))]
    pub password: String,

    #[garde(length(min = 1, max = 128))]
    pub device_id: String,
}

/// Envelope returned by the login endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub status: Option<bool>,
    pub message: Option<String>,
    pub data: Option<LoginData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginData {
    pub id: Option<i64>,
    pub token: Option<String>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// Identity of the signed-in user, persisted between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub token: String,
    pub email: Option<String>,
    pub name: Option<String>,
}
