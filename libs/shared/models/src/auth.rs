use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Claims read from a Supabase-issued access token.
///
/// Supabase sets `role` to the database role (`authenticated`); the clinic
/// staff role is carried in `app_metadata.role` when present.
#[derive(Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    pub exp: Option<u64>,
    pub iat: Option<u64>,
    pub email: Option<String>,
    pub role: Option<String>,
    #[serde(default)]
    pub app_metadata: Option<serde_json::Value>,
}

impl JwtClaims {
    pub fn clinic_role(&self) -> Option<String> {
        self.app_metadata
            .as_ref()
            .and_then(|meta| meta.get("role"))
            .and_then(|role| role.as_str())
            .map(str::to_string)
            .or_else(|| self.role.clone())
    }
}

/// Authenticated caller, placed into request extensions by the auth middleware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub role: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
}
