use anyhow::Result;
use reqwest::{
    Client,
    header::{HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION},
    Method, StatusCode,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error};

use shared_config::AppConfig;

/// Error body returned by PostgREST, kept typed so callers can branch on the
/// Postgres SQLSTATE (`code`) instead of matching on message text.
#[derive(Debug, Clone, thiserror::Error)]
#[error("API error ({status}): {message}")]
pub struct SupabaseApiError {
    pub status: u16,
    pub code: Option<String>,
    pub message: String,
}

impl SupabaseApiError {
    fn from_body(status: StatusCode, body: &str) -> Self {
        let parsed: Option<Value> = serde_json::from_str(body).ok();
        let code = parsed
            .as_ref()
            .and_then(|v| v.get("code"))
            .and_then(|c| c.as_str())
            .map(str::to_string);
        let message = parsed
            .as_ref()
            .and_then(|v| v.get("message"))
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string());

        Self {
            status: status.as_u16(),
            code,
            message,
        }
    }

    pub fn is_auth_error(&self) -> bool {
        matches!(self.status, 401 | 403)
    }

    pub fn has_code(&self, sqlstate: &str) -> bool {
        self.code.as_deref() == Some(sqlstate)
    }
}

pub struct SupabaseClient {
    client: Client,
    base_url: String,
    anon_key: String,
}

impl SupabaseClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.supabase_url.trim_end_matches('/').to_string(),
            anon_key: config.supabase_anon_key.clone(),
        }
    }

    fn get_headers(&self, auth_token: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();

        if let Ok(key) = HeaderValue::from_str(&self.anon_key) {
            headers.insert("apikey", key);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = auth_token {
            if let Ok(bearer) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, bearer);
            }
        }

        headers
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        auth_token: Option<&str>,
        body: Option<Value>,
        extra_headers: Option<HeaderMap>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making request to {}", url);

        let mut headers = self.get_headers(auth_token);
        if let Some(extra) = extra_headers {
            headers.extend(extra);
        }

        let mut req = self.client.request(method, &url).headers(headers);

        if let Some(body_data) = body {
            req = req.json(&body_data);
        }

        let response = req.send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await?;
            error!("API error ({}): {}", status, error_text);
            return Err(SupabaseApiError::from_body(status, &error_text).into());
        }

        Ok(response)
    }

    pub async fn request<T>(&self, method: Method, path: &str,
                            auth_token: Option<&str>, body: Option<Value>)
                            -> Result<T>
    where T: DeserializeOwned {
        let response = self.send(method, path, auth_token, body, None).await?;
        Ok(response.json::<T>().await?)
    }

    /// GET with `Prefer: count=exact`; the total comes from `Content-Range`.
    pub async fn request_with_count<T>(&self, path: &str, auth_token: Option<&str>) -> Result<(T, Option<u64>)>
    where T: DeserializeOwned {
        let mut headers = HeaderMap::new();
        headers.insert("Prefer", HeaderValue::from_static("count=exact"));
        let response = self.send(Method::GET, path, auth_token, None, Some(headers)).await?;

        let total = response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total);

        Ok((response.json::<T>().await?, total))
    }

    /// Fire a write whose response body is not needed (`Prefer: return=minimal`).
    pub async fn execute(
        &self,
        method: Method,
        path: &str,
        auth_token: Option<&str>,
        body: Option<Value>,
    ) -> Result<()> {
        let mut headers = HeaderMap::new();
        headers.insert("Prefer", HeaderValue::from_static("return=minimal"));
        self.send(method, path, auth_token, body, Some(headers)).await?;
        Ok(())
    }

    /// Call a Postgres function exposed through `/rest/v1/rpc/{function}`.
    pub async fn rpc<T>(&self, function: &str, auth_token: Option<&str>, args: Value) -> Result<T>
    where T: DeserializeOwned {
        let path = format!("/rest/v1/rpc/{}", function);
        self.request(Method::POST, &path, auth_token, Some(args)).await
    }
}

/// `0-24/3573` -> 3573; `*/0` -> 0; `0-24/*` -> None.
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next().and_then(|total| total.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_total_is_parsed() {
        assert_eq!(parse_content_range_total("0-24/3573"), Some(3573));
        assert_eq!(parse_content_range_total("*/0"), Some(0));
        assert_eq!(parse_content_range_total("0-24/*"), None);
    }

    #[test]
    fn api_error_keeps_postgres_code() {
        let body = r#"{"code":"23P01","message":"conflicting key value violates exclusion constraint"}"#;
        let err = SupabaseApiError::from_body(StatusCode::CONFLICT, body);
        assert_eq!(err.status, 409);
        assert!(err.has_code("23P01"));
        assert!(err.message.contains("exclusion"));
    }

    #[test]
    fn api_error_falls_back_to_raw_body() {
        let err = SupabaseApiError::from_body(StatusCode::UNAUTHORIZED, "JWT expired");
        assert!(err.is_auth_error());
        assert_eq!(err.code, None);
        assert_eq!(err.message, "JWT expired");
    }
}
