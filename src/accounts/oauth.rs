//! OAuth token refresh
//!
//! The gateway never runs an authorization flow; it only exchanges the
//! refresh tokens it already holds for new access tokens when the scheduler
//! finds an expired account.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::config;

use super::record::Platform;

#[derive(Debug, Clone)]
pub struct RefreshedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

fn token_endpoint(platform: Platform) -> Option<&'static str> {
    match platform {
        Platform::Claude => Some("https://console.anthropic.com/v1/oauth/token"),
        Platform::Gemini => Some("https://oauth2.googleapis.com/token"),
        Platform::Openai => Some("https://auth.openai.com/oauth/token"),
        _ => None,
    }
}

/// Exchange a refresh token. Errors are strings; the caller turns a
/// failure into an unauthorized transition, not into a crash.
pub async fn refresh_access_token(
    platform: Platform,
    refresh_token: &str,
) -> Result<RefreshedTokens, String> {
    let endpoint =
        token_endpoint(platform).ok_or_else(|| format!("{} has no token endpoint", platform))?;
    if refresh_token.is_empty() {
        return Err("missing refresh token".to_string());
    }

    let cfg = config::load();
    let client_id = match platform {
        Platform::Claude => cfg.claude_oauth_client_id.clone(),
        Platform::Gemini => cfg.gemini_oauth_client_id.clone(),
        Platform::Openai => cfg.openai_oauth_client_id.clone(),
        _ => String::new(),
    };

    let mut form = vec![
        ("grant_type", "refresh_token".to_string()),
        ("refresh_token", refresh_token.to_string()),
    ];
    if !client_id.is_empty() {
        form.push(("client_id", client_id));
    }
    if platform == Platform::Gemini && !cfg.gemini_oauth_client_secret.is_empty() {
        form.push(("client_secret", cfg.gemini_oauth_client_secret.clone()));
    }

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .map_err(|e| format!("client build failed: {}", e))?;

    let response = client
        .post(endpoint)
        .form(&form)
        .send()
        .await
        .map_err(|e| format!("token refresh request failed: {}", e))?;

    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| format!("token refresh returned unparseable body: {}", e))?;

    if !status.is_success() {
        return Err(format!("token endpoint returned {}: {}", status, body));
    }

    let access_token = body
        .get("access_token")
        .and_then(|v| v.as_str())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| "token response missing access_token".to_string())?
        .to_string();
    let refresh_token = body
        .get("refresh_token")
        .and_then(|v| v.as_str())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string());
    let expires_in = body
        .get("expires_in")
        .and_then(|v| v.as_i64())
        .unwrap_or(3600);

    Ok(RefreshedTokens {
        access_token,
        refresh_token,
        expires_at: Utc::now() + Duration::seconds(expires_in),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_cover_oauth_platforms() {
        assert!(token_endpoint(Platform::Claude).is_some());
        assert!(token_endpoint(Platform::Gemini).is_some());
        assert!(token_endpoint(Platform::Openai).is_some());
        assert!(token_endpoint(Platform::GeminiApi).is_none());
        assert!(token_endpoint(Platform::Bedrock).is_none());
    }
}
