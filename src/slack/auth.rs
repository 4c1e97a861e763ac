//! RTM endpoint resolution.
//!
//! `rtm.start` trades the bot token for a short-lived WebSocket URL.

use serde::Deserialize;
use tracing::{debug, info};

use crate::{AppError, Result};

#[derive(Debug, Deserialize)]
struct StartResponse {
    #[serde(default)]
    ok: Option<bool>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Ask `auth_url` for the WebSocket endpoint of a new RTM session.
///
/// # Errors
///
/// Returns `AppError::Auth` when the request fails, the body is not JSON,
/// Slack reports `ok: false`, or the response carries no `url`.
pub async fn resolve_endpoint(
    http: &reqwest::Client,
    auth_url: &str,
    token: &str,
) -> Result<String> {
    let url = reqwest::Url::parse_with_params(auth_url, &[("token", token)])
        .map_err(|err| AppError::Auth(format!("invalid auth url: {err}")))?;

    debug!(auth_url, "requesting rtm endpoint");

    let body = http
        .get(url)
        .send()
        .await
        .map_err(|err| AppError::Auth(format!("rtm.start request failed: {err}")))?
        .text()
        .await
        .map_err(|err| AppError::Auth(format!("rtm.start body unreadable: {err}")))?;

    let response: StartResponse = serde_json::from_str(&body)
        .map_err(|err| AppError::Auth(format!("rtm.start returned malformed json: {err}")))?;

    if response.ok == Some(false) {
        return Err(AppError::Auth(format!(
            "rtm.start rejected: {}",
            response.error.as_deref().unwrap_or("unknown error")
        )));
    }

    let endpoint = response
        .url
        .filter(|url| !url.is_empty())
        .ok_or_else(|| AppError::Auth("unable to parse rtm url".into()))?;

    info!("rtm endpoint resolved");
    Ok(endpoint)
}
