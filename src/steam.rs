//! Thin HTTP client for the game-server identity registry.
//!
//! The provider wraps every payload in `{ "response": ... }` and signals
//! errors either through a non-2xx status or an out-of-band
//! `X-error_message` header; both are surfaced as [`SteamError`].

use reqwest::Method;
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_API_BASE: &str = "https://api.steampowered.com/IGameServersService";
const API_VERSION: &str = "v1";
const ERROR_HEADER: &str = "X-error_message";

/// Identity-registry errors.
#[derive(Debug, Error)]
pub enum SteamError {
    /// The registry reported an error through its error header.
    #[error("{0}")]
    Api(String),

    #[error("registry request failed with status {0}")]
    Status(u16),

    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed registry response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A per-server identity, an abstraction around a login token for
/// dedicated servers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Account {
    #[serde(default, rename = "steamid")]
    pub steam_id: String,
    #[serde(default, rename = "appid")]
    pub app_id: u32,
    #[serde(default)]
    pub login_token: String,
    #[serde(default)]
    pub memo: String,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub is_expired: bool,
    #[serde(default, rename = "rt_last_logon")]
    pub last_logon: i64,
}

#[derive(Debug, Deserialize)]
struct ResponseWrapper {
    #[serde(default)]
    response: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ServerList {
    #[serde(default)]
    servers: Vec<Account>,
}

/// Renders a memo template with the round's identifiers.
pub fn render_memo(template: &str, match_id: i32, round_id: i32) -> String {
    template
        .replace("{match_id}", &match_id.to_string())
        .replace("{round_id}", &round_id.to_string())
}

/// Client for the identity registry.
#[derive(Debug, Clone)]
pub struct SteamClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl SteamClient {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, DEFAULT_API_BASE.to_string())
    }

    /// Points the client at a non-default registry endpoint.
    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Creates a new game-server identity; the returned account carries the
    /// login token for dedicated servers.
    pub async fn create_account(&self, app_id: u32, memo: &str) -> Result<Account, SteamError> {
        let value = self
            .query(
                "CreateAccount",
                Method::POST,
                &[("appid", app_id.to_string()), ("memo", memo.to_string())],
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Lists every identity owned by the configured key.
    pub async fn get_account_list(&self) -> Result<Vec<Account>, SteamError> {
        let value = self.query("GetAccountList", Method::GET, &[]).await?;
        let list: ServerList = serde_json::from_value(value)?;
        Ok(list.servers)
    }

    /// Deletes an identity, immediately expiring its login token.
    pub async fn delete_account(&self, steam_id: &str) -> Result<(), SteamError> {
        self.query(
            "DeleteAccount",
            Method::POST,
            &[("steamid", steam_id.to_string())],
        )
        .await?;
        Ok(())
    }

    /// Sends one registry request: injects the API key, checks the error
    /// header and status, and unwraps the `response` envelope.
    async fn query(
        &self,
        command: &str,
        method: Method,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value, SteamError> {
        let url = format!("{}/{command}/{API_VERSION}", self.base_url);
        let mut query: Vec<(&str, &str)> = vec![("key", self.api_key.as_str())];
        for (name, value) in params {
            query.push((*name, value.as_str()));
        }

        let response = self
            .http
            .request(method, url)
            .query(&query)
            .send()
            .await?;

        if let Some(message) = response
            .headers()
            .get(ERROR_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|message| !message.is_empty())
        {
            return Err(SteamError::Api(message.to_string()));
        }

        let status = response.status();
        if !status.is_success() {
            return Err(SteamError::Status(status.as_u16()));
        }

        let wrapper: ResponseWrapper = response.json().await?;
        Ok(wrapper.response)
    }
}
