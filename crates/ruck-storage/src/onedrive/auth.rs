use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use ruck_types::{Result, RuckError};

/// Microsoft identity platform token endpoint.
pub const TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";

/// Scopes requested on refresh.
pub const SCOPE: &str = "files.readwrite offline_access";

/// Environment variable overriding the secrets file location.
pub const SECRETS_FILE_ENV: &str = "ONEDRIVE_SECRETS_FILE";

/// Refresh the access token this long before its recorded expiry.
const EXPIRY_LEEWAY: Duration = Duration::from_secs(60);

/// On-disk OAuth2 secrets, produced by the interactive authorization-code
/// flow (external to this crate) and consumed here for refreshes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsFile {
    #[serde(rename = "ClientID")]
    pub client_id: String,
    #[serde(rename = "ClientSecret")]
    pub client_secret: String,
    #[serde(rename = "Token")]
    pub token: StoredToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    #[serde(rename = "AccessToken")]
    pub access_token: String,
    #[serde(rename = "RefreshToken")]
    pub refresh_token: String,
    #[serde(rename = "Expiry")]
    pub expiry: DateTime<Utc>,
}

/// Shape of a token-endpoint refresh response.
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

/// Resolve the secrets file path: explicit configuration wins, then the
/// `ONEDRIVE_SECRETS_FILE` environment variable, then the default under the
/// user's config directory.
pub fn secrets_path(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = configured {
        return Ok(p.to_path_buf());
    }
    if let Some(p) = std::env::var_os(SECRETS_FILE_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(p));
    }
    let home = home_dir().ok_or_else(|| {
        RuckError::Auth("cannot locate home directory for onedrive secrets file".into())
    })?;
    Ok(home.join(".config/ruck/onedrive-secrets.json"))
}

#[cfg(unix)]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            use nix::unistd::{Uid, User};
            User::from_uid(Uid::effective()).ok().flatten().map(|u| u.dir)
        })
}

#[cfg(not(unix))]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE").map(PathBuf::from)
}

/// Bearer-token source backed by the secrets file.
///
/// Authentication that needs round-trips before usable credentials exist is
/// a pre-flight concern: the initial access token comes from the secrets
/// file at open, and every subsequent request just consults [`bearer`],
/// which refreshes through the token endpoint when the recorded expiry is
/// near. Rotated refresh tokens are written back to the secrets file so the
/// next process start does not reuse a consumed token.
pub struct TokenSource {
    agent: ureq::Agent,
    token_url: String,
    client_id: String,
    client_secret: String,
    path: PathBuf,
    state: Mutex<StoredToken>,
}

impl std::fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSource")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[redacted]")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl TokenSource {
    pub fn from_file(path: &Path, token_url: Option<&str>) -> Result<Self> {
        let raw = std::fs::read(path).map_err(|e| {
            RuckError::Auth(format!(
                "cannot read onedrive secrets file {}: {e}",
                path.display()
            ))
        })?;
        let secrets: SecretsFile = serde_json::from_slice(&raw).map_err(|e| {
            RuckError::Auth(format!(
                "malformed onedrive secrets file {}: {e}",
                path.display()
            ))
        })?;

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(60))
            .timeout_write(Duration::from_secs(60))
            .build();

        Ok(TokenSource {
            agent,
            token_url: token_url.unwrap_or(TOKEN_URL).to_string(),
            client_id: secrets.client_id,
            client_secret: secrets.client_secret,
            path: path.to_path_buf(),
            state: Mutex::new(secrets.token),
        })
    }

    /// A currently-valid access token, refreshing through the token endpoint
    /// if the cached one expires within the leeway window.
    pub fn bearer(&self) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let expires_at = state.expiry;
        let now = Utc::now();
        if expires_at - chrono::Duration::from_std(EXPIRY_LEEWAY).unwrap() > now {
            return Ok(state.access_token.clone());
        }

        debug!("access token expires at {expires_at}, refreshing");
        self.refresh(&mut state)?;
        Ok(state.access_token.clone())
    }

    fn refresh(&self, state: &mut StoredToken) -> Result<()> {
        let response = self
            .agent
            .post(&self.token_url)
            .send_form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", state.refresh_token.as_str()),
                ("scope", SCOPE),
            ])
            .map_err(|e| match e {
                ureq::Error::Status(code, resp) => RuckError::Auth(format!(
                    "token refresh failed: HTTP {code} {}",
                    resp.status_text()
                )),
                ureq::Error::Transport(t) => {
                    RuckError::Auth(format!("token refresh failed: {t}"))
                }
            })?;

        let refreshed: RefreshResponse = response
            .into_json()
            .map_err(|e| RuckError::Auth(format!("malformed token response: {e}")))?;

        state.access_token = refreshed.access_token;
        if let Some(rotated) = refreshed.refresh_token {
            state.refresh_token = rotated;
        }
        state.expiry = Utc::now() + chrono::Duration::seconds(refreshed.expires_in.max(0));

        self.persist(state);
        Ok(())
    }

    /// Write the rotated token back to the secrets file. Best-effort: a
    /// read-only secrets file costs an extra refresh next run, nothing more.
    fn persist(&self, state: &StoredToken) {
        let secrets = SecretsFile {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            token: state.clone(),
        };
        let result = serde_json::to_vec_pretty(&secrets)
            .map_err(RuckError::from)
            .and_then(|data| std::fs::write(&self.path, data).map_err(RuckError::from));
        if let Err(e) = result {
            warn!(
                "failed to persist refreshed token to {}: {e}",
                self.path.display()
            );
        }
    }
}
