//! Authenticated backend sessions with a durable on-disk cache.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use sweep_types::DataField;
use tracing::{debug, info, warn};

/// Default backend base URL.
pub const DEFAULT_API_URL: &str = "https://api.worldquantbrain.com";

/// Errors surfaced while acquiring a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no credentials: {message}")]
    MissingCredentials { message: String },
    #[error("authentication failed ({status}): {message}")]
    AuthenticationFailed { status: u16, message: String },
    #[error("{path} answered {status}: {message}")]
    UnexpectedStatus {
        path: String,
        status: u16,
        message: String,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("session cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session cache is malformed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// A logged-in connection to the backend, cheap to clone and shared by
/// every worker.
#[derive(Debug, Clone)]
pub struct AuthenticatedSession {
    client: reqwest::Client,
    base_url: String,
    cookie: String,
    expires_at: DateTime<Utc>,
}

impl AuthenticatedSession {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        cookie: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cookie: cookie.into(),
            expires_at,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Resolve a path or absolute URL against the base URL.
    pub fn url(&self, path_or_url: &str) -> String {
        if path_or_url.starts_with("http://") || path_or_url.starts_with("https://") {
            path_or_url.to_string()
        } else {
            format!("{}/{}", self.base_url, path_or_url.trim_start_matches('/'))
        }
    }

    pub fn get(&self, path_or_url: &str) -> reqwest::RequestBuilder {
        self.client
            .get(self.url(path_or_url))
            .header(COOKIE, &self.cookie)
    }

    pub fn post(&self, path_or_url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(self.url(path_or_url))
            .header(COOKIE, &self.cookie)
    }

    /// Describe data field `id`, including where it is available.
    pub async fn data_field(&self, id: &str) -> SessionResult<DataField> {
        let path = format!("/data-fields/{id}");
        let response = self.get(&path).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SessionError::UnexpectedStatus {
                path,
                status: status.as_u16(),
                message: message.trim().to_string(),
            });
        }
        Ok(response.json().await?)
    }

    /// Describe every field in `ids`, in order.
    pub async fn data_fields(&self, ids: &[String]) -> SessionResult<Vec<DataField>> {
        let mut fields = Vec::with_capacity(ids.len());
        for id in ids {
            let field = self.data_field(id).await?;
            debug!(field = %field.id, combinations = field.data.len(), "data field coverage");
            fields.push(field);
        }
        Ok(fields)
    }
}

/// Supplies a session that stays valid for at least the requested time.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn get_session(&self, minimum_validity: Duration) -> SessionResult<AuthenticatedSession>;
}

/// Login credentials.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl Credentials {
    pub const USERNAME_VAR: &'static str = "ALPHA_SWEEP_USERNAME";
    pub const PASSWORD_VAR: &'static str = "ALPHA_SWEEP_PASSWORD";

    /// Credentials from the environment, falling back to
    /// `~/.brain_credentials` (a JSON `["email", "password"]` pair).
    pub fn from_env_or_file() -> SessionResult<Self> {
        if let (Ok(username), Ok(password)) = (
            std::env::var(Self::USERNAME_VAR),
            std::env::var(Self::PASSWORD_VAR),
        ) {
            return Ok(Self { username, password });
        }
        let path = dirs::home_dir()
            .map(|h| h.join(".brain_credentials"))
            .ok_or_else(|| SessionError::MissingCredentials {
                message: "no home directory".into(),
            })?;
        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> SessionResult<Self> {
        if !path.exists() {
            return Err(SessionError::MissingCredentials {
                message: format!(
                    "set {} and {} or create {}",
                    Self::USERNAME_VAR,
                    Self::PASSWORD_VAR,
                    path.display()
                ),
            });
        }
        let (username, password): (String, String) =
            serde_json::from_str(&std::fs::read_to_string(path)?)?;
        Ok(Self { username, password })
    }
}

/// What is persisted between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSession {
    pub cookie: String,
    pub saved_at: DateTime<Utc>,
}

impl CachedSession {
    pub fn load(path: &Path) -> SessionResult<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    pub fn save(&self, path: &Path) -> SessionResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct AuthenticationInfo {
    token: Option<TokenInfo>,
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    /// Seconds until the token expires.
    expiry: f64,
}

/// Session provider for the simulation backend: reuses the cached cookie
/// while it has enough life left, logs in again otherwise.
#[derive(Debug)]
pub struct BrainSessionProvider {
    client: reqwest::Client,
    base_url: String,
    cache_path: PathBuf,
    credentials: Credentials,
}

impl BrainSessionProvider {
    pub fn new(
        base_url: impl Into<String>,
        cache_path: impl Into<PathBuf>,
        credentials: Credentials,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            cache_path: cache_path.into(),
            credentials,
        }
    }

    /// Remaining validity of `cookie`, or `None` when the backend no
    /// longer recognises it.
    async fn remaining_validity(&self, cookie: &str) -> SessionResult<Option<Duration>> {
        let candidate = AuthenticatedSession::new(
            self.client.clone(),
            &self.base_url,
            cookie,
            Utc::now(),
        );
        let response = candidate.get("/authentication").send().await?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let info: AuthenticationInfo = response.json().await?;
        Ok(info
            .token
            .map(|t| Duration::from_secs_f64(t.expiry.max(0.0))))
    }

    async fn login(&self) -> SessionResult<(String, Duration)> {
        let response = self
            .client
            .post(format!(
                "{}/authentication",
                self.base_url.trim_end_matches('/')
            ))
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED
            && response
                .headers()
                .get("www-authenticate")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.eq_ignore_ascii_case("persona"))
        {
            return Err(SessionError::AuthenticationFailed {
                status: status.as_u16(),
                message: "biometric (persona) authentication required".into(),
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SessionError::AuthenticationFailed {
                status: status.as_u16(),
                message,
            });
        }

        let cookie = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .map(str::trim)
            .collect::<Vec<_>>()
            .join("; ");
        if cookie.is_empty() {
            return Err(SessionError::AuthenticationFailed {
                status: status.as_u16(),
                message: "login response carried no session cookie".into(),
            });
        }
        let info: AuthenticationInfo = response.json().await?;
        let validity = info
            .token
            .map_or(Duration::ZERO, |t| Duration::from_secs_f64(t.expiry.max(0.0)));
        Ok((cookie, validity))
    }

    fn session(&self, cookie: String, validity: Duration) -> AuthenticatedSession {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(validity).unwrap_or_else(|_| chrono::Duration::zero());
        AuthenticatedSession::new(self.client.clone(), &self.base_url, cookie, expires_at)
    }
}

#[async_trait]
impl SessionProvider for BrainSessionProvider {
    async fn get_session(&self, minimum_validity: Duration) -> SessionResult<AuthenticatedSession> {
        match CachedSession::load(&self.cache_path) {
            Ok(Some(cached)) => match self.remaining_validity(&cached.cookie).await {
                Ok(Some(validity)) if validity >= minimum_validity => {
                    info!(
                        expires_in_s = validity.as_secs(),
                        "reusing cached session"
                    );
                    return Ok(self.session(cached.cookie, validity));
                }
                Ok(_) => info!("cached session expired or too close to expiry"),
                Err(e) => warn!(error = %e, "could not validate cached session"),
            },
            Ok(None) => {}
            Err(e) => warn!(
                path = %self.cache_path.display(),
                error = %e,
                "failed to load session cache"
            ),
        }

        info!("logging in");
        let (cookie, validity) = self.login().await?;
        CachedSession {
            cookie: cookie.clone(),
            saved_at: Utc::now(),
        }
        .save(&self.cache_path)?;
        info!(
            path = %self.cache_path.display(),
            expires_in_s = validity.as_secs(),
            "new session saved"
        );
        Ok(self.session(cookie, validity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn cache_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("session.json");
        assert_eq!(CachedSession::load(&path).unwrap(), None);

        let cached = CachedSession {
            cookie: "t=abc.def".into(),
            saved_at: Utc::now(),
        };
        cached.save(&path).unwrap();
        assert_eq!(CachedSession::load(&path).unwrap(), Some(cached));
    }

    #[test]
    fn malformed_cache_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, b"\x80\x04pickle").unwrap();
        assert!(CachedSession::load(&path).is_err());
    }

    #[test]
    fn unexpected_status_names_the_request() {
        let err = SessionError::UnexpectedStatus {
            path: "/data-fields/clsoe".into(),
            status: 404,
            message: "Not found.".into(),
        };
        assert_eq!(err.to_string(), "/data-fields/clsoe answered 404: Not found.");
    }

    #[test]
    fn credentials_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".brain_credentials");
        std::fs::write(&path, r#"["quant@example.com", "hunter2"]"#).unwrap();

        let creds = Credentials::from_file(&path).unwrap();
        assert_eq!(creds.username, "quant@example.com");
        assert!(!format!("{creds:?}").contains("hunter2"));

        assert!(matches!(
            Credentials::from_file(&dir.path().join("missing")),
            Err(SessionError::MissingCredentials { .. })
        ));
    }

    #[test]
    fn url_resolution() {
        let session = AuthenticatedSession::new(
            reqwest::Client::new(),
            "https://api.example.com/",
            "t=1",
            Utc::now(),
        );
        assert_eq!(session.url("/simulations"), "https://api.example.com/simulations");
        assert_eq!(session.url("alphas/x1"), "https://api.example.com/alphas/x1");
        assert_eq!(
            session.url("https://api.example.com/simulations/42"),
            "https://api.example.com/simulations/42"
        );
    }
}
