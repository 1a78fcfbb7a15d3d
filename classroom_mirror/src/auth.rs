//! Authentication session for Google APIs.
//!
//! An [`AuthSession`] is created once per run and shared by reference with
//! every component that talks to Google. It hands out access tokens, refreshes
//! them when they expire, and persists refreshed user tokens to the local
//! token store. Refreshes are serialized: concurrent callers that find the
//! token stale wait on a single in-flight refresh instead of starting their own.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::error::{MirrorError, Result};
use crate::models::{ClientSecret, ClientSecretFile, ServiceAccountCredentials, TokenResponse};

/// Google OAuth2 token endpoint.
pub const TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Read-only scopes needed to list courses, topics and materials and to read Drive content.
pub const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/classroom.courses.readonly",
    "https://www.googleapis.com/auth/classroom.courseworkmaterials.readonly",
    "https://www.googleapis.com/auth/classroom.topics.readonly",
    "https://www.googleapis.com/auth/drive.readonly",
];

/// Tokens this close to expiry are treated as expired.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Lifetime requested for service account assertions.
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// An OAuth access token with its refresh credential.
///
/// The serialized form doubles as the on-disk token store. It also accepts the
/// `authorized_user` credential file shape, which carries the client id and
/// secret next to the refresh token and has no access token yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AuthToken {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, alias = "expiry")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

impl AuthToken {
    /// Whether the access token can be used at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.access_token.is_empty()
            && self
                .expires_at
                .is_some_and(|exp| exp > now + Duration::seconds(EXPIRY_MARGIN_SECS))
    }
}

/// Lifecycle state of an [`AuthSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
    Refreshing,
}

/// Local file holding the user's token between runs.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored token. A missing or unreadable store yields `None`.
    pub fn load(&self) -> Option<AuthToken> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "no token store");
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring corrupt token store");
                None
            }
        }
    }

    /// Write the token atomically, readable by the owner only.
    pub fn save(&self, token: &AuthToken) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(token)?)?;
        secure_file(&tmp)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn secure_file(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn secure_file(_path: &Path) -> Result<()> {
    Ok(())
}

/// JWT claims for service account authentication.
#[derive(Debug, Serialize)]
struct Claims {
    iss: String,
    scope: String,
    aud: String,
    exp: i64,
    iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    sub: Option<String>,
}

enum TokenSource {
    AuthorizedUser {
        store: TokenStore,
        secret: Option<ClientSecret>,
    },
    ServiceAccount {
        credentials: ServiceAccountCredentials,
        subject: Option<String>,
    },
}

/// Owns the token lifecycle for one run.
pub struct AuthSession {
    source: TokenSource,
    http: Client,
    token_uri: String,
    cached: RwLock<Option<AuthToken>>,
    refresh_lock: Mutex<()>,
    refreshing: AtomicBool,
}

impl AuthSession {
    /// Session backed by a stored user token.
    ///
    /// `secret` supplies the OAuth client when the stored token does not carry
    /// its own client id and secret.
    pub fn authorized_user(store: TokenStore, secret: Option<ClientSecret>) -> Self {
        let cached = store.load();
        let token_uri = secret
            .as_ref()
            .and_then(|s| s.token_uri.clone())
            .unwrap_or_else(|| TOKEN_URI.to_string());
        Self {
            source: TokenSource::AuthorizedUser { store, secret },
            http: Client::new(),
            token_uri,
            cached: RwLock::new(cached),
            refresh_lock: Mutex::new(()),
            refreshing: AtomicBool::new(false),
        }
    }

    /// Session from a token store path and an optional client secret file.
    pub fn from_files<P: AsRef<Path>>(token_path: P, client_secret_path: Option<&Path>) -> Result<Self> {
        let secret = match client_secret_path.filter(|p| p.exists()) {
            Some(path) => {
                let content = fs::read_to_string(path)?;
                let file: ClientSecretFile = serde_json::from_str(&content)?;
                Some(file.into_secret().ok_or_else(|| {
                    MirrorError::Config(format!(
                        "{} has neither an \"installed\" nor a \"web\" client",
                        path.display()
                    ))
                })?)
            }
            None => None,
        };
        Ok(Self::authorized_user(
            TokenStore::new(token_path.as_ref()),
            secret,
        ))
    }

    /// Session from a service account JSON key file.
    ///
    /// `subject` names the user to impersonate through domain-wide delegation.
    pub fn from_service_account_file<P: AsRef<Path>>(path: P, subject: Option<String>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let credentials: ServiceAccountCredentials = serde_json::from_str(&content)?;
        Ok(Self::service_account(credentials, subject))
    }

    pub fn service_account(credentials: ServiceAccountCredentials, subject: Option<String>) -> Self {
        let token_uri = credentials
            .token_uri
            .clone()
            .unwrap_or_else(|| TOKEN_URI.to_string());
        Self {
            source: TokenSource::ServiceAccount {
                credentials,
                subject,
            },
            http: Client::new(),
            token_uri,
            cached: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            refreshing: AtomicBool::new(false),
        }
    }

    /// Override the token endpoint.
    pub fn with_token_uri(mut self, token_uri: impl Into<String>) -> Self {
        self.token_uri = token_uri.into();
        self
    }

    pub async fn state(&self) -> AuthState {
        if self.refreshing.load(Ordering::SeqCst) {
            return AuthState::Refreshing;
        }
        match self.cached.read().await.as_ref() {
            Some(_) => AuthState::Authenticated,
            None => AuthState::Unauthenticated,
        }
    }

    /// Return a valid token, refreshing it first if it has expired.
    pub async fn acquire(&self) -> Result<AuthToken> {
        if let Some(token) = self.valid_cached().await {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited for the lock.
        if let Some(token) = self.valid_cached().await {
            return Ok(token);
        }

        self.refreshing.store(true, Ordering::SeqCst);
        let refreshed = self.refresh().await;
        self.refreshing.store(false, Ordering::SeqCst);

        let token = match refreshed {
            Ok(token) => token,
            Err(e) => {
                if e.is_fatal() {
                    // Back to Unauthenticated until consent is given again.
                    *self.cached.write().await = None;
                }
                return Err(e);
            }
        };
        *self.cached.write().await = Some(token.clone());
        Ok(token)
    }

    /// Convenience wrapper returning only the bearer string.
    pub async fn access_token(&self) -> Result<String> {
        Ok(self.acquire().await?.access_token)
    }

    /// Mark `access_token` as rejected so the next [`acquire`](Self::acquire) refreshes.
    ///
    /// A token that has already been replaced is left alone.
    pub async fn invalidate(&self, access_token: &str) {
        let mut cached = self.cached.write().await;
        if let Some(token) = cached.as_mut() {
            if token.access_token == access_token {
                debug!("invalidating rejected access token");
                token.expires_at = None;
            }
        }
    }

    async fn valid_cached(&self) -> Option<AuthToken> {
        let cached = self.cached.read().await;
        cached
            .as_ref()
            .filter(|t| t.is_valid_at(Utc::now()))
            .cloned()
    }

    #[instrument(skip(self))]
    async fn refresh(&self) -> Result<AuthToken> {
        match &self.source {
            TokenSource::AuthorizedUser { store, secret } => {
                let current = self.cached.read().await.clone();
                let token = self.refresh_user_token(store, secret.as_ref(), current).await?;
                if let Err(e) = store.save(&token) {
                    warn!(path = %store.path().display(), error = %e, "failed to persist refreshed token");
                }
                info!("access token refreshed");
                Ok(token)
            }
            TokenSource::ServiceAccount {
                credentials,
                subject,
            } => self.service_account_token(credentials, subject.as_deref()).await,
        }
    }

    async fn refresh_user_token(
        &self,
        store: &TokenStore,
        secret: Option<&ClientSecret>,
        current: Option<AuthToken>,
    ) -> Result<AuthToken> {
        let current = current.ok_or_else(|| {
            MirrorError::Auth(format!(
                "no stored token at {}; complete the consent flow to create one",
                store.path().display()
            ))
        })?;
        let refresh_token = current
            .refresh_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| MirrorError::Auth("stored token has no refresh credential".to_string()))?;
        let client_id = current
            .client_id
            .clone()
            .or_else(|| secret.map(|s| s.client_id.clone()))
            .ok_or_else(|| MirrorError::Auth("no OAuth client id available for refresh".to_string()))?;
        let client_secret = current
            .client_secret
            .clone()
            .or_else(|| secret.map(|s| s.client_secret.clone()))
            .unwrap_or_default();

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
        ];
        let response = self.exchange(&params).await?;

        Ok(AuthToken {
            access_token: response.access_token,
            refresh_token: response.refresh_token.or(Some(refresh_token)),
            expires_at: Some(Utc::now() + Duration::seconds(response.expires_in as i64)),
            client_id: current.client_id,
            client_secret: current.client_secret,
        })
    }

    async fn service_account_token(
        &self,
        credentials: &ServiceAccountCredentials,
        subject: Option<&str>,
    ) -> Result<AuthToken> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: credentials.client_email.clone(),
            scope: SCOPES.join(" "),
            aud: self.token_uri.clone(),
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
            sub: subject.map(str::to_string),
        };

        let header = Header::new(Algorithm::RS256);
        let key = EncodingKey::from_rsa_pem(credentials.private_key.as_bytes())?;
        let jwt = encode(&header, &claims, &key)?;

        let params = [
            ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
            ("assertion", jwt.as_str()),
        ];
        let response = self.exchange(&params).await?;

        Ok(AuthToken {
            access_token: response.access_token,
            refresh_token: None,
            expires_at: Some(Utc::now() + Duration::seconds(response.expires_in as i64)),
            client_id: None,
            client_secret: None,
        })
    }

    async fn exchange(&self, params: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self
            .http
            .post(&self.token_uri)
            .form(params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // The token endpoint answers a revoked or malformed grant with 400/401.
            if status.as_u16() == 400 || status.as_u16() == 401 {
                return Err(MirrorError::Auth(format!(
                    "refresh credential rejected ({}): {}",
                    status, body
                )));
            }
            return Err(MirrorError::from_status(status.as_u16(), None, body));
        }

        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_claims_serialization() {
        let claims = Claims {
            iss: "test@example.iam.gserviceaccount.com".to_string(),
            scope: SCOPES.join(" "),
            aud: TOKEN_URI.to_string(),
            iat: 1234567890,
            exp: 1234571490,
            sub: None,
        };

        let json = serde_json::to_string(&claims).unwrap();
        assert!(json.contains("test@example.iam.gserviceaccount.com"));
        assert!(json.contains("drive.readonly"));
        assert!(!json.contains("sub"));
    }

    #[test]
    fn test_token_validity_margin() {
        let now = Utc::now();
        let token = AuthToken {
            access_token: "abc".into(),
            expires_at: Some(now + Duration::seconds(30)),
            ..Default::default()
        };
        assert!(!token.is_valid_at(now));

        let token = AuthToken {
            expires_at: Some(now + Duration::seconds(600)),
            ..token
        };
        assert!(token.is_valid_at(now));
    }

    #[test]
    fn test_authorized_user_file_shape() {
        let json = r#"{
            "type": "authorized_user",
            "client_id": "cid",
            "client_secret": "csecret",
            "refresh_token": "rtok"
        }"#;
        let token: AuthToken = serde_json::from_str(json).unwrap();
        assert_eq!(token.refresh_token.as_deref(), Some("rtok"));
        assert_eq!(token.client_id.as_deref(), Some("cid"));
        assert!(!token.is_valid_at(Utc::now()));
    }

    #[test]
    fn test_store_round_trip_and_corruption() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path().join("token.json"));
        assert!(store.load().is_none());

        let token = AuthToken {
            access_token: "abc".into(),
            refresh_token: Some("r".into()),
            expires_at: Some(Utc::now()),
            ..Default::default()
        };
        store.save(&token).unwrap();
        assert_eq!(store.load(), Some(token));

        fs::write(store.path(), b"not json").unwrap();
        assert!(store.load().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_store_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path().join("token.json"));
        store.save(&AuthToken::default()).unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_missing_store_is_unauthenticated() {
        let dir = TempDir::new().unwrap();
        let session = AuthSession::authorized_user(TokenStore::new(dir.path().join("none.json")), None);
        assert_eq!(session.state().await, AuthState::Unauthenticated);

        let err = session.acquire().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_valid_token_needs_no_refresh() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path().join("token.json"));
        store
            .save(&AuthToken {
                access_token: "live".into(),
                expires_at: Some(Utc::now() + Duration::hours(1)),
                ..Default::default()
            })
            .unwrap();

        // The token URI is unreachable; any refresh attempt would fail.
        let session = AuthSession::authorized_user(store, None).with_token_uri("http://127.0.0.1:9/token");
        assert_eq!(session.access_token().await.unwrap(), "live");
        assert_eq!(session.state().await, AuthState::Authenticated);
    }
}
