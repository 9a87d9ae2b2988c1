//! Session state, persistence, and token lifecycle
//!
//! A [`Session`] holds the server base URL and the current bearer token.
//! The [`TokenManager`] owns it: login, refresh and restricted issuance
//! all live here, and refresh is the single in-place mutation — the one
//! the dispatcher is allowed to trigger automatically. Persistence goes
//! through the injected [`SessionStore`] so the core has no implicit
//! process-wide state.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

use crate::operation::RegistryError;
use crate::params::ParameterBag;
use crate::registry::OperationRegistry;
use crate::response::{ClientResponse, ResponseError};
use crate::transport::{build_request, Transport, TransportError};

/// Errors raised by session persistence
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be read or written
    #[error("session store I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// The stored data did not parse as a session
    #[error("session store contains malformed data: {0}")]
    Malformed(#[from] serde_yaml::Error),

    /// The store is unusable (no home directory, poisoned lock, ...)
    #[error("session store is unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by token acquisition and refresh
#[derive(Error, Debug)]
pub enum AuthError {
    /// No session is active
    #[error("no active session")]
    NoSession,

    /// The stored session's token already expired
    #[error("the session token expired")]
    SessionExpired,

    /// The session carries no refresh credential
    #[error("session has no refresh credential")]
    NoRefreshToken,

    /// The server rejected the credential exchange
    #[error("credential exchange rejected with status {status}")]
    Rejected {
        /// HTTP status the server answered with
        status: u16,
    },

    /// The exchange could not be completed at the transport level
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A security operation was missing from the loaded set
    #[error(transparent)]
    Operation(#[from] RegistryError),

    /// The token response did not have the expected shape
    #[error("malformed token response: {0}")]
    Payload(#[from] ResponseError),

    /// The refreshed session could not be persisted
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The server base URL and current bearer token, plus optional refresh
/// credential and expiry. Serializable for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Base URL of the remote API
    pub api_url: String,
    /// Current bearer token
    pub access_token: String,
    /// Refresh credential, if the server issued one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Token expiry as Unix seconds; `None` means no known expiry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl Session {
    /// Whether the token's expiry has passed
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => unix_now() >= expires_at,
            None => false,
        }
    }

    /// Whether the token expires within `margin` from now
    pub fn is_almost_expired(&self, margin: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => unix_now() + margin.as_secs() >= expires_at,
            None => false,
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Persistence seam for sessions. A save must be visible to a
/// subsequent load in the same process; nothing more is assumed about
/// the medium.
pub trait SessionStore: Send + Sync + std::fmt::Debug {
    /// Load the stored session, if one exists
    fn load(&self) -> Result<Option<Session>, StoreError>;
    /// Persist the session
    fn save(&self, session: &Session) -> Result<(), StoreError>;
    /// Remove any stored session
    fn clear(&self) -> Result<(), StoreError>;
}

/// Stores the session as a YAML context file
#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    /// Store at an explicit path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the conventional per-user location,
    /// `<data dir>/opwire/context.yaml`
    pub fn default_path() -> Result<Self, StoreError> {
        let mut path = dirs::data_dir().ok_or_else(|| {
            StoreError::Unavailable("could not determine user data directory".to_string())
        })?;
        path.push("opwire");
        path.push("context.yaml");
        Ok(Self { path })
    }

    /// Path the context file lives at
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Option<Session>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        Ok(Some(serde_yaml::from_str(&content)?))
    }

    fn save(&self, session: &Session) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(session)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// In-memory store for tests and embedding
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    session: Mutex<Option<Session>>,
}

impl MemorySessionStore {
    /// An empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Option<Session>, StoreError> {
        self.session
            .lock()
            .map(|s| s.clone())
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
    }

    fn save(&self, session: &Session) -> Result<(), StoreError> {
        *self
            .session
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))? =
            Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self
            .session
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))? = None;
        Ok(())
    }
}

/// What the security operations answer with
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenGrant {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_at: Option<u64>,
}

#[derive(Debug, Default)]
struct TokenState {
    session: Option<Session>,
    generation: u64,
}

/// Owns the single [`Session`] and every token-lifecycle operation.
///
/// Login and restricted issuance are explicit caller actions. Refresh
/// mutates the session in place and is the only mutation the dispatcher
/// triggers automatically; concurrent callers racing on a stale token
/// are coalesced through [`TokenManager::refresh_coalesced`].
#[derive(Debug)]
pub struct TokenManager {
    transport: Arc<dyn Transport>,
    registry: Arc<OperationRegistry>,
    default_api_url: String,
    store: Option<Arc<dyn SessionStore>>,
    state: RwLock<TokenState>,
    refresh_gate: tokio::sync::Mutex<()>,
}

impl TokenManager {
    /// Create a manager, optionally seeded with a loaded session
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<OperationRegistry>,
        default_api_url: impl Into<String>,
        store: Option<Arc<dyn SessionStore>>,
        initial: Option<Session>,
    ) -> Self {
        Self {
            transport,
            registry,
            default_api_url: default_api_url.into(),
            store,
            state: RwLock::new(TokenState {
                session: initial,
                generation: 0,
            }),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Snapshot of the current session
    pub fn session(&self) -> Option<Session> {
        self.state.read().ok().and_then(|s| s.session.clone())
    }

    /// Current bearer token together with the refresh generation it was
    /// observed under; the generation lets a 401-handling caller tell a
    /// still-stale token from one refreshed behind its back
    pub(crate) fn bearer(&self) -> (Option<String>, u64) {
        match self.state.read() {
            Ok(state) => (
                state.session.as_ref().map(|s| s.access_token.clone()),
                state.generation,
            ),
            Err(_) => (None, 0),
        }
    }

    /// Whether an automatic refresh is possible
    pub fn can_refresh(&self) -> bool {
        self.state
            .read()
            .map(|s| {
                s.session
                    .as_ref()
                    .is_some_and(|session| session.refresh_token.is_some())
            })
            .unwrap_or(false)
    }

    /// Base URL calls should go to: the session's, or the configured
    /// default before any login happened
    pub fn api_url(&self) -> String {
        self.session()
            .map(|s| s.api_url)
            .unwrap_or_else(|| self.default_api_url.clone())
    }

    /// Install a session, bumping the refresh generation and persisting
    /// through the store when one is configured
    pub fn install(&self, session: Session) -> Result<(), StoreError> {
        if let Some(store) = &self.store {
            store.save(&session)?;
        }
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::Unavailable("session lock poisoned".to_string()))?;
        state.session = Some(session);
        state.generation += 1;
        Ok(())
    }

    /// Drop the session and clear the store — the logout path
    pub fn clear(&self) -> Result<(), StoreError> {
        if let Some(store) = &self.store {
            store.clear()?;
        }
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::Unavailable("session lock poisoned".to_string()))?;
        state.session = None;
        state.generation += 1;
        Ok(())
    }

    /// Exchange credentials for a fresh session.
    ///
    /// Surrounding whitespace on the credentials is stripped before the
    /// exchange; pasted credentials routinely carry it.
    pub async fn login(&self, username: &str, password: &str) -> Result<Session, AuthError> {
        let api_url = self.api_url();
        let bag = ParameterBag::new().body(json!({
            "username": username.trim(),
            "password": password.trim(),
        }));

        let response = self.invoke("security", "login", &bag, None).await?;
        if !response.is_success() {
            return Err(AuthError::Rejected {
                status: response.status(),
            });
        }

        let grant: TokenGrant = response.decode()?;
        let session = Session {
            api_url,
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_at: grant.expires_at,
        };
        self.install(session.clone())?;
        debug!(api_url = %session.api_url, "login succeeded");
        Ok(session)
    }

    /// Replace the current token using the refresh credential. The sole
    /// in-place session mutation.
    pub async fn refresh(&self) -> Result<Session, AuthError> {
        let current = self.session().ok_or(AuthError::NoSession)?;
        let refresh_token = current
            .refresh_token
            .clone()
            .ok_or(AuthError::NoRefreshToken)?;

        let bag = ParameterBag::new().body(json!({ "refreshToken": refresh_token }));
        let response = self.invoke("security", "refresh", &bag, None).await?;
        if !response.is_success() {
            return Err(AuthError::Rejected {
                status: response.status(),
            });
        }

        let grant: TokenGrant = response.decode()?;
        let session = Session {
            api_url: current.api_url,
            access_token: grant.access_token,
            // A grant without a new refresh credential keeps the old one
            refresh_token: grant.refresh_token.or(current.refresh_token),
            expires_at: grant.expires_at,
        };
        self.install(session.clone())?;
        debug!("session token refreshed");
        Ok(session)
    }

    /// Refresh once on behalf of a caller that observed a 401 under
    /// `seen_generation`. If another caller already refreshed since,
    /// the fresh token is returned without touching the network.
    pub(crate) async fn refresh_coalesced(
        &self,
        seen_generation: u64,
    ) -> Result<String, AuthError> {
        let _gate = self.refresh_gate.lock().await;

        {
            let state = self
                .state
                .read()
                .map_err(|_| StoreError::Unavailable("session lock poisoned".to_string()))?;
            if state.generation != seen_generation {
                if let Some(session) = &state.session {
                    debug!("refresh coalesced with a concurrent caller");
                    return Ok(session.access_token.clone());
                }
            }
        }

        let session = self.refresh().await?;
        Ok(session.access_token)
    }

    /// Ask the server for a reduced-scope token. Does not replace the
    /// current session.
    pub async fn issue_restricted(
        &self,
        scopes: &[String],
        expiration: Option<u64>,
    ) -> Result<String, AuthError> {
        let current = self.session().ok_or(AuthError::NoSession)?;

        let mut body = BTreeMap::<&str, JsonValue>::new();
        body.insert("scopes", json!(scopes));
        if let Some(expiration) = expiration {
            body.insert("expiration", json!(expiration));
        }

        let bag = ParameterBag::new().body(json!(body));
        let response = self
            .invoke("security", "issue_restricted", &bag, Some(current.access_token))
            .await?;
        if !response.is_success() {
            return Err(AuthError::Rejected {
                status: response.status(),
            });
        }

        let grant: TokenGrant = response.decode()?;
        Ok(grant.access_token)
    }

    async fn invoke(
        &self,
        resource: &str,
        operation: &str,
        bag: &ParameterBag,
        bearer: Option<String>,
    ) -> Result<ClientResponse, AuthError> {
        let descriptor = self.registry.resolve(resource, operation)?;
        let request = build_request(&self.api_url(), &descriptor, bag)
            .await?
            .with_bearer(bearer);
        let raw = self.transport.execute(request).await?;
        Ok(ClientResponse::from_raw(raw))
    }
}
