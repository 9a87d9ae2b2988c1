//! The request dispatcher
//!
//! [`Client`] is the orchestration core: it resolves a target (alias,
//! literal pair, or generated ref) to a descriptor, validates the
//! parameter bag, assembles the transport request, attaches the current
//! bearer token, and wraps whatever the server answered. A 401 with a
//! refresh credential on hand triggers exactly one coalesced refresh
//! and one retry — never more.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::alias::{AliasError, AliasRegistry};
use crate::operation::{OperationDescriptor, OperationRef, RegistryError};
use crate::params::ParameterBag;
use crate::registry::OperationRegistry;
use crate::response::ClientResponse;
use crate::session::{AuthError, Session, SessionStore, TokenManager};
use crate::transport::{build_request, HttpTransport, Transport, TransportError};
use crate::validation::{self, RequestValidationError};

const DEFAULT_API_URL: &str = "http://localhost:4000/v1";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_TOKEN_MARGIN_SECS: u64 = 300;

/// Errors raised by dispatch
#[derive(Error, Debug)]
pub enum ClientError {
    /// A name was neither an alias nor a parseable literal pair
    #[error("'{0}' is neither a known alias nor a resource/operation pair")]
    BadTarget(String),

    /// Alias table problems (loading, explicit lookup)
    #[error(transparent)]
    Alias(#[from] AliasError),

    /// Operation resolution problems
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The bag failed validation; no network call was made
    #[error(transparent)]
    Validation(#[from] RequestValidationError),

    /// The call could not be completed at the transport level
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Token lifecycle failure
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The server still refused authorization after the one-shot
    /// refresh-and-retry
    #[error("authorization failed after token refresh (status {status})")]
    Authorization {
        /// Status of the post-refresh attempt
        status: u16,
    },
}

/// Client configuration
///
/// Values come from, in priority order: builder methods, the
/// `OPWIRE_API_URL` environment variable, then defaults.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the remote API
    pub api_url: String,
    /// Transport request timeout
    pub timeout: Duration,
    /// How close to expiry a token is treated as "almost expired" by
    /// the session factory
    pub token_margin: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let api_url =
            env::var("OPWIRE_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        Self {
            api_url,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            token_margin: Duration::from_secs(DEFAULT_TOKEN_MARGIN_SECS),
        }
    }
}

impl ClientConfig {
    /// Configuration from environment or defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the API base URL
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    /// Set the transport timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the almost-expired margin
    pub fn with_token_margin(mut self, margin: Duration) -> Self {
        self.token_margin = margin;
        self
    }
}

/// Assembles a [`Client`] from its parts, with bundled defaults for
/// everything not supplied
#[derive(Debug, Default)]
pub struct ClientBuilder {
    config: Option<ClientConfig>,
    transport: Option<Arc<dyn Transport>>,
    aliases: Option<AliasRegistry>,
    store: Option<Arc<dyn SessionStore>>,
    session: Option<Session>,
}

impl ClientBuilder {
    /// Use this configuration instead of environment/defaults
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Substitute a transport (tests use in-process fakes here)
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use a custom alias table instead of the bundled one
    pub fn aliases(mut self, aliases: AliasRegistry) -> Self {
        self.aliases = Some(aliases);
        self
    }

    /// Persist sessions through this store
    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Seed the client with an existing session
    pub fn session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    /// Build the client
    pub fn build(self) -> Result<Client, ClientError> {
        let config = self.config.unwrap_or_default();
        let registry = Arc::new(OperationRegistry::bundled()?);

        let aliases = match self.aliases {
            Some(aliases) => aliases,
            None => AliasRegistry::bundled()?,
        };
        aliases.verify_targets(&registry)?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(config.timeout)?),
        };

        let tokens = Arc::new(TokenManager::new(
            transport.clone(),
            registry.clone(),
            config.api_url.clone(),
            self.store,
            self.session,
        ));

        Ok(Client {
            config,
            registry,
            aliases: Arc::new(aliases),
            transport,
            tokens,
        })
    }

    /// Build a client bootstrapped from the store, falling back to a
    /// credential login when the stored session is missing or expired.
    ///
    /// An almost-expired stored token is refreshed and re-persisted
    /// before the client is handed out.
    pub async fn connect(
        mut self,
        username: &str,
        password: &str,
    ) -> Result<Client, ClientError> {
        let stored = match &self.store {
            Some(store) => store.load().map_err(AuthError::from)?,
            None => None,
        };

        let margin = self
            .config
            .clone()
            .unwrap_or_default()
            .token_margin;

        match stored {
            Some(session) if !session.is_expired() => {
                let almost_expired = session.is_almost_expired(margin);
                self.session = Some(session);
                let client = self.build()?;
                if almost_expired && client.tokens.can_refresh() {
                    client.tokens.refresh().await?;
                }
                Ok(client)
            }
            _ => {
                let client = self.build()?;
                client.tokens.login(username, password).await?;
                Ok(client)
            }
        }
    }

    /// Build a client from a previously stored session only.
    ///
    /// Fails with [`AuthError::NoSession`] when nothing is stored and
    /// [`AuthError::SessionExpired`] when the stored token lapsed; an
    /// almost-expired token is refreshed on the way in.
    pub async fn from_store(mut self) -> Result<Client, ClientError> {
        let store = self
            .store
            .clone()
            .ok_or(AuthError::NoSession)?;
        let session = store
            .load()
            .map_err(AuthError::from)?
            .ok_or(AuthError::NoSession)?;
        if session.is_expired() {
            return Err(AuthError::SessionExpired.into());
        }

        let margin = self
            .config
            .clone()
            .unwrap_or_default()
            .token_margin;
        let almost_expired = session.is_almost_expired(margin);

        self.session = Some(session);
        let client = self.build()?;
        if almost_expired && client.tokens.can_refresh() {
            client.tokens.refresh().await?;
        }
        Ok(client)
    }
}

/// The request dispatcher
#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    registry: Arc<OperationRegistry>,
    aliases: Arc<AliasRegistry>,
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenManager>,
}

impl Client {
    /// Start assembling a client
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// A client with bundled definitions and environment configuration
    pub fn new() -> Result<Self, ClientError> {
        Self::builder().build()
    }

    /// The active configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The loaded operation registry
    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// The loaded alias table
    pub fn aliases(&self) -> &AliasRegistry {
        &self.aliases
    }

    /// The token manager owning the session
    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    /// Snapshot of the current session
    pub fn session(&self) -> Option<Session> {
        self.tokens.session()
    }

    /// Resolve a friendly name to a descriptor: the alias table is
    /// consulted first, and a miss falls back to reading the name as a
    /// literal `resource/operation` pair. Aliases are an overlay, never
    /// a requirement.
    pub fn resolve_name(&self, name: &str) -> Result<Arc<OperationDescriptor>, ClientError> {
        if let Some(key) = self.aliases.get(name) {
            return Ok(self.registry.resolve(&key.resource, &key.operation)?);
        }
        match name.split_once('/') {
            Some((resource, operation)) if !resource.is_empty() && !operation.is_empty() => {
                Ok(self.registry.resolve(resource, operation)?)
            }
            _ => Err(ClientError::BadTarget(name.to_string())),
        }
    }

    /// Dispatch by friendly name (alias or literal pair)
    pub async fn send(
        &self,
        name: &str,
        bag: &ParameterBag,
    ) -> Result<ClientResponse, ClientError> {
        let descriptor = self.resolve_name(name)?;
        self.dispatch(&descriptor, bag).await
    }

    /// Dispatch by canonical pair
    pub async fn send_pair(
        &self,
        resource: &str,
        operation: &str,
        bag: &ParameterBag,
    ) -> Result<ClientResponse, ClientError> {
        let descriptor = self.registry.resolve(resource, operation)?;
        self.dispatch(&descriptor, bag).await
    }

    /// Dispatch by generated ref
    pub async fn send_ref(
        &self,
        op_ref: OperationRef,
        bag: &ParameterBag,
    ) -> Result<ClientResponse, ClientError> {
        let descriptor = self.registry.resolve_ref(op_ref)?;
        self.dispatch(&descriptor, bag).await
    }

    /// Exchange credentials for a session (explicit caller action)
    pub async fn login(&self, username: &str, password: &str) -> Result<Session, ClientError> {
        Ok(self.tokens.login(username, password).await?)
    }

    /// Refresh the session token (explicit caller action; the
    /// dispatcher also triggers this automatically on a 401)
    pub async fn refresh(&self) -> Result<Session, ClientError> {
        Ok(self.tokens.refresh().await?)
    }

    /// Obtain a reduced-scope token without replacing the session
    pub async fn issue_restricted(
        &self,
        scopes: &[String],
        expiration: Option<u64>,
    ) -> Result<String, ClientError> {
        Ok(self.tokens.issue_restricted(scopes, expiration).await?)
    }

    /// Drop the session and clear the store
    pub fn logout(&self) -> Result<(), ClientError> {
        self.tokens.clear().map_err(AuthError::from)?;
        Ok(())
    }

    /// The dispatch pipeline: validate, build, attach token, execute,
    /// and — once — refresh-and-retry on a 401.
    async fn dispatch(
        &self,
        descriptor: &OperationDescriptor,
        bag: &ParameterBag,
    ) -> Result<ClientResponse, ClientError> {
        validation::validate(descriptor, bag)?;

        let request = build_request(&self.tokens.api_url(), descriptor, bag).await?;
        let (token, generation) = self.tokens.bearer();

        debug!(operation = %descriptor.key(), method = %descriptor.method(), "dispatching");
        let raw = self
            .transport
            .execute(request.clone().with_bearer(token))
            .await?;

        if raw.status == 401 && self.tokens.can_refresh() {
            debug!(operation = %descriptor.key(), "authorization failure, refreshing once");
            let fresh = self.tokens.refresh_coalesced(generation).await?;
            let raw = self
                .transport
                .execute(request.with_bearer(Some(fresh)))
                .await?;
            if raw.status == 401 {
                return Err(ClientError::Authorization { status: raw.status });
            }
            return Ok(ClientResponse::from_raw(raw));
        }

        Ok(ClientResponse::from_raw(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParameterBag;
    use crate::session::MemorySessionStore;
    use crate::test_support::{ok_json, MockTransport};
    use crate::transport::RawResponse;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn live_session() -> Session {
        Session {
            api_url: "https://api.example.org/v1".to_string(),
            access_token: "stale".to_string(),
            refresh_token: Some("refresh-1".to_string()),
            expires_at: None,
        }
    }

    fn client_with(transport: Arc<MockTransport>, session: Option<Session>) -> Client {
        let mut builder = Client::builder()
            .config(ClientConfig::new().with_api_url("https://api.example.org/v1"))
            .transport(transport);
        if let Some(session) = session {
            builder = builder.session(session);
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn alias_dispatch_hits_the_canonical_operation() {
        let transport = Arc::new(MockTransport::scripted(vec![Ok(ok_json(
            200,
            json!({ "ok": true }),
        ))]));
        let client = client_with(transport.clone(), None);

        let bag = ParameterBag::new()
            .path("id", "abc")
            .body(json!({ "value": true }));
        let response = client.send("set-organizational", &bag).await.unwrap();
        assert!(response.is_success());

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].url,
            "https://api.example.org/v1/groups/abc/organizational"
        );
        assert_eq!(calls[0].body.as_ref().unwrap(), &json!({ "value": true }));
    }

    #[test]
    fn alias_and_canonical_target_share_one_descriptor() {
        let transport = Arc::new(MockTransport::scripted(vec![]));
        let client = client_with(transport, None);

        let by_alias = client.resolve_name("set-organizational").unwrap();
        let by_pair = client
            .registry()
            .resolve("groups", "set_organizational")
            .unwrap();
        assert!(Arc::ptr_eq(&by_alias, &by_pair));
    }

    #[test]
    fn every_bundled_alias_shares_its_target_descriptor() {
        let transport = Arc::new(MockTransport::scripted(vec![]));
        let client = client_with(transport, None);

        for (alias, key) in client.aliases().iter() {
            let by_alias = client.resolve_name(alias).unwrap();
            let by_pair = client
                .registry()
                .resolve(&key.resource, &key.operation)
                .unwrap();
            assert!(Arc::ptr_eq(&by_alias, &by_pair), "alias '{alias}' diverged");
        }
    }

    #[test]
    fn literal_pair_falls_through_the_alias_table() {
        let transport = Arc::new(MockTransport::scripted(vec![]));
        let client = client_with(transport, None);

        let descriptor = client.resolve_name("groups/set_organizational").unwrap();
        assert_eq!(descriptor.key().to_string(), "groups/set_organizational");
    }

    #[test]
    fn unparseable_target_is_rejected() {
        let transport = Arc::new(MockTransport::scripted(vec![]));
        let client = client_with(transport, None);

        assert!(matches!(
            client.resolve_name("no-such-alias"),
            Err(ClientError::BadTarget(name)) if name == "no-such-alias"
        ));
    }

    #[tokio::test]
    async fn validation_failure_makes_no_network_call() {
        let transport = Arc::new(MockTransport::scripted(vec![]));
        let client = client_with(transport.clone(), None);

        let bag = ParameterBag::new().path("id", "abc").body(json!({}));
        let err = client.send("set-organizational", &bag).await.unwrap_err();
        match err {
            ClientError::Validation(e) => {
                assert_eq!(e.violations.len(), 1);
                assert_eq!(e.violations[0].field, "body/value");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn non_2xx_is_returned_as_a_response() {
        let transport = Arc::new(MockTransport::scripted(vec![Ok(ok_json(
            404,
            json!({ "error": "no such group" }),
        ))]));
        let client = client_with(transport, None);

        let bag = ParameterBag::new().path("id", "missing");
        let response = client.send_pair("groups", "get", &bag).await.unwrap();
        assert_eq!(response.status(), 404);
        assert_eq!(
            response.parsed().value().unwrap()["error"],
            json!("no such group")
        );
    }

    #[tokio::test]
    async fn a_401_triggers_one_refresh_and_retry() {
        let transport = Arc::new(MockTransport::scripted(vec![
            // first attempt with the stale token
            Ok(ok_json(401, json!({ "error": "token expired" }))),
            // the refresh exchange
            Ok(ok_json(200, json!({ "accessToken": "fresh" }))),
            // the retried call
            Ok(ok_json(200, json!({ "ok": true }))),
        ]));
        let client = client_with(transport.clone(), Some(live_session()));

        let bag = ParameterBag::new().path("id", "abc");
        let response = client.send_pair("groups", "get", &bag).await.unwrap();
        assert!(response.is_success());

        let calls = transport.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].bearer.as_deref(), Some("stale"));
        assert!(calls[1].url.ends_with("/login/refresh"));
        assert_eq!(calls[2].bearer.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn a_second_401_is_surfaced_not_retried() {
        let transport = Arc::new(MockTransport::scripted(vec![
            Ok(ok_json(401, json!({}))),
            Ok(ok_json(200, json!({ "accessToken": "fresh" }))),
            Ok(ok_json(401, json!({}))),
        ]));
        let client = client_with(transport.clone(), Some(live_session()));

        let bag = ParameterBag::new().path("id", "abc");
        let err = client.send_pair("groups", "get", &bag).await.unwrap_err();
        assert!(matches!(err, ClientError::Authorization { status: 401 }));
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn a_401_without_refresh_credential_is_returned_as_data() {
        let transport = Arc::new(MockTransport::scripted(vec![Ok(ok_json(
            401,
            json!({ "error": "unauthorized" }),
        ))]));
        let mut session = live_session();
        session.refresh_token = None;
        let client = client_with(transport.clone(), Some(session));

        let bag = ParameterBag::new().path("id", "abc");
        let response = client.send_pair("groups", "get", &bag).await.unwrap();
        assert_eq!(response.status(), 401);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_401s_coalesce_into_one_refresh() {
        let refresh_count = Arc::new(AtomicUsize::new(0));
        let valid_token = Arc::new(Mutex::new("rotated-away".to_string()));

        let transport = {
            let refresh_count = refresh_count.clone();
            let valid_token = valid_token.clone();
            Arc::new(MockTransport::with_handler(move |request| {
                if request.url.ends_with("/login/refresh") {
                    refresh_count.fetch_add(1, Ordering::SeqCst);
                    let fresh = "fresh".to_string();
                    *valid_token.lock().unwrap() = fresh.clone();
                    return Ok(ok_json(200, json!({ "accessToken": fresh })));
                }
                let valid = valid_token.lock().unwrap().clone();
                if request.bearer.as_deref() == Some(valid.as_str()) {
                    Ok(ok_json(200, json!({ "ok": true })))
                } else {
                    Ok(RawResponse {
                        status: 401,
                        headers: HashMap::new(),
                        body: b"{}".to_vec(),
                    })
                }
            }))
        };

        let client = Arc::new(client_with(transport, Some(live_session())));

        let a = {
            let client = client.clone();
            tokio::spawn(async move {
                let bag = ParameterBag::new().path("id", "a");
                client.send_pair("groups", "get", &bag).await
            })
        };
        let b = {
            let client = client.clone();
            tokio::spawn(async move {
                let bag = ParameterBag::new().path("id", "b");
                client.send_pair("groups", "get", &bag).await
            })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(a.unwrap().is_success());
        assert!(b.unwrap().is_success());
        assert_eq!(refresh_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ref_dispatch_uses_the_same_pipeline() {
        let transport = Arc::new(MockTransport::scripted(vec![Ok(ok_json(
            200,
            json!({ "ok": true }),
        ))]));
        let client = client_with(transport.clone(), None);

        let bag = ParameterBag::new()
            .path("id", "abc")
            .body(json!({ "value": false }));
        let response = client
            .send_ref(crate::ops::groups::SET_ORGANIZATIONAL, &bag)
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(
            transport.calls()[0].url,
            "https://api.example.org/v1/groups/abc/organizational"
        );
    }

    #[tokio::test]
    async fn connect_logs_in_when_the_store_is_empty() {
        let transport = Arc::new(MockTransport::scripted(vec![Ok(ok_json(
            200,
            json!({ "accessToken": "tok-new", "refreshToken": "r-new" }),
        ))]));
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());

        let client = Client::builder()
            .config(ClientConfig::new().with_api_url("https://api.example.org/v1"))
            .transport(transport.clone())
            .store(store.clone())
            .connect("user", "pass")
            .await
            .unwrap();

        assert_eq!(client.session().unwrap().access_token, "tok-new");
        assert_eq!(store.load().unwrap().unwrap().access_token, "tok-new");
        assert!(transport.calls()[0].url.ends_with("/login"));
    }

    #[tokio::test]
    async fn connect_reuses_a_live_stored_session() {
        let transport = Arc::new(MockTransport::scripted(vec![]));
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        store.save(&live_session()).unwrap();

        let client = Client::builder()
            .config(ClientConfig::new().with_api_url("https://api.example.org/v1"))
            .transport(transport.clone())
            .store(store)
            .connect("user", "pass")
            .await
            .unwrap();

        assert_eq!(client.session().unwrap().access_token, "stale");
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn from_store_refreshes_an_almost_expired_session() {
        let transport = Arc::new(MockTransport::scripted(vec![Ok(ok_json(
            200,
            json!({ "accessToken": "fresh", "expiresAt": 9999999999u64 }),
        ))]));
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());

        let mut session = live_session();
        // expires within the default 300s margin
        session.expires_at = Some(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_secs()
                + 60,
        );
        store.save(&session).unwrap();

        let client = Client::builder()
            .config(ClientConfig::new().with_api_url("https://api.example.org/v1"))
            .transport(transport.clone())
            .store(store.clone())
            .from_store()
            .await
            .unwrap();

        assert_eq!(client.session().unwrap().access_token, "fresh");
        assert_eq!(store.load().unwrap().unwrap().access_token, "fresh");
    }

    #[tokio::test]
    async fn from_store_rejects_missing_and_expired_sessions() {
        let transport = Arc::new(MockTransport::scripted(vec![]));
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());

        let err = Client::builder()
            .transport(transport.clone())
            .store(store.clone())
            .from_store()
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Auth(AuthError::NoSession)));

        let mut session = live_session();
        session.expires_at = Some(1);
        store.save(&session).unwrap();

        let err = Client::builder()
            .transport(transport)
            .store(store)
            .from_store()
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Auth(AuthError::SessionExpired)));
    }

    #[tokio::test]
    async fn logout_clears_session_and_store() {
        let transport = Arc::new(MockTransport::scripted(vec![]));
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        store.save(&live_session()).unwrap();

        let client = Client::builder()
            .config(ClientConfig::new().with_api_url("https://api.example.org/v1"))
            .transport(transport)
            .store(store.clone())
            .session(live_session())
            .build()
            .unwrap();

        client.logout().unwrap();
        assert!(client.session().is_none());
        assert!(store.load().unwrap().is_none());
    }
}
