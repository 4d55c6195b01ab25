/*
[INPUT]:  Credential provider or login user, endpoint resolver, session settings, shutdown token
[OUTPUT]: A session set kept logged in with the current credential; terminal outcome
[POS]:    Coordination layer - sole owner of the credential and the session set
[UPDATE]: When startup, refresh or reconnect orchestration changes
*/

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use pricestream_adapter::auth::refresh_delay;
use pricestream_adapter::ws::StreamState;
use pricestream_adapter::{
    AuthError, AuthResult, Credential, CredentialCell, CredentialProvider, DiscoveryError, Endpoint,
    EndpointResolver, LoginIdentity, RequestPolicy, Session, SessionError, SessionExit,
    SessionFrame, SessionHandle, SessionSettings,
};

use crate::config::{ConsumerConfig, DEFAULT_REGION, LoginClosedPolicy};

const EVENT_CAPACITY: usize = 16;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REFRESH_RETRY: Duration = Duration::from_secs(30);

/// Terminal failures of a coordinator run
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("endpoint discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("no session could connect: {0}")]
    Connect(#[source] SessionError),

    #[error("login stream closed by server on {session}")]
    LoginStreamClosed {
        session: String,
        state: Option<StreamState>,
    },

    #[error("all sessions have ended")]
    NoActiveSessions,
}

/// Where login identities come from
#[derive(Debug)]
pub enum Authenticator {
    /// OAuth credentials from the token endpoint
    Token(CredentialProvider),
    /// Plain user-name login, no token endpoint involved
    User(String),
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub hot_standby: bool,
    pub region: String,
    /// Explicit endpoints; discovery is skipped when non-empty
    pub explicit: Vec<Endpoint>,
    pub login_closed_policy: LoginClosedPolicy,
    /// Wait before retrying a failed refresh
    pub refresh_retry_delay: Duration,
    /// Password to switch to before the first login
    pub new_password: Option<String>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            hot_standby: false,
            region: DEFAULT_REGION.to_string(),
            explicit: Vec::new(),
            login_closed_policy: LoginClosedPolicy::default(),
            refresh_retry_delay: DEFAULT_REFRESH_RETRY,
            new_password: None,
        }
    }
}

/// Messages from session tasks to the coordinator
#[derive(Debug)]
enum SessionEvent {
    /// A dropped session wants the current identity before reconnecting
    CredentialNeeded {
        session: String,
        reply: oneshot::Sender<Option<LoginIdentity>>,
    },
    /// A session stopped for good
    Ended { session: String, reason: EndReason },
}

#[derive(Debug)]
enum EndReason {
    LoginClosed(Option<StreamState>),
    Canceled,
}

/// Owns the credential and one or two gateway sessions.
///
/// Sessions run on their own tasks and talk back through an event channel;
/// only the coordinator writes the credential.
#[derive(Debug)]
pub struct Coordinator {
    auth: Authenticator,
    resolver: EndpointResolver,
    settings: Arc<SessionSettings>,
    options: CoordinatorOptions,
    credential: CredentialCell,
    /// Lifetime reported by the last full grant
    full_lifetime: Option<u64>,
    shutdown: CancellationToken,
    observer: Option<mpsc::Sender<SessionFrame>>,
}

impl Coordinator {
    pub fn new(
        auth: Authenticator,
        resolver: EndpointResolver,
        settings: SessionSettings,
        options: CoordinatorOptions,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            auth,
            resolver,
            settings: Arc::new(settings),
            options,
            credential: CredentialCell::new(),
            full_lifetime: None,
            shutdown,
            observer: None,
        }
    }

    /// Build a coordinator from validated configuration. HTTP retries
    /// stop when `shutdown` is canceled.
    pub fn from_config(config: &ConsumerConfig, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let client = config.client_config();
        let policy = RequestPolicy::new(&client, shutdown.clone());

        let auth = match config.grant()? {
            Some(grant) => {
                let auth_url = Url::parse(&config.auth.url)
                    .with_context(|| format!("invalid auth url {}", config.auth.url))?;
                let provider = CredentialProvider::from_config(&client, auth_url, grant, policy.clone())
                    .context("failed to build auth client")?;
                Authenticator::Token(provider)
            }
            None => Authenticator::User(config.login_user()),
        };

        let discovery_url = Url::parse(&config.discovery.url)
            .with_context(|| format!("invalid discovery url {}", config.discovery.url))?;
        let resolver = EndpointResolver::from_config(&client, discovery_url, policy)
            .context("failed to build discovery client")?;

        let options = CoordinatorOptions {
            hot_standby: config.discovery.hot_standby,
            region: config.discovery.region.clone(),
            explicit: config.explicit_endpoints(),
            login_closed_policy: config.login_closed_policy,
            refresh_retry_delay: config.refresh_retry_delay(),
            new_password: config.auth.new_password.clone(),
        };

        Ok(Self::new(auth, resolver, config.session_settings(), options, shutdown))
    }

    /// Receive every decoded frame of every session.
    pub fn with_observer(mut self, observer: mpsc::Sender<SessionFrame>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Shared view of the current credential
    pub fn credential(&self) -> CredentialCell {
        self.credential.clone()
    }

    /// Authenticate, resolve endpoints, start the sessions and keep them
    /// supplied with fresh credentials until shutdown or a fatal error.
    ///
    /// Returns `Ok(())` when the shutdown token is canceled.
    pub async fn run(mut self) -> Result<(), CoordinatorError> {
        let identity = match self.initial_identity().await {
            Ok(identity) => identity,
            Err(err) if err.is_canceled() => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let token = self.credential.snapshot().map(|c| c.access_token.clone());
        let endpoints = match self
            .resolver
            .resolve(
                self.options.hot_standby,
                &self.options.region,
                &self.options.explicit,
                token.as_deref(),
            )
            .await
        {
            Ok(endpoints) => endpoints,
            Err(DiscoveryError::Canceled) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        info!(endpoints = endpoints.len(), primary = %endpoints.primary(), "endpoints resolved");

        let (events_tx, mut events_rx) = mpsc::channel(EVENT_CAPACITY);
        let mut handles = Vec::with_capacity(endpoints.len());
        let mut tasks = Vec::with_capacity(endpoints.len());
        let mut connected_any = false;
        let mut last_error = None;

        for (index, endpoint) in endpoints.into_iter().enumerate() {
            let mut session = Session::new(
                format!("session{}", index + 1),
                endpoint,
                Arc::clone(&self.settings),
                self.shutdown.child_token(),
            );
            if let Some(observer) = &self.observer {
                session = session.with_observer(observer.clone());
            }

            let connected = match session.connect(&identity).await {
                Ok(()) => true,
                Err(SessionError::Canceled) => false,
                Err(err) => {
                    last_error = Some(err);
                    false
                }
            };
            connected_any |= connected;
            handles.push(session.handle());
            tasks.push(tokio::spawn(drive_session(session, connected, events_tx.clone())));
        }
        drop(events_tx);

        if self.shutdown.is_cancelled() {
            drop(events_rx);
            stop_sessions(&handles, tasks).await;
            return Ok(());
        }
        if !connected_any {
            drop(events_rx);
            stop_sessions(&handles, tasks).await;
            return Err(match last_error {
                Some(err) => CoordinatorError::Connect(err),
                None => CoordinatorError::NoActiveSessions,
            });
        }

        let mut next_refresh = self.refresh_schedule();
        let mut active = handles.len();

        let outcome = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutdown requested, stopping sessions");
                    break Ok(());
                }
                _ = sleep_until_due(next_refresh) => {
                    next_refresh = self.refresh(&handles).await;
                }
                event = events_rx.recv() => {
                    let Some(event) = event else {
                        break Err(CoordinatorError::NoActiveSessions);
                    };
                    match event {
                        SessionEvent::CredentialNeeded { session, reply } => {
                            if self.credential_is_stale() {
                                info!(session = %session, "credential stale, refreshing before reconnect");
                                next_refresh = self.refresh(&handles).await;
                            }
                            if reply.send(self.identity()).is_err() {
                                debug!(session = %session, "session stopped before receiving credential");
                            }
                        }
                        SessionEvent::Ended { session, reason } => {
                            active = active.saturating_sub(1);
                            match reason {
                                EndReason::LoginClosed(state) => match self.options.login_closed_policy {
                                    LoginClosedPolicy::Exit => {
                                        error!(session = %session, state = ?state, "login stream closed, exiting");
                                        break Err(CoordinatorError::LoginStreamClosed { session, state });
                                    }
                                    LoginClosedPolicy::Continue => {
                                        warn!(session = %session, state = ?state, remaining = active, "login stream closed, session removed");
                                    }
                                },
                                EndReason::Canceled => debug!(session = %session, "session canceled"),
                            }
                            if active == 0 {
                                break Err(CoordinatorError::NoActiveSessions);
                            }
                        }
                    }
                }
            }
        };

        drop(events_rx);
        stop_sessions(&handles, tasks).await;
        outcome
    }

    async fn initial_identity(&mut self) -> AuthResult<LoginIdentity> {
        let provider = match &mut self.auth {
            Authenticator::User(name) => {
                info!(user = %name, "logging in with user name");
                return Ok(LoginIdentity::user(name.clone()));
            }
            Authenticator::Token(provider) => provider,
        };

        let credential = match self.options.new_password.take() {
            Some(new_password) => provider.change_password(&new_password).await?,
            None => provider.authenticate().await?,
        };
        info!(
            grant = provider.grant().kind(),
            expires_in = ?credential.expires_in,
            "credential issued"
        );

        self.full_lifetime = credential.expires_in;
        Ok(LoginIdentity::Token(self.credential.replace(credential)))
    }

    fn identity(&self) -> Option<LoginIdentity> {
        match &self.auth {
            Authenticator::Token(_) => self.credential.snapshot().map(LoginIdentity::Token),
            Authenticator::User(name) => Some(LoginIdentity::user(name.clone())),
        }
    }

    /// Past its refresh point, including after a refresh that failed
    fn credential_is_stale(&self) -> bool {
        self.credential
            .snapshot()
            .is_some_and(|credential| credential.is_stale())
    }

    /// Next refresh point; a lifetime the clock cannot represent never refreshes.
    fn refresh_schedule(&self) -> Option<Instant> {
        let expires_in = self.credential.snapshot()?.expires_in?;
        Instant::now().checked_add(refresh_delay(expires_in))
    }

    /// Renew the credential and re-login every open session with it.
    /// Returns when the next refresh is due.
    async fn refresh(&mut self, handles: &[SessionHandle]) -> Option<Instant> {
        let Authenticator::Token(provider) = &self.auth else {
            return None;
        };

        let current = self.credential.snapshot();
        let renewed = renew(provider, current.as_deref(), self.full_lifetime).await;
        match renewed {
            Ok(credential) => {
                self.full_lifetime = credential.expires_in;
                let credential = self.credential.replace(credential);
                info!(expires_in = ?credential.expires_in, "credential renewed");

                for handle in handles.iter().filter(|handle| handle.is_open()) {
                    if !handle.relogin(LoginIdentity::Token(Arc::clone(&credential))).await {
                        debug!(session = handle.id(), "session gone, re-login skipped");
                    }
                }
                self.refresh_schedule()
            }
            Err(err) if err.is_canceled() => None,
            Err(err) => {
                warn!(
                    error = %err,
                    retry_secs = self.options.refresh_retry_delay.as_secs(),
                    "credential refresh failed, will retry"
                );
                Instant::now().checked_add(self.options.refresh_retry_delay)
            }
        }
    }
}

/// Refresh grant first, full grant when that fails or when the refreshed
/// lifetime no longer matches the lifetime of the last full grant.
async fn renew(
    provider: &CredentialProvider,
    current: Option<&Credential>,
    full_lifetime: Option<u64>,
) -> AuthResult<Credential> {
    let refreshed = match current {
        Some(current) if provider.supports_refresh() && current.refresh_token.is_some() => {
            match provider.refresh(current).await {
                Ok(credential) => Some(credential),
                Err(err) if err.is_canceled() => return Err(err),
                Err(err) => {
                    warn!(error = %err, "refresh grant failed, requesting a new credential");
                    None
                }
            }
        }
        _ => None,
    };

    match refreshed {
        Some(credential) if credential.expires_in == full_lifetime => Ok(credential),
        Some(credential) => {
            warn!(
                issued = ?full_lifetime,
                refreshed = ?credential.expires_in,
                "refreshed lifetime changed, re-authenticating"
            );
            provider.authenticate().await
        }
        None => provider.authenticate().await,
    }
}

/// Keep one session running: reconnect after drops with the identity
/// supplied by the coordinator, report when it ends for good.
async fn drive_session(mut session: Session, mut connected: bool, events: mpsc::Sender<SessionEvent>) {
    let id = session.id().to_string();

    let reason = loop {
        if !connected {
            let Some(identity) = request_identity(&events, &id).await else {
                session.cancel().await;
                break EndReason::Canceled;
            };
            match session.reconnect(&identity).await {
                Ok(()) => connected = true,
                Err(SessionError::Canceled) => break EndReason::Canceled,
                Err(err) => {
                    debug!(session = %id, error = %err, "reconnect attempt failed");
                    continue;
                }
            }
        }

        match session.run().await {
            SessionExit::Dropped(_) => connected = false,
            SessionExit::LoginClosed(state) => break EndReason::LoginClosed(state),
            SessionExit::Canceled => break EndReason::Canceled,
        }
    };

    let _ = events.send(SessionEvent::Ended { session: id, reason }).await;
}

async fn request_identity(events: &mpsc::Sender<SessionEvent>, session: &str) -> Option<LoginIdentity> {
    let (reply, response) = oneshot::channel();
    events
        .send(SessionEvent::CredentialNeeded {
            session: session.to_string(),
            reply,
        })
        .await
        .ok()?;
    response.await.ok().flatten()
}

async fn sleep_until_due(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}

/// Cancel every session and wait for its task, aborting stragglers.
async fn stop_sessions(handles: &[SessionHandle], tasks: Vec<JoinHandle<()>>) {
    for handle in handles {
        handle.cancel();
    }

    let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
    let mut tasks = tasks.into_iter();
    while let Some(mut task) = tasks.next() {
        match tokio::time::timeout_at(deadline, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "session task failed"),
            Err(_) => {
                warn!(timeout = ?SHUTDOWN_TIMEOUT, "session tasks did not stop in time, aborting");
                task.abort();
                tasks.for_each(|task| task.abort());
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricestream_adapter::{ClientConfig, Grant};

    fn unused_url() -> Url {
        Url::parse("http://127.0.0.1:9/").unwrap()
    }

    fn resolver() -> EndpointResolver {
        let config = ClientConfig::default();
        EndpointResolver::from_config(&config, unused_url(), RequestPolicy::new(&config, CancellationToken::new()))
            .unwrap()
    }

    #[test]
    fn test_user_identity_does_not_need_credential() {
        let coordinator = Coordinator::new(
            Authenticator::User("alice".into()),
            resolver(),
            SessionSettings::new("256", pricestream_adapter::ItemRequest::single("/TRI.N")),
            CoordinatorOptions::default(),
            CancellationToken::new(),
        );
        assert!(matches!(coordinator.identity(), Some(LoginIdentity::User(name)) if name == "alice"));
        assert!(coordinator.refresh_schedule().is_none());
    }

    #[tokio::test]
    async fn test_token_identity_follows_credential_cell() {
        let config = ClientConfig::default();
        let provider = CredentialProvider::from_config(
            &config,
            unused_url(),
            Grant::password("u", "p", "c"),
            RequestPolicy::new(&config, CancellationToken::new()),
        )
        .unwrap();
        let coordinator = Coordinator::new(
            Authenticator::Token(provider),
            resolver(),
            SessionSettings::new("256", pricestream_adapter::ItemRequest::single("/TRI.N")),
            CoordinatorOptions::default(),
            CancellationToken::new(),
        );
        assert!(coordinator.identity().is_none());

        coordinator
            .credential()
            .replace(Credential::new("at", None, Some(600)));
        match coordinator.identity() {
            Some(LoginIdentity::Token(credential)) => assert_eq!(credential.access_token, "at"),
            other => panic!("unexpected identity {other:?}"),
        }
        assert!(coordinator.refresh_schedule().is_some());
        assert!(!coordinator.credential_is_stale());

        coordinator
            .credential()
            .replace(Credential::new("at-long", None, Some(u64::MAX)));
        let due = coordinator.refresh_schedule().unwrap();
        assert!(due <= Instant::now() + Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_sleep_without_deadline_never_fires() {
        let fired = tokio::time::timeout(Duration::from_millis(20), sleep_until_due(None)).await;
        assert!(fired.is_err());
    }
}
