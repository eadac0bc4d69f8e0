use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::domain::{EmailAddress, LanguageCode, UserId};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::AuthExchangeError;

/// Authenticated application session. Immutable for the lifetime of the
/// connection opened for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub email: EmailAddress,
    pub preferred_language: LanguageCode,
    pub auth_token: Option<String>,
}

/// Identity as reported by the external identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackingIdentity {
    #[serde(rename = "id")]
    pub uid: String,
    pub email: String,
}

#[async_trait]
pub trait IdentityExchange: Send + Sync {
    async fn exchange(&self, identity: &BackingIdentity) -> Result<Session, AuthExchangeError>;
}

pub struct MissingIdentityExchange;

#[async_trait]
impl IdentityExchange for MissingIdentityExchange {
    async fn exchange(&self, _identity: &BackingIdentity) -> Result<Session, AuthExchangeError> {
        Err(AuthExchangeError::Rejected(
            "identity exchange is unavailable".to_string(),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    user: Option<UserRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserRecord {
    #[serde(alias = "_id")]
    id: String,
    email: String,
    preferred_language: String,
    #[serde(default)]
    token: Option<String>,
}

/// Exchanges a provider identity at `POST {auth_url}/lstm/auth/login`.
pub struct HttpIdentityExchange {
    http: Client,
    auth_url: String,
}

impl HttpIdentityExchange {
    pub fn new(auth_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            auth_url: auth_url.into(),
        }
    }
}

#[async_trait]
impl IdentityExchange for HttpIdentityExchange {
    async fn exchange(&self, identity: &BackingIdentity) -> Result<Session, AuthExchangeError> {
        let body: LoginResponse = self
            .http
            .post(format!(
                "{}/lstm/auth/login",
                self.auth_url.trim_end_matches('/')
            ))
            .json(identity)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let user = body.user.ok_or(AuthExchangeError::MissingUser)?;
        Ok(Session {
            user_id: UserId(user.id),
            email: EmailAddress::from_trusted(user.email),
            preferred_language: LanguageCode(user.preferred_language),
            auth_token: user.token,
        })
    }
}

/// Process-wide holder of the current [`Session`]. The only place a session
/// is created or cleared; everything else observes it via [`subscribe`].
///
/// [`subscribe`]: SessionContext::subscribe
pub struct SessionContext {
    current: watch::Sender<Option<Session>>,
    exchange: Arc<dyn IdentityExchange>,
    /// Bumped by every identity change and logout; an exchange only applies
    /// its result if nothing newer happened while it was in flight.
    generation: AtomicU64,
}

impl SessionContext {
    pub fn new(exchange: Arc<dyn IdentityExchange>) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            current,
            exchange,
            generation: AtomicU64::new(0),
        }
    }

    pub fn current(&self) -> Option<Session> {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.current.subscribe()
    }

    /// Reacts to the identity provider's state. Any exchange failure, or the
    /// absence of an identity, logs the user out.
    pub async fn on_identity_changed(
        &self,
        identity: Option<BackingIdentity>,
    ) -> Result<Option<Session>, AuthExchangeError> {
        let Some(identity) = identity else {
            self.logout();
            return Ok(None);
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let outcome = self.exchange.exchange(&identity).await;
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(email = %identity.email, "session: stale identity exchange discarded");
            return Ok(None);
        }

        match outcome {
            Ok(session) => {
                let mut superseded = false;
                self.current.send_if_modified(|current| {
                    if self.generation.load(Ordering::SeqCst) != generation {
                        superseded = true;
                        return false;
                    }
                    if current.as_ref() == Some(&session) {
                        return false;
                    }
                    *current = Some(session.clone());
                    true
                });
                if superseded {
                    debug!(email = %identity.email, "session: stale identity exchange discarded");
                    return Ok(None);
                }
                info!(email = %session.email, language = %session.preferred_language, "session: signed in");
                Ok(Some(session))
            }
            Err(err) => {
                warn!(email = %identity.email, "session: identity exchange failed: {err}");
                self.logout();
                Err(err)
            }
        }
    }

    pub fn logout(&self) {
        let was_signed_in = self.current.send_if_modified(|current| {
            self.generation.fetch_add(1, Ordering::SeqCst);
            current.take().is_some()
        });
        if was_signed_in {
            info!("session: signed out");
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
