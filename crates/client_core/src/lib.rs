use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

pub mod banner;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod creation;
pub mod error;
pub mod roster;
pub mod session;
pub mod translation;

pub use banner::{BannerText, StatusBanner};
pub use config::{load_settings, ClientSettings, ConnectionSettings};
pub use connection::{
    ConnectionHandle, ConnectionManager, ConnectionState, ConnectionStatus, SessionConnection,
    Subscription,
};
pub use conversation::{ConversationSession, ConversationStatus, ConversationTarget, ConversationView};
pub use creation::ConversationCreator;
pub use error::{AuthExchangeError, ConnectionError, CreateChatError, SendError, TranslationError};
pub use roster::{GroupRoster, PrivateRoster, RosterSnapshot, RosterView, UnreadReset};
pub use session::{
    BackingIdentity, HttpIdentityExchange, IdentityExchange, MissingIdentityExchange, Session,
    SessionContext,
};
pub use translation::{HttpTranslator, MissingTranslator, TranslationOverlay, Translator};

/// Wires the session context to a connection that follows it. Everything
/// scoped to a signed-in user (rosters, conversations, creation) is built
/// from the current connection handle.
///
/// Must be created inside a tokio runtime.
pub struct ChatClient {
    settings: ClientSettings,
    sessions: SessionContext,
    connection: SessionConnection,
    translator: Arc<dyn Translator>,
}

impl ChatClient {
    pub fn new(settings: ClientSettings) -> Self {
        let exchange = Arc::new(HttpIdentityExchange::new(settings.auth_url.clone()));
        let translator = Arc::new(HttpTranslator::new(settings.translation_url.clone()));
        Self::new_with_dependencies(settings, exchange, translator)
    }

    pub fn new_with_dependencies(
        settings: ClientSettings,
        exchange: Arc<dyn IdentityExchange>,
        translator: Arc<dyn Translator>,
    ) -> Self {
        let sessions = SessionContext::new(exchange);
        let manager = Arc::new(ConnectionManager::new(settings.connection.clone()));
        let connection = manager.follow_session(sessions.subscribe());
        Self {
            settings,
            sessions,
            connection,
            translator,
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn sessions(&self) -> &SessionContext {
        &self.sessions
    }

    pub fn session(&self) -> Option<Session> {
        self.sessions.current()
    }

    pub async fn sign_in(
        &self,
        identity: Option<BackingIdentity>,
    ) -> Result<Option<Session>, AuthExchangeError> {
        self.sessions.on_identity_changed(identity).await
    }

    pub fn sign_out(&self) {
        self.sessions.logout();
    }

    pub fn connection(&self) -> Option<ConnectionHandle> {
        self.connection.current()
    }

    pub fn connections(&self) -> watch::Receiver<Option<ConnectionHandle>> {
        self.connection.handles()
    }

    pub fn status_banner(&self, handle: &ConnectionHandle) -> StatusBanner {
        StatusBanner::spawn(handle.state(), self.settings.banner_duration)
    }

    /// Translation overlay for the signed-in user's preferred language.
    pub fn overlay(&self) -> Option<TranslationOverlay> {
        let session = self.sessions.current()?;
        Some(TranslationOverlay::new(
            Arc::clone(&self.translator),
            session.email,
            session.preferred_language,
        ))
    }

    pub fn private_roster(&self) -> Option<RosterView<PrivateRoster>> {
        let session = self.sessions.current()?;
        let handle = self.connection()?;
        Some(RosterView::mount(&handle, session.email))
    }

    pub fn group_roster(&self) -> Option<RosterView<GroupRoster>> {
        let session = self.sessions.current()?;
        let handle = self.connection()?;
        Some(RosterView::mount(&handle, session.email))
    }

    pub fn open_conversation(&self, target: ConversationTarget) -> Option<ConversationSession> {
        let overlay = self.overlay()?;
        let handle = self.connection()?;
        info!(conversation_id = %target.id(), "client: opening conversation");
        Some(ConversationSession::open(&handle, overlay, target))
    }

    pub fn creator(&self) -> Option<ConversationCreator> {
        let session = self.sessions.current()?;
        let handle = self.connection()?;
        Some(ConversationCreator::new(
            handle,
            session.email,
            self.settings.create_timeout,
        ))
    }

    pub async fn shutdown(self) {
        self.sessions.logout();
        self.connection.shutdown().await;
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
