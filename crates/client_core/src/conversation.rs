use std::collections::VecDeque;

use chrono::Utc;
use futures::{future::BoxFuture, stream::FuturesUnordered, FutureExt, StreamExt};
use shared::{
    domain::{ConversationId, ConversationKind, EmailAddress},
    error::ValidationError,
    protocol::{ClientRequest, EventClass, Message, MessagesRequest, ServerEvent},
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    connection::{ConnectionHandle, Subscription},
    error::SendError,
    roster::UnreadReset,
    translation::TranslationOverlay,
};

/// The conversation a session is opened on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationTarget {
    Private {
        id: ConversationId,
        counterpart: EmailAddress,
    },
    Group {
        id: ConversationId,
        name: String,
    },
}

impl ConversationTarget {
    pub fn id(&self) -> &ConversationId {
        match self {
            ConversationTarget::Private { id, .. } | ConversationTarget::Group { id, .. } => id,
        }
    }

    pub fn kind(&self) -> ConversationKind {
        match self {
            ConversationTarget::Private { .. } => ConversationKind::Private,
            ConversationTarget::Group { .. } => ConversationKind::Group,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            ConversationTarget::Private { counterpart, .. } => counterpart.as_str(),
            ConversationTarget::Group { name, .. } => name,
        }
    }

    fn snapshot_request(&self, viewer: &EmailAddress) -> ClientRequest {
        let request = MessagesRequest {
            conversation_id: self.id().clone(),
            email: viewer.clone(),
        };
        match self.kind() {
            ConversationKind::Private => ClientRequest::GetPrivateChatMessages(request),
            ConversationKind::Group => ClientRequest::GetGroupChatMessages(request),
        }
    }

    fn send_request(&self, message: Message) -> ClientRequest {
        match self.kind() {
            ConversationKind::Private => ClientRequest::SendPrivateMessage(message),
            ConversationKind::Group => ClientRequest::SendGroupMessage(message),
        }
    }

    fn event_classes(&self) -> &'static [EventClass] {
        match self.kind() {
            ConversationKind::Private => &[
                EventClass::PrivateChatMessages,
                EventClass::ReceivePrivateMessage,
            ],
            ConversationKind::Group => {
                &[EventClass::GroupChatMessages, EventClass::ReceiveGroupMessage]
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationStatus {
    /// Waiting for the history snapshot and its translations.
    Loading,
    Ready,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationView {
    pub status: ConversationStatus,
    pub messages: Vec<Message>,
}

enum Inbound {
    Snapshot(Vec<Message>),
    Live(Message),
}

fn classify(kind: ConversationKind, event: ServerEvent) -> Option<Inbound> {
    match (kind, event) {
        (ConversationKind::Private, ServerEvent::PrivateChatMessages(messages))
        | (ConversationKind::Group, ServerEvent::GroupChatMessages(messages)) => {
            Some(Inbound::Snapshot(messages))
        }
        (ConversationKind::Private, ServerEvent::ReceivePrivateMessage(message))
        | (ConversationKind::Group, ServerEvent::ReceiveGroupMessage(message)) => {
            Some(Inbound::Live(message))
        }
        _ => None,
    }
}

/// An open conversation. Dropping it (or [`ConversationSession::unmount`])
/// cancels in-flight translations and releases its listeners.
pub struct ConversationSession {
    target: ConversationTarget,
    viewer: EmailAddress,
    connection: ConnectionHandle,
    view: watch::Receiver<ConversationView>,
    task: Option<JoinHandle<()>>,
}

impl ConversationSession {
    pub fn open(
        connection: &ConnectionHandle,
        overlay: TranslationOverlay,
        target: ConversationTarget,
    ) -> Self {
        let viewer = overlay.viewer().clone();
        // Registered before the snapshot request: live events that race the
        // snapshot are held back until the history is committed.
        let events = connection.subscribe(target.event_classes());
        let (view_tx, view_rx) = watch::channel(ConversationView {
            status: ConversationStatus::Loading,
            messages: Vec::new(),
        });

        let worker = SessionWorker {
            target: target.clone(),
            viewer: viewer.clone(),
            connection: connection.clone(),
            overlay,
            events,
            view: view_tx,
        };
        let task = tokio::spawn(worker.run());

        Self {
            target,
            viewer,
            connection: connection.clone(),
            view: view_rx,
            task: Some(task),
        }
    }

    pub fn target(&self) -> &ConversationTarget {
        &self.target
    }

    pub fn view(&self) -> ConversationView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationView> {
        self.view.clone()
    }

    /// Sends the drafted text and clears the draft without waiting for the
    /// server. The message shows up in the log only once the server echoes
    /// it back on the live channel. On a connection error the draft is kept.
    pub fn send(&self, draft: &mut String) -> Result<(), SendError> {
        if draft.trim().is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }

        let message = Message::new(
            self.target.id().clone(),
            self.viewer.clone(),
            draft.clone(),
            Utc::now(),
        );
        self.connection.emit(self.target.send_request(message))?;
        draft.clear();
        Ok(())
    }

    /// Resets the unread counter for this conversation in the given roster.
    /// Left to the embedding UI to call when it considers the chat read.
    pub fn mark_read(&self, roster: &impl UnreadReset) {
        roster.reset_unread(self.target.id());
    }

    pub async fn unmount(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct SessionWorker {
    target: ConversationTarget,
    viewer: EmailAddress,
    connection: ConnectionHandle,
    overlay: TranslationOverlay,
    events: Subscription,
    view: watch::Sender<ConversationView>,
}

impl SessionWorker {
    async fn run(mut self) {
        let conversation_id = self.target.id().clone();
        let Some((history, early_live)) = self.await_snapshot().await else {
            return;
        };

        let early_live: Vec<Message> = early_live
            .into_iter()
            .filter(|message| !history.contains(message))
            .collect();

        let history = self.overlay.translate_batch(history).await;
        info!(%conversation_id, messages = history.len(), "conversation: history loaded");
        self.view.send_replace(ConversationView {
            status: ConversationStatus::Ready,
            messages: history,
        });

        let mut pending: FuturesUnordered<BoxFuture<'static, Message>> = FuturesUnordered::new();
        for message in early_live {
            pending.push(self.translate_live(message));
        }

        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    match classify(self.target.kind(), event) {
                        Some(Inbound::Live(message)) if message.conversation_id == conversation_id => {
                            pending.push(self.translate_live(message));
                        }
                        Some(Inbound::Live(message)) => {
                            debug!(other = %message.conversation_id, "conversation: live message for another conversation dropped");
                        }
                        Some(Inbound::Snapshot(_)) | None => {}
                    }
                }
                Some(message) = pending.next(), if !pending.is_empty() => {
                    self.view.send_modify(|view| view.messages.push(message));
                }
            }
        }
    }

    /// Waits for this conversation's snapshot, holding back live messages
    /// that arrive first. The request goes out on every transition into
    /// connected until a snapshot is accepted.
    async fn await_snapshot(&mut self) -> Option<(Vec<Message>, Vec<Message>)> {
        let conversation_id = self.target.id().clone();
        let mut state = self.connection.state();
        let mut was_connected = false;
        let mut early_live = VecDeque::new();

        loop {
            let connected = state.borrow_and_update().is_connected();
            if connected && !was_connected {
                match self
                    .connection
                    .emit(self.target.snapshot_request(&self.viewer))
                {
                    Ok(()) => debug!(%conversation_id, "conversation: snapshot requested"),
                    Err(err) => {
                        warn!(%conversation_id, "conversation: snapshot request not sent: {err}")
                    }
                }
            }
            was_connected = connected;

            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                event = self.events.recv() => {
                    let event = event?;
                    match classify(self.target.kind(), event) {
                        Some(Inbound::Snapshot(messages)) => {
                            let foreign = !messages.is_empty()
                                && messages
                                    .iter()
                                    .all(|message| message.conversation_id != conversation_id);
                            if foreign {
                                debug!(%conversation_id, "conversation: snapshot for another conversation ignored");
                                continue;
                            }
                            let history = messages
                                .into_iter()
                                .filter(|message| message.conversation_id == conversation_id)
                                .collect();
                            return Some((history, early_live.into_iter().collect()));
                        }
                        Some(Inbound::Live(message)) if message.conversation_id == conversation_id => {
                            early_live.push_back(message);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn translate_live(&self, message: Message) -> BoxFuture<'static, Message> {
        let overlay = self.overlay.clone();
        async move { overlay.translate(message).await }.boxed()
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
