use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, EmailAddress},
    protocol::{
        ClientRequest, CreationResult, EventClass, GroupConversation, PresenceUpdate,
        PrivateConversation, RosterRequest, ServerEvent,
    },
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::connection::ConnectionHandle;

pub trait RosterEntry: Clone + Send + Sync + 'static {
    fn id(&self) -> &ConversationId;
    fn last_updated_at(&self) -> DateTime<Utc>;
    fn unread_count(&self) -> u32;
    /// Bumps `last_updated_at`, counting the message as unread when `unread`.
    fn record_message(&mut self, at: DateTime<Utc>, unread: bool);
    fn reset_unread(&mut self);

    /// Returns `true` when the entry changed.
    fn apply_presence(&mut self, _update: &PresenceUpdate) -> bool {
        false
    }
}

impl RosterEntry for PrivateConversation {
    fn id(&self) -> &ConversationId {
        &self.id
    }

    fn last_updated_at(&self) -> DateTime<Utc> {
        self.last_updated_at
    }

    fn unread_count(&self) -> u32 {
        self.unread_count
    }

    fn record_message(&mut self, at: DateTime<Utc>, unread: bool) {
        self.last_updated_at = at;
        if unread {
            self.unread_count = self.unread_count.saturating_add(1);
        }
    }

    fn reset_unread(&mut self) {
        self.unread_count = 0;
    }

    fn apply_presence(&mut self, update: &PresenceUpdate) -> bool {
        if self.counterpart_email != update.email || self.is_online == update.is_online {
            return false;
        }
        self.is_online = update.is_online;
        true
    }
}

impl RosterEntry for GroupConversation {
    fn id(&self) -> &ConversationId {
        &self.id
    }

    fn last_updated_at(&self) -> DateTime<Utc> {
        self.last_updated_at
    }

    fn unread_count(&self) -> u32 {
        self.unread_count
    }

    fn record_message(&mut self, at: DateTime<Utc>, unread: bool) {
        self.last_updated_at = at;
        if unread {
            self.unread_count = self.unread_count.saturating_add(1);
        }
    }

    fn reset_unread(&mut self) {
        self.unread_count = 0;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RosterEvent<E> {
    Replaced(Vec<E>),
    MessageArrived {
        conversation_id: ConversationId,
        at: DateTime<Utc>,
    },
    Created(E),
    Presence(PresenceUpdate),
}

/// Wire binding of one roster flavour (private chats, group chats).
pub trait RosterKind: Send + Sync + 'static {
    type Entry: RosterEntry;

    const NAME: &'static str;

    fn request(owner: &EmailAddress) -> ClientRequest;
    fn event_classes() -> &'static [EventClass];
    fn classify(event: ServerEvent) -> Option<RosterEvent<Self::Entry>>;
}

pub struct PrivateRoster;

impl RosterKind for PrivateRoster {
    type Entry = PrivateConversation;

    const NAME: &'static str = "private";

    fn request(owner: &EmailAddress) -> ClientRequest {
        ClientRequest::GetChatParticipants(RosterRequest {
            user_email: owner.clone(),
        })
    }

    fn event_classes() -> &'static [EventClass] {
        &[
            EventClass::ChatParticipants,
            EventClass::ReceivePrivateMessage,
            EventClass::NewChatCreated,
            EventClass::UserStatusUpdate,
        ]
    }

    fn classify(event: ServerEvent) -> Option<RosterEvent<PrivateConversation>> {
        match event {
            ServerEvent::ChatParticipants(payload) => {
                Some(RosterEvent::Replaced(payload.private_chats))
            }
            ServerEvent::ReceivePrivateMessage(message) => Some(RosterEvent::MessageArrived {
                conversation_id: message.conversation_id,
                at: message.sent_at.unwrap_or_else(Utc::now),
            }),
            ServerEvent::NewChatCreated(CreationResult::Created(chat)) => {
                Some(RosterEvent::Created(chat))
            }
            ServerEvent::UserStatusUpdate(update) => Some(RosterEvent::Presence(update)),
            _ => None,
        }
    }
}

pub struct GroupRoster;

impl RosterKind for GroupRoster {
    type Entry = GroupConversation;

    const NAME: &'static str = "group";

    fn request(owner: &EmailAddress) -> ClientRequest {
        ClientRequest::GetGroupChatParticipants(RosterRequest {
            user_email: owner.clone(),
        })
    }

    fn event_classes() -> &'static [EventClass] {
        &[
            EventClass::GroupChatParticipants,
            EventClass::ReceiveGroupMessage,
            EventClass::GroupChatCreated,
        ]
    }

    fn classify(event: ServerEvent) -> Option<RosterEvent<GroupConversation>> {
        match event {
            ServerEvent::GroupChatParticipants(payload) => {
                Some(RosterEvent::Replaced(payload.group_chats))
            }
            ServerEvent::ReceiveGroupMessage(message) => Some(RosterEvent::MessageArrived {
                conversation_id: message.conversation_id,
                at: message.sent_at.unwrap_or_else(Utc::now),
            }),
            ServerEvent::GroupChatCreated(CreationResult::Created(chat)) => {
                Some(RosterEvent::Created(chat))
            }
            _ => None,
        }
    }
}

/// Conversation list kept sorted by `last_updated_at`, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct Roster<E> {
    entries: Vec<E>,
    /// Conversation currently shown to the user; its messages are never unread.
    open: Option<ConversationId>,
}

impl<E> Default for Roster<E> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            open: None,
        }
    }
}

impl<E: RosterEntry> Roster<E> {
    pub fn from_entries(entries: Vec<E>) -> Self {
        let mut roster = Self {
            entries,
            open: None,
        };
        roster.sort();
        roster
    }

    pub fn open_conversation(&self) -> Option<&ConversationId> {
        self.open.as_ref()
    }

    pub fn set_open(&mut self, id: Option<ConversationId>) {
        self.open = id;
    }

    pub fn entries(&self) -> &[E] {
        &self.entries
    }

    pub fn get(&self, id: &ConversationId) -> Option<&E> {
        self.entries.iter().find(|entry| entry.id() == id)
    }

    /// Applies one event and reports whether the list changed.
    pub fn apply(&mut self, event: RosterEvent<E>) -> bool {
        match event {
            RosterEvent::Replaced(entries) => {
                self.entries = entries;
                self.sort();
                true
            }
            RosterEvent::MessageArrived {
                conversation_id,
                at,
            } => {
                let unread = self.open.as_ref() != Some(&conversation_id);
                let Some(entry) = self
                    .entries
                    .iter_mut()
                    .find(|entry| *entry.id() == conversation_id)
                else {
                    debug!(%conversation_id, "roster: message for unknown conversation ignored");
                    return false;
                };
                entry.record_message(at, unread);
                self.sort();
                true
            }
            RosterEvent::Created(entry) => {
                if self.get(entry.id()).is_some() {
                    return false;
                }
                self.entries.push(entry);
                self.sort();
                true
            }
            RosterEvent::Presence(update) => self
                .entries
                .iter_mut()
                .fold(false, |changed, entry| entry.apply_presence(&update) || changed),
        }
    }

    pub fn mark_read(&mut self, id: &ConversationId) -> bool {
        match self.entries.iter_mut().find(|entry| entry.id() == id) {
            Some(entry) if entry.unread_count() > 0 => {
                entry.reset_unread();
                true
            }
            _ => false,
        }
    }

    fn sort(&mut self) {
        self.entries
            .sort_by(|a, b| b.last_updated_at().cmp(&a.last_updated_at()));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RosterSnapshot<E> {
    /// `true` until the first roster response arrives.
    pub loading: bool,
    pub entries: Vec<E>,
}

/// Hook for resetting a conversation's unread counter when it is opened.
pub trait UnreadReset {
    fn reset_unread(&self, id: &ConversationId);
}

enum RosterCommand {
    MarkRead(ConversationId),
    SetOpen(Option<ConversationId>),
}

/// A mounted roster. Dropping it (or [`RosterView::unmount`]) stops the sync
/// task and releases its listeners.
pub struct RosterView<K: RosterKind> {
    snapshot: watch::Receiver<RosterSnapshot<K::Entry>>,
    commands: mpsc::UnboundedSender<RosterCommand>,
    task: Option<JoinHandle<()>>,
    _kind: PhantomData<K>,
}

impl<K: RosterKind> RosterView<K> {
    pub fn mount(connection: &ConnectionHandle, owner: EmailAddress) -> Self {
        // Subscribe before requesting so the response cannot be missed.
        let mut events = connection.subscribe(K::event_classes());
        let mut state = connection.state();
        let connection = connection.clone();
        let (snapshot_tx, snapshot_rx) = watch::channel(RosterSnapshot {
            loading: true,
            entries: Vec::new(),
        });
        let (commands_tx, mut commands_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let mut roster = Roster::<K::Entry>::default();
            let mut loading = true;
            let mut was_connected = false;

            loop {
                let connected = state.borrow_and_update().is_connected();
                if connected && !was_connected {
                    match connection.emit(K::request(&owner)) {
                        Ok(()) => debug!(kind = K::NAME, owner = %owner, "roster: requested"),
                        Err(err) => warn!(kind = K::NAME, "roster: request not sent: {err}"),
                    }
                }
                was_connected = connected;

                tokio::select! {
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    event = events.recv() => {
                        let Some(event) = event else {
                            break;
                        };
                        let Some(event) = K::classify(event) else {
                            continue;
                        };
                        let replaced = matches!(event, RosterEvent::Replaced(_));
                        let changed = roster.apply(event);
                        if replaced {
                            loading = false;
                            info!(kind = K::NAME, entries = roster.entries().len(), "roster: replaced");
                        }
                        if changed || replaced {
                            publish(&snapshot_tx, loading, &roster);
                        }
                    }
                    command = commands_rx.recv() => match command {
                        Some(RosterCommand::MarkRead(id)) => {
                            if roster.mark_read(&id) {
                                publish(&snapshot_tx, loading, &roster);
                            }
                        }
                        Some(RosterCommand::SetOpen(id)) => roster.set_open(id),
                        None => break,
                    },
                }
            }
        });

        Self {
            snapshot: snapshot_rx,
            commands: commands_tx,
            task: Some(task),
            _kind: PhantomData,
        }
    }

    pub fn snapshot(&self) -> RosterSnapshot<K::Entry> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RosterSnapshot<K::Entry>> {
        self.snapshot.clone()
    }

    pub fn mark_read(&self, id: &ConversationId) {
        let _ = self.commands.send(RosterCommand::MarkRead(id.clone()));
    }

    /// Marks which conversation the user is looking at, if any.
    pub fn set_open(&self, id: Option<ConversationId>) {
        let _ = self.commands.send(RosterCommand::SetOpen(id));
    }

    /// Stops syncing and waits until the listeners are released.
    pub async fn unmount(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl<K: RosterKind> UnreadReset for RosterView<K> {
    fn reset_unread(&self, id: &ConversationId) {
        self.mark_read(id);
    }
}

impl<K: RosterKind> Drop for RosterView<K> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn publish<E: RosterEntry>(
    snapshot_tx: &watch::Sender<RosterSnapshot<E>>,
    loading: bool,
    roster: &Roster<E>,
) {
    snapshot_tx.send_replace(RosterSnapshot {
        loading,
        entries: roster.entries().to_vec(),
    });
}

#[cfg(test)]
#[path = "tests/roster_tests.rs"]
mod tests;
