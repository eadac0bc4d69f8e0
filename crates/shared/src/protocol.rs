use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ConversationId, EmailAddress},
    error::ServerError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "chatId")]
    pub conversation_id: ConversationId,
    pub sender_email: EmailAddress,
    #[serde(rename = "messageText")]
    pub text: String,
    /// Older stored messages may lack a timestamp.
    #[serde(default, rename = "updatedAt", skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translated_text: Option<String>,
}

impl Message {
    pub fn new(
        conversation_id: ConversationId,
        sender_email: EmailAddress,
        text: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            conversation_id,
            sender_email,
            text: text.into(),
            sent_at: Some(sent_at),
            translated_text: None,
        }
    }

    /// Attaches a translation unless one is already present. The sent
    /// text is never touched.
    pub fn with_translation(mut self, translated: impl Into<String>) -> Self {
        if self.translated_text.is_none() {
            self.translated_text = Some(translated.into());
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateConversation {
    pub id: ConversationId,
    #[serde(rename = "receiverEmail")]
    pub counterpart_email: EmailAddress,
    #[serde(rename = "updatedAt")]
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub is_online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupConversation {
    pub id: ConversationId,
    pub group_name: String,
    #[serde(rename = "updatedAt")]
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default, rename = "users", alias = "members")]
    pub members: Vec<EmailAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub email: EmailAddress,
    pub is_online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterRequest {
    pub user_email: EmailAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesRequest {
    #[serde(rename = "chatId")]
    pub conversation_id: ConversationId,
    pub email: EmailAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePrivateChatRequest {
    pub sender_email: EmailAddress,
    pub receiver_email: EmailAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupChatRequest {
    pub group_name: String,
    pub admin_email: EmailAddress,
    pub users: Vec<EmailAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatParticipants {
    #[serde(default)]
    pub private_chats: Vec<PrivateConversation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupChatParticipants {
    #[serde(default)]
    pub group_chats: Vec<GroupConversation>,
}

/// Result of a conversation creation request. The server answers either with
/// the new conversation or with `{ "error": "..." }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CreationResult<T> {
    Failed { error: String },
    Created(T),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ClientRequest {
    SetOnline(EmailAddress),
    GetChatParticipants(RosterRequest),
    GetGroupChatParticipants(RosterRequest),
    CreatePrivateChat(CreatePrivateChatRequest),
    CreateGroupChat(CreateGroupChatRequest),
    GetPrivateChatMessages(MessagesRequest),
    GetGroupChatMessages(MessagesRequest),
    SendPrivateMessage(Message),
    SendGroupMessage(Message),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ServerEvent {
    ChatParticipants(ChatParticipants),
    GroupChatParticipants(GroupChatParticipants),
    NewChatCreated(CreationResult<PrivateConversation>),
    GroupChatCreated(CreationResult<GroupConversation>),
    PrivateChatMessages(Vec<Message>),
    GroupChatMessages(Vec<Message>),
    ReceivePrivateMessage(Message),
    ReceiveGroupMessage(Message),
    UserStatusUpdate(PresenceUpdate),
    Error(ServerError),
}

/// Discriminant used to subscribe to one family of server events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventClass {
    ChatParticipants,
    GroupChatParticipants,
    NewChatCreated,
    GroupChatCreated,
    PrivateChatMessages,
    GroupChatMessages,
    ReceivePrivateMessage,
    ReceiveGroupMessage,
    UserStatusUpdate,
    Error,
}

impl ServerEvent {
    pub fn class(&self) -> EventClass {
        match self {
            ServerEvent::ChatParticipants(_) => EventClass::ChatParticipants,
            ServerEvent::GroupChatParticipants(_) => EventClass::GroupChatParticipants,
            ServerEvent::NewChatCreated(_) => EventClass::NewChatCreated,
            ServerEvent::GroupChatCreated(_) => EventClass::GroupChatCreated,
            ServerEvent::PrivateChatMessages(_) => EventClass::PrivateChatMessages,
            ServerEvent::GroupChatMessages(_) => EventClass::GroupChatMessages,
            ServerEvent::ReceivePrivateMessage(_) => EventClass::ReceivePrivateMessage,
            ServerEvent::ReceiveGroupMessage(_) => EventClass::ReceiveGroupMessage,
            ServerEvent::UserStatusUpdate(_) => EventClass::UserStatusUpdate,
            ServerEvent::Error(_) => EventClass::Error,
        }
    }
}
