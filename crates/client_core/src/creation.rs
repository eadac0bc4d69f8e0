use std::time::Duration;

use shared::{
    domain::EmailAddress,
    error::ValidationError,
    protocol::{
        ClientRequest, CreateGroupChatRequest, CreatePrivateChatRequest, CreationResult,
        EventClass, GroupConversation, PrivateConversation, ServerEvent,
    },
};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{
    connection::ConnectionHandle,
    error::{ConnectionError, CreateChatError},
};

/// Creates private and group conversations on behalf of the session user.
///
/// New conversations reach the rosters through the usual creation events; the
/// result returned here only tells the caller whether the request succeeded.
pub struct ConversationCreator {
    connection: ConnectionHandle,
    owner: EmailAddress,
    timeout: Duration,
}

impl ConversationCreator {
    pub fn new(connection: ConnectionHandle, owner: EmailAddress, timeout: Duration) -> Self {
        Self {
            connection,
            owner,
            timeout,
        }
    }

    pub async fn create_private_chat(
        &self,
        receiver: &str,
    ) -> Result<PrivateConversation, CreateChatError> {
        let receiver = EmailAddress::parse(receiver)?;
        let mut results = self.connection.subscribe(&[EventClass::NewChatCreated]);
        self.connection
            .emit(ClientRequest::CreatePrivateChat(CreatePrivateChatRequest {
                sender_email: self.owner.clone(),
                receiver_email: receiver.clone(),
            }))?;
        debug!(receiver = %receiver, "creation: private chat requested");

        let outcome = timeout(self.timeout, async {
            while let Some(event) = results.recv().await {
                let ServerEvent::NewChatCreated(result) = event else {
                    continue;
                };
                match result {
                    CreationResult::Failed { error } => return Some(Err(error)),
                    CreationResult::Created(chat) if chat.counterpart_email == receiver => {
                        return Some(Ok(chat));
                    }
                    CreationResult::Created(chat) => {
                        debug!(id = %chat.id, "creation: unrelated chat created");
                    }
                }
            }
            None
        })
        .await;

        match self.settle(outcome)? {
            Ok(chat) => {
                info!(id = %chat.id, receiver = %receiver, "creation: private chat created");
                Ok(chat)
            }
            Err(error) => {
                warn!(receiver = %receiver, "creation: private chat rejected: {error}");
                Err(CreateChatError::Rejected(error))
            }
        }
    }

    pub async fn create_group_chat(
        &self,
        name: &str,
        members: &[&str],
    ) -> Result<GroupConversation, CreateChatError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::MissingGroupName.into());
        }
        if members.is_empty() {
            return Err(ValidationError::NoGroupMembers.into());
        }
        let users = members
            .iter()
            .map(|member| EmailAddress::parse(member))
            .collect::<Result<Vec<_>, _>>()?;

        let mut results = self.connection.subscribe(&[EventClass::GroupChatCreated]);
        self.connection
            .emit(ClientRequest::CreateGroupChat(CreateGroupChatRequest {
                group_name: name.to_string(),
                admin_email: self.owner.clone(),
                users,
            }))?;
        debug!(group = name, "creation: group chat requested");

        let outcome = timeout(self.timeout, async {
            while let Some(event) = results.recv().await {
                let ServerEvent::GroupChatCreated(result) = event else {
                    continue;
                };
                match result {
                    CreationResult::Failed { error } => return Some(Err(error)),
                    CreationResult::Created(group) if group.group_name == name => {
                        return Some(Ok(group));
                    }
                    CreationResult::Created(group) => {
                        debug!(id = %group.id, "creation: unrelated group created");
                    }
                }
            }
            None
        })
        .await;

        match self.settle(outcome)? {
            Ok(group) => {
                info!(id = %group.id, group = name, "creation: group chat created");
                Ok(group)
            }
            Err(error) => {
                warn!(group = name, "creation: group chat rejected: {error}");
                Err(CreateChatError::Rejected(error))
            }
        }
    }

    fn settle<T>(
        &self,
        outcome: Result<Option<Result<T, String>>, tokio::time::error::Elapsed>,
    ) -> Result<Result<T, String>, CreateChatError> {
        match outcome {
            Ok(Some(result)) => Ok(result),
            Ok(None) => Err(ConnectionError::Closed.into()),
            Err(_) => Err(CreateChatError::TimedOut {
                seconds: self.timeout.as_secs(),
            }),
        }
    }
}
