//! Normalized in-memory replica of everything the signed-in user can see.
//!
//! All mutation goes through [`StoreAction`] values applied by
//! [`Replica::apply`]; [`ReplicaStore`] serializes writers behind a lock and
//! announces every change on a broadcast channel.

use shared::domain::{
    Channel, ChannelId, Conversation, ConversationId, DirectMessage, Member, MemberId, Message,
    MessageId, ProfileId, Server, ServerId,
};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::merge::{
    insert_live, merge_history, refresh_page, remove_entry, replace_entry, soft_delete, upsert_by,
};

#[derive(Debug, Clone, PartialEq)]
pub enum StoreAction {
    ServersLoaded(Vec<Server>),
    ServerUpserted(Server),
    ServerRemoved(ServerId),
    ServerSelected(Option<ServerId>),
    ActiveChannelSet(Option<ChannelId>),
    ChannelUpserted {
        server_id: ServerId,
        channel: Channel,
    },
    ChannelRemoved {
        server_id: ServerId,
        channel_id: ChannelId,
    },
    MemberUpserted {
        server_id: ServerId,
        member: Member,
    },
    MemberSoftDeleted {
        server_id: ServerId,
        member_id: MemberId,
    },
    MemberRemoved {
        server_id: ServerId,
        member_id: MemberId,
    },
    MessageReceived {
        server_id: ServerId,
        channel_id: ChannelId,
        message: Message,
    },
    MessageEdited {
        server_id: ServerId,
        channel_id: ChannelId,
        message: Message,
    },
    MessageSoftDeleted {
        server_id: ServerId,
        channel_id: ChannelId,
        message_id: MessageId,
    },
    MessageRemoved {
        server_id: ServerId,
        channel_id: ChannelId,
        message_id: MessageId,
    },
    ChannelHistoryMerged {
        server_id: ServerId,
        channel_id: ChannelId,
        messages: Vec<Message>,
    },
    ChannelPageRefreshed {
        server_id: ServerId,
        channel_id: ChannelId,
        messages: Vec<Message>,
    },
    ConversationOpened(Conversation),
    ConversationRemoved(ConversationId),
    ActiveConversationSet(Option<ConversationId>),
    DirectMessageReceived {
        conversation_id: ConversationId,
        message: DirectMessage,
    },
    DirectMessageEdited {
        conversation_id: ConversationId,
        message: DirectMessage,
    },
    DirectMessageSoftDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    DirectMessageRemoved {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    ConversationHistoryMerged {
        conversation_id: ConversationId,
        messages: Vec<DirectMessage>,
    },
    ConversationPageRefreshed {
        conversation_id: ConversationId,
        messages: Vec<DirectMessage>,
    },
    LiveChanged(bool),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Replica {
    servers: Vec<Server>,
    conversations: Vec<Conversation>,
    selected_server: Option<ServerId>,
    active_channel: Option<ChannelId>,
    active_conversation: Option<ConversationId>,
    live: bool,
}

impl Replica {
    /// Applies one action. Returns whether anything changed; unknown parents
    /// and ids are ignored.
    pub fn apply(&mut self, action: StoreAction) -> bool {
        match action {
            StoreAction::ServersLoaded(mut servers) => {
                for server in &mut servers {
                    for channel in &mut server.channels {
                        channel.messages.sort_by_key(|m| (m.created_at, m.id));
                    }
                }
                if let Some(selected) = self.selected_server {
                    if !servers.iter().any(|s| s.id == selected) {
                        self.selected_server = None;
                    }
                }
                self.servers = servers;
                true
            }
            StoreAction::ServerUpserted(server) => {
                upsert_by(&mut self.servers, server, |s| s.id);
                true
            }
            StoreAction::ServerRemoved(server_id) => {
                let before = self.servers.len();
                self.servers.retain(|s| s.id != server_id);
                if self.selected_server == Some(server_id) {
                    self.selected_server = None;
                }
                self.servers.len() != before
            }
            StoreAction::ServerSelected(server_id) => {
                replace_if_changed(&mut self.selected_server, server_id)
            }
            StoreAction::ActiveChannelSet(channel_id) => {
                replace_if_changed(&mut self.active_channel, channel_id)
            }
            StoreAction::ChannelUpserted { server_id, channel } => {
                let Some(server) = self.server_mut(server_id) else {
                    return false;
                };
                let mut channel = channel;
                if channel.messages.is_empty() {
                    if let Some(existing) = server.channel(channel.id) {
                        channel.messages = existing.messages.clone();
                    }
                }
                upsert_by(&mut server.channels, channel, |c| c.id);
                true
            }
            StoreAction::ChannelRemoved {
                server_id,
                channel_id,
            } => self.server_mut(server_id).is_some_and(|server| {
                let before = server.channels.len();
                server.channels.retain(|c| c.id != channel_id);
                server.channels.len() != before
            }),
            StoreAction::MemberUpserted { server_id, member } => {
                let Some(server) = self.server_mut(server_id) else {
                    return false;
                };
                upsert_by(&mut server.members, member, |m| m.id);
                true
            }
            StoreAction::MemberSoftDeleted {
                server_id,
                member_id,
            } => self
                .server_mut(server_id)
                .and_then(|server| server.members.iter_mut().find(|m| m.id == member_id))
                .is_some_and(|member| !std::mem::replace(&mut member.deleted, true)),
            StoreAction::MemberRemoved {
                server_id,
                member_id,
            } => self.server_mut(server_id).is_some_and(|server| {
                let before = server.members.len();
                server.members.retain(|m| m.id != member_id);
                server.members.len() != before
            }),
            StoreAction::MessageReceived {
                server_id,
                channel_id,
                message,
            } => self
                .timeline_mut(server_id, channel_id)
                .is_some_and(|timeline| insert_live(timeline, message)),
            StoreAction::MessageEdited {
                server_id,
                channel_id,
                message,
            } => self
                .timeline_mut(server_id, channel_id)
                .is_some_and(|timeline| replace_entry(timeline, message)),
            StoreAction::MessageSoftDeleted {
                server_id,
                channel_id,
                message_id,
            } => self
                .timeline_mut(server_id, channel_id)
                .is_some_and(|timeline| soft_delete(timeline, message_id)),
            StoreAction::MessageRemoved {
                server_id,
                channel_id,
                message_id,
            } => self
                .timeline_mut(server_id, channel_id)
                .is_some_and(|timeline| remove_entry(timeline, message_id)),
            StoreAction::ChannelHistoryMerged {
                server_id,
                channel_id,
                messages,
            } => self
                .timeline_mut(server_id, channel_id)
                .is_some_and(|timeline| changed_by(timeline, |t| merge_history(t, messages))),
            StoreAction::ChannelPageRefreshed {
                server_id,
                channel_id,
                messages,
            } => self
                .timeline_mut(server_id, channel_id)
                .is_some_and(|timeline| changed_by(timeline, |t| refresh_page(t, messages))),
            StoreAction::ConversationOpened(conversation) => {
                match self
                    .conversations
                    .iter_mut()
                    .find(|c| c.id == conversation.id)
                {
                    Some(existing) => changed_by(&mut existing.direct_messages, |t| {
                        merge_history(t, conversation.direct_messages)
                    }),
                    None => {
                        let mut conversation = conversation;
                        conversation
                            .direct_messages
                            .sort_by_key(|m| (m.created_at, m.id));
                        self.conversations.push(conversation);
                        true
                    }
                }
            }
            StoreAction::ConversationRemoved(conversation_id) => {
                let before = self.conversations.len();
                self.conversations.retain(|c| c.id != conversation_id);
                if self.active_conversation == Some(conversation_id) {
                    self.active_conversation = None;
                }
                self.conversations.len() != before
            }
            StoreAction::ActiveConversationSet(conversation_id) => {
                replace_if_changed(&mut self.active_conversation, conversation_id)
            }
            StoreAction::DirectMessageReceived {
                conversation_id,
                message,
            } => self
                .direct_messages_mut(conversation_id)
                .is_some_and(|timeline| insert_live(timeline, message)),
            StoreAction::DirectMessageEdited {
                conversation_id,
                message,
            } => self
                .direct_messages_mut(conversation_id)
                .is_some_and(|timeline| replace_entry(timeline, message)),
            StoreAction::DirectMessageSoftDeleted {
                conversation_id,
                message_id,
            } => self
                .direct_messages_mut(conversation_id)
                .is_some_and(|timeline| soft_delete(timeline, message_id)),
            StoreAction::DirectMessageRemoved {
                conversation_id,
                message_id,
            } => self
                .direct_messages_mut(conversation_id)
                .is_some_and(|timeline| remove_entry(timeline, message_id)),
            StoreAction::ConversationHistoryMerged {
                conversation_id,
                messages,
            } => self
                .direct_messages_mut(conversation_id)
                .is_some_and(|timeline| changed_by(timeline, |t| merge_history(t, messages))),
            StoreAction::ConversationPageRefreshed {
                conversation_id,
                messages,
            } => self
                .direct_messages_mut(conversation_id)
                .is_some_and(|timeline| changed_by(timeline, |t| refresh_page(t, messages))),
            StoreAction::LiveChanged(live) => replace_if_changed(&mut self.live, live),
        }
    }

    fn server_mut(&mut self, server_id: ServerId) -> Option<&mut Server> {
        self.servers.iter_mut().find(|s| s.id == server_id)
    }

    fn timeline_mut(
        &mut self,
        server_id: ServerId,
        channel_id: ChannelId,
    ) -> Option<&mut Vec<Message>> {
        self.server_mut(server_id)?
            .channel_mut(channel_id)
            .map(|channel| &mut channel.messages)
    }

    fn direct_messages_mut(
        &mut self,
        conversation_id: ConversationId,
    ) -> Option<&mut Vec<DirectMessage>> {
        self.conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
            .map(|c| &mut c.direct_messages)
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn server(&self, server_id: ServerId) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == server_id)
    }

    pub fn server_ids(&self) -> Vec<ServerId> {
        self.servers.iter().map(|s| s.id).collect()
    }

    /// The selected server, borrowed from the canonical list.
    pub fn selected_server(&self) -> Option<&Server> {
        self.selected_server.and_then(|id| self.server(id))
    }

    pub fn channel(&self, server_id: ServerId, channel_id: ChannelId) -> Option<&Channel> {
        self.server(server_id)?.channel(channel_id)
    }

    pub fn channel_messages(&self, server_id: ServerId, channel_id: ChannelId) -> &[Message] {
        self.channel(server_id, channel_id)
            .map(|c| c.messages.as_slice())
            .unwrap_or_default()
    }

    pub fn active_channel(&self) -> Option<ChannelId> {
        self.active_channel
    }

    /// Server owning the active channel.
    pub fn active_channel_location(&self) -> Option<(ServerId, ChannelId)> {
        let channel_id = self.active_channel?;
        self.servers
            .iter()
            .find(|s| s.channel(channel_id).is_some())
            .map(|s| (s.id, channel_id))
    }

    pub fn active_conversation(&self) -> Option<ConversationId> {
        self.active_conversation
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn conversation(&self, conversation_id: ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == conversation_id)
    }

    pub fn conversation_between(&self, a: MemberId, b: MemberId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.is_between(a, b))
    }

    /// Case-insensitive substring match on the server name.
    pub fn search_servers(&self, query: &str) -> Vec<&Server> {
        let query = query.trim().to_lowercase();
        self.servers
            .iter()
            .filter(|s| s.name.to_lowercase().contains(&query))
            .collect()
    }

    /// Servers in which `profile_id` still holds a non-deleted membership.
    pub fn active_servers(&self, profile_id: ProfileId) -> Vec<&Server> {
        self.servers
            .iter()
            .filter(|s| {
                s.member_for_profile(profile_id)
                    .is_some_and(|member| !member.deleted)
            })
            .collect()
    }

    pub fn active_members(&self, server_id: ServerId) -> Vec<&Member> {
        self.server(server_id)
            .map(|s| s.active_members().collect())
            .unwrap_or_default()
    }

    /// Client-side guard only; the backend has the final word.
    pub fn is_channel_name_available(&self, server_id: ServerId, name: &str) -> bool {
        let wanted = name.trim().to_lowercase();
        self.server(server_id).map_or(true, |server| {
            !server
                .channels
                .iter()
                .any(|c| c.name.trim().to_lowercase() == wanted)
        })
    }
}

fn replace_if_changed<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

fn changed_by<T: PartialEq + Clone>(timeline: &mut Vec<T>, f: impl FnOnce(&mut Vec<T>)) -> bool {
    let before = timeline.clone();
    f(timeline);
    *timeline != before
}

#[derive(Debug, Clone)]
pub struct StoreChange {
    pub revision: u64,
    pub action: StoreAction,
}

/// Shared handle to the replica: single writer at a time, many readers.
pub struct ReplicaStore {
    state: RwLock<(Replica, u64)>,
    changes: broadcast::Sender<StoreChange>,
}

impl Default for ReplicaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            state: RwLock::new((Replica::default(), 0)),
            changes,
        }
    }

    /// Applies `action` atomically; observers hear about it only if the
    /// replica actually changed.
    pub async fn apply(&self, action: StoreAction) -> bool {
        let mut guard = self.state.write().await;
        let (replica, revision) = &mut *guard;
        if !replica.apply(action.clone()) {
            debug!(?action, "store action had no effect");
            return false;
        }
        *revision += 1;
        let _ = self.changes.send(StoreChange {
            revision: *revision,
            action,
        });
        true
    }

    pub async fn read<R>(&self, f: impl FnOnce(&Replica) -> R) -> R {
        let guard = self.state.read().await;
        f(&guard.0)
    }

    pub async fn snapshot(&self) -> Replica {
        self.state.read().await.0.clone()
    }

    pub async fn revision(&self) -> u64 {
        self.state.read().await.1
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
