//! Backward pagination of channel and conversation history.

use std::{collections::HashMap, hash::Hash, sync::Arc};

use anyhow::{Context, Result};
use shared::domain::{ChannelId, ConversationId, ServerId};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    api::ChatApi,
    store::{ReplicaStore, StoreAction},
};

/// "Load more" state of one timeline. Once a fetch comes back short, or
/// fails, the pager stays exhausted for the rest of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryPager {
    page_size: u32,
    next_page: u32,
    has_more: bool,
}

impl HistoryPager {
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size,
            next_page: 1,
            has_more: true,
        }
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn next_page(&self) -> u32 {
        self.next_page
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn record_page(&mut self, fetched: usize) {
        if fetched < self.page_size as usize {
            self.has_more = false;
        } else {
            self.next_page += 1;
        }
    }

    pub fn record_failure(&mut self) {
        self.has_more = false;
    }
}

/// One pager per timeline, each behind its own lock so a slow fetch on one
/// timeline never stalls another.
struct Pagers<K> {
    page_size: u32,
    by_key: Mutex<HashMap<K, Arc<Mutex<HistoryPager>>>>,
}

impl<K: Eq + Hash + Copy> Pagers<K> {
    fn new(page_size: u32) -> Self {
        Self {
            page_size,
            by_key: Mutex::new(HashMap::new()),
        }
    }

    async fn pager(&self, key: K) -> Arc<Mutex<HistoryPager>> {
        let mut by_key = self.by_key.lock().await;
        Arc::clone(
            by_key
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(HistoryPager::new(self.page_size)))),
        )
    }

    async fn has_more(&self, key: K) -> bool {
        let pager = self.by_key.lock().await.get(&key).cloned();
        match pager {
            Some(pager) => pager.lock().await.has_more(),
            None => true,
        }
    }
}

/// Fetches older pages through [`ChatApi`] and merges them into the replica.
pub struct HistoryLoader {
    api: Arc<dyn ChatApi>,
    store: Arc<ReplicaStore>,
    page_size: u32,
    channels: Pagers<ChannelId>,
    conversations: Pagers<ConversationId>,
}

impl HistoryLoader {
    pub fn new(api: Arc<dyn ChatApi>, store: Arc<ReplicaStore>, page_size: u32) -> Self {
        Self {
            api,
            store,
            page_size,
            channels: Pagers::new(page_size),
            conversations: Pagers::new(page_size),
        }
    }

    pub async fn channel_has_more(&self, channel_id: ChannelId) -> bool {
        self.channels.has_more(channel_id).await
    }

    pub async fn conversation_has_more(&self, conversation_id: ConversationId) -> bool {
        self.conversations.has_more(conversation_id).await
    }

    /// Loads the next older page of a channel. Returns how many messages the
    /// backend sent; `0` without a request once the pager is exhausted.
    pub async fn load_older_channel(
        &self,
        server_id: ServerId,
        channel_id: ChannelId,
    ) -> Result<usize> {
        let pager = self.channels.pager(channel_id).await;
        // Held across the fetch so one timeline never has two pages in flight.
        let mut pager = pager.lock().await;
        if !pager.has_more() {
            return Ok(0);
        }

        let page = match self
            .api
            .channel_messages(channel_id, pager.next_page(), pager.page_size())
            .await
        {
            Ok(page) => page,
            Err(err) => {
                pager.record_failure();
                warn!(%channel_id, "channel history fetch failed: {err}");
                return Err(err).context("failed to load channel history");
            }
        };
        let fetched = page.messages.len();
        pager.record_page(fetched);
        debug!(%channel_id, fetched, has_more = pager.has_more(), "channel history page");

        self.store
            .apply(StoreAction::ChannelHistoryMerged {
                server_id,
                channel_id,
                messages: page.messages,
            })
            .await;
        Ok(fetched)
    }

    pub async fn load_older_conversation(&self, conversation_id: ConversationId) -> Result<usize> {
        let pager = self.conversations.pager(conversation_id).await;
        let mut pager = pager.lock().await;
        if !pager.has_more() {
            return Ok(0);
        }

        let page = match self
            .api
            .conversation_messages(conversation_id, pager.next_page(), pager.page_size())
            .await
        {
            Ok(page) => page,
            Err(err) => {
                pager.record_failure();
                warn!(%conversation_id, "conversation history fetch failed: {err}");
                return Err(err).context("failed to load conversation history");
            }
        };
        let fetched = page.messages.len();
        pager.record_page(fetched);
        debug!(%conversation_id, fetched, has_more = pager.has_more(), "conversation history page");

        self.store
            .apply(StoreAction::ConversationHistoryMerged {
                conversation_id,
                messages: page.messages,
            })
            .await;
        Ok(fetched)
    }

    /// Re-fetches the newest page of a channel without moving its pager.
    pub async fn refresh_channel(&self, server_id: ServerId, channel_id: ChannelId) -> Result<()> {
        let page = self
            .api
            .channel_messages(channel_id, 1, self.page_size)
            .await
            .context("failed to refresh channel")?;
        self.store
            .apply(StoreAction::ChannelPageRefreshed {
                server_id,
                channel_id,
                messages: page.messages,
            })
            .await;
        Ok(())
    }

    pub async fn refresh_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        let page = self
            .api
            .conversation_messages(conversation_id, 1, self.page_size)
            .await
            .context("failed to refresh conversation")?;
        self.store
            .apply(StoreAction::ConversationPageRefreshed {
                conversation_id,
                messages: page.messages,
            })
            .await;
        Ok(())
    }
}
