//! In-memory conversation backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chat_stream::client::{ApiError, ConversationApi, HistoryPage};
use chat_stream::model::{Conversation, ConversationId};
use chat_stream::protocol::WireMessage;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Serves history pages per conversation. Page `n` is requested with
/// cursor `"n"`; the first page has no cursor.
#[derive(Default)]
pub struct FakeConversationApi {
    next_id: AtomicU64,
    histories: Mutex<HashMap<ConversationId, Vec<Vec<WireMessage>>>>,
    fetches: Mutex<Vec<(ConversationId, Option<String>)>>,
    deleted: Mutex<Vec<ConversationId>>,
    /// Pages at or past this index wait for `release`
    hold_from: Mutex<Option<usize>>,
    release: Arc<Notify>,
}

impl FakeConversationApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(self, id: &str, pages: Vec<Vec<WireMessage>>) -> Self {
        self.histories.lock().insert(ConversationId::from(id), pages);
        self
    }

    pub fn hold_pages_from(&self, index: usize) {
        *self.hold_from.lock() = Some(index);
    }

    pub fn release_pages(&self) {
        *self.hold_from.lock() = None;
        self.release.notify_waiters();
    }

    pub fn fetches(&self) -> Vec<(ConversationId, Option<String>)> {
        self.fetches.lock().clone()
    }

    pub fn fetch_count(&self, id: &str) -> usize {
        self.fetches
            .lock()
            .iter()
            .filter(|(fetched, _)| fetched.as_str() == id)
            .count()
    }

    pub fn deleted(&self) -> Vec<ConversationId> {
        self.deleted.lock().clone()
    }
}

#[async_trait]
impl ConversationApi for FakeConversationApi {
    async fn create_conversation(&self, title: Option<String>) -> Result<Conversation, ApiError> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Conversation::new(
            ConversationId::from(format!("conv-{n}").as_str()),
            title.unwrap_or_default(),
        ))
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<(), ApiError> {
        self.deleted.lock().push(id.clone());
        self.histories.lock().remove(id);
        Ok(())
    }

    async fn fetch_history(
        &self,
        id: &ConversationId,
        cursor: Option<&str>,
        _limit: usize,
    ) -> Result<HistoryPage, ApiError> {
        self.fetches
            .lock()
            .push((id.clone(), cursor.map(str::to_string)));
        let index: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);

        loop {
            // Register before checking so a release in between is not missed.
            let released = self.release.notified();
            let held = self.hold_from.lock().is_some_and(|from| index >= from);
            if !held {
                break;
            }
            released.await;
        }

        let histories = self.histories.lock();
        let Some(pages) = histories.get(id) else {
            return Ok(HistoryPage::default());
        };
        let messages = pages.get(index).cloned().unwrap_or_default();
        let next_cursor = (index + 1 < pages.len()).then(|| (index + 1).to_string());
        Ok(HistoryPage {
            messages,
            next_cursor,
            ..HistoryPage::default()
        })
    }
}
