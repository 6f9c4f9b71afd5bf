use crate::page::{ChatPage, MessageId, PageMutation};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// How long a full message listing is reused.
pub const CACHE_DURATION: Duration = Duration::from_secs(1);

/// A message touched by a mutation batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: MessageId,
    /// Its text changed, as opposed to only being inserted.
    pub text_changed: bool,
}

struct CachedListing {
    taken_at: Instant,
    ids: Vec<MessageId>,
}

pub struct MessageDiscovery {
    page: Arc<dyn ChatPage>,
    cache: Mutex<Option<CachedListing>>,
}

impl MessageDiscovery {
    pub fn new(page: Arc<dyn ChatPage>) -> Self {
        Self {
            page,
            cache: Mutex::new(None),
        }
    }

    fn cache(&self) -> MutexGuard<'_, Option<CachedListing>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every message on the page, in document order.
    pub fn all_messages(&self) -> Vec<MessageId> {
        let mut cache = self.cache();
        if let Some(listing) = cache.as_ref() {
            if listing.taken_at.elapsed() < CACHE_DURATION {
                return listing.ids.clone();
            }
        }
        let ids = self.page.list_messages();
        *cache = Some(CachedListing {
            taken_at: Instant::now(),
            ids: ids.clone(),
        });
        ids
    }

    pub fn force_refresh(&self) -> Vec<MessageId> {
        self.invalidate();
        self.all_messages()
    }

    pub fn invalidate(&self) {
        *self.cache() = None;
    }

    /// Messages without a processed mark.
    pub fn unprocessed_messages(&self) -> Vec<MessageId> {
        self.all_messages()
            .into_iter()
            .filter(|id| self.page.processed_mark(id).is_none())
            .collect()
    }

    /// Map a mutation batch to the messages it touched, first-seen order,
    /// each at most once.
    pub fn resolve_mutations(&self, batch: &[PageMutation]) -> Vec<Candidate> {
        let mut found: Vec<Candidate> = Vec::new();
        let mut index: HashMap<MessageId, usize> = HashMap::new();
        let mut push = |id: MessageId, text_changed: bool| match index.get(&id) {
            Some(&at) => found[at].text_changed |= text_changed,
            None => {
                index.insert(id.clone(), found.len());
                found.push(Candidate { id, text_changed });
            }
        };

        for mutation in batch {
            match *mutation {
                PageMutation::NodeAdded(node) => {
                    if let Some(id) = self.page.enclosing_message(node) {
                        push(id, false);
                    }
                    for id in self.page.nested_messages(node) {
                        push(id, false);
                    }
                }
                PageMutation::TextChanged(node) => {
                    if let Some(id) = self.page.enclosing_message(node) {
                        push(id, true);
                    }
                }
            }
        }

        if !found.is_empty() {
            self.invalidate();
        }
        found
    }

    /// Body text with whitespace collapsed, or the whole element text when
    /// the message has no body element.
    pub fn message_text(&self, id: &MessageId) -> Option<String> {
        let body = self
            .page
            .message_body_text(id)
            .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|text| !text.is_empty());
        body.or_else(|| self.page.message_text(id).map(|t| t.trim().to_string()))
    }
}
