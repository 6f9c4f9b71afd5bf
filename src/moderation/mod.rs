//! Acting on spam: hide, highlight, delete or ban.
//!
//! Destructive actions try the host API first and fall back to driving the
//! host's own moderation menu. The host exposes a single moderation call
//! keyed by the sender's address; it decides whether that deletes or bans.
//! A failed ban falls back to deleting the message so the spam is at least
//! gone.

pub mod api;
pub mod guard;
pub mod ui;

use crate::config::{BlockFlag, ModerationMode};
use crate::page::{ChatPage, MessageId, PageError};
use crate::settings::SettingsStore;
use api::ModerationEndpoint;
use guard::{NetworkGuard, NetworkStats};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use ui::UiAutomation;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModerationError {
    #[error("No visible moderation menu trigger on the message")]
    KebabNotFound,
    #[error("Menu item \"{0}\" not found")]
    MenuItemNotFound(String),
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Permission denied by the host")]
    PermissionDenied,
    #[error("Rate limited by the host")]
    RateLimited,
    #[error("Blocked by edge protection: {0}")]
    Blocked(String),
    #[error("Network moderation unavailable: {0}")]
    Unavailable(String),
    #[error("Element went away mid-action: {0}")]
    Detached(String),
    #[error("Moderation action timed out")]
    TimedOut,
}

impl From<PageError> for ModerationError {
    fn from(e: PageError) -> Self {
        ModerationError::Detached(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionMethod {
    /// Page-local change (hide, highlight).
    Local,
    Api,
    Ui,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModerationOutcome {
    pub succeeded: bool,
    pub method: Option<ActionMethod>,
    pub failure: Option<ModerationError>,
    /// The ban failed and the message was deleted instead.
    pub via_fallback: bool,
}

impl ModerationOutcome {
    pub fn success(method: ActionMethod, via_fallback: bool) -> Self {
        Self {
            succeeded: true,
            method: Some(method),
            failure: None,
            via_fallback,
        }
    }

    pub fn failure(error: ModerationError, via_fallback: bool) -> Self {
        Self {
            succeeded: false,
            method: None,
            failure: Some(error),
            via_fallback,
        }
    }
}

/// Last path segment of a `/profile/{address}` link.
pub fn address_from_profile_href(href: &str) -> Option<String> {
    let path = href.split(['?', '#']).next().unwrap_or(href);
    let (_, rest) = path.split_once("/profile/")?;
    rest.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}

pub struct ModerationExecutor {
    page: Arc<dyn ChatPage>,
    ui: UiAutomation,
    endpoint: Option<Arc<dyn ModerationEndpoint>>,
    guard: Mutex<NetworkGuard>,
    store: Arc<dyn SettingsStore>,
    ban_reason_label: String,
}

impl ModerationExecutor {
    pub fn new(
        page: Arc<dyn ChatPage>,
        endpoint: Option<Arc<dyn ModerationEndpoint>>,
        store: Arc<dyn SettingsStore>,
        ban_reason_label: String,
    ) -> Self {
        let guard = NetworkGuard::with_block(store.load().network_blocked);
        Self {
            ui: UiAutomation::new(page.clone()),
            page,
            endpoint,
            guard: Mutex::new(guard),
            store,
            ban_reason_label,
        }
    }

    fn guard(&self) -> MutexGuard<'_, NetworkGuard> {
        self.guard.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn execute(&self, id: &MessageId, mode: ModerationMode) -> ModerationOutcome {
        match mode {
            ModerationMode::View => {
                self.page.hide(id);
                ModerationOutcome::success(ActionMethod::Local, false)
            }
            ModerationMode::Label => {
                self.page.highlight(id);
                ModerationOutcome::success(ActionMethod::Local, false)
            }
            ModerationMode::Remove => self.remove(id).await,
            ModerationMode::Exclude => self.exclude(id).await,
        }
    }

    /// Moderation call for the sender of `id`, resolved from the profile link.
    async fn moderate_sender(&self, id: &MessageId) -> Result<(), ModerationError> {
        let endpoint = self
            .endpoint
            .clone()
            .ok_or_else(|| ModerationError::Unavailable("no API configured".into()))?;
        let address = self
            .page
            .sender_profile_href(id)
            .and_then(|href| address_from_profile_href(&href))
            .ok_or_else(|| ModerationError::Unavailable("no sender address".into()))?;
        self.call_network(|| async move { endpoint.ban_user(&address).await })
            .await
    }

    async fn remove(&self, id: &MessageId) -> ModerationOutcome {
        match self.moderate_sender(id).await {
            Ok(()) => {
                log::info!("Removed message {id} via API");
                return ModerationOutcome::success(ActionMethod::Api, false);
            }
            Err(e) => log::debug!("API removal of {id} not used: {e}"),
        }
        self.delete_via_menu(id, false).await
    }

    async fn delete_via_menu(&self, id: &MessageId, via_fallback: bool) -> ModerationOutcome {
        match self.ui.delete(id).await {
            Ok(()) => ModerationOutcome::success(ActionMethod::Ui, via_fallback),
            Err(e) => {
                log::warn!("Delete of {id} failed: {e}");
                ModerationOutcome::failure(e, via_fallback)
            }
        }
    }

    async fn exclude(&self, id: &MessageId) -> ModerationOutcome {
        match self.moderate_sender(id).await {
            Ok(()) => {
                log::info!("Banned sender of {id} via API");
                return ModerationOutcome::success(ActionMethod::Api, false);
            }
            Err(e) => log::debug!("API ban for {id} not used: {e}"),
        }

        match self.ui.ban(id, &self.ban_reason_label).await {
            Ok(()) => return ModerationOutcome::success(ActionMethod::Ui, false),
            Err(e) => log::warn!("Ban of sender of {id} failed ({e}); deleting the message instead"),
        }

        // The API was just tried for this sender; go straight to the menu.
        self.delete_via_menu(id, true).await
    }

    async fn call_network<F, Fut>(&self, call: F) -> Result<(), ModerationError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), ModerationError>>,
    {
        {
            let mut guard = self.guard();
            guard.check(Instant::now())?;
            guard.record_attempt();
        }
        let result = call().await;
        let newly_blocked = {
            let mut guard = self.guard();
            match &result {
                Ok(()) => {
                    guard.record_success();
                    None
                }
                Err(e) => {
                    log::warn!("Moderation API call failed: {e}");
                    guard.record_failure(e, Instant::now())
                }
            }
        };
        if let Some(flag) = newly_blocked {
            self.store.save_network_blocked(Some(flag));
        }
        result
    }

    pub fn network_stats(&self) -> NetworkStats {
        self.guard().stats(Instant::now())
    }

    /// Clear the block flag in memory and in the store.
    pub fn reset_block_flag(&self) {
        self.guard().reset_block();
        self.store.save_network_blocked(None);
        log::info!("Network block flag cleared");
    }

    /// Apply a block flag changed elsewhere.
    pub fn sync_block_flag(&self, flag: Option<BlockFlag>) {
        self.guard().set_block(flag);
    }
}
