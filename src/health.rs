//! Chat liveness: a reference to the newest legitimate message and a
//! reload when that reference silently disappears.

use crate::discovery::MessageDiscovery;
use crate::page::{ChatPage, MessageId};
use crate::settings::LiveSettings;
use crate::triggers::truncate_chars;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

pub const MONITOR_INTERVAL: Duration = Duration::from_secs(5);
/// Monitor ticks between liveness checks.
pub const HEALTH_EVERY_TICKS: u32 = 6;
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
pub const HEARTBEAT_PREFIX_CHARS: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub id: MessageId,
    pub text_prefix: String,
    pub seen_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    /// No reference yet; one was looked for.
    NoHeartbeat,
    Healthy,
    /// Reference vanished recently; give the feed more time.
    Grace,
    ReloadRequested,
    /// Already reloaded for this reference.
    ReloadSuppressed,
}

#[derive(Default)]
struct HealthState {
    heartbeat: Option<Heartbeat>,
    reload_requested: bool,
}

pub struct HealthMonitor {
    page: Arc<dyn ChatPage>,
    discovery: Arc<MessageDiscovery>,
    live: Arc<LiveSettings>,
    state: Mutex<HealthState>,
}

impl HealthMonitor {
    pub fn new(
        page: Arc<dyn ChatPage>,
        discovery: Arc<MessageDiscovery>,
        live: Arc<LiveSettings>,
    ) -> Self {
        Self {
            page,
            discovery,
            live,
            state: Mutex::new(HealthState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, HealthState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn heartbeat(&self) -> Option<Heartbeat> {
        self.state().heartbeat.clone()
    }

    /// Point the heartbeat at the newest message that is not spam. Keeps
    /// the previous one when every message matches.
    pub fn refresh_heartbeat(&self) -> Option<Heartbeat> {
        let messages = self.discovery.all_messages();
        let newest = messages.iter().rev().find_map(|id| {
            let text = self.discovery.message_text(id)?;
            if self.live.is_spam(&text) {
                log::trace!(
                    "Skipping spam message as heartbeat: \"{}\"",
                    truncate_chars(&text, 30)
                );
                return None;
            }
            Some((id.clone(), text))
        });

        let mut state = self.state();
        match newest {
            Some((id, text)) => {
                let changed = state.heartbeat.as_ref().map(|hb| &hb.id) != Some(&id);
                if changed {
                    log::debug!(
                        "Heartbeat now \"{}\" ({id})",
                        truncate_chars(&text, HEARTBEAT_PREFIX_CHARS)
                    );
                    state.heartbeat = Some(Heartbeat {
                        id,
                        text_prefix: truncate_chars(&text, HEARTBEAT_PREFIX_CHARS).to_string(),
                        seen_at: Instant::now(),
                    });
                    state.reload_requested = false;
                } else if let Some(hb) = state.heartbeat.as_mut() {
                    hb.seen_at = Instant::now();
                }
            }
            None => log::debug!("No non-spam messages found - keeping previous heartbeat"),
        }
        state.heartbeat.clone()
    }

    /// Drop the heartbeat when the current rules would classify it as spam.
    fn revalidate(&self) {
        let stale = {
            let state = self.state();
            match &state.heartbeat {
                Some(hb) => {
                    let text = self
                        .discovery
                        .message_text(&hb.id)
                        .unwrap_or_else(|| hb.text_prefix.clone());
                    self.live.is_spam(&text)
                }
                None => false,
            }
        };
        if stale {
            log::debug!("Heartbeat matches the current triggers, recomputing");
            self.state().heartbeat = None;
            self.refresh_heartbeat();
        }
    }

    /// Liveness check, run every [`HEALTH_CHECK_INTERVAL`].
    pub fn check(&self) -> HealthVerdict {
        self.revalidate();
        let heartbeat = match self.heartbeat() {
            Some(hb) => hb,
            None => {
                self.refresh_heartbeat();
                return HealthVerdict::NoHeartbeat;
            }
        };

        if self.page.message_exists(&heartbeat.id) {
            log::debug!("Chat health OK - \"{}\" still present", heartbeat.text_prefix);
            self.refresh_heartbeat();
            return HealthVerdict::Healthy;
        }

        let age = heartbeat.seen_at.elapsed();
        if age < HEALTH_CHECK_INTERVAL {
            return HealthVerdict::Grace;
        }

        let mut state = self.state();
        if state.reload_requested {
            log::debug!("Chat still dead, reload already requested");
            return HealthVerdict::ReloadSuppressed;
        }
        state.reload_requested = true;
        drop(state);

        log::warn!(
            "Chat died: heartbeat from {}s ago disappeared: \"{}\"; reloading page",
            age.as_secs(),
            heartbeat.text_prefix
        );
        self.discovery.invalidate();
        self.page.reload();
        HealthVerdict::ReloadRequested
    }

    pub fn reset(&self) {
        *self.state() = HealthState::default();
    }
}
