//! Settings provider seam and the in-process view of the current settings.

use crate::config::{BlockFlag, ModerationMode, Settings};
use crate::triggers::{TriggerError, TriggerSet};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq)]
pub enum SettingsChange {
    Enabled(bool),
    Mode(ModerationMode),
    Triggers(Vec<String>),
    NetworkBlocked(Option<BlockFlag>),
}

/// Which page instance currently holds the moderation lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabLease {
    pub active_id: String,
    pub last_heartbeat: DateTime<Utc>,
}

/// Persisted settings shared with the settings UI.
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Settings;

    fn save_enabled(&self, enabled: bool);

    fn save_mode(&self, mode: ModerationMode);

    fn save_triggers(&self, rules: Vec<String>);

    fn save_network_blocked(&self, flag: Option<BlockFlag>);

    fn subscribe(&self) -> broadcast::Receiver<SettingsChange>;

    fn lease(&self) -> Option<TabLease>;

    fn save_lease(&self, lease: TabLease);
}

pub struct MemorySettingsStore {
    settings: Mutex<Settings>,
    lease: Mutex<Option<TabLease>>,
    changes: broadcast::Sender<SettingsChange>,
}

impl MemorySettingsStore {
    pub fn new(settings: Settings) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            settings: Mutex::new(settings),
            lease: Mutex::new(None),
            changes,
        }
    }

    fn settings(&self) -> MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, change: SettingsChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }
}

impl Default for MemorySettingsStore {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Settings {
        self.settings().clone()
    }

    fn save_enabled(&self, enabled: bool) {
        self.settings().enabled = enabled;
        self.publish(SettingsChange::Enabled(enabled));
    }

    fn save_mode(&self, mode: ModerationMode) {
        self.settings().mode = mode;
        self.publish(SettingsChange::Mode(mode));
    }

    fn save_triggers(&self, rules: Vec<String>) {
        self.settings().trigger_rules = rules.clone();
        self.publish(SettingsChange::Triggers(rules));
    }

    fn save_network_blocked(&self, flag: Option<BlockFlag>) {
        self.settings().network_blocked = flag.clone();
        self.publish(SettingsChange::NetworkBlocked(flag));
    }

    fn subscribe(&self) -> broadcast::Receiver<SettingsChange> {
        self.changes.subscribe()
    }

    fn lease(&self) -> Option<TabLease> {
        self.lease.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn save_lease(&self, lease: TabLease) {
        *self.lease.lock().unwrap_or_else(PoisonError::into_inner) = Some(lease);
    }
}

/// Settings as currently applied by this page instance.
pub struct LiveSettings {
    enabled: AtomicBool,
    mode: RwLock<ModerationMode>,
    triggers: RwLock<TriggerSet>,
}

impl LiveSettings {
    pub fn from_settings(settings: &Settings) -> Result<Self, TriggerError> {
        Ok(Self {
            enabled: AtomicBool::new(settings.enabled),
            mode: RwLock::new(settings.mode),
            triggers: RwLock::new(TriggerSet::parse(&settings.trigger_rules.join("\n"))?),
        })
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn mode(&self) -> ModerationMode {
        *self.mode.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the previous mode.
    pub fn set_mode(&self, mode: ModerationMode) -> ModerationMode {
        let mut current = self.mode.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, mode)
    }

    pub fn set_triggers(&self, triggers: TriggerSet) {
        *self.triggers.write().unwrap_or_else(PoisonError::into_inner) = triggers;
    }

    pub fn is_spam(&self, text: &str) -> bool {
        self.triggers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_spam(text)
    }

    pub fn find_match(&self, text: &str) -> Option<String> {
        self.triggers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .find_match(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_publishes_changes() {
        let store = MemorySettingsStore::default();
        let mut rx = store.subscribe();

        store.save_mode(ModerationMode::Remove);
        store.save_enabled(false);

        assert_eq!(rx.try_recv().unwrap(), SettingsChange::Mode(ModerationMode::Remove));
        assert_eq!(rx.try_recv().unwrap(), SettingsChange::Enabled(false));
        let loaded = store.load();
        assert_eq!(loaded.mode, ModerationMode::Remove);
        assert!(!loaded.enabled);
    }

    #[test]
    fn test_store_keeps_lease() {
        let store = MemorySettingsStore::default();
        assert!(store.lease().is_none());
        let lease = TabLease {
            active_id: "tab-a".into(),
            last_heartbeat: Utc::now(),
        };
        store.save_lease(lease.clone());
        assert_eq!(store.lease(), Some(lease));
    }

    #[test]
    fn test_live_settings() {
        let live = LiveSettings::from_settings(&Settings::default()).unwrap();
        assert!(live.enabled());
        assert_eq!(live.set_mode(ModerationMode::Label), ModerationMode::View);
        assert_eq!(live.mode(), ModerationMode::Label);
        assert!(live.is_spam("join STOPRUGS today"));
        assert_eq!(live.find_match("@rugger hi").as_deref(), Some("@*rug*"));

        live.set_triggers(TriggerSet::from_patterns(["hello"]).unwrap());
        assert!(!live.is_spam("join stoprugs today"));
        assert!(live.is_spam("Hello there"));
    }

    #[test]
    fn test_live_settings_reject_bad_rules() {
        let settings = Settings {
            trigger_rules: vec!["ok".into()],
            ..Default::default()
        };
        assert!(LiveSettings::from_settings(&settings).is_ok());
    }

    #[test]
    fn test_blank_stored_triggers_load_defaults() {
        let settings = Settings {
            trigger_rules: vec!["".into(), "# old list".into()],
            ..Default::default()
        };
        let live = LiveSettings::from_settings(&settings).unwrap();
        assert_eq!(
            live.find_match("FULL bundle, bundled again, dont buy").as_deref(),
            Some("full*bundled*dont*buy")
        );
        assert!(!live.is_spam("gm everyone"));
    }
}
