//! Single-active-page lease. Several pages may run the pipeline; only the
//! lease holder moderates.

use crate::settings::{SettingsStore, TabLease};
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How often the holder refreshes its lease.
pub const LEASE_HEARTBEAT: std::time::Duration = std::time::Duration::from_secs(10);

/// A lease older than this is up for grabs.
pub fn lease_timeout() -> Duration {
    Duration::seconds(15)
}

pub struct TabActivation {
    tab_id: String,
    store: Arc<dyn SettingsStore>,
    active: AtomicBool,
}

impl TabActivation {
    pub fn new(tab_id: impl Into<String>, store: Arc<dyn SettingsStore>) -> Self {
        Self {
            tab_id: tab_id.into(),
            store,
            active: AtomicBool::new(false),
        }
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Take the lease if it is free or expired; otherwise follow it.
    pub fn check(&self, now: DateTime<Utc>) -> bool {
        match self.store.lease() {
            None => self.become_active(now),
            Some(lease) if now - lease.last_heartbeat > lease_timeout() => {
                log::info!("Lease of {} expired, taking over", lease.active_id);
                self.become_active(now)
            }
            Some(lease) if lease.active_id == self.tab_id => {
                self.active.store(true, Ordering::SeqCst);
                log::debug!("This page is active ({})", self.tab_id);
            }
            Some(lease) => {
                self.active.store(false, Ordering::SeqCst);
                log::info!("This page is dormant - active page: {}", lease.active_id);
            }
        }
        self.is_active()
    }

    pub fn force_activate(&self, now: DateTime<Utc>) {
        log::info!("Forcing this page active ({})", self.tab_id);
        self.become_active(now);
    }

    fn become_active(&self, now: DateTime<Utc>) {
        self.store.save_lease(TabLease {
            active_id: self.tab_id.clone(),
            last_heartbeat: now,
        });
        self.active.store(true, Ordering::SeqCst);
        log::info!("Became the active page ({})", self.tab_id);
    }

    /// Refresh the lease. A page that lost the lease goes dormant.
    pub fn heartbeat(&self, now: DateTime<Utc>) {
        if !self.is_active() {
            return;
        }
        match self.store.lease() {
            Some(lease) if lease.active_id != self.tab_id => {
                log::info!("Lease taken by {}, going dormant", lease.active_id);
                self.active.store(false, Ordering::SeqCst);
            }
            _ => self.store.save_lease(TabLease {
                active_id: self.tab_id.clone(),
                last_heartbeat: now,
            }),
        }
    }

    /// Pages that never coordinate (view mode) act as active.
    pub fn assume_active(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MemorySettingsStore;

    fn pair() -> (TabActivation, TabActivation) {
        let store: Arc<dyn SettingsStore> = Arc::new(MemorySettingsStore::default());
        (
            TabActivation::new("tab-a", store.clone()),
            TabActivation::new("tab-b", store),
        )
    }

    #[test]
    fn test_first_page_takes_lease() {
        let (a, b) = pair();
        let now = Utc::now();
        assert!(a.check(now));
        assert!(!b.check(now + Duration::seconds(5)));
        assert!(a.check(now + Duration::seconds(5)));
    }

    #[test]
    fn test_expired_lease_moves() {
        let (a, b) = pair();
        let now = Utc::now();
        a.check(now);
        assert!(b.check(now + Duration::seconds(16)));
        a.heartbeat(now + Duration::seconds(17));
        assert!(!a.is_active());
    }

    #[test]
    fn test_heartbeat_keeps_lease() {
        let (a, b) = pair();
        let now = Utc::now();
        a.check(now);
        a.heartbeat(now + Duration::seconds(10));
        assert!(!b.check(now + Duration::seconds(20)));
    }

    #[test]
    fn test_force_activate() {
        let (a, b) = pair();
        let now = Utc::now();
        a.check(now);
        b.force_activate(now);
        assert!(b.is_active());
        assert!(!a.check(now));
    }
}
