//! The moderation engine: one [`AutoMod`] per chat page.

use crate::activation::{TabActivation, LEASE_HEARTBEAT};
use crate::commands::{Command, CommandResponse};
use crate::config::ModerationMode;
use crate::discovery::MessageDiscovery;
use crate::health::{HealthMonitor, HealthVerdict, HEALTH_EVERY_TICKS, MONITOR_INTERVAL};
use crate::moderation::api::ModerationEndpoint;
use crate::moderation::ModerationExecutor;
use crate::page::{ChatPage, PageMutation, ProcessedMark};
use crate::scheduler::Scheduler;
use crate::settings::{LiveSettings, SettingsChange, SettingsStore};
use crate::statistics::{StatEvent, StatisticsCollector};
use crate::triggers::{TriggerError, TriggerSet};
use chrono::Utc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Delay before a forced rescan walks the page.
pub const FORCE_RESCAN_DELAY: Duration = Duration::from_millis(500);
/// Delay between reloading triggers and the forced rescan.
pub const TRIGGER_RESCAN_DELAY: Duration = Duration::from_millis(1000);

pub struct AutoMod {
    page: Arc<dyn ChatPage>,
    store: Arc<dyn SettingsStore>,
    live: Arc<LiveSettings>,
    discovery: Arc<MessageDiscovery>,
    executor: Arc<ModerationExecutor>,
    health: Arc<HealthMonitor>,
    activation: Arc<TabActivation>,
    scheduler: Arc<Scheduler>,
    stats: Arc<StatisticsCollector>,
    /// Cancelled on disable; a fresh one per enabled period.
    session: Mutex<CancellationToken>,
    shutdown: CancellationToken,
}

impl AutoMod {
    pub fn new(
        page: Arc<dyn ChatPage>,
        store: Arc<dyn SettingsStore>,
        endpoint: Option<Arc<dyn ModerationEndpoint>>,
        ban_reason_label: String,
        tab_id: impl Into<String>,
    ) -> Result<Arc<Self>, TriggerError> {
        let settings = store.load();
        let live = Arc::new(LiveSettings::from_settings(&settings)?);
        let discovery = Arc::new(MessageDiscovery::new(page.clone()));
        let executor = Arc::new(ModerationExecutor::new(
            page.clone(),
            endpoint,
            store.clone(),
            ban_reason_label,
        ));
        let health = Arc::new(HealthMonitor::new(page.clone(), discovery.clone(), live.clone()));
        let activation = Arc::new(TabActivation::new(tab_id, store.clone()));
        let stats = Arc::new(StatisticsCollector::new());
        let scheduler = Arc::new(Scheduler::new(
            page.clone(),
            discovery.clone(),
            live.clone(),
            executor.clone(),
            health.clone(),
            activation.clone(),
            stats.clone(),
        ));
        let shutdown = CancellationToken::new();

        Ok(Arc::new(Self {
            page,
            store,
            live,
            discovery,
            executor,
            health,
            activation,
            scheduler,
            stats,
            session: Mutex::new(shutdown.child_token()),
            shutdown,
        }))
    }

    pub fn live(&self) -> &LiveSettings {
        &self.live
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn stats(&self) -> &StatisticsCollector {
        &self.stats
    }

    pub fn activation(&self) -> &TabActivation {
        &self.activation
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    fn session(&self) -> CancellationToken {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Begin listening for settings changes and, when enabled, moderating.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let mut changes = self.store.subscribe();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    change = changes.recv() => match change {
                        Ok(change) => this.apply_change(change),
                        Err(RecvError::Lagged(missed)) => {
                            log::warn!("Missed {missed} settings change(s), reloading settings");
                            this.resync();
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });

        if self.live.enabled() {
            log::info!("Active (mode={})", self.live.mode());
            self.enable(false);
        } else {
            log::info!("Disabled (toggle in settings to enable)");
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.scheduler.disable();
    }

    fn enable(self: &Arc<Self>, scan_in_view: bool) {
        let token = self.shutdown.child_token();
        {
            let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            session.cancel();
            *session = token.clone();
        }
        self.scheduler.enable(token.clone());

        if self.live.mode() == ModerationMode::View {
            // No coordination, no monitoring, no page-visible activity.
            self.activation.assume_active();
            tokio::spawn(self.clone().observe(token.clone()));
            if scan_in_view {
                self.spawn_full_scan(token, Duration::ZERO);
            }
            return;
        }

        log::info!("Moderator mode ({}): starting full systems", self.live.mode());
        self.activation.check(Utc::now());
        self.spawn_full_scan(token.clone(), Duration::ZERO);
        tokio::spawn(self.clone().observe(token.clone()));
        tokio::spawn(self.clone().monitor(token.clone()));
        tokio::spawn(self.clone().keep_lease(token));
    }

    fn disable(&self) {
        self.session().cancel();
        self.scheduler.disable();
        self.activation.deactivate();
        self.health.reset();
        log::info!("Disabled - stopped all operations");
    }

    fn restart(self: &Arc<Self>) {
        self.disable();
        self.enable(true);
    }

    fn spawn_full_scan(self: &Arc<Self>, token: CancellationToken, delay: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(delay) => {
                    let ids = this.discovery.force_refresh();
                    let total = ids.len();
                    let spam = this.scheduler.scan_in_chunks(ids).await;
                    log::debug!("Scanned {total} message(s), {spam} spam");
                }
            }
        });
    }

    async fn observe(self: Arc<Self>, token: CancellationToken) {
        let mut mutations = self.page.observe();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                batch = mutations.recv() => match batch {
                    Some(batch) => self.on_mutations(&batch),
                    None => break,
                },
            }
        }
    }

    fn on_mutations(self: &Arc<Self>, batch: &[PageMutation]) {
        for candidate in self.discovery.resolve_mutations(batch) {
            if candidate.text_changed
                && self.page.processed_mark(&candidate.id) == Some(ProcessedMark::Clean)
            {
                self.page.set_processed_mark(&candidate.id, None);
            }
            self.scheduler.process_message(&candidate.id);
        }
    }

    async fn monitor(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = interval(MONITOR_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        self.health.refresh_heartbeat();

        let mut ticks = 0;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    ticks += 1;
                    let run_health = ticks >= HEALTH_EVERY_TICKS;
                    if run_health {
                        ticks = 0;
                    }
                    self.monitor_tick(run_health);
                }
            }
        }
    }

    fn monitor_tick(self: &Arc<Self>, run_health: bool) {
        if !self.live.enabled() {
            return;
        }
        if self.scheduler.is_idle() && self.activation.is_active() {
            self.scheduler.rescan_unprocessed();
        }
        if run_health && self.health.check() == HealthVerdict::ReloadRequested {
            self.stats.record_event(StatEvent::PageReloaded);
        }
    }

    async fn keep_lease(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = interval(LEASE_HEARTBEAT);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let now = Utc::now();
                    if self.activation.is_active() {
                        self.activation.heartbeat(now);
                    } else if self.activation.check(now) {
                        self.spawn_full_scan(token.clone(), Duration::ZERO);
                    }
                }
            }
        }
    }

    fn clear_marks(&self, clear_highlights: bool) -> usize {
        let marked = self.page.processed_messages();
        for id in &marked {
            self.page.set_processed_mark(id, None);
            if clear_highlights {
                self.page.clear_highlight(id);
            }
        }
        marked.len()
    }

    fn apply_change(self: &Arc<Self>, change: SettingsChange) {
        match change {
            SettingsChange::Enabled(enabled) => {
                if enabled == self.live.enabled() {
                    return;
                }
                self.live.set_enabled(enabled);
                if enabled {
                    log::info!("Enabled (mode={})", self.live.mode());
                    self.enable(true);
                } else {
                    self.disable();
                }
            }
            SettingsChange::Mode(mode) => {
                let old = self.live.set_mode(mode);
                if old == mode {
                    return;
                }
                let cleared = self.clear_marks(old == ModerationMode::Label);
                self.scheduler.clear_queue();
                log::info!("Mode changed from {old} to {mode}, cleared {cleared} processed flag(s)");
                if !self.live.enabled() {
                    return;
                }
                if (old == ModerationMode::View) != (mode == ModerationMode::View) {
                    self.restart();
                } else {
                    self.spawn_full_scan(self.session(), Duration::ZERO);
                }
            }
            SettingsChange::Triggers(rules) => match TriggerSet::parse(&rules.join("\n")) {
                Ok(triggers) => {
                    log::info!("Triggers updated ({} rule(s)), re-evaluating messages", triggers.len());
                    self.live.set_triggers(triggers);
                    self.clear_marks(true);
                    self.discovery.invalidate();
                    if self.live.enabled() {
                        self.scheduler.rescan_unprocessed();
                    }
                }
                Err(e) => log::error!("Ignoring trigger update: {e}"),
            },
            SettingsChange::NetworkBlocked(flag) => self.executor.sync_block_flag(flag),
        }
    }

    fn resync(self: &Arc<Self>) {
        let settings = self.store.load();
        self.apply_change(SettingsChange::Triggers(settings.trigger_rules));
        self.apply_change(SettingsChange::Mode(settings.mode));
        self.apply_change(SettingsChange::NetworkBlocked(settings.network_blocked));
        self.apply_change(SettingsChange::Enabled(settings.enabled));
    }

    /// Clear every processed flag and highlight, then rescan the page.
    pub fn force_rescan(self: &Arc<Self>) {
        let cleared = self.clear_marks(true);
        self.discovery.invalidate();
        log::info!("Force rescan: cleared {cleared} processed flag(s)");
        self.spawn_full_scan(self.session(), FORCE_RESCAN_DELAY);
    }

    pub fn handle_command(self: &Arc<Self>, command: Command) -> CommandResponse {
        if self.live.mode() == ModerationMode::View && command != Command::GetTabStatus {
            log::debug!("Ignoring {command:?} in view mode");
            return CommandResponse::Ignored;
        }

        match command {
            Command::GetTabStatus => CommandResponse::TabStatus {
                is_active: self.activation.is_active(),
                tab_id: self.activation.tab_id().to_string(),
                mode: self.live.mode(),
            },
            Command::ForceActivate => {
                let was_active = self.activation.is_active();
                self.activation.force_activate(Utc::now());
                if !was_active && self.live.enabled() {
                    self.spawn_full_scan(self.session(), Duration::ZERO);
                }
                CommandResponse::Success
            }
            Command::TriggersUpdated => {
                let rules = self.store.load().trigger_rules;
                match TriggerSet::parse(&rules.join("\n")) {
                    Ok(triggers) => {
                        log::info!("Triggers reloaded from settings ({} rule(s))", triggers.len());
                        self.live.set_triggers(triggers);
                        let this = self.clone();
                        let token = self.session();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = token.cancelled() => {}
                                _ = sleep(TRIGGER_RESCAN_DELAY) => this.force_rescan(),
                            }
                        });
                        CommandResponse::Success
                    }
                    Err(e) => CommandResponse::Failed {
                        error: e.to_string(),
                    },
                }
            }
            Command::ForceRescan => {
                self.force_rescan();
                CommandResponse::Success
            }
            Command::GetNetworkStats => CommandResponse::NetworkStats(self.executor.network_stats()),
            Command::ResetBlockFlag => {
                self.executor.reset_block_flag();
                CommandResponse::Success
            }
        }
    }
}
