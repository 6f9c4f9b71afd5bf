//! Classification hand-off and the moderation queue.
//!
//! Spam found on the page is queued with the mode active at that moment.
//! Queued messages are drained after a short debounce, or immediately once
//! a batch is full. Destructive actions run strictly one at a time; a
//! single busy flag guards the drain.

use crate::activation::TabActivation;
use crate::config::ModerationMode;
use crate::discovery::MessageDiscovery;
use crate::health::HealthMonitor;
use crate::moderation::{ActionMethod, ModerationError, ModerationExecutor, ModerationOutcome};
use crate::page::{ChatPage, MessageId, ProcessedMark};
use crate::settings::LiveSettings;
use crate::statistics::{StatEvent, StatisticsCollector};
use crate::triggers::truncate_chars;
use log::Level;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

pub const BATCH_DELAY: Duration = Duration::from_millis(1000);
pub const MAX_BATCH_SIZE: usize = 10;
/// Upper bound for one moderation action before the lock is released.
pub const ACTION_TIMEOUT: Duration = Duration::from_secs(10);
/// Delay between the end of a drain cycle and the follow-up rescan.
pub const RESCAN_DELAY: Duration = Duration::from_millis(1500);
/// Pause between consecutive destructive actions.
pub const ACTION_SETTLE: Duration = Duration::from_millis(200);
pub const SCAN_CHUNK_SIZE: usize = 20;
const RECENT_SUMMARY_COUNT: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: MessageId,
    pub mode: ModerationMode,
}

#[derive(Default)]
struct SchedulerState {
    pending: VecDeque<QueueEntry>,
    busy: bool,
    in_flight: Option<MessageId>,
    /// Timer of the current debounce window; replaced on every arrival.
    debounce: Option<CancellationToken>,
    /// Bumped on disable; results from an older generation are dropped.
    generation: u64,
    token: CancellationToken,
}

enum NextStep {
    Wait,
    ArmDebounce(CancellationToken),
    DrainNow,
}

pub struct Scheduler {
    page: Arc<dyn ChatPage>,
    discovery: Arc<MessageDiscovery>,
    live: Arc<LiveSettings>,
    executor: Arc<ModerationExecutor>,
    health: Arc<HealthMonitor>,
    activation: Arc<TabActivation>,
    stats: Arc<StatisticsCollector>,
    state: Mutex<SchedulerState>,
}

fn detection_level(mode: ModerationMode) -> Level {
    if mode == ModerationMode::View {
        Level::Debug
    } else {
        Level::Info
    }
}

impl Scheduler {
    pub fn new(
        page: Arc<dyn ChatPage>,
        discovery: Arc<MessageDiscovery>,
        live: Arc<LiveSettings>,
        executor: Arc<ModerationExecutor>,
        health: Arc<HealthMonitor>,
        activation: Arc<TabActivation>,
        stats: Arc<StatisticsCollector>,
    ) -> Self {
        Self {
            page,
            discovery,
            live,
            executor,
            health,
            activation,
            stats,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn generation(&self) -> u64 {
        self.state().generation
    }

    /// Install the cancellation token for timers of a new enabled period.
    pub fn enable(&self, token: CancellationToken) {
        self.state().token = token;
    }

    /// Drop everything queued, stop timers and release the lock. An action
    /// already running completes, but its result is ignored.
    pub fn disable(&self) {
        let mut state = self.state();
        state.token.cancel();
        let dropped = state.pending.len();
        state.pending.clear();
        state.busy = false;
        state.in_flight = None;
        state.debounce = None;
        state.generation += 1;
        log::debug!("Scheduler disabled, dropped {dropped} queued message(s)");
    }

    /// Forget queued work after a mode change. The in-flight action keeps
    /// running.
    pub fn clear_queue(&self) {
        self.state().pending.clear();
    }

    pub fn is_idle(&self) -> bool {
        let state = self.state();
        !state.busy && state.pending.is_empty()
    }

    pub fn is_busy(&self) -> bool {
        self.state().busy
    }

    pub fn pending_len(&self) -> usize {
        self.state().pending.len()
    }

    /// Classify one message and dispatch it per the current mode. Returns
    /// `Some(is_spam)` when a decision was recorded.
    pub fn process_message(self: &Arc<Self>, id: &MessageId) -> Option<bool> {
        if !self.live.enabled() {
            return None;
        }
        let mode = self.live.mode();
        if mode != ModerationMode::View && !self.activation.is_active() {
            return None;
        }
        if self.page.processed_mark(id).is_some() {
            return None;
        }
        // Streaming messages may render empty first.
        let text = self.discovery.message_text(id).filter(|t| !t.is_empty())?;

        let trigger = self.live.find_match(&text);
        self.stats.record_event(StatEvent::MessageClassified {
            spam: trigger.is_some(),
        });
        let trigger = match trigger {
            Some(trigger) => trigger,
            None => {
                self.page.set_processed_mark(id, Some(ProcessedMark::Clean));
                return Some(false);
            }
        };

        self.page.set_processed_mark(id, Some(ProcessedMark::Flagged));
        log::log!(
            detection_level(mode),
            "Spam {id} matched \"{trigger}\": \"{}\"",
            truncate_chars(&text, 60)
        );
        match mode {
            ModerationMode::View => {
                self.page.hide(id);
                self.stats.record_event(StatEvent::ActionCompleted {
                    mode,
                    outcome: ModerationOutcome::success(ActionMethod::Local, false),
                });
            }
            _ => self.enqueue(id.clone(), mode),
        }
        Some(true)
    }

    /// Queue a flagged message for the drain.
    pub fn enqueue(self: &Arc<Self>, id: MessageId, mode: ModerationMode) {
        let next = {
            let mut state = self.state();
            if state.in_flight.as_ref() == Some(&id) || state.pending.iter().any(|e| e.id == id) {
                log::debug!("{id} already queued");
                return;
            }
            state.pending.push_back(QueueEntry { id, mode });
            if state.busy {
                log::debug!(
                    "Busy, {} message(s) waiting behind the current action",
                    state.pending.len()
                );
                NextStep::Wait
            } else {
                if let Some(previous) = state.debounce.take() {
                    previous.cancel();
                }
                if state.pending.len() >= MAX_BATCH_SIZE {
                    NextStep::DrainNow
                } else {
                    let timer = state.token.child_token();
                    state.debounce = Some(timer.clone());
                    NextStep::ArmDebounce(timer)
                }
            }
        };

        match next {
            NextStep::Wait => {}
            NextStep::DrainNow => {
                tokio::spawn(self.clone().drain());
            }
            NextStep::ArmDebounce(token) => {
                let this = self.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = sleep(BATCH_DELAY) => this.drain().await,
                    }
                });
            }
        }
    }

    /// One drain cycle over everything queued. Runs once the queue has
    /// been quiet for [`BATCH_DELAY`] or holds [`MAX_BATCH_SIZE`] entries.
    pub async fn drain(self: Arc<Self>) {
        let (token, generation) = {
            let mut state = self.state();
            if let Some(timer) = state.debounce.take() {
                timer.cancel();
            }
            if state.busy || state.pending.is_empty() {
                return;
            }
            state.busy = true;
            (state.token.clone(), state.generation)
        };

        let processed = if self.live.mode() == ModerationMode::Label {
            self.drain_labels()
        } else {
            match self.drain_serial(&token, generation).await {
                Some(count) => count,
                None => return,
            }
        };

        {
            let mut state = self.state();
            if state.generation != generation {
                return;
            }
            state.busy = false;
            state.in_flight = None;
        }
        log::debug!("Drain cycle done, {processed} message(s) handled");

        self.health.refresh_heartbeat();
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(RESCAN_DELAY) => {
                    this.rescan_unprocessed();
                }
            }
        });
    }

    fn drain_labels(&self) -> usize {
        let entries: Vec<QueueEntry> = self.state().pending.drain(..).collect();
        let mut highlighted = 0;
        for entry in entries {
            if entry.mode != ModerationMode::Label || !self.page.message_exists(&entry.id) {
                continue;
            }
            let still_spam = self
                .discovery
                .message_text(&entry.id)
                .map(|text| self.live.is_spam(&text))
                .unwrap_or(false);
            if still_spam {
                self.page.highlight(&entry.id);
                self.stats.record_event(StatEvent::ActionCompleted {
                    mode: ModerationMode::Label,
                    outcome: ModerationOutcome::success(ActionMethod::Local, false),
                });
                highlighted += 1;
            } else {
                self.page.set_processed_mark(&entry.id, Some(ProcessedMark::Clean));
            }
        }
        log::info!("Highlighted {highlighted} spam message(s)");
        highlighted
    }

    /// `None` when the scheduler was disabled mid-cycle.
    async fn drain_serial(&self, token: &CancellationToken, generation: u64) -> Option<usize> {
        let mut handled = 0;
        loop {
            let entry = {
                let mut state = self.state();
                if state.generation != generation {
                    return None;
                }
                match state.pending.pop_front() {
                    Some(entry) => {
                        state.in_flight = Some(entry.id.clone());
                        entry
                    }
                    None => break,
                }
            };

            let mode = self.live.mode();
            if entry.mode != mode {
                log::debug!(
                    "Dropping {} queued for {} mode (now {mode})",
                    entry.id,
                    entry.mode
                );
                continue;
            }
            if !self.page.message_exists(&entry.id) {
                log::debug!("{} is gone, skipping", entry.id);
                continue;
            }

            let result = timeout(ACTION_TIMEOUT, self.executor.execute(&entry.id, entry.mode)).await;
            if self.generation() != generation {
                log::debug!("Discarding result for {} after disable", entry.id);
                self.stats.record_event(StatEvent::ResultDiscarded);
                return None;
            }
            let outcome = match result {
                Ok(outcome) => {
                    if outcome.succeeded {
                        log::info!(
                            "{} {} via {:?}{}",
                            entry.mode,
                            entry.id,
                            outcome.method.unwrap_or(ActionMethod::Ui),
                            if outcome.via_fallback { " (delete fallback)" } else { "" }
                        );
                    }
                    outcome
                }
                Err(_) => {
                    log::warn!(
                        "Action on {} exceeded {}s, releasing the lock",
                        entry.id,
                        ACTION_TIMEOUT.as_secs()
                    );
                    self.page.dismiss_menus();
                    ModerationOutcome::failure(ModerationError::TimedOut, false)
                }
            };
            self.stats.record_event(StatEvent::ActionCompleted {
                mode: entry.mode,
                outcome,
            });
            handled += 1;

            tokio::select! {
                _ = token.cancelled() => return None,
                _ = sleep(ACTION_SETTLE) => {}
            }
        }
        Some(handled)
    }

    /// Classify every message without a processed mark. Returns how many
    /// were spam.
    pub fn rescan_unprocessed(self: &Arc<Self>) -> usize {
        if !self.live.enabled() {
            return 0;
        }
        self.discovery.invalidate();
        let found = self
            .discovery
            .unprocessed_messages()
            .iter()
            .filter(|id| self.process_message(id) == Some(true))
            .count();
        if found > 0 {
            log::info!("Rescan found {found} missed spam message(s)");
        } else {
            self.log_recent_summary();
        }
        found
    }

    fn log_recent_summary(&self) {
        if !log::log_enabled!(Level::Debug) {
            return;
        }
        let messages = self.discovery.all_messages();
        let start = messages.len().saturating_sub(RECENT_SUMMARY_COUNT);
        for id in &messages[start..] {
            let text = self.discovery.message_text(id).unwrap_or_default();
            log::debug!(
                "recent {id} [{:?}]: \"{}\"",
                self.page.processed_mark(id),
                truncate_chars(&text, 40)
            );
        }
    }

    /// Classify `ids` in chunks, yielding to other tasks between chunks.
    pub async fn scan_in_chunks(self: &Arc<Self>, ids: Vec<MessageId>) -> usize {
        let mut spam = 0;
        for chunk in ids.chunks(SCAN_CHUNK_SIZE) {
            spam += chunk
                .iter()
                .filter(|id| self.process_message(id) == Some(true))
                .count();
            tokio::task::yield_now().await;
        }
        spam
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::moderation::api::ModerationEndpoint;
    use crate::moderation::tests::FixedEndpoint;
    use crate::page::memory::{MemoryPage, MessageSpec};
    use crate::settings::{MemorySettingsStore, SettingsStore};
    use chrono::Utc;

    struct Fixture {
        page: Arc<MemoryPage>,
        live: Arc<LiveSettings>,
        scheduler: Arc<Scheduler>,
        stats: Arc<StatisticsCollector>,
    }

    fn fixture(mode: ModerationMode, endpoint: Option<Arc<dyn ModerationEndpoint>>) -> Fixture {
        let page = Arc::new(MemoryPage::new());
        let settings = Settings {
            mode,
            ..Settings::default()
        };
        let store: Arc<dyn SettingsStore> = Arc::new(MemorySettingsStore::new(settings.clone()));
        let live = Arc::new(LiveSettings::from_settings(&settings).unwrap());
        let discovery = Arc::new(MessageDiscovery::new(page.clone()));
        let executor = Arc::new(ModerationExecutor::new(
            page.clone(),
            endpoint,
            store.clone(),
            "Spam".into(),
        ));
        let health = Arc::new(HealthMonitor::new(page.clone(), discovery.clone(), live.clone()));
        let activation = Arc::new(TabActivation::new("tab", store));
        activation.check(Utc::now());
        let stats = Arc::new(StatisticsCollector::new());
        let scheduler = Arc::new(Scheduler::new(
            page.clone(),
            discovery,
            live.clone(),
            executor,
            health,
            activation,
            stats.clone(),
        ));
        scheduler.enable(CancellationToken::new());
        Fixture {
            page,
            live,
            scheduler,
            stats,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_view_mode_hides_without_queue() {
        let f = fixture(ModerationMode::View, None);
        let id = f.page.push_message(MessageSpec::new("m1", "addr", "STOPRUGS now"));
        assert_eq!(f.scheduler.process_message(&id), Some(true));
        assert!(f.page.is_hidden(&id));
        assert_eq!(f.scheduler.pending_len(), 0);
        assert_eq!(f.page.processed_mark(&id), Some(ProcessedMark::Flagged));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_message_marked() {
        let f = fixture(ModerationMode::Remove, None);
        let id = f.page.push_message(MessageSpec::new("m1", "addr", "gm frens"));
        assert_eq!(f.scheduler.process_message(&id), Some(false));
        assert_eq!(f.page.processed_mark(&id), Some(ProcessedMark::Clean));
        // Processed messages are not looked at again.
        assert_eq!(f.scheduler.process_message(&id), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_then_drain() {
        let f = fixture(ModerationMode::Remove, None);
        let id = f.page.push_message(MessageSpec::new("m1", "addr", "stoprugs"));
        f.scheduler.process_message(&id);
        assert_eq!(f.scheduler.pending_len(), 1);

        sleep(BATCH_DELAY / 2).await;
        assert!(f.page.message_exists(&id));

        sleep(BATCH_DELAY).await;
        sleep(Duration::from_secs(2)).await;
        assert!(!f.page.message_exists(&id));
        assert!(f.scheduler.is_idle());
        assert_eq!(f.stats.snapshot().actions_succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_restarts_on_arrival() {
        let f = fixture(ModerationMode::Label, None);
        let first = f.page.push_message(MessageSpec::new("a", "addr", "stoprugs"));
        f.scheduler.process_message(&first);

        sleep(Duration::from_millis(600)).await;
        let second = f.page.push_message(MessageSpec::new("b", "addr", "solspoint"));
        f.scheduler.process_message(&second);

        sleep(Duration::from_millis(600)).await;
        assert!(!f.page.is_highlighted(&first));
        assert_eq!(f.scheduler.pending_len(), 2);

        sleep(Duration::from_millis(500)).await;
        assert!(f.page.is_highlighted(&first));
        assert!(f.page.is_highlighted(&second));
        assert!(f.scheduler.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_drains_immediately() {
        let f = fixture(ModerationMode::Remove, None);
        for i in 0..MAX_BATCH_SIZE {
            let id = f
                .page
                .push_message(MessageSpec::new(&format!("m{i}"), "addr", "stoprugs"));
            f.scheduler.process_message(&id);
        }
        tokio::task::yield_now().await;
        assert!(f.scheduler.is_busy());
        assert_eq!(f.scheduler.pending_len(), MAX_BATCH_SIZE - 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_not_queued() {
        let f = fixture(ModerationMode::Remove, None);
        let id = MessageId::from("m1");
        f.scheduler.enqueue(id.clone(), ModerationMode::Remove);
        f.scheduler.enqueue(id, ModerationMode::Remove);
        assert_eq!(f.scheduler.pending_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_label_drain_rechecks() {
        let f = fixture(ModerationMode::Label, None);
        let spam = f.page.push_message(MessageSpec::new("a", "addr", "stoprugs"));
        let other = f.page.push_message(MessageSpec::new("b", "addr", "solspoint"));
        f.scheduler.process_message(&spam);
        f.scheduler.process_message(&other);

        // Rules change before the drain; only the first still matches.
        f.live
            .set_triggers(crate::triggers::TriggerSet::from_patterns(["stoprugs"]).unwrap());
        sleep(BATCH_DELAY * 2).await;
        assert!(f.page.is_highlighted(&spam));
        assert!(!f.page.is_highlighted(&other));
        assert_eq!(f.page.processed_mark(&other), Some(ProcessedMark::Clean));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_mismatch_dropped() {
        let f = fixture(ModerationMode::Remove, None);
        let id = f.page.push_message(MessageSpec::new("a", "addr", "stoprugs"));
        f.scheduler.process_message(&id);
        f.live.set_mode(ModerationMode::Exclude);
        sleep(BATCH_DELAY * 3).await;
        assert!(f.page.message_exists(&id));
        assert!(f.page.ui_clicks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_clears_everything() {
        let f = fixture(ModerationMode::Remove, None);
        for i in 0..3 {
            let id = f
                .page
                .push_message(MessageSpec::new(&format!("m{i}"), "addr", "stoprugs"));
            f.scheduler.process_message(&id);
        }
        f.scheduler.disable();
        assert!(f.scheduler.is_idle());
        sleep(BATCH_DELAY * 3).await;
        assert_eq!(f.page.list_messages().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescan_after_cycle_picks_up_missed() {
        let endpoint: Arc<dyn ModerationEndpoint> = Arc::new(FixedEndpoint::new(Ok(())));
        let f = fixture(ModerationMode::Remove, Some(endpoint));
        let first = f.page.push_message(MessageSpec::new("a", "addr", "stoprugs"));
        f.scheduler.process_message(&first);
        // Rendered but never observed.
        let missed = f.page.preload(vec![MessageSpec::new("b", "addr", "solspoint")]);

        sleep(BATCH_DELAY + Duration::from_millis(300)).await;
        assert!(f.scheduler.is_idle());
        assert_eq!(f.page.processed_mark(&missed[0]), None);

        sleep(RESCAN_DELAY).await;
        assert_eq!(f.page.processed_mark(&missed[0]), Some(ProcessedMark::Flagged));
        assert_eq!(f.scheduler.pending_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_in_chunks() {
        let f = fixture(ModerationMode::Label, None);
        let specs = (0..45)
            .map(|i| {
                let text = if i % 3 == 0 { "stoprugs" } else { "hello" };
                MessageSpec::new(&format!("m{i}"), "addr", text)
            })
            .collect();
        let ids = f.page.preload(specs);
        assert_eq!(f.scheduler.scan_in_chunks(ids).await, 15);
        assert_eq!(f.page.processed_messages().len(), 45);
    }
}
