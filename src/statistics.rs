use crate::config::ModerationMode;
use crate::moderation::{ActionMethod, ModerationError, ModerationOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ModerationStats {
    pub messages_classified: u64,
    pub spam_detected: u64,
    pub hidden: u64,
    pub labelled: u64,
    pub actions_succeeded: u64,
    pub actions_failed: u64,
    pub api_actions: u64,
    pub ui_actions: u64,
    pub via_fallback: u64,
    pub timed_out: u64,
    pub discarded: u64,
    pub reloads: u64,
    pub start_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl ModerationStats {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            messages_classified: 0,
            spam_detected: 0,
            hidden: 0,
            labelled: 0,
            actions_succeeded: 0,
            actions_failed: 0,
            api_actions: 0,
            ui_actions: 0,
            via_fallback: 0,
            timed_out: 0,
            discarded: 0,
            reloads: 0,
            start_time: now,
            last_updated: now,
        }
    }
}

#[derive(Debug, Clone)]
pub enum StatEvent {
    MessageClassified { spam: bool },
    ActionCompleted {
        mode: ModerationMode,
        outcome: ModerationOutcome,
    },
    /// Result arrived after the pipeline was disabled or the mode changed.
    ResultDiscarded,
    PageReloaded,
}

pub struct StatisticsCollector {
    stats: Mutex<ModerationStats>,
}

impl StatisticsCollector {
    pub fn new() -> Self {
        Self {
            stats: Mutex::new(ModerationStats::new()),
        }
    }

    pub fn record_event(&self, event: StatEvent) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        match event {
            StatEvent::MessageClassified { spam } => {
                stats.messages_classified += 1;
                if spam {
                    stats.spam_detected += 1;
                }
            }
            StatEvent::ActionCompleted { mode, outcome } => match mode {
                ModerationMode::View => stats.hidden += 1,
                ModerationMode::Label => stats.labelled += 1,
                ModerationMode::Remove | ModerationMode::Exclude => {
                    if outcome.succeeded {
                        stats.actions_succeeded += 1;
                    } else {
                        stats.actions_failed += 1;
                    }
                    if outcome.failure == Some(ModerationError::TimedOut) {
                        stats.timed_out += 1;
                    }
                    match outcome.method {
                        Some(ActionMethod::Api) => stats.api_actions += 1,
                        Some(ActionMethod::Ui) => stats.ui_actions += 1,
                        Some(ActionMethod::Local) | None => {}
                    }
                    if outcome.via_fallback {
                        stats.via_fallback += 1;
                    }
                }
            },
            StatEvent::ResultDiscarded => stats.discarded += 1,
            StatEvent::PageReloaded => stats.reloads += 1,
        }
        stats.last_updated = Utc::now();
    }

    pub fn snapshot(&self) -> ModerationStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn print_stats(&self) {
        let stats = self.snapshot();
        let runtime = stats.last_updated - stats.start_time;
        println!("Chat moderation statistics");
        println!("==========================");
        println!("Runtime:              {}s", runtime.num_seconds());
        println!("Messages classified:  {}", stats.messages_classified);
        println!("Spam detected:        {}", stats.spam_detected);
        println!("Hidden (view):        {}", stats.hidden);
        println!("Highlighted (label):  {}", stats.labelled);
        println!(
            "Actions:              {} succeeded, {} failed",
            stats.actions_succeeded, stats.actions_failed
        );
        println!(
            "  via API / UI:       {} / {}",
            stats.api_actions, stats.ui_actions
        );
        println!("  via delete fallback {}", stats.via_fallback);
        println!("Timed out:            {}", stats.timed_out);
        println!("Discarded results:    {}", stats.discarded);
        println!("Page reloads:         {}", stats.reloads);
    }
}

impl Default for StatisticsCollector {
    fn default() -> Self {
        Self::new()
    }
}
