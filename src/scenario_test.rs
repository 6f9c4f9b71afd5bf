//! End-to-end pipeline scenarios
//!
//! Drive a full `AutoMod` over an in-memory page with a paused clock.

use crate::commands::{Command, CommandResponse};
use crate::config::{ModerationMode, Settings};
use crate::engine::AutoMod;
use crate::moderation::api::ModerationEndpoint;
use crate::moderation::tests::FixedEndpoint;
use crate::moderation::ModerationError;
use crate::page::memory::{MemoryPage, MenuLayout, MessageSpec};
use crate::page::{ChatPage, ProcessedMark};
use crate::scheduler::ACTION_TIMEOUT;
use crate::settings::{MemorySettingsStore, SettingsStore, TabLease};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Remove mode with a 2xx API answer never touches the menu
#[tokio::test(start_paused = true)]
async fn test_remove_via_api() {
    let endpoint: Arc<dyn ModerationEndpoint> = Arc::new(FixedEndpoint::new(Ok(())));
    let (page, _store, automod) = start(
        ModerationMode::Remove,
        MenuLayout::default(),
        Some(endpoint),
    )
    .await;

    let id = page.push_message(MessageSpec::new("m1", "7xKX", "join STOPRUGS now"));
    sleep(Duration::from_secs(3)).await;

    assert_eq!(page.processed_mark(&id), Some(ProcessedMark::Flagged));
    assert!(page.ui_clicks().is_empty());
    assert!(automod.scheduler().is_idle());
    assert_eq!(automod.stats().snapshot().api_actions, 1);
}

/// Exclude mode: API refuses, the menu has no ban entry, the message is
/// deleted instead
#[tokio::test(start_paused = true)]
async fn test_exclude_falls_back_to_delete() {
    let endpoint: Arc<dyn ModerationEndpoint> =
        Arc::new(FixedEndpoint::new(Err(ModerationError::PermissionDenied)));
    let layout = MenuLayout {
        ban_label: None,
        ..MenuLayout::default()
    };
    let (page, _store, automod) = start(ModerationMode::Exclude, layout, Some(endpoint)).await;

    let id = page.push_message(MessageSpec::new("m1", "7xKX", "@scam_rug_bot here"));
    sleep(Duration::from_secs(8)).await;

    assert!(!page.message_exists(&id));
    assert!(page.bans().is_empty());
    let stats = automod.stats().snapshot();
    assert_eq!(stats.actions_succeeded, 1);
    assert_eq!(stats.via_fallback, 1);
    assert_eq!(stats.ui_actions, 1);
}

/// Messages arriving during an action queue behind it; a hung action is
/// cut off and the drain moves on
#[tokio::test(start_paused = true)]
async fn test_queue_behind_busy_action() {
    let endpoint: Arc<dyn ModerationEndpoint> = Arc::new(SlowEndpoint {
        delay: Duration::from_secs(3600),
    });
    let (page, _store, automod) = start(
        ModerationMode::Remove,
        MenuLayout::default(),
        Some(endpoint),
    )
    .await;

    page.push_message(MessageSpec::new("m0", "addr", "stoprugs"));
    sleep(Duration::from_millis(1500)).await;
    assert!(automod.scheduler().is_busy());

    for i in 1..50 {
        page.push_message(MessageSpec::new(&format!("m{i}"), "addr", "stoprugs"));
    }
    settle().await;
    assert!(automod.scheduler().is_busy());
    assert_eq!(automod.scheduler().pending_len(), 49);

    sleep(ACTION_TIMEOUT).await;
    assert_eq!(automod.stats().snapshot().timed_out, 1);
    assert_eq!(automod.scheduler().pending_len(), 48);
}

/// A vanished heartbeat message reloads the page once
#[tokio::test(start_paused = true)]
async fn test_dead_chat_reloads_once() {
    let page = Arc::new(MemoryPage::new());
    let ids = page.preload(vec![MessageSpec::new("m1", "addr", "gm everyone")]);
    let (_store, automod) = start_on(page.clone(), ModerationMode::Label, None);
    settle().await;
    assert_eq!(automod.health().heartbeat().map(|hb| hb.id), Some(ids[0].clone()));

    page.remove_message(&ids[0]);
    sleep(Duration::from_secs(31)).await;
    assert_eq!(page.reload_count(), 1);

    sleep(Duration::from_secs(90)).await;
    assert_eq!(page.reload_count(), 1);
    assert_eq!(automod.stats().snapshot().reloads, 1);
}

/// A failed action is not retried until a forced rescan
#[tokio::test(start_paused = true)]
async fn test_processed_not_requeued() {
    let layout = MenuLayout {
        kebab_label: None,
        ..MenuLayout::default()
    };
    let (page, _store, automod) = start(ModerationMode::Remove, layout, None).await;

    let id = page.push_message(MessageSpec::new("m1", "addr", "solspoint airdrop"));
    sleep(Duration::from_secs(40)).await;
    assert_eq!(automod.stats().snapshot().actions_failed, 1);
    assert_eq!(page.processed_mark(&id), Some(ProcessedMark::Flagged));

    assert_eq!(automod.handle_command(Command::ForceRescan), CommandResponse::Success);
    sleep(Duration::from_secs(3)).await;
    assert_eq!(automod.stats().snapshot().actions_failed, 2);
}

/// View mode hides new spam only and ignores commands
#[tokio::test(start_paused = true)]
async fn test_view_mode() {
    let page = Arc::new(MemoryPage::new());
    let old = page.preload(vec![MessageSpec::new("old", "addr", "stoprugs")]);
    let (_store, automod) = start_on(page.clone(), ModerationMode::View, None);
    settle().await;

    let new = page.push_message(MessageSpec::new("new", "addr", "stoprugs"));
    settle().await;
    assert!(page.is_hidden(&new));
    assert!(!page.is_hidden(&old[0]));
    assert!(page.ui_clicks().is_empty());

    assert_eq!(automod.handle_command(Command::ForceRescan), CommandResponse::Ignored);
    match automod.handle_command(Command::GetTabStatus) {
        CommandResponse::TabStatus { is_active, mode, .. } => {
            assert!(is_active);
            assert_eq!(mode, ModerationMode::View);
        }
        other => panic!("unexpected response {other:?}"),
    }
}

/// Streamed text re-classifies a message judged clean
#[tokio::test(start_paused = true)]
async fn test_streamed_text_reclassified() {
    let (page, _store, _automod) = start(ModerationMode::Label, MenuLayout::default(), None).await;

    let id = page.push_message(MessageSpec::new("m1", "addr", "check out"));
    settle().await;
    assert_eq!(page.processed_mark(&id), Some(ProcessedMark::Clean));

    page.append_text(&id, " stoprugs dot com");
    sleep(Duration::from_millis(1500)).await;
    assert!(page.is_highlighted(&id));
}

/// Leaving label mode clears highlights and re-applies the new mode
#[tokio::test(start_paused = true)]
async fn test_mode_change() {
    let (page, store, _automod) = start(ModerationMode::Label, MenuLayout::default(), None).await;

    let id = page.push_message(MessageSpec::new("m1", "addr", "stoprugs"));
    sleep(Duration::from_millis(1500)).await;
    assert!(page.is_highlighted(&id));

    store.save_mode(ModerationMode::Remove);
    settle().await;
    assert!(!page.is_highlighted(&id));

    sleep(Duration::from_secs(3)).await;
    assert_eq!(page.removed(), vec![id]);
}

/// New triggers re-evaluate messages already judged clean
#[tokio::test(start_paused = true)]
async fn test_trigger_change() {
    let (page, store, automod) = start(ModerationMode::Label, MenuLayout::default(), None).await;

    let id = page.push_message(MessageSpec::new("m1", "addr", "buy my coin"));
    settle().await;
    assert_eq!(page.processed_mark(&id), Some(ProcessedMark::Clean));

    store.save_triggers(vec!["buy*coin".to_string()]);
    sleep(Duration::from_millis(1500)).await;
    assert!(page.is_highlighted(&id));

    assert_eq!(automod.handle_command(Command::TriggersUpdated), CommandResponse::Success);
    sleep(Duration::from_secs(3)).await;
    assert!(page.is_highlighted(&id));
}

/// Disabling mid-action releases the lock and drops the late result
#[tokio::test(start_paused = true)]
async fn test_disable_discards_in_flight() {
    let endpoint: Arc<dyn ModerationEndpoint> = Arc::new(SlowEndpoint {
        delay: Duration::from_secs(2),
    });
    let (page, store, automod) = start(
        ModerationMode::Remove,
        MenuLayout::default(),
        Some(endpoint),
    )
    .await;

    page.push_message(MessageSpec::new("m1", "addr", "stoprugs"));
    sleep(Duration::from_millis(1500)).await;
    assert!(automod.scheduler().is_busy());

    store.save_enabled(false);
    settle().await;
    assert!(automod.scheduler().is_idle());

    sleep(Duration::from_secs(3)).await;
    let stats = automod.stats().snapshot();
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.actions_succeeded, 0);
}

/// A page without the lease stays passive until forced active
#[tokio::test(start_paused = true)]
async fn test_dormant_page() {
    let page = Arc::new(MemoryPage::new());
    let ids = page.preload(vec![MessageSpec::new("m1", "addr", "stoprugs")]);
    let store = Arc::new(MemorySettingsStore::new(Settings {
        mode: ModerationMode::Remove,
        ..Settings::default()
    }));
    store.save_lease(TabLease {
        active_id: "other-tab".into(),
        last_heartbeat: Utc::now(),
    });
    let automod =
        AutoMod::new(page.clone(), store.clone(), None, "Spam".into(), "this-tab").unwrap();
    automod.start();

    sleep(Duration::from_secs(3)).await;
    assert!(page.message_exists(&ids[0]));
    assert_eq!(page.processed_mark(&ids[0]), None);

    assert_eq!(automod.handle_command(Command::ForceActivate), CommandResponse::Success);
    sleep(Duration::from_secs(3)).await;
    assert!(!page.message_exists(&ids[0]));
    assert_eq!(store.lease().map(|l| l.active_id).as_deref(), Some("this-tab"));
}

/// Edge blocking is persisted, reported and resettable
#[tokio::test(start_paused = true)]
async fn test_block_flag_commands() {
    let blocked = Err(ModerationError::Blocked("cf-mitigated: challenge".into()));
    let endpoint: Arc<dyn ModerationEndpoint> =
        Arc::new(FixedEndpoint::new(blocked));
    let (page, store, automod) = start(
        ModerationMode::Remove,
        MenuLayout::default(),
        Some(endpoint),
    )
    .await;

    let id = page.push_message(MessageSpec::new("m1", "addr", "stoprugs"));
    sleep(Duration::from_secs(3)).await;
    assert!(!page.message_exists(&id));
    assert!(store.load().network_blocked.is_some());

    match automod.handle_command(Command::GetNetworkStats) {
        CommandResponse::NetworkStats(stats) => {
            assert!(stats.blocked.is_some());
            assert_eq!(stats.attempts, 1);
        }
        other => panic!("unexpected response {other:?}"),
    }

    assert_eq!(automod.handle_command(Command::ResetBlockFlag), CommandResponse::Success);
    settle().await;
    assert!(store.load().network_blocked.is_none());
    match automod.handle_command(Command::GetNetworkStats) {
        CommandResponse::NetworkStats(stats) => assert!(stats.blocked.is_none()),
        other => panic!("unexpected response {other:?}"),
    }
}

struct SlowEndpoint {
    delay: Duration,
}

#[async_trait]
impl ModerationEndpoint for SlowEndpoint {
    async fn ban_user(&self, _user_address: &str) -> Result<(), ModerationError> {
        sleep(self.delay).await;
        Ok(())
    }
}

async fn settle() {
    sleep(Duration::from_millis(10)).await;
}

fn start_on(
    page: Arc<MemoryPage>,
    mode: ModerationMode,
    endpoint: Option<Arc<dyn ModerationEndpoint>>,
) -> (Arc<MemorySettingsStore>, Arc<AutoMod>) {
    let store = Arc::new(MemorySettingsStore::new(Settings {
        mode,
        ..Settings::default()
    }));
    let automod = AutoMod::new(page, store.clone(), endpoint, "Spam".into(), "tab-1").unwrap();
    automod.start();
    (store, automod)
}

async fn start(
    mode: ModerationMode,
    layout: MenuLayout,
    endpoint: Option<Arc<dyn ModerationEndpoint>>,
) -> (Arc<MemoryPage>, Arc<MemorySettingsStore>, Arc<AutoMod>) {
    let page = Arc::new(MemoryPage::with_layout(layout));
    let (store, automod) = start_on(page.clone(), mode, endpoint);
    settle().await;
    (page, store, automod)
}
