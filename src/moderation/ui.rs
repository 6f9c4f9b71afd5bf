//! Moderation through the host's own per-message menu.

use super::ModerationError;
use crate::normalization::normalize;
use crate::page::{AttrFilter, ChatPage, ElementInfo, MessageId, PointerEvent, Selector};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Wait after every simulated click.
pub const CLICK_SETTLE: Duration = Duration::from_millis(100);
/// Wait after opening a menu.
pub const ACTION_DELAY: Duration = Duration::from_millis(200);
/// Extra wait for the ban reason submenu.
pub const SUBMENU_DELAY: Duration = Duration::from_millis(500);
const DELETE_SETTLE: Duration = Duration::from_millis(300);
const BAN_SETTLE: Duration = Duration::from_millis(500);

/// Labels shorter than this only match exactly or as the longer side.
const MIN_CONTAINED_LABEL: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    pub attempts: u32,
    pub interval: Duration,
}

pub const DELETE_ITEM_RETRY: RetryBudget = RetryBudget {
    attempts: 10,
    interval: Duration::from_millis(150),
};
pub const BAN_ITEM_RETRY: RetryBudget = RetryBudget {
    attempts: 15,
    interval: Duration::from_millis(200),
};
pub const REASON_ITEM_RETRY: RetryBudget = RetryBudget {
    attempts: 15,
    interval: Duration::from_millis(300),
};

pub const DELETE_LABELS: &[&str] = &["delete message"];
pub const BAN_LABELS: &[&str] = &["ban user", "Ban user", "BAN USER", "ban", "Ban"];

/// Ways to locate a message's "more actions" control, in priority order.
pub const MENU_TRIGGER_SELECTORS: &[Selector] = &[
    Selector::new(
        Some("button"),
        Some(AttrFilter::Equals("aria-label", "Moderation actions")),
    ),
    Selector::new(
        Some("button"),
        Some(AttrFilter::Equals("aria-haspopup", "menu")),
    ),
    Selector::new(
        Some("button"),
        Some(AttrFilter::Contains("aria-label", "Moderation")),
    ),
    Selector::new(Some("button"), Some(AttrFilter::Contains("title", "Moderation"))),
];

/// Where open menu entries are rendered, in priority order.
pub const MENU_ITEM_SELECTORS: &[Selector] = &[
    Selector::new(None, Some(AttrFilter::Equals("role", "menuitem"))),
    Selector::new(None, Some(AttrFilter::Equals("role", "option"))),
    Selector::new(Some("div"), Some(AttrFilter::Present("data-radix-collection-item"))),
    Selector::new(None, Some(AttrFilter::Present("data-radix-dropdown-menu-item"))),
];

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whether a rendered menu label stands for `needle`.
pub fn label_matches(text: &str, needle: &str) -> bool {
    let label = normalize(&collapse_whitespace(text));
    let wanted = normalize(&collapse_whitespace(needle));
    if label.is_empty() || wanted.is_empty() {
        return false;
    }
    label == wanted
        || label.contains(&wanted)
        || (label.chars().count() >= MIN_CONTAINED_LABEL && wanted.contains(&label))
        || text.trim().eq_ignore_ascii_case(needle.trim())
}

/// Case variants tried for the ban reason entry.
pub fn reason_variants(reason: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    [
        reason.to_lowercase(),
        reason.to_string(),
        reason.to_uppercase(),
        normalize(reason),
    ]
    .into_iter()
    .filter(|variant| seen.insert(variant.clone()))
    .collect()
}

pub struct UiAutomation {
    page: Arc<dyn ChatPage>,
}

impl UiAutomation {
    pub fn new(page: Arc<dyn ChatPage>) -> Self {
        Self { page }
    }

    /// First visible menu trigger inside the message.
    pub fn find_menu_trigger(&self, id: &MessageId) -> Result<ElementInfo, ModerationError> {
        for selector in MENU_TRIGGER_SELECTORS {
            if let Some(found) = self
                .page
                .query_in_message(id, selector)
                .into_iter()
                .find(ElementInfo::is_visible)
            {
                log::debug!("Menu trigger for {id} found via {selector}");
                return Ok(found);
            }
        }
        Err(ModerationError::KebabNotFound)
    }

    /// First visible open-menu entry whose label matches `needle`.
    pub fn find_menu_item(&self, needle: &str) -> Option<ElementInfo> {
        for selector in MENU_ITEM_SELECTORS {
            for candidate in self.page.query_document(selector) {
                if !candidate.is_visible() {
                    continue;
                }
                if candidate
                    .text_sources()
                    .iter()
                    .any(|text| label_matches(text, needle))
                {
                    log::debug!("Menu item \"{needle}\" found via {selector}");
                    return Some(candidate);
                }
            }
        }
        None
    }

    async fn find_with_retry(&self, labels: &[String], budget: RetryBudget) -> Option<ElementInfo> {
        for attempt in 1..=budget.attempts {
            if let Some(found) = labels.iter().find_map(|label| self.find_menu_item(label)) {
                return Some(found);
            }
            log::trace!(
                "Menu item {:?} not present, attempt {attempt}/{}",
                labels,
                budget.attempts
            );
            if attempt < budget.attempts {
                sleep(budget.interval).await;
            }
        }
        None
    }

    /// pointerdown, mousedown, mouseup, click.
    pub async fn click(&self, element: &ElementInfo) -> Result<(), ModerationError> {
        for event in PointerEvent::CLICK_SEQUENCE {
            self.page.dispatch(element.handle, event)?;
        }
        sleep(CLICK_SETTLE).await;
        Ok(())
    }

    async fn open_menu(&self, id: &MessageId) -> Result<(), ModerationError> {
        let trigger = self.find_menu_trigger(id)?;
        self.click(&trigger).await?;
        sleep(ACTION_DELAY).await;
        Ok(())
    }

    async fn pick(
        &self,
        labels: &[String],
        budget: RetryBudget,
        name: &str,
    ) -> Result<ElementInfo, ModerationError> {
        match self.find_with_retry(labels, budget).await {
            Some(item) => Ok(item),
            None => {
                self.page.dismiss_menus();
                Err(ModerationError::MenuItemNotFound(name.to_string()))
            }
        }
    }

    pub async fn delete(&self, id: &MessageId) -> Result<(), ModerationError> {
        self.open_menu(id).await?;
        let labels: Vec<String> = DELETE_LABELS.iter().map(|s| s.to_string()).collect();
        let item = self.pick(&labels, DELETE_ITEM_RETRY, "delete message").await?;
        self.click(&item).await?;
        sleep(DELETE_SETTLE).await;
        log::info!("Deleted message {id} through the menu");
        Ok(())
    }

    pub async fn ban(&self, id: &MessageId, reason: &str) -> Result<(), ModerationError> {
        self.open_menu(id).await?;

        let labels: Vec<String> = BAN_LABELS.iter().map(|s| s.to_string()).collect();
        let ban = self.pick(&labels, BAN_ITEM_RETRY, "ban user").await?;
        self.click(&ban).await?;
        sleep(ACTION_DELAY + SUBMENU_DELAY).await;

        let reason_item = match self
            .pick(&reason_variants(reason), REASON_ITEM_RETRY, reason)
            .await
        {
            Ok(item) => item,
            Err(e) => {
                let available: Vec<String> = MENU_ITEM_SELECTORS
                    .iter()
                    .flat_map(|selector| self.page.query_document(selector))
                    .map(|el| el.inner_text)
                    .collect();
                log::warn!("Ban reason \"{reason}\" not offered; menu had {available:?}");
                return Err(e);
            }
        };
        self.click(&reason_item).await?;
        sleep(BAN_SETTLE).await;
        log::info!("Banned sender of {id} through the menu ({reason})");
        Ok(())
    }
}
