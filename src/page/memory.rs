use super::{
    AttrFilter, ChatPage, ElementHandle, ElementInfo, MessageId, NodeId, PageError, PageMutation,
    PointerEvent, ProcessedMark, Rect, Selector, MESSAGE_ID_ATTRIBUTE,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// A chat message as it arrives on the page.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageSpec {
    pub id: String,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub sender_address: Option<String>,
    pub text: String,
}

impl MessageSpec {
    pub fn new(id: &str, sender_address: &str, text: &str) -> Self {
        Self {
            id: id.to_string(),
            sender_name: sender_address.chars().take(6).collect(),
            sender_address: Some(sender_address.to_string()),
            text: text.to_string(),
        }
    }
}

/// What the per-message moderation menu offers. A `None` label means the
/// entry is not rendered (e.g. the viewer lacks the permission).
#[derive(Debug, Clone)]
pub struct MenuLayout {
    pub kebab_label: Option<String>,
    pub delete_label: Option<String>,
    pub ban_label: Option<String>,
    pub reason_labels: Vec<String>,
}

impl Default for MenuLayout {
    fn default() -> Self {
        Self {
            kebab_label: Some("Moderation actions".to_string()),
            delete_label: Some("Delete message".to_string()),
            ban_label: Some("Ban user".to_string()),
            reason_labels: vec!["Spam".to_string(), "Toxic".to_string()],
        }
    }
}

#[derive(Debug, Clone)]
enum MenuAction {
    Delete,
    Ban,
    Reason(String),
}

#[derive(Debug)]
struct OpenMenu {
    message: MessageId,
    items: Vec<(ElementHandle, MenuAction, String)>,
}

#[derive(Debug)]
struct MessageNode {
    id: MessageId,
    element: NodeId,
    body: NodeId,
    kebab: ElementHandle,
    sender_name: String,
    sender_address: Option<String>,
    body_text: String,
    hidden: bool,
    highlighted: bool,
    mark: Option<ProcessedMark>,
}

#[derive(Debug, Default)]
struct PageState {
    messages: Vec<MessageNode>,
    fragments: HashMap<NodeId, Vec<MessageId>>,
    next_id: u64,
    layout: MenuLayout,
    menu: Option<OpenMenu>,
    pressed: Option<ElementHandle>,
    removed: Vec<MessageId>,
    bans: Vec<(MessageId, String)>,
    clicks: Vec<String>,
    reloads: u32,
}

impl PageState {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn message(&self, id: &MessageId) -> Option<&MessageNode> {
        self.messages.iter().find(|m| &m.id == id)
    }

    fn message_mut(&mut self, id: &MessageId) -> Option<&mut MessageNode> {
        self.messages.iter_mut().find(|m| &m.id == id)
    }

    fn insert(&mut self, spec: MessageSpec) -> (MessageId, NodeId) {
        let element = NodeId(self.next());
        let body = NodeId(self.next());
        let kebab = ElementHandle(self.next());
        let id = MessageId(spec.id);
        self.messages.push(MessageNode {
            id: id.clone(),
            element,
            body,
            kebab,
            sender_name: spec.sender_name,
            sender_address: spec.sender_address,
            body_text: spec.text,
            hidden: false,
            highlighted: false,
            mark: None,
        });
        (id, element)
    }

    fn remove(&mut self, id: &MessageId) {
        self.messages.retain(|m| &m.id != id);
        self.removed.push(id.clone());
    }

    fn open_actions_menu(&mut self, message: MessageId) {
        let mut items = Vec::new();
        if let Some(label) = self.layout.delete_label.clone() {
            items.push((ElementHandle(self.next()), MenuAction::Delete, label));
        }
        if let Some(label) = self.layout.ban_label.clone() {
            items.push((ElementHandle(self.next()), MenuAction::Ban, label));
        }
        self.menu = Some(OpenMenu { message, items });
    }

    fn open_reason_menu(&mut self, message: MessageId) {
        let labels = self.layout.reason_labels.clone();
        let items = labels
            .into_iter()
            .map(|label| {
                (
                    ElementHandle(self.next()),
                    MenuAction::Reason(label.clone()),
                    label,
                )
            })
            .collect();
        self.menu = Some(OpenMenu { message, items });
    }

    fn click(&mut self, target: ElementHandle) -> Result<(), PageError> {
        if let Some(message) = self.messages.iter().find(|m| m.kebab == target) {
            let id = message.id.clone();
            if message.hidden || self.layout.kebab_label.is_none() {
                return Ok(());
            }
            self.clicks.push(self.layout.kebab_label.clone().unwrap_or_default());
            self.open_actions_menu(id);
            return Ok(());
        }

        let (message, action, label) = {
            let menu = self.menu.as_ref().ok_or(PageError::StaleElement(target))?;
            let (_, action, label) = menu
                .items
                .iter()
                .find(|(handle, _, _)| *handle == target)
                .ok_or(PageError::StaleElement(target))?;
            (menu.message.clone(), action.clone(), label.clone())
        };
        self.clicks.push(label);

        match action {
            MenuAction::Delete => {
                self.remove(&message);
                self.menu = None;
            }
            MenuAction::Ban => self.open_reason_menu(message),
            MenuAction::Reason(reason) => {
                self.remove(&message);
                self.bans.push((message, reason));
                self.menu = None;
            }
        }
        Ok(())
    }
}

/// In-process chat page. Renders messages with a kebab button, a
/// two-level moderation menu (actions, then ban reasons) and reports
/// insertions and text changes to observers.
pub struct MemoryPage {
    state: Mutex<PageState>,
    observers: Mutex<Vec<UnboundedSender<Vec<PageMutation>>>>,
}

impl MemoryPage {
    pub fn new() -> Self {
        Self::with_layout(MenuLayout::default())
    }

    pub fn with_layout(layout: MenuLayout) -> Self {
        Self {
            state: Mutex::new(PageState {
                layout,
                ..Default::default()
            }),
            observers: Mutex::new(Vec::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, PageState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, batch: Vec<PageMutation>) {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        observers.retain(|tx| tx.send(batch.clone()).is_ok());
    }

    /// Render one message and notify observers.
    pub fn push_message(&self, spec: MessageSpec) -> MessageId {
        let (id, element) = self.state().insert(spec);
        self.notify(vec![PageMutation::NodeAdded(element)]);
        id
    }

    /// Render several messages inside one inserted container node.
    pub fn push_fragment(&self, specs: Vec<MessageSpec>) -> Vec<MessageId> {
        let (ids, fragment) = {
            let mut state = self.state();
            let fragment = NodeId(state.next());
            let ids: Vec<MessageId> = specs.into_iter().map(|s| state.insert(s).0).collect();
            state.fragments.insert(fragment, ids.clone());
            (ids, fragment)
        };
        self.notify(vec![PageMutation::NodeAdded(fragment)]);
        ids
    }

    /// Stream more text into a message body.
    pub fn append_text(&self, id: &MessageId, more: &str) {
        let body = {
            let mut state = self.state();
            match state.message_mut(id) {
                Some(message) => {
                    message.body_text.push_str(more);
                    message.body
                }
                None => return,
            }
        };
        self.notify(vec![PageMutation::TextChanged(body)]);
    }

    /// Render messages without notifying observers, as if they were on the
    /// page before observation started.
    pub fn preload(&self, specs: Vec<MessageSpec>) -> Vec<MessageId> {
        let mut state = self.state();
        specs.into_iter().map(|s| state.insert(s).0).collect()
    }

    /// The host removed a message on its own.
    pub fn remove_message(&self, id: &MessageId) {
        self.state().remove(id);
    }

    pub fn set_layout(&self, layout: MenuLayout) {
        self.state().layout = layout;
    }

    pub fn is_hidden(&self, id: &MessageId) -> bool {
        self.state().message(id).map(|m| m.hidden).unwrap_or(false)
    }

    pub fn is_highlighted(&self, id: &MessageId) -> bool {
        self.state().message(id).map(|m| m.highlighted).unwrap_or(false)
    }

    pub fn removed(&self) -> Vec<MessageId> {
        self.state().removed.clone()
    }

    pub fn bans(&self) -> Vec<(MessageId, String)> {
        self.state().bans.clone()
    }

    /// Labels of every element that received a full click, in order.
    pub fn ui_clicks(&self) -> Vec<String> {
        self.state().clicks.clone()
    }

    pub fn menu_open(&self) -> bool {
        self.state().menu.is_some()
    }

    pub fn reload_count(&self) -> u32 {
        self.state().reloads
    }
}

impl Default for MemoryPage {
    fn default() -> Self {
        Self::new()
    }
}

fn element(handle: ElementHandle, tag: &str, attrs: &[(&str, &str)], text: &str, rect: Rect) -> ElementInfo {
    ElementInfo {
        handle,
        tag: tag.to_string(),
        attributes: attrs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        inner_text: text.to_string(),
        text_content: text.to_string(),
        rect,
        css_hidden: false,
    }
}

impl ChatPage for MemoryPage {
    fn list_messages(&self) -> Vec<MessageId> {
        self.state().messages.iter().map(|m| m.id.clone()).collect()
    }

    fn message_exists(&self, id: &MessageId) -> bool {
        self.state().message(id).is_some()
    }

    fn message_text(&self, id: &MessageId) -> Option<String> {
        self.state().message(id).map(|m| {
            if m.sender_name.is_empty() {
                m.body_text.clone()
            } else {
                format!("{}\n{}", m.sender_name, m.body_text)
            }
        })
    }

    fn message_body_text(&self, id: &MessageId) -> Option<String> {
        self.state().message(id).map(|m| m.body_text.clone())
    }

    fn sender_profile_href(&self, id: &MessageId) -> Option<String> {
        self.state()
            .message(id)
            .and_then(|m| m.sender_address.as_ref())
            .map(|address| format!("/profile/{address}"))
    }

    fn processed_mark(&self, id: &MessageId) -> Option<ProcessedMark> {
        self.state().message(id).and_then(|m| m.mark)
    }

    fn set_processed_mark(&self, id: &MessageId, mark: Option<ProcessedMark>) {
        if let Some(message) = self.state().message_mut(id) {
            message.mark = mark;
        }
    }

    fn processed_messages(&self) -> Vec<MessageId> {
        self.state()
            .messages
            .iter()
            .filter(|m| m.mark.is_some())
            .map(|m| m.id.clone())
            .collect()
    }

    fn hide(&self, id: &MessageId) {
        if let Some(message) = self.state().message_mut(id) {
            message.hidden = true;
        }
    }

    fn highlight(&self, id: &MessageId) {
        if let Some(message) = self.state().message_mut(id) {
            message.highlighted = true;
        }
    }

    fn clear_highlight(&self, id: &MessageId) {
        if let Some(message) = self.state().message_mut(id) {
            message.highlighted = false;
        }
    }

    fn enclosing_message(&self, node: NodeId) -> Option<MessageId> {
        self.state()
            .messages
            .iter()
            .find(|m| m.element == node || m.body == node)
            .map(|m| m.id.clone())
    }

    fn nested_messages(&self, node: NodeId) -> Vec<MessageId> {
        let state = self.state();
        state
            .fragments
            .get(&node)
            .map(|ids| {
                ids.iter()
                    .filter(|id| state.message(id).is_some())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn query_in_message(&self, id: &MessageId, selector: &Selector) -> Vec<ElementInfo> {
        let state = self.state();
        let (message, label) = match (state.message(id), state.layout.kebab_label.as_deref()) {
            (Some(message), Some(label)) => (message, label),
            _ => return Vec::new(),
        };
        let rect = if message.hidden {
            Rect::default()
        } else {
            Rect {
                width: 24.0,
                height: 24.0,
            }
        };
        let kebab = element(
            message.kebab,
            "button",
            &[("aria-label", label), ("aria-haspopup", "menu")],
            "",
            rect,
        );
        if selector.matches(&kebab.tag, &kebab.attributes) {
            vec![kebab]
        } else {
            Vec::new()
        }
    }

    fn query_document(&self, selector: &Selector) -> Vec<ElementInfo> {
        let state = self.state();
        let mut found = Vec::new();
        if let Some(menu) = &state.menu {
            for (handle, _, label) in &menu.items {
                let item = element(
                    *handle,
                    "div",
                    &[("role", "menuitem"), ("data-radix-collection-item", "")],
                    label,
                    Rect {
                        width: 160.0,
                        height: 32.0,
                    },
                );
                if selector.matches(&item.tag, &item.attributes) {
                    found.push(item);
                }
            }
        }
        if *selector == Selector::new(Some("div"), Some(AttrFilter::Present(MESSAGE_ID_ATTRIBUTE))) {
            for message in &state.messages {
                found.push(element(
                    ElementHandle(message.element.0),
                    "div",
                    &[(MESSAGE_ID_ATTRIBUTE, message.id.as_str())],
                    &message.body_text,
                    Rect {
                        width: 300.0,
                        height: 40.0,
                    },
                ));
            }
        }
        found
    }

    fn dispatch(&self, target: ElementHandle, event: PointerEvent) -> Result<(), PageError> {
        let mut state = self.state();
        match event {
            PointerEvent::PointerDown => {
                state.pressed = Some(target);
                Ok(())
            }
            PointerEvent::MouseDown | PointerEvent::MouseUp => Ok(()),
            PointerEvent::Click => {
                // The menu framework ignores clicks without a preceding pointerdown.
                if state.pressed.take() != Some(target) {
                    return Ok(());
                }
                state.click(target)
            }
        }
    }

    fn dismiss_menus(&self) {
        self.state().menu = None;
    }

    fn observe(&self) -> UnboundedReceiver<Vec<PageMutation>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn reload(&self) {
        let mut state = self.state();
        state.reloads += 1;
        state.menu = None;
    }
}
