//! Port onto the host chat page.
//!
//! Everything the pipeline needs from the rendered document goes through
//! [`ChatPage`]: listing message elements, reading their text, keeping the
//! processed marker, hiding/highlighting, and the raw element queries and
//! pointer events the UI automation is built from. [`memory::MemoryPage`]
//! is an in-process implementation used by the replay command and tests.

pub mod memory;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc::UnboundedReceiver;

/// Attribute carrying the host's stable message identifier.
pub const MESSAGE_ID_ATTRIBUTE: &str = "data-message-id";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        MessageId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        MessageId(id.to_string())
    }
}

/// Any node in the document, as reported by mutation records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u64);

/// Handle to an interactive element (menu trigger, menu item).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageMutation {
    /// A node was inserted; it may be a message, inside one, or a fragment
    /// holding several.
    NodeAdded(NodeId),
    /// Character data changed inside `NodeId`.
    TextChanged(NodeId),
}

/// Decision recorded on a message element so it is not evaluated twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessedMark {
    /// Classified, not spam. Cleared again when its text changes.
    Clean,
    /// Classified as spam and handed to the current mode's action.
    Flagged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerEvent {
    PointerDown,
    MouseDown,
    MouseUp,
    Click,
}

impl PointerEvent {
    /// Order frameworks expect from a real pointer.
    pub const CLICK_SEQUENCE: [PointerEvent; 4] = [
        PointerEvent::PointerDown,
        PointerEvent::MouseDown,
        PointerEvent::MouseUp,
        PointerEvent::Click,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrFilter {
    Present(&'static str),
    Equals(&'static str, &'static str),
    Contains(&'static str, &'static str),
    NotEquals(&'static str, &'static str),
}

impl AttrFilter {
    fn matches(&self, attributes: &HashMap<String, String>) -> bool {
        match self {
            AttrFilter::Present(name) => attributes.contains_key(*name),
            AttrFilter::Equals(name, value) => attributes.get(*name).map(String::as_str) == Some(*value),
            AttrFilter::Contains(name, value) => attributes
                .get(*name)
                .map(|v| v.contains(*value))
                .unwrap_or(false),
            AttrFilter::NotEquals(name, value) => {
                attributes.get(*name).map(String::as_str) != Some(*value)
            }
        }
    }
}

/// A small CSS-selector subset: optional tag plus one attribute filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selector {
    pub tag: Option<&'static str>,
    pub attr: Option<AttrFilter>,
}

impl Selector {
    pub const fn new(tag: Option<&'static str>, attr: Option<AttrFilter>) -> Self {
        Self { tag, attr }
    }

    pub fn matches(&self, tag: &str, attributes: &HashMap<String, String>) -> bool {
        if let Some(expected) = self.tag {
            if !expected.eq_ignore_ascii_case(tag) {
                return false;
            }
        }
        self.attr.map(|a| a.matches(attributes)).unwrap_or(true)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(tag) = self.tag {
            f.write_str(tag)?;
        }
        match self.attr {
            Some(AttrFilter::Present(name)) => write!(f, "[{name}]"),
            Some(AttrFilter::Equals(name, value)) => write!(f, "[{name}=\"{value}\"]"),
            Some(AttrFilter::Contains(name, value)) => write!(f, "[{name}*=\"{value}\"]"),
            Some(AttrFilter::NotEquals(name, value)) => {
                write!(f, ":not([{name}=\"{value}\"])")
            }
            None if self.tag.is_none() => f.write_str("*"),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rect {
    pub width: f64,
    pub height: f64,
}

/// Snapshot of an element returned by a query.
#[derive(Debug, Clone)]
pub struct ElementInfo {
    pub handle: ElementHandle,
    pub tag: String,
    pub attributes: HashMap<String, String>,
    pub inner_text: String,
    pub text_content: String,
    pub rect: Rect,
    /// `visibility: hidden` in computed style.
    pub css_hidden: bool,
}

impl ElementInfo {
    /// Non-zero box and not hidden by CSS.
    pub fn is_visible(&self) -> bool {
        (self.rect.width > 0.0 || self.rect.height > 0.0) && !self.css_hidden
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Candidate labels, most specific first.
    pub fn text_sources(&self) -> Vec<&str> {
        [
            Some(self.inner_text.as_str()),
            Some(self.text_content.as_str()),
            self.attribute("aria-label"),
            self.attribute("title"),
            self.attribute("data-label"),
        ]
        .into_iter()
        .flatten()
        .filter(|s| !s.trim().is_empty())
        .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PageError {
    #[error("Element {0:?} is no longer attached")]
    StaleElement(ElementHandle),
    #[error("Message {0} is no longer attached")]
    MissingMessage(MessageId),
}

/// The host document as seen by the pipeline.
///
/// Implementations are driven from a single event loop; methods are
/// synchronous reads/writes of the current document state.
pub trait ChatPage: Send + Sync {
    /// All message elements in document order.
    fn list_messages(&self) -> Vec<MessageId>;

    fn message_exists(&self, id: &MessageId) -> bool;

    /// Whole-element text, including the sender name.
    fn message_text(&self, id: &MessageId) -> Option<String>;

    /// Text of the message body sub-element, when the page renders one.
    fn message_body_text(&self, id: &MessageId) -> Option<String>;

    /// `href` of the sender's profile link inside the message.
    fn sender_profile_href(&self, id: &MessageId) -> Option<String>;

    fn processed_mark(&self, id: &MessageId) -> Option<ProcessedMark>;

    fn set_processed_mark(&self, id: &MessageId, mark: Option<ProcessedMark>);

    /// Messages currently carrying any processed mark.
    fn processed_messages(&self) -> Vec<MessageId>;

    /// Remove from layout without leaving a trace.
    fn hide(&self, id: &MessageId);

    fn highlight(&self, id: &MessageId);

    fn clear_highlight(&self, id: &MessageId);

    /// Nearest message element enclosing (or equal to) `node`.
    fn enclosing_message(&self, node: NodeId) -> Option<MessageId>;

    /// Message elements strictly inside `node`.
    fn nested_messages(&self, node: NodeId) -> Vec<MessageId>;

    fn query_in_message(&self, id: &MessageId, selector: &Selector) -> Vec<ElementInfo>;

    fn query_document(&self, selector: &Selector) -> Vec<ElementInfo>;

    fn dispatch(&self, target: ElementHandle, event: PointerEvent) -> Result<(), PageError>;

    /// Click on the page body to close any open menu.
    fn dismiss_menus(&self);

    /// Register for mutation batches in the message subtree.
    fn observe(&self) -> UnboundedReceiver<Vec<PageMutation>>;

    /// Full page reload.
    fn reload(&self);
}
