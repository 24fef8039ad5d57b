//! Watch events delivered through the publish queue

use crate::path::TopicPath;
use serde_json::Value;

/// What happened to a watched node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// Delivered once to a new watcher with the node's current value
    Initialized,
    /// A leaf value changed
    Changed,
    /// The watched node was removed
    Removed,
    /// A child appeared under the watched node
    ChildAdded,
    /// A child disappeared from under the watched node
    ChildRemoved,
}

/// A change notification
///
/// For `ChildAdded`/`ChildRemoved` the path names the child while delivery
/// targets watchers of the parent.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    /// The node the event describes
    pub path: TopicPath,
    /// What happened
    pub kind: WatchEventKind,
    /// The node's value after the change (absent for removals)
    pub value: Option<Value>,
}
