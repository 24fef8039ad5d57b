//! # Config Tree
//!
//! Hierarchical, timestamped, observable key/value store for the Evergreen
//! agent.
//!
//! Nodes are either *Topics* (interior) or *Topic* leaves; identity is the
//! path from the root. Writes carry millisecond timestamps and resolve
//! conflicts last-writer-wins. All change notifications drain through a
//! single FIFO publish queue, so watchers observe one global order. A
//! transaction log plus snapshot under `<root>/config/` make committed
//! mutations durable across restarts.
//!
//! ## Example
//!
//! ```no_run
//! use config_tree::{ConfigTree, TopicPath, now_ms};
//! use serde_json::json;
//!
//! # fn example() -> config_tree::Result<()> {
//! let tree = ConfigTree::new();
//! let path = TopicPath::parse("/services/main/version")?;
//! tree.write(&path, json!("1.0"), now_ms())?;
//! assert_eq!(tree.read(&path), Some(json!("1.0")));
//! # Ok(())
//! # }
//! ```

mod error;
mod event;
mod node;
mod path;
mod store;
mod tlog;
mod tree;

pub use error::{Error, Result};
pub use event::{WatchEvent, WatchEventKind};
pub use node::Node;
pub use path::TopicPath;
pub use store::ConfigStore;
pub use tlog::{LogOp, LogRecord, TransactionLog};
pub use tree::{ConfigTree, MergeBehavior, WatchHandler, WatchId};

/// Current wall-clock time in milliseconds since the epoch
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
