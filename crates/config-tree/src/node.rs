//! Tree nodes
//!
//! Two node kinds: `Topic` (leaf holding a scalar value) and `Topics`
//! (interior mapping names to children). Every node carries the timestamp of
//! its last change.

use serde_json::Value;
use std::collections::BTreeMap;

/// A node in the configuration tree
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Leaf node holding a value
    Topic {
        /// The leaf value
        value: Value,
        /// Timestamp (ms) of the last change
        modified_at: u64,
    },
    /// Interior node mapping names to children
    Topics {
        /// Child nodes by name; ordered for deterministic traversal
        children: BTreeMap<String, Node>,
        /// Timestamp (ms) of the last structural change
        modified_at: u64,
    },
}

impl Node {
    /// Create an empty interior node
    pub fn topics(modified_at: u64) -> Self {
        Node::Topics {
            children: BTreeMap::new(),
            modified_at,
        }
    }

    /// Create a leaf node
    pub fn topic(value: Value, modified_at: u64) -> Self {
        Node::Topic { value, modified_at }
    }

    /// Timestamp of the last change
    pub fn modified_at(&self) -> u64 {
        match self {
            Node::Topic { modified_at, .. } => *modified_at,
            Node::Topics { modified_at, .. } => *modified_at,
        }
    }

    /// True for leaf nodes
    pub fn is_topic(&self) -> bool {
        matches!(self, Node::Topic { .. })
    }

    /// Navigate to a descendant by segments
    pub fn get(&self, segments: &[String]) -> Option<&Node> {
        let mut node = self;
        for segment in segments {
            match node {
                Node::Topics { children, .. } => node = children.get(segment)?,
                Node::Topic { .. } => return None,
            }
        }
        Some(node)
    }

    /// Structural copy of this subtree as a plain value
    ///
    /// Interior nodes become objects, leaves their values; timestamps are not
    /// part of the copy.
    pub fn to_value(&self) -> Value {
        match self {
            Node::Topic { value, .. } => value.clone(),
            Node::Topics { children, .. } => Value::Object(
                children
                    .iter()
                    .map(|(name, child)| (name.clone(), child.to_value()))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_navigates() {
        let mut children = BTreeMap::new();
        children.insert("version".to_string(), Node::topic(json!("1.0"), 5));
        let mut services = BTreeMap::new();
        services.insert(
            "main".to_string(),
            Node::Topics {
                children,
                modified_at: 5,
            },
        );
        let root = Node::Topics {
            children: services,
            modified_at: 5,
        };

        let segments = vec!["main".to_string(), "version".to_string()];
        let node = root.get(&segments).unwrap();
        assert_eq!(node.to_value(), json!("1.0"));
        assert!(root.get(&["absent".to_string()]).is_none());
    }

    #[test]
    fn test_to_value_shape() {
        let mut children = BTreeMap::new();
        children.insert("a".to_string(), Node::topic(json!(1), 0));
        children.insert("b".to_string(), Node::topic(json!("x"), 0));
        let root = Node::Topics {
            children,
            modified_at: 0,
        };
        assert_eq!(root.to_value(), json!({"a": 1, "b": "x"}));
    }
}
