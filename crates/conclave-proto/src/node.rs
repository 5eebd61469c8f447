//! Stanza tree model.
//!
//! Message envelopes arrive from the transport as trees of tagged nodes:
//! a tag, string attributes, and either nested nodes or raw bytes. The
//! decode pipeline consumes this shape and the retry receipt is built in it.
//!
//! This is a pure data holder. Attribute semantics (addressing, retry
//! counts, content kinds) live with the consumers.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Content of a stanza node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeContent {
    /// Empty element.
    #[default]
    None,
    /// Nested child nodes.
    Nodes(Vec<Node>),
    /// Raw binary content, typically ciphertext. [`Bytes`] keeps stanza
    /// clones cheap when a tree is handed to a background task.
    Bytes(Bytes),
}

/// A stanza tree node: tag, string attributes, content.
///
/// Attributes use a `BTreeMap` so serialized stanzas are deterministic,
/// which keeps golden assertions in tests stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Element tag.
    pub tag: String,
    /// String attributes.
    pub attrs: BTreeMap<String, String>,
    /// Nested nodes, raw bytes, or nothing.
    pub content: NodeContent,
}

impl Node {
    /// Empty node with the given tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into(), attrs: BTreeMap::new(), content: NodeContent::None }
    }

    /// Node with the given tag and attributes.
    pub fn with_attrs<K, V>(tag: impl Into<String>, attrs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            tag: tag.into(),
            attrs: attrs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            content: NodeContent::None,
        }
    }

    /// Attribute value, if present.
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// Insert or replace an attribute.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attrs.insert(name.into(), value.into());
    }

    /// Builder-style [`Node::set_attr`].
    #[must_use]
    pub fn attr_entry(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    /// First child with the given tag, if any.
    #[must_use]
    pub fn child(&self, tag: &str) -> Option<&Node> {
        self.children().iter().find(|node| node.tag == tag)
    }

    /// Child nodes; empty when content is bytes or nothing.
    #[must_use]
    pub fn children(&self) -> &[Node] {
        match &self.content {
            NodeContent::Nodes(nodes) => nodes,
            NodeContent::None | NodeContent::Bytes(_) => &[],
        }
    }

    /// Append a child node, converting empty content to a node list.
    ///
    /// Byte content is never silently dropped: pushing a child onto a byte
    /// node is a programming error and leaves the node unchanged.
    pub fn push_child(&mut self, node: Node) {
        match &mut self.content {
            NodeContent::Nodes(nodes) => nodes.push(node),
            NodeContent::None => self.content = NodeContent::Nodes(vec![node]),
            NodeContent::Bytes(_) => debug_assert!(false, "push_child on a byte node"),
        }
    }

    /// Builder-style [`Node::push_child`].
    #[must_use]
    pub fn child_entry(mut self, node: Node) -> Self {
        self.push_child(node);
        self
    }

    /// Builder-style byte content.
    #[must_use]
    pub fn bytes_content(mut self, bytes: impl Into<Bytes>) -> Self {
        self.content = NodeContent::Bytes(bytes.into());
        self
    }

    /// Binary content, if this is a byte node.
    #[must_use]
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.content {
            NodeContent::Bytes(bytes) => Some(bytes.as_ref()),
            NodeContent::None | NodeContent::Nodes(_) => None,
        }
    }
}
