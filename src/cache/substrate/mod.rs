//! Hierarchical node storage the persistent store is built on.
//!
//! A substrate is a tree of containers and leaf nodes. Leaf nodes carry an
//! ordered list of named binary properties and are always replaced whole, so
//! readers never observe a half-written node.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

mod fs;
mod memory;

pub use fs::FsSubstrate;
pub use memory::MemorySubstrate;

#[derive(Debug, Error)]
pub enum SubstrateError {
    #[error("invalid node name `{0}`")]
    InvalidName(String),
    #[error("`{0}` is not a container")]
    NotAContainer(NodePath),
    #[error("`{0}` is a container")]
    IsAContainer(NodePath),
    #[error("corrupt node `{path}`: {reason}")]
    Corrupt { path: NodePath, reason: String },
    #[error("indexed queries are not supported by this substrate")]
    Unsupported,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("substrate task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Absolute path of a node, as segments below the substrate root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodePath(Vec<String>);

impl NodePath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Parse the `/a/b/c` form produced by `Display`.
    pub fn parse(raw: &str) -> Self {
        Self::from_segments(raw.split('/').filter(|segment| !segment.is_empty()))
    }

    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(name.into());
        Self(segments)
    }

    pub fn join<S: AsRef<str>>(&self, names: &[S]) -> Self {
        let mut segments = self.0.clone();
        segments.extend(names.iter().map(|name| name.as_ref().to_string()));
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn name(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    pub fn parent(&self) -> Option<Self> {
        let (_, parent) = self.0.split_last()?;
        Some(Self(parent.to_vec()))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Segments below `base`, if this path lies under it.
    pub fn strip_prefix(&self, base: &NodePath) -> Option<&[String]> {
        self.0.strip_prefix(base.0.as_slice())
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.0 {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

/// A leaf node and its properties, in write order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub path: NodePath,
    pub properties: Vec<(String, Bytes)>,
}

impl Node {
    pub fn property(&self, name: &str) -> Option<&Bytes> {
        self.properties
            .iter()
            .find(|(candidate, _)| candidate == name)
            .map(|(_, value)| value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    Container,
    Node,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Child {
    pub name: String,
    pub kind: ChildKind,
}

#[async_trait]
pub trait TreeSubstrate: Send + Sync {
    /// Create a container and any missing ancestors. Existing containers are kept.
    async fn create_container(&self, path: &NodePath) -> Result<(), SubstrateError>;

    /// Replace the node at `path` atomically. The parent container must exist.
    async fn write_node(
        &self,
        path: &NodePath,
        properties: &[(String, Bytes)],
    ) -> Result<(), SubstrateError>;

    async fn read_node(&self, path: &NodePath) -> Result<Option<Node>, SubstrateError>;

    async fn read_property(
        &self,
        path: &NodePath,
        name: &str,
    ) -> Result<Option<Bytes>, SubstrateError>;

    /// Direct children of a container, sorted by name. Missing containers list empty.
    async fn list_children(&self, path: &NodePath) -> Result<Vec<Child>, SubstrateError>;

    /// Remove a node or a container with everything below it. Missing paths are a no-op.
    async fn delete_subtree(&self, path: &NodePath) -> Result<(), SubstrateError>;

    /// Nodes whose indexed `property` equals `value`.
    /// Substrates without an index return [`SubstrateError::Unsupported`].
    async fn query_indexed(
        &self,
        property: &str,
        value: &[u8],
    ) -> Result<Vec<NodePath>, SubstrateError>;
}

pub(crate) fn validate_segment(segment: &str) -> Result<(), SubstrateError> {
    let valid = !segment.is_empty()
        && segment != ".."
        && !segment.starts_with('.')
        && !segment.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(SubstrateError::InvalidName(segment.to_string()))
    }
}

pub(crate) fn validate_path(path: &NodePath) -> Result<(), SubstrateError> {
    path.segments()
        .iter()
        .try_for_each(|segment| validate_segment(segment))
}
