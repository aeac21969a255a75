//! In-process substrate without an index.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;

use super::{Child, ChildKind, Node, NodePath, SubstrateError, TreeSubstrate, validate_path};
use crate::cache::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::substrate::memory";

#[derive(Debug, Clone)]
enum Entry {
    Container,
    Node(Vec<(String, Bytes)>),
}

/// Tree held in a sorted map. Descendants of a path sort directly after it,
/// so subtree operations are contiguous range scans.
#[derive(Debug, Default)]
pub struct MemorySubstrate {
    tree: RwLock<BTreeMap<NodePath, Entry>>,
}

impl MemorySubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leaf nodes currently held.
    pub fn node_count(&self) -> usize {
        rw_read(&self.tree, SOURCE, "node_count")
            .values()
            .filter(|entry| matches!(entry, Entry::Node(_)))
            .count()
    }
}

fn descendants<'a>(
    tree: &'a BTreeMap<NodePath, Entry>,
    base: &'a NodePath,
) -> impl Iterator<Item = (&'a NodePath, &'a Entry)> + 'a {
    tree.range(base.clone()..)
        .take_while(move |(path, _)| path.strip_prefix(base).is_some())
}

#[async_trait]
impl TreeSubstrate for MemorySubstrate {
    async fn create_container(&self, path: &NodePath) -> Result<(), SubstrateError> {
        validate_path(path)?;
        let mut tree = rw_write(&self.tree, SOURCE, "create_container");
        let mut current = NodePath::root();
        for segment in path.segments() {
            current = current.child(segment.clone());
            match tree.get(&current) {
                Some(Entry::Container) => {}
                Some(Entry::Node(_)) => return Err(SubstrateError::NotAContainer(current)),
                None => {
                    tree.insert(current.clone(), Entry::Container);
                }
            }
        }
        Ok(())
    }

    async fn write_node(
        &self,
        path: &NodePath,
        properties: &[(String, Bytes)],
    ) -> Result<(), SubstrateError> {
        validate_path(path)?;
        let parent = path
            .parent()
            .ok_or_else(|| SubstrateError::IsAContainer(NodePath::root()))?;
        let mut tree = rw_write(&self.tree, SOURCE, "write_node");
        if !parent.is_root() && !matches!(tree.get(&parent), Some(Entry::Container)) {
            return Err(SubstrateError::NotAContainer(parent));
        }
        if matches!(tree.get(path), Some(Entry::Container)) {
            return Err(SubstrateError::IsAContainer(path.clone()));
        }
        tree.insert(path.clone(), Entry::Node(properties.to_vec()));
        Ok(())
    }

    async fn read_node(&self, path: &NodePath) -> Result<Option<Node>, SubstrateError> {
        let tree = rw_read(&self.tree, SOURCE, "read_node");
        Ok(match tree.get(path) {
            Some(Entry::Node(properties)) => Some(Node {
                path: path.clone(),
                properties: properties.clone(),
            }),
            _ => None,
        })
    }

    async fn read_property(
        &self,
        path: &NodePath,
        name: &str,
    ) -> Result<Option<Bytes>, SubstrateError> {
        let tree = rw_read(&self.tree, SOURCE, "read_property");
        Ok(match tree.get(path) {
            Some(Entry::Node(properties)) => properties
                .iter()
                .find(|(candidate, _)| candidate == name)
                .map(|(_, value)| value.clone()),
            _ => None,
        })
    }

    async fn list_children(&self, path: &NodePath) -> Result<Vec<Child>, SubstrateError> {
        let tree = rw_read(&self.tree, SOURCE, "list_children");
        if let Some(Entry::Node(_)) = tree.get(path) {
            return Err(SubstrateError::NotAContainer(path.clone()));
        }
        let depth = path.segments().len() + 1;
        Ok(descendants(&tree, path)
            .filter(|(candidate, _)| candidate.segments().len() == depth)
            .filter_map(|(candidate, entry)| {
                let name = candidate.name()?.to_string();
                let kind = match entry {
                    Entry::Container => ChildKind::Container,
                    Entry::Node(_) => ChildKind::Node,
                };
                Some(Child { name, kind })
            })
            .collect())
    }

    async fn delete_subtree(&self, path: &NodePath) -> Result<(), SubstrateError> {
        let mut tree = rw_write(&self.tree, SOURCE, "delete_subtree");
        if path.is_root() {
            tree.clear();
            return Ok(());
        }
        let doomed: Vec<NodePath> = descendants(&tree, path)
            .map(|(candidate, _)| candidate.clone())
            .collect();
        for candidate in doomed {
            tree.remove(&candidate);
        }
        Ok(())
    }

    async fn query_indexed(
        &self,
        _property: &str,
        _value: &[u8],
    ) -> Result<Vec<NodePath>, SubstrateError> {
        Err(SubstrateError::Unsupported)
    }
}
