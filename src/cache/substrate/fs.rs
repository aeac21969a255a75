//! Filesystem substrate.
//!
//! Containers are directories and every leaf node is a single file holding
//! its properties framed as `(u32 name length, name, u64 value length, value)*`
//! in big-endian order. Nodes are written to a temp file beside the target and
//! renamed over it. Indexed properties are mirrored under
//! `_index/<property>/<ab>/<cd>/<value>`, each index file holding the node
//! path. `ab` and `cd` are the first two bytes of the value's SHA-256, so no
//! index directory grows past 256 children before the leaf level.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::debug;

use super::{
    Child, ChildKind, Node, NodePath, SubstrateError, TreeSubstrate, validate_path,
    validate_segment,
};

const INDEX_DIR: &str = "_index";

#[derive(Debug, Clone)]
pub struct FsSubstrate {
    root: PathBuf,
    indexed: Vec<String>,
}

impl FsSubstrate {
    /// Open a substrate rooted at `root`, creating the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, SubstrateError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            indexed: Vec::new(),
        })
    }

    /// Maintain an index for `property` on every node write.
    pub fn with_index(mut self, property: impl Into<String>) -> Self {
        let property = property.into();
        if !self.indexed.contains(&property) {
            self.indexed.push(property);
        }
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &NodePath) -> Result<PathBuf, SubstrateError> {
        validate_path(path)?;
        if path.segments().first().is_some_and(|first| first == INDEX_DIR) {
            return Err(SubstrateError::InvalidName(INDEX_DIR.to_string()));
        }
        let mut resolved = self.root.clone();
        resolved.extend(path.segments());
        Ok(resolved)
    }

    fn is_indexed(&self, property: &str) -> bool {
        self.indexed.iter().any(|candidate| candidate == property)
    }

    fn index_file(&self, property: &str, value: &[u8]) -> PathBuf {
        let [outer, inner] = index_shards(value);
        self.root
            .join(INDEX_DIR)
            .join(property)
            .join(outer)
            .join(inner)
            .join(index_token(value))
    }

    async fn write_index(&self, property: &str, value: &[u8], path: &NodePath) -> Result<(), SubstrateError> {
        validate_segment(property)?;
        let file = self.index_file(property, value);
        let Some(dir) = file.parent().map(Path::to_path_buf) else {
            return Err(SubstrateError::InvalidName(property.to_string()));
        };
        fs::create_dir_all(&dir).await?;
        write_atomically(dir, file, Bytes::from(path.to_string())).await
    }

    /// Drop index entries that still point at `path`.
    async fn unindex(&self, path: &NodePath, properties: &[(String, Bytes)]) -> Result<(), SubstrateError> {
        for (name, value) in properties {
            if !self.is_indexed(name) {
                continue;
            }
            let file = self.index_file(name, value);
            match fs::read_to_string(&file).await {
                Ok(target) if NodePath::parse(&target) == *path => {
                    remove_file_if_exists(&file).await?;
                }
                Ok(_) => {}
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    async fn load(&self, path: &NodePath) -> Result<Option<Vec<(String, Bytes)>>, SubstrateError> {
        let file = self.resolve(path)?;
        match fs::metadata(&file).await {
            Ok(metadata) if metadata.is_file() => {}
            Ok(_) => return Ok(None),
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        }
        let data = match fs::read(&file).await {
            Ok(data) => data,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        decode_properties(Bytes::from(data))
            .map(Some)
            .map_err(|reason| SubstrateError::Corrupt {
                path: path.clone(),
                reason,
            })
    }
}

#[async_trait]
impl TreeSubstrate for FsSubstrate {
    async fn create_container(&self, path: &NodePath) -> Result<(), SubstrateError> {
        let dir = self.resolve(path)?;
        match fs::create_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::AlreadyExists | io::ErrorKind::NotADirectory
                ) =>
            {
                Err(SubstrateError::NotAContainer(path.clone()))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn write_node(
        &self,
        path: &NodePath,
        properties: &[(String, Bytes)],
    ) -> Result<(), SubstrateError> {
        let file = self.resolve(path)?;
        let parent = path
            .parent()
            .ok_or_else(|| SubstrateError::IsAContainer(NodePath::root()))?;
        let dir = self.resolve(&parent)?;
        match fs::metadata(&dir).await {
            Ok(metadata) if metadata.is_dir() => {}
            _ => return Err(SubstrateError::NotAContainer(parent)),
        }
        if fs::metadata(&file).await.is_ok_and(|metadata| metadata.is_dir()) {
            return Err(SubstrateError::IsAContainer(path.clone()));
        }

        if let Some(previous) = self.load(path).await? {
            self.unindex(path, &previous).await?;
        }

        write_atomically(dir, file, encode_properties(properties)).await?;

        for (name, value) in properties {
            if self.is_indexed(name) {
                self.write_index(name, value, path).await?;
            }
        }
        Ok(())
    }

    async fn read_node(&self, path: &NodePath) -> Result<Option<Node>, SubstrateError> {
        Ok(self.load(path).await?.map(|properties| Node {
            path: path.clone(),
            properties,
        }))
    }

    async fn read_property(
        &self,
        path: &NodePath,
        name: &str,
    ) -> Result<Option<Bytes>, SubstrateError> {
        Ok(self.load(path).await?.and_then(|properties| {
            properties
                .into_iter()
                .find(|(candidate, _)| candidate == name)
                .map(|(_, value)| value)
        }))
    }

    async fn list_children(&self, path: &NodePath) -> Result<Vec<Child>, SubstrateError> {
        let dir = self.resolve(path)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) if error.kind() == io::ErrorKind::NotADirectory => {
                return Err(SubstrateError::NotAContainer(path.clone()));
            }
            Err(error) => return Err(error.into()),
        };

        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') || (path.is_root() && name == INDEX_DIR) {
                continue;
            }
            let kind = if entry.file_type().await?.is_dir() {
                ChildKind::Container
            } else {
                ChildKind::Node
            };
            children.push(Child { name, kind });
        }
        children.sort_by(|left, right| left.name.cmp(&right.name));
        Ok(children)
    }

    async fn delete_subtree(&self, path: &NodePath) -> Result<(), SubstrateError> {
        if path.is_root() {
            match fs::remove_dir_all(&self.root).await {
                Ok(()) => {}
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => return Err(error.into()),
            }
            fs::create_dir_all(&self.root).await?;
            return Ok(());
        }

        let target = self.resolve(path)?;
        let metadata = match fs::metadata(&target).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(error) => return Err(error.into()),
        };

        if metadata.is_dir() {
            // Index entries below the subtree go stale and are pruned on query.
            fs::remove_dir_all(&target).await?;
        } else {
            if let Some(properties) = self.load(path).await? {
                self.unindex(path, &properties).await?;
            }
            remove_file_if_exists(&target).await?;
        }
        Ok(())
    }

    async fn query_indexed(
        &self,
        property: &str,
        value: &[u8],
    ) -> Result<Vec<NodePath>, SubstrateError> {
        if !self.is_indexed(property) {
            return Err(SubstrateError::Unsupported);
        }
        let file = self.index_file(property, value);
        let target = match fs::read_to_string(&file).await {
            Ok(target) => NodePath::parse(&target),
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let live = self
            .load(&target)
            .await?
            .and_then(|properties| {
                properties
                    .into_iter()
                    .find(|(name, _)| name == property)
                    .map(|(_, stored)| stored)
            })
            .is_some_and(|stored| stored.as_ref() == value);
        if !live {
            debug!(property, node = %target, "pruning stale index entry");
            remove_file_if_exists(&file).await?;
            return Ok(Vec::new());
        }
        Ok(vec![target])
    }
}

/// Two 256-way shard directories taken from the value's digest.
fn index_shards(value: &[u8]) -> [String; 2] {
    let digest = Sha256::digest(value);
    [hex::encode(&digest[..1]), hex::encode(&digest[1..2])]
}

fn index_token(value: &[u8]) -> String {
    let plain = !value.is_empty()
        && value
            .iter()
            .all(|byte| byte.is_ascii_alphanumeric() || *byte == b'-' || *byte == b'_');
    match std::str::from_utf8(value) {
        Ok(text) if plain => text.to_string(),
        _ => format!("x{}", hex::encode(value)),
    }
}

async fn remove_file_if_exists(path: &Path) -> Result<(), SubstrateError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error.into()),
    }
}

async fn write_atomically(dir: PathBuf, target: PathBuf, data: Bytes) -> Result<(), SubstrateError> {
    tokio::task::spawn_blocking(move || -> io::Result<()> {
        let mut temp = tempfile::Builder::new().prefix(".node-").tempfile_in(&dir)?;
        temp.write_all(&data)?;
        temp.as_file().sync_data()?;
        temp.persist(&target).map_err(|error| error.error)?;
        Ok(())
    })
    .await??;
    Ok(())
}

pub(crate) fn encode_properties(properties: &[(String, Bytes)]) -> Bytes {
    let capacity = properties
        .iter()
        .map(|(name, value)| 12 + name.len() + value.len())
        .sum();
    let mut buf = BytesMut::with_capacity(capacity);
    for (name, value) in properties {
        buf.put_u32(name.len() as u32);
        buf.put_slice(name.as_bytes());
        buf.put_u64(value.len() as u64);
        buf.put_slice(value);
    }
    buf.freeze()
}

pub(crate) fn decode_properties(mut buf: Bytes) -> Result<Vec<(String, Bytes)>, String> {
    let mut properties = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 4 {
            return Err("truncated name length".to_string());
        }
        let name_len = buf.get_u32() as usize;
        if buf.remaining() < name_len {
            return Err("truncated property name".to_string());
        }
        let name = String::from_utf8(buf.split_to(name_len).to_vec())
            .map_err(|_| "property name is not utf-8".to_string())?;
        if buf.remaining() < 8 {
            return Err(format!("truncated length of `{name}`"));
        }
        let value_len = usize::try_from(buf.get_u64())
            .map_err(|_| format!("length of `{name}` out of range"))?;
        if buf.remaining() < value_len {
            return Err(format!("truncated value of `{name}`"));
        }
        properties.push((name, buf.split_to(value_len)));
    }
    Ok(properties)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &'static str)]) -> Vec<(String, Bytes)> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), Bytes::from(*value)))
            .collect()
    }

    async fn substrate(dir: &tempfile::TempDir) -> FsSubstrate {
        FsSubstrate::open(dir.path())
            .await
            .expect("open")
            .with_index("key_hash")
    }

    #[test]
    fn framing_survives_binary_values() {
        let properties = vec![
            ("key".to_string(), Bytes::from_static(b"\x00\x01\xff")),
            ("body".to_string(), Bytes::new()),
        ];
        let encoded = encode_properties(&properties);
        assert_eq!(decode_properties(encoded).expect("decode"), properties);
    }

    #[test]
    fn truncated_frames_are_corrupt() {
        let encoded = encode_properties(&props(&[("body", "hello")]));
        let truncated = encoded.slice(..encoded.len() - 2);
        assert!(decode_properties(truncated).is_err());
        assert!(decode_properties(Bytes::from_static(b"\x00\x00")).is_err());
    }

    #[tokio::test]
    async fn write_read_and_replace_nodes() {
        let dir = tempfile::tempdir().expect("temp dir");
        let substrate = substrate(&dir).await;
        let bucket = NodePath::from_segments(["0"]);
        let node = bucket.child("e0");

        assert!(matches!(
            substrate.write_node(&node, &props(&[("body", "a")])).await,
            Err(SubstrateError::NotAContainer(_))
        ));

        substrate.create_container(&bucket).await.expect("bucket");
        substrate
            .write_node(&node, &props(&[("body", "a")]))
            .await
            .expect("write");
        substrate
            .write_node(&node, &props(&[("body", "b")]))
            .await
            .expect("replace");

        assert_eq!(
            substrate.read_property(&node, "body").await.expect("read"),
            Some(Bytes::from("b"))
        );
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("0"))
            .expect("read dir")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind");
    }

    #[tokio::test]
    async fn index_tracks_writes_and_deletes() {
        let dir = tempfile::tempdir().expect("temp dir");
        let substrate = substrate(&dir).await;
        let bucket = NodePath::from_segments(["1"]);
        let node = bucket.child("e2");
        substrate.create_container(&bucket).await.expect("bucket");
        substrate
            .write_node(&node, &props(&[("key_hash", "abc123"), ("body", "x")]))
            .await
            .expect("write");

        assert_eq!(
            substrate.query_indexed("key_hash", b"abc123").await.expect("query"),
            [node.clone()]
        );
        assert!(matches!(
            substrate.query_indexed("body", b"x").await,
            Err(SubstrateError::Unsupported)
        ));

        substrate.delete_subtree(&node).await.expect("delete");
        assert!(substrate
            .query_indexed("key_hash", b"abc123")
            .await
            .expect("query")
            .is_empty());
    }

    #[tokio::test]
    async fn stale_index_entries_are_pruned() {
        let dir = tempfile::tempdir().expect("temp dir");
        let substrate = substrate(&dir).await;
        let bucket = NodePath::from_segments(["0"]);
        substrate.create_container(&bucket).await.expect("bucket");
        substrate
            .write_node(&bucket.child("e0"), &props(&[("key_hash", "k1")]))
            .await
            .expect("write");

        substrate.delete_subtree(&bucket).await.expect("delete bucket");

        assert!(substrate
            .query_indexed("key_hash", b"k1")
            .await
            .expect("query")
            .is_empty());
        assert!(!substrate.index_file("key_hash", b"k1").exists());
    }

    #[tokio::test]
    async fn listing_hides_index_and_temp_files() {
        let dir = tempfile::tempdir().expect("temp dir");
        let substrate = substrate(&dir).await;
        let bucket = NodePath::from_segments(["0"]);
        substrate.create_container(&bucket).await.expect("bucket");
        substrate
            .write_node(&bucket.child("e0"), &props(&[("key_hash", "k")]))
            .await
            .expect("write");
        std::fs::write(dir.path().join(".stray"), b"tmp").expect("stray file");

        let root = substrate.list_children(&NodePath::root()).await.expect("list");
        assert_eq!(root, [Child {
            name: "0".to_string(),
            kind: ChildKind::Container
        }]);
        assert!(substrate
            .list_children(&NodePath::from_segments(["missing"]))
            .await
            .expect("list")
            .is_empty());
    }

    #[tokio::test]
    async fn clearing_root_keeps_substrate_usable() {
        let dir = tempfile::tempdir().expect("temp dir");
        let substrate = substrate(&dir).await;
        let bucket = NodePath::from_segments(["0"]);
        substrate.create_container(&bucket).await.expect("bucket");
        substrate
            .write_node(&bucket.child("e0"), &props(&[("key_hash", "k")]))
            .await
            .expect("write");

        substrate.delete_subtree(&NodePath::root()).await.expect("clear");

        assert!(dir.path().exists());
        assert!(substrate.list_children(&NodePath::root()).await.expect("list").is_empty());
        assert!(substrate.query_indexed("key_hash", b"k").await.expect("query").is_empty());
    }

    #[tokio::test]
    async fn index_entries_are_sharded_by_digest() {
        let dir = tempfile::tempdir().expect("temp dir");
        let substrate = substrate(&dir).await;
        let bucket = NodePath::from_segments(["0"]);
        substrate.create_container(&bucket).await.expect("bucket");
        for index in 0..3 {
            let hash = format!("{index:064x}");
            substrate
                .write_node(&bucket.child(format!("e{index}")), &[("key_hash".to_string(), Bytes::from(hash))])
                .await
                .expect("write");
        }

        let property_dir = dir.path().join(INDEX_DIR).join("key_hash");
        let mut files = 0;
        for outer in std::fs::read_dir(&property_dir).expect("outer shards").filter_map(Result::ok) {
            let outer_name = outer.file_name().to_string_lossy().into_owned();
            assert_eq!(outer_name.len(), 2, "shard name {outer_name}");
            for inner in std::fs::read_dir(outer.path()).expect("inner shards").filter_map(Result::ok) {
                assert_eq!(inner.file_name().len(), 2);
                files += std::fs::read_dir(inner.path()).expect("index files").count();
            }
        }
        assert_eq!(files, 3);

        let expected = format!("{:064x}", 2);
        let sharded = substrate.index_file("key_hash", expected.as_bytes());
        let relative = sharded.strip_prefix(&property_dir).expect("under the property");
        assert_eq!(relative.components().count(), 3);
        assert!(sharded.exists());
        assert_eq!(
            substrate.query_indexed("key_hash", expected.as_bytes()).await.expect("query"),
            [bucket.child("e2")]
        );
    }

    #[test]
    fn index_tokens_escape_unsafe_values() {
        assert_eq!(index_token(b"abc-123_x"), "abc-123_x");
        assert_eq!(index_token(b"a/b"), "x612f62");
        assert_eq!(index_token(b""), "x");
    }
}
