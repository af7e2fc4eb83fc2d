//! Version control object types and utilities.

use crate::{Result, StorageError};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use std::fmt;

/// A 20-byte SHA-1 object identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 20]);

impl Serialize for ObjectId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ObjectId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl ObjectId {
    /// Creates an ObjectId from raw bytes.
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Creates an ObjectId from a hex string.
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != 40 {
            return Err(StorageError::InvalidObject(format!(
                "invalid object id length: {}",
                hex.len()
            )));
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(hex, &mut bytes)
            .map_err(|e| StorageError::InvalidObject(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// The all-zero identifier used on the wire to mark ref creation
    /// and deletion.
    pub const fn zero() -> Self {
        Self([0u8; 20])
    }

    /// Returns true if this is the all-zero identifier.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Returns the hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Computes the SHA-1 hash of data with an object header.
    pub fn hash_object(object_type: ObjectType, data: &[u8]) -> Self {
        let header = format!("{} {}\0", object_type.as_str(), data.len());
        let mut hasher = Sha1::new();
        hasher.update(header.as_bytes());
        hasher.update(data);
        let result = hasher.finalize();
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&result);
        Self(bytes)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Object types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    /// File content.
    Blob,
    /// Directory listing.
    Tree,
    /// Commit object.
    Commit,
    /// Annotated tag.
    Tag,
}

impl ObjectType {
    /// Returns the string representation used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::Tree => "tree",
            Self::Commit => "commit",
            Self::Tag => "tag",
        }
    }

    /// Parses an object type from a string.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "blob" => Ok(Self::Blob),
            "tree" => Ok(Self::Tree),
            "commit" => Ok(Self::Commit),
            "tag" => Ok(Self::Tag),
            _ => Err(StorageError::InvalidObject(format!(
                "unknown object type: {}",
                s
            ))),
        }
    }
}

/// A single entry in a tree object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// File mode as an octal string (e.g. "100644", "40000").
    pub mode: String,
    /// Entry name within the tree.
    pub name: String,
    /// Identifier of the referenced object.
    pub id: ObjectId,
}

impl TreeEntry {
    /// Creates a new tree entry.
    pub fn new(mode: impl Into<String>, name: impl Into<String>, id: ObjectId) -> Self {
        Self {
            mode: mode.into(),
            name: name.into(),
            id,
        }
    }

    /// Returns true if this entry points at a subtree.
    pub fn is_tree(&self) -> bool {
        self.mode == "40000" || self.mode == "040000"
    }
}

/// A version control object (blob, tree, commit, or tag).
#[derive(Debug, Clone)]
pub struct GitObject {
    /// The object's unique identifier (SHA-1 hash).
    pub id: ObjectId,
    /// The type of object.
    pub object_type: ObjectType,
    /// The raw object data (uncompressed).
    pub data: Bytes,
}

impl GitObject {
    /// Creates a new object, computing its ID from the data.
    pub fn new(object_type: ObjectType, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let id = ObjectId::hash_object(object_type, &data);
        Self {
            id,
            object_type,
            data,
        }
    }

    /// Creates a blob object from file content.
    pub fn blob(content: impl Into<Bytes>) -> Self {
        Self::new(ObjectType::Blob, content)
    }

    /// Creates a tree object from its entries.
    ///
    /// Entries are serialized in the binary on-disk format:
    /// `<mode> <name>\0<20-byte id>` for each entry.
    pub fn tree(entries: &[TreeEntry]) -> Self {
        let mut data = Vec::new();
        for entry in entries {
            data.extend_from_slice(entry.mode.as_bytes());
            data.push(b' ');
            data.extend_from_slice(entry.name.as_bytes());
            data.push(0);
            data.extend_from_slice(entry.id.as_bytes());
        }
        Self::new(ObjectType::Tree, data)
    }

    /// Creates a commit object.
    pub fn commit(
        tree_id: &ObjectId,
        parents: &[ObjectId],
        author: &str,
        committer: &str,
        message: &str,
    ) -> Self {
        let mut content = format!("tree {}\n", tree_id);
        for parent in parents {
            content.push_str(&format!("parent {}\n", parent));
        }
        content.push_str(&format!("author {}\n", author));
        content.push_str(&format!("committer {}\n", committer));
        content.push_str(&format!("\n{}", message));
        Self::new(ObjectType::Commit, content.into_bytes())
    }

    /// Returns the size of the object data.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Parses the binary entries of a tree object.
    pub fn tree_entries(&self) -> Result<Vec<TreeEntry>> {
        if self.object_type != ObjectType::Tree {
            return Err(StorageError::InvalidObject(format!(
                "expected tree, found {}",
                self.object_type.as_str()
            )));
        }

        let mut entries = Vec::new();
        let mut rest = self.data.as_ref();
        while !rest.is_empty() {
            let space = rest
                .iter()
                .position(|&b| b == b' ')
                .ok_or_else(|| StorageError::InvalidObject("tree entry missing mode".into()))?;
            let mode = String::from_utf8_lossy(&rest[..space]).into_owned();
            rest = &rest[space + 1..];

            let nul = rest
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| StorageError::InvalidObject("tree entry missing name".into()))?;
            let name = String::from_utf8_lossy(&rest[..nul]).into_owned();
            rest = &rest[nul + 1..];

            if rest.len() < 20 {
                return Err(StorageError::InvalidObject(
                    "tree entry truncated before object id".into(),
                ));
            }
            let mut id_bytes = [0u8; 20];
            id_bytes.copy_from_slice(&rest[..20]);
            rest = &rest[20..];

            entries.push(TreeEntry {
                mode,
                name,
                id: ObjectId::from_bytes(id_bytes),
            });
        }
        Ok(entries)
    }

    /// Reads the tree identifier from a commit header.
    pub fn commit_tree(&self) -> Result<ObjectId> {
        self.scan_header("tree ")
            .next()
            .transpose()?
            .ok_or_else(|| StorageError::InvalidObject("commit has no tree header".into()))
    }

    /// Reads all parent identifiers from a commit header.
    pub fn commit_parents(&self) -> Result<Vec<ObjectId>> {
        self.scan_header("parent ").collect()
    }

    /// Reads the target identifier from a tag header.
    pub fn tag_target(&self) -> Result<ObjectId> {
        self.scan_header("object ")
            .next()
            .transpose()?
            .ok_or_else(|| StorageError::InvalidObject("tag has no object header".into()))
    }

    /// Scans header lines (everything before the first blank line) for
    /// lines starting with `prefix` and parses the rest as an object id.
    fn scan_header<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = Result<ObjectId>> + 'a {
        let content = String::from_utf8_lossy(&self.data).into_owned();
        content
            .lines()
            .take_while(|line| !line.is_empty())
            .filter_map(|line| line.strip_prefix(prefix).map(ObjectId::from_hex))
            .collect::<Vec<_>>()
            .into_iter()
    }
}
