//! Pack file emission.

use crate::pack::checksum::ChecksumWriter;
use crate::pack::{encode_entry_header, PackEntryKind, PACK_SIGNATURE, PACK_VERSION};
use crate::Result;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use gitferry_storage::{GitObject, ObjectId, ObjectStore, ObjectType};
use std::collections::HashSet;
use std::io::Write;

/// Gathers object closures and serializes them as pack files.
///
/// Emitted packs contain whole objects only; deltas are accepted on the
/// read path but never produced here.
pub struct PackWriter<'a> {
    store: &'a ObjectStore,
}

impl<'a> PackWriter<'a> {
    /// Creates a pack writer over a repository's object store.
    pub fn new(store: &'a ObjectStore) -> Self {
        Self { store }
    }

    /// Computes the closure of the wanted objects, stopping at anything
    /// the client already has. Wants are walked in sorted order so the
    /// result is deterministic.
    pub fn closure(
        &self,
        wants: &HashSet<ObjectId>,
        haves: &HashSet<ObjectId>,
    ) -> Result<Vec<GitObject>> {
        let mut sorted: Vec<ObjectId> = wants.iter().copied().collect();
        sorted.sort();

        let mut visited = HashSet::new();
        let mut out = Vec::new();
        for want in &sorted {
            self.gather(want, haves, &mut visited, &mut out)?;
        }
        Ok(out)
    }

    /// Recursively collects an object and everything it references.
    fn gather(
        &self,
        id: &ObjectId,
        haves: &HashSet<ObjectId>,
        visited: &mut HashSet<ObjectId>,
        out: &mut Vec<GitObject>,
    ) -> Result<()> {
        if haves.contains(id) || !visited.insert(*id) {
            return Ok(());
        }

        let object = self.store.get(id)?;
        match object.object_type {
            ObjectType::Commit => {
                let tree = object.commit_tree()?;
                let parents = object.commit_parents()?;
                out.push(object);
                self.gather(&tree, haves, visited, out)?;
                for parent in &parents {
                    self.gather(parent, haves, visited, out)?;
                }
            }
            ObjectType::Tree => {
                let entries = object.tree_entries()?;
                out.push(object);
                for entry in &entries {
                    self.gather(&entry.id, haves, visited, out)?;
                }
            }
            ObjectType::Tag => {
                let target = object.tag_target()?;
                out.push(object);
                self.gather(&target, haves, visited, out)?;
            }
            ObjectType::Blob => out.push(object),
        }
        Ok(())
    }

    /// Serializes objects as a version 2 pack: header, one compressed
    /// whole-object entry each, then the SHA-1 trailer.
    pub fn write_pack<W: Write>(&self, objects: &[GitObject], writer: W) -> Result<()> {
        let mut writer = ChecksumWriter::new(writer);

        writer.write_all(PACK_SIGNATURE)?;
        writer.write_all(&PACK_VERSION.to_be_bytes())?;
        writer.write_all(&(objects.len() as u32).to_be_bytes())?;

        for object in objects {
            let header =
                encode_entry_header(PackEntryKind::from(object.object_type), object.data.len());
            writer.write_all(&header)?;

            let mut encoder = ZlibEncoder::new(&mut writer, Compression::default());
            encoder.write_all(&object.data)?;
            encoder.finish()?;
        }

        writer.append_digest()?;
        Ok(())
    }
}
