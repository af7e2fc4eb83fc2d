//! Pack file parsing.

use crate::error::PackError;
use crate::pack::checksum::Checksum;
use crate::pack::delta::patch_delta;
use crate::pack::{decode_entry_header, decode_ofs_distance, PackEntryKind};
use crate::pack::{PACK_SIGNATURE, PACK_VERSION, TRAILER_LEN};
use flate2::read::ZlibDecoder;
use gitferry_storage::{GitObject, ObjectId, ObjectStore, ObjectType};
use std::collections::HashMap;
use std::io::Read;

/// Parses a pack file and stores the objects it carries.
///
/// Every consumed byte is fed into a running checksum, and nothing is
/// written to the store until the trailing digest verifies. A pack that
/// fails partway leaves the store untouched.
pub struct PackReader<'a> {
    data: &'a [u8],
    pos: usize,
    checksum: Checksum,
    store: &'a ObjectStore,
    /// Entry byte offset to staged index, for ofs-delta bases.
    offsets: HashMap<usize, usize>,
    /// Object id to staged index, for ref-delta bases.
    by_id: HashMap<ObjectId, usize>,
    staged: Vec<GitObject>,
}

impl<'a> PackReader<'a> {
    /// Creates a new pack reader over a complete pack byte stream.
    pub fn new(data: &'a [u8], store: &'a ObjectStore) -> Self {
        Self {
            data,
            pos: 0,
            checksum: Checksum::new(),
            store,
            offsets: HashMap::new(),
            by_id: HashMap::new(),
            staged: Vec::new(),
        }
    }

    /// Parses the whole pack. On success the staged objects are
    /// committed to the store and their ids returned in stream order.
    pub fn read_pack(mut self) -> Result<Vec<ObjectId>, PackError> {
        let object_count = self.read_header()?;

        for _ in 0..object_count {
            self.read_entry()?;
        }

        if self.pos != self.body_len() {
            return Err(PackError::TruncatedStream(format!(
                "{} bytes left after final entry",
                self.body_len() - self.pos
            )));
        }

        let trailer = &self.data[self.body_len()..];
        if self.checksum.digest() != trailer {
            return Err(PackError::ChecksumMismatch);
        }

        let mut ids = Vec::with_capacity(self.staged.len());
        for object in self.staged {
            ids.push(object.id);
            self.store.put(object);
        }
        Ok(ids)
    }

    /// Verifies the 12-byte header and returns the object count.
    fn read_header(&mut self) -> Result<usize, PackError> {
        if self.data.len() < 12 + TRAILER_LEN {
            return Err(PackError::BadHeader("pack too small".to_string()));
        }

        if &self.data[0..4] != PACK_SIGNATURE {
            return Err(PackError::BadHeader("invalid signature".to_string()));
        }

        let version = u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]]);
        if version != PACK_VERSION {
            return Err(PackError::BadHeader(format!(
                "unsupported version: {}",
                version
            )));
        }

        let object_count =
            u32::from_be_bytes([self.data[8], self.data[9], self.data[10], self.data[11]]);

        self.consume(12);
        Ok(object_count as usize)
    }

    /// Reads one entry and stages the reconstructed object.
    fn read_entry(&mut self) -> Result<(), PackError> {
        let entry_offset = self.pos;
        let (kind, size, header_len) = decode_entry_header(self.remaining())?;
        self.consume(header_len);

        let object = match kind {
            PackEntryKind::OfsDelta => {
                let (distance, distance_len) = decode_ofs_distance(self.remaining())?;
                self.consume(distance_len);

                let base_offset = (entry_offset as u64)
                    .checked_sub(distance)
                    .ok_or_else(|| {
                        PackError::UnresolvedBase(format!(
                            "offset {} before pack start",
                            distance
                        ))
                    })? as usize;
                let index = *self.offsets.get(&base_offset).ok_or_else(|| {
                    PackError::UnresolvedBase(format!("no entry at offset {}", base_offset))
                })?;
                let base = self.staged[index].clone();

                let delta = self.inflate(size)?;
                let result = patch_delta(&delta, &base.data)?;
                GitObject::new(base.object_type, result)
            }
            PackEntryKind::RefDelta => {
                let base_id = self.read_base_id()?;
                let base = self.lookup_base(&base_id)?;

                let delta = self.inflate(size)?;
                let result = patch_delta(&delta, &base.data)?;
                GitObject::new(base.object_type, result)
            }
            PackEntryKind::Commit => self.read_whole(ObjectType::Commit, size)?,
            PackEntryKind::Tree => self.read_whole(ObjectType::Tree, size)?,
            PackEntryKind::Blob => self.read_whole(ObjectType::Blob, size)?,
            PackEntryKind::Tag => self.read_whole(ObjectType::Tag, size)?,
        };

        let index = self.staged.len();
        self.offsets.insert(entry_offset, index);
        self.by_id.insert(object.id, index);
        self.staged.push(object);
        Ok(())
    }

    /// Inflates a whole-object entry.
    fn read_whole(&mut self, object_type: ObjectType, size: usize) -> Result<GitObject, PackError> {
        let data = self.inflate(size)?;
        Ok(GitObject::new(object_type, data))
    }

    /// Reads the 20-byte base id of a ref-delta entry.
    fn read_base_id(&mut self) -> Result<ObjectId, PackError> {
        let rest = self.remaining();
        if rest.len() < 20 {
            return Err(PackError::TruncatedStream(
                "ref-delta base id cut short".to_string(),
            ));
        }
        let mut id = [0u8; 20];
        id.copy_from_slice(&rest[..20]);
        self.consume(20);
        Ok(ObjectId::from_bytes(id))
    }

    /// Finds a ref-delta base among staged entries or, for thin packs,
    /// in the repository's store.
    fn lookup_base(&self, id: &ObjectId) -> Result<GitObject, PackError> {
        if let Some(&index) = self.by_id.get(id) {
            return Ok(self.staged[index].clone());
        }
        self.store
            .get(id)
            .map_err(|_| PackError::UnresolvedBase(id.to_hex()))
    }

    /// Inflates one zlib stream and checks it against the declared
    /// size. Advances past exactly the compressed bytes consumed.
    fn inflate(&mut self, declared: usize) -> Result<Vec<u8>, PackError> {
        let rest = self.remaining();
        // One extra byte so an oversized stream is detected, not truncated
        let mut decoder = ZlibDecoder::new(rest).take(declared as u64 + 1);
        let mut out = Vec::with_capacity(declared);
        decoder
            .read_to_end(&mut out)
            .map_err(|e| PackError::TruncatedStream(e.to_string()))?;

        if out.len() != declared {
            return Err(PackError::SizeMismatch {
                declared,
                actual: out.len(),
            });
        }

        let consumed = decoder.into_inner().total_in() as usize;
        self.consume(consumed);
        Ok(out)
    }

    /// Entry bytes not yet consumed, excluding the trailer.
    fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..self.body_len()]
    }

    /// Length of the pack minus its 20-byte trailer.
    fn body_len(&self) -> usize {
        self.data.len() - TRAILER_LEN
    }

    /// Advances the cursor, feeding the skipped bytes to the checksum.
    fn consume(&mut self, n: usize) {
        let end = self.pos + n;
        self.checksum.update(&self.data[self.pos..end]);
        self.pos = end;
    }
}
