//! Ref advertisement and want/have negotiation.

use crate::error::ProtocolError;
use crate::pktline::{PktLine, PktLineReader, PktLineWriter};
use crate::Result;
use gitferry_storage::{ObjectId, Repository};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::{Read, Write};

/// Capabilities this server advertises.
pub const ADVERTISED_CAPABILITIES: &str = "report-status delete-refs ofs-delta agent=gitferry/0.1.0";

/// Whether the capability list has been written yet.
///
/// Capabilities ride on the first advertised ref line only; this makes
/// the one-shot nature explicit instead of tracking it with a flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapabilityState {
    /// No ref line has carried the capability list yet.
    #[default]
    NotSent,
    /// The capability list went out with an earlier ref line.
    Sent,
}

/// Capabilities a peer announced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub report_status: bool,
    pub delete_refs: bool,
    pub side_band_64k: bool,
    pub ofs_delta: bool,
}

impl Capabilities {
    /// Parses a space-separated capability list. Unknown tokens are
    /// ignored.
    pub fn parse(s: &str) -> Self {
        let mut caps = Self::default();
        for token in s.split_whitespace() {
            match token {
                "report-status" => caps.report_status = true,
                "delete-refs" => caps.delete_refs = true,
                "side-band-64k" => caps.side_band_64k = true,
                "ofs-delta" => caps.ofs_delta = true,
                _ => {}
            }
        }
        caps
    }
}

/// A single ref update command from a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    /// The id the client believes the ref currently points at.
    pub old_id: ObjectId,
    /// The id the ref should point at afterwards.
    pub new_id: ObjectId,
    /// Full ref name (e.g. refs/heads/main).
    pub name: String,
}

impl RefUpdate {
    /// Returns true if this command creates a new ref.
    pub fn is_create(&self) -> bool {
        self.old_id.is_zero()
    }

    /// Returns true if this command deletes the ref.
    pub fn is_delete(&self) -> bool {
        self.new_id.is_zero()
    }
}

/// Tracks one connection's negotiation state: the refs advertised, the
/// objects wanted and already held, and the update commands received.
#[derive(Debug, Default)]
pub struct RefNegotiator {
    /// Refs by name, as advertised or read from the peer.
    refs: BTreeMap<String, ObjectId>,
    /// Objects the client asked for, keyed by id.
    wants: HashSet<ObjectId>,
    /// Objects the client already has.
    haves: HashSet<ObjectId>,
    /// Ref names the client is pushing, keyed by name. Kept separate
    /// from `wants`; the two are never merged.
    needs: BTreeSet<String>,
    /// Update commands in the order received.
    updates: Vec<RefUpdate>,
    caps_state: CapabilityState,
    peer_caps: Option<Capabilities>,
}

impl RefNegotiator {
    /// Creates a fresh negotiator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertises the repository's refs: HEAD first when it resolves,
    /// then all direct refs in name order, then a flush. An empty
    /// repository advertises nothing but the flush.
    pub fn send_refs<W: Write>(
        &mut self,
        writer: &mut PktLineWriter<W>,
        repo: &Repository,
    ) -> Result<()> {
        if let Ok(head) = repo.refs.resolve_head() {
            self.send_ref(writer, "HEAD", head)?;
        }

        let mut direct: BTreeMap<String, ObjectId> = BTreeMap::new();
        for (name, reference) in repo.refs.list_all() {
            if name == "HEAD" {
                continue;
            }
            if let Some(id) = reference.as_direct() {
                direct.insert(name, id);
            }
        }
        for (name, id) in direct {
            self.send_ref(writer, &name, id)?;
        }

        tracing::debug!(refs = self.refs.len(), "advertised refs");
        writer.flush_pkt()
    }

    /// Writes one advertisement line. The first line carries the
    /// capability list after a NUL; every later line is bare.
    pub fn send_ref<W: Write>(
        &mut self,
        writer: &mut PktLineWriter<W>,
        name: &str,
        id: ObjectId,
    ) -> Result<()> {
        let line = match self.caps_state {
            CapabilityState::NotSent => {
                self.caps_state = CapabilityState::Sent;
                format!("{} {}\0{}\n", id, name, ADVERTISED_CAPABILITIES)
            }
            CapabilityState::Sent => format!("{} {}\n", id, name),
        };
        self.refs.insert(name.to_string(), id);
        writer.write_data(line.as_bytes())
    }

    /// Reads a peer's ref advertisement into the `refs` map, capturing
    /// its capability list from the first line.
    pub fn read_refs<R: Read>(&mut self, reader: &mut PktLineReader<R>) -> Result<()> {
        loop {
            let pkt = match reader.read()? {
                Some(PktLine::Flush) | None => break,
                Some(pkt) => pkt,
            };
            let line = pkt.as_str().ok_or_else(|| {
                ProtocolError::MalformedLine("ref line is not valid UTF-8".to_string())
            })?;

            let (record, caps) = match line.split_once('\0') {
                Some((record, caps)) => (record, Some(caps)),
                None => (line, None),
            };

            let hex = record.get(..40).ok_or_else(|| {
                ProtocolError::MalformedLine(format!("short ref line: {}", line))
            })?;
            let id = ObjectId::from_hex(hex)
                .map_err(|e| ProtocolError::MalformedLine(e.to_string()))?;
            let name = record
                .get(41..)
                .filter(|name| !name.is_empty())
                .ok_or_else(|| {
                    ProtocolError::MalformedLine(format!("ref line missing name: {}", line))
                })?;

            if self.peer_caps.is_none() {
                if let Some(caps) = caps {
                    self.peer_caps = Some(Capabilities::parse(caps));
                }
            }
            self.refs.insert(name.to_string(), id);
        }
        Ok(())
    }

    /// Reads want and have lines until the client says done. Every
    /// wanted id must name an object the repository holds.
    pub fn receive_needs<R: Read>(
        &mut self,
        reader: &mut PktLineReader<R>,
        repo: &Repository,
    ) -> Result<()> {
        loop {
            let pkt = match reader.read()? {
                None => break,
                Some(PktLine::Flush) => continue,
                Some(pkt) => pkt,
            };
            let line = pkt.as_str().ok_or_else(|| {
                ProtocolError::MalformedLine("negotiation line is not valid UTF-8".to_string())
            })?;

            if let Some(rest) = line.strip_prefix("want ") {
                let (id, tail) = parse_id_prefix(rest, line)?;
                if self.peer_caps.is_none() && !tail.trim().is_empty() {
                    self.peer_caps = Some(Capabilities::parse(tail));
                }
                if !repo.objects.contains(&id) {
                    return Err(ProtocolError::UnknownObject(id.to_hex()).into());
                }
                self.wants.insert(id);
            } else if let Some(rest) = line.strip_prefix("have ") {
                let (id, _) = parse_id_prefix(rest, line)?;
                self.haves.insert(id);
            } else if line == "done" {
                break;
            } else {
                return Err(ProtocolError::MalformedLine(format!(
                    "unexpected negotiation line: {}",
                    line
                ))
                .into());
            }
        }

        tracing::debug!(
            wants = self.wants.len(),
            haves = self.haves.len(),
            "negotiation complete"
        );
        Ok(())
    }

    /// Reads ref update commands until the flush that precedes the pack
    /// data. The first command may carry the client's capability list
    /// after a NUL.
    pub fn receive_update_commands<R: Read>(
        &mut self,
        reader: &mut PktLineReader<R>,
    ) -> Result<()> {
        loop {
            let pkt = match reader.read()? {
                Some(PktLine::Flush) | None => break,
                Some(pkt) => pkt,
            };
            let line = pkt.as_str().ok_or_else(|| {
                ProtocolError::MalformedLine("update command is not valid UTF-8".to_string())
            })?;

            let (command, caps) = match line.split_once('\0') {
                Some((command, caps)) => (command, Some(caps)),
                None => (line, None),
            };
            if self.peer_caps.is_none() {
                if let Some(caps) = caps {
                    self.peer_caps = Some(Capabilities::parse(caps));
                }
            }

            let update = parse_update_command(command)?;
            self.needs.insert(update.name.clone());
            self.updates.push(update);
        }

        tracing::debug!(updates = self.updates.len(), "received update commands");
        Ok(())
    }

    /// Applies the received update commands to the repository's refs.
    pub fn write_refs(&self, repo: &Repository) -> Result<()> {
        for update in &self.updates {
            if update.is_delete() {
                repo.refs.delete(&update.name)?;
                tracing::debug!(name = %update.name, "deleted ref");
            } else {
                repo.refs.set(&update.name, update.new_id);
                tracing::debug!(name = %update.name, target = %update.new_id, "updated ref");
            }
        }
        Ok(())
    }

    /// Refs advertised to or read from the peer, by name.
    pub fn refs(&self) -> &BTreeMap<String, ObjectId> {
        &self.refs
    }

    /// Objects the client asked for.
    pub fn wants(&self) -> &HashSet<ObjectId> {
        &self.wants
    }

    /// Objects the client already has.
    pub fn haves(&self) -> &HashSet<ObjectId> {
        &self.haves
    }

    /// Ref names the client is pushing.
    pub fn needs(&self) -> &BTreeSet<String> {
        &self.needs
    }

    /// Update commands in the order received.
    pub fn updates(&self) -> &[RefUpdate] {
        &self.updates
    }

    /// Whether the capability list has been sent.
    pub fn capability_state(&self) -> CapabilityState {
        self.caps_state
    }

    /// Capabilities the peer announced, if any.
    pub fn peer_capabilities(&self) -> Option<&Capabilities> {
        self.peer_caps.as_ref()
    }
}

/// Parses a 40-hex id at the start of `rest`, returning it and the
/// remainder of the line.
fn parse_id_prefix<'a>(rest: &'a str, line: &str) -> Result<(ObjectId, &'a str)> {
    let hex = rest
        .get(..40)
        .ok_or_else(|| ProtocolError::MalformedLine(format!("short id in line: {}", line)))?;
    let id =
        ObjectId::from_hex(hex).map_err(|e| ProtocolError::MalformedLine(e.to_string()))?;
    Ok((id, rest.get(40..).unwrap_or("")))
}

/// Parses `<old-id> <new-id> <ref-name>`.
fn parse_update_command(command: &str) -> Result<RefUpdate> {
    let malformed =
        || ProtocolError::MalformedLine(format!("bad update command: {}", command));

    let old_hex = command.get(..40).ok_or_else(malformed)?;
    if command.as_bytes().get(40) != Some(&b' ') {
        return Err(malformed().into());
    }
    let new_hex = command.get(41..81).ok_or_else(malformed)?;
    if command.as_bytes().get(81) != Some(&b' ') {
        return Err(malformed().into());
    }
    let name = command.get(82..).filter(|n| !n.is_empty()).ok_or_else(malformed)?;

    let old_id = ObjectId::from_hex(old_hex).map_err(|_| malformed())?;
    let new_id = ObjectId::from_hex(new_hex).map_err(|_| malformed())?;

    Ok(RefUpdate {
        old_id,
        new_id,
        name: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn zero_hex() -> String {
        "0".repeat(40)
    }

    #[test]
    fn test_capabilities_parse() {
        let caps = Capabilities::parse("report-status side-band-64k ofs-delta agent=other/1.0");
        assert!(caps.report_status);
        assert!(caps.side_band_64k);
        assert!(caps.ofs_delta);
        assert!(!caps.delete_refs);
    }

    #[test]
    fn test_capability_state_defaults_to_not_sent() {
        assert_eq!(CapabilityState::default(), CapabilityState::NotSent);
        let negotiator = RefNegotiator::new();
        assert_eq!(negotiator.capability_state(), CapabilityState::NotSent);
    }

    #[test]
    fn test_send_ref_caps_on_first_line_only() {
        let mut negotiator = RefNegotiator::new();
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            let id = ObjectId::from_bytes([1u8; 20]);
            negotiator.send_ref(&mut writer, "refs/heads/main", id).unwrap();
            negotiator
                .send_ref(&mut writer, "refs/heads/feature", id)
                .unwrap();
        }
        assert_eq!(negotiator.capability_state(), CapabilityState::Sent);

        let text = String::from_utf8_lossy(&buf);
        assert_eq!(text.matches('\0').count(), 1);
        assert!(text.contains(ADVERTISED_CAPABILITIES));
    }

    #[test]
    fn test_send_refs_head_first_and_sorted() {
        let repo = Repository::new("test");
        let id = ObjectId::from_bytes([5u8; 20]);
        repo.refs.set("refs/heads/main", id);
        repo.refs.set("refs/heads/alpha", id);
        repo.refs.set("refs/tags/v1.0", id);

        let mut negotiator = RefNegotiator::new();
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            negotiator.send_refs(&mut writer, &repo).unwrap();
        }

        let mut reader = PktLineReader::new(Cursor::new(buf));
        let packets = reader.read_until_flush().unwrap();
        let lines: Vec<String> = packets
            .iter()
            .map(|p| p.as_str().unwrap().to_string())
            .collect();

        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with(&format!("{} HEAD\0", id)));
        assert!(lines[1].ends_with("refs/heads/alpha"));
        assert!(lines[2].ends_with("refs/heads/main"));
        assert!(lines[3].ends_with("refs/tags/v1.0"));
    }

    #[test]
    fn test_send_refs_empty_repo_is_just_flush() {
        let repo = Repository::new("empty");
        let mut negotiator = RefNegotiator::new();
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            negotiator.send_refs(&mut writer, &repo).unwrap();
        }
        assert_eq!(buf, b"0000");
        assert_eq!(negotiator.capability_state(), CapabilityState::NotSent);
    }

    #[test]
    fn test_read_refs_roundtrip() {
        let repo = Repository::new("test");
        let id = ObjectId::from_bytes([9u8; 20]);
        repo.refs.set("refs/heads/main", id);

        let mut sender = RefNegotiator::new();
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            sender.send_refs(&mut writer, &repo).unwrap();
        }

        let mut receiver = RefNegotiator::new();
        let mut reader = PktLineReader::new(Cursor::new(buf));
        receiver.read_refs(&mut reader).unwrap();

        assert_eq!(receiver.refs().get("refs/heads/main"), Some(&id));
        assert_eq!(receiver.refs().get("HEAD"), Some(&id));
        let caps = receiver.peer_capabilities().unwrap();
        assert!(caps.report_status);
        assert!(caps.delete_refs);
        assert!(caps.ofs_delta);
        assert!(!caps.side_band_64k);
    }

    #[test]
    fn test_read_refs_rejects_short_line() {
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer.write_text("deadbeef refs/heads/main").unwrap();
            writer.flush_pkt().unwrap();
        }
        let mut negotiator = RefNegotiator::new();
        let mut reader = PktLineReader::new(Cursor::new(buf));
        assert!(negotiator.read_refs(&mut reader).is_err());
    }

    #[test]
    fn test_receive_needs_wants_and_haves() {
        let repo = Repository::new("test");
        let want_id = repo.objects.put_blob(b"wanted".to_vec());
        let have_id = ObjectId::from_bytes([3u8; 20]);

        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer
                .write_text(&format!("want {} ofs-delta report-status", want_id))
                .unwrap();
            writer.flush_pkt().unwrap();
            writer.write_text(&format!("have {}", have_id)).unwrap();
            writer.write_text("done").unwrap();
        }

        let mut negotiator = RefNegotiator::new();
        let mut reader = PktLineReader::new(Cursor::new(buf));
        negotiator.receive_needs(&mut reader, &repo).unwrap();

        assert!(negotiator.wants().contains(&want_id));
        assert!(negotiator.haves().contains(&have_id));
        assert!(negotiator.peer_capabilities().unwrap().ofs_delta);
    }

    #[test]
    fn test_receive_needs_unknown_want() {
        let repo = Repository::new("test");
        let missing = ObjectId::from_bytes([7u8; 20]);

        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer.write_text(&format!("want {}", missing)).unwrap();
            writer.write_text("done").unwrap();
        }

        let mut negotiator = RefNegotiator::new();
        let mut reader = PktLineReader::new(Cursor::new(buf));
        let result = negotiator.receive_needs(&mut reader, &repo);
        assert!(matches!(
            result,
            Err(crate::Error::Protocol(ProtocolError::UnknownObject(_)))
        ));
    }

    #[test]
    fn test_receive_needs_rejects_unknown_keyword() {
        let repo = Repository::new("test");
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer.write_text("steal everything").unwrap();
        }

        let mut negotiator = RefNegotiator::new();
        let mut reader = PktLineReader::new(Cursor::new(buf));
        assert!(negotiator.receive_needs(&mut reader, &repo).is_err());
    }

    #[test]
    fn test_receive_needs_empty_is_valid() {
        let repo = Repository::new("test");
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer.flush_pkt().unwrap();
            writer.write_text("done").unwrap();
        }

        let mut negotiator = RefNegotiator::new();
        let mut reader = PktLineReader::new(Cursor::new(buf));
        negotiator.receive_needs(&mut reader, &repo).unwrap();
        assert!(negotiator.wants().is_empty());
    }

    #[test]
    fn test_receive_update_commands() {
        let old = ObjectId::from_bytes([1u8; 20]);
        let new = ObjectId::from_bytes([2u8; 20]);

        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer
                .write_text(&format!(
                    "{} {} refs/heads/main\0report-status delete-refs",
                    old, new
                ))
                .unwrap();
            writer
                .write_text(&format!("{} {} refs/heads/old", new, zero_hex()))
                .unwrap();
            writer
                .write_text(&format!("{} {} refs/heads/new", zero_hex(), new))
                .unwrap();
            writer.flush_pkt().unwrap();
        }

        let mut negotiator = RefNegotiator::new();
        let mut reader = PktLineReader::new(Cursor::new(buf));
        negotiator.receive_update_commands(&mut reader).unwrap();

        let updates = negotiator.updates();
        assert_eq!(updates.len(), 3);
        assert!(!updates[0].is_create());
        assert!(!updates[0].is_delete());
        assert!(updates[1].is_delete());
        assert!(updates[2].is_create());

        let needs: Vec<&String> = negotiator.needs().iter().collect();
        assert_eq!(needs.len(), 3);
        assert!(negotiator.peer_capabilities().unwrap().delete_refs);
    }

    #[test]
    fn test_receive_update_commands_malformed() {
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer.write_text("not a command").unwrap();
            writer.flush_pkt().unwrap();
        }

        let mut negotiator = RefNegotiator::new();
        let mut reader = PktLineReader::new(Cursor::new(buf));
        assert!(negotiator.receive_update_commands(&mut reader).is_err());
    }

    #[test]
    fn test_write_refs_applies_updates() {
        let repo = Repository::new("test");
        let old = ObjectId::from_bytes([1u8; 20]);
        let new = ObjectId::from_bytes([2u8; 20]);
        repo.refs.set("refs/heads/main", old);
        repo.refs.set("refs/heads/gone", old);

        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer
                .write_text(&format!("{} {} refs/heads/main", old, new))
                .unwrap();
            writer
                .write_text(&format!("{} {} refs/heads/gone", old, zero_hex()))
                .unwrap();
            writer
                .write_text(&format!("{} {} refs/heads/created", zero_hex(), new))
                .unwrap();
            writer.flush_pkt().unwrap();
        }

        let mut negotiator = RefNegotiator::new();
        let mut reader = PktLineReader::new(Cursor::new(buf));
        negotiator.receive_update_commands(&mut reader).unwrap();
        negotiator.write_refs(&repo).unwrap();

        assert_eq!(
            repo.refs.get("refs/heads/main").unwrap().as_direct(),
            Some(new)
        );
        assert!(repo.refs.get("refs/heads/gone").is_err());
        assert_eq!(
            repo.refs.get("refs/heads/created").unwrap().as_direct(),
            Some(new)
        );
    }

    #[test]
    fn test_write_refs_delete_missing_fails() {
        let repo = Repository::new("test");
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer
                .write_text(&format!(
                    "{} {} refs/heads/nonexistent",
                    ObjectId::from_bytes([1u8; 20]),
                    zero_hex()
                ))
                .unwrap();
            writer.flush_pkt().unwrap();
        }

        let mut negotiator = RefNegotiator::new();
        let mut reader = PktLineReader::new(Cursor::new(buf));
        negotiator.receive_update_commands(&mut reader).unwrap();
        assert!(negotiator.write_refs(&repo).is_err());
    }

    #[test]
    fn test_wants_and_needs_stay_separate() {
        let repo = Repository::new("test");
        let want_id = repo.objects.put_blob(b"content".to_vec());

        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer.write_text(&format!("want {}", want_id)).unwrap();
            writer.write_text("done").unwrap();
        }
        let mut negotiator = RefNegotiator::new();
        let mut reader = PktLineReader::new(Cursor::new(buf));
        negotiator.receive_needs(&mut reader, &repo).unwrap();

        assert_eq!(negotiator.wants().len(), 1);
        assert!(negotiator.needs().is_empty());
    }
}
