//! Per-connection service dispatch and flow state machines.

use crate::error::ProtocolError;
use crate::negotiate::RefNegotiator;
use crate::pack::{PackReader, PackWriter};
use crate::pktline::{PktLine, PktLineReader, PktLineWriter};
use crate::Result;
use gitferry_storage::Repository;
use std::io::{Read, Write};

/// A service request parsed from the first pkt-line of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Service {
    /// Fetch: the client downloads objects.
    UploadPack { path: String },
    /// Push: the client uploads objects and ref updates.
    ReceivePack { path: String },
}

impl Service {
    /// Parses a request line of the form `git-upload-pack <path>`. The
    /// `git-` prefix is optional, and anything after a NUL (such as a
    /// `host=` parameter) is ignored.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.split_once('\0').map(|(head, _)| head).unwrap_or(line);
        let (command, path) = line.trim().split_once(' ').ok_or_else(|| {
            ProtocolError::MalformedLine(format!("bad service request: {}", line))
        })?;

        let name = command.strip_prefix("git-").unwrap_or(command);
        match name {
            "upload-pack" => Ok(Self::UploadPack {
                path: path.to_string(),
            }),
            "receive-pack" => Ok(Self::ReceivePack {
                path: path.to_string(),
            }),
            _ => Err(ProtocolError::UnsupportedCommand(command.to_string()).into()),
        }
    }

    /// The canonical service name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UploadPack { .. } => "upload-pack",
            Self::ReceivePack { .. } => "receive-pack",
        }
    }

    /// The repository path the client asked for.
    pub fn path(&self) -> &str {
        match self {
            Self::UploadPack { path } | Self::ReceivePack { path } => path,
        }
    }
}

/// Steps of the upload-pack (fetch) flow, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    RefsAdvertised,
    NeedsReceived,
    PackSent,
    Done,
}

impl UploadState {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::RefsAdvertised => "refs-advertised",
            Self::NeedsReceived => "needs-received",
            Self::PackSent => "pack-sent",
            Self::Done => "done",
        }
    }
}

/// Steps of the receive-pack (push) flow, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    Idle,
    RefsAdvertised,
    UpdatesReceived,
    PackReceived,
    RefsWritten,
    Done,
}

impl ReceiveState {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::RefsAdvertised => "refs-advertised",
            Self::UpdatesReceived => "updates-received",
            Self::PackReceived => "pack-received",
            Self::RefsWritten => "refs-written",
            Self::Done => "done",
        }
    }
}

/// Serves a fetch: advertises refs, reads the client's wants and haves,
/// then streams a pack of the missing objects.
pub struct UploadPack<'a, R, W> {
    repo: &'a Repository,
    reader: PktLineReader<R>,
    writer: PktLineWriter<W>,
    negotiator: RefNegotiator,
    state: UploadState,
}

impl<'a, R: Read, W: Write> UploadPack<'a, R, W> {
    /// Creates an upload-pack flow over a byte stream pair.
    pub fn new(repo: &'a Repository, reader: R, writer: W) -> Self {
        Self {
            repo,
            reader: PktLineReader::new(reader),
            writer: PktLineWriter::new(writer),
            negotiator: RefNegotiator::new(),
            state: UploadState::Idle,
        }
    }

    fn expect(&self, expected: UploadState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedState(self.state.name()).into())
        }
    }

    /// Sends the ref advertisement.
    pub fn advertise_refs(&mut self) -> Result<()> {
        self.expect(UploadState::Idle)?;
        self.negotiator.send_refs(&mut self.writer, self.repo)?;
        self.state = UploadState::RefsAdvertised;
        Ok(())
    }

    /// Reads the client's want and have lines.
    pub fn receive_needs(&mut self) -> Result<()> {
        self.expect(UploadState::RefsAdvertised)?;
        self.negotiator.receive_needs(&mut self.reader, self.repo)?;
        self.state = UploadState::NeedsReceived;
        Ok(())
    }

    /// Replies NAK and streams the pack. An empty want set is valid and
    /// ends the flow after the NAK with no pack at all.
    pub fn send_pack(&mut self) -> Result<()> {
        self.expect(UploadState::NeedsReceived)?;

        if self.negotiator.wants().is_empty() {
            self.writer.write_text("NAK")?;
            self.writer.flush_pkt()?;
            self.state = UploadState::PackSent;
            return Ok(());
        }

        let pack_writer = PackWriter::new(&self.repo.objects);
        let objects =
            pack_writer.closure(self.negotiator.wants(), self.negotiator.haves())?;

        self.writer.write_text("NAK")?;
        pack_writer.write_pack(&objects, self.writer.inner_mut())?;
        tracing::debug!(objects = objects.len(), "sent pack");

        self.state = UploadState::PackSent;
        Ok(())
    }

    /// Flushes the stream and ends the flow.
    pub fn finish(&mut self) -> Result<()> {
        self.expect(UploadState::PackSent)?;
        self.writer.flush()?;
        self.state = UploadState::Done;
        Ok(())
    }

    /// Runs every step of the flow in order.
    pub fn run(&mut self) -> Result<()> {
        self.advertise_refs()?;
        self.receive_needs()?;
        self.send_pack()?;
        self.finish()
    }
}

/// Serves a push: advertises refs, reads update commands and the pack,
/// applies the updates, then reports status.
pub struct ReceivePack<'a, R, W> {
    repo: &'a Repository,
    reader: PktLineReader<R>,
    writer: PktLineWriter<W>,
    negotiator: RefNegotiator,
    state: ReceiveState,
}

impl<'a, R: Read, W: Write> ReceivePack<'a, R, W> {
    /// Creates a receive-pack flow over a byte stream pair.
    pub fn new(repo: &'a Repository, reader: R, writer: W) -> Self {
        Self {
            repo,
            reader: PktLineReader::new(reader),
            writer: PktLineWriter::new(writer),
            negotiator: RefNegotiator::new(),
            state: ReceiveState::Idle,
        }
    }

    fn expect(&self, expected: ReceiveState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedState(self.state.name()).into())
        }
    }

    /// Sends the ref advertisement.
    pub fn advertise_refs(&mut self) -> Result<()> {
        self.expect(ReceiveState::Idle)?;
        self.negotiator.send_refs(&mut self.writer, self.repo)?;
        self.state = ReceiveState::RefsAdvertised;
        Ok(())
    }

    /// Reads ref update commands up to the flush before the pack.
    pub fn receive_updates(&mut self) -> Result<()> {
        self.expect(ReceiveState::RefsAdvertised)?;
        self.negotiator.receive_update_commands(&mut self.reader)?;
        self.state = ReceiveState::UpdatesReceived;
        Ok(())
    }

    /// Reads and verifies the pack that follows the commands. Objects
    /// only land in the store once the trailer checksum verifies. A
    /// delete-only push carries no pack and is accepted as is.
    pub fn receive_pack_data(&mut self) -> Result<()> {
        self.expect(ReceiveState::UpdatesReceived)?;

        if !self.negotiator.updates().is_empty() {
            let mut pack_data = Vec::new();
            self.reader.inner_mut().read_to_end(&mut pack_data)?;
            if !pack_data.is_empty() {
                let ids = PackReader::new(&pack_data, &self.repo.objects).read_pack()?;
                tracing::debug!(objects = ids.len(), "unpacked objects");
            }
        }

        self.state = ReceiveState::PackReceived;
        Ok(())
    }

    /// Applies the received update commands to the repository.
    pub fn write_refs(&mut self) -> Result<()> {
        self.expect(ReceiveState::PackReceived)?;
        self.negotiator.write_refs(self.repo)?;
        self.state = ReceiveState::RefsWritten;
        Ok(())
    }

    /// Reports `unpack ok` and a per-ref `ok <name>` line, then ends
    /// the flow. A push with no commands gets no report.
    pub fn report_status(&mut self) -> Result<()> {
        self.expect(ReceiveState::RefsWritten)?;

        if !self.negotiator.updates().is_empty() {
            self.writer.write_text("unpack ok")?;
            for update in self.negotiator.updates() {
                self.writer.write_text(&format!("ok {}", update.name))?;
            }
            self.writer.flush_pkt()?;
        }
        self.writer.flush()?;

        self.state = ReceiveState::Done;
        Ok(())
    }

    /// Runs every step of the flow in order.
    pub fn run(&mut self) -> Result<()> {
        self.advertise_refs()?;
        self.receive_updates()?;
        self.receive_pack_data()?;
        self.write_refs()?;
        self.report_status()
    }
}

/// Dispatches one connection: reads the service request line and runs
/// the matching flow against the repository.
pub struct Handler<'a> {
    repo: &'a Repository,
}

impl<'a> Handler<'a> {
    /// Creates a handler serving one repository.
    pub fn new(repo: &'a Repository) -> Self {
        Self { repo }
    }

    /// Serves a single connection to completion.
    pub fn run<R: Read, W: Write>(&self, reader: R, writer: W) -> Result<()> {
        let mut pkt_reader = PktLineReader::new(reader);
        let pkt = pkt_reader.read()?.ok_or_else(|| {
            ProtocolError::MalformedLine("connection closed before a request".to_string())
        })?;
        let line = match &pkt {
            PktLine::Flush => {
                return Err(ProtocolError::MalformedLine(
                    "flush packet before a request".to_string(),
                )
                .into())
            }
            pkt => pkt.as_str().ok_or_else(|| {
                ProtocolError::MalformedLine("request line is not valid UTF-8".to_string())
            })?,
        };

        let service = Service::parse(line)?;
        tracing::debug!(
            service = service.name(),
            path = %service.path(),
            "dispatching request"
        );

        let reader = pkt_reader.into_inner();
        match service {
            Service::UploadPack { .. } => {
                UploadPack::new(self.repo, reader, writer).run()
            }
            Service::ReceivePack { .. } => {
                ReceivePack::new(self.repo, reader, writer).run()
            }
        }
    }
}
