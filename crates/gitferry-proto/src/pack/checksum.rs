//! Running SHA-1 checksums over pack streams.

use sha1::{Digest, Sha1};
use std::io::{self, Write};

/// Accumulates a SHA-1 digest over every byte fed to it.
#[derive(Debug, Default, Clone)]
pub(crate) struct Checksum {
    hasher: Sha1,
}

impl Checksum {
    /// Creates a fresh accumulator.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes into the digest.
    pub(crate) fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Returns the digest of everything fed so far without consuming
    /// the accumulator.
    pub(crate) fn digest(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        out.copy_from_slice(&self.hasher.clone().finalize());
        out
    }
}

/// A writer that feeds every written byte into a running checksum.
pub(crate) struct ChecksumWriter<W> {
    inner: W,
    checksum: Checksum,
}

impl<W: Write> ChecksumWriter<W> {
    /// Wraps a writer with a fresh checksum.
    pub(crate) fn new(inner: W) -> Self {
        Self {
            inner,
            checksum: Checksum::new(),
        }
    }

    /// Writes the digest of everything written so far to the inner
    /// writer and returns it.
    pub(crate) fn append_digest(mut self) -> io::Result<W> {
        let digest = self.checksum.digest();
        self.inner.write_all(&digest)?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.checksum.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
