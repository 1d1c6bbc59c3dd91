/*!
Byte transport abstraction.

The engine never blocks: it always checks [`Transport::available`] before
requesting a segment, so implementations may assume reads are satisfiable.
*/

use std::collections::VecDeque;

use crate::error::Result;

/// Byte-level transport to and from the sensor
pub trait Transport {
    /// Number of bytes that can be read without blocking
    fn available(&self) -> usize;

    /// Read a single byte, `None` when nothing is pending
    fn read_byte(&mut self) -> Option<u8>;

    /// Fill `buf` completely. Callers check `available()` first.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Queue bytes for transmission
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Push out everything written so far
    fn flush(&mut self) -> Result<()>;
}

/// In-memory transport used for tests and capture replay
#[derive(Debug, Default, Clone)]
pub struct MemoryTransport {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    flushes: usize,
}

impl MemoryTransport {
    /// Create an empty transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes to the receive side
    pub fn feed(&mut self, data: &[u8]) {
        self.rx.extend(data);
    }

    /// Bytes written by the engine so far
    pub fn written(&self) -> &[u8] {
        &self.tx
    }

    /// Take and clear the written bytes
    pub fn take_written(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tx)
    }

    /// Number of flushes performed
    pub fn flush_count(&self) -> usize {
        self.flushes
    }
}

impl Transport for MemoryTransport {
    fn available(&self) -> usize {
        self.rx.len()
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.rx.pop_front()
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.rx.len() < buf.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("requested {} bytes, {} available", buf.len(), self.rx.len()),
            )
            .into());
        }
        let n = buf.len();
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.tx.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }
}
