/*!
Channel-backed byte transport.

The source thread pushes received chunks into a crossbeam channel; the poll
thread pulls them into a `BytesMut` before each poll. Outgoing commands are
collected until `flush` and handed to the source thread as one chunk.
*/

use bytes::{Buf, Bytes, BytesMut};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use ld2450::{RadarError, Transport};

pub struct StreamTransport {
    rx: BytesMut,
    incoming: Receiver<Vec<u8>>,
    tx: BytesMut,
    outgoing: Option<Sender<Bytes>>,
    bytes_received: u64,
    bytes_sent: u64,
}

impl StreamTransport {
    /// `outgoing` is `None` for sources that cannot accept commands (replay)
    pub fn new(incoming: Receiver<Vec<u8>>, outgoing: Option<Sender<Bytes>>) -> Self {
        Self {
            rx: BytesMut::with_capacity(4096),
            incoming,
            tx: BytesMut::new(),
            outgoing,
            bytes_received: 0,
            bytes_sent: 0,
        }
    }

    /// Move every pending chunk into the receive buffer.
    /// Returns false once the source has hung up and nothing is left in the channel.
    pub fn pump(&mut self) -> bool {
        loop {
            match self.incoming.try_recv() {
                Ok(chunk) => {
                    self.bytes_received += chunk.len() as u64;
                    self.rx.extend_from_slice(&chunk);
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }
}

fn broken_pipe(msg: &str) -> RadarError {
    RadarError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, msg.to_string()))
}

impl Transport for StreamTransport {
    fn available(&self) -> usize {
        self.rx.len()
    }

    fn read_byte(&mut self) -> Option<u8> {
        if self.rx.has_remaining() {
            Some(self.rx.get_u8())
        } else {
            None
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> ld2450::Result<()> {
        if self.rx.len() < buf.len() {
            return Err(RadarError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)));
        }
        self.rx.copy_to_slice(buf);
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> ld2450::Result<()> {
        self.tx.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> ld2450::Result<()> {
        if self.tx.is_empty() {
            return Ok(());
        }
        let chunk = self.tx.split().freeze();
        let Some(outgoing) = &self.outgoing else {
            // Read-only source, commands go nowhere
            return Ok(());
        };
        let len = chunk.len() as u64;
        outgoing.send(chunk).map_err(|_| broken_pipe("command channel closed"))?;
        self.bytes_sent += len;
        Ok(())
    }
}
