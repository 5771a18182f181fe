//! Message channel between client and server.
//!
//! The protocol only needs `send(tag, payload)` and a blocking
//! `receive(tag)` that is reliable and ordered per tag. Two transports are
//! provided: an in-process pair for threads, and a length-framed stream for
//! anything implementing `Read + Write`.

use crate::error::{PirError, Result};
use crate::params::Params;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, Sender};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    /// server -> client: `w` records of one block
    Block = 1,
    /// client -> server: empty acknowledgement of a block
    Ack = 2,
    /// client -> server: punctured offsets, or empty for a cache hit
    Query = 3,
    /// server -> client: candidate parities, or empty
    Answer = 4,
    /// client -> server: one control byte after each batch
    Refresh = 5,
    /// server -> client: index and XOR delta of a write
    Update = 6,
}

impl TryFrom<u8> for Tag {
    type Error = PirError;

    fn try_from(byte: u8) -> Result<Self> {
        Ok(match byte {
            1 => Self::Block,
            2 => Self::Ack,
            3 => Self::Query,
            4 => Self::Answer,
            5 => Self::Refresh,
            6 => Self::Update,
            other => return Err(PirError::abort(format!("unknown message tag {other}"))),
        })
    }
}

pub trait Channel {
    fn send(&mut self, tag: Tag, payload: Vec<u8>) -> Result<()>;
    fn receive(&mut self, tag: Tag) -> Result<Vec<u8>>;
}

/// Messages that arrived ahead of the tag currently being waited on.
#[derive(Default)]
struct Pending {
    queues: HashMap<Tag, VecDeque<Vec<u8>>>,
}

impl Pending {
    fn pop(&mut self, tag: Tag) -> Option<Vec<u8>> {
        self.queues.get_mut(&tag).and_then(VecDeque::pop_front)
    }

    fn push(&mut self, tag: Tag, payload: Vec<u8>) {
        self.queues.entry(tag).or_default().push_back(payload);
    }
}

/// One end of an in-process channel.
pub struct MemoryChannel {
    tx: Sender<(Tag, Vec<u8>)>,
    rx: Receiver<(Tag, Vec<u8>)>,
    pending: Pending,
    transcript: Vec<(Tag, usize)>,
}

impl MemoryChannel {
    /// Two connected ends; give one to each party.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_b) = mpsc::channel();
        let (tx_b, rx_a) = mpsc::channel();
        let end = |tx, rx| Self {
            tx,
            rx,
            pending: Pending::default(),
            transcript: Vec::new(),
        };
        (end(tx_a, rx_a), end(tx_b, rx_b))
    }

    /// `(tag, payload length)` of every message sent from this end.
    pub fn transcript(&self) -> &[(Tag, usize)] {
        &self.transcript
    }

    pub fn clear_transcript(&mut self) {
        self.transcript.clear();
    }
}

impl Channel for MemoryChannel {
    fn send(&mut self, tag: Tag, payload: Vec<u8>) -> Result<()> {
        let len = payload.len();
        self.tx
            .send((tag, payload))
            .map_err(|_| PirError::Channel("peer hung up".into()))?;
        self.transcript.push((tag, len));
        Ok(())
    }

    fn receive(&mut self, tag: Tag) -> Result<Vec<u8>> {
        if let Some(payload) = self.pending.pop(tag) {
            return Ok(payload);
        }
        loop {
            let (got, payload) = self
                .rx
                .recv()
                .map_err(|_| PirError::Channel("peer hung up".into()))?;
            if got == tag {
                return Ok(payload);
            }
            self.pending.push(got, payload);
        }
    }
}

/// Channel over a byte stream. Each frame is `tag (1) | len (u32 BE) | payload`.
pub struct FramedChannel<RW> {
    inner: RW,
    max_frame: usize,
    pending: Pending,
}

impl<RW> FramedChannel<RW> {
    /// Frames longer than the largest message `params` allows are rejected
    /// before their payload is read.
    pub fn new(inner: RW, params: &Params) -> Self {
        Self {
            inner,
            max_frame: params.max_message_bytes(),
            pending: Pending::default(),
        }
    }

    pub fn into_inner(self) -> RW {
        self.inner
    }
}

pub fn write_frame<W: Write>(mut writer: W, tag: Tag, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| io::ErrorKind::InvalidInput)?;
    writer.write_all(&[tag as u8])?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Read one frame whose payload is at most `max_len` bytes.
pub fn read_frame<R: Read>(mut reader: R, max_len: usize) -> Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header).map_err(read_failed)?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > max_len {
        return Err(PirError::abort(format!(
            "frame of {len} bytes exceeds limit {max_len}"
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(read_failed)?;
    Ok((header[0], payload))
}

fn read_failed(e: io::Error) -> PirError {
    PirError::Channel(format!("read failed: {e}"))
}

impl<RW: Read + Write> Channel for FramedChannel<RW> {
    fn send(&mut self, tag: Tag, payload: Vec<u8>) -> Result<()> {
        write_frame(&mut self.inner, tag, &payload)
            .map_err(|e| PirError::Channel(format!("write failed: {e}")))
    }

    fn receive(&mut self, tag: Tag) -> Result<Vec<u8>> {
        if let Some(payload) = self.pending.pop(tag) {
            return Ok(payload);
        }
        loop {
            let (byte, payload) = read_frame(&mut self.inner, self.max_frame)?;
            let got = Tag::try_from(byte)?;
            if got == tag {
                return Ok(payload);
            }
            self.pending.push(got, payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn params() -> Params {
        Params::new(100, 8, None).unwrap()
    }

    #[test]
    fn memory_pair_buffers_other_tags() {
        let (mut a, mut b) = MemoryChannel::pair();
        a.send(Tag::Update, vec![9]).unwrap();
        a.send(Tag::Answer, vec![1, 2]).unwrap();
        assert_eq!(b.receive(Tag::Answer).unwrap(), vec![1, 2]);
        assert_eq!(b.receive(Tag::Update).unwrap(), vec![9]);
        assert_eq!(a.transcript(), &[(Tag::Update, 1), (Tag::Answer, 2)]);
        assert!(b.transcript().is_empty());
    }

    #[test]
    fn memory_pair_reports_hang_up() {
        let (mut a, b) = MemoryChannel::pair();
        drop(b);
        assert!(matches!(a.send(Tag::Ack, Vec::new()), Err(PirError::Channel(_))));
        assert!(matches!(a.receive(Tag::Block), Err(PirError::Channel(_))));
    }

    #[test]
    fn framed_roundtrip_with_reordering() {
        let mut chan = FramedChannel::new(Cursor::new(Vec::new()), &params());
        chan.send(Tag::Block, b"block".to_vec()).unwrap();
        chan.send(Tag::Query, Vec::new()).unwrap();
        let mut cursor = chan.into_inner();
        cursor.set_position(0);
        let mut chan = FramedChannel::new(cursor, &params());
        assert_eq!(chan.receive(Tag::Query).unwrap(), Vec::<u8>::new());
        assert_eq!(chan.receive(Tag::Block).unwrap(), b"block".to_vec());
    }

    #[test]
    fn framed_rejects_unknown_tag() {
        let mut bytes = Vec::new();
        bytes.push(0xee);
        bytes.extend_from_slice(&0u32.to_be_bytes());
        let mut chan = FramedChannel::new(Cursor::new(bytes), &params());
        assert!(matches!(chan.receive(Tag::Ack), Err(PirError::Abort(_))));
    }

    #[test]
    fn framed_truncated_stream_is_channel_error() {
        let mut chan = FramedChannel::new(Cursor::new(vec![1u8, 0, 0]), &params());
        assert!(matches!(chan.receive(Tag::Block), Err(PirError::Channel(_))));
    }

    #[test]
    fn framed_rejects_oversized_frame_before_reading_it() {
        let p = params();
        let limit = p.max_message_bytes();
        assert_eq!(limit, p.block_bytes().max(p.answer_bytes()));

        // Header only; the advertised payload is never read.
        let mut bytes = vec![Tag::Block as u8];
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        let mut chan = FramedChannel::new(Cursor::new(bytes), &p);
        let err = chan.receive(Tag::Block).unwrap_err();
        assert!(matches!(err, PirError::Abort(_)), "{err:?}");

        let mut bytes = Vec::new();
        write_frame(&mut bytes, Tag::Answer, &vec![0u8; limit]).unwrap();
        write_frame(&mut bytes, Tag::Answer, &vec![0u8; limit + 1]).unwrap();
        let mut chan = FramedChannel::new(Cursor::new(bytes), &p);
        assert_eq!(chan.receive(Tag::Answer).unwrap().len(), limit);
        assert!(matches!(chan.receive(Tag::Answer), Err(PirError::Abort(_))));
    }
}
