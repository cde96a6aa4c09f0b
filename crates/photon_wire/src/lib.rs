//! Photon packets as emitted by the TDC over UDP.
//!
//! Packet layout (little-endian):
//!   00  : u16     photon_count (N)
//!   02  : u16     sequence (rolling packet counter)
//!   04  : u8      alignment guard 0, must be 0
//!   05  : u8      alignment guard 1, must be 0
//!   06  : N photon records, 6 bytes each:
//!         [x_lo, x_hi, y_lo, y_hi, intensity, reserved]
//!
//! A packet with N = 0 is a heartbeat: it carries no photons but still
//! advances the sequence tracker. Bytes after the last record are ignored.
//!
//! Sequence wrapping is not handled: once the counter rolls over from
//! 0xFFFF to 0 every packet from that sender is stale until the tracker is
//! reset.

use thiserror::Error;

pub const HEADER_LEN: usize = 6;
pub const RECORD_LEN: usize = 6;

/// One detected hit, in detector (source) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhotonEvent {
    pub x: u16,
    pub y: u16,
    pub intensity: u8,
}

impl PhotonEvent {
    #[inline]
    pub const fn new(x: u16, y: u16, intensity: u8) -> Self {
        Self { x, y, intensity }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub photon_count: u16,
    pub sequence: u16,
    pub alignment: [u8; 2],
}

impl PacketHeader {
    /// Reads the fixed 6-byte header. Does not check the alignment guard.
    pub fn parse(buf: &[u8]) -> Result<Self, Rejection> {
        let mut p = buf;
        let photon_count = le_u16(&mut p)?;
        let sequence = le_u16(&mut p)?;
        let guard = take(&mut p, 2)?;

        Ok(Self {
            photon_count,
            sequence,
            alignment: [guard[0], guard[1]],
        })
    }

    #[inline]
    pub fn is_aligned(&self) -> bool {
        self.alignment == [0, 0]
    }

    /// Number of payload bytes the declared photon records occupy.
    #[inline]
    pub fn records_len(&self) -> usize {
        self.photon_count as usize * RECORD_LEN
    }
}

/// Why a packet was dropped. Rejections are expected on a lossy link and are
/// never fatal to the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("alignment guard bytes are non-zero")]
    Misaligned,

    #[error("stale sequence {sequence} (last accepted {last})")]
    StaleSequence { sequence: u16, last: u16 },

    #[error("truncated packet: need {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

impl Rejection {
    /// Short stable label, suitable for metric labels.
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::Misaligned => "misaligned",
            Rejection::StaleSequence { .. } => "stale_sequence",
            Rejection::Truncated { .. } => "truncated",
        }
    }
}

/// Comparison applied between an incoming sequence counter and the last
/// accepted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequencePolicy {
    /// `sequence >= last`. Retransmitted duplicates are accepted.
    #[default]
    NonDecreasing,
    /// `sequence > last`. Duplicates are rejected as stale.
    StrictlyIncreasing,
}

impl SequencePolicy {
    #[inline]
    pub fn admits(self, sequence: u16, last: u16) -> bool {
        match self {
            SequencePolicy::NonDecreasing => sequence >= last,
            SequencePolicy::StrictlyIncreasing => sequence > last,
        }
    }
}

/// Last accepted sequence counter for one sender.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    policy: SequencePolicy,
    last: u16,
}

impl SequenceTracker {
    pub fn new(policy: SequencePolicy) -> Self {
        Self { policy, last: 0 }
    }

    pub fn policy(&self) -> SequencePolicy {
        self.policy
    }

    pub fn last(&self) -> u16 {
        self.last
    }

    pub fn check(&self, sequence: u16) -> Result<(), Rejection> {
        if self.policy.admits(sequence, self.last) {
            Ok(())
        } else {
            Err(Rejection::StaleSequence {
                sequence,
                last: self.last,
            })
        }
    }

    pub fn accept(&mut self, sequence: u16) {
        self.last = sequence;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    pub header: PacketHeader,
    pub events: Vec<PhotonEvent>,
}

impl DecodedPacket {
    #[inline]
    pub fn is_heartbeat(&self) -> bool {
        self.events.is_empty()
    }
}

/// Decode one datagram and advance `tracker` if it is accepted.
///
/// The alignment guard is checked before the sequence, so a misaligned
/// packet is reported as `Misaligned` whatever its counter says.
pub fn decode_packet(buf: &[u8], tracker: &mut SequenceTracker) -> Result<DecodedPacket, Rejection> {
    let header = PacketHeader::parse(buf)?;
    if !header.is_aligned() {
        return Err(Rejection::Misaligned);
    }
    tracker.check(header.sequence)?;

    let mut p = &buf[HEADER_LEN..];
    let records = take(&mut p, header.records_len()).map_err(|_| Rejection::Truncated {
        expected: HEADER_LEN + header.records_len(),
        actual: buf.len(),
    })?;

    let events = records
        .chunks_exact(RECORD_LEN)
        .map(|r| PhotonEvent {
            x: u16::from_le_bytes([r[0], r[1]]),
            y: u16::from_le_bytes([r[2], r[3]]),
            intensity: r[4],
        })
        .collect();

    tracker.accept(header.sequence);

    Ok(DecodedPacket { header, events })
}

/// Build a well-formed packet. Panics if more than `u16::MAX` events are given.
pub fn encode_packet(sequence: u16, events: &[PhotonEvent]) -> Vec<u8> {
    let count = u16::try_from(events.len()).expect("photon count exceeds u16");
    let mut out = Vec::with_capacity(HEADER_LEN + events.len() * RECORD_LEN);

    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(&sequence.to_le_bytes());
    out.extend_from_slice(&[0, 0]);

    for ev in events {
        out.extend_from_slice(&ev.x.to_le_bytes());
        out.extend_from_slice(&ev.y.to_le_bytes());
        out.push(ev.intensity);
        out.push(0);
    }

    out
}

#[inline(always)]
fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], Rejection> {
    if buf.len() < n {
        return Err(Rejection::Truncated {
            expected: n,
            actual: buf.len(),
        });
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

#[inline(always)]
fn le_u16(buf: &mut &[u8]) -> Result<u16, Rejection> {
    let b = take(buf, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}
