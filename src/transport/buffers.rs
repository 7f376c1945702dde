//! Sender and receiver buffers plus cyclic sequence arithmetic.
//!
//! Sequence numbers are 16 bits and wrap; `a` is "after" `b` when the signed
//! distance from `b` to `a` is positive.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::core::{ChannelQualifier, ChannelType, ConnectionError, Priority};

/// `a` comes strictly after `b`.
pub fn seq_gt(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) as i16) > 0
}

/// `a` is `b` or comes before it.
pub fn seq_le(a: u16, b: u16) -> bool {
    !seq_gt(a, b)
}

/// A reliable message waiting for acknowledgement.
#[derive(Debug, Clone)]
pub struct Unacked {
    /// Channel the message was sent on.
    pub channel: ChannelQualifier,
    /// Sequence number.
    pub seq: u16,
    /// Packing priority.
    pub priority: Priority,
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// Last transmission, `None` until first sent.
    pub last_sent: Option<Instant>,
    /// Congestion-control packet number of the last transmission.
    pub packet: u64,
}

/// Reliable messages in send order, bounded by payload bytes.
#[derive(Debug)]
pub struct SenderBuffer {
    entries: VecDeque<Unacked>,
    bytes: usize,
    capacity: usize,
}

impl SenderBuffer {
    /// Create a buffer holding at most `capacity` payload bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            bytes: 0,
            capacity,
        }
    }

    /// Queue a message.
    ///
    /// On a reliable-sequenced channel only the newest message matters, so any
    /// older message of the same channel is replaced.
    pub fn push(
        &mut self,
        channel: ChannelQualifier,
        seq: u16,
        priority: Priority,
        payload: Vec<u8>,
    ) -> Result<(), ConnectionError> {
        let replaced = if channel.channel_type() == ChannelType::ReliableSequenced {
            self.entries
                .iter()
                .filter(|e| e.channel == channel)
                .map(|e| e.payload.len())
                .sum()
        } else {
            0
        };
        if self.bytes - replaced + payload.len() > self.capacity {
            return Err(ConnectionError::SenderBufferFull {
                capacity: self.capacity,
            });
        }
        if replaced > 0 {
            self.entries.retain(|e| e.channel != channel);
            self.bytes -= replaced;
        }
        self.bytes += payload.len();
        self.entries.push_back(Unacked {
            channel,
            seq,
            priority,
            payload,
            last_sent: None,
            packet: 0,
        });
        Ok(())
    }

    /// Apply a cumulative ack for `channel`. Returns the payload bytes freed.
    pub fn ack(&mut self, channel: ChannelQualifier, ack: u16) -> usize {
        let mut freed = 0;
        self.entries.retain(|e| {
            let done = e.channel == channel && seq_le(e.seq, ack);
            if done {
                freed += e.payload.len();
            }
            !done
        });
        self.bytes -= freed;
        freed
    }

    /// Whether every message has been acknowledged.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of unacknowledged messages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Payload bytes transmitted at least once and not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.last_sent.is_some())
            .map(|e| e.payload.len())
            .sum()
    }

    /// Whether any message has never been transmitted.
    pub fn has_unsent(&self) -> bool {
        self.entries.iter().any(|e| e.last_sent.is_none())
    }

    /// Entries in send order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Unacked> {
        self.entries.iter_mut()
    }

    /// Earliest instant an already-sent message becomes due for retransmission.
    pub fn next_retransmit(&self, timeout: Duration) -> Option<Instant> {
        self.entries
            .iter()
            .filter_map(|e| e.last_sent)
            .min()
            .map(|t| t + timeout)
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }
}

/// Out-of-order reliable-ordered messages waiting for a gap to close.
#[derive(Debug)]
pub struct ReceiverBuffer {
    channels: HashMap<ChannelQualifier, HashMap<u16, Vec<u8>>>,
    bytes: usize,
    capacity: usize,
}

impl ReceiverBuffer {
    /// Create a buffer holding at most `capacity` payload bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: HashMap::new(),
            bytes: 0,
            capacity,
        }
    }

    /// Hold a message that arrived ahead of the expected sequence number.
    ///
    /// Returns false when it was not stored (duplicate or no room); the sender
    /// retransmits it later.
    pub fn insert(&mut self, channel: ChannelQualifier, seq: u16, payload: Vec<u8>) -> bool {
        if self.bytes + payload.len() > self.capacity {
            return false;
        }
        let slots = self.channels.entry(channel).or_default();
        if slots.contains_key(&seq) {
            return false;
        }
        self.bytes += payload.len();
        slots.insert(seq, payload);
        true
    }

    /// Take the message with sequence number `seq`, if held.
    pub fn take(&mut self, channel: ChannelQualifier, seq: u16) -> Option<Vec<u8>> {
        let payload = self.channels.get_mut(&channel)?.remove(&seq)?;
        self.bytes -= payload.len();
        Some(payload)
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.channels.clear();
        self.bytes = 0;
    }
}
