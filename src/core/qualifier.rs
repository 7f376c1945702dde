//! Channel qualifier codec.
//!
//! Every channel-scoped message carries a one-byte qualifier:
//!
//! ```text
//!   7   6   5   4   3   2   1   0
//! +-------+---+-------------------+
//! | type  | R |      number       |
//! +-------+---+-------------------+
//! ```
//!
//! `R` is reserved and must be zero for the qualifier to be valid.

use super::constants::{
    CHANNEL_NUMBER_MASK, CHANNEL_RESERVED_BIT, CHANNEL_TYPE_SHIFT, MAX_CHANNEL_NUMBER,
    MAX_CHANNEL_TYPE,
};
use super::error::QualifierError;

/// Delivery class of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelType {
    /// Delivered as received. May be lost, duplicated or reordered.
    Unreliable = 0,
    /// Not retransmitted; arrivals older than the newest seen are dropped.
    UnreliableSequenced = 1,
    /// Only the newest message is retransmitted; older arrivals are dropped.
    ReliableSequenced = 2,
    /// Retransmitted until acknowledged and delivered strictly in order.
    ReliableOrdered = 3,
}

impl ChannelType {
    /// Parse a channel type from its two-bit value.
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Unreliable),
            1 => Some(Self::UnreliableSequenced),
            2 => Some(Self::ReliableSequenced),
            3 => Some(Self::ReliableOrdered),
            _ => None,
        }
    }

    /// Two-bit value of this channel type.
    pub fn as_bits(self) -> u8 {
        self as u8
    }

    /// Whether messages of this type are retransmitted until acknowledged.
    pub fn is_reliable(self) -> bool {
        matches!(self, Self::ReliableSequenced | Self::ReliableOrdered)
    }

    /// Whether arrivals older than the newest delivered message are dropped.
    pub fn is_sequenced(self) -> bool {
        !matches!(self, Self::Unreliable)
    }
}

/// Encode a channel type and number into a qualifier byte.
///
/// Fails if `channel_type > 3` or `number > 31`.
pub fn encode(channel_type: u8, number: u8) -> Result<u8, QualifierError> {
    if channel_type > MAX_CHANNEL_TYPE {
        return Err(QualifierError::InvalidType(channel_type));
    }
    if number > MAX_CHANNEL_NUMBER {
        return Err(QualifierError::InvalidNumber(number));
    }
    Ok((channel_type << CHANNEL_TYPE_SHIFT) | number)
}

/// Extract the channel type bits. Never fails.
pub fn decode_type(byte: u8) -> ChannelType {
    match byte >> CHANNEL_TYPE_SHIFT {
        0 => ChannelType::Unreliable,
        1 => ChannelType::UnreliableSequenced,
        2 => ChannelType::ReliableSequenced,
        _ => ChannelType::ReliableOrdered,
    }
}

/// Whether `byte` is a valid qualifier (reserved bit clear).
pub fn is_valid(byte: u8) -> bool {
    byte & CHANNEL_RESERVED_BIT == 0
}

/// A validated channel qualifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelQualifier(u8);

impl ChannelQualifier {
    /// Reliable-ordered channel 0.
    pub const DEFAULT: Self = Self(0xC0);

    /// Build a qualifier from a typed channel type and a number.
    pub fn new(channel_type: ChannelType, number: u8) -> Result<Self, QualifierError> {
        encode(channel_type.as_bits(), number).map(Self)
    }

    /// Parse a qualifier byte, rejecting the reserved bit.
    pub fn from_byte(byte: u8) -> Result<Self, QualifierError> {
        if is_valid(byte) {
            Ok(Self(byte))
        } else {
            Err(QualifierError::Reserved(byte))
        }
    }

    /// Raw qualifier byte.
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Channel type.
    pub fn channel_type(self) -> ChannelType {
        decode_type(self.0)
    }

    /// Channel number (0-31).
    pub fn number(self) -> u8 {
        self.0 & CHANNEL_NUMBER_MASK
    }

    /// Whether this channel retransmits until acknowledged.
    pub fn is_reliable(self) -> bool {
        self.channel_type().is_reliable()
    }
}

impl Default for ChannelQualifier {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u8> for ChannelQualifier {
    type Error = QualifierError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::from_byte(byte)
    }
}

impl From<ChannelQualifier> for u8 {
    fn from(q: ChannelQualifier) -> u8 {
        q.0
    }
}
