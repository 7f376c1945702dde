//! Send priority classes.

/// Urgency of an outgoing message.
///
/// Queued messages are packed in priority order, lowest value first.
/// `Immediate` messages also skip the tick batching: the connection flushes on
/// its next poll instead of waiting for the tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Priority {
    /// Flushed right away.
    Immediate = 0,
    /// Default priority.
    #[default]
    High = 1,
    /// Packed after `Immediate` and `High`.
    Medium = 2,
    /// Packed last.
    Low = 3,
}

impl Priority {
    /// Every priority, most urgent first.
    pub const ALL: [Self; 4] = [Self::Immediate, Self::High, Self::Medium, Self::Low];

    /// Parse a priority from its numeric value.
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(usize::from(value)).copied()
    }

    /// Position in [`ALL`](Self::ALL).
    pub fn index(self) -> usize {
        self as usize
    }
}
