//! Core types shared by every layer.

pub mod constants;
mod error;
mod priority;
pub mod qualifier;

pub use constants::*;
pub use error::*;
pub use priority::Priority;
pub use qualifier::{ChannelQualifier, ChannelType};
