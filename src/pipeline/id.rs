//! Identity types for the pipeline.
//!
//! All IDs are `u32` newtypes. Frame counts are the keys of the frame table
//! and the only thing stage queues carry.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonic key of an in-flight frame.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct FrameCount(pub u32);

impl FrameCount {
    pub const INVALID: FrameCount = FrameCount(0);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for FrameCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "F(INVALID)")
        } else {
            write!(f, "F{}", self.0)
        }
    }
}

impl fmt::Display for FrameCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Negotiated stream.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub u32);

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_count() {
        let fc = FrameCount(42);
        assert!(fc.is_valid());
        assert_eq!(fc.get(), 42);
        assert!(!FrameCount::INVALID.is_valid());
        assert_eq!(format!("{}", fc), "F42");
    }

    #[test]
    fn test_stream_id_ordering() {
        assert!(StreamId(1) < StreamId(2));
        assert_eq!(format!("{:?}", StreamId(3)), "S3");
    }
}
