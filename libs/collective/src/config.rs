//! Startup configuration for one collective participant.
//!
//! Rank, size, and fanout come from host configuration exactly once at
//! subsystem initialization; everything derived from them is immutable
//! afterwards. Validation failures here are fatal to initialization.

use serde::{Deserialize, Serialize};

use crate::{CollectiveError, CollectiveResult};

/// Tree fanout used when the configured value is 0 ("pick for me").
pub const DEFAULT_FANOUT: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectiveConfig {
    /// This participant's rank in `[0, size)`.
    pub rank: u32,
    /// Total participant count.
    pub size: u32,
    /// Requested tree fanout; 0 selects [`DEFAULT_FANOUT`]. Values
    /// larger than `size` are clamped at topology construction.
    #[serde(default)]
    pub fanout: u32,
}

impl CollectiveConfig {
    pub fn new(rank: u32, size: u32, fanout: u32) -> Self {
        Self { rank, size, fanout }
    }

    pub fn validate(&self) -> CollectiveResult<()> {
        if self.size == 0 {
            return Err(CollectiveError::config("size must be at least 1"));
        }
        if self.rank >= self.size {
            return Err(CollectiveError::config(format!(
                "rank {} out of range for size {}",
                self.rank, self.size
            )));
        }
        Ok(())
    }
}
