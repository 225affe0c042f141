use serde::{Deserialize, Serialize};

/// Cumulative progress of one upload or download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransferProgress {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}

impl TransferProgress {
    pub fn new(bytes_transferred: u64, total_bytes: u64) -> Self {
        Self { bytes_transferred, total_bytes }
    }

    /// Completed fraction in `0.0..=1.0`, or `None` when the total is unknown.
    pub fn fraction(&self) -> Option<f32> {
        if self.total_bytes == 0 {
            return None;
        }
        Some((self.bytes_transferred as f64 / self.total_bytes as f64).min(1.0) as f32)
    }
}
