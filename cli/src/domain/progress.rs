//! Coarse download progress: report only when a 5% boundary is crossed.

/// Granularity of reported download progress, in percent.
pub const PROGRESS_STEP: u8 = 5;

/// Tracks the last reported percentage of a transfer.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    total: Option<u64>,
    received: u64,
    last_reported: Option<u8>,
}

impl ProgressTracker {
    /// `total` is the expected byte count, when the server announced one.
    #[must_use]
    pub fn new(total: Option<u64>) -> Self {
        Self {
            total: total.filter(|t| *t > 0),
            received: 0,
            last_reported: None,
        }
    }

    /// Record `bytes` more received. Returns the boundary to report when a new
    /// multiple of [`PROGRESS_STEP`] has been reached.
    pub fn advance(&mut self, bytes: u64) -> Option<u8> {
        self.received = self.received.saturating_add(bytes);
        let total = self.total?;
        let pct = (u128::from(self.received) * 100 / u128::from(total)).min(100);
        let pct = u8::try_from(pct).unwrap_or(100);
        let boundary = pct - pct % PROGRESS_STEP;
        if self.last_reported.is_some_and(|last| last >= boundary) {
            return None;
        }
        self.last_reported = Some(boundary);
        Some(boundary)
    }

    #[must_use]
    pub fn received(&self) -> u64 {
        self.received
    }
}
