//! Anti-replay window over recipient sequence numbers.
//!
//! The window is a 32-bit bitmap sliding under the highest verified
//! sequence number. Checking and committing are separate operations: a
//! candidate is checked before AEAD verification and committed only after
//! it, so a forged partial IV can never advance the window.

/// Sliding anti-replay window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayWindow {
    /// Highest sequence number ever committed
    high: u64,
    /// Bit `i` set means `high - i` was seen; bit 0 is `high` itself
    bitmap: u32,
}

impl ReplayWindow {
    /// Window width in sequence numbers.
    pub const SIZE: u64 = 32;

    /// A window that has seen nothing.
    #[must_use]
    pub fn new() -> Self {
        ReplayWindow { high: 0, bitmap: 0 }
    }

    /// Rebuild a window from persisted parts.
    #[must_use]
    pub fn from_parts(high: u64, bitmap: u32) -> Self {
        ReplayWindow { high, bitmap }
    }

    /// The persisted representation: (high watermark, bitmap).
    #[must_use]
    pub fn parts(&self) -> (u64, u32) {
        (self.high, self.bitmap)
    }

    /// Whether `seq` would be accepted: newer than the high watermark, or
    /// inside the window with its bit still clear.
    #[must_use]
    pub fn check(&self, seq: u64) -> bool {
        if seq > self.high {
            return true;
        }
        let offset = self.high - seq;
        offset < Self::SIZE && self.bitmap & (1 << offset) == 0
    }

    /// Record `seq` as seen. Call only after [`check`](Self::check)
    /// approved it and the AEAD verified.
    pub fn commit(&mut self, seq: u64) {
        if seq > self.high {
            let shift = seq - self.high;
            self.bitmap = if shift >= Self::SIZE {
                1
            } else {
                self.bitmap << shift | 1
            };
            self.high = seq;
        } else {
            self.bitmap |= 1 << (self.high - seq);
        }
    }

    /// Highest committed sequence number.
    #[must_use]
    pub fn high(&self) -> u64 {
        self.high
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_accept() {
        let mut window = ReplayWindow::new();
        for seq in 0..100 {
            assert!(window.check(seq), "seq {seq} should pass");
            window.commit(seq);
            assert!(!window.check(seq), "seq {seq} replay should fail");
        }
        assert_eq!(window.high(), 99);
    }

    #[test]
    fn test_out_of_order_within_window() {
        let mut window = ReplayWindow::new();
        window.commit(40);

        for seq in [39, 20, 9] {
            assert!(window.check(seq));
            window.commit(seq);
            assert!(!window.check(seq));
        }
        // high watermark untouched by in-window commits
        assert_eq!(window.high(), 40);
    }

    #[test]
    fn test_below_window_rejected() {
        let mut window = ReplayWindow::new();
        window.commit(100);

        // 100 - 32 = 68 is the oldest representable; 68 and below fail
        assert!(!window.check(68));
        assert!(!window.check(0));
        assert!(window.check(69));
    }

    #[test]
    fn test_large_jump_resets_bitmap() {
        let mut window = ReplayWindow::new();
        for seq in 0..5 {
            window.commit(seq);
        }
        window.commit(1000);

        assert_eq!(window.high(), 1000);
        assert!(!window.check(1000));
        // everything within the new window but uncommitted passes
        assert!(window.check(999));
        assert!(window.check(969));
        assert!(!window.check(968));
    }

    #[test]
    fn test_check_does_not_advance() {
        let window = ReplayWindow::new();
        assert!(window.check(5));
        // check alone must not change state
        assert!(window.check(5));
        assert_eq!(window.parts(), (0, 0));
    }

    #[test]
    fn test_persistence_roundtrip() {
        let mut window = ReplayWindow::new();
        window.commit(50);
        window.commit(48);

        let (high, bitmap) = window.parts();
        let restored = ReplayWindow::from_parts(high, bitmap);
        assert_eq!(restored, window);
        assert!(!restored.check(50));
        assert!(!restored.check(48));
        assert!(restored.check(49));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_committed_never_reaccepted(
                seqs in prop::collection::vec(0u64..10_000, 1..200)
            ) {
                let mut window = ReplayWindow::new();
                let mut committed = Vec::new();
                for seq in seqs {
                    if window.check(seq) {
                        window.commit(seq);
                        committed.push(seq);
                    }
                }
                for seq in committed {
                    prop_assert!(!window.check(seq));
                }
            }

            #[test]
            fn prop_below_low_water_rejected(high in 100u64..1_000_000, below in 0u64..50) {
                let mut window = ReplayWindow::new();
                window.commit(high);
                let candidate = high - ReplayWindow::SIZE - below;
                prop_assert!(!window.check(candidate));
            }
        }
    }
}
