//! Replay protection for SRTP and SRTCP (RFC 3711 section 3.3.2)

/// Default replay window size in packets
pub const REPLAY_WINDOW_SIZE: u64 = 64;

/// Sliding window over packet indices with a bitmap of the last 64
#[derive(Debug, Clone, Default)]
pub struct ReplayWindow {
    /// Highest index accepted so far
    highest: Option<u64>,

    /// Bit `n` set means `highest - n` was accepted
    bitmap: u64,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `index` may be accepted: not seen before and not older than
    /// the window. Does not record it.
    pub fn check(&self, index: u64) -> bool {
        let Some(highest) = self.highest else {
            return true;
        };
        if index > highest {
            return true;
        }
        let delta = highest - index;
        delta < REPLAY_WINDOW_SIZE && self.bitmap & (1 << delta) == 0
    }

    /// Record an index whose authentication has been verified
    pub fn accept(&mut self, index: u64) {
        match self.highest {
            None => {
                self.highest = Some(index);
                self.bitmap = 1;
            }
            Some(highest) if index > highest => {
                let shift = index - highest;
                self.bitmap = if shift >= REPLAY_WINDOW_SIZE { 0 } else { self.bitmap << shift };
                self.bitmap |= 1;
                self.highest = Some(index);
            }
            Some(highest) => {
                let delta = highest - index;
                if delta < REPLAY_WINDOW_SIZE {
                    self.bitmap |= 1 << delta;
                }
            }
        }
    }

    /// Highest index accepted so far
    pub fn highest(&self) -> Option<u64> {
        self.highest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_are_rejected() {
        let mut window = ReplayWindow::new();
        assert!(window.check(10));
        window.accept(10);
        assert!(!window.check(10));
        assert!(window.check(11));
        assert!(window.check(9));
    }

    #[test]
    fn test_window_boundary() {
        let mut window = ReplayWindow::new();
        window.accept(100);
        // 63 behind is inside the window, 64 behind is not
        assert!(window.check(37));
        assert!(!window.check(36));

        window.accept(37);
        assert!(!window.check(37));
    }

    #[test]
    fn test_large_jump_clears_history() {
        let mut window = ReplayWindow::new();
        window.accept(1);
        window.accept(2);
        window.accept(1000);
        assert_eq!(window.highest(), Some(1000));
        assert!(!window.check(2));
        assert!(window.check(999));
    }

    proptest::proptest! {
        #[test]
        fn no_index_is_accepted_twice(indices in proptest::collection::vec(0u64..300, 1..200)) {
            let mut window = ReplayWindow::new();
            let mut accepted = std::collections::HashSet::new();
            for index in indices {
                if window.check(index) {
                    proptest::prop_assert!(accepted.insert(index), "index {} accepted twice", index);
                    if let Some(highest) = window.highest() {
                        proptest::prop_assert!(index + REPLAY_WINDOW_SIZE > highest);
                    }
                    window.accept(index);
                }
            }
        }
    }
}
