//! Sliding 64-entry window of already-accepted sequence numbers.

/// Number of sequence numbers tracked below the highest one seen.
pub const WINDOW_SIZE: u64 = 64;

/// Bit `n` of the mask marks `highest - n` as seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayWindow {
    highest: u64,
    mask: u64,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn highest(&self) -> u64 {
        self.highest
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }

    /// Whether `seq` has not been accepted yet and is still inside the window.
    pub fn is_valid(&self, seq: u64) -> bool {
        if seq > self.highest {
            return true;
        }
        let offset = self.highest - seq;
        offset < WINDOW_SIZE && self.mask & (1u64 << offset) == 0
    }

    /// Marks `seq` as accepted, sliding the window forward when it is new.
    pub fn update(&mut self, seq: u64) {
        if seq > self.highest {
            let shift = seq - self.highest;
            self.mask = if shift >= WINDOW_SIZE {
                0
            } else {
                self.mask << shift
            };
            self.mask |= 1;
            self.highest = seq;
        } else {
            let offset = self.highest - seq;
            if offset < WINDOW_SIZE {
                self.mask |= 1u64 << offset;
            }
        }
    }

    /// Checks and marks in one step.
    pub fn accept(&mut self, seq: u64) -> bool {
        if self.is_valid(seq) {
            self.update(seq);
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sixty_four_accepted_once() {
        let mut window = ReplayWindow::new();
        for seq in 0..64 {
            assert!(window.accept(seq), "sequence {} should be accepted", seq);
        }
        for seq in 0..64 {
            assert!(!window.is_valid(seq), "sequence {} should be a replay", seq);
        }
        assert_eq!(window.highest(), 63);
        assert_eq!(window.mask(), u64::MAX);
    }

    #[test]
    fn test_replay_after_advance() {
        let mut window = ReplayWindow::new();
        for seq in 0..64 {
            window.update(seq);
        }
        assert!(!window.is_valid(5));
    }

    #[test]
    fn test_outside_window_rejected_even_if_unseen() {
        let mut window = ReplayWindow::new();
        window.update(100);
        assert!(!window.is_valid(100 - 70));
        assert!(!window.is_valid(100 - 64));
        assert!(window.is_valid(100 - 63));
    }

    #[test]
    fn test_out_of_order_inside_window() {
        let mut window = ReplayWindow::new();
        assert!(window.accept(10));
        assert!(window.accept(7));
        assert!(window.accept(9));
        assert!(!window.accept(7));
        assert!(window.accept(8));
        assert!(!window.accept(10));
    }

    #[test]
    fn test_large_jump_clears_mask() {
        let mut window = ReplayWindow::new();
        for seq in 0..10 {
            window.update(seq);
        }
        window.update(1_000);
        assert_eq!(window.mask(), 1);
        assert!(window.is_valid(999));
        assert!(!window.is_valid(1_000));
    }

    #[test]
    fn test_reset() {
        let mut window = ReplayWindow::new();
        window.update(42);
        window.reset();
        assert_eq!(window, ReplayWindow::new());
        assert!(window.is_valid(0));
    }
}
