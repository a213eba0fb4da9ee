//! Sliding receive window for replay detection.
//!
//! Tracks the highest accepted counter plus a bitmap of the 64 counters at
//! and below it. Frames may arrive out of order within the window; anything
//! older, or anything already seen, is rejected.
//!
//! [`ReceiveWindow::check`] is read-only. Callers authenticate the frame first
//! and only then call [`ReceiveWindow::accept`], so a forged frame can never
//! advance the window.

use crate::error::ReplayError;

/// Number of counters tracked behind the highest accepted one.
pub const WINDOW_SIZE: u64 = 64;

/// Replay window state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveWindow {
    highest: Option<u64>,
    /// Bit `i` set means counter `highest - i` was accepted.
    bitmap: u64,
}

impl ReceiveWindow {
    /// Empty window: every counter is acceptable.
    pub const fn new() -> Self {
        Self { highest: None, bitmap: 0 }
    }

    /// Highest counter accepted so far.
    pub const fn highest(&self) -> Option<u64> {
        self.highest
    }

    /// Would `counter` be accepted?
    ///
    /// # Errors
    ///
    /// - `ReplayError::Duplicate` if the counter was already accepted
    /// - `ReplayError::TooOld` if it is more than [`WINDOW_SIZE`] - 1 behind
    ///   the highest accepted counter
    pub fn check(&self, counter: u64) -> Result<(), ReplayError> {
        let Some(highest) = self.highest else {
            return Ok(());
        };

        if counter > highest {
            return Ok(());
        }

        let offset = highest - counter;
        if offset >= WINDOW_SIZE {
            return Err(ReplayError::TooOld { counter, highest });
        }

        if self.bitmap & (1u64 << offset) != 0 {
            return Err(ReplayError::Duplicate { counter });
        }

        Ok(())
    }

    /// Record `counter` as accepted.
    ///
    /// # Errors
    ///
    /// Same as [`Self::check`]; the window is unchanged on error.
    pub fn accept(&mut self, counter: u64) -> Result<(), ReplayError> {
        self.check(counter)?;

        match self.highest {
            None => {
                self.highest = Some(counter);
                self.bitmap = 1;
            },
            Some(highest) if counter > highest => {
                let shift = counter - highest;
                self.bitmap = if shift >= WINDOW_SIZE { 0 } else { self.bitmap << shift };
                self.bitmap |= 1;
                self.highest = Some(counter);
            },
            Some(highest) => {
                self.bitmap |= 1u64 << (highest - counter);
            },
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_window_accepts_anything() {
        let mut window = ReceiveWindow::new();
        assert!(window.check(0).is_ok());
        assert!(window.check(u64::MAX).is_ok());
        window.accept(5).unwrap();
        assert_eq!(window.highest(), Some(5));
    }

    #[test]
    fn duplicate_rejected() {
        let mut window = ReceiveWindow::new();
        window.accept(0).unwrap();
        assert_eq!(window.accept(0), Err(ReplayError::Duplicate { counter: 0 }));
    }

    #[test]
    fn out_of_order_within_window() {
        let mut window = ReceiveWindow::new();
        window.accept(10).unwrap();
        window.accept(8).unwrap();
        window.accept(9).unwrap();
        assert_eq!(window.accept(8), Err(ReplayError::Duplicate { counter: 8 }));
        assert_eq!(window.highest(), Some(10));
    }

    #[test]
    fn edge_of_window() {
        let mut window = ReceiveWindow::new();
        window.accept(100).unwrap();

        // 63 behind is the oldest still tracked
        assert!(window.check(100 - 63).is_ok());
        assert_eq!(window.check(100 - 64), Err(ReplayError::TooOld { counter: 36, highest: 100 }));
    }

    #[test]
    fn large_jump_clears_bitmap() {
        let mut window = ReceiveWindow::new();
        window.accept(1).unwrap();
        window.accept(1_000).unwrap();

        assert_eq!(window.check(1), Err(ReplayError::TooOld { counter: 1, highest: 1_000 }));
        assert!(window.check(999).is_ok());
    }

    #[test]
    fn failed_accept_leaves_window_unchanged() {
        let mut window = ReceiveWindow::new();
        window.accept(3).unwrap();
        let before = window;
        assert!(window.accept(3).is_err());
        assert_eq!(window, before);
    }
}
