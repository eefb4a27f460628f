//! Sliding-window replay protection for counter nonces.
//!
//! The window tracks the highest accepted counter and a bitmap of the
//! `size` counters below it. Anything older than the window, or already
//! marked, is rejected. [`ReplayWindow::check`] never mutates, so callers
//! test a counter before decryption and [`ReplayWindow::accept`] it only
//! after the tag verified.

/// Default window size in counters
pub const DEFAULT_WINDOW: u64 = 1024;

/// Bitmap replay window.
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    /// Highest counter accepted so far
    highest: Option<u64>,
    /// One bit per counter, indexed by `counter % size`
    bitmap: Vec<u64>,
    /// Window size in counters (multiple of 64)
    size: u64,
}

impl ReplayWindow {
    /// Create a window of [`DEFAULT_WINDOW`] counters
    #[must_use]
    pub fn new() -> Self {
        Self::with_size(DEFAULT_WINDOW)
    }

    /// Create a window holding at least `size` counters (rounded up to 64)
    #[must_use]
    pub fn with_size(size: u64) -> Self {
        let words = size.div_ceil(64).max(1);
        Self {
            highest: None,
            bitmap: vec![0; usize::try_from(words).unwrap_or(1)],
            size: words * 64,
        }
    }

    /// Window size in counters
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Highest accepted counter
    #[must_use]
    pub fn highest(&self) -> Option<u64> {
        self.highest
    }

    fn bit(&self, counter: u64) -> (usize, u64) {
        let index = counter % self.size;
        ((index / 64) as usize, 1u64 << (index % 64))
    }

    /// Would `counter` be accepted?
    #[must_use]
    pub fn check(&self, counter: u64) -> bool {
        let Some(highest) = self.highest else {
            return true;
        };
        if counter > highest {
            return true;
        }
        if highest - counter >= self.size {
            return false;
        }
        let (word, mask) = self.bit(counter);
        self.bitmap[word] & mask == 0
    }

    /// Mark `counter` as seen. Returns `false` for a replay or a counter
    /// older than the window.
    pub fn accept(&mut self, counter: u64) -> bool {
        if !self.check(counter) {
            return false;
        }

        match self.highest {
            None => {
                self.highest = Some(counter);
            }
            Some(highest) if counter > highest => {
                let advance = counter - highest;
                if advance >= self.size {
                    self.bitmap.iter_mut().for_each(|w| *w = 0);
                } else {
                    for skipped in (highest + 1)..=counter {
                        let (word, mask) = self.bit(skipped);
                        self.bitmap[word] &= !mask;
                    }
                }
                self.highest = Some(counter);
            }
            Some(_) => {}
        }

        let (word, mask) = self.bit(counter);
        self.bitmap[word] |= mask;
        true
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}
