//! Sequence numbers and replay detection.
//!
//! [`MonotonicCounter`] hands out per-sender sequence numbers.
//! [`ReplayFilter`] tracks the highest sequence seen from one sender plus a
//! bitmap of the `window_size` sequences below it, so reordered delivery is
//! accepted while duplicates and very old sequences are refused.
//! [`DigestWindow`] remembers recent ciphertext digests, which unlike the
//! sequence number cannot be rewritten without breaking decryption.
//!
//! Both split the test from the update so a caller can record an item only
//! once it has been stored.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// Largest supported window (16 x 64 bits).
pub const MAX_WINDOW: usize = 1024;

const WORDS: usize = MAX_WINDOW / 64;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum ReplayError {
    #[error("sequence {sequence} already seen")]
    Duplicate { sequence: u64 },
    #[error("sequence {sequence} is older than the replay window (oldest accepted {oldest})")]
    OutsideWindow { sequence: u64, oldest: u64 },
    #[error("ciphertext already seen")]
    DuplicateCiphertext,
}

/// Sliding-window duplicate detector for one sender.
///
/// Bit `i` of the bitmap records whether `highest - i` has been seen.
#[derive(Debug, Clone)]
pub struct ReplayFilter {
    highest: Option<u64>,
    seen: [u64; WORDS],
    window_size: usize,
}

impl Default for ReplayFilter {
    fn default() -> Self {
        Self::new(MAX_WINDOW)
    }
}

impl ReplayFilter {
    /// Window sizes are clamped to `1..=MAX_WINDOW`.
    pub fn new(window_size: usize) -> Self {
        Self {
            highest: None,
            seen: [0u64; WORDS],
            window_size: window_size.clamp(1, MAX_WINDOW),
        }
    }

    /// Accept `sequence` once; reject repeats and sequences below the window.
    pub fn check_and_update(&mut self, sequence: u64) -> Result<(), ReplayError> {
        self.check(sequence)?;
        self.record(sequence);
        Ok(())
    }

    /// Whether `sequence` would be accepted. Does not mark it as seen.
    pub fn check(&self, sequence: u64) -> Result<(), ReplayError> {
        let Some(highest) = self.highest else {
            return Ok(());
        };
        if sequence > highest {
            return Ok(());
        }

        let offset = highest - sequence;
        if offset >= self.window_size as u64 {
            return Err(ReplayError::OutsideWindow {
                sequence,
                oldest: self.oldest_accepted().unwrap_or(0),
            });
        }
        let (word, bit) = ((offset / 64) as usize, offset % 64);
        if self.seen[word] & (1u64 << bit) != 0 {
            return Err(ReplayError::Duplicate { sequence });
        }
        Ok(())
    }

    /// Mark `sequence` as seen. Sequences below the window are ignored.
    pub fn record(&mut self, sequence: u64) {
        let highest = match self.highest {
            None => {
                self.highest = Some(sequence);
                self.seen[0] = 1;
                return;
            }
            Some(h) => h,
        };

        if sequence > highest {
            self.shift(sequence - highest);
            self.highest = Some(sequence);
            self.seen[0] |= 1;
            return;
        }

        let offset = highest - sequence;
        if offset < self.window_size as u64 {
            let (word, bit) = ((offset / 64) as usize, offset % 64);
            self.seen[word] |= 1u64 << bit;
        }
    }

    /// Highest sequence accepted so far.
    pub fn highest(&self) -> Option<u64> {
        self.highest
    }

    /// Oldest sequence that could still be accepted.
    pub fn oldest_accepted(&self) -> Option<u64> {
        self.highest
            .map(|h| h.saturating_sub(self.window_size as u64 - 1))
    }

    fn shift(&mut self, by: u64) {
        if by >= MAX_WINDOW as u64 {
            self.seen = [0u64; WORDS];
            return;
        }
        let words = (by / 64) as usize;
        let bits = (by % 64) as u32;
        for i in (0..WORDS).rev() {
            if i < words {
                self.seen[i] = 0;
                continue;
            }
            let src = i - words;
            let mut value = self.seen[src] << bits;
            if bits > 0 && src > 0 {
                value |= self.seen[src - 1] >> (64 - bits);
            }
            self.seen[i] = value;
        }
    }
}

/// Bounded set of the most recent 32-byte digests for one sender.
#[derive(Debug, Clone)]
pub struct DigestWindow {
    order: VecDeque<[u8; 32]>,
    members: HashSet<[u8; 32]>,
    capacity: usize,
}

impl DigestWindow {
    /// Capacities are clamped to `1..=MAX_WINDOW`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_WINDOW);
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    pub fn check(&self, digest: &[u8; 32]) -> Result<(), ReplayError> {
        if self.members.contains(digest) {
            return Err(ReplayError::DuplicateCiphertext);
        }
        Ok(())
    }

    /// Remember `digest`, evicting the oldest entry when full.
    pub fn record(&mut self, digest: [u8; 32]) {
        if !self.members.insert(digest) {
            return;
        }
        self.order.push_back(digest);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Lock-free monotonic counter.
#[derive(Debug)]
pub struct MonotonicCounter {
    value: AtomicU64,
}

impl MonotonicCounter {
    /// Start after `initial`; the first `increment` returns `initial + 1`.
    pub fn new(initial: u64) -> Self {
        Self {
            value: AtomicU64::new(initial),
        }
    }

    /// Increment and return the new value.
    pub fn increment(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }
}

impl Default for MonotonicCounter {
    fn default() -> Self {
        Self::new(0)
    }
}
