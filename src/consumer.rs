use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::offset_word::OffsetWord;
use crate::queue::StorePaths;
use crate::segment::{Segment, SegmentLayout};
use crate::{Error, Result};

/// Reading half of the queue.
///
/// The consumer owns its offset word and a read-only mapping of the head
/// segment. `consume` blocks until a record is visible: it busy-spins for a
/// bounded budget, then falls back to sleep-and-retry. Progress is persisted
/// only on `commit`, so a crashed consumer re-reads the uncommitted record.
pub struct Consumer {
    log_dir: PathBuf,
    producer_offset_path: PathBuf,
    layout: SegmentLayout,
    offset: OffsetWord,
    segment: Option<Segment>,
    retry_interval: Duration,
    spin_wait_duration: Duration,
    unmatched_check_count: u32,
    producer_probe: Option<OffsetWord>,
}

impl Consumer {
    pub(crate) fn open(
        paths: &StorePaths,
        layout: SegmentLayout,
        retry_interval: Duration,
        spin_wait_duration: Duration,
        unmatched_check_count: u32,
    ) -> Result<Self> {
        let offset = OffsetWord::open(&paths.consumer_offset)?;
        Ok(Self {
            log_dir: paths.log_dir.clone(),
            producer_offset_path: paths.producer_offset.clone(),
            layout,
            offset,
            segment: None,
            retry_interval,
            spin_wait_duration,
            unmatched_check_count,
            producer_probe: None,
        })
    }

    /// Next byte position to read.
    pub fn offset(&self) -> i64 {
        self.offset.read()
    }

    /// Blocks until the record at the current offset is visible and copies
    /// it into `payload`. The offset is not advanced; call [`commit`] after
    /// the record has been handled.
    ///
    /// [`commit`]: Consumer::commit
    pub fn consume(&mut self, payload: &mut [u8]) -> Result<()> {
        if payload.len() != self.layout.payload_size() {
            return Err(Error::Misuse("payload length does not match record layout"));
        }
        let mut stall = StallTracker::new(self.unmatched_check_count);
        let mut spin_budget_spent = false;
        loop {
            if self.segment.is_none() {
                let offset = self.offset.read();
                match Segment::try_find(&self.log_dir, self.layout, offset)? {
                    Some(segment) => self.segment = Some(segment),
                    None => {
                        std::thread::sleep(self.retry_interval);
                        if self.check_unmatched(&mut stall)? {
                            spin_budget_spent = false;
                        }
                        continue;
                    }
                }
            }
            let visible = if spin_budget_spent {
                self.try_read_current(payload)?
            } else {
                spin_budget_spent = true;
                self.spin_read(payload)?
            };
            if visible {
                return Ok(());
            }
            std::thread::sleep(self.retry_interval);
            if self.check_unmatched(&mut stall)? {
                // Repositioned past a gap: the next wait gets a fresh spin
                // budget against the new offset.
                spin_budget_spent = false;
            }
        }
    }

    /// Publishes consumption of the record returned by the last `consume`.
    /// Crossing the end of the segment disposes the mapping so the next
    /// `consume` opens the successor file.
    pub fn commit(&mut self) -> Result<()> {
        let Some(segment) = self.segment.as_ref() else {
            return Err(Error::Misuse("commit requires an open segment"));
        };
        let next = self.offset.advance(self.layout.stride());
        if next > segment.last_writable_offset() {
            self.segment = None;
        }
        Ok(())
    }

    /// Repositions the consumer offset. With `force` the open segment is
    /// disposed first; without it an open segment is an error. Backward
    /// moves are permitted (recovery only).
    pub fn adjust_offset(&mut self, new_offset: i64, force: bool) -> Result<()> {
        if new_offset < 0 {
            return Err(Error::Misuse("consumer offset cannot be negative"));
        }
        if self.segment.is_some() {
            if !force {
                return Err(Error::Misuse(
                    "cannot adjust consumer offset while a segment is open",
                ));
            }
            self.segment = None;
        }
        self.offset.move_to(new_offset, true)
    }

    /// Non-blocking probe: opens the head segment if possible and reports
    /// whether the record at the current offset has been published.
    pub fn next_message_available(&mut self) -> Result<bool> {
        let offset = self.offset.read();
        if self.segment.is_none() {
            match Segment::try_find(&self.log_dir, self.layout, offset)? {
                Some(segment) => self.segment = Some(segment),
                None => return Ok(false),
            }
        }
        match self.segment.as_ref() {
            Some(segment) => segment.peek(offset),
            None => Ok(false),
        }
    }

    fn try_read_current(&mut self, payload: &mut [u8]) -> Result<bool> {
        let offset = self.offset.read();
        match self.segment.as_ref() {
            Some(segment) => segment.try_read(offset, payload),
            None => Ok(false),
        }
    }

    fn spin_read(&mut self, payload: &mut [u8]) -> Result<bool> {
        let deadline = Instant::now() + self.spin_wait_duration;
        let mut spins: u32 = 0;
        loop {
            if self.try_read_current(payload)? {
                return Ok(true);
            }
            spins = spins.wrapping_add(1);
            if spins % 128 == 0 && Instant::now() >= deadline {
                return Ok(false);
            }
            std::hint::spin_loop();
        }
    }

    /// Stuck-offset detection, run once per sleep cycle. When the consumer
    /// offset has been stalled for `unmatched_check_count` cycles and the
    /// producer offset word keeps advancing above it, the consumer is
    /// positioned inside a gap that will never fill (a truncated or
    /// repositioned stream); it snaps forward to the last observed producer
    /// offset. Returns true when a reposition happened.
    fn check_unmatched(&mut self, stall: &mut StallTracker) -> Result<bool> {
        if self.unmatched_check_count == 0 {
            return Ok(false);
        }
        let own = self.offset.read();
        if !stall.note_sample(own) {
            return Ok(false);
        }
        // Probe failures are absorbed; the producer word may not exist yet.
        let Some(head) = self.probe_producer_offset() else {
            return Ok(false);
        };
        if let Some(target) = stall.observe_producer(head, own) {
            log::warn!(
                "consumer stalled at offset {own} while producer advanced to {target}; repositioning"
            );
            self.segment = None;
            self.offset.move_to(target, true)?;
            stall.reset();
            return Ok(true);
        }
        Ok(false)
    }

    fn probe_producer_offset(&mut self) -> Option<i64> {
        if self.producer_probe.is_none() {
            self.producer_probe = OffsetWord::open_read_only(&self.producer_offset_path).ok();
        }
        self.producer_probe.as_ref().map(|word| word.read())
    }
}

/// Counts consecutive sleep cycles with an unchanged consumer offset and,
/// past the configured threshold, watches the producer offset word for
/// forward motion.
struct StallTracker {
    threshold: u32,
    stalled_samples: u32,
    last_own_offset: Option<i64>,
    last_producer_offset: Option<i64>,
}

impl StallTracker {
    fn new(threshold: u32) -> Self {
        Self {
            threshold,
            stalled_samples: 0,
            last_own_offset: None,
            last_producer_offset: None,
        }
    }

    /// Records one sample of the consumer offset; true once it has been
    /// unchanged for `threshold` consecutive samples.
    fn note_sample(&mut self, own_offset: i64) -> bool {
        match self.last_own_offset {
            Some(prev) if prev == own_offset => {
                self.stalled_samples = self.stalled_samples.saturating_add(1);
            }
            _ => {
                self.last_own_offset = Some(own_offset);
                self.stalled_samples = 1;
                self.last_producer_offset = None;
            }
        }
        self.stalled_samples >= self.threshold
    }

    /// Feeds one sample of the producer offset word. Returns the reposition
    /// target when the producer advanced between samples while sitting above
    /// the stalled consumer offset.
    fn observe_producer(&mut self, head: i64, own_offset: i64) -> Option<i64> {
        let advanced = matches!(self.last_producer_offset, Some(prev) if head > prev);
        self.last_producer_offset = Some(head);
        if advanced && head > own_offset {
            Some(head)
        } else {
            None
        }
    }

    fn reset(&mut self) {
        self.stalled_samples = 0;
        self.last_own_offset = None;
        self.last_producer_offset = None;
    }
}

#[cfg(test)]
mod tests {
    use super::StallTracker;

    #[test]
    fn stall_tracker_requires_consecutive_unchanged_samples() {
        let mut stall = StallTracker::new(3);
        assert!(!stall.note_sample(64));
        assert!(!stall.note_sample(64));
        assert!(stall.note_sample(64));
        // A moving offset resets the streak.
        assert!(!stall.note_sample(72));
        assert!(!stall.note_sample(72));
    }

    #[test]
    fn reposition_needs_producer_motion_above_consumer() {
        let mut stall = StallTracker::new(1);
        stall.note_sample(64);
        assert_eq!(stall.observe_producer(80, 64), None);
        assert_eq!(stall.observe_producer(80, 64), None);
        assert_eq!(stall.observe_producer(96, 64), Some(96));
        // Producer behind the consumer never triggers a snap forward.
        let mut stall = StallTracker::new(1);
        stall.note_sample(128);
        assert_eq!(stall.observe_producer(32, 128), None);
        assert_eq!(stall.observe_producer(48, 128), None);
    }
}
