use std::path::PathBuf;

use crate::offset_word::OffsetWord;
use crate::queue::StorePaths;
use crate::segment::{Segment, SegmentLayout};
use crate::{Error, Result};

/// Appending half of the queue.
///
/// The producer owns the writable mapping of the tail segment and the
/// producer offset word. Alongside the in-memory offset it maintains a
/// *confirmed* offset word that is advanced only after a successful flush;
/// recovery rolls the producer back to it rather than trusting the offset
/// word, which may describe records that never reached stable storage.
pub struct Producer {
    log_dir: PathBuf,
    layout: SegmentLayout,
    offset: OffsetWord,
    confirmed: OffsetWord,
    segment: Option<Segment>,
    unflushed: u32,
    force_flush_interval: u32,
}

impl Producer {
    pub(crate) fn open(
        paths: &StorePaths,
        layout: SegmentLayout,
        force_flush_interval: u32,
    ) -> Result<Self> {
        let offset = OffsetWord::open(&paths.producer_offset)?;
        let confirmed = OffsetWord::open(&paths.producer_confirmed)?;
        Ok(Self {
            log_dir: paths.log_dir.clone(),
            layout,
            offset,
            confirmed,
            segment: None,
            unflushed: 0,
            force_flush_interval,
        })
    }

    /// Next byte position to write.
    pub fn offset(&self) -> i64 {
        self.offset.read()
    }

    /// Highest offset whose records have been flushed to stable storage.
    pub fn confirmed_offset(&self) -> i64 {
        self.confirmed.read()
    }

    /// Appends one record and publishes it to the peer mapping.
    ///
    /// The offset word is advanced only after the payload and marker are
    /// written, so a failed write never exposes a phantom record. Rolling
    /// past the end of the segment forces a flush and closes the mapping;
    /// so does every `force_flush_interval` records.
    pub fn produce(&mut self, payload: &[u8]) -> Result<()> {
        let offset = self.offset.read();
        let mut segment = match self.segment.take() {
            Some(segment) => segment,
            None => Segment::create_or_open(&self.log_dir, self.layout, offset)?,
        };
        segment.write(offset, payload)?;
        let next = self.offset.advance(self.layout.stride());
        self.unflushed += 1;

        if next > segment.last_writable_offset() {
            segment.flush_all()?;
            self.confirmed.move_to(next, false)?;
            self.unflushed = 0;
            return Ok(());
        }
        if self.unflushed >= self.force_flush_interval {
            let from = self.confirmed.read().max(segment.start());
            segment.flush_range(from, next - from)?;
            self.confirmed.move_to(next, false)?;
            self.unflushed = 0;
        }
        self.segment = Some(segment);
        Ok(())
    }

    /// Repositions the producer offset. Only legal while no segment is
    /// open; recovery is the sole caller and may move backwards.
    pub fn adjust_offset(&mut self, new_offset: i64) -> Result<()> {
        if self.segment.is_some() {
            return Err(Error::Misuse(
                "cannot adjust producer offset while a segment is open",
            ));
        }
        self.offset.move_to(new_offset, true)
    }
}
