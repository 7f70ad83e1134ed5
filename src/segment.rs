use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};

use crate::mmap::MmapFile;
use crate::{Error, Result};

/// Sentinel stored after the payload once it is fully written. Segment files
/// are zero-filled at creation, so a zero marker always means "no record".
pub const END_MARKER: u8 = 1;

/// Number of decimal digits in a segment file name.
pub const SEGMENT_NAME_LEN: usize = 20;

/// Record and segment geometry, derived once from the queue configuration.
///
/// A record occupies `stride = payload_size + 1` bytes (payload plus end
/// marker). The configured segment size is adjusted down to an integral
/// number of records so no record ever straddles two files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    payload_size: usize,
    segment_size: i64,
}

impl SegmentLayout {
    pub fn new(configured_segment_size: i64, payload_size: usize) -> Result<Self> {
        if payload_size == 0 {
            return Err(Error::Config("payload size must be positive"));
        }
        if i64::try_from(payload_size).is_err() {
            return Err(Error::Config("payload size exceeds addressable range"));
        }
        if configured_segment_size <= 0 {
            return Err(Error::Config("segment size must be positive"));
        }
        let stride = payload_size as i64 + 1;
        let segment_size = (configured_segment_size / stride) * stride;
        if segment_size < stride {
            return Err(Error::Config("segment size holds less than one record"));
        }
        Ok(Self {
            payload_size,
            segment_size,
        })
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Record stride S: payload plus the end marker byte.
    pub fn stride(&self) -> i64 {
        self.payload_size as i64 + 1
    }

    /// Adjusted segment capacity A in bytes.
    pub fn segment_size(&self) -> i64 {
        self.segment_size
    }

    /// Start offset of the segment whose range contains `offset`.
    pub fn start_for(&self, offset: i64) -> i64 {
        (offset / self.segment_size) * self.segment_size
    }
}

pub fn segment_file_name(start: i64) -> String {
    format!("{start:020}")
}

pub fn segment_path(dir: &Path, start: i64) -> PathBuf {
    dir.join(segment_file_name(start))
}

/// A memory-mapped view of one segment file.
///
/// The producer holds the only writable mapping; consumer and retention map
/// the same file read-only. Write/read coordination relies solely on the
/// release-store of the end marker and the acquire-load on read.
pub struct Segment {
    map: MmapFile,
    layout: SegmentLayout,
    start: i64,
}

impl Segment {
    /// Opens the segment covering `target_offset` for writing, creating the
    /// containing directory and a zero-filled file of length A when missing.
    pub fn create_or_open(dir: &Path, layout: SegmentLayout, target_offset: i64) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let start = layout.start_for(target_offset);
        let path = segment_path(dir, start);
        let map = match MmapFile::open(&path) {
            Ok(map) => map,
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                match MmapFile::create_new(&path, layout.segment_size() as usize) {
                    Ok(map) => map,
                    Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                        MmapFile::open(&path)?
                    }
                    Err(err) => return Err(err),
                }
            }
            Err(err) => return Err(err),
        };
        Self::from_map(map, layout, start)
    }

    /// Read-only counterpart: succeeds only when the file already exists.
    pub fn try_find(dir: &Path, layout: SegmentLayout, target_offset: i64) -> Result<Option<Self>> {
        let start = layout.start_for(target_offset);
        let path = segment_path(dir, start);
        let map = match MmapFile::open_read_only(&path) {
            Ok(map) => map,
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        Ok(Some(Self::from_map(map, layout, start)?))
    }

    fn from_map(map: MmapFile, layout: SegmentLayout, start: i64) -> Result<Self> {
        if map.len() as i64 != layout.segment_size() {
            return Err(Error::Corrupt("segment file length does not match layout"));
        }
        Ok(Self { map, layout, start })
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    /// Last offset at which a record may begin inside this segment.
    pub fn last_writable_offset(&self) -> i64 {
        self.start + self.layout.segment_size() - self.layout.stride()
    }

    fn record_index(&self, offset: i64) -> Result<usize> {
        if offset < self.start || offset > self.last_writable_offset() {
            return Err(Error::Misuse("offset outside segment range"));
        }
        let relative = offset - self.start;
        if relative % self.layout.stride() != 0 {
            return Err(Error::Misuse("offset not aligned to a record boundary"));
        }
        Ok(relative as usize)
    }

    fn marker(&self, record_index: usize) -> Result<&AtomicU8> {
        self.map.atomic_u8(record_index + self.layout.payload_size())
    }

    /// Writes the payload at `offset`, then publishes it with a release
    /// store of the end marker so the payload bytes are globally visible
    /// before the marker.
    pub fn write(&mut self, offset: i64, payload: &[u8]) -> Result<()> {
        if payload.len() != self.layout.payload_size() {
            return Err(Error::Misuse("payload length does not match record layout"));
        }
        if !self.map.is_writable() {
            return Err(Error::Misuse("segment is mapped read-only"));
        }
        let index = self.record_index(offset)?;
        self.map
            .range_mut(index, payload.len())?
            .copy_from_slice(payload);
        self.marker(index)?.store(END_MARKER, Ordering::Release);
        Ok(())
    }

    /// Copies the record at `offset` into `payload` when its end marker is
    /// visible. Returns false when the record has not been published yet.
    pub fn try_read(&self, offset: i64, payload: &mut [u8]) -> Result<bool> {
        if payload.len() != self.layout.payload_size() {
            return Err(Error::Misuse("payload length does not match record layout"));
        }
        let index = self.record_index(offset)?;
        if self.marker(index)?.load(Ordering::Acquire) != END_MARKER {
            return Ok(false);
        }
        payload.copy_from_slice(&self.map.as_slice()[index..index + payload.len()]);
        Ok(true)
    }

    /// Marker probe without copying the payload.
    pub fn peek(&self, offset: i64) -> Result<bool> {
        let index = self.record_index(offset)?;
        Ok(self.marker(index)?.load(Ordering::Acquire) == END_MARKER)
    }

    /// Asks the kernel to persist the dirty pages covering the given logical
    /// range. Best-effort durability point.
    pub fn flush_range(&self, offset: i64, len: i64) -> Result<()> {
        if offset < self.start || len < 0 || offset + len > self.start + self.layout.segment_size()
        {
            return Err(Error::Misuse("flush range outside segment"));
        }
        self.map
            .flush_range((offset - self.start) as usize, len as usize)
    }

    pub fn flush_all(&self) -> Result<()> {
        self.map.flush_sync()
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.map.is_writable() {
            let _ = self.map.flush_async();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn layout_rounds_segment_size_down_to_record_multiple() {
        let layout = SegmentLayout::new(64, 7).expect("layout");
        assert_eq!(layout.stride(), 8);
        assert_eq!(layout.segment_size(), 64);

        let layout = SegmentLayout::new(100, 7).expect("layout");
        assert_eq!(layout.segment_size(), 96);

        assert!(matches!(
            SegmentLayout::new(4, 7),
            Err(Error::Config(_))
        ));
        assert!(matches!(SegmentLayout::new(0, 7), Err(Error::Config(_))));
        assert!(matches!(SegmentLayout::new(64, 0), Err(Error::Config(_))));
    }

    #[test]
    fn segment_names_are_zero_padded_starts() {
        assert_eq!(segment_file_name(0), "00000000000000000000");
        assert_eq!(segment_file_name(64), "00000000000000000064");
        assert_eq!(segment_file_name(0).len(), SEGMENT_NAME_LEN);

        let layout = SegmentLayout::new(64, 7).expect("layout");
        assert_eq!(layout.start_for(0), 0);
        assert_eq!(layout.start_for(63), 0);
        assert_eq!(layout.start_for(64), 64);
        assert_eq!(layout.start_for(200), 192);
    }

    #[test]
    fn record_is_invisible_until_marker_is_stored() {
        let dir = tempdir().expect("tempdir");
        let layout = SegmentLayout::new(64, 7).expect("layout");
        let mut segment = Segment::create_or_open(dir.path(), layout, 0).expect("create");

        let mut out = [0u8; 7];
        assert!(!segment.try_read(0, &mut out).expect("read empty"));

        segment.write(0, &[1, 2, 3, 4, 5, 6, 7]).expect("write");
        assert!(segment.try_read(0, &mut out).expect("read"));
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7]);
        assert!(!segment.try_read(8, &mut out).expect("next slot empty"));
    }

    #[test]
    fn read_only_mapping_observes_writer() {
        let dir = tempdir().expect("tempdir");
        let layout = SegmentLayout::new(64, 7).expect("layout");
        let mut writable = Segment::create_or_open(dir.path(), layout, 0).expect("create");
        let readable = Segment::try_find(dir.path(), layout, 0)
            .expect("find")
            .expect("segment exists");

        let mut out = [0u8; 7];
        assert!(!readable.try_read(0, &mut out).expect("empty"));
        writable.write(0, &[9; 7]).expect("write");
        assert!(readable.try_read(0, &mut out).expect("published"));
        assert_eq!(out, [9; 7]);
    }

    #[test]
    fn try_find_returns_none_for_missing_file() {
        let dir = tempdir().expect("tempdir");
        let layout = SegmentLayout::new(64, 7).expect("layout");
        assert!(Segment::try_find(dir.path(), layout, 128)
            .expect("find")
            .is_none());
    }

    #[test]
    fn misaligned_and_out_of_range_offsets_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let layout = SegmentLayout::new(64, 7).expect("layout");
        let mut segment = Segment::create_or_open(dir.path(), layout, 0).expect("create");

        assert!(matches!(
            segment.write(3, &[0; 7]),
            Err(Error::Misuse(_))
        ));
        assert!(matches!(
            segment.write(64, &[0; 7]),
            Err(Error::Misuse(_))
        ));
        let mut out = [0u8; 7];
        assert!(matches!(
            segment.try_read(-8, &mut out),
            Err(Error::Misuse(_))
        ));
    }

    #[test]
    fn wrong_length_file_is_corrupt() {
        let dir = tempdir().expect("tempdir");
        let layout = SegmentLayout::new(64, 7).expect("layout");
        std::fs::write(segment_path(dir.path(), 0), [0u8; 32]).expect("truncated file");
        assert!(matches!(
            Segment::create_or_open(dir.path(), layout, 0),
            Err(Error::Corrupt(_))
        ));
        assert!(matches!(
            Segment::try_find(dir.path(), layout, 0),
            Err(Error::Corrupt(_))
        ));
    }
}
