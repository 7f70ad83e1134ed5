use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::mmap::MmapFile;
use crate::{Error, Result};

pub const OFFSET_WORD_LEN: usize = 8;

/// A memory-mapped 8-byte cursor into the logical byte stream.
///
/// The word is shared between processes through the page cache: a peer that
/// maps the same file observes stores without any file I/O. Release stores
/// pair with acquire loads so a reader that sees a new offset also sees the
/// record bytes that produced it.
pub struct OffsetWord {
    map: MmapFile,
}

impl OffsetWord {
    /// Opens the word read-write, creating a zeroed file when absent.
    pub fn open(path: &Path) -> Result<Self> {
        let map = match MmapFile::open(path) {
            Ok(map) => map,
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                match MmapFile::create_new(path, OFFSET_WORD_LEN) {
                    Ok(map) => map,
                    Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                        MmapFile::open(path)?
                    }
                    Err(err) => return Err(err),
                }
            }
            Err(err) => return Err(err),
        };
        Self::from_map(map)
    }

    /// Opens an existing word read-only (peer observation only).
    pub fn open_read_only(path: &Path) -> Result<Self> {
        Self::from_map(MmapFile::open_read_only(path)?)
    }

    fn from_map(map: MmapFile) -> Result<Self> {
        if map.len() != OFFSET_WORD_LEN {
            return Err(Error::Corrupt("offset word file has unexpected length"));
        }
        Ok(Self { map })
    }

    fn cell(&self) -> &AtomicI64 {
        // Length and alignment were checked at open; the mapping itself is
        // page-aligned.
        self.map
            .atomic_i64(0)
            .expect("offset word mapping is 8 bytes")
    }

    pub fn read(&self) -> i64 {
        self.cell().load(Ordering::Acquire)
    }

    /// Adds `delta` and returns the new value.
    pub fn advance(&self, delta: i64) -> i64 {
        self.cell().fetch_add(delta, Ordering::Release) + delta
    }

    /// Sets an absolute value. Backward moves are rejected unless
    /// `allow_backwards` is set; recovery is the only legitimate caller of
    /// a backward move.
    pub fn move_to(&self, value: i64, allow_backwards: bool) -> Result<()> {
        if value < 0 {
            return Err(Error::Misuse("offset word cannot hold a negative value"));
        }
        if !allow_backwards && value < self.read() {
            return Err(Error::Misuse("offset word cannot move backwards"));
        }
        self.cell().store(value, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fresh_word_reads_zero_and_persists() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("producer.offset");

        let word = OffsetWord::open(&path).expect("open");
        assert_eq!(word.read(), 0);
        assert_eq!(word.advance(8), 8);
        assert_eq!(word.advance(8), 16);
        drop(word);

        let word = OffsetWord::open(&path).expect("reopen");
        assert_eq!(word.read(), 16);
    }

    #[test]
    fn move_to_guards_direction_and_sign() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("consumer.offset");

        let word = OffsetWord::open(&path).expect("open");
        word.move_to(64, false).expect("forward move");
        assert!(matches!(
            word.move_to(32, false),
            Err(Error::Misuse(_))
        ));
        word.move_to(32, true).expect("backward move with flag");
        assert_eq!(word.read(), 32);
        assert!(matches!(word.move_to(-1, true), Err(Error::Misuse(_))));
    }

    #[test]
    fn read_only_word_tracks_writer() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("producer.offset");

        let writer = OffsetWord::open(&path).expect("open");
        let observer = OffsetWord::open_read_only(&path).expect("open ro");
        writer.advance(24);
        assert_eq!(observer.read(), 24);
    }

    #[test]
    fn wrong_length_file_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bad.offset");
        std::fs::write(&path, [0u8; 4]).expect("write short file");
        assert!(matches!(OffsetWord::open(&path), Err(Error::Corrupt(_))));
    }
}
