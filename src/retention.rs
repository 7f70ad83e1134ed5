use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::offset_word::OffsetWord;
use crate::segment::{segment_path, SegmentLayout, SEGMENT_NAME_LEN};
use crate::{Error, Result};

const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for segment retention and cleanup.
#[derive(Debug, Clone, Copy)]
pub struct RetentionConfig {
    /// Whether the queue spawns the background cleanup worker.
    pub enable_auto_cleanup: bool,
    /// Sleep between cleanup passes.
    pub cleanup_interval: Duration,
    /// Number of newest segment files retained unconditionally. Guards
    /// against the consumer offset being stale relative to very recent
    /// segments; it does not replace the fully-consumed check.
    pub min_retention_segments: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enable_auto_cleanup: true,
            cleanup_interval: Duration::from_secs(300),
            min_retention_segments: 2,
        }
    }
}

/// One cleanup pass: deletes segment files whose entire offset range lies
/// below the consumer offset, always keeping the newest
/// `min_retention_segments` files. Returns the start offsets of the deleted
/// segments.
///
/// The consumer offset is observed through a fresh read-only mapping; when
/// the word does not exist yet or still reads zero the pass is skipped.
pub fn run_pass(
    log_dir: &Path,
    consumer_offset_path: &Path,
    layout: SegmentLayout,
    config: &RetentionConfig,
) -> Result<Vec<i64>> {
    let consumer_offset = match OffsetWord::open_read_only(consumer_offset_path) {
        Ok(word) => word.read(),
        Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    if consumer_offset == 0 {
        return Ok(Vec::new());
    }

    let starts = list_segment_starts(log_dir)?;
    let deletable = starts
        .len()
        .saturating_sub(config.min_retention_segments);
    let mut deleted = Vec::new();
    for &start in &starts[..deletable] {
        let end = start + layout.segment_size() - 1;
        if end < consumer_offset {
            fs::remove_file(segment_path(log_dir, start))?;
            deleted.push(start);
        }
    }
    Ok(deleted)
}

/// Start offsets of all segment files in the directory, ascending. Only
/// names that are exactly twenty decimal digits are considered.
fn list_segment_starts(log_dir: &Path) -> Result<Vec<i64>> {
    let mut starts = Vec::new();
    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(name) => name,
            None => continue,
        };
        if let Some(start) = parse_segment_start(name) {
            starts.push(start);
        }
    }
    starts.sort_unstable();
    Ok(starts)
}

fn parse_segment_start(name: &str) -> Option<i64> {
    if name.len() != SEGMENT_NAME_LEN || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse::<i64>().ok()
}

struct Shared {
    shutdown: Mutex<bool>,
    wake: Condvar,
}

/// Long-lived background task running a cleanup pass every
/// `cleanup_interval`. Shutdown is cooperative: the interval sleep is a
/// condvar wait, so `stop` interrupts it and then waits a bounded time for
/// the thread to finish.
pub(crate) struct RetentionWorker {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl RetentionWorker {
    pub fn spawn(
        log_dir: PathBuf,
        consumer_offset_path: PathBuf,
        layout: SegmentLayout,
        config: RetentionConfig,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            shutdown: Mutex::new(false),
            wake: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("conveyor-retention".into())
            .spawn(move || {
                run_worker(&log_dir, &consumer_offset_path, layout, &config, &worker_shared);
            })?;
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        {
            let mut shutdown = self
                .shared
                .shutdown
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *shutdown = true;
        }
        self.shared.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let deadline = Instant::now() + SHUTDOWN_JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for RetentionWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(
    log_dir: &Path,
    consumer_offset_path: &Path,
    layout: SegmentLayout,
    config: &RetentionConfig,
    shared: &Shared,
) {
    loop {
        let stopped = {
            let shutdown = shared
                .shutdown
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let (shutdown, _timeout) = shared
                .wake
                .wait_timeout_while(shutdown, config.cleanup_interval, |stop| !*stop)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *shutdown
        };
        if stopped {
            break;
        }
        // Pass failures are transient by contract; the next pass retries.
        match run_pass(log_dir, consumer_offset_path, layout, config) {
            Ok(deleted) if !deleted.is_empty() => {
                log::debug!("retention pass deleted {} segment file(s)", deleted.len());
            }
            Ok(_) => {}
            Err(err) => {
                log::warn!("retention pass failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_exact_twenty_digit_names_parse() {
        assert_eq!(parse_segment_start("00000000000000000000"), Some(0));
        assert_eq!(parse_segment_start("00000000000000000064"), Some(64));
        assert_eq!(parse_segment_start("0000000000000000064"), None);
        assert_eq!(parse_segment_start("000000000000000000640"), None);
        assert_eq!(parse_segment_start("0000000000000000006a"), None);
        assert_eq!(parse_segment_start("recovery.lock"), None);
    }
}
