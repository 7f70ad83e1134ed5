use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::consumer::Consumer;
use crate::lock::StoreLock;
use crate::producer::Producer;
use crate::retention::{self, RetentionConfig, RetentionWorker};
use crate::segment::SegmentLayout;
use crate::{Error, Result};

const LOG_DIR: &str = "commitlog";
const OFFSET_DIR: &str = "offset";
const PRODUCER_OFFSET_FILE: &str = "producer.offset";
const CONSUMER_OFFSET_FILE: &str = "consumer.offset";
const PRODUCER_CONFIRMED_FILE: &str = "producer.confirmed";
const LOCK_FILE: &str = "recovery.lock";

/// Non-fatal notifications surfaced during recovery and retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueNotice {
    /// The record at the consumer offset was unreadable after rollback; the
    /// consumer was advanced to the producer offset, discarding the gap.
    CorruptedHead {
        consumer_offset: i64,
        producer_offset: i64,
    },
}

pub type ExceptionObserver = Arc<dyn Fn(&QueueNotice) + Send + Sync>;

/// Queue configuration. `store_path`, `segment_size` and `payload_size` are
/// required; everything else has working defaults.
#[derive(Clone)]
pub struct QueueConfig {
    /// Directory root for all queue state.
    pub store_path: PathBuf,
    /// Nominal bytes per segment file, adjusted down to a multiple of the
    /// record stride.
    pub segment_size: i64,
    /// Fixed payload size P of every record.
    pub payload_size: usize,
    /// Consumer sleep between retries while waiting for data or a segment.
    pub consumer_retry_interval: Duration,
    /// Cumulative busy-spin budget per wait before falling back to sleep.
    pub consumer_spin_wait_duration: Duration,
    /// Records between forced producer flushes.
    pub producer_force_flush_interval_count: u32,
    /// Stalled sleep cycles before the consumer starts watching the
    /// producer offset word for gap detection; zero disables the path.
    pub unmatched_check_count: u32,
    /// Callback for non-fatal recovery notifications.
    pub exception_observer: Option<ExceptionObserver>,
    pub retention: RetentionConfig,
}

impl QueueConfig {
    pub fn new(store_path: impl Into<PathBuf>, segment_size: i64, payload_size: usize) -> Self {
        Self {
            store_path: store_path.into(),
            segment_size,
            payload_size,
            consumer_retry_interval: Duration::from_secs(1),
            consumer_spin_wait_duration: Duration::from_millis(100),
            producer_force_flush_interval_count: 1000,
            unmatched_check_count: 0,
            exception_observer: None,
            retention: RetentionConfig::default(),
        }
    }
}

/// Resolved file locations under the store root.
pub(crate) struct StorePaths {
    pub log_dir: PathBuf,
    pub offset_dir: PathBuf,
    pub producer_offset: PathBuf,
    pub consumer_offset: PathBuf,
    pub producer_confirmed: PathBuf,
    pub lock_file: PathBuf,
}

impl StorePaths {
    fn new(root: &Path) -> Self {
        let offset_dir = root.join(OFFSET_DIR);
        Self {
            log_dir: root.join(LOG_DIR),
            producer_offset: offset_dir.join(PRODUCER_OFFSET_FILE),
            consumer_offset: offset_dir.join(CONSUMER_OFFSET_FILE),
            producer_confirmed: offset_dir.join(PRODUCER_CONFIRMED_FILE),
            lock_file: root.join(LOCK_FILE),
            offset_dir,
        }
    }
}

/// Top-level handle over a store directory.
///
/// Opening the queue validates the configuration, repairs a crashed store
/// under a cross-process lock, and starts the retention worker. The
/// singleton [`Producer`] and [`Consumer`] are handed out lazily and own
/// their state independently of the queue handle.
pub struct Queue {
    paths: StorePaths,
    layout: SegmentLayout,
    config: QueueConfig,
    producer_taken: AtomicBool,
    consumer_taken: AtomicBool,
    _retention: Option<RetentionWorker>,
}

impl Queue {
    pub fn open(config: QueueConfig) -> Result<Self> {
        if config.store_path.as_os_str().is_empty() {
            return Err(Error::Config("store path must not be empty"));
        }
        let layout = SegmentLayout::new(config.segment_size, config.payload_size)?;
        if config.store_path.is_file() {
            return Err(Error::Config("store path names an existing regular file"));
        }
        let pre_existing = config.store_path.is_dir();
        let paths = StorePaths::new(&config.store_path);
        std::fs::create_dir_all(&paths.log_dir)?;
        std::fs::create_dir_all(&paths.offset_dir)?;

        if pre_existing {
            Self::recover(&paths, layout, &config)?;
        }

        let retention = if config.retention.enable_auto_cleanup {
            Some(RetentionWorker::spawn(
                paths.log_dir.clone(),
                paths.consumer_offset.clone(),
                layout,
                config.retention,
            )?)
        } else {
            None
        };

        Ok(Self {
            paths,
            layout,
            config,
            producer_taken: AtomicBool::new(false),
            consumer_taken: AtomicBool::new(false),
            _retention: retention,
        })
    }

    /// Hands out the singleton producer. Fails on a second call.
    pub fn producer(&self) -> Result<Producer> {
        if self.producer_taken.swap(true, Ordering::AcqRel) {
            return Err(Error::Misuse("producer has already been taken"));
        }
        Producer::open(
            &self.paths,
            self.layout,
            self.config.producer_force_flush_interval_count,
        )
    }

    /// Hands out the singleton consumer. Fails on a second call.
    pub fn consumer(&self) -> Result<Consumer> {
        if self.consumer_taken.swap(true, Ordering::AcqRel) {
            return Err(Error::Misuse("consumer has already been taken"));
        }
        Consumer::open(
            &self.paths,
            self.layout,
            self.config.consumer_retry_interval,
            self.config.consumer_spin_wait_duration,
            self.config.unmatched_check_count,
        )
    }

    /// Runs one manual retention pass; see [`retention::run_pass`].
    pub fn cleanup(&self) -> Result<Vec<i64>> {
        retention::run_pass(
            &self.paths.log_dir,
            &self.paths.consumer_offset,
            self.layout,
            &self.config.retention,
        )
    }

    /// Crash-recovery pass, run when the store directory pre-existed.
    ///
    /// The producer offset word reflects in-memory progress at the time of
    /// the crash; records between the confirmed offset and it may be torn.
    /// The pass rolls the producer back to the highest trustworthy point
    /// (whatever the consumer already passed, or the last flushed offset)
    /// and, when the record at the consumer offset still has no marker,
    /// declares it corrupt: the observer is notified and the consumer is
    /// forced up to the producer offset.
    fn recover(paths: &StorePaths, layout: SegmentLayout, config: &QueueConfig) -> Result<()> {
        let _lock = StoreLock::acquire(&paths.lock_file)?;
        let mut producer =
            Producer::open(paths, layout, config.producer_force_flush_interval_count)?;
        let mut consumer = Consumer::open(
            paths,
            layout,
            config.consumer_retry_interval,
            config.consumer_spin_wait_duration,
            config.unmatched_check_count,
        )?;

        let producer_offset = producer.offset();
        let consumer_offset = consumer.offset();
        if producer_offset <= consumer_offset {
            return Ok(());
        }

        let rollback = consumer_offset.max(producer.confirmed_offset());
        if producer_offset > rollback {
            log::info!(
                "recovery: rolling producer offset back from {producer_offset} to {rollback}"
            );
            producer.adjust_offset(rollback)?;
        }

        let producer_offset = producer.offset();
        if producer_offset > consumer_offset && !consumer.next_message_available()? {
            log::warn!(
                "recovery: record at consumer offset {consumer_offset} is unreadable; \
                 forcing consumer to {producer_offset}"
            );
            if let Some(observer) = &config.exception_observer {
                observer(&QueueNotice::CorruptedHead {
                    consumer_offset,
                    producer_offset,
                });
            }
            consumer.adjust_offset(producer_offset, true)?;
        }
        Ok(())
    }
}
