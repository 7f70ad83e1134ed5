//! Durable memory-mapped single-producer/single-consumer FIFO queue.
//!
//! Fixed-size records are appended to segment files named by their start
//! offset in the logical byte stream. A record becomes visible to the
//! consumer once its trailing end marker is published through the shared
//! mapping; producer and consumer coordinate exclusively through two
//! memory-mapped offset words, so the hot path is lock-free and performs no
//! file I/O. Durability is periodic: the producer tracks a separate
//! *confirmed* offset advanced only after a flush, and crash recovery rolls
//! the stream back to it on reopen.

pub mod consumer;
pub mod error;
mod lock;
pub mod mmap;
pub mod offset_word;
pub mod producer;
pub mod queue;
pub mod retention;
pub mod segment;

pub use consumer::Consumer;
pub use error::{Error, Result};
pub use offset_word::OffsetWord;
pub use producer::Producer;
pub use queue::{ExceptionObserver, Queue, QueueConfig, QueueNotice};
pub use retention::RetentionConfig;
