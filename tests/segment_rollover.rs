use std::path::Path;

use conveyor::{Queue, QueueConfig};
use tempfile::tempdir;

fn config(root: &Path) -> QueueConfig {
    let mut config = QueueConfig::new(root.join("orders"), 64, 7);
    config.retention.enable_auto_cleanup = false;
    config
}

#[test]
fn ninth_record_rolls_into_a_second_segment() {
    let dir = tempdir().expect("tempdir");
    let store = dir.path().join("orders");
    let queue = Queue::open(config(dir.path())).expect("queue open");
    let mut producer = queue.producer().expect("producer");

    for seq in 0u8..9 {
        producer.produce(&[seq; 7]).expect("produce");
    }

    // Eight 8-byte records fill the first 64-byte segment; the ninth landed
    // in the next file. Rolling over forced a flush at the boundary.
    assert_eq!(producer.offset(), 72);
    assert_eq!(producer.confirmed_offset(), 64);

    let segment0 = store.join("commitlog").join("00000000000000000000");
    let segment1 = store.join("commitlog").join("00000000000000000064");
    assert!(segment0.exists());
    assert!(segment1.exists());
    assert_eq!(std::fs::metadata(&segment0).expect("metadata").len(), 64);
    assert_eq!(std::fs::metadata(&segment1).expect("metadata").len(), 64);

    let mut consumer = queue.consumer().expect("consumer");
    let mut out = [0u8; 7];
    for seq in 0u8..9 {
        consumer.consume(&mut out).expect("consume");
        assert_eq!(out, [seq; 7]);
        consumer.commit().expect("commit");
    }
    assert_eq!(consumer.offset(), 72);
}
