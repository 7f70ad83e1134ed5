use std::path::Path;
use std::thread;
use std::time::Duration;

use conveyor::{Queue, QueueConfig};
use tempfile::tempdir;

fn config(root: &Path) -> QueueConfig {
    let mut config = QueueConfig::new(root.join("orders"), 64, 7);
    config.retention.enable_auto_cleanup = false;
    config
}

#[test]
fn produced_records_come_back_in_order() {
    let dir = tempdir().expect("tempdir");
    let queue = Queue::open(config(dir.path())).expect("queue open");
    let mut producer = queue.producer().expect("producer");
    let mut consumer = queue.consumer().expect("consumer");

    let records: [[u8; 7]; 3] = [
        [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07],
        [0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17],
        [0x21, 0x22, 0x23, 0x24, 0x25, 0x26, 0x27],
    ];
    for record in &records {
        producer.produce(record).expect("produce");
    }
    assert_eq!(producer.offset(), 24);

    let mut out = [0u8; 7];
    for record in &records {
        consumer.consume(&mut out).expect("consume");
        assert_eq!(&out, record);
        consumer.commit().expect("commit");
    }
    assert_eq!(consumer.offset(), 24);
}

#[test]
fn consumer_blocks_until_a_record_is_published() {
    let dir = tempdir().expect("tempdir");
    let mut config = config(dir.path());
    config.consumer_retry_interval = Duration::from_millis(5);
    config.consumer_spin_wait_duration = Duration::from_millis(1);

    let queue = Queue::open(config).expect("queue open");
    let mut producer = queue.producer().expect("producer");
    let mut consumer = queue.consumer().expect("consumer");

    // The segment file does not exist yet either; the consumer has to wait
    // through both the missing-segment and the missing-marker phases.
    let feeder = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        producer.produce(&[0x42; 7]).expect("produce");
    });

    let mut out = [0u8; 7];
    consumer.consume(&mut out).expect("consume");
    assert_eq!(out, [0x42; 7]);
    consumer.commit().expect("commit");
    assert_eq!(consumer.offset(), 8);

    feeder.join().expect("feeder thread");
}

#[test]
fn record_buffer_must_match_payload_size() {
    let dir = tempdir().expect("tempdir");
    let queue = Queue::open(config(dir.path())).expect("queue open");
    let mut producer = queue.producer().expect("producer");
    let mut consumer = queue.consumer().expect("consumer");

    assert!(producer.produce(&[0u8; 6]).is_err());
    assert!(producer.produce(&[0u8; 8]).is_err());
    let mut short = [0u8; 6];
    assert!(consumer.consume(&mut short).is_err());
}
