use tempfile::tempdir;

use ringq::{Queue, QueueConfig};

#[test]
fn multi_segment_rollover() {
    let dir = tempdir().unwrap();
    let config = QueueConfig {
        segment_size: 100,
        create_flags: ringq::DELETE_IF_EXISTS | ringq::PAV_DELETE_IF_EXISTS,
    };
    let queue = Queue::create(dir.path(), "rollover", config).unwrap();
    let payload = b"abcdefghijklmnopqrstuvwxyz";

    for _ in 0..32 {
        queue.write(payload).unwrap();
    }
    queue.sync().unwrap();

    for _ in 0..32 {
        let popped = queue.pop_cursor().unwrap().expect("block available");
        assert_eq!(popped.payload().unwrap(), &payload[..]);
        queue.free_cursor(popped);
    }
    assert!(queue.pop_cursor().unwrap().is_none());
}

#[test]
fn write_exactly_filling_a_segment_then_one_more_rolls_over() {
    let dir = tempdir().unwrap();
    // capacity - 8 (header) - 4 (length prefix) bytes of payload exactly fills the segment.
    let segment_size = 64usize;
    let max_payload = segment_size - 8 - 4;
    let config = QueueConfig {
        segment_size,
        create_flags: ringq::DELETE_IF_EXISTS | ringq::PAV_DELETE_IF_EXISTS,
    };
    let queue = Queue::create(dir.path(), "boundary", config).unwrap();

    queue.write(&vec![0xAB; max_payload]).unwrap();
    // The segment is now exactly full; the next write must roll to a new segment
    // rather than fail outright.
    queue.write(&[1, 2, 3]).unwrap();
    queue.sync().unwrap();

    let first = queue.pop_cursor().unwrap().unwrap();
    assert_eq!(first.len() as usize, max_payload);
    queue.free_cursor(first);
    let second = queue.pop_cursor().unwrap().unwrap();
    assert_eq!(second.payload().unwrap(), &[1, 2, 3]);
    queue.free_cursor(second);
}
