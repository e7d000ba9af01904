use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tempfile::tempdir;

use ringq::{Queue, QueueConfig};

/// spec.md §8 scenario 5: producers and consumers run at the same time, each
/// consumer repeatedly calling `sync` (to make freshly-written segments
/// visible) between retries of `pop_cursor`, until it has accumulated its
/// share of the total. Verifies: total reads == total writes, and no block
/// is handed to more than one consumer.
#[test]
fn simultaneous_produce_and_consume() {
    let dir = tempdir().unwrap();
    // A 300-byte block frames to 8 (header) + 4 (len) + 300 = 312 bytes;
    // the segment must be at least that large to hold even one block.
    let config = QueueConfig {
        segment_size: 1024,
        create_flags: ringq::DELETE_IF_EXISTS | ringq::PAV_DELETE_IF_EXISTS,
    };
    let queue = Arc::new(Queue::create(dir.path(), "simul", config).unwrap());
    let block = [b'B'; 300];

    const PRODUCERS: usize = 4;
    const CONSUMERS: usize = 4;
    const PER_PRODUCER: usize = 128;
    const TOTAL: usize = PRODUCERS * PER_PRODUCER;

    let mut producers = Vec::new();
    for _ in 0..PRODUCERS {
        let queue = Arc::clone(&queue);
        producers.push(thread::spawn(move || {
            for _ in 0..PER_PRODUCER {
                queue.write(&block).unwrap();
            }
        }));
    }

    let total_read = Arc::new(AtomicUsize::new(0));
    let seen_counts: Arc<Mutex<HashMap<Vec<u8>, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let mut consumers = Vec::new();
    for _ in 0..CONSUMERS {
        let queue = Arc::clone(&queue);
        let total_read = Arc::clone(&total_read);
        let seen_counts = Arc::clone(&seen_counts);
        consumers.push(thread::spawn(move || {
            let mut got = 0usize;
            while got < PER_PRODUCER {
                queue.sync().unwrap();
                match queue.pop_cursor().unwrap() {
                    Some(popped) => {
                        let payload = popped.payload().unwrap().to_vec();
                        queue.free_cursor(popped);
                        *seen_counts.lock().unwrap().entry(payload).or_insert(0) += 1;
                        total_read.fetch_add(1, Ordering::SeqCst);
                        got += 1;
                    }
                    None => thread::sleep(Duration::from_micros(100)),
                }
            }
        }));
    }

    for p in producers {
        p.join().unwrap();
    }
    queue.sync().unwrap();
    for c in consumers {
        c.join().unwrap();
    }

    assert_eq!(total_read.load(Ordering::SeqCst), TOTAL);
    let seen_counts = seen_counts.lock().unwrap();
    assert_eq!(seen_counts.len(), 1);
    assert_eq!(*seen_counts.get(&block.to_vec()).unwrap(), TOTAL);
}
