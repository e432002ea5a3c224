use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use smuscope::ring::SpscRing;

/// A producer pacing 1 kHz against a consumer that stalls for 200 ms must
/// not lose a single value: the ring absorbs the backlog and the producer
/// spin-waits when it fills.
#[test]
fn producer_never_drops_under_consumer_stall() {
    const TOTAL: u64 = 1_000;

    // Deliberately smaller than the stall backlog so the full-ring spin
    // path is exercised.
    let ring = Arc::new(SpscRing::new(64));
    let producer_ring = Arc::clone(&ring);

    let producer = thread::spawn(move || {
        let start = Instant::now();
        for i in 0..TOTAL {
            // 1 kHz pacing.
            let deadline = start + Duration::from_millis(i);
            while Instant::now() < deadline {
                std::hint::spin_loop();
            }

            let mut value = i;
            loop {
                match producer_ring.push(value) {
                    Ok(()) => break,
                    Err(back) => {
                        value = back;
                        std::hint::spin_loop();
                    }
                }
            }
        }
    });

    // Consumer sleeps through the first 200 ms of production.
    thread::sleep(Duration::from_millis(200));

    let mut expected = 0u64;
    while expected < TOTAL {
        match ring.pop() {
            Some(v) => {
                assert_eq!(v, expected, "sample order must be preserved");
                expected += 1;
            }
            None => thread::yield_now(),
        }
    }

    producer.join().expect("producer thread");
    assert!(ring.is_empty());
}

/// Interleaved produce/consume across the wrap point keeps FIFO order.
#[test]
fn wraparound_interleaving() {
    let ring = Arc::new(SpscRing::new(7));
    let producer_ring = Arc::clone(&ring);

    let producer = thread::spawn(move || {
        for i in 0..50_000u64 {
            let mut value = i;
            loop {
                match producer_ring.push(value) {
                    Ok(()) => break,
                    Err(back) => {
                        value = back;
                        thread::yield_now();
                    }
                }
            }
        }
    });

    let mut expected = 0u64;
    while expected < 50_000 {
        if let Some(v) = ring.pop() {
            assert_eq!(v, expected);
            expected += 1;
        }
    }

    producer.join().expect("producer thread");
}
