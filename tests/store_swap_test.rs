use chrono::Utc;
use powermonitor::store::{RegisterBlock, RegisterStore, Telegram, TelegramStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

const ROUNDS: usize = 2_000;

fn uniform_telegram(round: usize) -> Telegram {
    let fill = b'a' + (round % 26) as u8;
    Telegram::from_bytes(vec![fill; 256], Utc::now())
}

#[test]
fn readers_never_see_a_mixed_telegram() {
    let store = Arc::new(TelegramStore::new());
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut seen = 0usize;
                while !done.load(Ordering::Acquire) {
                    if let Some(telegram) = store.latest() {
                        let bytes = telegram.as_bytes();
                        assert_eq!(bytes.len(), 256);
                        assert!(bytes.iter().all(|&b| b == bytes[0]));
                        seen += 1;
                    }
                }
                seen
            })
        })
        .collect();

    let mut recycled = 0;
    for round in 0..ROUNDS {
        if store.publish(uniform_telegram(round)).is_some() {
            recycled += 1;
        }
    }
    done.store(true, Ordering::Release);

    for reader in readers {
        reader.join().unwrap();
    }
    assert!(recycled <= ROUNDS - 1);
    let last = store.latest().unwrap();
    assert_eq!(last.as_bytes()[0], b'a' + ((ROUNDS - 1) % 26) as u8);
}

#[test]
fn register_block_swap_is_whole() {
    let store = Arc::new(RegisterStore::new());
    let reader_store = Arc::clone(&store);
    let done = Arc::new(AtomicBool::new(false));
    let reader_done = Arc::clone(&done);

    let reader = thread::spawn(move || {
        while !reader_done.load(Ordering::Acquire) {
            if let Some(block) = reader_store.latest() {
                let first = block.registers[0];
                assert!(block.registers.iter().all(|&r| r == first));
            }
        }
    });

    let mut spare: Option<Vec<u16>> = None;
    for round in 0..ROUNDS as u16 {
        let mut registers = spare.take().unwrap_or_default();
        registers.clear();
        registers.resize(109, round);
        spare = store
            .publish(RegisterBlock {
                registers,
                captured_at: Utc::now(),
            })
            .map(|previous| previous.registers);
    }
    done.store(true, Ordering::Release);
    reader.join().unwrap();

    assert_eq!(store.latest().unwrap().registers[0], ROUNDS as u16 - 1);
}
