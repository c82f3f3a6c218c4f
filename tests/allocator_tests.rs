
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use slotgate::allocator::SlotAllocator;
use slotgate::clock::Clock;
use slotgate::counter_store::{CounterStore, MemoryCounterStore};
use slotgate::keys::{cursor_key, hour_counter_key, minute_counter_key};
use slotgate::metrics;
use slotgate::slot::{SlotKey, slot_of};
use test_helpers::*;

fn allocator(store: &Arc<MemoryCounterStore>) -> SlotAllocator {
    SlotAllocator::new(store.clone(), Duration::from_secs(1))
}

async fn cursor(store: &MemoryCounterStore) -> Option<SlotKey> {
    store
        .get(&cursor_key(QUEUE))
        .await
        .unwrap()
        .map(SlotKey::from_epoch_minutes)
}

#[slotgate::test]
async fn absent_cursor_starts_after_current_slot() {
    let fx = Fixture::new(queue_config(5, 100), t0() + 10_000);
    let current = slot_of(fx.now_ms());
    let allocation = allocator(&fx.store)
        .allocate(QUEUE, &queue_config(5, 100), fx.now_ms())
        .await
        .unwrap();

    assert_eq!(allocation.slot, current.next());
    assert!(allocation.reserved);
    assert_eq!(allocation.scanned, 1);
    assert_eq!(cursor(&fx.store).await, Some(current.next()));
    assert_eq!(
        fx.store
            .expires_at_ms(&minute_counter_key(QUEUE, current.next()))
            .await,
        Some(current.next().start_ms() + 120_000)
    );
    assert_eq!(
        fx.store.expires_at_ms(&cursor_key(QUEUE)).await,
        Some(current.next().start_ms() + 3_600_000)
    );
}

#[slotgate::test]
async fn stale_cursor_is_reset() {
    let fx = Fixture::new(queue_config(5, 100), t0() + 1_200_000);
    let current = slot_of(fx.now_ms());
    fx.store
        .set(
            &cursor_key(QUEUE),
            current.offset(-10).epoch_minutes(),
            Duration::from_secs(3600),
        )
        .await
        .unwrap();

    let allocation = allocator(&fx.store)
        .allocate(QUEUE, &queue_config(5, 100), fx.now_ms())
        .await
        .unwrap();
    assert_eq!(allocation.slot, current.next());
    assert_eq!(cursor(&fx.store).await, Some(current.next()));
}

#[slotgate::test]
async fn cursor_pointing_at_current_slot_is_stale() {
    let fx = Fixture::new(queue_config(5, 100), t0());
    let current = slot_of(fx.now_ms());
    fx.store
        .set(&cursor_key(QUEUE), current.epoch_minutes(), Duration::from_secs(3600))
        .await
        .unwrap();
    let allocation = allocator(&fx.store)
        .allocate(QUEUE, &queue_config(5, 100), fx.now_ms())
        .await
        .unwrap();
    assert_eq!(allocation.slot, current.next());
}

#[slotgate::test]
async fn cursor_moves_once_slot_is_full() {
    let config = queue_config(2, 100);
    let fx = Fixture::new(config.clone(), t0());
    let current = slot_of(fx.now_ms());
    let allocator = allocator(&fx.store);

    let first = allocator.allocate(QUEUE, &config, fx.now_ms()).await.unwrap();
    assert_eq!(first.slot, current.next());
    assert_eq!(cursor(&fx.store).await, Some(current.next()));

    let second = allocator.allocate(QUEUE, &config, fx.now_ms()).await.unwrap();
    assert_eq!(second.slot, current.next());
    assert_eq!(cursor(&fx.store).await, Some(current.offset(2)));

    let third = allocator.allocate(QUEUE, &config, fx.now_ms()).await.unwrap();
    assert_eq!(third.slot, current.offset(2));
    assert_eq!(third.scanned, 1, "full slots behind the cursor are not tried again");
}

#[slotgate::test]
async fn full_hour_is_skipped() {
    let config = queue_config(10, 2);
    let fx = Fixture::new(config.clone(), t0() + 600_000);
    let current = slot_of(fx.now_ms());
    let next_hour = current.hour().next().first_slot();
    let allocator = allocator(&fx.store);

    for _ in 0..2 {
        let allocation = allocator.allocate(QUEUE, &config, fx.now_ms()).await.unwrap();
        assert_eq!(allocation.slot, current.next());
    }
    assert_eq!(cursor(&fx.store).await, Some(next_hour));

    let allocation = allocator.allocate(QUEUE, &config, fx.now_ms()).await.unwrap();
    assert_eq!(allocation.slot, next_hour);
    assert!(allocation.reserved);
    assert_eq!(
        fx.store
            .get(&hour_counter_key(QUEUE, next_hour.hour()))
            .await
            .unwrap(),
        Some(1)
    );
}

#[slotgate::test]
async fn full_hour_found_during_scan_is_jumped() {
    let config = queue_config(10, 3);
    let fx = Fixture::new(config.clone(), t0() + 1_800_000);
    let current = slot_of(fx.now_ms());
    fx.store
        .set(
            &hour_counter_key(QUEUE, current.hour()),
            3,
            Duration::from_secs(7200),
        )
        .await
        .unwrap();

    let allocation = allocator(&fx.store)
        .allocate(QUEUE, &config, fx.now_ms())
        .await
        .unwrap();
    assert_eq!(allocation.slot, current.hour().next().first_slot());
    assert_eq!(allocation.scanned, 2);
}

#[slotgate::test]
async fn exhausted_horizon_returns_unreserved_slot() {
    let config = queue_config(1, 100);
    let config = slotgate::settings::QueueConfig {
        scan_horizon_minutes: 3,
        ..config
    };
    let fx = Fixture::new(config.clone(), t0());
    let current = slot_of(fx.now_ms());
    for offset in 1..=3 {
        fx.store
            .set(
                &minute_counter_key(QUEUE, current.offset(offset)),
                1,
                Duration::from_secs(600),
            )
            .await
            .unwrap();
    }

    let metrics = metrics::init().unwrap();
    let allocator = allocator(&fx.store).with_metrics(Some(metrics.clone()));
    let allocation = allocator.allocate(QUEUE, &config, fx.now_ms()).await.unwrap();

    assert_eq!(allocation.slot, current.offset(3));
    assert!(!allocation.reserved);
    assert_eq!(allocation.scanned, 3);
    assert_eq!(cursor(&fx.store).await, Some(current.offset(3)));
    assert!(
        metrics
            .render()
            .contains("slotgate_allocation_exhausted_total{queue=\"send_email\"} 1")
    );

    // Nothing was reserved in the full slots
    for offset in 1..=3 {
        assert_eq!(
            fx.store
                .get(&minute_counter_key(QUEUE, current.offset(offset)))
                .await
                .unwrap(),
            Some(1)
        );
    }
}

#[slotgate::test]
async fn zero_hour_limit_never_reserves() {
    let config = queue_config(10, 0);
    let fx = Fixture::new(config.clone(), t0());
    let allocation = allocator(&fx.store)
        .allocate(QUEUE, &config, fx.now_ms())
        .await
        .unwrap();
    assert!(!allocation.reserved);
    assert!(allocation.slot > slot_of(fx.now_ms()));
    assert_eq!(fx.store.get(&hour_counter_key(QUEUE, allocation.slot.hour())).await.unwrap(), None);
}

#[slotgate::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_allocations_get_distinct_units() {
    let config = queue_config(1, 1_000);
    let fx = Fixture::new(config.clone(), t0() + 42_000);
    let current = slot_of(fx.now_ms());
    let allocator = Arc::new(allocator(&fx.store));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let allocator = Arc::clone(&allocator);
        let config = config.clone();
        let now = fx.now_ms();
        handles.push(tokio::spawn(async move {
            allocator.allocate(QUEUE, &config, now).await.unwrap()
        }));
    }

    let mut slots = HashSet::new();
    for handle in handles {
        let allocation = handle.await.unwrap();
        assert!(allocation.reserved);
        assert!(allocation.slot > current);
        assert!(slots.insert(allocation.slot), "slot {} handed out twice", allocation.slot);
    }
    assert_eq!(slots.len(), 16);
}

#[slotgate::test]
async fn never_allocates_current_or_past_slot() {
    let config = queue_config(3, 10_000);
    let fx = Fixture::new(config.clone(), t0());
    let allocator = allocator(&fx.store);
    for _ in 0..50 {
        let now = fx.clock.now_ms();
        let allocation = allocator.allocate(QUEUE, &config, now).await.unwrap();
        assert!(allocation.slot > slot_of(now));
        fx.clock.advance(Duration::from_secs(17));
    }
}

#[slotgate::test]
async fn cursor_never_moves_backwards() {
    let config = queue_config(1, 100);
    let fx = Fixture::new(config.clone(), t0());
    let current = slot_of(fx.now_ms());
    fx.store
        .set(
            &cursor_key(QUEUE),
            current.offset(30).epoch_minutes(),
            Duration::from_secs(3600),
        )
        .await
        .unwrap();

    let allocation = allocator(&fx.store)
        .allocate(QUEUE, &config, fx.now_ms())
        .await
        .unwrap();
    assert_eq!(allocation.slot, current.offset(30));
    assert_eq!(cursor(&fx.store).await, Some(current.offset(31)));

    // A racing allocator's lower cursor write loses
    let lowered = fx
        .store
        .set_max(
            &cursor_key(QUEUE),
            current.offset(5).epoch_minutes(),
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
    assert_eq!(lowered, current.offset(31).epoch_minutes());
}

#[slotgate::test]
async fn repeated_exhaustion_stays_within_horizon() {
    let config = queue_config(10, 0);
    let fx = Fixture::new(config.clone(), t0() + 7_000);
    let current = slot_of(fx.now_ms());
    let horizon_last = current.offset(i64::from(config.scan_horizon_minutes));
    let allocator = allocator(&fx.store);

    for round in 0..5 {
        let allocation = allocator.allocate(QUEUE, &config, fx.now_ms()).await.unwrap();
        assert!(!allocation.reserved);
        assert!(allocation.slot > current);
        assert!(
            allocation.slot <= horizon_last,
            "round {} returned {} beyond {}",
            round,
            allocation.slot,
            horizon_last
        );
    }
    assert!(cursor(&fx.store).await.unwrap() <= horizon_last);
}

#[slotgate::test]
async fn cursor_beyond_horizon_is_not_followed() {
    let config = slotgate::settings::QueueConfig {
        scan_horizon_minutes: 10,
        ..queue_config(1, 100)
    };
    let fx = Fixture::new(config.clone(), t0());
    let current = slot_of(fx.now_ms());
    fx.store
        .set(
            &cursor_key(QUEUE),
            current.offset(50).epoch_minutes(),
            Duration::from_secs(3600),
        )
        .await
        .unwrap();

    let allocation = allocator(&fx.store)
        .allocate(QUEUE, &config, fx.now_ms())
        .await
        .unwrap();
    assert_eq!(allocation.slot, current.offset(10));
    assert!(!allocation.reserved);
    assert_eq!(allocation.scanned, 0);
}
