
use std::sync::Arc;
use std::time::Duration;

use slotgate::admission::{Admission, AdmissionEngine, AdmissionError, AdmitReason};
use slotgate::counter_store::CounterStore;
use slotgate::keys::{hour_counter_key, minute_counter_key};
use slotgate::metrics::{self, decision};
use slotgate::settings::QueueTable;
use slotgate::slot::slot_of;
use test_helpers::*;

fn counted() -> Admission {
    Admission::Admitted {
        reason: AdmitReason::Counted,
    }
}

#[slotgate::test]
async fn admits_until_minute_ceiling_then_defers_to_later_slot() {
    let fx = Fixture::new(queue_config(2, 100), t0() + 5_000);
    let now = fx.now_ms();
    let current = slot_of(now);

    assert_eq!(fx.engine.try_admit(QUEUE, now, None).await.unwrap(), counted());
    assert_eq!(fx.engine.try_admit(QUEUE, now, None).await.unwrap(), counted());

    let Admission::Deferred { slot, reserved } = fx.engine.try_admit(QUEUE, now, None).await.unwrap() else {
        panic!("third attempt should be deferred");
    };
    assert!(slot > current);
    assert_eq!(slot, current.next());
    assert!(reserved);

    // The reservation is visible as one consumed unit of the future slot
    let reserved_units = fx
        .store
        .get(&minute_counter_key(QUEUE, slot))
        .await
        .unwrap();
    assert_eq!(reserved_units, Some(1));
}

#[slotgate::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_racing_workers_with_limit_two() {
    let fx = Fixture::new(queue_config(2, 100), t0() + 20_000);
    let now = fx.now_ms();
    let current = slot_of(now);

    let mut handles = Vec::new();
    for _ in 0..3 {
        let engine = Arc::clone(&fx.engine);
        handles.push(tokio::spawn(async move { engine.try_admit(QUEUE, now, None).await.unwrap() }));
    }
    let mut admitted = 0;
    let mut deferred_slots = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Admission::Admitted { reason } => {
                assert_eq!(reason, AdmitReason::Counted);
                admitted += 1;
            }
            Admission::Deferred { slot, .. } => deferred_slots.push(slot),
        }
    }
    assert_eq!(admitted, 2);
    assert_eq!(deferred_slots.len(), 1);
    assert!(deferred_slots[0] > current);
}

#[slotgate::test]
async fn zero_hour_limit_defers_everything() {
    let fx = Fixture::new(queue_config(50, 0), t0());
    for i in 0..5 {
        let now = fx.now_ms();
        match fx.engine.try_admit(QUEUE, now, None).await.unwrap() {
            Admission::Deferred { slot, reserved } => {
                assert!(slot > slot_of(now), "attempt {}", i);
                assert!(!reserved, "a zero hour ceiling leaves nothing to reserve");
            }
            other => panic!("attempt {} should be deferred, got {:?}", i, other),
        }
        fx.clock.advance(Duration::from_secs(45));
    }
}

#[slotgate::test]
async fn store_outage_fails_open() {
    let fx = Fixture::new(queue_config(1, 1), t0());
    fx.store.set_available(false);
    let now = fx.now_ms();

    for _ in 0..3 {
        assert_eq!(
            fx.engine.try_admit(QUEUE, now, None).await.unwrap(),
            Admission::Admitted {
                reason: AdmitReason::FailOpen
            }
        );
    }
    assert!(matches!(
        fx.engine.check(QUEUE, now, None).await,
        Err(AdmissionError::StoreUnavailable(_))
    ));
}

#[slotgate::test]
async fn hung_store_fails_open_within_timeout() {
    let fx = Fixture::with_timeout(queue_config(1, 1), t0(), Duration::from_millis(50));
    fx.store.set_latency(Some(Duration::from_secs(30)));
    let now = fx.now_ms();
    let admission = with_timeout!(2_000, { fx.engine.try_admit(QUEUE, now, None).await.unwrap() });
    assert_eq!(
        admission,
        Admission::Admitted {
            reason: AdmitReason::FailOpen
        }
    );
}

#[slotgate::test]
async fn admission_is_not_idempotent() {
    // The same logical job checked twice is counted twice
    let fx = Fixture::new(queue_config(1, 100), t0());
    let now = fx.now_ms();
    assert_eq!(fx.engine.try_admit(QUEUE, now, None).await.unwrap(), counted());
    assert!(matches!(
        fx.engine.try_admit(QUEUE, now, None).await.unwrap(),
        Admission::Deferred { .. }
    ));

    let minute = minute_counter_key(QUEUE, slot_of(now));
    let hour = hour_counter_key(QUEUE, slot_of(now).hour());
    assert_eq!(fx.store.get(&minute).await.unwrap(), Some(2));
    // Two checks plus the reservation taken in the next slot of the same hour
    assert_eq!(fx.store.get(&hour).await.unwrap(), Some(3));
}

#[slotgate::test]
async fn rejected_increments_are_not_compensated() {
    let fx = Fixture::new(queue_config(2, 100), t0());
    let now = fx.now_ms();
    for _ in 0..4 {
        fx.engine.try_admit(QUEUE, now, None).await.unwrap();
    }
    let minute = minute_counter_key(QUEUE, slot_of(now));
    assert_eq!(fx.store.get(&minute).await.unwrap(), Some(4));
}

#[slotgate::test]
async fn counter_ttls_cover_one_extra_period() {
    let fx = Fixture::new(queue_config(10, 100), t0() + 30_000);
    let now = fx.now_ms();
    let current = slot_of(now);
    fx.engine.try_admit(QUEUE, now, None).await.unwrap();

    let minute = minute_counter_key(QUEUE, current);
    let hour = hour_counter_key(QUEUE, current.hour());
    assert_eq!(fx.store.expires_at_ms(&minute).await, Some(t0() + 120_000));
    assert_eq!(fx.store.expires_at_ms(&hour).await, Some(t0() + 7_200_000));

    fx.clock.advance(Duration::from_secs(20));
    fx.engine.try_admit(QUEUE, fx.now_ms(), None).await.unwrap();
    assert_eq!(
        fx.store.expires_at_ms(&minute).await,
        Some(t0() + 120_000),
        "later increments keep the original expiry"
    );
}

#[slotgate::test]
async fn reservation_is_honored_without_recounting() {
    let fx = Fixture::new(queue_config(1, 100), t0());
    let now = fx.now_ms();
    fx.engine.try_admit(QUEUE, now, None).await.unwrap();
    let Admission::Deferred { slot, reserved: true } = fx.engine.try_admit(QUEUE, now, None).await.unwrap()
    else {
        panic!("expected a reserved deferral");
    };

    fx.clock.set(slot.start_ms() + 2_000);
    let admission = fx.engine.try_admit(QUEUE, fx.now_ms(), Some(slot)).await.unwrap();
    assert_eq!(
        admission,
        Admission::Admitted {
            reason: AdmitReason::Reserved
        }
    );
    let units = fx.store.get(&minute_counter_key(QUEUE, slot)).await.unwrap();
    assert_eq!(units, Some(1), "the reservation already counted this job");

    // A fresh job in that slot finds it full
    assert!(matches!(
        fx.engine.try_admit(QUEUE, fx.now_ms(), None).await.unwrap(),
        Admission::Deferred { .. }
    ));
}

#[slotgate::test]
async fn early_wakeup_keeps_waiting_for_its_slot() {
    let fx = Fixture::new(queue_config(1, 100), t0());
    let slot = slot_of(t0()).offset(3);
    let admission = fx.engine.try_admit(QUEUE, fx.now_ms(), Some(slot)).await.unwrap();
    assert_eq!(
        admission,
        Admission::Deferred {
            slot,
            reserved: true
        }
    );
    assert_eq!(fx.store.live_keys().await, 0, "nothing counted or reserved");
}

#[slotgate::test]
async fn late_wakeup_is_checked_again() {
    let fx = Fixture::new(queue_config(1, 100), t0() + 600_000);
    let stale = slot_of(t0());
    let now = fx.now_ms();
    assert_eq!(fx.engine.try_admit(QUEUE, now, Some(stale)).await.unwrap(), counted());
    assert_eq!(
        fx.store
            .get(&minute_counter_key(QUEUE, slot_of(now)))
            .await
            .unwrap(),
        Some(1)
    );
}

#[slotgate::test]
async fn queues_are_limited_independently() {
    let fx = Fixture::new(queue_config(1, 100), t0());
    let now = fx.now_ms();
    assert_eq!(fx.engine.try_admit("send_email", now, None).await.unwrap(), counted());
    assert_eq!(fx.engine.try_admit("send_email_mass", now, None).await.unwrap(), counted());
    assert!(!fx.engine.try_admit("send_email", now, None).await.unwrap().is_admitted());
}

#[slotgate::test]
async fn hour_ceiling_binds_across_minutes() {
    let fx = Fixture::new(queue_config(10, 3), t0());
    for _ in 0..3 {
        assert_eq!(fx.engine.try_admit(QUEUE, fx.now_ms(), None).await.unwrap(), counted());
        fx.clock.advance(Duration::from_secs(60));
    }
    let now = fx.now_ms();
    let Admission::Deferred { slot, reserved } = fx.engine.try_admit(QUEUE, now, None).await.unwrap() else {
        panic!("hour ceiling should defer");
    };
    assert!(reserved);
    assert_eq!(slot, slot_of(t0()).hour().next().first_slot());
}

#[slotgate::test]
async fn decisions_are_recorded_in_metrics() {
    let fx = Fixture::new(queue_config(1, 100), t0());
    let metrics = metrics::init().unwrap();
    let engine = AdmissionEngine::new(
        fx.store.clone(),
        Arc::new(QueueTable::uniform(queue_config(1, 100))),
        Duration::from_secs(1),
    )
    .with_metrics(metrics.clone());

    let now = fx.now_ms();
    engine.try_admit(QUEUE, now, None).await.unwrap();
    engine.try_admit(QUEUE, now, None).await.unwrap();
    fx.store.set_available(false);
    engine.try_admit(QUEUE, now, None).await.unwrap();

    assert_eq!(metrics.admissions(QUEUE, decision::ADMITTED), 1);
    assert_eq!(metrics.admissions(QUEUE, decision::DEFERRED), 1);
    assert_eq!(metrics.admissions(QUEUE, decision::FAIL_OPEN), 1);
    assert!(metrics.render().contains("slotgate_admissions_total"));
}

#[slotgate::test]
async fn fenced_store_is_not_failed_open() {
    let fx = Fixture::new(queue_config(1, 1), t0());
    fx.store.fence();
    let now = fx.now_ms();

    let err = fx.engine.try_admit(QUEUE, now, None).await.unwrap_err();
    assert!(err.is_fatal());
    let err = fx.engine.check(QUEUE, now, None).await.unwrap_err();
    assert!(err.is_fatal());

    // An ordinary outage still fails open
    let fx = Fixture::new(queue_config(1, 1), t0());
    fx.store.set_available(false);
    assert!(fx.engine.try_admit(QUEUE, now, None).await.is_ok());
}

#[slotgate::test]
async fn withheld_reservation_leaves_future_slots_untouched() {
    let fx = Fixture::new(queue_config(1, 100), t0());
    let now = fx.now_ms();
    let current = slot_of(now);
    fx.engine.try_admit(QUEUE, now, None).await.unwrap();

    let admission = fx
        .engine
        .try_admit_with(QUEUE, now, None, false)
        .await
        .unwrap();
    assert_eq!(
        admission,
        Admission::Deferred {
            slot: current.next(),
            reserved: false
        }
    );
    let next_units = fx
        .store
        .get(&minute_counter_key(QUEUE, current.next()))
        .await
        .unwrap();
    assert_eq!(next_units, None);
    assert_eq!(
        fx.store
            .get(&slotgate::keys::cursor_key(QUEUE))
            .await
            .unwrap(),
        None
    );
}
