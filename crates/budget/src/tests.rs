use super::*;
use common::BudgetOptions;
use pretty_assertions::assert_eq;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

fn budget(limit: u64, threshold: f64) -> MemoryBudget {
    MemoryBudget::new(
        BudgetOptions::builder()
            .limit(limit)
            .pressure_threshold(threshold)
            .build(),
    )
}

#[test]
fn coarse_track_and_release() {
    let b = budget(1000, 0.8);
    b.register_component("page_cache");

    b.track("page_cache", 300);
    b.track("page_cache", 200);
    assert_eq!(b.total_usage(), 500);
    assert_eq!(b.component_usage("page_cache"), 500);

    b.release("page_cache", 500);
    assert_eq!(b.total_usage(), 0);
}

#[test]
fn release_never_underflows() {
    let b = budget(1000, 0.8);
    b.release("page_cache", 10_000);
    assert_eq!(b.total_usage(), 0);
}

#[test]
fn usage_converges_to_zero_under_concurrency() {
    let b = budget(u64::MAX, 1.0);
    let mut handles = Vec::new();
    for t in 0..4 {
        let b = b.clone();
        handles.push(thread::spawn(move || {
            for i in 0..1000u64 {
                let key = t * 1000 + i;
                b.track_with_priority("cache", key, 64, Priority::Cold);
                b.release_item("cache", key);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(b.total_usage(), 0);
}

#[test]
fn pressure_callback_fires_once_per_transition() {
    // Scenario: limit 1000, threshold 0.8.
    let b = budget(1000, 0.8);
    let calls = Arc::new(Mutex::new(Vec::new()));
    let seen = calls.clone();
    b.on_pressure(move |usage, limit| {
        seen.lock().unwrap().push((usage, limit));
    });

    b.track("x", 700);
    assert!(calls.lock().unwrap().is_empty());

    b.track("x", 150);
    assert_eq!(calls.lock().unwrap().as_slice(), &[(850, 1000)]);

    b.track("x", 50);
    assert_eq!(calls.lock().unwrap().len(), 1);
}

#[test]
fn pressure_latch_rearms_after_relief() {
    let b = budget(1000, 0.8);
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    b.on_pressure(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    b.track("x", 900);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Still latched while above the threshold.
    b.release("x", 50);
    b.track("x", 50);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Dropping below the threshold re-arms.
    b.release("x", 500);
    b.track("x", 500);
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[test]
fn pressure_callback_may_reenter_the_budget() {
    let b = budget(1000, 0.8);
    let b2 = b.clone();
    let observed = Arc::new(Mutex::new(None));
    let slot = observed.clone();
    b.on_pressure(move |_, _| {
        *slot.lock().unwrap() = Some(b2.total_usage());
    });

    b.track("x", 800);
    assert_eq!(*observed.lock().unwrap(), Some(800));
}

#[test]
fn under_pressure_and_exceeded_observers() {
    let b = budget(1000, 0.8);
    assert!(!b.is_under_pressure());
    assert!(!b.is_exceeded());

    b.track("x", 800);
    assert!(b.is_under_pressure());
    assert!(!b.is_exceeded());

    b.track("x", 201);
    assert!(b.is_exceeded());
}

#[test]
fn access_counts_promote_monotonically() {
    let b = budget(1000, 1.0);
    b.track_with_priority("cache", 1, 10, Priority::Cold);

    for _ in 0..2 {
        b.record_access("cache", 1);
    }
    // Two accesses: still cold, so the item leads the candidate list.
    assert_eq!(b.get_eviction_candidates("cache", 1), vec![1]);

    b.record_access("cache", 1); // third access: Cold -> Warm
    b.track_with_priority("cache", 2, 10, Priority::Cold);
    assert_eq!(b.get_eviction_candidates("cache", 1), vec![2]);

    for _ in 0..7 {
        b.record_access("cache", 1); // tenth access: Warm -> Hot
    }
    b.track_with_priority("cache", 3, 10, Priority::Warm);
    let order = b.get_eviction_candidates("cache", 30);
    assert_eq!(order, vec![2, 3, 1]);
}

#[test]
fn eviction_candidates_sorted_by_priority_then_staleness() {
    let b = budget(10_000, 1.0);
    b.track_with_priority("cache", 10, 100, Priority::Hot);
    b.track_with_priority("cache", 20, 100, Priority::Cold);
    thread::sleep(Duration::from_millis(2));
    b.track_with_priority("cache", 30, 100, Priority::Warm);
    b.track_with_priority("cache", 40, 100, Priority::Cold);

    // 20 was tracked before 40, so among the two cold items it is staler.
    let order = b.get_eviction_candidates("cache", 400);
    assert_eq!(order, vec![20, 40, 30, 10]);

    // The prefix stops as soon as the requested bytes are covered.
    let prefix = b.get_eviction_candidates("cache", 150);
    assert_eq!(prefix, vec![20, 40]);
}

#[test]
fn decay_demotes_idle_items() {
    let b = budget(10_000, 1.0);
    b.track_with_priority("cache", 1, 100, Priority::Hot);
    b.track_with_priority("cache", 2, 100, Priority::Cold);

    thread::sleep(Duration::from_millis(5));
    b.decay_priorities("cache", Duration::from_millis(1));

    // Hot decayed to Warm; Cold stays floored at Cold.
    b.track_with_priority("cache", 3, 100, Priority::Hot);
    let order = b.get_eviction_candidates("cache", 300);
    assert_eq!(order, vec![2, 1, 3]);
}

#[test]
fn retracking_a_key_replaces_its_size() {
    let b = budget(10_000, 1.0);
    b.track_with_priority("cache", 1, 100, Priority::Cold);
    b.track_with_priority("cache", 1, 40, Priority::Cold);
    assert_eq!(b.total_usage(), 40);
}

#[test]
fn candidates_for_unknown_component_are_empty() {
    let b = budget(1000, 0.8);
    assert!(b.get_eviction_candidates("nope", 100).is_empty());
}
