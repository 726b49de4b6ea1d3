// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use proptest::prelude::*;
use std::time::Duration;

const WINDOW: Duration = Duration::from_millis(100);

#[test]
fn first_offer_emits_immediately() {
    let mut gate = Coalescer::new(WINDOW);
    let t0 = Instant::now();
    assert_eq!(gate.offer(t0), Decision::EmitNow);
    assert_eq!(gate.deadline(), None);
}

#[test]
fn offer_inside_window_schedules_trailing_emit() {
    let mut gate = Coalescer::new(WINDOW);
    let t0 = Instant::now();
    gate.offer(t0);

    let t1 = t0 + Duration::from_millis(30);
    assert_eq!(gate.offer(t1), Decision::Scheduled(t0 + WINDOW));
    assert_eq!(gate.deadline(), Some(t0 + WINDOW));
}

#[test]
fn repeated_offers_coalesce_into_one_deadline() {
    let mut gate = Coalescer::new(WINDOW);
    let t0 = Instant::now();
    gate.offer(t0);

    let d1 = gate.offer(t0 + Duration::from_millis(10));
    let d2 = gate.offer(t0 + Duration::from_millis(20));
    let d3 = gate.offer(t0 + Duration::from_millis(90));
    assert_eq!(d1, d2);
    assert_eq!(d2, d3);

    assert!(gate.fire(t0 + WINDOW));
    // The single trailing emit drained everything pending.
    assert!(!gate.fire(t0 + WINDOW));
}

#[test]
fn offer_after_idle_window_emits_again() {
    let mut gate = Coalescer::new(WINDOW);
    let t0 = Instant::now();
    gate.offer(t0);
    assert_eq!(gate.offer(t0 + WINDOW), Decision::EmitNow);
}

#[test]
fn force_resets_window() {
    let mut gate = Coalescer::new(WINDOW);
    let t0 = Instant::now();
    gate.offer(t0);
    gate.offer(t0 + Duration::from_millis(50));
    assert!(gate.deadline().is_some());

    let t1 = t0 + Duration::from_millis(60);
    gate.force(t1);
    assert_eq!(gate.deadline(), None);
    // A fresh offer right after a force is again inside the window.
    assert!(matches!(gate.offer(t1 + Duration::from_millis(1)), Decision::Scheduled(_)));
}

proptest! {
    // Between any two successive emits at least one full window elapses,
    // and every armed deadline is eventually reachable (<= offer + window).
    #[test]
    fn emits_are_spaced_by_window(offsets in proptest::collection::vec(0u64..500, 1..64)) {
        let mut gate = Coalescer::new(WINDOW);
        let t0 = Instant::now();
        let mut now = t0;
        let mut emits: Vec<Instant> = Vec::new();

        for off in offsets {
            now += Duration::from_millis(off);
            // Fire any deadline that elapsed before this offer.
            if let Some(deadline) = gate.deadline() {
                if deadline <= now && gate.fire(deadline) {
                    emits.push(deadline);
                }
            }
            match gate.offer(now) {
                Decision::EmitNow => emits.push(now),
                Decision::Scheduled(deadline) => {
                    prop_assert!(deadline <= now + WINDOW);
                }
            }
        }
        if let Some(deadline) = gate.deadline() {
            if gate.fire(deadline) {
                emits.push(deadline);
            }
        }

        for pair in emits.windows(2) {
            prop_assert!(pair[1] - pair[0] >= WINDOW);
        }
    }
}
