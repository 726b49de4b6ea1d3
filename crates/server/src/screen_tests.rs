// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use proptest::prelude::*;

#[test]
fn plain_output_accumulates() {
    let mut screen = ScreenBuffer::new(1024, 0.75);
    let out = screen.feed(b"hello ");
    assert_eq!(out, FeedOutcome::default());
    screen.feed(b"world");
    assert_eq!(screen.snapshot(), "hello world");
}

#[test]
fn clear_sequence_restarts_snapshot() {
    let mut screen = ScreenBuffer::new(1024, 0.75);
    screen.feed(b"old content");
    let out = screen.feed(b"\x1b[2Jfresh");
    assert!(out.cleared);
    assert_eq!(screen.snapshot(), "fresh");
}

#[test]
fn last_clear_wins_when_several_present() {
    let mut screen = ScreenBuffer::new(1024, 0.75);
    let out = screen.feed(b"a\x1b[2Jb\x1b[H\x1b[2Jc");
    assert!(out.cleared);
    assert_eq!(screen.snapshot(), "c");
}

#[test]
fn home_then_clear_variant_collapses_as_one() {
    let mut screen = ScreenBuffer::new(1024, 0.75);
    screen.feed(b"before\x1b[1;1H\x1b[2Jafter");
    // The composite form must not leave its trailing half in the snapshot.
    assert_eq!(screen.snapshot(), "after");
}

#[test]
fn clear_split_across_feeds_is_detected() {
    let mut screen = ScreenBuffer::new(1024, 0.75);
    screen.feed(b"stale\x1b[2");
    let out = screen.feed(b"Jnew");
    assert!(out.cleared);
    assert_eq!(screen.snapshot(), "new");
}

#[test]
fn scrollback_erase_form_clears() {
    let mut screen = ScreenBuffer::new(1024, 0.75);
    screen.feed(b"history\x1b[3Jvisible");
    assert_eq!(screen.snapshot(), "visible");
}

#[test]
fn overflow_trims_to_target_and_reports_lengths() {
    let mut screen = ScreenBuffer::new(100, 0.75);
    screen.feed(&[b'x'; 90]);
    let out = screen.feed(&[b'y'; 30]);
    let report = out.trimmed.unwrap_or(TrimReport { old_len: 0, new_len: 0 });
    assert_eq!(report.old_len, 120);
    assert_eq!(report.new_len, 75);
    assert_eq!(screen.len(), 75);
    // The retained content is the contiguous tail.
    assert!(screen.snapshot().ends_with(&"y".repeat(30)));
}

#[test]
fn clear_resets_length() {
    let mut screen = ScreenBuffer::new(100, 0.75);
    screen.feed(b"abc");
    screen.clear();
    assert!(screen.is_empty());
    assert_eq!(screen.snapshot(), "");
}

proptest! {
    // Invariant: the retained buffer never exceeds its cap, whatever the
    // chunking of the input.
    #[test]
    fn buffer_never_exceeds_cap(chunks in proptest::collection::vec(
        proptest::collection::vec(any::<u8>(), 0..512), 0..64)
    ) {
        let mut screen = ScreenBuffer::new(1024, 0.75);
        for chunk in &chunks {
            screen.feed(chunk);
            prop_assert!(screen.len() <= 1024);
        }
    }

    // Feeding in one shot or byte-by-byte converges on the same tail for
    // clear-free input.
    #[test]
    fn chunking_is_immaterial_without_clears(data in proptest::collection::vec(0x20u8..0x7f, 0..2048)) {
        let mut whole = ScreenBuffer::new(256, 0.5);
        whole.feed(&data);

        let mut split = ScreenBuffer::new(256, 0.5);
        for b in &data {
            split.feed(std::slice::from_ref(b));
        }

        let w = whole.snapshot();
        let s = split.snapshot();
        // Both end with the same visible tail; trim points may differ.
        let common = w.len().min(s.len());
        prop_assert_eq!(&w[w.len() - common..], &s[s.len() - common..]);
    }
}
