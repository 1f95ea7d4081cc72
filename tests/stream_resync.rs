//! Scenario 4: a client subscribes with a stale `lastSeq` and is caught up
//! with a resync snapshot instead of a buffer replay (SPEC_FULL.md §8).

use std::sync::Arc;

use patrol_engine::clock::SystemClock;
use patrol_engine::stream::StreamBus;
use patrol_engine::types::{ResyncReason, StreamEventType, STREAM_FIELD_CAP_BYTES};

#[tokio::test]
async fn stale_last_seq_yields_snapshot_with_current_phase_and_buffer_bounds() {
    let bus = StreamBus::new(Arc::new(SystemClock));
    bus.reset_for_run("patrol-42");
    bus.set_phase("triage");
    for i in 0..10 {
        bus.append_content(&format!("line {i}"));
    }
    bus.set_phase("reasoning");

    // Client last saw seq=900 from a previous run; way ahead of the current
    // buffer, so it gets a resync snapshot rather than a replay.
    let mut sub = bus.subscribe(Some(900));
    let event = sub.rx.recv().await.expect("snapshot event");

    assert_eq!(event.event_type, StreamEventType::Snapshot);
    assert_eq!(event.resync_reason, Some(ResyncReason::StaleLastEventId));
    assert_eq!(event.phase.as_deref(), Some("reasoning"));
    assert_eq!(event.run_id, "patrol-42");
    assert!(event.buffer_start.is_some());
    assert!(event.buffer_end.is_some());
    assert_eq!(event.seq, bus.current_seq());
}

#[tokio::test]
async fn truncated_content_flag_is_carried_into_resync_snapshot() {
    let bus = StreamBus::new(Arc::new(SystemClock));
    bus.reset_for_run("patrol-43");
    // Genuinely exceed the cap rather than merely ending with the
    // truncation suffix, so this exercises real 8 KiB-cap detection.
    let oversized = "x".repeat(STREAM_FIELD_CAP_BYTES + 1);
    bus.append_content(&oversized);

    let mut sub = bus.subscribe(Some(900));
    let event = sub.rx.recv().await.expect("snapshot event");
    assert_eq!(event.content_truncated, Some(true));
}

#[tokio::test]
async fn content_ending_in_truncation_suffix_is_not_falsely_flagged() {
    let bus = StreamBus::new(Arc::new(SystemClock));
    bus.reset_for_run("patrol-45");
    // Short content that merely ends in the truncation suffix text must not
    // be reported as truncated — only the actual byte length matters.
    bus.append_content("a short line that just happens to end in [truncated]");

    let mut sub = bus.subscribe(Some(900));
    let event = sub.rx.recv().await.expect("snapshot event");
    assert_eq!(event.content_truncated, Some(false));
}

#[tokio::test]
async fn late_joiner_with_no_last_seq_gets_live_snapshot_not_replay() {
    let bus = StreamBus::new(Arc::new(SystemClock));
    bus.reset_for_run("patrol-44");
    bus.append_content("before subscriber joined");

    let mut sub = bus.subscribe(None);
    let event = sub.rx.recv().await.expect("snapshot event");
    assert_eq!(event.event_type, StreamEventType::Snapshot);
    assert_eq!(event.resync_reason, Some(ResyncReason::LateJoiner));
}
