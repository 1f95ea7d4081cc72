//! Streaming event bus with replay and back-pressure (SPEC_FULL.md §4.5).
//!
//! Mirrors the broadcast/subscriber-set shape used elsewhere in this
//! codebase for fan-out, but adds the per-run sequence numbering, bounded
//! replay buffer, and back-pressure drop semantics the spec requires —
//! plain `tokio::sync::broadcast` has none of those, so subscriber state is
//! tracked explicitly here instead.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::clock::SharedClock;
use crate::types::{ResyncReason, StreamEvent, StreamEventType};

/// Per-subscriber outbound channel capacity.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 128;
/// Events retained per run for replay (SPEC_FULL.md §4.5).
const REPLAY_BUFFER_CAPACITY: usize = 200;
/// Consecutive missed deliveries before a subscriber is dropped.
const BACKPRESSURE_MISS_LIMIT: u32 = 25;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<StreamEvent>,
    consecutive_misses: u32,
    closed: bool,
}

struct State {
    run_id: String,
    seq: u64,
    buffer: VecDeque<StreamEvent>,
    phase: String,
    content_truncated: bool,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
}

/// Fan-out of per-run stream events with replay and late-join snapshotting.
pub struct StreamBus {
    state: Mutex<State>,
    clock: SharedClock,
}

/// Handle returned from `subscribe`; dropping it does not automatically
/// unsubscribe — call `unsubscribe` explicitly (mirrors the spec's `Subscribe`/`Unsubscribe` pair).
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<StreamEvent>,
}

impl StreamBus {
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(State {
                run_id: String::new(),
                seq: 0,
                buffer: VecDeque::with_capacity(REPLAY_BUFFER_CAPACITY),
                phase: "idle".into(),
                content_truncated: false,
                subscribers: Vec::new(),
                next_subscriber_id: 0,
            }),
            clock,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Subscribe, optionally requesting replay of events after `last_seq`.
    pub fn subscribe(&self, last_seq: Option<u64>) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let mut state = self.lock();
        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;

        match last_seq {
            None => {
                if !state.run_id.is_empty() {
                    let snapshot = Self::build_snapshot(&state, ResyncReason::LateJoiner);
                    let _ = tx.try_send(snapshot);
                }
            }
            Some(0) => {
                if !state.run_id.is_empty() {
                    let snapshot = Self::build_snapshot(&state, ResyncReason::LateJoiner);
                    let _ = tx.try_send(snapshot);
                }
            }
            Some(requested) => {
                let buffer_start = state.buffer.front().map_or(0, |e| e.seq);
                let buffer_end = state.buffer.back().map_or(0, |e| e.seq);
                if requested < buffer_start && buffer_start > 0 {
                    let snapshot = Self::build_snapshot(&state, ResyncReason::BufferRotated);
                    let _ = tx.try_send(snapshot);
                } else if requested > buffer_end {
                    let snapshot = Self::build_snapshot(&state, ResyncReason::StaleLastEventId);
                    let _ = tx.try_send(snapshot);
                } else {
                    for event in state.buffer.iter().filter(|e| e.seq > requested) {
                        if tx.try_send(event.clone()).is_err() {
                            break; // can't keep up with replay; continue live only
                        }
                    }
                }
            }
        }

        state.subscribers.push(Subscriber {
            id,
            tx,
            consecutive_misses: 0,
            closed: false,
        });
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut state = self.lock();
        state.subscribers.retain(|s| s.id != id);
    }

    fn build_snapshot(state: &State, reason: ResyncReason) -> StreamEvent {
        let mut event = StreamEvent::new(StreamEventType::Snapshot);
        event.run_id = state.run_id.clone();
        event.seq = state.seq;
        event.phase = Some(state.phase.clone());
        event.content_truncated = Some(state.content_truncated);
        event.resync_reason = Some(reason);
        event.buffer_start = state.buffer.front().map(|e| e.seq);
        event.buffer_end = state.buffer.back().map(|e| e.seq);
        event
    }

    /// Reset bus state at the start of a new run.
    pub fn reset_for_run(&self, run_id: impl Into<String>) {
        let mut state = self.lock();
        state.run_id = run_id.into();
        state.seq = 0;
        state.buffer.clear();
        state.phase = "starting".into();
        state.content_truncated = false;
    }

    pub fn set_phase(&self, phase: impl Into<String>) {
        let phase = phase.into();
        {
            let mut state = self.lock();
            state.phase = phase.clone();
        }
        let mut event = StreamEvent::new(StreamEventType::Phase);
        event.phase = Some(phase);
        self.broadcast(event);
    }

    pub fn append_content(&self, text: &str) {
        let mut event = StreamEvent::new(StreamEventType::Content);
        event.content = Some(text.to_string());
        self.broadcast(event);
    }

    /// Decorate and fan out an event to every live subscriber
    /// (SPEC_FULL.md §4.5). Never blocks: a full subscriber channel counts as
    /// a miss rather than stalling the broadcaster.
    pub fn broadcast(&self, mut event: StreamEvent) {
        let mut state = self.lock();
        if event.run_id.is_empty() {
            event.run_id = state.run_id.clone();
        }
        state.seq += 1;
        event.seq = state.seq;
        if event.ts_ms == 0 {
            event.ts_ms = self.clock.now().timestamp_millis();
        }
        let event = event.with_capped_fields();

        if matches!(event.event_type, StreamEventType::Content) && event.content_truncated == Some(true) {
            state.content_truncated = true;
        }

        state.buffer.push_back(event.clone());
        while state.buffer.len() > REPLAY_BUFFER_CAPACITY {
            state.buffer.pop_front();
        }

        let mut dropped = Vec::new();
        for sub in &mut state.subscribers {
            if sub.closed {
                continue;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => sub.consecutive_misses = 0,
                Err(_) => {
                    sub.consecutive_misses += 1;
                    if sub.consecutive_misses >= BACKPRESSURE_MISS_LIMIT {
                        sub.closed = true;
                        dropped.push(sub.id);
                    }
                }
            }
        }
        if !dropped.is_empty() {
            state.subscribers.retain(|s| !dropped.contains(&s.id));
        }
    }

    #[must_use]
    pub fn current_seq(&self) -> u64 {
        self.lock().seq
    }
}

static GLOBAL_SEQ_GUARD: AtomicU64 = AtomicU64::new(0);

/// Generate a process-unique run id (`patrol-<n>`), used by the dispatcher.
pub fn next_run_id() -> String {
    let n = GLOBAL_SEQ_GUARD.fetch_add(1, Ordering::Relaxed);
    format!("patrol-{n}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::sync::Arc;

    #[tokio::test]
    async fn seq_is_strictly_increasing_within_a_run() {
        let bus = StreamBus::new(Arc::new(SystemClock));
        bus.reset_for_run("run-1");
        let mut sub = bus.subscribe(None);
        bus.append_content("a");
        bus.append_content("b");
        let first = sub.rx.recv().await.unwrap();
        let second = sub.rx.recv().await.unwrap();
        assert!(second.seq > first.seq);
    }

    #[tokio::test]
    async fn stale_last_event_id_emits_resync_snapshot() {
        let bus = StreamBus::new(Arc::new(SystemClock));
        bus.reset_for_run("run-1");
        bus.append_content("a");
        let mut sub = bus.subscribe(Some(900));
        let event = sub.rx.recv().await.unwrap();
        assert_eq!(event.event_type, StreamEventType::Snapshot);
        assert_eq!(event.resync_reason, Some(ResyncReason::StaleLastEventId));
    }
}
