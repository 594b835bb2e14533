// =============================================================================
// Subscriber queues and event fan-out
// =============================================================================
//
// Each subscriber owns a bounded channel of pre-serialised frames; one
// serialisation per event is shared across all subscribers. A subscriber
// whose queue is full during a tick is marked slow; a slow subscriber still
// full two ticks later is disconnected by dropping its sender, which the
// WebSocket task observes as stream end.
//
// Within a tick, frames are emitted in the fixed order removed, changed,
// added, status, so clients can apply updates idempotently.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::SpreadResult;

use super::diff::ResultDiff;

/// Consecutive full ticks after which a slow subscriber is dropped: marked
/// slow on tick k, disconnected on tick k+2.
const SLOW_TICK_LIMIT: u32 = 3;

// =============================================================================
// Frames
// =============================================================================

/// Server-to-client event classes a subscriber can opt into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Result,
    Status,
    Error,
    Metrics,
}

impl EventKind {
    pub fn all() -> HashSet<EventKind> {
        HashSet::from([Self::Result, Self::Status, Self::Error, Self::Metrics])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultAction {
    Added,
    Removed,
    Changed,
}

/// A pre-serialised outbound message. The JSON is built once per event and
/// shared across every subscriber queue.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub kind: EventKind,
    pub json: Arc<str>,
}

/// Per-tick status payload.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub scan_id: Uuid,
    pub tick: u64,
    pub results: usize,
    pub added: usize,
    pub removed: usize,
    pub changed: usize,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

pub fn result_frame(action: ResultAction, result: &SpreadResult) -> OutboundFrame {
    let payload = json!({
        "type": "result",
        "data": { "action": action, "result": result },
        "timestamp": Utc::now().to_rfc3339(),
    });
    OutboundFrame {
        kind: EventKind::Result,
        json: payload.to_string().into(),
    }
}

pub fn status_frame(status: &StatusEvent) -> OutboundFrame {
    let payload = json!({
        "type": "status",
        "data": status,
        "timestamp": Utc::now().to_rfc3339(),
    });
    OutboundFrame {
        kind: EventKind::Status,
        json: payload.to_string().into(),
    }
}

pub fn error_frame(code: &str, message: &str) -> OutboundFrame {
    let payload = json!({
        "type": "error",
        "data": { "code": code, "message": message },
        "timestamp": Utc::now().to_rfc3339(),
    });
    OutboundFrame {
        kind: EventKind::Error,
        json: payload.to_string().into(),
    }
}

pub fn metrics_frame(data: serde_json::Value) -> OutboundFrame {
    let payload = json!({
        "type": "metrics",
        "data": data,
        "timestamp": Utc::now().to_rfc3339(),
    });
    OutboundFrame {
        kind: EventKind::Metrics,
        json: payload.to_string().into(),
    }
}

/// Assemble one tick's frames in delivery order: removed, changed, added,
/// status.
pub fn assemble_tick_frames(diff: &ResultDiff, status: &StatusEvent) -> Vec<OutboundFrame> {
    let mut frames =
        Vec::with_capacity(diff.removed.len() + diff.changed.len() + diff.added.len() + 1);
    for r in &diff.removed {
        frames.push(result_frame(ResultAction::Removed, r));
    }
    for r in &diff.changed {
        frames.push(result_frame(ResultAction::Changed, r));
    }
    for r in &diff.added {
        frames.push(result_frame(ResultAction::Added, r));
    }
    frames.push(status_frame(status));
    frames
}

// =============================================================================
// Subscribers
// =============================================================================

pub struct Subscriber {
    pub id: Uuid,
    tx: mpsc::Sender<OutboundFrame>,
    events: HashSet<EventKind>,
    slow_ticks: u32,
}

impl Subscriber {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: Uuid::new_v4(),
                tx,
                events: EventKind::all(),
                slow_ticks: 0,
            },
            rx,
        )
    }

    /// Queue a frame without blocking. Returns false when the queue is full.
    fn try_push(&self, frame: &OutboundFrame) -> Result<(), PushError> {
        match self.tx.try_send(frame.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(PushError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PushError::Closed),
        }
    }
}

enum PushError {
    Full,
    Closed,
}

/// The set of live subscribers for one scan. Owned by the scan's state and
/// mutated only under the per-scan lock.
#[derive(Default)]
pub struct SubscriberSet {
    subs: Vec<Subscriber>,
}

impl SubscriberSet {
    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    pub fn add(&mut self, sub: Subscriber) {
        debug!(subscriber = %sub.id, total = self.subs.len() + 1, "subscriber added");
        self.subs.push(sub);
    }

    pub fn remove(&mut self, id: Uuid) -> bool {
        let before = self.subs.len();
        self.subs.retain(|s| s.id != id);
        before != self.subs.len()
    }

    pub fn set_events(&mut self, id: Uuid, events: HashSet<EventKind>) -> bool {
        match self.subs.iter_mut().find(|s| s.id == id) {
            Some(sub) => {
                sub.events = events;
                true
            }
            None => false,
        }
    }

    /// Deliver the snapshot burst directly to one subscriber (used on
    /// subscribe, before any live tick reaches it).
    pub fn push_to(&self, id: Uuid, frames: &[OutboundFrame]) {
        if let Some(sub) = self.subs.iter().find(|s| s.id == id) {
            for frame in frames {
                if sub.try_push(frame).is_err() {
                    warn!(subscriber = %id, "snapshot burst overflowed subscriber queue");
                    break;
                }
            }
        }
    }

    /// Fan one tick's frames out to every subscriber, honouring per-
    /// subscriber event filters. Returns the ids of subscribers disconnected
    /// this tick (slow or gone).
    pub fn broadcast_tick(&mut self, frames: &[OutboundFrame]) -> Vec<Uuid> {
        let mut evicted = Vec::new();

        for sub in &mut self.subs {
            let mut full = false;
            let mut closed = false;

            for frame in frames.iter().filter(|f| sub.events.contains(&f.kind)) {
                match sub.try_push(frame) {
                    Ok(()) => {}
                    Err(PushError::Full) => {
                        full = true;
                        break;
                    }
                    Err(PushError::Closed) => {
                        closed = true;
                        break;
                    }
                }
            }

            if closed {
                evicted.push(sub.id);
                continue;
            }

            if full {
                sub.slow_ticks += 1;
                if sub.slow_ticks == 1 {
                    warn!(subscriber = %sub.id, "subscriber marked slow — queue full");
                }
                if sub.slow_ticks >= SLOW_TICK_LIMIT {
                    info!(subscriber = %sub.id, "slow subscriber disconnected");
                    evicted.push(sub.id);
                }
            } else {
                sub.slow_ticks = 0;
            }
        }

        // Dropping the sender closes the channel; the transport task sees
        // stream end and closes the socket with a protocol error.
        self.subs.retain(|s| !evicted.contains(&s.id));
        evicted
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OptionRight, VerticalKind};
    use chrono::NaiveDate;

    fn result(id: &str) -> SpreadResult {
        SpreadResult {
            id: id.into(),
            symbol: "SPY".into(),
            expiry: NaiveDate::from_ymd_opt(2026, 9, 18).unwrap(),
            right: OptionRight::Call,
            kind: VerticalKind::BullCall,
            long_strike: 100.0,
            short_strike: 105.0,
            width: 5.0,
            net_price: 2.0,
            max_profit: 3.0,
            max_loss: 2.0,
            pop: 0.45,
            delta: 0.25,
            gamma: 0.01,
            theta: -0.02,
            vega: 0.05,
            iv_percentile: None,
            volume: 100,
            open_interest: 500,
            bid_ask_spread: 0.10,
            score: 50.0,
        }
    }

    fn status(tick: u64) -> StatusEvent {
        StatusEvent {
            scan_id: Uuid::new_v4(),
            tick,
            results: 0,
            added: 0,
            removed: 0,
            changed: 0,
            duration_ms: 1,
            skipped: None,
            warnings: vec![],
        }
    }

    #[test]
    fn tick_frames_ordered_removed_changed_added_status() {
        let diff = ResultDiff {
            added: vec![result("D")],
            removed: vec![result("A")],
            changed: vec![result("B")],
        };
        let frames = assemble_tick_frames(&diff, &status(7));

        assert_eq!(frames.len(), 4);
        assert!(frames[0].json.contains("\"removed\""));
        assert!(frames[0].json.contains("\"A\""));
        assert!(frames[1].json.contains("\"changed\""));
        assert!(frames[1].json.contains("\"B\""));
        assert!(frames[2].json.contains("\"added\""));
        assert!(frames[2].json.contains("\"D\""));
        assert_eq!(frames[3].kind, EventKind::Status);
    }

    #[test]
    fn frames_carry_type_and_timestamp() {
        let frame = result_frame(ResultAction::Added, &result("A"));
        let parsed: serde_json::Value = serde_json::from_str(&frame.json).unwrap();
        assert_eq!(parsed["type"], "result");
        assert_eq!(parsed["data"]["action"], "added");
        assert!(parsed["timestamp"].as_str().unwrap().contains('T'));

        let err = error_frame("protocol", "bad frame");
        let parsed: serde_json::Value = serde_json::from_str(&err.json).unwrap();
        assert_eq!(parsed["type"], "error");
        assert_eq!(parsed["data"]["code"], "protocol");
    }

    #[tokio::test]
    async fn event_filter_limits_delivery() {
        let mut set = SubscriberSet::default();
        let (mut sub, mut rx) = Subscriber::new(16);
        sub.events = HashSet::from([EventKind::Status]);
        let id = sub.id;
        set.add(sub);

        let diff = ResultDiff {
            added: vec![result("A")],
            ..Default::default()
        };
        let evicted = set.broadcast_tick(&assemble_tick_frames(&diff, &status(1)));
        assert!(evicted.is_empty());

        // Only the status frame arrives.
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.kind, EventKind::Status);
        assert!(rx.try_recv().is_err());
        assert!(set.remove(id));
    }

    /// Scenario: a subscriber that never drains is marked slow on the first
    /// overflowing tick and disconnected two ticks later, while a healthy
    /// subscriber keeps receiving every event without loss.
    #[tokio::test]
    async fn slow_subscriber_evicted_after_two_more_ticks() {
        let mut set = SubscriberSet::default();

        let (slow, _slow_rx) = Subscriber::new(2);
        let slow_id = slow.id;
        set.add(slow);

        let (healthy, mut healthy_rx) = Subscriber::new(64);
        let healthy_id = healthy.id;
        set.add(healthy);

        // Each tick emits 3 result frames + status = 4 frames > capacity 2.
        let diff = ResultDiff {
            added: vec![result("A"), result("B"), result("C")],
            ..Default::default()
        };

        // Tick k: slow subscriber overflows, marked slow, not yet evicted.
        let evicted = set.broadcast_tick(&assemble_tick_frames(&diff, &status(1)));
        assert!(evicted.is_empty());
        assert_eq!(set.len(), 2);

        // Tick k+1: still full, still attached.
        let evicted = set.broadcast_tick(&assemble_tick_frames(&diff, &status(2)));
        assert!(evicted.is_empty());

        // Tick k+2: disconnected.
        let evicted = set.broadcast_tick(&assemble_tick_frames(&diff, &status(3)));
        assert_eq!(evicted, vec![slow_id]);
        assert_eq!(set.len(), 1);

        // The healthy subscriber received all 12 frames across three ticks.
        let mut got = 0;
        while let Ok(frame) = healthy_rx.try_recv() {
            let _ = frame;
            got += 1;
        }
        assert_eq!(got, 12);
        assert!(set.remove(healthy_id));
    }

    #[tokio::test]
    async fn draining_resets_slow_marking() {
        let mut set = SubscriberSet::default();
        let (sub, mut rx) = Subscriber::new(2);
        set.add(sub);

        let big = ResultDiff {
            added: vec![result("A"), result("B"), result("C")],
            ..Default::default()
        };
        let small = ResultDiff::default();

        // Overflow once.
        set.broadcast_tick(&assemble_tick_frames(&big, &status(1)));
        // Client catches up.
        while rx.try_recv().is_ok() {}
        // A small tick succeeds and clears the slow strike.
        set.broadcast_tick(&assemble_tick_frames(&small, &status(2)));
        while rx.try_recv().is_ok() {}
        // Two more overflows are tolerated again before eviction.
        set.broadcast_tick(&assemble_tick_frames(&big, &status(3)));
        let evicted = set.broadcast_tick(&assemble_tick_frames(&big, &status(4)));
        assert!(evicted.is_empty());
        assert_eq!(set.len(), 1);
    }

    #[tokio::test]
    async fn closed_receiver_is_removed_immediately() {
        let mut set = SubscriberSet::default();
        let (sub, rx) = Subscriber::new(4);
        set.add(sub);
        drop(rx);

        let diff = ResultDiff {
            added: vec![result("A")],
            ..Default::default()
        };
        let evicted = set.broadcast_tick(&assemble_tick_frames(&diff, &status(1)));
        assert_eq!(evicted.len(), 1);
        assert!(set.is_empty());
    }
}
