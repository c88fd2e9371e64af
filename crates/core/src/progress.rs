use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(16);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ProgressState {
    #[default]
    Idle,
    Running {
        percent: u8,
        message: String,
    },
    Failed {
        message: String,
    },
}

impl ProgressState {
    pub fn running(percent: u8, message: impl Into<String>) -> Self {
        Self::Running {
            percent: percent.min(100),
            message: message.into(),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    pub fn percent(&self) -> Option<u8> {
        match self {
            Self::Running { percent, .. } => Some(*percent),
            _ => None,
        }
    }
}

/// Synchronous observer of every published state.
///
/// `on_progress` may publish to the channel it is registered on. It must not
/// call `add_sink` or `remove_sink` on that channel while it is receiving the
/// replayed state inside `add_sink`.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: &ProgressState);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkId(u64);

#[derive(Default)]
struct Sinks {
    next_id: u64,
    entries: Vec<(SinkId, Arc<dyn ProgressSink>)>,
}

/// Replay-latest progress cell. Async subscribers see the newest state;
/// sinks see every published state.
pub struct ProgressChannel {
    tx: watch::Sender<ProgressState>,
    sinks: Mutex<Sinks>,
}

impl Default for ProgressChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProgressChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressChannel")
            .field("current", &*self.tx.borrow())
            .finish_non_exhaustive()
    }
}

impl ProgressChannel {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ProgressState::Idle);
        Self {
            tx,
            sinks: Mutex::new(Sinks::default()),
        }
    }

    pub fn current(&self) -> ProgressState {
        self.tx.borrow().clone()
    }

    pub fn publish(&self, state: ProgressState) {
        let sinks: Vec<Arc<dyn ProgressSink>> = {
            let sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
            self.tx.send_replace(state.clone());
            sinks.entries.iter().map(|(_, s)| s.clone()).collect()
        };
        for sink in sinks {
            sink.on_progress(&state);
        }
    }

    pub fn subscribe(&self) -> ProgressSubscription {
        let mut rx = self.tx.subscribe();
        rx.mark_changed();
        ProgressSubscription { rx }
    }

    /// Registers `sink`; it receives the current state right away.
    pub fn add_sink(&self, sink: Arc<dyn ProgressSink>) -> SinkId {
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        let id = SinkId(sinks.next_id);
        sinks.next_id += 1;
        sink.on_progress(&self.tx.borrow());
        sinks.entries.push((id, sink));
        id
    }

    pub fn remove_sink(&self, id: SinkId) -> bool {
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        let before = sinks.entries.len();
        sinks.entries.retain(|(sid, _)| *sid != id);
        sinks.entries.len() != before
    }
}

pub struct ProgressSubscription {
    rx: watch::Receiver<ProgressState>,
}

impl ProgressSubscription {
    /// The current state on first call, then the latest state after each
    /// change. `None` once the channel is gone.
    pub async fn next(&mut self) -> Option<ProgressState> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

/// Forwards states to `inner`, dropping repeats of the last forwarded state
/// and `Running` states that arrive less than `every` after the previous
/// forwarded `Running` state. `Idle` and `Failed` are never dropped unless
/// repeated.
pub struct SampledSink {
    inner: Arc<dyn ProgressSink>,
    every: Duration,
    last: Mutex<Sampled>,
}

#[derive(Default)]
struct Sampled {
    state: Option<ProgressState>,
    running_at: Option<Instant>,
}

impl SampledSink {
    pub fn new(inner: Arc<dyn ProgressSink>, every: Duration) -> Self {
        Self {
            inner,
            every,
            last: Mutex::new(Sampled::default()),
        }
    }
}

impl ProgressSink for SampledSink {
    fn on_progress(&self, progress: &ProgressState) {
        {
            let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
            if last.state.as_ref() == Some(progress) {
                return;
            }
            if progress.is_running() {
                let now = Instant::now();
                if let Some(at) = last.running_at
                    && now.duration_since(at) < self.every
                {
                    return;
                }
                last.running_at = Some(now);
            }
            last.state = Some(progress.clone());
        }
        self.inner.on_progress(progress);
    }
}

/// Sink that records every state; handy for assertions.
#[derive(Debug, Default)]
pub struct RecordingSink {
    states: Mutex<Vec<ProgressState>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn states(&self) -> Vec<ProgressState> {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl ProgressSink for RecordingSink {
    fn on_progress(&self, progress: &ProgressState) {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(progress.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_subscriber_gets_latest_state_first() {
        let channel = ProgressChannel::new();
        channel.publish(ProgressState::running(10, "a"));
        channel.publish(ProgressState::running(20, "b"));

        let mut sub = channel.subscribe();
        assert_eq!(sub.next().await, Some(ProgressState::running(20, "b")));

        channel.publish(ProgressState::Idle);
        assert_eq!(sub.next().await, Some(ProgressState::Idle));
    }

    #[tokio::test]
    async fn subscription_ends_when_channel_dropped() {
        let channel = ProgressChannel::new();
        let mut sub = channel.subscribe();
        assert_eq!(sub.next().await, Some(ProgressState::Idle));
        drop(channel);
        assert_eq!(sub.next().await, None);
    }

    #[test]
    fn sink_replays_current_then_follows_until_removed() {
        let channel = ProgressChannel::new();
        channel.publish(ProgressState::running(5, "x"));

        let sink = Arc::new(RecordingSink::new());
        let id = channel.add_sink(sink.clone());
        channel.publish(ProgressState::Idle);
        assert!(channel.remove_sink(id));
        channel.publish(ProgressState::running(1, "ignored"));

        assert_eq!(
            sink.states(),
            vec![ProgressState::running(5, "x"), ProgressState::Idle]
        );
        assert!(!channel.remove_sink(id));
    }

    #[test]
    fn running_percent_is_clamped() {
        assert_eq!(ProgressState::running(150, "m").percent(), Some(100));
        assert_eq!(ProgressState::Idle.percent(), None);
    }

    #[test]
    fn state_serializes_tagged() {
        let v = serde_json::to_value(ProgressState::running(42, "m")).unwrap();
        assert_eq!(
            v,
            serde_json::json!({ "state": "running", "percent": 42, "message": "m" })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sampled_sink_throttles_running_and_keeps_terminal_states() {
        let channel = ProgressChannel::new();
        let recorder = Arc::new(RecordingSink::new());
        channel.add_sink(Arc::new(SampledSink::new(
            recorder.clone(),
            DEFAULT_SAMPLE_INTERVAL,
        )));

        channel.publish(ProgressState::Idle);
        channel.publish(ProgressState::running(10, "a"));
        channel.publish(ProgressState::running(20, "b"));
        tokio::time::advance(Duration::from_millis(20)).await;
        channel.publish(ProgressState::running(30, "c"));
        channel.publish(ProgressState::Failed {
            message: "boom".to_string(),
        });
        channel.publish(ProgressState::Failed {
            message: "boom".to_string(),
        });
        channel.publish(ProgressState::Idle);

        assert_eq!(
            recorder.states(),
            vec![
                ProgressState::Idle,
                ProgressState::running(10, "a"),
                ProgressState::running(30, "c"),
                ProgressState::Failed {
                    message: "boom".to_string()
                },
                ProgressState::Idle,
            ]
        );
    }

    struct ResetOnFailure {
        channel: std::sync::Weak<ProgressChannel>,
    }

    impl ProgressSink for ResetOnFailure {
        fn on_progress(&self, progress: &ProgressState) {
            if matches!(progress, ProgressState::Failed { .. })
                && let Some(channel) = self.channel.upgrade()
            {
                channel.publish(ProgressState::Idle);
            }
        }
    }

    #[test]
    fn sink_can_publish_from_on_progress() {
        let channel = Arc::new(ProgressChannel::new());
        let recorder = Arc::new(RecordingSink::new());
        channel.add_sink(recorder.clone());
        channel.add_sink(Arc::new(ResetOnFailure {
            channel: Arc::downgrade(&channel),
        }));

        channel.publish(ProgressState::Failed {
            message: "x".to_string(),
        });

        assert_eq!(channel.current(), ProgressState::Idle);
        assert_eq!(
            recorder.states(),
            vec![
                ProgressState::Idle,
                ProgressState::Failed {
                    message: "x".to_string()
                },
                ProgressState::Idle,
            ]
        );
    }
}
