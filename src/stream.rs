//! Stream publisher - per-context ordered event log with live fan-out
//!
//! Every context gets an append-only log and a bounded broadcast channel.
//! Publishing appends and broadcasts under one short lock, so a subscriber
//! that snapshots the log and joins the channel sees each event exactly once.
//! Slow subscribers lose the oldest events rather than stalling producers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{Result, TroupeError};
use crate::task::TaskState;
use crate::types::{Artifact, ContextId, TaskId};

/// Default number of events buffered per subscriber
pub const DEFAULT_STREAM_CAPACITY: usize = 256;

/// Event emitted for one context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A task changed state
    TaskStatusUpdate {
        context_id: ContextId,
        task_id: TaskId,
        /// Set for the team's coordination task
        coordination: bool,
        /// `None` for the task's creation
        previous_state: Option<TaskState>,
        current_state: TaskState,
        message: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// A task produced a partial or final artifact
    ArtifactUpdate {
        context_id: ContextId,
        task_id: TaskId,
        artifact: Artifact,
        timestamp: DateTime<Utc>,
    },
}

impl StreamEvent {
    pub fn context_id(&self) -> ContextId {
        match self {
            StreamEvent::TaskStatusUpdate { context_id, .. }
            | StreamEvent::ArtifactUpdate { context_id, .. } => *context_id,
        }
    }

    pub fn task_id(&self) -> TaskId {
        match self {
            StreamEvent::TaskStatusUpdate { task_id, .. }
            | StreamEvent::ArtifactUpdate { task_id, .. } => *task_id,
        }
    }

    /// Whether this event ends the context's stream
    pub fn closes_stream(&self) -> bool {
        matches!(
            self,
            StreamEvent::TaskStatusUpdate {
                coordination: true,
                current_state,
                ..
            } if current_state.is_terminal()
        )
    }
}

struct ContextLog {
    events: Vec<StreamEvent>,
    sender: broadcast::Sender<StreamEvent>,
    closed: bool,
}

impl ContextLog {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            events: Vec::new(),
            sender,
            closed: false,
        }
    }
}

/// Fan-out of task events to per-context subscribers
#[derive(Clone)]
pub struct StreamPublisher {
    logs: Arc<Mutex<HashMap<ContextId, ContextLog>>>,
    capacity: usize,
}

impl StreamPublisher {
    /// Create a publisher buffering `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        Self {
            logs: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Append an event to its context's log and notify subscribers
    ///
    /// Never blocks on subscribers. An event for a closed stream is dropped
    /// and reported as [`TroupeError::StreamClosed`].
    pub fn publish(&self, event: StreamEvent) -> Result<()> {
        let context_id = event.context_id();
        let closes = event.closes_stream();

        let mut logs = self.logs.lock();
        let log = logs
            .entry(context_id)
            .or_insert_with(|| ContextLog::new(self.capacity));

        if log.closed {
            warn!(context_id = %context_id, "Dropping event for closed stream");
            return Err(TroupeError::StreamClosed(context_id));
        }

        log.events.push(event.clone());
        // No receivers is fine
        let receivers = log.sender.send(event).unwrap_or(0);
        if closes {
            log.closed = true;
        }
        drop(logs);

        debug!(context_id = %context_id, receivers, closes, "Published event");
        Ok(())
    }

    /// Subscribe to a context's events
    ///
    /// Events already in the log are replayed first, then live events follow.
    /// The subscription ends after the coordination task's terminal event.
    pub fn subscribe(&self, context_id: ContextId) -> Subscription {
        let mut logs = self.logs.lock();
        let log = logs
            .entry(context_id)
            .or_insert_with(|| ContextLog::new(self.capacity));

        let backlog: VecDeque<StreamEvent> = log.events.iter().cloned().collect();
        let receiver = if log.closed {
            None
        } else {
            Some(log.sender.subscribe())
        };

        Subscription {
            context_id,
            backlog,
            receiver,
            finished: false,
            missed: 0,
        }
    }

    /// Everything published for a context so far
    pub fn history(&self, context_id: &ContextId) -> Vec<StreamEvent> {
        self.logs
            .lock()
            .get(context_id)
            .map(|log| log.events.clone())
            .unwrap_or_default()
    }

    pub fn is_closed(&self, context_id: &ContextId) -> bool {
        self.logs
            .lock()
            .get(context_id)
            .map(|log| log.closed)
            .unwrap_or(false)
    }

    /// Contexts whose stream is still open
    pub fn open_contexts(&self) -> Vec<ContextId> {
        self.logs
            .lock()
            .iter()
            .filter(|(_, log)| !log.closed)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn subscriber_count(&self, context_id: &ContextId) -> usize {
        self.logs
            .lock()
            .get(context_id)
            .map(|log| log.sender.receiver_count())
            .unwrap_or(0)
    }

    /// Drop a context's log
    pub fn forget(&self, context_id: &ContextId) -> bool {
        self.logs.lock().remove(context_id).is_some()
    }
}

impl Default for StreamPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_CAPACITY)
    }
}

/// Ordered event feed for one context
pub struct Subscription {
    context_id: ContextId,
    backlog: VecDeque<StreamEvent>,
    receiver: Option<broadcast::Receiver<StreamEvent>>,
    finished: bool,
    missed: u64,
}

impl Subscription {
    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    /// Events dropped because this subscriber fell behind
    pub fn missed(&self) -> u64 {
        self.missed
    }

    /// Next event, or `None` once the stream has ended
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }

        if let Some(event) = self.backlog.pop_front() {
            return Some(self.observe(event));
        }

        let receiver = match self.receiver.as_mut() {
            Some(receiver) => receiver,
            None => {
                self.finished = true;
                return None;
            }
        };

        let mut missed = 0;
        let next = loop {
            match receiver.recv().await {
                Ok(event) => break Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(context_id = %self.context_id, missed = n, "Subscriber lagged");
                    missed += n;
                }
                Err(broadcast::error::RecvError::Closed) => break None,
            }
        };
        self.missed += missed;

        match next {
            Some(event) => Some(self.observe(event)),
            None => {
                self.finished = true;
                None
            }
        }
    }

    fn observe(&mut self, event: StreamEvent) -> StreamEvent {
        if event.closes_stream() {
            self.finished = true;
            self.receiver = None;
        }
        event
    }

    /// Collect every remaining event until the stream ends
    pub async fn collect(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            events.push(event);
        }
        events
    }

    /// Adapt into a [`futures::Stream`]
    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn status(
        context_id: ContextId,
        task_id: TaskId,
        coordination: bool,
        previous: Option<TaskState>,
        current: TaskState,
    ) -> StreamEvent {
        StreamEvent::TaskStatusUpdate {
            context_id,
            task_id,
            coordination,
            previous_state: previous,
            current_state: current,
            message: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_then_subscribe_replays_log() {
        let publisher = StreamPublisher::default();
        let ctx = ContextId::new();
        let task = TaskId::new();

        publisher.publish(status(ctx, task, false, None, TaskState::Submitted)).unwrap();
        publisher.publish(status(ctx, task, false, Some(TaskState::Submitted), TaskState::Working)).unwrap();

        let mut sub = publisher.subscribe(ctx);
        let first = sub.recv().await.unwrap();
        assert!(matches!(
            first,
            StreamEvent::TaskStatusUpdate { current_state: TaskState::Submitted, .. }
        ));
        let second = sub.recv().await.unwrap();
        assert!(matches!(
            second,
            StreamEvent::TaskStatusUpdate { current_state: TaskState::Working, .. }
        ));
    }

    #[tokio::test]
    async fn test_stream_ends_on_coordination_terminal() {
        let publisher = StreamPublisher::default();
        let ctx = ContextId::new();
        let coord = TaskId::new();
        let member = TaskId::new();

        let sub = publisher.subscribe(ctx);

        publisher.publish(status(ctx, coord, true, None, TaskState::Submitted)).unwrap();
        publisher.publish(status(ctx, member, false, Some(TaskState::Working), TaskState::Completed)).unwrap();
        publisher.publish(status(ctx, coord, true, Some(TaskState::Working), TaskState::Completed)).unwrap();
        assert!(publisher.is_closed(&ctx));

        // Dropped after close
        assert!(matches!(
            publisher.publish(status(ctx, member, false, None, TaskState::Submitted)),
            Err(TroupeError::StreamClosed(_))
        ));

        let events = sub.collect().await;
        assert_eq!(events.len(), 3);
        assert!(events.last().unwrap().closes_stream());
    }

    #[tokio::test]
    async fn test_member_terminal_does_not_close() {
        let publisher = StreamPublisher::default();
        let ctx = ContextId::new();
        publisher.publish(status(ctx, TaskId::new(), false, Some(TaskState::Working), TaskState::Failed)).unwrap();
        assert!(!publisher.is_closed(&ctx));
        assert_eq!(publisher.open_contexts(), vec![ctx]);
    }

    #[tokio::test]
    async fn test_subscribe_after_close_yields_backlog_then_ends() {
        let publisher = StreamPublisher::default();
        let ctx = ContextId::new();
        let coord = TaskId::new();
        publisher.publish(status(ctx, coord, true, None, TaskState::Submitted)).unwrap();
        publisher.publish(status(ctx, coord, true, Some(TaskState::Submitted), TaskState::Cancelled)).unwrap();

        let events = publisher.subscribe(ctx).collect().await;
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_contexts_are_isolated() {
        let publisher = StreamPublisher::default();
        let a = ContextId::new();
        let b = ContextId::new();
        publisher.publish(status(a, TaskId::new(), false, None, TaskState::Submitted)).unwrap();

        assert_eq!(publisher.history(&a).len(), 1);
        assert!(publisher.history(&b).is_empty());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_does_not_block_publisher() {
        let publisher = StreamPublisher::new(4);
        let ctx = ContextId::new();
        let task = TaskId::new();
        let mut sub = publisher.subscribe(ctx);

        for _ in 0..20 {
            publisher.publish(status(ctx, task, false, None, TaskState::Working)).unwrap();
        }
        publisher.publish(status(ctx, task, true, None, TaskState::Completed)).unwrap();

        let mut received = 0;
        while sub.recv().await.is_some() {
            received += 1;
        }
        assert!(received <= 4);
        assert!(sub.missed() > 0);
        assert_eq!(publisher.history(&ctx).len(), 21);
    }

    #[tokio::test]
    async fn test_into_stream() {
        let publisher = StreamPublisher::default();
        let ctx = ContextId::new();
        let coord = TaskId::new();
        publisher.publish(status(ctx, coord, true, None, TaskState::Submitted)).unwrap();
        publisher.publish(status(ctx, coord, true, Some(TaskState::Working), TaskState::Failed)).unwrap();

        let events: Vec<StreamEvent> = publisher.subscribe(ctx).into_stream().collect().await;
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = status(ContextId::new(), TaskId::new(), false, None, TaskState::Submitted);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_status_update");
        assert_eq!(json["current_state"], "submitted");
    }
}
