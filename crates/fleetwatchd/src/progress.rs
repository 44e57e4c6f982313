//! Progress fan-out.
//!
//! Local observers are called synchronously, in registration order, on the
//! publishing task. Remote delivery goes through a bounded broadcast channel
//! drained by a forwarder task; when the remote side falls behind the oldest
//! events are dropped. There is no replay: a subscriber only sees events
//! published after it subscribed.

use crate::error::SinkError;
use async_trait::async_trait;
use fleetwatch_common::ProgressEvent;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Synchronous in-process observer (UI stream, logs, tests).
///
/// Called while the manager holds its emit lock: an observer must return
/// promptly and must not call back into the manager (`cancel()` from here
/// deadlocks).
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);
}

/// Best-effort delivery to the server channel.
#[async_trait]
pub trait RemoteProgressSink: Send + Sync {
    async fn send_progress(&self, event: &ProgressEvent) -> Result<(), SinkError>;
}

pub struct ProgressHub {
    observers: RwLock<Vec<Arc<dyn ProgressObserver>>>,
    remote: broadcast::Sender<ProgressEvent>,
}

impl ProgressHub {
    /// `buffer` is the remote queue depth.
    pub fn new(buffer: usize) -> Self {
        let (remote, _) = broadcast::channel(buffer.max(1));
        Self {
            observers: RwLock::new(Vec::new()),
            remote,
        }
    }

    pub fn register(&self, observer: Arc<dyn ProgressObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    /// Async stream of future events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.remote.subscribe()
    }

    /// Deliver one event to every observer and queue it for remote sinks.
    pub fn publish(&self, event: ProgressEvent) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for observer in &observers {
            observer.on_progress(&event);
        }

        // No receivers is fine: nobody is listening remotely yet.
        let _ = self.remote.send(event);
    }

    /// Forward events to `sink` until `shutdown` fires.
    pub fn spawn_forwarder(
        &self,
        sink: Arc<dyn RemoteProgressSink>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = rx.recv() => received,
                };
                match event {
                    Ok(event) => {
                        if let Err(e) = sink.send_progress(&event).await {
                            warn!("Failed to deliver progress event ({}): {}", event.status, e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Remote progress sink lagging, dropped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Progress forwarder stopped");
        })
    }
}

/// Observer that writes each event to the log.
pub struct LogObserver;

impl ProgressObserver for LogObserver {
    fn on_progress(&self, event: &ProgressEvent) {
        match &event.error {
            Some(error) => warn!(
                "update {}: {} ({})",
                event.status, event.message, error
            ),
            None if event.status.is_terminal() => {
                info!("update {}: {}", event.status, event.message)
            }
            None if event.progress >= 0 => debug!(
                "update {} {}%: {}",
                event.status, event.progress, event.message
            ),
            None => debug!("update {}: {}", event.status, event.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetwatch_common::UpdateStatus;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<UpdateStatus>>);

    impl ProgressObserver for Recorder {
        fn on_progress(&self, event: &ProgressEvent) {
            self.0.lock().unwrap().push(event.status);
        }
    }

    struct ChannelSink(mpsc::UnboundedSender<ProgressEvent>);

    #[async_trait]
    impl RemoteProgressSink for ChannelSink {
        async fn send_progress(&self, event: &ProgressEvent) -> Result<(), SinkError> {
            self.0.send(event.clone()).map_err(|_| SinkError::Closed)
        }
    }

    struct BrokenSink;

    #[async_trait]
    impl RemoteProgressSink for BrokenSink {
        async fn send_progress(&self, _event: &ProgressEvent) -> Result<(), SinkError> {
            Err(SinkError::Delivery("socket closed".into()))
        }
    }

    #[test]
    fn test_local_observers_are_synchronous() {
        let hub = ProgressHub::new(8);
        let recorder = Arc::new(Recorder::default());
        hub.register(recorder.clone());

        hub.publish(ProgressEvent::new(UpdateStatus::Checking, "Checking"));
        hub.publish(ProgressEvent::new(UpdateStatus::UpToDate, "Up to date"));

        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![UpdateStatus::Checking, UpdateStatus::UpToDate]
        );
    }

    #[test]
    fn test_late_subscriber_sees_only_future_events() {
        let hub = ProgressHub::new(8);
        hub.publish(ProgressEvent::new(UpdateStatus::Checking, "before"));

        let mut rx = hub.subscribe();
        assert!(rx.try_recv().is_err());

        hub.publish(ProgressEvent::new(UpdateStatus::UpToDate, "after"));
        assert_eq!(rx.try_recv().unwrap().message, "after");
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let hub = ProgressHub::new(2);
        let mut rx = hub.subscribe();
        for i in 0..5 {
            hub.publish(ProgressEvent::new(UpdateStatus::Downloading, i.to_string()));
        }

        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(3))
        ));
        assert_eq!(rx.try_recv().unwrap().message, "3");
        assert_eq!(rx.try_recv().unwrap().message, "4");
    }

    #[tokio::test]
    async fn test_forwarder_delivers_and_stops() {
        let hub = ProgressHub::new(8);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = hub.spawn_forwarder(Arc::new(ChannelSink(tx)), shutdown.clone());

        hub.publish(ProgressEvent::new(UpdateStatus::Checking, "Checking"));
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.status, UpdateStatus::Checking);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_forwarder_survives_sink_failure() {
        let hub = ProgressHub::new(8);
        let shutdown = CancellationToken::new();
        let handle = hub.spawn_forwarder(Arc::new(BrokenSink), shutdown.clone());

        hub.publish(ProgressEvent::new(UpdateStatus::Failed, "boom"));
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
