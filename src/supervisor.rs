//! Stream supervisor: owns event subscriptions and reconnects with a
//! fixed backoff when a stream errors or closes. Missed events are not
//! replayed; every consumer converges from currently observed state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, warn};
use tokio_util::sync::CancellationToken;

use crate::orchestrator::Orchestrator;
use crate::types::{EventFilter, OrchestratorEvent};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Consumer of one event stream. A handler error abandons that event;
/// the stream keeps running.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: OrchestratorEvent) -> Result<()>;
}

pub struct StreamSupervisor {
    orchestrator: Arc<dyn Orchestrator>,
    reconnect_delay: Duration,
}

impl StreamSupervisor {
    pub fn new(orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self {
            orchestrator,
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    #[cfg(test)]
    fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Drive `handler` from a subscription with `filter` until
    /// cancelled. Events are handled serially, in arrival order.
    pub async fn run(
        &self,
        name: &str,
        filter: EventFilter,
        handler: Arc<dyn EventHandler>,
        cancel: CancellationToken,
    ) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let mut subscription = match self.orchestrator.subscribe(filter.clone()).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    error!("{name}: subscribe failed: {e:#}");
                    if !self.sleep_or_cancel(&cancel).await {
                        return;
                    }
                    continue;
                }
            };
            debug!("{name}: subscribed");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("{name}: stopping");
                        return;
                    }
                    error = subscription.errors.recv() => {
                        match error {
                            Some(e) => warn!("{name}: stream error, reconnecting: {e:#}"),
                            None => warn!("{name}: stream closed, reconnecting"),
                        }
                        break;
                    }
                    event = subscription.events.recv() => {
                        let Some(event) = event else {
                            warn!("{name}: event channel closed, reconnecting");
                            break;
                        };
                        if let Err(e) = handler.handle(event).await {
                            // Abandoned; the next reconciliation cycle
                            // converges.
                            error!("{name}: handler error: {e:#}");
                        }
                    }
                }
            }

            if !self.sleep_or_cancel(&cancel).await {
                return;
            }
        }
    }

    /// Fixed reconnect backoff. `false` when cancelled mid-sleep.
    async fn sleep_or_cancel(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.reconnect_delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::Subscription;
    use crate::types::{EventAction, RolloutReceipt, ServiceState};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{mpsc, Mutex};

    struct ScriptedOrchestrator {
        subscriptions: Mutex<VecDeque<Subscription>>,
        subscribe_count: AtomicUsize,
    }

    impl ScriptedOrchestrator {
        fn new(subscriptions: Vec<Subscription>) -> Self {
            Self {
                subscriptions: Mutex::new(subscriptions.into()),
                subscribe_count: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Orchestrator for ScriptedOrchestrator {
        async fn list_services(&self) -> Result<Vec<ServiceState>> {
            Ok(Vec::new())
        }

        async fn inspect_service(&self, _name: &str) -> Result<Option<ServiceState>> {
            Ok(None)
        }

        async fn subscribe(&self, _filter: EventFilter) -> Result<Subscription> {
            self.subscribe_count.fetch_add(1, Ordering::SeqCst);
            match self.subscriptions.lock().await.pop_front() {
                Some(subscription) => Ok(subscription),
                None => {
                    // Exhausted scripts behave like an immediately
                    // closed stream.
                    let (_, events) = mpsc::channel(1);
                    let (_, errors) = mpsc::channel(1);
                    Ok(Subscription { events, errors })
                }
            }
        }

        async fn update_service_image(&self, _: &str, _: &str) -> Result<RolloutReceipt> {
            unimplemented!("not used by the supervisor")
        }
    }

    struct Recorder {
        seen: Mutex<Vec<String>>,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: OrchestratorEvent) -> Result<()> {
            self.seen.lock().await.push(event.actor_id);
            self.cancel.cancel();
            Ok(())
        }
    }

    fn closed_subscription() -> Subscription {
        let (_, events) = mpsc::channel(1);
        let (_, errors) = mpsc::channel(1);
        Subscription { events, errors }
    }

    fn one_event_subscription(actor_id: &str) -> Subscription {
        let (event_tx, events) = mpsc::channel(1);
        let (error_tx, errors) = mpsc::channel(1);
        // Keep the error lane open so the pending event is delivered
        // before the stream reads as closed.
        std::mem::forget(error_tx);
        event_tx
            .try_send(OrchestratorEvent {
                action: EventAction::Update,
                actor_id: actor_id.to_string(),
                attributes: Default::default(),
                time: 0,
            })
            .unwrap();
        Subscription { events, errors }
    }

    #[tokio::test]
    async fn resubscribes_after_a_closed_stream() {
        let orchestrator = Arc::new(ScriptedOrchestrator::new(vec![
            closed_subscription(),
            one_event_subscription("api"),
        ]));
        let cancel = CancellationToken::new();
        let handler = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            cancel: cancel.clone(),
        });

        let supervisor = StreamSupervisor::new(orchestrator.clone())
            .with_reconnect_delay(Duration::from_millis(5));
        supervisor
            .run(
                "test stream",
                EventFilter::service_changes(),
                handler.clone(),
                cancel,
            )
            .await;

        assert_eq!(*handler.seen.lock().await, vec!["api".to_string()]);
        assert!(orchestrator.subscribe_count.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop_without_resubscribing() {
        let orchestrator = Arc::new(ScriptedOrchestrator::new(vec![]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let handler = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            cancel: cancel.clone(),
        });

        let supervisor = StreamSupervisor::new(orchestrator.clone());
        supervisor
            .run("test stream", EventFilter::service_removals(), handler, cancel)
            .await;

        assert_eq!(orchestrator.subscribe_count.load(Ordering::SeqCst), 0);
    }
}
