use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use data_model::{ControlAck, DrainState, InvocationId};
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, info};

const TRANSITION_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed,
    TimedOut { remaining: usize },
    NotDraining,
}

struct DrainBook {
    state: DrainState,
    in_flight: HashSet<InvocationId>,
    // bumped on every drain() so a stale completion task exits quietly
    drain_generation: u64,
}

struct DrainInner {
    book: Mutex<DrainBook>,
    state_tx: watch::Sender<DrainState>,
    transitions_tx: broadcast::Sender<DrainState>,
    released: Notify,
}

impl DrainInner {
    fn book(&self) -> MutexGuard<'_, DrainBook> {
        self.book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Callers hold the book lock so observers see transitions in order.
    fn publish(&self, state: DrainState) {
        self.state_tx.send_replace(state);
        let _ = self.transitions_tx.send(state);
    }
}

/// Tracks in-flight drain-aware invocations and moves
/// Disabled -> InProgress -> Completed -> Disabled.
#[derive(Clone)]
pub struct DrainModeController {
    inner: Arc<DrainInner>,
}

impl Default for DrainModeController {
    fn default() -> Self {
        Self::new()
    }
}

impl DrainModeController {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(DrainState::Disabled);
        let (transitions_tx, _) = broadcast::channel(TRANSITION_BUFFER);
        Self {
            inner: Arc::new(DrainInner {
                book: Mutex::new(DrainBook {
                    state: DrainState::Disabled,
                    in_flight: HashSet::new(),
                    drain_generation: 0,
                }),
                state_tx,
                transitions_tx,
                released: Notify::new(),
            }),
        }
    }

    pub fn state(&self) -> DrainState {
        *self.inner.state_tx.borrow()
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.book().in_flight.len()
    }

    /// Every transition in order, starting after the call.
    pub fn subscribe(&self) -> broadcast::Receiver<DrainState> {
        self.inner.transitions_tx.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<DrainState> {
        self.inner.state_tx.subscribe()
    }

    /// Stops admitting drain-aware invocations. Returns at once; the move to
    /// Completed happens in the background once nothing is in flight.
    pub fn drain(&self) -> ControlAck {
        let generation = {
            let mut book = self.inner.book();
            match book.state {
                DrainState::InProgress => return ControlAck::AlreadyInProgress,
                DrainState::Completed => {
                    return ControlAck::rejected("drain already completed, resume first");
                }
                DrainState::Disabled => {}
            }
            book.state = DrainState::InProgress;
            book.drain_generation += 1;
            self.inner.publish(DrainState::InProgress);
            info!(in_flight = book.in_flight.len(), "drain mode enabled");
            book.drain_generation
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            // let pollers observe InProgress even with nothing in flight
            tokio::task::yield_now().await;
            loop {
                let released = inner.released.notified();
                tokio::pin!(released);
                released.as_mut().enable();
                {
                    let mut book = inner.book();
                    if book.state != DrainState::InProgress || book.drain_generation != generation {
                        return;
                    }
                    if book.in_flight.is_empty() {
                        book.state = DrainState::Completed;
                        inner.publish(DrainState::Completed);
                        info!("drain completed, no invocations in flight");
                        return;
                    }
                }
                released.await;
            }
        });
        ControlAck::Accepted
    }

    /// Lifts drain mode. Refused while a drain is still in progress.
    pub fn resume(&self) -> ControlAck {
        let mut book = self.inner.book();
        match book.state {
            DrainState::InProgress => ControlAck::rejected("drain is still in progress"),
            DrainState::Disabled => ControlAck::Accepted,
            DrainState::Completed => {
                book.state = DrainState::Disabled;
                self.inner.publish(DrainState::Disabled);
                info!("drain mode disabled");
                ControlAck::Accepted
            }
        }
    }

    /// Returns false when a drain-aware invocation arrives during a drain.
    /// Drain-unaware invocations are always let through and not counted.
    pub fn try_admit(&self, id: &InvocationId, drain_aware: bool) -> bool {
        if !drain_aware {
            return true;
        }
        let mut book = self.inner.book();
        if book.state != DrainState::Disabled {
            debug!(invocation_id = %id, state = %book.state, "refusing invocation while draining");
            return false;
        }
        book.in_flight.insert(id.clone());
        true
    }

    /// Releasing an id that is not in flight is a no-op.
    pub fn release(&self, id: &InvocationId) {
        let mut book = self.inner.book();
        if !book.in_flight.remove(id) {
            return;
        }
        if book.in_flight.is_empty() && book.state == DrainState::InProgress {
            book.state = DrainState::Completed;
            self.inner.publish(DrainState::Completed);
            info!("drain completed, last in-flight invocation finished");
        }
        drop(book);
        self.inner.released.notify_waiters();
    }

    /// RAII form of `try_admit`/`release`.
    pub fn admit(&self, id: &InvocationId, drain_aware: bool) -> Option<AdmissionGuard> {
        if !self.try_admit(id, drain_aware) {
            return None;
        }
        Some(AdmissionGuard {
            controller: self.clone(),
            id: drain_aware.then(|| id.clone()),
        })
    }

    pub async fn wait_for_completion(&self, timeout: Duration) -> DrainOutcome {
        let mut state_rx = self.watch();
        if *state_rx.borrow() == DrainState::Disabled {
            return DrainOutcome::NotDraining;
        }
        let done = state_rx.wait_for(|s| *s != DrainState::InProgress);
        let outcome = match tokio::time::timeout(timeout, done).await {
            Ok(Ok(_)) => DrainOutcome::Completed,
            Ok(Err(_)) => DrainOutcome::NotDraining,
            Err(_) => DrainOutcome::TimedOut {
                remaining: self.in_flight_count(),
            },
        };
        outcome
    }
}

pub struct AdmissionGuard {
    controller: DrainModeController,
    id: Option<InvocationId>,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.controller.release(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> InvocationId {
        InvocationId::from(s)
    }

    #[tokio::test]
    async fn test_drain_with_nothing_in_flight_passes_through_in_progress() {
        let drain = DrainModeController::new();
        let mut transitions = drain.subscribe();

        assert_eq!(drain.drain(), ControlAck::Accepted);
        // observable before the background task runs
        assert_eq!(drain.state(), DrainState::InProgress);

        assert_eq!(transitions.recv().await.unwrap(), DrainState::InProgress);
        assert_eq!(transitions.recv().await.unwrap(), DrainState::Completed);
        assert_eq!(drain.state(), DrainState::Completed);

        // a finished drain is not restarted until resumed
        assert!(matches!(drain.drain(), ControlAck::Rejected { .. }));
        assert_eq!(drain.state(), DrainState::Completed);
        assert_eq!(drain.resume(), ControlAck::Accepted);
        assert_eq!(drain.drain(), ControlAck::Accepted);
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight() {
        let drain = DrainModeController::new();
        assert!(drain.try_admit(&id("a"), true));
        assert!(drain.try_admit(&id("b"), true));

        let mut transitions = drain.subscribe();
        assert_eq!(drain.drain(), ControlAck::Accepted);
        assert_eq!(drain.drain(), ControlAck::AlreadyInProgress);
        assert_eq!(transitions.recv().await.unwrap(), DrainState::InProgress);

        // new drain-aware work is refused, drain-unaware work is not
        assert!(!drain.try_admit(&id("c"), true));
        assert!(drain.try_admit(&id("timer"), false));
        assert_eq!(drain.in_flight_count(), 2);

        drain.release(&id("a"));
        tokio::task::yield_now().await;
        assert_eq!(drain.state(), DrainState::InProgress);

        drain.release(&id("b"));
        assert_eq!(transitions.recv().await.unwrap(), DrainState::Completed);
        assert_eq!(drain.in_flight_count(), 0);
        assert!(!drain.try_admit(&id("d"), true));
    }

    #[tokio::test]
    async fn test_resume_only_after_completion() {
        let drain = DrainModeController::new();
        assert_eq!(drain.resume(), ControlAck::Accepted);

        assert!(drain.try_admit(&id("a"), true));
        drain.drain();
        assert!(matches!(drain.resume(), ControlAck::Rejected { .. }));

        drain.release(&id("a"));
        assert_eq!(
            drain.wait_for_completion(Duration::from_secs(1)).await,
            DrainOutcome::Completed
        );
        assert_eq!(drain.resume(), ControlAck::Accepted);
        assert_eq!(drain.state(), DrainState::Disabled);
        assert!(drain.try_admit(&id("b"), true));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let drain = DrainModeController::new();
        assert!(drain.try_admit(&id("a"), true));
        drain.release(&id("a"));
        drain.release(&id("a"));
        drain.release(&id("never-admitted"));
        assert_eq!(drain.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_completion_times_out() {
        let drain = DrainModeController::new();
        assert_eq!(
            drain.wait_for_completion(Duration::from_secs(1)).await,
            DrainOutcome::NotDraining
        );
        let _guard = drain.admit(&id("long"), true).unwrap();
        drain.drain();
        assert_eq!(
            drain.wait_for_completion(Duration::from_secs(5)).await,
            DrainOutcome::TimedOut { remaining: 1 }
        );
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let drain = DrainModeController::new();
        {
            let _guard = drain.admit(&id("a"), true).unwrap();
            assert_eq!(drain.in_flight_count(), 1);
        }
        assert_eq!(drain.in_flight_count(), 0);

        let _unaware = drain.admit(&id("t"), false).unwrap();
        assert_eq!(drain.in_flight_count(), 0);
    }
}
