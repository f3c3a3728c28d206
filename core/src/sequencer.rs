use crate::error::{RemoteError, Result};
use crate::vm::RemoteVmState;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencerState {
    pub current: RemoteVmState,
    pub in_flight: bool,
    /// Host push received while an operation was running.
    pub pending_remote: Option<RemoteVmState>,
}

/// Serializes state-changing operations against one remote VM and merges host pushes.
///
/// At most one body runs at a time. Bodies run on their own task, so cancelling a caller
/// only abandons the wait; an operation that has started always finishes and settles state.
#[derive(Clone)]
pub struct OperationSequencer {
    operation: Arc<Mutex<()>>,
    state: Arc<watch::Sender<SequencerState>>,
}

impl OperationSequencer {
    pub fn new(initial: RemoteVmState) -> Self {
        Self {
            operation: Arc::new(Mutex::new(())),
            state: Arc::new(watch::Sender::new(SequencerState {
                current: initial,
                in_flight: false,
                pending_remote: None,
            })),
        }
    }

    pub fn state(&self) -> SequencerState {
        *self.state.borrow()
    }

    pub fn current(&self) -> RemoteVmState {
        self.state.borrow().current
    }

    pub fn subscribe(&self) -> watch::Receiver<SequencerState> {
        self.state.subscribe()
    }

    /// Run `body` as the only in-flight operation.
    ///
    /// The state is `transitional` while it runs, then `postcondition` (or the prior state when
    /// `None`) on success and the prior state on failure. A host push buffered meanwhile
    /// replaces either outcome.
    pub async fn perform<F, Fut, T>(
        &self,
        precondition: Option<&[RemoteVmState]>,
        transitional: RemoteVmState,
        postcondition: Option<RemoteVmState>,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.operation.clone().lock_owned().await;

        let mut checked = Ok(transitional);
        self.state.send_if_modified(|s| {
            if let Some(allowed) = precondition {
                if !allowed.contains(&s.current) {
                    checked = Err(if s.current.is_transitional() {
                        RemoteError::OperationInProgress(s.current)
                    } else {
                        RemoteError::IllegalTransition {
                            from: s.current,
                            to: transitional,
                        }
                    });
                    return false;
                }
            }
            checked = Ok(s.current);
            s.in_flight = true;
            s.pending_remote = None;
            s.current = transitional;
            true
        });
        let prior = checked?;
        debug!("Operation {} -> {}", prior, transitional);

        let settle = Settle {
            state: self.state.clone(),
            fallback: prior,
        };
        let task = tokio::spawn(async move {
            let mut settle = settle;
            let result = body().await;
            if result.is_ok() {
                settle.fallback = postcondition.unwrap_or(prior);
            }
            drop(settle);
            drop(guard);
            result
        });

        match task.await {
            Ok(result) => result,
            Err(e) => Err(RemoteError::Protocol(format!("Operation task failed: {}", e))),
        }
    }

    /// Apply an authoritative host push, or hold it until the running operation ends.
    pub fn apply_remote_state(&self, state: RemoteVmState) {
        self.state.send_modify(|s| {
            if s.in_flight {
                trace!("Buffering remote state {}", state);
                s.pending_remote = Some(state);
            } else {
                s.current = state;
            }
        });
    }
}

/// Leaves the operation window on drop, including when the body panics.
struct Settle {
    state: Arc<watch::Sender<SequencerState>>,
    fallback: RemoteVmState,
}

impl Drop for Settle {
    fn drop(&mut self) {
        let fallback = self.fallback;
        self.state.send_modify(|s| {
            s.current = s.pending_remote.take().unwrap_or(fallback);
            s.in_flight = false;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    use RemoteVmState::*;

    #[tokio::test]
    async fn test_successful_operation_reaches_postcondition() {
        let seq = OperationSequencer::new(Stopped);
        let value = seq
            .perform(Some(&[Stopped]), Starting, Some(Started), || async { Ok(7) })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(
            seq.state(),
            SequencerState {
                current: Started,
                in_flight: false,
                pending_remote: None
            }
        );
    }

    #[tokio::test]
    async fn test_no_postcondition_returns_to_prior() {
        let seq = OperationSequencer::new(Paused);
        seq.perform(Some(&[Started, Paused]), Saving, None, || async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(seq.current(), Paused);
    }

    #[tokio::test]
    async fn test_failure_restores_prior_state() {
        let seq = OperationSequencer::new(Started);
        let result: Result<()> = seq
            .perform(Some(&[Started]), Pausing, Some(Paused), || async {
                Err(RemoteError::Remote("qemu said no".into()))
            })
            .await;

        assert!(matches!(result, Err(RemoteError::Remote(_))));
        assert_eq!(seq.current(), Started);
        assert!(!seq.state().in_flight);
    }

    #[tokio::test]
    async fn test_precondition_errors_do_not_mutate() {
        let seq = OperationSequencer::new(Stopped);
        let result = seq
            .perform(Some(&[Started]), Pausing, Some(Paused), || async { Ok(()) })
            .await;
        assert!(matches!(
            result,
            Err(RemoteError::IllegalTransition {
                from: Stopped,
                to: Pausing
            })
        ));
        assert_eq!(seq.current(), Stopped);

        seq.apply_remote_state(Starting);
        let result = seq
            .perform(Some(&[Stopped]), Starting, Some(Started), || async { Ok(()) })
            .await;
        assert!(matches!(result, Err(RemoteError::OperationInProgress(Starting))));
        assert!(result.unwrap_err().is_retryable());
        assert!(!seq.state().in_flight);
    }

    #[tokio::test]
    async fn test_operations_never_overlap() {
        let seq = OperationSequencer::new(Stopped);
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let seq = seq.clone();
            let running = running.clone();
            let max_seen = max_seen.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                seq.perform(None, Saving, None, move || async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    order.lock().push(format!("begin {}", i));
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    order.lock().push(format!("end {}", i));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        let order = order.lock();
        assert_eq!(order.len(), 8);
        for pair in order.chunks(2) {
            assert!(pair[0].starts_with("begin"));
            assert_eq!(pair[0].replace("begin", "end"), pair[1]);
        }
    }

    #[tokio::test]
    async fn test_push_during_operation_wins() {
        let seq = OperationSequencer::new(Stopped);
        let (release, wait) = oneshot::channel::<()>();

        let op = {
            let seq = seq.clone();
            tokio::spawn(async move {
                seq.perform(Some(&[Stopped]), Starting, Some(Started), || async move {
                    let _ = wait.await;
                    Ok(())
                })
                .await
            })
        };

        let mut rx = seq.subscribe();
        rx.wait_for(|s| s.in_flight).await.unwrap();
        seq.apply_remote_state(Paused);
        assert_eq!(seq.current(), Starting);
        assert_eq!(seq.state().pending_remote, Some(Paused));

        release.send(()).unwrap();
        op.await.unwrap().unwrap();
        assert_eq!(seq.current(), Paused);
        assert_eq!(seq.state().pending_remote, None);
    }

    #[tokio::test]
    async fn test_push_during_failed_operation_wins() {
        let seq = OperationSequencer::new(Started);
        let (release, wait) = oneshot::channel::<()>();

        let op = {
            let seq = seq.clone();
            tokio::spawn(async move {
                seq.perform(Some(&[Started]), Stopping, Some(Stopped), || async move {
                    let _ = wait.await;
                    Err::<(), _>(RemoteError::Remote("failed".into()))
                })
                .await
            })
        };

        seq.subscribe().wait_for(|s| s.in_flight).await.unwrap();
        seq.apply_remote_state(Paused);
        release.send(()).unwrap();

        assert!(op.await.unwrap().is_err());
        assert_eq!(seq.current(), Paused);
    }

    #[tokio::test]
    async fn test_idle_push_applies_immediately() {
        let seq = OperationSequencer::new(Stopped);
        seq.apply_remote_state(Started);
        assert_eq!(seq.current(), Started);
        assert_eq!(seq.state().pending_remote, None);
    }

    #[tokio::test]
    async fn test_operation_finishes_when_caller_is_cancelled() {
        let seq = OperationSequencer::new(Stopped);
        let (release, wait) = oneshot::channel::<()>();
        let (finished_tx, finished_rx) = oneshot::channel::<()>();

        let caller = {
            let seq = seq.clone();
            tokio::spawn(async move {
                seq.perform(Some(&[Stopped]), Starting, Some(Started), || async move {
                    let _ = wait.await;
                    let _ = finished_tx.send(());
                    Ok(())
                })
                .await
            })
        };

        seq.subscribe().wait_for(|s| s.in_flight).await.unwrap();
        caller.abort();
        let _ = caller.await;
        assert_eq!(seq.current(), Starting);

        release.send(()).unwrap();
        finished_rx.await.unwrap();
        seq.subscribe().wait_for(|s| !s.in_flight).await.unwrap();
        assert_eq!(seq.current(), Started);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_state_consistent() {
        let seq = OperationSequencer::new(Stopped);
        let (release, wait) = oneshot::channel::<()>();

        let first = {
            let seq = seq.clone();
            tokio::spawn(async move {
                seq.perform(None, Starting, Some(Started), || async move {
                    let _ = wait.await;
                    Ok(())
                })
                .await
            })
        };
        seq.subscribe().wait_for(|s| s.in_flight).await.unwrap();

        let waiter = tokio::time::timeout(
            Duration::from_millis(20),
            seq.perform(None, Stopping, Some(Stopped), || async { Ok(()) }),
        )
        .await;
        assert!(waiter.is_err());
        assert_eq!(seq.current(), Starting);

        release.send(()).unwrap();
        first.await.unwrap().unwrap();
        assert_eq!(seq.current(), Started);

        seq.perform(Some(&[Started]), Stopping, Some(Stopped), || async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(seq.current(), Stopped);
    }
}
