//! One-shot gate that holds `request(n)` until a stream's first inbound frame.

use std::time::Duration;

use tokio::sync::watch;

use crate::error::GateError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GateState {
    Pending,
    Open,
    Abandoned,
}

/// Single-use signal. It leaves `Pending` exactly once, either opening
/// (first frame seen) or being abandoned (stream ended first).
#[derive(Debug)]
pub struct InboundGate {
    state: watch::Sender<GateState>,
}

impl Default for InboundGate {
    fn default() -> Self {
        Self::new()
    }
}

impl InboundGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(GateState::Pending);
        Self { state }
    }

    /// Release every current and future waiter. Returns true on the first call.
    pub fn open(&self) -> bool {
        self.settle(GateState::Open)
    }

    /// Fail every current and future waiter unless the gate already opened.
    pub fn abandon(&self) -> bool {
        self.settle(GateState::Abandoned)
    }

    pub fn is_open(&self) -> bool {
        *self.state.borrow() == GateState::Open
    }

    fn settle(&self, to: GateState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == GateState::Pending {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Wait until the gate leaves `Pending`, bounded by `limit` when set.
    pub async fn wait(&self, limit: Option<Duration>) -> Result<(), GateError> {
        let mut rx = self.state.subscribe();
        let settled = rx.wait_for(|state| *state != GateState::Pending);
        let outcome = match limit {
            Some(limit) => tokio::time::timeout(limit, settled)
                .await
                .map_err(|_| GateError::TimedOut(limit))?
                .map(|state| *state),
            // The sender lives in `self`, so the channel cannot close while we wait.
            None => settled.await.map(|state| *state),
        };
        match outcome {
            Ok(GateState::Open) => Ok(()),
            _ => Err(GateError::Abandoned),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_wait_blocks_until_open() {
        let gate = Arc::new(InboundGate::new());
        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.wait(None).await }
        });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        assert!(gate.open());
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_open_is_one_shot() {
        let gate = InboundGate::new();
        assert!(gate.open());
        assert!(!gate.open());
        assert!(!gate.abandon());
        assert!(gate.is_open());
        assert_eq!(gate.wait(None).await, Ok(()));
        assert_eq!(gate.wait(None).await, Ok(()));
    }

    #[tokio::test]
    async fn test_abandon_releases_waiters_with_error() {
        let gate = Arc::new(InboundGate::new());
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.wait(None).await })
            })
            .collect();

        tokio::task::yield_now().await;
        gate.abandon();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Err(GateError::Abandoned));
        }
        assert!(!gate.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let gate = InboundGate::new();
        let limit = Duration::from_millis(50);
        assert_eq!(gate.wait(Some(limit)).await, Err(GateError::TimedOut(limit)));
    }
}
