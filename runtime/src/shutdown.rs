//! Cooperative cancellation for a harvest run.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable cancellation flag. Triggering it wakes every `cancelled()`
/// waiter, including ones that start waiting afterwards.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// Trigger on Ctrl-C.
    pub fn install_ctrl_c(&self) -> tokio::task::JoinHandle<()> {
        let signal = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; finishing cleanup before exit");
                signal.trigger();
            }
        })
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn late_waiters_see_trigger() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());
        signal.trigger();
        tokio::time::timeout(Duration::from_secs(1), signal.clone().cancelled())
            .await
            .expect("waiter should resolve");
        assert!(signal.is_triggered());
    }

    #[test]
    fn waiter_wakes_on_trigger() {
        let signal = ShutdownSignal::new();
        let mut waiter = tokio_test::task::spawn(signal.cancelled());
        tokio_test::assert_pending!(waiter.poll());

        signal.trigger();
        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());
    }
}
