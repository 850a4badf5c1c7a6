use std::sync::Arc;
use tokio::sync::watch;

/// Cooperative cancellation signal shared by every call of one run.
///
/// Clones observe the same state. `cancelled()` resolves once `cancel()` has
/// been called on any clone, so it can be raced against in-flight work.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of this token, so the wait
        // only ends by observing `true`.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Cancel this token once `after` has elapsed.
    pub fn cancel_after(&self, after: std::time::Duration) -> tokio::task::JoinHandle<()> {
        let token = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            token.cancel();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();

        assert!(clone.is_cancelled());
        tokio::time::timeout(Duration::from_millis(100), clone.cancelled())
            .await
            .expect("cancelled() should resolve");
    }

    #[tokio::test]
    async fn deadline_cancels() {
        let token = CancelToken::new();
        token.cancel_after(Duration::from_millis(5));
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("deadline should fire");
        assert!(token.is_cancelled());
    }
}
