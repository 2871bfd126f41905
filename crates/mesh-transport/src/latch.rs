//! One-shot completion latch

use tokio::sync::watch;

/// Process-wide completion signal
///
/// Closes exactly once, when every party has finished or been removed and no
/// queue or connection is left. It never re-opens.
#[derive(Debug, Clone)]
pub struct DoneLatch {
    rx: watch::Receiver<bool>,
}

impl DoneLatch {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// Whether the latch has closed
    pub fn is_closed(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the latch closes
    pub async fn wait(&mut self) {
        // The sender lives as long as the transport; losing it also means done
        let _ = self.rx.wait_for(|closed| *closed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_after_close() {
        let (tx, rx) = watch::channel(false);
        let mut latch = DoneLatch::new(rx);
        assert!(!latch.is_closed());

        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), latch.wait())
            .await
            .unwrap();
        assert!(latch.is_closed());
    }

    #[tokio::test]
    async fn test_every_clone_observes_close() {
        let (tx, rx) = watch::channel(false);
        let mut first = DoneLatch::new(rx);
        let mut second = first.clone();

        let waiter = tokio::spawn(async move { second.wait().await });
        tx.send_replace(true);

        first.wait().await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
