use tokio::sync::watch;

/// Cooperative cancellation handle threaded through check and delivery
/// calls. Clones observe the same flag; blocking code should select on
/// [`CancelToken::cancelled`] so an abandoned session stops promptly.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel` has been called (immediately if it
    /// already was).
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        rx.wait_for(|cancelled| *cancelled).await.ok();
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
