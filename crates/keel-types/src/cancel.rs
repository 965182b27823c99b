//! Cooperative cancellation
//!
//! A [`CancelSource`] flips a shared flag observed by any number of
//! [`CancelToken`]s. Long loops check [`CancelToken::is_cancelled`] at
//! their yield points; async waits race [`CancelToken::cancelled`].

use tokio::sync::watch;

/// Sending half; cancels every token derived from it
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

/// Receiving half
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// Create a linked source and token
pub fn cancel_pair() -> (CancelSource, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelSource { tx }, CancelToken { rx })
}

impl CancelSource {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl CancelToken {
    /// A token that is never cancelled
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancelled; pending forever if the source is dropped
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
