//! Cooperative cancellation.
//!
//! A [`CancellationHandle`] owns the trigger; any number of
//! [`CancellationSignal`]s observe it. Dropping the handle without calling
//! [`CancellationHandle::cancel`] leaves the signals pending forever.

use tokio::sync::watch;

/// Trigger side of a cancellation pair.
#[derive(Debug)]
pub struct CancellationHandle {
    sender: watch::Sender<bool>,
}

/// Observer side of a cancellation pair. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    receiver: watch::Receiver<bool>,
}

impl CancellationHandle {
    /// Creates an untriggered handle.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    /// A new signal observing this handle.
    pub fn signal(&self) -> CancellationSignal {
        CancellationSignal {
            receiver: self.sender.subscribe(),
        }
    }

    /// Fires every signal. Idempotent.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Whether [`Self::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

impl Default for CancellationHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_, receiver) = watch::channel(false);
        Self { receiver }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            // handle dropped untriggered
            std::future::pending::<()>().await;
        }
    }
}
