use tokio::sync::watch;

/// Creates a linked pair for stopping the peer. Every task holds a clone of
/// the signal; the handle lives with the application.
pub fn shutdown_channel() -> (ShutdownHandle, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownHandle { sender }, ShutdownSignal { receiver })
}

/// Requests a graceful stop. Dropping the handle without calling `shutdown()`
/// also stops the peer.
pub struct ShutdownHandle {
    sender: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.sender.send(true);
    }
}

#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once shutdown has been requested. Safe to poll repeatedly
    /// from select loops.
    pub async fn wait(&mut self) {
        loop {
            if *self.receiver.borrow() {
                return;
            }
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn explicit_shutdown_wakes_all_signals() {
        let (handle, signal) = shutdown_channel();
        let mut signal2 = signal.clone();
        let mut signal = signal;

        assert!(!signal.is_shutdown());
        handle.shutdown();

        timeout(Duration::from_secs(1), signal.wait()).await.unwrap();
        timeout(Duration::from_secs(1), signal2.wait()).await.unwrap();
        assert!(signal.is_shutdown());
    }

    #[tokio::test]
    async fn dropping_handle_counts_as_shutdown() {
        let (handle, mut signal) = shutdown_channel();
        drop(handle);
        timeout(Duration::from_secs(1), signal.wait()).await.unwrap();
    }
}
