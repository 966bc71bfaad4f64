use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Signal {
    raised: AtomicBool,
    notify: Notify,
}

impl Signal {
    fn raise(&self) -> bool {
        let first = !self.raised.swap(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        first
    }

    fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_raised() {
                return;
            }
            notified.await;
        }
    }
}

/// Advisory cancellation flag shared between the pool and a running gadget.
#[derive(Clone, Debug, Default)]
pub struct TaskCancellationToken {
    signal: Arc<Signal>,
}

impl TaskCancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` only for the call that actually raised the flag.
    pub fn cancel(&self) -> bool {
        self.signal.raise()
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_raised()
    }

    pub async fn cancelled(&self) {
        self.signal.wait().await
    }
}

/// Early warning that the hard timeout is near. Gadgets may ignore it.
#[derive(Clone, Debug, Default)]
pub struct SoftTimeoutSignal {
    signal: Arc<Signal>,
}

impl SoftTimeoutSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fire(&self) {
        self.signal.raise();
    }

    pub fn is_expired(&self) -> bool {
        self.signal.is_raised()
    }

    pub async fn expired(&self) {
        self.signal.wait().await
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExecutionSignals {
    pub cancellation: TaskCancellationToken,
    pub soft_timeout: SoftTimeoutSignal,
}

impl ExecutionSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_stop(&self) -> bool {
        self.cancellation.is_cancelled() || self.soft_timeout.is_expired()
    }
}
