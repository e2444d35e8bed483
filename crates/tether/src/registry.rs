//! Live connections, so the supervisor can close them.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tether_session::ChannelCloser;
use tether_transport::ConnectionId;
use tokio::sync::oneshot;

/// Maps each open connection to the signal its handler task waits on.
#[derive(Default)]
pub(crate) struct ChannelRegistry {
    channels: Mutex<HashMap<ConnectionId, oneshot::Sender<String>>>,
}

impl ChannelRegistry {
    /// Returns the receiver that yields the kick reason for `channel`.
    pub(crate) fn register(&self, channel: ConnectionId) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(channel, tx);
        rx
    }

    pub(crate) fn unregister(&self, channel: ConnectionId) {
        self.lock().remove(&channel);
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, oneshot::Sender<String>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ChannelCloser for ChannelRegistry {
    fn close(&self, channel: ConnectionId, reason: &str) {
        match self.lock().remove(&channel) {
            Some(signal) => {
                let _ = signal.send(reason.to_string());
            }
            None => tracing::debug!(conn_id = %channel, "close for an unknown channel"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_delivers_reason_once() {
        let registry = ChannelRegistry::default();
        let channel = ConnectionId::new(1);
        let signal = registry.register(channel);

        registry.close(channel, "maintenance");
        registry.close(channel, "again");

        assert_eq!(signal.await.unwrap(), "maintenance");
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_unregister_drops_signal() {
        let registry = ChannelRegistry::default();
        let channel = ConnectionId::new(2);
        let signal = registry.register(channel);

        registry.unregister(channel);

        assert!(signal.await.is_err());
    }
}
