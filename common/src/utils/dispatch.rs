use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::warn;

/// Fire-and-forget hand-off of freshly created sessions to the extraction worker.
///
/// Delivery is best effort. A session whose id never reaches a worker stays
/// `Pending` until the worker sweep claims it.
#[derive(Clone, Debug, Default)]
pub struct SessionDispatcher {
    sender: Option<UnboundedSender<String>>,
}

impl SessionDispatcher {
    pub fn channel() -> (Self, UnboundedReceiver<String>) {
        let (sender, receiver) = unbounded_channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// A dispatcher for deployments where a separate worker process sweeps the store.
    pub fn detached() -> Self {
        Self { sender: None }
    }

    pub fn dispatch(&self, session_id: &str) {
        let Some(sender) = &self.sender else {
            return;
        };

        if sender.send(session_id.to_string()).is_err() {
            warn!(
                %session_id,
                "worker channel closed; session left for the pending sweep"
            );
        }
    }
}
