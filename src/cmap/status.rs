use crate::cmap::{conn::ConnectionGeneration, PoolGeneration};

/// Create a channel for publishing and receiving updates to the pool's generation.
pub(super) fn channel(init: PoolGeneration) -> (PoolGenerationPublisher, PoolGenerationSubscriber) {
    let (sender, receiver) = tokio::sync::watch::channel(init);
    (
        PoolGenerationPublisher { sender },
        PoolGenerationSubscriber { receiver },
    )
}

/// Held by the worker; every clear publishes the new generation.
#[derive(Debug)]
pub(super) struct PoolGenerationPublisher {
    sender: tokio::sync::watch::Sender<PoolGeneration>,
}

impl PoolGenerationPublisher {
    pub(super) fn publish(&self, new_generation: PoolGeneration) {
        // Nobody listening is fine.
        let _: std::result::Result<_, _> = self.sender.send(new_generation);
    }
}

/// Read side of the generation channel, held by pool handles.
#[derive(Clone, Debug)]
pub(crate) struct PoolGenerationSubscriber {
    receiver: tokio::sync::watch::Receiver<PoolGeneration>,
}

impl PoolGenerationSubscriber {
    /// Get a copy of the latest generation.
    pub(crate) fn generation(&self) -> PoolGeneration {
        self.receiver.borrow().clone()
    }
}

/// Lets a checked-out connection notice a clear that interrupts in-use connections. The signal
/// fires once the published generation makes the connection's own generation stale.
#[derive(Clone, Debug)]
pub(crate) struct InterruptSignal {
    subscriber: PoolGenerationSubscriber,
    generation: ConnectionGeneration,
}

impl InterruptSignal {
    pub(crate) fn new(subscriber: PoolGenerationSubscriber, generation: ConnectionGeneration) -> Self {
        Self {
            subscriber,
            generation,
        }
    }

    /// Resolves once the connection has been interrupted. Never resolves if the pool is gone.
    pub(crate) async fn interrupted(&mut self) {
        let generation = self.generation;
        let closed = self
            .subscriber
            .receiver
            .wait_for(|current| generation.is_stale(current))
            .await
            .is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}
