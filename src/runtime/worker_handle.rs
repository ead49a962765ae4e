use tokio::sync::watch;

/// Keeps a pool worker alive. The worker shuts down once every clone has been dropped.
#[derive(Debug, Clone)]
pub(crate) struct WorkerHandle {
    _alive: watch::Receiver<()>,
}

/// The worker's side of its [`WorkerHandle`]s.
#[derive(Debug)]
pub(crate) struct WorkerHandleListener {
    alive: watch::Sender<()>,
}

impl WorkerHandleListener {
    pub(crate) fn channel() -> (WorkerHandle, WorkerHandleListener) {
        let (alive, receiver) = watch::channel(());
        (WorkerHandle { _alive: receiver }, WorkerHandleListener { alive })
    }

    /// Resolves once no handles remain. Only ever poll this inside a `select!`.
    pub(crate) async fn wait_for_all_handle_drops(&mut self) {
        self.alive.closed().await
    }
}
