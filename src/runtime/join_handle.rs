use std::{
    future::Future,
    panic,
    pin::Pin,
    task::{ready, Context, Poll},
};

/// A spawned task whose output can be awaited. A panic in the task resumes in the awaiting task.
#[derive(Debug)]
pub(crate) struct AsyncJoinHandle<T>(tokio::task::JoinHandle<T>);

impl<T: Send + 'static> AsyncJoinHandle<T> {
    pub(crate) fn spawn(fut: impl Future<Output = T> + Send + 'static) -> Self {
        Self(tokio::runtime::Handle::current().spawn(fut))
    }
}

impl<T> Future for AsyncJoinHandle<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        match ready!(Pin::new(&mut self.0).poll(cx)) {
            Ok(output) => Poll::Ready(output),
            Err(error) => match error.try_into_panic() {
                Ok(payload) => panic::resume_unwind(payload),
                // Tasks are never aborted, so this only happens when the runtime shuts down
                // underneath us.
                Err(cancelled) => panic!("{cancelled}"),
            },
        }
    }
}
