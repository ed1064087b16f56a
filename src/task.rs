use tokio::task::JoinHandle;

/// A helper struct that invokes [`JoinHandle::abort`] when dropped.
#[derive(Debug)]
pub(crate) struct AbortOnDrop<T = ()> {
    join_handle: Option<JoinHandle<T>>,
}

impl<T> AbortOnDrop<T> {
    pub(crate) fn new(join_handle: JoinHandle<T>) -> Self {
        Self {
            join_handle: Some(join_handle),
        }
    }

    /// Disarms the guard, returning the inner join handle.
    pub(crate) fn into_inner(mut self) -> JoinHandle<T> {
        self.join_handle
            .take()
            .expect("invariant: the inner join handle is always present")
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

impl<T> From<JoinHandle<T>> for AbortOnDrop<T> {
    fn from(join_handle: JoinHandle<T>) -> Self {
        Self::new(join_handle)
    }
}
