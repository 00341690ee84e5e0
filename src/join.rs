//! Helpers for joining background tasks

use tokio::task::{JoinError, JoinHandle};

/// Waits for a background task to finish.
///
/// Cancellation is expected (tasks are aborted when their owner is dropped),
/// but a panic within the task is re-raised on the caller.
pub(crate) async fn join_worker(handle: JoinHandle<()>) {
    propagate_panics(handle.await)
}

fn propagate_panics(result: Result<(), JoinError>) {
    match result {
        Ok(()) => (),
        Err(err) if err.is_cancelled() => (),
        Err(err) if err.is_panic() => {
            std::panic::panic_any(err.into_panic());
        }
        Err(err) => {
            panic!("Unexpected join error (other than panic or cancellation): {err}");
        }
    }
}
