use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::future::Future;
use std::sync::{Mutex, PoisonError};

struct Flight<T: Clone> {
    generation: u64,
    inflight: Option<Shared<BoxFuture<'static, T>>>,
}

/// At most one in-flight operation at a time, shared by every caller.
///
/// The first caller of [`run`](SingleFlight::run) starts the operation; any
/// caller arriving while it is still running awaits the same future instead of
/// starting another one, and every waiter receives a clone of its output
/// (success *or* failure). Once it completes, the next call starts afresh.
///
/// # Examples
///
/// ```
/// use songbook_asyncutils::SingleFlight;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let refresh: SingleFlight<Result<String, String>> = SingleFlight::new();
/// let (a, b) = tokio::join!(
///     refresh.run(|| async {
///         tokio::task::yield_now().await;
///         Ok("token-1".to_string())
///     }),
///     refresh.run(|| async { Ok("token-2".to_string()) }),
/// );
/// // Both callers got the result of the first operation.
/// assert_eq!(a, b);
/// # }
/// ```
pub struct SingleFlight<T: Clone> {
    flight: Mutex<Flight<T>>,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self { flight: Mutex::new(Flight { generation: 0, inflight: None }) }
    }

    /// Join the in-flight operation, or start one with `start`.
    ///
    /// `start` is only called when nothing is in flight.
    pub async fn run<F, Fut>(&self, start: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (generation, shared) = {
            let mut flight = self.flight.lock().unwrap_or_else(PoisonError::into_inner);
            match flight.inflight.clone() {
                Some(shared) => (flight.generation, shared),
                None => {
                    flight.generation += 1;
                    let shared = start().boxed().shared();
                    flight.inflight = Some(shared.clone());
                    (flight.generation, shared)
                },
            }
        };
        let output = shared.await;
        {
            // Only clear our own flight; a newer one may already be running.
            let mut flight = self.flight.lock().unwrap_or_else(PoisonError::into_inner);
            if flight.generation == generation {
                flight.inflight = None;
            }
        }
        output
    }

    /// Returns `true` while an operation is in flight.
    pub fn is_running(&self) -> bool {
        self.flight.lock().unwrap_or_else(PoisonError::into_inner).inflight.is_some()
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting(counter: &Arc<AtomicUsize>, value: Result<u32, String>) -> impl Future<Output = Result<u32, String>> + Send + 'static {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            value
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_operation() {
        let flight = SingleFlight::new();
        let starts = Arc::new(AtomicUsize::new(0));
        let (a, b, c) = tokio::join!(
            flight.run(|| counting(&starts, Ok(1))),
            flight.run(|| counting(&starts, Ok(2))),
            flight.run(|| counting(&starts, Ok(3))),
        );
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!((a, b, c), (Ok(1), Ok(1), Ok(1)));
        assert!(!flight.is_running());
    }

    #[tokio::test]
    async fn test_failure_is_broadcast() {
        let flight = SingleFlight::new();
        let starts = Arc::new(AtomicUsize::new(0));
        let (a, b) = tokio::join!(
            flight.run(|| counting(&starts, Err("revoked".to_string()))),
            flight.run(|| counting(&starts, Ok(2))),
        );
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(a, Err("revoked".to_string()));
        assert_eq!(b, Err("revoked".to_string()));
    }

    #[tokio::test]
    async fn test_sequential_calls_start_afresh() {
        let flight = SingleFlight::new();
        let starts = Arc::new(AtomicUsize::new(0));
        assert_eq!(flight.run(|| counting(&starts, Ok(1))).await, Ok(1));
        assert_eq!(flight.run(|| counting(&starts, Ok(2))).await, Ok(2));
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }
}
