//! One-shot asynchronous results.
//!
//! An [`AsyncOperation`] is created together with its [`Completer`]. The
//! completer is consumed by [`succeed`](Completer::succeed) or
//! [`fail`](Completer::fail), so an operation resolves at most once; a
//! completer dropped without resolving fails the operation with
//! [`CoreError::Abandoned`]. Once resolved, the status accessors are stable.
//!
//! Continuations registered with [`on_complete`](AsyncOperation::on_complete)
//! run exactly once. Dropping the returned [`Continuation`] handle before
//! completion detaches it; aborting it drops the continuation unrun.

use std::future::{Future, IntoFuture};
use std::pin::Pin;

use indexmap::IndexMap;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::task::JoinHandle;

use cellink_api::{DataValue, ServiceResult, StatusCode, Variant};

use crate::error::CoreError;

/// Result carried by a finished [`AsyncOperation`].
pub type Outcome<T> = Result<T, CoreError>;

/// Producer side of an [`AsyncOperation`].
#[derive(Debug)]
pub struct Completer<T> {
    tx: oneshot::Sender<Outcome<T>>,
}

impl<T> Completer<T> {
    pub fn succeed(self, value: T) {
        let _ = self.tx.send(Ok(value));
    }

    pub fn fail(self, error: CoreError) {
        let _ = self.tx.send(Err(error));
    }

    pub fn complete(self, outcome: Outcome<T>) {
        let _ = self.tx.send(outcome);
    }

    /// The consumer dropped its operation; completing is now a no-op.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

enum OpState<T> {
    Pending(oneshot::Receiver<Outcome<T>>),
    Done(Outcome<T>),
}

/// A pending or resolved result of an asynchronous tag operation.
pub struct AsyncOperation<T> {
    state: OpState<T>,
}

/// Create an unresolved operation and the completer that resolves it.
pub fn pending<T>() -> (Completer<T>, AsyncOperation<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Completer { tx },
        AsyncOperation {
            state: OpState::Pending(rx),
        },
    )
}

/// Run `task` on the current runtime and expose its outcome as an operation.
pub fn spawn<T, F>(task: F) -> AsyncOperation<T>
where
    T: Send + 'static,
    F: Future<Output = Outcome<T>> + Send + 'static,
{
    let (completer, op) = pending();
    tokio::spawn(async move {
        completer.complete(task.await);
    });
    op
}

/// Like [`spawn`], on the given runtime.
pub fn spawn_on<T, F>(runtime: &Handle, task: F) -> AsyncOperation<T>
where
    T: Send + 'static,
    F: Future<Output = Outcome<T>> + Send + 'static,
{
    let (completer, op) = pending();
    runtime.spawn(async move {
        completer.complete(task.await);
    });
    op
}

impl<T> AsyncOperation<T> {
    /// An operation that is already resolved.
    pub fn ready(outcome: Outcome<T>) -> Self {
        Self {
            state: OpState::Done(outcome),
        }
    }

    pub fn succeeded(value: T) -> Self {
        Self::ready(Ok(value))
    }

    pub fn failed(error: CoreError) -> Self {
        Self::ready(Err(error))
    }

    /// Pull the result in if it has arrived. Returns `true` once resolved.
    pub fn poll_finished(&mut self) -> bool {
        if let OpState::Pending(rx) = &mut self.state {
            match rx.try_recv() {
                Ok(outcome) => self.state = OpState::Done(outcome),
                Err(TryRecvError::Closed) => self.state = OpState::Done(Err(CoreError::Abandoned)),
                Err(TryRecvError::Empty) => return false,
            }
        }
        true
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, OpState::Done(_))
    }

    pub fn is_success(&self) -> bool {
        matches!(self.state, OpState::Done(Ok(_)))
    }

    pub fn error(&self) -> Option<&CoreError> {
        match &self.state {
            OpState::Done(Err(e)) => Some(e),
            _ => None,
        }
    }

    pub fn result(&self) -> Option<&T> {
        match &self.state {
            OpState::Done(Ok(v)) => Some(v),
            _ => None,
        }
    }

    /// Wait for the outcome.
    pub async fn wait(self) -> Outcome<T> {
        match self.state {
            OpState::Done(outcome) => outcome,
            OpState::Pending(rx) => rx.await.unwrap_or(Err(CoreError::Abandoned)),
        }
    }
}

impl<T: Send + 'static> AsyncOperation<T> {
    /// Run `f` once with the outcome, on a spawned task.
    pub fn on_complete<F>(self, f: F) -> Continuation
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        Continuation {
            handle: tokio::spawn(async move {
                let outcome = self.wait().await;
                f(outcome);
            }),
        }
    }

    /// Transform a successful value.
    pub fn map<U, F>(self, f: F) -> AsyncOperation<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Outcome<U> + Send + 'static,
    {
        match self.state {
            OpState::Done(outcome) => AsyncOperation::ready(outcome.and_then(f)),
            OpState::Pending(_) => {
                let (completer, op) = pending();
                tokio::spawn(async move {
                    completer.complete(self.wait().await.and_then(f));
                });
                op
            }
        }
    }
}

impl<T: Send + 'static> IntoFuture for AsyncOperation<T> {
    type Output = Outcome<T>;
    type IntoFuture = Pin<Box<dyn Future<Output = Outcome<T>> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

impl<T> std::fmt::Debug for AsyncOperation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            OpState::Pending(_) => "pending",
            OpState::Done(Ok(_)) => "succeeded",
            OpState::Done(Err(_)) => "failed",
        };
        f.debug_struct("AsyncOperation").field("state", &state).finish()
    }
}

/// Handle to a registered continuation.
#[derive(Debug)]
pub struct Continuation {
    handle: JoinHandle<()>,
}

impl Continuation {
    /// Drop the continuation without running it, if it has not run yet.
    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait until the continuation has run or was aborted.
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

// ── Batch result validation ─────────────────────────────────────────

/// Collect a batched read into a name → value map.
///
/// Fails if the service call failed, the result count does not match the
/// request, or any item is not good. The first bad item is reported with
/// its name and index and no values are returned.
pub(crate) fn collect_read(
    names: &[String],
    result: ServiceResult<DataValue>,
) -> Outcome<IndexMap<String, Variant>> {
    let joined = || names.join(",");
    if !result.status.is_good() {
        return Err(CoreError::read(
            joined(),
            format!("Fail to read nodes attributes (read service):{}", result.status),
        ));
    }
    if result.results.len() != names.len() {
        return Err(CoreError::read(joined(), "result size is not right!"));
    }
    let mut values = IndexMap::with_capacity(names.len());
    for (index, (name, item)) in names.iter().zip(result.results).enumerate() {
        if !item.status.is_good() {
            return Err(CoreError::read(
                name.clone(),
                format!(
                    "Fail to read nodes attributes: result item status is not good! {name}( index :{index} ) : {}",
                    item.status
                ),
            ));
        }
        values.insert(name.clone(), item.value);
    }
    Ok(values)
}

/// Validate a batched write. The first bad item fails the whole batch.
pub(crate) fn check_write(names: &[String], result: &ServiceResult<StatusCode>) -> Outcome<()> {
    if !result.status.is_good() {
        return Err(CoreError::write(
            names.join(","),
            format!("Write nodes attributes fail (write service):{}", result.status),
        ));
    }
    if result.results.len() != names.len() {
        return Err(CoreError::write(names.join(","), "result size is not right!"));
    }
    for (index, (name, status)) in names.iter().zip(&result.results).enumerate() {
        if !status.is_good() {
            return Err(CoreError::write(
                name.clone(),
                format!("Write nodes attributes fail: {name}( index :{index} ) : {status}"),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio_test::{assert_pending, assert_ready};

    use super::*;

    #[tokio::test]
    async fn resolves_once_and_stays_stable() {
        let (completer, mut op) = pending::<u16>();
        assert!(!op.poll_finished());
        completer.succeed(7);

        assert!(op.poll_finished());
        assert!(op.is_success());
        assert_eq!(op.result(), Some(&7));
        assert!(op.error().is_none());

        assert!(op.poll_finished());
        assert!(op.is_success());
        assert_eq!(op.result(), Some(&7));
    }

    #[tokio::test]
    async fn dropped_completer_abandons() {
        let (completer, op) = pending::<()>();
        drop(completer);
        assert!(matches!(op.wait().await, Err(CoreError::Abandoned)));
    }

    #[tokio::test]
    async fn continuation_fires_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (completer, op) = pending::<u16>();
        let counter = calls.clone();
        let cont = op.on_complete(move |outcome| {
            assert_eq!(outcome.unwrap(), 3);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        completer.succeed(3);
        cont.join().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn aborted_continuation_never_runs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (completer, op) = pending::<u16>();
        let counter = calls.clone();
        let cont = op.on_complete(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        cont.abort();
        cont.join().await;
        assert!(completer.is_abandoned());
        completer.succeed(1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn awaiting_is_pending_until_completed() {
        let (completer, op) = pending::<u16>();
        let mut fut = tokio_test::task::spawn(op.into_future());
        assert_pending!(fut.poll());
        completer.succeed(9);
        assert!(fut.is_woken());
        let outcome = assert_ready!(fut.poll());
        assert_eq!(outcome.unwrap(), 9);
    }

    #[tokio::test]
    async fn spawned_task_failure_surfaces_as_error() {
        let mut op = spawn(async { Err::<u16, _>(CoreError::Disconnected) });
        tokio::task::yield_now().await;
        assert!(op.poll_finished());
        assert!(!op.is_success());
        assert!(matches!(op.error(), Some(CoreError::Disconnected)));
    }

    #[test]
    fn batch_read_reports_first_bad_item_with_index() {
        let names = vec!["A".to_owned(), "B".to_owned(), "C".to_owned()];
        let result = ServiceResult {
            status: StatusCode::GOOD,
            results: vec![
                DataValue::good(Variant::UInt16(1)),
                DataValue::bad(StatusCode::BAD_NODE_ID_UNKNOWN),
                DataValue::bad(StatusCode::BAD_TYPE_MISMATCH),
            ],
        };
        let err = collect_read(&names, result).unwrap_err();
        assert_eq!(err.field(), Some("B"));
        assert!(err.to_string().contains("B( index :1 ) : BadNodeIdUnknown"));
    }

    #[test]
    fn batch_read_fails_on_service_status() {
        let names = vec!["A".to_owned()];
        let result = ServiceResult {
            status: StatusCode::BAD_COMMUNICATION_ERROR,
            results: vec![DataValue::good(Variant::UInt16(1))],
        };
        assert!(collect_read(&names, result).is_err());
    }

    #[test]
    fn batch_read_rejects_short_result() {
        let names = vec!["A".to_owned(), "B".to_owned()];
        let result = ServiceResult {
            status: StatusCode::GOOD,
            results: vec![DataValue::good(Variant::UInt16(1))],
        };
        let err = collect_read(&names, result).unwrap_err();
        assert!(err.to_string().contains("result size is not right!"));
    }

    #[test]
    fn batch_write_names_failing_item() {
        let names = vec!["A".to_owned(), "B".to_owned()];
        let result = ServiceResult {
            status: StatusCode::GOOD,
            results: vec![StatusCode::GOOD, StatusCode::BAD_NOT_WRITABLE],
        };
        let err = check_write(&names, &result).unwrap_err();
        assert_eq!(err.field(), Some("B"));
        assert!(err.to_string().contains("B( index :1 ) : BadNotWritable"));
    }
}
