//! The handlers invoked when a job fires.
//!
//! A job's [`crate::job::InvocationTarget`] names a handler; the scheduler resolves that name
//! against the executors registered with [`crate::Scheduler::with_executor`] and calls
//! [`Executor::execute`] with the job's parameters decoded into [`Executor::Params`].
use std::{
    any::Any, collections::HashMap, error::Error, fmt::Display, marker::PhantomData, sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio::task::JoinError;
use tracing::Instrument;

use crate::{execution::ExecutionId, job::JobId};

const ERROR_TYPE_PANIC: &str = "panic";
const ERROR_TYPE_TIMEOUT: &str = "timeout";
const ERROR_TYPE_DECODE: &str = "decode";

/// A handler that can be the target of scheduled jobs.
///
/// # Example
///
/// ```
/// # use bonfire_sched::prelude::*;
/// # use serde::Deserialize;
/// #[derive(Deserialize)]
/// struct ReportParams {
///     format: String,
/// }
///
/// struct ReportExecutor;
///
/// #[async_trait::async_trait]
/// impl Executor for ReportExecutor {
///     type Params = ReportParams;
///     const NAME: &'static str = "report";
///
///     async fn execute(invocation: Invocation<Self::Params>) -> ExecutionResult {
///         println!("Rendering {} report", invocation.params.format);
///         ExecutionResult::Done
///     }
/// }
/// ```
#[async_trait]
pub trait Executor {
    /// The type the job's invocation parameters are decoded into.
    ///
    /// If this is not needed it can be set to unit `()`, in which case jobs should be created
    /// without parameters.
    type Params: DeserializeOwned + Send;
    /// The name of the handler.
    ///
    /// Jobs reference their handler by this name, so it should stay stable across renames of the
    /// rust type implementing this trait.
    const NAME: &'static str;
    /// This flag should be set to true if the handler is computationally expensive.
    ///
    /// Under the covers this results in the handler being ran via
    /// [`tokio::task::spawn_blocking`]. See its docs for more details about blocking futures.
    const BLOCKING: bool = false;

    async fn execute(invocation: Invocation<Self::Params>) -> ExecutionResult;

    /// The maximum time an invocation may take before it is failed with a timeout.
    fn timeout(_invocation: &Invocation<Self::Params>) -> Option<Duration> {
        None
    }
}

/// The data passed to an [`Executor`] for a single attempt of a fire.
#[derive(Debug, Clone)]
pub struct Invocation<P> {
    pub job_id: JobId,
    pub execution_id: ExecutionId,
    pub fired_at: DateTime<Utc>,
    /// Starts at one and increases with every retry of the same fire.
    pub attempt: u16,
    pub params: P,
}

impl<P> Invocation<P> {
    fn try_map_params<T, Er>(
        self,
        f: impl FnOnce(P) -> Result<T, Er>,
    ) -> Result<Invocation<T>, Er> {
        Ok(Invocation {
            job_id: self.job_id,
            execution_id: self.execution_id,
            fired_at: self.fired_at,
            attempt: self.attempt,
            params: f(self.params)?,
        })
    }
}

pub enum ExecutionResult {
    Done,
    Error { error: Box<dyn ExecutionError> },
}

impl<T> From<T> for ExecutionResult
where
    T: ExecutionError + 'static,
{
    fn from(value: T) -> Self {
        Self::Error {
            error: Box::new(value),
        }
    }
}

pub trait ExecutionError: Error + Send {
    fn error_type(&self) -> &'static str;

    /// Whether the failure is worth retrying under the job's retry policy.
    fn is_transient(&self) -> bool {
        false
    }
}

/// Why an invocation did not succeed, as recorded in the execution log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionFailure {
    pub error_type: &'static str,
    pub message: String,
    pub transient: bool,
}

impl Display for ExecutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl ExecutionFailure {
    /// A failure from a panic payload, keeping its message when it has one.
    pub(crate) fn panicked(panic: Box<dyn Any + Send>, fallback: String) -> Self {
        let message = panic
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or(fallback);
        Self {
            error_type: ERROR_TYPE_PANIC,
            message,
            transient: false,
        }
    }
}

impl From<JoinError> for ExecutionFailure {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        match value.try_into_panic() {
            Ok(panic) => Self::panicked(panic, msg),
            Err(_) => Self {
                error_type: ERROR_TYPE_PANIC,
                message: msg,
                transient: false,
            },
        }
    }
}

impl From<Box<dyn ExecutionError>> for ExecutionFailure {
    fn from(value: Box<dyn ExecutionError>) -> Self {
        Self {
            error_type: value.error_type(),
            message: value.to_string(),
            transient: value.is_transient(),
        }
    }
}

impl From<Duration> for ExecutionFailure {
    fn from(value: Duration) -> Self {
        Self {
            error_type: ERROR_TYPE_TIMEOUT,
            message: format!("Invocation failed to complete within timeout: {value:?}"),
            transient: true,
        }
    }
}

impl From<serde_json::Error> for ExecutionFailure {
    fn from(value: serde_json::Error) -> Self {
        Self {
            error_type: ERROR_TYPE_DECODE,
            message: format!("Failed to decode invocation params: {value}"),
            transient: false,
        }
    }
}

/// Object safe view of an [`Executor`], working on undecoded params.
#[async_trait]
pub(crate) trait Dispatch: Send + Sync {
    async fn dispatch(
        &self,
        invocation: Invocation<serde_json::Value>,
    ) -> Result<(), ExecutionFailure>;
}

pub(crate) struct Dispatcher<E>(PhantomData<fn() -> E>);

impl<E> Dispatcher<E> {
    pub(crate) fn new() -> Self {
        Self(PhantomData)
    }
}

#[async_trait]
impl<E> Dispatch for Dispatcher<E>
where
    E: Executor + 'static,
    E::Params: 'static,
{
    async fn dispatch(
        &self,
        invocation: Invocation<serde_json::Value>,
    ) -> Result<(), ExecutionFailure> {
        let invocation = invocation.try_map_params(serde_json::from_value::<E::Params>)?;
        let timeout = E::timeout(&invocation);

        let fut = async move {
            match timeout {
                Some(duration) => tokio::time::timeout(duration, E::execute(invocation))
                    .await
                    .map_err(|_elapsed| duration),
                None => Ok(E::execute(invocation).await),
            }
        }
        .in_current_span();
        let result = if E::BLOCKING {
            tokio::task::spawn_blocking(|| futures::executor::block_on(fut))
        } else {
            tokio::spawn(fut)
        };

        match result.await {
            Ok(Ok(ExecutionResult::Done)) => Ok(()),
            Ok(Ok(ExecutionResult::Error { error })) => Err(error.into()),
            Ok(Err(duration)) => Err(duration.into()),
            Err(error) => Err(error.into()),
        }
    }
}

/// The executors known to a scheduler, by handler name.
#[derive(Default, Clone)]
pub(crate) struct ExecutorRegistry {
    executors: HashMap<&'static str, Arc<dyn Dispatch>>,
}

impl ExecutorRegistry {
    pub(crate) fn register<E>(&mut self)
    where
        E: Executor + 'static,
        E::Params: 'static,
    {
        if self
            .executors
            .insert(E::NAME, Arc::new(Dispatcher::<E>::new()))
            .is_some()
        {
            tracing::warn!(handler = E::NAME, "Replaced executor for handler {}", E::NAME);
        }
    }

    pub(crate) fn get(&self, handler: &str) -> Option<Arc<dyn Dispatch>> {
        self.executors.get(handler).cloned()
    }

    pub(crate) fn handlers(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.executors.keys().copied()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use assert_matches::assert_matches;
    use serde::{Deserialize, Serialize};

    use super::*;

    impl ExecutorRegistry {
        pub(crate) fn register_dispatch(
            &mut self,
            handler: &'static str,
            dispatch: Arc<dyn Dispatch>,
        ) {
            self.executors.insert(handler, dispatch);
        }
    }

    /// Panics while dispatching, before any invocation task exists.
    pub(crate) struct PanickingDispatch;

    impl PanickingDispatch {
        pub(crate) const NAME: &'static str = "panicking_dispatch";
    }

    #[async_trait]
    impl Dispatch for PanickingDispatch {
        async fn dispatch(
            &self,
            _invocation: Invocation<serde_json::Value>,
        ) -> Result<(), ExecutionFailure> {
            panic!("dispatch paniced")
        }
    }

    pub(crate) struct SimpleExecutor;

    #[async_trait]
    impl Executor for SimpleExecutor {
        type Params = ();
        const NAME: &'static str = "simple_executor";
        async fn execute(_invocation: Invocation<Self::Params>) -> ExecutionResult {
            ExecutionResult::Done
        }
    }

    pub(crate) struct MockReturnExecutor;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub(crate) enum MockExecutionResult {
        Done,
        Panic,
        Timeout,
        Sleep { seconds: u64 },
        SleepMillis { millis: u64 },
        Error { error: MockError },
        /// Fails transiently until the given attempt, then succeeds.
        SucceedOnAttempt { attempt: u16 },
    }

    impl MockExecutionResult {
        pub(crate) fn params(&self) -> serde_json::Value {
            serde_json::to_value(self).unwrap()
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub(crate) struct MockError {
        pub message: String,
        pub transient: bool,
    }

    impl MockError {
        pub(crate) fn new(message: impl Into<String>) -> Self {
            Self {
                message: message.into(),
                transient: false,
            }
        }

        pub(crate) fn transient(message: impl Into<String>) -> Self {
            Self {
                message: message.into(),
                transient: true,
            }
        }
    }

    impl std::fmt::Display for MockError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.message)
        }
    }
    impl Error for MockError {}
    impl ExecutionError for MockError {
        fn error_type(&self) -> &'static str {
            "custom"
        }

        fn is_transient(&self) -> bool {
            self.transient
        }
    }

    #[async_trait]
    impl Executor for MockReturnExecutor {
        type Params = MockExecutionResult;
        const NAME: &'static str = "basic_executor";
        async fn execute(invocation: Invocation<Self::Params>) -> ExecutionResult {
            match invocation.params {
                MockExecutionResult::Panic => panic!("job paniced"),
                MockExecutionResult::Timeout => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ExecutionResult::Done
                }
                MockExecutionResult::Sleep { seconds } => {
                    tokio::time::sleep(Duration::from_secs(seconds)).await;
                    ExecutionResult::Done
                }
                MockExecutionResult::SleepMillis { millis } => {
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    ExecutionResult::Done
                }
                MockExecutionResult::Done => ExecutionResult::Done,
                MockExecutionResult::Error { error } => ExecutionResult::Error {
                    error: Box::new(error),
                },
                MockExecutionResult::SucceedOnAttempt { attempt } if invocation.attempt < attempt => {
                    MockError::transient(format!("attempt {}", invocation.attempt)).into()
                }
                MockExecutionResult::SucceedOnAttempt { .. } => ExecutionResult::Done,
            }
        }

        fn timeout(invocation: &Invocation<Self::Params>) -> Option<Duration> {
            if matches!(invocation.params, MockExecutionResult::Timeout) {
                Some(Duration::from_millis(1))
            } else {
                None
            }
        }
    }

    pub(crate) struct BlockingExecutor;

    #[async_trait]
    impl Executor for BlockingExecutor {
        type Params = String;
        const NAME: &'static str = "blocking_executor";
        const BLOCKING: bool = true;
        async fn execute(invocation: Invocation<Self::Params>) -> ExecutionResult {
            if invocation.params == "panic" {
                panic!("blocking job paniced");
            }
            ExecutionResult::Done
        }
    }

    fn invocation(params: serde_json::Value) -> Invocation<serde_json::Value> {
        Invocation {
            job_id: JobId::from("job"),
            execution_id: 1.into(),
            fired_at: Utc::now(),
            attempt: 1,
            params,
        }
    }

    async fn dispatch<E>(params: serde_json::Value) -> Result<(), ExecutionFailure>
    where
        E: Executor + 'static,
    {
        Dispatcher::<E>::new().dispatch(invocation(params)).await
    }

    #[tokio::test]
    async fn dispatch_done() {
        assert!(dispatch::<SimpleExecutor>(serde_json::Value::Null)
            .await
            .is_ok());
        assert!(
            dispatch::<MockReturnExecutor>(MockExecutionResult::Done.params())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn dispatch_error() {
        let params = MockExecutionResult::Error {
            error: MockError::new("went wrong"),
        }
        .params();
        let failure = dispatch::<MockReturnExecutor>(params).await.unwrap_err();
        assert_eq!(failure.error_type, "custom");
        assert_eq!(failure.message, "went wrong");
        assert!(!failure.transient);
        assert_eq!(failure.to_string(), "custom: went wrong");
    }

    #[tokio::test]
    async fn dispatch_transient_error() {
        let params = MockExecutionResult::SucceedOnAttempt { attempt: 2 }.params();
        let failure = dispatch::<MockReturnExecutor>(params).await.unwrap_err();
        assert!(failure.transient);
    }

    #[tokio::test]
    async fn dispatch_panic() {
        let failure = dispatch::<MockReturnExecutor>(MockExecutionResult::Panic.params())
            .await
            .unwrap_err();
        assert_eq!(failure.error_type, ERROR_TYPE_PANIC);
        assert_eq!(failure.message, "job paniced");
    }

    #[tokio::test]
    async fn dispatch_timeout() {
        let failure = dispatch::<MockReturnExecutor>(MockExecutionResult::Timeout.params())
            .await
            .unwrap_err();
        assert_eq!(failure.error_type, ERROR_TYPE_TIMEOUT);
        assert!(failure.transient);
    }

    #[tokio::test]
    async fn dispatch_decode_error() {
        let failure = dispatch::<MockReturnExecutor>(serde_json::json!({ "unknown": 1 }))
            .await
            .unwrap_err();
        assert_eq!(failure.error_type, ERROR_TYPE_DECODE);
        assert!(!failure.transient);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dispatch_blocking() {
        assert!(dispatch::<BlockingExecutor>(serde_json::json!("work"))
            .await
            .is_ok());
        assert_matches!(
            dispatch::<BlockingExecutor>(serde_json::json!("panic")).await,
            Err(ExecutionFailure { error_type: ERROR_TYPE_PANIC, .. })
        );
    }
}
