// Event handler contract
use crate::event::Event;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Failure reported by a handler.
///
/// The dispatch loop matches on the variant to decide between retry and
/// dead-letter routing; a terminal failure skips the remaining retry
/// attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Transient failure; the delivery will be retried with backoff
    Retryable(String),
    /// Permanent failure; retrying cannot succeed
    Terminal(String),
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retryable(reason) => write!(f, "retryable handler failure: {}", reason),
            Self::Terminal(reason) => write!(f, "terminal handler failure: {}", reason),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Retryable(format!("{err:#}"))
    }
}

/// Outcome of one handler invocation
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Boxed asynchronous handler capability.
///
/// Handlers must be idempotent with respect to `event.id`: redelivery and
/// retry resend the identical event. The bus documents this contract but
/// cannot enforce it.
pub type BoxedHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Box an async closure into the handler shape the bus stores.
pub fn boxed<F, Fut>(handler: F) -> BoxedHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |event| -> BoxFuture<'static, HandlerResult> { Box::pin(handler(event)) })
}
