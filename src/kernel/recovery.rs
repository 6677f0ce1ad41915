//! Panic recovery for message handlers and evaluations.
//!
//! A panicking evaluator must not take the kernel down: the panic is caught,
//! logged and turned into an evaluation error.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use crate::types::{Error, Result};

/// Await `future`, converting a panic into [`Error::Evaluation`].
pub async fn with_recovery<F, T>(future: F, operation_name: &str) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let panic_msg = extract_panic_message(&payload);
            tracing::error!(
                "panic_recovered: operation={}, panic={}",
                operation_name,
                panic_msg
            );
            Err(Error::evaluation(panic_msg))
        }
    }
}

/// Extract the message from a panic payload.
pub(crate) fn extract_panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic (no message)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_success_passes_through() {
        let result = with_recovery(async { Ok(42) }, "test_operation").await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_error_passes_through() {
        let result: Result<()> =
            with_recovery(async { Err(Error::protocol("bad")) }, "test_operation").await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_panic_becomes_evaluation_error() {
        let result: Result<()> = with_recovery(
            async {
                panic!("evaluator exploded");
            },
            "test_operation",
        )
        .await;
        match result {
            Err(Error::Evaluation(msg)) => assert_eq!(msg, "evaluator exploded"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panic_with_formatted_message() {
        let n = 7;
        let result: Result<()> = with_recovery(async move { panic!("value {}", n) }, "op").await;
        assert_eq!(result.unwrap_err().to_string(), "value 7");
    }
}
