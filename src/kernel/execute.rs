//! Execution session: one `execute_request` from receipt to reply.
//!
//! ```text
//! Received → InputPublished → Capturing → Evaluating → {Succeeded | Failed} → ReplySent
//! ```
//!
//! Streams are captured from before evaluation starts until every captured
//! chunk has been published, so all `stream` output of a request precedes
//! its `execute_result`/`error` and its reply.

use serde_json::{json, Value};

use super::receipt::{DisplayHandle, Receipt};
use super::recovery::with_recovery;
use super::stream::StreamCapture;
use super::KernelState;
use crate::data::Data;
use crate::evaluator::Evaluator;
use crate::types::{Error, Result};
use crate::wire::message::EXECUTE_REPLY;

/// Phase of an execution session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPhase {
    Received,
    InputPublished,
    Capturing,
    Evaluating,
    Succeeded,
    Failed,
    ReplySent,
}

impl ExecutionPhase {
    pub fn can_transition_to(self, next: ExecutionPhase) -> bool {
        use ExecutionPhase::*;
        matches!(
            (self, next),
            (Received, InputPublished)
                | (InputPublished, Capturing)
                | (Capturing, Evaluating)
                | (Evaluating, Succeeded)
                | (Evaluating, Failed)
                | (Succeeded, ReplySent)
                | (Failed, ReplySent)
        )
    }
}

struct ExecuteSession<'a> {
    receipt: &'a Receipt,
    phase: ExecutionPhase,
    execution_count: u32,
}

impl ExecuteSession<'_> {
    fn advance(&mut self, next: ExecutionPhase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "invalid execution transition {:?} -> {:?}",
            self.phase,
            next
        );
        tracing::trace!(
            "execution {}: {:?} -> {:?}",
            self.execution_count,
            self.phase,
            next
        );
        self.phase = next;
    }
}

/// Handle `execute_request`.
///
/// Every failure, including a malformed request, ends in an `error`
/// broadcast and an `execute_reply` with status `error`.
pub async fn handle_execute_request(
    evaluator: &dyn Evaluator,
    state: &mut KernelState,
    receipt: &Receipt,
) -> Result<()> {
    let request = receipt.request();
    let (code, silent) = match request
        .content_str("code")
        .and_then(|code| Ok((code.to_string(), request.content_bool("silent")?)))
    {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!("malformed execute_request: {}", e);
            let count = state.execution_count;
            publish_failure(receipt, &e).await;
            return receipt.reply(EXECUTE_REPLY, error_reply(count, &e)).await;
        }
    };

    if !silent {
        state.execution_count += 1;
    }
    let mut session = ExecuteSession {
        receipt,
        phase: ExecutionPhase::Received,
        execution_count: state.execution_count,
    };

    if let Err(e) = receipt
        .publish_execute_input(session.execution_count, &code)
        .await
    {
        tracing::warn!("failed to publish execute_input: {}", e);
    }
    session.advance(ExecutionPhase::InputPublished);

    let capture = StreamCapture::start(receipt, state.capture_process_output).await;
    session.advance(ExecutionPhase::Capturing);

    evaluator.setup_display(DisplayHandle::new(receipt.clone()));
    session.advance(ExecutionPhase::Evaluating);
    let outcome = with_recovery(
        async {
            let code = evaluator
                .remove_special_commands(capture.out_err(), &code)
                .await?;
            evaluator.evaluate(&code, capture.out_err()).await
        },
        "evaluate",
    )
    .await;
    evaluator.teardown_display();
    capture.finish().await;

    let content = match outcome {
        Ok(data) => {
            session.advance(ExecutionPhase::Succeeded);
            publish_success(&session, silent, &data).await;
            json!({
                "status": "ok",
                "execution_count": session.execution_count,
                "user_expressions": {},
            })
        }
        Err(e) => {
            session.advance(ExecutionPhase::Failed);
            tracing::debug!("execution {} failed: {}", session.execution_count, e);
            publish_failure(receipt, &e).await;
            error_reply(session.execution_count, &e)
        }
    };

    receipt.reply(EXECUTE_REPLY, content).await?;
    session.advance(ExecutionPhase::ReplySent);
    Ok(())
}

async fn publish_success(session: &ExecuteSession<'_>, silent: bool, data: &Data) {
    if silent || data.is_empty() {
        return;
    }
    if let Err(e) = session
        .receipt
        .publish_execute_result(session.execution_count, data)
        .await
    {
        tracing::warn!("failed to publish execute_result: {}", e);
    }
}

async fn publish_failure(receipt: &Receipt, err: &Error) {
    let evalue = err.to_string();
    if let Err(e) = receipt
        .publish_error(err.ename(), &evalue, &[evalue.clone()])
        .await
    {
        tracing::warn!("failed to publish error: {}", e);
    }
}

fn error_reply(execution_count: u32, err: &Error) -> Value {
    json!({
        "status": "error",
        "execution_count": execution_count,
        "ename": err.ename(),
        "evalue": err.to_string(),
        "traceback": Value::Null,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        use ExecutionPhase::*;
        assert!(Received.can_transition_to(InputPublished));
        assert!(Evaluating.can_transition_to(Failed));
        assert!(Failed.can_transition_to(ReplySent));
        assert!(!Received.can_transition_to(Evaluating));
        assert!(!Succeeded.can_transition_to(Failed));
        assert!(!ReplySent.can_transition_to(Received));
    }
}
