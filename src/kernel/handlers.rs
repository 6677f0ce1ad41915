//! Handlers for the non-execute requests.

use serde_json::{json, Value};

use super::receipt::Receipt;
use crate::evaluator::Evaluator;
use crate::types::{Error, Result};
use crate::wire::message::{COMPLETE_REPLY, KERNEL_INFO_REPLY, SHUTDOWN_REPLY};

pub async fn handle_kernel_info_request(evaluator: &dyn Evaluator, receipt: &Receipt) -> Result<()> {
    let mut content = serde_json::to_value(evaluator.kernel_info())?;
    if let Value::Object(map) = &mut content {
        map.insert("status".to_string(), json!("ok"));
    }
    receipt.reply(KERNEL_INFO_REPLY, content).await
}

/// Reply with completion candidates. No candidates is reported as an error
/// reply, as is a request without `code` and `cursor_pos`.
pub async fn handle_complete_request(evaluator: &dyn Evaluator, receipt: &Receipt) -> Result<()> {
    let request = receipt.request();
    let (code, cursor_pos) = match request
        .content_str("code")
        .and_then(|code| Ok((code, request.content_usize("cursor_pos")?)))
    {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!("malformed complete_request: {}", e);
            return receipt.reply(COMPLETE_REPLY, error_content(&e)).await;
        }
    };

    let completion = evaluator.complete(code, cursor_pos);
    let content = if completion.matches.is_empty() {
        json!({
            "status": "error",
            "ename": "ERROR",
            "evalue": "no completions found",
            "traceback": Value::Null,
        })
    } else {
        json!({
            "status": "ok",
            "matches": completion.matches,
            "cursor_start": completion.cursor_start,
            "cursor_end": completion.cursor_end,
            "metadata": {},
        })
    };
    receipt.reply(COMPLETE_REPLY, content).await
}

/// Reply to `shutdown_request`, echoing the restart flag. Returns that flag,
/// or `None` when the request was malformed and the kernel keeps serving.
pub async fn handle_shutdown_request(receipt: &Receipt) -> Result<Option<bool>> {
    let restart = match receipt.request().content_bool("restart") {
        Ok(restart) => restart,
        Err(e) => {
            tracing::warn!("malformed shutdown_request: {}", e);
            receipt.reply(SHUTDOWN_REPLY, error_content(&e)).await?;
            return Ok(None);
        }
    };
    receipt
        .reply(SHUTDOWN_REPLY, json!({ "status": "ok", "restart": restart }))
        .await?;
    Ok(Some(restart))
}

fn error_content(err: &Error) -> Value {
    json!({
        "status": "error",
        "ename": err.ename(),
        "evalue": err.to_string(),
        "traceback": Value::Null,
    })
}
