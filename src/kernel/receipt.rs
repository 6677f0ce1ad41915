//! Request context handed to every handler.

use serde_json::{json, Value};
use std::sync::Arc;

use super::stream::StreamName;
use crate::data::Data;
use crate::transport::{Channel, SocketGroup};
use crate::types::{Error, Result};
use crate::wire::message::{
    DISPLAY_DATA, ERROR, EXECUTE_INPUT, EXECUTE_RESULT, STATUS, STREAM, UPDATE_DISPLAY_DATA,
};
use crate::wire::{encode, ComposedMessage};

/// Kernel execution state broadcast on iopub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelStatus {
    Busy,
    Idle,
}

impl KernelStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            KernelStatus::Busy => "busy",
            KernelStatus::Idle => "idle",
        }
    }
}

/// A received request plus the sockets needed to answer it.
///
/// Every message sent through a receipt has the request's header as its
/// parent. Replies go back on the channel the request arrived on.
#[derive(Debug, Clone)]
pub struct Receipt {
    request: Arc<ComposedMessage>,
    channel: Channel,
    sockets: SocketGroup,
}

impl Receipt {
    pub fn new(request: ComposedMessage, channel: Channel, sockets: SocketGroup) -> Self {
        Self {
            request: Arc::new(request),
            channel,
            sockets,
        }
    }

    pub fn request(&self) -> &ComposedMessage {
        &self.request
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Send a reply to the requesting client.
    pub async fn reply(&self, msg_type: &str, content: Value) -> Result<()> {
        let msg = self.request.reply(msg_type, content);
        let frames = encode(&msg, &self.sockets.signer)?;
        self.sockets.reply_socket(self.channel).send(frames).await
    }

    /// Broadcast a message on iopub.
    pub async fn publish(&self, msg_type: &str, content: Value) -> Result<()> {
        let msg = self.request.derive(msg_type, content);
        let frames = encode(&msg, &self.sockets.signer)?;
        self.sockets.iopub.send(frames).await
    }

    pub async fn publish_status(&self, status: KernelStatus) -> Result<()> {
        self.publish(STATUS, json!({ "execution_state": status.as_str() }))
            .await
    }

    pub async fn publish_execute_input(&self, execution_count: u32, code: &str) -> Result<()> {
        self.publish(
            EXECUTE_INPUT,
            json!({ "execution_count": execution_count, "code": code }),
        )
        .await
    }

    pub async fn publish_execute_result(&self, execution_count: u32, data: &Data) -> Result<()> {
        self.publish(
            EXECUTE_RESULT,
            json!({
                "execution_count": execution_count,
                "data": data.data,
                "metadata": data.metadata,
            }),
        )
        .await
    }

    pub async fn publish_error(&self, ename: &str, evalue: &str, traceback: &[String]) -> Result<()> {
        self.publish(
            ERROR,
            json!({ "ename": ename, "evalue": evalue, "traceback": traceback }),
        )
        .await
    }

    pub async fn publish_stream(&self, name: StreamName, text: &str) -> Result<()> {
        self.publish(STREAM, json!({ "name": name.as_str(), "text": text }))
            .await
    }

    pub async fn publish_display_data(&self, data: &Data) -> Result<()> {
        self.publish(DISPLAY_DATA, serde_json::to_value(data)?).await
    }

    /// Replace a previously displayed output. `data` must carry a display id.
    pub async fn publish_update_display_data(&self, data: &Data) -> Result<()> {
        if data.display_id().is_none() {
            return Err(Error::protocol(
                "update_display_data requires a transient display_id",
            ));
        }
        self.publish(UPDATE_DISPLAY_DATA, serde_json::to_value(data)?)
            .await
    }
}

/// Display callback installed into an evaluator for the duration of one
/// execution.
#[derive(Debug, Clone)]
pub struct DisplayHandle {
    receipt: Receipt,
}

impl DisplayHandle {
    pub fn new(receipt: Receipt) -> Self {
        Self { receipt }
    }

    /// Publish `data` as a `display_data` message.
    pub async fn display(&self, data: &Data) -> Result<()> {
        self.receipt.publish_display_data(data).await
    }

    /// Publish `data` as an `update_display_data` message.
    pub async fn update(&self, data: &Data) -> Result<()> {
        self.receipt.publish_update_display_data(data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TRANSIENT_DISPLAY_ID;
    use crate::transport::memory::memory_transport;
    use crate::types::SessionId;
    use crate::wire::message::EXECUTE_REQUEST;
    use crate::wire::{decode, Signer};

    fn receipt() -> (Receipt, crate::transport::memory::MemoryPeer) {
        let (group, _inbound, peer) = memory_transport(Signer::unsigned(), 8);
        let request = ComposedMessage::new(
            EXECUTE_REQUEST,
            &SessionId::new(),
            "test",
            json!({"code": "", "silent": false}),
        );
        (Receipt::new(request, Channel::Shell, group), peer)
    }

    #[tokio::test]
    async fn test_update_display_publishes_with_transient_id() {
        let (receipt, mut peer) = receipt();
        let display = DisplayHandle::new(receipt.clone());

        let mut data = Data::text("50%");
        data.transient.insert(TRANSIENT_DISPLAY_ID, "progress");
        display.display(&data).await.unwrap();
        data.data.insert(crate::data::MIME_TYPE_TEXT, "100%");
        display.update(&data).await.unwrap();

        let shown = decode(peer.iopub_rx.recv().await.unwrap(), &Signer::unsigned()).unwrap();
        assert_eq!(shown.msg_type(), DISPLAY_DATA);

        let updated = decode(peer.iopub_rx.recv().await.unwrap(), &Signer::unsigned()).unwrap();
        assert_eq!(updated.msg_type(), UPDATE_DISPLAY_DATA);
        assert_eq!(updated.parent_header.as_ref(), Some(&receipt.request().header));
        assert_eq!(updated.content["transient"]["display_id"], "progress");
        assert_eq!(updated.content["data"]["text/plain"], "100%");
    }

    #[tokio::test]
    async fn test_update_display_without_id_is_rejected() {
        let (receipt, mut peer) = receipt();
        let display = DisplayHandle::new(receipt);

        let err = display.update(&Data::text("x")).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(peer.iopub_rx.try_recv().is_err());
    }
}
