//! Axum WebSocket implementation of the signaling transport port.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;

use crate::application::ports::{Frame, SignalingTransport};

/// [`SignalingTransport`] backed by one upgraded WebSocket.
pub struct WsTransport {
    sender: Mutex<SplitSink<WebSocket, Message>>,
    receiver: Mutex<SplitStream<WebSocket>>,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        let (sender, receiver) = socket.split();
        Self {
            sender: Mutex::new(sender),
            receiver: Mutex::new(receiver),
        }
    }
}

#[async_trait]
impl SignalingTransport for WsTransport {
    async fn recv(&self) -> anyhow::Result<Option<Frame>> {
        let mut receiver = self.receiver.lock().await;
        loop {
            match receiver.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(Frame::Text(text))),
                Some(Ok(Message::Pong(_))) => return Ok(Some(Frame::Pong)),
                // The library queues the reply pong itself.
                Some(Ok(Message::Ping(_))) => continue,
                Some(Ok(Message::Binary(_))) => {
                    anyhow::bail!("binary frames are not part of the signaling protocol")
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn send_text(&self, payload: Bytes) -> anyhow::Result<()> {
        let text = String::from_utf8(payload.to_vec())?;
        self.sender
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(Into::into)
    }

    async fn send_ping(&self) -> anyhow::Result<()> {
        self.sender
            .lock()
            .await
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(Into::into)
    }

    async fn send_close(&self) -> anyhow::Result<()> {
        self.sender
            .lock()
            .await
            .send(Message::Close(None))
            .await
            .map_err(Into::into)
    }
}


