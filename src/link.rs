use anyhow::Context;
use futures::{future::BoxFuture, FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const DEFAULT_FRAME_BUFFER: usize = 64;

/// An open connection to the tracking device, seen as a pair of channels.
///
/// `frames` yields raw inbound text frames and ends when the device side
/// closes. Anything pushed into `commands` is written to the device; dropping
/// every sender closes the connection.
pub struct DeviceLink {
    pub frames: mpsc::Receiver<String>,
    pub commands: mpsc::UnboundedSender<String>,
}

/// Opens links to a device endpoint.
pub trait Connector: Send + Sync + 'static {
    fn open(&self, endpoint: &str) -> BoxFuture<'static, anyhow::Result<DeviceLink>>;
}

/// WebSocket transport used against real hardware.
#[derive(Debug, Clone)]
pub struct WsConnector {
    frame_buffer: usize,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            frame_buffer: DEFAULT_FRAME_BUFFER,
        }
    }
}

impl Connector for WsConnector {
    fn open(&self, endpoint: &str) -> BoxFuture<'static, anyhow::Result<DeviceLink>> {
        let endpoint = endpoint.to_string();
        let frame_buffer = self.frame_buffer.max(1);

        async move {
            let (ws_stream, _) = connect_async(endpoint.as_str())
                .await
                .with_context(|| format!("failed to open websocket to {endpoint}"))?;
            info!(%endpoint, "websocket to device established");

            let (mut ws_tx, mut ws_rx) = ws_stream.split();
            let (frames_tx, frames_rx) = mpsc::channel::<String>(frame_buffer);
            let (commands_tx, mut commands_rx) = mpsc::unbounded_channel::<String>();

            tokio::spawn(async move {
                while let Some(text) = commands_rx.recv().await {
                    if let Err(err) = ws_tx.send(Message::text(text)).await {
                        warn!(?err, "failed to write command frame");
                        break;
                    }
                }
                let _ = ws_tx.close().await;
            });

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = frames_tx.closed() => break,
                        msg = ws_rx.next() => match msg {
                            Some(Ok(Message::Close(frame))) => {
                                info!(?frame, "device closed the websocket");
                                break;
                            }
                            Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                                let text = match msg.to_text() {
                                    Ok(t) => t.to_string(),
                                    Err(err) => {
                                        warn!(?err, "dropping non-utf8 frame from device");
                                        continue;
                                    }
                                };
                                if frames_tx.send(text).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                warn!(?err, "websocket receive error");
                                break;
                            }
                            None => break,
                        },
                    }
                }
                debug!("device reader finished");
            });

            Ok(DeviceLink {
                frames: frames_rx,
                commands: commands_tx,
            })
        }
        .boxed()
    }
}
