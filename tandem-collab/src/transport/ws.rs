//! WebSocket connector.
//!
//! Each open socket is split into a writer task and a reader task that talk
//! to the transport over unbounded channels. Dropping the [`Link`] ends the
//! writer, which closes the socket.

use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::{Connector, Link, LinkEvent, TransportError};

#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Connector for WsConnector {
    fn open(&self, url: &str) -> BoxFuture<'static, Result<Link, TransportError>> {
        let url = url.to_owned();
        let limit = self.connect_timeout;

        async move {
            let handshake = tokio_tungstenite::connect_async(url.as_str());
            let (ws_stream, _) = match tokio::time::timeout(limit, handshake).await {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => return Err(TransportError::Connect(format!("{url}: {e}"))),
                Err(_) => return Err(TransportError::Timeout(limit)),
            };
            log::debug!("WebSocket handshake with {url} complete");

            let (mut ws_writer, mut ws_reader) = ws_stream.split();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<LinkEvent>();

            // Writer: forward outbound frames until the link is dropped.
            tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if let Err(e) = ws_writer.send(Message::Text(text.into())).await {
                        log::debug!("WebSocket write failed: {e}");
                        break;
                    }
                }
                let _ = ws_writer.close().await;
            });

            // Reader: text in, errors reported, stream end means closed.
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    let event = match msg {
                        Ok(Message::Text(text)) => LinkEvent::Text(text.as_str().to_owned()),
                        Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                            Ok(text) => LinkEvent::Text(text),
                            Err(_) => {
                                log::warn!("Dropping non UTF-8 binary frame");
                                continue;
                            }
                        },
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            let _ = in_tx.send(LinkEvent::Error(e.to_string()));
                            break;
                        }
                    };
                    if in_tx.send(event).is_err() {
                        break;
                    }
                }
            });

            Ok(Link::new(out_tx, in_rx))
        }
        .boxed()
    }
}
