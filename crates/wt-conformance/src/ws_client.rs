//! WebSocket client for the real-time side of a Web Thing

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::config::TargetConfig;
use crate::error::{ConformanceError, ConformanceResult};
use crate::messages::{Command, Notification};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One open WebSocket connection to a thing
pub struct ThingSocket {
    stream: WsStream,
    receive_timeout: Duration,
}

impl ThingSocket {
    /// The advertised channel URL with the credential attached
    ///
    /// WebSocket upgrades have no header channel for the token, so it travels
    /// as a `jwt` query parameter.
    pub fn channel_url(href: &str, credential: Option<&str>) -> String {
        match credential {
            Some(token) if href.contains('?') => format!("{}&jwt={}", href, token),
            Some(token) => format!("{}?jwt={}", href, token),
            None => href.to_string(),
        }
    }

    /// Connect to an advertised channel URL
    pub async fn connect(href: &str, config: &TargetConfig) -> ConformanceResult<Self> {
        let url = Self::channel_url(href, config.credential());
        debug!(%href, "connecting websocket");

        let (stream, _) = timeout(config.receive_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| ConformanceError::Timeout {
                what: format!("websocket connect to {}", href),
                after: config.receive_timeout,
            })??;

        Ok(Self {
            stream,
            receive_timeout: config.receive_timeout,
        })
    }

    /// Send a command as a text frame
    pub async fn send(&mut self, command: &Command) -> ConformanceResult<()> {
        let text = command.to_json().to_string();
        debug!(message = %text, "websocket send");
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Receive the next notification
    ///
    /// `expecting` describes what the caller waits for and is used in timeout
    /// and close errors.
    pub async fn recv(&mut self, expecting: &str) -> ConformanceResult<Notification> {
        loop {
            let next = timeout(self.receive_timeout, self.stream.next())
                .await
                .map_err(|_| ConformanceError::Timeout {
                    what: expecting.to_string(),
                    after: self.receive_timeout,
                })?;

            let message = match next {
                None
                | Some(Err(tungstenite::Error::ConnectionClosed))
                | Some(Err(tungstenite::Error::AlreadyClosed)) => {
                    return Err(ConformanceError::ConnectionClosed {
                        expecting: expecting.to_string(),
                    })
                }
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(message)) => message,
            };

            match message {
                Message::Text(text) => {
                    debug!(message = %text, "websocket recv");
                    return Notification::parse(&text);
                }
                Message::Close(frame) => {
                    debug!(?frame, "websocket closed by peer");
                    return Err(ConformanceError::ConnectionClosed {
                        expecting: expecting.to_string(),
                    });
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                    trace!("skipping control frame");
                }
                Message::Binary(bytes) => {
                    return Err(ConformanceError::shape(
                        "websocket frame",
                        "a text frame",
                        format!("{} binary bytes", bytes.len()),
                    ))
                }
            }
        }
    }

    /// Close the connection with a normal close frame
    pub async fn close(mut self) -> ConformanceResult<()> {
        debug!("closing websocket");
        match self.stream.close(None).await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
