use std::time::Duration;

use base64::prelude::*;
use futures::StreamExt;
use metrics::counter;
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

use super::Event;

const EVENT_BUFFER: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub channel: String,
}

/// Receives peer events from the message queue over a websocket.
#[derive(Debug, Clone)]
pub struct Subscriber {
    config: SubscriberConfig,
}

impl Subscriber {
    pub fn new(config: SubscriberConfig) -> Self {
        Self { config }
    }

    fn url(&self) -> String {
        format!(
            "{}/{}",
            self.config.url.trim_end_matches('/'),
            self.config.channel
        )
    }

    /// Connects and starts forwarding events into the returned channel.
    ///
    /// Failing to connect here is an error; once subscribed, dropped
    /// connections are re-established in the background until `shutdown`.
    pub async fn subscribe(
        self,
        shutdown: CancellationToken,
    ) -> Result<mpsc::Receiver<Event>, Error> {
        let stream = self.connect().await?;
        log::info!("subscribed to {}", self.url());

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(self.forward(stream, tx, shutdown));

        Ok(rx)
    }

    async fn connect(&self) -> Result<WsStream, Error> {
        let mut request = self.url().into_client_request()?;
        let credentials = format!("{}:{}", self.config.username, self.config.password);
        let auth = format!("Basic {}", BASE64_STANDARD.encode(credentials));
        let auth = HeaderValue::from_str(&auth)
            .map_err(|_| Error::Config("invalid message-queue credentials".into()))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (stream, _) = connect_async(request).await?;
        Ok(stream)
    }

    async fn forward(
        self,
        mut stream: WsStream,
        tx: mpsc::Sender<Event>,
        shutdown: CancellationToken,
    ) {
        loop {
            loop {
                let msg = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    msg = stream.next() => msg,
                };

                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(event) = decode_event(&text) {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        log::warn!("message-queue error: {err}");
                        break;
                    }
                }
            }

            counter!("event.disconnects").increment(1);
            log::warn!("disconnected from message-queue, reconnecting");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }

                match self.connect().await {
                    Ok(reconnected) => {
                        log::info!("reconnected to message-queue");
                        stream = reconnected;
                        break;
                    }
                    Err(err) => log::warn!("error reconnecting to message-queue: {err}"),
                }
            }
        }
    }
}

fn decode_event(text: &str) -> Option<Event> {
    match serde_json::from_str(text) {
        Ok(event) => Some(event),
        Err(err) => {
            log::warn!("dropping undecodable event: {err}");
            counter!("event.decode_errors").increment(1);
            None
        }
    }
}
