//! Resilient RTM stream client.
//!
//! [`StreamClient::run_forever`] keeps exactly one [`Connection`] alive:
//! when its inbound queue closes the connection is released and a new one is
//! dialled; when nothing arrives for the keepalive interval a ping is queued.
//! Direct messages are handed to an [`InboundHandler`] in arrival order.
//!
//! Dropped connections are recovered here. Failing to establish a new one
//! (endpoint resolution or dial) is returned to the caller.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SlackConfig;
use crate::slack::auth::resolve_endpoint;
use crate::slack::connection::{Connection, OutboundSink};
use crate::slack::message::{InboundMessage, OutboundMessage};
use crate::Result;

/// Receives direct messages from the stream loop.
///
/// Called synchronously from the loop in arrival order. Implementations
/// must not block: queue the work or spawn a task.
pub trait InboundHandler: Send + Sync {
    /// Handle one direct message; replies go to `outbound`.
    fn on_message(&self, message: InboundMessage, outbound: OutboundSink);
}

impl<F> InboundHandler for F
where
    F: Fn(InboundMessage, OutboundSink) + Send + Sync,
{
    fn on_message(&self, message: InboundMessage, outbound: OutboundSink) {
        self(message, outbound);
    }
}

/// Produces fresh connections for the stream loop.
pub trait Connector: Send + Sync {
    /// Establish a new connection.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Auth`](crate::AppError::Auth) when the endpoint
    /// cannot be resolved and [`AppError::Transport`](crate::AppError::Transport)
    /// when it cannot be dialled.
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<Connection>> + Send + '_>>;
}

impl<C: Connector + ?Sized> Connector for Arc<C> {
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<Connection>> + Send + '_>> {
        (**self).connect()
    }
}

/// Connector that resolves the endpoint through `rtm.start` and dials it.
pub struct RtmConnector {
    http: reqwest::Client,
    auth_url: String,
    token: String,
}

impl RtmConnector {
    /// Build a connector from Slack settings (token must be loaded).
    #[must_use]
    pub fn new(config: &SlackConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            auth_url: config.auth_url.clone(),
            token: config.token.clone(),
        }
    }
}

impl fmt::Debug for RtmConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtmConnector")
            .field("auth_url", &self.auth_url)
            .field("token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl Connector for RtmConnector {
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<Connection>> + Send + '_>> {
        Box::pin(async move {
            let url = resolve_endpoint(&self.http, &self.auth_url, &self.token).await?;
            Connection::dial(&url).await
        })
    }
}

/// Auto-reconnecting RTM client with idle keepalive.
#[derive(Debug)]
pub struct StreamClient<C> {
    connector: C,
    keepalive: Duration,
    direct_channel_prefix: String,
}

impl<C: Connector> StreamClient<C> {
    /// Create a client; nothing is dialled until [`run_forever`](Self::run_forever).
    #[must_use]
    pub fn new(connector: C, keepalive: Duration, direct_channel_prefix: impl Into<String>) -> Self {
        Self {
            connector,
            keepalive,
            direct_channel_prefix: direct_channel_prefix.into(),
        }
    }

    /// Establish a new connection through the connector.
    ///
    /// # Errors
    ///
    /// Propagates the connector's `Auth` or `Transport` error.
    pub async fn connect(&self) -> Result<Connection> {
        debug!("establishing rtm connection");
        self.connector.connect().await
    }

    /// Run the receive/reconnect/keepalive loop until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns the error of any connection attempt that fails, including
    /// reconnects after a drop.
    pub async fn run_forever<H>(&self, handler: &H, cancel: CancellationToken) -> Result<()>
    where
        H: InboundHandler + ?Sized,
    {
        let mut connection = self.connect().await?;

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    info!("stream client shutting down");
                    connection.release().await;
                    return Ok(());
                }

                inbound = connection.recv() => match inbound {
                    Some(message) => self.route(handler, message, &connection),
                    None => {
                        warn!(connection_id = %connection.id(), "rtm disconnected, reconnecting");
                        connection.release().await;
                        connection = self.connect().await.map_err(|err| {
                            error!(%err, "unable to reconnect");
                            err
                        })?;
                    }
                },

                () = tokio::time::sleep(self.keepalive) => {
                    debug!("idle, sending keepalive ping");
                    if let Err(err) = connection.outbound().send(OutboundMessage::ping()).await {
                        warn!(%err, "keepalive ping not queued");
                    }
                }
            }
        }
    }

    fn route<H>(&self, handler: &H, message: InboundMessage, connection: &Connection)
    where
        H: InboundHandler + ?Sized,
    {
        if message.is_direct_message(&self.direct_channel_prefix) {
            debug!(
                user = message.user.as_deref().unwrap_or_default(),
                channel = message.channel.as_deref().unwrap_or_default(),
                "direct message received"
            );
            handler.on_message(message, connection.outbound());
        } else {
            debug!(
                kind = message.kind.as_deref().unwrap_or("unknown"),
                "ignoring frame"
            );
        }
    }
}
