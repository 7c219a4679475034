//! Asynchronous notification channel (`LISTEN`/`NOTIFY`).

use crate::error::{DbError, DbResult};
use crate::models::{Notification, validate_identifier};
use async_trait::async_trait;
use sqlx::postgres::PgListener;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Subscription to server-side notification channels.
#[async_trait]
pub trait NotificationListener: Send + std::fmt::Debug {
    async fn listen(&mut self, channel: &str) -> DbResult<()>;

    async fn unlisten(&mut self, channel: &str) -> DbResult<()>;

    /// Wait for the next notification on any subscribed channel.
    ///
    /// Returns [`DbError::Cancelled`] if `cancel` fires first and
    /// [`DbError::Timeout`] once `timeout` elapses.
    async fn wait_for_notification(
        &mut self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> DbResult<Notification>;
}

/// PostgreSQL listener on a dedicated connection.
pub struct PgNotificationListener {
    listener: PgListener,
    channels: BTreeSet<String>,
}

impl std::fmt::Debug for PgNotificationListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgNotificationListener")
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

impl PgNotificationListener {
    pub fn new(listener: PgListener) -> Self {
        Self {
            listener,
            channels: BTreeSet::new(),
        }
    }

    /// Channels currently subscribed, sorted.
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(String::as_str)
    }
}

#[async_trait]
impl NotificationListener for PgNotificationListener {
    async fn listen(&mut self, channel: &str) -> DbResult<()> {
        validate_identifier("Channel", channel)?;
        self.listener.listen(channel).await?;
        self.channels.insert(channel.to_string());
        debug!(channel = %channel, "Listening");
        Ok(())
    }

    async fn unlisten(&mut self, channel: &str) -> DbResult<()> {
        validate_identifier("Channel", channel)?;
        self.listener.unlisten(channel).await?;
        self.channels.remove(channel);
        debug!(channel = %channel, "Stopped listening");
        Ok(())
    }

    async fn wait_for_notification(
        &mut self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> DbResult<Notification> {
        if self.channels.is_empty() {
            return Err(DbError::invalid_operation(
                "wait_for_notification called without any LISTEN channel",
            ));
        }
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DbError::Cancelled),
            received = tokio::time::timeout(timeout, self.listener.recv()) => received,
        };
        let notification = received
            .map_err(|_| DbError::timeout("wait_for_notification", timeout))??;
        Ok(Notification {
            channel: notification.channel().to_string(),
            payload: notification.payload().to_string(),
            process_id: notification.process_id(),
        })
    }
}
