//! `PgListener`-backed notification source.

use super::{NotificationConnector, NotificationStream};
use crate::error::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tracing::debug;

/// Opens a dedicated LISTEN connection using the pool's connect options.
#[derive(Clone)]
pub struct PgNotificationConnector {
    pool: PgPool,
}

impl PgNotificationConnector {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationConnector for PgNotificationConnector {
    async fn connect(&self, channel: &str) -> Result<Box<dyn NotificationStream>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(channel).await?;
        debug!(channel, "LISTEN established");
        Ok(Box::new(PgNotificationStream { listener }))
    }
}

struct PgNotificationStream {
    listener: PgListener,
}

#[async_trait]
impl NotificationStream for PgNotificationStream {
    async fn next_payload(&mut self) -> Result<Option<String>> {
        // `try_recv` yields `None` when the connection is lost instead of
        // silently reconnecting; the bridge owns reconnection.
        let notification = self.listener.try_recv().await?;
        Ok(notification.map(|n| n.payload().to_owned()))
    }
}
