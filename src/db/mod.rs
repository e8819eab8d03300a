//! Postgres-backed job queue and repository.
//!
//! One pool shared by the queue ([`jobs`]) and the domain repository
//! ([`repository`]). Job transitions are written to `job_events` and
//! published with `pg_notify` in the same transaction; the event bridge
//! turns those notifications back into in-process [`Event`]s.

pub mod jobs;
pub mod repository;
mod rows;

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::Event;
use crate::model::job::DEFAULT_MAX_ATTEMPTS;
use crate::queue::EVENT_CHANNEL_CAPACITY;

/// NOTIFY channel carrying serialized [`Event`]s.
pub const EVENT_CHANNEL: &str = "job_events";

pub struct Db {
    pool: PgPool,
    events: broadcast::Sender<Event>,
    default_max_attempts: u32,
}

impl Db {
    pub async fn connect(url: &SecretString) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url.expose_secret())
            .await?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            pool,
            events,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    /// Retry ceiling for jobs enqueued without their own.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts.max(1);
        self
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Forward `job_events` notifications into the channel returned by
    /// `subscribe()`. Without the bridge, subscribers see nothing and
    /// waiters fall back to re-reading jobs.
    pub async fn spawn_event_bridge(&self) -> Result<JoinHandle<()>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(EVENT_CHANNEL).await?;
        let events = self.events.clone();
        info!(channel = EVENT_CHANNEL, "event bridge listening");

        Ok(tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => match Event::decode(notification.payload()) {
                        Ok(event) => {
                            debug!(seq = event.seq, "job event");
                            // No receivers is fine.
                            let _ = events.send(event);
                        }
                        Err(e) => warn!(error = %e, "undecodable job event, skipping"),
                    },
                    Err(e) => {
                        warn!("PgListener error: {e}, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }))
    }
}
