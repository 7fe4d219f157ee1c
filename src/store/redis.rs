use crate::store::{CounterStore, WindowCounts, DECREMENT_SCRIPT};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(
        #[source]
        #[from]
        redis::RedisError,
    ),
}

/// A [CounterStore] that connects to Redis directly.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
}

impl RedisStore {
    /// # Examples
    ///
    /// ```no_run
    /// # use actix_sliding_rate_limit::store::redis::RedisStore;
    /// # use redis::aio::ConnectionManager;
    /// # async fn example() {
    /// let client = redis::Client::open("redis://127.0.0.1/").unwrap();
    /// let manager = ConnectionManager::new(client).await.unwrap();
    /// let store = RedisStore::new(manager);
    /// # };
    /// ```
    pub fn new(connection: ConnectionManager) -> Self {
        Self { connection }
    }
}

impl CounterStore for RedisStore {
    type Error = Error;

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, Self::Error> {
        let ttl = ttl.as_millis().max(1) as u64;
        let mut pipe = redis::pipe();
        pipe.atomic()
            // Create the key with an expiry, only if it doesn't already exist
            .cmd("SET")
            .arg(key)
            .arg(0)
            .arg("PX")
            .arg(ttl)
            .arg("NX")
            .ignore()
            .cmd("INCR")
            .arg(key);

        let mut con = self.connection.clone();
        let (count,): (i64,) = pipe.query_async(&mut con).await?;
        Ok(count.max(0) as u64)
    }

    async fn decrement(&self, key: &str) -> Result<(), Self::Error> {
        let mut con = self.connection.clone();
        let _: i64 = Script::new(DECREMENT_SCRIPT)
            .key(key)
            .invoke_async(&mut con)
            .await?;
        Ok(())
    }

    async fn window_counts(
        &self,
        current_key: &str,
        previous_key: &str,
    ) -> Result<WindowCounts, Self::Error> {
        let mut con = self.connection.clone();
        let (current, previous): (Option<i64>, Option<i64>) = redis::cmd("MGET")
            .arg(current_key)
            .arg(previous_key)
            .query_async(&mut con)
            .await?;
        Ok(WindowCounts {
            current: current.unwrap_or(0).max(0) as u64,
            previous: previous.unwrap_or(0).max(0) as u64,
        })
    }

    async fn remove(&self, keys: &[&str]) -> Result<(), Self::Error> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut con = self.connection.clone();
        let () = con.del(keys).await?;
        Ok(())
    }

    async fn time(&self) -> Result<Option<Duration>, Self::Error> {
        let mut con = self.connection.clone();
        let (seconds, micros): (u64, u64) = redis::cmd("TIME").query_async(&mut con).await?;
        Ok(Some(
            Duration::from_secs(seconds) + Duration::from_micros(micros),
        ))
    }
}
