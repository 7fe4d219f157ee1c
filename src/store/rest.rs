use crate::store::{CounterStore, WindowCounts, DECREMENT_SCRIPT};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(
        #[source]
        #[from]
        reqwest::Error,
    ),
    #[error("Unable to decode store reply: {0}")]
    Decode(
        #[source]
        #[from]
        serde_json::Error,
    ),
    #[error("Store rejected the command: {0}")]
    Command(String),
    #[error("Unexpected response status: {0}")]
    Status(StatusCode),
    #[error("Unexpected reply from store: {0}")]
    UnexpectedReply(Value),
}

/// A [CounterStore] speaking the Redis-over-REST protocol used by Upstash.
///
/// Each command is sent as a JSON array to the base URL, transactions are sent to `/multi-exec`,
/// and the token is passed as a bearer token.
#[derive(Clone)]
pub struct RestStore {
    client: Client,
    url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(default)]
    result: Value,
    error: Option<String>,
}

impl Reply {
    fn into_result(self) -> Result<Value, Error> {
        match self.error {
            Some(error) => Err(Error::Command(error)),
            None => Ok(self.result),
        }
    }
}

impl RestStore {
    /// Create a RestStoreBuilder.
    ///
    /// # Arguments
    ///
    /// * `url`: Base URL of the REST endpoint, e.g. `https://eu1-example.upstash.io`
    /// * `token`: Bearer token for the endpoint
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use actix_sliding_rate_limit::store::rest::RestStore;
    /// let store = RestStore::builder("https://eu1-example.upstash.io", "token")
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn builder(url: &str, token: &str) -> Builder {
        Builder {
            url: url.trim_end_matches('/').to_owned(),
            token: token.to_owned(),
            timeout: DEFAULT_TIMEOUT,
            client: None,
        }
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, Error>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .client
            .post(format!("{}{}", self.url, path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            return Err(match serde_json::from_slice::<Reply>(&bytes) {
                Ok(Reply {
                    error: Some(error), ..
                }) => Error::Command(error),
                _ => Error::Status(status),
            });
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn command(&self, command: &[&str]) -> Result<Value, Error> {
        let reply: Reply = self.post("", command).await?;
        reply.into_result()
    }

    /// Run the commands atomically, returning one result per command.
    async fn transaction(&self, commands: &[&[&str]]) -> Result<Vec<Value>, Error> {
        let replies: Vec<Reply> = self.post("/multi-exec", commands).await?;
        if replies.len() != commands.len() {
            return Err(Error::UnexpectedReply(Value::from(replies.len())));
        }
        replies.into_iter().map(Reply::into_result).collect()
    }
}

/// Missing keys (null) count as zero, negative counters are clamped to zero.
fn count(value: &Value) -> Result<u64, Error> {
    let n = match value {
        Value::Null => Some(0),
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    };
    n.map(|n| n.max(0) as u64)
        .ok_or_else(|| Error::UnexpectedReply(value.clone()))
}

impl CounterStore for RestStore {
    type Error = Error;

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, Self::Error> {
        let ttl = ttl.as_millis().max(1).to_string();
        let results = self
            .transaction(&[
                // Create the key with an expiry, only if it doesn't already exist
                &["SET", key, "0", "PX", ttl.as_str(), "NX"],
                &["INCR", key],
            ])
            .await?;
        count(&results[1])
    }

    async fn decrement(&self, key: &str) -> Result<(), Self::Error> {
        self.command(&["EVAL", DECREMENT_SCRIPT, "1", key]).await?;
        Ok(())
    }

    async fn window_counts(
        &self,
        current_key: &str,
        previous_key: &str,
    ) -> Result<WindowCounts, Self::Error> {
        let result = self.command(&["MGET", current_key, previous_key]).await?;
        match result.as_array().map(Vec::as_slice) {
            Some([current, previous]) => Ok(WindowCounts {
                current: count(current)?,
                previous: count(previous)?,
            }),
            _ => Err(Error::UnexpectedReply(result)),
        }
    }

    async fn remove(&self, keys: &[&str]) -> Result<(), Self::Error> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut command = vec!["DEL"];
        command.extend_from_slice(keys);
        self.command(&command).await?;
        Ok(())
    }

    async fn time(&self) -> Result<Option<Duration>, Self::Error> {
        let result = self.command(&["TIME"]).await?;
        match result.as_array().map(Vec::as_slice) {
            Some([seconds, micros]) => {
                let seconds = count(seconds)?;
                let micros = count(micros)?;
                Ok(Some(
                    Duration::from_secs(seconds) + Duration::from_micros(micros),
                ))
            }
            _ => Err(Error::UnexpectedReply(result)),
        }
    }
}

pub struct Builder {
    url: String,
    token: String,
    timeout: Duration,
    client: Option<Client>,
}

impl Builder {
    /// Total time allowed for each HTTP call, defaults to [DEFAULT_TIMEOUT].
    ///
    /// Ignored if a client is supplied with [Builder::client].
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Use an existing [Client], e.g. to share its connection pool.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn build(self) -> Result<RestStore, Error> {
        let client = match self.client {
            Some(client) => client,
            None => Client::builder().timeout(self.timeout).build()?,
        };
        Ok(RestStore {
            client,
            url: self.url,
            token: self.token,
        })
    }
}
