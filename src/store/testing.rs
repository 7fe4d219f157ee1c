//! Store doubles shared by the unit tests.

use crate::clock::{Clock, ManualClock};
use crate::store::memory::InMemoryStore;
use crate::store::{CounterStore, WindowCounts};
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Store is down")]
pub struct StoreDown;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Mode {
    Healthy,
    /// Every call fails immediately.
    Failing,
    /// Every call never completes.
    Hanging,
}

/// Wraps an [InMemoryStore], counting calls and optionally failing, hanging, or yielding to the
/// executor before each operation so that concurrent callers interleave.
#[derive(Clone)]
pub struct TestStore {
    inner: InMemoryStore,
    mode: Rc<Cell<Mode>>,
    calls: Rc<Cell<usize>>,
    yielding: bool,
    clock: Option<ManualClock>,
}

impl TestStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryStore::builder().with_gc_interval(None).build(),
            mode: Rc::new(Cell::new(Mode::Healthy)),
            calls: Rc::new(Cell::new(0)),
            yielding: false,
            clock: None,
        }
    }

    pub fn yielding(mut self) -> Self {
        self.yielding = true;
        self
    }

    pub fn with_clock(mut self, clock: ManualClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn set_mode(&self, mode: Mode) {
        self.mode.set(mode);
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    async fn enter(&self) -> Result<(), StoreDown> {
        self.calls.set(self.calls.get() + 1);
        match self.mode.get() {
            Mode::Healthy => {
                if self.yielding {
                    tokio::task::yield_now().await;
                }
                Ok(())
            }
            Mode::Failing => Err(StoreDown),
            Mode::Hanging => futures::future::pending().await,
        }
    }
}

impl CounterStore for TestStore {
    type Error = StoreDown;

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, Self::Error> {
        self.enter().await?;
        self.inner.increment(key, ttl).await.map_err(|e| match e {})
    }

    async fn decrement(&self, key: &str) -> Result<(), Self::Error> {
        self.enter().await?;
        self.inner.decrement(key).await.map_err(|e| match e {})
    }

    async fn window_counts(
        &self,
        current_key: &str,
        previous_key: &str,
    ) -> Result<WindowCounts, Self::Error> {
        self.enter().await?;
        self.inner
            .window_counts(current_key, previous_key)
            .await
            .map_err(|e| match e {})
    }

    async fn remove(&self, keys: &[&str]) -> Result<(), Self::Error> {
        self.enter().await?;
        self.inner.remove(keys).await.map_err(|e| match e {})
    }

    async fn time(&self) -> Result<Option<Duration>, Self::Error> {
        self.enter().await?;
        Ok(self.clock.as_ref().map(|clock| clock.now()))
    }
}
