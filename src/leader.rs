//! Leadership as a capability.
//!
//! The cycle driver takes a token at the start of a cycle and must
//! re-validate it immediately before anything escapes the process. Tokens
//! fence both publishing and commits; leadership must never be assumed to
//! persist across a suspension point.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;

/// One acquisition of leadership. Invalidated when leadership is lost; a
/// regained leadership produces a fresh token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderToken {
    legitimate: bool,
    id: Uuid,
}

impl LeaderToken {
    pub fn leader() -> Self {
        Self {
            legitimate: true,
            id: Uuid::new_v4(),
        }
    }

    pub fn not_leader() -> Self {
        Self {
            legitimate: false,
            id: Uuid::new_v4(),
        }
    }

    /// Whether this token was ever a leader token. A legitimate token may
    /// still fail validation if leadership has since moved on.
    pub fn legitimate(&self) -> bool {
        self.legitimate
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

#[async_trait]
pub trait LeaderController: Send + Sync {
    fn get_token(&self) -> LeaderToken;
    fn validate(&self, token: LeaderToken) -> bool;
    async fn run(&self, shutdown: CancellationToken) -> Result<()>;
}

/// A single process that is always leader.
pub struct StandaloneLeaderController {
    token: Mutex<LeaderToken>,
}

impl Default for StandaloneLeaderController {
    fn default() -> Self {
        Self::new()
    }
}

impl StandaloneLeaderController {
    pub fn new() -> Self {
        Self {
            token: Mutex::new(LeaderToken::leader()),
        }
    }

    /// Drop leadership. Test hook; a standalone deployment never calls this.
    pub fn invalidate(&self) {
        *self.token.lock().unwrap() = LeaderToken::not_leader();
    }

    /// Issue a fresh leader token.
    pub fn renew(&self) {
        *self.token.lock().unwrap() = LeaderToken::leader();
    }
}

#[async_trait]
impl LeaderController for StandaloneLeaderController {
    fn get_token(&self) -> LeaderToken {
        *self.token.lock().unwrap()
    }

    fn validate(&self, token: LeaderToken) -> bool {
        let current = self.token.lock().unwrap();
        token.legitimate() && token.id() == current.id()
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        shutdown.cancelled().await;
        Ok(())
    }
}

/// The external coordination service a lease-mode scheduler acquires
/// leadership against.
#[async_trait]
pub trait LeaseApi: Send + Sync {
    /// Attempt to take the lease. Returns false if someone else holds it.
    async fn try_acquire(&self, holder: &str, ttl: Duration) -> Result<bool>;
    /// Extend an already-held lease. Returns false if the lease was lost.
    async fn renew(&self, holder: &str, ttl: Duration) -> Result<bool>;
    async fn release(&self, holder: &str) -> Result<()>;
}

/// Cluster-coordinated leadership through a ttl'd lease. Leadership can be
/// lost asynchronously: a failed or rejected renewal rotates the token so
/// in-flight cycles fail their fence check.
pub struct LeaseLeaderController {
    api: Arc<dyn LeaseApi>,
    holder: String,
    ttl: Duration,
    renew_interval: Duration,
    token: Mutex<LeaderToken>,
}

impl LeaseLeaderController {
    pub fn new(api: Arc<dyn LeaseApi>, ttl: Duration, renew_interval: Duration) -> Self {
        Self {
            api,
            holder: format!("scheduler-{}", Uuid::new_v4()),
            ttl,
            renew_interval,
            token: Mutex::new(LeaderToken::not_leader()),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    fn set_token(&self, token: LeaderToken) {
        *self.token.lock().unwrap() = token;
    }

    async fn tick(&self) {
        if self.get_token().legitimate() {
            match self.api.renew(&self.holder, self.ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(holder = %self.holder, "leadership lease lost");
                    self.set_token(LeaderToken::not_leader());
                }
                Err(e) => {
                    tracing::warn!(holder = %self.holder, error = %e, "lease renewal failed");
                    self.set_token(LeaderToken::not_leader());
                }
            }
        } else {
            match self.api.try_acquire(&self.holder, self.ttl).await {
                Ok(true) => {
                    tracing::info!(holder = %self.holder, "acquired leadership lease");
                    self.set_token(LeaderToken::leader());
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!(holder = %self.holder, error = %e, "lease acquisition failed");
                }
            }
        }
    }
}

#[async_trait]
impl LeaderController for LeaseLeaderController {
    fn get_token(&self) -> LeaderToken {
        *self.token.lock().unwrap()
    }

    fn validate(&self, token: LeaderToken) -> bool {
        let current = self.token.lock().unwrap();
        token.legitimate() && token.id() == current.id()
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(self.renew_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.tick().await,
            }
        }
        if self.get_token().legitimate() {
            self.set_token(LeaderToken::not_leader());
            self.api.release(&self.holder).await?;
        }
        Ok(())
    }
}

/// Single-process lease service. Useful for tests and local clusters; a real
/// deployment points [`LeaseLeaderController`] at its coordination service.
#[derive(Default)]
pub struct InMemoryLeaseApi {
    state: Mutex<Option<(String, std::time::Instant)>>,
}

impl InMemoryLeaseApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand the lease to another holder. Test hook for simulating loss.
    pub fn usurp(&self, holder: &str, ttl: Duration) {
        *self.state.lock().unwrap() =
            Some((holder.to_string(), std::time::Instant::now() + ttl));
    }
}

#[async_trait]
impl LeaseApi for InMemoryLeaseApi {
    async fn try_acquire(&self, holder: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let now = std::time::Instant::now();
        match &*state {
            Some((current, expires)) if current != holder && *expires > now => Ok(false),
            _ => {
                *state = Some((holder.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn renew(&self, holder: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let now = std::time::Instant::now();
        match &*state {
            Some((current, expires)) if current == holder && *expires > now => {
                *state = Some((holder.to_string(), now + ttl));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, holder: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if matches!(&*state, Some((current, _)) if current == holder) {
            *state = None;
        }
        Ok(())
    }
}
