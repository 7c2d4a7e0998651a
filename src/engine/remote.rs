//! Remote execution nodes and the resilience wrapper around them

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use tracing::{debug, error, info, warn};

use super::config::RemoteConfig;
use super::server::{lock, LocalServer, Server, ServerStats};
use super::task::SharedTask;
use crate::utils::error::{ChannelFault, ServerError};

/// Request/response channel to a remote execution node.
#[async_trait]
pub trait RemoteChannel: Send + Sync + fmt::Debug {
    async fn add_task(&self, task: SharedTask) -> Result<(), ChannelFault>;
    async fn execute_tasks(&self) -> Result<Vec<SharedTask>, ChannelFault>;
    async fn failed_tasks(&self) -> Result<Vec<SharedTask>, ChannelFault>;
    async fn stats(&self) -> Result<ServerStats, ChannelFault>;
    async fn remove_all_tasks(&self) -> Result<Vec<SharedTask>, ChannelFault>;
}

/// Looks up a channel by the logical name a node was bound under.
#[async_trait]
pub trait ChannelResolver: Send + Sync + fmt::Debug {
    async fn resolve(&self, name: &str) -> Result<Arc<dyn RemoteChannel>, ChannelFault>;
}

type ChannelCall<T> = Pin<Box<dyn Future<Output = Result<T, ChannelFault>> + Send>>;

// ============================================================================
// Circuit breaker
// ============================================================================

#[derive(Debug)]
struct BreakerWindow {
    faults: u32,
    started: Instant,
}

/// Counts faults per time window. Once more than `threshold` faults land in
/// the current window, requests fail fast until the window rolls over.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    window: Duration,
    state: Mutex<BreakerWindow>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold,
            window,
            state: Mutex::new(BreakerWindow {
                faults: 0,
                started: Instant::now(),
            }),
        }
    }

    pub fn from_config(config: &RemoteConfig) -> Self {
        Self::new(config.circuit_breaker_threshold, config.circuit_window())
    }

    fn roll(&self, window: &mut BreakerWindow, now: Instant) {
        if now.duration_since(window.started) >= self.window {
            window.faults = 0;
            window.started = now;
        }
    }

    pub fn is_open(&self) -> bool {
        self.is_open_at(Instant::now())
    }

    pub fn is_open_at(&self, now: Instant) -> bool {
        let mut window = lock(&self.state);
        self.roll(&mut window, now);
        window.faults > self.threshold
    }

    /// Count one fault, returning the total for the current window.
    pub fn record_fault(&self) -> u32 {
        self.record_fault_at(Instant::now())
    }

    pub fn record_fault_at(&self, now: Instant) -> u32 {
        let mut window = lock(&self.state);
        self.roll(&mut window, now);
        window.faults = window.faults.saturating_add(1);
        if window.faults == self.threshold.saturating_add(1) {
            warn!(faults = window.faults, threshold = self.threshold, "circuit breaker opened");
        }
        window.faults
    }

    pub fn faults(&self) -> u32 {
        lock(&self.state).faults
    }
}

// ============================================================================
// Remote server
// ============================================================================

/// `Server` implementation that forwards every operation over a
/// `RemoteChannel`, reconnecting through its resolver on faults.
///
/// Accepted tasks stay buffered locally until a batch is confirmed. When a
/// batch cannot be confirmed the buffered tasks are reported through
/// `failed_tasks` so the scheduler can retry them elsewhere.
pub struct RemoteServer {
    name: String,
    resolver: Arc<dyn ChannelResolver>,
    config: RemoteConfig,
    channel: Mutex<Arc<dyn RemoteChannel>>,
    online: AtomicBool,
    queued_tasks: Mutex<Vec<SharedTask>>,
    stranded: Mutex<Vec<SharedTask>>,
    pending_flush: AtomicBool,
    breaker: CircuitBreaker,
}

impl fmt::Debug for RemoteServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteServer")
            .field("name", &self.name)
            .field("online", &self.online.load(Ordering::SeqCst))
            .field("queued_tasks", &lock(&self.queued_tasks).len())
            .field("pending_flush", &self.pending_flush.load(Ordering::SeqCst))
            .finish()
    }
}

impl RemoteServer {
    /// Resolve `name` and wrap the resulting channel.
    pub async fn connect(
        name: impl Into<String>,
        resolver: Arc<dyn ChannelResolver>,
        config: RemoteConfig,
    ) -> Result<Self, ServerError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ServerError::InvalidName(name));
        }

        let channel = resolver.resolve(&name).await.map_err(|fault| {
            error!(server = %name, error = %fault, "remote server could not be resolved");
            match fault {
                ChannelFault::MalformedAddress(_) => ServerError::InvalidName(name.clone()),
                _ => ServerError::NameNotResolved(name.clone()),
            }
        })?;

        info!(server = %name, "connected to remote server");
        Ok(Self {
            breaker: CircuitBreaker::from_config(&config),
            name,
            resolver,
            config,
            channel: Mutex::new(channel),
            online: AtomicBool::new(true),
            queued_tasks: Mutex::new(Vec::new()),
            stranded: Mutex::new(Vec::new()),
            pending_flush: AtomicBool::new(false),
        })
    }

    /// Tasks accepted by the node but not yet confirmed by a batch
    pub fn buffered(&self) -> usize {
        lock(&self.queued_tasks).len()
    }

    pub fn pending_flush(&self) -> bool {
        self.pending_flush.load(Ordering::SeqCst)
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn current_channel(&self) -> Arc<dyn RemoteChannel> {
        lock(&self.channel).clone()
    }

    /// Re-resolve the node by name.
    async fn reconnect(&self) -> bool {
        match self.resolver.resolve(&self.name).await {
            Ok(channel) => {
                *lock(&self.channel) = channel;
                self.online.store(true, Ordering::SeqCst);
                counter!("taskgrid.remote.reconnects_total", 1);
                info!(server = %self.name, "reconnected to remote server");
                true
            }
            Err(fault) => {
                self.online.store(false, Ordering::SeqCst);
                warn!(server = %self.name, error = %fault, "reconnection failed");
                false
            }
        }
    }

    /// Issue the flush deferred by an earlier failure, if any.
    async fn flush_pending(&self, channel: &Arc<dyn RemoteChannel>) -> Result<(), ChannelFault> {
        if !self.pending_flush.load(Ordering::SeqCst) {
            return Ok(());
        }
        let dropped = channel.remove_all_tasks().await?;
        self.pending_flush.store(false, Ordering::SeqCst);
        lock(&self.queued_tasks).clear();
        info!(server = %self.name, dropped = dropped.len(), "deferred flush completed");
        Ok(())
    }

    /// One remote operation with bounded reconnect-and-retry.
    async fn call<T, F>(&self, op: &'static str, request: F) -> Result<T, ServerError>
    where
        F: Fn(Arc<dyn RemoteChannel>) -> ChannelCall<T>,
    {
        let mut budget = self.config.retry_budget;
        loop {
            if self.breaker.is_open() {
                error!(server = %self.name, op, "circuit open, request rejected");
                return Err(ServerError::CircuitOpen {
                    server: self.name.clone(),
                });
            }

            let channel = self.current_channel();
            let result = match self.flush_pending(&channel).await {
                Ok(()) => request(channel).await,
                Err(fault) => Err(fault),
            };

            let fault = match result {
                Ok(value) => {
                    self.online.store(true, Ordering::SeqCst);
                    return Ok(value);
                }
                Err(fault) => fault,
            };

            self.breaker.record_fault();
            warn!(server = %self.name, op, error = %fault, budget, "remote call failed");

            if budget == 0 || !self.reconnect().await {
                self.online.store(false, Ordering::SeqCst);
                return Err(ServerError::unreachable(&self.name, fault));
            }
            budget -= 1;
        }
    }
}

#[async_trait]
impl Server for RemoteServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add_task(&self, task: SharedTask) -> Result<(), ServerError> {
        let sent = task.clone();
        self.call("add_task", move |channel| {
            let task = sent.clone();
            Box::pin(async move { channel.add_task(task).await })
        })
        .await?;

        debug!(server = %self.name, task_id = %task.id(), "remote node accepted task");
        lock(&self.queued_tasks).push(task);
        Ok(())
    }

    async fn execute_tasks(&self) -> Result<Vec<SharedTask>, ServerError> {
        match self
            .call("execute_tasks", |channel| {
                Box::pin(async move { channel.execute_tasks().await })
            })
            .await
        {
            Ok(completed) => {
                lock(&self.queued_tasks).clear();
                Ok(completed)
            }
            Err(e) => {
                let stranded: Vec<SharedTask> = lock(&self.queued_tasks).drain(..).collect();
                if !stranded.is_empty() {
                    warn!(
                        server = %self.name,
                        stranded = stranded.len(),
                        "batch unconfirmed, buffered tasks reported as failed"
                    );
                    lock(&self.stranded).extend(stranded);
                    // whatever is still queued remotely must not run later
                    self.pending_flush.store(true, Ordering::SeqCst);
                }
                Err(e)
            }
        }
    }

    async fn failed_tasks(&self) -> Result<Vec<SharedTask>, ServerError> {
        let stranded: Vec<SharedTask> = lock(&self.stranded).drain(..).collect();
        match self
            .call("failed_tasks", |channel| {
                Box::pin(async move { channel.failed_tasks().await })
            })
            .await
        {
            Ok(mut failed) => {
                failed.extend(stranded);
                Ok(failed)
            }
            Err(e) if stranded.is_empty() => Err(e),
            Err(e) => {
                warn!(server = %self.name, error = %e, "reporting stranded tasks only");
                Ok(stranded)
            }
        }
    }

    async fn stats(&self) -> Result<ServerStats, ServerError> {
        self.call("stats", |channel| Box::pin(async move { channel.stats().await }))
            .await
    }

    async fn remove_all_tasks(&self) -> Result<Vec<SharedTask>, ServerError> {
        match self
            .call("remove_all_tasks", |channel| {
                Box::pin(async move { channel.remove_all_tasks().await })
            })
            .await
        {
            Ok(removed) => {
                lock(&self.queued_tasks).clear();
                Ok(removed)
            }
            Err(e) => {
                self.pending_flush.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn is_online(&self) -> bool {
        if !self.online.load(Ordering::SeqCst) {
            self.reconnect().await;
        }
        self.online.load(Ordering::SeqCst)
    }

    fn duplicate(&self) -> Arc<dyn Server> {
        Arc::new(RemoteServer {
            name: self.name.clone(),
            resolver: self.resolver.clone(),
            config: self.config.clone(),
            channel: Mutex::new(self.current_channel()),
            online: AtomicBool::new(self.online.load(Ordering::SeqCst)),
            queued_tasks: Mutex::new(lock(&self.queued_tasks).clone()),
            stranded: Mutex::new(Vec::new()),
            pending_flush: AtomicBool::new(self.pending_flush.load(Ordering::SeqCst)),
            breaker: CircuitBreaker::from_config(&self.config),
        })
    }
}

// ============================================================================
// In-process transport
// ============================================================================

/// Name → channel table used to resolve nodes without a network.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: DashMap<String, Arc<dyn RemoteChannel>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a channel under `name`, replacing any previous binding.
    pub fn bind(&self, name: impl Into<String>, channel: Arc<dyn RemoteChannel>) {
        let name = name.into();
        debug!(node = %name, "node bound");
        self.nodes.insert(name, channel);
    }

    pub fn unbind(&self, name: &str) -> bool {
        self.nodes.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn is_valid_node_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[async_trait]
impl ChannelResolver for NodeRegistry {
    async fn resolve(&self, name: &str) -> Result<Arc<dyn RemoteChannel>, ChannelFault> {
        if !is_valid_node_name(name) {
            return Err(ChannelFault::MalformedAddress(name.to_string()));
        }
        self.nodes
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ChannelFault::NotBound(name.to_string()))
    }
}

/// Channel that serves requests from a `LocalServer` in the same process.
/// Can be switched unreachable to simulate a node going offline.
#[derive(Debug)]
pub struct LoopbackChannel {
    server: LocalServer,
    reachable: AtomicBool,
    requests: AtomicU64,
}

impl LoopbackChannel {
    pub fn new(server: LocalServer) -> Self {
        Self {
            server,
            reachable: AtomicBool::new(true),
            requests: AtomicU64::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Requests received, reachable or not
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn server(&self) -> &LocalServer {
        &self.server
    }

    fn admit(&self) -> Result<(), ChannelFault> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.is_reachable() {
            Ok(())
        } else {
            Err(ChannelFault::Unreachable(self.server.name().to_string()))
        }
    }
}

fn into_fault(e: ServerError) -> ChannelFault {
    ChannelFault::Unreachable(e.to_string())
}

#[async_trait]
impl RemoteChannel for LoopbackChannel {
    async fn add_task(&self, task: SharedTask) -> Result<(), ChannelFault> {
        self.admit()?;
        self.server.add_task(task).await.map_err(into_fault)
    }

    async fn execute_tasks(&self) -> Result<Vec<SharedTask>, ChannelFault> {
        self.admit()?;
        let completed = self.server.execute_tasks().await.map_err(into_fault)?;
        // a node that drops mid-batch loses the response
        self.admit()?;
        Ok(completed)
    }

    async fn failed_tasks(&self) -> Result<Vec<SharedTask>, ChannelFault> {
        self.admit()?;
        self.server.failed_tasks().await.map_err(into_fault)
    }

    async fn stats(&self) -> Result<ServerStats, ChannelFault> {
        self.admit()?;
        self.server.stats().await.map_err(into_fault)
    }

    async fn remove_all_tasks(&self) -> Result<Vec<SharedTask>, ChannelFault> {
        self.admit()?;
        self.server.remove_all_tasks().await.map_err(into_fault)
    }
}
