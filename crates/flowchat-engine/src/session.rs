use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use flowchat_core::config::RetryConfig;
use flowchat_core::traits::TelemetryPort;

use crate::coordinator::CoordinatorSettings;
use crate::driver::{ConversationDriver, ConversationHandle};
use crate::graph::FlowGraph;

/// Runs one isolated conversation per visitor over a shared flow graph.
pub struct SessionManager {
    graph: Arc<FlowGraph>,
    telemetry: Arc<dyn TelemetryPort>,
    settings: CoordinatorSettings,
    retry: RetryConfig,
    sessions: Mutex<HashMap<String, SessionInfo>>,
}

struct SessionInfo {
    handle: ConversationHandle,
    /// Last `get_or_create` for the key.
    last_active: Instant,
    task: JoinHandle<()>,
}

impl SessionInfo {
    /// Reset (ending the backend session), stop the driver and wait for its
    /// telemetry to drain.
    async fn shut_down(self) {
        self.handle.reset().await.ok();
        self.handle.shutdown();
        self.task.await.ok();
    }
}

impl SessionManager {
    pub fn new(
        graph: Arc<FlowGraph>,
        telemetry: Arc<dyn TelemetryPort>,
        settings: CoordinatorSettings,
        retry: RetryConfig,
    ) -> Self {
        Self {
            graph,
            telemetry,
            settings,
            retry,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn graph(&self) -> &Arc<FlowGraph> {
        &self.graph
    }

    /// Get the conversation for a visitor key (e.g. "web:visitor:12345"),
    /// starting one if the key is new or its driver has stopped. Call it for
    /// every visitor message; it marks the conversation active.
    pub async fn get_or_create(&self, key: &str) -> ConversationHandle {
        let mut sessions = self.sessions.lock().await;
        if let Some(info) = sessions.get_mut(key) {
            if !info.handle.is_closed() {
                info.last_active = Instant::now();
                return info.handle.clone();
            }
        }

        let (driver, handle) = ConversationDriver::build(
            Arc::clone(&self.graph),
            Arc::clone(&self.telemetry),
            self.settings.clone(),
            self.retry.clone(),
        );
        let task = driver.spawn();
        info!(key = %key, "Conversation opened");
        sessions.insert(
            key.to_string(),
            SessionInfo {
                handle: handle.clone(),
                last_active: Instant::now(),
                task,
            },
        );
        handle
    }

    /// Look up a conversation without marking it active.
    pub async fn get(&self, key: &str) -> Option<ConversationHandle> {
        self.sessions
            .lock()
            .await
            .get(key)
            .map(|info| info.handle.clone())
    }

    /// Reset and stop one visitor's conversation, waiting for its telemetry
    /// to drain. Returns false for an unknown key.
    pub async fn close(&self, key: &str) -> bool {
        let Some(info) = self.sessions.lock().await.remove(key) else {
            return false;
        };
        info.shut_down().await;
        info!(key = %key, "Conversation closed");
        true
    }

    /// Close conversations not active for `max_idle`, and drop those whose
    /// driver already stopped. Returns the evicted keys, sorted.
    pub async fn evict_idle(&self, max_idle: Duration) -> Vec<String> {
        let stale: Vec<(String, SessionInfo)> = {
            let mut sessions = self.sessions.lock().await;
            let keys: Vec<String> = sessions
                .iter()
                .filter(|(_, info)| info.handle.is_closed() || info.last_active.elapsed() >= max_idle)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| sessions.remove(&key).map(|info| (key, info)))
                .collect()
        };

        let mut evicted = Vec::with_capacity(stale.len());
        for (key, info) in stale {
            info.shut_down().await;
            info!(key = %key, "Idle conversation evicted");
            evicted.push(key);
        }
        evicted.sort();
        evicted
    }

    /// Evict idle conversations every `every` until `cancel` fires.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        every: Duration,
        max_idle: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let evicted = manager.evict_idle(max_idle).await;
                        if !evicted.is_empty() {
                            debug!(count = evicted.len(), "Reaper pass");
                        }
                    }
                }
            }
        })
    }

    /// Close every conversation.
    pub async fn close_all(&self) {
        for key in self.list().await {
            self.close(&key).await;
        }
    }

    /// List active visitor keys.
    pub async fn list(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}
