//! Connection supervision.
//!
//! [`ConnectionManager`] owns the connect/retry policy, a background
//! liveness probe, and the [`ClientHandle`] everything else resolves
//! clients through. Failed probes trigger a single-flight reconnect that
//! swaps a fresh client into the handle; consumers never restart.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};

use crate::client::{ClientHandle, Connector, MessagingClient};
use crate::config::ConnectionConfig;
use crate::error::{ClientError, ConnectError};

/// Rolling view of connection health, served on the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionHealth {
    pub is_connected: bool,
    /// Updated on every probe tick and every connect attempt.
    pub last_health_check: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub total_reconnects: u32,
    /// Rolling average, `(avg + sample) / 2`.
    pub avg_response_time_ms: f64,
}

impl ConnectionHealth {
    fn new() -> Self {
        Self {
            is_connected: false,
            last_health_check: Utc::now(),
            consecutive_failures: 0,
            total_reconnects: 0,
            avg_response_time_ms: 0.0,
        }
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    handle: ClientHandle,
    health: Arc<RwLock<ConnectionHealth>>,
    reconnecting: Arc<AtomicBool>,
    probe_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, config: ConnectionConfig) -> Self {
        Self {
            connector,
            config,
            handle: ClientHandle::empty(),
            health: Arc::new(RwLock::new(ConnectionHealth::new())),
            reconnecting: Arc::new(AtomicBool::new(false)),
            probe_task: Mutex::new(None),
        }
    }

    /// The shared handle consumers resolve clients through.
    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    /// Connect with retries and start the liveness probe. Exhausting the
    /// retry budget is fatal; the caller decides what to do with it.
    pub async fn connect(
        &self,
        persist: bool,
    ) -> Result<Arc<dyn MessagingClient>, ConnectError> {
        let client = establish(&self.connector, &self.config, &self.health, persist).await?;
        self.handle.set(client.clone()).await;
        self.start_probe(persist).await;
        Ok(client)
    }

    /// Health snapshot. Pure read, no network.
    pub async fn health(&self) -> ConnectionHealth {
        self.health.read().await.clone()
    }

    /// Stop probing and drop the client. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        if let Some(task) = self.probe_task.lock().await.take() {
            task.abort();
        }
        self.reconnecting.store(false, Ordering::SeqCst);
        self.handle.clear().await;
        self.health.write().await.is_connected = false;
        tracing::info!("disconnected");
    }

    async fn start_probe(&self, persist: bool) {
        if self.config.health_check_interval_ms == 0 {
            return;
        }
        let mut slot = self.probe_task.lock().await;
        if let Some(task) = slot.take() {
            task.abort();
        }
        *slot = Some(tokio::spawn(probe_loop(
            self.connector.clone(),
            self.config.clone(),
            self.handle.clone(),
            self.health.clone(),
            self.reconnecting.clone(),
            persist,
        )));
    }
}

/// Run the retry loop until a client connects or the budget runs out.
/// Health is updated on every attempt.
async fn establish(
    connector: &Arc<dyn Connector>,
    config: &ConnectionConfig,
    health: &Arc<RwLock<ConnectionHealth>>,
    persist: bool,
) -> Result<Arc<dyn MessagingClient>, ConnectError> {
    let attempts = config.max_retries.max(1);
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        let started = Instant::now();
        let result = timeout(config.connection_timeout(), connector.connect(persist)).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        match result {
            Ok(Ok(client)) => {
                let mut health = health.write().await;
                health.is_connected = true;
                health.consecutive_failures = 0;
                health.last_health_check = Utc::now();
                health.avg_response_time_ms = (health.avg_response_time_ms + elapsed_ms) / 2.0;
                if attempt > 1 {
                    tracing::info!(attempt, "connection established after retries");
                }
                return Ok(client);
            }
            Ok(Err(error)) => last_error = error.to_string(),
            Err(_) => last_error = ClientError::Timeout.to_string(),
        }
        {
            let mut health = health.write().await;
            health.is_connected = false;
            health.consecutive_failures += 1;
            health.last_health_check = Utc::now();
        }
        if attempt < attempts {
            let delay = backoff_delay(config.retry_delay_ms, attempt, config.max_backoff_ms);
            tracing::warn!(
                error = %last_error,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "connect attempt failed, retrying"
            );
            sleep(delay).await;
        }
    }
    Err(ConnectError::RetriesExhausted {
        attempts,
        last_error,
    })
}

async fn probe_loop(
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    handle: ClientHandle,
    health: Arc<RwLock<ConnectionHealth>>,
    reconnecting: Arc<AtomicBool>,
    persist: bool,
) {
    loop {
        sleep(config.health_check_interval()).await;
        let Some(client) = handle.try_get().await else {
            continue;
        };

        let started = Instant::now();
        let probe = timeout(config.connection_timeout(), client.list_conversations()).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        match probe {
            Ok(Ok(conversations)) => {
                let mut health = health.write().await;
                health.is_connected = true;
                health.consecutive_failures = 0;
                health.last_health_check = Utc::now();
                health.avg_response_time_ms = (health.avg_response_time_ms + elapsed_ms) / 2.0;
                tracing::debug!(conversations = conversations.len(), "health check passed");
            }
            failed => {
                let error = match failed {
                    Ok(Err(error)) => error.to_string(),
                    _ => ClientError::Timeout.to_string(),
                };
                let failures = {
                    let mut health = health.write().await;
                    health.is_connected = false;
                    health.consecutive_failures += 1;
                    health.last_health_check = Utc::now();
                    health.consecutive_failures
                };
                tracing::warn!(error = %error, consecutive_failures = failures, "health check failed");
                if config.reconnect_on_failure {
                    reconnect(&connector, &config, &handle, &health, &reconnecting, persist)
                        .await;
                }
            }
        }
    }
}

/// Single-flight reconnect: concurrent probe failures collapse into one
/// attempt. The flag is released on drop, so a reconnect cancelled
/// mid-flight (probe task aborted) cannot strand it.
async fn reconnect(
    connector: &Arc<dyn Connector>,
    config: &ConnectionConfig,
    handle: &ClientHandle,
    health: &Arc<RwLock<ConnectionHealth>>,
    reconnecting: &Arc<AtomicBool>,
    persist: bool,
) {
    if reconnecting
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        tracing::debug!("reconnect already in flight");
        return;
    }
    let _flight = FlightGuard(reconnecting);

    tracing::info!("reconnecting after failed health check");
    match establish(connector, config, health, persist).await {
        Ok(client) => {
            handle.set(client).await;
            let mut health = health.write().await;
            health.total_reconnects += 1;
            tracing::info!(total_reconnects = health.total_reconnects, "reconnect succeeded");
        }
        Err(error) => {
            tracing::error!(%error, "reconnect failed");
        }
    }
}

struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn backoff_delay(base_ms: u64, attempt: u32, max_backoff_ms: Option<u64>) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63);
    let mut delay = base_ms.saturating_mul(1u64 << exponent);
    if let Some(cap) = max_backoff_ms {
        delay = delay.min(cap);
    }
    Duration::from_millis(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::{FakeClient, FakeConnector};

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            max_retries: 5,
            retry_delay_ms: 1000,
            max_backoff_ms: None,
            health_check_interval_ms: 30_000,
            connection_timeout_ms: 30_000,
            reconnect_on_failure: true,
        }
    }

    async fn wait_until(what: &str, mut check: impl AsyncFnMut() -> bool) {
        timeout(Duration::from_secs(600), async {
            while !check().await {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(1000, 1, None), Duration::from_millis(1000));
        assert_eq!(backoff_delay(1000, 2, None), Duration::from_millis(2000));
        assert_eq!(backoff_delay(1000, 3, None), Duration::from_millis(4000));
        assert_eq!(backoff_delay(1000, 4, None), Duration::from_millis(8000));
    }

    #[test]
    fn backoff_respects_the_cap() {
        assert_eq!(
            backoff_delay(1000, 10, Some(5000)),
            Duration::from_millis(5000)
        );
        assert_eq!(
            backoff_delay(1000, 2, Some(5000)),
            Duration::from_millis(2000)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connect_retries_until_success() {
        let fake = FakeClient::new("me");
        let connector = Arc::new(FakeConnector::new(fake).fail_first(2));
        let manager = ConnectionManager::new(connector.clone(), test_config());

        let client = manager.connect(true).await.expect("connects eventually");
        assert_eq!(client.inbox_id(), "me");
        assert_eq!(connector.attempts(), 3);

        let health = manager.health().await;
        assert!(health.is_connected);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.total_reconnects, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_fails_after_exhausting_the_budget() {
        let fake = FakeClient::new("me");
        let connector = Arc::new(FakeConnector::new(fake).fail_first(10));
        let config = ConnectionConfig {
            max_retries: 3,
            ..test_config()
        };
        let manager = ConnectionManager::new(connector.clone(), config);

        let error = manager.connect(true).await.err().expect("budget exhausted");
        let ConnectError::RetriesExhausted { attempts, .. } = error;
        assert_eq!(attempts, 3);
        assert_eq!(connector.attempts(), 3);

        let health = manager.health().await;
        assert!(!health.is_connected);
        assert_eq!(health.consecutive_failures, 3);
        assert!(manager.handle().try_get().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent() {
        let fake = FakeClient::new("me");
        let manager = ConnectionManager::new(Arc::new(FakeConnector::new(fake)), test_config());
        manager.connect(true).await.expect("connects");

        manager.disconnect().await;
        manager.disconnect().await;

        assert!(manager.handle().try_get().await.is_none());
        assert!(!manager.health().await.is_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_keeps_health_fresh() {
        let fake = FakeClient::new("me");
        let manager =
            ConnectionManager::new(Arc::new(FakeConnector::new(fake.clone())), test_config());
        manager.connect(true).await.expect("connects");

        wait_until("a probe tick", async || fake.list_count() >= 2).await;
        let health = manager.health().await;
        assert!(health.is_connected);
        assert_eq!(health.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_swaps_in_a_fresh_client() {
        let first = FakeClient::new("first");
        let second = FakeClient::new("second");
        let connector = Arc::new(FakeConnector::with_clients(vec![first.clone(), second]));
        let manager = ConnectionManager::new(connector, test_config());

        let client = manager.connect(true).await.expect("connects");
        assert_eq!(client.inbox_id(), "first");
        first.set_list_failing(true);

        let handle = manager.handle();
        wait_until("reconnect to swap the client", async || {
            handle
                .try_get()
                .await
                .is_some_and(|c| c.inbox_id() == "second")
        })
        .await;
        assert_eq!(manager.health().await.total_reconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_reconnect_releases_the_single_flight_flag() {
        let fake = FakeClient::new("me");
        let connector = Arc::new(FakeConnector::new(fake).fail_first(50));
        let config = ConnectionConfig {
            max_retries: 50,
            ..test_config()
        };
        let handle = ClientHandle::empty();
        let health = Arc::new(RwLock::new(ConnectionHealth::new()));
        let reconnecting = Arc::new(AtomicBool::new(false));

        let task = {
            let connector: Arc<dyn Connector> = connector.clone();
            let handle = handle.clone();
            let health = health.clone();
            let reconnecting = reconnecting.clone();
            tokio::spawn(async move {
                reconnect(&connector, &config, &handle, &health, &reconnecting, true).await;
            })
        };
        wait_until("the reconnect to take the flag", async || {
            reconnecting.load(Ordering::SeqCst)
        })
        .await;

        // Cancel mid-backoff, the way start_probe aborts a live probe task.
        task.abort();
        let _ = task.await;
        assert!(!reconnecting.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_single_flight_releases_after_failure() {
        let first = FakeClient::new("first");
        let second = FakeClient::new("second");
        let connector = Arc::new(FakeConnector::with_clients(vec![first.clone(), second]));
        let config = ConnectionConfig {
            max_retries: 2,
            ..test_config()
        };
        let manager = ConnectionManager::new(connector.clone(), config);

        manager.connect(true).await.expect("connects");
        first.set_list_failing(true);
        // Exhaust one whole reconnect cycle, then let the next one pass.
        connector.set_fail_next(2);

        let handle = manager.handle();
        wait_until("a later reconnect to succeed", async || {
            handle
                .try_get()
                .await
                .is_some_and(|c| c.inbox_id() == "second")
        })
        .await;
        assert_eq!(manager.health().await.total_reconnects, 1);
    }
}
