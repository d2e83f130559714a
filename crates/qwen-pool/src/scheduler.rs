//! Periodic pool refresh
//!
//! One logical timer task sweeps the pool every `interval_min` minutes:
//! reload from the store (to pick up externally uploaded tokens), re-probe
//! the upstream version, then fan-out refresh. Errors back off for five
//! minutes instead of killing the loop; nothing here ever propagates failure
//! to the foreground.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use common::clock::now_ms;

use crate::error::{Error, Result};
use crate::pool::TokenPool;
use crate::version::VersionProbe;

/// Sleep after an unexpected refresh error before the next attempt.
const ERROR_BACKOFF: Duration = Duration::from_secs(300);

/// Scheduler state snapshot for the admin surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub is_running: bool,
    /// Minutes between sweeps
    pub refresh_interval: u64,
    pub last_refresh_time: Option<i64>,
    pub next_refresh_time: Option<i64>,
    pub refresh_count: u64,
    pub failed_refresh_count: u64,
    pub token_count: usize,
}

struct SchedulerTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Minute-cadence refresh loop over the token pool.
pub struct RefreshScheduler {
    pool: Arc<TokenPool>,
    version: Arc<VersionProbe>,
    interval_min: AtomicU64,
    task: Mutex<Option<SchedulerTask>>,
    last_refresh_ms: AtomicI64,
    refresh_count: AtomicU64,
    failed_refresh_count: AtomicU64,
}

impl RefreshScheduler {
    pub fn new(pool: Arc<TokenPool>, version: Arc<VersionProbe>, interval_min: u64) -> Self {
        Self {
            pool,
            version,
            interval_min: AtomicU64::new(interval_min.max(1)),
            task: Mutex::new(None),
            last_refresh_ms: AtomicI64::new(0),
            refresh_count: AtomicU64::new(0),
            failed_refresh_count: AtomicU64::new(0),
        }
    }

    /// Start the loop, performing one immediate sweep first. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            warn!("scheduler already running");
            return;
        }

        info!(
            interval_min = self.interval_min.load(Ordering::Relaxed),
            "refresh scheduler starting"
        );

        if let Err(e) = self.refresh_once().await {
            error!(error = %e, "initial refresh failed");
            self.failed_refresh_count.fetch_add(1, Ordering::Relaxed);
        }

        let cancel = CancellationToken::new();
        let this = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { this.run_loop(token).await });
        *task = Some(SchedulerTask { handle, cancel });
    }

    /// Cancel the loop and await its termination. Idempotent.
    pub async fn stop(&self) {
        let task = self.task.lock().await.take();
        if let Some(SchedulerTask { handle, cancel }) = task {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "scheduler task ended abnormally");
            }
            info!("refresh scheduler stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }

    /// One out-of-band sweep. Only permitted while the loop is running.
    pub async fn force_refresh_now(&self) -> Result<()> {
        if !self.is_running().await {
            return Err(Error::SchedulerNotRunning);
        }
        info!("forced refresh requested");
        match self.refresh_once().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.failed_refresh_count.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Change the sweep cadence; takes effect from the next tick.
    pub fn set_interval(&self, minutes: u64) -> Result<()> {
        if minutes < 1 {
            return Err(Error::InvalidInterval);
        }
        let old = self.interval_min.swap(minutes, Ordering::Relaxed);
        info!(from_min = old, to_min = minutes, "refresh interval updated");
        Ok(())
    }

    pub async fn status(&self) -> SchedulerStatus {
        let is_running = self.is_running().await;
        let interval = self.interval_min.load(Ordering::Relaxed);
        let last = self.last_refresh_ms.load(Ordering::Relaxed);
        let last_refresh_time = (last > 0).then_some(last);
        let next_refresh_time = match (is_running, last_refresh_time) {
            (true, Some(last)) => Some(last + (interval as i64) * 60_000),
            _ => None,
        };

        SchedulerStatus {
            is_running,
            refresh_interval: interval,
            last_refresh_time,
            next_refresh_time,
            refresh_count: self.refresh_count.load(Ordering::Relaxed),
            failed_refresh_count: self.failed_refresh_count.load(Ordering::Relaxed),
            token_count: self.pool.len().await,
        }
    }

    async fn run_loop(&self, cancel: CancellationToken) {
        info!("refresh scheduler loop running");
        loop {
            let interval =
                Duration::from_secs(self.interval_min.load(Ordering::Relaxed) * 60);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            if let Err(e) = self.refresh_once().await {
                error!(error = %e, "scheduled refresh failed, backing off");
                self.failed_refresh_count.fetch_add(1, Ordering::Relaxed);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
            }
        }
        info!("refresh scheduler loop exited");
    }

    async fn refresh_once(&self) -> Result<()> {
        self.last_refresh_ms.store(now_ms(), Ordering::Relaxed);

        // Pick up tokens uploaded since the last sweep
        self.pool.reload().await?;
        if self.pool.is_empty().await {
            info!("no tokens to refresh");
            return Ok(());
        }

        // Keep the User-Agent current while we're at it; failures fall back
        let _ = self.version.refresh().await;

        let summary = self.pool.refresh_all().await;
        self.refresh_count.fetch_add(1, Ordering::Relaxed);

        let succeeded = summary.results.iter().filter(|r| r.success).count();
        let failed = summary.results.len() - succeeded;
        if failed > 0 {
            self.failed_refresh_count
                .fetch_add(failed as u64, Ordering::Relaxed);
            warn!(succeeded, failed, remaining = summary.remaining, "refresh sweep had failures");
        } else {
            info!(succeeded, remaining = summary.remaining, "refresh sweep complete");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::{get, post};
    use qwen_auth::{OAuthConfig, TokenData};
    use qwen_store::Store;

    async fn mock_upstream() -> String {
        let app = Router::new()
            .route(
                "/api/v1/oauth2/token",
                post(|| async {
                    axum::Json(serde_json::json!({
                        "access_token": "at_refreshed",
                        "refresh_token": "rt_refreshed",
                        "expires_in": 7200
                    }))
                }),
            )
            .route(
                "/registry/latest",
                get(|| async { axum::Json(serde_json::json!({"version": "0.0.42"})) }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn scheduler_under_test(base_url: &str) -> (Arc<Store>, Arc<RefreshScheduler>) {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let probe = Arc::new(
            VersionProbe::new(store.clone(), reqwest::Client::new())
                .with_registry_url(format!("{base_url}/registry/latest")),
        );
        let oauth = OAuthConfig {
            base_url: base_url.to_string(),
            ..OAuthConfig::default()
        };
        let pool = Arc::new(TokenPool::new(
            store.clone(),
            oauth,
            reqwest::Client::new(),
            probe.clone(),
            chrono_tz::Tz::UTC,
        ));
        (store, Arc::new(RefreshScheduler::new(pool, probe, 30)))
    }

    fn stored_token() -> TokenData {
        TokenData {
            access_token: "at_old".into(),
            refresh_token: "rt_old".into(),
            expires_at: Some(now_ms() + 60_000),
            uploaded_at: 1_700_000_000_000,
            usage_count: 0,
        }
    }

    #[tokio::test]
    async fn interval_bounds() {
        let url = mock_upstream().await;
        let (_, scheduler) = scheduler_under_test(&url).await;
        assert!(matches!(
            scheduler.set_interval(0),
            Err(Error::InvalidInterval)
        ));
        assert!(scheduler.set_interval(1).is_ok());
        assert_eq!(scheduler.status().await.refresh_interval, 1);
    }

    #[tokio::test]
    async fn start_runs_an_immediate_sweep() {
        let url = mock_upstream().await;
        let (store, scheduler) = scheduler_under_test(&url).await;
        store.upsert_token("id1", &stored_token()).await.unwrap();

        scheduler.start().await;

        let status = scheduler.status().await;
        assert!(status.is_running);
        assert_eq!(status.refresh_count, 1);
        assert_eq!(status.failed_refresh_count, 0);
        assert!(status.last_refresh_time.is_some());
        assert!(status.next_refresh_time.is_some());

        // The sweep reached the store
        let all = store.load_all_tokens().await.unwrap();
        assert_eq!(all["id1"].access_token, "at_refreshed");

        scheduler.stop().await;
        assert!(!scheduler.status().await.is_running);
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let url = mock_upstream().await;
        let (_, scheduler) = scheduler_under_test(&url).await;
        scheduler.start().await;
        scheduler.start().await;
        assert!(scheduler.is_running().await);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let url = mock_upstream().await;
        let (_, scheduler) = scheduler_under_test(&url).await;
        scheduler.stop().await;
        assert!(!scheduler.is_running().await);
    }

    #[tokio::test]
    async fn force_refresh_requires_running() {
        let url = mock_upstream().await;
        let (store, scheduler) = scheduler_under_test(&url).await;

        assert!(matches!(
            scheduler.force_refresh_now().await,
            Err(Error::SchedulerNotRunning)
        ));

        scheduler.start().await;
        store.upsert_token("id1", &stored_token()).await.unwrap();
        scheduler.force_refresh_now().await.unwrap();

        let all = store.load_all_tokens().await.unwrap();
        assert_eq!(all["id1"].access_token, "at_refreshed");
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn empty_pool_sweep_counts_nothing() {
        let url = mock_upstream().await;
        let (_, scheduler) = scheduler_under_test(&url).await;
        scheduler.start().await;

        let status = scheduler.status().await;
        // Empty pool: the sweep short-circuits before refresh_all
        assert_eq!(status.refresh_count, 0);
        assert_eq!(status.token_count, 0);
        scheduler.stop().await;
    }
}
