use std::{sync::Arc, time::Duration};

use eyre::Result;
use tokio::{task::JoinSet, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ProxyHealthCheckConfig,
    core::{
        proxy::{ProbeOutcome, ProxySelection},
        proxy_pool::ProxyPool,
    },
    ports::http_client::HttpExecutor,
};

/// Summary of one sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub live: usize,
    pub selection: ProxySelection,
}

/// Periodically probes every registered proxy and keeps the pool's selection live.
pub struct ProxyHealthChecker {
    pool: Arc<ProxyPool>,
    executor: Arc<dyn HttpExecutor>,
    config: ProxyHealthCheckConfig,
}

impl ProxyHealthChecker {
    pub fn new(
        pool: Arc<ProxyPool>,
        executor: Arc<dyn HttpExecutor>,
        config: ProxyHealthCheckConfig,
    ) -> Self {
        Self {
            pool,
            executor,
            config,
        }
    }

    /// Run the sweep loop until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("Proxy health checking is disabled");
            return Ok(());
        }

        let interval = Duration::from_secs(self.config.interval_secs);
        tracing::info!(
            "Starting proxy health checker with interval: {}s, timeout: {}s, probe: {}",
            self.config.interval_secs,
            self.config.timeout_secs,
            self.config.probe_url
        );

        loop {
            // The startup sweep already ran; wait a full interval first.
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(interval) => {}
            }
            self.sweep().await;
        }

        tracing::info!("Proxy health checker stopped");
        Ok(())
    }

    /// Probe all proxies concurrently outside the pool lock, then apply the results
    /// and re-check the active selection.
    pub async fn sweep(&self) -> SweepReport {
        let addresses = self.pool.addresses();
        let timeout = Duration::from_secs(self.config.timeout_secs);

        let mut probes = JoinSet::new();
        for address in addresses {
            let executor = self.executor.clone();
            let probe_url = self.config.probe_url.clone();
            probes.spawn(async move {
                let outcome = executor.probe_proxy(&address, &probe_url, timeout).await;
                (address, outcome)
            });
        }

        let mut probed = 0;
        let mut live = 0;
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((address, outcome)) => {
                    // Removed while the probe was in flight.
                    if !self.pool.record_probe(&address, outcome) {
                        continue;
                    }
                    probed += 1;
                    match outcome {
                        ProbeOutcome::Live(latency) => {
                            live += 1;
                            tracing::debug!(proxy = %address, latency_ms = latency.as_millis() as u64, "Proxy live");
                        }
                        ProbeOutcome::Dead => tracing::warn!(proxy = %address, "Proxy dead"),
                    }
                }
                Err(e) => tracing::error!("Proxy probe task failed: {}", e),
            }
        }

        let selection = self.pool.ensure_selection();
        tracing::info!(probed, live, selection = %selection, "Proxy health sweep completed");
        SweepReport {
            probed,
            live,
            selection: (*selection).clone(),
        }
    }
}
