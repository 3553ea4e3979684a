//! Shared egress proxy pool.
//!
//! The pool owns every [`ProxyRecord`] and the single active [`ProxySelection`].
//! All mutations (registration, probe results, in-band demotion, selection changes)
//! happen inside one `Mutex` critical section. The active selection is published
//! through an `ArcSwap` written only while that lock is held, so readers never block
//! and never observe a torn value.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::{
    core::proxy::{
        ProbeOutcome, ProxyAddress, ProxyError, ProxyRecord, ProxyResult, ProxySelection,
    },
    metrics::clear_proxy_live_status,
};

/// Point-in-time view of the pool for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub active: String,
    pub total: usize,
    pub live: usize,
    pub proxies: Vec<ProxyRecord>,
}

/// Process-wide proxy pool. Construct once and share via `Arc`.
pub struct ProxyPool {
    records: Mutex<Vec<ProxyRecord>>,
    active: ArcSwap<ProxySelection>,
}

impl Default for ProxyPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyPool {
    /// An empty pool: every call goes direct.
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            active: ArcSwap::from_pointee(ProxySelection::Direct),
        }
    }

    /// Build a pool from configured proxy strings. Duplicates are ignored.
    pub fn from_addresses<S: AsRef<str>>(addresses: &[S]) -> ProxyResult<Self> {
        let pool = Self::new();
        for address in addresses {
            match pool.add(address.as_ref()) {
                Ok(_) | Err(ProxyError::AlreadyRegistered(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(pool)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ProxyRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a proxy in the Unknown state.
    pub fn add(&self, address: &str) -> ProxyResult<ProxyAddress> {
        let parsed = ProxyAddress::new(address)?;
        let mut records = self.lock();
        if records
            .iter()
            .any(|record| record.address.endpoint() == parsed.endpoint())
        {
            return Err(ProxyError::AlreadyRegistered(parsed.endpoint()));
        }
        records.push(ProxyRecord::new(parsed.clone()));
        tracing::info!(proxy = %parsed, "Registered proxy");
        Ok(parsed)
    }

    /// Remove a proxy. If it was the active selection, the next live proxy takes over.
    pub fn remove(&self, address: &str) -> ProxyResult<()> {
        let mut records = self.lock();
        let Some(index) = records
            .iter()
            .position(|record| record.address.matches(address))
        else {
            return Err(ProxyError::NotRegistered(address.to_string()));
        };
        let removed = records.remove(index);
        clear_proxy_live_status(&removed.address.endpoint());
        tracing::info!(proxy = %removed.address, "Removed proxy");

        let was_active = self
            .active
            .load()
            .address()
            .is_some_and(|current| current.matches(address));
        if was_active {
            let selection = Self::select_best(&records, None);
            tracing::warn!(selection = %selection, "Active proxy removed, reselected");
            self.active.store(Arc::new(selection));
        }
        Ok(())
    }

    /// The egress route to use right now. Never blocks.
    pub fn current_selection(&self) -> Arc<ProxySelection> {
        self.active.load_full()
    }

    /// Demote `excluding` (if registered) and select the lowest-latency live proxy other
    /// than it, falling back to a direct connection.
    pub fn promote_next_live(&self, excluding: Option<&str>) -> Arc<ProxySelection> {
        let mut records = self.lock();
        if let Some(failed) = excluding {
            if let Some(record) = records
                .iter_mut()
                .find(|record| record.address.matches(failed))
            {
                record.mark_dead();
            }
        }

        let selection = Arc::new(Self::select_best(&records, excluding));
        self.active.store(selection.clone());
        tracing::warn!(
            failed = excluding.unwrap_or("none"),
            selection = %selection,
            "Promoted next live proxy"
        );
        selection
    }

    /// Record a probe result. Returns false when the proxy is no longer registered.
    pub fn record_probe(&self, address: &ProxyAddress, outcome: ProbeOutcome) -> bool {
        let mut records = self.lock();
        match records
            .iter_mut()
            .find(|record| record.address.endpoint() == address.endpoint())
        {
            Some(record) => {
                record.apply_probe(outcome);
                true
            }
            None => false,
        }
    }

    /// Keep a live active selection; otherwise pick the best live proxy (or direct).
    /// Used at startup and after each health sweep.
    pub fn ensure_selection(&self) -> Arc<ProxySelection> {
        let records = self.lock();
        let current = self.active.load_full();

        let current_is_live = current.address().is_some_and(|address| {
            records
                .iter()
                .any(|record| record.address == *address && record.is_live())
        });
        if current_is_live {
            return current;
        }

        let selection = Arc::new(Self::select_best(&records, None));
        if *selection != *current {
            tracing::info!(previous = %current, selection = %selection, "Proxy selection changed");
            self.active.store(selection.clone());
        }
        selection
    }

    fn select_best(records: &[ProxyRecord], excluding: Option<&str>) -> ProxySelection {
        records
            .iter()
            .filter(|record| record.is_live())
            .filter(|record| excluding.is_none_or(|failed| !record.address.matches(failed)))
            .min_by_key(|record| record.latency_key())
            .map(|record| ProxySelection::Proxy(record.address.clone()))
            .unwrap_or_default()
    }

    /// Registered addresses, for probing outside the lock.
    pub fn addresses(&self) -> Vec<ProxyAddress> {
        self.lock()
            .iter()
            .map(|record| record.address.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn live_count(&self) -> usize {
        self.lock().iter().filter(|record| record.is_live()).count()
    }

    pub fn status(&self) -> PoolStatus {
        let records = self.lock();
        PoolStatus {
            active: self.active.load().to_string(),
            total: records.len(),
            live: records.iter().filter(|record| record.is_live()).count(),
            proxies: records.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::proxy::ProxyState;

    fn live(pool: &ProxyPool, address: &str, millis: u64) {
        let address = ProxyAddress::new(address).unwrap();
        assert!(pool.record_probe(&address, ProbeOutcome::Live(Duration::from_millis(millis))));
    }

    fn active_endpoint(pool: &ProxyPool) -> Option<String> {
        pool.current_selection().address().map(ProxyAddress::endpoint)
    }

    #[test]
    fn test_empty_pool_is_direct() {
        let pool = ProxyPool::new();
        assert_eq!(*pool.current_selection(), ProxySelection::Direct);
        assert_eq!(*pool.promote_next_live(None), ProxySelection::Direct);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_from_addresses_rejects_invalid_and_skips_duplicates() {
        assert!(ProxyPool::from_addresses(&["1.1.1.1:80", "nope"]).is_err());
        let pool = ProxyPool::from_addresses(&["1.1.1.1:80", "1.1.1.1:80:u:p"]).unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_unknown_proxies_are_not_selected() {
        let pool = ProxyPool::from_addresses(&["1.1.1.1:80"]).unwrap();
        assert_eq!(*pool.ensure_selection(), ProxySelection::Direct);
    }

    #[test]
    fn test_ensure_selection_picks_lowest_latency() {
        let pool = ProxyPool::from_addresses(&["1.1.1.1:80", "2.2.2.2:80", "3.3.3.3:80"]).unwrap();
        live(&pool, "1.1.1.1:80", 300);
        live(&pool, "2.2.2.2:80", 100);
        live(&pool, "3.3.3.3:80", 200);

        pool.ensure_selection();
        assert_eq!(active_endpoint(&pool).as_deref(), Some("2.2.2.2:80"));

        // A faster proxy appearing later does not displace a live selection.
        live(&pool, "1.1.1.1:80", 10);
        pool.ensure_selection();
        assert_eq!(active_endpoint(&pool).as_deref(), Some("2.2.2.2:80"));
    }

    #[test]
    fn test_promote_excludes_and_demotes_failed_proxy() {
        let pool = ProxyPool::from_addresses(&["1.1.1.1:80", "2.2.2.2:80"]).unwrap();
        live(&pool, "1.1.1.1:80", 50);
        live(&pool, "2.2.2.2:80", 90);
        pool.ensure_selection();
        assert_eq!(active_endpoint(&pool).as_deref(), Some("1.1.1.1:80"));

        pool.promote_next_live(Some("1.1.1.1:80"));
        assert_eq!(active_endpoint(&pool).as_deref(), Some("2.2.2.2:80"));

        let status = pool.status();
        let failed = status
            .proxies
            .iter()
            .find(|record| record.address.endpoint() == "1.1.1.1:80")
            .unwrap();
        assert_eq!(failed.state, ProxyState::Dead);
        assert_eq!(status.live, 1);
    }

    #[test]
    fn test_promote_falls_back_to_direct() {
        let pool = ProxyPool::from_addresses(&["1.1.1.1:80"]).unwrap();
        live(&pool, "1.1.1.1:80", 50);
        pool.ensure_selection();

        assert_eq!(*pool.promote_next_live(Some("1.1.1.1:80")), ProxySelection::Direct);
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn test_dead_proxy_recovers_on_probe() {
        let pool = ProxyPool::from_addresses(&["1.1.1.1:80"]).unwrap();
        live(&pool, "1.1.1.1:80", 50);
        pool.promote_next_live(Some("1.1.1.1:80"));
        assert_eq!(*pool.current_selection(), ProxySelection::Direct);

        live(&pool, "1.1.1.1:80", 60);
        pool.ensure_selection();
        assert_eq!(active_endpoint(&pool).as_deref(), Some("1.1.1.1:80"));
    }

    #[test]
    fn test_remove_active_reselects() {
        let pool = ProxyPool::from_addresses(&["1.1.1.1:80", "2.2.2.2:80"]).unwrap();
        live(&pool, "1.1.1.1:80", 10);
        live(&pool, "2.2.2.2:80", 20);
        pool.ensure_selection();

        pool.remove("1.1.1.1:80").unwrap();
        assert_eq!(active_endpoint(&pool).as_deref(), Some("2.2.2.2:80"));
        assert_eq!(
            pool.remove("1.1.1.1:80"),
            Err(ProxyError::NotRegistered("1.1.1.1:80".to_string()))
        );
    }

    #[test]
    fn test_add_duplicate_is_rejected() {
        let pool = ProxyPool::new();
        pool.add("1.1.1.1:80").unwrap();
        assert_eq!(
            pool.add("1.1.1.1:80:u:p"),
            Err(ProxyError::AlreadyRegistered("1.1.1.1:80".to_string()))
        );
    }

    #[test]
    fn test_probe_for_removed_proxy_is_ignored() {
        let pool = ProxyPool::new();
        let ghost = ProxyAddress::new("9.9.9.9:80").unwrap();
        assert!(!pool.record_probe(&ghost, ProbeOutcome::Dead));
    }

    #[test]
    fn test_concurrent_failover_never_selects_failed_proxy() {
        let pool = Arc::new(
            ProxyPool::from_addresses(&["1.1.1.1:80", "2.2.2.2:80", "3.3.3.3:80"]).unwrap(),
        );
        live(&pool, "1.1.1.1:80", 10);
        live(&pool, "2.2.2.2:80", 20);
        live(&pool, "3.3.3.3:80", 30);
        pool.ensure_selection();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    pool.promote_next_live(Some("1.1.1.1:80"));
                    pool.current_selection()
                })
            })
            .collect();

        for handle in handles {
            let selection = handle.join().unwrap();
            assert_ne!(
                selection.address().map(ProxyAddress::endpoint).as_deref(),
                Some("1.1.1.1:80")
            );
        }
        assert_eq!(active_endpoint(&pool).as_deref(), Some("2.2.2.2:80"));
    }
}
