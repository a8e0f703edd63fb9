//! Pool and strategy-based account selection
//!
//! The pool owns the accounts; in-flight requests hold `Arc` handles to the
//! account they were dispatched on. Selection runs under a single pool-wide
//! mutex (which doubles as the round-robin cursor guard) so the cursor and
//! the availability snapshot stay coherent. No I/O happens under that lock —
//! persistence is a separate call after the mutating operation completes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::account::{Account, AccountStatus, SharedAccount};
use crate::error::{Error, Result};
use crate::store::AccountStore;

/// Selection strategy over the available subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    RoundRobin,
    Random,
    LeastUsed,
    QuotaAware,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::RoundRobin
    }
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round-robin",
            Strategy::Random => "random",
            Strategy::LeastUsed => "least-used",
            Strategy::QuotaAware => "quota-aware",
        }
    }
}

/// Static pool policy, refreshed on `/accounts/reload`.
#[derive(Debug, Clone, Copy)]
pub struct PoolPolicy {
    pub strategy: Strategy,
    /// Minutes before a 429-marked account re-enters the pool.
    pub retry_429_interval: i64,
    /// Whether status changes and refreshes are written back to disk.
    pub auto_save: bool,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            strategy: Strategy::RoundRobin,
            retry_429_interval: 60,
            auto_save: true,
        }
    }
}

/// Ordered account list plus selection state and persistence sink.
pub struct Pool {
    accounts: RwLock<Vec<SharedAccount>>,
    /// Round-robin cursor; the lock also linearizes every selection.
    select_lock: Mutex<usize>,
    strategy: RwLock<Strategy>,
    auto_save: AtomicBool,
    retry_429_interval: RwLock<i64>,
    store: AccountStore,
}

impl Pool {
    pub fn new(accounts: Vec<Account>, store: AccountStore, policy: PoolPolicy) -> Self {
        info!(
            accounts = accounts.len(),
            strategy = policy.strategy.as_str(),
            retry_429_interval_min = policy.retry_429_interval,
            auto_save = policy.auto_save,
            "pool initialized"
        );
        Self {
            accounts: RwLock::new(
                accounts
                    .into_iter()
                    .map(|a| Arc::new(tokio::sync::RwLock::new(a)))
                    .collect(),
            ),
            select_lock: Mutex::new(0),
            strategy: RwLock::new(policy.strategy),
            auto_save: AtomicBool::new(policy.auto_save),
            retry_429_interval: RwLock::new(policy.retry_429_interval),
            store,
        }
    }

    /// Load the accounts directory and build the pool.
    pub async fn load(store: AccountStore, policy: PoolPolicy) -> Result<Self> {
        let accounts = store.load_directory(policy.retry_429_interval).await?;
        Ok(Self::new(accounts, store, policy))
    }

    /// Pick the next eligible account under the pool mutex.
    pub async fn select(&self) -> Result<SharedAccount> {
        let mut cursor = self.select_lock.lock().await;
        let accounts = self.accounts.read().await;
        if accounts.is_empty() {
            return Err(Error::NoAvailableAccount);
        }

        let strategy = *self.strategy.read().await;
        match strategy {
            Strategy::RoundRobin => {
                // Two full sweeps: the first pass may lazily recover accounts,
                // the second gives every recovered slot a chance.
                for _ in 0..accounts.len() * 2 {
                    let slot = &accounts[*cursor % accounts.len()];
                    *cursor = (*cursor + 1) % accounts.len();
                    let mut account = slot.write().await;
                    if account.is_available() {
                        debug!(account = %account.name, "selected (round-robin)");
                        return Ok(Arc::clone(slot));
                    }
                }
                Err(Error::NoAvailableAccount)
            }
            Strategy::Random => {
                let available = self.available_indices(&accounts).await;
                let idx = available
                    .choose(&mut rand::rng())
                    .copied()
                    .ok_or(Error::NoAvailableAccount)?;
                let name = accounts[idx].read().await.name.clone();
                debug!(account = %name, "selected (random)");
                Ok(Arc::clone(&accounts[idx]))
            }
            Strategy::LeastUsed => {
                let mut best: Option<(usize, u64)> = None;
                for (idx, slot) in accounts.iter().enumerate() {
                    let mut account = slot.write().await;
                    if account.is_available()
                        && best.is_none_or(|(_, count)| account.request_count < count)
                    {
                        best = Some((idx, account.request_count));
                    }
                }
                let (idx, _) = best.ok_or(Error::NoAvailableAccount)?;
                let name = accounts[idx].read().await.name.clone();
                debug!(account = %name, "selected (least-used)");
                Ok(Arc::clone(&accounts[idx]))
            }
            Strategy::QuotaAware => {
                let mut best: Option<(usize, u64)> = None;
                for (idx, slot) in accounts.iter().enumerate() {
                    let mut account = slot.write().await;
                    if account.is_available()
                        && best.is_none_or(|(_, remaining)| account.quota_remaining() > remaining)
                    {
                        best = Some((idx, account.quota_remaining()));
                    }
                }
                let (idx, _) = best.ok_or(Error::NoAvailableAccount)?;
                let name = accounts[idx].read().await.name.clone();
                debug!(account = %name, "selected (quota-aware)");
                Ok(Arc::clone(&accounts[idx]))
            }
        }
    }

    async fn available_indices(&self, accounts: &[SharedAccount]) -> Vec<usize> {
        let mut available = Vec::new();
        for (idx, slot) in accounts.iter().enumerate() {
            if slot.write().await.is_available() {
                available.push(idx);
            }
        }
        available
    }

    /// Persist one account's durable record, honoring the auto-save flag.
    /// Best-effort: a write failure is logged, never propagated.
    pub async fn persist(&self, account: &SharedAccount) {
        if !self.auto_save.load(Ordering::Relaxed) {
            return;
        }
        let record = account.read().await.to_record();
        self.store.save_logged(&record).await;
    }

    /// Append one account, rejecting duplicate names, and persist it.
    pub async fn add_account(&self, name: String, refresh_token: String) -> Result<SharedAccount> {
        let mut accounts = self.accounts.write().await;
        for slot in accounts.iter() {
            if slot.read().await.name == name {
                return Err(Error::DuplicateName(name));
            }
        }
        let interval = *self.retry_429_interval.read().await;
        let account = Account::new(name.clone(), Some(refresh_token), interval);
        self.store.save(&account.to_record()).await?;
        let shared = Arc::new(tokio::sync::RwLock::new(account));
        accounts.push(Arc::clone(&shared));
        info!(account = %name, "account added to pool");
        Ok(shared)
    }

    /// Remove every blocked (403) account from memory and disk. Returns the
    /// removed names.
    pub async fn delete_blocked(&self) -> Vec<String> {
        let mut accounts = self.accounts.write().await;
        let mut kept = Vec::with_capacity(accounts.len());
        let mut removed = Vec::new();
        for slot in accounts.drain(..) {
            let blocked = slot.read().await.status_code == Some(AccountStatus::Blocked);
            if blocked {
                removed.push(slot.read().await.name.clone());
            } else {
                kept.push(slot);
            }
        }
        *accounts = kept;
        drop(accounts);

        for name in &removed {
            if let Err(e) = self.store.delete(name).await {
                tracing::error!(account = %name, error = %e, "failed to delete account file");
            }
            info!(account = %name, "blocked account removed");
        }
        removed
    }

    /// Replace the account list and policy (admin reload).
    pub async fn reload(&self, accounts: Vec<Account>, policy: PoolPolicy) {
        let mut slots = self.accounts.write().await;
        *slots = accounts
            .into_iter()
            .map(|a| Arc::new(tokio::sync::RwLock::new(a)))
            .collect();
        drop(slots);
        *self.strategy.write().await = policy.strategy;
        *self.retry_429_interval.write().await = policy.retry_429_interval;
        self.auto_save.store(policy.auto_save, Ordering::Relaxed);
        *self.select_lock.lock().await = 0;
        info!(strategy = policy.strategy.as_str(), "pool reloaded");
    }

    pub async fn get(&self, name: &str) -> Option<SharedAccount> {
        let accounts = self.accounts.read().await;
        for slot in accounts.iter() {
            if slot.read().await.name == name {
                return Some(Arc::clone(slot));
            }
        }
        None
    }

    /// Snapshot of every account handle.
    pub async fn accounts(&self) -> Vec<SharedAccount> {
        self.accounts.read().await.clone()
    }

    /// (available, total) for the health endpoint.
    pub async fn health_counts(&self) -> (usize, usize) {
        let accounts = self.accounts.read().await;
        let mut available = 0;
        for slot in accounts.iter() {
            if slot.write().await.is_available() {
                available += 1;
            }
        }
        (available, accounts.len())
    }

    /// Totals plus per-account snapshots for `/stats`.
    pub async fn stats(&self) -> serde_json::Value {
        let accounts = self.accounts.read().await;
        let mut total_requests = 0u64;
        let mut total_errors = 0u64;
        let mut enabled = 0usize;
        let mut logged_in = 0usize;
        let mut quota_exceeded = 0usize;
        let mut available = 0usize;
        let mut snapshots = Vec::with_capacity(accounts.len());

        for slot in accounts.iter() {
            let mut account = slot.write().await;
            if account.is_available() {
                available += 1;
            }
            total_requests += account.request_count;
            total_errors += account.error_count;
            if account.enabled {
                enabled += 1;
            }
            if account.is_logged_in {
                logged_in += 1;
            }
            if account.status_code == Some(AccountStatus::QuotaExhausted) {
                quota_exceeded += 1;
            }
            snapshots.push(account.status_json());
        }

        serde_json::json!({
            "total_accounts": accounts.len(),
            "enabled_accounts": enabled,
            "available_accounts": available,
            "logged_in_accounts": logged_in,
            "quota_exceeded_accounts": quota_exceeded,
            "total_requests": total_requests,
            "total_errors": total_errors,
            "strategy": self.strategy.read().await.as_str(),
            "accounts": snapshots,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_pool(names: &[&str], strategy: Strategy) -> Pool {
        let accounts = names
            .iter()
            .map(|n| Account::new(n.to_string(), Some(format!("rt_{n}")), 60))
            .collect();
        let dir = std::env::temp_dir().join(format!("warp-pool-test-{}", std::process::id()));
        Pool::new(
            accounts,
            AccountStore::new(dir),
            PoolPolicy {
                strategy,
                ..PoolPolicy::default()
            },
        )
    }

    #[tokio::test]
    async fn round_robin_cycles_through_accounts() {
        let pool = test_pool(&["a", "b"], Strategy::RoundRobin);
        let mut names = Vec::new();
        for _ in 0..3 {
            let account = pool.select().await.unwrap();
            names.push(account.read().await.name.clone());
        }
        assert_eq!(names, vec!["a", "b", "a"]);
    }

    #[tokio::test]
    async fn round_robin_is_fair_over_many_selections() {
        let pool = test_pool(&["a", "b", "c"], Strategy::RoundRobin);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..10 {
            let account = pool.select().await.unwrap();
            *counts.entry(account.read().await.name.clone()).or_default() += 1;
        }
        // 10 selections over 3 accounts: each chosen 3 or 4 times
        for (name, count) in counts {
            assert!((3..=4).contains(&count), "{name} selected {count} times");
        }
    }

    #[tokio::test]
    async fn round_robin_skips_unavailable() {
        let pool = test_pool(&["a", "b", "c"], Strategy::RoundRobin);
        pool.get("a")
            .await
            .unwrap()
            .write()
            .await
            .mark_status(AccountStatus::Blocked, "Blocked");

        for _ in 0..4 {
            let account = pool.select().await.unwrap();
            assert_ne!(account.read().await.name, "a");
        }
    }

    #[tokio::test]
    async fn empty_pool_yields_no_available_account() {
        let pool = test_pool(&[], Strategy::RoundRobin);
        assert!(matches!(
            pool.select().await,
            Err(Error::NoAvailableAccount)
        ));
    }

    #[tokio::test]
    async fn all_unavailable_yields_no_available_account() {
        let pool = test_pool(&["a", "b"], Strategy::RoundRobin);
        for name in ["a", "b"] {
            pool.get(name)
                .await
                .unwrap()
                .write()
                .await
                .mark_status(AccountStatus::Blocked, "Blocked");
        }
        assert!(matches!(
            pool.select().await,
            Err(Error::NoAvailableAccount)
        ));
    }

    #[tokio::test]
    async fn least_used_picks_minimum_request_count() {
        let pool = test_pool(&["a", "b", "c"], Strategy::LeastUsed);
        pool.get("a").await.unwrap().write().await.request_count = 5;
        pool.get("b").await.unwrap().write().await.request_count = 1;
        pool.get("c").await.unwrap().write().await.request_count = 3;

        let account = pool.select().await.unwrap();
        assert_eq!(account.read().await.name, "b");
    }

    #[tokio::test]
    async fn quota_aware_maximizes_remaining_quota() {
        let pool = test_pool(&["a", "b", "c"], Strategy::QuotaAware);
        for (name, limit, used) in [("a", 100u64, 90u64), ("b", 100, 10), ("c", 100, 50)] {
            let slot = pool.get(name).await.unwrap();
            let mut account = slot.write().await;
            account.quota_limit = limit;
            account.quota_used = used;
        }

        let account = pool.select().await.unwrap();
        assert_eq!(account.read().await.name, "b");
    }

    #[tokio::test]
    async fn random_only_returns_available() {
        let pool = test_pool(&["a", "b"], Strategy::Random);
        pool.get("a")
            .await
            .unwrap()
            .write()
            .await
            .mark_status(AccountStatus::Blocked, "Blocked");
        for _ in 0..5 {
            let account = pool.select().await.unwrap();
            assert_eq!(account.read().await.name, "b");
        }
    }

    #[tokio::test]
    async fn add_account_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::new(
            Vec::new(),
            AccountStore::new(dir.path()),
            PoolPolicy::default(),
        );

        pool.add_account("a".into(), "rt_a".into()).await.unwrap();
        let err = pool.add_account("a".into(), "rt_other".into()).await;
        assert!(matches!(err, Err(Error::DuplicateName(_))));
        assert!(dir.path().join("a.json").exists());
    }

    #[tokio::test]
    async fn delete_blocked_removes_memory_and_disk() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::new(
            Vec::new(),
            AccountStore::new(dir.path()),
            PoolPolicy::default(),
        );
        pool.add_account("ok".into(), "rt1".into()).await.unwrap();
        pool.add_account("bad".into(), "rt2".into()).await.unwrap();
        {
            let slot = pool.get("bad").await.unwrap();
            slot.write().await.mark_status(AccountStatus::Blocked, "Blocked");
            pool.persist(&slot).await;
        }

        let removed = pool.delete_blocked().await;
        assert_eq!(removed, vec!["bad"]);
        assert!(pool.get("bad").await.is_none());
        assert!(!dir.path().join("bad.json").exists());
        assert!(dir.path().join("ok.json").exists());
    }

    #[tokio::test]
    async fn status_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::new(
            Vec::new(),
            AccountStore::new(dir.path()),
            PoolPolicy::default(),
        );
        let slot = pool.add_account("a".into(), "rt_a".into()).await.unwrap();
        slot.write().await.mark_status(AccountStatus::Blocked, "Blocked");
        pool.persist(&slot).await;

        let reloaded = Pool::load(AccountStore::new(dir.path()), PoolPolicy::default())
            .await
            .unwrap();
        let account = reloaded.get("a").await.unwrap();
        assert_eq!(account.read().await.status_code, Some(AccountStatus::Blocked));
    }

    #[tokio::test]
    async fn health_counts_track_availability() {
        let pool = test_pool(&["a", "b"], Strategy::RoundRobin);
        assert_eq!(pool.health_counts().await, (2, 2));

        pool.get("a")
            .await
            .unwrap()
            .write()
            .await
            .mark_status(AccountStatus::Blocked, "Blocked");
        assert_eq!(pool.health_counts().await, (1, 2));
    }

    #[tokio::test]
    async fn stats_aggregate_counters() {
        let pool = test_pool(&["a", "b"], Strategy::RoundRobin);
        {
            let slot = pool.get("a").await.unwrap();
            let mut account = slot.write().await;
            account.mark_used();
            account.mark_used();
            account.mark_error("boom");
        }

        let stats = pool.stats().await;
        assert_eq!(stats["total_accounts"], 2);
        assert_eq!(stats["total_requests"], 2);
        assert_eq!(stats["total_errors"], 1);
        assert_eq!(stats["strategy"], "round-robin");
        assert_eq!(stats["accounts"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn reload_replaces_accounts_and_policy() {
        let pool = test_pool(&["a"], Strategy::RoundRobin);
        let fresh = vec![Account::new("x".into(), Some("rt_x".into()), 5)];
        pool.reload(
            fresh,
            PoolPolicy {
                strategy: Strategy::LeastUsed,
                retry_429_interval: 5,
                auto_save: false,
            },
        )
        .await;

        assert!(pool.get("a").await.is_none());
        assert!(pool.get("x").await.is_some());
        let stats = pool.stats().await;
        assert_eq!(stats["strategy"], "least-used");
    }

    #[test]
    fn strategy_serde_round_trip() {
        for (strategy, tag) in [
            (Strategy::RoundRobin, "\"round-robin\""),
            (Strategy::Random, "\"random\""),
            (Strategy::LeastUsed, "\"least-used\""),
            (Strategy::QuotaAware, "\"quota-aware\""),
        ] {
            assert_eq!(serde_json::to_string(&strategy).unwrap(), tag);
            let parsed: Strategy = serde_json::from_str(tag).unwrap();
            assert_eq!(parsed, strategy);
        }
    }
}
