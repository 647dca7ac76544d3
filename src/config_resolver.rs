//! Layered config resolution with a TTL cache (SPEC_FULL.md §4.6). Grounded
//! on the teacher's `config::remote` read-through cache: defaults compiled
//! in, overlaid by the latest `scope=GLOBAL` row, overlaid again by the
//! latest `scope=USER` row for the leader being processed.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::db::Store;
use crate::models::{CopySizingConfig, GuardrailConfig, ResolvedConfig, SmallTradeBufferingConfig};

const TTL: Duration = Duration::from_secs(300);

type CacheKey = Option<String>;

pub struct ConfigResolver {
    store: Store,
    cache: RwLock<HashMap<CacheKey, (ResolvedConfig, Instant)>>,
}

impl ConfigResolver {
    pub fn new(store: Store) -> Self {
        ConfigResolver { store, cache: RwLock::new(HashMap::new()) }
    }

    /// Effective config for `followed_user_id`, or the global config when
    /// `None`. Read-through with a 5-minute TTL; an expired entry is simply
    /// recomputed on the next call (lazy expiry, no background sweep).
    pub async fn resolve(&self, followed_user_id: Option<&str>) -> anyhow::Result<ResolvedConfig> {
        let key = followed_user_id.map(str::to_string);

        if let Some((cfg, fetched_at)) = self.cache.read().get(&key) {
            if fetched_at.elapsed() < TTL {
                return Ok(cfg.clone());
            }
        }

        let resolved = self.load(followed_user_id).await?;
        self.cache.write().insert(key, (resolved.clone(), Instant::now()));
        Ok(resolved)
    }

    pub fn invalidate(&self, followed_user_id: Option<&str>) {
        self.cache.write().remove(&followed_user_id.map(str::to_string));
    }

    async fn load(&self, followed_user_id: Option<&str>) -> anyhow::Result<ResolvedConfig> {
        let guardrails = self.layered_guardrails(followed_user_id).await?;
        let sizing = self.layered_sizing(followed_user_id).await?;
        let buffering = self.layered_buffering().await?;
        Ok(ResolvedConfig { guardrails, sizing, buffering })
    }

    async fn layered_guardrails(&self, followed_user_id: Option<&str>) -> anyhow::Result<GuardrailConfig> {
        let mut cfg = match self.store.get_guardrail_config("GLOBAL", None).await? {
            Some(json) => serde_json::from_str(&json).unwrap_or_default(),
            None => GuardrailConfig::default(),
        };
        if let Some(user) = followed_user_id {
            if let Some(json) = self.store.get_guardrail_config("USER", Some(user)).await? {
                cfg = serde_json::from_str(&json).unwrap_or(cfg);
            }
        }
        Ok(cfg)
    }

    async fn layered_sizing(&self, followed_user_id: Option<&str>) -> anyhow::Result<CopySizingConfig> {
        let mut cfg = match self.store.get_copy_sizing_config("GLOBAL", None).await? {
            Some(json) => serde_json::from_str(&json).unwrap_or_default(),
            None => CopySizingConfig::default(),
        };
        if let Some(user) = followed_user_id {
            if let Some(json) = self.store.get_copy_sizing_config("USER", Some(user)).await? {
                cfg = serde_json::from_str(&json).unwrap_or(cfg);
            }
        }
        Ok(cfg)
    }

    /// Global only — no per-leader override exists for buffering (SPEC_FULL
    /// §3.1's `config:smallTradeBuffering` checkpoint key is process-wide).
    async fn layered_buffering(&self) -> anyhow::Result<SmallTradeBufferingConfig> {
        match self.store.get_checkpoint("config:smallTradeBuffering").await? {
            Some(json) => Ok(serde_json::from_str(&json).unwrap_or_default()),
            None => Ok(SmallTradeBufferingConfig::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    async fn fresh_store() -> Store {
        let file = NamedTempFile::new().unwrap();
        let store = Store::open(file.path().to_str().unwrap()).unwrap();
        store.migrate().await.unwrap();
        std::mem::forget(file);
        store
    }

    #[tokio::test]
    async fn falls_back_to_compiled_defaults_when_no_rows_exist() {
        let store = fresh_store().await;
        let resolver = ConfigResolver::new(store);
        let resolved = resolver.resolve(None).await.unwrap();
        assert_eq!(resolved.sizing.copy_pct_notional_bps, 100);
        assert_eq!(resolved.guardrails.max_total_exposure_bps, 7_000);
    }

    #[tokio::test]
    async fn caches_until_ttl_elapses() {
        let store = fresh_store().await;
        let resolver = ConfigResolver::new(store);
        let first = resolver.resolve(Some("leader1")).await.unwrap();
        let second = resolver.resolve(Some("leader1")).await.unwrap();
        assert_eq!(first.sizing.copy_pct_notional_bps, second.sizing.copy_pct_notional_bps);
    }
}
