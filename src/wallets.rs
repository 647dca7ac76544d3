//! Tracked-wallet set: single-writer (refresh task), multi-reader (decode
//! path). A refresh publishes a whole new immutable snapshot rather than
//! mutating shared state in place, so readers never take a lock.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::db::Store;
use crate::models::FollowedUser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalletEntry {
    pub is_proxy: bool,
}

#[derive(Debug, Default)]
pub struct WalletSnapshot {
    /// lower-cased wallet -> (followed_user_id, entry info)
    by_wallet: HashMap<String, (String, WalletEntry)>,
}

impl WalletSnapshot {
    pub fn build(users: &[FollowedUser], proxies: &[(String, String)]) -> Self {
        let mut by_wallet = HashMap::new();
        for u in users.iter().filter(|u| u.enabled) {
            by_wallet.insert(
                u.profile_wallet.to_lowercase(),
                (u.id.clone(), WalletEntry { is_proxy: false }),
            );
        }
        for (wallet, followed_user_id) in proxies {
            by_wallet
                .entry(wallet.to_lowercase())
                .or_insert((followed_user_id.clone(), WalletEntry { is_proxy: true }));
        }
        WalletSnapshot { by_wallet }
    }

    pub fn lookup(&self, wallet: &str) -> Option<(&str, WalletEntry)> {
        self.by_wallet
            .get(&wallet.to_lowercase())
            .map(|(id, entry)| (id.as_str(), *entry))
    }

    /// An order-independent fingerprint of the tracked set, used to decide
    /// whether WS subscriptions need to be torn down and re-established.
    pub fn fingerprint(&self) -> u64 {
        use std::collections::BTreeSet;
        use std::hash::{Hash, Hasher};
        let sorted: BTreeSet<&String> = self.by_wallet.keys().collect();
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        for wallet in sorted {
            wallet.hash(&mut hasher);
        }
        hasher.finish()
    }

    pub fn wallets(&self) -> impl Iterator<Item = &str> {
        self.by_wallet.keys().map(|w| w.as_str())
    }
}

pub struct WalletRegistry {
    snapshot: ArcSwap<WalletSnapshot>,
}

impl WalletRegistry {
    pub fn new() -> Self {
        WalletRegistry {
            snapshot: ArcSwap::from_pointee(WalletSnapshot::default()),
        }
    }

    pub fn current(&self) -> Arc<WalletSnapshot> {
        self.snapshot.load_full()
    }

    pub fn publish(&self, next: WalletSnapshot) {
        self.snapshot.store(Arc::new(next));
    }

    pub async fn refresh_from_store(&self, store: &Store) -> anyhow::Result<bool> {
        let users = store.list_followed_users().await?;
        let proxies = store.list_proxy_wallets().await?;
        let next = WalletSnapshot::build(&users, &proxies);
        let changed = next.fingerprint() != self.current().fingerprint();
        self.publish(next);
        Ok(changed)
    }
}

impl Default for WalletRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of matching a fill's maker/taker addresses against the tracked
/// wallet set.
pub struct Attribution {
    pub followed_user_id: String,
    /// Set when the attributed wallet is a proxy wallet rather than the
    /// leader's primary profile wallet.
    pub proxy_wallet: Option<String>,
    /// Whether the attributed wallet sat on the maker side of the fill.
    pub from_maker: bool,
}

/// Attribute a fill to a tracked wallet given the on-chain maker/taker
/// addresses. Prefers the non-proxy when both match distinct tracked
/// wallets (SPEC_FULL.md §3, FollowedUserProxyWallet invariant).
pub fn attribute(snapshot: &WalletSnapshot, maker: &str, taker: &str) -> Option<Attribution> {
    let maker_hit = snapshot.lookup(maker);
    let taker_hit = snapshot.lookup(taker);

    let pick = |wallet: &str, id: &str, entry: WalletEntry, from_maker: bool| Attribution {
        followed_user_id: id.to_string(),
        proxy_wallet: entry.is_proxy.then(|| wallet.to_lowercase()),
        from_maker,
    };

    match (maker_hit, taker_hit) {
        (Some((id, entry)), None) => Some(pick(maker, id, entry, true)),
        (None, Some((id, entry))) => Some(pick(taker, id, entry, false)),
        (Some((id_m, entry_m)), Some((id_t, entry_t))) => {
            if !entry_m.is_proxy {
                Some(pick(maker, id_m, entry_m, true))
            } else if !entry_t.is_proxy {
                Some(pick(taker, id_t, entry_t, false))
            } else {
                Some(pick(maker, id_m, entry_m, true))
            }
        }
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, wallet: &str) -> FollowedUser {
        FollowedUser {
            id: id.to_string(),
            profile_wallet: wallet.to_string(),
            label: id.to_string(),
            enabled: true,
        }
    }

    #[test]
    fn attributes_single_match() {
        let snap = WalletSnapshot::build(&[user("u1", "0xAAA")], &[]);
        let attr = attribute(&snap, "0xaaa", "0xbbb").unwrap();
        assert_eq!(attr.followed_user_id, "u1");
        assert!(attr.proxy_wallet.is_none());
    }

    #[test]
    fn prefers_non_proxy_when_both_match() {
        let snap = WalletSnapshot::build(
            &[user("u1", "0xAAA")],
            &[("0xBBB".to_string(), "u1".to_string())],
        );
        let attr = attribute(&snap, "0xaaa", "0xbbb").unwrap();
        assert_eq!(attr.followed_user_id, "u1");
        assert!(attr.proxy_wallet.is_none());
    }

    #[test]
    fn fingerprint_changes_with_membership() {
        let a = WalletSnapshot::build(&[user("u1", "0xAAA")], &[]);
        let b = WalletSnapshot::build(&[user("u1", "0xAAA"), user("u2", "0xCCC")], &[]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
