//! Paid-entitlement verification and caching.
//!
//! Verifies `EntitlementToken`s issued by the payment gateway and caches
//! successful verifications per user, so the free-tier check on capsule
//! creation does not need a fresh token on every request.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use keepsake_shared::entitlement::{check_entitlement_with_key, EntitlementToken};
use keepsake_shared::UserId;

#[derive(Debug, Clone)]
struct CachedEntitlement {
    valid_until: DateTime<Utc>,
}

impl CachedEntitlement {
    fn is_fresh(&self) -> bool {
        Utc::now() < self.valid_until
    }
}

/// Verifies and caches entitlement status per user.
#[derive(Clone)]
pub struct EntitlementVerifier {
    /// The payment gateway's Ed25519 public key.
    gateway_pubkey: [u8; 32],
    cache: Arc<RwLock<HashMap<UserId, CachedEntitlement>>>,
}

impl EntitlementVerifier {
    pub fn new(gateway_pubkey: [u8; 32]) -> Self {
        Self {
            gateway_pubkey,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Verify a token and remember the result until it expires.
    ///
    /// Only valid tokens are cached; a bad token never evicts a good entry.
    pub async fn verify(&self, token: &EntitlementToken) -> bool {
        let valid = check_entitlement_with_key(token, &self.gateway_pubkey);

        if valid {
            let mut cache = self.cache.write().await;
            let entry = cache
                .entry(token.user_id.clone())
                .or_insert(CachedEntitlement {
                    valid_until: token.valid_until,
                });
            if entry.valid_until < token.valid_until {
                entry.valid_until = token.valid_until;
            }
            info!(
                user = %token.user_id,
                until = %token.valid_until,
                "Entitlement verified"
            );
        } else {
            debug!(user = %token.user_id, "Entitlement verification failed");
        }

        valid
    }

    /// Whether the user currently holds a cached, unexpired entitlement.
    pub async fn is_entitled(&self, user: &UserId) -> bool {
        let cache = self.cache.read().await;
        cache.get(user).is_some_and(CachedEntitlement::is_fresh)
    }

    /// Grant an entitlement by hand (self-hosted admin action).
    ///
    /// Valid for 100 years, effectively permanent until revoked.
    pub async fn admin_grant(&self, user: &UserId) {
        let mut cache = self.cache.write().await;
        cache.insert(
            user.clone(),
            CachedEntitlement {
                valid_until: Utc::now() + Duration::days(36500),
            },
        );
    }

    pub async fn admin_revoke(&self, user: &UserId) -> bool {
        let mut cache = self.cache.write().await;
        cache.remove(user).is_some()
    }

    /// Evict expired entries from the cache.
    pub async fn purge_expired(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, entry| entry.is_fresh());
        let removed = before - cache.len();
        if removed > 0 {
            debug!(removed, "Purged expired entitlement cache entries");
        }
    }

    pub async fn cached_count(&self) -> usize {
        self.cache.read().await.len()
    }
}
