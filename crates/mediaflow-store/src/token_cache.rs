//! OAuth token caching for Google API calls.
//!
//! Provides a thread-safe, async-aware token cache with:
//! - Refresh margin to avoid token expiry during requests
//! - Single-flight refresh so concurrent callers do not stampede the provider
//! - Fallback to the existing token while it is still usable
//!
//! The cache is scope-agnostic; Firestore and Pub/Sub callers each build one
//! with the scopes they need.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use gcp_auth::TokenProvider;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

/// Refresh tokens this long before they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// TTL assumed when the provider reports no usable expiry.
const TOKEN_DEFAULT_TTL: Duration = Duration::from_secs(50 * 60);

/// OAuth scope for Firestore access through the Datastore API.
pub const FIRESTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_valid(&self) -> bool {
        Instant::now() + TOKEN_REFRESH_MARGIN < self.expires_at
    }

    fn is_usable(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Thread-safe token cache with single-flight refresh.
pub struct TokenCache {
    auth: Arc<dyn TokenProvider>,
    scopes: Vec<&'static str>,
    cache: RwLock<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new(auth: Arc<dyn TokenProvider>, scopes: &[&'static str]) -> Self {
        Self {
            auth,
            scopes: scopes.to_vec(),
            cache: RwLock::new(None),
        }
    }

    /// Load service account credentials from `GOOGLE_APPLICATION_CREDENTIALS`.
    pub fn from_service_account_env(scopes: &[&'static str]) -> StoreResult<Self> {
        let service_account = gcp_auth::CustomServiceAccount::from_env()
            .map_err(|e| StoreError::auth_error(format!("Failed to load service account: {}", e)))?
            .ok_or_else(|| {
                StoreError::auth_error(
                    "GOOGLE_APPLICATION_CREDENTIALS not set. \
                     Set it to the path of your service account JSON file.",
                )
            })?;

        Ok(Self::new(Arc::new(service_account), scopes))
    }

    /// Drop the cached token so the next call refreshes.
    pub async fn invalidate(&self) {
        let mut cache = self.cache.write().await;
        *cache = None;
    }

    /// Get a valid access token, refreshing if necessary.
    pub async fn get_token(&self) -> StoreResult<String> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref().filter(|c| c.is_valid()) {
                return Ok(cached.access_token.clone());
            }
        }

        let mut cache = self.cache.write().await;

        // Another task may have refreshed while we waited for the write lock
        if let Some(cached) = cache.as_ref().filter(|c| c.is_valid()) {
            return Ok(cached.access_token.clone());
        }

        self.refresh_token(&mut cache).await
    }

    async fn refresh_token(&self, cache: &mut Option<CachedToken>) -> StoreResult<String> {
        match self.auth.token(&self.scopes).await {
            Ok(token) => {
                let access_token = token.as_str().to_string();
                let now = Utc::now();
                let exp = token.expires_at();

                let expires_at = if exp > now {
                    Instant::now() + (exp - now).to_std().unwrap_or(TOKEN_DEFAULT_TTL)
                } else {
                    Instant::now()
                };

                *cache = Some(CachedToken {
                    access_token: access_token.clone(),
                    expires_at,
                });

                debug!(scopes = ?self.scopes, "Refreshed OAuth token");
                Ok(access_token)
            }
            Err(e) => {
                if let Some(cached) = cache.as_ref().filter(|c| c.is_usable()) {
                    warn!("Token refresh failed, using existing token: {}", e);
                    return Ok(cached.access_token.clone());
                }

                Err(StoreError::auth_error(format!(
                    "Failed to obtain auth token: {}",
                    e
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_margin_is_below_default_ttl() {
        assert!(TOKEN_REFRESH_MARGIN < TOKEN_DEFAULT_TTL);
    }

    #[test]
    fn test_cached_token_validity() {
        let fresh = CachedToken {
            access_token: "a".to_string(),
            expires_at: Instant::now() + Duration::from_secs(600),
        };
        assert!(fresh.is_valid());

        let expiring = CachedToken {
            access_token: "b".to_string(),
            expires_at: Instant::now() + Duration::from_secs(30),
        };
        assert!(!expiring.is_valid());
        assert!(expiring.is_usable());
    }

    #[test]
    fn test_firestore_scope() {
        assert!(FIRESTORE_SCOPE.contains("datastore"));
    }
}
