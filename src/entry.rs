//! Cache entries, invalidation messages and key encoding

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::CacheError;

/// Survival time meaning "never expires".
pub const NO_EXPIRY: i64 = -1;

/// Period used to compute the expiration of a [`NO_EXPIRY`] entry (99 years).
const NO_EXPIRY_PERIOD_MS: i64 = 1000 * 60 * 60 * 24 * 365 * 99;

/// Separator between category and key in the storage key.
const KEY_SEPARATOR: char = ':';

/// A cached value with its lifetime.
///
/// The expiration timestamp is fixed at construction and travels with the
/// entry through L2, so every process agrees on when it stops being valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// `None` marks a confirmed miss (negative cache entry)
    pub value: Option<serde_json::Value>,
    /// Requested TTL in milliseconds, or [`NO_EXPIRY`]
    pub survival_time: i64,
    /// Absolute expiration, milliseconds since the Unix epoch
    pub expiration_time: i64,
}

impl CacheEntry {
    /// Create an entry expiring `ttl_ms` from now, or never when `None`.
    pub fn new(value: Option<serde_json::Value>, ttl_ms: Option<u64>) -> Self {
        let survival_time = match ttl_ms {
            Some(ms) => i64::try_from(ms).unwrap_or(i64::MAX).min(NO_EXPIRY_PERIOD_MS),
            None => NO_EXPIRY,
        };
        let period = if survival_time < 0 {
            NO_EXPIRY_PERIOD_MS
        } else {
            survival_time
        };
        Self {
            value,
            survival_time,
            expiration_time: now_millis().saturating_add(period),
        }
    }

    /// A negative cache entry recording that the key does not exist.
    pub fn negative(ttl_ms: Option<u64>) -> Self {
        Self::new(None, ttl_ms)
    }

    pub fn is_negative(&self) -> bool {
        self.value.is_none()
    }

    pub fn is_valid(&self) -> bool {
        now_millis() < self.expiration_time
    }

    /// TTL to apply in the remote store, `None` for entries that never expire.
    pub fn remote_ttl_ms(&self) -> Option<u64> {
        u64::try_from(self.survival_time).ok()
    }
}

/// Notice that `(category, key)` changed. Carries no value: receivers re-read
/// the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    pub category: String,
    pub key: String,
}

impl InvalidationMessage {
    pub fn new(category: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            key: key.into(),
        }
    }

    pub fn full_key(&self) -> Result<String, CacheError> {
        full_key(&self.category, &self.key)
    }
}

/// Validate a category name.
pub fn validate_category(category: &str) -> Result<(), CacheError> {
    if category.trim().is_empty() {
        return Err(CacheError::config("category can not be empty"));
    }
    if category.contains(KEY_SEPARATOR) {
        return Err(CacheError::config(format!(
            "category '{category}' can not contain '{KEY_SEPARATOR}'"
        )));
    }
    Ok(())
}

/// Build the storage key shared by L1 and L2: `category:key`.
pub fn full_key(category: &str, key: &str) -> Result<String, CacheError> {
    validate_category(category)?;
    if key.trim().is_empty() {
        return Err(CacheError::config("cache key can not be blank"));
    }
    Ok(format!("{category}{KEY_SEPARATOR}{key}"))
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
