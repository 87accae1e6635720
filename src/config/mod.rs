// # Configuration
//
// Every tunable of the data path in one record, with human-readable size
// parsing and a validation pass that reports every violated invariant at
// once rather than the first one found.

use crate::backend::RetryPolicy;
use crate::buffer::WriteBufferConfig;
use crate::cache::CacheConfig;
use crate::error::{FsError, Result};
use crate::prefetch::PrefetchConfig;
use serde::{Deserialize, Serialize};

/// Documented fallback for unparseable size strings (1 GiB).
pub const DEFAULT_SIZE_BYTES: u64 = 1024 * 1024 * 1024;

/// Parses a human-readable size: `B`, `KB`, `MB`, `GB` suffixes
/// (case-insensitive, 1024-based), bare numbers are bytes, surrounding
/// whitespace is trimmed. Unparseable input falls back to 1 GiB.
pub fn parse_size(s: &str) -> u64 {
    let s = s.trim();
    if s.is_empty() {
        return DEFAULT_SIZE_BYTES;
    }

    let upper = s.to_uppercase();
    let (number, multiplier): (&str, u64) = if let Some(n) = upper.strip_suffix("GB") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("KB") {
        (n, 1024)
    } else if let Some(n) = upper.strip_suffix('B') {
        (n, 1)
    } else {
        (upper.as_str(), 1)
    };

    match number.trim().parse::<u64>() {
        Ok(n) => n.saturating_mul(multiplier),
        Err(_) => DEFAULT_SIZE_BYTES,
    }
}

/// Parsed `s3://bucket[/prefix]` storage location.
///
/// Only the `s3` scheme is accepted and the bucket must be non-empty.
/// The prefix is informational to the data path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUri {
    pub bucket: String,
    pub prefix: String,
}

impl StorageUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri.strip_prefix("s3://").ok_or_else(|| {
            FsError::Configuration(format!("unsupported storage URI scheme: {}", uri))
        })?;
        let (bucket, prefix) = match rest.split_once('/') {
            Some((b, p)) => (b, p),
            None => (rest, ""),
        };
        if bucket.is_empty() {
            return Err(FsError::Configuration(format!(
                "storage URI has empty bucket: {}",
                uri
            )));
        }
        Ok(Self {
            bucket: bucket.to_string(),
            prefix: prefix.trim_end_matches('/').to_string(),
        })
    }
}

/// Top-level configuration for the data path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FsConfig {
    /// Remote store location; `None` for embedders wiring their own backend.
    pub storage_uri: Option<StorageUri>,
    pub cache: CacheConfig,
    pub prefetch: PrefetchConfig,
    pub write_buffer: WriteBufferConfig,
    pub retry: RetryPolicy,
}

impl FsConfig {
    /// Validates the whole record, returning one `Configuration` error
    /// that lists every violated invariant.
    pub fn validate(&self) -> Result<()> {
        let mut violations = Vec::new();
        violations.extend(self.cache.violations());
        violations.extend(self.prefetch.violations());
        violations.extend(self.write_buffer.violations());
        if self.retry.max_attempts == 0 {
            violations.push("retry.max_attempts must be at least 1".to_string());
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(FsError::Configuration(violations.join("; ")))
        }
    }
}
