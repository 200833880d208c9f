//! Proxy assignment for newly created instances.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Proxy source is empty")]
    Exhausted,

    #[error("Proxy source failed: {0}")]
    Source(String),
}

/// Supplies the next proxy endpoint to bind to a new instance.
#[async_trait::async_trait]
pub trait ProxySource: Send + Sync {
    async fn next_proxy(&self) -> Result<String, ProxyError>;
}

/// Static round-robin over a fixed list of `host:port` entries.
#[derive(Debug)]
pub struct ProxyRotation {
    proxies: Vec<String>,
    cursor: AtomicUsize,
}

impl ProxyRotation {
    pub fn new(proxies: Vec<String>) -> Self {
        Self {
            proxies,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Parse a comma-separated list, skipping blank entries.
    pub fn from_list(list: &str) -> Self {
        Self::new(
            list.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}

#[async_trait::async_trait]
impl ProxySource for ProxyRotation {
    async fn next_proxy(&self) -> Result<String, ProxyError> {
        if self.proxies.is_empty() {
            return Err(ProxyError::Exhausted);
        }
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        Ok(self.proxies[n % self.proxies.len()].clone())
    }
}
