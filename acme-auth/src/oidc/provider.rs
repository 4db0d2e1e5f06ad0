//! Lazily discovered, memoized OIDC client

use super::client::{ClientFactory, OidcClient};
use super::error::OidcError;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Hands out one shared [`OidcClient`], created on first use.
///
/// Concurrent callers during the first creation wait for the same attempt,
/// so discovery runs once. A failed attempt is not cached; the next caller
/// tries again.
pub struct OidcClientProvider {
    factory: Arc<dyn ClientFactory>,
    client: OnceCell<Arc<dyn OidcClient>>,
}

impl std::fmt::Debug for OidcClientProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcClientProvider")
            .field("initialized", &self.client.initialized())
            .finish_non_exhaustive()
    }
}

impl OidcClientProvider {
    /// Create a provider that builds its client with `factory`.
    #[must_use]
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            factory,
            client: OnceCell::new(),
        }
    }

    /// The shared client, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns the factory's error when creation fails.
    pub async fn get_client(&self) -> Result<Arc<dyn OidcClient>, OidcError> {
        let client = self
            .client
            .get_or_try_init(|| async {
                tracing::debug!("Creating OIDC client");
                self.factory.create().await
            })
            .await?;
        Ok(Arc::clone(client))
    }

    /// Drop the memoized client so the next call creates a new one.
    pub fn reset(&mut self) {
        self.client.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oidc::client::{CodeExchange, TokenSet};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use url::Url;

    struct StaticClient {
        authorization_endpoint: Url,
    }

    #[async_trait]
    impl OidcClient for StaticClient {
        fn authorization_endpoint(&self) -> &Url {
            &self.authorization_endpoint
        }

        fn end_session_endpoint(&self) -> Option<&Url> {
            None
        }

        async fn exchange_code(&self, _exchange: CodeExchange) -> Result<TokenSet, OidcError> {
            Err(OidcError::Exchange("not supported".to_string()))
        }
    }

    /// Factory that counts calls and fails the first `failures` of them.
    struct CountingFactory {
        calls: AtomicUsize,
        failures: usize,
    }

    impl CountingFactory {
        fn new(failures: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures,
            }
        }
    }

    #[async_trait]
    impl ClientFactory for CountingFactory {
        async fn create(&self) -> Result<Arc<dyn OidcClient>, OidcError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if call < self.failures {
                return Err(OidcError::Discovery {
                    issuer: "https://id.example.com".to_string(),
                    message: "unreachable".to_string(),
                });
            }
            Ok(Arc::new(StaticClient {
                authorization_endpoint: Url::parse("https://id.example.com/authorize").unwrap(),
            }))
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_callers_share_one_discovery() {
        let factory = Arc::new(CountingFactory::new(0));
        let provider = Arc::new(OidcClientProvider::new(factory.clone()));

        let tasks = (0..10).map(|_| {
            let provider = Arc::clone(&provider);
            tokio::spawn(async move { provider.get_client().await })
        });
        let clients: Vec<_> = futures_util::future::join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.expect("Should join").expect("Should create client"))
            .collect();

        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
        for client in &clients[1..] {
            assert!(Arc::ptr_eq(&clients[0], client));
        }
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let factory = Arc::new(CountingFactory::new(1));
        let provider = OidcClientProvider::new(factory.clone());

        assert!(matches!(
            provider.get_client().await,
            Err(OidcError::Discovery { .. })
        ));
        assert!(provider.get_client().await.is_ok());
        assert!(provider.get_client().await.is_ok());
        assert_eq!(factory.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reset_forces_new_client() {
        let factory = Arc::new(CountingFactory::new(0));
        let mut provider = OidcClientProvider::new(factory.clone());

        let first = provider.get_client().await.unwrap();
        provider.reset();
        let second = provider.get_client().await.unwrap();

        assert_eq!(factory.calls.load(Ordering::SeqCst), 2);
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
