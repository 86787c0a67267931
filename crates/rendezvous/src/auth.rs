//! Token verification for room joins.
//!
//! A join request carries an opaque bearer token. Verifiers decide whether it
//! identifies someone:
//! - [`StaticTokenVerifier`]: configured API keys
//! - [`UserInfoVerifier`]: asks an OIDC userinfo endpoint
//! - [`CachingVerifier`]: remembers successful answers of another verifier
//! - [`AnyVerifier`]: accepts what any of its verifiers accepts
//!
//! An unreachable identity provider is treated as an invalid token.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Token rejected")]
    Rejected,

    #[error("Identity provider unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid identity provider URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

pub type Result<T> = std::result::Result<T, AuthError>;

/// Who a token belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Identity {
    /// Stable subject identifier
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl Identity {
    pub fn new(sub: impl Into<String>) -> Self {
        Self {
            sub: sub.into(),
            email: None,
            name: None,
        }
    }

    /// Something readable for logs.
    pub fn display_name(&self) -> &str {
        self.email
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or(&self.sub)
    }
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity>;
}

#[async_trait]
impl<V: TokenVerifier + ?Sized> TokenVerifier for Arc<V> {
    async fn verify(&self, token: &str) -> Result<Identity> {
        (**self).verify(token).await
    }
}

/// Accepts a fixed set of keys.
pub struct StaticTokenVerifier {
    /// key -> name
    keys: HashMap<String, String>,
}

impl StaticTokenVerifier {
    pub fn new(keys: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity> {
        match self.keys.get(token) {
            Some(name) => {
                debug!("Token matched API key {}", name);
                Ok(Identity {
                    sub: format!("api-key:{name}"),
                    email: None,
                    name: Some(name.clone()),
                })
            }
            None => Err(AuthError::Rejected),
        }
    }
}

/// Verifies tokens with an OIDC userinfo endpoint.
pub struct UserInfoVerifier {
    client: reqwest::Client,
    url: url::Url,
}

impl UserInfoVerifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = url::Url::parse(url)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl TokenVerifier for UserInfoVerifier {
    async fn verify(&self, token: &str) -> Result<Identity> {
        let response = self
            .client
            .get(self.url.clone())
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            debug!("Userinfo endpoint answered {}", response.status());
            return Err(AuthError::Rejected);
        }

        response
            .json::<Identity>()
            .await
            .map_err(|e| AuthError::Unavailable(format!("malformed userinfo: {e}")))
    }
}

/// Remembers successful verifications for `ttl`. Failures are not cached,
/// and a zero `ttl` disables caching.
pub struct CachingVerifier<V> {
    inner: V,
    ttl: Duration,
    cache: Mutex<HashMap<String, (Identity, Instant)>>,
}

impl<V: TokenVerifier> CachingVerifier<V> {
    pub fn new(inner: V, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, token: &str) -> Option<Identity> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.retain(|_, (_, at)| at.elapsed() < self.ttl);
        cache.get(token).map(|(identity, _)| identity.clone())
    }
}

#[async_trait]
impl<V: TokenVerifier> TokenVerifier for CachingVerifier<V> {
    async fn verify(&self, token: &str) -> Result<Identity> {
        if self.ttl.is_zero() {
            return self.inner.verify(token).await;
        }
        if let Some(identity) = self.cached(token) {
            debug!("Token cache hit for {}", identity.display_name());
            return Ok(identity);
        }

        let identity = self.inner.verify(token).await?;
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(token.to_string(), (identity.clone(), Instant::now()));
        Ok(identity)
    }
}

/// Accepts a token if any verifier does, asking them in order.
pub struct AnyVerifier {
    verifiers: Vec<Arc<dyn TokenVerifier>>,
}

impl AnyVerifier {
    pub fn new(verifiers: Vec<Arc<dyn TokenVerifier>>) -> Self {
        Self { verifiers }
    }
}

#[async_trait]
impl TokenVerifier for AnyVerifier {
    async fn verify(&self, token: &str) -> Result<Identity> {
        let mut last = AuthError::Rejected;
        for verifier in &self.verifiers {
            match verifier.verify(token).await {
                Ok(identity) => return Ok(identity),
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls; accepts tokens starting with "good".
    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenVerifier for Counting {
        async fn verify(&self, token: &str) -> Result<Identity> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if token.starts_with("good") {
                Ok(Identity::new(token))
            } else {
                Err(AuthError::Rejected)
            }
        }
    }

    #[tokio::test]
    async fn test_static_keys() {
        let v = StaticTokenVerifier::new([("secret".to_string(), "ci".to_string())]);
        let identity = v.verify("secret").await.unwrap();
        assert_eq!(identity.name.as_deref(), Some("ci"));
        assert_eq!(identity.display_name(), "ci");
        assert!(matches!(v.verify("nope").await, Err(AuthError::Rejected)));
    }

    #[tokio::test]
    async fn test_cache_hits_skip_inner() {
        let inner = Arc::new(Counting::default());
        let v = CachingVerifier::new(Arc::clone(&inner), Duration::from_secs(60));
        v.verify("good-1").await.unwrap();
        v.verify("good-1").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_not_cached() {
        let inner = Arc::new(Counting::default());
        let v = CachingVerifier::new(Arc::clone(&inner), Duration::from_secs(60));
        assert!(v.verify("bad").await.is_err());
        assert!(v.verify("bad").await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_expires() {
        let inner = Arc::new(Counting::default());
        let v = CachingVerifier::new(Arc::clone(&inner), Duration::from_millis(20));
        v.verify("good").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        v.verify("good").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_ttl_disables_cache() {
        let inner = Arc::new(Counting::default());
        let v = CachingVerifier::new(Arc::clone(&inner), Duration::ZERO);
        v.verify("good").await.unwrap();
        v.verify("good").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_any_verifier_order() {
        let keys: Arc<dyn TokenVerifier> = Arc::new(StaticTokenVerifier::new([(
            "key".to_string(),
            "ci".to_string(),
        )]));
        let counting = Arc::new(Counting::default());
        let fallback: Arc<dyn TokenVerifier> = counting.clone();
        let v = AnyVerifier::new(vec![keys, fallback]);

        assert_eq!(v.verify("key").await.unwrap().name.as_deref(), Some("ci"));
        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);
        assert_eq!(v.verify("good-x").await.unwrap().sub, "good-x");
        assert!(v.verify("bad").await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_unavailable() {
        // Nothing listens on port 9 (discard) on loopback in test environments.
        let v = UserInfoVerifier::new("http://127.0.0.1:9/userinfo", Duration::from_secs(2)).unwrap();
        assert!(matches!(
            v.verify("token").await,
            Err(AuthError::Unavailable(_))
        ));
    }

    #[test]
    fn test_bad_url_rejected() {
        assert!(matches!(
            UserInfoVerifier::new("not a url", Duration::from_secs(1)),
            Err(AuthError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_identity_from_userinfo_json() {
        let identity: Identity = serde_json::from_str(
            r#"{"sub":"123","email":"a@example.com","name":"A","picture":"x"}"#,
        )
        .unwrap();
        assert_eq!(identity.display_name(), "a@example.com");
    }
}
