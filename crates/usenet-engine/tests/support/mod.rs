//! Shared in-process fake NNTP transport used by the integration tests.

use std::collections::HashMap;
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use usenet_engine::config::ProviderConfig;
use usenet_engine::error::TransportError;
use usenet_engine::transport::{ArticleBody, BoxedTransport, ConnectionState, NntpTransport, YencHeader};

/// Installs a `tracing-subscriber` fmt layer for the duration of the test
/// binary. The engine itself never installs a global subscriber; tests do,
/// same as the rest of the pack's test suites.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    });
}

#[derive(Clone)]
pub struct FakeArticle {
    pub header: YencHeader,
    pub bytes: Bytes,
}

#[derive(Default)]
pub struct FakeProviderScript {
    pub articles: HashMap<String, FakeArticle>,
    /// message-ids that should come back as `ArticleNotFound`.
    pub missing: Vec<String>,
    pub latency: Duration,
    pub connect_fails: bool,
}

/// A provider's full in-memory article set plus fault-injection knobs,
/// shared across every connection the pool opens for that provider.
pub struct FakeProvider {
    script: Mutex<FakeProviderScript>,
}

impl FakeProvider {
    pub fn new(script: FakeProviderScript) -> Arc<Self> {
        Arc::new(Self { script: Mutex::new(script) })
    }
}

pub struct FakeTransport {
    provider: Arc<FakeProvider>,
    state: ConnectionState,
}

impl FakeTransport {
    pub fn factory(provider: Arc<FakeProvider>) -> impl Fn(&ProviderConfig) -> BoxedTransport + Send + Sync + Clone + 'static {
        move |_config| {
            Box::new(FakeTransport {
                provider: Arc::clone(&provider),
                state: ConnectionState::Unconnected,
            })
        }
    }
}

#[async_trait]
impl NntpTransport for FakeTransport {
    async fn connect_and_auth(&mut self) -> Result<(), TransportError> {
        if self.provider.script.lock().connect_fails {
            return Err(TransportError::CouldNotConnect {
                host: "fake".to_owned(),
                port: 119,
                source: std::io::Error::other("injected connect failure"),
            });
        }
        self.state = ConnectionState::Idle;
        Ok(())
    }

    async fn stat(&mut self, message_id: &str) -> Result<bool, TransportError> {
        let (latency, exists) = {
            let script = self.provider.script.lock();
            (script.latency, script.articles.contains_key(message_id))
        };
        tokio::time::sleep(latency).await;
        Ok(exists)
    }

    async fn head(&mut self, message_id: &str) -> Result<YencHeader, TransportError> {
        let script = self.provider.script.lock();
        if script.missing.contains(&message_id.to_owned()) {
            return Err(TransportError::ArticleNotFound);
        }
        script
            .articles
            .get(message_id)
            .map(|article| article.header)
            .ok_or(TransportError::ArticleNotFound)
    }

    async fn body(&mut self, message_id: &str) -> Result<ArticleBody, TransportError> {
        let (latency, result) = {
            let script = self.provider.script.lock();
            let result = if script.missing.contains(&message_id.to_owned()) {
                Err(TransportError::ArticleNotFound)
            } else {
                script
                    .articles
                    .get(message_id)
                    .map(|article| ArticleBody {
                        header: article.header,
                        bytes: article.bytes.clone(),
                    })
                    .ok_or(TransportError::ArticleNotFound)
            };
            (script.latency, result)
        };
        tokio::time::sleep(latency).await;
        result
    }

    async fn date(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn group(&mut self, _name: &str) -> Result<(), TransportError> {
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn mark_dirty(&mut self) {
        self.state = ConnectionState::Dirty;
    }
}
