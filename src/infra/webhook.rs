//! Best-effort webhook notifications
//!
//! `notify` only enqueues. A background worker drains the bounded queue and
//! POSTs each notification to every configured endpoint with retry and a
//! per-endpoint circuit breaker. Nothing here can fail a transition.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::metrics::{metric_names, MetricsRegistry};

use super::{
    CircuitBreakerConfig, CircuitBreakerRegistry, LogisticsError, Notifier, Result, Retry,
    RetryConfig, StatusNotification,
};

/// Webhook delivery settings
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub urls: Vec<String>,
    pub timeout: Duration,
    pub queue_capacity: usize,
    pub retry: RetryConfig,
    pub breaker: CircuitBreakerConfig,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            timeout: Duration::from_millis(5000),
            queue_capacity: 1024,
            retry: RetryConfig::webhook(),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Producer side of the outbound queue
pub struct WebhookDispatcher {
    tx: mpsc::Sender<StatusNotification>,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Arc<MetricsRegistry>,
}

impl WebhookDispatcher {
    /// Create the queue without a worker; the caller owns the receiver
    pub fn with_queue(
        capacity: usize,
        metrics: Arc<MetricsRegistry>,
    ) -> (Self, mpsc::Receiver<StatusNotification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
        (
            Self {
                tx,
                breakers,
                metrics,
            },
            rx,
        )
    }

    /// Per-endpoint breakers, for health reporting
    pub fn breakers(&self) -> Arc<CircuitBreakerRegistry> {
        self.breakers.clone()
    }

    /// Create the queue and spawn its delivery worker
    pub fn spawn(
        config: WebhookConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<(Self, JoinHandle<()>)> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LogisticsError::Configuration(format!("webhook client: {e}")))?;

        let (mut dispatcher, rx) = Self::with_queue(config.queue_capacity, metrics.clone());
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.clone()));
        dispatcher.breakers = breakers.clone();
        let worker = WebhookWorker {
            client,
            breakers,
            config,
            metrics,
        };
        let handle = tokio::spawn(worker.run(rx));
        Ok((dispatcher, handle))
    }
}

#[async_trait]
impl Notifier for WebhookDispatcher {
    async fn notify(&self, notification: StatusNotification) {
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(n)) => {
                warn!(subject = %n.subject, status = %n.status, "Webhook queue full, dropping notification");
                self.metrics.inc_counter(metric_names::WEBHOOKS_DROPPED).await;
            }
            Err(TrySendError::Closed(n)) => {
                warn!(subject = %n.subject, status = %n.status, "Webhook worker stopped, dropping notification");
                self.metrics.inc_counter(metric_names::WEBHOOKS_DROPPED).await;
            }
        }
    }
}

struct WebhookWorker {
    client: reqwest::Client,
    config: WebhookConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Arc<MetricsRegistry>,
}

impl WebhookWorker {
    async fn run(self, mut rx: mpsc::Receiver<StatusNotification>) {
        while let Some(notification) = rx.recv().await {
            for url in &self.config.urls {
                self.deliver(url, &notification).await;
            }
        }
        debug!("Webhook queue closed, worker exiting");
    }

    async fn deliver(&self, url: &str, notification: &StatusNotification) {
        let breaker = self.breakers.get_or_create(url).await;
        if !breaker.is_allowed().await {
            debug!(url, subject = %notification.subject, "Webhook endpoint circuit open, skipping");
            self.metrics.inc_counter(metric_names::WEBHOOKS_FAILED).await;
            return;
        }

        let outcome = Retry::new(self.config.retry.clone())
            .run("webhook", || {
                let client = &self.client;
                async move {
                    client
                        .post(url)
                        .json(notification)
                        .send()
                        .await?
                        .error_for_status()
                        .map(|_| ())
                }
            })
            .await;

        match outcome.into_result() {
            Ok(()) => {
                breaker.record_success().await;
                self.metrics.inc_counter(metric_names::WEBHOOKS_SENT).await;
            }
            Err(e) => {
                breaker.record_failure().await;
                self.metrics.inc_counter(metric_names::WEBHOOKS_FAILED).await;
                warn!(url, subject = %notification.subject, error = %e, "Webhook delivery failed");
            }
        }
    }
}
