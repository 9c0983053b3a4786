//! Outbound notification channels for significant clusters and store
//! corruption.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::NotifyConfig;
use crate::detect::{Cluster, IndexSnapshot, Severity};
use crate::patterns::Prediction;

const TOP_PREDICTIONS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub severity: Severity,
    pub title: String,
    pub body: String,
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the log only.
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, n: &Notification) -> Result<()> {
        match n.severity {
            Severity::Critical => error!(title = %n.title, "{}", n.body),
            Severity::Warning => warn!(title = %n.title, "{}", n.body),
            Severity::Info => info!(title = %n.title, "{}", n.body),
        }
        Ok(())
    }
}

/// POSTs each notification as JSON to a fixed URL.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    severity: Severity,
    title: &'a str,
    body: &'a str,
    timestamp: f64,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build webhook client")?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, n: &Notification) -> Result<()> {
        let payload = WebhookPayload {
            severity: n.severity,
            title: &n.title,
            body: &n.body,
            timestamp: crate::unix_now(),
        };
        self.client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("webhook request failed")?
            .error_for_status()
            .context("webhook rejected notification")?;
        Ok(())
    }
}

/// The configured channel: the webhook when a URL is set, the log otherwise.
pub fn from_config(config: &NotifyConfig) -> Result<Arc<dyn Notifier>> {
    match &config.webhook_url {
        Some(url) if !url.is_empty() => Ok(Arc::new(WebhookNotifier::new(
            url,
            Duration::from_secs(config.timeout_secs),
        )?)),
        _ => Ok(Arc::new(LogNotifier)),
    }
}

/// Send without blocking the caller; failures are logged.
pub fn dispatch(notifier: Arc<dyn Notifier>, notification: Notification) {
    tokio::spawn(async move {
        if let Err(e) = notifier.send(&notification).await {
            warn!(channel = notifier.name(), error = %e, "notification delivery failed");
        }
    });
}

pub fn cluster_message(cluster: &Cluster, index: Option<&IndexSnapshot>, predictions: &[Prediction]) -> Notification {
    let mut body = String::new();
    let _ = writeln!(body, "Level {} cluster", cluster.level);
    let _ = writeln!(body, "Sources: {}", cluster.source_names().join(", "));
    let _ = writeln!(
        body,
        "Anomalies: {} over {:.1}s",
        cluster.anomalies.len(),
        cluster.duration()
    );
    if let Some(snapshot) = index {
        let _ = writeln!(body, "Index: {:.1} ({})", snapshot.index, snapshot.status);
    }
    if predictions.is_empty() {
        let _ = writeln!(body, "No qualifying predictions");
    } else {
        let _ = writeln!(body, "Top predictions:");
        for p in predictions.iter().take(TOP_PREDICTIONS) {
            let _ = writeln!(
                body,
                "  {} {:.0}% in {:.1}-{:.1}h (n={})",
                p.event_type,
                p.probability * 100.0,
                p.min_time_h,
                p.max_time_h,
                p.sample_size
            );
        }
    }
    Notification {
        severity: Severity::for_level(cluster.level),
        title: format!("Level {} anomaly cluster", cluster.level),
        body,
    }
}

pub fn corruption_message(detail: &str) -> Notification {
    Notification {
        severity: Severity::Critical,
        title: "Durable store corrupted".into(),
        body: format!("Learned state can no longer be persisted: {detail}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{AnomalyEvent, IndexStatus};
    use crate::patterns::EventCategory;
    use crate::sensor::SourceKind;
    use axum::{routing::post, Json, Router};
    use std::collections::{BTreeMap, BTreeSet};
    use tokio::sync::mpsc;

    fn cluster(level: usize) -> Cluster {
        let sources = [SourceKind::Crypto, SourceKind::News, SourceKind::QuantumRng, SourceKind::System];
        let anomalies = sources[..level]
            .iter()
            .enumerate()
            .map(|(i, s)| AnomalyEvent {
                timestamp: 100.0 + i as f64,
                parameter: "value".into(),
                value: 9.0,
                mean: 0.0,
                std: 1.0,
                z_score: 9.0,
                source: *s,
            })
            .collect();
        Cluster {
            id: uuid::Uuid::new_v4(),
            anomalies,
            distinct_sources: sources[..level].iter().copied().collect::<BTreeSet<_>>(),
            level,
            start_time: 100.0,
            end_time: 100.0 + (level - 1) as f64,
            significant: level >= 3,
        }
    }

    #[test]
    fn test_cluster_message_contents() {
        let index = IndexSnapshot {
            timestamp: 110.0,
            index: 42.0,
            breakdown: BTreeMap::new(),
            baseline_ratio: 1.5,
            status: IndexStatus::Elevated,
        };
        let p = Prediction {
            condition: "L3_crypto_news_quantum_rng".into(),
            event_type: "solar_storm_moderate".into(),
            category: EventCategory::SpaceWeather,
            probability: 0.21,
            sample_size: 14,
            min_time_h: 3.0,
            max_time_h: 9.5,
            generated_at: 110.0,
            expires_at: 200.0,
            temporal: false,
            region: None,
        };
        let n = cluster_message(&cluster(3), Some(&index), &[p]);
        assert_eq!(n.severity, Severity::Warning);
        assert!(n.body.contains("Level 3 cluster"));
        assert!(n.body.contains("Anomalies: 3"));
        assert!(n.body.contains("Index: 42.0 (elevated)"));
        assert!(n.body.contains("solar_storm_moderate 21% in 3.0-9.5h (n=14)"));

        assert_eq!(cluster_message(&cluster(4), None, &[]).severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_webhook_posts_json() {
        let (tx, mut rx) = mpsc::channel::<serde_json::Value>(1);
        let app = Router::new().route(
            "/hook",
            post(move |Json(body): Json<serde_json::Value>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(body).await;
                    "ok"
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let notifier = WebhookNotifier::new(&format!("http://{addr}/hook"), Duration::from_secs(5)).unwrap();
        notifier.send(&corruption_message("disk image is malformed")).await.unwrap();

        let body = rx.recv().await.unwrap();
        assert_eq!(body["severity"], "Critical");
        assert_eq!(body["title"], "Durable store corrupted");
    }

    #[test]
    fn test_log_channel_without_url() {
        let notifier = from_config(&NotifyConfig::default()).unwrap();
        assert_eq!(notifier.name(), "log");
        tokio_test::block_on(notifier.send(&cluster_message(&cluster(2), None, &[]))).unwrap();
    }
}
