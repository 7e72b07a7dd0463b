// Fire-and-forget usage metrics

use once_cell::sync::Lazy;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TelemetrySettings;

/// One random identifier per process, shared by every metric it sends
static SESSION_ID: Lazy<Uuid> = Lazy::new(Uuid::new_v4);

pub fn session_id() -> Uuid {
    *SESSION_ID
}

#[derive(Debug, Clone, PartialEq)]
pub enum Metric {
    Use,
    UsbAttempt,
    FormatAttempt,
    UsbSuccess,
    FormatSuccess,
    SuccessDuration(f64),
    AttemptFailed(String),
}

impl Metric {
    pub fn name(&self) -> &'static str {
        match self {
            Metric::Use => "use",
            Metric::UsbAttempt => "usb-attempt",
            Metric::FormatAttempt => "format-attempt",
            Metric::UsbSuccess => "usb-success",
            Metric::FormatSuccess => "format-success",
            Metric::SuccessDuration(_) => "success-duration-seconds",
            Metric::AttemptFailed(_) => "attempt-failed",
        }
    }

    pub fn value(&self) -> Option<String> {
        match self {
            Metric::SuccessDuration(secs) => Some(format!("{:.1}", secs)),
            Metric::AttemptFailed(reason) => Some(reason.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value() {
            Some(value) => write!(f, "{}={}", self.name(), value),
            None => write!(f, "{}", self.name()),
        }
    }
}

/// Destination for metrics. `send` must return immediately and never fail.
pub trait TelemetrySink: Send + Sync {
    fn send(&self, metric: Metric);
}

/// Records metrics in the log only
#[derive(Debug, Default, Clone)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn send(&self, metric: Metric) {
        info!(session = %session_id(), "metric {}", metric);
    }
}

#[derive(Debug, Serialize)]
struct MetricPayload<'a> {
    identifier: String,
    metric: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    timestamp: chrono::DateTime<chrono::Utc>,
}

/// POSTs metrics as JSON from a detached task
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpSink {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }
}

impl TelemetrySink for HttpSink {
    fn send(&self, metric: Metric) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime, dropping metric {}", metric);
            return;
        };

        let payload = MetricPayload {
            identifier: session_id().to_string(),
            metric: metric.name(),
            value: metric.value(),
            timestamp: chrono::Utc::now(),
        };
        let request = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .json(&payload);

        runtime.spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("Sent metric {}", metric);
                }
                Ok(response) => warn!("Metric {} rejected, status: {}", metric, response.status()),
                Err(e) => warn!("Failed to send metric {}: {}", metric, e),
            }
        });
    }
}

/// Pick the sink for the configured telemetry settings
pub fn sink_from_settings(settings: Option<&TelemetrySettings>) -> Arc<dyn TelemetrySink> {
    match settings {
        Some(t) if !t.api_key.is_empty() && !t.endpoint.is_empty() => {
            Arc::new(HttpSink::new(t.endpoint.clone(), t.api_key.clone()))
        }
        Some(_) => {
            warn!("Telemetry endpoint or API key not set, not sending metrics");
            Arc::new(LogSink)
        }
        None => Arc::new(LogSink),
    }
}
