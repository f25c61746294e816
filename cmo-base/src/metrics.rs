use std::collections::HashMap;
use std::sync::Arc;

use eyre::Result;
use prometheus::{
    histogram_opts, labels, opts, register_histogram_vec_with_registry,
    register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry, Encoder,
    HistogramVec, IntCounterVec, IntGaugeVec, Registry,
};

/// Metrics namespace prefix.
const NAMESPACE: &str = "cmo";

/// Macro to prefix a string with the namespace.
macro_rules! namespaced {
    ($name:expr) => {
        format!("{}_{}", NAMESPACE, $name)
    };
}

/// Prometheus metrics shared across CMO agents.
#[derive(Debug)]
pub struct CoreMetrics {
    registry: Registry,
    agent_name: String,
    listen_port: u16,

    envelopes_published: IntCounterVec,
    envelopes_processed: IntCounterVec,
    dlq_rejections: IntCounterVec,
    decisions: IntCounterVec,
    qscore: HistogramVec,
    consumer_pending: IntGaugeVec,
    registry_agents: IntGaugeVec,
    task_durations: HistogramVec,
}

impl CoreMetrics {
    /// Track metrics for a particular agent name.
    pub fn new(for_agent: &str, listen_port: u16, registry: Registry) -> prometheus::Result<Self> {
        let const_labels: HashMap<String, String> = labels! {
            namespaced!("baselib_version") => env!("CARGO_PKG_VERSION").into(),
            "agent".into() => for_agent.into(),
        };
        let const_labels_ref = const_labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect::<HashMap<_, _>>();

        let envelopes_published = register_int_counter_vec_with_registry!(
            opts!(
                namespaced!("envelopes_published_count"),
                "Number of envelopes appended to the broker",
                const_labels_ref
            ),
            &["type", "topic"],
            registry
        )?;

        let envelopes_processed = register_int_counter_vec_with_registry!(
            opts!(
                namespaced!("envelopes_processed_count"),
                "Number of inbound envelopes by processing outcome",
                const_labels_ref
            ),
            &["type", "outcome"],
            registry
        )?;

        let dlq_rejections = register_int_counter_vec_with_registry!(
            opts!(
                namespaced!("dlq_rejections_count"),
                "Number of envelopes rejected to a dead-letter stream",
                const_labels_ref
            ),
            &["topic", "reason"],
            registry
        )?;

        let decisions = register_int_counter_vec_with_registry!(
            opts!(
                namespaced!("decisions_count"),
                "Number of grading decisions by outcome",
                const_labels_ref
            ),
            &["decision"],
            registry
        )?;

        let qscore = register_histogram_vec_with_registry!(
            histogram_opts!(
                namespaced!("qscore"),
                "Calibrated QScore of graded results",
                vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.75, 0.8, 0.9, 1.0]
            )
            .const_labels(const_labels.clone()),
            &["capability"],
            registry
        )?;

        let consumer_pending = register_int_gauge_vec_with_registry!(
            opts!(
                namespaced!("consumer_pending"),
                "Messages owned by a consumer awaiting ack",
                const_labels_ref
            ),
            &["topic"],
            registry
        )?;

        let registry_agents = register_int_gauge_vec_with_registry!(
            opts!(
                namespaced!("registry_agents"),
                "Registered agents by status",
                const_labels_ref
            ),
            &["status"],
            registry
        )?;

        let task_durations = register_histogram_vec_with_registry!(
            histogram_opts!(
                namespaced!("task_duration_seconds"),
                "Duration of inbound envelope handling",
                prometheus::DEFAULT_BUCKETS.to_vec()
            )
            .const_labels(const_labels.clone()),
            &["type"],
            registry
        )?;

        Ok(Self {
            registry,
            agent_name: for_agent.into(),
            listen_port,
            envelopes_published,
            envelopes_processed,
            dlq_rejections,
            decisions,
            qscore,
            consumer_pending,
            registry_agents,
            task_durations,
        })
    }

    /// Envelopes appended to the broker, labeled `[type, topic]`.
    pub fn envelopes_published(&self) -> IntCounterVec {
        self.envelopes_published.clone()
    }

    /// Inbound envelopes by outcome, labeled `[type, outcome]`. Outcomes:
    /// `handled`, `duplicate`, `rejected`, `failed`.
    pub fn envelopes_processed(&self) -> IntCounterVec {
        self.envelopes_processed.clone()
    }

    /// DLQ rejections, labeled `[topic, reason]`.
    pub fn dlq_rejections(&self) -> IntCounterVec {
        self.dlq_rejections.clone()
    }

    /// Grading decisions, labeled `[decision]`.
    pub fn decisions(&self) -> IntCounterVec {
        self.decisions.clone()
    }

    /// Calibrated QScore histogram, labeled `[capability]`.
    pub fn qscore(&self) -> HistogramVec {
        self.qscore.clone()
    }

    /// Owned-but-unacked deliveries, labeled `[topic]`.
    pub fn consumer_pending(&self) -> IntGaugeVec {
        self.consumer_pending.clone()
    }

    /// Registered agents by status, labeled `[status]`.
    pub fn registry_agents(&self) -> IntGaugeVec {
        self.registry_agents.clone()
    }

    /// Handling duration histogram, labeled `[type]`.
    pub fn task_durations(&self) -> HistogramVec {
        self.task_durations.clone()
    }

    /// The configured HTTP port for the metrics/health server.
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// The agent these metrics describe.
    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// The underlying registry, for adding agent-specific metrics.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Gather available metrics into an encoded (plaintext, OpenMetrics
    /// format) report.
    pub fn gather(&self) -> prometheus::Result<Vec<u8>> {
        let collected_metrics = self.registry.gather();
        let mut out_buf = Vec::with_capacity(1024 * 64);
        let encoder = prometheus::TextEncoder::new();
        encoder.encode(&collected_metrics, &mut out_buf)?;
        Ok(out_buf)
    }
}

/// Build the standard metrics object for an agent.
pub fn create_metrics(agent_name: &str, listen_port: u16) -> Result<Arc<CoreMetrics>> {
    Ok(Arc::new(CoreMetrics::new(
        agent_name,
        listen_port,
        Registry::new(),
    )?))
}
