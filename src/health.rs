use std::fmt::{Display, Formatter};

use getset::Getters;
use jobqueue_events::QueueMetrics;
use serde::Serialize;

use crate::{
    driver::{JobCounts, QueueDriver},
    errors::Result,
};

/// Ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl Display for HealthStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        })
    }
}

/// Warning and critical levels of each checked value
#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    pub pending_warning: u64,
    pub pending_critical: u64,
    pub failed_warning: u64,
    pub failed_critical: u64,
    pub error_rate_warning: f64,
    pub error_rate_critical: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            pending_warning: 1000,
            pending_critical: 5000,
            failed_warning: 10,
            failed_critical: 100,
            error_rate_warning: 0.1,
            error_rate_critical: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Getters)]
#[getset(get = "pub")]
pub struct ComponentHealth {
    name: &'static str,
    status: HealthStatus,
    message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Getters)]
#[getset(get = "pub")]
pub struct HealthReport {
    /// Worst status among the components
    status: HealthStatus,
    counts: JobCounts,
    components: Vec<ComponentHealth>,
}

fn classify<T: PartialOrd>(value: T, warning: T, critical: T) -> HealthStatus {
    if value >= critical {
        HealthStatus::Unhealthy
    } else if value >= warning {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Classifies the backlog, the dead-letter store and, when metrics are collected,
/// the error rate of `driver`.
pub async fn check_health(
    driver: &dyn QueueDriver,
    thresholds: &HealthThresholds,
    metrics: Option<&QueueMetrics>,
) -> Result<HealthReport> {
    let counts = driver.counts().await?;
    let mut components = vec![
        ComponentHealth {
            name: "pending",
            status: classify(
                counts.waiting,
                thresholds.pending_warning,
                thresholds.pending_critical,
            ),
            message: format!("{} jobs waiting", counts.waiting),
        },
        ComponentHealth {
            name: "failed",
            status: classify(
                counts.failed,
                thresholds.failed_warning,
                thresholds.failed_critical,
            ),
            message: format!("{} jobs dead-lettered", counts.failed),
        },
    ];

    if let Some(metrics) = metrics {
        let rate = metrics.snapshot().error_rate();
        components.push(ComponentHealth {
            name: "error_rate",
            status: classify(
                rate,
                thresholds.error_rate_warning,
                thresholds.error_rate_critical,
            ),
            message: format!("{:.1}% of finished jobs failed", rate * 100.0),
        });
    }

    let status = components
        .iter()
        .map(|c| c.status)
        .max()
        .unwrap_or(HealthStatus::Healthy);

    Ok(HealthReport {
        status,
        counts,
        components,
    })
}
