//! Health and metrics aggregation.
//!
//! A [`HealthProbe`] samples the system under migration. The
//! [`HealthAggregator`] calls it on an interval with a timeout, classifies
//! the outcomes with a [`HealthClassifier`], stores the metrics in a
//! [`MetricsStore`] and raises issues on threshold crossings. Health is
//! advisory unless the Execution is configured to treat `unhealthy` as fatal.

mod aggregator;
mod classifier;
mod probe;
mod store;

pub use aggregator::{HealthAggregator, HealthSignal};
pub use classifier::HealthClassifier;
pub use probe::CommandProbe;
pub use store::MetricsStore;

use anyhow::Result;
use async_trait::async_trait;

use crate::model::MetricsSample;

/// Source of health samples for one system under migration.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Take one sample. An error counts as one failed sample.
    async fn sample(&self) -> Result<MetricsSample>;
}
