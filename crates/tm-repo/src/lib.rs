//! Dataset repository: persisted entities, analytics, and the Postgres /
//! in-memory backends that implement [`DatasetRepository`].

pub mod allowlist;
pub mod memory;
pub mod postgres;
pub mod repository;
pub mod types;

pub use memory::InMemoryDatasetRepository;
pub use postgres::{PgConnectionFactory, PgDatasetRepository};
pub use repository::{DatasetRepository, RepoError, TelemetryBatch};
pub use types::{
    ConfusionMatrix, CountEntry, DatasetSummary, DimensionCardinality, ErrorDistributionEntry, EvaluationMetrics,
    Histogram, HistogramBucket, MetricStats, Page, RunListFilter, ScoreFilter, TimeBucketValue, TimeSeriesPoint,
    TopKResult,
};
