pub mod error;
pub mod stats;
pub mod usage;

pub use error::AnalyticsError;
pub use stats::{BasicStats, DistributionStats, HistogramBucket};
pub use usage::{CostBreakdown, RunUsageSummary, UsageAnalytics, UsageReport};
