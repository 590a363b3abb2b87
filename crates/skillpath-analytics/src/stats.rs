//! Pure statistics over trace measurements (durations, token counts, costs).

use serde::{Deserialize, Serialize};

use crate::error::AnalyticsError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BasicStats {
    pub count: usize,
    pub sum: f64,
    pub average: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DistributionStats {
    pub count: usize,
    pub sum: f64,
    pub average: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistogramBucket {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
    pub percentage: f64,
}

/// Basic statistics over a series. Empty input is an error: a caller asking
/// for the average of nothing has a bug upstream.
pub fn compute_statistics(values: &[f64]) -> Result<BasicStats, AnalyticsError> {
    if values.is_empty() {
        return Err(AnalyticsError::EmptyInput(
            "cannot compute statistics over an empty series".into(),
        ));
    }
    let sum: f64 = values.iter().sum();
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    Ok(BasicStats {
        count: values.len(),
        sum,
        average: sum / values.len() as f64,
        min,
        max,
    })
}

/// [`compute_statistics`] over sparse data: `None` entries are filtered out
/// first, and a series with nothing left yields `None` rather than an error.
pub fn compute_statistics_safe(values: &[Option<f64>]) -> Option<BasicStats> {
    let present: Vec<f64> = values.iter().filter_map(|v| *v).collect();
    compute_statistics(&present).ok()
}

/// Distribution statistics with population standard deviation. Empty input
/// yields all zeros.
pub fn compute_distribution_stats(values: &[f64]) -> DistributionStats {
    let Ok(basic) = compute_statistics(values) else {
        return DistributionStats::default();
    };
    let variance = values
        .iter()
        .map(|v| (v - basic.average).powi(2))
        .sum::<f64>()
        / values.len() as f64;
    DistributionStats {
        count: basic.count,
        sum: basic.sum,
        average: basic.average,
        min: basic.min,
        max: basic.max,
        std_dev: variance.sqrt(),
    }
}

/// Pearson correlation coefficient. Returns 0 for empty series, mismatched
/// lengths, single points, or zero variance in either series.
pub fn pearson_correlation(xs: &[f64], ys: &[f64]) -> f64 {
    if xs.len() != ys.len() || xs.len() < 2 {
        return 0.0;
    }
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;

    let mut covariance = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        covariance += (x - mean_x) * (y - mean_y);
        var_x += (x - mean_x).powi(2);
        var_y += (y - mean_y).powi(2);
    }
    if var_x == 0.0 || var_y == 0.0 {
        return 0.0;
    }
    covariance / (var_x.sqrt() * var_y.sqrt())
}

/// Buckets never exceed this, whatever width the caller asks for; the width
/// is stretched to cover the range instead.
const MAX_HISTOGRAM_BUCKETS: usize = 100;

/// Fixed-width histogram, buckets ascending by lower bound, percentages
/// summing to 100. Identical values (or a non-positive width) collapse to a
/// single bucket; a width tiny relative to the range is widened so the bucket
/// count stays bounded.
pub fn histogram(values: &[f64], width: f64) -> Vec<HistogramBucket> {
    if values.is_empty() {
        return Vec::new();
    }
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let total = values.len() as f64;

    if width <= 0.0 || min == max {
        return vec![HistogramBucket {
            lower: min,
            upper: max,
            count: values.len(),
            percentage: 100.0,
        }];
    }

    let mut bucket_count = ((max - min) / width).floor() as usize + 1;
    let width = if bucket_count > MAX_HISTOGRAM_BUCKETS {
        bucket_count = MAX_HISTOGRAM_BUCKETS;
        (max - min) / MAX_HISTOGRAM_BUCKETS as f64
    } else {
        width
    };
    let mut counts = vec![0usize; bucket_count];
    for v in values {
        let index = (((v - min) / width).floor() as usize).min(bucket_count - 1);
        counts[index] += 1;
    }

    counts
        .into_iter()
        .enumerate()
        .map(|(i, count)| HistogramBucket {
            lower: min + i as f64 * width,
            upper: min + (i + 1) as f64 * width,
            count,
            percentage: count as f64 / total * 100.0,
        })
        .collect()
}

/// Percentile by linear interpolation between bracketing order statistics.
/// Input must already be sorted ascending; p=0 is the min, p=100 the max.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p.clamp(0.0, 100.0) / 100.0 * (sorted.len() - 1) as f64;
    let low = rank.floor() as usize;
    let high = rank.ceil() as usize;
    if low == high {
        return sorted[low];
    }
    let fraction = rank - low as f64;
    sorted[low] + (sorted[high] - sorted[low]) * fraction
}
