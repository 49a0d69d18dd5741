use std::fmt;

use crate::stacks::{ScalingPolicy, StackSourceSample};

const EMPTY: &[f32] = &[];

/// Characters used for growing bucket magnitudes in display strings.
const LEVELS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// A metric distribution over a fixed number of buckets.
///
/// Most nodes of a tree only ever see samples in one bucket, so a histogram starts out holding
/// at most one `(bucket, value)` pair and only allocates a full array the first time a second
/// bucket is written.
#[derive(Clone, Debug, PartialEq)]
pub struct Histogram {
    bucket_count: u32,
    storage: Storage,
}

#[derive(Clone, Debug, PartialEq)]
enum Storage {
    Empty,
    Single(u32, f32),
    Dense(Box<[f32]>),
}

impl Histogram {
    /// An empty histogram with `bucket_count` buckets.
    pub fn new(bucket_count: usize) -> Self {
        assert!(bucket_count > 0, "a histogram needs at least one bucket");
        Histogram {
            bucket_count: bucket_count as u32,
            storage: Storage::Empty,
        }
    }

    /// Number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.bucket_count as usize
    }

    /// Adds `metric` to `bucket`.
    ///
    /// # Panics
    ///
    /// Panics if `bucket` is not below [`Histogram::bucket_count`].
    pub fn add_metric(&mut self, metric: f32, bucket: usize) {
        assert!(
            bucket < self.bucket_count(),
            "bucket {} out of range for {} buckets",
            bucket,
            self.bucket_count
        );
        match self.storage {
            Storage::Empty => self.storage = Storage::Single(bucket as u32, metric),
            Storage::Single(b, ref mut value) if b as usize == bucket => *value += metric,
            Storage::Single(b, value) => {
                let mut dense = vec![0.0; self.bucket_count()].into_boxed_slice();
                dense[b as usize] = value;
                dense[bucket] += metric;
                self.storage = Storage::Dense(dense);
            }
            Storage::Dense(ref mut values) => values[bucket] += metric,
        }
    }

    /// Adds every bucket of `other`, multiplied by `weight`.
    pub fn add_scaled(&mut self, other: &Histogram, weight: f32) {
        debug_assert_eq!(self.bucket_count, other.bucket_count);
        for (bucket, value) in other.iter() {
            self.add_metric(value * weight, bucket);
        }
    }

    /// The value of one bucket.
    pub fn get(&self, bucket: usize) -> f32 {
        match self.storage {
            Storage::Empty => 0.0,
            Storage::Single(b, value) => {
                if b as usize == bucket {
                    value
                } else {
                    0.0
                }
            }
            Storage::Dense(ref values) => values[bucket],
        }
    }

    /// The non-zero buckets, in bucket order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, f32)> + '_ {
        let (single, dense) = match self.storage {
            Storage::Empty => (None, EMPTY),
            Storage::Single(b, value) => (Some((b as usize, value)), EMPTY),
            Storage::Dense(ref values) => (None, &values[..]),
        };
        single.into_iter().chain(
            dense
                .iter()
                .enumerate()
                .filter(|(_, value)| **value != 0.0)
                .map(|(bucket, value)| (bucket, *value)),
        )
    }

    /// Returns `true` if no bucket was ever written.
    pub fn is_empty(&self) -> bool {
        matches!(self.storage, Storage::Empty)
    }

    /// Sum over all buckets.
    pub fn total(&self) -> f32 {
        self.iter().map(|(_, value)| value).sum()
    }
}

/// Decides which buckets a sample lands in and how buckets are described.
pub trait HistogramController: Send + Sync + fmt::Debug {
    /// Number of buckets of every histogram this controller manages.
    fn bucket_count(&self) -> usize;

    /// Adds the metric of `sample` to `histogram`.
    fn add_sample(&self, histogram: &mut Histogram, sample: &StackSourceSample);

    /// The value displayed for `bucket`; by default the stored value.
    fn bucket_value(&self, histogram: &Histogram, bucket: usize) -> f32 {
        histogram.get(bucket)
    }

    /// A human readable description of what `bucket` covers.
    fn bucket_description(&self, bucket: usize) -> String;

    /// The value a bucket would hold if `total` were spread evenly; a sensible `scale` for
    /// [`HistogramController::display_string`].
    fn display_scale(&self, total: f32) -> f32 {
        total / self.bucket_count() as f32
    }

    /// A fresh histogram with this controller's bucket count.
    fn new_histogram(&self) -> Histogram {
        Histogram::new(self.bucket_count())
    }

    /// One character per bucket: `_` for nothing, then `0`-`9` and `A`-`Z` for values growing
    /// relative to `scale` (a value equal to `scale` shows as `A`). Negative values use lower
    /// case letters.
    fn display_string(&self, histogram: &Histogram, scale: f32) -> String {
        (0..self.bucket_count())
            .map(|bucket| level_char(self.bucket_value(histogram, bucket), scale))
            .collect()
    }
}

fn level_char(value: f32, scale: f32) -> char {
    if value == 0.0 {
        return '_';
    }
    let ratio = if scale > 0.0 {
        value.abs() / scale
    } else {
        1.0
    };
    let level = ((ratio * 10.0) as usize).min(LEVELS.len() - 1);
    let c = LEVELS[level] as char;
    if value < 0.0 {
        c.to_ascii_lowercase()
    } else {
        c
    }
}

/// Buckets samples by time between `start` and `end`.
#[derive(Clone, Debug)]
pub struct TimeHistogramController {
    start: f64,
    end: f64,
    bucket_count: usize,
    bucket_duration: f64,
    scaling_policy: ScalingPolicy,
}

impl TimeHistogramController {
    /// Splits `[start, end]` into `bucket_count` equal buckets.
    ///
    /// Under [`ScalingPolicy::TimeMetric`] a sample covers `[time, time + |metric|)` and its
    /// metric is spread over every bucket it overlaps, in proportion to the overlap.
    pub fn new(start: f64, end: f64, bucket_count: usize, scaling_policy: ScalingPolicy) -> Self {
        assert!(bucket_count > 0, "a histogram needs at least one bucket");
        let span = if end > start { end - start } else { 1.0 };
        TimeHistogramController {
            start,
            end: start + span,
            bucket_count,
            bucket_duration: span / bucket_count as f64,
            scaling_policy,
        }
    }

    /// Start of the covered range.
    pub fn start(&self) -> f64 {
        self.start
    }

    /// End of the covered range.
    pub fn end(&self) -> f64 {
        self.end
    }

    /// Width of one bucket in milliseconds.
    pub fn bucket_duration(&self) -> f64 {
        self.bucket_duration
    }

    /// The bucket containing `time`; the end of the range belongs to the last bucket.
    pub fn bucket_for_time(&self, time: f64) -> Option<usize> {
        if time < self.start || time > self.end {
            return None;
        }
        let bucket = ((time - self.start) / self.bucket_duration) as usize;
        Some(bucket.min(self.bucket_count - 1))
    }

    fn bucket_start(&self, bucket: usize) -> f64 {
        self.start + bucket as f64 * self.bucket_duration
    }
}

impl HistogramController for TimeHistogramController {
    fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    fn add_sample(&self, histogram: &mut Histogram, sample: &StackSourceSample) {
        let time = sample.time_relative_msec;
        let duration = f64::from(sample.metric.abs());
        if self.scaling_policy == ScalingPolicy::ScaleToData || duration == 0.0 {
            if let Some(bucket) = self.bucket_for_time(time) {
                histogram.add_metric(sample.metric, bucket);
            }
            return;
        }

        let from = time.max(self.start);
        let to = (time + duration).min(self.end);
        if to <= from {
            return;
        }
        let mut bucket = match self.bucket_for_time(from) {
            Some(bucket) => bucket,
            None => return,
        };
        while bucket < self.bucket_count {
            let bucket_start = self.bucket_start(bucket);
            let bucket_end = bucket_start + self.bucket_duration;
            let overlap = to.min(bucket_end) - from.max(bucket_start);
            if overlap > 0.0 {
                histogram.add_metric((overlap / duration) as f32 * sample.metric, bucket);
            }
            if bucket_end >= to {
                break;
            }
            bucket += 1;
        }
    }

    fn bucket_description(&self, bucket: usize) -> String {
        format!(
            "{:.3}ms - {:.3}ms",
            self.bucket_start(bucket),
            self.bucket_start(bucket + 1)
        )
    }
}

/// Buckets samples by scenario, folding many scenarios into fewer buckets.
///
/// Scenario `s` of `n` lands in bucket `s * buckets / n`; the displayed value of a bucket is the
/// average over the scenarios it holds.
#[derive(Clone, Debug)]
pub struct ScenarioHistogramController {
    scenario_count: usize,
    bucket_of: Vec<u32>,
    members: Vec<u32>,
    names: Vec<String>,
}

impl ScenarioHistogramController {
    /// Maps `scenario_count` scenarios onto at most `max_buckets` buckets.
    pub fn new(scenario_count: usize, max_buckets: usize) -> Self {
        let scenario_count = scenario_count.max(1);
        let bucket_count = scenario_count.min(max_buckets.max(1));
        let bucket_of: Vec<u32> = (0..scenario_count)
            .map(|s| (s * bucket_count / scenario_count) as u32)
            .collect();
        let mut members = vec![0u32; bucket_count];
        for &bucket in &bucket_of {
            members[bucket as usize] += 1;
        }
        ScenarioHistogramController {
            scenario_count,
            bucket_of,
            members,
            names: Vec::new(),
        }
    }

    /// Names scenarios for [`HistogramController::bucket_description`].
    pub fn with_names(mut self, names: Vec<String>) -> Self {
        self.names = names;
        self
    }

    /// Number of scenarios mapped.
    pub fn scenario_count(&self) -> usize {
        self.scenario_count
    }

    /// The bucket holding `scenario`.
    pub fn bucket_for_scenario(&self, scenario: i32) -> Option<usize> {
        if scenario < 0 {
            return None;
        }
        self.bucket_of.get(scenario as usize).map(|&b| b as usize)
    }

    /// The scenarios folded into `bucket`.
    pub fn scenarios_in_bucket(&self, bucket: usize) -> impl Iterator<Item = usize> + '_ {
        self.bucket_of
            .iter()
            .enumerate()
            .filter(move |(_, &b)| b as usize == bucket)
            .map(|(scenario, _)| scenario)
    }
}

impl HistogramController for ScenarioHistogramController {
    fn bucket_count(&self) -> usize {
        self.members.len()
    }

    fn add_sample(&self, histogram: &mut Histogram, sample: &StackSourceSample) {
        if let Some(bucket) = self.bucket_for_scenario(sample.scenario) {
            histogram.add_metric(sample.metric, bucket);
        }
    }

    fn bucket_value(&self, histogram: &Histogram, bucket: usize) -> f32 {
        histogram.get(bucket) / self.members[bucket].max(1) as f32
    }

    // Bucket values are per-scenario averages.
    fn display_scale(&self, total: f32) -> f32 {
        total / self.scenario_count as f32
    }

    fn bucket_description(&self, bucket: usize) -> String {
        let names: Vec<String> = self
            .scenarios_in_bucket(bucket)
            .map(|s| match self.names.get(s) {
                Some(name) => name.clone(),
                None => s.to_string(),
            })
            .collect();
        names.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stacks::CallStackIndex;

    fn sample(time: f64, metric: f32) -> StackSourceSample {
        StackSourceSample {
            time_relative_msec: time,
            metric,
            ..StackSourceSample::new(CallStackIndex(0))
        }
    }

    #[test]
    fn second_bucket_densifies() {
        let mut h = Histogram::new(4);
        assert!(h.is_empty());
        h.add_metric(1.0, 2);
        h.add_metric(2.0, 2);
        assert_eq!(h.iter().collect::<Vec<_>>(), vec![(2, 3.0)]);
        h.add_metric(5.0, 0);
        assert_eq!(h.iter().collect::<Vec<_>>(), vec![(0, 5.0), (2, 3.0)]);
        assert_eq!(h.get(1), 0.0);
        assert_eq!(h.total(), 8.0);

        let mut copy = Histogram::new(4);
        copy.add_scaled(&h, 0.5);
        assert_eq!(copy.get(0), 2.5);
        assert_eq!(h.get(0), 5.0);
    }

    #[test]
    fn scale_to_data_uses_the_timestamp_bucket() {
        let controller = TimeHistogramController::new(0.0, 100.0, 10, ScalingPolicy::ScaleToData);
        let mut h = controller.new_histogram();
        controller.add_sample(&mut h, &sample(15.0, 4.0));
        controller.add_sample(&mut h, &sample(100.0, 1.0));
        controller.add_sample(&mut h, &sample(100.5, 1.0));
        assert_eq!(h.get(1), 4.0);
        assert_eq!(h.get(9), 1.0);
        assert_eq!(h.total(), 5.0);
    }

    #[test]
    fn time_metric_is_prorated_over_buckets() {
        let controller = TimeHistogramController::new(0.0, 100.0, 10, ScalingPolicy::TimeMetric);
        let mut h = controller.new_histogram();
        // Covers [5, 25): half of bucket 0, all of bucket 1, half of bucket 2.
        controller.add_sample(&mut h, &sample(5.0, 20.0));
        assert_eq!(h.get(0), 5.0);
        assert_eq!(h.get(1), 10.0);
        assert_eq!(h.get(2), 5.0);
        assert_eq!(h.total(), 20.0);

        // Runs past the end of the range: only the covered part counts.
        let mut h = controller.new_histogram();
        controller.add_sample(&mut h, &sample(95.0, 10.0));
        assert_eq!(h.get(9), 5.0);
        assert_eq!(h.total(), 5.0);
    }

    #[test]
    fn scenario_buckets_average() {
        let controller = ScenarioHistogramController::new(4, 2)
            .with_names(vec!["a".into(), "b".into(), "c".into(), "d".into()]);
        assert_eq!(controller.bucket_count(), 2);
        let mut h = controller.new_histogram();
        for (scenario, metric) in [(0, 2.0), (1, 4.0), (2, 10.0)] {
            let mut s = sample(0.0, metric);
            s.scenario = scenario;
            controller.add_sample(&mut h, &s);
        }
        assert_eq!(controller.bucket_value(&h, 0), 3.0);
        assert_eq!(controller.bucket_value(&h, 1), 5.0);
        assert_eq!(controller.bucket_description(1), "c, d");
    }

    #[test]
    fn display_string_levels() {
        let controller = TimeHistogramController::new(0.0, 4.0, 4, ScalingPolicy::ScaleToData);
        let mut h = controller.new_histogram();
        h.add_metric(1.0, 0);
        h.add_metric(0.25, 1);
        h.add_metric(-1.0, 3);
        assert_eq!(controller.display_string(&h, 1.0), "A2_a");
    }
}
