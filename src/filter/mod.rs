//! A [`StackSource`] that filters, folds and groups the stacks of another source.

/// The frame-name pattern language.
pub mod pattern;

use std::sync::{Arc, RwLock};

use crossbeam_utils::atomic::AtomicCell;
use indexmap::IndexSet;
use once_cell::sync::OnceCell;
use regex::Regex;

use self::pattern::GroupPattern;
use crate::error::{Error, Result};
use crate::stacks::{
    CallStackIndex, FrameIndex, SampleIndex, ScalingPolicy, StackSource, StackSourceSample,
};

/// Slack allowed around the time window, to absorb rounding of displayed times.
const TIME_TOLERANCE_MSEC: f64 = 0.0006;

/// Entries of the direct-mapped stack cache.
const STACK_CACHE_SIZE: usize = 32768;

/// Include patterns are tracked as bits of a `u64`.
const MAX_INCLUDE_PATTERNS: usize = 64;

/// What to keep and how to reshape it.
///
/// Pattern lists are `;`-separated; see [`pattern`] for the syntax. Exclude, include and fold
/// patterns match against a frame's name after grouping.
#[derive(Clone, Debug, PartialEq)]
pub struct Options {
    /// Samples ending before this time are dropped.
    ///
    /// Default is `f64::NEG_INFINITY`.
    pub start_time_relative_msec: f64,

    /// Samples starting after this time are dropped.
    ///
    /// Default is `f64::INFINITY`.
    pub end_time_relative_msec: f64,

    /// A sample is kept only if every one of these matches some frame of its stack.
    pub include_patterns: String,

    /// A sample is dropped if any of these matches any frame of its stack.
    pub exclude_patterns: String,

    /// Matching frames are folded into their caller.
    pub fold_patterns: String,

    /// `pattern->group` or `pattern=>group` rules renaming frames to groups. The first matching
    /// rule wins. Consecutive frames of one group collapse into a single frame.
    pub group_patterns: String,

    /// Fold a frame into its caller when both are the same frame.
    ///
    /// Default is `false`.
    pub fold_recursion: bool,

    /// Keep only samples of these scenarios. `None` keeps all.
    pub scenarios: Option<Vec<i32>>,

    /// How sample metrics relate to time. Under [`ScalingPolicy::TimeMetric`], a sample that
    /// only partly overlaps the time window keeps the overlapping share of its metric.
    pub scaling_policy: ScalingPolicy,

    /// Minimum inclusive percentage of a tree node, for consumers that fold the tree built on
    /// top of this source. Not applied by the filter itself.
    ///
    /// Default is `0.0`.
    pub min_inclusive_time_percent: f32,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            start_time_relative_msec: f64::NEG_INFINITY,
            end_time_relative_msec: f64::INFINITY,
            include_patterns: String::new(),
            exclude_patterns: String::new(),
            fold_patterns: String::new(),
            group_patterns: String::new(),
            fold_recursion: false,
            scenarios: None,
            scaling_policy: ScalingPolicy::default(),
            min_inclusive_time_percent: 0.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum FrameAction {
    None,
    Discard,
    Fold,
    Group { group: FrameIndex, frame: FrameIndex },
}

#[derive(Clone, Debug)]
struct FrameInfo {
    action: FrameAction,
    include_bits: u64,
}

/// The filtered view of one base stack.
#[derive(Copy, Clone, Debug, PartialEq)]
struct StackInfo {
    /// The base stack this describes; the cache key.
    stack: CallStackIndex,
    /// The stack samples on `stack` are reported on, or `DISCARD`.
    repr: CallStackIndex,
    /// The frame of `repr` in the filtered frame space.
    frame: FrameIndex,
    /// The group `repr` belongs to, `INVALID` if none.
    group: FrameIndex,
    include_bits: u64,
    fold_count: u32,
}

impl StackInfo {
    const EMPTY: StackInfo = StackInfo {
        stack: CallStackIndex::INVALID,
        repr: CallStackIndex::INVALID,
        frame: FrameIndex::ROOT,
        group: FrameIndex::INVALID,
        include_bits: 0,
        fold_count: 0,
    };

    fn discarded(stack: CallStackIndex) -> Self {
        StackInfo {
            stack,
            repr: CallStackIndex::DISCARD,
            frame: FrameIndex::DISCARD,
            ..StackInfo::EMPTY
        }
    }

    fn folded_into(self, stack: CallStackIndex, include_bits: u64) -> Self {
        StackInfo {
            stack,
            include_bits: self.include_bits | include_bits,
            fold_count: self.fold_count + 1,
            ..self
        }
    }
}

/// Filters, folds and groups the samples and stacks of a base source.
///
/// Stack indices are those of the base source. A stack whose innermost frame gets folded away is
/// reported as its nearest surviving ancestor, and stacks with an excluded frame are reported as
/// [`CallStackIndex::DISCARD`]. Frame indices are those of the base source followed by the
/// frames of groups, which are added as they are first seen.
pub struct FilterStackSource {
    base: Arc<dyn StackSource>,
    start: f64,
    end: f64,
    scaling_policy: ScalingPolicy,
    scenarios: Option<Vec<i32>>,
    fold_recursion: bool,
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    fold: Vec<Regex>,
    groups: Vec<GroupPattern>,
    all_include_bits: u64,
    base_frame_limit: usize,
    frame_infos: Box<[OnceCell<FrameInfo>]>,
    group_frames: RwLock<IndexSet<String>>,
    stack_cache: Box<[AtomicCell<StackInfo>]>,
}

impl FilterStackSource {
    /// Compiles `options` and wraps `base`.
    ///
    /// Every pattern is compiled here, so a bad pattern is reported before any sample is seen.
    pub fn new(base: Arc<dyn StackSource>, options: &Options) -> Result<Self> {
        let include = pattern::compile_list(&options.include_patterns)?;
        if include.len() > MAX_INCLUDE_PATTERNS {
            return Err(Error::TooManyIncludePatterns(include.len()));
        }
        let exclude = pattern::compile_list(&options.exclude_patterns)?;
        let fold = pattern::compile_list(&options.fold_patterns)?;
        let groups = pattern::parse_group_list(&options.group_patterns)?;
        debug!(
            "compiled {} include, {} exclude, {} fold and {} group patterns",
            include.len(),
            exclude.len(),
            fold.len(),
            groups.len()
        );

        let all_include_bits = if include.len() == MAX_INCLUDE_PATTERNS {
            u64::MAX
        } else {
            (1u64 << include.len()) - 1
        };
        let scenarios = options.scenarios.clone().map(|mut s| {
            s.sort_unstable();
            s.dedup();
            s
        });
        let base_frame_limit = base.call_frame_index_limit();
        Ok(FilterStackSource {
            start: options.start_time_relative_msec,
            end: options.end_time_relative_msec,
            scaling_policy: options.scaling_policy,
            scenarios,
            fold_recursion: options.fold_recursion,
            include,
            exclude,
            fold,
            groups,
            all_include_bits,
            base_frame_limit,
            frame_infos: (0..base_frame_limit).map(|_| OnceCell::new()).collect(),
            group_frames: RwLock::new(IndexSet::new()),
            stack_cache: (0..STACK_CACHE_SIZE)
                .map(|_| AtomicCell::new(StackInfo::EMPTY))
                .collect(),
            base,
        })
    }

    /// The source being filtered.
    pub fn base(&self) -> &Arc<dyn StackSource> {
        &self.base
    }

    /// How many frames of base stack `stack` were folded away into the frame it is reported
    /// on.
    pub fn fold_count(&self, stack: CallStackIndex) -> u32 {
        self.stack_info(stack).fold_count
    }

    /// The filtered version of `sample`, or `None` if it is dropped.
    pub fn filter_sample(&self, sample: &StackSourceSample) -> Option<StackSourceSample> {
        if let Some(ref scenarios) = self.scenarios {
            if scenarios.binary_search(&sample.scenario).is_err() {
                return None;
            }
        }
        let metric = self.metric_in_window(sample)?;
        if sample.stack_index == CallStackIndex::DISCARD {
            return None;
        }
        let info = self.stack_info(sample.stack_index);
        if info.repr == CallStackIndex::DISCARD || info.include_bits != self.all_include_bits {
            return None;
        }
        Some(StackSourceSample {
            stack_index: info.repr,
            metric,
            ..sample.clone()
        })
    }

    // The metric of `sample` if it falls within the time window.
    fn metric_in_window(&self, sample: &StackSourceSample) -> Option<f32> {
        let time = sample.time_relative_msec;
        let duration = match self.scaling_policy {
            ScalingPolicy::TimeMetric => f64::from(sample.metric.abs()),
            ScalingPolicy::ScaleToData => 0.0,
        };
        if time > self.end + TIME_TOLERANCE_MSEC || time + duration < self.start - TIME_TOLERANCE_MSEC
        {
            return None;
        }
        if duration == 0.0 {
            return Some(sample.metric);
        }
        let overlap = ((time + duration).min(self.end) - time.max(self.start)).max(0.0);
        if overlap >= duration {
            Some(sample.metric)
        } else {
            Some(sample.metric * (overlap / duration) as f32)
        }
    }

    fn cache_slot(&self, stack: CallStackIndex) -> &AtomicCell<StackInfo> {
        &self.stack_cache[stack.0 as usize % STACK_CACHE_SIZE]
    }

    // Resolves `stack` by walking up to the first cached (or top) caller, then computing the
    // pending stacks back down, caching each one.
    fn stack_info(&self, stack: CallStackIndex) -> StackInfo {
        let mut pending = Vec::new();
        let mut current = stack;
        let mut info = loop {
            if !current.is_valid() {
                break StackInfo::EMPTY;
            }
            let cached = self.cache_slot(current).load();
            if cached.stack == current {
                break cached;
            }
            pending.push(current);
            current = self.base.caller_index(current);
        };
        while let Some(stack) = pending.pop() {
            info = self.compute_stack_info(stack, &info);
            self.cache_slot(stack).store(info);
        }
        info
    }

    fn compute_stack_info(&self, stack: CallStackIndex, caller: &StackInfo) -> StackInfo {
        if caller.repr == CallStackIndex::DISCARD {
            return StackInfo::discarded(stack);
        }
        let base_frame = self.base.frame_index(stack);
        let frame_info = self.frame_info(base_frame);
        let bits = frame_info.include_bits;
        match frame_info.action {
            FrameAction::Discard => StackInfo::discarded(stack),
            FrameAction::Fold => caller.folded_into(stack, bits),
            FrameAction::Group { group, .. } if caller.group == group => {
                caller.folded_into(stack, bits)
            }
            FrameAction::Group { group, frame } => StackInfo {
                stack,
                repr: stack,
                frame,
                group,
                include_bits: caller.include_bits | bits,
                fold_count: 0,
            },
            FrameAction::None if self.fold_recursion && caller.frame == base_frame => {
                caller.folded_into(stack, bits)
            }
            FrameAction::None => StackInfo {
                stack,
                repr: stack,
                frame: base_frame,
                group: FrameIndex::INVALID,
                include_bits: caller.include_bits | bits,
                fold_count: 0,
            },
        }
    }

    fn frame_info(&self, frame: FrameIndex) -> FrameInfo {
        match self.frame_infos.get(frame.0 as usize) {
            Some(cell) if frame.is_valid() => cell
                .get_or_init(|| self.compute_frame_info(frame))
                .clone(),
            _ => self.compute_frame_info(frame),
        }
    }

    fn compute_frame_info(&self, frame: FrameIndex) -> FrameInfo {
        let raw = self.base.frame_name(frame, false);

        let mut grouped = None;
        for group in &self.groups {
            if let Some(name) = group.apply(&raw) {
                let id = self.intern_group(&name);
                let display = if group.is_entry() {
                    self.intern_group(&format!("{} <<{}>>", name, raw))
                } else {
                    id
                };
                grouped = Some((name, id, display));
                break;
            }
        }
        let name = match grouped {
            Some((ref name, ..)) => name.as_str(),
            None => raw.as_str(),
        };

        let mut include_bits = 0;
        for (bit, include) in self.include.iter().enumerate() {
            if include.is_match(name) {
                include_bits |= 1 << bit;
            }
        }
        let action = if self.exclude.iter().any(|re| re.is_match(name)) {
            FrameAction::Discard
        } else if self.fold.iter().any(|re| re.is_match(name)) {
            FrameAction::Fold
        } else if let Some((_, group, frame)) = grouped {
            FrameAction::Group { group, frame }
        } else {
            FrameAction::None
        };
        FrameInfo {
            action,
            include_bits,
        }
    }

    fn intern_group(&self, name: &str) -> FrameIndex {
        if let Some(index) = self.read_groups().get_index_of(name) {
            return FrameIndex::new(self.base_frame_limit + index);
        }
        let mut groups = self
            .group_frames
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (index, _) = groups.insert_full(name.to_string());
        FrameIndex::new(self.base_frame_limit + index)
    }

    fn read_groups(&self) -> std::sync::RwLockReadGuard<'_, IndexSet<String>> {
        self.group_frames
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StackSource for FilterStackSource {
    fn for_each(&self, callback: &mut dyn FnMut(&StackSourceSample)) {
        self.base.for_each(&mut |sample| {
            if let Some(filtered) = self.filter_sample(sample) {
                callback(&filtered);
            }
        });
    }

    fn parallel_for_each(&self, callback: &(dyn Fn(&StackSourceSample) + Sync), nthreads: usize) {
        self.base.parallel_for_each(
            &|sample| {
                if let Some(filtered) = self.filter_sample(sample) {
                    callback(&filtered);
                }
            },
            nthreads,
        );
    }

    fn caller_index(&self, stack: CallStackIndex) -> CallStackIndex {
        if !stack.is_valid() {
            return CallStackIndex::INVALID;
        }
        let caller = self.base.caller_index(stack);
        if !caller.is_valid() {
            return caller;
        }
        self.stack_info(caller).repr
    }

    fn frame_index(&self, stack: CallStackIndex) -> FrameIndex {
        if stack == CallStackIndex::DISCARD {
            return FrameIndex::DISCARD;
        }
        self.stack_info(stack).frame
    }

    fn frame_name(&self, frame: FrameIndex, verbose: bool) -> String {
        if frame.is_valid() && frame.index() >= self.base_frame_limit {
            if let Some(name) = self.read_groups().get_index(frame.index() - self.base_frame_limit)
            {
                return name.clone();
            }
        }
        self.base.frame_name(frame, verbose)
    }

    fn call_stack_index_limit(&self) -> usize {
        self.base.call_stack_index_limit()
    }

    // Grows as group frames are discovered.
    fn call_frame_index_limit(&self) -> usize {
        self.base_frame_limit + self.read_groups().len()
    }

    fn sample_index_limit(&self) -> usize {
        self.base.sample_index_limit()
    }

    fn sample_by_index(&self, sample: SampleIndex) -> Option<StackSourceSample> {
        self.base
            .sample_by_index(sample)
            .and_then(|sample| self.filter_sample(&sample))
    }

    fn scenario_count(&self) -> usize {
        self.base.scenario_count()
    }

    fn sample_time_relative_msec_limit(&self) -> f64 {
        self.base.sample_time_relative_msec_limit()
    }

    fn sampling_rate(&self) -> Option<f32> {
        self.base.sampling_rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stacks::{folded_stack, InternStackSource};

    fn source(stacks: &[(&str, f32, f64)]) -> Arc<dyn StackSource> {
        let mut source = InternStackSource::new();
        for &(stack, metric, time) in stacks {
            source.add_stack(stack.split(';'), metric, time);
        }
        Arc::new(source)
    }

    fn kept(filter: &FilterStackSource) -> Vec<(String, f32)> {
        let mut out = Vec::new();
        filter.for_each(&mut |s| out.push((folded_stack(filter, s.stack_index), s.metric)));
        out
    }

    fn filter(stacks: &[(&str, f32, f64)], options: Options) -> FilterStackSource {
        FilterStackSource::new(source(stacks), &options).unwrap()
    }

    const ABC: &[(&str, f32, f64)] = &[("A;B", 1.0, 0.0), ("A;C", 1.0, 1.0), ("A;B", 1.0, 2.0)];

    #[test]
    fn exclude_drops_whole_stacks() {
        let f = filter(
            ABC,
            Options {
                exclude_patterns: "C".into(),
                ..Default::default()
            },
        );
        assert_eq!(kept(&f), vec![("A;B".to_string(), 1.0), ("A;B".to_string(), 1.0)]);
    }

    #[test]
    fn exclusion_reaches_callees() {
        let f = filter(
            &[("main;skip;leaf", 1.0, 0.0), ("main;keep", 1.0, 0.0)],
            Options {
                exclude_patterns: "^skip".into(),
                ..Default::default()
            },
        );
        assert_eq!(kept(&f), vec![("main;keep".to_string(), 1.0)]);
    }

    #[test]
    fn include_needs_every_pattern() {
        let stacks = &[
            ("main;parse;lex", 1.0, 0.0),
            ("main;parse", 1.0, 0.0),
            ("main;lex", 1.0, 0.0),
        ];
        let f = filter(
            stacks,
            Options {
                include_patterns: "parse;lex".into(),
                ..Default::default()
            },
        );
        assert_eq!(kept(&f), vec![("main;parse;lex".to_string(), 1.0)]);
    }

    #[test]
    fn folded_frames_move_to_their_caller() {
        let f = filter(
            &[("main;helper;work", 1.0, 0.0), ("main;helper", 1.0, 0.0)],
            Options {
                fold_patterns: "helper".into(),
                ..Default::default()
            },
        );
        assert_eq!(
            kept(&f),
            vec![("main;work".to_string(), 1.0), ("main".to_string(), 1.0)]
        );
    }

    #[test]
    fn recursion_folds() {
        let stacks = &[("main;walk;walk;walk;visit", 1.0, 0.0)];
        let f = filter(
            stacks,
            Options {
                fold_recursion: true,
                ..Default::default()
            },
        );
        assert_eq!(kept(&f), vec![("main;walk;visit".to_string(), 1.0)]);

        let f = filter(stacks, Options::default());
        assert_eq!(kept(&f), vec![("main;walk;walk;walk;visit".to_string(), 1.0)]);
    }

    #[test]
    fn groups_collapse_consecutive_members() {
        let stacks = &[
            ("app!main;sys!open;sys!read;app!callback", 1.0, 0.0),
            ("app!main;app!work", 1.0, 0.0),
        ];
        let f = filter(
            stacks,
            Options {
                group_patterns: "{%}!->module $1".into(),
                ..Default::default()
            },
        );
        assert_eq!(
            kept(&f),
            vec![
                ("module app;module sys;module app".to_string(), 1.0),
                ("module app".to_string(), 1.0),
            ]
        );
        assert!(f.call_frame_index_limit() > f.base().call_frame_index_limit());
    }

    #[test]
    fn entry_groups_name_the_entry_frame() {
        let f = filter(
            &[("main;sys!open;sys!read", 1.0, 0.0)],
            Options {
                group_patterns: "^sys!=>OS".into(),
                ..Default::default()
            },
        );
        assert_eq!(kept(&f), vec![("main;OS <<sys!open>>".to_string(), 1.0)]);
    }

    #[test]
    fn exclude_matches_group_names() {
        let f = filter(
            &[("main;sys!open", 1.0, 0.0), ("main;work", 1.0, 0.0)],
            Options {
                group_patterns: "^sys!->OS".into(),
                exclude_patterns: "^OS".into(),
                ..Default::default()
            },
        );
        assert_eq!(kept(&f), vec![("main;work".to_string(), 1.0)]);
    }

    #[test]
    fn time_window() {
        let stacks = &[("a", 1.0, 0.0), ("b", 1.0, 5.0), ("c", 1.0, 10.0), ("d", 1.0, 10.0005)];
        let f = filter(
            stacks,
            Options {
                start_time_relative_msec: 5.0,
                end_time_relative_msec: 10.0,
                ..Default::default()
            },
        );
        let names: Vec<String> = kept(&f).into_iter().map(|(s, _)| s).collect();
        assert_eq!(names, vec!["b", "c", "d"]);
    }

    #[test]
    fn time_metric_is_prorated() {
        let f = filter(
            &[("a", 4.0, 8.0), ("b", 4.0, 20.0)],
            Options {
                start_time_relative_msec: 0.0,
                end_time_relative_msec: 10.0,
                scaling_policy: ScalingPolicy::TimeMetric,
                ..Default::default()
            },
        );
        assert_eq!(kept(&f), vec![("a".to_string(), 2.0)]);
    }

    #[test]
    fn scenarios_are_selected() {
        let mut base = InternStackSource::new();
        for scenario in 0..3 {
            let stack = base.stack_for_frames(["x"]);
            base.add_sample(StackSourceSample {
                scenario,
                ..StackSourceSample::new(stack)
            });
        }
        let f = FilterStackSource::new(
            Arc::new(base),
            &Options {
                scenarios: Some(vec![2, 0]),
                ..Default::default()
            },
        )
        .unwrap();
        let mut seen = Vec::new();
        f.for_each(&mut |s| seen.push(s.scenario));
        assert_eq!(seen, vec![0, 2]);
    }

    #[test]
    fn bad_patterns_fail_up_front() {
        let err = FilterStackSource::new(
            source(ABC),
            &Options {
                exclude_patterns: "ok;bad{".into(),
                ..Default::default()
            },
        );
        assert!(matches!(err, Err(Error::Pattern { ref pattern, .. }) if pattern == "bad{"));

        let many = (0..65).map(|i| i.to_string()).collect::<Vec<_>>().join(";");
        let err = FilterStackSource::new(
            source(ABC),
            &Options {
                include_patterns: many,
                ..Default::default()
            },
        );
        assert!(matches!(err, Err(Error::TooManyIncludePatterns(65))));
    }

    #[test]
    fn fold_counts_are_tracked() {
        let mut base = InternStackSource::new();
        let stack = base.stack_for_frames(["main", "a", "b", "leaf"]);
        let f = FilterStackSource::new(
            Arc::new(base),
            &Options {
                fold_patterns: "^a;^b".into(),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(f.fold_count(stack), 0);
        assert_eq!(folded_stack(&f, stack), "main;leaf");
        assert_eq!(f.fold_count(f.base().caller_index(stack)), 2);
    }
}
