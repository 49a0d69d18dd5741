use std::sync::Arc;

use once_cell::sync::OnceCell;

use super::{
    parallel, CallStackIndex, FrameIndex, IndexMap, SampleIndex, StackSource, StackSourceSample,
};
use crate::error::{Error, Result};

/// Combines several named sources into one, with every source as its own scenario.
///
/// Each sub-source keeps a disjoint slice of the aggregate stack, frame and sample index spaces.
/// Slice 0 of every space belongs to a pseudo source: its frames are the scenario names and its
/// stacks are one root stack per scenario, so every stack of sub-source `i` ends in a caller
/// named after scenario `i`. Reserved frames below [`FrameIndex::START`] are shared by all
/// sources and are not remapped.
///
/// Times are shifted per source so that each source starts at the first sample it produced.
pub struct AggregateStackSource {
    names: Vec<String>,
    sources: Vec<Arc<dyn StackSource>>,
    stacks: IndexMap,
    frames: IndexMap,
    samples: Option<IndexMap>,
    first_time: Vec<OnceCell<f64>>,
}

impl AggregateStackSource {
    /// Aggregates `sources`; the name of each becomes its scenario frame.
    pub fn new(sources: Vec<(String, Arc<dyn StackSource>)>) -> Result<Self> {
        if sources.is_empty() {
            return Err(Error::NoSources);
        }
        let (names, sources): (Vec<String>, Vec<Arc<dyn StackSource>>) =
            sources.into_iter().unzip();
        let n = sources.len();
        let start = FrameIndex::START.index();

        // Empty sources still reserve a slot; the map needs positive counts.
        let stacks = IndexMap::new(
            std::iter::once(n).chain(sources.iter().map(|s| s.call_stack_index_limit().max(1))),
        )?;
        let frames = IndexMap::new(
            std::iter::once(start + n).chain(
                sources
                    .iter()
                    .map(|s| s.call_frame_index_limit().saturating_sub(start).max(1)),
            ),
        )?;
        let samples = if sources.iter().all(|s| s.sample_index_limit() > 0) {
            Some(IndexMap::new(
                std::iter::once(1).chain(sources.iter().map(|s| s.sample_index_limit())),
            )?)
        } else {
            None
        };

        debug!(
            "aggregating {} sources into {} stacks and {} frames",
            n,
            stacks.count(),
            frames.count()
        );
        Ok(AggregateStackSource {
            names,
            first_time: (0..n).map(|_| OnceCell::new()).collect(),
            sources,
            stacks,
            frames,
            samples,
        })
    }

    /// Name of scenario `scenario`.
    pub fn scenario_name(&self, scenario: usize) -> &str {
        &self.names[scenario]
    }

    /// The names of all scenarios, in scenario order.
    pub fn scenario_names(&self) -> &[String] {
        &self.names
    }

    /// The sub-source behind scenario `scenario`.
    pub fn sub_source(&self, scenario: usize) -> &Arc<dyn StackSource> {
        &self.sources[scenario]
    }

    /// The pseudo frame named after `scenario`.
    pub fn scenario_frame(&self, scenario: usize) -> FrameIndex {
        FrameIndex::new(FrameIndex::START.index() + scenario)
    }

    /// The root stack of `scenario`, made of its pseudo frame alone.
    pub fn scenario_stack(&self, scenario: usize) -> CallStackIndex {
        CallStackIndex::new(scenario)
    }

    /// Like [`StackSource::for_each`], but skips every scenario whose entry in `included` is
    /// not `true`. `None` includes everything.
    pub fn for_each_in_scenarios(
        &self,
        included: Option<&[bool]>,
        callback: &mut dyn FnMut(&StackSourceSample),
    ) {
        for (scenario, source) in self.sources.iter().enumerate() {
            if !is_included(included, scenario) {
                continue;
            }
            source.for_each(&mut |sample| callback(&self.convert(scenario, sample)));
        }
    }

    /// Like [`StackSource::parallel_for_each`], restricted to the `included` scenarios.
    ///
    /// Every sub-source gets one forwarding thread, so samples of a single scenario still reach
    /// `callback` in producer order.
    pub fn parallel_for_each_in_scenarios(
        &self,
        included: Option<&[bool]>,
        callback: &(dyn Fn(&StackSourceSample) + Sync),
        nthreads: usize,
    ) {
        let active = (0..self.sources.len())
            .filter(|&s| is_included(included, s))
            .count();
        if nthreads <= 1 || active <= 1 {
            self.for_each_in_scenarios(included, &mut |sample| callback(sample));
            return;
        }
        crossbeam_utils::thread::scope(|scope| {
            for (scenario, source) in self.sources.iter().enumerate() {
                if !is_included(included, scenario) {
                    continue;
                }
                scope.spawn(move |_| {
                    trace!("forwarding samples of scenario {}", scenario);
                    source.for_each(&mut |sample| callback(&self.convert(scenario, sample)));
                });
            }
        })
        .unwrap_or_else(|payload| parallel::rethrow(payload));
    }

    /// Time of the first sample `scenario` produced, or 0 for an empty source.
    ///
    /// Recorded by the first converted sample; if none has been converted yet, the sub-source is
    /// scanned once for it.
    pub fn first_time_relative_msec(&self, scenario: usize) -> f64 {
        *self.first_time[scenario].get_or_init(|| {
            let mut first = None;
            self.sources[scenario].for_each(&mut |sample| {
                first.get_or_insert(sample.time_relative_msec);
            });
            first.unwrap_or(0.0)
        })
    }

    fn convert(&self, scenario: usize, sample: &StackSourceSample) -> StackSourceSample {
        let first = *self.first_time[scenario].get_or_init(|| sample.time_relative_msec);
        self.convert_with(scenario, sample, first)
    }

    fn convert_with(
        &self,
        scenario: usize,
        sample: &StackSourceSample,
        first_time: f64,
    ) -> StackSourceSample {
        let stack_index = if sample.stack_index == CallStackIndex::INVALID {
            self.scenario_stack(scenario)
        } else {
            CallStackIndex(self.stacks.index_of(scenario + 1, sample.stack_index.0))
        };
        let sample_index = match self.samples {
            Some(ref samples) => SampleIndex(samples.index_of(scenario + 1, sample.sample_index.0)),
            None => SampleIndex::INVALID,
        };
        StackSourceSample {
            stack_index,
            sample_index,
            time_relative_msec: sample.time_relative_msec - first_time,
            scenario: scenario as i32,
            ..sample.clone()
        }
    }

    fn sub_frame(&self, scenario: usize, frame: FrameIndex) -> FrameIndex {
        if frame.0 < FrameIndex::START.0 {
            return frame;
        }
        FrameIndex(
            self.frames
                .index_of(scenario + 1, frame.0 - FrameIndex::START.0),
        )
    }
}

fn is_included(included: Option<&[bool]>, scenario: usize) -> bool {
    match included {
        Some(included) => included.get(scenario).copied().unwrap_or(false),
        None => true,
    }
}

impl StackSource for AggregateStackSource {
    fn for_each(&self, callback: &mut dyn FnMut(&StackSourceSample)) {
        self.for_each_in_scenarios(None, callback);
    }

    fn parallel_for_each(&self, callback: &(dyn Fn(&StackSourceSample) + Sync), nthreads: usize) {
        self.parallel_for_each_in_scenarios(None, callback, nthreads);
    }

    fn caller_index(&self, stack: CallStackIndex) -> CallStackIndex {
        if !stack.is_valid() {
            return CallStackIndex::INVALID;
        }
        let source = self.stacks.source_of(stack.0);
        if source == 0 {
            return CallStackIndex::INVALID;
        }
        let scenario = source - 1;
        let offset = self.stacks.offset_of(Some(source), stack.0);
        let caller = self.sources[scenario].caller_index(CallStackIndex(offset));
        if caller == CallStackIndex::INVALID {
            self.scenario_stack(scenario)
        } else {
            CallStackIndex(self.stacks.index_of(source, caller.0))
        }
    }

    fn frame_index(&self, stack: CallStackIndex) -> FrameIndex {
        let source = self.stacks.source_of(stack.0);
        if source == 0 {
            return self.scenario_frame(stack.index());
        }
        let scenario = source - 1;
        let offset = self.stacks.offset_of(Some(source), stack.0);
        let frame = self.sources[scenario].frame_index(CallStackIndex(offset));
        self.sub_frame(scenario, frame)
    }

    fn frame_name(&self, frame: FrameIndex, verbose: bool) -> String {
        if let Some(name) = frame.special_name() {
            return name.to_string();
        }
        let source = self.frames.source_of(frame.0);
        if source == 0 {
            return self.names[frame.index() - FrameIndex::START.index()].clone();
        }
        let offset = self.frames.offset_of(Some(source), frame.0);
        self.sources[source - 1].frame_name(FrameIndex(offset + FrameIndex::START.0), verbose)
    }

    fn call_stack_index_limit(&self) -> usize {
        self.stacks.count()
    }

    fn call_frame_index_limit(&self) -> usize {
        self.frames.count()
    }

    fn sample_index_limit(&self) -> usize {
        self.samples.as_ref().map_or(0, IndexMap::count)
    }

    // Times are normalized against the first sample seen while iterating; a source that was
    // never iterated is not shifted.
    fn sample_by_index(&self, sample: SampleIndex) -> Option<StackSourceSample> {
        let samples = self.samples.as_ref()?;
        if !sample.is_valid() || sample.index() >= samples.count() {
            return None;
        }
        let source = samples.source_of(sample.0);
        if source == 0 {
            return None;
        }
        let scenario = source - 1;
        let offset = samples.offset_of(Some(source), sample.0);
        let found = self.sources[scenario].sample_by_index(SampleIndex(offset))?;
        let first = self.first_time_relative_msec(scenario);
        Some(self.convert_with(scenario, &found, first))
    }

    fn scenario_count(&self) -> usize {
        self.sources.len()
    }

    fn sample_time_relative_msec_limit(&self) -> f64 {
        self.sources
            .iter()
            .enumerate()
            .map(|(scenario, s)| {
                s.sample_time_relative_msec_limit() - self.first_time_relative_msec(scenario)
            })
            .fold(0.0, f64::max)
    }

    fn sampling_rate(&self) -> Option<f32> {
        let first = self.sources[0].sampling_rate()?;
        if self.sources.iter().all(|s| s.sampling_rate() == Some(first)) {
            Some(first)
        } else {
            None
        }
    }
}
