use std::io::{self, BufRead};

use super::{parallel, CallStackIndex, FrameIndex, SampleIndex, StackSource, StackSourceSample};
use crate::intern::Interner;

/// A [`StackSource`] that owns its samples and builds its frames and stacks by interning.
///
/// Frame names are interned into frame indices starting at [`FrameIndex::START`], and every
/// `(frame, caller)` pair is interned into a stack index, so stacks sharing a prefix share their
/// caller stacks. Samples are stored as given and never change once added.
#[derive(Debug, Clone, Default)]
pub struct InternStackSource {
    frames: Interner<String>,
    stacks: Interner<(FrameIndex, CallStackIndex)>,
    samples: Vec<StackSourceSample>,
    time_limit: f64,
    scenario_count: usize,
    sampling_rate: Option<f32>,
}

impl InternStackSource {
    /// An empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// The frame index for `name`, interning it if needed.
    pub fn frame(&mut self, name: &str) -> FrameIndex {
        FrameIndex::new(FrameIndex::START.index() + self.frames.intern_ref(name))
    }

    /// The stack index for `frame` called from `caller`, interning it if needed.
    pub fn call_stack(&mut self, frame: FrameIndex, caller: CallStackIndex) -> CallStackIndex {
        CallStackIndex::new(self.stacks.intern((frame, caller)))
    }

    /// The stack for a list of frame names given outermost first.
    pub fn stack_for_frames<I, S>(&mut self, root_first: I) -> CallStackIndex
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut stack = CallStackIndex::INVALID;
        for name in root_first {
            let frame = self.frame(name.as_ref());
            stack = self.call_stack(frame, stack);
        }
        stack
    }

    /// Appends a sample and returns the index it was stored at.
    pub fn add_sample(&mut self, mut sample: StackSourceSample) -> SampleIndex {
        let index = SampleIndex::new(self.samples.len());
        sample.sample_index = index;
        let end = sample.time_relative_msec + f64::from(sample.metric.abs());
        if end > self.time_limit {
            self.time_limit = end;
        }
        if sample.scenario >= 0 && sample.scenario as usize >= self.scenario_count {
            self.scenario_count = sample.scenario as usize + 1;
        }
        self.samples.push(sample);
        index
    }

    /// Appends a sample with the given metric and time on the stack named outermost first.
    pub fn add_stack<I, S>(&mut self, root_first: I, metric: f32, time_relative_msec: f64) -> SampleIndex
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let stack_index = self.stack_for_frames(root_first);
        self.add_sample(StackSourceSample {
            stack_index,
            metric,
            time_relative_msec,
            ..StackSourceSample::new(stack_index)
        })
    }

    /// Sets how many real events every sample stands for.
    pub fn set_sampling_rate(&mut self, rate: Option<f32>) {
        self.sampling_rate = rate;
    }

    /// All samples, in the order they were added.
    pub fn samples(&self) -> &[StackSourceSample] {
        &self.samples
    }

    /// Drops the hash indices of the frame and stack tables. The source stays fully readable,
    /// but no more frames or stacks can be added.
    pub fn done_interning(&mut self) {
        self.frames.done_interning();
        self.stacks.done_interning();
    }

    /// Parses folded stack lines: semicolon-separated frames, outermost first, then whitespace
    /// and a sample count (for example `main;parse;lex 12`).
    ///
    /// Every line becomes one sample whose metric and count are the line's count. Timestamps are
    /// synthesized by laying the lines end to end, one millisecond per counted sample. Lines
    /// without a count are ignored with a warning.
    pub fn from_folded<R>(mut reader: R) -> io::Result<Self>
    where
        R: BufRead,
    {
        let mut source = Self::new();
        let mut line = String::new();
        let mut time = 0.0;
        let mut ignored = 0;
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                break;
            }

            let mut stack = line.trim();
            if stack.is_empty() {
                continue;
            }
            let nsamples = match parse_nsamples(&mut stack) {
                Some(n) if !stack.is_empty() => n,
                _ => {
                    ignored += 1;
                    continue;
                }
            };

            let stack_index = source.stack_for_frames(stack.split(';').filter(|f| !f.is_empty()));
            source.add_sample(StackSourceSample {
                stack_index,
                metric: nsamples,
                count: nsamples,
                time_relative_msec: time,
                ..StackSourceSample::new(stack_index)
            });
            time += f64::from(nsamples);
        }

        if ignored != 0 {
            warn!("Ignored {} lines with invalid format", ignored);
        }
        Ok(source)
    }
}

// Parse and remove the number of samples from the end of a line.
fn parse_nsamples(line: &mut &str) -> Option<f32> {
    let samplesi = line.rfind(|c: char| c.is_whitespace())?;
    let nsamples = line[samplesi..].trim_start().parse::<f32>().ok()?;
    if !nsamples.is_finite() {
        return None;
    }
    *line = line[..samplesi].trim_end();
    Some(nsamples)
}

impl StackSource for InternStackSource {
    fn for_each(&self, callback: &mut dyn FnMut(&StackSourceSample)) {
        for sample in &self.samples {
            callback(sample);
        }
    }

    // Samples never move, so each worker can walk its own slice of them directly.
    fn parallel_for_each(&self, callback: &(dyn Fn(&StackSourceSample) + Sync), nthreads: usize) {
        if nthreads <= 1 || self.samples.len() < 2 {
            for sample in &self.samples {
                callback(sample);
            }
            return;
        }
        let chunk = (self.samples.len() + nthreads - 1) / nthreads;
        crossbeam_utils::thread::scope(|scope| {
            for part in self.samples.chunks(chunk) {
                scope.spawn(move |_| {
                    for sample in part {
                        callback(sample);
                    }
                });
            }
        })
        .unwrap_or_else(|payload| parallel::rethrow(payload));
    }

    fn caller_index(&self, stack: CallStackIndex) -> CallStackIndex {
        self.stacks.get(stack.index()).1
    }

    fn frame_index(&self, stack: CallStackIndex) -> FrameIndex {
        self.stacks.get(stack.index()).0
    }

    fn frame_name(&self, frame: FrameIndex, _verbose: bool) -> String {
        match frame.special_name() {
            Some(name) => name.to_string(),
            None => self
                .frames
                .get(frame.index() - FrameIndex::START.index())
                .clone(),
        }
    }

    fn call_stack_index_limit(&self) -> usize {
        self.stacks.len()
    }

    fn call_frame_index_limit(&self) -> usize {
        FrameIndex::START.index() + self.frames.len()
    }

    fn sample_index_limit(&self) -> usize {
        self.samples.len()
    }

    fn sample_by_index(&self, sample: SampleIndex) -> Option<StackSourceSample> {
        if !sample.is_valid() {
            return None;
        }
        self.samples.get(sample.index()).cloned()
    }

    fn scenario_count(&self) -> usize {
        self.scenario_count
    }

    fn sample_time_relative_msec_limit(&self) -> f64 {
        self.time_limit
    }

    fn samples_immutable(&self) -> bool {
        true
    }

    fn sampling_rate(&self) -> Option<f32> {
        self.sampling_rate
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use log::Level;

    use super::*;
    use crate::stacks::folded_stack;

    #[test]
    fn shared_prefixes_share_stacks() {
        let mut source = InternStackSource::new();
        let ab = source.stack_for_frames(["A", "B"]);
        let ac = source.stack_for_frames(["A", "C"]);
        assert_eq!(source.stack_for_frames(["A", "B"]), ab);
        assert_eq!(source.caller_index(ab), source.caller_index(ac));
        assert_eq!(source.call_stack_index_limit(), 3);
        assert_eq!(source.call_frame_index_limit(), FrameIndex::START.index() + 3);
        assert_eq!(folded_stack(&source, ac), "A;C");
        assert_eq!(source.frame_name(FrameIndex::BROKEN, false), "BROKEN");
    }

    #[test]
    fn samples_are_numbered_in_order() {
        let mut source = InternStackSource::new();
        let first = source.add_stack(["main"], 2.0, 1.0);
        let second = source.add_stack(["main", "work"], 3.0, 4.0);
        assert_eq!(first, SampleIndex(0));
        assert_eq!(second, SampleIndex(1));
        assert_eq!(source.sample_index_limit(), 2);
        assert_eq!(source.sample_by_index(second).unwrap().metric, 3.0);
        assert_eq!(source.sample_time_relative_msec_limit(), 7.0);
    }

    #[test]
    fn done_interning_keeps_stacks_walkable() {
        let mut source = InternStackSource::new();
        let stack = source.stack_for_frames(["x", "y", "z"]);
        source.done_interning();
        assert_eq!(folded_stack(&source, stack), "x;y;z");
    }

    #[test]
    fn parses_folded_lines() {
        testing_logger::setup();
        let input = "main;parse 3\nmain;parse;lex 1.5\n\nno count here\nmain 2\n";
        let source = InternStackSource::from_folded(input.as_bytes()).unwrap();
        testing_logger::validate(|logs| {
            assert_eq!(logs.len(), 1);
            assert_eq!(logs[0].level, Level::Warn);
            assert_eq!(logs[0].body, "Ignored 1 lines with invalid format");
        });

        let samples = source.samples();
        assert_eq!(samples.len(), 3);
        assert_eq!(folded_stack(&source, samples[1].stack_index), "main;parse;lex");
        assert_eq!(samples[1].metric, 1.5);
        assert_eq!(samples[1].time_relative_msec, 3.0);
        assert_eq!(samples[2].time_relative_msec, 4.5);
    }

    #[test]
    fn parallel_iteration_sees_every_sample() {
        let mut source = InternStackSource::new();
        for i in 0..1000 {
            source.add_stack(["root", if i % 2 == 0 { "even" } else { "odd" }], 1.0, i as f64);
        }
        let seen = Mutex::new(Vec::new());
        source.parallel_for_each(&|sample| seen.lock().unwrap().push(sample.sample_index), 6);
        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        assert_eq!(seen, (0..1000).map(SampleIndex).collect::<Vec<_>>());
    }
}
