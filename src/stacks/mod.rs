/// Combining several sources into one, one scenario per source.
pub mod aggregate;

/// Mapping several dense index ranges into one.
pub mod index_map;

/// A concrete source built by interning frames and stacks.
pub mod intern;

mod parallel;

pub use self::aggregate::AggregateStackSource;
pub use self::index_map::IndexMap;
pub use self::intern::InternStackSource;
pub use self::parallel::{SAMPLES_PER_BLOCK, DEFAULT_NTHREADS};

macro_rules! define_index {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub i32);

        impl $name {
            /// Marks the absence of an index.
            pub const INVALID: $name = $name(-1);

            /// Wraps a dense zero-based position.
            ///
            /// # Panics
            ///
            /// Panics if `index` does not fit in an `i32`.
            pub fn new(index: usize) -> Self {
                assert!(index <= i32::MAX as usize, "index {} out of range", index);
                $name(index as i32)
            }

            /// Returns `true` for ordinary (non-negative) indices.
            pub fn is_valid(self) -> bool {
                self.0 >= 0
            }

            /// The dense position this index refers to.
            ///
            /// # Panics
            ///
            /// Panics on a negative (sentinel) index.
            pub fn index(self) -> usize {
                assert!(self.0 >= 0, "{:?} is not a dense index", self);
                self.0 as usize
            }
        }
    };
}

define_index!(
    /// Identifies a named frame: a method, a synthesized group, or a scenario label.
    FrameIndex
);

define_index!(
    /// Identifies one complete call chain: a frame plus its chain of callers.
    CallStackIndex
);

define_index!(
    /// Identifies one sample of a source, for sources that support looking samples up.
    SampleIndex
);

impl FrameIndex {
    /// The synthetic root of every tree.
    pub const ROOT: FrameIndex = FrameIndex(0);
    /// A stack that could not be walked completely.
    pub const BROKEN: FrameIndex = FrameIndex(1);
    /// A frame whose name could not be resolved.
    pub const UNKNOWN: FrameIndex = FrameIndex(2);
    /// Time attributed to the profiler itself.
    pub const OVERHEAD: FrameIndex = FrameIndex(3);
    /// The first index available for ordinary frames.
    pub const START: FrameIndex = FrameIndex(4);
    /// A frame that was filtered out.
    pub const DISCARD: FrameIndex = FrameIndex(-2);

    /// Name of one of the reserved frames below [`FrameIndex::START`].
    pub fn special_name(self) -> Option<&'static str> {
        match self.0 {
            0 => Some("ROOT"),
            1 => Some("BROKEN"),
            2 => Some("UNKNOWN"),
            3 => Some("OVERHEAD"),
            -2 => Some("DISCARD"),
            _ => None,
        }
    }
}

impl CallStackIndex {
    /// The first ordinary stack index.
    pub const START: CallStackIndex = CallStackIndex(0);
    /// A stack that was filtered out; samples on it are dropped.
    pub const DISCARD: CallStackIndex = CallStackIndex(-2);
}

/// Identifies a node of a built [`CallTree`](crate::call_tree::CallTree).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(pub u32);

impl NodeIndex {
    /// The position of this node in its tree's arena.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// How the metric of a sample should be interpreted.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ScalingPolicy {
    /// The metric is an arbitrary weight; percentages are relative to the data.
    #[default]
    ScaleToData,
    /// The metric is a duration in milliseconds starting at the sample's timestamp.
    TimeMetric,
}

/// One sample of a [`StackSource`].
///
/// Producers lend samples to callbacks by reference and are free to reuse the storage for the
/// next sample, so a consumer that wants to keep one around must clone it.
#[derive(Clone, Debug, PartialEq)]
pub struct StackSourceSample {
    /// The stack that was sampled.
    pub stack_index: CallStackIndex,
    /// The weight of the sample (a duration under [`ScalingPolicy::TimeMetric`]).
    pub metric: f32,
    /// When the sample was taken, relative to the start of the trace.
    pub time_relative_msec: f64,
    /// Back reference into the producing source, or [`SampleIndex::INVALID`].
    pub sample_index: SampleIndex,
    /// How many raw samples this one stands for.
    pub count: f32,
    /// The scenario the sample belongs to.
    pub scenario: i32,
}

impl StackSourceSample {
    /// A sample on `stack_index` with metric 1 and count 1 at time zero.
    pub fn new(stack_index: CallStackIndex) -> Self {
        StackSourceSample {
            stack_index,
            metric: 1.0,
            time_relative_msec: 0.0,
            sample_index: SampleIndex::INVALID,
            count: 1.0,
            scenario: 0,
        }
    }
}

impl Default for StackSourceSample {
    fn default() -> Self {
        Self::new(CallStackIndex::INVALID)
    }
}

/// Which way to follow references in a graph source.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RefDirection {
    /// Follow references from an object to the objects it points to.
    From,
    /// Follow references from an object to the objects that point to it.
    To,
}

/// A stream of samples together with the means to walk their stacks.
///
/// Every stack is a dense [`CallStackIndex`]. [`StackSource::frame_index`] names its innermost
/// frame and [`StackSource::caller_index`] leads to the stack of its caller, until
/// [`CallStackIndex::INVALID`] marks the top. All index accessors may be called from several
/// threads at once.
pub trait StackSource: Send + Sync {
    /// Calls `callback` once for every sample, in producer order, on the current thread.
    fn for_each(&self, callback: &mut dyn FnMut(&StackSourceSample));

    /// Calls `callback` once for every sample from up to `nthreads` threads.
    ///
    /// There is no ordering guarantee between callback invocations. The default implementation
    /// runs [`StackSource::for_each`] on the calling thread and hands samples to worker threads
    /// in blocks of [`SAMPLES_PER_BLOCK`].
    fn parallel_for_each(&self, callback: &(dyn Fn(&StackSourceSample) + Sync), nthreads: usize) {
        parallel::dispatch_blocks(self, callback, nthreads)
    }

    /// The stack of the caller of `stack`, or [`CallStackIndex::INVALID`] at the top.
    fn caller_index(&self, stack: CallStackIndex) -> CallStackIndex;

    /// The innermost frame of `stack`.
    fn frame_index(&self, stack: CallStackIndex) -> FrameIndex;

    /// A display name for `frame`; `verbose` asks for as much detail as the source has.
    fn frame_name(&self, frame: FrameIndex, verbose: bool) -> String;

    /// One past the largest stack index this source hands out.
    fn call_stack_index_limit(&self) -> usize;

    /// One past the largest frame index this source hands out.
    fn call_frame_index_limit(&self) -> usize;

    /// One past the largest sample index, or 0 if samples cannot be looked up.
    fn sample_index_limit(&self) -> usize {
        0
    }

    /// Looks up a sample by index, for sources that support it.
    fn sample_by_index(&self, _sample: SampleIndex) -> Option<StackSourceSample> {
        None
    }

    /// Number of scenarios, or 0 if the source does not partition its samples.
    fn scenario_count(&self) -> usize {
        0
    }

    /// An upper bound on the timestamps of the samples, 0 if unknown.
    fn sample_time_relative_msec_limit(&self) -> f64 {
        0.0
    }

    /// Whether a sample lent to a callback stays valid after the callback returns.
    fn samples_immutable(&self) -> bool {
        false
    }

    /// Whether samples are nodes of an object graph rather than independent call stacks.
    fn is_graph_source(&self) -> bool {
        false
    }

    /// Calls `callback` for every sample referenced from (or referencing) `sample`.
    fn references(
        &self,
        _sample: SampleIndex,
        _direction: RefDirection,
        _callback: &mut dyn FnMut(SampleIndex),
    ) {
    }

    /// How many real events each sample stands for, if the source was sampled.
    fn sampling_rate(&self) -> Option<f32> {
        None
    }
}

/// Iterator over the frames of a stack, innermost first. See [`frames`].
pub struct Frames<'a, S: ?Sized> {
    source: &'a S,
    stack: CallStackIndex,
}

impl<'a, S> Iterator for Frames<'a, S>
where
    S: StackSource + ?Sized,
{
    type Item = FrameIndex;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.stack.is_valid() {
            return None;
        }
        let frame = self.source.frame_index(self.stack);
        self.stack = self.source.caller_index(self.stack);
        Some(frame)
    }
}

/// Walks `stack` from its innermost frame out to the top.
pub fn frames<S>(source: &S, stack: CallStackIndex) -> Frames<'_, S>
where
    S: StackSource + ?Sized,
{
    Frames { source, stack }
}

/// Renders `stack` as `outer;...;inner`, the folded stack notation.
pub fn folded_stack<S>(source: &S, stack: CallStackIndex) -> String
where
    S: StackSource + ?Sized,
{
    let mut names: Vec<String> = frames(source, stack)
        .map(|frame| source.frame_name(frame, false))
        .collect();
    names.reverse();
    names.join(";")
}
