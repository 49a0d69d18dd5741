//! Building call trees out of stack sources, and the views derived from them.

/// Merged caller and callee trees rooted at one frame.
pub mod aggregate;

/// Flat caller and callee summaries of one frame.
pub mod caller_callee;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};

use ahash::RandomState;
use crossbeam_utils::atomic::AtomicCell;
use dashmap::DashMap;
use once_cell::sync::OnceCell;

use crate::histogram::{Histogram, HistogramController};
use crate::stacks::{
    CallStackIndex, FrameIndex, NodeIndex, SampleIndex, ScalingPolicy, StackSource,
    StackSourceSample, DEFAULT_NTHREADS,
};

/// Nodes with more callees than this look callees up through a hash map while the tree is built.
const MAX_LINEAR_CALLEES: usize = 16;

/// Entries of the direct-mapped stack to node cache used while building.
const STACK_CACHE_SIZE: usize = 4096;

const EMPTY_CACHE_ENTRY: u64 = u64::MAX;

const ROOT: NodeIndex = NodeIndex(0);

/// Configure how a [`CallTree`] is built.
#[derive(Clone, Debug)]
pub struct Options {
    /// How sample metrics relate to time. Under [`ScalingPolicy::TimeMetric`] a sample covers
    /// `[time, time + |metric|)`, which widens the last time of the nodes it lands in.
    pub scaling_policy: ScalingPolicy,

    /// The number of threads used to feed samples into the tree. With 1, samples are read in
    /// producer order on the calling thread.
    ///
    /// Default is the number of logical cores plus a quarter.
    pub nthreads: usize,

    /// When set, every node records its inclusive metric over time.
    pub time_histogram: Option<Arc<dyn HistogramController>>,

    /// When set, every node records its inclusive metric per scenario.
    pub scenario_histogram: Option<Arc<dyn HistogramController>>,

    /// Sort callees once the tree is built: largest inclusive metric magnitude first, earlier
    /// first time breaking ties.
    ///
    /// Default is `true`.
    pub sort: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            scaling_policy: ScalingPolicy::default(),
            nthreads: *DEFAULT_NTHREADS,
            time_histogram: None,
            scenario_histogram: None,
            sort: true,
        }
    }
}

/// The metrics of a node, or of a sum of nodes.
#[derive(Clone, Debug, PartialEq)]
pub struct CallTreeNodeBase {
    name: Arc<str>,
    id: FrameIndex,
    inclusive_metric: f32,
    inclusive_count: f64,
    exclusive_metric: f32,
    exclusive_count: f64,
    exclusive_folded_metric: f32,
    exclusive_folded_count: f64,
    first_time: f64,
    last_time: f64,
    inclusive_metric_by_time: Option<Histogram>,
    inclusive_metric_by_scenario: Option<Histogram>,
}

impl CallTreeNodeBase {
    pub(crate) fn new(name: Arc<str>, id: FrameIndex) -> Self {
        CallTreeNodeBase {
            name,
            id,
            inclusive_metric: 0.0,
            inclusive_count: 0.0,
            exclusive_metric: 0.0,
            exclusive_count: 0.0,
            exclusive_folded_metric: 0.0,
            exclusive_folded_count: 0.0,
            first_time: f64::INFINITY,
            last_time: f64::NEG_INFINITY,
            inclusive_metric_by_time: None,
            inclusive_metric_by_scenario: None,
        }
    }

    /// The frame name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The canonical frame of this node. Frames with equal names share one canonical frame.
    pub fn id(&self) -> FrameIndex {
        self.id
    }

    /// Metric of every sample in this node or below.
    pub fn inclusive_metric(&self) -> f32 {
        self.inclusive_metric
    }

    /// Count of every sample in this node or below.
    pub fn inclusive_count(&self) -> f64 {
        self.inclusive_count
    }

    /// Metric of the samples in this node itself, including folded callees.
    pub fn exclusive_metric(&self) -> f32 {
        self.exclusive_metric
    }

    /// Count of the samples in this node itself, including folded callees.
    pub fn exclusive_count(&self) -> f64 {
        self.exclusive_count
    }

    /// The part of the exclusive metric that came from folded callees.
    pub fn exclusive_folded_metric(&self) -> f32 {
        self.exclusive_folded_metric
    }

    /// The part of the exclusive count that came from folded callees.
    pub fn exclusive_folded_count(&self) -> f64 {
        self.exclusive_folded_count
    }

    /// Time of the earliest sample, 0 without samples.
    pub fn first_time_relative_msec(&self) -> f64 {
        if self.has_time() {
            self.first_time
        } else {
            0.0
        }
    }

    /// Time of the latest sample (its end, under a time metric), 0 without samples.
    pub fn last_time_relative_msec(&self) -> f64 {
        if self.has_time() {
            self.last_time
        } else {
            0.0
        }
    }

    /// Time between the first and last sample.
    pub fn duration_msec(&self) -> f64 {
        self.last_time_relative_msec() - self.first_time_relative_msec()
    }

    /// Inclusive metric by time, if the tree records it.
    pub fn inclusive_metric_by_time(&self) -> Option<&Histogram> {
        self.inclusive_metric_by_time.as_ref()
    }

    /// Inclusive metric by scenario, if the tree records it.
    pub fn inclusive_metric_by_scenario(&self) -> Option<&Histogram> {
        self.inclusive_metric_by_scenario.as_ref()
    }

    fn has_time(&self) -> bool {
        self.first_time <= self.last_time
    }

    fn add_inclusive_sample(
        &mut self,
        sample: &StackSourceSample,
        end_time: f64,
        histograms: &Histograms<'_>,
    ) {
        self.inclusive_metric += sample.metric;
        self.inclusive_count += f64::from(sample.count);
        self.first_time = self.first_time.min(sample.time_relative_msec);
        self.last_time = self.last_time.max(end_time);
        if let Some(controller) = histograms.time {
            let histogram = self
                .inclusive_metric_by_time
                .get_or_insert_with(|| controller.new_histogram());
            controller.add_sample(histogram, sample);
        }
        if let Some(controller) = histograms.scenario {
            let histogram = self
                .inclusive_metric_by_scenario
                .get_or_insert_with(|| controller.new_histogram());
            controller.add_sample(histogram, sample);
        }
    }

    /// Adds `weight` times the inclusive totals of `other`. Times only widen for positive
    /// weights.
    pub(crate) fn add_inclusive(&mut self, other: &CallTreeNodeBase, weight: f32) {
        self.inclusive_metric += other.inclusive_metric * weight;
        self.inclusive_count += other.inclusive_count * f64::from(weight);
        if weight > 0.0 && other.has_time() {
            self.first_time = self.first_time.min(other.first_time);
            self.last_time = self.last_time.max(other.last_time);
        }
        add_histogram(
            &mut self.inclusive_metric_by_time,
            &other.inclusive_metric_by_time,
            weight,
        );
        add_histogram(
            &mut self.inclusive_metric_by_scenario,
            &other.inclusive_metric_by_scenario,
            weight,
        );
    }

    /// Adds `weight` times the exclusive totals of `other`.
    pub(crate) fn add_exclusive(&mut self, other: &CallTreeNodeBase, weight: f32) {
        self.exclusive_metric += other.exclusive_metric * weight;
        self.exclusive_count += other.exclusive_count * f64::from(weight);
        self.exclusive_folded_metric += other.exclusive_folded_metric * weight;
        self.exclusive_folded_count += other.exclusive_folded_count * f64::from(weight);
    }

    /// Adds `weight` times the exclusive totals of `other` to both the exclusive and the
    /// inclusive totals of this one.
    pub(crate) fn add_exclusive_as_inclusive(&mut self, other: &CallTreeNodeBase, weight: f32) {
        self.inclusive_metric += other.exclusive_metric * weight;
        self.inclusive_count += other.exclusive_count * f64::from(weight);
        if weight > 0.0 && other.has_time() {
            self.first_time = self.first_time.min(other.first_time);
            self.last_time = self.last_time.max(other.last_time);
        }
    }
}

fn add_histogram(into: &mut Option<Histogram>, from: &Option<Histogram>, weight: f32) {
    if let Some(from) = from {
        into.get_or_insert_with(|| Histogram::new(from.bucket_count()))
            .add_scaled(from, weight);
    }
}

struct Histograms<'a> {
    time: Option<&'a dyn HistogramController>,
    scenario: Option<&'a dyn HistogramController>,
}

/// A node of a [`CallTree`]: the metrics of one frame reached through one particular chain of
/// callers.
#[derive(Clone, Debug)]
pub struct CallTreeNode {
    base: CallTreeNodeBase,
    caller: Option<NodeIndex>,
    callees: Vec<NodeIndex>,
    samples: Vec<SampleIndex>,
    callee_map: Option<HashMap<FrameIndex, NodeIndex, RandomState>>,
}

impl CallTreeNode {
    fn new(name: Arc<str>, id: FrameIndex, caller: Option<NodeIndex>) -> Self {
        CallTreeNode {
            base: CallTreeNodeBase::new(name, id),
            caller,
            callees: Vec::new(),
            samples: Vec::new(),
            callee_map: None,
        }
    }

    /// The metrics of this node.
    pub fn base(&self) -> &CallTreeNodeBase {
        &self.base
    }

    /// The calling node; `None` for the root and for nodes that were folded away.
    pub fn caller(&self) -> Option<NodeIndex> {
        self.caller
    }

    /// The called nodes.
    pub fn callees(&self) -> &[NodeIndex] {
        &self.callees
    }

    /// The samples attributed to this node itself.
    pub fn samples(&self) -> &[SampleIndex] {
        &self.samples
    }
}

impl Deref for CallTreeNode {
    type Target = CallTreeNodeBase;

    fn deref(&self) -> &CallTreeNodeBase {
        &self.base
    }
}

/// Canonical frames by name: every distinct name maps to the first frame seen with it.
#[derive(Default)]
struct FrameNames {
    by_frame: DashMap<FrameIndex, (FrameIndex, Arc<str>), RandomState>,
    by_name: DashMap<Arc<str>, FrameIndex, RandomState>,
}

impl FrameNames {
    fn canonicalize(&self, source: &dyn StackSource, frame: FrameIndex) -> (FrameIndex, Arc<str>) {
        if let Some(known) = self.by_frame.get(&frame) {
            return known.value().clone();
        }
        let name: Arc<str> = source.frame_name(frame, false).into();
        let canonical = *self.by_name.entry(name.clone()).or_insert(frame);
        let entry = (canonical, name);
        self.by_frame.insert(frame, entry.clone());
        entry
    }
}

struct BuildState {
    nodes: Vec<CallTreeNode>,
    samples: usize,
}

impl BuildState {
    fn find_callee(&mut self, caller: NodeIndex, frame: FrameIndex, name: Arc<str>) -> NodeIndex {
        let node = &self.nodes[caller.index()];
        match node.callee_map {
            Some(ref map) => {
                if let Some(&callee) = map.get(&frame) {
                    return callee;
                }
            }
            None => {
                for &callee in &node.callees {
                    if self.nodes[callee.index()].base.id == frame {
                        return callee;
                    }
                }
            }
        }

        assert!(self.nodes.len() < u32::MAX as usize, "call tree node limit reached");
        let callee = NodeIndex(self.nodes.len() as u32);
        self.nodes.push(CallTreeNode::new(name, frame, Some(caller)));

        let nodes = &mut self.nodes;
        let node = &mut nodes[caller.index()];
        node.callees.push(callee);
        match node.callee_map {
            Some(ref mut map) => {
                map.insert(frame, callee);
            }
            None if node.callees.len() > MAX_LINEAR_CALLEES => {
                let callees = node.callees.clone();
                let map = callees
                    .into_iter()
                    .map(|c| (nodes[c.index()].base.id, c))
                    .collect();
                nodes[caller.index()].callee_map = Some(map);
            }
            None => {}
        }
        callee
    }

    fn add_sample(
        &mut self,
        node: NodeIndex,
        sample: &StackSourceSample,
        end_time: f64,
        histograms: &Histograms<'_>,
    ) {
        let leaf = &mut self.nodes[node.index()];
        leaf.base.exclusive_metric += sample.metric;
        leaf.base.exclusive_count += f64::from(sample.count);
        if sample.sample_index.is_valid() {
            leaf.samples.push(sample.sample_index);
        }

        let mut current = Some(node);
        while let Some(index) = current {
            let node = &mut self.nodes[index.index()];
            node.base.add_inclusive_sample(sample, end_time, histograms);
            current = node.caller;
        }
        self.samples += 1;
    }
}

struct Builder<'a> {
    source: &'a dyn StackSource,
    names: &'a FrameNames,
    histograms: Histograms<'a>,
    scaling_policy: ScalingPolicy,
    stack_cache: Box<[AtomicCell<u64>]>,
    state: Mutex<BuildState>,
}

impl<'a> Builder<'a> {
    fn cached_node(&self, stack: CallStackIndex) -> Option<NodeIndex> {
        let entry = self.stack_cache[stack.index() % STACK_CACHE_SIZE].load();
        if entry != EMPTY_CACHE_ENTRY && (entry >> 32) as u32 == stack.0 as u32 {
            Some(NodeIndex(entry as u32))
        } else {
            None
        }
    }

    fn cache_node(&self, stack: CallStackIndex, node: NodeIndex) {
        let entry = (u64::from(stack.0 as u32) << 32) | u64::from(node.0);
        self.stack_cache[stack.index() % STACK_CACHE_SIZE].store(entry);
    }

    fn add(&self, sample: &StackSourceSample) {
        if sample.stack_index == CallStackIndex::DISCARD {
            return;
        }

        // Walk towards the root until a stack whose node is already known.
        let mut pending = Vec::new();
        let mut stack = sample.stack_index;
        let mut node = ROOT;
        while stack.is_valid() {
            if let Some(cached) = self.cached_node(stack) {
                node = cached;
                break;
            }
            let (frame, name) = self
                .names
                .canonicalize(self.source, self.source.frame_index(stack));
            pending.push((stack, frame, name));
            stack = self.source.caller_index(stack);
        }

        let end_time = match self.scaling_policy {
            ScalingPolicy::TimeMetric => sample.time_relative_msec + f64::from(sample.metric.abs()),
            ScalingPolicy::ScaleToData => sample.time_relative_msec,
        };

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for (stack, frame, name) in pending.into_iter().rev() {
            node = state.find_callee(node, frame, name);
            self.cache_node(stack, node);
        }
        state.add_sample(node, sample, end_time, &self.histograms);
    }
}

/// A tree of call chains with the metrics of the samples that ran in them.
///
/// The root is a synthetic node named `ROOT`. Below it, every node stands for one frame reached
/// through one chain of callers. Frames are merged by name, so two frames with equal names in the
/// same position share a node even if the source gave them different indices.
pub struct CallTree {
    options: Options,
    source: Option<Arc<dyn StackSource>>,
    nodes: Vec<CallTreeNode>,
    percentage_basis: f32,
    sample_count: usize,
    names: FrameNames,
    by_id: OnceCell<HashMap<FrameIndex, CallTreeNodeBase, RandomState>>,
}

impl fmt::Debug for CallTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallTree")
            .field("nodes", &self.nodes.len())
            .field("samples", &self.sample_count)
            .field("percentage_basis", &self.percentage_basis)
            .finish()
    }
}

impl Default for CallTree {
    fn default() -> Self {
        CallTree::new(Options::default())
    }
}

impl CallTree {
    /// An empty tree, holding only its root.
    pub fn new(options: Options) -> Self {
        CallTree {
            options,
            source: None,
            nodes: vec![root_node()],
            percentage_basis: 0.0,
            sample_count: 0,
            names: FrameNames::default(),
            by_id: OnceCell::new(),
        }
    }

    /// Builds a tree from every sample of `source`.
    pub fn from_source(source: Arc<dyn StackSource>, options: Options) -> Self {
        let mut tree = CallTree::new(options);
        tree.set_stack_source(source);
        tree
    }

    /// Replaces the contents of the tree with the samples of `source`.
    pub fn set_stack_source(&mut self, source: Arc<dyn StackSource>) {
        self.names = FrameNames::default();
        self.by_id = OnceCell::new();

        let state = {
            let builder = Builder {
                source: &*source,
                names: &self.names,
                histograms: Histograms {
                    time: self.options.time_histogram.as_deref(),
                    scenario: self.options.scenario_histogram.as_deref(),
                },
                scaling_policy: self.options.scaling_policy,
                stack_cache: (0..STACK_CACHE_SIZE)
                    .map(|_| AtomicCell::new(EMPTY_CACHE_ENTRY))
                    .collect(),
                state: Mutex::new(BuildState {
                    nodes: vec![root_node()],
                    samples: 0,
                }),
            };
            if self.options.nthreads <= 1 {
                source.for_each(&mut |sample| builder.add(sample));
            } else {
                source.parallel_for_each(&|sample| builder.add(sample), self.options.nthreads);
            }
            builder
                .state
                .into_inner()
                .unwrap_or_else(PoisonError::into_inner)
        };

        self.nodes = state.nodes;
        for node in &mut self.nodes {
            node.callee_map = None;
        }
        self.sample_count = state.samples;
        self.percentage_basis = self.nodes[ROOT.index()].base.inclusive_metric.abs();
        self.source = Some(source);
        if self.options.sort {
            self.sort();
        }
        info!(
            "built a call tree of {} nodes from {} samples",
            self.nodes.len(),
            self.sample_count
        );
    }

    /// The source the tree was built from.
    pub fn source(&self) -> Option<&Arc<dyn StackSource>> {
        self.source.as_ref()
    }

    /// The options the tree was built with.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The synthetic root.
    ///
    /// # Panics
    ///
    /// Panics after [`CallTree::free_memory`].
    pub fn root(&self) -> NodeRef<'_> {
        self.node(ROOT)
    }

    /// A handle to `index`.
    pub fn node(&self, index: NodeIndex) -> NodeRef<'_> {
        assert!(index.index() < self.nodes.len(), "{:?} is not a node of this tree", index);
        NodeRef { tree: self, index }
    }

    /// Every node, indexed by [`NodeIndex`]. Nodes folded away stay in place but are
    /// unreachable from the root.
    pub fn nodes(&self) -> &[CallTreeNode] {
        &self.nodes
    }

    /// Number of nodes in the arena.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of samples the tree was built from.
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// The metric that stands for 100%: the magnitude of the root's inclusive metric once the
    /// tree is built.
    pub fn percentage_basis(&self) -> f32 {
        self.percentage_basis
    }

    /// Overrides the metric that stands for 100%.
    pub fn set_percentage_basis(&mut self, basis: f32) {
        self.percentage_basis = basis;
    }

    /// The inclusive metric of `node` as a percentage of the basis.
    pub fn inclusive_metric_percent(&self, node: NodeIndex) -> f32 {
        self.percent(self.nodes[node.index()].base.inclusive_metric)
    }

    fn percent(&self, metric: f32) -> f32 {
        if self.percentage_basis == 0.0 {
            0.0
        } else {
            metric * 100.0 / self.percentage_basis
        }
    }

    /// The canonical frame of `name`, if any node carries it.
    pub fn frame_id(&self, name: &str) -> Option<FrameIndex> {
        self.names.by_name.get(name).map(|id| *id)
    }

    /// Sorts callees by descending inclusive metric magnitude, then ascending first time.
    pub fn sort(&mut self) {
        self.sort_by(|a, b| {
            b.inclusive_metric
                .abs()
                .total_cmp(&a.inclusive_metric.abs())
                .then_with(|| {
                    a.first_time_relative_msec()
                        .total_cmp(&b.first_time_relative_msec())
                })
        });
    }

    /// Sorts the callees of every node with `compare`.
    pub fn sort_by<F>(&mut self, mut compare: F)
    where
        F: FnMut(&CallTreeNodeBase, &CallTreeNodeBase) -> Ordering,
    {
        for i in 0..self.nodes.len() {
            let mut callees = mem::take(&mut self.nodes[i].callees);
            let nodes = &self.nodes;
            callees.sort_by(|a, b| compare(&nodes[a.index()].base, &nodes[b.index()].base));
            self.nodes[i].callees = callees;
        }
    }

    /// Folds every node whose inclusive metric magnitude is below `min_inclusive_metric` into
    /// its caller, and returns how many nodes were removed.
    ///
    /// With `use_whole_trace_metric`, a node is measured by the inclusive metric of its frame
    /// over the whole tree (see [`CallTree::by_id`]) rather than by its own. Nodes of
    /// [`FrameIndex::BROKEN`] are never folded. A folded node's inclusive totals become
    /// exclusive (and exclusive folded) totals of its caller, and the samples of its whole
    /// subtree move to the caller.
    pub fn fold_nodes_under(&mut self, min_inclusive_metric: f32, use_whole_trace_metric: bool) -> usize {
        let whole_trace: Option<HashMap<FrameIndex, f32, RandomState>> = if use_whole_trace_metric {
            Some(
                self.by_id_map()
                    .iter()
                    .map(|(&id, base)| (id, base.inclusive_metric.abs()))
                    .collect(),
            )
        } else {
            None
        };

        let mut removed = 0;
        let mut work = vec![ROOT];
        while let Some(caller) = work.pop() {
            let callees = mem::take(&mut self.nodes[caller.index()].callees);
            let mut kept = Vec::with_capacity(callees.len());
            for callee in callees {
                let base = &self.nodes[callee.index()].base;
                let metric = match whole_trace {
                    Some(ref by_id) => by_id.get(&base.id).copied().unwrap_or(0.0),
                    None => base.inclusive_metric.abs(),
                };
                if base.id != FrameIndex::BROKEN && metric < min_inclusive_metric {
                    removed += self.fold_into(caller, callee);
                } else {
                    kept.push(callee);
                    work.push(callee);
                }
            }
            self.nodes[caller.index()].callees = kept;
        }

        self.by_id = OnceCell::new();
        debug!(
            "folded {} nodes with inclusive metric under {}",
            removed, min_inclusive_metric
        );
        removed
    }

    /// Folds every node below `percent` of the percentage basis; see
    /// [`CallTree::fold_nodes_under`].
    pub fn fold_nodes_under_percent(&mut self, percent: f32) -> usize {
        let threshold = percent / 100.0 * self.percentage_basis;
        self.fold_nodes_under(threshold, false)
    }

    // Detaches `node` from `caller`, moving its totals and all samples of its subtree up.
    fn fold_into(&mut self, caller: NodeIndex, node: NodeIndex) -> usize {
        let folded = &self.nodes[node.index()].base;
        let (metric, count) = (folded.inclusive_metric, folded.inclusive_count);

        let mut samples = Vec::new();
        let mut removed = 0;
        let mut work = vec![node];
        while let Some(index) = work.pop() {
            let dead = &mut self.nodes[index.index()];
            samples.append(&mut dead.samples);
            work.append(&mut dead.callees);
            removed += 1;
        }
        self.nodes[node.index()].caller = None;

        let caller = &mut self.nodes[caller.index()];
        caller.base.exclusive_metric += metric;
        caller.base.exclusive_count += count;
        caller.base.exclusive_folded_metric += metric;
        caller.base.exclusive_folded_count += count;
        caller.samples.append(&mut samples);
        removed
    }

    /// The totals of every frame across the whole tree, largest exclusive metric first.
    pub fn sum_by_id(&self) -> Vec<&CallTreeNodeBase> {
        let mut sums: Vec<&CallTreeNodeBase> = self.by_id_map().values().collect();
        sums.sort_by(|a, b| {
            b.exclusive_metric
                .abs()
                .total_cmp(&a.exclusive_metric.abs())
                .then_with(|| a.name.cmp(&b.name))
        });
        sums
    }

    /// The totals of frame `id` across the whole tree.
    ///
    /// Exclusive totals add up over every node of the frame. Inclusive totals count a node only
    /// if no caller of it is the same frame, so recursion is not counted twice.
    pub fn by_id(&self, id: FrameIndex) -> Option<&CallTreeNodeBase> {
        self.by_id_map().get(&id)
    }

    fn by_id_map(&self) -> &HashMap<FrameIndex, CallTreeNodeBase, RandomState> {
        self.by_id.get_or_init(|| self.compute_by_id())
    }

    fn compute_by_id(&self) -> HashMap<FrameIndex, CallTreeNodeBase, RandomState> {
        enum Visit {
            Enter(NodeIndex),
            Leave(FrameIndex),
        }

        let mut by_id: HashMap<FrameIndex, CallTreeNodeBase, RandomState> = HashMap::default();
        let mut on_stack: HashMap<FrameIndex, u32, RandomState> = HashMap::default();
        let mut work: Vec<Visit> = self.nodes[ROOT.index()]
            .callees
            .iter()
            .rev()
            .map(|&c| Visit::Enter(c))
            .collect();
        while let Some(visit) = work.pop() {
            match visit {
                Visit::Enter(index) => {
                    let node = &self.nodes[index.index()];
                    let id = node.base.id;
                    let depth = on_stack.entry(id).or_insert(0);
                    let sum = by_id
                        .entry(id)
                        .or_insert_with(|| CallTreeNodeBase::new(node.base.name.clone(), id));
                    if *depth == 0 {
                        sum.add_inclusive(&node.base, 1.0);
                    }
                    sum.add_exclusive(&node.base, 1.0);
                    *depth += 1;
                    work.push(Visit::Leave(id));
                    work.extend(node.callees.iter().rev().map(|&c| Visit::Enter(c)));
                }
                Visit::Leave(id) => {
                    if let Some(depth) = on_stack.get_mut(&id) {
                        *depth -= 1;
                    }
                }
            }
        }
        by_id
    }

    /// Follows callee names from the root, for example `["main", "parse"]`.
    pub fn find_node_by_path<I, S>(&self, path: I) -> Option<NodeIndex>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut node = ROOT;
        for name in path {
            node = *self.nodes[node.index()]
                .callees
                .iter()
                .find(|c| &*self.nodes[c.index()].base.name == name.as_ref())?;
        }
        Some(node)
    }

    /// Every reachable node of frame `id`, in depth-first order.
    pub fn nodes_with_id(&self, id: FrameIndex) -> Vec<NodeIndex> {
        let mut found = Vec::new();
        self.walk(ROOT, |index, node| {
            if node.base.id == id {
                found.push(index);
            }
        });
        found
    }

    /// The samples of `node`, and with `exclusive_only` unset also those of every node below.
    pub fn samples_under(&self, node: NodeIndex, exclusive_only: bool) -> Vec<SampleIndex> {
        if exclusive_only {
            return self.nodes[node.index()].samples.clone();
        }
        let mut samples = Vec::new();
        self.walk(node, |_, node| samples.extend_from_slice(&node.samples));
        samples
    }

    /// Visits `from` and everything below it, callers before callees.
    pub(crate) fn walk<F>(&self, from: NodeIndex, mut visit: F)
    where
        F: FnMut(NodeIndex, &CallTreeNode),
    {
        let mut work = vec![from];
        while let Some(index) = work.pop() {
            let node = &self.nodes[index.index()];
            visit(index, node);
            work.extend(node.callees.iter().rev());
        }
    }

    /// The time histogram of `node` as a display string, if the tree records one.
    pub fn time_histogram_string(&self, node: NodeIndex) -> Option<String> {
        let controller = self.options.time_histogram.as_ref()?;
        let histogram = self.nodes[node.index()].base.inclusive_metric_by_time.as_ref()?;
        let scale = controller.display_scale(self.percentage_basis);
        Some(controller.display_string(histogram, scale))
    }

    /// The scenario histogram of `node` as a display string, if the tree records one.
    pub fn scenario_histogram_string(&self, node: NodeIndex) -> Option<String> {
        let controller = self.options.scenario_histogram.as_ref()?;
        let histogram = self.nodes[node.index()]
            .base
            .inclusive_metric_by_scenario
            .as_ref()?;
        let scale = controller.display_scale(self.percentage_basis);
        Some(controller.display_string(histogram, scale))
    }

    /// Drops every node and cached sum. The tree is unusable afterwards.
    pub fn free_memory(&mut self) {
        self.nodes = Vec::new();
        self.by_id = OnceCell::new();
        self.names = FrameNames::default();
    }
}

fn root_node() -> CallTreeNode {
    CallTreeNode::new(Arc::from("ROOT"), FrameIndex::ROOT, None)
}

/// A borrowed handle to one node of a [`CallTree`].
///
/// Dereferences to the node's [`CallTreeNodeBase`].
#[derive(Clone, Copy)]
pub struct NodeRef<'a> {
    tree: &'a CallTree,
    index: NodeIndex,
}

impl<'a> NodeRef<'a> {
    /// The index of this node.
    pub fn index(self) -> NodeIndex {
        self.index
    }

    /// The tree the node belongs to.
    pub fn tree(self) -> &'a CallTree {
        self.tree
    }

    /// The node itself.
    pub fn node(self) -> &'a CallTreeNode {
        &self.tree.nodes[self.index.index()]
    }

    /// The node's metrics, borrowed for as long as the tree.
    pub fn base(self) -> &'a CallTreeNodeBase {
        &self.node().base
    }

    /// The calling node.
    pub fn caller(self) -> Option<NodeRef<'a>> {
        let tree = self.tree;
        self.node().caller.map(|index| NodeRef { tree, index })
    }

    /// The called nodes, in sorted order.
    pub fn callees(self) -> impl Iterator<Item = NodeRef<'a>> + 'a {
        let tree = self.tree;
        self.node()
            .callees
            .iter()
            .map(move |&index| NodeRef { tree, index })
    }

    /// The callee named `name`.
    pub fn callee(self, name: &str) -> Option<NodeRef<'a>> {
        self.callees().find(|c| c.name() == name)
    }

    /// The samples attributed to this node itself.
    pub fn samples(self) -> &'a [SampleIndex] {
        &self.node().samples
    }

    /// The inclusive metric as a percentage of the tree's basis.
    pub fn inclusive_metric_percent(self) -> f32 {
        self.tree.inclusive_metric_percent(self.index)
    }

    /// The exclusive metric as a percentage of the tree's basis.
    pub fn exclusive_metric_percent(self) -> f32 {
        self.tree.percent(self.base().exclusive_metric)
    }

    /// See [`CallTree::time_histogram_string`].
    pub fn time_histogram_string(self) -> Option<String> {
        self.tree.time_histogram_string(self.index)
    }

    /// See [`CallTree::scenario_histogram_string`].
    pub fn scenario_histogram_string(self) -> Option<String> {
        self.tree.scenario_histogram_string(self.index)
    }
}

impl Deref for NodeRef<'_> {
    type Target = CallTreeNodeBase;

    fn deref(&self) -> &CallTreeNodeBase {
        &self.tree.nodes[self.index.index()].base
    }
}

impl fmt::Debug for NodeRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRef")
            .field("index", &self.index)
            .field("name", &self.name())
            .field("inclusive_metric", &self.inclusive_metric())
            .finish()
    }
}
