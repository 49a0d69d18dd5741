#![allow(dead_code)]

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use stackfold::call_tree::{CallTree, Options};
use stackfold::stacks::{InternStackSource, NodeIndex};

pub fn folded(path: &str) -> InternStackSource {
    let file = File::open(path).unwrap();
    InternStackSource::from_folded(BufReader::new(file)).unwrap()
}

pub fn source(stacks: &[(&str, f32)]) -> InternStackSource {
    let mut source = InternStackSource::new();
    let mut time = 0.0;
    for &(stack, metric) in stacks {
        source.add_stack(stack.split(';'), metric, time);
        time += f64::from(metric.abs());
    }
    source
}

pub fn serial() -> Options {
    Options {
        nthreads: 1,
        ..Default::default()
    }
}

pub fn tree(stacks: &[(&str, f32)]) -> CallTree {
    CallTree::from_source(Arc::new(source(stacks)), serial())
}

/// Random stacks over a small alphabet, so that frames repeat and recurse.
pub fn random_stacks(seed: u64, n: usize) -> Vec<(String, f32)> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let depth = rng.gen_range(1..8);
            let frames: Vec<String> = (0..depth)
                .map(|_| format!("f{}", rng.gen_range(0..6)))
                .collect();
            (frames.join(";"), rng.gen_range(1..10) as f32)
        })
        .collect()
}

/// Checks that every reachable node's inclusive totals are its exclusive totals plus those of
/// its callees.
pub fn assert_consistent(tree: &CallTree) {
    let mut work = vec![tree.root().index()];
    while let Some(index) = work.pop() {
        let node = tree.node(index);
        let callees: Vec<NodeIndex> = node.callees().map(|c| c.index()).collect();
        let metric: f32 = node.exclusive_metric()
            + callees
                .iter()
                .map(|&c| tree.node(c).inclusive_metric())
                .sum::<f32>();
        let tolerance = 1e-4 * node.inclusive_metric().abs().max(1.0);
        assert!(
            (metric - node.inclusive_metric()).abs() <= tolerance,
            "{}: inclusive metric {} but exclusive plus callees is {}",
            node.name(),
            node.inclusive_metric(),
            metric
        );
        let count: f64 = node.exclusive_count()
            + callees
                .iter()
                .map(|&c| tree.node(c).inclusive_count())
                .sum::<f64>();
        assert_eq!(count, node.inclusive_count(), "{}", node.name());
        for &c in &callees {
            assert_eq!(tree.node(c).caller().map(|p| p.index()), Some(index));
        }
        work.extend(callees);
    }
}
