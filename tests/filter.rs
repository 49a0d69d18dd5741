mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;
use stackfold::call_tree::CallTree;
use stackfold::filter::{FilterStackSource, Options};
use stackfold::stacks::{folded_stack, CallStackIndex, StackSource};
use stackfold::Error;

fn filtered(stacks: &[(&str, f32)], options: &Options) -> FilterStackSource {
    FilterStackSource::new(Arc::new(common::source(stacks)), options).unwrap()
}

fn filtered_tree(stacks: &[(&str, f32)], options: &Options) -> CallTree {
    CallTree::from_source(Arc::new(filtered(stacks, options)), common::serial())
}

// `for_each` of a filter only hands out the samples it keeps.
fn kept_stacks(source: &FilterStackSource) -> Vec<String> {
    let mut stacks = Vec::new();
    source.for_each(&mut |sample| {
        assert_ne!(sample.stack_index, CallStackIndex::DISCARD);
        stacks.push(folded_stack(source, sample.stack_index));
    });
    stacks
}

#[test]
fn filter_exclude_drops_whole_samples() {
    let tree = filtered_tree(
        &[("A;B", 1.0), ("A;C", 1.0), ("A;B", 1.0)],
        &Options {
            exclude_patterns: "C".to_string(),
            ..Default::default()
        },
    );
    let a = tree.root().callee("A").unwrap();
    assert_eq!(a.inclusive_metric(), 2.0);
    let names: Vec<&str> = a.callees().map(|c| c.base().name()).collect();
    assert_eq!(names, vec!["B"]);
    common::assert_consistent(&tree);
}

#[test]
fn filter_folds_and_groups() {
    let stacks = [
        ("main;ntdll!Wait;ntdll!Spin", 1.0),
        ("main;kernel32!Read;ntdll!Io", 2.0),
        ("main;helper;work", 4.0),
    ];
    let source = filtered(
        &stacks,
        &Options {
            group_patterns: "{%}!->module $1".to_string(),
            fold_patterns: "helper".to_string(),
            ..Default::default()
        },
    );
    assert_eq!(
        kept_stacks(&source),
        vec![
            "main;module ntdll".to_string(),
            "main;module kernel32;module ntdll".to_string(),
            "main;work".to_string(),
        ]
    );
}

#[test]
fn filter_include_requires_every_pattern() {
    let stacks = [("main;a;b", 1.0), ("main;a", 1.0), ("main;b", 1.0)];
    let source = filtered(
        &stacks,
        &Options {
            include_patterns: "^a;^b".to_string(),
            ..Default::default()
        },
    );
    assert_eq!(kept_stacks(&source), vec!["main;a;b".to_string()]);
}

#[test]
fn filter_keeps_every_sample_without_rules() {
    let stacks = common::random_stacks(7, 200);
    let stacks: Vec<(&str, f32)> = stacks.iter().map(|(s, m)| (s.as_str(), *m)).collect();
    let source = filtered(&stacks, &Options::default());
    let expected: Vec<String> = stacks.iter().map(|(s, _)| s.to_string()).collect();
    assert_eq!(kept_stacks(&source), expected);

    let plain = common::tree(&stacks);
    let tree = CallTree::from_source(Arc::new(source), common::serial());
    assert_eq!(tree.node_count(), plain.node_count());
    assert_eq!(tree.root().inclusive_metric(), plain.root().inclusive_metric());
}

#[test]
fn filter_time_window() {
    // Samples are laid end to end: [0, 1), [1, 3), [3, 7).
    let stacks = [("a", 1.0), ("b", 2.0), ("c", 4.0)];
    let tree = filtered_tree(
        &stacks,
        &Options {
            start_time_relative_msec: 1.0,
            end_time_relative_msec: 2.0,
            ..Default::default()
        },
    );
    let names: Vec<&str> = tree.root().callees().map(|c| c.base().name()).collect();
    assert_eq!(names, vec!["b"]);
}

#[test]
fn filter_rejects_bad_patterns_up_front() {
    let source: Arc<dyn StackSource> = Arc::new(common::source(&[("a", 1.0)]));
    let err = FilterStackSource::new(
        source.clone(),
        &Options {
            exclude_patterns: "x{".to_string(),
            ..Default::default()
        },
    )
    .err()
    .expect("a broken pattern was accepted");
    assert!(matches!(err, Error::Pattern { ref pattern, .. } if pattern == "x{"));

    let err = FilterStackSource::new(
        source,
        &Options {
            group_patterns: "no arrow here".to_string(),
            ..Default::default()
        },
    )
    .err()
    .expect("a group pattern without an arrow was accepted");
    assert!(matches!(err, Error::GroupPattern(_)));
}
