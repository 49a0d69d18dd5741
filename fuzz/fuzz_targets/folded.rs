#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use stackfold::call_tree::{CallTree, Options};
use stackfold::stacks::InternStackSource;

fuzz_target!(|data: &[u8]| {
    if let Ok(source) = InternStackSource::from_folded(data) {
        let mut tree = CallTree::from_source(
            Arc::new(source),
            Options {
                nthreads: 1,
                ..Default::default()
            },
        );
        tree.fold_nodes_under_percent(1.0);
    }
});
