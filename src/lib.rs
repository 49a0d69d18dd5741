//! Stackfold turns a flat stream of sampled call stacks into call trees you can fold, filter and
//! slice, in the spirit of the stack views of profilers like [PerfView].
//!
//! A profile enters the crate as a [`StackSource`](stacks::StackSource): every sample names a
//! stack, every stack names its innermost frame and the stack of its caller. Sources compose.
//! [`AggregateStackSource`](stacks::AggregateStackSource) merges several profiles into one, each
//! under a synthetic scenario frame, and [`FilterStackSource`](filter::FilterStackSource) rewrites
//! stacks on the fly to drop, fold or group frames by name and to cut samples to a time window.
//!
//! The [`CallTree`](call_tree::CallTree) built from a source carries inclusive and exclusive
//! metrics, counts, first and last times, and optionally histograms over time and scenarios for
//! every node. From there, [`caller_callee`](call_tree::caller_callee) summarizes who calls a frame
//! and what it calls, and [`aggregate`](call_tree::aggregate) merges every occurrence of a frame
//! into one caller or callee tree. The [`export`] module writes sources as Chromium traces or
//! speedscope files and trees as text reports.
//!
//! # Command-line use
//!
//! The `stackfold` binary reads folded stack files, the format produced by the `stackcollapse-*`
//! family of tools:
//!
//! ```text
//! main;parse;lex 12
//! main;run 30
//! ```
//!
//! and prints the resulting call tree:
//!
//! ```console
//! $ stackfold --exclude 'lex' --min-percent 1 profile.folded
//! ```
//!
//! Given several files, each becomes one scenario of an aggregated profile, named after the file.
//!
//! # Programmatic access
//!
//! ```
//! use std::sync::Arc;
//! use stackfold::call_tree::{CallTree, Options};
//! use stackfold::stacks::InternStackSource;
//!
//! let mut source = InternStackSource::new();
//! source.add_stack(["main", "parse"], 2.0, 0.0);
//! source.add_stack(["main", "run"], 1.0, 2.0);
//!
//! let tree = CallTree::from_source(Arc::new(source), Options::default());
//! let main = tree.root().callee("main").unwrap();
//! assert_eq!(main.inclusive_metric(), 3.0);
//! assert_eq!(main.callee("parse").unwrap().exclusive_metric(), 2.0);
//! ```
//!
//!   [PerfView]: https://github.com/microsoft/perfview

#![warn(missing_docs)]

#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;

#[macro_use]
extern crate log;

/// Call trees and the views derived from them.
pub mod call_tree;

/// Writers for external formats.
pub mod export;

/// Stack sources that drop, fold and group frames by name.
///
/// See [`filter::pattern`] for the pattern syntax.
pub mod filter;

/// Per-node metric histograms over time and scenarios.
pub mod histogram;

/// Dense interning tables.
pub mod intern;

/// The [`StackSource`](stacks::StackSource) abstraction and its basic implementations.
pub mod stacks;

mod error;

pub use crate::error::{Error, Result};
