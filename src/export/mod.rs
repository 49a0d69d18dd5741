//! Writers that turn stack sources and call trees into formats other tools can read.
//!
//! The JSON writers take any [`StackSource`](crate::stacks::StackSource), so a filtered or
//! aggregated source exports exactly what its call tree would show.

/// The Chromium trace event format, as read by `chrome://tracing` and Perfetto.
pub mod chromium;

/// The speedscope file format.
pub mod speedscope;

/// Plain text reports for terminals.
pub mod text;
