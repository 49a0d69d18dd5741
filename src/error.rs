use std::io;

use thiserror::Error;

/// Errors produced while configuring sources, filters and maps.
///
/// Structural problems (an index outside of a source's declared limit, interning into a frozen
/// table) are not represented here; those are caller bugs and panic.
#[derive(Error, Debug)]
pub enum Error {
    /// An [`IndexMap`](crate::stacks::index_map::IndexMap) needs at least one source.
    #[error("an index map needs at least one source")]
    EmptyIndexMap,

    /// Every source of an [`IndexMap`](crate::stacks::index_map::IndexMap) needs a positive count.
    #[error("source {index} of an index map has non-positive count {count}")]
    NonPositiveCount {
        /// Position of the offending source.
        index: usize,
        /// The count that was given for it.
        count: i64,
    },

    /// An aggregate source was given nothing to aggregate.
    #[error("an aggregate source needs at least one sub-source")]
    NoSources,

    /// A filter pattern did not translate into a valid regular expression.
    #[error("invalid pattern `{pattern}`: {error}")]
    Pattern {
        /// The pattern as the user wrote it.
        pattern: String,
        /// Why the translated expression was rejected.
        #[source]
        error: regex::Error,
    },

    /// A group pattern lacked a `->` or `=>` separator, or had an empty side.
    #[error("malformed group pattern `{0}`: expected `pattern->group` or `pattern=>group`")]
    GroupPattern(String),

    /// Include patterns are tracked in a 64-bit set.
    #[error("at most 64 include patterns are supported, got {0}")]
    TooManyIncludePatterns(usize),

    /// Reading or writing failed.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Serializing an export failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
