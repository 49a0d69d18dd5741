use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{ArgAction, Parser, ValueEnum};
use env_logger::Env;
use stackfold::call_tree::caller_callee::CallerCalleeNode;
use stackfold::call_tree::{self, CallTree};
use stackfold::export::{self, text};
use stackfold::filter::{self, FilterStackSource};
use stackfold::histogram::{HistogramController, ScenarioHistogramController, TimeHistogramController};
use stackfold::stacks::{AggregateStackSource, InternStackSource, ScalingPolicy, StackSource};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    /// Indented call tree report
    Tree,
    /// Chromium trace event JSON
    Chromium,
    /// speedscope JSON
    Speedscope,
}

#[derive(Debug, Parser)]
#[clap(
    name = "stackfold",
    about,
    after_help = "\
Every input file becomes one scenario when more than one is given. Pattern lists are separated by \
`;`. In patterns, `*` matches anything, `%` matches a word, `^` anchors at the start of a frame \
name and `{...}` captures for use as `$1` in group names."
)]
struct Opt {
    // ************* //
    // *** FLAGS *** //
    // ************* //
    /// Fold a frame into its caller when both are the same frame
    #[clap(long = "fold-recursion")]
    fold_recursion: bool,

    /// Leave histograms out of the tree report
    #[clap(long = "no-histograms")]
    no_histograms: bool,

    /// Silence all log output
    #[clap(short = 'q', long = "quiet")]
    quiet: bool,

    /// Verbose logging mode (-v, -vv, -vvv)
    #[clap(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    // *************** //
    // *** OPTIONS *** //
    // *************** //
    /// Keep only samples with a frame matching each of these patterns
    #[clap(long = "include", value_name = "PATTERNS", default_value = "")]
    include: String,

    /// Drop samples with a frame matching any of these patterns
    #[clap(long = "exclude", value_name = "PATTERNS", default_value = "")]
    exclude: String,

    /// Fold frames matching any of these patterns into their callers
    #[clap(long = "fold", value_name = "PATTERNS", default_value = "")]
    fold: String,

    /// Rename matching frames to groups (`pattern->group` or `pattern=>group`)
    #[clap(long = "group", value_name = "PATTERNS", default_value = "")]
    group: String,

    /// Drop samples before this time (milliseconds)
    #[clap(long = "start", value_name = "MSEC")]
    start: Option<f64>,

    /// Drop samples after this time (milliseconds)
    #[clap(long = "end", value_name = "MSEC")]
    end: Option<f64>,

    /// Keep only these scenarios (input positions, starting at 0)
    #[clap(long = "scenarios", value_name = "LIST", value_delimiter = ',')]
    scenarios: Option<Vec<i32>>,

    /// Treat sample metrics as durations in milliseconds
    #[clap(long = "time-metric")]
    time_metric: bool,

    /// Fold tree nodes below this percentage of the total into their callers
    #[clap(long = "min-percent", value_name = "PERCENT", default_value = "0")]
    min_percent: f32,

    /// Show at most this many levels of the tree
    #[clap(long = "max-depth", value_name = "LEVELS")]
    max_depth: Option<usize>,

    /// Number of time buckets in the tree's time histograms (0 to disable)
    #[clap(long = "time-buckets", value_name = "N", default_value = "32")]
    time_buckets: usize,

    /// Summarize the callers and callees of this frame instead of printing the tree
    #[clap(long = "caller-callee", value_name = "FRAME")]
    caller_callee: Option<String>,

    /// Output format
    #[clap(long = "format", value_enum, default_value = "tree")]
    format: Format,

    /// Number of threads used to build the tree [default: 1.25 times the number of logical cores]
    #[clap(long = "nthreads", value_name = "N")]
    nthreads: Option<usize>,

    // ************ //
    // *** ARGS *** //
    // ************ //
    /// Folded stack files, or STDIN if not specified
    #[clap(value_name = "PATH")]
    infiles: Vec<PathBuf>,
}

impl Opt {
    fn scaling_policy(&self) -> ScalingPolicy {
        if self.time_metric {
            ScalingPolicy::TimeMetric
        } else {
            ScalingPolicy::ScaleToData
        }
    }

    fn filter_options(&self) -> filter::Options {
        filter::Options {
            start_time_relative_msec: self.start.unwrap_or(f64::NEG_INFINITY),
            end_time_relative_msec: self.end.unwrap_or(f64::INFINITY),
            include_patterns: self.include.clone(),
            exclude_patterns: self.exclude.clone(),
            fold_patterns: self.fold.clone(),
            group_patterns: self.group.clone(),
            fold_recursion: self.fold_recursion,
            scenarios: self.scenarios.clone(),
            scaling_policy: self.scaling_policy(),
            min_inclusive_time_percent: self.min_percent,
        }
    }
}

fn read_folded(path: &Path) -> io::Result<InternStackSource> {
    let file = File::open(path)?;
    InternStackSource::from_folded(BufReader::with_capacity(128 * 1024, file))
}

fn scenario_name(path: &Path) -> String {
    path.file_stem()
        .unwrap_or(path.as_os_str())
        .to_string_lossy()
        .into_owned()
}

fn main() -> stackfold::Result<()> {
    let opt = Opt::parse();

    // Initialize logger
    if !opt.quiet {
        env_logger::Builder::from_env(Env::default().default_filter_or(match opt.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }))
        .format_timestamp(None)
        .init();
    }

    let mut scenario_names = Vec::new();
    let source: Arc<dyn StackSource> = match &opt.infiles[..] {
        [] => {
            let stdin = io::stdin();
            let reader = BufReader::with_capacity(128 * 1024, stdin.lock());
            Arc::new(InternStackSource::from_folded(reader)?)
        }
        [path] => Arc::new(read_folded(path)?),
        paths => {
            let mut sources: Vec<(String, Arc<dyn StackSource>)> = Vec::with_capacity(paths.len());
            for path in paths {
                let source: Arc<dyn StackSource> = Arc::new(read_folded(path)?);
                sources.push((scenario_name(path), source));
            }
            scenario_names = sources.iter().map(|(name, _)| name.clone()).collect();
            Arc::new(AggregateStackSource::new(sources)?)
        }
    };
    let filter_options = opt.filter_options();
    let source: Arc<dyn StackSource> = Arc::new(FilterStackSource::new(source, &filter_options)?);

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    match opt.format {
        Format::Chromium => export::chromium::write(&*source, &mut out)?,
        Format::Speedscope => {
            let name = match &opt.infiles[..] {
                [path] => scenario_name(path),
                _ => "stackfold".to_string(),
            };
            export::speedscope::write(&*source, &name, &mut out)?
        }
        Format::Tree => {
            let time_histogram = (opt.time_buckets > 0).then(|| {
                Arc::new(TimeHistogramController::new(
                    0.0,
                    source.sample_time_relative_msec_limit(),
                    opt.time_buckets,
                    opt.scaling_policy(),
                )) as Arc<dyn HistogramController>
            });
            let scenario_histogram = (scenario_names.len() > 1).then(|| {
                Arc::new(
                    ScenarioHistogramController::new(scenario_names.len(), scenario_names.len())
                        .with_names(scenario_names.clone()),
                ) as Arc<dyn HistogramController>
            });
            let mut tree = CallTree::from_source(
                source,
                call_tree::Options {
                    scaling_policy: opt.scaling_policy(),
                    nthreads: opt.nthreads.unwrap_or(*stackfold::stacks::DEFAULT_NTHREADS),
                    time_histogram,
                    scenario_histogram,
                    ..Default::default()
                },
            );
            if filter_options.min_inclusive_time_percent > 0.0 {
                tree.fold_nodes_under_percent(filter_options.min_inclusive_time_percent);
            }

            match opt.caller_callee {
                Some(ref name) => {
                    let node = CallerCalleeNode::new(name, &tree);
                    text::write_caller_callee(&node, tree.percentage_basis(), &mut out)?
                }
                None => text::write_tree(
                    &tree,
                    &text::Options {
                        max_depth: opt.max_depth,
                        histograms: !opt.no_histograms,
                        ..Default::default()
                    },
                    &mut out,
                )?,
            }
        }
    }
    out.flush()?;
    Ok(())
}
