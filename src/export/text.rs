use std::io;

use num_format::{Buffer, Locale};

use crate::call_tree::caller_callee::CallerCalleeNode;
use crate::call_tree::{CallTree, CallTreeNodeBase};
use crate::stacks::NodeIndex;

/// Configure the text report.
#[derive(Clone, Debug, PartialEq)]
pub struct Options {
    /// Leave out nodes whose inclusive metric is below this percentage of the tree's basis.
    ///
    /// Default is `0.0`, which shows every node.
    pub min_percent: f32,

    /// Stop descending below this many levels under the root.
    ///
    /// Default is `None`.
    pub max_depth: Option<usize>,

    /// Append the time and scenario histograms of every node, if the tree records them.
    ///
    /// Default is `true`.
    pub histograms: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            min_percent: 0.0,
            max_depth: None,
            histograms: true,
        }
    }
}

const HEADER: &str = "   Inc%          Inc    Exc%          Exc  Name";

/// Writes `tree` as an indented report, one node per line, callees in the tree's order.
///
/// ```text
///    Inc%          Inc    Exc%          Exc  Name
///   100.0        3,000     0.0            0  ROOT
///   100.0        3,000     0.0            0  + main
///    66.7        2,000    66.7        2,000  |  + parse
/// ```
pub fn write_tree<W>(tree: &CallTree, options: &Options, mut writer: W) -> io::Result<()>
where
    W: io::Write,
{
    let mut buffer = Buffer::default();
    writeln!(writer, "{}", HEADER)?;

    let mut work: Vec<(NodeIndex, usize)> = vec![(tree.root().index(), 0)];
    while let Some((index, depth)) = work.pop() {
        let node = tree.node(index);
        write_metrics(
            &mut writer,
            &mut buffer,
            node.inclusive_metric_percent(),
            node.base(),
            node.exclusive_metric_percent(),
        )?;
        if depth > 0 {
            write!(writer, "{}+ ", "|  ".repeat(depth - 1))?;
        }
        write!(writer, "{}", node.name())?;
        if options.histograms {
            if let Some(histogram) = node.time_histogram_string() {
                write!(writer, "  [{}]", histogram)?;
            }
            if let Some(histogram) = node.scenario_histogram_string() {
                write!(writer, "  [{}]", histogram)?;
            }
        }
        writeln!(writer)?;

        if options.max_depth.map_or(false, |max| depth >= max) {
            continue;
        }
        let callees: Vec<_> = node
            .callees()
            .filter(|c| c.inclusive_metric_percent().abs() >= options.min_percent)
            .collect();
        work.extend(callees.into_iter().rev().map(|c| (c.index(), depth + 1)));
    }
    Ok(())
}

/// Writes the callers and callees of one frame, with percentages of `percentage_basis`.
pub fn write_caller_callee<W>(
    node: &CallerCalleeNode,
    percentage_basis: f32,
    mut writer: W,
) -> io::Result<()>
where
    W: io::Write,
{
    let mut buffer = Buffer::default();
    writeln!(writer, "{}", HEADER)?;
    for (title, entries) in [
        ("Callers", node.callers()),
        ("Focus", std::slice::from_ref(node.focus())),
        ("Callees", node.callees()),
    ] {
        writeln!(writer, "{}:", title)?;
        for entry in entries {
            write_metrics(
                &mut writer,
                &mut buffer,
                percent(entry.inclusive_metric(), percentage_basis),
                entry,
                percent(entry.exclusive_metric(), percentage_basis),
            )?;
            writeln!(writer, "{}", entry.name())?;
        }
    }
    Ok(())
}

fn percent(metric: f32, basis: f32) -> f32 {
    if basis == 0.0 {
        0.0
    } else {
        metric * 100.0 / basis
    }
}

fn write_metrics<W>(
    writer: &mut W,
    buffer: &mut Buffer,
    inclusive_percent: f32,
    base: &CallTreeNodeBase,
    exclusive_percent: f32,
) -> io::Result<()>
where
    W: io::Write,
{
    write!(writer, "{:>7.1}  ", inclusive_percent)?;
    write!(writer, "{:>11}  ", format_metric(buffer, base.inclusive_metric()))?;
    write!(writer, "{:>6.1}  ", exclusive_percent)?;
    write!(writer, "{:>11}  ", format_metric(buffer, base.exclusive_metric()))
}

// Whole metrics get thousands separators; anything else keeps two decimals.
fn format_metric(buffer: &mut Buffer, metric: f32) -> String {
    if metric.fract() == 0.0 && metric.abs() < 1e15 {
        buffer.write_formatted(&(metric as i64), &Locale::en);
        buffer.as_str().to_string()
    } else {
        format!("{:.2}", metric)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_tree::Options as TreeOptions;
    use crate::stacks::InternStackSource;
    use std::sync::Arc;

    fn tree(stacks: &[(&str, f32)]) -> CallTree {
        let mut source = InternStackSource::new();
        for &(stack, metric) in stacks {
            source.add_stack(stack.split(';'), metric, 0.0);
        }
        CallTree::from_source(
            Arc::new(source),
            TreeOptions {
                nthreads: 1,
                ..Default::default()
            },
        )
    }

    fn report(tree: &CallTree, options: &Options) -> Vec<String> {
        let mut out = Vec::new();
        write_tree(tree, options, &mut out).unwrap();
        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| l.trim_end().to_string())
            .collect()
    }

    #[test]
    fn indents_callees() {
        let tree = tree(&[("main;parse", 2000.0), ("main;run", 1000.0)]);
        let lines = report(&tree, &Options::default());
        assert_eq!(
            lines,
            vec![
                HEADER.to_string(),
                "  100.0        3,000     0.0            0  ROOT".to_string(),
                "  100.0        3,000     0.0            0  + main".to_string(),
                "   66.7        2,000    66.7        2,000  |  + parse".to_string(),
                "   33.3        1,000    33.3        1,000  |  + run".to_string(),
            ]
        );
    }

    #[test]
    fn honors_depth_and_percent_limits() {
        let tree = tree(&[("main;parse;lex", 95.0), ("main;run", 5.0)]);
        let lines = report(
            &tree,
            &Options {
                min_percent: 10.0,
                max_depth: Some(2),
                ..Default::default()
            },
        );
        assert_eq!(lines.len(), 4);
        assert!(lines[3].ends_with("|  + parse"));
    }

    #[test]
    fn fractional_metrics_keep_decimals() {
        let mut buffer = Buffer::default();
        assert_eq!(format_metric(&mut buffer, 1234567.0), "1,234,567");
        assert_eq!(format_metric(&mut buffer, 0.25), "0.25");
        assert_eq!(format_metric(&mut buffer, -3.0), "-3");
    }

    #[test]
    fn caller_callee_sections() {
        let tree = tree(&[("A;B", 2.0), ("A;C", 1.0)]);
        let node = CallerCalleeNode::new("A", &tree);
        let mut out = Vec::new();
        write_caller_callee(&node, tree.percentage_basis(), &mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[1], "Callers:");
        assert!(lines[2].ends_with("ROOT"));
        assert_eq!(lines[3], "Focus:");
        assert!(lines[4].ends_with("  A"));
        assert_eq!(lines[5], "Callees:");
        assert!(lines[6].ends_with("  B"));
        assert!(lines[7].ends_with("  C"));
    }
}
