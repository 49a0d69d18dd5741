use std::fs::File;
use std::io::{BufRead, BufReader, Cursor};
use std::process::Command;

use assert_cmd::cargo::CommandCargoExt;
use log::Level;
use pretty_assertions::assert_eq;
use serde_json::Value;
use stackfold::stacks::InternStackSource;

fn stackfold(args: &[&str]) -> Vec<u8> {
    let output = Command::cargo_bin("stackfold")
        .unwrap()
        .args(args)
        .output()
        .expect("failed to execute process");
    assert!(
        output.status.success(),
        "stackfold {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    output.stdout
}

fn compare_results<R, E>(result: R, expected: E, expected_file: &str)
where
    R: BufRead,
    E: BufRead,
{
    let result_lines: Vec<String> = result.lines().map(Result::unwrap).collect();
    let expected_lines: Vec<String> = expected.lines().map(Result::unwrap).collect();
    assert_eq!(
        result_lines.len(),
        expected_lines.len(),
        "\nresult has {} lines, expected {} lines",
        result_lines.len(),
        expected_lines.len()
    );
    for (line_num, (result_line, expected_line)) in
        result_lines.iter().zip(expected_lines.iter()).enumerate()
    {
        assert_eq!(
            result_line.trim_end(),
            expected_line.trim_end(),
            "\n{}:{}",
            expected_file,
            line_num
        );
    }
}

fn test_report(args: &[&str], expected_file: &str) {
    let output = stackfold(args);
    let expected = BufReader::new(File::open(expected_file).unwrap());
    compare_results(Cursor::new(output), expected, expected_file);
}

#[test]
fn cli_tree_report() {
    test_report(
        &["--time-buckets", "0", "./tests/data/folded/simple.folded"],
        "./tests/data/results/simple.txt",
    );
}

#[test]
fn cli_min_percent_folds_small_nodes() {
    test_report(
        &[
            "--time-buckets",
            "0",
            "--min-percent",
            "10",
            "./tests/data/folded/simple.folded",
        ],
        "./tests/data/results/min_percent.txt",
    );
}

#[test]
fn cli_several_files_become_scenarios() {
    test_report(
        &[
            "--no-histograms",
            "./tests/data/folded/run1.folded",
            "./tests/data/folded/run2.folded",
        ],
        "./tests/data/results/scenarios.txt",
    );
}

#[test]
fn cli_caller_callee() {
    test_report(
        &[
            "--caller-callee",
            "run",
            "./tests/data/folded/simple.folded",
        ],
        "./tests/data/results/caller_callee.txt",
    );
}

#[test]
fn cli_exclude() {
    let output = stackfold(&[
        "--time-buckets",
        "0",
        "--exclude",
        "io;lex",
        "./tests/data/folded/simple.folded",
    ]);
    let output = String::from_utf8(output).unwrap();
    let names: Vec<&str> = output
        .lines()
        .skip(1)
        .map(|l| &l[43..])
        .collect();
    assert_eq!(names, vec!["ROOT", "+ main", "|  + run", "|  + parse"]);
    assert!(output.lines().nth(1).unwrap().contains("1,800"));
}

#[test]
fn cli_speedscope() {
    let output = stackfold(&[
        "--format",
        "speedscope",
        "./tests/data/folded/simple.folded",
    ]);
    let json: Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(json["name"], "simple");
    let profiles = json["profiles"].as_array().unwrap();
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0]["endValue"], 3000.0);
    assert_eq!(json["shared"]["frames"].as_array().unwrap().len(), 5);
}

#[test]
fn cli_chromium() {
    let output = stackfold(&["--format", "chromium", "./tests/data/folded/simple.folded"]);
    let json: Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(json["traceEvents"].as_array().unwrap().len(), 4);
    assert_eq!(json["stackFrames"].as_object().unwrap().len(), 5);
}

#[test]
fn cli_rejects_bad_patterns() {
    let output = Command::cargo_bin("stackfold")
        .unwrap()
        .args(["--exclude", "x{", "./tests/data/folded/simple.folded"])
        .output()
        .expect("failed to execute process");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("x{"));
}

#[test]
fn bad_lines_are_ignored_with_a_warning() {
    testing_logger::setup();
    let source = InternStackSource::from_folded(BufReader::new(
        File::open("./tests/data/folded/bad.folded").unwrap(),
    ))
    .unwrap();
    assert_eq!(source.samples().len(), 2);
    testing_logger::validate(|captured_logs| {
        let nwarnings = captured_logs
            .iter()
            .filter(|log| log.body == "Ignored 2 lines with invalid format" && log.level == Level::Warn)
            .count();
        assert_eq!(
            nwarnings, 1,
            "bad lines warning logged {} times, but should be logged exactly once",
            nwarnings
        );
    });
}

#[test]
fn cli_help_describes_thread_default() {
    let help = String::from_utf8(stackfold(&["--help"])).unwrap();
    assert!(help.contains("--nthreads"));
    assert!(help.contains("1.25 times"), "thread default missing from:\n{}", help);
    assert!(!help.contains("default: number of logical cores"));
}
