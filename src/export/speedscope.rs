use std::io;

use ahash::RandomState;
use indexmap::IndexSet;
use serde::Serialize;

use crate::stacks::{frames, CallStackIndex, StackSource, StackSourceSample};

const SCHEMA: &str = "https://www.speedscope.app/file-format-schema.json";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct File<'a> {
    #[serde(rename = "$schema")]
    schema: &'static str,
    exporter: String,
    name: &'a str,
    active_profile_index: usize,
    shared: Shared,
    profiles: Vec<Profile>,
}

#[derive(Debug, Serialize)]
struct Shared {
    frames: Vec<Frame>,
}

#[derive(Debug, Serialize)]
struct Frame {
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename = "evented", rename_all = "camelCase")]
struct Profile {
    name: String,
    unit: &'static str,
    start_value: f64,
    end_value: f64,
    events: Vec<Event>,
}

#[derive(Debug, Serialize)]
struct Event {
    #[serde(rename = "type")]
    kind: EventKind,
    frame: usize,
    at: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
enum EventKind {
    #[serde(rename = "O")]
    Open,
    #[serde(rename = "C")]
    Close,
}

/// Writes `source` as a speedscope file of evented profiles named after `name`.
///
/// A source with scenarios gets one profile per scenario, otherwise all samples go into one. Each
/// sample holds its stack open from its timestamp until the next sample starts or its own metric
/// runs out, whichever comes first, so consecutive samples on the same stack merge into one span.
pub fn write<W>(source: &dyn StackSource, name: &str, writer: W) -> io::Result<()>
where
    W: io::Write,
{
    let scenarios = source.scenario_count().max(1);
    let mut samples: Vec<Vec<StackSourceSample>> = vec![Vec::new(); scenarios];
    source.for_each(&mut |sample| {
        if sample.stack_index == CallStackIndex::DISCARD {
            return;
        }
        let scenario = usize::try_from(sample.scenario).unwrap_or(0);
        let profile = if scenarios == 1 { 0 } else { scenario.min(scenarios - 1) };
        samples[profile].push(sample.clone());
    });

    let mut shared: IndexSet<String, RandomState> = IndexSet::default();
    let profiles: Vec<Profile> = samples
        .into_iter()
        .enumerate()
        .map(|(scenario, mut samples)| {
            samples.sort_by(|a, b| a.time_relative_msec.total_cmp(&b.time_relative_msec));
            let profile_name = if scenarios == 1 {
                name.to_string()
            } else {
                format!("{} [scenario {}]", name, scenario)
            };
            evented(source, profile_name, &samples, &mut shared)
        })
        .collect();

    let file = File {
        schema: SCHEMA,
        exporter: format!("stackfold@{}", env!("CARGO_PKG_VERSION")),
        name,
        active_profile_index: 0,
        shared: Shared {
            frames: shared.into_iter().map(|name| Frame { name }).collect(),
        },
        profiles,
    };
    serde_json::to_writer(writer, &file)?;
    Ok(())
}

fn evented(
    source: &dyn StackSource,
    name: String,
    samples: &[StackSourceSample],
    shared: &mut IndexSet<String, RandomState>,
) -> Profile {
    let start = samples.first().map_or(0.0, |s| s.time_relative_msec);
    let mut events = Vec::new();
    let mut open: Vec<usize> = Vec::new();
    let mut open_until = start;
    let mut end = start;

    for sample in samples {
        let time = sample.time_relative_msec;
        if time > open_until {
            flow(&mut events, &mut open, Vec::new(), open_until);
        }

        let mut stack: Vec<usize> = frames(source, sample.stack_index)
            .map(|frame| shared.insert_full(source.frame_name(frame, false)).0)
            .collect();
        stack.reverse();
        flow(&mut events, &mut open, stack, time);

        open_until = time + f64::from(sample.metric.abs());
        end = end.max(open_until);
    }
    flow(&mut events, &mut open, Vec::new(), end);

    Profile {
        name,
        unit: "milliseconds",
        start_value: start,
        end_value: end,
        events,
    }
}

// Closes the frames of `open` that `next` does not share, innermost first, then opens the rest of
// `next`, outermost first.
fn flow(events: &mut Vec<Event>, open: &mut Vec<usize>, next: Vec<usize>, at: f64) {
    let shared_depth = open
        .iter()
        .zip(&next)
        .take_while(|(a, b)| a == b)
        .count();

    while open.len() > shared_depth {
        if let Some(frame) = open.pop() {
            events.push(Event {
                kind: EventKind::Close,
                frame,
                at,
            });
        }
    }
    for &frame in &next[shared_depth..] {
        events.push(Event {
            kind: EventKind::Open,
            frame,
            at,
        });
        open.push(frame);
    }
}
