use std::collections::BTreeMap;
use std::io;

use serde::Serialize;

use crate::stacks::{CallStackIndex, StackSource};

#[derive(Debug, Serialize)]
struct Trace {
    #[serde(rename = "traceEvents")]
    trace_events: Vec<Event>,
    #[serde(rename = "stackFrames")]
    stack_frames: BTreeMap<i32, Frame>,
}

#[derive(Debug, Serialize)]
struct Event {
    name: String,
    cat: &'static str,
    ph: &'static str,
    ts: f64,
    pid: u32,
    tid: i32,
    sf: i32,
    args: Args,
}

#[derive(Debug, Serialize)]
struct Args {
    metric: f32,
    count: f32,
}

#[derive(Debug, Serialize)]
struct Frame {
    name: String,
    category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent: Option<i32>,
}

/// Writes every sample of `source` as a Chromium sample event.
///
/// Each sample becomes a `"P"` event whose `sf` names an entry of `stackFrames`, keyed by stack
/// index and linked to the caller stack through `parent`. Timestamps are in microseconds, and the
/// scenario of a sample becomes its thread id. A frame's category is its module, the part of the
/// name before `!`, if there is one. Samples without a stack are left out.
pub fn write<W>(source: &dyn StackSource, writer: W) -> io::Result<()>
where
    W: io::Write,
{
    let mut trace = Trace {
        trace_events: Vec::new(),
        stack_frames: BTreeMap::new(),
    };
    source.for_each(&mut |sample| {
        let stack = sample.stack_index;
        if !stack.is_valid() {
            return;
        }
        add_frames(source, stack, &mut trace.stack_frames);
        trace.trace_events.push(Event {
            name: trace.stack_frames[&stack.0].name.clone(),
            cat: "sample",
            ph: "P",
            ts: sample.time_relative_msec * 1000.0,
            pid: 0,
            tid: sample.scenario,
            sf: stack.0,
            args: Args {
                metric: sample.metric,
                count: sample.count,
            },
        });
    });
    debug!(
        "exporting {} sample events over {} stack frames",
        trace.trace_events.len(),
        trace.stack_frames.len()
    );
    serde_json::to_writer(writer, &trace)?;
    Ok(())
}

// Adds `stack` and the caller stacks not already known.
fn add_frames(source: &dyn StackSource, mut stack: CallStackIndex, frames: &mut BTreeMap<i32, Frame>) {
    while stack.is_valid() && !frames.contains_key(&stack.0) {
        let name = source.frame_name(source.frame_index(stack), false);
        let category = match name.find('!') {
            Some(bang) => name[..bang].to_string(),
            None => String::new(),
        };
        let caller = source.caller_index(stack);
        frames.insert(
            stack.0,
            Frame {
                name,
                category,
                parent: caller.is_valid().then_some(caller.0),
            },
        );
        stack = caller;
    }
}
