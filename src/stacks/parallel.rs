use std::any::Any;
use std::mem;
use std::num::NonZeroUsize;
use std::panic;

use crossbeam_channel as channel;
use once_cell::sync::Lazy;

use super::{StackSource, StackSourceSample};

/// Number of samples handed to a worker at a time by the default
/// [`StackSource::parallel_for_each`].
pub const SAMPLES_PER_BLOCK: usize = 256;

/// Blocks that may wait in a single worker's queue before the producer blocks.
const BLOCKS_PER_QUEUE: usize = 2;

/// Default parallelism for sample iteration: a quarter more threads than there are cores, since
/// callbacks spend part of their time waiting on the tree lock.
pub static DEFAULT_NTHREADS: Lazy<usize> = Lazy::new(|| {
    let cores = std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1);
    (cores * 5 + 3) / 4
});

/// Runs `source.for_each` on this thread and fans the samples out to `nthreads` workers.
///
/// Each worker owns a bounded queue; full blocks go to the queues round-robin, so the producer
/// blocks once every queue is full. Drained blocks come back through a free list and are reused.
/// Dropping the queue senders tells the workers to finish, and the scope joins them all before
/// this returns. A panic in `callback` is re-raised here once every worker has stopped.
pub(super) fn dispatch_blocks<S>(
    source: &S,
    callback: &(dyn Fn(&StackSourceSample) + Sync),
    nthreads: usize,
) where
    S: StackSource + ?Sized,
{
    if nthreads <= 1 {
        source.for_each(&mut |sample| callback(sample));
        return;
    }

    let result = crossbeam_utils::thread::scope(|scope| {
        // Drained blocks travel back to the producer through this channel.
        let (tx_free, rx_free) = channel::unbounded::<Vec<StackSourceSample>>();

        let mut queues = Vec::with_capacity(nthreads);
        for worker in 0..nthreads {
            let (tx_block, rx_block) = channel::bounded::<Vec<StackSourceSample>>(BLOCKS_PER_QUEUE);
            let tx_free = tx_free.clone();
            scope.spawn(move |_| {
                trace!("sample worker {} started", worker);
                for mut block in rx_block.iter() {
                    for sample in &block {
                        callback(sample);
                    }
                    block.clear();
                    // The producer may have finished already, in which case the block is
                    // simply dropped.
                    let _ = tx_free.send(block);
                }
                trace!("sample worker {} done", worker);
            });
            queues.push(tx_block);
        }
        drop(tx_free);

        let mut block = Vec::with_capacity(SAMPLES_PER_BLOCK);
        let mut next_queue = 0;
        source.for_each(&mut |sample| {
            block.push(sample.clone());
            if block.len() < SAMPLES_PER_BLOCK {
                return;
            }
            let fresh = rx_free
                .try_recv()
                .unwrap_or_else(|_| Vec::with_capacity(SAMPLES_PER_BLOCK));
            let full = mem::replace(&mut block, fresh);
            // A send only fails if that worker panicked; the panic surfaces when the scope ends.
            let _ = queues[next_queue].send(full);
            next_queue = (next_queue + 1) % queues.len();
        });
        if !block.is_empty() {
            let _ = queues[next_queue].send(block);
        }

        // Closing the queues lets the workers drain and exit.
        drop(queues);
    });

    if let Err(payload) = result {
        rethrow(payload);
    }
}

/// Re-raises the panic of a failed thread scope on the current thread.
///
/// A scope collects the payloads of every panicked thread; the first one is re-raised so its
/// message survives.
pub(crate) fn rethrow(payload: Box<dyn Any + Send + 'static>) -> ! {
    match payload.downcast::<Vec<Box<dyn Any + Send + 'static>>>() {
        Ok(mut panics) if !panics.is_empty() => panic::resume_unwind(panics.swap_remove(0)),
        Ok(_) => panic!("a worker thread panicked"),
        Err(payload) => panic::resume_unwind(payload),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::stacks::{CallStackIndex, FrameIndex};

    /// Yields `n` samples whose stack index is their position.
    struct Counting(usize);

    impl StackSource for Counting {
        fn for_each(&self, callback: &mut dyn FnMut(&StackSourceSample)) {
            // One sample buffer reused for every callback, like most producers do.
            let mut sample = StackSourceSample::default();
            for i in 0..self.0 {
                sample.stack_index = CallStackIndex::new(i);
                callback(&sample);
            }
        }

        fn caller_index(&self, _stack: CallStackIndex) -> CallStackIndex {
            CallStackIndex::INVALID
        }

        fn frame_index(&self, _stack: CallStackIndex) -> FrameIndex {
            FrameIndex::START
        }

        fn frame_name(&self, _frame: FrameIndex, _verbose: bool) -> String {
            "frame".to_string()
        }

        fn call_stack_index_limit(&self) -> usize {
            self.0
        }

        fn call_frame_index_limit(&self) -> usize {
            FrameIndex::START.index() + 1
        }
    }

    #[test]
    fn every_sample_is_delivered_once() {
        let n = SAMPLES_PER_BLOCK * 7 + 13;
        for nthreads in [1, 2, 3, 8] {
            let seen = Mutex::new(vec![0u8; n]);
            Counting(n).parallel_for_each(
                &|sample| {
                    seen.lock().unwrap()[sample.stack_index.index()] += 1;
                },
                nthreads,
            );
            let seen = seen.into_inner().unwrap();
            assert!(
                seen.iter().all(|&c| c == 1),
                "with {} threads some sample was not delivered exactly once",
                nthreads
            );
        }
    }

    #[test]
    fn empty_source_returns() {
        let calls = AtomicUsize::new(0);
        Counting(0).parallel_for_each(
            &|_| {
                calls.fetch_add(1, Ordering::Relaxed);
            },
            4,
        );
        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    #[should_panic(expected = "callback failed")]
    fn callback_panics_propagate() {
        Counting(SAMPLES_PER_BLOCK * 4).parallel_for_each(
            &|sample| {
                if sample.stack_index.index() == 3 {
                    panic!("callback failed");
                }
            },
            2,
        );
    }
}
