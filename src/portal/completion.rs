//! Channel-backed completion sink
//!
//! The usual way to collect results: hand the sink to every submission and
//! drain the receiver from the caller's thread.

use crate::core::types::OpStatus;
use crate::portal::operation::CompletionSink;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A finished operation and its terminal status
#[derive(Debug)]
pub struct Completed<O> {
    /// The operation, handed back to its owner
    pub op: O,
    /// Terminal status
    pub status: OpStatus,
}

/// Sink half of a completion channel
pub struct ChannelSink<O> {
    tx: flume::Sender<Completed<O>>,
}

impl<O: Send> CompletionSink<O> for ChannelSink<O> {
    fn mark_completed(&self, op: O, status: OpStatus) {
        // Receiver gone means nobody is waiting for the result.
        let _ = self.tx.send(Completed { op, status });
    }
}

/// Receiving half of a completion channel
pub struct CompletionReceiver<O> {
    rx: flume::Receiver<Completed<O>>,
}

impl<O> CompletionReceiver<O> {
    /// Next completion, if one is already available
    pub fn try_recv(&self) -> Option<Completed<O>> {
        self.rx.try_recv().ok()
    }

    /// Next completion, waiting up to `timeout`
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Completed<O>> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Collect up to `n` completions, giving up after `timeout` overall
    pub fn wait_for(&self, n: usize, timeout: Duration) -> Vec<Completed<O>> {
        let deadline = Instant::now() + timeout;
        let mut done = Vec::with_capacity(n);
        while done.len() < n {
            match self.rx.recv_deadline(deadline) {
                Ok(c) => done.push(c),
                Err(_) => break,
            }
        }
        done
    }

    /// Completions waiting to be received
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// True if no completion is waiting
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create a completion sink and its receiver
pub fn completion_channel<O: Send + 'static>() -> (Arc<ChannelSink<O>>, CompletionReceiver<O>) {
    let (tx, rx) = flume::unbounded();
    (Arc::new(ChannelSink { tx }), CompletionReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_for_collects_across_threads() {
        let (sink, rx) = completion_channel::<u32>();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let sink = sink.clone();
                thread::spawn(move || sink.mark_completed(i, OpStatus::Ok))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut got: Vec<u32> = rx
            .wait_for(4, Duration::from_secs(1))
            .into_iter()
            .map(|c| c.op)
            .collect();
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2, 3]);
        assert!(rx.is_empty());
    }

    #[test]
    fn wait_for_stops_at_deadline() {
        let (sink, rx) = completion_channel::<u32>();
        sink.mark_completed(1, OpStatus::Generic);
        let got = rx.wait_for(3, Duration::from_millis(50));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].status, OpStatus::Generic);
    }
}
