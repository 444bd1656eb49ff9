//! Per-job output retention and attachment fan-out.
//!
//! Chunks arriving from an agent are appended to a byte-capped ring (so late
//! attaches can replay recent output) and pushed to every attached client.
//! A client whose channel is full is dropped rather than allowed to slow
//! the job down.

use std::collections::VecDeque;

use tokio::sync::mpsc;

use crate::protocol::{self, Message, StreamKind};

/// Channel depth per attached client before it counts as backpressured.
const TAP_DEPTH: usize = 256;

#[derive(Debug)]
pub struct OutputRing {
    chunks: VecDeque<(StreamKind, Vec<u8>)>,
    bytes: usize,
    capacity: usize,
}

impl OutputRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            capacity,
        }
    }

    pub fn push(&mut self, kind: StreamKind, data: Vec<u8>) {
        self.bytes += data.len();
        self.chunks.push_back((kind, data));
        while self.bytes > self.capacity {
            match self.chunks.pop_front() {
                Some((_, old)) => self.bytes -= old.len(),
                None => break,
            }
        }
    }

    pub fn replay(&self) -> impl Iterator<Item = &(StreamKind, Vec<u8>)> {
        self.chunks.iter()
    }

    pub fn byte_len(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[derive(Debug)]
struct Tap {
    id: u64,
    tx: mpsc::Sender<Message>,
    cancel_on_drop: bool,
}

/// Ring plus attachments for one job.
#[derive(Debug)]
pub struct JobOutput {
    pub ring: OutputRing,
    taps: Vec<Tap>,
    next_tap: u64,
    /// Recorded `(code, signal)` for attaches arriving after the job ended.
    pub exit: Option<(Option<i32>, Option<i32>)>,
}

impl JobOutput {
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            ring: OutputRing::new(ring_capacity),
            taps: Vec::new(),
            next_tap: 0,
            exit: None,
        }
    }

    /// Register an attachment. `cancel_on_drop` marks the submitting client
    /// of an interactive job whose disconnect cancels the job.
    pub fn attach(&mut self, cancel_on_drop: bool) -> (u64, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(TAP_DEPTH);
        let id = self.next_tap;
        self.next_tap += 1;
        self.taps.push(Tap {
            id,
            tx,
            cancel_on_drop,
        });
        (id, rx)
    }

    /// Remove an attachment. Returns whether it was one whose loss cancels
    /// the job.
    pub fn detach(&mut self, tap_id: u64) -> bool {
        match self.taps.iter().position(|t| t.id == tap_id) {
            Some(idx) => self.taps.remove(idx).cancel_on_drop,
            None => false,
        }
    }

    /// Append a chunk to the ring and fan it out.
    pub fn publish(&mut self, job_id: &str, kind: StreamKind, data: Vec<u8>) {
        let msg = Message::Out {
            job_id: job_id.to_string(),
            stream: kind,
            data: protocol::encode_chunk(&data),
        };
        self.ring.push(kind, data);
        self.taps.retain(|tap| match tap.tx.try_send(msg.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(job_id, tap = tap.id, "dropping backpressured client");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Record the exit and close every attachment with it.
    pub fn finish(&mut self, job_id: &str, code: Option<i32>, signal: Option<i32>) {
        self.exit = Some((code, signal));
        let msg = Message::Exit {
            job_id: job_id.to_string(),
            code,
            signal,
        };
        for tap in self.taps.drain(..) {
            let _ = tap.tx.try_send(msg.clone());
        }
    }

    pub fn has_history(&self) -> bool {
        !self.ring.is_empty() || self.exit.is_some()
    }

    pub fn tap_count(&self) -> usize {
        self.taps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_chunks_past_capacity() {
        let mut ring = OutputRing::new(10);
        ring.push(StreamKind::Stdout, vec![b'a'; 6]);
        ring.push(StreamKind::Stdout, vec![b'b'; 6]);
        assert_eq!(ring.byte_len(), 6);
        assert_eq!(ring.replay().count(), 1);
        assert_eq!(ring.replay().next().unwrap().1[0], b'b');
    }

    #[tokio::test]
    async fn publish_reaches_every_tap() {
        let mut out = JobOutput::new(1024);
        let (_, mut rx1) = out.attach(false);
        let (_, mut rx2) = out.attach(false);

        out.publish("job", StreamKind::Stdout, b"hi".to_vec());
        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await {
                Some(Message::Out { data, .. }) => {
                    assert_eq!(protocol::decode_chunk(&data).unwrap(), b"hi");
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn backpressured_taps_are_dropped() {
        let mut out = JobOutput::new(1 << 20);
        let (_, mut rx) = out.attach(false);

        for _ in 0..TAP_DEPTH + 1 {
            out.publish("job", StreamKind::Stdout, b"x".to_vec());
        }
        assert_eq!(out.tap_count(), 0);

        // the channel still drains what was buffered before the drop
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn finish_closes_taps_with_the_exit() {
        let mut out = JobOutput::new(1024);
        let (_, mut rx) = out.attach(false);
        out.finish("job", Some(0), None);

        match rx.recv().await {
            Some(Message::Exit { code, .. }) => assert_eq!(code, Some(0)),
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(rx.recv().await.is_none());
        assert!(out.has_history());
    }
}
