//! In-memory channel replaying a fixed script of reads, for session tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

use super::{ByteChannel, ChannelKind, ReadOutcome};
use crate::error::ChannelError;

#[derive(Debug, Clone)]
pub enum Step {
    /// Deliver these bytes (split across reads if larger than the buffer).
    Data(Vec<u8>),
    /// A read that returns nothing without ending the stream.
    Empty,
    /// Transport failure.
    Fail(io::ErrorKind),
    /// Wait until the channel is closed.
    Stall,
}

pub struct ScriptedChannel {
    kind: ChannelKind,
    steps: Mutex<VecDeque<Step>>,
    written: Mutex<Vec<u8>>,
    closed: CancellationToken,
    close_calls: AtomicUsize,
}

impl ScriptedChannel {
    pub fn new(kind: ChannelKind, steps: Vec<Step>) -> Self {
        Self {
            kind,
            steps: Mutex::new(steps.into()),
            written: Mutex::new(Vec::new()),
            closed: CancellationToken::new(),
            close_calls: AtomicUsize::new(0),
        }
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    fn next_step(&self) -> Option<Step> {
        self.steps.lock().unwrap().pop_front()
    }

    fn push_front(&self, step: Step) {
        self.steps.lock().unwrap().push_front(step);
    }
}

#[async_trait]
impl ByteChannel for ScriptedChannel {
    async fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome, ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        match self.next_step() {
            None => Ok(ReadOutcome::eof()),
            Some(Step::Empty) => Ok(ReadOutcome::data(0)),
            Some(Step::Fail(kind)) => Err(io::Error::new(kind, "scripted failure").into()),
            Some(Step::Stall) => {
                self.closed.cancelled().await;
                Err(ChannelError::Closed)
            }
            Some(Step::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    self.push_front(Step::Data(data.split_off(n)));
                }
                Ok(ReadOutcome::data(n))
            }
        }
    }

    async fn write(&self, bytes: &[u8]) -> Result<usize, ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        self.written.lock().unwrap().extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn describe(&self) -> String {
        format!("scripted {}", self.kind)
    }
}
