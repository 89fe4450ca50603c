//! Newline-delimited record reassembly.
//!
//! Streaming backends emit JSON-lines output, but the transport re-chunks
//! it arbitrarily: a chunk may hold part of a record, several records, or
//! the tail of one record and the head of the next. [`RecordReassembler`]
//! turns that chunk sequence back into complete records. It never looks
//! at record contents.

use std::collections::VecDeque;

use crate::error::{ExecutorError, ExecutorResult};

const RECORD_TERMINATOR: char = '\n';

/// Iterator adapter yielding complete records from a chunk iterator.
///
/// Each record is yielded without its terminator. If the source ends
/// while a record is still buffered, a single
/// [`ExecutorError::ProtocolFraming`] is yielded and iteration stops.
/// A source error is forwarded once and also ends iteration.
pub struct RecordReassembler<I> {
    chunks: I,
    buffer: String,
    ready: VecDeque<String>,
    finished: bool,
}

impl<I> RecordReassembler<I> {
    pub fn new(chunks: I) -> Self {
        Self {
            chunks,
            buffer: String::new(),
            ready: VecDeque::new(),
            finished: false,
        }
    }

    /// Move every terminated record out of the buffer.
    fn split_buffer(&mut self) {
        while let Some(pos) = self.buffer.find(RECORD_TERMINATOR) {
            let record: String = self.buffer.drain(..=pos).collect();
            self.ready
                .push_back(record[..record.len() - RECORD_TERMINATOR.len_utf8()].to_string());
        }
    }
}

impl<I, E> Iterator for RecordReassembler<I>
where
    I: Iterator<Item = Result<String, E>>,
    E: Into<ExecutorError>,
{
    type Item = ExecutorResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.ready.pop_front() {
                return Some(Ok(record));
            }
            if self.finished {
                return None;
            }

            match self.chunks.next() {
                Some(Ok(chunk)) => {
                    self.buffer.push_str(&chunk);
                    self.split_buffer();
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e.into()));
                }
                None => {
                    self.finished = true;
                    if !self.buffer.is_empty() {
                        let pending_bytes = self.buffer.len();
                        self.buffer.clear();
                        return Some(Err(ExecutorError::ProtocolFraming { pending_bytes }));
                    }
                }
            }
        }
    }
}

/// Reassemble records from an infallible chunk source.
pub fn reassemble<I>(chunks: I) -> RecordReassembler<impl Iterator<Item = ExecutorResult<String>>>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    RecordReassembler::new(chunks.into_iter().map(|chunk| Ok(chunk.into())))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
