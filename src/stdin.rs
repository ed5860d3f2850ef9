//! The request input buffer.
//!
//! `Stdin` is a lazy byte source backed by `Stdin` records pulled on
//! demand. In sequential mode it pulls straight from the connection's
//! framed reader, interleaving with the dispatcher; in multiplexed mode it
//! pulls from the request agent's inbox, which the dispatcher feeds.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::codec::Record;
use crate::connection::SharedReader;
use crate::error::{Error, Result};
use crate::response::OutputState;
use crate::s11n::RecordType;

/// Where the buffer pulls its records from.
pub(crate) enum RecordSource {
    /// Sequential mode: the connection's framed reader, shared with the
    /// dispatcher. The dispatcher is parked in the handler while reads
    /// happen here, so the lock is uncontended.
    Stream(SharedReader),
    /// Multiplexed mode: the agent's inbox. The dispatcher is the sole
    /// producer.
    Inbox(mpsc::Receiver<Record>),
}

pub struct Stdin {
    request_id: u16,
    buf: BytesMut,
    all_read: bool,
    source: RecordSource,
    output: Arc<OutputState>,
}

impl Stdin {
    pub(crate) fn new(request_id: u16, source: RecordSource, output: Arc<OutputState>) -> Stdin {
        Stdin {
            request_id,
            buf: BytesMut::new(),
            all_read: false,
            source,
            output,
        }
    }

    /// True once the empty `Stdin` record (or stream end) arrived; no
    /// further input will ever be appended.
    pub fn all_read(&self) -> bool {
        self.all_read
    }

    /// Returns up to `n` bytes, never more. Pulls records until the buffer
    /// holds `n` bytes or end-of-input arrives, whichever happens first;
    /// after end-of-input it returns whatever remains, possibly nothing.
    pub async fn get(&mut self, n: usize) -> Result<Bytes> {
        if self.output.is_closed() {
            return Err(Error::OutputAlreadyClosed);
        }
        while self.buf.len() < n && !self.all_read {
            self.pull().await?;
        }
        let take = n.min(self.buf.len());
        Ok(self.buf.split_to(take).freeze())
    }

    /// Pulls records until the end-of-input marker and returns the
    /// concatenation of all unread bytes.
    pub async fn get_all(&mut self) -> Result<Bytes> {
        if self.output.is_closed() {
            return Err(Error::OutputAlreadyClosed);
        }
        while !self.all_read {
            self.pull().await?;
        }
        Ok(self.buf.split().freeze())
    }

    async fn pull(&mut self) -> Result<()> {
        let record = match &mut self.source {
            RecordSource::Stream(reader) => match reader.lock().await.next().await {
                Some(result) => Some(result?),
                None => None,
            },
            RecordSource::Inbox(inbox) => match inbox.recv().await {
                Some(record) => Some(record),
                // The connection tore the agent down before the
                // end-of-input marker.
                None => return Err(Error::BufferClosed),
            },
        };

        match record {
            None => {
                warn!(
                    "request {}: stream ended before the empty Stdin record",
                    self.request_id
                );
                self.all_read = true;
            }
            Some(record) => self.accept(record),
        }
        Ok(())
    }

    fn accept(&mut self, record: Record) {
        if record.record_type != RecordType::Stdin {
            // The dispatcher should never deliver these here.
            warn!(
                "request {}: skipping {:?} record at the input buffer",
                self.request_id, record.record_type
            );
            return;
        }
        if record.request_id != self.request_id {
            warn!(
                "request {}: skipping Stdin record for request {}",
                self.request_id, record.request_id
            );
            return;
        }
        if record.content.is_empty() {
            debug!("request {}: stdin complete", self.request_id);
            self.all_read = true;
        } else {
            self.buf.extend_from_slice(&record.content);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbox_stdin(capacity: usize) -> (mpsc::Sender<Record>, Stdin, Arc<OutputState>) {
        let (tx, rx) = mpsc::channel(capacity);
        let output = Arc::new(OutputState::new());
        let stdin = Stdin::new(1, RecordSource::Inbox(rx), output.clone());
        (tx, stdin, output)
    }

    #[tokio::test]
    async fn get_returns_at_most_n_bytes() {
        let (tx, mut stdin, _output) = inbox_stdin(4);
        tx.send(Record::new(RecordType::Stdin, 1, Bytes::from_static(b"abcdef")))
            .await
            .unwrap();
        let chunk = stdin.get(4).await.unwrap();
        assert_eq!(&chunk[..], b"abcd");
        tx.send(Record::new(RecordType::Stdin, 1, Bytes::new()))
            .await
            .unwrap();
        let rest = stdin.get(100).await.unwrap();
        assert_eq!(&rest[..], b"ef");
        assert!(stdin.all_read());
        assert!(stdin.get(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_all_concatenates_every_record() {
        let (tx, mut stdin, _output) = inbox_stdin(4);
        for chunk in [&b"one"[..], &b"two"[..], &b""[..]] {
            tx.send(Record::new(RecordType::Stdin, 1, Bytes::copy_from_slice(chunk)))
                .await
                .unwrap();
        }
        let all = stdin.get_all().await.unwrap();
        assert_eq!(&all[..], b"onetwo");
    }

    #[tokio::test]
    async fn non_stdin_records_are_skipped() {
        let (tx, mut stdin, _output) = inbox_stdin(4);
        tx.send(Record::new(RecordType::Data, 1, Bytes::from_static(b"xx")))
            .await
            .unwrap();
        tx.send(Record::new(RecordType::Stdin, 2, Bytes::from_static(b"yy")))
            .await
            .unwrap();
        tx.send(Record::new(RecordType::Stdin, 1, Bytes::new()))
            .await
            .unwrap();
        let all = stdin.get_all().await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn reads_fail_once_output_is_closed() {
        let (_tx, mut stdin, output) = inbox_stdin(4);
        output.close();
        match stdin.get(1).await {
            Err(Error::OutputAlreadyClosed) => {}
            other => panic!("expected OutputAlreadyClosed, got {:?}", other),
        }
        match stdin.get_all().await {
            Err(Error::OutputAlreadyClosed) => {}
            other => panic!("expected OutputAlreadyClosed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn vanished_inbox_is_an_error() {
        let (tx, mut stdin, _output) = inbox_stdin(4);
        drop(tx);
        match stdin.get(1).await {
            Err(Error::BufferClosed) => {}
            other => panic!("expected BufferClosed, got {:?}", other),
        }
    }
}
