//! Record framing over an arbitrary byte stream.
//!
//! `RecordCodec` turns the stream into a lazy sequence of complete records
//! and back. Partial reads never surface: `decode` consumes nothing until
//! the whole record (header, content, padding) is buffered, so the record
//! sequence is identical no matter where the underlying read boundaries
//! fall.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::s11n::{
    EndRequestBody, ProtocolStatus, RecordHeader, RecordType, HEADER_LEN, MAX_CONTENT_LEN,
};

/// One complete FastCGI record. Content is raw bytes; typed decoding
/// (begin-request bodies, name-value pairs) happens at the dispatch layer,
/// after stream payloads have been concatenated across record boundaries.
#[derive(Debug, Clone)]
pub struct Record {
    pub record_type: RecordType,
    pub request_id: u16,
    pub content: Bytes,
}

impl Record {
    pub fn new(record_type: RecordType, request_id: u16, content: Bytes) -> Record {
        debug_assert!(content.len() <= MAX_CONTENT_LEN);
        Record {
            record_type,
            request_id,
            content,
        }
    }

    pub fn stdout(request_id: u16, content: Bytes) -> Record {
        Record::new(RecordType::Stdout, request_id, content)
    }

    pub fn end_request(request_id: u16, app_status: u32, protocol_status: ProtocolStatus) -> Record {
        let body = EndRequestBody {
            app_status,
            protocol_status,
        };
        Record::new(
            RecordType::EndRequest,
            request_id,
            Bytes::copy_from_slice(&body.encode()),
        )
    }

    /// The reply to a record of an unrecognized type: the original type
    /// byte followed by seven reserved zero bytes, addressed to the
    /// connection (request id 0).
    pub fn unknown_type(code: u8) -> Record {
        let mut content = [0u8; 8];
        content[0] = code;
        Record::new(RecordType::UnknownType, 0, Bytes::copy_from_slice(&content))
    }

    pub fn get_values_result(content: Bytes) -> Record {
        Record::new(RecordType::GetValuesResult, 0, content)
    }

    /// Management records carry request id 0 and address the connection
    /// itself rather than any request.
    pub fn is_management(&self) -> bool {
        self.request_id == 0
    }
}

#[derive(Debug, Default)]
pub struct RecordCodec;

impl Decoder for RecordCodec {
    type Item = Record;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Record>, Error> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header_bytes = [0u8; HEADER_LEN];
        header_bytes.copy_from_slice(&buf[..HEADER_LEN]);
        let header = RecordHeader::decode(&header_bytes)?;

        let content_len = header.content_length as usize;
        let padding_len = header.padding_length as usize;
        let total = HEADER_LEN + content_len + padding_len;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let content = buf.split_to(content_len).freeze();
        buf.advance(padding_len);

        debug!(
            "record: type {:?}, request id {}, {} content bytes, {} padding",
            header.record_type, header.request_id, content_len, padding_len
        );
        Ok(Some(Record {
            record_type: header.record_type,
            request_id: header.request_id,
            content,
        }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Record>, Error> {
        match self.decode(buf)? {
            Some(record) => Ok(Some(record)),
            None => {
                // A record cut short by the peer closing is end-of-stream,
                // not a framing error.
                if !buf.is_empty() {
                    warn!("peer closed mid-record; discarding {} trailing bytes", buf.len());
                    buf.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Record> for RecordCodec {
    type Error = Error;

    fn encode(&mut self, record: Record, buf: &mut BytesMut) -> Result<(), Error> {
        let header = RecordHeader::encode(
            record.record_type,
            record.request_id,
            record.content.len() as u16,
        );
        buf.reserve(HEADER_LEN + record.content.len());
        buf.put_slice(&header);
        buf.put_slice(&record.content);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_record(record: Record) -> BytesMut {
        let mut buf = BytesMut::new();
        RecordCodec.encode(record, &mut buf).unwrap();
        buf
    }

    #[test]
    fn decode_is_split_invariant() {
        let mut wire = BytesMut::new();
        let mut codec = RecordCodec;
        codec
            .encode(Record::stdout(3, Bytes::from_static(b"hello")), &mut wire)
            .unwrap();
        codec
            .encode(Record::end_request(3, 0, ProtocolStatus::RequestComplete), &mut wire)
            .unwrap();
        let wire = wire.freeze();

        for split in 0..=wire.len() {
            let mut codec = RecordCodec;
            let mut buf = BytesMut::from(&wire[..split]);
            let mut records = Vec::new();
            while let Some(r) = codec.decode(&mut buf).unwrap() {
                records.push(r);
            }
            buf.extend_from_slice(&wire[split..]);
            while let Some(r) = codec.decode(&mut buf).unwrap() {
                records.push(r);
            }
            assert_eq!(records.len(), 2, "split at {}", split);
            assert_eq!(records[0].record_type, RecordType::Stdout);
            assert_eq!(&records[0].content[..], b"hello");
            assert_eq!(records[1].record_type, RecordType::EndRequest);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn decode_skips_padding() {
        let mut buf = BytesMut::new();
        let mut header = RecordHeader::encode(RecordType::Stdin, 1, 4);
        header[6] = 3; // padding
        buf.put_slice(&header);
        buf.put_slice(b"body");
        buf.put_slice(&[0xAA, 0xBB, 0xCC]);
        buf.put_slice(&RecordHeader::encode(RecordType::Stdin, 1, 0));

        let mut codec = RecordCodec;
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&first.content[..], b"body");
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(second.content.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_rejects_bad_version() {
        let mut buf = encode_record(Record::stdout(1, Bytes::from_static(b"x")));
        buf[0] = 2;
        match RecordCodec.decode(&mut buf) {
            Err(Error::UnknownVersion(2)) => {}
            other => panic!("expected UnknownVersion, got {:?}", other),
        }
    }

    #[test]
    fn decode_eof_discards_partial_record() {
        let full = encode_record(Record::stdout(1, Bytes::from_static(b"abcdef")));
        let mut buf = BytesMut::from(&full[..5]);
        let mut codec = RecordCodec;
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn unknown_type_reply_layout() {
        let reply = Record::unknown_type(0x55);
        assert_eq!(reply.request_id, 0);
        assert_eq!(&reply.content[..], &[0x55, 0, 0, 0, 0, 0, 0, 0]);
    }
}
