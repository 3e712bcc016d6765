//! # Wire Encoding
//!
//! Frame transport and payload encoding for the request/response protocol.
//! Every message is exactly two frames; a frame is a little-endian `u32`
//! length prefix followed by that many bytes. Payloads use field-ordered
//! little-endian integers, length-prefixed UTF-8 strings, count-prefixed
//! lists, and an LEB128 varint for the request-kind header.

use crate::diff::{Diff, Op, OpKind, Provenance};
use crate::document::{Document, FieldPath};
use crate::error::{ErrorKind, ReconcileError, Result};
use crate::model::{ChangeNotification, DiffId, OpId};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single frame; anything larger is a protocol error.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub const TAG_NOTIFY: u64 = 0;
pub const TAG_LIST_CONFLICTS: u64 = 1;
pub const TAG_RESOLVE: u64 = 2;
pub const TAG_FLUSH_WORK_QUEUE: u64 = 3;

/// Length-prefixed frame transport.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<Bytes>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes(src[..4].try_into().unwrap()) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds limit"),
            ));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> std::io::Result<()> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "frame exceeds limit",
            ));
        }
        dst.reserve(4 + item.len());
        dst.put_u32_le(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Append-only payload builder.
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64_le(value);
    }

    /// LEB128 unsigned varint.
    pub fn put_varint(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.put_u8(byte);
                return;
            }
            self.buf.put_u8(byte | 0x80);
        }
    }

    pub fn put_string(&mut self, value: &str) {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn put_count(&mut self, count: usize) {
        self.put_u32(count as u32);
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Cursor over a received payload. Every failure is an `InvalidMessage`.
#[derive(Debug)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, bytes: usize) -> Result<()> {
        if self.buf.len() < bytes {
            return Err(ReconcileError::InvalidMessage(format!(
                "payload truncated: wanted {bytes} more bytes, had {}",
                self.buf.len()
            )));
        }
        Ok(())
    }

    pub fn take_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let value = self.buf[0];
        self.buf = &self.buf[1..];
        Ok(value)
    }

    pub fn take_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        let value = u32::from_le_bytes(self.buf[..4].try_into().unwrap());
        self.buf = &self.buf[4..];
        Ok(value)
    }

    pub fn take_u64(&mut self) -> Result<u64> {
        self.need(8)?;
        let value = u64::from_le_bytes(self.buf[..8].try_into().unwrap());
        self.buf = &self.buf[8..];
        Ok(value)
    }

    pub fn take_varint(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.take_u8()?;
            if shift >= 64 {
                return Err(ReconcileError::InvalidMessage(
                    "varint overflows 64 bits".to_string(),
                ));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    pub fn take_string(&mut self) -> Result<String> {
        let len = self.take_u32()? as usize;
        self.need(len)?;
        let text = std::str::from_utf8(&self.buf[..len])
            .map_err(|_| ReconcileError::InvalidMessage("string is not UTF-8".to_string()))?
            .to_string();
        self.buf = &self.buf[len..];
        Ok(text)
    }

    pub fn take_count(&mut self) -> Result<usize> {
        Ok(self.take_u32()? as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Reject trailing bytes after a fully-decoded payload.
    pub fn expect_end(&self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(ReconcileError::InvalidMessage(format!(
                "{} trailing bytes after payload",
                self.buf.len()
            )))
        }
    }
}

pub fn put_path(writer: &mut PayloadWriter, path: &FieldPath) {
    writer.put_count(path.segments().len());
    for segment in path.segments() {
        writer.put_string(segment);
    }
}

pub fn take_path(reader: &mut PayloadReader<'_>) -> Result<FieldPath> {
    let count = reader.take_count()?;
    let mut segments = Vec::with_capacity(count);
    for _ in 0..count {
        segments.push(reader.take_string()?);
    }
    FieldPath::new(segments).map_err(|err| ReconcileError::InvalidMessage(err.to_string()))
}

pub fn put_document(writer: &mut PayloadWriter, doc: &Document) {
    writer.put_count(doc.len());
    for (path, value) in doc.iter() {
        put_path(writer, path);
        writer.put_string(value);
    }
}

pub fn take_document(reader: &mut PayloadReader<'_>) -> Result<Document> {
    let count = reader.take_count()?;
    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        let path = take_path(reader)?;
        let value = reader.take_string()?;
        fields.push((path, value));
    }
    Ok(Document::from_fields(fields))
}

const OP_INSERT: u8 = 0;
const OP_DELETE: u8 = 1;
const OP_REPLACE: u8 = 2;

pub fn put_op(writer: &mut PayloadWriter, op: &Op) {
    match &op.kind {
        OpKind::Insert { value } => {
            writer.put_u8(OP_INSERT);
            put_path(writer, &op.path);
            writer.put_string(value);
        }
        OpKind::Delete => {
            writer.put_u8(OP_DELETE);
            put_path(writer, &op.path);
        }
        OpKind::Replace { old, new } => {
            writer.put_u8(OP_REPLACE);
            put_path(writer, &op.path);
            writer.put_string(old);
            writer.put_string(new);
        }
    }
    match &op.source {
        Some(source) => {
            writer.put_u8(1);
            writer.put_string(source);
        }
        None => writer.put_u8(0),
    }
}

pub fn take_op(reader: &mut PayloadReader<'_>) -> Result<Op> {
    let tag = reader.take_u8()?;
    let path = take_path(reader)?;
    let kind = match tag {
        OP_INSERT => OpKind::Insert {
            value: reader.take_string()?,
        },
        OP_DELETE => OpKind::Delete,
        OP_REPLACE => OpKind::Replace {
            old: reader.take_string()?,
            new: reader.take_string()?,
        },
        other => {
            return Err(ReconcileError::InvalidMessage(format!(
                "unknown op tag {other}"
            )))
        }
    };
    let source = match reader.take_u8()? {
        0 => None,
        1 => Some(reader.take_string()?),
        other => {
            return Err(ReconcileError::InvalidMessage(format!(
                "bad option tag {other}"
            )))
        }
    };
    Ok(Op { path, kind, source })
}

const LABEL_SOURCE: u8 = 0;
const LABEL_DELETED: u8 = 1;
const LABEL_MERGED: u8 = 2;
const LABEL_RESOLVED: u8 = 3;

pub fn put_provenance(writer: &mut PayloadWriter, label: &Provenance) {
    match label {
        Provenance::Source(name) => {
            writer.put_u8(LABEL_SOURCE);
            writer.put_string(name);
        }
        Provenance::Deleted(name) => {
            writer.put_u8(LABEL_DELETED);
            writer.put_string(name);
        }
        Provenance::Merged => writer.put_u8(LABEL_MERGED),
        Provenance::Resolved => writer.put_u8(LABEL_RESOLVED),
    }
}

pub fn take_provenance(reader: &mut PayloadReader<'_>) -> Result<Provenance> {
    match reader.take_u8()? {
        LABEL_SOURCE => Ok(Provenance::Source(reader.take_string()?)),
        LABEL_DELETED => Ok(Provenance::Deleted(reader.take_string()?)),
        LABEL_MERGED => Ok(Provenance::Merged),
        LABEL_RESOLVED => Ok(Provenance::Resolved),
        other => Err(ReconcileError::InvalidMessage(format!(
            "unknown label tag {other}"
        ))),
    }
}

pub fn put_diff(writer: &mut PayloadWriter, diff: &Diff) {
    put_provenance(writer, &diff.label);
    writer.put_count(diff.ops.len());
    for op in &diff.ops {
        put_op(writer, op);
    }
}

pub fn take_diff(reader: &mut PayloadReader<'_>) -> Result<Diff> {
    let label = take_provenance(reader)?;
    let count = reader.take_count()?;
    let mut ops = Vec::with_capacity(count);
    for _ in 0..count {
        ops.push(take_op(reader)?);
    }
    Ok(Diff::new(label, ops))
}

/// A client request, one of the four protocol operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Notify(ChangeNotification),
    ListConflicts,
    Resolve { diff: DiffId, ops: Vec<OpId> },
    FlushWorkQueue,
}

impl Request {
    pub fn tag(&self) -> u64 {
        match self {
            Request::Notify(_) => TAG_NOTIFY,
            Request::ListConflicts => TAG_LIST_CONFLICTS,
            Request::Resolve { .. } => TAG_RESOLVE,
            Request::FlushWorkQueue => TAG_FLUSH_WORK_QUEUE,
        }
    }

    /// Encode as the two message frames: header then body.
    pub fn encode(&self) -> (Bytes, Bytes) {
        let mut header = PayloadWriter::new();
        header.put_varint(self.tag());
        let mut body = PayloadWriter::new();
        match self {
            Request::Notify(change) => {
                body.put_string(&change.entity);
                body.put_string(&change.source);
                body.put_string(&change.foreign_id);
            }
            Request::ListConflicts | Request::FlushWorkQueue => {}
            Request::Resolve { diff, ops } => {
                body.put_u64(diff.0);
                body.put_count(ops.len());
                for op in ops {
                    body.put_u32(op.0);
                }
            }
        }
        (header.finish(), body.finish())
    }

    pub fn decode(header: &[u8], body: &[u8]) -> Result<Self> {
        let mut header = PayloadReader::new(header);
        let tag = header.take_varint()?;
        header.expect_end()?;

        let mut reader = PayloadReader::new(body);
        let request = match tag {
            TAG_NOTIFY => {
                let entity = reader.take_string()?;
                let source = reader.take_string()?;
                let foreign_id = reader.take_string()?;
                Request::Notify(ChangeNotification {
                    entity,
                    source,
                    foreign_id,
                })
            }
            TAG_LIST_CONFLICTS => Request::ListConflicts,
            TAG_RESOLVE => {
                let diff = DiffId(reader.take_u64()?);
                let count = reader.take_count()?;
                let mut ops = Vec::with_capacity(count);
                for _ in 0..count {
                    ops.push(OpId(reader.take_u32()?));
                }
                Request::Resolve { diff, ops }
            }
            TAG_FLUSH_WORK_QUEUE => Request::FlushWorkQueue,
            other => {
                return Err(ReconcileError::InvalidMessage(format!(
                    "unknown request tag {other}"
                )))
            }
        };
        reader.expect_end()?;
        Ok(request)
    }
}

/// One outstanding conflict as reported by `ListConflicts`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictEntry {
    pub diff: DiffId,
    pub baseline: Document,
    pub applied: Diff,
    /// Rejected operations in recorded order; each op carries its source tag.
    pub rejected: Vec<(OpId, Op)>,
}

/// Successful response payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Empty,
    Conflicts(Vec<ConflictEntry>),
    Flushed(u64),
}

/// Encode a response as its two frames: success flag then body.
pub fn encode_response(result: &Result<ResponseBody>) -> (Bytes, Bytes) {
    match result {
        Ok(body) => {
            let mut writer = PayloadWriter::new();
            match body {
                ResponseBody::Empty => {}
                ResponseBody::Flushed(count) => writer.put_u64(*count),
                ResponseBody::Conflicts(entries) => {
                    writer.put_count(entries.len());
                    for entry in entries {
                        writer.put_u64(entry.diff.0);
                        put_document(&mut writer, &entry.baseline);
                        put_diff(&mut writer, &entry.applied);
                        writer.put_count(entry.rejected.len());
                        for (id, op) in &entry.rejected {
                            writer.put_u32(id.0);
                            put_op(&mut writer, op);
                        }
                    }
                }
            }
            (Bytes::from_static(&[0x01]), writer.finish())
        }
        Err(err) => {
            let mut writer = PayloadWriter::new();
            writer.put_u8(err.kind().as_u8());
            writer.put_string(&err.to_string());
            (Bytes::from_static(&[0x00]), writer.finish())
        }
    }
}

/// Decode the success-flag frame.
pub fn decode_flag(frame: &[u8]) -> Result<bool> {
    match frame {
        [0x01] => Ok(true),
        [0x00] => Ok(false),
        _ => Err(ReconcileError::InvalidMessage(
            "bad success flag frame".to_string(),
        )),
    }
}

/// Decode an error body back into its public kind.
pub fn decode_error(body: &[u8]) -> ReconcileError {
    let mut reader = PayloadReader::new(body);
    let decoded = (|| -> Result<ReconcileError> {
        let kind = ErrorKind::from_u8(reader.take_u8()?).ok_or_else(|| {
            ReconcileError::InvalidMessage("unknown error kind".to_string())
        })?;
        let message = reader.take_string()?;
        Ok(kind.with_message(message))
    })();
    decoded.unwrap_or_else(|err| err)
}

pub fn decode_empty(body: &[u8]) -> Result<()> {
    PayloadReader::new(body).expect_end()
}

pub fn decode_flushed(body: &[u8]) -> Result<u64> {
    let mut reader = PayloadReader::new(body);
    let count = reader.take_u64()?;
    reader.expect_end()?;
    Ok(count)
}

pub fn decode_conflicts(body: &[u8]) -> Result<Vec<ConflictEntry>> {
    let mut reader = PayloadReader::new(body);
    let count = reader.take_count()?;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let diff = DiffId(reader.take_u64()?);
        let baseline = take_document(&mut reader)?;
        let applied = take_diff(&mut reader)?;
        let rejected_count = reader.take_count()?;
        let mut rejected = Vec::with_capacity(rejected_count);
        for _ in 0..rejected_count {
            let id = OpId(reader.take_u32()?);
            let op = take_op(&mut reader)?;
            rejected.push((id, op));
        }
        entries.push(ConflictEntry {
            diff,
            baseline,
            applied,
            rejected,
        });
    }
    reader.expect_end()?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::doc;

    #[test]
    fn test_varint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, 16384, u64::MAX] {
            let mut writer = PayloadWriter::new();
            writer.put_varint(value);
            let bytes = writer.finish();
            let mut reader = PayloadReader::new(&bytes);
            assert_eq!(reader.take_varint().unwrap(), value);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn test_single_byte_tags() {
        let mut writer = PayloadWriter::new();
        writer.put_varint(TAG_FLUSH_WORK_QUEUE);
        assert_eq!(writer.finish().as_ref(), &[0x03]);
    }

    #[test]
    fn test_document_round_trip() {
        let original = doc(&[("name", "Alice"), ("address.city", "Oslo"), ("note", "")]);
        let mut writer = PayloadWriter::new();
        put_document(&mut writer, &original);
        let bytes = writer.finish();
        let mut reader = PayloadReader::new(&bytes);
        assert_eq!(take_document(&mut reader).unwrap(), original);
    }

    #[test]
    fn test_diff_round_trip() {
        let base = doc(&[("a", "1"), ("b", "2")]);
        let next = doc(&[("a", "9"), ("c", "3")]);
        let original = crate::diff::diff(&base, &next, Provenance::Source("acct".to_string()));
        let mut writer = PayloadWriter::new();
        put_diff(&mut writer, &original);
        let bytes = writer.finish();
        let mut reader = PayloadReader::new(&bytes);
        assert_eq!(take_diff(&mut reader).unwrap(), original);
    }

    #[test]
    fn test_request_round_trips() {
        let requests = [
            Request::Notify(ChangeNotification::new("customer", "acct", "A1")),
            Request::ListConflicts,
            Request::Resolve {
                diff: DiffId(7),
                ops: vec![OpId(0), OpId(3)],
            },
            Request::FlushWorkQueue,
        ];
        for request in requests {
            let (header, body) = request.encode();
            assert_eq!(Request::decode(&header, &body).unwrap(), request);
        }
    }

    #[test]
    fn test_unknown_tag_is_invalid_message() {
        let mut header = PayloadWriter::new();
        header.put_varint(9);
        let err = Request::decode(&header.finish(), &[]).unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidMessage(_)));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let (header, _) = Request::FlushWorkQueue.encode();
        let err = Request::decode(&header, &[0xff]).unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidMessage(_)));
    }

    #[test]
    fn test_truncated_body_rejected() {
        let (header, body) = Request::Notify(ChangeNotification::new("e", "s", "f")).encode();
        let err = Request::decode(&header, &body[..body.len() - 1]).unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidMessage(_)));
    }

    #[test]
    fn test_error_response_round_trip() {
        let failure: Result<ResponseBody> =
            Err(ReconcileError::UnknownEntity("order".to_string()));
        let (flag, body) = encode_response(&failure);
        assert!(!decode_flag(&flag).unwrap());
        let decoded = decode_error(&body);
        assert!(matches!(decoded, ReconcileError::UnknownEntity(_)));
    }

    #[test]
    fn test_flush_response_round_trip() {
        let (flag, body) = encode_response(&Ok(ResponseBody::Flushed(25)));
        assert!(decode_flag(&flag).unwrap());
        assert_eq!(decode_flushed(&body).unwrap(), 25);
    }

    #[test]
    fn test_conflict_response_round_trip() {
        let baseline = doc(&[("name", "Alice")]);
        let applied = Diff::new(
            Provenance::Merged,
            vec![Op::insert(
                crate::document::FieldPath::parse("name").unwrap(),
                "Alice",
            )],
        );
        let rejected = vec![
            (
                OpId(0),
                Op::insert(crate::document::FieldPath::parse("tier").unwrap(), "gold")
                    .tagged("acct"),
            ),
            (
                OpId(1),
                Op::insert(crate::document::FieldPath::parse("tier").unwrap(), "silver")
                    .tagged("users"),
            ),
        ];
        let entry = ConflictEntry {
            diff: DiffId(4),
            baseline,
            applied,
            rejected,
        };
        let (flag, body) = encode_response(&Ok(ResponseBody::Conflicts(vec![entry.clone()])));
        assert!(decode_flag(&flag).unwrap());
        assert_eq!(decode_conflicts(&body).unwrap(), vec![entry]);
    }

    #[test]
    fn test_frame_codec_round_trip() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"hello"), &mut buf)
            .unwrap();
        codec.encode(Bytes::from_static(b""), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().as_ref(), b"hello");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().as_ref(), b"");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_frame_codec_waits_for_full_frame() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u32_le(10);
        buf.extend_from_slice(b"part");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"ialone");
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap().as_ref(),
            b"partialone"
        );
    }
}
