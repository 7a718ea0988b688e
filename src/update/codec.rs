//! Binary encoding of updates and batches.
//!
//! Little-endian throughout. Layout:
//!
//! ```text
//! update   := tag:u8 payload
//! id       := 16 bytes
//! kind     := u16
//! path     := depth:u8 key:u16*
//! address  := id path
//! opt_addr := present:u8 address?
//! value    := payload per ValueType; string/bytes are u32-length-prefixed
//! blob     := len:u32 count:u16 (path slot_tag:u8 slot)*
//! batch    := tx_id:u64 count:u32 (len:u32 update)*
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::model::{Address, BoxId, BoxKind, FieldPath, FieldValue, FieldValues, Value, ValueType};
use crate::tx::{Transaction, TxId};
use crate::{Error, Result};

use super::Update;

const SLOT_PRIMITIVE: u8 = 0;
const SLOT_POINTER: u8 = 1;

// ============================================================================
// Encoding
// ============================================================================

fn put_id(out: &mut BytesMut, id: BoxId) {
    out.put_slice(id.as_bytes());
}

fn put_path(out: &mut BytesMut, path: &[u16]) {
    debug_assert!(path.len() <= u8::MAX as usize);
    out.put_u8(path.len() as u8);
    for key in path {
        out.put_u16_le(*key);
    }
}

fn put_address(out: &mut BytesMut, address: &Address) {
    put_id(out, address.box_id);
    put_path(out, &address.path);
}

fn put_opt_address(out: &mut BytesMut, address: Option<&Address>) {
    match address {
        Some(a) => {
            out.put_u8(1);
            put_address(out, a);
        }
        None => out.put_u8(0),
    }
}

fn put_len_prefixed(out: &mut BytesMut, bytes: &[u8]) {
    out.put_u32_le(bytes.len() as u32);
    out.put_slice(bytes);
}

fn put_payload(out: &mut BytesMut, value: &Value) {
    match value {
        Value::Bool(b) => out.put_u8(u8::from(*b)),
        Value::Int(i) => out.put_i32_le(*i),
        Value::Float(f) => out.put_f32_le(*f),
        Value::String(s) => put_len_prefixed(out, s.as_bytes()),
        Value::Bytes(b) => put_len_prefixed(out, b),
    }
}

fn put_blob(out: &mut BytesMut, fields: &FieldValues) {
    let mut body = BytesMut::new();
    body.put_u16_le(fields.len() as u16);
    for (path, value) in fields {
        put_path(&mut body, path);
        match value {
            FieldValue::Primitive(v) => {
                body.put_u8(SLOT_PRIMITIVE);
                body.put_u8(v.value_type().tag());
                put_payload(&mut body, v);
            }
            FieldValue::Pointer(target) => {
                body.put_u8(SLOT_POINTER);
                put_opt_address(&mut body, target.as_ref());
            }
        }
    }
    put_len_prefixed(out, &body);
}

pub(crate) fn write_update(out: &mut BytesMut, update: &Update) {
    out.put_u8(update.tag());
    match update {
        Update::Create { id, kind, fields } | Update::Delete { id, kind, fields } => {
            put_id(out, *id);
            out.put_u16_le(kind.tag());
            put_blob(out, fields);
        }
        Update::Primitive { address, old, new } => {
            debug_assert_eq!(old.value_type(), new.value_type());
            put_address(out, address);
            out.put_u8(new.value_type().tag());
            put_payload(out, old);
            put_payload(out, new);
        }
        Update::Pointer { address, old, new } => {
            put_address(out, address);
            put_opt_address(out, old.as_ref());
            put_opt_address(out, new.as_ref());
        }
    }
}

pub(crate) fn write_record(out: &mut BytesMut, id: BoxId, kind: BoxKind, fields: &FieldValues) {
    put_id(out, id);
    out.put_u16_le(kind.tag());
    put_blob(out, fields);
}

pub fn encode_update(update: &Update) -> Bytes {
    let mut out = BytesMut::new();
    write_update(&mut out, update);
    out.freeze()
}

/// Encode a committed transaction as one length-framed batch.
pub fn encode_batch(tx: &Transaction) -> Bytes {
    let mut out = BytesMut::with_capacity(12 + tx.updates.len() * 48);
    out.put_u64_le(tx.id.0);
    out.put_u32_le(tx.updates.len() as u32);
    let mut message = BytesMut::new();
    for update in &tx.updates {
        message.clear();
        write_update(&mut message, update);
        put_len_prefixed(&mut out, &message);
    }
    out.freeze()
}

// ============================================================================
// Decoding
// ============================================================================

/// Bounds-checked cursor over an input slice.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn ensure(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.len() < n {
            return Err(Error::DecodeError(format!(
                "truncated {what}: need {n} bytes, have {}",
                self.buf.len()
            )));
        }
        Ok(())
    }

    /// Capacity for `count` items of at least `min_len` bytes each, never
    /// more than the remaining input could hold.
    pub(crate) fn capacity_for(&self, count: u32, min_len: usize) -> usize {
        (count as usize).min(self.buf.len() / min_len)
    }

    pub(crate) fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        self.ensure(n, what)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub(crate) fn u8(&mut self, what: &str) -> Result<u8> {
        self.ensure(1, what)?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn u16(&mut self, what: &str) -> Result<u16> {
        self.ensure(2, what)?;
        Ok(self.buf.get_u16_le())
    }

    pub(crate) fn u32(&mut self, what: &str) -> Result<u32> {
        self.ensure(4, what)?;
        Ok(self.buf.get_u32_le())
    }

    pub(crate) fn u64(&mut self, what: &str) -> Result<u64> {
        self.ensure(8, what)?;
        Ok(self.buf.get_u64_le())
    }

    pub(crate) fn len_prefixed(&mut self, what: &str) -> Result<&'a [u8]> {
        let len = self.u32(what)? as usize;
        self.take(len, what)
    }

    pub(crate) fn id(&mut self) -> Result<BoxId> {
        let bytes = self.take(16, "box id")?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(bytes);
        Ok(BoxId::from_bytes(raw))
    }

    pub(crate) fn kind(&mut self) -> Result<BoxKind> {
        let tag = self.u16("box kind")?;
        BoxKind::from_tag(tag).ok_or_else(|| Error::DecodeError(format!("unknown box kind {tag}")))
    }

    fn path(&mut self) -> Result<FieldPath> {
        let depth = self.u8("path depth")?;
        let mut path = FieldPath::with_capacity(depth as usize);
        for _ in 0..depth {
            path.push(self.u16("field key")?);
        }
        Ok(path)
    }

    fn address(&mut self) -> Result<Address> {
        let box_id = self.id()?;
        let path = self.path()?;
        Ok(Address { box_id, path })
    }

    fn opt_address(&mut self) -> Result<Option<Address>> {
        match self.u8("address flag")? {
            0 => Ok(None),
            1 => Ok(Some(self.address()?)),
            flag => Err(Error::DecodeError(format!("bad address flag {flag}"))),
        }
    }

    fn value_type(&mut self) -> Result<ValueType> {
        let tag = self.u8("value type")?;
        ValueType::from_tag(tag).ok_or_else(|| Error::DecodeError(format!("unknown value type {tag}")))
    }

    fn payload(&mut self, ty: ValueType) -> Result<Value> {
        Ok(match ty {
            ValueType::Bool => Value::Bool(self.u8("bool")? != 0),
            ValueType::Int => Value::Int(self.u32("int")? as i32),
            ValueType::Float => Value::Float(f32::from_bits(self.u32("float")?)),
            ValueType::String => {
                let raw = self.len_prefixed("string")?;
                let s = std::str::from_utf8(raw)
                    .map_err(|e| Error::DecodeError(format!("invalid utf-8: {e}")))?;
                Value::String(s.to_owned())
            }
            ValueType::Bytes => Value::Bytes(self.len_prefixed("bytes")?.to_vec()),
        })
    }

    pub(crate) fn blob(&mut self) -> Result<FieldValues> {
        let mut inner = Reader::new(self.len_prefixed("field blob")?);
        let count = inner.u16("field count")?;
        let mut fields = FieldValues::new();
        for _ in 0..count {
            let path = inner.path()?;
            let value = match inner.u8("slot tag")? {
                SLOT_PRIMITIVE => {
                    let ty = inner.value_type()?;
                    FieldValue::Primitive(inner.payload(ty)?)
                }
                SLOT_POINTER => FieldValue::Pointer(inner.opt_address()?),
                tag => return Err(Error::DecodeError(format!("unknown slot tag {tag}"))),
            };
            fields.insert(path, value);
        }
        inner.finish("field blob")?;
        Ok(fields)
    }

    fn update(&mut self) -> Result<Update> {
        let tag = self.u8("update tag")?;
        Ok(match tag {
            Update::TAG_CREATE | Update::TAG_DELETE => {
                let id = self.id()?;
                let kind = self.kind()?;
                let fields = self.blob()?;
                if tag == Update::TAG_CREATE {
                    Update::Create { id, kind, fields }
                } else {
                    Update::Delete { id, kind, fields }
                }
            }
            Update::TAG_PRIMITIVE => {
                let address = self.address()?;
                let ty = self.value_type()?;
                let old = self.payload(ty)?;
                let new = self.payload(ty)?;
                Update::Primitive { address, old, new }
            }
            Update::TAG_POINTER => {
                let address = self.address()?;
                let old = self.opt_address()?;
                let new = self.opt_address()?;
                Update::Pointer { address, old, new }
            }
            other => return Err(Error::UnknownUpdateKind(other)),
        })
    }

    pub(crate) fn finish(&self, what: &str) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(Error::DecodeError(format!("{} trailing bytes after {what}", self.buf.len())))
        }
    }
}

/// Decode exactly one update; trailing bytes are an error.
pub fn decode_update(bytes: &[u8]) -> Result<Update> {
    let mut reader = Reader::new(bytes);
    let update = reader.update()?;
    reader.finish("update")?;
    Ok(update)
}

/// A decoded batch. Messages that failed to decode are reported in
/// `rejected` and skipped; the rest keep their order.
#[derive(Debug)]
pub struct DecodedBatch {
    pub tx_id: TxId,
    pub updates: Vec<Update>,
    pub rejected: Vec<Error>,
}

/// Decode a batch. Broken framing fails the whole batch; a broken message
/// only fails itself.
pub fn decode_batch(bytes: &[u8]) -> Result<DecodedBatch> {
    let mut reader = Reader::new(bytes);
    let tx_id = TxId(reader.u64("batch tx id")?);
    let count = reader.u32("batch count")?;
    // length prefix plus tag
    let mut updates = Vec::with_capacity(reader.capacity_for(count, 5));
    let mut rejected = Vec::new();
    for _ in 0..count {
        let message = reader.len_prefixed("batch message")?;
        match decode_update(message) {
            Ok(update) => updates.push(update),
            Err(e) => rejected.push(e),
        }
    }
    reader.finish("batch")?;
    Ok(DecodedBatch { tx_id, updates, rejected })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::kind::{device, track};
    use crate::model::BoxRecord;
    use crate::tx::TxMode;
    use pretty_assertions::assert_eq;

    fn sample_updates() -> Vec<Update> {
        let track_id = BoxId::new();
        let device_id = BoxId::new();
        vec![
            Update::Create {
                id: track_id,
                kind: BoxKind::Track,
                fields: BoxRecord::new(track_id, BoxKind::Track).fields().clone(),
            },
            Update::Primitive {
                address: Address::field(track_id, &[track::LABEL]),
                old: Value::from("Track"),
                new: Value::from("Drums"),
            },
            Update::Primitive {
                address: Address::field(device_id, &[device::STATE]),
                old: Value::Bytes(vec![]),
                new: Value::Bytes(vec![1, 2, 3]),
            },
            Update::Pointer {
                address: Address::field(device_id, &[device::HOST]),
                old: None,
                new: Some(Address::field(track_id, &[track::DEVICES])),
            },
        ]
    }

    #[test]
    fn test_update_roundtrip() {
        for update in sample_updates() {
            let bytes = encode_update(&update);
            assert_eq!(decode_update(&bytes).unwrap(), update);
        }
    }

    #[test]
    fn test_pointer_update_layout() {
        let id = BoxId::from_bytes([7u8; 16]);
        let update = Update::Pointer { address: Address::field(id, &[1]), old: None, new: None };
        let bytes = encode_update(&update);
        // tag + id + depth + key + two absent flags
        assert_eq!(bytes.len(), 1 + 16 + 1 + 2 + 1 + 1);
        assert_eq!(bytes[0], Update::TAG_POINTER);
        assert_eq!(&bytes[17..20], &[1, 1, 0]);
    }

    #[test]
    fn test_unknown_tag() {
        let err = decode_update(&[9, 0, 0]).unwrap_err();
        assert!(matches!(err, Error::UnknownUpdateKind(9)));
    }

    #[test]
    fn test_truncated_update() {
        let bytes = encode_update(&sample_updates()[0]);
        let err = decode_update(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, Error::DecodeError(_)));
    }

    #[test]
    fn test_batch_skips_bad_message() {
        let tx = Transaction::new(TxId(42), TxMode::Recorded, sample_updates());
        let mut raw = BytesMut::from(&encode_batch(&tx)[..]);
        // corrupt the tag of the first message (after tx id, count, length)
        raw[8 + 4 + 4] = 0xEE;

        let batch = decode_batch(&raw).unwrap();
        assert_eq!(batch.tx_id, TxId(42));
        assert_eq!(batch.updates.len(), 3);
        assert_eq!(batch.rejected.len(), 1);
        assert!(matches!(batch.rejected[0], Error::UnknownUpdateKind(0xEE)));
        assert_eq!(batch.updates[..], tx.updates[1..]);
    }

    #[test]
    fn test_batch_bad_framing_is_fatal() {
        let tx = Transaction::new(TxId(1), TxMode::Recorded, sample_updates());
        let bytes = encode_batch(&tx);
        assert!(decode_batch(&bytes[..bytes.len() - 3]).is_err());
        assert!(decode_batch(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_batch_count_beyond_input_is_rejected() {
        let mut raw = vec![0u8; 8];
        raw.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(decode_batch(&raw), Err(Error::DecodeError(_))));

        // one real message, but the header claims a million
        let tx = Transaction::new(TxId(9), TxMode::Recorded, sample_updates()[1..2].to_vec());
        let mut raw = encode_batch(&tx).to_vec();
        raw[8..12].copy_from_slice(&1_000_000u32.to_le_bytes());
        assert!(matches!(decode_batch(&raw), Err(Error::DecodeError(_))));
    }
}
