//! Snapshot import/export: the whole graph as one binary blob.
//!
//! ```text
//! "BOXG" version:u32 len:u32 payload id*5
//! payload := count:u32 (id kind blob)*      boxes in ascending id order
//! id*5    := root, user interface, master bus, master unit, timeline
//! ```
//!
//! Equal graphs encode to equal bytes, so comparing snapshots is how a
//! mirror's convergence is checked.

use std::io::{Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::graph::BoxGraph;
use crate::model::record::split_pointers;
use crate::model::{Address, BoxId, BoxKind, FieldValues};
use crate::project::MandatoryBoxes;
use crate::update::codec::{write_record, Reader};
use crate::{Error, Result};

pub const MAGIC: &[u8; 4] = b"BOXG";
pub const VERSION: u32 = 1;

/// Smallest encoded box: id, kind, blob length and an empty field count.
const MIN_RECORD_LEN: usize = 16 + 2 + 4 + 2;

/// Encode every box of `graph` plus the mandatory handles. Only committed
/// state is encoded, so this fails while a transaction is open.
pub fn encode(graph: &BoxGraph, mandatory: &MandatoryBoxes) -> Result<Bytes> {
    if graph.in_transaction() {
        return Err(Error::TransactionOpen);
    }
    let ids = graph.sorted_ids();
    let mut payload = BytesMut::new();
    payload.put_u32_le(ids.len() as u32);
    for id in &ids {
        if let Some(record) = graph.find_box(*id) {
            write_record(&mut payload, record.id, record.kind, record.fields());
        }
    }

    let mut out = BytesMut::with_capacity(12 + payload.len() + 16 * 5);
    out.put_slice(MAGIC);
    out.put_u32_le(VERSION);
    out.put_u32_le(payload.len() as u32);
    out.put_slice(&payload);
    for id in mandatory.ids() {
        out.put_slice(id.as_bytes());
    }
    Ok(out.freeze())
}

/// Decode a snapshot into a fresh graph. Boxes are restored first and
/// pointers wired afterwards, all in one transaction.
pub fn decode(bytes: &[u8]) -> Result<(BoxGraph, MandatoryBoxes)> {
    let mut reader = Reader::new(bytes);
    let magic = reader.take(4, "magic")?;
    if magic != MAGIC {
        return Err(Error::DecodeError(format!("bad magic {magic:02x?}")));
    }
    let version = reader.u32("version")?;
    if version != VERSION {
        warn!(version, supported = VERSION, "snapshot version skew");
        return Err(Error::DecodeError(format!("unsupported snapshot version {version}")));
    }

    let mut payload = Reader::new(reader.len_prefixed("payload")?);
    let count = payload.u32("box count")?;
    let mut records: Vec<(BoxId, BoxKind, FieldValues)> =
        Vec::with_capacity(payload.capacity_for(count, MIN_RECORD_LEN));
    for _ in 0..count {
        let id = payload.id()?;
        let kind = payload.kind()?;
        let fields = payload.blob()?;
        records.push((id, kind, fields));
    }
    payload.finish("payload")?;

    let mandatory = MandatoryBoxes {
        root: reader.id()?,
        user_interface: reader.id()?,
        master_bus: reader.id()?,
        master_unit: reader.id()?,
        timeline: reader.id()?,
    };
    reader.finish("snapshot")?;

    let mut graph = BoxGraph::new();
    graph.begin();
    if let Err(e) = load(&mut graph, &records) {
        graph.rollback()?;
        return Err(e);
    }
    graph.commit()?;
    mandatory.verify(&graph)?;
    debug!(boxes = graph.box_count(), pointers = graph.pointer_count(), "snapshot decoded");
    Ok((graph, mandatory))
}

fn load(graph: &mut BoxGraph, records: &[(BoxId, BoxKind, FieldValues)]) -> Result<()> {
    let mut pointers = Vec::new();
    for (id, kind, fields) in records {
        let (plain, links) = split_pointers(fields);
        graph.restore_box(*id, *kind, &plain)?;
        pointers.extend(links.into_iter().map(|(path, target)| (Address { box_id: *id, path }, target)));
    }
    for (pointer, target) in pointers {
        graph.set_pointer(&pointer, target)?;
    }
    Ok(())
}

/// Write a snapshot to any sink.
pub fn export(graph: &BoxGraph, mandatory: &MandatoryBoxes, writer: &mut dyn Write) -> Result<()> {
    writer.write_all(&encode(graph, mandatory)?)?;
    writer.flush()?;
    Ok(())
}

/// Read a snapshot from any source.
pub fn import(reader: &mut dyn Read) -> Result<(BoxGraph, MandatoryBoxes)> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    decode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::kind::track;
    use crate::model::Value;
    use crate::project::{add_device, add_track, create_project};
    use crate::tx::BoxEditing;
    use pretty_assertions::assert_eq;

    fn sample() -> (BoxEditing, MandatoryBoxes) {
        let mut editing = BoxEditing::new(BoxGraph::new());
        let mandatory = create_project(&mut editing).unwrap();
        editing
            .modify(|e| {
                let t = add_track(e, &mandatory, "Keys")?;
                add_device(e, t, "Reverb")?;
                e.write_field(&Address::field(t, &[track::VOLUME]), Value::Float(-4.5))
            })
            .unwrap();
        (editing, mandatory)
    }

    #[test]
    fn test_roundtrip_is_byte_stable() {
        let (editing, mandatory) = sample();
        let bytes = encode(&editing, &mandatory).unwrap();
        let (graph, decoded) = decode(&bytes).unwrap();

        assert_eq!(decoded, mandatory);
        assert_eq!(graph.box_count(), editing.box_count());
        assert_eq!(graph.verify_integrity(), editing.verify_integrity());
        assert_eq!(encode(&graph, &decoded).unwrap(), bytes);
    }

    #[test]
    fn test_export_import() {
        let (editing, mandatory) = sample();
        let mut sink = Vec::new();
        export(&editing, &mandatory, &mut sink).unwrap();
        let (graph, _) = import(&mut sink.as_slice()).unwrap();
        assert_eq!(graph.pointer_count(), editing.pointer_count());
    }

    #[test]
    fn test_rejects_bad_header_and_truncation() {
        let (editing, mandatory) = sample();
        let bytes = encode(&editing, &mandatory).unwrap();

        let mut bad_magic = bytes.to_vec();
        bad_magic[0] = b'X';
        assert!(matches!(decode(&bad_magic), Err(Error::DecodeError(_))));

        let mut bad_version = bytes.to_vec();
        bad_version[4] = 9;
        assert!(matches!(decode(&bad_version), Err(Error::DecodeError(_))));

        assert!(matches!(decode(&bytes[..bytes.len() - 1]), Err(Error::DecodeError(_))));
    }

    #[test]
    fn test_box_count_beyond_payload_is_rejected() {
        let mut raw = MAGIC.to_vec();
        raw.extend_from_slice(&VERSION.to_le_bytes());
        raw.extend_from_slice(&4u32.to_le_bytes());
        raw.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(decode(&raw), Err(Error::DecodeError(_))));
    }

    #[test]
    fn test_encode_refuses_open_transaction() {
        let (mut editing, mandatory) = sample();
        let result = editing.modify(|e| {
            add_track(e, &mandatory, "Uncommitted")?;
            encode(e, &mandatory).map(|_| ())
        });
        assert!(matches!(result, Err(Error::TransactionOpen)));
        assert_eq!(editing.box_count(), 7);
        assert!(encode(&editing, &mandatory).is_ok());
    }

    #[test]
    fn test_missing_mandatory_box_is_rejected() {
        let (editing, mut mandatory) = sample();
        mandatory.master_bus = BoxId::new();
        let bytes = encode(&editing, &mandatory).unwrap();
        assert!(matches!(decode(&bytes), Err(Error::IntegrityViolation(_))));
    }
}
