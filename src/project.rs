//! Project bootstrap and the handles of the boxes every project has.

use serde::{Deserialize, Serialize};

use crate::graph::BoxGraph;
use crate::model::kind::{audio_bus, device, root, timeline, track, user_interface};
use crate::model::{Address, BoxId, BoxKind, Value};
use crate::tx::{BoxEditing, TxMode};
use crate::{Error, Result};

/// Ids of the boxes that exist in every project. Passed by value; the
/// graph itself has no notion of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MandatoryBoxes {
    pub root: BoxId,
    pub user_interface: BoxId,
    pub master_bus: BoxId,
    pub master_unit: BoxId,
    pub timeline: BoxId,
}

impl MandatoryBoxes {
    /// In snapshot order.
    pub fn ids(&self) -> [BoxId; 5] {
        [self.root, self.user_interface, self.master_bus, self.master_unit, self.timeline]
    }

    /// Check every handle resolves to a box of the expected kind.
    pub fn verify(&self, graph: &BoxGraph) -> Result<()> {
        let expected = [
            (self.root, BoxKind::Root),
            (self.user_interface, BoxKind::UserInterface),
            (self.master_bus, BoxKind::AudioBus),
            (self.master_unit, BoxKind::Track),
            (self.timeline, BoxKind::Timeline),
        ];
        for (id, kind) in expected {
            match graph.kind_of(id) {
                Some(found) if found == kind => {}
                Some(found) => {
                    return Err(Error::IntegrityViolation(format!(
                        "mandatory box {id} is a {found}, expected {kind}"
                    )));
                }
                None => {
                    return Err(Error::IntegrityViolation(format!(
                        "mandatory {kind} box {id} is missing"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Create the mandatory boxes of a new project in one transient
/// transaction (not undoable).
pub fn create_project(editing: &mut BoxEditing) -> Result<MandatoryBoxes> {
    editing.modify_with(TxMode::Transient, |e| {
        let root = e.create_box(BoxKind::Root, None)?;

        let user_interface = e.create_box(BoxKind::UserInterface, None)?;
        e.set_pointer(&Address::field(user_interface, &[user_interface::ROOT]), Address::of_box(root))?;

        let timeline = e.create_box(BoxKind::Timeline, None)?;
        e.set_pointer(&Address::field(timeline, &[timeline::ROOT]), Address::of_box(root))?;

        let master_unit = e.create_box(BoxKind::Track, None)?;
        e.set_pointer(&Address::field(master_unit, &[track::ROOT]), Address::field(root, &[root::TRACKS]))?;
        e.write_field(&Address::field(master_unit, &[track::LABEL]), Value::from("Master"))?;

        let master_bus = e.create_box(BoxKind::AudioBus, None)?;
        e.set_pointer(&Address::field(master_bus, &[audio_bus::ROOT]), Address::field(root, &[root::BUSES]))?;
        e.write_field(&Address::field(master_bus, &[audio_bus::LABEL]), Value::from("Master"))?;
        e.set_pointer(
            &Address::field(master_bus, &[audio_bus::OUTPUT]),
            Address::field(master_unit, &[track::INPUT]),
        )?;

        Ok(MandatoryBoxes { root, user_interface, master_bus, master_unit, timeline })
    })
}

/// Add a track routed into the master bus. Call inside a transaction.
pub fn add_track(graph: &mut BoxGraph, mandatory: &MandatoryBoxes, label: &str) -> Result<BoxId> {
    let tracks = Address::field(mandatory.root, &[root::TRACKS]);
    let index = graph.incoming(&tracks).len() as i32;
    let id = graph.create_box(BoxKind::Track, None)?;
    graph.set_pointer(&Address::field(id, &[track::ROOT]), tracks)?;
    graph.set_pointer(
        &Address::field(id, &[track::OUTPUT]),
        Address::field(mandatory.master_bus, &[audio_bus::INPUT]),
    )?;
    graph.write_field(&Address::field(id, &[track::LABEL]), Value::from(label))?;
    graph.write_field(&Address::field(id, &[track::INDEX]), Value::Int(index))?;
    Ok(id)
}

/// Append a device to a track's chain. Call inside a transaction.
pub fn add_device(graph: &mut BoxGraph, track_id: BoxId, label: &str) -> Result<BoxId> {
    let devices = Address::field(track_id, &[track::DEVICES]);
    let index = graph.incoming(&devices).len() as i32;
    let id = graph.create_box(BoxKind::Device, None)?;
    graph.set_pointer(&Address::field(id, &[device::HOST]), devices)?;
    graph.write_field(&Address::field(id, &[device::LABEL]), Value::from(label))?;
    graph.write_field(&Address::field(id, &[device::INDEX]), Value::Int(index))?;
    Ok(id)
}
