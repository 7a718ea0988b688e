//! End-to-end tests for processing order on a mirror graph.

use pretty_assertions::assert_eq;

use boxgraph::config::SyncConfig;
use boxgraph::model::kind::{device, track};
use boxgraph::project::{add_device, add_track, create_project};
use boxgraph::scheduler::sort;
use boxgraph::{
    Address, BoxEditing, BoxGraph, BoxId, Error, MandatoryBoxes, ProcessingScheduler, ProcessorKind,
    SyncSource, SyncTarget,
};

struct Rig {
    editing: BoxEditing,
    mandatory: MandatoryBoxes,
    mirror: SyncTarget,
    scheduler: ProcessingScheduler,
}

impl Rig {
    fn new() -> Self {
        let mut editing = BoxEditing::new(BoxGraph::new());
        let mandatory = create_project(&mut editing).unwrap();
        let source = SyncSource::new();
        editing.subscribe(source.clone());
        let mirror = source.attach(&editing, &mandatory, SyncConfig::default()).unwrap();
        Self { editing, mandatory, mirror, scheduler: ProcessingScheduler::new() }
    }

    /// What the engine does once per block.
    fn block(&mut self) -> Vec<BoxId> {
        let report = self.mirror.drain();
        if report.snapshot_loaded {
            self.scheduler.invalidate();
        }
        self.scheduler.observe_all(&report.updates, self.mirror.graph());
        self.scheduler.order(self.mirror.graph()).iter().map(|p| p.id).collect()
    }
}

fn before(order: &[BoxId], a: BoxId, b: BoxId) -> bool {
    let pos = |id| order.iter().position(|x| *x == id).unwrap();
    pos(a) < pos(b)
}

#[test]
fn test_sidechain_orders_source_before_consumer() {
    let mut rig = Rig::new();
    let mandatory = rig.mandatory;
    let (a, b, d) = rig
        .editing
        .modify(|e| {
            let a = add_track(e, &mandatory, "Kick")?;
            let b = add_track(e, &mandatory, "Bass")?;
            let d = add_device(e, a, "Ducker")?;
            e.set_pointer(&Address::field(d, &[device::SIDECHAIN]), Address::of_box(b))?;
            Ok((a, b, d))
        })
        .unwrap();

    let order = rig.block();
    assert_eq!(order.len(), 5);
    assert!(before(&order, b, d));
    assert!(before(&order, d, a));
    assert!(before(&order, a, mandatory.master_bus));
    assert!(before(&order, b, mandatory.master_bus));
    assert!(before(&order, mandatory.master_bus, mandatory.master_unit));
}

#[test]
fn test_rejected_cycle_leaves_order_untouched() {
    let mut rig = Rig::new();
    let mandatory = rig.mandatory;
    let (a, b) = rig
        .editing
        .modify(|e| {
            let a = add_track(e, &mandatory, "Kick")?;
            let b = add_track(e, &mandatory, "Bass")?;
            let d = add_device(e, a, "Ducker")?;
            e.set_pointer(&Address::field(d, &[device::SIDECHAIN]), Address::of_box(b))?;
            Ok((a, b))
        })
        .unwrap();
    let order = rig.block();
    let generation = rig.scheduler.generation();

    // a device on the bass keyed from the kick closes kick -> gate -> bass -> ducker -> kick
    let err = rig
        .editing
        .modify(|e| {
            let gate = add_device(e, b, "Gate")?;
            e.set_pointer(&Address::field(gate, &[device::SIDECHAIN]), Address::of_box(a))
        })
        .unwrap_err();
    assert!(matches!(err, Error::CycleDetected { .. }));

    assert_eq!(rig.block(), order);
    assert_eq!(rig.scheduler.generation(), generation);
    assert!(!rig.scheduler.is_dirty());
}

#[test]
fn test_parameter_edits_do_not_resort() {
    let mut rig = Rig::new();
    let mandatory = rig.mandatory;
    let t = rig.editing.modify(|e| add_track(e, &mandatory, "Pad")).unwrap();
    rig.block();
    let generation = rig.scheduler.generation();

    for step in 0..10 {
        rig.editing
            .modify(|e| e.write_field(&Address::field(t, &[track::VOLUME]), (-(step as f32)).into()))
            .unwrap();
        rig.editing
            .modify(|e| e.write_field(&Address::field(t, &[track::MUTE]), (step % 2 == 0).into()))
            .unwrap();
    }
    rig.block();
    assert_eq!(rig.scheduler.generation(), generation);

    rig.editing.modify(|e| e.delete_box_with_dependents(t)).unwrap();
    let order = rig.block();
    assert_eq!(rig.scheduler.generation(), generation + 1);
    assert_eq!(order, vec![mandatory.master_bus, mandatory.master_unit]);
}

#[test]
fn test_sort_kinds_and_ties() {
    let mut editing = BoxEditing::new(BoxGraph::new());
    let mandatory = create_project(&mut editing).unwrap();
    editing
        .modify(|e| {
            for n in 0..5 {
                add_track(e, &mandatory, &format!("T{n}"))?;
            }
            Ok(())
        })
        .unwrap();

    let processors = sort(&editing).unwrap();
    assert_eq!(processors.len(), 7);
    // independent tracks come out in id order
    let tracks: Vec<BoxId> = processors
        .iter()
        .filter(|p| p.kind == ProcessorKind::Track && p.id != mandatory.master_unit)
        .map(|p| p.id)
        .collect();
    let mut sorted = tracks.clone();
    sorted.sort();
    assert_eq!(tracks, sorted);
    assert_eq!(processors[5].kind, ProcessorKind::Bus);
}
