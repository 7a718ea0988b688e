//! # Processing scheduler
//!
//! Orders the processors of a (mirror) graph so every box runs after
//! everything that feeds into it. The order is cached and recomputed only
//! after a topology-affecting update.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, error};

use crate::graph::BoxGraph;
use crate::model::{BoxId, BoxKind};
use crate::update::Update;
use crate::{Error, Result};

/// What a processing box is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProcessorKind {
    Track,
    Bus,
    Device,
}

impl ProcessorKind {
    pub fn of(kind: BoxKind) -> Option<Self> {
        match kind {
            BoxKind::Track => Some(ProcessorKind::Track),
            BoxKind::AudioBus => Some(ProcessorKind::Bus),
            BoxKind::Device => Some(ProcessorKind::Device),
            BoxKind::Root | BoxKind::UserInterface | BoxKind::Timeline | BoxKind::Region => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Processor {
    pub id: BoxId,
    pub kind: ProcessorKind,
}

/// Cached topological order of processors.
#[derive(Debug, Clone)]
pub struct ProcessingScheduler {
    order: Vec<Processor>,
    dirty: bool,
    generation: u64,
}

impl Default for ProcessingScheduler {
    fn default() -> Self {
        Self { order: Vec::new(), dirty: true, generation: 0 }
    }
}

impl ProcessingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the order stale if `update` can change it. `graph` is the state
    /// after the update.
    pub fn observe(&mut self, update: &Update, graph: &BoxGraph) {
        let affects = match update {
            Update::Create { kind, .. } | Update::Delete { kind, .. } => ProcessorKind::of(*kind).is_some(),
            // purpose unknown (owner gone) counts as routing
            Update::Pointer { address, .. } => graph
                .pointer_purpose(address)
                .is_none_or(|purpose| purpose.is_routing()),
            Update::Primitive { .. } => false,
        };
        self.dirty |= affects;
    }

    pub fn observe_all(&mut self, updates: &[Update], graph: &BoxGraph) {
        for update in updates {
            self.observe(update, graph);
        }
    }

    pub fn invalidate(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Successful re-sorts so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current order, re-sorted first if stale. If the graph has a routing
    /// cycle the previous order is kept.
    pub fn order(&mut self, graph: &BoxGraph) -> &[Processor] {
        if self.dirty {
            match sort(graph) {
                Ok(order) => {
                    self.order = order;
                    self.generation += 1;
                    debug!(processors = self.order.len(), generation = self.generation, "re-sorted processors");
                }
                Err(e) => error!(error = %e, "keeping previous processing order"),
            }
            self.dirty = false;
        }
        &self.order
    }

    /// Last computed order without re-sorting.
    pub fn cached(&self) -> &[Processor] {
        &self.order
    }
}

/// Topological order of every processor in `graph`, ties broken by id.
pub fn sort(graph: &BoxGraph) -> Result<Vec<Processor>> {
    let vertices: BTreeMap<BoxId, ProcessorKind> = graph
        .boxes()
        .filter_map(|record| ProcessorKind::of(record.kind).map(|kind| (record.id, kind)))
        .collect();
    let edges: Vec<(BoxId, BoxId)> = graph
        .routing_edges()
        .into_iter()
        .filter(|(from, to)| vertices.contains_key(from) && vertices.contains_key(to))
        .collect();
    let sorted = kahn_sort(vertices.keys().copied(), &edges)?;
    Ok(sorted
        .into_iter()
        .filter_map(|id| vertices.get(&id).map(|kind| Processor { id, kind: *kind }))
        .collect())
}

fn kahn_sort(vertices: impl IntoIterator<Item = BoxId>, edges: &[(BoxId, BoxId)]) -> Result<Vec<BoxId>> {
    let mut in_degree: BTreeMap<BoxId, usize> = vertices.into_iter().map(|v| (v, 0)).collect();
    let mut successors: BTreeMap<BoxId, Vec<BoxId>> = BTreeMap::new();
    for (from, to) in edges {
        successors.entry(*from).or_default().push(*to);
        if let Some(d) = in_degree.get_mut(to) {
            *d += 1;
        }
    }

    let mut ready: BTreeSet<BoxId> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(v, _)| *v)
        .collect();
    let mut sorted = Vec::with_capacity(in_degree.len());

    while let Some(v) = ready.pop_first() {
        sorted.push(v);
        for to in successors.get(&v).into_iter().flatten() {
            if let Some(d) = in_degree.get_mut(to) {
                *d -= 1;
                if *d == 0 {
                    ready.insert(*to);
                }
            }
        }
    }

    if sorted.len() != in_degree.len() {
        let done: BTreeSet<BoxId> = sorted.into_iter().collect();
        let (from, to) = edges
            .iter()
            .copied()
            .find(|(from, to)| !done.contains(from) && !done.contains(to))
            .ok_or_else(|| Error::IntegrityViolation("unsortable processor graph".into()))?;
        return Err(Error::CycleDetected { from, to });
    }
    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::kind::{audio_bus, track};
    use crate::model::Address;
    use crate::project::{add_device, add_track, create_project};
    use crate::tx::BoxEditing;

    fn position(order: &[Processor], id: BoxId) -> usize {
        order.iter().position(|p| p.id == id).unwrap()
    }

    #[test]
    fn test_order_respects_routing() {
        let mut editing = BoxEditing::new(BoxGraph::new());
        let mandatory = create_project(&mut editing).unwrap();
        let (t, d) = editing
            .modify(|e| {
                let t = add_track(e, &mandatory, "Lead")?;
                let d = add_device(e, t, "Delay")?;
                Ok((t, d))
            })
            .unwrap();

        let mut scheduler = ProcessingScheduler::new();
        let order = scheduler.order(&editing).to_vec();
        assert_eq!(order.len(), 4);
        assert!(position(&order, d) < position(&order, t));
        assert!(position(&order, t) < position(&order, mandatory.master_bus));
        assert!(position(&order, mandatory.master_bus) < position(&order, mandatory.master_unit));
        assert_eq!(scheduler.generation(), 1);

        scheduler.order(&editing);
        assert_eq!(scheduler.generation(), 1);
    }

    #[test]
    fn test_observe_ignores_non_topology_updates() {
        let mut editing = BoxEditing::new(BoxGraph::new());
        let mandatory = create_project(&mut editing).unwrap();
        let mut scheduler = ProcessingScheduler::new();
        scheduler.order(&editing);

        let t = mandatory.master_unit;
        editing.begin();
        editing.write_field(&Address::field(t, &[track::MUTE]), true.into()).unwrap();
        let tx = editing.commit().unwrap().unwrap();
        scheduler.observe_all(&tx.updates, &editing);
        assert!(!scheduler.is_dirty());

        editing.begin();
        let bus = editing.create_box(BoxKind::AudioBus, None).unwrap();
        editing.set_pointer(&Address::field(bus, &[audio_bus::OUTPUT]), Address::field(t, &[track::INPUT])).unwrap();
        let tx = editing.commit().unwrap().unwrap();
        scheduler.observe_all(&tx.updates, &editing);
        assert!(scheduler.is_dirty());
        assert_eq!(scheduler.order(&editing).len(), 3);
    }

    #[test]
    fn test_kahn_reports_cycle() {
        let a = BoxId::from_bytes([1; 16]);
        let b = BoxId::from_bytes([2; 16]);
        let c = BoxId::from_bytes([3; 16]);
        let err = kahn_sort([a, b, c], &[(a, b), (b, c), (c, b)]).unwrap_err();
        assert!(matches!(err, Error::CycleDetected { .. }));
        assert_eq!(kahn_sort([c, b, a], &[(c, a)]).unwrap(), vec![b, c, a]);
    }
}
