//! Routing edges derived from pointers, and cycle rejection.

use hashbrown::HashSet;

use super::BoxGraph;
use crate::model::{Address, BoxId, PointerType};
use crate::{Error, Result};

impl BoxGraph {
    /// Reject `pointer → target` if the routing edge it implies would close
    /// a cycle. The pointer's current edge (if any) is ignored, since it is
    /// about to be replaced.
    pub(crate) fn check_routing_cycle(
        &self,
        pointer: &Address,
        purpose: PointerType,
        target: &Address,
    ) -> Result<()> {
        let Some((from, to)) = purpose.routing_edge(pointer.box_id, target.box_id) else {
            return Ok(());
        };
        if from == to || self.routes_to(to, from, pointer) {
            return Err(Error::CycleDetected { from, to });
        }
        Ok(())
    }

    fn routes_to(&self, start: BoxId, goal: BoxId, skip: &Address) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![start];
        while let Some(v) = stack.pop() {
            if v == goal {
                return true;
            }
            if visited.insert(v) {
                stack.extend(self.routing_successors(v, skip));
            }
        }
        false
    }

    /// Boxes `v` feeds into. Edges come from `v`'s own routing pointers and
    /// from routing pointers into `v` whose edge starts at `v` (sidechains).
    fn routing_successors(&self, v: BoxId, skip: &Address) -> Vec<BoxId> {
        let mut out = Vec::new();
        if let Some(record) = self.boxes.get(&v) {
            for (pointer, target) in record.pointers() {
                if pointer == *skip {
                    continue;
                }
                if let Some((from, to)) = self.edge_of(&pointer, target) {
                    if from == v {
                        out.push(to);
                    }
                }
            }
        }
        for (pointer, target) in self.index.incoming_to_box(v) {
            if pointer == *skip {
                continue;
            }
            if let Some((from, to)) = self.edge_of(&pointer, &target) {
                if from == v {
                    out.push(to);
                }
            }
        }
        out
    }

    fn edge_of(&self, pointer: &Address, target: &Address) -> Option<(BoxId, BoxId)> {
        let purpose = self.pointer_purpose(pointer)?;
        purpose.routing_edge(pointer.box_id, target.box_id)
    }

    /// Every "feeds into" edge of the graph, sorted and deduplicated.
    pub fn routing_edges(&self) -> Vec<(BoxId, BoxId)> {
        let mut edges: Vec<(BoxId, BoxId)> = self
            .index
            .iter()
            .filter_map(|(pointer, target)| self.edge_of(pointer, target))
            .collect();
        edges.sort_unstable();
        edges.dedup();
        edges
    }
}

#[cfg(test)]
mod tests {
    use crate::model::kind::{audio_bus, device, track};
    use crate::model::{Address, BoxKind};
    use crate::{BoxGraph, Error};

    #[test]
    fn test_bus_loop_is_rejected() {
        let mut graph = BoxGraph::new();
        graph.begin();
        let t = graph.create_box(BoxKind::Track, None).unwrap();
        let bus = graph.create_box(BoxKind::AudioBus, None).unwrap();
        graph.set_pointer(&Address::field(t, &[track::OUTPUT]), Address::field(bus, &[audio_bus::INPUT])).unwrap();

        let err = graph
            .set_pointer(&Address::field(bus, &[audio_bus::OUTPUT]), Address::field(t, &[track::INPUT]))
            .unwrap_err();
        assert!(matches!(err, Error::CycleDetected { from, to } if from == bus && to == t));
        assert_eq!(graph.routing_edges(), vec![(t, bus)]);
        graph.commit().unwrap();
    }

    #[test]
    fn test_sidechain_loop_through_host_is_rejected() {
        let mut graph = BoxGraph::new();
        graph.begin();
        let t = graph.create_box(BoxKind::Track, None).unwrap();
        let d = graph.create_box(BoxKind::Device, None).unwrap();
        graph.set_pointer(&Address::field(d, &[device::HOST]), Address::field(t, &[track::DEVICES])).unwrap();

        // t feeds d via the sidechain, d feeds t as its host
        let err = graph.set_pointer(&Address::field(d, &[device::SIDECHAIN]), Address::of_box(t)).unwrap_err();
        assert!(matches!(err, Error::CycleDetected { .. }));

        let other = graph.create_box(BoxKind::Track, None).unwrap();
        graph.set_pointer(&Address::field(d, &[device::SIDECHAIN]), Address::of_box(other)).unwrap();
        graph.commit().unwrap();
    }

    #[test]
    fn test_reassigning_pointer_ignores_its_old_edge() {
        let mut graph = BoxGraph::new();
        graph.begin();
        let a = graph.create_box(BoxKind::AudioBus, None).unwrap();
        let b = graph.create_box(BoxKind::AudioBus, None).unwrap();
        let t = graph.create_box(BoxKind::Track, None).unwrap();
        graph.set_pointer(&Address::field(t, &[track::OUTPUT]), Address::field(a, &[audio_bus::INPUT])).unwrap();
        graph.set_pointer(&Address::field(t, &[track::OUTPUT]), Address::field(b, &[audio_bus::INPUT])).unwrap();
        assert_eq!(graph.routing_edges(), vec![(t, b)]);
        graph.commit().unwrap();
    }
}
