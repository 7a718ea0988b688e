//! Audio-side block engine.
//!
//! Owns the mirror graph, the scheduler and the telemetry writer. One call
//! to `process_block` per audio callback:
//!
//! 1. serve pending requests (bounded)
//! 2. drain the sync bridge (bounded), invalidating the scheduler
//! 3. bring the processing order up to date and count one call per processor
//! 4. advance the transport from the mirrored tempo and loop area
//! 5. publish a `TransportRecord`
//!
//! No DSP runs here; processors are counted, not rendered.

use tracing::{debug, warn};

use crate::config::{EngineConfig, TransportConfig};
use crate::model::kind::timeline;
use crate::model::{Address, BoxId, BoxKind, FieldKey, Value};
use crate::rpc::{Command, EngineEndpoint, Query, QueryReply, Request};
use crate::scheduler::ProcessingScheduler;
use crate::sync::SyncTarget;
use crate::telemetry::{TelemetryWriter, TransportRecord};

const DEFAULT_BPM: f64 = 120.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveNote {
    pub track: BoxId,
    pub pitch: u8,
    pub velocity: f32,
}

/// Counters since the engine started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub blocks: u64,
    pub processor_calls: u64,
    pub requests: u64,
    pub batches: u64,
    pub dropped_updates: u64,
}

pub struct AudioEngine {
    config: TransportConfig,
    mirror: SyncTarget,
    scheduler: ProcessingScheduler,
    telemetry: TelemetryWriter<TransportRecord>,
    rpc: Option<EngineEndpoint>,
    position: f64,
    playing: bool,
    active_notes: Vec<ActiveNote>,
    stats: EngineStats,
}

impl AudioEngine {
    pub fn new(
        config: &EngineConfig,
        mirror: SyncTarget,
        telemetry: TelemetryWriter<TransportRecord>,
    ) -> Self {
        Self {
            config: config.transport.clone(),
            mirror,
            scheduler: ProcessingScheduler::new(),
            telemetry,
            rpc: None,
            position: 0.0,
            playing: false,
            active_notes: Vec::with_capacity(config.transport.max_active_notes),
            stats: EngineStats::default(),
        }
    }

    pub fn with_rpc(mut self, endpoint: EngineEndpoint) -> Self {
        self.rpc = Some(endpoint);
        self
    }

    // ========================================================================
    // Block processing
    // ========================================================================

    /// One block of the configured `block_size`.
    pub fn run_block(&mut self) {
        self.process_block(self.config.block_size);
    }

    pub fn process_block(&mut self, frames: usize) {
        self.serve_requests();

        let drained = self.mirror.drain();
        if drained.snapshot_loaded {
            self.scheduler.invalidate();
        }
        self.scheduler.observe_all(&drained.updates, self.mirror.graph());
        self.stats.batches += drained.batches as u64;
        self.stats.dropped_updates += drained.dropped as u64;

        let processors = self.scheduler.order(self.mirror.graph()).len();
        self.stats.processor_calls += processors as u64;

        if self.playing {
            self.advance(frames);
        }
        self.stats.blocks += 1;
        let record = self.transport();
        self.telemetry.publish(&record);
    }

    fn serve_requests(&mut self) {
        let Some(endpoint) = self.rpc.take() else {
            return;
        };
        let mut connected = true;
        for _ in 0..self.config.max_requests_per_block {
            match endpoint.try_recv() {
                Ok(Some(request)) => {
                    self.stats.requests += 1;
                    let method = request.method();
                    match request {
                        Request::Fire(command) => self.execute(command),
                        Request::Call { id, query } => {
                            let reply = self.answer(query);
                            if endpoint.reply(id, reply).is_err() {
                                debug!(id = id.0, ?method, "reply receiver gone");
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    debug!("all engine clients gone");
                    connected = false;
                    break;
                }
            }
        }
        if connected {
            self.rpc = Some(endpoint);
        }
    }

    /// Static dispatch of fire-and-forget commands.
    fn execute(&mut self, command: Command) {
        match command {
            Command::Play => self.playing = true,
            Command::Pause => self.playing = false,
            Command::Seek { ticks } => self.position = ticks.max(0.0),
            Command::NoteOn { track, pitch, velocity } => {
                if self.mirror.graph().kind_of(track) != Some(BoxKind::Track) {
                    debug!(%track, "note on for unknown track ignored");
                    return;
                }
                self.active_notes.retain(|n| !(n.track == track && n.pitch == pitch));
                if self.active_notes.len() >= self.config.max_active_notes {
                    warn!(%track, pitch, "active note limit reached, note dropped");
                    return;
                }
                self.active_notes.push(ActiveNote { track, pitch, velocity });
            }
            Command::NoteOff { track, pitch } => {
                self.active_notes.retain(|n| !(n.track == track && n.pitch == pitch));
            }
        }
    }

    /// Static dispatch of queries.
    fn answer(&mut self, query: Query) -> QueryReply {
        match query {
            Query::Position => QueryReply::Position(self.transport()),
            Query::ProcessingOrder => QueryReply::ProcessingOrder(
                self.scheduler
                    .order(self.mirror.graph())
                    .iter()
                    .map(|p| p.id)
                    .collect(),
            ),
            Query::BoxCount => QueryReply::BoxCount(self.mirror.graph().box_count() as u64),
            Query::VerifyIntegrity => QueryReply::Integrity(self.mirror.graph().verify_integrity()),
        }
    }

    // ========================================================================
    // Transport
    // ========================================================================

    fn advance(&mut self, frames: usize) {
        let ticks_per_second = self.tempo() / 60.0 * f64::from(self.config.ppqn);
        let delta = frames as f64 * ticks_per_second / f64::from(self.config.sample_rate);
        let mut next = self.position + delta;
        if let Some((from, to)) = self.loop_area() {
            if self.position < to && next >= to {
                next = from + (next - to) % (to - from);
            }
        }
        self.position = next;
    }

    fn timeline_field(&self, path: &[FieldKey]) -> Option<&Value> {
        let timeline = self.mirror.mandatory()?.timeline;
        self.mirror.graph().read_field(&Address::field(timeline, path)).ok()
    }

    /// Tempo from the mirrored timeline.
    pub fn tempo(&self) -> f64 {
        self.timeline_field(&[timeline::BPM])
            .and_then(|v| v.as_float())
            .map(f64::from)
            .filter(|bpm| *bpm > 0.0)
            .unwrap_or(DEFAULT_BPM)
    }

    /// `(from, to)` in ticks if looping is enabled and the area is valid.
    pub fn loop_area(&self) -> Option<(f64, f64)> {
        let enabled = self
            .timeline_field(&[timeline::LOOP_AREA, timeline::loop_area::ENABLED])?
            .as_bool()?;
        let from = self.timeline_field(&[timeline::LOOP_AREA, timeline::loop_area::FROM])?.as_int()?;
        let to = self.timeline_field(&[timeline::LOOP_AREA, timeline::loop_area::TO])?.as_int()?;
        (enabled && to > from).then(|| (f64::from(from), f64::from(to)))
    }

    pub fn transport(&self) -> TransportRecord {
        TransportRecord { position: self.position, playing: self.playing, block: self.stats.blocks }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn mirror(&self) -> &SyncTarget {
        &self.mirror
    }

    pub fn active_notes(&self) -> &[ActiveNote] {
        &self.active_notes
    }

    /// Ids in the order processors ran in the last block.
    pub fn processing_order(&self) -> Vec<BoxId> {
        self.scheduler.cached().iter().map(|p| p.id).collect()
    }

    pub fn scheduler(&self) -> &ProcessingScheduler {
        &self.scheduler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::BoxGraph;
    use crate::project::{add_track, create_project, MandatoryBoxes};
    use crate::sync::SyncSource;
    use crate::telemetry::{channel, TelemetryReader};
    use crate::tx::BoxEditing;

    struct Rig {
        editing: BoxEditing,
        mandatory: MandatoryBoxes,
        engine: AudioEngine,
        telemetry: TelemetryReader<TransportRecord>,
    }

    fn rig() -> Rig {
        let config = EngineConfig::default();
        let mut editing = BoxEditing::new(BoxGraph::new());
        let mandatory = create_project(&mut editing).unwrap();
        let source = SyncSource::new();
        editing.subscribe(source.clone());
        let mirror = source.attach(&editing, &mandatory, config.sync.clone()).unwrap();
        let (writer, telemetry) = channel::<TransportRecord>();
        let engine = AudioEngine::new(&config, mirror, writer);
        Rig { editing, mandatory, engine, telemetry }
    }

    #[test]
    fn test_block_bootstraps_mirror_and_publishes() {
        let mut rig = rig();
        rig.engine.process_block(128);

        assert_eq!(rig.engine.mirror().graph().box_count(), 5);
        assert_eq!(rig.engine.processing_order(), vec![rig.mandatory.master_bus, rig.mandatory.master_unit]);
        let record = rig.telemetry.poll().unwrap();
        assert_eq!(record, TransportRecord { position: 0.0, playing: false, block: 1 });
    }

    #[test]
    fn test_transport_follows_mirrored_tempo_and_loop() {
        let mut rig = rig();
        let tl = rig.mandatory.timeline;
        rig.editing
            .modify(|e| {
                e.write_field(&Address::field(tl, &[timeline::BPM]), Value::Float(60.0))?;
                e.write_field(&Address::field(tl, &[timeline::LOOP_AREA, timeline::loop_area::ENABLED]), Value::Bool(true))?;
                e.write_field(&Address::field(tl, &[timeline::LOOP_AREA, timeline::loop_area::TO]), Value::Int(960))
            })
            .unwrap();
        rig.engine.process_block(0);
        assert_eq!(rig.engine.tempo(), 60.0);
        assert_eq!(rig.engine.loop_area(), Some((0.0, 960.0)));

        // 60 bpm, 960 ppqn, 48 kHz: 48_000 frames = one beat = 960 ticks
        rig.engine.execute(Command::Seek { ticks: 480.0 });
        rig.engine.execute(Command::Play);
        rig.engine.process_block(36_000);
        assert_eq!(rig.engine.transport().position, 240.0);
    }

    #[test]
    fn test_note_tracking() {
        let mut rig = rig();
        let mandatory = rig.mandatory;
        let t = rig.editing.modify(|e| add_track(e, &mandatory, "Piano")).unwrap();
        rig.engine.process_block(128);

        rig.engine.execute(Command::NoteOn { track: t, pitch: 60, velocity: 0.8 });
        rig.engine.execute(Command::NoteOn { track: t, pitch: 60, velocity: 0.5 });
        rig.engine.execute(Command::NoteOn { track: BoxId::new(), pitch: 61, velocity: 0.5 });
        assert_eq!(rig.engine.active_notes(), &[ActiveNote { track: t, pitch: 60, velocity: 0.5 }]);
        rig.engine.execute(Command::NoteOff { track: t, pitch: 60 });
        assert!(rig.engine.active_notes().is_empty());
    }

    #[test]
    fn test_run_block_uses_configured_block_size() {
        let mut rig = rig();
        rig.engine.execute(Command::Play);
        rig.engine.run_block();

        // 120 bpm, 960 ppqn, 48 kHz: 128 frames = 5.12 ticks
        let expected = 128.0 * 120.0 / 60.0 * 960.0 / 48_000.0;
        assert_eq!(rig.engine.transport().position, expected);
    }
}
