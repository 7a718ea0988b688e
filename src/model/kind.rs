//! Box kinds and their static field schemas.
//!
//! Every kind is a closed enum variant with a `&'static` schema. Adding a
//! kind means adding a variant, and every `match` over kinds in the crate
//! must then handle it.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{BoxId, FieldKey, FieldPath, Value, ValueType};

// ============================================================================
// Pointer purposes
// ============================================================================

/// Purpose tag of a pointer field. Restricts which anchors it may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PointerType {
    TrackRoot,
    BusRoot,
    UserInterface,
    Timeline,
    TrackOutput,
    BusOutput,
    DeviceHost,
    Sidechain,
    RegionTrack,
}

impl PointerType {
    /// Whether pointers of this purpose carry audio routing.
    pub fn is_routing(self) -> bool {
        matches!(
            self,
            PointerType::TrackOutput
                | PointerType::BusOutput
                | PointerType::DeviceHost
                | PointerType::Sidechain
        )
    }

    /// The "feeds into" edge `(from, to)` implied by a pointer of this purpose
    /// owned by `owner` and targeting (a field of) `target`.
    pub fn routing_edge(self, owner: BoxId, target: BoxId) -> Option<(BoxId, BoxId)> {
        match self {
            PointerType::TrackOutput | PointerType::BusOutput => Some((owner, target)),
            PointerType::DeviceHost => Some((owner, target)),
            PointerType::Sidechain => Some((target, owner)),
            PointerType::TrackRoot
            | PointerType::BusRoot
            | PointerType::UserInterface
            | PointerType::Timeline
            | PointerType::RegionTrack => None,
        }
    }
}

// ============================================================================
// Schema
// ============================================================================

/// Schema default of a primitive field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    Bool(bool),
    Int(i32),
    Float(f32),
    Str(&'static str),
    Bytes,
}

impl Init {
    pub fn value(&self) -> Value {
        match *self {
            Init::Bool(b) => Value::Bool(b),
            Init::Int(i) => Value::Int(i),
            Init::Float(f) => Value::Float(f),
            Init::Str(s) => Value::String(s.to_owned()),
            Init::Bytes => Value::Bytes(Vec::new()),
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Init::Bool(_) => ValueType::Bool,
            Init::Int(_) => ValueType::Int,
            Init::Float(_) => ValueType::Float,
            Init::Str(_) => ValueType::String,
            Init::Bytes => ValueType::Bytes,
        }
    }
}

/// What a field is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldSpec {
    Primitive(Init),
    Pointer { purpose: PointerType, mandatory: bool },
    /// Receives pointers of the listed purposes; stores nothing itself.
    Anchor { accepts: &'static [PointerType] },
    Object(&'static [FieldDecl]),
}

/// One entry of a kind's schema.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldDecl {
    pub key: FieldKey,
    pub name: &'static str,
    pub spec: FieldSpec,
}

const fn decl(key: FieldKey, name: &'static str, spec: FieldSpec) -> FieldDecl {
    FieldDecl { key, name, spec }
}

const fn pointer(purpose: PointerType, mandatory: bool) -> FieldSpec {
    FieldSpec::Pointer { purpose, mandatory }
}

pub mod root {
    use super::*;
    pub const NAME: FieldKey = 1;
    pub const TRACKS: FieldKey = 2;
    pub const BUSES: FieldKey = 3;

    pub(super) const FIELDS: &[FieldDecl] = &[
        decl(NAME, "name", FieldSpec::Primitive(Init::Str("Untitled"))),
        decl(TRACKS, "tracks", FieldSpec::Anchor { accepts: &[PointerType::TrackRoot] }),
        decl(BUSES, "buses", FieldSpec::Anchor { accepts: &[PointerType::BusRoot] }),
    ];
}

pub mod user_interface {
    use super::*;
    pub const ROOT: FieldKey = 1;
    pub const ZOOM: FieldKey = 2;
    pub const FOLLOW: FieldKey = 3;

    pub(super) const FIELDS: &[FieldDecl] = &[
        decl(ROOT, "root", pointer(PointerType::UserInterface, true)),
        decl(ZOOM, "zoom", FieldSpec::Primitive(Init::Float(1.0))),
        decl(FOLLOW, "follow", FieldSpec::Primitive(Init::Bool(true))),
    ];
}

pub mod timeline {
    use super::*;
    pub const ROOT: FieldKey = 1;
    pub const BPM: FieldKey = 2;
    pub const LOOP_AREA: FieldKey = 3;
    pub const SIGNATURE: FieldKey = 4;

    pub mod loop_area {
        use super::super::*;
        pub const ENABLED: FieldKey = 1;
        pub const FROM: FieldKey = 2;
        pub const TO: FieldKey = 3;

        pub(in crate::model::kind) const FIELDS: &[FieldDecl] = &[
            decl(ENABLED, "enabled", FieldSpec::Primitive(Init::Bool(false))),
            decl(FROM, "from", FieldSpec::Primitive(Init::Int(0))),
            decl(TO, "to", FieldSpec::Primitive(Init::Int(3840))),
        ];
    }

    pub mod signature {
        use super::super::*;
        pub const NOMINATOR: FieldKey = 1;
        pub const DENOMINATOR: FieldKey = 2;

        pub(in crate::model::kind) const FIELDS: &[FieldDecl] = &[
            decl(NOMINATOR, "nominator", FieldSpec::Primitive(Init::Int(4))),
            decl(DENOMINATOR, "denominator", FieldSpec::Primitive(Init::Int(4))),
        ];
    }

    pub(super) const FIELDS: &[FieldDecl] = &[
        decl(ROOT, "root", pointer(PointerType::Timeline, true)),
        decl(BPM, "bpm", FieldSpec::Primitive(Init::Float(120.0))),
        decl(LOOP_AREA, "loop_area", FieldSpec::Object(loop_area::FIELDS)),
        decl(SIGNATURE, "signature", FieldSpec::Object(signature::FIELDS)),
    ];
}

pub mod audio_bus {
    use super::*;
    pub const ROOT: FieldKey = 1;
    pub const LABEL: FieldKey = 2;
    pub const INPUT: FieldKey = 3;
    pub const OUTPUT: FieldKey = 4;

    pub(super) const FIELDS: &[FieldDecl] = &[
        decl(ROOT, "root", pointer(PointerType::BusRoot, false)),
        decl(LABEL, "label", FieldSpec::Primitive(Init::Str("Bus"))),
        decl(INPUT, "input", FieldSpec::Anchor { accepts: &[PointerType::TrackOutput] }),
        decl(OUTPUT, "output", pointer(PointerType::BusOutput, false)),
    ];
}

pub mod track {
    use super::*;
    pub const ROOT: FieldKey = 1;
    pub const LABEL: FieldKey = 2;
    pub const DEVICES: FieldKey = 3;
    pub const REGIONS: FieldKey = 4;
    pub const OUTPUT: FieldKey = 5;
    pub const INPUT: FieldKey = 6;
    pub const VOLUME: FieldKey = 7;
    pub const MUTE: FieldKey = 8;
    pub const INDEX: FieldKey = 9;

    pub(super) const FIELDS: &[FieldDecl] = &[
        decl(ROOT, "root", pointer(PointerType::TrackRoot, false)),
        decl(LABEL, "label", FieldSpec::Primitive(Init::Str("Track"))),
        decl(DEVICES, "devices", FieldSpec::Anchor { accepts: &[PointerType::DeviceHost] }),
        decl(REGIONS, "regions", FieldSpec::Anchor { accepts: &[PointerType::RegionTrack] }),
        decl(OUTPUT, "output", pointer(PointerType::TrackOutput, false)),
        decl(INPUT, "input", FieldSpec::Anchor { accepts: &[PointerType::BusOutput] }),
        decl(VOLUME, "volume", FieldSpec::Primitive(Init::Float(0.0))),
        decl(MUTE, "mute", FieldSpec::Primitive(Init::Bool(false))),
        decl(INDEX, "index", FieldSpec::Primitive(Init::Int(0))),
    ];
}

pub mod device {
    use super::*;
    pub const HOST: FieldKey = 1;
    pub const LABEL: FieldKey = 2;
    pub const ENABLED: FieldKey = 3;
    pub const INDEX: FieldKey = 4;
    pub const PARAMS: FieldKey = 5;
    pub const STATE: FieldKey = 6;
    pub const SIDECHAIN: FieldKey = 7;

    pub mod params {
        use super::super::*;
        pub const GAIN: FieldKey = 1;
        pub const MIX: FieldKey = 2;

        pub(in crate::model::kind) const FIELDS: &[FieldDecl] = &[
            decl(GAIN, "gain", FieldSpec::Primitive(Init::Float(0.0))),
            decl(MIX, "mix", FieldSpec::Primitive(Init::Float(1.0))),
        ];
    }

    pub(super) const FIELDS: &[FieldDecl] = &[
        decl(HOST, "host", pointer(PointerType::DeviceHost, true)),
        decl(LABEL, "label", FieldSpec::Primitive(Init::Str("Device"))),
        decl(ENABLED, "enabled", FieldSpec::Primitive(Init::Bool(true))),
        decl(INDEX, "index", FieldSpec::Primitive(Init::Int(0))),
        decl(PARAMS, "params", FieldSpec::Object(params::FIELDS)),
        decl(STATE, "state", FieldSpec::Primitive(Init::Bytes)),
        decl(SIDECHAIN, "sidechain", pointer(PointerType::Sidechain, false)),
    ];
}

pub mod region {
    use super::*;
    pub const TRACK: FieldKey = 1;
    pub const POSITION: FieldKey = 2;
    pub const DURATION: FieldKey = 3;
    pub const LABEL: FieldKey = 4;
    pub const MUTE: FieldKey = 5;

    pub(super) const FIELDS: &[FieldDecl] = &[
        decl(TRACK, "track", pointer(PointerType::RegionTrack, true)),
        decl(POSITION, "position", FieldSpec::Primitive(Init::Int(0))),
        decl(DURATION, "duration", FieldSpec::Primitive(Init::Int(3840))),
        decl(LABEL, "label", FieldSpec::Primitive(Init::Str(""))),
        decl(MUTE, "mute", FieldSpec::Primitive(Init::Bool(false))),
    ];
}

// ============================================================================
// BoxKind
// ============================================================================

/// The closed set of box kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoxKind {
    Root,
    UserInterface,
    Timeline,
    AudioBus,
    Track,
    Device,
    Region,
}

impl BoxKind {
    pub const ALL: [BoxKind; 7] = [
        BoxKind::Root,
        BoxKind::UserInterface,
        BoxKind::Timeline,
        BoxKind::AudioBus,
        BoxKind::Track,
        BoxKind::Device,
        BoxKind::Region,
    ];

    /// Wire tag.
    pub fn tag(self) -> u16 {
        match self {
            BoxKind::Root => 1,
            BoxKind::UserInterface => 2,
            BoxKind::Timeline => 3,
            BoxKind::AudioBus => 4,
            BoxKind::Track => 5,
            BoxKind::Device => 6,
            BoxKind::Region => 7,
        }
    }

    pub fn from_tag(tag: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    pub fn name(self) -> &'static str {
        match self {
            BoxKind::Root => "Root",
            BoxKind::UserInterface => "UserInterface",
            BoxKind::Timeline => "Timeline",
            BoxKind::AudioBus => "AudioBus",
            BoxKind::Track => "Track",
            BoxKind::Device => "Device",
            BoxKind::Region => "Region",
        }
    }

    pub fn fields(self) -> &'static [FieldDecl] {
        match self {
            BoxKind::Root => root::FIELDS,
            BoxKind::UserInterface => user_interface::FIELDS,
            BoxKind::Timeline => timeline::FIELDS,
            BoxKind::AudioBus => audio_bus::FIELDS,
            BoxKind::Track => track::FIELDS,
            BoxKind::Device => device::FIELDS,
            BoxKind::Region => region::FIELDS,
        }
    }

    /// Purposes of pointers that may target the box itself (empty path).
    pub fn accepts(self) -> &'static [PointerType] {
        match self {
            BoxKind::Root => &[PointerType::UserInterface, PointerType::Timeline],
            BoxKind::AudioBus | BoxKind::Track => &[PointerType::Sidechain],
            BoxKind::UserInterface | BoxKind::Timeline | BoxKind::Device | BoxKind::Region => &[],
        }
    }

    /// Resolve a field path against the schema.
    pub fn field(self, path: &[FieldKey]) -> Option<&'static FieldSpec> {
        let (first, rest) = path.split_first()?;
        let mut spec = &self.fields().iter().find(|d| d.key == *first)?.spec;
        for key in rest {
            match *spec {
                FieldSpec::Object(children) => {
                    spec = &children.iter().find(|d| d.key == *key)?.spec;
                }
                _ => return None,
            }
        }
        Some(spec)
    }

    /// Whether a pointer of `purpose` may target `path` on a box of this kind.
    pub fn accepts_at(self, path: &[FieldKey], purpose: PointerType) -> bool {
        if path.is_empty() {
            return self.accepts().contains(&purpose);
        }
        match self.field(path) {
            Some(FieldSpec::Anchor { accepts }) => accepts.contains(&purpose),
            _ => false,
        }
    }

    /// All primitive and pointer leaves in key order, with their full paths.
    pub fn slots(self) -> Vec<(FieldPath, &'static FieldSpec)> {
        fn walk(
            decls: &'static [FieldDecl],
            prefix: &mut FieldPath,
            out: &mut Vec<(FieldPath, &'static FieldSpec)>,
        ) {
            for d in decls {
                prefix.push(d.key);
                match d.spec {
                    FieldSpec::Object(children) => walk(children, prefix, out),
                    FieldSpec::Anchor { .. } => {}
                    FieldSpec::Primitive(_) | FieldSpec::Pointer { .. } => {
                        out.push((prefix.clone(), &d.spec))
                    }
                }
                prefix.pop();
            }
        }
        let mut out = Vec::new();
        walk(self.fields(), &mut FieldPath::new(), &mut out);
        out
    }
}

impl fmt::Display for BoxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_roundtrip() {
        for kind in BoxKind::ALL {
            assert_eq!(BoxKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(BoxKind::from_tag(0), None);
    }

    #[test]
    fn test_nested_field_lookup() {
        let spec = BoxKind::Device.field(&[device::PARAMS, device::params::MIX]);
        assert_eq!(spec, Some(&FieldSpec::Primitive(Init::Float(1.0))));
        assert!(BoxKind::Device.field(&[device::LABEL, 1]).is_none());
        assert!(BoxKind::Device.field(&[99]).is_none());
        assert!(BoxKind::Device.field(&[]).is_none());
    }

    #[test]
    fn test_slots_flatten_objects_and_skip_anchors() {
        let slots = BoxKind::Timeline.slots();
        let paths: Vec<Vec<FieldKey>> = slots.iter().map(|(p, _)| p.to_vec()).collect();
        assert_eq!(
            paths,
            vec![vec![1], vec![2], vec![3, 1], vec![3, 2], vec![3, 3], vec![4, 1], vec![4, 2]]
        );
        assert!(BoxKind::Track.slots().iter().all(|(p, _)| p[0] != track::DEVICES));
    }

    #[test]
    fn test_accepts_at() {
        assert!(BoxKind::Track.accepts_at(&[track::DEVICES], PointerType::DeviceHost));
        assert!(!BoxKind::Track.accepts_at(&[track::DEVICES], PointerType::RegionTrack));
        assert!(!BoxKind::Track.accepts_at(&[track::LABEL], PointerType::DeviceHost));
        assert!(BoxKind::Track.accepts_at(&[], PointerType::Sidechain));
        assert!(!BoxKind::Device.accepts_at(&[], PointerType::Sidechain));
    }

    #[test]
    fn test_routing_edges() {
        let a = BoxId::new();
        let b = BoxId::new();
        assert_eq!(PointerType::TrackOutput.routing_edge(a, b), Some((a, b)));
        assert_eq!(PointerType::Sidechain.routing_edge(a, b), Some((b, a)));
        assert_eq!(PointerType::RegionTrack.routing_edge(a, b), None);
        assert!(PointerType::DeviceHost.is_routing());
        assert!(!PointerType::TrackRoot.is_routing());
    }
}
