//! GOP (Group of Pictures) structure for H.264 encoding.
//!
//! Frame types, B-pyramid placement and structural dependencies are a pure
//! function of the configuration and a display position relative to the last
//! IDR. `FrameTypeGenerator` only adds a running counter and the IDR origin on
//! top, so the sequence can be re-derived at any point after a reset.
//!
//! B frames inside a mini-GOP are placed by recursive bisection. With four
//! frames between anchors and a pyramid depth of 2:
//! - Display order: I(0) B(1) B(2) B(3) P(4)
//! - Pyramid level:  -    1    0    1    -
//! - Encode order:  I(0) P(4) B(2) B(1) B(3)

use super::task::FieldPair;
use super::{EncodeConfig, PicStruct};

/// Frame type in GOP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GopFrameType {
    /// IDR frame.
    Idr,
    /// I frame (intra).
    I,
    /// P frame (predicted).
    P,
    /// B frame (bidirectional).
    B,
}

impl GopFrameType {
    /// Whether this frame type is an anchor (never reordered behind later frames).
    pub fn is_anchor(&self) -> bool {
        matches!(self, Self::Idr | Self::I | Self::P)
    }

    /// Whether this is an IDR frame.
    pub fn is_idr(&self) -> bool {
        matches!(self, Self::Idr)
    }

    /// Whether this is an intra frame (I or IDR).
    pub fn is_intra(&self) -> bool {
        matches!(self, Self::Idr | Self::I)
    }

    /// Whether this is a B frame.
    pub fn is_b(&self) -> bool {
        matches!(self, Self::B)
    }
}

/// Location of a frame inside its mini-GOP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BiFrameLocation {
    /// Mini-GOP index since the last IDR.
    pub mini_gop_index: u32,
    /// Position among the B frames of the mini-GOP (0 for anchors).
    pub position: u32,
    /// Encode rank among the B frames of the mini-GOP.
    pub encoding_rank: u32,
    /// Pyramid level (0 is encoded first among B frames).
    pub level: u32,
    /// Whether the frame is used as a reference.
    pub reference: bool,
}

/// Display orders a frame depends on, implied by the GOP structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StructuralDeps {
    /// Nearest reference before the frame.
    pub forward: Option<u32>,
    /// Nearest reference after the frame (B frames only).
    pub backward: Option<u32>,
    /// Anchor opening the mini-GOP.
    pub previous_anchor: Option<u32>,
    /// Anchor closing the mini-GOP (B frames only).
    pub next_anchor: Option<u32>,
}

/// Everything the generator derives for one display position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GopFrame {
    /// Absolute display order.
    pub display_order: u32,
    /// Display order of the IDR opening this period.
    pub idr_display_order: u32,
    /// Frame type per field (equal for progressive frames).
    pub frame_type: FieldPair<GopFrameType>,
    /// Whether the picture is a reference.
    pub reference: bool,
    /// Mini-GOP placement.
    pub location: BiFrameLocation,
    /// Structural dependencies (absolute display orders).
    pub deps: StructuralDeps,
    /// Protected from eviction ahead of other references.
    pub key_reference: bool,
    /// Temporal layer.
    pub temporal_id: u8,
}

impl GopFrame {
    /// Type of the field coded first.
    pub fn first_type(&self, pic_struct: PicStruct) -> GopFrameType {
        self.frame_type.get(pic_struct.first_field())
    }
}

/// GOP parameters; a pure function from display position to frame layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GopParams {
    /// Distance between I frames (0 = infinite).
    pub gop_pic_size: u32,
    /// Distance between anchors.
    pub gop_ref_dist: u32,
    /// Distance between IDR frames (0 = first frame only).
    pub idr_distance: u32,
    /// Close every GOP.
    pub closed_gop: bool,
    /// B-pyramid depth.
    pub b_pyramid_depth: u32,
    /// Key-reference distance.
    pub ref_base_distance: u32,
    /// Temporal layers.
    pub temporal_layers: u32,
    /// Picture structure.
    pub pic_struct: PicStruct,
}

impl GopParams {
    /// Extract GOP parameters from a session configuration.
    pub fn from_config(config: &EncodeConfig) -> Self {
        Self {
            gop_pic_size: config.gop_pic_size,
            gop_ref_dist: config.gop_ref_dist.max(1),
            idr_distance: config.idr_distance,
            closed_gop: config.closed_gop,
            b_pyramid_depth: config.b_pyramid_depth,
            ref_base_distance: config.ref_base_distance,
            temporal_layers: config.temporal_layers.max(1),
            pic_struct: config.pic_struct,
        }
    }

    /// Effective GOP length. An infinite GOP with a finite IDR distance uses the IDR distance.
    fn gop_len(&self) -> Option<u32> {
        match (self.gop_pic_size, self.idr_distance) {
            (0, 0) => None,
            (0, idr) => Some(idr),
            (gop, _) => Some(gop),
        }
    }

    fn is_idr_position(&self, o: u32) -> bool {
        o == 0 || (self.idr_distance > 0 && o % self.idr_distance == 0)
    }

    /// Whether the GOP ending at `boundary` is closed (last frame switched to P).
    fn closes_at(&self, boundary: u32) -> bool {
        self.closed_gop || self.is_idr_position(boundary)
    }

    fn pyramid(&self) -> bool {
        self.b_pyramid_depth >= 2
    }

    /// Frame type at position `o` relative to the last IDR.
    pub fn frame_type_at(&self, o: u32) -> GopFrameType {
        if self.is_idr_position(o) {
            return GopFrameType::Idr;
        }
        let g = self.gop_ref_dist;
        let (rel, len) = match self.gop_len() {
            Some(n) => (o % n, Some(n)),
            None => (o, None),
        };
        if rel == 0 {
            return GopFrameType::I;
        }
        if rel % g == 0 {
            return GopFrameType::P;
        }
        if let Some(n) = len {
            if rel + 1 == n && self.closes_at(o - rel + n) {
                return GopFrameType::P;
            }
        }
        GopFrameType::B
    }

    /// Anchors bounding the mini-GOP containing `o` (relative positions).
    fn mini_gop_bounds(&self, o: u32) -> (u32, u32) {
        let g = self.gop_ref_dist;
        let (gop_start, len) = match self.gop_len() {
            Some(n) => (o - o % n, Some(n)),
            None => (0, None),
        };
        let a0 = gop_start + ((o - gop_start) / g) * g;
        let mut a1 = a0 + g;
        if let Some(n) = len {
            let boundary = gop_start + n;
            let end = if self.closes_at(boundary) { boundary - 1 } else { boundary };
            a1 = a1.min(end);
        }
        (a0, a1)
    }

    fn mini_gop_index(&self, a0: u32) -> u32 {
        let g = self.gop_ref_dist;
        match self.gop_len() {
            Some(n) => (a0 / n) * n.div_ceil(g) + (a0 % n) / g,
            None => a0 / g,
        }
    }

    fn temporal_id(&self, o: u32) -> u8 {
        let layers = self.temporal_layers;
        if layers <= 1 || o == 0 {
            return 0;
        }
        let top = layers - 1;
        (top - o.trailing_zeros().min(top)) as u8
    }

    /// Derive the full layout of display position `display_order` for an IDR at `origin`.
    pub fn frame_at(&self, origin: u32, display_order: u32) -> GopFrame {
        debug_assert!(display_order >= origin);
        let o = display_order.saturating_sub(origin);
        let base = self.frame_type_at(o);
        let temporal_id = self.temporal_id(o);
        let (a0, a1) = self.mini_gop_bounds(o);

        let mut location = BiFrameLocation {
            mini_gop_index: self.mini_gop_index(a0),
            ..Default::default()
        };
        let mut deps = StructuralDeps::default();

        let reference = match base {
            GopFrameType::Idr | GopFrameType::I => true,
            GopFrameType::P => {
                let g = self.gop_ref_dist;
                let gop_start = self.gop_len().map_or(0, |n| o - o % n);
                let prev = gop_start + ((o - gop_start - 1) / g) * g;
                deps.forward = Some(prev + origin);
                deps.previous_anchor = Some(prev + origin);
                self.temporal_layers == 1 || u32::from(temporal_id) + 1 < self.temporal_layers
            }
            GopFrameType::B => {
                let placed = self.place_b(o - a0 - 1, a1 - a0 - 1, a0);
                location.position = o - a0 - 1;
                location.encoding_rank = placed.rank;
                location.level = placed.level;
                deps.forward = Some(placed.lo + origin);
                deps.backward = Some(placed.hi + origin);
                deps.previous_anchor = Some(a0 + origin);
                deps.next_anchor = Some(a1 + origin);
                placed.reference
            }
        };
        location.reference = reference;

        let key_reference = base.is_intra()
            || (base == GopFrameType::P
                && self.ref_base_distance > 0
                && o % self.ref_base_distance == 0);

        let second = if base.is_intra() { GopFrameType::P } else { base };
        let frame_type = match self.pic_struct {
            PicStruct::Progressive => FieldPair::splat(base),
            PicStruct::TopFieldFirst => FieldPair::new(base, second),
            PicStruct::BottomFieldFirst => FieldPair::new(second, base),
        };

        GopFrame {
            display_order,
            idr_display_order: origin,
            frame_type,
            reference,
            location,
            deps,
            key_reference,
            temporal_id,
        }
    }

    /// Place B frame `index` of `count` by recursive bisection.
    fn place_b(&self, index: u32, count: u32, a0: u32) -> PlacedB {
        let mut placed = PlacedB {
            level: 0,
            rank: 0,
            reference: false,
            lo: a0,
            hi: a0 + count + 1,
        };
        if !self.pyramid() {
            placed.rank = index;
            return placed;
        }

        let (mut begin, mut end) = (0, count);
        loop {
            let pivot = (begin + end) / 2;
            let is_ref = end - begin > 1 && placed.level + 1 < self.b_pyramid_depth;
            if index == pivot {
                placed.reference = is_ref;
                return placed;
            }
            let pivot_order = a0 + 1 + pivot;
            placed.rank += 1;
            if index < pivot {
                end = pivot;
                if is_ref {
                    placed.hi = pivot_order;
                }
            } else {
                placed.rank += pivot - begin;
                begin = pivot + 1;
                if is_ref {
                    placed.lo = pivot_order;
                }
            }
            placed.level += 1;
        }
    }
}

struct PlacedB {
    level: u32,
    rank: u32,
    reference: bool,
    lo: u32,
    hi: u32,
}

/// GOP structure manager.
///
/// Walks display order and stamps each position. The only state beyond the
/// configuration is the running counter and the display order of the last IDR.
#[derive(Debug, Clone)]
pub struct FrameTypeGenerator {
    params: GopParams,
    /// Display order of the last IDR.
    origin: u32,
    /// Display order of the current position.
    counter: u32,
}

impl FrameTypeGenerator {
    /// Create a generator positioned at the first frame.
    pub fn new(params: GopParams) -> Self {
        Self {
            params,
            origin: 0,
            counter: 0,
        }
    }

    /// GOP parameters.
    pub fn params(&self) -> &GopParams {
        &self.params
    }

    /// Display order of the current position.
    pub fn display_order(&self) -> u32 {
        self.counter
    }

    /// Display order of the IDR opening the current period.
    pub fn idr_origin(&self) -> u32 {
        self.origin
    }

    /// Layout of the current position.
    pub fn current(&self) -> GopFrame {
        self.params.frame_at(self.origin, self.counter)
    }

    /// Field types of the current position.
    pub fn get(&self) -> FieldPair<GopFrameType> {
        self.current().frame_type
    }

    /// Mini-GOP location of the current position.
    pub fn get_location(&self) -> BiFrameLocation {
        self.current().location
    }

    /// Advance to the next display position.
    pub fn next(&mut self) {
        self.counter += 1;
    }

    /// Return the current position and advance.
    pub fn get_next_frame(&mut self) -> GopFrame {
        let frame = self.current();
        self.next();
        frame
    }

    /// Re-derive a position already passed, relative to the current IDR origin.
    ///
    /// Positions before the origin belong to a closed period and cannot be re-derived.
    pub fn frame_at(&self, display_order: u32) -> Option<GopFrame> {
        (display_order >= self.origin).then(|| self.params.frame_at(self.origin, display_order))
    }

    /// Make the current position an IDR.
    pub fn request_idr(&mut self) {
        self.origin = self.counter;
    }

    /// Make `display_order` an IDR and re-derive everything after it.
    pub fn restart_at(&mut self, display_order: u32) {
        self.origin = display_order;
        self.counter = self.counter.max(display_order);
    }

    /// Reset the GOP structure to the start of a stream.
    pub fn reset(&mut self) {
        self.origin = 0;
        self.counter = 0;
    }
}
