use log::{debug, warn};
use std::cmp::{self, Ordering};
use std::io;

use super::codeblock::CodeBlockTable;
use super::header::TileRect;
use super::locator::TilePart;
use super::packet::{PacketContext, PacketCoordinate, PacketReader, PrecinctLayout};
use super::CodestreamError;

// B.12
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgressionOrder {
    // 0000 0000 Layer-resolution level-component-position progression
    LRLCPP,

    // 0000 0001 Resolution level-layer-component-position progression
    RLLCPP,

    // 0000 0010 Resolution level-position-component-layer progression
    RLPCLP,

    // 0000 0011 Position-component-resolution level-layer progression
    PCRLLP,

    // 0000 0100 Component-position-resolution level-layer progression
    CPRLLP,
}

/// One nesting level of a progression, outermost first in
/// [`ProgressionOrder::axes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Layer,
    Resolution,
    Component,
    Position,
}

impl ProgressionOrder {
    /// All other values are reserved.
    pub fn from_u8(value: u8) -> Option<ProgressionOrder> {
        match value {
            0b0000_0000 => Some(ProgressionOrder::LRLCPP),
            0b0000_0001 => Some(ProgressionOrder::RLLCPP),
            0b0000_0010 => Some(ProgressionOrder::RLPCLP),
            0b0000_0011 => Some(ProgressionOrder::PCRLLP),
            0b0000_0100 => Some(ProgressionOrder::CPRLLP),
            _ => None,
        }
    }

    pub fn value(self) -> u8 {
        match self {
            ProgressionOrder::LRLCPP => 0,
            ProgressionOrder::RLLCPP => 1,
            ProgressionOrder::RLPCLP => 2,
            ProgressionOrder::PCRLLP => 3,
            ProgressionOrder::CPRLLP => 4,
        }
    }

    pub fn axes(self) -> [Axis; 4] {
        match self {
            ProgressionOrder::LRLCPP => [Axis::Layer, Axis::Resolution, Axis::Component, Axis::Position],
            ProgressionOrder::RLLCPP => [Axis::Resolution, Axis::Layer, Axis::Component, Axis::Position],
            ProgressionOrder::RLPCLP => [Axis::Resolution, Axis::Position, Axis::Component, Axis::Layer],
            ProgressionOrder::PCRLLP => [Axis::Position, Axis::Component, Axis::Resolution, Axis::Layer],
            ProgressionOrder::CPRLLP => [Axis::Component, Axis::Position, Axis::Resolution, Axis::Layer],
        }
    }

    /// Whether precincts are visited by their position on the reference grid
    /// rather than by their index.
    pub fn is_position_driven(self) -> bool {
        match self {
            ProgressionOrder::LRLCPP | ProgressionOrder::RLLCPP => false,
            ProgressionOrder::RLPCLP | ProgressionOrder::PCRLLP | ProgressionOrder::CPRLLP => true,
        }
    }
}

/// A progression over a bounded range of layers, resolution levels and
/// components. Start bounds are inclusive, end bounds exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressionChange {
    pub order: ProgressionOrder,
    pub layer_end: usize,
    pub resolution_start: usize,
    pub resolution_end: usize,
    pub component_start: usize,
    pub component_end: usize,
}

impl ProgressionChange {
    /// The single progression of a tile without POC.
    pub fn whole_tile(
        order: ProgressionOrder,
        num_layers: usize,
        max_decomposition_levels: usize,
        num_components: usize,
    ) -> Self {
        Self {
            order,
            layer_end: num_layers,
            resolution_start: 0,
            resolution_end: max_decomposition_levels + 1,
            component_start: 0,
            component_end: num_components,
        }
    }
}

/// First layer not yet visited, per component and resolution level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LayerStarts {
    starts: Vec<Vec<usize>>,
}

impl LayerStarts {
    pub(crate) fn new(decomposition_levels: &[usize]) -> Self {
        Self {
            starts: decomposition_levels
                .iter()
                .map(|&levels| vec![0; levels + 1])
                .collect(),
        }
    }

    fn get(&self, component: usize, resolution: usize) -> usize {
        self.starts[component][resolution]
    }

    /// Marks every layer below the change's end as visited in its range.
    fn complete(&mut self, change: &ProgressionChange) {
        let component_end = cmp::min(change.component_end, self.starts.len());
        for component in change.component_start..component_end {
            let starts = &mut self.starts[component];
            let resolution_end = cmp::min(change.resolution_end, starts.len());
            for resolution in change.resolution_start..resolution_end {
                starts[resolution] = cmp::max(starts[resolution], change.layer_end);
            }
        }
    }
}

// Virtual grid of precinct origins on the reference grid. The first row and
// column sit at the tile origin, the others on a regular lattice starting at
// the smallest precinct origin past it, with the greatest common divisor of
// all precinct sizes as spacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PrecinctGrid {
    origin: u32,
    first: u32,
    step: u32,
    last: u32,
}

impl PrecinctGrid {
    fn new(origin: u32, end: u32) -> Self {
        Self {
            origin,
            first: end,
            step: 0,
            last: origin,
        }
    }

    fn add(&mut self, position: u32, spacing: u32) {
        if position > self.origin {
            self.first = cmp::min(self.first, position);
            self.last = cmp::max(self.last, position);
        }
        self.step = if self.step == 0 {
            spacing
        } else {
            gcd(self.step, spacing)
        };
    }

    /// Index of `position` along this axis of the grid.
    fn locate(&self, position: u32) -> Option<u32> {
        if position == self.origin {
            return Some(0);
        }
        if position < self.first || position > self.last {
            return None;
        }
        let distance = position - self.first;
        match self.step {
            0 if distance == 0 => Some(1),
            0 => None,
            step if distance % step == 0 => Some(1 + distance / step),
            _ => None,
        }
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let remainder = a % b;
        a = b;
        b = remainder;
    }
    a
}

#[derive(Debug, Clone, Copy)]
struct PacketSlot {
    coordinate: PacketCoordinate,
    row: u32,
    col: u32,
}

fn compare_slots(axes: &[Axis; 4], a: &PacketSlot, b: &PacketSlot) -> Ordering {
    for axis in axes.iter() {
        let ordering = match axis {
            Axis::Layer => a.coordinate.layer.cmp(&b.coordinate.layer),
            Axis::Resolution => a.coordinate.resolution.cmp(&b.coordinate.resolution),
            Axis::Component => a.coordinate.component.cmp(&b.coordinate.component),
            Axis::Position => (a.row, a.col, a.coordinate.precinct).cmp(&(
                b.row,
                b.col,
                b.coordinate.precinct,
            )),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Packets of one progression change in the order they appear in the
/// codestream, skipping layers already visited by an earlier change.
pub(crate) fn packet_sequence<P: PrecinctLayout>(
    change: &ProgressionChange,
    tile_rect: TileRect,
    decomposition_levels: &[usize],
    num_layers: usize,
    layer_starts: &LayerStarts,
    precincts: &P,
) -> Vec<PacketCoordinate> {
    let component_end = cmp::min(change.component_end, decomposition_levels.len());
    let layer_end = cmp::min(change.layer_end, num_layers);
    let position_driven = change.order.is_position_driven();

    let mut columns = PrecinctGrid::new(tile_rect.x0, tile_rect.x1);
    let mut rows = PrecinctGrid::new(tile_rect.y0, tile_rect.y1);
    let mut candidates = Vec::new();
    for component in change.component_start..component_end {
        let resolution_end = cmp::min(change.resolution_end, decomposition_levels[component] + 1);
        for resolution in change.resolution_start..resolution_end {
            let first_layer = layer_starts.get(component, resolution);
            if first_layer >= layer_end {
                continue;
            }
            for precinct in 0..precincts.precinct_count(component, resolution) {
                let info = precincts.precinct_info(component, resolution, precinct);
                if position_driven {
                    columns.add(info.grid_x, info.grid_width);
                    rows.add(info.grid_y, info.grid_height);
                }
                candidates.push((component, resolution, precinct, first_layer, info));
            }
        }
    }

    let mut slots = Vec::new();
    for (component, resolution, precinct, first_layer, info) in candidates {
        let (row, col) = if position_driven {
            match (rows.locate(info.grid_y), columns.locate(info.grid_x)) {
                (Some(row), Some(col)) => (row, col),
                _ => {
                    warn!(
                        "Precinct {} of component {}, resolution {} is off the precinct grid, skipping",
                        precinct, component, resolution
                    );
                    continue;
                }
            }
        } else {
            (0, 0)
        };
        for layer in first_layer..layer_end {
            slots.push(PacketSlot {
                coordinate: PacketCoordinate {
                    layer,
                    resolution,
                    component,
                    precinct,
                },
                row,
                col,
            });
        }
    }

    let axes = change.order.axes();
    slots.sort_by(|a, b| compare_slots(&axes, a, b));
    slots.into_iter().map(|slot| slot.coordinate).collect()
}

/// Inputs for walking the packets of one tile.
pub(crate) struct TileWalk<'a> {
    pub(crate) tile: usize,
    pub(crate) tile_rect: TileRect,
    pub(crate) tile_parts: &'a [TilePart],
    pub(crate) changes: &'a [ProgressionChange],
    pub(crate) decomposition_levels: &'a [usize],
    pub(crate) num_layers: usize,
    pub(crate) first_change_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct WalkOutcome {
    /// The allowance or the tile's data ran out before every packet was read.
    pub(crate) budget_reached: bool,
    /// Header length of every packet read, in walk order.
    pub(crate) packet_header_lengths: Vec<u64>,
}

// Tracks the tile-part the packets are currently read from.
struct TilePartCursor<'a> {
    tile_parts: &'a [TilePart],
    current: usize,
    last_byte: u64,
}

impl<'a> TilePartCursor<'a> {
    fn new(tile_parts: &'a [TilePart]) -> Self {
        let mut cursor = Self {
            tile_parts,
            current: 0,
            last_byte: 0,
        };
        cursor.last_byte = cursor.last_byte_of(0);
        cursor
    }

    fn last_byte_of(&self, index: usize) -> u64 {
        let tile_part = &self.tile_parts[index];
        (tile_part.first_packet_offset() + tile_part.body_length()).saturating_sub(1)
    }

    // Moves to the first packet of the next tile-part, if there is one.
    fn advance<R: io::Seek>(&mut self, reader: &mut R) -> io::Result<Option<u64>> {
        if self.current + 1 >= self.tile_parts.len() {
            return Ok(None);
        }
        self.current += 1;
        self.last_byte = self.last_byte_of(self.current);
        let offset = self.tile_parts[self.current].first_packet_offset();
        reader.seek(io::SeekFrom::Start(offset))?;
        Ok(Some(offset))
    }
}

/// Reads the packets of a tile, in the order of its progression changes,
/// until every packet is read or the allowance runs out.
pub(crate) fn walk_tile<R, P>(
    reader: &mut R,
    packets: &mut P,
    table: &mut CodeBlockTable,
    walk: &TileWalk<'_>,
    allowance: &mut u64,
) -> Result<WalkOutcome, CodestreamError>
where
    R: io::Read + io::Seek,
    P: PacketReader,
{
    let mut outcome = WalkOutcome::default();
    let first = match walk.tile_parts.first() {
        Some(tile_part) => tile_part,
        None => return Ok(outcome),
    };
    reader.seek(io::SeekFrom::Start(first.first_packet_offset()))?;

    let mut cursor = TilePartCursor::new(walk.tile_parts);
    let mut layer_starts = LayerStarts::new(walk.decomposition_levels);
    let packed_headers = packets.uses_packed_headers();

    'changes: for change in walk.changes {
        let sequence = packet_sequence(
            change,
            walk.tile_rect,
            walk.decomposition_levels,
            walk.num_layers,
            &layer_starts,
            &*packets,
        );
        for coordinate in sequence {
            let packet = PacketContext {
                tile: walk.tile,
                coordinate,
                index: outcome.packet_header_lengths.len(),
            };
            let mut start = reader.stream_position()?;
            // Packed headers (PPM/PPT) live outside the tile-part body
            if packed_headers {
                packets.read_packet_header(reader, &packet, table, allowance)?;
            }

            // Skips tile-parts without packet data
            while start > cursor.last_byte {
                match cursor.advance(reader)? {
                    Some(offset) => start = offset,
                    None => {
                        outcome.budget_reached = true;
                        break 'changes;
                    }
                }
            }

            if packets.read_resync_marker(reader, &packet, allowance)? {
                outcome.budget_reached = true;
                break 'changes;
            }
            if !packed_headers && packets.read_packet_header(reader, &packet, table, allowance)? {
                outcome.budget_reached = true;
                break 'changes;
            }
            let header_length = reader.stream_position()?.saturating_sub(start);
            outcome.packet_header_lengths.push(header_length);

            if packets.read_packet_body(reader, &packet, table, allowance)? {
                outcome.budget_reached = true;
                break 'changes;
            }
            debug!(
                "Packet l={} r={} c={} p={} of tile {}: offset {}, header length {}, length {}",
                coordinate.layer,
                coordinate.resolution,
                coordinate.component,
                coordinate.precinct,
                walk.tile,
                start,
                header_length,
                reader.stream_position()?.saturating_sub(start)
            );
        }

        layer_starts.complete(change);
        if walk.first_change_only {
            break;
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PrecinctInfo;

    // Every component and resolution has a 2 x 2 grid of precincts covering a
    // 64 x 64 tile.
    struct Grid2x2;

    impl PrecinctLayout for Grid2x2 {
        fn precinct_count(&self, _component: usize, _resolution: usize) -> usize {
            4
        }

        fn precinct_info(&self, _component: usize, _resolution: usize, precinct: usize) -> PrecinctInfo {
            PrecinctInfo {
                grid_x: (precinct as u32 % 2) * 32,
                grid_y: (precinct as u32 / 2) * 32,
                grid_width: 32,
                grid_height: 32,
            }
        }
    }

    const TILE: TileRect = TileRect {
        x0: 0,
        y0: 0,
        x1: 64,
        y1: 64,
    };

    fn sequence(order: ProgressionOrder, levels: &[usize], num_layers: usize) -> Vec<PacketCoordinate> {
        let change = ProgressionChange::whole_tile(
            order,
            num_layers,
            *levels.iter().max().unwrap(),
            levels.len(),
        );
        packet_sequence(
            &change,
            TILE,
            levels,
            num_layers,
            &LayerStarts::new(levels),
            &Grid2x2,
        )
    }

    fn coordinate(layer: usize, resolution: usize, component: usize, precinct: usize) -> PacketCoordinate {
        PacketCoordinate {
            layer,
            resolution,
            component,
            precinct,
        }
    }

    #[test]
    fn test_layer_resolution_order() {
        let packets = sequence(ProgressionOrder::LRLCPP, &[1, 1], 2);
        assert_eq!(packets.len(), 2 * 2 * 2 * 4);
        assert_eq!(packets[0], coordinate(0, 0, 0, 0));
        assert_eq!(packets[3], coordinate(0, 0, 0, 3));
        assert_eq!(packets[4], coordinate(0, 0, 1, 0));
        assert_eq!(packets[8], coordinate(0, 1, 0, 0));
        assert_eq!(packets[16], coordinate(1, 0, 0, 0));
    }

    #[test]
    fn test_resolution_position_order() {
        let packets = sequence(ProgressionOrder::RLPCLP, &[1, 1], 2);
        assert_eq!(packets[0], coordinate(0, 0, 0, 0));
        assert_eq!(packets[1], coordinate(1, 0, 0, 0));
        assert_eq!(packets[2], coordinate(0, 0, 1, 0));
        assert_eq!(packets[4], coordinate(0, 0, 0, 1));
        assert_eq!(packets[16], coordinate(0, 1, 0, 0));
    }

    #[test]
    fn test_component_position_order() {
        let packets = sequence(ProgressionOrder::CPRLLP, &[1, 1], 1);
        assert_eq!(packets[0], coordinate(0, 0, 0, 0));
        assert_eq!(packets[1], coordinate(0, 1, 0, 0));
        assert_eq!(packets[2], coordinate(0, 0, 0, 1));
        assert_eq!(packets[8], coordinate(0, 0, 1, 0));
    }

    #[test]
    fn test_position_component_order() {
        let packets = sequence(ProgressionOrder::PCRLLP, &[1, 1], 1);
        assert_eq!(packets[0], coordinate(0, 0, 0, 0));
        assert_eq!(packets[1], coordinate(0, 1, 0, 0));
        assert_eq!(packets[2], coordinate(0, 0, 1, 0));
        assert_eq!(packets[4], coordinate(0, 0, 0, 1));
    }

    #[test]
    fn test_components_with_fewer_levels() {
        for order in [
            ProgressionOrder::LRLCPP,
            ProgressionOrder::RLLCPP,
            ProgressionOrder::RLPCLP,
            ProgressionOrder::PCRLLP,
            ProgressionOrder::CPRLLP,
        ]
        .iter()
        {
            let packets = sequence(*order, &[2, 0], 1);
            assert_eq!(packets.len(), (3 + 1) * 4, "{:?}", order);
            assert!(packets
                .iter()
                .all(|packet| packet.component == 0 || packet.resolution == 0));
        }
    }

    #[test]
    fn test_later_change_skips_visited_layers() {
        let levels = [1];
        let mut layer_starts = LayerStarts::new(&levels);
        let first = ProgressionChange {
            order: ProgressionOrder::LRLCPP,
            layer_end: 1,
            resolution_start: 0,
            resolution_end: 2,
            component_start: 0,
            component_end: 1,
        };
        layer_starts.complete(&first);

        let second = ProgressionChange::whole_tile(ProgressionOrder::RLLCPP, 3, 1, 1);
        let packets = packet_sequence(&second, TILE, &levels, 3, &layer_starts, &Grid2x2);
        assert_eq!(packets.len(), 2 * 2 * 4);
        assert!(packets.iter().all(|packet| packet.layer >= 1));
    }

    #[test]
    fn test_precinct_grid() {
        let mut grid = PrecinctGrid::new(8, 100);
        grid.add(8, 24);
        grid.add(32, 32);
        grid.add(64, 32);
        grid.add(96, 16);

        assert_eq!(grid.locate(8), Some(0));
        assert_eq!(grid.locate(32), Some(1));
        assert_eq!(grid.locate(64), Some(5));
        assert_eq!(grid.locate(96), Some(9));
        assert_eq!(grid.locate(44), None);
        assert_eq!(grid.locate(104), None);
        assert_eq!(gcd(24, 32), 8);
    }
}
