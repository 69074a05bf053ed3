use log::{debug, info};
use std::io;

use super::allocator::RateAllocator;
use super::codeblock::{CodeBlockKey, CodeBlockTable};
use super::config::{DecoderConfig, RateMode};
use super::header::HeaderDecoder;
use super::locator::{scan_codestream, CodestreamLayout};
use super::packet::{PacketReader, TileContext};
use super::progression::{walk_tile, ProgressionChange, TileWalk};
use super::query::{read_code_block, LayeredCodeBlock};
use super::truncation::simulate_layer_truncation;
use super::CodestreamError;

/// Per-tile figures of the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSummary {
    pub tile_parts: usize,
    pub total_length: u64,
    pub total_header_length: u64,
    /// Bytes of packet data the tile may consume.
    pub allowance: u64,
}

struct ActiveTile {
    index: usize,
    decomposition_levels: Vec<usize>,
    num_layers: usize,
    table: CodeBlockTable,
    budget_reached: bool,
}

/// Reads the packets of one tile at a time from a codestream, within a byte
/// budget, and hands out the compressed data of its code-blocks.
pub struct BitstreamReader<R, H, P> {
    reader: R,
    header: H,
    packets: P,
    config: DecoderConfig,
    layout: CodestreamLayout,
    allocator: RateAllocator,
    target_resolution: usize,
    active: Option<ActiveTile>,
}

impl<R, H, P> BitstreamReader<R, H, P>
where
    R: io::Read + io::Seek,
    H: HeaderDecoder,
    P: PacketReader,
{
    /// Scans the codestream for tile-parts and allocates the byte budget. The
    /// reader must be positioned right after the main header that `header`
    /// was decoded from.
    pub fn new(mut reader: R, mut header: H, packets: P, config: DecoderConfig) -> Result<Self, CodestreamError> {
        let (layout, allocator) = scan_codestream(&mut reader, &mut header, &config)?;
        let target_resolution = config.target_resolution(header.min_decomposition_levels());
        info!(
            "Located {} tile-parts, budget {} bytes, {} bytes of headers",
            layout.num_tile_parts(),
            allocator.budget().bytes(),
            allocator.header_bytes()
        );

        Ok(Self {
            reader,
            header,
            packets,
            config,
            layout,
            allocator,
            target_resolution,
            active: None,
        })
    }

    pub fn layout(&self) -> &CodestreamLayout {
        &self.layout
    }

    pub fn allocator(&self) -> &RateAllocator {
        &self.allocator
    }

    pub fn header(&self) -> &H {
        &self.header
    }

    pub fn packets(&self) -> &P {
        &self.packets
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Highest resolution level that is decoded.
    pub fn target_resolution(&self) -> usize {
        self.target_resolution
    }

    /// Total bytes consumed so far, headers included.
    pub fn consumed_bytes(&self) -> u64 {
        self.allocator.consumed()
    }

    pub fn num_tiles(&self) -> usize {
        self.header.num_tiles()
    }

    pub fn tile_summary(&self, tile: usize) -> Option<TileSummary> {
        let layout = self.layout.tile(tile)?;
        Some(TileSummary {
            tile_parts: layout.tile_parts().len(),
            total_length: layout.total_length(),
            total_header_length: layout.total_header_length(),
            allowance: self.allocator.snapshot().get(tile).copied().unwrap_or(0),
        })
    }

    /// Index of the active tile.
    pub fn active_tile(&self) -> Option<usize> {
        self.active.as_ref().map(|active| active.index)
    }

    /// Code-block table of the active tile.
    pub fn code_block_table(&self) -> Option<&CodeBlockTable> {
        self.active.as_ref().map(|active| &active.table)
    }

    /// Whether reading the active tile stopped short of its last packet.
    pub fn budget_reached(&self) -> bool {
        self.active.as_ref().map_or(false, |active| active.budget_reached)
    }

    /// Selects the tile in column `x` and row `y` of the tile grid.
    pub fn set_tile(&mut self, x: usize, y: usize) -> Result<(), CodestreamError> {
        let num_tiles_x = self.header.num_tiles_x();
        if x >= num_tiles_x || y >= self.header.num_tiles_y() {
            return Err(CodestreamError::TileOutOfRange { x, y });
        }
        self.set_tile_index(y * num_tiles_x + x)
    }

    /// Selects the next tile in raster order, or the first one when no tile
    /// is active.
    pub fn next_tile(&mut self) -> Result<(), CodestreamError> {
        let next = match self.active_tile() {
            Some(tile) => tile + 1,
            None => 0,
        };
        if next >= self.num_tiles() {
            return Err(CodestreamError::NoNextTile);
        }
        self.set_tile_index(next)
    }

    /// Selects a tile and reads all of its packets that fit its allowance.
    ///
    /// Selecting tile 0 starts decoding over: the allowances of every tile
    /// are restored to their values after the scan.
    pub fn set_tile_index(&mut self, tile: usize) -> Result<(), CodestreamError> {
        let num_tiles_x = self.header.num_tiles_x().max(1);
        if tile >= self.num_tiles() {
            return Err(CodestreamError::TileOutOfRange {
                x: tile % num_tiles_x,
                y: tile / num_tiles_x,
            });
        }
        if tile == 0 {
            self.allocator.restart();
        }
        self.active = None;

        let num_components = self.header.num_components();
        let num_layers = self.header.num_layers(tile);
        let decomposition_levels: Vec<usize> = (0..num_components)
            .map(|component| self.header.decomposition_levels(tile, component))
            .collect();
        let max_levels = decomposition_levels.iter().copied().max().unwrap_or(0);
        let changes = match (self.config.progression_override(), self.header.progression_changes(tile)) {
            (Some(changes), _) if !changes.is_empty() => changes.to_vec(),
            (_, Some(changes)) if !changes.is_empty() => changes,
            _ => vec![ProgressionChange::whole_tile(
                self.header.progression_order(tile),
                num_layers,
                max_levels,
                num_components,
            )],
        };

        self.packets.restart(&TileContext {
            tile,
            num_layers,
            decomposition_levels: &decomposition_levels,
            mode: self.allocator.mode(),
            max_code_blocks: self.config.max_code_blocks(),
        })?;

        let tile_layout = self.layout.tile(tile).cloned().unwrap_or_default();
        let walk = TileWalk {
            tile,
            tile_rect: self.header.tile_rect(tile),
            tile_parts: tile_layout.tile_parts(),
            changes: &changes,
            decomposition_levels: &decomposition_levels,
            num_layers,
            first_change_only: self.config.first_progression_only(),
        };
        let mut table = CodeBlockTable::new(num_layers);
        let allowance = self.allocator.allowance(tile);

        let budget_reached = match self.allocator.mode() {
            RateMode::Truncation => {
                let outcome = walk_tile(
                    &mut self.reader,
                    &mut self.packets,
                    &mut table,
                    &walk,
                    self.allocator.allowance_mut(tile),
                )?;
                let left = self.allocator.allowance(tile);
                self.allocator.charge(allowance.saturating_sub(left));
                if outcome.budget_reached {
                    *self.allocator.allowance_mut(tile) = 0;
                }
                outcome.budget_reached
            }
            RateMode::Parsing => {
                let mut unbounded = u64::MAX;
                let outcome = walk_tile(&mut self.reader, &mut self.packets, &mut table, &walk, &mut unbounded)?;
                let body_length = tile_layout.body_length();
                if allowance < body_length {
                    let consumed = simulate_layer_truncation(
                        &mut table,
                        &outcome.packet_header_lengths,
                        self.allocator.allowance_mut(tile),
                    );
                    self.allocator.charge(consumed);
                    true
                } else {
                    self.allocator.charge(body_length);
                    self.allocator.carry_over(tile, allowance - body_length);
                    outcome.budget_reached
                }
            }
        };
        debug!(
            "Tile {}: {} code-blocks, {} bytes consumed so far",
            tile,
            table.len(),
            self.allocator.consumed()
        );

        self.active = Some(ActiveTile {
            index: tile,
            decomposition_levels,
            num_layers,
            table,
            budget_reached,
        });
        Ok(())
    }

    /// Compressed data of a code-block of the active tile, over `count`
    /// layers starting at `first_layer`, or over all remaining layers when
    /// `count` is `None`.
    pub fn code_block(
        &mut self,
        key: CodeBlockKey,
        first_layer: usize,
        count: Option<usize>,
    ) -> Result<LayeredCodeBlock, CodestreamError> {
        let active = match self.active.as_ref() {
            Some(active) => active,
            None => return Err(CodestreamError::NoTileSelected),
        };

        let levels = match active.decomposition_levels.get(key.component) {
            Some(&levels) => levels,
            None => {
                return Err(CodestreamError::CodeBlockNotFound {
                    tile: active.index,
                    key,
                })
            }
        };
        let min_levels = self.header.min_decomposition_levels();
        let max_resolution = (self.target_resolution + levels).saturating_sub(min_levels);
        if key.resolution > max_resolution {
            return Err(CodestreamError::ResolutionNotDecoded {
                resolution: key.resolution,
                max_resolution,
            });
        }

        let num_layers = active.num_layers;
        let count = count.unwrap_or_else(|| num_layers.saturating_sub(first_layer));
        let out_of_range = first_layer
            .checked_add(count)
            .map_or(true, |end| end > num_layers);
        if first_layer >= num_layers || out_of_range {
            return Err(CodestreamError::InvalidLayerRange {
                first: first_layer,
                count,
                num_layers,
            });
        }
        let mut layer_end = first_layer + count;
        if let Some(max_layers) = self.config.max_layers() {
            layer_end = layer_end.min(max_layers.max(first_layer));
        }

        let record = match active.table.get(&key) {
            Some(record) => record,
            None => {
                return Err(CodestreamError::CodeBlockNotFound {
                    tile: active.index,
                    key,
                })
            }
        };
        let style = self.header.code_block_style(active.index, key.component);
        let mut block = read_code_block(&mut self.reader, key, record, first_layer, layer_end, style)?;
        block.layers_requested = count;
        Ok(block)
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}
