#![allow(dead_code)]

use std::io::{self, Cursor};

use jpc_bitstream::{
    decode_main_header, CodeBlockGeometry, CodeBlockKey, CodeBlockTable, CodestreamError,
    CodestreamHeader, LayerContribution, PacketContext, PacketCoordinate, PacketReader,
    PrecinctInfo, PrecinctLayout, TileContext,
};

pub struct TilePartFixture {
    pub tile: u16,
    pub index: u8,
    pub no_tile_parts: u8,
    pub body_length: usize,
    // Length written to Psot, 0 included; the real length when None
    pub psot: Option<u32>,
    // Length of a COM segment in the tile-part header
    pub comment_length: usize,
}

/// Writes small but well-formed codestreams: SOC, SIZ, COD, optional COC and
/// POC, tile-parts with filler bodies and EOC.
pub struct CodestreamBuilder {
    width: u32,
    height: u32,
    tile_width: u32,
    tile_height: u32,
    components: u16,
    order: u8,
    layers: u16,
    levels: u8,
    code_block_style: u8,
    component_levels: Vec<(u8, u8)>,
    progression_changes: Vec<[u8; 7]>,
    tile_parts: Vec<TilePartFixture>,
    end_marker: bool,
    cut: usize,
}

impl CodestreamBuilder {
    pub fn new(width: u32, height: u32, tile_width: u32, tile_height: u32) -> Self {
        Self {
            width,
            height,
            tile_width,
            tile_height,
            components: 1,
            order: 0,
            layers: 1,
            levels: 0,
            code_block_style: 0,
            component_levels: Vec::new(),
            progression_changes: Vec::new(),
            tile_parts: Vec::new(),
            end_marker: true,
            cut: 0,
        }
    }

    pub fn components(mut self, components: u16) -> Self {
        self.components = components;
        self
    }

    pub fn order(mut self, order: u8) -> Self {
        self.order = order;
        self
    }

    pub fn layers(mut self, layers: u16) -> Self {
        self.layers = layers;
        self
    }

    pub fn levels(mut self, levels: u8) -> Self {
        self.levels = levels;
        self
    }

    pub fn code_block_style(mut self, style: u8) -> Self {
        self.code_block_style = style;
        self
    }

    pub fn component_levels(mut self, component: u8, levels: u8) -> Self {
        self.component_levels.push((component, levels));
        self
    }

    /// RSpoc, CSpoc, LYEpoc, REpoc, CEpoc, Ppoc
    pub fn progression_change(
        mut self,
        resolution_start: u8,
        component_start: u8,
        layer_end: u16,
        resolution_end: u8,
        component_end: u8,
        order: u8,
    ) -> Self {
        let layer_end = layer_end.to_be_bytes();
        self.progression_changes.push([
            resolution_start,
            component_start,
            layer_end[0],
            layer_end[1],
            resolution_end,
            component_end,
            order,
        ]);
        self
    }

    pub fn tile_part(mut self, tile: u16, index: u8, no_tile_parts: u8, body_length: usize) -> Self {
        self.tile_parts.push(TilePartFixture {
            tile,
            index,
            no_tile_parts,
            body_length,
            psot: None,
            comment_length: 0,
        });
        self
    }

    pub fn tile_part_fixture(mut self, fixture: TilePartFixture) -> Self {
        self.tile_parts.push(fixture);
        self
    }

    pub fn without_end_marker(mut self) -> Self {
        self.end_marker = false;
        self
    }

    /// Drops the last `bytes` bytes of the codestream.
    pub fn cut(mut self, bytes: usize) -> Self {
        self.cut = bytes;
        self
    }

    pub fn main_header_length(&self) -> usize {
        let mut length = 2 + 2 + 38 + 3 * self.components as usize + 2 + 12;
        length += self.component_levels.len() * (2 + 9);
        if !self.progression_changes.is_empty() {
            length += 2 + 2 + 7 * self.progression_changes.len();
        }
        length
    }

    pub fn tile_part_header_length(fixture: &TilePartFixture) -> usize {
        let comment = if fixture.comment_length > 0 {
            2 + fixture.comment_length
        } else {
            0
        };
        12 + comment + 2
    }

    pub fn build(&self) -> Vec<u8> {
        let mut bytes = vec![0xFF, 0x4F];

        // SIZ
        bytes.extend_from_slice(&[0xFF, 0x51]);
        bytes.extend_from_slice(&(38 + 3 * self.components).to_be_bytes());
        bytes.extend_from_slice(&0u16.to_be_bytes());
        for value in [
            self.width,
            self.height,
            0,
            0,
            self.tile_width,
            self.tile_height,
            0,
            0,
        ]
        .iter()
        {
            bytes.extend_from_slice(&value.to_be_bytes());
        }
        bytes.extend_from_slice(&self.components.to_be_bytes());
        for _ in 0..self.components {
            bytes.extend_from_slice(&[7, 1, 1]);
        }

        // COD
        bytes.extend_from_slice(&[0xFF, 0x52, 0x00, 0x0C, 0x00, self.order]);
        bytes.extend_from_slice(&self.layers.to_be_bytes());
        bytes.extend_from_slice(&[0x00, self.levels, 4, 4, self.code_block_style, 0x00]);

        // COC
        for (component, levels) in self.component_levels.iter() {
            bytes.extend_from_slice(&[0xFF, 0x53, 0x00, 0x09, *component, 0x00]);
            bytes.extend_from_slice(&[*levels, 4, 4, self.code_block_style, 0x00]);
        }

        // POC
        if !self.progression_changes.is_empty() {
            bytes.extend_from_slice(&[0xFF, 0x5F]);
            bytes.extend_from_slice(&(2 + 7 * self.progression_changes.len() as u16).to_be_bytes());
            for change in self.progression_changes.iter() {
                bytes.extend_from_slice(change);
            }
        }

        for fixture in self.tile_parts.iter() {
            let header_length = Self::tile_part_header_length(fixture);
            let length = (header_length + fixture.body_length) as u32;
            bytes.extend_from_slice(&[0xFF, 0x90, 0x00, 0x0A]);
            bytes.extend_from_slice(&fixture.tile.to_be_bytes());
            bytes.extend_from_slice(&fixture.psot.unwrap_or(length).to_be_bytes());
            bytes.push(fixture.index);
            bytes.push(fixture.no_tile_parts);
            if fixture.comment_length > 0 {
                bytes.extend_from_slice(&[0xFF, 0x64]);
                bytes.extend_from_slice(&(fixture.comment_length as u16).to_be_bytes());
                bytes.extend(std::iter::repeat(0x41).take(fixture.comment_length - 2));
            }
            bytes.extend_from_slice(&[0xFF, 0x93]);
            let seed = fixture.tile as usize * 31 + fixture.index as usize * 7;
            bytes.extend((0..fixture.body_length).map(|i| ((seed + i) % 251) as u8));
        }

        if self.end_marker {
            bytes.extend_from_slice(&[0xFF, 0xD9]);
        }
        let length = bytes.len().saturating_sub(self.cut);
        bytes.truncate(length);
        bytes
    }

    /// The codestream with its main header decoded.
    pub fn open(&self) -> (Cursor<Vec<u8>>, CodestreamHeader) {
        let mut reader = Cursor::new(self.build());
        let header = decode_main_header(&mut reader).unwrap();
        (reader, header)
    }
}

/// Packet reader over scripted packets. Every precinct holds a single
/// code-block, and every packet is made of a fixed size header followed by a
/// fixed size contribution.
pub struct ScriptedPackets {
    pub header_length: u64,
    pub body_length: u32,
    pub passes: u32,
    /// Layers from this one on contribute no data.
    pub empty_layers_from: Option<usize>,
    /// Precincts per side of each resolution level.
    pub precincts_per_side: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub num_tiles_x: usize,
    pub visited: Vec<PacketCoordinate>,
    tile: usize,
    max_code_blocks: Option<usize>,
    code_blocks_read: usize,
}

impl ScriptedPackets {
    pub fn new(header_length: u64, body_length: u32, tile_width: u32, tile_height: u32, num_tiles_x: usize) -> Self {
        Self {
            header_length,
            body_length,
            passes: 3,
            empty_layers_from: None,
            precincts_per_side: 1,
            tile_width,
            tile_height,
            num_tiles_x,
            visited: Vec::new(),
            tile: 0,
            max_code_blocks: None,
            code_blocks_read: 0,
        }
    }

    pub fn with_precincts_per_side(mut self, precincts_per_side: u32) -> Self {
        self.precincts_per_side = precincts_per_side;
        self
    }

    pub fn with_empty_layers_from(mut self, layer: usize) -> Self {
        self.empty_layers_from = Some(layer);
        self
    }

    pub fn packet_length(&self) -> usize {
        (self.header_length + u64::from(self.body_length)) as usize
    }

    /// Number of packets of a tile with `layers` layers and the given
    /// decomposition levels per component.
    pub fn num_packets(&self, layers: usize, levels: &[usize]) -> usize {
        let precincts = (self.precincts_per_side * self.precincts_per_side) as usize;
        layers * levels.iter().map(|levels| (levels + 1) * precincts).sum::<usize>()
    }

    pub fn key(&self, coordinate: &PacketCoordinate) -> CodeBlockKey {
        let side = self.precincts_per_side as usize;
        CodeBlockKey::new(
            coordinate.component,
            coordinate.resolution,
            if coordinate.resolution == 0 { 0 } else { 1 },
            coordinate.precinct / side,
            coordinate.precinct % side,
        )
    }

    fn contribution_length(&self, layer: usize) -> u32 {
        match self.empty_layers_from {
            Some(empty) if layer >= empty => 0,
            _ => self.body_length,
        }
    }
}

impl PrecinctLayout for ScriptedPackets {
    fn precinct_count(&self, _component: usize, _resolution: usize) -> usize {
        (self.precincts_per_side * self.precincts_per_side) as usize
    }

    fn precinct_info(&self, _component: usize, _resolution: usize, precinct: usize) -> PrecinctInfo {
        let side = self.precincts_per_side;
        let width = self.tile_width / side;
        let height = self.tile_height / side;
        let x0 = (self.tile % self.num_tiles_x) as u32 * self.tile_width;
        let y0 = (self.tile / self.num_tiles_x) as u32 * self.tile_height;
        PrecinctInfo {
            grid_x: x0 + (precinct as u32 % side) * width,
            grid_y: y0 + (precinct as u32 / side) * height,
            grid_width: width,
            grid_height: height,
        }
    }
}

impl PacketReader for ScriptedPackets {
    fn restart(&mut self, tile: &TileContext<'_>) -> Result<(), CodestreamError> {
        self.tile = tile.tile;
        self.max_code_blocks = tile.max_code_blocks;
        self.code_blocks_read = 0;
        self.visited.clear();
        Ok(())
    }

    fn read_resync_marker<R: io::Read + io::Seek>(
        &mut self,
        _reader: &mut R,
        _packet: &PacketContext,
        _allowance: &mut u64,
    ) -> Result<bool, CodestreamError> {
        Ok(false)
    }

    fn read_packet_header<R: io::Read + io::Seek>(
        &mut self,
        reader: &mut R,
        packet: &PacketContext,
        table: &mut CodeBlockTable,
        allowance: &mut u64,
    ) -> Result<bool, CodestreamError> {
        if let Some(max) = self.max_code_blocks {
            if self.code_blocks_read >= max {
                return Ok(true);
            }
        }
        if *allowance < self.header_length {
            return Ok(true);
        }
        reader.seek(io::SeekFrom::Current(self.header_length as i64))?;
        *allowance -= self.header_length;

        let key = self.key(&packet.coordinate);
        table
            .insert(key, CodeBlockGeometry::default())
            .mark_packet(packet.coordinate.layer, packet.index)?;
        self.visited.push(packet.coordinate);
        Ok(false)
    }

    fn read_packet_body<R: io::Read + io::Seek>(
        &mut self,
        reader: &mut R,
        packet: &PacketContext,
        table: &mut CodeBlockTable,
        allowance: &mut u64,
    ) -> Result<bool, CodestreamError> {
        let layer = packet.coordinate.layer;
        let length = self.contribution_length(layer);
        if *allowance < u64::from(length) {
            return Ok(true);
        }
        let offset = reader.stream_position()?;
        if length > 0 {
            let key = self.key(&packet.coordinate);
            table.insert(key, CodeBlockGeometry::default()).set_layer(
                layer,
                LayerContribution {
                    offset,
                    length,
                    truncation_points: self.passes,
                    segment_lengths: None,
                },
            )?;
            self.code_blocks_read += 1;
        }
        reader.seek(io::SeekFrom::Current(i64::from(length)))?;
        *allowance -= u64::from(length);
        Ok(false)
    }
}
