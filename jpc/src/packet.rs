use std::io;

use super::codeblock::CodeBlockTable;
use super::config::RateMode;
use super::CodestreamError;

/// Layer, resolution level, component and precinct of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketCoordinate {
    pub layer: usize,
    pub resolution: usize,
    pub component: usize,
    pub precinct: usize,
}

/// A packet about to be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketContext {
    pub tile: usize,
    pub coordinate: PacketCoordinate,
    /// Position of the packet in walk order within the tile, starting at 0.
    /// Code-blocks refer to their packets by this index.
    pub index: usize,
}

/// Origin and size of a precinct, projected on the reference grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrecinctInfo {
    pub grid_x: u32,
    pub grid_y: u32,
    pub grid_width: u32,
    pub grid_height: u32,
}

/// Parameters of the tile whose packets are about to be read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileContext<'a> {
    pub tile: usize,
    pub num_layers: usize,
    /// Decomposition levels per component.
    pub decomposition_levels: &'a [usize],
    pub mode: RateMode,
    /// Stop decoding after this many code-blocks.
    pub max_code_blocks: Option<usize>,
}

/// Precincts of the active tile.
pub trait PrecinctLayout {
    fn precinct_count(&self, component: usize, resolution: usize) -> usize;

    fn precinct_info(&self, component: usize, resolution: usize, precinct: usize) -> PrecinctInfo;
}

/// Decoder of packet headers and bodies (B.9, B.10).
///
/// Every read method is handed the byte allowance of the tile and returns
/// `true` when the allowance, or the code-block limit, ran out before the
/// packet part could be read completely. Nothing of such a partial read is
/// recorded in the table.
pub trait PacketReader: PrecinctLayout {
    /// Resets the decoder for a new tile.
    fn restart(&mut self, tile: &TileContext<'_>) -> Result<(), CodestreamError>;

    /// Whether packet headers are carried in PPM or PPT segments instead of
    /// in front of each packet body.
    fn uses_packed_headers(&self) -> bool {
        false
    }

    /// Reads an SOP marker segment, if present.
    fn read_resync_marker<R: io::Read + io::Seek>(
        &mut self,
        reader: &mut R,
        packet: &PacketContext,
        allowance: &mut u64,
    ) -> Result<bool, CodestreamError>;

    /// Reads the packet header, recording for each included code-block its
    /// new coding passes, contribution lengths and the packet index.
    fn read_packet_header<R: io::Read + io::Seek>(
        &mut self,
        reader: &mut R,
        packet: &PacketContext,
        table: &mut CodeBlockTable,
        allowance: &mut u64,
    ) -> Result<bool, CodestreamError>;

    /// Reads past the packet body, recording the offset of each code-block
    /// contribution.
    fn read_packet_body<R: io::Read + io::Seek>(
        &mut self,
        reader: &mut R,
        packet: &PacketContext,
        table: &mut CodeBlockTable,
        allowance: &mut u64,
    ) -> Result<bool, CodestreamError>;
}
