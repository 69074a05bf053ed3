use log::{info, warn};
use std::io;

use super::allocator::{Admission, RateAllocator};
use super::config::DecoderConfig;
use super::header::HeaderDecoder;
use super::{
    read_marker, read_u16, read_u32, read_u8, CodestreamError, MARKER_SYMBOL_EOC,
    MARKER_SYMBOL_SOT,
};

// Isot values of 65535 are reserved
const MAX_TILE_INDEX: u16 = 65534;

// TPsot values of 255 are reserved
const MAX_TILE_PART_INDEX: u8 = 254;

// Psot values are kept below 2^31
const MAX_TILE_PART_LENGTH: u32 = 1 << 31;

// Fixed length of the SOT marker segment
const SOT_SEGMENT_LENGTH: u16 = 10;

// A.4.2
//
// Start of tile-part (SOT)
//
// Function: Marks the beginning of a tile-part, the index of its tile, and
// the index of its tile-part. The tile-parts of a given tile shall appear in
// order (see TPsot) in the codestream. However, tile-parts from other tiles
// may be interleaved in the codestream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct StartOfTileSegment {
    offset: u64,

    // Isot: Tile index in raster order starting at the number 0.
    tile_index: u16,

    // Psot: Length, in bytes, from the beginning of the first byte of this SOT
    // marker segment of the tile-part to the end of the data of that tile-part.
    //
    // If the Psot is 0, this tile-part is assumed to contain all data until the
    // EOC marker.
    tile_length: u32,

    // TPsot: Tile-part index, denoting the order from 0.
    tile_part_index: u8,

    // TNsot: Number of tile-parts of a tile in the codestream. A zero value
    // indicates that the number of tile-parts of this tile is not specified in
    // this tile-part.
    no_tile_parts: u8,
}

/// A located tile-part. Offsets are absolute stream positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePart {
    pub(crate) offset: u64,
    pub(crate) length: u64,
    pub(crate) header_length: u64,
    pub(crate) first_packet_offset: u64,
    pub(crate) index: u8,
    pub(crate) number: usize,
}

impl TilePart {
    /// Offset of the SOT marker.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Length from the SOT marker to the end of the tile-part data.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Length from the SOT marker to the end of the SOD marker.
    pub fn header_length(&self) -> u64 {
        self.header_length
    }

    /// Offset of the first byte after the SOD marker.
    pub fn first_packet_offset(&self) -> u64 {
        self.first_packet_offset
    }

    pub fn body_length(&self) -> u64 {
        self.length.saturating_sub(self.header_length)
    }

    /// Index of the tile-part within its tile.
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Index of the tile-part within the codestream.
    pub fn number(&self) -> usize {
        self.number
    }
}

/// The tile-parts of one tile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileLayout {
    tile_parts: Vec<TilePart>,
    // Number of tile-parts expected, 0 until a tile-part declares it
    expected: usize,
    // The expected number is a guess after TNsot of 0
    provisional: bool,
    total_length: u64,
    total_header_length: u64,
}

impl TileLayout {
    pub fn tile_parts(&self) -> &[TilePart] {
        &self.tile_parts
    }

    /// Number of tile-parts declared by TNsot, or the number assumed so far
    /// when no tile-part declared it.
    pub fn expected_tile_parts(&self) -> usize {
        self.expected
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn total_header_length(&self) -> u64 {
        self.total_header_length
    }

    pub fn body_length(&self) -> u64 {
        self.total_length.saturating_sub(self.total_header_length)
    }

    // Reconciles the tile-part count with TNsot of the tile-part about to be
    // read, adjusting the number of tile-parts still to be found in the
    // codestream.
    fn reconcile(
        &mut self,
        segment: &StartOfTileSegment,
        remaining: &mut usize,
    ) -> Result<(), CodestreamError> {
        let read = self.tile_parts.len();
        let declared = segment.no_tile_parts as usize;

        if declared == 0 {
            // Assume one more tile-part than read so far, also when an
            // earlier tile-part declared a count this one already reaches
            if read + 1 >= self.expected {
                self.expected = read + 2;
                self.provisional = true;
                *remaining += 1;
            }
            if self.provisional {
                warn!(
                    "Header of tile-part {} of tile {}, does not indicate the total number of tile-parts. Assuming that there are {} tile-parts for this tile.",
                    segment.tile_part_index, segment.tile_index, self.expected
                );
            }
            return Ok(());
        }

        if (self.expected > 0 && !self.provisional && declared != self.expected)
            || declared < read + 1
        {
            return Err(CodestreamError::InvalidTilePartCount {
                tile: segment.tile_index,
                declared: segment.no_tile_parts,
                read,
            });
        }
        if self.expected == 0 {
            *remaining += declared - 1;
        } else if self.provisional {
            *remaining = (*remaining + declared).saturating_sub(self.expected);
        }
        self.expected = declared;
        self.provisional = false;
        Ok(())
    }
}

/// Everything learnt from scanning the codestream for tile-parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodestreamLayout {
    main_header_offset: u64,
    main_header_length: u64,
    stream_end: u64,
    scan_end: u64,
    tiles: Vec<TileLayout>,
    num_tile_parts: usize,
    end_of_codestream: bool,
    truncated: bool,
    rate_reached: bool,
}

impl CodestreamLayout {
    pub fn main_header_offset(&self) -> u64 {
        self.main_header_offset
    }

    pub fn main_header_length(&self) -> u64 {
        self.main_header_length
    }

    pub fn tiles(&self) -> &[TileLayout] {
        &self.tiles
    }

    pub fn tile(&self, tile: usize) -> Option<&TileLayout> {
        self.tiles.get(tile)
    }

    /// Tile-parts in codestream order.
    pub fn tile_parts(&self) -> Vec<(usize, TilePart)> {
        let mut tile_parts: Vec<(usize, TilePart)> = self
            .tiles
            .iter()
            .enumerate()
            .flat_map(|(tile, layout)| layout.tile_parts.iter().map(move |tile_part| (tile, *tile_part)))
            .collect();
        tile_parts.sort_by_key(|(_, tile_part)| tile_part.number);
        tile_parts
    }

    pub fn num_tile_parts(&self) -> usize {
        self.num_tile_parts
    }

    /// Whether the EOC marker was found after the last tile-part.
    pub fn end_of_codestream(&self) -> bool {
        self.end_of_codestream
    }

    /// Whether the codestream ended inside a tile-part.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Whether the scan stopped because the byte budget was reached.
    pub fn rate_reached(&self) -> bool {
        self.rate_reached
    }

    /// Bytes from the SOC marker to the end of the stream.
    pub fn available_bytes(&self) -> u64 {
        self.stream_end.saturating_sub(self.main_header_offset)
    }

    /// Bytes from the SOC marker to where the scan stopped.
    pub fn scan_end(&self) -> u64 {
        self.scan_end
    }
}

/// Scans the codestream for tile-parts and splits the byte budget of
/// `config` between the tiles. The reader must be positioned right after the
/// main header.
pub fn scan_codestream<R, H>(
    reader: &mut R,
    header: &mut H,
    config: &DecoderConfig,
) -> Result<(CodestreamLayout, RateAllocator), CodestreamError>
where
    R: io::Read + io::Seek,
    H: HeaderDecoder,
{
    config.validate()?;
    let width = header.max_component_width();
    let height = header.max_component_height();
    let budget = config.rate().resolve(width, height);
    let mut allocator = RateAllocator::new(
        config.mode(),
        budget,
        header.num_tiles(),
        config.max_code_blocks().is_none(),
    );

    let layout = scan_tile_parts(reader, header, &mut allocator)?;
    allocator.finish(&layout, f64::from(width) * f64::from(height))?;
    Ok((layout, allocator))
}

enum ScanStop {
    AllFound,
    EndOfCodestream,
    EndOfStream,
    RateReached,
    ZeroLength,
    Truncated,
}

fn decode_sot<R: io::Read + io::Seek>(
    reader: &mut R,
    num_tiles: usize,
) -> Result<Option<StartOfTileSegment>, CodestreamError> {
    let offset = reader.stream_position()?;
    let marker = read_marker(reader)?;
    if marker == MARKER_SYMBOL_EOC {
        return Ok(None);
    }
    if marker != MARKER_SYMBOL_SOT {
        return Err(CodestreamError::MarkerUnexpected { marker, offset });
    }

    let length = read_u16(reader)?;
    if length != SOT_SEGMENT_LENGTH {
        return Err(CodestreamError::MarkerError {
            marker: MARKER_SYMBOL_SOT,
            error: format!("wrong length {}", length),
        });
    }
    let segment = StartOfTileSegment {
        offset,
        tile_index: read_u16(reader)?,
        tile_length: read_u32(reader)?,
        tile_part_index: read_u8(reader)?,
        no_tile_parts: read_u8(reader)?,
    };
    info!(
        "SOT at byte offset {}: tile {}, tile-part {}, length {}, tile-parts {}",
        offset,
        segment.tile_index,
        segment.tile_part_index,
        segment.tile_length,
        segment.no_tile_parts
    );

    if segment.tile_index > MAX_TILE_INDEX || segment.tile_index as usize >= num_tiles {
        return Err(CodestreamError::TileIndexOutOfRange {
            tile: segment.tile_index,
            num_tiles,
            offset,
        });
    }
    if segment.tile_length >= MAX_TILE_PART_LENGTH {
        return Err(CodestreamError::TilePartLengthOverflow {
            tile: segment.tile_index,
            length: segment.tile_length,
        });
    }
    Ok(Some(segment))
}

// Feeds the tile-part header to the header decoder up to and including SOD.
fn decode_tile_part_header<R, H>(
    reader: &mut R,
    header: &mut H,
    segment: &StartOfTileSegment,
    expected: usize,
) -> Result<(), CodestreamError>
where
    R: io::Read + io::Seek,
    H: HeaderDecoder,
{
    let tile = segment.tile_index as usize;
    header.start_tile_part_header(tile, segment.tile_part_index, expected);
    loop {
        let marker = read_marker(reader)?;
        header.extract_tile_part_marker(marker, reader, tile, segment.tile_part_index)?;
        if header.start_of_data_found() {
            break;
        }
    }
    header.finish_tile_part_header(tile, segment.tile_part_index)
}

/// Walks the SOT markers of the codestream, validating each tile-part and
/// offering it to the allocator, until every tile-part has been found, EOC is
/// met, the budget is reached or the stream ends.
pub(crate) fn scan_tile_parts<R, H>(
    reader: &mut R,
    header: &mut H,
    allocator: &mut RateAllocator,
) -> Result<CodestreamLayout, CodestreamError>
where
    R: io::Read + io::Seek,
    H: HeaderDecoder,
{
    let codestream_start = header.main_header_offset();
    let first_tile_part = reader.stream_position()?;
    let stream_end = reader.seek(io::SeekFrom::End(0))?;
    reader.seek(io::SeekFrom::Start(first_tile_part))?;

    let main_header_length = first_tile_part.saturating_sub(codestream_start);
    allocator.start(main_header_length)?;

    let num_tiles = header.num_tiles();
    let mut tiles = vec![TileLayout::default(); num_tiles];
    let mut remaining = num_tiles;
    let mut num_tile_parts = 0;
    let mut last_tile = 0;

    let stop = loop {
        if remaining == 0 {
            break ScanStop::AllFound;
        }
        let start = reader.stream_position()?;

        let segment = match decode_sot(reader, num_tiles) {
            Ok(Some(segment)) => segment,
            Ok(None) => break ScanStop::EndOfCodestream,
            Err(error) if error.is_end_of_file() && start >= stream_end => {
                break ScanStop::EndOfStream
            }
            Err(error) if error.is_end_of_file() => break ScanStop::Truncated,
            Err(error) => return Err(error),
        };
        let tile = segment.tile_index as usize;
        last_tile = tile;
        let layout = &mut tiles[tile];

        let read = layout.tile_parts.len();
        if segment.tile_part_index > MAX_TILE_PART_INDEX || segment.tile_part_index as usize != read {
            return Err(CodestreamError::TilePartOutOfOrder {
                tile: segment.tile_index,
                tile_part: segment.tile_part_index,
                expected: read,
            });
        }
        layout.reconcile(&segment, &mut remaining)?;

        match decode_tile_part_header(reader, header, &segment, layout.expected) {
            Ok(()) => {}
            Err(error) if error.is_end_of_file() => break ScanStop::Truncated,
            Err(error) => return Err(error),
        }
        let first_packet_offset = reader.stream_position()?;
        let header_length = first_packet_offset - start;
        if segment.tile_length != 0 && u64::from(segment.tile_length) < header_length {
            return Err(CodestreamError::MarkerError {
                marker: MARKER_SYMBOL_SOT,
                error: format!(
                    "tile-part length {} shorter than its header {}",
                    segment.tile_length, header_length
                ),
            });
        }

        let mut length = if segment.tile_length == 0 {
            stream_end.saturating_sub(2).saturating_sub(start).max(header_length)
        } else {
            u64::from(segment.tile_length)
        };
        let truncated = start + length > stream_end;
        if truncated {
            length = stream_end - start;
        }

        let admission = allocator.admit_tile_part(
            tile,
            first_packet_offset - codestream_start,
            header_length,
            length,
            num_tile_parts == 0,
        )?;
        if admission == Admission::Rejected {
            break ScanStop::RateReached;
        }

        info!(
            "Tile-part {} of tile {}: offset {}, length {}, header length {}",
            segment.tile_part_index, tile, start, length, header_length
        );
        layout.tile_parts.push(TilePart {
            offset: start,
            length,
            header_length,
            first_packet_offset,
            index: segment.tile_part_index,
            number: num_tile_parts,
        });
        layout.total_length += length;
        layout.total_header_length += header_length;
        num_tile_parts += 1;
        remaining -= 1;

        if truncated {
            break ScanStop::Truncated;
        }
        if admission == Admission::LastAccepted {
            break ScanStop::RateReached;
        }
        reader.seek(io::SeekFrom::Start(start + length))?;
        if segment.tile_length == 0 {
            if remaining != 0 {
                warn!("Some tile-parts have not been found. The codestream may be corrupted.");
            }
            break ScanStop::ZeroLength;
        }
    };

    let mut end_of_codestream = false;
    let mut truncated = false;
    let mut rate_reached = false;
    match stop {
        ScanStop::EndOfCodestream => end_of_codestream = true,
        ScanStop::EndOfStream => warn!("EOC marker is missing"),
        ScanStop::RateReached => rate_reached = true,
        ScanStop::Truncated => {
            warn!("Codestream truncated in tile {}", last_tile);
            truncated = true;
        }
        ScanStop::ZeroLength => {
            end_of_codestream = ends_with_eoc(reader, stream_end)?;
        }
        ScanStop::AllFound => {
            let offset = reader.stream_position()?;
            match read_marker(reader) {
                Ok(MARKER_SYMBOL_EOC) => end_of_codestream = true,
                Ok(_) => warn!(
                    "EOC marker not found at byte offset {}. Codestream is corrupted.",
                    offset
                ),
                Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
                    warn!("EOC marker is missing")
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    let scan_end = reader.stream_position()?.saturating_sub(codestream_start);
    Ok(CodestreamLayout {
        main_header_offset: codestream_start,
        main_header_length,
        stream_end,
        scan_end,
        tiles,
        num_tile_parts,
        end_of_codestream,
        truncated,
        rate_reached,
    })
}

fn ends_with_eoc<R: io::Read + io::Seek>(reader: &mut R, stream_end: u64) -> Result<bool, CodestreamError> {
    if stream_end < 2 {
        return Ok(false);
    }
    let position = reader.stream_position()?;
    reader.seek(io::SeekFrom::Start(stream_end - 2))?;
    let marker = read_marker(reader)?;
    reader.seek(io::SeekFrom::Start(position))?;
    Ok(marker == MARKER_SYMBOL_EOC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(tile_part_index: u8, no_tile_parts: u8) -> StartOfTileSegment {
        StartOfTileSegment {
            offset: 0,
            tile_index: 0,
            tile_length: 100,
            tile_part_index,
            no_tile_parts,
        }
    }

    fn read(layout: &mut TileLayout, count: usize) {
        for index in 0..count {
            let number = layout.tile_parts.len();
            layout.tile_parts.push(TilePart {
                offset: 0,
                length: 100,
                header_length: 14,
                first_packet_offset: 14,
                index: index as u8,
                number,
            });
        }
    }

    #[test]
    fn test_declared_tile_parts() {
        let mut layout = TileLayout::default();
        let mut remaining = 1;
        layout.reconcile(&segment(0, 3), &mut remaining).unwrap();
        assert_eq!(remaining, 3);
        assert_eq!(layout.expected_tile_parts(), 3);

        read(&mut layout, 1);
        remaining -= 1;
        layout.reconcile(&segment(1, 3), &mut remaining).unwrap();
        assert_eq!(remaining, 2);
    }

    #[test]
    fn test_conflicting_declaration() {
        let mut layout = TileLayout::default();
        let mut remaining = 1;
        layout.reconcile(&segment(0, 3), &mut remaining).unwrap();
        read(&mut layout, 1);
        assert!(layout.reconcile(&segment(1, 2), &mut remaining).is_err());
    }

    #[test]
    fn test_undeclared_tile_parts_grow() {
        let mut layout = TileLayout::default();
        let mut remaining = 1;

        layout.reconcile(&segment(0, 0), &mut remaining).unwrap();
        assert_eq!(layout.expected_tile_parts(), 2);
        assert_eq!(remaining, 2);
        read(&mut layout, 1);
        remaining -= 1;

        layout.reconcile(&segment(1, 0), &mut remaining).unwrap();
        assert_eq!(layout.expected_tile_parts(), 3);
        assert_eq!(remaining, 2);
        read(&mut layout, 1);
        remaining -= 1;

        // A later tile-part finally declares the count
        layout.reconcile(&segment(2, 3), &mut remaining).unwrap();
        assert_eq!(layout.expected_tile_parts(), 3);
        assert_eq!(remaining, 1);
    }

    #[test]
    fn test_undeclared_after_declared_count_reached() {
        let mut layout = TileLayout::default();
        let mut remaining = 2;
        layout.reconcile(&segment(0, 1), &mut remaining).unwrap();
        assert_eq!(remaining, 2);
        read(&mut layout, 1);
        remaining -= 1;

        layout.reconcile(&segment(1, 0), &mut remaining).unwrap();
        assert_eq!(layout.expected_tile_parts(), 3);
        assert_eq!(remaining, 2);
    }

    #[test]
    fn test_undeclared_within_declared_count() {
        let mut layout = TileLayout::default();
        let mut remaining = 1;
        layout.reconcile(&segment(0, 3), &mut remaining).unwrap();
        read(&mut layout, 1);
        remaining -= 1;

        layout.reconcile(&segment(1, 0), &mut remaining).unwrap();
        assert_eq!(layout.expected_tile_parts(), 3);
        assert_eq!(remaining, 2);
    }

    #[test]
    fn test_late_declaration_too_small() {
        let mut layout = TileLayout::default();
        let mut remaining = 1;
        layout.reconcile(&segment(0, 0), &mut remaining).unwrap();
        read(&mut layout, 1);
        layout.reconcile(&segment(1, 0), &mut remaining).unwrap();
        read(&mut layout, 1);

        assert!(layout.reconcile(&segment(2, 2), &mut remaining).is_err());
    }
}
