//! Bitstream reading and rate allocation for JPEG 2000 codestreams.
//!
//! A codestream is scanned once to locate every tile-part, a byte budget is
//! split across the tiles, and the packets of the selected tile are then
//! walked in the tile's progression order. Packet parsing itself is left to
//! a [`PacketReader`], and header parsing to a [`HeaderDecoder`].
//! [`CodestreamHeader`] is a small header decoder covering the marker
//! segments the reader needs.
//!
//! ```no_run
//! # use std::fs::File;
//! # use std::io::BufReader;
//! # use jpc_bitstream::*;
//! # fn run<P: PacketReader>(packets: P) -> Result<(), CodestreamError> {
//! let mut reader = BufReader::new(File::open("image.j2c")?);
//! let header = decode_main_header(&mut reader)?;
//! let config = DecoderConfig::new().with_rate(TargetRate::BitsPerPixel(0.5));
//!
//! let mut bitstream = BitstreamReader::new(reader, header, packets, config)?;
//! bitstream.set_tile_index(0)?;
//! let block = bitstream.code_block(CodeBlockKey::new(0, 0, 0, 0, 0), 0, None)?;
//! # Ok(())
//! # }
//! ```

use std::error;
use std::fmt;
use std::io;

mod allocator;
mod codeblock;
mod config;
mod header;
mod locator;
mod packet;
mod progression;
mod query;
mod reader;
mod truncation;

pub use allocator::{Budget, RateAllocator};
pub use codeblock::{
    CodeBlockGeometry, CodeBlockKey, CodeBlockRecord, CodeBlockTable, LayerContribution,
};
pub use config::{DecoderConfig, RateMode, TargetRate};
pub use header::{decode_main_header, CodeBlockStyle, CodestreamHeader, HeaderDecoder, TileRect};
pub use locator::{scan_codestream, CodestreamLayout, TileLayout, TilePart};
pub use packet::{
    PacketContext, PacketCoordinate, PacketReader, PrecinctInfo, PrecinctLayout, TileContext,
};
pub use progression::{Axis, ProgressionChange, ProgressionOrder};
pub use query::LayeredCodeBlock;
pub use reader::{BitstreamReader, TileSummary};

pub type MarkerSymbol = [u8; 2];

// Delimiting markers and marker segments
pub const MARKER_SYMBOL_SOC: MarkerSymbol = [255, 79]; // Start of code stream
pub const MARKER_SYMBOL_SOT: MarkerSymbol = [255, 144]; // Start of tile-part
pub const MARKER_SYMBOL_SOD: MarkerSymbol = [255, 147]; // Start of data
pub const MARKER_SYMBOL_EOC: MarkerSymbol = [255, 217]; // End of codestream

// Fixed information marker segments
pub const MARKER_SYMBOL_SIZ: MarkerSymbol = [255, 81]; // Image and tile size

// Functional marker segments
pub const MARKER_SYMBOL_COD: MarkerSymbol = [255, 82]; // Coding style default
pub const MARKER_SYMBOL_COC: MarkerSymbol = [255, 83]; // Coding style component
pub const MARKER_SYMBOL_POC: MarkerSymbol = [255, 95]; // Progression order change

// In bit stream markers and marker segments
pub const MARKER_SYMBOL_SOP: MarkerSymbol = [255, 145]; // Start of packet
pub const MARKER_SYMBOL_EPH: MarkerSymbol = [255, 146]; // End of packet header

/// Broad classification of a [`CodestreamError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The codestream violates the marker grammar.
    CorruptedStream,
    /// The byte budget cannot hold the headers that must be read.
    BudgetTooSmall,
    /// The caller asked for something that does not exist or is not allowed.
    CallerMisuse,
    /// The underlying reader failed.
    Io,
}

#[derive(Debug)]
pub enum CodestreamError {
    Io(io::Error),
    MarkerError {
        marker: MarkerSymbol,
        error: String,
    },
    MarkerMissing {
        marker: MarkerSymbol,
    },
    MarkerUnexpected {
        marker: MarkerSymbol,
        offset: u64,
    },
    TileIndexOutOfRange {
        tile: u16,
        num_tiles: usize,
        offset: u64,
    },
    TilePartOutOfOrder {
        tile: u16,
        tile_part: u8,
        expected: usize,
    },
    InvalidTilePartCount {
        tile: u16,
        declared: u8,
        read: usize,
    },
    TilePartLengthOverflow {
        tile: u16,
        length: u32,
    },
    BudgetTooSmall {
        budget: u64,
        required: u64,
    },
    InvalidConfiguration {
        error: String,
    },
    NoTileSelected,
    NoNextTile,
    TileOutOfRange {
        x: usize,
        y: usize,
    },
    CodeBlockNotFound {
        tile: usize,
        key: CodeBlockKey,
    },
    InvalidLayerRange {
        first: usize,
        count: usize,
        num_layers: usize,
    },
    ResolutionNotDecoded {
        resolution: usize,
        max_resolution: usize,
    },
}

impl CodestreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Io,
            Self::MarkerError { .. }
            | Self::MarkerMissing { .. }
            | Self::MarkerUnexpected { .. }
            | Self::TileIndexOutOfRange { .. }
            | Self::TilePartOutOfOrder { .. }
            | Self::InvalidTilePartCount { .. }
            | Self::TilePartLengthOverflow { .. } => ErrorKind::CorruptedStream,
            Self::BudgetTooSmall { .. } => ErrorKind::BudgetTooSmall,
            Self::InvalidConfiguration { .. }
            | Self::NoTileSelected
            | Self::NoNextTile
            | Self::TileOutOfRange { .. }
            | Self::CodeBlockNotFound { .. }
            | Self::InvalidLayerRange { .. }
            | Self::ResolutionNotDecoded { .. } => ErrorKind::CallerMisuse,
        }
    }

    pub(crate) fn is_end_of_file(&self) -> bool {
        match self {
            Self::Io(error) => error.kind() == io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}

impl From<io::Error> for CodestreamError {
    fn from(error: io::Error) -> Self {
        Self::Io(error)
    }
}

impl error::Error for CodestreamError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(error) => Some(error),
            _ => None,
        }
    }
}

impl fmt::Display for CodestreamError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(error) => write!(f, "i/o error {}", error),
            Self::MarkerError { marker, error } => {
                write!(
                    f,
                    "marker 0x{:0>2X?}{:0>2X?} error {:?}",
                    marker[0], marker[1], error
                )
            }
            Self::MarkerMissing { marker } => {
                write!(f, "missing marker 0x{:0>2X?}{:0>2X?}", marker[0], marker[1])
            }
            Self::MarkerUnexpected { marker, offset } => {
                write!(
                    f,
                    "unexpected marker 0x{:0>2X?}{:0>2X?} at byte offset {}",
                    marker[0], marker[1], offset
                )
            }
            Self::TileIndexOutOfRange {
                tile,
                num_tiles,
                offset,
            } => {
                write!(
                    f,
                    "tile index {} out of range for {} tiles in SOT at byte offset {}",
                    tile, num_tiles, offset
                )
            }
            Self::TilePartOutOfOrder {
                tile,
                tile_part,
                expected,
            } => {
                write!(
                    f,
                    "tile-part {} of tile {} out of order, expected tile-part {}",
                    tile_part, tile, expected
                )
            }
            Self::InvalidTilePartCount {
                tile,
                declared,
                read,
            } => {
                write!(
                    f,
                    "invalid number of tile-parts {} in tile {} after reading {} tile-parts",
                    declared, tile, read
                )
            }
            Self::TilePartLengthOverflow { tile, length } => {
                write!(
                    f,
                    "tile-part length {} in tile {} not supported, must be below 2^31",
                    length, tile
                )
            }
            Self::BudgetTooSmall { budget, required } => {
                write!(
                    f,
                    "byte budget {} too small to read headers, at least {} bytes required",
                    budget, required
                )
            }
            Self::InvalidConfiguration { error } => {
                write!(f, "invalid configuration {}", error)
            }
            Self::NoTileSelected => write!(f, "no tile selected"),
            Self::NoNextTile => write!(f, "no next tile"),
            Self::TileOutOfRange { x, y } => {
                write!(f, "tile ({}, {}) out of range", x, y)
            }
            Self::CodeBlockNotFound { tile, key } => {
                write!(f, "code-block {} not found in tile {}", key, tile)
            }
            Self::InvalidLayerRange {
                first,
                count,
                num_layers,
            } => {
                write!(
                    f,
                    "invalid layer range: {} layers from layer {} of {} layers",
                    count,
                    first,
                    num_layers
                )
            }
            Self::ResolutionNotDecoded {
                resolution,
                max_resolution,
            } => {
                write!(
                    f,
                    "resolution level {} not decoded, maximum is {}",
                    resolution, max_resolution
                )
            }
        }
    }
}

pub(crate) fn read_marker<R: io::Read>(reader: &mut R) -> io::Result<MarkerSymbol> {
    let mut marker: MarkerSymbol = [0; 2];
    reader.read_exact(&mut marker)?;
    Ok(marker)
}

pub(crate) fn read_u8<R: io::Read>(reader: &mut R) -> io::Result<u8> {
    let mut value: [u8; 1] = [0; 1];
    reader.read_exact(&mut value)?;
    Ok(value[0])
}

pub(crate) fn read_u16<R: io::Read>(reader: &mut R) -> io::Result<u16> {
    let mut value: [u8; 2] = [0; 2];
    reader.read_exact(&mut value)?;
    Ok(u16::from_be_bytes(value))
}

pub(crate) fn read_u32<R: io::Read>(reader: &mut R) -> io::Result<u32> {
    let mut value: [u8; 4] = [0; 4];
    reader.read_exact(&mut value)?;
    Ok(u32::from_be_bytes(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let error = CodestreamError::TilePartOutOfOrder {
            tile: 0,
            tile_part: 2,
            expected: 1,
        };
        assert_eq!(error.kind(), ErrorKind::CorruptedStream);

        let error = CodestreamError::BudgetTooSmall {
            budget: 10,
            required: 120,
        };
        assert_eq!(error.kind(), ErrorKind::BudgetTooSmall);
        assert_eq!(
            error.to_string(),
            "byte budget 10 too small to read headers, at least 120 bytes required"
        );

        assert_eq!(CodestreamError::NoNextTile.kind(), ErrorKind::CallerMisuse);
    }

    #[test]
    fn test_end_of_file_detection() {
        let error: CodestreamError = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert!(error.is_end_of_file());
        assert_eq!(error.kind(), ErrorKind::Io);

        let error: CodestreamError = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(!error.is_end_of_file());
    }

    #[test]
    fn test_marker_display() {
        let error = CodestreamError::MarkerUnexpected {
            marker: MARKER_SYMBOL_SIZ,
            offset: 2,
        };
        assert_eq!(
            error.to_string(),
            "unexpected marker 0xFF51 at byte offset 2"
        );
    }
}
