use clap::Parser;
use std::error;
use std::error::Error;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Seek};
use std::path::Path;

use jpc_bitstream::{
    decode_main_header, scan_codestream, CodestreamError, DecoderConfig, HeaderDecoder, RateMode, TargetRate,
};

#[derive(Debug)]
enum JP2000Error {
    DecodingCodestream { error: String },
    InvalidOffset { offset: u64, length: u64 },
}

impl error::Error for JP2000Error {}
impl fmt::Display for JP2000Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::DecodingCodestream { error } => {
                write!(f, "error decoding jpc codestream {}", error)
            }
            Self::InvalidOffset { offset, length } => {
                write!(f, "offset {} past the end of a {} byte file", offset, length)
            }
        }
    }
}

#[derive(Parser)]
struct Opts {
    #[clap(subcommand)]
    subcommand: SubCommand,
}

#[derive(Parser)]
enum SubCommand {
    /// Print the tile-parts of a codestream and the bytes allowed per tile
    TileParts(TileParts),
}

#[derive(Parser)]
struct TileParts {
    /// Path to .jpc or .j2c file, or to a file embedding a codestream
    path: String,

    /// Byte offset of the SOC marker in the file
    #[clap(short, long, default_value = "0")]
    offset: u64,

    /// Target rate in bits per pixel
    #[clap(short, long, conflicts_with = "nbytes")]
    rate: Option<f32>,

    /// Target rate in bytes
    #[clap(short, long)]
    nbytes: Option<u64>,

    /// Share the budget between tiles in proportion to their lengths instead
    /// of granting it in codestream order
    #[clap(short, long)]
    parsing: bool,
}

fn decoding_error(error: CodestreamError) -> JP2000Error {
    JP2000Error::DecodingCodestream {
        error: error.to_string(),
    }
}

fn tile_parts(c: TileParts) -> Result<(), Box<dyn Error>> {
    let path = Path::new(&c.path);
    let file = File::open(path)?;
    let length = file.metadata()?.len();
    if c.offset >= length {
        return Err(JP2000Error::InvalidOffset {
            offset: c.offset,
            length,
        }
        .into());
    }

    let mut reader = BufReader::new(file);
    reader.seek(io::SeekFrom::Start(c.offset))?;

    let rate = match (c.rate, c.nbytes) {
        (Some(rate), _) => TargetRate::BitsPerPixel(rate),
        (None, Some(bytes)) => TargetRate::Bytes(bytes),
        (None, None) => TargetRate::Unlimited,
    };
    let mode = if c.parsing {
        RateMode::Parsing
    } else {
        RateMode::Truncation
    };
    let config = DecoderConfig::new().with_rate(rate).with_mode(mode);

    let mut header = decode_main_header(&mut reader).map_err(decoding_error)?;
    let (layout, allocator) =
        scan_codestream(&mut reader, &mut header, &config).map_err(decoding_error)?;

    println!(
        "Main header : {}, {}",
        layout.main_header_offset(),
        layout.main_header_length()
    );
    for (tile, tile_part) in layout.tile_parts() {
        println!(
            "Tile-part {} of tile {} : {}, {}, {}",
            tile_part.index(),
            tile,
            tile_part.offset(),
            tile_part.length(),
            tile_part.header_length()
        );
    }
    for (tile, tile_layout) in layout.tiles().iter().enumerate() {
        println!(
            "Tile {} ({} tile-parts) : length {}, header length {}, allowance {}",
            tile,
            tile_layout.tile_parts().len(),
            tile_layout.total_length(),
            tile_layout.total_header_length(),
            allocator.allowance(tile)
        );
    }

    let budget = allocator.budget();
    if budget.is_unlimited() {
        println!("Budget : unlimited, {} bytes of headers", allocator.header_bytes());
    } else {
        println!(
            "Budget : {} bytes ({:.4} bpp), {} bytes of headers",
            budget.bytes(),
            budget.bits_per_pixel(),
            allocator.header_bytes()
        );
    }
    println!(
        "Tiles : {} ({} x {}), end of codestream {}, truncated {}, rate reached {}",
        header.num_tiles(),
        header.num_tiles_x(),
        header.num_tiles_y(),
        layout.end_of_codestream(),
        layout.truncated(),
        layout.rate_reached()
    );

    Ok(())
}

fn run() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let opts: Opts = Opts::parse();

    match opts.subcommand {
        SubCommand::TileParts(c) => tile_parts(c)?,
    }

    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    match run() {
        Err(e) => {
            return Err(e.to_string().into());
        }
        Ok(_) => Ok(()),
    }
}
