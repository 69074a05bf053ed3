use log::{debug, info};
use std::cmp;
use std::io;

use super::progression::{ProgressionChange, ProgressionOrder};
use super::{
    read_marker, read_u16, read_u32, read_u8, CodestreamError, MarkerSymbol, MARKER_SYMBOL_COC,
    MARKER_SYMBOL_COD, MARKER_SYMBOL_POC, MARKER_SYMBOL_SIZ, MARKER_SYMBOL_SOC,
    MARKER_SYMBOL_SOD, MARKER_SYMBOL_SOT,
};

/// Area of a tile on the reference grid, `x1` and `y1` exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileRect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

/// Code-block style (Table A.19).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeBlockStyle(u8);

impl CodeBlockStyle {
    pub const SELECTIVE_ARITHMETIC_CODING_BYPASS: u8 = 0b0000_0001;
    pub const RESET_CONTEXT_PROBABILITIES: u8 = 0b0000_0010;
    pub const TERMINATION_ON_EACH_CODING_PASS: u8 = 0b0000_0100;
    pub const VERTICALLY_CAUSAL_CONTEXT: u8 = 0b0000_1000;
    pub const PREDICTABLE_TERMINATION: u8 = 0b0001_0000;
    pub const SEGMENTATION_SYMBOLS: u8 = 0b0010_0000;

    pub fn new(value: u8) -> Self {
        Self(value)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn selective_arithmetic_coding_bypass(self) -> bool {
        self.0 & Self::SELECTIVE_ARITHMETIC_CODING_BYPASS != 0
    }

    pub fn termination_on_each_coding_pass(self) -> bool {
        self.0 & Self::TERMINATION_ON_EACH_CODING_PASS != 0
    }
}

/// Source of the codestream parameters the bitstream reader depends on.
///
/// Tile-part headers are fed to the decoder marker by marker while the
/// codestream is scanned, so that tile specific COD, COC and POC segments can
/// override the main header.
pub trait HeaderDecoder {
    /// Byte offset of the SOC marker.
    fn main_header_offset(&self) -> u64;

    fn num_tiles(&self) -> usize;

    fn num_tiles_x(&self) -> usize;

    fn num_tiles_y(&self) -> usize {
        match self.num_tiles_x() {
            0 => 0,
            num_tiles_x => self.num_tiles() / num_tiles_x,
        }
    }

    fn num_components(&self) -> usize;

    /// Width, in samples, of the largest component.
    fn max_component_width(&self) -> u32;

    /// Height, in samples, of the largest component.
    fn max_component_height(&self) -> u32;

    fn tile_rect(&self, tile: usize) -> TileRect;

    fn num_layers(&self, tile: usize) -> usize;

    fn decomposition_levels(&self, tile: usize, component: usize) -> usize;

    /// Smallest number of decomposition levels of any tile-component.
    fn min_decomposition_levels(&self) -> usize;

    fn progression_order(&self, tile: usize) -> ProgressionOrder;

    /// Progression order changes signalled for `tile`, if any.
    fn progression_changes(&self, tile: usize) -> Option<Vec<ProgressionChange>>;

    fn code_block_style(&self, tile: usize, component: usize) -> CodeBlockStyle;

    fn start_tile_part_header(&mut self, tile: usize, tile_part: u8, num_tile_parts: usize);

    /// Decodes the marker segment introduced by `marker`, leaving the reader
    /// after it. SOD carries no segment.
    fn extract_tile_part_marker<R: io::Read + io::Seek>(
        &mut self,
        marker: MarkerSymbol,
        reader: &mut R,
        tile: usize,
        tile_part: u8,
    ) -> Result<(), CodestreamError>;

    fn start_of_data_found(&self) -> bool;

    fn finish_tile_part_header(&mut self, _tile: usize, _tile_part: u8) -> Result<(), CodestreamError> {
        Ok(())
    }
}

// A.5.1
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ImageAndTileSize {
    reference_grid_width: u32,
    reference_grid_height: u32,
    image_horizontal_offset: u32,
    image_vertical_offset: u32,
    reference_tile_width: u32,
    reference_tile_height: u32,
    tile_horizontal_offset: u32,
    tile_vertical_offset: u32,
    horizontal_separation: Vec<u8>,
    vertical_separation: Vec<u8>,
}

impl ImageAndTileSize {
    fn no_components(&self) -> usize {
        self.horizontal_separation.len()
    }

    fn num_tiles_x(&self) -> usize {
        ceil_div(
            self.reference_grid_width - self.tile_horizontal_offset,
            self.reference_tile_width,
        ) as usize
    }

    fn num_tiles_y(&self) -> usize {
        ceil_div(
            self.reference_grid_height - self.tile_vertical_offset,
            self.reference_tile_height,
        ) as usize
    }

    // B-7
    fn component_extent(&self, component: usize) -> (u32, u32) {
        let dx = u32::from(self.horizontal_separation[component]);
        let dy = u32::from(self.vertical_separation[component]);
        (
            ceil_div(self.reference_grid_width, dx) - ceil_div(self.image_horizontal_offset, dx),
            ceil_div(self.reference_grid_height, dy) - ceil_div(self.image_vertical_offset, dy),
        )
    }
}

// A.6.1 and A.6.2, the parts of SGcod and SPcod that steer the bitstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CodingStyle {
    progression_order: ProgressionOrder,
    no_layers: u16,
    no_decomposition_levels: u8,
    code_block_style: CodeBlockStyle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ComponentCodingStyle {
    no_decomposition_levels: u8,
    code_block_style: CodeBlockStyle,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct TileCodingStyle {
    coding_style: Option<CodingStyle>,
    components: Vec<Option<ComponentCodingStyle>>,
    progression_changes: Option<Vec<ProgressionChange>>,
}

/// Main and tile-part header parameters relevant to reading packets.
///
/// Marker segments other than SIZ, COD, COC and POC are skipped over using
/// their length field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodestreamHeader {
    offset: u64,
    length: u64,
    size: ImageAndTileSize,
    coding_style: CodingStyle,
    components: Vec<Option<ComponentCodingStyle>>,
    progression_changes: Option<Vec<ProgressionChange>>,
    tiles: Vec<TileCodingStyle>,
    start_of_data: bool,
}

/// Decodes the main header starting at the SOC marker, leaving the reader at
/// the first SOT marker.
pub fn decode_main_header<R: io::Read + io::Seek>(
    reader: &mut R,
) -> Result<CodestreamHeader, CodestreamError> {
    let offset = reader.stream_position()?;

    // SOC (Required as the first marker)
    let marker = read_marker(reader)?;
    if marker != MARKER_SYMBOL_SOC {
        return Err(CodestreamError::MarkerUnexpected {
            marker,
            offset: reader.stream_position()? - 2,
        });
    }
    info!("SOC start at byte offset {}", offset);

    // SIZ (Required as the second marker segment)
    let marker = read_marker(reader)?;
    if marker != MARKER_SYMBOL_SIZ {
        return Err(CodestreamError::MarkerUnexpected {
            marker,
            offset: reader.stream_position()? - 2,
        });
    }
    let size = decode_siz(reader)?;
    let no_components = size.no_components();

    let mut coding_style = None;
    let mut components = vec![None; no_components];
    let mut progression_changes: Option<Vec<ProgressionChange>> = None;

    loop {
        let marker = read_marker(reader)?;
        match marker {
            MARKER_SYMBOL_COD => {
                coding_style = Some(decode_cod(reader)?);
            }
            MARKER_SYMBOL_COC => {
                let (component, style) = decode_coc(reader, no_components)?;
                components[component] = Some(style);
            }
            MARKER_SYMBOL_POC => {
                let changes = decode_poc(reader, no_components)?;
                progression_changes.get_or_insert_with(Vec::new).extend(changes);
            }
            MARKER_SYMBOL_SOT => {
                reader.seek(io::SeekFrom::Current(-2))?;
                break;
            }
            _ => skip_segment(reader, marker)?,
        }
    }

    let coding_style = match coding_style {
        Some(coding_style) => coding_style,
        None => {
            return Err(CodestreamError::MarkerMissing {
                marker: MARKER_SYMBOL_COD,
            })
        }
    };

    let num_tiles = size.num_tiles_x() * size.num_tiles_y();
    let length = reader.stream_position()? - offset;
    info!("Main header end at byte offset {}", offset + length);

    Ok(CodestreamHeader {
        offset,
        length,
        size,
        coding_style,
        components,
        progression_changes,
        tiles: vec![TileCodingStyle::default(); num_tiles],
        start_of_data: false,
    })
}

fn decode_siz<R: io::Read + io::Seek>(reader: &mut R) -> Result<ImageAndTileSize, CodestreamError> {
    info!("SIZ start at byte offset {}", reader.stream_position()? - 2);
    let start = reader.stream_position()?;
    let length = read_u16(reader)?;

    let _decoder_capabilities = read_u16(reader)?;
    let mut size = ImageAndTileSize {
        reference_grid_width: read_u32(reader)?,
        reference_grid_height: read_u32(reader)?,
        image_horizontal_offset: read_u32(reader)?,
        image_vertical_offset: read_u32(reader)?,
        reference_tile_width: read_u32(reader)?,
        reference_tile_height: read_u32(reader)?,
        tile_horizontal_offset: read_u32(reader)?,
        tile_vertical_offset: read_u32(reader)?,
        ..Default::default()
    };
    let no_components = read_u16(reader)?;
    for _ in 0..no_components {
        let _precision = read_u8(reader)?;
        size.horizontal_separation.push(read_u8(reader)?);
        size.vertical_separation.push(read_u8(reader)?);
    }

    let error = if no_components == 0 {
        Some("no components".to_owned())
    } else if size.reference_tile_width == 0 || size.reference_tile_height == 0 {
        Some("zero tile size".to_owned())
    } else if size.horizontal_separation.contains(&0) || size.vertical_separation.contains(&0) {
        Some("zero component separation".to_owned())
    // 0 ≤ XTOsiz ≤ XOsiz, 0 ≤ YTOsiz ≤ YOsiz
    } else if size.tile_horizontal_offset > size.image_horizontal_offset
        || size.tile_vertical_offset > size.image_vertical_offset
    {
        Some("tile grid offset overflow".to_owned())
    // XTsiz + XTOsiz > XOsiz, YTsiz + YTOsiz > YOsiz
    } else if u64::from(size.reference_tile_width) + u64::from(size.tile_horizontal_offset)
        <= u64::from(size.image_horizontal_offset)
        || u64::from(size.reference_tile_height) + u64::from(size.tile_vertical_offset)
            <= u64::from(size.image_vertical_offset)
    {
        Some("tile size overflow".to_owned())
    } else if size.image_horizontal_offset >= size.reference_grid_width
        || size.image_vertical_offset >= size.reference_grid_height
    {
        Some("empty image area".to_owned())
    } else {
        None
    };
    if let Some(error) = error {
        return Err(CodestreamError::MarkerError {
            marker: MARKER_SYMBOL_SIZ,
            error,
        });
    }

    reader.seek(io::SeekFrom::Start(start + u64::from(length)))?;
    Ok(size)
}

// Table A.12 and A.13
fn decode_cod<R: io::Read + io::Seek>(reader: &mut R) -> Result<CodingStyle, CodestreamError> {
    info!("COD start at byte offset {}", reader.stream_position()? - 2);
    let start = reader.stream_position()?;
    let length = read_u16(reader)?;

    let _coding_style = read_u8(reader)?;
    let progression_order = decode_progression_order(MARKER_SYMBOL_COD, read_u8(reader)?)?;
    let no_layers = read_u16(reader)?;
    let _multiple_component_transformation = read_u8(reader)?;
    let no_decomposition_levels = read_u8(reader)?;
    let _code_block_width = read_u8(reader)?;
    let _code_block_height = read_u8(reader)?;
    let code_block_style = CodeBlockStyle::new(read_u8(reader)?);

    if no_layers == 0 {
        return Err(CodestreamError::MarkerError {
            marker: MARKER_SYMBOL_COD,
            error: "zero layers".to_owned(),
        });
    }

    // Transformation and precinct sizes are not needed
    reader.seek(io::SeekFrom::Start(start + u64::from(length)))?;
    Ok(CodingStyle {
        progression_order,
        no_layers,
        no_decomposition_levels,
        code_block_style,
    })
}

// Table A.21
fn decode_coc<R: io::Read + io::Seek>(
    reader: &mut R,
    no_components: usize,
) -> Result<(usize, ComponentCodingStyle), CodestreamError> {
    info!("COC start at byte offset {}", reader.stream_position()? - 2);
    let start = reader.stream_position()?;
    let length = read_u16(reader)?;

    let component = read_component_index(reader, no_components)?;
    if component >= no_components {
        return Err(CodestreamError::MarkerError {
            marker: MARKER_SYMBOL_COC,
            error: format!("component {} out of range", component),
        });
    }
    let _coding_style = read_u8(reader)?;
    let no_decomposition_levels = read_u8(reader)?;
    let _code_block_width = read_u8(reader)?;
    let _code_block_height = read_u8(reader)?;
    let code_block_style = CodeBlockStyle::new(read_u8(reader)?);

    reader.seek(io::SeekFrom::Start(start + u64::from(length)))?;
    Ok((
        component,
        ComponentCodingStyle {
            no_decomposition_levels,
            code_block_style,
        },
    ))
}

// Table A.32
fn decode_poc<R: io::Read + io::Seek>(
    reader: &mut R,
    no_components: usize,
) -> Result<Vec<ProgressionChange>, CodestreamError> {
    info!("POC start at byte offset {}", reader.stream_position()? - 2);
    let start = reader.stream_position()?;
    let length = read_u16(reader)?;

    let entry_length: u16 = if no_components < 257 { 7 } else { 9 };
    let no_changes = length.saturating_sub(2) / entry_length;
    if no_changes == 0 {
        return Err(CodestreamError::MarkerError {
            marker: MARKER_SYMBOL_POC,
            error: format!("invalid length {}", length),
        });
    }

    let mut changes = Vec::with_capacity(no_changes as usize);
    for _ in 0..no_changes {
        let resolution_start = read_u8(reader)?;
        let component_start = read_component_index(reader, no_components)?;
        let layer_end = read_u16(reader)?;
        let resolution_end = read_u8(reader)?;
        let mut component_end = read_component_index(reader, no_components)?;
        // CEpoc of 0 is interpreted as 256
        if component_end == 0 && no_components < 257 {
            component_end = 256;
        }
        let order = decode_progression_order(MARKER_SYMBOL_POC, read_u8(reader)?)?;

        changes.push(ProgressionChange {
            order,
            layer_end: layer_end as usize,
            resolution_start: resolution_start as usize,
            resolution_end: resolution_end as usize,
            component_start,
            component_end,
        });
    }

    reader.seek(io::SeekFrom::Start(start + u64::from(length)))?;
    Ok(changes)
}

fn decode_progression_order(
    marker: MarkerSymbol,
    value: u8,
) -> Result<ProgressionOrder, CodestreamError> {
    match ProgressionOrder::from_u8(value) {
        Some(order) => Ok(order),
        None => Err(CodestreamError::MarkerError {
            marker,
            error: format!("unknown progression order {}", value),
        }),
    }
}

fn read_component_index<R: io::Read>(reader: &mut R, no_components: usize) -> io::Result<usize> {
    if no_components < 257 {
        Ok(read_u8(reader)? as usize)
    } else {
        Ok(read_u16(reader)? as usize)
    }
}

fn skip_segment<R: io::Read + io::Seek>(
    reader: &mut R,
    marker: MarkerSymbol,
) -> Result<(), CodestreamError> {
    let offset = reader.stream_position()?.saturating_sub(2);
    if marker[0] != 0xFF || marker[1] < 0x30 {
        return Err(CodestreamError::MarkerUnexpected { marker, offset });
    }
    // Markers 0xFF30 to 0xFF3F carry no segment
    if marker[1] <= 0x3F {
        return Ok(());
    }
    let length = read_u16(reader)?;
    if length < 2 {
        return Err(CodestreamError::MarkerError {
            marker,
            error: format!("invalid length {}", length),
        });
    }
    debug!(
        "Skipping marker 0x{:0>2X?}{:0>2X?} at byte offset {}, length {}",
        marker[0], marker[1], offset, length
    );
    reader.seek(io::SeekFrom::Current(i64::from(length) - 2))?;
    Ok(())
}

fn ceil_div(value: u32, divisor: u32) -> u32 {
    ((u64::from(value) + u64::from(divisor) - 1) / u64::from(divisor)) as u32
}

impl CodestreamHeader {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Length of the main header, from SOC to the first SOT.
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn reference_grid_width(&self) -> u32 {
        self.size.reference_grid_width
    }

    pub fn reference_grid_height(&self) -> u32 {
        self.size.reference_grid_height
    }

    fn tile_coding_style(&self, tile: usize) -> Option<&TileCodingStyle> {
        self.tiles.get(tile)
    }

    fn component_coding_style(&self, tile: usize, component: usize) -> ComponentCodingStyle {
        // Tile COC, tile COD, main COC, main COD
        let tile_style = self.tile_coding_style(tile);
        if let Some(style) = tile_style
            .and_then(|style| style.components.get(component))
            .copied()
            .flatten()
        {
            return style;
        }
        if let Some(style) = tile_style.and_then(|style| style.coding_style) {
            return ComponentCodingStyle {
                no_decomposition_levels: style.no_decomposition_levels,
                code_block_style: style.code_block_style,
            };
        }
        if let Some(style) = self.components.get(component).copied().flatten() {
            return style;
        }
        ComponentCodingStyle {
            no_decomposition_levels: self.coding_style.no_decomposition_levels,
            code_block_style: self.coding_style.code_block_style,
        }
    }

    fn coding_style(&self, tile: usize) -> CodingStyle {
        self.tile_coding_style(tile)
            .and_then(|style| style.coding_style)
            .unwrap_or(self.coding_style)
    }
}

impl HeaderDecoder for CodestreamHeader {
    fn main_header_offset(&self) -> u64 {
        self.offset
    }

    fn num_tiles(&self) -> usize {
        self.tiles.len()
    }

    fn num_tiles_x(&self) -> usize {
        self.size.num_tiles_x()
    }

    fn num_components(&self) -> usize {
        self.size.no_components()
    }

    fn max_component_width(&self) -> u32 {
        (0..self.size.no_components())
            .map(|component| self.size.component_extent(component).0)
            .max()
            .unwrap_or(0)
    }

    fn max_component_height(&self) -> u32 {
        (0..self.size.no_components())
            .map(|component| self.size.component_extent(component).1)
            .max()
            .unwrap_or(0)
    }

    // B-7
    fn tile_rect(&self, tile: usize) -> TileRect {
        let size = &self.size;
        let num_tiles_x = cmp::max(size.num_tiles_x(), 1);
        let p = (tile % num_tiles_x) as u64;
        let q = (tile / num_tiles_x) as u64;
        let tile_width = u64::from(size.reference_tile_width);
        let tile_height = u64::from(size.reference_tile_height);
        let origin_x = u64::from(size.tile_horizontal_offset);
        let origin_y = u64::from(size.tile_vertical_offset);

        TileRect {
            x0: cmp::max(origin_x + p * tile_width, u64::from(size.image_horizontal_offset)) as u32,
            y0: cmp::max(origin_y + q * tile_height, u64::from(size.image_vertical_offset)) as u32,
            x1: cmp::min(
                origin_x + (p + 1) * tile_width,
                u64::from(size.reference_grid_width),
            ) as u32,
            y1: cmp::min(
                origin_y + (q + 1) * tile_height,
                u64::from(size.reference_grid_height),
            ) as u32,
        }
    }

    fn num_layers(&self, tile: usize) -> usize {
        self.coding_style(tile).no_layers as usize
    }

    fn decomposition_levels(&self, tile: usize, component: usize) -> usize {
        self.component_coding_style(tile, component)
            .no_decomposition_levels as usize
    }

    fn min_decomposition_levels(&self) -> usize {
        let no_components = self.size.no_components();
        (0..self.tiles.len())
            .flat_map(|tile| {
                (0..no_components).map(move |component| self.decomposition_levels(tile, component))
            })
            .min()
            .unwrap_or(self.coding_style.no_decomposition_levels as usize)
    }

    fn progression_order(&self, tile: usize) -> ProgressionOrder {
        self.coding_style(tile).progression_order
    }

    fn progression_changes(&self, tile: usize) -> Option<Vec<ProgressionChange>> {
        self.tile_coding_style(tile)
            .and_then(|style| style.progression_changes.clone())
            .or_else(|| self.progression_changes.clone())
    }

    fn code_block_style(&self, tile: usize, component: usize) -> CodeBlockStyle {
        self.component_coding_style(tile, component).code_block_style
    }

    fn start_tile_part_header(&mut self, tile: usize, tile_part: u8, num_tile_parts: usize) {
        debug!(
            "Tile-part header {} of tile {} ({} tile-parts)",
            tile_part, tile, num_tile_parts
        );
        self.start_of_data = false;
    }

    fn extract_tile_part_marker<R: io::Read + io::Seek>(
        &mut self,
        marker: MarkerSymbol,
        reader: &mut R,
        tile: usize,
        tile_part: u8,
    ) -> Result<(), CodestreamError> {
        let no_components = self.size.no_components();
        let offset = reader.stream_position()?.saturating_sub(2);
        let style = match self.tiles.get_mut(tile) {
            Some(style) => style,
            None => {
                return Err(CodestreamError::TileIndexOutOfRange {
                    tile: tile as u16,
                    num_tiles: self.tiles.len(),
                    offset,
                })
            }
        };
        if style.components.is_empty() {
            style.components = vec![None; no_components];
        }

        match marker {
            MARKER_SYMBOL_SOD => {
                self.start_of_data = true;
            }
            // COD and COC are only allowed in the first tile-part of a tile
            MARKER_SYMBOL_COD if tile_part == 0 => {
                style.coding_style = Some(decode_cod(reader)?);
            }
            MARKER_SYMBOL_COC if tile_part == 0 => {
                let (component, component_style) = decode_coc(reader, no_components)?;
                style.components[component] = Some(component_style);
            }
            MARKER_SYMBOL_COD | MARKER_SYMBOL_COC => {
                return Err(CodestreamError::MarkerUnexpected { marker, offset });
            }
            MARKER_SYMBOL_POC => {
                let changes = decode_poc(reader, no_components)?;
                style
                    .progression_changes
                    .get_or_insert_with(Vec::new)
                    .extend(changes);
            }
            MARKER_SYMBOL_SOT | MARKER_SYMBOL_SIZ => {
                return Err(CodestreamError::MarkerUnexpected { marker, offset });
            }
            _ => skip_segment(reader, marker)?,
        }
        Ok(())
    }

    fn start_of_data_found(&self) -> bool {
        self.start_of_data
    }
}
