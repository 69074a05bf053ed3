use log::warn;
use std::io;

use super::codeblock::{CodeBlockGeometry, CodeBlockKey, CodeBlockRecord};
use super::header::CodeBlockStyle;
use super::CodestreamError;

// Coding passes per bit-plane: significance propagation, magnitude refinement
// and cleanup.
const NUM_PASSES: usize = 3;

// The most significant bit-plane has a cleanup pass only.
const NUM_EMPTY_PASSES_IN_MS_BP: usize = 2;

// Bit-planes coded without bypass before the raw passes start (D.6).
const NUM_NON_BYPASS_MS_BP: usize = 4;

// Index of the first coding pass that may be coded in raw mode.
const FIRST_BYPASS_PASS_IDX: usize = NUM_PASSES * NUM_NON_BYPASS_MS_BP - NUM_EMPTY_PASSES_IN_MS_BP;

/// Compressed data of a code-block over a range of quality layers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayeredCodeBlock {
    pub key: CodeBlockKey,
    pub geometry: CodeBlockGeometry,
    pub msb_skipped: u32,
    /// Number of layers asked for.
    pub layers_requested: usize,
    /// Number of layers in the range that contributed any data.
    pub layers_with_data: usize,
    /// Index of the first coding pass included, counted from the first
    /// layer of the code-block.
    pub first_truncation_point: usize,
    /// Number of coding passes included.
    pub truncation_points: usize,
    pub data: Vec<u8>,
    /// Lengths of the terminated segments in `data`.
    pub segment_lengths: Vec<u32>,
    /// Whether layers after the range hold more data for this code-block.
    pub more_data: bool,
}

impl LayeredCodeBlock {
    /// Whether the first truncation point is at the start of the code-block.
    pub fn starts_at_first_pass(&self) -> bool {
        self.first_truncation_point == 0
    }
}

// Bookkeeping of a layer range, before reading any data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SegmentLayout {
    pub(crate) first_truncation_point: usize,
    pub(crate) truncation_points: usize,
    pub(crate) layers_with_data: usize,
    pub(crate) data_length: u64,
    pub(crate) segment_lengths: Vec<u32>,
    pub(crate) more_data: bool,
}

fn is_terminated_bypass_pass(pass: usize) -> bool {
    pass >= FIRST_BYPASS_PASS_IDX - 1 && (pass + NUM_EMPTY_PASSES_IN_MS_BP) % NUM_PASSES != 0
}

/// Lays out the data of layers `first_layer..layer_end` of a code-block.
///
/// With selective arithmetic coding bypass, raw coding passes are terminated
/// on their own, so the data splits into one segment for the arithmetic coded
/// passes and one per terminated raw pass. With termination on each coding
/// pass every pass is a segment. Otherwise all data forms a single segment.
pub(crate) fn layout_segments(
    record: &CodeBlockRecord,
    first_layer: usize,
    layer_end: usize,
    style: CodeBlockStyle,
) -> SegmentLayout {
    let num_layers = record.num_layers();
    let layer_end = layer_end.min(num_layers);
    let first_layer = first_layer.min(layer_end);
    let passes = |layer: usize| record.truncation_points(layer) as usize;

    // Coding passes of empty leading layers are not part of the data
    let first_truncation_point = (0..layer_end)
        .take_while(|&layer| record.length(layer) == 0)
        .map(passes)
        .sum::<usize>();
    let passes_before: usize = (0..first_layer).map(passes).sum();
    let first_pass = first_truncation_point.max(passes_before);
    let last_pass: usize = (0..layer_end).map(passes).sum();

    let layers: Vec<usize> = (first_layer..layer_end)
        .filter(|&layer| record.length(layer) != 0)
        .collect();
    let data_length: u64 = layers
        .iter()
        .map(|&layer| u64::from(record.length(layer)))
        .sum();
    let truncation_points = layers.iter().map(|&layer| passes(layer)).sum::<usize>();
    let more_data = (layer_end..num_layers).any(|layer| record.length(layer) != 0);

    let segment_lengths = if data_length == 0 {
        Vec::new()
    } else if style.termination_on_each_coding_pass() {
        terminated_pass_segments(record, &layers)
    } else if style.selective_arithmetic_coding_bypass() {
        bypass_segments(record, &layers, first_pass, last_pass)
    } else {
        vec![data_length as u32]
    };

    SegmentLayout {
        first_truncation_point,
        truncation_points,
        layers_with_data: layers.len(),
        data_length,
        segment_lengths,
        more_data,
    }
}

// One segment per coding pass. A layer without explicit segment lengths
// carries a single segment for all its passes.
fn terminated_pass_segments(record: &CodeBlockRecord, layers: &[usize]) -> Vec<u32> {
    let mut segments = Vec::new();
    for &layer in layers {
        let length = record.length(layer);
        let passes = record.truncation_points(layer) as usize;
        match record.segment_lengths(layer) {
            Some(lengths) => segments.extend(lengths.iter().take(passes.max(1)).copied()),
            None => {
                segments.push(length);
                segments.extend(std::iter::repeat(0).take(passes.saturating_sub(1)));
            }
        }
    }
    segments
}

// The passes up to the first raw pass form one segment, every terminated raw
// pass closes the current segment.
fn bypass_segments(
    record: &CodeBlockRecord,
    layers: &[usize],
    first_pass: usize,
    last_pass: usize,
) -> Vec<u32> {
    let num_segments = if last_pass <= FIRST_BYPASS_PASS_IDX {
        1
    } else {
        1 + (first_pass..last_pass)
            .filter(|&pass| is_terminated_bypass_pass(pass))
            .count()
    };
    let mut segments = vec![0u32; num_segments];
    let mut segment = 0;

    for &layer in layers {
        let passes_before: usize = (0..layer).map(|l| record.truncation_points(l) as usize).sum();
        let passes_end = passes_before + record.truncation_points(layer) as usize;
        let explicit = record.segment_lengths(layer);
        let mut remaining = record.length(layer);
        let mut next = 0;

        for pass in passes_before..passes_end {
            if !is_terminated_bypass_pass(pass) {
                continue;
            }
            if segment >= num_segments {
                warn!("More terminated coding passes than segments in code-block, ignoring");
                break;
            }
            let length = match explicit.and_then(|lengths| lengths.get(next)) {
                Some(&length) => {
                    next += 1;
                    length.min(remaining)
                }
                None => remaining,
            };
            segments[segment] += length;
            remaining -= length;
            segment += 1;
        }

        // Data after the last terminated pass of the layer
        let length = match explicit.and_then(|lengths| lengths.get(next)) {
            Some(&length) => length.min(remaining),
            None => remaining,
        };
        if length > 0 {
            match segments.get_mut(segment) {
                Some(current) => *current += length,
                None => {
                    warn!("Code-block data past its last segment, appending to the last one");
                    if let Some(last) = segments.last_mut() {
                        *last += length;
                    }
                }
            }
        }
    }
    segments
}

/// Reads the data of layers `first_layer..layer_end` of a code-block.
pub(crate) fn read_code_block<R: io::Read + io::Seek>(
    reader: &mut R,
    key: CodeBlockKey,
    record: &CodeBlockRecord,
    first_layer: usize,
    layer_end: usize,
    style: CodeBlockStyle,
) -> Result<LayeredCodeBlock, CodestreamError> {
    let layout = layout_segments(record, first_layer, layer_end, style);

    let mut data = Vec::with_capacity(layout.data_length as usize);
    for layer in first_layer..layer_end.min(record.num_layers()) {
        let length = record.length(layer) as usize;
        if length == 0 {
            continue;
        }
        reader.seek(io::SeekFrom::Start(record.offset(layer)))?;
        let start = data.len();
        data.resize(start + length, 0);
        reader.read_exact(&mut data[start..])?;
    }

    Ok(LayeredCodeBlock {
        key,
        geometry: record.geometry(),
        msb_skipped: record.msb_skipped(),
        layers_requested: layer_end.saturating_sub(first_layer),
        layers_with_data: layout.layers_with_data,
        first_truncation_point: layout.first_truncation_point,
        truncation_points: layout.truncation_points,
        data,
        segment_lengths: layout.segment_lengths,
        more_data: layout.more_data,
    })
}
