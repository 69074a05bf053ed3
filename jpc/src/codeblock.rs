use std::collections::BTreeMap;
use std::fmt;

use super::CodestreamError;

/// Identifies a code-block within the active tile.
///
/// Keys order by component, resolution level, subband, row and column, which
/// is the order the table is enumerated in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CodeBlockKey {
    pub component: usize,
    pub resolution: usize,
    pub subband: usize,
    pub row: usize,
    pub col: usize,
}

impl CodeBlockKey {
    pub fn new(component: usize, resolution: usize, subband: usize, row: usize, col: usize) -> Self {
        Self {
            component,
            resolution,
            subband,
            row,
            col,
        }
    }
}

impl fmt::Display for CodeBlockKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "(c={}, r={}, s={}, y={}, x={})",
            self.component, self.resolution, self.subband, self.row, self.col
        )
    }
}

/// Position and size of a code-block in its subband.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeBlockGeometry {
    pub ulx: u32,
    pub uly: u32,
    pub width: u32,
    pub height: u32,
}

/// What one packet contributed to a code-block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerContribution {
    /// Absolute byte offset of the contribution in the codestream.
    pub offset: u64,
    pub length: u32,
    /// Number of new coding passes.
    pub truncation_points: u32,
    /// Lengths of the terminated segments in this contribution, if the
    /// contribution holds more than one.
    pub segment_lengths: Option<Vec<u32>>,
}

/// Per-layer bookkeeping of a single code-block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlockRecord {
    geometry: CodeBlockGeometry,
    msb_skipped: u32,
    lengths: Vec<u32>,
    offsets: Vec<u64>,
    truncation_points: Vec<u32>,
    segment_lengths: Vec<Option<Vec<u32>>>,
    packet_indices: Vec<Option<usize>>,
}

impl CodeBlockRecord {
    fn new(num_layers: usize, geometry: CodeBlockGeometry) -> Self {
        Self {
            geometry,
            msb_skipped: 0,
            lengths: vec![0; num_layers],
            offsets: vec![0; num_layers],
            truncation_points: vec![0; num_layers],
            segment_lengths: vec![None; num_layers],
            packet_indices: vec![None; num_layers],
        }
    }

    pub fn geometry(&self) -> CodeBlockGeometry {
        self.geometry
    }

    pub fn set_geometry(&mut self, geometry: CodeBlockGeometry) {
        self.geometry = geometry;
    }

    /// Number of skipped most significant bit-planes.
    pub fn msb_skipped(&self) -> u32 {
        self.msb_skipped
    }

    pub fn set_msb_skipped(&mut self, msb_skipped: u32) {
        self.msb_skipped = msb_skipped;
    }

    pub fn num_layers(&self) -> usize {
        self.lengths.len()
    }

    pub fn length(&self, layer: usize) -> u32 {
        self.lengths.get(layer).copied().unwrap_or(0)
    }

    pub fn offset(&self, layer: usize) -> u64 {
        self.offsets.get(layer).copied().unwrap_or(0)
    }

    pub fn truncation_points(&self, layer: usize) -> u32 {
        self.truncation_points.get(layer).copied().unwrap_or(0)
    }

    pub fn segment_lengths(&self, layer: usize) -> Option<&[u32]> {
        self.segment_lengths
            .get(layer)
            .and_then(|segments| segments.as_deref())
    }

    /// Index, in walk order, of the packet that carried this code-block's
    /// contribution to `layer`.
    pub fn packet_index(&self, layer: usize) -> Option<usize> {
        self.packet_indices.get(layer).copied().flatten()
    }

    pub fn lengths(&self) -> &[u32] {
        &self.lengths
    }

    pub fn total_length(&self) -> u64 {
        self.lengths.iter().map(|&length| u64::from(length)).sum()
    }

    pub fn set_layer(
        &mut self,
        layer: usize,
        contribution: LayerContribution,
    ) -> Result<(), CodestreamError> {
        self.check_layer(layer)?;
        self.offsets[layer] = contribution.offset;
        self.lengths[layer] = contribution.length;
        self.truncation_points[layer] = contribution.truncation_points;
        self.segment_lengths[layer] = contribution.segment_lengths;
        Ok(())
    }

    /// Records which packet carried `layer` for this code-block.
    pub fn mark_packet(&mut self, layer: usize, packet_index: usize) -> Result<(), CodestreamError> {
        self.check_layer(layer)?;
        self.packet_indices[layer] = Some(packet_index);
        Ok(())
    }

    pub(crate) fn drop_layer(&mut self, layer: usize) {
        if layer < self.lengths.len() {
            self.lengths[layer] = 0;
            self.offsets[layer] = 0;
            self.truncation_points[layer] = 0;
            self.segment_lengths[layer] = None;
        }
    }

    fn check_layer(&self, layer: usize) -> Result<(), CodestreamError> {
        if layer >= self.lengths.len() {
            return Err(CodestreamError::InvalidLayerRange {
                first: layer,
                count: 1,
                num_layers: self.lengths.len(),
            });
        }
        Ok(())
    }
}

/// Code-blocks of the active tile, enumerable in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeBlockTable {
    num_layers: usize,
    records: Vec<CodeBlockRecord>,
    index: BTreeMap<CodeBlockKey, usize>,
}

impl CodeBlockTable {
    pub fn new(num_layers: usize) -> Self {
        Self {
            num_layers,
            records: Vec::new(),
            index: BTreeMap::new(),
        }
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, key: &CodeBlockKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &CodeBlockKey) -> Option<&CodeBlockRecord> {
        self.index.get(key).map(|&slot| &self.records[slot])
    }

    pub fn get_mut(&mut self, key: &CodeBlockKey) -> Option<&mut CodeBlockRecord> {
        match self.index.get(key) {
            Some(&slot) => Some(&mut self.records[slot]),
            None => None,
        }
    }

    /// Returns the record for `key`, creating an empty one first if the
    /// code-block has not been seen yet.
    pub fn insert(&mut self, key: CodeBlockKey, geometry: CodeBlockGeometry) -> &mut CodeBlockRecord {
        let slot = match self.index.get(&key) {
            Some(&slot) => slot,
            None => {
                let slot = self.records.len();
                self.records.push(CodeBlockRecord::new(self.num_layers, geometry));
                self.index.insert(key, slot);
                slot
            }
        };
        &mut self.records[slot]
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CodeBlockKey, &CodeBlockRecord)> {
        self.index
            .iter()
            .map(move |(key, &slot)| (key, &self.records[slot]))
    }

    pub fn keys(&self) -> impl Iterator<Item = &CodeBlockKey> {
        self.index.keys()
    }

    pub(crate) fn slots_in_order(&self) -> Vec<usize> {
        self.index.values().copied().collect()
    }

    pub(crate) fn slot_mut(&mut self, slot: usize) -> &mut CodeBlockRecord {
        &mut self.records[slot]
    }
}
