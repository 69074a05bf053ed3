use log::warn;

use super::allocator::Budget;
use super::progression::ProgressionChange;
use super::CodestreamError;

/// Target rate the reader is allowed to consume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TargetRate {
    /// Read the whole codestream.
    Unlimited,
    /// Bits per pixel of the largest component.
    BitsPerPixel(f32),
    /// Absolute number of codestream bytes.
    Bytes(u64),
}

impl Default for TargetRate {
    fn default() -> Self {
        Self::Unlimited
    }
}

impl TargetRate {
    /// Byte budget for a component of `width` x `height` samples.
    pub fn resolve(self, width: u32, height: u32) -> Budget {
        let area = f64::from(width) * f64::from(height);
        match self {
            Self::Unlimited => Budget::unlimited(),
            Self::BitsPerPixel(rate) => {
                let bits = f64::from(rate) * area;
                let bytes = if bits.is_finite() && bits >= 0.0 {
                    (bits as u64) / 8
                } else {
                    u64::MAX
                };
                Budget::new(bytes, f64::from(rate))
            }
            Self::Bytes(bytes) => {
                let rate = if area > 0.0 {
                    bytes as f64 * 8.0 / area
                } else {
                    f64::INFINITY
                };
                Budget::new(bytes, rate)
            }
        }
    }
}

/// How the byte budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateMode {
    /// Bytes are granted to tiles in codestream order until the budget runs
    /// out.
    Truncation,
    /// The whole codestream is parsed and the budget is shared between tiles
    /// in proportion to their lengths, dropping layers that do not fit.
    Parsing,
}

impl Default for RateMode {
    fn default() -> Self {
        Self::Truncation
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecoderConfig {
    rate: TargetRate,
    mode: RateMode,
    max_code_blocks: Option<usize>,
    max_layers: Option<usize>,
    resolution: Option<usize>,
    first_progression_only: bool,
    progression_override: Option<Vec<ProgressionChange>>,
}

impl DecoderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(mut self, rate: TargetRate) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_mode(mut self, mode: RateMode) -> Self {
        self.mode = mode;
        self
    }

    /// Stop decoding after this many code-blocks. Header bytes are then not
    /// charged against the budget.
    pub fn with_max_code_blocks(mut self, max_code_blocks: usize) -> Self {
        self.max_code_blocks = Some(max_code_blocks);
        self
    }

    /// Never return more than this many quality layers.
    pub fn with_max_layers(mut self, max_layers: usize) -> Self {
        self.max_layers = Some(max_layers);
        self
    }

    /// Highest resolution level to decode.
    pub fn with_resolution(mut self, resolution: usize) -> Self {
        self.resolution = Some(resolution);
        self
    }

    /// Only walk the first progression of a tile and ignore later changes.
    pub fn with_first_progression_only(mut self, first_progression_only: bool) -> Self {
        self.first_progression_only = first_progression_only;
        self
    }

    /// Walk packets through these progression changes instead of the ones
    /// signalled in COD and POC.
    pub fn with_progression_override(mut self, changes: Vec<ProgressionChange>) -> Self {
        self.progression_override = Some(changes);
        self
    }

    pub fn rate(&self) -> TargetRate {
        self.rate
    }

    pub fn mode(&self) -> RateMode {
        self.mode
    }

    pub fn max_code_blocks(&self) -> Option<usize> {
        self.max_code_blocks
    }

    pub fn max_layers(&self) -> Option<usize> {
        self.max_layers
    }

    pub fn resolution(&self) -> Option<usize> {
        self.resolution
    }

    pub fn first_progression_only(&self) -> bool {
        self.first_progression_only
    }

    pub fn progression_override(&self) -> Option<&[ProgressionChange]> {
        self.progression_override.as_deref()
    }

    pub fn validate(&self) -> Result<(), CodestreamError> {
        if self.max_code_blocks.is_some() && self.mode == RateMode::Parsing {
            return Err(CodestreamError::InvalidConfiguration {
                error: "code-block limit cannot be combined with parsing mode".to_owned(),
            });
        }
        match self.rate {
            TargetRate::BitsPerPixel(rate) if !(rate >= 0.0) => {
                Err(CodestreamError::InvalidConfiguration {
                    error: format!("negative rate {}", rate),
                })
            }
            _ => Ok(()),
        }
    }

    /// Resolution level to decode given the smallest number of decomposition
    /// levels found in the codestream.
    pub(crate) fn target_resolution(&self, min_decomposition_levels: usize) -> usize {
        match self.resolution {
            None => min_decomposition_levels,
            Some(resolution) if resolution > min_decomposition_levels => {
                warn!(
                    "Specified resolution level ({}) is larger than the maximum possible. Setting it to {}",
                    resolution, min_decomposition_levels
                );
                min_decomposition_levels
            }
            Some(resolution) => resolution,
        }
    }
}
