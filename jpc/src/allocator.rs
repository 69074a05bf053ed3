use log::info;

use super::config::RateMode;
use super::locator::CodestreamLayout;
use super::CodestreamError;

/// Number of codestream bytes the reader may consume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Budget {
    bytes: u64,
    bits_per_pixel: f64,
}

impl Budget {
    pub fn new(bytes: u64, bits_per_pixel: f64) -> Self {
        Self {
            bytes,
            bits_per_pixel,
        }
    }

    pub fn unlimited() -> Self {
        Self {
            bytes: u64::MAX,
            bits_per_pixel: f64::INFINITY,
        }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn bits_per_pixel(&self) -> f64 {
        self.bits_per_pixel
    }

    pub fn is_unlimited(&self) -> bool {
        self.bytes == u64::MAX
    }
}

/// Outcome of offering a tile-part to the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Recorded, scanning continues.
    Accepted,
    /// Recorded, but the budget is used up.
    LastAccepted,
    /// Not recorded, the budget is used up.
    Rejected,
}

/// Splits the byte budget into per-tile allowances and keeps track of the
/// bytes consumed.
///
/// In truncation mode allowances are granted while the codestream is scanned,
/// tile-part by tile-part, until the budget is exhausted. In parsing mode they
/// are computed once the scan is complete, proportionally to the length of
/// each tile. The allowances are kept as a snapshot so that they can be
/// restored when decoding starts over from the first tile.
#[derive(Debug, Clone, PartialEq)]
pub struct RateAllocator {
    mode: RateMode,
    budget: Budget,
    charge_headers: bool,
    consumed: u64,
    granted: u64,
    header_bytes: u64,
    allowances: Vec<u64>,
    snapshot: Vec<u64>,
    snapshot_consumed: u64,
}

impl RateAllocator {
    /// With `charge_headers` unset, main and tile-part headers are not counted
    /// against the budget.
    pub fn new(mode: RateMode, budget: Budget, num_tiles: usize, charge_headers: bool) -> Self {
        Self {
            mode,
            budget,
            charge_headers,
            consumed: 0,
            granted: 0,
            header_bytes: 0,
            allowances: vec![0; num_tiles],
            snapshot: vec![0; num_tiles],
            snapshot_consumed: 0,
        }
    }

    pub fn mode(&self) -> RateMode {
        self.mode
    }

    pub fn budget(&self) -> Budget {
        self.budget
    }

    /// Bytes consumed so far, headers included.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Bytes of the main header and of every accepted tile-part header.
    pub fn header_bytes(&self) -> u64 {
        self.header_bytes
    }

    pub fn allowance(&self, tile: usize) -> u64 {
        self.allowances.get(tile).copied().unwrap_or(0)
    }

    pub fn allowances(&self) -> &[u64] {
        &self.allowances
    }

    /// Allowances as they were when the scan completed.
    pub fn snapshot(&self) -> &[u64] {
        &self.snapshot
    }

    pub(crate) fn start(&mut self, main_header_length: u64) -> Result<(), CodestreamError> {
        self.header_bytes = main_header_length;
        self.consumed = if self.charge_headers {
            main_header_length
        } else {
            0
        };
        if self.consumed > self.budget.bytes {
            return Err(CodestreamError::BudgetTooSmall {
                budget: self.budget.bytes,
                required: self.consumed,
            });
        }
        Ok(())
    }

    /// Offers a tile-part of `tile` whose header ends `header_end` bytes into
    /// the codestream. `first` is set for the first tile-part of the
    /// codestream.
    pub(crate) fn admit_tile_part(
        &mut self,
        tile: usize,
        header_end: u64,
        header_length: u64,
        length: u64,
        first: bool,
    ) -> Result<Admission, CodestreamError> {
        let budget = self.budget.bytes;
        match self.mode {
            RateMode::Truncation => {
                if self.charge_headers && header_end > budget {
                    if first {
                        return Err(CodestreamError::BudgetTooSmall {
                            budget,
                            required: header_end,
                        });
                    }
                    return Ok(Admission::Rejected);
                }

                let charged = if self.charge_headers { header_length } else { 0 };
                let body_length = length.saturating_sub(header_length);
                let committed = self.consumed.saturating_add(self.granted);
                let over_budget = committed.saturating_add(charged).saturating_add(body_length) > budget;
                self.consumed += charged;
                self.header_bytes += header_length;
                let (grant, admission) = if over_budget {
                    let committed = self.consumed.saturating_add(self.granted);
                    (budget.saturating_sub(committed), Admission::LastAccepted)
                } else {
                    (body_length, Admission::Accepted)
                };
                self.allowances[tile] += grant;
                self.granted += grant;
                Ok(admission)
            }
            RateMode::Parsing => {
                if self.consumed.saturating_add(header_length) > budget {
                    if first {
                        return Err(CodestreamError::BudgetTooSmall {
                            budget,
                            required: self.consumed + header_length,
                        });
                    }
                    return Ok(Admission::Rejected);
                }
                self.consumed += header_length;
                self.header_bytes += header_length;
                Ok(Admission::Accepted)
            }
        }
    }

    /// Completes the allocation once every tile-part has been located.
    pub(crate) fn finish(&mut self, layout: &CodestreamLayout, area: f64) -> Result<(), CodestreamError> {
        if layout.truncated() {
            let available = layout.available_bytes();
            if available < self.budget.bytes {
                info!(
                    "Codestream truncated, reducing byte budget from {} to {}",
                    self.budget.bytes, available
                );
                let bits_per_pixel = if area > 0.0 {
                    available as f64 * 8.0 / area
                } else {
                    f64::INFINITY
                };
                self.budget = Budget::new(available, bits_per_pixel);
            }
        }

        match self.mode {
            RateMode::Parsing => {
                let lengths: Vec<u64> = layout.tiles().iter().map(|tile| tile.total_length()).collect();
                self.allocate(&lengths)?;
            }
            RateMode::Truncation => {
                if !layout.truncated() && layout.scan_end() >= self.budget.bytes {
                    self.consumed += 2;
                }
            }
        }

        self.take_snapshot();
        Ok(())
    }

    fn take_snapshot(&mut self) {
        self.snapshot = self.allowances.clone();
        self.snapshot_consumed = self.consumed;
    }

    // Shares what is left of the budget after the headers and the EOC marker
    // between the tiles, in proportion to their lengths. Tile 0 gets the
    // rounding remainder.
    fn allocate(&mut self, tile_lengths: &[u64]) -> Result<(), CodestreamError> {
        self.consumed += 2;
        if self.consumed > self.budget.bytes {
            return Err(CodestreamError::BudgetTooSmall {
                budget: self.budget.bytes,
                required: self.consumed,
            });
        }

        let total_length: u64 = tile_lengths.iter().sum();
        let available = self.budget.bytes - self.consumed;
        let mut remaining = available;
        for tile in (1..self.allowances.len()).rev() {
            let share = if total_length == 0 {
                0
            } else {
                let length = tile_lengths.get(tile).copied().unwrap_or(0);
                (u128::from(available) * u128::from(length) / u128::from(total_length)) as u64
            };
            self.allowances[tile] = share;
            remaining = remaining.saturating_sub(share);
        }
        if let Some(allowance) = self.allowances.first_mut() {
            *allowance = remaining;
        }
        Ok(())
    }

    /// Restores the allowances of every tile to what they were after the
    /// scan, for decoding to start over from the first tile.
    pub fn restart(&mut self) {
        self.consumed = self.snapshot_consumed;
        self.allowances = self.snapshot.clone();
    }

    pub(crate) fn charge(&mut self, bytes: u64) {
        self.consumed = self.consumed.saturating_add(bytes);
    }

    pub(crate) fn allowance_mut(&mut self, tile: usize) -> &mut u64 {
        &mut self.allowances[tile]
    }

    /// Hands unused bytes of a tile over to the next one.
    pub(crate) fn carry_over(&mut self, tile: usize, bytes: u64) {
        if let Some(allowance) = self.allowances.get_mut(tile + 1) {
            *allowance = allowance.saturating_add(bytes);
        }
    }
}
