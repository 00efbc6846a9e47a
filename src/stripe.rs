//! Dual-stripe statistics merging.
//!
//! Dual-IFE sensors split a frame into two horizontal stripes processed by
//! separate hardware blocks. Region-grid statistics arrive as two partial
//! buffers that must be recombined into one row-major grid; full-frame
//! statistics (histograms) arrive as two complete accumulations that must
//! be summed. The caller selects the mode explicitly per statistic kind —
//! the merger never guesses.

use crate::error::{Result, SchedError};
use serde::{Deserialize, Serialize};

/// How two stripes combine into one logical result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeMode {
    /// Row-major placement of left and right region columns.
    Interleave,
    /// Element-wise saturating addition of two full-frame accumulations.
    Accumulate,
}

/// Geometry of a striped region grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeGeometry {
    /// Region columns produced by the left stripe.
    pub left_regions: usize,
    /// Region columns produced by the right stripe.
    pub right_regions: usize,
    /// Region rows, identical for both stripes.
    pub rows: usize,
    /// Bytes per region element.
    pub element_size: usize,
}

impl StripeGeometry {
    /// Total region count of the merged grid.
    pub fn region_count(&self) -> usize {
        self.rows * (self.left_regions + self.right_regions)
    }

    /// Expected byte length of the left stripe buffer.
    pub fn left_len(&self) -> usize {
        self.rows * self.left_regions * self.element_size
    }

    /// Expected byte length of the right stripe buffer.
    pub fn right_len(&self) -> usize {
        self.rows * self.right_regions * self.element_size
    }

    /// Expected byte length of the merged output.
    pub fn merged_len(&self) -> usize {
        self.region_count() * self.element_size
    }

    pub fn validate(&self) -> Result<()> {
        if self.rows == 0 || self.left_regions == 0 || self.right_regions == 0 {
            return Err(SchedError::StripeGeometry(format!(
                "degenerate grid {}x({}+{})",
                self.rows, self.left_regions, self.right_regions
            )));
        }
        if !matches!(self.element_size, 1 | 2 | 4 | 8) {
            return Err(SchedError::StripeGeometry(format!(
                "unsupported element size {}",
                self.element_size
            )));
        }
        Ok(())
    }
}

/// Combines two hardware-partial statistics buffers into one logical
/// result, using the geometry and mode chosen by the caller.
#[derive(Debug, Clone, Copy)]
pub struct StripeMerger {
    geometry: StripeGeometry,
    mode: MergeMode,
}

impl StripeMerger {
    pub fn new(geometry: StripeGeometry, mode: MergeMode) -> Result<Self> {
        geometry.validate()?;
        if mode == MergeMode::Accumulate && geometry.element_size == 1 {
            return Err(SchedError::StripeGeometry(
                "accumulate mode needs at least 16-bit elements".to_string(),
            ));
        }
        Ok(Self { geometry, mode })
    }

    pub fn geometry(&self) -> StripeGeometry {
        self.geometry
    }

    pub fn merge(&self, left: &[u8], right: &[u8]) -> Result<Vec<u8>> {
        match self.mode {
            MergeMode::Interleave => self.interleave(left, right),
            MergeMode::Accumulate => self.accumulate(left, right),
        }
    }

    /// Row-major placement. For output region index `i` with
    /// `span = left + right`: `row = i / span`, `col = i % span`; a column
    /// below `left` comes from the left buffer at `i - row * right`,
    /// otherwise from the right buffer at `i - (row + 1) * left`.
    fn interleave(&self, left: &[u8], right: &[u8]) -> Result<Vec<u8>> {
        let g = &self.geometry;
        check_len(left, g.left_len())?;
        check_len(right, g.right_len())?;

        let span = g.left_regions + g.right_regions;
        let elem = g.element_size;
        let mut out = vec![0u8; g.merged_len()];
        for i in 0..g.region_count() {
            let row = i / span;
            let col = i % span;
            let (src, src_region) = if col < g.left_regions {
                (left, i - row * g.right_regions)
            } else {
                (right, i - (row + 1) * g.left_regions)
            };
            let src_off = src_region * elem;
            let dst_off = i * elem;
            out[dst_off..dst_off + elem].copy_from_slice(&src[src_off..src_off + elem]);
        }
        Ok(out)
    }

    /// Element-wise saturating addition of two equally-shaped full-frame
    /// accumulations. Elements are little-endian unsigned lanes.
    fn accumulate(&self, left: &[u8], right: &[u8]) -> Result<Vec<u8>> {
        check_len(right, left.len())?;
        let elem = self.geometry.element_size;
        if left.len() % elem != 0 {
            return Err(SchedError::StripeLength {
                expected: left.len().next_multiple_of(elem),
                actual: left.len(),
            });
        }
        let mut out = vec![0u8; left.len()];
        for ((l, r), o) in left
            .chunks_exact(elem)
            .zip(right.chunks_exact(elem))
            .zip(out.chunks_exact_mut(elem))
        {
            match elem {
                2 => {
                    let sum = u16::from_le_bytes(l.try_into().unwrap())
                        .saturating_add(u16::from_le_bytes(r.try_into().unwrap()));
                    o.copy_from_slice(&sum.to_le_bytes());
                }
                4 => {
                    let sum = u32::from_le_bytes(l.try_into().unwrap())
                        .saturating_add(u32::from_le_bytes(r.try_into().unwrap()));
                    o.copy_from_slice(&sum.to_le_bytes());
                }
                8 => {
                    let sum = u64::from_le_bytes(l.try_into().unwrap())
                        .saturating_add(u64::from_le_bytes(r.try_into().unwrap()));
                    o.copy_from_slice(&sum.to_le_bytes());
                }
                _ => unreachable!("validated in new()"),
            }
        }
        Ok(out)
    }
}

fn check_len(buf: &[u8], expected: usize) -> Result<()> {
    if buf.len() != expected {
        return Err(SchedError::StripeLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a buffer of `regions` elements where element `n` is the byte
    /// pattern `[base + n; elem]`.
    fn pattern(base: u8, regions: usize, elem: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(regions * elem);
        for n in 0..regions {
            buf.extend(std::iter::repeat_n(base + n as u8, elem));
        }
        buf
    }

    #[test]
    fn test_interleave_documented_layout() {
        // L=2, R=3, rows=2, E=4: the canonical interleave check.
        let geometry = StripeGeometry {
            left_regions: 2,
            right_regions: 3,
            rows: 2,
            element_size: 4,
        };
        let merger = StripeMerger::new(geometry, MergeMode::Interleave).unwrap();
        // Left regions tagged 0x10.., right regions tagged 0x80...
        let left = pattern(0x10, 4, 4);
        let right = pattern(0x80, 6, 4);
        let out = merger.merge(&left, &right).unwrap();

        // Expected row-major grid:
        //   row 0: L0 L1 R0 R1 R2
        //   row 1: L2 L3 R3 R4 R5
        let expected: Vec<u8> = [
            0x10u8, 0x11, 0x80, 0x81, 0x82, // row 0
            0x12, 0x13, 0x83, 0x84, 0x85, // row 1
        ]
        .iter()
        .flat_map(|&tag| [tag; 4])
        .collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_interleave_single_row() {
        let geometry = StripeGeometry {
            left_regions: 3,
            right_regions: 1,
            rows: 1,
            element_size: 1,
        };
        let merger = StripeMerger::new(geometry, MergeMode::Interleave).unwrap();
        let out = merger.merge(&[1, 2, 3], &[9]).unwrap();
        assert_eq!(out, vec![1, 2, 3, 9]);
    }

    #[test]
    fn test_interleave_length_mismatch() {
        let geometry = StripeGeometry {
            left_regions: 2,
            right_regions: 2,
            rows: 2,
            element_size: 2,
        };
        let merger = StripeMerger::new(geometry, MergeMode::Interleave).unwrap();
        let err = merger.merge(&[0u8; 6], &[0u8; 8]).unwrap_err();
        assert!(matches!(
            err,
            SchedError::StripeLength {
                expected: 8,
                actual: 6
            }
        ));
    }

    #[test]
    fn test_accumulate_sums_lanes() {
        let geometry = StripeGeometry {
            left_regions: 1,
            right_regions: 1,
            rows: 1,
            element_size: 4,
        };
        let merger = StripeMerger::new(geometry, MergeMode::Accumulate).unwrap();
        let left: Vec<u8> = [100u32, 200].iter().flat_map(|v| v.to_le_bytes()).collect();
        let right: Vec<u8> = [11u32, 22].iter().flat_map(|v| v.to_le_bytes()).collect();
        let out = merger.merge(&left, &right).unwrap();
        let sums: Vec<u32> = out
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(sums, vec![111, 222]);
    }

    #[test]
    fn test_accumulate_saturates() {
        let geometry = StripeGeometry {
            left_regions: 1,
            right_regions: 1,
            rows: 1,
            element_size: 2,
        };
        let merger = StripeMerger::new(geometry, MergeMode::Accumulate).unwrap();
        let left = u16::MAX.to_le_bytes().to_vec();
        let right = 5u16.to_le_bytes().to_vec();
        let out = merger.merge(&left, &right).unwrap();
        assert_eq!(u16::from_le_bytes(out.try_into().unwrap()), u16::MAX);
    }

    #[test]
    fn test_degenerate_geometry_rejected() {
        let geometry = StripeGeometry {
            left_regions: 0,
            right_regions: 3,
            rows: 2,
            element_size: 4,
        };
        assert!(StripeMerger::new(geometry, MergeMode::Interleave).is_err());
    }

    #[test]
    fn test_accumulate_rejects_byte_elements() {
        let geometry = StripeGeometry {
            left_regions: 1,
            right_regions: 1,
            rows: 1,
            element_size: 1,
        };
        assert!(StripeMerger::new(geometry, MergeMode::Accumulate).is_err());
    }
}
