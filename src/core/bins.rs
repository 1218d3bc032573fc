//! Superob bin borders.
//!
//! Coarse bins cover `range_factor` range bins and `azimuth_factor` rays.
//! Close to the radar a full-width azimuth bin would be much narrower than
//! `max_arc`, so bins there are shrunk symmetrically by up to
//! `(azimuth_factor - 1) / 2` rays on each side, widening with range.

use crate::io::namelist::SuperobParams;

/// Borders of all coarse bins of one elevation
#[derive(Debug, Clone, PartialEq)]
pub struct BinLayout {
    /// Range bin borders, `n_range() + 1` entries
    pub range_borders: Vec<usize>,
    /// Rays removed from each side of an azimuth bin, per coarse range index
    pub shrink: Vec<usize>,
    pub azimuth_factor: usize,
    pub n_azimuth: usize,
}

impl BinLayout {
    /// Number of coarse range bins
    pub fn n_range(&self) -> usize {
        self.range_borders.len().saturating_sub(1)
    }

    /// Number of coarse azimuth bins
    pub fn n_azimuth(&self) -> usize {
        self.n_azimuth
    }

    /// Fine range interval `[start, end)` of coarse range bin `j`
    pub fn range_span(&self, j: usize) -> (usize, usize) {
        (self.range_borders[j], self.range_borders[j + 1])
    }

    /// Fine ray interval `[start, end)` of coarse bin `(j, k)`, on azimuth-rotated data
    pub fn azimuth_span(&self, j: usize, k: usize) -> (usize, usize) {
        let shrink = self.shrink[j];
        (
            k * self.azimuth_factor + shrink,
            k * self.azimuth_factor + self.azimuth_factor - shrink,
        )
    }

    /// Number of fine cells inside coarse bin `(j, k)`
    pub fn cell_count(&self, j: usize, k: usize) -> usize {
        let (r0, r1) = self.range_span(j);
        let (a0, a1) = self.azimuth_span(j, k);
        (r1 - r0) * (a1 - a0)
    }
}

pub struct BinPlanner<'a> {
    params: &'a SuperobParams,
}

impl<'a> BinPlanner<'a> {
    pub fn new(params: &'a SuperobParams) -> Self {
        Self { params }
    }

    /// Rays by which data is rotated before binning, and the largest shrink
    pub fn sub_rays(&self) -> usize {
        self.params.azimuth_factor.saturating_sub(1) / 2
    }

    /// Plan the bins of one elevation with `naz` rays, `nr` bins and range step `rscale` (m)
    pub fn plan(&self, naz: usize, nr: usize, rscale: f64) -> BinLayout {
        let factor_r = self.params.range_factor;
        let factor_a = self.params.azimuth_factor;
        let n_range = nr / factor_r;

        let range_borders = (0..=n_range).map(|j| j * factor_r).collect();
        let limits = self.limits(naz, n_range, rscale);
        let z_max = self.sub_rays();

        // First width whose limit lies beyond j; full width past the last breakpoint
        let shrink = (0..n_range)
            .map(|j| limits.iter().position(|&limit| j < limit).unwrap_or(z_max))
            .collect();

        BinLayout {
            range_borders,
            shrink,
            azimuth_factor: factor_a,
            n_azimuth: naz / factor_a,
        }
    }

    /// Coarse range index up to which a bin of width `2·(z_max - z) + 1` rays
    /// stays below the maximum arc, for `z` in `0..=z_max`
    pub fn limits(&self, naz: usize, n_range: usize, rscale: f64) -> Vec<usize> {
        let z_max = self.sub_rays();
        let reach = 360.0 * 360.0 * self.params.max_arc
            / (2.0 * std::f64::consts::PI * naz as f64 * self.params.range_factor as f64 * rscale);

        (0..=z_max)
            .map(|z| {
                let width = (2 * (z_max - z) + 1) as f64;
                let limit = (reach / width).floor();
                if limit.is_finite() && limit >= 0.0 {
                    (limit as usize).min(n_range + 1)
                } else {
                    n_range + 1
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(range_factor: usize, azimuth_factor: usize, max_arc: f64) -> SuperobParams {
        SuperobParams {
            enabled: true,
            range_factor,
            azimuth_factor,
            max_arc,
            ..SuperobParams::default()
        }
    }

    #[test]
    fn test_bin_counts() {
        let params = params(4, 3, 3000.0);
        let planner = BinPlanner::new(&params);
        for (naz, nr) in [(360, 250), (361, 7), (420, 1000), (2, 3)] {
            let layout = planner.plan(naz, nr, 500.0);
            assert_eq!(layout.n_range() * layout.n_azimuth(), (naz / 3) * (nr / 4));
        }
    }

    #[test]
    fn test_range_borders_drop_partial_bin() {
        let params = params(4, 1, 3000.0);
        let layout = BinPlanner::new(&params).plan(360, 10, 500.0);
        assert_eq!(layout.range_borders, vec![0, 4, 8]);
        assert_eq!(layout.range_span(1), (4, 8));
    }

    #[test]
    fn test_shrink_widens_with_range() {
        // reach = 360 * 5000 / (2π * 2 * 1000) ≈ 143.2 coarse bins for one ray
        let params = params(2, 5, 5000.0);
        let planner = BinPlanner::new(&params);
        assert_eq!(planner.sub_rays(), 2);
        assert_eq!(planner.limits(360, 100, 1000.0), vec![28, 47, 101]);

        let layout = planner.plan(360, 200, 1000.0);
        assert_eq!(layout.shrink[0], 0);
        assert_eq!(layout.shrink[27], 0);
        assert_eq!(layout.shrink[28], 1);
        assert_eq!(layout.shrink[46], 1);
        assert_eq!(layout.shrink[47], 2);
        assert_eq!(layout.shrink[99], 2);
        assert!(layout.shrink.windows(2).all(|w| w[0] <= w[1]));

        assert_eq!(layout.azimuth_span(0, 3), (15, 20));
        assert_eq!(layout.azimuth_span(30, 3), (16, 19));
        assert_eq!(layout.azimuth_span(60, 3), (17, 18));
        assert_eq!(layout.cell_count(60, 0), 2);
    }

    #[test]
    fn test_unlimited_arc_keeps_full_width() {
        let params = params(4, 3, f64::INFINITY);
        let layout = BinPlanner::new(&params).plan(360, 40, 250.0);
        assert!(layout.shrink.iter().all(|&s| s == 0));
    }
}
