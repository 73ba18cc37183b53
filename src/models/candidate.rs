use std::sync::Arc;

use nalgebra::DMatrix;

use super::{psf::place, Exposure, ModelGeometry, PsfLibrary, Result, Stamp};

/// Point source models for a grid of candidate positions
///
/// Candidates are rendered with PSFs normalized to a unit peak. Next to the
/// model stamp, a footprint mask tells the PSF core (`1`) from the outer part
/// of the stamp (`2`) where the local sky background is estimated.
pub struct CandidateGrid {
    library: Arc<PsfLibrary>,
    core_radius: f64,
}
impl CandidateGrid {
    /// Default radius [pixel] of the PSF core excluded from the sky estimate
    pub const CORE_RADIUS: f64 = 3.;

    pub fn new(library: Arc<PsfLibrary>) -> Self {
        Self {
            library,
            core_radius: Self::CORE_RADIUS,
        }
    }
    pub fn core_radius(mut self, radius: f64) -> Self {
        self.core_radius = radius;
        self
    }
    pub fn library(&self) -> &PsfLibrary {
        &self.library
    }
    fn stamp(&self, sep: f64, pa: f64, exposure: &Exposure, geometry: &ModelGeometry) -> Stamp {
        place(
            self.library.spline(exposure.pa, exposure.wv),
            self.library.stamp_shape(),
            sep,
            pa,
            exposure,
            geometry,
            None,
        )
    }
    /// Model stamps of the candidate at (`sep`, `pa`) in every exposure
    pub fn models(
        &self,
        sep: f64,
        pa: f64,
        exposures: &[Exposure],
        section: &[usize],
        geometry: &ModelGeometry,
    ) -> Result<DMatrix<f64>> {
        let nx = geometry.shape.1;
        let mut models = DMatrix::<f64>::zeros(exposures.len(), section.len());
        for (i, exposure) in exposures.iter().enumerate() {
            if exposure.is_library() {
                continue;
            }
            let stamp = self.stamp(sep, pa, exposure, geometry);
            for (j, v) in stamp.section_values(section, nx).into_iter().enumerate() {
                models[(i, j)] = v;
            }
        }
        Ok(models)
    }
    /// Model stamp and footprint mask of the candidate over the section pixels
    pub fn footprint(
        &self,
        sep: f64,
        pa: f64,
        exposure: &Exposure,
        section: &[usize],
        geometry: &ModelGeometry,
    ) -> (Vec<f64>, Vec<u8>) {
        let nx = geometry.shape.1;
        let stamp = self.stamp(sep, pa, exposure, geometry);
        let [sx, sy] = stamp.source;
        section
            .iter()
            .map(|&idx| {
                let (row, col) = (idx / nx, idx % nx);
                match stamp.get(row, col) {
                    Some(v) => {
                        let r = (col as f64 - sx).hypot(row as f64 - sy);
                        let mask = if r >= self.core_radius { 2 } else { 1 };
                        (if v.is_nan() { 0. } else { v }, mask)
                    }
                    None => (0., 0),
                }
            })
            .unzip()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn footprint_mask() {
        let psf = Array3::from_shape_fn((1, 11, 11), |(_, row, col)| {
            let (dx, dy) = (col as f64 - 5., row as f64 - 5.);
            2. * (-(dx * dx + dy * dy) / 4.).exp()
        });
        let library = Arc::new(PsfLibrary::peak_normalized(psf.view(), &[1.]).unwrap());
        let grid = CandidateGrid::new(library);
        let geometry = ModelGeometry {
            shape: (41, 41),
            center: [20., 20.],
            ref_wv: 1.,
            flipx: false,
        };
        let section: Vec<usize> = (0..41 * 41).collect();
        let (model, mask) =
            grid.footprint(10., 0., &Exposure::frame(0, 0., 1.), &section, &geometry);
        assert_eq!(mask.iter().filter(|m| **m > 0).count(), 121);
        let peak = 30 * 41 + 20;
        assert_eq!(mask[peak], 1);
        assert!((model[peak] - 1.).abs() < 1e-12);
        assert_eq!(mask[30 * 41 + 24], 2);
    }
}
