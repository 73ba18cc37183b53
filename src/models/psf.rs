use std::sync::Arc;

use nalgebra::DMatrix;
use ndarray::{Array2, ArrayView3, ArrayView4, Axis};

use super::{Exposure, FieldCorrection, ModelError, ModelGeometry, Result, SignalModel};
use crate::{geometry::source_offset, interp::BicubicSpline};

/// Empirical PSFs interpolated with bicubic splines
///
/// The library holds one PSF per wavelength, optionally for several epochs
/// tagged with their parallactic angle.
pub struct PsfLibrary {
    wvs: Vec<f64>,
    pas: Vec<f64>,
    shape: (usize, usize),
    // [epoch][wavelength]
    splines: Vec<Vec<BicubicSpline>>,
}
impl PsfLibrary {
    /// Library of `[wavelength, y, x]` PSFs
    pub fn new(psfs: ArrayView3<f64>, wvs: &[f64]) -> Result<Self> {
        let psfs = psfs.insert_axis(Axis(0));
        Self::time_variable(psfs, wvs, &[])
    }
    /// Library of `[epoch, wavelength, y, x]` PSFs, the nearest epoch in parallactic angle is used
    pub fn time_variable(psfs: ArrayView4<f64>, wvs: &[f64], pas: &[f64]) -> Result<Self> {
        let (n_epoch, n_wv, ny, nx) = psfs.dim();
        if n_epoch == 0 || n_wv == 0 || ny == 0 || nx == 0 {
            return Err(ModelError::EmptyLibrary);
        }
        if wvs.len() != n_wv {
            return Err(ModelError::PsfWavelengths(wvs.len(), n_wv));
        }
        if n_epoch > 1 && pas.len() != n_epoch {
            return Err(ModelError::PsfEpochs(pas.len(), n_epoch));
        }
        let splines = psfs
            .axis_iter(Axis(0))
            .map(|epoch| {
                epoch
                    .axis_iter(Axis(0))
                    .map(BicubicSpline::centered)
                    .collect()
            })
            .collect();
        Ok(Self {
            wvs: wvs.to_vec(),
            pas: pas.to_vec(),
            shape: (ny, nx),
            splines,
        })
    }
    /// Library of `[wavelength, y, x]` PSFs each scaled to a unit peak
    pub fn peak_normalized(psfs: ArrayView3<f64>, wvs: &[f64]) -> Result<Self> {
        let mut psfs = psfs.to_owned();
        for mut psf in psfs.axis_iter_mut(Axis(0)) {
            let peak = psf.iter().filter(|v| !v.is_nan()).fold(f64::NEG_INFINITY, |a, v| a.max(*v));
            if peak > 0. && peak.is_finite() {
                psf.mapv_inplace(|v| v / peak);
            }
        }
        Self::new(psfs.view(), wvs)
    }
    /// PSF wavelengths
    pub fn wvs(&self) -> &[f64] {
        &self.wvs
    }
    /// PSF stamp shape `(ny, nx)`
    pub fn stamp_shape(&self) -> (usize, usize) {
        self.shape
    }
    /// Index of the PSF wavelength nearest to `wv`
    pub fn wavelength_index(&self, wv: f64) -> usize {
        nearest(&self.wvs, wv)
    }
    /// Spline of the PSF nearest in parallactic angle and wavelength
    pub fn spline(&self, pa: f64, wv: f64) -> &BicubicSpline {
        let epoch = if self.splines.len() > 1 {
            nearest(&self.pas, pa)
        } else {
            0
        };
        &self.splines[epoch][self.wavelength_index(wv)]
    }
}

fn nearest(values: &[f64], value: f64) -> usize {
    values
        .iter()
        .enumerate()
        .min_by(|a, b| (a.1 - value).abs().total_cmp(&(b.1 - value).abs()))
        .map(|(i, _)| i)
        .unwrap_or_default()
}

/// A model rendered into a rectangular box of the image
#[derive(Debug, Clone)]
pub struct Stamp {
    pub row0: isize,
    pub col0: isize,
    /// Position `[x, y]` of the source in the image
    pub source: [f64; 2],
    pub values: Array2<f64>,
}
impl Stamp {
    /// Value at an image pixel, `None` outside the stamp
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        let (r, c) = (row as isize - self.row0, col as isize - self.col0);
        let (ny, nx) = self.values.dim();
        if r < 0 || c < 0 || r >= ny as isize || c >= nx as isize {
            None
        } else {
            Some(self.values[[r as usize, c as usize]])
        }
    }
    /// Stamp values over the section pixels of an image `nx` pixels wide, zero outside the stamp
    pub fn section_values(&self, section: &[usize], nx: usize) -> Vec<f64> {
        section
            .iter()
            .map(|&idx| {
                self.get(idx / nx, idx % nx)
                    .map(|v| if v.is_nan() { 0. } else { v })
                    .unwrap_or(0.)
            })
            .collect()
    }
}

/// Places the PSF of `spline` for a source at (`sep`, `pa`) into an exposure
///
/// The Cartesian offset of the source is magnified by `ref_wv / wv` and the
/// PSF is sampled on the stamp pixels at their offset from the source,
/// demagnified back to the exposure wavelength.
pub(super) fn place(
    spline: &BicubicSpline,
    stamp_shape: (usize, usize),
    sep: f64,
    pa: f64,
    exposure: &Exposure,
    geometry: &ModelGeometry,
    correction: Option<&dyn FieldCorrection>,
) -> Stamp {
    let [cx, cy] = geometry.center;
    let scale = geometry.ref_wv / exposure.wv;
    let (dx, dy) = source_offset(sep, pa, exposure.pa, geometry.flipx);
    let (sx, sy) = (dx * scale, dy * scale);
    let col_c = (sx + cx).round_ties_even() as isize;
    let row_c = (sy + cy).round_ties_even() as isize;
    let (ny, nx) = stamp_shape;
    let (col0, row0) = (col_c - (nx / 2) as isize, row_c - (ny / 2) as isize);
    let xs: Vec<f64> = (0..nx)
        .map(|i| ((col0 + i as isize) as f64 - cx - sx) / scale)
        .collect();
    let ys: Vec<f64> = (0..ny)
        .map(|j| ((row0 + j as isize) as f64 - cy - sy) / scale)
        .collect();
    let mut values = spline.grid(&xs, &ys);
    if let Some(correction) = correction {
        let gx = Array2::from_shape_fn((ny, nx), |(_, i)| (col0 + i as isize) as f64 - cx);
        let gy = Array2::from_shape_fn((ny, nx), |(j, _)| (row0 + j as isize) as f64 - cy);
        values = correction.correct(values, gx.view(), gy.view());
    }
    Stamp {
        row0,
        col0,
        source: [sx + cx, sy + cy],
        values,
    }
}

/// Point source at a given separation [pixel] and position angle [deg]
pub struct PointSource {
    pub sep: f64,
    pub pa: f64,
    library: Arc<PsfLibrary>,
    correction: Option<Arc<dyn FieldCorrection>>,
}
impl PointSource {
    pub fn new(sep: f64, pa: f64, library: Arc<PsfLibrary>) -> Self {
        Self {
            sep,
            pa,
            library,
            correction: None,
        }
    }
    /// Applies a field dependent correction to every placed stamp
    pub fn with_correction(mut self, correction: Arc<dyn FieldCorrection>) -> Self {
        self.correction = Some(correction);
        self
    }
    pub fn library(&self) -> &PsfLibrary {
        &self.library
    }
    /// Model stamp in an exposure, `None` for a reference library exposure
    pub fn stamp(&self, exposure: &Exposure, geometry: &ModelGeometry) -> Option<Stamp> {
        if exposure.is_library() {
            return None;
        }
        Some(place(
            self.library.spline(exposure.pa, exposure.wv),
            self.library.stamp_shape(),
            self.sep,
            self.pa,
            exposure,
            geometry,
            self.correction.as_deref(),
        ))
    }
}
impl SignalModel for PointSource {
    fn generate(
        &self,
        exposures: &[Exposure],
        section: &[usize],
        geometry: &ModelGeometry,
    ) -> Result<DMatrix<f64>> {
        let nx = geometry.shape.1;
        let mut models = DMatrix::<f64>::zeros(exposures.len(), section.len());
        for (i, exposure) in exposures.iter().enumerate() {
            if let Some(stamp) = self.stamp(exposure, geometry) {
                for (j, v) in stamp.section_values(section, nx).into_iter().enumerate() {
                    models[(i, j)] = v;
                }
            }
        }
        Ok(models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn gaussian_library(sigma: f64) -> Arc<PsfLibrary> {
        let psf = Array3::from_shape_fn((1, 21, 21), |(_, row, col)| {
            let (dx, dy) = (col as f64 - 10., row as f64 - 10.);
            (-(dx * dx + dy * dy) / (2. * sigma * sigma)).exp()
        });
        Arc::new(PsfLibrary::new(psf.view(), &[1.6]).unwrap())
    }

    fn geometry() -> ModelGeometry {
        ModelGeometry {
            shape: (64, 64),
            center: [32., 32.],
            ref_wv: 1.6,
            flipx: true,
        }
    }

    #[test]
    fn centroid_matches_the_source_position() {
        let (sep, pa) = (10.3, 30.);
        let source = PointSource::new(sep, pa, gaussian_library(2.));
        let all: Vec<usize> = (0..64 * 64).collect();
        let models = source
            .generate(&[Exposure::frame(0, 0., 1.6)], &all, &geometry())
            .unwrap();
        let (mut sum, mut sx, mut sy) = (0f64, 0f64, 0f64);
        for (idx, v) in all.iter().zip(models.row(0).iter()) {
            sum += v;
            sx += v * (idx % 64) as f64;
            sy += v * (idx / 64) as f64;
        }
        let (dx, dy) = source_offset(sep, pa, 0., true);
        assert!((sx / sum - 32. - dx).abs() < 0.01);
        assert!((sy / sum - 32. - dy).abs() < 0.01);
    }

    #[test]
    fn library_frames_are_blank() {
        let source = PointSource::new(8., 45., gaussian_library(2.));
        let all: Vec<usize> = (0..64 * 64).collect();
        let models = source
            .generate(
                &[Exposure::frame(0, 10., 1.6), Exposure::library(1.6)],
                &all,
                &geometry(),
            )
            .unwrap();
        assert!(models.row(0).iter().any(|v| *v > 0.5));
        assert!(models.row(1).iter().all(|v| *v == 0.));
    }

    #[test]
    fn parallactic_rotation() {
        let source = PointSource::new(10., 0., gaussian_library(1.5));
        let g = geometry();
        let north = source.stamp(&Exposure::frame(0, 0., 1.6), &g).unwrap();
        let rotated = source.stamp(&Exposure::frame(1, 90., 1.6), &g).unwrap();
        assert!((north.source[0] - 32.).abs() < 1e-9 && (north.source[1] - 42.).abs() < 1e-9);
        assert!((rotated.source[0] - 42.).abs() < 1e-9 && (rotated.source[1] - 32.).abs() < 1e-9);
    }

    #[test]
    fn wavelength_magnification() {
        let source = PointSource::new(10., 0., gaussian_library(1.5));
        let stamp = source.stamp(&Exposure::frame(0, 0., 0.8), &geometry()).unwrap();
        assert!((stamp.source[1] - 52.).abs() < 1e-9);
    }

    fn halve(
        stamp: Array2<f64>,
        _: ndarray::ArrayView2<f64>,
        _: ndarray::ArrayView2<f64>,
    ) -> Array2<f64> {
        stamp * 0.5
    }

    #[test]
    fn field_correction() {
        let plain = PointSource::new(8., 45., gaussian_library(2.));
        let corrected =
            PointSource::new(8., 45., gaussian_library(2.)).with_correction(Arc::new(halve));
        let e = Exposure::frame(0, 0., 1.6);
        let a = plain.stamp(&e, &geometry()).unwrap();
        let b = corrected.stamp(&e, &geometry()).unwrap();
        assert!(a.values.iter().zip(b.values.iter()).all(|(a, b)| (0.5 * a - b).abs() < 1e-15));
    }

    #[test]
    fn time_variable_library() {
        let psfs = ndarray::Array4::from_shape_fn((2, 1, 5, 5), |(e, _, _, _)| e as f64 + 1.);
        let library = PsfLibrary::time_variable(psfs.view(), &[1.6], &[0., 90.]).unwrap();
        assert!((library.spline(80., 1.6).eval(0., 0.) - 2.).abs() < 1e-12);
        assert!((library.spline(10., 1.6).eval(0., 0.) - 1.).abs() < 1e-12);
        assert!(PsfLibrary::time_variable(psfs.view(), &[1.6], &[0.]).is_err());
    }
}
