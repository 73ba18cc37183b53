//! Signal model generators
//!
//! A [SignalModel] renders, for a list of exposures, the flat stamp of the
//! signal over the pixels of a section: one row per exposure, one column per
//! section pixel.

use nalgebra::DMatrix;
use ndarray::{Array2, ArrayView2};

mod candidate;
pub use candidate::CandidateGrid;
mod disk;
pub use disk::DiskModel;
mod psf;
pub use psf::{PointSource, PsfLibrary, Stamp};

#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    #[error("the model has {model} wavelength channels but the data has {data} per file")]
    WavelengthMismatch { model: usize, data: usize },
    #[error("{0} PSF wavelengths for {1} PSF images")]
    PsfWavelengths(usize, usize),
    #[error("{0} PSF position angles for {1} PSF epochs")]
    PsfEpochs(usize, usize),
    #[error("the PSF library is empty")]
    EmptyLibrary,
    #[error("expected a {expected:?} image, found {found:?}")]
    ImageShape {
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("a {0}-D disk model is neither an image nor a spectral cube")]
    ModelDimension(usize),
    #[error("invalid spectrum: {0}")]
    InvalidSpectrum(String),
    #[error("frame #{0} is out of range")]
    FrameOutOfRange(usize),
    #[error("invalid model array")]
    Shape(#[from] ndarray::ShapeError),
}
type Result<T> = std::result::Result<T, ModelError>;

/// An exposure as seen by a signal model
///
/// `index` is the frame index in the exposure stack, `None` for a reference
/// library frame that carries no astrophysical signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Exposure {
    pub index: Option<usize>,
    /// Parallactic angle [deg]
    pub pa: f64,
    /// Wavelength
    pub wv: f64,
}
impl Exposure {
    pub fn frame(index: usize, pa: f64, wv: f64) -> Self {
        Self {
            index: Some(index),
            pa,
            wv,
        }
    }
    /// Reference library exposure
    pub fn library(wv: f64) -> Self {
        Self {
            index: None,
            pa: f64::NAN,
            wv,
        }
    }
    pub fn is_library(&self) -> bool {
        self.index.is_none()
    }
}

/// Geometry of the aligned images the models are rendered into
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelGeometry {
    /// Image shape `(ny, nx)`
    pub shape: (usize, usize),
    /// Alignment center `[x, y]`
    pub center: [f64; 2],
    /// Wavelength the images are scaled to
    pub ref_wv: f64,
    pub flipx: bool,
}

pub trait SignalModel: Send + Sync {
    /// Model stamps `[exposures × section pixels]`
    fn generate(
        &self,
        exposures: &[Exposure],
        section: &[usize],
        geometry: &ModelGeometry,
    ) -> Result<DMatrix<f64>>;
}

/// Field dependent throughput applied to a placed model stamp
///
/// `dx` and `dy` are the offsets [pixel] of the stamp pixels from the image center.
pub trait FieldCorrection: Send + Sync {
    fn correct(&self, stamp: Array2<f64>, dx: ArrayView2<f64>, dy: ArrayView2<f64>) -> Array2<f64>;
}
impl<F> FieldCorrection for F
where
    F: Fn(Array2<f64>, ArrayView2<f64>, ArrayView2<f64>) -> Array2<f64> + Send + Sync,
{
    fn correct(&self, stamp: Array2<f64>, dx: ArrayView2<f64>, dy: ArrayView2<f64>) -> Array2<f64> {
        self(stamp, dx, dy)
    }
}

/// Spectral template normalized to a unit mean
pub fn normalize_spectrum(spectrum: &[f64]) -> Result<Vec<f64>> {
    if spectrum.is_empty() {
        return Err(ModelError::InvalidSpectrum("empty spectrum".into()));
    }
    let mean = spectrum.iter().sum::<f64>() / spectrum.len() as f64;
    if mean == 0. || !mean.is_finite() {
        return Err(ModelError::InvalidSpectrum(format!("mean of {mean}")));
    }
    Ok(spectrum.iter().map(|s| s / mean).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_mean_spectrum() {
        let s = normalize_spectrum(&[1., 2., 3.]).unwrap();
        assert!((s.iter().sum::<f64>() / 3. - 1.).abs() < 1e-12);
        assert!(normalize_spectrum(&[1., -1.]).is_err());
        assert!(normalize_spectrum(&[]).is_err());
    }
}
