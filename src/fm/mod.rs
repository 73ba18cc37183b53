//! Forward models
//!
//! A [ForwardModel] propagates a signal model through the KLIP subtraction of
//! every (section, frame) unit. The driver allocates the output once, calls
//! the per unit hook from the worker pool, and finalizes the output with the
//! basis entries returned by the hooks.

use std::path::PathBuf;

use ndarray::{Array3, Array4, ArrayView4, ArrayViewD, Axis};

use crate::{
    accumulate::AccumulateError,
    basis::{BasisEntry, BasisError},
    config::ConfigError,
    dataset::{Dataset, DatasetError, Metadata},
    geometry::GeometryError,
    klip::{KlipUnit, WorkerContext},
    models::ModelError,
    perturb::PerturbError,
};

mod disk;
pub use disk::{DiskFm, DiskFmOutput};
mod extract_spec;
pub use extract_spec::{
    invert_spect_fmodel, ExtractSpec, ExtractSpecOutput, SpectrumEstimate, SpectrumSolver,
};
mod matched_filter;
pub use matched_filter::{MatchedFilter, MatchedFilterMaps};
mod psf;
pub use psf::{PlanetPsfFm, PsfBuffer, PsfFmOutput};

#[derive(thiserror::Error, Debug)]
pub enum FmError {
    #[error("unit {key} of frame #{frame} failed")]
    Unit {
        frame: usize,
        key: String,
        #[source]
        source: Box<FmError>,
    },
    #[error("the model is centered on {model:?} but the images on {images:?}")]
    CenterMismatch { model: [f64; 2], images: [f64; 2] },
    #[error("no KL basis archive loaded")]
    NoArchive,
    #[error("KL bases built with a reference library cannot be saved for replay")]
    LibraryBasis,
    #[error("the {0} solver failed: {1}")]
    Solver(SpectrumSolver, String),
    #[error("the spectral system is singular")]
    SingularSystem,
    #[error("{frames} frames cannot be split in files of {wavelengths} wavelengths")]
    Channels { frames: usize, wavelengths: usize },
    #[error("failed to build the worker pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("invalid array shape")]
    Shape(#[from] ndarray::ShapeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Perturb(#[from] PerturbError),
    #[error(transparent)]
    Accumulate(#[from] AccumulateError),
    #[error(transparent)]
    Basis(#[from] BasisError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
}
type Result<T> = std::result::Result<T, FmError>;

/// Lifecycle of a forward model run by the KLIP driver
pub trait ForwardModel: Sync {
    /// Output buffer shared by the units
    type Buffer: Sync;
    /// Finalized output
    type Output;
    /// Science products
    type Products;

    /// Allocates the output buffer, configuration errors are reported here
    fn allocate_output(&self, ctx: &WorkerContext) -> Result<Self::Buffer>;
    /// Forward models a unit into the buffer, returning the basis entry to save if any
    fn per_frame_hook(
        &self,
        ctx: &WorkerContext,
        unit: &KlipUnit,
        buffer: &Self::Buffer,
    ) -> Result<Option<BasisEntry>>;
    /// Turns the buffer into the output, KL cutoff axis first
    fn finalize(
        &self,
        ctx: &WorkerContext,
        buffer: Self::Buffer,
        entries: Vec<BasisEntry>,
    ) -> Result<Self::Output>;
    /// Collapses the output into science products saved with the dataset
    fn reduce_for_saving<D: Dataset>(
        &self,
        dataset: &D,
        output: &Self::Output,
        options: &SaveOptions,
    ) -> Result<Self::Products>;
}

/// Where and how science products are saved
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    pub outputdir: PathBuf,
    pub fileprefix: String,
    /// Reduction parameters recorded with the products
    pub klipparams: Option<String>,
    /// Flux calibration by the dataset
    pub calibrate_flux: bool,
    /// Weights of the wavelength channels in the broadband collapse
    pub spectrum: Option<Vec<f64>>,
}
impl SaveOptions {
    pub fn new<P: Into<PathBuf>, S: Into<String>>(outputdir: P, fileprefix: S) -> Self {
        Self {
            outputdir: outputdir.into(),
            fileprefix: fileprefix.into(),
            ..Default::default()
        }
    }
    pub fn klipparams<S: Into<String>>(mut self, klipparams: S) -> Self {
        self.klipparams = Some(klipparams.into());
        self
    }
    pub fn calibrate_flux(mut self, calibrate_flux: bool) -> Self {
        self.calibrate_flux = calibrate_flux;
        self
    }
    pub fn spectrum(mut self, spectrum: Vec<f64>) -> Self {
        self.spectrum = Some(spectrum);
        self
    }
    /// Saves a product as `<outputdir>/<fileprefix>-<suffix>`
    pub fn save<D: Dataset>(
        &self,
        dataset: &D,
        suffix: &str,
        data: ArrayViewD<f64>,
        metadata: Metadata,
    ) -> Result<PathBuf> {
        let path = self
            .outputdir
            .join(format!("{}-{}", self.fileprefix, suffix));
        dataset.savedata(&path, data, &metadata.klipparams(self.klipparams.clone()))?;
        Ok(path)
    }
}

/// Image cube collapsed over time and wavelength
#[derive(Debug, Clone, PartialEq)]
pub struct Reduction {
    /// `[cutoffs, y, x]`
    pub kl_cube: Array3<f64>,
    /// `[cutoffs, wavelength, y, x]` for multi-wavelength data
    pub spectral_cubes: Option<Array4<f64>>,
}

fn nan_weighted_mean(values: impl Iterator<Item = (f64, f64)>) -> f64 {
    let (sum, weight) = values
        .filter(|(v, _)| !v.is_nan())
        .fold((0f64, 0f64), |(s, w), (v, wi)| (s + v * wi, w + wi));
    if weight == 0. {
        f64::NAN
    } else {
        sum / weight
    }
}

/// Collapses a `[cutoffs, frames, y, x]` cube of files with `numwvs` wavelengths each
///
/// The spectral cubes are the NaN-aware means over the files; the broadband
/// cube is their mean over wavelength weighted by `spectrum`.
pub fn reduce_image_cube(
    cube: ArrayView4<f64>,
    numwvs: usize,
    spectrum: Option<&[f64]>,
) -> Result<Reduction> {
    let (nb, n_frame, ny, nx) = cube.dim();
    if numwvs == 0 || n_frame % numwvs != 0 {
        return Err(FmError::Channels {
            frames: n_frame,
            wavelengths: numwvs,
        });
    }
    let nfiles = n_frame / numwvs;
    let cube = cube.to_shape((nb, nfiles, numwvs, ny, nx))?;
    let spectral = Array4::from_shape_fn((nb, numwvs, ny, nx), |(b, w, y, x)| {
        nan_weighted_mean((0..nfiles).map(|f| (cube[[b, f, w, y, x]], 1.)))
    });
    let weights: Vec<f64> = match spectrum {
        Some(s) if s.len() == numwvs => s.to_vec(),
        Some(s) => {
            log::warn!(
                "{} spectrum weights for {numwvs} wavelengths, using uniform weights",
                s.len()
            );
            vec![1.; numwvs]
        }
        None => vec![1.; numwvs],
    };
    let kl_cube = Array3::from_shape_fn((nb, ny, nx), |(b, y, x)| {
        nan_weighted_mean((0..numwvs).map(|w| (spectral[[b, w, y, x]], weights[w])))
    });
    Ok(Reduction {
        kl_cube,
        spectral_cubes: (numwvs > 1).then_some(spectral),
    })
}

/// Saves the collapsed cubes of an image-space forward model
pub(crate) fn save_reduction<D: Dataset>(
    dataset: &D,
    options: &SaveOptions,
    name: &str,
    numbasis: &[usize],
    mut reduction: Reduction,
) -> Result<Reduction> {
    if options.calibrate_flux {
        let kl_cube = dataset.calibrate_output(reduction.kl_cube.into_dyn(), false);
        reduction.kl_cube = kl_cube.into_dimensionality()?;
        if let Some(cubes) = reduction.spectral_cubes.take() {
            let cubes = dataset.calibrate_output(cubes.into_dyn(), true);
            reduction.spectral_cubes = Some(cubes.into_dimensionality()?);
        }
    }
    options.save(
        dataset,
        &format!("{name}-KLmodes-all"),
        reduction.kl_cube.view().into_dyn(),
        Metadata::new("KL Mode Cube").zaxis(numbasis.to_vec()),
    )?;
    if let Some(cubes) = &reduction.spectral_cubes {
        for (n, cube) in numbasis.iter().zip(cubes.axis_iter(Axis(0))) {
            options.save(
                dataset,
                &format!("{name}-KL{n}-speccube"),
                cube.into_dyn(),
                Metadata::new("PSF Subtracted Spectral Cube"),
            )?;
        }
    }
    Ok(reduction)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapse_files_and_wavelengths() {
        // 2 cutoffs, 2 files of 3 wavelengths, 2x2 images
        let cube = Array4::from_shape_fn((2, 6, 2, 2), |(b, f, _, _)| (b * 10 + f) as f64);
        let reduction = reduce_image_cube(cube.view(), 3, None).unwrap();
        let spectral = reduction.spectral_cubes.unwrap();
        assert_eq!(spectral.dim(), (2, 3, 2, 2));
        // mean of frames w and w + 3
        assert_eq!(spectral[[1, 2, 0, 0]], (12. + 15.) / 2.);
        assert_eq!(reduction.kl_cube[[0, 1, 1]], 2.5);
    }

    #[test]
    fn nan_aware_collapse() {
        let mut cube = Array4::<f64>::ones((1, 2, 1, 1));
        cube[[0, 0, 0, 0]] = f64::NAN;
        let reduction = reduce_image_cube(cube.view(), 1, None).unwrap();
        assert!(reduction.spectral_cubes.is_none());
        assert_eq!(reduction.kl_cube[[0, 0, 0]], 1.);
        assert!(reduce_image_cube(cube.view(), 3, None).is_err());
    }

    #[test]
    fn spectrum_weights() {
        let cube = Array4::from_shape_fn((1, 2, 1, 1), |(_, f, _, _)| f as f64);
        let reduction = reduce_image_cube(cube.view(), 2, Some(&[1., 3.])).unwrap();
        assert_eq!(reduction.kl_cube[[0, 0, 0]], 0.75);
    }
}
