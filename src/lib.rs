//! # KLIP forward modeling
//!
//! Propagation of astrophysical signal models (point sources, disks,
//! spectral templates) through the KLIP PSF subtraction of high-contrast
//! image sequences, using a first order perturbation of the KL basis instead
//! of a new eigen-decomposition for every model.
//!
//! A reduction starts from a [Dataset] and a [KlipConfig]: the
//! [WorkerContext] aligns the exposures once, then [klip_parallelized] runs a
//! [ForwardModel] over every (section, frame) unit:
//!
//! ```no_run
//! use std::sync::Arc;
//! use klip_fm::{
//!     klip_parallelized, EigenbasisEngine, Exposures, KlipConfig, PlanetPsfFm, PsfLibrary,
//!     WorkerContext,
//! };
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let (input, psf) = (ndarray::Array3::zeros((4, 64, 64)), ndarray::Array3::zeros((1, 15, 15)));
//! let dataset = Exposures::broadband(input, [32., 32.], vec![0., 10., 20., 30.], 1.6)?;
//! let config = KlipConfig::from_env()?.iwa(5.).annuli(3).numbasis(vec![1, 3]);
//! let ctx = WorkerContext::prepare(&dataset, &config)?;
//! let library = Arc::new(PsfLibrary::new(psf.view(), &[1.6])?);
//! let fm = PlanetPsfFm::new(12., 45., 1e-4, library);
//! let output = klip_parallelized(&fm, &EigenbasisEngine::new(), &ctx)?;
//! # Ok(())
//! # }
//! ```

pub mod accumulate;
pub mod basis;
pub mod config;
pub mod dataset;
mod error;
pub mod fm;
pub mod geometry;
pub mod interp;
pub mod klip;
pub mod models;
pub mod perturb;

pub use basis::{BasisArchive, BasisEntry, BasisFormat, KlipParams};
pub use config::{AnnulusSpacing, KlipConfig, NanPolicy};
pub use dataset::{Dataset, Exposures, Metadata};
pub use error::{Error, Result};
pub use fm::{
    invert_spect_fmodel, DiskFm, ExtractSpec, FmError, ForwardModel, MatchedFilter, PlanetPsfFm,
    SaveOptions, SpectrumSolver,
};
pub use geometry::{Section, SectionBounds, WorkingAngles};
pub use klip::{klip_parallelized, run_units, EigenbasisEngine, KlipEngine, KlipUnit, WorkerContext};
pub use models::{CandidateGrid, DiskModel, FieldCorrection, PointSource, PsfLibrary, SignalModel};
pub use perturb::Eigenbasis;
