use std::{collections::HashSet, sync::Arc};

use nalgebra::{DMatrix, DVector};
use ndarray::{Array2, Array3, Array4, ArrayView4, Axis, Ix4};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use super::{FmError, ForwardModel, Result, SaveOptions};
use crate::{
    accumulate::SharedOutput,
    basis::BasisEntry,
    dataset::{Dataset, Metadata},
    klip::{KlipUnit, WorkerContext},
    models::{FieldCorrection, PointSource, PsfLibrary, SignalModel},
    perturb::{calculate_fm_per_reference, perturb_per_reference},
};

/// Linear solvers of the spectral extraction
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumIter,
    EnumString,
    Display,
)]
pub enum SpectrumSolver {
    /// Pseudo-inverse of the system coadded over the files
    #[default]
    #[strum(to_string = "JB")]
    Pinv,
    /// Normal equations restricted to the diagonal wavelength blocks
    #[strum(to_string = "LP")]
    NormalEquations,
    /// Least squares solution of the coadded system
    #[strum(to_string = "leastsq")]
    LeastSquares,
}

/// Forward model for the extraction of the spectrum of a point source
///
/// For each frame, the KLIP subtracted stamp around the planet is kept next
/// to the contribution of the planet flux in every frame of the dataset:
/// the frame itself (model minus oversubtraction) and each of its
/// references (self-subtraction). The spectrum follows from the linear
/// system `FM · spectrum = klipped`.
pub struct ExtractSpec {
    source: PointSource,
    stamp_size: usize,
    solver: SpectrumSolver,
    scaling: f64,
}

/// Spectral extraction forward model
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractSpecOutput {
    pub numbasis: Vec<usize>,
    /// `[cutoffs, frames, frames + 1, stamp pixels]`, the last row of the
    /// third axis is the KLIP subtracted data
    pub fmout: Array4<f64>,
}

/// Spectrum solution per KL cutoff
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumEstimate {
    /// `[cutoffs, wavelengths]`
    pub spectrum: Array2<f64>,
    /// Forward model matrix coadded over files `[cutoffs, wavelengths * stamp pixels, wavelengths]`
    pub fm_matrix: Array3<f64>,
}

impl ExtractSpec {
    /// Spectrum extraction of the planet at (`sep`, `pa`) in square stamps of `stamp_size` pixels
    pub fn new(sep: f64, pa: f64, library: Arc<PsfLibrary>, stamp_size: usize) -> Self {
        Self {
            source: PointSource::new(sep, pa, library),
            stamp_size,
            solver: SpectrumSolver::default(),
            scaling: 1.,
        }
    }
    pub fn solver(mut self, solver: SpectrumSolver) -> Self {
        self.solver = solver;
        self
    }
    /// Calibration factor multiplying the spectrum
    pub fn scaling(mut self, scaling: f64) -> Self {
        self.scaling = scaling;
        self
    }
    pub fn with_correction(mut self, correction: Arc<dyn FieldCorrection>) -> Self {
        self.source = self.source.with_correction(correction);
        self
    }
}

impl ForwardModel for ExtractSpec {
    type Buffer = SharedOutput;
    type Output = ExtractSpecOutput;
    type Products = SpectrumEstimate;

    fn allocate_output(&self, ctx: &WorkerContext) -> Result<Self::Buffer> {
        let n = ctx.n_frame();
        Ok(SharedOutput::zeros(
            &[ctx.numbasis().len(), n, n + 1, self.stamp_size * self.stamp_size],
            1,
        )?)
    }

    fn per_frame_hook(
        &self,
        ctx: &WorkerContext,
        unit: &KlipUnit,
        buffer: &Self::Buffer,
    ) -> Result<Option<BasisEntry>> {
        let frame = unit.frame;
        let section = &unit.section.indices;
        let geometry = ctx.model_geometry(frame);
        let exposure = ctx.exposure(frame);
        let Some(stamp) = self.source.stamp(&exposure, &geometry) else {
            return Ok(None);
        };

        // section pixels inside the planet stamp, padding excluded
        let (ny, nx) = ctx.shape();
        let owned: HashSet<usize> = unit
            .section
            .bounds
            .pixels((ny, nx), ctx.aligned_center(), 0., 0., ctx.angles(), ctx.flipx())
            .into_iter()
            .collect();
        let size = self.stamp_size as isize;
        let [sx, sy] = stamp.source;
        let col0 = sx.round_ties_even() as isize - size / 2;
        let row0 = sy.round_ties_even() as isize - size / 2;
        let positions: Vec<(usize, usize)> = section
            .iter()
            .enumerate()
            .filter(|(_, idx)| owned.contains(*idx))
            .filter_map(|(j, &idx)| {
                let (r, c) = ((idx / nx) as isize - row0, (idx % nx) as isize - col0);
                (r >= 0 && c >= 0 && r < size && c < size).then_some((j, (r * size + c) as usize))
            })
            .collect();
        if positions.is_empty() {
            return Ok(None);
        }

        let models = self
            .source
            .generate(&ctx.reference_exposures(unit), section, &geometry)?;
        let model_sci = DVector::from_iterator(section.len(), stamp.section_values(section, nx));
        let delta_kls = perturb_per_reference(&unit.basis, &unit.refs, &models)?;
        let terms = calculate_fm_per_reference(
            &delta_kls,
            &unit.basis.klmodes,
            ctx.numbasis(),
            &unit.sci,
            &model_sci,
        )?;

        let n = ctx.n_frame();
        buffer.with_frame(frame, |mut slab| {
            for c in 0..ctx.numbasis().len() {
                for &(j, px) in &positions {
                    slab[[c, frame, px].as_slice()] = model_sci[j] - terms.oversubtraction[(c, j)];
                    for (r, &i) in unit.ref_indices.iter().enumerate() {
                        slab[[c, i, px].as_slice()] = -terms.selfsubtraction[r][(c, j)];
                    }
                    slab[[c, n, px].as_slice()] = unit.klipped[(j, c)];
                }
            }
        })?;
        Ok(None)
    }

    fn finalize(
        &self,
        ctx: &WorkerContext,
        buffer: Self::Buffer,
        _entries: Vec<BasisEntry>,
    ) -> Result<Self::Output> {
        Ok(ExtractSpecOutput {
            numbasis: ctx.numbasis().to_vec(),
            fmout: buffer.into_array()?.into_dimensionality::<Ix4>()?,
        })
    }

    fn reduce_for_saving<D: Dataset>(
        &self,
        dataset: &D,
        output: &Self::Output,
        options: &SaveOptions,
    ) -> Result<Self::Products> {
        let estimate = invert_spect_fmodel(
            output.fmout.view(),
            dataset.numwvs(),
            self.solver,
            self.scaling,
        )?;
        let zaxis = output.numbasis.clone();
        options.save(
            dataset,
            "spectrum",
            estimate.spectrum.view().into_dyn(),
            Metadata::new("Spectrum")
                .zaxis(zaxis.clone())
                .keyword("scaling", self.scaling),
        )?;
        options.save(
            dataset,
            "fm-matrix",
            estimate.fm_matrix.view().into_dyn(),
            Metadata::new("Spectral Forward Model").zaxis(zaxis),
        )?;
        Ok(estimate)
    }
}

/// Solves `FM · spectrum = klipped` for every KL cutoff of a
/// `[cutoffs, frames, frames + 1, pixels]` forward model
///
/// Frames are coadded over the files of `numwvs` wavelengths. Pixels where
/// the data or the forward model is NaN are left out of the system. The
/// spectrum is multiplied by `scaling` and the coadded forward model divided
/// by it.
pub fn invert_spect_fmodel(
    fmout: ArrayView4<f64>,
    numwvs: usize,
    solver: SpectrumSolver,
    scaling: f64,
) -> Result<SpectrumEstimate> {
    let (nb, n, n_rows, npix) = fmout.dim();
    let nl = numwvs;
    if nl == 0 || n % nl != 0 || n_rows != n + 1 {
        return Err(FmError::Channels {
            frames: n,
            wavelengths: nl,
        });
    }
    let mut spectrum = Array2::<f64>::zeros((nb, nl));
    let mut fm_matrix = Array3::<f64>::zeros((nb, nl * npix, nl));
    for (b, fm) in fmout.axis_iter(Axis(0)).enumerate() {
        let mut coadd = DMatrix::<f64>::zeros(nl * npix, nl);
        let mut klipped = DVector::<f64>::zeros(nl * npix);
        for i in 0..n {
            let wi = i % nl;
            for px in 0..npix {
                klipped[wi * npix + px] += fm[[i, n, px]];
                for j in 0..n {
                    coadd[(wi * npix + px, j % nl)] += fm[[i, j, px]];
                }
            }
        }
        let valid: Vec<bool> = (0..nl * npix)
            .map(|row| klipped[row].is_finite() && coadd.row(row).iter().all(|v| v.is_finite()))
            .collect();
        let rows: Vec<usize> = (0..nl * npix).filter(|row| valid[*row]).collect();
        let a = coadd.select_rows(&rows);
        let y = klipped.select_rows(&rows);
        let solution = match solver {
            SpectrumSolver::Pinv => {
                let pinv = a
                    .pseudo_inverse(f64::EPSILON)
                    .map_err(|e| FmError::Solver(solver, e.to_string()))?;
                pinv * &y
            }
            SpectrumSolver::LeastSquares => a
                .svd(true, true)
                .solve(&y, f64::EPSILON)
                .map_err(|e| FmError::Solver(solver, e.to_string()))?,
            SpectrumSolver::NormalEquations => {
                let mut lhs = DMatrix::<f64>::zeros(nl, nl);
                let mut rhs = DVector::<f64>::zeros(nl);
                for q in 0..nl {
                    for px in 0..npix {
                        let row = q * npix + px;
                        if !valid[row] {
                            continue;
                        }
                        let diagonal = coadd[(row, q)];
                        rhs[q] += diagonal * klipped[row];
                        for w in 0..nl {
                            if valid[w * npix + px] {
                                lhs[(q, w)] += diagonal * coadd[(w * npix + px, q)];
                            }
                        }
                    }
                }
                lhs.try_inverse().ok_or(FmError::SingularSystem)? * rhs
            }
        };
        for (w, s) in solution.iter().enumerate() {
            spectrum[[b, w]] = s * scaling;
        }
        for ((row, w), v) in fm_matrix.index_axis_mut(Axis(0), b).indexed_iter_mut() {
            *v = coadd[(row, w)] / scaling;
        }
    }
    Ok(SpectrumEstimate {
        spectrum,
        fm_matrix,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    // identity forward model of 1 file with the spectrum in the data row
    fn identity_system(spectrum: &[f64]) -> Array4<f64> {
        let nl = spectrum.len();
        let mut fmout = Array4::<f64>::zeros((2, nl, nl + 1, 1));
        for b in 0..2 {
            for i in 0..nl {
                fmout[[b, i, i, 0]] = 1.;
                fmout[[b, i, nl, 0]] = spectrum[i];
            }
        }
        fmout
    }

    #[test]
    fn identity_round_trip() {
        let spectrum = [1.5, 0.7, 2.2, 0.1];
        let fmout = identity_system(&spectrum);
        for solver in SpectrumSolver::iter() {
            let estimate = invert_spect_fmodel(fmout.view(), 4, solver, 1.).unwrap();
            for b in 0..2 {
                for (w, s) in spectrum.iter().enumerate() {
                    assert!((estimate.spectrum[[b, w]] - s).abs() < 1e-9, "{solver}");
                }
            }
            assert_eq!(estimate.fm_matrix.dim(), (2, 4, 4));
        }
    }

    #[test]
    fn scaled_spectrum() {
        let fmout = identity_system(&[1., 2.]);
        let estimate = invert_spect_fmodel(fmout.view(), 2, SpectrumSolver::Pinv, 10.).unwrap();
        assert!((estimate.spectrum[[0, 1]] - 20.).abs() < 1e-9);
        assert!((estimate.fm_matrix[[0, 1, 1]] - 0.1).abs() < 1e-12);
    }

    #[test]
    fn coadded_files() {
        // 2 files of 2 wavelengths, a planet of spectrum [3, 5] seen with a throughput of 0.5
        let spectrum = [3., 5.];
        let mut fmout = Array4::<f64>::zeros((1, 4, 5, 2));
        for i in 0..4 {
            for px in 0..2 {
                fmout[[0, i, i, px]] = 0.5;
                fmout[[0, i, 4, px]] = 0.5 * spectrum[i % 2];
            }
        }
        fmout[[0, 3, 4, 1]] = f64::NAN;
        let estimate =
            invert_spect_fmodel(fmout.view(), 2, SpectrumSolver::LeastSquares, 1.).unwrap();
        assert!((estimate.spectrum[[0, 0]] - 3.).abs() < 1e-9);
        assert!((estimate.spectrum[[0, 1]] - 5.).abs() < 1e-9);
    }

    #[test]
    fn solver_names() {
        assert_eq!("LP".parse::<SpectrumSolver>().unwrap(), SpectrumSolver::NormalEquations);
        assert_eq!(SpectrumSolver::LeastSquares.to_string(), "leastsq");
        let fmout = Array4::zeros((1, 3, 4, 1));
        assert!(invert_spect_fmodel(fmout.view(), 2, SpectrumSolver::Pinv, 1.).is_err());
    }
}
