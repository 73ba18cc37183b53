use std::{path::PathBuf, sync::Arc};

use nalgebra::DVector;
use ndarray::{Array4, ArrayD, Axis, Ix4, IxDyn};

use super::{ForwardModel, Result, SaveOptions};
use crate::{
    accumulate::SharedOutput,
    basis::BasisEntry,
    dataset::{Dataset, Metadata},
    klip::{KlipUnit, WorkerContext},
    models::{normalize_spectrum, CandidateGrid, PsfLibrary},
    perturb::{calculate_fm, nan_mean, perturb_spec_included},
};

/// Forward model matched filter
///
/// Every pixel of a section is a candidate position: the forward model of a
/// planet at that position is correlated with the KLIP subtracted data of
/// each frame, for every spectral template and KL cutoff. The correlations
/// summed over the frames give the matched filter, contrast and
/// cross-correlation maps.
pub struct MatchedFilter {
    grid: CandidateGrid,
    spectra: Vec<Vec<f64>>,
    flux_conversion: Vec<f64>,
    dflux: f64,
}

/// Matched filter maps `[templates, cutoffs, y, x]`
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedFilterMaps {
    pub numbasis: Vec<usize>,
    /// `Σ⟨d,m⟩ / √Σ⟨m,m⟩`
    pub fmmf: Array4<f64>,
    /// `Σ⟨d,m⟩ / Σ⟨m,m⟩` in units of contrast
    pub contrast: Array4<f64>,
    /// `Σ⟨d,m⟩ / √(Σ⟨m,m⟩ Σ⟨d,d⟩)`
    pub cc: Array4<f64>,
}

// correlation products accumulated per pixel
const DOT: usize = 0;
const MODEL_POWER: usize = 1;
const DATA_POWER: usize = 2;

impl MatchedFilter {
    /// Contrast of the trial planets the perturbation is computed for
    pub const TRIAL_CONTRAST: f64 = 1e-5;

    /// Matched filter with the PSFs of `library` normalized to a unit peak
    pub fn new(library: Arc<PsfLibrary>) -> Self {
        Self {
            grid: CandidateGrid::new(library),
            spectra: vec![vec![]],
            flux_conversion: vec![],
            dflux: Self::TRIAL_CONTRAST,
        }
    }
    /// Spectral templates, one value per wavelength channel
    pub fn spectra(mut self, spectra: &[Vec<f64>]) -> Result<Self> {
        self.spectra = spectra
            .iter()
            .map(|s| normalize_spectrum(s))
            .collect::<std::result::Result<_, _>>()?;
        Ok(self)
    }
    /// Conversion from contrast to data units, per wavelength channel
    pub fn flux_conversion(mut self, flux_conversion: Vec<f64>) -> Self {
        self.flux_conversion = flux_conversion;
        self
    }
    pub fn trial_contrast(mut self, dflux: f64) -> Self {
        self.dflux = dflux;
        self
    }
    /// Radius of the PSF core left out of the local sky estimate
    pub fn core_radius(mut self, radius: f64) -> Self {
        self.grid = self.grid.core_radius(radius);
        self
    }
    fn flux(&self, template: usize, channel: usize) -> f64 {
        let pick = |values: &[f64]| {
            if values.is_empty() {
                1.
            } else {
                values[channel % values.len()]
            }
        };
        self.dflux * pick(&self.flux_conversion) * pick(&self.spectra[template])
    }
}

impl ForwardModel for MatchedFilter {
    type Buffer = SharedOutput;
    type Output = MatchedFilterMaps;
    type Products = Vec<PathBuf>;

    fn allocate_output(&self, ctx: &WorkerContext) -> Result<Self::Buffer> {
        let (ny, nx) = ctx.shape();
        Ok(SharedOutput::zeros(
            &[3, self.spectra.len(), ctx.numbasis().len(), ctx.n_frame(), ny, nx],
            3,
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
        let ref_exposures = ctx.reference_exposures(unit);
        let sci_exposure = ctx.exposure(frame);
        let candidates = unit.section.bounds.candidates(
            ctx.shape(),
            ctx.aligned_center(),
            ctx.pas()[frame],
            ctx.flipx(),
        );
        log::debug!(
            "frame #{frame} section {}: {} candidates",
            unit.key(),
            candidates.len()
        );

        let mut products = vec![];
        for (row, col, sep, pa) in candidates {
            let ref_models = self
                .grid
                .models(sep, pa, &ref_exposures, section, &geometry)?;
            let (footprint, mask) = self
                .grid
                .footprint(sep, pa, &sci_exposure, section, &geometry);
            for t in 0..self.spectra.len() {
                let mut models = ref_models.clone();
                for (mut m, exposure) in models.row_iter_mut().zip(&ref_exposures) {
                    if let Some(i) = exposure.index {
                        m *= self.flux(t, ctx.channel(i));
                    }
                }
                let model_sci =
                    DVector::from_column_slice(&footprint) * self.flux(t, ctx.channel(frame));
                let delta_kl =
                    perturb_spec_included(&unit.basis, &unit.refs, &models, false)?.delta_kl;
                let terms = calculate_fm(
                    &delta_kl,
                    &unit.basis.klmodes,
                    ctx.numbasis(),
                    &unit.sci,
                    &model_sci,
                )?;
                for (c, data) in unit.klipped.column_iter().enumerate() {
                    let sky = nan_mean(
                        data.iter()
                            .zip(&mask)
                            .filter(|(_, m)| **m == 2)
                            .map(|(d, _)| *d),
                    );
                    let mut correlation = [0f64; 3];
                    for (j, d) in data.iter().enumerate() {
                        if mask[j] == 0 || d.is_nan() {
                            continue;
                        }
                        let (d, m) = (d - sky, terms.postklip[(c, j)]);
                        correlation[DOT] += d * m;
                        correlation[MODEL_POWER] += m * m;
                        correlation[DATA_POWER] += d * d;
                    }
                    products.push((t, c, row, col, correlation));
                }
            }
        }

        buffer.with_frame(frame, |mut slab| {
            for (t, c, row, col, correlation) in products {
                for (k, v) in correlation.into_iter().enumerate() {
                    slab[IxDyn(&[k, t, c, row, col])] += v;
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
        // [3, templates, cutoffs, y, x]
        let sums = buffer.into_array()?.sum_axis(Axis(3));
        let dot = sums.index_axis(Axis(0), DOT);
        let model_power = sums.index_axis(Axis(0), MODEL_POWER);
        let data_power = sums.index_axis(Axis(0), DATA_POWER);
        let zero_power = model_power
            .iter()
            .zip(data_power.iter())
            .filter(|(m, d)| **m == 0. && **d > 0.)
            .count();
        if zero_power > 0 {
            log::warn!("{zero_power} matched filter pixels with a zero power model are set to NaN");
        }
        let map = |f: &dyn Fn(f64, f64, f64) -> f64| -> Result<Array4<f64>> {
            let values: Vec<f64> = dot
                .iter()
                .zip(model_power.iter())
                .zip(data_power.iter())
                .map(|((d, m), p)| if *m == 0. { f64::NAN } else { f(*d, *m, *p) })
                .collect();
            Ok(ArrayD::from_shape_vec(dot.raw_dim(), values)?.into_dimensionality::<Ix4>()?)
        };
        let dflux = self.dflux;
        Ok(MatchedFilterMaps {
            numbasis: ctx.numbasis().to_vec(),
            fmmf: map(&|d, m, _| d / m.sqrt())?,
            contrast: map(&|d, m, _| dflux * d / m)?,
            cc: map(&|d, m, p| d / (m * p).sqrt())?,
        })
    }

    fn reduce_for_saving<D: Dataset>(
        &self,
        dataset: &D,
        output: &Self::Output,
        options: &SaveOptions,
    ) -> Result<Self::Products> {
        [
            ("FMMF", &output.fmmf, "Matched Filter Map"),
            ("FMCont", &output.contrast, "Contrast Map"),
            ("FMCC", &output.cc, "Cross Correlation Map"),
        ]
        .into_iter()
        .map(|(name, map, filetype)| {
            let metadata = Metadata::new(filetype).zaxis(output.numbasis.clone());
            let suffix = format!("{name}-KLmodes-all");
            if map.dim().0 == 1 {
                options.save(dataset, &suffix, map.index_axis(Axis(0), 0).into_dyn(), metadata)
            } else {
                options.save(dataset, &suffix, map.view().into_dyn(), metadata)
            }
        })
        .collect()
    }
}
