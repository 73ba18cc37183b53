use std::sync::Arc;

use nalgebra::DVector;
use ndarray::{Array2, Array4, Axis, Ix2, Ix4};

use super::{save_reduction, ForwardModel, Reduction, Result, SaveOptions};
use crate::{
    accumulate::{accumulate, SharedOutput},
    basis::BasisEntry,
    config::NanPolicy,
    dataset::Dataset,
    klip::{KlipUnit, WorkerContext},
    models::{normalize_spectrum, FieldCorrection, PointSource, PsfLibrary, SignalModel},
    perturb::{calculate_fm, perturb_spec_included, perturbation_fraction},
};

/// Forward model of a point source
///
/// The PSF of the planet at (`sep`, `pa`) is placed in every exposure with a
/// flux of `dflux` times the flux conversion and the spectrum of its
/// wavelength channel, then propagated through the KLIP subtraction of each
/// unit and derotated.
pub struct PlanetPsfFm {
    source: PointSource,
    dflux: f64,
    flux_conversion: Vec<f64>,
    spectrum: Vec<f64>,
}

/// Point source forward model
#[derive(Debug, Clone, PartialEq)]
pub struct PsfFmOutput {
    pub numbasis: Vec<usize>,
    /// `[cutoffs, frames, y, x]`
    pub fmout: Array4<f64>,
    /// Size of the perturbation relative to the noise `[frames, cutoffs]`
    pub perturbmag: Array2<f64>,
}

pub struct PsfBuffer {
    // [frames, y, x, cutoffs]
    fmout: SharedOutput,
    // [frames, cutoffs]
    perturbmag: SharedOutput,
}

impl PlanetPsfFm {
    pub fn new(sep: f64, pa: f64, dflux: f64, library: Arc<PsfLibrary>) -> Self {
        Self {
            source: PointSource::new(sep, pa, library),
            dflux,
            flux_conversion: vec![],
            spectrum: vec![],
        }
    }
    /// Conversion from contrast to data units, per wavelength channel
    pub fn flux_conversion(mut self, flux_conversion: Vec<f64>) -> Self {
        self.flux_conversion = flux_conversion;
        self
    }
    /// Spectral template of the planet, per wavelength channel
    pub fn spectrum(mut self, spectrum: &[f64]) -> Result<Self> {
        self.spectrum = normalize_spectrum(spectrum)?;
        Ok(self)
    }
    pub fn with_correction(mut self, correction: Arc<dyn FieldCorrection>) -> Self {
        self.source = self.source.with_correction(correction);
        self
    }
    /// Flux of the model in a wavelength channel
    fn flux(&self, channel: usize) -> f64 {
        let pick = |values: &[f64]| {
            if values.is_empty() {
                1.
            } else {
                values[channel % values.len()]
            }
        };
        self.dflux * pick(&self.flux_conversion) * pick(&self.spectrum)
    }
}

impl ForwardModel for PlanetPsfFm {
    type Buffer = PsfBuffer;
    type Output = PsfFmOutput;
    type Products = Reduction;

    fn allocate_output(&self, ctx: &WorkerContext) -> Result<Self::Buffer> {
        let (ny, nx) = ctx.shape();
        let (n, nb) = (ctx.n_frame(), ctx.numbasis().len());
        Ok(PsfBuffer {
            fmout: SharedOutput::zeros(&[n, ny, nx, nb], 0)?,
            perturbmag: SharedOutput::zeros(&[n, nb], 0)?,
        })
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

        let exposures = ctx.reference_exposures(unit);
        let mut models = self.source.generate(&exposures, section, &geometry)?;
        for (mut row, exposure) in models.row_iter_mut().zip(&exposures) {
            if let Some(i) = exposure.index {
                row *= self.flux(ctx.channel(i));
            }
        }
        let model_sci: DVector<f64> = self
            .source
            .generate(&[ctx.exposure(frame)], section, &geometry)?
            .row(0)
            .transpose()
            * self.flux(ctx.channel(frame));

        let perturbation = perturb_spec_included(&unit.basis, &unit.refs, &models, true)?;
        let terms = calculate_fm(
            &perturbation.delta_kl,
            &unit.basis.klmodes,
            ctx.numbasis(),
            &unit.sci,
            &model_sci,
        )?;

        let fraction = perturbation_fraction(&terms, &unit.sci, &unit.klipped);
        buffer.perturbmag.with_frame(frame, |mut row| {
            for (v, f) in row.iter_mut().zip(&fraction) {
                if *f > *v {
                    *v = *f;
                }
            }
        })?;

        let derotation = ctx.derotation(frame, &unit.section);
        let propagate = ctx.nan_policy() == NanPolicy::Propagate;
        buffer.fmout.with_frame(frame, |mut slab| -> Result<()> {
            for (c, postklip) in terms.postklip.row_iter().enumerate() {
                let stamp: Vec<f64> = postklip
                    .iter()
                    .zip(unit.sci.iter())
                    .map(|(m, s)| if propagate && s.is_nan() { f64::NAN } else { *m })
                    .collect();
                let output = slab.index_axis_mut(Axis(2), c).into_dimensionality::<Ix2>()?;
                accumulate(output, None, section, &stamp, &derotation);
            }
            Ok(())
        })??;
        Ok(None)
    }

    fn finalize(
        &self,
        ctx: &WorkerContext,
        buffer: Self::Buffer,
        _entries: Vec<BasisEntry>,
    ) -> Result<Self::Output> {
        let fmout = buffer
            .fmout
            .into_array()?
            .into_dimensionality::<Ix4>()?
            .permuted_axes([3, 0, 1, 2])
            .as_standard_layout()
            .into_owned();
        let perturbmag = buffer.perturbmag.into_array()?.into_dimensionality::<Ix2>()?;
        Ok(PsfFmOutput {
            numbasis: ctx.numbasis().to_vec(),
            fmout,
            perturbmag,
        })
    }

    fn reduce_for_saving<D: Dataset>(
        &self,
        dataset: &D,
        output: &Self::Output,
        options: &SaveOptions,
    ) -> Result<Self::Products> {
        let reduction = super::reduce_image_cube(
            output.fmout.view(),
            dataset.numwvs(),
            options.spectrum.as_deref(),
        )?;
        save_reduction(dataset, options, "fmpsf", &output.numbasis, reduction)
    }
}
