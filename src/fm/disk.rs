use std::path::{Path, PathBuf};

use nalgebra::DVector;
use ndarray::{Array4, ArrayD, ArrayViewD, Axis, Ix2, Ix4, IxDyn};

use super::{save_reduction, FmError, ForwardModel, Reduction, Result, SaveOptions};
use crate::{
    accumulate::{accumulate, SharedOutput},
    basis::{BasisArchive, BasisEntry, BasisFormat},
    config::{KlipConfig, NanPolicy},
    dataset::Dataset,
    klip::{replay_parallelized, KlipUnit, WorkerContext},
    models::{DiskModel, SignalModel},
    perturb::{calculate_fm, perturb_spec_included},
};

/// Forward model of an extended disk image
///
/// The KL bases of a first pass can be saved and replayed for any number of
/// disk models, running the forward model step only.
pub struct DiskFm {
    model: DiskModel,
    center: [f64; 2],
    save_basis: Option<PathBuf>,
    archive: Option<BasisArchive>,
}

/// Disk forward model `[cutoffs, frames, y, x]`
#[derive(Debug, Clone, PartialEq)]
pub struct DiskFmOutput {
    pub numbasis: Vec<usize>,
    pub fmout: Array4<f64>,
}

impl DiskFm {
    /// Disk forward model of `model` (`[y, x]` or `[wavelength, y, x]`) for images aligned
    /// on `aligned_center`
    pub fn new<D: Dataset>(
        dataset: &D,
        model: ArrayViewD<f64>,
        aligned_center: [f64; 2],
    ) -> Result<Self> {
        Ok(Self {
            model: DiskModel::new(
                model,
                dataset.pas(),
                dataset.numwvs(),
                dataset.shape(),
                aligned_center,
            )?,
            center: aligned_center,
            save_basis: None,
            archive: None,
        })
    }
    /// Saves the KL bases of the run to `path` (`.npz` or `.pkl`)
    pub fn save_basis<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        let path = path.as_ref();
        BasisFormat::from_path(path)?;
        self.save_basis = Some(path.to_path_buf());
        Ok(self)
    }
    /// Disk forward model replaying the KL bases saved at `path`
    ///
    /// The model is rotated about the center the bases were computed for.
    pub fn from_basis<D: Dataset, P: AsRef<Path>>(
        dataset: &D,
        model: ArrayViewD<f64>,
        path: P,
    ) -> Result<Self> {
        let archive = BasisArchive::load(path)?;
        let mut this = Self::new(dataset, model, archive.params.aligned_center)?;
        this.archive = Some(archive);
        Ok(this)
    }
    /// Replaces the disk model, keeping the center
    pub fn update_disk<D: Dataset>(&mut self, dataset: &D, model: ArrayViewD<f64>) -> Result<()> {
        self.model = DiskModel::new(
            model,
            dataset.pas(),
            dataset.numwvs(),
            dataset.shape(),
            self.center,
        )?;
        Ok(())
    }
    pub fn model(&self) -> &DiskModel {
        &self.model
    }
    /// `base` with the working angles and the center of the loaded bases
    pub fn replay_config(&self, base: KlipConfig) -> Result<KlipConfig> {
        let params = self.archive.as_ref().ok_or(FmError::NoArchive)?.params;
        Ok(base
            .iwa(params.iwa)
            .owa(params.owa)
            .aligned_center(params.aligned_center))
    }
    /// Replays the loaded KL bases on the current disk model
    ///
    /// The output is collapsed over files: `[cutoffs, wavelength, y, x]` for a
    /// multi-wavelength model, the mean over frames `[cutoffs, y, x]` otherwise.
    pub fn fm_parallelized(&self, ctx: &WorkerContext) -> Result<ArrayD<f64>> {
        let archive = self.archive.as_ref().ok_or(FmError::NoArchive)?;
        archive.params.check(&ctx.klip_params())?;
        let output = replay_parallelized(self, ctx, archive.entries.values())?;
        collapse(output.fmout, self.model.channels())
    }
}

// Collapses a [cutoffs, frames, y, x] cube over the files
fn collapse(fmout: Array4<f64>, channels: usize) -> Result<ArrayD<f64>> {
    let (nb, n, ny, nx) = fmout.dim();
    let nan_sum = |values: &mut dyn Iterator<Item = f64>| {
        values.filter(|v| !v.is_nan()).fold((0f64, 0usize), |(s, k), v| (s + v, k + 1))
    };
    if channels > 1 {
        let nfiles = n / channels;
        let cube = fmout.into_shape((nb, nfiles, channels, ny, nx))?;
        Ok(ArrayD::from_shape_fn(IxDyn(&[nb, channels, ny, nx]), |idx| {
            let (b, w, y, x) = (idx[0], idx[1], idx[2], idx[3]);
            let (sum, _) = nan_sum(&mut (0..nfiles).map(|f| cube[[b, f, w, y, x]]));
            sum / nfiles as f64
        }))
    } else {
        Ok(ArrayD::from_shape_fn(IxDyn(&[nb, ny, nx]), |idx| {
            let (b, y, x) = (idx[0], idx[1], idx[2]);
            match nan_sum(&mut (0..n).map(|i| fmout[[b, i, y, x]])) {
                (_, 0) => f64::NAN,
                (sum, k) => sum / k as f64,
            }
        }))
    }
}

impl ForwardModel for DiskFm {
    type Buffer = SharedOutput;
    type Output = DiskFmOutput;
    type Products = Reduction;

    fn allocate_output(&self, ctx: &WorkerContext) -> Result<Self::Buffer> {
        if ctx.aligned_center() != self.center {
            return Err(FmError::CenterMismatch {
                model: self.center,
                images: ctx.aligned_center(),
            });
        }
        let (ny, nx) = ctx.shape();
        Ok(SharedOutput::zeros(
            &[ctx.n_frame(), ny, nx, ctx.numbasis().len()],
            0,
        )?)
    }

    fn per_frame_hook(
        &self,
        ctx: &WorkerContext,
        unit: &KlipUnit,
        buffer: &Self::Buffer,
    ) -> Result<Option<BasisEntry>> {
        if self.save_basis.is_some() && unit.n_library() > 0 {
            return Err(FmError::LibraryBasis);
        }
        let frame = unit.frame;
        let section = &unit.section.indices;
        let geometry = ctx.model_geometry(frame);
        let models = self
            .model
            .generate(&ctx.reference_exposures(unit), section, &geometry)?;
        let model_sci: DVector<f64> = self
            .model
            .generate(&[ctx.exposure(frame)], section, &geometry)?
            .row(0)
            .transpose();
        let perturbation = perturb_spec_included(&unit.basis, &unit.refs, &models, false)?;
        let terms = calculate_fm(
            &perturbation.delta_kl,
            &unit.basis.klmodes,
            ctx.numbasis(),
            &unit.sci,
            &model_sci,
        )?;
        let derotation = ctx.derotation(frame, &unit.section);
        let propagate = ctx.nan_policy() == NanPolicy::Propagate;
        buffer.with_frame(frame, |mut slab| -> Result<()> {
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
        Ok(self.save_basis.is_some().then(|| unit.entry()))
    }

    fn finalize(
        &self,
        ctx: &WorkerContext,
        buffer: Self::Buffer,
        entries: Vec<BasisEntry>,
    ) -> Result<Self::Output> {
        if let Some(path) = &self.save_basis {
            let mut archive = BasisArchive::new(ctx.klip_params());
            entries.into_iter().for_each(|entry| archive.insert(entry));
            archive.save(path)?;
        }
        let fmout = buffer
            .into_array()?
            .into_dimensionality::<Ix4>()?
            .permuted_axes([3, 0, 1, 2])
            .as_standard_layout()
            .into_owned();
        Ok(DiskFmOutput {
            numbasis: ctx.numbasis().to_vec(),
            fmout,
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
        save_reduction(dataset, options, "diskfm", &output.numbasis, reduction)
    }
}
