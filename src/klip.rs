//! KLIP driver
//!
//! The [WorkerContext] is built once per reduction: it owns the worker pool
//! and the exposures realigned and rescaled to every wavelength of the
//! dataset. The work is split in (section, target frame) units; a
//! [KlipEngine] produces the unperturbed KL basis of a unit and the
//! [ForwardModel] hook is called on it right after.

use std::{sync::Arc, time::Instant};

use indicatif::{ParallelProgressIterator, ProgressBar};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array2, Array3, Axis};
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};

use crate::{
    accumulate::Derotation,
    basis::{BasisEntry, KlipParams},
    config::{KlipConfig, NanPolicy},
    dataset::Dataset,
    fm::{FmError, ForwardModel},
    geometry::{self, Section, WorkingAngles},
    interp::align_and_scale,
    models::{Exposure, ModelGeometry},
    perturb::Eigenbasis,
};

type Result<T> = std::result::Result<T, FmError>;

/// Shared, read-only state of a reduction handed to every unit
#[derive(Clone)]
pub struct WorkerContext {
    pool: Arc<ThreadPool>,
    config: KlipConfig,
    shape: (usize, usize),
    // one [frame, y, x] stack per unique wavelength
    aligned: Arc<Vec<Array3<f64>>>,
    unique_wvs: Vec<f64>,
    pas: Vec<f64>,
    wvs: Vec<f64>,
    filenums: Vec<usize>,
    aligned_center: [f64; 2],
    angles: WorkingAngles,
}
impl WorkerContext {
    /// Builds the worker pool and aligns the exposures of `dataset`
    ///
    /// Every exposure is moved to the common center and rescaled to each
    /// wavelength of the dataset; all the alignments complete before this
    /// returns.
    pub fn prepare<D: Dataset>(dataset: &D, config: &KlipConfig) -> Result<Self> {
        config.validate()?;
        let shape = dataset.shape();
        let (ny, nx) = shape;
        let aligned_center = config
            .aligned_center
            .unwrap_or([(nx / 2) as f64, (ny / 2) as f64]);
        let angles =
            WorkingAngles::new(config.iwa, config.outer_working_angle(shape, aligned_center));
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.threads())
            .build()?;
        let unique_wvs = dataset.unique_wvs();
        let input = dataset.input();
        let (centers, wvs) = (dataset.centers(), dataset.wvs());

        let now = Instant::now();
        log::info!(
            "Aligning {} frames on {:?} at {} wavelengths...",
            dataset.n_frame(),
            aligned_center,
            unique_wvs.len()
        );
        let aligned = unique_wvs
            .iter()
            .map(|&wv| {
                let frames: Vec<Array2<f64>> = pool.install(|| {
                    (0..dataset.n_frame())
                        .into_par_iter()
                        .map(|i| {
                            align_and_scale(
                                input.index_axis(Axis(0), i),
                                aligned_center,
                                centers[i],
                                wv / wvs[i],
                            )
                        })
                        .collect()
                });
                let views: Vec<_> = frames.iter().map(|f| f.view()).collect();
                ndarray::stack(Axis(0), &views)
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        log::info!("... aligned in {:}s", now.elapsed().as_secs());

        Ok(Self {
            pool: Arc::new(pool),
            config: config.clone(),
            shape,
            aligned: Arc::new(aligned),
            unique_wvs,
            pas: dataset.pas().to_vec(),
            wvs: wvs.to_vec(),
            filenums: dataset.filenums().to_vec(),
            aligned_center,
            angles,
        })
    }
    pub fn config(&self) -> &KlipConfig {
        &self.config
    }
    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }
    /// Image shape `(ny, nx)`
    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }
    pub fn n_frame(&self) -> usize {
        self.pas.len()
    }
    pub fn pas(&self) -> &[f64] {
        &self.pas
    }
    pub fn wvs(&self) -> &[f64] {
        &self.wvs
    }
    pub fn unique_wvs(&self) -> &[f64] {
        &self.unique_wvs
    }
    pub fn filenums(&self) -> &[usize] {
        &self.filenums
    }
    pub fn aligned_center(&self) -> [f64; 2] {
        self.aligned_center
    }
    pub fn angles(&self) -> WorkingAngles {
        self.angles
    }
    pub fn numbasis(&self) -> &[usize] {
        &self.config.numbasis
    }
    pub fn nan_policy(&self) -> NanPolicy {
        self.config.nan_policy
    }
    pub fn flipx(&self) -> bool {
        self.config.flipx
    }
    /// Parameters a saved KL basis is valid for
    pub fn klip_params(&self) -> KlipParams {
        KlipParams {
            iwa: self.angles.inner,
            owa: self.angles.outer,
            aligned_center: self.aligned_center,
        }
    }
    /// Wavelength channel of a frame
    pub fn channel(&self, frame: usize) -> usize {
        let wv = self.wvs[frame];
        self.unique_wvs
            .iter()
            .position(|u| *u == wv)
            .unwrap_or_default()
    }
    /// Aligned exposures `[frame, y, x]` scaled to the wavelength of `frame`
    pub fn aligned(&self, frame: usize) -> &Array3<f64> {
        &self.aligned[self.channel(frame)]
    }
    /// Science stamp of `frame` over the section pixels
    pub fn science(&self, frame: usize, section: &[usize]) -> DVector<f64> {
        let nx = self.shape.1;
        let image = self.aligned(frame).index_axis(Axis(0), frame);
        DVector::from_iterator(
            section.len(),
            section.iter().map(|&idx| image[[idx / nx, idx % nx]]),
        )
    }
    /// Reference stamps `[references × section pixels]` scaled to the wavelength of `frame`
    pub fn references(
        &self,
        frame: usize,
        ref_indices: &[usize],
        section: &[usize],
    ) -> DMatrix<f64> {
        let nx = self.shape.1;
        let stack = self.aligned(frame);
        DMatrix::from_fn(ref_indices.len(), section.len(), |i, j| {
            let idx = section[j];
            stack[[ref_indices[i], idx / nx, idx % nx]]
        })
    }
    pub fn exposure(&self, frame: usize) -> Exposure {
        Exposure::frame(frame, self.pas[frame], self.wvs[frame])
    }
    /// Exposures of the reference rows of a unit, library rows last
    pub fn reference_exposures(&self, unit: &KlipUnit) -> Vec<Exposure> {
        let wv = self.wvs[unit.frame];
        unit.ref_indices
            .iter()
            .map(|&i| self.exposure(i))
            .chain((0..unit.n_library()).map(|_| Exposure::library(wv)))
            .collect()
    }
    /// Geometry of the models of a target frame
    pub fn model_geometry(&self, frame: usize) -> ModelGeometry {
        ModelGeometry {
            shape: self.shape,
            center: self.aligned_center,
            ref_wv: self.wvs[frame],
            flipx: self.config.flipx,
        }
    }
    /// Derotation of the section stamps of a target frame
    pub fn derotation(&self, frame: usize, section: &Section) -> Derotation {
        Derotation {
            shape: self.shape,
            center: self.aligned_center,
            parang: self.pas[frame],
            bounds: section.bounds,
            padding: section.padding,
            angles: self.angles,
            flipx: self.config.flipx,
        }
    }
    /// Sections of the reduction
    pub fn sections(&self) -> Result<Vec<Section>> {
        let config = self.config.clone().owa(self.angles.outer);
        Ok(geometry::sections(&config, self.shape, self.aligned_center)?)
    }
    fn progress_bar(&self, n: usize) -> ProgressBar {
        if self.config.progress {
            ProgressBar::new(n as u64)
        } else {
            ProgressBar::hidden()
        }
    }
}

/// A (section, target frame) unit with its unperturbed KL basis
#[derive(Debug, Clone)]
pub struct KlipUnit {
    pub frame: usize,
    pub section: Section,
    /// Reference frames, in the order of the basis eigenvector rows
    pub ref_indices: Vec<usize>,
    pub basis: Eigenbasis,
    /// Science stamp `[p]`
    pub sci: DVector<f64>,
    /// Reference stamps `[r × p]`, reference library rows after the frames
    pub refs: DMatrix<f64>,
    /// KLIP subtracted science stamp `[p × cutoffs]`
    pub klipped: DMatrix<f64>,
}
impl KlipUnit {
    /// Rebuilds a unit from a saved basis
    ///
    /// The saved pixels already include the padding of the first pass, so the
    /// replayed section is not padded again when derotated.
    pub fn replay(entry: &BasisEntry, ctx: &WorkerContext) -> Self {
        let section = Section {
            bounds: entry.bounds,
            padding: 0.,
            indices: entry.section.clone(),
        };
        let sci = ctx.science(entry.frame, &section.indices);
        let refs = ctx.references(entry.frame, &entry.ref_indices, &section.indices);
        let klipped = entry.basis.klip(&sci, ctx.numbasis());
        Self {
            frame: entry.frame,
            section,
            ref_indices: entry.ref_indices.clone(),
            basis: entry.basis.clone(),
            sci,
            refs,
            klipped,
        }
    }
    /// Number of reference library rows
    pub fn n_library(&self) -> usize {
        self.refs.nrows().saturating_sub(self.ref_indices.len())
    }
    pub fn key(&self) -> String {
        self.section.key(self.frame)
    }
    /// Basis archive entry of the unit
    pub fn entry(&self) -> BasisEntry {
        BasisEntry {
            frame: self.frame,
            bounds: self.section.bounds,
            section: self.section.indices.clone(),
            ref_indices: self.ref_indices.clone(),
            basis: self.basis.clone(),
        }
    }
}

/// Source of the unperturbed KL basis of a unit
pub trait KlipEngine: Sync {
    fn unit(&self, ctx: &WorkerContext, section: &Section, frame: usize) -> Result<KlipUnit>;
}

/// KL basis of every other frame of the dataset, optionally completed by a reference library
#[derive(Debug, Clone, Default)]
pub struct EigenbasisEngine {
    // [reference, y, x] aligned on the context center
    library: Option<Array3<f64>>,
}
impl EigenbasisEngine {
    pub fn new() -> Self {
        Default::default()
    }
    /// Reference library frames appended to the reference set (RDI)
    pub fn library(mut self, library: Array3<f64>) -> Self {
        self.library = Some(library);
        self
    }
}
impl KlipEngine for EigenbasisEngine {
    fn unit(&self, ctx: &WorkerContext, section: &Section, frame: usize) -> Result<KlipUnit> {
        let ref_indices: Vec<usize> = (0..ctx.n_frame()).filter(|i| *i != frame).collect();
        let sci = ctx.science(frame, &section.indices);
        let mut refs = ctx.references(frame, &ref_indices, &section.indices);
        if let Some(library) = &self.library {
            let nx = ctx.shape().1;
            let n = refs.nrows();
            refs = refs.resize_vertically(n + library.dim().0, 0.);
            for (i, image) in library.axis_iter(Axis(0)).enumerate() {
                for (j, &idx) in section.indices.iter().enumerate() {
                    refs[(n + i, j)] = image[[idx / nx, idx % nx]];
                }
            }
        }
        let max_basis = ctx.numbasis().iter().copied().max().unwrap_or(1);
        let basis = Eigenbasis::from_references(&refs, max_basis)?;
        let klipped = basis.klip(&sci, ctx.numbasis());
        log::debug!(
            "frame #{frame} section {}: {} pixels, {} KL modes",
            section.key(frame),
            section.len(),
            basis.len()
        );
        Ok(KlipUnit {
            frame,
            section: section.clone(),
            ref_indices,
            basis,
            sci,
            refs,
            klipped,
        })
    }
}

// Keeps the entries of the successful units and returns the first failure
fn merge(results: Vec<(usize, String, Result<Option<BasisEntry>>)>) -> Result<Vec<BasisEntry>> {
    let mut entries = vec![];
    let mut failure = None;
    for (frame, key, result) in results {
        match result {
            Ok(entry) => entries.extend(entry),
            Err(e) => {
                log::error!("unit {key} of frame #{frame} failed: {e}");
                failure.get_or_insert(FmError::Unit {
                    frame,
                    key,
                    source: Box::new(e),
                });
            }
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(entries),
    }
}

/// Runs `fm` over every (section, frame) unit of the reduction
///
/// Each unit gets its KL basis from `engine` and is handed to the forward
/// model hook on the worker pool. A failed unit does not stop the others;
/// the first failure is returned once all of them have run.
pub fn klip_parallelized<F, E>(fm: &F, engine: &E, ctx: &WorkerContext) -> Result<F::Output>
where
    F: ForwardModel,
    E: KlipEngine,
{
    let sections = ctx.sections()?;
    let tasks: Vec<(usize, usize)> = (0..sections.len())
        .flat_map(|s| (0..ctx.n_frame()).map(move |frame| (s, frame)))
        .collect();
    let buffer = fm.allocate_output(ctx)?;
    let now = Instant::now();
    log::info!("Forward modeling {} units...", tasks.len());
    let pb = ctx.progress_bar(tasks.len());
    let results: Vec<_> = ctx.pool().install(|| {
        tasks
            .par_iter()
            .progress_with(pb)
            .map(|&(s, frame)| {
                let section = &sections[s];
                let result = engine
                    .unit(ctx, section, frame)
                    .and_then(|unit| fm.per_frame_hook(ctx, &unit, &buffer));
                (frame, section.key(frame), result)
            })
            .collect()
    });
    let entries = merge(results)?;
    log::info!("... forward modeled in {:}s", now.elapsed().as_secs());
    fm.finalize(ctx, buffer, entries)
}

/// Runs `fm` over units whose KL bases are already known
pub fn run_units<F: ForwardModel>(
    fm: &F,
    ctx: &WorkerContext,
    units: &[KlipUnit],
) -> Result<F::Output> {
    let buffer = fm.allocate_output(ctx)?;
    let now = Instant::now();
    log::info!("Forward modeling {} units...", units.len());
    let pb = ctx.progress_bar(units.len());
    let results: Vec<_> = ctx.pool().install(|| {
        units
            .par_iter()
            .progress_with(pb)
            .map(|unit| (unit.frame, unit.key(), fm.per_frame_hook(ctx, unit, &buffer)))
            .collect()
    });
    let entries = merge(results)?;
    log::info!("... forward modeled in {:}s", now.elapsed().as_secs());
    fm.finalize(ctx, buffer, entries)
}

/// Runs `fm` over the units of saved KL bases
pub fn replay_parallelized<'a, F, I>(fm: &F, ctx: &WorkerContext, entries: I) -> Result<F::Output>
where
    F: ForwardModel,
    I: IntoIterator<Item = &'a BasisEntry> + Send,
{
    let units: Vec<KlipUnit> = ctx.pool().install(|| {
        entries
            .into_iter()
            .collect::<Vec<_>>()
            .into_par_iter()
            .map(|entry| KlipUnit::replay(entry, ctx))
            .collect()
    });
    run_units(fm, ctx, &units)
}
