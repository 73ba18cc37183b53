use std::sync::Arc;

use klip_fm::{
    basis::BasisError,
    fm::{FmError, ForwardModel},
    invert_spect_fmodel, klip_parallelized, run_units, Dataset, DiskFm, EigenbasisEngine,
    Exposures, ExtractSpec, KlipConfig, KlipEngine, KlipUnit, MatchedFilter, PlanetPsfFm,
    PsfLibrary, SaveOptions, Section, SpectrumSolver, WorkerContext,
};
use ndarray::{Array2, Array3, Axis, IxDyn};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

const N: usize = 31;
const CENTER: [f64; 2] = [15., 15.];

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn gaussian(size: usize, x0: f64, y0: f64, sigma: f64) -> Array2<f64> {
    Array2::from_shape_fn((size, size), |(row, col)| {
        let r2 = (col as f64 - x0).powi(2) + (row as f64 - y0).powi(2);
        (-0.5 * r2 / sigma.powi(2)).exp()
    })
}

// stellar halo with random speckles
fn exposures(n: usize, seed: u64) -> Array3<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let halo = gaussian(N, CENTER[0], CENTER[1], 5.);
    Array3::from_shape_fn((n, N, N), |(_, row, col)| {
        halo[[row, col]] + 0.05 * rng.gen::<f64>()
    })
}

fn broadband() -> Exposures {
    let pas = vec![0., 12., 24., 36., 48., 60.];
    Exposures::broadband(exposures(6, 7), CENTER, pas, 1.6).unwrap()
}

fn config() -> KlipConfig {
    KlipConfig::default()
        .numthreads(2)
        .iwa(4.)
        .owa(8.)
        .annuli(1)
        .subsections(2)
        .numbasis(vec![1, 3])
}

fn library() -> Arc<PsfLibrary> {
    let psf = gaussian(9, 4., 4., 1.5).insert_axis(Axis(0));
    Arc::new(PsfLibrary::new(psf.view(), &[1.6]).unwrap())
}

fn disk() -> Array2<f64> {
    Array2::from_shape_fn((N, N), |(row, col)| {
        let r = (col as f64 - CENTER[0]).hypot(row as f64 - CENTER[1]);
        (-0.5 * (r - 6.).powi(2)).exp() * 1e-2
    })
}

#[test]
fn zero_model_is_exactly_zero() {
    init();
    let data = broadband();
    let ctx = WorkerContext::prepare(&data, &config()).unwrap();
    let model = Array2::<f64>::zeros((N, N));
    let fm = DiskFm::new(&data, model.view().into_dyn(), ctx.aligned_center()).unwrap();
    let output = klip_parallelized(&fm, &EigenbasisEngine::new(), &ctx).unwrap();
    assert_eq!(output.fmout.dim(), (2, 6, N, N));
    assert!(output.fmout.iter().all(|v| *v == 0.));
}

#[test]
fn unit_order_does_not_matter() {
    init();
    let data = broadband();
    let ctx = WorkerContext::prepare(&data, &config()).unwrap();
    let engine = EigenbasisEngine::new();
    let mut units: Vec<KlipUnit> = vec![];
    for section in ctx.sections().unwrap() {
        for frame in 0..ctx.n_frame() {
            units.push(engine.unit(&ctx, &section, frame).unwrap());
        }
    }
    let fm = PlanetPsfFm::new(6., 30., 1e-2, library());
    let first = run_units(&fm, &ctx, &units).unwrap();
    units.shuffle(&mut StdRng::seed_from_u64(3));
    let second = run_units(&fm, &ctx, &units).unwrap();
    let same = |a: &f64, b: &f64| a == b || (a.is_nan() && b.is_nan());
    assert!(first.fmout.iter().zip(second.fmout.iter()).all(|(a, b)| same(a, b)));
    assert_eq!(first.perturbmag, second.perturbmag);
    assert!(first.fmout.iter().any(|v| v.abs() > 0.));
}

struct FailingEngine(usize);
impl KlipEngine for FailingEngine {
    fn unit(
        &self,
        ctx: &WorkerContext,
        section: &Section,
        frame: usize,
    ) -> Result<KlipUnit, FmError> {
        if frame == self.0 {
            Err(FmError::NoArchive)
        } else {
            EigenbasisEngine::new().unit(ctx, section, frame)
        }
    }
}

#[test]
fn failed_unit_is_reported() {
    init();
    let data = broadband();
    let ctx = WorkerContext::prepare(&data, &config()).unwrap();
    let fm = DiskFm::new(&data, disk().view().into_dyn(), ctx.aligned_center()).unwrap();
    let result = klip_parallelized(&fm, &FailingEngine(2), &ctx);
    assert!(matches!(result, Err(FmError::Unit { frame: 2, .. })));
}

#[test]
fn disk_center_mismatch() {
    init();
    let data = broadband();
    let ctx = WorkerContext::prepare(&data, &config()).unwrap();
    let fm = DiskFm::new(&data, disk().view().into_dyn(), [14., 15.]).unwrap();
    let result = klip_parallelized(&fm, &EigenbasisEngine::new(), &ctx);
    assert!(matches!(result, Err(FmError::CenterMismatch { .. })));
}

fn disk_replay(archive: &str) {
    init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(archive);
    let data = broadband();
    // replayed sections are not padded
    let config = config().padding(0.);
    let ctx = WorkerContext::prepare(&data, &config).unwrap();
    let fm = DiskFm::new(&data, disk().view().into_dyn(), ctx.aligned_center())
        .unwrap()
        .save_basis(&path)
        .unwrap();
    let output = klip_parallelized(&fm, &EigenbasisEngine::new(), &ctx).unwrap();
    assert!(path.exists());

    let fm = DiskFm::from_basis(&data, disk().view().into_dyn(), &path).unwrap();
    let replay_config = fm.replay_config(config.clone()).unwrap();
    let replay_ctx = WorkerContext::prepare(&data, &replay_config).unwrap();
    let replayed = fm.fm_parallelized(&replay_ctx).unwrap();
    assert_eq!(replayed.shape(), &[2, N, N]);
    for b in 0..2 {
        for row in 0..N {
            for col in 0..N {
                let values: Vec<f64> = (0..6)
                    .map(|i| output.fmout[[b, i, row, col]])
                    .filter(|v| !v.is_nan())
                    .collect();
                let replayed = replayed[IxDyn(&[b, row, col])];
                if values.is_empty() {
                    assert!(replayed.is_nan());
                } else {
                    let mean = values.iter().sum::<f64>() / values.len() as f64;
                    assert!((mean - replayed).abs() < 1e-12);
                }
            }
        }
    }

    let other_ctx = WorkerContext::prepare(&data, &config.iwa(3.)).unwrap();
    assert!(matches!(
        fm.fm_parallelized(&other_ctx),
        Err(FmError::Basis(BasisError::WorkingAngleMismatch { .. }))
    ));
}

#[test]
fn disk_replay_npz() {
    disk_replay("basis.npz");
}

#[test]
fn disk_replay_pickle() {
    disk_replay("basis.pkl");
}

#[test]
fn spectral_disk_products() {
    init();
    let wvs = [1.5, 1.6, 1.7];
    let data = Exposures::new(
        exposures(6, 11),
        vec![CENTER; 6],
        vec![0., 0., 0., 25., 25., 25.],
        wvs.iter().cycle().take(6).copied().collect(),
        vec![0, 0, 0, 1, 1, 1],
    )
    .unwrap();
    assert_eq!(data.numwvs(), 3);
    let ctx = WorkerContext::prepare(&data, &config()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("basis.npz");
    let fm = DiskFm::new(&data, disk().view().into_dyn(), ctx.aligned_center())
        .unwrap()
        .save_basis(&path)
        .unwrap();
    assert_eq!(fm.model().channels(), 3);
    let output = klip_parallelized(&fm, &EigenbasisEngine::new(), &ctx).unwrap();
    let reduction = fm
        .reduce_for_saving(&data, &output, &SaveOptions::new(dir.path(), "disk"))
        .unwrap();
    assert_eq!(reduction.kl_cube.dim(), (2, N, N));
    assert_eq!(reduction.spectral_cubes.map(|c| c.dim()), Some((2, 3, N, N)));
    assert!(dir.path().join("disk-diskfm-KLmodes-all.npy").exists());
    assert!(dir.path().join("disk-diskfm-KL3-speccube.npy").exists());

    let fm = DiskFm::from_basis(&data, disk().view().into_dyn(), &path).unwrap();
    assert_eq!(fm.model().channels(), 3);
    let replay_ctx = WorkerContext::prepare(&data, &fm.replay_config(config()).unwrap()).unwrap();
    let replayed = fm.fm_parallelized(&replay_ctx).unwrap();
    assert_eq!(replayed.shape(), &[2, 3, N, N]);
    assert!(replayed.iter().all(|v| v.is_finite()));
    assert!(replayed.iter().any(|v| v.abs() > 0.));
}

#[test]
fn planet_psf_products() {
    init();
    let data = broadband();
    let ctx = WorkerContext::prepare(&data, &config()).unwrap();
    let fm = PlanetPsfFm::new(6., 30., 1e-2, library());
    let output = klip_parallelized(&fm, &EigenbasisEngine::new(), &ctx).unwrap();
    assert_eq!(output.fmout.dim(), (2, 6, N, N));
    assert_eq!(output.perturbmag.dim(), (6, 2));
    assert!(output.perturbmag.iter().all(|f| f.is_finite() && *f >= 0.));
    let dir = tempfile::tempdir().unwrap();
    let options = SaveOptions::new(dir.path(), "planet").klipparams("annuli=1 subsections=2");
    let reduction = fm.reduce_for_saving(&data, &output, &options).unwrap();
    assert!(reduction.spectral_cubes.is_none());
    assert!(reduction.kl_cube.iter().any(|v| v.abs() > 0.));
    assert!(dir.path().join("planet-fmpsf-KLmodes-all.npy").exists());
    assert!(dir.path().join("planet-fmpsf-KLmodes-all.meta.pkl").exists());
}

#[test]
fn planet_lands_at_its_sky_position() {
    init();
    let data = broadband();
    let ctx = WorkerContext::prepare(&data, &config()).unwrap();
    let (sep, pa) = (6f64, 345f64);
    let fm = PlanetPsfFm::new(sep, pa, 1e-2, library());
    let output = klip_parallelized(&fm, &EigenbasisEngine::new(), &ctx).unwrap();
    // north up, east left
    let x = CENTER[0] - sep * pa.to_radians().sin();
    let y = CENTER[1] + sep * pa.to_radians().cos();
    for b in 0..2 {
        for i in 0..6 {
            let frame = output.fmout.index_axis(Axis(0), b);
            let frame = frame.index_axis(Axis(0), i);
            let ((row, col), peak) = frame
                .indexed_iter()
                .filter(|(_, v)| !v.is_nan())
                .fold(((0, 0), f64::NEG_INFINITY), |best, (idx, v)| {
                    if *v > best.1 {
                        (idx, *v)
                    } else {
                        best
                    }
                });
            assert!(peak > 0.);
            let offset = (col as f64 - x).hypot(row as f64 - y);
            assert!(offset < 1.5, "cutoff {b}, frame {i}: peak at ({col}, {row})");
        }
    }
}

#[test]
fn matched_filter_maps() {
    init();
    let data = broadband();
    let ctx = WorkerContext::prepare(&data, &config().numbasis(vec![3])).unwrap();
    let fm = MatchedFilter::new(library());
    let maps = klip_parallelized(&fm, &EigenbasisEngine::new(), &ctx).unwrap();
    assert_eq!(maps.fmmf.dim(), (1, 1, N, N));
    // outside the working angles
    assert!(maps.fmmf[[0, 0, 0, 0]].is_nan());
    let finite = maps.cc.iter().filter(|v| v.is_finite()).count();
    assert!(finite > 0);
    assert!(maps.cc.iter().filter(|v| v.is_finite()).all(|v| v.abs() <= 1. + 1e-9));
    let dir = tempfile::tempdir().unwrap();
    let paths = fm
        .reduce_for_saving(&data, &maps, &SaveOptions::new(dir.path(), "mf"))
        .unwrap();
    assert_eq!(paths.len(), 3);
    assert!(dir.path().join("mf-FMCC-KLmodes-all.npy").exists());
}

#[test]
fn extracted_spectrum() {
    init();
    let data = broadband();
    let ctx = WorkerContext::prepare(&data, &config()).unwrap();
    let fm = ExtractSpec::new(6., 30., library(), 7);
    let output = klip_parallelized(&fm, &EigenbasisEngine::new(), &ctx).unwrap();
    assert_eq!(output.fmout.dim(), (2, 6, 7, 49));
    let estimate = invert_spect_fmodel(output.fmout.view(), 1, SpectrumSolver::Pinv, 1.).unwrap();
    assert_eq!(estimate.spectrum.dim(), (2, 1));
    assert!(estimate.spectrum.iter().all(|s| s.is_finite()));
    let dir = tempfile::tempdir().unwrap();
    let products = fm
        .reduce_for_saving(&data, &output, &SaveOptions::new(dir.path(), "spec"))
        .unwrap();
    assert_eq!(products.spectrum, estimate.spectrum);
}
