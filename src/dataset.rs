//! Instrument data
//!
//! The forward models read the exposures and their metadata through the
//! [Dataset] trait and write their products with [Dataset::savedata].
//! [Exposures] is an in-memory dataset saving `.npy` files.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{self, BufWriter},
    path::{Path, PathBuf},
};

use itertools::Itertools;
use ndarray::{Array3, ArrayD, ArrayView3, ArrayViewD};
use npyz::WriterBuilder;
use serde::Serialize;
use serde_pickle as pickle;

#[derive(thiserror::Error, Debug)]
pub enum DatasetError {
    #[error("{what} has {found} entries for {expected} frames")]
    Length {
        what: &'static str,
        found: usize,
        expected: usize,
    },
    #[error("files have different numbers of wavelengths")]
    UnevenFiles,
    #[error("failed to create {1:?}")]
    Create(#[source] io::Error, PathBuf),
    #[error("failed to write data")]
    Io(#[from] io::Error),
    #[error("failed to pickle the metadata")]
    Pickle(#[from] pickle::Error),
}
type Result<T> = std::result::Result<T, DatasetError>;

/// Metadata attached to a saved product
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Metadata {
    /// Kind of product
    pub filetype: String,
    /// Reduction parameters
    pub klipparams: Option<String>,
    /// Labels of the first axis, e.g. the KL cutoffs
    pub zaxis: Option<Vec<usize>>,
    pub keywords: BTreeMap<String, f64>,
}
impl Metadata {
    pub fn new<S: Into<String>>(filetype: S) -> Self {
        Self {
            filetype: filetype.into(),
            ..Default::default()
        }
    }
    pub fn klipparams(mut self, klipparams: Option<String>) -> Self {
        self.klipparams = klipparams;
        self
    }
    pub fn zaxis(mut self, zaxis: Vec<usize>) -> Self {
        self.zaxis = Some(zaxis);
        self
    }
    pub fn keyword<S: Into<String>>(mut self, key: S, value: f64) -> Self {
        self.keywords.insert(key.into(), value);
        self
    }
}

/// Exposures of a star and their metadata
///
/// Frames are ordered file by file and, within a file, wavelength by
/// wavelength.
pub trait Dataset: Sync {
    /// Exposures `[frame, y, x]`
    fn input(&self) -> ArrayView3<f64>;
    /// Star position `[x, y]` in each frame
    fn centers(&self) -> &[[f64; 2]];
    /// Parallactic angles [deg]
    fn pas(&self) -> &[f64];
    fn wvs(&self) -> &[f64];
    /// File index of each frame
    fn filenums(&self) -> &[usize];
    /// Saves a data product at `path`, the extension is chosen by the dataset
    fn savedata(&self, path: &Path, data: ArrayViewD<f64>, metadata: &Metadata) -> Result<()>;
    /// Flux calibration of a data product, `spectral` for a cube with a wavelength axis
    fn calibrate_output(&self, data: ArrayD<f64>, _spectral: bool) -> ArrayD<f64> {
        data
    }

    fn n_frame(&self) -> usize {
        self.pas().len()
    }
    /// Image shape `(ny, nx)`
    fn shape(&self) -> (usize, usize) {
        let (_, ny, nx) = self.input().dim();
        (ny, nx)
    }
    /// Distinct wavelengths in the order of first appearance
    fn unique_wvs(&self) -> Vec<f64> {
        self.wvs()
            .iter()
            .copied()
            .unique_by(|wv| wv.to_bits())
            .collect()
    }
    /// Number of wavelengths per file
    fn numwvs(&self) -> usize {
        self.unique_wvs().len()
    }
    /// Number of distinct files
    fn nfiles(&self) -> usize {
        self.filenums().iter().unique().count()
    }
}

/// In-memory dataset
#[derive(Debug, Clone)]
pub struct Exposures {
    input: Array3<f64>,
    centers: Vec<[f64; 2]>,
    pas: Vec<f64>,
    wvs: Vec<f64>,
    filenums: Vec<usize>,
}
impl Exposures {
    pub fn new(
        input: Array3<f64>,
        centers: Vec<[f64; 2]>,
        pas: Vec<f64>,
        wvs: Vec<f64>,
        filenums: Vec<usize>,
    ) -> Result<Self> {
        let expected = input.dim().0;
        for (what, found) in [
            ("centers", centers.len()),
            ("pas", pas.len()),
            ("wvs", wvs.len()),
            ("filenums", filenums.len()),
        ] {
            if found != expected {
                return Err(DatasetError::Length {
                    what,
                    found,
                    expected,
                });
            }
        }
        let this = Self {
            input,
            centers,
            pas,
            wvs,
            filenums,
        };
        if this.n_frame() != this.nfiles() * this.numwvs() {
            return Err(DatasetError::UnevenFiles);
        }
        Ok(this)
    }
    /// Broadband sequence of exposures, one per file, centered on `center`
    pub fn broadband(input: Array3<f64>, center: [f64; 2], pas: Vec<f64>, wv: f64) -> Result<Self> {
        let n = input.dim().0;
        Self::new(input, vec![center; n], pas, vec![wv; n], (0..n).collect())
    }
}
impl Dataset for Exposures {
    fn input(&self) -> ArrayView3<f64> {
        self.input.view()
    }
    fn centers(&self) -> &[[f64; 2]] {
        &self.centers
    }
    fn pas(&self) -> &[f64] {
        &self.pas
    }
    fn wvs(&self) -> &[f64] {
        &self.wvs
    }
    fn filenums(&self) -> &[usize] {
        &self.filenums
    }
    /// Writes `data` to `<path>.npy` and the metadata to `<path>.meta.pkl`
    fn savedata(&self, path: &Path, data: ArrayViewD<f64>, metadata: &Metadata) -> Result<()> {
        let npy = path.with_extension("npy");
        log::info!("Saving {:?} {:?}", metadata.filetype, npy);
        let file = File::create(&npy).map_err(|e| DatasetError::Create(e, npy.clone()))?;
        let shape: Vec<u64> = data.shape().iter().map(|n| *n as u64).collect();
        let mut writer = npyz::WriteOptions::new()
            .default_dtype()
            .shape(&shape)
            .writer(BufWriter::new(file))
            .begin_nd()?;
        writer.extend(data.iter().copied())?;
        writer.finish()?;
        let meta = path.with_extension("meta.pkl");
        let mut file = File::create(&meta).map_err(|e| DatasetError::Create(e, meta.clone()))?;
        pickle::to_writer(&mut file, metadata, Default::default())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exposures() -> Exposures {
        let input = Array3::<f64>::zeros((6, 9, 9));
        let wvs = vec![1.5, 1.6, 1.7, 1.5, 1.6, 1.7];
        let filenums = vec![0, 0, 0, 1, 1, 1];
        let pas = vec![0., 0., 0., 10., 10., 10.];
        Exposures::new(input, vec![[4., 4.]; 6], pas, wvs, filenums).unwrap()
    }

    #[test]
    fn wavelengths_and_files() {
        let e = exposures();
        assert_eq!(e.unique_wvs(), vec![1.5, 1.6, 1.7]);
        assert_eq!(e.numwvs(), 3);
        assert_eq!(e.nfiles(), 2);
        assert_eq!(e.shape(), (9, 9));
    }

    #[test]
    fn length_checks() {
        let input = Array3::<f64>::zeros((2, 9, 9));
        assert!(matches!(
            Exposures::new(input, vec![[4., 4.]; 2], vec![0.], vec![1.; 2], vec![0, 1]),
            Err(DatasetError::Length { what: "pas", .. })
        ));
    }

    #[test]
    fn savedata_writes_npy() {
        let dir = tempfile::tempdir().unwrap();
        let e = exposures();
        let data =
            ndarray::Array3::from_shape_fn((2, 3, 4), |(i, j, k)| (i * 12 + j * 4 + k) as f64);
        let path = dir.path().join("product");
        e.savedata(&path, data.view().into_dyn(), &Metadata::new("KL Mode Cube").zaxis(vec![1, 5]))
            .unwrap();
        let npy = npyz::NpyFile::new(File::open(dir.path().join("product.npy")).unwrap()).unwrap();
        assert_eq!(npy.shape(), &[2, 3, 4]);
        let values: Vec<f64> = npy.into_vec().unwrap();
        assert_eq!(values, data.iter().copied().collect::<Vec<_>>());
        assert!(dir.path().join("product.meta.pkl").exists());
    }
}
