//! KL basis archive
//!
//! The unperturbed KL basis of every (section, frame) unit can be saved once
//! and replayed by any number of forward model evaluations.
//! Entries are keyed by `"idsec<first section pixel>i<frame index>"`.
//!
//! Two formats are supported, selected by the file extension:
//!  - `.npz`: one array per entry and mapping, named `"<mapping>/<key>"`,
//!  - `.pkl`: a stream of pickled mappings, each preceded by its byte length
//!    as a little endian `u64`.
//!
//! Both store the 10 entry mappings (`klmodes`, `evecs`, `evals`,
//! `ref_indices`, `section_indices`, `radstart`, `radend`, `phistart`,
//! `phiend`, `frame`) and the `klparam` global parameters, in that order.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{self, BufReader, BufWriter, Read, Seek, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use nalgebra::{DMatrix, DVector};
use npyz::{npz::NpzArchive, npz::NpzWriter, WriterBuilder};
use regex::Regex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_pickle as pickle;
use strum_macros::{Display, EnumIter, EnumString};

use crate::{
    geometry::{section_key, SectionBounds, WorkingAngles},
    perturb::Eigenbasis,
};

#[derive(thiserror::Error, Debug)]
pub enum BasisError {
    #[error("unsupported basis archive extension: {0:?}")]
    UnsupportedExtension(PathBuf),
    #[error("failed to open {1:?}")]
    Open(#[source] io::Error, PathBuf),
    #[error("failed to create {1:?}")]
    Create(#[source] io::Error, PathBuf),
    #[error("archive I/O error")]
    Io(#[from] io::Error),
    #[error("failed to (de)serialize the pickled basis")]
    Pickle(#[from] pickle::Error),
    #[error("invalid archive key pattern")]
    Regex(#[from] regex::Error),
    #[error("array {0} is missing from the archive")]
    MissingArray(String),
    #[error("array {0} has an unexpected shape {1:?}")]
    ArrayShape(String, Vec<u64>),
    #[error("corrupt archive: a blob of {expected} bytes is truncated to {found}")]
    TruncatedBlob { expected: u64, found: u64 },
    #[error("mapping {0} has no entry {1}")]
    MissingEntry(&'static str, String),
    #[error("the basis was saved with the alignment center {saved:?}, not {current:?}")]
    CenterMismatch { saved: [f64; 2], current: [f64; 2] },
    #[error("the basis was saved with the working angles {saved:?}, not {current:?}")]
    WorkingAngleMismatch {
        saved: WorkingAngles,
        current: WorkingAngles,
    },
}
type Result<T> = std::result::Result<T, BasisError>;

/// Archive file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum BasisFormat {
    /// Named arrays in a zip container
    Npz,
    /// Stream of pickled mappings
    #[strum(to_string = "pkl")]
    Pickle,
}
impl BasisFormat {
    /// Format matching the extension of `path`
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("npz") => Ok(Self::Npz),
            Some("pkl") => Ok(Self::Pickle),
            _ => Err(BasisError::UnsupportedExtension(path.to_path_buf())),
        }
    }
}

/// Saved KL basis of a (section, frame) unit
#[derive(Debug, Clone, PartialEq)]
pub struct BasisEntry {
    pub frame: usize,
    pub bounds: SectionBounds,
    pub section: Vec<usize>,
    pub ref_indices: Vec<usize>,
    pub basis: Eigenbasis,
}
impl BasisEntry {
    pub fn key(&self) -> String {
        section_key(self.section.first().copied().unwrap_or_default(), self.frame)
    }
}

/// Reduction parameters a basis archive is valid for
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KlipParams {
    #[serde(rename = "IWA")]
    pub iwa: f64,
    #[serde(rename = "OWA")]
    pub owa: f64,
    pub aligned_center: [f64; 2],
}
impl KlipParams {
    pub fn working_angles(&self) -> WorkingAngles {
        WorkingAngles::new(self.iwa, self.owa)
    }
    /// Checks that `current` matches the parameters the basis was saved with
    pub fn check(&self, current: &KlipParams) -> Result<()> {
        if self.aligned_center != current.aligned_center {
            return Err(BasisError::CenterMismatch {
                saved: self.aligned_center,
                current: current.aligned_center,
            });
        }
        if self.iwa != current.iwa || self.owa != current.owa {
            return Err(BasisError::WorkingAngleMismatch {
                saved: self.working_angles(),
                current: current.working_angles(),
            });
        }
        Ok(())
    }
}

/// KL bases keyed by (section, frame)
#[derive(Debug, Clone, PartialEq)]
pub struct BasisArchive {
    pub params: KlipParams,
    pub entries: BTreeMap<String, BasisEntry>,
}
impl BasisArchive {
    pub fn new(params: KlipParams) -> Self {
        Self {
            params,
            entries: BTreeMap::new(),
        }
    }
    pub fn insert(&mut self, entry: BasisEntry) {
        self.entries.insert(entry.key(), entry);
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    /// Saves the archive in the format given by the extension of `path`
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let format = BasisFormat::from_path(path)?;
        let now = Instant::now();
        log::info!("Saving {} KL bases to {:?}...", self.len(), path);
        match format {
            BasisFormat::Npz => self.save_npz(path)?,
            BasisFormat::Pickle => {
                let file =
                    File::create(path).map_err(|e| BasisError::Create(e, path.to_path_buf()))?;
                self.write_pickle(&mut BufWriter::new(file))?
            }
        }
        log::info!("... saved in {:}s", now.elapsed().as_secs());
        Ok(())
    }
    /// Loads an archive in the format given by the extension of `path`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let format = BasisFormat::from_path(path)?;
        let now = Instant::now();
        log::info!("Loading {:?}...", path);
        let archive = match format {
            BasisFormat::Npz => Self::load_npz(path)?,
            BasisFormat::Pickle => {
                let file = File::open(path).map_err(|e| BasisError::Open(e, path.to_path_buf()))?;
                Self::read_pickle(&mut BufReader::new(file))?
            }
        };
        log::info!(
            "... {} KL bases loaded in {:}s",
            archive.len(),
            now.elapsed().as_secs()
        );
        Ok(archive)
    }
    /// Loads an archive and checks it against the current reduction parameters
    pub fn load_checked<P: AsRef<Path>>(path: P, current: &KlipParams) -> Result<Self> {
        let archive = Self::load(path)?;
        archive.params.check(current)?;
        Ok(archive)
    }

    fn mapping<T, F>(&self, f: F) -> BTreeMap<String, T>
    where
        F: Fn(&BasisEntry) -> T,
    {
        self.entries.iter().map(|(k, e)| (k.clone(), f(e))).collect()
    }

    fn write_pickle<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_blob(writer, &self.mapping(|e| StoredMatrix::from(&e.basis.klmodes)))?;
        write_blob(writer, &self.mapping(|e| StoredMatrix::from(&e.basis.evecs)))?;
        write_blob(writer, &self.mapping(|e| e.basis.evals.as_slice().to_vec()))?;
        write_blob(writer, &self.mapping(|e| e.ref_indices.clone()))?;
        write_blob(writer, &self.mapping(|e| e.section.clone()))?;
        write_blob(writer, &self.mapping(|e| e.bounds.radstart))?;
        write_blob(writer, &self.mapping(|e| e.bounds.radend))?;
        write_blob(writer, &self.mapping(|e| e.bounds.phistart))?;
        write_blob(writer, &self.mapping(|e| e.bounds.phiend))?;
        write_blob(writer, &self.mapping(|e| e.frame))?;
        write_blob(writer, &self.params)?;
        writer.flush()?;
        Ok(())
    }

    fn read_pickle<R: Read>(reader: &mut R) -> Result<Self> {
        let klmodes: BTreeMap<String, StoredMatrix> = read_blob(reader)?;
        let evecs: BTreeMap<String, StoredMatrix> = read_blob(reader)?;
        let evals: BTreeMap<String, Vec<f64>> = read_blob(reader)?;
        let ref_indices: BTreeMap<String, Vec<usize>> = read_blob(reader)?;
        let sections: BTreeMap<String, Vec<usize>> = read_blob(reader)?;
        let radstart: BTreeMap<String, f64> = read_blob(reader)?;
        let radend: BTreeMap<String, f64> = read_blob(reader)?;
        let phistart: BTreeMap<String, f64> = read_blob(reader)?;
        let phiend: BTreeMap<String, f64> = read_blob(reader)?;
        let frames: BTreeMap<String, usize> = read_blob(reader)?;
        let params: KlipParams = read_blob(reader)?;
        let missing =
            |name: &'static str, key: &str| BasisError::MissingEntry(name, key.to_string());
        let mut archive = Self::new(params);
        for (key, klm) in klmodes {
            let entry = BasisEntry {
                frame: *frames.get(&key).ok_or_else(|| missing("frame", &key))?,
                bounds: SectionBounds::new(
                    *radstart.get(&key).ok_or_else(|| missing("radstart", &key))?,
                    *radend.get(&key).ok_or_else(|| missing("radend", &key))?,
                    *phistart.get(&key).ok_or_else(|| missing("phistart", &key))?,
                    *phiend.get(&key).ok_or_else(|| missing("phiend", &key))?,
                ),
                section: sections
                    .get(&key)
                    .ok_or_else(|| missing("section_indices", &key))?
                    .clone(),
                ref_indices: ref_indices
                    .get(&key)
                    .ok_or_else(|| missing("ref_indices", &key))?
                    .clone(),
                basis: Eigenbasis {
                    klmodes: klm.into(),
                    evals: DVector::from_vec(
                        evals.get(&key).ok_or_else(|| missing("evals", &key))?.clone(),
                    ),
                    evecs: evecs
                        .get(&key)
                        .ok_or_else(|| missing("evecs", &key))?
                        .clone()
                        .into(),
                },
            };
            archive.entries.insert(key, entry);
        }
        Ok(archive)
    }

    fn save_npz(&self, path: &Path) -> Result<()> {
        let mut npz =
            NpzWriter::create(path).map_err(|e| BasisError::Create(e, path.to_path_buf()))?;
        for (key, e) in &self.entries {
            let (k, p) = e.basis.klmodes.shape();
            let (r, _) = e.basis.evecs.shape();
            write_array(
                &mut npz,
                &format!("klmodes/{key}"),
                &[k as u64, p as u64],
                row_major(&e.basis.klmodes),
            )?;
            write_array(
                &mut npz,
                &format!("evecs/{key}"),
                &[r as u64, k as u64],
                row_major(&e.basis.evecs),
            )?;
            write_array(
                &mut npz,
                &format!("evals/{key}"),
                &[k as u64],
                e.basis.evals.iter().copied(),
            )?;
            write_array(
                &mut npz,
                &format!("ref_indices/{key}"),
                &[e.ref_indices.len() as u64],
                e.ref_indices.iter().map(|i| *i as u64),
            )?;
            write_array(
                &mut npz,
                &format!("section_indices/{key}"),
                &[e.section.len() as u64],
                e.section.iter().map(|i| *i as u64),
            )?;
            write_array(&mut npz, &format!("radstart/{key}"), &[1], [e.bounds.radstart])?;
            write_array(&mut npz, &format!("radend/{key}"), &[1], [e.bounds.radend])?;
            write_array(&mut npz, &format!("phistart/{key}"), &[1], [e.bounds.phistart])?;
            write_array(&mut npz, &format!("phiend/{key}"), &[1], [e.bounds.phiend])?;
            write_array(&mut npz, &format!("frame/{key}"), &[1], [e.frame as u64])?;
        }
        write_array(&mut npz, "klparam/IWA", &[1], [self.params.iwa])?;
        write_array(&mut npz, "klparam/OWA", &[1], [self.params.owa])?;
        write_array(&mut npz, "klparam/aligned_center", &[2], self.params.aligned_center)?;
        Ok(())
    }

    fn load_npz(path: &Path) -> Result<Self> {
        let mut npz = NpzArchive::open(path).map_err(|e| BasisError::Open(e, path.to_path_buf()))?;
        let re = Regex::new(r"^klmodes/(idsec\d+i\d+)$")?;
        let keys: Vec<String> = npz
            .array_names()
            .filter_map(|name| re.captures(name).map(|c| c[1].to_string()))
            .collect();
        let iwa = read_array::<f64, _>(&mut npz, "klparam/IWA")?;
        let owa = read_array::<f64, _>(&mut npz, "klparam/OWA")?;
        let center = read_array::<f64, _>(&mut npz, "klparam/aligned_center")?;
        let params = match (iwa.1.as_slice(), owa.1.as_slice(), center.1.as_slice()) {
            ([iwa], [owa], [x, y]) => KlipParams {
                iwa: *iwa,
                owa: *owa,
                aligned_center: [*x, *y],
            },
            _ => return Err(BasisError::ArrayShape("klparam".into(), center.0)),
        };
        let mut archive = Self::new(params);
        for key in keys {
            let klmodes = read_matrix(&mut npz, &format!("klmodes/{key}"))?;
            let evecs = read_matrix(&mut npz, &format!("evecs/{key}"))?;
            let (_, evals) = read_array::<f64, _>(&mut npz, &format!("evals/{key}"))?;
            let (_, ref_indices) = read_array::<u64, _>(&mut npz, &format!("ref_indices/{key}"))?;
            let (_, section) = read_array::<u64, _>(&mut npz, &format!("section_indices/{key}"))?;
            let radstart = read_scalar::<f64, _>(&mut npz, &format!("radstart/{key}"))?;
            let radend = read_scalar::<f64, _>(&mut npz, &format!("radend/{key}"))?;
            let phistart = read_scalar::<f64, _>(&mut npz, &format!("phistart/{key}"))?;
            let phiend = read_scalar::<f64, _>(&mut npz, &format!("phiend/{key}"))?;
            let frame = read_scalar::<u64, _>(&mut npz, &format!("frame/{key}"))?;
            let entry = BasisEntry {
                frame: frame as usize,
                bounds: SectionBounds::new(radstart, radend, phistart, phiend),
                section: section.into_iter().map(|i| i as usize).collect(),
                ref_indices: ref_indices.into_iter().map(|i| i as usize).collect(),
                basis: Eigenbasis {
                    klmodes,
                    evals: DVector::from_vec(evals),
                    evecs,
                },
            };
            archive.entries.insert(key, entry);
        }
        Ok(archive)
    }
}

/// Column major matrix as stored in the pickle stream
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMatrix {
    nrows: usize,
    ncols: usize,
    data: Vec<f64>,
}
impl From<&DMatrix<f64>> for StoredMatrix {
    fn from(m: &DMatrix<f64>) -> Self {
        Self {
            nrows: m.nrows(),
            ncols: m.ncols(),
            data: m.as_slice().to_vec(),
        }
    }
}
impl From<StoredMatrix> for DMatrix<f64> {
    fn from(m: StoredMatrix) -> Self {
        DMatrix::from_vec(m.nrows, m.ncols, m.data)
    }
}

fn write_blob<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<()> {
    let bytes = pickle::to_vec(value, Default::default())?;
    writer.write_all(&(bytes.len() as u64).to_le_bytes())?;
    writer.write_all(&bytes)?;
    Ok(())
}

fn read_blob<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T> {
    let mut len = [0u8; 8];
    reader.read_exact(&mut len)?;
    let expected = u64::from_le_bytes(len);
    // the buffer only grows with the bytes actually left in the stream
    let mut bytes = vec![];
    let found = reader.by_ref().take(expected).read_to_end(&mut bytes)? as u64;
    if found < expected {
        return Err(BasisError::TruncatedBlob { expected, found });
    }
    Ok(pickle::from_slice(&bytes, Default::default())?)
}

fn row_major(m: &DMatrix<f64>) -> impl Iterator<Item = f64> + '_ {
    m.row_iter().flat_map(|row| row.iter().copied().collect::<Vec<_>>())
}

fn write_array<T, W, I>(npz: &mut NpzWriter<W>, name: &str, shape: &[u64], data: I) -> Result<()>
where
    T: npyz::AutoSerialize,
    W: Write + Seek,
    I: IntoIterator<Item = T>,
{
    let mut writer = npz
        .array(name, Default::default())?
        .default_dtype()
        .shape(shape)
        .begin_nd()?;
    writer.extend(data)?;
    writer.finish()?;
    Ok(())
}

fn read_array<T, R>(npz: &mut NpzArchive<R>, name: &str) -> Result<(Vec<u64>, Vec<T>)>
where
    T: npyz::Deserialize,
    R: Read + Seek,
{
    let npy = npz
        .by_name(name)?
        .ok_or_else(|| BasisError::MissingArray(name.to_string()))?;
    let shape = npy.shape().to_vec();
    Ok((shape, npy.into_vec::<T>()?))
}

fn read_scalar<T, R>(npz: &mut NpzArchive<R>, name: &str) -> Result<T>
where
    T: npyz::Deserialize,
    R: Read + Seek,
{
    let (shape, mut data) = read_array::<T, R>(npz, name)?;
    match data.pop() {
        Some(value) if data.is_empty() => Ok(value),
        _ => Err(BasisError::ArrayShape(name.to_string(), shape)),
    }
}

fn read_matrix<R: Read + Seek>(npz: &mut NpzArchive<R>, name: &str) -> Result<DMatrix<f64>> {
    let (shape, data) = read_array::<f64, R>(npz, name)?;
    match shape.as_slice() {
        [nrows, ncols] if (nrows * ncols) as usize == data.len() => {
            Ok(DMatrix::from_row_slice(*nrows as usize, *ncols as usize, &data))
        }
        _ => Err(BasisError::ArrayShape(name.to_string(), shape)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use strum::IntoEnumIterator;

    fn archive() -> BasisArchive {
        let mut rng = StdRng::seed_from_u64(42);
        let mut archive = BasisArchive::new(KlipParams {
            iwa: 3.,
            owa: 20.5,
            aligned_center: [31.5, 32.],
        });
        for frame in [0usize, 7, 12] {
            let refs = DMatrix::from_fn(5, 17, |_, _| rng.gen::<f64>());
            let section: Vec<usize> = (0..17).map(|i| 100 + 3 * i + frame).collect();
            archive.insert(BasisEntry {
                frame,
                bounds: SectionBounds::new(3., 9.25, 0.1, 1.7),
                section,
                ref_indices: (0..5).map(|i| i + 20).collect(),
                basis: Eigenbasis::from_references(&refs, 4).unwrap(),
            });
        }
        archive
    }

    #[test]
    fn round_trips_are_exact() {
        let dir = tempfile::tempdir().unwrap();
        let archive = archive();
        for format in BasisFormat::iter() {
            let path = dir.path().join(format!("basis.{format}"));
            archive.save(&path).unwrap();
            let loaded = BasisArchive::load(&path).unwrap();
            assert_eq!(loaded, archive, "{format} round trip");
        }
    }

    #[test]
    fn keys() {
        let archive = archive();
        let keys: Vec<_> = archive.entries.keys().cloned().collect();
        assert_eq!(keys, vec!["idsec100i000", "idsec107i007", "idsec112i012"]);
    }

    #[test]
    fn unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            archive().save(dir.path().join("basis.fits")),
            Err(BasisError::UnsupportedExtension(_))
        ));
        assert!(matches!(
            BasisFormat::from_path("basis"),
            Err(BasisError::UnsupportedExtension(_))
        ));
    }

    #[test]
    fn mismatched_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("basis.pkl");
        let archive = archive();
        archive.save(&path).unwrap();
        let mut current = archive.params;
        current.aligned_center = [32., 32.];
        assert!(matches!(
            BasisArchive::load_checked(&path, &current),
            Err(BasisError::CenterMismatch { .. })
        ));
        let mut current = archive.params;
        current.owa = 21.;
        assert!(matches!(
            BasisArchive::load_checked(&path, &current),
            Err(BasisError::WorkingAngleMismatch { .. })
        ));
        assert!(BasisArchive::load_checked(&path, &archive.params).is_ok());
    }

    #[test]
    fn corrupt_length_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("basis.pkl");
        let mut bytes = u64::MAX.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0x80, 0x03, 0x7d, 0x71]);
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(
            BasisArchive::load(&path),
            Err(BasisError::TruncatedBlob {
                expected: u64::MAX,
                found: 4
            })
        ));
    }
}
