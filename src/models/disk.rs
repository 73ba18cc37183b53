use nalgebra::DMatrix;
use ndarray::{Array2, Array3, ArrayViewD, Axis, Ix2, Ix3};
use rayon::prelude::*;

use super::{Exposure, ModelError, ModelGeometry, Result, SignalModel};
use crate::interp::rotate;

/// Disk image rotated to the parallactic angle of every frame
///
/// The model is either a single image or a cube with one image per
/// wavelength channel of a file. Frames are ordered file by file, so frame `i`
/// uses the channel `i % channels`.
#[derive(Debug, Clone)]
pub struct DiskModel {
    shape: (usize, usize),
    channels: usize,
    // [frame, y * x]
    frames: Array2<f64>,
}
impl DiskModel {
    /// Rotates `model` (`[y, x]` or `[wavelength, y, x]`) to each of the parallactic
    /// angles `pas` [deg]
    ///
    /// A single channel model is used for every wavelength of multi-wavelength
    /// data, any other channel count must match `wvs_per_file`.
    pub fn new(
        model: ArrayViewD<f64>,
        pas: &[f64],
        wvs_per_file: usize,
        shape: (usize, usize),
        center: [f64; 2],
    ) -> Result<Self> {
        let cube: Array3<f64> = match model.ndim() {
            2 => model.into_dimensionality::<Ix2>()?.insert_axis(Axis(0)).to_owned(),
            3 => model.into_dimensionality::<Ix3>()?.to_owned(),
            n => return Err(ModelError::ModelDimension(n)),
        };
        let (model_channels, ny, nx) = cube.dim();
        if (ny, nx) != shape {
            return Err(ModelError::ImageShape {
                expected: shape,
                found: (ny, nx),
            });
        }
        if model_channels == 1 && wvs_per_file > 1 {
            log::warn!(
                "a single channel disk model is used for the {wvs_per_file} wavelengths of the data"
            );
        } else if model_channels != wvs_per_file {
            return Err(ModelError::WavelengthMismatch {
                model: model_channels,
                data: wvs_per_file,
            });
        }
        // a single channel is broadcast to every wavelength of a file
        let channels = wvs_per_file.max(1);
        let rotated: Vec<Vec<f64>> = pas
            .par_iter()
            .enumerate()
            .map(|(i, pa)| {
                let channel = cube.index_axis(Axis(0), (i % channels) % model_channels);
                rotate(channel, *pa, center, true)
                    .iter()
                    .map(|v| if v.is_nan() { 0. } else { *v })
                    .collect()
            })
            .collect();
        let frames = Array2::from_shape_vec(
            (pas.len(), ny * nx),
            rotated.into_iter().flatten().collect(),
        )?;
        Ok(Self {
            shape,
            channels,
            frames,
        })
    }
    /// Number of wavelength channels of the model, after broadcast
    pub fn channels(&self) -> usize {
        self.channels
    }
    pub fn n_frame(&self) -> usize {
        self.frames.nrows()
    }
    /// Rotated model of a frame as a `[y, x]` image
    pub fn frame(&self, index: usize) -> Result<Array2<f64>> {
        if index >= self.n_frame() {
            return Err(ModelError::FrameOutOfRange(index));
        }
        Ok(self.frames.row(index).to_owned().into_shape(self.shape)?)
    }
}
impl SignalModel for DiskModel {
    fn generate(
        &self,
        exposures: &[Exposure],
        section: &[usize],
        _geometry: &ModelGeometry,
    ) -> Result<DMatrix<f64>> {
        let mut models = DMatrix::<f64>::zeros(exposures.len(), section.len());
        for (i, exposure) in exposures.iter().enumerate() {
            let Some(index) = exposure.index else {
                continue;
            };
            if index >= self.n_frame() {
                return Err(ModelError::FrameOutOfRange(index));
            }
            let frame = self.frames.row(index);
            for (j, &idx) in section.iter().enumerate() {
                models[(i, j)] = frame[idx];
            }
        }
        Ok(models)
    }
}
