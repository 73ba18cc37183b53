//! Output buffers and derotation of section stamps
//!
//! Forward models are accumulated into a [SharedOutput]: one slab per target
//! frame, each behind its own lock so that units of different frames never
//! contend. Units of the same frame write disjoint or NaN-aware summed
//! pixels, so the content of a slab does not depend on the order of the
//! units.

use std::sync::Mutex;

use ndarray::{Array2, ArrayD, ArrayViewMut2, ArrayViewMutD, Axis, IxDyn};

use crate::{
    geometry::{SectionBounds, WorkingAngles},
    interp::{contaminated, fill_nans, sample, Rotation},
};

#[derive(thiserror::Error, Debug)]
pub enum AccumulateError {
    #[error("the output slab of frame #{0} is poisoned")]
    Poisoned(usize),
    #[error("frame #{0} is out of range of the output")]
    FrameOutOfRange(usize),
    #[error("the frame axis #{0} is out of the output dimensions")]
    FrameAxis(usize),
    #[error("failed to stack the output slabs")]
    Shape(#[from] ndarray::ShapeError),
}
type Result<T> = std::result::Result<T, AccumulateError>;

/// Output buffer split in per frame slabs
#[derive(Debug)]
pub struct SharedOutput {
    frame_axis: usize,
    slabs: Vec<Mutex<ArrayD<f64>>>,
}
impl SharedOutput {
    /// Zero initialized buffer of the given `shape`, split along `frame_axis`
    pub fn zeros(shape: &[usize], frame_axis: usize) -> Result<Self> {
        Self::filled(shape, frame_axis, 0.)
    }
    /// Buffer of the given `shape` filled with `value`, split along `frame_axis`
    pub fn filled(shape: &[usize], frame_axis: usize, value: f64) -> Result<Self> {
        if frame_axis >= shape.len() {
            return Err(AccumulateError::FrameAxis(frame_axis));
        }
        let mut slab_shape = shape.to_vec();
        let n_frame = slab_shape.remove(frame_axis);
        let slabs = (0..n_frame)
            .map(|_| Mutex::new(ArrayD::from_elem(IxDyn(&slab_shape), value)))
            .collect();
        Ok(Self { frame_axis, slabs })
    }
    pub fn n_frame(&self) -> usize {
        self.slabs.len()
    }
    /// Runs `f` on the locked slab of `frame`
    pub fn with_frame<R, F>(&self, frame: usize, f: F) -> Result<R>
    where
        F: FnOnce(ArrayViewMutD<f64>) -> R,
    {
        let slab = self
            .slabs
            .get(frame)
            .ok_or(AccumulateError::FrameOutOfRange(frame))?;
        let mut guard = slab.lock().map_err(|_| AccumulateError::Poisoned(frame))?;
        Ok(f(guard.view_mut()))
    }
    /// Reassembles the slabs into the full buffer
    pub fn into_array(self) -> Result<ArrayD<f64>> {
        let frame_axis = self.frame_axis;
        let slabs = self
            .slabs
            .into_iter()
            .enumerate()
            .map(|(i, slab)| slab.into_inner().map_err(|_| AccumulateError::Poisoned(i)))
            .collect::<Result<Vec<_>>>()?;
        let views: Vec<_> = slabs.iter().map(|s| s.view()).collect();
        Ok(ndarray::stack(Axis(frame_axis), &views)?)
    }
}

/// Orientation of a section stamp in the aligned frame
#[derive(Debug, Clone, Copy)]
pub struct Derotation {
    pub shape: (usize, usize),
    pub center: [f64; 2],
    /// Parallactic angle [deg]
    pub parang: f64,
    pub bounds: SectionBounds,
    pub padding: f64,
    pub angles: WorkingAngles,
    pub flipx: bool,
}

/// Derotates a section stamp to North up and adds it to `output`
///
/// The stamp (one value per section pixel) is expanded into a blank image and
/// rotated by the parallactic angle. The output pixels written are those whose
/// position before the rotation lies in the padded section, i.e. the section
/// in sky orientation. Values are added to `output`, NaN entries of `output`
/// being replaced, unless the rotated position lies next to a NaN value of
/// the stamp. Each written pixel increments `numstacked`.
pub fn accumulate(
    mut output: ArrayViewMut2<f64>,
    mut numstacked: Option<ArrayViewMut2<f64>>,
    section: &[usize],
    stamp: &[f64],
    derotation: &Derotation,
) {
    let (ny, nx) = derotation.shape;
    let mut dense = Array2::<f64>::zeros((ny, nx));
    for (&idx, &v) in section.iter().zip(stamp) {
        dense[[idx / nx, idx % nx]] = v;
    }
    let filled = fill_nans(dense.view());
    let rotation = Rotation::new(derotation.parang, derotation.center, derotation.flipx);
    for (row, col) in (0..ny).flat_map(|row| (0..nx).map(move |col| (row, col))) {
        let (xp, yp) = rotation.source(col as f64, row as f64);
        let in_section = derotation.bounds.contains(
            xp,
            yp,
            derotation.center,
            derotation.padding,
            0.,
            derotation.angles,
            derotation.flipx,
        );
        if !in_section || contaminated(dense.view(), xp, yp) {
            continue;
        }
        let value = sample(filled.view(), xp, yp);
        if value.is_nan() {
            continue;
        }
        let pixel = &mut output[[row, col]];
        *pixel = if pixel.is_nan() { value } else { *pixel + value };
        if let Some(numstacked) = numstacked.as_mut() {
            numstacked[[row, col]] += 1.;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::{FRAC_PI_2, TAU};

    fn derotation(parang: f64) -> Derotation {
        Derotation {
            shape: (31, 31),
            center: [15., 15.],
            parang,
            bounds: SectionBounds::new(4., 12., 0., TAU),
            padding: 0.,
            angles: WorkingAngles::new(0., 15.),
            flipx: false,
        }
    }

    // section pixels as resolved by the driver, in the frame orientation
    fn section(d: &Derotation) -> Vec<usize> {
        d.bounds.pixels(d.shape, d.center, d.padding, 0., d.angles, d.flipx)
    }

    // blob at the frame offset `(bx, by)` sampled over a section
    fn blob(d: &Derotation, section: &[usize], bx: f64, by: f64) -> Vec<f64> {
        let nx = d.shape.1;
        section
            .iter()
            .map(|&idx| {
                let x = (idx % nx) as f64 - d.center[0] - bx;
                let y = (idx / nx) as f64 - d.center[1] - by;
                (-0.5 * (x * x + y * y)).exp()
            })
            .collect()
    }

    #[test]
    fn sector_flux_lands_in_the_rotated_sector() {
        let bounds = SectionBounds::new(4., 12., 0., FRAC_PI_2);
        for flipx in [false, true] {
            for parang in [12., 35., 60., 90.] {
                let d = Derotation {
                    bounds,
                    flipx,
                    ..derotation(parang)
                };
                let section = section(&d);
                // in the middle of the sector, mirrored for a flipped frame
                let (bx, by) = if flipx { (-5.657, 5.657) } else { (5.657, 5.657) };
                let stamp = blob(&d, &section, bx, by);
                let flux: f64 = stamp.iter().sum();
                let mut output = Array2::<f64>::zeros((31, 31));
                accumulate(output.view_mut(), None, &section, &stamp, &d);
                let total = output.sum();
                assert!(
                    (total - flux).abs() < 1e-2 * flux,
                    "flipx={flipx} parang={parang}: {total} vs {flux}"
                );
                // the centroid is where the rotation takes the blob
                let rotation = Rotation::new(parang, d.center, flipx);
                let (mut cx, mut cy) = (0f64, 0f64);
                for ((row, col), v) in output.indexed_iter() {
                    cx += col as f64 * v;
                    cy += row as f64 * v;
                }
                let (xp, yp) = rotation.source(cx / total, cy / total);
                assert!(
                    (xp - d.center[0] - bx).hypot(yp - d.center[1] - by) < 0.05,
                    "flipx={flipx} parang={parang}: ({xp}, {yp})"
                );
            }
        }
    }

    #[test]
    fn all_nan_stamp_changes_nothing() {
        let d = derotation(20.);
        let section = section(&d);
        let mut output = Array2::<f64>::from_elem((31, 31), 1.5);
        let stamp = vec![f64::NAN; section.len()];
        accumulate(output.view_mut(), None, &section, &stamp, &d);
        assert!(output.iter().all(|v| *v == 1.5));
    }

    #[test]
    fn zero_parang_is_a_copy() {
        let d = derotation(0.);
        let section = section(&d);
        let stamp: Vec<f64> = section.iter().map(|i| *i as f64).collect();
        let mut output = Array2::<f64>::zeros((31, 31));
        let mut numstacked = Array2::<f64>::zeros((31, 31));
        accumulate(output.view_mut(), Some(numstacked.view_mut()), &section, &stamp, &d);
        assert_eq!(numstacked.sum(), section.len() as f64);
        for (&idx, v) in section.iter().zip(&stamp) {
            assert!((output[[idx / 31, idx % 31]] - v).abs() < 1e-9);
        }
    }

    #[test]
    fn nan_output_pixels_are_replaced() {
        let d = derotation(0.);
        let section = section(&d);
        let stamp = vec![2.; section.len()];
        let mut output = Array2::<f64>::from_elem((31, 31), f64::NAN);
        accumulate(output.view_mut(), None, &section, &stamp, &d);
        let idx = section[0];
        assert_eq!(output[[idx / 31, idx % 31]], 2.);
    }

    #[test]
    fn shared_output_round_trip() {
        let output = SharedOutput::zeros(&[3, 2, 4], 1).unwrap();
        assert_eq!(output.n_frame(), 2);
        output
            .with_frame(1, |mut slab| slab[IxDyn(&[2, 3])] = 7.)
            .unwrap();
        assert!(output.with_frame(2, |_| ()).is_err());
        let array = output.into_array().unwrap();
        assert_eq!(array.shape(), &[3, 2, 4]);
        assert_eq!(array[IxDyn(&[2, 1, 3])], 7.);
        assert_eq!(array.iter().sum::<f64>(), 7.);
    }
}
