//! Image interpolation
//!
//! Natural cubic splines sample the empirical PSF at sub-pixel positions and
//! cubic convolution resamples images for rotation and alignment.
//! Coordinates are `(x, y)` = `(column, row)`.

use ndarray::{Array2, ArrayView2, Axis};

/// Natural cubic spline through samples at unit spacing
#[derive(Debug, Clone)]
struct NaturalSpline {
    values: Vec<f64>,
    // second derivatives at the nodes
    curvature: Vec<f64>,
}
impl NaturalSpline {
    fn new(values: Vec<f64>) -> Self {
        let n = values.len();
        let mut curvature = vec![0f64; n];
        if n > 2 {
            // Thomas algorithm on M[i-1] + 4 M[i] + M[i+1] = 6 (y[i+1] - 2 y[i] + y[i-1])
            let m = n - 2;
            let mut c = vec![0f64; m];
            let mut d = vec![0f64; m];
            for i in 0..m {
                let rhs = 6. * (values[i + 2] - 2. * values[i + 1] + values[i]);
                let (cp, dp) = if i == 0 { (0., 0.) } else { (c[i - 1], d[i - 1]) };
                let denom = 4. - cp;
                c[i] = 1. / denom;
                d[i] = (rhs - dp) / denom;
            }
            for i in (0..m).rev() {
                let next = if i + 1 < m { curvature[i + 2] } else { 0. };
                curvature[i + 1] = d[i] - c[i] * next;
            }
        }
        Self { values, curvature }
    }
    /// Evaluates the spline at `u` in node units, clamped to the node range
    fn eval(&self, u: f64) -> f64 {
        let n = self.values.len();
        match n {
            0 => return 0.,
            1 => return self.values[0],
            _ => (),
        }
        let u = u.clamp(0., (n - 1) as f64);
        let i = (u.floor() as usize).min(n - 2);
        let t = u - i as f64;
        let s = 1. - t;
        s * self.values[i]
            + t * self.values[i + 1]
            + ((s * s * s - s) * self.curvature[i] + (t * t * t - t) * self.curvature[i + 1]) / 6.
    }
}

/// Tensor-product natural cubic spline of an image
///
/// The nodes are at `x0 + i` along the columns and `y0 + j` along the rows.
#[derive(Debug, Clone)]
pub struct BicubicSpline {
    x0: f64,
    y0: f64,
    rows: Vec<NaturalSpline>,
}
impl BicubicSpline {
    /// Spline of `image` with the node `(0, 0)` at the array position `(x0, y0)` offset
    pub fn new(image: ArrayView2<f64>, x0: f64, y0: f64) -> Self {
        let rows = image
            .axis_iter(Axis(0))
            .map(|row| {
                NaturalSpline::new(row.iter().map(|v| if v.is_nan() { 0. } else { *v }).collect())
            })
            .collect();
        Self { x0, y0, rows }
    }
    /// Spline of a PSF stamp with nodes at `arange(n) - n // 2` along each axis
    pub fn centered(psf: ArrayView2<f64>) -> Self {
        let (ny, nx) = psf.dim();
        Self::new(psf, -((nx / 2) as f64), -((ny / 2) as f64))
    }
    /// Samples the spline on the grid `xs` × `ys`, returning a `[ys.len(), xs.len()]` array
    pub fn grid(&self, xs: &[f64], ys: &[f64]) -> Array2<f64> {
        let mut out = Array2::<f64>::zeros((ys.len(), xs.len()));
        if self.rows.is_empty() {
            return out;
        }
        // interpolate every row at the requested columns, then along the columns
        let along_x: Vec<Vec<f64>> = self
            .rows
            .iter()
            .map(|row| xs.iter().map(|x| row.eval(x - self.x0)).collect())
            .collect();
        for (i, _) in xs.iter().enumerate() {
            let column = NaturalSpline::new(along_x.iter().map(|row| row[i]).collect());
            for (j, y) in ys.iter().enumerate() {
                out[[j, i]] = column.eval(y - self.y0);
            }
        }
        out
    }
    /// Samples the spline at a single position
    pub fn eval(&self, x: f64, y: f64) -> f64 {
        self.grid(&[x], &[y])[[0, 0]]
    }
}

/// Cubic convolution kernel weights (a = -0.5) for a fractional offset `t`
fn kernel(t: f64) -> [f64; 4] {
    const A: f64 = -0.5;
    let w = |d: f64| {
        let d = d.abs();
        if d <= 1. {
            (A + 2.) * d.powi(3) - (A + 3.) * d.powi(2) + 1.
        } else if d < 2. {
            A * d.powi(3) - 5. * A * d.powi(2) + 8. * A * d - 4. * A
        } else {
            0.
        }
    };
    [w(1. + t), w(t), w(1. - t), w(2. - t)]
}

/// Samples `image` at `(x, y)` by cubic convolution
///
/// Positions outside the image return NaN; the image border is replicated for
/// the kernel support.
pub fn sample(image: ArrayView2<f64>, x: f64, y: f64) -> f64 {
    const EPS: f64 = 1e-9;
    let (ny, nx) = image.dim();
    if nx == 0
        || ny == 0
        || x < -EPS
        || y < -EPS
        || x > (nx - 1) as f64 + EPS
        || y > (ny - 1) as f64 + EPS
    {
        return f64::NAN;
    }
    let (xf, yf) = (x.floor(), y.floor());
    let (wx, wy) = (kernel(x - xf), kernel(y - yf));
    let clip = |i: isize, n: usize| i.clamp(0, n as isize - 1) as usize;
    let mut value = 0f64;
    for (j, wyj) in wy.iter().enumerate() {
        if *wyj == 0. {
            continue;
        }
        let row = clip(yf as isize + j as isize - 1, ny);
        for (i, wxi) in wx.iter().enumerate() {
            if *wxi == 0. {
                continue;
            }
            let col = clip(xf as isize + i as isize - 1, nx);
            value += wyj * wxi * image[[row, col]];
        }
    }
    value
}

/// `true` if any of the 4 pixels surrounding `(x, y)` is NaN
pub fn contaminated(image: ArrayView2<f64>, x: f64, y: f64) -> bool {
    let (ny, nx) = image.dim();
    if nx == 0 || ny == 0 {
        return true;
    }
    let clip = |v: f64, n: usize| (v.max(0.) as usize).min(n - 1);
    let (x0, x1) = (clip(x.floor(), nx), clip(x.ceil(), nx));
    let (y0, y1) = (clip(y.floor(), ny), clip(y.ceil(), ny));
    [(y0, x0), (y0, x1), (y1, x0), (y1, x1)]
        .into_iter()
        .any(|(r, c)| image[[r, c]].is_nan())
}

/// Median of the finite values, `None` if there are none
pub fn nan_median(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let mut v: Vec<f64> = values.into_iter().filter(|x| !x.is_nan()).collect();
    if v.is_empty() {
        return None;
    }
    v.sort_by(f64::total_cmp);
    let n = v.len();
    Some(if n % 2 == 1 {
        v[n / 2]
    } else {
        0.5 * (v[n / 2 - 1] + v[n / 2])
    })
}

/// Copy of `image` with NaN pixels set to the median of the valid ones
pub fn fill_nans(image: ArrayView2<f64>) -> Array2<f64> {
    let median = nan_median(image.iter().copied()).unwrap_or(0.);
    image.mapv(|v| if v.is_nan() { median } else { v })
}

/// Rotation of the image plane about a center
///
/// An output pixel `(x, y)` samples the input at the position returned by
/// [Rotation::source], i.e. the image content is rotated counter-clockwise by
/// the angle. With `flipx`, the x axis is mirrored about the center first.
#[derive(Debug, Clone, Copy)]
pub struct Rotation {
    cos: f64,
    sin: f64,
    center: [f64; 2],
    flipx: bool,
}
impl Rotation {
    /// Rotation by `angle` [deg] about `center`
    pub fn new(angle: f64, center: [f64; 2], flipx: bool) -> Self {
        let (sin, cos) = angle.to_radians().sin_cos();
        Self {
            cos,
            sin,
            center,
            flipx,
        }
    }
    /// Input position sampled by the output pixel `(x, y)`
    pub fn source(&self, x: f64, y: f64) -> (f64, f64) {
        let [cx, cy] = self.center;
        let dx = if self.flipx { cx - x } else { x - cx };
        let dy = y - cy;
        (
            dx * self.cos + dy * self.sin + cx,
            -dx * self.sin + dy * self.cos + cy,
        )
    }
}

/// Rotates `image` by `angle` [deg] about `center`
///
/// Output pixels that fall outside the input or next to a NaN input pixel are NaN.
pub fn rotate(image: ArrayView2<f64>, angle: f64, center: [f64; 2], flipx: bool) -> Array2<f64> {
    let rotation = Rotation::new(angle, center, flipx);
    let filled = fill_nans(image);
    Array2::from_shape_fn(image.dim(), |(row, col)| {
        let (xp, yp) = rotation.source(col as f64, row as f64);
        if contaminated(image, xp, yp) {
            f64::NAN
        } else {
            sample(filled.view(), xp, yp)
        }
    })
}

/// Moves `image` from `old_center` to `new_center` and magnifies it by `scale` about the center
///
/// A wavelength ratio `ref_wv / wv` as `scale` brings the diffraction pattern
/// of an exposure at `wv` to the one at `ref_wv`.
pub fn align_and_scale(
    image: ArrayView2<f64>,
    new_center: [f64; 2],
    old_center: [f64; 2],
    scale: f64,
) -> Array2<f64> {
    let filled = fill_nans(image);
    Array2::from_shape_fn(image.dim(), |(row, col)| {
        let xp = (col as f64 - new_center[0]) / scale + old_center[0];
        let yp = (row as f64 - new_center[1]) / scale + old_center[1];
        if contaminated(image, xp, yp) {
            f64::NAN
        } else {
            sample(filled.view(), xp, yp)
        }
    })
}
