//! Annulus and sector partition of the image plane
//!
//! Angles are in radians, measured counter-clockwise from the +x axis of the
//! image (column index), and radii are in pixels from the alignment center.
//! Pixel indices are flat row-major indices `row * nx + col`.

use std::f64::consts::{FRAC_PI_2, TAU};

use serde::{Deserialize, Serialize};

use crate::config::{AnnulusSpacing, KlipConfig};

#[derive(thiserror::Error, Debug)]
pub enum GeometryError {
    #[error("the section {0:?} has no pixel")]
    EmptySection(SectionBounds),
    #[error("{annuli} annuli do not fit between {iwa} and {owa} pixels")]
    TooManyAnnuli { annuli: usize, iwa: f64, owa: f64 },
    #[error("logarithmic annuli need a positive inner working angle")]
    LogSpacingFromZero,
    #[error("invalid configuration")]
    Config(#[from] crate::config::ConfigError),
}
type Result<T> = std::result::Result<T, GeometryError>;

/// Inner and outer working angles [pixel]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkingAngles {
    pub inner: f64,
    pub outer: f64,
}
impl WorkingAngles {
    pub fn new(inner: f64, outer: f64) -> Self {
        Self { inner, outer }
    }
}

/// Radial and azimuthal bounds of a section
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SectionBounds {
    pub radstart: f64,
    pub radend: f64,
    pub phistart: f64,
    pub phiend: f64,
}
impl SectionBounds {
    pub fn new(radstart: f64, radend: f64, phistart: f64, phiend: f64) -> Self {
        Self {
            radstart,
            radend,
            phistart,
            phiend,
        }
    }
    /// Full annulus between 2 radii
    pub fn annulus(radstart: f64, radend: f64) -> Self {
        Self::new(radstart, radend, 0., TAU)
    }
    /// Flat indices of the pixels of a `(ny, nx)` image inside the section
    ///
    /// The bounds are enlarged by `padding` pixels, radially within the
    /// working angles, and azimuthally by the angle the padding subtends at the
    /// mid radius. The sector is rotated by `parang` [rad]. When the padded start
    /// angle is larger than the end angle, the sector wraps through 0 and the
    /// pixels of both angular ranges are selected.
    pub fn pixels(
        &self,
        shape: (usize, usize),
        center: [f64; 2],
        padding: f64,
        parang: f64,
        angles: WorkingAngles,
        flipx: bool,
    ) -> Vec<usize> {
        let (ny, nx) = shape;
        (0..ny)
            .flat_map(|row| (0..nx).map(move |col| (row, col)))
            .filter(|&(row, col)| {
                self.contains(
                    col as f64, row as f64, center, padding, parang, angles, flipx,
                )
            })
            .map(|(row, col)| row * nx + col)
            .collect()
    }
    /// Whether the image position `(x, y)` lies in the section
    ///
    /// Same conventions as [SectionBounds::pixels], for any sub-pixel position.
    #[allow(clippy::too_many_arguments)]
    pub fn contains(
        &self,
        x: f64,
        y: f64,
        center: [f64; 2],
        padding: f64,
        parang: f64,
        angles: WorkingAngles,
        flipx: bool,
    ) -> bool {
        let [cx, cy] = center;
        let radstart = (self.radstart - padding).max(angles.inner);
        let radend = (self.radend + padding).min(angles.outer);
        let x = if flipx { cx - x } else { x - cx };
        let y = y - cy;
        let r = x.hypot(y);
        if r < radstart || r >= radend {
            return false;
        }
        if (self.phiend - self.phistart) >= TAU - 1e-12 {
            return true;
        }
        let dphi = padding / (0.5 * (self.radstart + self.radend));
        let phistart = (self.phistart - dphi + parang).rem_euclid(TAU);
        let phiend = (self.phiend + dphi + parang).rem_euclid(TAU);
        let phi = y.atan2(x).rem_euclid(TAU);
        if phistart < phiend {
            phi >= phistart && phi < phiend
        } else {
            phi >= phistart || phi < phiend
        }
    }
    /// Sky pixels whose position in a frame of parallactic angle `parang` [deg] lies in the section
    ///
    /// A source at position angle `pa` (East of North, North up) is seen in
    /// the frame at the polar angle `pa + 90° ± parang` of [SectionBounds::pixels],
    /// the sign given by the handedness. Returns `(row, col, separation, position angle [deg])`.
    pub fn candidates(
        &self,
        shape: (usize, usize),
        center: [f64; 2],
        parang: f64,
        flipx: bool,
    ) -> Vec<(usize, usize, f64, f64)> {
        let (ny, nx) = shape;
        let [cx, cy] = center;
        let sign = if flipx { 1. } else { -1. };
        let rotation = FRAC_PI_2 + sign * parang.to_radians();
        let full = (self.phiend - self.phistart) >= TAU - 1e-12;
        let phistart = self.phistart.rem_euclid(TAU);
        let phiend = self.phiend.rem_euclid(TAU);
        let mut candidates = vec![];
        for row in 0..ny {
            let y = row as f64 - cy;
            for col in 0..nx {
                let x = col as f64 - cx;
                let r = x.hypot(y);
                if r < self.radstart || r >= self.radend {
                    continue;
                }
                let pa = (-x).atan2(y).rem_euclid(TAU);
                let phi = (pa + rotation).rem_euclid(TAU);
                let inside = full
                    || if phistart < phiend {
                        phi >= phistart && phi < phiend
                    } else {
                        phi >= phistart || phi < phiend
                    };
                if inside {
                    candidates.push((row, col, r, pa.to_degrees()));
                }
            }
        }
        candidates
    }
}

/// A section bounds with its resolved pixel set
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub bounds: SectionBounds,
    pub padding: f64,
    pub indices: Vec<usize>,
}
impl Section {
    /// Resolves the pixel set of the section at zero parallactic angle
    pub fn resolve(
        bounds: SectionBounds,
        padding: f64,
        shape: (usize, usize),
        center: [f64; 2],
        angles: WorkingAngles,
        flipx: bool,
    ) -> Result<Self> {
        let indices = bounds.pixels(shape, center, padding, 0., angles, flipx);
        if indices.is_empty() {
            return Err(GeometryError::EmptySection(bounds));
        }
        Ok(Self {
            bounds,
            padding,
            indices,
        })
    }
    /// Archive key of the section for a target frame
    pub fn key(&self, frame: usize) -> String {
        section_key(self.indices.first().copied().unwrap_or_default(), frame)
    }
    pub fn len(&self) -> usize {
        self.indices.len()
    }
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// `"idsec<first pixel>i<frame index>"` with the frame index zero-padded to 3 digits
pub fn section_key(first_pixel: usize, frame: usize) -> String {
    format!("idsec{first_pixel}i{frame:03}")
}

/// Radial bounds of the annuli between the working angles
pub fn annuli_bounds(
    annuli: usize,
    angles: WorkingAngles,
    spacing: AnnulusSpacing,
) -> Result<Vec<(f64, f64)>> {
    let WorkingAngles {
        inner: iwa,
        outer: owa,
    } = angles;
    let mut edges: Vec<f64> = match spacing {
        AnnulusSpacing::Constant => {
            let dr = (owa - iwa) / annuli as f64;
            (0..=annuli).map(|i| iwa + dr * i as f64).collect()
        }
        AnnulusSpacing::Log => {
            if iwa <= 0. {
                return Err(GeometryError::LogSpacingFromZero);
            }
            let (start, end) = (iwa.log10(), owa.log10());
            let step = (end - start) / annuli as f64;
            (0..=annuli)
                .map(|i| 10f64.powf(start + step * i as f64))
                .collect()
        }
        AnnulusSpacing::Linear => {
            // widths dr, 2dr, ..., annuli * dr
            let dr = (owa - iwa) / (annuli * (annuli + 1) / 2) as f64;
            if dr < 1. {
                return Err(GeometryError::TooManyAnnuli { annuli, iwa, owa });
            }
            (0..=annuli)
                .map(|i| iwa + dr * (i * (i + 1) / 2) as f64)
                .collect()
        }
    };
    edges[0] = iwa;
    edges[annuli] = owa;
    Ok(edges.windows(2).map(|w| (w[0], w[1])).collect())
}

/// Azimuthal bounds of the sectors covering `[0, 2π)`
pub fn sector_bounds(subsections: usize) -> Vec<(f64, f64)> {
    let dphi = TAU / subsections as f64;
    (0..subsections)
        .map(|i| {
            let end = if i + 1 == subsections {
                TAU
            } else {
                dphi * (i + 1) as f64
            };
            (dphi * i as f64, end)
        })
        .collect()
}

/// Sections bounds tiling `[IWA, OWA) × [0, 2π)`, annulus by annulus
pub fn tile(
    annuli: usize,
    subsections: usize,
    angles: WorkingAngles,
    spacing: AnnulusSpacing,
) -> Result<Vec<SectionBounds>> {
    let radii = annuli_bounds(annuli, angles, spacing)?;
    let sectors = sector_bounds(subsections);
    Ok(radii
        .iter()
        .flat_map(|&(radstart, radend)| {
            sectors.iter().map(move |&(phistart, phiend)| {
                SectionBounds::new(radstart, radend, phistart, phiend)
            })
        })
        .collect())
}

/// Resolved sections of the configuration for `(ny, nx)` images aligned on `center`
///
/// Sections without any pixel are skipped with a warning.
pub fn sections(
    config: &KlipConfig,
    shape: (usize, usize),
    center: [f64; 2],
) -> Result<Vec<Section>> {
    config.validate()?;
    let angles = WorkingAngles::new(config.iwa, config.outer_working_angle(shape, center));
    let bounds = tile(config.annuli, config.subsections, angles, config.annulus_spacing)?;
    let mut sections = Vec::with_capacity(bounds.len());
    for b in bounds {
        match Section::resolve(b, config.padding, shape, center, angles, config.flipx) {
            Ok(section) => sections.push(section),
            Err(GeometryError::EmptySection(b)) => log::warn!("skipping empty section {b:?}"),
            Err(e) => return Err(e),
        }
    }
    Ok(sections)
}

/// Cartesian offset `(dx, dy)` [pixel] of a source at separation `sep` [pixel] and
/// position angle `pa` [deg] in an exposure with parallactic angle `parang` [deg]
pub fn source_offset(sep: f64, pa: f64, parang: f64, flipx: bool) -> (f64, f64) {
    let sign = if flipx { 1. } else { -1. };
    let theta = (90. - sign * pa - parang).to_radians();
    (sep * theta.cos(), sep * theta.sin())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    const SHAPE: (usize, usize) = (41, 41);
    const CENTER: [f64; 2] = [20., 20.];

    fn angles() -> WorkingAngles {
        WorkingAngles::new(2., 20.)
    }

    #[test]
    fn wrapping_sector_is_the_union_of_two_sectors() {
        let wrap = SectionBounds::new(5., 15., 300f64.to_radians(), 60f64.to_radians());
        let upper = SectionBounds::new(5., 15., 300f64.to_radians(), TAU);
        let lower = SectionBounds::new(5., 15., 0., 60f64.to_radians());
        let wrapped: BTreeSet<usize> =
            wrap.pixels(SHAPE, CENTER, 0., 0., angles(), false).into_iter().collect();
        let union: BTreeSet<usize> = upper
            .pixels(SHAPE, CENTER, 0., 0., angles(), false)
            .into_iter()
            .chain(lower.pixels(SHAPE, CENTER, 0., 0., angles(), false))
            .collect();
        assert!(!wrapped.is_empty());
        assert_eq!(wrapped, union);
    }

    #[test]
    fn deterministic_pixels() {
        let b = SectionBounds::new(4., 9., 0.3, 2.1);
        let a = b.pixels(SHAPE, CENTER, 1.5, 0.4, angles(), true);
        let c = b.pixels(SHAPE, CENTER, 1.5, 0.4, angles(), true);
        assert_eq!(a, c);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn tiling_covers_the_working_area() {
        let bounds = tile(3, 4, angles(), AnnulusSpacing::Constant).unwrap();
        assert_eq!(bounds.len(), 12);
        let all: BTreeSet<usize> = bounds
            .iter()
            .flat_map(|b| b.pixels(SHAPE, CENTER, 0., 0., angles(), false))
            .collect();
        let count: usize = bounds
            .iter()
            .map(|b| b.pixels(SHAPE, CENTER, 0., 0., angles(), false).len())
            .sum();
        assert_eq!(all.len(), count);
        let annulus =
            SectionBounds::annulus(2., 20.).pixels(SHAPE, CENTER, 0., 0., angles(), false);
        assert_eq!(annulus.len(), count);
    }

    #[test]
    fn spacings() {
        for spacing in [AnnulusSpacing::Constant, AnnulusSpacing::Log, AnnulusSpacing::Linear] {
            let radii = annuli_bounds(3, angles(), spacing).unwrap();
            assert_eq!(radii.len(), 3);
            assert_eq!(radii[0].0, 2.);
            assert_eq!(radii[2].1, 20.);
            assert!(radii.windows(2).all(|w| w[0].1 == w[1].0));
        }
        let linear = annuli_bounds(3, angles(), AnnulusSpacing::Linear).unwrap();
        assert!((linear[1].1 - linear[1].0 - 2. * (linear[0].1 - linear[0].0)).abs() < 1e-12);
    }

    #[test]
    fn too_many_annuli() {
        assert!(matches!(
            annuli_bounds(10, angles(), AnnulusSpacing::Linear),
            Err(GeometryError::TooManyAnnuli { .. })
        ));
    }

    #[test]
    fn empty_section() {
        let b = SectionBounds::new(10., 12., 0., FRAC_PI_2);
        assert!(matches!(
            Section::resolve(b, 0., (4, 4), [1.5, 1.5], angles(), false),
            Err(GeometryError::EmptySection(_))
        ));
    }

    #[test]
    fn key_format() {
        assert_eq!(section_key(1234, 7), "idsec1234i007");
        assert_eq!(section_key(5, 1234), "idsec5i1234");
    }

    #[test]
    fn offset_at_zero_parang() {
        let (dx, dy) = source_offset(10., 0., 0., true);
        assert!(dx.abs() < 1e-12);
        assert!((dy - 10.).abs() < 1e-12);
        // the frame of a right-handed sky is flipped at derotation
        let (dx, _) = source_offset(10., 90., 0., true);
        assert!((dx - 10.).abs() < 1e-12);
        let (dx, _) = source_offset(10., 90., 0., false);
        assert!((dx + 10.).abs() < 1e-12);
    }

    #[test]
    fn candidates_fall_in_the_section() {
        let b = SectionBounds::new(6., 12., 0.3, 1.9);
        for (parang, flipx) in [(0., true), (35., true), (-50., false)] {
            let candidates = b.candidates(SHAPE, CENTER, parang, flipx);
            assert!(!candidates.is_empty());
            for (_, _, sep, pa) in candidates {
                let (dx, dy) = source_offset(sep, pa, parang, flipx);
                let x = if flipx { -dx } else { dx };
                let phi = dy.atan2(x).rem_euclid(TAU);
                assert!(phi >= 0.3 - 1e-9 && phi < 1.9 + 1e-9, "{parang} {flipx}: {phi}");
            }
        }
    }
}
