//! KLIP reduction parameters
//!
//! [KlipConfig] gathers the parameters shared by every forward model:
//! the working angles, the section tiling, the KL mode cutoffs and the
//! worker pool size.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

/// Environment variable overriding the worker pool size
pub const NUMTHREADS_ENV: &str = "KLIPFM_NUMTHREADS";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid value {1:?} for {0}")]
    InvalidEnv(&'static str, String),
    #[error("the inner working angle ({iwa}) must be smaller than the outer working angle ({owa})")]
    WorkingAngles { iwa: f64, owa: f64 },
    #[error("at least one annulus and one subsection are required")]
    EmptyTiling,
    #[error("no KL mode cutoff was given")]
    EmptyNumbasis,
}

/// Spacing of the annuli between the working angles
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumIter,
    EnumString,
    Display,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AnnulusSpacing {
    /// Equal radial width
    #[default]
    Constant,
    /// Logarithmically spaced radii
    Log,
    /// Width growing linearly with the annulus index
    Linear,
}

/// What happens to pixels that are NaN in the KLIP-subtracted science image
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumIter,
    EnumString,
    Display,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NanPolicy {
    /// The forward model is NaN wherever the data is
    #[default]
    Propagate,
    /// NaN pixels of the data are ignored
    Zero,
}

/// KLIP reduction parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KlipConfig {
    /// Inner working angle [pixel]
    pub iwa: f64,
    /// Outer working angle [pixel], the largest radius in the image if `None`
    pub owa: Option<f64>,
    pub annuli: usize,
    pub annulus_spacing: AnnulusSpacing,
    pub subsections: usize,
    /// Section padding [pixel]
    pub padding: f64,
    /// KL mode cutoffs
    pub numbasis: Vec<usize>,
    /// Worker pool size, the number of logical cores if `None`
    pub numthreads: Option<usize>,
    /// Right-handed (`true`) or left-handed sky coordinates
    pub flipx: bool,
    /// Common center of the aligned images, the image middle if `None`
    pub aligned_center: Option<[f64; 2]>,
    pub nan_policy: NanPolicy,
    /// Display a progress bar over the KLIP units
    pub progress: bool,
}
impl Default for KlipConfig {
    fn default() -> Self {
        Self {
            iwa: 0f64,
            owa: None,
            annuli: 5,
            annulus_spacing: AnnulusSpacing::default(),
            subsections: 4,
            padding: 3f64,
            numbasis: vec![1, 5, 10, 20, 50],
            numthreads: None,
            flipx: true,
            aligned_center: None,
            nan_policy: NanPolicy::default(),
            progress: false,
        }
    }
}
impl KlipConfig {
    /// Default configuration with the worker pool size read from `KLIPFM_NUMTHREADS`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(value) = std::env::var(NUMTHREADS_ENV) {
            let n = value
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ConfigError::InvalidEnv(NUMTHREADS_ENV, value.clone()))?;
            log::debug!("{NUMTHREADS_ENV}={n}");
            config.numthreads = Some(n);
        }
        Ok(config)
    }
    pub fn iwa(mut self, iwa: f64) -> Self {
        self.iwa = iwa;
        self
    }
    pub fn owa(mut self, owa: f64) -> Self {
        self.owa = Some(owa);
        self
    }
    pub fn annuli(mut self, annuli: usize) -> Self {
        self.annuli = annuli;
        self
    }
    pub fn annulus_spacing(mut self, spacing: AnnulusSpacing) -> Self {
        self.annulus_spacing = spacing;
        self
    }
    pub fn subsections(mut self, subsections: usize) -> Self {
        self.subsections = subsections;
        self
    }
    pub fn padding(mut self, padding: f64) -> Self {
        self.padding = padding;
        self
    }
    pub fn numbasis(mut self, numbasis: Vec<usize>) -> Self {
        self.numbasis = numbasis;
        self
    }
    pub fn numthreads(mut self, n: usize) -> Self {
        self.numthreads = Some(n);
        self
    }
    pub fn flipx(mut self, flipx: bool) -> Self {
        self.flipx = flipx;
        self
    }
    pub fn aligned_center(mut self, center: [f64; 2]) -> Self {
        self.aligned_center = Some(center);
        self
    }
    pub fn nan_policy(mut self, policy: NanPolicy) -> Self {
        self.nan_policy = policy;
        self
    }
    pub fn progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }
    /// Worker pool size
    pub fn threads(&self) -> usize {
        self.numthreads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
    /// Outer working angle for images of the given `(ny, nx)` shape centered at `center`
    ///
    /// Without an explicit outer working angle, it is the distance from the
    /// center to the farthest image corner.
    pub fn outer_working_angle(&self, shape: (usize, usize), center: [f64; 2]) -> f64 {
        self.owa.unwrap_or_else(|| {
            let (ny, nx) = shape;
            let corners = [
                (0f64, 0f64),
                (nx as f64 - 1., 0.),
                (0., ny as f64 - 1.),
                (nx as f64 - 1., ny as f64 - 1.),
            ];
            corners
                .into_iter()
                .map(|(x, y)| (x - center[0]).hypot(y - center[1]))
                .fold(0f64, f64::max)
        })
    }
    /// Checks the consistency of the parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.annuli == 0 || self.subsections == 0 {
            return Err(ConfigError::EmptyTiling);
        }
        if self.numbasis.is_empty() {
            return Err(ConfigError::EmptyNumbasis);
        }
        if let Some(owa) = self.owa {
            if owa <= self.iwa {
                return Err(ConfigError::WorkingAngles { iwa: self.iwa, owa });
            }
        }
        Ok(())
    }
}
