//! First order perturbation of the KL basis
//!
//! Injecting model stamps `M` into the reference images `R` changes their
//! covariance by `C' = M Rᵀ + R Mᵀ` at first order. The derivative of the
//! eigen-decomposition of `R Rᵀ` then gives the change `ΔZ` of the KL modes
//! `Z`, from which the forward model of a signal after KLIP subtraction is
//! built: the signal minus its projection on the KL modes (oversubtraction)
//! and minus the projection of the data on the perturbed modes
//! (self-subtraction).
//!
//! Conventions: the eigenvalues `λ` (length `k`) and the columns of the
//! eigenvectors `E` (`r × k`) are those of `R Rᵀ`, the KL modes are the rows
//! of `Z` (`k × p`), all three in the same order, the most significant mode
//! first. A KL cutoff `N` keeps the first `N` modes.

use nalgebra::{DMatrix, DVector};

#[derive(thiserror::Error, Debug)]
pub enum PerturbError {
    #[error("eigenvalue #{0} ({1}) is not positive")]
    NonPositiveEigenvalue(usize, f64),
    #[error("eigenvalues #{0} and #{1} are degenerate")]
    DegenerateEigenvalues(usize, usize),
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error("the reference set is empty")]
    NoReference,
}
type Result<T> = std::result::Result<T, PerturbError>;

/// Unperturbed KL basis of a reference set
#[derive(Debug, Clone, PartialEq)]
pub struct Eigenbasis {
    /// KL modes `[k × p]`
    pub klmodes: DMatrix<f64>,
    /// Eigenvalues `[k]`
    pub evals: DVector<f64>,
    /// Eigenvectors `[r × k]`
    pub evecs: DMatrix<f64>,
}
impl Eigenbasis {
    /// KL basis of the `[r × p]` reference images limited to `max_basis` modes
    ///
    /// The references are mean subtracted and NaN pixels set to zero.
    /// Modes with a non-positive eigenvalue are dropped.
    pub fn from_references(refs: &DMatrix<f64>, max_basis: usize) -> Result<Self> {
        let r = refs.nrows();
        if r == 0 {
            return Err(PerturbError::NoReference);
        }
        if max_basis > r {
            log::warn!("{max_basis} KL modes requested from {r} references");
        }
        let refs_ms = mean_subtracted_rows(refs);
        let covar = &refs_ms * refs_ms.transpose();
        let eigen = covar.symmetric_eigen();
        let mut order: Vec<usize> = (0..r).collect();
        order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));
        let tol = eigen.eigenvalues.amax() * f64::EPSILON * r as f64;
        let order: Vec<usize> = order
            .into_iter()
            .filter(|&i| eigen.eigenvalues[i] > tol)
            .take(max_basis.min(r))
            .collect();
        let k = order.len();
        if k == 0 {
            return Err(PerturbError::NonPositiveEigenvalue(0, eigen.eigenvalues.max()));
        }
        let evals = DVector::from_iterator(k, order.iter().map(|&i| eigen.eigenvalues[i]));
        let evecs = DMatrix::from_fn(r, k, |i, j| eigen.eigenvectors[(i, order[j])]);
        let mut klmodes = evecs.transpose() * &refs_ms;
        for (mut row, lambda) in klmodes.row_iter_mut().zip(evals.iter()) {
            row /= lambda.sqrt();
        }
        Ok(Self {
            klmodes,
            evals,
            evecs,
        })
    }
    /// Number of KL modes
    pub fn len(&self) -> usize {
        self.evals.len()
    }
    pub fn is_empty(&self) -> bool {
        self.evals.is_empty()
    }
    /// KLIP subtraction of a science stamp for each KL cutoff, `[p × cutoffs]`
    ///
    /// NaN pixels of the science stamp stay NaN.
    pub fn klip(&self, sci: &DVector<f64>, numbasis: &[usize]) -> DMatrix<f64> {
        let sci_ms = mean_subtracted(sci);
        let clean = sci_ms.map(|v| if v.is_nan() { 0. } else { v });
        let coefs = &self.klmodes * &clean;
        let cutoffs = clip_cutoffs(numbasis, self.len());
        let mut klipped = DMatrix::<f64>::zeros(sci.len(), numbasis.len());
        for (c, &n) in cutoffs.iter().enumerate() {
            let mut residual = clean.clone();
            for i in 0..n {
                residual.axpy(-coefs[i], &self.klmodes.row(i).transpose(), 1.);
            }
            for (j, v) in residual.iter().enumerate() {
                klipped[(j, c)] = if sci_ms[j].is_nan() { f64::NAN } else { *v };
            }
        }
        klipped
    }
    fn check(&self, refs: &DMatrix<f64>, models: &DMatrix<f64>) -> Result<()> {
        let (k, p) = self.klmodes.shape();
        let r = refs.nrows();
        if self.evals.len() != k || self.evecs.ncols() != k {
            return Err(PerturbError::Shape(format!(
                "{} eigenvalues and {} eigenvectors for {k} KL modes",
                self.evals.len(),
                self.evecs.ncols()
            )));
        }
        if self.evecs.nrows() != r || models.nrows() != r {
            return Err(PerturbError::Shape(format!(
                "{} eigenvector rows, {r} references and {} models",
                self.evecs.nrows(),
                models.nrows()
            )));
        }
        if refs.ncols() != p || models.ncols() != p {
            return Err(PerturbError::Shape(format!(
                "{p} pixels per KL mode, {} per reference and {} per model",
                refs.ncols(),
                models.ncols()
            )));
        }
        for (i, lambda) in self.evals.iter().enumerate() {
            if !(*lambda > 0.) {
                return Err(PerturbError::NonPositiveEigenvalue(i, *lambda));
            }
        }
        for i in 0..k {
            for j in i + 1..k {
                if self.evals[i] == self.evals[j] {
                    return Err(PerturbError::DegenerateEigenvalues(i, j));
                }
            }
        }
        Ok(())
    }
    // β with βᵢⱼ = √(λⱼ/λᵢ) / (λᵢ - λⱼ) and βᵢᵢ = -1 / (2λᵢ)
    fn beta(&self) -> DMatrix<f64> {
        let l = &self.evals;
        let k = l.len();
        DMatrix::from_fn(k, k, |i, j| {
            let ratio = (l[j] / l[i]).sqrt();
            if i == j {
                -0.5 / l[i]
            } else {
                ratio / (l[i] - l[j])
            }
        })
    }
}

/// Rows mean subtracted (NaN-aware) with NaN set to zero
pub fn mean_subtracted_rows(m: &DMatrix<f64>) -> DMatrix<f64> {
    let mut out = m.clone();
    for mut row in out.row_iter_mut() {
        let mean = nan_mean(row.iter().copied());
        row.apply(|v| *v = if v.is_nan() { 0. } else { *v - mean });
    }
    out
}

/// Vector minus its NaN-aware mean, NaN kept
pub fn mean_subtracted(v: &DVector<f64>) -> DVector<f64> {
    let mean = nan_mean(v.iter().copied());
    v.map(|x| x - mean)
}

pub(crate) fn nan_mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values
        .filter(|v| !v.is_nan())
        .fold((0f64, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.
    } else {
        sum / n as f64
    }
}

fn zero_nans(m: &DMatrix<f64>) -> DMatrix<f64> {
    m.map(|v| if v.is_nan() { 0. } else { v })
}

/// Number of modes kept by each cutoff, clipped to `[1, k]`
fn clip_cutoffs(numbasis: &[usize], k: usize) -> Vec<usize> {
    let clipped: Vec<usize> = numbasis.iter().map(|n| (*n).clamp(1, k.max(1))).collect();
    if clipped.iter().zip(numbasis).any(|(c, n)| c != n) {
        log::warn!("KL cutoffs {numbasis:?} clipped to {clipped:?} for a basis of {k} modes");
    }
    clipped
}

/// Perturbation of the KL modes
#[derive(Debug, Clone)]
pub struct Perturbation {
    /// `ΔZ` `[k × p]`
    pub delta_kl: DMatrix<f64>,
    /// Covariance perturbation `C'` `[r × r]`, if requested
    pub covariance: Option<DMatrix<f64>>,
}

/// Perturbation of the KL modes by the reference model stamps `models` (`[r × p]`)
///
/// Returns exactly zero when every model stamp is zero.
pub fn perturb_spec_included(
    basis: &Eigenbasis,
    refs: &DMatrix<f64>,
    models: &DMatrix<f64>,
    with_covariance: bool,
) -> Result<Perturbation> {
    basis.check(refs, models)?;
    let (k, p) = basis.klmodes.shape();
    let r = refs.nrows();
    let models = zero_nans(models);
    if models.iter().all(|v| *v == 0.) {
        return Ok(Perturbation {
            delta_kl: DMatrix::zeros(k, p),
            covariance: with_covariance.then(|| DMatrix::zeros(r, r)),
        });
    }
    let refs_ms = mean_subtracted_rows(refs);
    let partial = &models * refs_ms.transpose();
    let covariance = &partial + partial.transpose();
    let alpha = basis.evecs.transpose() * &covariance * &basis.evecs;
    let mut delta_kl = basis.beta().component_mul(&alpha) * &basis.klmodes;
    let mut projection = basis.evecs.transpose();
    for (mut row, lambda) in projection.row_iter_mut().zip(basis.evals.iter()) {
        row /= lambda.sqrt();
    }
    delta_kl += projection * &models;
    Ok(Perturbation {
        delta_kl,
        covariance: with_covariance.then_some(covariance),
    })
}

/// Perturbations of the KL modes by the model stamp of each reference taken alone
///
/// The `j`-th matrix is the perturbation when only the `j`-th row of `models`
/// is injected; their sum is the perturbation of [perturb_spec_included].
pub fn perturb_per_reference(
    basis: &Eigenbasis,
    refs: &DMatrix<f64>,
    models: &DMatrix<f64>,
) -> Result<Vec<DMatrix<f64>>> {
    basis.check(refs, models)?;
    let (k, p) = basis.klmodes.shape();
    let models = zero_nans(models);
    let refs_ms = mean_subtracted_rows(refs);
    let beta = basis.beta();
    let inv_sqrt = basis.evals.map(|l| 1. / l.sqrt());
    // c[:, j] = R m_j
    let c = &refs_ms * models.transpose();
    let v_all = basis.evecs.transpose() * &c;
    Ok((0..refs.nrows())
        .map(|j| {
            let m = models.row(j);
            if m.iter().all(|v| *v == 0.) {
                return DMatrix::zeros(k, p);
            }
            let u = basis.evecs.row(j).transpose();
            let v = v_all.column(j);
            let alpha = &u * v.transpose() + v * u.transpose();
            let mut delta = beta.component_mul(&alpha) * &basis.klmodes;
            delta += u.component_mul(&inv_sqrt) * m;
            delta
        })
        .collect())
}

/// Forward model terms per KL cutoff, one row per cutoff
#[derive(Debug, Clone, PartialEq)]
pub struct FmTerms {
    /// Model after KLIP subtraction
    pub postklip: DMatrix<f64>,
    pub oversubtraction: DMatrix<f64>,
    pub selfsubtraction: DMatrix<f64>,
}

// Runs `f(mode, cutoff index)` for every mode and stores the running sum after
// each cutoff, cutoffs visited in ascending order.
fn cumulative<F>(cutoffs: &[usize], k: usize, p: usize, mut mode: F) -> DMatrix<f64>
where
    F: FnMut(usize, &mut DVector<f64>),
{
    let mut order: Vec<usize> = (0..cutoffs.len()).collect();
    order.sort_by_key(|&c| cutoffs[c]);
    let mut out = DMatrix::<f64>::zeros(cutoffs.len(), p);
    let mut acc = DVector::<f64>::zeros(p);
    let mut next = 0;
    for c in order {
        let n = cutoffs[c].min(k);
        while next < n {
            mode(next, &mut acc);
            next += 1;
        }
        out.set_row(c, &acc.transpose());
    }
    out
}

/// Forward modelled oversubtraction and self-subtraction of `model_sci` for each KL cutoff
///
/// `sci` is the science stamp the basis subtracts the PSF from, `model_sci` the
/// model stamp in the science frame.
pub fn calculate_fm(
    delta_kl: &DMatrix<f64>,
    klmodes: &DMatrix<f64>,
    numbasis: &[usize],
    sci: &DVector<f64>,
    model_sci: &DVector<f64>,
) -> Result<FmTerms> {
    let (k, p) = klmodes.shape();
    if delta_kl.shape() != (k, p) || sci.len() != p || model_sci.len() != p {
        return Err(PerturbError::Shape(format!(
            "ΔZ {:?}, Z {:?}, {} science and {} model pixels",
            delta_kl.shape(),
            (k, p),
            sci.len(),
            model_sci.len()
        )));
    }
    let cutoffs = clip_cutoffs(numbasis, k);
    let sci_ms = mean_subtracted(sci).map(|v| if v.is_nan() { 0. } else { v });
    let model = model_sci.map(|v| if v.is_nan() { 0. } else { v });
    let over_ip = klmodes * &model;
    let delta_ip = delta_kl * &sci_ms;
    let sci_ip = klmodes * &sci_ms;
    let oversubtraction = cumulative(&cutoffs, k, p, |i, acc| {
        acc.axpy(over_ip[i], &klmodes.row(i).transpose(), 1.)
    });
    let selfsubtraction = cumulative(&cutoffs, k, p, |i, acc| {
        acc.axpy(delta_ip[i], &klmodes.row(i).transpose(), 1.);
        acc.axpy(sci_ip[i], &delta_kl.row(i).transpose(), 1.);
    });
    let mut postklip = DMatrix::from_fn(numbasis.len(), p, |_, j| model[j]);
    postklip -= &oversubtraction;
    postklip -= &selfsubtraction;
    Ok(FmTerms {
        postklip,
        oversubtraction,
        selfsubtraction,
    })
}

/// Forward model terms with the self-subtraction kept per reference
#[derive(Debug, Clone)]
pub struct PerReferenceTerms {
    /// `[cutoffs × p]`
    pub oversubtraction: DMatrix<f64>,
    /// One `[cutoffs × p]` matrix per reference
    pub selfsubtraction: Vec<DMatrix<f64>>,
}

/// Per reference version of [calculate_fm] for the perturbations of [perturb_per_reference]
pub fn calculate_fm_per_reference(
    delta_kls: &[DMatrix<f64>],
    klmodes: &DMatrix<f64>,
    numbasis: &[usize],
    sci: &DVector<f64>,
    model_sci: &DVector<f64>,
) -> Result<PerReferenceTerms> {
    let (k, p) = klmodes.shape();
    if sci.len() != p || model_sci.len() != p || delta_kls.iter().any(|d| d.shape() != (k, p)) {
        return Err(PerturbError::Shape(format!(
            "Z {:?}, {} science and {} model pixels",
            (k, p),
            sci.len(),
            model_sci.len()
        )));
    }
    let cutoffs = clip_cutoffs(numbasis, k);
    let sci_ms = mean_subtracted(sci).map(|v| if v.is_nan() { 0. } else { v });
    let model = model_sci.map(|v| if v.is_nan() { 0. } else { v });
    let over_ip = klmodes * &model;
    let sci_ip = klmodes * &sci_ms;
    let oversubtraction = cumulative(&cutoffs, k, p, |i, acc| {
        acc.axpy(over_ip[i], &klmodes.row(i).transpose(), 1.)
    });
    let selfsubtraction = delta_kls
        .iter()
        .map(|delta_kl| {
            if delta_kl.iter().all(|v| *v == 0.) {
                return DMatrix::zeros(numbasis.len(), p);
            }
            let delta_ip = delta_kl * &sci_ms;
            cumulative(&cutoffs, k, p, |i, acc| {
                acc.axpy(delta_ip[i], &klmodes.row(i).transpose(), 1.);
                acc.axpy(sci_ip[i], &delta_kl.row(i).transpose(), 1.);
            })
        })
        .collect();
    Ok(PerReferenceTerms {
        oversubtraction,
        selfsubtraction,
    })
}

/// Size of the perturbation relative to the noise of the KLIP subtracted image, per KL cutoff
///
/// `max |oversubtraction + selfsubtraction| / std(sci - klipped)` where
/// `klipped` is `[p × cutoffs]`; large values flag a model too bright for
/// the first order approximation.
pub fn perturbation_fraction(
    terms: &FmTerms,
    sci: &DVector<f64>,
    klipped: &DMatrix<f64>,
) -> Vec<f64> {
    let sci_ms = mean_subtracted(sci);
    (0..terms.oversubtraction.nrows())
        .map(|c| {
            let magnitude = terms
                .oversubtraction
                .row(c)
                .iter()
                .zip(terms.selfsubtraction.row(c).iter())
                .map(|(o, s)| (o + s).abs())
                .filter(|v| !v.is_nan())
                .fold(0f64, f64::max);
            let pca: Vec<f64> = if c < klipped.ncols() {
                sci_ms
                    .iter()
                    .zip(klipped.column(c).iter())
                    .map(|(s, k)| s - k)
                    .filter(|v| !v.is_nan())
                    .collect()
            } else {
                vec![]
            };
            let n = pca.len() as f64;
            let mean = pca.iter().sum::<f64>() / n;
            let std = (pca.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
            magnitude / std
        })
        .collect()
}
