use klip_fm::perturb::{calculate_fm, perturb_spec_included, Eigenbasis};
use nalgebra::{DMatrix, DVector};
use rand::{rngs::StdRng, Rng, SeedableRng};

// 5 references summing to zero over the reference set
fn mean_zero_references(p: usize) -> DMatrix<f64> {
    let mut rng = StdRng::seed_from_u64(42);
    let refs = DMatrix::from_fn(5, p, |_, _| rng.gen::<f64>());
    let mean = refs.row_mean();
    DMatrix::from_fn(5, p, |i, j| refs[(i, j)] - mean[j])
}

fn model(p: usize) -> DVector<f64> {
    DVector::from_fn(p, |j, _| (-((j as f64 - 20.) / 4.).powi(2)).exp())
}

#[test]
fn common_model_does_not_perturb() {
    let refs = mean_zero_references(40);
    let basis = Eigenbasis::from_references(&refs, 4).unwrap();
    let m = model(40).transpose();
    let models = DMatrix::from_fn(5, 40, |_, j| m[j]);
    let delta = perturb_spec_included(&basis, &refs, &models, false)
        .unwrap()
        .delta_kl;
    assert!(delta.amax() < 1e-9, "{}", delta.amax());
}

#[test]
fn target_only_model_is_oversubtracted_only() {
    let refs = mean_zero_references(40);
    let basis = Eigenbasis::from_references(&refs, 4).unwrap();
    let models = DMatrix::<f64>::zeros(5, 40);
    let delta = perturb_spec_included(&basis, &refs, &models, false)
        .unwrap()
        .delta_kl;
    assert!(delta.iter().all(|v| *v == 0.));
    let sci = refs.row(1).transpose();
    let terms = calculate_fm(&delta, &basis.klmodes, &[2, 4], &sci, &model(40)).unwrap();
    assert!(terms.selfsubtraction.iter().all(|v| *v == 0.));
    assert!(terms.oversubtraction.amax() > 0.);
}

#[test]
fn single_reference_model_perturbs() {
    let refs = mean_zero_references(40);
    let basis = Eigenbasis::from_references(&refs, 4).unwrap();
    let mut models = DMatrix::<f64>::zeros(5, 40);
    models.set_row(3, &model(40).transpose());
    let delta = perturb_spec_included(&basis, &refs, &models, true).unwrap();
    assert!(delta.delta_kl.amax() > 1e-6);
    let covariance = delta.covariance.unwrap();
    assert_eq!(covariance.shape(), (5, 5));
    assert!((&covariance - covariance.transpose()).amax() < 1e-12);
}
