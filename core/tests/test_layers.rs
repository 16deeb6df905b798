/// Layer contract tests: affine formula, hard mask preservation, symbolic
/// slot layout, gated division, and energy conservation penalty.

use eql_test_utils::{dense_params, identity_params, make_input, patterned};

use eql_core::dense::{DenseConfig, DenseGrads, DenseMasked, DenseOptions};
use eql_core::division::{DivisionConfig, DivisionLayer, DIV_EPS};
use eql_core::energy::{EnergyConservation, QuadraticEnergy};
use eql_core::error::EqlError;
use eql_core::hypothesis::{HypothesisSet, UnaryFn};
use eql_core::init::Initializer;
use eql_core::layer::{EqlLayer, DENOMINATOR_PENALTY, REGULARIZATION_LOSS};
use eql_core::symbolic::{NodeCounts, SymbolicLayer};
use eql_core::tensor::Tensor;

fn penalty(layer: &DivisionLayer) -> f32 {
    layer.losses().iter().find(|l| l.name == DENOMINATOR_PENALTY).unwrap().value
}

// ── DenseMasked ─────────────────────────────────────────────────────

#[test]
fn test_dense_matches_affine_formula() {
    let opts = DenseOptions::default()
        .with_initializers(Initializer::GlorotUniform, Initializer::RandomUniform { scale: 0.5 })
        .with_seed(7);
    let mut layer = DenseMasked::new(DenseConfig::with_options(5, opts)).unwrap();
    let x = make_input(6, 4);
    let y = layer.forward(&x).unwrap();
    let p = layer.dense().params().unwrap();
    for r in 0..6 {
        for c in 0..5 {
            let mut expected = p.b[c];
            for k in 0..4 {
                expected += x.get(r, k) * p.w[k * 5 + c];
            }
            assert!((y.get(r, c) - expected).abs() < 1e-5, "y[{r},{c}]");
        }
    }
}

#[test]
fn test_same_seed_same_weights() {
    let mut a = DenseMasked::new(DenseConfig::new(3)).unwrap();
    let mut b = DenseMasked::new(DenseConfig::new(3)).unwrap();
    a.build(4).unwrap();
    b.build(4).unwrap();
    assert_eq!(a.params().unwrap().w, b.params().unwrap().w);
    let opts = DenseOptions::default().with_seed(99);
    let mut c = DenseMasked::new(DenseConfig::with_options(3, opts)).unwrap();
    c.build(4).unwrap();
    assert_ne!(a.params().unwrap().w, c.params().unwrap().w);
}

#[test]
fn test_pruned_weight_stays_zero_through_updates() {
    let mut layer = DenseMasked::new(DenseConfig::new(2)).unwrap();
    layer.set_params(dense_params(patterned(6, 0), patterned(2, 1), 3)).unwrap();
    layer.set_weight_mask(1, 1, false).unwrap();
    layer.set_bias_mask(0, false).unwrap();
    layer.apply_constraints();
    {
        let p = layer.params().unwrap();
        assert_eq!(p.w[3], 0.0);
        assert_eq!(p.b[0], 0.0);
    }

    // Updates in both directions, as a momentum optimizer might produce.
    for step in 0..10 {
        let sign = if step % 2 == 0 { 1.0 } else { -1.0 };
        let grads = DenseGrads {
            d_w: vec![sign * 0.7; 6],
            d_b: vec![-sign * 0.3; 2],
        };
        layer.apply_gradients(&grads, 0.1).unwrap();
        {
            let p = layer.params_mut().unwrap();
            p.w[3] += 5.0 * sign;
        }
        layer.apply_constraints();
        let p = layer.params().unwrap();
        assert_eq!(p.w[3], 0.0, "step {step}");
        assert_eq!(p.b[0], 0.0, "step {step}");
        assert_ne!(p.w[0], 0.0);
    }
}

#[test]
fn test_constraint_twice_equals_once() {
    let mut layer = DenseMasked::new(DenseConfig::new(3)).unwrap();
    layer.build(3).unwrap();
    layer.trim_below(0.05).unwrap();
    let mut once = layer.clone();
    once.apply_constraints();
    let mut twice = layer.clone();
    twice.apply_constraints();
    twice.apply_constraints();
    assert_eq!(once.params().unwrap(), twice.params().unwrap());
}

#[test]
fn test_regularization_applies_regardless_of_mask() {
    let opts = DenseOptions::default().with_regularization(0.5);
    let mut layer = DenseMasked::new(DenseConfig::with_options(1, opts)).unwrap();
    layer.set_params(dense_params(vec![1.0, -3.0], vec![2.0], 2)).unwrap();
    layer.set_weight_mask(1, 0, false).unwrap();
    // mask set but not yet applied: the stored -3.0 still counts
    layer.forward(&Tensor::zeros(&[1, 2])).unwrap();
    assert_eq!(layer.losses()[0].name, REGULARIZATION_LOSS);
    assert!((layer.total_loss() - 3.0).abs() < 1e-6);
    layer.apply_constraints();
    layer.forward(&Tensor::zeros(&[1, 2])).unwrap();
    assert!((layer.total_loss() - 1.5).abs() < 1e-6);

    // Annealed to zero between phases.
    layer.set_regularization(0.0).unwrap();
    layer.forward(&Tensor::zeros(&[1, 2])).unwrap();
    assert_eq!(layer.total_loss(), 0.0);
}

#[test]
fn test_shape_error_after_build() {
    let mut layer = SymbolicLayer::new(
        NodeCounts::new(1, 1),
        HypothesisSet::eql_default(),
        vec![0],
        DenseOptions::default(),
    ).unwrap();
    layer.forward(&make_input(2, 3)).unwrap();
    let err = layer.forward(&make_input(2, 4)).unwrap_err();
    assert_eq!(err, EqlError::Shape { expected: vec![2, 3], found: vec![2, 4] });
}

// ── SymbolicLayer ───────────────────────────────────────────────────

#[test]
fn test_symbolic_sin_identity_product() {
    let hyp = HypothesisSet::new(vec![UnaryFn::Identity, UnaryFn::Sin]).unwrap();
    let mut layer = SymbolicLayer::new(NodeCounts::new(2, 1), hyp, vec![1, 0], DenseOptions::default()).unwrap();
    layer.dense_mut().set_params(identity_params(4)).unwrap();
    let x = Tensor::from_rows(&[vec![0.3, -1.0, 2.0, 0.5], vec![-2.0, 4.0, -1.5, -2.0]]).unwrap();
    let y = layer.forward(&x).unwrap();
    assert_eq!(y.shape, vec![2, 3]);
    for r in 0..2 {
        let (a, b, c, d) = (x.get(r, 0), x.get(r, 1), x.get(r, 2), x.get(r, 3));
        assert!((y.get(r, 0) - a.sin()).abs() < 1e-6);
        assert_eq!(y.get(r, 1), b);
        assert_eq!(y.get(r, 2), c * d);
    }
}

#[test]
fn test_symbolic_chain_widths() {
    let mut first = SymbolicLayer::new(
        NodeCounts::new(3, 2),
        HypothesisSet::eql_default(),
        vec![0, 1, 3],
        DenseOptions::default(),
    ).unwrap();
    let mut second = SymbolicLayer::new(
        NodeCounts::new(2, 1),
        HypothesisSet::eql_default(),
        vec![2, 2],
        DenseOptions::default().with_seed(1),
    ).unwrap();
    let mut last = DivisionLayer::new(DivisionConfig::new(2)).unwrap();

    let h1 = first.forward(&make_input(8, 2)).unwrap();
    assert_eq!(h1.shape, vec![8, 5]);
    assert_eq!(first.dense().params().unwrap().w.len(), 2 * 7);
    let h2 = second.forward(&h1).unwrap();
    assert_eq!(h2.shape, vec![8, 3]);
    let y = last.forward(&h2).unwrap();
    assert_eq!(y.shape, vec![8, 2]);
    assert!(y.data.iter().all(|v| v.is_finite()));
}

// ── DivisionLayer ───────────────────────────────────────────────────

#[test]
fn test_division_gate_sweep() {
    let t = 0.05;
    let mut layer = DivisionLayer::new(DivisionConfig::new(1).with_threshold(t)).unwrap();
    layer.dense_mut().set_params(identity_params(2)).unwrap();

    let denominators = [-10.0f32, -1.0, -0.05, 0.0, 1e-12, 0.01, 0.05, 0.0500001, 0.2, 3.0, 1e4];
    for &d in &denominators {
        for &n in &[-4.0f32, 0.0, 2.5, 1e8, 1e30, -1e30] {
            let x = Tensor::new(vec![n, d], &[1, 2]).unwrap();
            let y = layer.forward(&x).unwrap().data[0];
            assert!(y.is_finite());
            if d <= t {
                assert_eq!(y, 0.0, "n={n}, d={d} should be gated");
            } else {
                let expected = n / (d.abs() + DIV_EPS);
                assert!((y - expected).abs() <= 1e-6 * expected.abs().max(1.0), "n={n}, d={d}: {y} vs {expected}");
            }
        }
    }
}

#[test]
fn test_division_penalty_sign() {
    let t = 0.1;
    let mut layer = DivisionLayer::new(DivisionConfig::new(2).with_threshold(t)).unwrap();
    layer.dense_mut().set_params(identity_params(4)).unwrap();

    let above = Tensor::from_rows(&[vec![1.0, 0.5, 2.0, 0.2], vec![-1.0, 0.11, 0.0, 7.0]]).unwrap();
    layer.forward(&above).unwrap();
    assert_eq!(penalty(&layer), 0.0);

    let one_below = Tensor::from_rows(&[vec![1.0, 0.5, 2.0, 0.2], vec![-1.0, 0.09, 0.0, 7.0]]).unwrap();
    layer.forward(&one_below).unwrap();
    assert!(penalty(&layer) > 0.0);
    assert!((penalty(&layer) - 0.01).abs() < 1e-6);
}

#[test]
fn test_threshold_setter_changes_gating() {
    let mut layer = DivisionLayer::new(DivisionConfig::new(1)).unwrap();
    layer.dense_mut().set_params(identity_params(2)).unwrap();
    let x = Tensor::new(vec![1.0, 0.5], &[1, 2]).unwrap();
    assert!((layer.forward(&x).unwrap().data[0] - 2.0).abs() < 1e-6);
    layer.set_threshold(1.0).unwrap();
    assert_eq!(layer.forward(&x).unwrap().data[0], 0.0);
    assert!(matches!(layer.set_threshold(0.0), Err(EqlError::Config(_))));
    assert_eq!(layer.threshold(), 1.0);
}

// ── EnergyConservation ──────────────────────────────────────────────

#[test]
fn test_energy_zero_when_exact() {
    let reg = EnergyConservation::new(|s: &[f32]| s[0], 1.0, 1e-5);
    let pred = Tensor::from_rows(&[vec![1.0, 9.0], vec![1.0, -3.0], vec![1.0, 0.0]]).unwrap();
    assert_eq!(reg.loss(&pred).unwrap(), 0.0);
}

#[test]
fn test_energy_single_perturbation() {
    let coef = 1e-5;
    let delta = 0.25f32;
    let reg = EnergyConservation::new(|s: &[f32]| s[0], 1.0, coef);
    let base = Tensor::from_rows(&[vec![1.0, 9.0], vec![1.0, -3.0], vec![1.0, 0.0]]).unwrap();
    for row in 0..3 {
        for sign in [1.0f32, -1.0] {
            let mut pred = base.clone();
            pred.set(row, 0, 1.0 + sign * delta);
            let increase = reg.loss(&pred).unwrap() - reg.loss(&base).unwrap();
            assert_eq!(increase, coef * delta);
        }
    }
}

#[test]
fn test_energy_on_oscillator_trajectory() {
    // q = cos t, p = -sin t: H = q²/2 + p²/2 = 0.5 everywhere
    let reg = EnergyConservation::new(QuadraticEnergy::harmonic_oscillator(1.0, 1.0), 0.5, 1.0);
    let rows: Vec<Vec<f32>> = (0..16)
        .map(|i| {
            let t = i as f32 * 0.4;
            vec![t.cos(), -t.sin()]
        })
        .collect();
    let traj = Tensor::from_rows(&rows).unwrap();
    assert!(reg.loss(&traj).unwrap() < 1e-5);
    let damped: Vec<Vec<f32>> = rows.iter().enumerate().map(|(i, r)| {
        let k = (-0.1 * i as f32).exp();
        vec![k * r[0], k * r[1]]
    }).collect();
    assert!(reg.loss(&Tensor::from_rows(&damped).unwrap()).unwrap() > 0.1);
}
