// End-to-end tests for the variable-depth deep convolutional network.

use approx::assert_relative_eq;
use conv_networks::models::deep::{DeepConvNet, WeightScale};
use conv_networks::tensor::{Precision, Tensor};
use conv_networks::utils::gradient_check::relative_error;
use conv_networks::utils::SimpleRng;

// Weight scale 0.1 keeps the loss surface well conditioned for the
// finite-difference checks below.
fn small_net(batchnorm: bool, reg: f64) -> DeepConvNet {
    DeepConvNet::new(
        (3, 8, 8),
        &[4, 4],
        &[0, 1],
        batchnorm,
        10,
        WeightScale::Constant(0.1),
        reg,
        Precision::Double,
        42,
    )
    .unwrap()
}

fn small_batch() -> (Tensor, Vec<usize>) {
    let mut rng = SimpleRng::new(7);
    let x = Tensor::randn(&[2, 3, 8, 8], Precision::Double, &mut rng);
    (x, vec![3, 9])
}

// ============================================================================
// Construction Tests
// ============================================================================

#[test]
fn test_empty_filter_list_fails_fast() {
    let err = DeepConvNet::new(
        (3, 8, 8),
        &[],
        &[],
        false,
        10,
        WeightScale::Constant(1e-2),
        0.0,
        Precision::Double,
        42,
    )
    .unwrap_err();
    assert!(err.to_string().contains("at least one macro layer"));
}

#[test]
fn test_pool_index_out_of_range_fails_fast() {
    let err = DeepConvNet::new(
        (3, 8, 8),
        &[4, 4],
        &[2],
        false,
        10,
        WeightScale::Constant(1e-2),
        0.0,
        Precision::Double,
        42,
    )
    .unwrap_err();
    assert!(err.to_string().contains("out of range"));
}

#[test]
fn test_parameter_count_per_architecture() {
    // Without batchnorm: 2 per macro layer + 2 for the final linear layer.
    let net = small_net(false, 0.0);
    assert_eq!(net.num_layers(), 3);
    assert_eq!(net.named_parameters().len(), 2 * 2 + 2);

    // With batchnorm: 4 per macro layer + 2.
    let net = small_net(true, 0.0);
    assert_eq!(net.named_parameters().len(), 4 * 2 + 2);
    assert_eq!(net.bn_stats().len(), 2);
}

#[test]
fn test_final_layer_dim_accounts_for_pooling() {
    // Two pooled macro layers shrink 8x8 to 2x2, so the final linear weight
    // has 4 * 2 * 2 = 16 rows.
    let net = small_net(false, 0.0);
    let params = net.named_parameters();
    let (name, w3) = &params[params.len() - 2];
    assert_eq!(name, "W3");
    assert_eq!(w3.shape(), &[16, 10]);
}

#[test]
fn test_kaiming_initialization_builds() {
    let net = DeepConvNet::new(
        (3, 8, 8),
        &[8, 8],
        &[0],
        true,
        10,
        WeightScale::Kaiming,
        0.0,
        Precision::Double,
        42,
    )
    .unwrap();
    let (x, _) = small_batch();
    assert_eq!(net.predict(&x).shape(), &[2, 10]);
}

// ============================================================================
// Forward / Backward Tests
// ============================================================================

#[test]
fn test_predict_shape_and_stats_untouched() {
    let net = small_net(true, 0.0);
    let (x, _) = small_batch();
    let before = net.bn_stats().to_vec();
    let scores = net.predict(&x);
    assert_eq!(scores.shape(), &[2, 10]);
    assert_eq!(net.bn_stats(), &before[..]);
}

#[test]
fn test_loss_updates_running_stats() {
    let mut net = small_net(true, 0.0);
    let (x, y) = small_batch();
    let before = net.bn_stats().to_vec();
    let (loss, _) = net.loss(&x, &y);
    assert!(loss.is_finite() && loss >= 0.0);
    assert_ne!(net.bn_stats(), &before[..]);
}

#[test]
fn test_gradient_set_mirrors_parameters() {
    for batchnorm in [false, true] {
        let mut net = small_net(batchnorm, 0.0);
        let (x, y) = small_batch();
        let (_, grads) = net.loss(&x, &y);

        let named_grads = grads.named();
        let named_params = net.named_parameters();
        assert_eq!(named_grads.len(), named_params.len());
        for ((gname, grad), (pname, param)) in named_grads.iter().zip(named_params.iter()) {
            assert_eq!(gname, pname);
            assert_eq!(grad.shape(), param.shape(), "shape mismatch for {}", gname);
        }
    }
}

#[test]
fn test_regularization_uses_doubled_gradient_convention() {
    // This architecture documents loss += reg * sum(W^2) with gradient
    // 2 * reg * W; confirm both sides stay consistent with each other.
    let (x, y) = small_batch();
    let reg = 0.3;

    let mut plain = small_net(false, 0.0);
    let mut regged = small_net(false, reg);
    let (loss_plain, grads_plain) = plain.loss(&x, &y);
    let (loss_regged, grads_regged) = regged.loss(&x, &y);

    let sum_sq: f64 = plain
        .named_parameters()
        .iter()
        .filter(|(name, _)| name.starts_with('W'))
        .map(|(_, t)| t.sum_squares())
        .sum();
    assert_relative_eq!(loss_regged, loss_plain + reg * sum_sq, max_relative = 1e-10);

    let params = plain.named_parameters();
    let grads_p = grads_plain.named();
    let grads_r = grads_regged.named();
    let (w1, g_plain, g_regged) = (params[0].1, grads_p[0].1, grads_r[0].1);
    for i in 0..w1.len() {
        let expected = g_plain.data()[i] + 2.0 * reg * w1.data()[i];
        assert!((g_regged.data()[i] - expected).abs() < 1e-10);
    }
}

#[test]
fn test_bias_and_norm_parameters_carry_no_weight_decay() {
    let (x, y) = small_batch();
    let mut plain = small_net(true, 0.0);
    let mut regged = small_net(true, 0.5);
    let (_, grads_plain) = plain.loss(&x, &y);
    let (_, grads_regged) = regged.loss(&x, &y);

    for ((name, a), (_, b)) in grads_plain.named().iter().zip(grads_regged.named().iter()) {
        if !name.starts_with('W') {
            for (va, vb) in a.data().iter().zip(b.data().iter()) {
                assert!(
                    (va - vb).abs() < 1e-12,
                    "parameter {} picked up a regularization term",
                    name
                );
            }
        }
    }
}

#[test]
fn test_loss_gradient_matches_finite_differences() {
    let (x, y) = small_batch();
    let h = 1e-5;

    for batchnorm in [false, true] {
        let mut base = small_net(batchnorm, 0.1);
        let (_, grads) = base.loss(&x, &y);

        for (param_idx, (name, grad)) in grads.named().iter().enumerate() {
            // A few probes per tensor keep the test fast while still touching
            // every parameter kind.
            let stride = grad.len().div_ceil(3).max(1);
            for i in (0..grad.len()).step_by(stride) {
                let mut net = small_net(batchnorm, 0.1);
                net.named_parameters_mut()[param_idx].1.data_mut()[i] += h;
                let (loss_plus, _) = net.loss(&x, &y);

                let mut net = small_net(batchnorm, 0.1);
                net.named_parameters_mut()[param_idx].1.data_mut()[i] -= h;
                let (loss_minus, _) = net.loss(&x, &y);

                let numeric = (loss_plus - loss_minus) / (2.0 * h);
                let analytic = grad.data()[i];
                // Near-zero gradients drown in f64 cancellation noise; fall
                // back to an absolute bound there.
                assert!(
                    relative_error(numeric, analytic) < 1e-5
                        || (numeric - analytic).abs() < 1e-8,
                    "{}[{}] (batchnorm={}): numeric {} vs analytic {}",
                    name,
                    i,
                    batchnorm,
                    numeric,
                    analytic
                );
            }
        }
    }
}
