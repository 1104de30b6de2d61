// Integration tests for the naive convolution kernel.
// Analytical gradients are checked against centered finite differences.

use conv_networks::layers::conv::{Conv, ConvParam};
use conv_networks::tensor::{Precision, Tensor};
use conv_networks::utils::gradient_check::{max_relative_error, numeric_gradient};
use conv_networks::utils::SimpleRng;

const GRAD_TOL: f64 = 1e-5;
const STEP: f64 = 1e-6;

fn random_tensor(shape: &[usize], rng: &mut SimpleRng) -> Tensor {
    Tensor::randn(shape, Precision::Double, rng)
}

// ============================================================================
// Forward Pass Tests
// ============================================================================

#[test]
fn test_output_shape_formula() {
    let mut rng = SimpleRng::new(11);
    let cases = [
        // (h, w, hh, ww, stride, pad, hout, wout)
        (4, 4, 3, 3, 1, 0, 2, 2),
        (4, 4, 3, 3, 1, 1, 4, 4),
        (6, 8, 2, 2, 2, 0, 3, 4),
        (5, 5, 3, 3, 2, 1, 3, 3),
        (7, 7, 7, 7, 1, 0, 1, 1),
    ];
    for &(h, w, hh, ww, stride, pad, hout, wout) in &cases {
        let x = random_tensor(&[2, 3, h, w], &mut rng);
        let filters = random_tensor(&[4, 3, hh, ww], &mut rng);
        let b = random_tensor(&[4], &mut rng);
        let (out, _) = Conv::forward(&x, &filters, &b, &ConvParam { stride, pad });
        assert_eq!(
            out.shape(),
            &[2, 4, hout, wout],
            "wrong output shape for stride={} pad={} kernel={}x{}",
            stride,
            pad,
            hh,
            ww
        );
    }
}

#[test]
fn test_forward_matches_hand_computation() {
    // One channel, 3x3 input, 2x2 filter, stride 1, no padding.
    let x = Tensor::from_vec(
        &[1, 1, 3, 3],
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0],
        Precision::Double,
    );
    let w = Tensor::from_vec(&[1, 1, 2, 2], vec![1.0, 0.0, 0.0, -1.0], Precision::Double);
    let b = Tensor::from_vec(&[1], vec![0.5], Precision::Double);
    let (out, _) = Conv::forward(&x, &w, &b, &ConvParam { stride: 1, pad: 0 });
    // Each window computes top-left - bottom-right + 0.5 = -3.5.
    assert_eq!(out.data(), &[-3.5, -3.5, -3.5, -3.5]);
}

#[test]
fn test_forward_padding_reaches_border() {
    // A 1x1 input with pad 1 and a 3x3 filter: the single output value sees
    // the input at the filter center only.
    let x = Tensor::from_vec(&[1, 1, 1, 1], vec![2.0], Precision::Double);
    let w = Tensor::from_vec(
        &[1, 1, 3, 3],
        vec![1.0, 1.0, 1.0, 1.0, 10.0, 1.0, 1.0, 1.0, 1.0],
        Precision::Double,
    );
    let b = Tensor::zeros(&[1], Precision::Double);
    let (out, _) = Conv::forward(&x, &w, &b, &ConvParam { stride: 1, pad: 1 });
    assert_eq!(out.shape(), &[1, 1, 1, 1]);
    assert_eq!(out.data()[0], 20.0);
}

// ============================================================================
// Gradient Checking Tests
// ============================================================================

#[test]
fn test_gradient_wrt_input() {
    let mut rng = SimpleRng::new(21);
    for &(stride, pad) in &[(1usize, 0usize), (1, 1), (2, 1)] {
        let x = random_tensor(&[2, 3, 5, 5], &mut rng);
        let w = random_tensor(&[2, 3, 3, 3], &mut rng);
        let b = random_tensor(&[2], &mut rng);
        let param = ConvParam { stride, pad };

        let (out, cache) = Conv::forward(&x, &w, &b, &param);
        let dout = random_tensor(out.shape(), &mut rng);
        let (dx, _, _) = Conv::backward(&dout, &cache);

        let numeric = numeric_gradient(
            |probe| {
                let (o, _) = Conv::forward(probe, &w, &b, &param);
                o.data().iter().zip(dout.data()).map(|(a, g)| a * g).sum()
            },
            &x,
            STEP,
        );
        let err = max_relative_error(&dx, &numeric);
        assert!(err < GRAD_TOL, "dx error {} at stride={} pad={}", err, stride, pad);
    }
}

#[test]
fn test_gradient_wrt_weights_and_bias() {
    let mut rng = SimpleRng::new(22);
    let x = random_tensor(&[2, 2, 4, 4], &mut rng);
    let w = random_tensor(&[3, 2, 3, 3], &mut rng);
    let b = random_tensor(&[3], &mut rng);
    let param = ConvParam { stride: 1, pad: 1 };

    let (out, cache) = Conv::forward(&x, &w, &b, &param);
    let dout = random_tensor(out.shape(), &mut rng);
    let (_, dw, db) = Conv::backward(&dout, &cache);

    let numeric_dw = numeric_gradient(
        |probe| {
            let (o, _) = Conv::forward(&x, probe, &b, &param);
            o.data().iter().zip(dout.data()).map(|(a, g)| a * g).sum()
        },
        &w,
        STEP,
    );
    assert!(max_relative_error(&dw, &numeric_dw) < GRAD_TOL);

    let numeric_db = numeric_gradient(
        |probe| {
            let (o, _) = Conv::forward(&x, &w, probe, &param);
            o.data().iter().zip(dout.data()).map(|(a, g)| a * g).sum()
        },
        &b,
        STEP,
    );
    assert!(max_relative_error(&db, &numeric_db) < GRAD_TOL);
}

#[test]
fn test_backward_shapes_match_inputs() {
    let mut rng = SimpleRng::new(23);
    let x = random_tensor(&[1, 2, 6, 6], &mut rng);
    let w = random_tensor(&[4, 2, 3, 3], &mut rng);
    let b = random_tensor(&[4], &mut rng);
    let param = ConvParam { stride: 2, pad: 1 };

    let (out, cache) = Conv::forward(&x, &w, &b, &param);
    let dout = random_tensor(out.shape(), &mut rng);
    let (dx, dw, db) = Conv::backward(&dout, &cache);
    assert_eq!(dx.shape(), x.shape());
    assert_eq!(dw.shape(), w.shape());
    assert_eq!(db.shape(), b.shape());
}
