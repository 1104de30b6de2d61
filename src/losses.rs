//! Softmax cross-entropy loss.

use crate::tensor::Tensor;

/// Compute the mean softmax cross-entropy loss and its gradient with respect
/// to the scores.
///
/// # Arguments
///
/// * `scores` - class scores of shape (N, K)
/// * `labels` - ground-truth class index per sample, `labels[i] < K`
///
/// # Returns
///
/// The scalar loss averaged over the batch and `dscores` of shape (N, K).
/// Uses the max-subtraction trick for numerical stability.
pub fn softmax_loss(scores: &Tensor, labels: &[usize]) -> (f64, Tensor) {
    let (n, k) = scores.dims2();
    assert_eq!(labels.len(), n, "one label per sample required");
    assert!(n > 0, "softmax loss needs a non-empty batch");

    let data = scores.data();
    let mut loss = 0.0f64;
    let mut dscores = Tensor::zeros(&[n, k], scores.precision());
    for i in 0..n {
        let row = &data[i * k..(i + 1) * k];
        let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let sum_exp: f64 = row.iter().map(|&s| (s - max).exp()).sum();
        let log_sum_exp = sum_exp.ln();

        assert!(labels[i] < k, "label {} out of range for {} classes", labels[i], k);
        loss -= row[labels[i]] - max - log_sum_exp;

        for j in 0..k {
            let p = (row[j] - max).exp() / sum_exp;
            dscores.data_mut()[i * k + j] =
                (p - if j == labels[i] { 1.0 } else { 0.0 }) / n as f64;
        }
    }
    (loss / n as f64, dscores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Precision;

    #[test]
    fn test_uniform_scores_give_log_k() {
        let scores = Tensor::zeros(&[2, 4], Precision::Double);
        let (loss, _) = softmax_loss(&scores, &[0, 3]);
        assert!((loss - 4.0f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_gradient_rows_sum_to_zero() {
        let scores = Tensor::from_vec(
            &[2, 3],
            vec![1.0, -2.0, 0.5, 0.0, 3.0, -1.0],
            Precision::Double,
        );
        let (_, dscores) = softmax_loss(&scores, &[2, 1]);
        for i in 0..2 {
            let row_sum: f64 = dscores.data()[i * 3..(i + 1) * 3].iter().sum();
            assert!(row_sum.abs() < 1e-12);
        }
    }

    #[test]
    fn test_numerically_stable_for_large_scores() {
        let scores = Tensor::from_vec(&[1, 3], vec![1000.0, 1001.0, 1002.0], Precision::Double);
        let (loss, dscores) = softmax_loss(&scores, &[2]);
        assert!(loss.is_finite());
        assert!(dscores.data().iter().all(|v| v.is_finite()));
    }
}
