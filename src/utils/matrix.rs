//! Row-major matrix multiplication on flat buffers, backed by BLAS.

use cblas::{dgemm, Layout, Transpose};

fn trans(flag: bool) -> Transpose {
    if flag {
        Transpose::Ordinary
    } else {
        Transpose::None
    }
}

/// Compute `C = A * B` for row-major flat buffers, returning C as (m x n).
///
/// `A` is (m x k) when `trans_a` is false, (k x m) stored row-major when
/// `trans_a` is true; `B` likewise is (k x n) or (n x k).
///
/// Zero-sized operands are handled without calling into BLAS, so degenerate
/// shapes (an empty convolution output plane, for instance) produce an
/// all-zero result of the correct size.
pub fn matmul(
    a: &[f64],
    b: &[f64],
    m: usize,
    k: usize,
    n: usize,
    trans_a: bool,
    trans_b: bool,
) -> Vec<f64> {
    assert_eq!(a.len(), m * k, "lhs buffer length mismatch");
    assert_eq!(b.len(), k * n, "rhs buffer length mismatch");

    let mut c = vec![0.0f64; m * n];
    if m == 0 || n == 0 || k == 0 {
        return c;
    }

    let lda = if trans_a { m } else { k } as i32;
    let ldb = if trans_b { k } else { n } as i32;
    unsafe {
        dgemm(
            Layout::RowMajor,
            trans(trans_a),
            trans(trans_b),
            m as i32,
            n as i32,
            k as i32,
            1.0,
            a,
            lda,
            b,
            ldb,
            0.0,
            &mut c,
            n as i32,
        );
    }
    c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_identity() {
        let a = vec![1.0, 2.0, 3.0, 4.0]; // 2x2
        let eye = vec![1.0, 0.0, 0.0, 1.0];
        assert_eq!(matmul(&a, &eye, 2, 2, 2, false, false), a);
    }

    #[test]
    fn test_matmul_known_values() {
        // (2x3) * (3x2)
        let a = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
        let c = matmul(&a, &b, 2, 3, 2, false, false);
        assert_eq!(c, vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_matmul_transposed_lhs() {
        // A stored as (3x2), used as (2x3)
        let a = vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0];
        let b = vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
        let c = matmul(&a, &b, 2, 3, 2, true, false);
        assert_eq!(c, vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_matmul_transposed_rhs() {
        // B stored as (2x3), used as (3x2)
        let a = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = vec![7.0, 9.0, 11.0, 8.0, 10.0, 12.0];
        let c = matmul(&a, &b, 2, 3, 2, false, true);
        assert_eq!(c, vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_matmul_degenerate_dims() {
        let c = matmul(&[], &[0.0; 6], 0, 3, 2, false, false);
        assert!(c.is_empty());
        let c = matmul(&[], &[], 2, 0, 3, false, false);
        assert_eq!(c, vec![0.0; 6]);
    }
}
