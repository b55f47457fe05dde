/// GEMM: `c[m, n] = sum_k a[m, k] * b[k, n]` with fp32 accumulation in `k`
/// order. `b` is row-major `[K][N]`.
#[inline(never)]
pub fn scalar_gemm(a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize) {
    assert_eq!(a.len(), m * k);
    assert_eq!(b.len(), k * n);
    assert_eq!(c.len(), m * n);
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0f32;
            for p in 0..k {
                acc += a[i * k + p] * b[p * n + j];
            }
            c[i * n + j] = acc;
        }
    }
}

/// GEMM in fp64, for tolerance bounds that do not depend on summation order.
#[inline(never)]
pub fn scalar_gemm_f64(a: &[f32], b: &[f32], c: &mut [f64], m: usize, n: usize, k: usize) {
    assert_eq!(c.len(), m * n);
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0f64;
            for p in 0..k {
                acc += a[i * k + p] as f64 * b[p * n + j] as f64;
            }
            c[i * n + j] = acc;
        }
    }
}
