use itertools::izip;
use multiversion::multiversion;

/// Dot product of two equally long vectors.
///
/// The sum is accumulated in four independent lanes so the compiler can keep
/// them in one SIMD register on the targets below.
#[multiversion(targets("x86_64+avx+avx2+fma", "x86_64+avx", "x86+sse", "aarch64+neon"))]
pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len();
    assert!(a.len() == b.len());

    let head_length = n - n % 4;

    let (x, x_tail) = a.split_at(head_length);
    let (y, y_tail) = b.split_at(head_length);

    let lanes = izip!(x.chunks_exact(4), y.chunks_exact(4)).fold(
        [0f64; 4],
        |mut acc, (x, y)| {
            acc[0] += x[0] * y[0];
            acc[1] += x[1] * y[1];
            acc[2] += x[2] * y[2];
            acc[3] += x[3] * y[3];
            acc
        },
    );

    let mut result = (lanes[0] + lanes[1]) + (lanes[2] + lanes[3]);
    for (val1, val2) in x_tail.iter().zip(y_tail) {
        result += *val1 * *val2;
    }
    result
}

/// `out = a * x`, elementwise.
pub(crate) fn scale_into(x: &[f64], a: f64, out: &mut [f64]) {
    assert!(x.len() == out.len());
    out.iter_mut().zip(x).for_each(|(out, &x)| *out = a * x);
}
