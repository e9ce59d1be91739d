//! Special functions used by the likelihoods

use std::f64::consts::PI;

/// Lanczos approximation of ln(Gamma(x)) for x > 0.
pub fn ln_gamma(x: f64) -> f64 {
    // Lanczos coefficients (g=7, n=9).
    const COEFFS: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    const G: f64 = 7.0;

    if x.is_nan() || x <= 0.0 {
        return f64::NAN;
    }

    if x < 0.5 {
        // Reflection formula.
        return PI.ln() - (PI * x).sin().ln() - ln_gamma(1.0 - x);
    }

    let z = x - 1.0;
    let mut sum = COEFFS[0];
    for (i, &c) in COEFFS[1..].iter().enumerate() {
        sum += c / (z + i as f64 + 1.0);
    }

    let t = z + G + 0.5;
    (z + 0.5).mul_add(t.ln(), 0.5 * (2.0 * PI).ln()) - t + sum.ln()
}

/// Maximum number of series terms summed by [`hyp2f1`].
const HYP2F1_MAX_TERMS: usize = 200_000;

/// Gauss hypergeometric function 2F1(a, b; c; z) by direct series summation.
///
/// Valid for `0 <= z < 1` with positive parameters. Terms are added until the
/// partial sum stops changing in floating point. Returns NaN if the series has
/// not settled within the term budget.
pub fn hyp2f1(a: f64, b: f64, c: f64, z: f64) -> f64 {
    if !(0.0..1.0).contains(&z) {
        return f64::NAN;
    }
    let mut term = 1.0;
    let mut sum = 1.0;
    for j in 1..=HYP2F1_MAX_TERMS {
        let j = j as f64;
        term *= (a + j - 1.0) * (b + j - 1.0) / (c + j - 1.0) * z / j;
        let next = sum + term;
        if next == sum {
            return sum;
        }
        sum = next;
    }
    f64::NAN
}

/// Above this argument [`hyp2f1_a_plus_one`] switches to the expansion around `z = 1`.
const NEAR_UNIT_Z: f64 = 0.999;

/// Half-width of the window around integer `b` bridged by interpolation.
const INTEGER_B_GAP: f64 = 1e-4;

/// 2F1(a, b; a + 1; z) for `a > 0`, `0 < b < a + 1` and `0 <= z < 1`.
///
/// The direct series needs on the order of `1 / (1 - z)` terms, so close to
/// `z = 1` the linear transformation to `1 - z` is used instead. The first of
/// its two branches collapses to `z^-a` because `c = a + 1`. Both branches have
/// poles at integer `b` that cancel in the sum; near those points the value is
/// interpolated between `b -/+ INTEGER_B_GAP`.
pub fn hyp2f1_a_plus_one(a: f64, b: f64, z: f64) -> f64 {
    if !(0.0..1.0).contains(&z) || a <= 0.0 || b <= 0.0 || b >= a + 1.0 {
        return f64::NAN;
    }
    if z <= NEAR_UNIT_Z {
        return hyp2f1(a, b, a + 1.0, z);
    }

    let nearest = b.round();
    if (b - nearest).abs() < INTEGER_B_GAP {
        let lo = nearest - INTEGER_B_GAP;
        let hi = nearest + INTEGER_B_GAP;
        let (f_lo, f_hi) = (near_unit(a, lo, z), near_unit(a, hi, z));
        return f_lo + (f_hi - f_lo) * (b - lo) / (hi - lo);
    }
    near_unit(a, b, z)
}

fn near_unit(a: f64, b: f64, z: f64) -> f64 {
    let w = 1.0 - z;
    let sin_pb = (PI * b).sin();
    // Gamma(a + 1) Gamma(1 - b) / Gamma(a + 1 - b) with Gamma(1 - b) by reflection.
    let ln_head = ln_gamma(a + 1.0) - ln_gamma(a + 1.0 - b) + PI.ln()
        - sin_pb.abs().ln()
        - ln_gamma(b)
        - a * z.ln();
    let head = ln_head.exp().copysign(sin_pb);
    let tail = a / (b - 1.0) * w.powf(1.0 - b) * hyp2f1(1.0, a + 1.0 - b, 2.0 - b, w);
    head + tail
}

/// ln(exp(a) + exp(b)) without overflow.
pub fn log_sum_exp(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    if max == f64::NEG_INFINITY {
        return max;
    }
    max + ((a - max).exp() + (b - max).exp()).ln()
}
