//! Q48.16 fixed-point arithmetic.
//!
//! All telemetry accumulation and statistics run on these routines; no
//! floating point is used anywhere outside display formatting. Values are
//! 64-bit two's-complement with 16 fractional bits, so `ONE == 0x1_0000`
//! and the usable magnitude is about ±1.4e14.

/// A Q48.16 fixed-point value.
pub type Fixed = i64;

/// 1.0 in Q48.16.
pub const ONE: Fixed = 1 << 16;

/// Fractional bits.
pub const FRAC_BITS: u32 = 16;

const LN2: Fixed = 45_426; // 0.693147 * 65536

/// Multiply two Q48.16 values through a 128-bit intermediate.
#[inline]
#[must_use]
pub fn mul(a: Fixed, b: Fixed) -> Fixed {
    ((i128::from(a) * i128::from(b)) >> FRAC_BITS) as Fixed
}

/// Divide two Q48.16 values.
///
/// Division by zero yields 0. The dividend is capped so the internal
/// `a << 16` cannot wrap.
#[inline]
#[must_use]
pub fn div(a: Fixed, b: Fixed) -> Fixed {
    if b == 0 {
        return 0;
    }
    const CAP: Fixed = i64::MAX >> FRAC_BITS;
    let a = a.clamp(-CAP, CAP);
    (a << FRAC_BITS) / b
}

/// Square root via Newton iteration `x' = (x + a/x) / 2`.
///
/// Negative input yields 0.
#[must_use]
pub fn sqrt(a: Fixed) -> Fixed {
    if a <= 0 {
        return 0;
    }
    if a == ONE {
        return ONE;
    }
    // Non-zero starting guess; converges in well under 20 rounds.
    let mut x = (a >> 1) + (ONE >> 2);
    for _ in 0..20 {
        let next = (x + div(a, x)) >> 1;
        if (next - x).abs() < 2 {
            return next;
        }
        x = next;
    }
    x
}

/// Exponential via truncated Taylor series.
///
/// Saturates at `i64::MAX / 2` once the true result would leave the Q48.16
/// range; very negative inputs underflow to 0.
#[must_use]
pub fn exp(x: Fixed) -> Fixed {
    if x == 0 {
        return ONE;
    }
    if x >= 32 * ONE {
        return i64::MAX / 2;
    }
    if x <= -16 * ONE {
        return 0;
    }

    let mut sum = ONE;
    let mut term = ONE;
    for n in 1..40 {
        term = mul(term, x) / n;
        if term == 0 {
            break;
        }
        sum += term;
        if sum > i64::MAX / 4 {
            return i64::MAX / 2;
        }
    }
    sum.max(0)
}

/// Natural logarithm.
///
/// Range-reduces by powers of two around 1, then refines with Newton
/// iterations on `y -> exp(y) - x`. Inputs `<= 0` yield 0.
#[must_use]
pub fn ln(x: Fixed) -> Fixed {
    if x <= 0 || x == ONE {
        return 0;
    }

    // x = 2^k * m with m in [1, 2)
    let mut k: i64 = 0;
    let mut m = x;
    while m >= 2 * ONE {
        m >>= 1;
        k += 1;
    }
    while m < ONE {
        m <<= 1;
        k -= 1;
    }

    let mut y = m - ONE;
    for _ in 0..8 {
        let ey = exp(y);
        if ey == 0 {
            break;
        }
        let delta = m - ey;
        y += div(delta, ey);
        if delta.abs() < 4 {
            break;
        }
    }

    y + k * LN2
}

/// Error function, Abramowitz & Stegun 7.1.26 rearranged for pure Q48.16:
/// `erf(x) ~= sign(x) * sqrt(1 - exp(-x^2 * (4/pi + a*x^2) / (1 + a*x^2)))`.
///
/// Odd symmetry is enforced and the result is strictly inside (-1, 1).
#[must_use]
pub fn erf(x: Fixed) -> Fixed {
    const A: Fixed = 9_633; // 0.147
    const FOUR_OVER_PI: Fixed = 83_328;

    if x == 0 {
        return 0;
    }
    let sign = if x < 0 { -1 } else { 1 };
    let x = x.abs();
    // erf(6) is already 1 to ~17 digits; clamping here also keeps x*x
    // inside i64.
    if x >= 6 * ONE {
        return sign * (ONE - 1);
    }

    let x_sq = mul(x, x);
    let denom = ONE + mul(A, x_sq);
    let numer = FOUR_OVER_PI + mul(A, x_sq);
    let ratio = div(numer, denom);

    let base = (ONE - exp(-mul(x_sq, ratio))).clamp(0, ONE - 1);
    sign * sqrt(base)
}

/// Display-only conversion. Never used in accumulation or comparison.
#[inline]
#[must_use]
pub fn to_f64(q: Fixed) -> f64 {
    q as f64 / ONE as f64
}

/// Widen an integer count into Q48.16.
#[inline]
#[must_use]
pub fn from_int(n: i64) -> Fixed {
    n << FRAC_BITS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mul_div_identities() {
        for &a in &[0, 1, -1, ONE, -ONE, 3 * ONE / 2, 12345 * ONE, -777 * ONE] {
            assert_eq!(a, mul(a, ONE));
            assert_eq!(a, div(a, ONE));
        }
        assert_eq!(0, div(ONE, 0));
        assert_eq!(2 * ONE, mul(2 * ONE, ONE));
        assert_eq!(6 * ONE, mul(2 * ONE, 3 * ONE));
        assert_eq!(ONE / 2, div(ONE, 2 * ONE));
    }

    #[test]
    fn sqrt_round_trips() {
        for &x in &[0, ONE, 2 * ONE, 3 * ONE, 10 * ONE, 100 * ONE, ONE / 4, 999 * ONE] {
            let r = sqrt(mul(x, x));
            assert!((r - x).abs() <= 2, "sqrt(sq({x})) = {r}");
        }
        assert_eq!(0, sqrt(-ONE));
        assert_eq!(2 * ONE, sqrt(4 * ONE));
    }

    #[test]
    fn exp_basics() {
        assert_eq!(ONE, exp(0));
        // e^1 = 2.71828...
        let e = exp(ONE);
        assert!((e - 178_145).abs() < 64, "exp(1) = {e}");
        assert_eq!(0, exp(-100 * ONE));
        assert_eq!(i64::MAX / 2, exp(64 * ONE));
    }

    #[test]
    fn ln_inverts_exp() {
        for &x in &[ONE / 2, ONE, 2 * ONE, 3 * ONE] {
            let r = ln(exp(x));
            assert!((r - x).abs() < ONE / 64, "ln(exp({x})) = {r}");
        }
        assert_eq!(0, ln(0));
        assert_eq!(0, ln(ONE));
        let l2 = ln(2 * ONE);
        assert!((l2 - 45_426).abs() < 64, "ln(2) = {l2}");
    }

    #[test]
    fn erf_symmetry_and_bounds() {
        assert_eq!(0, erf(0));
        for &x in &[ONE / 4, ONE / 2, ONE, 2 * ONE, 5 * ONE, 50 * ONE] {
            assert_eq!(erf(x), -erf(-x));
            assert!(erf(x).abs() < ONE);
        }
        // erf(1) = 0.8427
        let e1 = erf(ONE);
        assert!((e1 - 55_228).abs() < 600, "erf(1) = {e1}");
        // monotone over the useful range
        assert!(erf(ONE / 2) < erf(ONE));
        assert!(erf(ONE) < erf(2 * ONE));
    }
}
