//! Derandomized binomial sampling for the multinomial ball-into-bins tree.
//!
//! `binomial_sample` is a pure function of its inputs: the same PRF output
//! always yields the same split, which is what lets the oracle's forward and
//! inverse walks agree. Over a uniform `prf_output` the result is distributed
//! as Binomial(count, num/denom).
//!
//! The draw inverts the CDF by summing the PMF upward from a point
//! `WINDOW_SIGMAS` standard deviations below the mean. The mass below that
//! point is under f64 resolution, so the sum is exact to rounding. The first
//! term comes from `puruspe::ln_gamma`; the rest follow the PMF ratio. Cost is
//! O(sqrt(count)) per draw.

use puruspe::ln_gamma;

/// Lower tail below `mean - 14 sd` is at most e^-49 for p <= 1/2.
const WINDOW_SIGMAS: f64 = 14.0;

/// Top 53 bits of the coin, centered in their cell, as a point of (0, 1].
#[inline]
fn coin_to_unit(coin: u64) -> f64 {
    ((coin >> 11) as f64 + 0.5) / (1u64 << 53) as f64
}

/// Sample Binomial(`count`, `num / denom`) using `prf_output` as the coin.
///
/// Degenerate probabilities short-circuit: `num == 0` gives 0 and
/// `num >= denom` gives `count`. The result is always in `[0, count]`, and
/// it is nondecreasing in `prf_output`.
pub fn binomial_sample(count: u64, num: u64, denom: u64, prf_output: u64) -> u64 {
    if denom == 0 || count == 0 || num == 0 {
        return 0;
    }
    if num >= denom {
        return count;
    }

    let p = num as f64 / denom as f64;
    let u = coin_to_unit(prf_output);
    if p > 0.5 {
        // Walk the lighter side; n - Bin(n, 1 - p) is Bin(n, p).
        count - invert_cdf(count, 1.0 - p, 1.0 - u)
    } else {
        invert_cdf(count, p, u)
    }
}

/// Smallest `k` with `P(X <= k) >= u` for `X ~ Binomial(n, p)`, `p <= 1/2`.
fn invert_cdf(n: u64, p: f64, u: f64) -> u64 {
    let q = 1.0 - p;
    let mean = n as f64 * p;
    let sd = (mean * q).sqrt();
    let start = (mean - WINDOW_SIGMAS * sd).floor().max(0.0) as u64;

    let ratio = p / q;
    let mut pmf = ln_pmf(n, p, start).exp();
    let mut cdf = pmf;
    let mut k = start;
    while cdf < u && k < n {
        k += 1;
        pmf *= (n - k + 1) as f64 / k as f64 * ratio;
        let next = cdf + pmf;
        if next == cdf && k as f64 > mean {
            // Upper tail no longer moves the sum.
            break;
        }
        cdf = next;
    }
    k
}

fn ln_pmf(n: u64, p: f64, k: u64) -> f64 {
    let ln_choose = if k == 0 || k == n {
        0.0
    } else {
        ln_gamma(n as f64 + 1.0) - ln_gamma(k as f64 + 1.0) - ln_gamma((n - k) as f64 + 1.0)
    };
    ln_choose + k as f64 * p.ln() + (n - k) as f64 * (-p).ln_1p()
}
