#[inline(always)]
pub fn logsumexp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY && b == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if a > b {
        a + (b - a).exp().ln_1p()
    } else {
        b + (a - b).exp().ln_1p()
    }
}

/// Normalizes scores into a probability vector without overflowing.
pub fn softmax(scores: &[f64]) -> impl Iterator<Item = f64> + '_ {
    let z = scores
        .iter()
        .fold(f64::NEG_INFINITY, |acc, &s| logsumexp(acc, s));
    scores.iter().map(move |&s| (s - z).exp())
}
