/// Comparison that takes the same amount of time for equal-length inputs regardless of content
///
/// Must be used for secrets like reset tokens, where a short-circuiting comparison would leak
/// how many leading bytes an attacker guessed correctly.
pub(crate) fn eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut sum = 0;
    for (x, y) in a.iter().zip(b) {
        sum |= x ^ y;
    }
    sum == 0
}
