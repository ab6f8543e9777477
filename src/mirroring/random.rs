//! OS CSPRNG helpers for keys and SSRCs.

/// Generate cryptographically secure random bytes via OS CSPRNG.
pub fn bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    getrandom::getrandom(&mut buf).expect("OS CSPRNG failed");
    buf
}

/// Uniform-enough random integer in the inclusive range `[min, max]`.
///
/// Modulo bias over a 64-bit draw is negligible for SSRC bands.
pub fn in_range(min: u32, max: u32) -> u32 {
    debug_assert!(min <= max);
    let span = (max - min) as u64 + 1;
    let draw = u64::from_be_bytes(bytes());
    min + (draw % span) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_range_bounds() {
        for _ in 0..1000 {
            let v = in_range(10, 12);
            assert!((10..=12).contains(&v));
        }
        assert_eq!(in_range(7, 7), 7);
    }
}
