//! Sample-level mixing helpers
//!
//! The inner loops walk fixed 8-sample chunks so the compiler can vectorise
//! them; the remainder is handled by a scalar tail.

use crate::error::EngineError;

const LANES: usize = 8;

/// True for the channel combinations the mixer can convert between
#[inline]
pub fn layout_supported(input: u16, output: u16) -> bool {
    matches!((input, output), (1, 1) | (2, 2) | (1, 2) | (2, 1))
}

/// Fail with [`EngineError::UnsupportedChannelLayout`] for anything but 1/2 channel pairs
pub fn check_layout(input: u16, output: u16) -> Result<(), EngineError> {
    if layout_supported(input, output) {
        Ok(())
    } else {
        Err(EngineError::UnsupportedChannelLayout { input, output })
    }
}

/// `dst[i] = clamp(dst[i] + src[i])`
#[inline]
pub fn add_clamped(dst: &mut [f32], src: &[f32]) {
    let len = dst.len().min(src.len());
    let (dst, src) = (&mut dst[..len], &src[..len]);

    let mut d_chunks = dst.chunks_exact_mut(LANES);
    let mut s_chunks = src.chunks_exact(LANES);
    for (d, s) in (&mut d_chunks).zip(&mut s_chunks) {
        for i in 0..LANES {
            d[i] = (d[i] + s[i]).clamp(-1.0, 1.0);
        }
    }
    for (d, s) in d_chunks
        .into_remainder()
        .iter_mut()
        .zip(s_chunks.remainder())
    {
        *d = (*d + *s).clamp(-1.0, 1.0);
    }
}

/// `dst[i] = clamp(dst[i] + src[i] * gain)`
#[inline]
pub fn add_scaled_clamped(dst: &mut [f32], src: &[f32], gain: f32) {
    if gain == 1.0 {
        add_clamped(dst, src);
        return;
    }
    let len = dst.len().min(src.len());
    let (dst, src) = (&mut dst[..len], &src[..len]);

    let mut d_chunks = dst.chunks_exact_mut(LANES);
    let mut s_chunks = src.chunks_exact(LANES);
    for (d, s) in (&mut d_chunks).zip(&mut s_chunks) {
        for i in 0..LANES {
            d[i] = (d[i] + s[i] * gain).clamp(-1.0, 1.0);
        }
    }
    for (d, s) in d_chunks
        .into_remainder()
        .iter_mut()
        .zip(s_chunks.remainder())
    {
        *d = (*d + *s * gain).clamp(-1.0, 1.0);
    }
}

/// Scale every sample in place
#[inline]
pub fn apply_gain(samples: &mut [f32], gain: f32) {
    if gain == 1.0 {
        return;
    }
    let mut chunks = samples.chunks_exact_mut(LANES);
    for c in &mut chunks {
        for s in c.iter_mut() {
            *s *= gain;
        }
    }
    for s in chunks.into_remainder() {
        *s *= gain;
    }
}

/// Clamp every sample to [-1, 1]
#[inline]
pub fn clamp_all(samples: &mut [f32]) {
    for s in samples.iter_mut() {
        *s = s.clamp(-1.0, 1.0);
    }
}

/// Add `src` (in `in_ch` layout) scaled by `gain` into `dst` (in `out_ch`
/// layout), clamping after every addition.
///
/// Mono to stereo duplicates each sample, stereo to mono averages the pair,
/// identical layouts add straight through. The layout is validated before
/// `dst` is touched.
pub fn accumulate(
    dst: &mut [f32],
    src: &[f32],
    in_ch: u16,
    out_ch: u16,
    gain: f32,
) -> Result<(), EngineError> {
    check_layout(in_ch, out_ch)?;

    match (in_ch, out_ch) {
        (1, 2) => {
            let frames = (dst.len() / 2).min(src.len());
            for (pair, &s) in dst[..frames * 2].chunks_exact_mut(2).zip(&src[..frames]) {
                let v = s * gain;
                pair[0] = (pair[0] + v).clamp(-1.0, 1.0);
                pair[1] = (pair[1] + v).clamp(-1.0, 1.0);
            }
        }
        (2, 1) => {
            let frames = dst.len().min(src.len() / 2);
            for (d, pair) in dst[..frames].iter_mut().zip(src[..frames * 2].chunks_exact(2)) {
                let v = (pair[0] + pair[1]) * 0.5 * gain;
                *d = (*d + v).clamp(-1.0, 1.0);
            }
        }
        _ => add_scaled_clamped(dst, src, gain),
    }
    Ok(())
}

/// Largest absolute sample value
#[inline]
pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
}

/// Root mean square of the samples
#[inline]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_clamped_saturates() {
        let mut dst = vec![0.9; 19];
        let src = vec![0.5; 19];
        add_clamped(&mut dst, &src);
        assert!(dst.iter().all(|&s| s == 1.0));

        let mut dst = vec![-0.9; 3];
        add_clamped(&mut dst, &[-0.5, 0.1, 0.0]);
        assert_eq!(dst[0], -1.0);
        assert!((dst[1] - -0.8).abs() < 1e-6);
        assert!((dst[2] - -0.9).abs() < 1e-6);
    }

    #[test]
    fn test_clamp_holds_for_many_sources() {
        let mut master = vec![0.0; 64];
        for k in 0..10 {
            let src: Vec<f32> = (0..64)
                .map(|i| if (i + k) % 2 == 0 { 0.8 } else { -0.8 })
                .collect();
            add_clamped(&mut master, &src);
            assert!(master.iter().all(|s| (-1.0..=1.0).contains(s)));
        }
    }

    #[test]
    fn test_mono_to_stereo_duplicates_with_gain() {
        let mut master = vec![0.0; 6];
        accumulate(&mut master, &[0.5, -0.25, 1.0], 1, 2, 0.8).unwrap();
        let expected = [0.4, 0.4, -0.2, -0.2, 0.8, 0.8];
        for (got, want) in master.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "got {got}, want {want}");
        }
    }

    #[test]
    fn test_stereo_to_mono_averages() {
        let mut master = vec![0.0; 2];
        accumulate(&mut master, &[0.2, 0.4, -1.0, 0.0], 2, 1, 1.0).unwrap();
        assert!((master[0] - 0.3).abs() < 1e-6);
        assert!((master[1] - -0.5).abs() < 1e-6);
    }

    #[test]
    fn test_gained_input_saturates_in_every_layout() {
        let in_range = |m: &[f32]| m.iter().all(|s| (-1.0..=1.0).contains(s));

        // 1 -> 1, long enough for both the chunked loop and the tail
        let mut master: Vec<f32> = (0..19)
            .map(|i| if i % 2 == 0 { 0.95 } else { -0.95 })
            .collect();
        let src: Vec<f32> = (0..19)
            .map(|i| if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        accumulate(&mut master, &src, 1, 1, 0.8).unwrap();
        assert!(in_range(&master));
        assert_eq!(master[0], 1.0);
        assert_eq!(master[17], -1.0);
        assert_eq!(master[18], 1.0);

        // 1 -> 2
        let mut master = vec![0.9, -0.9, 0.9, -0.9];
        accumulate(&mut master, &[1.0, -1.0], 1, 2, 0.8).unwrap();
        assert!(in_range(&master));
        assert_eq!(master[0], 1.0);
        assert!((master[1] - -0.1).abs() < 1e-6);
        assert!((master[2] - 0.1).abs() < 1e-6);
        assert_eq!(master[3], -1.0);

        // 2 -> 1
        let mut master = vec![0.9, -0.9];
        accumulate(&mut master, &[1.0, 1.0, -1.0, -1.0], 2, 1, 0.8).unwrap();
        assert_eq!(master, vec![1.0, -1.0]);
    }

    #[test]
    fn test_unsupported_layout_leaves_master_untouched() {
        let mut master = vec![0.25; 12];
        let err = accumulate(&mut master, &[1.0; 18], 6, 2, 1.0).unwrap_err();
        assert!(matches!(
            err,
            EngineError::UnsupportedChannelLayout { input: 6, output: 2 }
        ));
        assert!(master.iter().all(|&s| s == 0.25));
    }

    #[test]
    fn test_levels() {
        assert_eq!(peak(&[0.1, -0.7, 0.3]), 0.7);
        assert!((rms(&[1.0, -1.0, 1.0, -1.0]) - 1.0).abs() < 1e-6);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn test_apply_gain() {
        let mut s = vec![0.5; 11];
        apply_gain(&mut s, 0.5);
        assert!(s.iter().all(|&v| v == 0.25));
    }
}
