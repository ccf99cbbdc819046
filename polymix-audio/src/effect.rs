//! Sample processor chain: custom effect, then volume

use crate::buffers::mix;

/// Custom in-place processing stage for a source or the master bus
pub trait Effect: Send {
    /// Process interleaved samples in place
    fn process(&mut self, samples: &mut [f32], channels: u16);

    /// Reset internal state (called on seek and stop)
    fn reset(&mut self) {}

    /// Effect name, used in logs
    fn name(&self) -> &'static str {
        "effect"
    }
}

impl<F> Effect for F
where
    F: FnMut(&mut [f32], u16) + Send,
{
    fn process(&mut self, samples: &mut [f32], channels: u16) {
        self(samples, channels)
    }
}

/// Run the processor chain over one block
#[inline]
pub fn run_chain(effect: Option<&mut Box<dyn Effect>>, volume: f32, samples: &mut [f32], channels: u16) {
    if let Some(effect) = effect {
        effect.process(samples, channels);
    }
    mix::apply_gain(samples, volume);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effect_runs_before_volume() {
        // Adds 0.5 then halves: (0 + 0.5) * 0.5 = 0.25. Reversed order would give 0.5.
        let mut effect: Box<dyn Effect> = Box::new(|s: &mut [f32], _ch: u16| {
            s.iter_mut().for_each(|v| *v += 0.5);
        });
        let mut samples = vec![0.0; 4];
        run_chain(Some(&mut effect), 0.5, &mut samples, 2);
        assert!(samples.iter().all(|&v| v == 0.25));
    }

    #[test]
    fn test_volume_only() {
        let mut samples = vec![0.8; 3];
        run_chain(None, 0.5, &mut samples, 1);
        assert!(samples.iter().all(|&v| (v - 0.4).abs() < 1e-6));
    }
}
