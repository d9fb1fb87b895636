//! Stepwise interpolation between two pixel frames.

use std::time::Duration;

use crate::drivers::Pixel;

/// Shape of a fade transition: `steps` frames, `step_delay` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fade {
    pub steps: u32,
    pub step_delay: Duration,
}

impl Fade {
    pub const fn new(steps: u32, step_delay: Duration) -> Self {
        Self { steps, step_delay }
    }

    /// Total run time of the transition.
    pub fn duration(&self) -> Duration {
        self.step_delay * self.steps
    }

    /// Frame at `step` of the transition from `from` to `to`.
    ///
    /// Step 0 is `from`, step `steps` (and anything beyond) is exactly `to`.
    /// Both frames must have the same length.
    pub fn frame(&self, from: &[Pixel], to: &[Pixel], step: u32) -> Vec<Pixel> {
        debug_assert_eq!(from.len(), to.len());
        if step >= self.steps {
            return to.to_vec();
        }
        from.iter()
            .zip(to)
            .map(|(a, b)| blend(a, b, step, self.steps))
            .collect()
    }
}

impl Default for Fade {
    /// 20 steps of 20 ms.
    fn default() -> Self {
        Self::new(20, Duration::from_millis(20))
    }
}

fn blend(from: &Pixel, to: &Pixel, step: u32, steps: u32) -> Pixel {
    let mut out = [0u8; 4];
    for (channel, (a, b)) in out.iter_mut().zip(from.iter().zip(to)) {
        let (a, b) = (i64::from(*a), i64::from(*b));
        let value = a + (b - a) * i64::from(step) / i64::from(steps);
        *channel = value.clamp(0, 255) as u8;
    }
    out
}
