//! Timer-driven fade-out used for smooth stop.
//!
//! The fade value walks from 1.0 (just initiated) down to 0.0 over the
//! configured fade-out duration, one decrement per engine tick. The applied
//! gain is not the raw value: a logarithmic curve makes the ramp sound linear
//! to human hearing. The fade gain drives a dedicated volume stage, separate
//! from the user volume.

/// Interval between engine ticks, in milliseconds. The fade decrement per
/// tick is `TICK_INTERVAL_MS / fadeout_ms`.
pub const TICK_INTERVAL_MS: u64 = 50;

/// Result of a single fade tick.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FadeStep {
    /// Not fading; nothing to apply.
    Idle,
    /// Fading; apply this gain to the fade-volume stage.
    Faded(f64),
    /// The fade just completed; tear the pipeline down.
    Finished,
}

/// Fade-out state machine: `Idle (0.0)` or `Fading (0.0, 1.0]`.
#[derive(Debug)]
pub struct FadeController {
    value: f64,
    fadeout_ms: u64,
}

impl FadeController {
    pub fn new(fadeout_ms: u64) -> Self {
        Self {
            value: 0.0,
            fadeout_ms,
        }
    }

    pub fn is_fading(&self) -> bool {
        self.value > 0.0
    }

    /// Start a fade-out. A fade-out duration of zero makes the next tick
    /// finish immediately (instant stop).
    pub fn begin(&mut self) {
        self.value = 1.0;
    }

    /// Abandon any fade in progress.
    pub fn reset(&mut self) {
        self.value = 0.0;
    }

    /// Advance the fade by one tick interval.
    pub fn tick(&mut self) -> FadeStep {
        if self.value <= 0.0 {
            return FadeStep::Idle;
        }

        self.value -= if self.fadeout_ms > 0 {
            TICK_INTERVAL_MS as f64 / self.fadeout_ms as f64
        } else {
            1.0
        };

        if self.value <= 0.0 {
            self.value = 0.0;
            return FadeStep::Finished;
        }
        FadeStep::Faded(fade_gain(self.value))
    }
}

/// Perceptual fade gain for a linear fade value in `(0.0, 1.0]`.
///
/// `1.0 - log10((1.0 - fade) * 9.0 + 1.0)`: equal steps of `fade` produce
/// roughly equal loudness steps instead of a sudden drop near the end.
fn fade_gain(fade: f64) -> f64 {
    1.0 - ((1.0 - fade) * 9.0 + 1.0).log10()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_enters_fading_at_one() {
        let mut fade = FadeController::new(1000);
        assert!(!fade.is_fading());
        fade.begin();
        assert!(fade.is_fading());
    }

    #[test]
    fn tick_decrements_by_interval_over_duration() {
        let mut fade = FadeController::new(200); // 4 ticks of 50 ms
        fade.begin();
        assert!(matches!(fade.tick(), FadeStep::Faded(_)));
        assert!(matches!(fade.tick(), FadeStep::Faded(_)));
        assert!(matches!(fade.tick(), FadeStep::Faded(_)));
        assert_eq!(fade.tick(), FadeStep::Finished);
        assert!(!fade.is_fading());
    }

    #[test]
    fn zero_duration_finishes_in_a_single_tick() {
        let mut fade = FadeController::new(0);
        fade.begin();
        assert_eq!(fade.tick(), FadeStep::Finished);
    }

    #[test]
    fn idle_controller_ticks_do_nothing() {
        let mut fade = FadeController::new(1000);
        assert_eq!(fade.tick(), FadeStep::Idle);
        assert_eq!(fade.tick(), FadeStep::Idle);
    }

    #[test]
    fn gain_curve_is_perceptual_not_linear() {
        // Full fade value keeps full gain; mid-ramp the curve sits below the
        // straight line (more attenuation early, perceptually even).
        assert!((fade_gain(1.0) - 1.0).abs() < 1e-9);
        assert!(fade_gain(0.5) < 0.5);
        // log10(10) == 1.0 at the bottom of the ramp.
        assert!(fade_gain(1e-9) < 1e-6);
    }

    #[test]
    fn reset_abandons_fade() {
        let mut fade = FadeController::new(1000);
        fade.begin();
        fade.reset();
        assert_eq!(fade.tick(), FadeStep::Idle);
    }
}
