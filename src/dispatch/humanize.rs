use std::time::Duration;

use rand::Rng;

pub const JITTER_LOW: f64 = 0.8;
pub const JITTER_HIGH: f64 = 1.2;

/// Anti-ban send delay: a random base, plus simulated typing time for the
/// text, scaled by ±20% jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HumanizeSettings {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub typing_chars_per_second: f64,
}

impl Default for HumanizeSettings {
    fn default() -> Self {
        Self {
            min_delay_ms: 2_000,
            max_delay_ms: 5_000,
            typing_chars_per_second: 10.0,
        }
    }
}

impl HumanizeSettings {
    fn ordered(&self) -> (u64, u64) {
        if self.min_delay_ms <= self.max_delay_ms {
            (self.min_delay_ms, self.max_delay_ms)
        } else {
            (self.max_delay_ms, self.min_delay_ms)
        }
    }

    fn typing_ms(&self, text: &str) -> f64 {
        if self.typing_chars_per_second <= 0.0 {
            return 0.0;
        }
        text.chars().count() as f64 / self.typing_chars_per_second * 1000.0
    }

    /// `(uniform(min, max) + len / cps * 1000) * uniform(0.8, 1.2)`, floored to ms.
    pub fn delay_for<R: Rng + ?Sized>(&self, text: &str, rng: &mut R) -> Duration {
        let (lo, hi) = self.ordered();
        let base = if lo == hi {
            lo as f64
        } else {
            rng.random_range(lo as f64..=hi as f64)
        };
        let jitter = rng.random_range(JITTER_LOW..=JITTER_HIGH);
        let ms = ((base + self.typing_ms(text)) * jitter).floor();
        Duration::from_millis(ms.max(0.0) as u64)
    }

    /// Smallest and largest delay `delay_for` can return for `text`.
    pub fn bounds(&self, text: &str) -> (Duration, Duration) {
        let (lo, hi) = self.ordered();
        let typing = self.typing_ms(text);
        let min = ((lo as f64 + typing) * JITTER_LOW).floor();
        let max = ((hi as f64 + typing) * JITTER_HIGH).floor();
        (Duration::from_millis(min as u64), Duration::from_millis(max as u64))
    }
}
