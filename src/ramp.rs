// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Frequency ramping policy
//!
//! Chips don't like big jumps of their PLL frequency, a new frequency is therefore approached in
//! small steps. How big the steps are is decided by a `FrequencyStepping` implementation, the
//! chain only sets every frequency it's handed over.

use std::time::Duration;

/// Policy for approaching target frequency
pub trait FrequencyStepping: Send + Sync {
    /// Frequencies (MHz) to set one after another to get from `current` to `target`
    ///
    /// The last one is `target`. Empty when there's nothing to do.
    fn steps(&self, current: f32, target: f32) -> Vec<f32>;

    /// How long to let the PLL settle after each step
    fn step_delay(&self) -> Duration;
}

/// Walk the frequency in constant steps aligned to multiples of the step size
#[derive(Debug, Clone)]
pub struct LinearStepping {
    step: f32,
    delay: Duration,
}

impl LinearStepping {
    pub const DEFAULT_STEP_MHZ: f32 = 6.25;
    pub const DEFAULT_DELAY: Duration = Duration::from_millis(100);

    pub fn new(step: f32, delay: Duration) -> Self {
        Self { step, delay }
    }
}

impl Default for LinearStepping {
    fn default() -> Self {
        Self::new(Self::DEFAULT_STEP_MHZ, Self::DEFAULT_DELAY)
    }
}

impl FrequencyStepping for LinearStepping {
    fn steps(&self, current: f32, target: f32) -> Vec<f32> {
        let mut steps = Vec::new();
        if current == target {
            return steps;
        }
        if !(self.step > 0.0) {
            steps.push(target);
            return steps;
        }

        let up = target > current;
        let before_target = |freq: f32| if up { freq < target } else { freq > target };

        // get onto the grid first
        let mut freq = current;
        let remainder = freq % self.step;
        if remainder != 0.0 {
            freq -= remainder;
            if up {
                freq += self.step;
            }
            if before_target(freq) {
                steps.push(freq);
            }
        }

        loop {
            freq = if up { freq + self.step } else { freq - self.step };
            if !before_target(freq) {
                break;
            }
            steps.push(freq);
        }
        steps.push(target);
        steps
    }

    fn step_delay(&self) -> Duration {
        self.delay
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ramp_up() {
        let stepping = LinearStepping::default();
        assert_eq!(stepping.steps(56.25, 75.0), vec![62.5, 68.75, 75.0]);
        assert_eq!(stepping.steps(56.25, 70.0), vec![62.5, 68.75, 70.0]);

        let steps = stepping.steps(56.25, 525.0);
        assert_eq!(steps.len(), 75);
        assert_eq!(steps.last(), Some(&525.0));
        assert!(steps.windows(2).all(|pair| pair[1] - pair[0] <= 6.25));
    }

    #[test]
    fn test_ramp_down() {
        let stepping = LinearStepping::default();
        assert_eq!(stepping.steps(100.0, 90.0), vec![93.75, 90.0]);
        assert_eq!(stepping.steps(101.0, 90.0), vec![100.0, 93.75, 90.0]);
    }

    #[test]
    fn test_ramp_unaligned_start() {
        let stepping = LinearStepping::default();
        assert_eq!(stepping.steps(60.0, 75.0), vec![62.5, 68.75, 75.0]);
        assert_eq!(stepping.steps(60.0, 61.0), vec![61.0]);
    }

    #[test]
    fn test_ramp_nothing_to_do() {
        let stepping = LinearStepping::default();
        assert!(stepping.steps(525.0, 525.0).is_empty());
        // zero step degenerates into a jump
        let jump = LinearStepping::new(0.0, Duration::from_millis(0));
        assert_eq!(jump.steps(56.25, 525.0), vec![525.0]);
        assert_eq!(jump.step_delay(), Duration::from_millis(0));
    }
}
