//! Injected randomness and port selection
//!
//! Port draws and group assignment go through [`RandomSource`] so tests can
//! script the outcome instead of relying on a process-wide generator.

use rand::Rng;

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Source of uniformly distributed indices
#[cfg_attr(test, automock)]
pub trait RandomSource: Send + Sync {
    /// A value uniformly drawn from `[0, upper)`
    ///
    /// Callers never pass `upper == 0`.
    fn below(&self, upper: usize) -> usize;
}

/// Production source backed by the thread-local generator
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn below(&self, upper: usize) -> usize {
        if upper <= 1 {
            return 0;
        }
        rand::thread_rng().gen_range(0..upper)
    }
}

/// Host port ranges handed to game servers
///
/// Only the game range has an upper bound. The NetImgui and status ports sit
/// at the same offset in their own ranges, so one draw determines all three.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortRanges {
    /// Inclusive lower bound of the game (UDP) range
    pub game_min: u16,
    /// Exclusive upper bound of the game range
    pub game_max: u16,
    /// Lower bound of the NetImgui (TCP) range
    pub netimgui_min: u16,
    /// Lower bound of the status port range
    pub status_min: u16,
}

/// Ports selected for one pod
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortAssignment {
    /// Game traffic port
    pub game: i32,
    /// NetImgui debug client port
    pub netimgui: i32,
    /// Status endpoint port, probed for readiness
    pub status: i32,
}

impl Default for PortRanges {
    fn default() -> Self {
        Self {
            game_min: 7700,
            game_max: 7800,
            netimgui_min: 7800,
            status_min: 9000,
        }
    }
}

impl PortRanges {
    /// Number of distinct game ports
    pub fn width(&self) -> u16 {
        self.game_max.saturating_sub(self.game_min)
    }

    /// Check that the ranges are usable
    ///
    /// The game range must be non-empty and the derived ranges must fit in the
    /// port space.
    pub fn validate(&self) -> Result<(), Error> {
        if self.game_min >= self.game_max {
            return Err(Error::config(format!(
                "game port range is empty: min {} must be below max {}",
                self.game_min, self.game_max
            )));
        }
        let width = u32::from(self.width());
        for (label, min) in [("netimgui", self.netimgui_min), ("status", self.status_min)] {
            if u32::from(min) + width - 1 > u32::from(u16::MAX) {
                return Err(Error::config(format!(
                    "{label} port range starting at {min} overflows the port space"
                )));
            }
        }
        Ok(())
    }

    /// Draw a game port and derive its companion ports
    pub fn draw(&self, random: &dyn RandomSource) -> PortAssignment {
        let width = usize::from(self.width()).max(1);
        let offset = random.below(width).min(width - 1) as i32;
        PortAssignment {
            game: i32::from(self.game_min) + offset,
            netimgui: i32::from(self.netimgui_min) + offset,
            status: i32::from(self.status_min) + offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    /// Story: every draw lands inside the game range and the companion ports
    /// keep the same offset
    #[test]
    fn story_draws_respect_ranges() {
        let ranges = PortRanges::default();
        for _ in 0..500 {
            let ports = ranges.draw(&ThreadRandom);
            assert!(ports.game >= 7700 && ports.game < 7800);
            assert_eq!(ports.netimgui, ports.game - 7700 + 7800);
            assert_eq!(ports.status, ports.game - 7700 + 9000);
        }
    }

    #[rstest]
    #[case::first(0, 7700)]
    #[case::middle(42, 7742)]
    #[case::last(99, 7799)]
    fn scripted_draw_maps_offset(#[case] drawn: usize, #[case] expected_game: i32) {
        let mut random = MockRandomSource::new();
        random.expect_below().withf(|upper| *upper == 100).return_const(drawn);

        let ports = PortRanges::default().draw(&random);

        assert_eq!(ports.game, expected_game);
        assert_eq!(ports.netimgui, expected_game - 7700 + 7800);
    }

    /// Story: a single-port range always yields that port
    #[test]
    fn story_single_port_range() {
        let ranges = PortRanges {
            game_min: 8000,
            game_max: 8001,
            netimgui_min: 8100,
            status_min: 8200,
        };
        let ports = ranges.draw(&ThreadRandom);
        assert_eq!(
            ports,
            PortAssignment {
                game: 8000,
                netimgui: 8100,
                status: 8200
            }
        );
    }

    #[test]
    fn empty_range_is_rejected() {
        let ranges = PortRanges {
            game_max: 7700,
            ..Default::default()
        };
        assert!(ranges.validate().is_err());
    }

    #[test]
    fn overflowing_companion_range_is_rejected() {
        let ranges = PortRanges {
            status_min: 65500,
            ..Default::default()
        };
        assert!(ranges.validate().is_err());
        assert!(PortRanges::default().validate().is_ok());
    }

    #[test]
    fn thread_random_stays_below_upper() {
        for upper in 1..20 {
            assert!(ThreadRandom.below(upper) < upper);
        }
    }
}
