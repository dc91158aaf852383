//! Operator configuration
//!
//! Values are read once at startup from flags or environment and shared by
//! both controllers.

use std::time::Duration;

use crate::random::PortRanges;
use crate::Error;

/// Default periodic resync interval
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Settings shared by the controllers
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Image repository for game servers; the server version becomes the tag
    pub game_server_image: String,
    /// Host port ranges drawn from for each pod
    pub ports: PortRanges,
    /// Interval after which every object is reconciled again
    pub resync_interval: Duration,
}

impl OperatorConfig {
    /// Configuration with default ports and resync interval
    pub fn new(game_server_image: impl Into<String>) -> Self {
        Self {
            game_server_image: game_server_image.into(),
            ports: PortRanges::default(),
            resync_interval: DEFAULT_RESYNC_INTERVAL,
        }
    }

    /// Set the port ranges
    pub fn with_ports(mut self, ports: PortRanges) -> Self {
        self.ports = ports;
        self
    }

    /// Set the resync interval
    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// Reject configurations the controllers cannot work with
    pub fn validate(&self) -> Result<(), Error> {
        if self.game_server_image.trim().is_empty() {
            return Err(Error::config("game server image must not be empty"));
        }
        if self.game_server_image.contains(char::is_whitespace) {
            return Err(Error::config(format!(
                "game server image contains whitespace: {:?}",
                self.game_server_image
            )));
        }
        if self.resync_interval.is_zero() {
            return Err(Error::config("resync interval must be positive"));
        }
        self.ports.validate()
    }

    /// Image reference for a given server version
    pub fn image_for(&self, version: &str) -> String {
        format!("{}:{}", self.game_server_image, version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = OperatorConfig::new("registry.example/game-server");
        assert!(config.validate().is_ok());
        assert_eq!(config.resync_interval, Duration::from_secs(60));
        assert_eq!(config.ports.game_min, 7700);
        assert_eq!(config.ports.game_max, 7800);
    }

    #[test]
    fn image_tag_is_the_version() {
        let config = OperatorConfig::new("registry.example/game-server");
        assert_eq!(
            config.image_for("abc12345"),
            "registry.example/game-server:abc12345"
        );
    }

    #[test]
    fn empty_image_is_rejected() {
        let err = OperatorConfig::new("  ").validate().unwrap_err();
        assert!(err.to_string().contains("image"));
    }

    #[test]
    fn zero_resync_is_rejected() {
        let config = OperatorConfig::new("img").with_resync_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_port_range_is_rejected() {
        let config = OperatorConfig::new("img").with_ports(PortRanges {
            game_min: 7800,
            game_max: 7700,
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }
}
