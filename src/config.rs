use std::net::{IpAddr, Ipv4Addr};

use crate::world::interest::DEFAULT_INTEREST_RADIUS;
use crate::world::spatial::DEFAULT_WORLD_EXTENT;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub bind_address: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Simulation ticks per second
    pub tick_rate: u32,
    /// Interest query radius in world units
    pub interest_radius: f32,
    /// Half-extent of the spatial index bounds
    pub world_extent: f32,
    /// Maximum concurrent peer connections
    pub max_connections: usize,
    /// Seconds of inactivity before a connection is swept
    pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 7777,
            tick_rate: 30,
            interest_radius: DEFAULT_INTEREST_RADIUS,
            world_extent: DEFAULT_WORLD_EXTENT,
            max_connections: 64,
            idle_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BIND_ADDRESS") {
            if let Ok(parsed) = addr.parse() {
                config.bind_address = parsed;
            } else {
                tracing::warn!("Invalid BIND_ADDRESS '{}', using default", addr);
            }
        }

        if let Ok(port) = std::env::var("PORT") {
            if let Ok(parsed) = port.parse::<u16>() {
                if parsed > 0 {
                    config.port = parsed;
                } else {
                    tracing::warn!("PORT must be > 0, using default");
                }
            } else {
                tracing::warn!("Invalid PORT '{}', using default", port);
            }
        }

        if let Ok(rate) = std::env::var("TICK_RATE") {
            if let Ok(parsed) = rate.parse::<u32>() {
                if (1..=240).contains(&parsed) {
                    config.tick_rate = parsed;
                } else {
                    tracing::warn!("TICK_RATE must be 1-240, using default");
                }
            } else {
                tracing::warn!("Invalid TICK_RATE '{}', using default", rate);
            }
        }

        if let Ok(radius) = std::env::var("INTEREST_RADIUS") {
            if let Ok(parsed) = radius.parse::<f32>() {
                if parsed > 0.0 {
                    config.interest_radius = parsed;
                } else {
                    tracing::warn!("INTEREST_RADIUS must be positive, using default");
                }
            } else {
                tracing::warn!("Invalid INTEREST_RADIUS '{}', using default", radius);
            }
        }

        if let Ok(max) = std::env::var("MAX_CONNECTIONS") {
            if let Ok(parsed) = max.parse::<usize>() {
                if parsed > 0 && parsed <= 10000 {
                    config.max_connections = parsed;
                } else {
                    tracing::warn!("MAX_CONNECTIONS must be 1-10000, using default");
                }
            } else {
                tracing::warn!("Invalid MAX_CONNECTIONS '{}', using default", max);
            }
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("Port cannot be 0".to_string());
        }
        if self.tick_rate == 0 {
            return Err("tick_rate must be at least 1".to_string());
        }
        if self.interest_radius <= 0.0 {
            return Err("interest_radius must be positive".to_string());
        }
        if self.world_extent <= 0.0 {
            return Err("world_extent must be positive".to_string());
        }
        if self.max_connections == 0 {
            return Err("max_connections must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 7777);
        assert_eq!(config.tick_rate, 30);
        assert_eq!(config.interest_radius, 80.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let mut config = ServerConfig::default();
        config.interest_radius = 0.0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.max_connections = 0;
        assert!(config.validate().is_err());
    }
}
