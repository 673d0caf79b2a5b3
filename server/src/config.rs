//! Runtime configuration for a coordinator instance.

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::net::SocketAddr;
use std::time::Duration;

/// Timing of the election protocol.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Lower bound of the randomized election timeout.
    pub election_timeout_min: Duration,
    /// Upper bound of the randomized election timeout.
    pub election_timeout_max: Duration,
    /// Interval between leader claims while leader.
    pub heartbeat_interval: Duration,
    /// Phi threshold above which a silent leader is presumed dead.
    /// `None` leaves the election timeout as the only failure signal.
    pub phi_threshold: Option<f64>,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(1500),
            election_timeout_max: Duration::from_millis(3000),
            heartbeat_interval: Duration::from_millis(500),
            phi_threshold: None,
        }
    }
}

impl ElectionConfig {
    /// Picks a jittered election timeout within the configured range.
    pub fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = (self.election_timeout_max.as_millis() as u64).max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Short timings for tests and local clusters.
    pub fn fast() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(40),
            phi_threshold: None,
        }
    }
}

/// Leader-only arbitration settings.
#[derive(Debug, Clone)]
pub struct ArbiterConfig {
    /// Number of skill bins; levels are clamped to `0..skill_levels`.
    pub skill_levels: usize,
    /// Name candidates tried before a name request is abandoned.
    pub name_attempts: usize,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            skill_levels: 10,
            name_attempts: 5,
        }
    }
}

/// Everything one coordinator instance needs at startup.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub instance_id: String,
    pub election: ElectionConfig,
    pub arbiter: ArbiterConfig,
    /// How often an uncleared instance re-announces itself.
    pub announce_interval: Duration,
    /// Client listener address, opened once the instance is cleared.
    pub client_addr: SocketAddr,
    pub max_clients: usize,
    /// Silence after which a client is considered gone.
    pub client_timeout: Duration,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            instance_id: generate_instance_id(),
            election: ElectionConfig::default(),
            arbiter: ArbiterConfig::default(),
            announce_interval: Duration::from_secs(1),
            client_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_clients: 256,
            client_timeout: Duration::from_secs(5),
        }
    }
}

/// Random 8-character alphanumeric instance id.
pub fn generate_instance_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_election_timeout_within_range() {
        let config = ElectionConfig::default();
        for _ in 0..100 {
            let timeout = config.random_election_timeout();
            assert!(timeout >= config.election_timeout_min);
            assert!(timeout <= config.election_timeout_max);
        }
    }

    #[test]
    fn test_inverted_range_collapses_to_min() {
        let config = ElectionConfig {
            election_timeout_min: Duration::from_millis(200),
            election_timeout_max: Duration::from_millis(100),
            ..ElectionConfig::default()
        };
        assert_eq!(config.random_election_timeout(), Duration::from_millis(200));
    }

    #[test]
    fn test_heartbeat_shorter_than_election_timeout() {
        for config in [ElectionConfig::default(), ElectionConfig::fast()] {
            assert!(config.heartbeat_interval * 3 <= config.election_timeout_min);
        }
    }

    #[test]
    fn test_instance_ids_are_random() {
        let a = generate_instance_id();
        let b = generate_instance_id();
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}
