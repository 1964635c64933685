use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct SwitchboardConfig {
    #[envconfig(from = "SHARDLINE_MAX_OPEN", default = "16")]
    pub max_open: u64,

    #[envconfig(from = "SHARDLINE_MAX_IDLE", default = "4")]
    pub max_idle: u64,

    #[envconfig(from = "SHARDLINE_GET_TIMEOUT_MS", default = "30000")]
    pub get_timeout_ms: u64,

    /// Overrides the adapter's IN-list limit when set.
    #[envconfig(from = "SHARDLINE_IN_CLAUSE_LENGTH")]
    pub in_clause_length: Option<usize>,

    /// Username every pool connects with, whatever the server config says.
    #[envconfig(from = "SHARDLINE_USERNAME")]
    pub username: Option<String>,

    #[envconfig(from = "SHARDLINE_SERVERS_FILE")]
    pub servers_file: Option<String>,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            max_open: 16,
            max_idle: 4,
            get_timeout_ms: 30000,
            in_clause_length: None,
            username: None,
            servers_file: None,
        }
    }
}

impl SwitchboardConfig {
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_open: self.max_open,
            max_idle: self.max_idle,
            get_timeout: if self.get_timeout_ms == 0 {
                None
            } else {
                Some(Duration::from_millis(self.get_timeout_ms))
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_open: u64,
    pub max_idle: u64,
    pub get_timeout: Option<Duration>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        SwitchboardConfig::default().pool_settings()
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_from_env_map() {
        let env = HashMap::from([
            ("SHARDLINE_MAX_OPEN".to_string(), "2".to_string()),
            ("SHARDLINE_GET_TIMEOUT_MS".to_string(), "0".to_string()),
            ("SHARDLINE_USERNAME".to_string(), "deployer".to_string()),
        ]);
        let conf = SwitchboardConfig::init_from_hashmap(&env).unwrap();
        assert_eq!(conf.max_open, 2);
        assert_eq!(conf.max_idle, 4);
        assert_eq!(conf.username.as_deref(), Some("deployer"));
        assert_eq!(conf.in_clause_length, None);
        let settings = conf.pool_settings();
        assert_eq!(settings.get_timeout, None);
        assert_eq!(settings.max_open, 2);
    }

    #[test]
    fn test_default_matches_env_defaults() {
        let conf = SwitchboardConfig::init_from_hashmap(&HashMap::new()).unwrap();
        assert_eq!(conf.pool_settings(), PoolSettings::default());
    }
}
