use crate::codes::DEFAULT_MAX_ATTEMPTS;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Snapshot file for the local document store; memory only when unset.
    pub local_state_path: Option<PathBuf>,
    pub cors_origins: Vec<String>,
    pub room_code_max_attempts: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            local_state_path: None,
            cors_origins: vec!["http://localhost:5173".to_string()],
            room_code_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl Config {
    /// Reads the process environment. Call `dotenvy::dotenv()` first to pick up `.env`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let host = non_blank(lookup("BACKEND_HOST")).unwrap_or(defaults.host);
        let port = non_blank(lookup("BACKEND_PORT"))
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.port);
        let local_state_path = non_blank(lookup("LOCAL_STATE_PATH")).map(PathBuf::from);
        let cors_origins = non_blank(lookup("CORS_ORIGINS"))
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|o| !o.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|origins| !origins.is_empty())
            .unwrap_or(defaults.cors_origins);
        let room_code_max_attempts = non_blank(lookup("ROOM_CODE_MAX_ATTEMPTS"))
            .and_then(|v| v.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(defaults.room_code_max_attempts);

        Self {
            host,
            port,
            local_state_path,
            cors_origins,
            room_code_max_attempts,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(config(&[]), Config::default());
        assert_eq!(Config::default().bind_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn reads_every_variable() {
        let cfg = config(&[
            ("BACKEND_HOST", "127.0.0.1"),
            ("BACKEND_PORT", "9000"),
            ("LOCAL_STATE_PATH", "/tmp/state.json"),
            ("CORS_ORIGINS", "http://a.test, http://b.test,"),
            ("ROOM_CODE_MAX_ATTEMPTS", "3"),
        ]);
        assert_eq!(cfg.bind_addr(), "127.0.0.1:9000");
        assert_eq!(cfg.local_state_path, Some(PathBuf::from("/tmp/state.json")));
        assert_eq!(cfg.cors_origins, ["http://a.test", "http://b.test"]);
        assert_eq!(cfg.room_code_max_attempts, 3);
    }

    #[test]
    fn unparseable_values_fall_back() {
        let cfg = config(&[
            ("BACKEND_PORT", "eighty"),
            ("ROOM_CODE_MAX_ATTEMPTS", "0"),
            ("LOCAL_STATE_PATH", "  "),
        ]);
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.room_code_max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(cfg.local_state_path.is_none());
    }
}
