use std::path::PathBuf;

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing the SCRFD and ArcFace ONNX files.
    pub model_dir: PathBuf,
    /// Path to the SQLite catalog.
    pub db_path: PathBuf,
    /// Root directory for uploaded originals and thumbnails.
    pub media_dir: PathBuf,
    /// Number of engine worker threads.
    pub engine_workers: usize,
    /// Pending requests each worker queues before callers wait.
    pub queue_depth: usize,
    /// Matches returned when a request does not specify `k`.
    pub default_matches: usize,
    /// Timeout in seconds for one match request.
    pub match_timeout_secs: u64,
    /// Longest edge of generated thumbnails, in pixels.
    pub thumbnail_size: u32,
    /// Optional TOML file of events created at startup.
    pub seed_file: Option<PathBuf>,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `EVENTLENS_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("eventlens");

        let path = |key: &str, default: PathBuf| var(key).map(PathBuf::from).unwrap_or(default);

        Self {
            model_dir: path("EVENTLENS_MODEL_DIR", data_dir.join("models")),
            db_path: path("EVENTLENS_DB_PATH", data_dir.join("catalog.db")),
            media_dir: path("EVENTLENS_MEDIA_DIR", data_dir.join("media")),
            engine_workers: parsed(&var, "EVENTLENS_ENGINE_WORKERS", 2usize).max(1),
            queue_depth: parsed(&var, "EVENTLENS_QUEUE_DEPTH", 16usize).max(1),
            default_matches: parsed(&var, "EVENTLENS_DEFAULT_MATCHES", 8usize).max(1),
            match_timeout_secs: parsed(&var, "EVENTLENS_MATCH_TIMEOUT_SECS", 30u64),
            thumbnail_size: parsed(&var, "EVENTLENS_THUMBNAIL_SIZE", 320u32).max(16),
            seed_file: var("EVENTLENS_SEED_FILE").filter(|v| !v.is_empty()).map(PathBuf::from),
            bus: match var("EVENTLENS_BUS").as_deref() {
                Some("system") => BusKind::System,
                _ => BusKind::Session,
            },
        }
    }
}

fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_under_xdg_data_home() {
        let c = config(&[("XDG_DATA_HOME", "/data")]);
        assert_eq!(c.model_dir, PathBuf::from("/data/eventlens/models"));
        assert_eq!(c.db_path, PathBuf::from("/data/eventlens/catalog.db"));
        assert_eq!(c.media_dir, PathBuf::from("/data/eventlens/media"));
        assert_eq!(c.engine_workers, 2);
        assert_eq!(c.queue_depth, 16);
        assert_eq!(c.default_matches, 8);
        assert_eq!(c.match_timeout_secs, 30);
        assert_eq!(c.thumbnail_size, 320);
        assert_eq!(c.seed_file, None);
        assert_eq!(c.bus, BusKind::Session);
    }

    #[test]
    fn test_falls_back_to_home() {
        let c = config(&[("HOME", "/home/ana")]);
        assert_eq!(c.db_path, PathBuf::from("/home/ana/.local/share/eventlens/catalog.db"));
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let c = config(&[
            ("EVENTLENS_DB_PATH", "/var/lib/eventlens/db.sqlite"),
            ("EVENTLENS_ENGINE_WORKERS", "0"),
            ("EVENTLENS_DEFAULT_MATCHES", "twelve"),
            ("EVENTLENS_SEED_FILE", "/etc/eventlens/events.toml"),
            ("EVENTLENS_BUS", "system"),
        ]);
        assert_eq!(c.db_path, PathBuf::from("/var/lib/eventlens/db.sqlite"));
        assert_eq!(c.engine_workers, 1);
        assert_eq!(c.default_matches, 8);
        assert_eq!(c.seed_file, Some(PathBuf::from("/etc/eventlens/events.toml")));
        assert_eq!(c.bus, BusKind::System);
    }
}
