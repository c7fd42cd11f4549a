use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::sync::index::default_db_path;
use crate::sync::paths::normalize_server_path;
use crate::sync::record::Account;

const DEFAULT_REMOTE_ROOT: &str = "/";
const DEFAULT_POLL_SECS: u64 = 30;
const DEFAULT_VERIFY_SECS: u64 = 300;
const DEFAULT_MAX_PARALLEL_FOLDERS: u64 = 4;
const DEFAULT_PAGE_SIZE: u64 = 200;

#[derive(Clone)]
pub struct DaemonConfig {
    pub server_url: String,
    pub token: String,
    pub account: Account,
    pub remote_root: String,
    pub db_path: PathBuf,
    pub poll_interval: Duration,
    pub verify_interval: Duration,
    pub max_parallel_folders: usize,
    pub page_size: u32,
    pub verify_with_download: bool,
}

impl fmt::Debug for DaemonConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonConfig")
            .field("server_url", &self.server_url)
            .field("token", &"<redacted>")
            .field("account", &self.account)
            .field("remote_root", &self.remote_root)
            .field("db_path", &self.db_path)
            .field("poll_interval", &self.poll_interval)
            .field("verify_interval", &self.verify_interval)
            .field("max_parallel_folders", &self.max_parallel_folders)
            .field("page_size", &self.page_size)
            .field("verify_with_download", &self.verify_with_download)
            .finish()
    }
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .with_context(|| format!("{name} is not set"))
        };
        let server_url = required("CLOUDSYNC_SERVER_URL")?;
        let token = required("CLOUDSYNC_TOKEN")?;
        let account = Account::new(required("CLOUDSYNC_ACCOUNT")?);

        let remote_root = lookup("CLOUDSYNC_REMOTE_ROOT")
            .unwrap_or_else(|| DEFAULT_REMOTE_ROOT.to_string());
        let remote_root = normalize_server_path(&remote_root)
            .with_context(|| format!("invalid CLOUDSYNC_REMOTE_ROOT {remote_root:?}"))?;

        let db_path = match lookup("CLOUDSYNC_DB_PATH") {
            Some(value) if value.starts_with('~') => {
                let home = dirs::home_dir().context("home directory is unavailable")?;
                expand_with_home(&value, &home)
            }
            Some(value) => PathBuf::from(value),
            None => default_db_path().context("no data directory for the index database")?,
        };

        let read_u64 = |name: &str, default: u64| read_u64_value(lookup(name), default);
        Ok(Self {
            server_url,
            token,
            account,
            remote_root,
            db_path,
            poll_interval: Duration::from_secs(read_u64("CLOUDSYNC_POLL_SECS", DEFAULT_POLL_SECS)),
            verify_interval: Duration::from_secs(read_u64(
                "CLOUDSYNC_VERIFY_SECS",
                DEFAULT_VERIFY_SECS,
            )),
            max_parallel_folders: read_u64(
                "CLOUDSYNC_MAX_PARALLEL_FOLDERS",
                DEFAULT_MAX_PARALLEL_FOLDERS,
            ) as usize,
            page_size: read_u64("CLOUDSYNC_PAGE_SIZE", DEFAULT_PAGE_SIZE).min(u64::from(u32::MAX))
                as u32,
            verify_with_download: read_bool_value(lookup("CLOUDSYNC_VERIFY_WITH_DOWNLOAD"), false),
        })
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_value(value: Option<String>, default: u64) -> u64 {
    value
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_value(value: Option<String>, default: bool) -> bool {
    value
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("CLOUDSYNC_SERVER_URL", "https://cloud.example.com"),
        ("CLOUDSYNC_TOKEN", "secret"),
        ("CLOUDSYNC_ACCOUNT", "alice"),
    ];

    #[test]
    fn expands_tilde_to_home() {
        let home = PathBuf::from("/tmp/home-user");
        assert_eq!(
            expand_with_home("~/sync/index.db", &home),
            PathBuf::from("/tmp/home-user/sync/index.db")
        );
        assert_eq!(expand_with_home("/var/db", &home), PathBuf::from("/var/db"));
    }

    #[test]
    fn numeric_values_fall_back_to_default() {
        assert_eq!(read_u64_value(None, 42), 42);
        assert_eq!(read_u64_value(Some("0".into()), 42), 42);
        assert_eq!(read_u64_value(Some("soon".into()), 42), 42);
        assert_eq!(read_u64_value(Some(" 7 ".into()), 42), 7);
    }

    #[test]
    fn bool_values_accept_common_spellings() {
        assert!(read_bool_value(Some("Yes".into()), false));
        assert!(!read_bool_value(Some("off".into()), true));
        assert!(read_bool_value(None, true));
    }

    #[test]
    fn missing_required_key_is_reported() {
        let err = DaemonConfig::from_lookup(lookup_from(&REQUIRED[..2])).unwrap_err();
        assert!(err.to_string().contains("CLOUDSYNC_ACCOUNT"));
    }

    #[test]
    fn reads_values_and_defaults() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("CLOUDSYNC_REMOTE_ROOT", "/Photos/"));
        pairs.push(("CLOUDSYNC_DB_PATH", "/tmp/cloudsync-test.db"));
        pairs.push(("CLOUDSYNC_POLL_SECS", "5"));
        pairs.push(("CLOUDSYNC_VERIFY_WITH_DOWNLOAD", "true"));

        let config = DaemonConfig::from_lookup(lookup_from(&pairs)).unwrap();
        assert_eq!(config.account, Account::new("alice"));
        assert_eq!(config.remote_root, "/Photos");
        assert_eq!(config.db_path, PathBuf::from("/tmp/cloudsync-test.db"));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.verify_interval, Duration::from_secs(300));
        assert_eq!(config.max_parallel_folders, 4);
        assert_eq!(config.page_size, 200);
        assert!(config.verify_with_download);
        assert!(!format!("{config:?}").contains("secret"));
    }

    #[test]
    fn rejects_parent_components_in_remote_root() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("CLOUDSYNC_REMOTE_ROOT", "/a/../b"));
        pairs.push(("CLOUDSYNC_DB_PATH", "/tmp/cloudsync-test.db"));
        assert!(DaemonConfig::from_lookup(lookup_from(&pairs)).is_err());
    }
}
