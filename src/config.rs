use std::error::Error;
use std::path::{Path, PathBuf};

pub const BASE_DIR_ENV: &str = "SRSAVE_BASE_DIR";

pub const DEFAULT_MAX_ATTACHMENT_SIZE: u64 = 50 * 1024 * 1024;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Everything a dispatch run needs to know about its surroundings.
///
/// The base directory is always handed in explicitly; nothing here looks at
/// the working directory.
#[derive(Debug, Clone)]
pub struct Config {
    pub base_dir: PathBuf,
    pub rules_file: PathBuf,
    pub log_dir: PathBuf,
    pub lock_file: PathBuf,
    pub max_attachment_size: u64,
    pub max_message_size: usize,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn from_base_dir(base_dir: impl Into<PathBuf>) -> Config {
        Config::builder().base_dir(base_dir).build()
    }
}

#[derive(Default)]
pub struct ConfigBuilder {
    base_dir: PathBuf,
    rules_file: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    lock_file: Option<PathBuf>,
    max_attachment_size: Option<u64>,
    max_message_size: Option<usize>,
}

impl ConfigBuilder {
    pub fn base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    pub fn rules_file(mut self, rules_file: impl Into<PathBuf>) -> Self {
        self.rules_file = Some(rules_file.into());
        self
    }

    pub fn log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(log_dir.into());
        self
    }

    pub fn lock_file(mut self, lock_file: impl Into<PathBuf>) -> Self {
        self.lock_file = Some(lock_file.into());
        self
    }

    pub fn max_attachment_size(mut self, bytes: u64) -> Self {
        self.max_attachment_size = Some(bytes);
        self
    }

    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = Some(bytes);
        self
    }

    pub fn build(self) -> Config {
        let base = self.base_dir;
        Config {
            rules_file: self
                .rules_file
                .unwrap_or_else(|| base.join("Config").join("subject_rules.csv")),
            log_dir: self.log_dir.unwrap_or_else(|| base.join("Logs")),
            lock_file: self.lock_file.unwrap_or_else(|| base.join(".srsave.lock")),
            max_attachment_size: self
                .max_attachment_size
                .unwrap_or(DEFAULT_MAX_ATTACHMENT_SIZE),
            max_message_size: self.max_message_size.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE),
            base_dir: base,
        }
    }
}

/// Pick the base directory: an explicit value wins, the environment lookup is
/// only consulted when there is none.
pub fn resolve_base_dir(
    explicit: Option<&Path>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<PathBuf, Box<dyn Error>> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }
    match env_lookup(BASE_DIR_ENV) {
        Some(dir) if !dir.trim().is_empty() => Ok(PathBuf::from(dir.trim())),
        _ => Err(format!("no base directory: use --base-dir or set {BASE_DIR_ENV}").into()),
    }
}

#[test]
fn test_defaults_follow_base_dir() {
    let config = Config::from_base_dir("/srv/srsave");
    assert_eq!(
        config.rules_file,
        Path::new("/srv/srsave/Config/subject_rules.csv")
    );
    assert_eq!(config.log_dir, Path::new("/srv/srsave/Logs"));
    assert_eq!(config.lock_file, Path::new("/srv/srsave/.srsave.lock"));
    assert_eq!(config.max_attachment_size, 50 * 1024 * 1024);
}

#[test]
fn test_builder_overrides() {
    let config = Config::builder()
        .base_dir("/b")
        .rules_file("/etc/srsave/rules.csv")
        .max_attachment_size(10)
        .build();
    assert_eq!(config.rules_file, Path::new("/etc/srsave/rules.csv"));
    assert_eq!(config.log_dir, Path::new("/b/Logs"));
    assert_eq!(config.max_attachment_size, 10);
}

#[test]
fn test_resolve_base_dir() {
    let env = |key: &str| (key == BASE_DIR_ENV).then(|| "/from/env".to_string());
    let no_env = |_: &str| None;
    assert_eq!(
        resolve_base_dir(Some(Path::new("/explicit")), env).unwrap(),
        Path::new("/explicit")
    );
    assert_eq!(
        resolve_base_dir(None, env).unwrap(),
        Path::new("/from/env")
    );
    resolve_base_dir(None, no_env).unwrap_err();
    resolve_base_dir(None, |_: &str| Some("  ".to_string())).unwrap_err();
}
