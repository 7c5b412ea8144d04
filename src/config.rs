use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const MEBIBYTE: u64 = 1024 * 1024;

const DEFAULT_ALLOWED_ORIGINS: [&str; 3] = [
    "http://localhost:3000",
    "https://framecrush.net",
    "https://www.framecrush.net",
];

/// How long a single transcode may run before the child is killed.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeoutPolicy {
    Unbounded,
    Bounded { base: Duration, per_mebibyte: Duration },
}

impl TimeoutPolicy {
    pub fn timeout_for(&self, input_bytes: u64) -> Option<Duration> {
        match self {
            TimeoutPolicy::Unbounded => None,
            TimeoutPolicy::Bounded { base, per_mebibyte } => {
                let started_mebibytes = input_bytes.div_ceil(MEBIBYTE);
                let extra = per_mebibyte.saturating_mul(started_mebibytes.min(u32::MAX as u64) as u32);
                Some(base.saturating_add(extra))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub port: u16,
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
    pub ffmpeg_program: String,
    pub max_upload_bytes: u64,
    pub timeout: TimeoutPolicy,
    pub allowed_origins: HashSet<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_address: "0.0.0.0".to_owned(),
            port: 3001,
            upload_dir: PathBuf::from("uploads"),
            output_dir: PathBuf::from("outputs"),
            ffmpeg_program: "ffmpeg".to_owned(),
            max_upload_bytes: 150 * MEBIBYTE,
            timeout: TimeoutPolicy::Unbounded,
            allowed_origins: DEFAULT_ALLOWED_ORIGINS
                .iter()
                .map(|origin| origin.to_string())
                .collect(),
        }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("Ignoring invalid value {raw:?} for {key}, using the default");
                default
            }
        },
    }
}

fn parse_seconds(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let raw = lookup(key)?;

    match raw.trim().parse::<u64>() {
        Ok(seconds) => Some(Duration::from_secs(seconds)),
        Err(_) => {
            log::warn!("Ignoring invalid value {raw:?} for {key}");
            None
        }
    }
}

impl Config {
    pub fn from_env() -> Config {
        Config::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Config {
        let defaults = Config::default();

        let base = parse_seconds(&lookup, "JOB_TIMEOUT_SECS");
        let per_mebibyte = parse_seconds(&lookup, "JOB_TIMEOUT_SECS_PER_MB");

        let timeout = match (base, per_mebibyte) {
            (None, None) => TimeoutPolicy::Unbounded,
            (base, per_mebibyte) => TimeoutPolicy::Bounded {
                base: base.unwrap_or_default(),
                per_mebibyte: per_mebibyte.unwrap_or_default(),
            },
        };

        let allowed_origins = match lookup("ALLOWED_ORIGINS") {
            Some(list) => list
                .split(',')
                .map(|origin| origin.trim().trim_end_matches('/'))
                .filter(|origin| !origin.is_empty())
                .map(str::to_owned)
                .collect(),
            None => defaults.allowed_origins,
        };

        Config {
            bind_address: lookup("BIND_ADDRESS").unwrap_or(defaults.bind_address),
            port: parse_or(&lookup, "PORT", defaults.port),
            upload_dir: lookup("UPLOAD_DIR").map(PathBuf::from).unwrap_or(defaults.upload_dir),
            output_dir: lookup("OUTPUT_DIR").map(PathBuf::from).unwrap_or(defaults.output_dir),
            ffmpeg_program: lookup("FFMPEG_PATH").unwrap_or(defaults.ffmpeg_program),
            max_upload_bytes: parse_or(&lookup, "MAX_UPLOAD_BYTES", defaults.max_upload_bytes),
            timeout,
            allowed_origins,
        }
    }

    pub async fn ensure_staging_dirs(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.upload_dir).await?;
        tokio::fs::create_dir_all(&self.output_dir).await?;
        Ok(())
    }
}
