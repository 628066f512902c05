use std::path::PathBuf;
use std::str::FromStr;

use crate::core::comparator::NormalizationPolicy;

/// Process-wide settings, read once at start and shared read-only.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub default_time_limit_ms: u64,
    pub max_time_limit_ms: u64,
    pub default_memory_limit_bytes: u64,
    pub max_output_bytes: usize,
    pub max_concurrent_sandboxes: usize,
    pub max_queued_submissions: usize,
    pub submission_budget_ms: u64,
    pub build_time_limit_ms: u64,
    pub build_memory_limit_bytes: Option<u64>,
    pub max_test_cases: usize,
    pub scratch_root: PathBuf,
    pub isolation: Isolation,
    /// Extra host paths made visible, read-only, inside the sandbox root.
    pub sandbox_paths: Vec<PathBuf>,
    pub normalization: NormalizationPolicy,
    pub toolchains: Toolchains,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchains {
    pub gnucpp: PathBuf,
    pub gcc: PathBuf,
    pub rustc: PathBuf,
    pub python: PathBuf,
    pub shell: PathBuf,
}

impl Default for Toolchains {
    fn default() -> Self {
        Self {
            gnucpp: "/usr/bin/g++".into(),
            gcc: "/usr/bin/gcc".into(),
            rustc: "rustc".into(),
            python: "/usr/bin/python3".into(),
            shell: "/bin/sh".into(),
        }
    }
}

/// Whether sandboxed programs get private user, pid, mount and network namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    /// Startup fails when the namespaces cannot be created.
    Required,
    /// Use the namespaces when the kernel allows it, warn and run without them otherwise.
    BestEffort,
    Off,
}

impl FromStr for Isolation {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "required" => Ok(Isolation::Required),
            "best-effort" => Ok(Isolation::BestEffort),
            "off" => Ok(Isolation::Off),
            _ => Err(()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("{key} must be greater than zero")]
    Zero { key: &'static str },
    #[error("build time limit of {build_ms} ms does not fit in the submission budget of {budget_ms} ms")]
    BuildExceedsBudget { build_ms: u64, budget_ms: u64 },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let toolchain_defaults = Toolchains::default();
        let path = |key: &str, default: PathBuf| lookup(key).map(PathBuf::from).unwrap_or(default);

        let config = Self {
            listen_addr: lookup("JUDGE_LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            default_time_limit_ms: parse(&lookup, "JUDGE_DEFAULT_TIME_LIMIT_MS")?
                .unwrap_or(defaults.default_time_limit_ms),
            max_time_limit_ms: parse(&lookup, "JUDGE_MAX_TIME_LIMIT_MS")?
                .unwrap_or(defaults.max_time_limit_ms),
            default_memory_limit_bytes: parse(&lookup, "JUDGE_DEFAULT_MEMORY_LIMIT_BYTES")?
                .unwrap_or(defaults.default_memory_limit_bytes),
            max_output_bytes: parse(&lookup, "JUDGE_MAX_OUTPUT_BYTES")?
                .unwrap_or(defaults.max_output_bytes),
            max_concurrent_sandboxes: parse(&lookup, "JUDGE_MAX_CONCURRENT_SANDBOXES")?
                .unwrap_or(defaults.max_concurrent_sandboxes),
            max_queued_submissions: parse(&lookup, "JUDGE_MAX_QUEUED_SUBMISSIONS")?
                .unwrap_or(defaults.max_queued_submissions),
            submission_budget_ms: parse(&lookup, "JUDGE_SUBMISSION_BUDGET_MS")?
                .unwrap_or(defaults.submission_budget_ms),
            build_time_limit_ms: parse(&lookup, "JUDGE_BUILD_TIME_LIMIT_MS")?
                .unwrap_or(defaults.build_time_limit_ms),
            build_memory_limit_bytes: parse(&lookup, "JUDGE_BUILD_MEMORY_LIMIT_BYTES")?,
            max_test_cases: parse(&lookup, "JUDGE_MAX_TEST_CASES")?
                .unwrap_or(defaults.max_test_cases),
            scratch_root: path("JUDGE_SCRATCH_ROOT", defaults.scratch_root),
            isolation: parse(&lookup, "JUDGE_ISOLATION")?.unwrap_or(defaults.isolation),
            sandbox_paths: lookup("JUDGE_SANDBOX_PATHS")
                .map(|paths| {
                    std::env::split_paths(&paths)
                        .filter(|path| !path.as_os_str().is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            normalization: parse(&lookup, "JUDGE_NORMALIZATION")?
                .unwrap_or(defaults.normalization),
            toolchains: Toolchains {
                gnucpp: path("JUDGE_GNUCPP_PATH", toolchain_defaults.gnucpp),
                gcc: path("JUDGE_GCC_PATH", toolchain_defaults.gcc),
                rustc: path("JUDGE_RUSTC_PATH", toolchain_defaults.rustc),
                python: path("JUDGE_PYTHON_PATH", toolchain_defaults.python),
                shell: path("JUDGE_SHELL_PATH", toolchain_defaults.shell),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("JUDGE_DEFAULT_TIME_LIMIT_MS", self.default_time_limit_ms == 0),
            ("JUDGE_MAX_TIME_LIMIT_MS", self.max_time_limit_ms == 0),
            ("JUDGE_DEFAULT_MEMORY_LIMIT_BYTES", self.default_memory_limit_bytes == 0),
            ("JUDGE_MAX_OUTPUT_BYTES", self.max_output_bytes == 0),
            ("JUDGE_MAX_CONCURRENT_SANDBOXES", self.max_concurrent_sandboxes == 0),
            ("JUDGE_SUBMISSION_BUDGET_MS", self.submission_budget_ms == 0),
            ("JUDGE_BUILD_TIME_LIMIT_MS", self.build_time_limit_ms == 0),
            ("JUDGE_MAX_TEST_CASES", self.max_test_cases == 0),
        ];

        if let Some((key, _)) = non_zero.into_iter().find(|(_, is_zero)| *is_zero) {
            return Err(ConfigError::Zero { key });
        }
        if self.build_time_limit_ms > self.submission_budget_ms {
            return Err(ConfigError::BuildExceedsBudget {
                build_ms: self.build_time_limit_ms,
                budget_ms: self.submission_budget_ms,
            });
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7070".to_string(),
            default_time_limit_ms: 2000,
            max_time_limit_ms: 10_000,
            default_memory_limit_bytes: 256 * 1024 * 1024,
            max_output_bytes: 1024 * 1024,
            max_concurrent_sandboxes: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_queued_submissions: 64,
            submission_budget_ms: 30_000,
            build_time_limit_ms: 15_000,
            build_memory_limit_bytes: None,
            max_test_cases: 256,
            scratch_root: std::env::temp_dir().join("judge-runner"),
            isolation: Isolation::BestEffort,
            sandbox_paths: Vec::new(),
            normalization: NormalizationPolicy::TrimTrailingWhitespace,
            toolchains: Toolchains::default(),
        }
    }
}

fn parse<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config.default_time_limit_ms, 2000);
        assert_eq!(config.max_time_limit_ms, 10_000);
        assert_eq!(config.submission_budget_ms, 30_000);
        assert_eq!(config.build_memory_limit_bytes, None);
        assert_eq!(config.isolation, Isolation::BestEffort);
        assert!(config.sandbox_paths.is_empty());
        assert_eq!(
            config.normalization,
            NormalizationPolicy::TrimTrailingWhitespace
        );
        assert!(config.max_concurrent_sandboxes > 0);
        assert_eq!(config.toolchains, Toolchains::default());
    }

    #[test]
    fn test_config_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("JUDGE_DEFAULT_TIME_LIMIT_MS", "500"),
            ("JUDGE_MAX_CONCURRENT_SANDBOXES", " 3 "),
            ("JUDGE_BUILD_MEMORY_LIMIT_BYTES", "1073741824"),
            ("JUDGE_ISOLATION", "required"),
            ("JUDGE_SANDBOX_PATHS", "/opt/gcc:/opt/rust"),
            ("JUDGE_NORMALIZATION", "exact"),
            ("JUDGE_GNUCPP_PATH", "/opt/gcc/bin/g++"),
            ("JUDGE_SCRATCH_ROOT", "/var/tmp/judge"),
        ]))
        .unwrap();

        assert_eq!(config.default_time_limit_ms, 500);
        assert_eq!(config.max_concurrent_sandboxes, 3);
        assert_eq!(config.build_memory_limit_bytes, Some(1024 * 1024 * 1024));
        assert_eq!(config.isolation, Isolation::Required);
        assert_eq!(
            config.sandbox_paths,
            vec![PathBuf::from("/opt/gcc"), PathBuf::from("/opt/rust")]
        );
        assert_eq!(config.normalization, NormalizationPolicy::Exact);
        assert_eq!(config.toolchains.gnucpp, PathBuf::from("/opt/gcc/bin/g++"));
        assert_eq!(config.scratch_root, PathBuf::from("/var/tmp/judge"));
    }

    #[test]
    fn test_config_rejects_garbage() {
        let result = Config::from_lookup(lookup_from(&[("JUDGE_SUBMISSION_BUDGET_MS", "soon")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { key: "JUDGE_SUBMISSION_BUDGET_MS", .. })
        ));

        let result = Config::from_lookup(lookup_from(&[("JUDGE_ISOLATION", "maybe")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_config_rejects_zero_limits() {
        let result = Config::from_lookup(lookup_from(&[("JUDGE_MAX_CONCURRENT_SANDBOXES", "0")]));
        assert!(matches!(
            result,
            Err(ConfigError::Zero { key: "JUDGE_MAX_CONCURRENT_SANDBOXES" })
        ));
    }

    #[test]
    fn test_config_rejects_build_longer_than_budget() {
        let result = Config::from_lookup(lookup_from(&[
            ("JUDGE_SUBMISSION_BUDGET_MS", "5000"),
            ("JUDGE_BUILD_TIME_LIMIT_MS", "15000"),
        ]));
        assert!(matches!(
            result,
            Err(ConfigError::BuildExceedsBudget {
                build_ms: 15000,
                budget_ms: 5000
            })
        ));

        let config = Config::from_lookup(lookup_from(&[
            ("JUDGE_SUBMISSION_BUDGET_MS", "5000"),
            ("JUDGE_BUILD_TIME_LIMIT_MS", "5000"),
        ]))
        .unwrap();
        assert_eq!(config.build_time_limit_ms, 5000);
    }
}
