//! Orchestrator settings and the server's bind address.
//!
//! `Settings` come from an optional YAML file where every field has a
//! default. The server's own YAML config is only read for
//! `modules.api_ingress.config.bind_addr`; that value is required.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::aggregate::Layout;
use crate::error::{CovrunError, Result};
use crate::report::DEFAULT_THRESHOLD;
use crate::workload::CommandSpec;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub project_root: PathBuf,
    /// Artifacts land in `<output_root>/<mode>/`, relative to the project root.
    pub output_root: PathBuf,
    pub threshold: u64,
    pub server_host: String,
    /// Server config, relative to the project root.
    pub server_config: PathBuf,
    pub health_paths: Vec<String>,
    pub readiness_timeout_secs: u64,
    pub drain_timeout_secs: u64,
    pub log_tail_lines: usize,
    pub layout: Layout,
    pub unit_tests: CommandSpec,
    pub integration_tests: CommandSpec,
    pub server: CommandSpec,
    /// Appended to the server command; `{config}` becomes the config path.
    pub server_config_args: Vec<String>,
    /// Variable the unit tests read the config path from.
    pub config_env_var: String,
    /// Variable the integration tests read the server URL from.
    pub base_url_env_var: String,
    /// Value of `LLVM_PROFILE_FILE` for the server process.
    pub profile_file_pattern: String,
    /// Directory scanned for `*.profraw` files after the server stops.
    pub profile_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            output_root: PathBuf::from("coverage"),
            threshold: DEFAULT_THRESHOLD,
            server_host: "127.0.0.1".to_string(),
            server_config: PathBuf::from("config/e2e-local.yaml"),
            health_paths: vec!["/healthz".to_string(), "/health".to_string()],
            readiness_timeout_secs: 90,
            drain_timeout_secs: 15,
            log_tail_lines: 200,
            layout: Layout::default(),
            unit_tests: CommandSpec::new("cargo", ["llvm-cov", "--all-features", "--no-report"]),
            integration_tests: CommandSpec::new("python3", ["-m", "pytest", "testing/e2e", "-vv"])
                .with_fatal_exit_codes(&[3, 4]),
            server: CommandSpec::new(
                "cargo",
                ["llvm-cov", "run", "--bin", "hyperspot-server", "--no-report"],
            ),
            server_config_args: ["--", "--config", "{config}", "run"]
                .iter()
                .map(|a| (*a).to_string())
                .collect(),
            config_env_var: "HYPERSPOT_CONFIG".to_string(),
            base_url_env_var: "E2E_BASE_URL".to_string(),
            profile_file_pattern: "target/llvm-cov-target/hyperspot-%p-%m.profraw".to_string(),
            profile_dir: PathBuf::from("target/llvm-cov-target"),
        }
    }
}

impl Settings {
    /// Load settings from a YAML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CovrunError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_yaml(&content).map_err(|e| CovrunError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// The server command with the config arguments filled in.
    pub fn server_command(&self, config_path: &Path) -> CommandSpec {
        let config = config_path.to_string_lossy();
        let mut command = self.server.clone();
        command.args.extend(
            self.server_config_args
                .iter()
                .map(|a| a.replace("{config}", &config)),
        );
        command
    }

    /// Resolve `path` against the project root unless it is absolute.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }
}

/// Host and port the server binds to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindAddr {
    pub host: String,
    pub port: u16,
}

impl BindAddr {
    /// Parse a `host:port` string. The port is taken after the last colon.
    pub fn parse(s: &str) -> std::result::Result<Self, String> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("invalid bind_addr format: {s}"))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid port number in bind_addr: {s}"))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Read `modules.api_ingress.config.bind_addr` from the server config.
    pub fn from_server_config(path: &Path) -> Result<Self> {
        let config_err = |reason: String| CovrunError::Config {
            path: path.to_path_buf(),
            reason,
        };
        let content = std::fs::read_to_string(path).map_err(|e| config_err(e.to_string()))?;
        let file: ServerConfigFile =
            serde_yaml::from_str(&content).map_err(|e| config_err(e.to_string()))?;
        Self::parse(&file.modules.api_ingress.config.bind_addr).map_err(config_err)
    }
}

#[derive(Deserialize)]
struct ServerConfigFile {
    modules: ModulesSection,
}

#[derive(Deserialize)]
struct ModulesSection {
    api_ingress: ModuleEntry,
}

#[derive(Deserialize)]
struct ModuleEntry {
    config: ApiIngressConfig,
}

#[derive(Deserialize)]
struct ApiIngressConfig {
    bind_addr: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_addr_parse() {
        assert_eq!(
            BindAddr::parse("127.0.0.1:8087").unwrap(),
            BindAddr {
                host: "127.0.0.1".to_string(),
                port: 8087
            }
        );
        assert_eq!(BindAddr::parse("[::1]:9000").unwrap().port, 9000);
        assert!(BindAddr::parse("localhost").is_err());
        assert!(BindAddr::parse("localhost:http").is_err());
        assert!(BindAddr::parse("localhost:70000").is_err());
    }

    #[test]
    fn test_bind_addr_from_server_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("e2e-local.yaml");
        std::fs::write(
            &path,
            "server:\n  home_dir: /tmp\nmodules:\n  api_ingress:\n    config:\n      bind_addr: \"127.0.0.1:8087\"\n      cors_enabled: true\n",
        )
        .unwrap();
        let addr = BindAddr::from_server_config(&path).unwrap();
        assert_eq!(addr.port, 8087);
    }

    #[test]
    fn test_bind_addr_missing_field_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("e2e-local.yaml");
        std::fs::write(&path, "modules:\n  api_ingress:\n    config: {}\n").unwrap();
        let err = BindAddr::from_server_config(&path).unwrap_err();
        assert!(matches!(err, CovrunError::Config { .. }));
        assert!(err.to_string().contains("bind_addr"), "{err}");
    }

    #[test]
    fn test_bind_addr_missing_file_is_fatal() {
        let err = BindAddr::from_server_config(Path::new("/nonexistent/covrun.yaml")).unwrap_err();
        assert!(matches!(err, CovrunError::Config { .. }));
    }

    #[test]
    fn test_settings_defaults() {
        let s = Settings::from_yaml("").unwrap();
        assert_eq!(s.threshold, 70);
        assert_eq!(s.health_paths, vec!["/healthz", "/health"]);
        assert_eq!(s.readiness_timeout(), Duration::from_secs(90));
        assert_eq!(s.integration_tests.fatal_exit_codes, vec![3, 4]);
        assert_eq!(s.layout.library_root, "libs");
    }

    #[test]
    fn test_settings_partial_override() {
        let yaml = r#"
threshold: 85
drain_timeout_secs: 5
layout:
  library_root: crates
integration_tests:
  program: pytest
  args: ["tests/e2e"]
"#;
        let s = Settings::from_yaml(yaml).unwrap();
        assert_eq!(s.threshold, 85);
        assert_eq!(s.drain_timeout(), Duration::from_secs(5));
        assert_eq!(s.layout.library_root, "crates");
        assert_eq!(s.layout.module_root, "modules");
        assert_eq!(s.integration_tests.program, "pytest");
        assert!(s.integration_tests.fatal_exit_codes.is_empty());
        assert_eq!(s.server_host, "127.0.0.1");
    }

    #[test]
    fn test_settings_rejects_bad_types() {
        assert!(Settings::from_yaml("threshold: lots\n").is_err());
    }

    #[test]
    fn test_server_command() {
        let s = Settings::default();
        let cmd = s.server_command(Path::new("/work/config/e2e-local.yaml"));
        assert_eq!(
            cmd.to_string(),
            "cargo llvm-cov run --bin hyperspot-server --no-report -- --config /work/config/e2e-local.yaml run"
        );
    }

    #[test]
    fn test_resolve() {
        let s = Settings {
            project_root: PathBuf::from("/work"),
            ..Settings::default()
        };
        assert_eq!(s.resolve(Path::new("config/a.yaml")), PathBuf::from("/work/config/a.yaml"));
        assert_eq!(s.resolve(Path::new("/etc/a.yaml")), PathBuf::from("/etc/a.yaml"));
    }
}
