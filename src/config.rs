//! Server configuration: command-line flags layered over an optional YAML file
//!
//! Precedence is flags, then the configuration file, then built-in defaults.
//! The file is `--config` when given, otherwise `.rssh.yml` (or `.rssh.yaml`)
//! in the current directory and then in the home directory.

use anyhow::{bail, Context, Result};
use clap::Args;
use rssh_control::ExecutorConfig;
use rssh_gatekeeper::{GateKeeperConfig, PortRange};
use rssh_router::is_valid_domain;
use rssh_server_http::DispatcherConfig;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const CONFIG_FILE_NAMES: &[&str] = &[".rssh.yml", ".rssh.yaml"];

const DEFAULT_ADDR: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_STORE: &str = "sqlite::memory:";
const DEFAULT_PORT_RANGE: &str = "31240-65535";
const DEFAULT_GATE_HOST: &str = "0.0.0.0";
const DEFAULT_CONTROL_ADDR: &str = "0.0.0.0:2222";
const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_LEASE_TTL_SECS: u64 = 30;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// Flags of `rssh server`
///
/// Everything is optional here so a flag that was not given can fall back to
/// the configuration file before the default applies.
#[derive(Args, Debug, Default)]
pub struct ServerArgs {
    /// Address the HTTP dispatcher listens on [default: 0.0.0.0]
    #[arg(short = 'a', long)]
    pub addr: Option<String>,

    /// Port the HTTP dispatcher listens on [default: 8080]
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Root domain tunnels are served under (e.g. tunnel.example.com)
    #[arg(short = 'd', long)]
    pub domain: Option<String>,

    /// Slot store endpoints, comma-separated or repeated [default: sqlite::memory:]
    ///
    /// `memory://` keeps gates in process; anything else is a database URL.
    #[arg(short = 'e', long = "store", alias = "etcd")]
    pub store: Vec<String>,

    /// Gate port range as LOW-HIGH [default: 31240-65535]
    #[arg(short = 'r', long)]
    pub port_range: Option<String>,

    /// Public host gates are bound on, repeatable [default: 0.0.0.0]
    #[arg(long = "gate-host")]
    pub gate_hosts: Vec<String>,

    /// Address agents connect to for the control channel [default: 0.0.0.0:2222]
    #[arg(long)]
    pub control_addr: Option<String>,

    /// Port advertised in public URLs, when a proxy fronts the dispatcher
    #[arg(long)]
    pub public_port: Option<u16>,

    /// JWT secret agents must sign their tokens with (no authentication if unset)
    #[arg(long, env = "RSSH_JWT_SECRET")]
    pub jwt_secret: Option<String>,

    /// Seconds an agent has to connect back to its gate [default: 10]
    #[arg(long)]
    pub handshake_timeout: Option<u64>,

    /// Seconds a gate reservation lives without renewal [default: 30]
    #[arg(long)]
    pub lease_ttl: Option<u64>,

    /// Seconds without traffic before a tunnel is closed [default: 300]
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Configuration file (YAML)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,
}

/// Contents of `.rssh.yml`; every key is optional
#[derive(Debug, Default, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileConfig {
    pub addr: Option<String>,
    pub port: Option<u16>,
    pub domain: Option<String>,
    #[serde(default, alias = "etcd")]
    pub store: Vec<String>,
    pub port_range: Option<String>,
    #[serde(default)]
    pub gate_hosts: Vec<String>,
    pub control_addr: Option<String>,
    pub public_port: Option<u16>,
    pub jwt_secret: Option<String>,
    pub handshake_timeout: Option<u64>,
    pub lease_ttl: Option<u64>,
    pub idle_timeout: Option<u64>,
}

impl FileConfig {
    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).context("Failed to parse configuration file")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid configuration in {}", path.display()))
    }
}

/// First configuration file found in `dirs`, in order
pub fn discover_from(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .flat_map(|dir| CONFIG_FILE_NAMES.iter().map(move |name| dir.join(name)))
        .find(|path| path.is_file())
}

/// Load the configuration file for this run
///
/// A missing file is not an error: the server runs on flags and defaults.
/// A file that exists but does not parse is.
pub fn load_config(explicit: Option<&Path>) -> Result<FileConfig> {
    let path = match explicit {
        Some(path) if path.is_file() => Some(path.to_path_buf()),
        Some(path) => {
            warn!("Configuration file {} not found, using flags and defaults", path.display());
            None
        }
        None => {
            let mut search = Vec::new();
            if let Ok(cwd) = std::env::current_dir() {
                search.push(cwd);
            }
            if let Some(home) = dirs::home_dir() {
                search.push(home);
            }
            let found = discover_from(&search);
            if found.is_none() {
                warn!("No .rssh.yml found in the current or home directory, using flags and defaults");
            }
            found
        }
    };

    match path {
        Some(path) => {
            let config = FileConfig::load(&path)?;
            info!("Configuration file loaded: {}", path.display());
            Ok(config)
        }
        None => Ok(FileConfig::default()),
    }
}

/// Split comma-separated values, dropping empty parts
pub fn split_parts(values: &[String]) -> Vec<String> {
    values
        .iter()
        .flat_map(|value| value.split(','))
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// Fully resolved server settings
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub http_addr: SocketAddr,
    pub root_domain: String,
    pub store_endpoints: Vec<String>,
    pub port_range: PortRange,
    pub gate_hosts: Vec<String>,
    pub control_addr: SocketAddr,
    pub public_port: u16,
    pub jwt_secret: Option<String>,
    pub handshake_timeout: Duration,
    pub lease_ttl: Duration,
    pub idle_timeout: Duration,
}

impl ServerSettings {
    pub fn resolve(args: &ServerArgs, file: FileConfig) -> Result<Self> {
        let Some(root_domain) = args.domain.clone().or(file.domain) else {
            bail!("A root domain is required (--domain or `domain:` in .rssh.yml)");
        };
        if !is_valid_domain(&root_domain) {
            bail!("Invalid root domain: {}", root_domain);
        }

        let addr = args.addr.clone().or(file.addr).unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let ip: IpAddr = addr
            .parse()
            .with_context(|| format!("Invalid listen address: {}", addr))?;
        let port = args.port.or(file.port).unwrap_or(DEFAULT_PORT);

        let store_endpoints = pick_list(&args.store, &file.store, DEFAULT_STORE);
        let gate_hosts = pick_list(&args.gate_hosts, &file.gate_hosts, DEFAULT_GATE_HOST);

        let port_range = args
            .port_range
            .clone()
            .or(file.port_range)
            .unwrap_or_else(|| DEFAULT_PORT_RANGE.to_string());
        let port_range: PortRange = port_range.parse()?;

        let control_addr = args
            .control_addr
            .clone()
            .or(file.control_addr)
            .unwrap_or_else(|| DEFAULT_CONTROL_ADDR.to_string());
        let control_addr: SocketAddr = control_addr
            .parse()
            .with_context(|| format!("Invalid control address: {}", control_addr))?;

        let seconds = |flag: Option<u64>, file: Option<u64>, default: u64| {
            Duration::from_secs(flag.or(file).unwrap_or(default))
        };

        Ok(Self {
            http_addr: SocketAddr::new(ip, port),
            root_domain,
            store_endpoints,
            port_range,
            gate_hosts,
            control_addr,
            public_port: args.public_port.or(file.public_port).unwrap_or(port),
            jwt_secret: args.jwt_secret.clone().or(file.jwt_secret),
            handshake_timeout: seconds(
                args.handshake_timeout,
                file.handshake_timeout,
                DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            ),
            lease_ttl: seconds(args.lease_ttl, file.lease_ttl, DEFAULT_LEASE_TTL_SECS),
            idle_timeout: seconds(args.idle_timeout, file.idle_timeout, DEFAULT_IDLE_TIMEOUT_SECS),
        })
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        let gatekeeper = GateKeeperConfig::new(self.gate_hosts.clone(), self.port_range)
            .with_lease_ttl(self.lease_ttl);

        ExecutorConfig::new(self.root_domain.clone(), gatekeeper)
            .with_control_addr(self.control_addr)
            .with_public_port(self.public_port)
            .with_handshake_timeout(self.handshake_timeout)
            .with_idle_timeout(self.idle_timeout)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::new(self.http_addr, self.root_domain.clone())
    }
}

fn pick_list(flags: &[String], file: &[String], default: &str) -> Vec<String> {
    let flags = split_parts(flags);
    if !flags.is_empty() {
        return flags;
    }
    let file = split_parts(file);
    if !file.is_empty() {
        return file;
    }
    vec![default.to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn args_with_domain(domain: &str) -> ServerArgs {
        ServerArgs {
            domain: Some(domain.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_split_parts() {
        let values = vec![
            "sqlite://a.db, postgres://b".to_string(),
            "".to_string(),
            "memory://".to_string(),
        ];
        assert_eq!(
            split_parts(&values),
            vec!["sqlite://a.db", "postgres://b", "memory://"]
        );
    }

    #[test]
    fn test_defaults() {
        let settings =
            ServerSettings::resolve(&args_with_domain("example.com"), FileConfig::default()).unwrap();

        assert_eq!(settings.http_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(settings.store_endpoints, vec!["sqlite::memory:"]);
        assert_eq!(settings.port_range, PortRange::new(31240, 65535));
        assert_eq!(settings.gate_hosts, vec!["0.0.0.0"]);
        assert_eq!(settings.control_addr, "0.0.0.0:2222".parse().unwrap());
        assert_eq!(settings.public_port, 8080);
        assert_eq!(settings.lease_ttl, Duration::from_secs(30));
        assert!(settings.jwt_secret.is_none());
    }

    #[test]
    fn test_flags_override_file() {
        let file = FileConfig::parse(
            r#"
domain: file.example.com
port: 9000
port-range: 40010-40000
store: [memory://]
gate-hosts: [10.0.0.1, 10.0.0.2]
idle-timeout: 60
"#,
        )
        .unwrap();

        let args = ServerArgs {
            port: Some(9100),
            store: vec!["sqlite://gates.db".to_string()],
            ..Default::default()
        };
        let settings = ServerSettings::resolve(&args, file).unwrap();

        assert_eq!(settings.root_domain, "file.example.com");
        assert_eq!(settings.http_addr.port(), 9100);
        assert_eq!(settings.store_endpoints, vec!["sqlite://gates.db"]);
        assert_eq!(settings.port_range, PortRange::new(40000, 40010));
        assert_eq!(settings.gate_hosts, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(settings.idle_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_legacy_etcd_key() {
        let file = FileConfig::parse("etcd: [\"memory://\"]\n").unwrap();
        assert_eq!(file.store, vec!["memory://"]);
    }

    #[test]
    fn test_rejects_invalid_settings() {
        assert!(ServerSettings::resolve(&ServerArgs::default(), FileConfig::default()).is_err());
        assert!(
            ServerSettings::resolve(&args_with_domain("not a domain"), FileConfig::default())
                .is_err()
        );

        let mut args = args_with_domain("example.com");
        args.port_range = Some("31240".to_string());
        assert!(ServerSettings::resolve(&args, FileConfig::default()).is_err());

        let mut args = args_with_domain("example.com");
        args.addr = Some("not-an-ip".to_string());
        assert!(ServerSettings::resolve(&args, FileConfig::default()).is_err());
    }

    #[test]
    fn test_unknown_key_is_an_error() {
        assert!(FileConfig::parse("domian: example.com\n").is_err());
        assert_eq!(FileConfig::parse("").unwrap(), FileConfig::default());
    }

    #[test]
    fn test_discover_prefers_earlier_directory() {
        let cwd = TempDir::new().unwrap();
        let home = TempDir::new().unwrap();
        fs::write(home.path().join(".rssh.yml"), "domain: home.example.com\n").unwrap();

        let dirs = vec![cwd.path().to_path_buf(), home.path().to_path_buf()];
        assert_eq!(discover_from(&dirs), Some(home.path().join(".rssh.yml")));

        fs::write(cwd.path().join(".rssh.yaml"), "domain: cwd.example.com\n").unwrap();
        let found = discover_from(&dirs).unwrap();
        assert_eq!(found, cwd.path().join(".rssh.yaml"));
        assert_eq!(
            FileConfig::load(&found).unwrap().domain.as_deref(),
            Some("cwd.example.com")
        );
    }

    #[test]
    fn test_missing_explicit_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        let config = load_config(Some(&dir.path().join("absent.yml"))).unwrap();
        assert_eq!(config, FileConfig::default());
    }
}
