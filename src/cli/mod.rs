pub mod config;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use config::AgentConfig;

#[derive(Parser, Debug)]
#[command(name = "pipestats")]
#[command(about = "Aggregate tracer pipeline stats and ship them to the backend")]
#[command(version)]
pub struct Cli {
    /// Path to the TOML config file
    #[arg(long, short, env = "PIPESTATS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Agent hostname stamped on outgoing payloads
    #[arg(long, env = "DD_HOSTNAME")]
    pub hostname: Option<String>,

    /// Backend base URL
    #[arg(long, env = "PIPESTATS_ENDPOINT")]
    pub endpoint: Option<String>,

    /// API key sent with every payload
    #[arg(long, env = "DD_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Address the intake listens on
    #[arg(long, env = "PIPESTATS_LISTEN_ADDR")]
    pub listen: Option<String>,

    /// Log as JSON lines
    #[arg(long)]
    pub json: bool,
}

impl Cli {
    /// Load the config file (defaults when none is given) and apply flag overrides.
    pub fn resolve_config(&self) -> Result<AgentConfig> {
        let mut config = match &self.config {
            Some(path) => AgentConfig::load(path)?,
            None => AgentConfig::default(),
        };
        if let Some(hostname) = &self.hostname {
            config.hostname = hostname.clone();
        }
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
        if let Some(api_key) = &self.api_key {
            config.api_key = api_key.clone();
        }
        if let Some(listen) = &self.listen {
            config.listen_addr = listen.clone();
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "hostname = \"from-file\"\ndefault_env = \"prod\"").unwrap();

        let cli = Cli::try_parse_from([
            "pipestats",
            "--config",
            file.path().to_str().unwrap(),
            "--hostname",
            "from-flag",
            "--listen",
            "0.0.0.0:9126",
        ])
        .unwrap();
        let config = cli.resolve_config().unwrap();

        assert_eq!(config.hostname, "from-flag");
        assert_eq!(config.default_env, "prod");
        assert_eq!(config.listen_addr, "0.0.0.0:9126");
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let cli = Cli::try_parse_from(["pipestats", "--config", "/nonexistent/pipestats.toml"])
            .unwrap();
        assert!(cli.resolve_config().is_err());
    }
}
