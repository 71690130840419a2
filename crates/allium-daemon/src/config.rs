//! Daemon configuration.
//!
//! Settings come from `key=value` lines in `i2p.conf` inside the data
//! directory, overridden by `-key=value` command-line arguments. `--key`
//! is accepted as a spelling of `-key`.

use std::collections::HashMap;
use std::path::PathBuf;

/// Complete daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory holding `netDb/`, key files, and `i2p.conf`.
    pub data_dir: PathBuf,
    /// Config file name, resolved against the data directory unless
    /// absolute.
    pub conf_file: PathBuf,
    /// Run from the system data directory.
    pub service: bool,
    /// HTTP proxy port advertised in the PAC file.
    pub http_proxy_port: u16,
    /// Control channel port.
    pub bob_port: u16,
    /// Proxy auto-config service port.
    pub pac_port: u16,
    /// Log filter, e.g. "info" or "allium=debug".
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::new(),
            conf_file: PathBuf::from("i2p.conf"),
            service: false,
            http_proxy_port: 4446,
            bob_port: 2827,
            pac_port: 7656,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Resolve configuration from command-line arguments and the config
    /// file; command-line settings win.
    pub fn load(args: &[String]) -> anyhow::Result<Self> {
        let cli = parse_args(args);
        let mut config = Config {
            data_dir: default_data_dir(cli.get("service").is_some()),
            ..Config::default()
        };
        if let Some(dir) = cli.get("datadir") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(conf) = cli.get("conf") {
            config.conf_file = PathBuf::from(conf);
        }

        // File first, so command-line pairs override it below.
        let mut merged = read_config_file(&config.config_path());
        for (key, value) in cli {
            merged.insert(key, value);
        }
        config.apply(&merged)?;
        Ok(config)
    }

    fn config_path(&self) -> PathBuf {
        if self.conf_file.is_absolute() {
            self.conf_file.clone()
        } else {
            self.data_dir.join(&self.conf_file)
        }
    }

    fn apply(&mut self, settings: &HashMap<String, String>) -> anyhow::Result<()> {
        if let Some(dir) = settings.get("datadir") {
            self.data_dir = PathBuf::from(dir);
        }
        if settings.get("service").is_some() {
            self.service = true;
        }
        if let Some(port) = settings.get("httpproxyport") {
            self.http_proxy_port = port.parse()?;
        }
        if let Some(port) = settings.get("bobport") {
            self.bob_port = port.parse()?;
        }
        if let Some(port) = settings.get("pacport") {
            self.pac_port = port.parse()?;
        }
        if let Some(level) = settings.get("loglevel") {
            self.log_level = level.clone();
        }
        Ok(())
    }
}

/// Parse `-key=value` (and `-flag`) arguments into a map.
pub fn parse_args(args: &[String]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for arg in args {
        if !arg.starts_with('-') {
            break;
        }
        let trimmed = arg.trim_start_matches('-');
        match trimmed.split_once('=') {
            Some((key, value)) => map.insert(key.to_string(), value.to_string()),
            None => map.insert(trimmed.to_string(), String::new()),
        };
    }
    map
}

/// Read `key=value` lines, skipping blanks and `#` comments.
fn read_config_file(path: &std::path::Path) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(content) = std::fs::read_to_string(path) else {
        // No config file is fine.
        return map;
    };
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    map
}

/// `~/.allium`, or `/var/lib/allium` when running as a service. The
/// `ALLIUM_DATA_DIR` environment variable overrides both.
fn default_data_dir(service: bool) -> PathBuf {
    if let Ok(dir) = std::env::var("ALLIUM_DATA_DIR") {
        return PathBuf::from(dir);
    }
    if service {
        return PathBuf::from("/var/lib/allium");
    }
    std::env::var("HOME")
        .map(|home| PathBuf::from(home).join(".allium"))
        .unwrap_or_else(|_| PathBuf::from("/tmp/allium"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args() {
        let map = parse_args(&strings(&["-datadir=/tmp/x", "--bobport=1234", "-service"]));
        assert_eq!(map.get("datadir").unwrap(), "/tmp/x");
        assert_eq!(map.get("bobport").unwrap(), "1234");
        assert_eq!(map.get("service").unwrap(), "");
    }

    #[test]
    fn test_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            Config::load(&strings(&[&format!("-datadir={}", dir.path().display())])).unwrap();
        assert_eq!(config.http_proxy_port, 4446);
        assert_eq!(config.bob_port, 2827);
        assert_eq!(config.pac_port, 7656);
        assert!(!config.service);
    }

    #[test]
    fn test_cli_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("i2p.conf"),
            "# comment\nbobport=1111\npacport=2222\n",
        )
        .unwrap();
        let config = Config::load(&strings(&[
            &format!("-datadir={}", dir.path().display()),
            "-bobport=3333",
        ]))
        .unwrap();
        // The file sets both; the command line wins where present.
        assert_eq!(config.bob_port, 3333);
        assert_eq!(config.pac_port, 2222);
    }

    #[test]
    fn test_bad_port_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(&strings(&[
            &format!("-datadir={}", dir.path().display()),
            "-bobport=notaport",
        ]));
        assert!(result.is_err());
    }
}
