use hmccu_proto::{Error, Result};
use serde_derive::Deserialize;
use std::env;
use std::net::SocketAddr;
use tracing::Level;

fn def_log_level() -> String {
    String::from("warn")
}

fn def_http_addr() -> String {
    String::from("0.0.0.0:2001")
}

fn def_tcp_addr() -> String {
    String::from("0.0.0.0:2002")
}

fn def_max_http_response() -> usize {
    10 * 1024 * 1024
}

fn def_max_bin_response() -> usize {
    2 * 1024 * 1024
}

#[derive(Deserialize)]
pub struct Config {
    #[serde(default = "def_log_level")]
    log_level: String,

    #[serde(default = "def_http_addr")]
    pub http_addr: String,

    #[serde(default = "def_tcp_addr")]
    pub tcp_addr: String,

    #[serde(default = "def_max_http_response")]
    pub max_http_response: usize,

    #[serde(default = "def_max_bin_response")]
    pub max_bin_response: usize,

    /// Whether this process runs off the Controller itself; if so,
    /// the well-known loopback aliases handed out by `init` callers
    /// get rewritten to `controller_host`.
    #[serde(default)]
    pub remote_mode: bool,

    #[serde(default)]
    pub controller_host: String,

    #[serde(default)]
    pub interface: Vec<Interface>,
}

/// One external interface process this daemon registers itself with
/// as a logic layer.
#[derive(Deserialize, Clone)]
pub struct Interface {
    /// Logic-layer id advertised on `init` and used as the `Servant`'s
    /// key.
    pub name: String,

    /// The interface's own RPC endpoint, e.g.
    /// `xmlrpc_bin://192.168.1.10:2001` or `http://192.168.1.10:2010/`.
    pub url: String,

    /// The receiver address we advertise for callbacks.
    pub receiver: String,
}

impl Config {
    pub fn get_log_level(&self) -> Level {
        match self.log_level.as_str() {
            "info" => Level::INFO,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::WARN,
        }
    }

    pub fn get_http_addr(&self) -> std::result::Result<SocketAddr, Error> {
        self.http_addr
            .parse()
            .map_err(|_| Error::ConfigError(format!("bad http_addr '{}'", self.http_addr)))
    }

    pub fn get_tcp_addr(&self) -> std::result::Result<SocketAddr, Error> {
        self.tcp_addr
            .parse()
            .map_err(|_| Error::ConfigError(format!("bad tcp_addr '{}'", self.tcp_addr)))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: def_log_level(),
            http_addr: def_http_addr(),
            tcp_addr: def_tcp_addr(),
            max_http_response: def_max_http_response(),
            max_bin_response: def_max_bin_response(),
            remote_mode: false,
            controller_host: String::new(),
            interface: vec![],
        }
    }
}

fn from_cmdline(mut cfg: Config) -> (bool, Config) {
    use clap::{crate_version, Arg, ArgAction, Command};

    let matches = Command::new("HomeMatic CCU RPC daemon")
        .version(crate_version!())
        .about("Registers as a logic layer and presents virtual devices over the Controller's RPC protocols")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .action(ArgAction::Set)
                .value_name("FILE")
                .help("Specifies the configuration file"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Sets verbosity of log; can be used more than once"),
        )
        .arg(
            Arg::new("print_cfg")
                .long("print-config")
                .action(ArgAction::SetTrue)
                .help("Displays the configuration and exits"),
        )
        .get_matches();

    match matches.get_count("verbose") {
        0 => (),
        1 => cfg.log_level = String::from("info"),
        2 => cfg.log_level = String::from("debug"),
        _ => cfg.log_level = String::from("trace"),
    };

    (matches.get_flag("print_cfg"), cfg)
}

fn parse_config(contents: &str) -> Result<Config> {
    toml::from_str(contents)
        .map_err(|e| Error::ConfigError(format!("{}", e)))
        .and_then(|cfg: Config| {
            for iface in &cfg.interface {
                if iface.name.is_empty() {
                    return Err(Error::ConfigError("an [[interface]] entry is missing 'name'".into()));
                }
                if iface.url.is_empty() {
                    return Err(Error::ConfigError(format!("interface '{}' is missing 'url'", iface.name)));
                }
                if iface.receiver.is_empty() {
                    return Err(Error::ConfigError(format!("interface '{}' is missing 'receiver'", iface.name)));
                }
            }
            if cfg.remote_mode && cfg.controller_host.is_empty() {
                return Err(Error::ConfigError(
                    "'remote_mode' requires 'controller_host' to be set".into(),
                ));
            }
            cfg.get_http_addr()?;
            cfg.get_tcp_addr()?;
            Ok(cfg)
        })
}

async fn from_file(path: &str) -> Option<Result<Config>> {
    use tokio::fs;

    if let Ok(contents) = fs::read(path).await {
        let contents = String::from_utf8_lossy(&contents);
        Some(parse_config(&contents))
    } else {
        None
    }
}

async fn find_cfg() -> Result<Config> {
    const CFG_FILE: &str = "hmccu.toml";

    let mut dirs = vec![String::from("./")];

    if let Ok(home) = env::var("HOME") {
        dirs.push(format!("{}/.", home))
    }

    dirs.push(String::from("/usr/local/etc/"));
    dirs.push(String::from("/usr/pkg/etc/"));
    dirs.push(String::from("/etc/"));

    for dir in dirs {
        let file = format!("{}{}", &dir, CFG_FILE);

        if let Some(cfg) = from_file(&file).await {
            return cfg;
        }
    }
    Ok(Config::default())
}

fn dump_config(cfg: &Config) {
    println!("Configuration:");
    println!("    log level: {}", cfg.get_log_level());
    println!("    HTTP front: {}", cfg.http_addr);
    println!("    TCP front: {}", cfg.tcp_addr);
    println!("    remote mode: {}\n", cfg.remote_mode);

    println!("Interface registrations:");
    if !cfg.interface.is_empty() {
        for iface in &cfg.interface {
            println!(
                "    name: {}\n    url: {}\n    receiver: {}\n",
                &iface.name, &iface.url, &iface.receiver
            );
        }
    } else {
        println!("    No interfaces configured.");
    }
}

#[tracing::instrument(name = "loading config")]
pub async fn get() -> Option<Config> {
    match find_cfg().await {
        Ok(cfg) => {
            let (print_cfg, cfg) = from_cmdline(cfg);

            if print_cfg {
                dump_config(&cfg);
                None
            } else {
                Some(cfg)
            }
        }
        Err(e) => {
            println!("{}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_log_level_is_warn() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.get_log_level(), Level::WARN);
    }

    #[test]
    fn log_level_can_be_set() {
        let cfg: Config = toml::from_str(r#"log_level = "debug""#).unwrap();
        assert_eq!(cfg.get_log_level(), Level::DEBUG);
    }

    #[test]
    fn interface_missing_receiver_is_rejected() {
        let err = parse_config(
            r#"
[[interface]]
name = "BidCos-RF"
url = "xmlrpc_bin://192.168.1.10:2001"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn valid_interface_parses() {
        let cfg = parse_config(
            r#"
[[interface]]
name = "BidCos-RF"
url = "xmlrpc_bin://192.168.1.10:2001"
receiver = "xmlrpc_bin://192.168.1.20:2002"
"#,
        )
        .unwrap();
        assert_eq!(cfg.interface.len(), 1);
        assert_eq!(cfg.interface[0].name, "BidCos-RF");
    }

    #[test]
    fn remote_mode_without_controller_host_is_rejected() {
        let err = parse_config("remote_mode = true").unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }
}
