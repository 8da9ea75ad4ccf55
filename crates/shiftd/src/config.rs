//! Configuration: CLI flags (`clap`) layered over an optional TOML file
//! layered over built-in defaults — mirrors `summit-core::config`'s
//! env → file → defaults resolution, with CLI flags standing in for env
//! vars as the highest-precedence layer.
//!
//! The original `shift.go` parsed only a handful of `flag`s (`-addr`,
//! `-l`/`-c`, `-4`/`-6`) plus a `confflags` file layer; this reconstructs
//! the full option set spec.md names (`key`, `name`, `junk`, offsets,
//! keepalive bounds) on top of that same two-layer shape.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use shift_core::peer::IpFamily;

pub const DEFAULT_ADDR: &str = ":31337";
pub const DEFAULT_NAME: &str = "0001";
pub const DEFAULT_NAME_LEN: usize = 1024;
pub const DEFAULT_JUNK: &str = "GET / HTTP/1.1\r\n";
pub const DEFAULT_KA_MIN_WAIT_MS: u64 = 30_000;
pub const DEFAULT_KA_MAX_WAIT_MS: u64 = 90_000;

/// Command-line flags. Long names for the original `shift.go`'s short
/// ones (`-addr` -> `--addr`, `-l`/`-c` -> `--listen`/`--connect`,
/// `-4`/`-6` -> `--ipv4`/`--ipv6`), plus the options spec.md names that the
/// original left to its `confflags` file.
#[derive(Debug, Parser)]
#[command(name = "shiftd", about = "local half of a two-party Layer-2 tunnel")]
pub struct Cli {
    /// Address to listen on or connect to.
    #[arg(long, default_value = DEFAULT_ADDR)]
    pub addr: String,

    /// Connect to `addr` instead of listening on it.
    #[arg(long, conflicts_with = "listen")]
    pub connect: bool,

    /// Listen on `addr` (the default).
    #[arg(long, conflicts_with = "connect")]
    pub listen: bool,

    /// Force IPv4.
    #[arg(long, conflicts_with = "ipv6")]
    pub ipv4: bool,

    /// Force IPv6.
    #[arg(long, conflicts_with = "ipv4")]
    pub ipv6: bool,

    /// Install-identity string, exchanged and verified at handshake time.
    #[arg(long, default_value = DEFAULT_NAME)]
    pub name: String,

    /// Padded length, in bytes, of the name record.
    #[arg(long, default_value_t = DEFAULT_NAME_LEN)]
    pub name_len: usize,

    /// Cleartext preamble sent before the nonce exchange.
    #[arg(long, default_value = DEFAULT_JUNK)]
    pub junk: String,

    /// Pre-shared key: exactly 32 bytes, given as 64 hex characters or a
    /// raw 32-byte literal string.
    #[arg(long)]
    pub key: Option<String>,

    /// Seconds added to local wall-clock time before deriving the Cryptors.
    #[arg(long, default_value_t = 0)]
    pub time_offset: i64,

    /// Minimum keepalive interval, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_KA_MIN_WAIT_MS)]
    pub ka_min_wait_ms: u64,

    /// Maximum keepalive interval, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_KA_MAX_WAIT_MS)]
    pub ka_max_wait_ms: u64,

    /// Requested TAP device name. Empty lets the kernel assign one.
    #[arg(long, default_value = "")]
    pub tun_name: String,

    /// Optional TOML config file, lower precedence than any flag given
    /// explicitly on the command line.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// The subset of `Config` a TOML file may override. Every field is
/// optional; a missing field falls through to the CLI default/value.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub addr: Option<String>,
    pub connect: Option<bool>,
    pub ip_family: Option<String>,
    pub name: Option<String>,
    pub name_len: Option<usize>,
    pub junk: Option<String>,
    pub key: Option<String>,
    pub time_offset: Option<i64>,
    pub ka_min_wait_ms: Option<u64>,
    pub ka_max_wait_ms: Option<u64>,
    pub tun_name: Option<String>,
}

/// Fully resolved configuration, ready to drive one session.
#[derive(Debug, Clone)]
pub struct Config {
    pub addr: String,
    pub connect: bool,
    pub ip_family: IpFamily,
    pub name: String,
    pub name_len: usize,
    pub junk: Vec<u8>,
    pub key: [u8; 32],
    pub time_offset: i64,
    pub ka_min_wait: Duration,
    pub ka_max_wait: Duration,
    pub tun_name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("--ipv4 and --ipv6 (or ip_family in the config file) may not both be set")]
    ConflictingIpFamily,
    #[error("--connect and --listen may not both be set")]
    ConflictingConnectListen,
    #[error("a pre-shared key is required (--key or key= in the config file)")]
    MissingKey,
    #[error("key must be exactly 32 bytes, got {0}")]
    BadKeyLength(usize),
    #[error("key is not valid hex and is not a 32-byte literal: {0}")]
    BadKeyEncoding(hex::FromHexError),
    #[error("name_len ({name_len}) is shorter than name ({name_bytes} bytes)")]
    NameTooLong { name_len: usize, name_bytes: usize },
    #[error("reading config file {path:?}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file {path:?}: {source}")]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("unknown ip_family {0:?}, expected \"4\", \"6\", or \"any\"")]
    UnknownIpFamily(String),
}

impl Config {
    /// Resolve CLI flags, an optional file, and defaults into a `Config`,
    /// validating everything spec.md requires to be checked before a
    /// connection is attempted.
    pub fn resolve(cli: Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => load_file(path)?,
            None => ConfigFile::default(),
        };

        let connect = cli.connect || file.connect.unwrap_or(false);
        let listen = cli.listen;
        if connect && listen {
            return Err(ConfigError::ConflictingConnectListen);
        }

        let ip_family = resolve_ip_family(&cli, &file)?;

        let addr = non_default(&cli.addr, DEFAULT_ADDR)
            .or(file.addr)
            .unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let name = non_default(&cli.name, DEFAULT_NAME)
            .or(file.name)
            .unwrap_or_else(|| DEFAULT_NAME.to_string());
        let name_len = if cli.name_len != DEFAULT_NAME_LEN {
            cli.name_len
        } else {
            file.name_len.unwrap_or(DEFAULT_NAME_LEN)
        };
        let junk = non_default(&cli.junk, DEFAULT_JUNK)
            .or(file.junk)
            .unwrap_or_else(|| DEFAULT_JUNK.to_string());
        let time_offset = if cli.time_offset != 0 {
            cli.time_offset
        } else {
            file.time_offset.unwrap_or(0)
        };
        let ka_min_wait_ms = if cli.ka_min_wait_ms != DEFAULT_KA_MIN_WAIT_MS {
            cli.ka_min_wait_ms
        } else {
            file.ka_min_wait_ms.unwrap_or(DEFAULT_KA_MIN_WAIT_MS)
        };
        let ka_max_wait_ms = if cli.ka_max_wait_ms != DEFAULT_KA_MAX_WAIT_MS {
            cli.ka_max_wait_ms
        } else {
            file.ka_max_wait_ms.unwrap_or(DEFAULT_KA_MAX_WAIT_MS)
        };
        let tun_name = non_default(&cli.tun_name, "")
            .or(file.tun_name)
            .unwrap_or_default();

        let key_source = cli.key.or(file.key).ok_or(ConfigError::MissingKey)?;
        let key = parse_key(&key_source)?;

        if name.len() > name_len {
            return Err(ConfigError::NameTooLong {
                name_len,
                name_bytes: name.len(),
            });
        }

        Ok(Config {
            addr,
            connect,
            ip_family,
            name,
            name_len,
            junk: junk.into_bytes(),
            key,
            time_offset,
            ka_min_wait: Duration::from_millis(ka_min_wait_ms),
            ka_max_wait: Duration::from_millis(ka_max_wait_ms),
            tun_name,
        })
    }
}

/// Returns `Some(value)` only when it differs from the flag's own
/// built-in default — our proxy for "the user passed this explicitly",
/// short of threading `clap::ArgMatches::value_source` through.
fn non_default(value: &str, default: &str) -> Option<String> {
    (value != default).then(|| value.to_string())
}

fn resolve_ip_family(cli: &Cli, file: &ConfigFile) -> Result<IpFamily, ConfigError> {
    if cli.ipv4 && cli.ipv6 {
        return Err(ConfigError::ConflictingIpFamily);
    }
    if cli.ipv4 {
        return Ok(IpFamily::V4);
    }
    if cli.ipv6 {
        return Ok(IpFamily::V6);
    }
    match file.ip_family.as_deref() {
        None => Ok(IpFamily::Any),
        Some("any") => Ok(IpFamily::Any),
        Some("4") => Ok(IpFamily::V4),
        Some("6") => Ok(IpFamily::V6),
        Some(other) => Err(ConfigError::UnknownIpFamily(other.to_string())),
    }
}

fn load_file(path: &PathBuf) -> Result<ConfigFile, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
        path: path.clone(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::ParseFailed {
        path: path.clone(),
        source,
    })
}

/// Accepts either 64 hex characters or a raw 32-byte literal — the latter
/// matches the original's `[keyLen]byte` literal usage in its own tests.
fn parse_key(raw: &str) -> Result<[u8; 32], ConfigError> {
    if raw.len() == 64 && raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        let decoded = hex::decode(raw).map_err(ConfigError::BadKeyEncoding)?;
        return decoded
            .try_into()
            .map_err(|v: Vec<u8>| ConfigError::BadKeyLength(v.len()));
    }
    raw.as_bytes()
        .to_vec()
        .try_into()
        .map_err(|v: Vec<u8>| ConfigError::BadKeyLength(v.len()))
}
