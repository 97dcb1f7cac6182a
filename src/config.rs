use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use ini::Ini;
use tracing::info;

use crate::error::{ProxyError, Result};
use crate::vault;

pub const DEFAULT_HTTP_PORT: u16 = 12243;
pub const DEFAULT_CONTROL_PORT: u16 = 12244;
pub const DEFAULT_TOR_TIMEOUT_MS: u64 = 5000;

/// Everything the service needs to run, frozen at startup.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    /// SOCKS endpoint of the local Tor client.
    pub tor_addr: SocketAddr,
    /// Bound on the Tor connect phase, milliseconds.
    pub tor_timeout_ms: u64,
    pub http_bind: SocketAddr,
    /// Wildcard DNS suffix the onion labels hang under, without dots at
    /// either end.
    pub suffix: String,
    pub blacklist_path: Option<PathBuf>,
    pub alias_path: Option<PathBuf>,
    pub control_bind: Option<SocketAddr>,
    /// Hashed control password (`ENC:` record) when one is configured.
    pub password: Option<String>,
    pub cookie_path: Option<PathBuf>,
    /// Lowercased header names stripped before forwarding.
    pub rejected_headers: Vec<String>,
}

/// Load and validate the INI config file.
///
/// A plaintext `[Control] Password` is hashed here and the file rewritten
/// once, so the plaintext never survives the first start.
pub fn load(path: &Path) -> Result<ConfigSnapshot> {
    let mut ini = Ini::load_from_file(path)
        .map_err(|e| ProxyError::Config(format!("{}: {e}", path.display())))?;

    let tor_ip = parse_ip(require(&ini, "TOR", "IP")?)?;
    let tor_port = parse_port(&ini, "TOR", "Port", None)?;
    let tor_timeout_ms = match get(&ini, "TOR", "Timeout") {
        Some(raw) => {
            let ms: u64 = raw.parse().map_err(|_| {
                ProxyError::Config(format!("[TOR] Timeout '{raw}' is not a number"))
            })?;
            if ms == 0 {
                return Err(ProxyError::Config(
                    "[TOR] Timeout must be at least 1 ms".to_string(),
                ));
            }
            ms
        }
        None => DEFAULT_TOR_TIMEOUT_MS,
    };

    let http_ip = match get(&ini, "HTTP", "IP") {
        Some(raw) => parse_ip(raw)?,
        None => IpAddr::from([127, 0, 0, 1]),
    };
    let http_port = parse_port(&ini, "HTTP", "Port", Some(DEFAULT_HTTP_PORT))?;

    let suffix = require(&ini, "DNS", "Suffix")?.to_string();
    if suffix.is_empty() || suffix.starts_with('.') || suffix.ends_with('.') {
        return Err(ProxyError::Config(format!(
            "[DNS] Suffix '{suffix}' must be non-empty without leading or trailing dots"
        )));
    }
    let blacklist_path = get(&ini, "DNS", "Blacklist").map(PathBuf::from);
    let alias_path = get(&ini, "DNS", "Alias").map(PathBuf::from);

    let mut control_bind = None;
    let mut password = None;
    let mut cookie_path = None;
    if ini.section(Some("Control")).is_some() {
        let control_ip = match get(&ini, "Control", "IP") {
            Some(raw) => parse_ip(raw)?,
            None => IpAddr::from([127, 0, 0, 1]),
        };
        let control_port = parse_port(&ini, "Control", "Port", Some(DEFAULT_CONTROL_PORT))?;
        control_bind = Some(SocketAddr::new(control_ip, control_port));
        password = get(&ini, "Control", "Password").map(str::to_string);
        cookie_path = get(&ini, "Control", "Cookie").map(PathBuf::from);
        if password.is_none() && cookie_path.is_none() {
            return Err(ProxyError::Config(
                "[Control] requires at least one of Password or Cookie".to_string(),
            ));
        }
    }

    if let Some(plaintext) = password.as_ref().filter(|p| !vault::is_hashed(p)) {
        let hashed = vault::hash(plaintext);
        ini.set_to(Some("Control"), "Password".to_string(), hashed.clone());
        ini.write_to_file(path).map_err(|e| {
            ProxyError::Config(format!(
                "cannot rewrite {} with hashed password: {e}",
                path.display()
            ))
        })?;
        info!(
            "replaced plaintext control password in {} with its hash",
            path.display()
        );
        password = Some(hashed);
    }

    let rejected_headers = match get(&ini, "Security", "NonAnonymousHeaders") {
        Some(raw) => raw
            .split(',')
            .map(|name| name.trim().to_ascii_lowercase())
            .filter(|name| !name.is_empty())
            .collect(),
        None => Vec::new(),
    };

    Ok(ConfigSnapshot {
        tor_addr: SocketAddr::new(tor_ip, tor_port),
        tor_timeout_ms,
        http_bind: SocketAddr::new(http_ip, http_port),
        suffix,
        blacklist_path,
        alias_path,
        control_bind,
        password,
        cookie_path,
        rejected_headers,
    })
}

fn get<'a>(ini: &'a Ini, section: &str, key: &str) -> Option<&'a str> {
    ini.section(Some(section)).and_then(|props| props.get(key))
}

fn require<'a>(ini: &'a Ini, section: &str, key: &str) -> Result<&'a str> {
    get(ini, section, key)
        .ok_or_else(|| ProxyError::Config(format!("[{section}] {key} is required")))
}

fn parse_ip(raw: &str) -> Result<IpAddr> {
    raw.parse()
        .map_err(|_| ProxyError::Config(format!("'{raw}' is not an IP address literal")))
}

fn parse_port(ini: &Ini, section: &str, key: &str, default: Option<u16>) -> Result<u16> {
    let raw = match (get(ini, section, key), default) {
        (Some(raw), _) => raw,
        (None, Some(port)) => return Ok(port),
        (None, None) => {
            return Err(ProxyError::Config(format!(
                "[{section}] {key} is required"
            )))
        }
    };
    match raw.parse::<u16>() {
        Ok(port) if (1..=65534).contains(&port) => Ok(port),
        _ => Err(ProxyError::Config(format!(
            "[{section}] {key} '{raw}' is not a port in 1..65534"
        ))),
    }
}
