use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub store_backend: StoreBackend,
    pub db_url: Option<String>,
    pub store_write_timeout_ms: u64,
    pub default_actor: Option<String>,
    pub employees_legacy_format: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl ServiceConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("ROSTER_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("ROSTER_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 3000),
            "ROSTER_BIND_ADDR",
        )?;

        let dev_allow_nonlocal_bind =
            parse_bool(kv.get("ROSTER_DEV_ALLOW_NONLOCAL_BIND")).unwrap_or(false);

        // There is no auth layer in front of the record routes.
        if !bind_addr.ip().is_loopback()
            && !(dev_allow_nonlocal_bind && is_unspecified_ip(bind_addr.ip()))
        {
            return Err(StartupError {
                code: "ERR_NONLOCAL_BIND_REFUSED",
                message: "non-local bind requires ROSTER_DEV_ALLOW_NONLOCAL_BIND=1 and an unspecified address"
                    .to_string(),
            });
        }

        let store_backend = parse_store_backend(kv.get("ROSTER_STORE_BACKEND"))?;
        let db_url = match store_backend {
            StoreBackend::Postgres => Some(require_nonempty(kv, "ROSTER_DB_URL")?),
            StoreBackend::Memory => None,
        };

        let store_write_timeout_ms = parse_u64(
            kv.get("ROSTER_STORE_WRITE_TIMEOUT_MS"),
            2000,
            "ROSTER_STORE_WRITE_TIMEOUT_MS",
        )?;
        if store_write_timeout_ms == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "ROSTER_STORE_WRITE_TIMEOUT_MS must be > 0".to_string(),
            });
        }

        let default_actor = kv
            .get("ROSTER_DEFAULT_ACTOR")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());

        let employees_legacy_format = match kv.get("ROSTER_EMPLOYEES_LEGACY_FORMAT") {
            None => true,
            Some(raw) if raw.trim().is_empty() => true,
            Some(raw) => parse_bool(Some(raw)).ok_or_else(|| StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "ROSTER_EMPLOYEES_LEGACY_FORMAT must be a boolean".to_string(),
            })?,
        };

        Ok(Self {
            bind_addr,
            store_backend,
            db_url,
            store_write_timeout_ms,
            default_actor,
            employees_legacy_format,
        })
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    parse_env_lines(&contents)
}

fn parse_env_lines(contents: &str) -> Result<HashMap<String, String>, StartupError> {
    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        kv.insert(key.to_string(), strip_quotes(value.trim()));
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..bytes.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    let value = kv
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| StartupError {
            code: "ERR_MISSING_CONFIG",
            message: format!("missing required config key {}", key),
        })?;

    Ok(value.to_string())
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) => v.trim().parse::<SocketAddr>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a valid host:port socket address", key),
        }),
    }
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_store_backend(value: Option<&String>) -> Result<StoreBackend, StartupError> {
    let backend = value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("postgres");

    match backend {
        "postgres" => Ok(StoreBackend::Postgres),
        "memory" => Ok(StoreBackend::Memory),
        _ => Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "ROSTER_STORE_BACKEND must be postgres or memory".to_string(),
        }),
    }
}

fn parse_bool(value: Option<&String>) -> Option<bool> {
    let value = value.map(|v| v.trim()).filter(|v| !v.is_empty())?;

    match value {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}

fn is_unspecified_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_unspecified(),
        IpAddr::V6(v6) => v6.is_unspecified(),
    }
}
