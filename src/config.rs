use std::{env, net::IpAddr, time::Duration};

pub const MIN_TIMEOUT_MS: u64 = 100;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    pub exec_timeout_ms: u64,
    pub export_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub allow_remote: bool,
    pub pdftoppm_bin: String,
    pub pdfinfo_bin: String,
    pub console_history: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            exec_timeout_ms: 30_000,
            export_timeout_ms: 60_000,
            max_timeout_ms: 300_000,
            allow_remote: false,
            pdftoppm_bin: "pdftoppm".to_string(),
            pdfinfo_bin: "pdfinfo".to_string(),
            console_history: 200,
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, String> {
        let defaults = Self::default();

        let host = env::var("BRIDGE_HOST").unwrap_or(defaults.host);
        let port = match env::var("BRIDGE_PORT") {
            Ok(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|error| format!("invalid BRIDGE_PORT {raw:?}: {error}"))?,
            Err(_) => defaults.port,
        };

        let max_timeout_ms =
            parse_u64_env("BRIDGE_MAX_TIMEOUT_MS", defaults.max_timeout_ms).max(MIN_TIMEOUT_MS);

        Ok(Self {
            host,
            port,
            exec_timeout_ms: parse_u64_env("BRIDGE_EXEC_TIMEOUT_MS", defaults.exec_timeout_ms)
                .clamp(MIN_TIMEOUT_MS, max_timeout_ms),
            export_timeout_ms: parse_u64_env(
                "BRIDGE_EXPORT_TIMEOUT_MS",
                defaults.export_timeout_ms,
            )
            .clamp(MIN_TIMEOUT_MS, max_timeout_ms),
            max_timeout_ms,
            allow_remote: parse_bool_env("BRIDGE_ALLOW_REMOTE"),
            pdftoppm_bin: env::var("BRIDGE_PDFTOPPM_BIN").unwrap_or(defaults.pdftoppm_bin),
            pdfinfo_bin: env::var("BRIDGE_PDFINFO_BIN").unwrap_or(defaults.pdfinfo_bin),
            console_history: parse_u64_env(
                "BRIDGE_CONSOLE_HISTORY",
                defaults.console_history as u64,
            ) as usize,
        })
    }

    /// Clamp a caller-supplied deadline, falling back to `default_ms`.
    pub fn clamp_timeout(&self, requested_ms: Option<u64>, default_ms: u64) -> Duration {
        let ms = requested_ms
            .unwrap_or(default_ms)
            .clamp(MIN_TIMEOUT_MS, self.max_timeout_ms);
        Duration::from_millis(ms)
    }

    /// Only loopback peers are trusted unless remote access is enabled.
    pub fn is_trusted_peer(&self, peer: IpAddr) -> bool {
        if self.allow_remote {
            return true;
        }

        match peer {
            IpAddr::V4(addr) => addr.is_loopback(),
            IpAddr::V6(addr) => {
                addr.is_loopback() || addr.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
            }
        }
    }
}

fn parse_bool_env(name: &str) -> bool {
    env::var(name)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn parse_u64_env(name: &str, fallback: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(fallback)
}
