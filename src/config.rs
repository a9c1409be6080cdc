//! Environment-driven configuration for the controller runtime.
//!
//! Every tunable knob is read once at startup; invalid values are fatal.

use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Top-level configuration, grouped the way the runtime consumes it.
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace all controller-owned cluster objects live in.
    pub namespace: String,

    /// Interval between reconciliation ticks.
    pub poll_interval: Duration,

    pub chart: ChartConfig,
    pub database: DatabaseConfig,
    pub ports: PortsConfig,
    pub srcds: SrcdsConfig,
    pub matches: MatchConfig,
    pub networking: NetworkingConfig,
    pub notifications: NotificationConfig,
    pub steam: SteamConfig,
}

/// Where the manifest template bundle and operator values come from.
#[derive(Debug, Clone)]
pub struct ChartConfig {
    /// Local directory or `oci://` reference.
    pub path: String,

    /// Operator-provided base values file; missing files are tolerated.
    pub values_file: String,
}

/// PostgreSQL connection settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub ssl_mode: String,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,

    /// `None` disables the lifetime cap.
    pub conn_max_lifetime: Option<Duration>,
}

/// The four disjoint NodePort ranges, one per port category.
#[derive(Debug, Clone)]
pub struct PortsConfig {
    pub game: PortRange,
    pub sourcetv: PortRange,
    pub client: PortRange,
    pub steam: PortRange,
}

/// An inclusive start/end block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    /// Ensures the range is well-formed.
    pub fn validate(&self) -> Result<()> {
        if self.start == 0 || self.end == 0 {
            bail!("ports must be positive integers");
        }
        if self.end < self.start {
            bail!("invalid range {}-{}", self.start, self.end);
        }
        Ok(())
    }
}

/// Gameplay-related runtime settings.
#[derive(Debug, Clone)]
pub struct SrcdsConfig {
    pub tick_rate: u32,
    pub max_players_override: i32,
    pub static_token: String,
    pub password_length: usize,
    pub rcon_length: usize,
}

/// Which matches get reconciled and with what fallbacks.
#[derive(Debug, Clone)]
pub struct MatchConfig {
    pub target_statuses: Vec<i32>,
    pub default_map: String,

    /// Lowercased substrings; empty list admits every division.
    pub division_filters: Vec<String>,
}

/// Cluster networking knobs.
#[derive(Debug, Clone)]
pub struct NetworkingConfig {
    pub host_network: bool,
    pub node_ip_preference: NodeIpPreference,
    pub external_traffic_policy: String,
}

/// Whether node-address discovery prefers external or internal addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeIpPreference {
    /// Try ExternalIP first, then fall back to InternalIP.
    ExternalFirst,
    /// Restrict discovery to InternalIP addresses.
    InternalOnly,
}

/// Optional user-facing alerts written to the scheduling database.
#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub enabled: bool,

    /// Link template with a `{match_id}` placeholder.
    pub link_format: String,
}

/// Identity-registry settings for per-server login tokens.
#[derive(Debug, Clone)]
pub struct SteamConfig {
    pub api_key: String,
    pub app_id: u32,

    /// Memo template with `{match_id}` / `{round_id}` placeholders.
    pub token_memo_template: String,
    pub enable_auto_tokens: bool,
    pub enable_token_cleanup: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let namespace = env_or("NAMESPACE", "udl");

        let poll_interval = humantime::parse_duration(&env_or("POLL_INTERVAL", "30s"))
            .context("invalid POLL_INTERVAL")?;

        let chart = ChartConfig {
            path: env_or("CHART_PATH", "oci://ghcr.io/udl-tf/charts/tf2chart"),
            values_file: env_or("CHART_VALUES_FILE", "./helm/values.yaml"),
        };

        let conn_max_lifetime = match env_or("DB_CONN_MAX_LIFETIME", "0").as_str() {
            "" | "0" => None,
            raw => Some(humantime::parse_duration(raw).context("invalid DB_CONN_MAX_LIFETIME")?),
        };

        let database = DatabaseConfig {
            host: env_or("DB_HOST", "postgres"),
            port: env_parse("DB_PORT", 5432)?,
            user: env_or("DB_USER", "postgres"),
            password: std::env::var("DB_PASSWORD").unwrap_or_default(),
            name: env_or("DB_NAME", "udl"),
            ssl_mode: env_or("DB_SSLMODE", "disable"),
            max_open_conns: env_parse("DB_MAX_OPEN_CONNS", 10)?,
            max_idle_conns: env_parse("DB_MAX_IDLE_CONNS", 5)?,
            conn_max_lifetime,
        };

        let ports = PortsConfig {
            game: parse_port_range(&env_or("PORT_RANGE_GAME", "30000-30299"))
                .context("invalid PORT_RANGE_GAME")?,
            sourcetv: parse_port_range(&env_or("PORT_RANGE_SOURCETV", "30300-30599"))
                .context("invalid PORT_RANGE_SOURCETV")?,
            client: parse_port_range(&env_or("PORT_RANGE_CLIENT", "40000-40299"))
                .context("invalid PORT_RANGE_CLIENT")?,
            steam: parse_port_range(&env_or("PORT_RANGE_STEAM", "29000-29299"))
                .context("invalid PORT_RANGE_STEAM")?,
        };

        let password_length: usize = env_parse("SRCDS_PASSWORD_LENGTH", 10)?;
        if password_length < 6 {
            bail!("SRCDS_PASSWORD_LENGTH must be at least 6");
        }
        let rcon_length: usize = env_parse("SRCDS_RCON_LENGTH", 46)?;
        if rcon_length < 12 {
            bail!("SRCDS_RCON_LENGTH must be at least 12");
        }

        let srcds = SrcdsConfig {
            tick_rate: env_parse("SRCDS_TICKRATE", 128)?,
            max_players_override: env_parse("SRCDS_MAX_PLAYERS_OVERRIDE", 0)?,
            static_token: std::env::var("SRCDS_STATIC_TOKEN").unwrap_or_default(),
            password_length,
            rcon_length,
        };

        let target_statuses =
            parse_int_list(&env_or("MATCH_STATUSES", "0")).context("invalid MATCH_STATUSES")?;
        if target_statuses.is_empty() {
            bail!("MATCH_STATUSES must include at least one status code");
        }

        let division_filters = parse_string_list(&env_or("MATCH_DIVISION_FILTERS", ""))
            .into_iter()
            .map(|f| f.to_lowercase())
            .collect();

        let matches = MatchConfig {
            target_statuses,
            default_map: env_or("DEFAULT_MAP", "tfdb_octagon_odb_a1"),
            division_filters,
        };

        let node_ip_preference =
            match env_or("NODE_IP_PREFERENCE", "external-first").to_lowercase().as_str() {
                "external-first" => NodeIpPreference::ExternalFirst,
                "internal-only" => NodeIpPreference::InternalOnly,
                other => bail!("unsupported NODE_IP_PREFERENCE: {other}"),
            };

        let networking = NetworkingConfig {
            host_network: env_bool("HOST_NETWORK", false)?,
            node_ip_preference,
            external_traffic_policy: env_or("SERVICE_EXTERNAL_TRAFFIC_POLICY", "Cluster"),
        };

        let notifications = NotificationConfig {
            enabled: env_bool("NOTIFICATIONS_ENABLED", true)?,
            link_format: env_or("NOTIFICATIONS_LINK_FORMAT", "/matches/{match_id}"),
        };

        let steam = SteamConfig {
            api_key: std::env::var("STEAM_API_KEY").unwrap_or_default(),
            app_id: env_parse("STEAM_APP_ID", 440)?,
            token_memo_template: env_or("STEAM_TOKEN_MEMO_TEMPLATE", "udl-{match_id}-r{round_id}"),
            enable_auto_tokens: env_bool("STEAM_ENABLE_AUTO_TOKENS", false)?,
            enable_token_cleanup: env_bool("STEAM_ENABLE_TOKEN_CLEANUP", false)?,
        };

        Ok(Self {
            namespace,
            poll_interval,
            chart,
            database,
            ports,
            srcds,
            matches,
            networking,
            notifications,
            steam,
        })
    }
}

fn env_or(key: &str, fallback: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn env_parse<T>(key: &str, fallback: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {key}: {raw}")),
        _ => Ok(fallback),
    }
}

fn env_bool(key: &str, fallback: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => parse_bool(raw.trim())
            .with_context(|| format!("invalid {key}: {raw}")),
        _ => Ok(fallback),
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.to_lowercase().as_str() {
        "1" | "t" | "true" => Ok(true),
        "0" | "f" | "false" => Ok(false),
        other => bail!("expected a boolean, got {other:?}"),
    }
}

fn parse_port_range(raw: &str) -> Result<PortRange> {
    let (start, end) = raw
        .trim()
        .split_once('-')
        .with_context(|| format!("expected format start-end, got {raw:?}"))?;
    let range = PortRange {
        start: start.trim().parse().context("invalid range start")?,
        end: end.trim().parse().context("invalid range end")?,
    };
    range.validate()?;
    Ok(range)
}

fn parse_int_list(raw: &str) -> Result<Vec<i32>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    trimmed
        .split(',')
        .map(|part| {
            part.trim()
                .parse()
                .with_context(|| format!("invalid integer {part:?}"))
        })
        .collect()
}

fn parse_string_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_range() {
        let range = parse_port_range("30000-30299").unwrap();
        assert_eq!(range.start, 30000);
        assert_eq!(range.end, 30299);

        let range = parse_port_range(" 29000 - 29299 ").unwrap();
        assert_eq!(range.start, 29000);
        assert_eq!(range.end, 29299);
    }

    #[test]
    fn test_parse_port_range_rejects_malformed() {
        assert!(parse_port_range("30000").is_err());
        assert!(parse_port_range("30299-30000").is_err());
        assert!(parse_port_range("0-100").is_err());
        assert!(parse_port_range("abc-def").is_err());
    }

    #[test]
    fn test_parse_int_list() {
        assert_eq!(parse_int_list("0").unwrap(), vec![0]);
        assert_eq!(parse_int_list("1, 2,3").unwrap(), vec![1, 2, 3]);
        assert!(parse_int_list("").unwrap().is_empty());
        assert!(parse_int_list("1,x").is_err());
    }

    #[test]
    fn test_parse_string_list_drops_empty_entries() {
        assert_eq!(
            parse_string_list("invite, ,premier,"),
            vec!["invite".to_string(), "premier".to_string()]
        );
        assert!(parse_string_list("  ").is_empty());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true").unwrap());
        assert!(parse_bool("1").unwrap());
        assert!(!parse_bool("F").unwrap());
        assert!(parse_bool("yes").is_err());
    }
}
