//! End-to-end configuration loading against a fully populated environment.
//!
//! Environment variables are process-global, so everything lives in a single
//! test function to keep the assertions race-free.

use std::time::Duration;

use tourney_controller::config::{Config, NodeIpPreference};

fn clear_controller_env() {
    for key in [
        "NAMESPACE",
        "POLL_INTERVAL",
        "CHART_PATH",
        "CHART_VALUES_FILE",
        "DB_HOST",
        "DB_PORT",
        "DB_USER",
        "DB_PASSWORD",
        "DB_NAME",
        "DB_SSLMODE",
        "DB_MAX_OPEN_CONNS",
        "DB_MAX_IDLE_CONNS",
        "DB_CONN_MAX_LIFETIME",
        "PORT_RANGE_GAME",
        "PORT_RANGE_SOURCETV",
        "PORT_RANGE_CLIENT",
        "PORT_RANGE_STEAM",
        "SRCDS_TICKRATE",
        "SRCDS_MAX_PLAYERS_OVERRIDE",
        "SRCDS_STATIC_TOKEN",
        "SRCDS_PASSWORD_LENGTH",
        "SRCDS_RCON_LENGTH",
        "MATCH_STATUSES",
        "DEFAULT_MAP",
        "MATCH_DIVISION_FILTERS",
        "HOST_NETWORK",
        "NODE_IP_PREFERENCE",
        "SERVICE_EXTERNAL_TRAFFIC_POLICY",
        "NOTIFICATIONS_ENABLED",
        "NOTIFICATIONS_LINK_FORMAT",
        "STEAM_API_KEY",
        "STEAM_APP_ID",
        "STEAM_TOKEN_MEMO_TEMPLATE",
        "STEAM_ENABLE_AUTO_TOKENS",
        "STEAM_ENABLE_TOKEN_CLEANUP",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn test_config_from_env() {
    clear_controller_env();

    // Defaults with an empty environment.
    let cfg = Config::from_env().expect("defaults should load");
    assert_eq!(cfg.namespace, "udl");
    assert_eq!(cfg.poll_interval, Duration::from_secs(30));
    assert_eq!(cfg.ports.game.start, 30000);
    assert_eq!(cfg.ports.game.end, 30299);
    assert_eq!(cfg.ports.steam.start, 29000);
    assert_eq!(cfg.srcds.password_length, 10);
    assert_eq!(cfg.srcds.rcon_length, 46);
    assert_eq!(cfg.matches.target_statuses, vec![0]);
    assert_eq!(cfg.matches.default_map, "tfdb_octagon_odb_a1");
    assert!(cfg.matches.division_filters.is_empty());
    assert!(!cfg.networking.host_network);
    assert_eq!(
        cfg.networking.node_ip_preference,
        NodeIpPreference::ExternalFirst
    );
    assert!(cfg.notifications.enabled);
    assert!(!cfg.steam.enable_auto_tokens);
    assert_eq!(cfg.steam.app_id, 440);

    // A fully specified environment.
    std::env::set_var("NAMESPACE", "tourney");
    std::env::set_var("POLL_INTERVAL", "1m 30s");
    std::env::set_var("PORT_RANGE_GAME", "31000-31099");
    std::env::set_var("SRCDS_PASSWORD_LENGTH", "12");
    std::env::set_var("MATCH_STATUSES", "1, 2,5");
    std::env::set_var("MATCH_DIVISION_FILTERS", "Invite,PREMIER");
    std::env::set_var("HOST_NETWORK", "1");
    std::env::set_var("NODE_IP_PREFERENCE", "internal-only");
    std::env::set_var("NOTIFICATIONS_ENABLED", "false");
    std::env::set_var("DB_CONN_MAX_LIFETIME", "15m");
    std::env::set_var("STEAM_ENABLE_AUTO_TOKENS", "true");
    std::env::set_var("STEAM_API_KEY", "key");

    let cfg = Config::from_env().expect("explicit environment should load");
    assert_eq!(cfg.namespace, "tourney");
    assert_eq!(cfg.poll_interval, Duration::from_secs(90));
    assert_eq!(cfg.ports.game.start, 31000);
    assert_eq!(cfg.srcds.password_length, 12);
    assert_eq!(cfg.matches.target_statuses, vec![1, 2, 5]);
    // Filters are normalized to lowercase at load time.
    assert_eq!(cfg.matches.division_filters, vec!["invite", "premier"]);
    assert!(cfg.networking.host_network);
    assert_eq!(
        cfg.networking.node_ip_preference,
        NodeIpPreference::InternalOnly
    );
    assert!(!cfg.notifications.enabled);
    assert_eq!(
        cfg.database.conn_max_lifetime,
        Some(Duration::from_secs(900))
    );
    assert!(cfg.steam.enable_auto_tokens);

    // Validation failures are fatal.
    std::env::set_var("SRCDS_PASSWORD_LENGTH", "4");
    assert!(Config::from_env().is_err());
    std::env::set_var("SRCDS_PASSWORD_LENGTH", "12");

    std::env::set_var("MATCH_STATUSES", ",");
    assert!(Config::from_env().is_err());
    std::env::set_var("MATCH_STATUSES", "1");

    std::env::set_var("NODE_IP_PREFERENCE", "round-robin");
    assert!(Config::from_env().is_err());

    clear_controller_env();
}
