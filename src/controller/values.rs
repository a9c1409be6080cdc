//! Per-release override bundle handed to the manifest renderer.
//!
//! The renderer treats this as free-form data, so it is built as a JSON
//! value tree rather than typed structs.

use serde_json::{json, Value};

use crate::config::Config;
use crate::db::{League, Match, MatchRound};
use crate::state::{prefer_value, ServerState};

/// Builds the override values for one round's release.
pub fn build_values(
    cfg: &Config,
    match_row: &Match,
    round: &MatchRound,
    division_id: &str,
    league: &League,
    home_ids: &[String],
    away_ids: &[String],
    state: &ServerState,
) -> Value {
    let max_players = if cfg.srcds.max_players_override > 0 {
        cfg.srcds.max_players_override
    } else {
        league.max_players
    };

    let env = json!([
        env_var("SRCDS_PORT", state.ports.game),
        env_var("SRCDS_PW", &state.password),
        env_var("SRCDS_MAXPLAYERS", max_players),
        env_var("SRCDS_TICKRATE", cfg.srcds.tick_rate),
        env_var("SRCDS_RCONPW", &state.rcon),
        env_var(
            "SRCDS_STARTMAP",
            prefer_value(&[&state.map, &cfg.matches.default_map]),
        ),
        env_var(
            "SRCDS_STATIC_HOSTNAME",
            format!("UDL.TF | {} | Round #{}", match_row.id, round.id),
        ),
        env_var("SRCDS_TOKEN", &state.token),
        env_var("SRCDS_TV_PORT", state.ports.sourcetv),
        env_var("SRCDS_CLIENT_PORT", state.ports.client),
        env_var("SRCDS_STEAM_PORT", state.ports.steam),
        env_var("MATCH_ID", match_row.id),
        env_var("ROUND_ID", round.id),
        env_var("AWAY_TEAM", away_ids.join(",")),
        env_var("AWAY_TEAM_ID", match_row.roster_away_id),
        env_var("HOME_TEAM", home_ids.join(",")),
        env_var("HOME_TEAM_ID", match_row.roster_home_id),
        env_var("MIN_PLAYERS", league.min_players),
        env_var("MAX_PLAYERS", max_players),
        env_var("WIN_LIMIT", match_row.win_limit),
    ]);

    let app_ports = json!([
        named_port("game-udp", state.ports.game, "UDP"),
        named_port("game-tcp", state.ports.game, "TCP"),
        named_port("sourcetv", state.ports.sourcetv, "UDP"),
        named_port("client", state.ports.client, "UDP"),
        named_port("steam", state.ports.steam, "UDP"),
    ]);

    let mut service = json!({ "enabled": !cfg.networking.host_network });
    if !cfg.networking.host_network {
        service["type"] = json!("NodePort");
        service["nameOverride"] = json!(state.release_name);
        service["ports"] = json!([
            service_port("game-udp", state.ports.game, "UDP"),
            service_port("game-tcp", state.ports.game, "TCP"),
            service_port("sourcetv", state.ports.sourcetv, "UDP"),
            service_port("client", state.ports.client, "UDP"),
            service_port("steam", state.ports.steam, "UDP"),
        ]);
    }

    let mut values = json!({
        "workload": {
            "kind": "Deployment",
            "nameOverride": state.release_name,
            "deploymentStrategy": { "type": "Recreate" },
        },
        "service": service,
        "app": {
            "name": state.release_name,
            "containerPort": state.ports.game,
            "ports": app_ports,
            "env": env,
            "stdin": true,
            "tty": true,
        },
        "paths": {
            "hostSource": "/mnt/tf2",
            "hostPathType": "Directory",
            "containerTarget": "/tf",
        },
        "decompressor": {
            "scanBase": false,
            "scanOverlays": ["serverfiles-dodgeball-tourney"],
            "cache": {
                "enabled": true,
                "type": "hostPath",
                "mountAsOverlay": true,
                "overlayName": "decomp-cache",
                "hostPath": "/mnt/dodgeball-cache",
                "hostPathType": "DirectoryOrCreate",
            },
        },
        "writablePaths": [
            "tf/logs",
            "tf/demos",
            "tf/addons/sourcemod/data",
            "tf/addons/sourcemod/logs",
        ],
        "copyTemplates": [
            {
                "targetPath": "tf/addons/sourcemod/configs/sourcebans",
                "overlay": "serverfiles-base",
                "sourcePath": "serverfiles/base/addons/sourcemod/configs/sourcebans",
                "cleanTarget": false,
                "targetMode": "writable",
                "onlyOnInit": true,
            },
        ],
        "overlays": [
            overlay("serverfiles-base-sourcemod", "/mnt/serverfiles", "serverfiles/base/sourcemod"),
            overlay("serverfiles-base-sourcebans", "/mnt/serverfiles", "serverfiles/base/sourcebans"),
            overlay("serverfilesprivate-base", "/mnt/serverfilesprivate", "serverfiles/base"),
            overlay(
                "serverfilesprivate-dodgeball-base",
                "/mnt/serverfilesprivate",
                "serverfiles/dodgeball/base",
            ),
            overlay(
                "serverfiles-dodgeball-tourney",
                "/mnt/serverfiles",
                "serverfiles/dodgeball/tourney",
            ),
        ],
        "permissionsInit": {
            "applyDuringMerge": true,
            "applyPaths": ["/tf"],
            "user": 1000,
            "group": 1000,
            "chmod": "775",
        },
        "podLabels": {
            "udl.tf/match-id": match_row.id.to_string(),
            "udl.tf/round-id": round.id.to_string(),
            "udl.tf/division": division_id,
        },
    });

    if cfg.networking.host_network {
        values["hostNetwork"] = json!(true);
        values["dnsPolicy"] = json!("ClusterFirstWithHostNet");
    } else if !cfg.networking.external_traffic_policy.is_empty() {
        values["service"]["externalTrafficPolicy"] = json!(cfg.networking.external_traffic_policy);
    }

    values
}

// Container env values are strings regardless of their source type.
fn env_var(name: &str, value: impl ToString) -> Value {
    json!({ "name": name, "value": value.to_string() })
}

fn named_port(name: &str, port: u16, protocol: &str) -> Value {
    json!({ "name": name, "containerPort": port, "protocol": protocol })
}

fn service_port(name: &str, port: u16, protocol: &str) -> Value {
    json!({
        "name": name,
        "port": port,
        "targetPort": port,
        "protocol": protocol,
        "nodePort": port,
    })
}

fn overlay(name: &str, path: &str, source_path: &str) -> Value {
    json!({
        "name": name,
        "path": path,
        "sourcePath": source_path,
        "hostPathType": "Directory",
        "readOnly": false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::Assignment;

    fn test_config() -> Config {
        use crate::config::*;
        Config {
            namespace: "udl".to_string(),
            poll_interval: std::time::Duration::from_secs(30),
            chart: ChartConfig {
                path: "./chart".to_string(),
                values_file: String::new(),
            },
            database: DatabaseConfig {
                host: "postgres".to_string(),
                port: 5432,
                user: "postgres".to_string(),
                password: String::new(),
                name: "udl".to_string(),
                ssl_mode: "disable".to_string(),
                max_open_conns: 10,
                max_idle_conns: 5,
                conn_max_lifetime: None,
            },
            ports: PortsConfig {
                game: PortRange { start: 30000, end: 30299 },
                sourcetv: PortRange { start: 30300, end: 30599 },
                client: PortRange { start: 40000, end: 40299 },
                steam: PortRange { start: 29000, end: 29299 },
            },
            srcds: SrcdsConfig {
                tick_rate: 128,
                max_players_override: 0,
                static_token: String::new(),
                password_length: 10,
                rcon_length: 46,
            },
            matches: MatchConfig {
                target_statuses: vec![0],
                default_map: "tfdb_octagon_odb_a1".to_string(),
                division_filters: Vec::new(),
            },
            networking: NetworkingConfig {
                host_network: false,
                node_ip_preference: NodeIpPreference::ExternalFirst,
                external_traffic_policy: "Cluster".to_string(),
            },
            notifications: NotificationConfig {
                enabled: true,
                link_format: "/matches/{match_id}".to_string(),
            },
            steam: SteamConfig {
                api_key: String::new(),
                app_id: 440,
                token_memo_template: "udl-{match_id}-r{round_id}".to_string(),
                enable_auto_tokens: false,
                enable_token_cleanup: false,
            },
        }
    }

    fn test_inputs() -> (Match, MatchRound, League, ServerState) {
        let match_row = Match {
            id: 42,
            roster_home_id: 11,
            roster_away_id: 12,
            win_limit: 5,
            status: 0,
            manual_not_done: false,
        };
        let round = MatchRound {
            id: 7,
            match_id: 42,
            map_id: 3,
            home_team_score: 0,
            away_team_score: 0,
            loser_id: None,
            winner_id: None,
            has_outcome: false,
            score_difference: 0.0,
            home_ready: true,
            away_ready: true,
        };
        let league = League {
            min_players: 6,
            max_players: 12,
            points_per_round_win: 1.0,
            points_per_round_draw: 0.5,
            points_per_round_loss: 0.0,
            points_per_match_win: 3.0,
            points_per_match_loss: 0.0,
            points_per_match_draw: 1.0,
            points_per_forfeit_win: 3.0,
            points_per_forfeit_loss: 0.0,
            points_per_forfeit_draw: 1.0,
        };
        let state = ServerState {
            release_name: "udl-42-r7".to_string(),
            ports: Assignment { game: 30000, sourcetv: 30300, client: 40000, steam: 29000 },
            password: "Xa12cdE678".to_string(),
            rcon: "rconrconrconrcon".to_string(),
            map: "tfdb_spacebox_a2".to_string(),
            token: "TOKEN123".to_string(),
        };
        (match_row, round, league, state)
    }

    fn env_value<'a>(values: &'a Value, name: &str) -> &'a str {
        values["app"]["env"]
            .as_array()
            .unwrap()
            .iter()
            .find(|entry| entry["name"] == name)
            .unwrap()["value"]
            .as_str()
            .unwrap()
    }

    #[test]
    fn test_build_values_env_and_service_ports() {
        let cfg = test_config();
        let (match_row, round, league, state) = test_inputs();
        let values = build_values(
            &cfg,
            &match_row,
            &round,
            "div-1",
            &league,
            &["7656111".to_string()],
            &["7656222".to_string(), "7656333".to_string()],
            &state,
        );

        assert_eq!(env_value(&values, "SRCDS_PORT"), "30000");
        assert_eq!(env_value(&values, "SRCDS_PW"), "Xa12cdE678");
        assert_eq!(env_value(&values, "SRCDS_MAXPLAYERS"), "12");
        assert_eq!(env_value(&values, "SRCDS_STARTMAP"), "tfdb_spacebox_a2");
        assert_eq!(env_value(&values, "SRCDS_STATIC_HOSTNAME"), "UDL.TF | 42 | Round #7");
        assert_eq!(env_value(&values, "AWAY_TEAM"), "7656222,7656333");
        assert_eq!(env_value(&values, "HOME_TEAM"), "7656111");
        assert_eq!(env_value(&values, "WIN_LIMIT"), "5");

        assert_eq!(values["service"]["enabled"], true);
        assert_eq!(values["service"]["type"], "NodePort");
        assert_eq!(values["service"]["externalTrafficPolicy"], "Cluster");
        let service_ports = values["service"]["ports"].as_array().unwrap();
        assert_eq!(service_ports.len(), 5);
        for port in service_ports {
            assert_eq!(port["port"], port["nodePort"]);
            assert_eq!(port["port"], port["targetPort"]);
        }

        assert_eq!(values["workload"]["kind"], "Deployment");
        assert_eq!(values["workload"]["deploymentStrategy"]["type"], "Recreate");
        assert_eq!(values["podLabels"]["udl.tf/match-id"], "42");
        assert_eq!(values["podLabels"]["udl.tf/division"], "div-1");
        assert!(values.get("hostNetwork").is_none());
    }

    #[test]
    fn test_build_values_host_network_disables_service() {
        let mut cfg = test_config();
        cfg.networking.host_network = true;
        let (match_row, round, league, state) = test_inputs();
        let values = build_values(&cfg, &match_row, &round, "div-1", &league, &[], &[], &state);

        assert_eq!(values["service"]["enabled"], false);
        assert!(values["service"].get("ports").is_none());
        assert_eq!(values["hostNetwork"], true);
        assert_eq!(values["dnsPolicy"], "ClusterFirstWithHostNet");
    }

    #[test]
    fn test_build_values_max_players_override_wins() {
        let mut cfg = test_config();
        cfg.srcds.max_players_override = 24;
        let (match_row, round, league, state) = test_inputs();
        let values = build_values(&cfg, &match_row, &round, "div-1", &league, &[], &[], &state);
        assert_eq!(env_value(&values, "SRCDS_MAXPLAYERS"), "24");
        assert_eq!(env_value(&values, "MAX_PLAYERS"), "24");
        assert_eq!(env_value(&values, "MIN_PLAYERS"), "6");
    }

    #[test]
    fn test_build_values_falls_back_to_default_map() {
        let cfg = test_config();
        let (match_row, round, league, mut state) = test_inputs();
        state.map = String::new();
        let values = build_values(&cfg, &match_row, &round, "div-1", &league, &[], &[], &state);
        assert_eq!(env_value(&values, "SRCDS_STARTMAP"), "tfdb_octagon_odb_a1");
    }
}
