//! Per-round reconciliation: ensure a server exists, or tear it down.
//!
//! Each tick reads the schedule from the database and, round by round,
//! converges cluster state toward it. Ensure persists state before applying
//! manifests and applies manifests before publishing connection details, so
//! a crash between any two steps leaves a resumable intermediate. Teardown
//! deletes the applied objects first and the state secret last.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{Node, Service};
use kube::api::{Api, ListParams};
use kube::Client;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::chart::{ChartError, Renderer};
use crate::config::{Config, NodeIpPreference};
use crate::db::{DbError, League, Match, MatchDetails, MatchRound, Repository};
use crate::ports::{used_node_ports, Allocator, Assignment, PortError};
use crate::state::{prefer_value, release_name, ServerState, StateError, StateStore};
use crate::steam::{render_memo, SteamClient, SteamError};

use super::values::build_values;

/// Errors that abort a single round's ensure or teardown.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("port allocation failed: {0}")]
    Ports(#[from] PortError),

    #[error("server state error: {0}")]
    State(#[from] StateError),

    #[error("chart error: {0}")]
    Chart(#[from] ChartError),

    #[error("cluster error: {0}")]
    Kube(#[from] kube::Error),

    /// No node exposed a publishable IPv4 address.
    #[error("no suitable node address found")]
    NoNodeAddress,
}

/// Coordinates database polling with cluster reconciliation.
pub struct Controller {
    cfg: Config,
    repo: Repository,
    client: Client,
    allocator: Allocator,
    state_store: StateStore,
    renderer: Renderer,
    steam: Option<SteamClient>,
}

impl Controller {
    /// Wires together the reconciliation dependencies.
    pub fn new(cfg: Config, repo: Repository, client: Client, renderer: Renderer) -> Self {
        let steam = if cfg.steam.enable_auto_tokens && !cfg.steam.api_key.is_empty() {
            Some(SteamClient::new(cfg.steam.api_key.clone()))
        } else {
            None
        };

        Self {
            allocator: Allocator::new(cfg.ports.clone()),
            state_store: StateStore::new(
                client.clone(),
                &cfg.namespace,
                &cfg.matches.default_map,
            ),
            cfg,
            repo,
            client,
            renderer,
            steam,
        }
    }

    /// One full pass over every eligible match. A database failure aborts
    /// the tick; a single match's failure is logged and does not.
    pub async fn reconcile(&self) -> Result<(), ReconcileError> {
        let matches = self
            .repo
            .fetch_matches(&self.cfg.matches.target_statuses)
            .await?;
        debug!(match_count = matches.len(), "Fetched eligible matches");

        for match_row in matches {
            if let Err(err) = self.reconcile_match(&match_row).await {
                error!(match_id = match_row.id, error = %err, "Match reconcile failed");
            }
        }
        Ok(())
    }

    async fn reconcile_match(&self, match_row: &Match) -> Result<(), ReconcileError> {
        let division = self.repo.fetch_division(match_row.roster_home_id).await?;

        if !division_matches_filter(&self.cfg.matches.division_filters, &division.name) {
            debug!(
                match_id = match_row.id,
                division = %division.name,
                "Skipping match: division excluded by filter"
            );
            return Ok(());
        }

        let league = self.repo.fetch_league(&division.id).await?;
        let home_ids = self
            .repo
            .fetch_team_steam_ids(match_row.roster_home_id)
            .await?;
        let away_ids = self
            .repo
            .fetch_team_steam_ids(match_row.roster_away_id)
            .await?;
        let rounds = self.repo.fetch_match_rounds(match_row.id).await?;

        for round in &rounds {
            let map_name = match self.repo.fetch_map_name(round.map_id).await {
                Ok(name) => name,
                Err(err) => {
                    warn!(
                        round_id = round.id,
                        error = %err,
                        "Map lookup failed, using default"
                    );
                    self.cfg.matches.default_map.clone()
                }
            };

            let details = self
                .repo
                .fetch_match_details(match_row.id, round.id)
                .await?;

            let needs_server = match_row.manual_not_done || !round.has_outcome;
            let release = release_name(match_row.id, round.id);

            if needs_server {
                if let Err(err) = self
                    .ensure_round(
                        match_row, round, &division.id, &league, &home_ids, &away_ids, &map_name,
                        &release,
                    )
                    .await
                {
                    error!(
                        match_id = match_row.id,
                        round_id = round.id,
                        error = %err,
                        "Ensure failed"
                    );
                }
                continue;
            }

            if details.is_some() {
                if let Err(err) = self
                    .teardown_round(
                        match_row,
                        round,
                        &division.id,
                        &league,
                        &home_ids,
                        &away_ids,
                        &map_name,
                        &release,
                        details.as_ref(),
                    )
                    .await
                {
                    error!(
                        match_id = match_row.id,
                        round_id = round.id,
                        error = %err,
                        "Teardown failed"
                    );
                }
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn ensure_round(
        &self,
        match_row: &Match,
        round: &MatchRound,
        division_id: &str,
        league: &League,
        home_ids: &[String],
        away_ids: &[String],
        map_name: &str,
        release: &str,
    ) -> Result<(), ReconcileError> {
        let mut is_new = false;
        let state = match self.state_store.load(release).await? {
            Some(mut state) => {
                state.map = prefer_value(&[map_name, &state.map, &self.cfg.matches.default_map]);
                if state.token.is_empty() {
                    state.token = match self.mint_token(match_row.id, round.id).await {
                        Ok(token) => token,
                        Err(err) => {
                            warn!(
                                match_id = match_row.id,
                                round_id = round.id,
                                error = %err,
                                "Token mint for existing server failed, falling back to static token"
                            );
                            self.cfg.srcds.static_token.clone()
                        }
                    };
                }
                state
            }
            None => {
                let ports = self.allocate_ports().await?;
                let password = generate_secret(self.cfg.srcds.password_length);
                let rcon = generate_secret(self.cfg.srcds.rcon_length);
                let token = match self.mint_token(match_row.id, round.id).await {
                    Ok(token) => token,
                    Err(err) => {
                        warn!(
                            match_id = match_row.id,
                            round_id = round.id,
                            error = %err,
                            "Token mint failed, falling back to static token"
                        );
                        self.cfg.srcds.static_token.clone()
                    }
                };

                is_new = true;
                ServerState {
                    release_name: release.to_string(),
                    ports,
                    password,
                    rcon,
                    map: map_name.to_string(),
                    token,
                }
            }
        };

        self.state_store
            .persist(match_row.id, round.id, &state)
            .await?;

        let values = build_values(
            &self.cfg, match_row, round, division_id, league, home_ids, away_ids, &state,
        );
        self.renderer.apply(release, &values).await?;

        let node_address = self.pick_node_address().await?;

        self.repo
            .upsert_match_details(&MatchDetails {
                match_id: match_row.id,
                round_id: round.id,
                server_ip: node_address.clone(),
                port: i32::from(state.ports.game),
                sourcetv_port: i32::from(state.ports.sourcetv),
                password: state.password.clone(),
                map: prefer_value(&[&state.map, map_name, &self.cfg.matches.default_map]),
            })
            .await?;

        // Notify only on first-time creation; a re-ensure after a crash must
        // not ping both rosters again.
        if is_new && self.cfg.notifications.enabled {
            let message = format!(
                "Match {} Round {} is running on {}:{} with password {}",
                match_row.id, round.id, node_address, state.ports.game, state.password
            );
            let link = self
                .cfg
                .notifications
                .link_format
                .replace("{match_id}", &match_row.id.to_string());
            if let Err(err) = self
                .repo
                .send_notifications_to_teams(
                    match_row.roster_home_id,
                    match_row.roster_away_id,
                    &message,
                    &link,
                )
                .await
            {
                error!(match_id = match_row.id, error = %err, "Notifications failed");
            }
        }

        info!(
            match_id = match_row.id,
            round_id = round.id,
            release = %release,
            game_port = state.ports.game,
            new = is_new,
            "Server ensured"
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn teardown_round(
        &self,
        match_row: &Match,
        round: &MatchRound,
        division_id: &str,
        league: &League,
        home_ids: &[String],
        away_ids: &[String],
        map_name: &str,
        release: &str,
        details: Option<&MatchDetails>,
    ) -> Result<(), ReconcileError> {
        let state = match self.state_store.load(release).await? {
            Some(state) => state,
            None => match details {
                Some(details) => synthesize_state(
                    release,
                    details,
                    map_name,
                    &self.cfg.matches.default_map,
                    &self.cfg.srcds.static_token,
                ),
                None => {
                    info!(
                        match_id = match_row.id,
                        round_id = round.id,
                        "No server state or connection details; nothing to tear down"
                    );
                    return Ok(());
                }
            },
        };

        let values = build_values(
            &self.cfg, match_row, round, division_id, league, home_ids, away_ids, &state,
        );
        self.renderer.delete(release, &values).await?;

        self.repo
            .delete_match_details(match_row.id, round.id)
            .await?;

        self.state_store.delete(release).await?;

        if let Err(err) = self.cleanup_token(match_row.id, round.id).await {
            warn!(
                match_id = match_row.id,
                round_id = round.id,
                error = %err,
                "Token cleanup failed"
            );
        }

        info!(
            match_id = match_row.id,
            round_id = round.id,
            release = %release,
            "Server torn down"
        );
        Ok(())
    }

    /// Administrative one-shot teardown for a single round.
    pub async fn delete_server(&self, match_id: i32, round_id: i32) -> Result<(), ReconcileError> {
        let match_row = self.repo.fetch_match_by_id(match_id).await?;
        let round = self.repo.fetch_match_round_by_id(match_id, round_id).await?;
        let division = self.repo.fetch_division(match_row.roster_home_id).await?;
        let league = self.repo.fetch_league(&division.id).await?;
        let home_ids = self
            .repo
            .fetch_team_steam_ids(match_row.roster_home_id)
            .await?;
        let away_ids = self
            .repo
            .fetch_team_steam_ids(match_row.roster_away_id)
            .await?;

        let map_name = match self.repo.fetch_map_name(round.map_id).await {
            Ok(name) => name,
            Err(err) => {
                warn!(round_id, error = %err, "Map lookup failed, using default");
                self.cfg.matches.default_map.clone()
            }
        };

        let details = self.repo.fetch_match_details(match_id, round_id).await?;
        let release = release_name(match_id, round_id);

        self.teardown_round(
            &match_row,
            &round,
            &division.id,
            &league,
            &home_ids,
            &away_ids,
            &map_name,
            &release,
            details.as_ref(),
        )
        .await
    }

    /// Derives the used-set from the live services and picks four ports.
    async fn allocate_ports(&self) -> Result<Assignment, ReconcileError> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.cfg.namespace);
        let list = services.list(&ListParams::default()).await?;
        let used: BTreeSet<u16> = used_node_ports(&list.items);
        Ok(self.allocator.allocate(&used)?)
    }

    /// Scans node status addresses for a publishable IPv4 address.
    async fn pick_node_address(&self) -> Result<String, ReconcileError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes.list(&ListParams::default()).await?;

        let mut internal_candidate: Option<String> = None;
        for node in &list.items {
            let Some(addresses) = node.status.as_ref().and_then(|s| s.addresses.as_ref()) else {
                continue;
            };
            for address in addresses {
                if !is_ipv4(&address.address) {
                    continue;
                }
                if address.type_ == "ExternalIP"
                    && self.cfg.networking.node_ip_preference == NodeIpPreference::ExternalFirst
                {
                    return Ok(address.address.clone());
                }
                if address.type_ == "InternalIP" && internal_candidate.is_none() {
                    internal_candidate = Some(address.address.clone());
                }
            }
        }

        internal_candidate.ok_or(ReconcileError::NoNodeAddress)
    }

    /// Mints a fresh registry token, or hands back the static token when
    /// minting is not configured.
    async fn mint_token(&self, match_id: i32, round_id: i32) -> Result<String, SteamError> {
        let Some(steam) = &self.steam else {
            return Ok(self.cfg.srcds.static_token.clone());
        };

        let memo = render_memo(&self.cfg.steam.token_memo_template, match_id, round_id);
        let account = steam.create_account(self.cfg.steam.app_id, &memo).await?;
        debug!(
            match_id,
            round_id,
            steam_id = %account.steam_id,
            "Minted registry token"
        );
        Ok(account.login_token)
    }

    /// Deletes every live registry identity whose memo matches the round.
    async fn cleanup_token(&self, match_id: i32, round_id: i32) -> Result<(), SteamError> {
        if !self.cfg.steam.enable_token_cleanup {
            return Ok(());
        }
        let Some(steam) = &self.steam else {
            return Ok(());
        };

        let memo = render_memo(&self.cfg.steam.token_memo_template, match_id, round_id);
        let accounts = steam.get_account_list().await?;
        for account in accounts {
            if account.memo != memo || account.is_deleted {
                continue;
            }
            match steam.delete_account(&account.steam_id).await {
                Ok(()) => debug!(
                    match_id,
                    round_id,
                    steam_id = %account.steam_id,
                    "Deleted registry identity"
                ),
                Err(err) => warn!(
                    steam_id = %account.steam_id,
                    error = %err,
                    "Failed to delete registry identity"
                ),
            }
        }
        Ok(())
    }
}

/// True when the division name passes the configured filter list.
fn division_matches_filter(filters: &[String], name: &str) -> bool {
    if filters.is_empty() {
        return true;
    }
    let normalized = name.trim().to_lowercase();
    if normalized.is_empty() {
        return false;
    }
    filters
        .iter()
        .filter(|filter| !filter.is_empty())
        .any(|filter| normalized.contains(filter.as_str()))
}

/// Reconstructs enough state to tear a release down when its secret is
/// already gone. Client and auxiliary ports are derived at fixed offsets
/// from the published game port.
fn synthesize_state(
    release: &str,
    details: &MatchDetails,
    map_name: &str,
    default_map: &str,
    static_token: &str,
) -> ServerState {
    let game = u16::try_from(details.port).unwrap_or(0);
    let sourcetv = u16::try_from(details.sourcetv_port).unwrap_or(0);
    ServerState {
        release_name: release.to_string(),
        ports: Assignment {
            game,
            sourcetv,
            client: game.saturating_add(1),
            steam: game.saturating_add(2),
        },
        password: details.password.clone(),
        rcon: String::new(),
        map: prefer_value(&[&details.map, map_name, default_map]),
        token: static_token.to_string(),
    }
}

/// Draws a `[A-Za-z0-9]` secret of the given length from the OS entropy
/// source.
fn generate_secret(length: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

fn is_ipv4(address: &str) -> bool {
    address.trim().parse::<std::net::Ipv4Addr>().is_ok()
}
