//! Repository centralizing all scheduling-database access.

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use super::DbError;

/// A row in `league_matches` relevant to scheduling.
#[derive(Debug, Clone)]
pub struct Match {
    pub id: i32,
    pub roster_home_id: i32,
    pub roster_away_id: i32,
    pub win_limit: i32,
    pub status: i32,
    pub manual_not_done: bool,
}

impl<'r> sqlx::FromRow<'r, PgRow> for Match {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            roster_home_id: row.try_get("home_team_id")?,
            roster_away_id: row.try_get("away_team_id")?,
            win_limit: row.try_get("win_limit")?,
            status: row.try_get("status")?,
            manual_not_done: row.try_get("manual_not_done")?,
        })
    }
}

/// A row in `league_match_rounds`.
#[derive(Debug, Clone)]
pub struct MatchRound {
    pub id: i32,
    pub match_id: i32,
    pub map_id: i32,
    pub home_team_score: i32,
    pub away_team_score: i32,
    pub loser_id: Option<i64>,
    pub winner_id: Option<i64>,
    pub has_outcome: bool,
    pub score_difference: f64,
    pub home_ready: bool,
    pub away_ready: bool,
}

impl<'r> sqlx::FromRow<'r, PgRow> for MatchRound {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            match_id: row.try_get("match_id")?,
            map_id: row.try_get("map_id")?,
            home_team_score: row.try_get("home_team_score")?,
            away_team_score: row.try_get("away_team_score")?,
            loser_id: row.try_get("loser_id")?,
            winner_id: row.try_get("winner_id")?,
            has_outcome: row.try_get("has_outcome")?,
            score_difference: row.try_get("score_difference")?,
            home_ready: row.try_get("home_ready")?,
            away_ready: row.try_get("away_ready")?,
        })
    }
}

/// A row in `matches_server_details`, the published connection details.
#[derive(Debug, Clone)]
pub struct MatchDetails {
    pub match_id: i32,
    pub round_id: i32,
    pub server_ip: String,
    pub port: i32,
    pub sourcetv_port: i32,
    pub password: String,
    pub map: String,
}

impl<'r> sqlx::FromRow<'r, PgRow> for MatchDetails {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            match_id: row.try_get("match_id")?,
            round_id: row.try_get("round_id")?,
            server_ip: row.try_get("server_ip")?,
            port: row.try_get("port")?,
            sourcetv_port: row.try_get("sourcetvport")?,
            password: row.try_get("password")?,
            map: row.try_get("map")?,
        })
    }
}

/// Per-league gameplay metadata. Only the player bounds feed the value
/// bundle; the point tables ride through unchanged.
#[derive(Debug, Clone)]
pub struct League {
    pub min_players: i32,
    pub max_players: i32,
    pub points_per_round_win: f32,
    pub points_per_round_draw: f32,
    pub points_per_round_loss: f32,
    pub points_per_match_win: f32,
    pub points_per_match_loss: f32,
    pub points_per_match_draw: f32,
    pub points_per_forfeit_win: f32,
    pub points_per_forfeit_loss: f32,
    pub points_per_forfeit_draw: f32,
}

impl<'r> sqlx::FromRow<'r, PgRow> for League {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            min_players: row.try_get("min_players")?,
            max_players: row.try_get("max_players_in_game")?,
            points_per_round_win: row.try_get("points_per_round_win")?,
            points_per_round_draw: row.try_get("points_per_round_draw")?,
            points_per_round_loss: row.try_get("points_per_round_loss")?,
            points_per_match_win: row.try_get("points_per_match_win")?,
            points_per_match_loss: row.try_get("points_per_match_loss")?,
            points_per_match_draw: row.try_get("points_per_match_draw")?,
            points_per_forfeit_win: row.try_get("points_per_forfeit_win")?,
            points_per_forfeit_loss: row.try_get("points_per_forfeit_loss")?,
            points_per_forfeit_draw: row.try_get("points_per_forfeit_draw")?,
        })
    }
}

/// Identifier and display name for a division.
#[derive(Debug, Clone)]
pub struct Division {
    pub id: String,
    pub name: String,
}

/// Repository over the scheduling database.
#[derive(Clone)]
pub struct Repository {
    pool: PgPool,
}

impl Repository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns all matches whose status is in the provided set and whose
    /// rosters are both assigned.
    pub async fn fetch_matches(&self, statuses: &[i32]) -> Result<Vec<Match>, DbError> {
        sqlx::query_as::<_, Match>(
            r#"
            SELECT id, home_team_id, away_team_id, win_limit, status, manual_not_done
            FROM league_matches
            WHERE status = ANY($1) AND home_team_id IS NOT NULL AND away_team_id IS NOT NULL
            "#,
        )
        .bind(statuses.to_vec())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    /// Fetches a single match by id.
    pub async fn fetch_match_by_id(&self, match_id: i32) -> Result<Match, DbError> {
        sqlx::query_as::<_, Match>(
            r#"
            SELECT id, home_team_id, away_team_id, win_limit, status, manual_not_done
            FROM league_matches
            WHERE id = $1
            "#,
        )
        .bind(match_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?
        .ok_or(DbError::MatchNotFound(match_id))
    }

    /// Resolves the division a roster plays in.
    pub async fn fetch_division(&self, roster_id: i32) -> Result<Division, DbError> {
        let row = sqlx::query(
            r#"
            SELECT lr.division_id, ld.name
            FROM league_rosters lr
            JOIN league_divisions ld ON ld.id = lr.division_id
            WHERE lr.id = $1
            "#,
        )
        .bind(roster_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(Division {
            id: row.try_get("division_id").map_err(DbError::Query)?,
            name: row.try_get("name").map_err(DbError::Query)?,
        })
    }

    /// Loads league metadata by division id.
    pub async fn fetch_league(&self, division_id: &str) -> Result<League, DbError> {
        let league_id: i32 =
            sqlx::query_scalar("SELECT league_id FROM league_divisions WHERE id = $1")
                .bind(division_id)
                .fetch_one(&self.pool)
                .await
                .map_err(DbError::Query)?;

        sqlx::query_as::<_, League>(
            r#"
            SELECT min_players, max_players_in_game,
                   points_per_round_win, points_per_round_draw, points_per_round_loss,
                   points_per_match_win, points_per_match_loss, points_per_match_draw,
                   points_per_forfeit_win, points_per_forfeit_loss, points_per_forfeit_draw
            FROM leagues
            WHERE id = $1
            "#,
        )
        .bind(league_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    /// Returns every steam identifier on the roster, trimmed and de-duplicated.
    pub async fn fetch_team_steam_ids(&self, roster_id: i32) -> Result<Vec<String>, DbError> {
        let rows: Vec<Option<String>> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT users.steam_id::text
            FROM league_roster_players lrp
            JOIN users ON users.id = lrp.user_id
            WHERE lrp.roster_id = $1
            "#,
        )
        .bind(roster_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(rows
            .into_iter()
            .flatten()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect())
    }

    /// Returns every round for a given match.
    pub async fn fetch_match_rounds(&self, match_id: i32) -> Result<Vec<MatchRound>, DbError> {
        sqlx::query_as::<_, MatchRound>(
            r#"
            SELECT id, match_id, map_id, home_team_score, away_team_score, loser_id, winner_id,
                   has_outcome, score_difference, home_ready, away_ready
            FROM league_match_rounds
            WHERE match_id = $1
            "#,
        )
        .bind(match_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    /// Fetches a specific round, deriving `has_outcome` from the winner and
    /// loser columns.
    pub async fn fetch_match_round_by_id(
        &self,
        match_id: i32,
        round_id: i32,
    ) -> Result<MatchRound, DbError> {
        sqlx::query_as::<_, MatchRound>(
            r#"
            SELECT id, match_id, map_id, home_team_score, away_team_score, loser_id, winner_id,
                   (loser_id IS NOT NULL OR winner_id IS NOT NULL) AS has_outcome,
                   (COALESCE(home_team_score, 0) - COALESCE(away_team_score, 0))::float8
                       AS score_difference,
                   home_ready, away_ready
            FROM league_match_rounds
            WHERE match_id = $1 AND id = $2
            "#,
        )
        .bind(match_id)
        .bind(round_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?
        .ok_or(DbError::RoundNotFound { match_id, round_id })
    }

    /// Returns the map name for the provided id.
    pub async fn fetch_map_name(&self, map_id: i32) -> Result<String, DbError> {
        sqlx::query_scalar("SELECT name FROM maps WHERE id = $1")
            .bind(map_id)
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::Query)
    }

    /// Retrieves the saved connection details, if any.
    pub async fn fetch_match_details(
        &self,
        match_id: i32,
        round_id: i32,
    ) -> Result<Option<MatchDetails>, DbError> {
        sqlx::query_as::<_, MatchDetails>(
            r#"
            SELECT match_id, round_id, server_ip, port, sourcetvport, password, map
            FROM matches_server_details
            WHERE match_id = $1 AND round_id = $2
            "#,
        )
        .bind(match_id)
        .bind(round_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    /// Inserts or updates the published connection details.
    pub async fn upsert_match_details(&self, details: &MatchDetails) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO matches_server_details
                (match_id, server_ip, port, sourcetvport, password, map, round_id,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW())
            ON CONFLICT (match_id, round_id)
            DO UPDATE SET server_ip = EXCLUDED.server_ip,
                          port = EXCLUDED.port,
                          sourcetvport = EXCLUDED.sourcetvport,
                          password = EXCLUDED.password,
                          map = EXCLUDED.map,
                          updated_at = NOW()
            "#,
        )
        .bind(details.match_id)
        .bind(&details.server_ip)
        .bind(details.port)
        .bind(details.sourcetv_port)
        .bind(&details.password)
        .bind(&details.map)
        .bind(details.round_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(())
    }

    /// Removes the published connection details once a server is torn down.
    /// Deleting an absent row is not an error.
    pub async fn delete_match_details(&self, match_id: i32, round_id: i32) -> Result<(), DbError> {
        sqlx::query("DELETE FROM matches_server_details WHERE match_id = $1 AND round_id = $2")
            .bind(match_id)
            .bind(round_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    /// Fans one notification out to every player on both rosters.
    pub async fn send_notifications_to_teams(
        &self,
        home_roster_id: i32,
        away_roster_id: i32,
        message: &str,
        link: &str,
    ) -> Result<(), DbError> {
        let mut recipients = self.fetch_team_user_ids(home_roster_id).await?;
        recipients.extend(self.fetch_team_user_ids(away_roster_id).await?);

        for user_id in recipients {
            sqlx::query(
                r#"
                INSERT INTO user_notifications (user_id, read, message, link, created_at, updated_at)
                VALUES ($1, FALSE, $2, $3, NOW(), NOW())
                "#,
            )
            .bind(user_id)
            .bind(message)
            .bind(link)
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        }
        Ok(())
    }

    async fn fetch_team_user_ids(&self, roster_id: i32) -> Result<Vec<i32>, DbError> {
        sqlx::query_scalar("SELECT user_id FROM league_roster_players WHERE roster_id = $1")
            .bind(roster_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Query)
    }
}
