// SQLite persistence layer: the authoritative store for auctions, the
// bid ledger, teams, and players.
//
// One connection behind a mutex. Every read-then-write unit of work in
// the engine holds the guard for its whole transaction, which is what
// serializes conflicting bids (see `auction::service`).

use std::sync::{Mutex, MutexGuard};

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::auction::model::{Auction, AuctionStatus, Bid, Player, PlayerStatus, Team};
use crate::error::{ServiceError, ServiceResult};

/// SQLite-backed store for auctions, bids, teams, and players.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at `path` and ensure all tables
    /// exist. Pass `":memory:"` for an ephemeral in-memory database (useful
    /// for tests).
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS teams (
                id           TEXT PRIMARY KEY,
                name         TEXT NOT NULL UNIQUE,
                manager_id   TEXT NOT NULL,
                budget_cap   INTEGER,
                budget_spent INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS players (
                id         TEXT PRIMARY KEY,
                name       TEXT NOT NULL,
                status     TEXT NOT NULL DEFAULT 'available'
                           CHECK (status IN ('available', 'sold', 'unsold')),
                team_id    TEXT REFERENCES teams(id),
                base_price INTEGER NOT NULL DEFAULT 0,
                sold_price INTEGER
            );

            CREATE TABLE IF NOT EXISTS auctions (
                id                TEXT PRIMARY KEY,
                name              TEXT NOT NULL,
                description       TEXT,
                status            TEXT NOT NULL DEFAULT 'scheduled'
                                  CHECK (status IN ('scheduled', 'ongoing', 'paused', 'completed')),
                player_id         TEXT NOT NULL REFERENCES players(id),
                current_bid       INTEGER,
                current_bidder_id TEXT REFERENCES teams(id),
                min_increment     INTEGER NOT NULL,
                total_revenue     INTEGER NOT NULL DEFAULT 0,
                created_at        TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                started_at        TEXT,
                ended_at          TEXT
            );

            CREATE TABLE IF NOT EXISTS bids (
                id         TEXT PRIMARY KEY,
                auction_id TEXT NOT NULL REFERENCES auctions(id),
                player_id  TEXT NOT NULL REFERENCES players(id),
                team_id    TEXT NOT NULL REFERENCES teams(id),
                amount     INTEGER NOT NULL,
                is_winning INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE INDEX IF NOT EXISTS idx_auctions_status ON auctions(status);
            CREATE INDEX IF NOT EXISTS idx_bids_auction ON bids(auction_id);
            CREATE INDEX IF NOT EXISTS idx_bids_team ON bids(team_id);
            ",
        )
        .context("failed to create database schema")?;

        // Store-level rendering of the ledger invariant: at most one bid
        // per auction may be flagged winning at any instant.
        conn.execute_batch(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_bids_one_winning
               ON bids(auction_id) WHERE is_winning = 1;",
        )
        .context("failed to create winning-bid index")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the database connection.
    ///
    /// Panics if the mutex is poisoned (another thread panicked while
    /// holding the lock). This should never happen in normal operation.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    // ------------------------------------------------------------------
    // Registry boundary: teams and players are supplied by external
    // registries; these are the minimal writes that contract requires.
    // ------------------------------------------------------------------

    /// Insert a team or update its record if the id already exists.
    pub fn upsert_team(
        &self,
        id: &str,
        name: &str,
        manager_id: &str,
        budget_cap: Option<i64>,
    ) -> ServiceResult<Team> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO teams (id, name, manager_id, budget_cap)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                name       = excluded.name,
                manager_id = excluded.manager_id,
                budget_cap = excluded.budget_cap",
            params![id, name, manager_id, budget_cap],
        )?;
        fetch_team(&conn, id)?.ok_or_else(|| ServiceError::not_found("team"))
    }

    /// Configure (or reconfigure) a team's total budget cap.
    pub fn set_budget_cap(&self, team_id: &str, cap: i64) -> ServiceResult<()> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE teams SET budget_cap = ?2 WHERE id = ?1",
            params![team_id, cap],
        )?;
        if changed == 0 {
            return Err(ServiceError::not_found("team"));
        }
        Ok(())
    }

    /// Insert a player or update their record if the id already exists.
    /// Sale fields (`status`, `team_id`, `sold_price`) are owned by
    /// settlement and never touched here.
    pub fn upsert_player(&self, id: &str, name: &str, base_price: i64) -> ServiceResult<Player> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO players (id, name, base_price)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                name       = excluded.name,
                base_price = excluded.base_price",
            params![id, name, base_price],
        )?;
        fetch_player(&conn, id)?.ok_or_else(|| ServiceError::not_found("player"))
    }

    pub fn get_team(&self, id: &str) -> ServiceResult<Option<Team>> {
        fetch_team(&self.conn(), id)
    }

    pub fn get_player(&self, id: &str) -> ServiceResult<Option<Player>> {
        fetch_player(&self.conn(), id)
    }
}

// ---------------------------------------------------------------------------
// Row readers. These take `&Connection` so they work both on the bare
// connection and inside a `Transaction` (which derefs to one).
// ---------------------------------------------------------------------------

pub(crate) fn fetch_auction(conn: &Connection, id: &str) -> ServiceResult<Option<Auction>> {
    let raw = conn
        .query_row(
            "SELECT id, name, description, status, player_id, current_bid,
                    current_bidder_id, min_increment, total_revenue,
                    created_at, started_at, ended_at
               FROM auctions WHERE id = ?1",
            params![id],
            auction_columns,
        )
        .optional()?;
    raw.map(auction_from_raw).transpose()
}

/// Most recent auctions first, capped at `limit`.
pub(crate) fn fetch_recent_auctions(
    conn: &Connection,
    limit: usize,
) -> ServiceResult<Vec<Auction>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, description, status, player_id, current_bid,
                current_bidder_id, min_increment, total_revenue,
                created_at, started_at, ended_at
           FROM auctions ORDER BY created_at DESC, id DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit as i64], auction_columns)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(auction_from_raw).collect()
}

pub(crate) fn fetch_team(conn: &Connection, id: &str) -> ServiceResult<Option<Team>> {
    let team = conn
        .query_row(
            "SELECT id, name, manager_id, budget_cap, budget_spent
               FROM teams WHERE id = ?1",
            params![id],
            |row| {
                Ok(Team {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    manager_id: row.get(2)?,
                    budget_cap: row.get(3)?,
                    budget_spent: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(team)
}

pub(crate) fn fetch_player(conn: &Connection, id: &str) -> ServiceResult<Option<Player>> {
    let raw = conn
        .query_row(
            "SELECT id, name, status, team_id, base_price, sold_price
               FROM players WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                ))
            },
        )
        .optional()?;
    match raw {
        None => Ok(None),
        Some((id, name, status, team_id, base_price, sold_price)) => Ok(Some(Player {
            id,
            name,
            status: PlayerStatus::parse(&status)?,
            team_id,
            base_price,
            sold_price,
        })),
    }
}

/// The single winning bid for an auction, if any.
pub(crate) fn fetch_winning_bid(conn: &Connection, auction_id: &str) -> ServiceResult<Option<Bid>> {
    let bid = conn
        .query_row(
            "SELECT id, auction_id, player_id, team_id, amount, is_winning, created_at
               FROM bids WHERE auction_id = ?1 AND is_winning = 1",
            params![auction_id],
            bid_from_row,
        )
        .optional()?;
    Ok(bid)
}

pub(crate) fn fetch_bid(conn: &Connection, id: &str) -> ServiceResult<Option<Bid>> {
    let bid = conn
        .query_row(
            "SELECT id, auction_id, player_id, team_id, amount, is_winning, created_at
               FROM bids WHERE id = ?1",
            params![id],
            bid_from_row,
        )
        .optional()?;
    Ok(bid)
}

/// Full ledger for an auction in insertion order.
pub(crate) fn fetch_bids(conn: &Connection, auction_id: &str) -> ServiceResult<Vec<Bid>> {
    let mut stmt = conn.prepare(
        "SELECT id, auction_id, player_id, team_id, amount, is_winning, created_at
           FROM bids WHERE auction_id = ?1 ORDER BY created_at, id",
    )?;
    let bids = stmt
        .query_map(params![auction_id], bid_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(bids)
}

type RawAuction = (
    String,
    String,
    Option<String>,
    String,
    String,
    Option<i64>,
    Option<String>,
    i64,
    i64,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
);

fn auction_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawAuction> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

fn auction_from_raw(raw: RawAuction) -> ServiceResult<Auction> {
    let (
        id,
        name,
        description,
        status,
        player_id,
        current_bid,
        current_bidder_id,
        min_increment,
        total_revenue,
        created_at,
        started_at,
        ended_at,
    ) = raw;
    Ok(Auction {
        id,
        name,
        description,
        status: AuctionStatus::parse(&status)?,
        player_id,
        current_bid,
        current_bidder_id,
        min_increment,
        total_revenue,
        created_at,
        started_at,
        ended_at,
    })
}

fn bid_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bid> {
    Ok(Bid {
        id: row.get(0)?,
        auction_id: row.get(1)?,
        player_id: row.get(2)?,
        team_id: row.get(3)?,
        amount: row.get(4)?,
        is_winning: row.get(5)?,
        created_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper: create a fresh in-memory database for each test.
    fn test_db() -> Database {
        Database::open(":memory:").expect("in-memory database should open")
    }

    /// Helper: seed one team and one player, returning their ids.
    fn seed(db: &Database) -> (String, String) {
        db.upsert_team("team_1", "Vorticists", "mgr_1", Some(10_000))
            .unwrap();
        db.upsert_player("player_1", "A. Batter", 500).unwrap();
        ("team_1".into(), "player_1".into())
    }

    #[test]
    fn open_creates_tables() {
        let db = test_db();
        let conn = db.conn();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"teams".to_string()));
        assert!(tables.contains(&"players".to_string()));
        assert!(tables.contains(&"auctions".to_string()));
        assert!(tables.contains(&"bids".to_string()));
    }

    #[test]
    fn upsert_team_round_trip_and_no_duplicates() {
        let db = test_db();
        let team = db
            .upsert_team("team_1", "Vorticists", "mgr_1", Some(10_000))
            .unwrap();
        assert_eq!(team.budget_cap, Some(10_000));
        assert_eq!(team.budget_spent, 0);

        // Upsert same id -> updated, not duplicated.
        let team = db
            .upsert_team("team_1", "Vorticists FC", "mgr_2", Some(12_000))
            .unwrap();
        assert_eq!(team.name, "Vorticists FC");
        assert_eq!(team.manager_id, "mgr_2");

        let conn = db.conn();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM teams", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn team_budget_cap_is_optional_until_configured() {
        let db = test_db();
        let team = db
            .upsert_team("team_1", "Vorticists", "mgr_1", None)
            .unwrap();
        assert_eq!(team.budget_cap, None);

        db.set_budget_cap("team_1", 8_000).unwrap();
        let team = db.get_team("team_1").unwrap().unwrap();
        assert_eq!(team.budget_cap, Some(8_000));
    }

    #[test]
    fn set_budget_cap_unknown_team_is_not_found() {
        let db = test_db();
        let err = db.set_budget_cap("ghost", 1).unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn upsert_player_preserves_sale_fields() {
        let db = test_db();
        let (team_id, player_id) = seed(&db);

        // Simulate a settlement write.
        {
            let conn = db.conn();
            conn.execute(
                "UPDATE players SET status = 'sold', team_id = ?1, sold_price = 700 WHERE id = ?2",
                params![team_id, player_id],
            )
            .unwrap();
        }

        // Registry re-sync must not clobber the sale.
        let player = db.upsert_player(&player_id, "A. Batter Jr.", 550).unwrap();
        assert_eq!(player.name, "A. Batter Jr.");
        assert_eq!(player.status, PlayerStatus::Sold);
        assert_eq!(player.team_id, Some(team_id));
        assert_eq!(player.sold_price, Some(700));
    }

    #[test]
    fn at_most_one_winning_bid_per_auction() {
        let db = test_db();
        let (team_id, player_id) = seed(&db);
        let conn = db.conn();
        conn.execute(
            "INSERT INTO auctions (id, name, player_id, min_increment) VALUES ('a1', 'Lot 1', ?1, 100)",
            params![player_id],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO bids (id, auction_id, player_id, team_id, amount, is_winning)
             VALUES ('b1', 'a1', ?1, ?2, 500, 1)",
            params![player_id, team_id],
        )
        .unwrap();

        // Second winning row for the same auction violates the partial
        // unique index.
        let result = conn.execute(
            "INSERT INTO bids (id, auction_id, player_id, team_id, amount, is_winning)
             VALUES ('b2', 'a1', ?1, ?2, 600, 1)",
            params![player_id, team_id],
        );
        assert!(result.is_err());

        // A superseded (non-winning) row is fine.
        conn.execute(
            "INSERT INTO bids (id, auction_id, player_id, team_id, amount, is_winning)
             VALUES ('b3', 'a1', ?1, ?2, 400, 0)",
            params![player_id, team_id],
        )
        .unwrap();
    }

    #[test]
    fn bid_timestamps_auto_generated() {
        let db = test_db();
        let (team_id, player_id) = seed(&db);
        let conn = db.conn();
        conn.execute(
            "INSERT INTO auctions (id, name, player_id, min_increment) VALUES ('a1', 'Lot 1', ?1, 100)",
            params![player_id],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO bids (id, auction_id, player_id, team_id, amount, is_winning)
             VALUES ('b1', 'a1', ?1, ?2, 500, 1)",
            params![player_id, team_id],
        )
        .unwrap();

        let bid = fetch_bid(&conn, "b1").unwrap().unwrap();
        assert!(bid.created_at <= Utc::now());
        assert!(bid.is_winning);
    }

    #[test]
    fn fetch_winning_bid_none_when_no_winner() {
        let db = test_db();
        let (_, player_id) = seed(&db);
        let conn = db.conn();
        conn.execute(
            "INSERT INTO auctions (id, name, player_id, min_increment) VALUES ('a1', 'Lot 1', ?1, 100)",
            params![player_id],
        )
        .unwrap();
        assert!(fetch_winning_bid(&conn, "a1").unwrap().is_none());
    }

    #[test]
    fn foreign_keys_enforced() {
        let db = test_db();
        let conn = db.conn();
        let result = conn.execute(
            "INSERT INTO auctions (id, name, player_id, min_increment) VALUES ('a1', 'Lot 1', 'ghost', 100)",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn recent_auctions_newest_first() {
        let db = test_db();
        let (_, player_id) = seed(&db);
        let conn = db.conn();
        for i in 1..=3 {
            conn.execute(
                "INSERT INTO auctions (id, name, player_id, min_increment, created_at)
                 VALUES (?1, ?2, ?3, 100, ?4)",
                params![
                    format!("a{i}"),
                    format!("Lot {i}"),
                    player_id,
                    format!("2026-03-0{i}T00:00:00.000Z"),
                ],
            )
            .unwrap();
        }
        let auctions = fetch_recent_auctions(&conn, 2).unwrap();
        assert_eq!(auctions.len(), 2);
        assert_eq!(auctions[0].id, "a3");
        assert_eq!(auctions[1].id, "a2");
    }
}
