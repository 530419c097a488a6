// Domain types: auctions, the bid ledger, teams, players.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// Lifecycle status of an auction.
///
/// Transitions are one-way except `Ongoing ↔ Paused`; `Completed` is
/// terminal. Cancellation parks the auction back in `Paused` with its
/// pending winning bid released, so it can be restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuctionStatus {
    Scheduled,
    Ongoing,
    Paused,
    Completed,
}

impl AuctionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuctionStatus::Scheduled => "scheduled",
            AuctionStatus::Ongoing => "ongoing",
            AuctionStatus::Paused => "paused",
            AuctionStatus::Completed => "completed",
        }
    }

    /// Parse the status code stored in the auctions table. An unknown
    /// code means the row was written outside the engine.
    pub fn parse(code: &str) -> Result<Self, ServiceError> {
        match code {
            "scheduled" => Ok(AuctionStatus::Scheduled),
            "ongoing" => Ok(AuctionStatus::Ongoing),
            "paused" => Ok(AuctionStatus::Paused),
            "completed" => Ok(AuctionStatus::Completed),
            other => Err(ServiceError::internal(anyhow::anyhow!(
                "unknown auction status code in store: {other}"
            ))),
        }
    }
}

/// Sale status of a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerStatus {
    Available,
    Sold,
    Unsold,
}

impl PlayerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayerStatus::Available => "available",
            PlayerStatus::Sold => "sold",
            PlayerStatus::Unsold => "unsold",
        }
    }

    pub fn parse(code: &str) -> Result<Self, ServiceError> {
        match code {
            "available" => Ok(PlayerStatus::Available),
            "sold" => Ok(PlayerStatus::Sold),
            "unsold" => Ok(PlayerStatus::Unsold),
            other => Err(ServiceError::internal(anyhow::anyhow!(
                "unknown player status code in store: {other}"
            ))),
        }
    }
}

/// An auction for a single player.
///
/// `current_bid`/`current_bidder_id` mirror the ledger's single winning
/// bid for this auction. They are a read cache, never authoritative, and
/// are only ever written in the same transaction as the ledger row they
/// mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Auction {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub status: AuctionStatus,
    pub player_id: String,
    pub current_bid: Option<i64>,
    pub current_bidder_id: Option<String>,
    /// Minimum amount a new bid must clear the current bid by.
    pub min_increment: i64,
    /// Sum of winning amounts settled through this auction.
    pub total_revenue: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// One row of the bid ledger. Rows are immutable once created; a bid is
/// never edited, only superseded by flipping `is_winning` off and
/// inserting a new winning row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub id: String,
    pub auction_id: String,
    /// Copied from the auction at bid time.
    pub player_id: String,
    pub team_id: String,
    /// Monetary amount in the smallest currency unit.
    pub amount: i64,
    pub is_winning: bool,
    pub created_at: DateTime<Utc>,
}

/// A bidding team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub name: String,
    /// Identity that manages this team; the authorization collaborator
    /// compares against it.
    pub manager_id: String,
    /// Total currency the team may ever commit. `None` until configured;
    /// bidding is rejected while unset.
    pub budget_cap: Option<i64>,
    /// Spend already settled through completed auctions.
    pub budget_spent: i64,
}

/// A player that can be put on the block. Mutated only by settlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub id: String,
    pub name: String,
    pub status: PlayerStatus,
    pub team_id: Option<String>,
    pub base_price: i64,
    pub sold_price: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for status in [
            AuctionStatus::Scheduled,
            AuctionStatus::Ongoing,
            AuctionStatus::Paused,
            AuctionStatus::Completed,
        ] {
            assert_eq!(AuctionStatus::parse(status.as_str()).unwrap(), status);
        }
        for status in [
            PlayerStatus::Available,
            PlayerStatus::Sold,
            PlayerStatus::Unsold,
        ] {
            assert_eq!(PlayerStatus::parse(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_code_is_internal() {
        let err = AuctionStatus::parse("liquidated").unwrap_err();
        assert_eq!(err.kind(), "internal");
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&AuctionStatus::Ongoing).unwrap();
        assert_eq!(json, "\"ongoing\"");
        let json = serde_json::to_string(&PlayerStatus::Sold).unwrap();
        assert_eq!(json, "\"sold\"");
    }
}
