// Broadcast payloads delivered to auction channel subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auction::model::{Auction, AuctionStatus};

/// A state change (or point-in-time snapshot) on an auction channel.
///
/// `Snapshot` is sent once to each newly-subscribed observer so late
/// joiners start consistent; the remaining variants stream live after
/// the transaction that produced them has committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuctionEvent {
    Snapshot {
        auction_id: String,
        status: AuctionStatus,
        current_bid: Option<i64>,
        current_bidder_id: Option<String>,
        total_revenue: i64,
        timestamp: DateTime<Utc>,
    },
    AuctionStarted {
        auction_id: String,
        status: AuctionStatus,
        timestamp: DateTime<Utc>,
    },
    AuctionPaused {
        auction_id: String,
        status: AuctionStatus,
        timestamp: DateTime<Utc>,
    },
    BidPlaced {
        auction_id: String,
        current_bid: i64,
        team_id: String,
        timestamp: DateTime<Utc>,
    },
    AuctionEnded {
        auction_id: String,
        status: AuctionStatus,
        winner_team_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    AuctionCancelled {
        auction_id: String,
        status: AuctionStatus,
        timestamp: DateTime<Utc>,
    },
}

impl AuctionEvent {
    /// Point-in-time snapshot of an auction's denormalized state.
    pub fn snapshot_of(auction: &Auction) -> Self {
        AuctionEvent::Snapshot {
            auction_id: auction.id.clone(),
            status: auction.status,
            current_bid: auction.current_bid,
            current_bidder_id: auction.current_bidder_id.clone(),
            total_revenue: auction.total_revenue,
            timestamp: Utc::now(),
        }
    }

    pub fn auction_id(&self) -> &str {
        match self {
            AuctionEvent::Snapshot { auction_id, .. }
            | AuctionEvent::AuctionStarted { auction_id, .. }
            | AuctionEvent::AuctionPaused { auction_id, .. }
            | AuctionEvent::BidPlaced { auction_id, .. }
            | AuctionEvent::AuctionEnded { auction_id, .. }
            | AuctionEvent::AuctionCancelled { auction_id, .. } => auction_id,
        }
    }
}
