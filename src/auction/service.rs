// The auction transaction engine: lifecycle state machine, atomic bid
// placement, and settlement.
//
// Every operation that reads auction or ledger rows before writing them
// runs as one transaction on the shared store, taken with immediate
// (write) behavior so the read values cannot change before the commit.
// Holding the connection guard for the whole unit of work serializes
// conflicting bids: two bids on the same auction can never both observe
// the same current high bid and both succeed. Broadcasts fire only
// after the commit, so observers never see a change that could still
// roll back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, TransactionBehavior};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::auction::budget;
use crate::auction::model::{Auction, AuctionStatus, Bid, PlayerStatus};
use crate::auth::{Identity, TeamAuthorizer};
use crate::db::{self, Database};
use crate::error::{ServiceError, ServiceResult};
use crate::events::AuctionEvent;
use crate::hub::{auction_channel, BroadcastHub, ObserverId};

/// How many auctions `list_auctions` returns at most.
const LIST_LIMIT: usize = 100;

/// Process-local sequence for id generation; disambiguates ids minted in
/// the same millisecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique row id with a sortable timestamp prefix.
fn next_id(prefix: &str) -> String {
    let seq = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{}_{seq:06}", Utc::now().format("%Y%m%d%H%M%S%3f"))
}

/// Timestamps are stored as RFC 3339 text, same shape as the store's own
/// `strftime` defaults so the columns sort uniformly.
fn db_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// The engine's public face: lifecycle, bidding, settlement, reads, and
/// subscriptions, over one authoritative store.
pub struct AuctionService {
    db: Arc<Database>,
    hub: Arc<BroadcastHub>,
    authorizer: Arc<dyn TeamAuthorizer>,
    /// Increment applied to auctions created without an explicit one.
    default_min_increment: i64,
}

impl AuctionService {
    pub fn new(
        db: Arc<Database>,
        hub: Arc<BroadcastHub>,
        authorizer: Arc<dyn TeamAuthorizer>,
        default_min_increment: i64,
    ) -> Self {
        AuctionService {
            db,
            hub,
            authorizer,
            default_min_increment,
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Create a scheduled auction for `player_id`. The player must exist
    /// and not have been sold already.
    pub fn create(
        &self,
        name: &str,
        description: Option<&str>,
        player_id: &str,
        min_increment: Option<i64>,
    ) -> ServiceResult<Auction> {
        let increment = min_increment.unwrap_or(self.default_min_increment);
        if increment <= 0 {
            return Err(ServiceError::InvalidArgument(
                "minimum increment must be positive".into(),
            ));
        }

        let mut conn = self.db.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let player = db::fetch_player(&tx, player_id)?
            .ok_or_else(|| ServiceError::not_found("player"))?;
        if player.status != PlayerStatus::Available {
            return Err(ServiceError::InvalidState(format!(
                "player is {}, not available for auction",
                player.status.as_str()
            )));
        }

        let id = next_id("auc");
        tx.execute(
            "INSERT INTO auctions (id, name, description, player_id, min_increment)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, name, description, player_id, increment],
        )?;
        let auction = db::fetch_auction(&tx, &id)?
            .ok_or_else(|| ServiceError::internal(anyhow::anyhow!("created auction vanished")))?;
        tx.commit()?;

        info!("auction {} created for player {}", auction.id, player_id);
        Ok(auction)
    }

    /// Open (or resume) bidding. Scheduled and paused auctions become
    /// ongoing; calling `start` on an already-ongoing auction is a no-op
    /// that returns the current state without emitting another event.
    pub fn start(&self, auction_id: &str) -> ServiceResult<Auction> {
        let updated = {
            let mut conn = self.db.conn();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let auction = db::fetch_auction(&tx, auction_id)?
                .ok_or_else(|| ServiceError::not_found("auction"))?;
            match auction.status {
                AuctionStatus::Ongoing => return Ok(auction),
                AuctionStatus::Completed => {
                    return Err(ServiceError::InvalidState(
                        "auction already completed".into(),
                    ))
                }
                AuctionStatus::Scheduled | AuctionStatus::Paused => {}
            }

            // started_at marks the first open, not a resume.
            let started_at = auction.started_at.unwrap_or_else(Utc::now);
            tx.execute(
                "UPDATE auctions SET status = 'ongoing', started_at = ?2 WHERE id = ?1",
                params![auction_id, db_timestamp(started_at)],
            )?;
            let updated = db::fetch_auction(&tx, auction_id)?
                .ok_or_else(|| ServiceError::internal(anyhow::anyhow!("auction vanished")))?;
            tx.commit()?;
            updated
        };

        info!("auction {auction_id} started");
        self.hub.publish(
            &auction_channel(auction_id),
            &AuctionEvent::AuctionStarted {
                auction_id: auction_id.to_string(),
                status: updated.status,
                timestamp: Utc::now(),
            },
        );
        Ok(updated)
    }

    /// Suspend bidding. Idempotent for any non-completed auction.
    pub fn pause(&self, auction_id: &str) -> ServiceResult<Auction> {
        let updated = {
            let mut conn = self.db.conn();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let auction = db::fetch_auction(&tx, auction_id)?
                .ok_or_else(|| ServiceError::not_found("auction"))?;
            if auction.status == AuctionStatus::Completed {
                return Err(ServiceError::InvalidState(
                    "auction already completed".into(),
                ));
            }

            tx.execute(
                "UPDATE auctions SET status = 'paused' WHERE id = ?1",
                params![auction_id],
            )?;
            let updated = db::fetch_auction(&tx, auction_id)?
                .ok_or_else(|| ServiceError::internal(anyhow::anyhow!("auction vanished")))?;
            tx.commit()?;
            updated
        };

        info!("auction {auction_id} paused");
        self.hub.publish(
            &auction_channel(auction_id),
            &AuctionEvent::AuctionPaused {
                auction_id: auction_id.to_string(),
                status: updated.status,
                timestamp: Utc::now(),
            },
        );
        Ok(updated)
    }

    /// Complete the auction and settle it. Without `force` there must be
    /// a winning bid to sell; with `force` the auction completes with no
    /// sale and the player is marked unsold (unless an earlier auction
    /// already sold them).
    ///
    /// Settlement and the status transition commit atomically: the
    /// player transfer, the team's permanent budget debit, and the
    /// revenue bump are all-or-nothing with the `completed` write.
    pub fn end(&self, auction_id: &str, force: bool) -> ServiceResult<Auction> {
        let updated = {
            let mut conn = self.db.conn();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let auction = db::fetch_auction(&tx, auction_id)?
                .ok_or_else(|| ServiceError::not_found("auction"))?;
            if auction.status == AuctionStatus::Completed {
                return Err(ServiceError::InvalidState(
                    "auction already completed".into(),
                ));
            }

            let winning = db::fetch_winning_bid(&tx, auction_id)?;
            if winning.is_none() && !force {
                return Err(ServiceError::InvalidState("no winning bid to sell".into()));
            }

            match &winning {
                Some(bid) => settle(&tx, &auction, bid)?,
                None => {
                    // Forced end with no sale: the player leaves the block
                    // unsold, unless already owned from a previous sale.
                    tx.execute(
                        "UPDATE players SET status = 'unsold'
                          WHERE id = ?1 AND status = 'available'",
                        params![auction.player_id],
                    )?;
                }
            }

            tx.execute(
                "UPDATE auctions SET status = 'completed', ended_at = ?2 WHERE id = ?1",
                params![auction_id, db_timestamp(Utc::now())],
            )?;
            let updated = db::fetch_auction(&tx, auction_id)?
                .ok_or_else(|| ServiceError::internal(anyhow::anyhow!("auction vanished")))?;
            tx.commit()?;
            updated
        };

        info!(
            "auction {auction_id} ended (winner: {})",
            updated.current_bidder_id.as_deref().unwrap_or("none")
        );
        self.hub.publish(
            &auction_channel(auction_id),
            &AuctionEvent::AuctionEnded {
                auction_id: auction_id.to_string(),
                status: updated.status,
                winner_team_id: updated.current_bidder_id.clone(),
                timestamp: Utc::now(),
            },
        );
        Ok(updated)
    }

    /// Cancel pending bidding: release the winning flag on any current
    /// winning bid, clear the denormalized snapshot, and park the
    /// auction in `paused`. A cancelled auction can be restarted.
    pub fn cancel(&self, auction_id: &str) -> ServiceResult<Auction> {
        let updated = {
            let mut conn = self.db.conn();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let auction = db::fetch_auction(&tx, auction_id)?
                .ok_or_else(|| ServiceError::not_found("auction"))?;
            if auction.status == AuctionStatus::Completed {
                return Err(ServiceError::InvalidState(
                    "auction already completed".into(),
                ));
            }

            tx.execute(
                "UPDATE bids SET is_winning = 0 WHERE auction_id = ?1 AND is_winning = 1",
                params![auction_id],
            )?;
            tx.execute(
                "UPDATE auctions
                    SET status = 'paused', current_bid = NULL, current_bidder_id = NULL
                  WHERE id = ?1",
                params![auction_id],
            )?;
            let updated = db::fetch_auction(&tx, auction_id)?
                .ok_or_else(|| ServiceError::internal(anyhow::anyhow!("auction vanished")))?;
            tx.commit()?;
            updated
        };

        info!("auction {auction_id} cancelled; pending winning bid released");
        self.hub.publish(
            &auction_channel(auction_id),
            &AuctionEvent::AuctionCancelled {
                auction_id: auction_id.to_string(),
                status: updated.status,
                timestamp: Utc::now(),
            },
        );
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Bidding
    // ------------------------------------------------------------------

    /// Place a bid on behalf of `team_id`.
    ///
    /// Preconditions are checked in a fixed order, each reporting its own
    /// failure kind: positive amount, auction exists, auction ongoing,
    /// amount clears current bid plus increment, team exists, identity
    /// authorized, budget cap configured, and the bid affordable against
    /// the cap net of settled spend and commitments to other open
    /// auctions. `min_increment` overrides the auction's configured
    /// increment for this call when given.
    ///
    /// On success the previous winning bid (if any) is superseded, the
    /// new bid is inserted as winning, and the auction snapshot is
    /// updated, all in the same unit of work; the `bid_placed` event
    /// goes out after the commit.
    pub fn place_bid(
        &self,
        auction_id: &str,
        team_id: &str,
        amount: i64,
        min_increment: Option<i64>,
        identity: &Identity,
    ) -> ServiceResult<Bid> {
        if amount <= 0 {
            return Err(ServiceError::InvalidArgument(
                "bid amount must be positive".into(),
            ));
        }
        if min_increment.is_some_and(|inc| inc <= 0) {
            return Err(ServiceError::InvalidArgument(
                "minimum increment must be positive".into(),
            ));
        }

        let bid = {
            let mut conn = self.db.conn();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let auction = db::fetch_auction(&tx, auction_id)?
                .ok_or_else(|| ServiceError::not_found("auction"))?;
            if auction.status != AuctionStatus::Ongoing {
                return Err(ServiceError::InvalidState(
                    "auction is not open for bidding".into(),
                ));
            }

            let increment = min_increment.unwrap_or(auction.min_increment);
            let current = auction.current_bid.unwrap_or(0);
            let minimum = current + increment;
            if amount < minimum {
                return Err(ServiceError::BidTooLow { minimum });
            }

            let team = db::fetch_team(&tx, team_id)?
                .ok_or_else(|| ServiceError::not_found("team"))?;
            if !self.authorizer.can_act_for(identity, &team) {
                warn!(
                    "identity {} denied bidding for team {team_id} on auction {auction_id}",
                    identity.id
                );
                return Err(ServiceError::Forbidden(
                    "not permitted to bid for this team".into(),
                ));
            }

            // Affordability: only the delta over the team's own standing
            // bid on this auction consumes new budget.
            let available = budget::available_budget(&tx, &team, auction_id)?;
            let previous = if auction.current_bidder_id.as_deref() == Some(team_id) {
                current
            } else {
                0
            };
            if !budget::is_affordable(amount, previous, available) {
                return Err(ServiceError::InsufficientBudget {
                    required: amount - previous,
                    available,
                });
            }

            tx.execute(
                "UPDATE bids SET is_winning = 0 WHERE auction_id = ?1 AND is_winning = 1",
                params![auction_id],
            )?;

            let bid_id = next_id("bid");
            let inserted = tx.execute(
                "INSERT INTO bids (id, auction_id, player_id, team_id, amount, is_winning)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                params![bid_id, auction_id, auction.player_id, team_id, amount],
            );
            if let Err(err) = inserted {
                // The one-winning-bid index is the optimistic backstop
                // behind the lock discipline.
                if is_unique_violation(&err) {
                    return Err(ServiceError::Conflict(
                        "a concurrent bid already holds the winning flag".into(),
                    ));
                }
                return Err(err.into());
            }

            tx.execute(
                "UPDATE auctions SET current_bid = ?2, current_bidder_id = ?3 WHERE id = ?1",
                params![auction_id, amount, team_id],
            )?;

            let bid = db::fetch_bid(&tx, &bid_id)?
                .ok_or_else(|| ServiceError::internal(anyhow::anyhow!("inserted bid vanished")))?;
            tx.commit()?;
            bid
        };

        info!("bid {} on auction {auction_id}: team {team_id} at {amount}", bid.id);
        self.hub.publish(
            &auction_channel(auction_id),
            &AuctionEvent::BidPlaced {
                auction_id: auction_id.to_string(),
                current_bid: bid.amount,
                team_id: bid.team_id.clone(),
                timestamp: Utc::now(),
            },
        );
        Ok(bid)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Current snapshot of one auction.
    pub fn get_auction(&self, auction_id: &str) -> ServiceResult<Auction> {
        db::fetch_auction(&self.db.conn(), auction_id)?
            .ok_or_else(|| ServiceError::not_found("auction"))
    }

    /// Recent auctions, newest first.
    pub fn list_auctions(&self) -> ServiceResult<Vec<Auction>> {
        db::fetch_recent_auctions(&self.db.conn(), LIST_LIMIT)
    }

    /// The full bid ledger for an auction, in placement order.
    pub fn list_bids(&self, auction_id: &str) -> ServiceResult<Vec<Bid>> {
        let conn = self.db.conn();
        db::fetch_auction(&conn, auction_id)?
            .ok_or_else(|| ServiceError::not_found("auction"))?;
        db::fetch_bids(&conn, auction_id)
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Register an observer on the auction's update channel. The current
    /// snapshot is delivered first so late joiners start consistent,
    /// then committed events stream live.
    pub fn subscribe(
        &self,
        auction_id: &str,
    ) -> ServiceResult<(ObserverId, mpsc::UnboundedReceiver<AuctionEvent>)> {
        let channel = auction_channel(auction_id);
        let (observer, rx) = self.hub.subscribe(&channel);
        let auction = match self.get_auction(auction_id) {
            Ok(auction) => auction,
            Err(err) => {
                self.hub.unsubscribe(&channel, observer);
                return Err(err);
            }
        };
        self.hub
            .send_to(&channel, observer, AuctionEvent::snapshot_of(&auction));
        Ok((observer, rx))
    }

    /// Drop an observer from the auction's update channel.
    pub fn unsubscribe(&self, auction_id: &str, observer: ObserverId) {
        self.hub.unsubscribe(&auction_channel(auction_id), observer);
    }

    /// Observers currently subscribed to an auction's channel.
    #[cfg(test)]
    pub(crate) fn observer_count(&self, auction_id: &str) -> usize {
        self.hub.observer_count(&auction_channel(auction_id))
    }
}

/// Settlement: transfer the player to the winning team, permanently
/// debit the team's budget, and credit the auction's revenue. Runs
/// inside the `end` transaction.
fn settle(tx: &Connection, auction: &Auction, winning: &Bid) -> ServiceResult<()> {
    let changed = tx.execute(
        "UPDATE players SET team_id = ?1, sold_price = ?2, status = 'sold' WHERE id = ?3",
        params![winning.team_id, winning.amount, auction.player_id],
    )?;
    if changed == 0 {
        return Err(ServiceError::internal(anyhow::anyhow!(
            "auction {} references missing player {}",
            auction.id,
            auction.player_id
        )));
    }
    let changed = tx.execute(
        "UPDATE teams SET budget_spent = budget_spent + ?1 WHERE id = ?2",
        params![winning.amount, winning.team_id],
    )?;
    if changed == 0 {
        return Err(ServiceError::internal(anyhow::anyhow!(
            "winning bid {} references missing team {}",
            winning.id,
            winning.team_id
        )));
    }
    tx.execute(
        "UPDATE auctions SET total_revenue = total_revenue + ?1 WHERE id = ?2",
        params![winning.amount, auction.id],
    )?;
    Ok(())
}
