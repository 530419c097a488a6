// Budget accounting: how much of a team's cap is still uncommitted.
//
// The aggregate here must run inside the same transaction as the write
// it gates, so a concurrent bid on another auction cannot change the
// pending total between the check and the commit.

use rusqlite::{params, Connection};

use crate::auction::model::Team;
use crate::error::{ServiceError, ServiceResult};

/// Sum of the team's winning-bid amounts across all other open
/// (ongoing or paused) auctions: the money the team would owe if every
/// auction it is currently winning settled at once, other than the one
/// being bid on now.
pub fn pending_commitment(
    conn: &Connection,
    team_id: &str,
    excluding_auction: &str,
) -> ServiceResult<i64> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(b.amount), 0)
           FROM bids b
           JOIN auctions a ON a.id = b.auction_id
          WHERE b.team_id = ?1
            AND b.is_winning = 1
            AND a.status IN ('ongoing', 'paused')
            AND a.id <> ?2",
        params![team_id, excluding_auction],
        |row| row.get(0),
    )?;
    Ok(total)
}

/// Currency the team can still commit toward `auction_id`:
/// cap minus settled spend minus pending commitments elsewhere.
///
/// Fails with `InvalidState` while the team's cap is unconfigured.
pub fn available_budget(
    conn: &Connection,
    team: &Team,
    auction_id: &str,
) -> ServiceResult<i64> {
    let cap = team
        .budget_cap
        .ok_or_else(|| ServiceError::InvalidState("team budget not configured".into()))?;
    let pending = pending_commitment(conn, &team.id, auction_id)?;
    Ok(cap - team.budget_spent - pending)
}

/// Is a bid of `amount` affordable, given the team's existing winning
/// bid of `previous_amount` on this same auction? Only the delta over
/// the already-pledged amount consumes budget; raising one's own
/// winning bid must not double-count.
pub fn is_affordable(amount: i64, previous_amount: i64, available: i64) -> bool {
    amount - previous_amount <= available
}
