//! Airdrop points ledger
//!
//! Every award is keyed by `(user_id, action, reference_id)`, so replaying
//! the same event (webhook retry, re-run of a workflow step) never pays twice.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::models::{LeaderboardEntry, PointsAction, PointsEntry};

pub const SUBSCRIPTION_CREATED_POINTS: i64 = 100;
pub const BOT_PUBLISHED_POINTS: i64 = 250;
pub const POINTS_PER_USD: i64 = 10;
pub const TRADE_EXECUTED_POINTS: i64 = 5;

pub const DEFAULT_LEADERBOARD_SIZE: i64 = 20;
pub const MAX_LEADERBOARD_SIZE: i64 = 100;

/// Points for a paid invoice, rounded down
pub fn invoice_points(amount_usd: Decimal) -> i64 {
    if amount_usd <= Decimal::ZERO {
        return 0;
    }
    (amount_usd * Decimal::from(POINTS_PER_USD))
        .floor()
        .to_i64()
        .unwrap_or(0)
}

/// Record an award; returns false when it was already granted
pub async fn award_points<'e, E>(
    executor: E,
    user_id: Uuid,
    action: PointsAction,
    reference_id: &str,
    points: i64,
) -> Result<bool, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO points_ledger (id, user_id, action, points, reference_id)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (user_id, action, reference_id) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(action.as_str())
    .bind(points)
    .bind(reference_id)
    .execute(executor)
    .await?;

    let awarded = result.rows_affected() == 1;
    if awarded {
        tracing::info!(
            user_id = %user_id,
            action = action.as_str(),
            points,
            reference_id,
            "points_awarded"
        );
    }
    Ok(awarded)
}

pub async fn balance(pool: &PgPool, user_id: Uuid) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COALESCE(SUM(points), 0)::BIGINT FROM points_ledger WHERE user_id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await
}

pub async fn history(
    pool: &PgPool,
    user_id: Uuid,
    limit: i64,
    offset: i64,
) -> Result<Vec<PointsEntry>, sqlx::Error> {
    sqlx::query_as::<_, PointsEntry>(
        r#"
        SELECT * FROM points_ledger
        WHERE user_id = $1
        ORDER BY created_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
}

pub async fn leaderboard(pool: &PgPool, limit: i64) -> Result<Vec<LeaderboardEntry>, sqlx::Error> {
    sqlx::query_as::<_, LeaderboardEntry>(
        r#"
        SELECT p.user_id, u.display_name, SUM(p.points)::BIGINT AS points
        FROM points_ledger p
        JOIN users u ON u.id = p.user_id
        GROUP BY p.user_id, u.display_name
        ORDER BY points DESC, p.user_id
        LIMIT $1
        "#,
    )
    .bind(limit.clamp(1, MAX_LEADERBOARD_SIZE))
    .fetch_all(pool)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoice_points_round_down() {
        assert_eq!(invoice_points("49.99".parse().unwrap()), 499);
        assert_eq!(invoice_points(Decimal::from(20)), 200);
        assert_eq!(invoice_points("0.05".parse().unwrap()), 0);
        assert_eq!(invoice_points(Decimal::from(-5)), 0);
    }
}
