//! Durable position store.
//!
//! SQLite holds every position the bot has ever opened:
//! - Open positions (at most one per symbol, enforced by a partial unique index)
//! - Closed positions as append-only history
//!
//! Decimal columns are stored as TEXT so values round-trip exactly.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use tracing::warn;

use crate::error::{ErrorCategory, LedgerError};
use crate::models::{CloseReason, Position, PositionUpdate};

/// Database connection pool for the position store.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Values needed to insert a new open position.
#[derive(Debug, Clone)]
pub struct NewPosition<'a> {
    pub symbol: &'a str,
    pub volume: Decimal,
    pub entry_price: Decimal,
    pub change_pct: Decimal,
    pub profit_dollars: Decimal,
    pub entry_time: DateTime<Utc>,
    pub take_profit_pct: Decimal,
    pub stop_loss_pct: Decimal,
    pub signal_tag: &'a str,
}

/// Values written when a position closes.
#[derive(Debug, Clone)]
pub struct CloseRecord {
    pub close_price: Decimal,
    pub close_time: DateTime<Utc>,
    pub reason: CloseReason,
    pub change_pct: Decimal,
    pub profit_dollars: Decimal,
}

/// Raw position row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct PositionRow {
    id: i64,
    symbol: String,
    volume: String,
    entry_price: String,
    current_price: String,
    change_pct: String,
    profit_dollars: String,
    entry_time: DateTime<Utc>,
    take_profit_pct: String,
    stop_loss_pct: String,
    trailing_active: bool,
    high_water_price: Option<String>,
    trail_floor_price: Option<String>,
    trail_ceiling_price: Option<String>,
    signal_tag: String,
    closed: bool,
    close_price: Option<String>,
    close_time: Option<DateTime<Utc>>,
    close_reason: Option<String>,
}

impl TryFrom<PositionRow> for Position {
    type Error = LedgerError;

    fn try_from(row: PositionRow) -> Result<Self, Self::Error> {
        let symbol = row.symbol;
        let corrupt = |reason: String| LedgerError::Corrupt {
            symbol: symbol.clone(),
            reason,
        };
        let dec = |column: &str, value: &str| {
            Decimal::from_str(value).map_err(|e| corrupt(format!("{}: {}", column, e)))
        };
        let opt_dec = |column: &str, value: Option<&str>| value.map(|v| dec(column, v)).transpose();

        let close_reason = row
            .close_reason
            .as_deref()
            .map(CloseReason::from_str)
            .transpose()
            .map_err(|e| corrupt(e))?;

        Ok(Position {
            id: row.id,
            volume: dec("volume", &row.volume)?,
            entry_price: dec("entry_price", &row.entry_price)?,
            current_price: dec("current_price", &row.current_price)?,
            change_pct: dec("change_pct", &row.change_pct)?,
            profit_dollars: dec("profit_dollars", &row.profit_dollars)?,
            entry_time: row.entry_time,
            take_profit_pct: dec("take_profit_pct", &row.take_profit_pct)?,
            stop_loss_pct: dec("stop_loss_pct", &row.stop_loss_pct)?,
            trailing_active: row.trailing_active,
            high_water_price: opt_dec("high_water_price", row.high_water_price.as_deref())?,
            trail_floor_price: opt_dec("trail_floor_price", row.trail_floor_price.as_deref())?,
            trail_ceiling_price: opt_dec("trail_ceiling_price", row.trail_ceiling_price.as_deref())?,
            signal_tag: row.signal_tag,
            closed: row.closed,
            close_price: opt_dec("close_price", row.close_price.as_deref())?,
            close_time: row.close_time,
            close_reason,
            symbol,
        })
    }
}

/// Decode rows, skipping any that no longer parse.
fn into_positions(rows: Vec<PositionRow>) -> Vec<Position> {
    rows.into_iter()
        .filter_map(|row| match Position::try_from(row) {
            Ok(position) => Some(position),
            Err(e) => {
                warn!(category = %ErrorCategory::Data, error = %e, "Skipping undecodable position row");
                None
            }
        })
        .collect()
}

impl Database {
    /// Connect to (and create if missing) the database at `database_url`.
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL: {}", database_url))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database. A single connection that never expires,
    /// since each new in-memory connection would see an empty database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Create tables and indexes.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                volume TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                current_price TEXT NOT NULL,
                change_pct TEXT NOT NULL DEFAULT '0',
                profit_dollars TEXT NOT NULL DEFAULT '0',
                entry_time TEXT NOT NULL,
                take_profit_pct TEXT NOT NULL,
                stop_loss_pct TEXT NOT NULL,
                trailing_active INTEGER NOT NULL DEFAULT 0,
                high_water_price TEXT,
                trail_floor_price TEXT,
                trail_ceiling_price TEXT,
                signal_tag TEXT NOT NULL DEFAULT '',
                closed INTEGER NOT NULL DEFAULT 0,
                close_price TEXT,
                close_time TEXT,
                close_reason TEXT,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create positions table")?;

        // One open position per symbol
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_open_symbol ON positions(symbol) WHERE closed = 0",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_closed ON positions(closed, close_time)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Open Positions ====================

    /// Insert a new open position.
    pub async fn insert_position(&self, new: &NewPosition<'_>) -> Result<Position, LedgerError> {
        let result = sqlx::query_as::<_, PositionRow>(
            r#"
            INSERT INTO positions (
                symbol, volume, entry_price, current_price, change_pct, profit_dollars,
                entry_time, take_profit_pct, stop_loss_pct, signal_tag
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(new.symbol)
        .bind(new.volume.to_string())
        .bind(new.entry_price.to_string())
        .bind(new.entry_price.to_string())
        .bind(new.change_pct.to_string())
        .bind(new.profit_dollars.to_string())
        .bind(new.entry_time)
        .bind(new.take_profit_pct.to_string())
        .bind(new.stop_loss_pct.to_string())
        .bind(new.signal_tag)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Position::try_from(row),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(LedgerError::AlreadyOpen(new.symbol.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Get the open position for a symbol.
    pub async fn fetch_open(&self, symbol: &str) -> Result<Option<Position>, LedgerError> {
        sqlx::query_as::<_, PositionRow>("SELECT * FROM positions WHERE symbol = ? AND closed = 0")
            .bind(symbol)
            .fetch_optional(&self.pool)
            .await?
            .map(Position::try_from)
            .transpose()
    }

    /// Get all open positions.
    pub async fn fetch_all_open(&self) -> Result<Vec<Position>, LedgerError> {
        let rows = sqlx::query_as::<_, PositionRow>(
            "SELECT * FROM positions WHERE closed = 0 ORDER BY entry_time, id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(into_positions(rows))
    }

    /// Apply a partial update to the open position for `symbol`.
    ///
    /// Returns `false` when no open position matched.
    pub async fn apply_update(
        &self,
        symbol: &str,
        update: &PositionUpdate,
    ) -> Result<bool, LedgerError> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE positions SET updated_at = datetime('now')");

        let decimals = [
            ("current_price", update.current_price),
            ("change_pct", update.change_pct),
            ("profit_dollars", update.profit_dollars),
            ("take_profit_pct", update.take_profit_pct),
            ("stop_loss_pct", update.stop_loss_pct),
            ("high_water_price", update.high_water_price),
            ("trail_floor_price", update.trail_floor_price),
            ("trail_ceiling_price", update.trail_ceiling_price),
        ];
        for (column, value) in decimals {
            if let Some(value) = value {
                qb.push(format!(", {} = ", column));
                qb.push_bind(value.to_string());
            }
        }
        if let Some(active) = update.trailing_active {
            qb.push(", trailing_active = ");
            qb.push_bind(active);
        }

        qb.push(" WHERE symbol = ");
        qb.push_bind(symbol);
        qb.push(" AND closed = 0");

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Close the open position for `symbol`, returning the closed row.
    pub async fn mark_closed(
        &self,
        symbol: &str,
        record: &CloseRecord,
    ) -> Result<Option<Position>, LedgerError> {
        sqlx::query_as::<_, PositionRow>(
            r#"
            UPDATE positions SET
                closed = 1,
                close_price = ?,
                close_time = ?,
                close_reason = ?,
                current_price = ?,
                change_pct = ?,
                profit_dollars = ?,
                updated_at = datetime('now')
            WHERE symbol = ? AND closed = 0
            RETURNING *
            "#,
        )
        .bind(record.close_price.to_string())
        .bind(record.close_time)
        .bind(record.reason.as_str())
        .bind(record.close_price.to_string())
        .bind(record.change_pct.to_string())
        .bind(record.profit_dollars.to_string())
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?
        .map(Position::try_from)
        .transpose()
    }

    // ==================== History ====================

    /// Most recently closed positions, newest first.
    pub async fn fetch_closed(&self, limit: i64) -> Result<Vec<Position>, LedgerError> {
        let rows = sqlx::query_as::<_, PositionRow>(
            "SELECT * FROM positions WHERE closed = 1 ORDER BY close_time DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(into_positions(rows))
    }

    /// Sum of realized profit of positions closed at or after `since`.
    ///
    /// The time filter runs in SQL; amounts are summed as decimals.
    pub async fn realized_profit_since(&self, since: DateTime<Utc>) -> Result<Decimal, LedgerError> {
        let rows = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT symbol, profit_dollars FROM positions
            WHERE closed = 1
              AND close_time IS NOT NULL
              AND julianday(close_time) >= julianday(?)
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut total = Decimal::ZERO;
        for (symbol, profit) in rows {
            match Decimal::from_str(&profit) {
                Ok(value) => total += value,
                Err(e) => warn!(
                    symbol = %symbol,
                    category = %ErrorCategory::Data,
                    error = %e,
                    "Skipping undecodable realized profit"
                ),
            }
        }
        Ok(total)
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn new_position(symbol: &str) -> NewPosition<'_> {
        NewPosition {
            symbol,
            volume: dec!(0.5),
            entry_price: dec!(200),
            change_pct: dec!(-0.15),
            profit_dollars: dec!(-0.15),
            entry_time: Utc::now(),
            take_profit_pct: dec!(2),
            stop_loss_pct: dec!(10),
            signal_tag: "test",
        }
    }

    fn close_record(reason: CloseReason, profit: Decimal) -> CloseRecord {
        CloseRecord {
            close_price: dec!(210),
            close_time: Utc::now(),
            reason,
            change_pct: dec!(4.8),
            profit_dollars: profit,
        }
    }

    #[tokio::test]
    async fn test_insert_and_fetch_round_trips_decimals() {
        let db = Database::in_memory().await.unwrap();
        let inserted = db.insert_position(&new_position("ETHUSDT")).await.unwrap();
        assert_eq!(inserted.symbol, "ETHUSDT");
        assert_eq!(inserted.volume, dec!(0.5));
        assert_eq!(inserted.current_price, dec!(200));
        assert!(!inserted.closed);

        let fetched = db.fetch_open("ETHUSDT").await.unwrap().unwrap();
        assert_eq!(fetched, inserted);
        assert!(db.fetch_open("BTCUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_open_row_for_symbol_is_rejected() {
        let db = Database::in_memory().await.unwrap();
        db.insert_position(&new_position("ETHUSDT")).await.unwrap();
        let err = db.insert_position(&new_position("ETHUSDT")).await.unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyOpen(s) if s == "ETHUSDT"));

        // Closing frees the symbol again.
        db.mark_closed("ETHUSDT", &close_record(CloseReason::Manual, dec!(5)))
            .await
            .unwrap()
            .unwrap();
        db.insert_position(&new_position("ETHUSDT")).await.unwrap();
    }

    #[tokio::test]
    async fn test_partial_update_touches_only_given_fields() {
        let db = Database::in_memory().await.unwrap();
        db.insert_position(&new_position("ETHUSDT")).await.unwrap();

        let update = PositionUpdate {
            trailing_active: Some(true),
            trail_floor_price: Some(dec!(199.5)),
            ..PositionUpdate::default()
        };
        assert!(db.apply_update("ETHUSDT", &update).await.unwrap());
        assert!(!db.apply_update("BTCUSDT", &update).await.unwrap());

        let p = db.fetch_open("ETHUSDT").await.unwrap().unwrap();
        assert!(p.trailing_active);
        assert_eq!(p.trail_floor_price, Some(dec!(199.5)));
        assert_eq!(p.high_water_price, None);
        assert_eq!(p.take_profit_pct, dec!(2));
    }

    #[tokio::test]
    async fn test_closed_rows_feed_history_and_session_profit() {
        let db = Database::in_memory().await.unwrap();
        let start = Utc::now() - Duration::seconds(1);

        db.insert_position(&new_position("ETHUSDT")).await.unwrap();
        db.insert_position(&new_position("BTCUSDT")).await.unwrap();
        let closed = db
            .mark_closed("ETHUSDT", &close_record(CloseReason::TakeProfit, dec!(4.5)))
            .await
            .unwrap()
            .unwrap();
        assert!(closed.closed);
        assert_eq!(closed.close_reason, Some(CloseReason::TakeProfit));
        assert_eq!(closed.current_price, dec!(210));

        db.mark_closed("BTCUSDT", &close_record(CloseReason::BaseStopLoss, dec!(-2)))
            .await
            .unwrap()
            .unwrap();
        assert!(db
            .mark_closed("BTCUSDT", &close_record(CloseReason::Manual, dec!(0)))
            .await
            .unwrap()
            .is_none());

        assert_eq!(db.fetch_all_open().await.unwrap().len(), 0);
        assert_eq!(db.fetch_closed(10).await.unwrap().len(), 2);
        assert_eq!(db.realized_profit_since(start).await.unwrap(), dec!(2.5));
        assert_eq!(
            db.realized_profit_since(Utc::now() + Duration::hours(1))
                .await
                .unwrap(),
            Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn test_undecodable_open_row_is_skipped() {
        let db = Database::in_memory().await.unwrap();
        db.insert_position(&new_position("ETHUSDT")).await.unwrap();
        db.insert_position(&new_position("BTCUSDT")).await.unwrap();
        sqlx::query("UPDATE positions SET volume = 'garbage' WHERE symbol = 'BTCUSDT'")
            .execute(db.pool())
            .await
            .unwrap();

        let open = db.fetch_all_open().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].symbol, "ETHUSDT");

        // Direct lookups still report the bad row.
        let err = db.fetch_open("BTCUSDT").await.unwrap_err();
        assert!(matches!(err, LedgerError::Corrupt { symbol, .. } if symbol == "BTCUSDT"));
    }

    #[tokio::test]
    async fn test_session_profit_ignores_rows_closed_before_start() {
        let db = Database::in_memory().await.unwrap();

        db.insert_position(&new_position("ETHUSDT")).await.unwrap();
        let mut old = close_record(CloseReason::TakeProfit, dec!(100));
        old.close_time = Utc::now() - Duration::days(3);
        db.mark_closed("ETHUSDT", &old).await.unwrap().unwrap();
        // Old history that no longer decodes must not matter to a new session.
        sqlx::query("UPDATE positions SET entry_price = 'garbage' WHERE symbol = 'ETHUSDT'")
            .execute(db.pool())
            .await
            .unwrap();

        let start = Utc::now() - Duration::seconds(1);
        db.insert_position(&new_position("BTCUSDT")).await.unwrap();
        db.mark_closed("BTCUSDT", &close_record(CloseReason::BaseStopLoss, dec!(-1.25)))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(db.realized_profit_since(start).await.unwrap(), dec!(-1.25));
        assert_eq!(
            db.realized_profit_since(Utc::now() - Duration::days(7))
                .await
                .unwrap(),
            dec!(98.75)
        );
        // History listing drops the undecodable row.
        assert_eq!(db.fetch_closed(10).await.unwrap().len(), 1);
    }
}
