// =============================================================================
// Persistence — embedded relational store (spec §6)
// =============================================================================
//
// One SQLite database behind an r2d2 connection pool (grounded on the
// pack's cooprefr-bettersys vault_db.rs, generalized from a single
// `Arc<Mutex<Connection>>` to a pool since the Trader Manager drives many
// concurrent Engines). Tables: strategies, traders, decisions,
// trader_positions, orders, equity_snapshots, trades, settings.
// Append-only tables (decisions, trades, equity_snapshots) are indexed by
// (trader_id, timestamp).
//
// Every public method runs its blocking rusqlite call inside
// `spawn_blocking` so a slow disk never stalls the tokio runtime an Engine's
// cycle loop shares with everything else.
// =============================================================================

use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::position::{Position, PositionState};
use crate::strategy_config::{Strategy, StrategyConfig};
use crate::types::{ExchangeKind, Side, TraderStatus};

/// A persisted Trader row (spec §3 Trader).
///
/// `api_key`/`api_secret` are per-trader exchange credentials (spec §3
/// "per-trader credentials + model override"); callers that expose a
/// `TraderRecord` over the API must redact them, the same way `Trader`
/// (trader.rs) skips them during serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderRecord {
    pub id: uuid::Uuid,
    pub name: String,
    pub strategy_id: uuid::Uuid,
    pub exchange_kind: ExchangeKind,
    pub status: TraderStatus,
    pub initial_balance: f64,
    pub model_override: Option<String>,
    pub api_key: String,
    pub api_secret: String,
}

/// One row of the append-only `decisions` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub trader_id: uuid::Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub cycle_index: u64,
    pub symbol: String,
    pub action: String,
    pub confidence: u8,
    pub reasoning: String,
}

/// One row of the append-only `trades` table (spec §3 TradeEvent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trader_id: uuid::Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub symbol: String,
    pub action: String,
    pub side: String,
    pub quantity: f64,
    pub price: f64,
    pub fee: f64,
    pub realized_pnl: f64,
    pub leverage: f64,
    pub cycle_index: u64,
    pub liquidation: bool,
    pub note: String,
}

/// One row of the append-only `equity_snapshots` table (spec §3 EquityPoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityRecord {
    pub trader_id: uuid::Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub equity: f64,
    pub available: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub drawdown_pct: f64,
    pub cycle_index: u64,
}

/// The durable store behind the whole Trader Manager.
#[derive(Clone)]
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
}

impl Store {
    /// Open (or create) the database at `db_path` and ensure the schema
    /// exists. WAL mode matches the teacher's single-writer-many-reader
    /// access pattern (one Engine task per trader, many API readers).
    pub fn open(db_path: &str) -> Result<Self> {
        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .context("failed to build sqlite connection pool")?;

        {
            let conn = pool.get().context("failed to acquire connection for schema init")?;
            conn.pragma_update(None, "journal_mode", "WAL").ok();
            conn.pragma_update(None, "synchronous", "NORMAL").ok();
            init_schema(&conn)?;
        }

        Ok(Self { pool })
    }

    // -------------------------------------------------------------------------
    // Strategies
    // -------------------------------------------------------------------------

    #[instrument(skip(self, strategy))]
    pub async fn save_strategy(&self, strategy: &Strategy) -> Result<()> {
        let pool = self.pool.clone();
        let strategy = strategy.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let config_json = serde_json::to_string(&strategy.config)?;
            conn.execute(
                "INSERT INTO strategies (id, name, active, config_json)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    active = excluded.active,
                    config_json = excluded.config_json",
                params![strategy.id.to_string(), strategy.name, strategy.active, config_json],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    pub async fn get_strategy(&self, id: uuid::Uuid) -> Result<Option<Strategy>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let mut stmt = conn.prepare_cached(
                "SELECT id, name, active, config_json FROM strategies WHERE id = ?1",
            )?;
            let mut rows = stmt.query(params![id.to_string()])?;
            if let Some(row) = rows.next()? {
                Ok(Some(row_to_strategy(row)?))
            } else {
                Ok(None)
            }
        })
        .await?
    }

    pub async fn list_strategies(&self) -> Result<Vec<Strategy>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let mut stmt =
                conn.prepare_cached("SELECT id, name, active, config_json FROM strategies")?;
            let rows = stmt.query_map([], |row| {
                let id: String = row.get(0)?;
                let name: String = row.get(1)?;
                let active: bool = row.get(2)?;
                let config_json: String = row.get(3)?;
                Ok((id, name, active, config_json))
            })?;
            let mut out = Vec::new();
            for r in rows.flatten() {
                let (id, name, active, config_json) = r;
                let config: StrategyConfig = serde_json::from_str(&config_json)?;
                out.push(Strategy {
                    id: id.parse()?,
                    name,
                    active,
                    config,
                });
            }
            Ok::<_, anyhow::Error>(out)
        })
        .await?
    }

    // -------------------------------------------------------------------------
    // Traders
    // -------------------------------------------------------------------------

    pub async fn save_trader(&self, trader: &TraderRecord) -> Result<()> {
        let pool = self.pool.clone();
        let trader = trader.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            conn.execute(
                "INSERT INTO traders (id, name, strategy_id, exchange_kind, status, initial_balance, model_override, api_key, api_secret)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    strategy_id = excluded.strategy_id,
                    exchange_kind = excluded.exchange_kind,
                    status = excluded.status,
                    initial_balance = excluded.initial_balance,
                    model_override = excluded.model_override,
                    api_key = excluded.api_key,
                    api_secret = excluded.api_secret",
                params![
                    trader.id.to_string(),
                    trader.name,
                    trader.strategy_id.to_string(),
                    serde_json::to_string(&trader.exchange_kind)?,
                    serde_json::to_string(&trader.status)?,
                    trader.initial_balance,
                    trader.model_override,
                    trader.api_key,
                    trader.api_secret,
                ],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    pub async fn list_traders(&self) -> Result<Vec<TraderRecord>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let mut stmt = conn.prepare_cached(
                "SELECT id, name, strategy_id, exchange_kind, status, initial_balance, model_override, api_key, api_secret FROM traders",
            )?;
            let rows = stmt.query_map([], |row| {
                let id: String = row.get(0)?;
                let name: String = row.get(1)?;
                let strategy_id: String = row.get(2)?;
                let exchange_kind: String = row.get(3)?;
                let status: String = row.get(4)?;
                let initial_balance: f64 = row.get(5)?;
                let model_override: Option<String> = row.get(6)?;
                let api_key: String = row.get(7)?;
                let api_secret: String = row.get(8)?;
                Ok((id, name, strategy_id, exchange_kind, status, initial_balance, model_override, api_key, api_secret))
            })?;
            let mut out = Vec::new();
            for r in rows.flatten() {
                let (id, name, strategy_id, exchange_kind, status, initial_balance, model_override, api_key, api_secret) = r;
                out.push(TraderRecord {
                    id: id.parse()?,
                    name,
                    strategy_id: strategy_id.parse()?,
                    exchange_kind: serde_json::from_str(&exchange_kind)?,
                    status: serde_json::from_str(&status)?,
                    initial_balance,
                    model_override,
                    api_key,
                    api_secret,
                });
            }
            Ok::<_, anyhow::Error>(out)
        })
        .await?
    }

    pub async fn get_trader(&self, id: uuid::Uuid) -> Result<Option<TraderRecord>> {
        Ok(self.list_traders().await?.into_iter().find(|t| t.id == id))
    }

    // -------------------------------------------------------------------------
    // Append-only journals
    // -------------------------------------------------------------------------

    pub async fn append_decision(&self, rec: DecisionRecord) -> Result<()> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            conn.execute(
                "INSERT INTO decisions (trader_id, ts, cycle_index, symbol, action, confidence, reasoning)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    rec.trader_id.to_string(),
                    rec.timestamp.timestamp_millis(),
                    rec.cycle_index as i64,
                    rec.symbol,
                    rec.action,
                    rec.confidence as i64,
                    rec.reasoning,
                ],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    pub async fn append_trade(&self, rec: TradeRecord) -> Result<()> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            conn.execute(
                "INSERT INTO trades (trader_id, ts, symbol, action, side, quantity, price, fee, realized_pnl, leverage, cycle_index, liquidation, note)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    rec.trader_id.to_string(),
                    rec.timestamp.timestamp_millis(),
                    rec.symbol,
                    rec.action,
                    rec.side,
                    rec.quantity,
                    rec.price,
                    rec.fee,
                    rec.realized_pnl,
                    rec.leverage,
                    rec.cycle_index as i64,
                    rec.liquidation,
                    rec.note,
                ],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    pub async fn append_equity_snapshot(&self, rec: EquityRecord) -> Result<()> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            conn.execute(
                "INSERT INTO equity_snapshots (trader_id, ts, equity, available, pnl, pnl_pct, drawdown_pct, cycle_index)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    rec.trader_id.to_string(),
                    rec.timestamp.timestamp_millis(),
                    rec.equity,
                    rec.available,
                    rec.pnl,
                    rec.pnl_pct,
                    rec.drawdown_pct,
                    rec.cycle_index as i64,
                ],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    pub async fn recent_decisions(&self, trader_id: uuid::Uuid, limit: usize) -> Result<Vec<DecisionRecord>> {
        let pool = self.pool.clone();
        let limit = limit.clamp(1, 1000) as i64;
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let mut stmt = conn.prepare_cached(
                "SELECT ts, cycle_index, symbol, action, confidence, reasoning
                 FROM decisions WHERE trader_id = ?1 ORDER BY ts DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![trader_id.to_string(), limit], |row| {
                Ok(DecisionRecord {
                    trader_id,
                    timestamp: chrono::DateTime::from_timestamp_millis(row.get(0)?).unwrap_or_default(),
                    cycle_index: row.get::<_, i64>(1)? as u64,
                    symbol: row.get(2)?,
                    action: row.get(3)?,
                    confidence: row.get::<_, i64>(4)? as u8,
                    reasoning: row.get(5)?,
                })
            })?;
            Ok::<_, anyhow::Error>(rows.flatten().collect())
        })
        .await?
    }

    pub async fn recent_trades(&self, trader_id: uuid::Uuid, limit: usize) -> Result<Vec<TradeRecord>> {
        let pool = self.pool.clone();
        let limit = limit.clamp(1, 1000) as i64;
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let mut stmt = conn.prepare_cached(
                "SELECT trader_id, ts, symbol, action, side, quantity, price, fee, realized_pnl, leverage, cycle_index, liquidation, note
                 FROM trades WHERE trader_id = ?1 ORDER BY ts DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![trader_id.to_string(), limit], |row| {
                Ok(TradeRecord {
                    trader_id,
                    timestamp: chrono::DateTime::from_timestamp_millis(row.get(1)?).unwrap_or_default(),
                    symbol: row.get(2)?,
                    action: row.get(3)?,
                    side: row.get(4)?,
                    quantity: row.get(5)?,
                    price: row.get(6)?,
                    fee: row.get(7)?,
                    realized_pnl: row.get(8)?,
                    leverage: row.get(9)?,
                    cycle_index: row.get::<_, i64>(10)? as u64,
                    liquidation: row.get(11)?,
                    note: row.get(12)?,
                })
            })?;
            Ok::<_, anyhow::Error>(rows.flatten().collect())
        })
        .await?
    }

    pub async fn recent_equity(&self, trader_id: uuid::Uuid, limit: usize) -> Result<Vec<EquityRecord>> {
        let pool = self.pool.clone();
        let limit = limit.clamp(1, 20_000) as i64;
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let mut stmt = conn.prepare_cached(
                "SELECT ts, equity, available, pnl, pnl_pct, drawdown_pct, cycle_index
                 FROM equity_snapshots WHERE trader_id = ?1 ORDER BY ts ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![trader_id.to_string(), limit], |row| {
                Ok(EquityRecord {
                    trader_id,
                    timestamp: chrono::DateTime::from_timestamp_millis(row.get(0)?).unwrap_or_default(),
                    equity: row.get(1)?,
                    available: row.get(2)?,
                    pnl: row.get(3)?,
                    pnl_pct: row.get(4)?,
                    drawdown_pct: row.get(5)?,
                    cycle_index: row.get::<_, i64>(6)? as u64,
                })
            })?;
            Ok::<_, anyhow::Error>(rows.flatten().collect())
        })
        .await?
    }

    // -------------------------------------------------------------------------
    // Positions (spec §3 Position, §6 trader_positions table)
    // -------------------------------------------------------------------------

    /// Insert-or-replace a position row. Called by the Engine after opening a
    /// position and again after closing one, so `trader_positions` always
    /// reflects the in-memory `PositionManager`'s view (spec §8 testable
    /// property 1: every stored open position has `quantity > 0`).
    pub async fn upsert_position(&self, pos: &Position) -> Result<()> {
        let pool = self.pool.clone();
        let pos = pos.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            conn.execute(
                "INSERT INTO trader_positions
                    (id, trader_id, symbol, side, entry_price, quantity, leverage, margin, liquidation_price, accumulated_fee, open_time, close_time, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(id) DO UPDATE SET
                    quantity = excluded.quantity,
                    accumulated_fee = excluded.accumulated_fee,
                    close_time = excluded.close_time,
                    state = excluded.state",
                params![
                    pos.id.to_string(),
                    pos.trader_id.to_string(),
                    pos.symbol,
                    pos.side.to_string(),
                    pos.entry_price,
                    pos.quantity,
                    pos.leverage,
                    pos.margin,
                    pos.liquidation_price,
                    pos.accumulated_fee,
                    pos.open_time.timestamp_millis(),
                    pos.close_time.map(|t| t.timestamp_millis()),
                    if pos.state == PositionState::Open { "open" } else { "closed" },
                ],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    pub async fn list_open_positions(&self, trader_id: uuid::Uuid) -> Result<Vec<Position>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let mut stmt = conn.prepare_cached(
                "SELECT id, symbol, side, entry_price, quantity, leverage, margin, liquidation_price, accumulated_fee, open_time, close_time
                 FROM trader_positions WHERE trader_id = ?1 AND state = 'open'",
            )?;
            let rows = stmt.query_map(params![trader_id.to_string()], |row| row_to_position(row, trader_id))?;
            Ok::<_, anyhow::Error>(rows.flatten().collect())
        })
        .await?
    }

    // -------------------------------------------------------------------------
    // Settings (KV)
    // -------------------------------------------------------------------------

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let pool = self.pool.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            let mut stmt = conn.prepare_cached("SELECT value FROM settings WHERE key = ?1")?;
            let mut rows = stmt.query(params![key])?;
            if let Some(row) = rows.next()? {
                Ok(Some(row.get(0)?))
            } else {
                Ok(None)
            }
        })
        .await?
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let pool = self.pool.clone();
        let (key, value) = (key.to_string(), value.to_string());
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }
}

fn row_to_strategy(row: &rusqlite::Row) -> rusqlite::Result<Strategy> {
    let id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let active: bool = row.get(2)?;
    let config_json: String = row.get(3)?;
    let config: StrategyConfig = serde_json::from_str(&config_json)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    Ok(Strategy {
        id: id.parse().map_err(|_| rusqlite::Error::InvalidQuery)?,
        name,
        active,
        config,
    })
}

fn row_to_position(row: &rusqlite::Row, trader_id: uuid::Uuid) -> rusqlite::Result<Position> {
    let id: String = row.get(0)?;
    let symbol: String = row.get(1)?;
    let side_str: String = row.get(2)?;
    let side = match side_str.as_str() {
        "long" => Side::Long,
        "short" => Side::Short,
        _ => return Err(rusqlite::Error::InvalidQuery),
    };
    let open_time_ms: i64 = row.get(9)?;
    let close_time_ms: Option<i64> = row.get(10)?;
    Ok(Position {
        id: id.parse().map_err(|_| rusqlite::Error::InvalidQuery)?,
        trader_id,
        symbol,
        side,
        entry_price: row.get(3)?,
        quantity: row.get(4)?,
        leverage: row.get(5)?,
        margin: row.get(6)?,
        liquidation_price: row.get(7)?,
        accumulated_fee: row.get(8)?,
        open_time: chrono::DateTime::from_timestamp_millis(open_time_ms).unwrap_or_default(),
        close_time: close_time_ms.and_then(chrono::DateTime::from_timestamp_millis),
        state: PositionState::Open,
        peak_raw_pnl_pct: 0.0,
        trailing_stop_armed: false,
    })
}

fn init_schema(conn: &rusqlite::Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS strategies (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            active INTEGER NOT NULL,
            config_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS traders (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            strategy_id TEXT NOT NULL,
            exchange_kind TEXT NOT NULL,
            status TEXT NOT NULL,
            initial_balance REAL NOT NULL,
            model_override TEXT,
            api_key TEXT NOT NULL DEFAULT '',
            api_secret TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS decisions (
            trader_id TEXT NOT NULL,
            ts INTEGER NOT NULL,
            cycle_index INTEGER NOT NULL,
            symbol TEXT NOT NULL,
            action TEXT NOT NULL,
            confidence INTEGER NOT NULL,
            reasoning TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_decisions_trader_ts ON decisions(trader_id, ts);

        CREATE TABLE IF NOT EXISTS trader_positions (
            id TEXT PRIMARY KEY,
            trader_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL,
            entry_price REAL NOT NULL,
            quantity REAL NOT NULL,
            leverage REAL NOT NULL,
            margin REAL NOT NULL,
            liquidation_price REAL NOT NULL,
            accumulated_fee REAL NOT NULL,
            open_time INTEGER NOT NULL,
            close_time INTEGER,
            state TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_trader_positions_trader ON trader_positions(trader_id);

        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            trader_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL,
            order_type TEXT NOT NULL,
            quantity REAL NOT NULL,
            price REAL,
            status TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS equity_snapshots (
            trader_id TEXT NOT NULL,
            ts INTEGER NOT NULL,
            equity REAL NOT NULL,
            available REAL NOT NULL,
            pnl REAL NOT NULL,
            pnl_pct REAL NOT NULL,
            drawdown_pct REAL NOT NULL,
            cycle_index INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_equity_trader_ts ON equity_snapshots(trader_id, ts);

        CREATE TABLE IF NOT EXISTS trades (
            trader_id TEXT NOT NULL,
            ts INTEGER NOT NULL,
            symbol TEXT NOT NULL,
            action TEXT NOT NULL,
            side TEXT NOT NULL,
            quantity REAL NOT NULL,
            price REAL NOT NULL,
            fee REAL NOT NULL,
            realized_pnl REAL NOT NULL,
            leverage REAL NOT NULL,
            cycle_index INTEGER NOT NULL,
            liquidation INTEGER NOT NULL,
            note TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_trades_trader_ts ON trades(trader_id, ts);

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy_config::StrategyConfig;

    fn temp_store() -> Store {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        // Leak the tempdir so the file survives for the duration of the test;
        // the OS cleans /tmp eventually and this is test-only.
        std::mem::forget(dir);
        Store::open(path.to_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn save_and_load_strategy_roundtrips() {
        let store = temp_store();
        let strategy = Strategy::new("momentum", StrategyConfig::default());
        store.save_strategy(&strategy).await.unwrap();

        let loaded = store.get_strategy(strategy.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "momentum");
        assert_eq!(loaded.config.trading_interval_minutes, strategy.config.trading_interval_minutes);
    }

    #[tokio::test]
    async fn settings_roundtrip() {
        let store = temp_store();
        store.set_setting("admin_token", "abc123").await.unwrap();
        let val = store.get_setting("admin_token").await.unwrap();
        assert_eq!(val.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn append_only_tables_are_queryable_by_trader_and_time() {
        let store = temp_store();
        let trader_id = uuid::Uuid::new_v4();

        for i in 0..3 {
            store
                .append_trade(TradeRecord {
                    trader_id,
                    timestamp: chrono::Utc::now(),
                    symbol: "BTCUSDT".to_string(),
                    action: "close_long".to_string(),
                    side: "long".to_string(),
                    quantity: 0.1,
                    price: 50000.0 + i as f64,
                    fee: 0.5,
                    realized_pnl: 10.0,
                    leverage: 10.0,
                    cycle_index: i,
                    liquidation: false,
                    note: String::new(),
                })
                .await
                .unwrap();
        }

        let trades = store.recent_trades(trader_id, 10).await.unwrap();
        assert_eq!(trades.len(), 3);
    }

    #[tokio::test]
    async fn save_and_load_trader_roundtrips_credentials() {
        let store = temp_store();
        let rec = TraderRecord {
            id: uuid::Uuid::new_v4(),
            name: "paper-momentum".to_string(),
            strategy_id: uuid::Uuid::new_v4(),
            exchange_kind: ExchangeKind::Testnet,
            status: TraderStatus::Stopped,
            initial_balance: 1000.0,
            model_override: None,
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
        };
        store.save_trader(&rec).await.unwrap();

        let loaded = store.get_trader(rec.id).await.unwrap().unwrap();
        assert_eq!(loaded.api_key, "key");
        assert_eq!(loaded.api_secret, "secret");
    }

    #[tokio::test]
    async fn open_position_round_trips_and_disappears_once_closed() {
        let store = temp_store();
        let trader_id = uuid::Uuid::new_v4();
        let mut pos = Position::open(trader_id, "BTCUSDT", Side::Long, 50000.0, 0.2, 10.0, 1000.0, 45000.0);

        store.upsert_position(&pos).await.unwrap();
        let open = store.list_open_positions(trader_id).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].symbol, "BTCUSDT");
        assert!((open[0].entry_price - 50000.0).abs() < 1e-9);

        pos.close();
        store.upsert_position(&pos).await.unwrap();
        let open = store.list_open_positions(trader_id).await.unwrap();
        assert!(open.is_empty(), "closed position must not be returned as open");
    }
}
