// State store for live trading
// SQLite-based persistence with JSON backup
//
// Holds one engine snapshot per symbol plus a trade audit trail, so a
// restarted trader resumes with the same capital, round state and position.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::engine::PersistedState;
use crate::ledger::TradeRecord;

pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
    json_backup_path: Option<PathBuf>,
}

impl StateStore {
    pub fn new<P: AsRef<Path>>(db_path: P, json_backup_path: Option<PathBuf>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = json_backup_path.as_ref().and_then(|p| p.parent()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            json_backup_path,
        };
        store.create_tables()?;
        info!("State store initialized: {}", db_path.display());

        Ok(store)
    }

    /// Store backed by an in-memory database, without JSON backup
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            json_backup_path: None,
        };
        store.create_tables()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("state store mutex poisoned"))
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS engine_state (
                symbol TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                martingale_level INTEGER NOT NULL,
                entry_time TEXT NOT NULL,
                exit_time TEXT NOT NULL,
                entry_price REAL NOT NULL,
                exit_price REAL NOT NULL,
                amount REAL NOT NULL,
                bet_amount TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                fees TEXT NOT NULL,
                exit_reason TEXT NOT NULL,
                outcome TEXT NOT NULL,
                record TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol)",
            [],
        )?;

        debug!("Database schema created/verified");
        Ok(())
    }

    pub fn save_state(&self, state: &PersistedState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR REPLACE INTO engine_state (symbol, state, updated_at)
                 VALUES (?1, ?2, CURRENT_TIMESTAMP)",
                params![state.symbol.as_str(), json],
            )?;
        }
        debug!(
            "State saved: {} level={} capital={}",
            state.symbol, state.round.martingale_level, state.capital.current_capital
        );

        self.export_json()
    }

    pub fn load_state(&self, symbol: &str) -> Result<Option<PersistedState>> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT state FROM engine_state WHERE symbol = ?1",
                params![symbol],
                |row| row.get(0),
            )
            .optional()?;

        json.map(|j| {
            serde_json::from_str(&j).with_context(|| format!("Corrupt state for {}", symbol))
        })
        .transpose()
    }

    pub fn load_all_states(&self) -> Result<Vec<PersistedState>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT symbol, state FROM engine_state ORDER BY symbol")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(symbol, json)| {
                serde_json::from_str(&json).with_context(|| format!("Corrupt state for {}", symbol))
            })
            .collect()
    }

    pub fn record_trade(&self, trade: &TradeRecord) -> Result<()> {
        let record = serde_json::to_string(trade)?;
        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO trades
                 (symbol, side, martingale_level, entry_time, exit_time, entry_price,
                  exit_price, amount, bet_amount, realized_pnl, fees, exit_reason,
                  outcome, record)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    trade.symbol.as_str(),
                    trade.side.as_str(),
                    trade.martingale_level as i64,
                    trade.entry_time.to_rfc3339(),
                    trade.exit_time.to_rfc3339(),
                    trade.entry_price,
                    trade.exit_price,
                    trade.amount,
                    trade.bet_amount.to_string(),
                    trade.realized_pnl.to_string(),
                    trade.fees.to_string(),
                    trade.exit_reason.as_str(),
                    trade.outcome.as_str(),
                    record,
                ],
            )?;
        }

        info!(
            "Trade recorded: {} {} level {} {} -> {} | pnl {} | {} | {}",
            trade.side.as_str().to_uppercase(),
            trade.symbol,
            trade.martingale_level + 1,
            trade.entry_price,
            trade.exit_price,
            trade.realized_pnl,
            trade.exit_reason,
            trade.outcome.as_str()
        );
        Ok(())
    }

    pub fn load_trades(&self, symbol: Option<&str>) -> Result<Vec<TradeRecord>> {
        let conn = self.lock()?;
        let records: Vec<String> = match symbol {
            Some(s) => {
                let mut stmt =
                    conn.prepare("SELECT record FROM trades WHERE symbol = ?1 ORDER BY id")?;
                let rows = stmt
                    .query_map(params![s], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare("SELECT record FROM trades ORDER BY id")?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };

        records
            .iter()
            .map(|r| serde_json::from_str(r).context("Corrupt trade record"))
            .collect()
    }

    pub fn export_json(&self) -> Result<()> {
        let Some(path) = &self.json_backup_path else {
            return Ok(());
        };
        let states = self.load_all_states()?;
        let trade_count: i64 = {
            let conn = self.lock()?;
            conn.query_row("SELECT COUNT(*) FROM trades", [], |row| row.get(0))?
        };

        let backup = serde_json::json!({
            "exported_at": Utc::now().to_rfc3339(),
            "engines": states,
            "trade_count": trade_count,
        });

        std::fs::write(path, serde_json::to_string_pretty(&backup)?)
            .with_context(|| format!("Failed to write backup: {}", path.display()))?;
        debug!("State exported to: {}", path.display());
        Ok(())
    }
}

/// Open `{state_dir}/trading_state.db` with a JSON backup next to it
pub fn create_state_store<P: AsRef<Path>>(state_dir: P) -> Result<StateStore> {
    let state_dir = state_dir.as_ref();
    std::fs::create_dir_all(state_dir)?;

    let db_path = state_dir.join("trading_state.db");
    let json_path = state_dir.join("trading_state.json");

    StateStore::new(db_path, Some(json_path))
}
