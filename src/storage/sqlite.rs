//! SQLite-backed store with connection pooling.
//!
//! Durable home of the deposit/withdraw state machines and the scanner
//! cursors. Uses r2d2 for concurrent access from the worker tasks; schema
//! migrations run at construction.

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use thiserror::Error;

use crate::types::{
    CallbackStatus, Deposit, DepositStatus, EoaStatus, ListenerStatus, Withdraw, WithdrawStatus,
    WithdrawTx, WithdrawTxStatus,
};

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("record not found: {0}")]
    NotFound(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Deposit fields produced by the L1 indexer.
#[derive(Debug, Clone)]
pub struct IndexedDeposit {
    pub btc_block_number: i64,
    pub btc_tx_index: i64,
    pub btc_tx_hash: String,
    pub btc_from: String,
    /// JSON array of every sender address on the tx.
    pub btc_froms: String,
    pub btc_to: String,
    pub btc_value: i64,
    pub btc_block_time: i64,
}

/// Deposit fields implied by a custody callback.
#[derive(Debug, Clone)]
pub struct NotifiedDeposit {
    pub btc_tx_hash: String,
    pub btc_from: String,
    pub btc_to: String,
    pub btc_value: i64,
}

/// Terminal commit of one dispatcher/reconciler pass over a deposit.
#[derive(Debug, Clone)]
pub struct DepositOutcome {
    pub status: DepositStatus,
    pub retry: u32,
    pub b2_tx_hash: Option<String>,
    pub aa_address: Option<String>,
    pub b2_tx_nonce: Option<u64>,
    pub eoa_hash: Option<String>,
    pub eoa_nonce: Option<u64>,
    pub eoa_status: EoaStatus,
}

/// Result of inserting a scanned withdraw log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawInsert {
    Created,
    /// (block, tx index, log index) already recorded; the log is skipped.
    Duplicate,
}

/// Pooled SQLite store.
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
}

impl Store {
    /// Open (creating if needed) the database at the given path and run
    /// migrations.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StoreError> {
        self.pool
            .get()
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    /// Liveness probe for the health endpoint and startup readiness.
    pub fn ping(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS deposits (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                btc_block_number INTEGER NOT NULL DEFAULT 0,
                btc_tx_index INTEGER NOT NULL DEFAULT 0,
                btc_tx_hash TEXT NOT NULL UNIQUE,
                btc_from TEXT NOT NULL,
                btc_froms TEXT NOT NULL DEFAULT '[]',
                btc_to TEXT NOT NULL,
                btc_value INTEGER NOT NULL,
                aa_address TEXT,
                b2_tx_hash TEXT,
                b2_tx_nonce INTEGER,
                b2_tx_status TEXT NOT NULL DEFAULT 'pending',
                b2_tx_retry INTEGER NOT NULL DEFAULT 0,
                b2_eoa_tx_hash TEXT,
                b2_eoa_tx_nonce INTEGER,
                b2_eoa_tx_status TEXT NOT NULL DEFAULT 'pending',
                listener_status TEXT NOT NULL DEFAULT 'pending',
                callback_status TEXT NOT NULL DEFAULT 'pending',
                btc_block_time INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_deposits_status ON deposits(b2_tx_status);
            CREATE INDEX IF NOT EXISTS idx_deposits_block ON deposits(btc_block_number);

            CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL UNIQUE,
                request_type INTEGER NOT NULL,
                request_detail TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS withdraws (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                btc_from TEXT NOT NULL,
                btc_to TEXT NOT NULL,
                btc_value INTEGER NOT NULL,
                b2_block_number INTEGER NOT NULL,
                b2_block_hash TEXT NOT NULL,
                b2_tx_hash TEXT NOT NULL,
                b2_tx_index INTEGER NOT NULL,
                b2_log_index INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(b2_block_number, b2_tx_index, b2_log_index)
            );

            CREATE INDEX IF NOT EXISTS idx_withdraws_status ON withdraws(status);
            CREATE INDEX IF NOT EXISTS idx_withdraws_b2_tx_hash ON withdraws(b2_tx_hash);

            CREATE TABLE IF NOT EXISTS withdraw_txs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                btc_tx_id TEXT NOT NULL UNIQUE,
                psbt TEXT NOT NULL,
                b2_tx_hashes TEXT NOT NULL,
                btc_tx_hash TEXT,
                status TEXT NOT NULL DEFAULT 'signature_pending',
                reason TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_withdraw_txs_status ON withdraw_txs(status);

            CREATE TABLE IF NOT EXISTS btc_index (
                id INTEGER PRIMARY KEY,
                btc_index_block INTEGER NOT NULL,
                btc_index_tx INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS withdraw_index (
                id INTEGER PRIMARY KEY,
                b2_index_block INTEGER NOT NULL,
                b2_index_tx INTEGER NOT NULL,
                b2_log_index INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Cursors
    // ------------------------------------------------------------------

    /// Load the L1 scan cursor, initialising it to the given position when
    /// the row does not exist yet.
    pub fn load_btc_cursor(&self, start_block: i64) -> Result<(i64, i64), StoreError> {
        let conn = self.conn()?;
        let existing = conn
            .query_row(
                "SELECT btc_index_block, btc_index_tx FROM btc_index WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            Some(cursor) => Ok(cursor),
            None => {
                conn.execute(
                    "INSERT INTO btc_index (id, btc_index_block, btc_index_tx, updated_at)
                     VALUES (1, ?1, 0, ?2)",
                    params![start_block, now()],
                )?;
                Ok((start_block, 0))
            }
        }
    }

    pub fn set_btc_cursor(&self, block: i64, tx_index: i64) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE btc_index SET btc_index_block = ?1, btc_index_tx = ?2, updated_at = ?3
             WHERE id = 1",
            params![block, tx_index, now()],
        )?;
        Ok(())
    }

    /// Load the L2 withdraw-event cursor, initialising it when absent.
    pub fn load_withdraw_cursor(&self, start_block: i64) -> Result<(i64, i64, i64), StoreError> {
        let conn = self.conn()?;
        let existing = conn
            .query_row(
                "SELECT b2_index_block, b2_index_tx, b2_log_index FROM withdraw_index WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match existing {
            Some(cursor) => Ok(cursor),
            None => {
                conn.execute(
                    "INSERT INTO withdraw_index (id, b2_index_block, b2_index_tx, b2_log_index, updated_at)
                     VALUES (1, ?1, 0, 0, ?2)",
                    params![start_block, now()],
                )?;
                Ok((start_block, 0, 0))
            }
        }
    }

    pub fn set_withdraw_cursor(
        &self,
        block: i64,
        tx_index: i64,
        log_index: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE withdraw_index
             SET b2_index_block = ?1, b2_index_tx = ?2, b2_log_index = ?3, updated_at = ?4
             WHERE id = 1",
            params![block, tx_index, log_index, now()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Deposits
    // ------------------------------------------------------------------

    /// Record a deposit observed by the indexer and advance the L1 cursor in
    /// the same transaction, so a crash never leaves the cursor ahead of the
    /// row. A hash collision means the notification ingestor created the row
    /// first; the indexer then backfills the block metadata and marks the
    /// listener side as seen.
    pub fn record_indexed_deposit(
        &self,
        deposit: &IndexedDeposit,
        cursor: (i64, i64),
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let ts = now();

        tx.execute(
            "INSERT INTO deposits (
                btc_block_number, btc_tx_index, btc_tx_hash, btc_from, btc_froms,
                btc_to, btc_value, b2_tx_status, listener_status, callback_status,
                btc_block_time, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
             ON CONFLICT(btc_tx_hash) DO UPDATE SET
                btc_block_number = excluded.btc_block_number,
                btc_tx_index = excluded.btc_tx_index,
                btc_froms = excluded.btc_froms,
                btc_block_time = excluded.btc_block_time,
                listener_status = excluded.listener_status,
                updated_at = excluded.updated_at",
            params![
                deposit.btc_block_number,
                deposit.btc_tx_index,
                deposit.btc_tx_hash,
                deposit.btc_from,
                deposit.btc_froms,
                deposit.btc_to,
                deposit.btc_value,
                DepositStatus::Pending.to_string(),
                ListenerStatus::Success.to_string(),
                CallbackStatus::Success.to_string(),
                deposit.btc_block_time,
                ts,
            ],
        )?;

        tx.execute(
            "UPDATE btc_index SET btc_index_block = ?1, btc_index_tx = ?2, updated_at = ?3
             WHERE id = 1",
            params![cursor.0, cursor.1, ts],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Record a custody callback: the notification receipt and the implied
    /// deposit commit together. A repeated request-id is a no-op.
    pub fn record_notification(
        &self,
        request_id: &str,
        request_type: i64,
        request_detail: &str,
        deposit: &NotifiedDeposit,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let ts = now();

        tx.execute(
            "INSERT OR IGNORE INTO notifications (request_id, request_type, request_detail, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![request_id, request_type, request_detail, ts],
        )?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM deposits WHERE btc_tx_hash = ?1",
                params![deposit.btc_tx_hash],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE deposits SET callback_status = ?1, updated_at = ?2 WHERE id = ?3",
                    params![CallbackStatus::Success.to_string(), ts, id],
                )?;
            }
            None => {
                tx.execute(
                    "INSERT INTO deposits (
                        btc_tx_hash, btc_from, btc_froms, btc_to, btc_value,
                        b2_tx_status, listener_status, callback_status,
                        created_at, updated_at
                     ) VALUES (?1, ?2, '[]', ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                    params![
                        deposit.btc_tx_hash,
                        deposit.btc_from,
                        deposit.btc_to,
                        deposit.btc_value,
                        DepositStatus::Pending.to_string(),
                        ListenerStatus::Pending.to_string(),
                        CallbackStatus::Success.to_string(),
                        ts,
                    ],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Primary dispatch batch: retriable statuses, both ingest sides
    /// confirmed, ordered so L2 nonces follow L1 arrival order.
    pub fn deposits_ready(&self, limit: u32) -> Result<Vec<Deposit>, StoreError> {
        self.select_deposits(
            "SELECT * FROM deposits
             WHERE b2_tx_status IN (?1, ?2, ?3)
               AND callback_status = ?4
               AND listener_status = ?5
             ORDER BY btc_block_number ASC, id ASC
             LIMIT ?6",
            params![
                DepositStatus::Pending.to_string(),
                DepositStatus::ContractInsufficientBalance.to_string(),
                DepositStatus::FromAccountGasInsufficient.to_string(),
                CallbackStatus::Success.to_string(),
                ListenerStatus::Success.to_string(),
                limit,
            ],
        )
    }

    /// Recovery batch: rows stuck on address translation.
    pub fn deposits_address_pending(&self, limit: u32) -> Result<Vec<Deposit>, StoreError> {
        self.select_deposits(
            "SELECT * FROM deposits WHERE b2_tx_status = ?1 LIMIT ?2",
            params![DepositStatus::AaAddressNotFound.to_string(), limit],
        )
    }

    /// Reconciler batch: ambiguous submissions, oldest stuck nonce first.
    pub fn deposits_unconfirmed(&self, limit: u32) -> Result<Vec<Deposit>, StoreError> {
        self.select_deposits(
            "SELECT * FROM deposits
             WHERE b2_tx_status IN (?1, ?2, ?3)
             ORDER BY b2_tx_nonce ASC
             LIMIT ?4",
            params![
                DepositStatus::ContextDeadlineExceeded.to_string(),
                DepositStatus::WaitMined.to_string(),
                DepositStatus::WaitMinedFailed.to_string(),
                limit,
            ],
        )
    }

    fn select_deposits<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<Deposit>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, row_to_deposit)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn deposit_by_tx_hash(&self, btc_tx_hash: &str) -> Result<Option<Deposit>, StoreError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT * FROM deposits WHERE btc_tx_hash = ?1",
                params![btc_tx_hash],
                row_to_deposit,
            )
            .optional()?)
    }

    pub fn deposit_by_id(&self, id: i64) -> Result<Option<Deposit>, StoreError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT * FROM deposits WHERE id = ?1",
                params![id],
                row_to_deposit,
            )
            .optional()?)
    }

    /// Record a successful submission before waiting for mining. The hash,
    /// nonce and smart-account address must be durable so the reconciler can
    /// find the transaction after a crash.
    pub fn mark_deposit_submitted(
        &self,
        id: i64,
        b2_tx_hash: &str,
        aa_address: &str,
        nonce: u64,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE deposits
             SET b2_tx_hash = ?1, aa_address = ?2, b2_tx_nonce = ?3, b2_tx_status = ?4,
                 updated_at = ?5
             WHERE id = ?6",
            params![
                b2_tx_hash,
                aa_address,
                nonce as i64,
                DepositStatus::WaitMined.to_string(),
                now(),
                id
            ],
        )?;
        Ok(())
    }

    pub fn set_deposit_status(&self, id: i64, status: DepositStatus) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE deposits SET b2_tx_status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.to_string(), now(), id],
        )?;
        Ok(())
    }

    /// Commit a retriable submit failure: status stays pending (or the named
    /// retriable status) and the retry counter advances.
    pub fn record_deposit_retry(
        &self,
        id: i64,
        status: DepositStatus,
        retry: u32,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE deposits SET b2_tx_status = ?1, b2_tx_retry = ?2, updated_at = ?3
             WHERE id = ?4",
            params![status.to_string(), retry, now(), id],
        )?;
        Ok(())
    }

    /// Atomic final commit of one dispatch pass: status, retry count, EOA
    /// fields and nonce together.
    pub fn record_deposit_outcome(&self, id: i64, out: &DepositOutcome) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE deposits
             SET b2_tx_status = ?1,
                 b2_tx_retry = ?2,
                 b2_tx_hash = COALESCE(?3, b2_tx_hash),
                 aa_address = COALESCE(?4, aa_address),
                 b2_tx_nonce = COALESCE(?5, b2_tx_nonce),
                 b2_eoa_tx_hash = COALESCE(?6, b2_eoa_tx_hash),
                 b2_eoa_tx_nonce = COALESCE(?7, b2_eoa_tx_nonce),
                 b2_eoa_tx_status = ?8,
                 updated_at = ?9
             WHERE id = ?10",
            params![
                out.status.to_string(),
                out.retry,
                out.b2_tx_hash,
                out.aa_address,
                out.b2_tx_nonce.map(|n| n as i64),
                out.eoa_hash,
                out.eoa_nonce.map(|n| n as i64),
                out.eoa_status.to_string(),
                now(),
                id
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Withdraws
    // ------------------------------------------------------------------

    /// Insert one scanned withdraw event; a (block, tx, log) collision is
    /// reported, not an error.
    pub fn insert_withdraw(&self, w: &Withdraw) -> Result<WithdrawInsert, StoreError> {
        let conn = self.conn()?;
        let ts = now();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO withdraws (
                btc_from, btc_to, btc_value, b2_block_number, b2_block_hash,
                b2_tx_hash, b2_tx_index, b2_log_index, status, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                w.btc_from,
                w.btc_to,
                w.btc_value,
                w.b2_block_number,
                w.b2_block_hash,
                w.b2_tx_hash,
                w.b2_tx_index,
                w.b2_log_index,
                WithdrawStatus::Pending.to_string(),
                ts,
            ],
        )?;

        Ok(if inserted == 0 {
            WithdrawInsert::Duplicate
        } else {
            WithdrawInsert::Created
        })
    }

    pub fn pending_withdraws(&self) -> Result<Vec<Withdraw>, StoreError> {
        self.select_withdraws(
            "SELECT * FROM withdraws WHERE status = ?1 ORDER BY id ASC",
            params![WithdrawStatus::Pending.to_string()],
        )
    }

    pub fn withdraws_by_b2_tx_hashes(&self, hashes: &[String]) -> Result<Vec<Withdraw>, StoreError> {
        let mut out = Vec::new();
        for hash in hashes {
            out.extend(self.select_withdraws(
                "SELECT * FROM withdraws WHERE b2_tx_hash = ?1",
                params![hash],
            )?);
        }
        Ok(out)
    }

    fn select_withdraws<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<Withdraw>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, row_to_withdraw)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Atomic batch submission: every selected Withdraw flips to submitted
    /// and the WithdrawTx row is created in one transaction. A crash between
    /// the two must be impossible by construction.
    pub fn submit_withdraw_batch(
        &self,
        withdraw_ids: &[i64],
        btc_tx_id: &str,
        psbt: &str,
        b2_tx_hashes_json: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let ts = now();

        for id in withdraw_ids {
            tx.execute(
                "UPDATE withdraws SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![WithdrawStatus::Submitted.to_string(), ts, id],
            )?;
        }

        tx.execute(
            "INSERT INTO withdraw_txs (btc_tx_id, psbt, b2_tx_hashes, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                btc_tx_id,
                psbt,
                b2_tx_hashes_json,
                WithdrawTxStatus::SignaturePending.to_string(),
                ts,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn withdraw_txs_by_status(
        &self,
        status: WithdrawTxStatus,
    ) -> Result<Vec<WithdrawTx>, StoreError> {
        self.select_withdraw_txs(
            "SELECT * FROM withdraw_txs WHERE status = ?1 ORDER BY id ASC",
            params![status.to_string()],
        )
    }

    /// Batches awaiting terminal reporting: confirmed or broadcast-failed.
    pub fn withdraw_txs_finalizable(&self) -> Result<Vec<WithdrawTx>, StoreError> {
        self.select_withdraw_txs(
            "SELECT * FROM withdraw_txs WHERE status IN (?1, ?2) ORDER BY id ASC",
            params![
                WithdrawTxStatus::Confirmed.to_string(),
                WithdrawTxStatus::BroadcastFailed.to_string(),
            ],
        )
    }

    fn select_withdraw_txs<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<WithdrawTx>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, row_to_withdraw_tx)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Record the broadcast attempt outcome on a batch.
    pub fn record_broadcast(
        &self,
        id: i64,
        status: WithdrawTxStatus,
        btc_tx_hash: Option<&str>,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE withdraw_txs
             SET status = ?1, btc_tx_hash = COALESCE(?2, btc_tx_hash), reason = ?3,
                 updated_at = ?4
             WHERE id = ?5",
            params![status.to_string(), btc_tx_hash, reason, now(), id],
        )?;
        Ok(())
    }

    pub fn set_withdraw_tx_status(
        &self,
        id: i64,
        status: WithdrawTxStatus,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE withdraw_txs SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.to_string(), now(), id],
        )?;
        Ok(())
    }

    /// Terminal commit of a batch: the WithdrawTx status and every referenced
    /// Withdraw row flip together. A failed batch resets its rows to pending
    /// so construction can retry them into a fresh batch.
    pub fn finalize_withdraw_tx(
        &self,
        id: i64,
        tx_status: WithdrawTxStatus,
        b2_tx_hashes: &[String],
        withdraw_status: WithdrawStatus,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let ts = now();

        tx.execute(
            "UPDATE withdraw_txs SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![tx_status.to_string(), ts, id],
        )?;

        for hash in b2_tx_hashes {
            tx.execute(
                "UPDATE withdraws SET status = ?1, updated_at = ?2 WHERE b2_tx_hash = ?3",
                params![withdraw_status.to_string(), ts, hash],
            )?;
        }

        tx.commit()?;
        Ok(())
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn row_to_deposit(row: &rusqlite::Row) -> rusqlite::Result<Deposit> {
    let status: String = row.get("b2_tx_status")?;
    let eoa_status: String = row.get("b2_eoa_tx_status")?;
    let listener: String = row.get("listener_status")?;
    let callback: String = row.get("callback_status")?;

    Ok(Deposit {
        id: row.get("id")?,
        btc_block_number: row.get("btc_block_number")?,
        btc_tx_index: row.get("btc_tx_index")?,
        btc_tx_hash: row.get("btc_tx_hash")?,
        btc_from: row.get("btc_from")?,
        btc_froms: row.get("btc_froms")?,
        btc_to: row.get("btc_to")?,
        btc_value: row.get("btc_value")?,
        aa_address: row.get("aa_address")?,
        b2_tx_hash: row.get("b2_tx_hash")?,
        b2_tx_nonce: row.get::<_, Option<i64>>("b2_tx_nonce")?.map(|n| n as u64),
        b2_tx_status: status.parse().unwrap_or(DepositStatus::Pending),
        b2_tx_retry: row.get("b2_tx_retry")?,
        b2_eoa_tx_hash: row.get("b2_eoa_tx_hash")?,
        b2_eoa_tx_nonce: row
            .get::<_, Option<i64>>("b2_eoa_tx_nonce")?
            .map(|n| n as u64),
        b2_eoa_tx_status: eoa_status.parse().unwrap_or(EoaStatus::Pending),
        listener_status: listener.parse().unwrap_or(ListenerStatus::Pending),
        callback_status: callback.parse().unwrap_or(CallbackStatus::Pending),
        btc_block_time: row.get("btc_block_time")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_withdraw(row: &rusqlite::Row) -> rusqlite::Result<Withdraw> {
    let status: String = row.get("status")?;
    Ok(Withdraw {
        id: row.get("id")?,
        btc_from: row.get("btc_from")?,
        btc_to: row.get("btc_to")?,
        btc_value: row.get("btc_value")?,
        b2_block_number: row.get("b2_block_number")?,
        b2_block_hash: row.get("b2_block_hash")?,
        b2_tx_hash: row.get("b2_tx_hash")?,
        b2_tx_index: row.get("b2_tx_index")?,
        b2_log_index: row.get("b2_log_index")?,
        status: status.parse().unwrap_or(WithdrawStatus::Pending),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_withdraw_tx(row: &rusqlite::Row) -> rusqlite::Result<WithdrawTx> {
    let status: String = row.get("status")?;
    Ok(WithdrawTx {
        id: row.get("id")?,
        btc_tx_id: row.get("btc_tx_id")?,
        psbt: row.get("psbt")?,
        b2_tx_hashes: row.get("b2_tx_hashes")?,
        btc_tx_hash: row.get("btc_tx_hash")?,
        status: status.parse().unwrap_or(WithdrawTxStatus::SignaturePending),
        reason: row.get("reason")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}
