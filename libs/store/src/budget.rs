//! Daily spend ledger, keyed by (UTC date, client).
//!
//! Rollover is implicit: a new day reads a row that does not exist yet.
//! Writes are synchronous single statements; SQLite provides the atomicity.

use rusqlite::OptionalExtension;
use serde::Serialize;

use crate::db::{Database, StoreError};

#[derive(Debug, Clone, Default)]
pub struct BudgetOptions {
    pub global_daily_limit_usd: Option<f64>,
    pub default_client_daily_limit_usd: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetSnapshot {
    pub date: String,
    pub global_spent_usd: f64,
    pub global_daily_limit_usd: Option<f64>,
    pub default_client_daily_limit_usd: Option<f64>,
}

#[derive(Clone)]
pub struct BudgetTracker {
    db: Database,
    options: BudgetOptions,
}

impl BudgetTracker {
    pub fn new(db: Database, options: BudgetOptions) -> Self {
        Self { db, options }
    }

    pub fn today() -> String {
        chrono::Utc::now().format("%Y-%m-%d").to_string()
    }

    /// Pre-dispatch check. Returns a human-readable exhaustion message when
    /// the global cap or the client's cap (token override first, else the
    /// server default) is already spent, else `None`.
    pub fn check(
        &self,
        client: &str,
        per_client_override: Option<f64>,
    ) -> Result<Option<String>, StoreError> {
        let date = Self::today();

        if let Some(global_cap) = self.options.global_daily_limit_usd {
            let global_spent = self.global_spent(&date)?;
            if global_spent >= global_cap {
                return Ok(Some(format!(
                    "Daily global budget exhausted: ${global_spent:.2} spent of ${global_cap:.2} cap. Try again tomorrow."
                )));
            }
        }

        let client_cap = per_client_override.or(self.options.default_client_daily_limit_usd);
        if let Some(client_cap) = client_cap {
            let spent = self.client_spent(&date, client)?;
            if spent >= client_cap {
                return Ok(Some(format!(
                    "Daily budget exhausted for '{client}': ${spent:.2} spent of ${client_cap:.2} cap. Try again tomorrow."
                )));
            }
        }

        Ok(None)
    }

    /// Accrue spend for today. Additive upsert, written immediately.
    pub fn record_cost(&self, client: &str, usd: f64) -> Result<(), StoreError> {
        if usd <= 0.0 {
            return Ok(());
        }
        let date = Self::today();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO budget_records (date, client_name, spent_usd) VALUES (?1, ?2, ?3)
                 ON CONFLICT(date, client_name) DO UPDATE SET spent_usd = spent_usd + ?3",
                rusqlite::params![date, client, usd],
            )?;
            Ok(())
        })
    }

    pub fn client_spent_today(&self, client: &str) -> Result<f64, StoreError> {
        self.client_spent(&Self::today(), client)
    }

    pub fn snapshot(&self) -> Result<BudgetSnapshot, StoreError> {
        let date = Self::today();
        Ok(BudgetSnapshot {
            global_spent_usd: self.global_spent(&date)?,
            global_daily_limit_usd: self.options.global_daily_limit_usd,
            default_client_daily_limit_usd: self.options.default_client_daily_limit_usd,
            date,
        })
    }

    fn global_spent(&self, date: &str) -> Result<f64, StoreError> {
        let total = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT SUM(spent_usd) FROM budget_records WHERE date = ?1",
                [date],
                |row| row.get::<_, Option<f64>>(0),
            )
            .optional()
        })?;
        Ok(total.flatten().unwrap_or(0.0))
    }

    fn client_spent(&self, date: &str, client: &str) -> Result<f64, StoreError> {
        let spent = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT spent_usd FROM budget_records WHERE date = ?1 AND client_name = ?2",
                rusqlite::params![date, client],
                |row| row.get::<_, f64>(0),
            )
            .optional()
        })?;
        Ok(spent.unwrap_or(0.0))
    }
}
