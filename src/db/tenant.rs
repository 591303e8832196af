//! Per-project auth tables.

use dashmap::DashSet;
use uuid::Uuid;

use crate::db::{execute_sql, DbPool};

pub const MAIN_AUTH_TABLE: &str = "auth_main";

/// `auth_main` without a project, `auth_<uuid simple>` otherwise.
pub fn auth_table_name(project: Option<Uuid>) -> String {
    match project {
        Some(id) => format!("auth_{}", id.simple()),
        None => MAIN_AUTH_TABLE.to_string(),
    }
}

pub(crate) fn auth_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            rid TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE COLLATE NOCASE,
            email_verified INTEGER NOT NULL DEFAULT 0,
            password_hash TEXT NOT NULL,
            password_temp_hash TEXT,
            password_temp_request_date TEXT,
            password_reset_code_hash TEXT,
            password_reset_request_date TEXT,
            email_verification_code_hash TEXT,
            email_verification_request_date TEXT,
            password_reset_failures INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );"
    )
}

/// Creates project auth tables on first use and remembers which exist.
#[derive(Debug)]
pub struct TenantTables {
    pool: DbPool,
    known: DashSet<String>,
}

impl TenantTables {
    pub fn new(pool: DbPool) -> Self {
        let known = DashSet::new();
        known.insert(MAIN_AUTH_TABLE.to_string());
        Self { pool, known }
    }

    /// Name of the auth table for `project`, created if missing.
    pub async fn auth_table(&self, project: Option<Uuid>) -> Result<String, sqlx::Error> {
        let table = auth_table_name(project);
        if self.known.contains(&table) {
            return Ok(table);
        }

        execute_sql(&self.pool, &auth_table_sql(&table)).await?;
        tracing::info!(table = %table, "Created project auth table");
        self.known.insert(table.clone());
        Ok(table)
    }
}
