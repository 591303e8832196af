//! Generic row access shared by the per-entity stores.
//!
//! Column and table names are compile-time constants from the [`Record`] impl
//! (or a tenant table name derived from a parsed UUID), never user input, so
//! they are safe to format into SQL. Values are always bound.

use std::marker::PhantomData;

use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::FromRow;

use crate::db::DbPool;

/// A row type with a public `rid` and a `created_at` ordering column.
pub trait Record: for<'r> FromRow<'r, SqliteRow> + Send + Unpin {
    const TABLE: &'static str;
    /// Human-readable name used in not-found errors
    const NAME: &'static str;
    const COLUMNS: &'static str;
}

#[derive(Debug, Clone)]
pub struct Repository<R> {
    pool: DbPool,
    table: String,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> Repository<R> {
    pub fn new(pool: DbPool) -> Self {
        Self::with_table(pool, R::TABLE)
    }

    /// Same record layout stored under a different table (tenant tables).
    pub fn with_table(pool: DbPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
            _record: PhantomData,
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn find_by_rid(&self, rid: &str) -> Result<Option<R>, sqlx::Error> {
        self.find_where("rid", rid).await
    }

    pub async fn find_where(&self, column: &str, value: &str) -> Result<Option<R>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?",
            R::COLUMNS,
            self.table,
            column
        );
        sqlx::query_as::<_, R>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
    }

    /// Newest-first page of rows strictly older than the `cursor` row.
    ///
    /// `filter` restricts the page to rows where `column = value`. An unknown
    /// cursor yields an empty page. Ties on `created_at` are broken by id.
    pub async fn list_before(
        &self,
        filter: Option<(&str, &str)>,
        cursor: Option<&str>,
        limit: i64,
    ) -> Result<Vec<R>, sqlx::Error> {
        let mut conditions = Vec::new();
        if let Some((column, _)) = filter {
            conditions.push(format!("{column} = ?"));
        }
        if cursor.is_some() {
            conditions.push(format!(
                "(created_at, id) < (SELECT created_at, id FROM {} WHERE rid = ?)",
                self.table
            ));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let sql = format!(
            "SELECT {} FROM {} {} ORDER BY created_at DESC, id DESC LIMIT ?",
            R::COLUMNS,
            self.table,
            where_clause
        );

        let mut query = sqlx::query_as::<_, R>(&sql);
        if let Some((_, value)) = filter {
            query = query.bind(value);
        }
        if let Some(cursor) = cursor {
            query = query.bind(cursor);
        }
        query.bind(limit).fetch_all(&self.pool).await
    }

    /// Returns whether a row was removed. Runs on `conn` so deletes can share a transaction.
    pub async fn delete_by_rid(
        &self,
        conn: &mut SqliteConnection,
        rid: &str,
    ) -> Result<bool, sqlx::Error> {
        Ok(self.delete_where(conn, "rid", rid).await? > 0)
    }

    pub async fn delete_where(
        &self,
        conn: &mut SqliteConnection,
        column: &str,
        value: &str,
    ) -> Result<u64, sqlx::Error> {
        let sql = format!("DELETE FROM {} WHERE {} = ?", self.table, column);
        let result = sqlx::query(&sql).bind(value).execute(conn).await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_pool, IdentificationAttempt};

    async fn insert_attempt(pool: &DbPool, rid: &str, user: &str, created_at: &str) {
        sqlx::query(
            "INSERT INTO identification_attempts (rid, user_rid, recording, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(rid)
        .bind(user)
        .bind(vec![1u8, 2, 3])
        .bind(created_at)
        .bind(created_at)
        .execute(pool)
        .await
        .unwrap();
    }

    fn rids(rows: &[IdentificationAttempt]) -> Vec<&str> {
        rows.iter().map(|r| r.rid.as_str()).collect()
    }

    #[tokio::test]
    async fn test_list_before_pages_newest_first() {
        let pool = test_pool().await;
        for (i, rid) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            let ts = format!("2026-01-01T00:00:0{i}.000000Z");
            insert_attempt(&pool, rid, "u1", &ts).await;
        }
        let repo: Repository<IdentificationAttempt> = Repository::new(pool);

        let first = repo.list_before(None, None, 2).await.unwrap();
        assert_eq!(rids(&first), vec!["e", "d"]);

        let second = repo.list_before(None, Some("d"), 2).await.unwrap();
        assert_eq!(rids(&second), vec!["c", "b"]);

        let last = repo.list_before(None, Some("b"), 10).await.unwrap();
        assert_eq!(rids(&last), vec!["a"]);

        assert!(repo.list_before(None, Some("a"), 10).await.unwrap().is_empty());
        assert!(repo
            .list_before(None, Some("missing"), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_list_before_breaks_timestamp_ties_by_id() {
        let pool = test_pool().await;
        let ts = "2026-01-01T00:00:00.000000Z";
        for rid in ["x", "y", "z"] {
            insert_attempt(&pool, rid, "u1", ts).await;
        }
        let repo: Repository<IdentificationAttempt> = Repository::new(pool);

        let page = repo.list_before(None, Some("z"), 10).await.unwrap();
        assert_eq!(rids(&page), vec!["y", "x"]);
    }

    #[tokio::test]
    async fn test_list_before_filter_and_delete() {
        let pool = test_pool().await;
        insert_attempt(&pool, "a", "u1", "2026-01-01T00:00:00.000000Z").await;
        insert_attempt(&pool, "b", "u2", "2026-01-01T00:00:01.000000Z").await;
        insert_attempt(&pool, "c", "u1", "2026-01-01T00:00:02.000000Z").await;
        let repo: Repository<IdentificationAttempt> = Repository::new(pool);

        let page = repo.list_before(Some(("user_rid", "u1")), None, 10).await.unwrap();
        assert_eq!(rids(&page), vec!["c", "a"]);

        let mut tx = repo.pool().begin().await.unwrap();
        assert!(repo.delete_by_rid(&mut tx, "b").await.unwrap());
        assert!(!repo.delete_by_rid(&mut tx, "b").await.unwrap());
        assert_eq!(repo.delete_where(&mut tx, "user_rid", "u1").await.unwrap(), 2);
        tx.rollback().await.unwrap();
        assert!(repo.find_by_rid("a").await.unwrap().is_some());

        let mut conn = repo.pool().acquire().await.unwrap();
        assert!(repo.delete_by_rid(&mut conn, "a").await.unwrap());
        drop(conn);
        assert!(repo.find_by_rid("a").await.unwrap().is_none());
    }
}
