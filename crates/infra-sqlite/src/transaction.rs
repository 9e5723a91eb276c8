// SQLite Transaction Implementation

use async_trait::async_trait;
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction as SqlxTransaction};
use std::any::Any;

use stepline_core::error::Result;
use stepline_core::port::{Transaction, TransactionManager};

use crate::job_repository::map_sqlx_error;

/// Begins chunk transactions on a SQLite pool.
///
/// Writers enlist through [`SqliteTransaction::connection`]. A
/// [`crate::SqliteJobRepository`] over the same database writes the chunk
/// checkpoint on that connection, so business rows and checkpoint commit
/// together.
#[derive(Clone)]
pub struct SqliteTransactionManager {
    pool: SqlitePool,
}

impl SqliteTransactionManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionManager for SqliteTransactionManager {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        Ok(Box::new(SqliteTransaction { tx }))
    }
}

pub struct SqliteTransaction {
    tx: SqlxTransaction<'static, Sqlite>,
}

impl SqliteTransaction {
    /// The SQLite transaction behind a chunk transaction, if it is one.
    pub fn downcast(transaction: &mut dyn Transaction) -> Option<&mut SqliteTransaction> {
        transaction.as_any_mut().downcast_mut::<SqliteTransaction>()
    }

    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(map_sqlx_error)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create_pool;

    async fn pool_with_table() -> SqlitePool {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        sqlx::query("CREATE TABLE copied (value INTEGER NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        pool
    }

    async fn insert(transaction: &mut dyn Transaction, value: i64) {
        let sqlite = SqliteTransaction::downcast(transaction).unwrap();
        sqlx::query("INSERT INTO copied (value) VALUES (?)")
            .bind(value)
            .execute(sqlite.connection())
            .await
            .unwrap();
    }

    async fn stored(pool: &SqlitePool) -> Vec<i64> {
        sqlx::query_scalar("SELECT value FROM copied ORDER BY value")
            .fetch_all(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_commit_keeps_and_rollback_discards() {
        let pool = pool_with_table().await;
        let manager = SqliteTransactionManager::new(pool.clone());

        let mut kept = manager.begin().await.unwrap();
        insert(kept.as_mut(), 1).await;
        kept.commit().await.unwrap();

        let mut discarded = manager.begin().await.unwrap();
        insert(discarded.as_mut(), 2).await;
        discarded.rollback().await.unwrap();

        assert_eq!(stored(&pool).await, vec![1]);
    }

    #[tokio::test]
    async fn test_other_transactions_are_not_downcast() {
        let mut other = stepline_core::port::ResourcelessTransactionManager
            .begin()
            .await
            .unwrap();
        assert!(SqliteTransaction::downcast(other.as_mut()).is_none());
    }
}
