//! Transaction helpers.
//!
//! Services open a transaction with `begin()`, run their work against
//! `&DatabaseTransaction` and hand the result to [`finish`], which commits on
//! success and rolls back explicitly on any error. A transaction dropped
//! without either (panic, cancelled future) is rolled back by sea-orm.

use metrics::counter;
use sea_orm::DatabaseTransaction;
use tracing::{debug, warn};

use crate::errors::ServiceError;

/// Commits `txn` when `result` is `Ok`, otherwise rolls it back and returns the error.
pub async fn finish<T>(
    txn: DatabaseTransaction,
    result: Result<T, ServiceError>,
) -> Result<T, ServiceError> {
    match result {
        Ok(value) => {
            txn.commit().await.map_err(|e| {
                counter!("order_engine_db.transaction.commit_failures", 1);
                ServiceError::DatabaseError(e)
            })?;
            counter!("order_engine_db.transaction.commits", 1);
            Ok(value)
        }
        Err(err) => {
            debug!(error = %err, "rolling back transaction");
            if let Err(rollback_err) = txn.rollback().await {
                warn!(error = %rollback_err, "transaction rollback failed");
            }
            counter!("order_engine_db.transaction.rollbacks", 1);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{
        ConnectOptions, ConnectionTrait, Database, DbBackend, Statement, TransactionTrait,
    };

    async fn memory_db() -> sea_orm::DatabaseConnection {
        let mut opt = ConnectOptions::new("sqlite::memory:".to_string());
        opt.max_connections(1).min_connections(1);
        let db = Database::connect(opt).await.unwrap();
        db.execute(Statement::from_string(
            DbBackend::Sqlite,
            "CREATE TABLE t (v INTEGER NOT NULL)".to_string(),
        ))
        .await
        .unwrap();
        db
    }

    async fn count(db: &sea_orm::DatabaseConnection) -> i64 {
        let row = db
            .query_one(Statement::from_string(
                DbBackend::Sqlite,
                "SELECT COUNT(*) AS c FROM t".to_string(),
            ))
            .await
            .unwrap()
            .unwrap();
        row.try_get::<i64>("", "c").unwrap()
    }

    #[tokio::test]
    async fn commits_on_ok() {
        let db = memory_db().await;
        let txn = db.begin().await.unwrap();
        let result = txn
            .execute(Statement::from_string(
                DbBackend::Sqlite,
                "INSERT INTO t (v) VALUES (1)".to_string(),
            ))
            .await
            .map(|_| ())
            .map_err(ServiceError::from);
        finish(txn, result).await.unwrap();
        assert_eq!(count(&db).await, 1);
    }

    #[tokio::test]
    async fn rolls_back_on_error() {
        let db = memory_db().await;
        let txn = db.begin().await.unwrap();
        txn.execute(Statement::from_string(
            DbBackend::Sqlite,
            "INSERT INTO t (v) VALUES (1)".to_string(),
        ))
        .await
        .unwrap();
        let result: Result<(), ServiceError> = Err(ServiceError::Conflict("stale".into()));
        assert!(finish(txn, result).await.is_err());
        assert_eq!(count(&db).await, 0);
    }
}
