use crate::{
    extract::SaveAs,
    pipeline::FetchLedger,
    sink::{record_key, Sink, SinkError},
    utils, CrawlerError, Record, Task,
};
use sqlx::{sqlite::SqliteConnectOptions, Row, SqlitePool};
use std::{fmt::Display, path::Path};

#[async_trait::async_trait]
pub trait Table {
    type Record<'a>;

    fn get_name(&self) -> &str;
    fn get_pool(&self) -> &SqlitePool;

    async fn create(&self) -> Result<(), sqlx::Error>;
    async fn insert<'a>(&self, record: Self::Record<'a>) -> Result<(), sqlx::Error>;

    async fn is_exist<I: AsRef<str> + Display + Send + Sync>(
        &self,
        id: I,
    ) -> Result<bool, sqlx::Error> {
        let query = format!("SELECT id FROM {} WHERE id = ?", self.get_name());
        Ok(sqlx::query(&query)
            .bind(id.as_ref())
            .fetch_optional(self.get_pool())
            .await?
            .is_some())
    }

    async fn delete<I: AsRef<str> + Send + Sync>(&self, id: I) -> Result<(), sqlx::Error> {
        let query = format!(r#"DELETE FROM {} WHERE id = ?"#, self.get_name());
        sqlx::query(&query)
            .bind(id.as_ref())
            .execute(self.get_pool())
            .await?;
        Ok(())
    }

    async fn count(&self) -> Result<u32, sqlx::Error> {
        let query = format!("SELECT COUNT(*) FROM {}", self.get_name());
        Ok(sqlx::query(&query)
            .fetch_one(self.get_pool())
            .await?
            .try_get(0)?)
    }
}

/// Ids of tasks that completed in this or an earlier run.
pub struct VisitedTable {
    name: String,
    pool: SqlitePool,
}

#[async_trait::async_trait]
impl Table for VisitedTable {
    type Record<'a> = &'a str;

    fn get_name(&self) -> &str {
        self.name.as_str()
    }

    fn get_pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn create(&self) -> Result<(), sqlx::Error> {
        let query = format!(
            "CREATE TABLE {} (
                id TEXT PRIMARY KEY,
                created_at DATETIME
             )",
            &self.name
        );
        sqlx::query(query.as_str()).execute(self.get_pool()).await?;
        Ok(())
    }

    async fn insert<'a>(&self, record: Self::Record<'a>) -> Result<(), sqlx::Error> {
        let query = format!(
            "INSERT OR IGNORE INTO {} (id, created_at) VALUES (?, ?)",
            &self.name
        );
        sqlx::query(&query)
            .bind(record)
            .bind(utils::get_now())
            .execute(self.get_pool())
            .await?;
        Ok(())
    }
}

pub struct ResultRow<'a> {
    pub id: &'a str,
    pub pipeline: &'a str,
    pub url: &'a str,
    /// Record serialized as JSON.
    pub data: &'a str,
}

/// Extracted records stored as JSON documents.
pub struct ResultTable {
    name: String,
    pool: SqlitePool,
}

#[async_trait::async_trait]
impl Table for ResultTable {
    type Record<'a> = ResultRow<'a>;

    fn get_name(&self) -> &str {
        self.name.as_str()
    }

    fn get_pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn create(&self) -> Result<(), sqlx::Error> {
        let query = format!(
            r#"
                CREATE TABLE {} (
                    id TEXT PRIMARY KEY,
                    created_at DATETIME,
                    pipeline TEXT,
                    url TEXT,
                    data TEXT
                )
            "#,
            &self.name
        );
        sqlx::query(query.as_str()).execute(self.get_pool()).await?;
        Ok(())
    }

    async fn insert<'a>(&self, row: Self::Record<'a>) -> Result<(), sqlx::Error> {
        let query = format!(
            r#"INSERT OR REPLACE INTO {} (
                id,
                pipeline,
                url,
                data,
                created_at) VALUES (?, ?, ?, ?, ?)"#,
            self.name
        );
        sqlx::query(&query)
            .bind(row.id)
            .bind(row.pipeline)
            .bind(row.url.trim())
            .bind(row.data)
            .bind(utils::get_now())
            .execute(self.get_pool())
            .await?;
        Ok(())
    }
}

impl ResultTable {
    pub async fn records(&self, pipeline: &str) -> Result<Vec<Record>, CrawlerError> {
        let query = format!(
            "SELECT data FROM {} WHERE pipeline = ? ORDER BY created_at, id",
            self.name
        );
        let mut records = vec![];
        for row in sqlx::query(&query)
            .bind(pipeline)
            .fetch_all(&self.pool)
            .await?
        {
            let data: String = row.try_get("data")?;
            records.push(
                serde_json::from_str(&data)
                    .map_err(|err| sqlx::Error::Decode(Box::new(err)))?,
            );
        }
        Ok(records)
    }
}

/// SQLite state of a crawl: resume ledger plus a copy of every record.
pub struct SqliteStore {
    pub name: String,
    pub visited: VisitedTable,
    pub results: ResultTable,
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new<P: AsRef<Path>>(path: P, name: &str) -> Result<SqliteStore, CrawlerError> {
        let opt = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(opt).await?;
        let store = SqliteStore {
            name: name.to_string(),
            visited: VisitedTable {
                name: format!("{}_visited", name),
                pool: pool.clone(),
            },
            results: ResultTable {
                name: format!("{}_results", name),
                pool: pool.clone(),
            },
            pool,
        };

        if !utils::is_table_exists(&store.pool, &store.visited.name).await? {
            tracing::debug!("Create table {}", store.visited.name);
            store.visited.create().await?;
        } else {
            tracing::debug!("Use table {}", store.visited.name);
        }
        if !utils::is_table_exists(&store.pool, &store.results.name).await? {
            tracing::debug!("Create table {}", store.results.name);
            store.results.create().await?;
        } else {
            tracing::debug!("Use table {}", store.results.name);
        }

        Ok(store)
    }

    fn ledger_id(task: &Task) -> String {
        format!("{}:{}", task.pipeline().name(), task.url().trim())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait::async_trait]
impl FetchLedger for SqliteStore {
    async fn already_fetched(&self, task: &Task) -> Result<bool, CrawlerError> {
        Ok(self.visited.is_exist(Self::ledger_id(task)).await?)
    }

    async fn mark_fetched(&self, task: &Task) -> Result<(), CrawlerError> {
        Ok(self.visited.insert(Self::ledger_id(task).as_str()).await?)
    }
}

#[async_trait::async_trait]
impl Sink for SqliteStore {
    async fn persist(
        &self,
        task: &Task,
        record: &Record,
        save_as: &SaveAs,
    ) -> Result<(), SinkError> {
        let pipeline = task.pipeline().name();
        let id = format!("{}:{}", pipeline, record_key(task, record, save_as));
        let data = serde_json::to_string(record)?;
        self.results
            .insert(ResultRow {
                id: &id,
                pipeline,
                url: task.url(),
                data: &data,
            })
            .await?;
        Ok(())
    }
}
