//! MySQL-backed store over a shared sqlx pool.
//!
//! Queries are runtime-checked; ids are bound as canonical uuid strings.
//! The pool re-establishes connections on its own, so `reconnect` only
//! needs to verify the server is reachable again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::mysql::{MySqlPool, MySqlRow};
use sqlx::Row;
use uuid::Uuid;

use super::{Build, Bucket, BucketState, LogFragment, Project, Store, StoreError};

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => StoreError::ConnectionGone,
            sqlx::Error::Database(db) => {
                // CR_SERVER_GONE_ERROR / CR_SERVER_LOST
                let gone = db.code().map_or(false, |c| c == "2006" || c == "2013")
                    || db.message().contains("server has gone away");
                if gone {
                    StoreError::ConnectionGone
                } else {
                    StoreError::Database(e.to_string())
                }
            }
            sqlx::Error::RowNotFound => StoreError::NotFound("row".to_string()),
            _ => StoreError::Database(e.to_string()),
        }
    }
}

pub struct MysqlStore {
    pool: MySqlPool,
}

impl MysqlStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    /// Create the schema if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS projects (
                name VARCHAR(255) PRIMARY KEY,
                url VARCHAR(1024) NOT NULL,
                current_commit VARCHAR(64),
                built_commit VARCHAR(64),
                build_requested BOOLEAN NOT NULL DEFAULT FALSE,
                last_system_error TEXT,
                plan MEDIUMTEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS builds (
                id CHAR(36) PRIMARY KEY,
                project VARCHAR(255) NOT NULL,
                number INT UNSIGNED NOT NULL,
                commit VARCHAR(64) NOT NULL,
                leader_uri VARCHAR(255) NOT NULL,
                started_at DATETIME(6),
                finished_at DATETIME(6),
                UNIQUE KEY build_per_project (project, number)
            )",
            "CREATE TABLE IF NOT EXISTS buckets (
                id CHAR(36) PRIMARY KEY,
                build_id CHAR(36) NOT NULL,
                name VARCHAR(255) NOT NULL,
                state INT NOT NULL,
                worker_uri VARCHAR(255),
                worker_hostname VARCHAR(255),
                started_at DATETIME(6),
                finished_at DATETIME(6),
                log MEDIUMTEXT,
                error_log MEDIUMTEXT,
                KEY buckets_by_build (build_id)
            )",
            "CREATE TABLE IF NOT EXISTS log_fragments (
                id CHAR(36) PRIMARY KEY,
                bucket_id CHAR(36) NOT NULL,
                text MEDIUMTEXT NOT NULL,
                created_at DATETIME(6) NOT NULL,
                KEY fragments_by_bucket (bucket_id, created_at)
            )",
            "CREATE TABLE IF NOT EXISTS leases (
                name VARCHAR(255) PRIMARY KEY,
                holder VARCHAR(255) NOT NULL,
                expires_at DATETIME(6) NOT NULL
            )",
        ];
        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn project_from_row(row: &MySqlRow) -> Result<Project, StoreError> {
    let plan_json: String = row.try_get("plan").map_err(StoreError::from)?;
    let plan = serde_json::from_str(&plan_json)
        .map_err(|e| StoreError::Database(format!("invalid build plan: {e}")))?;
    Ok(Project {
        name: row.try_get("name").map_err(StoreError::from)?,
        url: row.try_get("url").map_err(StoreError::from)?,
        current_commit: row.try_get("current_commit").map_err(StoreError::from)?,
        built_commit: row.try_get("built_commit").map_err(StoreError::from)?,
        build_requested: row.try_get("build_requested").map_err(StoreError::from)?,
        last_system_error: row.try_get("last_system_error").map_err(StoreError::from)?,
        plan,
    })
}

fn build_from_row(row: &MySqlRow) -> Result<Build, StoreError> {
    let id: String = row.try_get("id").map_err(StoreError::from)?;
    Ok(Build {
        id: parse_uuid(&id)?,
        project: row.try_get("project").map_err(StoreError::from)?,
        number: row.try_get("number").map_err(StoreError::from)?,
        commit: row.try_get("commit").map_err(StoreError::from)?,
        leader_uri: row.try_get("leader_uri").map_err(StoreError::from)?,
        started_at: row.try_get("started_at").map_err(StoreError::from)?,
        finished_at: row.try_get("finished_at").map_err(StoreError::from)?,
    })
}

fn bucket_from_row(row: &MySqlRow) -> Result<Bucket, StoreError> {
    let id: String = row.try_get("id").map_err(StoreError::from)?;
    let build_id: String = row.try_get("build_id").map_err(StoreError::from)?;
    let code: i32 = row.try_get("state").map_err(StoreError::from)?;
    let state = BucketState::from_code(code)
        .ok_or_else(|| StoreError::Database(format!("unknown bucket state code {code}")))?;
    Ok(Bucket {
        id: parse_uuid(&id)?,
        build_id: parse_uuid(&build_id)?,
        name: row.try_get("name").map_err(StoreError::from)?,
        state,
        worker_uri: row.try_get("worker_uri").map_err(StoreError::from)?,
        worker_hostname: row.try_get("worker_hostname").map_err(StoreError::from)?,
        started_at: row.try_get("started_at").map_err(StoreError::from)?,
        finished_at: row.try_get("finished_at").map_err(StoreError::from)?,
        log: row.try_get("log").map_err(StoreError::from)?,
        error_log: row.try_get("error_log").map_err(StoreError::from)?,
    })
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Database(format!("invalid uuid {s}: {e}")))
}

#[async_trait]
impl Store for MysqlStore {
    async fn reconnect(&self) {
        if let Err(e) = sqlx::query("SELECT 1").execute(&self.pool).await {
            tracing::warn!(error = %e, "Database still unreachable after reconnect attempt");
        }
    }

    async fn projects(&self) -> Result<Vec<Project>, StoreError> {
        let rows = sqlx::query("SELECT * FROM projects ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(project_from_row).collect()
    }

    async fn project(&self, name: &str) -> Result<Project, StoreError> {
        let row = sqlx::query("SELECT * FROM projects WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("project {name}")))?;
        project_from_row(&row)
    }

    async fn upsert_project(&self, project: &Project) -> Result<(), StoreError> {
        let plan = serde_json::to_string(&project.plan)
            .map_err(|e| StoreError::Database(format!("unserializable build plan: {e}")))?;
        sqlx::query(
            "INSERT INTO projects
                 (name, url, current_commit, built_commit, build_requested,
                  last_system_error, plan)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE
                 url = VALUES(url),
                 current_commit = VALUES(current_commit),
                 built_commit = VALUES(built_commit),
                 build_requested = VALUES(build_requested),
                 last_system_error = VALUES(last_system_error),
                 plan = VALUES(plan)",
        )
        .bind(&project.name)
        .bind(&project.url)
        .bind(project.current_commit.as_deref())
        .bind(project.built_commit.as_deref())
        .bind(project.build_requested)
        .bind(project.last_system_error.as_deref())
        .bind(plan)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_build(&self, build: &Build) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO builds
                 (id, project, number, commit, leader_uri, started_at, finished_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(build.id.to_string())
        .bind(&build.project)
        .bind(build.number)
        .bind(&build.commit)
        .bind(&build.leader_uri)
        .bind(build.started_at)
        .bind(build.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_build(&self, build: &Build) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE builds
             SET project = ?, number = ?, commit = ?, leader_uri = ?,
                 started_at = ?, finished_at = ?
             WHERE id = ?",
        )
        .bind(&build.project)
        .bind(build.number)
        .bind(&build.commit)
        .bind(&build.leader_uri)
        .bind(build.started_at)
        .bind(build.finished_at)
        .bind(build.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn build(&self, id: Uuid) -> Result<Build, StoreError> {
        let row = sqlx::query("SELECT * FROM builds WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("build {id}")))?;
        build_from_row(&row)
    }

    async fn last_build(
        &self,
        project: &str,
        before: Option<u32>,
    ) -> Result<Option<Build>, StoreError> {
        let row = match before {
            Some(n) => {
                sqlx::query(
                    "SELECT * FROM builds WHERE project = ? AND number < ?
                     ORDER BY number DESC LIMIT 1",
                )
                .bind(project)
                .bind(n)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM builds WHERE project = ?
                     ORDER BY number DESC LIMIT 1",
                )
                .bind(project)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        row.as_ref().map(build_from_row).transpose()
    }

    async fn next_build_number(&self, project: &str) -> Result<u32, StoreError> {
        let row = sqlx::query("SELECT CAST(COALESCE(MAX(number), 0) AS SIGNED) AS top FROM builds WHERE project = ?")
            .bind(project)
            .fetch_one(&self.pool)
            .await?;
        let top: i64 = row.try_get("top").map_err(StoreError::from)?;
        Ok(top as u32 + 1)
    }

    async fn insert_bucket(&self, bucket: &Bucket) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO buckets
                 (id, build_id, name, state, worker_uri, worker_hostname,
                  started_at, finished_at, log, error_log)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(bucket.id.to_string())
        .bind(bucket.build_id.to_string())
        .bind(&bucket.name)
        .bind(bucket.state.code())
        .bind(bucket.worker_uri.as_deref())
        .bind(bucket.worker_hostname.as_deref())
        .bind(bucket.started_at)
        .bind(bucket.finished_at)
        .bind(bucket.log.as_deref())
        .bind(bucket.error_log.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_bucket(&self, bucket: &Bucket) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE buckets
             SET state = ?, worker_uri = ?, worker_hostname = ?,
                 started_at = ?, finished_at = ?, log = ?, error_log = ?
             WHERE id = ?",
        )
        .bind(bucket.state.code())
        .bind(bucket.worker_uri.as_deref())
        .bind(bucket.worker_hostname.as_deref())
        .bind(bucket.started_at)
        .bind(bucket.finished_at)
        .bind(bucket.log.as_deref())
        .bind(bucket.error_log.as_deref())
        .bind(bucket.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn bucket(&self, id: Uuid) -> Result<Bucket, StoreError> {
        let row = sqlx::query("SELECT * FROM buckets WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("bucket {id}")))?;
        bucket_from_row(&row)
    }

    async fn buckets_of_build(&self, build_id: Uuid) -> Result<Vec<Bucket>, StoreError> {
        let rows = sqlx::query("SELECT * FROM buckets WHERE build_id = ? ORDER BY name")
            .bind(build_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(bucket_from_row).collect()
    }

    async fn bucket_of_build(
        &self,
        build_id: Uuid,
        name: &str,
    ) -> Result<Option<Bucket>, StoreError> {
        let row = sqlx::query("SELECT * FROM buckets WHERE build_id = ? AND name = ? LIMIT 1")
            .bind(build_id.to_string())
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(bucket_from_row).transpose()
    }

    async fn append_fragment(&self, bucket_id: Uuid, text: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO log_fragments (id, bucket_id, text, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(bucket_id.to_string())
        .bind(text)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fragments(&self, bucket_id: Uuid) -> Result<Vec<LogFragment>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM log_fragments WHERE bucket_id = ? ORDER BY created_at, id",
        )
        .bind(bucket_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(StoreError::from)?;
                let bucket: String = row.try_get("bucket_id").map_err(StoreError::from)?;
                let created_at: DateTime<Utc> =
                    row.try_get("created_at").map_err(StoreError::from)?;
                Ok(LogFragment {
                    id: parse_uuid(&id)?,
                    bucket_id: parse_uuid(&bucket)?,
                    text: row.try_get("text").map_err(StoreError::from)?,
                    created_at,
                })
            })
            .collect()
    }

    async fn delete_fragments(&self, bucket_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM log_fragments WHERE bucket_id = ?")
            .bind(bucket_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
