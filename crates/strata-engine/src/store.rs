use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use strata_core::error::{Result, StrataError};
use strata_core::traits::{BranchStore, RunPersistence, SwarmPersistence, UserDirectory};
use strata_core::types::{
    Branch, BranchId, PersistedRunStatus, PersistedStepStatus, RunId, RunRecord, RunState,
    RunSummary, StepRecord, StoredRun, Swarm, SwarmId, SwarmResources, VarMap,
};

/// SQLite-backed users, runs, steps, swarms and branches.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn db_err(context: &'static str) -> impl Fn(rusqlite::Error) -> StrataError {
    move |e| StrataError::Persistence(format!("{}: {}", context, e))
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(StrataError::from)
}

fn from_json<T: DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text)
        .map_err(|e| StrataError::Persistence(format!("Corrupt stored record: {}", e)))
}

fn parse_ts(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Raw `runs` row before JSON columns are decoded.
struct RunRow {
    id: String,
    routine_id: String,
    user_id: String,
    swarm_id: Option<String>,
    inputs: String,
    metadata: String,
    status: String,
    outputs: String,
    created_at: String,
    updated_at: String,
}

const RUN_COLUMNS: &str =
    "id, routine_id, user_id, swarm_id, inputs, metadata, status, outputs, created_at, updated_at";

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            routine_id: row.get(1)?,
            user_id: row.get(2)?,
            swarm_id: row.get(3)?,
            inputs: row.get(4)?,
            metadata: row.get(5)?,
            status: row.get(6)?,
            outputs: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn status(&self) -> Result<PersistedRunStatus> {
        self.status.parse().map_err(StrataError::Persistence)
    }

    fn record(&self) -> Result<RunRecord> {
        Ok(RunRecord {
            id: RunId::from(self.id.as_str()),
            routine_id: self.routine_id.clone(),
            user_id: self.user_id.clone(),
            swarm_id: self.swarm_id.as_deref().map(SwarmId::from),
            inputs: from_json(&self.inputs)?,
            metadata: from_json(&self.metadata)?,
            created_at: parse_ts(&self.created_at),
            updated_at: parse_ts(&self.updated_at),
        })
    }

    fn summary(&self) -> Result<RunSummary> {
        Ok(RunSummary {
            run_id: RunId::from(self.id.as_str()),
            routine_id: self.routine_id.clone(),
            user_id: self.user_id.clone(),
            swarm_id: self.swarm_id.as_deref().map(SwarmId::from),
            status: self.status()?,
            outputs: from_json(&self.outputs)?,
            created_at: parse_ts(&self.created_at),
            updated_at: parse_ts(&self.updated_at),
        })
    }
}

impl SqliteStore {
    /// Open or create the database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err("Failed to open store"))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("Failed to open store"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS users (
                 id TEXT PRIMARY KEY,
                 created_at TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS runs (
                 id TEXT PRIMARY KEY,
                 routine_id TEXT NOT NULL,
                 user_id TEXT NOT NULL,
                 swarm_id TEXT,
                 inputs TEXT NOT NULL,
                 metadata TEXT NOT NULL,
                 status TEXT NOT NULL,
                 outputs TEXT NOT NULL DEFAULT '{}',
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_runs_user ON runs(user_id, created_at DESC);
             CREATE INDEX IF NOT EXISTS idx_runs_swarm ON runs(swarm_id);

             CREATE TABLE IF NOT EXISTS run_steps (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 run_id TEXT NOT NULL,
                 step_id TEXT NOT NULL,
                 state TEXT NOT NULL,
                 record TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_steps_run ON run_steps(run_id, id);

             CREATE TABLE IF NOT EXISTS swarms (
                 id TEXT PRIMARY KEY,
                 user_id TEXT NOT NULL,
                 data TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS branches (
                 id TEXT PRIMARY KEY,
                 run_id TEXT NOT NULL,
                 branch_index INTEGER NOT NULL,
                 data TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_branches_run ON branches(run_id, branch_index);",
        )
        .map_err(db_err("Failed to initialize schema"))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StrataError::Persistence(e.to_string()))
    }

    /// Register a user. Returns false when the user already existed.
    pub fn add_user(&self, user_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO users (id, created_at) VALUES (?1, ?2)",
                params![user_id, Utc::now().to_rfc3339()],
            )
            .map_err(db_err("Failed to add user"))?;
        Ok(inserted > 0)
    }

    fn has_user(&self, user_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let found: Option<String> = conn
            .query_row("SELECT id FROM users WHERE id = ?1", params![user_id], |row| row.get(0))
            .optional()
            .map_err(db_err("Failed to look up user"))?;
        Ok(found.is_some())
    }

    fn insert_run(&self, record: &RunRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO runs (id, routine_id, user_id, swarm_id, inputs, metadata, status, outputs, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '{}', ?8, ?9)",
            params![
                record.id.as_str(),
                record.routine_id,
                record.user_id,
                record.swarm_id.as_ref().map(|s| s.as_str()),
                to_json(&record.inputs)?,
                to_json(&record.metadata)?,
                PersistedRunStatus::Scheduled.as_str(),
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )
        .map_err(db_err("Failed to create run"))?;
        Ok(())
    }

    /// Run an UPDATE touching one run row; a missing row is `NotFound`.
    fn update_run_column(&self, run_id: &RunId, column: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        let sql = format!("UPDATE runs SET {} = ?1, updated_at = ?2 WHERE id = ?3", column);
        let changed = conn
            .execute(&sql, params![value, Utc::now().to_rfc3339(), run_id.as_str()])
            .map_err(db_err("Failed to update run"))?;
        if changed == 0 {
            return Err(StrataError::not_found("Run", run_id.as_str()));
        }
        Ok(())
    }

    fn insert_step(&self, run_id: &RunId, step: &StepRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO run_steps (run_id, step_id, state, record) VALUES (?1, ?2, ?3, ?4)",
            params![
                run_id.as_str(),
                step.step_id,
                PersistedStepStatus::from(step.state).as_str(),
                to_json(step)?,
            ],
        )
        .map_err(db_err("Failed to record step"))?;
        Ok(())
    }

    fn select_run(&self, run_id: &RunId) -> Result<Option<StoredRun>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
                params![run_id.as_str()],
                RunRow::from_row,
            )
            .optional()
            .map_err(db_err("Failed to load run"))?;
        let Some(row) = row else {
            return Ok(None);
        };

        let mut stmt = conn
            .prepare("SELECT record FROM run_steps WHERE run_id = ?1 ORDER BY id")
            .map_err(db_err("Failed to prepare query"))?;
        let records: Vec<String> = stmt
            .query_map(params![run_id.as_str()], |row| row.get(0))
            .map_err(db_err("Failed to load steps"))?
            .collect::<rusqlite::Result<_>>()
            .map_err(db_err("Failed to load steps"))?;

        Ok(Some(StoredRun {
            record: row.record()?,
            status: row.status()?,
            outputs: from_json(&row.outputs)?,
            steps: records
                .iter()
                .map(|r| from_json(r))
                .collect::<Result<Vec<StepRecord>>>()?,
        }))
    }

    fn select_summaries(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<RunSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(db_err("Failed to prepare query"))?;
        let rows: Vec<RunRow> = stmt
            .query_map(args, RunRow::from_row)
            .map_err(db_err("Failed to list runs"))?
            .collect::<rusqlite::Result<_>>()
            .map_err(db_err("Failed to list runs"))?;
        rows.iter().map(RunRow::summary).collect()
    }

    fn upsert_swarm(&self, swarm: &Swarm) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO swarms (id, user_id, data, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                swarm.id.as_str(),
                swarm.user_id,
                to_json(swarm)?,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(db_err("Failed to save swarm"))?;
        Ok(())
    }

    fn select_swarm(&self, swarm_id: &SwarmId) -> Result<Option<Swarm>> {
        let conn = self.conn()?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM swarms WHERE id = ?1",
                params![swarm_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("Failed to load swarm"))?;
        data.map(|d| from_json(&d)).transpose()
    }

    fn upsert_branch(&self, branch: &Branch) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO branches (id, run_id, branch_index, data) VALUES (?1, ?2, ?3, ?4)",
            params![
                branch.id.as_str(),
                branch.run_id.as_str(),
                branch.index as i64,
                to_json(branch)?,
            ],
        )
        .map_err(db_err("Failed to save branch"))?;
        Ok(())
    }
}

impl RunPersistence for SqliteStore {
    fn create_run(&self, record: RunRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.insert_run(&record) })
    }

    fn update_run_state(&self, run_id: &RunId, state: RunState) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            self.update_run_column(&run_id, "status", PersistedRunStatus::from(state).as_str())
        })
    }

    fn record_step_execution(
        &self,
        run_id: &RunId,
        step: StepRecord,
    ) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.clone();
        Box::pin(async move { self.insert_step(&run_id, &step) })
    }

    fn load_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<StoredRun>>> {
        let run_id = run_id.clone();
        Box::pin(async move { self.select_run(&run_id) })
    }

    fn get_user_run_history(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> BoxFuture<'_, Result<Vec<RunSummary>>> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            let sql = format!(
                "SELECT {} FROM runs WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
                RUN_COLUMNS
            );
            self.select_summaries(&sql, params![user_id, limit as i64, offset as i64])
        })
    }

    fn update_run_outputs(&self, run_id: &RunId, outputs: &VarMap) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.clone();
        let outputs = to_json(outputs);
        Box::pin(async move { self.update_run_column(&run_id, "outputs", &outputs?) })
    }
}

impl SwarmPersistence for SqliteStore {
    fn create_swarm(&self, swarm: &Swarm) -> BoxFuture<'_, Result<()>> {
        let swarm = swarm.clone();
        Box::pin(async move { self.upsert_swarm(&swarm) })
    }

    fn load_swarm(&self, swarm_id: &SwarmId) -> BoxFuture<'_, Result<Option<Swarm>>> {
        let swarm_id = swarm_id.clone();
        Box::pin(async move { self.select_swarm(&swarm_id) })
    }

    fn update_swarm_usage(
        &self,
        swarm_id: &SwarmId,
        resources: &SwarmResources,
    ) -> BoxFuture<'_, Result<()>> {
        let swarm_id = swarm_id.clone();
        let resources = *resources;
        Box::pin(async move {
            let mut swarm = self
                .select_swarm(&swarm_id)?
                .ok_or_else(|| StrataError::not_found("Swarm", swarm_id.as_str()))?;
            swarm.resources = resources;
            self.upsert_swarm(&swarm)
        })
    }

    fn list_swarm_runs(&self, swarm_id: &SwarmId) -> BoxFuture<'_, Result<Vec<RunSummary>>> {
        let swarm_id = swarm_id.clone();
        Box::pin(async move {
            let sql = format!(
                "SELECT {} FROM runs WHERE swarm_id = ?1 ORDER BY created_at",
                RUN_COLUMNS
            );
            self.select_summaries(&sql, params![swarm_id.as_str()])
        })
    }
}

impl UserDirectory for SqliteStore {
    fn user_exists(&self, user_id: &str) -> BoxFuture<'_, Result<bool>> {
        let user_id = user_id.to_string();
        Box::pin(async move { self.has_user(&user_id) })
    }
}

impl BranchStore for SqliteStore {
    fn save_branch(&self, branch: &Branch) -> BoxFuture<'_, Result<()>> {
        let branch = branch.clone();
        Box::pin(async move { self.upsert_branch(&branch) })
    }

    fn update_branch(&self, branch: &Branch) -> BoxFuture<'_, Result<()>> {
        let branch = branch.clone();
        Box::pin(async move { self.upsert_branch(&branch) })
    }

    fn delete_branches(&self, run_id: &RunId, ids: &[BranchId]) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.clone();
        let ids = ids.to_vec();
        Box::pin(async move {
            let conn = self.conn()?;
            for id in &ids {
                conn.execute(
                    "DELETE FROM branches WHERE run_id = ?1 AND id = ?2",
                    params![run_id.as_str(), id.as_str()],
                )
                .map_err(db_err("Failed to delete branch"))?;
            }
            Ok(())
        })
    }

    fn load_branches(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<Branch>>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare("SELECT data FROM branches WHERE run_id = ?1 ORDER BY branch_index")
                .map_err(db_err("Failed to prepare query"))?;
            let rows: Vec<String> = stmt
                .query_map(params![run_id.as_str()], |row| row.get(0))
                .map_err(db_err("Failed to load branches"))?
                .collect::<rusqlite::Result<_>>()
                .map_err(db_err("Failed to load branches"))?;
            rows.iter().map(|r| from_json(r)).collect()
        })
    }
}
