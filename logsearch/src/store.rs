//! Durable storage of task groups, tasks and preview lines.

use crate::model::{
    GroupState, LogLevel, ParseStateError, PreviewRow, SearchLogRequest, Target, TargetStats, Task,
    TaskGroup, TaskGroupId, TaskId, TaskState, now_millis,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS task_group (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    search_request TEXT NOT NULL,
    state TEXT NOT NULL,
    target_stats TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS task (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_group_id INTEGER NOT NULL,
    target TEXT NOT NULL,
    state TEXT NOT NULL,
    error TEXT,
    log_store_path TEXT,
    slow_log_store_path TEXT,
    started_at INTEGER,
    finished_at INTEGER
);

CREATE INDEX IF NOT EXISTS task_group_state_idx ON task(task_group_id, state);

CREATE TABLE IF NOT EXISTS preview (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL,
    task_group_id INTEGER NOT NULL,
    time INTEGER NOT NULL,
    level INTEGER NOT NULL,
    message TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS preview_task_time_idx ON preview(task_id, time);
CREATE INDEX IF NOT EXISTS preview_group_idx ON preview(task_group_id);
"#;

pub const RESTART_ERROR: &str = "aborted by service restart";

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("database error")]
    Sqlx(#[from] sqlx::Error),
    #[error("could not encode or decode a stored column")]
    Json(#[from] serde_json::Error),
    #[error("invalid stored state")]
    State(#[from] ParseStateError),
}

/// Result of the startup pass that clears state left behind by a crash.
#[derive(Debug, Default, PartialEq)]
pub struct Recovered {
    pub tasks: u64,
    pub groups: u64,
}

#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    /// Wraps the pool and makes sure the tables exist.
    pub async fn new(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(TaskStore { pool })
    }

    /// Rewrites rows that were running when the process stopped. Must run before
    /// the scheduler accepts requests.
    pub async fn recover_interrupted(&self) -> Result<Recovered, StoreError> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        let tasks = sqlx::query(
            "UPDATE task SET state = ?, error = ?, finished_at = ? WHERE state = ?",
        )
        .bind(TaskState::Canceled.as_str())
        .bind(RESTART_ERROR)
        .bind(now)
        .bind(TaskState::Running.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let groups = sqlx::query("UPDATE task_group SET state = ? WHERE state = ?")
            .bind(GroupState::Finished.as_str())
            .bind(GroupState::Running.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(Recovered { tasks, groups })
    }

    /// Persists a running group with one running task per target.
    pub async fn create_group(
        &self,
        request: &SearchLogRequest,
        targets: &[Target],
    ) -> Result<(TaskGroup, Vec<Task>), StoreError> {
        let created_at = now_millis();
        let target_stats = TargetStats::from_targets(targets);
        let mut tx = self.pool.begin().await?;

        let group_id: i64 = sqlx::query(
            "INSERT INTO task_group (search_request, state, target_stats, created_at)
             VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(serde_json::to_string(request)?)
        .bind(GroupState::Running.as_str())
        .bind(serde_json::to_string(&target_stats)?)
        .bind(created_at)
        .fetch_one(&mut *tx)
        .await?
        .try_get("id")?;

        let mut tasks = Vec::with_capacity(targets.len());
        for target in targets {
            let task_id: i64 = sqlx::query(
                "INSERT INTO task (task_group_id, target, state) VALUES (?, ?, ?) RETURNING id",
            )
            .bind(group_id)
            .bind(serde_json::to_string(target)?)
            .bind(TaskState::Running.as_str())
            .fetch_one(&mut *tx)
            .await?
            .try_get("id")?;

            tasks.push(Task {
                id: task_id,
                task_group_id: group_id,
                target: target.clone(),
                state: TaskState::Running,
                error: None,
                log_store_path: None,
                slow_log_store_path: None,
                started_at: None,
                finished_at: None,
            });
        }

        tx.commit().await?;

        let group = TaskGroup {
            id: group_id,
            search_request: request.clone(),
            state: GroupState::Running,
            target_stats,
            created_at,
        };
        Ok((group, tasks))
    }

    pub async fn get_group(&self, id: TaskGroupId) -> Result<Option<TaskGroup>, StoreError> {
        let row = sqlx::query("SELECT * FROM task_group WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(group_from_row).transpose()
    }

    /// All groups, newest first.
    pub async fn list_groups(&self) -> Result<Vec<TaskGroup>, StoreError> {
        let rows = sqlx::query("SELECT * FROM task_group ORDER BY id DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(group_from_row).collect()
    }

    pub async fn set_group_state(
        &self,
        id: TaskGroupId,
        state: GroupState,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE task_group SET state = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_tasks(&self, group_id: TaskGroupId) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query("SELECT * FROM task WHERE task_group_id = ? ORDER BY id")
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    #[cfg(test)]
    pub(crate) async fn list_tasks_in_state(
        &self,
        group_id: TaskGroupId,
        state: TaskState,
    ) -> Result<Vec<Task>, StoreError> {
        let rows =
            sqlx::query("SELECT * FROM task WHERE task_group_id = ? AND state = ? ORDER BY id")
                .bind(group_id)
                .bind(state.as_str())
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(task_from_row).collect()
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query("SELECT * FROM task WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    /// Marks a task as (re)started and drops previews from an earlier run.
    pub async fn mark_task_started(&self, id: TaskId) -> Result<i64, StoreError> {
        let started_at = now_millis();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE task SET state = ?, error = NULL, started_at = ?, finished_at = NULL
             WHERE id = ?",
        )
        .bind(TaskState::Running.as_str())
        .bind(started_at)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM preview WHERE task_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(started_at)
    }

    pub async fn set_task_log_path(&self, id: TaskId, path: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE task SET log_store_path = ? WHERE id = ?")
            .bind(path)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_task_done(
        &self,
        id: TaskId,
        state: TaskState,
        error: Option<&str>,
    ) -> Result<i64, StoreError> {
        let finished_at = now_millis();
        sqlx::query("UPDATE task SET state = ?, error = ?, finished_at = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(error)
            .bind(finished_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(finished_at)
    }

    /// Moves the group's errored tasks back to running and returns them.
    pub async fn reset_failed_tasks(&self, group_id: TaskGroupId) -> Result<Vec<Task>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "UPDATE task SET state = ?, error = NULL, finished_at = NULL
             WHERE task_group_id = ? AND state = ? RETURNING *",
        )
        .bind(TaskState::Running.as_str())
        .bind(group_id)
        .bind(TaskState::Error.as_str())
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut tasks = rows.iter().map(task_from_row).collect::<Result<Vec<_>, _>>()?;
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    pub async fn insert_previews(&self, rows: &[PreviewRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                "INSERT INTO preview (task_id, task_group_id, time, level, message)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(row.task_id)
            .bind(row.task_group_id)
            .bind(row.time)
            .bind(i64::from(row.level.as_u8()))
            .bind(&row.message)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Preview lines of one task in time order, in insertion order for equal times.
    pub async fn list_previews(
        &self,
        task_id: TaskId,
        limit: usize,
    ) -> Result<Vec<PreviewRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT task_id, task_group_id, time, level, message FROM preview
             WHERE task_id = ? ORDER BY time, id LIMIT ?",
        )
        .bind(task_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(preview_from_row).collect()
    }

    pub async fn count_previews(&self, group_id: TaskGroupId) -> Result<i64, StoreError> {
        let count = sqlx::query("SELECT COUNT(*) AS n FROM preview WHERE task_group_id = ?")
            .bind(group_id)
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;
        Ok(count)
    }

    /// Removes the group with its tasks and previews.
    pub async fn delete_group(&self, id: TaskGroupId) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for statement in [
            "DELETE FROM preview WHERE task_group_id = ?",
            "DELETE FROM task WHERE task_group_id = ?",
            "DELETE FROM task_group WHERE id = ?",
        ] {
            sqlx::query(statement).bind(id).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn group_from_row(row: &SqliteRow) -> Result<TaskGroup, StoreError> {
    Ok(TaskGroup {
        id: row.try_get("id")?,
        search_request: serde_json::from_str(row.try_get("search_request")?)?,
        state: row.try_get::<&str, _>("state")?.parse()?,
        target_stats: serde_json::from_str(row.try_get("target_stats")?)?,
        created_at: row.try_get("created_at")?,
    })
}

fn task_from_row(row: &SqliteRow) -> Result<Task, StoreError> {
    Ok(Task {
        id: row.try_get("id")?,
        task_group_id: row.try_get("task_group_id")?,
        target: serde_json::from_str(row.try_get("target")?)?,
        state: row.try_get::<&str, _>("state")?.parse()?,
        error: row.try_get("error")?,
        log_store_path: row.try_get("log_store_path")?,
        slow_log_store_path: row.try_get("slow_log_store_path")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

fn preview_from_row(row: &SqliteRow) -> Result<PreviewRow, StoreError> {
    let level: i64 = row.try_get("level")?;
    Ok(PreviewRow {
        task_id: row.try_get("task_id")?,
        task_group_id: row.try_get("task_group_id")?,
        time: row.try_get("time")?,
        level: LogLevel::from_u8(u8::try_from(level).unwrap_or(0)),
        message: row.try_get("message")?,
    })
}
