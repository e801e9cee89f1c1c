// Job board: transactional task lifecycle with dependency gating.
//
// A task is available iff it is `open` and every dependency is `done`.
// Claims re-check both inside a BEGIN IMMEDIATE transaction, so two agents
// racing for the same task cannot both win.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, OptionalExtension};

use hive_types::{format_ts, new_id, now, NewTask, Task, TaskEvent, TaskOutcome, TaskStatus};

use crate::audit;
use crate::db::{row_to_task, CoordStore, TASK_COLUMNS};
use crate::error::{CoordError, CoordResult};

/// Age past which an assigned or in-progress task counts as stale.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone)]
pub struct JobBoard {
    store: Arc<CoordStore>,
}

impl JobBoard {
    pub fn new(store: Arc<CoordStore>) -> Self {
        Self { store }
    }

    /// Create an open task. Fails with `InvalidTask` on empty required
    /// fields or a self-dependency.
    pub async fn create(&self, creator: &str, task: NewTask) -> CoordResult<String> {
        if task.title.trim().is_empty() {
            return Err(CoordError::InvalidTask("title is required".to_string()));
        }
        if task.description.trim().is_empty() {
            return Err(CoordError::InvalidTask(
                "description is required".to_string(),
            ));
        }

        let task_id = task.task_id.clone().unwrap_or_else(new_id);
        if task.depends_on.iter().any(|dep| dep == &task_id) {
            return Err(CoordError::InvalidTask(
                "task cannot depend on itself".to_string(),
            ));
        }
        let seen: HashSet<&String> = task.depends_on.iter().collect();
        if seen.len() != task.depends_on.len() {
            return Err(CoordError::InvalidTask(
                "duplicate dependency".to_string(),
            ));
        }

        let creator = creator.to_string();
        let created = now();
        let history = vec![TaskEvent {
            at: created,
            agent: Some(creator.clone()),
            note: "created".to_string(),
        }];
        let id_for_insert = task_id.clone();

        self.store
            .with_write(move |tx| {
                let exists: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM tasks WHERE task_id = ?1",
                    params![id_for_insert],
                    |row| row.get(0),
                )?;
                if exists > 0 {
                    return Err(CoordError::InvalidTask(format!(
                        "task id {id_for_insert} already exists"
                    )));
                }
                tx.execute(
                    "INSERT INTO tasks (
                        task_id, title, description, priority, status, assignee,
                        created_at, started_at, completed_at, depends_on, history, result, error
                     ) VALUES (?1, ?2, ?3, ?4, 'open', NULL, ?5, NULL, NULL, ?6, ?7, NULL, NULL)",
                    params![
                        id_for_insert,
                        task.title,
                        task.description,
                        task.priority.unwrap_or(5),
                        format_ts(&created),
                        serde_json::to_string(&task.depends_on)?,
                        serde_json::to_string(&history)?,
                    ],
                )?;
                audit::append(
                    tx,
                    &creator,
                    "task.create",
                    &format!("{id_for_insert}: {}", task.title),
                )?;
                Ok(())
            })
            .await?;
        Ok(task_id)
    }

    pub async fn get(&self, task_id: &str) -> CoordResult<Task> {
        let task_id = task_id.to_string();
        self.store
            .read(move |conn| {
                fetch_task(conn, &task_id)?.ok_or_else(|| CoordError::NotFound(task_id.clone()))
            })
            .await
    }

    /// Open tasks whose dependencies are all done, highest priority first,
    /// ties broken by creation time. Blocked tasks never appear here.
    pub async fn available(&self, agent: Option<&str>) -> CoordResult<Vec<Task>> {
        let agent = agent.map(|a| a.to_string());
        self.store
            .read(move |conn| {
                let sql = format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'open'
                     ORDER BY priority DESC, created_at ASC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let open = stmt
                    .query_map([], row_to_task)?
                    .collect::<Result<Vec<_>, _>>()?;

                let dep_ids: Vec<String> = open
                    .iter()
                    .flat_map(|t| t.depends_on.iter().cloned())
                    .collect::<HashSet<_>>()
                    .into_iter()
                    .collect();
                let dep_status = task_statuses(conn, &dep_ids)?;

                Ok(open
                    .into_iter()
                    .filter(|task| {
                        task.depends_on.iter().all(|dep| {
                            dep_status.get(dep).copied() == Some(TaskStatus::Done)
                        })
                    })
                    .filter(|task| match (&agent, &task.assignee) {
                        (Some(me), Some(assignee)) => assignee == me,
                        _ => true,
                    })
                    .collect())
            })
            .await
    }

    /// Atomically claim an open task for `agent`. Distinguishes why a claim
    /// failed: `NotFound`, `AlreadyClaimed`, or `DependenciesUnmet` with the
    /// offending task IDs.
    pub async fn claim(&self, agent: &str, task_id: &str) -> CoordResult<Task> {
        let agent = agent.to_string();
        let task_id = task_id.to_string();
        self.store
            .with_write(move |tx| {
                let mut task = fetch_task(tx, &task_id)?
                    .ok_or_else(|| CoordError::NotFound(task_id.clone()))?;
                if task.status != TaskStatus::Open {
                    return Err(CoordError::AlreadyClaimed(task_id.clone()));
                }

                let dep_status = task_statuses(tx, &task.depends_on)?;
                let unmet: Vec<String> = task
                    .depends_on
                    .iter()
                    .filter(|dep| dep_status.get(*dep).copied() != Some(TaskStatus::Done))
                    .cloned()
                    .collect();
                if !unmet.is_empty() {
                    return Err(CoordError::DependenciesUnmet(unmet));
                }

                let started = now();
                task.status = TaskStatus::Assigned;
                task.assignee = Some(agent.clone());
                task.started_at = Some(started);
                task.history.push(TaskEvent {
                    at: started,
                    agent: Some(agent.clone()),
                    note: "claimed".to_string(),
                });

                tx.execute(
                    "UPDATE tasks
                     SET status = 'assigned', assignee = ?2, started_at = ?3, history = ?4
                     WHERE task_id = ?1",
                    params![
                        task_id,
                        agent,
                        format_ts(&started),
                        serde_json::to_string(&task.history)?,
                    ],
                )?;
                audit::append(tx, &agent, "task.claim", &task_id)?;
                Ok(task)
            })
            .await
    }

    /// Move a claimed task between working states. Permitted transitions:
    /// `assigned -> in-progress`, `in-progress -> blocked`,
    /// `blocked -> in-progress`.
    pub async fn update(
        &self,
        agent: &str,
        task_id: &str,
        new_status: TaskStatus,
    ) -> CoordResult<Task> {
        let agent = agent.to_string();
        let task_id = task_id.to_string();
        self.store
            .with_write(move |tx| {
                let mut task = fetch_task(tx, &task_id)?
                    .ok_or_else(|| CoordError::NotFound(task_id.clone()))?;

                let permitted = matches!(
                    (task.status, new_status),
                    (TaskStatus::Assigned, TaskStatus::InProgress)
                        | (TaskStatus::InProgress, TaskStatus::Blocked)
                        | (TaskStatus::Blocked, TaskStatus::InProgress)
                );
                if !permitted {
                    return Err(CoordError::InvalidTransition {
                        from: task.status.as_str().to_string(),
                        to: new_status.as_str().to_string(),
                    });
                }
                if task.status == TaskStatus::Assigned
                    && task.assignee.as_deref() != Some(agent.as_str())
                {
                    return Err(CoordError::NotEligible(agent.clone()));
                }

                // Blocked tasks carry no assignee; whoever resumes one takes it.
                task.assignee = match new_status {
                    TaskStatus::Blocked => None,
                    _ => Some(agent.clone()),
                };
                task.status = new_status;
                task.history.push(TaskEvent {
                    at: now(),
                    agent: Some(agent.clone()),
                    note: format!("-> {new_status}"),
                });

                tx.execute(
                    "UPDATE tasks SET status = ?2, assignee = ?3, history = ?4 WHERE task_id = ?1",
                    params![
                        task_id,
                        new_status.as_str(),
                        task.assignee,
                        serde_json::to_string(&task.history)?,
                    ],
                )?;
                audit::append(
                    tx,
                    &agent,
                    "task.update",
                    &format!("{task_id} -> {new_status}"),
                )?;
                Ok(task)
            })
            .await
    }

    /// Terminate an in-progress task. Completing a task as done makes any
    /// dependent task visible in the next `available` scan; no push occurs.
    pub async fn complete(
        &self,
        agent: &str,
        task_id: &str,
        outcome: TaskOutcome,
    ) -> CoordResult<Task> {
        let agent = agent.to_string();
        let task_id = task_id.to_string();
        self.store
            .with_write(move |tx| {
                let mut task = fetch_task(tx, &task_id)?
                    .ok_or_else(|| CoordError::NotFound(task_id.clone()))?;
                if task.status != TaskStatus::InProgress {
                    return Err(CoordError::InvalidTransition {
                        from: task.status.as_str().to_string(),
                        to: match outcome {
                            TaskOutcome::Success { .. } => "done".to_string(),
                            TaskOutcome::Failure { .. } => "failed".to_string(),
                        },
                    });
                }

                let completed = now();
                let (status, result, error, note) = match &outcome {
                    TaskOutcome::Success { result } => (
                        TaskStatus::Done,
                        Some(result.clone()),
                        None,
                        format!("done: {result}"),
                    ),
                    TaskOutcome::Failure { error } => (
                        TaskStatus::Failed,
                        None,
                        Some(error.clone()),
                        format!("failed: {error}"),
                    ),
                };
                task.status = status;
                task.completed_at = Some(completed);
                task.result = result.clone();
                task.error = error.clone();
                task.history.push(TaskEvent {
                    at: completed,
                    agent: Some(agent.clone()),
                    note,
                });

                tx.execute(
                    "UPDATE tasks
                     SET status = ?2, completed_at = ?3, result = ?4, error = ?5, history = ?6
                     WHERE task_id = ?1",
                    params![
                        task_id,
                        status.as_str(),
                        format_ts(&completed),
                        result,
                        error,
                        serde_json::to_string(&task.history)?,
                    ],
                )?;
                audit::append(
                    tx,
                    &agent,
                    "task.complete",
                    &format!("{task_id} -> {status}"),
                )?;
                Ok(task)
            })
            .await
    }

    /// Assigned or in-progress tasks whose work started longer ago than
    /// `threshold`. Detection only; reassignment is an explicit operator
    /// call to [`JobBoard::release`].
    pub async fn stale(&self, threshold: Duration) -> CoordResult<Vec<Task>> {
        let cutoff = now()
            - chrono::Duration::from_std(threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));
        let cutoff_s = format_ts(&cutoff);
        self.store
            .read(move |conn| {
                let sql = format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE status IN ('assigned', 'in-progress')
                       AND started_at IS NOT NULL AND started_at < ?1
                     ORDER BY started_at ASC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let tasks = stmt
                    .query_map(params![cutoff_s], row_to_task)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(tasks)
            })
            .await
    }

    /// Operator reset of a stuck task back to open so another agent can
    /// claim it.
    pub async fn release(&self, operator: &str, task_id: &str, note: &str) -> CoordResult<Task> {
        let operator = operator.to_string();
        let task_id = task_id.to_string();
        let note = note.to_string();
        self.store
            .with_write(move |tx| {
                let mut task = fetch_task(tx, &task_id)?
                    .ok_or_else(|| CoordError::NotFound(task_id.clone()))?;
                if !matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) {
                    return Err(CoordError::InvalidTransition {
                        from: task.status.as_str().to_string(),
                        to: "open".to_string(),
                    });
                }

                task.status = TaskStatus::Open;
                task.assignee = None;
                task.started_at = None;
                task.history.push(TaskEvent {
                    at: now(),
                    agent: Some(operator.clone()),
                    note: format!("released: {note}"),
                });

                tx.execute(
                    "UPDATE tasks
                     SET status = 'open', assignee = NULL, started_at = NULL, history = ?2
                     WHERE task_id = ?1",
                    params![task_id, serde_json::to_string(&task.history)?],
                )?;
                audit::append(tx, &operator, "task.release", &task_id)?;
                Ok(task)
            })
            .await
    }
}

fn fetch_task(conn: &rusqlite::Connection, task_id: &str) -> CoordResult<Option<Task>> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1");
    Ok(conn
        .query_row(&sql, params![task_id], row_to_task)
        .optional()?)
}

/// Statuses for a set of task IDs; absent IDs are simply missing from the map.
fn task_statuses(
    conn: &rusqlite::Connection,
    ids: &[String],
) -> CoordResult<HashMap<String, TaskStatus>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let placeholders = (1..=ids.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("SELECT task_id, status FROM tasks WHERE task_id IN ({placeholders})");
    let values: Vec<SqlValue> = ids.iter().map(|id| SqlValue::Text(id.clone())).collect();

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(values.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = HashMap::with_capacity(rows.len());
    for (id, status_raw) in rows {
        if let Some(status) = TaskStatus::parse(&status_raw) {
            out.insert(id, status);
        }
    }
    Ok(out)
}
