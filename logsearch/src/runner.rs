use crate::metrics_defs::{
    LOG_PREVIEW_ROWS, LOG_TASK_DURATION, LOG_TASKS_COMPLETED, LOG_TASKS_RUNNING, LOG_TASKS_STARTED,
};
use crate::model::{
    LogMessage, PreviewRow, SearchLogRequest, TASK_MAX_PREVIEW_LINES, Task, TaskState,
};
use crate::rpc::{LogStream, LogStreamClient, RpcError};
use crate::store::{StoreError, TaskStore};
use chrono::{DateTime, SecondsFormat};
use futures::StreamExt;
use shared::errors::chain_message;
use shared::{counter, gauge, histogram};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

pub const CANCELED_ERROR: &str = "canceled";

/// Batches buffered between the stream and the bundle writer.
const BUNDLE_QUEUE_BATCHES: usize = 16;

#[derive(thiserror::Error, Debug)]
enum RunError {
    #[error("could not write log bundle")]
    Io(#[from] std::io::Error),
    #[error("could not write log bundle")]
    Zip(#[from] zip::result::ZipError),
    #[error("could not search logs")]
    Rpc(#[from] RpcError),
    #[error("could not persist task progress")]
    Store(#[from] StoreError),
    #[error("log bundle writer stopped")]
    WriterStopped,
    #[error("log bundle writer panicked")]
    Join(#[from] tokio::task::JoinError),
}

enum Outcome {
    Finished,
    Canceled,
}

/// Runs one log search task: streams the node's logs into a zip bundle and
/// keeps the first lines as preview rows.
#[derive(Clone)]
pub struct TaskRunner {
    store: TaskStore,
    client: Arc<dyn LogStreamClient>,
    log_dir: PathBuf,
}

impl TaskRunner {
    pub fn new(store: TaskStore, client: Arc<dyn LogStreamClient>, log_dir: PathBuf) -> Self {
        TaskRunner {
            store,
            client,
            log_dir,
        }
    }

    /// Runs the task to completion and returns the state it was left in.
    pub async fn run(
        &self,
        task: &Task,
        request: &SearchLogRequest,
        cancel: &CancellationToken,
    ) -> TaskState {
        let started = Instant::now();
        counter!(LOG_TASKS_STARTED, "node_kind" => task.target.kind.as_str()).increment(1);
        gauge!(LOG_TASKS_RUNNING).increment(1);

        let result = match self.store.mark_task_started(task.id).await {
            Ok(_) => self.search(task, request, cancel).await,
            Err(e) => Err(e.into()),
        };

        let (state, error) = match result {
            Ok(Outcome::Finished) => (TaskState::Finished, None),
            Ok(Outcome::Canceled) => (TaskState::Canceled, Some(CANCELED_ERROR.to_string())),
            Err(e) if cancel.is_cancelled() => (TaskState::Canceled, Some(chain_message(&e))),
            Err(e) => (TaskState::Error, Some(chain_message(&e))),
        };

        match &error {
            Some(error) if state == TaskState::Error => tracing::warn!(
                task_id = task.id,
                target = %task.target.address(),
                %error,
                "log search task failed"
            ),
            _ => tracing::info!(
                task_id = task.id,
                target = %task.target.address(),
                state = state.as_str(),
                "log search task stopped"
            ),
        }

        if let Err(e) = self
            .store
            .mark_task_done(task.id, state, error.as_deref())
            .await
        {
            tracing::error!(task_id = task.id, error = %chain_message(&e), "could not persist task state");
        }

        gauge!(LOG_TASKS_RUNNING).decrement(1);
        counter!(LOG_TASKS_COMPLETED, "state" => state.as_str()).increment(1);
        histogram!(LOG_TASK_DURATION, "state" => state.as_str())
            .record(started.elapsed().as_secs_f64());
        state
    }

    async fn search(
        &self,
        task: &Task,
        request: &SearchLogRequest,
        cancel: &CancellationToken,
    ) -> Result<Outcome, RunError> {
        let dir = self.log_dir.join(task.task_group_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(task.target.bundle_filename());
        let file = tokio::fs::File::create(&path).await?.into_std().await;
        self.store
            .set_task_log_path(task.id, &path.to_string_lossy())
            .await?;

        let entry = format!("{}.log", task.target.kind);
        let (bundle, batches) = mpsc::channel(BUNDLE_QUEUE_BATCHES);
        let writer = tokio::task::spawn_blocking(move || write_bundle(file, &entry, batches));

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            stream = self.client.search(&task.target, request) => Some(stream),
        };
        let outcome = match opened {
            None => Ok(Outcome::Canceled),
            Some(Err(e)) => Err(e.into()),
            Some(Ok(stream)) => self.pump(task, stream, &bundle, cancel).await,
        };

        // Closing the queue lets the writer finish the archive whatever happened
        // to the stream.
        drop(bundle);
        match (outcome, writer.await?) {
            (Err(RunError::WriterStopped), Err(e)) => Err(e),
            (outcome, written) => {
                let outcome = outcome?;
                written?;
                Ok(outcome)
            }
        }
    }

    async fn pump(
        &self,
        task: &Task,
        mut stream: LogStream,
        bundle: &mpsc::Sender<Vec<LogMessage>>,
        cancel: &CancellationToken,
    ) -> Result<Outcome, RunError> {
        let mut previews_left = TASK_MAX_PREVIEW_LINES;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Outcome::Canceled),
                next = stream.next() => next,
            };
            let Some(batch) = next else {
                return Ok(Outcome::Finished);
            };
            let batch = batch?;

            let rows: Vec<PreviewRow> = batch
                .iter()
                .take(previews_left)
                .map(|m| PreviewRow {
                    task_id: task.id,
                    task_group_id: task.task_group_id,
                    time: m.time,
                    level: m.level,
                    message: m.message.clone(),
                })
                .collect();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Outcome::Canceled),
                sent = bundle.send(batch) => sent.map_err(|_| RunError::WriterStopped)?,
            }

            if !rows.is_empty() {
                self.store.insert_previews(&rows).await?;
                previews_left -= rows.len();
                counter!(LOG_PREVIEW_ROWS).increment(rows.len() as u64);
            }
        }
    }
}

/// Compresses queued batches into a single-entry archive until the queue closes.
/// Runs on a blocking thread.
fn write_bundle(
    file: File,
    entry: &str,
    mut batches: mpsc::Receiver<Vec<LogMessage>>,
) -> Result<(), RunError> {
    let mut bundle = ZipWriter::new(file);
    bundle.start_file(
        entry,
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated),
    )?;

    let mut written = Ok(());
    while let Some(batch) = batches.blocking_recv() {
        written = batch
            .iter()
            .try_for_each(|message| write_line(&mut bundle, message))
            .and_then(|()| bundle.flush());
        if written.is_err() {
            break;
        }
    }
    batches.close();

    let closed = bundle.finish();
    written?;
    closed?;
    Ok(())
}

fn format_time(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| millis.to_string())
}

fn write_line(out: &mut impl Write, message: &LogMessage) -> std::io::Result<()> {
    writeln!(
        out,
        "[{}] [{}] {}",
        format_time(message.time),
        message.level,
        message.message
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LogLevel, Target};
    use crate::rpc::tests::{FakeLogStreamClient, Script};
    use crate::store::tests::{memory_store, request, target};
    use std::io::Read;
    use topology::types::NodeKind;

    async fn setup(targets: &[Target]) -> (TaskStore, Vec<Task>, tempfile::TempDir) {
        let store = memory_store().await;
        let (_, tasks) = store.create_group(&request(), targets).await.unwrap();
        (store, tasks, tempfile::tempdir().unwrap())
    }

    fn read_bundle(path: &str, entry: &str) -> String {
        let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut file = archive.by_name(entry).unwrap();
        let mut content = String::new();
        file.read_to_string(&mut content).unwrap();
        content
    }

    #[test]
    fn test_line_format() {
        let mut out = Vec::new();
        write_line(
            &mut out,
            &LogMessage {
                time: 1_700_000_000_123,
                level: LogLevel::Warn,
                message: "disk almost full".into(),
            },
        )
        .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "[2023-11-14T22:13:20.123Z] [WARN] disk almost full\n"
        );
    }

    #[tokio::test]
    async fn test_run_to_completion() {
        let kv = target(NodeKind::Kv, "10.0.0.2", 20160);
        let (store, tasks, dir) = setup(std::slice::from_ref(&kv)).await;
        let client = Arc::new(FakeLogStreamClient::default());
        client.script(&kv, Script::Lines { count: 700, batch: 64 });

        let runner = TaskRunner::new(store.clone(), client, dir.path().to_path_buf());
        let state = runner
            .run(&tasks[0], &request(), &CancellationToken::new())
            .await;
        assert_eq!(state, TaskState::Finished);

        let task = store.get_task(tasks[0].id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Finished);
        assert!(task.started_at.is_some() && task.finished_at.is_some());

        let previews = store.list_previews(task.id, 1000).await.unwrap();
        assert_eq!(previews.len(), TASK_MAX_PREVIEW_LINES);

        let path = task.log_store_path.unwrap();
        assert!(path.ends_with(&format!("{}/10.0.0.2-20160.zip", task.task_group_id)));
        let content = read_bundle(&path, "kv.log");
        assert_eq!(content.lines().count(), 700);
        assert!(content.lines().last().unwrap().ends_with("line 699"));
    }

    #[tokio::test]
    async fn test_stream_error_keeps_previews() {
        let sql = target(NodeKind::Sql, "10.0.0.1", 4000);
        let (store, tasks, dir) = setup(std::slice::from_ref(&sql)).await;
        let client = Arc::new(FakeLogStreamClient::default());
        client.script(&sql, Script::FailAfter(2));

        let runner = TaskRunner::new(store.clone(), client, dir.path().to_path_buf());
        let state = runner
            .run(&tasks[0], &request(), &CancellationToken::new())
            .await;
        assert_eq!(state, TaskState::Error);

        let task = store.get_task(tasks[0].id).await.unwrap().unwrap();
        let error = task.error.unwrap();
        assert!(error.contains("node went away"), "{error}");
        assert_eq!(store.list_previews(task.id, 1000).await.unwrap().len(), 2);

        // The partial bundle is still a readable archive
        let content = read_bundle(&task.log_store_path.unwrap(), "sql.log");
        assert_eq!(content.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_cancel_hanging_stream() {
        let kv = target(NodeKind::Kv, "10.0.0.2", 20160);
        let (store, tasks, dir) = setup(std::slice::from_ref(&kv)).await;
        let client = Arc::new(FakeLogStreamClient::default());
        client.script(&kv, Script::Hang);

        let runner = TaskRunner::new(store.clone(), client, dir.path().to_path_buf());
        let cancel = CancellationToken::new();
        let task = tasks[0].clone();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { runner.run(&task, &request(), &cancel).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        let state = handle.await.unwrap();
        assert_eq!(state, TaskState::Canceled);

        let task = store.get_task(tasks[0].id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Canceled);
        assert_eq!(task.error.as_deref(), Some(CANCELED_ERROR));
    }

    #[tokio::test]
    async fn test_cancel_busy_stream() {
        let kv = target(NodeKind::Kv, "10.0.0.2", 20160);
        let (store, tasks, dir) = setup(std::slice::from_ref(&kv)).await;
        let client = Arc::new(FakeLogStreamClient::default());
        client.script(&kv, Script::Endless { batch: 256 });

        let runner = TaskRunner::new(store.clone(), client, dir.path().to_path_buf());
        let cancel = CancellationToken::new();
        let task = tasks[0].clone();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { runner.run(&task, &request(), &cancel).await })
        };

        // Timers still fire on the single test thread while the bundle is written.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        cancel.cancel();
        let state = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("runner stops promptly")
            .unwrap();
        assert_eq!(state, TaskState::Canceled);

        let task = store.get_task(tasks[0].id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Canceled);
        assert_eq!(
            store.list_previews(task.id, 1000).await.unwrap().len(),
            TASK_MAX_PREVIEW_LINES
        );

        let content = read_bundle(&task.log_store_path.unwrap(), "kv.log");
        assert!(content.lines().count() >= TASK_MAX_PREVIEW_LINES);
        assert!(content.starts_with("[2023-11-14T22:13:20.000Z] [INFO] 10.0.0.2:20160 line 0\n"));
    }

    #[tokio::test]
    async fn test_unreachable_node() {
        let kv = target(NodeKind::Kv, "10.0.0.9", 20160);
        let (store, tasks, dir) = setup(std::slice::from_ref(&kv)).await;
        let client = Arc::new(FakeLogStreamClient::default());
        client.script(&kv, Script::Unreachable);

        let runner = TaskRunner::new(store.clone(), client, dir.path().to_path_buf());
        let state = runner
            .run(&tasks[0], &request(), &CancellationToken::new())
            .await;
        assert_eq!(state, TaskState::Error);
        assert!(store.list_previews(tasks[0].id, 10).await.unwrap().is_empty());
    }
}
