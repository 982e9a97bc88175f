use crate::{
    extract::{FileFormat, SaveAs},
    Record, Task,
};
use lazy_regex::regex;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::Mutex,
};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Durable destination for extracted records.
///
/// Called concurrently from independent tasks, in no particular order.
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    async fn persist(&self, task: &Task, record: &Record, save_as: &SaveAs)
        -> Result<(), SinkError>;

    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Name under which a record is stored: its key field, else the task sequence.
pub fn record_key(task: &Task, record: &Record, save_as: &SaveAs) -> String {
    let key = save_as
        .key_field
        .as_deref()
        .and_then(|field| record.key(field))
        .unwrap_or_else(|| task.seq().to_string());
    regex!(r"[^A-Za-z0-9._-]")
        .replace_all(&key, "_")
        .into_owned()
}

type Appender = Arc<Mutex<BufWriter<File>>>;

/// Writes records under an output directory, one folder or file per pipeline.
pub struct FileSink {
    dir: PathBuf,
    appenders: Mutex<HashMap<PathBuf, Appender>>,
}

impl FileSink {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            appenders: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn appender(&self, path: PathBuf) -> Result<Appender, SinkError> {
        let mut appenders = self.appenders.lock().await;
        if let Some(appender) = appenders.get(&path) {
            return Ok(Arc::clone(appender));
        }
        fs::create_dir_all(&self.dir).await?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        debug!("Open {}", path.display());
        let appender = Arc::new(Mutex::new(BufWriter::new(file)));
        appenders.insert(path, Arc::clone(&appender));
        Ok(appender)
    }
}

#[async_trait::async_trait]
impl Sink for FileSink {
    async fn persist(
        &self,
        task: &Task,
        record: &Record,
        save_as: &SaveAs,
    ) -> Result<(), SinkError> {
        let pipeline = task.pipeline().name();
        match save_as.format {
            FileFormat::Json => {
                let dir = self.dir.join(pipeline);
                fs::create_dir_all(&dir).await?;
                let path = dir.join(format!("{}.json", record_key(task, record, save_as)));
                fs::write(&path, serde_json::to_vec_pretty(record)?).await?;
                debug!("Saved {}", path.display());
            }
            FileFormat::JsonLines => {
                let path = self.dir.join(format!("{}.jsonl", pipeline));
                let mut line = serde_json::to_vec(record)?;
                line.push(b'\n');
                let appender = self.appender(path).await?;
                let mut writer = appender.lock().await;
                writer.write_all(&line).await?;
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        let appenders = self.appenders.lock().await;
        for appender in appenders.values() {
            appender.lock().await.flush().await?;
        }
        Ok(())
    }
}

/// Hands every record to each inner sink in turn.
pub struct MultiSink(pub Vec<Arc<dyn Sink>>);

#[async_trait::async_trait]
impl Sink for MultiSink {
    async fn persist(
        &self,
        task: &Task,
        record: &Record,
        save_as: &SaveAs,
    ) -> Result<(), SinkError> {
        for sink in &self.0 {
            sink.persist(task, record, save_as).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        for sink in &self.0 {
            sink.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PipelineHandle, TaskSpec};
    use pretty_assertions::assert_eq;

    fn task(seq: u64) -> Task {
        Task::new(seq, PipelineHandle::new(1, "details"), TaskSpec::new("u"))
    }

    #[test]
    fn key_falls_back_to_sequence_and_is_path_safe() {
        let keyed = SaveAs::new(FileFormat::Json).keyed_by("map_id");
        let record = Record::new().with("map_id", "koth/../harvest.12");
        assert_eq!(record_key(&task(3), &record, &keyed), "koth_.._harvest.12");
        assert_eq!(record_key(&task(3), &Record::new(), &keyed), "3");
        assert_eq!(
            record_key(&task(9), &record, &SaveAs::new(FileFormat::Json)),
            "9"
        );
    }

    #[tokio::test]
    async fn writes_one_json_file_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path());
        let save_as = SaveAs::new(FileFormat::Json).keyed_by("map_id");
        let record = Record::new().with("map_id", "cp_well.7").with("map_name", "Well");

        sink.persist(&task(0), &record, &save_as).await.unwrap();

        let path = dir.path().join("details").join("cp_well.7.json");
        let saved: Record = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(saved, record);
    }

    #[tokio::test]
    async fn concurrent_appends_stay_line_delimited() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(FileSink::new(dir.path()));
        let save_as = SaveAs::new(FileFormat::JsonLines);

        let writes: Vec<_> = (0..50u64)
            .map(|n| {
                let sink = Arc::clone(&sink);
                let save_as = save_as.clone();
                tokio::spawn(async move {
                    let record = Record::new().with("n", n).with("pad", "x".repeat(512));
                    sink.persist(&task(n), &record, &save_as).await.unwrap();
                })
            })
            .collect();
        for write in writes {
            write.await.unwrap();
        }
        sink.flush().await.unwrap();

        let content = std::fs::read_to_string(dir.path().join("details.jsonl")).unwrap();
        let mut seen: Vec<u64> = content
            .lines()
            .map(|line| {
                let record: Record = serde_json::from_str(line).unwrap();
                record.get("n").and_then(|v| v.as_u64()).unwrap()
            })
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }
}
