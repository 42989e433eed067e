//! Durable log on the local filesystem.
//!
//! Layout: `<root>/<topic>/<partition>.log`, one JSON line per record. The
//! line number is the offset. Appends go through one writer per partition
//! and are synced before returning. Consumers tail the file and are woken
//! by local appends or, for appends made by another process sharing the
//! directory, by filesystem notifications.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

use super::{LogBroker, LogPosition, LogRecord, LogStream, StartOffset};
use crate::error::{RelayError, Result};

/// On-disk shape of one record.
#[derive(Serialize, Deserialize)]
struct StoredRecord {
    key: String,
    payload: String,
    timestamp: DateTime<Utc>,
}

struct PartitionWriter {
    file: File,
    next_offset: u64,
}

pub struct FileLog {
    root: PathBuf,
    partitions: u32,
    writers: parking_lot::Mutex<HashMap<(String, u32), Arc<Mutex<Option<PartitionWriter>>>>>,
    appended: Arc<Notify>,
    closed: watch::Sender<bool>,
    watcher: parking_lot::Mutex<Option<RecommendedWatcher>>,
}

impl FileLog {
    pub async fn open(root: impl Into<PathBuf>, partitions: u32) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let appended = Arc::new(Notify::new());
        let watcher = match watch_dir(&root, appended.clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("[Log] no file watcher on {:?}, cross-process appends wake on local activity only: {}", root, e);
                None
            }
        };

        let (closed, _) = watch::channel(false);
        info!("[Log] file log at {:?} with {} partitions", root, partitions);

        Ok(Self {
            root,
            partitions: partitions.max(1),
            writers: parking_lot::Mutex::new(HashMap::new()),
            appended,
            closed,
            watcher: parking_lot::Mutex::new(watcher),
        })
    }

    fn partition_path(&self, topic: &str, partition: u32) -> PathBuf {
        self.root.join(topic).join(format!("{partition}.log"))
    }

    fn writer_slot(&self, topic: &str, partition: u32) -> Arc<Mutex<Option<PartitionWriter>>> {
        self.writers
            .lock()
            .entry((topic.to_string(), partition))
            .or_default()
            .clone()
    }

    fn check_partition(&self, partition: u32) -> Result<()> {
        if partition >= self.partitions {
            return Err(RelayError::Backend(format!(
                "partition {partition} out of range (0..{})",
                self.partitions
            )));
        }
        Ok(())
    }
}

fn watch_dir(root: &Path, appended: Arc<Notify>) -> Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                appended.notify_waiters();
            }
        }
        Err(e) => warn!("[Log] file watcher error: {}", e),
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok(watcher)
}

async fn count_lines(path: &Path) -> Result<u64> {
    match fs::read(path).await {
        Ok(data) => Ok(data.iter().filter(|b| **b == b'\n').count() as u64),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

async fn open_for_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path).await?)
}

fn decode_line(topic: &str, partition: u32, offset: u64, line: &str) -> Result<LogRecord> {
    let stored: StoredRecord = serde_json::from_str(line.trim_end())?;
    let key = STANDARD
        .decode(stored.key)
        .map_err(|e| RelayError::Backend(format!("bad key at {topic}/{partition}@{offset}: {e}")))?;
    let payload = STANDARD
        .decode(stored.payload)
        .map_err(|e| RelayError::Backend(format!("bad payload at {topic}/{partition}@{offset}: {e}")))?;
    Ok(LogRecord {
        topic: topic.to_string(),
        partition,
        offset,
        key: Bytes::from(key),
        payload: Bytes::from(payload),
        timestamp: stored.timestamp,
    })
}

#[async_trait]
impl LogBroker for FileLog {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    async fn append(&self, topic: &str, key: &[u8], payload: Bytes) -> Result<LogPosition> {
        if *self.closed.borrow() {
            return Err(RelayError::Backend("log is closed".into()));
        }
        let partition = self.partition_for(key);
        let path = self.partition_path(topic, partition);

        let mut line = serde_json::to_string(&StoredRecord {
            key: STANDARD.encode(key),
            payload: STANDARD.encode(&payload),
            timestamp: Utc::now(),
        })?;
        line.push('\n');

        let slot = self.writer_slot(topic, partition);
        let mut guard = slot.lock().await;
        if guard.is_none() {
            let next_offset = count_lines(&path).await?;
            let file = open_for_append(&path).await?;
            *guard = Some(PartitionWriter { file, next_offset });
        }
        let writer = guard
            .as_mut()
            .ok_or_else(|| RelayError::Internal("partition writer missing".into()))?;

        writer.file.write_all(line.as_bytes()).await?;
        writer.file.sync_data().await?;
        let offset = writer.next_offset;
        writer.next_offset += 1;
        drop(guard);

        self.appended.notify_waiters();
        Ok(LogPosition { partition, offset })
    }

    async fn consume(&self, topic: &str, partition: u32, start: StartOffset) -> Result<LogStream> {
        self.check_partition(partition)?;
        let path = self.partition_path(topic, partition);
        let start = match start {
            StartOffset::Earliest => 0,
            StartOffset::Latest => count_lines(&path).await?,
            StartOffset::At(offset) => offset,
        };
        // make sure there is something to open before any append happens
        drop(open_for_append(&path).await?);

        let file = File::open(&path).await?;
        let appended = self.appended.clone();
        let mut closed = self.closed.subscribe();
        let topic = topic.to_string();
        debug!("[Log] consuming {}/{} from offset {}", topic, partition, start);

        Ok(Box::pin(async_stream::stream! {
            let mut reader = BufReader::new(file);
            let mut line = String::new();
            let mut offset = 0u64;

            loop {
                let woken = appended.notified();
                tokio::pin!(woken);
                woken.as_mut().enable();

                let read = reader.read_line(&mut line).await;
                let complete = match read {
                    Err(e) => {
                        yield Err(RelayError::from(e));
                        break;
                    }
                    Ok(_) => line.ends_with('\n'),
                };

                if !complete {
                    // at EOF, possibly holding half of an in-flight append
                    if *closed.borrow() {
                        break;
                    }
                    tokio::select! {
                        _ = &mut woken => {}
                        changed = closed.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                    continue;
                }

                let current = offset;
                offset += 1;
                let text = std::mem::take(&mut line);
                if current < start {
                    continue;
                }
                yield decode_line(&topic, partition, current, &text);
            }
        }))
    }

    async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        self.watcher.lock().take();

        let slots: Vec<_> = self.writers.lock().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            if let Some(mut writer) = slot.lock().await.take() {
                writer.file.flush().await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let log = FileLog::open(dir.path(), 1).await.unwrap();
            let first = log.append("chat", b"0", Bytes::from_static(b"one")).await.unwrap();
            let second = log.append("chat", b"0", Bytes::from_static(b"two")).await.unwrap();
            assert_eq!((first.offset, second.offset), (0, 1));
            log.close().await.unwrap();
        }

        let log = FileLog::open(dir.path(), 1).await.unwrap();
        let third = log.append("chat", b"0", Bytes::from_static(b"three")).await.unwrap();
        assert_eq!(third.offset, 2);

        let mut stream = log.consume("chat", 0, StartOffset::Earliest).await.unwrap();
        for (offset, expected) in ["one", "two", "three"].into_iter().enumerate() {
            let record = stream.next().await.unwrap().unwrap();
            assert_eq!(record.offset, offset as u64);
            assert_eq!(record.payload, expected);
            assert_eq!(record.key, "0");
        }
    }

    #[tokio::test]
    async fn tailing_consumer_wakes_on_append() {
        let dir = tempdir().unwrap();
        let log = Arc::new(FileLog::open(dir.path(), 1).await.unwrap());
        log.append("chat", b"0", Bytes::from_static(b"history")).await.unwrap();

        let mut stream = log.consume("chat", 0, StartOffset::Latest).await.unwrap();
        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append("chat", b"0", Bytes::from_static(b"live")).await.unwrap();
        });

        let record = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(record.payload, "live");
        assert_eq!(record.offset, 1);
    }

    #[tokio::test]
    async fn corrupt_line_is_reported_not_fatal() {
        let dir = tempdir().unwrap();
        let log = FileLog::open(dir.path(), 1).await.unwrap();
        log.append("chat", b"0", Bytes::from_static(b"good")).await.unwrap();
        log.close().await.unwrap();

        let path = dir.path().join("chat").join("0.log");
        let mut contents = std::fs::read_to_string(&path).unwrap();
        contents.push_str("{ not json\n");
        std::fs::write(&path, contents).unwrap();

        let log = FileLog::open(dir.path(), 1).await.unwrap();
        log.append("chat", b"0", Bytes::from_static(b"after")).await.unwrap();

        let mut stream = log.consume("chat", 0, StartOffset::Earliest).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().payload, "good");
        assert!(stream.next().await.unwrap().is_err());
        assert_eq!(stream.next().await.unwrap().unwrap().payload, "after");
    }
}
