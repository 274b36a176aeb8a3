use std::io;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::model::Event;
use crate::wal::Wal;

use super::EngineError;

/// Durable sink for committed event batches.
///
/// `append` must be all-or-nothing per call: either the whole batch is durable or
/// an error is returned and nothing of it will replay.
#[async_trait]
pub trait Journal: Send + Sync {
    async fn append(&self, events: Vec<Event>) -> Result<(), EngineError>;

    /// Replace the log with `events`, the minimal history recreating current state.
    async fn compact(&self, events: Vec<Event>) -> Result<(), EngineError>;

    async fn appends_since_compact(&self) -> u64;
}

enum WalCommand {
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// WAL-backed journal. A background task owns the file and group-commits appends.
pub struct WalJournal {
    tx: mpsc::Sender<WalCommand>,
}

impl WalJournal {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn spawn(wal: Wal) -> Self {
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, rx));
        Self { tx }
    }

    async fn request<T>(
        &self,
        cmd: WalCommand,
        rx: oneshot::Receiver<io::Result<T>>,
    ) -> Result<T, EngineError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }
}

#[async_trait]
impl Journal for WalJournal {
    async fn append(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (response, rx) = oneshot::channel();
        self.request(WalCommand::Append { events, response }, rx).await
    }

    async fn compact(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (response, rx) = oneshot::channel();
        self.request(WalCommand::Compact { events, response }, rx).await
    }

    async fn appends_since_compact(&self) -> u64 {
        let (response, rx) = oneshot::channel();
        if self
            .tx
            .send(WalCommand::AppendsSinceCompact { response })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Owns the WAL and batches appends:
/// block for the first append, drain whatever else is queued, fsync once, answer all.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => batch.push((events, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

/// Write and fsync the whole group. On any failure the WAL is rolled back to the
/// last sync, so no record of a failed group is left in front of later ones.
fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(events, _)| wal.append_buffered(events))
        .and_then(|()| wal.flush_sync());
    if result.is_err()
        && let Err(e) = wal.rollback()
    {
        tracing::error!("WAL {}: rollback after failed write: {e}", wal.path().display());
    }
    result
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { events, response } => {
            let batch = vec![(events, response)];
            let result = flush_batch(wal, &batch);
            respond_batch(batch, &result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("bunkhouse_test_journal");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn room(id: i64) -> Vec<Event> {
        vec![Event::RoomCreated {
            id,
            name: format!("Room {id}"),
            description: None,
        }]
    }

    fn pending(events: Vec<Event>) -> (PendingAppend, oneshot::Receiver<io::Result<()>>) {
        let (tx, rx) = oneshot::channel();
        ((events, tx), rx)
    }

    #[test]
    fn failed_sync_leaves_nothing_in_front_of_later_commits() {
        let path = tmp_path("failed_sync.wal");
        let mut wal = Wal::open(&path).unwrap();

        let (first, _rx) = pending(room(1));
        flush_batch(&mut wal, &[first]).unwrap();

        // The bytes reach the file but the sync reports failure: the commit was refused.
        wal.fail_next_sync();
        let (refused, _rx) = pending(room(2));
        assert!(flush_batch(&mut wal, &[refused]).is_err());

        let (later, _rx) = pending(room(3));
        flush_batch(&mut wal, &[later]).unwrap();
        assert_eq!(wal.appends_since_compact(), 2);
        drop(wal);

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, [room(1), room(3)].concat());
    }

    #[tokio::test]
    async fn refused_commit_is_reported_to_every_waiter() {
        let path = tmp_path("refused_group.wal");
        let mut wal = Wal::open(&path).unwrap();
        wal.fail_next_sync();

        let (a, rx_a) = pending(room(1));
        let (b, rx_b) = pending(room(2));
        let batch = vec![a, b];
        let result = flush_batch(&mut wal, &batch);
        respond_batch(batch, &result);

        assert!(rx_a.await.unwrap().is_err());
        assert!(rx_b.await.unwrap().is_err());
        drop(wal);
        assert!(Wal::replay(&path).unwrap().is_empty());
    }
}
