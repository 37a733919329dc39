use std::io;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};

use crate::limits::WAL_CHANNEL_CAPACITY;
use crate::wal::Wal;

use super::StoreError;

enum WalCommand<E> {
    Append {
        records: Vec<E>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<E>,
        response: oneshot::Sender<io::Result<()>>,
    },
}

type Pending<E> = (Vec<E>, oneshot::Sender<io::Result<()>>);

/// Handle to a background task that owns one WAL and batches appends for group commit.
pub(crate) struct WalWriter<E> {
    tx: mpsc::Sender<WalCommand<E>>,
}

impl<E> Clone for WalWriter<E> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<E> WalWriter<E>
where
    E: Serialize + DeserializeOwned + Send + 'static,
{
    /// Replay `path`, then spawn the writer task. Must be called inside a tokio runtime.
    pub(crate) fn open(path: &Path) -> io::Result<(Self, Vec<E>)> {
        let records = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let (tx, rx) = mpsc::channel(WAL_CHANNEL_CAPACITY);
        tokio::spawn(writer_loop(wal, rx));
        Ok((Self { tx }, records))
    }

    pub(crate) async fn append(&self, record: E) -> Result<(), StoreError> {
        self.append_all(vec![record]).await
    }

    /// Durably append `records` as one unit: all of them land in the same fsync.
    pub(crate) async fn append_all(&self, records: Vec<E>) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let (response, rx) = oneshot::channel();
        self.send(WalCommand::Append { records, response }, rx).await
    }

    /// Replace the log with `records` (a minimal rewrite of current state).
    pub(crate) async fn compact(&self, records: Vec<E>) -> Result<(), StoreError> {
        let (response, rx) = oneshot::channel();
        self.send(WalCommand::Compact { records, response }, rx).await
    }

    async fn send(
        &self,
        cmd: WalCommand<E>,
        rx: oneshot::Receiver<io::Result<()>>,
    ) -> Result<(), StoreError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(format!("WAL: {e}")))
    }
}

/// Group commit: whatever appends are already queued behind the first one
/// share its fsync, and every sender gets the batch's result. A queued
/// compaction ends the batch early.
async fn writer_loop<E: Serialize + DeserializeOwned>(
    mut wal: Wal<E>,
    mut rx: mpsc::Receiver<WalCommand<E>>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { records, response } => {
                let mut batch = vec![(records, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { records, response }) => {
                            batch.push((records, response));
                        }
                        Ok(other) => {
                            commit_batch(&mut wal, &mut batch);
                            handle_compact(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    commit_batch(&mut wal, &mut batch);
                }
            }
            other => handle_compact(&mut wal, other),
        }
    }
}

fn commit_batch<E: Serialize + DeserializeOwned>(wal: &mut Wal<E>, batch: &mut Vec<Pending<E>>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(ref e) = result {
        tracing::error!(path = %wal.path().display(), "WAL flush failed: {e}");
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch<E: Serialize + DeserializeOwned>(
    wal: &mut Wal<E>,
    batch: &[Pending<E>],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    'outer: for (records, _) in batch {
        for record in records {
            if let Err(e) = wal.append_buffered(record) {
                append_err = Some(e);
                break 'outer;
            }
        }
    }
    // Flush on error too: buffered frames of a failed batch must not ride along with the next one.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_compact<E: Serialize + DeserializeOwned>(wal: &mut Wal<E>, cmd: WalCommand<E>) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let appended = wal.appends_since_compact();
            let result = Wal::write_compact_file(wal.path(), &records)
                .and_then(|()| wal.swap_compact_file());
            match &result {
                Ok(()) => tracing::info!(
                    path = %wal.path().display(),
                    appended,
                    kept = records.len(),
                    "compacted WAL"
                ),
                Err(e) => tracing::error!(path = %wal.path().display(), "WAL compaction failed: {e}"),
            }
            let _ = response.send(result);
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}
