//! Transactional key-indexed store
//!
//! A [`KeyStore`] hands one SQLite connection to a blocking worker thread and
//! talks to it over a command channel. Requests issued on a [`Transaction`]
//! are queued immediately and resolve when the worker answers.
//!
//! Transactions commit on their own: when the body passed to
//! [`Transaction::run`] yields to the scheduler while no request is in
//! flight, the transaction commits and every later request fails. Code that
//! needs a transaction to survive an unrelated await must keep a request
//! outstanding (see [`super::keepalive`]).

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

pub use super::schema::StoreLayout;
use super::schema;
use crate::models::Document;
use crate::storage::{StorageError, StorageResult};

/// Access mode of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
    /// Only obtainable from [`KeyStore::open`]; allows schema changes
    VersionChange,
}

/// One row of the object store
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    pub id: String,
    pub doc: Document,
}

enum Op {
    Get(String),
    Put(IndexRecord),
    Delete(String),
    GetAllKeys,
    IndexKeysEq {
        field: String,
        value: String,
    },
    IndexWindow {
        field: String,
        value: String,
        start: usize,
        end: usize,
    },
    CreateObjectStore,
    DeleteObjectStore,
    CreateIndex(String),
    DeleteIndex(String),
    SetVersion(u32),
}

impl Op {
    fn is_schema_change(&self) -> bool {
        matches!(
            self,
            Op::CreateObjectStore
                | Op::DeleteObjectStore
                | Op::CreateIndex(_)
                | Op::DeleteIndex(_)
                | Op::SetVersion(_)
        )
    }

    fn is_write(&self) -> bool {
        !matches!(
            self,
            Op::Get(_) | Op::GetAllKeys | Op::IndexKeysEq { .. } | Op::IndexWindow { .. }
        )
    }
}

enum Reply {
    Unit,
    Doc(Option<Document>),
    Ids(Vec<String>),
}

enum Command {
    Begin {
        mode: TxMode,
        reply: oneshot::Sender<StorageResult<()>>,
    },
    Request {
        op: Op,
        reply: oneshot::Sender<StorageResult<Reply>>,
    },
    Commit {
        reply: oneshot::Sender<StorageResult<()>>,
    },
    Abort,
}

/// Handle on an open index store
///
/// Dropping the handle and every transaction created from it closes the
/// connection; an unfinished transaction is rolled back.
pub struct KeyStore {
    name: String,
    commands: mpsc::UnboundedSender<Command>,
}

impl KeyStore {
    /// Open the store at `path` and start a version-change transaction
    ///
    /// The transaction holds the write lock. Callers that find nothing to
    /// upgrade in the returned layout commit it straight away.
    pub async fn open(
        path: &Path,
        name: &str,
        version: Option<u32>,
        busy_timeout: Duration,
    ) -> StorageResult<(KeyStore, Transaction, StoreLayout)> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (ready, opened) = oneshot::channel();

        let worker = Worker {
            path: path.to_path_buf(),
            name: name.to_string(),
            requested_version: version,
            busy_timeout,
        };
        tokio::task::spawn_blocking(move || worker.run(ready, receiver));

        let layout = opened.await.map_err(|_| worker_stopped(name))??;
        debug!(store = %name, ?layout, "Opened index store");

        let store = KeyStore {
            name: name.to_string(),
            commands: commands.clone(),
        };
        let tx = Transaction::new(name, TxMode::VersionChange, commands);
        Ok((store, tx, layout))
    }

    /// Start a read-only or read-write transaction
    pub async fn transaction(&self, mode: TxMode) -> StorageResult<Transaction> {
        if mode == TxMode::VersionChange {
            return Err(StorageError::Transaction {
                store: self.name.clone(),
                reason: "version-change transactions are only started by open".to_string(),
            });
        }

        let (reply, begun) = oneshot::channel();
        self.commands
            .send(Command::Begin { mode, reply })
            .map_err(|_| worker_stopped(&self.name))?;
        begun.await.map_err(|_| worker_stopped(&self.name))??;

        Ok(Transaction::new(&self.name, mode, self.commands.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxStatus {
    Active,
    Committing,
    Finished,
}

struct TxInner {
    store: String,
    mode: TxMode,
    commands: mpsc::UnboundedSender<Command>,
    status: Mutex<TxStatus>,
    pending: AtomicUsize,
    completion: Mutex<Option<oneshot::Receiver<StorageResult<()>>>>,
}

impl TxInner {
    fn status(&self) -> MutexGuard<'_, TxStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for TxInner {
    fn drop(&mut self) {
        let status = *self.status.get_mut().unwrap_or_else(|e| e.into_inner());
        if status == TxStatus::Active {
            debug!(store = %self.store, "Aborting dropped transaction");
            let _ = self.commands.send(Command::Abort);
        }
    }
}

/// A transaction on a [`KeyStore`]
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxInner>,
}

impl Transaction {
    fn new(store: &str, mode: TxMode, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            inner: Arc::new(TxInner {
                store: store.to_string(),
                mode,
                commands,
                status: Mutex::new(TxStatus::Active),
                pending: AtomicUsize::new(0),
                completion: Mutex::new(None),
            }),
        }
    }

    pub fn mode(&self) -> TxMode {
        self.inner.mode
    }

    /// Whether new requests are still accepted
    pub fn is_active(&self) -> bool {
        *self.inner.status() == TxStatus::Active
    }

    /// Number of requests issued and not yet resolved
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    pub fn get(&self, id: &str) -> Request<Option<Document>> {
        self.request(Op::Get(id.to_string()), |reply| match reply {
            Reply::Doc(doc) => Ok(doc),
            _ => Err(unexpected_reply()),
        })
    }

    pub fn put(&self, record: IndexRecord) -> Request<()> {
        self.request(Op::Put(record), unit)
    }

    pub fn delete(&self, id: &str) -> Request<()> {
        self.request(Op::Delete(id.to_string()), unit)
    }

    /// Every record id in ascending order
    pub fn get_all_keys(&self) -> Request<Vec<String>> {
        self.request(Op::GetAllKeys, ids)
    }

    /// Ids whose `field` matches `value`, through the field's sub-index
    pub fn index_keys_eq(&self, field: &str, value: &str) -> Request<Vec<String>> {
        self.request(
            Op::IndexKeysEq {
                field: field.to_string(),
                value: value.to_string(),
            },
            ids,
        )
    }

    /// Like [`Self::index_keys_eq`] but only rows `[start, end)` of the cursor
    pub fn index_window(
        &self,
        field: &str,
        value: &str,
        start: usize,
        end: usize,
    ) -> Request<Vec<String>> {
        self.request(
            Op::IndexWindow {
                field: field.to_string(),
                value: value.to_string(),
                start,
                end,
            },
            ids,
        )
    }

    pub fn create_object_store(&self) -> Request<()> {
        self.request(Op::CreateObjectStore, unit)
    }

    pub fn delete_object_store(&self) -> Request<()> {
        self.request(Op::DeleteObjectStore, unit)
    }

    pub fn create_index(&self, field: &str) -> Request<()> {
        self.request(Op::CreateIndex(field.to_string()), unit)
    }

    pub fn delete_index(&self, field: &str) -> Request<()> {
        self.request(Op::DeleteIndex(field.to_string()), unit)
    }

    pub fn set_version(&self, version: u32) -> Request<()> {
        self.request(Op::SetVersion(version), unit)
    }

    fn request<T>(&self, op: Op, convert: fn(Reply) -> StorageResult<T>) -> Request<T> {
        if op.is_schema_change() && self.inner.mode != TxMode::VersionChange {
            return Request::failed(
                self.error("schema changes need a version-change transaction"),
                convert,
            );
        }
        if op.is_write() && self.inner.mode == TxMode::ReadOnly {
            return Request::failed(self.error("transaction is read-only"), convert);
        }

        let status = self.inner.status();
        if *status != TxStatus::Active {
            return Request::failed(self.error("transaction is not active"), convert);
        }

        let (reply, receiver) = oneshot::channel();
        if self
            .inner
            .commands
            .send(Command::Request { op, reply })
            .is_err()
        {
            return Request::failed(worker_stopped(&self.inner.store), convert);
        }
        drop(status);

        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        Request {
            receiver: Some(receiver),
            failure: None,
            convert,
            owner: Some(self.inner.clone()),
        }
    }

    /// Run `body` inside this transaction
    ///
    /// A successful body commits (or waits for the commit the transaction
    /// already started on its own); a failing body aborts.
    pub async fn run<F, T>(&self, body: F) -> StorageResult<T>
    where
        F: Future<Output = StorageResult<T>>,
    {
        let outcome = AutoCommit {
            tx: self,
            body: Box::pin(body),
        }
        .await;

        match outcome {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    /// Commit explicitly, or wait for an automatic commit to finish
    pub async fn commit(&self) -> StorageResult<()> {
        let completion = {
            let mut status = self.inner.status();
            match *status {
                TxStatus::Active => {
                    let (reply, receiver) = oneshot::channel();
                    self.inner
                        .commands
                        .send(Command::Commit { reply })
                        .map_err(|_| worker_stopped(&self.inner.store))?;
                    *status = TxStatus::Committing;
                    receiver
                }
                TxStatus::Committing => {
                    let mut completion = self
                        .inner
                        .completion
                        .lock()
                        .unwrap_or_else(|e| e.into_inner());
                    match completion.take() {
                        Some(receiver) => receiver,
                        None => return Ok(()),
                    }
                }
                TxStatus::Finished => return Err(self.error("transaction already finished")),
            }
        };

        let result = completion
            .await
            .map_err(|_| worker_stopped(&self.inner.store))?;
        *self.inner.status() = TxStatus::Finished;
        result
    }

    /// Roll back; a no-op once the transaction has finished or is committing
    pub fn abort(&self) {
        let mut status = self.inner.status();
        if *status == TxStatus::Active {
            let _ = self.inner.commands.send(Command::Abort);
            *status = TxStatus::Finished;
            debug!(store = %self.inner.store, "Transaction aborted");
        }
    }

    fn auto_commit(&self) {
        let mut status = self.inner.status();
        if *status != TxStatus::Active {
            return;
        }
        let (reply, receiver) = oneshot::channel();
        if self.inner.commands.send(Command::Commit { reply }).is_ok() {
            *self
                .inner
                .completion
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(receiver);
        }
        *status = TxStatus::Committing;
        debug!(store = %self.inner.store, "Transaction committed with no request in flight");
    }

    fn error(&self, reason: &str) -> StorageError {
        StorageError::Transaction {
            store: self.inner.store.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Polls a transaction body and commits when it idles with nothing in flight
struct AutoCommit<'a, F> {
    tx: &'a Transaction,
    body: Pin<Box<F>>,
}

impl<F: Future> Future for AutoCommit<'_, F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let this = &mut *self;
        match this.body.as_mut().poll(cx) {
            Poll::Ready(output) => Poll::Ready(output),
            Poll::Pending => {
                if this.tx.pending() == 0 {
                    this.tx.auto_commit();
                }
                Poll::Pending
            }
        }
    }
}

/// A queued request; resolves with the worker's answer
pub struct Request<T> {
    receiver: Option<oneshot::Receiver<StorageResult<Reply>>>,
    failure: Option<StorageError>,
    convert: fn(Reply) -> StorageResult<T>,
    owner: Option<Arc<TxInner>>,
}

impl<T> Request<T> {
    fn failed(error: StorageError, convert: fn(Reply) -> StorageResult<T>) -> Self {
        Self {
            receiver: None,
            failure: Some(error),
            convert,
            owner: None,
        }
    }

    fn settle(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl<T> Unpin for Request<T> {}

impl<T> Future for Request<T> {
    type Output = StorageResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if let Some(error) = this.failure.take() {
            return Poll::Ready(Err(error));
        }
        let receiver = match this.receiver.as_mut() {
            Some(receiver) => receiver,
            None => {
                return Poll::Ready(Err(StorageError::Backend(
                    "request polled after completion".to_string(),
                )))
            }
        };

        match Pin::new(receiver).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(answer) => {
                this.receiver = None;
                let store = this
                    .owner
                    .as_ref()
                    .map(|owner| owner.store.clone())
                    .unwrap_or_default();
                this.settle();
                Poll::Ready(match answer {
                    Ok(Ok(reply)) => (this.convert)(reply),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(worker_stopped(&store)),
                })
            }
        }
    }
}

impl<T> Drop for Request<T> {
    fn drop(&mut self) {
        self.settle();
    }
}

fn unit(reply: Reply) -> StorageResult<()> {
    match reply {
        Reply::Unit => Ok(()),
        _ => Err(unexpected_reply()),
    }
}

fn ids(reply: Reply) -> StorageResult<Vec<String>> {
    match reply {
        Reply::Ids(ids) => Ok(ids),
        _ => Err(unexpected_reply()),
    }
}

fn unexpected_reply() -> StorageError {
    StorageError::Backend("unexpected reply from index store worker".to_string())
}

fn worker_stopped(store: &str) -> StorageError {
    StorageError::Transaction {
        store: store.to_string(),
        reason: "index store worker stopped".to_string(),
    }
}

/// Owner of the connection, running on a blocking thread
struct Worker {
    path: PathBuf,
    name: String,
    requested_version: Option<u32>,
    busy_timeout: Duration,
}

impl Worker {
    fn run(
        self,
        ready: oneshot::Sender<StorageResult<StoreLayout>>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let conn = match self.begin_version_change() {
            Ok((conn, layout)) => {
                if ready.send(Ok(layout)).is_err() {
                    self.close(conn);
                    return;
                }
                conn
            }
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };

        while let Some(command) = commands.blocking_recv() {
            match command {
                Command::Begin { mode, reply } => {
                    let sql = match mode {
                        TxMode::ReadOnly => "BEGIN DEFERRED",
                        _ => "BEGIN IMMEDIATE",
                    };
                    let _ = reply.send(conn.execute_batch(sql).map_err(StorageError::from));
                }
                Command::Request { op, reply } => {
                    let _ = reply.send(execute(&conn, op));
                }
                Command::Commit { reply } => {
                    let result = conn.execute_batch("COMMIT").map_err(StorageError::from);
                    if result.is_err() && !conn.is_autocommit() {
                        let _ = conn.execute_batch("ROLLBACK");
                    }
                    let _ = reply.send(result);
                }
                Command::Abort => {
                    if !conn.is_autocommit() {
                        if let Err(e) = conn.execute_batch("ROLLBACK") {
                            warn!(store = %self.name, error = %e, "Rollback failed");
                        }
                    }
                }
            }
        }

        self.close(conn);
    }

    fn begin_version_change(&self) -> StorageResult<(Connection, StoreLayout)> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch("BEGIN IMMEDIATE")?;

        let layout = match schema::init_meta(&conn).and_then(|_| schema::read_layout(&conn)) {
            Ok(layout) => layout,
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e.into());
            }
        };

        if let (Some(requested), Some(stored)) = (self.requested_version, layout.version) {
            if requested < stored {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(StorageError::Transaction {
                    store: self.name.clone(),
                    reason: format!(
                        "The requested version ({}) is less than the existing version ({})",
                        requested, stored
                    ),
                });
            }
        }

        Ok((conn, layout))
    }

    fn close(&self, conn: Connection) {
        if !conn.is_autocommit() {
            debug!(store = %self.name, "Rolling back unfinished transaction");
            let _ = conn.execute_batch("ROLLBACK");
        }
        if let Err((_, e)) = conn.close() {
            warn!(store = %self.name, error = %e, "Failed to close index store");
        }
        debug!(store = %self.name, "Closed index store");
    }
}

fn execute(conn: &Connection, op: Op) -> StorageResult<Reply> {
    match op {
        Op::Get(id) => {
            let doc: Option<String> = conn
                .query_row(
                    &format!("SELECT doc FROM {} WHERE id = ?1", schema::OBJECT_STORE),
                    [&id],
                    |row| row.get(0),
                )
                .optional()?;
            let doc = doc.map(|text| serde_json::from_str(&text)).transpose()?;
            Ok(Reply::Doc(doc))
        }
        Op::Put(record) => {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO {} (id, doc) VALUES (?1, ?2)",
                    schema::OBJECT_STORE
                ),
                params![record.id, serde_json::to_string(&record.doc)?],
            )?;
            Ok(Reply::Unit)
        }
        Op::Delete(id) => {
            conn.execute(
                &format!("DELETE FROM {} WHERE id = ?1", schema::OBJECT_STORE),
                [&id],
            )?;
            Ok(Reply::Unit)
        }
        Op::GetAllKeys => {
            let ids = conn
                .prepare(&format!("SELECT id FROM {} ORDER BY id", schema::OBJECT_STORE))?
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(Reply::Ids(ids))
        }
        Op::IndexKeysEq { field, value } => {
            let number = numeric(&value);
            let ids = conn
                .prepare(&schema::select_ids_by_field(&field))?
                .query_map(params![value, number], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(Reply::Ids(ids))
        }
        Op::IndexWindow {
            field,
            value,
            start,
            end,
        } => {
            let number = numeric(&value);
            let mut stmt = conn.prepare(&schema::select_ids_by_field(&field))?;
            let mut rows = stmt.query(params![value, number])?;
            let mut ids = Vec::new();
            let mut count = 0;
            while let Some(row) = rows.next()? {
                if count >= end {
                    break;
                }
                if count >= start {
                    ids.push(row.get(0)?);
                }
                count += 1;
            }
            Ok(Reply::Ids(ids))
        }
        Op::CreateObjectStore => {
            schema::create_object_store(conn)?;
            Ok(Reply::Unit)
        }
        Op::DeleteObjectStore => {
            schema::delete_object_store(conn)?;
            Ok(Reply::Unit)
        }
        Op::CreateIndex(field) => {
            schema::create_index(conn, &field)?;
            Ok(Reply::Unit)
        }
        Op::DeleteIndex(field) => {
            schema::delete_index(conn, &field)?;
            Ok(Reply::Unit)
        }
        Op::SetVersion(version) => {
            schema::set_version(conn, version)?;
            Ok(Reply::Unit)
        }
    }
}

/// Numeric reading of a query value, if any
fn numeric(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}
