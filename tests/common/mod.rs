#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use orderline::network::{
    ChannelError, Connector, FrameStream, OrderApi, RetryPolicy, SubmitAck, SubmitError,
    SyncQueue,
};
use orderline::storage::DurableQueueStore;
use orderline::{OrderItem, OrderPayload};
use reqwest::Url;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// What the fake backend does with one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Accept,
    /// Fail before committing anything.
    Fail,
    /// Commit the order, then lose the acknowledgement.
    CommitThenDrop,
    Reject(u16),
}

/// In-memory order backend that deduplicates on `local_id`.
pub struct FakeBackend {
    orders: Mutex<HashMap<String, String>>,
    commit_log: Mutex<Vec<String>>,
    calls: Mutex<Vec<String>>,
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Self::build(Reply::Accept, Duration::ZERO, Vec::new())
    }

    pub fn scripted(script: Vec<Reply>) -> Arc<Self> {
        Self::build(Reply::Accept, Duration::ZERO, script)
    }

    pub fn always_failing() -> Arc<Self> {
        Self::build(Reply::Fail, Duration::ZERO, Vec::new())
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Self::build(Reply::Accept, delay, Vec::new())
    }

    fn build(fallback: Reply, delay: Duration, script: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            orders: Mutex::new(HashMap::new()),
            commit_log: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(script.into()),
            fallback,
            delay,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// `local_id`s in the order the backend first committed them.
    pub fn commit_log(&self) -> Vec<String> {
        self.commit_log.lock().unwrap().clone()
    }

    pub fn server_id(&self, local_id: &str) -> Option<String> {
        self.orders.lock().unwrap().get(local_id).cloned()
    }

    pub fn order_count(&self) -> usize {
        self.orders.lock().unwrap().len()
    }

    /// Every submission received, including failed ones.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, local_id: &str) -> usize {
        self.calls().iter().filter(|id| *id == local_id).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn commit(&self, local_id: &str) -> (String, bool) {
        let mut orders = self.orders.lock().unwrap();
        if let Some(existing) = orders.get(local_id) {
            return (existing.clone(), false);
        }
        let server_id = format!("ord_{}", orders.len() + 1);
        orders.insert(local_id.to_string(), server_id.clone());
        self.commit_log.lock().unwrap().push(local_id.to_string());
        (server_id, true)
    }
}

#[async_trait]
impl OrderApi for FakeBackend {
    async fn submit_order(
        &self,
        local_id: &str,
        _payload: &OrderPayload,
    ) -> Result<SubmitAck, SubmitError> {
        self.calls.lock().unwrap().push(local_id.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);

        let result = match reply {
            Reply::Accept => {
                let (server_id, created) = self.commit(local_id);
                Ok(SubmitAck { server_id, created })
            }
            Reply::Fail => Err(SubmitError::Transient("connection reset".into())),
            Reply::CommitThenDrop => {
                self.commit(local_id);
                Err(SubmitError::Transient("acknowledgement lost".into()))
            }
            Reply::Reject(status) => Err(SubmitError::Rejected {
                status,
                message: "invalid order".into(),
            }),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub fn payload(table: &str) -> OrderPayload {
    OrderPayload::new(table, vec![OrderItem::new("x", 2u32)])
}

/// Retry policy with millisecond delays so tests run quickly.
pub fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        submit_timeout: Duration::from_secs(2),
    }
}

pub struct QueueFixture {
    pub temp_dir: TempDir,
    pub db: sled::Db,
    pub store: Arc<DurableQueueStore>,
    pub queue: SyncQueue,
}

pub fn queue_fixture(api: Arc<dyn OrderApi>, policy: RetryPolicy) -> QueueFixture {
    let temp_dir = TempDir::new().expect("temp dir");
    let db = sled::open(temp_dir.path()).expect("open sled");
    let store = Arc::new(
        DurableQueueStore::open(&db)
            .expect("open queue")
            .without_sync_writes(),
    );
    let queue = SyncQueue::new(Arc::clone(&store), api, policy)
        .with_confirm_grace(Duration::from_secs(60));
    QueueFixture {
        temp_dir,
        db,
        store,
        queue,
    }
}

/// Poll `cond` until it holds or `limit` elapses.
pub async fn eventually<F>(limit: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub type FrameSender = mpsc::Sender<Result<String, ChannelError>>;

/// One scripted outcome of `Connector::connect`.
pub enum Dial {
    Refuse,
    Accept(mpsc::Receiver<Result<String, ChannelError>>),
}

/// Connector that plays back a script of outcomes; refuses once it runs out.
#[derive(Default)]
pub struct ScriptedConnector {
    script: Mutex<VecDeque<Dial>>,
    urls: Mutex<Vec<Url>>,
}

impl ScriptedConnector {
    pub fn new(script: Vec<Dial>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            urls: Mutex::new(Vec::new()),
        })
    }

    /// Queue an accepted connection and return its frame sender.
    pub fn push_accept(&self) -> FrameSender {
        let (tx, rx) = mpsc::channel(16);
        self.script.lock().unwrap().push_back(Dial::Accept(rx));
        tx
    }

    pub fn dials(&self) -> usize {
        self.urls.lock().unwrap().len()
    }

    pub fn last_url(&self) -> Option<Url> {
        self.urls.lock().unwrap().last().cloned()
    }
}

pub fn accepted() -> (FrameSender, Dial) {
    let (tx, rx) = mpsc::channel(16);
    (tx, Dial::Accept(rx))
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, url: &Url) -> Result<FrameStream, ChannelError> {
        self.urls.lock().unwrap().push(url.clone());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Dial::Accept(rx)) => Ok(Box::pin(ReceiverStream::new(rx))),
            Some(Dial::Refuse) | None => Err(ChannelError::Handshake("connection refused".into())),
        }
    }
}
