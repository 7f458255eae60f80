//! Transport contract and serializer
//!
//! The engine drives the device through a capability object: send one
//! ASCII line, receive one response line before a deadline. All sends are
//! funneled through a dedicated serializer task so the bytes of two
//! attempts can never interleave on the wire, independent of how many
//! sequences run concurrently.
//!
//! [`ScriptedTransport`] is the in-process implementation used by tests
//! and by dry runs: it scripts replies per line prefix, records every
//! sent line, and can inject out-of-band events.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::model::Scalar;

/// Echoed status token of a device response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    /// Device acknowledged (`OK`)
    Ok,
    /// Device rejected (`ERR …`)
    Err,
}

/// One response line from the device.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// OK/ERR token
    pub status: ResponseStatus,
    /// Payload after the token, if any
    pub payload: Option<String>,
}

impl Response {
    /// Acknowledgement with an optional payload.
    pub fn ok(payload: Option<String>) -> Self {
        Self {
            status: ResponseStatus::Ok,
            payload,
        }
    }

    /// Device-level rejection with a message.
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Err,
            payload: Some(message.into()),
        }
    }
}

/// Out-of-band notification surfaced by the transport (emergency stop,
/// sensor trip). The orchestrator republishes these with source tag
/// `"transport"`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    /// Notification name
    pub name: String,
    /// Structured payload
    pub payload: BTreeMap<String, Scalar>,
}

/// Failures below the device protocol.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportFault {
    /// I/O failure on the line
    #[error("transport I/O error: {0}")]
    Io(String),
    /// No response before the deadline
    #[error("transport deadline exceeded")]
    Timeout,
    /// Transport task or port is gone
    #[error("transport closed")]
    Closed,
}

/// Capability object the engine consumes.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one line and await one response before `deadline` elapses.
    async fn send(&self, line: &str, deadline: Duration) -> Result<Response, TransportFault>;

    /// Take the out-of-band event stream; `None` when the transport has
    /// none (or it was already taken).
    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        None
    }
}

struct Job {
    line: String,
    deadline: Duration,
    reply: oneshot::Sender<Result<Response, TransportFault>>,
}

/// Handle to the single-writer serializer task.
///
/// Cloneable; all clones feed the same queue, and the task completes one
/// send before starting the next.
#[derive(Clone)]
pub struct TransportLink {
    tx: mpsc::Sender<Job>,
}

impl TransportLink {
    /// Spawn the serializer task over a transport.
    pub fn spawn(transport: Arc<dyn Transport>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Job>(64);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = transport.send(&job.line, job.deadline).await;
                let _ = job.reply.send(result);
            }
        });
        Self { tx }
    }

    /// Send one line through the serializer.
    pub async fn send_line(
        &self,
        line: impl Into<String>,
        deadline: Duration,
    ) -> Result<Response, TransportFault> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            line: line.into(),
            deadline,
            reply: reply_tx,
        };
        self.tx.send(job).await.map_err(|_| TransportFault::Closed)?;
        reply_rx.await.map_err(|_| TransportFault::Closed)?
    }
}

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Acknowledge after `delay_ms`
    Ok {
        /// Payload after the OK token
        payload: Option<String>,
        /// Response latency in milliseconds
        delay_ms: u64,
    },
    /// Reject at device level after `delay_ms`
    Err {
        /// ERR message
        message: String,
        /// Response latency in milliseconds
        delay_ms: u64,
    },
    /// Fail below the protocol (I/O error)
    Fault {
        /// Fault description
        message: String,
    },
    /// Never answer; the caller runs into its deadline
    Hang,
}

struct Rule {
    prefix: String,
    replies: VecDeque<ScriptedReply>,
}

/// A line sent through a [`ScriptedTransport`], with its timing window.
#[derive(Debug, Clone)]
pub struct SentLine {
    /// The rendered line
    pub line: String,
    /// When the send started
    pub started: Instant,
    /// When the response (or fault) was produced
    pub finished: Instant,
}

/// Script-driven transport for tests and dry runs.
///
/// Unmatched lines acknowledge immediately. Scripted replies for a
/// prefix are consumed in order; the last one repeats.
pub struct ScriptedTransport {
    rules: Mutex<Vec<Rule>>,
    sent: Mutex<Vec<SentLine>>,
    in_flight: AtomicUsize,
    overlapped: AtomicBool,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl ScriptedTransport {
    /// Transport that acknowledges everything immediately.
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        Self {
            rules: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            overlapped: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Script replies for lines starting with `prefix`.
    pub fn script(&self, prefix: impl Into<String>, replies: Vec<ScriptedReply>) {
        self.rules.lock().push(Rule {
            prefix: prefix.into(),
            replies: replies.into_iter().collect(),
        });
    }

    /// Inject an out-of-band transport event.
    pub async fn inject_event(&self, name: impl Into<String>, payload: BTreeMap<String, Scalar>) {
        let _ = self
            .events_tx
            .send(TransportEvent {
                name: name.into(),
                payload,
            })
            .await;
    }

    /// Every line sent so far, in send order.
    pub fn sent_lines(&self) -> Vec<String> {
        self.sent.lock().iter().map(|s| s.line.clone()).collect()
    }

    /// Full send records including timing windows.
    pub fn sent_records(&self) -> Vec<SentLine> {
        self.sent.lock().clone()
    }

    /// Number of sends observed.
    pub fn send_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Whether two sends ever overlapped in time. Stays `false` as long
    /// as every send goes through the serializer task.
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    fn next_reply(&self, line: &str) -> ScriptedReply {
        let mut rules = self.rules.lock();
        for rule in rules.iter_mut() {
            if line.starts_with(&rule.prefix) {
                if rule.replies.len() > 1 {
                    return rule.replies.pop_front().expect("non-empty");
                }
                if let Some(last) = rule.replies.front() {
                    return last.clone();
                }
            }
        }
        ScriptedReply::Ok {
            payload: None,
            delay_ms: 0,
        }
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, line: &str, deadline: Duration) -> Result<Response, TransportFault> {
        let started = Instant::now();
        if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }

        let reply = self.next_reply(line);
        let result = match reply {
            ScriptedReply::Ok { payload, delay_ms } => {
                let delay = Duration::from_millis(delay_ms);
                if delay >= deadline {
                    tokio::time::sleep(deadline).await;
                    Err(TransportFault::Timeout)
                } else {
                    tokio::time::sleep(delay).await;
                    Ok(Response::ok(payload))
                }
            }
            ScriptedReply::Err { message, delay_ms } => {
                let delay = Duration::from_millis(delay_ms);
                if delay >= deadline {
                    tokio::time::sleep(deadline).await;
                    Err(TransportFault::Timeout)
                } else {
                    tokio::time::sleep(delay).await;
                    Ok(Response::err(message))
                }
            }
            ScriptedReply::Fault { message } => Err(TransportFault::Io(message)),
            ScriptedReply::Hang => {
                tokio::time::sleep(deadline).await;
                Err(TransportFault::Timeout)
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.sent.lock().push(SentLine {
            line: line.to_string(),
            started,
            finished: Instant::now(),
        });
        result
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events_rx.lock().take()
    }
}
