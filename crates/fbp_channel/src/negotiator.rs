//! Matches startup reports arriving on one shared stream to the requests
//! waiting for them.
//!
//! Reports may arrive before anybody asked for them and interleaved with
//! reports for other ids; they are buffered per correlation id in arrival
//! order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::endpoint::ChannelReader;
use crate::error::ChannelError;
use crate::message::{Msg, StartupInfo, StartupReport};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("timed out waiting for startup info `{id}`: got {received} of {expected}")]
    Timeout {
        id: String,
        expected: usize,
        received: usize,
    },

    #[error("startup negotiation for `{id}` aborted: {reason}")]
    Aborted { id: String, reason: String },

    #[error("startup info `{0}` is already being awaited")]
    DuplicateRequest(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

#[derive(Debug)]
enum Entry {
    Buffered(Vec<StartupInfo>),
    Waiting(mpsc::UnboundedSender<StartupInfo>),
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    /// Set once the report stream is gone.
    aborted: Option<String>,
}

impl State {
    fn deliver(&mut self, report: StartupReport) {
        let StartupReport { id, info } = report;
        match self.entries.get_mut(&id) {
            Some(Entry::Waiting(tx)) => {
                if let Err(mpsc::error::SendError(info)) = tx.send(info) {
                    self.entries.insert(id, Entry::Buffered(vec![info]));
                }
            }
            Some(Entry::Buffered(infos)) => infos.push(info),
            None => {
                self.entries.insert(id, Entry::Buffered(vec![info]));
            }
        }
    }

    fn abort(&mut self, reason: String) {
        // dropping the senders wakes every waiter
        self.entries.retain(|_, e| matches!(e, Entry::Buffered(_)));
        self.aborted = Some(reason);
    }

    /// Ends a request: puts `collected` plus anything still in flight back
    /// at the front of the buffer for `id`.
    fn release(
        &mut self,
        id: &str,
        mut collected: Vec<StartupInfo>,
        rx: &mut mpsc::UnboundedReceiver<StartupInfo>,
    ) {
        if matches!(self.entries.get(id), Some(Entry::Waiting(_))) {
            self.entries.remove(id);
        }
        rx.close();
        while let Ok(info) = rx.try_recv() {
            collected.push(info);
        }
        if let Some(Entry::Buffered(later)) = self.entries.remove(id) {
            collected.extend(later);
        }
        if !collected.is_empty() {
            self.entries.insert(id.to_string(), Entry::Buffered(collected));
        }
    }
}

/// A running request. Dropping it, finished or not, withdraws the waiter and
/// buffers whatever it still holds.
struct Claim<'a> {
    negotiator: &'a Negotiator,
    id: &'a str,
    collected: Vec<StartupInfo>,
    rx: mpsc::UnboundedReceiver<StartupInfo>,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        let collected = std::mem::take(&mut self.collected);
        self.negotiator.lock().release(self.id, collected, &mut self.rx);
    }
}

/// Owns the shared report reader and hands out startup infos by id.
#[derive(Debug)]
pub struct Negotiator {
    state: Arc<Mutex<State>>,
    pump: JoinHandle<()>,
}

impl Negotiator {
    /// Starts pumping reports from `reports`.
    pub fn start<R>(reports: R) -> Self
    where
        R: ChannelReader + 'static,
    {
        let state = Arc::new(Mutex::new(State::default()));
        let pump = tokio::spawn(pump(reports, Arc::clone(&state)));
        Self { state, pump }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Waits for `n` startup infos tagged `id`, in arrival order.
    ///
    /// On timeout whatever was collected goes back to the buffer so a later
    /// request can still claim it. The same happens when the returned future
    /// is dropped.
    pub async fn request(
        &self,
        id: &str,
        n: usize,
        wait: Duration,
    ) -> Result<Vec<StartupInfo>, NegotiationError> {
        let deadline = Instant::now() + wait;
        let mut claim = {
            let mut state = self.lock();
            let mut collected = match state.entries.remove(id) {
                Some(Entry::Waiting(tx)) if !tx.is_closed() => {
                    state.entries.insert(id.to_string(), Entry::Waiting(tx));
                    return Err(NegotiationError::DuplicateRequest(id.to_string()));
                }
                Some(Entry::Buffered(infos)) => infos,
                Some(Entry::Waiting(_)) | None => Vec::new(),
            };
            if collected.len() >= n {
                let rest = collected.split_off(n);
                if !rest.is_empty() {
                    state.entries.insert(id.to_string(), Entry::Buffered(rest));
                }
                debug!(%id, n, "startup infos served from buffer");
                return Ok(collected);
            }
            if let Some(reason) = state.aborted.clone() {
                if !collected.is_empty() {
                    state.entries.insert(id.to_string(), Entry::Buffered(collected));
                }
                return Err(NegotiationError::Aborted {
                    id: id.to_string(),
                    reason,
                });
            }
            let (tx, rx) = mpsc::unbounded_channel();
            state.entries.insert(id.to_string(), Entry::Waiting(tx));
            Claim {
                negotiator: self,
                id,
                collected,
                rx,
            }
        };

        while claim.collected.len() < n {
            match timeout_at(deadline, claim.rx.recv()).await {
                Ok(Some(info)) => claim.collected.push(info),
                Ok(None) => {
                    let reason = self
                        .lock()
                        .aborted
                        .clone()
                        .unwrap_or_else(|| "report stream closed".into());
                    return Err(NegotiationError::Aborted {
                        id: id.to_string(),
                        reason,
                    });
                }
                Err(_) => {
                    return Err(NegotiationError::Timeout {
                        id: id.to_string(),
                        expected: n,
                        received: claim.collected.len(),
                    });
                }
            }
        }
        debug!(%id, n, "startup infos collected");
        Ok(std::mem::take(&mut claim.collected))
    }

    /// Infos buffered for `id` that nobody has claimed yet.
    pub fn buffered(&self, id: &str) -> usize {
        match self.lock().entries.get(id) {
            Some(Entry::Buffered(infos)) => infos.len(),
            _ => 0,
        }
    }

    /// Reason the report stream ended, if it has.
    pub fn aborted(&self) -> Option<String> {
        self.lock().aborted.clone()
    }
}

impl Drop for Negotiator {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn pump<R: ChannelReader>(reports: R, state: Arc<Mutex<State>>) {
    let reason = loop {
        match reports.read().await {
            Ok(Msg::Value(ip)) => match StartupReport::from_ip(&ip) {
                Ok(report) => {
                    debug!(id = %report.id, "startup info received");
                    lock(&state).deliver(report);
                }
                Err(e) => warn!(error = %e, "skipping malformed startup report"),
            },
            Ok(Msg::Done) => break "report stream done".to_string(),
            Err(e) => break e.to_string(),
        }
    };
    info!(%reason, "startup report stream ended");
    lock(&state).abort(reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, WriterHandle};
    use crate::message::Ip;

    fn info(tag: &str) -> StartupInfo {
        StartupInfo {
            buffer_size: 1,
            reader_refs: vec![format!("fbp://h:1/{tag}-r")],
            writer_refs: vec![format!("fbp://h:1/{tag}-w")],
        }
    }

    async fn report(w: &WriterHandle, id: &str, tag: &str) {
        w.write(StartupReport::new(id, info(tag)).to_msg().unwrap())
            .await
            .unwrap();
    }

    fn setup() -> (Negotiator, WriterHandle) {
        let chan = Channel::new(16);
        let w = chan.create_writer().unwrap();
        let n = Negotiator::start(chan.create_reader().unwrap());
        (n, w)
    }

    #[tokio::test]
    async fn early_reports_are_buffered() {
        let (neg, w) = setup();
        report(&w, "x", "1").await;
        report(&w, "y", "2").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(neg.buffered("x"), 1);

        let got = neg.request("y", 1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, vec![info("2")]);
        let got = neg.request("x", 1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, vec![info("1")]);
    }

    #[tokio::test]
    async fn interleaved_reports_keep_per_id_order() {
        let (neg, w) = setup();
        let neg = Arc::new(neg);
        let a = {
            let neg = Arc::clone(&neg);
            tokio::spawn(async move { neg.request("a", 2, Duration::from_secs(2)).await })
        };
        let b = {
            let neg = Arc::clone(&neg);
            tokio::spawn(async move { neg.request("b", 2, Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        report(&w, "b", "b1").await;
        report(&w, "a", "a1").await;
        report(&w, "a", "a2").await;
        report(&w, "b", "b2").await;

        assert_eq!(a.await.unwrap().unwrap(), vec![info("a1"), info("a2")]);
        assert_eq!(b.await.unwrap().unwrap(), vec![info("b1"), info("b2")]);
    }

    #[tokio::test]
    async fn timeout_returns_collected_infos_to_the_buffer() {
        let (neg, w) = setup();
        report(&w, "t", "1").await;
        let err = neg
            .request("t", 2, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            NegotiationError::Timeout {
                id: "t".into(),
                expected: 2,
                received: 1
            }
        );
        assert_eq!(neg.buffered("t"), 1);
        report(&w, "t", "2").await;
        let got = neg.request("t", 2, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, vec![info("1"), info("2")]);
    }

    #[tokio::test]
    async fn second_request_for_same_id_is_rejected() {
        let (neg, _w) = setup();
        let neg = Arc::new(neg);
        let first = {
            let neg = Arc::clone(&neg);
            tokio::spawn(async move { neg.request("d", 1, Duration::from_millis(200)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            neg.request("d", 1, Duration::from_millis(10)).await,
            Err(NegotiationError::DuplicateRequest("d".into()))
        );
        assert!(matches!(
            first.await.unwrap(),
            Err(NegotiationError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn cancelled_request_frees_its_id() {
        let (neg, w) = setup();
        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), neg.request("x", 1, Duration::from_secs(5))).await;
        assert!(cancelled.is_err());

        report(&w, "x", "1").await;
        let got = neg.request("x", 1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, vec![info("1")]);
    }

    #[tokio::test]
    async fn cancelled_request_keeps_what_it_collected() {
        let (neg, w) = setup();
        report(&w, "p", "1").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), neg.request("p", 2, Duration::from_secs(5))).await;
        assert!(cancelled.is_err());
        assert_eq!(neg.buffered("p"), 1);
    }

    #[tokio::test]
    async fn stream_end_aborts_waiters() {
        let (neg, w) = setup();
        let neg = Arc::new(neg);
        let waiting = {
            let neg = Arc::clone(&neg);
            tokio::spawn(async move { neg.request("z", 1, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        w.write(Msg::Done).await.unwrap();
        assert!(matches!(
            waiting.await.unwrap(),
            Err(NegotiationError::Aborted { .. })
        ));
        assert!(neg.aborted().is_some());
        assert!(matches!(
            neg.request("later", 1, Duration::from_secs(5)).await,
            Err(NegotiationError::Aborted { .. })
        ));
    }

    #[tokio::test]
    async fn malformed_reports_are_skipped() {
        let (neg, w) = setup();
        w.write(Msg::Value(Ip::new("garbage"))).await.unwrap();
        report(&w, "ok", "1").await;
        let got = neg.request("ok", 1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.len(), 1);
        assert!(neg.aborted().is_none());
    }
}
