use crate::billing::Ledger;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CallState {
    Trying,
    Ringing,
    Connected,
    Ended,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveCall {
    pub session_id: String,
    pub tenant_id: String,
    pub from: String,
    pub to: String,
    pub call_id: String,
    pub state: CallState,
    pub start_time: DateTime<Utc>,
    pub rate: f64,
}

pub struct CallControlOptions {
    pub rate: f64,
    pub workers: usize,
    pub queue_depth: usize,
}

impl From<&crate::config::Config> for CallControlOptions {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            rate: config.bill_rate,
            workers: config.bill_workers,
            queue_depth: config.bill_queue_depth,
        }
    }
}

/// Tracks every call the proxy is handling and charges connected calls
/// once per second through a fixed worker pool.
///
/// A single dispatcher snapshots the call map each tick and enqueues
/// jobs with a non-blocking send; when the bounded queue fills, the rest
/// of the tick is dropped and re-attempted on the next one. Workers that
/// hit an empty balance remove the call and hand it to the proxy engine
/// for BYE teardown via the termination channel.
pub struct CallControl {
    calls: RwLock<HashMap<String, ActiveCall>>,
    ledger: Arc<dyn Ledger>,
    jobs: mpsc::Sender<ActiveCall>,
    terminations: mpsc::UnboundedSender<ActiveCall>,
    cancel_token: CancellationToken,
    rate: f64,
}

impl CallControl {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        options: CallControlOptions,
        cancel_token: CancellationToken,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ActiveCall>) {
        let (jobs_tx, jobs_rx) = mpsc::channel(options.queue_depth.max(1));
        let (terminations_tx, terminations_rx) = mpsc::unbounded_channel();

        let control = Arc::new(Self {
            calls: RwLock::new(HashMap::new()),
            ledger,
            jobs: jobs_tx,
            terminations: terminations_tx,
            cancel_token,
            rate: options.rate,
        });

        let jobs_rx = Arc::new(tokio::sync::Mutex::new(jobs_rx));
        for _ in 0..options.workers.max(1) {
            tokio::spawn(control.clone().billing_worker(jobs_rx.clone()));
        }
        tokio::spawn(control.clone().dispatch_loop());

        (control, terminations_rx)
    }

    /// Insert a new call in `Trying`. A second INVITE on the same
    /// Call-ID is authoritative and replaces the prior entry.
    pub fn start_call(&self, from: &str, to: &str, call_id: &str, tenant_id: &str) -> String {
        let session_id = Uuid::new_v4().to_string();
        let call = ActiveCall {
            session_id: session_id.clone(),
            tenant_id: tenant_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            call_id: call_id.to_string(),
            state: CallState::Trying,
            start_time: Utc::now(),
            rate: self.rate,
        };

        let count = {
            let mut calls = self.calls.write().unwrap();
            calls.insert(call_id.to_string(), call);
            calls.len()
        };
        crate::metrics::sip::set_active_calls(count);
        info!(%call_id, %session_id, %tenant_id, "call session started");
        session_id
    }

    pub fn on_ringing(&self, call_id: &str) {
        let mut calls = self.calls.write().unwrap();
        if let Some(call) = calls.get_mut(call_id) {
            if call.state == CallState::Trying {
                call.state = CallState::Ringing;
            }
        }
    }

    /// Billing starts at the answer instant, not the INVITE instant.
    pub fn on_answer(&self, call_id: &str) {
        let mut calls = self.calls.write().unwrap();
        if let Some(call) = calls.get_mut(call_id) {
            call.state = CallState::Connected;
            call.start_time = Utc::now();
            info!(%call_id, "call connected");
        }
    }

    pub fn end_call(&self, call_id: &str) {
        let count = {
            let mut calls = self.calls.write().unwrap();
            if calls.remove(call_id).is_none() {
                return;
            }
            calls.len()
        };
        crate::metrics::sip::set_active_calls(count);
        info!(%call_id, "call ended");
    }

    pub fn active_calls(&self) -> Vec<ActiveCall> {
        self.calls.read().unwrap().values().cloned().collect()
    }

    /// Tear the call down without waiting for a BYE from either side.
    pub fn force_terminate(&self, call_id: &str) {
        let (removed, count) = {
            let mut calls = self.calls.write().unwrap();
            let removed = calls.remove(call_id);
            (removed, calls.len())
        };
        if let Some(mut call) = removed {
            crate::metrics::sip::set_active_calls(count);
            call.state = CallState::Ended;
            self.terminations.send(call).ok();
        }
    }

    async fn dispatch_loop(self: Arc<Self>) {
        let period = Duration::from_millis(1000);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let connected: Vec<ActiveCall> = {
                let calls = self.calls.read().unwrap();
                calls
                    .values()
                    .filter(|call| call.state == CallState::Connected)
                    .cloned()
                    .collect()
            };

            for call in connected {
                match self.jobs.try_send(call) {
                    Ok(()) => {}
                    Err(TrySendError::Full(call)) => {
                        debug!(
                            call_id = %call.call_id,
                            "billing queue full, dropping remainder of tick"
                        );
                        break;
                    }
                    Err(TrySendError::Closed(_)) => return,
                }
            }
        }
    }

    async fn billing_worker(
        self: Arc<Self>,
        jobs: Arc<tokio::sync::Mutex<mpsc::Receiver<ActiveCall>>>,
    ) {
        loop {
            let job = {
                let mut jobs = jobs.lock().await;
                tokio::select! {
                    _ = self.cancel_token.cancelled() => None,
                    job = jobs.recv() => job,
                }
            };
            let Some(call) = job else { break };

            if let Err(e) = self.ledger.deduct(&call.from, call.rate) {
                warn!(
                    call_id = %call.call_id,
                    from = %call.from,
                    error = %e,
                    "deduction failed, terminating call"
                );
                crate::metrics::billing::deduction_error();
                self.force_terminate(&call.call_id);
            }
        }
    }
}
