//! Per-packet telemetry and its aggregation.

use std::collections::BTreeMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Capacity of the metric channel.
pub const METRIC_BACKLOG: usize = 1000;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Flow {
    Rx,
    Tx,
}

/// One packet's outcome, as reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metric {
    pub queue: usize,
    pub flow: Flow,
    pub bytes: u64,
    pub dropped: bool,
    /// Peer the packet was exchanged with, when known.
    pub private_ip: Option<Ipv4Addr>,
}

pub fn channel() -> (Sender<Metric>, Receiver<Metric>) {
    crossbeam_channel::bounded(METRIC_BACKLOG)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Counters {
    pub packets: u64,
    pub bytes: u64,
    pub dropped_packets: u64,
    pub dropped_bytes: u64,
}

impl Counters {
    fn record(&mut self, metric: &Metric) {
        if metric.dropped {
            self.dropped_packets += 1;
            self.dropped_bytes += metric.bytes;
        } else {
            self.packets += 1;
            self.bytes += metric.bytes;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlowStats {
    #[serde(flatten)]
    pub total: Counters,
    pub links: BTreeMap<Ipv4Addr, Counters>,
    pub queues: Vec<Counters>,
}

impl FlowStats {
    fn record(&mut self, metric: &Metric) {
        self.total.record(metric);
        if let Some(ip) = metric.private_ip {
            self.links.entry(ip).or_default().record(metric);
        }
        if self.queues.len() <= metric.queue {
            self.queues.resize(metric.queue + 1, Counters::default());
        }
        self.queues[metric.queue].record(metric);
    }
}

/// Running totals per direction, link and queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsLog {
    pub tx_metrics: FlowStats,
    pub rx_metrics: FlowStats,
}

impl MetricsLog {
    pub fn new(queues: usize) -> Self {
        let flow = FlowStats {
            queues: vec![Counters::default(); queues],
            ..Default::default()
        };
        Self {
            tx_metrics: flow.clone(),
            rx_metrics: flow,
        }
    }

    pub fn record(&mut self, metric: &Metric) {
        match metric.flow {
            Flow::Tx => self.tx_metrics.record(metric),
            Flow::Rx => self.rx_metrics.record(metric),
        }
    }
}

/// Background thread folding metrics into a [`MetricsLog`].
pub struct Aggregator {
    log: Arc<Mutex<MetricsLog>>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Aggregator {
    /// Start draining `rx`. A JSON snapshot is logged every `report_interval`.
    pub fn spawn(
        rx: Receiver<Metric>,
        queues: usize,
        report_interval: Option<Duration>,
    ) -> io::Result<Self> {
        let log = Arc::new(Mutex::new(MetricsLog::new(queues)));
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread = {
            let log = log.clone();
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("metrics".to_string())
                .spawn(move || run(rx, log, shutdown, report_interval))?
        };

        Ok(Self {
            log,
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn snapshot(&self) -> MetricsLog {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Stop after draining what is already queued.
    pub fn stop(mut self) -> MetricsLog {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("metrics thread panicked");
        }
        self.snapshot()
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

fn run(
    rx: Receiver<Metric>,
    log: Arc<Mutex<MetricsLog>>,
    shutdown: Arc<AtomicBool>,
    report_interval: Option<Duration>,
) {
    let mut last_report = Instant::now();

    while !shutdown.load(Ordering::SeqCst) {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(metric) => log
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .record(&metric),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if let Some(interval) = report_interval
            && last_report.elapsed() >= interval
        {
            last_report = Instant::now();
            let snapshot = log.lock().unwrap_or_else(|e| e.into_inner()).clone();
            match serde_json::to_string(&snapshot) {
                Ok(json) => info!(stats = %json, "traffic stats"),
                Err(e) => warn!(error = %e, "failed to encode stats"),
            }
        }
    }

    let mut log = log.lock().unwrap_or_else(|e| e.into_inner());
    for metric in rx.try_iter() {
        log.record(&metric);
    }
    debug!("metrics thread exited");
}
