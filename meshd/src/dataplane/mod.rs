//! Packet forwarding between the virtual device and the transport.
//!
//! Each queue index gets one outgoing and one incoming worker thread. A
//! queue owns its own device fd and socket, so workers never contend on
//! I/O; the only shared state is the mapping table behind the [`Router`].

pub mod tun;
pub mod udp;
pub mod worker;

use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::{error, info};

use crate::mapping::Mapping;
use crate::metric::Metric;
use crate::payload::Payload;
use crate::plugin::PluginChain;
use crate::router::Router;

pub use tun::TunDevice;
pub use udp::UdpTransport;
pub use worker::{Incoming, Outgoing, Pipeline, WorkerHandle, spawn_worker};

/// Local virtual network device.
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    fn queues(&self) -> usize;

    /// Read one packet into the packet region of `buf`.
    ///
    /// Returns `None` on timeout, error or once the device is closed.
    fn read<'a>(&self, queue: usize, buf: &'a mut [u8]) -> Option<Payload<'a>>;

    fn write(&self, queue: usize, payload: &Payload<'_>) -> bool;

    /// Stop serving reads. Blocked readers return shortly after.
    fn close(&self) -> io::Result<()>;
}

/// Datagram transport to the other nodes.
pub trait Socket: Send + Sync {
    /// Receive one datagram into `buf`.
    fn read<'a>(&self, queue: usize, buf: &'a mut [u8]) -> Option<Payload<'a>>;

    /// Send the wire form of `payload` to `mapping`'s endpoint.
    fn write(&self, queue: usize, payload: &Payload<'_>, mapping: &Mapping) -> bool;

    fn close(&self) -> io::Result<()>;

    fn fds(&self) -> Vec<RawFd>;
}

/// Everything a pipeline needs besides its queue index.
#[derive(Clone)]
pub struct PipelineContext {
    pub device: Arc<dyn Device>,
    pub socket: Arc<dyn Socket>,
    pub router: Router,
    pub plugins: Arc<PluginChain>,
    /// Our own overlay address, stamped on outgoing datagrams.
    pub local_ip: Ipv4Addr,
    pub metrics: Sender<Metric>,
}

#[derive(Debug, Clone)]
pub struct DataplaneSettings {
    pub workers: usize,
    /// Pin queue `n` to core `n % cores`.
    pub pin_workers: bool,
}

/// Running worker threads for every queue.
pub struct Dataplane {
    workers: Vec<WorkerHandle>,
    device: Arc<dyn Device>,
    socket: Arc<dyn Socket>,
}

impl Dataplane {
    pub fn start(settings: &DataplaneSettings, ctx: PipelineContext) -> io::Result<Self> {
        let queues = settings.workers.min(ctx.device.queues()).max(1);
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let mut workers = Vec::with_capacity(queues * 2);
        for queue in 0..queues {
            let core = settings.pin_workers.then_some(queue % cores);
            workers.push(spawn_worker(
                format!("out-{queue}"),
                Outgoing::new(queue, ctx.clone()),
                core,
            )?);
            workers.push(spawn_worker(
                format!("in-{queue}"),
                Incoming::new(queue, ctx.clone()),
                core,
            )?);
        }

        info!(queues, device = %ctx.device.name(), "data plane started");
        Ok(Self {
            workers,
            device: ctx.device,
            socket: ctx.socket,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Signal every worker, close the collaborators and wait for the threads.
    pub fn stop(self) {
        for worker in &self.workers {
            worker.stop();
        }
        if let Err(e) = self.device.close() {
            error!(error = %e, "failed to close device");
        }
        if let Err(e) = self.socket.close() {
            error!(error = %e, "failed to close socket");
        }
        for worker in self.workers {
            let name = worker.name.clone();
            if let Err(e) = worker.join() {
                error!(worker = %name, error = %e, "worker did not exit cleanly");
            }
        }
        info!("data plane stopped");
    }
}
