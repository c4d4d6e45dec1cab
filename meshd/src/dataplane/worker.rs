//! Per-queue worker threads
//!
//! A worker runs one pipeline in a loop on its own OS thread:
//! - Outgoing: device → resolve destination → plugins ascending → socket
//! - Incoming: socket → resolve sender → plugins descending → device
//!
//! Every packet that is read produces exactly one metric, dropped or not.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::{io, mem};

use nix::libc;
use smoltcp::wire::Ipv4Packet;
use tracing::{debug, trace, warn};

use super::PipelineContext;
use crate::metric::{Flow, Metric};
use crate::payload::BUFFER_SIZE;
use crate::plugin::Direction;

/// One step of a worker loop.
pub trait Pipeline: Send + 'static {
    /// Process at most one packet. Returns `true` if it was delivered.
    fn pipeline(&self, buf: &mut [u8]) -> bool;
}

/// Destination of a raw IPv4 packet.
fn destination(packet: &[u8]) -> Option<Ipv4Addr> {
    let packet = Ipv4Packet::new_checked(packet).ok()?;
    (packet.version() == 4).then(|| Ipv4Addr::from(packet.dst_addr()))
}

fn report(ctx: &PipelineContext, metric: Metric) {
    if ctx.metrics.try_send(metric).is_err() {
        trace!("metric channel full");
    }
}

/// Device to transport.
pub struct Outgoing {
    queue: usize,
    ctx: PipelineContext,
}

impl Outgoing {
    pub fn new(queue: usize, ctx: PipelineContext) -> Self {
        Self { queue, ctx }
    }

    fn metric(&self, bytes: usize, dropped: bool, peer: Option<Ipv4Addr>) {
        report(
            &self.ctx,
            Metric {
                queue: self.queue,
                flow: Flow::Tx,
                bytes: bytes as u64,
                dropped,
                private_ip: peer,
            },
        );
    }
}

impl Pipeline for Outgoing {
    fn pipeline(&self, buf: &mut [u8]) -> bool {
        let Some(mut payload) = self.ctx.device.read(self.queue, buf) else {
            return false;
        };
        let bytes = payload.packet_len();

        let Some(dst) = destination(payload.packet()) else {
            trace!(queue = self.queue, "not an ipv4 packet");
            self.metric(bytes, true, None);
            return false;
        };
        let Some(mapping) = self.ctx.router.resolve(dst) else {
            trace!(queue = self.queue, dst = %dst, "no mapping");
            self.metric(bytes, true, None);
            return false;
        };

        payload.set_ip(self.ctx.local_ip);
        if !self
            .ctx
            .plugins
            .apply(Direction::Outgoing, &mut payload, &mapping)
        {
            self.metric(payload.length(), true, Some(mapping.private_ip));
            return false;
        }

        let sent = self.ctx.socket.write(self.queue, &payload, &mapping);
        self.metric(payload.length(), !sent, Some(mapping.private_ip));
        sent
    }
}

/// Transport to device.
pub struct Incoming {
    queue: usize,
    ctx: PipelineContext,
}

impl Incoming {
    pub fn new(queue: usize, ctx: PipelineContext) -> Self {
        Self { queue, ctx }
    }

    fn metric(&self, bytes: usize, dropped: bool, peer: Option<Ipv4Addr>) {
        report(
            &self.ctx,
            Metric {
                queue: self.queue,
                flow: Flow::Rx,
                bytes: bytes as u64,
                dropped,
                private_ip: peer,
            },
        );
    }
}

impl Pipeline for Incoming {
    fn pipeline(&self, buf: &mut [u8]) -> bool {
        let Some(mut payload) = self.ctx.socket.read(self.queue, buf) else {
            return false;
        };
        let bytes = payload.length();
        let sender = payload.ip();

        let Some(mapping) = self.ctx.router.resolve(sender) else {
            trace!(queue = self.queue, sender = %sender, "datagram from unknown node");
            self.metric(bytes, true, None);
            return false;
        };

        if !self
            .ctx
            .plugins
            .apply(Direction::Incoming, &mut payload, &mapping)
        {
            self.metric(bytes, true, Some(sender));
            return false;
        }

        let written = self.ctx.device.write(self.queue, &payload);
        self.metric(bytes, !written, Some(sender));
        written
    }
}

/// Handle to a running worker
pub struct WorkerHandle {
    /// Worker thread join handle
    thread: Option<JoinHandle<()>>,
    /// Shutdown signal
    shutdown: Arc<AtomicBool>,
    /// Thread name
    pub name: String,
}

impl WorkerHandle {
    /// Signal the worker to stop after its current read
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Wait for the worker to finish
    pub fn join(mut self) -> Result<(), String> {
        if let Some(handle) = self.thread.take() {
            handle
                .join()
                .map_err(|_| "Worker thread panicked".to_string())
        } else {
            Ok(())
        }
    }

    /// Check if the worker is still running
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn a thread running `pipeline` until stopped, optionally pinned to `core`.
pub fn spawn_worker<P: Pipeline>(
    name: String,
    pipeline: P,
    core: Option<usize>,
) -> io::Result<WorkerHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let thread_name = name.clone();

    let thread = thread::Builder::new().name(name.clone()).spawn(move || {
        if let Some(core) = core
            && let Err(e) = pin_to_core(core)
        {
            warn!(worker = %thread_name, core, error = %e, "failed to pin worker");
        }
        debug!(worker = %thread_name, "worker started");

        let mut buf = vec![0u8; BUFFER_SIZE];
        while !shutdown_clone.load(Ordering::Relaxed) {
            pipeline.pipeline(&mut buf);
        }
        debug!(worker = %thread_name, "worker exited");
    })?;

    Ok(WorkerHandle {
        thread: Some(thread),
        shutdown,
        name,
    })
}

fn pin_to_core(core: usize) -> io::Result<()> {
    let ret = unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_SET(core, &mut set);
        libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
