//! Flow demultiplexer and per-flow actors.
//!
//! The [`Supervisor`] owns the flow table and is driven from a single task.
//! Each active flow gets its own actor task that owns the algorithm
//! instance and drains a bounded queue; the two sides only talk through
//! channels. An actor that sees no traffic for `idle_timeout` exits and
//! posts a [`Reaped`] notice, which the supervisor applies if the notice
//! still matches the table entry.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use crate::algorithms::AlgorithmRegistry;
use crate::datapath::Backend;
use crate::wire::{FrameIter, Message};
use crate::{DropEvent, Flow, Measurement, PatternSender};

/// Runtime knobs of the control plane.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Packet size handed to every new flow, bytes
    pub packet_size: u32,
    /// Initial window handed to every new flow, packets
    pub init_cwnd_pkts: u32,
    /// A flow with no traffic for this long is reclaimed
    pub idle_timeout: Duration,
    pub flow_queue_depth: usize,
    pub outbound_queue_depth: usize,
    pub inbound_queue_depth: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            packet_size: crate::DEFAULT_PACKET_SIZE,
            init_cwnd_pkts: crate::DEFAULT_INIT_CWND_PKTS,
            idle_timeout: Duration::from_secs(60),
            flow_queue_depth: 64,
            outbound_queue_depth: 256,
            inbound_queue_depth: 1024,
        }
    }
}

/// Work item for a flow actor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlowEvent {
    Measurement(Measurement),
    Drop(DropEvent),
}

/// Posted by a flow actor that exited on its idle timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reaped {
    pub flow_id: u32,
    pub generation: u64,
}

struct FlowSlot {
    tx: mpsc::Sender<FlowEvent>,
    generation: u64,
    alg: &'static str,
}

pub struct Supervisor {
    config: SupervisorConfig,
    registry: AlgorithmRegistry,
    flows: HashMap<u32, FlowSlot>,
    next_generation: u64,
    outbound: mpsc::Sender<Message>,
    reap_tx: mpsc::Sender<Reaped>,
    reap_rx: mpsc::Receiver<Reaped>,
}

impl Supervisor {
    /// Returns the supervisor and the queue of messages its flows produce
    /// for the datapath. Must be called from within a tokio runtime.
    pub fn new(
        config: SupervisorConfig,
        registry: AlgorithmRegistry,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_queue_depth);
        let (reap_tx, reap_rx) = mpsc::channel(config.flow_queue_depth);
        let supervisor = Self {
            config,
            registry,
            flows: HashMap::new(),
            next_generation: 0,
            outbound,
            reap_tx,
            reap_rx,
        };
        (supervisor, outbound_rx)
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn is_active(&self, flow_id: u32) -> bool {
        self.flows.contains_key(&flow_id)
    }

    pub fn active_flows(&self) -> usize {
        self.flows.len()
    }

    /// Algorithm driving `flow_id`, if the flow is active.
    pub fn algorithm(&self, flow_id: u32) -> Option<&'static str> {
        self.flows.get(&flow_id).map(|slot| slot.alg)
    }

    /// Split a received buffer into frames and dispatch each one.
    /// Malformed frames are logged and skipped.
    pub fn handle_frames(&mut self, buf: &[u8]) {
        for frame in FrameIter::new(buf) {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Discarding {} bytes with bad framing: {}", buf.len(), e);
                    return;
                }
            };

            match Message::decode(frame) {
                Ok(msg) => self.dispatch(msg),
                Err(e) => warn!("Discarding malformed frame: {}", e),
            }
        }
    }

    pub fn dispatch(&mut self, msg: Message) {
        match msg {
            Message::Create {
                flow_id,
                start_seq,
                alg,
            } => self.on_create(flow_id, start_seq, &alg),
            Message::Measure {
                flow_id,
                measurement,
            } => self.on_measurement(flow_id, measurement),
            Message::Drop { flow_id, event } => self.on_drop(flow_id, event),
            Message::Pattern { flow_id, .. } => {
                warn!(flow_id, "Datapath sent a pattern, ignoring");
            }
        }
    }

    pub fn on_create(&mut self, flow_id: u32, start_seq: u32, alg: &str) {
        if let Some(slot) = self.flows.get(&flow_id) {
            // an actor that already exited is replaced rather than blocking
            // the id until its notice is processed
            if !slot.tx.is_closed() {
                error!(
                    flow_id,
                    requested = alg,
                    running = slot.alg,
                    "Create for active flow, keeping existing state"
                );
                return;
            }
        }

        let Some(mut flow) = self.registry.get_or_fallback(alg) else {
            error!(flow_id, requested = alg, "No algorithm available, flow not created");
            return;
        };

        let name = flow.name();
        let sender = PatternSender::new(flow_id, self.outbound.clone());
        flow.create(
            flow_id,
            sender,
            self.config.packet_size,
            start_seq,
            self.config.init_cwnd_pkts,
        );

        let (tx, rx) = mpsc::channel(self.config.flow_queue_depth);
        self.next_generation += 1;
        let generation = self.next_generation;
        tokio::spawn(run_flow(
            flow_id,
            generation,
            flow,
            rx,
            self.config.idle_timeout,
            self.reap_tx.clone(),
        ));

        self.flows.insert(
            flow_id,
            FlowSlot {
                tx,
                generation,
                alg: name,
            },
        );
        info!(flow_id, alg = name, start_seq, "New flow");
    }

    pub fn on_measurement(&mut self, flow_id: u32, measurement: Measurement) {
        self.enqueue(flow_id, FlowEvent::Measurement(measurement));
    }

    pub fn on_drop(&mut self, flow_id: u32, event: DropEvent) {
        self.enqueue(flow_id, FlowEvent::Drop(event));
    }

    /// Remove a flow now. Its actor stops once the queue is dropped.
    pub fn close_flow(&mut self, flow_id: u32) -> bool {
        let removed = self.flows.remove(&flow_id).is_some();
        if removed {
            info!(flow_id, "Flow closed");
        }
        removed
    }

    /// Wait for the next idle notice from a flow actor.
    pub async fn next_reaped(&mut self) -> Option<Reaped> {
        self.reap_rx.recv().await
    }

    /// Apply an idle notice. Returns true if the flow was removed.
    pub fn reclaim(&mut self, notice: Reaped) -> bool {
        match self.flows.get(&notice.flow_id) {
            Some(slot) if slot.generation == notice.generation => {
                self.flows.remove(&notice.flow_id);
                info!(flow_id = notice.flow_id, "Reclaimed idle flow");
                true
            }
            _ => {
                debug!(
                    flow_id = notice.flow_id,
                    generation = notice.generation,
                    "Stale idle notice"
                );
                false
            }
        }
    }

    fn enqueue(&mut self, flow_id: u32, event: FlowEvent) {
        let Some(slot) = self.flows.get(&flow_id) else {
            warn!(flow_id, ?event, "Message for unknown flow, dropping");
            return;
        };

        match slot.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(flow_id, ?event, "Flow queue full, dropping");
            }
            Err(TrySendError::Closed(_)) => {
                warn!(flow_id, ?event, "Flow actor has exited, dropping");
                self.flows.remove(&flow_id);
            }
        }
    }
}

async fn run_flow(
    flow_id: u32,
    generation: u64,
    mut flow: Box<dyn Flow>,
    mut rx: mpsc::Receiver<FlowEvent>,
    idle_timeout: Duration,
    reap: mpsc::Sender<Reaped>,
) {
    loop {
        match tokio::time::timeout(idle_timeout, rx.recv()).await {
            Ok(Some(FlowEvent::Measurement(m))) => flow.on_measurement(m),
            Ok(Some(FlowEvent::Drop(event))) => flow.on_drop(event),
            Ok(None) => {
                debug!(flow_id, "Flow queue closed, actor exiting");
                return;
            }
            Err(_) => {
                info!(flow_id, "No traffic for {:?}, flow idle", idle_timeout);
                // close the queue first so a create racing the notice sees
                // this flow as gone
                drop(rx);
                // supervisor gone means nobody left to tell
                let _ = reap.send(Reaped { flow_id, generation }).await;
                return;
            }
        }
    }
}

/// Run the control plane over `backend` until `shutdown` resolves or the
/// datapath stream ends.
pub async fn serve<B, S>(
    mut backend: B,
    config: SupervisorConfig,
    registry: AlgorithmRegistry,
    shutdown: S,
) -> anyhow::Result<()>
where
    B: Backend,
    S: Future<Output = ()>,
{
    let mut inbound = backend
        .listen(config.inbound_queue_depth)
        .context("failed to start datapath listener")?;
    info!(
        algorithms = ?registry.list(),
        idle_timeout = ?config.idle_timeout,
        "Control plane running"
    );

    let (mut supervisor, mut outbound) = Supervisor::new(config, registry);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            frame = inbound.recv() => match frame {
                Some(buf) => supervisor.handle_frames(&buf),
                None => {
                    info!("Datapath stream ended");
                    break;
                }
            },
            Some(msg) = outbound.recv() => send_message(&backend, &msg),
            Some(notice) = supervisor.next_reaped() => {
                supervisor.reclaim(notice);
            }
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
        }
    }

    // flush what the flows already produced
    while let Ok(msg) = outbound.try_recv() {
        send_message(&backend, &msg);
    }

    info!("Closing datapath, {} flows active", supervisor.active_flows());
    backend.close().context("failed to close datapath backend")?;
    Ok(())
}

fn send_message<B: Backend>(backend: &B, msg: &Message) {
    let frame = match msg.encode() {
        Ok(frame) => frame,
        Err(e) => {
            warn!(flow_id = msg.flow_id(), "Failed to encode message: {}", e);
            return;
        }
    };

    if let Err(e) = backend.send(&frame) {
        warn!(flow_id = msg.flow_id(), "Failed to send to datapath: {}", e);
    }
}
