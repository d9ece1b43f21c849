//! One-at-a-time request/reply correlation on the CFG characteristic
//!
//! A request owns the single pending slot from submit until its reply is
//! final. The reply is the matching ACK plus every TLV record that arrives
//! after it, until the stream goes quiet or the overall deadline passes.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use uwb_proto::{AckRecord, CommandFrame, ConfigMessage, Opcode, TlvFrame};

use crate::Error;
use crate::link::{LinkEvent, LinkHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyTiming {
    /// Deadline for the ACK, from submission
    pub ack_timeout: Duration,
    /// Silence after the last ACK/TLV that ends collection
    pub quiet_period: Duration,
    /// Hard cap on the whole exchange, from submission
    pub overall_timeout: Duration,
}

impl Default for ReplyTiming {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(1500),
            quiet_period: Duration::from_millis(300),
            overall_timeout: Duration::from_millis(3000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reply {
    pub ack: AckRecord,
    /// TLV records that arrived after the ACK, in arrival order
    pub records: TlvFrame,
    /// A TLV notification ran past its buffer; `records` holds what decoded
    pub truncated: bool,
}

#[derive(Debug)]
struct PendingRequest {
    request_id: u16,
    created_at: Instant,
    ack: Option<AckRecord>,
    collected: TlvFrame,
    truncated: bool,
    last_activity: Instant,
    signal: Arc<Notify>,
}

/// Frees the slot held by `request_id` on drop, including when the caller's
/// future is cancelled mid-write or mid-wait
struct SlotRelease<'a> {
    correlator: &'a Correlator,
    request_id: u16,
}

impl SlotRelease<'_> {
    /// Hand the slot over to a later `await_reply`
    fn keep(self) -> u16 {
        let id = self.request_id;
        std::mem::forget(self);
        id
    }
}

impl Drop for SlotRelease<'_> {
    fn drop(&mut self) {
        self.correlator.release(self.request_id);
    }
}

pub struct Correlator {
    link: LinkHandle,
    next_id: AtomicU16,
    slot: Mutex<Option<PendingRequest>>,
}

impl Correlator {
    pub fn new(link: LinkHandle) -> Self {
        Self::starting_at(link, 1)
    }

    /// First request id is `id`; ids wrap at 0xFFFF
    pub fn starting_at(link: LinkHandle, id: u16) -> Self {
        Self {
            link,
            next_id: AtomicU16::new(id),
            slot: Mutex::new(None),
        }
    }

    pub fn link(&self) -> &LinkHandle {
        &self.link
    }

    fn slot(&self) -> MutexGuard<'_, Option<PendingRequest>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send a command and wait for its reply
    pub async fn request(
        &self,
        opcode: Opcode,
        payload: TlvFrame,
        timing: ReplyTiming,
    ) -> Result<Reply, Error> {
        let id = self.submit(opcode, payload).await?;
        self.await_reply(id, timing).await
    }

    /// Allocate an id, reserve the slot and write the command.
    ///
    /// Fails with `Busy` while another request holds the slot, `LinkNotReady`
    /// outside `Ready`, and `PayloadTooLarge` when the SET payload does not
    /// fit one write. None of these consume an id. If the returned id is
    /// never passed to [`Correlator::await_reply`], the slot stays taken
    /// until the link drops; [`Correlator::request`] does both.
    pub async fn submit(&self, opcode: Opcode, payload: TlvFrame) -> Result<u16, Error> {
        let (id, bytes) = {
            let mut slot = self.slot();
            if let Some(pending) = slot.as_ref() {
                return Err(Error::Busy(pending.request_id));
            }

            let snapshot = self.link.snapshot();
            if !snapshot.is_ready() {
                return Err(Error::LinkNotReady);
            }

            let mut frame = CommandFrame::new(opcode, 0, payload);
            frame.check_capacity(snapshot.write_capacity())?;

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            frame.request_id = id;

            let now = Instant::now();
            *slot = Some(PendingRequest {
                request_id: id,
                created_at: now,
                ack: None,
                collected: TlvFrame::new(),
                truncated: false,
                last_activity: now,
                signal: Arc::new(Notify::new()),
            });
            (id, frame.to_bytes())
        };

        let release = SlotRelease {
            correlator: self,
            request_id: id,
        };

        info!(target: "CFG", req = id, ?opcode, len = bytes.len(), "command");
        if let Err(e) = self.link.send_config(&bytes).await {
            warn!(target: "CFG", req = id, error = %e, "command write failed");
            return Err(e);
        }
        Ok(release.keep())
    }

    /// Wait for the reply to `request_id`; the slot is free afterwards
    pub async fn await_reply(&self, request_id: u16, timing: ReplyTiming) -> Result<Reply, Error> {
        let release = SlotRelease {
            correlator: self,
            request_id,
        };
        let result = self.collect(request_id, timing).await;
        drop(release);
        match &result {
            Ok(reply) => info!(
                target: "CFG",
                req = request_id,
                status = reply.ack.status,
                applied = reply.ack.applied_count,
                records = reply.records.len(),
                truncated = reply.truncated,
                "reply"
            ),
            Err(e) => warn!(target: "CFG", req = request_id, error = %e, "request failed"),
        }
        result
    }

    async fn collect(&self, request_id: u16, timing: ReplyTiming) -> Result<Reply, Error> {
        loop {
            let (deadline, signal) = {
                let slot = self.slot();
                let Some(pending) = slot.as_ref().filter(|p| p.request_id == request_id) else {
                    return Err(Error::LinkDropped(request_id));
                };
                let now = Instant::now();
                let overall = pending.created_at + timing.overall_timeout;

                match pending.ack {
                    None => {
                        let deadline = overall.min(pending.created_at + timing.ack_timeout);
                        if now >= deadline {
                            return Err(Error::Timeout(request_id));
                        }
                        (deadline, pending.signal.clone())
                    }
                    Some(ack) => {
                        let deadline = overall.min(pending.last_activity + timing.quiet_period);
                        if now >= deadline {
                            return Ok(Reply {
                                ack,
                                records: pending.collected.clone(),
                                truncated: pending.truncated,
                            });
                        }
                        (deadline, pending.signal.clone())
                    }
                }
            };

            // Notify keeps a permit, so a wake between unlock and here is not lost
            let _ = tokio::time::timeout_at(deadline, signal.notified()).await;
        }
    }

    fn release(&self, request_id: u16) {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|p| p.request_id == request_id) {
            *slot = None;
        }
    }

    /// Feed link events into the pending slot until the link goes away.
    /// Run this as its own task.
    pub async fn route(&self, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
        while let Some(event) = events.recv().await {
            self.dispatch(event);
        }
        debug!(target: "CFG", "link event stream closed");
        self.dispatch(LinkEvent::Down);
    }

    fn dispatch(&self, event: LinkEvent) {
        let mut slot = self.slot();

        if let LinkEvent::Down = event {
            if let Some(pending) = slot.take() {
                warn!(target: "CFG", req = pending.request_id, "link down with request in flight");
                pending.signal.notify_one();
            }
            return;
        }

        let Some(pending) = slot.as_mut() else {
            if let LinkEvent::Config(ConfigMessage::Ack(ack)) = &event {
                warn!(target: "CFG", req = ack.request_id, "ACK with no request pending");
            }
            return;
        };

        match event {
            LinkEvent::Config(ConfigMessage::Ack(ack)) => {
                if ack.request_id != pending.request_id {
                    warn!(
                        target: "CFG",
                        got = ack.request_id,
                        expected = pending.request_id,
                        "ACK for another request ignored"
                    );
                    return;
                }
                if pending.ack.is_some() {
                    debug!(target: "CFG", req = ack.request_id, "duplicate ACK ignored");
                    return;
                }
                pending.ack = Some(ack);
                pending.last_activity = Instant::now();
                pending.signal.notify_one();
            }
            LinkEvent::Config(ConfigMessage::Tlv(frame)) => {
                if pending.ack.is_none() {
                    debug!(target: "CFG", records = frame.len(), "TLV before ACK dropped");
                    return;
                }
                pending.collected.extend(frame);
                pending.last_activity = Instant::now();
                pending.signal.notify_one();
            }
            LinkEvent::TruncatedTlv(frame) => {
                if pending.ack.is_none() {
                    debug!(target: "CFG", records = frame.len(), "truncated TLV before ACK dropped");
                    return;
                }
                pending.collected.extend(frame);
                pending.truncated = true;
                pending.last_activity = Instant::now();
                pending.signal.notify_one();
            }
            LinkEvent::Config(ConfigMessage::State(_) | ConfigMessage::Heartbeat(_)) => {}
            LinkEvent::Down => {}
        }
    }
}
