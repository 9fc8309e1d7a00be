//! Shared receive multiplexer.
//!
//! A [`ReceiverGroup`] fans one bounded `receive()` across every attached
//! [`Receiver`]. Each pass updates all receivers first (so discovery-driven
//! topology changes land before the wait), gathers a flat socket vector with
//! per-receiver interval counts, polls it, and routes ready sockets back to
//! their owners. After anything fired, the set is re-gathered and re-polled
//! with a zero timeout until a pass finds nothing ready: readiness from the
//! transport is edge-triggered, so stopping earlier would strand messages
//! that arrived while the first one was being handled.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::Result;
use crate::transport::{self, Context, PollItem};

/// Upper bound for one inner wait. Keeps `update()` running roughly once a
/// second even under an indefinite `receive()`.
const BLOCK_MAX: Duration = Duration::from_millis(1000);

/// Capabilities the multiplexer needs from an attached receiver.
pub trait Receiver {
    /// Append this receiver's pollable sockets, in an order that is stable
    /// for the current poll cycle.
    fn add_sockets(&self, out: &mut Vec<PollItem>);

    /// Handle one pending message on a ready socket without blocking.
    /// Returns whether a message was consumed.
    fn process(&self, item: &PollItem) -> bool;

    /// Periodic housekeeping; runs before every poll so topology changes
    /// are visible to the next wait.
    fn update(&self);
}

/// Handle onto a shared multiplexer. Clones address the same group;
/// receivers register on construction and expire with their last strong
/// reference. Groups are single-threaded by construction (`!Send`).
#[derive(Clone)]
pub struct ReceiverGroup {
    shared: Rc<GroupShared>,
}

struct GroupShared {
    context: Context,
    receivers: RefCell<Vec<Weak<dyn Receiver>>>,
}

impl ReceiverGroup {
    pub fn new() -> Self {
        Self {
            shared: Rc::new(GroupShared {
                context: Context::new(),
                receivers: RefCell::new(Vec::new()),
            }),
        }
    }

    /// The transport context shared by every receiver in this group.
    pub fn context(&self) -> Context {
        self.shared.context.clone()
    }

    pub fn attach(&self, receiver: &Rc<dyn Receiver>) {
        self.shared
            .receivers
            .borrow_mut()
            .push(Rc::downgrade(receiver));
    }

    /// Attached receivers still alive.
    pub fn receiver_count(&self) -> usize {
        self.live().len()
    }

    /// Deliver at least one event within `timeout`; `None` waits
    /// indefinitely. Returns `true` once something was processed and the
    /// ready set has been drained, `false` when the budget ran out idle.
    pub fn receive(&self, timeout: Option<Duration>) -> Result<bool> {
        let Some(total) = timeout else {
            loop {
                self.update_all();
                if self.poll_and_drain(BLOCK_MAX)? {
                    return Ok(true);
                }
            }
        };

        // Never block the whole budget at once: short waits keep update()
        // running so receivers can chase discovery while we wait.
        let block = BLOCK_MAX.min(total / 10);
        let start = Instant::now();
        loop {
            self.update_all();

            let elapsed = start.elapsed();
            let wait = if elapsed < total {
                (total - elapsed).min(block)
            } else {
                Duration::ZERO
            };

            if self.poll_and_drain(wait)? {
                return Ok(true);
            }
            if start.elapsed() >= total {
                return Ok(false);
            }
        }
    }

    fn update_all(&self) {
        for receiver in self.live() {
            receiver.update();
        }
    }

    /// One poll pass plus the edge-triggered drain. The socket set is
    /// re-gathered every iteration because processing may change it.
    fn poll_and_drain(&self, first_wait: Duration) -> Result<bool> {
        let mut processed = false;
        let mut wait = first_wait;
        loop {
            let receivers = self.live();
            let mut items = Vec::new();
            let mut intervals = Vec::with_capacity(receivers.len());
            for receiver in &receivers {
                let before = items.len();
                receiver.add_sockets(&mut items);
                intervals.push(items.len() - before);
            }

            let ready = transport::poll(&items, Some(wait))?;
            if !ready.iter().any(|&r| r) {
                return Ok(processed);
            }

            // Track each ready socket down to the receiver that supplied it
            // through the interval counts, then continue non-blocking until
            // the set runs dry.
            wait = Duration::ZERO;
            let mut offset = 0;
            for (receiver, count) in receivers.iter().zip(&intervals) {
                for index in offset..offset + count {
                    if ready[index] && receiver.process(&items[index]) {
                        processed = true;
                    }
                }
                offset += count;
            }
        }
    }

    fn live(&self) -> Vec<Rc<dyn Receiver>> {
        let mut receivers = self.shared.receivers.borrow_mut();
        receivers.retain(|weak| weak.strong_count() > 0);
        let live: Vec<_> = receivers.iter().filter_map(Weak::upgrade).collect();
        if live.len() < receivers.len() {
            trace!("pruned expired receivers");
        }
        live
    }
}

impl Default for ReceiverGroup {
    fn default() -> Self {
        Self::new()
    }
}
