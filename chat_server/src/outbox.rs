use chat_protocol::{ServerEvent, SessionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc::{channel, error::TrySendError, Receiver, Sender};
use tracing::warn;

/// Events a session may have queued before it is treated as stalled.
pub const MAILBOX_CAPACITY: usize = 128;

/// Outbound queues of every live session.
///
/// Sends never block. A queue whose socket writer is gone, or that has
/// fallen `MAILBOX_CAPACITY` events behind, is dropped on the next delivery
/// attempt; its session then sees the end of its stream and disconnects.
#[derive(Default)]
pub struct Mailboxes {
    boxes: Mutex<HashMap<SessionId, Sender<ServerEvent>>>,
}

impl Mailboxes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a mailbox for a session, returning the receiving half.
    pub fn open(&self, id: SessionId) -> Receiver<ServerEvent> {
        let (tx, rx) = channel(MAILBOX_CAPACITY);
        self.boxes.lock().insert(id, tx);
        rx
    }

    pub fn close(&self, id: &SessionId) -> bool {
        self.boxes.lock().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.boxes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver to one session. Returns false if it is gone.
    pub fn deliver(&self, id: &SessionId, event: ServerEvent) -> bool {
        let mut guard = self.boxes.lock();
        let ok = match guard.get(id) {
            Some(tx) => offer(id, tx, event),
            None => return false,
        };
        if !ok {
            guard.remove(id);
        }
        ok
    }

    /// Deliver a copy to each listed session. Returns how many accepted it.
    pub fn deliver_many<'a, I>(&self, ids: I, event: &ServerEvent) -> usize
    where
        I: IntoIterator<Item = &'a SessionId>,
    {
        let mut guard = self.boxes.lock();
        let mut delivered = 0;
        let mut dead = Vec::new();
        for id in ids {
            if let Some(tx) = guard.get(id) {
                if offer(id, tx, event.clone()) {
                    delivered += 1;
                } else {
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            guard.remove(&id);
        }
        delivered
    }

    /// Deliver to every open mailbox except `exclude`.
    pub fn deliver_all(&self, event: &ServerEvent, exclude: Option<&SessionId>) -> usize {
        let mut guard = self.boxes.lock();
        let mut delivered = 0;
        guard.retain(|id, tx| {
            if Some(id) == exclude {
                return true;
            }
            let ok = offer(id, tx, event.clone());
            if ok {
                delivered += 1;
            }
            ok
        });
        delivered
    }
}

fn offer(id: &SessionId, tx: &Sender<ServerEvent>, event: ServerEvent) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(session = %id, "mailbox full, dropping stalled session");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}
