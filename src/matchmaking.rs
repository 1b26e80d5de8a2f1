//! FIFO queue of players waiting for an opponent.

use std::collections::VecDeque;

use crate::channel::ChannelRef;
use crate::session::ParticipantId;

#[derive(Debug)]
pub struct WaitingEntry {
    pub id: ParticipantId,
    pub channel: ChannelRef,
    pub name: String,
    /// Monotonic arrival number.
    pub order: u64,
}

/// Result of [`MatchQueue::enqueue`].
#[derive(Debug)]
pub enum Enqueued {
    /// The player was already waiting; nothing changed.
    AlreadyQueued,
    /// Nobody was waiting. `position` is 1-based.
    Waiting { position: usize },
    /// Paired with the earliest waiting player, who is `first`.
    Paired {
        first: WaitingEntry,
        second: WaitingEntry,
    },
}

#[derive(Debug, Default)]
pub struct MatchQueue {
    entries: VecDeque<WaitingEntry>,
    next_order: u64,
}

impl MatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a player, pairing them with the head of the queue if there is one.
    ///
    /// Dequeuing the head and pairing happen in the same call, so a concurrent arrival can never
    /// be paired against an entry that was already consumed (the caller holds the lobby lock).
    pub fn enqueue(&mut self, id: ParticipantId, channel: ChannelRef, name: String) -> Enqueued {
        if self.contains(id) {
            return Enqueued::AlreadyQueued;
        }
        let entry = WaitingEntry {
            id,
            channel,
            name,
            order: self.next_order,
        };
        self.next_order += 1;

        match self.entries.pop_front() {
            Some(first) => Enqueued::Paired {
                first,
                second: entry,
            },
            None => {
                self.entries.push_back(entry);
                Enqueued::Waiting {
                    position: self.entries.len(),
                }
            }
        }
    }

    /// Removes a waiting player. Idempotent.
    pub fn remove(&mut self, id: ParticipantId) -> Option<WaitingEntry> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        self.entries.remove(pos)
    }

    pub fn contains(&self, id: ParticipantId) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
