//! One duel between two players, and its state machine.
//!
//! ```text
//!            first correct verdict
//!   Active ─────────────────────────> Completed
//!      │
//!      └──────────────────────────> Abandoned
//!            a player disconnects
//! ```
//!
//! A session is created with both players attached and never goes back to `Active`. Verifications
//! are serialized: one in flight at a time, further submissions wait in FIFO order.

use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::channel::ChannelRef;
use crate::error::DuelError;
use crate::task_catalog::Task;

/// Opaque identity of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(u64);

impl ParticipantId {
    /// Returns an identity never returned before by this process.
    pub fn next() -> ParticipantId {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ParticipantId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> SessionId {
        SessionId(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub channel: ChannelRef,
    pub code: String,
    pub solved: bool,
    pub attempts: u32,
}

impl Participant {
    pub fn new(id: ParticipantId, name: String, channel: ChannelRef) -> Participant {
        Participant {
            id,
            name,
            channel,
            code: String::new(),
            solved: false,
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Completed,
    Abandoned,
}

/// A submission accepted by the session, waiting for or undergoing verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub participant: ParticipantId,
    pub attempt: u32,
    pub code: String,
}

/// What happened to an accepted submission.
#[derive(Debug, PartialEq, Eq)]
pub enum Accepted {
    /// Nothing else was in flight: verify it now.
    Start(Submission),
    /// Waits behind the opponent's verification.
    Queued { attempt: u32 },
}

/// Outcome of applying a verification result.
#[derive(Debug, PartialEq, Eq)]
pub enum Resolution {
    /// The submitter won; the session is now `Completed`.
    Won { duration: Duration },
    /// Wrong answer. The next queued submission, if any, must be verified now.
    Rejected { next: Option<Submission> },
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    players: [Participant; 2],
    task: Arc<Task>,
    status: SessionStatus,
    started: Instant,
    winner: Option<ParticipantId>,
    in_flight: Option<ParticipantId>,
    queued: VecDeque<Submission>,
}

impl Session {
    pub fn new(first: Participant, second: Participant, task: Arc<Task>) -> Session {
        Session {
            id: SessionId::new(),
            players: [first, second],
            task,
            status: SessionStatus::Active,
            started: Instant::now(),
            winner: None,
            in_flight: None,
            queued: VecDeque::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn winner(&self) -> Option<ParticipantId> {
        self.winner
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn players(&self) -> &[Participant; 2] {
        &self.players
    }

    pub fn is_open(&self) -> bool {
        self.status == SessionStatus::Active && self.winner.is_none()
    }

    pub fn participant(&self, id: ParticipantId) -> Option<&Participant> {
        self.players.iter().find(|p| p.id == id)
    }

    pub fn opponent(&self, id: ParticipantId) -> Option<&Participant> {
        self.participant(id)?;
        self.players.iter().find(|p| p.id != id)
    }

    fn participant_mut(&mut self, id: ParticipantId) -> Result<&mut Participant, DuelError> {
        self.players
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(DuelError::NotInSession)
    }

    fn ensure_open(&self) -> Result<(), DuelError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(DuelError::SessionClosed)
        }
    }

    /// Stores the latest code of `id` and returns the opponent to relay it to.
    pub fn update_code(&mut self, id: ParticipantId, code: &str) -> Result<&Participant, DuelError> {
        self.ensure_open()?;
        let player = self.participant_mut(id)?;
        player.code.clear();
        player.code.push_str(code);
        self.opponent(id).ok_or(DuelError::NotInSession)
    }

    fn has_outstanding(&self, id: ParticipantId) -> bool {
        self.in_flight == Some(id) || self.queued.iter().any(|s| s.participant == id)
    }

    /// Accepts a submission and counts the attempt.
    ///
    /// # Errors
    ///
    /// [`DuelError::SubmissionPending`] if `id` already has a submission in flight or queued; the
    /// attempt is not counted then.
    pub fn submit(&mut self, id: ParticipantId, code: String) -> Result<Accepted, DuelError> {
        self.ensure_open()?;
        if self.has_outstanding(id) {
            return Err(DuelError::SubmissionPending);
        }
        let player = self.participant_mut(id)?;
        player.attempts += 1;
        player.code.clone_from(&code);
        let submission = Submission {
            participant: id,
            attempt: player.attempts,
            code,
        };

        if self.in_flight.is_none() {
            self.in_flight = Some(id);
            Ok(Accepted::Start(submission))
        } else {
            let attempt = submission.attempt;
            self.queued.push_back(submission);
            Ok(Accepted::Queued { attempt })
        }
    }

    /// Applies the verification result of `id`'s in-flight submission.
    pub fn finish_verification(
        &mut self,
        id: ParticipantId,
        correct: bool,
    ) -> Result<Resolution, DuelError> {
        self.ensure_open()?;
        if self.in_flight != Some(id) {
            return Err(DuelError::NotInSession);
        }
        self.in_flight = None;

        if correct {
            self.participant_mut(id)?.solved = true;
            self.winner = Some(id);
            self.status = SessionStatus::Completed;
            self.queued.clear();
            return Ok(Resolution::Won {
                duration: self.elapsed(),
            });
        }

        let next = self.queued.pop_front();
        self.in_flight = next.as_ref().map(|s| s.participant);
        Ok(Resolution::Rejected { next })
    }

    /// Tears the session down after `leaver` disconnected. The remaining player wins by walkover
    /// and is returned.
    pub fn abandon(&mut self, leaver: ParticipantId) -> Result<&Participant, DuelError> {
        self.ensure_open()?;
        let remaining = self.opponent(leaver).ok_or(DuelError::NotInSession)?.id;
        self.status = SessionStatus::Abandoned;
        self.winner = Some(remaining);
        self.in_flight = None;
        self.queued.clear();
        self.participant(remaining).ok_or(DuelError::NotInSession)
    }
}
