//! The core of the server: matchmaking queue, live sessions and the routing of player events.
//!
//! All mutable state lives behind a single lock. Every event is applied as one short critical
//! section. Deliveries are collected in an [`Outbox`] and performed once the lock is released,
//! except the notice of a queued submission, which must precede the verdict it waits for.
//! Verifications run on the [`VerificationPool`], never under the lock.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use rand::RngCore;
use tracing::{debug, error, info, trace};

use crate::channel::{channel_ref, deliver, ChannelRef, ClientChannel, Outbox};
use crate::error::DuelError;
use crate::matchmaking::{Enqueued, MatchQueue};
use crate::protocol::{parse_client_event, sanitize_name, ClientEvent, GameOutcome, ServerEvent};
use crate::registry::SessionRegistry;
use crate::session::{Accepted, Participant, ParticipantId, Resolution, Session, SessionId, Submission};
use crate::task_catalog::{Task, TaskCatalog};
use crate::verifier::pool::{VerificationJob, VerificationPool};
use crate::verifier::{Judge, Verdict};

const INTERNAL_ERROR: &str = "internal server error";
const VERIFIER_FAILURE: &str = "Internal error while checking the solution";

/// One connected player, as seen by the lobby.
#[derive(Clone)]
pub struct Client {
    pub id: ParticipantId,
    pub channel: ChannelRef,
}

impl Client {
    /// Gives a fresh identity to `channel`. The caller keeps the only strong reference.
    pub fn new<C: ClientChannel + 'static>(channel: &Arc<C>) -> Client {
        Client {
            id: ParticipantId::next(),
            channel: channel_ref(channel),
        }
    }
}

struct LobbyState {
    queue: MatchQueue,
    sessions: SessionRegistry,
    catalog: TaskCatalog,
    rng: Box<dyn RngCore + Send>,
}

pub struct Lobby {
    state: Mutex<LobbyState>,
    pool: VerificationPool,
    me: Weak<Lobby>,
}

impl Lobby {
    /// Creates a lobby verifying submissions with `judge` on `workers` threads.
    ///
    /// `rng` drives task selection; pass a seeded one for reproducible pairings.
    pub fn new(
        catalog: TaskCatalog,
        judge: Arc<dyn Judge>,
        workers: usize,
        rng: impl RngCore + Send + 'static,
    ) -> anyhow::Result<Arc<Lobby>> {
        anyhow::ensure!(!catalog.is_empty(), "the task catalog is empty");
        let pool = VerificationPool::new(judge, workers)?;
        info!(tasks = catalog.len(), workers = pool.workers(), "lobby ready");
        Ok(Arc::new_cyclic(|me| Lobby {
            state: Mutex::new(LobbyState {
                queue: MatchQueue::new(),
                sessions: SessionRegistry::new(),
                catalog,
                rng: Box::new(rng),
            }),
            pool,
            me: me.clone(),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, LobbyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handles one raw inbound frame. Never fails: every problem becomes an `error` reply to
    /// `client`, and a panic is confined to this event.
    pub fn handle_frame(&self, client: &Client, frame: &str) {
        let handled = catch_unwind(AssertUnwindSafe(|| {
            let event = parse_client_event(frame)?;
            self.handle_event(client, event)
        }));
        match handled {
            Ok(Ok(())) => {}
            Ok(Err(rejection)) => {
                debug!(participant = %client.id, "rejected: {rejection}");
                deliver(&client.channel, &ServerEvent::error(rejection.to_string()));
            }
            Err(_) => {
                error!(participant = %client.id, "internal error while handling an event");
                deliver(&client.channel, &ServerEvent::error(INTERNAL_ERROR));
            }
        }
    }

    pub fn handle_event(&self, client: &Client, event: ClientEvent) -> Result<(), DuelError> {
        match event {
            ClientEvent::JoinQueue { name } => self.join_queue(client, name.as_deref()),
            ClientEvent::CodeUpdate { code } => self.update_code(client, code),
            ClientEvent::SubmitSolution { code } => self.submit_solution(client, code),
            ClientEvent::Ping {} => {
                deliver(&client.channel, &ServerEvent::Pong {});
                Ok(())
            }
        }
    }

    /// Queues `client`, or pairs them with the earliest waiting player.
    ///
    /// Joining again while already waiting changes nothing.
    pub fn join_queue(&self, client: &Client, name: Option<&str>) -> Result<(), DuelError> {
        let name = sanitize_name(name);
        let mut outbox = Outbox::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.sessions.contains_participant(client.id) {
                return Err(DuelError::AlreadyInSession);
            }

            match state.queue.enqueue(client.id, client.channel.clone(), name) {
                Enqueued::AlreadyQueued => debug!(participant = %client.id, "already waiting"),
                Enqueued::Waiting { position } => {
                    info!(participant = %client.id, position, "waiting for an opponent");
                    outbox.push(
                        &client.channel,
                        ServerEvent::QueueJoined {
                            message: format!("Waiting for an opponent... (players in queue: {position})"),
                        },
                    );
                }
                Enqueued::Paired { first, second } => {
                    let task = state.catalog.pick(state.rng.as_mut());
                    let session = Session::new(
                        Participant::new(first.id, first.name, first.channel),
                        Participant::new(second.id, second.name, second.channel),
                        task.clone(),
                    );
                    announce_start(&session, &task, &mut outbox);
                    info!(
                        session = %session.id(),
                        first = %first.id,
                        second = %second.id,
                        task = %task.title,
                        "session started"
                    );
                    state.sessions.insert(session);
                }
            }
        }
        outbox.flush();
        Ok(())
    }

    /// Relays `code` to the opponent. Ignored outside an active session.
    pub fn update_code(&self, client: &Client, code: String) -> Result<(), DuelError> {
        let mut guard = self.lock();
        let Some(session) = guard.sessions.lookup_mut(client.id) else {
            trace!(participant = %client.id, "code update outside a session ignored");
            return Ok(());
        };
        let opponent = session.update_code(client.id, &code)?.channel.clone();
        drop(guard);

        trace!(participant = %client.id, bytes = code.len(), "code relayed");
        deliver(&opponent, &ServerEvent::OpponentCodeUpdate { code });
        Ok(())
    }

    /// Accepts a submission and starts its verification, or queues it behind the opponent's.
    pub fn submit_solution(&self, client: &Client, code: String) -> Result<(), DuelError> {
        let mut outbox = Outbox::new();
        let start;
        {
            let mut guard = self.lock();
            let session = guard
                .sessions
                .lookup_mut(client.id)
                .ok_or(DuelError::NotInSession)?;
            let session_id = session.id();
            let task = session.task().clone();

            start = match session.submit(client.id, code)? {
                Accepted::Start(submission) => {
                    outbox.push(&client.channel, checking(submission.attempt));
                    Some((session_id, task, submission))
                }
                Accepted::Queued { attempt } => {
                    debug!(session = %session_id, participant = %client.id, attempt, "submission queued");
                    // under the lock, ahead of the notices of the verification it waits for
                    deliver(
                        &client.channel,
                        &ServerEvent::CheckingSolution {
                            message: format!(
                                "Your solution will be checked after your opponent's... (attempt {attempt})"
                            ),
                        },
                    );
                    None
                }
            };
        }
        outbox.flush();

        if let Some((session_id, task, submission)) = start {
            self.dispatch(session_id, task, submission);
        }
        Ok(())
    }

    fn dispatch(&self, session_id: SessionId, task: Arc<Task>, submission: Submission) {
        let Submission {
            participant,
            attempt,
            code,
        } = submission;
        debug!(session = %session_id, %participant, attempt, "verification dispatched");

        let lobby = self.me.clone();
        let job = VerificationJob {
            source: code,
            task,
            on_done: Box::new(move |verdict| match lobby.upgrade() {
                Some(lobby) => lobby.complete_verification(session_id, participant, attempt, verdict),
                None => debug!(session = %session_id, "lobby gone, verdict discarded"),
            }),
        };
        if let Err(e) = self.pool.submit(job) {
            self.complete_verification(session_id, participant, attempt, Err(e));
        }
    }

    /// Applies a verdict. A verdict for a session that is already over is discarded.
    pub fn complete_verification(
        &self,
        session_id: SessionId,
        participant: ParticipantId,
        attempt: u32,
        verdict: anyhow::Result<Verdict>,
    ) {
        if let Err(e) = &verdict {
            error!(session = %session_id, %participant, attempt, "verification failed: {e:#}");
        }
        let correct = verdict.as_ref().is_ok_and(Verdict::is_correct);

        let mut outbox = Outbox::new();
        let mut next_job = None;
        {
            let mut guard = self.lock();
            let Some(session) = guard.sessions.get_mut(session_id) else {
                debug!(session = %session_id, %participant, "verdict for a finished session discarded");
                return;
            };
            let resolution = match session.finish_verification(participant, correct) {
                Ok(resolution) => resolution,
                Err(e) => {
                    debug!(session = %session_id, %participant, "verdict discarded: {e}");
                    return;
                }
            };

            match resolution {
                Resolution::Won { duration } => {
                    announce_result(session, participant, duration.as_secs_f64(), &mut outbox);
                    info!(
                        session = %session_id,
                        winner = %participant,
                        attempt,
                        seconds = duration.as_secs_f64(),
                        "session completed"
                    );
                    guard.sessions.remove(session_id);
                }
                Resolution::Rejected { next } => {
                    if let Ok(verdict) = &verdict {
                        info!(session = %session_id, %participant, attempt, %verdict, "submission rejected");
                    }
                    if let Some(player) = session.participant(participant) {
                        outbox.push(
                            &player.channel,
                            ServerEvent::SolutionIncorrect {
                                message: format!(
                                    "Incorrect solution (attempt {attempt}). {}",
                                    rejection_detail(&verdict)
                                ),
                                attempts: player.attempts,
                            },
                        );
                    }
                    if let Some(next) = next {
                        if let Some(player) = session.participant(next.participant) {
                            outbox.push(&player.channel, checking(next.attempt));
                        }
                        next_job = Some((session.task().clone(), next));
                    }
                }
            }
        }
        outbox.flush();

        if let Some((task, next)) = next_job {
            self.dispatch(session_id, task, next);
        }
    }

    /// Forgets `id`: out of the queue if waiting, otherwise its session is abandoned and the
    /// opponent wins by walkover. Idempotent.
    pub fn disconnect(&self, id: ParticipantId) {
        let mut guard = self.lock();
        if guard.queue.remove(id).is_some() {
            info!(participant = %id, "left the queue");
            return;
        }
        let Some(session) = guard.sessions.lookup_mut(id) else {
            return;
        };
        let session_id = session.id();
        let remaining = match session.abandon(id) {
            Ok(remaining) => remaining.channel.clone(),
            Err(e) => {
                debug!(session = %session_id, participant = %id, "could not abandon: {e}");
                return;
            }
        };
        guard.sessions.remove(session_id);
        drop(guard);

        info!(session = %session_id, participant = %id, "session abandoned");
        deliver(
            &remaining,
            &ServerEvent::OpponentDisconnected {
                message: "Your opponent disconnected. You win by walkover!".to_string(),
            },
        );
    }

    pub fn is_queued(&self, id: ParticipantId) -> bool {
        self.lock().queue.contains(id)
    }

    /// The active session `id` plays in.
    pub fn session_of(&self, id: ParticipantId) -> Option<SessionId> {
        self.lock().sessions.lookup(id).map(Session::id)
    }

    pub fn waiting_count(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn active_sessions(&self) -> usize {
        self.lock().sessions.len()
    }
}

fn checking(attempt: u32) -> ServerEvent {
    ServerEvent::CheckingSolution {
        message: format!("Checking your solution... (attempt {attempt})"),
    }
}

fn announce_start(session: &Session, task: &Arc<Task>, outbox: &mut Outbox) {
    let [first, second] = session.players();
    for (player, opponent) in [(first, second), (second, first)] {
        outbox.push(
            &player.channel,
            ServerEvent::GameStarted {
                session_id: session.id().to_string(),
                task: task.clone(),
                opponent_name: opponent.name.clone(),
            },
        );
    }
}

fn announce_result(session: &Session, winner: ParticipantId, seconds: f64, outbox: &mut Outbox) {
    let Some(winner_name) = session.participant(winner).map(|p| p.name.as_str()) else {
        return;
    };
    for player in session.players() {
        let (result, message) = if player.id == winner {
            (
                GameOutcome::Win,
                format!("Congratulations! You won in {seconds:.1} seconds!"),
            )
        } else {
            (
                GameOutcome::Lose,
                format!("You lost. {winner_name} solved the task in {seconds:.1} seconds."),
            )
        };
        outbox.push(
            &player.channel,
            ServerEvent::GameResult {
                result,
                message,
                attempts: player.attempts,
                duration: seconds,
            },
        );
    }
}

fn rejection_detail(verdict: &anyhow::Result<Verdict>) -> String {
    match verdict {
        Ok(Verdict::CompileError(diagnostic)) => format!("Compilation error: {diagnostic}"),
        Ok(Verdict::IncorrectSolution(evidence)) => evidence.clone(),
        Ok(Verdict::TimedOut) => "Time limit exceeded.".to_string(),
        Ok(Verdict::Correct) => String::new(),
        Err(_) => VERIFIER_FAILURE.to_string(),
    }
}
