use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use code_duel::prelude::*;
use code_duel::protocol::GameOutcome;
use code_duel::task_catalog::Task;
use rand::{rngs::StdRng, SeedableRng};
use serde_json::json;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

fn init_test_logger() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Decides from the source text alone. When gated, every verdict waits for a `release()`.
struct ScriptedJudge {
    gate: Option<Mutex<mpsc::Receiver<()>>>,
}

impl ScriptedJudge {
    fn immediate() -> Arc<ScriptedJudge> {
        Arc::new(ScriptedJudge { gate: None })
    }

    fn gated() -> (Arc<ScriptedJudge>, mpsc::Sender<()>) {
        let (release, gate) = mpsc::channel();
        (
            Arc::new(ScriptedJudge {
                gate: Some(Mutex::new(gate)),
            }),
            release,
        )
    }
}

impl Judge for ScriptedJudge {
    fn judge(&self, source: &str, task: &Task) -> anyhow::Result<Verdict> {
        if let Some(gate) = &self.gate {
            let _ = gate.lock().unwrap().recv_timeout(EVENT_TIMEOUT);
        }
        match source {
            "correct" => Ok(Verdict::Correct),
            "broken" => Ok(Verdict::CompileError("expected ';' before '}' token".to_string())),
            "slow" => Ok(Verdict::TimedOut),
            "crash" => anyhow::bail!("compiler vanished"),
            "panic" => panic!("judge panicked"),
            _ => Ok(Verdict::IncorrectSolution(format!(
                "Test 1 failed: {}(...) expected 1, got 0",
                task.function_name
            ))),
        }
    }
}

struct Player {
    client: Client,
    // keeps the channel alive: the lobby only holds a weak reference
    _channel: Arc<MemoryChannel>,
    events: mpsc::Receiver<ServerEvent>,
}

impl Player {
    fn connect() -> Player {
        let (channel, events) = MemoryChannel::new();
        Player {
            client: Client::new(&channel),
            _channel: channel,
            events,
        }
    }

    fn send(&self, lobby: &Lobby, frame: serde_json::Value) {
        lobby.handle_frame(&self.client, &frame.to_string());
    }

    fn next(&self) -> ServerEvent {
        self.events
            .recv_timeout(EVENT_TIMEOUT)
            .expect("expected an event")
    }

    fn assert_quiet(&self) {
        if let Ok(event) = self.events.recv_timeout(QUIET) {
            panic!("unexpected event {event:?}");
        }
    }
}

fn lobby(judge: Arc<dyn Judge>) -> Arc<Lobby> {
    init_test_logger();
    Lobby::new(
        TaskCatalog::builtin().unwrap(),
        judge,
        2,
        StdRng::seed_from_u64(7),
    )
    .unwrap()
}

fn join(lobby: &Lobby, player: &Player, name: &str) {
    player.send(lobby, json!({"type": "join_queue", "name": name}));
}

/// Pairs two fresh players and drains their `game_started`.
fn duel(lobby: &Lobby) -> (Player, Player) {
    let (a, b) = (Player::connect(), Player::connect());
    join(lobby, &a, "alice");
    assert!(matches!(a.next(), ServerEvent::QueueJoined { .. }));
    join(lobby, &b, "bob");
    assert!(matches!(a.next(), ServerEvent::GameStarted { .. }));
    assert!(matches!(b.next(), ServerEvent::GameStarted { .. }));
    (a, b)
}

fn submit(lobby: &Lobby, player: &Player, code: &str) {
    player.send(lobby, json!({"type": "submit_solution", "code": code}));
}

#[test]
fn players_are_paired_in_arrival_order() {
    let lobby = lobby(ScriptedJudge::immediate());
    let (a, b, c) = (Player::connect(), Player::connect(), Player::connect());

    join(&lobby, &a, "alice");
    match a.next() {
        ServerEvent::QueueJoined { message } => assert!(message.contains("players in queue: 1")),
        other => panic!("unexpected {other:?}"),
    }
    assert!(lobby.is_queued(a.client.id));

    join(&lobby, &b, "bob");
    join(&lobby, &c, "carol");

    let ServerEvent::GameStarted {
        session_id,
        task,
        opponent_name,
    } = a.next()
    else {
        panic!("alice should have started a game");
    };
    assert_eq!(opponent_name, "bob");
    let ServerEvent::GameStarted {
        session_id: session_b,
        task: task_b,
        opponent_name,
    } = b.next()
    else {
        panic!("bob should have started a game");
    };
    assert_eq!(opponent_name, "alice");
    assert_eq!(session_id, session_b);
    assert_eq!(task, task_b);

    assert!(matches!(c.next(), ServerEvent::QueueJoined { .. }));
    assert_eq!(lobby.session_of(a.client.id), lobby.session_of(b.client.id));
    assert!(lobby.session_of(c.client.id).is_none());
    assert!(lobby.is_queued(c.client.id));
    assert!(!lobby.is_queued(a.client.id));
    assert_eq!(lobby.waiting_count(), 1);
    assert_eq!(lobby.active_sessions(), 1);
}

#[test]
fn joining_twice_changes_nothing() {
    let lobby = lobby(ScriptedJudge::immediate());
    let a = Player::connect();
    join(&lobby, &a, "alice");
    a.next();
    join(&lobby, &a, "alice");
    a.assert_quiet();
    assert_eq!(lobby.waiting_count(), 1);
}

#[test]
fn joining_from_a_game_is_refused() {
    let lobby = lobby(ScriptedJudge::immediate());
    let (a, _b) = duel(&lobby);
    join(&lobby, &a, "alice");
    assert!(matches!(a.next(), ServerEvent::Error { .. }));
    assert_eq!(lobby.waiting_count(), 0);
}

#[test]
fn code_is_relayed_to_the_opponent_only() {
    let lobby = lobby(ScriptedJudge::immediate());
    let (a, b) = duel(&lobby);
    a.send(&lobby, json!({"type": "code_update", "code": "int sum(int a, int b) {"}));
    assert_eq!(
        b.next(),
        ServerEvent::OpponentCodeUpdate {
            code: "int sum(int a, int b) {".to_string()
        }
    );
    a.assert_quiet();
}

#[test]
fn events_outside_a_game() {
    let lobby = lobby(ScriptedJudge::immediate());
    let a = Player::connect();
    a.send(&lobby, json!({"type": "code_update", "code": "x"}));
    a.assert_quiet();
    submit(&lobby, &a, "correct");
    assert!(matches!(a.next(), ServerEvent::Error { .. }));
}

#[test]
fn protocol_errors_keep_the_connection_usable() {
    let lobby = lobby(ScriptedJudge::immediate());
    let a = Player::connect();
    lobby.handle_frame(&a.client, "{not json");
    assert!(matches!(a.next(), ServerEvent::Error { .. }));
    a.send(&lobby, json!({"type": "surrender"}));
    match a.next() {
        ServerEvent::Error { message } => assert!(message.contains("surrender")),
        other => panic!("unexpected {other:?}"),
    }
    a.send(&lobby, json!({"type": "ping"}));
    assert_eq!(a.next(), ServerEvent::Pong {});
}

#[test]
fn wrong_answers_count_until_the_first_correct_one() {
    let lobby = lobby(ScriptedJudge::immediate());
    let (a, b) = duel(&lobby);

    submit(&lobby, &a, "wrong");
    assert!(matches!(a.next(), ServerEvent::CheckingSolution { .. }));
    match a.next() {
        ServerEvent::SolutionIncorrect { message, attempts } => {
            assert_eq!(attempts, 1);
            assert!(message.contains("Test 1 failed"), "{message}");
        }
        other => panic!("unexpected {other:?}"),
    }

    submit(&lobby, &a, "broken");
    assert!(matches!(a.next(), ServerEvent::CheckingSolution { .. }));
    match a.next() {
        ServerEvent::SolutionIncorrect { message, attempts } => {
            assert_eq!(attempts, 2);
            assert!(message.contains("Compilation error"), "{message}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(lobby.session_of(a.client.id).is_some());

    submit(&lobby, &a, "correct");
    assert!(matches!(a.next(), ServerEvent::CheckingSolution { .. }));
    match a.next() {
        ServerEvent::GameResult {
            result, attempts, ..
        } => {
            assert_eq!(result, GameOutcome::Win);
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected {other:?}"),
    }
    match b.next() {
        ServerEvent::GameResult {
            result,
            attempts,
            message,
            ..
        } => {
            assert_eq!(result, GameOutcome::Lose);
            assert_eq!(attempts, 0);
            assert!(message.contains("alice"), "{message}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(lobby.session_of(a.client.id).is_none());
    assert!(lobby.session_of(b.client.id).is_none());
    assert_eq!(lobby.active_sessions(), 0);
}

#[test]
fn verifier_failures_cost_an_attempt_but_not_the_game() {
    let lobby = lobby(ScriptedJudge::immediate());
    let (a, _b) = duel(&lobby);
    for (code, attempt) in [("crash", 1), ("panic", 2), ("slow", 3)] {
        submit(&lobby, &a, code);
        assert!(matches!(a.next(), ServerEvent::CheckingSolution { .. }));
        match a.next() {
            ServerEvent::SolutionIncorrect { attempts, .. } => assert_eq!(attempts, attempt),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert!(lobby.session_of(a.client.id).is_some());
}

#[test]
fn the_winner_is_decided_once() {
    let (judge, release) = ScriptedJudge::gated();
    let lobby = lobby(judge);
    let (a, b) = duel(&lobby);

    submit(&lobby, &a, "correct");
    assert!(matches!(a.next(), ServerEvent::CheckingSolution { .. }));
    submit(&lobby, &b, "correct");
    match b.next() {
        ServerEvent::CheckingSolution { message } => assert!(message.contains("opponent")),
        other => panic!("unexpected {other:?}"),
    }
    // a second submission while the first is pending is refused and not counted
    submit(&lobby, &a, "correct");
    assert!(matches!(a.next(), ServerEvent::Error { .. }));

    release.send(()).unwrap();
    match a.next() {
        ServerEvent::GameResult {
            result, attempts, ..
        } => {
            assert_eq!(result, GameOutcome::Win);
            assert_eq!(attempts, 1);
        }
        other => panic!("unexpected {other:?}"),
    }
    match b.next() {
        ServerEvent::GameResult {
            result, attempts, ..
        } => {
            assert_eq!(result, GameOutcome::Lose);
            assert_eq!(attempts, 1);
        }
        other => panic!("unexpected {other:?}"),
    }

    let _ = release.send(());
    a.assert_quiet();
    b.assert_quiet();
}

#[test]
fn a_queued_submission_runs_after_a_failed_one() {
    let (judge, release) = ScriptedJudge::gated();
    let lobby = lobby(judge);
    let (a, b) = duel(&lobby);

    submit(&lobby, &a, "wrong");
    a.next();
    submit(&lobby, &b, "correct");
    b.next();

    release.send(()).unwrap();
    assert!(matches!(a.next(), ServerEvent::SolutionIncorrect { attempts: 1, .. }));
    match b.next() {
        ServerEvent::CheckingSolution { message } => assert!(message.contains("attempt 1")),
        other => panic!("unexpected {other:?}"),
    }

    release.send(()).unwrap();
    assert!(matches!(
        b.next(),
        ServerEvent::GameResult {
            result: GameOutcome::Win,
            ..
        }
    ));
    assert!(matches!(
        a.next(),
        ServerEvent::GameResult {
            result: GameOutcome::Lose,
            ..
        }
    ));
}

#[test]
fn a_queued_notice_arrives_before_its_check_starts() {
    for _ in 0..20 {
        let (judge, release) = ScriptedJudge::gated();
        let lobby = lobby(judge);
        let (a, b) = duel(&lobby);

        submit(&lobby, &a, "wrong");
        a.next();
        let releaser = std::thread::spawn(move || {
            release.send(()).unwrap();
            release.send(()).unwrap();
        });
        submit(&lobby, &b, "correct");

        let mut notices = Vec::new();
        loop {
            match b.next() {
                ServerEvent::CheckingSolution { message } => notices.push(message),
                ServerEvent::GameResult { result, .. } => {
                    assert_eq!(result, GameOutcome::Win);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        releaser.join().unwrap();

        if let Some(queued) = notices.iter().position(|m| m.contains("after your opponent's")) {
            assert_eq!(queued, 0, "{notices:?}");
            assert_eq!(notices.len(), 2, "{notices:?}");
        } else {
            assert_eq!(notices.len(), 1, "{notices:?}");
        }
    }
}

#[test]
fn a_disconnect_hands_the_win_to_the_opponent() {
    let lobby = lobby(ScriptedJudge::immediate());
    let (a, b) = duel(&lobby);

    lobby.disconnect(a.client.id);
    assert!(matches!(b.next(), ServerEvent::OpponentDisconnected { .. }));
    lobby.disconnect(a.client.id);
    b.assert_quiet();

    assert!(lobby.session_of(a.client.id).is_none());
    assert!(lobby.session_of(b.client.id).is_none());
    assert_eq!(lobby.active_sessions(), 0);

    submit(&lobby, &b, "correct");
    assert!(matches!(b.next(), ServerEvent::Error { .. }));
    // free to play again
    join(&lobby, &b, "bob");
    assert!(matches!(b.next(), ServerEvent::QueueJoined { .. }));
}

#[test]
fn leaving_the_queue_before_pairing() {
    let lobby = lobby(ScriptedJudge::immediate());
    let (a, b) = (Player::connect(), Player::connect());
    join(&lobby, &a, "alice");
    a.next();
    lobby.disconnect(a.client.id);
    assert_eq!(lobby.waiting_count(), 0);

    join(&lobby, &b, "bob");
    assert!(matches!(b.next(), ServerEvent::QueueJoined { .. }));
    a.assert_quiet();
}

#[test]
fn a_verdict_after_teardown_is_discarded() {
    let (judge, release) = ScriptedJudge::gated();
    let lobby = lobby(judge);
    let (a, b) = duel(&lobby);

    submit(&lobby, &a, "correct");
    a.next();
    lobby.disconnect(a.client.id);
    assert!(matches!(b.next(), ServerEvent::OpponentDisconnected { .. }));

    release.send(()).unwrap();
    a.assert_quiet();
    b.assert_quiet();

    // the workers survived
    let (c, d) = duel(&lobby);
    submit(&lobby, &c, "correct");
    c.next();
    release.send(()).unwrap();
    assert!(matches!(c.next(), ServerEvent::GameResult { .. }));
    assert!(matches!(d.next(), ServerEvent::GameResult { .. }));
}

#[test]
fn a_closed_channel_does_not_disturb_the_opponent() {
    let lobby = lobby(ScriptedJudge::immediate());
    let (a, b) = duel(&lobby);
    // the transport is gone but no disconnect was reported yet
    drop(a._channel);

    submit(&lobby, &b, "correct");
    assert!(matches!(b.next(), ServerEvent::CheckingSolution { .. }));
    assert!(matches!(b.next(), ServerEvent::GameResult { .. }));
    lobby.handle_frame(&a.client, &json!({"type": "ping"}).to_string());
    assert!(a.events.try_recv().is_err());
}

#[test]
fn names_are_sanitized() {
    let lobby = lobby(ScriptedJudge::immediate());
    let (a, b) = (Player::connect(), Player::connect());
    a.send(&lobby, json!({"type": "join_queue"}));
    a.next();
    b.send(&lobby, json!({"type": "join_queue", "nickname": "x".repeat(100)}));
    let ServerEvent::GameStarted { opponent_name, .. } = a.next() else {
        panic!("expected game_started");
    };
    assert_eq!(opponent_name, "x".repeat(32));
    let ServerEvent::GameStarted { opponent_name, .. } = b.next() else {
        panic!("expected game_started");
    };
    assert_eq!(opponent_name, "Player");
}
