use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, RwLock};
use warp::ws::Message;

use crate::error::{QuizError, Result};

use super::messages::ServerMessage;
use super::room::{JoinOutcome, RoomState, RoomStatus};

pub type OutboundSender = mpsc::UnboundedSender<Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Presenter,
    Participant,
}

/// Commands drained by the room's single worker task. Everything that
/// mutates one room goes through this queue, which is what serializes
/// concurrent submissions.
pub enum RoomCommand {
    PresenterJoin {
        conn_id: String,
        sender: OutboundSender,
    },
    Join {
        conn_id: String,
        participant_id: String,
        display_name: String,
        avatar: Option<String>,
        sender: OutboundSender,
    },
    Disconnect {
        conn_id: String,
    },
    StartQuiz {
        conn_id: String,
    },
    OpenQuestion {
        conn_id: String,
        question_index: usize,
        time_limit_seconds: Option<u32>,
    },
    CloseQuestion {
        conn_id: String,
        correct_answer: Option<String>,
        reveal: bool,
    },
    AdvanceQuestion {
        conn_id: String,
        question_index: usize,
    },
    EndQuiz {
        conn_id: String,
    },
    SubmitAnswer {
        conn_id: String,
        question_index: usize,
        answer: String,
        response_time_ms: u64,
    },
    /// Sent by the external timer collaborator when a question's time budget
    /// elapses. Ignored unless the same question is still open under the
    /// same generation.
    QuestionTimeout {
        question_index: usize,
        generation: u64,
    },
    Summary {
        reply: oneshot::Sender<RoomSummary>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomSummary {
    pub status: RoomStatus,
    pub participant_count: usize,
}

/// Cheap handle to a room's command queue, stored in the registry and
/// cloned into every connection bound to the room.
#[derive(Clone, Debug)]
pub struct RoomHandle {
    pub code: String,
    tx: mpsc::UnboundedSender<RoomCommand>,
    ended_at: Arc<RwLock<Option<Instant>>>,
}

impl RoomHandle {
    pub fn send(&self, command: RoomCommand) {
        if self.tx.send(command).is_err() {
            tracing::warn!(room_code = %self.code, "Room worker is gone, command dropped");
        }
    }

    /// Synchronous query used by dashboards and status pages
    pub async fn summary(&self) -> Option<RoomSummary> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RoomCommand::Summary { reply }).is_err() {
            return None;
        }
        rx.await.ok()
    }

    pub async fn ended_at(&self) -> Option<Instant> {
        *self.ended_at.read().await
    }

    #[cfg(test)]
    pub async fn set_ended_at(&self, instant: Option<Instant>) {
        *self.ended_at.write().await = instant;
    }
}

struct Subscriber {
    role: Role,
    participant_id: Option<String>,
    sender: OutboundSender,
}

/// Spawns the worker task that owns the room state and returns its handle.
pub fn spawn_room(state: RoomState) -> RoomHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = RoomHandle {
        code: state.code.clone(),
        tx: tx.clone(),
        ended_at: Arc::new(RwLock::new(None)),
    };

    // The actor only keeps a weak sender for its timers, so the worker
    // stops once the registry and all connections drop their handles.
    let mut actor = RoomActor {
        state,
        subscribers: HashMap::new(),
        self_tx: tx.downgrade(),
        ended_at: handle.ended_at.clone(),
    };
    drop(tx);

    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            actor.handle(command).await;
        }
        tracing::debug!(room_code = %actor.state.code, "Room worker stopped");
    });

    handle
}

struct RoomActor {
    state: RoomState,
    subscribers: HashMap<String, Subscriber>,
    self_tx: mpsc::WeakUnboundedSender<RoomCommand>,
    ended_at: Arc<RwLock<Option<Instant>>>,
}

impl RoomActor {
    async fn handle(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::PresenterJoin { conn_id, sender } => {
                self.subscribers.insert(
                    conn_id.clone(),
                    Subscriber {
                        role: Role::Presenter,
                        participant_id: None,
                        sender,
                    },
                );
                tracing::info!(room_code = %self.state.code, conn_id = %conn_id, "Presenter joined");
                // A presenter dashboard reconnects like everyone else: hand
                // it the current state snapshot.
                let sync = self.state.sync_snapshot(None);
                self.send_to(
                    &conn_id,
                    &ServerMessage::ReconnectionSync {
                        status: sync.status,
                        live_question: sync.live_question,
                        ranking: sync.ranking,
                        my_stats: sync.my_stats,
                    },
                );
            }

            RoomCommand::Join {
                conn_id,
                participant_id,
                display_name,
                avatar,
                sender,
            } => {
                self.subscribers.insert(
                    conn_id.clone(),
                    Subscriber {
                        role: Role::Participant,
                        participant_id: Some(participant_id.clone()),
                        sender,
                    },
                );
                match self
                    .state
                    .join(participant_id, display_name, avatar, conn_id.clone())
                {
                    JoinOutcome::Joined {
                        participant,
                        sync,
                        online_count,
                    } => {
                        self.send_to(
                            &conn_id,
                            &ServerMessage::ReconnectionSync {
                                status: sync.status,
                                live_question: sync.live_question,
                                ranking: sync.ranking,
                                my_stats: sync.my_stats,
                            },
                        );
                        self.broadcast_except(&conn_id, &ServerMessage::ParticipantJoined { participant });
                        self.broadcast(&ServerMessage::OnlineCount { n: online_count });
                    }
                    JoinOutcome::Reconnected { sync, online_count } => {
                        self.send_to(
                            &conn_id,
                            &ServerMessage::ReconnectionSync {
                                status: sync.status,
                                live_question: sync.live_question,
                                ranking: sync.ranking,
                                my_stats: sync.my_stats,
                            },
                        );
                        self.broadcast(&ServerMessage::OnlineCount { n: online_count });
                    }
                }
            }

            RoomCommand::Disconnect { conn_id } => {
                let was_participant = self
                    .subscribers
                    .remove(&conn_id)
                    .map(|s| s.role == Role::Participant)
                    .unwrap_or(false);
                if was_participant {
                    if let Some(online_count) = self.state.disconnect(&conn_id) {
                        self.broadcast(&ServerMessage::OnlineCount { n: online_count });
                    }
                }
            }

            RoomCommand::StartQuiz { conn_id } => {
                let result = self
                    .require_presenter(&conn_id, "start-quiz")
                    .and_then(|_| self.state.start());
                match result {
                    Ok(()) => self.broadcast(&ServerMessage::QuizStarted),
                    Err(e) => self.reject(&conn_id, e),
                }
            }

            RoomCommand::OpenQuestion {
                conn_id,
                question_index,
                time_limit_seconds,
            } => {
                let result = self
                    .require_presenter(&conn_id, "open-question")
                    .and_then(|_| self.state.open_question(question_index, time_limit_seconds));
                match result {
                    Ok((question, limit, generation)) => {
                        self.broadcast(&ServerMessage::QuestionOpened {
                            question,
                            question_index,
                            time_limit_seconds: limit,
                        });
                        self.arm_timer(question_index, limit, generation);
                    }
                    Err(e) => self.reject(&conn_id, e),
                }
            }

            RoomCommand::CloseQuestion {
                conn_id,
                correct_answer,
                reveal,
            } => {
                let result = self
                    .require_presenter(&conn_id, "close-question")
                    .and_then(|_| self.state.close_question(correct_answer, reveal));
                match result {
                    Ok((correct_answer, reveal)) => {
                        self.broadcast(&ServerMessage::QuestionClosed {
                            correct_answer,
                            reveal,
                        });
                    }
                    Err(e) => self.reject(&conn_id, e),
                }
            }

            RoomCommand::AdvanceQuestion {
                conn_id,
                question_index,
            } => {
                // Advancing reopens at the given index with the room default
                // time budget.
                let result = self
                    .require_presenter(&conn_id, "advance-question")
                    .and_then(|_| self.state.open_question(question_index, None));
                match result {
                    Ok((question, limit, generation)) => {
                        self.broadcast(&ServerMessage::QuestionOpened {
                            question,
                            question_index,
                            time_limit_seconds: limit,
                        });
                        self.arm_timer(question_index, limit, generation);
                    }
                    Err(e) => self.reject(&conn_id, e),
                }
            }

            RoomCommand::EndQuiz { conn_id } => {
                let result = self
                    .require_presenter(&conn_id, "end-quiz")
                    .and_then(|_| self.state.end());
                match result {
                    Ok(()) => {
                        self.broadcast(&ServerMessage::QuizEnded);
                        *self.ended_at.write().await = Some(Instant::now());
                    }
                    Err(e) => self.reject(&conn_id, e),
                }
            }

            RoomCommand::SubmitAnswer {
                conn_id,
                question_index,
                answer,
                response_time_ms,
            } => {
                // The submission is attributed to the identity bound at join
                // time, not to anything claimed in the message body.
                let result = self.require_participant(&conn_id).and_then(|participant_id| {
                    self.state
                        .submit_answer(&participant_id, question_index, &answer, response_time_ms)
                });
                match result {
                    Ok(ranking) => self.broadcast(&ServerMessage::RankingUpdated { ranking }),
                    Err(e) => self.reject(&conn_id, e),
                }
            }

            RoomCommand::QuestionTimeout {
                question_index,
                generation,
            } => {
                if !self.state.is_open_at(question_index, generation) {
                    return;
                }
                tracing::info!(
                    room_code = %self.state.code,
                    question_index,
                    "Time limit elapsed, closing question"
                );
                if let Ok((correct_answer, reveal)) = self.state.close_question(None, true) {
                    self.broadcast(&ServerMessage::QuestionClosed {
                        correct_answer,
                        reveal,
                    });
                }
            }

            RoomCommand::Summary { reply } => {
                let _ = reply.send(RoomSummary {
                    status: self.state.status(),
                    participant_count: self.state.participant_count(),
                });
            }
        }
    }

    fn require_presenter(&self, conn_id: &str, action: &str) -> Result<()> {
        match self.subscribers.get(conn_id) {
            Some(s) if s.role == Role::Presenter => Ok(()),
            _ => Err(QuizError::forbidden(
                action,
                "connection is not the room presenter",
            )),
        }
    }

    fn require_participant(&self, conn_id: &str) -> Result<String> {
        match self.subscribers.get(conn_id) {
            Some(Subscriber {
                role: Role::Participant,
                participant_id: Some(id),
                ..
            }) => Ok(id.clone()),
            _ => Err(QuizError::forbidden(
                "submit-answer",
                "connection has not joined as a participant",
            )),
        }
    }

    /// Spawns the external timer that fires close-question when the time
    /// budget elapses.
    fn arm_timer(&self, question_index: usize, time_limit_seconds: u32, generation: u64) {
        let weak_tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(time_limit_seconds as u64)).await;
            if let Some(tx) = weak_tx.upgrade() {
                let _ = tx.send(RoomCommand::QuestionTimeout {
                    question_index,
                    generation,
                });
            }
        });
    }

    fn reject(&self, conn_id: &str, error: QuizError) {
        tracing::debug!(
            room_code = %self.state.code,
            conn_id = %conn_id,
            error = %error,
            "Command rejected"
        );
        self.send_to(
            conn_id,
            &ServerMessage::CommandRejected {
                code: error.code().to_string(),
                message: error.to_string(),
            },
        );
    }

    fn send_to(&self, conn_id: &str, message: &ServerMessage) {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize server message");
                return;
            }
        };
        if let Some(subscriber) = self.subscribers.get(conn_id) {
            let _ = subscriber.sender.send(Message::text(text));
        }
    }

    /// Best-effort, at-least-once fan-out to every current subscriber.
    /// Offline participants miss the event and catch up via reconnection
    /// sync.
    fn broadcast(&self, message: &ServerMessage) {
        self.broadcast_inner(message, None);
    }

    fn broadcast_except(&self, skip_conn_id: &str, message: &ServerMessage) {
        self.broadcast_inner(message, Some(skip_conn_id));
    }

    fn broadcast_inner(&self, message: &ServerMessage, skip_conn_id: Option<&str>) {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize broadcast");
                return;
            }
        };
        for (conn_id, subscriber) in &self.subscribers {
            if skip_conn_id == Some(conn_id.as_str()) {
                continue;
            }
            if subscriber.sender.send(Message::text(text.clone())).is_err() {
                tracing::debug!(
                    room_code = %self.state.code,
                    conn_id = %conn_id,
                    "Subscriber channel closed, skipping"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::room::Question;
    use crate::live::scoring::ScorePolicy;

    fn test_state() -> RoomState {
        let questions = vec![
            Question {
                id: "q1".to_string(),
                prompt: "First".to_string(),
                options: vec!["Alpha".into(), "Beta".into()],
                correct_answer: "A".to_string(),
                is_multiple_choice: false,
            },
            Question {
                id: "q2".to_string(),
                prompt: "Second".to_string(),
                options: vec!["Alpha".into(), "Beta".into()],
                correct_answer: "B".to_string(),
                is_multiple_choice: false,
            },
        ];
        RoomState::new(
            "ROOM01".to_string(),
            "Actor test".to_string(),
            questions,
            30,
            ScorePolicy::default(),
        )
    }

    async fn next_json(rx: &mut mpsc::UnboundedReceiver<Message>) -> serde_json::Value {
        let message = tokio::time::timeout(Duration::from_secs(120), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed");
        serde_json::from_str(message.to_str().expect("expected text frame")).unwrap()
    }

    fn presenter(handle: &RoomHandle) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        handle.send(RoomCommand::PresenterJoin {
            conn_id: "presenter".to_string(),
            sender: tx,
        });
        rx
    }

    fn participant(handle: &RoomHandle, conn_id: &str, pid: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        handle.send(RoomCommand::Join {
            conn_id: conn_id.to_string(),
            participant_id: pid.to_string(),
            display_name: format!("Player {}", pid),
            avatar: None,
            sender: tx,
        });
        rx
    }

    #[tokio::test]
    async fn test_join_broadcasts_online_count() {
        let handle = spawn_room(test_state());
        let mut p1 = participant(&handle, "c1", "p1");

        // joiner gets its private snapshot, then the count broadcast, but
        // never its own join event
        let json = next_json(&mut p1).await;
        assert_eq!(json["type"], "reconnection-sync");
        assert_eq!(json["status"], "waiting");
        assert!(json["live_question"].is_null());
        let json = next_json(&mut p1).await;
        assert_eq!(json["type"], "online-count");
        assert_eq!(json["n"], 1);

        let mut p2 = participant(&handle, "c2", "p2");
        let json = next_json(&mut p1).await;
        assert_eq!(json["type"], "participant-joined");
        assert_eq!(json["participant"]["participant_id"], "p2");
        let json = next_json(&mut p1).await;
        assert_eq!(json["type"], "online-count");
        assert_eq!(json["n"], 2);

        let json = next_json(&mut p2).await;
        assert_eq!(json["type"], "reconnection-sync");
        let json = next_json(&mut p2).await;
        assert_eq!(json["type"], "online-count");
        assert_eq!(json["n"], 2);
    }

    #[tokio::test]
    async fn test_participant_cannot_drive_the_quiz() {
        let handle = spawn_room(test_state());
        let mut p1 = participant(&handle, "c1", "p1");
        let _ = next_json(&mut p1).await; // reconnection-sync
        let _ = next_json(&mut p1).await; // online-count

        handle.send(RoomCommand::StartQuiz {
            conn_id: "c1".to_string(),
        });
        let json = next_json(&mut p1).await;
        assert_eq!(json["type"], "command-rejected");
        assert_eq!(json["code"], "forbidden");

        let summary = handle.summary().await.unwrap();
        assert!(matches!(summary.status, RoomStatus::Waiting));
    }

    #[tokio::test]
    async fn test_full_question_round() {
        let handle = spawn_room(test_state());
        let mut presenter_rx = presenter(&handle);
        let _ = next_json(&mut presenter_rx).await; // reconnection-sync

        let mut p1 = participant(&handle, "c1", "p1");
        let _ = next_json(&mut p1).await; // reconnection-sync
        let _ = next_json(&mut p1).await; // online-count
        let _ = next_json(&mut presenter_rx).await; // participant-joined
        let _ = next_json(&mut presenter_rx).await; // online-count

        handle.send(RoomCommand::StartQuiz {
            conn_id: "presenter".to_string(),
        });
        assert_eq!(next_json(&mut p1).await["type"], "quiz-started");
        assert_eq!(next_json(&mut presenter_rx).await["type"], "quiz-started");

        handle.send(RoomCommand::OpenQuestion {
            conn_id: "presenter".to_string(),
            question_index: 0,
            time_limit_seconds: Some(30),
        });
        let opened = next_json(&mut p1).await;
        assert_eq!(opened["type"], "question-opened");
        assert_eq!(opened["question_index"], 0);
        assert_eq!(opened["time_limit_seconds"], 30);
        let _ = next_json(&mut presenter_rx).await;

        handle.send(RoomCommand::SubmitAnswer {
            conn_id: "c1".to_string(),
            question_index: 0,
            answer: "A".to_string(),
            response_time_ms: 900,
        });
        let ranking = next_json(&mut p1).await;
        assert_eq!(ranking["type"], "ranking-updated");
        assert_eq!(ranking["ranking"][0]["participant_id"], "p1");
        assert_eq!(ranking["ranking"][0]["is_correct"], true);
        let _ = next_json(&mut presenter_rx).await;

        handle.send(RoomCommand::CloseQuestion {
            conn_id: "presenter".to_string(),
            correct_answer: None,
            reveal: true,
        });
        let closed = next_json(&mut p1).await;
        assert_eq!(closed["type"], "question-closed");
        assert_eq!(closed["correct_answer"], "A");
        assert_eq!(closed["reveal"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_limit_closes_question() {
        let handle = spawn_room(test_state());
        let mut presenter_rx = presenter(&handle);
        let _ = next_json(&mut presenter_rx).await; // reconnection-sync

        handle.send(RoomCommand::StartQuiz {
            conn_id: "presenter".to_string(),
        });
        let _ = next_json(&mut presenter_rx).await; // quiz-started

        handle.send(RoomCommand::OpenQuestion {
            conn_id: "presenter".to_string(),
            question_index: 0,
            time_limit_seconds: Some(5),
        });
        let _ = next_json(&mut presenter_rx).await; // question-opened

        // paused clock auto-advances through the 5s timer
        let closed = next_json(&mut presenter_rx).await;
        assert_eq!(closed["type"], "question-closed");
        assert_eq!(closed["correct_answer"], "A");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_does_not_close_next_question() {
        let handle = spawn_room(test_state());
        let mut presenter_rx = presenter(&handle);
        let _ = next_json(&mut presenter_rx).await;

        handle.send(RoomCommand::StartQuiz {
            conn_id: "presenter".to_string(),
        });
        let _ = next_json(&mut presenter_rx).await;

        handle.send(RoomCommand::OpenQuestion {
            conn_id: "presenter".to_string(),
            question_index: 0,
            time_limit_seconds: Some(60),
        });
        let _ = next_json(&mut presenter_rx).await;

        // presenter closes early, then advances; the 60s timer for question
        // 0 must not close question 1
        handle.send(RoomCommand::CloseQuestion {
            conn_id: "presenter".to_string(),
            correct_answer: None,
            reveal: false,
        });
        let _ = next_json(&mut presenter_rx).await;

        handle.send(RoomCommand::AdvanceQuestion {
            conn_id: "presenter".to_string(),
            question_index: 1,
        });
        let opened = next_json(&mut presenter_rx).await;
        assert_eq!(opened["type"], "question-opened");
        assert_eq!(opened["question_index"], 1);

        // question 1 closes only when its own 30s default elapses
        let closed = next_json(&mut presenter_rx).await;
        assert_eq!(closed["type"], "question-closed");
        assert_eq!(closed["correct_answer"], "B");
    }

    #[tokio::test]
    async fn test_reconnect_gets_private_sync() {
        let handle = spawn_room(test_state());
        let mut presenter_rx = presenter(&handle);
        let _ = next_json(&mut presenter_rx).await;

        let mut p1 = participant(&handle, "c1", "p1");
        let _ = next_json(&mut p1).await; // reconnection-sync
        let _ = next_json(&mut p1).await; // online-count
        let _ = next_json(&mut presenter_rx).await; // participant-joined
        let _ = next_json(&mut presenter_rx).await; // online-count

        handle.send(RoomCommand::StartQuiz {
            conn_id: "presenter".to_string(),
        });
        let _ = next_json(&mut p1).await;
        let _ = next_json(&mut presenter_rx).await;

        handle.send(RoomCommand::OpenQuestion {
            conn_id: "presenter".to_string(),
            question_index: 1,
            time_limit_seconds: Some(45),
        });
        let _ = next_json(&mut p1).await;
        let _ = next_json(&mut presenter_rx).await;

        handle.send(RoomCommand::Disconnect {
            conn_id: "c1".to_string(),
        });
        let count = next_json(&mut presenter_rx).await;
        assert_eq!(count["type"], "online-count");
        assert_eq!(count["n"], 0);

        let mut p1_again = participant(&handle, "c1b", "p1");
        let sync = next_json(&mut p1_again).await;
        assert_eq!(sync["type"], "reconnection-sync");
        assert_eq!(sync["status"], "active");
        assert_eq!(sync["live_question"]["question_index"], 1);
        assert_eq!(sync["live_question"]["time_limit_seconds"], 45);
        assert_eq!(sync["my_stats"]["score"], 0);
        assert_eq!(sync["my_stats"]["total_answers"], 0);
    }
}
