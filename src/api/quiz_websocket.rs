use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket};

use crate::config::Config;
use crate::live::messages::{ClientMessage, ServerMessage};
use crate::live::{RoomCommand, RoomHandle, RoomRegistry};

pub async fn handle_connection(
    websocket: WebSocket,
    registry: Arc<RoomRegistry>,
    config: Arc<Config>,
) {
    let conn_id = generate_connection_id();
    tracing::info!(conn_id = %conn_id, "New quiz WebSocket connection established");

    let (mut ws_sender, mut ws_receiver) = websocket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Spawn task to send messages to client
    let sender_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = ws_sender.send(message).await {
                tracing::error!(error = %e, "Failed to send WebSocket message");
                break;
            }
        }
    });

    let mut session = ConnectionSession {
        conn_id: conn_id.clone(),
        registry,
        config,
        outbound: tx,
        room: None,
    };

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(message) => session.handle_socket_message(message).await,
            Err(e) => {
                tracing::error!(conn_id = %conn_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    session.cleanup();
    sender_task.abort();
    tracing::info!(conn_id = %conn_id, "Quiz WebSocket connection closed");
}

fn generate_connection_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

/// Per-connection state: the room this connection is attached to, if any.
/// Role and participant identity are bound inside the room worker.
struct ConnectionSession {
    conn_id: String,
    registry: Arc<RoomRegistry>,
    config: Arc<Config>,
    outbound: mpsc::UnboundedSender<Message>,
    room: Option<RoomHandle>,
}

impl ConnectionSession {
    async fn handle_socket_message(&mut self, message: Message) {
        let text = match message.to_str() {
            Ok(text) => text,
            Err(_) => return, // ignore ping/pong/binary frames
        };
        tracing::debug!(conn_id = %self.conn_id, "Received quiz message: {}", text);

        match serde_json::from_str::<ClientMessage>(text) {
            Ok(client_message) => self.dispatch(client_message).await,
            Err(e) => {
                tracing::debug!(
                    conn_id = %self.conn_id,
                    error = %e,
                    raw_message = %text,
                    "Failed to parse quiz message"
                );
                self.reply(&ServerMessage::CommandRejected {
                    code: "invalid-input".to_string(),
                    message: "unrecognized or malformed message".to_string(),
                });
            }
        }
    }

    async fn dispatch(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Heartbeat => {
                self.reply(&ServerMessage::HeartbeatAck {
                    timestamp: now_millis(),
                });
            }

            ClientMessage::Join {
                room_code,
                participant_id,
                display_name,
                avatar,
            } => {
                if participant_id.trim().is_empty() || display_name.trim().is_empty() {
                    self.reply(&ServerMessage::JoinRejected {
                        reason: "participant id and display name are required".to_string(),
                    });
                    return;
                }
                match self.registry.lookup(&room_code).await {
                    Some(handle) => {
                        self.detach_if_other_room(&handle.code);
                        handle.send(RoomCommand::Join {
                            conn_id: self.conn_id.clone(),
                            participant_id,
                            display_name,
                            avatar,
                            sender: self.outbound.clone(),
                        });
                        self.room = Some(handle);
                    }
                    None => self.reply(&ServerMessage::RoomNotFound),
                }
            }

            ClientMessage::PresenterJoin {
                room_code,
                presenter_key,
            } => {
                if presenter_key != self.config.session.presenter_key {
                    tracing::warn!(
                        conn_id = %self.conn_id,
                        room_code = %room_code,
                        "Presenter join with invalid key"
                    );
                    self.reply(&ServerMessage::JoinRejected {
                        reason: "invalid presenter key".to_string(),
                    });
                    return;
                }
                match self.registry.lookup(&room_code).await {
                    Some(handle) => {
                        self.detach_if_other_room(&handle.code);
                        handle.send(RoomCommand::PresenterJoin {
                            conn_id: self.conn_id.clone(),
                            sender: self.outbound.clone(),
                        });
                        self.room = Some(handle);
                    }
                    None => self.reply(&ServerMessage::RoomNotFound),
                }
            }

            ClientMessage::StartQuiz { room_code } => {
                if let Some(handle) = self.attached_room("start-quiz", &room_code) {
                    handle.send(RoomCommand::StartQuiz {
                        conn_id: self.conn_id.clone(),
                    });
                }
            }

            ClientMessage::OpenQuestion {
                room_code,
                question_index,
                time_limit_seconds,
            } => {
                if let Some(handle) = self.attached_room("open-question", &room_code) {
                    handle.send(RoomCommand::OpenQuestion {
                        conn_id: self.conn_id.clone(),
                        question_index,
                        time_limit_seconds,
                    });
                }
            }

            ClientMessage::CloseQuestion {
                room_code,
                correct_answer,
                reveal,
            } => {
                if let Some(handle) = self.attached_room("close-question", &room_code) {
                    handle.send(RoomCommand::CloseQuestion {
                        conn_id: self.conn_id.clone(),
                        correct_answer,
                        reveal,
                    });
                }
            }

            ClientMessage::AdvanceQuestion {
                room_code,
                question_index,
            } => {
                if let Some(handle) = self.attached_room("advance-question", &room_code) {
                    handle.send(RoomCommand::AdvanceQuestion {
                        conn_id: self.conn_id.clone(),
                        question_index,
                    });
                }
            }

            ClientMessage::EndQuiz { room_code } => {
                if let Some(handle) = self.attached_room("end-quiz", &room_code) {
                    handle.send(RoomCommand::EndQuiz {
                        conn_id: self.conn_id.clone(),
                    });
                }
            }

            ClientMessage::SubmitAnswer {
                room_code,
                question_index,
                answer,
                response_time_ms,
                ..
            } => {
                // the submission identity comes from the join binding, not
                // from the message body
                if let Some(handle) = self.attached_room("submit-answer", &room_code) {
                    handle.send(RoomCommand::SubmitAnswer {
                        conn_id: self.conn_id.clone(),
                        question_index,
                        answer,
                        response_time_ms,
                    });
                }
            }
        }
    }

    /// Rebinding to a different room must leave the first one, or its
    /// online count would keep counting this connection forever.
    fn detach_if_other_room(&mut self, new_code: &str) {
        if let Some(previous) = &self.room {
            if previous.code != new_code {
                tracing::info!(
                    conn_id = %self.conn_id,
                    from_room = %previous.code,
                    to_room = %new_code,
                    "Connection switched rooms, detaching from the first"
                );
                previous.send(RoomCommand::Disconnect {
                    conn_id: self.conn_id.clone(),
                });
                self.room = None;
            }
        }
    }

    /// Commands other than joins require the connection to be attached to
    /// the named room already.
    fn attached_room(&self, action: &str, room_code: &str) -> Option<RoomHandle> {
        match &self.room {
            Some(handle) if handle.code == room_code => Some(handle.clone()),
            _ => {
                self.reply(&ServerMessage::CommandRejected {
                    code: "forbidden".to_string(),
                    message: format!("{} forbidden: connection is not attached to room {}", action, room_code),
                });
                None
            }
        }
    }

    fn reply(&self, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(text) => {
                let _ = self.outbound.send(Message::text(text));
            }
            Err(e) => tracing::error!(error = %e, "Failed to serialize reply"),
        }
    }

    fn cleanup(&self) {
        if let Some(handle) = &self.room {
            handle.send(RoomCommand::Disconnect {
                conn_id: self.conn_id.clone(),
            });
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::{ScoringConfig, ServerConfig, SessionConfig};
    use crate::live::room::Question;
    use crate::live::scoring::ScorePolicy;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            session: SessionConfig {
                presenter_key: "secret".to_string(),
                default_time_limit_secs: 30,
                room_ttl_secs: 3600,
            },
            scoring: ScoringConfig {
                base_points: 100,
                max_speed_bonus: 100,
            },
        })
    }

    fn question() -> Question {
        Question {
            id: "q1".to_string(),
            prompt: "Prompt".to_string(),
            options: vec!["Alpha".into(), "Beta".into()],
            correct_answer: "A".to_string(),
            is_multiple_choice: false,
        }
    }

    async fn next_json(rx: &mut mpsc::UnboundedReceiver<Message>) -> serde_json::Value {
        let message = tokio::time::timeout(Duration::from_secs(120), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed");
        serde_json::from_str(message.to_str().expect("expected text frame")).unwrap()
    }

    #[tokio::test]
    async fn test_joining_another_room_detaches_from_the_first() {
        let registry = RoomRegistry::new(30, ScorePolicy::default());
        let room_a = registry
            .create_room("First".to_string(), None, vec![question()])
            .await
            .unwrap();
        let room_b = registry
            .create_room("Second".to_string(), None, vec![question()])
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = ConnectionSession {
            conn_id: "c1".to_string(),
            registry: registry.clone(),
            config: test_config(),
            outbound: tx,
            room: None,
        };

        session
            .dispatch(ClientMessage::Join {
                room_code: room_a.code.clone(),
                participant_id: "p1".to_string(),
                display_name: "Player".to_string(),
                avatar: None,
            })
            .await;
        let _ = next_json(&mut rx).await; // reconnection-sync
        assert_eq!(next_json(&mut rx).await["n"], 1);

        // a second connection watches room A's counts
        let (observer_tx, mut observer_rx) = mpsc::unbounded_channel();
        room_a.send(RoomCommand::Join {
            conn_id: "observer".to_string(),
            participant_id: "watcher".to_string(),
            display_name: "Watcher".to_string(),
            avatar: None,
            sender: observer_tx,
        });
        let _ = next_json(&mut observer_rx).await; // reconnection-sync
        assert_eq!(next_json(&mut observer_rx).await["n"], 2);
        let _ = next_json(&mut rx).await; // participant-joined
        let _ = next_json(&mut rx).await; // online-count

        session
            .dispatch(ClientMessage::Join {
                room_code: room_b.code.clone(),
                participant_id: "p1".to_string(),
                display_name: "Player".to_string(),
                avatar: None,
            })
            .await;

        // room A drops the connection from its count
        let count = next_json(&mut observer_rx).await;
        assert_eq!(count["type"], "online-count");
        assert_eq!(count["n"], 1);

        // the session ends up bound to room B only
        assert_eq!(session.room.as_ref().unwrap().code, room_b.code);
        let _ = next_json(&mut rx).await; // room B reconnection-sync
        assert_eq!(next_json(&mut rx).await["n"], 1);
    }

    #[tokio::test]
    async fn test_rejoining_the_same_room_does_not_detach() {
        let registry = RoomRegistry::new(30, ScorePolicy::default());
        let room = registry
            .create_room("Only".to_string(), None, vec![question()])
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = ConnectionSession {
            conn_id: "c1".to_string(),
            registry: registry.clone(),
            config: test_config(),
            outbound: tx,
            room: None,
        };

        let join = ClientMessage::Join {
            room_code: room.code.clone(),
            participant_id: "p1".to_string(),
            display_name: "Player".to_string(),
            avatar: None,
        };
        session.dispatch(join.clone()).await;
        let _ = next_json(&mut rx).await; // reconnection-sync
        assert_eq!(next_json(&mut rx).await["n"], 1);

        session.dispatch(join).await;
        let _ = next_json(&mut rx).await; // reconnection-sync
        let count = next_json(&mut rx).await;
        assert_eq!(count["type"], "online-count");
        assert_eq!(count["n"], 1);
        assert_eq!(session.room.as_ref().unwrap().code, room.code);
    }
}
