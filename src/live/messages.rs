use serde::{Deserialize, Serialize};

use super::room::{
    AnswerSubmission, LiveQuestion, ParticipantInfo, ParticipantStats, Question, RoomStatus,
};

/// Messages accepted from connected clients. Unknown or malformed tags are
/// rejected at the boundary as invalid input, without touching room state.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Join {
        room_code: String,
        participant_id: String,
        display_name: String,
        #[serde(default)]
        avatar: Option<String>,
    },

    /// Binds the connection as the room's presenter, guarded by the shared
    /// presenter secret.
    PresenterJoin {
        room_code: String,
        presenter_key: String,
    },

    StartQuiz {
        room_code: String,
    },

    OpenQuestion {
        room_code: String,
        question_index: usize,
        #[serde(default)]
        time_limit_seconds: Option<u32>,
    },

    CloseQuestion {
        room_code: String,
        #[serde(default)]
        correct_answer: Option<String>,
        reveal: bool,
    },

    AdvanceQuestion {
        room_code: String,
        question_index: usize,
    },

    EndQuiz {
        room_code: String,
    },

    SubmitAnswer {
        room_code: String,
        participant_id: String,
        question_index: usize,
        answer: String,
        response_time_ms: u64,
    },

    Heartbeat,
}

/// Messages published to room subscribers (broadcasts) or sent to a single
/// connection (private replies).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    ParticipantJoined {
        participant: ParticipantInfo,
    },

    OnlineCount {
        n: usize,
    },

    QuizStarted,

    QuestionOpened {
        question: Question,
        question_index: usize,
        time_limit_seconds: u32,
    },

    QuestionClosed {
        correct_answer: String,
        reveal: bool,
    },

    RankingUpdated {
        ranking: Vec<AnswerSubmission>,
    },

    QuizEnded,

    RoomNotFound,

    JoinRejected {
        reason: String,
    },

    ReconnectionSync {
        status: RoomStatus,
        live_question: Option<LiveQuestion>,
        ranking: Vec<AnswerSubmission>,
        my_stats: Option<ParticipantStats>,
    },

    HeartbeatAck {
        timestamp: u64,
    },

    CommandRejected {
        code: String,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_join() {
        let raw = r#"{"type":"join","room_code":"ABC123","participant_id":"p1","display_name":"Ada"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::Join {
                room_code,
                participant_id,
                avatar,
                ..
            } => {
                assert_eq!(room_code, "ABC123");
                assert_eq!(participant_id, "p1");
                assert!(avatar.is_none());
            }
            _ => panic!("parsed wrong variant"),
        }
    }

    #[test]
    fn test_parse_submit_answer() {
        let raw = r#"{"type":"submit-answer","room_code":"ABC123","participant_id":"p1","question_index":0,"answer":"A","response_time_ms":1200}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(msg, ClientMessage::SubmitAnswer { .. }));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let raw = r#"{"type":"launch-missiles","room_code":"ABC123"}"#;
        assert!(serde_json::from_str::<ClientMessage>(raw).is_err());
    }

    #[test]
    fn test_server_message_tags() {
        let msg = ServerMessage::OnlineCount { n: 3 };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(json["type"], "online-count");
        assert_eq!(json["n"], 3);

        let msg = ServerMessage::QuizStarted;
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(json["type"], "quiz-started");
    }
}
