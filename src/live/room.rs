use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{QuizError, Result};

use super::scoring::ScorePolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Waiting,
    Active,
    Ended,
}

impl RoomStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomStatus::Waiting => "waiting",
            RoomStatus::Active => "active",
            RoomStatus::Ended => "ended",
        }
    }
}

/// Per-question sub-state while the room is active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionPhase {
    Idle,
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub prompt: String,
    pub options: Vec<String>,
    /// Option label or label set, e.g. "A", "A,B" or "AB"
    pub correct_answer: String,
    #[serde(default)]
    pub is_multiple_choice: bool,
}

impl Question {
    /// Normalizes an answer string into a label set. Accepts "A", "A,B" and
    /// compact "AB" forms, case-insensitive.
    pub fn normalize_labels(raw: &str) -> BTreeSet<String> {
        let trimmed = raw.trim().to_uppercase();
        if trimmed.contains(',') {
            return trimmed
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if trimmed.len() > 1 && trimmed.chars().all(|c| c.is_ascii_uppercase()) {
            return trimmed.chars().map(|c| c.to_string()).collect();
        }
        let mut set = BTreeSet::new();
        if !trimmed.is_empty() {
            set.insert(trimmed);
        }
        set
    }

    pub fn correct_label_set(&self) -> BTreeSet<String> {
        Self::normalize_labels(&self.correct_answer)
    }

    /// Exact match for single-choice, set equality for multi-choice
    pub fn answer_matches(&self, answer: &str) -> bool {
        let chosen = Self::normalize_labels(answer);
        !chosen.is_empty() && chosen == self.correct_label_set()
    }
}

/// Immutable once accepted; only removed by the per-question reset
#[derive(Debug, Clone, Serialize)]
pub struct AnswerSubmission {
    pub participant_id: String,
    pub display_name: String,
    pub avatar: Option<String>,
    pub question_index: usize,
    pub chosen_answer: String,
    pub response_time_ms: u64,
    pub is_correct: bool,
    pub submission_order: u64,
}

#[derive(Debug, Clone)]
pub struct Participant {
    pub participant_id: String,
    pub display_name: String,
    pub avatar: Option<String>,
    /// Most recent live connection, or None when offline. Participants are
    /// never removed, so late leaderboard reads stay stable.
    pub current_connection_id: Option<String>,
    pub score: u32,
    pub correct_count: u32,
    pub total_answers: u32,
}

impl Participant {
    pub fn accuracy(&self) -> f64 {
        if self.total_answers == 0 {
            0.0
        } else {
            self.correct_count as f64 / self.total_answers as f64
        }
    }

    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            participant_id: self.participant_id.clone(),
            display_name: self.display_name.clone(),
            avatar: self.avatar.clone(),
            score: self.score,
            correct_count: self.correct_count,
            total_answers: self.total_answers,
            accuracy: self.accuracy(),
            online: self.current_connection_id.is_some(),
        }
    }
}

/// Public view of a participant for broadcasts
#[derive(Debug, Clone, Serialize)]
pub struct ParticipantInfo {
    pub participant_id: String,
    pub display_name: String,
    pub avatar: Option<String>,
    pub score: u32,
    pub correct_count: u32,
    pub total_answers: u32,
    pub accuracy: f64,
    pub online: bool,
}

/// A participant's own counters plus their rank by score
#[derive(Debug, Clone, Serialize)]
pub struct ParticipantStats {
    pub score: u32,
    pub correct_count: u32,
    pub total_answers: u32,
    pub accuracy: f64,
    pub rank: usize,
}

/// The currently open question as seen by a (re)joining connection
#[derive(Debug, Clone, Serialize)]
pub struct LiveQuestion {
    pub question: Question,
    pub question_index: usize,
    pub time_limit_seconds: u32,
    pub remaining_seconds: u32,
}

/// State snapshot sent privately to a rejoining connection. Replaces the
/// client view wholesale instead of replaying missed events.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSnapshot {
    pub status: RoomStatus,
    pub live_question: Option<LiveQuestion>,
    pub ranking: Vec<AnswerSubmission>,
    pub my_stats: Option<ParticipantStats>,
}

pub enum JoinOutcome {
    Joined {
        participant: ParticipantInfo,
        sync: SyncSnapshot,
        online_count: usize,
    },
    Reconnected {
        sync: SyncSnapshot,
        online_count: usize,
    },
}

/// In-memory state of one live quiz session. All mutation goes through the
/// room's actor task, so none of these methods need internal locking.
pub struct RoomState {
    pub code: String,
    pub name: String,
    status: RoomStatus,
    phase: QuestionPhase,
    questions: Vec<Question>,
    current_question_index: Option<usize>,
    current_answers: Vec<AnswerSubmission>,
    submission_seq: u64,
    default_time_limit_secs: u32,
    current_time_limit_secs: u32,
    opened_at: Option<Instant>,
    /// Bumped on every open; stale timer firings carry an older value
    generation: u64,
    participants: HashMap<String, Participant>,
    policy: ScorePolicy,
}

impl RoomState {
    pub fn new(
        code: String,
        name: String,
        questions: Vec<Question>,
        default_time_limit_secs: u32,
        policy: ScorePolicy,
    ) -> Self {
        Self {
            code,
            name,
            status: RoomStatus::Waiting,
            phase: QuestionPhase::Idle,
            questions,
            current_question_index: None,
            current_answers: Vec::new(),
            submission_seq: 0,
            default_time_limit_secs,
            current_time_limit_secs: default_time_limit_secs,
            opened_at: None,
            generation: 0,
            participants: HashMap::new(),
            policy,
        }
    }

    pub fn status(&self) -> RoomStatus {
        self.status
    }

    pub fn current_question_index(&self) -> Option<usize> {
        self.current_question_index
    }

    pub fn current_answers(&self) -> &[AnswerSubmission] {
        &self.current_answers
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn online_count(&self) -> usize {
        self.participants
            .values()
            .filter(|p| p.current_connection_id.is_some())
            .count()
    }

    fn state_label(&self) -> String {
        match (self.status, self.phase) {
            (RoomStatus::Active, QuestionPhase::Open) => "question open".to_string(),
            (RoomStatus::Active, QuestionPhase::Closed) => "question closed".to_string(),
            (RoomStatus::Active, QuestionPhase::Idle) => "between questions".to_string(),
            (status, _) => format!("room is {}", status.as_str()),
        }
    }

    /// waiting -> active
    pub fn start(&mut self) -> Result<()> {
        if self.status != RoomStatus::Waiting {
            return Err(QuizError::forbidden("start-quiz", self.state_label()));
        }
        self.status = RoomStatus::Active;
        self.phase = QuestionPhase::Idle;
        tracing::info!(room_code = %self.code, room_name = %self.name, "Quiz started");
        Ok(())
    }

    /// idle/closed -> open. Clears the answer list, zeroes the submission
    /// counter and returns the question, the effective time limit and the
    /// generation the external timer must echo back.
    pub fn open_question(
        &mut self,
        index: usize,
        time_limit_seconds: Option<u32>,
    ) -> Result<(Question, u32, u64)> {
        if self.status != RoomStatus::Active {
            return Err(QuizError::forbidden("open-question", self.state_label()));
        }
        if self.phase == QuestionPhase::Open {
            return Err(QuizError::forbidden("open-question", self.state_label()));
        }
        if index >= self.questions.len() {
            return Err(QuizError::invalid(format!(
                "question index {} out of range (have {})",
                index,
                self.questions.len()
            )));
        }
        let limit = match time_limit_seconds {
            Some(0) => return Err(QuizError::invalid("time limit must be positive")),
            Some(n) => n,
            None => self.default_time_limit_secs,
        };

        self.current_question_index = Some(index);
        self.current_answers.clear();
        self.submission_seq = 0;
        self.current_time_limit_secs = limit;
        self.opened_at = Some(Instant::now());
        self.generation += 1;
        self.phase = QuestionPhase::Open;

        tracing::info!(
            room_code = %self.code,
            question_index = index,
            time_limit_seconds = limit,
            "Question opened"
        );
        Ok((self.questions[index].clone(), limit, self.generation))
    }

    /// open -> closed. `correct_answer` overrides the reveal payload; when
    /// absent (the timer path) the question's own answer is revealed.
    pub fn close_question(
        &mut self,
        correct_answer: Option<String>,
        reveal: bool,
    ) -> Result<(String, bool)> {
        if self.status != RoomStatus::Active || self.phase != QuestionPhase::Open {
            return Err(QuizError::forbidden("close-question", self.state_label()));
        }
        // phase Open implies a valid current index, by construction
        let index = self.current_question_index.unwrap_or_default();
        let revealed = correct_answer.unwrap_or_else(|| self.questions[index].correct_answer.clone());

        self.phase = QuestionPhase::Closed;
        self.opened_at = None;

        tracing::info!(
            room_code = %self.code,
            question_index = index,
            reveal,
            "Question closed"
        );
        Ok((revealed, reveal))
    }

    /// any active sub-state -> ended
    pub fn end(&mut self) -> Result<()> {
        if self.status != RoomStatus::Active {
            return Err(QuizError::forbidden("end-quiz", self.state_label()));
        }
        self.status = RoomStatus::Ended;
        self.phase = QuestionPhase::Idle;
        self.opened_at = None;
        tracing::info!(room_code = %self.code, "Quiz ended");
        Ok(())
    }

    /// True if the given question is still open under the same generation;
    /// used to drop stale timer firings.
    pub fn is_open_at(&self, index: usize, generation: u64) -> bool {
        self.phase == QuestionPhase::Open
            && self.current_question_index == Some(index)
            && self.generation == generation
    }

    /// Accepts at most one submission per participant per question and
    /// returns the re-sorted ranking snapshot.
    pub fn submit_answer(
        &mut self,
        participant_id: &str,
        question_index: usize,
        answer: &str,
        response_time_ms: u64,
    ) -> Result<Vec<AnswerSubmission>> {
        if self.status != RoomStatus::Active || self.phase != QuestionPhase::Open {
            return Err(QuizError::forbidden("submit-answer", self.state_label()));
        }
        if question_index >= self.questions.len() {
            return Err(QuizError::invalid(format!(
                "question index {} out of range (have {})",
                question_index,
                self.questions.len()
            )));
        }
        if self.current_question_index != Some(question_index) {
            return Err(QuizError::forbidden(
                "submit-answer",
                "stale question index".to_string(),
            ));
        }
        if answer.trim().is_empty() {
            return Err(QuizError::invalid("empty answer"));
        }
        if self
            .current_answers
            .iter()
            .any(|a| a.participant_id == participant_id)
        {
            return Err(QuizError::DuplicateSubmission(participant_id.to_string()));
        }
        let is_correct = self.questions[question_index].answer_matches(answer);
        let time_limit_ms = self.current_time_limit_secs as u64 * 1000;
        let earned = self.policy.points(is_correct, response_time_ms, time_limit_ms);

        let participant = self
            .participants
            .get_mut(participant_id)
            .ok_or_else(|| QuizError::invalid(format!("unknown participant {}", participant_id)))?;
        participant.total_answers += 1;
        if is_correct {
            participant.correct_count += 1;
        }
        participant.score += earned;

        let submission = AnswerSubmission {
            participant_id: participant_id.to_string(),
            display_name: participant.display_name.clone(),
            avatar: participant.avatar.clone(),
            question_index,
            chosen_answer: answer.to_string(),
            response_time_ms,
            is_correct,
            submission_order: self.submission_seq,
        };
        self.submission_seq += 1;
        self.current_answers.push(submission);
        self.current_answers
            .sort_by_key(|a| (a.response_time_ms, a.submission_order));

        tracing::info!(
            room_code = %self.code,
            participant_id = %participant_id,
            question_index,
            response_time_ms,
            is_correct,
            earned,
            "Answer accepted"
        );
        Ok(self.current_answers.clone())
    }

    /// First join creates the participant; a known id is a reconnect and
    /// keeps its counters, receiving a private state snapshot instead of a
    /// join broadcast.
    pub fn join(
        &mut self,
        participant_id: String,
        display_name: String,
        avatar: Option<String>,
        connection_id: String,
    ) -> JoinOutcome {
        if let Some(existing) = self.participants.get_mut(&participant_id) {
            existing.current_connection_id = Some(connection_id);
            existing.display_name = display_name;
            existing.avatar = avatar;
            tracing::info!(
                room_code = %self.code,
                participant_id = %participant_id,
                "Participant reconnected"
            );
            let sync = self.sync_snapshot(Some(&participant_id));
            return JoinOutcome::Reconnected {
                sync,
                online_count: self.online_count(),
            };
        }

        let participant = Participant {
            participant_id: participant_id.clone(),
            display_name,
            avatar,
            current_connection_id: Some(connection_id),
            score: 0,
            correct_count: 0,
            total_answers: 0,
        };
        let info = participant.info();
        self.participants.insert(participant_id.clone(), participant);
        tracing::info!(
            room_code = %self.code,
            participant_id = %participant_id,
            "Participant joined"
        );
        // A mid-quiz first join still needs the current state to render
        let sync = self.sync_snapshot(Some(&participant_id));
        JoinOutcome::Joined {
            participant: info,
            sync,
            online_count: self.online_count(),
        }
    }

    /// Soft-offline: the participant stays registered, only the connection
    /// reference is cleared. Returns the new online count if a participant
    /// was using this connection.
    pub fn disconnect(&mut self, connection_id: &str) -> Option<usize> {
        let participant = self
            .participants
            .values_mut()
            .find(|p| p.current_connection_id.as_deref() == Some(connection_id))?;
        participant.current_connection_id = None;
        tracing::info!(
            room_code = %self.code,
            participant_id = %participant.participant_id,
            "Participant disconnected"
        );
        Some(self.online_count())
    }

    /// Current-state snapshot that makes a new connection's view
    /// indistinguishable from uninterrupted membership.
    pub fn sync_snapshot(&self, participant_id: Option<&str>) -> SyncSnapshot {
        let live_question = match (self.phase, self.current_question_index) {
            (QuestionPhase::Open, Some(index)) => {
                let elapsed = self
                    .opened_at
                    .map(|t| t.elapsed().as_secs() as u32)
                    .unwrap_or(0);
                Some(LiveQuestion {
                    question: self.questions[index].clone(),
                    question_index: index,
                    time_limit_seconds: self.current_time_limit_secs,
                    remaining_seconds: self.current_time_limit_secs.saturating_sub(elapsed),
                })
            }
            _ => None,
        };
        SyncSnapshot {
            status: self.status,
            live_question,
            ranking: self.current_answers.clone(),
            my_stats: participant_id.and_then(|id| self.stats_for(id)),
        }
    }

    pub fn stats_for(&self, participant_id: &str) -> Option<ParticipantStats> {
        let me = self.participants.get(participant_id)?;
        let rank = 1 + self
            .participants
            .values()
            .filter(|p| p.score > me.score)
            .count();
        Some(ParticipantStats {
            score: me.score,
            correct_count: me.correct_count,
            total_answers: me.total_answers,
            accuracy: me.accuracy(),
            rank,
        })
    }
}
