use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::RwLock;

use crate::error::{QuizError, Result};

use super::actor::{spawn_room, RoomHandle};
use super::room::{Question, RoomState};
use super::scoring::ScorePolicy;

const ROOM_CODE_LEN: usize = 6;
const ROOM_CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Process-wide map from room code to live room. Owns every room; created
/// once at startup and passed around explicitly.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, RoomHandle>>,
    default_time_limit_secs: u32,
    policy: ScorePolicy,
}

impl RoomRegistry {
    pub fn new(default_time_limit_secs: u32, policy: ScorePolicy) -> Arc<Self> {
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            default_time_limit_secs,
            policy,
        })
    }

    /// Rejection-samples short uppercase alphanumeric codes until one is
    /// free. 36^6 codes make operational collisions negligible, so the loop
    /// almost never iterates.
    fn generate_room_code() -> String {
        let mut rng = rand::thread_rng();
        (0..ROOM_CODE_LEN)
            .map(|_| {
                let idx = rng.gen_range(0..ROOM_CODE_CHARSET.len());
                ROOM_CODE_CHARSET[idx] as char
            })
            .collect()
    }

    pub async fn create_room(
        &self,
        name: String,
        time_limit_seconds: Option<u32>,
        mut questions: Vec<Question>,
    ) -> Result<RoomHandle> {
        validate_question_set(&questions)?;
        for question in &mut questions {
            question.is_multiple_choice = question.correct_label_set().len() > 1;
        }
        let time_limit = match time_limit_seconds {
            Some(0) => return Err(QuizError::invalid("time limit must be positive")),
            Some(n) => n,
            None => self.default_time_limit_secs,
        };

        let mut rooms = self.rooms.write().await;
        let code = loop {
            let candidate = Self::generate_room_code();
            if !rooms.contains_key(&candidate) {
                break candidate;
            }
        };

        let state = RoomState::new(code.clone(), name, questions, time_limit, self.policy);
        let handle = spawn_room(state);
        rooms.insert(code.clone(), handle.clone());

        tracing::info!(room_code = %code, time_limit_seconds = time_limit, "Room created");
        Ok(handle)
    }

    pub async fn lookup(&self, code: &str) -> Option<RoomHandle> {
        let rooms = self.rooms.read().await;
        rooms.get(code).cloned()
    }

    pub async fn lookup_required(&self, code: &str) -> Result<RoomHandle> {
        self.lookup(code)
            .await
            .ok_or_else(|| QuizError::RoomNotFound(code.to_string()))
    }

    pub async fn room_count(&self) -> usize {
        let rooms = self.rooms.read().await;
        rooms.len()
    }

    /// Externally-triggered expiry: drops rooms that ended more than `ttl`
    /// ago. Live and waiting rooms are never touched.
    pub async fn sweep_ended(&self, ttl: Duration) -> usize {
        let expired: Vec<String> = {
            let rooms = self.rooms.read().await;
            let mut codes = Vec::new();
            for (code, handle) in rooms.iter() {
                if let Some(ended_at) = handle.ended_at().await {
                    if ended_at.elapsed() >= ttl {
                        codes.push(code.clone());
                    }
                }
            }
            codes
        };

        if expired.is_empty() {
            return 0;
        }

        let mut rooms = self.rooms.write().await;
        let mut removed = 0;
        for code in expired {
            if rooms.remove(&code).is_some() {
                tracing::info!(room_code = %code, "Ended room reclaimed");
                removed += 1;
            }
        }
        removed
    }
}

fn validate_question_set(questions: &[Question]) -> Result<()> {
    if questions.is_empty() {
        return Err(QuizError::invalid("question set is empty"));
    }
    for (i, question) in questions.iter().enumerate() {
        if question.options.len() < 2 {
            return Err(QuizError::invalid(format!(
                "question {} has fewer than 2 options",
                i
            )));
        }
        if question.correct_label_set().is_empty() {
            return Err(QuizError::invalid(format!(
                "question {} has an empty correct answer",
                i
            )));
        }
    }
    Ok(())
}
