/// Point award policy: correct answers earn a base amount plus a bonus that
/// decays linearly with response latency. The curve is configuration, not a
/// contract — rankings are by latency, never by points.
#[derive(Debug, Clone, Copy)]
pub struct ScorePolicy {
    pub base_points: u32,
    pub max_speed_bonus: u32,
}

impl Default for ScorePolicy {
    fn default() -> Self {
        Self {
            base_points: 100,
            max_speed_bonus: 100,
        }
    }
}

impl ScorePolicy {
    pub fn new(base_points: u32, max_speed_bonus: u32) -> Self {
        Self {
            base_points,
            max_speed_bonus,
        }
    }

    /// Points awarded for a single submission
    pub fn points(&self, is_correct: bool, response_time_ms: u64, time_limit_ms: u64) -> u32 {
        if !is_correct {
            return 0;
        }

        if time_limit_ms == 0 || response_time_ms >= time_limit_ms {
            return self.base_points;
        }

        let remaining = time_limit_ms - response_time_ms;
        let bonus = (self.max_speed_bonus as u64 * remaining / time_limit_ms) as u32;
        self.base_points + bonus
    }
}
