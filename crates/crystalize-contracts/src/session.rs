use uuid::Uuid;

/// Final artifact of one pipeline run: an encoded PNG whose dimensions are
/// guaranteed to match the source micrograph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingResult {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Loading,
    Done,
    Failed,
}

/// Per-session submission state, owned by the shell.
///
/// Transitions only through the defined events: `begin_submission`,
/// `complete`, `fail`, and `reset`. At most one submission may be outstanding;
/// `begin_submission` while Loading is refused. A failure records its message
/// but leaves any prior successful result in place so the shell can keep
/// showing it next to the error.
#[derive(Debug)]
pub struct Session {
    id: String,
    phase: SessionPhase,
    result: Option<ProcessingResult>,
    error: Option<String>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            phase: SessionPhase::Idle,
            result: None,
            error: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn result(&self) -> Option<&ProcessingResult> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Enters Loading unless a submission is already outstanding.
    pub fn begin_submission(&mut self) -> bool {
        if self.phase == SessionPhase::Loading {
            return false;
        }
        self.phase = SessionPhase::Loading;
        self.error = None;
        true
    }

    pub fn complete(&mut self, result: ProcessingResult) {
        self.phase = SessionPhase::Done;
        self.result = Some(result);
        self.error = None;
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.phase = SessionPhase::Failed;
        self.error = Some(message.into());
    }

    /// New upload: discard any prior result and return to Idle.
    pub fn reset(&mut self) {
        self.phase = SessionPhase::Idle;
        self.result = None;
        self.error = None;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(width: u32, height: u32) -> ProcessingResult {
        ProcessingResult {
            png: vec![1, 2, 3],
            width,
            height,
        }
    }

    #[test]
    fn only_one_submission_may_be_outstanding() {
        let mut session = Session::new();
        assert!(session.begin_submission());
        assert_eq!(session.phase(), SessionPhase::Loading);
        assert!(!session.begin_submission());
        assert_eq!(session.phase(), SessionPhase::Loading);
    }

    #[test]
    fn failure_keeps_prior_result() {
        let mut session = Session::new();
        assert!(session.begin_submission());
        session.complete(result(400, 300));
        assert_eq!(session.phase(), SessionPhase::Done);

        assert!(session.begin_submission());
        session.fail("model returned text instead of an image");
        assert_eq!(session.phase(), SessionPhase::Failed);
        assert_eq!(session.result().map(|r| r.width), Some(400));
        assert!(session.error().is_some());
    }

    #[test]
    fn resubmission_after_failure_clears_error() {
        let mut session = Session::new();
        session.begin_submission();
        session.fail("boom");
        assert!(session.begin_submission());
        assert!(session.error().is_none());
    }

    #[test]
    fn reset_discards_result_and_error() {
        let mut session = Session::new();
        session.begin_submission();
        session.complete(result(64, 64));
        session.reset();
        assert_eq!(session.phase(), SessionPhase::Idle);
        assert!(session.result().is_none());
        assert!(session.error().is_none());
    }

    #[test]
    fn sessions_get_unique_ids() {
        assert_ne!(Session::new().id(), Session::new().id());
    }
}
