use std::collections::VecDeque;
use std::sync::Mutex;
use testloop_engine::{GenerateError, GenerationRequest, Generator};

/// Replays canned replies in order; an exhausted script answers `EmptyResponse`.
pub(crate) struct ScriptedGenerator {
    replies: Mutex<VecDeque<Result<String, GenerateError>>>,
    seen: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub(crate) fn new(replies: Vec<Result<String, GenerateError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn requests(&self) -> Vec<GenerationRequest> {
        self.seen.lock().expect("seen lock").clone()
    }
}

impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<String, GenerateError> {
        self.seen.lock().expect("seen lock").push(request.clone());
        self.replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .unwrap_or(Err(GenerateError::EmptyResponse))
    }
}
