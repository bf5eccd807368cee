//! Scripted command runner for collaborator tests

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::{CommandOutput, CommandRequest, CommandRunner};
use crate::cancel::CancelToken;
use crate::error::ExperimentError;

/// Replays canned outputs in order and records every request
#[derive(Default)]
pub(crate) struct ScriptedRunner {
    responses: Mutex<VecDeque<Result<CommandOutput, ExperimentError>>>,
    requests: Mutex<Vec<CommandRequest>>,
}

impl ScriptedRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn respond(self, output: CommandOutput) -> Self {
        self.responses.lock().unwrap().push_back(Ok(output));
        self
    }

    pub(crate) fn fail(self, error: ExperimentError) -> Self {
        self.responses.lock().unwrap().push_back(Err(error));
        self
    }

    pub(crate) fn requests(&self) -> Vec<CommandRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn execute(
        &self,
        request: &CommandRequest,
        _cancel: &CancelToken,
    ) -> Result<CommandOutput, ExperimentError> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ExperimentError::Sandbox(format!("unscripted command: {}", request.display()))))
    }
}
