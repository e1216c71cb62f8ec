use std::sync::Arc;

use async_trait::async_trait;

use super::required_str;
use crate::capability::{Capability, CapabilityError, Params};
use crate::gate::{NO_ANSWER, PermissionGate};

/// Lets a worker put a question to the interactive user.
pub struct AskUser {
    gate: Arc<PermissionGate>,
}

impl AskUser {
    pub fn new(gate: Arc<PermissionGate>) -> Self {
        Self { gate }
    }
}

#[async_trait]
impl Capability for AskUser {
    fn name(&self) -> &str {
        "ask_user"
    }

    fn description(&self) -> &str {
        "Ask the user a clarifying question (question) and return the answer."
    }

    fn side_effecting(&self) -> bool {
        false
    }

    async fn invoke(&self, params: &Params) -> Result<String, CapabilityError> {
        let question = required_str(params, "question", "ask_user")?;
        Ok(self
            .gate
            .ask_user(question)
            .await
            .unwrap_or_else(|| NO_ANSWER.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingRenderer, event_log, params};

    #[tokio::test]
    async fn answers_are_returned_and_eof_is_reported() {
        let renderer =
            Arc::new(RecordingRenderer::default().with_answers(vec![Some("use tabs".to_string())]));
        let ask = AskUser::new(Arc::new(PermissionGate::new(event_log(renderer.clone()))));

        let question = params(&[("question", "tabs or spaces?")]);
        assert_eq!(ask.invoke(&question).await.unwrap(), "use tabs");
        assert_eq!(ask.invoke(&question).await.unwrap(), NO_ANSWER);
        assert!(ask.invoke(&Params::new()).await.is_err());
    }
}
