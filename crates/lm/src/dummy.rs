//! A scripted language model for tests.
//!
//! `ScriptedLm` pops one canned response per `chat` call and records every
//! request it sees, so engine tests can drive the full decision loop with
//! no network and then assert on what was asked.

use parking_lot::Mutex;

use arbor_domain::error::{Error, Result};

use crate::traits::{ChatRequest, ChatResponse, LmClient};

pub struct ScriptedLm {
    responses: Mutex<std::collections::VecDeque<String>>,
    requests: Mutex<Vec<ChatRequest>>,
    /// Number of leading calls that fail with a transient error.
    fail_first: Mutex<u32>,
}

impl ScriptedLm {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            fail_first: Mutex::new(0),
        }
    }

    /// Fail the first call with a transient error, then serve `responses`.
    pub fn failing_then(responses: Vec<String>) -> Self {
        let lm = Self::new(responses);
        *lm.fail_first.lock() = 1;
        lm
    }

    /// Every request seen so far, in call order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    /// Responses not yet consumed.
    pub fn remaining(&self) -> usize {
        self.responses.lock().len()
    }
}

#[async_trait::async_trait]
impl LmClient for ScriptedLm {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        self.requests.lock().push(req.clone());

        {
            let mut fail = self.fail_first.lock();
            if *fail > 0 {
                *fail -= 1;
                return Err(Error::Upstream("scripted transient failure".into()));
            }
        }

        let content = self
            .responses
            .lock()
            .pop_front()
            .ok_or_else(|| Error::Upstream("scripted LM ran out of responses".into()))?;
        Ok(ChatResponse {
            content,
            model: req.model.clone(),
        })
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ChatMessage;

    #[tokio::test]
    async fn pops_responses_in_order() {
        let lm = ScriptedLm::new(vec!["one".into(), "two".into()]);
        let req = ChatRequest {
            messages: vec![ChatMessage::user("x")],
            ..Default::default()
        };
        assert_eq!(lm.chat(&req).await.unwrap().content, "one");
        assert_eq!(lm.chat(&req).await.unwrap().content, "two");
        assert!(lm.chat(&req).await.is_err());
        assert_eq!(lm.requests().len(), 3);
    }
}
