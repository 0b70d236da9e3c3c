//! Test doubles for the bus seam.
//!
//! `ScriptedBus` replays a programmed sequence of outcomes and records every
//! request it sees; the manager's test suites use it to drive retry,
//! failure and two-pass-commit scenarios without a transport.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{AtomValue, BusError, CallBus, CallReply, CallRequest};

/// What the scripted bus should answer when its script runs dry.
#[derive(Debug, Clone)]
pub enum FallbackBehavior {
    /// Succeed with an empty reply.
    EmptyReply,
    /// Keep returning this error.
    Error(BusError),
}

/// A bus that replays scripted outcomes in order and records requests.
pub struct ScriptedBus {
    script: Mutex<VecDeque<Result<CallReply, BusError>>>,
    calls: Mutex<Vec<CallRequest>>,
    fallback: FallbackBehavior,
}

impl Default for ScriptedBus {
    fn default() -> Self {
        ScriptedBus::new()
    }
}

impl ScriptedBus {
    /// An empty script; every call succeeds with an empty reply.
    #[must_use]
    pub fn new() -> Self {
        ScriptedBus {
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            fallback: FallbackBehavior::EmptyReply,
        }
    }

    /// A bus that fails every call with `error`.
    #[must_use]
    pub fn always_failing(error: BusError) -> Self {
        ScriptedBus {
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            fallback: FallbackBehavior::Error(error),
        }
    }

    /// Queues a successful reply.
    pub fn push_reply(&self, reply: CallReply) {
        self.script.lock().push_back(Ok(reply));
    }

    /// Queues an error outcome.
    pub fn push_error(&self, error: BusError) {
        self.script.lock().push_back(Err(error));
    }

    /// Queues the standard status-probe reply `(status, reason)`.
    pub fn push_status(&self, status: u32, reason: &str) {
        self.push_reply(
            CallReply::empty()
                .with("status", AtomValue::U32(status))
                .with("reason", AtomValue::Text(reason.to_owned())),
        );
    }

    /// Every request seen so far, in order.
    #[must_use]
    pub fn recorded_calls(&self) -> Vec<CallRequest> {
        self.calls.lock().clone()
    }

    /// Number of requests seen so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl CallBus for ScriptedBus {
    async fn call(&self, request: &CallRequest) -> Result<CallReply, BusError> {
        self.calls.lock().push(request.clone());
        if let Some(outcome) = self.script.lock().pop_front() {
            return outcome;
        }
        match &self.fallback {
            FallbackBehavior::EmptyReply => Ok(CallReply::empty()),
            FallbackBehavior::Error(e) => Err(e.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_outcomes_replay_in_order() {
        let bus = ScriptedBus::new();
        bus.push_status(3, "");
        bus.push_error(BusError::NoFinder);

        let req = CallRequest::parse("fea/common/get_status").unwrap();
        let reply = bus.call(&req).await.unwrap();
        assert_eq!(reply.get_u32("status"), Some(3));
        assert_eq!(bus.call(&req).await.unwrap_err(), BusError::NoFinder);
        // Script exhausted: fallback empty reply.
        assert_eq!(bus.call(&req).await.unwrap(), CallReply::empty());
        assert_eq!(bus.call_count(), 3);
    }

    #[tokio::test]
    async fn always_failing_never_recovers() {
        let bus = ScriptedBus::always_failing(BusError::ReplyTimedOut {
            request: "x".to_owned(),
        });
        let req = CallRequest::parse("a/b/c").unwrap();
        for _ in 0..3 {
            assert!(bus.call(&req).await.unwrap_err().is_transient());
        }
        assert_eq!(bus.recorded_calls().len(), 3);
    }
}
