//! Amount limit rule.

use async_trait::async_trait;
use nats_function::{FunctionHandler, Request, Responder};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Largest amount that passes when `RULE_MAX_AMOUNT` is not set.
pub const DEFAULT_MAX_AMOUNT: u64 = 1000;

/// Incoming rule check.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RuleRequest {
    pub amt: u64,
}

/// Verdict of a rule check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
}

/// Outgoing rule check result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleResponse {
    pub result: Verdict,
}

/// Checks that the requested amount stays within a limit.
#[derive(Debug, Clone)]
pub struct RuleHandler {
    max_amount: u64,
}

impl RuleHandler {
    pub fn new(max_amount: u64) -> Self {
        Self { max_amount }
    }

    pub fn evaluate(&self, request: &RuleRequest) -> RuleResponse {
        let result = if request.amt <= self.max_amount {
            Verdict::Pass
        } else {
            Verdict::Fail
        };
        RuleResponse { result }
    }
}

impl Default for RuleHandler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_AMOUNT)
    }
}

#[async_trait]
impl FunctionHandler for RuleHandler {
    async fn handle(&self, request: Request, responder: &Responder) -> eyre::Result<()> {
        let rule: RuleRequest = request.parse()?;
        let response = self.evaluate(&rule);

        debug!(
            sequence = request.sequence,
            amt = rule.amt,
            result = ?response.result,
            "Rule evaluated"
        );

        responder.respond(&response).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "amount-limit"
    }
}
