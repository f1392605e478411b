use crate::billing::Usage;
use crate::error::CoreResult;
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// A single tool invocation recorded by a model call, carried back so the
/// dispatch loop can react (e.g. detect `write_file` payloads for the
/// `file-manifest` transform).
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub tool: String,
    pub args: Value,
}

#[derive(Debug, Clone)]
pub struct ModelCallResult {
    pub output_text: String,
    pub usage: Usage,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone)]
pub struct ModelCallRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub tools: Vec<String>,
    pub max_output_tokens: u32,
    pub max_tool_steps: u32,
}

/// The opaque external collaborator (`spec.md` §1, §4.1, §9 design note "Ambient
/// SDK metadata → explicit `Usage` struct"). This crate defines the contract and
/// consumes it; it ships no concrete provider adapter. Implementations must
/// observe `cancellation` at every suspension point.
#[async_trait]
pub trait ModelCallCapability: Send + Sync {
    async fn call(
        &self,
        provider: &str,
        model: &str,
        request: ModelCallRequest,
        cancellation: CancellationToken,
    ) -> CoreResult<ModelCallResult>;
}
