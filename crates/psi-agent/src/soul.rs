//! The loop driver
//!
//! One `run` drives the model through repeated steps of completion and
//! tool dispatch until it produces a terminal response or a stop
//! condition fires. Between steps the driver honours pending D-Mail and
//! the compaction policy. Everything the loop does is observable on the
//! wire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use psi_ai::{CompletionEvent, ContentPart, Llm, Message, ToolResult};
use tokio_util::sync::CancellationToken;

use crate::approval::Approval;
use crate::compaction::{CompactionConfig, CompactionStrategy};
use crate::context::Context;
use crate::dmail::DMailBox;
use crate::error::Result;
use crate::events::SoulEvent;
use crate::registry::ToolRegistry;
use crate::wire::{Wire, WireSubscription};

/// Driver configuration
#[derive(Debug, Clone)]
pub struct SoulConfig {
    /// System prompt prepended to every completion request
    pub system_prompt: Option<String>,
    /// Hard cap on steps within one `run`
    pub max_steps_per_run: u32,
    /// Compaction policy
    pub compaction: CompactionConfig,
}

impl Default for SoulConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_steps_per_run: 50,
            compaction: CompactionConfig::default(),
        }
    }
}

/// Machine-readable outcome of one `run`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The model produced a terminal response
    Completed,
    /// The run was cancelled
    Interrupted,
    /// The step cap fired before a terminal response
    MaxStepsReached,
    /// The provider or transport failed; history retains the user message
    ProviderError { detail: String },
}

/// Cloneable handle for poking the driver from outside
#[derive(Clone)]
pub struct SoulHandle {
    cancel: Arc<Mutex<CancellationToken>>,
    is_running: Arc<AtomicBool>,
}

impl SoulHandle {
    fn new() -> Self {
        Self {
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel the current run
    pub fn abort(&self) {
        self.cancel.lock().cancel();
    }

    /// Whether a run is in flight
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    fn reset(&self) -> CancellationToken {
        let fresh = CancellationToken::new();
        *self.cancel.lock() = fresh.clone();
        fresh
    }
}

/// The agent loop driver.
///
/// All collaborators arrive by construction; the soul owns no globals.
pub struct Soul {
    config: SoulConfig,
    llm: Arc<Llm>,
    context: Context,
    registry: ToolRegistry,
    approval: Arc<Approval>,
    wire: Wire,
    dmail: DMailBox,
    compaction: Arc<dyn CompactionStrategy>,
    handle: SoulHandle,
    /// Token mark of a failed summarization; not retried until it moves
    compaction_failed_at: Option<u64>,
}

impl Soul {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SoulConfig,
        llm: Arc<Llm>,
        context: Context,
        registry: ToolRegistry,
        approval: Arc<Approval>,
        wire: Wire,
        dmail: DMailBox,
        compaction: Arc<dyn CompactionStrategy>,
    ) -> Self {
        let soul = Self {
            config,
            llm,
            context,
            registry,
            approval,
            wire,
            dmail,
            compaction,
            handle: SoulHandle::new(),
            compaction_failed_at: None,
        };
        soul.dmail
            .set_checkpoint_count(soul.context.checkpoint_count());
        soul
    }

    /// Subscribe a front-end to loop events
    pub fn subscribe(&self) -> WireSubscription {
        self.wire.subscribe()
    }

    /// Handle for aborting the current run
    pub fn handle(&self) -> SoulHandle {
        self.handle.clone()
    }

    /// The durable context backing this session
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The approval gate shared with this session's tools
    pub fn approval(&self) -> &Arc<Approval> {
        &self.approval
    }

    /// Drive one user turn to its outcome.
    pub async fn run(&mut self, input: &str) -> Result<RunOutcome> {
        let cancel = self.handle.reset();
        self.compaction_failed_at = None;
        self.handle.is_running.store(true, Ordering::Release);
        let result = self.run_inner(input, cancel).await;
        self.handle.is_running.store(false, Ordering::Release);
        result
    }

    async fn run_inner(&mut self, input: &str, cancel: CancellationToken) -> Result<RunOutcome> {
        self.context.append(Message::user(input))?;

        let mut step: u32 = 0;
        loop {
            // between steps: honour pending D-Mail, then the compaction policy
            if let Some(mail) = self.dmail.fetch() {
                tracing::debug!("honouring D-Mail to checkpoint {}", mail.checkpoint_id);
                self.context.revert_to(mail.checkpoint_id)?;
                self.dmail
                    .set_checkpoint_count(self.context.checkpoint_count());
                self.context.append(Message::user(mail.message))?;
            }
            self.maybe_compact().await?;

            step += 1;
            self.wire.publish(SoulEvent::StepBegin { step });
            if step > self.config.max_steps_per_run {
                tracing::warn!("run exceeded {} steps", self.config.max_steps_per_run);
                self.wire.publish(SoulEvent::StepInterrupted);
                return Ok(RunOutcome::MaxStepsReached);
            }

            let mut stream = match self
                .llm
                .complete(self.build_history(), self.registry.catalog(), cancel.clone())
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    return Ok(RunOutcome::ProviderError {
                        detail: e.to_string(),
                    });
                }
            };

            let mut output = None;
            let mut provider_error = None;
            while let Some(event) = stream.next().await {
                match event {
                    CompletionEvent::Part(part) => match part {
                        ContentPart::ToolCall { ref id, ref function } => {
                            self.wire.publish(SoulEvent::ToolCall {
                                id: id.clone(),
                                name: function.name.clone(),
                                arguments: function.arguments.clone(),
                            });
                        }
                        part => self.wire.publish(SoulEvent::ContentPart { part }),
                    },
                    CompletionEvent::Finished(o) => output = Some(o),
                    CompletionEvent::Error { message } => provider_error = Some(message),
                }
            }
            if let Some(detail) = provider_error {
                // no partial assistant message reaches the context
                return Ok(RunOutcome::ProviderError { detail });
            }
            let Some(output) = output else {
                return Ok(RunOutcome::ProviderError {
                    detail: "provider stream ended without completing".to_string(),
                });
            };

            let assistant = Message::assistant(output.parts.clone());
            let calls: Vec<(String, String, String)> = assistant
                .tool_calls()
                .into_iter()
                .map(|(id, name, args)| (id.to_string(), name.to_string(), args.to_string()))
                .collect();

            if !output.parts.is_empty() {
                self.context.append(assistant)?;
            }
            if !output.interrupted {
                self.context.update_token_count(output.token_count)?;
            }

            if output.interrupted {
                self.settle_unmatched_calls(&calls)?;
                self.wire.publish(SoulEvent::StepInterrupted);
                return Ok(RunOutcome::Interrupted);
            }

            if calls.is_empty() {
                self.wire.publish(SoulEvent::StepEnd);
                self.context.checkpoint(true)?;
                self.dmail
                    .set_checkpoint_count(self.context.checkpoint_count());
                return Ok(RunOutcome::Completed);
            }

            // dispatch sequentially so later tools observe earlier effects
            let mut results = Vec::with_capacity(calls.len());
            for (id, name, args) in &calls {
                let result = if cancel.is_cancelled() {
                    ToolResult::error("interrupted")
                } else {
                    self.registry.dispatch(name, args, cancel.clone()).await
                };
                self.wire.publish(SoulEvent::ToolResult {
                    call_id: id.clone(),
                    result: result.clone(),
                });
                results.push(result.into_part(id.clone()));
            }
            self.context.append(Message::tool(results))?;

            if cancel.is_cancelled() {
                self.wire.publish(SoulEvent::StepInterrupted);
                return Ok(RunOutcome::Interrupted);
            }
        }
    }

    /// Append synthetic error results for announced calls that will never
    /// execute, so no tool call is left dangling.
    fn settle_unmatched_calls(&mut self, calls: &[(String, String, String)]) -> Result<()> {
        if calls.is_empty() {
            return Ok(());
        }
        let mut results = Vec::with_capacity(calls.len());
        for (id, _, _) in calls {
            let result = ToolResult::error("interrupted");
            self.wire.publish(SoulEvent::ToolResult {
                call_id: id.clone(),
                result: result.clone(),
            });
            results.push(result.into_part(id.clone()));
        }
        self.context.append(Message::tool(results))
    }

    fn build_history(&self) -> Vec<Message> {
        let mut history = Vec::with_capacity(self.context.history().len() + 1);
        if let Some(ref system_prompt) = self.config.system_prompt {
            history.push(Message::system(system_prompt.clone()));
        }
        history.extend_from_slice(self.context.history());
        history
    }

    async fn maybe_compact(&mut self) -> Result<()> {
        if !self.config.compaction.enabled {
            return Ok(());
        }
        let threshold =
            (self.llm.max_context_size() as f64 * self.config.compaction.ratio) as u64;
        let tokens = self.context.token_count();
        if tokens <= threshold {
            return Ok(());
        }
        // a failed attempt is not retried until the token count moves
        if self.compaction_failed_at == Some(tokens) {
            return Ok(());
        }
        let Some(boundary) = self.context.last_checkpoint_boundary() else {
            return Ok(());
        };
        if boundary == 0 {
            return Ok(());
        }

        self.wire.publish(SoulEvent::CompactionBegin);
        let prefix = self.context.history()[..boundary].to_vec();
        match self.compaction.summarize(&prefix).await {
            Ok(summary) => {
                let summary_msg = Message::assistant(vec![ContentPart::text(format!(
                    "<context-summary>\n{summary}\n</context-summary>"
                ))]);
                self.context.replace_prefix(summary_msg)?;
                self.dmail
                    .set_checkpoint_count(self.context.checkpoint_count());
                self.compaction_failed_at = None;
            }
            Err(e) => {
                self.compaction_failed_at = Some(tokens);
                tracing::warn!("compaction failed, continuing uncompacted: {e}");
            }
        }
        self.wire.publish(SoulEvent::CompactionEnd);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalResponse;
    use crate::tool::Tool;
    use crate::tools::SendDMailTool;
    use async_trait::async_trait;
    use psi_ai::{ChatProvider, Chunk, ChunkStream, Role, ToolSpec, ToolStatus};
    use std::collections::VecDeque;
    use std::path::Path;

    /// Replays one scripted chunk sequence per completion request
    struct ScriptedProvider {
        scripts: Mutex<VecDeque<Vec<psi_ai::Result<Chunk>>>>,
    }

    impl ScriptedProvider {
        fn new(scripts: Vec<Vec<psi_ai::Result<Chunk>>>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
            }
        }
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        async fn stream(
            &self,
            _history: &[Message],
            _tool_specs: &[ToolSpec],
            _cancel: CancellationToken,
        ) -> psi_ai::Result<ChunkStream> {
            let script = self.scripts.lock().pop_front().unwrap_or_else(|| {
                vec![Ok(Chunk::TextDelta("done".into())), Ok(Chunk::Done)]
            });
            Ok(Box::pin(tokio_stream::iter(script)))
        }
    }

    /// Provider whose stream call itself fails
    struct FailingProvider;

    #[async_trait]
    impl ChatProvider for FailingProvider {
        async fn stream(
            &self,
            _history: &[Message],
            _tool_specs: &[ToolSpec],
            _cancel: CancellationToken,
        ) -> psi_ai::Result<ChunkStream> {
            Err(psi_ai::Error::Auth("quota exhausted".into()))
        }
    }

    struct StubSummarizer;

    #[async_trait]
    impl CompactionStrategy for StubSummarizer {
        async fn summarize(&self, _messages: &[Message]) -> Result<String> {
            Ok("summarized history".to_string())
        }
    }

    struct FailingSummarizer;

    #[async_trait]
    impl CompactionStrategy for FailingSummarizer {
        async fn summarize(&self, _messages: &[Message]) -> Result<String> {
            Err(crate::error::Error::Compaction("summarizer offline".to_string()))
        }
    }

    struct LsTool;

    #[async_trait]
    impl Tool for LsTool {
        fn name(&self) -> &str {
            "Ls"
        }
        fn description(&self) -> &str {
            "List the working directory"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        async fn execute(
            &self,
            _arguments: serde_json::Value,
            _cancel: CancellationToken,
        ) -> ToolResult {
            ToolResult::ok("", ".\nfile")
        }
    }

    /// Tool with side effects that consults the approval gate
    struct RmTool {
        approval: Arc<Approval>,
    }

    #[async_trait]
    impl Tool for RmTool {
        fn name(&self) -> &str {
            "Rm"
        }
        fn description(&self) -> &str {
            "Remove a file"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            })
        }
        async fn execute(
            &self,
            arguments: serde_json::Value,
            _cancel: CancellationToken,
        ) -> ToolResult {
            let path = arguments.get("path").and_then(|v| v.as_str()).unwrap_or("");
            match self
                .approval
                .request("Rm", path, &format!("remove {path}"))
                .await
            {
                ApprovalResponse::Reject => ToolResult::rejected("removal rejected by user"),
                _ => ToolResult::ok("", format!("removed {path}")),
            }
        }
    }

    /// Tool that cancels the run while executing
    struct AbortingTool {
        handle: Arc<Mutex<Option<SoulHandle>>>,
    }

    #[async_trait]
    impl Tool for AbortingTool {
        fn name(&self) -> &str {
            "Boom"
        }
        fn description(&self) -> &str {
            "Cancels the run"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        async fn execute(
            &self,
            _arguments: serde_json::Value,
            _cancel: CancellationToken,
        ) -> ToolResult {
            if let Some(handle) = self.handle.lock().as_ref() {
                handle.abort();
            }
            ToolResult::ok("", "aborted the run")
        }
    }

    fn tool_call_chunk(id: &str, name: &str, args: &str) -> psi_ai::Result<Chunk> {
        Ok(Chunk::ToolCallDelta {
            index: 0,
            id: Some(id.into()),
            name: Some(name.into()),
            arguments_delta: Some(args.into()),
        })
    }

    fn text_turn(text: &str, tokens: u64) -> Vec<psi_ai::Result<Chunk>> {
        vec![
            Ok(Chunk::TextDelta(text.into())),
            Ok(Chunk::Usage { tokens }),
            Ok(Chunk::Done),
        ]
    }

    struct Harness {
        soul: Soul,
        events: WireSubscription,
        _dir: tempfile::TempDir,
    }

    fn harness(provider: Arc<dyn ChatProvider>, registry: ToolRegistry) -> Harness {
        harness_with(provider, registry, SoulConfig::default(), DMailBox::new(), 200_000)
    }

    fn harness_with(
        provider: Arc<dyn ChatProvider>,
        registry: ToolRegistry,
        config: SoulConfig,
        dmail: DMailBox,
        max_context_size: u64,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let context = Context::new(dir.path().join("history.jsonl"));
        let wire = Wire::new();
        let events = wire.subscribe();
        let approval = Arc::new(Approval::new(true, wire.clone()));
        let llm = Arc::new(Llm::new(provider, max_context_size));
        let soul = Soul::new(
            config,
            llm,
            context,
            registry,
            approval,
            wire,
            dmail,
            Arc::new(StubSummarizer),
        );
        Harness {
            soul,
            events,
            _dir: dir,
        }
    }

    fn drain(events: &mut WireSubscription) -> Vec<SoulEvent> {
        let mut out = Vec::new();
        while let Some(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn file_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    #[tokio::test]
    async fn test_plain_turn() {
        let provider = Arc::new(ScriptedProvider::new(vec![text_turn("hello", 3)]));
        let mut h = harness(provider, ToolRegistry::new());

        let outcome = h.soul.run("hi").await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let history = h.soul.context().history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].text(), "hi");
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].text(), "hello");
        assert_eq!(h.soul.context().token_count(), 3);
        assert_eq!(h.soul.context().checkpoint_count(), 1);

        // 2 messages, 1 usage, 1 checkpoint
        assert_eq!(file_lines(h.soul.context().path()).len(), 4);

        let events = drain(&mut h.events);
        assert!(matches!(events[0], SoulEvent::StepBegin { step: 1 }));
        assert!(
            matches!(&events[1], SoulEvent::ContentPart { part } if part.as_text() == Some("hello"))
        );
        assert!(matches!(events[2], SoulEvent::StepEnd));
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn test_single_tool_call() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            vec![
                tool_call_chunk("t1", "Ls", "{}"),
                Ok(Chunk::Usage { tokens: 10 }),
                Ok(Chunk::Done),
            ],
            text_turn("done", 12),
        ]));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(LsTool)).unwrap();
        let mut h = harness(provider, registry);

        let outcome = h.soul.run("list").await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let history = h.soul.context().history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[1].tool_calls().len(), 1);
        assert_eq!(history[2].role, Role::Tool);
        match &history[2].content[0] {
            ContentPart::ToolResult {
                call_id,
                status,
                output,
                ..
            } => {
                assert_eq!(call_id, "t1");
                assert_eq!(*status, ToolStatus::Ok);
                assert_eq!(output, ".\nfile");
            }
            other => panic!("expected tool result, got {other:?}"),
        }
        assert_eq!(history[3].text(), "done");
        assert_eq!(h.soul.context().token_count(), 12);

        let events = drain(&mut h.events);
        let tool_calls: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, SoulEvent::ToolCall { .. }))
            .collect();
        let tool_results: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, SoulEvent::ToolResult { .. }))
            .collect();
        assert_eq!(tool_calls.len(), 1);
        assert_eq!(tool_results.len(), 1);
        assert!(matches!(
            tool_calls[0],
            SoulEvent::ToolCall { id, name, .. } if id == "t1" && name == "Ls"
        ));
        assert!(matches!(
            tool_results[0],
            SoulEvent::ToolResult { call_id, result } if call_id == "t1" && result.status == ToolStatus::Ok
        ));
        // StepBegin{1}, ToolCall, ToolResult, StepBegin{2}, ContentPart, StepEnd
        assert!(matches!(events[0], SoulEvent::StepBegin { step: 1 }));
        assert!(matches!(events[3], SoulEvent::StepBegin { step: 2 }));
        assert!(matches!(events.last(), Some(SoulEvent::StepEnd)));
    }

    #[tokio::test]
    async fn test_rejected_tool_continues_loop() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            vec![
                tool_call_chunk("t1", "Rm", r#"{"path":"main.rs"}"#),
                Ok(Chunk::Usage { tokens: 10 }),
                Ok(Chunk::Done),
            ],
            text_turn("understood, leaving it alone", 14),
        ]));

        let dir = tempfile::tempdir().unwrap();
        let wire = Wire::new();
        let approval = Arc::new(Approval::new(false, wire.clone()));

        // host that rejects everything
        let mut requests = approval.take_requests().unwrap();
        tokio::spawn(async move {
            while let Some(pending) = requests.recv().await {
                pending.resolve(ApprovalResponse::Reject);
            }
        });

        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(RmTool {
                approval: Arc::clone(&approval),
            }))
            .unwrap();

        let mut soul = Soul::new(
            SoulConfig::default(),
            Arc::new(Llm::new(provider, 200_000)),
            Context::new(dir.path().join("history.jsonl")),
            registry,
            approval,
            wire,
            DMailBox::new(),
            Arc::new(StubSummarizer),
        );

        let outcome = soul.run("delete main.rs").await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let history = soul.context().history();
        match &history[2].content[0] {
            ContentPart::ToolResult { status, .. } => assert_eq!(*status, ToolStatus::Rejected),
            other => panic!("expected tool result, got {other:?}"),
        }
        // the model saw the rejection and answered again
        assert_eq!(history[3].text(), "understood, leaving it alone");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_not_fatal() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            vec![
                tool_call_chunk("t1", "Nope", "{}"),
                Ok(Chunk::Usage { tokens: 5 }),
                Ok(Chunk::Done),
            ],
            text_turn("recovered", 8),
        ]));
        let mut h = harness(provider, ToolRegistry::new());

        let outcome = h.soul.run("go").await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let history = h.soul.context().history();
        match &history[2].content[0] {
            ContentPart::ToolResult {
                status,
                message,
                output,
                ..
            } => {
                assert_eq!(*status, ToolStatus::Error);
                assert_eq!(message, "unknown tool: Nope");
                assert_eq!(output, "");
            }
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_provider_error_leaves_user_message_only() {
        let mut h = harness(Arc::new(FailingProvider), ToolRegistry::new());
        let outcome = h.soul.run("hi").await.unwrap();
        assert!(
            matches!(outcome, RunOutcome::ProviderError { ref detail } if detail.contains("quota"))
        );
        assert_eq!(h.soul.context().history().len(), 1);
        assert_eq!(h.soul.context().history()[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_mid_stream_provider_error_appends_no_assistant() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![
            Ok(Chunk::TextDelta("par".into())),
            Err(psi_ai::Error::Api {
                error_type: "server_error".into(),
                message: "overloaded".into(),
            }),
        ]]));
        let mut h = harness(provider, ToolRegistry::new());

        let outcome = h.soul.run("hi").await.unwrap();
        assert!(matches!(outcome, RunOutcome::ProviderError { .. }));
        assert_eq!(h.soul.context().history().len(), 1);
    }

    #[tokio::test]
    async fn test_max_steps() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            vec![
                tool_call_chunk("t1", "Ls", "{}"),
                Ok(Chunk::Usage { tokens: 5 }),
                Ok(Chunk::Done),
            ],
            vec![
                tool_call_chunk("t2", "Ls", "{}"),
                Ok(Chunk::Usage { tokens: 6 }),
                Ok(Chunk::Done),
            ],
        ]));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(LsTool)).unwrap();
        let config = SoulConfig {
            max_steps_per_run: 2,
            ..Default::default()
        };
        let mut h = harness_with(provider, registry, config, DMailBox::new(), 200_000);

        let outcome = h.soul.run("loop forever").await.unwrap();
        assert_eq!(outcome, RunOutcome::MaxStepsReached);

        let events = drain(&mut h.events);
        assert!(matches!(events.last(), Some(SoulEvent::StepInterrupted)));
        // everything produced so far is retained
        assert_eq!(h.soul.context().history().len(), 5);
    }

    #[tokio::test]
    async fn test_cancellation_settles_announced_calls() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![
            tool_call_chunk("t1", "Boom", "{}"),
            Ok(Chunk::ToolCallDelta {
                index: 1,
                id: Some("t2".into()),
                name: Some("Ls".into()),
                arguments_delta: Some("{}".into()),
            }),
            Ok(Chunk::Usage { tokens: 9 }),
            Ok(Chunk::Done),
        ]]));

        let handle_slot = Arc::new(Mutex::new(None));
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(AbortingTool {
                handle: Arc::clone(&handle_slot),
            }))
            .unwrap();
        registry.register(Arc::new(LsTool)).unwrap();
        let mut h = harness(provider, registry);
        *handle_slot.lock() = Some(h.soul.handle());

        let outcome = h.soul.run("go").await.unwrap();
        assert_eq!(outcome, RunOutcome::Interrupted);

        // every announced call has a matching result
        let history = h.soul.context().history();
        let call_ids: Vec<&str> = history[1].tool_calls().iter().map(|c| c.0).collect();
        assert_eq!(call_ids, vec!["t1", "t2"]);
        let results = &history[2].content;
        assert_eq!(results.len(), 2);
        match &results[0] {
            ContentPart::ToolResult { call_id, status, .. } => {
                assert_eq!(call_id, "t1");
                assert_eq!(*status, ToolStatus::Ok);
            }
            other => panic!("expected tool result, got {other:?}"),
        }
        match &results[1] {
            ContentPart::ToolResult {
                call_id,
                status,
                message,
                ..
            } => {
                assert_eq!(call_id, "t2");
                assert_eq!(*status, ToolStatus::Error);
                assert_eq!(message, "interrupted");
            }
            other => panic!("expected tool result, got {other:?}"),
        }

        let events = drain(&mut h.events);
        assert!(matches!(events.last(), Some(SoulEvent::StepInterrupted)));
    }

    #[tokio::test]
    async fn test_dmail_rewinds_and_replaces() {
        let dmail = DMailBox::new();
        let provider = Arc::new(ScriptedProvider::new(vec![
            text_turn("first answer", 5),
            vec![
                tool_call_chunk(
                    "t1",
                    "send_dmail",
                    r#"{"checkpoint_id":0,"message":"redo with tests"}"#,
                ),
                Ok(Chunk::Usage { tokens: 8 }),
                Ok(Chunk::Done),
            ],
            text_turn("after rewind", 4),
        ]));
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(SendDMailTool::new(dmail.clone())))
            .unwrap();
        let mut h = harness_with(
            provider,
            registry,
            SoulConfig::default(),
            dmail,
            200_000,
        );

        assert_eq!(h.soul.run("first question").await.unwrap(), RunOutcome::Completed);
        assert_eq!(h.soul.context().checkpoint_count(), 1);

        assert_eq!(h.soul.run("second question").await.unwrap(), RunOutcome::Completed);

        let texts: Vec<String> = h
            .soul
            .context()
            .history()
            .iter()
            .map(|m| m.text())
            .collect();
        assert_eq!(
            texts,
            vec![
                "first question".to_string(),
                "first answer".to_string(),
                "redo with tests".to_string(),
                "after rewind".to_string(),
            ]
        );
        assert_eq!(h.soul.context().checkpoint_count(), 1);
        assert_eq!(h.soul.context().token_count(), 4);
    }

    #[tokio::test]
    async fn test_compaction_at_threshold() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            text_turn("first answer", 600),
            text_turn("after compaction", 50),
        ]));
        let config = SoulConfig {
            compaction: CompactionConfig {
                enabled: true,
                ratio: 0.5,
            },
            ..Default::default()
        };
        let mut h = harness_with(provider, ToolRegistry::new(), config, DMailBox::new(), 1000);

        assert_eq!(h.soul.run("first question").await.unwrap(), RunOutcome::Completed);
        assert_eq!(h.soul.context().token_count(), 600);
        drain(&mut h.events);

        assert_eq!(h.soul.run("second question").await.unwrap(), RunOutcome::Completed);

        let events = drain(&mut h.events);
        assert!(matches!(events[0], SoulEvent::CompactionBegin));
        assert!(matches!(events[1], SoulEvent::CompactionEnd));
        assert!(matches!(events[2], SoulEvent::StepBegin { step: 1 }));

        let history = h.soul.context().history();
        assert!(history[0].text().contains("<context-summary>"));
        assert!(history[0].text().contains("summarized history"));
        assert_eq!(history[1].text(), "second question");
        assert_eq!(history[2].text(), "after compaction");

        // the earliest checkpoint in the file is still id 0, directly at
        // the summary boundary
        let lines = file_lines(h.soul.context().path());
        assert!(lines[0].contains("context-summary"));
        let first_checkpoint = lines
            .iter()
            .position(|l| l.contains("_checkpoint"))
            .unwrap();
        assert_eq!(first_checkpoint, 1);
        assert!(lines[1].contains(r#""id":0"#));
    }

    #[tokio::test]
    async fn test_failed_compaction_does_not_refire_each_step() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            text_turn("first answer", 600),
            vec![
                tool_call_chunk("t1", "Ls", "{}"),
                Ok(Chunk::Usage { tokens: 600 }),
                Ok(Chunk::Done),
            ],
            text_turn("still going", 600),
        ]));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(LsTool)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let wire = Wire::new();
        let mut events = wire.subscribe();
        let mut soul = Soul::new(
            SoulConfig {
                compaction: CompactionConfig {
                    enabled: true,
                    ratio: 0.5,
                },
                ..Default::default()
            },
            Arc::new(Llm::new(provider, 1000)),
            Context::new(dir.path().join("history.jsonl")),
            registry,
            Arc::new(Approval::new(true, wire.clone())),
            wire,
            DMailBox::new(),
            Arc::new(FailingSummarizer),
        );

        assert_eq!(soul.run("first question").await.unwrap(), RunOutcome::Completed);
        drain(&mut events);

        // run 2 spans two steps above the threshold; the failed attempt
        // runs once and is not retried while the token count is unchanged
        assert_eq!(soul.run("second question").await.unwrap(), RunOutcome::Completed);
        let compaction_begins = drain(&mut events)
            .iter()
            .filter(|e| matches!(e, SoulEvent::CompactionBegin))
            .count();
        assert_eq!(compaction_begins, 1);
        // nothing was summarized
        assert_eq!(soul.context().history()[0].text(), "first question");
    }

    #[tokio::test]
    async fn test_compaction_disabled_never_fires() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            text_turn("a", 600),
            text_turn("b", 700),
        ]));
        let config = SoulConfig {
            compaction: CompactionConfig {
                enabled: false,
                ratio: 0.5,
            },
            ..Default::default()
        };
        let mut h = harness_with(provider, ToolRegistry::new(), config, DMailBox::new(), 1000);

        h.soul.run("one").await.unwrap();
        h.soul.run("two").await.unwrap();

        let events = drain(&mut h.events);
        assert!(!events
            .iter()
            .any(|e| matches!(e, SoulEvent::CompactionBegin | SoulEvent::CompactionEnd)));
        assert_eq!(h.soul.context().history().len(), 4);
    }

    #[tokio::test]
    async fn test_restored_context_resumes_checkpoint_numbering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");

        {
            let provider = Arc::new(ScriptedProvider::new(vec![text_turn("first", 5)]));
            let wire = Wire::new();
            let mut soul = Soul::new(
                SoulConfig::default(),
                Arc::new(Llm::new(provider, 200_000)),
                Context::new(&path),
                ToolRegistry::new(),
                Arc::new(Approval::new(true, wire.clone())),
                wire,
                DMailBox::new(),
                Arc::new(StubSummarizer),
            );
            soul.run("hello").await.unwrap();
        }

        let mut context = Context::new(&path);
        assert!(context.restore().unwrap());
        let provider = Arc::new(ScriptedProvider::new(vec![text_turn("second", 9)]));
        let wire = Wire::new();
        let mut soul = Soul::new(
            SoulConfig::default(),
            Arc::new(Llm::new(provider, 200_000)),
            context,
            ToolRegistry::new(),
            Arc::new(Approval::new(true, wire.clone())),
            wire,
            DMailBox::new(),
            Arc::new(StubSummarizer),
        );
        soul.run("again").await.unwrap();

        assert_eq!(soul.context().history().len(), 4);
        assert_eq!(soul.context().checkpoint_count(), 2);
        assert_eq!(soul.context().token_count(), 9);
    }
}
