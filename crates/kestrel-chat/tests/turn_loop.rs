//! End-to-end tests for the chat turn loop: a scripted backend drives the
//! coordinator through tool-call cycles, approvals, server-assisted
//! streams, cancellation, and failure paths.

use async_trait::async_trait;
use futures::stream::BoxStream;
use kestrel_auth::CredentialStore;
use kestrel_chat::{
    ApprovalChoice, ApprovalHandler, ApprovalPolicy, ChatCoordinator, ChatError, ChatMode,
    ToolGateway, ToolRouter, TurnConfig, TOOL_DENIED_MARKER, TURN_TRUNCATION_NOTICE,
};
use kestrel_mcp::{
    McpResult, RemoteServerInfo, ToolCallResult, ToolContent, ToolDescriptor, TransportKind,
};
use kestrel_provider::{
    FinishReason, GenerateOptions, LanguageModel, Message, ModelInfo, ProviderError,
    ProviderResult, Role, StreamEvent, Usage,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;

/// One scripted backend step.
enum Step {
    /// Yield these events in order (Err items become stream errors).
    Events(Vec<Result<StreamEvent, String>>),
    /// Emit an approval request, await the reply, then finish.
    ApprovalRoundtrip { tool_name: String },
    /// Emit partial content, then stall until cancelled.
    Hang,
}

/// Scripted language model: pops one step per invocation and records what
/// it was asked.
struct ScriptedBackend {
    model: ModelInfo,
    steps: Mutex<VecDeque<Step>>,
    /// Step replayed when the script runs out.
    default_step: Option<Vec<Result<StreamEvent, String>>>,
    /// Message lists received, one per invocation.
    requests: Mutex<Vec<Vec<Message>>>,
    /// Local tool names offered, one per invocation.
    offered_tools: Mutex<Vec<Vec<String>>>,
    /// Remote source ids declared, one per invocation.
    declared_sources: Mutex<Vec<Vec<String>>>,
}

impl ScriptedBackend {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            model: ModelInfo::new("scripted", 128_000, 8_192),
            steps: Mutex::new(steps.into()),
            default_step: None,
            requests: Mutex::new(Vec::new()),
            offered_tools: Mutex::new(Vec::new()),
            declared_sources: Mutex::new(Vec::new()),
        }
    }

    fn with_default_step(mut self, events: Vec<Result<StreamEvent, String>>) -> Self {
        self.default_step = Some(events);
        self
    }
}

fn finish() -> Result<StreamEvent, String> {
    Ok(StreamEvent::TurnComplete {
        usage: Usage::new(10, 5),
        finish_reason: FinishReason::EndTurn,
    })
}

fn tool_call(id: &str, name: &str, args: &str) -> Vec<Result<StreamEvent, String>> {
    vec![
        Ok(StreamEvent::ToolCallStart {
            id: id.to_string(),
            name: name.to_string(),
        }),
        Ok(StreamEvent::ToolCallDelta {
            id: id.to_string(),
            delta: args.to_string(),
        }),
        Ok(StreamEvent::ToolCallComplete {
            id: id.to_string(),
            name: name.to_string(),
            arguments: args.to_string(),
        }),
        Ok(StreamEvent::TurnComplete {
            usage: Usage::new(10, 5),
            finish_reason: FinishReason::ToolUse,
        }),
    ]
}

fn text_step(text: &str) -> Vec<Result<StreamEvent, String>> {
    vec![
        Ok(StreamEvent::ContentStart),
        Ok(StreamEvent::ContentDelta(text.to_string())),
        Ok(StreamEvent::ContentEnd),
        finish(),
    ]
}

#[async_trait]
impl LanguageModel for ScriptedBackend {
    async fn generate(
        &self,
        messages: Vec<Message>,
        mut options: GenerateOptions,
    ) -> ProviderResult<BoxStream<'static, ProviderResult<StreamEvent>>> {
        self.requests.lock().await.push(messages);
        self.offered_tools
            .lock()
            .await
            .push(options.tools.iter().map(|t| t.name.clone()).collect());
        self.declared_sources.lock().await.push(
            options
                .remote_tool_sources
                .iter()
                .map(|s| s.server_id.clone())
                .collect(),
        );

        let step = self
            .steps
            .lock()
            .await
            .pop_front()
            .or_else(|| self.default_step.clone().map(Step::Events))
            .expect("backend invoked beyond its script");

        match step {
            Step::Events(events) => {
                let mapped: Vec<ProviderResult<StreamEvent>> = events
                    .into_iter()
                    .map(|event| event.map_err(ProviderError::stream_protocol))
                    .collect();
                Ok(Box::pin(futures::stream::iter(mapped)))
            }
            Step::ApprovalRoundtrip { tool_name } => {
                let mut replies = options
                    .approval_replies
                    .take()
                    .expect("server-assisted options must carry a reply channel");
                Ok(Box::pin(async_stream::stream! {
                    yield Ok(StreamEvent::ApprovalRequest {
                        id: "appr_1".to_string(),
                        tool_name: tool_name.clone(),
                    });

                    let reply = replies.recv().await.expect("approval reply");
                    assert_eq!(reply.id, "appr_1");

                    if reply.approve {
                        yield Ok(StreamEvent::PreCalculatedToolResponse {
                            id: "srv_call_1".to_string(),
                            name: tool_name.clone(),
                            output: "server-side result".to_string(),
                            is_error: false,
                        });
                    }

                    yield Ok(StreamEvent::ContentDelta("all done".to_string()));
                    yield Ok(StreamEvent::TurnComplete {
                        usage: Usage::new(10, 5),
                        finish_reason: FinishReason::EndTurn,
                    });
                }))
            }
            Step::Hang => Ok(Box::pin(async_stream::stream! {
                yield Ok(StreamEvent::ContentDelta("partial".to_string()));
                futures::future::pending::<()>().await;
            })),
        }
    }

    fn model_info(&self) -> &ModelInfo {
        &self.model
    }

    fn backend_id(&self) -> &str {
        "scripted"
    }
}

/// In-memory tool router with canned results and a call log.
#[derive(Default)]
struct FakeRouter {
    catalog: Vec<ToolDescriptor>,
    kinds: HashMap<String, TransportKind>,
    remote: Vec<RemoteServerInfo>,
    results: HashMap<String, String>,
    calls: Mutex<Vec<String>>,
}

impl FakeRouter {
    fn with_tool(mut self, server_id: &str, name: &str, kind: TransportKind) -> Self {
        self.catalog.push(ToolDescriptor {
            name: name.to_string(),
            remote_name: name.to_string(),
            description: None,
            input_schema: None,
            server_id: server_id.to_string(),
        });
        self.kinds.insert(server_id.to_string(), kind);
        self
    }

    fn with_result(mut self, name: &str, output: &str) -> Self {
        self.results.insert(name.to_string(), output.to_string());
        self
    }
}

#[async_trait]
impl ToolRouter for FakeRouter {
    async fn find_tool(&self, name: &str) -> Option<ToolDescriptor> {
        self.catalog.iter().find(|t| t.name == name).cloned()
    }

    async fn tools(&self) -> Vec<ToolDescriptor> {
        self.catalog.clone()
    }

    async fn call_tool(&self, name: &str, _arguments: serde_json::Value) -> McpResult<ToolCallResult> {
        self.calls.lock().await.push(name.to_string());
        let output = self
            .results
            .get(name)
            .cloned()
            .unwrap_or_else(|| "ok".to_string());
        Ok(ToolCallResult {
            content: vec![ToolContent::Text { text: output }],
            is_error: false,
        })
    }

    async fn server_kind(&self, server_id: &str) -> Option<TransportKind> {
        self.kinds.get(server_id).copied()
    }

    async fn remote_servers(&self) -> Vec<RemoteServerInfo> {
        self.remote.clone()
    }
}

struct ApproveAll;

#[async_trait]
impl ApprovalHandler for ApproveAll {
    async fn decide(&self, _tool_name: &str) -> ApprovalChoice {
        ApprovalChoice::ApproveOnce
    }
}

/// Approves listed tools, denies the rest.
struct Selective(Vec<&'static str>);

#[async_trait]
impl ApprovalHandler for Selective {
    async fn decide(&self, tool_name: &str) -> ApprovalChoice {
        if self.0.iter().any(|t| *t == tool_name) {
            ApprovalChoice::ApproveAlways
        } else {
            ApprovalChoice::Deny
        }
    }
}

fn build_coordinator(
    backend: Arc<ScriptedBackend>,
    router: Arc<FakeRouter>,
    handler: Arc<dyn ApprovalHandler>,
    config: TurnConfig,
) -> (Arc<ChatCoordinator>, ApprovalPolicy, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(CredentialStore::with_path(dir.path().join("creds.json")));
    let policy = ApprovalPolicy::new(store);
    let gateway = Arc::new(ToolGateway::new(router, policy.clone(), handler));
    let coordinator = Arc::new(ChatCoordinator::new(backend, gateway, config));
    (coordinator, policy, dir)
}

/// The conversation invariant: every tool-role message answers exactly
/// one prior assistant tool call.
fn assert_tool_results_correlated(messages: &[Message]) {
    let mut open_calls: Vec<String> = Vec::new();
    for message in messages {
        for id in message.tool_call_ids() {
            open_calls.push(id.to_string());
        }
        for id in message.tool_result_ids() {
            let position = open_calls
                .iter()
                .position(|open| open == id)
                .unwrap_or_else(|| panic!("tool result {id} answers no open call"));
            open_calls.remove(position);
        }
    }
}

#[tokio::test]
async fn plain_text_turn() {
    let backend = Arc::new(ScriptedBackend::new(vec![Step::Events(text_step(
        "Hello there!",
    ))]));
    let router = Arc::new(FakeRouter::default());
    let (coordinator, _policy, _dir) = build_coordinator(
        backend.clone(),
        router,
        Arc::new(ApproveAll),
        TurnConfig::default(),
    );

    let outcome = coordinator.send_message("Hi", None).await.unwrap();

    assert_eq!(outcome.text, "Hello there!");
    assert!(!outcome.truncated);
    assert_eq!(outcome.usage.input_tokens, 10);

    let history = coordinator.history().await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[1].role, Role::Assistant);
}

#[tokio::test]
async fn tool_loop_feeds_results_back() {
    let backend = Arc::new(ScriptedBackend::new(vec![
        Step::Events(tool_call("call_1", "search", "{\"q\":\"rust\"}")),
        Step::Events(text_step("Found it.")),
    ]));
    let router = Arc::new(
        FakeRouter::default()
            .with_tool("files", "search", TransportKind::Stdio)
            .with_result("search", "3 matches"),
    );
    let (coordinator, _policy, _dir) = build_coordinator(
        backend.clone(),
        router.clone(),
        Arc::new(ApproveAll),
        TurnConfig::default(),
    );

    let outcome = coordinator.send_message("find rust", None).await.unwrap();
    assert_eq!(outcome.text, "Found it.");

    // The tool ran exactly once.
    assert_eq!(*router.calls.lock().await, vec!["search".to_string()]);

    // The second invocation saw the assistant tool call and its result.
    let requests = backend.requests.lock().await;
    assert_eq!(requests.len(), 2);
    let second = &requests[1];
    let assistant = second
        .iter()
        .find(|m| m.role == Role::Assistant)
        .expect("assistant message");
    assert_eq!(assistant.tool_call_ids(), vec!["call_1"]);
    let tool_msg = second
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("tool message");
    assert_eq!(tool_msg.tool_result_ids(), vec!["call_1"]);
    assert!(tool_msg.content.iter().any(|part| matches!(
        part,
        kestrel_provider::ContentPart::ToolResult { content, .. } if content == "3 matches"
    )));

    assert_tool_results_correlated(&coordinator.history().await);
}

#[tokio::test]
async fn mixed_approval_batch_yields_both_results() {
    // Two calls in one assistant step: one approved through the persisted
    // always-scope, one denied by the handler. Both must appear as tool
    // results before the next model invocation.
    let backend = Arc::new(ScriptedBackend::new(vec![
        Step::Events(
            [
                tool_call("call_safe", "search", "{}"),
                tool_call("call_danger", "delete_everything", "{}"),
            ]
            .concat()
            .into_iter()
            // Keep only one TurnComplete at the end.
            .filter(|e| {
                !matches!(
                    e,
                    Ok(StreamEvent::TurnComplete { .. })
                )
            })
            .chain(std::iter::once(finish()))
            .collect(),
        ),
        Step::Events(text_step("Continuing.")),
    ]));
    let router = Arc::new(
        FakeRouter::default()
            .with_tool("files", "search", TransportKind::Stdio)
            .with_tool("files", "delete_everything", TransportKind::Stdio)
            .with_result("search", "safe result"),
    );
    let (coordinator, policy, _dir) = build_coordinator(
        backend.clone(),
        router.clone(),
        Arc::new(Selective(vec![])),
        TurnConfig::default(),
    );
    policy.remember_always("search").await;

    let outcome = coordinator.send_message("go", None).await.unwrap();
    assert_eq!(outcome.text, "Continuing.");

    // Only the approved tool reached a transport.
    assert_eq!(*router.calls.lock().await, vec!["search".to_string()]);

    // Both results preceded the second invocation, denial marked.
    let requests = backend.requests.lock().await;
    let second = &requests[1];
    let tool_messages: Vec<&Message> =
        second.iter().filter(|m| m.role == Role::Tool).collect();
    assert_eq!(tool_messages.len(), 2);
    assert_eq!(tool_messages[0].tool_result_ids(), vec!["call_safe"]);
    assert_eq!(tool_messages[1].tool_result_ids(), vec!["call_danger"]);
    assert!(tool_messages[1].text().is_empty()); // denial text is in the result part
    let denial = match &tool_messages[1].content[0] {
        kestrel_provider::ContentPart::ToolResult { content, is_error, .. } => {
            assert_eq!(*is_error, Some(true));
            content.clone()
        }
        other => panic!("Expected tool result, got {other:?}"),
    };
    assert!(denial.contains(TOOL_DENIED_MARKER));

    assert_tool_results_correlated(&coordinator.history().await);
}

#[tokio::test]
async fn iteration_cap_truncates_turn() {
    // The backend asks for a tool on every step; the cap must end the
    // turn with a notice, not an error.
    let backend = Arc::new(
        ScriptedBackend::new(vec![])
            .with_default_step(tool_call("call_again", "search", "{}")),
    );
    let router = Arc::new(
        FakeRouter::default()
            .with_tool("files", "search", TransportKind::Stdio)
            .with_result("search", "more"),
    );
    let config = TurnConfig {
        max_steps: 3,
        ..Default::default()
    };
    let (coordinator, _policy, _dir) =
        build_coordinator(backend.clone(), router, Arc::new(ApproveAll), config);

    let outcome = coordinator.send_message("loop forever", None).await.unwrap();

    assert!(outcome.truncated);
    let last = outcome.messages.last().unwrap();
    assert_eq!(last.text(), TURN_TRUNCATION_NOTICE);
    assert_eq!(backend.requests.lock().await.len(), 3);
}

#[tokio::test]
async fn single_flight_and_abort() {
    let backend = Arc::new(ScriptedBackend::new(vec![Step::Hang]));
    let router = Arc::new(FakeRouter::default());
    let (coordinator, _policy, _dir) = build_coordinator(
        backend,
        router,
        Arc::new(ApproveAll),
        TurnConfig::default(),
    );

    let running = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.send_message("first", None).await })
    };

    // Wait until the turn is visibly in flight.
    for _ in 0..100 {
        if coordinator.is_busy() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert!(coordinator.is_busy());

    // A second message is refused while the turn runs.
    let second = coordinator.send_message("second", None).await;
    assert!(matches!(second, Err(ChatError::TurnInProgress)));

    // Aborting stops the stream read and fails the turn as cancelled.
    coordinator.abort();
    let result = running.await.unwrap();
    assert!(matches!(result, Err(ChatError::Cancelled)));
    assert!(!coordinator.is_busy());

    // Partial content survived.
    let history = coordinator.history().await;
    let assistant = history.iter().find(|m| m.role == Role::Assistant).unwrap();
    assert_eq!(assistant.text(), "partial");

    // And the conversation accepts a new message afterwards.
    assert!(!coordinator.is_busy());
}

#[tokio::test]
async fn server_assisted_consumes_precalculated_responses() {
    let backend = Arc::new(ScriptedBackend::new(vec![Step::ApprovalRoundtrip {
        tool_name: "deploy".to_string(),
    }]));
    let router = Arc::new(
        FakeRouter::default()
            .with_tool("local", "read_file", TransportKind::Stdio)
            .with_tool("remote-docs", "deploy", TransportKind::Sse),
    );
    let config = TurnConfig {
        mode: ChatMode::ServerAssisted,
        ..Default::default()
    };
    let (coordinator, policy, _dir) = build_coordinator(
        backend.clone(),
        router.clone(),
        Arc::new(ApproveAll),
        config,
    );
    policy.remember_always("deploy").await;

    let outcome = coordinator.send_message("ship it", None).await.unwrap();
    assert_eq!(outcome.text, "all done");

    // Nothing was executed locally.
    assert!(router.calls.lock().await.is_empty());

    // The pre-calculated response landed as a correlated tool result.
    let history = coordinator.history().await;
    assert_tool_results_correlated(&history);
    let tool_msg = history.iter().find(|m| m.role == Role::Tool).unwrap();
    assert_eq!(tool_msg.tool_result_ids(), vec!["srv_call_1"]);

    // Server-assisted mode offered only the stdio-local tool.
    let offered = backend.offered_tools.lock().await;
    assert_eq!(offered[0], vec!["read_file".to_string()]);
}

#[tokio::test]
async fn server_assisted_declares_remote_sources() {
    let backend = Arc::new(ScriptedBackend::new(vec![Step::Events(text_step("ok"))]));
    let mut router = FakeRouter::default();
    router.remote.push(RemoteServerInfo {
        server_id: "remote-docs".to_string(),
        url: "https://mcp.example.com/sse".to_string(),
        auth_token: Some("tok".to_string()),
    });
    let config = TurnConfig {
        mode: ChatMode::ServerAssisted,
        ..Default::default()
    };
    let (coordinator, _policy, _dir) = build_coordinator(
        backend.clone(),
        Arc::new(router),
        Arc::new(ApproveAll),
        config,
    );

    coordinator.send_message("hello", None).await.unwrap();

    let declared = backend.declared_sources.lock().await;
    assert_eq!(declared[0], vec!["remote-docs".to_string()]);
}

#[tokio::test]
async fn client_mode_declares_no_remote_sources() {
    let backend = Arc::new(ScriptedBackend::new(vec![Step::Events(text_step("ok"))]));
    let mut router = FakeRouter::default();
    router.remote.push(RemoteServerInfo {
        server_id: "remote-docs".to_string(),
        url: "https://mcp.example.com/sse".to_string(),
        auth_token: None,
    });
    let (coordinator, _policy, _dir) = build_coordinator(
        backend.clone(),
        Arc::new(router),
        Arc::new(ApproveAll),
        TurnConfig::default(),
    );

    coordinator.send_message("hello", None).await.unwrap();

    let declared = backend.declared_sources.lock().await;
    assert!(declared[0].is_empty());
}

#[tokio::test]
async fn stream_protocol_error_preserves_partial_content() {
    let backend = Arc::new(ScriptedBackend::new(vec![Step::Events(vec![
        Ok(StreamEvent::ContentDelta("partial answer".to_string())),
        Err("unexpected frame".to_string()),
    ])]));
    let router = Arc::new(FakeRouter::default());
    let (coordinator, _policy, _dir) = build_coordinator(
        backend,
        router,
        Arc::new(ApproveAll),
        TurnConfig::default(),
    );

    let result = coordinator.send_message("hi", None).await;
    assert!(matches!(result, Err(ChatError::StreamProtocol(_))));

    // The partial assistant content is preserved in the history.
    let history = coordinator.history().await;
    let assistant = history.iter().find(|m| m.role == Role::Assistant).unwrap();
    assert_eq!(assistant.text(), "partial answer");
}

#[tokio::test]
async fn unknown_tool_mid_turn_becomes_tool_error() {
    // The model calls a tool whose server vanished: the loop continues
    // and the model gets a tool-error message.
    let backend = Arc::new(ScriptedBackend::new(vec![
        Step::Events(tool_call("call_1", "vanished", "{}")),
        Step::Events(text_step("I see the tool is gone.")),
    ]));
    let router = Arc::new(FakeRouter::default());
    let (coordinator, _policy, _dir) = build_coordinator(
        backend.clone(),
        router,
        Arc::new(ApproveAll),
        TurnConfig::default(),
    );

    let outcome = coordinator.send_message("use it", None).await.unwrap();
    assert_eq!(outcome.text, "I see the tool is gone.");

    let requests = backend.requests.lock().await;
    let second = &requests[1];
    let tool_msg = second.iter().find(|m| m.role == Role::Tool).unwrap();
    match &tool_msg.content[0] {
        kestrel_provider::ContentPart::ToolResult { content, is_error, .. } => {
            assert_eq!(*is_error, Some(true));
            assert!(content.contains("Unknown tool"));
        }
        other => panic!("Expected tool result, got {other:?}"),
    }
}
