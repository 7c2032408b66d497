//! Chat Lambda - answers one caller utterance with the tenant's assistant.
//!
//! Endpoints:
//! - POST /chat - Run a conversation turn
//! - GET /prompt, PUT /prompt - System prompt (markdown)
//! - GET /func-config, PUT /func-config - Function calling configuration
//! - GET /ext-tools, PUT /ext-tools - External HTTP tools
//! - GET /chat-logs - Recent log events of this Lambda

use std::sync::Arc;

use chrono::Utc;
use lambda_http::{Body, Error, Request, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use shared::http::{self, query_param};
use shared::logs::{CloudWatchLogs, LogEventSource, LogWindow};
use shared::models::{now_iso, prompt_ids, CallLog, Faq};
use shared::openai::{ChatMessage, ChatModel, ChatRequest, LazyOpenAi};
use shared::repo::{call_logs_schema, faq_schema, prompts_schema, tasks_schema};
use shared::tools::{run_chat, Toolbox};
use shared::{
    normalize_phone, parse_body, resolve_tenant, CallLogRepo, Config, FaqRepo, PromptRepo, SettingsCredentials,
    TaskRepo,
};

use crate::{dynamo_table, load_aws_config, respond, route_of};

/// Reply used whenever the model cannot produce one.
pub const FALLBACK_REPLY: &str = "申し訳ありません。現在お手続きできません。少し時間をおいてお試しください。";

/// Messages of history kept in the prompt.
const HISTORY_MESSAGES: usize = 20;
/// Turns read when looking history up by caller.
const HISTORY_TURNS_BY_PHONE: usize = 50;
const FAQ_PAGE_SIZE: usize = 200;
const FAQ_MAX_PAGES: usize = 5;

/// Chat request
#[derive(Debug, Deserialize)]
struct ChatTurnRequest {
    phone_number: Option<String>,
    user_text: Option<String>,
    #[serde(alias = "callSid")]
    call_sid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromptRequest {
    content: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ConfigRequest {
    config: Option<Value>,
}

fn default_func_config() -> Value {
    json!({"tools": [], "instructions": ""})
}

fn default_ext_tools() -> Value {
    json!({"ext_tools": []})
}

/// Application state
pub struct AppState {
    pub default_client_id: String,
    pub chat_model: String,
    pub chat_log_group: String,
    pub calls: CallLogRepo,
    pub faqs: FaqRepo,
    pub prompts: PromptRepo,
    pub tasks: TaskRepo,
    pub model: Arc<dyn ChatModel>,
    pub log_events: Arc<dyn LogEventSource>,
    pub http: reqwest::Client,
}

impl AppState {
    pub async fn new() -> Result<Self, Error> {
        let config = Config::from_env()?;
        let sdk = load_aws_config().await;
        let http_client = reqwest::Client::new();

        let credentials = SettingsCredentials::new(
            Some(aws_sdk_secretsmanager::Client::new(&sdk)),
            config.openai.clone(),
        );
        let model = Arc::new(LazyOpenAi::new(http_client.clone(), Arc::new(credentials)));

        Ok(Self {
            default_client_id: config.default_client_id,
            chat_model: config.chat_model,
            chat_log_group: config.chat_log_group,
            calls: CallLogRepo::new(dynamo_table(&sdk, call_logs_schema(config.call_logs_table))),
            faqs: FaqRepo::new(dynamo_table(&sdk, faq_schema(config.faq_table))),
            prompts: PromptRepo::new(dynamo_table(&sdk, prompts_schema(config.prompts_table))),
            tasks: TaskRepo::new(dynamo_table(&sdk, tasks_schema(config.tasks_table))),
            model,
            log_events: Arc::new(CloudWatchLogs::new(aws_sdk_cloudwatchlogs::Client::new(&sdk))),
            http: http_client,
        })
    }
}

pub async fn handler(state: Arc<AppState>, event: Request) -> Result<Response<Body>, Error> {
    Ok(respond(route(&state, &event).await))
}

async fn route(state: &AppState, event: &Request) -> shared::Result<Response<Body>> {
    let (method, path) = route_of(event);
    if method == "OPTIONS" {
        return http::ok_empty();
    }

    let client_id = resolve_tenant(event, &state.default_client_id).client_id;

    match (method.as_str(), path.as_str()) {
        ("POST", "/chat") => chat_turn(state, &client_id, event).await,
        ("GET", "/prompt") => {
            let content = state.prompts.system_prompt(&client_id).await?;
            http::ok(json!({ "id": prompt_ids::SYSTEM, "content": content }))
        }
        ("PUT", "/prompt") => {
            let request: PromptRequest = parse_body!(event.body());
            let Some(Value::String(content)) = request.content.filter(|c| c.as_str().is_some_and(|s| !s.trim().is_empty())) else {
                return http::error_response(400, "content (markdown) required");
            };
            state.prompts.set_system_prompt(&client_id, &content).await?;
            http::ok_empty()
        }
        ("GET", "/func-config") => get_document(state, &client_id, prompt_ids::FUNCTIONS, default_func_config()).await,
        ("PUT", "/func-config") => put_document(state, &client_id, prompt_ids::FUNCTIONS, event).await,
        ("GET", "/ext-tools") => get_document(state, &client_id, prompt_ids::EXT_TOOLS, default_ext_tools()).await,
        ("PUT", "/ext-tools") => put_document(state, &client_id, prompt_ids::EXT_TOOLS, event).await,
        ("GET", "/chat-logs") => {
            let window = LogWindow::from_query(
                query_param(event, "limit"),
                query_param(event, "minutes"),
                query_param(event, "startTimeMs"),
                Utc::now().timestamp_millis(),
            );
            let items = state.log_events.events(&state.chat_log_group, window).await?;
            http::ok(json!({ "items": items }))
        }
        _ => http::not_found_route(),
    }
}

async fn get_document(state: &AppState, client_id: &str, id: &str, default: Value) -> shared::Result<Response<Body>> {
    let config = state.prompts.json_document(client_id, id).await?.unwrap_or(default);
    http::ok(json!({ "config": config }))
}

async fn put_document(state: &AppState, client_id: &str, id: &str, event: &Request) -> shared::Result<Response<Body>> {
    let request: ConfigRequest = parse_body!(event.body());
    let Some(config) = request.config.filter(Value::is_object) else {
        return http::error_response(400, "config (object) required");
    };
    state.prompts.set_json_document(client_id, id, config).await?;
    http::ok_empty()
}

/// The FAQ corpus as a JSON array of `{question, answer}`. An empty corpus is `[]`.
pub fn faq_corpus(faqs: &[Faq]) -> Option<String> {
    let entries: Vec<Value> = faqs
        .iter()
        .filter(|f| !f.question.is_empty() && !f.answer.is_empty())
        .map(|f| json!({ "question": f.question, "answer": f.answer }))
        .collect();
    serde_json::to_string(&entries).ok()
}

/// Alternating user/assistant messages of past turns, keeping the latest ones.
pub fn history_messages(logs: &[CallLog]) -> Vec<ChatMessage> {
    let mut history: Vec<ChatMessage> = logs
        .iter()
        .flat_map(|log| {
            let user = (!log.user_text.is_empty()).then(|| ChatMessage::user(log.user_text.clone()));
            let assistant = (!log.assistant_text.is_empty()).then(|| ChatMessage::assistant(log.assistant_text.clone()));
            user.into_iter().chain(assistant)
        })
        .collect();
    if history.len() > HISTORY_MESSAGES {
        history.drain(..history.len() - HISTORY_MESSAGES);
    }
    history
}

/// Prompt for one turn: system prompt, FAQ corpus, history, then the utterance.
pub fn build_messages(system_prompt: &str, faq_corpus: Option<&str>, history: Vec<ChatMessage>, user_text: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 3);
    if !system_prompt.is_empty() {
        messages.push(ChatMessage::system(system_prompt));
    }
    if let Some(corpus) = faq_corpus {
        messages.push(ChatMessage::system(format!("FAQ_KB\n{}", corpus)));
    }
    messages.extend(history);
    messages.push(ChatMessage::user(user_text));
    messages
}

async fn load_history(state: &AppState, client_id: &str, phone: &str, call_sid: Option<&str>) -> Vec<ChatMessage> {
    let logs = match call_sid {
        Some(call_sid) => state.calls.by_call_sid(client_id, call_sid, Some(1)).await.map(|mut logs| {
            logs.sort_by(|a, b| a.ts.cmp(&b.ts));
            logs
        }),
        None => state.calls.recent_for_phone(client_id, phone, HISTORY_TURNS_BY_PHONE).await,
    };
    match logs {
        Ok(logs) => history_messages(&logs),
        Err(e) => {
            warn!(client_id, "History unavailable: {}", e);
            Vec::new()
        }
    }
}

async fn chat_turn(state: &AppState, client_id: &str, event: &Request) -> shared::Result<Response<Body>> {
    let request: ChatTurnRequest = parse_body!(event.body());
    let phone = normalize_phone(request.phone_number.as_deref());
    let user_text = request.user_text.filter(|t| !t.is_empty());
    let (Some(phone), Some(user_text)) = (phone, user_text) else {
        return http::error_response(400, "phone_number and user_text required");
    };
    let call_sid = request.call_sid.filter(|s| !s.is_empty());

    let system_prompt = state.prompts.system_prompt(client_id).await.unwrap_or_else(|e| {
        warn!(client_id, "System prompt unavailable: {}", e);
        String::new()
    });
    let faqs = state
        .faqs
        .list_pages(client_id, FAQ_PAGE_SIZE, FAQ_MAX_PAGES)
        .await
        .unwrap_or_else(|e| {
            warn!(client_id, "FAQ corpus unavailable: {}", e);
            Vec::new()
        });
    let history = load_history(state, client_id, &phone, call_sid.as_deref()).await;

    info!(client_id, phone = %phone, history = history.len(), faqs = faqs.len(), "Running chat turn");
    let messages = build_messages(&system_prompt, faq_corpus(&faqs).as_deref(), history, &user_text);
    let reply = generate_reply(state, client_id, messages)
        .await
        .unwrap_or_else(|| FALLBACK_REPLY.to_string());

    let mut log = CallLog::new(client_id, &phone, &now_iso());
    log.user_text = user_text;
    log.assistant_text = reply.clone();
    log.call_sid = call_sid;
    if let Err(e) = state.calls.put(&log).await {
        warn!(client_id, "Failed to log chat turn: {}", e);
    }

    http::ok(json!({ "reply": reply }))
}

/// A tool configuration document; unreadable documents count as unset.
async fn tool_document(state: &AppState, client_id: &str, id: &str, default: Value) -> Value {
    match state.prompts.json_document(client_id, id).await {
        Ok(document) => document.unwrap_or(default),
        Err(e) => {
            warn!(client_id, id, "Tool configuration unavailable: {}", e);
            default
        }
    }
}

async fn generate_reply(state: &AppState, client_id: &str, messages: Vec<ChatMessage>) -> Option<String> {
    let func_config = tool_document(state, client_id, prompt_ids::FUNCTIONS, default_func_config()).await;
    let ext_config = tool_document(state, client_id, prompt_ids::EXT_TOOLS, default_ext_tools()).await;

    let toolbox = Toolbox::new(client_id, state.tasks.clone(), state.http.clone(), &func_config, &ext_config);
    let request = ChatRequest::new(&state.chat_model, messages);
    match run_chat(state.model.as_ref(), request, &toolbox).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!(client_id, "Chat completion failed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{json_of, request, TENANT};
    use async_trait::async_trait;
    use shared::logs::LogEvent;
    use shared::config::OpenAiSettings;
    use shared::openai::{ChatCompletion, FunctionCall, ToolCall};
    use shared::store::MemoryTable;
    use std::sync::Mutex;

    /// Replays canned assistant messages and records the requests it saw.
    #[derive(Default)]
    struct FakeModel {
        replies: Mutex<Vec<ChatMessage>>,
        seen: Mutex<Vec<ChatRequest>>,
        fail: bool,
    }

    impl FakeModel {
        fn replying(mut replies: Vec<ChatMessage>) -> Self {
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ChatModel for FakeModel {
        async fn complete(&self, request: &ChatRequest) -> shared::Result<ChatCompletion> {
            self.seen.lock().unwrap().push(request.clone());
            if self.fail {
                return Err(shared::Error::Upstream("OpenAI HTTP 429: rate limited".into()));
            }
            let reply = self.replies.lock().unwrap().pop().unwrap_or_else(|| ChatMessage::assistant(""));
            Ok(serde_json::from_value(json!({"choices": [{"message": reply}]})).unwrap())
        }
    }

    struct FakeLogs;

    #[async_trait]
    impl LogEventSource for FakeLogs {
        async fn events(&self, log_group: &str, window: LogWindow) -> shared::Result<Vec<LogEvent>> {
            Ok(vec![LogEvent {
                timestamp: Some(window.start_time_ms),
                ingestion_time: None,
                message: Some(format!("{} limit={}", log_group, window.limit)),
                log_stream_name: None,
                event_id: None,
            }])
        }
    }

    /// OpenAI with nothing in the environment and no secret to read.
    fn unconfigured_openai() -> Arc<dyn ChatModel> {
        let credentials = SettingsCredentials::new(None, OpenAiSettings::default());
        Arc::new(LazyOpenAi::new(reqwest::Client::new(), Arc::new(credentials)))
    }

    fn state(model: Option<Arc<FakeModel>>) -> AppState {
        AppState {
            default_client_id: "ueki".into(),
            chat_model: "gpt-4o-mini".into(),
            chat_log_group: "/aws/lambda/ueki-chat".into(),
            calls: CallLogRepo::new(Arc::new(MemoryTable::new(call_logs_schema("calls")))),
            faqs: FaqRepo::new(Arc::new(MemoryTable::new(faq_schema("faq")))),
            prompts: PromptRepo::new(Arc::new(MemoryTable::new(prompts_schema("prompts")))),
            tasks: TaskRepo::new(Arc::new(MemoryTable::new(tasks_schema("tasks")))),
            model: model.map_or_else(unconfigured_openai, |model| model as Arc<dyn ChatModel>),
            log_events: Arc::new(FakeLogs),
            http: reqwest::Client::new(),
        }
    }

    async fn call(state: &AppState, method: &str, uri: &str, query: &[(&str, &str)], body: Option<Value>) -> (u16, Value) {
        let response = respond(route(state, &request(method, uri, query, body)).await);
        (response.status().as_u16(), json_of(&response))
    }

    fn turn(phone: &str, ts: &str, user: &str, assistant: &str) -> CallLog {
        let mut log = CallLog::new(TENANT, phone, ts);
        log.user_text = user.into();
        log.assistant_text = assistant.into();
        log
    }

    #[test]
    fn test_history_keeps_latest_messages() {
        let logs: Vec<CallLog> = (0..15).map(|i| turn("0901", &format!("t{:02}", i), &format!("u{}", i), &format!("a{}", i))).collect();
        let history = history_messages(&logs);
        assert_eq!(history.len(), 20);
        assert_eq!(history[0].content.as_deref(), Some("u5"));
        assert_eq!(history[19].content.as_deref(), Some("a14"));

        let sparse = history_messages(&[turn("0901", "t", "", "only assistant")]);
        assert_eq!(sparse.len(), 1);
        assert_eq!(sparse[0].role, "assistant");
    }

    #[test]
    fn test_faq_corpus_skips_incomplete_entries() {
        let faq = |q: &str, a: &str| Faq {
            client_id: TENANT.into(),
            question: q.into(),
            answer: a.into(),
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert_eq!(faq_corpus(&[faq("q", "")]).as_deref(), Some("[]"));
        let corpus = faq_corpus(&[faq("料金は？", "見積もり無料です"), faq("", "a")]).unwrap();
        assert!(corpus.contains("見積もり無料です"), "non-ASCII must not be escaped: {}", corpus);
        let parsed: Value = serde_json::from_str(&corpus).unwrap();
        assert_eq!(parsed, json!([{"question": "料金は？", "answer": "見積もり無料です"}]));
    }

    #[test]
    fn test_build_messages_order() {
        let messages = build_messages("prompt", Some("[]"), vec![ChatMessage::assistant("前回")], "こんにちは");
        let roles: Vec<_> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "system", "assistant", "user"]);
        assert_eq!(messages[1].content.as_deref(), Some("FAQ_KB\n[]"));

        let bare = build_messages("", None, Vec::new(), "hi");
        assert_eq!(bare.len(), 1);
    }

    #[tokio::test]
    async fn test_chat_turn_builds_prompt_and_logs() {
        let model = Arc::new(FakeModel::replying(vec![ChatMessage::assistant("明日伺います")]));
        let state = state(Some(model.clone()));
        state.prompts.set_system_prompt(TENANT, "あなたは植木屋の受付です").await.unwrap();
        state.faqs.create(TENANT, "定休日は？", "日曜日です").await.unwrap();
        state.faqs.create("other", "secret", "hidden").await.unwrap();
        state.calls.put(&turn("09012345678", "2024-05-01T09:00:00+00:00", "剪定をお願いしたい", "承知しました")).await.unwrap();

        let (status, body) = call(&state, "POST", "/chat", &[], Some(json!({"phone_number": "+819012345678", "user_text": "いつ来られますか"}))).await;
        assert_eq!(status, 200);
        assert_eq!(body["reply"], "明日伺います");

        let seen = model.seen.lock().unwrap();
        let messages = &seen[0].messages;
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0].content.as_deref(), Some("あなたは植木屋の受付です"));
        let kb = messages[1].content.as_deref().unwrap();
        assert!(kb.starts_with("FAQ_KB\n") && kb.contains("定休日は？") && !kb.contains("secret"));
        assert_eq!(messages[2].content.as_deref(), Some("剪定をお願いしたい"));
        assert_eq!(messages[4].content.as_deref(), Some("いつ来られますか"));
        assert!(seen[0].tools.is_none());

        let logs = state.calls.recent_for_phone(TENANT, "09012345678", 50).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].assistant_text, "明日伺います");
    }

    #[tokio::test]
    async fn test_chat_history_by_call_sid() {
        let model = Arc::new(FakeModel::replying(vec![ChatMessage::assistant("ok")]));
        let state = state(Some(model.clone()));
        let mut earlier = turn("0901", "2024-05-01T09:00:00+00:00", "same call", "");
        earlier.call_sid = Some("CA1".into());
        state.calls.put(&earlier).await.unwrap();
        state.calls.put(&turn("0901", "2024-04-01T09:00:00+00:00", "other call", "")).await.unwrap();

        call(&state, "POST", "/chat", &[], Some(json!({"phone_number": "0901", "user_text": "hi", "callSid": "CA1"}))).await;

        let seen = model.seen.lock().unwrap();
        let contents: Vec<_> = seen[0].messages.iter().filter_map(|m| m.content.as_deref()).collect();
        assert_eq!(contents, vec!["FAQ_KB\n[]", "same call", "hi"]);

        let logged = state.calls.by_call_sid(TENANT, "CA1", None).await.unwrap();
        assert_eq!(logged.len(), 2);
    }

    #[tokio::test]
    async fn test_chat_falls_back_when_model_fails() {
        let failing = Arc::new(FakeModel {
            fail: true,
            ..Default::default()
        });
        let (status, body) = call(&state(Some(failing)), "POST", "/chat", &[], Some(json!({"phone_number": "0901", "user_text": "hi"}))).await;
        assert_eq!(status, 200);
        assert_eq!(body["reply"], FALLBACK_REPLY);

        let (_, body) = call(&state(None), "POST", "/chat", &[], Some(json!({"phone_number": "0901", "user_text": "hi"}))).await;
        assert_eq!(body["reply"], FALLBACK_REPLY);

        let (status, body) = call(&state(None), "POST", "/chat", &[], Some(json!({"phone_number": "0901"}))).await;
        assert_eq!((status, body["error"].as_str()), (400, Some("phone_number and user_text required")));
    }

    #[tokio::test]
    async fn test_chat_runs_configured_tools() {
        let model = Arc::new(FakeModel::replying(vec![
            ChatMessage::assistant_tool_calls(
                None,
                vec![ToolCall {
                    id: Some("call_1".into()),
                    kind: "function".into(),
                    function: FunctionCall {
                        name: "create_task".into(),
                        arguments: json!({"name": "剪定", "phone_number": "0901"}).to_string(),
                    },
                }],
            ),
            ChatMessage::assistant("予約しました"),
        ]));
        let state = state(Some(model.clone()));
        let (status, _) = call(
            &state,
            "PUT",
            "/func-config",
            &[],
            Some(json!({"config": {"tools": [{"type": "function", "function": {"name": "create_task", "parameters": {"type": "object"}}}]}})),
        )
        .await;
        assert_eq!(status, 200);

        let (_, body) = call(&state, "POST", "/chat", &[], Some(json!({"phone_number": "0901", "user_text": "予約したい"}))).await;
        assert_eq!(body["reply"], "予約しました");
        assert!(state.tasks.get(TENANT, "剪定").await.unwrap().is_some());
        assert_eq!(model.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_prompt_and_config_documents() {
        let state = state(None);
        let (_, body) = call(&state, "GET", "/prompt", &[], None).await;
        assert_eq!(body, json!({"ok": true, "id": "system", "content": ""}));

        let (status, body) = call(&state, "PUT", "/prompt", &[], Some(json!({"content": "   "}))).await;
        assert_eq!((status, body["error"].as_str()), (400, Some("content (markdown) required")));
        let (status, _) = call(&state, "PUT", "/prompt", &[], Some(json!({"content": 42}))).await;
        assert_eq!(status, 400);
        call(&state, "PUT", "/prompt", &[], Some(json!({"content": "# 受付"}))).await;
        let (_, body) = call(&state, "GET", "/prompt", &[], None).await;
        assert_eq!(body["content"], "# 受付");

        let (_, body) = call(&state, "GET", "/func-config", &[], None).await;
        assert_eq!(body["config"], json!({"tools": [], "instructions": ""}));
        let (_, body) = call(&state, "GET", "/ext-tools", &[], None).await;
        assert_eq!(body["config"], json!({"ext_tools": []}));

        let (status, body) = call(&state, "PUT", "/ext-tools", &[], Some(json!({"config": []}))).await;
        assert_eq!((status, body["error"].as_str()), (400, Some("config (object) required")));
        call(&state, "PUT", "/ext-tools", &[], Some(json!({"config": {"ext_tools": [{"name": "weather"}]}}))).await;
        let (_, body) = call(&state, "GET", "/ext-tools", &[], None).await;
        assert_eq!(body["config"]["ext_tools"][0]["name"], "weather");
    }

    #[tokio::test]
    async fn test_chat_logs_window() {
        let state = state(None);
        let (status, body) = call(&state, "GET", "/chat-logs", &[("limit", "999"), ("startTimeMs", "1700000000000")], None).await;
        assert_eq!(status, 200);
        assert_eq!(body["items"][0]["timestamp"], 1_700_000_000_000i64);
        assert_eq!(body["items"][0]["message"], "/aws/lambda/ueki-chat limit=200");
    }
}
