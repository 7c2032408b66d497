//! Function calling for the chat model.
//!
//! A tenant's tools are the raw definitions in its `functions` document plus
//! one definition per entry of its `ext-tools` document. Calls to the task
//! tools are served from the tasks table; any other name is looked up among
//! the external HTTP tools.

use std::time::Duration;

use reqwest::{Client as HttpClient, Method};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::models::{field_text, now_iso, Task, TaskChanges};
use crate::openai::{ChatMessage, ChatModel, ChatRequest};
use crate::repo::TaskRepo;
use crate::store::{PutMode, UpdateMode};
use crate::Result;

/// Upper bound on model round trips per chat turn.
pub const MAX_TOOL_ROUNDS: usize = 4;

const DEFAULT_EXT_TIMEOUT_SECS: u64 = 10;

/// An HTTP endpoint exposed to the model as a function.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtTool {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: Option<Map<String, Value>>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub timeout: Option<Value>,
}

/// A fully rendered external call.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedCall {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Duration,
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace every `{{arg}}` placeholder with the argument's value.
pub fn render_template(template: &str, args: &Map<String, Value>) -> String {
    args.iter().fold(template.to_string(), |out, (name, value)| {
        out.replace(&format!("{{{{{}}}}}", name), &as_text(value))
    })
}

impl ExtTool {
    /// The chat completions `function` tool wrapping this endpoint.
    pub fn definition(&self) -> Value {
        let parameters = self
            .parameters
            .clone()
            .filter(|p| !p.is_null())
            .unwrap_or_else(|| json!({"type": "object", "properties": {}, "additionalProperties": true}));
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description.clone().unwrap_or_default(),
                "parameters": parameters,
            }
        })
    }

    fn timeout(&self) -> Duration {
        let secs = match &self.timeout {
            Some(Value::Number(n)) => n.as_f64().map(|f| f as u64),
            Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
            _ => None,
        };
        Duration::from_secs(secs.filter(|s| *s > 0).unwrap_or(DEFAULT_EXT_TIMEOUT_SECS))
    }

    /// Render the request for the given call arguments.
    pub fn prepare(&self, args: &Map<String, Value>) -> std::result::Result<PreparedCall, String> {
        let url = self.url.as_deref().unwrap_or_default();
        if url.is_empty() {
            return Err("url required".to_string());
        }

        let method_name = self
            .method
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or("GET")
            .trim()
            .to_ascii_uppercase();
        let method = Method::from_bytes(method_name.as_bytes()).map_err(|e| e.to_string())?;

        let mut headers: Vec<(String, String)> = self
            .headers
            .iter()
            .flatten()
            .map(|(name, value)| (name.clone(), render_template(&as_text(value), args)))
            .collect();

        let body = match &self.body {
            Some(template) if method != Method::GET && !template.is_null() => {
                let rendered = render_template(&as_text(template), args);
                let is_json = serde_json::from_str::<Value>(&rendered).is_ok();
                if is_json && !headers.iter().any(|(name, _)| name.eq_ignore_ascii_case("content-type")) {
                    headers.push(("Content-Type".to_string(), "application/json".to_string()));
                }
                Some(rendered)
            }
            _ => None,
        };

        Ok(PreparedCall {
            method,
            url: render_template(url, args),
            headers,
            body,
            timeout: self.timeout(),
        })
    }
}

/// Entries of an `ext-tools` document that carry a name.
pub fn parse_ext_tools(document: &Value) -> Vec<ExtTool> {
    document
        .get("ext_tools")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| serde_json::from_value::<ExtTool>(entry.clone()).ok())
                .filter(|tool| !tool.name.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Tool definitions sent to the model.
pub fn compile_definitions(func_config: &Value, ext_tools: &[ExtTool]) -> Vec<Value> {
    let mut definitions: Vec<Value> = func_config
        .get("tools")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    definitions.extend(ext_tools.iter().map(ExtTool::definition));
    definitions
}

/// Tools available to one tenant during a chat turn.
pub struct Toolbox {
    client_id: String,
    tasks: TaskRepo,
    http: HttpClient,
    ext_tools: Vec<ExtTool>,
    definitions: Vec<Value>,
}

impl Toolbox {
    pub fn new(
        client_id: impl Into<String>,
        tasks: TaskRepo,
        http: HttpClient,
        func_config: &Value,
        ext_config: &Value,
    ) -> Self {
        let ext_tools = parse_ext_tools(ext_config);
        let definitions = compile_definitions(func_config, &ext_tools);
        Self {
            client_id: client_id.into(),
            tasks,
            http,
            ext_tools,
            definitions,
        }
    }

    pub fn definitions(&self) -> &[Value] {
        &self.definitions
    }

    /// Run one tool call. Failures become an `error` field in the result.
    pub async fn call(&self, name: &str, arguments: &str) -> Value {
        let args = match serde_json::from_str::<Value>(if arguments.trim().is_empty() { "{}" } else { arguments }) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        debug!(tool = name, "Running tool");

        let result = match name {
            "list_tasks" => self.list_tasks().await,
            "create_task" => self.create_task(&args).await,
            "get_task" => self.get_task(&args).await,
            "update_task" => self.update_task(&args).await,
            "delete_task" => self.delete_task(&args).await,
            _ => return self.call_ext(name, &args).await,
        };
        result.unwrap_or_else(|e| json!({"error": e.to_string()}))
    }

    async fn list_tasks(&self) -> Result<Value> {
        let tasks = self.tasks.list(&self.client_id, 200).await?;
        Ok(json!({"items": tasks}))
    }

    async fn create_task(&self, args: &Map<String, Value>) -> Result<Value> {
        let Some(name) = task_name(args) else {
            return Ok(json!({"error": "name is required"}));
        };
        let text = |names: &[&str]| field_text(args, names).unwrap_or_default();
        let now = now_iso();
        let task = Task {
            client_id: self.client_id.clone(),
            name,
            phone_number: text(&["phone_number", "phone"]),
            address: text(&["address"]),
            request: text(&["request", "requirement"]),
            start_datetime: text(&["start_datetime", "start_date"]),
            created_at: now.clone(),
            updated_at: now,
        };
        self.tasks.put(&task, PutMode::Overwrite).await?;
        Ok(json!({"item": task}))
    }

    async fn get_task(&self, args: &Map<String, Value>) -> Result<Value> {
        let Some(name) = task_name(args) else {
            return Ok(json!({"error": "name is required"}));
        };
        Ok(match self.tasks.get(&self.client_id, &name).await? {
            Some(task) => json!({"item": task}),
            None => json!({"error": "not found"}),
        })
    }

    async fn update_task(&self, args: &Map<String, Value>) -> Result<Value> {
        let Some(name) = task_name(args) else {
            return Ok(json!({"error": "name is required"}));
        };
        let changes = TaskChanges::from_fields(args);
        if changes.is_empty() {
            return Ok(json!({"error": "nothing to update"}));
        }
        let task = self
            .tasks
            .update(&self.client_id, &name, changes, UpdateMode::Upsert)
            .await?;
        Ok(json!({"item": task}))
    }

    async fn delete_task(&self, args: &Map<String, Value>) -> Result<Value> {
        let Some(name) = task_name(args) else {
            return Ok(json!({"error": "name is required"}));
        };
        self.tasks.delete(&self.client_id, &name, false).await?;
        Ok(json!({"ok": true}))
    }

    async fn call_ext(&self, name: &str, args: &Map<String, Value>) -> Value {
        let Some(tool) = self.ext_tools.iter().find(|t| t.name == name) else {
            return json!({"ok": false, "error": format!("ext tool not found: {}", name)});
        };
        let call = match tool.prepare(args) {
            Ok(call) => call,
            Err(e) => return json!({"ok": false, "error": e}),
        };

        info!(tool = name, method = %call.method, "Calling external tool");
        let mut request = self.http.request(call.method, &call.url).timeout(call.timeout);
        for (header, value) in call.headers {
            request = request.header(header, value);
        }
        if let Some(body) = call.body {
            request = request.body(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(tool = name, "External tool failed: {}", e);
                return json!({"ok": false, "error": e.to_string()});
            }
        };
        let status = response.status();
        match response.text().await {
            Ok(text) => {
                let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
                json!({"ok": status.is_success(), "status": status.as_u16(), "body": body})
            }
            Err(e) => json!({"ok": false, "error": e.to_string()}),
        }
    }
}

fn task_name(args: &Map<String, Value>) -> Option<String> {
    field_text(args, &["name"]).filter(|n| !n.is_empty())
}

/// Run a chat turn, resolving tool calls for up to [`MAX_TOOL_ROUNDS`] rounds.
///
/// Returns `Ok(None)` when the model produced no usable text.
pub async fn run_chat(model: &dyn ChatModel, request: ChatRequest, toolbox: &Toolbox) -> Result<Option<String>> {
    let non_empty = |content: Option<String>| content.filter(|c| !c.trim().is_empty());

    if toolbox.definitions().is_empty() {
        let completion = model.complete(&request).await?;
        return Ok(non_empty(completion.first_message().and_then(|m| m.content)));
    }

    let mut request = request.with_tools(toolbox.definitions().to_vec());
    for round in 0..MAX_TOOL_ROUNDS {
        let Some(message) = model.complete(&request).await?.first_message() else {
            return Ok(None);
        };

        let tool_calls = message.tool_calls.unwrap_or_default();
        if tool_calls.is_empty() {
            return Ok(non_empty(message.content));
        }

        info!(round, calls = tool_calls.len(), "Model requested tools");
        request
            .messages
            .push(ChatMessage::assistant_tool_calls(message.content, tool_calls.clone()));
        for call in tool_calls {
            let result = toolbox.call(&call.function.name, &call.function.arguments).await;
            request
                .messages
                .push(ChatMessage::tool_result(call.id, &call.function.name, result.to_string()));
        }
    }

    warn!("Tool rounds exhausted without a reply");
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::{ChatCompletion, FunctionCall, ToolCall};
    use crate::repo::tasks_schema;
    use crate::store::MemoryTable;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Replays canned assistant messages and records requests.
    struct ScriptedModel {
        replies: Mutex<Vec<ChatMessage>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedModel {
        fn new(mut replies: Vec<ChatMessage>) -> Self {
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion> {
            self.requests.lock().unwrap().push(request.clone());
            let message = self.replies.lock().unwrap().pop();
            let choices = message.map(|m| json!([{"message": m}])).unwrap_or(json!([]));
            Ok(serde_json::from_value(json!({"choices": choices})).unwrap())
        }
    }

    fn tool_call(name: &str, arguments: Value) -> ChatMessage {
        ChatMessage::assistant_tool_calls(
            None,
            vec![ToolCall {
                id: Some(format!("call_{}", name)),
                kind: "function".into(),
                function: FunctionCall {
                    name: name.into(),
                    arguments: arguments.to_string(),
                },
            }],
        )
    }

    fn toolbox(repo: TaskRepo, func_config: Value) -> Toolbox {
        Toolbox::new("acme", repo, HttpClient::new(), &func_config, &json!({"ext_tools": []}))
    }

    fn task_repo() -> TaskRepo {
        TaskRepo::new(Arc::new(MemoryTable::new(tasks_schema("tasks"))))
    }

    #[test]
    fn test_render_template() {
        let args = json!({"city": "京都", "days": 3});
        assert_eq!(
            render_template("/weather?city={{city}}&d={{days}}&x={{missing}}", args.as_object().unwrap()),
            "/weather?city=京都&d=3&x={{missing}}"
        );
    }

    #[test]
    fn test_compile_definitions() {
        let ext = parse_ext_tools(&json!({
            "ext_tools": [
                {"name": "weather", "url": "https://example.com"},
                {"description": "no name"},
                "not an object"
            ]
        }));
        assert_eq!(ext.len(), 1);

        let definitions = compile_definitions(&json!({"tools": [{"type": "function", "function": {"name": "list_tasks"}}]}), &ext);
        assert_eq!(definitions.len(), 2);
        assert_eq!(definitions[1]["function"]["name"], "weather");
        assert_eq!(definitions[1]["function"]["parameters"]["additionalProperties"], true);
        assert!(compile_definitions(&json!({}), &[]).is_empty());
    }

    #[test]
    fn test_prepare_post_sets_json_content_type() {
        let tool: ExtTool = serde_json::from_value(json!({
            "name": "book",
            "method": "post",
            "url": "https://api.example.com/book/{{id}}",
            "headers": {"X-Key": "k-{{id}}"},
            "body": "{\"when\":\"{{when}}\"}",
            "timeout": "3"
        }))
        .unwrap();
        let args = json!({"id": 7, "when": "明日"});
        let call = tool.prepare(args.as_object().unwrap()).unwrap();
        assert_eq!(call.method, Method::POST);
        assert_eq!(call.url, "https://api.example.com/book/7");
        assert_eq!(call.body.as_deref(), Some("{\"when\":\"明日\"}"));
        assert!(call.headers.contains(&("X-Key".to_string(), "k-7".to_string())));
        assert!(call.headers.contains(&("Content-Type".to_string(), "application/json".to_string())));
        assert_eq!(call.timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_prepare_get_drops_body_and_requires_url() {
        let tool = ExtTool {
            name: "lookup".into(),
            url: Some("https://example.com/q".into()),
            body: Some(json!("ignored")),
            ..Default::default()
        };
        let call = tool.prepare(&Map::new()).unwrap();
        assert_eq!(call.method, Method::GET);
        assert_eq!(call.body, None);
        assert_eq!(call.timeout, Duration::from_secs(10));

        let no_url = ExtTool {
            name: "broken".into(),
            ..Default::default()
        };
        assert_eq!(no_url.prepare(&Map::new()).unwrap_err(), "url required");
    }

    #[tokio::test]
    async fn test_builtin_task_tools() {
        let repo = task_repo();
        let tools = toolbox(repo.clone(), json!({}));

        let created = tools
            .call("create_task", r#"{"name":"剪定","requirement":"松の剪定","phone":"09012345678"}"#)
            .await;
        assert_eq!(created["item"]["request"], "松の剪定");
        assert_eq!(created["item"]["phone_number"], "09012345678");

        let updated = tools.call("update_task", r#"{"name":"剪定","address":"京都市"}"#).await;
        assert_eq!(updated["item"]["address"], "京都市");

        assert_eq!(tools.call("update_task", r#"{"name":"剪定"}"#).await["error"], "nothing to update");
        assert_eq!(tools.call("get_task", "{}").await["error"], "name is required");
        assert_eq!(tools.call("get_task", r#"{"name":"none"}"#).await["error"], "not found");
        assert_eq!(tools.call("list_tasks", "not json").await["items"].as_array().unwrap().len(), 1);
        assert_eq!(tools.call("delete_task", r#"{"name":"剪定"}"#).await["ok"], true);
        assert!(repo.get("acme", "剪定").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let tools = toolbox(task_repo(), json!({}));
        let result = tools.call("launch", "{}").await;
        assert_eq!(result["ok"], false);
        assert_eq!(result["error"], "ext tool not found: launch");
    }

    #[tokio::test]
    async fn test_run_chat_resolves_tool_calls() {
        let repo = task_repo();
        let tools = toolbox(repo.clone(), json!({"tools": [{"type": "function", "function": {"name": "create_task"}}]}));
        let model = ScriptedModel::new(vec![
            tool_call("create_task", json!({"name": "草刈り"})),
            ChatMessage::assistant("登録しました"),
        ]);

        let reply = run_chat(&model, ChatRequest::new("gpt-4o-mini", vec![ChatMessage::user("草刈りを予約")]), &tools)
            .await
            .unwrap();
        assert_eq!(reply.as_deref(), Some("登録しました"));
        assert!(repo.get("acme", "草刈り").await.unwrap().is_some());

        let requests = model.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        let last = &requests[1].messages;
        assert_eq!(last[last.len() - 1].role, "tool");
        assert_eq!(last[last.len() - 1].tool_call_id.as_deref(), Some("call_create_task"));
        assert_eq!(requests[1].tool_choice.as_deref(), Some("auto"));
    }

    #[tokio::test]
    async fn test_run_chat_gives_up_after_max_rounds() {
        let tools = toolbox(task_repo(), json!({"tools": [{"type": "function"}]}));
        let replies = (0..MAX_TOOL_ROUNDS + 1).map(|_| tool_call("list_tasks", json!({}))).collect();
        let model = ScriptedModel::new(replies);

        let reply = run_chat(&model, ChatRequest::new("m", vec![]), &tools).await.unwrap();
        assert_eq!(reply, None);
        assert_eq!(model.requests.lock().unwrap().len(), MAX_TOOL_ROUNDS);
    }

    #[tokio::test]
    async fn test_run_chat_without_tools() {
        let tools = toolbox(task_repo(), json!({}));
        let model = ScriptedModel::new(vec![ChatMessage::assistant("こんにちは")]);
        let reply = run_chat(&model, ChatRequest::new("m", vec![]), &tools).await.unwrap();
        assert_eq!(reply.as_deref(), Some("こんにちは"));
        assert!(model.requests.lock().unwrap()[0].tools.is_none());

        let silent = ScriptedModel::new(vec![]);
        assert_eq!(run_chat(&silent, ChatRequest::new("m", vec![]), &tools).await.unwrap(), None);
    }
}
