use std::sync::OnceLock;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

// ── Tool trait and registry ──────────────────────────────────────────────────

/// Category a tool belongs to, used for UI grouping and enablement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    Code,
    Filesystem,
    Web,
    Memory,
    Knowledge,
    Other,
}

impl ToolCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCategory::Code => "code",
            ToolCategory::Filesystem => "filesystem",
            ToolCategory::Web => "web",
            ToolCategory::Memory => "memory",
            ToolCategory::Knowledge => "knowledge",
            ToolCategory::Other => "other",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ToolCategory::Code => "Code Execution",
            ToolCategory::Filesystem => "Filesystem",
            ToolCategory::Web => "Web",
            ToolCategory::Memory => "Memory",
            ToolCategory::Knowledge => "Knowledge Base",
            ToolCategory::Other => "Other",
        }
    }
}

/// JSON schema type of a declared parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    StringArray,
}

impl ParamKind {
    fn schema(&self) -> Value {
        match self {
            ParamKind::String => json!({"type": "string"}),
            ParamKind::Integer => json!({"type": "integer"}),
            ParamKind::Number => json!({"type": "number"}),
            ParamKind::Boolean => json!({"type": "boolean"}),
            ParamKind::StringArray => json!({"type": "array", "items": {"type": "string"}}),
        }
    }
}

/// Describes a single parameter that a tool accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    pub description: String,
    pub kind: ParamKind,
    pub required: bool,
}

impl ToolParam {
    pub fn required(name: &str, description: &str) -> Self {
        Self { name: name.into(), description: description.into(), kind: ParamKind::String, required: true }
    }
    pub fn optional(name: &str, description: &str) -> Self {
        Self { name: name.into(), description: description.into(), kind: ParamKind::String, required: false }
    }
    pub fn kind(mut self, kind: ParamKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Static metadata about a tool, fed to the LLM so it can decide what to call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub category: ToolCategory,
    pub params: Vec<ToolParam>,
}

/// Trait implemented by every tool.  Arguments arrive as the parsed JSON
/// object from the model's tool call; output is always a string (errors
/// included — the engine folds failures into the output so the model can
/// observe and react).
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn run(&self, args: &Value) -> Result<String>;
}

/// Central registry for all available tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().find(|t| t.spec().name == name).map(|t| t.as_ref())
    }

    pub fn list_specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    /// Specs filtered to an agent's enabled subset.  `None` means all tools.
    pub fn enabled_specs(&self, enabled: Option<&[String]>) -> Vec<ToolSpec> {
        self.list_specs()
            .into_iter()
            .filter(|spec| match enabled {
                None => true,
                Some(names) => names.iter().any(|n| n == &spec.name),
            })
            .collect()
    }

    pub fn category_of(&self, tool_name: &str) -> ToolCategory {
        self.get(tool_name)
            .map(|t| t.spec().category)
            .unwrap_or(ToolCategory::Other)
    }
}

// ── OpenAI tools projection ──────────────────────────────────────────────────

/// Build the OpenAI-compatible `tools` JSON array from tool specs.
pub fn specs_to_openai_tools(specs: &[ToolSpec]) -> Value {
    let tools: Vec<Value> = specs
        .iter()
        .map(|spec| {
            let mut properties = serde_json::Map::new();
            let mut required = Vec::new();
            for param in &spec.params {
                let mut schema = param.kind.schema();
                schema["description"] = json!(param.description);
                properties.insert(param.name.clone(), schema);
                if param.required {
                    required.push(param.name.clone());
                }
            }
            json!({
                "type": "function",
                "function": {
                    "name": spec.name,
                    "description": spec.description,
                    "parameters": {
                        "type": "object",
                        "properties": properties,
                        "required": required,
                    }
                }
            })
        })
        .collect();
    json!(tools)
}

// ── Artifacts convention ─────────────────────────────────────────────────────

/// Marker appended by tools that produced downloadable files:
/// `[ARTIFACTS:url1,url2]`.
pub fn format_artifacts_marker(urls: &[String]) -> String {
    format!("[ARTIFACTS:{}]", urls.join(","))
}

fn artifacts_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[ARTIFACTS:([^\]]+)\]").expect("static artifacts pattern"))
}

/// Split a tool output into clean text and the artifact URLs, if any.
pub fn parse_artifacts(output: &str) -> (String, Vec<String>) {
    let Some(captures) = artifacts_regex().captures(output) else {
        return (output.to_string(), Vec::new());
    };
    let urls = captures[1].split(',').map(|s| s.trim().to_string()).collect();
    let clean = output.replace(&captures[0], "").trim().to_string();
    (clean, urls)
}

// ── Argument extraction helpers ──────────────────────────────────────────────

pub fn arg_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

pub fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    arg_str(args, key).ok_or_else(|| anyhow::anyhow!("missing required param: {key}"))
}

pub fn arg_usize(args: &Value, key: &str, default: usize) -> usize {
    args.get(key)
        .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .map(|v| v as usize)
        .unwrap_or(default)
}

pub fn arg_f64(args: &Value, key: &str, default: f64) -> f64 {
    args.get(key)
        .and_then(|v| v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .unwrap_or(default)
}

pub fn arg_string_list(args: &Value, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default()
}

// ── Built-in tools ───────────────────────────────────────────────────────────

pub mod builtins;
pub use builtins::{
    ListDirectoryTool, ReadFileTool, ReadWebsiteJsTool, ReadWebsiteTool, RunPythonCodeTool,
    SearchKnowledgeTool, WriteFileTool, register_memory_tools,
};

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod registry_tests {
    use super::*;

    /// Minimal dummy tool for testing the registry.
    struct DummyTool {
        name: String,
        category: ToolCategory,
    }

    #[async_trait]
    impl Tool for DummyTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: self.name.clone(),
                description: format!("Dummy tool: {}", self.name),
                category: self.category,
                params: vec![ToolParam::required("input", "test param")],
            }
        }
        async fn run(&self, _args: &Value) -> Result<String> {
            Ok(format!("ran {}", self.name))
        }
    }

    fn dummy(name: &str, category: ToolCategory) -> Box<DummyTool> {
        Box::new(DummyTool { name: name.into(), category })
    }

    #[test]
    fn empty_registry() {
        let reg = ToolRegistry::default();
        assert!(reg.list_specs().is_empty());
        assert!(reg.get("anything").is_none());
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::default();
        reg.register(dummy("alpha", ToolCategory::Other));
        reg.register(dummy("beta", ToolCategory::Web));

        assert!(reg.get("alpha").is_some());
        assert!(reg.get("beta").is_some());
        assert!(reg.get("gamma").is_none());
    }

    #[test]
    fn enabled_specs_filters_by_name() {
        let mut reg = ToolRegistry::default();
        reg.register(dummy("one", ToolCategory::Memory));
        reg.register(dummy("two", ToolCategory::Memory));
        reg.register(dummy("three", ToolCategory::Code));

        let all = reg.enabled_specs(None);
        assert_eq!(all.len(), 3);

        let subset = reg.enabled_specs(Some(&["one".to_string(), "three".to_string()]));
        let names: Vec<&str> = subset.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["one", "three"]);
    }

    #[test]
    fn category_of_unknown_is_other() {
        let mut reg = ToolRegistry::default();
        reg.register(dummy("known", ToolCategory::Knowledge));
        assert_eq!(reg.category_of("known"), ToolCategory::Knowledge);
        assert_eq!(reg.category_of("missing"), ToolCategory::Other);
    }

    #[tokio::test]
    async fn run_registered_tool() {
        let mut reg = ToolRegistry::default();
        reg.register(dummy("runner", ToolCategory::Other));
        let tool = reg.get("runner").unwrap();
        let output = tool.run(&json!({})).await.unwrap();
        assert_eq!(output, "ran runner");
    }
}

#[cfg(test)]
mod schema_tests {
    use super::*;

    #[test]
    fn openai_tools_projection_shape() {
        let specs = vec![ToolSpec {
            name: "add_fact".into(),
            description: "Add a fact about the user.".into(),
            category: ToolCategory::Memory,
            params: vec![
                ToolParam::required("content", "The fact text"),
                ToolParam::required("category", "Fact category"),
                ToolParam::optional("note", "Extra note"),
            ],
        }];
        let tools = specs_to_openai_tools(&specs);
        let function = &tools[0]["function"];
        assert_eq!(function["name"], "add_fact");
        assert_eq!(function["parameters"]["type"], "object");
        assert_eq!(function["parameters"]["required"], json!(["content", "category"]));
        assert_eq!(function["parameters"]["properties"]["content"]["type"], "string");
    }

    #[test]
    fn array_params_project_with_items() {
        let specs = vec![ToolSpec {
            name: "add_event".into(),
            description: "d".into(),
            category: ToolCategory::Memory,
            params: vec![
                ToolParam::required("participants", "People involved").kind(ParamKind::StringArray),
            ],
        }];
        let tools = specs_to_openai_tools(&specs);
        let prop = &tools[0]["function"]["parameters"]["properties"]["participants"];
        assert_eq!(prop["type"], "array");
        assert_eq!(prop["items"]["type"], "string");
    }

    #[test]
    fn artifacts_roundtrip() {
        let urls = vec![
            "http://localhost:8000/artifacts/ab12/chart.png".to_string(),
            "http://localhost:8000/artifacts/ab12/data.svg".to_string(),
        ];
        let output = format!("done plotting\n{}", format_artifacts_marker(&urls));
        let (clean, parsed) = parse_artifacts(&output);
        assert_eq!(clean, "done plotting");
        assert_eq!(parsed, urls);
    }

    #[test]
    fn output_without_marker_passes_through() {
        let (clean, urls) = parse_artifacts("plain output");
        assert_eq!(clean, "plain output");
        assert!(urls.is_empty());
    }

    #[test]
    fn arg_helpers_coerce_strings() {
        let args = json!({"limit": "7", "threshold": "0.5", "names": ["a", "b"]});
        assert_eq!(arg_usize(&args, "limit", 5), 7);
        assert_eq!(arg_f64(&args, "threshold", 0.7), 0.5);
        assert_eq!(arg_string_list(&args, "names"), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(arg_usize(&args, "missing", 5), 5);
    }
}
