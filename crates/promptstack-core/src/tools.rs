//! Tools that act on a project's sandbox.

use crate::browser::PageChecker;
use crate::diff::StreamingDiffApplier;
use crate::lifecycle::SandboxLifecycle;
use async_trait::async_trait;
use promptstack_tools::navigate::normalize_path;
use promptstack_tools::{
    parse_args, Tool, ToolContext, ToolError, ToolEvent, ToolOutput, ToolRegistry, ToolResult,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const EMPTY_RESPONSE: &str = "<empty response>";

/// Every tool available to an agent turn of this project.
pub fn project_tools(
    lifecycle: Arc<SandboxLifecycle>,
    applier: Arc<Mutex<StreamingDiffApplier>>,
    browser: Arc<dyn PageChecker>,
) -> ToolRegistry {
    let mut tools = ToolRegistry::with_builtins();
    tools.register(Arc::new(RunShellCommandTool::new(lifecycle.clone())));
    tools.register(Arc::new(ApplyChangesTool::new(lifecycle, applier, browser)));
    tools
}

pub struct RunShellCommandTool {
    lifecycle: Arc<SandboxLifecycle>,
}

impl RunShellCommandTool {
    pub fn new(lifecycle: Arc<SandboxLifecycle>) -> Self {
        Self { lifecycle }
    }
}

#[derive(Debug, Deserialize)]
struct ShellArgs {
    command: String,
    #[serde(default)]
    workdir: Option<String>,
}

#[async_trait]
impl Tool for RunShellCommandTool {
    fn name(&self) -> &str {
        "run_shell_command"
    }

    fn description(&self) -> &str {
        "Run a shell command in the project sandbox and return its output."
    }

    fn json_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string" },
                "workdir": { "type": "string", "description": "Directory to run in" }
            },
            "required": ["command"]
        })
    }

    async fn invoke(&self, args: Value, _ctx: &ToolContext) -> ToolResult<ToolOutput> {
        let args: ShellArgs = parse_args(args)?;
        let output = self
            .lifecycle
            .run_command(&args.command, args.workdir.as_deref())
            .await;
        info!(project_id = %self.lifecycle.project_id(), command = %args.command, "Ran shell command");
        let output = if output.is_empty() {
            EMPTY_RESPONSE.to_string()
        } else {
            output
        };
        Ok(ToolOutput::new(format!("$ {}", args.command), output))
    }
}

/// Writes pending file blocks mid-turn, lints them and checks the page.
pub struct ApplyChangesTool {
    lifecycle: Arc<SandboxLifecycle>,
    applier: Arc<Mutex<StreamingDiffApplier>>,
    browser: Arc<dyn PageChecker>,
}

impl ApplyChangesTool {
    pub fn new(
        lifecycle: Arc<SandboxLifecycle>,
        applier: Arc<Mutex<StreamingDiffApplier>>,
        browser: Arc<dyn PageChecker>,
    ) -> Self {
        Self {
            lifecycle,
            applier,
            browser,
        }
    }

    async fn lint(&self, command: &str) -> Result<String, String> {
        match self.lifecycle.execute(command, None).await {
            Ok(output) if output.is_success() => Ok(output.combined()),
            Ok(output) => Err(output.combined()),
            Err(e) => Err(format!("Error: {e}")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApplyArgs {
    #[serde(default)]
    navigate_to: Option<String>,
    #[serde(default)]
    commit_message: Option<String>,
}

#[async_trait]
impl Tool for ApplyChangesTool {
    fn name(&self) -> &str {
        "apply_changes"
    }

    fn description(&self) -> &str {
        "Write the code blocks produced so far, lint them and load the page to check for errors."
    }

    fn json_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "navigate_to": { "type": "string", "description": "Page to open after applying, e.g. /" },
                "commit_message": { "type": "string", "description": "Short description of the change" }
            },
            "required": ["commit_message"]
        })
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> ToolResult<ToolOutput> {
        let args: ApplyArgs = parse_args(args)?;
        if self.lifecycle.handle().is_none() {
            return Err(ToolError::execution_failed(crate::lifecycle::BOOTING_MESSAGE));
        }
        let message = args
            .commit_message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| "Apply changes".to_string());

        let mut applier = self.applier.lock().await;
        let mut outcome = applier
            .apply(&message)
            .await
            .map_err(|e| ToolError::execution_failed(e.to_string()))?;

        let mut lint_result = None;
        let lint_command = self.lifecycle.template().lint_command.clone();
        if let (Some(command), false) = (lint_command, outcome.written.is_empty()) {
            lint_result = Some(match self.lint(&command).await {
                Ok(output) => output,
                Err(report) => {
                    warn!(project_id = %ctx.project_id, "Lint failed, retrying implicated files");
                    let fixed = applier
                        .apply_with_lint_feedback(&report, &format!("{message} (lint fixes)"))
                        .await
                        .map_err(|e| ToolError::execution_failed(e.to_string()))?;
                    outcome.failed.extend(fixed.failed);
                    if fixed.written.is_empty() {
                        report
                    } else {
                        self.lint(&command).await.unwrap_or_else(|report| report)
                    }
                }
            });
        }
        drop(applier);

        let path = args.navigate_to.as_deref().map(normalize_path);
        if let Some(path) = &path {
            ctx.emit(ToolEvent::NavigateTo(path.clone()));
        }
        let browser_result = match self.lifecycle.app_url() {
            Some(url) => {
                let target = format!("{}{}", url.trim_end_matches('/'), path.as_deref().unwrap_or("/"));
                Some(self.browser.check(&target).await)
            }
            None => None,
        };

        let failed: Vec<Value> = outcome
            .failed
            .iter()
            .map(|(path, error)| json!({ "path": path, "error": error }))
            .collect();
        let result = json!({
            "written_files": outcome.written,
            "failed_files": failed,
            "lint_result": lint_result,
            "browser_result": browser_result,
        });
        let output = serde_json::to_string_pretty(&result)?;
        Ok(ToolOutput::new(message, output).with_metadata(result))
    }
}
