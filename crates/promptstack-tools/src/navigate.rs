//! `navigate_to`: point the viewer's preview at a path.

use crate::{parse_args, Tool, ToolContext, ToolEvent, ToolOutput, ToolResult, ToolError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

pub struct NavigateTool;

#[derive(Debug, Deserialize)]
struct NavigateArgs {
    path: String,
}

/// Accepts `about`, `/about` or a full URL and returns the path part.
pub fn normalize_path(path: &str) -> String {
    let path = path.trim();
    let path = match path.find("://") {
        Some(scheme_end) => {
            let rest = &path[scheme_end + 3..];
            rest.find('/').map(|i| &rest[i..]).unwrap_or("/")
        }
        None => path,
    };
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

#[async_trait]
impl Tool for NavigateTool {
    fn name(&self) -> &str {
        "navigate_to"
    }

    fn description(&self) -> &str {
        "Open a page of the running app in the user's preview, e.g. `/` or `/settings`."
    }

    fn json_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path of the page to open" }
            },
            "required": ["path"]
        })
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> ToolResult<ToolOutput> {
        let args: NavigateArgs = parse_args(args)?;
        if args.path.trim().is_empty() {
            return Err(ToolError::validation("path cannot be empty"));
        }
        let path = normalize_path(&args.path);
        ctx.emit(ToolEvent::NavigateTo(path.clone()));
        Ok(ToolOutput::new(format!("navigate {path}"), format!("Navigated to {path}"))
            .with_metadata(json!({ "path": path })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("about"), "/about");
        assert_eq!(normalize_path("/about"), "/about");
        assert_eq!(normalize_path("http://localhost:3000/blog/1"), "/blog/1");
        assert_eq!(normalize_path("https://x.example"), "/");
    }

    #[tokio::test]
    async fn test_navigate_emits_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = ToolContext::new("prj_1", "cht_1").with_events(tx);
        let out = NavigateTool.invoke(json!({"path": "settings"}), &ctx).await.unwrap();
        assert_eq!(out.output, "Navigated to /settings");
        assert_eq!(rx.recv().await.unwrap(), ToolEvent::NavigateTo("/settings".into()));
    }

    #[tokio::test]
    async fn test_navigate_rejects_empty_path() {
        let ctx = ToolContext::new("prj_1", "cht_1");
        let err = NavigateTool.invoke(json!({"path": "  "}), &ctx).await.unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));
    }
}
