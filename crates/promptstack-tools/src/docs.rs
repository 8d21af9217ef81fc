//! `read_docs`: built-in reference pages for third-party libraries.

use crate::{parse_args, Tool, ToolContext, ToolOutput, ToolResult};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

const MAPS_WITH_REACT_LEAFLET: &str = "# Maps with React Leaflet

If you need to build a map, use react-leaflet.

## React Usage
1. $ npm install react-leaflet leaflet --force
2. `import { MapContainer, TileLayer, useMap } from 'react-leaflet'` (you do not need css imports)";

const PLACEHOLDER_IMAGES: &str = "# Placeholder Images

If you need placeholder images, use sparkstack.app's mock image API.

## Usage
Base URL: https://sparkstack.app/api/mocks/images

### Optional Query Parameters
- orientation=landscape - Set image orientation
- query=topic - Filter images by topic/category

### Example
`https://sparkstack.app/api/mocks/images?orientation=landscape&query=nature`

The API will redirect to a random image matching your criteria.";

pub struct ReadDocsTool {
    pages: BTreeMap<&'static str, &'static str>,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ReadDocsArgs {
    page: String,
}

impl ReadDocsTool {
    pub fn new() -> Self {
        let pages = BTreeMap::from([
            ("maps_with_react_leaflet", MAPS_WITH_REACT_LEAFLET),
            ("placeholder_images", PLACEHOLDER_IMAGES),
        ]);
        let description = format!(
            "Read documentation for a third-party integration. Available pages: {}",
            pages.keys().copied().collect::<Vec<_>>().join(", ")
        );
        Self { pages, description }
    }

    pub fn page_names(&self) -> Vec<&'static str> {
        self.pages.keys().copied().collect()
    }
}

impl Default for ReadDocsTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ReadDocsTool {
    fn name(&self) -> &str {
        "read_docs"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn json_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "page": { "type": "string", "enum": self.page_names() }
            },
            "required": ["page"]
        })
    }

    async fn invoke(&self, args: Value, _ctx: &ToolContext) -> ToolResult<ToolOutput> {
        let args: ReadDocsArgs = parse_args(args)?;
        // An unknown page is answered, not failed, so the model can retry.
        let output = match self.pages.get(args.page.as_str()) {
            Some(text) => text.to_string(),
            None => format!(
                "Unknown page `{}`. Available pages: {}",
                args.page,
                self.page_names().join(", ")
            ),
        };
        Ok(ToolOutput::new(format!("docs {}", args.page), output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_known_page() {
        let ctx = ToolContext::new("prj_1", "cht_1");
        let out = ReadDocsTool::new()
            .invoke(json!({"page": "maps_with_react_leaflet"}), &ctx)
            .await
            .unwrap();
        assert!(out.output.starts_with("# Maps with React Leaflet"));
    }

    #[tokio::test]
    async fn test_unknown_page_lists_available() {
        let ctx = ToolContext::new("prj_1", "cht_1");
        let out = ReadDocsTool::new()
            .invoke(json!({"page": "charts"}), &ctx)
            .await
            .unwrap();
        assert!(out.output.contains("maps_with_react_leaflet, placeholder_images"));
    }
}
