//! Built-in stack packs.

use crate::error::{CoreError, CoreResult};
use promptstack_sandbox::StackTemplate;

const COPY_FRONTEND_CMD: &str = "if [ ! -d 'frontend' ]; then cp -r /frontend .; fi";
const GIT_IDENTITY_CMD: &str = "git config --global user.email 'bot@prompt-stack.sshh.io' && git config --global user.name 'Prompt Stack Bot'";
const NEXTJS_LINT_CMD: &str = "cd /app/frontend && npx next lint";

fn init_command() -> String {
    format!(
        "cd /app && {COPY_FRONTEND_CMD} && git init && git config --global init.defaultBranch main && {GIT_IDENTITY_CMD} && git add -A && git commit -m 'Initial commit'"
    )
}

fn start_command() -> String {
    format!("{GIT_IDENTITY_CMD} && cd /app/frontend && npm run dev")
}

const NEXTJS_PROMPT: &str = r#"You are building a Next.js app.

The user chose a "vanilla" app, so avoid adding dependencies unless they are explicitly asked for.

Already included:
- Next.js v15 (app already created)
- tailwindcss

Style Tips:
- Use inline tailwind classes over custom css
- Use tailwind colors over custom colors
- Assume the user wants a polished UI out of the box (add styles as you create components and pick layouts that fit what is being built)

Structure Tips:
- Always use the Next.js app router for new pages, creating /src/app/<page>/page.js
- Always make new pages reachable from the index page
- Always include "use client" unless otherwise specified
- NEVER modify layout.js; use page.js files for layouts

Code Tips:
- NEVER put an <a> in a <Link> tag (Link already renders one)

3rd Party Tips:
- Use react-leaflet for maps (read the maps_with_react_leaflet docs first)
- Use the placeholder_images docs for placeholder images"#;

const NEXTJS_SHADCN_PROMPT: &str = r#"You are building a Next.js app with Shadcn UI.

The user chose Next.js with Shadcn UI, so avoid adding dependencies unless they are explicitly asked for.

Already included:
- Next.js v15 (app already created)
- lucide-react
- axios
- All shadcn components are installed (import them like `@/components/ui/button`)

Style Tips:
- Use inline tailwind classes over custom css
- Use tailwind colors over custom colors
- Prefer shadcn components over custom components
- Assume the user wants a polished UI out of the box (add styles as you create components and pick layouts that fit what is being built)

Structure Tips:
- Always use the Next.js app router for new pages, creating /src/app/<page>/page.js
- Always make new pages reachable from the index page
- Always include "use client" unless otherwise specified
- NEVER modify layout.js; use page.js files for layouts

Code Tips:
- NEVER put an <a> in a <Link> tag (Link already renders one)

3rd Party Tips:
- Use react-leaflet for maps (read the maps_with_react_leaflet docs first)
- Use the placeholder_images docs for placeholder images"#;

/// Every template the engine knows, in display order.
pub fn builtin_stacks() -> Vec<StackTemplate> {
    vec![
        StackTemplate {
            id: "nextjs".to_string(),
            title: "Next.js".to_string(),
            description: "A simple Next.js app. Best for starting from scratch with minimal components.".to_string(),
            image: "ghcr.io/sshh12/prompt-stack-pack-nextjs-vanilla@sha256:7ef15857dc430f0af0ece838a0fd674dacf1e3bb3975aa2f240e9cdb9ce0297b".to_string(),
            init_command: init_command(),
            start_command: start_command(),
            prompt: NEXTJS_PROMPT.to_string(),
            lint_command: Some(NEXTJS_LINT_CMD.to_string()),
        },
        StackTemplate {
            id: "nextjs-shadcn".to_string(),
            title: "Next.js Shadcn".to_string(),
            description: "A Next.js app with Shadcn UI. Best for building a modern web app with a modern UI.".to_string(),
            image: "ghcr.io/sshh12/prompt-stack-pack-nextjs-shadcn@sha256:77487f76650266c353d485cc11b41e3d5c222c6abddd69942fddcb1d2e108a34".to_string(),
            init_command: init_command(),
            start_command: start_command(),
            prompt: NEXTJS_SHADCN_PROMPT.to_string(),
            lint_command: Some(NEXTJS_LINT_CMD.to_string()),
        },
    ]
}

/// Lookup over a fixed template list.
#[derive(Debug, Clone)]
pub struct StackCatalog {
    stacks: Vec<StackTemplate>,
}

impl StackCatalog {
    pub fn new(stacks: Vec<StackTemplate>) -> Self {
        Self { stacks }
    }

    pub fn builtin() -> Self {
        Self::new(builtin_stacks())
    }

    pub fn all(&self) -> &[StackTemplate] {
        &self.stacks
    }

    pub fn get(&self, id: &str) -> CoreResult<&StackTemplate> {
        self.stacks
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| CoreError::UnknownStack(id.to_string()))
    }
}

impl Default for StackCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
