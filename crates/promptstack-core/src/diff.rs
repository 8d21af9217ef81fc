//! Applying file blocks from streamed assistant text.
//!
//! The agent writes each file change as a fenced block whose first line is
//! a comment holding the target path:
//!
//! ````text
//! ```tsx
//! // /app/frontend/src/app/page.tsx
//! export default function Page() { ... }
//! ```
//! ````
//!
//! [`StreamingDiffApplier`] finds these blocks while the text is still
//! streaming and starts resolving each one immediately. Blocks that are
//! complete files are used verbatim; blocks with elided code or content that
//! trips an adjustment rule go through a [`DiffResolver`] that merges them
//! into the current file.

use crate::config::DiffConfig;
use crate::error::{ConfigError, CoreError, CoreResult};
use crate::lifecycle::ProjectWorkspace;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use promptstack_provider::{complete, BoxedLanguageModel, GenerateOptions};
use promptstack_util::TimingGuard;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// File block patterns: `#`/`//` comments, `/* */` comments, HTML comments.
static FILE_BLOCK_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"```[\w.]+\n[#/]+ (\S+)\n([\s\S]+?)```",
        r"```[\w.]+\n[/*]+ (\S+) \*/\n([\s\S]+?)```",
        r"```[\w.]+\n<!-- (\S+) -->\n([\s\S]+?)```",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

static DEFAULT_TIPS: Lazy<Vec<(Regex, String)>> = Lazy::new(|| {
    [
        (
            r"<Link[^>]*>[\S\s]*?<a[^>]*>",
            "All <Link> tags should be free of <a> tags. Remove all <a> tags from <Link> tags.",
        ),
        (
            "<CardBody",
            "Ensure in Shadcn UI, <Card>s use <CardContent> instead of <CardBody>.",
        ),
        (
            "<Slider",
            "Ensure <Slider />s in Shadcn have at least values= or a min= and a max= attribute.",
        ),
        (
            r"Layout\(",
            "Ensure Layouts in Next.js retain <html> and <body> tags.",
        ),
    ]
    .iter()
    .filter_map(|(p, tip)| Regex::new(p).ok().map(|re| (re, tip.to_string())))
    .collect()
});

pub const MISSING_FILE_SENTINEL: &str = "(file does not yet exist)";

const MERGE_SYSTEM_PROMPT: &str = "You are a senior software engineer that applies code changes to a file. Given the <original-content>, the <diff>, and the <adjustments>, apply the changes to the content.

- You must apply the <adjustments> provided even if this conflicts with the original diff
- You must follow instructions from within comments in <diff> (e.g. <!-- remove this -->)
- You must maintain the layout of the file especially in languages/formats where it matters

Respond ONLY with the updated content (no code blocks or other formatting).";

/// A file block found in assistant text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlock {
    pub path: String,
    /// Byte offset of the opening fence.
    pub offset: usize,
    /// Block body, trimmed.
    pub body: String,
}

/// Every file block in `text`, in pattern then position order.
pub fn find_file_blocks(text: &str) -> Vec<FileBlock> {
    let mut blocks = Vec::new();
    for pattern in FILE_BLOCK_PATTERNS.iter() {
        for caps in pattern.captures_iter(text) {
            let (Some(all), Some(path), Some(body)) = (caps.get(0), caps.get(1), caps.get(2)) else {
                continue;
            };
            blocks.push(FileBlock {
                path: path.as_str().to_string(),
                offset: all.start(),
                body: body.as_str().trim().to_string(),
            });
        }
    }
    blocks
}

/// Remove file blocks, leaving the prose around them.
pub fn strip_file_blocks(text: &str) -> String {
    FILE_BLOCK_PATTERNS
        .iter()
        .fold(text.to_string(), |acc, pattern| pattern.replace_all(&acc, "").into_owned())
}

/// When a block needs a merge, and which adjustment tips go with it.
#[derive(Debug, Clone)]
pub struct DiffPolicy {
    elision_markers: Vec<String>,
    tips: Vec<(Regex, String)>,
}

impl Default for DiffPolicy {
    fn default() -> Self {
        Self {
            elision_markers: DiffConfig::default().elision_markers,
            tips: DEFAULT_TIPS.clone(),
        }
    }
}

impl DiffPolicy {
    pub fn from_config(config: &DiffConfig) -> CoreResult<Self> {
        let mut tips = DEFAULT_TIPS.clone();
        for rule in &config.extra_tips {
            let re = Regex::new(&rule.pattern).map_err(|e| ConfigError::InvalidValue {
                name: "diff.extra_tips".to_string(),
                value: format!("{}: {e}", rule.pattern),
            })?;
            tips.push((re, rule.tip.clone()));
        }
        Ok(Self {
            elision_markers: config.elision_markers.clone(),
            tips,
        })
    }

    pub fn tips_for(&self, body: &str) -> Vec<String> {
        self.tips
            .iter()
            .filter(|(re, _)| re.is_match(body))
            .map(|(_, tip)| tip.clone())
            .collect()
    }

    pub fn has_elision(&self, body: &str) -> bool {
        self.elision_markers.iter().any(|m| body.contains(m.as_str()))
    }

    /// Whether `body` cannot be written verbatim.
    pub fn needs_merge(&self, body: &str) -> bool {
        self.has_elision(body) || self.tips.iter().any(|(re, _)| re.is_match(body))
    }
}

/// Merges a block into a file's current content.
#[async_trait]
pub trait DiffResolver: Send + Sync {
    /// Return the complete new file. `original` is `None` for new files.
    async fn resolve(&self, original: Option<&str>, diff: &str, tips: &[String]) -> CoreResult<String>;
}

/// Merge prompt user message.
pub fn merge_prompt(original: Option<&str>, diff: &str, tips: &[String]) -> String {
    let tips = tips.iter().map(|t| format!(" - {t}")).collect::<Vec<_>>().join("\n");
    format!(
        "<original-content>\n{}\n</original-content>\n\n<diff>\n{diff}\n</diff>\n\n<adjustments>\n{tips}\n</adjustments>",
        original.unwrap_or(MISSING_FILE_SENTINEL)
    )
}

/// Drop a code fence wrapped around the whole reply.
fn strip_wrapping_fence(reply: &str) -> String {
    let trimmed = reply.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        if let Some(inner) = rest.strip_suffix("```") {
            return match inner.split_once('\n') {
                Some((_, body)) => body.trim_end().to_string(),
                None => String::new(),
            };
        }
    }
    reply.to_string()
}

/// Merges with a (fast) language model.
pub struct LlmDiffResolver {
    model: BoxedLanguageModel,
}

impl LlmDiffResolver {
    pub fn new(model: BoxedLanguageModel) -> Self {
        Self { model }
    }
}

#[async_trait]
impl DiffResolver for LlmDiffResolver {
    async fn resolve(&self, original: Option<&str>, diff: &str, tips: &[String]) -> CoreResult<String> {
        let reply = complete(
            self.model.as_ref(),
            MERGE_SYSTEM_PROMPT,
            &merge_prompt(original, diff, tips),
            GenerateOptions::default(),
        )
        .await?;
        Ok(strip_wrapping_fence(&reply))
    }
}

struct PendingDiff {
    offset: usize,
    body: String,
    task: JoinHandle<CoreResult<String>>,
}

/// Result of writing a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Paths written and committed.
    pub written: Vec<String>,
    /// Paths left untouched, with the reason.
    pub failed: Vec<(String, String)>,
}

impl ApplyOutcome {
    pub fn is_empty(&self) -> bool {
        self.written.is_empty() && self.failed.is_empty()
    }
}

pub struct StreamingDiffApplier {
    workspace: Arc<dyn ProjectWorkspace>,
    resolver: Arc<dyn DiffResolver>,
    policy: Arc<DiffPolicy>,
    buffer: String,
    seen: HashSet<(String, usize)>,
    pending: BTreeMap<String, PendingDiff>,
    /// Blocks of the last batch, kept for a lint feedback pass.
    applied: BTreeMap<String, String>,
}

impl StreamingDiffApplier {
    pub fn new(
        workspace: Arc<dyn ProjectWorkspace>,
        resolver: Arc<dyn DiffResolver>,
        policy: Arc<DiffPolicy>,
    ) -> Self {
        Self {
            workspace,
            resolver,
            policy,
            buffer: String::new(),
            seen: HashSet::new(),
            pending: BTreeMap::new(),
            applied: BTreeMap::new(),
        }
    }

    /// Paths with a block awaiting `apply`.
    pub fn pending_paths(&self) -> Vec<String> {
        self.pending.keys().cloned().collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Append streamed text and start resolving any newly completed block.
    pub fn ingest(&mut self, chunk: &str) {
        self.buffer.push_str(chunk);
        for block in find_file_blocks(&self.buffer) {
            if !self.seen.insert((block.path.clone(), block.offset)) {
                continue;
            }
            if let Some(previous) = self.pending.get(&block.path) {
                if previous.offset > block.offset {
                    continue;
                }
                debug!(path = %block.path, "Later block supersedes pending one");
                previous.task.abort();
            }
            debug!(path = %block.path, offset = block.offset, "Found file block");
            let task = self.spawn_resolution(block.path.clone(), block.body.clone(), Vec::new());
            self.pending.insert(
                block.path,
                PendingDiff {
                    offset: block.offset,
                    body: block.body,
                    task,
                },
            );
        }
    }

    fn spawn_resolution(
        &self,
        path: String,
        body: String,
        extra_tips: Vec<String>,
    ) -> JoinHandle<CoreResult<String>> {
        let workspace = self.workspace.clone();
        let resolver = self.resolver.clone();
        let policy = self.policy.clone();
        tokio::spawn(async move {
            let mut tips = policy.tips_for(&body);
            tips.extend(extra_tips);
            if tips.is_empty() && !policy.has_elision(&body) {
                return Ok(body);
            }

            let _timing = TimingGuard::new("diff", path.clone());
            let original = match workspace.read_file(&path).await {
                Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
                Err(e) => {
                    debug!(path = %path, error = %e, "No original content for merge");
                    None
                }
            };
            info!(path = %path, tips = tips.len(), "Merging file block");
            resolver
                .resolve(original.as_deref(), &body, &tips)
                .await
                .map_err(|e| CoreError::diff_failed(&path, e.to_string()))
        })
    }

    /// Await every pending resolution and write the results as one commit.
    /// Files whose resolution failed are reported, not written.
    pub async fn apply(&mut self, message: &str) -> CoreResult<ApplyOutcome> {
        let pending = std::mem::take(&mut self.pending);
        self.reset();

        let mut files = Vec::new();
        let mut failed = Vec::new();
        let mut applied = BTreeMap::new();
        for (path, diff) in pending {
            match diff.task.await {
                Ok(Ok(content)) => {
                    applied.insert(path.clone(), diff.body);
                    files.push((path, content));
                }
                Ok(Err(e)) => {
                    warn!(path = %path, error = %e, "Skipping file");
                    failed.push((path, e.to_string()));
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "Resolution task did not finish");
                    failed.push((path, e.to_string()));
                }
            }
        }
        self.applied = applied;

        if files.is_empty() {
            return Ok(ApplyOutcome {
                written: Vec::new(),
                failed,
            });
        }
        let written = self.workspace.write_files_and_commit(&files, message).await?;
        Ok(ApplyOutcome { written, failed })
    }

    /// Re-resolve the files of the last batch that `lint_output` mentions,
    /// with the lint report as an extra tip, and commit them.
    pub async fn apply_with_lint_feedback(&mut self, lint_output: &str, message: &str) -> CoreResult<ApplyOutcome> {
        let implicated: Vec<(String, String)> = self
            .applied
            .iter()
            .filter(|(path, _)| lint_mentions(lint_output, path))
            .map(|(p, b)| (p.clone(), b.clone()))
            .collect();
        if implicated.is_empty() {
            debug!("Lint output names none of the applied files");
            return Ok(ApplyOutcome::default());
        }

        let tip = format!("Fix the following lint errors:\n{}", lint_output.trim());
        for (path, body) in implicated {
            let task = self.spawn_resolution(path.clone(), body.clone(), vec![tip.clone()]);
            self.pending.insert(path, PendingDiff { offset: 0, body, task });
        }
        self.apply(message).await
    }

    /// Drop buffered text and dedup state. Pending resolutions are kept.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.seen.clear();
    }

    /// Abort pending resolutions and clear all state.
    pub fn discard(&mut self) {
        for (_, diff) in std::mem::take(&mut self.pending) {
            diff.task.abort();
        }
        self.reset();
    }
}

impl Drop for StreamingDiffApplier {
    fn drop(&mut self) {
        for diff in self.pending.values() {
            diff.task.abort();
        }
    }
}

/// Whether a lint report names `path`, by path suffix.
fn lint_mentions(lint_output: &str, path: &str) -> bool {
    lint_output.split_whitespace().any(|token| {
        let token = token.split(':').next().unwrap_or_default();
        let token = token.trim_start_matches("./");
        !token.is_empty()
            && token.contains('.')
            && (path == token || path.ends_with(&format!("/{token}")))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptstack_test_utils::ScriptedModel;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryWorkspace {
        files: Mutex<BTreeMap<String, String>>,
        commits: Mutex<Vec<(Vec<(String, String)>, String)>>,
    }

    #[async_trait]
    impl ProjectWorkspace for MemoryWorkspace {
        async fn read_file(&self, path: &str) -> CoreResult<Vec<u8>> {
            self.files
                .lock()
                .unwrap()
                .get(path)
                .map(|c| c.clone().into_bytes())
                .ok_or_else(|| promptstack_sandbox::SandboxError::FileNotFound(path.into()).into())
        }

        async fn write_files_and_commit(&self, files: &[(String, String)], message: &str) -> CoreResult<Vec<String>> {
            let mut stored = self.files.lock().unwrap();
            for (path, content) in files {
                stored.insert(path.clone(), content.clone());
            }
            self.commits.lock().unwrap().push((files.to_vec(), message.to_string()));
            Ok(files.iter().map(|(p, _)| p.clone()).collect())
        }
    }

    /// Replaces elided lines with a fixed line and records what it was asked.
    #[derive(Default)]
    struct RecordingResolver {
        calls: Mutex<Vec<(Option<String>, String, Vec<String>)>>,
        fail_for: Option<String>,
    }

    #[async_trait]
    impl DiffResolver for RecordingResolver {
        async fn resolve(&self, original: Option<&str>, diff: &str, tips: &[String]) -> CoreResult<String> {
            self.calls
                .lock()
                .unwrap()
                .push((original.map(str::to_string), diff.to_string(), tips.to_vec()));
            if self.fail_for.as_deref().is_some_and(|f| diff.contains(f)) {
                return Err(CoreError::ProviderUnavailable("down".into()));
            }
            Ok(diff
                .lines()
                .filter(|l| !l.contains("existing code"))
                .collect::<Vec<_>>()
                .join("\n"))
        }
    }

    fn applier(workspace: Arc<MemoryWorkspace>, resolver: Arc<RecordingResolver>) -> StreamingDiffApplier {
        StreamingDiffApplier::new(workspace, resolver, Arc::new(DiffPolicy::default()))
    }

    #[test]
    fn test_find_blocks_for_each_comment_style() {
        let text = "intro\n```py\n# /app/a.py\nprint(1)\n```\n\
                    ```css\n/* /app/b.css */\nbody {}\n```\n\
                    ```html\n<!-- /app/c.html -->\n<p>hi</p>\n```\n\
                    ```ts\n// /app/d.ts\nexport {}\n```";
        let blocks = find_file_blocks(text);
        let mut paths: Vec<_> = blocks.iter().map(|b| b.path.as_str()).collect();
        paths.sort();
        assert_eq!(paths, vec!["/app/a.py", "/app/b.css", "/app/c.html", "/app/d.ts"]);
        let a = blocks.iter().find(|b| b.path == "/app/a.py").unwrap();
        assert_eq!(a.body, "print(1)");
        assert_eq!(a.offset, 6);
    }

    #[test]
    fn test_unfenced_code_is_not_a_block() {
        assert!(find_file_blocks("```bash\nnpm install\n```").is_empty());
        assert!(find_file_blocks("```py\n# /app/a.py\nprint(1)\n``").is_empty());
    }

    #[test]
    fn test_strip_file_blocks_keeps_prose() {
        let text = "Here you go:\n```py\n# /app/a.py\nprint(1)\n```\nDone.";
        assert_eq!(strip_file_blocks(text), "Here you go:\n\nDone.");
    }

    #[test]
    fn test_policy_tips() {
        let policy = DiffPolicy::default();
        assert!(policy.needs_merge("// ... existing code ..."));
        assert!(!policy.needs_merge("export default function Page() {}"));
        let tips = policy.tips_for("<Link href=\"/\"><a>Home</a></Link>");
        assert_eq!(tips.len(), 1);
        assert!(tips[0].contains("<Link>"));
        assert!(policy.tips_for("export default function RootLayout(").len() == 1);
    }

    #[test]
    fn test_policy_from_config_adds_rules() {
        let config = DiffConfig {
            elision_markers: vec!["rest unchanged".into()],
            extra_tips: vec![crate::config::TipRule {
                pattern: "useRouter".into(),
                tip: "Import useRouter from next/navigation.".into(),
            }],
        };
        let policy = DiffPolicy::from_config(&config).unwrap();
        assert!(policy.has_elision("// rest unchanged"));
        assert!(!policy.has_elision("// existing code"));
        assert_eq!(policy.tips_for("useRouter()"), vec!["Import useRouter from next/navigation."]);

        let bad = DiffConfig {
            extra_tips: vec![crate::config::TipRule {
                pattern: "(".into(),
                tip: "x".into(),
            }],
            ..DiffConfig::default()
        };
        assert!(DiffPolicy::from_config(&bad).is_err());
    }

    #[test]
    fn test_merge_prompt_shape() {
        let prompt = merge_prompt(None, "x = 1", &["tip one".into(), "tip two".into()]);
        assert_eq!(
            prompt,
            "<original-content>\n(file does not yet exist)\n</original-content>\n\n<diff>\nx = 1\n</diff>\n\n<adjustments>\n - tip one\n - tip two\n</adjustments>"
        );
    }

    #[test]
    fn test_strip_wrapping_fence() {
        assert_eq!(strip_wrapping_fence("```py\nprint(1)\n```"), "print(1)");
        assert_eq!(strip_wrapping_fence("print(1)"), "print(1)");
    }

    #[test]
    fn test_lint_mentions_by_suffix() {
        let lint = "./src/app/page.js\n12:5  Error: 'x' is not defined.  no-undef";
        assert!(lint_mentions(lint, "/app/frontend/src/app/page.js"));
        assert!(!lint_mentions(lint, "/app/frontend/src/app/layout.js"));
    }

    #[tokio::test]
    async fn test_block_split_across_chunks_is_written_once() {
        let workspace = Arc::new(MemoryWorkspace::default());
        let mut applier = applier(workspace.clone(), Arc::new(RecordingResolver::default()));

        let text = "```py\n# /app/a.py\nprint(1)\n```";
        let (head, tail) = text.split_at(20);
        applier.ingest(head);
        assert!(!applier.has_pending());
        applier.ingest(tail);
        applier.ingest("");
        applier.ingest("\nThat's it.");
        assert_eq!(applier.pending_paths(), vec!["/app/a.py"]);

        let outcome = applier.apply("Update a.py").await.unwrap();
        assert_eq!(outcome.written, vec!["/app/a.py"]);
        let commits = workspace.commits.lock().unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].0, vec![("/app/a.py".to_string(), "print(1)".to_string())]);
        assert_eq!(commits[0].1, "Update a.py");
    }

    #[tokio::test]
    async fn test_every_chunking_applies_once() {
        let text = "Sure.\n```js\n// /app/x.js\nconst a = 1;\n```\nand\n```css\n/* /app/y.css */\np {}\n```\n";
        for size in [1, 2, 3, 7, 16, text.len()] {
            let workspace = Arc::new(MemoryWorkspace::default());
            let resolver = Arc::new(RecordingResolver::default());
            let mut applier = applier(workspace.clone(), resolver.clone());
            let bytes = text.as_bytes();
            for chunk in bytes.chunks(size) {
                applier.ingest(std::str::from_utf8(chunk).unwrap());
            }
            let outcome = applier.apply("msg").await.unwrap();
            assert_eq!(outcome.written.len(), 2, "chunk size {size}");
            assert!(resolver.calls.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_elided_block_is_resolved_once_across_rescans() {
        let workspace = Arc::new(MemoryWorkspace::default());
        workspace
            .files
            .lock()
            .unwrap()
            .insert("/app/g.py".into(), "def g():\n    pass".into());
        let resolver = Arc::new(RecordingResolver::default());
        let mut applier = applier(workspace.clone(), resolver.clone());

        let text = "```py\n# /app/g.py\ndef g():\n    # ... existing code ...\n    return 2\n```";
        let (head, tail) = text.split_at(30);
        applier.ingest(head);
        applier.ingest(tail);
        for trailing in ["", "\n", "Also ", "tidied ", "the imports."] {
            applier.ingest(trailing);
        }
        assert_eq!(applier.pending_paths(), vec!["/app/g.py"]);

        let outcome = applier.apply("Update g.py").await.unwrap();
        assert_eq!(outcome.written, vec!["/app/g.py"]);
        assert_eq!(resolver.calls.lock().unwrap().len(), 1);
        let content = workspace.files.lock().unwrap()["/app/g.py"].clone();
        assert!(content.contains("return 2"));
        assert!(!content.contains("existing code"));
    }

    #[tokio::test]
    async fn test_later_block_for_same_path_wins() {
        let workspace = Arc::new(MemoryWorkspace::default());
        let mut applier = applier(workspace.clone(), Arc::new(RecordingResolver::default()));
        applier.ingest("```py\n# /app/a.py\nfirst\n```\n");
        applier.ingest("```py\n# /app/a.py\nsecond\n```\n");
        let outcome = applier.apply("msg").await.unwrap();
        assert_eq!(outcome.written, vec!["/app/a.py"]);
        assert_eq!(workspace.files.lock().unwrap()["/app/a.py"], "second");
    }

    #[tokio::test]
    async fn test_elided_block_is_merged_against_original() {
        let workspace = Arc::new(MemoryWorkspace::default());
        workspace
            .files
            .lock()
            .unwrap()
            .insert("/app/f.py".into(), "def f():\n    pass".into());
        let resolver = Arc::new(RecordingResolver::default());
        let mut applier = applier(workspace.clone(), resolver.clone());

        applier.ingest("```py\n# /app/f.py\ndef f():\n    # ... existing code ...\n    return 1\n```");
        applier.apply("msg").await.unwrap();

        let content = workspace.files.lock().unwrap()["/app/f.py"].clone();
        assert!(!content.contains("existing code"));
        assert!(content.contains("def f"));
        let calls = resolver.calls.lock().unwrap();
        assert_eq!(calls[0].0.as_deref(), Some("def f():\n    pass"));
    }

    #[tokio::test]
    async fn test_failed_resolution_is_isolated() {
        let workspace = Arc::new(MemoryWorkspace::default());
        let resolver = Arc::new(RecordingResolver {
            fail_for: Some("BROKEN".into()),
            ..Default::default()
        });
        let mut applier = applier(workspace.clone(), resolver);
        applier.ingest("```py\n# /app/ok.py\nprint(1)\n```\n");
        applier.ingest("```py\n# /app/bad.py\n# existing code\nBROKEN\n```\n");

        let outcome = applier.apply("msg").await.unwrap();
        assert_eq!(outcome.written, vec!["/app/ok.py"]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, "/app/bad.py");
    }

    #[tokio::test]
    async fn test_apply_resets_for_next_turn() {
        let workspace = Arc::new(MemoryWorkspace::default());
        let mut applier = applier(workspace.clone(), Arc::new(RecordingResolver::default()));
        applier.ingest("```py\n# /app/a.py\none\n```");
        applier.apply("first").await.unwrap();
        assert!(applier.apply("empty").await.unwrap().is_empty());

        applier.ingest("```py\n# /app/a.py\ntwo\n```");
        applier.apply("second").await.unwrap();
        assert_eq!(workspace.commits.lock().unwrap().len(), 2);
        assert_eq!(workspace.files.lock().unwrap()["/app/a.py"], "two");
    }

    #[tokio::test]
    async fn test_lint_feedback_reresolves_implicated_files() {
        let workspace = Arc::new(MemoryWorkspace::default());
        let resolver = Arc::new(RecordingResolver::default());
        let mut applier = applier(workspace.clone(), resolver.clone());
        applier.ingest("```js\n// /app/frontend/src/app/page.js\nexport default x;\n```\n");
        applier.ingest("```js\n// /app/frontend/src/app/other.js\nexport {};\n```\n");
        applier.apply("msg").await.unwrap();

        let outcome = applier
            .apply_with_lint_feedback("./src/app/page.js\n1:16  Error: 'x' is not defined.", "Fix lint")
            .await
            .unwrap();
        assert_eq!(outcome.written, vec!["/app/frontend/src/app/page.js"]);
        let calls = resolver.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].2[0].contains("'x' is not defined"));
        assert_eq!(calls[0].0.as_deref(), Some("export default x;"));
    }

    #[tokio::test]
    async fn test_llm_resolver_sends_merge_prompt() {
        let model = Arc::new(ScriptedModel::new());
        model.push_text(&["```py\ndef f():\n    return 1\n```"]);
        let resolver = LlmDiffResolver::new(model.clone());
        let merged = resolver
            .resolve(Some("def f():\n    pass"), "def f():\n    # ... existing code ...\n    return 1", &[])
            .await
            .unwrap();
        assert_eq!(merged, "def f():\n    return 1");

        let requests = model.requests();
        let prompt = requests[0][0].text();
        assert!(prompt.contains("<original-content>\ndef f():\n    pass\n</original-content>"));
        assert_eq!(model.systems()[0].as_deref(), Some(MERGE_SYSTEM_PROMPT));
    }
}
