use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use dl_core::quality_gate::{CommandRunner, ShellCommandRunner};

use crate::tools::{required_str, AgentTool, ToolContext, ToolError, ToolRegistry};

/// Upper bound on text returned to the model from one tool call.
const MAX_TOOL_OUTPUT: usize = 32 * 1024;

// ---------------------------------------------------------------------------
// Built-in workspace tools
//
// read_file, write_file, list_dir, run_command. All paths are relative to
// the tool context root and may not leave it.
// ---------------------------------------------------------------------------

/// Registry holding every built-in tool.
pub fn builtin_registry() -> ToolRegistry {
    ToolRegistry::new()
        .with(Arc::new(ReadFile))
        .with(Arc::new(WriteFile))
        .with(Arc::new(ListDir))
        .with(Arc::new(RunCommand::default()))
}

/// Resolve `relative` inside `root` without touching the filesystem.
///
/// Absolute paths and `..` components that climb above the root are
/// rejected.
pub fn resolve_in_root(root: &Path, relative: &str) -> Result<PathBuf, ToolError> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(ToolError::PathEscape(relative.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ToolError::PathEscape(relative.to_string()));
            }
        }
    }
    let mut resolved = root.to_path_buf();
    resolved.extend(parts);
    Ok(resolved)
}

fn truncate(mut text: String) -> String {
    if text.len() > MAX_TOOL_OUTPUT {
        let mut cut = MAX_TOOL_OUTPUT;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n[... output truncated ...]");
    }
    text
}

// ---------------------------------------------------------------------------
// read_file
// ---------------------------------------------------------------------------

pub struct ReadFile;

#[async_trait]
impl AgentTool for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file from the workspace."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the workspace root"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let path = resolve_in_root(&ctx.root, required_str(&args, "path")?)?;
        let text = tokio::fs::read_to_string(&path).await?;
        Ok(truncate(text))
    }
}

// ---------------------------------------------------------------------------
// write_file
// ---------------------------------------------------------------------------

pub struct WriteFile;

#[async_trait]
impl AgentTool for WriteFile {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file in the workspace. Parent directories are created."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the workspace root"
                },
                "content": {
                    "type": "string",
                    "description": "Full new file content"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let rel = required_str(&args, "path")?;
        let content = required_str(&args, "content")?;
        let path = resolve_in_root(&ctx.root, rel)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        info!(path = %rel, bytes = content.len(), "agent wrote file");
        Ok(format!("wrote {} bytes to {rel}", content.len()))
    }
}

// ---------------------------------------------------------------------------
// list_dir
// ---------------------------------------------------------------------------

pub struct ListDir;

#[async_trait]
impl AgentTool for ListDir {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the entries of a workspace directory. Directories end with `/`."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory relative to the workspace root (default: root)"
                }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let rel = args.get("path").and_then(Value::as_str).unwrap_or(".");
        let dir = resolve_in_root(&ctx.root, rel)?;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == ".git" {
                continue;
            }
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            names.push(if is_dir { format!("{name}/") } else { name });
        }
        names.sort();
        Ok(names.join("\n"))
    }
}

// ---------------------------------------------------------------------------
// run_command
// ---------------------------------------------------------------------------

/// Run a shell command with the workspace root as working directory.
pub struct RunCommand {
    runner: Arc<dyn CommandRunner>,
}

impl RunCommand {
    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl Default for RunCommand {
    fn default() -> Self {
        Self::with_runner(Arc::new(ShellCommandRunner))
    }
}

#[async_trait]
impl AgentTool for RunCommand {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace root and return its exit code and output."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Command line passed to `sh -c`"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, ToolError> {
        let command = required_str(&args, "command")?;
        let out = self
            .runner
            .run(command, &ctx.root, ctx.command_timeout, &ctx.cancel)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;
        if out.cancelled {
            return Err(ToolError::Execution("cancelled".into()));
        }
        if out.timed_out {
            return Err(ToolError::Execution(format!(
                "timed out after {}s",
                ctx.command_timeout.as_secs()
            )));
        }
        let code = out
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".into());
        Ok(truncate(format!(
            "exit code: {code}\n--- stdout ---\n{}\n--- stderr ---\n{}",
            out.stdout, out.stderr
        )))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
