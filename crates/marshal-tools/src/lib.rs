use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use marshal_types::{ToolAccess, ToolKind, ToolResult};

/// Tool failure classification consumed by the step executor's retry policy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("transient tool error: {reason}")]
    Transient { reason: String },
    #[error("fatal tool error: {reason}")]
    Fatal { reason: String },
}

impl ToolError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub kind: ToolKind,
    pub access: ToolAccess,
    pub description: &'static str,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    /// Workspace paths this call would read or write, derived from the args.
    /// Used when the planner did not declare resource paths itself.
    fn resource_paths(&self, args: &Value) -> Vec<String> {
        args.get("path")
            .and_then(|p| p.as_str())
            .map(|p| vec![p.to_string()])
            .unwrap_or_default()
    }

    async fn execute(
        &self,
        workspace: &Path,
        args: Value,
        cancel: CancellationToken,
    ) -> Result<ToolResult, ToolError>;
}

#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        let mut map: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        map.insert("read_file".to_string(), Arc::new(ReadFileTool));
        map.insert("list_dir".to_string(), Arc::new(ListDirTool));
        map.insert("write_file".to_string(), Arc::new(WriteFileTool));
        map.insert("delete_path".to_string(), Arc::new(DeletePathTool));
        map.insert("apply_patch".to_string(), Arc::new(ApplyPatchTool));
        map.insert("run_command".to_string(), Arc::new(RunCommandTool));
        map.insert("git_status".to_string(), Arc::new(GitStatusTool));
        map.insert("git_diff".to_string(), Arc::new(GitDiffTool));
        map.insert("git_add".to_string(), Arc::new(GitAddTool));
        map.insert("git_commit".to_string(), Arc::new(GitCommitTool));
        Self {
            tools: Arc::new(RwLock::new(map)),
        }
    }

    pub async fn register(&self, name: impl Into<String>, tool: Arc<dyn Tool>) {
        self.tools.write().await.insert(name.into(), tool);
    }

    pub async fn spec_for(&self, name: &str) -> Option<ToolSpec> {
        self.tools.read().await.get(name).map(|t| t.spec())
    }

    pub async fn resource_paths_for(&self, name: &str, args: &Value) -> Vec<String> {
        match self.tools.read().await.get(name) {
            Some(tool) => tool.resource_paths(args),
            None => Vec::new(),
        }
    }

    pub async fn execute(
        &self,
        name: &str,
        workspace: &Path,
        args: Value,
        cancel: CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        let tool = {
            let tools = self.tools.read().await;
            tools.get(name).cloned()
        };
        let Some(tool) = tool else {
            return Err(ToolError::fatal(format!("unknown tool: {name}")));
        };
        tool.execute(workspace, args, cancel).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a caller-supplied path against the workspace root, rejecting
/// absolute paths and any traversal out of the workspace.
pub fn resolve_workspace_path(workspace: &Path, raw: &str) -> Result<PathBuf, ToolError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ToolError::fatal("path must not be empty"));
    }
    let candidate = Path::new(trimmed);
    if candidate.is_absolute() {
        return Err(ToolError::fatal(format!(
            "absolute paths are not allowed: {trimmed}"
        )));
    }
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(ToolError::fatal(format!(
            "path escapes the workspace: {trimmed}"
        )));
    }
    Ok(workspace.join(candidate))
}

fn map_io_error(context: &str, err: std::io::Error) -> ToolError {
    match err.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied | ErrorKind::InvalidInput => {
            ToolError::fatal(format!("{context}: {err}"))
        }
        _ => ToolError::transient(format!("{context}: {err}")),
    }
}

fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::fatal(format!("missing required argument `{key}`")))
}

struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "read_file",
            kind: ToolKind::FsRead,
            access: ToolAccess::ReadOnly,
            description: "Read a file from the workspace",
        }
    }

    async fn execute(
        &self,
        workspace: &Path,
        args: Value,
        _cancel: CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        let raw = require_str(&args, "path")?;
        let path = resolve_workspace_path(workspace, raw)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| map_io_error(&format!("read `{raw}`"), e))?;
        Ok(ToolResult {
            output: content,
            metadata: json!({"path": raw}),
        })
    }
}

struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "list_dir",
            kind: ToolKind::FsList,
            access: ToolAccess::ReadOnly,
            description: "List a workspace directory",
        }
    }

    fn resource_paths(&self, args: &Value) -> Vec<String> {
        vec![args
            .get("path")
            .and_then(|p| p.as_str())
            .unwrap_or(".")
            .to_string()]
    }

    async fn execute(
        &self,
        workspace: &Path,
        args: Value,
        _cancel: CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        let raw = args.get("path").and_then(|p| p.as_str()).unwrap_or(".");
        let path = resolve_workspace_path(workspace, raw)?;
        let mut reader = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| map_io_error(&format!("list `{raw}`"), e))?;
        let mut names = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| map_io_error(&format!("list `{raw}`"), e))?
        {
            let mut name = entry.file_name().to_string_lossy().to_string();
            if entry.path().is_dir() {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();
        Ok(ToolResult {
            output: names.join("\n"),
            metadata: json!({"path": raw, "entries": names.len()}),
        })
    }
}

struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "write_file",
            kind: ToolKind::FsWrite,
            access: ToolAccess::Mutating,
            description: "Create or overwrite a workspace file",
        }
    }

    async fn execute(
        &self,
        workspace: &Path,
        args: Value,
        _cancel: CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        let raw = require_str(&args, "path")?;
        let content = args.get("content").and_then(|v| v.as_str()).unwrap_or("");
        let path = resolve_workspace_path(workspace, raw)?;
        let existed = path.exists();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io_error(&format!("write `{raw}`"), e))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| map_io_error(&format!("write `{raw}`"), e))?;
        Ok(ToolResult {
            output: format!("wrote {} bytes to {raw}", content.len()),
            metadata: json!({"path": raw, "bytes": content.len(), "created": !existed}),
        })
    }
}

struct DeletePathTool;

#[async_trait]
impl Tool for DeletePathTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "delete_path",
            kind: ToolKind::FsDelete,
            access: ToolAccess::Mutating,
            description: "Delete a workspace file or directory tree",
        }
    }

    async fn execute(
        &self,
        workspace: &Path,
        args: Value,
        _cancel: CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        let raw = require_str(&args, "path")?;
        let path = resolve_workspace_path(workspace, raw)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| map_io_error(&format!("delete `{raw}`"), e))?;
        if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(|e| map_io_error(&format!("delete `{raw}`"), e))?;
        } else {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| map_io_error(&format!("delete `{raw}`"), e))?;
        }
        Ok(ToolResult {
            output: format!("deleted {raw}"),
            metadata: json!({"path": raw, "was_dir": metadata.is_dir()}),
        })
    }
}

struct ApplyPatchTool;

#[async_trait]
impl Tool for ApplyPatchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "apply_patch",
            kind: ToolKind::Patch,
            access: ToolAccess::Mutating,
            description: "Replace an exact text span inside a workspace file",
        }
    }

    async fn execute(
        &self,
        workspace: &Path,
        args: Value,
        _cancel: CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        let raw = require_str(&args, "path")?;
        let old_text = require_str(&args, "old_text")?;
        let new_text = args.get("new_text").and_then(|v| v.as_str()).unwrap_or("");
        let path = resolve_workspace_path(workspace, raw)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| map_io_error(&format!("patch `{raw}`"), e))?;
        let Some(at) = content.find(old_text) else {
            return Err(ToolError::fatal(format!(
                "patch target not found in `{raw}`"
            )));
        };
        let mut updated = String::with_capacity(content.len());
        updated.push_str(&content[..at]);
        updated.push_str(new_text);
        updated.push_str(&content[at + old_text.len()..]);
        tokio::fs::write(&path, &updated)
            .await
            .map_err(|e| map_io_error(&format!("patch `{raw}`"), e))?;
        Ok(ToolResult {
            output: format!("patched {raw}"),
            metadata: json!({"path": raw, "removed": old_text.len(), "inserted": new_text.len()}),
        })
    }
}

struct RunCommandTool;

#[async_trait]
impl Tool for RunCommandTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "run_command",
            kind: ToolKind::Command,
            access: ToolAccess::Mutating,
            description: "Run a shell command inside the workspace",
        }
    }

    fn resource_paths(&self, _args: &Value) -> Vec<String> {
        // Commands touch whatever they touch; the planner declares locks.
        Vec::new()
    }

    async fn execute(
        &self,
        workspace: &Path,
        args: Value,
        cancel: CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        let cmd = require_str(&args, "command")?;
        let mut command = Command::new("sh");
        command
            .args(["-c", cmd])
            .current_dir(workspace)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(env) = args.get("env").and_then(|v| v.as_object()) {
            for (k, v) in env {
                if let Some(value) = v.as_str() {
                    command.env(k, value);
                }
            }
        }
        run_child(command, cancel).await
    }
}

async fn run_child(
    mut command: Command,
    cancel: CancellationToken,
) -> Result<ToolResult, ToolError> {
    let mut child = command
        .spawn()
        .map_err(|e| map_io_error("spawn command", e))?;
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(ToolError::transient("command cancelled"));
        }
        status = child.wait() => status.map_err(|e| map_io_error("wait for command", e))?,
    };

    let mut stdout = String::new();
    let mut stderr = String::new();
    if let Some(pipe) = stdout_pipe.as_mut() {
        let _ = pipe.read_to_string(&mut stdout).await;
    }
    if let Some(pipe) = stderr_pipe.as_mut() {
        let _ = pipe.read_to_string(&mut stderr).await;
    }

    tracing::debug!(code = status.code(), "child process finished");
    if !status.success() {
        let reason = if stderr.trim().is_empty() {
            format!("command exited with {status}")
        } else {
            format!("command exited with {status}: {}", stderr.trim())
        };
        return Err(ToolError::fatal(reason));
    }

    Ok(ToolResult {
        output: stdout,
        metadata: json!({"stderr": stderr, "status": status.code()}),
    })
}

async fn run_git(
    workspace: &Path,
    git_args: &[&str],
    cancel: CancellationToken,
) -> Result<ToolResult, ToolError> {
    let mut command = Command::new("git");
    command
        .args(git_args)
        .current_dir(workspace)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    run_child(command, cancel).await
}

struct GitStatusTool;

#[async_trait]
impl Tool for GitStatusTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "git_status",
            kind: ToolKind::GitRead,
            access: ToolAccess::ReadOnly,
            description: "Show pending workspace changes",
        }
    }

    fn resource_paths(&self, _args: &Value) -> Vec<String> {
        Vec::new()
    }

    async fn execute(
        &self,
        workspace: &Path,
        _args: Value,
        cancel: CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        run_git(workspace, &["status", "--porcelain"], cancel).await
    }
}

struct GitDiffTool;

#[async_trait]
impl Tool for GitDiffTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "git_diff",
            kind: ToolKind::GitRead,
            access: ToolAccess::ReadOnly,
            description: "Show unstaged changes, optionally for one path",
        }
    }

    async fn execute(
        &self,
        workspace: &Path,
        args: Value,
        cancel: CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        match args.get("path").and_then(|p| p.as_str()) {
            Some(path) => {
                resolve_workspace_path(workspace, path)?;
                run_git(workspace, &["diff", "--", path], cancel).await
            }
            None => run_git(workspace, &["diff"], cancel).await,
        }
    }
}

struct GitAddTool;

#[async_trait]
impl Tool for GitAddTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "git_add",
            kind: ToolKind::GitWrite,
            access: ToolAccess::Mutating,
            description: "Stage workspace paths",
        }
    }

    fn resource_paths(&self, args: &Value) -> Vec<String> {
        args.get("paths")
            .and_then(|v| v.as_array())
            .map(|paths| {
                paths
                    .iter()
                    .filter_map(|p| p.as_str().map(ToString::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn execute(
        &self,
        workspace: &Path,
        args: Value,
        cancel: CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        let paths: Vec<String> = self.resource_paths(&args);
        if paths.is_empty() {
            return Err(ToolError::fatal("missing required argument `paths`"));
        }
        for path in &paths {
            resolve_workspace_path(workspace, path)?;
        }
        let mut git_args = vec!["add", "--"];
        git_args.extend(paths.iter().map(String::as_str));
        run_git(workspace, &git_args, cancel).await
    }
}

struct GitCommitTool;

#[async_trait]
impl Tool for GitCommitTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "git_commit",
            kind: ToolKind::GitWrite,
            access: ToolAccess::Mutating,
            description: "Commit staged changes",
        }
    }

    fn resource_paths(&self, _args: &Value) -> Vec<String> {
        Vec::new()
    }

    async fn execute(
        &self,
        workspace: &Path,
        args: Value,
        cancel: CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        let message = require_str(&args, "message")?;
        run_git(workspace, &["commit", "-m", message], cancel).await
    }
}
