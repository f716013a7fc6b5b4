//! Filesystem tools, confined to a workspace root.

use std::path::PathBuf;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::Value;

use crate::{Tool, ToolCategory, ToolParam, ToolSpec, arg_usize, required_str};

/// Find the largest byte offset ≤ `max` that falls on a UTF-8 character
/// boundary.  Safe to use as `&s[..truncate_byte_boundary(s, max)]`.
pub fn truncate_byte_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

// ── read_file ────────────────────────────────────────────────────────────────

pub struct ReadFileTool {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl Tool for ReadFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "read_file".to_string(),
            description: "Read the contents of a file within the workspace.".to_string(),
            category: ToolCategory::Filesystem,
            params: vec![
                ToolParam::required("path", "Relative path from workspace root"),
                ToolParam::optional("max_bytes", "Maximum bytes to read (default: 65536)"),
            ],
        }
    }

    async fn run(&self, args: &Value) -> Result<String> {
        let rel_path = required_str(args, "path")?;
        let max_bytes = arg_usize(args, "max_bytes", 65536);

        let full = self.workspace_root.join(rel_path);
        let canonical = full
            .canonicalize()
            .map_err(|e| anyhow::anyhow!("cannot resolve path '{rel_path}': {e}"))?;
        let root_canonical = self.workspace_root.canonicalize()?;
        if !canonical.starts_with(&root_canonical) {
            bail!("path escapes workspace boundary: {}", canonical.display());
        }

        let content = std::fs::read_to_string(&canonical)?;
        if content.len() > max_bytes {
            let end = truncate_byte_boundary(&content, max_bytes);
            Ok(format!("{}…[truncated at {max_bytes} bytes]", &content[..end]))
        } else {
            Ok(content)
        }
    }
}

// ── write_file ───────────────────────────────────────────────────────────────

pub struct WriteFileTool {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl Tool for WriteFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "write_file".to_string(),
            description: "Write content to a file within the workspace (creates or overwrites)."
                .to_string(),
            category: ToolCategory::Filesystem,
            params: vec![
                ToolParam::required("path", "Relative path from workspace root"),
                ToolParam::required("content", "File content to write"),
            ],
        }
    }

    async fn run(&self, args: &Value) -> Result<String> {
        let rel_path = required_str(args, "path")?;
        let content = required_str(args, "content")?;

        let full = self.workspace_root.join(rel_path);
        let root_canonical = self.workspace_root.canonicalize()?;
        if let Ok(canonical) = full.canonicalize() {
            if !canonical.starts_with(&root_canonical) {
                bail!("path escapes workspace boundary: {}", canonical.display());
            }
        } else {
            // File doesn't exist yet; check the parent instead.
            let parent = full.parent().ok_or_else(|| anyhow::anyhow!("invalid path"))?;
            std::fs::create_dir_all(parent)?;
            let parent_canonical = parent.canonicalize()?;
            if !parent_canonical.starts_with(&root_canonical) {
                bail!("parent escapes workspace boundary: {}", parent_canonical.display());
            }
        }

        std::fs::write(&full, content)?;
        Ok(format!("File written: {rel_path}"))
    }
}

// ── list_directory ───────────────────────────────────────────────────────────

pub struct ListDirectoryTool {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "list_directory".to_string(),
            description: "List files and folders in a workspace directory.".to_string(),
            category: ToolCategory::Filesystem,
            params: vec![ToolParam::optional("path", "Relative path from workspace root (default: .)")],
        }
    }

    async fn run(&self, args: &Value) -> Result<String> {
        let rel_path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let full = self.workspace_root.join(rel_path);
        let canonical = full
            .canonicalize()
            .map_err(|e| anyhow::anyhow!("cannot resolve path '{rel_path}': {e}"))?;
        let root_canonical = self.workspace_root.canonicalize()?;
        if !canonical.starts_with(&root_canonical) {
            bail!("path escapes workspace boundary: {}", canonical.display());
        }

        let mut names: Vec<String> = std::fs::read_dir(&canonical)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        Ok(names.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn read_write_roundtrip_within_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let write = WriteFileTool { workspace_root: dir.path().to_path_buf() };
        let read = ReadFileTool { workspace_root: dir.path().to_path_buf() };

        let out = write
            .run(&json!({"path": "notes/today.txt", "content": "hello"}))
            .await
            .unwrap();
        assert_eq!(out, "File written: notes/today.txt");

        let content = read.run(&json!({"path": "notes/today.txt"})).await.unwrap();
        assert_eq!(content, "hello");
    }

    #[tokio::test]
    async fn path_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let read = ReadFileTool { workspace_root: dir.path().to_path_buf() };
        let result = read.run(&json!({"path": "../../etc/hostname"})).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn list_directory_sorts_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        let list = ListDirectoryTool { workspace_root: dir.path().to_path_buf() };
        let out = list.run(&json!({})).await.unwrap();
        assert_eq!(out, "a.txt\nb.txt");
    }

    #[test]
    fn byte_boundary_never_splits_a_char() {
        let s = "żółć";
        for max in 0..=s.len() {
            let end = truncate_byte_boundary(s, max);
            assert!(s.is_char_boundary(end));
        }
    }
}
