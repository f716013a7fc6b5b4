//! Python snippet execution with the artifacts convention.
//!
//! Each invocation gets its own working directory under the artifacts root.
//! Images saved there become URLs appended to the output as
//! `[ARTIFACTS:url1,url2]` so the caller can render them out-of-band.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::{Tool, ToolCategory, ToolParam, ToolSpec, format_artifacts_marker, required_str};

/// Wall-clock limit for one snippet.
const CODE_TIMEOUT: Duration = Duration::from_secs(60);

/// Image extensions picked up as artifacts.
const ARTIFACT_EXTENSIONS: &[&str] = &["png", "jpg", "svg"];

pub struct RunPythonCodeTool {
    /// Root directory where per-invocation working dirs are created.
    pub artifacts_dir: PathBuf,
    /// Public base URL the artifact file server exposes `artifacts_dir` under.
    pub artifacts_base_url: String,
}

#[async_trait]
impl Tool for RunPythonCodeTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "run_python_code".to_string(),
            description: "Execute Python code and return the output. Use for calculations, \
                          data processing, plotting charts. IMPORTANT FOR CHARTS: save charts \
                          with plt.savefig('chart.png'); they will be displayed automatically."
                .to_string(),
            category: ToolCategory::Code,
            params: vec![ToolParam::required("code", "Python source to execute")],
        }
    }

    async fn run(&self, args: &Value) -> Result<String> {
        let code = required_str(args, "code")?;

        let invocation_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let work_dir = self.artifacts_dir.join(&invocation_id);
        std::fs::create_dir_all(&work_dir)?;

        // Force a headless matplotlib backend so plotting never blocks on a
        // display server.
        let wrapped = format!("import matplotlib;matplotlib.use('Agg')\n{code}");

        info!(%invocation_id, code_len = code.len(), "running python snippet");
        let result = tokio::time::timeout(
            CODE_TIMEOUT,
            tokio::process::Command::new("python3")
                .arg("-c")
                .arg(&wrapped)
                .current_dir(&work_dir)
                .output(),
        )
        .await;

        let mut output = match result {
            Err(_) => {
                warn!(%invocation_id, "python snippet timed out");
                format!("Error: execution timed out after {}s", CODE_TIMEOUT.as_secs())
            }
            Ok(Err(err)) => format!("Error: failed to launch python3: {err}"),
            Ok(Ok(out)) => {
                if out.status.success() {
                    String::from_utf8_lossy(&out.stdout).to_string()
                } else {
                    format!("Error: {}", String::from_utf8_lossy(&out.stderr))
                }
            }
        };

        let artifacts = self.collect_artifacts(&invocation_id, &work_dir);
        if !artifacts.is_empty() {
            output.push('\n');
            output.push_str(&format_artifacts_marker(&artifacts));
        }

        if output.trim().is_empty() {
            output = "Code executed successfully (no output)".to_string();
        }
        Ok(output)
    }
}

impl RunPythonCodeTool {
    fn collect_artifacts(&self, invocation_id: &str, work_dir: &PathBuf) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(work_dir) else { return Vec::new() };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                let ext = name.rsplit('.').next().unwrap_or_default().to_lowercase();
                ARTIFACT_EXTENSIONS.contains(&ext.as_str()).then_some(name)
            })
            .collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                format!(
                    "{}/artifacts/{invocation_id}/{name}",
                    self.artifacts_base_url.trim_end_matches('/'),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(dir: &std::path::Path) -> RunPythonCodeTool {
        RunPythonCodeTool {
            artifacts_dir: dir.to_path_buf(),
            artifacts_base_url: "http://localhost:8000".to_string(),
        }
    }

    #[test]
    fn artifact_urls_are_namespaced_by_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("ab12cd34");
        std::fs::create_dir_all(&work).unwrap();
        std::fs::write(work.join("chart.png"), b"png").unwrap();
        std::fs::write(work.join("notes.txt"), b"txt").unwrap();
        std::fs::write(work.join("fig.svg"), b"svg").unwrap();

        let urls = tool(dir.path()).collect_artifacts("ab12cd34", &work);
        assert_eq!(
            urls,
            vec![
                "http://localhost:8000/artifacts/ab12cd34/chart.png".to_string(),
                "http://localhost:8000/artifacts/ab12cd34/fig.svg".to_string(),
            ]
        );
    }

    #[test]
    fn missing_code_param_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let t = tool(dir.path());
        let err = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(t.run(&serde_json::json!({})))
            .unwrap_err();
        assert!(err.to_string().contains("missing required param: code"));
    }
}
