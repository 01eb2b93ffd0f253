//! ImageSource - Trait for local image stores.
//!
//! The push path needs an image's root filesystem, its build history, and a
//! saved archive; the decrypt path loads a rebuilt archive back. [`DockerCli`]
//! provides these through the `docker` command line.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use imgcrypt_core::error::{CryptError, Result};
use serde::Deserialize;
use tokio::process::Command;

use super::select::HistoryEntry;

/// Identity and root filesystem of a local image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInspect {
    pub id: String,
    pub repo_tags: Vec<String>,
    /// Base-to-top order
    pub diff_ids: Vec<String>,
}

/// A store of local images.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Resolve a reference or ID to the image's identity and layers.
    async fn inspect(&self, reference: &str) -> Result<ImageInspect>;

    /// Build history, most recent entry first.
    async fn history(&self, reference: &str) -> Result<Vec<HistoryEntry>>;

    /// Write the image as a `docker save` tar archive.
    async fn save(&self, id: &str, dest: &Path) -> Result<()>;

    /// Import a `docker save` tar archive.
    async fn load(&self, archive: &Path) -> Result<()>;
}

/// [`ImageSource`] backed by the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: PathBuf,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        tracing::debug!(program = %self.program.display(), ?args, "Running image source command");

        let output = Command::new(&self.program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                CryptError::ImageSourceError(format!(
                    "Failed to run {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(CryptError::ImageSourceError(format!(
                "{} {} failed ({}): {}",
                self.program.display(),
                args.first().copied().unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        String::from_utf8(output.stdout)
            .map_err(|e| CryptError::ImageSourceError(format!("non-UTF-8 output: {}", e)))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectJson {
    id: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    #[serde(rename = "RootFS")]
    root_fs: RootFsJson,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RootFsJson {
    #[serde(default)]
    layers: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HistoryJson {
    #[serde(rename = "ID")]
    id: String,
    created_by: String,
    size: SizeJson,
}

/// `docker history --human=false` prints sizes as strings; the API uses numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum SizeJson {
    Number(i64),
    Text(String),
}

impl SizeJson {
    fn bytes(&self) -> Result<i64> {
        match self {
            SizeJson::Number(n) => Ok(*n),
            SizeJson::Text(s) => s.trim().parse().map_err(|_| {
                CryptError::ImageSourceError(format!("unexpected history size '{}'", s))
            }),
        }
    }
}

fn parse_inspect(output: &str) -> Result<ImageInspect> {
    // `--format '{{json .}}'` prints one object; plain `inspect` prints an array.
    let trimmed = output.trim();
    let parsed: InspectJson = if trimmed.starts_with('[') {
        let mut all: Vec<InspectJson> = serde_json::from_str(trimmed)?;
        if all.is_empty() {
            return Err(CryptError::ImageSourceError("image not found".to_string()));
        }
        all.swap_remove(0)
    } else {
        serde_json::from_str(trimmed)?
    };

    Ok(ImageInspect {
        id: parsed.id,
        repo_tags: parsed.repo_tags.unwrap_or_default(),
        diff_ids: parsed.root_fs.layers,
    })
}

fn parse_history(output: &str) -> Result<Vec<HistoryEntry>> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| -> Result<HistoryEntry> {
            let h: HistoryJson = serde_json::from_str(line)?;
            Ok(HistoryEntry::new(h.id, h.created_by, h.size.bytes()?))
        })
        .collect()
}

#[async_trait]
impl ImageSource for DockerCli {
    async fn inspect(&self, reference: &str) -> Result<ImageInspect> {
        let out = self
            .run(&["image", "inspect", "--format", "{{json .}}", reference])
            .await?;
        parse_inspect(&out)
    }

    async fn history(&self, reference: &str) -> Result<Vec<HistoryEntry>> {
        let out = self
            .run(&[
                "image",
                "history",
                "--no-trunc",
                "--human=false",
                "--format",
                "{{json .}}",
                reference,
            ])
            .await?;
        parse_history(&out)
    }

    async fn save(&self, id: &str, dest: &Path) -> Result<()> {
        let dest = dest.to_string_lossy();
        self.run(&["image", "save", "--output", &dest, id]).await?;
        tracing::debug!(image = id, archive = %dest, "Saved image");
        Ok(())
    }

    async fn load(&self, archive: &Path) -> Result<()> {
        let archive = archive.to_string_lossy();
        let out = self.run(&["image", "load", "--input", &archive]).await?;
        tracing::info!(archive = %archive, output = out.trim(), "Loaded image");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inspect_object() {
        let out = r#"{"Id":"sha256:abc","RepoTags":["org/app:v1"],"RootFS":{"Type":"layers","Layers":["sha256:l0","sha256:l1"]}}"#;
        let inspect = parse_inspect(out).unwrap();
        assert_eq!(inspect.id, "sha256:abc");
        assert_eq!(inspect.repo_tags, vec!["org/app:v1"]);
        assert_eq!(inspect.diff_ids, vec!["sha256:l0", "sha256:l1"]);
    }

    #[test]
    fn test_parse_inspect_array() {
        let out = r#"[{"Id":"sha256:abc","RepoTags":null,"RootFS":{"Layers":["sha256:l0"]}}]"#;
        let inspect = parse_inspect(out).unwrap();
        assert!(inspect.repo_tags.is_empty());
        assert_eq!(inspect.diff_ids.len(), 1);
        assert!(parse_inspect("[]").is_err());
    }

    #[test]
    fn test_parse_history_lines() {
        let out = concat!(
            r#"{"ID":"sha256:top","CreatedBy":"/bin/sh -c #(nop)  CMD [\"app\"]","Size":"0"}"#,
            "\n",
            r#"{"ID":"<missing>","CreatedBy":"/bin/sh -c make","Size":"2048"}"#,
            "\n\n",
            r#"{"ID":"<missing>","CreatedBy":"ADD rootfs","Size":512}"#,
            "\n"
        );
        let hist = parse_history(out).unwrap();
        assert_eq!(hist.len(), 3);
        assert_eq!(hist[0].size, 0);
        assert_eq!(hist[1].size, 2048);
        assert_eq!(hist[2].size, 512);
        assert_eq!(hist[2].created_by, "ADD rootfs");
    }

    #[test]
    fn test_parse_history_bad_size() {
        let out = r#"{"ID":"x","CreatedBy":"y","Size":"5.6MB"}"#;
        assert!(parse_history(out).is_err());
    }

    #[tokio::test]
    async fn test_docker_cli_missing_binary() {
        let cli = DockerCli::new("/nonexistent/docker-binary");
        let err = cli.inspect("alpine").await.unwrap_err();
        assert!(matches!(err, CryptError::ImageSourceError(_)));
    }
}
