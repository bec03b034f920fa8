//! Seam to the external clone tooling.

use std::future::Future;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::pin::Pin;

use anyhow::{Context, bail};
use serde::Serialize;
use tracing::debug;

use longterm_core::config::CloneConfig;
use longterm_core::{TagSet, join_tags};

/// Identity, address, and tags for one machine to be cloned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloneRequest {
    pub name: String,
    pub ip: Ipv4Addr,
    pub tags: TagSet,
}

/// Boxed future returned by [`CloneTool::clone_machine`].
pub type CloneFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

/// Creates a new virtual machine from a base image.
///
/// Injected into the provisioner so tests can stand in for the real tool.
pub trait CloneTool: Send + Sync {
    fn clone_machine<'a>(&'a self, request: &'a CloneRequest) -> CloneFuture<'a>;
}

/// Runs `vmcloak-clone` to clone the bird image into a fresh machine.
#[derive(Debug, Clone)]
pub struct VmcloakClone {
    command: String,
    bird: String,
    cuckoo_root: PathBuf,
}

impl VmcloakClone {
    pub fn new(command: impl Into<String>, bird: impl Into<String>, cuckoo_root: PathBuf) -> Self {
        Self {
            command: command.into(),
            bird: bird.into(),
            cuckoo_root,
        }
    }

    /// Build from the `[clone]` section. A missing `cuckoo_root` means the
    /// current directory.
    pub fn from_config(config: &CloneConfig) -> anyhow::Result<Self> {
        let root = match &config.cuckoo_root {
            Some(root) => root.clone(),
            None => std::env::current_dir().context("failed to resolve current directory")?,
        };
        Ok(Self::new(&config.command, &config.bird, root))
    }

    /// Command-line arguments for one clone.
    pub fn args(&self, request: &CloneRequest) -> Vec<String> {
        vec![
            "-r".to_string(),
            "--bird".to_string(),
            self.bird.clone(),
            "--hostonly-ip".to_string(),
            request.ip.to_string(),
            "--cuckoo".to_string(),
            self.cuckoo_root.display().to_string(),
            request.name.clone(),
            "--tags".to_string(),
            join_tags(&request.tags),
        ]
    }
}

impl CloneTool for VmcloakClone {
    fn clone_machine<'a>(&'a self, request: &'a CloneRequest) -> CloneFuture<'a> {
        Box::pin(async move {
            let args = self.args(request);
            debug!(command = %self.command, ?args, "running clone tool");

            let output = tokio::process::Command::new(&self.command)
                .args(&args)
                .output()
                .await
                .with_context(|| format!("failed to run {}", self.command))?;

            if !output.status.success() {
                bail!(
                    "{} exited with {}: {}",
                    self.command,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use longterm_core::parse_tags;

    fn request() -> CloneRequest {
        CloneRequest {
            name: "egg04".to_string(),
            ip: Ipv4Addr::new(192, 168, 56, 6),
            tags: parse_tags("longterm"),
        }
    }

    #[test]
    fn args_follow_vmcloak_layout() {
        let tool = VmcloakClone::new("vmcloak-clone", "bird0", PathBuf::from("/opt/cuckoo"));
        assert_eq!(
            tool.args(&request()),
            vec![
                "-r",
                "--bird",
                "bird0",
                "--hostonly-ip",
                "192.168.56.6",
                "--cuckoo",
                "/opt/cuckoo",
                "egg04",
                "--tags",
                "longterm",
            ]
        );
    }

    #[test]
    fn from_config_uses_configured_root() {
        let config = CloneConfig {
            command: "clone-it".to_string(),
            bird: "win7x64".to_string(),
            cuckoo_root: Some(PathBuf::from("/srv/cuckoo")),
        };
        let tool = VmcloakClone::from_config(&config).unwrap();
        let args = tool.args(&request());
        assert_eq!(tool.command, "clone-it");
        assert_eq!(args[2], "win7x64");
        assert_eq!(args[6], "/srv/cuckoo");
    }

    #[tokio::test]
    async fn missing_command_is_an_error() {
        let tool = VmcloakClone::new(
            "longterm-no-such-clone-tool",
            "bird0",
            PathBuf::from("/tmp"),
        );
        let err = tool.clone_machine(&request()).await.unwrap_err();
        assert!(err.to_string().contains("failed to run"));
    }
}
