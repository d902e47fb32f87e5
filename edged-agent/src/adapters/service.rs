//! Container service adapter: drives an OCI runtime binary.
//!
//! Each service gets a bundle directory with a generated `config.json`;
//! lifecycle is `create`/`start`/`kill`/`delete` subcommands of the runtime
//! (youki-compatible CLI).

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use edged_reconciler::{ManagedResource, ResourceAdapter};

use crate::manifest::ServiceSpec;

pub struct ServiceAdapter {
    runtime_path: PathBuf,
    bundles_dir: PathBuf,
}

impl ServiceAdapter {
    pub fn new(runtime_path: PathBuf, bundles_dir: PathBuf) -> Self {
        Self {
            runtime_path,
            bundles_dir,
        }
    }

    /// Run a short-lived runtime command; non-zero exit becomes an error
    /// carrying stderr.
    async fn run_runtime(&self, args: &[&str]) -> Result<()> {
        debug!(
            "Executing {} {}",
            self.runtime_path.display(),
            args.join(" ")
        );

        let output = Command::new(&self.runtime_path)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", self.runtime_path.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "runtime {} exited with {}: {}",
                args.join(" "),
                output.status,
                stderr.trim()
            );
        }

        Ok(())
    }

    async fn container_exists(&self, id: &str) -> bool {
        self.run_runtime(&["state", id]).await.is_ok()
    }

    fn bundle_path(&self, id: &str) -> PathBuf {
        self.bundles_dir.join(id)
    }

    async fn create_and_start(&self, spec: &ServiceSpec) -> Result<()> {
        let bundle = self.bundle_path(&spec.id);
        write_bundle(&bundle, spec).await?;

        let bundle_str = bundle.to_string_lossy();
        self.run_runtime(&["create", "--bundle", &bundle_str, &spec.id])
            .await?;
        self.run_runtime(&["start", &spec.id]).await?;

        info!(id = %spec.id, name = %spec.name, "Service started");
        Ok(())
    }

    async fn teardown(&self, id: &str) -> Result<()> {
        // kill fails for an already-stopped container; delete --force is
        // what decides.
        if let Err(e) = self.run_runtime(&["kill", id, "SIGTERM"]).await {
            debug!(id = %id, error = %e, "Kill failed (container may be stopped)");
        }
        self.run_runtime(&["delete", "--force", id]).await?;

        let bundle = self.bundle_path(id);
        if let Err(e) = fs::remove_dir_all(&bundle).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(id = %id, error = %e, "Failed to remove bundle directory");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceAdapter for ServiceAdapter {
    async fn create(&self, resource: &ManagedResource) -> Result<()> {
        let spec: ServiceSpec =
            serde_json::from_value(resource.spec.clone()).context("Invalid service spec")?;

        // A same-id container means a previous agent run died before
        // pruning; replace it with the declared spec.
        if self.container_exists(&resource.id).await {
            warn!(id = %resource.id, "Container already exists, replacing");
            self.teardown(&resource.id).await?;
        }

        self.create_and_start(&spec).await
    }

    async fn update(&self, resource: &ManagedResource) -> Result<()> {
        let spec: ServiceSpec =
            serde_json::from_value(resource.spec.clone()).context("Invalid service spec")?;

        // Updates always carry the full new spec, so replace wholesale.
        if self.container_exists(&resource.id).await {
            self.teardown(&resource.id).await?;
        }
        self.create_and_start(&spec).await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        if !self.container_exists(id).await {
            debug!(id = %id, "Container already absent");
            let bundle = self.bundle_path(id);
            let _ = fs::remove_dir_all(&bundle).await;
            return Ok(());
        }
        self.teardown(id).await?;
        info!(id = %id, "Service removed");
        Ok(())
    }
}

async fn write_bundle(bundle: &Path, spec: &ServiceSpec) -> Result<()> {
    let oci = OciSpec::new(spec)?;
    let config = serde_json::to_string_pretty(&oci).context("Failed to serialize OCI spec")?;

    fs::create_dir_all(bundle)
        .await
        .with_context(|| format!("Failed to create bundle directory {}", bundle.display()))?;
    fs::write(bundle.join("config.json"), config)
        .await
        .context("Failed to write OCI config")?;

    Ok(())
}

/// Minimal OCI runtime spec.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OciSpec {
    oci_version: String,
    root: Root,
    process: Process,
    hostname: String,
    mounts: Vec<Mount>,
    linux: Linux,
}

#[derive(Debug, Serialize, Deserialize)]
struct Root {
    path: String,
    readonly: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct Process {
    terminal: bool,
    user: User,
    args: Vec<String>,
    env: Vec<String>,
    cwd: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct User {
    uid: u32,
    gid: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Mount {
    destination: String,
    #[serde(rename = "type")]
    mount_type: String,
    source: String,
    options: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Linux {
    namespaces: Vec<Namespace>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Namespace {
    #[serde(rename = "type")]
    ns_type: String,
}

impl OciSpec {
    fn new(spec: &ServiceSpec) -> Result<Self> {
        let mut args = spec.command.clone();
        args.extend(spec.args.clone());
        if args.is_empty() {
            bail!("Service {} declares no command", spec.id);
        }

        let mut env = vec![
            "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
        ];
        env.extend(spec.env.clone());

        let cwd = if spec.working_dir.is_empty() {
            "/".to_string()
        } else {
            spec.working_dir.clone()
        };

        Ok(OciSpec {
            oci_version: "1.0.2".to_string(),
            root: Root {
                path: spec.image.clone(),
                readonly: false,
            },
            process: Process {
                terminal: false,
                user: User { uid: 0, gid: 0 },
                args,
                env,
                cwd,
            },
            hostname: spec.name.clone(),
            mounts: vec![
                Mount {
                    destination: "/proc".to_string(),
                    mount_type: "proc".to_string(),
                    source: "proc".to_string(),
                    options: vec![],
                },
                Mount {
                    destination: "/dev".to_string(),
                    mount_type: "tmpfs".to_string(),
                    source: "tmpfs".to_string(),
                    options: vec![
                        "nosuid".to_string(),
                        "strictatime".to_string(),
                        "mode=755".to_string(),
                        "size=65536k".to_string(),
                    ],
                },
                Mount {
                    destination: "/tmp".to_string(),
                    mount_type: "tmpfs".to_string(),
                    source: "tmpfs".to_string(),
                    options: vec![
                        "nosuid".to_string(),
                        "nodev".to_string(),
                        "mode=1777".to_string(),
                    ],
                },
            ],
            linux: Linux {
                namespaces: vec![
                    Namespace {
                        ns_type: "pid".to_string(),
                    },
                    Namespace {
                        ns_type: "ipc".to_string(),
                    },
                    Namespace {
                        ns_type: "uts".to_string(),
                    },
                    Namespace {
                        ns_type: "mount".to_string(),
                    },
                ],
            },
        })
    }
}
