//! Manager configuration generation.
//!
//! Written as indented JSON before every manager start so the manager always
//! sees the freshest artifact tag and a newly chosen status port.

use std::io;
use std::net::{Ipv4Addr, TcpListener};
use std::path::Path;

use serde::Serialize;

use crate::artifacts::ArtifactLayout;
use crate::config::Config;
use crate::layout::WorkspaceLayout;

/// Configuration consumed by the manager binary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagerConfig {
    pub name: String,
    pub hub_addr: String,
    pub hub_key: String,
    pub dashboard_addr: String,
    pub dashboard_key: String,
    pub http: String,
    pub rpc: String,
    pub workdir: String,
    pub vmlinux: String,
    pub tag: String,
    pub syzkaller: String,
    #[serde(rename = "type")]
    pub vm_type: String,
    pub machine_type: String,
    pub count: u32,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sshkey: Option<String>,
    pub sandbox: String,
    pub procs: u32,
    pub enable_syscalls: Vec<String>,
    pub disable_syscalls: Vec<String>,
    pub cover: bool,
    pub reproduce: bool,
}

impl ManagerConfig {
    /// Build the manager config for a fresh start on `http_port`.
    pub fn generate(
        cfg: &Config,
        workspace: &WorkspaceLayout,
        http_port: u16,
    ) -> io::Result<Self> {
        let artifacts: ArtifactLayout = workspace.artifacts();
        let tag = artifacts.read_tag().map_err(|e| {
            io::Error::new(e.kind(), format!("failed to read tag file: {e}"))
        })?;

        Ok(Self {
            name: cfg.name.clone(),
            hub_addr: cfg.hub_addr.clone(),
            hub_key: cfg.hub_key.clone(),
            dashboard_addr: cfg.dashboard_addr.clone(),
            dashboard_key: cfg.dashboard_key.clone(),
            http: format!(":{http_port}"),
            rpc: ":0".to_string(),
            workdir: workspace.relative(&workspace.manager_workdir()),
            vmlinux: workspace.relative(&artifacts.vmlinux_path()),
            tag,
            syzkaller: workspace.relative(&workspace.syzkaller_dir()),
            vm_type: "gce".to_string(),
            machine_type: cfg.machine_type.clone(),
            count: cfg.machine_count,
            image: cfg.image_name.clone(),
            sshkey: artifacts.ssh_key().map(|p| workspace.relative(&p)),
            sandbox: cfg.sandbox.clone(),
            procs: cfg.procs,
            enable_syscalls: cfg.enable_syscalls.clone(),
            disable_syscalls: cfg.disable_syscalls.clone(),
            cover: true,
            reproduce: true,
        })
    }

    /// Write the config as tab-indented JSON.
    pub fn write(&self, path: &Path) -> io::Result<()> {
        let mut data = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
        let mut ser = serde_json::Serializer::with_formatter(&mut data, formatter);
        self.serialize(&mut ser).map_err(io::Error::other)?;
        std::fs::write(path, data)
    }
}

/// Pick a currently unused local TCP port.
pub fn choose_unused_port() -> io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    Ok(listener.local_addr()?.port())
}
