//! Wire types for the machines control plane.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateMachineReq {
    pub config: MachineConfig,
    pub region: String,
    pub name: String,
    pub skip_launch: bool,
    pub lease_ttl: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<Init>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub auto_destroy: bool,
    #[serde(default)]
    pub restart: Restart,
    #[serde(default)]
    pub guest: Guest,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Init {
    #[serde(default)]
    pub exec: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Service {
    pub protocol: String,
    pub internal_port: u16,
    #[serde(default)]
    pub autostop: bool,
    #[serde(default)]
    pub autostart: bool,
    #[serde(default)]
    pub min_machines_running: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<Port>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Port {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handlers: Vec<String>,
    #[serde(default)]
    pub force_https: bool,
}

fn is_zero(port: &u16) -> bool {
    *port == 0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Restart {
    #[serde(default)]
    pub policy: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Guest {
    #[serde(default)]
    pub cpu_kind: String,
    #[serde(default)]
    pub cpus: u32,
    #[serde(default)]
    pub memory_mb: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineResp {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub private_ip: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub config: MachineConfig,
    #[serde(default)]
    pub nonce: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaseReq {
    pub description: String,
    pub ttl: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaseResp {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub data: LeaseData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaseData {
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub expires_at: i64,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartResp {
    #[serde(default)]
    pub previous_state: String,
    #[serde(default)]
    pub migrated: bool,
    #[serde(default)]
    pub new_host: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OkResp {
    #[serde(default)]
    pub ok: bool,
}
