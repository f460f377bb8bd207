//! Proxy node descriptions and their stable identity.

pub mod filter;
pub mod loader;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for node identities. Changing it changes every `NodeId`.
const NODE_NAMESPACE: Uuid = Uuid::from_u128(0x6f1d_3c2a_8b4e_4f0a_9c1d_52e7_a3b8_0d44);

/// Proxy protocol spoken by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[serde(alias = "ss")]
    Shadowsocks,
    #[serde(alias = "ssr")]
    ShadowsocksR,
    #[serde(alias = "vmess", alias = "vless")]
    V2Ray,
    Trojan,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Shadowsocks => write!(f, "ss"),
            Protocol::ShadowsocksR => write!(f, "ssr"),
            Protocol::V2Ray => write!(f, "v2ray"),
            Protocol::Trojan => write!(f, "trojan"),
        }
    }
}

/// Stable identity of a node, derived from its connection-relevant fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell nodes apart in logs.
        let s = self.0.simple().to_string();
        f.write_str(&s[..12])
    }
}

/// One proxy node as supplied by the node list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub protocol: Protocol,
    pub server: String,
    pub server_port: u16,
    #[serde(default)]
    pub password: String,
    /// Cipher for SS/SSR, security for VMess.
    #[serde(default)]
    pub method: String,
    /// Protocol-specific settings (SSR obfs, V2Ray uuid/network/tls, ...).
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub remarks: String,
}

/// Length-prefixed, so no field content can be mistaken for a boundary.
fn push_field(key: &mut Vec<u8>, field: &[u8]) {
    key.extend_from_slice(&(field.len() as u32).to_be_bytes());
    key.extend_from_slice(field);
}

impl NodeConfig {
    /// Identity over everything that affects the connection. Group and
    /// remarks are display-only and do not participate.
    pub fn id(&self) -> NodeId {
        let mut key = Vec::with_capacity(128);
        push_field(&mut key, self.protocol.to_string().as_bytes());
        push_field(&mut key, self.server.as_bytes());
        push_field(&mut key, &self.server_port.to_be_bytes());
        push_field(&mut key, self.password.as_bytes());
        push_field(&mut key, self.method.as_bytes());
        key.extend_from_slice(&(self.params.len() as u32).to_be_bytes());
        for (k, v) in &self.params {
            push_field(&mut key, k.as_bytes());
            push_field(&mut key, v.as_bytes());
        }
        NodeId(Uuid::new_v5(&NODE_NAMESPACE, &key))
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Label used in logs and console output.
    pub fn label(&self) -> String {
        if self.remarks.is_empty() {
            format!("{}:{}", self.server, self.server_port)
        } else {
            self.remarks.clone()
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_node(server: &str, port: u16) -> NodeConfig {
    NodeConfig {
        protocol: Protocol::Shadowsocks,
        server: server.to_string(),
        server_port: port,
        password: "secret".to_string(),
        method: "aes-256-gcm".to_string(),
        params: BTreeMap::new(),
        group: "default".to_string(),
        remarks: format!("{}-{}", server, port),
    }
}
