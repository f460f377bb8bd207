//! Per-client configuration files.
//!
//! Each client kind reads a different JSON layout. Only the fields the kind
//! understands are taken from the node; everything listens on
//! `127.0.0.1:<local_port>` as a SOCKS5 endpoint.

use serde_json::{json, Value};

use super::{ClientError, ClientKind};
use crate::node::NodeConfig;

const LOCAL_ADDRESS: &str = "127.0.0.1";

/// Render the configuration file contents for `kind`.
pub fn client_config(kind: ClientKind, node: &NodeConfig, local_port: u16) -> Result<Value, ClientError> {
    match kind {
        ClientKind::Shadowsocks => Ok(shadowsocks(node, local_port)),
        ClientKind::ShadowsocksR => Ok(shadowsocksr(node, local_port)),
        ClientKind::V2Ray => v2ray(node, local_port),
        ClientKind::Trojan => Ok(trojan(node, local_port)),
    }
}

/// Command line arguments for `kind` given the config file path.
pub fn client_args(kind: ClientKind, config_path: &str) -> Vec<String> {
    match kind {
        ClientKind::Shadowsocks | ClientKind::ShadowsocksR => {
            vec!["-c".to_string(), config_path.to_string()]
        }
        ClientKind::Trojan => vec!["-config".to_string(), config_path.to_string()],
        ClientKind::V2Ray => vec!["run".to_string(), "-c".to_string(), config_path.to_string()],
    }
}

fn shadowsocks(node: &NodeConfig, local_port: u16) -> Value {
    let mut cfg = json!({
        "server": node.server,
        "server_port": node.server_port,
        "local_address": LOCAL_ADDRESS,
        "local_port": local_port,
        "password": node.password,
        "method": node.method,
        "timeout": 60,
    });
    if let Some(plugin) = node.param("plugin") {
        cfg["plugin"] = json!(plugin);
        cfg["plugin_opts"] = json!(node.param("plugin_opts").unwrap_or_default());
    }
    cfg
}

fn shadowsocksr(node: &NodeConfig, local_port: u16) -> Value {
    json!({
        "server": node.server,
        "server_port": node.server_port,
        "local_address": LOCAL_ADDRESS,
        "local_port": local_port,
        "password": node.password,
        "method": node.method,
        "protocol": node.param("protocol").unwrap_or("origin"),
        "protocol_param": node.param("protocol_param").unwrap_or_default(),
        "obfs": node.param("obfs").unwrap_or("plain"),
        "obfs_param": node.param("obfs_param").unwrap_or_default(),
        "timeout": 60,
    })
}

fn v2ray(node: &NodeConfig, local_port: u16) -> Result<Value, ClientError> {
    let id = node
        .param("id")
        .or_else(|| node.param("uuid"))
        .ok_or_else(|| ClientError::Config("v2ray node has no user id".to_string()))?;

    let network = node.param("network").unwrap_or("tcp");
    let host = node.param("host").unwrap_or_default();
    let path = node.param("path").unwrap_or("/");
    let tls = matches!(node.param("tls"), Some("tls") | Some("true"));
    let sni = node
        .param("sni")
        .filter(|s| !s.is_empty())
        .unwrap_or(if host.is_empty() { node.server.as_str() } else { host });

    let (protocol, user) = match node.param("protocol") {
        Some("vless") => ("vless", json!({ "id": id, "encryption": "none" })),
        _ => {
            let alter_id: u32 = node.param("alter_id").and_then(|v| v.parse().ok()).unwrap_or(0);
            let security = if node.method.is_empty() { "auto" } else { node.method.as_str() };
            ("vmess", json!({ "id": id, "alterId": alter_id, "security": security }))
        }
    };

    let security = if tls { "tls" } else { "none" };
    let mut stream = json!({
        "network": network,
        "security": security,
    });
    if tls {
        stream["tlsSettings"] = json!({ "serverName": sni, "allowInsecure": false });
    }
    match network {
        "ws" => {
            stream["wsSettings"] = json!({ "path": path, "headers": { "Host": host } });
        }
        "h2" | "http" => {
            stream["httpSettings"] = json!({ "path": path, "host": [host] });
        }
        "grpc" => {
            stream["grpcSettings"] = json!({ "serviceName": node.param("service_name").unwrap_or_default() });
        }
        _ => {}
    }

    Ok(json!({
        "log": { "loglevel": "warning" },
        "inbounds": [{
            "listen": LOCAL_ADDRESS,
            "port": local_port,
            "protocol": "socks",
            "settings": { "auth": "noauth", "udp": true },
        }],
        "outbounds": [{
            "protocol": protocol,
            "settings": {
                "vnext": [{
                    "address": node.server,
                    "port": node.server_port,
                    "users": [user],
                }],
            },
            "streamSettings": stream,
        }],
    }))
}

fn trojan(node: &NodeConfig, local_port: u16) -> Value {
    let verify = !matches!(node.param("allow_insecure"), Some("true") | Some("1"));
    let sni = node.param("sni").unwrap_or(node.server.as_str());
    json!({
        "run_type": "client",
        "local_addr": LOCAL_ADDRESS,
        "local_port": local_port,
        "remote_addr": node.server,
        "remote_port": node.server_port,
        "password": [node.password],
        "ssl": {
            "sni": sni,
            "verify": verify,
        },
    })
}
