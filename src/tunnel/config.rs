//! Tunnel core configuration synthesis.
//!
//! Builds the JSON document the tunnel core is started with. Synthesis is
//! pure: the same endpoint, protocol, DNS policy and identity always produce
//! the same document.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::api::{DnsPolicy, Endpoint};
use crate::tunnel::error::SynthesisError;
use crate::tunnel::types::Protocol;

pub const PROXY_TAG: &str = "proxy";
pub const DIRECT_TAG: &str = "direct";
pub const BLOCK_TAG: &str = "block";
pub const TUN_TAG: &str = "tun-in";
pub const BOOTSTRAP_DNS_TAG: &str = "dns-bootstrap";
pub const PROXIED_DNS_TAG: &str = "dns-proxied";

const VMESS_WS_PATH: &str = "/vmess";

/// Host-side settings that do not depend on the chosen endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisOptions {
    /// Name of the tun device the core creates
    pub interface_name: String,
    /// CIDR address assigned to the tun device
    pub interface_address: String,
    pub mtu: u32,
    /// Resolver used to look up the proxied resolver, reached directly
    pub bootstrap_dns: String,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        SynthesisOptions {
            interface_name: "aes128tun".to_string(),
            interface_address: "172.19.0.1/30".to_string(),
            mtu: 1420,
            bootstrap_dns: "9.9.9.9".to_string(),
        }
    }
}

/// The complete tunnel core configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDocument {
    pub log: LogBlock,
    pub dns: DnsBlock,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    pub route: RouteBlock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogBlock {
    pub level: String,
    pub timestamp: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsBlock {
    pub servers: Vec<DnsServer>,
    pub strategy: String,
    #[serde(rename = "final")]
    pub final_server: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsServer {
    pub tag: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_resolver: Option<String>,
    pub detour: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Inbound {
    Tun(TunInbound),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunInbound {
    pub tag: String,
    pub interface_name: String,
    pub stack: String,
    pub address: Vec<String>,
    pub auto_route: bool,
    pub strict_route: bool,
    pub mtu: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tls {
    pub enabled: bool,
    pub server_name: String,
}

impl Tls {
    fn for_domain(domain: &str) -> Self {
        Tls {
            enabled: true,
            server_name: domain.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Transport {
    Ws {
        path: String,
        headers: BTreeMap<String, String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlessOutbound {
    pub tag: String,
    pub server: String,
    pub server_port: u16,
    pub uuid: String,
    pub tls: Tls,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmessOutbound {
    pub tag: String,
    pub server: String,
    pub server_port: u16,
    pub uuid: String,
    pub security: String,
    pub tls: Tls,
    pub transport: Transport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrojanOutbound {
    pub tag: String,
    pub server: String,
    pub server_port: u16,
    pub password: String,
    pub tls: Tls,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    Vless(VlessOutbound),
    Vmess(VmessOutbound),
    Trojan(TrojanOutbound),
    Direct { tag: String },
    Block { tag: String },
}

impl Outbound {
    pub fn tag(&self) -> &str {
        match self {
            Outbound::Vless(o) => &o.tag,
            Outbound::Vmess(o) => &o.tag,
            Outbound::Trojan(o) => &o.tag,
            Outbound::Direct { tag } | Outbound::Block { tag } => tag,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RouteRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_is_private: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteBlock {
    pub auto_detect_interface: bool,
    pub rules: Vec<RouteRule>,
    #[serde(rename = "final")]
    pub final_outbound: String,
}

impl ConfigDocument {
    /// Assemble a document for an already-validated protocol.
    pub fn build(
        options: &SynthesisOptions,
        endpoint: &Endpoint,
        protocol: Protocol,
        ad_block: bool,
        dns: &DnsPolicy,
        identity: &str,
    ) -> Self {
        ConfigDocument {
            log: LogBlock {
                level: "info".to_string(),
                timestamp: true,
            },
            dns: DnsBlock {
                servers: vec![
                    DnsServer {
                        tag: BOOTSTRAP_DNS_TAG.to_string(),
                        address: options.bootstrap_dns.clone(),
                        address_resolver: None,
                        detour: DIRECT_TAG.to_string(),
                    },
                    DnsServer {
                        tag: PROXIED_DNS_TAG.to_string(),
                        address: dns.proxied_resolver(ad_block).to_string(),
                        address_resolver: Some(BOOTSTRAP_DNS_TAG.to_string()),
                        detour: PROXY_TAG.to_string(),
                    },
                ],
                strategy: "prefer_ipv4".to_string(),
                final_server: PROXIED_DNS_TAG.to_string(),
            },
            inbounds: vec![Inbound::Tun(TunInbound {
                tag: TUN_TAG.to_string(),
                interface_name: options.interface_name.clone(),
                stack: "system".to_string(),
                address: vec![options.interface_address.clone()],
                auto_route: true,
                strict_route: true,
                mtu: options.mtu,
            })],
            outbounds: vec![
                proxy_outbound(protocol, endpoint, identity),
                Outbound::Direct {
                    tag: DIRECT_TAG.to_string(),
                },
                Outbound::Block {
                    tag: BLOCK_TAG.to_string(),
                },
            ],
            route: RouteBlock {
                auto_detect_interface: true,
                rules: vec![
                    RouteRule {
                        port: Some(53),
                        action: Some("hijack-dns".to_string()),
                        ..Default::default()
                    },
                    RouteRule {
                        action: Some("sniff".to_string()),
                        ..Default::default()
                    },
                    RouteRule {
                        ip_is_private: Some(true),
                        outbound: Some(DIRECT_TAG.to_string()),
                        ..Default::default()
                    },
                ],
                final_outbound: PROXY_TAG.to_string(),
            },
        }
    }

    /// The outbound tagged `proxy`.
    pub fn proxy_outbound(&self) -> Option<&Outbound> {
        self.outbounds.iter().find(|o| o.tag() == PROXY_TAG)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn proxy_outbound(protocol: Protocol, endpoint: &Endpoint, identity: &str) -> Outbound {
    let tag = PROXY_TAG.to_string();
    let server = endpoint.ip_address.clone();
    let server_port = protocol.port(endpoint);
    let tls = Tls::for_domain(&endpoint.domain);

    match protocol {
        Protocol::Vless => Outbound::Vless(VlessOutbound {
            tag,
            server,
            server_port,
            uuid: identity.to_string(),
            tls,
        }),
        Protocol::Vmess => {
            let mut headers = BTreeMap::new();
            headers.insert("Host".to_string(), endpoint.domain.clone());
            Outbound::Vmess(VmessOutbound {
                tag,
                server,
                server_port,
                uuid: identity.to_string(),
                security: "auto".to_string(),
                tls,
                transport: Transport::Ws {
                    path: VMESS_WS_PATH.to_string(),
                    headers,
                },
            })
        }
        Protocol::Trojan => Outbound::Trojan(TrojanOutbound {
            tag,
            server,
            server_port,
            password: identity.to_string(),
            tls,
        }),
    }
}

/// Build a document with the default host-side options.
pub fn synthesize(
    endpoint: &Endpoint,
    protocol: &str,
    ad_block: bool,
    dns: &DnsPolicy,
    identity: &str,
) -> Result<ConfigDocument, SynthesisError> {
    synthesize_with(
        &SynthesisOptions::default(),
        endpoint,
        protocol,
        ad_block,
        dns,
        identity,
    )
}

/// Build a document, validating the protocol name and identity first.
pub fn synthesize_with(
    options: &SynthesisOptions,
    endpoint: &Endpoint,
    protocol: &str,
    ad_block: bool,
    dns: &DnsPolicy,
    identity: &str,
) -> Result<ConfigDocument, SynthesisError> {
    let protocol: Protocol = protocol.parse()?;
    if identity.trim().is_empty() {
        return Err(SynthesisError::MissingIdentity);
    }
    Ok(ConfigDocument::build(
        options, endpoint, protocol, ad_block, dns, identity,
    ))
}
