//! Wire types for the directory service.

use serde::{Deserialize, Deserializer, Serialize};

/// A VPN location as served by the directory.
///
/// Endpoints are snapshots: they are fetched (or read from the user cache)
/// once per command and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Display name, e.g. "Germany, Frankfurt"
    pub name: String,
    /// TLS server name of the location
    pub domain: String,
    /// Address used for probing and as the outbound server
    pub ip_address: String,
    pub vless_port: u16,
    pub vmess_port: u16,
    pub trojan_port: u16,
}

/// DNS resolvers assigned to the account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsPolicy {
    #[serde(rename = "regular_dns")]
    pub regular: String,
    /// Filtering resolver; the service sends an empty string when none is configured
    #[serde(
        rename = "adblock_dns",
        default,
        deserialize_with = "empty_string_as_none"
    )]
    pub ad_block: Option<String>,
}

impl DnsPolicy {
    pub fn new(regular: impl Into<String>, ad_block: Option<String>) -> Self {
        DnsPolicy {
            regular: regular.into(),
            ad_block,
        }
    }

    /// Resolver the tunnel should send proxied queries to.
    pub fn proxied_resolver(&self, ad_block_enabled: bool) -> &str {
        match (&self.ad_block, ad_block_enabled) {
            (Some(filtering), true) => filtering,
            _ => &self.regular,
        }
    }
}

fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

/// Endpoint directory plus the opaque per-user identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationsResponse {
    pub user_uuid: String,
    #[serde(default)]
    pub locations: Vec<Endpoint>,
}

/// An application session registered for the account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSession {
    pub id: i64,
    pub name: String,
}

/// Response body shared by the login and session management calls.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub app_session_token: String,
    #[serde(default)]
    pub session_name: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub sessions: Vec<AppSession>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_adblock_resolver_is_none() {
        let policy: DnsPolicy =
            serde_json::from_str(r#"{"regular_dns":"1.1.1.1","adblock_dns":""}"#).unwrap();
        assert_eq!(policy.ad_block, None);
        assert_eq!(policy.proxied_resolver(true), "1.1.1.1");
    }

    #[test]
    fn adblock_resolver_used_only_when_enabled() {
        let policy: DnsPolicy =
            serde_json::from_str(r#"{"regular_dns":"1.1.1.1","adblock_dns":"94.140.14.14"}"#)
                .unwrap();
        assert_eq!(policy.proxied_resolver(true), "94.140.14.14");
        assert_eq!(policy.proxied_resolver(false), "1.1.1.1");
    }

    #[test]
    fn locations_response_parses() {
        let body = r#"{
            "user_uuid": "6f1c2a1e-0000-4000-8000-000000000001",
            "locations": [{
                "name": "Germany", "domain": "de.example.net", "ip_address": "203.0.113.10",
                "vless_port": 443, "vmess_port": 8443, "trojan_port": 2083
            }]
        }"#;
        let resp: LocationsResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.locations.len(), 1);
        assert_eq!(resp.locations[0].trojan_port, 2083);
    }
}
