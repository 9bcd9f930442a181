//! Wire formats of the Scaleway APIs
//!
//! Only the fields the controller reads are declared; everything else in the
//! responses is ignored.

use ipnet::IpNet;
use nodegrant_core::traits::{AclRule, DnsRecord, FloatingIp, PublicIp, SecurityGroupRule, Server};
use serde::Deserialize;
use std::net::IpAddr;

/// A listing response split into items and the server-side total
pub(crate) trait Paged {
    type Item;

    /// Items of the page and the listing size, when the API reports it
    fn into_parts(self) -> (Vec<Self::Item>, Option<u64>);
}

macro_rules! paged {
    ($page:ident, $field:ident, $item:ty) => {
        #[derive(Debug, Deserialize)]
        pub(crate) struct $page {
            #[serde(default)]
            pub $field: Vec<$item>,
            #[serde(default)]
            pub total_count: Option<u64>,
        }

        impl Paged for $page {
            type Item = $item;

            fn into_parts(self) -> (Vec<$item>, Option<u64>) {
                (self.$field, self.total_count)
            }
        }
    };
}

paged!(ServersPage, servers, ServerDto);
paged!(IpsPage, ips, IpDto);
paged!(RulesPage, rules, SecurityGroupRule);
paged!(RecordsPage, records, DnsRecord);
paged!(DatabaseAclPage, rules, DatabaseAclDto);

#[derive(Debug, Deserialize)]
pub(crate) struct PublicIpDto {
    pub id: String,
    pub address: IpAddr,
    #[serde(default)]
    pub dynamic: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerDto {
    pub id: String,
    pub name: String,
    pub zone: String,
    #[serde(default)]
    pub public_ip: Option<PublicIpDto>,
    #[serde(default)]
    pub private_ip: Option<String>,
}

impl From<ServerDto> for Server {
    fn from(dto: ServerDto) -> Self {
        Server {
            id: dto.id,
            name: dto.name,
            zone: dto.zone,
            public_ip: dto.public_ip.map(|ip| PublicIp {
                id: ip.id,
                address: ip.address,
                dynamic: ip.dynamic,
            }),
            private_ip: dto.private_ip.and_then(|ip| ip.parse().ok()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerRefDto {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct IpDto {
    pub id: String,
    pub address: IpAddr,
    #[serde(default)]
    pub reverse: Option<String>,
    #[serde(default)]
    pub server: Option<ServerRefDto>,
}

impl From<IpDto> for FloatingIp {
    fn from(dto: IpDto) -> Self {
        FloatingIp {
            id: dto.id,
            address: dto.address,
            reverse: dto.reverse.filter(|r| !r.is_empty()),
            server_id: dto.server.map(|s| s.id),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct DatabaseInstanceDto {
    pub id: String,
    pub region: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DatabaseAclDto {
    pub ip: IpNet,
    #[serde(default)]
    pub description: String,
}

impl From<DatabaseAclDto> for AclRule {
    fn from(dto: DatabaseAclDto) -> Self {
        AclRule {
            id: None,
            ip: dto.ip,
            description: dto.description,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RedisAclDto {
    pub id: String,
    pub ip_cidr: IpNet,
    #[serde(default)]
    pub description: Option<String>,
}

impl From<RedisAclDto> for AclRule {
    fn from(dto: RedisAclDto) -> Self {
        AclRule {
            id: Some(dto.id),
            ip: dto.ip_cidr,
            description: dto.description.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RedisClusterDto {
    pub id: String,
    pub zone: String,
    #[serde(default)]
    pub acl_rules: Vec<RedisAclDto>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodegrant_core::traits::{RuleAction, RuleDirection, RuleProtocol};
    use serde_json::json;

    #[test]
    fn server_listing_decodes() {
        let page: ServersPage = serde_json::from_value(json!({
            "servers": [{
                "id": "11111111-1111-1111-1111-111111111111",
                "name": "pool-default-node-1",
                "zone": "fr-par-1",
                "commercial_type": "DEV1-M",
                "public_ip": { "id": "ip-1", "address": "51.15.0.1", "dynamic": true },
                "private_ip": "10.68.0.5"
            }],
            "total_count": 1
        }))
        .unwrap();

        let (servers, total) = page.into_parts();
        assert_eq!(total, Some(1));
        let server = Server::from(servers.into_iter().next().unwrap());
        assert_eq!(server.zone, "fr-par-1");
        assert!(server.public_ip.unwrap().dynamic);
        assert_eq!(server.private_ip, Some("10.68.0.5".parse().unwrap()));
    }

    #[test]
    fn missing_total_count_is_unknown() {
        let page: IpsPage = serde_json::from_value(json!({ "ips": [] })).unwrap();
        let (ips, total) = page.into_parts();
        assert!(ips.is_empty());
        assert_eq!(total, None);
    }

    #[test]
    fn server_without_addresses_decodes() {
        let server: ServerDto = serde_json::from_value(json!({
            "id": "s", "name": "n", "zone": "nl-ams-1", "public_ip": null, "private_ip": null
        }))
        .unwrap();
        let server = Server::from(server);
        assert!(server.public_ip.is_none());
        assert!(server.private_ip.is_none());
    }

    #[test]
    fn detached_ip_has_no_server() {
        let ip: IpDto = serde_json::from_value(json!({
            "id": "ip-2", "address": "51.15.9.9", "reverse": "", "server": null
        }))
        .unwrap();
        let ip = FloatingIp::from(ip);
        assert!(!ip.is_attached());
        assert_eq!(ip.reverse, None);
    }

    #[test]
    fn security_group_rules_decode() {
        let page: RulesPage = serde_json::from_value(json!({
            "rules": [{
                "id": "rule-1",
                "protocol": "TCP",
                "direction": "inbound",
                "action": "accept",
                "ip_range": "0.0.0.0/0",
                "dest_port_from": 30080,
                "dest_port_to": 30080,
                "position": 1,
                "editable": true
            }, {
                "id": "rule-2",
                "protocol": "ANY",
                "direction": "inbound",
                "action": "accept",
                "ip_range": "51.15.0.1/32",
                "dest_port_from": null,
                "dest_port_to": null
            }],
            "total_count": 2
        }))
        .unwrap();

        let (rules, _) = page.into_parts();
        assert!(rules[0].spec.allows_exact_port(RuleProtocol::Tcp, 30080));
        assert_eq!(rules[1].spec.protocol, RuleProtocol::Any);
        assert_eq!(rules[1].spec.direction, RuleDirection::Inbound);
        assert_eq!(rules[1].spec.action, RuleAction::Accept);
        assert_eq!(rules[1].spec.ip_range.to_string(), "51.15.0.1/32");
    }

    #[test]
    fn dns_records_decode() {
        let page: RecordsPage = serde_json::from_value(json!({
            "records": [{
                "id": "rec-1",
                "name": "1-0-15-51",
                "data": "51.15.0.1",
                "type": "A",
                "ttl": 600,
                "comment": "node-1",
                "priority": 0
            }],
            "total_count": 1
        }))
        .unwrap();
        let (records, _) = page.into_parts();
        assert_eq!(records[0].comment.as_deref(), Some("node-1"));
        assert_eq!(records[0].record_type, "A");
    }

    #[test]
    fn redis_acls_keep_their_id() {
        let cluster: RedisClusterDto = serde_json::from_value(json!({
            "id": "redis-1",
            "zone": "fr-par-2",
            "acl_rules": [{ "id": "acl-1", "ip_cidr": "51.15.0.1/32", "description": "node-1" }]
        }))
        .unwrap();
        let rule = AclRule::from(cluster.acl_rules.into_iter().next().unwrap());
        assert_eq!(rule.id.as_deref(), Some("acl-1"));
        assert_eq!(rule.description, "node-1");
    }
}
