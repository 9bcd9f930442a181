// # Scaleway Resource API
//
// This crate implements `ResourceApi` on top of the Scaleway REST APIs:
// Instance (servers, floating IPs, security groups), Domains (DNS zone
// records), Managed Database and Managed Redis (allow-lists).
//
// ## Behavior
//
// - One HTTP request per operation, except listings which drain every page
// - Errors are propagated as-is; the controller owns retries and backoff
// - HTTP timeout of 30 seconds
// - Status codes mapped to typed errors (401/403, 404, 429, 5xx)
// - Dry-run mode: reads are performed, mutations are logged and skipped
//
// ## Security Requirements
//
// - The secret key NEVER appears in logs or in `Debug` output
// - The secret key is read from the environment only
// - Construction fails if the secret key is empty
//
// ## API Reference
//
// - Instance: `/instance/v1/zones/{zone}/...`
// - Domains: `/domain/v2beta1/dns-zones/{zone}/records`
// - Managed Database: `/rdb/v1/regions/{region}/instances/{id}/acls`
// - Managed Redis: `/redis/v1/zones/{zone}/clusters/{id}/acls`

mod wire;

use async_trait::async_trait;
use ipnet::IpNet;
use nodegrant_core::traits::{
    AclRule, DataStoreInstance, DataStoreKind, DnsRecord, FloatingIp, QualifiedId, ResourceApi,
    RuleSpec, SecurityGroupRule, Server,
};
use nodegrant_core::{Error, Result};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::net::IpAddr;
use std::time::Duration;

use wire::{
    DatabaseAclPage, DatabaseInstanceDto, IpsPage, Paged, RecordsPage, RedisClusterDto,
    RulesPage, ServersPage,
};

/// Provider name used in errors and logs
const PROVIDER: &str = "scaleway";

/// Scaleway API base URL
pub const DEFAULT_API_URL: &str = "https://api.scaleway.com";

/// Zone used when neither the environment nor an identifier names one
pub const DEFAULT_ZONE: &str = "fr-par-1";

/// Region used when neither the environment nor an identifier names one
pub const DEFAULT_REGION: &str = "fr-par";

/// Default HTTP timeout for API requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Authentication header carrying the secret key
const AUTH_HEADER: &str = "X-Auth-Token";

/// Items requested per page when draining listings
const PAGE_SIZE: u32 = 100;

/// Environment variable selecting dry-run mode (`dry-run`)
pub const MODE_ENV: &str = "NODEGRANT_MODE";

/// Connection settings for the Scaleway APIs
#[derive(Clone, PartialEq, Eq)]
pub struct ScalewayConfig {
    /// Access key (identifies the key pair, not secret)
    pub access_key: Option<String>,
    /// Secret key sent as the authentication token
    /// ⚠️ NEVER log this value
    pub secret_key: String,
    /// Zone used for zonal resources without an explicit zone
    pub default_zone: String,
    /// Region used for regional resources without an explicit region
    pub default_region: String,
    /// API base URL
    pub api_url: String,
    /// Log mutations instead of sending them
    pub dry_run: bool,
}

impl std::fmt::Debug for ScalewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalewayConfig")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<REDACTED>")
            .field("default_zone", &self.default_zone)
            .field("default_region", &self.default_region)
            .field("api_url", &self.api_url)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

impl ScalewayConfig {
    /// Settings with the public API URL and the default zone and region
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            access_key: None,
            secret_key: secret_key.into(),
            default_zone: DEFAULT_ZONE.to_string(),
            default_region: DEFAULT_REGION.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            dry_run: false,
        }
    }

    /// Read the settings from the process environment
    ///
    /// Reads `SCW_ACCESS_KEY`, `SCW_SECRET_KEY`, `SCW_DEFAULT_ZONE`,
    /// `SCW_DEFAULT_REGION`, `SCW_API_URL` and `NODEGRANT_MODE`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the settings through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let secret_key = non_empty("SCW_SECRET_KEY")
            .ok_or_else(|| Error::config("SCW_SECRET_KEY is required"))?;

        let mut config = Self::new(secret_key);
        config.access_key = non_empty("SCW_ACCESS_KEY");
        if let Some(zone) = non_empty("SCW_DEFAULT_ZONE") {
            config.default_zone = zone;
        }
        if let Some(region) = non_empty("SCW_DEFAULT_REGION") {
            config.default_region = region;
        }
        if let Some(url) = non_empty("SCW_API_URL") {
            config.api_url = url.trim_end_matches('/').to_string();
        }
        config.dry_run = lookup(MODE_ENV)
            .unwrap_or_default()
            .eq_ignore_ascii_case("dry-run");

        Ok(config)
    }
}

/// Scaleway resource API client
///
/// Stateless and single-shot: retries, backoff and scheduling belong to
/// the controller.
///
/// # Dry-Run Mode
///
/// When `dry_run` is true, the provider will:
/// - Perform all GET requests
/// - Log the intended mutation and its payload
/// - **NOT** modify any resource
pub struct ScalewayProvider {
    config: ScalewayConfig,
    client: reqwest::Client,
}

// Custom Debug implementation that hides the secret key
impl std::fmt::Debug for ScalewayProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalewayProvider")
            .field("config", &self.config)
            .finish()
    }
}

impl ScalewayProvider {
    /// Create a provider from connection settings
    ///
    /// # Errors
    ///
    /// Fails if the secret key is empty or the HTTP client cannot be built.
    pub fn new(config: ScalewayConfig) -> Result<Self> {
        if config.secret_key.trim().is_empty() {
            return Err(Error::config("Scaleway secret key cannot be empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::http(format!("failed to build HTTP client: {}", e)))?;

        if config.dry_run {
            tracing::warn!("Scaleway provider running in DRY-RUN mode - no changes will be made");
        }

        Ok(Self { config, client })
    }

    /// Create a provider from the process environment
    pub fn from_env() -> Result<Self> {
        Self::new(ScalewayConfig::from_env()?)
    }

    /// Whether mutations are skipped
    pub fn is_dry_run(&self) -> bool {
        self.config.dry_run
    }

    fn zone<'a>(&'a self, zone: Option<&'a str>) -> &'a str {
        zone.unwrap_or(&self.config.default_zone)
    }

    fn region<'a>(&'a self, region: Option<&'a str>) -> &'a str {
        region.unwrap_or(&self.config.default_region)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_url, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(path))
            .header(AUTH_HEADER, &self.config.secret_key)
    }

    /// Send a request and decode its JSON body
    async fn fetch<T: DeserializeOwned>(&self, builder: RequestBuilder, context: &str) -> Result<T> {
        let response = builder
            .send()
            .await
            .map_err(|e| Error::http(format!("{}: request failed: {}", context, e)))?;
        let response = check_status(response, context).await?;

        response
            .json()
            .await
            .map_err(|e| Error::provider(PROVIDER, format!("Failed to parse {} response: {}", context, e)))
    }

    /// GET every page of a listing
    async fn fetch_all<P>(
        &self,
        path: &str,
        size_param: &str,
        query: &[(&str, &str)],
        context: &str,
    ) -> Result<Vec<P::Item>>
    where
        P: Paged + DeserializeOwned,
    {
        let mut items = Vec::new();
        let mut page: u32 = 1;

        loop {
            let builder = self
                .request(Method::GET, path)
                .query(query)
                .query(&[("page", page.to_string()), (size_param, PAGE_SIZE.to_string())]);
            let (batch, total) = self.fetch::<P>(builder, context).await?.into_parts();

            let batch_len = batch.len();
            items.extend(batch);
            if listing_complete(batch_len, items.len(), total) {
                return Ok(items);
            }
            page += 1;
        }
    }

    /// Send a mutation, or log it in dry-run mode
    async fn mutate(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        context: &str,
    ) -> Result<()> {
        if self.config.dry_run {
            tracing::info!(
                "[DRY-RUN] Would send {} {}: {}",
                method,
                self.url(path),
                body.as_ref().map(serde_json::Value::to_string).unwrap_or_default()
            );
            return Ok(());
        }

        let mut builder = self.request(method, path);
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| Error::http(format!("{}: request failed: {}", context, e)))?;
        check_status(response, context).await?;
        Ok(())
    }

    fn database_path(&self, instance: &DataStoreInstance) -> String {
        format!("rdb/v1/regions/{}/instances/{}", instance.location, instance.id)
    }

    fn redis_path(&self, instance: &DataStoreInstance) -> String {
        format!("redis/v1/zones/{}/clusters/{}", instance.location, instance.id)
    }
}

/// Map a non-success status to a typed error
async fn check_status(response: reqwest::Response, context: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unable to read error response".to_string());

    Err(match status.as_u16() {
        401 | 403 => Error::auth(format!(
            "{}: invalid secret key or insufficient permissions. Status: {}",
            context, status
        )),
        404 => Error::not_found(format!("{}: {}", context, error_text)),
        429 => Error::rate_limited(format!("{}: retry later. Status: {}", context, status)),
        500..=599 => Error::provider(
            PROVIDER,
            format!("{}: server error (transient): {} - {}", context, status, error_text),
        ),
        _ => Error::provider(
            PROVIDER,
            format!("{} failed: {} - {}", context, status, error_text),
        ),
    })
}

#[async_trait]
impl ResourceApi for ScalewayProvider {
    async fn find_server(&self, name: &str) -> Result<Server> {
        let zone = self.zone(None);
        let path = format!("instance/v1/zones/{}/servers", zone);
        let servers = self
            .fetch_all::<ServersPage>(&path, "per_page", &[("name", name)], "list servers")
            .await?;

        // the name filter is a substring match
        let mut matching: Vec<Server> = servers
            .into_iter()
            .filter(|s| s.name == name)
            .map(Server::from)
            .collect();

        match matching.len() {
            1 => Ok(matching.remove(0)),
            0 => Err(Error::not_found(format!("server {} in {}", name, zone))),
            n => Err(Error::provider(
                PROVIDER,
                format!("found {} servers named {} in {}", n, name, zone),
            )),
        }
    }

    async fn list_ips(&self) -> Result<Vec<FloatingIp>> {
        let path = format!("instance/v1/zones/{}/ips", self.zone(None));
        let ips = self
            .fetch_all::<IpsPage>(&path, "per_page", &[], "list IPs")
            .await?;
        Ok(ips.into_iter().map(FloatingIp::from).collect())
    }

    async fn attach_ip(&self, ip_id: &str, server_id: &str) -> Result<()> {
        tracing::debug!("Attaching IP {} to server {}", ip_id, server_id);
        let path = format!("instance/v1/zones/{}/ips/{}", self.zone(None), ip_id);
        self.mutate(Method::PATCH, &path, Some(json!({ "server": server_id })), "attach IP")
            .await
    }

    async fn set_ip_reverse(&self, address: IpAddr, reverse: Option<&str>) -> Result<()> {
        tracing::debug!("Setting reverse of {} to {:?}", address, reverse);
        let path = format!("instance/v1/zones/{}/ips/{}", self.zone(None), address);
        self.mutate(Method::PATCH, &path, Some(json!({ "reverse": reverse })), "set IP reverse")
            .await
    }

    async fn list_dns_records(
        &self,
        zone: &str,
        record_type: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<DnsRecord>> {
        let builder = self
            .request(Method::GET, &format!("domain/v2beta1/dns-zones/{}/records", zone))
            .query(&[
                ("type", record_type.to_string()),
                ("page", page.to_string()),
                ("page_size", page_size.to_string()),
            ]);
        let (records, _) = self
            .fetch::<RecordsPage>(builder, "list DNS records")
            .await?
            .into_parts();
        Ok(records)
    }

    async fn add_dns_record(&self, zone: &str, record: &DnsRecord) -> Result<()> {
        tracing::debug!("Adding {} record {} -> {} in {}", record.record_type, record.name, record.data, zone);
        let body = json!({
            "changes": [{
                "add": {
                    "records": [{
                        "name": record.name,
                        "data": record.data,
                        "type": record.record_type,
                        "ttl": record.ttl,
                        "comment": record.comment,
                    }]
                }
            }],
            "disallow_new_zone_creation": true,
        });
        self.mutate(
            Method::PATCH,
            &format!("domain/v2beta1/dns-zones/{}/records", zone),
            Some(body),
            "add DNS record",
        )
        .await
    }

    async fn delete_dns_record(&self, zone: &str, record_id: &str) -> Result<()> {
        tracing::debug!("Deleting record {} in {}", record_id, zone);
        let body = json!({
            "changes": [{ "delete": { "id": record_id } }],
            "disallow_new_zone_creation": true,
        });
        self.mutate(
            Method::PATCH,
            &format!("domain/v2beta1/dns-zones/{}/records", zone),
            Some(body),
            "delete DNS record",
        )
        .await
    }

    async fn get_data_store(
        &self,
        kind: DataStoreKind,
        id: &QualifiedId,
    ) -> Result<DataStoreInstance> {
        match kind {
            DataStoreKind::Relational => {
                let path = format!(
                    "rdb/v1/regions/{}/instances/{}",
                    self.region(id.location()),
                    id.id
                );
                let instance: DatabaseInstanceDto = self
                    .fetch(self.request(Method::GET, &path), "get database instance")
                    .await?;
                Ok(DataStoreInstance {
                    id: instance.id,
                    location: instance.region,
                    kind,
                })
            }
            DataStoreKind::Cache => {
                let path = format!("redis/v1/zones/{}/clusters/{}", self.zone(id.location()), id.id);
                let cluster: RedisClusterDto = self
                    .fetch(self.request(Method::GET, &path), "get redis cluster")
                    .await?;
                Ok(DataStoreInstance {
                    id: cluster.id,
                    location: cluster.zone,
                    kind,
                })
            }
        }
    }

    async fn list_acl_rules(&self, instance: &DataStoreInstance) -> Result<Vec<AclRule>> {
        match instance.kind {
            DataStoreKind::Relational => {
                let path = format!("{}/acls", self.database_path(instance));
                let rules = self
                    .fetch_all::<DatabaseAclPage>(&path, "page_size", &[], "list database ACLs")
                    .await?;
                Ok(rules.into_iter().map(AclRule::from).collect())
            }
            DataStoreKind::Cache => {
                let cluster: RedisClusterDto = self
                    .fetch(
                        self.request(Method::GET, &self.redis_path(instance)),
                        "get redis cluster",
                    )
                    .await?;
                Ok(cluster.acl_rules.into_iter().map(AclRule::from).collect())
            }
        }
    }

    async fn add_acl_rule(
        &self,
        instance: &DataStoreInstance,
        ip: IpNet,
        description: &str,
    ) -> Result<()> {
        tracing::debug!("Adding {} ACL {} on {}", instance.kind, ip, instance.id);
        let (path, body) = match instance.kind {
            DataStoreKind::Relational => (
                format!("{}/acls", self.database_path(instance)),
                json!({ "rules": [{ "ip": ip.to_string(), "description": description }] }),
            ),
            DataStoreKind::Cache => (
                format!("{}/acls", self.redis_path(instance)),
                json!({ "acl_rules": [{ "ip_cidr": ip.to_string(), "description": description }] }),
            ),
        };
        self.mutate(Method::POST, &path, Some(body), "add ACL rule").await
    }

    async fn delete_acl_rule(&self, instance: &DataStoreInstance, rule: &AclRule) -> Result<()> {
        tracing::debug!("Deleting {} ACL {} on {}", instance.kind, rule.ip, instance.id);
        match instance.kind {
            DataStoreKind::Relational => {
                let path = format!("{}/acls", self.database_path(instance));
                let body = json!({ "acl_rule_ips": [rule.ip.to_string()] });
                self.mutate(Method::DELETE, &path, Some(body), "delete ACL rule").await
            }
            DataStoreKind::Cache => {
                let rule_id = rule.id.as_deref().ok_or_else(|| {
                    Error::invalid_input(format!("redis ACL rule {} has no id", rule.ip))
                })?;
                let path = format!("redis/v1/zones/{}/acls/{}", instance.location, rule_id);
                self.mutate(Method::DELETE, &path, None, "delete ACL rule").await
            }
        }
    }

    async fn list_security_group_rules(
        &self,
        zone: Option<&str>,
        group_id: &str,
    ) -> Result<Vec<SecurityGroupRule>> {
        let path = format!(
            "instance/v1/zones/{}/security_groups/{}/rules",
            self.zone(zone),
            group_id
        );
        self.fetch_all::<RulesPage>(&path, "per_page", &[], "list security group rules")
            .await
    }

    async fn create_security_group_rule(
        &self,
        zone: Option<&str>,
        group_id: &str,
        rule: &RuleSpec,
    ) -> Result<()> {
        tracing::debug!(
            "Creating {} rule for {} ports {:?}-{:?} in {}",
            rule.protocol.as_str(),
            rule.ip_range,
            rule.dest_port_from,
            rule.dest_port_to,
            group_id
        );
        let path = format!(
            "instance/v1/zones/{}/security_groups/{}/rules",
            self.zone(zone),
            group_id
        );
        let body = serde_json::to_value(rule)?;
        self.mutate(Method::POST, &path, Some(body), "create security group rule")
            .await
    }

    async fn delete_security_group_rule(
        &self,
        zone: Option<&str>,
        group_id: &str,
        rule_id: &str,
    ) -> Result<()> {
        tracing::debug!("Deleting rule {} from {}", rule_id, group_id);
        let path = format!(
            "instance/v1/zones/{}/security_groups/{}/rules/{}",
            self.zone(zone),
            group_id,
            rule_id
        );
        self.mutate(Method::DELETE, &path, None, "delete security group rule")
            .await
    }

    fn provider_name(&self) -> &'static str {
        PROVIDER
    }
}

/// A short page ends a listing, and so does reaching a reported total
fn listing_complete(batch_len: usize, fetched: usize, total: Option<u64>) -> bool {
    batch_len < PAGE_SIZE as usize || total.is_some_and(|total| fetched as u64 >= total)
}
