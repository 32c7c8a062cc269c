use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader as XmlReader;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use strato_config::cloud::CloudConfig;
use strato_model::{Collection, Node, RuleSource, SecurityGroup, SecurityGroupRule};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::driver::{
    expand_path, keypair_name, openssh_fingerprint, proxyconf, CloudDriver, DriverOptions,
    KeyPairInfo,
};
use crate::error::DriverError;

type HmacSha256 = Hmac<Sha256>;

const EC2_API_VERSION: &str = "2016-11-15";
const NAMESPACE_TAG: &str = "strato_namespace";

/// Instance states that make a node irrelevant for detection.
const DEAD_STATES: &[&str] = &["terminated", "shutting-down", "unknown"];

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AwsDriverConfig {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub ssh_key_file: Option<String>,
}

impl AwsDriverConfig {
    pub fn from_cloud_config(cfg: &CloudConfig) -> Result<Self, DriverError> {
        Ok(Self {
            access_key: required(cfg, "access_key")?,
            secret_key: required(cfg, "secret_key")?,
            region: required(cfg, "region")?,
            ssh_key_file: cfg.connection.get("sshkey").cloned(),
        })
    }
}

fn required(cfg: &CloudConfig, key: &str) -> Result<String, DriverError> {
    cfg.connection_key(key)
        .map(str::to_string)
        .map_err(|e| DriverError::Config(e.to_string()))
}

// ── Base URLs (overridden in tests) ───────────────────────────────────────────

#[derive(Clone)]
pub(crate) struct BaseUrls {
    pub(crate) ec2: String,
}

impl BaseUrls {
    fn for_region(region: &str) -> Self {
        Self { ec2: format!("https://ec2.{}.amazonaws.com", region) }
    }
}

// ── EC2 errors ────────────────────────────────────────────────────────────────

/// An EC2 Query API failure, keeping the AWS error code addressable so
/// benign duplicates can be told apart from real failures.
#[derive(Debug)]
struct Ec2Error {
    code: String,
    message: String,
}

impl Ec2Error {
    fn transport(message: String) -> Self {
        Self { code: "transport".into(), message }
    }

    fn create(self) -> DriverError {
        DriverError::CreateFailed(format!("{}: {}", self.code, self.message))
    }

    fn detect(self) -> DriverError {
        DriverError::DetectFailed(format!("{}: {}", self.code, self.message))
    }

    fn delete(self) -> DriverError {
        DriverError::DeleteFailed(format!("{}: {}", self.code, self.message))
    }
}

// ── AwsDriver ─────────────────────────────────────────────────────────────────

pub struct AwsDriver {
    config: AwsDriverConfig,
    options: DriverOptions,
    client: reqwest::Client,
    base: BaseUrls,
    sg_name_to_id: Mutex<HashMap<String, String>>,
    sg_id_to_name: Mutex<HashMap<String, String>>,
    volume_sizes: OnceCell<HashMap<String, u32>>,
}

impl AwsDriver {
    pub fn new(config: AwsDriverConfig, options: DriverOptions) -> Self {
        let base = BaseUrls::for_region(&config.region);
        Self {
            config,
            options,
            client: reqwest::Client::new(),
            base,
            sg_name_to_id: Mutex::new(HashMap::new()),
            sg_id_to_name: Mutex::new(HashMap::new()),
            volume_sizes: OnceCell::new(),
        }
    }

    #[cfg(test)]
    fn with_base_url(config: AwsDriverConfig, options: DriverOptions, ec2: String) -> Self {
        let mut driver = Self::new(config, options);
        driver.base = BaseUrls { ec2 };
        driver
    }

    // ── EC2 Query API ─────────────────────────────────────────────────────────

    async fn ec2(&self, action: &str, params: Vec<(String, String)>) -> Result<Value, Ec2Error> {
        let url = format!("{}/", self.base.ec2.trim_end_matches('/'));
        let host = url_host(&self.base.ec2).to_string();

        let mut all_params: Vec<(String, String)> = vec![
            ("Action".into(), action.to_string()),
            ("Version".into(), EC2_API_VERSION.into()),
        ];
        all_params.extend(params);

        let body_str = all_params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let body = body_str.into_bytes();

        let ct = "application/x-www-form-urlencoded; charset=utf-8";
        let headers = sigv4_headers(
            "POST",
            "/",
            "",
            ct,
            &body,
            &self.config.access_key,
            &self.config.secret_key,
            &self.config.region,
            "ec2",
            &host,
        );

        let mut req = self.client.post(&url).header("Content-Type", ct).body(body);
        for (k, v) in &headers {
            req = req.header(k, v);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| Ec2Error::transport(format!("POST {}: {}", url, e)))?;
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();

        if status >= 400 {
            return Err(Ec2Error {
                code: xml_text(&text, "Code").unwrap_or_else(|| "Unknown".into()),
                message: xml_text(&text, "Message").unwrap_or_else(|| "unknown error".into()),
            });
        }
        Ok(xml_to_value(&text))
    }

    // ── Volume sizes ──────────────────────────────────────────────────────────

    /// Volume id → size in GB, fetched once and cached for the driver's
    /// lifetime. Root volume sizes are how node identity learns its disk.
    async fn volume_size_map(&self) -> Result<&HashMap<String, u32>, DriverError> {
        self.volume_sizes
            .get_or_try_init(|| async {
                let resp = self
                    .ec2("DescribeVolumes", vec![])
                    .await
                    .map_err(Ec2Error::detect)?;
                let mut sizes = HashMap::new();
                for volume in items(&resp["volumeSet"]) {
                    if let (Some(id), Some(size)) =
                        (volume["volumeId"].as_str(), text_u32(&volume["size"]))
                    {
                        sizes.insert(id.to_string(), size);
                    }
                }
                Ok(sizes)
            })
            .await
    }

    // ── Security group id↔name cache ──────────────────────────────────────────

    async fn refresh_sg_caches(&self) -> Result<(), DriverError> {
        let resp = self
            .ec2("DescribeSecurityGroups", vec![])
            .await
            .map_err(Ec2Error::detect)?;

        let mut name_to_id = HashMap::new();
        let mut id_to_name = HashMap::new();
        for group in items(&resp["securityGroupInfo"]) {
            if let (Some(id), Some(name)) =
                (group["groupId"].as_str(), group["groupName"].as_str())
            {
                name_to_id.insert(name.to_string(), id.to_string());
                id_to_name.insert(id.to_string(), name.to_string());
            }
        }
        *self.sg_name_to_id.lock().unwrap() = name_to_id;
        *self.sg_id_to_name.lock().unwrap() = id_to_name;
        Ok(())
    }

    async fn sg_id_to_name(&self, id: &str) -> Result<String, DriverError> {
        if let Some(name) = self.sg_id_to_name.lock().unwrap().get(id) {
            return Ok(name.clone());
        }
        self.refresh_sg_caches().await?;
        self.sg_id_to_name
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| DriverError::DetectFailed(format!("unknown security group id {}", id)))
    }

    async fn sg_name_to_id(&self, name: &str) -> Result<String, DriverError> {
        if let Some(id) = self.sg_name_to_id.lock().unwrap().get(name) {
            return Ok(id.clone());
        }
        self.refresh_sg_caches().await?;
        self.sg_name_to_id
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| {
                DriverError::CreateFailed(format!("unknown security group name {}", name))
            })
    }

    // ── Key pairs ─────────────────────────────────────────────────────────────

    async fn find_or_import_keypair(&self, pubkey: &str) -> Result<KeyPairInfo, DriverError> {
        let fingerprint = openssh_fingerprint(pubkey)?;

        let resp = self
            .ec2("DescribeKeyPairs", vec![])
            .await
            .map_err(Ec2Error::detect)?;
        for keypair in items(&resp["keySet"]) {
            if keypair["keyFingerprint"].as_str() == Some(fingerprint.as_str()) {
                return Ok(KeyPairInfo {
                    name: keypair["keyName"].as_str().unwrap_or_default().to_string(),
                    fingerprint,
                });
            }
        }

        let name = keypair_name(pubkey)?;
        let material = base64::engine::general_purpose::STANDARD.encode(pubkey);
        self.ec2(
            "ImportKeyPair",
            vec![
                ("KeyName".into(), name.clone()),
                ("PublicKeyMaterial".into(), material),
            ],
        )
        .await
        .map_err(Ec2Error::create)?;

        Ok(KeyPairInfo { name, fingerprint })
    }

    async fn key_name_from_config(&self) -> Result<Option<String>, DriverError> {
        let Some(key_file) = &self.config.ssh_key_file else {
            return Ok(None);
        };
        let path = expand_path(key_file);
        let pubkey = std::fs::read_to_string(&path)
            .map_err(|e| DriverError::Config(format!("read {}: {}", path.display(), e)))?;
        let info = self.find_or_import_keypair(pubkey.trim_end()).await?;
        Ok(Some(info.name))
    }

    fn node_from_instance(
        &self,
        instance: &Value,
        volume_sizes: &HashMap<String, u32>,
    ) -> Option<Node> {
        let tags = tag_map(instance);

        let state = instance["instanceState"]["name"].as_str().unwrap_or("unknown");
        if DEAD_STATES.contains(&state) {
            return None;
        }
        if !self.is_namespace_relevant(tags.get(NAMESPACE_TAG).map(String::as_str)) {
            return None;
        }

        let root_volume = items(&instance["blockDeviceMapping"])
            .first()
            .and_then(|bdm| bdm["ebs"]["volumeId"].as_str())
            .map(str::to_string)?;
        let disk = volume_sizes.get(&root_volume).copied().unwrap_or(0);

        let name = tags.get("Name").cloned().unwrap_or_default();
        let mut node = Node::new(
            name,
            instance["instanceType"].as_str().unwrap_or_default(),
            instance["imageId"].as_str().unwrap_or_default(),
            disk,
        );
        node.security_group_names = items(&instance["groupSet"])
            .iter()
            .filter_map(|g| g["groupName"].as_str().map(str::to_string))
            .collect();
        node.provider_id = instance["instanceId"].as_str().map(str::to_string);
        if let Some(ip) = instance["ipAddress"].as_str() {
            node.public_ips.push(ip.to_string());
        }
        Some(node)
    }
}

#[async_trait]
impl CloudDriver for AwsDriver {
    fn provider_name(&self) -> &'static str {
        "aws"
    }

    fn options(&self) -> &DriverOptions {
        &self.options
    }

    async fn detect_nodes(&self) -> Result<Vec<Node>, DriverError> {
        let volume_sizes = self.volume_size_map().await?.clone();
        let resp = self
            .ec2("DescribeInstances", vec![])
            .await
            .map_err(Ec2Error::detect)?;

        let mut nodes = Vec::new();
        for reservation in items(&resp["reservationSet"]) {
            for instance in items(&reservation["instancesSet"]) {
                if let Some(node) = self.node_from_instance(instance, &volume_sizes) {
                    info!("Detected node: {}", node.name);
                    nodes.push(node);
                }
            }
        }
        Ok(nodes)
    }

    async fn detect_firewalls(
        &self,
    ) -> Result<(HashSet<SecurityGroup>, HashSet<SecurityGroupRule>), DriverError> {
        let resp = self
            .ec2("DescribeSecurityGroups", vec![])
            .await
            .map_err(Ec2Error::detect)?;

        let mut groups = HashSet::new();
        let mut rules = HashSet::new();

        for group in items(&resp["securityGroupInfo"]) {
            let Some(name) = group["groupName"].as_str() else { continue };
            let mut sg = SecurityGroup::new(name);
            sg.provider_id = group["groupId"].as_str().map(str::to_string);
            groups.insert(sg);

            for perm in items(&group["ipPermissions"]) {
                let cidr = items(&perm["ipRanges"])
                    .first()
                    .and_then(|r| r["cidrIp"].as_str())
                    .map(str::to_string);

                let source = match cidr {
                    Some(cidr) => RuleSource::Cidr(cidr),
                    None => {
                        // group_pairs form: resolve the id through the cache
                        let Some(group_id) = items(&perm["groups"])
                            .first()
                            .and_then(|g| g["groupId"].as_str())
                        else {
                            continue;
                        };
                        RuleSource::Group(self.sg_id_to_name(group_id).await?)
                    }
                };

                rules.insert(SecurityGroupRule::new(
                    name,
                    source,
                    text_u32(&perm["fromPort"]).map(|p| p as u16),
                    text_u32(&perm["toPort"]).map(|p| p as u16),
                    perm["ipProtocol"].as_str().unwrap_or_default(),
                ));
            }
        }

        Ok((groups, rules))
    }

    async fn create_node(&self, node: &mut Node) -> Result<(), DriverError> {
        info!("Launching node: {}", node.name);

        let mut params: Vec<(String, String)> = vec![
            ("ImageId".into(), self.apply_mappings("images", &node.image)),
            ("InstanceType".into(), self.apply_mappings("flavors", &node.flavor)),
            ("MinCount".into(), "1".into()),
            ("MaxCount".into(), "1".into()),
            ("BlockDeviceMapping.1.DeviceName".into(), "/dev/sda1".into()),
            ("BlockDeviceMapping.1.Ebs.VolumeSize".into(), node.disk.to_string()),
        ];

        for (idx, name) in node.sorted_security_group_names().iter().enumerate() {
            params.push((format!("SecurityGroup.{}", idx + 1), name.clone()));
        }

        if let Some(script) = &node.script {
            let encoded = base64::engine::general_purpose::STANDARD.encode(script);
            params.push(("UserData".into(), encoded));
        }

        if let Some(key_name) = self.key_name_from_config().await? {
            params.push(("KeyName".into(), key_name));
        }

        params.push((
            "TagSpecification.1.ResourceType".into(),
            "instance".into(),
        ));
        params.push(("TagSpecification.1.Tag.1.Key".into(), "Name".into()));
        params.push(("TagSpecification.1.Tag.1.Value".into(), node.name.clone()));
        if let Some(namespace) = &self.options.namespace {
            params.push(("TagSpecification.1.Tag.2.Key".into(), NAMESPACE_TAG.into()));
            params.push(("TagSpecification.1.Tag.2.Value".into(), namespace.clone()));
        }

        let resp = self
            .ec2("RunInstances", params)
            .await
            .map_err(Ec2Error::create)?;

        let instance = items(&resp["instancesSet"]);
        node.provider_id = instance
            .first()
            .and_then(|i| i["instanceId"].as_str())
            .map(str::to_string);

        info!("Launched node: {} ({:?})", node.name, node.provider_id);
        Ok(())
    }

    async fn create_security_group(&self, group: &SecurityGroup) -> Result<(), DriverError> {
        info!("Creating security group: {}", group.name);
        let result = self
            .ec2(
                "CreateSecurityGroup",
                vec![
                    ("GroupName".into(), group.name.clone()),
                    ("GroupDescription".into(), "some description".into()),
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            // Re-applying an existing topology is a no-op.
            Err(e) if e.code.starts_with("InvalidGroup.Duplicate") => {
                debug!("security group {} already exists", group.name);
                Ok(())
            }
            Err(e) => Err(e.create()),
        }
    }

    async fn create_security_group_rule(
        &self,
        rule: &SecurityGroupRule,
    ) -> Result<(), DriverError> {
        info!("Creating firewall rule: {}", rule);

        // Rule authorization wants the group's id, not its name.
        let group_id = self.sg_name_to_id(&rule.security_group).await?;

        let mut params: Vec<(String, String)> = vec![
            ("GroupId".into(), group_id),
            ("IpPermissions.1.IpProtocol".into(), rule.protocol.clone()),
        ];
        if let Some(from) = rule.from_port {
            params.push(("IpPermissions.1.FromPort".into(), from.to_string()));
        }
        if let Some(to) = rule.to_port {
            params.push(("IpPermissions.1.ToPort".into(), to.to_string()));
        }
        match &rule.source {
            RuleSource::Cidr(cidr) => {
                params.push(("IpPermissions.1.IpRanges.1.CidrIp".into(), cidr.clone()));
            }
            RuleSource::Group(group) => {
                params.push(("IpPermissions.1.Groups.1.GroupName".into(), group.clone()));
            }
        }

        self.ec2("AuthorizeSecurityGroupIngress", params)
            .await
            .map_err(Ec2Error::create)?;
        Ok(())
    }

    async fn delete_node(&self, node: &Node) -> Result<(), DriverError> {
        let instance_id = node
            .provider_id
            .as_deref()
            .ok_or_else(|| DriverError::DeleteFailed(format!("node {} has no instance id", node.name)))?;
        self.ec2(
            "TerminateInstances",
            vec![("InstanceId.1".into(), instance_id.to_string())],
        )
        .await
        .map_err(Ec2Error::delete)?;
        Ok(())
    }

    fn cluster_data(&self, collection: &Collection) -> Value {
        let collection = collection.original();
        let mut containers = self.default_containers(collection);
        containers.extend(collection.containers.iter().cloned());
        json!({
            "containers": containers,
            "proxyconf": proxyconf(collection),
        })
    }
}

// ── SigV4 signing ─────────────────────────────────────────────────────────────

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn derive_signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn url_host(url: &str) -> &str {
    let without_scheme = url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    match without_scheme.find('/') {
        Some(pos) => &without_scheme[..pos],
        None => without_scheme,
    }
}

/// Build SigV4 request headers for an AWS Query API call.
#[allow(clippy::too_many_arguments)]
fn sigv4_headers(
    method: &str,
    uri_path: &str,
    query_string: &str,
    content_type: &str,
    body: &[u8],
    access_key: &str,
    secret_key: &str,
    region: &str,
    service: &str,
    host: &str,
) -> BTreeMap<String, String> {
    let now = chrono::Utc::now();
    let timestamp = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    let payload_hash = sha256_hex(body);

    // Canonical headers must be sorted and lowercased.
    let mut canon_hdrs: BTreeMap<String, String> = BTreeMap::new();
    canon_hdrs.insert("content-type".into(), content_type.into());
    canon_hdrs.insert("host".into(), host.into());
    canon_hdrs.insert("x-amz-content-sha256".into(), payload_hash.clone());
    canon_hdrs.insert("x-amz-date".into(), timestamp.clone());

    let signed_headers: String = canon_hdrs.keys().cloned().collect::<Vec<_>>().join(";");
    let canonical_headers: String = canon_hdrs
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method, uri_path, query_string, canonical_headers, signed_headers, payload_hash
    );

    let scope = format!("{}/{}/{}/aws4_request", date, region, service);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        timestamp,
        scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(secret_key, &date, region, service);
    let signature = hmac_sha256(&signing_key, string_to_sign.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>();

    let auth = format!(
        "AWS4-HMAC-SHA256 Credential={}/{},SignedHeaders={},Signature={}",
        access_key, scope, signed_headers, signature
    );

    let mut out = BTreeMap::new();
    out.insert("Authorization".into(), auth);
    out.insert("x-amz-date".into(), timestamp);
    out.insert("x-amz-content-sha256".into(), payload_hash);
    out
}

// ── XML helpers ───────────────────────────────────────────────────────────────

/// Parse an EC2 XML response into a JSON-ish tree: elements become object
/// keys, repeated siblings become arrays, leaf text becomes strings.
fn xml_to_value(xml: &str) -> Value {
    let mut reader = XmlReader::from_str(xml);
    reader.config_mut().trim_text(true);

    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(_)) => return parse_children(&mut reader),
            Ok(XmlEvent::Eof) | Err(_) => return Value::Null,
            _ => {}
        }
    }
}

fn parse_children(reader: &mut XmlReader<&[u8]>) -> Value {
    let mut map = serde_json::Map::new();
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                let child = parse_children(reader);
                insert_multi(&mut map, name, child);
            }
            Ok(XmlEvent::Empty(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                insert_multi(&mut map, name, Value::String(String::new()));
            }
            Ok(XmlEvent::Text(t)) => {
                if let Ok(s) = t.unescape() {
                    text.push_str(&s);
                }
            }
            Ok(XmlEvent::End(_)) | Ok(XmlEvent::Eof) | Err(_) => break,
            _ => {}
        }
    }

    if map.is_empty() {
        Value::String(text.trim().to_string())
    } else {
        Value::Object(map)
    }
}

fn insert_multi(map: &mut serde_json::Map<String, Value>, key: String, value: Value) {
    match map.get_mut(&key) {
        None => {
            map.insert(key, value);
        }
        Some(Value::Array(existing)) => existing.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
    }
}

/// The members of an EC2 list element: `<x><item>…</item><item>…</item></x>`.
/// Handles the absent, single-item and multi-item forms uniformly.
fn items(value: &Value) -> Vec<&Value> {
    match &value["item"] {
        Value::Array(list) => list.iter().collect(),
        Value::Null => Vec::new(),
        single => vec![single],
    }
}

fn text_u32(value: &Value) -> Option<u32> {
    value.as_str().and_then(|s| s.parse().ok())
}

/// Instance tags as a key → value map.
fn tag_map(instance: &Value) -> HashMap<String, String> {
    items(&instance["tagSet"])
        .iter()
        .filter_map(|t| {
            Some((
                t["key"].as_str()?.to_string(),
                t["value"].as_str().unwrap_or_default().to_string(),
            ))
        })
        .collect()
}

/// Find the text content of the first `<tag>…</tag>` element. Used for
/// error envelopes only; structured responses go through [`xml_to_value`].
fn xml_text(xml: &str, tag: &str) -> Option<String> {
    let value = xml_to_value(xml);
    find_key(&value, tag).and_then(|v| v.as_str().map(str::to_string))
}

fn find_key<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map
            .get(key)
            .or_else(|| map.values().find_map(|v| find_key(v, key))),
        Value::Array(list) => list.iter().find_map(|v| find_key(v, key)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn test_config() -> AwsDriverConfig {
        AwsDriverConfig {
            access_key: "AKIDEXAMPLE".into(),
            secret_key: "wJalrXUtnFEMI".into(),
            region: "eu-west-1".into(),
            ssh_key_file: None,
        }
    }

    fn driver(server: &MockServer) -> AwsDriver {
        AwsDriver::with_base_url(test_config(), DriverOptions::default(), server.uri())
    }

    fn body_of(request: &Request) -> String {
        String::from_utf8_lossy(&request.body).into_owned()
    }

    /// Mock responder keyed on the `Action` form field.
    async fn mount_action(server: &MockServer, action: &str, body: &str) {
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_string_contains(format!("Action={}", action)))
            .respond_with(ResponseTemplate::new(200).set_body_string(body.to_string()))
            .mount(server)
            .await;
    }

    const SECURITY_GROUPS_XML: &str = r#"<?xml version="1.0"?>
<DescribeSecurityGroupsResponse>
  <securityGroupInfo>
    <item>
      <groupId>sg-1111</groupId>
      <groupName>default</groupName>
      <ipPermissions>
        <item>
          <ipProtocol>udp</ipProtocol>
          <fromPort>8080</fromPort>
          <toPort>8081</toPort>
          <groups>
            <item><groupId>sg-2222</groupId></item>
          </groups>
          <ipRanges/>
        </item>
      </ipPermissions>
    </item>
    <item>
      <groupId>sg-2222</groupId>
      <groupName>www</groupName>
      <ipPermissions>
        <item>
          <ipProtocol>tcp</ipProtocol>
          <fromPort>80</fromPort>
          <toPort>80</toPort>
          <ipRanges>
            <item><cidrIp>0.0.0.0/0</cidrIp></item>
          </ipRanges>
        </item>
      </ipPermissions>
    </item>
  </securityGroupInfo>
</DescribeSecurityGroupsResponse>"#;

    const INSTANCES_XML: &str = r#"<?xml version="1.0"?>
<DescribeInstancesResponse>
  <reservationSet>
    <item>
      <instancesSet>
        <item>
          <instanceId>i-0live</instanceId>
          <imageId>ami-dead</imageId>
          <instanceType>t2.micro</instanceType>
          <instanceState><code>16</code><name>running</name></instanceState>
          <ipAddress>203.0.113.10</ipAddress>
          <tagSet>
            <item><key>Name</key><value>web1</value></item>
          </tagSet>
          <groupSet>
            <item><groupId>sg-2222</groupId><groupName>www</groupName></item>
          </groupSet>
          <blockDeviceMapping>
            <item>
              <deviceName>/dev/sda1</deviceName>
              <ebs><volumeId>vol-0001</volumeId></ebs>
            </item>
          </blockDeviceMapping>
        </item>
        <item>
          <instanceId>i-0gone</instanceId>
          <imageId>ami-dead</imageId>
          <instanceType>t2.micro</instanceType>
          <instanceState><code>48</code><name>terminated</name></instanceState>
          <tagSet>
            <item><key>Name</key><value>old1</value></item>
          </tagSet>
          <blockDeviceMapping>
            <item><ebs><volumeId>vol-0002</volumeId></ebs></item>
          </blockDeviceMapping>
        </item>
      </instancesSet>
    </item>
  </reservationSet>
</DescribeInstancesResponse>"#;

    const VOLUMES_XML: &str = r#"<?xml version="1.0"?>
<DescribeVolumesResponse>
  <volumeSet>
    <item><volumeId>vol-0001</volumeId><size>10</size></item>
    <item><volumeId>vol-0002</volumeId><size>99</size></item>
  </volumeSet>
</DescribeVolumesResponse>"#;

    #[test]
    fn xml_tree_handles_single_and_multi_items() {
        let value = xml_to_value(VOLUMES_XML);
        assert_eq!(items(&value["volumeSet"]).len(), 2);

        let one = xml_to_value("<r><s><item><id>a</id></item></s></r>");
        assert_eq!(items(&one["s"]).len(), 1);
        assert_eq!(items(&one["s"])[0]["id"], "a");

        let none = xml_to_value("<r><s/></r>");
        assert!(items(&none["s"]).is_empty());
    }

    #[test]
    fn signing_key_derivation_is_stable() {
        // The AWS documented test vector for the signing key input.
        let key = derive_signing_key("wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY", "20120215", "us-east-1", "iam");
        let hex: String = key.iter().map(|b| format!("{:02x}", b)).collect();
        assert_eq!(
            hex,
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[tokio::test]
    async fn detect_firewalls_resolves_source_group_by_id() {
        let server = MockServer::start().await;
        mount_action(&server, "DescribeSecurityGroups", SECURITY_GROUPS_XML).await;

        let driver = driver(&server);
        let (groups, rules) = driver.detect_firewalls().await.unwrap();

        assert_eq!(groups.len(), 2);
        let group_rule = rules
            .iter()
            .find(|r| r.security_group == "default")
            .unwrap();
        assert_eq!(group_rule.source.source_group(), Some("www"));
        assert_eq!(group_rule.from_port, Some(8080));
        assert_eq!(group_rule.to_port, Some(8081));
        assert_eq!(group_rule.protocol, "udp");
    }

    #[tokio::test]
    async fn detect_nodes_skips_dead_states_and_maps_disk() {
        let server = MockServer::start().await;
        mount_action(&server, "DescribeInstances", INSTANCES_XML).await;
        mount_action(&server, "DescribeVolumes", VOLUMES_XML).await;

        let driver = driver(&server);
        let nodes = driver.detect_nodes().await.unwrap();

        assert_eq!(nodes.len(), 1);
        let node = &nodes[0];
        assert_eq!(node.name, "web1");
        assert_eq!(node.disk, 10);
        assert_eq!(node.flavor, "t2.micro");
        assert_eq!(node.security_group_names, vec!["www"]);
        assert_eq!(node.public_ips, vec!["203.0.113.10"]);
    }

    #[tokio::test]
    async fn duplicate_security_group_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("Action=CreateSecurityGroup"))
            .respond_with(ResponseTemplate::new(400).set_body_string(
                "<Response><Errors><Error><Code>InvalidGroup.Duplicate</Code>\
                 <Message>already exists</Message></Error></Errors></Response>",
            ))
            .mount(&server)
            .await;

        let driver = driver(&server);
        driver
            .create_security_group(&SecurityGroup::new("www"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn other_create_errors_propagate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("Action=CreateSecurityGroup"))
            .respond_with(ResponseTemplate::new(400).set_body_string(
                "<Response><Errors><Error><Code>VpcLimitExceeded</Code>\
                 <Message>too many</Message></Error></Errors></Response>",
            ))
            .mount(&server)
            .await;

        let driver = driver(&server);
        let err = driver
            .create_security_group(&SecurityGroup::new("www"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("VpcLimitExceeded"));
    }

    #[tokio::test]
    async fn rule_authorization_uses_group_id() {
        let server = MockServer::start().await;
        mount_action(&server, "DescribeSecurityGroups", SECURITY_GROUPS_XML).await;
        Mock::given(method("POST"))
            .and(body_string_contains("Action=AuthorizeSecurityGroupIngress"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<AuthorizeSecurityGroupIngressResponse><return>true</return>\
                 </AuthorizeSecurityGroupIngressResponse>",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let driver = driver(&server);
        let rule = SecurityGroupRule::new(
            "www",
            RuleSource::Cidr("0.0.0.0/0".into()),
            Some(80),
            Some(80),
            "tcp",
        );
        driver.create_security_group_rule(&rule).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let authorize = requests
            .iter()
            .map(body_of)
            .find(|b| b.contains("Action=AuthorizeSecurityGroupIngress"))
            .unwrap();
        assert!(authorize.contains("GroupId=sg-2222"), "got: {authorize}");
    }

    #[tokio::test]
    async fn run_instances_carries_block_device_and_tags() {
        let server = MockServer::start().await;
        mount_action(
            &server,
            "RunInstances",
            "<RunInstancesResponse><instancesSet><item>\
             <instanceId>i-0new</instanceId></item></instancesSet>\
             </RunInstancesResponse>",
        )
        .await;

        let mut options = DriverOptions::default();
        options.namespace = Some("prod".into());
        let driver =
            AwsDriver::with_base_url(test_config(), options, server.uri());

        let mut node = Node::new("web1", "t2.micro", "ami-dead", 10);
        node.script = Some("#!/bin/sh\n".into());
        driver.create_node(&mut node).await.unwrap();
        assert_eq!(node.provider_id.as_deref(), Some("i-0new"));

        let requests = server.received_requests().await.unwrap();
        let body = body_of(&requests[0]);
        assert!(body.contains("BlockDeviceMapping.1.Ebs.VolumeSize=10"));
        assert!(body.contains(&format!("Tag.2.Key={}", NAMESPACE_TAG)));
        assert!(body.contains("UserData="));
    }
}
