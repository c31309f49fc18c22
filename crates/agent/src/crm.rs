//! CRM REST client and the tool catalog built on it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::debug;

use crate::tools::{
    ParamKind, ParamSpec, RegistryError, ToolDescriptor, ToolError, ToolHandler, ToolRegistry,
};

const BODY_PREVIEW_CHARS: usize = 200;
const CONTACTS_PATH: &str = "/crm/api/v2/contacts";
const CONTACT_ADDRESSES_PATH: &str = "/crm/api/v2/contacts/addresses";

#[derive(Clone, Debug)]
pub struct CrmClient {
    http: reqwest::Client,
}

impl CrmClient {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    async fn send(
        &self,
        session: &CrmSession,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ToolError> {
        let url = format!("{}{}", session.instance_url.trim_end_matches('/'), path);
        debug!(event_name = "crm.request", method = %method, path, "calling CRM");

        let mut request = self
            .http
            .request(method, &url)
            .header(AUTHORIZATION, session.api_key.expose_secret());
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|error| {
            if error.is_timeout() {
                ToolError::new(format!("CRM request to {path} timed out"))
            } else {
                ToolError::new(format!("CRM request to {path} failed: {error}"))
            }
        })?;

        decode_response(response).await
    }
}

async fn decode_response(response: reqwest::Response) -> Result<Value, ToolError> {
    let status = response.status();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let body = response
        .text()
        .await
        .map_err(|error| ToolError::with_status(status.as_u16(), format!("could not read CRM response: {error}")))?;

    if content_type.contains("text/html") || body.trim_start().starts_with('<') {
        return Err(ToolError::with_status(
            status.as_u16(),
            format!(
                "CRM returned HTML instead of JSON (status {}); check the instance URL and API key: {}",
                status.as_u16(),
                preview(&body)
            ),
        ));
    }

    if !status.is_success() {
        return Err(ToolError::with_status(
            status.as_u16(),
            format!("CRM request failed with status {}: {}", status.as_u16(), preview(&body)),
        ));
    }

    if body.trim().is_empty() {
        return Ok(Value::Null);
    }

    serde_json::from_str(&body).map_err(|error| {
        ToolError::with_status(
            status.as_u16(),
            format!("CRM response was not valid JSON ({error}): {}", preview(&body)),
        )
    })
}

fn preview(body: &str) -> String {
    body.chars().take(BODY_PREVIEW_CHARS).collect()
}

/// Per-request handler context: which CRM instance to call and with which key.
#[derive(Clone)]
pub struct CrmSession {
    pub client: CrmClient,
    pub instance_url: String,
    pub api_key: SecretString,
}

impl std::fmt::Debug for CrmSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrmSession")
            .field("instance_url", &self.instance_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl CrmSession {
    pub fn new(client: CrmClient, instance_url: impl Into<String>, api_key: SecretString) -> Self {
        Self { client, instance_url: instance_url.into(), api_key }
    }

    pub async fn get(&self, path: &str) -> Result<Value, ToolError> {
        self.client.send(self, Method::GET, path, None).await
    }

    async fn save(&self, collection: &str, data: &Value) -> Result<Value, ToolError> {
        match data.get("uuid").and_then(Value::as_str).filter(|uuid| !uuid.is_empty()) {
            Some(raw) => {
                let uuid = uuid::Uuid::parse_str(raw).map_err(|_| {
                    ToolError::invalid_arguments(format!("`uuid` must be a valid uuid, got `{raw}`"))
                })?;
                let path = format!("{collection}/{uuid}");
                self.client.send(self, Method::PUT, &path, Some(data)).await
            }
            None => self.client.send(self, Method::POST, collection, Some(data)).await,
        }
    }
}

/// Fixed-path GET.
struct Endpoint {
    path: &'static str,
}

#[async_trait]
impl ToolHandler<CrmSession> for Endpoint {
    async fn call(&self, _arguments: Value, ctx: &CrmSession) -> Result<Value, ToolError> {
        ctx.get(self.path).await
    }
}

/// GET of `{prefix}/{uuid}` where the uuid comes from one argument.
struct ByUuid {
    prefix: &'static str,
    param: &'static str,
}

#[async_trait]
impl ToolHandler<CrmSession> for ByUuid {
    async fn call(&self, arguments: Value, ctx: &CrmSession) -> Result<Value, ToolError> {
        let uuid = arguments
            .get(self.param)
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::invalid_arguments(format!("`{}` is required", self.param)))?;
        ctx.get(&format!("{}/{uuid}", self.prefix)).await
    }
}

struct SearchContacts;

#[async_trait]
impl ToolHandler<CrmSession> for SearchContacts {
    async fn call(&self, arguments: Value, ctx: &CrmSession) -> Result<Value, ToolError> {
        let query = arguments.get("query").and_then(Value::as_str).unwrap_or_default();
        let contacts = ctx.get(CONTACTS_PATH).await?;
        Ok(Value::Array(filter_records(&contacts, query)))
    }
}

/// Case-insensitive substring match over each record's JSON text.
fn filter_records(listing: &Value, query: &str) -> Vec<Value> {
    let needle = query.trim().to_lowercase();
    records(listing)
        .iter()
        .filter(|record| record.to_string().to_lowercase().contains(&needle))
        .cloned()
        .collect()
}

/// The CRM wraps list results in a page object on some endpoints.
fn records(listing: &Value) -> &[Value] {
    match listing {
        Value::Array(items) => items,
        Value::Object(object) => ["content", "data", "items", "results", "contacts"]
            .iter()
            .find_map(|key| object.get(*key).and_then(Value::as_array))
            .map(Vec::as_slice)
            .unwrap_or_default(),
        _ => &[],
    }
}

struct SaveContact;

#[async_trait]
impl ToolHandler<CrmSession> for SaveContact {
    async fn call(&self, arguments: Value, ctx: &CrmSession) -> Result<Value, ToolError> {
        let data = arguments
            .get("contact_data")
            .ok_or_else(|| ToolError::invalid_arguments("`contact_data` is required"))?;
        ctx.save(CONTACTS_PATH, data).await
    }
}

struct SaveContactAddress;

#[async_trait]
impl ToolHandler<CrmSession> for SaveContactAddress {
    async fn call(&self, arguments: Value, ctx: &CrmSession) -> Result<Value, ToolError> {
        let data = arguments
            .get("address_data")
            .ok_or_else(|| ToolError::invalid_arguments("`address_data` is required"))?;
        let has_contact = data
            .get("contact.uuid")
            .and_then(Value::as_str)
            .map(|uuid| !uuid.trim().is_empty())
            .unwrap_or(false);
        if !has_contact {
            return Err(ToolError::invalid_arguments("address_data must include `contact.uuid`"));
        }
        ctx.save(CONTACT_ADDRESSES_PATH, data).await
    }
}

const LIST_ENDPOINTS: &[(&str, &str, &str)] = &[
    (
        "get_contacts",
        "/crm/api/v2/contacts?page=1&size=10",
        "Retrieve contacts from the CRM system. Returns a list of contact records with their details.",
    ),
    (
        "get_contact_relationships",
        "/crm/api/v2/contacts/relationships",
        "Get relationships between contacts (e.g. family members, colleagues, references).",
    ),
    (
        "get_contact_addresses",
        CONTACT_ADDRESSES_PATH,
        "Retrieve all addresses associated with contacts in the CRM.",
    ),
    (
        "get_companies",
        "/crm/api/v2/companies",
        "Retrieve all companies from the CRM system. Returns a list of company records.",
    ),
    (
        "get_company_relationships",
        "/crm/api/v2/companies/relationships",
        "Get relationships between companies (e.g. parent companies, subsidiaries, partners).",
    ),
    (
        "get_company_addresses",
        "/crm/api/v2/companies/addresses",
        "Retrieve all addresses associated with companies in the CRM.",
    ),
    (
        "get_system_fields",
        "/crm/api/v2/system-fields",
        "Get all system-defined fields and their metadata from the CRM.",
    ),
    (
        "get_contact_system_fields",
        "/crm/api/v2/custom-fields/contacts",
        "Get custom field definitions for contacts in the CRM system.",
    ),
    (
        "get_company_system_fields",
        "/crm/api/v2/custom-fields/companies",
        "Get custom field definitions for companies in the CRM system.",
    ),
];

/// Registers the full CRM catalog in a stable order.
pub fn register_crm_tools(registry: &mut ToolRegistry<CrmSession>) -> Result<(), RegistryError> {
    for &(name, path, description) in LIST_ENDPOINTS {
        registry.register(ToolDescriptor::read(name, description), Endpoint { path })?;
    }

    registry
        .register(
            ToolDescriptor::read(
                "get_contact_by_uuid",
                "Get a specific contact by their UUID.",
            )
            .with_param(ParamSpec::required(
                "contact_uuid",
                ParamKind::Uuid,
                "The UUID of the contact to retrieve",
            )),
            ByUuid { prefix: CONTACTS_PATH, param: "contact_uuid" },
        )?
        .register(
            ToolDescriptor::read(
                "get_contact_addresses_by_uuid",
                "Get the addresses of a specific contact by the contact's UUID.",
            )
            .with_param(ParamSpec::required(
                "contact_uuid",
                ParamKind::Uuid,
                "The UUID of the contact whose addresses to retrieve",
            )),
            ByUuid { prefix: CONTACT_ADDRESSES_PATH, param: "contact_uuid" },
        )?
        .register(
            ToolDescriptor::read(
                "search_contacts",
                "Search for contacts by name, email, or other criteria. Returns matching contact records.",
            )
            .with_param(ParamSpec::required(
                "query",
                ParamKind::String,
                "Search query (name, email, phone, etc.)",
            )),
            SearchContacts,
        )?
        .register(
            ToolDescriptor::write(
                "save_contact",
                "Create a new contact or update an existing contact in the CRM system. Include `uuid` in contact_data to update.",
            )
            .with_param(ParamSpec::required(
                "contact_data",
                ParamKind::Object,
                "Contact fields as a JSON object",
            )),
            SaveContact,
        )?
        .register(
            ToolDescriptor::write(
                "save_contact_address",
                "Create or update a contact address. address_data must carry `contact.uuid`; include `uuid` to update.",
            )
            .with_param(ParamSpec::required(
                "address_data",
                ParamKind::Object,
                "Address fields as a JSON object",
            )),
            SaveContactAddress,
        )?;

    Ok(())
}

pub fn crm_registry() -> Result<ToolRegistry<CrmSession>, RegistryError> {
    let mut registry = ToolRegistry::new();
    register_crm_tools(&mut registry)?;
    Ok(registry)
}
