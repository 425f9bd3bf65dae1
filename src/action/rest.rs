//! REST action
//!
//! Issues one HTTP request, retrying only transport failures, then checks
//! the status code, header and body validations, and extracts variables.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;

use super::invocation::{ActionOutcome, Invocation, InvocationContext, Services};
use super::template::{append_list, merge_data, merge_map, optional, scalar, MetaOverride};
use super::ActionMeta;
use crate::common::{short_target, Error, Result};
use crate::diagram::Payload;
use crate::expr::{
    eval_expression, eval_predicate, resolve_map, resolve_string, resolve_value, root_name,
    Bindings, ExpressionError,
};
use crate::scenario::VariableCache;

const DEFAULT_STATUS_CODES: [u16; 3] = [200, 201, 204];

/// REST action definition as written in scenario files
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RestDefinition {
    pub service_name: Option<String>,
    pub url: Option<String>,
    pub method: Option<String>,
    pub query_parameters: Option<BTreeMap<String, String>>,
    pub headers: Option<BTreeMap<String, String>>,
    pub form: Option<BTreeMap<String, String>>,
    pub data: Option<Value>,
    pub data_file: Option<String>,
    pub data_from_cache: Option<String>,
    pub response_validation: Option<Vec<String>>,
    pub variables: Option<BTreeMap<String, String>>,
    pub expected_status_codes: Option<Vec<u16>>,
    pub client_certificate: Option<String>,
    pub client_key: Option<String>,
    pub binary_response: Option<bool>,
}

/// A single HTTP request with response checks
#[derive(Debug, Clone, PartialEq)]
pub struct RestAction {
    pub meta: ActionMeta,
    pub service_name: Option<String>,
    pub url: String,
    pub method: String,
    pub query_parameters: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub form: BTreeMap<String, String>,
    pub data: Option<Value>,
    pub data_file: Option<String>,
    pub data_from_cache: Option<String>,
    pub response_validation: Vec<String>,
    pub variables: BTreeMap<String, String>,
    pub expected_status_codes: Vec<u16>,
    pub client_certificate: Option<String>,
    pub client_key: Option<String>,
    pub binary_response: bool,
}

/// Request body after resolution
#[derive(Debug, Clone)]
enum RequestBody {
    None,
    Json(Value),
    Form(BTreeMap<String, String>),
    File(PathBuf),
}

/// Everything needed to send the request, resolved against the cache
#[derive(Debug, Clone)]
struct PreparedRequest {
    method: reqwest::Method,
    url: String,
    query: BTreeMap<String, String>,
    headers: BTreeMap<String, String>,
    body: RequestBody,
}

impl RestAction {
    pub fn from_definition(meta: MetaOverride, def: RestDefinition) -> Result<Self> {
        let url = def.url.ok_or_else(|| {
            Error::Config(format!("REST action '{}' has no url", meta.name))
        })?;
        Ok(Self {
            meta: meta.into_meta(),
            service_name: def.service_name,
            url,
            method: def.method.unwrap_or_else(|| "GET".to_string()),
            query_parameters: def.query_parameters.unwrap_or_default(),
            headers: def.headers.unwrap_or_default(),
            form: def.form.unwrap_or_default(),
            data: def.data,
            data_file: def.data_file,
            data_from_cache: def.data_from_cache,
            response_validation: def.response_validation.unwrap_or_default(),
            variables: def.variables.unwrap_or_default(),
            expected_status_codes: def
                .expected_status_codes
                .unwrap_or_else(|| DEFAULT_STATUS_CODES.to_vec()),
            client_certificate: def.client_certificate,
            client_key: def.client_key,
            binary_response: def.binary_response.unwrap_or(false),
        })
    }

    pub fn from_template(meta: MetaOverride, def: RestDefinition, template: &Self) -> Self {
        Self {
            meta: meta.merge(&template.meta),
            service_name: optional(def.service_name, &template.service_name),
            url: scalar(def.url, &template.url),
            method: scalar(def.method, &template.method),
            query_parameters: merge_map(&template.query_parameters, def.query_parameters),
            headers: merge_map(&template.headers, def.headers),
            form: merge_map(&template.form, def.form),
            data: merge_data(&template.data, def.data),
            data_file: optional(def.data_file, &template.data_file),
            data_from_cache: optional(def.data_from_cache, &template.data_from_cache),
            response_validation: append_list(&template.response_validation, def.response_validation),
            variables: merge_map(&template.variables, def.variables),
            expected_status_codes: scalar(def.expected_status_codes, &template.expected_status_codes),
            client_certificate: optional(def.client_certificate, &template.client_certificate),
            client_key: optional(def.client_key, &template.client_key),
            binary_response: scalar(def.binary_response, &template.binary_response),
        }
    }

    pub fn describe(&self) -> String {
        format!("{} {}", self.method.to_uppercase(), self.url)
    }

    /// Expressions evaluated after the response arrives
    pub fn expressions(&self) -> impl Iterator<Item = &str> {
        self.response_validation
            .iter()
            .chain(self.variables.values())
            .map(String::as_str)
    }

    fn target(&self, url: &str) -> String {
        self.service_name
            .clone()
            .unwrap_or_else(|| short_target(url))
    }

    fn prepare(&self, cache: &VariableCache) -> Result<PreparedRequest> {
        let method = reqwest::Method::from_bytes(self.method.to_uppercase().as_bytes())
            .map_err(|_| Error::Config(format!("Invalid HTTP method '{}'", self.method)))?;

        let body = if let Some(key) = &self.data_from_cache {
            let value = cache
                .get(key)
                .cloned()
                .ok_or_else(|| ExpressionError::UnknownName(key.clone()))?;
            RequestBody::Json(value)
        } else if let Some(path) = &self.data_file {
            RequestBody::File(PathBuf::from(resolve_string(path, cache)?))
        } else if let Some(data) = &self.data {
            RequestBody::Json(resolve_value(data, cache)?)
        } else if !self.form.is_empty() {
            RequestBody::Form(resolve_map(&self.form, cache)?)
        } else {
            RequestBody::None
        };

        Ok(PreparedRequest {
            method,
            url: resolve_string(&self.url, cache)?,
            query: resolve_map(&self.query_parameters, cache)?,
            headers: resolve_map(&self.headers, cache)?,
            body,
        })
    }

    pub fn invoke(&self, ctx: &InvocationContext<'_>) -> Invocation {
        let request = match self.prepare(ctx.cache) {
            Ok(request) => request,
            Err(e) => return Invocation::failed(e),
        };

        let action = self.clone();
        let cache = ctx.cache.clone();
        let services = ctx.services.clone();
        let scenario_id = ctx.scenario_id.to_string();

        Invocation::new(async move {
            action
                .execute(request, &cache, &services, &scenario_id)
                .await
        })
    }

    async fn execute(
        &self,
        request: PreparedRequest,
        cache: &VariableCache,
        services: &Services,
        scenario_id: &str,
    ) -> Result<ActionOutcome> {
        let target = self.target(&request.url);
        let client = self.client(services).await?;

        let (body_bytes, request_payload) = match &request.body {
            RequestBody::File(path) => {
                let bytes = tokio::fs::read(path)
                    .await
                    .map_err(|e| Error::file_read(path, e))?;
                let payload = Payload::Binary(bytes.clone());
                (Some(bytes), payload)
            }
            RequestBody::Json(value) => (None, Payload::Json(value.clone())),
            RequestBody::Form(form) => (
                None,
                Payload::Json(serde_json::to_value(form).unwrap_or(Value::Null)),
            ),
            RequestBody::None => (None, Payload::None),
        };

        let build = || {
            let mut builder = client
                .request(request.method.clone(), &request.url)
                .query(&request.query);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            match (&request.body, &body_bytes) {
                (RequestBody::File(_), Some(bytes)) => builder.body(bytes.clone()),
                (RequestBody::Json(value), _) => builder.json(value),
                (RequestBody::Form(form), _) => builder.form(form),
                _ => builder,
            }
        };

        let http = &services.config.http;
        let sent = send_with_retry(build, http.retry_attempts, http.retry_backoff(), &target).await;

        let summary = format!("{} {}", request.method, path_of(&request.url));
        services
            .diagram
            .record_request(scenario_id, &target, &summary, &request_payload);

        let response = sent?;
        let status = response.status().as_u16();
        let head = headers_value(response.headers());
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::transport(&target, e))?;

        if !self.expected_status_codes.contains(&status) {
            let raw = raw_payload(&bytes);
            services.diagram.record_response(
                scenario_id,
                &target,
                status,
                &raw,
                Some("unexpected status"),
            );
            return Err(Error::UnexpectedStatus {
                target,
                status,
                expected: self.expected_status_codes.clone(),
            });
        }

        let body = if bytes.is_empty() {
            Payload::None
        } else {
            parse_body(&bytes, &content_type, self.binary_response)?
        };
        let res = body.to_value();

        if let Err(e) = self.validate(cache, &head, &res, !body.is_empty()) {
            let message = e.to_string();
            services.diagram.record_response(
                scenario_id,
                &target,
                status,
                &body,
                Some(&message),
            );
            return Err(e);
        }

        services
            .diagram
            .record_response(scenario_id, &target, status, &body, None);

        Ok(ActionOutcome {
            variables: self.extract_variables(cache, &head, &res)?,
        })
    }

    /// Header predicates always run; body predicates only when a body arrived
    fn validate(&self, cache: &VariableCache, head: &Value, res: &Value, has_body: bool) -> Result<()> {
        let scope = Bindings::new(cache).with("head", head).with("res", res);

        let (header_checks, body_checks): (Vec<&String>, Vec<&String>) = self
            .response_validation
            .iter()
            .partition(|v| root_name(v).as_deref() == Some("head"));

        for predicate in header_checks {
            if !eval_predicate(predicate, &scope)? {
                return Err(Error::validation(predicate, "header check evaluated falsy"));
            }
        }

        if has_body {
            for predicate in body_checks {
                if !eval_predicate(predicate, &scope)? {
                    return Err(Error::validation(predicate, "body check evaluated falsy"));
                }
            }
        }
        Ok(())
    }

    fn extract_variables(
        &self,
        cache: &VariableCache,
        head: &Value,
        res: &Value,
    ) -> Result<Vec<(String, Value)>> {
        let mut writes = Vec::with_capacity(self.variables.len());
        for (key, source) in &self.variables {
            let value = match root_name(source).as_deref() {
                Some("res") => eval_expression(source, &Bindings::new(cache).with("res", res))?,
                Some("head") => eval_expression(source, &Bindings::new(cache).with("head", head))?,
                _ => eval_expression(source, cache)?,
            };
            writes.push((key.clone(), value));
        }
        Ok(writes)
    }

    /// Shared client, or a dedicated one carrying the mTLS identity
    async fn client(&self, services: &Services) -> Result<reqwest::Client> {
        let (cert, key) = match (&self.client_certificate, &self.client_key) {
            (None, None) => return Ok(services.http.clone()),
            (Some(cert), Some(key)) => (read_pem(cert).await?, read_pem(key).await?),
            _ => {
                return Err(Error::Config(format!(
                    "Action '{}' needs both clientCertificate and clientKey",
                    self.meta.name
                )))
            }
        };

        let identity = reqwest::Identity::from_pkcs8_pem(&cert, &key)
            .map_err(|e| Error::Config(format!("Invalid client certificate: {}", e)))?;
        reqwest::Client::builder()
            .identity(identity)
            .timeout(services.config.http.request_timeout())
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))
    }
}

/// Send with a fixed backoff between attempts; only transport failures retry
async fn send_with_retry<F>(
    build: F,
    attempts: u32,
    backoff: std::time::Duration,
    target: &str,
) -> Result<reqwest::Response>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match build().send().await {
            Ok(response) => return Ok(response),
            Err(e) if e.is_builder() => {
                return Err(Error::Config(format!(
                    "Invalid request to '{}': {}",
                    target, e
                )))
            }
            Err(e) if attempt < attempts => {
                tracing::warn!(attempt, service = %target, error = %e, "request failed, retrying");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(Error::transport(target, e)),
        }
    }
}

/// PEM text given inline or as a `file:` path
async fn read_pem(source: &str) -> Result<Vec<u8>> {
    match source.strip_prefix("file:") {
        Some(path) => {
            let path = PathBuf::from(path.trim());
            tokio::fs::read(&path)
                .await
                .map_err(|e| Error::file_read(&path, e))
        }
        None => Ok(source.as_bytes().to_vec()),
    }
}

fn path_of(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => match parsed.query() {
            Some(query) => format!("{}?{}", parsed.path(), query),
            None => parsed.path().to_string(),
        },
        Err(_) => url.to_string(),
    }
}

/// Response headers as an object of lowercase names; repeated headers are
/// joined with ", "
fn headers_value(headers: &reqwest::header::HeaderMap) -> Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match map.get_mut(name.as_str()) {
            Some(Value::String(existing)) => {
                existing.push_str(", ");
                existing.push_str(&value);
            }
            _ => {
                map.insert(name.as_str().to_string(), Value::String(value));
            }
        }
    }
    Value::Object(map)
}

fn is_json(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    essence == "application/json" || essence.ends_with("+json")
}

fn is_text(content_type: &str) -> bool {
    content_type.trim().to_ascii_lowercase().starts_with("text/plain")
}

fn parse_body(bytes: &[u8], content_type: &str, binary: bool) -> Result<Payload> {
    if binary {
        return Ok(Payload::Binary(bytes.to_vec()));
    }
    if is_json(content_type) {
        let value = serde_json::from_slice(bytes)
            .map_err(|e| Error::Protocol(format!("Response is not valid JSON: {}", e)))?;
        return Ok(Payload::Json(value));
    }
    if is_text(content_type) {
        return Ok(Payload::Text(String::from_utf8_lossy(bytes).into_owned()));
    }
    Ok(Payload::Binary(bytes.to_vec()))
}

fn raw_payload(bytes: &[u8]) -> Payload {
    match std::str::from_utf8(bytes) {
        Ok("") => Payload::None,
        Ok(text) => Payload::Text(text.to_string()),
        Err(_) => Payload::Binary(bytes.to_vec()),
    }
}
