//! Nginx virtual-host templates
//!
//! A template is plain text with `{{NAME}}` placeholders. It is tokenized
//! once; unknown names and unterminated placeholders are rejected before
//! anything is rendered.

use serde::Serialize;

use crate::errors::DeployError;

/// Placeholders a site template may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    Subdomain,
    ContainerName,
    Port,
    TenantId,
    DatasetId,
}

impl Placeholder {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "SUBDOMAIN" => Some(Placeholder::Subdomain),
            "CONTAINER_NAME" => Some(Placeholder::ContainerName),
            "PORT" => Some(Placeholder::Port),
            "TENANT_ID" => Some(Placeholder::TenantId),
            "DATASET_ID" => Some(Placeholder::DatasetId),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Placeholder),
}

/// Values substituted into a site template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteFields {
    pub subdomain: String,
    pub container_name: String,
    pub port: u16,
    pub tenant_id: String,
    pub dataset_id: String,
}

impl RouteFields {
    fn value(&self, placeholder: Placeholder) -> String {
        match placeholder {
            Placeholder::Subdomain => self.subdomain.clone(),
            Placeholder::ContainerName => self.container_name.clone(),
            Placeholder::Port => self.port.to_string(),
            Placeholder::TenantId => self.tenant_id.clone(),
            Placeholder::DatasetId => self.dataset_id.clone(),
        }
    }
}

/// A tokenized site template.
#[derive(Debug, Clone)]
pub struct ProxyTemplate {
    segments: Vec<Segment>,
}

impl ProxyTemplate {
    pub fn parse(text: &str) -> Result<Self, DeployError> {
        let mut segments = Vec::new();
        let mut rest = text;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after_open = &rest[start + 2..];
            let end = after_open.find("}}").ok_or_else(|| {
                DeployError::ProxyConfigFailure("unterminated '{{' in template".to_string())
            })?;
            let name = after_open[..end].trim();
            let placeholder = Placeholder::from_name(name).ok_or_else(|| {
                DeployError::ProxyConfigFailure(format!("unknown template placeholder '{}'", name))
            })?;
            segments.push(Segment::Field(placeholder));
            rest = &after_open[end + 2..];
        }

        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self { segments })
    }

    pub fn render(&self, fields: &RouteFields) -> String {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(text) => text.clone(),
                Segment::Field(placeholder) => fields.value(*placeholder),
            })
            .collect()
    }
}

/// Route read back out of a generated site file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteInfo {
    pub subdomain: String,
    pub container_name: String,
    pub port: u16,
}

impl RouteInfo {
    /// Read the first `server_name` and `proxy_pass http://host:port`
    /// directives from a site file.
    pub fn from_config(text: &str) -> Option<Self> {
        let mut subdomain = None;
        let mut upstream = None;

        for line in text.lines().map(str::trim) {
            if line.starts_with('#') {
                continue;
            }
            let mut words = line.split_whitespace();
            match words.next() {
                Some("server_name") if subdomain.is_none() => {
                    subdomain = words.next().map(|w| w.trim_end_matches(';').to_string());
                }
                Some("proxy_pass") if upstream.is_none() => {
                    upstream = words.next().map(|w| w.trim_end_matches(';').to_string());
                }
                _ => {}
            }
        }

        let upstream = upstream?;
        let host_port = upstream
            .strip_prefix("http://")
            .or_else(|| upstream.strip_prefix("https://"))?
            .trim_end_matches('/');
        let (container_name, port) = host_port.rsplit_once(':')?;

        Some(Self {
            subdomain: subdomain?,
            container_name: container_name.to_string(),
            port: port.parse().ok()?,
        })
    }
}
