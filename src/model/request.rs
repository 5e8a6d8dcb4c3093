//! Request classification and wire-invocation compilation.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{VolleyError, VolleyResult, VuContext, template};

/// Closed vocabulary of service-call methods. The specification key, the
/// wire event suffix and the argument shape all live in tables keyed by this
/// enum, so supporting a new method is a table edit, not new code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Create,
    Get,
    Find,
    Patch,
    Update,
    Delete,
    Remove,
}

impl Method {
    pub const ALL: [Method; 7] = [
        Method::Create,
        Method::Get,
        Method::Find,
        Method::Patch,
        Method::Update,
        Method::Delete,
        Method::Remove,
    ];

    /// The specification key this method is written under.
    pub fn key(self) -> &'static str {
        match self {
            Method::Create => "create",
            Method::Get => "get",
            Method::Find => "find",
            Method::Patch => "patch",
            Method::Update => "update",
            Method::Delete => "delete",
            Method::Remove => "remove",
        }
    }

    /// The event suffix appended to the service name on the wire.
    pub fn wire_suffix(self) -> &'static str {
        self.key()
    }

    pub fn from_key(key: &str) -> Option<Method> {
        Method::ALL.into_iter().find(|m| m.key() == key)
    }
}

/// One positional slot of a compiled argument list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgSlot {
    /// `id`, required for this method.
    Id,
    /// `id`, with a literal `null` occupying the position when absent so the
    /// following slots stay positionally aligned.
    IdOrNull,
    /// Appended only when present.
    Query,
    /// Appended only when present.
    Data,
    /// Appended only when present.
    Options,
}

/// Per-method argument shapes. Variant behavior is data, not duplicated
/// per-method functions.
fn arg_shape(method: Method) -> &'static [ArgSlot] {
    use ArgSlot::{Data, Id, IdOrNull, Options, Query};
    match method {
        Method::Create => &[Data, Options],
        Method::Get => &[Id],
        Method::Find => &[IdOrNull, Query, Options],
        Method::Patch | Method::Update => &[IdOrNull, Query, Data],
        Method::Delete | Method::Remove => &[IdOrNull, Query],
    }
}

/// The body of one method key: the service call to make and what to expect
/// back. All dynamic fields are raw JSON shapes, substituted per context at
/// dispatch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDetails {
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
    /// Combined call parameters: a `query` sub-key plus call options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledge: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

impl RequestDetails {
    /// `query`, or `params.query` when no top-level query is given.
    pub fn effective_query(&self) -> Option<&Value> {
        if self.query.is_some() {
            return self.query.as_ref();
        }
        self.params.as_ref().and_then(|p| p.get("query"))
    }

    /// `options`, or `params` stripped of its `query` sub-key.
    pub fn effective_options(&self) -> Option<Value> {
        if self.options.is_some() {
            return self.options.clone();
        }
        match &self.params {
            Some(Value::Object(map)) => {
                let mut rest = map.clone();
                rest.remove("query");
                if rest.is_empty() {
                    None
                } else {
                    Some(Value::Object(rest))
                }
            }
            Some(other) => Some(other.clone()),
            None => None,
        }
    }

    /// The literal service `authenticate` dispatches under a fixed event
    /// name regardless of method key.
    pub fn is_authenticate(&self) -> bool {
        self.service == "authenticate"
    }
}

/// How many keys of `spec` belong to the method vocabulary. Zero means the
/// step is not a service call and belongs to the delegate engine.
pub fn recognized_key_count(spec: &serde_json::Map<String, Value>) -> usize {
    spec.keys().filter(|k| Method::from_key(k).is_some()).count()
}

/// Find the single method key of a request specification and deserialize its
/// details. Zero or more than one recognized key is `UnrecognizedRequest`;
/// callers must not assume a default method.
pub fn classify(spec: &serde_json::Map<String, Value>) -> VolleyResult<(Method, RequestDetails)> {
    let mut found: Option<(Method, &Value)> = None;
    for (key, value) in spec {
        let Some(method) = Method::from_key(key) else {
            continue;
        };
        if found.is_some() {
            return Err(VolleyError::UnrecognizedRequest(format!(
                "more than one service method key in {:?}",
                spec.keys().collect::<Vec<_>>()
            )));
        }
        found = Some((method, value));
    }
    let Some((method, value)) = found else {
        return Err(VolleyError::UnrecognizedRequest(format!(
            "no service method key in {:?}",
            spec.keys().collect::<Vec<_>>()
        )));
    };

    let details: RequestDetails = serde_json::from_value(value.clone()).map_err(|err| {
        VolleyError::Scenario(format!("invalid {} request: {err}", method.key()))
    })?;
    if details.service.is_empty() {
        return Err(VolleyError::Scenario(format!(
            "{} request has an empty service name",
            method.key()
        )));
    }
    if details.data.is_none()
        && matches!(method, Method::Create | Method::Patch | Method::Update)
    {
        return Err(VolleyError::Scenario(format!(
            "{} request for service {:?} requires data",
            method.key(),
            details.service
        )));
    }
    if details.id.is_none() && method == Method::Get && !details.is_authenticate() {
        return Err(VolleyError::Scenario(format!(
            "get request for service {:?} requires an id",
            details.service
        )));
    }
    Ok((method, details))
}

/// A ready-to-dispatch wire invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledInvocation {
    pub event: String,
    pub arguments: Vec<Value>,
}

/// Substitute every dynamic field and assemble the positional argument list
/// from the method's shape table. Pure; the only collaborator touched is the
/// templating engine.
pub fn compile(method: Method, details: &RequestDetails, ctx: &VuContext) -> CompiledInvocation {
    if details.is_authenticate() {
        let data = details
            .data
            .as_ref()
            .map_or(Value::Null, |d| template(d, ctx));
        return CompiledInvocation {
            event: "authenticate".to_string(),
            arguments: vec![data],
        };
    }

    let event = format!("{}::{}", details.service, method.wire_suffix());
    let mut arguments = Vec::new();
    for slot in arg_shape(method) {
        match slot {
            ArgSlot::Id => {
                if let Some(id) = &details.id {
                    arguments.push(template(id, ctx));
                }
            }
            ArgSlot::IdOrNull => {
                arguments.push(details.id.as_ref().map_or(Value::Null, |id| template(id, ctx)));
            }
            ArgSlot::Query => {
                if let Some(query) = details.effective_query() {
                    arguments.push(template(query, ctx));
                }
            }
            ArgSlot::Data => {
                if let Some(data) = &details.data {
                    arguments.push(template(data, ctx));
                }
            }
            ArgSlot::Options => {
                if let Some(options) = details.effective_options() {
                    arguments.push(template(&options, ctx));
                }
            }
        }
    }

    CompiledInvocation { event, arguments }
}

/// A single capture expression: evaluate `json` against the reply body and
/// store the result under `as`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSpec {
    pub json: String,
    #[serde(rename = "as")]
    pub capture_as: String,
}

/// A single match assertion: evaluate `json` and compare against `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchSpec {
    pub json: String,
    pub value: Value,
}

/// Reply expectations for an acknowledgment wait. The reply payload is the
/// full callback-argument sequence, addressed as a JSON array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AckSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub capture: Vec<CaptureSpec>,
    #[serde(
        default,
        rename = "match",
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub matches: Vec<MatchSpec>,
}

/// Reply expectations for an out-of-band response on a named channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSpec {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub capture: Vec<CaptureSpec>,
    #[serde(
        default,
        rename = "match",
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub matches: Vec<MatchSpec>,
}

/// Borrowed view of the expectations shared by both reply kinds.
#[derive(Debug, Clone, Copy)]
pub struct ReplySpec<'a> {
    pub data: Option<&'a Value>,
    pub capture: &'a [CaptureSpec],
    pub matches: &'a [MatchSpec],
}

impl AckSpec {
    pub fn reply_spec(&self) -> ReplySpec<'_> {
        ReplySpec {
            data: self.data.as_ref(),
            capture: &self.capture,
            matches: &self.matches,
        }
    }
}

impl ResponseSpec {
    pub fn reply_spec(&self) -> ReplySpec<'_> {
        ReplySpec {
            data: self.data.as_ref(),
            capture: &self.capture,
            matches: &self.matches,
        }
    }
}

/// Capture and match blocks accept a single spec or a list of specs.
fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::Many(items) => items,
        OneOrMany::One(item) => vec![item],
    })
}
