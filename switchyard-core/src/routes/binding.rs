//! Reads `google.api.http` annotations off method descriptors.
use super::RouteError;
use super::template::PathTemplate;
use crate::types::resolve_path;
use http::Method;
use prost_reflect::{DynamicMessage, Kind, MethodDescriptor, Value};

const HTTP_RULE_EXTENSION: &str = "google.api.http";

/// Which part of the input message the HTTP request body carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodySelector {
    /// No body. Every field not bound by the path comes from the query string.
    None,
    /// `body: "*"`: the whole input message.
    Whole,
    /// `body: "field"`: one top-level field of the input message.
    Field(String),
}

impl BodySelector {
    fn parse(selector: &str) -> Self {
        match selector {
            "" => BodySelector::None,
            "*" => BodySelector::Whole,
            field => BodySelector::Field(field.to_string()),
        }
    }
}

/// One REST binding of a method.
#[derive(Debug, Clone)]
pub struct HttpBinding {
    pub verb: Method,
    pub template: PathTemplate,
    pub body: BodySelector,
    /// When set, only this output field is written to the response body.
    pub response_body: Option<String>,
}

impl HttpBinding {
    /// `POST /<package.Service>/<Method>` with the whole message as body.
    pub fn synthesized(method: &MethodDescriptor) -> Result<Self, RouteError> {
        let raw = format!("/{}/{}", method.parent_service().full_name(), method.name());
        let template = PathTemplate::parse(&raw).map_err(RouteError::InvalidTemplate)?;

        Ok(Self {
            verb: Method::POST,
            template,
            body: BodySelector::Whole,
            response_body: None,
        })
    }
}

/// The primary binding and its `additional_bindings`, validated against the method's messages.
pub fn http_bindings(method: &MethodDescriptor) -> Result<Vec<HttpBinding>, RouteError> {
    let Some(extension) = method
        .parent_pool()
        .get_extension_by_name(HTTP_RULE_EXTENSION)
    else {
        return Ok(Vec::new());
    };

    let options = method.options();
    if !options.has_extension(&extension) {
        return Ok(Vec::new());
    }

    let rule = options.get_extension(&extension);
    let Some(rule) = rule.as_message() else {
        return Ok(Vec::new());
    };

    let mut bindings = vec![parse_rule(method, rule)?];

    if let Some(additional) = rule
        .get_field_by_name("additional_bindings")
        .as_deref()
        .and_then(Value::as_list)
    {
        for nested in additional.iter().filter_map(Value::as_message) {
            bindings.push(parse_rule(method, nested)?);
        }
    }

    Ok(bindings)
}

fn string_field(message: &DynamicMessage, name: &str) -> Option<String> {
    if !message.has_field_by_name(name) {
        return None;
    }
    message
        .get_field_by_name(name)
        .and_then(|value| value.as_str().map(str::to_string))
}

fn parse_rule(method: &MethodDescriptor, rule: &DynamicMessage) -> Result<HttpBinding, RouteError> {
    let invalid = |reason: String| RouteError::InvalidBinding {
        method: method.full_name().to_string(),
        reason,
    };

    let verbs = [
        ("get", Method::GET),
        ("put", Method::PUT),
        ("post", Method::POST),
        ("delete", Method::DELETE),
        ("patch", Method::PATCH),
    ];

    let pattern = verbs
        .into_iter()
        .find_map(|(field, verb)| string_field(rule, field).map(|path| (verb, path)))
        .or_else(|| {
            let custom = rule.get_field_by_name("custom")?;
            let custom = custom.as_message()?;
            let kind = string_field(custom, "kind")?;
            let path = string_field(custom, "path")?;
            Method::from_bytes(kind.as_bytes()).ok().map(|verb| (verb, path))
        });

    let Some((verb, path)) = pattern else {
        return Err(invalid("no HTTP verb and path pattern".to_string()));
    };

    let template = PathTemplate::parse(&path).map_err(RouteError::InvalidTemplate)?;
    let body = BodySelector::parse(&string_field(rule, "body").unwrap_or_default());
    let response_body = string_field(rule, "response_body").filter(|s| !s.is_empty());

    let input = method.input();
    for variable in template.variables() {
        let fields = resolve_path(&input, &variable.field_path)
            .map_err(|err| invalid(format!("path variable: {err}")))?;

        let scalar = fields.last().is_some_and(|field| {
            !field.is_list() && !field.is_map() && !matches!(field.kind(), Kind::Message(_))
        });
        if !scalar {
            return Err(invalid(format!(
                "path variable '{}' must be a singular scalar field",
                variable.field_path
            )));
        }
    }

    if let BodySelector::Field(field) = &body
        && input.get_field_by_name(field).is_none()
    {
        return Err(invalid(format!("body field '{field}' not in {}", input.full_name())));
    }

    if let Some(field) = &response_body
        && method.output().get_field_by_name(field).is_none()
    {
        return Err(invalid(format!(
            "response_body field '{field}' not in {}",
            method.output().full_name()
        )));
    }

    Ok(HttpBinding {
        verb,
        template,
        body,
        response_body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DescriptorRegistry;
    use crate::schema::{BundleAccessor, SchemaSource};

    fn method(pool: &prost_reflect::DescriptorPool, service: &str, name: &str) -> MethodDescriptor {
        pool.get_service_by_name(service)
            .unwrap()
            .methods()
            .find(|m| m.name() == name)
            .unwrap()
    }

    fn fixture() -> prost_reflect::DescriptorPool {
        echo_service::descriptor_pool()
    }

    #[test]
    fn reads_primary_and_additional_bindings() {
        let pool = fixture();
        let bindings = http_bindings(&method(&pool, "user.v1.UserService", "ListUsers")).unwrap();

        let rendered: Vec<_> = bindings
            .iter()
            .map(|b| format!("{} {}", b.verb, b.template))
            .collect();
        assert_eq!(rendered, vec!["GET /v1/users", "GET /v1/teams/{team}/users"]);
        assert!(bindings.iter().all(|b| b.body == BodySelector::None));
    }

    #[test]
    fn reads_body_selectors() {
        let pool = fixture();

        let update = http_bindings(&method(&pool, "user.v1.UserService", "UpdateUser")).unwrap();
        assert_eq!(update[0].verb, Method::PATCH);
        assert_eq!(update[0].body, BodySelector::Field("user".into()));

        let echo = http_bindings(&method(&pool, "echo.EchoService", "UnaryEcho")).unwrap();
        assert_eq!(echo[0].body, BodySelector::Whole);
    }

    #[test]
    fn methods_without_annotations_have_no_bindings() {
        let pool = fixture();
        let method = method(&pool, "echo.EchoService", "ClientStreamingEcho");

        assert!(http_bindings(&method).unwrap().is_empty());

        let synthesized = HttpBinding::synthesized(&method).unwrap();
        assert_eq!(
            synthesized.template.as_str(),
            "/echo.EchoService/ClientStreamingEcho"
        );
        assert_eq!(synthesized.verb, Method::POST);
    }

    #[test]
    fn rejects_non_scalar_path_variables() {
        let schema = r#"
syntax = "proto3";
package bad;
import "google/api/annotations.proto";
message Req { repeated string ids = 1; }
service Bad {
  rpc Get(Req) returns (Req) { option (google.api.http) = { get: "/v1/{ids}" }; }
}
"#;
        let set = SchemaSource::new(BundleAccessor::new().with_file("bad.proto", schema))
            .parse(["bad.proto"])
            .unwrap();
        let registry = DescriptorRegistry::new();
        registry.register_set(set).unwrap();

        let snapshot = registry.snapshot();
        let err = http_bindings(&method(snapshot.pool(), "bad.Bad", "Get")).unwrap_err();

        assert!(matches!(err, RouteError::InvalidBinding { .. }));
    }
}
