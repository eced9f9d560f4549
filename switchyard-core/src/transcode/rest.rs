//! REST+JSON mapping of HTTP requests onto input messages, and of output messages onto
//! response bodies, as directed by a method's HTTP binding.
use crate::routes::{BodySelector, HttpBinding};
use crate::types::{MessageTemplate, PayloadError, resolve_path};
use prost_reflect::{DynamicMessage, FieldDescriptor, Kind};

/// Builds the input message from the body, the path captures and the query string.
///
/// The body is applied first, then query parameters, then path captures, so a path capture
/// always wins over the same field anywhere else.
pub fn decode_request(
    template: &MessageTemplate,
    binding: &HttpBinding,
    captures: &[(String, String)],
    query: Option<&str>,
    body: &[u8],
) -> Result<DynamicMessage, PayloadError> {
    let mut message = match &binding.body {
        BodySelector::Whole => template.decode_json(body)?,
        BodySelector::Field(field) => {
            if body.iter().all(u8::is_ascii_whitespace) {
                template.new_message()
            } else {
                let value: serde_json::Value =
                    serde_json::from_slice(body).map_err(|source| PayloadError::Json {
                        message: template.full_name().to_string(),
                        source,
                    })?;
                template.decode_json_value(serde_json::json!({ field.as_str(): value }))?
            }
        }
        BodySelector::None => template.new_message(),
    };

    if binding.body != BodySelector::Whole
        && let Some(query) = query
    {
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            if captures.iter().any(|(path, _)| *path == key) {
                continue;
            }
            if let BodySelector::Field(field) = &binding.body
                && (key == field.as_str() || key.starts_with(&format!("{field}.")))
            {
                continue;
            }
            template.set_path_from_str(&mut message, &key, &value)?;
        }
    }

    for (path, value) in captures {
        template.set_path_from_str(&mut message, path, value)?;
    }

    Ok(message)
}

/// Serializes the output message, or only the `response_body` field of it.
///
/// Both forms omit default-valued fields inside the rendered value, like
/// [`MessageTemplate::encode_json`]. A selected field that holds its default still renders
/// as that default, since it is the whole body.
pub fn encode_response(
    template: &MessageTemplate,
    response_body: Option<&str>,
    message: &DynamicMessage,
) -> Result<Vec<u8>, PayloadError> {
    let Some(field) = response_body else {
        return template.encode_json(message);
    };

    let serialize_error = |source| PayloadError::Serialize {
        message: template.full_name().to_string(),
        source,
    };

    let fields = resolve_path(template.descriptor(), field)?;
    let Some(selected) = fields.last() else {
        return template.encode_json(message);
    };

    let whole = serde_json::to_value(message).map_err(serialize_error)?;
    let value = whole
        .get(selected.json_name())
        .cloned()
        .unwrap_or_else(|| default_json(selected));

    serde_json::to_vec(&value).map_err(serialize_error)
}

/// The JSON form of a field left at its default value.
fn default_json(field: &FieldDescriptor) -> serde_json::Value {
    use serde_json::json;

    if field.is_list() {
        return json!([]);
    }
    if field.is_map() {
        return json!({});
    }

    match field.kind() {
        Kind::Bool => json!(false),
        Kind::String | Kind::Bytes => json!(""),
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 | Kind::Uint64 | Kind::Fixed64 => json!("0"),
        Kind::Double | Kind::Float => json!(0.0),
        Kind::Enum(enumeration) => json!(enumeration.default_value().name()),
        // Unset, which proto3 JSON spells as null.
        Kind::Message(_) => serde_json::Value::Null,
        _ => json!(0),
    }
}
