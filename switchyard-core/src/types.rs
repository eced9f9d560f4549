//! # Dynamic Type Factory
//!
//! Runtime message handles for every message a service touches. A [`MessageTemplate`] knows how
//! to create, decode and encode messages of one type in both the protobuf binary form and the
//! canonical JSON mapping, and how to set fields from the plain strings found in URL paths and
//! query strings.
use crate::registry::RegistrySnapshot;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use prost::Message;
use prost_reflect::{DynamicMessage, FieldDescriptor, Kind, MessageDescriptor, ReflectMessage, Value};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("Invalid protobuf payload for '{message}': '{source}'")]
    Proto {
        message: String,
        #[source]
        source: prost::DecodeError,
    },
    #[error("Invalid JSON payload for '{message}': '{source}'")]
    Json {
        message: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to serialize '{message}' as JSON: '{source}'")]
    Serialize {
        message: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Message '{message}' has no field '{field}'")]
    UnknownField { message: String, field: String },
    #[error("Invalid value '{value}' for field '{field}': {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Addresses a field by proto name, JSON name, or number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRef<'a> {
    Name(&'a str),
    Number(u32),
}

impl<'a> From<&'a str> for FieldRef<'a> {
    fn from(name: &'a str) -> Self {
        FieldRef::Name(name)
    }
}

impl From<u32> for FieldRef<'_> {
    fn from(number: u32) -> Self {
        FieldRef::Number(number)
    }
}

/// A runtime-constructed message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplate {
    descriptor: MessageDescriptor,
}

impl MessageTemplate {
    pub fn new(descriptor: MessageDescriptor) -> Self {
        Self { descriptor }
    }

    pub fn descriptor(&self) -> &MessageDescriptor {
        &self.descriptor
    }

    pub fn full_name(&self) -> &str {
        self.descriptor.full_name()
    }

    /// A message with every field at its default value.
    pub fn new_message(&self) -> DynamicMessage {
        DynamicMessage::new(self.descriptor.clone())
    }

    pub fn field<'a>(&self, field: impl Into<FieldRef<'a>>) -> Option<FieldDescriptor> {
        lookup_field(&self.descriptor, field.into())
    }

    pub fn decode_proto(&self, bytes: &[u8]) -> Result<DynamicMessage, PayloadError> {
        DynamicMessage::decode(self.descriptor.clone(), bytes).map_err(|source| {
            PayloadError::Proto {
                message: self.full_name().to_string(),
                source,
            }
        })
    }

    /// Decodes the canonical JSON mapping. An empty or all-whitespace payload is the default
    /// message.
    pub fn decode_json(&self, bytes: &[u8]) -> Result<DynamicMessage, PayloadError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(self.new_message());
        }

        let mut deserializer = serde_json::Deserializer::from_slice(bytes);
        DynamicMessage::deserialize(self.descriptor.clone(), &mut deserializer)
            .and_then(|message| deserializer.end().map(|()| message))
            .map_err(|source| PayloadError::Json {
                message: self.full_name().to_string(),
                source,
            })
    }

    /// Decodes a JSON value that is already parsed, e.g. the body selected by an HTTP binding.
    pub fn decode_json_value(&self, value: serde_json::Value) -> Result<DynamicMessage, PayloadError> {
        DynamicMessage::deserialize(self.descriptor.clone(), value).map_err(|source| {
            PayloadError::Json {
                message: self.full_name().to_string(),
                source,
            }
        })
    }

    pub fn encode_proto(&self, message: &DynamicMessage) -> Vec<u8> {
        message.encode_to_vec()
    }

    pub fn encode_json(&self, message: &DynamicMessage) -> Result<Vec<u8>, PayloadError> {
        serde_json::to_vec(message).map_err(|source| PayloadError::Serialize {
            message: self.full_name().to_string(),
            source,
        })
    }

    /// Sets the field at a dotted path (`user.address.city`) from its textual form.
    ///
    /// Intermediate messages are created as needed. Repeated fields get the value appended.
    pub fn set_path_from_str(
        &self,
        message: &mut DynamicMessage,
        path: &str,
        value: &str,
    ) -> Result<(), PayloadError> {
        set_path_from_str(message, path, value)
    }
}

fn lookup_field(descriptor: &MessageDescriptor, field: FieldRef<'_>) -> Option<FieldDescriptor> {
    match field {
        FieldRef::Number(number) => descriptor.get_field(number),
        FieldRef::Name(name) => descriptor
            .get_field_by_name(name)
            .or_else(|| descriptor.get_field_by_json_name(name)),
    }
}

/// Resolves a dotted path to the chain of fields it walks through.
pub fn resolve_path(
    descriptor: &MessageDescriptor,
    path: &str,
) -> Result<Vec<FieldDescriptor>, PayloadError> {
    let mut current = descriptor.clone();
    let mut fields = Vec::new();

    for (position, segment) in path.split('.').enumerate() {
        if position > 0 {
            let Some(Kind::Message(next)) = fields.last().map(FieldDescriptor::kind) else {
                return Err(unknown_field(&current, segment));
            };
            current = next;
        }

        let field = lookup_field(&current, FieldRef::Name(segment))
            .ok_or_else(|| unknown_field(&current, segment))?;

        if position > 0 && fields.last().is_some_and(|f| f.is_list() || f.is_map()) {
            return Err(unknown_field(&current, segment));
        }
        fields.push(field);
    }

    Ok(fields)
}

fn unknown_field(descriptor: &MessageDescriptor, field: &str) -> PayloadError {
    PayloadError::UnknownField {
        message: descriptor.full_name().to_string(),
        field: field.to_string(),
    }
}

pub(crate) fn set_path_from_str(
    message: &mut DynamicMessage,
    path: &str,
    value: &str,
) -> Result<(), PayloadError> {
    let fields = resolve_path(&message.descriptor(), path)?;
    let Some((leaf, parents)) = fields.split_last() else {
        return Err(unknown_field(&message.descriptor(), path));
    };

    let mut target = message;
    for parent in parents {
        target = match target.get_field_mut(parent).as_message_mut() {
            Some(nested) => nested,
            None => return Err(unknown_field(parent.parent_message(), parent.name())),
        };
    }

    if leaf.is_map() {
        return Err(invalid(leaf, value, "map fields cannot be bound from text"));
    }

    let parsed = parse_value(leaf, &leaf.kind(), value)?;

    if leaf.is_list() {
        match target.get_field_mut(leaf).as_list_mut() {
            Some(list) => list.push(parsed),
            None => return Err(invalid(leaf, value, "expected a repeated field")),
        }
    } else {
        target.set_field(leaf, parsed);
    }

    Ok(())
}

fn invalid(field: &FieldDescriptor, value: &str, reason: impl ToString) -> PayloadError {
    PayloadError::InvalidValue {
        field: field.full_name().to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_value(field: &FieldDescriptor, kind: &Kind, text: &str) -> Result<Value, PayloadError> {
    let value = match kind {
        Kind::Double => Value::F64(text.parse().map_err(|e| invalid(field, text, e))?),
        Kind::Float => Value::F32(text.parse().map_err(|e| invalid(field, text, e))?),
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => {
            Value::I32(text.parse().map_err(|e| invalid(field, text, e))?)
        }
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => {
            Value::I64(text.parse().map_err(|e| invalid(field, text, e))?)
        }
        Kind::Uint32 | Kind::Fixed32 => {
            Value::U32(text.parse().map_err(|e| invalid(field, text, e))?)
        }
        Kind::Uint64 | Kind::Fixed64 => {
            Value::U64(text.parse().map_err(|e| invalid(field, text, e))?)
        }
        Kind::Bool => match text {
            "true" | "1" => Value::Bool(true),
            "false" | "0" => Value::Bool(false),
            _ => return Err(invalid(field, text, "expected 'true' or 'false'")),
        },
        Kind::String => Value::String(text.to_string()),
        Kind::Bytes => Value::Bytes(decode_base64(text).ok_or_else(|| {
            invalid(field, text, "expected base64")
        })?),
        Kind::Enum(descriptor) => {
            let number = match descriptor.get_value_by_name(text) {
                Some(value) => value.number(),
                None => text
                    .parse()
                    .map_err(|_| invalid(field, text, format!("not a value of {}", descriptor.full_name())))?,
            };
            Value::EnumNumber(number)
        }
        // Well-known types (timestamps, wrappers, durations) take their JSON string form.
        Kind::Message(descriptor) => {
            let json = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .filter(|v| !v.is_object() && !v.is_array())
                .unwrap_or_else(|| serde_json::Value::String(text.to_string()));

            DynamicMessage::deserialize(descriptor.clone(), json)
                .or_else(|_| {
                    DynamicMessage::deserialize(
                        descriptor.clone(),
                        serde_json::Value::String(text.to_string()),
                    )
                })
                .map(Value::Message)
                .map_err(|e| invalid(field, text, e))?
        }
    };

    Ok(value)
}

fn decode_base64(text: &str) -> Option<bytes::Bytes> {
    [&STANDARD, &URL_SAFE, &STANDARD_NO_PAD, &URL_SAFE_NO_PAD]
        .into_iter()
        .find_map(|engine| engine.decode(text).ok())
        .map(bytes::Bytes::from)
}

/// Message templates for everything reachable from the registry's services.
#[derive(Debug, Clone, Default)]
pub struct TypeFactory {
    templates: HashMap<String, MessageTemplate>,
}

impl TypeFactory {
    pub fn new(snapshot: &RegistrySnapshot) -> Self {
        let mut templates = HashMap::new();
        let mut queue: VecDeque<MessageDescriptor> = snapshot
            .services()
            .flat_map(|service| service.methods().collect::<Vec<_>>())
            .flat_map(|method| [method.input(), method.output()])
            .collect();

        while let Some(descriptor) = queue.pop_front() {
            if templates.contains_key(descriptor.full_name()) {
                continue;
            }

            for field in descriptor.fields() {
                if let Kind::Message(nested) = field.kind() {
                    queue.push_back(nested);
                }
            }

            templates.insert(
                descriptor.full_name().to_string(),
                MessageTemplate::new(descriptor),
            );
        }

        Self { templates }
    }

    pub fn template(&self, full_name: &str) -> Option<&MessageTemplate> {
        self.templates.get(full_name)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn templates(&self) -> impl Iterator<Item = &MessageTemplate> {
        self.templates.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DescriptorRegistry;

    fn factory() -> TypeFactory {
        let registry = DescriptorRegistry::new();
        let set = crate::schema::decode_descriptor_set(echo_service::FILE_DESCRIPTOR_SET).unwrap();
        registry.register_set(set).unwrap();
        TypeFactory::new(&registry.snapshot())
    }

    fn user(factory: &TypeFactory) -> DynamicMessage {
        let template = factory.template("user.v1.User").unwrap();
        let json = br#"{
            "id": "7",
            "name": "Ann",
            "tags": ["a", "b"],
            "address": {"city": "Oslo", "country": "NO"},
            "role": "ROLE_ADMIN",
            "labels": {"team": "core"}
        }"#;
        template.decode_json(json).unwrap()
    }

    #[test]
    fn covers_every_reachable_message() {
        let factory = factory();

        for name in [
            "echo.EchoRequest",
            "user.v1.GetUserRequest",
            "user.v1.User",
            "user.v1.Address",
            "user.v1.User.LabelsEntry",
        ] {
            assert!(factory.template(name).is_some(), "missing {name}");
        }
        assert!(factory.template("google.api.HttpRule").is_none());
    }

    #[test]
    fn fields_by_name_json_name_and_number() {
        let factory = factory();
        let template = factory.template("user.v1.ListUsersRequest").unwrap();

        assert_eq!(template.field("page_size").unwrap().number(), 1);
        assert_eq!(template.field("pageSize").unwrap().number(), 1);
        assert_eq!(template.field(1).unwrap().name(), "page_size");
        assert!(template.field("missing").is_none());
    }

    #[test]
    fn binary_round_trip_preserves_every_field_kind() {
        let factory = factory();
        let template = factory.template("user.v1.User").unwrap();
        let original = user(&factory);

        let decoded = template
            .decode_proto(&template.encode_proto(&original))
            .unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn json_round_trip_preserves_every_field_kind() {
        let factory = factory();
        let template = factory.template("user.v1.User").unwrap();
        let original = user(&factory);

        let decoded = template
            .decode_json(&template.encode_json(&original).unwrap())
            .unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn defaults_are_omitted_from_json() {
        let factory = factory();
        let template = factory.template("user.v1.User").unwrap();
        let mut message = template.new_message();
        template.set_path_from_str(&mut message, "name", "Ann").unwrap();

        assert_eq!(template.encode_json(&message).unwrap(), br#"{"name":"Ann"}"#);
    }

    #[test]
    fn sets_nested_repeated_and_enum_fields_from_text() {
        let factory = factory();
        let template = factory.template("user.v1.UpdateUserRequest").unwrap();
        let mut message = template.new_message();

        template.set_path_from_str(&mut message, "user.id", "42").unwrap();
        template.set_path_from_str(&mut message, "user.address.city", "Oslo").unwrap();
        template.set_path_from_str(&mut message, "user.tags", "a").unwrap();
        template.set_path_from_str(&mut message, "user.tags", "b").unwrap();
        template.set_path_from_str(&mut message, "user.role", "ROLE_ADMIN").unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&template.encode_json(&message).unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "user": {
                    "id": "42",
                    "tags": ["a", "b"],
                    "address": {"city": "Oslo"},
                    "role": "ROLE_ADMIN"
                }
            })
        );
    }

    #[test]
    fn rejects_bad_text_values() {
        let factory = factory();
        let template = factory.template("user.v1.GetUserRequest").unwrap();
        let mut message = template.new_message();

        assert!(matches!(
            template.set_path_from_str(&mut message, "id", "forty-two"),
            Err(PayloadError::InvalidValue { .. })
        ));
        assert!(matches!(
            template.set_path_from_str(&mut message, "nope", "1"),
            Err(PayloadError::UnknownField { .. })
        ));
    }

    #[test]
    fn empty_json_body_is_the_default_message() {
        let factory = factory();
        let template = factory.template("user.v1.ListUsersRequest").unwrap();

        assert_eq!(template.decode_json(b"  ").unwrap(), template.new_message());
        assert!(template.decode_json(b"{\"pageSize\": true}").is_err());
    }
}
