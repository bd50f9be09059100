//! Field validation.
//!
//! One data-driven validator covers models and non-models: every field of a
//! definition is checked for presence, primitive kind, list shape, scalar
//! format and enum membership. The first failing field is reported.

use crate::{error::Result, Error, FieldDef, FieldType, Schema};
use chrono::{DateTime, NaiveDate, NaiveTime};
use serde_json::{Map, Value};
use std::net::IpAddr;

/// Validate a field map against an ordered list of field definitions.
pub fn validate_fields(schema: &Schema, fields: &[FieldDef], values: &Map<String, Value>) -> Result<()> {
    for field in fields {
        if field.is_relation() {
            continue;
        }
        validate_field(schema, field, values.get(&field.name))?;
    }
    Ok(())
}

/// Validate a single field value.
pub fn validate_field(schema: &Schema, field: &FieldDef, value: Option<&Value>) -> Result<()> {
    let value = match value {
        None | Some(Value::Null) if field.required => {
            return Err(Error::MissingRequiredField(field.name.clone()));
        }
        None | Some(Value::Null) => return Ok(()),
        Some(v) => v,
    };

    if field.is_array {
        validate_array(schema, field, value)
    } else {
        validate_scalar(schema, field, value)
    }
}

fn validate_scalar(schema: &Schema, field: &FieldDef, value: &Value) -> Result<()> {
    let expected = field.field_type.primitive();
    if js_type(value) != expected {
        return Err(Error::TypeMismatch {
            field: field.name.clone(),
            expected: expected.to_string(),
            actual: js_type(value).to_string(),
            value: display(value),
        });
    }

    match &field.field_type {
        FieldType::NonModel(name) => {
            let def = schema
                .get_non_model(name)
                .ok_or_else(|| Error::UnknownType(name.clone()))?;
            // primitive check above guarantees an object
            let nested = value.as_object().cloned().unwrap_or_default();
            validate_fields(schema, &def.fields, &nested)
        }
        field_type if !is_valid_scalar(schema, field_type, value) => Err(Error::FormatMismatch {
            field: field.name.clone(),
            format: field_type.to_string(),
            value: display(value),
        }),
        _ => Ok(()),
    }
}

fn validate_array(schema: &Schema, field: &FieldDef, value: &Value) -> Result<()> {
    let primitive = field.field_type.primitive();
    let elements = match value.as_array() {
        Some(elements) => elements,
        None => {
            return Err(Error::NotAnArray {
                field: field.name.clone(),
                expected: primitive.to_string(),
                actual: js_type(value).to_string(),
                value: display(value),
            })
        }
    };

    let kinds_ok = elements.iter().all(|e| match e {
        Value::Null => field.is_array_nullable,
        e => js_type(e) == primitive,
    });

    if !kinds_ok {
        let expected = if field.is_array_nullable {
            format!("{} | null | undefined", primitive)
        } else {
            primitive.to_string()
        };
        return Err(Error::ArrayElementMismatch {
            field: field.name.clone(),
            expected,
            types: join(elements, |e| js_type(e).to_string()),
            values: join(elements, display),
        });
    }

    if let FieldType::NonModel(name) = &field.field_type {
        let def = schema
            .get_non_model(name)
            .ok_or_else(|| Error::UnknownType(name.clone()))?;
        for nested in elements.iter().filter_map(Value::as_object) {
            validate_fields(schema, &def.fields, nested)?;
        }
        return Ok(());
    }

    let all_valid = elements
        .iter()
        .filter(|e| !e.is_null())
        .all(|e| is_valid_scalar(schema, &field.field_type, e));

    if all_valid {
        Ok(())
    } else {
        Err(Error::ArrayFormatMismatch {
            field: field.name.clone(),
            format: field.field_type.to_string(),
            values: join(elements, display),
        })
    }
}

/// Check integer-ness, enum membership and string formats.
fn is_valid_scalar(schema: &Schema, field_type: &FieldType, value: &Value) -> bool {
    match field_type {
        FieldType::Int | FieldType::AWSTimestamp => value.is_i64() || value.is_u64(),
        FieldType::Enum(name) => match (schema.enums.get(name), value.as_str()) {
            (Some(values), Some(v)) => values.iter().any(|allowed| allowed == v),
            _ => false,
        },
        t if t.has_format() => value.as_str().is_some_and(|s| is_valid_format(t, s)),
        _ => true,
    }
}

/// Validate a string against a custom scalar format.
pub fn is_valid_format(field_type: &FieldType, s: &str) -> bool {
    match field_type {
        FieldType::AWSDate => NaiveDate::parse_from_str(strip_offset(s), "%Y-%m-%d").is_ok(),
        FieldType::AWSTime => {
            let t = strip_offset(s);
            NaiveTime::parse_from_str(t, "%H:%M:%S%.f").is_ok()
                || NaiveTime::parse_from_str(t, "%H:%M").is_ok()
        }
        FieldType::AWSDateTime => DateTime::parse_from_rfc3339(s).is_ok(),
        FieldType::AWSEmail => is_email(s),
        FieldType::AWSJSON => serde_json::from_str::<Value>(s).is_ok(),
        FieldType::AWSURL => is_url(s),
        FieldType::AWSPhone => is_phone(s),
        FieldType::AWSIPAddress => is_ip_address(s),
        _ => true,
    }
}

/// Remove a trailing `Z` or `+hh:mm` offset.
fn strip_offset(s: &str) -> &str {
    if let Some(stripped) = s.strip_suffix('Z') {
        return stripped;
    }
    let bytes = s.as_bytes();
    if bytes.len() > 6 {
        let sign = bytes[bytes.len() - 6];
        if (sign == b'+' || sign == b'-') && bytes[bytes.len() - 3] == b':' {
            return &s[..s.len() - 6];
        }
    }
    s
}

fn is_email(s: &str) -> bool {
    let mut parts = s.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    !local.is_empty()
        && !s.chars().any(char::is_whitespace)
        && domain.contains('.')
        && domain.split('.').all(|label| !label.is_empty())
}

fn is_url(s: &str) -> bool {
    let Some((scheme, rest)) = s.split_once("://") else {
        return false;
    };
    let mut chars = scheme.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        && !rest.is_empty()
        && !rest.chars().any(char::is_whitespace)
}

fn is_phone(s: &str) -> bool {
    let digits = s.chars().filter(char::is_ascii_digit).count();
    digits >= 3
        && s.chars()
            .all(|c| c.is_ascii_digit() || matches!(c, ' ' | '-' | '+' | '(' | ')' | '.'))
}

fn is_ip_address(s: &str) -> bool {
    let (addr, prefix) = match s.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (s, None),
    };
    let Ok(ip) = addr.parse::<IpAddr>() else {
        return false;
    };
    match prefix {
        None => true,
        Some(p) => {
            let max = if ip.is_ipv4() { 32 } else { 128 };
            p.parse::<u8>().is_ok_and(|bits| bits <= max)
        }
    }
}

/// JavaScript-style type name of a JSON value.
pub(crate) fn js_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) | Value::Object(_) => "object",
    }
}

/// Render a value the way it is quoted in error messages.
pub(crate) fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => join(items, display),
        other => other.to_string(),
    }
}

fn join(values: &[Value], f: impl Fn(&Value) -> String) -> String {
    values.iter().map(f).collect::<Vec<_>>().join(",")
}
