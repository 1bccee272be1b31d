//! Shorthand field declarations.
//!
//! `type|flag|key:value|...`, for example `"string|required|min:3|max:50"`
//! or `"enum|values:draft,published|readonly"`. The type must come first;
//! `pattern:` takes the rest of its segment verbatim, so a pattern may not
//! contain `|`.

use serde_json::Value;

use crate::error::ConfigurationError;

use super::declaration::FieldSpec;
use super::types::{FieldType, Hidden};

/// Parses a shorthand declaration into a [`FieldSpec`].
///
/// # Examples
///
/// ```
/// use helios_entity::field::{parse_shorthand, FieldType};
///
/// let spec = parse_shorthand("title", "string|required|min:3").unwrap();
/// assert_eq!(spec.field_type(), FieldType::String);
/// ```
pub fn parse_shorthand(field: &str, shorthand: &str) -> Result<FieldSpec, ConfigurationError> {
    let invalid = |message: String| ConfigurationError::InvalidField {
        field: field.to_string(),
        message,
    };

    let mut parts = shorthand.split('|').map(str::trim);
    let type_name = parts.next().unwrap_or_default();
    let field_type = if type_name.is_empty() {
        FieldType::Any
    } else {
        FieldType::parse(type_name).ok_or_else(|| invalid(format!("unknown type '{}'", type_name)))?
    };

    let mut spec = FieldSpec::new(field_type);
    for part in parts.filter(|p| !p.is_empty()) {
        spec = match part.split_once(':') {
            None => match part {
                "required" => spec.required(),
                "optional" => spec.optional(),
                "nullable" => spec.nullable(),
                "readonly" => spec.readonly(),
                "immutable" => spec.immutable(),
                "hidden" => spec.hidden(Hidden::Always),
                "virtual" => spec.virtual_field(),
                "secure" => spec.secure(),
                "primary" => spec.primary_key(),
                other => return Err(invalid(format!("unknown flag '{}'", other))),
            },
            Some((key, value)) => match key {
                "min" => spec.min(parse_number(value).ok_or_else(|| invalid(format!("min '{}' is not a number", value)))?),
                "max" => spec.max(parse_number(value).ok_or_else(|| invalid(format!("max '{}' is not a number", value)))?),
                "pattern" => spec.pattern(value),
                "values" => spec.values(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|v| !v.is_empty())
                        .map(|v| Value::String(v.to_string())),
                ),
                "column" => spec.column(value),
                "hidden" => match value {
                    "always" | "true" => spec.hidden(Hidden::Always),
                    "never" | "false" => spec.hidden(Hidden::Never),
                    "unlessRequested" | "inactive" => spec.hidden(Hidden::UnlessRequested),
                    other => return Err(invalid(format!("unknown hidden mode '{}'", other))),
                },
                other => return Err(invalid(format!("unknown option '{}'", other))),
            },
        };
    }
    Ok(spec)
}

fn parse_number(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}
