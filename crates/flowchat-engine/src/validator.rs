//! Synchronous validation of user responses.
//!
//! Validation runs before branch resolution. A rejected response leaves the
//! conversation where it is and records nothing.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use flowchat_core::error::ValidationError;
use flowchat_core::flow::{Element, ElementKind, FieldKind, FormField, InputType};
use flowchat_core::types::Response;

fn email_pattern() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("literal pattern"))
}

fn number_pattern() -> &'static Regex {
    static NUMBER: OnceLock<Regex> = OnceLock::new();
    NUMBER.get_or_init(|| {
        Regex::new(r"^[+-]?(\d+(\.\d*)?|\.\d+)([eE][+-]?\d+)?$").expect("literal pattern")
    })
}

fn phone_pattern() -> &'static Regex {
    static PHONE: OnceLock<Regex> = OnceLock::new();
    PHONE.get_or_init(|| Regex::new(r"^\+?[\d\s().-]{3,}$").expect("literal pattern"))
}

/// Validate one free-text value. Returns the trimmed value.
pub fn validate(input_type: InputType, raw: &str) -> Result<String, ValidationError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ValidationError::Required);
    }
    match input_type {
        InputType::Email if !email_pattern().is_match(value) => Err(ValidationError::Email),
        InputType::Number if !number_pattern().is_match(value) => Err(ValidationError::Number),
        _ => Ok(value.to_string()),
    }
}

fn is_checked(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "on" | "yes" | "1"
    )
}

/// Validate submitted form values against the form's fields.
///
/// Returns the trimmed values of known fields; blank optional fields and
/// keys that match no field are dropped.
pub fn validate_form(
    fields: &[FormField],
    values: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, ValidationError> {
    let mut accepted = BTreeMap::new();
    for field in fields {
        let value = values.get(&field.name).map(|v| v.trim()).unwrap_or_default();
        let missing = match field.kind {
            FieldKind::Checkbox => !is_checked(value),
            _ => value.is_empty(),
        };
        if missing {
            if field.required {
                return Err(ValidationError::MissingField {
                    field: field.name.clone(),
                });
            }
            continue;
        }

        let invalid = |reason: &str| ValidationError::Field {
            field: field.name.clone(),
            reason: reason.to_string(),
        };
        match field.kind {
            FieldKind::Email if !email_pattern().is_match(value) => {
                return Err(invalid("invalid email address"));
            }
            FieldKind::Number if !number_pattern().is_match(value) => {
                return Err(invalid("not a number"));
            }
            FieldKind::Tel if !phone_pattern().is_match(value) => {
                return Err(invalid("invalid phone number"));
            }
            FieldKind::Select | FieldKind::Radio
                if !field.options.is_empty() && !field.options.iter().any(|o| o == value) =>
            {
                return Err(ValidationError::NotAnOption {
                    field: field.name.clone(),
                    value: value.to_string(),
                });
            }
            _ => {}
        }
        accepted.insert(field.name.clone(), value.to_string());
    }
    Ok(accepted)
}

/// Validate a response to `element` and normalize it for resolution.
pub fn validate_response(element: &Element, response: Response) -> Result<Response, ValidationError> {
    match (&element.kind, response) {
        (ElementKind::Question { .. }, Response::Choice(text)) => {
            if text.is_empty() {
                return Err(ValidationError::Required);
            }
            Ok(Response::Choice(text))
        }
        (ElementKind::Question { .. }, Response::Text(text)) => {
            validate(InputType::Text, &text).map(Response::Text)
        }
        (ElementKind::Question { .. }, Response::Form(_)) => Err(ValidationError::UnexpectedResponse {
            expected: "choice or text",
        }),
        (ElementKind::Input { input_type, .. }, Response::Text(text) | Response::Choice(text)) => {
            validate(*input_type, &text).map(Response::Text)
        }
        (ElementKind::Input { .. }, Response::Form(_)) => {
            Err(ValidationError::UnexpectedResponse { expected: "text" })
        }
        (ElementKind::Form { fields, .. }, Response::Form(values)) => {
            validate_form(fields, &values).map(Response::Form)
        }
        (ElementKind::Form { .. }, _) => Err(ValidationError::UnexpectedResponse { expected: "form" }),
        (ElementKind::Text | ElementKind::Media { .. }, _) => {
            Err(ValidationError::UnexpectedResponse { expected: "no" })
        }
    }
}
