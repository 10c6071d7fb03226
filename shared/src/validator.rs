//! Field-level validation of report form input.
//!
//! Validation is pure: it never touches media, location or storage, and it
//! reports every violated field at once so the form can render them together.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use crate::model::{
    DraftStatus, HazardType, ReportDraft, ReportForm, ReportId, UnixTimeMs,
};

pub const MIN_DESCRIPTION_CHARS: usize = 10;
pub const MAX_DESCRIPTION_BYTES: usize = 4096;
pub const MAX_NAME_BYTES: usize = 200;
pub const MAX_EMAIL_BYTES: usize = 254;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormField {
    Name,
    Email,
    HazardType,
    Description,
}

impl FormField {
    pub fn name(&self) -> &'static str {
        match self {
            FormField::Name => "name",
            FormField::Email => "email",
            FormField::HazardType => "hazard_type",
            FormField::Description => "description",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    Required,
    InvalidEmail,
    TooShort { min: usize, actual: usize },
    TooLong { max: usize, actual: usize },
    UnknownHazardType { value: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: FormField,
    pub violation: Violation,
}

impl ValidationError {
    fn new(field: FormField, violation: Violation) -> Self {
        Self { field, violation }
    }

    /// Message shown next to the offending input.
    pub fn message(&self) -> String {
        match (&self.field, &self.violation) {
            (FormField::Name, Violation::Required) => "Name is required".into(),
            (FormField::Email, Violation::Required) => "Email is required".into(),
            (FormField::Description, Violation::Required) => "Description is required".into(),
            (_, Violation::Required) => format!("{} is required", self.field.name()),
            (_, Violation::InvalidEmail) => "Invalid email address".into(),
            (FormField::Description, Violation::TooShort { min, .. }) => {
                format!("Description must be at least {min} characters")
            }
            (_, Violation::TooShort { min, .. }) => {
                format!("{} must be at least {min} characters", self.field.name())
            }
            (_, Violation::TooLong { max, .. }) => {
                format!("{} must be at most {max} bytes", self.field.name())
            }
            (_, Violation::UnknownHazardType { value }) => {
                format!("Unknown hazard type: {value}")
            }
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field.name(), self.message())
    }
}

impl std::error::Error for ValidationError {}

fn email_pattern() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| {
        Regex::new(r"(?i)^[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}$")
            .unwrap_or_else(|e| unreachable!("static email pattern: {e}"))
    })
}

pub fn is_valid_email(email: &str) -> bool {
    email_pattern().is_match(email)
}

/// Validate form input into a new draft with a freshly generated id.
pub fn validate(form: &ReportForm, now: UnixTimeMs) -> Result<ReportDraft, Vec<ValidationError>> {
    validate_with_id(form, ReportId::generate(), now)
}

/// Validate form input for a known id, e.g. when a queued report is edited.
pub fn validate_with_id(
    form: &ReportForm,
    id: ReportId,
    now: UnixTimeMs,
) -> Result<ReportDraft, Vec<ValidationError>> {
    let mut errors = Vec::new();

    let name = form.name.trim();
    if name.is_empty() {
        errors.push(ValidationError::new(FormField::Name, Violation::Required));
    } else if name.len() > MAX_NAME_BYTES {
        errors.push(ValidationError::new(
            FormField::Name,
            Violation::TooLong {
                max: MAX_NAME_BYTES,
                actual: name.len(),
            },
        ));
    }

    let email = form.email.trim();
    if email.is_empty() {
        errors.push(ValidationError::new(FormField::Email, Violation::Required));
    } else if email.len() > MAX_EMAIL_BYTES {
        errors.push(ValidationError::new(
            FormField::Email,
            Violation::TooLong {
                max: MAX_EMAIL_BYTES,
                actual: email.len(),
            },
        ));
    } else if !is_valid_email(email) {
        errors.push(ValidationError::new(FormField::Email, Violation::InvalidEmail));
    }

    let hazard_type = match form.hazard_type.as_deref().map(str::trim) {
        None | Some("") => Some(HazardType::Unclassified),
        Some(raw) => match raw.parse::<HazardType>() {
            Ok(hazard) => Some(hazard),
            Err(_) => {
                errors.push(ValidationError::new(
                    FormField::HazardType,
                    Violation::UnknownHazardType {
                        value: raw.to_string(),
                    },
                ));
                None
            }
        },
    };

    let description = form.description.trim();
    let description_chars = description.chars().count();
    if description.is_empty() {
        errors.push(ValidationError::new(
            FormField::Description,
            Violation::Required,
        ));
    } else if description_chars < MIN_DESCRIPTION_CHARS {
        errors.push(ValidationError::new(
            FormField::Description,
            Violation::TooShort {
                min: MIN_DESCRIPTION_CHARS,
                actual: description_chars,
            },
        ));
    } else if description.len() > MAX_DESCRIPTION_BYTES {
        errors.push(ValidationError::new(
            FormField::Description,
            Violation::TooLong {
                max: MAX_DESCRIPTION_BYTES,
                actual: description.len(),
            },
        ));
    }

    match hazard_type {
        Some(hazard_type) if errors.is_empty() => Ok(ReportDraft {
            id,
            reporter_name: name.to_string(),
            reporter_email: email.to_string(),
            description: description.to_string(),
            hazard_type,
            location: None,
            media: Vec::new(),
            created_at: now,
            status: DraftStatus::Draft,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
            retry_budget_used: 0,
            failure: None,
        }),
        _ => Err(errors),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jane() -> ReportForm {
        ReportForm {
            name: "Jane Smith".into(),
            email: "jane@phone.com".into(),
            description: "Flooding near the pier".into(),
            hazard_type: None,
        }
    }

    #[test]
    fn valid_form_yields_draft() {
        let draft = validate(&jane(), UnixTimeMs(1_700_000_000_000)).unwrap();
        assert_eq!(draft.status, DraftStatus::Draft);
        assert_eq!(draft.reporter_name, "Jane Smith");
        assert_eq!(draft.hazard_type, HazardType::Unclassified);
        assert_eq!(draft.created_at, UnixTimeMs(1_700_000_000_000));
        assert!(draft.media.is_empty());
        assert!(draft.location.is_none());
    }

    #[test]
    fn invalid_email_is_reported_on_email_field() {
        let form = ReportForm {
            email: "not-an-email".into(),
            ..jane()
        };
        let errors = validate(&form, UnixTimeMs(0)).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::new(FormField::Email, Violation::InvalidEmail)]
        );
        assert_eq!(errors[0].message(), "Invalid email address");
    }

    #[test]
    fn all_violations_reported_together() {
        let form = ReportForm {
            name: "   ".into(),
            email: String::new(),
            description: "too short".into(),
            hazard_type: Some("Earthquake".into()),
        };
        let errors = validate(&form, UnixTimeMs(0)).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                FormField::Name,
                FormField::Email,
                FormField::HazardType,
                FormField::Description
            ]
        );
        assert_eq!(
            errors[3].violation,
            Violation::TooShort { min: 10, actual: 9 }
        );
    }

    #[test]
    fn unknown_hazard_type_is_not_coerced() {
        let form = ReportForm {
            hazard_type: Some("Volcano".into()),
            ..jane()
        };
        let errors = validate(&form, UnixTimeMs(0)).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, FormField::HazardType);
    }

    #[test]
    fn hazard_type_labels_accepted() {
        let form = ReportForm {
            hazard_type: Some("Coastal Erosion".into()),
            ..jane()
        };
        let draft = validate(&form, UnixTimeMs(0)).unwrap();
        assert_eq!(draft.hazard_type, HazardType::CoastalErosion);

        let blank = ReportForm {
            hazard_type: Some("  ".into()),
            ..jane()
        };
        assert_eq!(
            validate(&blank, UnixTimeMs(0)).unwrap().hazard_type,
            HazardType::Unclassified
        );
    }

    #[test]
    fn description_length_counts_characters() {
        let form = ReportForm {
            description: "海岸の浸食が進んでいます".into(),
            ..jane()
        };
        assert!(validate(&form, UnixTimeMs(0)).is_ok());

        let long = ReportForm {
            description: "x".repeat(MAX_DESCRIPTION_BYTES + 1),
            ..jane()
        };
        let errors = validate(&long, UnixTimeMs(0)).unwrap_err();
        assert!(matches!(errors[0].violation, Violation::TooLong { .. }));
    }

    #[test]
    fn email_grammar() {
        assert!(is_valid_email("jane@phone.com"));
        assert!(is_valid_email("J.Doe+alerts@coast.gov.in"));
        assert!(!is_valid_email("jane@phone"));
        assert!(!is_valid_email("@phone.com"));
        assert!(!is_valid_email("jane phone@x.com"));
    }

    #[test]
    fn validate_with_id_keeps_id() {
        let id = ReportId::new("report-7").unwrap();
        let draft = validate_with_id(&jane(), id.clone(), UnixTimeMs(0)).unwrap();
        assert_eq!(draft.id, id);
    }
}
