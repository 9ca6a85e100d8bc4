//! Application profile data — the canonical shape every downstream component
//! consumes, plus the normalization of the legacy flat shape some profiles
//! still carry.
//!
//! Profiles arrive as opaque JSON from the external profile source. The two
//! shapes in the wild are modeled as an explicit untagged union and collapsed
//! into `ApplicationData` exactly once, at this boundary. Nothing downstream
//! ever sees a legacy payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical application data consumed by the executor and the pre-fill flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicationData {
    pub personal_info: PersonalInfo,
    #[serde(default)]
    pub experience: Vec<ExperienceEntry>,
    #[serde(default)]
    pub education: Vec<EducationEntry>,
    #[serde(default)]
    pub skills: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonalInfo {
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub linkedin: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
}

/// Dates are carried as opaque strings: the browser driver types them into
/// whatever format the target form expects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperienceEntry {
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EducationEntry {
    #[serde(default)]
    pub institution: String,
    #[serde(default)]
    pub degree: Option<String>,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
}

impl ApplicationData {
    /// The minimum an ATS form ever needs: a name and an email address.
    pub fn is_complete(&self) -> bool {
        !self.personal_info.full_name.trim().is_empty()
            && !self.personal_info.email.trim().is_empty()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Legacy shape
// ────────────────────────────────────────────────────────────────────────────

/// The flat camelCase shape older profiles were stored in. `skills` shows up
/// as either a comma-separated string or an array, so it is held as a raw
/// `Value` until normalization.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyProfile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub work_history: Vec<LegacyWorkEntry>,
    #[serde(default)]
    pub education_history: Vec<LegacyEducationEntry>,
    #[serde(default)]
    pub skills: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyWorkEntry {
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyEducationEntry {
    #[serde(default)]
    pub school: String,
    #[serde(default)]
    pub degree: Option<String>,
    #[serde(default)]
    pub field_of_study: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
}

/// The two profile shapes in the wild. Canonical payloads carry a
/// `personal_info` object; anything else falls through to the legacy arm.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ProfilePayload {
    Canonical(ApplicationData),
    Legacy(LegacyProfile),
}

impl ProfilePayload {
    /// Collapses either shape into canonical `ApplicationData`.
    pub fn normalize(self) -> ApplicationData {
        match self {
            ProfilePayload::Canonical(data) => data,
            ProfilePayload::Legacy(legacy) => normalize_legacy(legacy),
        }
    }
}

fn normalize_legacy(legacy: LegacyProfile) -> ApplicationData {
    let full_name = match (legacy.name, legacy.first_name, legacy.last_name) {
        (Some(name), _, _) if !name.trim().is_empty() => name,
        (_, Some(first), Some(last)) => format!("{} {}", first.trim(), last.trim()),
        (_, Some(first), None) => first,
        (_, None, Some(last)) => last,
        _ => String::new(),
    };

    let experience = legacy
        .work_history
        .into_iter()
        .map(|w| ExperienceEntry {
            company: w.company,
            title: w.title.or(w.position).unwrap_or_default(),
            start_date: w.start_date,
            end_date: w.end_date,
            summary: w.description,
        })
        .collect();

    let education = legacy
        .education_history
        .into_iter()
        .map(|e| EducationEntry {
            institution: e.school,
            degree: e.degree,
            field: e.field_of_study,
            end_date: e.end_date,
        })
        .collect();

    ApplicationData {
        personal_info: PersonalInfo {
            full_name,
            email: legacy.email.unwrap_or_default(),
            phone: legacy.phone,
            location: legacy.location,
            linkedin: None,
            website: None,
        },
        experience,
        education,
        skills: normalize_skills(legacy.skills),
    }
}

/// Legacy `skills` was either a comma-separated string or a string array.
fn normalize_skills(skills: Option<Value>) -> Vec<String> {
    match skills {
        Some(Value::String(s)) => s
            .split(',')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect(),
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_payload_parses_as_canonical() {
        let json = serde_json::json!({
            "personal_info": {"full_name": "Jane Doe", "email": "jane@example.com"},
            "experience": [],
            "skills": ["rust", "sql"]
        });
        let payload: ProfilePayload = serde_json::from_value(json).unwrap();
        assert!(matches!(payload, ProfilePayload::Canonical(_)));
        let data = payload.normalize();
        assert_eq!(data.personal_info.full_name, "Jane Doe");
        assert_eq!(data.skills, vec!["rust", "sql"]);
        assert!(data.is_complete());
    }

    #[test]
    fn test_legacy_name_field_maps_to_full_name() {
        let json = serde_json::json!({
            "name": "John Smith",
            "email": "john@example.com"
        });
        let data: ProfilePayload = serde_json::from_value(json).unwrap();
        let data = data.normalize();
        assert_eq!(data.personal_info.full_name, "John Smith");
        assert!(data.is_complete());
    }

    #[test]
    fn test_legacy_split_name_is_joined() {
        let json = serde_json::json!({
            "firstName": "Ada",
            "lastName": "Lovelace",
            "email": "ada@example.com"
        });
        let data: ProfilePayload = serde_json::from_value(json).unwrap();
        let data = data.normalize();
        assert_eq!(data.personal_info.full_name, "Ada Lovelace");
    }

    #[test]
    fn test_legacy_skills_comma_string() {
        let json = serde_json::json!({
            "name": "X",
            "email": "x@example.com",
            "skills": "rust, postgres,  redis "
        });
        let data: ProfilePayload = serde_json::from_value(json).unwrap();
        assert_eq!(data.normalize().skills, vec!["rust", "postgres", "redis"]);
    }

    #[test]
    fn test_legacy_skills_array() {
        let json = serde_json::json!({
            "name": "X",
            "email": "x@example.com",
            "skills": ["rust", "", "sql"]
        });
        let data: ProfilePayload = serde_json::from_value(json).unwrap();
        assert_eq!(data.normalize().skills, vec!["rust", "sql"]);
    }

    #[test]
    fn test_legacy_work_history_maps_to_experience() {
        let json = serde_json::json!({
            "name": "X",
            "email": "x@example.com",
            "workHistory": [
                {"company": "Acme", "position": "Engineer", "startDate": "2020-01", "description": "Built things"}
            ]
        });
        let data: ProfilePayload = serde_json::from_value(json).unwrap();
        let data = data.normalize();
        assert_eq!(data.experience.len(), 1);
        assert_eq!(data.experience[0].company, "Acme");
        assert_eq!(data.experience[0].title, "Engineer");
        assert_eq!(data.experience[0].summary.as_deref(), Some("Built things"));
    }

    #[test]
    fn test_missing_email_is_incomplete() {
        let json = serde_json::json!({"name": "No Email"});
        let data: ProfilePayload = serde_json::from_value(json).unwrap();
        assert!(!data.normalize().is_complete());
    }

    #[test]
    fn test_missing_name_is_incomplete() {
        let json = serde_json::json!({"email": "anon@example.com"});
        let data: ProfilePayload = serde_json::from_value(json).unwrap();
        assert!(!data.normalize().is_complete());
    }

    #[test]
    fn test_whitespace_only_name_is_incomplete() {
        let json = serde_json::json!({
            "personal_info": {"full_name": "   ", "email": "x@example.com"}
        });
        let data: ProfilePayload = serde_json::from_value(json).unwrap();
        assert!(!data.normalize().is_complete());
    }
}
