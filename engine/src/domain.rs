//! The field-survey schema.
//!
//! Field data (households, participants, samples, surveys, form responses)
//! is captured on the device and pushed with `client_wins`. Reference data
//! (form definitions, project metadata, settings) belongs to the authority
//! and is pulled with `server_wins`.

use crate::reconcile::ConflictStrategy;
use crate::schema::{CollectionSchema, FieldDef, FieldType, Schema};
use crate::SchemaVersion;

/// Version of [`survey_schema`].
pub const SURVEY_SCHEMA_VERSION: SchemaVersion = 1;

pub const HOUSEHOLDS: &str = "households";
pub const PARTICIPANTS: &str = "participants";
pub const SAMPLES: &str = "samples";
pub const SURVEYS: &str = "surveys";
pub const FORM_RESPONSES: &str = "form_responses";
pub const FORMS: &str = "forms";
pub const PROJECT_METADATA: &str = "project_metadata";
pub const SETTINGS: &str = "settings";

fn field_data(name: &str, fields: Vec<FieldDef>) -> CollectionSchema {
    CollectionSchema::new(name, fields).with_strategy(ConflictStrategy::ClientWins)
}

fn reference_data(name: &str, fields: Vec<FieldDef>) -> CollectionSchema {
    CollectionSchema::new(name, fields)
        .with_strategy(ConflictStrategy::ServerWins)
        .reference()
}

/// Build the field-survey schema.
pub fn survey_schema() -> Schema {
    use FieldType::*;

    Schema::new(SURVEY_SCHEMA_VERSION)
        .with_collection(field_data(
            HOUSEHOLDS,
            vec![
                FieldDef::required("householdCode", String),
                FieldDef::optional("village", String),
                FieldDef::optional("headOfHousehold", String),
                FieldDef::optional("memberCount", Int),
                FieldDef::optional("location", Json),
            ],
        ))
        .with_collection(
            field_data(
                PARTICIPANTS,
                vec![
                    FieldDef::required("householdId", String),
                    FieldDef::required("name", String),
                    FieldDef::optional("age", Int),
                    FieldDef::optional("sex", String),
                    FieldDef::optional("consentGiven", Bool),
                    FieldDef::optional("enrolledAt", Timestamp),
                ],
            )
            .with_index("householdId"),
        )
        .with_collection(
            field_data(
                SAMPLES,
                vec![
                    FieldDef::required("participantId", String),
                    FieldDef::required("sampleType", String),
                    FieldDef::optional("barcode", String),
                    FieldDef::optional("collectedAt", Timestamp),
                    FieldDef::optional("volumeMl", Float),
                ],
            )
            .with_index("participantId"),
        )
        .with_collection(
            field_data(
                SURVEYS,
                vec![
                    FieldDef::required("householdId", String),
                    FieldDef::required("formId", String),
                    FieldDef::optional("status", String),
                    FieldDef::optional("startedAt", Timestamp),
                    FieldDef::optional("completedAt", Timestamp),
                ],
            )
            .with_index("householdId")
            .with_index("formId"),
        )
        .with_collection(
            field_data(
                FORM_RESPONSES,
                vec![
                    FieldDef::required("formId", String),
                    FieldDef::required("surveyId", String),
                    FieldDef::required("answers", Json),
                ],
            )
            .with_index("formId")
            .with_index("surveyId"),
        )
        .with_collection(reference_data(
            FORMS,
            vec![
                FieldDef::required("title", String),
                FieldDef::optional("formVersion", Int),
                FieldDef::optional("definition", Json),
            ],
        ))
        .with_collection(reference_data(
            PROJECT_METADATA,
            vec![
                FieldDef::required("projectName", String),
                FieldDef::optional("sites", Json),
            ],
        ))
        .with_collection(reference_data(
            SETTINGS,
            vec![
                FieldDef::required("key", String),
                FieldDef::optional("value", Json),
            ],
        ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_valid() {
        let schema = survey_schema();
        assert!(schema.validate().is_ok());
        assert_eq!(schema.collections.len(), 8);
    }

    #[test]
    fn reference_collections_are_server_wins() {
        let schema = survey_schema();
        let reference: Vec<_> = schema
            .reference_collections()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(reference, vec![FORMS, PROJECT_METADATA, SETTINGS]);
        for name in reference {
            assert_eq!(schema.strategy_for(name), ConflictStrategy::ServerWins);
        }
        assert_eq!(schema.strategy_for(SAMPLES), ConflictStrategy::ClientWins);
    }

    #[test]
    fn linking_fields_are_indexed() {
        let schema = survey_schema();
        assert!(schema.collection(PARTICIPANTS).unwrap().is_indexed("householdId"));
        assert!(schema.collection(SAMPLES).unwrap().is_indexed("participantId"));
        assert!(schema.collection(FORM_RESPONSES).unwrap().is_indexed("surveyId"));
        assert!(!schema.collection(HOUSEHOLDS).unwrap().is_indexed("village"));
    }
}
