//! Requirements analysis.
//!
//! The natural-language understanding itself is an external collaborator
//! behind [`RequirementsAnalyzer`]. The bundled [`LlmAnalyzer`] prompts the
//! shared LLM for a JSON record and parses it strictly: unknown enum values
//! surface as errors rather than being silently dropped, while unrecognized
//! extra fields are merely logged.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use maestro_llm::{GenerationOptions, LlmClient};
use maestro_types::{Complexity, ProjectType, Requirements, Technology};

/// Errors surfaced by requirement analysis.
#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    /// An enum field carried a value outside the closed set.
    #[error("unknown value for {field}: {value}")]
    UnknownValue {
        /// Field name in the analyzer output.
        field: &'static str,
        /// The offending value.
        value: String,
    },
    /// The analyzer output was not a JSON object.
    #[error("analyzer output is not a JSON object")]
    NotAnObject,
    /// No JSON could be extracted from the analyzer output.
    #[error("no JSON found in analyzer output")]
    NoJson,
    /// The underlying LLM call failed.
    #[error("analyzer llm call failed: {0}")]
    Llm(String),
}

/// Turns free-form text into a typed requirement record.
#[async_trait]
pub trait RequirementsAnalyzer: Send + Sync {
    /// Analyze `user_text`, optionally informed by session context.
    async fn analyze(
        &self,
        user_text: &str,
        context: &Value,
    ) -> Result<Requirements, AnalyzerError>;
}

/// Keys the parser understands; anything else is logged and ignored.
const KNOWN_FIELDS: &[&str] = &[
    "project_type",
    "technologies",
    "features",
    "complexity",
    "has_auth",
    "has_database",
    "has_realtime",
    "has_deployment",
    "has_testing",
    "has_documentation",
];

/// Parse an analyzer JSON record into [`Requirements`].
///
/// Missing fields take the defaults (web_app / medium / testing and
/// documentation on); unknown enum values are errors. The result is
/// normalized before returning.
pub fn parse_requirements(value: &Value) -> Result<Requirements, AnalyzerError> {
    let object = value.as_object().ok_or(AnalyzerError::NotAnObject)?;

    for key in object.keys() {
        if !KNOWN_FIELDS.contains(&key.as_str()) {
            warn!(field = %key, "ignoring unrecognized analyzer field");
        }
    }

    let mut requirements = Requirements::default();

    if let Some(raw) = object.get("project_type").and_then(Value::as_str) {
        requirements.project_type =
            ProjectType::parse(raw).ok_or_else(|| AnalyzerError::UnknownValue {
                field: "project_type",
                value: raw.to_string(),
            })?;
    }

    if let Some(raw) = object.get("complexity").and_then(Value::as_str) {
        requirements.complexity =
            Complexity::parse(raw).ok_or_else(|| AnalyzerError::UnknownValue {
                field: "complexity",
                value: raw.to_string(),
            })?;
    }

    if let Some(list) = object.get("technologies").and_then(Value::as_array) {
        for entry in list {
            let raw = entry.as_str().ok_or_else(|| AnalyzerError::UnknownValue {
                field: "technologies",
                value: entry.to_string(),
            })?;
            let tech = Technology::parse(raw).ok_or_else(|| AnalyzerError::UnknownValue {
                field: "technologies",
                value: raw.to_string(),
            })?;
            requirements.technologies.insert(tech);
        }
    }

    if let Some(list) = object.get("features").and_then(Value::as_array) {
        requirements.features = list
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
    }

    let flag = |key: &str, default: bool| -> bool {
        object.get(key).and_then(Value::as_bool).unwrap_or(default)
    };
    requirements.flags.has_auth = flag("has_auth", false);
    requirements.flags.has_database = flag("has_database", false);
    requirements.flags.has_realtime = flag("has_realtime", false);
    requirements.flags.has_deployment = flag("has_deployment", false);
    requirements.flags.has_testing = flag("has_testing", true);
    requirements.flags.has_documentation = flag("has_documentation", true);

    requirements.normalize();
    Ok(requirements)
}

/// Extract the first JSON object embedded in `text`.
pub fn extract_json(text: &str) -> Result<Value, AnalyzerError> {
    let start = text.find('{').ok_or(AnalyzerError::NoJson)?;
    let mut depth = 0usize;
    for (offset, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..start + offset + 1];
                    return serde_json::from_str(candidate).map_err(|_| AnalyzerError::NoJson);
                }
            }
            _ => {}
        }
    }
    Err(AnalyzerError::NoJson)
}

/// LLM-backed analyzer.
pub struct LlmAnalyzer {
    llm: Arc<dyn LlmClient>,
    options: GenerationOptions,
}

impl LlmAnalyzer {
    /// Create an analyzer over the shared LLM handle.
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            options: GenerationOptions {
                // Analysis wants structure, not creativity.
                temperature: 0.2,
                ..GenerationOptions::default()
            },
        }
    }

    fn prompt(user_text: &str, context: &Value) -> String {
        format!(
            "Analyze the following project description and extract key information.\n\n\
             Project description: {user_text}\n\
             Session context: {context}\n\n\
             Respond with a single JSON object with these fields:\n\
             - project_type: one of web_app, api, microservice, cli, library, mobile, \
               data_pipeline, ml, documentation, other\n\
             - technologies: array drawn from python_fastapi, python_django, python_flask, \
               nodejs_express, nodejs_nestjs, vue_typescript, react_typescript, angular, \
               golang, rust, database_postgres, database_mongodb, database_redis, docker, \
               kubernetes, aws, gcp, azure\n\
             - features: array of short feature descriptions\n\
             - complexity: one of simple, medium, complex, enterprise\n\
             - has_auth, has_database, has_realtime, has_deployment, has_testing, \
               has_documentation: booleans"
        )
    }
}

#[async_trait]
impl RequirementsAnalyzer for LlmAnalyzer {
    async fn analyze(
        &self,
        user_text: &str,
        context: &Value,
    ) -> Result<Requirements, AnalyzerError> {
        let reply = self
            .llm
            .generate(&Self::prompt(user_text, context), &self.options)
            .await
            .map_err(|e| AnalyzerError::Llm(e.to_string()))?;
        let json = extract_json(&reply.text)?;
        parse_requirements(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_llm::CannedLlmClient;

    #[test]
    fn parses_full_record() {
        let value = serde_json::json!({
            "project_type": "web_app",
            "technologies": ["python_fastapi", "vue_typescript", "database_postgres"],
            "features": ["auth", "catalog"],
            "complexity": "complex",
            "has_auth": true,
            "has_deployment": true
        });
        let req = parse_requirements(&value).unwrap();
        assert_eq!(req.project_type, ProjectType::WebApp);
        assert_eq!(req.complexity, Complexity::Complex);
        assert!(req.flags.has_auth);
        // Normalization added docker for the deployment flag.
        assert!(req.technologies.contains(&Technology::Docker));
        assert_eq!(req.features, vec!["auth", "catalog"]);
    }

    #[test]
    fn unknown_enum_values_are_errors() {
        let value = serde_json::json!({ "project_type": "hologram" });
        assert!(matches!(
            parse_requirements(&value),
            Err(AnalyzerError::UnknownValue { field: "project_type", .. })
        ));

        let value = serde_json::json!({ "technologies": ["cobol"] });
        assert!(matches!(
            parse_requirements(&value),
            Err(AnalyzerError::UnknownValue { field: "technologies", .. })
        ));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let req = parse_requirements(&serde_json::json!({})).unwrap();
        assert_eq!(req.project_type, ProjectType::WebApp);
        assert_eq!(req.complexity, Complexity::Medium);
        assert!(req.flags.has_testing);
        assert!(req.flags.has_documentation);
        assert!(req.technologies.is_empty());
    }

    #[test]
    fn extract_json_skips_prose() {
        let text = "Here is the analysis:\n```json\n{\"complexity\": \"simple\"}\n``` done";
        let value = extract_json(text).unwrap();
        assert_eq!(value["complexity"], "simple");
    }

    #[tokio::test]
    async fn llm_analyzer_end_to_end() {
        let llm = CannedLlmClient::new(
            serde_json::json!({
                "project_type": "api",
                "technologies": ["python_fastapi"],
                "complexity": "simple",
                "has_testing": true
            })
            .to_string(),
        );
        let analyzer = LlmAnalyzer::new(Arc::new(llm));
        let req = analyzer
            .analyze("a small api", &Value::Null)
            .await
            .unwrap();
        assert_eq!(req.project_type, ProjectType::Api);
        assert!(req.technologies.contains(&Technology::PythonFastapi));
    }
}
