//! Analyzed project requirements consumed by the pool maker.
//!
//! The requirement record is produced by an external analyzer from free-form
//! text; everything here is plain data plus the normalization invariants the
//! pool maker relies on.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::warn;

/// High-level classification of the requested project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectType {
    /// Browser-facing application with a backing service.
    WebApp,
    /// Standalone HTTP/RPC API.
    Api,
    /// Service in a larger mesh.
    Microservice,
    /// Command-line tool.
    Cli,
    /// Reusable library.
    Library,
    /// Mobile application.
    Mobile,
    /// Batch/stream data processing.
    DataPipeline,
    /// Machine-learning project.
    Ml,
    /// Documentation-only effort.
    Documentation,
    /// Anything else.
    Other,
}

impl ProjectType {
    /// Parse a lowercase tag; `None` for unknown values.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "web_app" => Some(Self::WebApp),
            "api" => Some(Self::Api),
            "microservice" => Some(Self::Microservice),
            "cli" => Some(Self::Cli),
            "library" => Some(Self::Library),
            "mobile" => Some(Self::Mobile),
            "data_pipeline" => Some(Self::DataPipeline),
            "ml" => Some(Self::Ml),
            "documentation" => Some(Self::Documentation),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

/// Closed set of technology tags recognized by the template tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Technology {
    PythonFastapi,
    PythonDjango,
    PythonFlask,
    NodejsExpress,
    NodejsNestjs,
    VueTypescript,
    ReactTypescript,
    Angular,
    Golang,
    Rust,
    DatabasePostgres,
    DatabaseMongodb,
    DatabaseRedis,
    Docker,
    Kubernetes,
    Aws,
    Gcp,
    Azure,
}

impl Technology {
    /// Parse a lowercase tag; `None` for unknown values.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "python_fastapi" => Some(Self::PythonFastapi),
            "python_django" => Some(Self::PythonDjango),
            "python_flask" => Some(Self::PythonFlask),
            "nodejs_express" => Some(Self::NodejsExpress),
            "nodejs_nestjs" => Some(Self::NodejsNestjs),
            "vue_typescript" => Some(Self::VueTypescript),
            "react_typescript" => Some(Self::ReactTypescript),
            "angular" => Some(Self::Angular),
            "golang" => Some(Self::Golang),
            "rust" => Some(Self::Rust),
            "database_postgres" => Some(Self::DatabasePostgres),
            "database_mongodb" => Some(Self::DatabaseMongodb),
            "database_redis" => Some(Self::DatabaseRedis),
            "docker" => Some(Self::Docker),
            "kubernetes" => Some(Self::Kubernetes),
            "aws" => Some(Self::Aws),
            "gcp" => Some(Self::Gcp),
            "azure" => Some(Self::Azure),
            _ => None,
        }
    }

    /// Whether this tag names a frontend stack.
    pub fn is_frontend(self) -> bool {
        matches!(
            self,
            Self::VueTypescript | Self::ReactTypescript | Self::Angular
        )
    }

    /// Whether this tag names a backend stack.
    pub fn is_backend(self) -> bool {
        matches!(
            self,
            Self::PythonFastapi
                | Self::PythonDjango
                | Self::PythonFlask
                | Self::NodejsExpress
                | Self::NodejsNestjs
                | Self::Golang
                | Self::Rust
        )
    }

    /// Whether this tag names a database.
    pub fn is_database(self) -> bool {
        matches!(
            self,
            Self::DatabasePostgres | Self::DatabaseMongodb | Self::DatabaseRedis
        )
    }
}

/// Estimated effort class for the requested project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    /// Trivial, single-component work.
    Simple,
    /// Typical multi-component project.
    Medium,
    /// Many components, cross-cutting concerns.
    Complex,
    /// Large, multi-team scope.
    Enterprise,
}

impl Complexity {
    /// Parse a lowercase tag; `None` for unknown values.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "simple" => Some(Self::Simple),
            "medium" => Some(Self::Medium),
            "complex" => Some(Self::Complex),
            "enterprise" => Some(Self::Enterprise),
            _ => None,
        }
    }
}

/// Boolean requirement facets extracted from the project description.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementFlags {
    /// Authentication/authorization requested.
    pub has_auth: bool,
    /// Persistent storage requested.
    pub has_database: bool,
    /// Realtime features (websockets, live updates) requested.
    pub has_realtime: bool,
    /// Deployment/CI setup requested.
    pub has_deployment: bool,
    /// Automated testing requested.
    pub has_testing: bool,
    /// Documentation requested.
    pub has_documentation: bool,
}

/// Analyzed project requirements.
///
/// The technology set is ordered (`BTreeSet`) so downstream template
/// selection and plan construction are deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    /// Project classification.
    pub project_type: ProjectType,
    /// Technology tags in play.
    pub technologies: BTreeSet<Technology>,
    /// Human-meaningful feature list; informational only.
    pub features: Vec<String>,
    /// Estimated effort class.
    pub complexity: Complexity,
    /// Boolean requirement facets.
    pub flags: RequirementFlags,
}

impl Default for Requirements {
    fn default() -> Self {
        Self {
            project_type: ProjectType::WebApp,
            technologies: BTreeSet::new(),
            features: Vec::new(),
            complexity: Complexity::Medium,
            flags: RequirementFlags {
                has_testing: true,
                has_documentation: true,
                ..RequirementFlags::default()
            },
        }
    }
}

impl Requirements {
    /// Enforce the requirement-record invariants in place.
    ///
    /// Deployment implies docker; a web app declaring a frontend stack
    /// without any backend stack is downgraded to `Simple` with a warning.
    pub fn normalize(&mut self) {
        if self.flags.has_deployment {
            self.technologies.insert(Technology::Docker);
        }

        let has_frontend = self.technologies.iter().any(|t| t.is_frontend());
        let has_backend = self.technologies.iter().any(|t| t.is_backend());
        if self.project_type == ProjectType::WebApp && has_frontend && !has_backend {
            warn!(
                "frontend technology declared without a backend; downgrading complexity to simple"
            );
            self.complexity = Complexity::Simple;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_implies_docker() {
        let mut req = Requirements::default();
        req.flags.has_deployment = true;
        req.normalize();
        assert!(req.technologies.contains(&Technology::Docker));
    }

    #[test]
    fn frontend_without_backend_downgrades_complexity() {
        let mut req = Requirements {
            complexity: Complexity::Complex,
            ..Requirements::default()
        };
        req.technologies.insert(Technology::VueTypescript);
        req.normalize();
        assert_eq!(req.complexity, Complexity::Simple);
    }

    #[test]
    fn frontend_with_backend_keeps_complexity() {
        let mut req = Requirements {
            complexity: Complexity::Complex,
            ..Requirements::default()
        };
        req.technologies.insert(Technology::VueTypescript);
        req.technologies.insert(Technology::PythonFastapi);
        req.normalize();
        assert_eq!(req.complexity, Complexity::Complex);
    }

    #[test]
    fn unknown_tags_are_rejected() {
        assert!(Technology::parse("cobol").is_none());
        assert!(ProjectType::parse("videogame").is_none());
        assert!(Complexity::parse("impossible").is_none());
    }

    #[test]
    fn defaults_match_analyzer_contract() {
        let req = Requirements::default();
        assert_eq!(req.project_type, ProjectType::WebApp);
        assert_eq!(req.complexity, Complexity::Medium);
        assert!(req.flags.has_testing);
        assert!(req.flags.has_documentation);
        assert!(!req.flags.has_auth);
    }
}
