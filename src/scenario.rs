use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::evaluator::CriterionSpec;

#[derive(Debug, Error)]
pub enum ScenarioLoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported document type: {0} (expected .yaml, .yml or .json)")]
    UnsupportedFormat(PathBuf),
    #[error("unknown persona '{name}'{hint}")]
    UnknownPersona { name: String, hint: String },
    #[error("invalid definition '{id}': {reason}")]
    Invalid { id: String, reason: String },
}

fn default_max_turns() -> usize {
    10
}

fn default_timeout_secs() -> u64 {
    300
}

/// A declarative test conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Scenario {
    /// Defaults to the file stem when loaded from disk.
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Name (or file stem) of the persona driving the customer.
    pub persona: String,
    pub initial_message: String,
    /// Criterion name mapped to the outcome the run must produce.
    #[serde(default)]
    pub success_criteria: BTreeMap<String, bool>,
    /// Criteria that are reported but do not affect the overall verdict.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub advisory: Vec<String>,
    /// Scenario-local predicates; these shadow built-in criteria of the same name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub criteria_definitions: BTreeMap<String, CriterionSpec>,
    /// Upper bound on manager replies.
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(rename = "timeout", alias = "timeout_secs", default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Scenario {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ScenarioLoadError> {
        let path = path.as_ref();
        let mut scenario: Scenario = read_document(path)?;
        if scenario.id.trim().is_empty() {
            scenario.id = file_stem(path);
        }
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn is_advisory(&self, criterion: &str) -> bool {
        self.advisory.iter().any(|name| name == criterion)
    }

    pub fn validate(&self) -> Result<(), ScenarioLoadError> {
        let invalid = |reason: String| ScenarioLoadError::Invalid {
            id: self.id.clone(),
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty".to_string()));
        }
        if self.initial_message.trim().is_empty() {
            return Err(invalid("initial_message must not be empty".to_string()));
        }
        if self.max_turns == 0 {
            return Err(invalid("max_turns must be at least 1".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(invalid("timeout must be at least 1 second".to_string()));
        }
        for name in &self.advisory {
            if !self.success_criteria.contains_key(name) {
                return Err(invalid(format!(
                    "advisory criterion '{name}' is not listed in success_criteria"
                )));
            }
        }
        Ok(())
    }
}

/// Behavioural dials for the synthetic customer, each in `0.0..=1.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Characteristics {
    pub politeness: f64,
    pub decisiveness: f64,
    pub budget_sensitivity: f64,
    pub question_frequency: f64,
    #[serde(flatten)]
    pub extra: BTreeMap<String, f64>,
}

impl Default for Characteristics {
    fn default() -> Self {
        Self {
            politeness: 0.5,
            decisiveness: 0.5,
            budget_sensitivity: 0.5,
            question_frequency: 0.5,
            extra: BTreeMap::new(),
        }
    }
}

impl Characteristics {
    fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        [
            ("politeness", self.politeness),
            ("decisiveness", self.decisiveness),
            ("budget_sensitivity", self.budget_sensitivity),
            ("question_frequency", self.question_frequency),
        ]
        .into_iter()
        .chain(self.extra.iter().map(|(name, value)| (name.as_str(), *value)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PastOrder {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Behavioural profile of the synthetic customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Persona {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub characteristics: Characteristics,
    #[serde(default)]
    pub preferences: BTreeMap<String, Value>,
    #[serde(default)]
    pub order_history: Vec<PastOrder>,
    #[serde(default)]
    pub communication_style: String,
}

impl Persona {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ScenarioLoadError> {
        let persona: Persona = read_document(path.as_ref())?;
        persona.validate()?;
        Ok(persona)
    }

    pub fn validate(&self) -> Result<(), ScenarioLoadError> {
        if self.name.trim().is_empty() {
            return Err(ScenarioLoadError::Invalid {
                id: "<persona>".to_string(),
                reason: "name must not be empty".to_string(),
            });
        }
        for (dial, value) in self.characteristics.iter() {
            if !(0.0..=1.0).contains(&value) {
                return Err(ScenarioLoadError::Invalid {
                    id: self.name.clone(),
                    reason: format!("characteristic '{dial}' = {value} is outside 0.0..=1.0"),
                });
            }
        }
        Ok(())
    }
}

/// Personas indexed by name and by file stem.
#[derive(Debug, Clone, Default)]
pub struct PersonaCatalog {
    personas: BTreeMap<String, Arc<Persona>>,
}

impl PersonaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, persona: Persona) {
        let persona = Arc::new(persona);
        self.personas
            .insert(normalize_key(&persona.name), Arc::clone(&persona));
        self.personas.insert(normalize_key(&key.into()), persona);
    }

    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, ScenarioLoadError> {
        let mut catalog = Self::new();
        for path in document_paths(dir.as_ref())? {
            let persona = Persona::from_path(&path)?;
            catalog.insert(file_stem(&path), persona);
        }
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.personas
            .values()
            .map(|persona| persona.name.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }

    pub fn get(&self, name: &str) -> Result<Arc<Persona>, ScenarioLoadError> {
        let want = normalize_key(name);
        if let Some(persona) = self.personas.get(&want) {
            return Ok(Arc::clone(persona));
        }

        let suggestion = self
            .personas
            .keys()
            .map(|key| (key, strsim::levenshtein(&want, key)))
            .filter(|(_, distance)| *distance <= 3)
            .min_by_key(|(_, distance)| *distance)
            .map(|(key, _)| key.clone());

        Err(ScenarioLoadError::UnknownPersona {
            name: name.to_string(),
            hint: suggestion
                .map(|key| format!(" (did you mean '{key}'?)"))
                .unwrap_or_default(),
        })
    }

    /// Pairs a scenario with the persona it references.
    pub fn resolve(&self, scenario: Scenario) -> Result<ScenarioCase, ScenarioLoadError> {
        let persona = self.get(&scenario.persona)?;
        Ok(ScenarioCase {
            scenario: Arc::new(scenario),
            persona,
        })
    }
}

/// A scenario together with its resolved persona: everything one run needs
/// besides the agents themselves.
#[derive(Debug, Clone)]
pub struct ScenarioCase {
    pub scenario: Arc<Scenario>,
    pub persona: Arc<Persona>,
}

impl ScenarioCase {
    pub fn new(scenario: Scenario, persona: Persona) -> Self {
        Self {
            scenario: Arc::new(scenario),
            persona: Arc::new(persona),
        }
    }
}

/// Result of loading a scenario directory: the files that parsed and the
/// ones that did not. A bad file never prevents its siblings from running.
#[derive(Debug, Default)]
pub struct ScenarioSet {
    pub scenarios: Vec<Scenario>,
    pub rejected: Vec<(PathBuf, ScenarioLoadError)>,
}

impl ScenarioSet {
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, ScenarioLoadError> {
        let mut set = Self::default();
        let mut seen = BTreeSet::new();

        for path in document_paths(dir.as_ref())? {
            match Scenario::from_path(&path) {
                Ok(scenario) if !seen.insert(scenario.id.clone()) => {
                    let id = scenario.id.clone();
                    set.rejected.push((
                        path,
                        ScenarioLoadError::Invalid {
                            id,
                            reason: "duplicate scenario id".to_string(),
                        },
                    ));
                }
                Ok(scenario) => set.scenarios.push(scenario),
                Err(error) => set.rejected.push((path, error)),
            }
        }

        set.scenarios.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(set)
    }
}

fn normalize_key(value: &str) -> String {
    value.trim().to_lowercase()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default()
        .to_string()
}

fn document_paths(dir: &Path) -> Result<Vec<PathBuf>, ScenarioLoadError> {
    let entries = fs::read_dir(dir).map_err(|source| ScenarioLoadError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ScenarioLoadError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        if path.is_file() && matches!(ext, "yaml" | "yml" | "json") {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T, ScenarioLoadError> {
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    if !matches!(ext, "yaml" | "yml" | "json") {
        return Err(ScenarioLoadError::UnsupportedFormat(path.to_path_buf()));
    }

    let bytes = fs::read(path).map_err(|source| ScenarioLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    if ext == "json" {
        serde_json::from_slice(&bytes).map_err(|source| ScenarioLoadError::Json {
            path: path.to_path_buf(),
            source,
        })
    } else {
        serde_yaml::from_slice(&bytes).map_err(|source| ScenarioLoadError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
name: Budget bouquet
description: Customer looks for a cheap bouquet
persona: thrifty_student
initial_message: "Ищу бюджетный букет до 10000 тенге"
success_criteria:
  products_shown: true
  price_filter_used: true
max_turns: 5
timeout: 120
"#;

    const PERSONA: &str = r#"
name: Thrifty Student
type: budget_conscious
characteristics:
  politeness: 0.8
  decisiveness: 0.4
  budget_sensitivity: 0.95
  question_frequency: 0.6
preferences:
  flowers: [tulips, chrysanthemums]
  max_budget: 10000
order_history:
  - date: "2024-02-14"
    items: ["5 red tulips"]
    total: 7500
communication_style: short informal messages
"#;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "dialogbench-scenario-{name}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn scenario_id_defaults_to_file_stem() {
        let dir = temp_dir("stem");
        let path = dir.join("budget_bouquet.yaml");
        fs::write(&path, SCENARIO).unwrap();

        let scenario = Scenario::from_path(&path).expect("scenario loads");
        assert_eq!(scenario.id, "budget_bouquet");
        assert_eq!(scenario.max_turns, 5);
        assert_eq!(scenario.timeout(), Duration::from_secs(120));
        assert_eq!(scenario.success_criteria.get("products_shown"), Some(&true));
    }

    #[test]
    fn persona_lookup_by_stem_name_and_fuzzy_hint() {
        let dir = temp_dir("persona");
        fs::write(dir.join("thrifty_student.yaml"), PERSONA).unwrap();

        let catalog = PersonaCatalog::load_dir(&dir).expect("catalog loads");
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("thrifty_student").unwrap().kind, "budget_conscious");
        assert_eq!(catalog.get("Thrifty Student").unwrap().characteristics.budget_sensitivity, 0.95);

        let error = catalog.get("thrifty_studnet").unwrap_err();
        let message = error.to_string();
        assert!(message.contains("did you mean 'thrifty_student'"), "{message}");
    }

    #[test]
    fn out_of_range_characteristic_is_rejected() {
        let dir = temp_dir("range");
        let path = dir.join("bad.yaml");
        fs::write(&path, PERSONA.replace("0.95", "1.7")).unwrap();

        let error = Persona::from_path(&path).unwrap_err();
        assert!(matches!(error, ScenarioLoadError::Invalid { .. }));
    }

    #[test]
    fn directory_load_keeps_good_files_and_reports_bad_ones() {
        let dir = temp_dir("set");
        fs::write(dir.join("b_second.yaml"), SCENARIO).unwrap();
        fs::write(dir.join("a_first.json"), r#"{"name": "json one", "persona": "p", "initial_message": "hi"}"#).unwrap();
        fs::write(dir.join("broken.yaml"), "name: [unterminated").unwrap();
        fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let set = ScenarioSet::load_dir(&dir).expect("directory readable");
        let ids: Vec<_> = set.scenarios.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a_first", "b_second"]);
        assert_eq!(set.rejected.len(), 1);
        assert!(matches!(set.rejected[0].1, ScenarioLoadError::Yaml { .. }));
    }

    #[test]
    fn advisory_names_must_exist() {
        let mut scenario: Scenario = serde_yaml::from_str(SCENARIO).unwrap();
        scenario.id = "x".into();
        scenario.advisory = vec!["missing".into()];
        assert!(scenario.validate().is_err());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let error = Scenario::from_path("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(error, ScenarioLoadError::Io { .. }));
    }
}
