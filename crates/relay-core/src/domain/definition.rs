use crate::domain::participant::Lane;
use crate::CoreError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

/// Value object: content-derived process definition ID (`sha256:<hex>`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefinitionId(pub String);

impl DefinitionId {
    /// Derive the definition ID from the raw diagram document
    pub fn for_source(source: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        Self(format!("sha256:{}", hex::encode(hasher.finalize())))
    }
}

impl std::fmt::Display for DefinitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value object: Task ID (element id within a diagram)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a task ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The closed set of element kinds a diagram may contain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    /// Process start node fired by an external event
    Trigger,
    /// Start node of a sub-process scope
    Start,
    /// Sink node
    End,
    /// Abstract service task; never executable on its own
    Service,
    /// Stored-procedure task: batch accounting processing
    BatchProcessing,
    /// Stored-procedure task: accounting period close
    PeriodClose,
    /// Outbound HTTP/API call
    Http,
    /// Arithmetic formula over prior task outputs
    Calculate,
    /// Mint a password-reset URL through the user-management service
    PasswordResetUrl,
    /// Nested sub-graph executed once per collection item
    SubProcess,
    /// Remote approval form
    UserApproval,
    /// Remote external form
    UserExternalForm,
    /// Live in-engine form pushed to a connected session
    UserForm,
    /// Send an email through the email channel
    Email,
    /// Run a QL pipeline
    Query,
}

/// One element of the diagram's graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementDefinition {
    /// Element ID, unique within the document
    pub id: String,

    /// Human-readable label, used for `{Label}` references
    #[serde(default)]
    pub name: Option<String>,

    /// Element kind
    pub kind: ElementKind,

    /// Kind-specific configuration
    #[serde(default)]
    pub config: serde_json::Value,

    /// Lane the element sits in
    #[serde(default)]
    pub lane: Option<String>,

    /// Containing sub-process element, if any
    #[serde(default)]
    pub parent: Option<String>,
}

impl ElementDefinition {
    /// The label used for references: name when present, otherwise id
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Directed sequence flow between two elements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDefinition {
    /// Source element ID
    pub from: String,
    /// Target element ID
    pub to: String,
}

/// The parsed element graph handed over by the diagram parser
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDocument {
    /// Process name
    pub name: String,

    /// Elements
    #[serde(default)]
    pub elements: Vec<ElementDefinition>,

    /// Connections
    #[serde(default)]
    pub connections: Vec<ConnectionDefinition>,

    /// Lanes / participants
    #[serde(default)]
    pub lanes: Vec<Lane>,
}

impl ProcessDocument {
    /// Parse a JSON or YAML document
    pub fn parse(source: &str) -> Result<Self, CoreError> {
        let trimmed = source.trim_start();
        if trimmed.starts_with('{') {
            Ok(serde_json::from_str(source)?)
        } else {
            Ok(serde_yaml::from_str(source)?)
        }
    }
}

/// Immutable, content-addressed compiled process definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// Hash of the source document
    pub id: DefinitionId,

    /// Process name
    pub name: String,

    /// The validated element graph
    pub document: ProcessDocument,
}

impl ProcessDefinition {
    /// Parse and validate a diagram document
    pub fn compile(source: &str) -> Result<Self, CoreError> {
        let document = ProcessDocument::parse(source)?;
        let definition = Self {
            id: DefinitionId::for_source(source),
            name: document.name.clone(),
            document,
        };
        definition.validate()?;
        Ok(definition)
    }

    /// Find an element by ID
    pub fn element(&self, id: &str) -> Option<&ElementDefinition> {
        self.document.elements.iter().find(|e| e.id == id)
    }

    /// Elements directly contained in a scope (`None` = top level)
    pub fn elements_in<'a>(
        &'a self,
        scope: Option<&'a str>,
    ) -> impl Iterator<Item = &'a ElementDefinition> + 'a {
        self.document
            .elements
            .iter()
            .filter(move |e| e.parent.as_deref() == scope)
    }

    /// Find a lane by ID
    pub fn lane(&self, id: &str) -> Option<&Lane> {
        self.document.lanes.iter().find(|l| l.id == id)
    }

    /// The start element of a scope: the trigger at top level, the start node in a sub-process
    pub fn start_of<'a>(&'a self, scope: Option<&'a str>) -> Option<&'a ElementDefinition> {
        let kind = if scope.is_none() {
            ElementKind::Trigger
        } else {
            ElementKind::Start
        };
        self.elements_in(scope).find(|e| e.kind == kind)
    }

    /// Label -> task ID index over every element in the document
    pub fn labels(&self) -> HashMap<String, TaskId> {
        let mut labels = HashMap::with_capacity(self.document.elements.len() * 2);
        for element in &self.document.elements {
            labels.insert(element.label().to_string(), TaskId::new(&element.id));
        }
        // IDs always win over a colliding label
        for element in &self.document.elements {
            labels.insert(element.id.clone(), TaskId::new(&element.id));
        }
        labels
    }

    /// Validate the element graph
    pub fn validate(&self) -> Result<(), CoreError> {
        let doc = &self.document;

        let mut ids = HashSet::new();
        for element in &doc.elements {
            if !ids.insert(element.id.as_str()) {
                return Err(CoreError::ValidationError(format!(
                    "Duplicate element ID: {}",
                    element.id
                )));
            }
        }

        for element in &doc.elements {
            if let Some(lane) = &element.lane {
                if self.lane(lane).is_none() {
                    return Err(CoreError::ValidationError(format!(
                        "Element {} references unknown lane: {}",
                        element.id, lane
                    )));
                }
            }
            if let Some(parent) = &element.parent {
                match self.element(parent) {
                    Some(p) if p.kind == ElementKind::SubProcess => {}
                    Some(_) => {
                        return Err(CoreError::ValidationError(format!(
                            "Element {} has parent {} which is not a sub-process",
                            element.id, parent
                        )))
                    }
                    None => {
                        return Err(CoreError::ValidationError(format!(
                            "Element {} references unknown parent: {}",
                            element.id, parent
                        )))
                    }
                }
            }
        }

        for connection in &doc.connections {
            let from = self.element(&connection.from).ok_or_else(|| {
                CoreError::ValidationError(format!(
                    "Connection references unknown element: {}",
                    connection.from
                ))
            })?;
            let to = self.element(&connection.to).ok_or_else(|| {
                CoreError::ValidationError(format!(
                    "Connection references unknown element: {}",
                    connection.to
                ))
            })?;
            if from.parent != to.parent {
                return Err(CoreError::ValidationError(format!(
                    "Connection {} -> {} crosses a sub-process boundary",
                    from.id, to.id
                )));
            }
        }

        let triggers = self
            .elements_in(None)
            .filter(|e| e.kind == ElementKind::Trigger)
            .count();
        if triggers != 1 {
            return Err(CoreError::ValidationError(format!(
                "Process must have exactly one trigger, found {}",
                triggers
            )));
        }

        for sub in doc
            .elements
            .iter()
            .filter(|e| e.kind == ElementKind::SubProcess)
        {
            let starts = self
                .elements_in(Some(&sub.id))
                .filter(|e| e.kind == ElementKind::Start)
                .count();
            if starts != 1 {
                return Err(CoreError::ValidationError(format!(
                    "Sub-process {} must have exactly one start element, found {}",
                    sub.id, starts
                )));
            }
        }

        Ok(())
    }
}
