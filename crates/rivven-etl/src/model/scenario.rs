//! Scenarios: the unit of work of the engine

use super::destination::Destination;
use super::source::Source;
use super::variable::Variable;

/// What happens to generated scripts after assembly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PersistAction {
    /// Execute the scripts
    #[default]
    Execute,
    /// Generate (and optionally save) without executing
    Skip,
}

/// A named set of sources, destinations and variables
#[derive(Debug, Clone)]
pub struct Scenario {
    /// Scenario name
    pub name: String,
    /// Base name for saved scripts; defaults to `name`
    pub script_name: Option<String>,
    /// Dialect key (`sqlite`, `postgres`, `mysql`)
    pub driver: String,
    /// Sources in extraction order
    pub sources: Vec<Source>,
    /// Destinations in load order
    pub destinations: Vec<Destination>,
    /// Scenario-wide variables
    pub variables: Vec<Variable>,
    /// Commit after every executed script unit
    pub commit_per_block: bool,
    /// Write assembled scripts to the script directory
    pub save_scripts: bool,
    /// Execute or only generate
    pub on_persist: PersistAction,
}

impl Scenario {
    /// Create an empty scenario for a dialect
    pub fn new(name: impl Into<String>, driver: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script_name: None,
            driver: driver.into(),
            sources: Vec::new(),
            destinations: Vec::new(),
            variables: Vec::new(),
            commit_per_block: false,
            save_scripts: false,
            on_persist: PersistAction::Execute,
        }
    }

    /// Add a source
    pub fn with_source(mut self, source: Source) -> Self {
        self.sources.push(source);
        self
    }

    /// Add a destination
    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destinations.push(destination);
        self
    }

    /// Add a scenario-wide variable
    pub fn with_variable(mut self, variable: Variable) -> Self {
        self.variables.push(variable.global());
        self
    }

    /// Save scripts on assembly
    pub fn saving_scripts(mut self) -> Self {
        self.save_scripts = true;
        self
    }

    /// Base name used for saved scripts
    pub fn script_name(&self) -> &str {
        self.script_name.as_deref().unwrap_or(&self.name)
    }

    /// Source by name
    pub fn source(&self, name: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.name == name)
    }

    /// Mutable source by name
    pub fn source_mut(&mut self, name: &str) -> Option<&mut Source> {
        self.sources.iter_mut().find(|s| s.name == name)
    }

    /// Destination by name
    pub fn destination(&self, name: &str) -> Option<&Destination> {
        self.destinations.iter().find(|d| d.name == name)
    }

    /// Global variable by name
    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables
            .iter()
            .find(|v| v.name.eq_ignore_ascii_case(name))
    }
}
