use super::{DefinitionError, DefinitionVersion, FlowDefinition, PromptTemplate, StepDefinition};
use crate::shared::fs_atomic::write_file_atomically;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Read side of the versioned definition store.
pub trait DefinitionStore: Send + Sync {
    fn load_flow_definition(
        &self,
        id: &str,
        version: DefinitionVersion,
    ) -> Result<FlowDefinition, DefinitionError>;

    fn load_step_definition(&self, id: &str) -> Result<StepDefinition, DefinitionError>;

    fn load_prompt_template(
        &self,
        id: &str,
        version: DefinitionVersion,
    ) -> Result<PromptTemplate, DefinitionError>;
}

fn select_version<T: Clone>(
    kind: &'static str,
    id: &str,
    versions: Option<&BTreeMap<u32, T>>,
    version: DefinitionVersion,
    is_published: impl Fn(&T) -> bool,
    not_found: impl Fn() -> DefinitionError,
) -> Result<T, DefinitionError> {
    let Some(versions) = versions else {
        return Err(not_found());
    };
    match version {
        DefinitionVersion::Number(number) => versions.get(&number).cloned().ok_or_else(not_found),
        DefinitionVersion::LatestPublished => versions
            .values()
            .rev()
            .find(|candidate| is_published(candidate))
            .cloned()
            .ok_or_else(|| DefinitionError::NotPublished {
                kind,
                id: id.to_string(),
            }),
    }
}

#[derive(Debug, Default)]
struct InMemoryDefinitions {
    flows: BTreeMap<String, BTreeMap<u32, FlowDefinition>>,
    steps: BTreeMap<String, StepDefinition>,
    prompts: BTreeMap<String, BTreeMap<u32, PromptTemplate>>,
}

#[derive(Debug, Default)]
pub struct InMemoryDefinitionStore {
    inner: RwLock<InMemoryDefinitions>,
}

impl InMemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flow(self, flow: FlowDefinition) -> Result<Self, DefinitionError> {
        self.put_flow(flow)?;
        Ok(self)
    }

    pub fn with_step(self, step: StepDefinition) -> Result<Self, DefinitionError> {
        self.put_step(step)?;
        Ok(self)
    }

    pub fn with_prompt(self, prompt: PromptTemplate) -> Result<Self, DefinitionError> {
        self.put_prompt(prompt)?;
        Ok(self)
    }

    pub fn put_flow(&self, flow: FlowDefinition) -> Result<(), DefinitionError> {
        flow.validate()?;
        let mut inner = self.write()?;
        if let Some(existing) = inner
            .flows
            .get(&flow.id)
            .and_then(|versions| versions.get(&flow.version))
        {
            existing.ensure_editable()?;
        }
        inner
            .flows
            .entry(flow.id.clone())
            .or_default()
            .insert(flow.version, flow);
        Ok(())
    }

    pub fn put_step(&self, step: StepDefinition) -> Result<(), DefinitionError> {
        let mut inner = self.write()?;
        match inner.steps.get(&step.id) {
            Some(previous) => step.validate_update(previous)?,
            None => step.validate()?,
        }
        inner.steps.insert(step.id.clone(), step);
        Ok(())
    }

    pub fn put_prompt(&self, prompt: PromptTemplate) -> Result<(), DefinitionError> {
        let mut inner = self.write()?;
        inner
            .prompts
            .entry(prompt.id.clone())
            .or_default()
            .insert(prompt.version, prompt);
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, InMemoryDefinitions>, DefinitionError> {
        self.inner
            .read()
            .map_err(|_| DefinitionError::Unavailable("definition lock poisoned".to_string()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, InMemoryDefinitions>, DefinitionError> {
        self.inner
            .write()
            .map_err(|_| DefinitionError::Unavailable("definition lock poisoned".to_string()))
    }
}

impl DefinitionStore for InMemoryDefinitionStore {
    fn load_flow_definition(
        &self,
        id: &str,
        version: DefinitionVersion,
    ) -> Result<FlowDefinition, DefinitionError> {
        let inner = self.read()?;
        select_version(
            "flow definition",
            id,
            inner.flows.get(id),
            version,
            |flow| flow.is_published,
            || DefinitionError::FlowNotFound {
                id: id.to_string(),
                version: version.to_string(),
            },
        )
    }

    fn load_step_definition(&self, id: &str) -> Result<StepDefinition, DefinitionError> {
        let inner = self.read()?;
        inner
            .steps
            .get(id)
            .cloned()
            .ok_or_else(|| DefinitionError::StepNotFound { id: id.to_string() })
    }

    fn load_prompt_template(
        &self,
        id: &str,
        version: DefinitionVersion,
    ) -> Result<PromptTemplate, DefinitionError> {
        let inner = self.read()?;
        select_version(
            "prompt template",
            id,
            inner.prompts.get(id),
            version,
            |prompt| prompt.is_published,
            || DefinitionError::PromptNotFound {
                id: id.to_string(),
                version: version.to_string(),
            },
        )
    }
}

/// Definitions kept as YAML (or JSON) files:
/// `flows/<id>/<version>.yaml`, `steps/<id>.yaml`, `prompts/<id>/<version>.yaml`.
#[derive(Debug, Clone)]
pub struct FileDefinitionStore {
    root: PathBuf,
}

const DEFINITION_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

fn io_error(path: &Path, source: std::io::Error) -> DefinitionError {
    DefinitionError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn read_definition<T: DeserializeOwned>(path: &Path) -> Result<T, DefinitionError> {
    let raw = fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    serde_yaml::from_str(&raw).map_err(|source| DefinitionError::Parse {
        path: path.display().to_string(),
        source,
    })
}

fn write_definition<T: Serialize>(path: &Path, value: &T) -> Result<(), DefinitionError> {
    let encoded = serde_yaml::to_string(value).map_err(|source| DefinitionError::Encode {
        path: path.display().to_string(),
        source,
    })?;
    write_file_atomically(path, encoded.as_bytes()).map_err(|e| io_error(path, e))
}

impl FileDefinitionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn flows_dir(&self, id: &str) -> PathBuf {
        self.root.join("flows").join(id)
    }

    fn prompts_dir(&self, id: &str) -> PathBuf {
        self.root.join("prompts").join(id)
    }

    pub fn save_flow(&self, flow: &FlowDefinition) -> Result<PathBuf, DefinitionError> {
        flow.validate()?;
        let path = self.flows_dir(&flow.id).join(format!("{}.yaml", flow.version));
        if path.exists() {
            read_definition::<FlowDefinition>(&path)?.ensure_editable()?;
        }
        write_definition(&path, flow)?;
        Ok(path)
    }

    pub fn save_step(&self, step: &StepDefinition) -> Result<PathBuf, DefinitionError> {
        match self.find_file(&self.root.join("steps"), &step.id) {
            Some(existing) => step.validate_update(&read_definition(&existing)?)?,
            None => step.validate()?,
        }
        let path = self.root.join("steps").join(format!("{}.yaml", step.id));
        write_definition(&path, step)?;
        Ok(path)
    }

    pub fn save_prompt(&self, prompt: &PromptTemplate) -> Result<PathBuf, DefinitionError> {
        let path = self
            .prompts_dir(&prompt.id)
            .join(format!("{}.yaml", prompt.version));
        write_definition(&path, prompt)?;
        Ok(path)
    }

    fn find_file(&self, dir: &Path, stem: &str) -> Option<PathBuf> {
        DEFINITION_EXTENSIONS
            .iter()
            .map(|ext| dir.join(format!("{stem}.{ext}")))
            .find(|candidate| candidate.is_file())
    }

    fn load_versions<T: DeserializeOwned>(
        &self,
        dir: &Path,
    ) -> Result<Option<BTreeMap<u32, T>>, DefinitionError> {
        if !dir.is_dir() {
            return Ok(None);
        }
        let mut versions = BTreeMap::new();
        for entry in fs::read_dir(dir).map_err(|e| io_error(dir, e))? {
            let path = entry.map_err(|e| io_error(dir, e))?.path();
            let is_definition = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| DEFINITION_EXTENSIONS.contains(&ext));
            let Some(number) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u32>().ok())
            else {
                continue;
            };
            if is_definition {
                versions.insert(number, read_definition(&path)?);
            }
        }
        Ok(Some(versions))
    }
}

impl DefinitionStore for FileDefinitionStore {
    fn load_flow_definition(
        &self,
        id: &str,
        version: DefinitionVersion,
    ) -> Result<FlowDefinition, DefinitionError> {
        let versions = self.load_versions::<FlowDefinition>(&self.flows_dir(id))?;
        select_version(
            "flow definition",
            id,
            versions.as_ref(),
            version,
            |flow| flow.is_published,
            || DefinitionError::FlowNotFound {
                id: id.to_string(),
                version: version.to_string(),
            },
        )
    }

    fn load_step_definition(&self, id: &str) -> Result<StepDefinition, DefinitionError> {
        let path = self
            .find_file(&self.root.join("steps"), id)
            .ok_or_else(|| DefinitionError::StepNotFound { id: id.to_string() })?;
        read_definition(&path)
    }

    fn load_prompt_template(
        &self,
        id: &str,
        version: DefinitionVersion,
    ) -> Result<PromptTemplate, DefinitionError> {
        let versions = self.load_versions::<PromptTemplate>(&self.prompts_dir(id))?;
        select_version(
            "prompt template",
            id,
            versions.as_ref(),
            version,
            |prompt| prompt.is_published,
            || DefinitionError::PromptNotFound {
                id: id.to_string(),
                version: version.to_string(),
            },
        )
    }
}
