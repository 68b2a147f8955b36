use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::PackagingError;
use crate::protocol::Protocol;
use crate::storage::StorageUri;

/// Descriptor written into every unit's artifact folder.
pub const METADATA_FILE: &str = "unit.json";
/// Optional environment spec declared by the user next to the artifacts.
pub const ENVIRONMENT_SPEC_FILE: &str = "environment.json";
/// Environment descriptor captured by `save`.
pub const ENVIRONMENT_LOCK_FILE: &str = "environment.lock.json";

/// Framework that produced a model's trained artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFramework {
    SKLearn,
    XGBoost,
    LightGBM,
    MLFlow,
    TensorFlow,
    PyTorch,
    ONNX,
    Custom,
}

impl ModelFramework {
    /// Prepackaged Seldon server able to load this framework.
    pub const fn seldon_implementation(self) -> Option<&'static str> {
        match self {
            ModelFramework::SKLearn => Some("SKLEARN_SERVER"),
            ModelFramework::XGBoost => Some("XGBOOST_SERVER"),
            ModelFramework::MLFlow => Some("MLFLOW_SERVER"),
            ModelFramework::TensorFlow => Some("TENSORFLOW_SERVER"),
            ModelFramework::PyTorch | ModelFramework::ONNX => Some("TRITON_SERVER"),
            ModelFramework::LightGBM | ModelFramework::Custom => None,
        }
    }

    /// MLServer runtime class used when serving over the V2 protocol.
    pub const fn mlserver_runtime(self) -> Option<&'static str> {
        match self {
            ModelFramework::SKLearn => Some("mlserver_sklearn.SKLearnModel"),
            ModelFramework::XGBoost => Some("mlserver_xgboost.XGBoostModel"),
            ModelFramework::LightGBM => Some("mlserver_lightgbm.LightGBMModel"),
            ModelFramework::MLFlow => Some("mlserver_mlflow.MLflowRuntime"),
            _ => None,
        }
    }

    /// Conventional file name of the trained artifact.
    pub const fn artifact_file(self) -> Option<&'static str> {
        match self {
            ModelFramework::SKLearn => Some("model.joblib"),
            ModelFramework::XGBoost => Some("model.bst"),
            ModelFramework::LightGBM => Some("model.txt"),
            ModelFramework::MLFlow => Some("MLmodel"),
            ModelFramework::TensorFlow => Some("saved_model.pb"),
            ModelFramework::PyTorch => Some("model.pt"),
            ModelFramework::ONNX => Some("model.onnx"),
            ModelFramework::Custom => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Model,
    Pipeline,
}

/// Identity and artifact location shared by models and pipelines.
#[derive(Debug, Clone)]
pub struct UnitDetails {
    /// Unique name; also the container / cluster resource name.
    pub name: String,
    pub local_folder: PathBuf,
    pub uri: StorageUri,
    pub protocol: Protocol,
    pub description: Option<String>,
}

impl UnitDetails {
    pub fn new(name: impl Into<String>, local_folder: impl Into<PathBuf>, uri: StorageUri) -> Self {
        Self {
            name: name.into(),
            local_folder: local_folder.into(),
            uri,
            protocol: Protocol::default(),
            description: None,
        }
    }
}

/// Serialized form of a unit, stored as [`METADATA_FILE`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitMetadata {
    pub name: String,
    pub kind: UnitKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<ModelFramework>,
    pub uri: String,
    pub protocol: Protocol,
    /// Names of the units this one calls.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Relative path -> SHA-256 (hex) of every artifact file in the folder.
    #[serde(default)]
    pub artifact_hashes: BTreeMap<String, String>,
    /// Version of this crate that wrote the descriptor.
    pub version: String,
}

impl UnitMetadata {
    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self, PackagingError> {
        let metadata: Self = serde_json::from_str(json)?;
        metadata.validate()?;
        Ok(metadata)
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, PackagingError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Read and validate the descriptor from an artifact folder.
    pub fn load(folder: &Path) -> Result<Self, PackagingError> {
        let path = folder.join(METADATA_FILE);
        let json = fs::read_to_string(&path).map_err(|source| PackagingError::Io { path, source })?;
        Self::from_json(&json)
    }

    /// Validate naming, dependencies and hash format.
    pub fn validate(&self) -> Result<(), PackagingError> {
        if !is_valid_resource_name(&self.name) {
            return Err(PackagingError::InvalidMetadata(format!(
                "'{}' is not a valid unit name (lowercase alphanumerics and '-', max 63)",
                self.name
            )));
        }
        match (self.kind, self.platform) {
            (UnitKind::Model, None) => {
                return Err(PackagingError::InvalidMetadata(format!(
                    "model '{}' has no platform",
                    self.name
                )));
            }
            (UnitKind::Pipeline, Some(_)) => {
                return Err(PackagingError::InvalidMetadata(format!(
                    "pipeline '{}' must not declare a platform",
                    self.name
                )));
            }
            _ => {}
        }
        if self.kind == UnitKind::Model && !self.dependencies.is_empty() {
            return Err(PackagingError::InvalidMetadata(format!(
                "model '{}' cannot have dependencies",
                self.name
            )));
        }

        let mut seen = std::collections::BTreeSet::new();
        for dep in &self.dependencies {
            if dep == &self.name {
                return Err(PackagingError::InvalidMetadata(format!(
                    "'{}' depends on itself",
                    self.name
                )));
            }
            if !seen.insert(dep) {
                return Err(PackagingError::InvalidMetadata(format!(
                    "duplicate dependency '{dep}'"
                )));
            }
        }

        for (file, hash) in &self.artifact_hashes {
            if hash.len() != 64 || hex::decode(hash).is_err() {
                return Err(PackagingError::InvalidMetadata(format!(
                    "artifact '{file}' has malformed hash '{hash}'"
                )));
            }
        }
        Ok(())
    }

    /// Re-hash the folder and compare against the recorded hashes.
    pub fn verify_artifacts(&self, folder: &Path) -> Result<(), PackagingError> {
        let actual = hash_artifacts(folder)?;
        for (file, expected) in &self.artifact_hashes {
            match actual.get(file) {
                Some(got) if got == expected => {}
                other => {
                    return Err(PackagingError::HashMismatch {
                        file: file.clone(),
                        expected: expected.clone(),
                        actual: other.cloned().unwrap_or_else(|| "<missing>".into()),
                    });
                }
            }
        }
        Ok(())
    }
}

/// DNS-1123 label: lowercase alphanumerics and '-', alphanumeric at both
/// ends, at most 63 characters.
pub fn is_valid_resource_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 63
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes[0] != b'-'
        && bytes[bytes.len() - 1] != b'-'
}

/// SHA-256 every regular file under `folder`, keyed by '/'-separated
/// relative path. Generated descriptors are skipped.
pub fn hash_artifacts(folder: &Path) -> Result<BTreeMap<String, String>, PackagingError> {
    let mut hashes = BTreeMap::new();
    if folder.exists() {
        hash_dir(folder, folder, &mut hashes)?;
    }
    Ok(hashes)
}

fn hash_dir(
    root: &Path,
    dir: &Path,
    out: &mut BTreeMap<String, String>,
) -> Result<(), PackagingError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| PackagingError::Io { path, source }
    };
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let entry = entry.map_err(io_err(dir))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(io_err(&path))?;
        if file_type.is_dir() {
            hash_dir(root, &path, out)?;
            continue;
        }
        if !file_type.is_file() {
            continue;
        }
        let rel = path
            .strip_prefix(root)
            .map_err(|e| PackagingError::InvalidMetadata(e.to_string()))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if rel == METADATA_FILE || rel == ENVIRONMENT_LOCK_FILE {
            continue;
        }

        let mut file = fs::File::open(&path).map_err(io_err(&path))?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = file.read(&mut buf).map_err(io_err(&path))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        out.insert(rel, hex::encode(hasher.finalize()));
    }
    Ok(())
}

/// User-declared execution environment ([`ENVIRONMENT_SPEC_FILE`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
    /// Requirements such as `scikit-learn==1.0.2` or `numpy`.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl EnvironmentSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Load the spec declared in `folder`, if any.
    pub fn load(folder: &Path) -> Result<Option<Self>, PackagingError> {
        let path = folder.join(ENVIRONMENT_SPEC_FILE);
        let json = match fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(PackagingError::Io { path, source }),
        };
        let spec: Self =
            serde_json::from_str(&json).map_err(|e| PackagingError::MalformedEnvironment {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        spec.validate()
            .map_err(|reason| PackagingError::MalformedEnvironment { path, reason })?;
        Ok(Some(spec))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("environment name is empty".into());
        }
        for dep in &self.dependencies {
            validate_requirement(dep)?;
        }
        for key in self.env.keys() {
            let mut chars = key.chars();
            let valid_start = chars
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
            if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(format!("invalid environment variable name '{key}'"));
            }
        }
        Ok(())
    }
}

fn validate_requirement(req: &str) -> Result<(), String> {
    const OPERATORS: [&str; 6] = ["==", ">=", "<=", "~=", ">", "<"];
    let (name, version) = OPERATORS
        .iter()
        .find_map(|op| req.split_once(op))
        .map_or((req, None), |(n, v)| (n, Some(v)));

    let name_ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !name_ok {
        return Err(format!("invalid requirement '{req}'"));
    }
    if let Some(version) = version {
        if version.is_empty() || version.chars().any(char::is_whitespace) {
            return Err(format!("invalid version in requirement '{req}'"));
        }
    }
    Ok(())
}

/// Reproducible description of the environment a unit was saved from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentDescriptor {
    pub spec: EnvironmentSpec,
    pub os: String,
    pub arch: String,
    pub family: String,
    /// `<crate>@<version>` that captured the environment.
    pub packager: String,
}

impl EnvironmentDescriptor {
    pub fn capture(spec: EnvironmentSpec) -> Self {
        Self {
            spec,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            family: std::env::consts::FAMILY.to_string(),
            packager: format!("{}@{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Write the unit descriptor (and optionally the captured environment)
/// into `folder`, hashing whatever artifacts are already there.
pub(crate) fn write_artifacts(
    folder: &Path,
    mut metadata: UnitMetadata,
    capture_environment: bool,
) -> Result<UnitMetadata, PackagingError> {
    metadata.validate()?;
    fs::create_dir_all(folder).map_err(|source| PackagingError::Io {
        path: folder.to_path_buf(),
        source,
    })?;

    metadata.artifact_hashes = hash_artifacts(folder)?;

    if capture_environment {
        let spec = EnvironmentSpec::load(folder)?
            .unwrap_or_else(|| EnvironmentSpec::named(metadata.name.clone()));
        let descriptor = EnvironmentDescriptor::capture(spec);
        write_json(&folder.join(ENVIRONMENT_LOCK_FILE), &descriptor)?;
    }

    write_json(&folder.join(METADATA_FILE), &metadata)?;
    debug!(
        unit = %metadata.name,
        files = metadata.artifact_hashes.len(),
        capture_environment,
        "metadata: artifacts written"
    );
    Ok(metadata)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PackagingError> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).map_err(|source| PackagingError::Io {
        path: path.to_path_buf(),
        source,
    })
}
