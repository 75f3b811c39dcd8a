//! Chart definition and loading
//!
//! A chart directory looks like:
//!
//! ```text
//! mychart/
//!   Chart.yaml        # metadata (name, version, ...)
//!   values.yaml       # default values (optional)
//!   templates/        # template files, rendered in name order
//! ```

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{CoreError, Result};
use crate::values::Values;

/// Template file extensions picked up from `templates/`
const TEMPLATE_EXTENSIONS: &[&str] = &["yaml", "yml", "j2", "jinja2", "txt", "json", "tpl"];

/// Chart metadata from `Chart.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    /// Chart name (required)
    pub name: String,

    /// Chart version (required, SemVer)
    #[serde(with = "version_serde")]
    pub version: Version,

    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Application version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
}

impl ChartMetadata {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            description: None,
            app_version: None,
        }
    }
}

/// A loaded chart: metadata, default values and templates keyed by relative path
#[derive(Debug, Clone, PartialEq)]
pub struct Chart {
    pub metadata: ChartMetadata,
    pub values: Values,
    pub templates: BTreeMap<String, String>,
}

impl Chart {
    /// Create an empty in-memory chart
    pub fn new(metadata: ChartMetadata) -> Self {
        Self {
            metadata,
            values: Values::new(),
            templates: BTreeMap::new(),
        }
    }

    /// Add a template
    pub fn with_template(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.templates.insert(name.into(), content.into());
        self
    }

    /// Replace the default values
    pub fn with_values(mut self, values: Values) -> Self {
        self.values = values;
        self
    }

    /// Load a chart from a directory
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let root = path.as_ref();

        if !root.is_dir() {
            return Err(CoreError::ChartNotFound {
                path: root.display().to_string(),
            });
        }

        let chart_file = root.join("Chart.yaml");
        if !chart_file.exists() {
            return Err(CoreError::InvalidChart {
                message: format!("Chart.yaml not found in {}", root.display()),
            });
        }

        let metadata: ChartMetadata = serde_yaml::from_str(&std::fs::read_to_string(&chart_file)?)?;
        if metadata.name.trim().is_empty() {
            return Err(CoreError::InvalidChart {
                message: "metadata name must not be empty".to_string(),
            });
        }

        let values_path = root.join("values.yaml");
        let values = if values_path.exists() {
            Values::from_file(&values_path)?
        } else {
            Values::new()
        };

        let templates_dir = root.join("templates");
        let mut templates = BTreeMap::new();
        if templates_dir.is_dir() {
            for entry in walkdir::WalkDir::new(&templates_dir)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let path = entry.path();
                if !path.is_file() || !has_template_extension(path) {
                    continue;
                }
                let rel = path.strip_prefix(&templates_dir).unwrap_or(path);
                // forward slashes keep template names stable across platforms
                let name = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                templates.insert(name, std::fs::read_to_string(path)?);
            }
        }

        Ok(Self {
            metadata,
            values,
            templates,
        })
    }

    /// Check the chart version against a SemVer requirement such as `^1.2`
    pub fn ensure_version(&self, requirement: &str) -> Result<()> {
        let req = VersionReq::parse(requirement)?;
        if req.matches(&self.metadata.version) {
            Ok(())
        } else {
            Err(CoreError::VersionMismatch {
                name: self.metadata.name.clone(),
                version: self.metadata.version.to_string(),
                requirement: requirement.to_string(),
            })
        }
    }
}

fn has_template_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| TEMPLATE_EXTENSIONS.contains(&ext.as_str()))
}

/// Custom serde for semver::Version
mod version_serde {
    use semver::Version;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(version: &Version, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&version.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Version, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Version::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_chart(dir: &Path) {
        fs::write(
            dir.join("Chart.yaml"),
            "name: web\nversion: 1.2.3\ndescription: A web app\nappVersion: \"2.0\"\n",
        )
        .unwrap();
        fs::write(dir.join("values.yaml"), "replicas: 2\n").unwrap();
        fs::create_dir_all(dir.join("templates/sub")).unwrap();
        fs::write(dir.join("templates/service.yaml"), "kind: Service").unwrap();
        fs::write(dir.join("templates/sub/deploy.yaml"), "kind: Deployment").unwrap();
        fs::write(dir.join("templates/README.md"), "ignored").unwrap();
    }

    #[test]
    fn test_load_chart() {
        let dir = tempfile::tempdir().unwrap();
        write_chart(dir.path());

        let chart = Chart::load(dir.path()).unwrap();
        assert_eq!(chart.metadata.name, "web");
        assert_eq!(chart.metadata.version, Version::new(1, 2, 3));
        assert_eq!(chart.metadata.app_version.as_deref(), Some("2.0"));
        assert_eq!(chart.values.get("replicas").unwrap(), 2);

        let names: Vec<_> = chart.templates.keys().cloned().collect();
        assert_eq!(names, vec!["service.yaml", "sub/deploy.yaml"]);
    }

    #[test]
    fn test_load_missing_directory() {
        let err = Chart::load("/definitely/not/here").unwrap_err();
        assert!(matches!(err, CoreError::ChartNotFound { .. }));
    }

    #[test]
    fn test_load_without_chart_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let err = Chart::load(dir.path()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidChart { .. }));
    }

    #[test]
    fn test_ensure_version() {
        let chart = Chart::new(ChartMetadata::new("web", Version::new(1, 4, 0)));
        assert!(chart.ensure_version("^1.2").is_ok());
        assert!(matches!(
            chart.ensure_version(">=2"),
            Err(CoreError::VersionMismatch { .. })
        ));
        assert!(matches!(
            chart.ensure_version("not a req"),
            Err(CoreError::InvalidVersion(_))
        ));
    }
}
