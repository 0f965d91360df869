//! Group label map loading.
//!
//! Consumes the `{application -> (application_name, {group -> label})}`
//! shape that a Toolkit project-file parser would hand back
//! (`original_source/cbus/daemon/cmqttd.py::read_cbz_labels`), without
//! implementing the CBZ/XML unpacking itself — that parser is an external
//! collaborator out of scope here. The JSON document this module reads is
//! the boundary-testable stand-in: the real Toolkit parser is a drop-in
//! replacement behind the same [`LabelMap::load`] signature.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::codec::Application;

#[derive(Debug, Error)]
pub enum LabelMapError {
    #[error("failed to read project file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse project file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One application's entry: its display name plus its group labels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplicationLabels {
    pub name: String,
    pub groups: HashMap<u8, String>,
}

/// `application -> (application_name, {group -> label})`, as consumed by the
/// MQTT gateway's discovery pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelMap {
    applications: HashMap<Application, ApplicationLabels>,
}

/// Wire shape: `{"56": {"name": "Lighting", "groups": {"1": "Hall"}}}`.
#[derive(Deserialize)]
struct RawLabelMap(HashMap<String, RawApplicationLabels>);

#[derive(Deserialize)]
struct RawApplicationLabels {
    name: String,
    groups: HashMap<String, String>,
}

impl LabelMap {
    pub fn load(path: &Path) -> Result<Self, LabelMapError> {
        let text = std::fs::read_to_string(path).map_err(|source| LabelMapError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let raw: RawLabelMap =
            serde_json::from_str(&text).map_err(|source| LabelMapError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        let mut applications = HashMap::with_capacity(raw.0.len());
        for (app, labels) in raw.0 {
            let Ok(app_byte) = app.parse::<u8>() else {
                continue;
            };
            let groups = labels
                .groups
                .into_iter()
                .filter_map(|(g, label)| g.parse::<u8>().ok().map(|g| (g, label)))
                .collect();
            applications.insert(
                Application(app_byte),
                ApplicationLabels {
                    name: labels.name,
                    groups,
                },
            );
        }
        Ok(Self { applications })
    }

    pub fn is_empty(&self) -> bool {
        self.applications.is_empty()
    }

    pub fn applications(&self) -> impl Iterator<Item = (Application, &ApplicationLabels)> {
        self.applications.iter().map(|(app, labels)| (*app, labels))
    }

    /// Looks up the display name for a `(application, group)` pair, falling
    /// back to `None` when unlabelled (the gateway synthesises a default
    /// name in that case).
    pub fn group_name(&self, app: Application, group: u8) -> Option<&str> {
        self.applications
            .get(&app)?
            .groups
            .get(&group)
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_labels_from_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"56": {{"name": "Lighting", "groups": {{"1": "Hall"}}}}}}"#
        )
        .unwrap();

        let map = LabelMap::load(file.path()).unwrap();
        assert_eq!(
            map.group_name(Application::LIGHTING, 1),
            Some("Hall")
        );
        assert_eq!(map.group_name(Application::LIGHTING, 2), None);
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = LabelMap::load(Path::new("/nonexistent/project.json"));
        assert!(matches!(result, Err(LabelMapError::Read { .. })));
    }
}
