//! Template storages.
//!
//! A template storage keeps named file trees (`storage:prefix/name`) that
//! are materialized into service directories before start and receive
//! deployed files back after stop. Storages are published through the
//! service registry under their names so modules can plug in remote
//! backends; the node ships the local filesystem storage.

use crate::service::types::ServiceTemplate;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Template storage errors.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template {0} does not exist")]
    TemplateMissing(String),

    #[error("I/O error on template {template}: {source}")]
    Io {
        template: String,
        source: std::io::Error,
    },
}

/// A named storage of service templates.
pub trait TemplateStorage: Send + Sync {
    fn name(&self) -> &str;

    fn has_template(&self, template: &ServiceTemplate) -> bool;

    /// Creates an empty template. Returns false if it already existed.
    fn create_template(&self, template: &ServiceTemplate) -> Result<bool, TemplateError>;

    /// Deletes a template tree. Returns false if it did not exist.
    fn delete_template(&self, template: &ServiceTemplate) -> Result<bool, TemplateError>;

    /// Copies the template tree into `target_dir` (staging).
    fn copy_template_into(
        &self,
        template: &ServiceTemplate,
        target_dir: &Path,
    ) -> Result<(), TemplateError>;

    /// Copies `files` (paths relative to `source_dir`) back into the
    /// template (deployment). Returns the number of files written.
    fn deploy_into_template(
        &self,
        template: &ServiceTemplate,
        source_dir: &Path,
        files: &[PathBuf],
    ) -> Result<usize, TemplateError>;

    /// All templates present in this storage.
    fn templates(&self) -> Vec<ServiceTemplate>;
}

/// Filesystem-backed storage under `<root>/<prefix>/<name>`.
///
/// Copy and deploy hold a per-template lock for their full duration, so a
/// template path has a single writer at any time.
pub struct LocalTemplateStorage {
    root: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LocalTemplateStorage {
    pub const NAME: &'static str = "local";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: DashMap::new(),
        }
    }

    fn template_dir(&self, template: &ServiceTemplate) -> PathBuf {
        self.root.join(&template.prefix).join(&template.name)
    }

    fn lock_of(&self, template: &ServiceTemplate) -> Arc<Mutex<()>> {
        self.locks
            .entry(template.relative_path())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    fn io_error(template: &ServiceTemplate, source: std::io::Error) -> TemplateError {
        TemplateError::Io {
            template: template.to_string(),
            source,
        }
    }
}

impl TemplateStorage for LocalTemplateStorage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn has_template(&self, template: &ServiceTemplate) -> bool {
        self.template_dir(template).is_dir()
    }

    fn create_template(&self, template: &ServiceTemplate) -> Result<bool, TemplateError> {
        let dir = self.template_dir(template);
        if dir.is_dir() {
            return Ok(false);
        }
        std::fs::create_dir_all(&dir).map_err(|e| Self::io_error(template, e))?;
        Ok(true)
    }

    fn delete_template(&self, template: &ServiceTemplate) -> Result<bool, TemplateError> {
        let dir = self.template_dir(template);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::io_error(template, e)),
        }
    }

    fn copy_template_into(
        &self,
        template: &ServiceTemplate,
        target_dir: &Path,
    ) -> Result<(), TemplateError> {
        let lock = self.lock_of(template);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let source = self.template_dir(template);
        if !source.is_dir() {
            return Err(TemplateError::TemplateMissing(template.to_string()));
        }
        copy_tree(&source, target_dir).map_err(|e| Self::io_error(template, e))
    }

    fn deploy_into_template(
        &self,
        template: &ServiceTemplate,
        source_dir: &Path,
        files: &[PathBuf],
    ) -> Result<usize, TemplateError> {
        let lock = self.lock_of(template);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let target = self.template_dir(template);
        let mut written = 0usize;
        for file in files {
            let from = source_dir.join(file);
            if !from.is_file() {
                continue;
            }
            let to = target.join(file);
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent).map_err(|e| Self::io_error(template, e))?;
            }
            std::fs::copy(&from, &to).map_err(|e| Self::io_error(template, e))?;
            written += 1;
        }
        Ok(written)
    }

    fn templates(&self) -> Vec<ServiceTemplate> {
        let mut templates = Vec::new();
        let Ok(prefixes) = std::fs::read_dir(&self.root) else {
            return templates;
        };
        for prefix in prefixes.flatten().filter(|e| e.path().is_dir()) {
            let Ok(names) = std::fs::read_dir(prefix.path()) else {
                continue;
            };
            for name in names.flatten().filter(|e| e.path().is_dir()) {
                templates.push(ServiceTemplate {
                    storage: Self::NAME.to_string(),
                    prefix: prefix.file_name().to_string_lossy().to_string(),
                    name: name.file_name().to_string_lossy().to_string(),
                });
            }
        }
        templates.sort_by_key(|t| t.relative_path());
        templates
    }
}

fn copy_tree(source: &Path, target: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(target)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let from = entry.path();
        let to = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

/// Collects all file paths in `dir`, relative to it.
pub fn collect_relative_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    fn walk(root: &Path, current: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(current)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                walk(root, &path, out)?;
            } else if let Ok(relative) = path.strip_prefix(root) {
                out.push(relative.to_path_buf());
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    if dir.is_dir() {
        walk(dir, dir, &mut files)?;
        files.sort();
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> ServiceTemplate {
        ServiceTemplate::local("lobby", "default")
    }

    #[test]
    fn test_create_and_list() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = LocalTemplateStorage::new(dir.path());

        assert!(storage.create_template(&template()).unwrap());
        assert!(!storage.create_template(&template()).unwrap());
        assert!(storage.has_template(&template()));
        assert_eq!(storage.templates(), vec![template()]);
    }

    #[test]
    fn test_copy_template_into_service_dir() {
        let root = tempfile::TempDir::new().unwrap();
        let storage = LocalTemplateStorage::new(root.path());
        storage.create_template(&template()).unwrap();

        let template_dir = root.path().join("lobby/default");
        std::fs::create_dir_all(template_dir.join("plugins")).unwrap();
        std::fs::write(template_dir.join("server.properties"), b"port=25565").unwrap();
        std::fs::write(template_dir.join("plugins/hub.jar"), b"jar").unwrap();

        let service_dir = tempfile::TempDir::new().unwrap();
        storage
            .copy_template_into(&template(), service_dir.path())
            .unwrap();

        assert_eq!(
            std::fs::read(service_dir.path().join("server.properties")).unwrap(),
            b"port=25565"
        );
        assert_eq!(
            std::fs::read(service_dir.path().join("plugins/hub.jar")).unwrap(),
            b"jar"
        );
    }

    #[test]
    fn test_copy_missing_template_fails() {
        let root = tempfile::TempDir::new().unwrap();
        let storage = LocalTemplateStorage::new(root.path());
        let service_dir = tempfile::TempDir::new().unwrap();

        let result = storage.copy_template_into(&template(), service_dir.path());
        assert!(matches!(result, Err(TemplateError::TemplateMissing(_))));
    }

    #[test]
    fn test_deploy_writes_selected_files() {
        let root = tempfile::TempDir::new().unwrap();
        let storage = LocalTemplateStorage::new(root.path());
        storage.create_template(&template()).unwrap();

        let service_dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(service_dir.path().join("world")).unwrap();
        std::fs::write(service_dir.path().join("world/level.dat"), b"level").unwrap();
        std::fs::write(service_dir.path().join("skip.log"), b"log").unwrap();

        let written = storage
            .deploy_into_template(
                &template(),
                service_dir.path(),
                &[PathBuf::from("world/level.dat")],
            )
            .unwrap();

        assert_eq!(written, 1);
        assert_eq!(
            std::fs::read(root.path().join("lobby/default/world/level.dat")).unwrap(),
            b"level"
        );
        assert!(!root.path().join("lobby/default/skip.log").exists());
    }

    #[test]
    fn test_collect_relative_files() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("top.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("a/b/deep.txt"), b"y").unwrap();

        let files = collect_relative_files(dir.path()).unwrap();
        assert_eq!(
            files,
            vec![PathBuf::from("a/b/deep.txt"), PathBuf::from("top.txt")]
        );
    }
}
