//! Loader for the drivers compiled into this build.

use super::{Connector, DriverDescriptor, DriverLoader};
use crate::Result;
use crate::config::DriverConfig;
use crate::error::ContextError;
use crate::monitor::{ProgressMonitor, cancellable};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// Driver loader for the built-in `sqlx` backends.
///
/// The drivers themselves need no external files. Libraries declared in
/// [`DriverConfig::libraries`] (extensions, client certificates bundles...)
/// must exist in `library_dir`; "downloading" copies them from the offline
/// `mirror_dir`.
#[derive(Debug, Clone)]
pub struct NativeDriverLoader {
    descriptor: DriverDescriptor,
    config: DriverConfig,
}

impl NativeDriverLoader {
    /// Creates a loader for a built-in driver.
    pub fn new(descriptor: DriverDescriptor, config: DriverConfig) -> Self {
        Self { descriptor, config }
    }

    /// Declared libraries not present in the library directory.
    pub fn missing_libraries(&self) -> Vec<PathBuf> {
        let Some(dir) = &self.config.library_dir else {
            return Vec::new();
        };

        self.config
            .libraries
            .iter()
            .map(|name| dir.join(name))
            .filter(|path| !path.is_file())
            .collect()
    }
}

#[async_trait]
impl DriverLoader for NativeDriverLoader {
    fn descriptor(&self) -> &DriverDescriptor {
        &self.descriptor
    }

    fn needs_external_dependencies(&self) -> bool {
        !self.missing_libraries().is_empty()
    }

    async fn download_driver_libraries(&self, monitor: &ProgressMonitor) -> Result<Vec<PathBuf>> {
        let missing = self.missing_libraries();
        if missing.is_empty() {
            return Ok(Vec::new());
        }

        let mirror = self.config.mirror_dir.as_ref().ok_or_else(|| {
            ContextError::driver_load(
                &self.descriptor.name,
                "required libraries are missing and no library mirror is configured",
            )
        })?;

        if let Some(dir) = &self.config.library_dir {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| ContextError::Io {
                    context: format!("Failed to create library directory {}", dir.display()),
                    source: e,
                })?;
        }

        let mut installed = Vec::with_capacity(missing.len());
        for target in missing {
            let Some(file_name) = target.file_name() else {
                continue;
            };
            let source = mirror.join(file_name);
            if !source.is_file() {
                return Err(ContextError::driver_load(
                    &self.descriptor.name,
                    format!(
                        "library '{}' not found in mirror {}",
                        file_name.to_string_lossy(),
                        mirror.display()
                    ),
                ));
            }

            tracing::info!(
                "Installing driver library {} for {}",
                file_name.to_string_lossy(),
                self.descriptor.name
            );
            cancellable(monitor, "driver library download", async {
                tokio::fs::copy(&source, &target)
                    .await
                    .map_err(|e| ContextError::Io {
                        context: format!("Failed to copy {}", source.display()),
                        source: e,
                    })
            })
            .await?;
            installed.push(target);
        }

        Ok(installed)
    }

    async fn load_driver(&self, monitor: &ProgressMonitor) -> Result<Arc<dyn Connector>> {
        if monitor.is_cancelled() {
            return Err(ContextError::cancelled("driver load"));
        }

        if !self.descriptor.compiled_in {
            let hint = match &self.descriptor.feature {
                Some(feature) => format!("not compiled in; rebuild with --features {}", feature),
                None => "not compiled in".to_string(),
            };
            return Err(ContextError::driver_load(&self.descriptor.name, hint));
        }

        let missing = self.missing_libraries();
        if !missing.is_empty() {
            let names: Vec<String> = missing
                .iter()
                .filter_map(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .collect();
            return Err(ContextError::driver_load(
                &self.descriptor.name,
                format!("missing required libraries: {}", names.join(", ")),
            ));
        }

        connector_for(&self.descriptor)
    }
}

#[cfg(any(feature = "postgresql", feature = "mysql", feature = "sqlite"))]
fn connector_for(descriptor: &DriverDescriptor) -> Result<Arc<dyn Connector>> {
    tracing::debug!("Loaded built-in driver {}", descriptor.name);
    Ok(Arc::new(super::SqlxConnector::new(descriptor.dialect)))
}

#[cfg(not(any(feature = "postgresql", feature = "mysql", feature = "sqlite")))]
fn connector_for(descriptor: &DriverDescriptor) -> Result<Arc<dyn Connector>> {
    Err(ContextError::driver_load(
        &descriptor.name,
        "no database drivers compiled into this build",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SqlDialect;
    use crate::error::ErrorKind;

    fn descriptor(compiled_in: bool) -> DriverDescriptor {
        DriverDescriptor {
            name: "sqlite".to_string(),
            schemes: vec!["sqlite".to_string()],
            dialect: SqlDialect::Sqlite,
            compiled_in,
            feature: Some("sqlite".to_string()),
        }
    }

    #[tokio::test]
    async fn test_driver_not_compiled_in() {
        let loader = NativeDriverLoader::new(descriptor(false), DriverConfig::default());
        let err = loader
            .load_driver(&ProgressMonitor::new())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::DriverLoad);
        assert!(err.to_string().contains("--features sqlite"));
    }

    #[tokio::test]
    async fn test_missing_libraries_block_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = DriverConfig {
            libraries: vec!["mod_spatialite.so".to_string()],
            library_dir: Some(dir.path().join("lib")),
            mirror_dir: None,
            auto_download: false,
        };
        let loader = NativeDriverLoader::new(descriptor(true), config);

        assert!(loader.needs_external_dependencies());
        let err = loader
            .load_driver(&ProgressMonitor::new())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::DriverLoad);
        assert!(err.to_string().contains("mod_spatialite.so"));

        let err = loader
            .download_driver_libraries(&ProgressMonitor::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DriverLoad);
    }

    #[tokio::test]
    async fn test_download_from_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = dir.path().join("mirror");
        tokio::fs::create_dir_all(&mirror).await.unwrap();
        tokio::fs::write(mirror.join("ext.so"), b"\x7fELF").await.unwrap();

        let config = DriverConfig {
            libraries: vec!["ext.so".to_string()],
            library_dir: Some(dir.path().join("lib")),
            mirror_dir: Some(mirror),
            auto_download: true,
        };
        let loader = NativeDriverLoader::new(descriptor(true), config);
        assert!(loader.needs_external_dependencies());

        let installed = loader
            .download_driver_libraries(&ProgressMonitor::new())
            .await
            .unwrap();
        assert_eq!(installed.len(), 1);
        assert!(installed[0].is_file());
        assert!(!loader.needs_external_dependencies());

        let again = loader
            .download_driver_libraries(&ProgressMonitor::new())
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_library_absent_from_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let config = DriverConfig {
            libraries: vec!["absent.so".to_string()],
            library_dir: Some(dir.path().join("lib")),
            mirror_dir: Some(dir.path().to_path_buf()),
            auto_download: true,
        };
        let loader = NativeDriverLoader::new(descriptor(true), config);
        let err = loader
            .download_driver_libraries(&ProgressMonitor::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DriverLoad);
        assert!(err.to_string().contains("absent.so"));
    }
}
