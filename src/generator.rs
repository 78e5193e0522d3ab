//! Suite processing and catalog export.
//!
//! Ties the whole pipeline together: per (suite, archive component,
//! architecture) it loads the package index, prepares the icon finder,
//! fans extraction out over the scheduler, applies all cache writes on
//! the master, and finally concatenates the cached per-component YAML
//! into the compressed catalog, hints and icon-tarball outputs.

use flate2::write::GzEncoder;
use flate2::Compression;
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::archive::contents::ContentsIndex;
use crate::archive::index::read_packages_index;
use crate::archive::ReadError;
use crate::cache::{Cache, CacheError};
use crate::config::{Config, ConfigError, SuiteConfig};
use crate::extractor::Extractor;
use crate::icons::finder::{ContentsIconFinder, IconFinder, NoopIconFinder};
use crate::icons::theme::Theme;
use crate::icons::IconHandler;
use crate::model::{Package, IconSize};
use crate::scheduler::{JobStatus, Scheduler, SchedulerError};

#[derive(Error, Debug)]
pub enum GeneratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not serialize output: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unrecoverable worker error: {0}")]
    WorkerPool(String),
}

impl From<SchedulerError> for GeneratorError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::Pool(message) => GeneratorError::WorkerPool(message),
            SchedulerError::Cache(e) => GeneratorError::Cache(e),
        }
    }
}

/// Catalog stream header document.
#[derive(Debug, Serialize)]
struct CatalogHeader {
    #[serde(rename = "File")]
    file: &'static str,
    #[serde(rename = "Version")]
    version: &'static str,
    #[serde(rename = "Time")]
    time: String,
    #[serde(rename = "Origin")]
    origin: String,
    #[serde(rename = "MediaBaseUrl")]
    media_base_url: String,
    #[serde(rename = "Priority", skip_serializing_if = "Option::is_none")]
    priority: Option<i64>,
}

/// The DEP-11 metadata generator.
pub struct Generator {
    config: Config,
    cache: Arc<Cache>,
}

impl Generator {
    /// Loads the configuration from `confdir` and opens the cache.
    pub fn new(confdir: &Path) -> Result<Self, GeneratorError> {
        let config = Config::load(confdir)?;
        std::fs::create_dir_all(&config.export_dir)?;
        let cache = Arc::new(Cache::open(&config.cache_dir, &config.media_dir())?);
        Ok(Generator { config, cache })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Extracts new metadata for one suite and writes its catalog files.
    pub async fn process_suite(
        &self,
        suite_name: &str,
        scheduler: &Scheduler,
    ) -> Result<(), GeneratorError> {
        let suite = self.config.suite(suite_name)?.clone();

        for component in &suite.components {
            let mut all_component_pkgs: Vec<Package> = Vec::new();

            for arch in &suite.architectures {
                let packages = read_packages_index(
                    &self.config.archive_root,
                    suite_name,
                    component,
                    arch,
                    true,
                )?;

                let finder = self.build_icon_finder(suite_name, &suite, component, arch)?;
                let extractor = Arc::new(Extractor::new(
                    suite_name,
                    component.as_str(),
                    &self.config.archive_root,
                    self.config.media_dir(),
                    Arc::clone(&self.cache),
                    IconHandler::new(self.config.icon_sizes.clone(), finder),
                ));

                let mut todo: Vec<Package> = Vec::new();
                for pkg in packages.values() {
                    if self.cache.package_exists(&pkg.pkid())? {
                        continue;
                    }
                    if !self.config.archive_root.join(&pkg.filename).is_file() {
                        warn!(package = %pkg.name, filename = %pkg.filename, "package not found");
                        continue;
                    }
                    todo.push(pkg.clone());
                }

                info!(
                    count = todo.len(),
                    suite = suite_name,
                    component = component.as_str(),
                    arch = arch.as_str(),
                    "processing packages"
                );

                let cache = Arc::clone(&self.cache);
                let stats = scheduler
                    .run(extractor, todo, &mut |result| {
                        match result.status {
                            JobStatus::Ok => info!("{}", result.message),
                            _ => warn!("{}", result.message),
                        }
                        cache.put_components(&result.package.pkid(), &result.components)
                    })
                    .await?;
                info!(
                    processed = stats.processed,
                    exceptions = stats.exceptions,
                    components = stats.components_found,
                    "extraction finished"
                );

                self.write_catalog(suite_name, &suite, component, arch, &packages)?;
                all_component_pkgs.extend(packages.into_values());
            }

            self.make_icon_tars(suite_name, component, &all_component_pkgs)?;
            info!(
                suite = suite_name,
                component = component.as_str(),
                "completed metadata extraction"
            );
        }

        Ok(())
    }

    /// Builds the archive-wide icon finder for one
    /// (suite, component, architecture) pass.
    fn build_icon_finder(
        &self,
        suite_name: &str,
        suite: &SuiteConfig,
        component: &str,
        arch: &str,
    ) -> Result<Arc<dyn IconFinder>, GeneratorError> {
        let mut contents = ContentsIndex::new(&self.config.archive_root);

        // the base suite's main component can hold icons for us
        if let Some(base_suite) = &suite.base_suite {
            self.load_contents_lenient(&mut contents, base_suite, "main", arch);
        }

        // the component we scan is required; its absence fails the pass
        let packages =
            read_packages_index(&self.config.archive_root, suite_name, component, arch, false)?;
        contents.load(suite_name, component, arch, &packages)?;

        // "main" usually holds the icon themes
        if component != "main" {
            self.load_contents_lenient(&mut contents, suite_name, "main", arch);
        }
        // Ubuntu splits default iconsets between main and universe
        if component != "universe" {
            let universe_contents = self
                .config
                .archive_root
                .join("dists")
                .join(suite_name)
                .join("universe")
                .join(format!("Contents-{arch}.gz"));
            if universe_contents.is_file() {
                self.load_contents_lenient(&mut contents, suite_name, "universe", arch);
            }
        }

        if contents.is_empty() {
            warn!(
                suite = suite_name,
                component = component,
                "contents index has no icon entries, archive-wide lookup disabled"
            );
            return Ok(Arc::new(NoopIconFinder));
        }

        // themes in lookup priority order: hicolor first because apps
        // install their upstream icons there, then the configured theme,
        // then the Adwaita/breeze defaults for GNOME and KDE apps
        let mut theme_names: Vec<String> = vec!["hicolor".to_string()];
        if let Some(theme) = &suite.icon_theme {
            theme_names.push(theme.clone());
        }
        theme_names.push("Adwaita".to_string());
        theme_names.push("breeze".to_string());
        let mut seen = HashSet::new();
        theme_names.retain(|name| seen.insert(name.clone()));

        let mut themes = Vec::new();
        for name in theme_names {
            let index_path = format!("usr/share/icons/{name}/index.theme");
            match contents.deb_path_for(&index_path) {
                Some(deb_path) => match Theme::from_package(&name, &deb_path) {
                    Ok(theme) => themes.push(theme),
                    Err(e) => {
                        warn!(theme = %name, error = %e, "could not load theme index");
                    }
                },
                None => {
                    info!(theme = %name, "removing seeded theme name: theme not found");
                }
            }
        }

        Ok(Arc::new(ContentsIconFinder::new(contents, themes)))
    }

    fn load_contents_lenient(
        &self,
        contents: &mut ContentsIndex,
        suite: &str,
        component: &str,
        arch: &str,
    ) {
        let packages =
            match read_packages_index(&self.config.archive_root, suite, component, arch, false) {
                Ok(packages) => packages,
                Err(e) => {
                    warn!(suite, component, arch, error = %e, "skipping auxiliary package index");
                    return;
                }
            };
        if let Err(e) = contents.load(suite, component, arch, &packages) {
            warn!(suite, component, arch, error = %e, "skipping auxiliary contents index");
        }
    }

    /// Writes the compressed catalog and hints streams for one
    /// (suite, component, architecture), in package-index order.
    fn write_catalog(
        &self,
        suite_name: &str,
        suite: &SuiteConfig,
        component: &str,
        arch: &str,
        packages: &IndexMap<String, Package>,
    ) -> Result<(), GeneratorError> {
        let data_dir = self
            .config
            .export_dir
            .join("data")
            .join(suite_name)
            .join(component);
        let hints_dir = self
            .config
            .export_dir
            .join("hints")
            .join(suite_name)
            .join(component);
        std::fs::create_dir_all(&data_dir)?;
        std::fs::create_dir_all(&hints_dir)?;

        let data_path = data_dir.join(format!("Components-{arch}.yml.gz"));
        let hints_path = hints_dir.join(format!("DEP11Hints_{arch}.yml.gz"));

        let header = CatalogHeader {
            file: "DEP-11",
            version: "0.8",
            time: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            origin: format!("{}-{}-{}", self.config.repo_name, suite_name, component)
                .to_lowercase(),
            media_base_url: self.config.media_base_url.clone(),
            priority: suite.data_priority,
        };

        let tmp_data = with_new_suffix(&data_path);
        let tmp_hints = with_new_suffix(&hints_path);
        {
            let mut data_out = GzEncoder::new(
                std::fs::File::create(&tmp_data)?,
                Compression::default(),
            );
            let mut hints_out = GzEncoder::new(
                std::fs::File::create(&tmp_hints)?,
                Compression::default(),
            );

            data_out.write_all(b"---\n")?;
            data_out.write_all(serde_yaml::to_string(&header)?.as_bytes())?;

            for pkg in packages.values() {
                let pkid = pkg.pkid();
                if let Some(yaml) = self.cache.get_components_yaml(&pkid)? {
                    data_out.write_all(yaml.as_bytes())?;
                }
                if let Some(hints) = self.cache.get_hints(&pkid)? {
                    hints_out.write_all(hints.as_bytes())?;
                }
            }

            data_out.finish()?;
            hints_out.finish()?;
        }
        safe_move_file(&tmp_data, &data_path)?;
        safe_move_file(&tmp_hints, &hints_path)?;

        info!(path = %data_path.display(), "wrote component data");
        Ok(())
    }

    /// Creates one `icons-<WxH>.tar.gz` per configured size, holding every
    /// unique cached icon of the component, flat, deduplicated by name.
    fn make_icon_tars(
        &self,
        suite_name: &str,
        component: &str,
        packages: &[Package],
    ) -> Result<(), GeneratorError> {
        let tar_dir = self
            .config
            .export_dir
            .join("data")
            .join(suite_name)
            .join(component);
        std::fs::create_dir_all(&tar_dir)?;
        let media_dir = self.config.media_dir();

        for size in &self.config.icon_sizes {
            let tar_path = tar_dir.join(format!("icons-{size}.tar.gz"));
            let tmp_path = with_new_suffix(&tar_path);
            let encoder = GzEncoder::new(std::fs::File::create(&tmp_path)?, Compression::default());
            let mut builder = tar::Builder::new(encoder);
            let mut names_seen: HashSet<String> = HashSet::new();

            for pkg in packages {
                let Some(gids) = self.cache.get_gids_for_package(&pkg.pkid())? else {
                    continue;
                };
                for gid in gids {
                    let icon_dir = media_dir
                        .join(component)
                        .join(&gid)
                        .join("icons")
                        .join(size.to_string());
                    self.append_icons(&mut builder, &icon_dir, *size, &mut names_seen)?;
                }
            }

            builder.into_inner()?.finish()?;
            safe_move_file(&tmp_path, &tar_path)?;
            info!(path = %tar_path.display(), "wrote icon tarball");
        }
        Ok(())
    }

    fn append_icons(
        &self,
        builder: &mut tar::Builder<GzEncoder<std::fs::File>>,
        icon_dir: &Path,
        size: IconSize,
        names_seen: &mut HashSet<String>,
    ) -> Result<(), GeneratorError> {
        let entries = match std::fs::read_dir(icon_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("png") {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };
            if !names_seen.insert(format!("{size}/{name}")) {
                continue;
            }
            builder.append_path_with_name(&path, &name)?;
        }
        Ok(())
    }

    /// Removes cache entries for packages that left the archive, then
    /// drops orphaned components and their media.
    pub fn expire_cache(&self) -> Result<(), GeneratorError> {
        let mut valid: HashSet<String> = HashSet::new();
        for (suite_name, suite) in &self.config.suites {
            for component in &suite.components {
                for arch in &suite.architectures {
                    let packages = read_packages_index(
                        &self.config.archive_root,
                        suite_name,
                        component,
                        arch,
                        false,
                    )?;
                    valid.extend(packages.values().map(Package::pkid));
                }
            }
        }

        self.cache.expire(&valid)?;
        Ok(())
    }

    /// Forgets all processed packages of one suite so the next run scans
    /// them again.
    pub fn remove_processed(&self, suite_name: &str) -> Result<(), GeneratorError> {
        let suite = self.config.suite(suite_name)?.clone();
        for component in &suite.components {
            for arch in &suite.architectures {
                let packages = read_packages_index(
                    &self.config.archive_root,
                    suite_name,
                    component,
                    arch,
                    false,
                )?;
                for pkg in packages.values() {
                    let pkid = pkg.pkid();
                    // ignore-markers carry no interesting state, keep them
                    if self.cache.is_ignored(&pkid)? {
                        continue;
                    }
                    if !self.cache.package_exists(&pkid)? {
                        continue;
                    }
                    self.cache.remove_package(&pkid)?;
                }
            }
        }
        self.cache.sweep_orphans()?;
        Ok(())
    }

    /// Drops a single package and its data from the cache.
    pub fn forget_package(&self, pkid: &str) -> Result<bool, GeneratorError> {
        if !self.cache.package_exists(pkid)? {
            return Ok(false);
        }
        self.cache.remove_package(pkid)?;
        self.cache.sweep_orphans()?;
        Ok(true)
    }
}

fn with_new_suffix(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".new");
    PathBuf::from(os)
}

/// Replaces `to` with `from`, dropping any previous version first.
fn safe_move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if !from.is_file() {
        return Ok(());
    }
    if to.is_file() {
        std::fs::remove_file(to)?;
    }
    std::fs::rename(from, to)
}
