//! Metadata cache: an embedded key/value store plus the media pool.
//!
//! Three tables hold package state, per-package hints and per-component
//! metadata documents. The component table is content-addressed by global
//! id; a metadata entry lives as long as at least one package references
//! it, and its media subtree dies with it. The backing store allows one
//! writer at a time: workers only read, the master applies all writes.

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::model::Component;

const PACKAGES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("packages");
const HINTS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("hints");
const METADATA_TABLE: TableDefinition<&str, &str> = TableDefinition::new("metadata");

/// Package entry marking a package that produced no components at all.
const MARKER_IGNORE: &str = "ignore";
/// Package entry marking a package that produced only hints.
const MARKER_SEEN: &str = "seen";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache database error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("cache transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("cache table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("cache storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("cache commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("could not serialize component metadata: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

/// The on-disk cache.
pub struct Cache {
    db: Database,
    media_dir: PathBuf,
}

impl Cache {
    /// Opens (or creates) the cache database and media pool directory.
    pub fn open(cache_dir: &Path, media_dir: &Path) -> Result<Self, CacheError> {
        std::fs::create_dir_all(cache_dir)?;
        std::fs::create_dir_all(media_dir)?;
        let db = Database::create(cache_dir.join("metadata-cache.redb"))?;

        // make sure all tables exist so later read transactions never fail
        let txn = db.begin_write()?;
        {
            txn.open_table(PACKAGES_TABLE)?;
            txn.open_table(HINTS_TABLE)?;
            txn.open_table(METADATA_TABLE)?;
        }
        txn.commit()?;

        Ok(Cache {
            db,
            media_dir: media_dir.to_path_buf(),
        })
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    /// Stores the extraction result for one package.
    ///
    /// Non-ignored components are serialized into the metadata table under
    /// their global id (existing entries are reused); the package entry
    /// becomes the newline-joined gid list, or a marker when nothing
    /// usable was produced. All component hints are concatenated into the
    /// hints table.
    pub fn put_components(&self, pkid: &str, cpts: &[Component]) -> Result<(), CacheError> {
        if cpts.is_empty() {
            return self.set_package_ignore(pkid);
        }

        let mut gids: Vec<String> = Vec::new();
        let mut new_metadata: Vec<(String, String)> = Vec::new();
        let mut hints_yaml = String::new();

        for cpt in cpts {
            if let Some(doc) = cpt.to_yaml_doc()? {
                if let Some(gid) = cpt.global_id() {
                    if self.get_metadata(&gid)?.is_none() {
                        new_metadata.push((gid.clone(), doc));
                    }
                    gids.push(gid);
                }
            }
            if let Some(hint_doc) = cpt.hints_yaml_doc()? {
                hints_yaml.push_str(&hint_doc);
            }
        }

        let txn = self.db.begin_write()?;
        {
            let mut metadata = txn.open_table(METADATA_TABLE)?;
            for (gid, doc) in &new_metadata {
                metadata.insert(gid.as_str(), doc.as_str())?;
            }
            let mut packages = txn.open_table(PACKAGES_TABLE)?;
            if gids.is_empty() {
                let marker = if hints_yaml.is_empty() {
                    MARKER_IGNORE
                } else {
                    MARKER_SEEN
                };
                packages.insert(pkid, marker)?;
            } else {
                packages.insert(pkid, gids.join("\n").as_str())?;
            }
            if !hints_yaml.is_empty() {
                let mut hints = txn.open_table(HINTS_TABLE)?;
                hints.insert(pkid, hints_yaml.as_str())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Concatenated YAML documents of all components of a package.
    pub fn get_components_yaml(&self, pkid: &str) -> Result<Option<String>, CacheError> {
        let Some(gids) = self.get_gids_for_package(pkid)? else {
            return Ok(None);
        };
        let mut data = String::new();
        for gid in gids {
            if let Some(doc) = self.get_metadata(&gid)? {
                data.push_str(&doc);
            }
        }
        if data.is_empty() {
            Ok(None)
        } else {
            Ok(Some(data))
        }
    }

    /// The gid list referenced by a package entry; `None` for unknown,
    /// ignored or seen-only packages.
    pub fn get_gids_for_package(&self, pkid: &str) -> Result<Option<Vec<String>>, CacheError> {
        let txn = self.db.begin_read()?;
        let packages = txn.open_table(PACKAGES_TABLE)?;
        let Some(value) = packages.get(pkid)? else {
            return Ok(None);
        };
        let value = value.value();
        if value == MARKER_IGNORE || value == MARKER_SEEN {
            return Ok(None);
        }
        Ok(Some(value.split('\n').map(str::to_string).collect()))
    }

    pub fn get_metadata(&self, gid: &str) -> Result<Option<String>, CacheError> {
        let txn = self.db.begin_read()?;
        let metadata = txn.open_table(METADATA_TABLE)?;
        Ok(metadata.get(gid)?.map(|guard| guard.value().to_string()))
    }

    pub fn get_hints(&self, pkid: &str) -> Result<Option<String>, CacheError> {
        let txn = self.db.begin_read()?;
        let hints = txn.open_table(HINTS_TABLE)?;
        Ok(hints.get(pkid)?.map(|guard| guard.value().to_string()))
    }

    pub fn package_exists(&self, pkid: &str) -> Result<bool, CacheError> {
        let txn = self.db.begin_read()?;
        let packages = txn.open_table(PACKAGES_TABLE)?;
        Ok(packages.get(pkid)?.is_some())
    }

    pub fn is_ignored(&self, pkid: &str) -> Result<bool, CacheError> {
        let txn = self.db.begin_read()?;
        let packages = txn.open_table(PACKAGES_TABLE)?;
        Ok(packages
            .get(pkid)?
            .map(|guard| guard.value() == MARKER_IGNORE)
            .unwrap_or(false))
    }

    pub fn set_package_ignore(&self, pkid: &str) -> Result<(), CacheError> {
        self.set_package_marker(pkid, MARKER_IGNORE)
    }

    pub fn set_package_seen(&self, pkid: &str) -> Result<(), CacheError> {
        self.set_package_marker(pkid, MARKER_SEEN)
    }

    fn set_package_marker(&self, pkid: &str, marker: &str) -> Result<(), CacheError> {
        let txn = self.db.begin_write()?;
        {
            let mut packages = txn.open_table(PACKAGES_TABLE)?;
            packages.insert(pkid, marker)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Drops a package entry and its hints. Orphaned components are swept
    /// later by [`Cache::expire`] or [`Cache::sweep_orphans`].
    pub fn remove_package(&self, pkid: &str) -> Result<(), CacheError> {
        debug!(pkid, "removing package from cache");
        let txn = self.db.begin_write()?;
        {
            let mut packages = txn.open_table(PACKAGES_TABLE)?;
            packages.remove(pkid)?;
            let mut hints = txn.open_table(HINTS_TABLE)?;
            hints.remove(pkid)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// All package ids currently present in the cache.
    pub fn all_pkids(&self) -> Result<Vec<String>, CacheError> {
        let txn = self.db.begin_read()?;
        let packages = txn.open_table(PACKAGES_TABLE)?;
        let mut pkids = Vec::new();
        for item in packages.iter()? {
            let (key, _) = item?;
            pkids.push(key.value().to_string());
        }
        Ok(pkids)
    }

    /// Removes every package not in `valid_pkids`, then sweeps orphaned
    /// component metadata and media. Idempotent.
    pub fn expire(&self, valid_pkids: &HashSet<String>) -> Result<(), CacheError> {
        let stale: Vec<String> = self
            .all_pkids()?
            .into_iter()
            .filter(|pkid| !valid_pkids.contains(pkid))
            .collect();
        for pkid in &stale {
            self.remove_package(pkid)?;
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "expired packages no longer in the archive");
        }
        self.sweep_orphans()
    }

    /// Deletes metadata entries referenced by no package, together with
    /// their media subtrees.
    pub fn sweep_orphans(&self) -> Result<(), CacheError> {
        let mut referenced: HashSet<String> = HashSet::new();
        let mut all_gids: Vec<String> = Vec::new();
        {
            let txn = self.db.begin_read()?;
            let packages = txn.open_table(PACKAGES_TABLE)?;
            for item in packages.iter()? {
                let (_, value) = item?;
                let value = value.value();
                if value == MARKER_IGNORE || value == MARKER_SEEN {
                    continue;
                }
                for gid in value.split('\n') {
                    referenced.insert(gid.to_string());
                }
            }
            let metadata = txn.open_table(METADATA_TABLE)?;
            for item in metadata.iter()? {
                let (key, _) = item?;
                all_gids.push(key.value().to_string());
            }
        }

        let orphans: Vec<String> = all_gids
            .into_iter()
            .filter(|gid| !referenced.contains(gid))
            .collect();
        if orphans.is_empty() {
            return Ok(());
        }

        let txn = self.db.begin_write()?;
        {
            let mut metadata = txn.open_table(METADATA_TABLE)?;
            for gid in &orphans {
                metadata.remove(gid.as_str())?;
            }
        }
        txn.commit()?;

        for gid in &orphans {
            self.remove_media_for_gid(gid)?;
        }
        info!(count = orphans.len(), "swept orphaned components");
        Ok(())
    }

    /// Removes the media subtree of a gid in every archive component,
    /// pruning up to two levels of empty ancestor directories.
    fn remove_media_for_gid(&self, gid: &str) -> Result<(), CacheError> {
        let component_dirs = match std::fs::read_dir(&self.media_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        for entry in component_dirs.flatten() {
            let gid_dir = entry.path().join(gid);
            if !gid_dir.exists() {
                continue;
            }
            std::fs::remove_dir_all(&gid_dir)?;
            debug!(path = %gid_dir.display(), "removed media subtree");

            let mut parent = gid_dir.parent().map(Path::to_path_buf);
            for _ in 0..2 {
                let Some(dir) = parent else { break };
                if dir == entry.path() {
                    break;
                }
                match std::fs::remove_dir(&dir) {
                    Ok(()) => {
                        parent = dir.parent().map(Path::to_path_buf);
                    }
                    // not empty, stop pruning
                    Err(_) => break,
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hints::Hint;
    use crate::model::{Component, ComponentKind, Package};

    fn test_package(name: &str, version: &str) -> Package {
        Package {
            name: name.to_string(),
            version: version.to_string(),
            arch: "amd64".to_string(),
            filename: format!("pool/main/{name}_{version}_amd64.deb"),
            maintainer: None,
            description: Default::default(),
        }
    }

    fn test_component(pkg: &Package, cid: &str) -> Component {
        let mut cpt = Component::new(pkg.clone());
        cpt.cid = Some(cid.to_string());
        cpt.kind = Some(ComponentKind::DesktopApp);
        cpt.name.insert("C".to_string(), "Thing".to_string());
        cpt.summary.insert("C".to_string(), "Does things".to_string());
        cpt.set_srcdata_checksum(&["<component>data</component>"]);
        cpt
    }

    fn open_cache(dir: &Path) -> Cache {
        Cache::open(&dir.join("cache"), &dir.join("media")).unwrap()
    }

    #[test]
    fn put_and_get_components_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path());

        let pkg = test_package("foo", "1.0");
        let cpt = test_component(&pkg, "org.example.Foo");
        let gid = cpt.global_id().unwrap();
        let pkid = pkg.pkid();

        cache.put_components(&pkid, &[cpt]).unwrap();

        assert!(cache.package_exists(&pkid).unwrap());
        assert!(!cache.is_ignored(&pkid).unwrap());
        assert_eq!(
            cache.get_gids_for_package(&pkid).unwrap(),
            Some(vec![gid.clone()])
        );
        let yaml = cache.get_components_yaml(&pkid).unwrap().unwrap();
        assert!(yaml.contains("ID: org.example.Foo"));
        assert!(cache.get_metadata(&gid).unwrap().is_some());
    }

    #[test]
    fn empty_component_lists_mark_packages_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path());

        cache.put_components("foo/1.0/amd64", &[]).unwrap();
        assert!(cache.package_exists("foo/1.0/amd64").unwrap());
        assert!(cache.is_ignored("foo/1.0/amd64").unwrap());
        assert!(cache
            .get_components_yaml("foo/1.0/amd64")
            .unwrap()
            .is_none());
    }

    #[test]
    fn hint_only_packages_are_marked_seen() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path());

        let pkg = test_package("foo", "1.0");
        let mut cpt = test_component(&pkg, "org.example.Foo");
        cpt.add_hint(Hint::tag_only("metainfo-duplicate-id"));
        assert!(cpt.is_ignored());

        cache.put_components(&pkg.pkid(), &[cpt]).unwrap();
        assert!(cache.package_exists(&pkg.pkid()).unwrap());
        assert!(!cache.is_ignored(&pkg.pkid()).unwrap());
        assert!(cache.get_gids_for_package(&pkg.pkid()).unwrap().is_none());
        let hints = cache.get_hints(&pkg.pkid()).unwrap().unwrap();
        assert!(hints.contains("metainfo-duplicate-id"));
    }

    #[test]
    fn metadata_entries_are_shared_between_versions() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path());

        // same content in two architectures of the same version produces
        // one metadata entry referenced by two package entries
        let pkg_a = test_package("foo", "1.0");
        let mut pkg_b = test_package("foo", "1.0");
        pkg_b.arch = "arm64".to_string();

        let cpt_a = test_component(&pkg_a, "org.example.Foo");
        let cpt_b = test_component(&pkg_b, "org.example.Foo");
        assert_eq!(cpt_a.global_id(), cpt_b.global_id());

        cache.put_components(&pkg_a.pkid(), &[cpt_a]).unwrap();
        cache.put_components(&pkg_b.pkid(), &[cpt_b]).unwrap();

        let gid = cache.get_gids_for_package(&pkg_a.pkid()).unwrap().unwrap();
        assert_eq!(
            cache.get_gids_for_package(&pkg_b.pkid()).unwrap().unwrap(),
            gid
        );
    }

    #[test]
    fn expire_drops_stale_packages_and_orphaned_media() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path());

        let pkg = test_package("foo", "1.0");
        let cpt = test_component(&pkg, "org.example.Foo");
        let gid = cpt.global_id().unwrap();
        let pkid = pkg.pkid();
        cache.put_components(&pkid, &[cpt]).unwrap();

        // simulate media written for this component
        let media_gid_dir = dir.path().join("media").join("main").join(&gid);
        std::fs::create_dir_all(media_gid_dir.join("icons/64x64")).unwrap();
        std::fs::write(media_gid_dir.join("icons/64x64/foo_foo.png"), b"png").unwrap();

        // still valid: nothing happens
        let mut valid = HashSet::new();
        valid.insert(pkid.clone());
        cache.expire(&valid).unwrap();
        assert!(cache.package_exists(&pkid).unwrap());
        assert!(media_gid_dir.exists());

        // package disappears from the archive: everything goes
        cache.expire(&HashSet::new()).unwrap();
        assert!(!cache.package_exists(&pkid).unwrap());
        assert!(cache.get_metadata(&gid).unwrap().is_none());
        assert!(!media_gid_dir.exists());
        // two levels of empty ancestors are pruned
        let gid_parent = media_gid_dir.parent().unwrap();
        assert!(!gid_parent.exists());
        assert!(!gid_parent.parent().unwrap().exists());

        // expire is idempotent
        cache.expire(&HashSet::new()).unwrap();
    }

    #[test]
    fn expire_keeps_components_still_referenced() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path());

        let pkg_a = test_package("foo", "1.0");
        let mut pkg_b = test_package("foo", "1.0");
        pkg_b.arch = "arm64".to_string();
        let cpt_a = test_component(&pkg_a, "org.example.Foo");
        let cpt_b = test_component(&pkg_b, "org.example.Foo");
        let gid = cpt_a.global_id().unwrap();
        cache.put_components(&pkg_a.pkid(), &[cpt_a]).unwrap();
        cache.put_components(&pkg_b.pkid(), &[cpt_b]).unwrap();

        let mut valid = HashSet::new();
        valid.insert(pkg_b.pkid());
        cache.expire(&valid).unwrap();

        assert!(!cache.package_exists(&pkg_a.pkid()).unwrap());
        assert!(cache.package_exists(&pkg_b.pkid()).unwrap());
        // the shared component survives through the remaining reference
        assert!(cache.get_metadata(&gid).unwrap().is_some());
    }

    #[test]
    fn forget_then_reprocess_reproduces_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path());

        let pkg = test_package("foo", "1.0");
        let cpt = test_component(&pkg, "org.example.Foo");
        let pkid = pkg.pkid();
        cache.put_components(&pkid, &[cpt.clone()]).unwrap();
        let before = cache.get_components_yaml(&pkid).unwrap().unwrap();

        cache.remove_package(&pkid).unwrap();
        assert!(!cache.package_exists(&pkid).unwrap());
        assert!(cache.get_hints(&pkid).unwrap().is_none());

        cache.put_components(&pkid, &[cpt]).unwrap();
        let after = cache.get_components_yaml(&pkid).unwrap().unwrap();
        assert_eq!(before, after);
    }
}
