//! Imports videos found in object storage into the episode table.
//!
//! Every direct child of `videos/` becomes an episode unless its download URL
//! is already catalogued, so re-running the sync without new uploads adds
//! nothing. A failing object is recorded and skipped; earlier imports stay.

use std::collections::HashSet;

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::{
    catalog::{Catalog, EpisodeInsert, NewEpisode},
    config::SyncConfig,
    storage::{ObjectStorage, StoredObject},
};

pub const VIDEOS_PREFIX: &str = "videos";
pub const DEFAULT_DURATION_SECS: i64 = 60;

/// Probe order matters: episodes synced earlier picked the first hit in this
/// order, and re-resolving must agree with them.
const THUMBNAIL_DIRS: [&str; 3] = ["images", "thumbnails", "videos/thumbnails"];
const THUMBNAIL_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddedEpisode {
    pub id: String,
    pub title: String,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailure {
    pub file_name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub added: Vec<AddedEpisode>,
    pub existing: Vec<String>,
    pub errors: Vec<SyncFailure>,
}

impl SyncReport {
    pub fn summary(&self) -> String {
        format!(
            "Sync completed. Added: {}, Already existing: {}, Errors: {}",
            self.added.len(),
            self.existing.len(),
            self.errors.len()
        )
    }
}

/// Failures that stop the sync before any object is processed.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("No drama found in database. Please create a drama first.")]
    NoDrama,
    #[error("Configured sync drama {0} does not exist")]
    UnknownDefaultDrama(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

enum ObjectOutcome {
    Added(AddedEpisode),
    Existing,
}

/// Drops a trailing `.ext` (one or more chars, no `/` or `.`):
/// `ep-01.final.mp4` -> `ep-01.final`, `.hidden` -> ``, `clip.` stays.
pub fn strip_extension(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((base, ext)) if !ext.is_empty() && !ext.contains('/') => base,
        _ => name,
    }
}

/// `my-first-episode.mp4` -> `my first episode`
pub fn title_from_file_name(name: &str) -> String {
    strip_extension(name).replace('-', " ")
}

/// Every thumbnail path tried for `base`, in priority order.
pub fn thumbnail_candidates(base: &str) -> Vec<String> {
    THUMBNAIL_DIRS
        .iter()
        .flat_map(|dir| {
            THUMBNAIL_EXTENSIONS
                .iter()
                .map(move |ext| format!("{dir}/{base}.{ext}"))
        })
        .collect()
}

pub struct Synchronizer<'a> {
    catalog: &'a Catalog,
    storage: &'a dyn ObjectStorage,
    config: &'a SyncConfig,
}

impl<'a> Synchronizer<'a> {
    pub fn new(catalog: &'a Catalog, storage: &'a dyn ObjectStorage, config: &'a SyncConfig) -> Self {
        Self {
            catalog,
            storage,
            config,
        }
    }

    pub fn run(&self) -> Result<SyncReport, SyncError> {
        let default_drama = self.default_drama_id()?;

        let objects = self
            .storage
            .list(VIDEOS_PREFIX)
            .context("listing videos in object storage")?;
        info!("found {} object(s) under {VIDEOS_PREFIX}/", objects.len());

        let mut known = self
            .catalog
            .video_urls()
            .context("loading catalogued video URLs")?;

        let mut report = SyncReport::default();
        for object in &objects {
            debug!("processing {}", object.full_path);
            match self.process(object, &default_drama, &mut known) {
                Ok(ObjectOutcome::Added(added)) => {
                    info!("added episode {} from {}", added.id, object.full_path);
                    report.added.push(added);
                }
                Ok(ObjectOutcome::Existing) => report.existing.push(object.name.clone()),
                Err(err) => {
                    warn!("failed to import {}: {err:#}", object.full_path);
                    report.errors.push(SyncFailure {
                        file_name: object.name.clone(),
                        error: format!("{err:#}"),
                    });
                }
            }
        }

        info!("{}", report.summary());
        Ok(report)
    }

    fn default_drama_id(&self) -> Result<String, SyncError> {
        match &self.config.default_drama_id {
            Some(id) => match self.catalog.find_drama(id)? {
                Some(drama) => Ok(drama.id),
                None => Err(SyncError::UnknownDefaultDrama(id.clone())),
            },
            None => self
                .catalog
                .first_drama()?
                .map(|drama| drama.id)
                .ok_or(SyncError::NoDrama),
        }
    }

    /// Longest matching `SYNC_DRAMA_MAP` prefix, else the default drama.
    fn drama_for<'b>(&'b self, file_name: &str, default: &'b str) -> &'b str {
        self.config
            .drama_map
            .iter()
            .filter(|(prefix, _)| file_name.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, drama_id)| drama_id.as_str())
            .unwrap_or(default)
    }

    fn resolve_thumbnail(&self, base: &str) -> String {
        for candidate in thumbnail_candidates(base) {
            match self.storage.download_url(&candidate) {
                Ok(Some(url)) => {
                    debug!("thumbnail for {base} found at {candidate}");
                    return url;
                }
                Ok(None) => {}
                Err(err) => debug!("thumbnail probe {candidate} failed: {err:#}"),
            }
        }
        debug!("no thumbnail for {base}, using placeholder");
        self.config.placeholder_thumbnail.clone()
    }

    fn process(
        &self,
        object: &StoredObject,
        default_drama: &str,
        known: &mut HashSet<String>,
    ) -> Result<ObjectOutcome> {
        let url = self
            .storage
            .download_url(&object.full_path)
            .context("Failed to get download URL")?
            .ok_or_else(|| anyhow!("{} no longer exists in storage", object.full_path))?;

        if known.contains(&url) {
            return Ok(ObjectOutcome::Existing);
        }

        match self.storage.metadata(&object.full_path) {
            Ok(Some(meta)) => debug!(
                "{}: content type {:?}, size {:?}, updated {:?}",
                object.name, meta.content_type, meta.size, meta.updated
            ),
            Ok(None) => {}
            Err(err) => warn!("could not read metadata for {}: {err:#}", object.name),
        }

        let base = strip_extension(&object.name);
        let drama_id = self.drama_for(&object.name, default_drama);
        let episode = NewEpisode {
            title: title_from_file_name(&object.name),
            description: format!(
                "Automatically imported from Firebase Storage: {}",
                object.name
            ),
            video_url: url.clone(),
            thumbnail_url: self.resolve_thumbnail(base),
            duration: DEFAULT_DURATION_SECS,
            is_premium: false,
            drama_id: drama_id.to_string(),
        };

        match self.catalog.create_episode(&episode)? {
            EpisodeInsert::Created(created) => {
                known.insert(url);
                Ok(ObjectOutcome::Added(AddedEpisode {
                    id: created.id,
                    title: created.title,
                    file_name: object.name.clone(),
                }))
            }
            EpisodeInsert::DuplicateVideoUrl => {
                known.insert(url);
                Ok(ObjectOutcome::Existing)
            }
            EpisodeInsert::UnknownDrama => bail!("drama {drama_id} does not exist"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::NewDrama,
        storage::{MemoryStorage, ObjectMetadata},
    };
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        catalog: Catalog,
        storage: MemoryStorage,
        config: SyncConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let catalog = Catalog::open(dir.path().join("reelstory.db")).unwrap();
            Self {
                _dir: dir,
                catalog,
                storage: MemoryStorage::new(),
                config: SyncConfig::default(),
            }
        }

        fn with_drama(self, title: &str) -> (Self, String) {
            let drama = self
                .catalog
                .create_drama(&NewDrama {
                    title: title.into(),
                    ..NewDrama::default()
                })
                .unwrap();
            (self, drama.id)
        }

        fn run(&self) -> Result<SyncReport, SyncError> {
            Synchronizer::new(&self.catalog, &self.storage, &self.config).run()
        }
    }

    /// Storage whose download URL lookups fail for one path.
    struct FlakyStorage<'a> {
        inner: &'a MemoryStorage,
        broken: &'a str,
    }

    impl ObjectStorage for FlakyStorage<'_> {
        fn list(&self, prefix: &str) -> Result<Vec<StoredObject>> {
            self.inner.list(prefix)
        }

        fn metadata(&self, path: &str) -> Result<Option<ObjectMetadata>> {
            self.inner.metadata(path)
        }

        fn download_url(&self, path: &str) -> Result<Option<String>> {
            if path == self.broken {
                bail!("permission denied");
            }
            self.inner.download_url(path)
        }

        fn upload(&self, path: &str, content_type: &str, bytes: &[u8]) -> Result<String> {
            self.inner.upload(path, content_type, bytes)
        }
    }

    #[test]
    fn title_and_extension_helpers() {
        assert_eq!(strip_extension("ep1.mp4"), "ep1");
        assert_eq!(strip_extension("ep.final.mov"), "ep.final");
        assert_eq!(strip_extension("noext"), "noext");
        assert_eq!(strip_extension(".hidden"), "");
        assert_eq!(strip_extension("clip."), "clip.");
        assert_eq!(strip_extension("dir.v2/clip"), "dir.v2/clip");
        assert_eq!(title_from_file_name("my-first-episode.mp4"), "my first episode");
    }

    #[test]
    fn thumbnail_candidates_keep_priority_order() {
        let candidates = thumbnail_candidates("ep1");
        assert_eq!(candidates.len(), 12);
        assert_eq!(candidates[0], "images/ep1.jpg");
        assert_eq!(candidates[3], "images/ep1.webp");
        assert_eq!(candidates[4], "thumbnails/ep1.jpg");
        assert_eq!(candidates[11], "videos/thumbnails/ep1.webp");
    }

    #[test]
    fn sync_without_drama_fails_up_front() {
        let fixture = Fixture::new();
        fixture.storage.insert("videos/ep1.mp4", "video/mp4", b"v");
        assert!(matches!(fixture.run(), Err(SyncError::NoDrama)));
        assert!(fixture.catalog.video_urls().unwrap().is_empty());
    }

    #[test]
    fn unknown_configured_drama_is_rejected() {
        let (mut fixture, _) = Fixture::new().with_drama("Drama");
        fixture.config.default_drama_id = Some("ghost".into());
        assert!(matches!(
            fixture.run(),
            Err(SyncError::UnknownDefaultDrama(id)) if id == "ghost"
        ));
    }

    #[test]
    fn sync_imports_once_and_is_idempotent() {
        let (fixture, drama_id) = Fixture::new().with_drama("Drama");
        fixture.storage.insert("videos/my-first-ep.mp4", "video/mp4", b"v");
        fixture.storage.insert("videos/ep2.mp4", "video/mp4", b"v");
        fixture.storage.insert("videos/thumbnails/ep2.png", "image/png", b"t");

        let first = fixture.run().unwrap();
        assert_eq!(first.added.len(), 2);
        assert!(first.existing.is_empty());
        assert!(first.errors.is_empty());

        let episodes = fixture.catalog.list_episodes().unwrap();
        let imported = episodes
            .iter()
            .find(|episode| episode.title == "my first ep")
            .unwrap();
        assert_eq!(imported.drama_id, drama_id);
        assert_eq!(imported.duration, DEFAULT_DURATION_SECS);
        assert!(!imported.is_premium);
        assert_eq!(
            imported.description,
            "Automatically imported from Firebase Storage: my-first-ep.mp4"
        );

        let second = fixture.run().unwrap();
        assert!(second.added.is_empty());
        assert_eq!(second.existing.len(), 2);
        assert_eq!(fixture.catalog.list_episodes().unwrap().len(), 2);
        assert_eq!(
            second.summary(),
            "Sync completed. Added: 0, Already existing: 2, Errors: 0"
        );
    }

    #[test]
    fn sibling_image_wins_over_placeholder() {
        let (fixture, _) = Fixture::new().with_drama("Drama");
        fixture.storage.insert("videos/ep1.mp4", "video/mp4", b"v");
        fixture.storage.insert("videos/ep2.mp4", "video/mp4", b"v");
        fixture.storage.insert("images/ep1.jpg", "image/jpeg", b"i");
        fixture.storage.insert("thumbnails/ep1.jpg", "image/jpeg", b"t");

        fixture.run().unwrap();
        let episodes = fixture.catalog.list_episodes().unwrap();
        let thumb = |title: &str| {
            episodes
                .iter()
                .find(|episode| episode.title == title)
                .map(|episode| episode.thumbnail_url.clone())
                .unwrap()
        };
        assert_eq!(thumb("ep1"), MemoryStorage::url_for("images/ep1.jpg"));
        assert_eq!(thumb("ep2"), fixture.config.placeholder_thumbnail);
    }

    #[test]
    fn failed_thumbnail_lookup_falls_through_to_next_candidate() {
        let (fixture, _) = Fixture::new().with_drama("Drama");
        fixture.storage.insert("videos/ep1.mp4", "video/mp4", b"v");
        fixture.storage.insert("images/ep1.jpg", "image/jpeg", b"i");
        fixture.storage.insert("thumbnails/ep1.jpg", "image/jpeg", b"t");

        let flaky = FlakyStorage {
            inner: &fixture.storage,
            broken: "images/ep1.jpg",
        };
        let report = Synchronizer::new(&fixture.catalog, &flaky, &fixture.config)
            .run()
            .unwrap();
        assert_eq!(report.added.len(), 1);
        let episodes = fixture.catalog.list_episodes().unwrap();
        assert_eq!(
            episodes[0].thumbnail_url,
            MemoryStorage::url_for("thumbnails/ep1.jpg")
        );
    }

    #[test]
    fn one_bad_object_does_not_abort_the_batch() {
        let (fixture, _) = Fixture::new().with_drama("Drama");
        fixture.storage.insert("videos/a.mp4", "video/mp4", b"v");
        fixture.storage.insert("videos/b.mp4", "video/mp4", b"v");
        fixture.storage.insert("videos/c.mp4", "video/mp4", b"v");

        let flaky = FlakyStorage {
            inner: &fixture.storage,
            broken: "videos/b.mp4",
        };
        let report = Synchronizer::new(&fixture.catalog, &flaky, &fixture.config)
            .run()
            .unwrap();

        assert_eq!(report.added.len(), 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].file_name, "b.mp4");
        assert!(report.errors[0].error.contains("permission denied"));
        assert_eq!(fixture.catalog.list_episodes().unwrap().len(), 2);
    }

    #[test]
    fn drama_map_routes_by_longest_prefix() {
        let (fixture, default_id) = Fixture::new().with_drama("Default");
        let (fixture, romance_id) = fixture.with_drama("Romance");
        let (mut fixture, special_id) = fixture.with_drama("Special");
        fixture.config.drama_map = vec![
            ("romance-".into(), romance_id.clone()),
            ("romance-special-".into(), special_id.clone()),
            ("lost-".into(), "ghost".into()),
        ];
        fixture.storage.insert("videos/romance-ep1.mp4", "video/mp4", b"v");
        fixture.storage.insert("videos/romance-special-ep1.mp4", "video/mp4", b"v");
        fixture.storage.insert("videos/other.mp4", "video/mp4", b"v");
        fixture.storage.insert("videos/lost-ep.mp4", "video/mp4", b"v");

        let report = fixture.run().unwrap();
        assert_eq!(report.added.len(), 3);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].file_name, "lost-ep.mp4");

        let drama_of = |title: &str| {
            fixture
                .catalog
                .list_episodes()
                .unwrap()
                .into_iter()
                .find(|episode| episode.title == title)
                .map(|episode| episode.drama_id)
                .unwrap()
        };
        assert_eq!(drama_of("romance ep1"), romance_id);
        assert_eq!(drama_of("romance special ep1"), special_id);
        assert_eq!(drama_of("other"), default_id);
    }
}
