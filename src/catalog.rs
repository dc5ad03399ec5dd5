//! Catalog persistence layer for ReelStory.
//!
//! Users, dramas, episodes and favorites live in one SQLite database. Every
//! call opens its own short-lived connection so handlers running on the
//! blocking pool never share a handle. Sequences that read and then write
//! (admin bootstrap, favorite toggle, episode insert) run inside a
//! `BEGIN IMMEDIATE` transaction: SQLite hands out the write lock before the
//! read happens, so two racing requests are serialized instead of both acting
//! on a stale read.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How long a connection waits for another writer before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity mirrored from the auth provider. `is_admin` is the only
/// authorization flag in the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub is_admin: bool,
    pub created_at: String,
}

/// Named collection of episodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Drama {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub image_url: String,
    pub created_at: String,
}

/// The slice of the owning drama embedded in episode responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DramaSummary {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A single short clip. `video_url` doubles as the natural key used by the
/// storage sync and is unique across the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub video_url: String,
    pub thumbnail_url: String,
    pub duration: i64,
    pub is_premium: bool,
    pub drama_id: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drama: Option<DramaSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_favorite: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct NewDrama {
    pub title: String,
    pub description: String,
    pub image_url: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewEpisode {
    pub title: String,
    pub description: String,
    pub video_url: String,
    pub thumbnail_url: String,
    pub duration: i64,
    pub is_premium: bool,
    pub drama_id: String,
}

/// Outcome of an episode insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EpisodeInsert {
    Created(Episode),
    UnknownDrama,
    DuplicateVideoUrl,
}

/// Handle to the catalog database. Cheap to clone; holds only the path.
#[derive(Debug, Clone)]
pub struct Catalog {
    db_path: PathBuf,
}

impl Catalog {
    /// Opens (and if necessary creates) the database and ensures the schema
    /// exists. WAL mode keeps list endpoints from blocking behind writers.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating catalog directory {}", parent.display()))?;
        }

        let catalog = Self {
            db_path: path.to_path_buf(),
        };
        let mut conn = catalog.connect()?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling WAL mode for catalog DB")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("setting catalog DB synchronous mode")?;
        ensure_tables(&mut conn)?;
        Ok(catalog)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("opening catalog DB {}", self.db_path.display()))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.connect()?;
        f(&conn)
    }

    /// Runs `f` inside `BEGIN IMMEDIATE` and commits when it returns `Ok`.
    fn with_write<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("starting catalog write transaction")?;
        let value = f(&tx)?;
        tx.commit().context("committing catalog write transaction")?;
        Ok(value)
    }

    pub fn find_user(&self, id: &str) -> Result<Option<User>> {
        self.with_connection(|conn| select_user(conn, id))
    }

    /// Returns the user row, creating it with `is_admin = false` when absent.
    /// The flag reports whether this call created it.
    pub fn ensure_user(&self, id: &str, email: &str) -> Result<(User, bool)> {
        self.with_write(|tx| {
            let created = insert_user_if_missing(tx, id, email)?;
            let user = select_user(tx, id)?.context("user row vanished inside transaction")?;
            Ok((user, created))
        })
    }

    pub fn count_admins(&self) -> Result<i64> {
        self.with_connection(|conn| count_admins(conn))
    }

    /// First-admin bootstrap. Promotes `id` only when no admin exists; the
    /// count and the update share one immediate transaction.
    pub fn bootstrap_admin(&self, id: &str, email: &str) -> Result<bool> {
        self.with_write(|tx| {
            if count_admins(tx)? > 0 {
                return Ok(false);
            }
            tx.execute(
                r#"
                INSERT INTO users (id, email, is_admin, created_at)
                VALUES (?1, ?2, 1, ?3)
                ON CONFLICT(id) DO UPDATE SET is_admin = 1
                "#,
                params![id, email, timestamp()],
            )?;
            Ok(true)
        })
    }

    /// Out-of-band admin edit. Returns `None` when the user does not exist.
    pub fn set_admin(&self, id: &str, is_admin: bool) -> Result<Option<User>> {
        self.with_write(|tx| {
            tx.execute(
                "UPDATE users SET is_admin = ?2 WHERE id = ?1",
                params![id, is_admin as i64],
            )?;
            select_user(tx, id)
        })
    }

    pub fn list_dramas(&self) -> Result<Vec<Drama>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT id, title, description, image_url, created_at
                FROM dramas
                ORDER BY title ASC, rowid ASC
                "#,
            )?;
            let mut rows = stmt.query([])?;
            let mut dramas = Vec::new();
            while let Some(row) = rows.next()? {
                dramas.push(row_to_drama(row)?);
            }
            Ok(dramas)
        })
    }

    pub fn find_drama(&self, id: &str) -> Result<Option<Drama>> {
        self.with_connection(|conn| {
            conn.query_row(
                r#"
                SELECT id, title, description, image_url, created_at
                FROM dramas
                WHERE id = ?1
                "#,
                [id],
                |row| Ok(row_to_drama(row)),
            )
            .optional()?
            .transpose()
        })
    }

    /// The oldest drama, used as the sync fallback when nothing else is
    /// configured.
    pub fn first_drama(&self) -> Result<Option<Drama>> {
        self.with_connection(|conn| {
            conn.query_row(
                r#"
                SELECT id, title, description, image_url, created_at
                FROM dramas
                ORDER BY created_at ASC, rowid ASC
                LIMIT 1
                "#,
                [],
                |row| Ok(row_to_drama(row)),
            )
            .optional()?
            .transpose()
        })
    }

    pub fn create_drama(&self, drama: &NewDrama) -> Result<Drama> {
        let record = Drama {
            id: new_id(),
            title: drama.title.clone(),
            description: drama.description.clone(),
            image_url: drama.image_url.clone(),
            created_at: timestamp(),
        };
        self.with_write(|tx| {
            tx.execute(
                r#"
                INSERT INTO dramas (id, title, description, image_url, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    record.id,
                    record.title,
                    record.description,
                    record.image_url,
                    record.created_at
                ],
            )?;
            Ok(())
        })?;
        Ok(record)
    }

    /// Every episode, newest first, with the owning drama's title.
    pub fn list_episodes(&self) -> Result<Vec<Episode>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                r#"
                SELECT {EPISODE_COLUMNS}
                FROM episodes e
                JOIN dramas d ON d.id = e.drama_id
                ORDER BY e.created_at DESC, e.rowid DESC
                "#
            ))?;
            let mut rows = stmt.query([])?;
            let mut episodes = Vec::new();
            while let Some(row) = rows.next()? {
                episodes.push(row_to_episode(row, false)?);
            }
            Ok(episodes)
        })
    }

    /// Single episode with the drama's title and description.
    pub fn get_episode(&self, id: &str) -> Result<Option<Episode>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                r#"
                SELECT {EPISODE_COLUMNS}
                FROM episodes e
                JOIN dramas d ON d.id = e.drama_id
                WHERE e.id = ?1
                "#
            ))?;
            let mut rows = stmt.query([id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_episode(row, true)?)),
                None => Ok(None),
            }
        })
    }

    /// Inserts an episode unless its drama is missing or its video URL is
    /// already catalogued.
    pub fn create_episode(&self, episode: &NewEpisode) -> Result<EpisodeInsert> {
        self.with_write(|tx| {
            if !row_exists(tx, "dramas", &episode.drama_id)? {
                return Ok(EpisodeInsert::UnknownDrama);
            }

            let record = Episode {
                id: new_id(),
                title: episode.title.clone(),
                description: episode.description.clone(),
                video_url: episode.video_url.clone(),
                thumbnail_url: episode.thumbnail_url.clone(),
                duration: episode.duration,
                is_premium: episode.is_premium,
                drama_id: episode.drama_id.clone(),
                created_at: timestamp(),
                drama: None,
                is_favorite: None,
            };

            let inserted = tx.execute(
                r#"
                INSERT INTO episodes (
                    id, title, description, video_url, thumbnail_url,
                    duration, is_premium, drama_id, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(video_url) DO NOTHING
                "#,
                params![
                    record.id,
                    record.title,
                    record.description,
                    record.video_url,
                    record.thumbnail_url,
                    record.duration,
                    record.is_premium as i64,
                    record.drama_id,
                    record.created_at,
                ],
            )?;

            if inserted == 0 {
                Ok(EpisodeInsert::DuplicateVideoUrl)
            } else {
                Ok(EpisodeInsert::Created(record))
            }
        })
    }

    /// Snapshot of every catalogued video URL, used as the sync dedup set.
    pub fn video_urls(&self) -> Result<HashSet<String>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT video_url FROM episodes")?;
            let urls = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<HashSet<_>>>()?;
            Ok(urls)
        })
    }

    /// Flips the `(user, episode)` favorite. Returns `None` when the episode
    /// does not exist, otherwise whether the pair is now a favorite. The user
    /// row is created on the fly so the foreign key holds.
    pub fn toggle_favorite(
        &self,
        user_id: &str,
        email: &str,
        episode_id: &str,
    ) -> Result<Option<bool>> {
        self.with_write(|tx| {
            if !row_exists(tx, "episodes", episode_id)? {
                return Ok(None);
            }
            insert_user_if_missing(tx, user_id, email)?;

            let removed = tx.execute(
                "DELETE FROM favorites WHERE user_id = ?1 AND episode_id = ?2",
                params![user_id, episode_id],
            )?;
            if removed > 0 {
                return Ok(Some(false));
            }

            tx.execute(
                r#"
                INSERT INTO favorites (id, user_id, episode_id, created_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![new_id(), user_id, episode_id, timestamp()],
            )?;
            Ok(Some(true))
        })
    }

    /// Episodes the user saved, most recently favorited first.
    pub fn list_favorites(&self, user_id: &str) -> Result<Vec<Episode>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                r#"
                SELECT {EPISODE_COLUMNS}
                FROM favorites f
                JOIN episodes e ON e.id = f.episode_id
                JOIN dramas d ON d.id = e.drama_id
                WHERE f.user_id = ?1
                ORDER BY f.created_at DESC, f.rowid DESC
                "#
            ))?;
            let mut rows = stmt.query([user_id])?;
            let mut episodes = Vec::new();
            while let Some(row) = rows.next()? {
                let mut episode = row_to_episode(row, false)?;
                episode.is_favorite = Some(true);
                episodes.push(episode);
            }
            Ok(episodes)
        })
    }
}

const EPISODE_COLUMNS: &str = "e.id, e.title, e.description, e.video_url, e.thumbnail_url, \
     e.duration, e.is_premium, e.drama_id, e.created_at, \
     d.title AS drama_title, d.description AS drama_description";

/// Creates the tables if they do not exist yet. Wrapped in a transaction so a
/// failure leaves the DB untouched.
fn ensure_tables(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL DEFAULT '',
            is_admin INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS dramas (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            image_url TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS episodes (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            video_url TEXT NOT NULL,
            thumbnail_url TEXT NOT NULL,
            duration INTEGER NOT NULL DEFAULT 0,
            is_premium INTEGER NOT NULL DEFAULT 0,
            drama_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (drama_id) REFERENCES dramas(id) ON DELETE CASCADE
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_episodes_video_url ON episodes(video_url);
        CREATE INDEX IF NOT EXISTS idx_episodes_drama ON episodes(drama_id);

        CREATE TABLE IF NOT EXISTS favorites (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            episode_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (user_id, episode_id),
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
            FOREIGN KEY (episode_id) REFERENCES episodes(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_favorites_user ON favorites(user_id);
        "#,
    )?;

    tx.commit()?;
    Ok(())
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn select_user(conn: &Connection, id: &str) -> Result<Option<User>> {
    conn.query_row(
        "SELECT id, email, is_admin, created_at FROM users WHERE id = ?1",
        [id],
        |row| {
            Ok(User {
                id: row.get("id")?,
                email: row.get("email")?,
                is_admin: row.get::<_, i64>("is_admin")? != 0,
                created_at: row.get("created_at")?,
            })
        },
    )
    .optional()
    .context("looking up user")
}

fn insert_user_if_missing(conn: &Connection, id: &str, email: &str) -> Result<bool> {
    let inserted = conn.execute(
        r#"
        INSERT INTO users (id, email, is_admin, created_at)
        VALUES (?1, ?2, 0, ?3)
        ON CONFLICT(id) DO NOTHING
        "#,
        params![id, email, timestamp()],
    )?;
    Ok(inserted > 0)
}

fn count_admins(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM users WHERE is_admin = 1", [], |row| {
        row.get(0)
    })
    .context("counting admins")
}

/// `table` is always one of our own literals, never user input.
fn row_exists(conn: &Connection, table: &str, id: &str) -> Result<bool> {
    let found = conn
        .query_row(&format!("SELECT 1 FROM {table} WHERE id = ?1"), [id], |_| {
            Ok(())
        })
        .optional()?;
    Ok(found.is_some())
}

fn row_to_drama(row: &Row<'_>) -> Result<Drama> {
    Ok(Drama {
        id: row.get("id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        image_url: row.get("image_url")?,
        created_at: row.get("created_at")?,
    })
}

/// Converts a joined episode row, normalizing the INTEGER boolean and
/// embedding the drama summary.
fn row_to_episode(row: &Row<'_>, with_drama_description: bool) -> Result<Episode> {
    let drama_description = if with_drama_description {
        Some(row.get("drama_description")?)
    } else {
        None
    };

    Ok(Episode {
        id: row.get("id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        video_url: row.get("video_url")?,
        thumbnail_url: row.get("thumbnail_url")?,
        duration: row.get("duration")?,
        is_premium: row.get::<_, i64>("is_premium")? != 0,
        drama_id: row.get("drama_id")?,
        created_at: row.get("created_at")?,
        drama: Some(DramaSummary {
            title: row.get("drama_title")?,
            description: drama_description,
        }),
        is_favorite: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};
    use tempfile::{TempDir, tempdir};

    fn temp_catalog() -> (TempDir, Catalog) {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path().join("db/reelstory.db")).unwrap();
        (dir, catalog)
    }

    fn sample_drama(catalog: &Catalog, title: &str) -> Drama {
        catalog
            .create_drama(&NewDrama {
                title: title.into(),
                ..NewDrama::default()
            })
            .unwrap()
    }

    fn sample_episode(catalog: &Catalog, drama: &Drama, url: &str) -> Episode {
        match catalog
            .create_episode(&NewEpisode {
                title: format!("episode {url}"),
                video_url: url.into(),
                thumbnail_url: "https://img/thumb.jpg".into(),
                duration: 42,
                drama_id: drama.id.clone(),
                ..NewEpisode::default()
            })
            .unwrap()
        {
            EpisodeInsert::Created(episode) => episode,
            other => panic!("unexpected insert outcome {other:?}"),
        }
    }

    #[test]
    fn ensure_user_creates_once() {
        let (_dir, catalog) = temp_catalog();
        let (user, created) = catalog.ensure_user("u1", "a@b.c").unwrap();
        assert!(created);
        assert!(!user.is_admin);
        let (_, created_again) = catalog.ensure_user("u1", "a@b.c").unwrap();
        assert!(!created_again);
    }

    #[test]
    fn bootstrap_admin_only_promotes_first_caller() {
        let (_dir, catalog) = temp_catalog();
        assert!(catalog.bootstrap_admin("u1", "one@x").unwrap());
        assert!(!catalog.bootstrap_admin("u2", "two@x").unwrap());
        assert_eq!(catalog.count_admins().unwrap(), 1);
        assert!(catalog.find_user("u1").unwrap().unwrap().is_admin);
        assert!(catalog.find_user("u2").unwrap().is_none());
    }

    #[test]
    fn concurrent_bootstrap_yields_single_admin() {
        let (_dir, catalog) = temp_catalog();
        let catalog = Arc::new(catalog);
        let handles: Vec<_> = (0..8)
            .map(|index| {
                let catalog = catalog.clone();
                thread::spawn(move || {
                    catalog
                        .bootstrap_admin(&format!("user-{index}"), "racer@x")
                        .unwrap()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(catalog.count_admins().unwrap(), 1);
    }

    #[test]
    fn set_admin_updates_existing_rows_only() {
        let (_dir, catalog) = temp_catalog();
        assert!(catalog.set_admin("ghost", true).unwrap().is_none());
        catalog.ensure_user("u1", "").unwrap();
        assert!(catalog.set_admin("u1", true).unwrap().unwrap().is_admin);
        assert!(!catalog.set_admin("u1", false).unwrap().unwrap().is_admin);
    }

    #[test]
    fn dramas_sorted_by_title_and_first_is_oldest() {
        let (_dir, catalog) = temp_catalog();
        let zed = sample_drama(&catalog, "Zed");
        sample_drama(&catalog, "Alpha");
        let titles: Vec<_> = catalog
            .list_dramas()
            .unwrap()
            .into_iter()
            .map(|drama| drama.title)
            .collect();
        assert_eq!(titles, vec!["Alpha", "Zed"]);
        assert_eq!(catalog.first_drama().unwrap().unwrap().id, zed.id);
    }

    #[test]
    fn create_episode_checks_drama_and_url() {
        let (_dir, catalog) = temp_catalog();
        let drama = sample_drama(&catalog, "Drama");
        let outcome = catalog
            .create_episode(&NewEpisode {
                title: "x".into(),
                video_url: "https://v/1".into(),
                drama_id: "missing".into(),
                ..NewEpisode::default()
            })
            .unwrap();
        assert_eq!(outcome, EpisodeInsert::UnknownDrama);

        sample_episode(&catalog, &drama, "https://v/1");
        let duplicate = catalog
            .create_episode(&NewEpisode {
                title: "again".into(),
                video_url: "https://v/1".into(),
                drama_id: drama.id.clone(),
                ..NewEpisode::default()
            })
            .unwrap();
        assert_eq!(duplicate, EpisodeInsert::DuplicateVideoUrl);
        assert_eq!(catalog.list_episodes().unwrap().len(), 1);
    }

    #[test]
    fn episodes_listed_newest_first_with_drama() {
        let (_dir, catalog) = temp_catalog();
        let drama = sample_drama(&catalog, "Drama");
        sample_episode(&catalog, &drama, "https://v/old");
        let newest = sample_episode(&catalog, &drama, "https://v/new");
        let episodes = catalog.list_episodes().unwrap();
        assert_eq!(episodes[0].id, newest.id);
        let summary = episodes[0].drama.as_ref().unwrap();
        assert_eq!(summary.title, "Drama");
        assert!(summary.description.is_none());

        let single = catalog.get_episode(&newest.id).unwrap().unwrap();
        assert_eq!(single.drama.unwrap().description.as_deref(), Some(""));
        assert!(catalog.get_episode("ghost").unwrap().is_none());
    }

    #[test]
    fn toggle_favorite_flips_membership() {
        let (_dir, catalog) = temp_catalog();
        let drama = sample_drama(&catalog, "Drama");
        let episode = sample_episode(&catalog, &drama, "https://v/1");

        assert_eq!(catalog.toggle_favorite("u1", "", &episode.id).unwrap(), Some(true));
        let favorites = catalog.list_favorites("u1").unwrap();
        assert_eq!(favorites.len(), 1);
        assert_eq!(favorites[0].is_favorite, Some(true));

        assert_eq!(catalog.toggle_favorite("u1", "", &episode.id).unwrap(), Some(false));
        assert!(catalog.list_favorites("u1").unwrap().is_empty());
        assert!(catalog.find_user("u1").unwrap().is_some());
    }

    #[test]
    fn favorites_table_rejects_duplicate_pairs() {
        let (_dir, catalog) = temp_catalog();
        let drama = sample_drama(&catalog, "Drama");
        let episode = sample_episode(&catalog, &drama, "https://v/1");
        catalog.ensure_user("u1", "").unwrap();

        let conn = catalog.connect().unwrap();
        let insert = |id: &str| {
            conn.execute(
                "INSERT INTO favorites (id, user_id, episode_id, created_at) VALUES (?1, 'u1', ?2, ?3)",
                params![id, episode.id, timestamp()],
            )
        };
        insert("fav-1").unwrap();
        let err = insert("fav-2").unwrap_err();
        assert!(err.to_string().contains("UNIQUE"), "{err}");
    }

    #[test]
    fn concurrent_toggles_leave_consistent_state() {
        let (_dir, catalog) = temp_catalog();
        let drama = sample_drama(&catalog, "Drama");
        let episode = sample_episode(&catalog, &drama, "https://v/1");
        let catalog = Arc::new(catalog);

        let handles: Vec<_> = (0..7)
            .map(|_| {
                let catalog = catalog.clone();
                let episode_id = episode.id.clone();
                thread::spawn(move || {
                    catalog
                        .toggle_favorite("u1", "u1@x", &episode_id)
                        .unwrap()
                        .unwrap()
                })
            })
            .collect();
        let added = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|now_favorite| *now_favorite)
            .count();

        assert_eq!(added, 4);
        assert_eq!(catalog.list_favorites("u1").unwrap().len(), 1);
    }

    #[test]
    fn toggle_favorite_unknown_episode() {
        let (_dir, catalog) = temp_catalog();
        assert_eq!(catalog.toggle_favorite("u1", "", "ghost").unwrap(), None);
        assert!(catalog.find_user("u1").unwrap().is_none());
    }

    #[test]
    fn video_urls_snapshot() {
        let (_dir, catalog) = temp_catalog();
        let drama = sample_drama(&catalog, "Drama");
        sample_episode(&catalog, &drama, "https://v/1");
        sample_episode(&catalog, &drama, "https://v/2");
        let urls = catalog.video_urls().unwrap();
        assert_eq!(urls.len(), 2);
        assert!(urls.contains("https://v/2"));
    }
}
