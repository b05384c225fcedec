//! Durable storage for named conversation sessions.
//!
//! Every session lives in its own file, `<root>/<name>.yaml`, holding a YAML list of
//! `{role, content}` records.  Writes go to a uniquely named temporary file in the same
//! directory, are flushed to disk, and then renamed over the destination, so a reader always
//! sees either the old file or the new one.
//!
//! Before sessions existed, the last conversation was kept in a single binary cache file named
//! like the storage root itself.  [`resolve_storage_root`] moves such a file into the new
//! directory as `<root>/cache`, and [`SessionStore::migrate_legacy`] then moves it into a named
//! session exactly once.
//!
//! Rename and delete check for existence and then act without holding a lock.  Two processes
//! racing on the same names can interleave; the tool is single-user and accepts that race.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde_yaml::Value;

use crate::error::{Error, Result};
use crate::message::{self, Message};
use crate::observability::{STORE_LOADS, STORE_MIGRATIONS, STORE_SAVE_ERRORS, STORE_SAVES};

/// Directory name used under the cache directories.
pub const APP_NAME: &str = "confab";

/// The session used when none is named.
pub const DEFAULT_SESSION: &str = "last";

/// File extension of session files.
pub const SESSION_EXTENSION: &str = "yaml";

/// File name of the pre-session single-slot cache, relative to the storage root.
const LEGACY_CACHE_FILE: &str = "cache";

/// Where the legacy cache is parked while its contents are migrated.
const LEGACY_ASIDE_FILE: &str = "cache.migrating";

/// Extension given to a root-level legacy cache while the directory is created in its place.
const PARKED_EXTENSION: &str = "parked";

/// Suffix of in-flight temporary files.
const TEMP_EXTENSION: &str = "tmp";

///////////////////////////////////////////// Codecs ///////////////////////////////////////////

/// A serialization strategy for a whole message sequence.
pub trait SessionCodec {
    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Serializes the sequence.
    fn encode(&self, messages: &[Message]) -> Result<Vec<u8>>;

    /// Deserializes a sequence produced by [`SessionCodec::encode`].
    fn decode(&self, bytes: &[u8]) -> Result<Vec<Message>>;
}

/// The current on-disk format: a human-readable YAML list of `{role, content}` records.
#[derive(Clone, Copy, Debug, Default)]
pub struct YamlCodec;

impl SessionCodec for YamlCodec {
    fn name(&self) -> &'static str {
        "yaml"
    }

    fn encode(&self, messages: &[Message]) -> Result<Vec<u8>> {
        let records: Vec<Value> = messages
            .iter()
            .map(|m| Value::Mapping(message::encode(m)))
            .collect();
        let text = serde_yaml::to_string(&records)?;
        Ok(text.into_bytes())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<Message>> {
        let document: Value = serde_yaml::from_slice(bytes).map_err(|err| {
            Error::format(
                format!("not valid {}: {err}", self.name()),
                None,
                Some(Box::new(err)),
            )
        })?;
        match document {
            Value::Null => Ok(Vec::new()),
            Value::Sequence(records) => records.iter().map(message::decode).collect(),
            _ => Err(Error::format("session file is not a list", None, None)),
        }
    }
}

/// The pre-session cache format: a compact binary encoding of the message list.
///
/// Only ever read in production, during migration.
#[derive(Clone, Copy, Debug, Default)]
pub struct LegacyCodec;

impl SessionCodec for LegacyCodec {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn encode(&self, messages: &[Message]) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(messages, bincode::config::standard())
            .map_err(|err| Error::serialization(format!("legacy encoding failed: {err}"), None))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<Message>> {
        let (messages, read) = bincode::serde::decode_from_slice::<Vec<Message>, _>(
            bytes,
            bincode::config::standard(),
        )
        .map_err(|err| {
            Error::format(format!("not a {} cache: {err}", self.name()), None, None)
        })?;
        if read != bytes.len() {
            return Err(Error::format(
                format!("{} trailing bytes after legacy cache", bytes.len() - read),
                None,
                None,
            ));
        }
        Ok(messages)
    }
}

///////////////////////////////////////////// Paths ////////////////////////////////////////////

/// Resolves the directory that holds session files, creating it if needed.
///
/// `~/.cache/confab` is used when `~/.cache` exists; otherwise the platform cache directory
/// (for example `~/Library/Caches/confab` on macOS).
pub fn resolve_storage_root() -> Result<PathBuf> {
    let user_cache = dirs::home_dir()
        .map(|home| home.join(".cache"))
        .filter(|dir| dir.is_dir());
    let base = match user_cache {
        Some(dir) => dir,
        None => dirs::cache_dir().ok_or_else(|| {
            Error::storage_unavailable("no home or platform cache directory", None)
        })?,
    };
    let root = base.join(APP_NAME);
    prepare_root(&root)?;
    Ok(root)
}

/// Creates the storage directory at `root`.
///
/// A file already at `root` is the old single-slot cache.  It is parked next to `root`, the
/// directory is created, and the file is moved in as `<root>/cache`.  A parked file left by an
/// interrupted run is moved in the same way.
pub fn prepare_root(root: &Path) -> Result<()> {
    let unavailable = |err: io::Error| {
        Error::storage_unavailable(format!("cannot create {}", root.display()), Some(err))
    };
    let parked = root.with_extension(PARKED_EXTENSION);
    if root.is_file() {
        info!("moving legacy cache {} aside", root.display());
        fs::rename(root, &parked).map_err(unavailable)?;
    }
    fs::create_dir_all(root).map_err(unavailable)?;
    let legacy = root.join(LEGACY_CACHE_FILE);
    if parked.is_file() && !legacy.exists() {
        fs::rename(&parked, &legacy).map_err(unavailable)?;
        info!("legacy cache now at {}", legacy.display());
    }
    Ok(())
}

/// Checks that a session name can safely become a file name.
///
/// Names may not be empty, start with a dot, or contain path separators, newlines, or NUL.
pub fn validate_session_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', '\n', '\r', '\0']);
    if bad {
        Err(Error::invalid_session_name(name))
    } else {
        Ok(())
    }
}

fn with_path(err: Error, path: &Path) -> Error {
    match err {
        Error::Format {
            message,
            path: None,
            source,
        } => Error::Format {
            message,
            path: Some(path.to_path_buf()),
            source,
        },
        other => other,
    }
}

fn write_error(path: &Path, err: io::Error) -> Error {
    Error::storage_write(err.to_string(), path, Some(Box::new(err)))
}

///////////////////////////////////////////// Store ////////////////////////////////////////////

/// Maps session names to durable message sequences.
#[derive(Clone, Debug)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    /// Opens the store at the resolved storage root.
    pub fn open() -> Result<Self> {
        Ok(Self::new(resolve_storage_root()?))
    }

    /// Creates a store rooted at `root`.  The directory is created on first save.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory holding the session files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The path of the file backing `name`, whether or not it exists.
    pub fn session_path(&self, name: &str) -> Result<PathBuf> {
        validate_session_name(name)?;
        Ok(self.root.join(format!("{name}.{SESSION_EXTENSION}")))
    }

    /// The path of the file backing `name`, or `None` if there is no such session.
    pub fn existing_session_path(&self, name: &str) -> Result<Option<PathBuf>> {
        let path = self.session_path(name)?;
        Ok(path.is_file().then_some(path))
    }

    /// Returns true if the session exists.
    pub fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.existing_session_path(name)?.is_some())
    }

    /// The path of the pre-session cache file.
    pub fn legacy_path(&self) -> PathBuf {
        self.root.join(LEGACY_CACHE_FILE)
    }

    fn legacy_aside_path(&self) -> PathBuf {
        self.root.join(LEGACY_ASIDE_FILE)
    }

    /// Loads a session.  A session that does not exist yet is empty.
    pub fn load(&self, name: &str) -> Result<Vec<Message>> {
        let path = self.session_path(name)?;
        STORE_LOADS.click();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("session {name} does not exist yet");
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(Error::io(format!("cannot read {}", path.display()), err));
            }
        };
        let messages = YamlCodec.decode(&bytes).map_err(|err| with_path(err, &path))?;
        debug!("loaded {} messages from session {name}", messages.len());
        Ok(messages)
    }

    /// Loads a session, first migrating the legacy cache into the default session if that
    /// session has never been written.
    pub fn open_session(&self, name: &str) -> Result<Vec<Message>> {
        if name == DEFAULT_SESSION && !self.exists(name)? {
            self.migrate_legacy(name)?;
        }
        self.load(name)
    }

    /// Atomically replaces the stored sequence for `name`.
    pub fn save(&self, name: &str, messages: &[Message]) -> Result<()> {
        self.stage(name, messages)?.commit()
    }

    /// Writes `messages` to a temporary file next to the session file without publishing it.
    ///
    /// Readers keep seeing the previous contents until [`StagedSave::commit`] is called.
    /// Dropping the returned value without committing discards the temporary file.
    pub fn stage(&self, name: &str, messages: &[Message]) -> Result<StagedSave> {
        let dest = self.session_path(name)?;
        let bytes = YamlCodec.encode(messages).map_err(|err| {
            STORE_SAVE_ERRORS.click();
            Error::storage_write(err.to_string(), &dest, Some(Box::new(err)))
        })?;
        fs::create_dir_all(&self.root).map_err(|err| {
            STORE_SAVE_ERRORS.click();
            write_error(&self.root, err)
        })?;
        let tmp = self.root.join(format!(
            ".{name}.{}.{TEMP_EXTENSION}",
            uuid::Uuid::new_v4().simple()
        ));
        let staged = StagedSave {
            tmp,
            dest,
            committed: false,
        };
        if let Err(err) = staged.write(&bytes) {
            STORE_SAVE_ERRORS.click();
            return Err(write_error(&staged.tmp, err));
        }
        Ok(staged)
    }

    /// All session names in the store, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(Error::io(
                    format!("cannot list {}", self.root.display()),
                    err,
                ));
            }
        };
        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SESSION_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if validate_session_name(stem).is_ok() && path.is_file() {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Renames a session.  Never replaces an existing session.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let Some(old_path) = self.existing_session_path(old)? else {
            return Err(Error::session_not_found(old));
        };
        let new_path = self.session_path(new)?;
        if new_path.exists() {
            return Err(Error::session_exists(new));
        }
        fs::rename(&old_path, &new_path).map_err(|err| write_error(&new_path, err))?;
        info!("renamed session {old} to {new}");
        Ok(())
    }

    /// Deletes a session.
    pub fn delete(&self, name: &str) -> Result<()> {
        let Some(path) = self.existing_session_path(name)? else {
            return Err(Error::session_not_found(name));
        };
        fs::remove_file(&path).map_err(|err| write_error(&path, err))?;
        info!("deleted session {name}");
        Ok(())
    }

    /// Returns the raw stored text of a session.
    pub fn dump(&self, name: &str) -> Result<String> {
        let Some(path) = self.existing_session_path(name)? else {
            return Err(Error::session_not_found(name));
        };
        fs::read_to_string(&path)
            .map_err(|err| Error::io(format!("cannot read {}", path.display()), err))
    }

    /// Moves the pre-session cache into the session `target`.
    ///
    /// The legacy file is only moved aside after `target` has been written, and the aside copy
    /// is only deleted after `target` has been read back, so a crash at any point leaves the
    /// conversation recoverable.  Returns `false` when there is nothing to migrate.
    pub fn migrate_legacy(&self, target: &str) -> Result<bool> {
        let target_path = self.session_path(target)?;
        let legacy = self.legacy_path();
        let aside = self.legacy_aside_path();

        if legacy.is_file() {
            let messages = read_legacy(&legacy)?;
            if target_path.exists() {
                // An earlier run may have saved the session and then died before moving the
                // legacy file; anything else is a real conflict.
                if self.load(target)? != messages {
                    return Err(Error::session_exists(target));
                }
            } else {
                self.save(target, &messages)?;
            }
            fs::rename(&legacy, &aside).map_err(|err| write_error(&aside, err))?;
            self.finish_migration(target, &messages, &aside)?;
            info!(
                "migrated {} {} messages into session {target}",
                messages.len(),
                LegacyCodec.name()
            );
            Ok(true)
        } else if aside.is_file() {
            warn!("resuming interrupted migration from {}", aside.display());
            let messages = read_legacy(&aside)?;
            if !target_path.exists() {
                self.save(target, &messages)?;
            }
            self.finish_migration(target, &messages, &aside)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn finish_migration(&self, target: &str, messages: &[Message], aside: &Path) -> Result<()> {
        let written = self.load(target)?;
        if !written.starts_with(messages) {
            return Err(Error::storage_write(
                "migrated session does not match the legacy cache",
                self.session_path(target)?,
                None,
            ));
        }
        fs::remove_file(aside).map_err(|err| write_error(aside, err))?;
        STORE_MIGRATIONS.click();
        Ok(())
    }
}

fn read_legacy(path: &Path) -> Result<Vec<Message>> {
    let bytes =
        fs::read(path).map_err(|err| Error::io(format!("cannot read {}", path.display()), err))?;
    LegacyCodec
        .decode(&bytes)
        .map_err(|err| with_path(err, path))
}

/// A session write that has reached the disk but has not been published.
#[derive(Debug)]
pub struct StagedSave {
    tmp: PathBuf,
    dest: PathBuf,
    committed: bool,
}

impl StagedSave {
    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.tmp)?;
        file.write_all(bytes)?;
        file.sync_all()
    }

    /// The temporary file holding the staged contents.
    pub fn temp_path(&self) -> &Path {
        &self.tmp
    }

    /// Atomically publishes the staged contents over the session file.
    pub fn commit(mut self) -> Result<()> {
        if let Err(err) = fs::rename(&self.tmp, &self.dest) {
            STORE_SAVE_ERRORS.click();
            return Err(write_error(&self.dest, err));
        }
        self.committed = true;
        STORE_SAVES.click();
        debug!("saved {}", self.dest.display());
        Ok(())
    }
}

impl Drop for StagedSave {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.tmp);
        }
    }
}
