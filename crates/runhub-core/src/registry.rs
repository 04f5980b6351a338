//! Program registry
//!
//! Maps program identifiers to their on-disk source directories. Each directory
//! carries a two-byte `status` descriptor (language code, immediate flag) so the
//! registry can be rebuilt when the daemon restarts.

use crate::cancel::Scope;
use crate::errors::HubError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::fs;

pub const DESCRIPTOR_FILE: &str = "status";

const IMMEDIATE_FLAG: u8 = 0x80;
const LANGUAGE_MASK: u8 = 0x7F;

/// Source language of an uploaded program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Python2,
    Python3,
    Go,
}

impl Language {
    /// Language code used by the upload command (1, 2, 3).
    pub fn from_wire(code: u8) -> Option<Self> {
        match code {
            1 => Some(Language::Python2),
            2 => Some(Language::Python3),
            3 => Some(Language::Go),
            _ => None,
        }
    }

    /// Language code stored in the descriptor file (0, 1, 2).
    pub fn disk_code(self) -> u8 {
        match self {
            Language::Python2 => 0,
            Language::Python3 => 1,
            Language::Go => 2,
        }
    }

    pub fn from_disk(code: u8) -> Option<Self> {
        match code {
            0 => Some(Language::Python2),
            1 => Some(Language::Python3),
            2 => Some(Language::Go),
            _ => None,
        }
    }

    pub fn entry_file(self) -> &'static str {
        match self {
            Language::Python2 | Language::Python3 => "main.py",
            Language::Go => "main.go",
        }
    }

    pub fn is_interpreted(self) -> bool {
        !matches!(self, Language::Go)
    }

    pub fn name(self) -> &'static str {
        match self {
            Language::Python2 => "python2",
            Language::Python3 => "python3",
            Language::Go => "go",
        }
    }
}

/// Decoded flags byte of an upload: bit 7 is the immediate flag, the low bits the language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadFlags {
    pub language: Language,
    pub immediate: bool,
}

impl UploadFlags {
    pub fn parse(flags: u8) -> Result<Self, HubError> {
        let language =
            Language::from_wire(flags & LANGUAGE_MASK).ok_or(HubError::UnknownType(flags))?;
        Ok(Self {
            language,
            immediate: flags & IMMEDIATE_FLAG == IMMEDIATE_FLAG,
        })
    }
}

/// A registered, built program. Replaced wholesale, never mutated.
#[derive(Debug, Clone)]
pub struct ProgramDescriptor {
    pub id: String,
    pub dir: PathBuf,
    pub language: Language,
    pub immediate: bool,
    /// Parent scope of every execution launched from this program.
    pub scope: Scope,
}

impl ProgramDescriptor {
    pub fn entry_path(&self) -> PathBuf {
        self.dir.join(self.language.entry_file())
    }

    fn descriptor_bytes(&self) -> [u8; 2] {
        [self.language.disk_code(), u8::from(self.immediate)]
    }
}

/// Parses the two-byte descriptor file content.
pub fn decode_descriptor(bytes: &[u8]) -> Result<(Language, bool), HubError> {
    if bytes.len() < 2 {
        return Err(HubError::malformed(format!(
            "descriptor holds {} bytes, expected 2",
            bytes.len()
        )));
    }
    let language = Language::from_disk(bytes[0])
        .ok_or_else(|| HubError::malformed(format!("unknown language code {}", bytes[0])))?;
    Ok((language, bytes[1] == 1))
}

/// A program directory reserved for an upload that has not been registered yet.
#[derive(Debug)]
pub struct StagedProgram {
    pub id: String,
    pub dir: PathBuf,
    pub flags: UploadFlags,
}

pub struct ProgramRegistry {
    store: PathBuf,
    programs: Mutex<HashMap<String, Arc<ProgramDescriptor>>>,
    last_id: Mutex<i64>,
    scope: Scope,
}

impl ProgramRegistry {
    /// Creates an empty registry over `store`, creating the directory if needed.
    pub async fn open(store: impl Into<PathBuf>, scope: Scope) -> Result<Self, HubError> {
        let store = store.into();
        fs::create_dir_all(&store).await?;
        Ok(Self {
            store,
            programs: Mutex::new(HashMap::new()),
            last_id: Mutex::new(0),
            scope,
        })
    }

    /// Opens the store and re-registers every program found on disk.
    pub async fn load(store: impl Into<PathBuf>, scope: Scope) -> Result<Self, HubError> {
        let registry = Self::open(store, scope).await?;
        let mut entries = fs::read_dir(&registry.store).await?;
        let mut loaded = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            let dir = entry.path();
            let id = entry.file_name().to_string_lossy().to_string();
            match fs::read(dir.join(DESCRIPTOR_FILE))
                .await
                .map_err(HubError::from)
                .and_then(|bytes| decode_descriptor(&bytes))
            {
                Ok((language, immediate)) => {
                    registry.note_existing_id(&id);
                    registry.lock_programs().insert(
                        id.clone(),
                        Arc::new(ProgramDescriptor {
                            id,
                            dir,
                            language,
                            immediate,
                            scope: registry.scope.child(),
                        }),
                    );
                    loaded += 1;
                }
                Err(e) => log::warn!("Skipping program directory {}: {}", dir.display(), e),
            }
        }
        log::info!(
            "Loaded {} program(s) from {}",
            loaded,
            registry.store.display()
        );
        Ok(registry)
    }

    fn lock_programs(&self) -> MutexGuard<'_, HashMap<String, Arc<ProgramDescriptor>>> {
        self.programs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn note_existing_id(&self, id: &str) {
        if let Ok(value) = id.parse::<i64>() {
            let mut last = self.last_id.lock().unwrap_or_else(|p| p.into_inner());
            *last = (*last).max(value);
        }
    }

    /// Next identifier: the current Unix time in seconds, bumped past any identifier
    /// already handed out.
    fn next_id(&self) -> String {
        let mut last = self.last_id.lock().unwrap_or_else(|p| p.into_inner());
        let now = chrono::Utc::now().timestamp();
        *last = if now > *last { now } else { *last + 1 };
        last.to_string()
    }

    pub fn store(&self) -> &Path {
        &self.store
    }

    /// Reserves an identifier and creates its empty directory.
    pub async fn stage(&self, flags: UploadFlags) -> Result<StagedProgram, HubError> {
        loop {
            let id = self.next_id();
            let dir = self.store.join(&id);
            match fs::create_dir(&dir).await {
                Ok(()) => return Ok(StagedProgram { id, dir, flags }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Persists the descriptor of a staged program and makes it visible.
    pub async fn commit(&self, staged: &StagedProgram) -> Result<Arc<ProgramDescriptor>, HubError> {
        let descriptor = Arc::new(ProgramDescriptor {
            id: staged.id.clone(),
            dir: staged.dir.clone(),
            language: staged.flags.language,
            immediate: staged.flags.immediate,
            scope: self.scope.child(),
        });
        if let Err(e) = fs::write(
            descriptor.dir.join(DESCRIPTOR_FILE),
            descriptor.descriptor_bytes(),
        )
        .await
        {
            descriptor.scope.release();
            return Err(e.into());
        }
        let previous = self
            .lock_programs()
            .insert(descriptor.id.clone(), Arc::clone(&descriptor));
        if let Some(previous) = previous {
            previous.scope.release();
        }
        Ok(descriptor)
    }

    /// Deletes a staged directory after a failed transfer or build.
    pub async fn discard(&self, staged: &StagedProgram) {
        if let Err(e) = fs::remove_dir_all(&staged.dir).await {
            log::warn!(
                "Failed to remove staged program {}: {}",
                staged.dir.display(),
                e
            );
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProgramDescriptor>> {
        self.lock_programs().get(id).cloned()
    }

    /// Deletes the program's directory, then evicts it and cancels its executions.
    /// A failed deletion leaves the program registered.
    pub async fn remove(&self, id: &str) -> Result<(), HubError> {
        let descriptor = self.get(id).ok_or_else(|| HubError::not_found(id))?;
        fs::remove_dir_all(&descriptor.dir).await?;
        let evicted = {
            let mut programs = self.lock_programs();
            match programs.get(id) {
                Some(current) if Arc::ptr_eq(current, &descriptor) => programs.remove(id),
                _ => None,
            }
        };
        match evicted {
            Some(descriptor) => {
                descriptor.scope.release();
                Ok(())
            }
            None => Err(HubError::not_found(id)),
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<ProgramDescriptor>> {
        let mut programs: Vec<_> = self.lock_programs().values().cloned().collect();
        programs.sort_by(|a, b| a.id.cmp(&b.id));
        programs
    }

    pub fn len(&self) -> usize {
        self.lock_programs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::ScopeTree;

    fn flags(language: Language, immediate: bool) -> UploadFlags {
        UploadFlags {
            language,
            immediate,
        }
    }

    #[test]
    fn test_upload_flags_parse() {
        let parsed = UploadFlags::parse(0x83).unwrap();
        assert_eq!(parsed.language, Language::Go);
        assert!(parsed.immediate);

        let parsed = UploadFlags::parse(0x02).unwrap();
        assert_eq!(parsed.language, Language::Python3);
        assert!(!parsed.immediate);

        assert!(matches!(
            UploadFlags::parse(0x04),
            Err(HubError::UnknownType(0x04))
        ));
        assert!(UploadFlags::parse(0x80).is_err());
    }

    #[test]
    fn test_decode_descriptor() {
        assert_eq!(decode_descriptor(&[2, 0]).unwrap(), (Language::Go, false));
        assert_eq!(decode_descriptor(&[0, 1]).unwrap(), (Language::Python2, true));
        assert!(decode_descriptor(&[7, 0]).is_err());
        assert!(decode_descriptor(&[1]).is_err());
    }

    #[tokio::test]
    async fn test_stage_hands_out_distinct_ids() {
        let store = tempfile::tempdir().unwrap();
        let tree = ScopeTree::new();
        let registry = ProgramRegistry::open(store.path(), tree.root()).await.unwrap();

        let first = registry.stage(flags(Language::Go, false)).await.unwrap();
        let second = registry.stage(flags(Language::Go, false)).await.unwrap();
        assert_ne!(first.id, second.id);
        assert!(first.dir.is_dir());
        assert!(second.dir.is_dir());
    }

    #[tokio::test]
    async fn test_commit_persists_and_load_restores() {
        let store = tempfile::tempdir().unwrap();
        let tree = ScopeTree::new();
        let id = {
            let registry = ProgramRegistry::open(store.path(), tree.root()).await.unwrap();
            let staged = registry.stage(flags(Language::Python3, true)).await.unwrap();
            let descriptor = registry.commit(&staged).await.unwrap();
            assert_eq!(
                std::fs::read(descriptor.dir.join(DESCRIPTOR_FILE)).unwrap(),
                vec![1, 1]
            );
            descriptor.id.clone()
        };

        // A stray directory without a descriptor is skipped.
        std::fs::create_dir(store.path().join("garbage")).unwrap();

        let reloaded = ProgramRegistry::load(store.path(), tree.root()).await.unwrap();
        assert_eq!(reloaded.len(), 1);
        let program = reloaded.get(&id).unwrap();
        assert_eq!(program.language, Language::Python3);
        assert!(program.immediate);

        let next = reloaded.stage(flags(Language::Go, false)).await.unwrap();
        assert!(next.id.parse::<i64>().unwrap() > id.parse::<i64>().unwrap());
    }

    #[tokio::test]
    async fn test_remove_deletes_directory_and_cancels_scope() {
        let store = tempfile::tempdir().unwrap();
        let tree = ScopeTree::new();
        let registry = ProgramRegistry::open(store.path(), tree.root()).await.unwrap();
        let staged = registry.stage(flags(Language::Go, false)).await.unwrap();
        let program = registry.commit(&staged).await.unwrap();
        let execution_scope = program.scope.child();

        registry.remove(&program.id).await.unwrap();

        assert!(registry.get(&program.id).is_none());
        assert!(!program.dir.exists());
        assert!(execution_scope.is_cancelled());
        assert!(matches!(
            registry.remove(&program.id).await,
            Err(HubError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_directory_removal_keeps_program() {
        let store = tempfile::tempdir().unwrap();
        let tree = ScopeTree::new();
        let registry = ProgramRegistry::open(store.path(), tree.root()).await.unwrap();
        let staged = registry.stage(flags(Language::Go, false)).await.unwrap();
        let program = registry.commit(&staged).await.unwrap();
        let execution_scope = program.scope.child();

        // A plain file where the directory was makes remove_dir_all fail.
        std::fs::remove_dir_all(&program.dir).unwrap();
        std::fs::write(&program.dir, b"not a directory").unwrap();

        assert!(registry.remove(&program.id).await.is_err());
        assert!(registry.get(&program.id).is_some());
        assert!(!execution_scope.is_cancelled());
    }

    #[tokio::test]
    async fn test_discard_removes_staged_directory() {
        let store = tempfile::tempdir().unwrap();
        let tree = ScopeTree::new();
        let registry = ProgramRegistry::open(store.path(), tree.root()).await.unwrap();
        let staged = registry.stage(flags(Language::Python2, false)).await.unwrap();
        let dir = staged.dir.clone();
        registry.discard(&staged).await;
        assert!(!dir.exists());
        assert!(registry.is_empty());
    }
}
