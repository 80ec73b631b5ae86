use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::error::PayloadError;

/// Package of framework-internal placeholder types. Classes in this package are
/// always written with classloader id 0 and resolved from the system loader.
pub const PLACEHOLDER_PACKAGE: &str = "wpx.internal.placeholder";

/// Stands in for an error whose own class cannot be loaded by the receiver.
pub const PLACEHOLDER_ERROR_CLASS: &str = "wpx.internal.placeholder.PlaceholderError";

/// Raised by a worker when its environment, not the invoked code, is broken.
pub const INFRASTRUCTURE_ERROR_CLASS: &str = "wpx.internal.WorkerInfrastructureError";

pub const ILLEGAL_STATE_CLASS: &str = "wpx.lang.IllegalStateException";
pub const ILLEGAL_ARGUMENT_CLASS: &str = "wpx.lang.IllegalArgumentException";
pub const RUNTIME_ERROR_CLASS: &str = "wpx.lang.RuntimeException";
pub const PANIC_CLASS: &str = "wpx.lang.Panic";
pub const STREAM_FAILURE_CLASS: &str = "wpx.internal.StreamFailure";

/// Types every wpx process defines on its system loader.
pub const SYSTEM_TYPES: &[&str] = &[
    PLACEHOLDER_ERROR_CLASS,
    INFRASTRUCTURE_ERROR_CLASS,
    STREAM_FAILURE_CLASS,
    ILLEGAL_STATE_CLASS,
    ILLEGAL_ARGUMENT_CLASS,
    RUNTIME_ERROR_CLASS,
    PANIC_CLASS,
    "wpx.compile.CompileSpec",
    "wpx.compile.WorkResult",
];

static NEXT_LOADER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a live loader inside this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoaderId(u64);

impl LoaderId {
    fn next() -> Self {
        LoaderId(NEXT_LOADER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// How a receiving process reconstructs a loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassLoaderSpec {
    /// The receiving process's own system loader.
    System,
    /// A named loader over a fixed, ordered classpath.
    Classpath { name: String, classpath: Vec<String> },
    /// A loader owned by the client whose classpath may grow between requests.
    ClientOwned { classpath: BTreeSet<String> },
}

impl ClassLoaderSpec {
    fn kind(&self) -> &'static str {
        match self {
            ClassLoaderSpec::System => "system",
            ClassLoaderSpec::Classpath { .. } => "classpath",
            ClassLoaderSpec::ClientOwned { .. } => "client-owned",
        }
    }
}

/// Serializable description of a loader: identity, construction spec and
/// ordered parents. Two details are the same loader when their uuids match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassLoaderDetails {
    pub uuid: Uuid,
    pub spec: ClassLoaderSpec,
    #[serde(default)]
    pub parents: Vec<ClassLoaderDetails>,
}

impl PartialEq for ClassLoaderDetails {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
    }
}

impl Eq for ClassLoaderDetails {}

impl std::hash::Hash for ClassLoaderDetails {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.uuid.hash(state);
    }
}

/// Answers whether a classpath entry defines a type.
pub trait TypeSource: Send + Sync + fmt::Debug {
    fn defines(&self, entry: &str, class_name: &str) -> bool;
}

/// A classpath entry is a directory; `a.b.C` is defined by `a/b/C.type`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectoryTypeSource;

impl DirectoryTypeSource {
    pub fn type_file(entry: &Path, class_name: &str) -> PathBuf {
        let mut path = entry.to_path_buf();
        for part in class_name.split('.') {
            path.push(part);
        }
        path.set_extension("type");
        path
    }
}

impl TypeSource for DirectoryTypeSource {
    fn defines(&self, entry: &str, class_name: &str) -> bool {
        if class_name.is_empty() || class_name.contains("..") || class_name.contains('/') {
            return false;
        }
        Self::type_file(Path::new(entry), class_name).is_file()
    }
}

/// In-memory type source keyed by classpath entry.
#[derive(Debug, Default)]
pub struct StaticTypeSource {
    entries: HashMap<String, HashSet<String>>,
}

impl StaticTypeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_types<I, S>(mut self, entry: &str, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entries
            .entry(entry.to_string())
            .or_default()
            .extend(types.into_iter().map(Into::into));
        self
    }
}

impl TypeSource for StaticTypeSource {
    fn defines(&self, entry: &str, class_name: &str) -> bool {
        self.entries
            .get(entry)
            .is_some_and(|types| types.contains(class_name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LoaderKind {
    System,
    Named(String),
    ClientOwned,
}

/// A live type namespace. Resolution is parent-first, then the loader's own
/// classpath through its [`TypeSource`].
pub struct ClassLoader {
    id: LoaderId,
    kind: LoaderKind,
    parents: Vec<Arc<ClassLoader>>,
    classpath: RwLock<Vec<String>>,
    builtin: HashSet<String>,
    source: Arc<dyn TypeSource>,
}

impl fmt::Debug for ClassLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassLoader")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("parents", &self.parents.iter().map(|p| p.id).collect::<Vec<_>>())
            .field("classpath", &self.classpath())
            .finish()
    }
}

impl fmt::Display for ClassLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            LoaderKind::System => write!(f, "system#{}", self.id.0),
            LoaderKind::Named(name) => write!(f, "{name}#{}", self.id.0),
            LoaderKind::ClientOwned => write!(f, "client-owned#{}", self.id.0),
        }
    }
}

impl ClassLoader {
    /// The process's system loader: [`SYSTEM_TYPES`] plus its own classpath.
    pub fn system(classpath: Vec<String>, source: Arc<dyn TypeSource>) -> Arc<Self> {
        Arc::new(Self {
            id: LoaderId::next(),
            kind: LoaderKind::System,
            parents: Vec::new(),
            classpath: RwLock::new(classpath),
            builtin: SYSTEM_TYPES.iter().map(|s| s.to_string()).collect(),
            source,
        })
    }

    pub fn classpath_loader(
        name: impl Into<String>,
        classpath: Vec<String>,
        parents: Vec<Arc<ClassLoader>>,
        source: Arc<dyn TypeSource>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: LoaderId::next(),
            kind: LoaderKind::Named(name.into()),
            parents,
            classpath: RwLock::new(classpath),
            builtin: HashSet::new(),
            source,
        })
    }

    pub fn client_owned(
        classpath: impl IntoIterator<Item = String>,
        parents: Vec<Arc<ClassLoader>>,
        source: Arc<dyn TypeSource>,
    ) -> Arc<Self> {
        let classpath: BTreeSet<String> = classpath.into_iter().collect();
        Arc::new(Self {
            id: LoaderId::next(),
            kind: LoaderKind::ClientOwned,
            parents,
            classpath: RwLock::new(classpath.into_iter().collect()),
            builtin: HashSet::new(),
            source,
        })
    }

    pub fn id(&self) -> LoaderId {
        self.id
    }

    pub fn parents(&self) -> &[Arc<ClassLoader>] {
        &self.parents
    }

    pub fn is_system(&self) -> bool {
        self.kind == LoaderKind::System
    }

    pub fn is_client_owned(&self) -> bool {
        self.kind == LoaderKind::ClientOwned
    }

    pub fn classpath(&self) -> Vec<String> {
        self.classpath
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Snapshot of how to rebuild this loader elsewhere.
    pub fn spec(&self) -> ClassLoaderSpec {
        match &self.kind {
            LoaderKind::System => ClassLoaderSpec::System,
            LoaderKind::Named(name) => ClassLoaderSpec::Classpath {
                name: name.clone(),
                classpath: self.classpath(),
            },
            LoaderKind::ClientOwned => ClassLoaderSpec::ClientOwned {
                classpath: self.classpath().into_iter().collect(),
            },
        }
    }

    /// Adds entries not already present. Classes resolved earlier keep their
    /// original loader; only later lookups see the new entries.
    pub fn append_classpath<'a>(&self, entries: impl IntoIterator<Item = &'a String>) -> usize {
        let mut classpath = self
            .classpath
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut added = 0;
        for entry in entries {
            if !classpath.contains(entry) {
                classpath.push(entry.clone());
                added += 1;
            }
        }
        added
    }

    fn defines_locally(&self, class_name: &str) -> bool {
        if self.builtin.contains(class_name) {
            return true;
        }
        let classpath = self
            .classpath
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        classpath
            .iter()
            .any(|entry| self.source.defines(entry, class_name))
    }

    fn find_defining(self: &Arc<Self>, class_name: &str) -> Option<Arc<ClassLoader>> {
        for parent in &self.parents {
            if let Some(found) = parent.find_defining(class_name) {
                return Some(found);
            }
        }
        if self.defines_locally(class_name) {
            return Some(Arc::clone(self));
        }
        None
    }

    /// Resolves `class_name` through this loader. The returned class carries the
    /// loader that actually defines it, which may be an ancestor.
    pub fn load_class(self: &Arc<Self>, class_name: &str) -> Result<Class, PayloadError> {
        match self.find_defining(class_name) {
            Some(loader) => Ok(Class {
                name: Arc::from(class_name),
                loader,
            }),
            None => Err(PayloadError::ClassNotFound {
                class_name: class_name.to_string(),
                loader: format!("{} ({})", self, self.spec().kind()),
            }),
        }
    }
}

/// A type name bound to the loader that defines it.
#[derive(Clone)]
pub struct Class {
    name: Arc<str>,
    loader: Arc<ClassLoader>,
}

impl Class {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn loader(&self) -> &Arc<ClassLoader> {
        &self.loader
    }

    pub fn package(&self) -> &str {
        self.name.rsplit_once('.').map(|(pkg, _)| pkg).unwrap_or("")
    }

    pub fn is_placeholder(&self) -> bool {
        self.package() == PLACEHOLDER_PACKAGE
    }
}

impl PartialEq for Class {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && Arc::ptr_eq(&self.loader, &other.loader)
    }
}

impl Eq for Class {}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.loader)
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
