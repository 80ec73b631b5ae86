use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::WorkerError;

/// Heap size in whole mebibytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HeapSize(u64);

impl HeapSize {
    pub const fn from_mb(mb: u64) -> Self {
        Self(mb)
    }

    pub const fn as_mb(&self) -> u64 {
        self.0
    }
}

impl FromStr for HeapSize {
    type Err = WorkerError;

    /// `"512m"`, `"2g"`, `"1024k"`, `"1t"` (case insensitive); a bare number
    /// is bytes. Partial mebibytes round up.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || WorkerError::Config(format!("invalid heap size '{s}'"));
        if s.is_empty() {
            return Err(invalid());
        }
        let (digits, unit) = match s.char_indices().last() {
            Some((idx, c)) if c.is_ascii_alphabetic() => (&s[..idx], c.to_ascii_lowercase()),
            _ => (s, 'b'),
        };
        let amount: u64 = digits.parse().map_err(|_| invalid())?;
        let kib = |kib: u64| kib.div_ceil(1024);
        let mb = match unit {
            'b' => amount.div_ceil(1024 * 1024),
            'k' => kib(amount),
            'm' => amount,
            'g' => amount.checked_mul(1024).ok_or_else(invalid)?,
            't' => amount.checked_mul(1024 * 1024).ok_or_else(invalid)?,
            _ => return Err(invalid()),
        };
        Ok(Self(mb))
    }
}

impl fmt::Display for HeapSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}m", self.0)
    }
}

impl TryFrom<String> for HeapSize {
    type Error = WorkerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HeapSize> for String {
    fn from(value: HeapSize) -> Self {
        value.to_string()
    }
}

/// What a unit of work needs from the worker that runs it. A running worker
/// can serve a request when its own options are compatible with (cover) the
/// request's options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonForkOptions {
    #[serde(default)]
    pub min_heap: Option<HeapSize>,
    #[serde(default)]
    pub max_heap: Option<HeapSize>,
    #[serde(default)]
    pub process_args: Vec<String>,
    #[serde(default)]
    pub classpath: Vec<String>,
    #[serde(default)]
    pub shared_packages: BTreeSet<String>,
}

impl DaemonForkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_heap(mut self, min: Option<&str>, max: Option<&str>) -> Result<Self, WorkerError> {
        self.min_heap = min.map(str::parse).transpose()?;
        self.max_heap = max.map(str::parse).transpose()?;
        Ok(self)
    }

    pub fn with_process_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.process_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_classpath<I, S>(mut self, classpath: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.classpath = classpath.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_shared_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shared_packages = packages.into_iter().map(Into::into).collect();
        self
    }

    pub fn min_heap_mb(&self) -> Option<u64> {
        self.min_heap.map(|h| h.as_mb())
    }

    pub fn max_heap_mb(&self) -> Option<u64> {
        self.max_heap.map(|h| h.as_mb())
    }

    /// True when a worker started with `self` can run work requiring `other`:
    /// heaps at least as large (an unset heap is smaller than any set one) and
    /// every arg, classpath entry and shared package present.
    pub fn is_compatible_with(&self, other: &DaemonForkOptions) -> bool {
        self.min_heap >= other.min_heap
            && self.max_heap >= other.max_heap
            && contains_all(&self.process_args, &other.process_args)
            && contains_all(&self.classpath, &other.classpath)
            && other.shared_packages.is_subset(&self.shared_packages)
    }

    /// Options compatible with both `self` and `other`.
    pub fn merge_with(&self, other: &DaemonForkOptions) -> DaemonForkOptions {
        DaemonForkOptions {
            min_heap: self.min_heap.max(other.min_heap),
            max_heap: self.max_heap.max(other.max_heap),
            process_args: union(&self.process_args, &other.process_args),
            classpath: union(&self.classpath, &other.classpath),
            shared_packages: self
                .shared_packages
                .union(&other.shared_packages)
                .cloned()
                .collect(),
        }
    }
}

fn contains_all(have: &[String], want: &[String]) -> bool {
    let have: BTreeSet<&String> = have.iter().collect();
    want.iter().all(|item| have.contains(item))
}

fn union(first: &[String], second: &[String]) -> Vec<String> {
    let mut out = first.to_vec();
    for item in second {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

impl fmt::Display for DaemonForkOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let heap = |h: Option<HeapSize>| h.map_or_else(|| "-".to_string(), |h| h.to_string());
        write!(
            f,
            "heap={}..{} args={:?} classpath={:?} shared={:?}",
            heap(self.min_heap),
            heap(self.max_heap),
            self.process_args,
            self.classpath,
            self.shared_packages
        )
    }
}
