use std::{ collections::BTreeSet, fmt };

use crate::{ errors::CpuSetError, sys };

/// Number of logical cpus on the host.
///
/// Queried once with [`HostCpus::detect`] and then passed around by value, so
/// every [`CpuSet`] is validated against the same count for the lifetime of the
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostCpus {
    logical_cpus: usize,
}

impl HostCpus {
    /// Ask the operating system how many logical cpus are online.
    pub fn detect() -> Self {
        let logical_cpus = sys::online_cpus();
        log::trace!("Host has {} logical cpus", logical_cpus);
        Self { logical_cpus }
    }

    /// A host with exactly `logical_cpus` cpus. Mostly useful in tests.
    pub const fn new(logical_cpus: usize) -> Self {
        Self { logical_cpus }
    }

    pub const fn logical_cpus(&self) -> usize {
        self.logical_cpus
    }
}

/// An immutable, non-empty set of logical cpu ids a thread may run on.
///
/// Every id is below the [`HostCpus`] count the set was built against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CpuSet {
    ids: BTreeSet<usize>,
}

impl CpuSet {
    /// Build a set from `ids`.
    ///
    /// # Panics
    ///
    /// If `ids` is empty or any id is not below `host.logical_cpus()`. Both are
    /// configuration mistakes; use [`CpuSet::try_new`] to handle them instead.
    pub fn new(ids: impl IntoIterator<Item = usize>, host: HostCpus) -> Self {
        match Self::try_new(ids, host) {
            Ok(set) => set,
            Err(err) => panic!("invalid cpu set: {}", err),
        }
    }

    /// Build a set holding only `id`. Panics like [`CpuSet::new`].
    pub fn single(id: usize, host: HostCpus) -> Self {
        Self::new([id], host)
    }

    pub fn try_new(ids: impl IntoIterator<Item = usize>, host: HostCpus) -> Result<Self, CpuSetError> {
        let ids = ids.into_iter().collect::<BTreeSet<_>>();
        if ids.is_empty() {
            return Err(CpuSetError::Empty);
        }

        // ids are sorted, checking the largest one is enough
        if let Some(&id) = ids.last() {
            if id >= host.logical_cpus() {
                return Err(CpuSetError::OutOfRange {
                    id,
                    logical_cpus: host.logical_cpus(),
                });
            }
        }

        Ok(Self { ids })
    }

    pub fn try_single(id: usize, host: HostCpus) -> Result<Self, CpuSetError> {
        Self::try_new([id], host)
    }

    pub fn ids(&self) -> &BTreeSet<usize> {
        &self.ids
    }

    /// Cpu ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.ids.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// A set is never empty once built, so this only ever returns `false`.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: usize) -> bool {
        self.ids.contains(&id)
    }
}

impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, id) in self.ids.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", id)?;
        }
        write!(f, "}}")
    }
}
