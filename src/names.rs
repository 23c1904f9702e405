use std::collections::{BTreeMap, HashMap};

use crate::error::MetadataError;
use crate::types::{ClassId, FrameContext, MetadataSource, MethodId};

pub const UNKNOWN_NATIVE_FUNCTION: &str = "Unknown_Native_Function";
pub const UNRESOLVED_FUNCTION: &str = "Unknown::UnresolvedFunction";
pub const SHARED_GENERIC_FUNCTION: &str = "SharedGenericFunction";
pub const ARRAY_CLASS: &str = "ArrayClass";
pub const COMPOSITE_CLASS: &str = "CompositeClass";
pub const DATA_INCOMPLETE: &str = "DataIncomplete";
pub const UNKNOWN_CLASS: &str = "Unknown";

struct CachedName {
    name: String,
    last_used: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

/// Memoizes method names for a sampling session.
///
/// Bounded: once `capacity` names are held, the least recently used one is evicted to make
/// room. Names are never invalidated otherwise, so a method redefined mid-session keeps its old
/// name until evicted.
///
/// Lookups run while the runtime is frozen, so eviction must not scan the cache.
pub struct NameCache {
    names: HashMap<MethodId, CachedName>,
    /// Last-use tick of every cached method, oldest first. Ticks are unique.
    recency: BTreeMap<u64, MethodId>,
    capacity: usize,
    tick: u64,
    stats: NameCacheStats,
}

impl NameCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        NameCache {
            names: HashMap::with_capacity(capacity.min(1024)),
            recency: BTreeMap::new(),
            capacity,
            tick: 0,
            stats: NameCacheStats::default(),
        }
    }

    /// Returns the qualified name for `method`, looking it up in `source` on a miss.
    ///
    /// Never fails: lookups that go wrong produce a fixed placeholder name instead.
    pub fn resolve<M: MetadataSource + ?Sized>(
        &mut self,
        source: &M,
        method: MethodId,
        context: FrameContext,
    ) -> &str {
        self.tick += 1;
        let tick = self.tick;

        if self.names.contains_key(&method) {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
            if self.names.len() >= self.capacity {
                self.evict_one();
            }
            let name = lookup_name(source, method, context);
            self.names.insert(
                method,
                CachedName {
                    name,
                    last_used: tick,
                },
            );
        }

        match self.names.get_mut(&method) {
            Some(cached) => {
                self.recency.remove(&cached.last_used);
                self.recency.insert(tick, method);
                cached.last_used = tick;
                cached.name.as_str()
            }
            None => UNRESOLVED_FUNCTION,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn stats(&self) -> NameCacheStats {
        NameCacheStats {
            entries: self.names.len(),
            ..self.stats
        }
    }

    fn evict_one(&mut self) {
        let oldest = self.recency.keys().next().copied();
        if let Some(method) = oldest.and_then(|tick| self.recency.remove(&tick)) {
            self.names.remove(&method);
            self.stats.evictions += 1;
        }
    }

    /// Whether `method` is cached, without counting as a use.
    pub fn contains(&self, method: MethodId) -> bool {
        self.names.contains_key(&method)
    }
}

fn lookup_name<M: MetadataSource + ?Sized>(
    source: &M,
    method: MethodId,
    context: FrameContext,
) -> String {
    if method.is_native() {
        return UNKNOWN_NATIVE_FUNCTION.to_string();
    }
    let info = match source.method_info(method, context) {
        Ok(info) => info,
        Err(_) => return UNRESOLVED_FUNCTION.to_string(),
    };
    let class = match info.class {
        Some(class) => class_name(source, class),
        None => SHARED_GENERIC_FUNCTION.to_string(),
    };
    // TODO: add the signature so overloads can be told apart.
    format!("{}::{}", class, info.name)
}

fn class_name<M: MetadataSource + ?Sized>(source: &M, class: ClassId) -> String {
    match source.type_name(class) {
        Ok(name) => name,
        Err(MetadataError::ClassIsArray) => ARRAY_CLASS.to_string(),
        Err(MetadataError::ClassIsComposite) => COMPOSITE_CLASS.to_string(),
        Err(MetadataError::DataIncomplete) => DATA_INCOMPLETE.to_string(),
        Err(MetadataError::NotFound) | Err(MetadataError::Runtime(_)) => UNKNOWN_CLASS.to_string(),
    }
}
