use conduit_core::ConfigError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Endpoint instances shared by bean id.
///
/// The first request for an id creates the endpoint; later requests with the
/// same parameters get the same instance. Asking for an existing id with
/// different parameters is a bean-scope conflict and nothing is created.
///
/// # Example
///
/// ```
/// use conduit_runtime::context::EndpointCache;
/// use std::collections::BTreeMap;
/// use std::sync::Arc;
///
/// let cache: EndpointCache<String> = EndpointCache::new();
/// let params = BTreeMap::from([("limit".to_string(), "5".to_string())]);
///
/// let first = cache.get_or_create("audit", &params, || "endpoint".to_string()).unwrap();
/// let second = cache.get_or_create("audit", &params, || unreachable!()).unwrap();
/// assert!(Arc::ptr_eq(&first, &second));
///
/// let other = BTreeMap::from([("limit".to_string(), "10".to_string())]);
/// assert!(cache.get_or_create("audit", &other, || "endpoint".to_string()).is_err());
/// ```
#[derive(Debug)]
pub struct EndpointCache<T> {
    entries: DashMap<String, (BTreeMap<String, String>, Arc<T>)>,
}

impl<T> Default for EndpointCache<T> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<T> EndpointCache<T> {
    /// An empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The endpoint for `id`, created by `create` on first use.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BeanScopeConflict`] if `id` is cached with
    /// different parameters.
    pub fn get_or_create<F>(&self, id: &str, params: &BTreeMap<String, String>, create: F) -> Result<Arc<T>, ConfigError>
    where
        F: FnOnce() -> T,
    {
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(entry) => {
                let (cached_params, endpoint) = entry.get();
                if cached_params != params {
                    tracing::warn!(bean_id = id, "Endpoint requested with conflicting parameters");
                    return Err(ConfigError::BeanScopeConflict { id: id.to_string() });
                }
                Ok(Arc::clone(endpoint))
            },
            Entry::Vacant(entry) => {
                let endpoint = Arc::new(create());
                entry.insert((params.clone(), Arc::clone(&endpoint)));
                Ok(endpoint)
            },
        }
    }

    /// A cached endpoint.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.entries.get(id).map(|entry| Arc::clone(&entry.value().1))
    }

    /// Number of cached endpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
