//! Cursor-based iteration over multi-page endpoints.

use crate::{
    action::HandlerFn,
    client::Client,
    error::Error,
    response::RestResponse,
    routing::CompiledRoute,
};
use serde::de::DeserializeOwned;
use std::{
    collections::VecDeque,
    fmt::{Debug, Formatter, Result as FmtResult},
    sync::{Arc, Mutex},
};

/// What a page route needs to know: the continuation cursor and the page
/// size.
#[derive(Clone, Copy, Debug)]
pub struct PageQuery {
    /// Key of the entry to continue after, `None` on the first page.
    pub cursor: Option<u64>,
    /// Requested page size.
    pub limit: u64,
}

/// Bounds on the page size of a paginated endpoint.
#[derive(Clone, Copy, Debug)]
pub struct PageLimits {
    /// Largest allowed page size.
    pub max: u64,
    /// Smallest allowed page size.
    pub min: u64,
    /// Page size used until [`Paginator::limit`] changes it.
    pub start: u64,
}

impl PageLimits {
    /// Create bounds from their parts.
    pub const fn new(min: u64, start: u64, max: u64) -> Self {
        Self { max, min, start }
    }
}

struct PageState<T> {
    cached: Vec<T>,
    iterator_index: Option<u64>,
    last: Option<T>,
    last_key: Option<u64>,
    limit: u64,
    use_cache: bool,
}

struct Inner<T> {
    client: Client,
    get_key: fn(&T) -> u64,
    limits: PageLimits,
    parse: HandlerFn<Vec<T>>,
    route: Box<dyn Fn(PageQuery) -> Result<CompiledRoute, Error> + Send + Sync>,
    state: Mutex<PageState<T>>,
}

/// Iterator over a cursor-paged endpoint.
///
/// Each page is fetched through the regular scheduler; the paginator keeps
/// the continuation cursor, the most recently observed entry, and (when
/// enabled) a local cache of everything seen so far. With the cache on, no
/// key is ever yielded twice.
///
/// Cheap to clone; clones share the cursor and cache.
pub struct Paginator<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Paginator<T>
where
    T: Clone + DeserializeOwned + Send + 'static,
{
    /// Create a paginator over an endpoint.
    ///
    /// `route` produces the page request from the current cursor and page
    /// size, typically by compiling a route and appending the cursor query
    /// parameter. `get_key` extracts the ordering key the cursor is based
    /// on.
    pub fn new(
        client: Client,
        limits: PageLimits,
        route: impl Fn(PageQuery) -> Result<CompiledRoute, Error> + Send + Sync + 'static,
        get_key: fn(&T) -> u64,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                get_key,
                limits,
                parse: Arc::new(|response: RestResponse| response.model::<Vec<T>>()),
                route: Box::new(route),
                state: Mutex::new(PageState {
                    cached: Vec::new(),
                    iterator_index: None,
                    last: None,
                    last_key: None,
                    limit: limits.start,
                    use_cache: false,
                }),
            }),
        }
    }

    /// Set the page size, clamped to the endpoint's bounds.
    pub fn limit(&self, limit: u64) -> &Self {
        let clamped = limit.clamp(self.inner.limits.min, self.inner.limits.max);
        self.state().limit = clamped;

        self
    }

    /// Enable or disable the local cache of seen entries.
    pub fn cache(&self, enabled: bool) -> &Self {
        self.state().use_cache = enabled;

        self
    }

    /// Move the cursor to `id`.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorType::InvalidArgument`] error type if entries are
    /// cached and `id` is newer (greater, unsigned) than the oldest cached
    /// key, i.e. the cursor would jump back into already-cached territory.
    ///
    /// [`ErrorType::InvalidArgument`]: crate::error::ErrorType::InvalidArgument
    pub fn skip_to(&self, id: u64) -> Result<(), Error> {
        let mut state = self.state();

        if !state.cached.is_empty() {
            let oldest = state
                .cached
                .iter()
                .map(|entry| (self.inner.get_key)(entry))
                .min()
                .unwrap_or(u64::MAX);

            if id > oldest {
                return Err(Error::invalid_argument(format!(
                    "cannot skip to {id}: oldest cached key is {oldest}",
                )));
            }
        }

        if state.last_key != Some(id) {
            state.last = None;
        }

        state.iterator_index = Some(id);
        state.last_key = Some(id);

        Ok(())
    }

    /// First cached entry, if the cache holds any.
    pub fn first(&self) -> Option<T> {
        self.state().cached.first().cloned()
    }

    /// Most recently observed entry.
    pub fn last(&self) -> Option<T> {
        self.state().last.clone()
    }

    /// Snapshot of the cached entries.
    pub fn cached(&self) -> Vec<T> {
        self.state().cached.clone()
    }

    /// The current continuation cursor, `None` before the first page and
    /// strictly "not found" rather than any sentinel value.
    pub fn iterator_index(&self) -> Option<u64> {
        self.state().iterator_index
    }

    /// Fetch the next page, advancing the cursor.
    ///
    /// With the cache enabled, entries whose key was already seen are
    /// dropped from the returned page. An empty page means the endpoint is
    /// exhausted.
    ///
    /// # Errors
    ///
    /// Propagates route production and request failures.
    pub async fn next_page(&self) -> Result<Vec<T>, Error> {
        let (route, known) = self.prepare()?;

        let page = self
            .inner
            .client
            .with_handler(route, Arc::clone(&self.inner.parse))
            .submit()
            .await?;

        Ok(self.integrate(page, known))
    }

    /// Run `action` for every remaining entry; a `false` return stops the
    /// iteration early.
    ///
    /// # Errors
    ///
    /// Propagates the first page fetch failure.
    pub async fn for_each_remaining(
        &self,
        mut action: impl FnMut(&T) -> bool,
    ) -> Result<(), Error> {
        loop {
            let page = self.next_page().await?;

            if page.is_empty() {
                return Ok(());
            }

            for entry in &page {
                if !action(entry) {
                    return Ok(());
                }
            }
        }
    }

    /// Spawned variant of [`for_each_remaining`]: runs on the callback
    /// pool, reporting a failure to `on_failure`.
    ///
    /// [`for_each_remaining`]: Self::for_each_remaining
    pub fn for_each_remaining_async(
        &self,
        action: impl FnMut(&T) -> bool + Send + 'static,
        on_failure: impl FnOnce(Error) + Send + 'static,
    ) {
        let paginator = self.clone();

        self.inner.client.callback_handle().spawn(async move {
            if let Err(error) = paginator.for_each_remaining(action).await {
                on_failure(error);
            }
        });
    }

    /// Collect up to `amount` entries starting at the current cursor.
    ///
    /// # Errors
    ///
    /// Propagates the first page fetch failure.
    pub async fn take_async(&self, amount: usize) -> Result<Vec<T>, Error> {
        let mut taken = Vec::new();

        while taken.len() < amount {
            let page = self.next_page().await?;

            if page.is_empty() {
                break;
            }

            for entry in page {
                if taken.len() == amount {
                    break;
                }

                taken.push(entry);
            }
        }

        Ok(taken)
    }

    /// Collect the remaining entries, up to `amount`.
    ///
    /// # Errors
    ///
    /// Propagates the first page fetch failure.
    pub async fn take_remaining_async(&self, amount: usize) -> Result<Vec<T>, Error> {
        self.take_async(amount).await
    }

    /// Blocking iterator over all remaining entries.
    ///
    /// Built on [`RestAction::complete`], so it may only be used outside
    /// the async runtime.
    ///
    /// [`RestAction::complete`]: crate::action::RestAction::complete
    pub fn iter(&self) -> PaginatorIter<'_, T> {
        PaginatorIter {
            buffer: VecDeque::new(),
            finished: false,
            paginator: self,
        }
    }

    fn next_page_blocking(&self) -> Result<Vec<T>, Error> {
        let (route, known) = self.prepare()?;

        let page = self
            .inner
            .client
            .with_handler(route, Arc::clone(&self.inner.parse))
            .complete()?;

        Ok(self.integrate(page, known))
    }

    /// Produce the page route and, with the cache on, the keys already
    /// seen.
    fn prepare(&self) -> Result<(CompiledRoute, Option<Vec<u64>>), Error> {
        let state = self.state();

        let query = PageQuery {
            cursor: state.iterator_index,
            limit: state.limit,
        };
        let route = (self.inner.route)(query)?;

        let known = state.use_cache.then(|| {
            state
                .cached
                .iter()
                .map(|entry| (self.inner.get_key)(entry))
                .collect::<Vec<_>>()
        });

        Ok((route, known))
    }

    /// Advance the cursor from the raw page and fold new entries into the
    /// cache.
    fn integrate(&self, page: Vec<T>, known: Option<Vec<u64>>) -> Vec<T> {
        let mut state = self.state();

        if let Some(last_entry) = page.last() {
            let key = (self.inner.get_key)(last_entry);
            state.last = Some(last_entry.clone());
            state.last_key = Some(key);
            state.iterator_index = Some(key);
        }

        // Drop keys already cached or already emitted earlier in this same
        // page.
        let fresh: Vec<T> = match known {
            Some(mut seen) => page
                .into_iter()
                .filter(|entry| {
                    let key = (self.inner.get_key)(entry);

                    if seen.contains(&key) {
                        return false;
                    }

                    seen.push(key);

                    true
                })
                .collect(),
            None => page,
        };

        if state.use_cache {
            state.cached.extend(fresh.iter().cloned());
        }

        fresh
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PageState<T>> {
        self.inner.state.lock().expect("paginator state poisoned")
    }
}

impl<T> Clone for Paginator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Paginator<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Paginator")
            .field("limits", &self.inner.limits)
            .finish_non_exhaustive()
    }
}

/// Blocking iterator returned by [`Paginator::iter`].
#[derive(Debug)]
pub struct PaginatorIter<'a, T> {
    buffer: VecDeque<T>,
    finished: bool,
    paginator: &'a Paginator<T>,
}

impl<T> Iterator for PaginatorIter<'_, T>
where
    T: Clone + DeserializeOwned + Send + 'static,
{
    type Item = Result<T, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(entry) = self.buffer.pop_front() {
            return Some(Ok(entry));
        }

        if self.finished {
            return None;
        }

        match self.paginator.next_page_blocking() {
            Ok(page) if page.is_empty() => {
                self.finished = true;

                None
            }
            Ok(page) => {
                self.buffer.extend(page);

                self.buffer.pop_front().map(Ok)
            }
            Err(error) => {
                self.finished = true;

                Some(Err(error))
            }
        }
    }
}
