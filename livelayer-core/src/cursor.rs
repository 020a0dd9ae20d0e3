//! Cursors: a query plus a post-processing pipeline.
//!
//! A [`Cursor`] retrieves candidate documents from its collection, keeps the ones its
//! selector matches, sorts them, applies `skip`/`limit` and finally feeds the result through
//! a pipeline of user stages (filter, map, reduce, aggregate, joins).
//!
//! # Overview
//!
//! Pipeline data is a [`Bson`] value. It starts as an array of the matched documents, and
//! stages are free to reshape it: `reduce` and `aggregate` typically turn the array into a
//! scalar or a document. Documents handed to the pipeline are copies, so stages never
//! observe or corrupt stored data.
//!
//! A cursor is immutable while it executes. Every configuration call made while an
//! execution is outstanding fails with [`DocumentStoreError::CursorExecuting`].
//!
//! # Example
//!
//! ```ignore
//! use livelayer::prelude::*;
//! use bson::doc;
//!
//! let names = collection
//!     .find(doc! { "age": { "$gte": 18 } })?
//!     .sort(doc! { "age": -1 })?
//!     .limit(10)?
//!     .map(|user| user.as_document().and_then(|d| d.get("name")).cloned().unwrap_or(Bson::Null))?
//!     .exec()
//!     .await?;
//! ```

use std::{
    cmp::Ordering,
    fmt,
    future::Future,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering as AtomicOrdering},
    },
};
use bson::{Bson, Document, de::deserialize_from_bson};
use futures::{
    FutureExt,
    future::{BoxFuture, try_join_all},
};
use serde::de::DeserializeOwned;

use crate::{
    collection::Collection,
    error::{DocumentStoreError, DocumentStoreResult},
    index::IdKey,
    matcher::{Matcher, Selector},
    observable::{ObserverId, ParentLink, Schedule, Stopper},
    sorter::{Distances, SortSpec, Sorter},
    value::{BsonType, try_sort_by},
};

/// Keeps the pipeline values a predicate accepts.
pub type FilterFn = Arc<dyn Fn(&Bson) -> bool + Send + Sync>;
/// Orders pipeline values.
pub type CompareFn = Arc<dyn Fn(&Bson, &Bson) -> Ordering + Send + Sync>;
/// Transforms one pipeline value.
pub type MapFn = Arc<dyn Fn(Bson) -> Bson + Send + Sync>;
/// Folds pipeline values into an accumulator.
pub type ReduceFn = Arc<dyn Fn(Bson, Bson) -> Bson + Send + Sync>;
/// Transforms the whole pipeline data at once.
pub type AggregateFn = Arc<dyn Fn(Bson) -> Bson + Send + Sync>;
/// Asynchronously enriches a value, typically with the results of other cursors.
pub type JoinFn = Arc<dyn Fn(Bson, JoinContext) -> BoxFuture<'static, DocumentStoreResult<Bson>> + Send + Sync>;


#[derive(Clone)]
enum Stage {
    Filter(FilterFn),
    SortBy(CompareFn),
    Map(MapFn),
    Reduce(ReduceFn, Bson),
    Aggregate(AggregateFn),
    Join(JoinFn),
    JoinEach(JoinFn),
    JoinAll(JoinFn),
    IfNotEmpty,
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::Filter(_) => "filter",
            Stage::SortBy(_) => "sort_by",
            Stage::Map(_) => "map",
            Stage::Reduce(..) => "reduce",
            Stage::Aggregate(_) => "aggregate",
            Stage::Join(_) => "join",
            Stage::JoinEach(_) => "join_each",
            Stage::JoinAll(_) => "join_all",
            Stage::IfNotEmpty => "if_not_empty",
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of one pipeline stage.
enum Flow {
    Continue(Bson),
    Stop,
}

/// Handed to join functions.
///
/// Identifies the position of the joined value and, when the joining cursor is observed,
/// links child observations to it.
#[derive(Clone, Debug)]
pub struct JoinContext {
    index: usize,
    len: usize,
    link: Option<ParentLink>,
}

impl JoinContext {
    /// Position of the joined value in the pipeline data.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of values joined by the same stage.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the joining cursor is observed.
    pub fn is_observed(&self) -> bool {
        self.link.is_some()
    }

    /// Asks the observation of the joining cursor to re-emit its latest result.
    ///
    /// Does nothing when the joining cursor is not observed.
    pub fn propagate(&self) {
        if let Some(link) = &self.link {
            link.propagate();
        }
    }

    /// Links a child observation to the joining cursor.
    ///
    /// The child's later updates propagate to the joining cursor, and the child is stopped
    /// when the joining cursor's observation stops or its result changes. Without an
    /// observed joining cursor the child is left alone.
    pub fn adopt(&self, child: &Stopper) {
        if let Some(link) = &self.link {
            link.adopt(child);
        }
    }

    /// Edits the latest emitted result of the joining cursor at this join's position.
    ///
    /// When the latest result is an array holding this position, `patch` receives that
    /// element; otherwise it receives the whole result. Does nothing when the cursor is not
    /// observed or has not produced a result yet.
    pub fn patch_latest<F>(&self, patch: F)
    where
        F: FnOnce(&mut Bson),
    {
        if let Some(link) = &self.link {
            link.patch_latest(self.index, patch);
        }
    }
}

struct Query {
    selector: Selector,
    sort: Option<SortSpec>,
    skip: usize,
    limit: usize,
    matcher: Arc<Matcher>,
    sorter: Option<Arc<Sorter>>,
    pipeline: Vec<Stage>,
}

/// A snapshot of the query taken when an execution starts.
struct Plan {
    matcher: Arc<Matcher>,
    sorter: Option<Arc<Sorter>>,
    skip: usize,
    limit: usize,
    pipeline: Vec<Stage>,
}

pub(crate) struct CursorState {
    query: Mutex<Query>,
    executions: mea::mutex::Mutex<()>,
    executing: AtomicUsize,
    pub(crate) observer: Mutex<Option<ObserverId>>,
    pub(crate) schedule: Mutex<Schedule>,
}

struct Executing<'a>(&'a AtomicUsize);

impl Drop for Executing<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, AtomicOrdering::SeqCst);
    }
}

/// A query over a collection.
///
/// Cloning a cursor is cheap; clones share the query, the pipeline and any observation.
#[derive(Clone)]
pub struct Cursor {
    pub(crate) db: Collection,
    pub(crate) state: Arc<CursorState>,
}

impl Cursor {
    /// Creates a cursor over `db`. Prefer [`Collection::find`].
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::Compile`] when the selector is malformed.
    pub fn new(db: Collection, selector: impl Into<Selector>) -> DocumentStoreResult<Self> {
        let selector = selector.into();
        let (matcher, sorter) = compile_query(&db, &selector, None)?;
        let schedule = Schedule::from_config(db.config());

        Ok(Self {
            db,
            state: Arc::new(CursorState {
                query: Mutex::new(Query {
                    selector,
                    sort: None,
                    skip: 0,
                    limit: 0,
                    matcher,
                    sorter,
                    pipeline: Vec::new(),
                }),
                executions: mea::mutex::Mutex::new(()),
                executing: AtomicUsize::new(0),
                observer: Mutex::new(None),
                schedule: Mutex::new(schedule),
            }),
        })
    }

    /// The collection this cursor reads from.
    pub fn collection(&self) -> &Collection {
        &self.db
    }

    fn query(&self) -> MutexGuard<'_, Query> {
        self.state.query.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether an execution of this cursor is outstanding.
    pub fn is_executing(&self) -> bool {
        self.state.executing.load(AtomicOrdering::SeqCst) > 0
    }

    fn ensure_not_executing(&self) -> DocumentStoreResult<()> {
        if self.is_executing() {
            return Err(DocumentStoreError::CursorExecuting);
        }

        Ok(())
    }

    /// The compiled matcher of the current selector.
    pub fn matcher(&self) -> Arc<Matcher> {
        self.query().matcher.clone()
    }

    /// Replaces the selector.
    ///
    /// # Errors
    ///
    /// Fails with [`DocumentStoreError::CursorExecuting`] while executing and with
    /// [`DocumentStoreError::Compile`] when the selector is malformed. The previous query is
    /// kept on failure.
    pub fn find(&self, selector: impl Into<Selector>) -> DocumentStoreResult<&Self> {
        self.ensure_not_executing()?;

        let selector = selector.into();
        let mut query = self.query();
        let (matcher, sorter) = compile_query(&self.db, &selector, query.sort.as_ref())?;

        query.selector = selector;
        query.matcher = matcher;
        query.sorter = sorter;

        Ok(self)
    }

    /// Sets the sort specification.
    pub fn sort(&self, spec: impl Into<SortSpec>) -> DocumentStoreResult<&Self> {
        self.ensure_not_executing()?;

        let spec = spec.into();
        let mut query = self.query();
        let (matcher, sorter) = compile_query(&self.db, &query.selector, Some(&spec))?;

        query.sort = Some(spec);
        query.matcher = matcher;
        query.sorter = sorter;

        Ok(self)
    }

    /// Skips the first `skip` documents of the sorted result.
    pub fn skip(&self, skip: usize) -> DocumentStoreResult<&Self> {
        self.ensure_not_executing()?;
        self.query().skip = skip;

        Ok(self)
    }

    /// Caps the number of documents. `0` means no limit.
    pub fn limit(&self, limit: usize) -> DocumentStoreResult<&Self> {
        self.ensure_not_executing()?;
        self.query().limit = limit;

        Ok(self)
    }

    fn add_stage(&self, stage: Stage) -> DocumentStoreResult<&Self> {
        self.ensure_not_executing()?;
        self.query().pipeline.push(stage);

        Ok(self)
    }

    /// Keeps the array elements `f` accepts.
    pub fn filter<F>(&self, f: F) -> DocumentStoreResult<&Self>
    where
        F: Fn(&Bson) -> bool + Send + Sync + 'static,
    {
        self.add_stage(Stage::Filter(Arc::new(f)))
    }

    /// Sorts the array elements with a custom comparator.
    pub fn sort_by<F>(&self, f: F) -> DocumentStoreResult<&Self>
    where
        F: Fn(&Bson, &Bson) -> Ordering + Send + Sync + 'static,
    {
        self.add_stage(Stage::SortBy(Arc::new(f)))
    }

    /// Replaces every array element with `f(element)`.
    pub fn map<F>(&self, f: F) -> DocumentStoreResult<&Self>
    where
        F: Fn(Bson) -> Bson + Send + Sync + 'static,
    {
        self.add_stage(Stage::Map(Arc::new(f)))
    }

    /// Folds the array elements, starting from `initial`.
    pub fn reduce<F>(&self, f: F, initial: impl Into<Bson>) -> DocumentStoreResult<&Self>
    where
        F: Fn(Bson, Bson) -> Bson + Send + Sync + 'static,
    {
        self.add_stage(Stage::Reduce(Arc::new(f), initial.into()))
    }

    /// Replaces the pipeline data with `f(data)`.
    pub fn aggregate<F>(&self, f: F) -> DocumentStoreResult<&Self>
    where
        F: Fn(Bson) -> Bson + Send + Sync + 'static,
    {
        self.add_stage(Stage::Aggregate(Arc::new(f)))
    }

    /// Joins every element when the data is an array, the whole data otherwise.
    pub fn join<F, Fut>(&self, f: F) -> DocumentStoreResult<&Self>
    where
        F: Fn(Bson, JoinContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DocumentStoreResult<Bson>> + Send + 'static,
    {
        self.add_stage(Stage::Join(boxed_join(f)))
    }

    /// Joins every element concurrently. Non-array data is treated as a one-element array.
    pub fn join_each<F, Fut>(&self, f: F) -> DocumentStoreResult<&Self>
    where
        F: Fn(Bson, JoinContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DocumentStoreResult<Bson>> + Send + 'static,
    {
        self.add_stage(Stage::JoinEach(boxed_join(f)))
    }

    /// Joins the whole pipeline data at once.
    pub fn join_all<F, Fut>(&self, f: F) -> DocumentStoreResult<&Self>
    where
        F: Fn(Bson, JoinContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DocumentStoreResult<Bson>> + Send + 'static,
    {
        self.add_stage(Stage::JoinAll(boxed_join(f)))
    }

    /// Stops the pipeline when the data is null, an empty array or an empty document. A
    /// stopped pipeline yields [`Bson::Null`].
    pub fn if_not_empty(&self) -> DocumentStoreResult<&Self> {
        self.add_stage(Stage::IfNotEmpty)
    }

    fn plan(&self) -> Plan {
        let query = self.query();

        Plan {
            matcher: query.matcher.clone(),
            sorter: query.sorter.clone(),
            skip: query.skip,
            limit: query.limit,
            pipeline: query.pipeline.clone(),
        }
    }

    /// Runs the query and the pipeline.
    ///
    /// Executions of one cursor never overlap; a second call waits for the first.
    ///
    /// # Errors
    ///
    /// Propagates retrieval, matching and sorting failures, and the first error of any join.
    pub async fn exec(&self) -> DocumentStoreResult<Bson> {
        self.state.executing.fetch_add(1, AtomicOrdering::SeqCst);
        let _executing = Executing(&self.state.executing);
        let _serialized = self.state.executions.lock().await;

        let plan = self.plan();
        let docs = self.match_objects(&plan).await?;
        let data = Bson::Array(docs.into_iter().map(Bson::Document).collect());

        process_pipeline(&plan.pipeline, data, self.parent_link()).await
    }

    /// Runs the query and decodes the pipeline output.
    pub async fn exec_as<T>(&self) -> DocumentStoreResult<T>
    where
        T: DeserializeOwned,
    {
        Ok(deserialize_from_bson(self.exec().await?)?)
    }

    /// Runs the query and returns the `_id` of every matched document. The pipeline is
    /// skipped.
    pub async fn ids(&self) -> DocumentStoreResult<Vec<Bson>> {
        self.state.executing.fetch_add(1, AtomicOrdering::SeqCst);
        let _executing = Executing(&self.state.executing);
        let _serialized = self.state.executions.lock().await;

        let plan = self.plan();
        let docs = self.match_objects(&plan).await?;

        Ok(
            docs.into_iter()
                .map(|mut doc| doc.remove("_id").unwrap_or(Bson::Null))
                .collect()
        )
    }

    /// Waits until no execution of this cursor is outstanding.
    pub async fn when_not_executing(&self) {
        let _serialized = self.state.executions.lock().await;
    }

    async fn match_objects(&self, plan: &Plan) -> DocumentStoreResult<Vec<Document>> {
        let candidates = self.db.retriever().retrieve_for_query(plan.matcher.selector()).await?;
        let candidate_count = candidates.len();

        let fast_limit = plan.limit > 0 && plan.skip == 0 && plan.sorter.is_none();
        let mut results = Vec::new();
        let mut distances = Distances::new();

        for doc in candidates {
            let matched = plan.matcher.document_matches(&doc)?;

            if matched.result {
                if let Some(distance) = matched.distance {
                    distances.insert(IdKey::from(doc.get("_id").unwrap_or(&Bson::Null)), distance);
                }

                results.push(doc);
            }

            if fast_limit && results.len() == plan.limit {
                break;
            }
        }

        tracing::trace!(
            collection = self.db.name(),
            candidates = candidate_count,
            matched = results.len(),
            "cursor matched documents"
        );

        if fast_limit {
            return Ok(results);
        }

        if let Some(sorter) = &plan.sorter {
            let distances = plan.matcher.has_geo_query().then_some(&distances);
            results = try_sort_by(results, sorter.comparator(distances))?;
        }

        let end = match plan.limit {
            0 => results.len(),
            limit => plan.skip.saturating_add(limit),
        };

        Ok(
            results.into_iter()
                .skip(plan.skip)
                .take(end.saturating_sub(plan.skip))
                .collect()
        )
    }

    fn parent_link(&self) -> Option<ParentLink> {
        let observer = *self.state.observer.lock().unwrap_or_else(PoisonError::into_inner);
        observer.map(|id| ParentLink::new(self.db.reactor(), id))
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let query = self.query();

        f.debug_struct("Cursor")
            .field("collection", &self.db.name())
            .field("selector", &query.selector)
            .field("sort", &query.sort)
            .field("skip", &query.skip)
            .field("limit", &query.limit)
            .field("pipeline", &query.pipeline)
            .finish()
    }
}

fn compile_query(
    db: &Collection,
    selector: &Selector,
    sort: Option<&SortSpec>,
) -> DocumentStoreResult<(Arc<Matcher>, Option<Arc<Sorter>>)> {
    let matcher = Matcher::with_registry(selector.clone(), db.where_registry())?;

    let sorter = if matcher.has_geo_query() || sort.is_some() {
        let spec = sort.cloned().unwrap_or_default();
        Some(Arc::new(Sorter::with_matcher(spec, &matcher)?))
    } else {
        None
    };

    Ok((Arc::new(matcher), sorter))
}

fn boxed_join<F, Fut>(f: F) -> JoinFn
where
    F: Fn(Bson, JoinContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DocumentStoreResult<Bson>> + Send + 'static,
{
    Arc::new(move |value, ctx| f(value, ctx).boxed())
}

fn expect_array(data: Bson, stage: &Stage) -> DocumentStoreResult<Vec<Bson>> {
    match data {
        Bson::Array(values) => Ok(values),
        other => Err(DocumentStoreError::evaluation(format!(
            "{}(...): pipeline data must be an array, got {:?}",
            stage.name(),
            BsonType::of(&other)
        ))),
    }
}

fn is_empty_result(data: &Bson) -> bool {
    match data {
        Bson::Null | Bson::Undefined => true,
        Bson::Array(values) => values.is_empty(),
        Bson::Document(doc) => doc.is_empty(),
        _ => false,
    }
}

async fn join_all(f: &JoinFn, data: Bson, index: usize, len: usize, link: &Option<ParentLink>) -> DocumentStoreResult<Bson> {
    let ctx = JoinContext { index, len, link: link.clone() };
    f(data, ctx).await
}

async fn join_each(f: &JoinFn, data: Bson, link: &Option<ParentLink>) -> DocumentStoreResult<Bson> {
    let values = match data {
        Bson::Array(values) => values,
        other => vec![other],
    };
    let len = values.len();

    let joined = try_join_all(
        values
            .into_iter()
            .enumerate()
            .map(|(index, value)| join_all(f, value, index, len, link))
    )
    .await?;

    Ok(Bson::Array(joined))
}

async fn run_stage(stage: &Stage, data: Bson, link: &Option<ParentLink>) -> DocumentStoreResult<Flow> {
    let data = match stage {
        Stage::Filter(f) => Bson::Array(expect_array(data, stage)?.into_iter().filter(|value| f(value)).collect()),
        Stage::SortBy(f) => {
            let mut values = expect_array(data, stage)?;
            values.sort_by(|a, b| f(a, b));
            Bson::Array(values)
        }
        Stage::Map(f) => Bson::Array(expect_array(data, stage)?.into_iter().map(|value| f(value)).collect()),
        Stage::Reduce(f, initial) => expect_array(data, stage)?.into_iter().fold(initial.clone(), |acc, value| f(acc, value)),
        Stage::Aggregate(f) => f(data),
        Stage::Join(f) if matches!(data, Bson::Array(_)) => join_each(f, data, link).await?,
        Stage::Join(f) | Stage::JoinAll(f) => join_all(f, data, 0, 1, link).await?,
        Stage::JoinEach(f) => join_each(f, data, link).await?,
        Stage::IfNotEmpty if is_empty_result(&data) => return Ok(Flow::Stop),
        Stage::IfNotEmpty => data,
    };

    Ok(Flow::Continue(data))
}

async fn process_pipeline(stages: &[Stage], data: Bson, link: Option<ParentLink>) -> DocumentStoreResult<Bson> {
    let mut data = data;

    for stage in stages {
        match run_stage(stage, data, &link).await? {
            Flow::Continue(next) => data = next,
            Flow::Stop => return Ok(Bson::Null),
        }
    }

    Ok(data)
}
