//! Update pipeline and view registry.
//!
//! One cycle per batch: apply to the master state, `step_begin` + `notify` on
//! every view (in parallel when there are enough of them), then `step_end` on
//! each once all notifies are done. The master-state write lock is held for
//! the whole cycle so readers never see a half-applied batch.
//!
//! Lock order everywhere: master state, then registry, then a view's mutex.

use super::context::{Context, ContextOps, DataBlock, RowDelta, TraversalRow};
use super::state::{MasterState, StepDelta};
use super::symbol::SymbolTable;
use super::types::{DType, FastIndexMap, OpRow, Scalar, Schema, Transition};
use super::view_config::{ContextConfig, ContextKind};
use crate::config::EngineConfig;
use crate::error::EngineError;
use serde::Serialize;
use smol_str::SmolStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, instrument, warn};

#[cfg(all(feature = "parallel", not(target_arch = "wasm32")))]
use rayon::prelude::*;

type SharedContext = Arc<Mutex<Context>>;

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Summary of one update cycle.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// Distinct keys touched by the batch.
    pub flattened: usize,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Rows skipped for a null primary key.
    pub rejected: usize,
    pub views_notified: usize,
}

impl UpdateReport {
    fn from_step(step: &StepDelta, views_notified: usize) -> Self {
        let count = |t: Transition| step.transitions.iter().filter(|x| **x == t).count();
        Self {
            flattened: step.len(),
            inserted: count(Transition::Inserted),
            updated: count(Transition::Updated),
            deleted: count(Transition::Deleted),
            rejected: step.rejected,
            views_notified,
        }
    }
}

pub struct Pipeline {
    config: EngineConfig,
    symbols: Arc<SymbolTable>,
    state: Arc<RwLock<MasterState>>,
    views: RwLock<FastIndexMap<SmolStr, SharedContext>>,
    #[cfg(all(feature = "parallel", not(target_arch = "wasm32")))]
    pool: rayon::ThreadPool,
}

impl Pipeline {
    /// Pipeline over the process-wide symbol table.
    pub fn new(schema: Schema, config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_symbols(schema, config, SymbolTable::global())
    }

    pub fn with_symbols(
        schema: Schema,
        config: EngineConfig,
        symbols: Arc<SymbolTable>,
    ) -> Result<Self, EngineError> {
        #[cfg(all(feature = "parallel", not(target_arch = "wasm32")))]
        let pool = {
            let mut builder = rayon::ThreadPoolBuilder::new()
                .thread_name(|i| format!("pivot-view-notify-{}", i));
            if let Some(n) = config.worker_threads {
                builder = builder.num_threads(n);
            }
            builder
                .build()
                .map_err(|e| EngineError::Config(format!("notify pool: {}", e)))?
        };

        info!(
            columns = schema.len(),
            workers = ?config.worker_threads,
            "Created pipeline"
        );

        Ok(Self {
            state: Arc::new(RwLock::new(MasterState::new(schema, symbols.clone()))),
            symbols,
            config,
            views: RwLock::new(FastIndexMap::default()),
            #[cfg(all(feature = "parallel", not(target_arch = "wasm32")))]
            pool,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn symbols(&self) -> &Arc<SymbolTable> {
        &self.symbols
    }

    pub fn schema(&self) -> Schema {
        read_lock(&self.state).schema().clone()
    }

    pub fn num_rows(&self) -> usize {
        read_lock(&self.state).num_rows()
    }

    /// Apply one batch and propagate it to every registered view.
    #[instrument(skip_all, fields(rows = batch.len()))]
    pub fn update(&self, batch: Vec<OpRow>) -> Result<UpdateReport, EngineError> {
        let mut guard = write_lock(&self.state);
        let initial = guard.is_empty();
        let step = guard.apply(batch)?;
        if step.rejected > 0 {
            warn!(rejected = step.rejected, "Batch contained rows with null primary keys");
        }
        let state: &MasterState = &guard;

        let views: Vec<SharedContext> = read_lock(&self.views).values().cloned().collect();
        if step.is_empty() {
            return Ok(UpdateReport::from_step(&step, 0));
        }

        let notify_one = |ctx: &SharedContext| {
            let mut ctx = lock(ctx);
            ctx.step_begin();
            if initial {
                ctx.notify_initial(&step, state);
            } else {
                ctx.notify(&step, state);
            }
        };

        #[cfg(all(feature = "parallel", not(target_arch = "wasm32")))]
        {
            if views.len() >= self.config.parallel_threshold.max(2) {
                self.pool.install(|| views.par_iter().for_each(notify_one));
            } else {
                views.iter().for_each(notify_one);
            }
        }

        #[cfg(any(target_arch = "wasm32", not(feature = "parallel")))]
        {
            views.iter().for_each(notify_one);
        }

        // every notify has returned: safe to finalize
        for ctx in &views {
            lock(ctx).step_end(state);
        }

        let report = UpdateReport::from_step(&step, views.len());
        debug!(?report, "Update cycle complete");
        Ok(report)
    }

    /// Register a named view. Rows already in the master state are loaded.
    #[instrument(skip(self, config), fields(kind = tracing::field::Empty))]
    pub fn register_view(&self, name: &str, config: ContextConfig) -> Result<ViewHandle, EngineError> {
        let state = read_lock(&self.state);
        let mut views = write_lock(&self.views);
        if views.contains_key(name) {
            warn!(view = name, "View already registered");
            return Err(EngineError::AlreadyExists(SmolStr::new(name)));
        }

        let mut ctx = Context::new(config, state.schema())?;
        tracing::Span::current().record("kind", tracing::field::debug(ctx.kind()));
        ctx.init(&state);
        let ctx = Arc::new(Mutex::new(ctx));
        views.insert(SmolStr::new(name), ctx.clone());
        debug!(view = name, rows = state.num_rows(), "Registered view");

        Ok(ViewHandle {
            name: SmolStr::new(name),
            state: self.state.clone(),
            ctx,
        })
    }

    pub fn unregister_view(&self, name: &str) -> Result<(), EngineError> {
        let _state = read_lock(&self.state);
        match write_lock(&self.views).shift_remove(name) {
            Some(_) => Ok(()),
            None => Err(EngineError::UnknownView(SmolStr::new(name))),
        }
    }

    pub fn view(&self, name: &str) -> Result<ViewHandle, EngineError> {
        let views = read_lock(&self.views);
        let ctx = views
            .get(name)
            .ok_or_else(|| EngineError::UnknownView(SmolStr::new(name)))?;
        Ok(ViewHandle {
            name: SmolStr::new(name),
            state: self.state.clone(),
            ctx: ctx.clone(),
        })
    }

    /// Names in registration order.
    pub fn view_names(&self) -> Vec<SmolStr> {
        read_lock(&self.views).keys().cloned().collect()
    }
}

/// Thread-safe query handle on one view.
///
/// Every call takes the master-state read lock, then the view's mutex, so a
/// query never observes a batch in progress. A handle keeps working after its
/// view is unregistered but no longer receives updates.
#[derive(Clone)]
pub struct ViewHandle {
    name: SmolStr,
    state: Arc<RwLock<MasterState>>,
    ctx: SharedContext,
}

impl ViewHandle {
    fn with<R>(&self, f: impl FnOnce(&MasterState, &mut Context) -> R) -> R {
        let state = read_lock(&self.state);
        let mut ctx = lock(&self.ctx);
        f(&state, &mut ctx)
    }

    pub fn name(&self) -> &SmolStr {
        &self.name
    }

    pub fn kind(&self) -> ContextKind {
        self.with(|_, c| c.kind())
    }

    pub fn config(&self) -> ContextConfig {
        self.with(|_, c| c.config().clone())
    }

    pub fn get_row_count(&self) -> usize {
        self.with(|_, c| c.get_row_count())
    }

    pub fn get_column_count(&self) -> usize {
        self.with(|_, c| c.get_column_count())
    }

    pub fn get_column_names(&self) -> Vec<SmolStr> {
        self.with(|_, c| c.get_column_names())
    }

    pub fn get_column_dtype(&self, col: usize) -> DType {
        self.with(|_, c| c.get_column_dtype(col))
    }

    pub fn get_data(&self, start_row: i64, end_row: i64, start_col: i64, end_col: i64) -> DataBlock {
        self.with(|s, c| c.get_data(s, start_row, end_row, start_col, end_col))
    }

    pub fn get_data_by_rows(&self, rows: &[usize]) -> DataBlock {
        self.with(|s, c| c.get_data_by_rows(s, rows))
    }

    /// Rows for primary-key values; unknown keys give `None`-filled rows.
    pub fn get_data_by_keys(&self, keys: &[Scalar]) -> DataBlock {
        self.with(|s, c| {
            let rows: Vec<usize> = keys
                .iter()
                .map(|k| {
                    s.symbols()
                        .lookup(k)
                        .and_then(|sym| c.row_of_key(s, sym))
                        .unwrap_or(usize::MAX)
                })
                .collect();
            c.get_data_by_rows(s, &rows)
        })
    }

    pub fn get_row_delta(&self) -> RowDelta {
        self.with(|s, c| c.get_row_delta(s))
    }

    pub fn has_deltas(&self) -> bool {
        self.with(|_, c| c.has_deltas())
    }

    pub fn get_pkeys(&self, cells: &[(usize, usize)]) -> Result<Vec<Scalar>, EngineError> {
        self.with(|s, c| c.get_pkeys(s, cells))
    }

    pub fn supports_pkeys(&self) -> bool {
        self.with(|_, c| c.supports_pkeys())
    }

    pub fn sidedness(&self) -> u8 {
        self.with(|_, c| c.sidedness())
    }

    pub fn traversal_row(&self, row: usize) -> Option<TraversalRow> {
        self.with(|s, c| c.traversal_row(s, row))
    }

    pub fn expand(&self, row: usize) -> Result<bool, EngineError> {
        self.with(|_, c| c.expand(row))
    }

    pub fn collapse(&self, row: usize) -> Result<bool, EngineError> {
        self.with(|_, c| c.collapse(row))
    }

    pub fn set_depth(&self, depth: usize) -> Result<bool, EngineError> {
        self.with(|_, c| c.set_depth(depth))
    }

    /// Drop derived state and reload it from the master state.
    pub fn reset(&self) {
        self.with(|s, c| {
            c.reset();
            c.init(s);
        })
    }
}

#[cfg(test)]
mod pipeline_tests {
    use super::*;
    use crate::engine::view_config::{AggFunc, AggSpec};

    fn pipeline() -> Pipeline {
        let schema = Schema::new([("pkey", DType::Str), ("value", DType::Int)], "pkey").unwrap();
        Pipeline::with_symbols(schema, EngineConfig::default(), Arc::new(SymbolTable::new())).unwrap()
    }

    fn ins(k: &str, v: i64) -> OpRow {
        OpRow::insert(vec![Scalar::str(k), Scalar::Int(v)])
    }

    #[test]
    fn test_report_counts_transitions() {
        let p = pipeline();
        p.register_view("unit", ContextConfig::default()).unwrap();
        let report = p.update(vec![ins("a", 1), ins("b", 2)]).unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.views_notified, 1);
        let report = p
            .update(vec![ins("a", 3), OpRow::delete(2, 0, Scalar::str("b"))])
            .unwrap();
        assert_eq!((report.updated, report.deleted), (1, 1));
    }

    #[test]
    fn test_rejected_batch_leaves_views_untouched() {
        let p = pipeline();
        let view = p.register_view("unit", ContextConfig::default()).unwrap();
        p.update(vec![ins("a", 1)]).unwrap();
        let _ = view.get_row_delta();
        let err = p.update(vec![OpRow::raw(9, vec![Scalar::str("b"), Scalar::Int(1)])]);
        assert!(matches!(err, Err(EngineError::UnknownOperation { tag: 9, .. })));
        assert!(!view.has_deltas());
        assert_eq!(view.get_row_count(), 1);
    }

    #[test]
    fn test_registry_lifecycle() {
        let p = pipeline();
        p.register_view("a", ContextConfig::default()).unwrap();
        p.register_view(
            "b",
            ContextConfig::new()
                .row_pivot("pkey")
                .aggregate(AggSpec::new("value", AggFunc::Sum)),
        )
        .unwrap();
        assert_eq!(p.view_names(), vec![SmolStr::new("a"), SmolStr::new("b")]);
        assert!(matches!(
            p.register_view("a", ContextConfig::default()),
            Err(EngineError::AlreadyExists(_))
        ));
        p.unregister_view("a").unwrap();
        assert!(matches!(p.unregister_view("a"), Err(EngineError::UnknownView(_))));
        assert!(matches!(p.view("a"), Err(EngineError::UnknownView(_))));
        assert_eq!(p.view("b").unwrap().kind(), ContextKind::GroupedByOne);
    }

    #[test]
    fn test_expand_on_unit_view_is_unsupported() {
        let p = pipeline();
        let view = p.register_view("u", ContextConfig::default()).unwrap();
        assert!(matches!(view.expand(0), Err(EngineError::Unsupported(_))));
    }
}
