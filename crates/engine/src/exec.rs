use crate::expr::{eval, EvalContext};
use crate::planner::PlanCache;
use crate::scan::{build_machine, ExecEnv, SubSelectExec, TableRow};
use crate::value::order_cmp;
use crate::{Error, NoService, Row, ServiceExecutor, Value};
use atoms::Atom;
use quads::{QuadPattern, QuadStore, ScanMode};
use sparql::{
    AskQuery, ConstructQuery, DatasetClause, DescribeQuery, Expr, GraphOrDefault, GraphTarget,
    LogicalPlan, Pattern, Projection, QuadBlock, Query, SelectQuery, Term, TriplePattern, UpdateOp,
};
use fxhash::{FxHashMap, FxHashSet};
use std::collections::HashSet;
use std::sync::Arc;

const DEFAULT_PLAN_CACHE: usize = 256;

/// A materialized SELECT solution: values aligned with the result's
/// variable list, `None` for unbound positions.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub values: Vec<Option<Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Solutions {
        variables: Vec<String>,
        rows: Vec<Solution>,
    },
    Ask(bool),
    /// CONSTRUCT / DESCRIBE output: canonical term texts.
    Triples(Vec<[String; 3]>),
}

/// The query and update entry point. Owns the plan cache and the
/// injected SERVICE transport; borrows a store per call.
pub struct Engine {
    service: Arc<dyn ServiceExecutor>,
    cache: PlanCache,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::with_service(Arc::new(NoService))
    }

    pub fn with_service(service: Arc<dyn ServiceExecutor>) -> Self {
        Self {
            service,
            cache: PlanCache::new(DEFAULT_PLAN_CACHE),
        }
    }

    /// Execute a SPARQL query. The shared lock is held for the duration
    /// and released before returning; results are caller-owned.
    pub fn query(&self, store: &QuadStore, text: &str) -> Result<QueryResult, Error> {
        store.acquire_read()?;
        let result = self.query_locked(store, text);
        store.release_read()?;
        result
    }

    fn query_locked(&self, store: &QuadStore, text: &str) -> Result<QueryResult, Error> {
        let stats = store.get_statistics();
        let graph_count = store.named_graphs().count() as u64;
        let plan = self
            .cache
            .get_or_parse(text, graph_count, stats.quad_count)?;

        match &plan.query {
            Query::Select(q) => {
                let env = self.env(store, &plan, &q.dataset)?;
                let (variables, rows) = self.select(&env, q)?;
                Ok(QueryResult::Solutions { variables, rows })
            }
            Query::Ask(q) => {
                let env = self.env(store, &plan, &q.dataset)?;
                Ok(QueryResult::Ask(self.ask(&env, q)?))
            }
            Query::Construct(q) => {
                let env = self.env(store, &plan, &q.dataset)?;
                Ok(QueryResult::Triples(self.construct(&env, q)?))
            }
            Query::Describe(q) => {
                let env = self.env(store, &plan, &q.dataset)?;
                Ok(QueryResult::Triples(self.describe(&env, q)?))
            }
            Query::Update(_) => Err(Error::Eval(
                "update requests go through Engine::update".to_string(),
            )),
        }
    }

    /// Execute a SPARQL update request: reads run under the shared
    /// lock, then mutations apply through a write batch.
    pub fn update(&self, store: &QuadStore, text: &str) -> Result<(), Error> {
        let plan = sparql::parse(text)?;
        let Query::Update(ops) = &plan.query else {
            return Err(Error::Eval("not an update request".to_string()));
        };
        for op in ops {
            self.apply_update(store, &plan, op)?;
        }
        Ok(())
    }

    fn env<'e>(
        &'e self,
        store: &'e QuadStore,
        plan: &'e LogicalPlan,
        dataset: &[DatasetClause],
    ) -> Result<ExecEnv<'e>, Error> {
        let mut default_graphs = Vec::new();
        let mut named_graphs = Vec::new();
        let mut any_from = false;
        let mut any_named = false;

        for clause in dataset {
            match clause {
                DatasetClause::Default(iri) => {
                    any_from = true;
                    if let Some(atom) = lookup_iri(store, plan.text(*iri))? {
                        default_graphs.push(atom);
                    }
                }
                DatasetClause::Named(iri) => {
                    any_named = true;
                    if let Some(atom) = lookup_iri(store, plan.text(*iri))? {
                        named_graphs.push(atom);
                    }
                }
            }
        }
        if !any_from {
            default_graphs.push(Atom::DEFAULT_GRAPH);
        }
        if !any_named {
            named_graphs = store.named_graphs().collect();
        }

        Ok(ExecEnv {
            store,
            ctx: EvalContext::new(plan),
            service: self.service.as_ref(),
            subselect: self,
            default_graphs,
            named_graphs,
            as_of: quads::now(),
        })
    }

    // ---- SELECT ----

    fn select(
        &self,
        env: &ExecEnv<'_>,
        q: &SelectQuery,
    ) -> Result<(Vec<String>, Vec<Solution>), Error> {
        let variables = projected_variables(env.ctx.plan, q);

        // LIMIT 0 yields nothing and must not seek the index.
        if q.modifiers.limit == Some(0) {
            return Ok((variables, Vec::new()));
        }

        let groups_of_rows = self.solve_and_group(env, q)?;

        // Project each (group or row) into the output shape.
        let mut rows: Vec<(Vec<Option<Value>>, Vec<Value>)> = Vec::new();
        for group in &groups_of_rows {
            let values: Vec<Option<Value>> = match &q.projection {
                Projection::All => variables
                    .iter()
                    .map(|name| {
                        group.first().and_then(|row| {
                            row.get_by_name(name).map(|b| row.value_of(b))
                        })
                    })
                    .collect(),
                Projection::Elems(elems) => elems
                    .iter()
                    .map(|elem| {
                        let value = match &elem.expr {
                            Some(expr) => eval_over_group(&env.ctx, group, expr)
                                .unwrap_or(Value::Unbound),
                            None => match elem.var {
                                Term::Var(name) => {
                                    let name = env.ctx.plan.text(name);
                                    group
                                        .first()
                                        .and_then(|row| {
                                            row.get_by_name(name).map(|b| row.value_of(b))
                                        })
                                        .unwrap_or(Value::Unbound)
                                }
                                _ => Value::Unbound,
                            },
                        };
                        match value {
                            Value::Unbound | Value::Error => None,
                            v => Some(v),
                        }
                    })
                    .collect(),
            };

            // ORDER BY keys evaluate against the group's first row.
            let order_keys: Vec<Value> = q
                .modifiers
                .order_by
                .iter()
                .map(|(expr, _)| eval_over_group(&env.ctx, group, expr).unwrap_or(Value::Unbound))
                .collect();
            rows.push((values, order_keys));
        }

        if !q.modifiers.order_by.is_empty() {
            let directions: Vec<bool> = q.modifiers.order_by.iter().map(|(_, d)| *d).collect();
            rows.sort_by(|a, b| {
                for (i, desc) in directions.iter().enumerate() {
                    let ord = order_cmp(&a.1[i], &b.1[i]);
                    if ord != std::cmp::Ordering::Equal {
                        return if *desc { ord.reverse() } else { ord };
                    }
                }
                std::cmp::Ordering::Equal
            });
        }

        let mut out: Vec<Solution> = rows
            .into_iter()
            .map(|(values, _)| Solution { values })
            .collect();

        if q.distinct {
            let mut seen: FxHashSet<String> = FxHashSet::default();
            out.retain(|solution| {
                let key = solution
                    .values
                    .iter()
                    .map(|v| match v {
                        Some(v) => v.to_term_text().unwrap_or_default(),
                        None => String::new(),
                    })
                    .collect::<Vec<_>>()
                    .join("\u{1f}");
                seen.insert(key)
            });
        }

        let offset = q.modifiers.offset.unwrap_or(0) as usize;
        if offset > 0 {
            out.drain(..offset.min(out.len()));
        }
        if let Some(limit) = q.modifiers.limit {
            out.truncate(limit as usize);
        }

        Ok((variables, out))
    }

    /// Run the WHERE clause, then partition solutions into groups:
    /// singleton groups for a plain query, GROUP BY key groups (or one
    /// group over everything) when aggregation is in play.
    fn solve_and_group(&self, env: &ExecEnv<'_>, q: &SelectQuery) -> Result<Vec<Vec<Row>>, Error> {
        let solutions = self.solve(env, &q.patterns)?;

        let aggregated = has_aggregates(q) || !q.modifiers.group_by.is_empty();
        if !aggregated {
            return Ok(solutions.into_iter().map(|row| vec![row]).collect());
        }

        let mut groups: Vec<(Vec<String>, Vec<Row>)> = Vec::new();
        if q.modifiers.group_by.is_empty() {
            groups.push((Vec::new(), solutions));
        } else {
            let mut index: FxHashMap<Vec<String>, usize> = FxHashMap::default();
            for row in solutions {
                let key: Vec<String> = q
                    .modifiers
                    .group_by
                    .iter()
                    .map(|expr| {
                        eval(&env.ctx, &row, expr)
                            .to_term_text()
                            .unwrap_or_default()
                    })
                    .collect();
                let at = *index.entry(key.clone()).or_insert_with(|| {
                    groups.push((key, Vec::new()));
                    groups.len() - 1
                });
                groups[at].1.push(row);
            }
        }

        let mut out = Vec::with_capacity(groups.len());
        for (_, group) in groups {
            let keep = q.modifiers.having.iter().all(|having| {
                matches!(
                    eval_over_group(&env.ctx, &group, having)
                        .unwrap_or(Value::Error)
                        .ebv(),
                    Value::Boolean(true)
                )
            });
            if keep {
                out.push(group);
            }
        }
        Ok(out)
    }

    /// Materialize every solution of a pattern group.
    fn solve(&self, env: &ExecEnv<'_>, patterns: &[Pattern]) -> Result<Vec<Row>, Error> {
        let mut machine = build_machine(env, patterns, &HashSet::new())?;
        let mut row = Row::new();
        machine.reset(env, &row)?;
        let mut out = Vec::new();
        while machine.advance(env, &mut row)? {
            out.push(row.clone());
        }
        Ok(out)
    }

    fn ask(&self, env: &ExecEnv<'_>, q: &AskQuery) -> Result<bool, Error> {
        let mut machine = build_machine(env, &q.patterns, &HashSet::new())?;
        let mut row = Row::new();
        machine.reset(env, &row)?;
        machine.advance(env, &mut row)
    }

    fn construct(&self, env: &ExecEnv<'_>, q: &ConstructQuery) -> Result<Vec<[String; 3]>, Error> {
        if q.modifiers.limit == Some(0) {
            return Ok(Vec::new());
        }
        let solutions = self.solve(env, &q.patterns)?;
        let mut out = Vec::new();
        let mut seen = FxHashSet::default();

        for (index, row) in solutions.iter().enumerate() {
            'template: for triple in &q.template {
                let mut texts: [String; 3] = Default::default();
                for (slot, term) in [&triple.subject, &triple.predicate, &triple.object]
                    .into_iter()
                    .enumerate()
                {
                    let text = match term {
                        Term::Var(name) => {
                            let name = env.ctx.plan.text(*name);
                            match row.get_by_name(name) {
                                Some(b) => row.term_text_of(b).to_string(),
                                None => continue 'template,
                            }
                        }
                        // Template blank nodes are fresh per solution.
                        Term::Blank(label) => {
                            format!("_:{}_{}", env.ctx.plan.text(*label), index)
                        }
                        other => match env.ctx.term_value(row, other).to_term_text() {
                            Some(text) => text,
                            None => continue 'template,
                        },
                    };
                    texts[slot] = text;
                }
                if seen.insert(texts.clone()) {
                    out.push(texts);
                }
            }
        }
        Ok(out)
    }

    fn describe(&self, env: &ExecEnv<'_>, q: &DescribeQuery) -> Result<Vec<[String; 3]>, Error> {
        // Resolve the described terms: explicit IRIs plus every value
        // the WHERE solutions bind for the target variables.
        let mut targets: Vec<String> = Vec::new();
        let solutions = if q.patterns.is_empty() {
            Vec::new()
        } else {
            self.solve(env, &q.patterns)?
        };

        if q.targets.is_empty() {
            for row in &solutions {
                for binding in row.iter() {
                    targets.push(row.term_text_of(binding).to_string());
                }
            }
        } else {
            for target in &q.targets {
                match target {
                    Term::Var(name) => {
                        let name = env.ctx.plan.text(*name);
                        for row in &solutions {
                            if let Some(b) = row.get_by_name(name) {
                                targets.push(row.term_text_of(b).to_string());
                            }
                        }
                    }
                    other => {
                        if let Some(text) = env.ctx.term_atom_text(other) {
                            targets.push(text);
                        }
                    }
                }
            }
        }
        targets.sort();
        targets.dedup();

        let mut out = Vec::new();
        for target in targets {
            let Some(atom) = env.store.atoms().lookup(&target)? else {
                continue;
            };
            let mut iter = env.store.scan(
                QuadPattern {
                    subject: Some(atom),
                    ..Default::default()
                },
                ScanMode::AsOf(env.as_of),
            );
            while iter.advance() {
                let quad = iter.current().expect("advance returned true");
                out.push([
                    target.clone(),
                    env.store.atoms().get(quad.predicate)?.as_str().to_string(),
                    env.store.atoms().get(quad.object)?.as_str().to_string(),
                ]);
            }
            if let Some(err) = iter.take_error() {
                return Err(err.into());
            }
        }
        Ok(out)
    }

    // ---- UPDATE ----

    fn apply_update(
        &self,
        store: &QuadStore,
        plan: &LogicalPlan,
        op: &UpdateOp,
    ) -> Result<(), Error> {
        match op {
            UpdateOp::InsertData(blocks) => {
                let mut blanks = BlankAllocator::default();
                let mut batch = store.begin_batch()?;
                for quad in ground_quads(store, plan, blocks, None, &mut blanks)? {
                    batch.add_current(quad[0], quad[1], quad[2], quad[3])?;
                }
                batch.commit()?;
                Ok(())
            }
            UpdateOp::DeleteData(blocks) => {
                let mut blanks = BlankAllocator::default();
                let mut batch = store.begin_batch()?;
                for quad in ground_quads(store, plan, blocks, None, &mut blanks)? {
                    batch.delete_current(quad[0], quad[1], quad[2], quad[3])?;
                }
                batch.commit()?;
                Ok(())
            }
            UpdateOp::Modify {
                with,
                delete,
                insert,
                using,
                patterns,
            } => {
                // Read phase under the shared lock.
                store.acquire_read()?;
                let solutions = (|| {
                    let env = self.env(store, plan, using)?;
                    self.solve(&env, patterns)
                })();
                store.release_read()?;
                let solutions = solutions?;

                let with_graph = match with {
                    Some(iri) => Some(intern_iri(store, plan.text(*iri))?),
                    None => None,
                };

                let mut batch = store.begin_batch()?;
                for row in &solutions {
                    for (graph, triple) in block_triples(delete) {
                        if let Some(quad) =
                            instantiate(store, plan, row, graph, triple, with_graph, false)?
                        {
                            batch.delete_current(quad[0], quad[1], quad[2], quad[3])?;
                        }
                    }
                }
                for (index, row) in solutions.iter().enumerate() {
                    let mut blanks = BlankAllocator::scoped(index);
                    for (graph, triple) in block_triples(insert) {
                        if let Some(quad) = instantiate_with_blanks(
                            store, plan, row, graph, triple, with_graph, &mut blanks,
                        )? {
                            batch.add_current(quad[0], quad[1], quad[2], quad[3])?;
                        }
                    }
                }
                batch.commit()?;
                Ok(())
            }
            UpdateOp::Clear { silent, target } | UpdateOp::Drop { silent, target } => {
                let result = self.clear_graphs(store, plan, target);
                if *silent {
                    Ok(())
                } else {
                    result
                }
            }
            UpdateOp::Create { .. } => {
                // Graphs exist implicitly; creation is a no-op.
                Ok(())
            }
            UpdateOp::Copy { silent, from, to } => {
                let result = self.copy_graph(store, plan, from, to, true, false);
                if *silent {
                    Ok(())
                } else {
                    result
                }
            }
            UpdateOp::Move { silent, from, to } => {
                let result = self.copy_graph(store, plan, from, to, true, true);
                if *silent {
                    Ok(())
                } else {
                    result
                }
            }
            UpdateOp::Add { silent, from, to } => {
                let result = self.copy_graph(store, plan, from, to, false, false);
                if *silent {
                    Ok(())
                } else {
                    result
                }
            }
        }
    }

    fn graph_quads(&self, store: &QuadStore, graph: Atom) -> Result<Vec<[Atom; 4]>, Error> {
        store.acquire_read()?;
        let mut iter = store.query_current(QuadPattern {
            graph: Some(graph),
            ..Default::default()
        });
        let mut out = Vec::new();
        while iter.advance() {
            let quad = iter.current().expect("advance returned true");
            out.push([quad.graph, quad.subject, quad.predicate, quad.object]);
        }
        let error = iter.take_error();
        store.release_read()?;
        if let Some(err) = error {
            return Err(err.into());
        }
        Ok(out)
    }

    fn clear_graphs(
        &self,
        store: &QuadStore,
        plan: &LogicalPlan,
        target: &GraphTarget,
    ) -> Result<(), Error> {
        let graphs: Vec<Atom> = match target {
            GraphTarget::Default => vec![Atom::DEFAULT_GRAPH],
            GraphTarget::Named => {
                store.acquire_read()?;
                let graphs = store.named_graphs().collect();
                store.release_read()?;
                graphs
            }
            GraphTarget::All => {
                store.acquire_read()?;
                let mut graphs: Vec<Atom> = store.named_graphs().collect();
                store.release_read()?;
                graphs.push(Atom::DEFAULT_GRAPH);
                graphs
            }
            GraphTarget::Graph(iri) => match lookup_iri(store, plan.text(*iri))? {
                Some(atom) => vec![atom],
                None => return Ok(()),
            },
        };

        for graph in graphs {
            let quads = self.graph_quads(store, graph)?;
            if quads.is_empty() {
                continue;
            }
            let mut batch = store.begin_batch()?;
            for quad in quads {
                batch.delete_current(quad[0], quad[1], quad[2], quad[3])?;
            }
            batch.commit()?;
        }
        Ok(())
    }

    fn copy_graph(
        &self,
        store: &QuadStore,
        plan: &LogicalPlan,
        from: &GraphOrDefault,
        to: &GraphOrDefault,
        clear_target: bool,
        clear_source: bool,
    ) -> Result<(), Error> {
        let source = graph_or_default_atom(store, plan, from, false)?;
        let target = graph_or_default_atom(store, plan, to, true)?;
        let (Some(source), Some(target)) = (source, target) else {
            // A missing source graph has nothing to copy.
            return Ok(());
        };
        if source == target {
            return Ok(());
        }

        let source_quads = self.graph_quads(store, source)?;
        if clear_target {
            let target_quads = self.graph_quads(store, target)?;
            if !target_quads.is_empty() {
                let mut batch = store.begin_batch()?;
                for quad in target_quads {
                    batch.delete_current(quad[0], quad[1], quad[2], quad[3])?;
                }
                batch.commit()?;
            }
        }

        let mut batch = store.begin_batch()?;
        for quad in &source_quads {
            batch.add_current(target, quad[1], quad[2], quad[3])?;
        }
        if clear_source {
            for quad in &source_quads {
                batch.delete_current(quad[0], quad[1], quad[2], quad[3])?;
            }
        }
        batch.commit()?;
        Ok(())
    }
}

impl SubSelectExec for Engine {
    fn solutions(&self, env: &ExecEnv<'_>, query: &SelectQuery) -> Result<Vec<TableRow>, Error> {
        let (variables, rows) = self.select(env, query)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut table_row = Vec::new();
            for (var, value) in variables.iter().zip(&row.values) {
                if let Some(text) = value.as_ref().and_then(Value::to_term_text) {
                    table_row.push((var.clone(), text));
                }
            }
            out.push(table_row);
        }
        Ok(out)
    }
}

/// Evaluate a projection/HAVING/ORDER expression over one group. With
/// no aggregates inside, the group's first row stands in.
fn eval_over_group(ctx: &EvalContext<'_>, group: &[Row], expr: &Expr) -> Option<Value> {
    match expr {
        Expr::Aggregate {
            func,
            distinct,
            expr,
            separator,
        } => {
            let values: Vec<Value> = match expr {
                None => group.iter().map(|_| Value::Integer(1)).collect(),
                Some(inner) => group.iter().map(|row| eval(ctx, row, inner)).collect(),
            };
            let separator = separator
                .map(|s| sparql::unescape(ctx.plan.text(s)))
                .unwrap_or_else(|| " ".to_string());
            Some(crate::expr::aggregate(*func, *distinct, values, &separator))
        }
        Expr::Binary { op, lhs, rhs } => {
            let l = eval_over_group(ctx, group, lhs)?;
            let r = eval_over_group(ctx, group, rhs)?;
            Some(crate::expr::apply_binary(*op, l, r))
        }
        Expr::Not(inner) => match eval_over_group(ctx, group, inner)?.ebv() {
            Value::Boolean(b) => Some(Value::Boolean(!b)),
            _ => Some(Value::Error),
        },
        _ => {
            let row = group.first()?;
            Some(eval(ctx, row, expr))
        }
    }
}

fn has_aggregates(q: &SelectQuery) -> bool {
    fn expr_has(expr: &Expr) -> bool {
        match expr {
            Expr::Aggregate { .. } => true,
            Expr::Not(e) | Expr::Neg(e) => expr_has(e),
            Expr::Binary { lhs, rhs, .. } => expr_has(lhs) || expr_has(rhs),
            Expr::In {
                needle, haystack, ..
            } => expr_has(needle) || haystack.iter().any(expr_has),
            Expr::Call { args, .. } => args.iter().any(expr_has),
            Expr::Term(_) => false,
        }
    }
    let in_projection = match &q.projection {
        Projection::All => false,
        Projection::Elems(elems) => elems
            .iter()
            .any(|e| e.expr.as_ref().map(expr_has).unwrap_or(false)),
    };
    in_projection || q.modifiers.having.iter().any(expr_has)
}

/// The result variable list: projected names, or every in-scope
/// variable in first-mention order for `SELECT *`.
fn projected_variables(plan: &LogicalPlan, q: &SelectQuery) -> Vec<String> {
    match &q.projection {
        Projection::Elems(elems) => elems
            .iter()
            .filter_map(|e| match e.var {
                Term::Var(name) => Some(plan.text(name).to_string()),
                _ => None,
            })
            .collect(),
        Projection::All => {
            let mut out = Vec::new();
            collect_in_order(plan, &q.patterns, &mut out);
            out
        }
    }
}

fn push_var(plan: &LogicalPlan, term: &Term, out: &mut Vec<String>) {
    if let Term::Var(name) = term {
        let name = plan.text(*name);
        if !out.iter().any(|v| v == name) {
            out.push(name.to_string());
        }
    }
}

fn collect_in_order(plan: &LogicalPlan, patterns: &[Pattern], out: &mut Vec<String>) {
    for pattern in patterns {
        match pattern {
            Pattern::Triple(t) => {
                push_var(plan, &t.subject, out);
                push_var(plan, &t.predicate, out);
                push_var(plan, &t.object, out);
            }
            Pattern::Filter(_) => {}
            Pattern::Optional(inner) | Pattern::Minus(inner) => {
                collect_in_order(plan, inner, out)
            }
            Pattern::Union(left, right) => {
                collect_in_order(plan, left, out);
                collect_in_order(plan, right, out);
            }
            Pattern::Graph { graph, patterns } => {
                push_var(plan, graph, out);
                collect_in_order(plan, patterns, out);
            }
            Pattern::Bind { var, .. } => push_var(plan, var, out),
            Pattern::Values { vars, .. } => {
                for var in vars {
                    push_var(plan, var, out);
                }
            }
            Pattern::Service { patterns, .. } => collect_in_order(plan, patterns, out),
            Pattern::SubSelect(select) => match &select.projection {
                Projection::All => collect_in_order(plan, &select.patterns, out),
                Projection::Elems(elems) => {
                    for elem in elems {
                        push_var(plan, &elem.var, out);
                    }
                }
            },
        }
    }
}

// ---- update helpers ----

/// Per-request blank-node relabeling: each distinct label in the
/// request maps to a fresh generated label.
#[derive(Default)]
struct BlankAllocator {
    scope: Option<usize>,
    labels: FxHashMap<String, String>,
}

impl BlankAllocator {
    fn scoped(scope: usize) -> Self {
        Self {
            scope: Some(scope),
            labels: FxHashMap::default(),
        }
    }

    fn resolve(&mut self, label: &str) -> String {
        if let Some(existing) = self.labels.get(label) {
            return existing.clone();
        }
        let fresh = match self.scope {
            Some(scope) => format!(
                "_:{}_{scope}_{}",
                label,
                uuid::Uuid::new_v4().simple()
            ),
            None => format!("_:{}_{}", label, uuid::Uuid::new_v4().simple()),
        };
        self.labels.insert(label.to_string(), fresh.clone());
        fresh
    }
}

fn lookup_iri(store: &QuadStore, iri: &str) -> Result<Option<Atom>, Error> {
    Ok(store.atoms().lookup(&format!("<{iri}>"))?)
}

fn intern_iri(store: &QuadStore, iri: &str) -> Result<Atom, Error> {
    Ok(store.atoms().intern(&format!("<{iri}>"))?)
}

fn graph_or_default_atom(
    store: &QuadStore,
    plan: &LogicalPlan,
    g: &GraphOrDefault,
    create: bool,
) -> Result<Option<Atom>, Error> {
    match g {
        GraphOrDefault::Default => Ok(Some(Atom::DEFAULT_GRAPH)),
        GraphOrDefault::Graph(iri) => {
            let text = plan.text(*iri);
            if create {
                Ok(Some(intern_iri(store, text)?))
            } else {
                lookup_iri(store, text)
            }
        }
    }
}

fn block_triples(blocks: &[QuadBlock]) -> impl Iterator<Item = (Option<&Term>, &TriplePattern)> {
    blocks
        .iter()
        .flat_map(|block| block.triples.iter().map(move |t| (block.graph.as_ref(), t)))
}

/// Ground every quad of a data block, interning terms as needed.
fn ground_quads(
    store: &QuadStore,
    plan: &LogicalPlan,
    blocks: &[QuadBlock],
    with_graph: Option<Atom>,
    blanks: &mut BlankAllocator,
) -> Result<Vec<[Atom; 4]>, Error> {
    let ctx = EvalContext::new(plan);
    let row = Row::new();
    let mut out = Vec::new();

    for (graph_term, triple) in block_triples(blocks) {
        let graph = match graph_term {
            None => with_graph.unwrap_or(Atom::DEFAULT_GRAPH),
            Some(term) => {
                let Some(text) = ctx.term_atom_text(term) else {
                    return Err(Error::Eval("graph name must be ground".to_string()));
                };
                store.atoms().intern(&text)?
            }
        };
        let mut atoms_out = [graph; 4];
        for (slot, term) in [&triple.subject, &triple.predicate, &triple.object]
            .into_iter()
            .enumerate()
        {
            let text = match term {
                Term::Blank(label) => blanks.resolve(plan.text(*label)),
                Term::Var(_) => {
                    return Err(Error::Eval("data blocks cannot contain variables".to_string()))
                }
                other => ctx
                    .term_value(&row, other)
                    .to_term_text()
                    .ok_or_else(|| Error::Eval("unbindable term in data block".to_string()))?,
            };
            atoms_out[slot + 1] = store.atoms().intern(&text)?;
        }
        out.push(atoms_out);
    }
    Ok(out)
}

/// Instantiate a template triple against one solution row; `None` when
/// a variable is unbound in the row.
fn instantiate(
    store: &QuadStore,
    plan: &LogicalPlan,
    row: &Row,
    graph_term: Option<&Term>,
    triple: &TriplePattern,
    with_graph: Option<Atom>,
    intern_missing: bool,
) -> Result<Option<[Atom; 4]>, Error> {
    let ctx = EvalContext::new(plan);
    let term_atom = |term: &Term| -> Result<Option<Atom>, Error> {
        let text = match term {
            Term::Var(name) => {
                let name = plan.text(*name);
                match row.get_by_name(name) {
                    Some(b) => row.term_text_of(b).to_string(),
                    None => return Ok(None),
                }
            }
            other => match ctx.term_value(row, other).to_term_text() {
                Some(text) => text,
                None => return Ok(None),
            },
        };
        if intern_missing {
            Ok(Some(store.atoms().intern(&text)?))
        } else {
            Ok(store.atoms().lookup(&text)?)
        }
    };

    let graph = match graph_term {
        None => with_graph.unwrap_or(Atom::DEFAULT_GRAPH),
        Some(term) => match term_atom(term)? {
            Some(atom) => atom,
            None => return Ok(None),
        },
    };
    let (Some(s), Some(p), Some(o)) = (
        term_atom(&triple.subject)?,
        term_atom(&triple.predicate)?,
        term_atom(&triple.object)?,
    ) else {
        return Ok(None);
    };
    Ok(Some([graph, s, p, o]))
}

fn instantiate_with_blanks(
    store: &QuadStore,
    plan: &LogicalPlan,
    row: &Row,
    graph_term: Option<&Term>,
    triple: &TriplePattern,
    with_graph: Option<Atom>,
    blanks: &mut BlankAllocator,
) -> Result<Option<[Atom; 4]>, Error> {
    // Rewrite template blank nodes to fresh labels, then intern.
    let rewrite = |term: &Term, blanks: &mut BlankAllocator| -> Result<Option<Atom>, Error> {
        if let Term::Blank(label) = term {
            let label = blanks.resolve(plan.text(*label));
            return Ok(Some(store.atoms().intern(&label)?));
        }
        let ctx = EvalContext::new(plan);
        let text = match term {
            Term::Var(name) => {
                let name = plan.text(*name);
                match row.get_by_name(name) {
                    Some(b) => row.term_text_of(b).to_string(),
                    None => return Ok(None),
                }
            }
            other => match ctx.term_value(row, other).to_term_text() {
                Some(text) => text,
                None => return Ok(None),
            },
        };
        Ok(Some(store.atoms().intern(&text)?))
    };

    let graph = match graph_term {
        None => with_graph.unwrap_or(Atom::DEFAULT_GRAPH),
        Some(term) => match rewrite(term, blanks)? {
            Some(atom) => atom,
            None => return Ok(None),
        },
    };
    let (Some(s), Some(p), Some(o)) = (
        rewrite(&triple.subject, blanks)?,
        rewrite(&triple.predicate, blanks)?,
        rewrite(&triple.object, blanks)?,
    ) else {
        return Ok(None);
    };
    Ok(Some([graph, s, p, o]))
}
