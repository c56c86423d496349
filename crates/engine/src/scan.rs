use crate::expr::{eval, filter_passes, EvalContext};
use crate::planner::{self, Stats};
use crate::{Error, Row, RowMark, ServiceExecutor, ServiceRow};
use atoms::Atom;
use quads::{Instant, QuadIter, QuadPattern, QuadStore, ScanMode};
use sparql::{Expr, Pattern, Query, SelectQuery, Term, TriplePattern};
use std::collections::HashSet;

/// One materialized solution row: (variable, canonical term text).
pub type TableRow = Vec<(String, String)>;

/// Recursive evaluation of subqueries, implemented by the executor.
pub trait SubSelectExec {
    fn solutions(&self, env: &ExecEnv<'_>, query: &SelectQuery) -> Result<Vec<TableRow>, Error>;
}

/// Everything a running operator needs: the store, the evaluation
/// context, the dataset graphs, and the injected collaborators.
pub struct ExecEnv<'e> {
    pub store: &'e QuadStore,
    pub ctx: EvalContext<'e>,
    pub service: &'e dyn ServiceExecutor,
    pub subselect: &'e dyn SubSelectExec,
    /// Graphs composing the default dataset (the default-graph union).
    pub default_graphs: Vec<Atom>,
    /// Graphs a graph variable ranges over.
    pub named_graphs: Vec<Atom>,
    /// Temporal snapshot every scan reads at.
    pub as_of: Instant,
}

impl<'e> ExecEnv<'e> {
    fn stats(&self) -> StoreStats<'e> {
        StoreStats { store: self.store }
    }
}

pub struct StoreStats<'e> {
    store: &'e QuadStore,
}

impl Stats for StoreStats<'_> {
    fn predicate_cardinality(&self, predicate_iri: &str) -> u64 {
        let text = format!("<{predicate_iri}>");
        match self.store.atoms().lookup(&text) {
            Ok(Some(atom)) => self.store.predicate_cardinality(atom),
            _ => 0,
        }
    }

    fn total_quads(&self) -> u64 {
        self.store.get_statistics().quad_count
    }
}

/// The graph position of a scan, decided at build time.
enum GraphSpec<'p> {
    /// Patterns outside GRAPH: the default-graph union.
    DefaultUnion,
    /// GRAPH <iri> or GRAPH ?var.
    Named(&'p Term),
}

/// Where an unbound variable of the pattern lands in the quad.
#[derive(Copy, Clone, PartialEq)]
enum QuadPos {
    Graph,
    Subject,
    Predicate,
    Object,
}

/// The spec state machine of a pattern scan.
enum ScanState {
    NotStarted,
    Streaming(QuadIter),
    Exhausted,
}

/// Single triple-pattern scan: seek the index with the most-bound GSPO
/// prefix, stream matches, bind the pattern's unbound variables.
pub struct TripleScan<'p> {
    triple: &'p TriplePattern,
    graph: GraphSpec<'p>,
    mark: RowMark,
    state: ScanState,
    /// Graphs remaining to stream, for union / graph-variable scans.
    graph_queue: Vec<Atom>,
    graph_at: usize,
    /// Variable bound per graph iterated, for GRAPH ?g.
    graph_var: Option<String>,
    to_bind: Vec<(String, QuadPos)>,
    pattern: QuadPattern,
}

impl<'p> TripleScan<'p> {
    fn open(&mut self, env: &ExecEnv<'_>, row: &Row) -> Result<(), Error> {
        self.mark = row.mark();
        self.graph_at = 0;
        self.to_bind.clear();
        self.graph_var = None;

        // Resolve the graph position.
        self.graph_queue = match &self.graph {
            GraphSpec::DefaultUnion => env.default_graphs.clone(),
            GraphSpec::Named(term) => match term {
                Term::Var(name) => {
                    let name = env.ctx.plan.text(*name);
                    match resolve_bound(env, row, name)? {
                        Resolved::Atom(atom) => vec![atom],
                        Resolved::Missing => Vec::new(),
                        Resolved::Unbound => {
                            self.graph_var = Some(name.to_string());
                            env.named_graphs.clone()
                        }
                    }
                }
                other => match resolve_constant(env, other)? {
                    Some(atom) => vec![atom],
                    None => Vec::new(),
                },
            },
        };

        // Resolve subject, predicate, object.
        let mut pattern = QuadPattern::any();
        for (term, pos) in [
            (&self.triple.subject, QuadPos::Subject),
            (&self.triple.predicate, QuadPos::Predicate),
            (&self.triple.object, QuadPos::Object),
        ] {
            let slot = match pos {
                QuadPos::Subject => &mut pattern.subject,
                QuadPos::Predicate => &mut pattern.predicate,
                QuadPos::Object => &mut pattern.object,
                QuadPos::Graph => unreachable!(),
            };
            match term {
                Term::Var(name) => {
                    let name = env.ctx.plan.text(*name);
                    match resolve_bound(env, row, name)? {
                        Resolved::Atom(atom) => *slot = Some(atom),
                        Resolved::Missing => {
                            self.graph_queue.clear();
                        }
                        Resolved::Unbound => {
                            self.to_bind.push((name.to_string(), pos));
                        }
                    }
                }
                other => match resolve_constant(env, other)? {
                    Some(atom) => *slot = Some(atom),
                    None => {
                        self.graph_queue.clear();
                    }
                },
            }
        }
        self.pattern = pattern;
        self.state = ScanState::NotStarted;
        Ok(())
    }

    fn advance(&mut self, env: &ExecEnv<'_>, row: &mut Row) -> Result<bool, Error> {
        loop {
            match &mut self.state {
                ScanState::NotStarted => {
                    // Seek the next queued graph.
                    let Some(&graph) = self.graph_queue.get(self.graph_at) else {
                        self.state = ScanState::Exhausted;
                        row.truncate(self.mark);
                        return Ok(false);
                    };
                    self.graph_at += 1;
                    let mut pattern = self.pattern;
                    pattern.graph = Some(graph);
                    self.state = ScanState::Streaming(
                        env.store.scan(pattern, ScanMode::AsOf(env.as_of)),
                    );
                }
                ScanState::Streaming(iter) => {
                    if !iter.advance() {
                        if let Some(err) = iter.take_error() {
                            self.state = ScanState::Exhausted;
                            return Err(err.into());
                        }
                        self.state = ScanState::NotStarted;
                        continue;
                    }
                    let quad = iter.current().expect("advance returned true");
                    row.truncate(self.mark);

                    if let Some(name) = &self.graph_var {
                        bind_atom(env, row, name, quad.graph)?;
                    }
                    if bind_quad(env, row, &self.to_bind, &quad)? {
                        return Ok(true);
                    }
                    // A repeated-variable mismatch: try the next quad.
                }
                ScanState::Exhausted => {
                    row.truncate(self.mark);
                    return Ok(false);
                }
            }
        }
    }

}

/// Bind the unbound pattern variables from a matching quad. False when
/// a variable repeated within the pattern disagrees.
fn bind_quad(
    env: &ExecEnv<'_>,
    row: &mut Row,
    to_bind: &[(String, QuadPos)],
    quad: &quads::Quad,
) -> Result<bool, Error> {
    for (name, pos) in to_bind {
        let atom = match pos {
            QuadPos::Graph => quad.graph,
            QuadPos::Subject => quad.subject,
            QuadPos::Predicate => quad.predicate,
            QuadPos::Object => quad.object,
        };
        if let Some(existing) = row.get_by_name(name) {
            // A variable repeated within this pattern must agree with
            // the component already bound from it.
            if existing.atom != Some(atom) {
                return Ok(false);
            }
            continue;
        }
        bind_atom(env, row, name, atom)?;
    }
    Ok(true)
}

enum Resolved {
    Atom(Atom),
    /// Bound to a term the store has never seen: no quad can match.
    Missing,
    Unbound,
}

fn resolve_bound(env: &ExecEnv<'_>, row: &Row, name: &str) -> Result<Resolved, Error> {
    let Some(binding) = row.get_by_name(name) else {
        return Ok(Resolved::Unbound);
    };
    if let Some(atom) = binding.atom {
        return Ok(Resolved::Atom(atom));
    }
    let text = row.term_text_of(binding).to_string();
    match env.store.atoms().lookup(&text)? {
        Some(atom) => Ok(Resolved::Atom(atom)),
        None => Ok(Resolved::Missing),
    }
}

fn resolve_constant(env: &ExecEnv<'_>, term: &Term) -> Result<Option<Atom>, Error> {
    let Some(text) = env.ctx.term_atom_text(term) else {
        return Ok(None);
    };
    Ok(env.store.atoms().lookup(&text)?)
}

fn bind_atom(env: &ExecEnv<'_>, row: &mut Row, name: &str, atom: Atom) -> Result<(), Error> {
    if atom == Atom::DEFAULT_GRAPH {
        row.bind(name, "", Some(atom));
        return Ok(());
    }
    let text = env.store.atoms().get(atom)?;
    row.bind(name, text.as_str(), Some(atom));
    Ok(())
}

/// One member of a join pipeline. Every step is a generator: `open`
/// captures the row mark, `advance` yields successive extensions of
/// the row and truncates back to the mark between alternatives.
pub enum Step<'p> {
    Scan(TripleScan<'p>),
    Filter {
        expr: &'p Expr,
        mark: RowMark,
        fired: bool,
    },
    Bind {
        expr: &'p Expr,
        var: String,
        mark: RowMark,
        fired: bool,
    },
    Values {
        vars: Vec<String>,
        rows: &'p [Vec<Option<Term>>],
        mark: RowMark,
        at: usize,
    },
    Optional {
        inner: Machine<'p>,
        mark: RowMark,
        matched: bool,
        emitted_bare: bool,
    },
    Union {
        left: Machine<'p>,
        right: Machine<'p>,
        mark: RowMark,
        on_right: bool,
    },
    Minus {
        inner_patterns: &'p [Pattern],
        mark: RowMark,
        fired: bool,
    },
    /// A nested group (e.g. the body of GRAPH) joined inline.
    Nested {
        inner: Machine<'p>,
        mark: RowMark,
    },
    SubQuery {
        query: &'p SelectQuery,
        table: Option<Vec<TableRow>>,
        mark: RowMark,
        at: usize,
    },
    Service {
        silent: bool,
        endpoint: &'p Term,
        patterns: &'p [Pattern],
        table: Option<Vec<ServiceRow>>,
        mark: RowMark,
        at: usize,
    },
}

impl<'p> Step<'p> {
    fn open(&mut self, env: &ExecEnv<'_>, row: &Row) -> Result<(), Error> {
        match self {
            Step::Scan(scan) => scan.open(env, row)?,
            Step::Filter { mark, fired, .. } => {
                *mark = row.mark();
                *fired = false;
            }
            Step::Bind { mark, fired, .. } => {
                *mark = row.mark();
                *fired = false;
            }
            Step::Values { mark, at, .. } => {
                *mark = row.mark();
                *at = 0;
            }
            Step::Optional {
                inner,
                mark,
                matched,
                emitted_bare,
            } => {
                *mark = row.mark();
                *matched = false;
                *emitted_bare = false;
                inner.reset(env, row)?;
            }
            Step::Union {
                left,
                right,
                mark,
                on_right,
            } => {
                *mark = row.mark();
                *on_right = false;
                left.reset(env, row)?;
                right.reset(env, row)?;
            }
            Step::Minus { mark, fired, .. } => {
                *mark = row.mark();
                *fired = false;
            }
            Step::Nested { inner, mark } => {
                *mark = row.mark();
                inner.reset(env, row)?;
            }
            Step::SubQuery {
                query,
                table,
                mark,
                at,
            } => {
                *mark = row.mark();
                *at = 0;
                if table.is_none() {
                    *table = Some(env.subselect.solutions(env, *query)?);
                }
            }
            Step::Service {
                silent,
                endpoint,
                patterns,
                table,
                mark,
                at,
            } => {
                *mark = row.mark();
                *at = 0;
                if table.is_none() {
                    *table = Some(fetch_service(env, *silent, *endpoint, *patterns)?);
                }
            }
        }
        Ok(())
    }

    fn advance(&mut self, env: &ExecEnv<'_>, row: &mut Row) -> Result<bool, Error> {
        match self {
            Step::Scan(scan) => scan.advance(env, row),
            Step::Filter { expr, mark, fired } => {
                row.truncate(*mark);
                if *fired {
                    return Ok(false);
                }
                *fired = true;
                Ok(filter_passes(&env.ctx, row, expr))
            }
            Step::Bind { expr, var, mark, fired } => {
                row.truncate(*mark);
                if *fired {
                    return Ok(false);
                }
                *fired = true;
                let value = eval(&env.ctx, row, expr);
                if let Some(text) = value.to_term_text() {
                    let atom = env.store.atoms().lookup(&text)?;
                    row.bind(var, &text, atom);
                }
                // An error expression leaves the variable unbound but
                // keeps the row.
                Ok(true)
            }
            Step::Values {
                vars,
                rows,
                mark,
                at,
            } => {
                'rows: while *at < rows.len() {
                    row.truncate(*mark);
                    let data = &rows[*at];
                    *at += 1;
                    for (var, value) in vars.iter().zip(data) {
                        let Some(term) = value else { continue };
                        let Some(text) = env.ctx.term_value(row, term).to_term_text() else {
                            continue 'rows;
                        };
                        match row.get_by_name(var) {
                            Some(existing) => {
                                if row.term_text_of(existing) != text {
                                    continue 'rows;
                                }
                            }
                            None => {
                                let atom = env.store.atoms().lookup(&text)?;
                                row.bind(var, &text, atom);
                            }
                        }
                    }
                    return Ok(true);
                }
                row.truncate(*mark);
                Ok(false)
            }
            Step::Optional {
                inner,
                mark,
                matched,
                emitted_bare,
            } => {
                if inner.advance(env, row)? {
                    *matched = true;
                    return Ok(true);
                }
                row.truncate(*mark);
                if !*matched && !*emitted_bare {
                    *emitted_bare = true;
                    return Ok(true);
                }
                Ok(false)
            }
            Step::Union {
                left,
                right,
                mark,
                on_right,
            } => {
                if !*on_right {
                    if left.advance(env, row)? {
                        return Ok(true);
                    }
                    row.truncate(*mark);
                    *on_right = true;
                }
                if right.advance(env, row)? {
                    return Ok(true);
                }
                row.truncate(*mark);
                Ok(false)
            }
            Step::Minus {
                inner_patterns,
                mark,
                fired,
            } => {
                row.truncate(*mark);
                if *fired {
                    return Ok(false);
                }
                *fired = true;

                // MINUS only removes when the inner group shares at
                // least one bound variable with the current row.
                let inner_vars = group_vars(env.ctx.plan, *inner_patterns);
                let shares = row.iter().any(|b| inner_vars.contains(row.name_of(b)));
                if !shares {
                    return Ok(true);
                }

                let mut probe = row.clone();
                let mut machine = build_machine(env, *inner_patterns, &bound_vars(row))?;
                machine.reset(env, &probe)?;
                if machine.advance(env, &mut probe)? {
                    return Ok(false);
                }
                Ok(true)
            }
            Step::Nested { inner, mark } => {
                if inner.advance(env, row)? {
                    Ok(true)
                } else {
                    row.truncate(*mark);
                    Ok(false)
                }
            }
            Step::SubQuery {
                table, mark, at, ..
            } => {
                let table = table.as_ref().expect("opened");
                while *at < table.len() {
                    row.truncate(*mark);
                    let solution = &table[*at];
                    *at += 1;
                    if bind_table_row(env, row, solution)? {
                        return Ok(true);
                    }
                }
                row.truncate(*mark);
                Ok(false)
            }
            Step::Service {
                table, mark, at, ..
            } => {
                let table = table.as_ref().expect("opened");
                while *at < table.len() {
                    row.truncate(*mark);
                    let solution = &table[*at];
                    *at += 1;
                    if bind_table_row(env, row, &solution.bindings)? {
                        return Ok(true);
                    }
                }
                row.truncate(*mark);
                Ok(false)
            }
        }
    }
}

/// Join a materialized solution against the row: shared variables must
/// agree on term text, fresh ones are bound.
fn bind_table_row(
    env: &ExecEnv<'_>,
    row: &mut Row,
    solution: &[(String, String)],
) -> Result<bool, Error> {
    for (var, text) in solution {
        match row.get_by_name(var) {
            Some(existing) => {
                if row.term_text_of(existing) != *text {
                    return Ok(false);
                }
            }
            None => {
                let atom = env.store.atoms().lookup(text)?;
                row.bind(var, text, atom);
            }
        }
    }
    Ok(true)
}

fn fetch_service(
    env: &ExecEnv<'_>,
    silent: bool,
    endpoint: &Term,
    patterns: &[Pattern],
) -> Result<Vec<ServiceRow>, Error> {
    let Term::Iri(iri) = endpoint else {
        // A variable endpoint must have been bound by now; resolving
        // it from the row is not supported.
        return if silent {
            Ok(Vec::new())
        } else {
            Err(Error::Unsupported("variable SERVICE endpoints"))
        };
    };
    let endpoint = env.ctx.plan.text(*iri).to_string();
    let query = env
        .ctx
        .plan
        .with_query(Query::Select(SelectQuery {
            distinct: false,
            projection: sparql::Projection::All,
            dataset: Vec::new(),
            patterns: patterns.to_vec(),
            modifiers: sparql::Modifiers::default(),
        }))
        .to_string();

    match env.service.select(&endpoint, &query) {
        Ok(rows) => Ok(rows),
        Err(err) if silent => {
            tracing::debug!(endpoint = %endpoint, error = %err, "SERVICE SILENT swallowed failure");
            Ok(Vec::new())
        }
        Err(err) => Err(err),
    }
}

/// Nested-loop multi-pattern join with truncation backtracking, over
/// an ordered pipeline of steps.
pub struct Machine<'p> {
    steps: Vec<Step<'p>>,
    state: MachineState,
    empty_pending: bool,
}

enum MachineState {
    NotStarted,
    At(usize),
    Done,
}

impl<'p> Machine<'p> {
    pub fn reset(&mut self, _env: &ExecEnv<'_>, _row: &Row) -> Result<(), Error> {
        self.state = MachineState::NotStarted;
        self.empty_pending = true;
        Ok(())
    }

    pub fn advance(&mut self, env: &ExecEnv<'_>, row: &mut Row) -> Result<bool, Error> {
        if self.steps.is_empty() {
            // An empty group matches exactly once.
            if self.empty_pending {
                self.empty_pending = false;
                return Ok(true);
            }
            return Ok(false);
        }

        let mut at = match self.state {
            MachineState::NotStarted => {
                self.steps[0].open(env, row)?;
                self.state = MachineState::At(0);
                0
            }
            MachineState::At(at) => at,
            MachineState::Done => return Ok(false),
        };

        loop {
            if self.steps[at].advance(env, row)? {
                if at + 1 == self.steps.len() {
                    self.state = MachineState::At(at);
                    return Ok(true);
                }
                at += 1;
                self.steps[at].open(env, row)?;
            } else {
                if at == 0 {
                    self.state = MachineState::Done;
                    return Ok(false);
                }
                at -= 1;
            }
        }
    }
}

fn bound_vars(row: &Row) -> HashSet<String> {
    row.iter().map(|b| row.name_of(b).to_string()).collect()
}

/// Variables mentioned anywhere in a group of patterns.
fn group_vars(plan: &sparql::LogicalPlan, patterns: &[Pattern]) -> HashSet<String> {
    let mut out = HashSet::new();
    collect_group_vars(plan, patterns, &mut out);
    out
}

fn term_var(plan: &sparql::LogicalPlan, t: &Term, out: &mut HashSet<String>) {
    if let Term::Var(name) = t {
        out.insert(plan.text(*name).to_string());
    }
}

fn collect_group_vars(plan: &sparql::LogicalPlan, patterns: &[Pattern], out: &mut HashSet<String>) {
    for pattern in patterns {
        match pattern {
            Pattern::Triple(t) => {
                term_var(plan, &t.subject, out);
                term_var(plan, &t.predicate, out);
                term_var(plan, &t.object, out);
            }
            Pattern::Filter(expr) => {
                out.extend(planner::expr_vars(plan, expr));
            }
            Pattern::Optional(inner) | Pattern::Minus(inner) => {
                collect_group_vars(plan, inner, out)
            }
            Pattern::Union(left, right) => {
                collect_group_vars(plan, left, out);
                collect_group_vars(plan, right, out);
            }
            Pattern::Graph { graph, patterns } => {
                term_var(plan, graph, out);
                collect_group_vars(plan, patterns, out);
            }
            Pattern::Bind { expr, var } => {
                out.extend(planner::expr_vars(plan, expr));
                term_var(plan, var, out);
            }
            Pattern::Values { vars, .. } => {
                for var in vars {
                    term_var(plan, var, out);
                }
            }
            Pattern::Service { patterns, .. } => collect_group_vars(plan, patterns, out),
            Pattern::SubSelect(select) => match &select.projection {
                sparql::Projection::All => collect_group_vars(plan, &select.patterns, out),
                sparql::Projection::Elems(elems) => {
                    for elem in elems {
                        term_var(plan, &elem.var, out);
                    }
                }
            },
        }
    }
}

/// Build the join machine for one group: plan the order, then lower
/// each pattern to a step. `graph` carries the enclosing GRAPH
/// context, if any.
pub fn build_machine<'p>(
    env: &ExecEnv<'_>,
    patterns: &'p [Pattern],
    bound: &HashSet<String>,
) -> Result<Machine<'p>, Error> {
    build_machine_in(env, patterns, bound, None)
}

fn build_machine_in<'p>(
    env: &ExecEnv<'_>,
    patterns: &'p [Pattern],
    bound: &HashSet<String>,
    graph: Option<&'p Term>,
) -> Result<Machine<'p>, Error> {
    let stats = env.stats();
    let planned = planner::plan_group(env.ctx.plan, &env.ctx, patterns, &stats, bound);
    if planned.always_empty {
        // A single never-matching scan keeps the machine semantics.
        return Ok(Machine {
            steps: vec![Step::Filter {
                expr: &FALSE_EXPR,
                mark: RowMark::default(),
                fired: false,
            }],
            state: MachineState::NotStarted,
            empty_pending: false,
        });
    }

    let mut steps = Vec::with_capacity(planned.items.len());
    let mut bound_now = bound.clone();

    for pattern in planned.items {
        match pattern {
            Pattern::Triple(triple) => {
                steps.push(Step::Scan(TripleScan {
                    triple,
                    graph: match graph {
                        Some(term) => GraphSpec::Named(term),
                        None => GraphSpec::DefaultUnion,
                    },
                    mark: RowMark::default(),
                    state: ScanState::Exhausted,
                    graph_queue: Vec::new(),
                    graph_at: 0,
                    graph_var: None,
                    to_bind: Vec::new(),
                    pattern: QuadPattern::any(),
                }));
                for var in planner::triple_vars(env.ctx.plan, triple) {
                    bound_now.insert(var);
                }
                if let Some(Term::Var(name)) = graph {
                    bound_now.insert(env.ctx.plan.text(*name).to_string());
                }
            }
            Pattern::Filter(expr) => steps.push(Step::Filter {
                expr,
                mark: RowMark::default(),
                fired: false,
            }),
            Pattern::Bind { expr, var } => {
                let Term::Var(name) = var else {
                    return Err(Error::Eval("BIND target must be a variable".to_string()));
                };
                let name = env.ctx.plan.text(*name).to_string();
                bound_now.insert(name.clone());
                steps.push(Step::Bind {
                    expr,
                    var: name,
                    mark: RowMark::default(),
                    fired: false,
                });
            }
            Pattern::Values { vars, rows } => {
                let mut names = Vec::with_capacity(vars.len());
                for var in vars {
                    let Term::Var(name) = var else {
                        return Err(Error::Eval("VALUES target must be a variable".to_string()));
                    };
                    let name = env.ctx.plan.text(*name).to_string();
                    bound_now.insert(name.clone());
                    names.push(name);
                }
                steps.push(Step::Values {
                    vars: names,
                    rows,
                    mark: RowMark::default(),
                    at: 0,
                });
            }
            Pattern::Optional(inner) => {
                let machine = build_machine_in(env, inner, &bound_now, graph)?;
                bound_now.extend(group_vars(env.ctx.plan, inner));
                steps.push(Step::Optional {
                    inner: machine,
                    mark: RowMark::default(),
                    matched: false,
                    emitted_bare: false,
                });
            }
            Pattern::Union(left, right) => {
                let left = build_machine_in(env, left, &bound_now, graph)?;
                let right = build_machine_in(env, right, &bound_now, graph)?;
                bound_now.extend(group_vars(env.ctx.plan, std::slice::from_ref(pattern)));
                steps.push(Step::Union {
                    left,
                    right,
                    mark: RowMark::default(),
                    on_right: false,
                });
            }
            Pattern::Minus(inner) => {
                steps.push(Step::Minus {
                    inner_patterns: inner,
                    mark: RowMark::default(),
                    fired: false,
                });
            }
            Pattern::Graph {
                graph: graph_term,
                patterns,
            } => {
                let machine = build_machine_in(env, patterns, &bound_now, Some(graph_term))?;
                bound_now.extend(group_vars(env.ctx.plan, patterns));
                if let Term::Var(name) = graph_term {
                    bound_now.insert(env.ctx.plan.text(*name).to_string());
                }
                steps.push(Step::Nested {
                    inner: machine,
                    mark: RowMark::default(),
                });
            }
            Pattern::SubSelect(select) => {
                bound_now.extend(group_vars(
                    env.ctx.plan,
                    std::slice::from_ref(pattern),
                ));
                steps.push(Step::SubQuery {
                    query: select.as_ref(),
                    table: None,
                    mark: RowMark::default(),
                    at: 0,
                });
            }
            Pattern::Service {
                silent,
                endpoint,
                patterns,
            } => {
                bound_now.extend(group_vars(env.ctx.plan, patterns));
                steps.push(Step::Service {
                    silent: *silent,
                    endpoint,
                    patterns,
                    table: None,
                    mark: RowMark::default(),
                    at: 0,
                });
            }
        }
    }

    Ok(Machine {
        steps,
        state: MachineState::NotStarted,
        empty_pending: true,
    })
}

// A constant-false expression (the empty string has a false effective
// boolean value), used to realize plan-time empty groups.
static FALSE_EXPR: Expr = Expr::Term(Term::Literal {
    lexical: sparql::Text::Synth(sparql::Span { start: 0, len: 0 }),
    datatype: None,
    lang: None,
});
