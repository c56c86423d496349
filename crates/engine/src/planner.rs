use crate::expr::{eval, EvalContext};
use crate::{Row, Value};
use lru::LruCache;
use parking_lot::Mutex;
use sparql::{Expr, LogicalPlan, Pattern, Term, TriplePattern};
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Cardinality inputs for join ordering, keyed by predicate IRI text.
pub trait Stats {
    fn predicate_cardinality(&self, predicate_iri: &str) -> u64;
    fn total_quads(&self) -> u64;
}

/// A group's execution order: triple patterns greedily ordered by
/// estimated selectivity, filters placed at their earliest full
/// binding, everything else in source order after the triples.
pub struct PlannedGroup<'p> {
    pub items: Vec<&'p Pattern>,
    /// A constant-false filter proved the group empty at plan time.
    pub always_empty: bool,
}

pub fn plan_group<'p>(
    plan: &LogicalPlan,
    ctx: &EvalContext<'_>,
    patterns: &'p [Pattern],
    stats: &dyn Stats,
    bound_in: &HashSet<String>,
) -> PlannedGroup<'p> {
    let mut triples: Vec<&'p Pattern> = Vec::new();
    let mut filters: Vec<&'p Pattern> = Vec::new();
    let mut rest: Vec<&'p Pattern> = Vec::new();

    for pattern in patterns {
        match pattern {
            Pattern::Triple(_) => triples.push(pattern),
            Pattern::Filter(expr) => {
                if expr_vars(plan, expr).is_empty() {
                    // Constant filter: decided once, at plan time.
                    match eval(ctx, &Row::new(), expr).ebv() {
                        Value::Boolean(true) => {}
                        _ => {
                            return PlannedGroup {
                                items: Vec::new(),
                                always_empty: true,
                            }
                        }
                    }
                } else {
                    filters.push(pattern);
                }
            }
            other => rest.push(other),
        }
    }

    // Greedy join order over the triple patterns.
    let mut bound: HashSet<String> = bound_in.clone();
    let mut ordered: Vec<&'p Pattern> = Vec::new();
    let mut remaining: Vec<(usize, &'p Pattern, &'p TriplePattern)> = triples
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let Pattern::Triple(t) = *p else {
                unreachable!()
            };
            (i, *p, t)
        })
        .collect();

    while !remaining.is_empty() {
        // Lower estimate wins; ties prefer more variables shared with
        // already-placed patterns, then the lower-ranked predicate,
        // then source order.
        let mut best_at = 0;
        let mut best_key: Option<(u64, std::cmp::Reverse<usize>, u64, usize)> = None;
        for (at, (source_order, _, triple)) in remaining.iter().enumerate() {
            let key = (
                estimate_rows(plan, triple, stats, &bound),
                std::cmp::Reverse(shared_vars(plan, triple, &bound)),
                predicate_rank(plan, triple),
                *source_order,
            );
            if best_key.map_or(true, |b| key < b) {
                best_key = Some(key);
                best_at = at;
            }
        }
        let (_, pattern, triple) = remaining.remove(best_at);
        for var in triple_vars(plan, triple) {
            bound.insert(var);
        }
        ordered.push(pattern);
    }

    // Push each filter to the earliest prefix that binds its variables.
    let mut items: Vec<&'p Pattern> = Vec::new();
    let mut pending: Vec<(&'p Pattern, HashSet<String>)> = filters
        .into_iter()
        .map(|p| {
            let Pattern::Filter(expr) = p else { unreachable!() };
            (p, expr_vars(plan, expr))
        })
        .collect();

    let mut bound_so_far = bound_in.clone();
    for pattern in ordered {
        items.push(pattern);
        let Pattern::Triple(t) = pattern else {
            unreachable!()
        };
        for var in triple_vars(plan, t) {
            bound_so_far.insert(var);
        }
        pending.retain(|(filter, vars)| {
            if vars.is_subset(&bound_so_far) {
                items.push(*filter);
                false
            } else {
                true
            }
        });
    }
    // Everything else in source order; filters whose variables are
    // never fully bound still run (over possibly-unbound terms) last.
    items.extend(rest);
    items.extend(pending.into_iter().map(|(p, _)| p));

    PlannedGroup {
        items,
        always_empty: false,
    }
}

/// Estimated rows a pattern yields given already-bound variables: the
/// predicate's cardinality (or the store total), narrowed for each
/// further bound component.
fn estimate_rows(
    plan: &LogicalPlan,
    triple: &TriplePattern,
    stats: &dyn Stats,
    bound: &HashSet<String>,
) -> u64 {
    let is_bound = |term: &Term| match term {
        Term::Var(name) => bound.contains(plan.text(*name)),
        _ => true,
    };

    let mut estimate = match &triple.predicate {
        Term::Iri(iri) => stats.predicate_cardinality(plan.text(*iri)).max(1),
        Term::Var(name) if bound.contains(plan.text(*name)) => stats.total_quads().max(1) / 2,
        _ => stats.total_quads().max(1),
    };
    if is_bound(&triple.subject) {
        estimate = (estimate / 10).max(1);
    }
    if is_bound(&triple.object) {
        estimate = (estimate / 10).max(1);
    }
    if is_bound(&triple.subject) && is_bound(&triple.object) && !triple.predicate.is_var() {
        estimate = 1;
    }
    estimate
}

fn shared_vars(plan: &LogicalPlan, triple: &TriplePattern, bound: &HashSet<String>) -> usize {
    triple_vars(plan, triple)
        .into_iter()
        .filter(|v| bound.contains(v))
        .count()
}

/// Tie-break rank standing in for "lower-indexed predicate atom":
/// constant predicates rank by IRI text, variables last.
fn predicate_rank(plan: &LogicalPlan, triple: &TriplePattern) -> u64 {
    match &triple.predicate {
        Term::Iri(iri) => {
            let text = plan.text(*iri);
            atoms::fnv1a(text.as_bytes()) >> 1
        }
        _ => u64::MAX,
    }
}

pub fn triple_vars(plan: &LogicalPlan, triple: &TriplePattern) -> Vec<String> {
    let mut out = Vec::new();
    for term in [&triple.subject, &triple.predicate, &triple.object] {
        if let Term::Var(name) = term {
            out.push(plan.text(*name).to_string());
        }
    }
    out
}

/// The set of variable names an expression references.
pub fn expr_vars(plan: &LogicalPlan, expr: &Expr) -> HashSet<String> {
    let mut out = HashSet::new();
    collect_expr_vars(plan, expr, &mut out);
    out
}

fn collect_expr_vars(plan: &LogicalPlan, expr: &Expr, out: &mut HashSet<String>) {
    match expr {
        Expr::Term(Term::Var(name)) => {
            out.insert(plan.text(*name).to_string());
        }
        Expr::Term(_) => {}
        Expr::Not(inner) | Expr::Neg(inner) => collect_expr_vars(plan, inner, out),
        Expr::Binary { lhs, rhs, .. } => {
            collect_expr_vars(plan, lhs, out);
            collect_expr_vars(plan, rhs, out);
        }
        Expr::In {
            needle, haystack, ..
        } => {
            collect_expr_vars(plan, needle, out);
            for item in haystack {
                collect_expr_vars(plan, item, out);
            }
        }
        Expr::Call { args, .. } => {
            for arg in args {
                collect_expr_vars(plan, arg, out);
            }
        }
        Expr::Aggregate { expr, .. } => {
            if let Some(inner) = expr {
                collect_expr_vars(plan, inner, out);
            }
        }
    }
}

/// Bounded LRU of parsed plans, keyed by (query text, dataset graph
/// count), invalidated when store statistics drift more than 25% from
/// the snapshot taken at parse time.
pub struct PlanCache {
    lru: Mutex<LruCache<(String, u64), CacheEntry>>,
}

struct CacheEntry {
    plan: Arc<LogicalPlan>,
    total_quads: u64,
}

impl PlanCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            lru: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("non-zero"),
            )),
        }
    }

    pub fn get_or_parse(
        &self,
        text: &str,
        graph_count: u64,
        total_quads: u64,
    ) -> Result<Arc<LogicalPlan>, sparql::ParseError> {
        let key = (text.trim().to_string(), graph_count);
        let mut lru = self.lru.lock();
        if let Some(entry) = lru.get(&key) {
            if !drifted(entry.total_quads, total_quads) {
                return Ok(entry.plan.clone());
            }
            tracing::debug!("plan cache entry invalidated by statistics drift");
            lru.pop(&key);
        }
        drop(lru);

        let plan = Arc::new(sparql::parse(text)?);
        self.lru.lock().put(
            key,
            CacheEntry {
                plan: plan.clone(),
                total_quads,
            },
        );
        Ok(plan)
    }
}

fn drifted(snapshot: u64, current: u64) -> bool {
    let base = snapshot.max(1);
    let delta = current.abs_diff(snapshot);
    delta * 4 > base
}

#[cfg(test)]
mod test {
    use super::*;

    struct FakeStats(Vec<(&'static str, u64)>, u64);

    impl Stats for FakeStats {
        fn predicate_cardinality(&self, predicate_iri: &str) -> u64 {
            self.0
                .iter()
                .find(|(p, _)| *p == predicate_iri)
                .map(|(_, n)| *n)
                .unwrap_or(0)
        }
        fn total_quads(&self) -> u64 {
            self.1
        }
    }

    fn triples_of<'p>(group: &PlannedGroup<'p>, plan: &LogicalPlan) -> Vec<String> {
        group
            .items
            .iter()
            .filter_map(|p| match p {
                Pattern::Triple(t) => match &t.predicate {
                    Term::Iri(iri) => Some(plan.text(*iri).to_string()),
                    _ => Some("?var".to_string()),
                },
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_selective_pattern_goes_first() {
        let plan = sparql::parse(
            "SELECT * WHERE { ?s <http://e/common> ?a . ?s <http://e/rare> ?b }",
        )
        .unwrap();
        let sparql::Query::Select(q) = &plan.query else {
            panic!()
        };
        let stats = FakeStats(vec![("http://e/common", 10_000), ("http://e/rare", 3)], 10_003);
        let ctx = EvalContext::new(&plan);
        let group = plan_group(&plan, &ctx, &q.patterns, &stats, &HashSet::new());
        assert_eq!(
            triples_of(&group, &plan),
            vec!["http://e/rare".to_string(), "http://e/common".to_string()]
        );
    }

    #[test]
    fn test_filter_placed_after_binding() {
        let plan = sparql::parse(
            "SELECT * WHERE { ?x <http://e/knows> ?f . ?f <http://e/age> ?age FILTER(?age > 40) }",
        )
        .unwrap();
        let sparql::Query::Select(q) = &plan.query else {
            panic!()
        };
        let stats = FakeStats(vec![("http://e/knows", 10), ("http://e/age", 10)], 20);
        let ctx = EvalContext::new(&plan);
        let group = plan_group(&plan, &ctx, &q.patterns, &stats, &HashSet::new());

        // The filter must come immediately after the pattern binding ?age.
        let filter_pos = group
            .items
            .iter()
            .position(|p| matches!(p, Pattern::Filter(_)))
            .unwrap();
        let age_pos = group
            .items
            .iter()
            .position(|p| match p {
                Pattern::Triple(t) => matches!(&t.predicate, Term::Iri(i) if plan.text(*i).ends_with("age")),
                _ => false,
            })
            .unwrap();
        assert_eq!(filter_pos, age_pos + 1);
    }

    #[test]
    fn test_constant_false_filter_empties_group() {
        let plan = sparql::parse("SELECT * WHERE { ?s ?p ?o FILTER(1 > 2) }").unwrap();
        let sparql::Query::Select(q) = &plan.query else {
            panic!()
        };
        let stats = FakeStats(vec![], 100);
        let ctx = EvalContext::new(&plan);
        let group = plan_group(&plan, &ctx, &q.patterns, &stats, &HashSet::new());
        assert!(group.always_empty);
    }

    #[test]
    fn test_constant_true_filter_is_dropped() {
        let plan = sparql::parse("SELECT * WHERE { ?s ?p ?o FILTER(2 > 1) }").unwrap();
        let sparql::Query::Select(q) = &plan.query else {
            panic!()
        };
        let stats = FakeStats(vec![], 100);
        let ctx = EvalContext::new(&plan);
        let group = plan_group(&plan, &ctx, &q.patterns, &stats, &HashSet::new());
        assert!(!group.always_empty);
        assert!(!group.items.iter().any(|p| matches!(p, Pattern::Filter(_))));
    }

    #[test]
    fn test_plan_cache_drift_invalidation() {
        let cache = PlanCache::new(8);
        let a = cache
            .get_or_parse("SELECT * WHERE { ?s ?p ?o }", 0, 100)
            .unwrap();
        // Within 25%: same Arc.
        let b = cache
            .get_or_parse("SELECT * WHERE { ?s ?p ?o }", 0, 110)
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        // Past 25%: re-parsed.
        let c = cache
            .get_or_parse("SELECT * WHERE { ?s ?p ?o }", 0, 200)
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
