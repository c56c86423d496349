//! Canonical rendering of a [`LogicalPlan`] back to SPARQL text.
//!
//! The printed form is a fixed point: parsing it and printing again
//! yields byte-identical text. Prefixes are gone (IRIs print absolute),
//! literals print with normalized escapes, and numeric literals print
//! bare when their lexical form allows it.

use crate::ast::*;
use crate::{escape, unescape, xsd, LogicalPlan, Text};
use std::fmt;

impl fmt::Display for LogicalPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = Printer { plan: self };
        match &self.query {
            Query::Select(q) => p.select(f, q, 0),
            Query::Ask(q) => {
                f.write_str("ASK")?;
                p.dataset(f, &q.dataset)?;
                f.write_str(" ")?;
                p.group(f, &q.patterns, 0)
            }
            Query::Construct(q) => {
                f.write_str("CONSTRUCT {\n")?;
                for t in &q.template {
                    p.indent(f, 1)?;
                    p.triple(f, t)?;
                    f.write_str("\n")?;
                }
                f.write_str("}")?;
                p.dataset(f, &q.dataset)?;
                f.write_str(" WHERE ")?;
                p.group(f, &q.patterns, 0)?;
                p.modifiers(f, &q.modifiers, 0)
            }
            Query::Describe(q) => {
                f.write_str("DESCRIBE")?;
                if q.targets.is_empty() {
                    f.write_str(" *")?;
                } else {
                    for t in &q.targets {
                        f.write_str(" ")?;
                        p.term(f, t)?;
                    }
                }
                p.dataset(f, &q.dataset)?;
                if !q.patterns.is_empty() {
                    f.write_str(" WHERE ")?;
                    p.group(f, &q.patterns, 0)?;
                }
                p.modifiers(f, &q.modifiers, 0)
            }
            Query::Update(ops) => {
                for (i, op) in ops.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ;\n")?;
                    }
                    p.update(f, op)?;
                }
                Ok(())
            }
        }
    }
}

struct Printer<'p> {
    plan: &'p LogicalPlan,
}

impl<'p> Printer<'p> {
    fn indent(&self, f: &mut fmt::Formatter<'_>, level: usize) -> fmt::Result {
        for _ in 0..level {
            f.write_str("  ")?;
        }
        Ok(())
    }

    fn text(&self, text: Text) -> &str {
        self.plan.text(text)
    }

    fn select(&self, f: &mut fmt::Formatter<'_>, q: &SelectQuery, level: usize) -> fmt::Result {
        f.write_str("SELECT")?;
        if q.distinct {
            f.write_str(" DISTINCT")?;
        }
        match &q.projection {
            Projection::All => f.write_str(" *")?,
            Projection::Elems(elems) => {
                for elem in elems {
                    f.write_str(" ")?;
                    match &elem.expr {
                        None => self.term(f, &elem.var)?,
                        Some(expr) => {
                            f.write_str("(")?;
                            self.expr(f, expr)?;
                            f.write_str(" AS ")?;
                            self.term(f, &elem.var)?;
                            f.write_str(")")?;
                        }
                    }
                }
            }
        }
        self.dataset(f, &q.dataset)?;
        f.write_str(" WHERE ")?;
        self.group(f, &q.patterns, level)?;
        self.modifiers(f, &q.modifiers, level)
    }

    fn dataset(&self, f: &mut fmt::Formatter<'_>, clauses: &[DatasetClause]) -> fmt::Result {
        for clause in clauses {
            match clause {
                DatasetClause::Default(iri) => write!(f, " FROM <{}>", self.text(*iri))?,
                DatasetClause::Named(iri) => write!(f, " FROM NAMED <{}>", self.text(*iri))?,
            }
        }
        Ok(())
    }

    fn modifiers(&self, f: &mut fmt::Formatter<'_>, m: &Modifiers, level: usize) -> fmt::Result {
        if !m.group_by.is_empty() {
            f.write_str("\n")?;
            self.indent(f, level)?;
            f.write_str("GROUP BY")?;
            for expr in &m.group_by {
                f.write_str(" ")?;
                self.grouping_expr(f, expr)?;
            }
        }
        for having in &m.having {
            f.write_str("\n")?;
            self.indent(f, level)?;
            f.write_str("HAVING (")?;
            self.expr(f, having)?;
            f.write_str(")")?;
        }
        if !m.order_by.is_empty() {
            f.write_str("\n")?;
            self.indent(f, level)?;
            f.write_str("ORDER BY")?;
            for (expr, desc) in &m.order_by {
                f.write_str(" ")?;
                if *desc {
                    f.write_str("DESC(")?;
                    self.expr(f, expr)?;
                    f.write_str(")")?;
                } else {
                    self.grouping_expr(f, expr)?;
                }
            }
        }
        if let Some(limit) = m.limit {
            f.write_str("\n")?;
            self.indent(f, level)?;
            write!(f, "LIMIT {limit}")?;
        }
        if let Some(offset) = m.offset {
            f.write_str("\n")?;
            self.indent(f, level)?;
            write!(f, "OFFSET {offset}")?;
        }
        Ok(())
    }

    /// GROUP BY / ORDER BY position: bare variables print bare, other
    /// expressions parenthesize.
    fn grouping_expr(&self, f: &mut fmt::Formatter<'_>, expr: &Expr) -> fmt::Result {
        match expr {
            Expr::Term(term @ Term::Var(_)) => self.term(f, term),
            other => {
                f.write_str("(")?;
                self.expr(f, other)?;
                f.write_str(")")
            }
        }
    }

    fn group(&self, f: &mut fmt::Formatter<'_>, patterns: &[Pattern], level: usize) -> fmt::Result {
        f.write_str("{\n")?;
        for pattern in patterns {
            self.pattern(f, pattern, level + 1)?;
        }
        self.indent(f, level)?;
        f.write_str("}")
    }

    fn pattern(&self, f: &mut fmt::Formatter<'_>, pattern: &Pattern, level: usize) -> fmt::Result {
        self.indent(f, level)?;
        match pattern {
            Pattern::Triple(t) => {
                self.triple(f, t)?;
            }
            Pattern::Filter(expr) => {
                f.write_str("FILTER (")?;
                self.expr(f, expr)?;
                f.write_str(")")?;
            }
            Pattern::Optional(inner) => {
                f.write_str("OPTIONAL ")?;
                self.group(f, inner, level)?;
            }
            Pattern::Minus(inner) => {
                f.write_str("MINUS ")?;
                self.group(f, inner, level)?;
            }
            Pattern::Union(left, right) => {
                self.group(f, left, level)?;
                f.write_str(" UNION ")?;
                self.group(f, right, level)?;
            }
            Pattern::Graph { graph, patterns } => {
                f.write_str("GRAPH ")?;
                self.term(f, graph)?;
                f.write_str(" ")?;
                self.group(f, patterns, level)?;
            }
            Pattern::Bind { expr, var } => {
                f.write_str("BIND (")?;
                self.expr(f, expr)?;
                f.write_str(" AS ")?;
                self.term(f, var)?;
                f.write_str(")")?;
            }
            Pattern::Values { vars, rows } => {
                f.write_str("VALUES (")?;
                for (i, var) in vars.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    self.term(f, var)?;
                }
                f.write_str(") { ")?;
                for row in rows {
                    f.write_str("(")?;
                    for (i, value) in row.iter().enumerate() {
                        if i > 0 {
                            f.write_str(" ")?;
                        }
                        match value {
                            None => f.write_str("UNDEF")?,
                            Some(term) => self.term(f, term)?,
                        }
                    }
                    f.write_str(") ")?;
                }
                f.write_str("}")?;
            }
            Pattern::Service {
                silent,
                endpoint,
                patterns,
            } => {
                f.write_str("SERVICE ")?;
                if *silent {
                    f.write_str("SILENT ")?;
                }
                self.term(f, endpoint)?;
                f.write_str(" ")?;
                self.group(f, patterns, level)?;
            }
            Pattern::SubSelect(select) => {
                f.write_str("{ ")?;
                self.select(f, select, level)?;
                f.write_str(" }")?;
            }
        }
        f.write_str("\n")
    }

    fn triple(&self, f: &mut fmt::Formatter<'_>, t: &TriplePattern) -> fmt::Result {
        self.term(f, &t.subject)?;
        f.write_str(" ")?;
        self.term(f, &t.predicate)?;
        f.write_str(" ")?;
        self.term(f, &t.object)?;
        f.write_str(" .")
    }

    fn term(&self, f: &mut fmt::Formatter<'_>, term: &Term) -> fmt::Result {
        match term {
            Term::Var(name) => write!(f, "?{}", self.text(*name)),
            Term::Iri(iri) => write!(f, "<{}>", self.text(*iri)),
            Term::Blank(label) => write!(f, "_:{}", self.text(*label)),
            Term::Literal {
                lexical,
                datatype,
                lang,
            } => {
                let body = unescape(self.text(*lexical));
                if let Some(tag) = lang {
                    return write!(f, "\"{}\"@{}", escape(&body), self.text(*tag));
                }
                if let Some(dt) = datatype {
                    let dt_text = self.text(*dt);
                    // Shorthand-eligible numerics and booleans print bare.
                    if dt_text == xsd::INTEGER && is_integer_lexical(&body) {
                        return f.write_str(&body);
                    }
                    if dt_text == xsd::DECIMAL && is_decimal_lexical(&body) {
                        return f.write_str(&body);
                    }
                    if dt_text == xsd::BOOLEAN && (body == "true" || body == "false") {
                        return f.write_str(&body);
                    }
                    return write!(f, "\"{}\"^^<{}>", escape(&body), dt_text);
                }
                write!(f, "\"{}\"", escape(&body))
            }
        }
    }

    fn expr(&self, f: &mut fmt::Formatter<'_>, expr: &Expr) -> fmt::Result {
        match expr {
            Expr::Term(term) => self.term(f, term),
            Expr::Not(inner) => {
                f.write_str("!(")?;
                self.expr(f, inner)?;
                f.write_str(")")
            }
            Expr::Neg(inner) => {
                f.write_str("-(")?;
                self.expr(f, inner)?;
                f.write_str(")")
            }
            Expr::Binary { op, lhs, rhs } => {
                f.write_str("(")?;
                self.expr(f, lhs)?;
                write!(f, " {} ", op.symbol())?;
                self.expr(f, rhs)?;
                f.write_str(")")
            }
            Expr::In {
                needle,
                haystack,
                negated,
            } => {
                f.write_str("(")?;
                self.expr(f, needle)?;
                f.write_str(if *negated { " NOT IN (" } else { " IN (" })?;
                for (i, item) in haystack.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    self.expr(f, item)?;
                }
                f.write_str("))")
            }
            Expr::Call { func, args } => {
                f.write_str(func.name())?;
                f.write_str("(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    self.expr(f, arg)?;
                }
                f.write_str(")")
            }
            Expr::Aggregate {
                func,
                distinct,
                expr,
                separator,
            } => {
                f.write_str(func.name())?;
                f.write_str("(")?;
                if *distinct {
                    f.write_str("DISTINCT ")?;
                }
                match expr {
                    None => f.write_str("*")?,
                    Some(inner) => self.expr(f, inner)?,
                }
                if let Some(sep) = separator {
                    let body = unescape(self.text(*sep));
                    write!(f, "; SEPARATOR=\"{}\"", escape(&body))?;
                }
                f.write_str(")")
            }
        }
    }

    fn update(&self, f: &mut fmt::Formatter<'_>, op: &UpdateOp) -> fmt::Result {
        match op {
            UpdateOp::InsertData(blocks) => {
                f.write_str("INSERT DATA ")?;
                self.quad_blocks(f, blocks)
            }
            UpdateOp::DeleteData(blocks) => {
                f.write_str("DELETE DATA ")?;
                self.quad_blocks(f, blocks)
            }
            UpdateOp::Modify {
                with,
                delete,
                insert,
                using,
                patterns,
            } => {
                if let Some(g) = with {
                    write!(f, "WITH <{}> ", self.text(*g))?;
                }
                if !delete.is_empty() {
                    f.write_str("DELETE ")?;
                    self.quad_blocks(f, delete)?;
                    f.write_str(" ")?;
                }
                if !insert.is_empty() {
                    f.write_str("INSERT ")?;
                    self.quad_blocks(f, insert)?;
                    f.write_str(" ")?;
                }
                if delete.is_empty() && insert.is_empty() {
                    f.write_str("DELETE { } ")?;
                }
                for clause in using {
                    match clause {
                        DatasetClause::Default(iri) => write!(f, "USING <{}> ", self.text(*iri))?,
                        DatasetClause::Named(iri) => {
                            write!(f, "USING NAMED <{}> ", self.text(*iri))?
                        }
                    }
                }
                f.write_str("WHERE ")?;
                self.group(f, patterns, 0)
            }
            UpdateOp::Clear { silent, target } => {
                f.write_str("CLEAR ")?;
                if *silent {
                    f.write_str("SILENT ")?;
                }
                self.graph_target(f, target)
            }
            UpdateOp::Drop { silent, target } => {
                f.write_str("DROP ")?;
                if *silent {
                    f.write_str("SILENT ")?;
                }
                self.graph_target(f, target)
            }
            UpdateOp::Create { silent, graph } => {
                f.write_str("CREATE ")?;
                if *silent {
                    f.write_str("SILENT ")?;
                }
                write!(f, "GRAPH <{}>", self.text(*graph))
            }
            UpdateOp::Copy { silent, from, to } => {
                f.write_str("COPY ")?;
                if *silent {
                    f.write_str("SILENT ")?;
                }
                self.graph_or_default(f, from)?;
                f.write_str(" TO ")?;
                self.graph_or_default(f, to)
            }
            UpdateOp::Move { silent, from, to } => {
                f.write_str("MOVE ")?;
                if *silent {
                    f.write_str("SILENT ")?;
                }
                self.graph_or_default(f, from)?;
                f.write_str(" TO ")?;
                self.graph_or_default(f, to)
            }
            UpdateOp::Add { silent, from, to } => {
                f.write_str("ADD ")?;
                if *silent {
                    f.write_str("SILENT ")?;
                }
                self.graph_or_default(f, from)?;
                f.write_str(" TO ")?;
                self.graph_or_default(f, to)
            }
        }
    }

    fn graph_target(&self, f: &mut fmt::Formatter<'_>, target: &GraphTarget) -> fmt::Result {
        match target {
            GraphTarget::Default => f.write_str("DEFAULT"),
            GraphTarget::Named => f.write_str("NAMED"),
            GraphTarget::All => f.write_str("ALL"),
            GraphTarget::Graph(iri) => write!(f, "GRAPH <{}>", self.text(*iri)),
        }
    }

    fn graph_or_default(&self, f: &mut fmt::Formatter<'_>, g: &GraphOrDefault) -> fmt::Result {
        match g {
            GraphOrDefault::Default => f.write_str("DEFAULT"),
            GraphOrDefault::Graph(iri) => write!(f, "GRAPH <{}>", self.text(*iri)),
        }
    }

    fn quad_blocks(&self, f: &mut fmt::Formatter<'_>, blocks: &[QuadBlock]) -> fmt::Result {
        f.write_str("{\n")?;
        for block in blocks {
            match &block.graph {
                None => {
                    for t in &block.triples {
                        self.indent(f, 1)?;
                        self.triple(f, t)?;
                        f.write_str("\n")?;
                    }
                }
                Some(graph) => {
                    self.indent(f, 1)?;
                    f.write_str("GRAPH ")?;
                    self.term(f, graph)?;
                    f.write_str(" {\n")?;
                    for t in &block.triples {
                        self.indent(f, 2)?;
                        self.triple(f, t)?;
                        f.write_str("\n")?;
                    }
                    self.indent(f, 1)?;
                    f.write_str("}\n")?;
                }
            }
        }
        f.write_str("}")
    }
}

fn is_integer_lexical(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn is_decimal_lexical(s: &str) -> bool {
    let body = s.strip_prefix('-').unwrap_or(s);
    match body.split_once('.') {
        Some((whole, frac)) => {
            !frac.is_empty()
                && whole.bytes().all(|b| b.is_ascii_digit())
                && frac.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

#[cfg(test)]
mod test {
    use crate::parse;
    use pretty_assertions::assert_eq;

    fn round_trip(src: &str) -> String {
        let plan = parse(src).unwrap();
        let printed = plan.to_string();
        let reparsed = parse(&printed)
            .unwrap_or_else(|err| panic!("reparse of {printed:?} failed: {err}"));
        assert_eq!(printed, reparsed.to_string(), "print is not a fixed point");
        printed
    }

    #[test]
    fn test_print_simple_select() {
        let printed = round_trip("SELECT ?o WHERE { <http://ex/a> <http://ex/p> ?o }");
        insta::assert_snapshot!(printed, @r###"
        SELECT ?o WHERE {
          <http://ex/a> <http://ex/p> ?o .
        }
        "###);
    }

    #[test]
    fn test_print_expands_prefixes() {
        let printed = round_trip(
            "PREFIX ex: <http://ex/> SELECT * WHERE { ex:a a ex:T ; ex:n 42, 3.5, \"x\"@en }",
        );
        insta::assert_snapshot!(printed, @r###"
        SELECT * WHERE {
          <http://ex/a> <http://www.w3.org/1999/02/22-rdf-syntax-ns#type> <http://ex/T> .
          <http://ex/a> <http://ex/n> 42 .
          <http://ex/a> <http://ex/n> 3.5 .
          <http://ex/a> <http://ex/n> "x"@en .
        }
        "###);
    }

    #[test]
    fn test_print_filter_and_modifiers() {
        let printed = round_trip(
            "SELECT DISTINCT ?f ?age WHERE { ?x <http://ex/knows> ?f . ?f <http://ex/age> ?age \
             FILTER(?age > 40) } ORDER BY DESC(?age) LIMIT 10 OFFSET 2",
        );
        insta::assert_snapshot!(printed, @r###"
        SELECT DISTINCT ?f ?age WHERE {
          ?x <http://ex/knows> ?f .
          ?f <http://ex/age> ?age .
          FILTER ((?age > 40))
        }
        ORDER BY DESC(?age)
        LIMIT 10
        OFFSET 2
        "###);
    }

    #[test]
    fn test_print_union_optional_graph() {
        let printed = round_trip(
            "SELECT * WHERE { { ?s ?p ?o } UNION { GRAPH ?g { ?s ?p ?o } } OPTIONAL { ?s \
             <http://ex/x> ?x } }",
        );
        insta::assert_snapshot!(printed, @r###"
        SELECT * WHERE {
          {
            ?s ?p ?o .
          } UNION {
            GRAPH ?g {
              ?s ?p ?o .
            }
          }
          OPTIONAL {
            ?s <http://ex/x> ?x .
          }
        }
        "###);
    }

    #[test]
    fn test_print_aggregates() {
        let printed =
            round_trip("SELECT (COUNT(*) AS ?n) WHERE { ?s ?p ?o } GROUP BY ?s HAVING(COUNT(*) > 1)");
        insta::assert_snapshot!(printed, @r###"
        SELECT (COUNT(*) AS ?n) WHERE {
          ?s ?p ?o .
        }
        GROUP BY ?s
        HAVING ((COUNT(*) > 1))
        "###);
    }

    #[test]
    fn test_print_update_forms() {
        let printed = round_trip(
            "INSERT DATA { <http://ex/s> <http://ex/p> \"v\" . GRAPH <http://ex/g> { <http://ex/s> \
             <http://ex/p> 1 } } ; CLEAR SILENT NAMED ; COPY DEFAULT TO GRAPH <http://ex/g>",
        );
        insta::assert_snapshot!(printed, @r###"
        INSERT DATA {
          <http://ex/s> <http://ex/p> "v" .
          GRAPH <http://ex/g> {
            <http://ex/s> <http://ex/p> 1 .
          }
        } ;
        CLEAR SILENT NAMED ;
        COPY DEFAULT TO GRAPH <http://ex/g>
        "###);
    }

    #[test]
    fn test_print_values_and_bind() {
        let printed = round_trip(
            "SELECT * WHERE { VALUES (?x ?y) { (1 2) (UNDEF \"z\") } BIND(?x + 1 AS ?x1) }",
        );
        insta::assert_snapshot!(printed, @r###"
        SELECT * WHERE {
          VALUES (?x ?y) { (1 2) (UNDEF "z") }
          BIND ((?x + 1) AS ?x1)
        }
        "###);
    }
}
