use crate::ast::*;
use crate::lex::{line_col, Lexer, Tok, Token};
use crate::{LogicalPlan, ParseError, ParseErrorKind, Span, Text, RDF_TYPE};
use std::collections::HashMap;

/// Parse one SPARQL 1.1 query or update request.
pub fn parse(source: &str) -> Result<LogicalPlan, ParseError> {
    let mut parser = Parser::new(source)?;
    let query = parser.parse_unit()?;
    Ok(LogicalPlan {
        source: source.to_string(),
        synth: parser.synth,
        query,
    })
}

struct Parser<'s> {
    lexer: Lexer<'s>,
    current: Token,
    synth: String,
    base: Option<String>,
    prefixes: HashMap<String, String>,
    blank_counter: u32,
}

impl<'s> Parser<'s> {
    fn new(source: &'s str) -> Result<Self, ParseError> {
        let mut lexer = Lexer::new(source);
        let current = lexer.next_token()?;
        Ok(Self {
            lexer,
            current,
            synth: String::new(),
            base: None,
            prefixes: HashMap::new(),
            blank_counter: 0,
        })
    }

    // ---- token plumbing ----

    fn bump(&mut self) -> Result<Token, ParseError> {
        let prev = self.current;
        self.current = self.lexer.next_token()?;
        Ok(prev)
    }

    fn at(&self, tok: Tok) -> bool {
        self.current.tok == tok
    }

    fn eat(&mut self, tok: Tok) -> Result<bool, ParseError> {
        if self.at(tok) {
            self.bump()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, tok: Tok, production: &'static str) -> Result<Token, ParseError> {
        if self.at(tok) {
            self.bump()
        } else {
            Err(self.error(ParseErrorKind::MissingProduction, production))
        }
    }

    fn span_text(&self, span: Span) -> &'s str {
        &self.lexer.source()[span.start as usize..(span.start + span.len) as usize]
    }

    fn current_text(&self) -> &'s str {
        self.span_text(self.current.span)
    }

    fn at_word(&self, word: &str) -> bool {
        self.at(Tok::Word) && self.current_text().eq_ignore_ascii_case(word)
    }

    fn eat_word(&mut self, word: &str) -> Result<bool, ParseError> {
        if self.at_word(word) {
            self.bump()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect_word(&mut self, word: &'static str) -> Result<(), ParseError> {
        if self.eat_word(word)? {
            Ok(())
        } else {
            Err(self.error(ParseErrorKind::MissingProduction, word))
        }
    }

    fn error(&self, kind: ParseErrorKind, production: &'static str) -> ParseError {
        ParseError {
            span: line_col(
                self.lexer.source(),
                self.current.span.start as usize,
                self.current.span.len as usize,
            ),
            kind,
            production,
            found: self.current_text().to_string(),
        }
    }

    fn unsupported(&self, production: &'static str) -> ParseError {
        self.error(ParseErrorKind::UnsupportedFeature, production)
    }

    /// Intern text into the plan-owned synthesized buffer.
    fn synth_text(&mut self, text: &str) -> Text {
        let start = self.synth.len();
        self.synth.push_str(text);
        Text::Synth(Span::new(start, text.len()))
    }

    // ---- prologue ----

    fn prologue(&mut self) -> Result<(), ParseError> {
        loop {
            if self.eat_word("BASE")? {
                let iri = self.expect(Tok::IriRef, "BASE IRI")?;
                self.base = Some(self.span_text(iri.span).to_string());
            } else if self.eat_word("PREFIX")? {
                let name = self.expect(Tok::PName, "prefix declaration")?;
                let text = self.span_text(name.span);
                let prefix = text
                    .split_once(':')
                    .map(|(p, _)| p)
                    .unwrap_or(text)
                    .to_string();
                let iri = self.expect(Tok::IriRef, "prefix IRI")?;
                let resolved = self.resolve_iri_text(self.span_text(iri.span));
                self.prefixes.insert(prefix, resolved);
            } else {
                return Ok(());
            }
        }
    }

    fn resolve_iri_text(&self, iri: &str) -> String {
        if iri.contains(':') {
            return iri.to_string();
        }
        match &self.base {
            Some(base) => format!("{base}{iri}"),
            None => iri.to_string(),
        }
    }

    // ---- entry ----

    fn parse_unit(&mut self) -> Result<Query, ParseError> {
        self.prologue()?;

        let query = if self.at_word("SELECT") {
            Query::Select(self.select_query()?)
        } else if self.at_word("ASK") {
            self.bump()?;
            let dataset = self.dataset_clauses()?;
            self.eat_word("WHERE")?;
            let patterns = self.group_graph_pattern()?;
            Query::Ask(AskQuery { dataset, patterns })
        } else if self.at_word("CONSTRUCT") {
            Query::Construct(self.construct_query()?)
        } else if self.at_word("DESCRIBE") {
            Query::Describe(self.describe_query()?)
        } else {
            Query::Update(self.update_request()?)
        };

        if !self.at(Tok::Eof) {
            return Err(self.error(ParseErrorKind::UnexpectedToken, "end of input"));
        }
        Ok(query)
    }

    // ---- query forms ----

    fn select_query(&mut self) -> Result<SelectQuery, ParseError> {
        self.expect_word("SELECT")?;
        // REDUCED permits duplicate elimination; implemented as DISTINCT.
        let distinct = self.eat_word("DISTINCT")? || self.eat_word("REDUCED")?;

        let projection = if self.eat(Tok::Star)? {
            Projection::All
        } else {
            let mut elems = Vec::new();
            loop {
                if self.at(Tok::Var) {
                    let var = self.variable()?;
                    elems.push(ProjElem { expr: None, var });
                } else if self.at(Tok::LParen) {
                    self.bump()?;
                    let expr = self.expression()?;
                    self.expect_word("AS")?;
                    let var = self.variable()?;
                    self.expect(Tok::RParen, "closing ) of projection")?;
                    elems.push(ProjElem {
                        expr: Some(expr),
                        var,
                    });
                } else {
                    break;
                }
            }
            if elems.is_empty() {
                return Err(self.error(ParseErrorKind::MissingProduction, "SelectClause"));
            }
            Projection::Elems(elems)
        };

        let dataset = self.dataset_clauses()?;
        self.eat_word("WHERE")?;
        let patterns = self.group_graph_pattern()?;
        let modifiers = self.solution_modifiers()?;

        Ok(SelectQuery {
            distinct,
            projection,
            dataset,
            patterns,
            modifiers,
        })
    }

    fn construct_query(&mut self) -> Result<ConstructQuery, ParseError> {
        self.expect_word("CONSTRUCT")?;
        let template = {
            self.expect(Tok::LBrace, "CONSTRUCT template")?;
            let mut triples = Vec::new();
            while !self.at(Tok::RBrace) {
                self.triples_same_subject(&mut triples)?;
                if !self.eat(Tok::Dot)? {
                    break;
                }
            }
            self.expect(Tok::RBrace, "closing } of CONSTRUCT template")?;
            triples
        };
        let dataset = self.dataset_clauses()?;
        self.expect_word("WHERE")?;
        let patterns = self.group_graph_pattern()?;
        let modifiers = self.solution_modifiers()?;
        Ok(ConstructQuery {
            template,
            dataset,
            patterns,
            modifiers,
        })
    }

    fn describe_query(&mut self) -> Result<DescribeQuery, ParseError> {
        self.expect_word("DESCRIBE")?;
        let mut targets = Vec::new();
        if !self.eat(Tok::Star)? {
            loop {
                if self.at(Tok::Var) {
                    targets.push(self.variable()?);
                } else if self.at(Tok::IriRef) || self.at(Tok::PName) {
                    targets.push(self.iri_term()?);
                } else {
                    break;
                }
            }
            if targets.is_empty() {
                return Err(self.error(ParseErrorKind::MissingProduction, "DescribeQuery"));
            }
        }
        let dataset = self.dataset_clauses()?;
        let patterns = if self.at_word("WHERE") || self.at(Tok::LBrace) {
            self.eat_word("WHERE")?;
            self.group_graph_pattern()?
        } else {
            Vec::new()
        };
        let modifiers = self.solution_modifiers()?;
        Ok(DescribeQuery {
            targets,
            dataset,
            patterns,
            modifiers,
        })
    }

    fn dataset_clauses(&mut self) -> Result<Vec<DatasetClause>, ParseError> {
        let mut out = Vec::new();
        while self.eat_word("FROM")? {
            if self.eat_word("NAMED")? {
                out.push(DatasetClause::Named(self.iri_text()?));
            } else {
                out.push(DatasetClause::Default(self.iri_text()?));
            }
        }
        Ok(out)
    }

    fn solution_modifiers(&mut self) -> Result<Modifiers, ParseError> {
        let mut m = Modifiers::default();

        if self.eat_word("GROUP")? {
            self.expect_word("BY")?;
            loop {
                if self.at(Tok::Var) {
                    m.group_by.push(Expr::Term(self.variable()?));
                } else if self.at(Tok::LParen) {
                    self.bump()?;
                    let expr = self.expression()?;
                    self.expect(Tok::RParen, "closing ) of GROUP BY")?;
                    m.group_by.push(expr);
                } else {
                    break;
                }
            }
            if m.group_by.is_empty() {
                return Err(self.error(ParseErrorKind::MissingProduction, "GroupCondition"));
            }
        }

        if self.eat_word("HAVING")? {
            self.expect(Tok::LParen, "HAVING constraint")?;
            m.having.push(self.expression()?);
            self.expect(Tok::RParen, "closing ) of HAVING")?;
        }

        if self.eat_word("ORDER")? {
            self.expect_word("BY")?;
            loop {
                if self.eat_word("ASC")? {
                    self.expect(Tok::LParen, "ASC(expr)")?;
                    let expr = self.expression()?;
                    self.expect(Tok::RParen, "closing ) of ASC")?;
                    m.order_by.push((expr, false));
                } else if self.eat_word("DESC")? {
                    self.expect(Tok::LParen, "DESC(expr)")?;
                    let expr = self.expression()?;
                    self.expect(Tok::RParen, "closing ) of DESC")?;
                    m.order_by.push((expr, true));
                } else if self.at(Tok::Var) {
                    m.order_by.push((Expr::Term(self.variable()?), false));
                } else if self.at(Tok::LParen) {
                    self.bump()?;
                    let expr = self.expression()?;
                    self.expect(Tok::RParen, "closing ) of ORDER BY")?;
                    m.order_by.push((expr, false));
                } else {
                    break;
                }
            }
            if m.order_by.is_empty() {
                return Err(self.error(ParseErrorKind::MissingProduction, "OrderCondition"));
            }
        }

        // LIMIT and OFFSET accept either order.
        loop {
            if self.at_word("LIMIT") && m.limit.is_none() {
                self.bump()?;
                m.limit = Some(self.integer_value()?);
            } else if self.at_word("OFFSET") && m.offset.is_none() {
                self.bump()?;
                m.offset = Some(self.integer_value()?);
            } else {
                break;
            }
        }
        Ok(m)
    }

    fn integer_value(&mut self) -> Result<u64, ParseError> {
        let tok = self.expect(Tok::Integer, "integer")?;
        self.span_text(tok.span)
            .parse()
            .map_err(|_| self.error(ParseErrorKind::UnexpectedToken, "integer"))
    }

    // ---- group graph patterns ----

    fn group_graph_pattern(&mut self) -> Result<Vec<Pattern>, ParseError> {
        self.expect(Tok::LBrace, "group graph pattern")?;
        self.group_body()
    }

    /// The members of a group whose opening brace is already consumed,
    /// through the closing brace.
    fn group_body(&mut self) -> Result<Vec<Pattern>, ParseError> {
        let mut patterns = Vec::new();
        loop {
            if self.at(Tok::RBrace) {
                self.bump()?;
                return Ok(patterns);
            }
            let mut step = self.group_body_step()?;
            patterns.append(&mut step);
            // Optional dot separators between group members.
            while self.eat(Tok::Dot)? {}
        }
    }

    /// Nested `{ ... }`: a subselect, or a plain group.
    fn group_or_subselect(&mut self) -> Result<Vec<Pattern>, ParseError> {
        self.expect(Tok::LBrace, "group graph pattern")?;
        if self.at_word("SELECT") {
            let select = self.select_query()?;
            self.expect(Tok::RBrace, "closing } of subquery")?;
            return Ok(vec![Pattern::SubSelect(Box::new(select))]);
        }
        self.group_body()
    }

    /// One member of a group body.
    fn group_body_step(&mut self) -> Result<Vec<Pattern>, ParseError> {
        if self.at_word("FILTER") {
            self.bump()?;
            return Ok(vec![Pattern::Filter(self.constraint()?)]);
        }
        if self.at_word("OPTIONAL") {
            self.bump()?;
            return Ok(vec![Pattern::Optional(self.group_graph_pattern()?)]);
        }
        if self.at_word("MINUS") {
            self.bump()?;
            return Ok(vec![Pattern::Minus(self.group_graph_pattern()?)]);
        }
        if self.at_word("GRAPH") {
            self.bump()?;
            let graph = self.var_or_iri()?;
            let inner = self.group_graph_pattern()?;
            return Ok(vec![Pattern::Graph {
                graph,
                patterns: inner,
            }]);
        }
        if self.at_word("BIND") {
            self.bump()?;
            self.expect(Tok::LParen, "BIND(expr AS ?var)")?;
            let expr = self.expression()?;
            self.expect_word("AS")?;
            let var = self.variable()?;
            self.expect(Tok::RParen, "closing ) of BIND")?;
            return Ok(vec![Pattern::Bind { expr, var }]);
        }
        if self.at_word("VALUES") {
            self.bump()?;
            return Ok(vec![self.inline_data()?]);
        }
        if self.at_word("SERVICE") {
            self.bump()?;
            let silent = self.eat_word("SILENT")?;
            let endpoint = self.var_or_iri()?;
            let inner = self.group_graph_pattern()?;
            return Ok(vec![Pattern::Service {
                silent,
                endpoint,
                patterns: inner,
            }]);
        }
        if self.at(Tok::LBrace) {
            let group = self.group_or_subselect()?;
            if self.at_word("UNION") {
                let mut branches = vec![group];
                while self.eat_word("UNION")? {
                    branches.push(self.group_or_subselect()?);
                }
                let mut union = branches.pop().expect("at least one branch");
                while let Some(left) = branches.pop() {
                    union = vec![Pattern::Union(left, union)];
                }
                return Ok(union);
            }
            return Ok(group);
        }
        let mut patterns = Vec::new();
        self.triples_block(&mut patterns)?;
        Ok(patterns)
    }

    fn constraint(&mut self) -> Result<Expr, ParseError> {
        if self.at(Tok::LParen) {
            self.bump()?;
            let expr = self.expression()?;
            self.expect(Tok::RParen, "closing ) of FILTER")?;
            Ok(expr)
        } else {
            // FILTER builtInCall, e.g. FILTER BOUND(?x)
            self.primary_expression()
        }
    }

    fn inline_data(&mut self) -> Result<Pattern, ParseError> {
        let mut vars = Vec::new();
        let single = if self.at(Tok::Var) {
            vars.push(self.variable()?);
            true
        } else {
            self.expect(Tok::LParen, "VALUES variable list")?;
            while self.at(Tok::Var) {
                vars.push(self.variable()?);
            }
            self.expect(Tok::RParen, "closing ) of VALUES variables")?;
            false
        };

        self.expect(Tok::LBrace, "VALUES data block")?;
        let mut rows = Vec::new();
        loop {
            if self.at(Tok::RBrace) {
                self.bump()?;
                break;
            }
            if single {
                rows.push(vec![self.data_value()?]);
            } else {
                self.expect(Tok::LParen, "VALUES data row")?;
                let mut row = Vec::new();
                while !self.at(Tok::RParen) {
                    row.push(self.data_value()?);
                }
                self.bump()?;
                if row.len() != vars.len() {
                    return Err(self.error(ParseErrorKind::UnexpectedToken, "VALUES row arity"));
                }
                rows.push(row);
            }
        }
        Ok(Pattern::Values { vars, rows })
    }

    fn data_value(&mut self) -> Result<Option<Term>, ParseError> {
        if self.eat_word("UNDEF")? {
            return Ok(None);
        }
        let term = self.graph_term()?;
        Ok(Some(term))
    }

    // ---- triples ----

    fn triples_block(&mut self, out: &mut Vec<Pattern>) -> Result<(), ParseError> {
        loop {
            let mut triples = Vec::new();
            self.triples_same_subject(&mut triples)?;
            out.extend(triples.into_iter().map(Pattern::Triple));
            if !self.eat(Tok::Dot)? {
                return Ok(());
            }
            // A dot may close the block rather than continue it.
            if !self.starts_term() {
                return Ok(());
            }
        }
    }

    fn starts_term(&self) -> bool {
        matches!(
            self.current.tok,
            Tok::Var | Tok::IriRef | Tok::PName | Tok::BlankLabel | Tok::LBracket
        )
    }

    fn triples_same_subject(&mut self, out: &mut Vec<TriplePattern>) -> Result<(), ParseError> {
        let subject = match self.current.tok {
            Tok::Var => self.variable()?,
            Tok::IriRef | Tok::PName => self.iri_term()?,
            Tok::BlankLabel => {
                let tok = self.bump()?;
                Term::Blank(Text::Source(tok.span))
            }
            Tok::LBracket => self.blank_node_property_list(out)?,
            Tok::LParen => return Err(self.unsupported("RDF collections")),
            _ => return Err(self.error(ParseErrorKind::UnexpectedToken, "triple subject")),
        };
        self.property_list(subject, out)
    }

    fn property_list(
        &mut self,
        subject: Term,
        out: &mut Vec<TriplePattern>,
    ) -> Result<(), ParseError> {
        loop {
            let predicate = self.predicate()?;
            loop {
                let object = self.object(out)?;
                out.push(TriplePattern {
                    subject,
                    predicate,
                    object,
                });
                if !self.eat(Tok::Comma)? {
                    break;
                }
            }
            if !self.eat(Tok::Semi)? {
                return Ok(());
            }
            // Trailing semicolon before the group closes.
            if !self.starts_predicate() {
                return Ok(());
            }
        }
    }

    fn starts_predicate(&self) -> bool {
        matches!(self.current.tok, Tok::Var | Tok::IriRef | Tok::PName)
            || (self.at(Tok::Word) && self.current_text().eq_ignore_ascii_case("a"))
    }

    fn predicate(&mut self) -> Result<Term, ParseError> {
        // Property-path operators are not implemented; catch the ones
        // that can only mean a path here.
        if matches!(self.current.tok, Tok::Caret | Tok::Bang | Tok::LParen) {
            return Err(self.unsupported("property paths"));
        }
        let term = if self.at(Tok::Word) && self.current_text().eq_ignore_ascii_case("a") {
            self.bump()?;
            Term::Iri(self.synth_text(RDF_TYPE))
        } else if self.at(Tok::Var) {
            self.variable()?
        } else if self.at(Tok::IriRef) || self.at(Tok::PName) {
            self.iri_term()?
        } else if self.at(Tok::String) || self.at(Tok::Integer) {
            // Generalized RDF allows literal predicates; this store
            // does not.
            return Err(self.unsupported("non-IRI (generalized RDF) predicates"));
        } else {
            return Err(self.error(ParseErrorKind::UnexpectedToken, "predicate"));
        };
        if matches!(
            self.current.tok,
            Tok::Slash | Tok::Star | Tok::Plus | Tok::Pipe | Tok::Caret
        ) {
            return Err(self.unsupported("property paths"));
        }
        Ok(term)
    }

    fn object(&mut self, out: &mut Vec<TriplePattern>) -> Result<Term, ParseError> {
        match self.current.tok {
            Tok::LBracket => self.blank_node_property_list(out),
            Tok::LParen => Err(self.unsupported("RDF collections")),
            _ => self.graph_node(),
        }
    }

    /// `[ p o ; ... ]` — allocate a fresh blank label and emit its
    /// triples alongside.
    fn blank_node_property_list(
        &mut self,
        out: &mut Vec<TriplePattern>,
    ) -> Result<Term, ParseError> {
        self.expect(Tok::LBracket, "blank node property list")?;
        let label = self.synth_text(&format!("b{}", self.blank_counter));
        self.blank_counter += 1;
        let subject = Term::Blank(label);
        if !self.at(Tok::RBracket) {
            self.property_list(subject, out)?;
        }
        self.expect(Tok::RBracket, "closing ] of blank node")?;
        Ok(subject)
    }

    /// A term usable in variable position: var, IRI, literal, blank.
    fn graph_node(&mut self) -> Result<Term, ParseError> {
        if self.at(Tok::Var) {
            return self.variable();
        }
        self.graph_term()
    }

    /// A ground term (no variables).
    fn graph_term(&mut self) -> Result<Term, ParseError> {
        match self.current.tok {
            Tok::IriRef | Tok::PName => self.iri_term(),
            Tok::BlankLabel => {
                let tok = self.bump()?;
                Ok(Term::Blank(Text::Source(tok.span)))
            }
            Tok::String => self.literal(),
            Tok::Integer | Tok::Decimal | Tok::Double => self.numeric_literal(false),
            Tok::Minus | Tok::Plus => {
                let negative = self.at(Tok::Minus);
                self.bump()?;
                if !matches!(self.current.tok, Tok::Integer | Tok::Decimal | Tok::Double) {
                    return Err(self.error(ParseErrorKind::UnexpectedToken, "numeric literal"));
                }
                self.numeric_literal(negative)
            }
            Tok::Word if self.current_text().eq_ignore_ascii_case("true") => {
                let tok = self.bump()?;
                Ok(Term::Literal {
                    lexical: Text::Source(tok.span),
                    datatype: Some(self.synth_text(crate::xsd::BOOLEAN)),
                    lang: None,
                })
            }
            Tok::Word if self.current_text().eq_ignore_ascii_case("false") => {
                let tok = self.bump()?;
                Ok(Term::Literal {
                    lexical: Text::Source(tok.span),
                    datatype: Some(self.synth_text(crate::xsd::BOOLEAN)),
                    lang: None,
                })
            }
            _ => Err(self.error(ParseErrorKind::UnexpectedToken, "RDF term")),
        }
    }

    fn literal(&mut self) -> Result<Term, ParseError> {
        let body = self.expect(Tok::String, "string literal")?;
        if self.eat(Tok::Caret2)? {
            let datatype = self.iri_text()?;
            return Ok(Term::Literal {
                lexical: Text::Source(body.span),
                datatype: Some(datatype),
                lang: None,
            });
        }
        if self.at(Tok::LangTag) {
            let tag = self.bump()?;
            return Ok(Term::Literal {
                lexical: Text::Source(body.span),
                datatype: None,
                lang: Some(Text::Source(tag.span)),
            });
        }
        Ok(Term::Literal {
            lexical: Text::Source(body.span),
            datatype: None,
            lang: None,
        })
    }

    fn numeric_literal(&mut self, negative: bool) -> Result<Term, ParseError> {
        let tok = self.bump()?;
        let datatype = match tok.tok {
            Tok::Integer => crate::xsd::INTEGER,
            Tok::Decimal => crate::xsd::DECIMAL,
            _ => crate::xsd::DOUBLE,
        };
        let lexical = if negative {
            let text = format!("-{}", self.span_text(tok.span));
            self.synth_text(&text)
        } else {
            Text::Source(tok.span)
        };
        Ok(Term::Literal {
            lexical,
            datatype: Some(self.synth_text(datatype)),
            lang: None,
        })
    }

    fn variable(&mut self) -> Result<Term, ParseError> {
        let tok = self.expect(Tok::Var, "variable")?;
        Ok(Term::Var(Text::Source(tok.span)))
    }

    fn var_or_iri(&mut self) -> Result<Term, ParseError> {
        if self.at(Tok::Var) {
            self.variable()
        } else {
            self.iri_term()
        }
    }

    fn iri_term(&mut self) -> Result<Term, ParseError> {
        Ok(Term::Iri(self.iri_text()?))
    }

    /// An IRIREF or prefixed name, resolved to absolute form.
    fn iri_text(&mut self) -> Result<Text, ParseError> {
        if self.at(Tok::IriRef) {
            let tok = self.bump()?;
            let raw = self.span_text(tok.span);
            if raw.contains(':') || self.base.is_none() {
                return Ok(Text::Source(tok.span));
            }
            let resolved = self.resolve_iri_text(raw);
            return Ok(self.synth_text(&resolved));
        }
        if self.at(Tok::PName) {
            let tok = self.bump()?;
            let raw = self.span_text(tok.span);
            let (prefix, local) = raw.split_once(':').unwrap_or((raw, ""));
            let Some(base) = self.prefixes.get(prefix) else {
                return Err(ParseError {
                    span: line_col(
                        self.lexer.source(),
                        tok.span.start as usize,
                        tok.span.len as usize,
                    ),
                    kind: ParseErrorKind::UnexpectedToken,
                    production: "declared prefix",
                    found: raw.to_string(),
                });
            };
            let expanded = format!("{base}{local}");
            return Ok(self.synth_text(&expanded));
        }
        Err(self.error(ParseErrorKind::MissingProduction, "IRI"))
    }

    // ---- expressions ----

    fn expression(&mut self) -> Result<Expr, ParseError> {
        self.or_expression()
    }

    fn or_expression(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.and_expression()?;
        while self.eat(Tok::OrOr)? {
            let rhs = self.and_expression()?;
            lhs = Expr::Binary {
                op: BinaryOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn and_expression(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.relational_expression()?;
        while self.eat(Tok::AndAnd)? {
            let rhs = self.relational_expression()?;
            lhs = Expr::Binary {
                op: BinaryOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn relational_expression(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.additive_expression()?;
        let op = match self.current.tok {
            Tok::Eq => BinaryOp::Eq,
            Tok::Ne => BinaryOp::Ne,
            Tok::Lt => BinaryOp::Lt,
            Tok::Le => BinaryOp::Le,
            Tok::Gt => BinaryOp::Gt,
            Tok::Ge => BinaryOp::Ge,
            _ => {
                if self.at_word("IN") {
                    self.bump()?;
                    let haystack = self.expression_list()?;
                    return Ok(Expr::In {
                        needle: Box::new(lhs),
                        haystack,
                        negated: false,
                    });
                }
                if self.at_word("NOT") {
                    self.bump()?;
                    self.expect_word("IN")?;
                    let haystack = self.expression_list()?;
                    return Ok(Expr::In {
                        needle: Box::new(lhs),
                        haystack,
                        negated: true,
                    });
                }
                return Ok(lhs);
            }
        };
        self.bump()?;
        let rhs = self.additive_expression()?;
        Ok(Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn expression_list(&mut self) -> Result<Vec<Expr>, ParseError> {
        self.expect(Tok::LParen, "expression list")?;
        let mut out = Vec::new();
        if !self.at(Tok::RParen) {
            loop {
                out.push(self.expression()?);
                if !self.eat(Tok::Comma)? {
                    break;
                }
            }
        }
        self.expect(Tok::RParen, "closing ) of expression list")?;
        Ok(out)
    }

    fn additive_expression(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.multiplicative_expression()?;
        loop {
            let op = match self.current.tok {
                Tok::Plus => BinaryOp::Add,
                Tok::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.bump()?;
            let rhs = self.multiplicative_expression()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn multiplicative_expression(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.unary_expression()?;
        loop {
            let op = match self.current.tok {
                Tok::Star => BinaryOp::Mul,
                Tok::Slash => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.bump()?;
            let rhs = self.unary_expression()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn unary_expression(&mut self) -> Result<Expr, ParseError> {
        if self.eat(Tok::Bang)? {
            return Ok(Expr::Not(Box::new(self.unary_expression()?)));
        }
        if self.eat(Tok::Minus)? {
            return Ok(Expr::Neg(Box::new(self.unary_expression()?)));
        }
        if self.eat(Tok::Plus)? {
            return self.unary_expression();
        }
        self.primary_expression()
    }

    fn primary_expression(&mut self) -> Result<Expr, ParseError> {
        if self.at(Tok::LParen) {
            self.bump()?;
            let expr = self.expression()?;
            self.expect(Tok::RParen, "closing )")?;
            return Ok(expr);
        }
        if self.at(Tok::Var) {
            return Ok(Expr::Term(self.variable()?));
        }
        if self.at(Tok::Word) {
            let word = self.current_text();
            if word.eq_ignore_ascii_case("EXISTS") || word.eq_ignore_ascii_case("NOT") {
                return Err(self.unsupported("EXISTS"));
            }
            if let Some(agg) = AggFunc::from_name(word) {
                return self.aggregate(agg);
            }
            if let Some(func) = Func::from_name(word) {
                return self.builtin_call(func);
            }
            if word.eq_ignore_ascii_case("true") || word.eq_ignore_ascii_case("false") {
                return Ok(Expr::Term(self.graph_term()?));
            }
            return Err(self.error(ParseErrorKind::UnexpectedToken, "built-in function"));
        }
        if self.at(Tok::IriRef) || self.at(Tok::PName) {
            let iri = self.iri_term()?;
            if self.at(Tok::LParen) {
                return Err(self.unsupported("custom function calls"));
            }
            return Ok(Expr::Term(iri));
        }
        Ok(Expr::Term(self.graph_term()?))
    }

    fn aggregate(&mut self, func: AggFunc) -> Result<Expr, ParseError> {
        self.bump()?;
        self.expect(Tok::LParen, "aggregate arguments")?;
        let distinct = self.eat_word("DISTINCT")?;

        if func == AggFunc::Count && self.eat(Tok::Star)? {
            self.expect(Tok::RParen, "closing ) of COUNT")?;
            return Ok(Expr::Aggregate {
                func,
                distinct,
                expr: None,
                separator: None,
            });
        }

        let expr = Box::new(self.expression()?);
        let mut separator = None;
        if func == AggFunc::GroupConcat && self.eat(Tok::Semi)? {
            self.expect_word("SEPARATOR")?;
            self.expect(Tok::Eq, "SEPARATOR =")?;
            let tok = self.expect(Tok::String, "separator string")?;
            separator = Some(Text::Source(tok.span));
        }
        self.expect(Tok::RParen, "closing ) of aggregate")?;
        Ok(Expr::Aggregate {
            func,
            distinct,
            expr: Some(expr),
            separator,
        })
    }

    fn builtin_call(&mut self, func: Func) -> Result<Expr, ParseError> {
        self.bump()?;
        let args = self.expression_list()?;
        let arity_ok = match func {
            Func::Bound
            | Func::Str
            | Func::StrLen
            | Func::UCase
            | Func::LCase
            | Func::EncodeForUri
            | Func::Abs
            | Func::Round
            | Func::Ceil
            | Func::Floor
            | Func::Lang
            | Func::Datatype
            | Func::Iri
            | Func::IsIri
            | Func::IsBlank
            | Func::IsLiteral
            | Func::IsNumeric
            | Func::Md5
            | Func::Sha1
            | Func::Sha256
            | Func::Sha384
            | Func::Sha512
            | Func::Year
            | Func::Month
            | Func::Day
            | Func::Hours
            | Func::Minutes
            | Func::Seconds
            | Func::Tz
            | Func::Timezone => args.len() == 1,
            Func::If => args.len() == 3,
            Func::Coalesce | Func::Concat => true,
            Func::Regex => args.len() == 2 || args.len() == 3,
            Func::Replace => args.len() == 3 || args.len() == 4,
            Func::SameTerm
            | Func::Contains
            | Func::StrStarts
            | Func::StrEnds
            | Func::StrBefore
            | Func::StrAfter
            | Func::LangMatches
            | Func::StrDt
            | Func::StrLang => args.len() == 2,
            Func::SubStr => args.len() == 2 || args.len() == 3,
            Func::BNode => args.len() <= 1,
            Func::Uuid | Func::StrUuid | Func::Now => args.is_empty(),
        };
        if !arity_ok {
            return Err(self.error(ParseErrorKind::UnexpectedToken, "built-in arity"));
        }
        Ok(Expr::Call { func, args })
    }

    // ---- updates ----

    fn update_request(&mut self) -> Result<Vec<UpdateOp>, ParseError> {
        let mut ops = Vec::new();
        loop {
            self.prologue()?;
            if self.at(Tok::Eof) {
                break;
            }
            ops.push(self.update_op()?);
            if !self.eat(Tok::Semi)? {
                break;
            }
        }
        if ops.is_empty() {
            return Err(self.error(ParseErrorKind::MissingProduction, "query or update form"));
        }
        Ok(ops)
    }

    fn update_op(&mut self) -> Result<UpdateOp, ParseError> {
        if self.at_word("LOAD") {
            return Err(self.unsupported("LOAD"));
        }
        if self.eat_word("CLEAR")? {
            let silent = self.eat_word("SILENT")?;
            let target = self.graph_target()?;
            return Ok(UpdateOp::Clear { silent, target });
        }
        if self.eat_word("DROP")? {
            let silent = self.eat_word("SILENT")?;
            let target = self.graph_target()?;
            return Ok(UpdateOp::Drop { silent, target });
        }
        if self.eat_word("CREATE")? {
            let silent = self.eat_word("SILENT")?;
            self.expect_word("GRAPH")?;
            let graph = self.iri_text()?;
            return Ok(UpdateOp::Create { silent, graph });
        }
        if self.eat_word("COPY")? {
            let silent = self.eat_word("SILENT")?;
            let (from, to) = self.graph_pair()?;
            return Ok(UpdateOp::Copy { silent, from, to });
        }
        if self.eat_word("MOVE")? {
            let silent = self.eat_word("SILENT")?;
            let (from, to) = self.graph_pair()?;
            return Ok(UpdateOp::Move { silent, from, to });
        }
        if self.eat_word("ADD")? {
            let silent = self.eat_word("SILENT")?;
            let (from, to) = self.graph_pair()?;
            return Ok(UpdateOp::Add { silent, from, to });
        }

        let mut with = None;
        if self.eat_word("WITH")? {
            with = Some(self.iri_text()?);
        }

        if self.eat_word("INSERT")? {
            if with.is_none() && self.eat_word("DATA")? {
                return Ok(UpdateOp::InsertData(self.quad_blocks()?));
            }
            let insert = self.quad_blocks()?;
            let using = self.using_clauses()?;
            self.expect_word("WHERE")?;
            let patterns = self.group_graph_pattern()?;
            return Ok(UpdateOp::Modify {
                with,
                delete: Vec::new(),
                insert,
                using,
                patterns,
            });
        }

        if self.eat_word("DELETE")? {
            if with.is_none() && self.eat_word("DATA")? {
                return Ok(UpdateOp::DeleteData(self.quad_blocks()?));
            }
            if self.at_word("WHERE") {
                // DELETE WHERE shorthand: the pattern is the template.
                self.bump()?;
                let patterns = self.group_graph_pattern()?;
                let delete = pattern_quad_blocks(&patterns);
                return Ok(UpdateOp::Modify {
                    with,
                    delete,
                    insert: Vec::new(),
                    using: Vec::new(),
                    patterns,
                });
            }
            let delete = self.quad_blocks()?;
            let insert = if self.eat_word("INSERT")? {
                self.quad_blocks()?
            } else {
                Vec::new()
            };
            let using = self.using_clauses()?;
            self.expect_word("WHERE")?;
            let patterns = self.group_graph_pattern()?;
            return Ok(UpdateOp::Modify {
                with,
                delete,
                insert,
                using,
                patterns,
            });
        }

        Err(self.error(ParseErrorKind::MissingProduction, "update operation"))
    }

    fn using_clauses(&mut self) -> Result<Vec<DatasetClause>, ParseError> {
        let mut out = Vec::new();
        while self.eat_word("USING")? {
            if self.eat_word("NAMED")? {
                out.push(DatasetClause::Named(self.iri_text()?));
            } else {
                out.push(DatasetClause::Default(self.iri_text()?));
            }
        }
        Ok(out)
    }

    fn graph_target(&mut self) -> Result<GraphTarget, ParseError> {
        if self.eat_word("DEFAULT")? {
            Ok(GraphTarget::Default)
        } else if self.eat_word("NAMED")? {
            Ok(GraphTarget::Named)
        } else if self.eat_word("ALL")? {
            Ok(GraphTarget::All)
        } else {
            self.expect_word("GRAPH")?;
            Ok(GraphTarget::Graph(self.iri_text()?))
        }
    }

    fn graph_pair(&mut self) -> Result<(GraphOrDefault, GraphOrDefault), ParseError> {
        let from = self.graph_or_default()?;
        self.expect_word("TO")?;
        let to = self.graph_or_default()?;
        Ok((from, to))
    }

    fn graph_or_default(&mut self) -> Result<GraphOrDefault, ParseError> {
        if self.eat_word("DEFAULT")? {
            return Ok(GraphOrDefault::Default);
        }
        self.eat_word("GRAPH")?;
        Ok(GraphOrDefault::Graph(self.iri_text()?))
    }

    /// `{ triples (GRAPH iri { triples })* }` for data blocks and
    /// modify templates.
    fn quad_blocks(&mut self) -> Result<Vec<QuadBlock>, ParseError> {
        self.expect(Tok::LBrace, "quad data")?;
        let mut blocks = Vec::new();
        let mut default_triples = Vec::new();

        loop {
            if self.at(Tok::RBrace) {
                self.bump()?;
                break;
            }
            if self.eat_word("GRAPH")? {
                let graph = self.var_or_iri()?;
                self.expect(Tok::LBrace, "GRAPH block")?;
                let mut triples = Vec::new();
                while !self.at(Tok::RBrace) {
                    self.triples_same_subject(&mut triples)?;
                    if !self.eat(Tok::Dot)? {
                        break;
                    }
                }
                self.expect(Tok::RBrace, "closing } of GRAPH block")?;
                blocks.push(QuadBlock {
                    graph: Some(graph),
                    triples,
                });
            } else {
                self.triples_same_subject(&mut default_triples)?;
                while self.eat(Tok::Dot)? {}
            }
        }

        if !default_triples.is_empty() {
            blocks.insert(
                0,
                QuadBlock {
                    graph: None,
                    triples: default_triples,
                },
            );
        }
        Ok(blocks)
    }
}

/// Lift the plain triple/graph patterns of a DELETE WHERE body into
/// quad blocks.
fn pattern_quad_blocks(patterns: &[Pattern]) -> Vec<QuadBlock> {
    let mut blocks = Vec::new();
    let mut default_triples = Vec::new();
    for pattern in patterns {
        match pattern {
            Pattern::Triple(triple) => default_triples.push(*triple),
            Pattern::Graph { graph, patterns } => {
                let triples = patterns
                    .iter()
                    .filter_map(|p| match p {
                        Pattern::Triple(t) => Some(*t),
                        _ => None,
                    })
                    .collect();
                blocks.push(QuadBlock {
                    graph: Some(*graph),
                    triples,
                });
            }
            _ => {}
        }
    }
    if !default_triples.is_empty() {
        blocks.insert(
            0,
            QuadBlock {
                graph: None,
                triples: default_triples,
            },
        );
    }
    blocks
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse_query(src: &str) -> LogicalPlan {
        parse(src).unwrap_or_else(|err| panic!("parse of {src:?} failed: {err}"))
    }

    fn select(plan: &LogicalPlan) -> &SelectQuery {
        match &plan.query {
            Query::Select(q) => q,
            other => panic!("expected SELECT, got {other:?}"),
        }
    }

    #[test]
    fn test_select_basic_shape() {
        let plan = parse_query("SELECT ?o WHERE { <http://ex/a> <http://ex/p> ?o }");
        let q = select(&plan);
        assert!(!q.distinct);
        assert_eq!(q.patterns.len(), 1);
        let Pattern::Triple(t) = &q.patterns[0] else {
            panic!("expected triple pattern");
        };
        assert!(matches!(t.subject, Term::Iri(_)));
        assert!(matches!(t.object, Term::Var(_)));
        let Term::Var(name) = t.object else {
            unreachable!()
        };
        assert_eq!(plan.text(name), "o");
    }

    #[test]
    fn test_prefix_expansion() {
        let plan = parse_query("PREFIX foaf: <http://xmlns.com/foaf/0.1/> SELECT ?n WHERE { ?x foaf:name ?n }");
        let q = select(&plan);
        let Pattern::Triple(t) = &q.patterns[0] else {
            panic!("expected triple");
        };
        let Term::Iri(iri) = t.predicate else {
            panic!("expected IRI predicate");
        };
        assert_eq!(plan.text(iri), "http://xmlns.com/foaf/0.1/name");
    }

    #[test]
    fn test_undeclared_prefix_is_an_error() {
        let err = parse("SELECT * WHERE { ?s nope:p ?o }").unwrap_err();
        assert_eq!(err.production, "declared prefix");
        assert_eq!(err.span.line, 1);
    }

    #[test]
    fn test_semicolon_and_comma_fanout() {
        let plan = parse_query(
            "SELECT * WHERE { <http://e/s> <http://e/p> 1, 2 ; <http://e/q> 3 . ?x ?y ?z }",
        );
        let triples: Vec<_> = select(&plan)
            .patterns
            .iter()
            .filter(|p| matches!(p, Pattern::Triple(_)))
            .collect();
        assert_eq!(triples.len(), 4);
    }

    #[test]
    fn test_filter_precedence() {
        let plan = parse_query("ASK { ?s ?p ?o FILTER(?a || ?b && ?c = ?d + 1 * 2) }");
        let Query::Ask(q) = &plan.query else {
            panic!("expected ASK");
        };
        let Pattern::Filter(Expr::Binary { op, rhs, .. }) = &q.patterns[1] else {
            panic!("expected filter");
        };
        assert_eq!(*op, BinaryOp::Or);
        // && binds tighter than ||, = tighter than &&, etc.
        let Expr::Binary { op, rhs, .. } = rhs.as_ref() else {
            panic!("expected &&");
        };
        assert_eq!(*op, BinaryOp::And);
        let Expr::Binary { op, rhs, .. } = rhs.as_ref() else {
            panic!("expected =");
        };
        assert_eq!(*op, BinaryOp::Eq);
        let Expr::Binary { op, rhs, .. } = rhs.as_ref() else {
            panic!("expected +");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(
            rhs.as_ref(),
            Expr::Binary {
                op: BinaryOp::Mul,
                ..
            }
        ));
    }

    #[test]
    fn test_blank_node_property_list() {
        let plan = parse_query("SELECT * WHERE { ?x <http://e/knows> [ <http://e/name> \"N\" ] }");
        let triples: Vec<_> = select(&plan)
            .patterns
            .iter()
            .filter(|p| matches!(p, Pattern::Triple(_)))
            .collect();
        assert_eq!(triples.len(), 2);
    }

    #[test]
    fn test_subselect() {
        let plan = parse_query(
            "SELECT ?s WHERE { ?s <http://e/p> ?o { SELECT ?o WHERE { ?o <http://e/q> 1 } LIMIT 5 } }",
        );
        let has_sub = select(&plan)
            .patterns
            .iter()
            .any(|p| matches!(p, Pattern::SubSelect(_)));
        assert!(has_sub);
    }

    #[test]
    fn test_update_forms_parse() {
        let plan = parse_query(
            "DELETE { ?s <http://e/old> ?o } INSERT { ?s <http://e/new> ?o } WHERE { ?s <http://e/old> ?o } ; DROP GRAPH <http://e/g>",
        );
        let Query::Update(ops) = &plan.query else {
            panic!("expected update");
        };
        assert_eq!(ops.len(), 2);
        assert!(matches!(ops[0], UpdateOp::Modify { .. }));
        assert!(matches!(ops[1], UpdateOp::Drop { silent: false, .. }));
    }

    #[test]
    fn test_delete_where_shorthand() {
        let plan = parse_query("DELETE WHERE { ?s <http://e/p> ?o }");
        let Query::Update(ops) = &plan.query else {
            panic!("expected update");
        };
        let UpdateOp::Modify {
            delete, patterns, ..
        } = &ops[0]
        else {
            panic!("expected modify");
        };
        assert_eq!(delete.len(), 1);
        assert_eq!(delete[0].triples.len(), 1);
        assert_eq!(patterns.len(), 1);
    }

    #[test]
    fn test_property_paths_are_unsupported() {
        let err = parse("SELECT * WHERE { ?s <http://e/p>/<http://e/q> ?o }").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnsupportedFeature);
        assert_eq!(err.production, "property paths");
    }

    #[test]
    fn test_collections_are_unsupported() {
        let err = parse("SELECT * WHERE { ?s <http://e/p> (1 2 3) }").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnsupportedFeature);
        assert_eq!(err.production, "RDF collections");
    }

    #[test]
    fn test_literal_predicate_is_unsupported() {
        let err = parse("SELECT * WHERE { ?s \"p\" ?o }").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnsupportedFeature);
    }

    #[test]
    fn test_diagnostic_carries_position() {
        let err = parse("SELECT ?x\nWHERE { ?s ?p }").unwrap_err();
        assert_eq!(err.span.line, 2);
        assert!(err.span.column > 1);
    }

    #[test]
    fn test_values_arity_checked() {
        let err = parse("SELECT * WHERE { VALUES (?a ?b) { (1) } }").unwrap_err();
        assert_eq!(err.production, "VALUES row arity");
    }

    #[test]
    fn test_count_star_projection() {
        let plan = parse_query("SELECT (COUNT(*) AS ?n) WHERE { ?s ?p ?o }");
        let Projection::Elems(elems) = &select(&plan).projection else {
            panic!("expected projection elems");
        };
        assert!(matches!(
            elems[0].expr,
            Some(Expr::Aggregate {
                func: AggFunc::Count,
                expr: None,
                ..
            })
        ));
    }
}
