use crate::Text;

/// An RDF term or variable position within a pattern or expression.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Term {
    /// Variable, text is the bare name (no `?`/`$`).
    Var(Text),
    /// IRI, text is the bare IRI (no angle brackets), already resolved
    /// against BASE/PREFIX.
    Iri(Text),
    /// Literal: raw lexical body (escapes intact) plus an optional
    /// datatype IRI or language tag (bare, no `@`).
    Literal {
        lexical: Text,
        datatype: Option<Text>,
        lang: Option<Text>,
    },
    /// Blank node label (no `_:`).
    Blank(Text),
}

impl Term {
    pub fn is_var(&self) -> bool {
        matches!(self, Term::Var(_))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TriplePattern {
    pub subject: Term,
    pub predicate: Term,
    pub object: Term,
}

/// One clause of a group graph pattern. The discriminated variants
/// carry only the fields each kind needs.
#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Triple(TriplePattern),
    Filter(Expr),
    Optional(Vec<Pattern>),
    Union(Vec<Pattern>, Vec<Pattern>),
    Minus(Vec<Pattern>),
    Graph {
        graph: Term,
        patterns: Vec<Pattern>,
    },
    Bind {
        expr: Expr,
        var: Term,
    },
    Values {
        vars: Vec<Term>,
        rows: Vec<Vec<Option<Term>>>,
    },
    Service {
        silent: bool,
        endpoint: Term,
        patterns: Vec<Pattern>,
    },
    SubSelect(Box<SelectQuery>),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Term(Term),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    In {
        needle: Box<Expr>,
        haystack: Vec<Expr>,
        negated: bool,
    },
    Call {
        func: Func,
        args: Vec<Expr>,
    },
    Aggregate {
        func: AggFunc,
        distinct: bool,
        /// None encodes `COUNT(*)`.
        expr: Option<Box<Expr>>,
        /// GROUP_CONCAT separator literal body.
        separator: Option<Text>,
    },
}

/// The mandatory built-in function set.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Func {
    Bound,
    If,
    Coalesce,
    Regex,
    Replace,
    SameTerm,
    IsIri,
    IsBlank,
    IsLiteral,
    IsNumeric,
    Str,
    StrLen,
    SubStr,
    Contains,
    StrStarts,
    StrEnds,
    StrBefore,
    StrAfter,
    Concat,
    UCase,
    LCase,
    EncodeForUri,
    Abs,
    Round,
    Ceil,
    Floor,
    Lang,
    Datatype,
    LangMatches,
    Iri,
    StrDt,
    StrLang,
    BNode,
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
    Uuid,
    StrUuid,
    Now,
    Year,
    Month,
    Day,
    Hours,
    Minutes,
    Seconds,
    Tz,
    Timezone,
}

impl Func {
    pub fn name(self) -> &'static str {
        match self {
            Func::Bound => "BOUND",
            Func::If => "IF",
            Func::Coalesce => "COALESCE",
            Func::Regex => "REGEX",
            Func::Replace => "REPLACE",
            Func::SameTerm => "sameTerm",
            Func::IsIri => "isIRI",
            Func::IsBlank => "isBlank",
            Func::IsLiteral => "isLiteral",
            Func::IsNumeric => "isNumeric",
            Func::Str => "STR",
            Func::StrLen => "STRLEN",
            Func::SubStr => "SUBSTR",
            Func::Contains => "CONTAINS",
            Func::StrStarts => "STRSTARTS",
            Func::StrEnds => "STRENDS",
            Func::StrBefore => "STRBEFORE",
            Func::StrAfter => "STRAFTER",
            Func::Concat => "CONCAT",
            Func::UCase => "UCASE",
            Func::LCase => "LCASE",
            Func::EncodeForUri => "ENCODE_FOR_URI",
            Func::Abs => "ABS",
            Func::Round => "ROUND",
            Func::Ceil => "CEIL",
            Func::Floor => "FLOOR",
            Func::Lang => "LANG",
            Func::Datatype => "DATATYPE",
            Func::LangMatches => "LANGMATCHES",
            Func::Iri => "IRI",
            Func::StrDt => "STRDT",
            Func::StrLang => "STRLANG",
            Func::BNode => "BNODE",
            Func::Md5 => "MD5",
            Func::Sha1 => "SHA1",
            Func::Sha256 => "SHA256",
            Func::Sha384 => "SHA384",
            Func::Sha512 => "SHA512",
            Func::Uuid => "UUID",
            Func::StrUuid => "STRUUID",
            Func::Now => "NOW",
            Func::Year => "YEAR",
            Func::Month => "MONTH",
            Func::Day => "DAY",
            Func::Hours => "HOURS",
            Func::Minutes => "MINUTES",
            Func::Seconds => "SECONDS",
            Func::Tz => "TZ",
            Func::Timezone => "TIMEZONE",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.to_ascii_uppercase();
        Some(match upper.as_str() {
            "BOUND" => Func::Bound,
            "IF" => Func::If,
            "COALESCE" => Func::Coalesce,
            "REGEX" => Func::Regex,
            "REPLACE" => Func::Replace,
            "SAMETERM" => Func::SameTerm,
            "ISIRI" | "ISURI" => Func::IsIri,
            "ISBLANK" => Func::IsBlank,
            "ISLITERAL" => Func::IsLiteral,
            "ISNUMERIC" => Func::IsNumeric,
            "STR" => Func::Str,
            "STRLEN" => Func::StrLen,
            "SUBSTR" => Func::SubStr,
            "CONTAINS" => Func::Contains,
            "STRSTARTS" => Func::StrStarts,
            "STRENDS" => Func::StrEnds,
            "STRBEFORE" => Func::StrBefore,
            "STRAFTER" => Func::StrAfter,
            "CONCAT" => Func::Concat,
            "UCASE" => Func::UCase,
            "LCASE" => Func::LCase,
            "ENCODE_FOR_URI" => Func::EncodeForUri,
            "ABS" => Func::Abs,
            "ROUND" => Func::Round,
            "CEIL" => Func::Ceil,
            "FLOOR" => Func::Floor,
            "LANG" => Func::Lang,
            "DATATYPE" => Func::Datatype,
            "LANGMATCHES" => Func::LangMatches,
            "IRI" | "URI" => Func::Iri,
            "STRDT" => Func::StrDt,
            "STRLANG" => Func::StrLang,
            "BNODE" => Func::BNode,
            "MD5" => Func::Md5,
            "SHA1" => Func::Sha1,
            "SHA256" => Func::Sha256,
            "SHA384" => Func::Sha384,
            "SHA512" => Func::Sha512,
            "UUID" => Func::Uuid,
            "STRUUID" => Func::StrUuid,
            "NOW" => Func::Now,
            "YEAR" => Func::Year,
            "MONTH" => Func::Month,
            "DAY" => Func::Day,
            "HOURS" => Func::Hours,
            "MINUTES" => Func::Minutes,
            "SECONDS" => Func::Seconds,
            "TZ" => Func::Tz,
            "TIMEZONE" => Func::Timezone,
            _ => return None,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Min,
    Max,
    Avg,
    Sample,
    GroupConcat,
}

impl AggFunc {
    pub fn name(self) -> &'static str {
        match self {
            AggFunc::Count => "COUNT",
            AggFunc::Sum => "SUM",
            AggFunc::Min => "MIN",
            AggFunc::Max => "MAX",
            AggFunc::Avg => "AVG",
            AggFunc::Sample => "SAMPLE",
            AggFunc::GroupConcat => "GROUP_CONCAT",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_uppercase().as_str() {
            "COUNT" => AggFunc::Count,
            "SUM" => AggFunc::Sum,
            "MIN" => AggFunc::Min,
            "MAX" => AggFunc::Max,
            "AVG" => AggFunc::Avg,
            "SAMPLE" => AggFunc::Sample,
            "GROUP_CONCAT" => AggFunc::GroupConcat,
            _ => return None,
        })
    }
}

/// FROM / FROM NAMED (or USING / USING NAMED) dataset selection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DatasetClause {
    Default(Text),
    Named(Text),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// `SELECT *`
    All,
    Elems(Vec<ProjElem>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjElem {
    /// `(expr AS ?var)` when present; a bare `?var` otherwise.
    pub expr: Option<Expr>,
    pub var: Term,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Modifiers {
    pub group_by: Vec<Expr>,
    pub having: Vec<Expr>,
    /// (expression, descending)
    pub order_by: Vec<(Expr, bool)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub distinct: bool,
    pub projection: Projection,
    pub dataset: Vec<DatasetClause>,
    pub patterns: Vec<Pattern>,
    pub modifiers: Modifiers,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AskQuery {
    pub dataset: Vec<DatasetClause>,
    pub patterns: Vec<Pattern>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstructQuery {
    pub template: Vec<TriplePattern>,
    pub dataset: Vec<DatasetClause>,
    pub patterns: Vec<Pattern>,
    pub modifiers: Modifiers,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DescribeQuery {
    /// IRIs and/or variables; empty means `DESCRIBE *`.
    pub targets: Vec<Term>,
    pub dataset: Vec<DatasetClause>,
    pub patterns: Vec<Pattern>,
    pub modifiers: Modifiers,
}

/// A block of triples under an optional GRAPH context, as used by
/// INSERT/DELETE templates and data blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct QuadBlock {
    pub graph: Option<Term>,
    pub triples: Vec<TriplePattern>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GraphTarget {
    Default,
    Named,
    All,
    Graph(Text),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GraphOrDefault {
    Default,
    Graph(Text),
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    InsertData(Vec<QuadBlock>),
    DeleteData(Vec<QuadBlock>),
    /// DELETE/INSERT ... WHERE, with optional WITH graph.
    Modify {
        with: Option<Text>,
        delete: Vec<QuadBlock>,
        insert: Vec<QuadBlock>,
        using: Vec<DatasetClause>,
        patterns: Vec<Pattern>,
    },
    Clear {
        silent: bool,
        target: GraphTarget,
    },
    Drop {
        silent: bool,
        target: GraphTarget,
    },
    Create {
        silent: bool,
        graph: Text,
    },
    Copy {
        silent: bool,
        from: GraphOrDefault,
        to: GraphOrDefault,
    },
    Move {
        silent: bool,
        from: GraphOrDefault,
        to: GraphOrDefault,
    },
    Add {
        silent: bool,
        from: GraphOrDefault,
        to: GraphOrDefault,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Select(SelectQuery),
    Ask(AskQuery),
    Construct(ConstructQuery),
    Describe(DescribeQuery),
    Update(Vec<UpdateOp>),
}
