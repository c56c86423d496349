//! SPARQL execution over the quad store: value model and expression
//! evaluation, statistics-guided planning, pull-based physical scans
//! with backtracking joins, and query/update entry points.

mod value;
pub use value::Value;

mod binding;
pub use binding::{Row, RowMark};

mod builtins;
mod expr;

mod planner;
pub use planner::PlanCache;

mod scan;

mod service;
pub use service::{NoService, ServiceExecutor, ServiceRow};

mod exec;
pub use exec::{Engine, QueryResult, Solution};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] sparql::ParseError),
    #[error(transparent)]
    Store(#[from] quads::Error),
    #[error("unsupported feature: {0}")]
    Unsupported(&'static str),
    #[error("evaluation error: {0}")]
    Eval(String),
    #[error("service call failed: {0}")]
    Service(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl From<atoms::Error> for Error {
    fn from(err: atoms::Error) -> Self {
        Error::Store(quads::Error::Atom(err))
    }
}
