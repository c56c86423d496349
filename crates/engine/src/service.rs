use crate::Error;

/// One solution row from a federated endpoint: variable names paired
/// with canonical term text (`<iri>`, `_:b`, or a quoted literal).
#[derive(Debug, Clone, Default)]
pub struct ServiceRow {
    pub bindings: Vec<(String, String)>,
}

/// Caller-injected transport for SERVICE clauses. The core does not
/// embed an HTTP client; federation delegates to this interface.
pub trait ServiceExecutor: Send + Sync {
    fn select(&self, endpoint: &str, query: &str) -> Result<Vec<ServiceRow>, Error>;
    fn ask(&self, endpoint: &str, query: &str) -> Result<bool, Error>;
}

/// Default executor: every SERVICE call fails (and `SERVICE SILENT`
/// therefore yields no rows).
pub struct NoService;

impl ServiceExecutor for NoService {
    fn select(&self, endpoint: &str, _query: &str) -> Result<Vec<ServiceRow>, Error> {
        Err(Error::Service(format!(
            "no service executor configured for {endpoint}"
        )))
    }

    fn ask(&self, endpoint: &str, _query: &str) -> Result<bool, Error> {
        Err(Error::Service(format!(
            "no service executor configured for {endpoint}"
        )))
    }
}
