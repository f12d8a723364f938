use std::sync::Arc;

use ssmgr_proto::TOKEN_METADATA_KEY;
use tonic::{Request, Status, service::Interceptor};

/// Rejects calls whose `x-ssmgr-token` does not match the configured token.
///
/// Runs before any handler, so a rejected call never mutates anything.
#[derive(Debug, Clone, Default)]
pub struct TokenCheck {
    expected: Option<Arc<str>>,
}

impl TokenCheck {
    pub fn new(expected: Option<String>) -> Self {
        Self {
            expected: expected
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .map(Arc::from),
        }
    }

    fn accepts<T>(&self, request: &Request<T>) -> bool {
        let Some(expected) = &self.expected else {
            return true;
        };
        request
            .metadata()
            .get(TOKEN_METADATA_KEY)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|got| got.trim() == expected.as_ref())
    }
}

impl Interceptor for TokenCheck {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        if self.accepts(&request) {
            Ok(request)
        } else {
            Err(Status::unauthenticated("invalid or missing node token"))
        }
    }
}
