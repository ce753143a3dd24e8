//! Scripted [`HttpCapability`] double shared by the unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::transport::{HttpCapability, HttpRequest, HttpResponse, TransportError};

/// Replays canned responses in order and records every request it saw.
///
/// Once the script runs out the last entry is repeated.
pub(crate) struct ScriptedHttp {
    script: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    last: Mutex<Option<Result<HttpResponse, TransportError>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedHttp {
    pub(crate) fn new(script: Vec<Result<HttpResponse, TransportError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn json(status: u16, body: Value) -> Result<HttpResponse, TransportError> {
        Ok(HttpResponse::new(status, body.to_string()))
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpCapability for ScriptedHttp {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(request);
        let next = self.script.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        match next {
            Some(entry) => {
                *last = Some(entry.clone());
                entry
            }
            None => last
                .clone()
                .unwrap_or_else(|| Err(TransportError::Other("script empty".to_string()))),
        }
    }
}
