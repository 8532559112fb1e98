//! A scripted [`DeviceIo`] for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::IoError;
use crate::io::{BusInfo, DeviceId, DeviceIo, Handle, RawCompletion, SubmitRequest};
use crate::transport::Dialect;

type Responder = dyn Fn(SubmitRequest<'_>) -> RawCompletion + Send + Sync;

/// One submission as the provider saw it.
#[derive(Debug, Clone)]
pub struct Submission {
    pub dialect: Dialect,
    pub command: Vec<u8>,
    pub timeout: Duration,
    pub data_len: usize,
}

pub struct ScriptedIo {
    bus: Option<BusInfo>,
    responder: Box<Responder>,
    log: Mutex<Vec<Submission>>,
    closed: AtomicUsize,
}

impl ScriptedIo {
    pub fn new<F>(bus: BusInfo, responder: F) -> Self
    where
        F: Fn(SubmitRequest<'_>) -> RawCompletion + Send + Sync + 'static,
    {
        Self {
            bus: Some(bus),
            responder: Box::new(responder),
            log: Mutex::new(Vec::new()),
            closed: AtomicUsize::new(0),
        }
    }

    /// A device whose bus metadata can't be read.
    pub fn without_metadata() -> Self {
        Self {
            bus: None,
            responder: Box::new(|_| RawCompletion::completed(0)),
            log: Mutex::new(Vec::new()),
            closed: AtomicUsize::new(0),
        }
    }

    pub fn bus_info(&self) -> &BusInfo {
        self.bus.as_ref().expect("scripted device has bus metadata")
    }

    pub fn log(&self) -> Vec<Submission> {
        self.log.lock().clone()
    }

    pub fn dialects(&self) -> Vec<Dialect> {
        self.log.lock().iter().map(|s| s.dialect).collect()
    }

    pub fn submissions(&self) -> usize {
        self.log.lock().len()
    }

    pub fn clear(&self) {
        self.log.lock().clear();
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl DeviceIo for ScriptedIo {
    fn open(&self, id: &DeviceId) -> Result<Handle, IoError> {
        if id.0.is_empty() {
            return Err(IoError::NotFound(id.to_string()));
        }
        Ok(Handle(1))
    }

    fn close(&self, _handle: Handle) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn query_bus_info(&self, _handle: Handle) -> Result<BusInfo, IoError> {
        self.bus
            .clone()
            .ok_or_else(|| IoError::Metadata("scripted device has no metadata".into()))
    }

    fn submit(&self, _handle: Handle, request: SubmitRequest<'_>) -> RawCompletion {
        self.log.lock().push(Submission {
            dialect: request.dialect,
            command: request.command.to_vec(),
            timeout: request.timeout,
            data_len: request.data.len(),
        });
        (self.responder)(request)
    }
}
