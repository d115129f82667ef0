#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;
use weft_engine::{Effect, Payload, Runtime};

pub type Error = &'static str;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .try_init();
}

/// Runtime bound to the test's tokio pool.
pub fn runtime() -> Runtime {
    init_tracing();
    Runtime::current().expect("tests run inside a tokio runtime")
}

/// One-shot signal between fibers.
#[derive(Clone, Default)]
pub struct Latch(Arc<Notify>);

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open<E: Payload>(&self) -> Effect<(), E> {
        let notify = self.0.clone();
        Effect::sync(move || notify.notify_one())
    }

    pub fn wait<E: Payload>(&self) -> Effect<(), E> {
        let notify = self.0.clone();
        Effect::from_future(move || {
            let notify = notify.clone();
            async move {
                notify.notified().await;
                Ok(())
            }
        })
    }
}

/// Ordered record of events observed across fibers.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record<E: Payload>(&self, entry: &'static str) -> Effect<(), E> {
        let entries = self.0.clone();
        Effect::sync(move || entries.lock().expect("journal lock poisoned").push(entry.to_string()))
    }

    pub fn push(&self, entry: &str) {
        self.0.lock().expect("journal lock poisoned").push(entry.to_string());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().expect("journal lock poisoned").clone()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.entries().iter().any(|existing| existing == entry)
    }
}
