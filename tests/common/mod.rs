#![allow(dead_code)]

pub mod blobs;
pub mod registry;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use layerpeek::{Config, Digest, EventHandler, RegistryContext};

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Request(String, String),
    Auth(String),
    Range(u64, u64),
    Listed(Digest, usize),
}

/// [`EventHandler`] to collect events in a shared list.
#[derive(Clone, Default)]
pub struct Events(Arc<Mutex<Vec<Event>>>);

impl Events {
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }

    pub fn ranges(&self) -> usize {
        self.count(|e| matches!(e, Event::Range(..)))
    }

    pub fn auths(&self) -> usize {
        self.count(|e| matches!(e, Event::Auth(_)))
    }

    fn count(&self, f: impl Fn(&Event) -> bool) -> usize {
        self.0.lock().unwrap().iter().filter(|e| f(e)).count()
    }
}

impl EventHandler for Events {
    fn registry_request(&self, method: &str, url: &str) {
        let event = Event::Request(method.to_owned(), url.to_owned());
        self.0.lock().unwrap().push(event);
    }

    fn registry_auth(&self, url: &str) {
        self.0.lock().unwrap().push(Event::Auth(url.to_owned()));
    }

    fn range_request(&self, _: &str, start: u64, end: u64) {
        self.0.lock().unwrap().push(Event::Range(start, end));
    }

    fn layer_listed(&self, digest: &Digest, entries: usize) {
        self.0.lock().unwrap().push(Event::Listed(digest.clone(), entries));
    }
}

/// Configuration with short timeouts for the tests.
pub fn config() -> Config {
    Config::default()
        .registry_timeout(Duration::from_secs(10))
        .operation_timeout(Duration::from_secs(30))
}

pub fn context(config: Config) -> (RegistryContext, Events) {
    let events = Events::default();
    let ctx = RegistryContext::with_event_handler(config, events.clone()).unwrap();
    (ctx, events)
}
