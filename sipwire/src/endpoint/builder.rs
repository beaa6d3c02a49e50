#![deny(missing_docs)]
//! SIP Endpoint Builder
//!

use std::sync::Arc;

use itertools::Itertools;

use util::Resolver;

use crate::endpoint::{Endpoint, Inner, TimerSettings};
use crate::transaction::{TransactionLayer, DEFAULT_MAX_TRANSACTIONS};
use crate::transport::{Transport, TransportLayer};
use crate::SipService;

/// Builder for creating a new SIP `Endpoint`.
pub struct Builder {
    name: String,
    resolver: Resolver,
    timers: TimerSettings,
    max_transactions: usize,
    services: Vec<Box<dyn SipService>>,
    transports: Vec<Arc<dyn Transport>>,
}

impl Builder {
    /// Creates a new default instance of `Builder` to construct a `Endpoint`.
    pub fn new() -> Self {
        Builder {
            name: String::new(),
            resolver: Resolver::default(),
            timers: TimerSettings::default(),
            max_transactions: DEFAULT_MAX_TRANSACTIONS,
            services: vec![],
            transports: vec![],
        }
    }

    /// Sets the endpoint name.
    pub fn with_name<T: AsRef<str>>(mut self, s: T) -> Self {
        self.name = s.as_ref().to_string();

        self
    }

    /// Overrides the transaction timer settings.
    pub fn with_timer_settings(mut self, timers: TimerSettings) -> Self {
        self.timers = timers;

        self
    }

    /// Caps the number of simultaneously registered transactions.
    pub fn with_max_transactions(mut self, max_transactions: usize) -> Self {
        self.max_transactions = max_transactions;

        self
    }

    /// Registers a transport with the endpoint under construction.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);

        self
    }

    /// Adds a service to the endpoint.
    ///
    /// This function can be called multiple times to add additional services.
    /// If a service with the same name already exists, the new service will not
    /// be added.
    pub fn with_service(mut self, service: impl SipService) -> Self {
        if self.service_exists(service.name()) {
            return self;
        }
        self.services.push(Box::new(service));

        self
    }

    /// Add a collection of services to the endpoint.
    ///
    /// Similar to [`Builder::with_service`], but allows adding multiple
    /// services at once. Unlike `with_service`, this method expects the
    /// services to be passed as trait objects (`Box<dyn SipService>`)
    /// instead of concrete types.
    pub fn with_services<I>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = Box<dyn SipService>>,
    {
        for service in services {
            if self.service_exists(service.name()) {
                continue;
            }
            self.services.push(service);
        }

        self
    }

    fn service_exists(&self, name: &str) -> bool {
        let exists = self.services.iter().any(|s| s.name() == name);
        if exists {
            log::warn!("Service with name '{}' already exists", name);
        }
        exists
    }

    /// Finalize the builder into a `Endpoint`.
    pub async fn build(self) -> Endpoint {
        log::trace!("Creating endpoint...");
        log::debug!(
            "Services registered {}",
            format_args!("({})", self.services.iter().map(|s| s.name()).join(", "))
        );

        let transport = TransportLayer::new();
        for tp in self.transports {
            transport.add(tp);
        }

        Endpoint(Arc::new(Inner {
            transport,
            transaction: TransactionLayer::new(self.max_transactions),
            name: self.name,
            resolver: self.resolver,
            services: self.services.into_boxed_slice(),
            timers: self.timers,
        }))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
