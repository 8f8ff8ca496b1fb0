//! Service registry and dispatch.
//!
//! A [`Service`] is a named collection of methods. Rust has no runtime
//! reflection, so instead of introspecting a handler value the way a
//! dynamic runtime would, each method is registered explicitly and erased
//! into a [`MethodDescriptor`]: a closure that decodes the argument value
//! with the connection's codec, materializes a zero-valued reply, invokes
//! the handler, and encodes the reply back. The signature shape is fixed
//! by the types:
//!
//! ```text
//! Fn(Args, &mut Reply) -> Result<(), MethodError>
//! ```
//!
//! with `Args: DeserializeOwned` and `Reply: Default + Serialize`.
//! `Default` plays the role of the zero-value constructor, so map- and
//! sequence-shaped replies start out empty rather than absent.
//!
//! # Example
//!
//! ```
//! use jobrpc::service::Service;
//!
//! #[derive(serde::Deserialize)]
//! struct SumArgs { a: i64, b: i64 }
//!
//! let service = Service::new("Arith").unwrap()
//!     .method("Sum", |args: SumArgs, reply: &mut i64| {
//!         *reply = args.a + args.b;
//!         Ok(())
//!     });
//! assert_eq!(service.name(), "Arith");
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::CodecType;
use crate::error::{MethodError, Result, RpcError};

/// Erased invocation primitive: codec + raw argument bytes in, encoded
/// reply bytes out, or the error text destined for the response header.
type InvokeFn = Box<dyn Fn(CodecType, &[u8]) -> std::result::Result<Vec<u8>, String> + Send + Sync>;

/// One registered method: its name, its erased handler, and an atomic
/// call counter.
pub struct MethodDescriptor {
    name: String,
    calls: AtomicU64,
    handler: InvokeFn,
}

impl MethodDescriptor {
    fn new<A, R, F>(name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Default + Serialize + Send + 'static,
        F: Fn(A, &mut R) -> std::result::Result<(), MethodError> + Send + Sync + 'static,
    {
        let handler: InvokeFn = Box::new(move |kind, argv| {
            let args: A = kind.decode(argv).map_err(|e| e.to_string())?;
            let mut reply = R::default();
            f(args, &mut reply).map_err(|e| e.to_string())?;
            kind.encode(&reply).map_err(|e| e.to_string())
        });
        Self {
            name: name.to_string(),
            calls: AtomicU64::new(0),
            handler,
        }
    }

    /// The method's name (without the service qualifier).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How many times this method has been invoked.
    pub fn num_calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Invoke the bound handler with raw argument bytes.
    ///
    /// Every failure mode on this path (argument decode, the handler's
    /// own error, reply encode) collapses into the error text sent back
    /// in the response header.
    pub(crate) fn invoke(&self, kind: CodecType, argv: &[u8]) -> std::result::Result<Vec<u8>, String> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        (self.handler)(kind, argv)
    }
}

impl std::fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("calls", &self.num_calls())
            .finish()
    }
}

/// A named collection of remotely callable methods.
///
/// The name must be exported (start with an uppercase letter), the same
/// visibility rule a reflective runtime would enforce on the handler
/// type. A service with no methods is valid; it just resolves nothing.
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<MethodDescriptor>>,
}

impl Service {
    /// Create an empty service.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::NotExported`] when the name does not start
    /// with an uppercase letter.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !is_exported(&name) {
            return Err(RpcError::NotExported(name));
        }
        Ok(Self {
            name,
            methods: HashMap::new(),
        })
    }

    /// Register a method. Re-registering a name replaces the previous
    /// descriptor.
    pub fn method<A, R, F>(mut self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Default + Serialize + Send + 'static,
        F: Fn(A, &mut R) -> std::result::Result<(), MethodError> + Send + Sync + 'static,
    {
        let descriptor = Arc::new(MethodDescriptor::new::<A, R, F>(name, f));
        self.methods.insert(name.to_string(), descriptor);
        self
    }

    /// The service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a method descriptor by bare method name.
    pub fn get_method(&self, name: &str) -> Option<&Arc<MethodDescriptor>> {
        self.methods.get(name)
    }

    /// Number of registered methods.
    pub fn method_count(&self) -> usize {
        self.methods.len()
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &self.methods.len())
            .finish()
    }
}

/// Server-side mapping `serviceName -> Service`, insert-once.
///
/// Reads are concurrent; inserts are rare and never block steady-state
/// resolution for long.
#[derive(Default)]
pub(crate) struct Registry {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl Registry {
    /// Insert a service. Fails if the name is taken.
    pub fn register(&self, service: Service) -> Result<()> {
        let mut services = self.services.write().expect("service registry lock poisoned");
        if services.contains_key(service.name()) {
            return Err(RpcError::AlreadyRegistered(service.name().to_string()));
        }
        services.insert(service.name().to_string(), Arc::new(service));
        Ok(())
    }

    /// Resolve `Service.Method`, splitting on the last dot.
    pub fn resolve(&self, service_method: &str) -> Result<Arc<MethodDescriptor>> {
        let (service_name, method_name) = service_method
            .rsplit_once('.')
            .ok_or_else(|| RpcError::InvalidServiceMethod(service_method.to_string()))?;
        let service = {
            let services = self.services.read().expect("service registry lock poisoned");
            services
                .get(service_name)
                .cloned()
                .ok_or_else(|| RpcError::ServiceNotFound(service_name.to_string()))?
        };
        service
            .get_method(method_name)
            .cloned()
            .ok_or_else(|| RpcError::MethodNotFound(service_method.to_string()))
    }
}

fn is_exported(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_uppercase())
}
