//! Service container: named components with declared dependency edges and a
//! two-phase lifecycle (init, then start) plus reverse-order stop.
//!
//! Components register a factory and optional lifecycle hooks; `initialize`
//! resolves every singleton in registration order, running declared
//! dependencies first. Cycles are detected at resolve time and reported with
//! the full offending chain. No component installs itself globally.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use futures::future::BoxFuture;
use tracing::{debug, info};

pub type AnyService = Arc<dyn Any + Send + Sync>;
pub type Factory =
    Box<dyn Fn(Arc<ServiceContainer>) -> BoxFuture<'static, Result<AnyService>> + Send + Sync>;
pub type Hook = Box<dyn Fn(AnyService) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Registration for one component.
pub struct ServiceSpec {
    factory: Factory,
    singleton: bool,
    dependencies: Vec<String>,
    on_init: Option<Hook>,
    on_start: Option<Hook>,
    on_stop: Option<Hook>,
}

impl ServiceSpec {
    /// Singleton with an async factory. Most components are this.
    pub fn singleton<F, Fut, T>(factory: F) -> Self
    where
        F: Fn(Arc<ServiceContainer>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Arc<T>>> + Send + 'static,
        T: Send + Sync + 'static,
    {
        Self {
            factory: Box::new(move |container| {
                let fut = factory(container);
                Box::pin(async move { fut.await.map(|service| service as AnyService) })
            }),
            singleton: true,
            dependencies: vec![],
            on_init: None,
            on_start: None,
            on_stop: None,
        }
    }

    pub fn depends_on(mut self, dependencies: &[&str]) -> Self {
        self.dependencies = dependencies.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn transient(mut self) -> Self {
        self.singleton = false;
        self
    }

    pub fn on_init<T, F, Fut>(mut self, hook: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.on_init = Some(typed_hook(hook));
        self
    }

    pub fn on_start<T, F, Fut>(mut self, hook: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.on_start = Some(typed_hook(hook));
        self
    }

    pub fn on_stop<T, F, Fut>(mut self, hook: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.on_stop = Some(typed_hook(hook));
        self
    }
}

fn typed_hook<T, F, Fut>(hook: F) -> Hook
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move |service| {
        let downcast = service.downcast::<T>();
        match downcast {
            Ok(typed) => Box::pin(hook(typed)),
            Err(_) => Box::pin(async { bail!("lifecycle hook received wrong service type") }),
        }
    })
}

#[derive(Default)]
pub struct ServiceContainer {
    registrations: Mutex<HashMap<String, Arc<ServiceSpec>>>,
    /// Registration order; drives init/start order and reverse stop order.
    order: Mutex<Vec<String>>,
    instances: Mutex<HashMap<String, AnyService>>,
}

impl ServiceContainer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a component. Re-registration is rejected, except when the
    /// existing entry is an already-resolved singleton (idempotent no-op).
    /// Use [`ServiceContainer::register_override`] to replace deliberately.
    pub fn register(&self, name: &str, spec: ServiceSpec) -> Result<()> {
        let mut registrations = self.registrations.lock().unwrap();
        if registrations.contains_key(name) {
            if self.instances.lock().unwrap().contains_key(name) {
                debug!(name, "duplicate registration of resolved singleton ignored");
                return Ok(());
            }
            bail!("component {name:?} is already registered");
        }
        registrations.insert(name.to_string(), Arc::new(spec));
        self.order.lock().unwrap().push(name.to_string());
        Ok(())
    }

    pub fn register_override(&self, name: &str, spec: ServiceSpec) {
        let mut registrations = self.registrations.lock().unwrap();
        if registrations.insert(name.to_string(), Arc::new(spec)).is_none() {
            self.order.lock().unwrap().push(name.to_string());
        }
        self.instances.lock().unwrap().remove(name);
    }

    /// Resolve a component, building declared dependencies first. Reports
    /// dependency cycles with the full offending chain.
    pub async fn resolve(self: &Arc<Self>, name: &str) -> Result<AnyService> {
        let mut stack = Vec::new();
        self.resolve_inner(name, &mut stack).await
    }

    fn resolve_inner<'a>(
        self: &'a Arc<Self>,
        name: &'a str,
        stack: &'a mut Vec<String>,
    ) -> BoxFuture<'a, Result<AnyService>> {
        Box::pin(async move {
            if let Some(existing) = self.instances.lock().unwrap().get(name) {
                return Ok(existing.clone());
            }

            if stack.iter().any(|entry| entry == name) {
                let mut chain: Vec<&str> = stack.iter().map(String::as_str).collect();
                chain.push(name);
                bail!("dependency cycle: {}", chain.join(" → "));
            }

            let spec = self
                .registrations
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("no component registered as {name:?}"))?;

            stack.push(name.to_string());
            for dependency in &spec.dependencies {
                self.resolve_inner(dependency, stack)
                    .await
                    .with_context(|| format!("resolving dependency of {name:?}"))?;
            }
            stack.pop();

            let service = (spec.factory)(self.clone())
                .await
                .with_context(|| format!("building component {name:?}"))?;

            if spec.singleton {
                self.instances
                    .lock()
                    .unwrap()
                    .insert(name.to_string(), service.clone());
            }
            Ok(service)
        })
    }

    /// Typed access to an already-resolved singleton. Factories use this for
    /// their declared dependencies.
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>> {
        let instance = self
            .instances
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("component {name:?} is not resolved"))?;
        instance
            .downcast::<T>()
            .map_err(|_| anyhow!("component {name:?} has a different type"))
    }

    /// Phase one: resolve every singleton, then run `on_init` hooks in
    /// registration order.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        let names = self.order.lock().unwrap().clone();
        for name in &names {
            let singleton = self
                .registrations
                .lock()
                .unwrap()
                .get(name)
                .map(|spec| spec.singleton)
                .unwrap_or(false);
            if singleton {
                self.resolve(name).await?;
            }
        }
        for name in &names {
            let Ok((spec, instance)) = self.hook_target(name) else {
                continue; // transient components carry no lifecycle state
            };
            if let Some(hook) = &spec.on_init {
                debug!(name = name.as_str(), "on_init");
                hook(instance).await.with_context(|| format!("on_init of {name:?}"))?;
            }
        }
        info!(components = names.len(), "container initialized");
        Ok(())
    }

    /// Phase two: `on_start` hooks in registration order.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let names = self.order.lock().unwrap().clone();
        for name in &names {
            let Ok((spec, instance)) = self.hook_target(name) else {
                continue;
            };
            if let Some(hook) = &spec.on_start {
                debug!(name = name.as_str(), "on_start");
                hook(instance).await.with_context(|| format!("on_start of {name:?}"))?;
            }
        }
        info!("container started");
        Ok(())
    }

    /// `on_stop` hooks in reverse registration order. Hook failures are
    /// reported but do not stop the remaining teardown.
    pub async fn stop(self: &Arc<Self>) -> Result<()> {
        let names: Vec<String> = {
            let order = self.order.lock().unwrap();
            order.iter().rev().cloned().collect()
        };
        let mut first_error = None;
        for name in &names {
            let Ok((spec, instance)) = self.hook_target(name) else {
                continue;
            };
            if let Some(hook) = &spec.on_stop {
                debug!(name = name.as_str(), "on_stop");
                if let Err(err) = hook(instance).await {
                    tracing::warn!(name = name.as_str(), %err, "on_stop failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        info!("container stopped");
        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    fn hook_target(&self, name: &str) -> Result<(Arc<ServiceSpec>, AnyService)> {
        let spec = self
            .registrations
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("no component registered as {name:?}"))?;
        let instance = self
            .instances
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("component {name:?} is not resolved"))?;
        Ok((spec, instance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Leaf;
    struct Branch {
        _leaf: Arc<Leaf>,
    }

    #[tokio::test]
    async fn resolves_declared_dependencies_first() {
        let container = ServiceContainer::new();
        container
            .register("leaf", ServiceSpec::singleton(|_| async { Ok(Arc::new(Leaf)) }))
            .unwrap();
        container
            .register(
                "branch",
                ServiceSpec::singleton(|c: Arc<ServiceContainer>| async move {
                    let leaf = c.get::<Leaf>("leaf")?;
                    Ok(Arc::new(Branch { _leaf: leaf }))
                })
                .depends_on(&["leaf"]),
            )
            .unwrap();

        container.initialize().await.unwrap();
        assert!(container.get::<Branch>("branch").is_ok());
    }

    #[tokio::test]
    async fn singleton_is_built_once() {
        let container = ServiceContainer::new();
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        container
            .register(
                "leaf",
                ServiceSpec::singleton(move |_| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::Relaxed);
                        Ok(Arc::new(Leaf))
                    }
                }),
            )
            .unwrap();

        container.resolve("leaf").await.unwrap();
        container.resolve("leaf").await.unwrap();
        assert_eq!(builds.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn cycle_is_reported_with_full_chain() {
        let container = ServiceContainer::new();
        container
            .register(
                "a",
                ServiceSpec::singleton(|_| async { Ok(Arc::new(Leaf)) }).depends_on(&["b"]),
            )
            .unwrap();
        container
            .register(
                "b",
                ServiceSpec::singleton(|_| async { Ok(Arc::new(Leaf)) }).depends_on(&["c"]),
            )
            .unwrap();
        container
            .register(
                "c",
                ServiceSpec::singleton(|_| async { Ok(Arc::new(Leaf)) }).depends_on(&["a"]),
            )
            .unwrap();

        let err = container.resolve("a").await.unwrap_err();
        let text = format!("{err:#}");
        assert!(text.contains("a → b → c → a"), "got: {text}");
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected_until_resolved() {
        let container = ServiceContainer::new();
        container
            .register("leaf", ServiceSpec::singleton(|_| async { Ok(Arc::new(Leaf)) }))
            .unwrap();
        // Unresolved duplicate: error.
        assert!(container
            .register("leaf", ServiceSpec::singleton(|_| async { Ok(Arc::new(Leaf)) }))
            .is_err());

        container.resolve("leaf").await.unwrap();
        // Resolved singleton: idempotent no-op.
        container
            .register("leaf", ServiceSpec::singleton(|_| async { Ok(Arc::new(Leaf)) }))
            .unwrap();
    }

    #[tokio::test]
    async fn lifecycle_runs_in_order_and_stops_in_reverse() {
        let container = ServiceContainer::new();
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second"] {
            let init_log = log.clone();
            let start_log = log.clone();
            let stop_log = log.clone();
            let init_name = format!("init:{name}");
            let start_name = format!("start:{name}");
            let stop_name = format!("stop:{name}");
            container
                .register(
                    name,
                    ServiceSpec::singleton(|_| async { Ok(Arc::new(Leaf)) })
                        .on_init::<Leaf, _, _>(move |_| {
                            let log = init_log.clone();
                            let tag = init_name.clone();
                            async move {
                                log.lock().unwrap().push(tag);
                                Ok(())
                            }
                        })
                        .on_start::<Leaf, _, _>(move |_| {
                            let log = start_log.clone();
                            let tag = start_name.clone();
                            async move {
                                log.lock().unwrap().push(tag);
                                Ok(())
                            }
                        })
                        .on_stop::<Leaf, _, _>(move |_| {
                            let log = stop_log.clone();
                            let tag = stop_name.clone();
                            async move {
                                log.lock().unwrap().push(tag);
                                Ok(())
                            }
                        }),
                )
                .unwrap();
        }

        container.initialize().await.unwrap();
        container.start().await.unwrap();
        container.stop().await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "init:first",
                "init:second",
                "start:first",
                "start:second",
                "stop:second",
                "stop:first",
            ]
        );
    }

    #[tokio::test]
    async fn transient_components_rebuild_each_resolve() {
        let container = ServiceContainer::new();
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        container
            .register(
                "scratch",
                ServiceSpec::singleton(move |_| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::Relaxed);
                        Ok(Arc::new(Leaf))
                    }
                })
                .transient(),
            )
            .unwrap();

        container.resolve("scratch").await.unwrap();
        container.resolve("scratch").await.unwrap();
        assert_eq!(builds.load(Ordering::Relaxed), 2);
    }
}
