use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use super::*;

/// Counts constructions and disposals of the services it hands out
#[derive(Default)]
struct Counters {
    built: AtomicUsize,
    disposed: AtomicUsize,
}

impl Counters {
    fn built(&self) -> usize {
        self.built.load(Ordering::SeqCst)
    }

    fn disposed(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// Stand-in for a database context
struct BlogContext {
    generation: usize,
    saved: AtomicUsize,
    counters: Arc<Counters>,
}

impl Dispose for BlogContext {
    fn dispose(&self) -> Result<(), BoxError> {
        self.counters.disposed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Second service sharing the scoped context
struct PostRepository {
    context: Arc<BlogContext>,
}

/// Never registered
struct AuditLog;

fn extension(counters: &Arc<Counters>) -> InjectExtension {
    let counters = Arc::clone(counters);
    InjectExtension::new(
        &ExtensionConfig::default(),
        ConnectionString::new("Server=test"),
        move |services| {
            services
                .add_scoped_disposable(move |r| {
                    r.resolve::<ConnectionString>()?;
                    let generation = counters.built.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(BlogContext {
                        generation,
                        saved: AtomicUsize::new(0),
                        counters: Arc::clone(&counters),
                    })
                })
                .add_transient(|r| {
                    Ok(PostRepository {
                        context: r.resolve()?,
                    })
                });
        },
    )
}

/// Plays the host: binds `parameters` injected values, then runs the handler
fn run_invocation(
    extension: &InjectExtension,
    id: InvocationId,
    parameters: usize,
    fail: bool,
) -> Result<(), CleanupError> {
    let cleanup = extension.cleanup();
    cleanup.on_start(id);
    let values: Vec<_> = (0..parameters)
        .map(|_| extension.resolver().resolve_typed::<BlogContext>(id).unwrap())
        .collect();
    for value in &values {
        value.saved.fetch_add(1, Ordering::SeqCst);
    }
    drop(values);
    if fail {
        cleanup.on_exception(id)
    } else {
        cleanup.on_success(id)
    }
}

#[test]
fn one_scope_and_one_dispose_per_invocation() {
    for parameters in [0, 1, 5] {
        let counters = Arc::new(Counters::default());
        let extension = extension(&counters);

        run_invocation(&extension, InvocationId::new(), parameters, false).unwrap();

        let expected = usize::from(parameters > 0);
        assert_eq!(extension.resolver().factory().created(), expected as u64);
        assert_eq!(counters.built(), expected);
        assert_eq!(counters.disposed(), expected);
        assert!(extension.store().is_empty());
    }
}

#[test]
fn exception_path_cleans_up_like_success() {
    for fail in [false, true] {
        let counters = Arc::new(Counters::default());
        let extension = extension(&counters);
        let id = InvocationId::new();

        run_invocation(&extension, id, 2, fail).unwrap();

        assert_eq!(counters.disposed(), 1);
        assert!(!extension.store().contains(id));
    }
}

#[test]
fn unregistered_type_is_a_configuration_error() {
    let counters = Arc::new(Counters::default());
    let extension = extension(&counters);
    let id = InvocationId::new();

    let err = extension.resolver().resolve_typed::<AuditLog>(id).err().unwrap();
    assert!(matches!(err, BindingError::Unregistered { service } if service.ends_with("AuditLog")));
    assert!(!extension.store().contains(id));
    assert_eq!(extension.resolver().factory().created(), 0);

    // the host fails the invocation: cleanup has nothing to release
    extension.cleanup().on_exception(id).unwrap();
    assert!(extension.store().is_empty());
    assert_eq!(counters.disposed(), 0);
}

#[test]
fn invocations_share_nothing() {
    let counters = Arc::new(Counters::default());
    let extension = extension(&counters);
    let resolver = extension.resolver();
    let first = BindingDescriptor::of::<BlogContext>();
    let second = BindingDescriptor::of::<PostRepository>();

    let i1 = InvocationId::new();
    let a = resolver.resolve(i1, &first).unwrap();
    let b = resolver.resolve(i1, &second).unwrap();
    assert!(a.is::<BlogContext>());
    assert_eq!(b.service(), second.service());
    let context = a.downcast::<BlogContext>().unwrap();
    let repository = b.downcast::<PostRepository>().unwrap();
    assert!(Arc::ptr_eq(&context, &repository.context));
    assert_eq!(context.generation, 1);
    context.saved.fetch_add(1, Ordering::SeqCst);
    assert_eq!(counters.built(), 1);

    extension.cleanup().on_success(i1).unwrap();
    assert!(!extension.store().contains(i1));
    assert_eq!(counters.disposed(), 1);

    let i2 = InvocationId::new();
    let fresh = resolver.resolve_typed::<BlogContext>(i2).unwrap();
    assert!(!Arc::ptr_eq(&context, &fresh));
    assert_eq!(fresh.generation, 2);
    assert_eq!(fresh.saved.load(Ordering::SeqCst), 0);
    extension.cleanup().on_success(i2).unwrap();
}

#[test]
fn concurrent_bindings_of_one_invocation_share_the_scope() {
    let counters = Arc::new(Counters::default());
    let extension = extension(&counters);
    let id = InvocationId::new();
    let barrier = Barrier::new(6);
    let (resolver, barrier_ref) = (extension.resolver(), &barrier);

    let values: Vec<Arc<BlogContext>> = thread::scope(|s| {
        let handles: Vec<_> = (0..6)
            .map(|_| {
                s.spawn(move || {
                    barrier_ref.wait();
                    resolver.resolve_typed::<BlogContext>(id).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
    assert_eq!(resolver.factory().created(), 1);
    assert_eq!(counters.built(), 1);
    extension.cleanup().on_success(id).unwrap();
    assert_eq!(counters.disposed(), 1);
}

#[test]
fn binding_after_release_fails_fast() {
    let counters = Arc::new(Counters::default());
    let extension = extension(&counters);
    let id = InvocationId::new();
    extension.resolver().resolve_typed::<BlogContext>(id).unwrap();
    extension.cleanup().on_success(id).unwrap();

    let err = extension.resolver().resolve_typed::<BlogContext>(id).err().unwrap();
    assert!(matches!(
        err,
        BindingError::Lifecycle(LifecycleViolation::ResolvedAfterRelease(_))
    ));
    assert_eq!(extension.resolver().factory().created(), 1);
    assert!(extension.store().is_empty());
}

#[test]
fn cleanup_firing_twice_is_reported() {
    let counters = Arc::new(Counters::default());
    let extension = extension(&counters);
    let id = InvocationId::new();
    extension.resolver().resolve_typed::<BlogContext>(id).unwrap();

    extension.cleanup().on_success(id).unwrap();
    let err = extension.cleanup().on_exception(id).unwrap_err();
    assert!(matches!(
        err,
        CleanupError::Lifecycle(LifecycleViolation::AlreadyReleased(rid)) if rid == id
    ));
    assert_eq!(counters.disposed(), 1);
}

#[test]
fn dispose_failure_still_removes_the_scope() {
    struct Flaky;
    impl Dispose for Flaky {
        fn dispose(&self) -> Result<(), BoxError> {
            Err("connection already closed".into())
        }
    }
    let mut services = ServiceCollection::new();
    services.add_scoped_disposable(|_| Ok(Flaky));
    let extension = InjectExtension::with_services(&ExtensionConfig::default(), services);
    let id = InvocationId::new();
    extension.resolver().resolve_typed::<Flaky>(id).unwrap();

    let err = extension.cleanup().on_success(id).unwrap_err();
    assert!(matches!(err, CleanupError::Dispose(_)));
    assert!(!extension.store().contains(id));
    assert!(extension.store().is_released(id));
}

#[test]
fn dropped_guard_releases_the_scope() {
    let counters = Arc::new(Counters::default());
    let extension = extension(&counters);
    let id = InvocationId::new();

    let guard = extension.cleanup().guard(id);
    extension.resolver().resolve_typed::<BlogContext>(id).unwrap();
    // cancelled before the handler ran
    drop(guard);

    assert_eq!(counters.disposed(), 1);
    assert!(extension.store().is_empty());
}

#[test]
fn completed_guard_releases_once() {
    let counters = Arc::new(Counters::default());
    let extension = extension(&counters);
    let id = InvocationId::new();

    let guard = extension.cleanup().guard(id);
    assert_eq!(guard.invocation_id(), id);
    extension.resolver().resolve_typed::<BlogContext>(id).unwrap();
    guard.complete(Outcome::Succeeded).unwrap();

    assert_eq!(counters.disposed(), 1);
    assert!(extension.store().is_released(id));
}

#[derive(Debug)]
#[allow(dead_code)]
enum HandlerError {
    Binding(BindingError),
    Cleanup(CleanupError),
    Rejected,
}

impl From<BindingError> for HandlerError {
    fn from(err: BindingError) -> Self {
        Self::Binding(err)
    }
}

impl From<CleanupError> for HandlerError {
    fn from(err: CleanupError) -> Self {
        Self::Cleanup(err)
    }
}

#[test]
fn invoke_releases_on_every_exit() {
    let counters = Arc::new(Counters::default());
    let extension = extension(&counters);

    let saved = extension
        .invoke(InvocationId::new(), |invocation| -> Result<usize, HandlerError> {
            let context = invocation.resolve::<BlogContext>()?;
            let repository = invocation.resolve::<PostRepository>()?;
            assert!(Arc::ptr_eq(&context, &repository.context));
            Ok(context.saved.fetch_add(1, Ordering::SeqCst) + 1)
        })
        .unwrap();
    assert_eq!(saved, 1);
    assert_eq!(counters.disposed(), 1);

    let rejected = extension.invoke(InvocationId::new(), |invocation| -> Result<(), HandlerError> {
        invocation.resolve::<BlogContext>()?;
        Err(HandlerError::Rejected)
    });
    assert!(matches!(rejected, Err(HandlerError::Rejected)));
    assert_eq!(counters.disposed(), 2);

    let missing = extension.invoke(InvocationId::new(), |invocation| -> Result<(), HandlerError> {
        invocation.resolve::<AuditLog>()?;
        Ok(())
    });
    assert!(matches!(
        missing,
        Err(HandlerError::Binding(BindingError::Unregistered { .. }))
    ));

    let panicked = panic::catch_unwind(AssertUnwindSafe(|| {
        extension.invoke(InvocationId::new(), |invocation| -> Result<(), HandlerError> {
            invocation.resolve::<BlogContext>()?;
            panic!("handler crashed");
        })
    }));
    assert!(panicked.is_err());
    assert_eq!(counters.built(), 3);
    assert_eq!(counters.disposed(), 3);
    assert!(extension.store().is_empty());
}

#[test]
fn singletons_are_shared_across_scopes() {
    struct Clock;
    let mut services = ServiceCollection::new();
    services.add_singleton(|_| Ok(Clock));
    let extension = InjectExtension::with_services(&ExtensionConfig::default(), services);
    let resolver = extension.resolver();

    let (i1, i2) = (InvocationId::new(), InvocationId::new());
    let a = resolver.resolve_typed::<Clock>(i1).unwrap();
    let b = resolver.resolve_typed::<Clock>(i2).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&a, &extension.root().resolve::<Clock>().unwrap()));
    assert_eq!(extension.root().lifetime_of::<Clock>(), Some(Lifetime::Singleton));
}

#[test]
fn scoped_services_are_unreachable_from_singletons() {
    struct Session;
    struct Cache(#[allow(dead_code)] Arc<Session>);
    let mut services = ServiceCollection::new();
    services
        .add_scoped(|_| Ok(Session))
        .add_singleton(|r| Ok(Cache(r.resolve()?)));
    let root = services.build();

    assert!(matches!(
        root.resolve::<Session>(),
        Err(BindingError::ScopedFromRoot { .. })
    ));
    let err = ScopeFactory::new(Arc::new(root))
        .create()
        .resolve::<Cache>()
        .err()
        .unwrap();
    assert!(matches!(err, BindingError::Construction { .. }));
}

#[test]
fn dependency_cycles_are_reported() {
    struct Left(#[allow(dead_code)] Arc<Right>);
    struct Right(#[allow(dead_code)] Arc<Left>);
    let mut services = ServiceCollection::new();
    services
        .add_scoped(|r| Ok(Left(r.resolve()?)))
        .add_transient(|r| Ok(Right(r.resolve()?)));
    let scope = ScopeFactory::new(Arc::new(services.build())).create();

    let err = scope.resolve::<Left>().err().unwrap();
    let BindingError::Construction { source, .. } = err else {
        panic!("unexpected error {err}");
    };
    assert!(source.to_string().contains("Cyclic"));
    scope.dispose().unwrap();
}

#[test]
fn cycles_across_parallel_bindings_do_not_deadlock() {
    struct Left(#[allow(dead_code)] Arc<Right>);
    struct Right(#[allow(dead_code)] Arc<Left>);
    let mut services = ServiceCollection::new();
    services
        .add_scoped(|r| {
            thread::sleep(Duration::from_millis(200));
            Ok(Left(r.resolve()?))
        })
        .add_scoped(|r| {
            thread::sleep(Duration::from_millis(200));
            Ok(Right(r.resolve()?))
        });
    let extension = InjectExtension::with_services(&ExtensionConfig::default(), services);
    let id = InvocationId::new();
    let barrier = Arc::new(Barrier::new(2));
    let (tx, rx) = mpsc::channel();

    for left in [true, false] {
        let resolver = Arc::clone(extension.resolver());
        let (barrier, tx) = (Arc::clone(&barrier), tx.clone());
        thread::spawn(move || {
            barrier.wait();
            let result = if left {
                resolver.resolve_typed::<Left>(id).map(drop)
            } else {
                resolver.resolve_typed::<Right>(id).map(drop)
            };
            let _ = tx.send(result);
        });
    }

    for _ in 0..2 {
        let err = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("parallel bindings of one invocation must not hang")
            .err()
            .unwrap();
        assert!(matches!(err, BindingError::Construction { .. }));
        assert!(err.to_string().contains("Cyclic"));
    }
    extension.cleanup().on_exception(id).unwrap();
    assert!(extension.store().is_empty());
}

#[test]
fn registrations_and_values_expose_their_types() {
    struct Tenant(&'static str);
    let seen_scope = Arc::new(Mutex::new(None));
    let recorded = Arc::clone(&seen_scope);
    let mut services = ServiceCollection::new();
    assert!(services.is_empty());
    services.add_scoped(move |r| {
        *recorded.lock().unwrap() = r.scope_id();
        Ok(Tenant("blog"))
    });
    assert!(services.contains::<Tenant>());
    assert!(!services.contains::<AuditLog>());
    assert_eq!(services.len(), 1);

    let extension = InjectExtension::with_services(&ExtensionConfig::default(), services);
    assert!(extension.root().is_registered::<Tenant>());
    assert!(!extension.root().is_registered::<AuditLog>());

    let uuid = uuid::Uuid::new_v4();
    let id = InvocationId::from(uuid);
    assert_eq!(id.as_uuid(), &uuid);

    let descriptor = BindingDescriptor::of::<Tenant>();
    assert_eq!(descriptor.type_id(), std::any::TypeId::of::<Tenant>());
    let value = extension.resolver().resolve(id, &descriptor).unwrap();
    assert_eq!(value.type_id(), descriptor.type_id());
    assert_eq!(value.downcast_ref::<Tenant>().map(|t| t.0), Some("blog"));
    assert!(value.downcast_ref::<AuditLog>().is_none());

    let scope = extension.store().remove_and_take(id).into_scope().unwrap();
    assert_eq!(*seen_scope.lock().unwrap(), Some(scope.id()));
    scope.dispose().unwrap();
}

#[test]
fn reentrant_binding_of_the_same_invocation_does_not_deadlock() {
    struct Outer;
    let slot: Arc<Mutex<Option<(Arc<BindingResolver>, InvocationId)>>> = Arc::default();
    let inner_slot = Arc::clone(&slot);
    let mut services = ServiceCollection::new();
    services.add_scoped(move |_| {
        let target = inner_slot.lock().unwrap().clone();
        if let Some((resolver, id)) = target {
            resolver.resolve_typed::<Outer>(id)?;
        }
        Ok(Outer)
    });
    let extension = InjectExtension::with_services(&ExtensionConfig::default(), services);
    let id = InvocationId::new();
    *slot.lock().unwrap() = Some((Arc::clone(extension.resolver()), id));

    let err = extension.resolver().resolve_typed::<Outer>(id).err().unwrap();
    assert!(matches!(err, BindingError::Construction { .. }));
    *slot.lock().unwrap() = None;
    extension.cleanup().on_success(id).unwrap();
}

/// Minimal host recording what the extension registered
#[derive(Default)]
struct FakeHost {
    rules: Vec<Arc<dyn BindingRule>>,
    filters: Vec<Arc<dyn InvocationFilter>>,
}

impl HostPipeline for FakeHost {
    fn add_binding_rule(&mut self, rule: Arc<dyn BindingRule>) {
        self.rules.push(rule);
    }

    fn add_invocation_filter(&mut self, filter: Arc<dyn InvocationFilter>) {
        self.filters.push(filter);
    }
}

impl FakeHost {
    fn dispatch(
        &self,
        parameters: &[BindingDescriptor],
        fail: bool,
    ) -> Result<Vec<ResolvedValue>, BindingError> {
        let id = InvocationId::new();
        let rule = self
            .rules
            .iter()
            .find(|rule| rule.marker() == INJECT_MARKER)
            .expect("inject rule registered");
        for filter in &self.filters {
            filter.on_executing(id);
        }
        let bound: Result<Vec<_>, _> = parameters.iter().map(|p| rule.bind(id, p)).collect();
        let failed = fail || bound.is_err();
        for filter in &self.filters {
            let cleaned = if failed {
                filter.on_exception(id)
            } else {
                filter.on_executed(id)
            };
            cleaned.unwrap();
        }
        bound
    }
}

#[test]
fn host_pipeline_routes_marked_parameters() {
    let counters = Arc::new(Counters::default());
    let extension = extension(&counters);
    let mut host = FakeHost::default();
    extension.register(&mut host);
    assert_eq!(host.rules.len(), 1);
    assert_eq!(host.filters.len(), 1);

    let params = [
        BindingDescriptor::of::<BlogContext>(),
        BindingDescriptor::of::<PostRepository>(),
    ];
    let values = host.dispatch(&params, false).unwrap();
    assert_eq!(values.len(), 2);
    assert_eq!(counters.built(), 1);
    assert_eq!(counters.disposed(), 1);

    host.dispatch(&params, true).unwrap();
    assert_eq!(counters.disposed(), 2);

    let err = host
        .dispatch(&[BindingDescriptor::of::<AuditLog>()], false)
        .unwrap_err();
    assert!(matches!(err, BindingError::Unregistered { .. }));
    assert!(extension.store().is_empty());
}

#[test]
fn from_env_requires_the_connection_string() {
    let config = ExtensionConfig::new().with_connection_string_var("SCOPEBIND_TEST_UNSET_VARIABLE");
    let err = InjectExtension::from_env(config, |_| {}).err().unwrap();
    assert_eq!(
        err,
        ConfigError::MissingVariable {
            name: "SCOPEBIND_TEST_UNSET_VARIABLE".to_string()
        }
    );
}
