//! An "insert record" function receiving a scoped database context.
//!
//! Run with `SQLConnectionString` set, e.g.
//!
//! ```text
//! SQLConnectionString="Server=localhost;Database=blog" RUST_LOG=debug \
//!     cargo run --example insert_record
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use scopebind::*;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct PostEntity {
    id: usize,
    title: String,
}

/// Shared storage standing in for the database server
#[derive(Default)]
struct Database {
    posts: Mutex<Vec<PostEntity>>,
}

/// Unit of work over the database, one per invocation
struct BlogContext {
    connection: Arc<ConnectionString>,
    database: Arc<Database>,
    pending: Mutex<Vec<String>>,
    saved: AtomicUsize,
}

impl BlogContext {
    fn new(connection: Arc<ConnectionString>, database: Arc<Database>) -> Self {
        // the value may carry credentials, only its size is logged
        tracing::debug!(connection_len = connection.as_str().len(), "opening blog context");
        Self {
            connection,
            database,
            pending: Mutex::default(),
            saved: AtomicUsize::new(0),
        }
    }

    fn add_post(&self, title: String) {
        self.pending.lock().unwrap().push(title);
    }

    fn save_changes(&self) -> usize {
        let pending: Vec<_> = self.pending.lock().unwrap().drain(..).collect();
        let mut posts = self.database.posts.lock().unwrap();
        for title in pending {
            let id = posts.len() + 1;
            posts.push(PostEntity { id, title });
            self.saved.fetch_add(1, Ordering::SeqCst);
        }
        self.saved.load(Ordering::SeqCst)
    }
}

impl Dispose for BlogContext {
    fn dispose(&self) -> Result<(), BoxError> {
        let discarded = self.pending.lock().unwrap().len();
        tracing::info!(
            saved = self.saved.load(Ordering::SeqCst),
            discarded,
            "closing blog context"
        );
        Ok(())
    }
}

/// The function body: add a post with a fresh title
fn insert_db_record(context: &BlogContext) -> String {
    let title = Uuid::new_v4();
    context.add_post(title.to_string());
    context.save_changes();
    format!(
        "Inserted {title} into database at {}",
        context.connection.as_str()
    )
}

/// Just enough of a host to dispatch one invocation
#[derive(Default)]
struct DemoHost {
    rules: Vec<Arc<dyn BindingRule>>,
    filters: Vec<Arc<dyn InvocationFilter>>,
}

impl HostPipeline for DemoHost {
    fn add_binding_rule(&mut self, rule: Arc<dyn BindingRule>) {
        self.rules.push(rule);
    }

    fn add_invocation_filter(&mut self, filter: Arc<dyn InvocationFilter>) {
        self.filters.push(filter);
    }
}

impl DemoHost {
    fn dispatch(&self) -> Result<String, BindingError> {
        let id = InvocationId::new();
        for filter in &self.filters {
            filter.on_executing(id);
        }
        let result = self.run(id);
        for filter in &self.filters {
            let cleaned = match result {
                Ok(_) => filter.on_executed(id),
                Err(_) => filter.on_exception(id),
            };
            if let Err(err) = cleaned {
                tracing::error!("{err}");
            }
        }
        result
    }

    fn run(&self, id: InvocationId) -> Result<String, BindingError> {
        let Some(rule) = self.rules.iter().find(|rule| rule.marker() == INJECT_MARKER) else {
            return Err(BindingError::Unregistered {
                service: "inject binding rule",
            });
        };
        let context = rule
            .bind(id, &BindingDescriptor::of::<BlogContext>())?
            .downcast::<BlogContext>()
            .map_err(|value| BindingError::TypeMismatch {
                service: value.service(),
            })?;
        Ok(insert_db_record(&context))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let database = Arc::new(Database::default());
    let shared = Arc::clone(&database);
    let extension = InjectExtension::from_env(ExtensionConfig::default(), move |services| {
        services.add_scoped_disposable(move |r| {
            let connection = r.resolve::<ConnectionString>()?;
            Ok(BlogContext::new(connection, Arc::clone(&shared)))
        });
    })?;

    let mut host = DemoHost::default();
    extension.register(&mut host);

    for _ in 0..3 {
        println!("{}", host.dispatch()?);
    }
    for post in database.posts.lock().unwrap().iter() {
        println!("{:>3} {}", post.id, post.title);
    }
    Ok(())
}
