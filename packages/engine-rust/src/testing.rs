//! Sources, functions and floors shared by the engine's tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use officefloor_core::{
    CollectedIssues, Escalation, FunctionDescriptor, OfficeDescriptor, ParameterType, Value,
};
use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::execute::{EngineRuntime, ProcessState};
use crate::floor::OfficeFloor;
use crate::function::FunctionType;
use crate::governance::{extension_as, Governance, GovernanceSource};
use crate::managed_object::{
    AsynchronousContext, AsynchronousManagedObject, CoordinatingManagedObject, ManagedObject,
    ManagedObjectSource, ManagedObjectSourceMetaData, ObjectRef, ObjectRegistry,
    PlainManagedObject, RecycleParameter, SourceContext,
};
use crate::monitor::MonitorClock;
use crate::office::{OfficeLoader, OfficeMetaData, SourceRegistry};

/// Ordered record of what happened, shared between fixtures and assertions.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == entry)
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().iter().filter(|e| *e == entry).count()
    }
}

// ---------------------------------------------------------------------------
// Object types
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct Ledger {
    entries: Mutex<Vec<String>>,
}

impl Ledger {
    pub fn record(&self, entry: &str) {
        self.entries.lock().push(entry.to_string());
    }
}

/// Coordinates on a [`Ledger`].
#[derive(Default)]
pub struct Connection {
    ledger: OnceLock<Arc<Ledger>>,
}

impl Connection {
    pub fn ledger(&self) -> Option<&Arc<Ledger>> {
        self.ledger.get()
    }
}

pub struct Peer;

pub struct Endpoint(pub String);

/// Object governed through its `transaction` extension.
pub struct Account {
    pub name: String,
}

/// Extension a `transaction` governance works with.
pub struct Transactional {
    pub account: String,
}

/// Placeholder for an object whose asynchronous operation is pending.
pub struct Door;

// ---------------------------------------------------------------------------
// Managed object sources
// ---------------------------------------------------------------------------

struct LedgerSource;

impl ManagedObjectSource for LedgerSource {
    fn init(&mut self, _context: &SourceContext) -> anyhow::Result<ManagedObjectSourceMetaData> {
        Ok(ManagedObjectSourceMetaData::new::<Ledger>())
    }

    fn source(&self) -> Result<Box<dyn ManagedObject>, Escalation> {
        Ok(Box::new(PlainManagedObject::new(Ledger::default())))
    }
}

struct ConnectionSource;

struct ConnectionObject {
    connection: Arc<Connection>,
}

impl ManagedObject for ConnectionObject {
    fn object(&self) -> ObjectRef {
        Arc::clone(&self.connection) as ObjectRef
    }

    fn coordinating(&mut self) -> Option<&mut dyn CoordinatingManagedObject> {
        Some(self)
    }
}

impl CoordinatingManagedObject for ConnectionObject {
    fn load_objects(&mut self, registry: &ObjectRegistry) -> Result<(), Escalation> {
        let ledger = registry.get::<Ledger>("ledger")?;
        let _ = self.connection.ledger.set(ledger);
        Ok(())
    }
}

impl ManagedObjectSource for ConnectionSource {
    fn init(&mut self, _context: &SourceContext) -> anyhow::Result<ManagedObjectSourceMetaData> {
        Ok(ManagedObjectSourceMetaData::new::<Connection>().dependency::<Ledger>("ledger"))
    }

    fn source(&self) -> Result<Box<dyn ManagedObject>, Escalation> {
        Ok(Box::new(ConnectionObject {
            connection: Arc::new(Connection::default()),
        }))
    }
}

struct PeerSource;

impl ManagedObjectSource for PeerSource {
    fn init(&mut self, _context: &SourceContext) -> anyhow::Result<ManagedObjectSourceMetaData> {
        Ok(ManagedObjectSourceMetaData::new::<Peer>().dependency::<Peer>("peer"))
    }

    fn source(&self) -> Result<Box<dyn ManagedObject>, Escalation> {
        Ok(Box::new(PlainManagedObject::new(Peer)))
    }
}

#[derive(Default)]
struct EndpointSource {
    url: String,
}

impl ManagedObjectSource for EndpointSource {
    fn specification(&self) -> &[&'static str] {
        &["url"]
    }

    fn init(&mut self, context: &SourceContext) -> anyhow::Result<ManagedObjectSourceMetaData> {
        self.url = context.property("url")?.to_string();
        Ok(ManagedObjectSourceMetaData::new::<Endpoint>())
    }

    fn source(&self) -> Result<Box<dyn ManagedObject>, Escalation> {
        Ok(Box::new(PlainManagedObject::new(Endpoint(self.url.clone()))))
    }
}

/// Recyclable [`Account`] source journaling `recycle:<name>`. Not safe for
/// concurrent access unless `concurrent` is set.
pub struct AccountSource {
    pub journal: Journal,
    pub recycled: Arc<AtomicUsize>,
    pub concurrent: bool,
}

struct AccountObject {
    account: Arc<Account>,
}

impl ManagedObject for AccountObject {
    fn object(&self) -> ObjectRef {
        Arc::clone(&self.account) as ObjectRef
    }

    fn extension(&self, name: &str) -> Option<ObjectRef> {
        (name == "transaction").then(|| {
            Arc::new(Transactional {
                account: self.account.name.clone(),
            }) as ObjectRef
        })
    }
}

impl ManagedObjectSource for AccountSource {
    fn init(&mut self, _context: &SourceContext) -> anyhow::Result<ManagedObjectSourceMetaData> {
        let meta = ManagedObjectSourceMetaData::new::<Account>()
            .recyclable()
            .extension("transaction");
        Ok(if self.concurrent { meta.concurrent() } else { meta })
    }

    fn source(&self) -> Result<Box<dyn ManagedObject>, Escalation> {
        Ok(Box::new(AccountObject {
            account: Arc::new(Account {
                name: "account".to_string(),
            }),
        }))
    }

    fn recycle(&self, parameter: &mut RecycleParameter) -> Result<(), Escalation> {
        self.recycled.fetch_add(1, Ordering::SeqCst);
        if let Some(account) = parameter.object::<Account>() {
            self.journal.record(format!("recycle:{}", account.name));
        }
        Ok(())
    }
}

/// Asynchronous [`Door`] source. Every instance starts an operation when it
/// receives its context and hands the context out through `pending`.
pub struct DoorSource {
    pub pending: Arc<Mutex<Vec<AsynchronousContext>>>,
    pub timeout_ms: Option<u64>,
}

struct DoorObject {
    door: Arc<Door>,
    pending: Arc<Mutex<Vec<AsynchronousContext>>>,
}

impl ManagedObject for DoorObject {
    fn object(&self) -> ObjectRef {
        Arc::clone(&self.door) as ObjectRef
    }

    fn asynchronous(&mut self) -> Option<&mut dyn AsynchronousManagedObject> {
        Some(self)
    }
}

impl AsynchronousManagedObject for DoorObject {
    fn set_asynchronous_context(&mut self, context: AsynchronousContext) {
        context.start_operation();
        self.pending.lock().push(context);
    }
}

impl ManagedObjectSource for DoorSource {
    fn init(&mut self, _context: &SourceContext) -> anyhow::Result<ManagedObjectSourceMetaData> {
        let meta = ManagedObjectSourceMetaData::new::<Door>().asynchronous();
        Ok(match self.timeout_ms {
            Some(timeout_ms) => meta.asynchronous_timeout(timeout_ms),
            None => meta,
        })
    }

    fn source(&self) -> Result<Box<dyn ManagedObject>, Escalation> {
        Ok(Box::new(DoorObject {
            door: Arc::new(Door),
            pending: Arc::clone(&self.pending),
        }))
    }
}

// ---------------------------------------------------------------------------
// Governance
// ---------------------------------------------------------------------------

/// Journals `govern:<account>`, `enforce` and `disregard`.
#[derive(Default)]
pub struct TransactionSource {
    pub journal: Journal,
}

struct Transaction {
    journal: Journal,
}

impl Governance for Transaction {
    fn govern(&mut self, extension: ObjectRef, _object: &str) -> Result<(), Escalation> {
        let transactional = extension_as::<Transactional>(&extension)
            .ok_or_else(|| Escalation::msg("not transactional"))?;
        self.journal
            .record(format!("govern:{}", transactional.account));
        Ok(())
    }

    fn enforce(&mut self) -> Result<(), Escalation> {
        self.journal.record("enforce");
        Ok(())
    }

    fn disregard(&mut self) -> Result<(), Escalation> {
        self.journal.record("disregard");
        Ok(())
    }
}

impl GovernanceSource for TransactionSource {
    fn create(&self) -> Box<dyn Governance> {
        Box::new(Transaction {
            journal: self.journal.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Registries and floors
// ---------------------------------------------------------------------------

/// Registry with the sources the loader tests configure.
pub fn registry() -> SourceRegistry {
    let registry = SourceRegistry::new();
    registry.register_function(
        "record",
        FunctionType::new(|context| {
            let connection = context.object::<Connection>(0)?;
            if let Some(ledger) = connection.ledger() {
                ledger.record("record");
            }
            context.do_flow(0, None)?;
            Ok(None)
        })
        .object::<Connection>("connection")
        .flow("audit"),
    );
    registry.register_function("noop", FunctionType::new(|_| Ok(None)));
    registry.register_managed_object_source("ledger", || LedgerSource);
    registry.register_managed_object_source("connection", || ConnectionSource);
    registry.register_managed_object_source("cyclic", || PeerSource);
    registry.register_managed_object_source("configured", EndpointSource::default);
    registry.register_governance_source("transaction", TransactionSource::default);
    registry
}

/// Registers the asynchronous `door` source. Contexts of doors waiting for
/// their operation are pushed to the returned list.
pub fn register_door(
    registry: &SourceRegistry,
    timeout_ms: Option<u64>,
) -> Arc<Mutex<Vec<AsynchronousContext>>> {
    let pending = Arc::new(Mutex::new(Vec::new()));
    let shared = Arc::clone(&pending);
    registry.register_managed_object_source("door", move || DoorSource {
        pending: Arc::clone(&shared),
        timeout_ms,
    });
    pending
}

/// Registers a function type that journals its own name and returns
/// `None`.
pub fn register_step(registry: &SourceRegistry, name: &str, journal: &Journal) {
    let journal = journal.clone();
    let entry = name.to_string();
    registry.register_function(
        name,
        FunctionType::new(move |_| {
            journal.record(entry.clone());
            Ok(None)
        }),
    );
}

/// Floor with one passive office `counter`: `add` adds its integer
/// parameter to the returned total, `report` does nothing.
pub fn open_counter_floor() -> (OfficeFloor, Arc<Mutex<i64>>) {
    let total = Arc::new(Mutex::new(0));
    let registry = SourceRegistry::new();
    let sum = Arc::clone(&total);
    registry.register_function(
        "add",
        FunctionType::new(move |context| {
            let amount = context.parameter().and_then(Value::as_int).unwrap_or(0);
            *sum.lock() += amount;
            Ok(None)
        })
        .parameter(ParameterType::Int),
    );
    registry.register_function("noop", FunctionType::new(|_| Ok(None)));

    let office = OfficeDescriptor::new("counter")
        .function(FunctionDescriptor::new("add", "add"))
        .function(FunctionDescriptor::new("report", "noop"));
    let floor = OfficeFloor::open(test_config(), &[office], &registry).unwrap();
    (floor, total)
}

/// Engine configuration with a fast monitor and short close timeout.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        monitor_interval_ms: 5,
        close_timeout_ms: 2_000,
        thread_name_prefix: "test".to_string(),
        ..EngineConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Processes without a floor
// ---------------------------------------------------------------------------

/// An office loaded onto a runtime that accepts processes. No team is
/// started, so its functions run on the implicit passive team inline with
/// the caller.
pub(crate) struct PassiveOffice {
    pub runtime: Arc<EngineRuntime>,
    pub office: Arc<OfficeMetaData>,
}

impl PassiveOffice {
    pub fn load(registry: &SourceRegistry, descriptor: &OfficeDescriptor) -> Self {
        let config = test_config();
        let clock = MonitorClock::new();
        let issues = CollectedIssues::new();
        let office = OfficeLoader::new(registry, &config, &clock, &issues).load(descriptor);
        assert!(issues.is_empty(), "office failed to load");
        let runtime = Arc::new(EngineRuntime::new(config, clock));
        runtime.shutdown.set_open();
        Self {
            runtime,
            office: Arc::new(office.unwrap()),
        }
    }

    pub fn function(&self, name: &str) -> usize {
        self.office.function_index(name).unwrap()
    }

    /// Starts a process on `function`, running it until it parks or ends.
    pub fn start(&self, function: &str) -> Arc<ProcessState> {
        ProcessState::start(
            &self.runtime,
            &self.office,
            self.function(function),
            None,
            None,
            self.runtime.shutdown.begin_process().unwrap(),
        )
    }
}
