//! Process-wide PLC registry: one instance per `family/gateway/path` key,
//! reference counted, constructed through a family-specific constructor that
//! assembles the layer chain.

use crate::options::{
    parse_gateway, DEFAULT_BUFFER_SIZE, DEFAULT_IDLE_TIMEOUT_MS, MAX_IDLE_TIMEOUT_MS, PlcOptions,
};
use crate::plc::Plc;
use crate::runtime::{
    Clock, SystemClock, Timer, TokioTimer, TokioTransportFactory, TransportFactory,
};
use crate::stack::LayerStack;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use plcmux_sdk::{DriverError, DriverResult, Layer, RequestClient};
use std::any::Any;
use std::sync::Arc;

static REGISTRY: Lazy<DashMap<String, Arc<Plc>>> = Lazy::new(DashMap::new);

/// Reset the process-wide registry. Call once at startup.
pub fn module_init() {
    tracing::debug!("PLC registry initialized");
    REGISTRY.clear();
}

/// Tear the registry down. PLCs still referenced at this point are a caller
/// bug; their handles keep working but a warning is logged.
pub fn module_teardown() {
    if !REGISTRY.is_empty() {
        tracing::warn!(remaining = REGISTRY.len(), "PLC registry not empty at teardown");
    }
    REGISTRY.clear();
}

/// Construction-time view of a PLC, handed to the family constructor. The
/// constructor declares the layer chain, the default port, and optionally a
/// buffer size, model context, or collaborator overrides (the latter is how
/// the test suite injects its deterministic doubles).
pub struct PlcConfigurator {
    layers: Vec<Option<Box<dyn Layer>>>,
    default_port: u16,
    buffer_size: usize,
    context: Option<Box<dyn Any + Send>>,
    clock: Option<Arc<dyn Clock>>,
    timer: Option<Arc<dyn Timer>>,
    transport_factory: Option<Arc<dyn TransportFactory>>,
}

impl PlcConfigurator {
    fn new() -> Self {
        Self {
            layers: Vec::new(),
            default_port: 0,
            buffer_size: DEFAULT_BUFFER_SIZE,
            context: None,
            clock: None,
            timer: None,
            transport_factory: None,
        }
    }

    /// Declare how many layers the chain will have; slots are filled with
    /// [`PlcConfigurator::set_layer`].
    pub fn set_layer_count(&mut self, count: usize) {
        self.layers.resize_with(count, || None);
    }

    /// Install a layer; index 0 is the outermost (link-level) wrapper.
    pub fn set_layer(&mut self, index: usize, layer: Box<dyn Layer>) -> DriverResult<()> {
        let capacity = self.layers.len();
        let Some(slot) = self.layers.get_mut(index) else {
            return Err(DriverError::OutOfBounds {
                offset: index,
                capacity,
            });
        };
        *slot = Some(layer);
        Ok(())
    }

    /// Port used when the gateway string does not carry one.
    pub fn set_default_port(&mut self, port: u16) {
        self.default_port = port;
    }

    pub fn set_buffer_size(&mut self, size: usize) {
        self.buffer_size = size.max(1);
    }

    pub fn set_context(&mut self, context: Box<dyn Any + Send>) {
        self.context = Some(context);
    }

    pub fn set_clock(&mut self, clock: Arc<dyn Clock>) {
        self.clock = Some(clock);
    }

    pub fn set_timer(&mut self, timer: Arc<dyn Timer>) {
        self.timer = Some(timer);
    }

    pub fn set_transport_factory(&mut self, factory: Arc<dyn TransportFactory>) {
        self.transport_factory = Some(factory);
    }

    fn finish_layers(layers: Vec<Option<Box<dyn Layer>>>) -> DriverResult<Vec<Box<dyn Layer>>> {
        let capacity = layers.len();
        let mut chain = Vec::with_capacity(capacity);
        for (index, slot) in layers.into_iter().enumerate() {
            match slot {
                Some(layer) => chain.push(layer),
                None => {
                    return Err(DriverError::OutOfBounds {
                        offset: index,
                        capacity,
                    })
                }
            }
        }
        Ok(chain)
    }
}

/// Intern a PLC: return a new reference to the existing instance for this
/// `family/gateway/path`, or build one by running the family `constructor`.
pub fn get(
    family: &str,
    options: &PlcOptions,
    constructor: impl FnOnce(&mut PlcConfigurator, &PlcOptions) -> DriverResult<()>,
) -> DriverResult<PlcHandle> {
    if options.gateway.trim().is_empty() {
        return Err(DriverError::BadGateway(
            "gateway host missing or zero length".into(),
        ));
    }

    // lookup is case-insensitive
    let key = format!("{}/{}/{}", family, options.gateway, options.path).to_ascii_lowercase();

    match REGISTRY.entry(key.clone()) {
        Entry::Occupied(mut occupied) => {
            if occupied.get().try_add_ref() {
                tracing::debug!(key = %key, "reusing existing PLC");
                return Ok(PlcHandle {
                    plc: Arc::clone(occupied.get()),
                });
            }
            // the previous instance is mid-destroy; replace it
            let plc = create_plc(key, options, constructor)?;
            occupied.insert(Arc::clone(&plc));
            Ok(PlcHandle { plc })
        }
        Entry::Vacant(vacant) => {
            let plc = create_plc(key, options, constructor)?;
            vacant.insert(Arc::clone(&plc));
            Ok(PlcHandle { plc })
        }
    }
}

fn create_plc(
    key: String,
    options: &PlcOptions,
    constructor: impl FnOnce(&mut PlcConfigurator, &PlcOptions) -> DriverResult<()>,
) -> DriverResult<Arc<Plc>> {
    tracing::info!(key = %key, "creating PLC");

    let mut configurator = PlcConfigurator::new();
    constructor(&mut configurator, options)?;

    // the constructor ran first so it could choose the default port
    let (host, port) = parse_gateway(&options.gateway, configurator.default_port)?;

    let idle_timeout_ms = options.idle_timeout_ms.unwrap_or(DEFAULT_IDLE_TIMEOUT_MS);
    if idle_timeout_ms > MAX_IDLE_TIMEOUT_MS {
        return Err(DriverError::OutOfBounds {
            offset: idle_timeout_ms as usize,
            capacity: MAX_IDLE_TIMEOUT_MS as usize,
        });
    }

    let layers = LayerStack::new(PlcConfigurator::finish_layers(configurator.layers)?);

    let clock: Arc<dyn Clock> = match configurator.clock {
        Some(clock) => clock,
        None => Arc::new(SystemClock),
    };
    let timer: Arc<dyn Timer> = match configurator.timer {
        Some(timer) => timer,
        None => Arc::new(TokioTimer::new()?),
    };
    let transport_factory: Arc<dyn TransportFactory> = match configurator.transport_factory {
        Some(factory) => factory,
        None => Arc::new(TokioTransportFactory::new()?),
    };

    let plc = Arc::new(Plc::new(
        key,
        host,
        port,
        layers,
        configurator.buffer_size,
        idle_timeout_ms,
        configurator.context,
        clock,
        timer,
        transport_factory,
    ));

    Plc::start_heartbeat(&plc);

    Ok(plc)
}

fn release(plc: &Arc<Plc>) {
    if plc.drop_ref() != 1 {
        return;
    }
    // last reference: unpublish (a racing `get` can no longer revive the
    // zero-count instance) and tear down
    REGISTRY.remove_if(plc.key(), |_, value| Arc::ptr_eq(value, plc));
    Plc::destroy(plc);
}

/// A counted reference to an interned PLC. Cloning bumps the count;
/// dropping the last handle disconnects and destroys the instance.
pub struct PlcHandle {
    plc: Arc<Plc>,
}

impl PlcHandle {
    /// The interning key, `family/gateway/path`.
    pub fn key(&self) -> &str {
        self.plc.key()
    }

    /// Hard reset of the connection state.
    pub fn initialize(&self) {
        self.plc.initialize();
    }

    /// Queue a request. Fails with [`DriverError::Busy`] when the same
    /// client object is already queued.
    pub fn start_request(&self, client: Arc<dyn RequestClient>) -> DriverResult<()> {
        Plc::start_request(&self.plc, client)
    }

    /// Remove a queued request. Fails with [`DriverError::NotFound`] when it
    /// is not queued; a request whose frame already went out is delivered to
    /// nobody (the response is dropped on id mismatch).
    pub fn stop_request(&self, client: &Arc<dyn RequestClient>) -> DriverResult<()> {
        self.plc.stop_request(client)
    }

    pub fn idle_timeout_ms(&self) -> u32 {
        self.plc.idle_timeout_ms()
    }

    /// Set the idle disconnect timeout (0..=5000 ms), returning the previous
    /// value.
    pub fn set_idle_timeout_ms(&self, timeout_ms: u32) -> DriverResult<u32> {
        self.plc.set_idle_timeout_ms(timeout_ms)
    }

    pub fn buffer_size(&self) -> usize {
        self.plc.buffer_size()
    }

    /// Grow the frame buffer. Shrinking is not supported; smaller values
    /// are ignored.
    pub fn set_buffer_size(&self, size: usize) -> DriverResult<()> {
        self.plc.set_buffer_size(size)
    }

    pub fn set_context(&self, context: Box<dyn Any + Send>) {
        self.plc.set_context(context);
    }

    pub fn take_context(&self) -> Option<Box<dyn Any + Send>> {
        self.plc.take_context()
    }

    pub fn with_context<R>(&self, f: impl FnOnce(Option<&mut (dyn Any + Send)>) -> R) -> R {
        self.plc.with_context(f)
    }

    pub fn is_connected(&self) -> bool {
        self.plc.is_connected()
    }
}

impl Clone for PlcHandle {
    fn clone(&self) -> Self {
        self.plc.add_ref();
        Self {
            plc: Arc::clone(&self.plc),
        }
    }
}

impl Drop for PlcHandle {
    fn drop(&mut self) {
        release(&self.plc);
    }
}

impl std::fmt::Debug for PlcHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlcHandle").field("key", &self.key()).finish()
    }
}
