//! Engine: startup wiring and shutdown
//!
//! The engine assembles the runtime context (route table, liveness
//! tracker, registry, trust store, network snapshot, interfaces), binds
//! the QUIC endpoint, and spawns every long-lived task: dispatchers, the
//! liveness sweeper, the admin socket, the accept loop, and one dialer
//! per configured peer. Shutdown disconnects every session and closes
//! the endpoint.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, error, info};

use vibepn_crypto::{server_config, NodeIdentity, PeerId, TrustStore};
use vibepn_net::iface::PacketInterface;
use vibepn_net::transport;

use crate::config::{Config, NetworkConfig, PeerConfig};
use crate::error::CoreResult;
use crate::liveness::{LivenessTracker, DEFAULT_TIMEOUT};
use crate::metrics::{counters, CounterSink, NoopSink};
use crate::registry::{close, ConnectionHooks, Registry, Session};
use crate::routes::RouteTable;
use crate::{admin, forward, session};

/// Shared runtime state handed to every subsystem.
pub struct Context {
    /// This node's identity
    pub identity: Arc<NodeIdentity>,
    /// Path the admin `reload` command re-reads
    pub config_path: PathBuf,
    /// Configured peers; fixed for the life of the process
    pub peers: Vec<PeerConfig>,
    /// Local interfaces by network name; fixed for the life of the process
    pub interfaces: HashMap<String, Arc<dyn PacketInterface>>,
    /// Admin socket path
    pub admin_socket: PathBuf,
    pub routes: Arc<RouteTable>,
    pub liveness: Arc<LivenessTracker>,
    pub registry: Arc<Registry>,
    pub trust: Arc<TrustStore>,
    pub counters: Arc<dyn CounterSink>,
    networks: RwLock<HashMap<String, NetworkConfig>>,
    started_at: Instant,
    shutdown_flag: AtomicBool,
    shutdown_notify: Notify,
}

impl Context {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<NodeIdentity>,
        config: &Config,
        config_path: PathBuf,
        interfaces: HashMap<String, Arc<dyn PacketInterface>>,
        routes: Arc<RouteTable>,
        liveness: Arc<LivenessTracker>,
        registry: Arc<Registry>,
        trust: Arc<TrustStore>,
        counters: Arc<dyn CounterSink>,
    ) -> Self {
        Self {
            identity,
            config_path,
            peers: config.peers.clone(),
            interfaces,
            admin_socket: config.daemon.admin_socket.clone(),
            routes,
            liveness,
            registry,
            trust,
            counters,
            networks: RwLock::new(config.networks.clone()),
            started_at: Instant::now(),
            shutdown_flag: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        }
    }

    /// Snapshot of the current network configuration.
    pub fn networks(&self) -> HashMap<String, NetworkConfig> {
        self.networks.read().unwrap().clone()
    }

    /// Replace the network snapshot wholesale (admin reload).
    pub fn replace_networks(&self, networks: HashMap<String, NetworkConfig>) {
        *self.networks.write().unwrap() = networks;
    }

    /// Time since the engine came up.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Request process shutdown.
    pub fn trigger_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }

    /// Wait until shutdown has been requested.
    pub async fn shutdown_requested(&self) {
        loop {
            let notified = self.shutdown_notify.notified();
            if self.shutdown_flag.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// Registry hooks: the supervisor's connect/disconnect policy. Routes
/// follow peer connectivity — a peer's routes are dropped no later than
/// its removal from the registry.
struct EngineHooks {
    routes: Arc<RouteTable>,
    counters: Arc<dyn CounterSink>,
}

impl ConnectionHooks for EngineHooks {
    fn on_connect(&self, peer: &PeerId, session: &Session) {
        debug!(peer = %peer, remote = %session.remote_address(), "peer connected");
        self.counters.incr(counters::SESSIONS_OPENED);
    }

    fn on_disconnect(&self, peer: &PeerId) {
        debug!(peer = %peer, "peer disconnected, dropping its routes");
        self.routes.remove_by_peer(peer);
        self.counters.incr(counters::SESSIONS_CLOSED);
    }
}

/// Builder for [`Engine`].
///
/// Interfaces may be injected per network (tests, embedders); networks
/// without an injected interface get a TUN device where the platform
/// supports one.
pub struct EngineBuilder {
    config: Config,
    config_path: PathBuf,
    interfaces: HashMap<String, Arc<dyn PacketInterface>>,
    trust: Option<Arc<TrustStore>>,
    counters: Arc<dyn CounterSink>,
}

impl EngineBuilder {
    pub fn new(config: Config, config_path: impl Into<PathBuf>) -> Self {
        Self {
            config,
            config_path: config_path.into(),
            interfaces: HashMap::new(),
            trust: None,
            counters: Arc::new(NoopSink),
        }
    }

    /// Use `iface` for the named network instead of a TUN device.
    pub fn interface(mut self, network: &str, iface: Arc<dyn PacketInterface>) -> Self {
        self.interfaces.insert(network.to_string(), iface);
        self
    }

    /// Use an explicit trust store instead of the default location.
    pub fn trust_store(mut self, trust: Arc<TrustStore>) -> Self {
        self.trust = Some(trust);
        self
    }

    /// Emit counters through `sink`.
    pub fn counters(mut self, sink: Arc<dyn CounterSink>) -> Self {
        self.counters = sink;
        self
    }

    /// Validate, wire everything up, and start the daemon tasks.
    pub async fn start(self) -> CoreResult<Engine> {
        let EngineBuilder {
            config,
            config_path,
            mut interfaces,
            trust,
            counters: sink,
        } = self;

        config.validate()?;

        let identity = Arc::new(NodeIdentity::load(
            &config.identity.cert,
            &config.identity.key,
            config.identity.fingerprint.as_deref(),
        )?);
        info!(fingerprint = %identity.peer_id(), "identity loaded");

        let trust = match trust {
            Some(store) => store,
            None => Arc::new(TrustStore::open_default()?),
        };

        let routes = Arc::new(RouteTable::new());
        let liveness = Arc::new(LivenessTracker::new(DEFAULT_TIMEOUT));
        let registry = Arc::new(Registry::new());
        registry.set_hooks(Arc::new(EngineHooks {
            routes: routes.clone(),
            counters: sink.clone(),
        }));

        attach_interfaces(&config, &identity, &mut interfaces);

        let ctx = Arc::new(Context::new(
            identity.clone(),
            &config,
            config_path,
            interfaces,
            routes.clone(),
            liveness.clone(),
            registry,
            trust,
            sink,
        ));

        for (network, iface) in &ctx.interfaces {
            forward::spawn_dispatcher(ctx.clone(), network.clone(), iface.clone());
        }

        liveness.spawn_sweeper(routes);
        admin::spawn(ctx.clone())?;

        let endpoint = transport::bind(config.daemon.listen, server_config(&identity)?)?;
        info!(listen = %endpoint.local_addr()?, "listening for sessions");

        tokio::spawn(session::accept_loop(ctx.clone(), endpoint.clone()));
        session::spawn_dialers(&ctx, &endpoint);

        Ok(Engine { ctx, endpoint })
    }
}

/// Create interfaces for networks that were not injected.
fn attach_interfaces(
    config: &Config,
    identity: &NodeIdentity,
    interfaces: &mut HashMap<String, Arc<dyn PacketInterface>>,
) {
    for (name, network) in &config.networks {
        if interfaces.contains_key(name) {
            continue;
        }

        #[cfg(target_os = "linux")]
        {
            use crate::config::{netmask, resolve_address};
            use crate::routes::IpNet;
            use vibepn_net::tun::{device_name, TunInterface};

            let address = match resolve_address(name, identity.peer_id().as_str(), network) {
                Ok(addr) => addr,
                Err(e) => {
                    error!(network = %name, error = %e, "skipping network");
                    continue;
                }
            };
            let prefix_len = IpNet::parse(&network.prefix)
                .map(|net| net.prefix_len())
                .unwrap_or(24);
            let device = device_name(identity.peer_id().as_str());

            match TunInterface::open(&device, address, netmask(prefix_len), 1420) {
                Ok(iface) => {
                    info!(network = %name, device = %device, %address, "network attached");
                    interfaces.insert(name.clone(), Arc::new(iface));
                }
                Err(e) => {
                    error!(network = %name, error = %e, "failed to open TUN device, skipping network");
                }
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            let _ = (network, identity);
            error!(network = %name, "no TUN support on this platform and no interface injected, skipping");
        }
    }
}

/// A running VibePN node.
pub struct Engine {
    ctx: Arc<Context>,
    endpoint: quinn::Endpoint,
}

impl Engine {
    /// The shared runtime context.
    pub fn context(&self) -> Arc<Context> {
        self.ctx.clone()
    }

    /// The bound transport address.
    pub fn local_addr(&self) -> CoreResult<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Wait until shutdown is requested (signal handler or admin goodbye).
    pub async fn wait_for_shutdown(&self) {
        self.ctx.shutdown_requested().await;
    }

    /// Disconnect every peer and close the endpoint.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.ctx.registry.disconnect_all().await;
        self.endpoint.close(close::SHUTDOWN, b"shutdown");
        self.ctx.trigger_shutdown();
    }
}
