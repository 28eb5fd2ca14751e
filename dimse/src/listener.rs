//! Accepting associations on a TCP port.
//!
//! A [`Listener`] accepts TCP connections
//! and runs an acceptor association on each one,
//! in a thread of its own,
//! until the association is released or aborted.
//! The number of associations running at once can be capped,
//! in which case further association requests are rejected.
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use snafu::{Backtrace, ResultExt, Snafu};
use tracing::{debug, error, info, warn};

use crate::association::server::{AcceptAny, AccessControl, ServerAssociationOptions};
use crate::pdu::{
    AssociationRJ, AssociationRJResult, AssociationRJServiceProviderPresentationReason,
    AssociationRJSource,
};
use crate::service::ServiceRegistry;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not bind the listening socket
    Bind {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not retrieve the local address
    LocalAddr {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not accept a connection
    Accept {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not spawn listener thread
    SpawnThread {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// the listener thread panicked
    ListenerPanicked { backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Options for a [`Listener`].
#[derive(Debug, Clone)]
pub struct ListenerOptions<A> {
    association: ServerAssociationOptions<'static, A>,
    max_associations: usize,
}

impl Default for ListenerOptions<AcceptAny> {
    fn default() -> Self {
        ListenerOptions {
            association: ServerAssociationOptions::new(),
            max_associations: 0,
        }
    }
}

impl ListenerOptions<AcceptAny> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<A> ListenerOptions<A>
where
    A: AccessControl,
{
    /// Negotiate each association with these options.
    pub fn association_options<P>(
        self,
        association: ServerAssociationOptions<'static, P>,
    ) -> ListenerOptions<P>
    where
        P: AccessControl,
    {
        ListenerOptions {
            association,
            max_associations: self.max_associations,
        }
    }

    /// Cap the number of associations running at once (0 for unlimited).
    pub fn max_associations(mut self, max: usize) -> Self {
        self.max_associations = max;
        self
    }

    /// Set how often each association checks
    /// for overdue responses and idleness.
    pub fn idle_check_period(mut self, period: Duration) -> Self {
        let session = self
            .association
            .get_session_options()
            .clone()
            .idle_check_period(period);
        self.association = self.association.session_options(session);
        self
    }
}

/// Decrements the association count when dropped.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A TCP listener serving DICOM associations.
///
/// # Example
///
/// ```no_run
/// # use std::sync::Arc;
/// # use dicom_dimse::association::server::ServerAssociationOptions;
/// # use dicom_dimse::listener::{Listener, ListenerOptions};
/// # use dicom_dimse::service::{ServiceRegistry, VerificationScp};
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let mut registry = ServiceRegistry::new();
/// registry.register(VerificationScp);
///
/// let options = ListenerOptions::new()
///     .association_options(
///         ServerAssociationOptions::new()
///             .ae_title("ECHO-SCP")
///             .with_abstract_syntax("1.2.840.10008.1.1"),
///     )
///     .max_associations(16);
/// let listener = Listener::bind("0.0.0.0:11111", options, Arc::new(registry))?;
/// listener.run()?;
/// # Ok(())
/// # }
/// ```
pub struct Listener<A> {
    socket: TcpListener,
    options: Arc<ListenerOptions<A>>,
    registry: Arc<ServiceRegistry>,
    active: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl<A> std::fmt::Debug for Listener<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.socket.local_addr().ok())
            .field("active", &self.active.load(Ordering::SeqCst))
            .finish()
    }
}

impl<A> Listener<A>
where
    A: AccessControl + Send + Sync + 'static,
{
    /// Bind a listening socket to the given address.
    pub fn bind<S: ToSocketAddrs>(
        address: S,
        options: ListenerOptions<A>,
        registry: Arc<ServiceRegistry>,
    ) -> Result<Self> {
        let socket = TcpListener::bind(address).context(BindSnafu)?;
        Ok(Listener {
            socket,
            options: Arc::new(options),
            registry,
            active: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context(LocalAddrSnafu)
    }

    /// The number of associations currently running.
    pub fn active_associations(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Accept connections until the listener is shut down.
    pub fn run(&self) -> Result<()> {
        if let Ok(addr) = self.socket.local_addr() {
            info!("Listening on tcp://{}", addr);
        }
        for stream in self.socket.incoming() {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(socket) => self.serve(socket),
                Err(e) => {
                    error!("Could not accept connection: {}", e);
                }
            }
        }
        debug!("Listener stopped");
        Ok(())
    }

    /// Run the listener on a thread of its own.
    pub fn spawn(self) -> Result<ListenerHandle> {
        let local_addr = self.local_addr()?;
        let shutdown = Arc::clone(&self.shutdown);
        let active = Arc::clone(&self.active);
        let thread = thread::Builder::new()
            .name("dicom-listener".to_string())
            .spawn(move || self.run())
            .context(SpawnThreadSnafu)?;
        Ok(ListenerHandle {
            local_addr,
            shutdown,
            active,
            thread,
        })
    }

    fn serve(&self, socket: TcpStream) {
        let peer = socket.peer_addr().ok();
        let max = self.options.max_associations;
        let admitted = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if max == 0 || n < max {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_ok();

        let options = Arc::clone(&self.options);
        let spawned = if admitted {
            let guard = ActiveGuard(Arc::clone(&self.active));
            let registry = Arc::clone(&self.registry);
            debug!("Accepted connection from {:?}", peer);
            thread::Builder::new()
                .name("dicom-acceptor".to_string())
                .spawn(move || {
                    let _guard = guard;
                    match options.association.establish(socket, registry) {
                        Ok(association) => {
                            if let Err(e) = association.wait_for_socket_close() {
                                info!("Association with {:?} ended: {}", peer, e);
                            }
                        }
                        Err(e) => info!("Association with {:?} not established: {}", peer, e),
                    }
                })
        } else {
            warn!(
                "Rejecting association from {:?}: limit of {} associations reached",
                peer, max
            );
            thread::Builder::new()
                .name("dicom-acceptor".to_string())
                .spawn(move || {
                    let association_rj = AssociationRJ {
                        result: AssociationRJResult::Transient,
                        source: AssociationRJSource::ServiceProviderPresentation(
                            AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
                        ),
                    };
                    if let Err(e) = options.association.reject(socket, association_rj) {
                        debug!("Could not reject association: {}", e);
                    }
                })
        };
        if let Err(e) = spawned {
            error!("Could not spawn association thread: {}", e);
        }
    }
}

/// A handle to a listener running on its own thread.
#[derive(Debug)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    thread: JoinHandle<Result<()>>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The number of associations currently running.
    pub fn active_associations(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop accepting connections and wait for the listener thread to end.
    ///
    /// Associations already running are left to finish on their own.
    pub fn shutdown(self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        // wake up the accept loop
        let mut addr = self.local_addr;
        if addr.ip().is_unspecified() {
            addr.set_ip(match addr {
                SocketAddr::V4(_) => std::net::Ipv4Addr::LOCALHOST.into(),
                SocketAddr::V6(_) => std::net::Ipv6Addr::LOCALHOST.into(),
            });
        }
        if let Err(e) = TcpStream::connect(addr) {
            debug!("Could not wake up listener: {}", e);
        }
        match self.thread.join() {
            Ok(outcome) => outcome,
            Err(_) => ListenerPanickedSnafu.fail(),
        }
    }
}
