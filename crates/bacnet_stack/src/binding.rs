//! BACnet/IP stack binding
//!
//! One binding owns one UDP endpoint and a dedicated I/O thread. The thread
//! decodes incoming datagrams, answers Who-Is for the local device, keeps a
//! BBMD foreign-device registration alive and hands responses to the
//! [`Correlator`]'s pending slot.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use socket2::{Domain, Protocol, Socket, Type};

use crate::apdu::{
    self, Apdu, IAm, RequestLimits, WhoIs, confirmed_service, unconfirmed_service,
};
use crate::correlator::{CancelHandle, Correlator, PendingSlot};
use crate::error::{StackError, StackResult};
use crate::frame::{self, BvlcFunction, Frame};
use crate::types::{DEFAULT_PORT, ObjectId, Segmentation};

/// How long the I/O thread blocks in one receive
const RECV_POLL: Duration = Duration::from_millis(50);

/// Consecutive hard receive errors before the I/O thread gives up
const MAX_CONSECUTIVE_IO_ERRORS: u32 = 20;

const MAX_DATAGRAM: usize = 1500;

/// Foreign-device registration with a BBMD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BbmdRegistration {
    pub address: SocketAddr,
    /// Time-to-live in seconds
    pub ttl: u16,
}

/// Parameters of one binding
#[derive(Debug, Clone)]
pub struct BindingConfig {
    pub local_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub port: u16,
    pub object_name: String,
    pub device_instance: u32,
    pub max_apdu_length: u16,
    pub segmentation: Segmentation,
    pub vendor_id: u16,
    pub bbmd: Option<BbmdRegistration>,
    /// Also bind the subnet broadcast address on the same port. Ignored
    /// when the mask leaves no broadcast address distinct from `local_ip`.
    pub listen_broadcast: bool,
    pub request_timeout: Duration,
}

impl BindingConfig {
    pub fn new(local_ip: Ipv4Addr, subnet_mask: Ipv4Addr, port: u16, device_instance: u32) -> Self {
        Self {
            local_ip,
            subnet_mask,
            port,
            object_name: "bacnet-daq".to_string(),
            device_instance,
            max_apdu_length: 1024,
            segmentation: Segmentation::SegmentedBoth,
            vendor_id: 0,
            bbmd: None,
            listen_broadcast: true,
            request_timeout: Duration::from_secs(3),
        }
    }

    /// Subnet broadcast address to listen on, if any
    fn broadcast_listen_ip(&self) -> Option<Ipv4Addr> {
        let broadcast_ip = frame::broadcast_address(self.local_ip, self.subnet_mask);
        Some(broadcast_ip).filter(|ip| self.listen_broadcast && *ip != self.local_ip)
    }

    fn broadcast_target(&self) -> SocketAddr {
        if let Some(bbmd) = self.bbmd {
            return bbmd.address;
        }
        let port = if self.port == 0 { DEFAULT_PORT } else { self.port };
        SocketAddr::V4(SocketAddrV4::new(
            frame::broadcast_address(self.local_ip, self.subnet_mask),
            port,
        ))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared state
// ─────────────────────────────────────────────────────────────────────────────

/// State shared by the binding, its I/O thread and its correlators
pub(crate) struct Shared {
    pub(crate) config: BindingConfig,
    broadcast_target: SocketAddr,
    unicast: Mutex<Option<UdpSocket>>,
    broadcast_port: Mutex<Option<UdpSocket>>,
    running: AtomicBool,
    pub(crate) slot: Mutex<PendingSlot>,
    pub(crate) signal: Condvar,
    /// Held for the whole of one transaction
    pub(crate) transaction: Mutex<()>,
    invoke_id: AtomicU8,
}

impl Shared {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the I/O loop and wake every waiter
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let _slot = self.slot.lock();
        self.signal.notify_all();
    }

    pub(crate) fn next_invoke_id(&self) -> u8 {
        self.invoke_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn limits(&self) -> RequestLimits {
        RequestLimits {
            max_apdu: self.config.max_apdu_length,
            segmentation: self.config.segmentation,
        }
    }

    pub(crate) fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> StackResult<()> {
        let guard = self.unicast.lock();
        let socket = guard.as_ref().ok_or(StackError::Closed)?;
        socket.send_to(datagram, dest)?;
        Ok(())
    }

    /// Broadcast an NPDU locally, or through the BBMD when registered
    pub(crate) fn send_broadcast(&self, npdu: &[u8]) -> StackResult<()> {
        let function = if self.config.bbmd.is_some() {
            BvlcFunction::DistributeBroadcastToNetwork
        } else {
            BvlcFunction::OriginalBroadcastNpdu
        };
        self.send_to(&frame::encode_bvlc(function, npdu), self.broadcast_target)
    }

    fn local_iam(&self) -> IAm {
        IAm {
            device: ObjectId::device(self.config.device_instance),
            max_apdu: self.config.max_apdu_length as u32,
            segmentation: self.config.segmentation,
            vendor_id: self.config.vendor_id,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Binding
// ─────────────────────────────────────────────────────────────────────────────

/// An open BACnet/IP endpoint with its background I/O thread
pub struct StackBinding {
    shared: Arc<Shared>,
    io_thread: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

fn bind_socket(addr: SocketAddr, reuse: bool) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    if reuse {
        socket.set_reuse_address(true)?;
    }
    socket.bind(&addr.into())?;
    socket.set_broadcast(true)?;
    Ok(socket.into())
}

impl StackBinding {
    /// Bind the socket, advertise the local device and start the I/O thread
    pub fn open(config: BindingConfig) -> StackResult<Self> {
        let addr = SocketAddr::V4(SocketAddrV4::new(config.local_ip, config.port));
        let unicast =
            bind_socket(addr, false).map_err(|source| StackError::Bind { addr, source })?;
        let local_addr = unicast.local_addr()?;

        // Devices often answer Who-Is with a broadcast I-Am, which a socket
        // bound to the unicast address never receives
        let broadcast_port = match config.broadcast_listen_ip() {
            Some(broadcast_ip) => {
                let addr = SocketAddr::V4(SocketAddrV4::new(broadcast_ip, local_addr.port()));
                let socket =
                    bind_socket(addr, true).map_err(|source| StackError::Bind { addr, source })?;
                tracing::debug!(%addr, "Listening for broadcasts");
                Some(socket)
            }
            None => None,
        };

        let io_unicast = unicast.try_clone()?;
        io_unicast.set_read_timeout(Some(RECV_POLL))?;
        let io_broadcast = match &broadcast_port {
            Some(socket) => {
                let clone = socket.try_clone()?;
                clone.set_nonblocking(true)?;
                Some(clone)
            }
            None => None,
        };

        let shared = Arc::new(Shared {
            broadcast_target: config.broadcast_target(),
            config,
            unicast: Mutex::new(Some(unicast)),
            broadcast_port: Mutex::new(broadcast_port),
            running: AtomicBool::new(true),
            slot: Mutex::new(PendingSlot::Idle),
            signal: Condvar::new(),
            transaction: Mutex::new(()),
            invoke_id: AtomicU8::new(rand::random()),
        });

        let worker = IoWorker {
            shared: shared.clone(),
            local_addr,
            unicast: io_unicast,
            broadcast: io_broadcast,
        };
        let io_thread = std::thread::Builder::new()
            .name(format!("bacnet-io-{}", local_addr.port()))
            .spawn(move || worker.run());
        let io_thread = match io_thread {
            Ok(handle) => handle,
            Err(e) => {
                shared.stop();
                return Err(StackError::Io(e));
            }
        };

        tracing::info!(
            %local_addr,
            device_instance = shared.config.device_instance,
            object_name = %shared.config.object_name,
            "BACnet/IP binding open"
        );

        Ok(Self {
            shared,
            io_thread: Some(io_thread),
            local_addr,
        })
    }

    pub fn correlator(&self) -> Correlator {
        Correlator::new(self.shared.clone())
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::new(self.shared.clone())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn device_instance(&self) -> u32 {
        self.shared.config.device_instance
    }

    /// Whether the I/O thread is still running
    pub fn is_alive(&self) -> bool {
        self.shared.is_running()
            && self
                .io_thread
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the I/O thread, join it and release the sockets
    ///
    /// Safe to call more than once. The sockets are released even when the
    /// I/O thread did not stop cleanly.
    pub fn close(&mut self) -> StackResult<()> {
        self.shared.stop();

        let mut result = Ok(());
        if let Some(handle) = self.io_thread.take() {
            if handle.join().is_err() {
                tracing::error!(local_addr = %self.local_addr, "BACnet I/O thread panicked");
                result = Err(StackError::Shutdown);
            }
        }

        let unicast = self.shared.unicast.lock().take();
        let broadcast = self.shared.broadcast_port.lock().take();
        match (unicast, broadcast) {
            (Some(_), Some(_)) => {
                tracing::info!(local_addr = %self.local_addr, "Closed unicast and broadcast ports");
            }
            (Some(_), None) => {
                tracing::info!(local_addr = %self.local_addr, "Closed unicast port");
            }
            (None, Some(_)) => {
                tracing::info!(local_addr = %self.local_addr, "Closed broadcast port");
            }
            (None, None) => {}
        }
        result
    }
}

impl Drop for StackBinding {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// I/O thread
// ─────────────────────────────────────────────────────────────────────────────

struct IoWorker {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    unicast: UdpSocket,
    broadcast: Option<UdpSocket>,
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionReset
    )
}

impl IoWorker {
    fn run(self) {
        tracing::debug!("BACnet I/O thread started");

        let mut buffer = [0u8; MAX_DATAGRAM];
        let mut consecutive_errors = 0u32;
        let mut next_registration = Instant::now();

        while self.shared.is_running() {
            if let Some(bbmd) = self.shared.config.bbmd {
                if Instant::now() >= next_registration {
                    self.register_foreign_device(bbmd);
                    let half_ttl = Duration::from_secs((bbmd.ttl / 2).max(1) as u64);
                    next_registration = Instant::now() + half_ttl;
                }
            }

            match self.unicast.recv_from(&mut buffer) {
                Ok((len, src)) => {
                    consecutive_errors = 0;
                    self.handle_datagram(&buffer[..len], src);
                }
                Err(e) if is_transient(&e) => {}
                Err(e) => {
                    consecutive_errors += 1;
                    tracing::warn!(error = %e, "BACnet receive error");
                    if consecutive_errors >= MAX_CONSECUTIVE_IO_ERRORS {
                        tracing::error!("Too many receive errors, stopping BACnet I/O thread");
                        break;
                    }
                }
            }

            if let Some(socket) = &self.broadcast {
                loop {
                    match socket.recv_from(&mut buffer) {
                        Ok((len, src)) => self.handle_datagram(&buffer[..len], src),
                        Err(e) if is_transient(&e) => break,
                        Err(e) => {
                            tracing::debug!(error = %e, "Broadcast port receive error");
                            break;
                        }
                    }
                }
            }
        }

        // Waiters must not outlive the loop that would have completed them
        self.shared.stop();
        tracing::debug!("BACnet I/O thread stopped");
    }

    fn register_foreign_device(&self, bbmd: BbmdRegistration) {
        let datagram = frame::encode_register_foreign_device(bbmd.ttl);
        match self.unicast.send_to(&datagram, bbmd.address) {
            Ok(_) => tracing::debug!(bbmd = %bbmd.address, ttl = bbmd.ttl, "Registered as foreign device"),
            Err(e) => tracing::warn!(bbmd = %bbmd.address, error = %e, "Foreign device registration failed"),
        }
    }

    fn handle_datagram(&self, data: &[u8], src: SocketAddr) {
        if let Err(e) = self.dispatch(data, src) {
            tracing::debug!(%src, error = %e, kind = ?e.kind(), "Dropped incoming datagram");
        }
    }

    fn dispatch(&self, data: &[u8], src: SocketAddr) -> StackResult<()> {
        // Our own broadcasts loop back
        if src == self.local_addr {
            return Ok(());
        }

        let (origin, npdu) = match frame::decode_bvlc(data)? {
            Frame::Npdu { origin, npdu, .. } => (origin.unwrap_or(src), npdu),
            Frame::Result(0) => {
                tracing::trace!(%src, "BVLC result: success");
                return Ok(());
            }
            Frame::Result(code) => {
                tracing::warn!(%src, code, "BBMD rejected foreign device registration");
                return Ok(());
            }
            Frame::Ignored(function) => {
                tracing::trace!(%src, function, "Ignoring BVLC function");
                return Ok(());
            }
        };

        let npdu = frame::decode_npdu(npdu)?;
        if npdu.network_message || npdu.apdu.is_empty() {
            return Ok(());
        }

        match apdu::decode_apdu(npdu.apdu)? {
            Apdu::UnconfirmedRequest { service, payload } => match service {
                unconfirmed_service::I_AM => self.handle_iam(&payload, origin),
                unconfirmed_service::WHO_IS => self.handle_who_is(&payload, origin),
                _ => Ok(()),
            },
            Apdu::ConfirmedRequest {
                invoke_id, service, ..
            } => {
                tracing::debug!(%origin, service, "Rejecting confirmed request");
                let reject = apdu::encode_reject(invoke_id, apdu::REJECT_UNRECOGNIZED_SERVICE);
                self.reply(&reject, origin)
            }
            Apdu::SegmentAck { .. } => Ok(()),
            response => {
                if let Apdu::ComplexAck {
                    invoke_id,
                    segmented: true,
                    service,
                    ..
                } = &response
                {
                    if *service == confirmed_service::READ_PROPERTY_MULTIPLE
                        || *service == confirmed_service::READ_PROPERTY
                    {
                        let abort =
                            apdu::encode_abort(*invoke_id, apdu::ABORT_SEGMENTATION_NOT_SUPPORTED);
                        self.reply(&abort, origin)?;
                    }
                }
                let mut slot = self.shared.slot.lock();
                if slot.offer_response(response, origin) {
                    self.shared.signal.notify_all();
                } else {
                    tracing::trace!(%origin, "Response does not match the pending request");
                }
                Ok(())
            }
        }
    }

    fn handle_iam(&self, payload: &[u8], origin: SocketAddr) -> StackResult<()> {
        let iam = match IAm::decode(payload) {
            Ok(iam) => iam,
            Err(e) => {
                tracing::warn!(%origin, error = %e, "Dropping malformed I-Am");
                return Ok(());
            }
        };
        let mut slot = self.shared.slot.lock();
        if slot.offer_iam(&iam, origin) {
            tracing::debug!(%origin, instance = iam.device.instance, "I-Am received");
            self.shared.signal.notify_all();
        }
        Ok(())
    }

    fn handle_who_is(&self, payload: &[u8], origin: SocketAddr) -> StackResult<()> {
        let request = WhoIs::decode(payload)?;
        if !request.matches(self.shared.config.device_instance) {
            return Ok(());
        }
        tracing::debug!(%origin, "Answering Who-Is for local device");
        self.reply(&self.shared.local_iam().encode(), origin)
    }

    fn reply(&self, apdu: &[u8], dest: SocketAddr) -> StackResult<()> {
        let npdu = frame::encode_npdu(apdu, false);
        let datagram = frame::encode_bvlc(BvlcFunction::OriginalUnicastNpdu, &npdu);
        self.unicast.send_to(&datagram, dest)?;
        Ok(())
    }
}
