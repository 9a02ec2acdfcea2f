//! Device handle.
//!
//! [`GimdowDevice`] owns one lock's connection: it establishes the link,
//! runs the handshake, correlates requests with responses, keeps the
//! datapoint store in sync with reports and reconnects after unexpected
//! drops.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::config::DeviceConfig;
use super::dispatch::{Inbound, local_time_reply};
use super::handshake::{DeviceInfo, pairing_request};
use super::observer::{Observers, Subscription};
use crate::catalog::{DeviceCredentials, LockMapping, ProductInfo, display_name, product_for};
use crate::core::{
    CredentialSource, DatapointError, GimdowError, Link, LinkEvent, PAIR_RESULT_OK,
    ProtocolError, Result, SUPPORTED_PROTOCOL_VERSIONS, Transport, TransportError,
};
use crate::crypto::random_iv;
use crate::datapoint::{
    Datapoint, DatapointStore, DatapointType, DatapointValue, SetOutcome, encode_records,
};
use crate::transport::{ConnectionPhase, Frame, Opcode, SessionState, decode_frame, encode_frame, fragment};

/// Serializes link establishment across all devices.
static GLOBAL_CONNECT_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

fn guard<M>(mutex: &Mutex<M>) -> MutexGuard<'_, M> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub(super) struct Inner<T: Transport> {
    address: String,
    transport: T,
    pub(super) config: DeviceConfig,
    credentials: DeviceCredentials,
    session: Mutex<SessionState>,
    link: Mutex<Option<(u64, Arc<T::Link>)>>,
    device_info: Mutex<Option<DeviceInfo>>,
    store: Mutex<DatapointStore>,
    operation_lock: tokio::sync::Mutex<()>,
    connect_lock: tokio::sync::Mutex<()>,
    reconnecting: AtomicBool,
    pub(super) resolving: AtomicBool,
    connected: Observers<()>,
    disconnected: Observers<()>,
    datapoints: Observers<[Datapoint]>,
}

/// Handle to one Gimdow lock.
///
/// Cheap to clone; all clones share the same connection.
///
/// # Example
///
/// ```ignore
/// let device = GimdowDevice::initialize(address, transport, &cloud, DeviceConfig::default()).await?;
/// let _sub = device.on_datapoints(|dps| println!("{dps:?}"));
/// device.connect().await?;
/// device.unlock().await?;
/// ```
pub struct GimdowDevice<T: Transport> {
    pub(super) inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for GimdowDevice<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> fmt::Debug for GimdowDevice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GimdowDevice")
            .field("address", &self.inner.address)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> GimdowDevice<T> {
    /// Create a device from known credentials.
    pub fn new(
        address: impl Into<String>,
        transport: T,
        credentials: DeviceCredentials,
        config: DeviceConfig,
    ) -> Result<Self> {
        config.validate()?;
        let session = SessionState::new(credentials.local_key());
        Ok(Self {
            inner: Arc::new(Inner {
                address: address.into(),
                transport,
                config,
                credentials,
                session: Mutex::new(session),
                link: Mutex::new(None),
                device_info: Mutex::new(None),
                store: Mutex::new(DatapointStore::new()),
                operation_lock: tokio::sync::Mutex::new(()),
                connect_lock: tokio::sync::Mutex::new(()),
                reconnecting: AtomicBool::new(false),
                resolving: AtomicBool::new(false),
                connected: Observers::new(),
                disconnected: Observers::new(),
                datapoints: Observers::new(),
            }),
        })
    }

    /// Create a device, fetching its credentials from `source`.
    pub async fn initialize<C>(
        address: impl Into<String>,
        transport: T,
        source: &C,
        config: DeviceConfig,
    ) -> Result<Self>
    where
        C: CredentialSource + ?Sized,
    {
        let address = address.into();
        let Some(credentials) = source.credentials(&address).await else {
            return Err(GimdowError::MissingCredentials(address));
        };
        debug!(%address, category = %credentials.category, product_id = %credentials.product_id, "credentials loaded");
        Self::new(address, transport, credentials, config)
    }

    // ----- identity -----

    /// Link-layer address.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Credentials and schema.
    pub fn credentials(&self) -> &DeviceCredentials {
        &self.inner.credentials
    }

    /// Catalog entry of the product, if known.
    pub fn product(&self) -> Option<&'static ProductInfo> {
        product_for(&self.inner.credentials)
    }

    /// Lock datapoints of the product, if it is a known lock.
    pub fn lock_mapping(&self) -> Option<LockMapping> {
        self.product().and_then(|product| product.lock)
    }

    /// Display name.
    pub fn name(&self) -> String {
        display_name(&self.inner.address, Some(&self.inner.credentials), None)
    }

    /// Device information from the last handshake.
    pub fn device_info(&self) -> Option<DeviceInfo> {
        guard(&self.inner.device_info).clone()
    }

    /// Protocol version reported by the device, else the configured one.
    pub fn protocol_version(&self) -> u8 {
        guard(&self.inner.device_info)
            .as_ref()
            .map_or(self.inner.config.protocol_version, |info| info.protocol_version)
    }

    /// Configuration.
    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    // ----- lifecycle -----

    /// Current connection phase.
    pub fn phase(&self) -> ConnectionPhase {
        guard(&self.inner.session).phase
    }

    /// Check if the handshake completed.
    pub fn is_paired(&self) -> bool {
        guard(&self.inner.session).is_paired()
    }

    /// Check if a link is up.
    pub fn is_connected(&self) -> bool {
        self.current_link()
            .is_some_and(|(_, link)| link.is_connected())
    }

    /// Allow connections again after [`stop`](Self::stop).
    pub fn start(&self) {
        debug!(address = %self.inner.address, "starting");
        guard(&self.inner.session).expected_disconnect = false;
    }

    /// Disconnect and suppress reconnects until [`start`](Self::start).
    pub async fn stop(&self) {
        debug!(address = %self.inner.address, "stopping");
        guard(&self.inner.session).expected_disconnect = true;
        let _connect = self.inner.connect_lock.lock().await;
        self.close_link(None).await;
    }

    /// Connect and pair, unless already paired.
    pub async fn connect(&self) -> Result<()> {
        self.check_running()?;
        if self.is_ready() {
            return Ok(());
        }
        if self.inner.connect_lock.try_lock().is_err() {
            debug!(address = %self.inner.address, "connection already in progress, waiting");
        }
        let _connect = self.inner.connect_lock.lock().await;
        self.check_running()?;
        if self.is_ready() {
            return Ok(());
        }
        self.establish().await
    }

    fn is_ready(&self) -> bool {
        self.is_paired() && self.is_connected()
    }

    fn expected_disconnect(&self) -> bool {
        guard(&self.inner.session).expected_disconnect
    }

    pub(super) fn check_running(&self) -> Result<()> {
        if self.expected_disconnect() {
            return Err(GimdowError::NotConnected);
        }
        Ok(())
    }

    fn current_link(&self) -> Option<(u64, Arc<T::Link>)> {
        guard(&self.inner.link)
            .as_ref()
            .map(|(generation, link)| (*generation, Arc::clone(link)))
    }

    async fn establish(&self) -> Result<()> {
        let address = &self.inner.address;
        guard(&self.inner.session).phase = ConnectionPhase::Connecting;

        let connected = {
            let _global = GLOBAL_CONNECT_LOCK.lock().await;
            debug!(%address, "connecting");
            self.inner.transport.connect().await
        };
        let link = match connected {
            Ok(link) => Arc::new(link),
            Err(e) => {
                error!(%address, error = %e, "connection failed");
                guard(&self.inner.session).phase = ConnectionPhase::Disconnected;
                return Err(e.into());
            }
        };

        let events = match self.check_running() {
            Ok(()) => link.subscribe().await,
            Err(_) => Err(TransportError::NotConnected),
        };
        let events = match events {
            Ok(events) => events,
            Err(e) => {
                if !self.expected_disconnect() {
                    error!(%address, error = %e, "starting notifications failed");
                }
                let _ = link.disconnect().await;
                guard(&self.inner.session).phase = ConnectionPhase::Disconnected;
                return Err(e.into());
            }
        };

        let generation = {
            let mut session = guard(&self.inner.session);
            session.reset();
            session.begin_link()
        };
        *guard(&self.inner.link) = Some((generation, Arc::clone(&link)));
        self.spawn_reader(generation, events);
        debug!(%address, generation, "connected, starting handshake");

        if let Err(e) = self.handshake().await {
            error!(%address, error = %e, "handshake failed");
            self.close_link(Some(generation)).await;
            return Err(e);
        }

        info!(%address, protocol_version = self.protocol_version(), "paired");
        self.inner.connected.notify(&());
        Ok(())
    }

    async fn handshake(&self) -> Result<()> {
        debug!(address = %self.inner.address, "sending device info request");
        if !self.send_packet(Opcode::DeviceInfo, &[], 0, true).await? {
            return Err(GimdowError::Timeout("device info"));
        }
        self.check_running()?;

        debug!(address = %self.inner.address, "sending pairing request");
        let credentials = &self.inner.credentials;
        let request = pairing_request(
            &credentials.uuid,
            &credentials.local_key(),
            &credentials.device_id,
        );
        if !self.send_packet(Opcode::Pair, &request, 0, true).await? {
            return Err(GimdowError::Timeout("pairing"));
        }
        self.check_running()?;

        if !self.is_paired() {
            return Err(GimdowError::NotConnected);
        }
        Ok(())
    }

    /// Take the link if it still belongs to `generation` (any link if
    /// `None`). Returns the link and whether the session was paired.
    fn detach_link(&self, generation: Option<u64>) -> Option<(Arc<T::Link>, bool)> {
        let link = {
            let mut slot = guard(&self.inner.link);
            let owned = slot
                .as_ref()
                .is_some_and(|(current, _)| generation.is_none_or(|g| g == *current));
            if owned { slot.take().map(|(_, link)| link) } else { None }
        }?;
        let mut session = guard(&self.inner.session);
        let was_paired = session.is_paired();
        session.phase = ConnectionPhase::Disconnecting;
        Some((link, was_paired))
    }

    async fn close_link(&self, generation: Option<u64>) {
        let Some((link, was_paired)) = self.detach_link(generation) else {
            guard(&self.inner.session).reset();
            return;
        };
        debug!(address = %self.inner.address, "disconnecting");
        if let Err(e) = link.disconnect().await {
            debug!(address = %self.inner.address, error = %e, "disconnect failed");
        }
        self.handle_link_lost(was_paired);
    }

    fn handle_link_lost(&self, was_paired: bool) {
        let address = &self.inner.address;
        let expected = {
            let mut session = guard(&self.inner.session);
            session.reset();
            session.expected_disconnect
        };
        self.inner.disconnected.notify(&());

        if expected {
            debug!(%address, "disconnected");
            return;
        }
        warn!(%address, "device unexpectedly disconnected");
        if was_paired {
            self.schedule_reconnect();
        }
    }

    /// Drop the link without suppressing the reconnect.
    pub(super) async fn force_reconnect(&self) {
        warn!(address = %self.inner.address, "forcing reconnect");
        self.close_link(None).await;
    }

    fn schedule_reconnect(&self) {
        if self.inner.reconnecting.swap(true, Ordering::AcqRel) {
            debug!(address = %self.inner.address, "reconnect already scheduled");
            return;
        }
        debug!(address = %self.inner.address, "scheduling reconnect");
        let device = self.clone();
        tokio::spawn(async move {
            device.reconnect_loop().await;
            device.inner.reconnecting.store(false, Ordering::Release);
        });
    }

    async fn reconnect_loop(&self) {
        let address = &self.inner.address;
        loop {
            if self.expected_disconnect() {
                debug!(%address, "reconnect cancelled");
                return;
            }
            match self.connect().await {
                Ok(()) => {
                    info!(%address, "reconnected");
                    return;
                }
                Err(e) if e.is_retryable() => {
                    warn!(%address, error = %e, backoff = ?self.inner.config.backoff, "reconnect failed, retrying");
                    tokio::time::sleep(self.inner.config.backoff).await;
                }
                Err(e) => {
                    error!(%address, error = %e, "reconnect failed");
                    return;
                }
            }
        }
    }

    // ----- send path -----

    /// Send a request after making sure the device is paired.
    async fn send_command(&self, opcode: Opcode, payload: &[u8]) -> Result<bool> {
        self.connect().await?;
        self.check_running()?;
        self.send_packet(opcode, payload, 0, true).await
    }

    /// Encode, fragment and write one frame.
    ///
    /// With `wait`, returns `Ok(false)` if no response arrived in time and
    /// the device's error if it answered with a nonzero result.
    async fn send_packet(
        &self,
        opcode: Opcode,
        payload: &[u8],
        response_to: u32,
        wait: bool,
    ) -> Result<bool> {
        let address = &self.inner.address;
        let (_, link) = self.current_link().ok_or(GimdowError::NotConnected)?;

        let (seq, blob, response) = {
            let mut session = guard(&self.inner.session);
            let seq = session.next_seq();
            let blob = encode_frame(session.keys(), seq, opcode, payload, response_to, &random_iv())?;
            let response = wait.then(|| session.expect_response(seq));
            (seq, blob, response)
        };
        let chunks = fragment(&blob, self.inner.config.mtu, self.protocol_version())?;

        if response_to != 0 {
            debug!(%address, seq, ?opcode, response_to, "sending response");
        } else {
            debug!(%address, seq, ?opcode, "sending");
        }
        if let Err(e) = self.write_chunks(&link, chunks).await {
            guard(&self.inner.session).cancel(seq);
            return Err(e);
        }

        let Some(response) = response else {
            return Ok(true);
        };
        match tokio::time::timeout(self.inner.config.response_timeout, response).await {
            Ok(Ok(Ok(()))) => Ok(true),
            Ok(Ok(Err(e))) => Err(e.into()),
            Ok(Err(_)) => Err(GimdowError::NotConnected),
            Err(_) => {
                guard(&self.inner.session).cancel(seq);
                debug!(%address, seq, ?opcode, "timeout receiving response");
                Ok(false)
            }
        }
    }

    async fn write_chunks(&self, link: &Arc<T::Link>, chunks: Vec<Vec<u8>>) -> Result<()> {
        let address = &self.inner.address;
        if self.inner.operation_lock.try_lock().is_err() {
            debug!(%address, "operation in progress, waiting");
        }
        let written = {
            let _operation = self.inner.operation_lock.lock().await;
            write_all(link.as_ref(), &chunks).await
        };
        let err = match written {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        if let TransportError::NotFound(_) = err {
            error!(%address, error = %err, "device not found or out of range");
            return Err(err.into());
        }

        warn!(%address, error = %err, backoff = ?self.inner.config.backoff, "communication failed, backing off");
        tokio::time::sleep(self.inner.config.backoff).await;
        if !self.expected_disconnect() {
            if self.is_paired() {
                self.spawn_resend(chunks);
            } else {
                self.schedule_reconnect();
            }
        }
        Err(err.into())
    }

    fn spawn_resend(&self, chunks: Vec<Vec<u8>>) {
        let device = self.clone();
        tokio::spawn(async move {
            let address = &device.inner.address;
            if let Err(e) = device.connect().await {
                debug!(%address, error = %e, "resend skipped");
                return;
            }
            let Some((_, link)) = device.current_link() else {
                return;
            };
            let _operation = device.inner.operation_lock.lock().await;
            if let Err(e) = write_all(link.as_ref(), &chunks).await {
                warn!(%address, error = %e, "resend failed");
            }
        });
    }

    fn spawn_response(&self, opcode: Opcode, payload: Vec<u8>, response_to: u32) {
        let device = self.clone();
        tokio::spawn(async move {
            if let Err(e) = device.send_packet(opcode, &payload, response_to, false).await {
                warn!(address = %device.inner.address, ?opcode, error = %e, "failed to send response");
            }
        });
    }

    // ----- receive path -----

    fn spawn_reader(&self, generation: u64, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let device = GimdowDevice { inner };
                match event {
                    LinkEvent::Chunk(chunk) => {
                        if device.current_link().map(|(g, _)| g) != Some(generation) {
                            break;
                        }
                        device.handle_chunk(&chunk);
                    }
                    LinkEvent::Disconnected => break,
                }
            }
            if let Some(inner) = weak.upgrade() {
                let device = GimdowDevice { inner };
                if let Some((_, was_paired)) = device.detach_link(Some(generation)) {
                    device.handle_link_lost(was_paired);
                }
            }
        });
    }

    fn handle_chunk(&self, chunk: &[u8]) {
        let address = &self.inner.address;
        let decoded = {
            let mut session = guard(&self.inner.session);
            match session.push_chunk(chunk) {
                Ok(Some(blob)) => decode_frame(session.keys(), &blob),
                Ok(None) => return,
                Err(e) => {
                    warn!(%address, error = %e, "dropping partial frame");
                    return;
                }
            }
        };
        match decoded {
            Ok(frame) => self.handle_frame(frame),
            Err(e) => error!(%address, error = %e, "failed to decode frame"),
        }
    }

    fn handle_frame(&self, frame: Frame) {
        let address = &self.inner.address;
        let Some(opcode) = frame.opcode() else {
            debug!(%address, code = frame.code, "ignoring unknown message code");
            return;
        };
        debug!(%address, seq = frame.seq, ?opcode, response_to = frame.response_to, "received");

        let outcome = Inbound::interpret(opcode, &frame.payload, Utc::now())
            .map(|inbound| self.apply(inbound, opcode, frame.seq));

        if frame.response_to != 0 {
            let result = match outcome {
                Ok(0) => Ok(()),
                Ok(code) => Err(ProtocolError::Device(code)),
                Err(e) => Err(e),
            };
            if !guard(&self.inner.session).complete(frame.response_to, result) {
                debug!(%address, response_to = frame.response_to, "no request waiting for response");
            }
        } else if let Err(e) = outcome {
            error!(%address, ?opcode, error = %e, "failed to handle frame");
        }
    }

    /// Apply a decoded frame and return its result code.
    fn apply(&self, inbound: Inbound, opcode: Opcode, seq: u32) -> u8 {
        let address = &self.inner.address;
        let code = inbound.result_code();
        match inbound {
            Inbound::DeviceInfo(info) => {
                debug!(%address, ?info, "device info");
                {
                    let mut session = guard(&self.inner.session);
                    session.install_session_key(&info.device_random);
                    session.phase = ConnectionPhase::AwaitingPairing;
                }
                *guard(&self.inner.device_info) = Some(info);
            }
            Inbound::PairResult(result) => {
                if result == PAIR_RESULT_OK {
                    guard(&self.inner.session).phase = ConnectionPhase::Paired;
                } else {
                    warn!(%address, result, "pairing rejected");
                }
            }
            Inbound::StatusResult(_) | Inbound::DatapointAck => {}
            Inbound::TimeRequest(format) => {
                let reply = local_time_reply(format);
                self.spawn_response(opcode, reply, seq);
            }
            Inbound::Report(report) => {
                let ack = report.ack_payload();
                let updated = guard(&self.inner.store).apply_report(
                    report.records,
                    report.timestamp,
                    report.flags,
                );
                debug!(%address, count = updated.len(), "datapoints updated");
                self.inner.datapoints.notify(updated.as_slice());
                self.spawn_response(opcode, ack, seq);
            }
        }
        code
    }

    // ----- datapoints -----

    /// Snapshot of a datapoint.
    pub fn datapoint(&self, id: u8) -> Option<Datapoint> {
        guard(&self.inner.store).get(id).cloned()
    }

    /// Snapshot of all datapoints.
    pub fn datapoints(&self) -> Vec<Datapoint> {
        guard(&self.inner.store).iter().cloned().collect()
    }

    /// Check if a datapoint exists, optionally with a given type.
    pub fn has_datapoint(&self, id: u8, ty: Option<DatapointType>) -> bool {
        guard(&self.inner.store).has(id, ty)
    }

    /// Get a datapoint, creating it locally if missing.
    pub fn get_or_create_datapoint(
        &self,
        id: u8,
        ty: DatapointType,
        default: Option<DatapointValue>,
    ) -> Result<Datapoint> {
        Ok(guard(&self.inner.store).get_or_create(id, ty, default)?.clone())
    }

    /// Set a datapoint and send it, or queue it inside an update scope.
    pub async fn set_datapoint(
        &self,
        id: u8,
        ty: DatapointType,
        value: impl Into<DatapointValue>,
    ) -> Result<()> {
        let value = value.into();
        let outcome = {
            let mut store = guard(&self.inner.store);
            store.get_or_create(id, ty, Some(value.clone()))?;
            store.set_value(id, value)?
        };
        match outcome {
            SetOutcome::SendNow => {
                if !self.send_datapoints(&[id]).await? {
                    warn!(address = %self.inner.address, id, "datapoint not acknowledged");
                }
            }
            SetOutcome::Deferred => debug!(address = %self.inner.address, id, "datapoint queued"),
        }
        Ok(())
    }

    /// Set a datapoint by schema code.
    ///
    /// A label offered for an enum function is converted to its index.
    pub async fn set_by_code(&self, code: &str, value: impl Into<DatapointValue>) -> Result<()> {
        let function = self
            .inner
            .credentials
            .find(code, true)
            .ok_or_else(|| DatapointError::UnknownCode(code.to_owned()))?;
        let ty = function.datapoint_type();
        let value = match (ty, value.into()) {
            (DatapointType::Enum, DatapointValue::String(label)) => {
                match function
                    .values
                    .as_ref()
                    .and_then(|values| values.enum_index(&label))
                {
                    Some(index) => DatapointValue::Enum(index),
                    None => {
                        return Err(DatapointError::InvalidLabel {
                            code: code.to_owned(),
                            label,
                        }
                        .into());
                    }
                }
            }
            (_, value) => value,
        };
        let id = function.dp_id;
        self.set_datapoint(id, ty, value).await
    }

    /// Current value of a schema code.
    pub fn value_of(&self, code: &str) -> Option<DatapointValue> {
        let id = self.inner.credentials.find_dp_id(code, false)?;
        guard(&self.inner.store)
            .get(id)
            .map(|dp| dp.value().clone())
    }

    /// Current values by schema code, for datapoints that have a value.
    pub fn status(&self) -> BTreeMap<String, DatapointValue> {
        let store = guard(&self.inner.store);
        let mut status = BTreeMap::new();
        for function in self.inner.credentials.schema() {
            if let Some(dp) = store.get(function.dp_id) {
                status
                    .entry(function.code.clone())
                    .or_insert_with(|| dp.value().clone());
            }
        }
        status
    }

    /// Open an update scope; sets are batched until the outermost scope
    /// ends.
    pub fn begin_update(&self) -> UpdateScope<T> {
        guard(&self.inner.store).begin_update();
        UpdateScope {
            device: Some(self.clone()),
        }
    }

    /// Send the given datapoints as one DATAPOINT_SET batch.
    ///
    /// Returns whether the device acknowledged the batch in time.
    pub async fn send_datapoints(&self, ids: &[u8]) -> Result<bool> {
        self.connect().await?;
        let version = self.protocol_version();
        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&version) {
            return Err(GimdowError::UnsupportedProtocol(version));
        }
        let payload = {
            let store = guard(&self.inner.store);
            encode_records(store.batch(ids)?)?
        };
        self.send_command(Opcode::DatapointSet, &payload).await
    }

    /// Ask the device to report all datapoints.
    pub async fn update(&self) -> Result<bool> {
        self.send_command(Opcode::DeviceStatus, &[]).await
    }

    // ----- lock -----

    fn require_lock_mapping(&self) -> Result<LockMapping> {
        self.lock_mapping().ok_or_else(|| {
            GimdowError::Config(format!(
                "product {}/{} has no lock datapoints",
                self.inner.credentials.category, self.inner.credentials.product_id
            ))
        })
    }

    /// Lock the bolt.
    pub async fn lock(&self) -> Result<()> {
        let mapping = self.require_lock_mapping()?;
        self.set_datapoint(mapping.lock_dp, DatapointType::Bool, mapping.lock_value)
            .await
    }

    /// Unlock the bolt.
    pub async fn unlock(&self) -> Result<()> {
        let mapping = self.require_lock_mapping()?;
        self.set_datapoint(mapping.unlock_dp, DatapointType::Bool, mapping.unlock_value)
            .await
    }

    /// Whether the bolt is locked.
    ///
    /// `None` while the state is unknown or being resolved.
    pub fn lock_state(&self) -> Option<bool> {
        self.lock_state_of(self.lock_mapping()?.state_dp)
    }

    /// Whether the bolt is locked, read from an explicit state datapoint
    /// (true = unlocked on the wire).
    pub fn lock_state_of(&self, state_dp: u8) -> Option<bool> {
        if self.is_resolving() {
            return None;
        }
        self.datapoint(state_dp)
            .map(|dp| !dp.value().as_bool())
    }

    /// Check if the resolution sequence is running.
    pub fn is_resolving(&self) -> bool {
        self.inner.resolving.load(Ordering::Acquire)
    }

    // ----- observers -----

    /// Call `callback` after every successful handshake.
    pub fn on_connected<F>(&self, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.connected.subscribe(move |_: &()| callback())
    }

    /// Call `callback` whenever the link drops.
    pub fn on_disconnected<F>(&self, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.disconnected.subscribe(move |_: &()| callback())
    }

    /// Call `callback` with the datapoints updated by each report.
    pub fn on_datapoints<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[Datapoint]) + Send + Sync + 'static,
    {
        self.inner.datapoints.subscribe(callback)
    }
}

async fn write_all<L: Link + ?Sized>(
    link: &L,
    chunks: &[Vec<u8>],
) -> std::result::Result<(), TransportError> {
    for chunk in chunks {
        link.write(chunk).await?;
    }
    Ok(())
}

/// Batches datapoint sets until it ends.
///
/// Prefer [`end`](Self::end), which reports send failures. A scope that is
/// dropped instead sends its batch on a background task.
#[must_use = "the batch is sent when the scope ends"]
pub struct UpdateScope<T: Transport> {
    device: Option<GimdowDevice<T>>,
}

impl<T: Transport> UpdateScope<T> {
    /// Close the scope; the outermost scope sends the batch.
    pub async fn end(mut self) -> Result<()> {
        let Some(device) = self.device.take() else {
            return Ok(());
        };
        let ids = guard(&device.inner.store).end_update();
        if ids.is_empty() {
            return Ok(());
        }
        if !device.send_datapoints(&ids).await? {
            warn!(address = %device.inner.address, ?ids, "batch not acknowledged");
        }
        Ok(())
    }
}

impl<T: Transport> Drop for UpdateScope<T> {
    fn drop(&mut self) {
        let Some(device) = self.device.take() else {
            return;
        };
        let ids = guard(&device.inner.store).end_update();
        if ids.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = device.send_datapoints(&ids).await {
                        warn!(address = %device.inner.address, error = %e, "failed to send batch");
                    }
                });
            }
            Err(_) => {
                warn!(address = %device.inner.address, ?ids, "update scope dropped outside a runtime, batch discarded");
            }
        }
    }
}

impl<T: Transport> fmt::Debug for UpdateScope<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateScope")
            .field("open", &self.device.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{SecurityFlag, SymmetricKey};
    use crate::device::mock::{ADDRESS, FakeLock, credentials};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn device(fake: &FakeLock) -> GimdowDevice<FakeLock> {
        GimdowDevice::new(ADDRESS, fake.clone(), credentials(), DeviceConfig::default()).unwrap()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(30), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&count);
        (count, move || {
            handle.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_pairs() {
        let fake = FakeLock::new();
        let device = device(&fake);
        let (connected, on_connected) = counter();
        let _sub = device.on_connected(on_connected);

        device.connect().await.unwrap();
        assert!(device.is_paired());
        assert!(device.is_connected());
        assert_eq!(device.phase(), ConnectionPhase::Paired);
        assert_eq!(device.protocol_version(), 3);
        assert_eq!(connected.load(Ordering::SeqCst), 1);

        let info = fake.received(Opcode::DeviceInfo);
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].seq, 1);

        let creds = credentials();
        let pair = fake.received(Opcode::Pair);
        assert_eq!(pair.len(), 1);
        assert_eq!(pair[0].seq, 2);
        assert_eq!(
            pair[0].payload,
            pairing_request(&creds.uuid, &creds.local_key(), &creds.device_id)
        );

        let session_key = *guard(&device.inner.session)
            .keys()
            .key(SecurityFlag::Session)
            .unwrap()
            .as_bytes();
        assert_eq!(session_key, *SymmetricKey::md5_of(b"abcdefr4nd0m").as_bytes());

        // Already paired: nothing new on the wire.
        device.connect().await.unwrap();
        assert_eq!(fake.connects(), 1);
        assert_eq!(fake.received(Opcode::DeviceInfo).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_paired_is_success() {
        let fake = FakeLock::new().with_pair_result(2);
        let device = device(&fake);
        device.connect().await.unwrap();
        assert!(device.is_paired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pairing_rejected() {
        let fake = FakeLock::new().with_pair_result(1);
        let device = device(&fake);
        let (disconnected, on_disconnected) = counter();
        let _sub = device.on_disconnected(on_disconnected);

        let err = device.connect().await.unwrap_err();
        assert_eq!(err.device_code(), Some(1));
        assert!(!device.is_connected());
        assert_eq!(device.phase(), ConnectionPhase::Disconnected);
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);

        // Never paired, so no reconnect.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fake.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_datapoint_connects_and_sends() {
        let fake = FakeLock::new();
        let device = device(&fake);

        device
            .set_datapoint(6, DatapointType::Bool, true)
            .await
            .unwrap();
        assert!(device.is_paired());

        let sets = fake.received(Opcode::DatapointSet);
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].payload, vec![6, 1, 1, 1]);
        assert!(!device.datapoint(6).unwrap().changed_by_device());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_scope_sends_one_batch() {
        let fake = FakeLock::new();
        let device = device(&fake);
        device.connect().await.unwrap();

        let outer = device.begin_update();
        device
            .set_datapoint(6, DatapointType::Bool, true)
            .await
            .unwrap();
        let inner = device.begin_update();
        device
            .set_datapoint(46, DatapointType::Bool, true)
            .await
            .unwrap();
        device
            .set_datapoint(6, DatapointType::Bool, false)
            .await
            .unwrap();
        inner.end().await.unwrap();
        assert!(fake.received(Opcode::DatapointSet).is_empty());

        outer.end().await.unwrap();
        let sets = fake.received(Opcode::DatapointSet);
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].payload, vec![46, 1, 1, 1, 6, 1, 1, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_scope_flushes() {
        let fake = FakeLock::new();
        let device = device(&fake);
        {
            let _scope = device.begin_update();
            device
                .set_datapoint(46, DatapointType::Bool, true)
                .await
                .unwrap();
        }
        fake.wait_for(Opcode::DatapointSet, 1).await;
        assert_eq!(fake.received(Opcode::DatapointSet)[0].payload, vec![46, 1, 1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_updates_store_and_is_acked() {
        let fake = FakeLock::new();
        let device = device(&fake);
        device.connect().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = device.on_datapoints(move |dps| {
            let _ = tx.send(dps.to_vec());
        });

        fake.push(
            Opcode::SignedDatapointReport,
            &[0x00, 0x07, 0x00, 47, 1, 1, 1, 8, 2, 4, 0, 0, 0, 87],
        );
        let updated = rx.recv().await.unwrap();
        assert_eq!(updated.len(), 2);
        assert_eq!(updated[0].id(), 47);
        assert!(updated[0].changed_by_device());

        assert_eq!(device.lock_state(), Some(false));
        assert_eq!(
            device.value_of("residual_electricity"),
            Some(DatapointValue::Value(87))
        );
        let status = device.status();
        assert_eq!(status.get("lock_motor_state"), Some(&DatapointValue::Bool(true)));
        assert_eq!(status.len(), 2);

        fake.wait_for(Opcode::SignedDatapointReport, 1).await;
        let ack = &fake.received(Opcode::SignedDatapointReport)[0];
        assert_eq!(ack.payload, vec![0x00, 0x07, 0x00, 0x00]);
        assert_ne!(ack.response_to, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_requests_answered() {
        let fake = FakeLock::new();
        let device = device(&fake);
        device.connect().await.unwrap();

        fake.push(Opcode::TimeRequest1, &[]);
        fake.push(Opcode::TimeRequest2, &[]);
        fake.wait_for(Opcode::TimeRequest1, 1).await;
        fake.wait_for(Opcode::TimeRequest2, 1).await;

        assert_eq!(fake.received(Opcode::TimeRequest1)[0].payload.len(), 15);
        assert_eq!(fake.received(Opcode::TimeRequest2)[0].payload.len(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_unexpected_drop() {
        let fake = FakeLock::new();
        let device = device(&fake);
        let (disconnected, on_disconnected) = counter();
        let (connected, on_connected) = counter();
        let _d = device.on_disconnected(on_disconnected);
        let _c = device.on_connected(on_connected);
        device.connect().await.unwrap();

        fake.drop_link();
        eventually(|| fake.connects() == 2 && device.is_paired()).await;
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(connected.load(Ordering::SeqCst), 2);

        // Sequence numbers restart on the new link.
        let info = fake.received(Opcode::DeviceInfo);
        assert_eq!(info[1].seq, 1);

        // Exactly one reconnect.
        tokio::time::sleep(device.config().backoff * 20).await;
        assert_eq!(fake.connects(), 2);
        assert_eq!(connected.load(Ordering::SeqCst), 2);
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bus_error_while_paired_resends_once() {
        let fake = FakeLock::new();
        let device = device(&fake);
        device.connect().await.unwrap();
        let backoff = device.config().backoff;

        fake.fail_next_write(TransportError::Bus("write failed".into()));
        let started = tokio::time::Instant::now();
        let err = device
            .set_datapoint(6, DatapointType::Bool, true)
            .await
            .unwrap_err();
        assert!(matches!(err, GimdowError::Transport(TransportError::Bus(_))));
        assert!(started.elapsed() >= backoff);

        fake.wait_for(Opcode::DatapointSet, 1).await;
        tokio::time::sleep(backoff * 20).await;
        let sets = fake.received(Opcode::DatapointSet);
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].payload, vec![6, 1, 1, 1]);
        assert_eq!(fake.connects(), 1);
        assert_eq!(guard(&device.inner.session).pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bus_error_while_unpaired_reconnects() {
        let fake = FakeLock::new();
        let device = device(&fake);

        fake.fail_next_write(TransportError::Bus("write failed".into()));
        let err = device.connect().await.unwrap_err();
        assert!(err.is_transport());

        eventually(|| device.is_paired()).await;
        assert_eq!(fake.connects(), 2);
        assert_eq!(fake.received(Opcode::DeviceInfo).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_not_retried() {
        let fake = FakeLock::new();
        let device = device(&fake);
        device.connect().await.unwrap();

        fake.fail_next_write(TransportError::NotFound(ADDRESS.into()));
        let started = tokio::time::Instant::now();
        let err = device
            .set_datapoint(6, DatapointType::Bool, true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GimdowError::Transport(TransportError::NotFound(_))
        ));
        assert!(started.elapsed() < device.config().backoff);

        tokio::time::sleep(device.config().backoff * 20).await;
        assert!(fake.received(Opcode::DatapointSet).is_empty());
        assert_eq!(fake.connects(), 1);
        assert!(device.is_paired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_retries_until_reachable() {
        let fake = FakeLock::new();
        let device = device(&fake);
        device.connect().await.unwrap();

        fake.refuse_connect(true);
        fake.drop_link();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!device.is_paired());
        assert_eq!(fake.connects(), 1);

        fake.refuse_connect(false);
        eventually(|| device.is_paired()).await;
        assert_eq!(fake.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reconnect_after_stop() {
        let fake = FakeLock::new();
        let device = device(&fake);
        device.connect().await.unwrap();

        device.stop().await;
        assert!(!device.is_connected());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fake.connects(), 1);
        assert!(matches!(
            device.connect().await,
            Err(GimdowError::NotConnected)
        ));

        device.start();
        device.connect().await.unwrap();
        assert_eq!(fake.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_timeout_is_not_an_error() {
        let fake = FakeLock::new().silent_status();
        let device = device(&fake);
        device.connect().await.unwrap();

        assert!(!device.update().await.unwrap());
        assert_eq!(guard(&device.inner.session).pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_protocol() {
        let fake = FakeLock::new().with_protocol_version(1);
        let device = device(&fake);

        let err = device
            .set_datapoint(6, DatapointType::Bool, true)
            .await
            .unwrap_err();
        assert!(matches!(err, GimdowError::UnsupportedProtocol(1)));
        assert!(fake.received(Opcode::DatapointSet).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_by_code() {
        let fake = FakeLock::new();
        let device = device(&fake);

        device.set_by_code("beep_volume", "low").await.unwrap();
        assert_eq!(fake.received(Opcode::DatapointSet)[0].payload, vec![31, 4, 1, 1]);
        assert_eq!(device.value_of("beep_volume"), Some(DatapointValue::Enum(1)));

        let err = device.set_by_code("beep_volume", "loud").await.unwrap_err();
        assert!(matches!(
            err,
            GimdowError::Datapoint(DatapointError::InvalidLabel { .. })
        ));
        let err = device.set_by_code("missing", true).await.unwrap_err();
        assert!(matches!(
            err,
            GimdowError::Datapoint(DatapointError::UnknownCode(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_and_unlock_use_product_mapping() {
        let fake = FakeLock::new();
        let device = device(&fake);
        assert_eq!(device.name(), "A1 PRO MAX 7A1B2C");

        device.unlock().await.unwrap();
        device.lock().await.unwrap();
        let sets = fake.received(Opcode::DatapointSet);
        assert_eq!(sets[0].payload, vec![6, 1, 1, 1]);
        assert_eq!(sets[1].payload, vec![46, 1, 1, 1]);
        assert_eq!(device.lock_state(), None);
    }

    struct Credentials(Option<DeviceCredentials>);

    #[async_trait::async_trait]
    impl CredentialSource for Credentials {
        async fn credentials(&self, _address: &str) -> Option<DeviceCredentials> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_initialize_from_source() {
        let fake = FakeLock::new();
        let device = GimdowDevice::initialize(
            ADDRESS,
            fake.clone(),
            &Credentials(Some(credentials())),
            DeviceConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(device.address(), ADDRESS);
        assert_eq!(device.lock_mapping().map(|m| m.state_dp), Some(47));

        let err = GimdowDevice::initialize(ADDRESS, fake, &Credentials(None), DeviceConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GimdowError::MissingCredentials(_)));
    }
}
