//! Camera device enumerator channel
//!
//! One per session, on the `RDCamera_Device_Enumerator` DVC. Negotiates
//! the protocol version (min of server version 2 and the peer's), then
//! turns device added/removed notifications into pending operations. The
//! operations are applied on the session main loop: a remove tears down
//! the device if present, an add opens a new device channel under the
//! peer-chosen DVC name and subscribes to its error signal. A device
//! error is handled as a synthesized remove.
//!
//! Peer-chosen DVC names are sanitized: at most 256 bytes, and never one
//! of the standardized RDP channel names.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::device::{CamPduSink, CameraDevice};
use super::pdu::{CamMessage, CamPdu};
use super::{CameraError, Result, MAX_DVC_NAME_LEN, SERVER_VERSION};

/// Static virtual channel names a device may never claim
const RESERVED_SVC_NAMES: [&str; 6] = [
    "encomsp", // [MS-RDPEMC]
    "CLIPRDR", // [MS-RDPECLIP]
    "DRDYNVC", // [MS-RDPEDYC]
    "RDPDR",   // [MS-RDPEFS]
    "RDPSND",  // [MS-RDPEA]
    "RAIL",    // [MS-RDPERP]
];

/// Dynamic virtual channel names a device may never claim
const RESERVED_DVC_NAMES: [&str; 28] = [
    "AUDIO_INPUT",                                 // [MS-RDPEAI]
    "AUDIO_PLAYBACK_DVC",                          // [MS-RDPEA]
    "AUDIO_PLAYBACK_LOSSY_DVC",                    // [MS-RDPEA]
    "dwmprox",                                     // [MS-RDPCR2]
    "ECHO",                                        // [MS-RDPEECO]
    "FileRedirectorChannel",                       // [MS-RDPEPNP]
    "Microsoft::Windows::RDS::AuthRedirection",    // [MS-RDPEAR]
    "Microsoft::Windows::RDS::CoreInput",          // [MS-RDPECI]
    "Microsoft::Windows::RDS::DisplayControl",     // [MS-RDPEDISP]
    "Microsoft::Windows::RDS::Geometry::v08.01",   // [MS-RDPEGT]
    "Microsoft::Windows::RDS::Graphics",           // [MS-RDPEGFX]
    "Microsoft::Windows::RDS::Input",              // [MS-RDPEI]
    "Microsoft::Windows::RDS::Location",           // [MS-RDPEL]
    "Microsoft::Windows::RDS::MouseCursor",        // [MS-RDPEMSC]
    "Microsoft::Windows::RDS::Telemetry",          // [MS-RDPET]
    "Microsoft::Windows::RDS::Video::Control::v08.01", // [MS-RDPEVOR]
    "Microsoft::Windows::RDS::Video::Data::v08.01", // [MS-RDPEVOR]
    "PNPDR",                                       // [MS-RDPEPNP]
    "RDCamera_Device_Enumerator",                  // [MS-RDPECAM]
    "TextInput_ServerToClientDVC",                 // [MS-RDPETXT]
    "TextInput_ClientToServerDVC",                 // [MS-RDPETXT]
    "TSMF",                                        // [MS-RDPEV]
    "TSVCTKT",                                     // [MS-RDPEXPS]
    "URBDRC",                                      // [MS-RDPEUSB]
    "WebAuthN_Channel",                            // [MS-RDPEWA]
    "WMSAud",                                      // [MS-RDPADRV]
    "WMSDL",                                       // [MS-RDPADRV]
    "XPSRD",                                       // [MS-RDPEXPS]
];

fn is_vc_name_reserved(dvc_name: &[u8]) -> bool {
    RESERVED_SVC_NAMES
        .iter()
        .chain(RESERVED_DVC_NAMES.iter())
        .any(|reserved| reserved.as_bytes() == dvc_name)
}

/// Opens device channels on behalf of the enumerator
pub trait DeviceFactory: Send {
    /// Open a device DVC named `dvc_name` and return its handle
    ///
    /// Returning `None` skips the device (channel setup failed).
    fn create_device(
        &mut self,
        dvc_name: &[u8],
        device_name: &str,
        protocol_version: u8,
    ) -> Option<CameraDevice>;
}

struct DeviceInfo {
    device_name: String,
}

#[derive(Default)]
struct PendingOperations {
    to_add: HashMap<Vec<u8>, DeviceInfo>,
    to_remove: HashMap<Vec<u8>, ()>,
}

struct EnumeratorShared {
    sink: Mutex<Box<dyn CamPduSink>>,
    factory: Mutex<Box<dyn DeviceFactory>>,
    on_teardown: Box<dyn Fn() + Send + Sync>,

    protocol_version: Mutex<Option<u8>>,
    device_table: Mutex<HashMap<Vec<u8>, CameraDevice>>,

    pending: Mutex<PendingOperations>,
    device_notify: Notify,
}

/// MS-RDPECAM enumerator state machine
pub struct CameraEnumerator {
    shared: Arc<EnumeratorShared>,
    apply_task: tokio::task::JoinHandle<()>,
}

impl CameraEnumerator {
    /// Create the enumerator
    ///
    /// `on_teardown` fires on protocol violations; the session closes the
    /// channel in response.
    pub fn new<S, F, T>(sink: S, factory: F, on_teardown: T) -> Self
    where
        S: CamPduSink + 'static,
        F: DeviceFactory + 'static,
        T: Fn() + Send + Sync + 'static,
    {
        let shared = Arc::new(EnumeratorShared {
            sink: Mutex::new(Box::new(sink)),
            factory: Mutex::new(Box::new(factory)),
            on_teardown: Box::new(on_teardown),
            protocol_version: Mutex::new(None),
            device_table: Mutex::new(HashMap::new()),
            pending: Mutex::new(PendingOperations::default()),
            device_notify: Notify::new(),
        });

        let task_shared = Arc::clone(&shared);
        let apply_task = tokio::spawn(async move {
            loop {
                task_shared.device_notify.notified().await;
                manage_devices(&task_shared);
            }
        });

        Self { shared, apply_task }
    }

    /// Negotiated protocol version, once initialized
    pub fn protocol_version(&self) -> Option<u8> {
        *self.shared.protocol_version.lock()
    }

    /// Devices currently alive, by DVC name
    pub fn device_count(&self) -> usize {
        self.shared.device_table.lock().len()
    }

    /// Synthesize a device removal after a device-level error
    pub fn notify_device_error(&self, dvc_name: &[u8]) {
        let mut pending = self.shared.pending.lock();
        pending.to_add.remove(dvc_name);
        pending.to_remove.insert(dvc_name.to_vec(), ());
        drop(pending);

        self.shared.device_notify.notify_one();
    }

    /// Apply pending device operations synchronously
    ///
    /// Test hook; production applications run on the apply task.
    pub fn apply_pending_device_operations(&self) {
        manage_devices(&self.shared);
    }

    /// Dispatch one message from the peer
    pub fn handle_message(&self, message: CamMessage) -> Result<()> {
        match message.pdu {
            CamPdu::SelectVersionRequest => self.handle_select_version(message.version),
            CamPdu::DeviceAddedNotification {
                device_name,
                virtual_channel_name,
            } => self.handle_device_added(device_name, virtual_channel_name),
            CamPdu::DeviceRemovedNotification { virtual_channel_name } => {
                self.handle_device_removed(virtual_channel_name)
            }
            other => {
                warn!("Unexpected enumerator message: {other:?}");
                Ok(())
            }
        }
    }

    fn handle_select_version(&self, peer_version: u8) -> Result<()> {
        let mut version = self.shared.protocol_version.lock();
        if version.is_some() {
            drop(version);
            warn!("Protocol violation: received version request, but protocol is already initialized");
            (self.shared.on_teardown)();
            return Err(CameraError::ProtocolViolation(
                "duplicate SelectVersionRequest".into(),
            ));
        }

        let selected = SERVER_VERSION.min(peer_version);
        debug!("Client supports protocol version {peer_version}; selecting {selected}");
        *version = Some(selected);
        drop(version);

        self.shared.sink.lock().send(CamMessage {
            version: selected,
            pdu: CamPdu::SelectVersionResponse,
        })
    }

    fn ensure_initialized(&self) -> Result<u8> {
        match *self.shared.protocol_version.lock() {
            Some(version) => Ok(version),
            None => {
                warn!("Protocol violation: device notification before version negotiation");
                (self.shared.on_teardown)();
                Err(CameraError::ProtocolViolation(
                    "no protocol version negotiated".into(),
                ))
            }
        }
    }

    fn handle_device_added(&self, device_name: String, dvc_name: Vec<u8>) -> Result<()> {
        self.ensure_initialized()?;

        // the DVC name is bounded in bytes, not characters
        if dvc_name.len() > MAX_DVC_NAME_LEN {
            warn!("Protocol violation: client tried to use too long DVC name. Ignoring announced camera device");
            return Ok(());
        }
        if is_vc_name_reserved(&dvc_name) {
            warn!(
                "Client tried to use reserved DVC name \"{}\". Ignoring announced camera device",
                String::from_utf8_lossy(&dvc_name)
            );
            return Ok(());
        }

        debug!(
            "Client announced camera device: DeviceName: \"{}\", DVC name: \"{}\"",
            device_name,
            String::from_utf8_lossy(&dvc_name)
        );

        let mut pending = self.shared.pending.lock();
        pending.to_remove.remove(&dvc_name);
        pending.to_add.insert(dvc_name, DeviceInfo { device_name });
        drop(pending);

        self.shared.device_notify.notify_one();
        Ok(())
    }

    fn handle_device_removed(&self, dvc_name: Vec<u8>) -> Result<()> {
        self.ensure_initialized()?;

        if dvc_name.len() > MAX_DVC_NAME_LEN {
            warn!("Protocol violation: client tried to use too long DVC name. Ignoring announced camera device");
            return Ok(());
        }

        debug!(
            "Client removed camera device (channel name: \"{}\")",
            String::from_utf8_lossy(&dvc_name)
        );

        let mut pending = self.shared.pending.lock();
        pending.to_add.remove(&dvc_name);
        pending.to_remove.insert(dvc_name, ());
        drop(pending);

        self.shared.device_notify.notify_one();
        Ok(())
    }
}

impl Drop for CameraEnumerator {
    fn drop(&mut self) {
        self.apply_task.abort();
    }
}

fn manage_devices(shared: &Arc<EnumeratorShared>) {
    let (to_remove, to_add) = {
        let mut pending = shared.pending.lock();
        let to_remove: Vec<Vec<u8>> = pending.to_remove.drain().map(|(name, ())| name).collect();
        let to_add: Vec<(Vec<u8>, DeviceInfo)> = pending.to_add.drain().collect();
        (to_remove, to_add)
    };

    for dvc_name in to_remove {
        if shared.device_table.lock().remove(&dvc_name).is_some() {
            info!(
                "Removed camera device (channel \"{}\")",
                String::from_utf8_lossy(&dvc_name)
            );
        }
    }

    let protocol_version = shared
        .protocol_version
        .lock()
        .expect("devices are only queued after negotiation");

    for (dvc_name, info) in to_add {
        // the camera may be re-added by the client
        shared.device_table.lock().remove(&dvc_name);

        let device = shared.factory.lock().create_device(
            &dvc_name,
            &info.device_name,
            protocol_version,
        );
        let Some(device) = device else {
            continue;
        };

        shared.device_table.lock().insert(dvc_name, device);
    }
}
