//! Vendor SDK loaded from a shared library.
//!
//! The vendor library exports a flat C ABI (`muse_sdk_*`). Every status call
//! takes a caller-owned error buffer and returns `0` on success or a negative
//! vendor code. The buffers live in one [`Scratch`] behind a single lock, so
//! native calls are serialized per adapter and messages are copied out before
//! the lock is released.
//!
//! Listeners handed to native code travel as a `user` pointer to a boxed slot
//! owned by [`Pins`]. A slot is released only after the native side confirms
//! it no longer references it (unregister succeeded or it was replaced).

use std::collections::HashMap;
use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use libloading::Library;
use tracing::{debug, info, instrument, trace, warn};

use super::records::decode_device_list;
use super::traits::{
    ConnectionListener, DataListener, DiscoveryListener, ErrorListener, MuseSdk, NativeError,
    RawPacket,
};
use crate::device::DeviceDescriptor;
use crate::protocol::constants::*;
use crate::protocol::{PacketKind, Preset, VendorCode};
use crate::state::ConnectionState;

type ListChangedFn = extern "C" fn(user: *mut c_void);
type ConnectionFn = extern "C" fn(user: *mut c_void, previous: c_int, current: c_int);
type ErrorFn = extern "C" fn(user: *mut c_void, code: c_int, message: *const c_char);
type DataFn = extern "C" fn(
    user: *mut c_void,
    packet_type: c_int,
    values: *const f64,
    len: usize,
    timestamp_us: i64,
);

type StatusFn = unsafe extern "C" fn(err: *mut c_char, err_len: usize) -> c_int;
type AddressFn =
    unsafe extern "C" fn(address: *const c_char, err: *mut c_char, err_len: usize) -> c_int;

/// Function pointers resolved from the library. Valid while `Library` lives.
struct Symbols {
    initialize: StatusFn,
    set_list_changed: unsafe extern "C" fn(
        callback: Option<ListChangedFn>,
        user: *mut c_void,
        err: *mut c_char,
        err_len: usize,
    ) -> c_int,
    start_scanning: StatusFn,
    stop_scanning: StatusFn,
    get_devices:
        unsafe extern "C" fn(buf: *mut u8, buf_len: usize, err: *mut c_char, err_len: usize) -> c_int,
    connect: AddressFn,
    disconnect: AddressFn,
    set_preset: unsafe extern "C" fn(
        address: *const c_char,
        preset: c_int,
        err: *mut c_char,
        err_len: usize,
    ) -> c_int,
    enable_data_transmission: unsafe extern "C" fn(
        address: *const c_char,
        enabled: c_int,
        err: *mut c_char,
        err_len: usize,
    ) -> c_int,
    register_connection_listener: unsafe extern "C" fn(
        address: *const c_char,
        callback: ConnectionFn,
        user: *mut c_void,
        err: *mut c_char,
        err_len: usize,
    ) -> c_int,
    unregister_connection_listener: AddressFn,
    register_error_listener: unsafe extern "C" fn(
        address: *const c_char,
        callback: ErrorFn,
        user: *mut c_void,
        err: *mut c_char,
        err_len: usize,
    ) -> c_int,
    unregister_error_listener: AddressFn,
    register_data_listener: unsafe extern "C" fn(
        address: *const c_char,
        packet_type: c_int,
        callback: DataFn,
        user: *mut c_void,
        err: *mut c_char,
        err_len: usize,
    ) -> c_int,
    unregister_data_listener: unsafe extern "C" fn(
        address: *const c_char,
        packet_type: c_int,
        err: *mut c_char,
        err_len: usize,
    ) -> c_int,
    unregister_all_listeners: AddressFn,
    get_connection_state: AddressFn,
}

fn symbol<T: Copy>(library: &Library, name: &str) -> Result<T, NativeError> {
    // SAFETY: the caller names the exact C signature `T` of the export.
    let sym = unsafe { library.get::<T>(name.as_bytes()) }
        .map_err(|_| NativeError::MissingSymbol(name.to_string()))?;
    Ok(*sym)
}

impl Symbols {
    fn resolve(library: &Library) -> Result<Self, NativeError> {
        Ok(Self {
            initialize: symbol(library, "muse_sdk_initialize")?,
            set_list_changed: symbol(library, "muse_sdk_set_device_list_listener")?,
            start_scanning: symbol(library, "muse_sdk_start_listening")?,
            stop_scanning: symbol(library, "muse_sdk_stop_listening")?,
            get_devices: symbol(library, "muse_sdk_get_devices")?,
            connect: symbol(library, "muse_sdk_connect")?,
            disconnect: symbol(library, "muse_sdk_disconnect")?,
            set_preset: symbol(library, "muse_sdk_set_preset")?,
            enable_data_transmission: symbol(library, "muse_sdk_enable_data_transmission")?,
            register_connection_listener: symbol(library, "muse_sdk_register_connection_listener")?,
            unregister_connection_listener: symbol(
                library,
                "muse_sdk_unregister_connection_listener",
            )?,
            register_error_listener: symbol(library, "muse_sdk_register_error_listener")?,
            unregister_error_listener: symbol(library, "muse_sdk_unregister_error_listener")?,
            register_data_listener: symbol(library, "muse_sdk_register_data_listener")?,
            unregister_data_listener: symbol(library, "muse_sdk_unregister_data_listener")?,
            unregister_all_listeners: symbol(library, "muse_sdk_unregister_all_listeners")?,
            get_connection_state: symbol(library, "muse_sdk_get_connection_state")?,
        })
    }
}

/// Error and device-list buffers shared by every native call.
struct Scratch {
    error: Vec<u8>,
    devices: Vec<u8>,
}

struct ConnectionSlot {
    listener: Arc<dyn ConnectionListener>,
}

struct ErrorSlot {
    listener: Arc<dyn ErrorListener>,
}

struct DataSlot {
    address: String,
    listener: Arc<dyn DataListener>,
}

struct DiscoverySlot {
    listener: Arc<dyn DiscoveryListener>,
}

/// Listener slots currently referenced by native code.
#[derive(Default)]
struct Pins {
    connection: HashMap<String, Box<ConnectionSlot>>,
    error: HashMap<String, Box<ErrorSlot>>,
    data: HashMap<(String, PacketKind), Box<DataSlot>>,
    discovery: Option<Box<DiscoverySlot>>,
}

impl Pins {
    fn addresses(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .connection
            .keys()
            .chain(self.error.keys())
            .chain(self.data.keys().map(|(address, _)| address))
            .cloned()
            .collect();
        out.sort();
        out.dedup();
        out
    }

    fn release_address(&mut self, address: &str) {
        self.connection.remove(address);
        self.error.remove(address);
        self.data.retain(|(a, _), _| a != address);
    }
}

fn user_ptr<T>(slot: &T) -> *mut c_void {
    slot as *const T as *mut c_void
}

extern "C" fn list_changed_trampoline(user: *mut c_void) {
    if user.is_null() {
        return;
    }
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: `user` points at a DiscoverySlot kept alive in `Pins`
        // until native code confirms the listener was replaced.
        let slot = unsafe { &*(user as *const DiscoverySlot) };
        slot.listener.on_device_list_changed();
    }));
    if result.is_err() {
        warn!("Device list listener panicked");
    }
}

extern "C" fn connection_trampoline(user: *mut c_void, previous: c_int, current: c_int) {
    if user.is_null() {
        return;
    }
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: see `list_changed_trampoline`.
        let slot = unsafe { &*(user as *const ConnectionSlot) };
        slot.listener.on_connection_changed(
            ConnectionState::from_code(previous),
            ConnectionState::from_code(current),
        );
    }));
    if result.is_err() {
        warn!("Connection listener panicked");
    }
}

extern "C" fn error_trampoline(user: *mut c_void, code: c_int, message: *const c_char) {
    if user.is_null() {
        return;
    }
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let message = if message.is_null() {
            String::new()
        } else {
            // SAFETY: native code passes a NUL-terminated string valid for
            // the duration of the callback.
            unsafe { CStr::from_ptr(message) }
                .to_string_lossy()
                .into_owned()
        };
        // SAFETY: see `list_changed_trampoline`.
        let slot = unsafe { &*(user as *const ErrorSlot) };
        slot.listener.on_error(NativeError::Vendor {
            operation: "callback",
            code: VendorCode::from_code(code),
            message,
        });
    }));
    if result.is_err() {
        warn!("Error listener panicked");
    }
}

extern "C" fn data_trampoline(
    user: *mut c_void,
    packet_type: c_int,
    values: *const f64,
    len: usize,
    timestamp_us: i64,
) {
    if user.is_null() {
        return;
    }
    let Some(kind) = PacketKind::from_code(packet_type) else {
        trace!(packet_type, "Dropping packet of unknown type");
        return;
    };
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut payload = [0.0f64; PAYLOAD_LEN];
        if !values.is_null() {
            let count = len.min(PAYLOAD_LEN);
            // SAFETY: native code passes `len` readable doubles, valid for
            // the duration of the callback. At most PAYLOAD_LEN are read.
            let src = unsafe { std::slice::from_raw_parts(values, count) };
            payload[..count].copy_from_slice(src);
        }
        // SAFETY: see `list_changed_trampoline`.
        let slot = unsafe { &*(user as *const DataSlot) };
        slot.listener.on_packet(RawPacket {
            kind,
            values: payload,
            timestamp_us,
            source: slot.address.clone(),
        });
    }));
    if result.is_err() {
        warn!(kind = %kind, "Data listener panicked");
    }
}

fn read_message(buf: &[u8]) -> String {
    match CStr::from_bytes_until_nul(buf) {
        Ok(s) => s.to_string_lossy().into_owned(),
        Err(_) => String::from_utf8_lossy(buf).into_owned(),
    }
}

fn c_address(address: &str) -> Result<CString, NativeError> {
    CString::new(address)
        .map_err(|_| NativeError::InvalidArgument(format!("address contains NUL: {:?}", address)))
}

/// [`MuseSdk`] backed by the vendor shared library.
pub struct NativeSdk {
    path: String,
    symbols: Symbols,
    scratch: Mutex<Scratch>,
    pins: Mutex<Pins>,
    initialized: AtomicBool,
    // Dropped last: every function pointer above points into it.
    _library: Library,
}

impl NativeSdk {
    /// Load the library and resolve every export. Does not initialize the SDK.
    #[instrument(level = "info")]
    pub fn load(path: &str) -> Result<Self, NativeError> {
        // SAFETY: loading runs the library's initializers; the vendor SDK
        // has no load-time preconditions.
        let library = unsafe { Library::new(path) }.map_err(|e| NativeError::LibraryLoad {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        let symbols = Symbols::resolve(&library)?;
        info!(path = %path, "Loaded Muse SDK");
        Ok(Self {
            path: path.to_string(),
            symbols,
            scratch: Mutex::new(Scratch {
                error: vec![0; MAX_ERR_MSG],
                devices: vec![0; INITIAL_DEVICE_LIST_LEN],
            }),
            pins: Mutex::new(Pins::default()),
            initialized: AtomicBool::new(false),
            _library: library,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn pins(&self) -> MutexGuard<'_, Pins> {
        self.pins.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_initialized(&self) -> Result<(), NativeError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(NativeError::NotInitialized)
        }
    }

    /// Run one native call under the scratch lock and parse its status.
    fn call<F>(&self, operation: &'static str, f: F) -> Result<c_int, NativeError>
    where
        F: FnOnce(&Symbols, *mut c_char, usize) -> c_int,
    {
        let mut scratch = self.scratch.lock().unwrap_or_else(PoisonError::into_inner);
        scratch.error.fill(0);
        let len = scratch.error.len();
        let rc = f(&self.symbols, scratch.error.as_mut_ptr().cast(), len);
        if rc < SDK_OK {
            let message = read_message(&scratch.error);
            debug!(operation, rc, message = %message, "Native call failed");
            return Err(NativeError::Vendor {
                operation,
                code: VendorCode::from_code(rc),
                message,
            });
        }
        Ok(rc)
    }

    fn address_call(
        &self,
        operation: &'static str,
        address: &str,
        f: AddressFn,
    ) -> Result<c_int, NativeError> {
        self.ensure_initialized()?;
        let addr = c_address(address)?;
        // SAFETY: `addr` outlives the call; the error buffer is sized by `len`.
        self.call(operation, |_, err, len| unsafe { f(addr.as_ptr(), err, len) })
    }
}

impl MuseSdk for NativeSdk {
    fn initialize(&self) -> Result<(), NativeError> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        // SAFETY: error buffer pointer/length come from `call`.
        self.call("initialize", |s, err, len| unsafe { (s.initialize)(err, len) })
            .map_err(|e| NativeError::InitFailed {
                message: e.to_string(),
            })?;
        self.initialized.store(true, Ordering::Release);
        info!("Muse SDK initialized");
        Ok(())
    }

    fn set_discovery_listener(
        &self,
        listener: Option<Arc<dyn DiscoveryListener>>,
    ) -> Result<(), NativeError> {
        self.ensure_initialized()?;
        let mut pins = self.pins();
        match listener {
            Some(listener) => {
                let slot = Box::new(DiscoverySlot { listener });
                let user = user_ptr(&*slot);
                // SAFETY: `slot` is pinned in `pins` below for as long as
                // native code may call back with `user`.
                self.call("set_device_list_listener", |s, err, len| unsafe {
                    (s.set_list_changed)(Some(list_changed_trampoline), user, err, len)
                })?;
                pins.discovery = Some(slot);
            }
            None => {
                // SAFETY: clearing the callback; no pointer is retained.
                self.call("set_device_list_listener", |s, err, len| unsafe {
                    (s.set_list_changed)(None, std::ptr::null_mut(), err, len)
                })?;
                pins.discovery = None;
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    fn start_scanning(&self) -> Result<(), NativeError> {
        self.ensure_initialized()?;
        // SAFETY: error buffer pointer/length come from `call`.
        self.call("start_scanning", |s, err, len| unsafe { (s.start_scanning)(err, len) })?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn stop_scanning(&self) -> Result<(), NativeError> {
        self.ensure_initialized()?;
        // SAFETY: error buffer pointer/length come from `call`.
        self.call("stop_scanning", |s, err, len| unsafe { (s.stop_scanning)(err, len) })?;
        Ok(())
    }

    fn discovered_devices(&self) -> Result<Vec<DeviceDescriptor>, NativeError> {
        self.ensure_initialized()?;
        let mut scratch = self.scratch.lock().unwrap_or_else(PoisonError::into_inner);
        let mut wanted = scratch.devices.len().max(INITIAL_DEVICE_LIST_LEN);

        for _ in 0..=MAX_DEVICE_LIST_GROWTHS {
            let Scratch { error, devices } = &mut *scratch;
            devices.resize(wanted, 0);
            error.fill(0);
            // SAFETY: both buffers are owned by `scratch` and sized by the
            // lengths passed alongside them.
            let rc = unsafe {
                (self.symbols.get_devices)(
                    devices.as_mut_ptr(),
                    devices.len(),
                    error.as_mut_ptr().cast(),
                    error.len(),
                )
            };
            if rc == SDK_OK {
                return decode_device_list(devices);
            }
            if rc < SDK_OK {
                return Err(NativeError::Vendor {
                    operation: "get_devices",
                    code: VendorCode::from_code(rc),
                    message: read_message(error),
                });
            }
            // Positive: buffer too small, `rc` is the required size.
            let required = rc as usize;
            wanted = required + required / 2;
            debug!(required, next = wanted, "Device list buffer too small");
        }

        Err(NativeError::MalformedDeviceList(format!(
            "buffer still too small after {} growth steps",
            MAX_DEVICE_LIST_GROWTHS
        )))
    }

    #[instrument(skip(self))]
    fn connect(&self, address: &str) -> Result<(), NativeError> {
        self.address_call("connect", address, self.symbols.connect)?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn disconnect(&self, address: &str) -> Result<(), NativeError> {
        self.address_call("disconnect", address, self.symbols.disconnect)?;
        Ok(())
    }

    fn set_preset(&self, address: &str, preset: Preset) -> Result<(), NativeError> {
        self.ensure_initialized()?;
        let addr = c_address(address)?;
        // SAFETY: `addr` outlives the call.
        self.call("set_preset", |s, err, len| unsafe {
            (s.set_preset)(addr.as_ptr(), preset.code(), err, len)
        })?;
        Ok(())
    }

    fn set_data_transmission(&self, address: &str, enabled: bool) -> Result<(), NativeError> {
        self.ensure_initialized()?;
        let addr = c_address(address)?;
        // SAFETY: `addr` outlives the call.
        self.call("enable_data_transmission", |s, err, len| unsafe {
            (s.enable_data_transmission)(addr.as_ptr(), c_int::from(enabled), err, len)
        })?;
        Ok(())
    }

    fn register_connection_listener(
        &self,
        address: &str,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<(), NativeError> {
        self.ensure_initialized()?;
        let addr = c_address(address)?;
        let mut pins = self.pins();
        let slot = Box::new(ConnectionSlot { listener });
        let user = user_ptr(&*slot);
        // SAFETY: `slot` is pinned below once native code accepts it.
        self.call("register_connection_listener", |s, err, len| unsafe {
            (s.register_connection_listener)(addr.as_ptr(), connection_trampoline, user, err, len)
        })?;
        // Any previous slot for this address was replaced natively.
        pins.connection.insert(address.to_string(), slot);
        Ok(())
    }

    fn unregister_connection_listener(&self, address: &str) -> Result<(), NativeError> {
        let mut pins = self.pins();
        if !pins.connection.contains_key(address) {
            return Ok(());
        }
        self.address_call(
            "unregister_connection_listener",
            address,
            self.symbols.unregister_connection_listener,
        )?;
        pins.connection.remove(address);
        Ok(())
    }

    fn register_error_listener(
        &self,
        address: &str,
        listener: Arc<dyn ErrorListener>,
    ) -> Result<(), NativeError> {
        self.ensure_initialized()?;
        let addr = c_address(address)?;
        let mut pins = self.pins();
        let slot = Box::new(ErrorSlot { listener });
        let user = user_ptr(&*slot);
        // SAFETY: `slot` is pinned below once native code accepts it.
        self.call("register_error_listener", |s, err, len| unsafe {
            (s.register_error_listener)(addr.as_ptr(), error_trampoline, user, err, len)
        })?;
        pins.error.insert(address.to_string(), slot);
        Ok(())
    }

    fn unregister_error_listener(&self, address: &str) -> Result<(), NativeError> {
        let mut pins = self.pins();
        if !pins.error.contains_key(address) {
            return Ok(());
        }
        self.address_call(
            "unregister_error_listener",
            address,
            self.symbols.unregister_error_listener,
        )?;
        pins.error.remove(address);
        Ok(())
    }

    fn register_data_listener(
        &self,
        address: &str,
        kind: PacketKind,
        listener: Arc<dyn DataListener>,
    ) -> Result<(), NativeError> {
        self.ensure_initialized()?;
        let addr = c_address(address)?;
        let mut pins = self.pins();
        let slot = Box::new(DataSlot {
            address: address.to_string(),
            listener,
        });
        let user = user_ptr(&*slot);
        // SAFETY: `slot` is pinned below once native code accepts it.
        self.call("register_data_listener", |s, err, len| unsafe {
            (s.register_data_listener)(addr.as_ptr(), kind.code(), data_trampoline, user, err, len)
        })?;
        pins.data.insert((address.to_string(), kind), slot);
        Ok(())
    }

    fn unregister_data_listener(
        &self,
        address: &str,
        kind: PacketKind,
    ) -> Result<(), NativeError> {
        let key = (address.to_string(), kind);
        let mut pins = self.pins();
        if !pins.data.contains_key(&key) {
            return Ok(());
        }
        self.ensure_initialized()?;
        let addr = c_address(address)?;
        // SAFETY: `addr` outlives the call.
        self.call("unregister_data_listener", |s, err, len| unsafe {
            (s.unregister_data_listener)(addr.as_ptr(), kind.code(), err, len)
        })?;
        pins.data.remove(&key);
        Ok(())
    }

    fn unregister_all_listeners(&self, address: &str) -> Result<(), NativeError> {
        let mut pins = self.pins();
        self.address_call(
            "unregister_all_listeners",
            address,
            self.symbols.unregister_all_listeners,
        )?;
        pins.release_address(address);
        Ok(())
    }

    fn connection_state(&self, address: &str) -> Result<ConnectionState, NativeError> {
        let code = self.address_call(
            "get_connection_state",
            address,
            self.symbols.get_connection_state,
        )?;
        Ok(ConnectionState::from_code(code))
    }
}

impl Drop for NativeSdk {
    fn drop(&mut self) {
        if !self.initialized.load(Ordering::Acquire) {
            return;
        }
        let addresses = self.pins().addresses();
        for address in addresses {
            if let Err(e) = self.unregister_all_listeners(&address) {
                warn!(address = %address, error = %e, "Failed to release listeners on drop");
            }
        }
        let has_discovery = self.pins().discovery.is_some();
        if has_discovery {
            if let Err(e) = self.set_discovery_listener(None) {
                warn!(error = %e, "Failed to clear device list listener on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingData(Mutex<Vec<RawPacket>>);

    impl DataListener for CountingData {
        fn on_packet(&self, packet: RawPacket) {
            self.0.lock().unwrap().push(packet);
        }
    }

    struct PanickingConnection;

    impl ConnectionListener for PanickingConnection {
        fn on_connection_changed(&self, _previous: ConnectionState, _current: ConnectionState) {
            panic!("listener bug");
        }
    }

    #[test]
    fn test_load_missing_library() {
        let err = NativeSdk::load("/nonexistent/libmuse_sdk.so").err().unwrap();
        assert!(matches!(err, NativeError::LibraryLoad { .. }));
    }

    #[test]
    fn test_read_message_stops_at_nul() {
        let mut buf = vec![0u8; 16];
        buf[..5].copy_from_slice(b"oops\0");
        buf[5] = b'x';
        assert_eq!(read_message(&buf), "oops");
        assert_eq!(read_message(b"no terminator"), "no terminator");
    }

    #[test]
    fn test_data_trampoline_copies_bounded_payload() {
        let listener = Arc::new(CountingData(Mutex::new(Vec::new())));
        let slot = Box::new(DataSlot {
            address: "mac1".into(),
            listener: listener.clone(),
        });
        let values = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        data_trampoline(
            user_ptr(&*slot),
            PACKET_EEG,
            values.as_ptr(),
            values.len(),
            42,
        );
        data_trampoline(user_ptr(&*slot), PACKET_BATTERY, values.as_ptr(), 2, 43);
        data_trampoline(user_ptr(&*slot), 99, values.as_ptr(), 6, 44);
        data_trampoline(std::ptr::null_mut(), PACKET_EEG, values.as_ptr(), 6, 45);

        let got = listener.0.lock().unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].values, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(got[0].source, "mac1");
        assert_eq!(got[1].kind, PacketKind::Battery);
        assert_eq!(got[1].values, [1.0, 2.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_connection_trampoline_contains_panic() {
        let slot = Box::new(ConnectionSlot {
            listener: Arc::new(PanickingConnection),
        });
        connection_trampoline(user_ptr(&*slot), CONNECTION_CONNECTING, CONNECTION_CONNECTED);
    }
}
