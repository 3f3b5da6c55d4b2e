// Minimal KDMAPI (OmniMIDI) binding, loaded at runtime.
// Missing entry points are tolerated; calls to them do nothing.

use lazy_static::lazy_static;
use libloading::{Error, Library, Symbol};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::SinkError;

/// The dynamic bindings for KDMAPI
pub struct KDMAPIBinds {
    is_kdmapi_available: Option<Symbol<'static, unsafe extern "C" fn() -> bool>>,
    initialize_kdmapi_stream: Option<Symbol<'static, unsafe extern "C" fn() -> i32>>,
    terminate_kdmapi_stream: Option<Symbol<'static, unsafe extern "C" fn() -> i32>>,
    reset_kdmapi_stream: Option<Symbol<'static, unsafe extern "C" fn()>>,
    send_direct_data: Option<Symbol<'static, unsafe extern "C" fn(u32) -> u32>>,

    is_stream_open: AtomicBool,
}

impl KDMAPIBinds {
    /// Calls `IsKDMAPIAvailable`
    pub fn is_kdmapi_available(&self) -> bool {
        unsafe { self.is_kdmapi_available.as_ref().is_some_and(|f| f()) }
    }

    /// Calls `InitializeKDMAPIStream`. The stream is terminated on drop.
    ///
    /// Only one stream may be open at a time.
    pub fn open_stream(&'static self) -> Result<KDMAPIStream, SinkError> {
        if self.is_stream_open.swap(true, Ordering::AcqRel) {
            return Err(SinkError::Unavailable("KDMAPI stream is already open".into()));
        }
        let result = unsafe { self.initialize_kdmapi_stream.as_ref().map_or(0, |f| f()) };
        if result == 0 {
            self.is_stream_open.store(false, Ordering::Release);
            Err(SinkError::Unavailable(
                "Failed to initialize KDMAPI stream or function not found".into(),
            ))
        } else {
            Ok(KDMAPIStream { binds: self })
        }
    }
}

fn load_kdmapi_lib() -> Result<Library, Error> {
    unsafe {
        #[cfg(target_os = "windows")]
        {
            if let Ok(lib) = Library::new("OmniMIDI\\OmniMIDI") {
                return Ok(lib);
            }
            return Library::new("OmniMIDI");
        }
        #[cfg(target_os = "macos")]
        return Library::new("libOmniMIDI.dylib");
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        return Library::new("libOmniMIDI.so");
    }
}

fn load_kdmapi_binds(lib: &'static Result<Library, Error>) -> Result<KDMAPIBinds, String> {
    let lib = lib.as_ref().map_err(|err| err.to_string())?;
    unsafe {
        Ok(KDMAPIBinds {
            is_kdmapi_available: lib.get(b"IsKDMAPIAvailable").ok(),
            initialize_kdmapi_stream: lib.get(b"InitializeKDMAPIStream").ok(),
            terminate_kdmapi_stream: lib.get(b"TerminateKDMAPIStream").ok(),
            reset_kdmapi_stream: lib.get(b"ResetKDMAPIStream").ok(),
            send_direct_data: lib.get(b"SendDirectData").ok(),
            is_stream_open: AtomicBool::new(false),
        })
    }
}

/// An open KDMAPI stream.
///
/// Automatically calls `TerminateKDMAPIStream` when dropped.
pub struct KDMAPIStream {
    binds: &'static KDMAPIBinds,
}

impl KDMAPIStream {
    /// Calls `ResetKDMAPIStream`
    pub fn reset(&self) {
        unsafe {
            if let Some(f) = self.binds.reset_kdmapi_stream.as_ref() {
                f();
            }
        }
    }

    /// Calls `SendDirectData` with a packed short message.
    pub fn send_direct_data(&self, data: u32) -> u32 {
        unsafe { self.binds.send_direct_data.as_ref().map_or(0, |f| f(data)) }
    }
}

impl Drop for KDMAPIStream {
    fn drop(&mut self) {
        unsafe {
            if let Some(f) = self.binds.terminate_kdmapi_stream.as_ref() {
                f();
            }
        }
        self.binds.is_stream_open.store(false, Ordering::Release);
    }
}

lazy_static! {
    static ref KDMAPI_LIB: Result<Library, Error> = load_kdmapi_lib();

    /// The dynamic library for KDMAPI. Is loaded when this field is accessed.
    pub static ref KDMAPI: Result<KDMAPIBinds, String> = load_kdmapi_binds(&KDMAPI_LIB);
}
