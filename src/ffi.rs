//! The exported pull API.
//!
//! An out-of-process or foreign reader calls `stackshot_read_thread_samples` on its own schedule.
//! The exchange it drains has to be installed first; until then, and after `uninstall`, every
//! call returns 0.

use std::slice;
use std::sync::Arc;

use parking_lot::{const_rwlock, RwLock};

use crate::exchange::BufferExchange;

static INSTALLED: RwLock<Option<Arc<BufferExchange>>> = const_rwlock(None);

/// Makes `exchange` the one drained by the exported function. Returns the one it replaces.
pub fn install(exchange: Arc<BufferExchange>) -> Option<Arc<BufferExchange>> {
    INSTALLED.write().replace(exchange)
}

pub fn uninstall() -> Option<Arc<BufferExchange>> {
    INSTALLED.write().take()
}

/// Uninstalls `exchange` only if it is the one currently installed. Returns whether it was.
pub fn uninstall_if(exchange: &Arc<BufferExchange>) -> bool {
    let mut installed = INSTALLED.write();
    let ours = installed
        .as_ref()
        .map_or(false, |current| Arc::ptr_eq(current, exchange));
    if ours {
        *installed = None;
    }
    ours
}

pub fn installed() -> Option<Arc<BufferExchange>> {
    INSTALLED.read().clone()
}

/// Copies one pending capture into `buf` and returns its length.
///
/// Returns 0 if nothing is pending, or if the capture is longer than `len`, in which case the
/// capture is discarded.
///
/// # Safety
///
/// `buf` must be null or valid for writes of `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn stackshot_read_thread_samples(len: i32, buf: *mut u8) -> i32 {
    let exchange = match installed() {
        Some(exchange) => exchange,
        None => return 0,
    };
    let mut empty = [0u8; 0];
    let destination: &mut [u8] = if buf.is_null() || len <= 0 {
        &mut empty
    } else {
        slice::from_raw_parts_mut(buf, len as usize)
    };
    exchange.consume_one(destination) as i32
}
