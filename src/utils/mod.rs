mod framing;

pub use framing::{frame_rfc4571, Rfc4571Deframer, RFC4571_MAX_FRAME_LEN};

use std::sync::{Mutex, MutexGuard};

/// Smallest buffer size [set_max_buffer_size] falls back to.
pub const MIN_SOCKET_BUFFER_SIZE: usize = 16 * 1024;

/// Enlarge the receive (`send == false`) or send buffer of `socket` to `size` bytes.
///
/// A size the OS rejects as invalid is halved until one is accepted. Returns the
/// accepted size. Fails if even [MIN_SOCKET_BUFFER_SIZE] is rejected or `size`
/// is below it.
pub fn set_max_buffer_size(
    socket: &socket2::Socket,
    send: bool,
    size: usize,
) -> std::io::Result<usize> {
    let apply = |buf_size| {
        if send {
            socket.set_send_buffer_size(buf_size)
        } else {
            socket.set_recv_buffer_size(buf_size)
        }
    };
    let mut buf_size = size;
    while buf_size >= MIN_SOCKET_BUFFER_SIZE {
        match apply(buf_size) {
            Ok(()) => return Ok(buf_size),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => buf_size /= 2,
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!(
            "no {} buffer size between {} and {} bytes accepted",
            if send { "send" } else { "recv" },
            MIN_SOCKET_BUFFER_SIZE,
            size
        ),
    ))
}

/// Lock a mutex even if another thread panicked while holding it.
///
/// The data protected here (counters, timestamp log, sink) stays usable after a
/// worker panic, we only lose the entry that was in flight.
pub fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
