//! Client connection handling.

use super::dispatch::Dispatcher;
use crate::daemon::protocol::{read_frame, write_message, ProtocolError, Request, Response};
use std::io::ErrorKind;
use std::os::unix::net::UnixStream;
use std::time::Duration;
use tracing::{debug, warn};

/// Serve request/response pairs on one connection until the peer hangs up,
/// goes idle past `timeout`, or sends something that is not a valid frame.
pub fn handle_connection(
    mut stream: UnixStream,
    dispatcher: Dispatcher,
    timeout: Duration,
) -> Result<(), ProtocolError> {
    // Accepted sockets can inherit the listener's non-blocking flag
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    loop {
        let body = match read_frame(&mut stream) {
            Ok(body) => body,
            Err(ProtocolError::Closed) => return Ok(()),
            Err(ProtocolError::Io(e))
                if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                debug!("Connection idle timeout");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // A body that is not JSON at all is a framing error and closes the
        // connection; well-formed JSON that is not a valid request is answered.
        let value: serde_json::Value = serde_json::from_slice(&body)?;
        let response = match Request::from_value(value) {
            Ok(request) => {
                debug!(command = request.name(), "Request received");
                dispatcher.dispatch(request)
            }
            Err(e) => {
                warn!("Invalid request: {e}");
                Response::failure(e.to_string())
            }
        };

        write_message(&mut stream, &response)?;
    }
}
