use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};

use byteorder::{BigEndian, ByteOrder};
use wire::Message;

// Generous ceiling on one frame; anything bigger is garbage on the stream.
const MAX_FRAME: usize = 8 * 1024 * 1024;

/// Blocking duplex message stream over one TCP connection. Exactly one
/// reader task owns the receiving half (via `try_clone`); writes may come
/// from any task but must be serialized by the caller's lock.
pub struct Connection {
    stream: TcpStream,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        Connection { stream }
    }

    /// Second handle onto the same socket, for the reader loop.
    pub fn try_clone(&self) -> std::io::Result<Connection> {
        Ok(Connection {
            stream: self.stream.try_clone()?,
        })
    }

    /// Writes one whole frame. Atomic per message as long as writers are
    /// serialized.
    pub fn send(&mut self, message: &Message) -> Result<(), ConnectionError> {
        self.stream
            .write_all(&message.encode())
            .map_err(ConnectionError::SendFailed)
    }

    /// Blocks until the next complete message arrives. `Ok(None)` means the
    /// stream closed cleanly at a frame boundary.
    pub fn receive(&mut self) -> Result<Option<Message>, ConnectionError> {
        let mut len_buf = [0u8; 4];
        match self.stream.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(ConnectionError::RecvFailed(e)),
        }
        let length = BigEndian::read_u32(&len_buf) as usize;
        if length == 0 || length > MAX_FRAME {
            return Err(ConnectionError::FrameTooLarge(length));
        }
        let mut body = vec![0u8; length];
        self.stream
            .read_exact(&mut body)
            .map_err(ConnectionError::RecvFailed)?;
        let message = Message::from_parts(body[0], &body[1..])?;
        Ok(Some(message))
    }

    /// Idempotent; also unblocks a reader parked in `receive`.
    pub fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Send failed on connection.")]
    SendFailed(#[source] std::io::Error),
    #[error("Receive failed on connection.")]
    RecvFailed(#[source] std::io::Error),
    #[error("Frame of {0} bytes is outside the allowed range.")]
    FrameTooLarge(usize),
    #[error("Malformed frame on connection.")]
    Frame(#[from] wire::WireError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Duration;

    fn loopback_pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        for stream in [&client, &server] {
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
        }
        (Connection::new(client), Connection::new(server))
    }

    #[test]
    fn sends_and_receives_messages_in_order() {
        let (mut a, mut b) = loopback_pair();
        a.send(&Message::Interested).unwrap();
        a.send(&Message::Have(7)).unwrap();
        a.send(&Message::Piece {
            index: 1,
            data: vec![9, 9],
        })
        .unwrap();

        assert_eq!(b.receive().unwrap(), Some(Message::Interested));
        assert_eq!(b.receive().unwrap(), Some(Message::Have(7)));
        assert_eq!(
            b.receive().unwrap(),
            Some(Message::Piece {
                index: 1,
                data: vec![9, 9]
            })
        );
    }

    #[test]
    fn clean_close_yields_sentinel() {
        let (a, mut b) = loopback_pair();
        a.close();
        drop(a);
        assert!(b.receive().unwrap().is_none());
    }

    #[test]
    fn close_is_idempotent() {
        let (a, _b) = loopback_pair();
        a.close();
        a.close();
    }

    #[test]
    fn garbage_type_is_a_frame_error() {
        let (a, mut b) = loopback_pair();
        // length 1, type 8: outside the protocol's 0..=7
        a.stream.try_clone().unwrap().write_all(&[0, 0, 0, 1, 8]).unwrap();
        assert!(matches!(b.receive(), Err(ConnectionError::Frame(_))));
    }

    #[test]
    fn zero_length_frame_is_rejected() {
        let (a, mut b) = loopback_pair();
        a.stream.try_clone().unwrap().write_all(&[0, 0, 0, 0]).unwrap();
        assert!(matches!(b.receive(), Err(ConnectionError::FrameTooLarge(0))));
    }
}
