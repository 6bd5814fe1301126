//! Scripted fake server.
//!
//! The test drives the server side by hand: accept a connection, accept the
//! streams the client opens, read what it sent, and answer with whatever
//! frames the scenario needs.

use leapbrush_client::loopback::{
    MemoryConnector, MemoryListener, MemoryPeer, PeerStream, memory_transport,
};
use leapbrush_proto::{
    CodecError, Payload, ProtocolError, codec,
    payloads::{
        call::{Method, Status},
        device::{RegisterDeviceRequest, UpdateDeviceRequest},
        state::ServerStateResponse,
    },
};
use tokio::io::AsyncWriteExt;

/// Listener half of a scripted server.
#[derive(Debug)]
pub struct FakeServer {
    listener: MemoryListener,
}

impl FakeServer {
    /// Create a server and the connector clients use to reach it.
    #[must_use]
    pub fn new() -> (MemoryConnector, Self) {
        let (connector, listener) = memory_transport();
        (connector, Self { listener })
    }

    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> Option<FakePeer> {
        self.listener.accept().await.map(|peer| FakePeer { peer })
    }
}

/// One client connection. Dropping it drops the connection.
#[derive(Debug)]
pub struct FakePeer {
    peer: MemoryPeer,
}

impl FakePeer {
    /// Accept the next stream and read its opening `Call`.
    ///
    /// Returns `Ok(None)` once the client closed the connection.
    ///
    /// # Errors
    ///
    /// `CodecError` if the stream does not start with a `Call` frame.
    pub async fn next_stream(&mut self) -> Result<Option<FakeStream>, CodecError> {
        let Some((send, mut recv)) = self.peer.accept_bi().await else {
            return Ok(None);
        };
        let method = match codec::read_payload(&mut recv).await? {
            Some(Payload::Call(call)) => call.method,
            Some(other) => return Err(unexpected("Call", &other)),
            None => return Err(finished_early()),
        };
        Ok(Some(FakeStream { method, io: (send, recv) }))
    }

    /// Drop the connection without finishing any stream.
    pub fn drop_connection(self) {
        tracing::debug!("fake server dropping connection");
    }
}

/// Server side of one stream.
#[derive(Debug)]
pub struct FakeStream {
    method: Method,
    io: PeerStream,
}

impl FakeStream {
    /// Method named in the opening `Call`.
    #[must_use]
    pub fn method(&self) -> Method {
        self.method
    }

    /// Read the next frame. `None` once the client finished its half.
    ///
    /// # Errors
    ///
    /// `CodecError` for a broken stream.
    pub async fn read(&mut self) -> Result<Option<Payload>, CodecError> {
        codec::read_payload(&mut self.io.1).await
    }

    /// Read `UpdateDevice` frames until the client finishes its half.
    ///
    /// # Errors
    ///
    /// `CodecError` for a broken stream or any other frame.
    pub async fn read_updates(&mut self) -> Result<Vec<UpdateDeviceRequest>, CodecError> {
        let mut updates = Vec::new();
        while let Some(payload) = self.read().await? {
            match payload {
                Payload::UpdateDevice(update) => updates.push(update),
                other => return Err(unexpected("UpdateDevice", &other)),
            }
        }
        Ok(updates)
    }

    /// Read the registration of a `RegisterAndListen` stream.
    ///
    /// # Errors
    ///
    /// `CodecError` for a broken stream or any other frame.
    pub async fn read_register(&mut self) -> Result<RegisterDeviceRequest, CodecError> {
        match self.read().await? {
            Some(Payload::RegisterDevice(request)) => Ok(request),
            Some(other) => Err(unexpected("RegisterDevice", &other)),
            None => Err(finished_early()),
        }
    }

    /// Send one frame.
    ///
    /// # Errors
    ///
    /// `CodecError` if the client is gone.
    pub async fn send(&mut self, payload: Payload) -> Result<(), CodecError> {
        codec::write_payload(&mut self.io.0, payload).await
    }

    /// Send one snapshot.
    ///
    /// # Errors
    ///
    /// `CodecError` if the client is gone.
    pub async fn send_snapshot(&mut self, snapshot: ServerStateResponse) -> Result<(), CodecError> {
        self.send(Payload::ServerState(snapshot)).await
    }

    /// Send the trailer and finish the stream.
    ///
    /// # Errors
    ///
    /// `CodecError` if the client is gone.
    pub async fn finish(mut self, status: Status) -> Result<(), CodecError> {
        self.send(Payload::Status(status)).await?;
        self.io.0.shutdown().await?;
        Ok(())
    }
}

fn unexpected(expected: &'static str, actual: &Payload) -> CodecError {
    ProtocolError::UnexpectedFrame { expected, actual: actual.opcode() }.into()
}

fn finished_early() -> CodecError {
    std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into()
}
