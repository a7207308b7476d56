// fx-test-utils: Scripted framed peers for integration testing.
//
// A test that exercises the receiver stands in for the streamer application
// (writes requests, reads responses); a test that exercises the sender stands
// in for the game (reads requests, writes responses). Both sides speak the
// NUL-framed JSON wire format via `fx_protocol::PacketCodec`.

use fx_protocol::auth::hash_password;
use fx_protocol::codec::encode_packet;
use fx_protocol::{PacketCodec, PacketType, Request, RequestType, Response};
use futures_util::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::FramedRead;

/// One side of a framed connection, decoding inbound frames as `In`.
pub struct FramedPeer<In> {
    reader: FramedRead<OwnedReadHalf, PacketCodec<In>>,
    writer: OwnedWriteHalf,
}

/// Test double for the streamer application: writes requests, reads responses.
pub type SenderPeer = FramedPeer<Response>;

/// Test double for the game: reads requests, writes responses.
pub type ReceiverPeer = FramedPeer<Request>;

impl<In: DeserializeOwned> FramedPeer<In> {
    pub fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        FramedPeer {
            reader: FramedRead::new(read_half, PacketCodec::new()),
            writer: write_half,
        }
    }

    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        Ok(Self::new(TcpStream::connect(addr).await?))
    }

    pub async fn send<Out: Serialize>(&mut self, packet: &Out) -> std::io::Result<()> {
        let bytes = encode_packet(packet).expect("test packets serialize");
        self.writer.write_all(&bytes).await
    }

    /// Write raw bytes, framing included; for malformed-input tests.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("raw write");
    }

    /// Next well-formed inbound packet; bad frames are skipped, `None` means
    /// the peer closed the connection.
    pub async fn recv(&mut self) -> Option<In> {
        loop {
            match self.reader.next().await? {
                Ok(Ok(packet)) => return Some(packet),
                Ok(Err(_bad_frame)) => continue,
                Err(_io) => return None,
            }
        }
    }

    /// Like [`recv`](Self::recv) but panics after five seconds or on EOF, for
    /// tests that require a reply.
    pub async fn expect(&mut self) -> In {
        tokio::time::timeout(Duration::from_secs(5), self.recv())
            .await
            .expect("timed out waiting for a packet")
            .expect("peer closed the connection")
    }

    /// Half-close the write side, signalling EOF to the peer.
    pub async fn shutdown_write(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

impl SenderPeer {
    /// Drive the password handshake from the sender side: await the LOGIN
    /// challenge, answer with the hashed password, await LOGIN_SUCCESS.
    pub async fn login(&mut self, password: &str) {
        let challenge = self.expect().await;
        assert_eq!(challenge.packet, PacketType::Login, "expected a LOGIN challenge");
        let reply = Request::builder(RequestType::Login)
            .password(hash_password(password))
            .build()
            .unwrap();
        self.send(&reply).await.unwrap();
        let ack = self.expect().await;
        assert_eq!(ack.packet, PacketType::LoginSuccess, "login was not accepted");
    }
}

/// Bind a listener on an ephemeral loopback port.
pub async fn bind_ephemeral() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    (listener, addr)
}
