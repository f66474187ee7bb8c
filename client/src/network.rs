//! Connection handling for the bot: handshake, login and packet exchange
//! over any async byte stream.

use crate::game::{PlayerView, ViewError};
use log::{debug, info};
use shared::protocol::{
    encode_base37, encode_frame, incoming, outgoing_size, status, PacketSize, BLOCK_MAGIC,
    CRC_COUNT, HANDSHAKE_OPCODE, HANDSHAKE_REPLY_LEN, LOGIN_MAGIC, LOGIN_NEW, LOGIN_RECONNECT,
    REVISION,
};
use shared::{Buffer, Frame, FrameDecoder, FrameError, IsaacCipher};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("server refused the connection with status {0}")]
    Rejected(u8),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    View(#[from] ViewError),
    #[error("server closed the connection")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub seeds: [u32; 4],
    pub uid: u32,
    pub low_memory: bool,
    pub reconnecting: bool,
}

impl Credentials {
    /// Credentials with random cipher seeds.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            seeds: rand::random(),
            uid: rand::random(),
            low_memory: false,
            reconnecting: false,
        }
    }
}

pub fn name_hash(username: &str) -> u8 {
    (encode_base37(username) >> 16 & 31) as u8
}

/// The login message with an unenciphered block.
pub fn encode_login(credentials: &Credentials) -> Vec<u8> {
    let mut block = Buffer::new();
    block.put_u8(BLOCK_MAGIC);
    for &seed in &credentials.seeds {
        block.put_u32(seed);
    }
    block.put_u32(credentials.uid);
    block.put_string(&credentials.username);
    block.put_string(&credentials.password);

    let mut body = Buffer::new();
    body.put_u8(LOGIN_MAGIC);
    body.put_u16(REVISION);
    body.put_u8(credentials.low_memory as u8);
    for _ in 0..CRC_COUNT {
        body.put_u32(0);
    }
    body.put_u8(block.len() as u8);
    body.put_bytes(block.as_bytes());

    let mut message = Buffer::new();
    message.put_u8(if credentials.reconnecting {
        LOGIN_RECONNECT
    } else {
        LOGIN_NEW
    });
    message.put_u8(body.len() as u8);
    message.put_bytes(body.as_bytes());
    message.into_inner()
}

/// Reassembles server frames from raw bytes.
#[derive(Debug)]
pub struct Inbox {
    decoder: FrameDecoder,
    pending: Vec<u8>,
}

impl Inbox {
    pub fn new(seeds: &[u32; 4]) -> Self {
        Self {
            decoder: FrameDecoder::with_sizes(IsaacCipher::outbound(seeds), outgoing_size)
                .with_capacity(u16::MAX as usize + 3),
            pending: Vec::new(),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let Some((frame, used)) = self.decoder.decode(&self.pending)? else {
            return Ok(None);
        };
        self.pending.drain(..used);
        Ok(Some(frame))
    }
}

/// Packets a client sends once logged in.
#[derive(Debug)]
pub struct Outbox {
    cipher: IsaacCipher,
}

impl Outbox {
    pub fn new(seeds: &[u32; 4]) -> Self {
        Self {
            cipher: IsaacCipher::new(seeds),
        }
    }

    pub fn ping(&mut self) -> Result<Vec<u8>, FrameError> {
        self.frame(incoming::PING, PacketSize::Fixed(0), &[])
    }

    pub fn logout(&mut self) -> Result<Vec<u8>, FrameError> {
        self.frame(incoming::LOGOUT, PacketSize::Fixed(0), &[])
    }

    /// Walk request through `points`, given in absolute coordinates.
    pub fn walk(&mut self, points: &[(i32, i32)], run: bool) -> Result<Vec<u8>, FrameError> {
        let Some(&(first_x, first_y)) = points.first() else {
            return Ok(Vec::new());
        };
        let mut payload = Buffer::new();
        payload.put_u16_le_add(first_x as u16);
        for &(x, y) in &points[1..] {
            payload.put_i8((x - first_x) as i8);
            payload.put_i8((y - first_y) as i8);
        }
        payload.put_u16_le(first_y as u16);
        payload.put_u8_neg(run as u8);
        self.frame(incoming::WALK, PacketSize::VarByte, payload.as_bytes())
    }

    pub fn chat(&mut self, effect: u8, color: u8, text: &[u8]) -> Result<Vec<u8>, FrameError> {
        let mut payload = Buffer::new();
        payload.put_u8_sub(effect);
        payload.put_u8_sub(color);
        for &byte in text.iter().rev() {
            payload.put_u8_add(byte);
        }
        self.frame(incoming::CHAT, PacketSize::VarByte, payload.as_bytes())
    }

    pub fn command(&mut self, command: &str) -> Result<Vec<u8>, FrameError> {
        let mut payload = Buffer::new();
        payload.put_string(command);
        self.frame(incoming::COMMAND, PacketSize::VarByte, payload.as_bytes())
    }

    fn frame(&mut self, opcode: u8, size: PacketSize, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        let mut out = Buffer::with_capacity(payload.len() + 2);
        encode_frame(&mut out, &mut self.cipher, opcode, size, payload)?;
        Ok(out.into_inner())
    }
}

/// A logged-in bot over any byte stream.
pub struct Bot<S> {
    stream: S,
    inbox: Inbox,
    outbox: Outbox,
    pub view: PlayerView,
    pub username: String,
    pub rights: u8,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Bot<S> {
    /// Runs the handshake and login on `stream`.
    pub async fn login(mut stream: S, credentials: &Credentials) -> Result<Self, ClientError> {
        stream
            .write_all(&[HANDSHAKE_OPCODE, name_hash(&credentials.username)])
            .await?;
        let mut reply = [0u8; HANDSHAKE_REPLY_LEN];
        stream.read_exact(&mut reply).await?;
        let code = reply[HANDSHAKE_REPLY_LEN - 1];
        if code != status::CONTINUE {
            return Err(ClientError::Rejected(code));
        }
        let session_key = stream.read_u64().await?;
        debug!("Session key {:#x}", session_key);

        stream.write_all(&encode_login(credentials)).await?;
        let code = stream.read_u8().await?;
        if code != status::LOGIN_OK {
            return Err(ClientError::Rejected(code));
        }
        let rights = stream.read_u8().await?;
        let _flagged = stream.read_u8().await?;
        info!("{} logged in with rights {}", credentials.username, rights);

        Ok(Self {
            stream,
            inbox: Inbox::new(&credentials.seeds),
            outbox: Outbox::new(&credentials.seeds),
            view: PlayerView::new(),
            username: credentials.username.clone(),
            rights,
        })
    }

    pub async fn ping(&mut self) -> Result<(), ClientError> {
        let bytes = self.outbox.ping()?;
        self.send(&bytes).await
    }

    pub async fn walk(&mut self, points: &[(i32, i32)], run: bool) -> Result<(), ClientError> {
        let bytes = self.outbox.walk(points, run)?;
        self.send(&bytes).await
    }

    pub async fn chat(&mut self, text: &[u8]) -> Result<(), ClientError> {
        let bytes = self.outbox.chat(0, 0, text)?;
        self.send(&bytes).await
    }

    pub async fn command(&mut self, command: &str) -> Result<(), ClientError> {
        let bytes = self.outbox.command(command)?;
        self.send(&bytes).await
    }

    pub async fn logout(&mut self) -> Result<(), ClientError> {
        let bytes = self.outbox.logout()?;
        self.send(&bytes).await
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads until one frame is complete and applies it to the view.
    pub async fn next_frame(&mut self) -> Result<Frame, ClientError> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(frame) = self.inbox.next_frame()? {
                self.view.handle(&frame)?;
                return Ok(frame);
            }
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                return Err(ClientError::Closed);
            }
            self.inbox.push(&chunk[..read]);
        }
    }

    /// Reads frames until the view has processed `count` more player updates.
    pub async fn wait_updates(&mut self, count: u64) -> Result<(), ClientError> {
        let target = self.view.updates + count;
        while self.view.updates < target {
            self.next_frame().await?;
        }
        Ok(())
    }
}
