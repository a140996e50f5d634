//! MySQL client protocol: connection establishment, authentication, and the
//! replication commands.
//!
//! Authentication supports `mysql_native_password` (SHA1 scramble) and
//! `caching_sha2_password` (SHA256 scramble, with the RSA-encrypted full
//! authentication path when the server's cache is cold). The replication
//! session itself is three commands: optional `SET` statements, then
//! `COM_REGISTER_SLAVE`, then `COM_BINLOG_DUMP`, after which the server
//! streams event frames until either side drops the connection.

use crate::client::MasterInfo;
use crate::error::{Error, Result};
use crate::position::BinlogPosition;
use crate::wire::{self, PacketHeader, MAX_PACKET_PAYLOAD, PACKET_HEADER_SIZE};
use bytes::{BufMut, BytesMut};
use rand::rngs::OsRng;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// Deadline for TCP connect plus handshake and authentication.
pub const CONNECT_TIMEOUT_SECS: u64 = 10;
/// Deadline for a command/response round trip. Binlog dump reads are
/// exempt: an idle primary legitimately sends nothing for hours.
pub const COMMAND_TIMEOUT_SECS: u64 = 30;

const COM_QUERY: u8 = 0x03;
const COM_BINLOG_DUMP: u8 = 0x12;
const COM_REGISTER_SLAVE: u8 = 0x15;

/// Server error that means the requested binlog position is gone.
const ER_MASTER_FATAL_ERROR_READING_BINLOG: u16 = 1236;

const UTF8MB4_GENERAL_CI: u8 = 45;

/// Client capability bits sent in the handshake response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityFlags(u32);

impl CapabilityFlags {
    pub const LONG_PASSWORD: u32 = 0x0000_0001;
    pub const LONG_FLAG: u32 = 0x0000_0004;
    pub const PROTOCOL_41: u32 = 0x0000_0200;
    pub const TRANSACTIONS: u32 = 0x0000_2000;
    pub const SECURE_CONNECTION: u32 = 0x0000_8000;
    pub const PLUGIN_AUTH: u32 = 0x0008_0000;

    pub fn new(bits: u32) -> Self {
        Self(bits)
    }

    pub fn has(self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Capabilities this client presents to the server.
    pub fn client_default() -> Self {
        Self(
            Self::LONG_PASSWORD
                | Self::LONG_FLAG
                | Self::PROTOCOL_41
                | Self::TRANSACTIONS
                | Self::SECURE_CONNECTION
                | Self::PLUGIN_AUTH,
        )
    }
}

/// The server's initial handshake packet.
#[derive(Debug)]
pub struct Handshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub capabilities: CapabilityFlags,
    pub auth_plugin: String,
    auth_seed: Vec<u8>,
}

impl Handshake {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(payload);

        let protocol_version = wire::read_u8(&mut cursor)?;
        if protocol_version != 10 {
            return Err(Error::protocol(format!(
                "unsupported handshake protocol version {protocol_version}"
            )));
        }

        let version_bytes = wire::read_null_terminated(&mut cursor)?;
        let server_version = String::from_utf8_lossy(&version_bytes).to_string();
        let connection_id = wire::read_u32_le(&mut cursor)?;

        let mut auth_seed = wire::read_fixed_bytes(&mut cursor, 8)?;
        wire::skip(&mut cursor, 1)?; // filler

        let cap_low = wire::read_u16_le(&mut cursor)? as u32;
        let _charset = wire::read_u8(&mut cursor)?;
        let _status = wire::read_u16_le(&mut cursor)?;
        let cap_high = wire::read_u16_le(&mut cursor)? as u32;
        let capabilities = CapabilityFlags::new((cap_high << 16) | cap_low);

        let seed_len = wire::read_u8(&mut cursor)? as usize;
        wire::skip(&mut cursor, 10)?; // reserved

        // Second seed half: max(13, len - 8) bytes, NUL-padded.
        let part2_len = seed_len.saturating_sub(8).max(13);
        let mut part2 = wire::read_fixed_bytes(&mut cursor, part2_len)?;
        if let Some(nul) = part2.iter().position(|&b| b == 0) {
            part2.truncate(nul);
        }
        auth_seed.extend_from_slice(&part2);

        let auth_plugin = if capabilities.has(CapabilityFlags::PLUGIN_AUTH) {
            let mut name = Vec::new();
            while let Ok(b) = wire::read_u8(&mut cursor) {
                if b == 0 {
                    break;
                }
                name.push(b);
            }
            String::from_utf8_lossy(&name).to_string()
        } else {
            String::new()
        };

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            capabilities,
            auth_plugin,
            auth_seed,
        })
    }

    pub fn auth_seed(&self) -> &[u8] {
        &self.auth_seed
    }
}

/// One frame read while dumping the binlog.
#[derive(Debug)]
pub enum Frame {
    /// An event: the packet payload with the leading OK byte stripped.
    Event(Vec<u8>),
    /// End of a non-blocking dump.
    Eof,
}

/// An authenticated connection to the primary speaking the client protocol.
pub struct Connection<S = TcpStream> {
    stream: BufReader<S>,
    next_seq: u8,
    server_version: String,
    connection_id: u32,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("server_version", &self.server_version)
            .field("connection_id", &self.connection_id)
            .field("next_seq", &self.next_seq)
            .finish_non_exhaustive()
    }
}

impl Connection<TcpStream> {
    /// Connect and authenticate against the primary described by `master`.
    pub async fn connect(master: &MasterInfo) -> Result<Self> {
        let addr = format!("{}:{}", master.host, master.port);
        info!("connecting to MySQL primary at {addr}");

        let deadline = Duration::from_secs(CONNECT_TIMEOUT_SECS);
        let stream = timeout(deadline, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::timeout(format!("connect to {addr}")))??;
        stream.set_nodelay(true)?;

        let conn = timeout(
            deadline,
            Self::establish(stream, &master.user, master.password.as_deref()),
        )
        .await
        .map_err(|_| Error::timeout("handshake with primary"))??;

        info!(
            "connected to MySQL {} (connection id {})",
            conn.server_version, conn.connection_id
        );
        Ok(conn)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Connection<S> {
    #[cfg(test)]
    pub(crate) fn for_testing(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            next_seq: 0,
            server_version: "test".into(),
            connection_id: 0,
        }
    }

    async fn establish(stream: S, user: &str, password: Option<&str>) -> Result<Self> {
        let mut conn = Self {
            stream: BufReader::new(stream),
            next_seq: 0,
            server_version: String::new(),
            connection_id: 0,
        };

        let greeting = conn.read_packet().await?;
        let handshake = Handshake::parse(&greeting)?;
        debug!(
            server = %handshake.server_version,
            plugin = %handshake.auth_plugin,
            "received server handshake"
        );
        conn.server_version = handshake.server_version.clone();
        conn.connection_id = handshake.connection_id;

        conn.authenticate(user, password, &handshake).await?;
        Ok(conn)
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    /// Read one packet, following continuation packets when the payload hits
    /// the 2^24-1 limit. Validates that sequence numbers advance by one.
    async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            let mut raw = [0u8; PACKET_HEADER_SIZE];
            self.stream.read_exact(&mut raw).await?;
            let header = PacketHeader::parse(&raw);

            if header.sequence_id != self.next_seq {
                return Err(Error::protocol(format!(
                    "sequence gap: expected packet {}, got {}",
                    self.next_seq, header.sequence_id
                )));
            }
            self.next_seq = header.sequence_id.wrapping_add(1);

            let start = payload.len();
            payload.resize(start + header.payload_len, 0);
            self.stream.read_exact(&mut payload[start..]).await?;

            if header.payload_len < MAX_PACKET_PAYLOAD {
                return Ok(payload);
            }
        }
    }

    async fn read_packet_timed(&mut self) -> Result<Vec<u8>> {
        timeout(
            Duration::from_secs(COMMAND_TIMEOUT_SECS),
            self.read_packet(),
        )
        .await
        .map_err(|_| Error::timeout("command response from primary"))?
    }

    async fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        let mut remaining = payload;
        loop {
            let chunk_len = remaining.len().min(MAX_PACKET_PAYLOAD);
            let (chunk, rest) = remaining.split_at(chunk_len);

            let mut packet = Vec::with_capacity(PACKET_HEADER_SIZE + chunk_len);
            packet.extend_from_slice(&PacketHeader::encode(chunk_len, self.next_seq));
            packet.extend_from_slice(chunk);
            self.next_seq = self.next_seq.wrapping_add(1);

            self.stream.get_mut().write_all(&packet).await?;

            remaining = rest;
            // A payload that is an exact multiple of the limit requires an
            // empty terminating packet.
            if remaining.is_empty() && chunk_len < MAX_PACKET_PAYLOAD {
                break;
            }
            if remaining.is_empty() && chunk_len == MAX_PACKET_PAYLOAD {
                let header = PacketHeader::encode(0, self.next_seq);
                self.next_seq = self.next_seq.wrapping_add(1);
                self.stream.get_mut().write_all(&header).await?;
                break;
            }
        }
        self.stream.get_mut().flush().await?;
        Ok(())
    }

    /// Write a command packet; commands restart the sequence at zero.
    async fn write_command(&mut self, payload: &[u8]) -> Result<()> {
        self.next_seq = 0;
        self.write_packet(payload).await
    }

    async fn authenticate(
        &mut self,
        user: &str,
        password: Option<&str>,
        handshake: &Handshake,
    ) -> Result<()> {
        if !handshake.capabilities.has(CapabilityFlags::PROTOCOL_41) {
            return Err(Error::Auth(
                "server does not support protocol 4.1".to_string(),
            ));
        }

        let scramble = match handshake.auth_plugin.as_str() {
            "caching_sha2_password" | "sha256_password" => {
                scramble_sha2(password, handshake.auth_seed())
            }
            "mysql_native_password" | "" => scramble_native(password, handshake.auth_seed()),
            other => {
                warn!("unknown auth plugin {other}, answering with mysql_native_password");
                scramble_native(password, handshake.auth_seed())
            }
        };

        let mut response = BytesMut::with_capacity(128);
        response.put_u32_le(CapabilityFlags::client_default().bits());
        response.put_u32_le(MAX_PACKET_PAYLOAD as u32);
        response.put_u8(UTF8MB4_GENERAL_CI);
        response.put_slice(&[0u8; 23]);
        response.put_slice(user.as_bytes());
        response.put_u8(0);
        response.put_u8(scramble.len() as u8);
        response.put_slice(&scramble);
        let plugin = if handshake.auth_plugin.is_empty() {
            "mysql_native_password"
        } else {
            &handshake.auth_plugin
        };
        response.put_slice(plugin.as_bytes());
        response.put_u8(0);

        self.write_packet(&response).await?;

        let reply = self.read_packet().await?;
        self.finish_auth(reply, &handshake.auth_plugin, handshake.auth_seed(), password)
            .await
    }

    async fn finish_auth(
        &mut self,
        mut reply: Vec<u8>,
        plugin: &str,
        seed: &[u8],
        password: Option<&str>,
    ) -> Result<()> {
        // An auth switch restarts the exchange with a new plugin and seed;
        // everything else resolves in one or two more packets.
        let mut plugin = plugin.to_string();
        let mut seed = seed.to_vec();

        loop {
            match reply.first() {
                Some(0x00) => {
                    debug!("authentication accepted");
                    return Ok(());
                }
                Some(0xFF) => {
                    let (code, message) = parse_err_packet(&reply)?;
                    return Err(Error::Auth(format!("{code}: {message}")));
                }
                Some(0xFE) => {
                    // Auth switch request: plugin name, NUL, new seed.
                    let mut cursor = Cursor::new(&reply[1..]);
                    let name = wire::read_null_terminated(&mut cursor)?;
                    let rest = cursor.position() as usize + 1;
                    plugin = String::from_utf8_lossy(&name).to_string();
                    seed = reply[rest..].to_vec();
                    if seed.last() == Some(&0) {
                        seed.pop();
                    }
                    debug!(plugin = %plugin, "auth switch requested");

                    let scramble = match plugin.as_str() {
                        "mysql_native_password" => scramble_native(password, &seed),
                        "caching_sha2_password" | "sha256_password" => {
                            scramble_sha2(password, &seed)
                        }
                        other => {
                            return Err(Error::Auth(format!(
                                "server requested unsupported auth plugin {other}"
                            )))
                        }
                    };
                    self.write_packet(&scramble).await?;
                    reply = self.read_packet().await?;
                }
                Some(0x01) if plugin == "caching_sha2_password" || plugin == "sha256_password" => {
                    match reply.get(1) {
                        // Fast path: the server had the password cached.
                        Some(0x03) => {
                            reply = self.read_packet().await?;
                        }
                        Some(0x04) => {
                            self.sha2_full_auth(&seed, password).await?;
                            reply = self.read_packet().await?;
                        }
                        other => {
                            return Err(Error::Auth(format!(
                                "unexpected caching_sha2_password status {other:?}"
                            )))
                        }
                    }
                }
                other => {
                    return Err(Error::Auth(format!(
                        "unexpected authentication response byte {other:?}"
                    )))
                }
            }
        }
    }

    /// Full `caching_sha2_password` authentication: fetch the server's RSA
    /// public key and send the nonce-XORed password encrypted under it.
    async fn sha2_full_auth(&mut self, seed: &[u8], password: Option<&str>) -> Result<()> {
        debug!("caching_sha2_password: full authentication required");
        self.write_packet(&[0x02]).await?; // request public key

        let reply = self.read_packet().await?;
        match reply.first() {
            Some(0x01) => {
                let pem = String::from_utf8_lossy(&reply[1..]);
                let key = RsaPublicKey::from_public_key_pem(pem.trim_end_matches('\0'))
                    .map_err(|e| Error::Auth(format!("invalid server RSA key: {e}")))?;

                let mut plaintext = password.unwrap_or("").as_bytes().to_vec();
                plaintext.push(0);
                for (i, byte) in plaintext.iter_mut().enumerate() {
                    *byte ^= seed[i % seed.len()];
                }

                let encrypted = key
                    .encrypt(&mut OsRng, Pkcs1v15Encrypt, &plaintext)
                    .map_err(|e| Error::Auth(format!("RSA encryption failed: {e}")))?;
                self.write_packet(&encrypted).await
            }
            Some(0xFF) => {
                let (code, message) = parse_err_packet(&reply)?;
                Err(Error::Auth(format!(
                    "public key request failed: {code}: {message}"
                )))
            }
            other => Err(Error::Auth(format!(
                "unexpected public key response byte {other:?}"
            ))),
        }
    }

    /// Execute a statement for its side effect. Statements that produce
    /// result sets are not supported on this connection.
    pub async fn query(&mut self, sql: &str) -> Result<()> {
        let mut packet = BytesMut::with_capacity(sql.len() + 1);
        packet.put_u8(COM_QUERY);
        packet.put_slice(sql.as_bytes());
        self.write_command(&packet).await?;

        let reply = self.read_packet_timed().await?;
        match reply.first() {
            Some(0x00) => Ok(()),
            Some(0xFF) => {
                let (code, message) = parse_err_packet(&reply)?;
                Err(Error::Replication { code, message })
            }
            _ => Err(Error::protocol(format!(
                "statement unexpectedly produced a result set: {sql}"
            ))),
        }
    }

    /// `COM_REGISTER_SLAVE`: announce ourselves in `SHOW SLAVE HOSTS`.
    pub async fn register_slave(&mut self, server_id: u32) -> Result<()> {
        let mut packet = BytesMut::with_capacity(18);
        packet.put_u8(COM_REGISTER_SLAVE);
        packet.put_u32_le(server_id);
        packet.put_u8(0); // hostname length
        packet.put_u8(0); // user length
        packet.put_u8(0); // password length
        packet.put_u16_le(0); // port
        packet.put_u32_le(0); // replication rank, unused
        packet.put_u32_le(0); // master id, filled in by the server
        self.write_command(&packet).await?;

        let reply = self.read_packet_timed().await?;
        match reply.first() {
            Some(0x00) => {
                info!("registered as replica with server id {server_id}");
                Ok(())
            }
            Some(0xFF) => {
                let (code, message) = parse_err_packet(&reply)?;
                Err(Error::Replication { code, message })
            }
            other => Err(Error::protocol(format!(
                "unexpected COM_REGISTER_SLAVE response byte {other:?}"
            ))),
        }
    }

    /// `COM_BINLOG_DUMP`: start streaming events from `position`.
    pub async fn binlog_dump(&mut self, server_id: u32, position: &BinlogPosition) -> Result<()> {
        let offset = u32::try_from(position.offset).map_err(|_| {
            Error::config(format!(
                "binlog offset {} exceeds the protocol's 32-bit dump position",
                position.offset
            ))
        })?;

        let mut packet = BytesMut::with_capacity(11 + position.file.len());
        packet.put_u8(COM_BINLOG_DUMP);
        packet.put_u32_le(offset.max(4)); // events start after the magic
        packet.put_u16_le(0); // blocking dump
        packet.put_u32_le(server_id);
        packet.put_slice(position.file.as_bytes());
        self.write_command(&packet).await?;

        info!("binlog dump started from {position}");
        Ok(())
    }

    /// Read the next frame of the dump stream. Blocks until the primary has
    /// something to say; cancel by dropping the connection.
    pub async fn next_frame(&mut self) -> Result<Frame> {
        let packet = self.read_packet().await?;
        match packet.first() {
            Some(0x00) => Ok(Frame::Event(packet[1..].to_vec())),
            Some(0xFE) if packet.len() < 9 => Ok(Frame::Eof),
            Some(0xFF) => {
                let (code, message) = parse_err_packet(&packet)?;
                if code == ER_MASTER_FATAL_ERROR_READING_BINLOG {
                    Err(Error::PositionLost(message))
                } else {
                    Err(Error::Replication { code, message })
                }
            }
            Some(_) => Err(Error::protocol(
                "binlog stream packet without an OK/EOF/ERR marker",
            )),
            None => Err(Error::protocol("empty packet in binlog stream")),
        }
    }
}

/// Parse an ERR packet into `(code, message)`.
fn parse_err_packet(packet: &[u8]) -> Result<(u16, String)> {
    if packet.len() < 3 || packet[0] != 0xFF {
        return Err(Error::protocol("malformed ERR packet"));
    }
    let code = u16::from_le_bytes([packet[1], packet[2]]);
    let mut rest = &packet[3..];
    // Protocol 4.1 inserts '#' plus a five-byte SQL state.
    if rest.first() == Some(&b'#') && rest.len() >= 6 {
        rest = &rest[6..];
    }
    Ok((code, String::from_utf8_lossy(rest).to_string()))
}

/// `mysql_native_password`: `SHA1(pass) XOR SHA1(seed + SHA1(SHA1(pass)))`.
fn scramble_native(password: Option<&str>, seed: &[u8]) -> Vec<u8> {
    let Some(password) = password.filter(|p| !p.is_empty()) else {
        return Vec::new();
    };

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);

    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// `caching_sha2_password`:
/// `SHA256(pass) XOR SHA256(SHA256(SHA256(pass)) + seed)`.
fn scramble_sha2(password: Option<&str>, seed: &[u8]) -> Vec<u8> {
    let Some(password) = password.filter(|p| !p.is_empty()) else {
        return Vec::new();
    };

    let hash1 = Sha256::digest(password.as_bytes());
    let hash2 = Sha256::digest(hash1);

    let mut hasher = Sha256::new();
    hasher.update(hash2);
    hasher.update(seed);
    let hash3 = hasher.finalize();

    hash1.iter().zip(hash3.iter()).map(|(a, b)| a ^ b).collect()
}
