//! Minimal command channel subscriber

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::{BufMut, BytesMut};
use gateway_codec::{
    encode_command, OperationalModes, PayloadFramer, ResponseFrame, ServerCommand, ServerResponse,
    TextEncoding,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// How long a test waits for any single response
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Subscribe flag: remotely synchronized
pub const SYNCHRONIZED: u8 = 0x01;
/// Subscribe flag: compact measurement format
pub const COMPACT: u8 = 0x02;

pub struct TestSubscriber {
    stream: TcpStream,
    framer: PayloadFramer,
    encoding: TextEncoding,
}

impl TestSubscriber {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to publisher at {addr}"))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            framer: PayloadFramer::default(),
            encoding: TextEncoding::default(),
        })
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    /// Sends `[command][body]` inside one framed payload.
    pub async fn send(&mut self, command: ServerCommand, body: &[u8]) -> Result<()> {
        let framed = self.framer.frame(&encode_command(command, body));
        self.stream.write_all(&framed).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Writes bytes straight to the socket, bypassing framing.
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Sends a raw command byte, for codes the codec has no name for.
    pub async fn send_raw(&mut self, code: u8, body: &[u8]) -> Result<()> {
        self.send(ServerCommand::from_byte(code), body).await
    }

    /// Defines operational modes; later text is decoded with their encoding.
    pub async fn define_modes(&mut self, modes: OperationalModes) -> Result<()> {
        self.send(ServerCommand::DefineOperationalModes, &modes.bits().to_be_bytes())
            .await?;
        self.encoding = modes.encoding();
        Ok(())
    }

    pub async fn subscribe(&mut self, flags: u8, connection_string: &str) -> Result<()> {
        let text = self.encoding.encode(connection_string);
        let mut body = BytesMut::with_capacity(5 + text.len());
        body.put_u8(flags);
        body.put_i32(text.len() as i32);
        body.put_slice(&text);
        self.send(ServerCommand::Subscribe, &body).await
    }

    pub async fn authenticate(&mut self, token: &[u8]) -> Result<()> {
        let mut body = BytesMut::with_capacity(4 + token.len());
        body.put_i32(token.len() as i32);
        body.put_slice(token);
        self.send(ServerCommand::Authenticate, &body).await
    }

    /// Reads the next response packet.
    pub async fn next_response(&mut self) -> Result<ResponseFrame> {
        tokio::time::timeout(RESPONSE_TIMEOUT, self.read_response())
            .await
            .context("Timed out waiting for a response")?
    }

    /// Reads responses until one of `response` arrives, skipping everything else.
    pub async fn expect(&mut self, response: ServerResponse) -> Result<ResponseFrame> {
        loop {
            let frame = self.next_response().await?;
            if frame.response == response {
                return Ok(frame);
            }
        }
    }

    /// Next Succeeded or Failed status for `command`, with its decoded message.
    pub async fn expect_status(&mut self, command: ServerCommand) -> Result<(ServerResponse, String)> {
        loop {
            let frame = self.next_response().await?;
            let is_status = matches!(frame.response, ServerResponse::Succeeded | ServerResponse::Failed);
            if is_status && frame.in_response_to == command {
                let text = self.text(&frame)?;
                return Ok((frame.response, text));
            }
        }
    }

    pub fn text(&self, frame: &ResponseFrame) -> Result<String> {
        Ok(self.encoding.decode(&frame.payload)?)
    }

    /// True when the publisher closes the connection before `wait` elapses.
    pub async fn closed_within(&mut self, wait: Duration) -> bool {
        let mut scratch = [0u8; 256];
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, self.stream.read(&mut scratch)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }

    async fn read_response(&mut self) -> Result<ResponseFrame> {
        let mut header = vec![0u8; self.framer.header_length()];
        self.stream.read_exact(&mut header).await?;
        let Some(length) = self.framer.extract_length(&header) else {
            bail!("Response did not start with the payload marker: {header:02X?}");
        };
        let mut payload = vec![0u8; length as usize];
        self.stream.read_exact(&mut payload).await?;
        Ok(ResponseFrame::decode(&payload)?)
    }
}
