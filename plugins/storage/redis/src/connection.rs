use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use kv_api::{ConnectionParams, StoreError};

use crate::config::RedisOptions;
use crate::resp::{classify_error, Reply, RespFraming};

/// Одно TCP-соединение с сервером: запрос → ответ, без pipelining.
///
/// После любой connection-ошибки (IO, timeout, обрыв) состояние потока
/// не определено, соединение должно быть выброшено.
pub struct RedisConnection {
    stream: TcpStream,
    framing: RespFraming,
    buf: Vec<u8>,
    command_timeout: Duration,
}

impl RedisConnection {
    /// Connect, then `AUTH` (if a password is set) and `SELECT` the database.
    pub async fn connect(params: &ConnectionParams, options: &RedisOptions) -> Result<Self, StoreError> {
        let addr = params.addr();
        let stream = tokio::time::timeout(options.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| StoreError::connection(format!("connect to {addr}: timed out")))?
            .map_err(|e| StoreError::connection(format!("connect to {addr}: {e}")))?;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream,
            framing: RespFraming::new(options.max_bulk),
            buf: Vec::with_capacity(4096),
            command_timeout: options.connect_timeout,
        };

        if let Some(password) = &params.password {
            conn.command(&[b"AUTH", password.as_bytes()])
                .await
                .map_err(|e| e.with_context("AUTH"))?
                .expect_ok()?;
        }
        if params.database != 0 {
            let db = params.database.to_string();
            conn.command(&[b"SELECT", db.as_bytes()])
                .await
                .map_err(|e| e.with_context(format!("SELECT {db}")))?
                .expect_ok()?;
        }

        conn.command_timeout = options.command_timeout;
        tracing::debug!(%addr, database = params.database, "redis connection established");
        Ok(conn)
    }

    /// Send one command and wait for its reply. Error replies come back as
    /// `Err` with the kind derived from the error code.
    pub async fn command(&mut self, args: &[&[u8]]) -> Result<Reply, StoreError> {
        let timeout = self.command_timeout;
        let reply = tokio::time::timeout(timeout, self.round_trip(args))
            .await
            .map_err(|_| StoreError::connection(format!("command timed out after {timeout:?}")))??;
        match reply {
            Reply::Error(message) => Err(classify_error(&message)),
            other => Ok(other),
        }
    }

    async fn round_trip(&mut self, args: &[&[u8]]) -> Result<Reply, StoreError> {
        let mut out = Vec::new();
        self.framing.encode(args, &mut out);
        self.stream.write_all(&out).await?;

        let mut chunk = [0u8; 8192];
        loop {
            if let Some((reply, used)) = self.framing.decode(&self.buf)? {
                self.buf.drain(..used);
                return Ok(reply);
            }
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(StoreError::connection("connection closed by server"));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}
