//! `HashStore` поверх Redis: RESP2 по TCP, небольшой пул соединений.
//!
//! Поддерживаются ровно те команды, которые нужны миграции:
//! `SCAN MATCH COUNT`, `HGETALL`, `HDEL`, `HSETNX`, `PING`.

pub mod config;
pub mod connection;
pub mod resp;

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, MutexGuard};

use kv_api::{
    ConnectionParams, ErrorKind, FieldMap, FieldValue, HashStore, RecordKey, ScanPage, StoreError, StoreFuture,
};

pub use config::{read_requirepass, resolve_password, RedisOptions, DEFAULT_REDIS_CONF};
pub use connection::RedisConnection;
pub use resp::{Reply, RespFraming};

type Slot = Mutex<Option<RedisConnection>>;

pub struct RedisStore {
    params: ConnectionParams,
    options: RedisOptions,
    pool: Vec<Slot>,
    next: AtomicUsize,
}

impl RedisStore {
    /// Open the first connection eagerly so bad addresses and passwords
    /// surface before any work starts. The rest connect on first use.
    pub async fn connect(params: ConnectionParams, options: RedisOptions) -> Result<Self, StoreError> {
        let first = RedisConnection::connect(&params, &options).await?;
        let size = options.pool_size.max(1);
        let mut pool = Vec::with_capacity(size);
        pool.push(Mutex::new(Some(first)));
        pool.extend((1..size).map(|_| Mutex::new(None)));

        tracing::info!(
            addr = %params.addr(),
            database = params.database,
            pool = size,
            "connected to redis"
        );
        Ok(Self {
            params,
            options,
            pool,
            next: AtomicUsize::new(0),
        })
    }

    /// Free slot if there is one, otherwise wait on the round-robin pick.
    async fn acquire(&self) -> MutexGuard<'_, Option<RedisConnection>> {
        for slot in &self.pool {
            if let Ok(guard) = slot.try_lock() {
                return guard;
            }
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        self.pool[idx].lock().await
    }

    /// The connection leaves its slot for the duration of the command and
    /// goes back only once a reply has been read. A future dropped mid-command
    /// takes the connection with it, so no unread reply stays in the pool.
    async fn execute(&self, args: &[&[u8]]) -> Result<Reply, StoreError> {
        let mut slot = self.acquire().await;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => RedisConnection::connect(&self.params, &self.options).await?,
        };

        let result = conn.command(args).await;
        match &result {
            // Stream position is unknown after these; reconnect next time.
            Err(e) if matches!(e.kind(), ErrorKind::Connection | ErrorKind::Protocol) => {
                tracing::debug!(error = ?e, "dropping redis connection");
            }
            _ => *slot = Some(conn),
        }
        result
    }
}

impl HashStore for RedisStore {
    fn scan<'a>(&'a self, cursor: u64, pattern: &'a str, count: usize) -> StoreFuture<'a, ScanPage> {
        Box::pin(async move {
            let cursor_arg = cursor.to_string();
            let count_arg = count.max(1).to_string();
            let reply = self
                .execute(&[
                    b"SCAN",
                    cursor_arg.as_bytes(),
                    b"MATCH",
                    pattern.as_bytes(),
                    b"COUNT",
                    count_arg.as_bytes(),
                ])
                .await?;
            parse_scan(reply)
        })
    }

    fn hgetall<'a>(&'a self, key: &'a RecordKey) -> StoreFuture<'a, FieldMap> {
        Box::pin(async move {
            let reply = self.execute(&[b"HGETALL", key.as_bytes()]).await?;
            parse_field_map(reply)
        })
    }

    fn hdel<'a>(&'a self, key: &'a RecordKey, fields: &'a [String]) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            if fields.is_empty() {
                return Ok(0);
            }
            let mut args: Vec<&[u8]> = Vec::with_capacity(fields.len() + 2);
            args.push(b"HDEL");
            args.push(key.as_bytes());
            args.extend(fields.iter().map(|f| f.as_bytes()));
            let removed = self.execute(&args).await?.into_integer()?;
            Ok(removed.max(0) as u64)
        })
    }

    fn hsetnx<'a>(&'a self, key: &'a RecordKey, field: &'a str, value: &'a FieldValue) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let value = value.to_bytes();
            let written = self
                .execute(&[b"HSETNX", key.as_bytes(), field.as_bytes(), &value])
                .await?
                .into_integer()?;
            Ok(written == 1)
        })
    }

    fn ping(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.execute(&[b"PING"]).await?.expect_ok() })
    }
}

fn parse_scan(reply: Reply) -> Result<ScanPage, StoreError> {
    let mut parts = reply.into_array()?.into_iter();
    let (Some(cursor), Some(keys), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(StoreError::protocol("SCAN reply must have exactly two elements"));
    };
    let cursor = std::str::from_utf8(&cursor.into_bytes()?)?.parse::<u64>()?;
    let keys = keys
        .into_array()?
        .into_iter()
        .map(|k| k.into_bytes().map(RecordKey::new))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ScanPage { cursor, keys })
}

fn parse_field_map(reply: Reply) -> Result<FieldMap, StoreError> {
    let items = reply.into_array()?;
    if items.len() % 2 != 0 {
        return Err(StoreError::protocol("HGETALL reply has odd number of elements"));
    }
    let mut map = FieldMap::with_capacity(items.len() / 2);
    let mut it = items.into_iter();
    while let (Some(field), Some(value)) = (it.next(), it.next()) {
        let field = String::from_utf8_lossy(&field.into_bytes()?).into_owned();
        map.insert(field, FieldValue::Bytes(value.into_bytes()?));
    }
    Ok(map)
}
