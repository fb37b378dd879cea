use kv_api::StoreError;

/// RESP2 reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    /// `None` — null bulk string (`$-1`).
    Bulk(Option<Vec<u8>>),
    /// `None` — null array (`*-1`).
    Array(Option<Vec<Reply>>),
}

impl Reply {
    pub fn into_integer(self) -> Result<i64, StoreError> {
        match self {
            Reply::Integer(n) => Ok(n),
            other => Err(unexpected("integer", &other)),
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>, StoreError> {
        match self {
            Reply::Bulk(Some(b)) => Ok(b),
            Reply::Simple(s) => Ok(s.into_bytes()),
            other => Err(unexpected("bulk string", &other)),
        }
    }

    /// Array elements; a null array is treated as empty.
    pub fn into_array(self) -> Result<Vec<Reply>, StoreError> {
        match self {
            Reply::Array(Some(items)) => Ok(items),
            Reply::Array(None) => Ok(Vec::new()),
            other => Err(unexpected("array", &other)),
        }
    }

    pub fn expect_ok(self) -> Result<(), StoreError> {
        match self {
            Reply::Simple(ref s) if s == "OK" || s == "PONG" => Ok(()),
            other => Err(unexpected("+OK", &other)),
        }
    }

    /// Append the wire form of this reply to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Reply::Simple(s) => {
                buf.push(b'+');
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Reply::Error(s) => {
                buf.push(b'-');
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Reply::Integer(n) => {
                buf.extend_from_slice(format!(":{n}\r\n").as_bytes());
            }
            Reply::Bulk(None) => buf.extend_from_slice(b"$-1\r\n"),
            Reply::Bulk(Some(b)) => {
                buf.extend_from_slice(format!("${}\r\n", b.len()).as_bytes());
                buf.extend_from_slice(b);
                buf.extend_from_slice(b"\r\n");
            }
            Reply::Array(None) => buf.extend_from_slice(b"*-1\r\n"),
            Reply::Array(Some(items)) => {
                buf.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.encode(buf);
                }
            }
        }
    }
}

fn unexpected(wanted: &str, got: &Reply) -> StoreError {
    StoreError::protocol(format!("expected {wanted}, got {got:?}"))
}

/// Map a `-ERR ...` reply to a store error of the right kind.
pub fn classify_error(message: &str) -> StoreError {
    let code = message.split_whitespace().next().unwrap_or("");
    match code {
        "WRONGTYPE" => StoreError::wrong_type(message),
        "NOAUTH" | "WRONGPASS" => StoreError::auth(message),
        "ERR" if message.contains("AUTH") || message.contains("password") => StoreError::auth(message),
        "LOADING" | "BUSY" | "MASTERDOWN" => StoreError::connection(message),
        _ => StoreError::logic(message),
    }
}

// ═══════════════════════════════════════════════════════════════
//  RespFraming
// ═══════════════════════════════════════════════════════════════

const MAX_DEPTH: usize = 8;

/// RESP2 framing. Stateless: the read buffer lives with the caller, so one
/// instance serves every connection of a pool.
#[derive(Debug, Clone, Copy)]
pub struct RespFraming {
    max_bulk: usize,
}

impl RespFraming {
    pub fn new(max_bulk: usize) -> Self {
        Self { max_bulk }
    }

    /// Extract one reply from the front of `buf`.
    /// Returns `(reply, bytes_consumed)` or `None` if the reply is incomplete.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Reply, usize)>, StoreError> {
        self.decode_at(buf, 0, 0)
    }

    /// Encode a command as an array of bulk strings.
    pub fn encode(&self, args: &[&[u8]], buf: &mut Vec<u8>) {
        buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
        for arg in args {
            buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
            buf.extend_from_slice(arg);
            buf.extend_from_slice(b"\r\n");
        }
    }

    fn decode_at(&self, buf: &[u8], pos: usize, depth: usize) -> Result<Option<(Reply, usize)>, StoreError> {
        if depth > MAX_DEPTH {
            return Err(StoreError::protocol("reply nested too deep"));
        }
        let Some((line, next)) = read_line(buf, pos) else {
            return Ok(None);
        };
        let Some((&tag, body)) = line.split_first() else {
            return Err(StoreError::protocol("empty reply line"));
        };

        match tag {
            b'+' => Ok(Some((Reply::Simple(utf8(body)?), next))),
            b'-' => Ok(Some((Reply::Error(utf8(body)?), next))),
            b':' => Ok(Some((Reply::Integer(parse_int(body)?), next))),
            b'$' => {
                let len = parse_int(body)?;
                if len < 0 {
                    return Ok(Some((Reply::Bulk(None), next)));
                }
                let len = len as usize;
                if self.max_bulk > 0 && len > self.max_bulk {
                    return Err(StoreError::protocol(format!(
                        "bulk string too large: {len} bytes (max {})",
                        self.max_bulk
                    )));
                }
                let end = next + len;
                if buf.len() < end + 2 {
                    return Ok(None);
                }
                if &buf[end..end + 2] != b"\r\n" {
                    return Err(StoreError::protocol("bulk string not terminated by CRLF"));
                }
                Ok(Some((Reply::Bulk(Some(buf[next..end].to_vec())), end + 2)))
            }
            b'*' => {
                let len = parse_int(body)?;
                if len < 0 {
                    return Ok(Some((Reply::Array(None), next)));
                }
                let mut items = Vec::with_capacity((len as usize).min(1024));
                let mut cursor = next;
                for _ in 0..len {
                    match self.decode_at(buf, cursor, depth + 1)? {
                        Some((item, after)) => {
                            items.push(item);
                            cursor = after;
                        }
                        None => return Ok(None),
                    }
                }
                Ok(Some((Reply::Array(Some(items)), cursor)))
            }
            other => Err(StoreError::protocol(format!("unknown reply type byte 0x{other:02x}"))),
        }
    }
}

impl Default for RespFraming {
    fn default() -> Self {
        // Redis' own proto-max-bulk-len.
        Self::new(512 * 1024 * 1024)
    }
}

/// Line starting at `pos` without its CRLF, plus the index after CRLF.
fn read_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(pos..)?;
    let idx = rest.windows(2).position(|w| w == b"\r\n")?;
    Some((&rest[..idx], pos + idx + 2))
}

fn utf8(bytes: &[u8]) -> Result<String, StoreError> {
    Ok(std::str::from_utf8(bytes)?.to_string())
}

fn parse_int(bytes: &[u8]) -> Result<i64, StoreError> {
    Ok(std::str::from_utf8(bytes)?.parse::<i64>()?)
}
