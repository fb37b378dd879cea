use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Opaque record key. Redis keys are binary-safe, so the key is kept
/// as bytes and only rendered lossily as UTF-8 for logs.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey(Vec<u8>);

impl RecordKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<&str> for RecordKey {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for RecordKey {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl From<Vec<u8>> for RecordKey {
    fn from(b: Vec<u8>) -> Self {
        Self(b)
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl std::fmt::Debug for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RecordKey({:?})", String::from_utf8_lossy(&self.0))
    }
}

/// Значение поля hash-записи.
///
/// Store хранит всё как байты; `Int` и `Str` существуют, чтобы планы
/// миграции и тесты могли объявлять defaults в естественном виде.
/// Значения, прочитанные из Redis, всегда приходят как `Bytes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
}

impl FieldValue {
    /// Wire representation: integers as decimal ASCII, strings as UTF-8.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            FieldValue::Int(n) => n.to_string().into_bytes(),
            FieldValue::Str(s) => s.as_bytes().to_vec(),
            FieldValue::Bytes(b) => b.clone(),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Int(n)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Str(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Str(s)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(b: Vec<u8>) -> Self {
        FieldValue::Bytes(b)
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Int(n) => write!(f, "{n}"),
            FieldValue::Str(s) => write!(f, "{s:?}"),
            FieldValue::Bytes(b) => write!(f, "{:?}", String::from_utf8_lossy(b)),
        }
    }
}

/// Field set of one record. Unordered.
pub type FieldMap = HashMap<String, FieldValue>;

/// One page of a cursor scan. `cursor == 0` means the iteration is complete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub cursor: u64,
    pub keys: Vec<RecordKey>,
}

/// Параметры подключения к store. Приходят уже провалидированными
/// (CLI/config — забота вызывающего).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    /// Logical database index (Redis `SELECT`).
    pub database: u32,
    #[serde(default)]
    pub password: Option<String>,
}

impl ConnectionParams {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 6379,
            database: 1,
            password: None,
        }
    }
}

// Password never lands in logs.
impl std::fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}
