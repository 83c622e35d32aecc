//! Backend SQLite.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE sensors    (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE, macaddr TEXT UNIQUE);
//! CREATE TABLE datatypes  (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE);
//! CREATE TABLE timeseries (time INTEGER, sensorid INTEGER, datatype INTEGER, value REAL,
//!                          PRIMARY KEY (time, sensorid, datatype));
//! CREATE TABLE latest     (sensorid INTEGER, datatype INTEGER, time INTEGER, value REAL,
//!                          received_at INTEGER, PRIMARY KEY (sensorid, datatype));
//! ```
//!
//! Tempos em microssegundos desde a época. `timeseries` só recebe inserts;
//! uma chave repetida (reenvio do coletor) é ignorada.

use crate::store::{LatestRow, PointRow, Registry, StoreError, TimeSeriesStore, newest_per_series};
use aqi_core::config::SensorSeed;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS sensors (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        macaddr TEXT UNIQUE COLLATE NOCASE
    );
    CREATE TABLE IF NOT EXISTS datatypes (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    );
    CREATE TABLE IF NOT EXISTS timeseries (
        time INTEGER NOT NULL,
        sensorid INTEGER NOT NULL REFERENCES sensors(id),
        datatype INTEGER NOT NULL REFERENCES datatypes(id),
        value REAL NOT NULL,
        PRIMARY KEY (time, sensorid, datatype)
    ) WITHOUT ROWID;
    CREATE TABLE IF NOT EXISTS latest (
        sensorid INTEGER NOT NULL REFERENCES sensors(id),
        datatype INTEGER NOT NULL REFERENCES datatypes(id),
        time INTEGER NOT NULL,
        value REAL NOT NULL,
        received_at INTEGER NOT NULL,
        PRIMARY KEY (sensorid, datatype)
    );
";

/// Upsert que nunca regride: um ponto mais antigo que o armazenado é ignorado.
const UPSERT_LATEST: &str = "
    INSERT INTO latest (sensorid, datatype, time, value, received_at)
    VALUES (?1, ?2, ?3, ?4, ?5)
    ON CONFLICT (sensorid, datatype) DO UPDATE SET
        time = excluded.time,
        value = excluded.value,
        received_at = excluded.received_at
    WHERE excluded.time >= latest.time
";

/// Store SQLite.
///
/// A conexão fica atrás de um `Mutex` (Connection não é `Sync`). Uma conexão
/// que falha com erro de interface é descartada e reaberta na próxima
/// operação; a operação que falhou é repetida uma vez.
pub struct SqliteStore {
    /// `None` = banco em memória
    path: Option<String>,
    conn: Mutex<Option<Connection>>,
}

impl SqliteStore {
    /// Abre (ou cria) o banco no caminho dado.
    pub fn new(path: &str) -> Result<Self, StoreError> {
        let store = Self {
            path: Some(path.to_string()),
            conn: Mutex::new(None),
        };
        let conn = store.open()?;
        *store.conn.lock().unwrap_or_else(PoisonError::into_inner) = Some(conn);
        info!("Banco SQLite aberto em {path}");
        Ok(store)
    }

    /// Banco em memória (testes).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            path: None,
            conn: Mutex::new(None),
        };
        let conn = store.open()?;
        *store.conn.lock().unwrap_or_else(PoisonError::into_inner) = Some(conn);
        Ok(store)
    }

    fn open(&self) -> Result<Connection, StoreError> {
        let conn = match &self.path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }

    /// Executa `op` com a conexão atual, reabrindo-a se necessário.
    fn with_conn<T>(
        &self,
        op: impl Fn(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut retried = false;
        loop {
            let mut conn = match guard.take() {
                Some(conn) => conn,
                None => self.open()?,
            };
            match op(&mut conn) {
                Ok(value) => {
                    *guard = Some(conn);
                    return Ok(value);
                }
                Err(e) if is_connection_failure(&e) => {
                    warn!("Conexão SQLite descartada: {e}");
                    drop(conn);
                    if retried {
                        return Err(e);
                    }
                    retried = true;
                }
                Err(e) => {
                    *guard = Some(conn);
                    return Err(e);
                }
            }
        }
    }

    /// Total de pontos armazenados.
    pub fn count_points(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM timeseries", [], |row| row.get(0))?;
            Ok(n as usize)
        })
    }
}

/// Erros que indicam conexão inutilizável (e não um problema do lote).
fn is_connection_failure(e: &StoreError) -> bool {
    let StoreError::Sqlite(e) = e else {
        return false;
    };
    matches!(
        e.sqlite_error_code(),
        Some(
            ErrorCode::CannotOpen
                | ErrorCode::NotADatabase
                | ErrorCode::SystemIoFailure
                | ErrorCode::DatabaseCorrupt
        )
    )
}

fn to_micros(time: DateTime<Utc>) -> i64 {
    time.timestamp_micros()
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(micros).ok_or(StoreError::TimeOutOfRange(micros))
}

impl TimeSeriesStore for SqliteStore {
    fn seed(&self, datatypes: &[String], sensors: &[SensorSeed]) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut insert_type =
                    tx.prepare_cached("INSERT OR IGNORE INTO datatypes (name) VALUES (?1)")?;
                for name in datatypes {
                    insert_type.execute([name])?;
                }

                let mut insert_sensor = tx.prepare_cached(
                    "INSERT OR IGNORE INTO sensors (id, name, macaddr) VALUES (?1, ?2, ?3)",
                )?;
                let mut update_mac =
                    tx.prepare_cached("UPDATE sensors SET macaddr = ?2 WHERE name = ?1")?;
                for sensor in sensors {
                    insert_sensor.execute(params![sensor.id, sensor.name, sensor.macaddr])?;
                    if sensor.macaddr.is_some() {
                        update_mac.execute(params![sensor.name, sensor.macaddr])?;
                    }
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn load_registry(&self) -> Result<Registry, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, name FROM sensors")?;
            let sensors = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<(i64, String)>, _>>()?;

            let mut stmt = conn.prepare("SELECT id, name FROM datatypes")?;
            let datatypes = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<(i64, String)>, _>>()?;

            Ok(Registry::new(sensors, datatypes))
        })
    }

    fn write_chunk(&self, rows: &[PointRow]) -> Result<usize, StoreError> {
        let received_at = to_micros(Utc::now());
        let newest = newest_per_series(rows);
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut inserted = 0;
            {
                let mut insert = tx.prepare_cached(
                    "INSERT OR IGNORE INTO timeseries (time, sensorid, datatype, value)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for row in rows {
                    inserted += insert.execute(params![
                        to_micros(row.time),
                        row.sensor_id,
                        row.datatype,
                        row.value
                    ])?;
                }

                let mut upsert = tx.prepare_cached(UPSERT_LATEST)?;
                for row in &newest {
                    upsert.execute(params![
                        row.sensor_id,
                        row.datatype,
                        to_micros(row.time),
                        row.value,
                        received_at
                    ])?;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
    }

    fn latest(&self, sensor_id: i64) -> Result<Vec<LatestRow>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT d.name, l.time, l.value, l.received_at
                 FROM latest l JOIN datatypes d ON d.id = l.datatype
                 WHERE l.sensorid = ?1
                 ORDER BY d.name",
            )?;
            let raw = stmt
                .query_map([sensor_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            raw.into_iter()
                .map(|(datatype, time, value, received_at)| {
                    Ok(LatestRow {
                        datatype,
                        time: from_micros(time)?,
                        value,
                        received_at: from_micros(received_at)?,
                    })
                })
                .collect()
        })
    }

    fn lookup_mac(&self, macaddr: &str) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            let name = conn
                .query_row(
                    "SELECT name FROM sensors WHERE macaddr = ?1",
                    [macaddr],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(name)
        })
    }
}
