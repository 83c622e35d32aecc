//! Abstração do armazenamento de séries temporais.
//!
//! O [`Registry`] (nome → id de sensores e tipos de dado) é carregado uma vez
//! na inicialização e compartilhado somente leitura.

use aqi_core::config::SensorSeed;
use aqi_core::types::SensorIdentity;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Erros do backend de armazenamento (sempre HTTP 500).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Erro SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Timestamp fora do intervalo: {0}µs")]
    TimeOutOfRange(i64),
}

/// Sensor resolvido no registro.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorRef {
    pub id: i64,
    pub name: String,
}

/// Tabelas nome → id carregadas do banco.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    sensors: HashMap<String, i64>,
    sensor_names: HashMap<i64, String>,
    datatypes: HashMap<String, i64>,
}

impl Registry {
    pub fn new(
        sensors: impl IntoIterator<Item = (i64, String)>,
        datatypes: impl IntoIterator<Item = (i64, String)>,
    ) -> Self {
        let mut registry = Registry::default();
        for (id, name) in sensors {
            registry.sensors.insert(name.clone(), id);
            registry.sensor_names.insert(id, name);
        }
        registry.datatypes = datatypes.into_iter().map(|(id, name)| (name, id)).collect();
        registry
    }

    /// Resolve nome ou id para um sensor cadastrado.
    pub fn resolve(&self, identity: &SensorIdentity) -> Option<SensorRef> {
        match identity {
            SensorIdentity::Name(name) => self.sensors.get(name).map(|&id| SensorRef {
                id,
                name: name.clone(),
            }),
            SensorIdentity::Id(id) => self.sensor_names.get(id).map(|name| SensorRef {
                id: *id,
                name: name.clone(),
            }),
        }
    }

    pub fn sensor_by_name(&self, name: &str) -> Option<SensorRef> {
        self.resolve(&SensorIdentity::Name(name.to_string()))
    }

    pub fn datatype_id(&self, name: &str) -> Option<i64> {
        self.datatypes.get(name).copied()
    }

    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    pub fn datatype_count(&self) -> usize {
        self.datatypes.len()
    }
}

/// Um ponto da série temporal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointRow {
    pub time: DateTime<Utc>,
    pub sensor_id: i64,
    pub datatype: i64,
    pub value: f64,
}

/// Linha da projeção "último valor" de um sensor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestRow {
    pub datatype: String,
    pub time: DateTime<Utc>,
    pub value: f64,
    pub received_at: DateTime<Utc>,
}

/// Backend de armazenamento.
///
/// Implementações precisam ser `Send + Sync`: cada requisição chama o store
/// a partir do pool de threads bloqueantes.
pub trait TimeSeriesStore: Send + Sync {
    /// Cadastra tipos de dado e sensores que ainda não existem.
    fn seed(&self, datatypes: &[String], sensors: &[SensorSeed]) -> Result<(), StoreError>;

    /// Lê as tabelas nome → id.
    fn load_registry(&self) -> Result<Registry, StoreError>;

    /// Grava um chunk numa única transação e atualiza a projeção "último
    /// valor". Retorna quantas linhas eram novas.
    fn write_chunk(&self, rows: &[PointRow]) -> Result<usize, StoreError>;

    /// Projeção "último valor" de um sensor, ordenada por tipo de dado.
    fn latest(&self, sensor_id: i64) -> Result<Vec<LatestRow>, StoreError>;

    /// Nome do sensor registrado para um MAC.
    fn lookup_mac(&self, macaddr: &str) -> Result<Option<String>, StoreError>;
}

/// Para cada (sensor, tipo de dado) do chunk, o ponto de maior timestamp.
/// Empate: o último no chunk.
pub fn newest_per_series(rows: &[PointRow]) -> Vec<PointRow> {
    let mut newest: HashMap<(i64, i64), PointRow> = HashMap::new();
    for row in rows {
        newest
            .entry((row.sensor_id, row.datatype))
            .and_modify(|current| {
                if row.time >= current.time {
                    *current = *row;
                }
            })
            .or_insert(*row);
    }
    let mut rows: Vec<PointRow> = newest.into_values().collect();
    rows.sort_by_key(|r| (r.sensor_id, r.datatype));
    rows
}
