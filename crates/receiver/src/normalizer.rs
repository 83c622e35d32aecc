//! Normalização de lotes: medição → pontos (sensor, tipo de dado, valor).
//!
//! - `pm2.5` presente → deriva `aqi2.5`
//! - campo sem tipo de dado cadastrado → descartado (um aviso por nome por lote)
//! - pontos gravados em chunks, cada um na sua transação
//! - prazo de parede checado antes de cada chunk; chunk em andamento nunca é
//!   abortado

use crate::store::{PointRow, Registry, SensorRef, StoreError, TimeSeriesStore};
use aqi_core::aqi::convert_aqi;
use aqi_core::types::{Measurement, SensorIdentity, batch_span};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Campo de entrada usado para derivar o AQI.
pub const PM25_FIELD: &str = "pm2.5";
/// Tipo de dado derivado.
pub const AQI25_FIELD: &str = "aqi2.5";

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("Sensor desconhecido: {0}")]
    UnknownSensor(SensorIdentity),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Resultado de um `insert_batch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertSummary {
    pub sensor: SensorRef,
    /// Pontos gerados pelo lote
    pub rows: usize,
    /// Pontos efetivamente novos no banco
    pub inserted: usize,
    pub chunks_written: usize,
    /// Chunks descartados por estouro de prazo
    pub chunks_dropped: usize,
    /// Nomes de campo descartados por falta de tipo de dado
    pub unknown_fields: BTreeSet<String>,
}

pub struct Normalizer<S> {
    store: Arc<S>,
    registry: Arc<Registry>,
    chunk_size: usize,
    deadline: Duration,
}

impl<S: TimeSeriesStore> Normalizer<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<Registry>,
        chunk_size: usize,
        deadline: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            chunk_size: chunk_size.max(1),
            deadline,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn insert_batch(
        &self,
        identity: &SensorIdentity,
        records: &[Measurement],
    ) -> Result<InsertSummary, NormalizeError> {
        let started = Instant::now();
        let sensor = self
            .registry
            .resolve(identity)
            .ok_or_else(|| NormalizeError::UnknownSensor(identity.clone()))?;

        let mut unknown_fields = BTreeSet::new();
        let rows = self.to_rows(&sensor, records, &mut unknown_fields);
        for name in &unknown_fields {
            warn!("{}: campo desconhecido '{name}' descartado", sensor.name);
        }

        let mut summary = InsertSummary {
            sensor,
            rows: rows.len(),
            inserted: 0,
            chunks_written: 0,
            chunks_dropped: 0,
            unknown_fields,
        };

        let chunks: Vec<&[PointRow]> = rows.chunks(self.chunk_size).collect();
        for (index, chunk) in chunks.iter().enumerate() {
            if started.elapsed() >= self.deadline {
                summary.chunks_dropped = chunks.len() - index;
                warn!(
                    "{}: prazo de {:.1}s estourado, descartando {} de {} chunks",
                    summary.sensor.name,
                    self.deadline.as_secs_f64(),
                    summary.chunks_dropped,
                    chunks.len()
                );
                break;
            }
            summary.inserted += self.store.write_chunk(chunk)?;
            summary.chunks_written += 1;
        }

        if let Some((first, last)) = batch_span(records) {
            info!(
                "{}: {} registros de {first} a {last} → {} pontos ({} novos) em {:.3}s",
                summary.sensor.name,
                records.len(),
                summary.rows,
                summary.inserted,
                started.elapsed().as_secs_f64()
            );
        }
        Ok(summary)
    }

    fn to_rows(
        &self,
        sensor: &SensorRef,
        records: &[Measurement],
        unknown: &mut BTreeSet<String>,
    ) -> Vec<PointRow> {
        let mut rows = Vec::new();
        for record in records {
            let aqi = record.get(PM25_FIELD).map(convert_aqi);
            let derived: Option<(&str, f64)> = aqi.map(|v| (AQI25_FIELD, v));
            let fields = record
                .fields
                .iter()
                // o AQI derivado substitui um `aqi2.5` vindo no lote
                .filter(|(name, _)| aqi.is_none() || name != AQI25_FIELD)
                .map(|(name, v)| (name.as_str(), *v))
                .chain(derived);

            for (name, value) in fields {
                match self.registry.datatype_id(name) {
                    Some(datatype) => rows.push(PointRow {
                        time: record.time,
                        sensor_id: sensor.id,
                        datatype,
                        value,
                    }),
                    None => {
                        unknown.insert(name.to_string());
                    }
                }
            }
        }
        rows
    }
}
