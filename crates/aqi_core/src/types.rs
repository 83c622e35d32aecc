//! Tipos de dados do pipeline de medições.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ──────────────────────────────────────────────
// Identidade do sensor
// ──────────────────────────────────────────────

/// Identidade do sensor que gerou um lote.
///
/// O nome é resolvido para id no servidor; o id numérico existe para
/// clientes antigos.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorIdentity {
    Id(i64),
    Name(String),
}

impl fmt::Display for SensorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorIdentity::Id(id) => write!(f, "sensor id {id}"),
            SensorIdentity::Name(name) => write!(f, "sensor {name}"),
        }
    }
}

// ──────────────────────────────────────────────
// Medição
// ──────────────────────────────────────────────

/// Uma leitura: campos nomeados + instante de captura.
///
/// `time` é atribuído quando o frame é decodificado, não quando o lote é
/// enviado.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub time: DateTime<Utc>,
    /// Pares `(campo, valor)` na ordem em que foram lidos
    pub fields: Vec<(String, f64)>,
}

impl Measurement {
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            time,
            fields: Vec::new(),
        }
    }

    /// Medição com timestamp do relógio de parede atual.
    pub fn now() -> Self {
        Self::new(Utc::now())
    }

    pub fn with_field(mut self, name: impl Into<String>, value: f64) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: f64) {
        self.fields.push((name.into(), value));
    }

    /// Primeiro valor com esse nome.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Converte um instante para segundos epoch (com fração de microssegundos).
pub fn to_epoch_seconds(time: DateTime<Utc>) -> f64 {
    time.timestamp_micros() as f64 / 1_000_000.0
}

/// Converte segundos epoch de volta para instante. `None` se não for finito
/// ou estiver fora do intervalo representável.
pub fn from_epoch_seconds(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let micros = (secs * 1_000_000.0).round();
    if micros.abs() >= i64::MAX as f64 {
        return None;
    }
    DateTime::from_timestamp_micros(micros as i64)
}

/// Intervalo `(primeiro, último)` de um lote, para log.
pub fn batch_span(batch: &[Measurement]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    Some((batch.first()?.time, batch.last()?.time))
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
