//! Serviço de ingestão do endpoint `/data`.
//!
//! Portões, nesta ordem:
//! 1. JSON válido e lote não vazio → senão 400
//! 2. Credenciais (salt/auth ou senha legada) → senão 403
//! 3. Timestamps convertíveis → senão 400
//! 4. Sensor conhecido e gravação ok → senão 500
//!
//! Depois de gravar, dispara a notificação (melhor esforço).

use crate::normalizer::{InsertSummary, NormalizeError, Normalizer};
use crate::notify::CommandNotifier;
use crate::store::TimeSeriesStore;
use aqi_core::auth::AuthError;
use aqi_core::protocol::{DataMessage, ProtocolError};
use axum::http::StatusCode;
use tracing::{error, warn};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Payload inválido: {0}")]
    Malformed(#[from] ProtocolError),

    #[error("Autenticação recusada: {0}")]
    Unauthorized(#[from] AuthError),

    #[error("Payload sem sensorname nem sensorid")]
    NoSensor,

    #[error("Falha ao gravar lote: {0}")]
    Normalize(#[from] NormalizeError),
}

impl IngestError {
    pub fn status(&self) -> StatusCode {
        match self {
            IngestError::Malformed(_) => StatusCode::BAD_REQUEST,
            IngestError::Unauthorized(_) => StatusCode::FORBIDDEN,
            IngestError::NoSensor | IngestError::Normalize(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

pub struct IngestService<S> {
    normalizer: Normalizer<S>,
    password: String,
    notifier: Option<CommandNotifier>,
}

impl<S: TimeSeriesStore> IngestService<S> {
    pub fn new(
        normalizer: Normalizer<S>,
        password: impl Into<String>,
        notifier: Option<CommandNotifier>,
    ) -> Self {
        Self {
            normalizer,
            password: password.into(),
            notifier,
        }
    }

    pub fn normalizer(&self) -> &Normalizer<S> {
        &self.normalizer
    }

    /// Valida, autentica e grava um corpo recebido.
    pub fn ingest(&self, body: &[u8]) -> Result<InsertSummary, IngestError> {
        let msg = DataMessage::decode(body)?;

        msg.credentials()
            .ok_or(AuthError::Missing)?
            .verify(&self.password)?;

        let records = msg.measurements()?;
        let identity = msg.identity().ok_or(IngestError::NoSensor)?;

        Ok(self.normalizer.insert_batch(&identity, &records)?)
    }

    /// Trata uma requisição e devolve o status HTTP. Nunca entra em pânico
    /// por causa do conteúdo do lote.
    pub fn handle_data(&self, body: &[u8], peer: &str) -> StatusCode {
        match self.ingest(body) {
            Ok(summary) => {
                if let Some(notifier) = &self.notifier {
                    notifier.notify(&summary.sensor.name);
                }
                StatusCode::OK
            }
            Err(e) => {
                let status = e.status();
                if status.is_server_error() {
                    error!("{peer}: {e}");
                } else {
                    warn!("{peer}: {e}");
                }
                status
            }
        }
    }
}
